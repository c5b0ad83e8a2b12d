//! Offer and redemption records as the core sees them.
//!
//! These are read and written through the backing store; the core never
//! caches them between atomic units.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Identity of a limited-quantity offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OfferId(uuid::Uuid);

impl OfferId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &uuid::Uuid {
        &self.0
    }

    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        Ok(Self(uuid::Uuid::parse_str(s)?))
    }
}

impl Default for OfferId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for OfferId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of whoever is redeeming.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequesterId(uuid::Uuid);

impl RequesterId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        Ok(Self(uuid::Uuid::parse_str(s)?))
    }
}

impl Default for RequesterId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RequesterId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OfferCategory {
    Restaurants,
    ThingsToDo,
    BeautyAndSpa,
    #[default]
    Goods,
    Travel,
    HealthAndFitness,
}

/// A limited-quantity offer.
///
/// `remaining_quantity` is unsigned and only ever decremented under the
/// offer's row lock. `active` only moves from `true` to `false`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Offer {
    pub id: OfferId,
    pub title: String,
    pub category: OfferCategory,
    pub price: f64,
    pub remaining_quantity: u32,
    pub active: bool,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
}

impl Offer {
    /// Create an active offer with a fresh id.
    pub fn new(
        title: impl Into<String>,
        quantity: u32,
        start_date: NaiveDate,
        end_date: NaiveDate,
    ) -> Self {
        Self {
            id: OfferId::new(),
            title: title.into(),
            category: OfferCategory::default(),
            price: 0.0,
            remaining_quantity: quantity,
            active: true,
            start_date,
            end_date,
        }
    }

    pub fn with_category(mut self, category: OfferCategory) -> Self {
        self.category = category;
        self
    }

    pub fn with_price(mut self, price: f64) -> Self {
        self.price = price;
        self
    }

    /// Whether the offer has passed its end date as of `as_of`.
    pub fn is_expired(&self, as_of: NaiveDate) -> bool {
        self.end_date < as_of
    }

    /// Whether one more unit can be redeemed right now.
    pub fn is_redeemable(&self) -> bool {
        self.active && self.remaining_quantity > 0
    }
}

/// Proof that a requester redeemed an offer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedemptionRecord {
    pub requester_id: RequesterId,
    pub offer_id: OfferId,
    pub redeemed_at: DateTime<Utc>,
    pub active: bool,
}

impl RedemptionRecord {
    pub fn new(requester_id: RequesterId, offer_id: OfferId) -> Self {
        Self {
            requester_id,
            offer_id,
            redeemed_at: Utc::now(),
            active: true,
        }
    }
}
