//! stockroom: bounded connection pool and atomic offer redemption.

pub mod config;
pub mod error;
pub mod offer;
pub mod pool;
pub mod redemption;
pub mod status;
pub mod store;
pub mod sweep;

pub use config::{ConfigError, Credentials, PoolConfig};
pub use error::{PoolError, StoreError};
pub use offer::{Offer, OfferCategory, OfferId, RedemptionRecord, RequesterId};
pub use pool::{ConnectionPool, HandleId, Lease};
pub use redemption::{RedeemError, RedeemOutcome, RedemptionCoordinator};
pub use status::PoolStatus;
pub use store::memory::{MemoryConnector, MemoryStore, MemoryStoreOptions};
pub use store::{Connection, Connector};
pub use sweep::{ExpirationSweeper, SweepError};
