//! Pool configuration.
//!
//! Sources, later ones winning: built-in defaults, an optional JSON file,
//! then `STOCKROOM_*` environment variables.

use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const ENV_CAPACITY: &str = "STOCKROOM_POOL_CAPACITY";
pub const ENV_CONNECT_TARGET: &str = "STOCKROOM_CONNECT_TARGET";
pub const ENV_CREDENTIALS: &str = "STOCKROOM_CREDENTIALS";
pub const ENV_ACQUIRE_TIMEOUT_MS: &str = "STOCKROOM_ACQUIRE_TIMEOUT_MS";
pub const ENV_SHUTDOWN_GRACE_MS: &str = "STOCKROOM_SHUTDOWN_GRACE_MS";

const DEFAULT_CAPACITY: usize = 10;
const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 5_000;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid value for {var}: {value:?}")]
    InvalidEnv { var: &'static str, value: String },
}

/// Opaque secret handed to the connector. Never printed.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Credentials(String);

impl Credentials {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Credentials(***)")
    }
}

/// Construction parameters for [`ConnectionPool`](crate::pool::ConnectionPool).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PoolConfig {
    /// Number of handles the pool owns. Zero is rejected at parse time.
    pub capacity: NonZeroUsize,
    /// Opaque address of the backing store.
    pub connect_target: String,
    pub credentials: Credentials,
    /// How long `acquire()` waits for a free handle. `None` waits forever.
    pub acquire_timeout_ms: Option<u64>,
    /// How long `shutdown()` waits for leased handles before revoking them.
    pub shutdown_grace_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            capacity: NonZeroUsize::new(DEFAULT_CAPACITY).unwrap_or(NonZeroUsize::MIN),
            connect_target: "memory://stockroom".to_string(),
            credentials: Credentials::default(),
            acquire_timeout_ms: None,
            shutdown_grace_ms: DEFAULT_SHUTDOWN_GRACE_MS,
        }
    }
}

impl PoolConfig {
    pub fn with_capacity(mut self, capacity: NonZeroUsize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace_ms = u64::try_from(grace.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn capacity(&self) -> usize {
        self.capacity.get()
    }

    pub fn acquire_timeout(&self) -> Option<Duration> {
        self.acquire_timeout_ms.map(Duration::from_millis)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// Load from an optional JSON file, then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_json_file(path)?,
            None => Self::default(),
        };
        config.apply_overrides(|var| std::env::var(var).ok())?;
        Ok(config)
    }

    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply `STOCKROOM_*` overrides read through `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup(ENV_CAPACITY) {
            self.capacity = value
                .trim()
                .parse::<NonZeroUsize>()
                .map_err(|_| ConfigError::InvalidEnv {
                    var: ENV_CAPACITY,
                    value,
                })?;
        }
        if let Some(value) = lookup(ENV_CONNECT_TARGET) {
            self.connect_target = value;
        }
        if let Some(value) = lookup(ENV_CREDENTIALS) {
            self.credentials = Credentials::new(value);
        }
        if let Some(value) = lookup(ENV_ACQUIRE_TIMEOUT_MS) {
            let ms = parse_millis(ENV_ACQUIRE_TIMEOUT_MS, value)?;
            // 0 disables the timeout
            self.acquire_timeout_ms = (ms > 0).then_some(ms);
        }
        if let Some(value) = lookup(ENV_SHUTDOWN_GRACE_MS) {
            self.shutdown_grace_ms = parse_millis(ENV_SHUTDOWN_GRACE_MS, value)?;
        }
        Ok(())
    }
}

fn parse_millis(var: &'static str, value: String) -> Result<u64, ConfigError> {
    value
        .trim()
        .parse::<u64>()
        .map_err(|_| ConfigError::InvalidEnv { var, value })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |var| map.get(var).cloned()
    }

    #[test]
    fn defaults_are_ten_handles_without_timeout() {
        let config = PoolConfig::default();
        assert_eq!(config.capacity(), 10);
        assert_eq!(config.acquire_timeout(), None);
        assert_eq!(config.shutdown_grace(), Duration::from_secs(5));
    }

    #[test]
    fn json_file_fills_missing_fields_with_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"capacity": 3, "connect_target": "memory://test", "acquire_timeout_ms": 250}}"#
        )
        .unwrap();

        let config = PoolConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.capacity(), 3);
        assert_eq!(config.connect_target, "memory://test");
        assert_eq!(config.acquire_timeout(), Some(Duration::from_millis(250)));
        assert_eq!(config.shutdown_grace_ms, 5_000);
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"capacity": 0}}"#).unwrap();

        let err = PoolConfig::from_json_file(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn missing_file_reports_path() {
        let err = PoolConfig::from_json_file(Path::new("/nonexistent/stockroom.json")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/stockroom.json"));
    }

    #[test]
    fn env_overrides_win_over_file_values() {
        let mut config = PoolConfig::default();
        config
            .apply_overrides(lookup_from(&[
                (ENV_CAPACITY, "4"),
                (ENV_CONNECT_TARGET, "memory://override"),
                (ENV_CREDENTIALS, "hunter2"),
                (ENV_ACQUIRE_TIMEOUT_MS, "0"),
                (ENV_SHUTDOWN_GRACE_MS, "100"),
            ]))
            .unwrap();

        assert_eq!(config.capacity(), 4);
        assert_eq!(config.connect_target, "memory://override");
        assert_eq!(config.credentials.expose(), "hunter2");
        assert_eq!(config.acquire_timeout(), None);
        assert_eq!(config.shutdown_grace(), Duration::from_millis(100));
    }

    #[test]
    fn invalid_env_capacity_is_an_error() {
        let mut config = PoolConfig::default();
        let err = config
            .apply_overrides(lookup_from(&[(ENV_CAPACITY, "0")]))
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidEnv {
                var: ENV_CAPACITY,
                ..
            }
        ));
    }

    #[test]
    fn credentials_are_redacted_in_debug_output() {
        let config = PoolConfig::default().with_credentials(Credentials::new("s3cret"));
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("s3cret"));
        assert!(rendered.contains("Credentials(***)"));
    }

    #[test]
    fn oversized_durations_saturate() {
        let config = PoolConfig::default()
            .with_acquire_timeout(Duration::MAX)
            .with_shutdown_grace(Duration::MAX);
        assert_eq!(config.acquire_timeout_ms, Some(u64::MAX));
        assert_eq!(config.shutdown_grace_ms, u64::MAX);

        let config = config.with_acquire_timeout(Duration::from_millis(1500));
        assert_eq!(config.acquire_timeout(), Some(Duration::from_millis(1500)));
    }
}
