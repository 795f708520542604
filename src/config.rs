//! Runtime configuration.
//!
//! Configuration can be set programmatically or loaded from environment
//! variables. All environment variables use the `LETHE_` prefix:
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `LETHE_BATCH_CAPACITY` | Slots per batch buffer | 4096 |
//! | `LETHE_POOL_RESERVE` | Batches pre-allocated into the pool at start | 2 |
//!
//! Unset or unparsable variables fall back to the defaults.
//!
//! # Example
//!
//! ```rust,ignore
//! use lethe::ReclaimConfig;
//!
//! let config = ReclaimConfig {
//!     batch_capacity: 64,
//!     ..ReclaimConfig::default()
//! };
//! config.validate().unwrap();
//! ```

use std::env;

use thiserror::Error;

/// Default number of slots per batch buffer.
pub const DEFAULT_BATCH_CAPACITY: usize = 4096;

/// Default number of batches pre-allocated into the pool.
pub const DEFAULT_POOL_RESERVE: usize = 2;

/// Configuration for one `start` invocation.
#[derive(Debug, Clone)]
pub struct ReclaimConfig {
    /// Slots per batch buffer. A batch must hold at least one increment and
    /// one decrement, so the minimum is 2. Smaller capacities rotate (and
    /// therefore submit) more often; useful in tests.
    pub batch_capacity: usize,

    /// Batches allocated into the pool before the root mutator starts, so the
    /// first few rotations do not allocate under the mutex.
    pub pool_reserve: usize,
}

impl Default for ReclaimConfig {
    fn default() -> Self {
        Self {
            batch_capacity: DEFAULT_BATCH_CAPACITY,
            pool_reserve: DEFAULT_POOL_RESERVE,
        }
    }
}

impl ReclaimConfig {
    /// Load configuration from `LETHE_*` environment variables.
    ///
    /// Variables that are unset or fail to parse keep their default values.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(val) = parse_env_usize("LETHE_BATCH_CAPACITY") {
            if val >= 2 {
                config.batch_capacity = val;
            }
        }

        if let Some(val) = parse_env_usize("LETHE_POOL_RESERVE") {
            config.pool_reserve = val;
        }

        config
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_capacity < 2 {
            return Err(ConfigError::InvalidValue {
                field: "batch_capacity",
                message: "must be at least 2".into(),
            });
        }
        Ok(())
    }
}

/// Configuration error.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    /// A field holds an out-of-range value.
    #[error("invalid value for {field}: {message}")]
    InvalidValue {
        /// Field name.
        field: &'static str,
        /// What was wrong with it.
        message: String,
    },
}

fn parse_env_usize(name: &str) -> Option<usize> {
    env::var(name).ok().and_then(|val| val.parse().ok())
}
