//! Configuration for the plan runner.
//!
//! Configuration is loaded from environment variables with sensible defaults.

use std::path::PathBuf;
use std::time::Duration;
use uvmhost_core::{HostConfig, LockPolicy, ReadOnlyBacking};
use uvmhost_vm::DEFAULT_BUS_CAPACITY;

/// Name of the lock file inside the state directory.
pub const LOCK_FILE_NAME: &str = "uvmhost.lock";

/// Configuration for the `uvmhost-plan` binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanConfig {
    /// Storage bus capacity of every hosting VM (default: 64).
    pub bus_capacity: usize,

    /// How read-only layers reach a hosting VM (default: shared folder).
    pub read_only_backing: ReadOnlyBacking,

    /// Directory holding the run lock and provisioned scratch layers.
    pub state_dir: PathBuf,

    /// How long to wait for another run holding the state directory.
    pub lock_timeout: Duration,

    /// Interval between lock attempts (default: 50ms).
    pub lock_poll_interval: Duration,
}

/// Configuration validation error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// `UVMHOST_BUS_CAPACITY` was 0
    #[error("bus capacity must be > 0")]
    ZeroBusCapacity,

    /// `UVMHOST_LOCK_POLL_MS` was 0
    #[error("lock poll interval must be > 0")]
    ZeroPollInterval,

    /// The state directory path names a file
    #[error("state directory is not a directory: {0}")]
    InvalidStateDir(PathBuf),
}

impl Default for PlanConfig {
    fn default() -> Self {
        let policy = LockPolicy::default();
        Self {
            bus_capacity: DEFAULT_BUS_CAPACITY,
            read_only_backing: ReadOnlyBacking::default(),
            state_dir: PathBuf::from("/tmp/uvmhost"),
            lock_timeout: policy.timeout,
            lock_poll_interval: policy.poll_interval,
        }
    }
}

impl PlanConfig {
    /// Load configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `UVMHOST_BUS_CAPACITY` | `64` |
    /// | `UVMHOST_READ_ONLY_BACKING` | `shared` (shared, slot) |
    /// | `UVMHOST_STATE_DIR` | `/tmp/uvmhost` |
    /// | `UVMHOST_LOCK_TIMEOUT_MS` | `1000` |
    /// | `UVMHOST_LOCK_POLL_MS` | `50` |
    ///
    /// Values that fail to parse fall back to the default.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let default = Self::default();
        let millis = |key: &str| {
            lookup(key)
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_millis)
        };

        let read_only_backing = match lookup("UVMHOST_READ_ONLY_BACKING") {
            Some(v) => ReadOnlyBacking::parse(&v).unwrap_or_else(|| {
                tracing::warn!(value = %v, "Unknown read-only backing, using default");
                default.read_only_backing
            }),
            None => default.read_only_backing,
        };

        Self {
            bus_capacity: lookup("UVMHOST_BUS_CAPACITY")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(default.bus_capacity),
            read_only_backing,
            state_dir: lookup("UVMHOST_STATE_DIR")
                .map(PathBuf::from)
                .unwrap_or(default.state_dir),
            lock_timeout: millis("UVMHOST_LOCK_TIMEOUT_MS").unwrap_or(default.lock_timeout),
            lock_poll_interval: millis("UVMHOST_LOCK_POLL_MS")
                .unwrap_or(default.lock_poll_interval),
        }
    }

    /// Check the configuration before anything is created.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bus_capacity == 0 {
            return Err(ConfigError::ZeroBusCapacity);
        }

        if self.lock_poll_interval.is_zero() {
            return Err(ConfigError::ZeroPollInterval);
        }

        // Created on demand, but an existing file is a mistake
        if self.state_dir.exists() && !self.state_dir.is_dir() {
            return Err(ConfigError::InvalidStateDir(self.state_dir.clone()));
        }

        Ok(())
    }

    /// Orchestrator configuration derived from this one.
    pub fn host_config(&self) -> uvmhost_core::Result<HostConfig> {
        HostConfig::builder()
            .bus_capacity(self.bus_capacity)
            .read_only_backing(self.read_only_backing)
            .build()
    }

    /// Retry policy for the state directory lock.
    pub fn lock_policy(&self) -> LockPolicy {
        LockPolicy {
            timeout: self.lock_timeout,
            poll_interval: self.lock_poll_interval,
        }
    }

    /// Path of the run lock.
    pub fn lock_path(&self) -> PathBuf {
        self.state_dir.join(LOCK_FILE_NAME)
    }

    /// Root under which scratch layers are provisioned.
    pub fn scratch_root(&self) -> PathBuf {
        self.state_dir.join("scratch")
    }
}
