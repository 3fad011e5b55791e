//! Host configuration types.

use crate::error::CoreError;
use serde::{Deserialize, Serialize};
use uvmhost_vm::DEFAULT_BUS_CAPACITY;

/// How read-only layers are backed inside a hosting VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadOnlyBacking {
    /// Shared-folder mappings, reference counted per layer path; only the
    /// writable scratch consumes a bus slot.
    #[default]
    SharedFolder,
    /// Every layer, read-only or not, consumes its own bus slot.
    BusSlot,
}

impl ReadOnlyBacking {
    /// Parse from string (case-insensitive).
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "shared" | "shared_folder" | "vsmb" => Some(Self::SharedFolder),
            "slot" | "bus_slot" | "scsi" => Some(Self::BusSlot),
            _ => None,
        }
    }
}

/// Configuration shared by every hosting VM and container of one host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostConfig {
    /// Storage bus slots per hosting VM (default: 64).
    pub bus_capacity: usize,
    /// Backing scheme for read-only layers.
    pub read_only_backing: ReadOnlyBacking,
    /// Guest path prefix for composed container roots (default: `/c`).
    pub root_prefix: String,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            bus_capacity: DEFAULT_BUS_CAPACITY,
            read_only_backing: ReadOnlyBacking::SharedFolder,
            root_prefix: "/c".into(),
        }
    }
}

impl HostConfig {
    /// Create a new config builder.
    pub fn builder() -> HostConfigBuilder {
        HostConfigBuilder::default()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.bus_capacity == 0 {
            return Err(CoreError::config("host", "bus_capacity must be > 0"));
        }
        if self.root_prefix.is_empty() {
            return Err(CoreError::config("host", "root_prefix must not be empty"));
        }
        Ok(())
    }
}

/// Builder for HostConfig.
#[derive(Debug, Default)]
pub struct HostConfigBuilder {
    config: HostConfig,
}

impl HostConfigBuilder {
    /// Set the number of bus slots per hosting VM.
    pub fn bus_capacity(mut self, slots: usize) -> Self {
        self.config.bus_capacity = slots;
        self
    }

    /// Set the read-only layer backing.
    pub fn read_only_backing(mut self, backing: ReadOnlyBacking) -> Self {
        self.config.read_only_backing = backing;
        self
    }

    /// Set the guest root prefix.
    pub fn root_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.root_prefix = prefix.into();
        self
    }

    /// Build the configuration, validating all fields.
    pub fn build(self) -> Result<HostConfig, CoreError> {
        self.config.validate()?;
        Ok(self.config)
    }
}
