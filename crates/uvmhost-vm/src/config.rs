//! Utility VM configuration types.

use crate::bus::DEFAULT_BUS_CAPACITY;
use crate::error::{Result, VmError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Resource ceilings applied to a utility VM.
///
/// Unset fields leave the engine default in place. Explicitly supplied
/// values must be non-zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Memory ceiling in bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_bytes: Option<u64>,
    /// Number of virtual CPUs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vcpu_count: Option<u32>,
}

impl ResourceLimits {
    /// Limits with both a memory ceiling and a vCPU count.
    pub fn new(memory_bytes: u64, vcpu_count: u32) -> Self {
        Self {
            memory_bytes: Some(memory_bytes),
            vcpu_count: Some(vcpu_count),
        }
    }

    /// Check that every explicitly supplied limit is positive.
    pub fn validate(&self) -> Result<()> {
        if self.memory_bytes == Some(0) {
            return Err(VmError::Config("memory limit must be > 0".into()));
        }
        if self.vcpu_count == Some(0) {
            return Err(VmError::Config("vcpu count must be > 0".into()));
        }
        Ok(())
    }
}

/// Configuration for a single utility VM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UvmConfig {
    /// Resource ceilings.
    pub limits: ResourceLimits,
    /// Number of addressable slots on the VM's storage bus (default: 64).
    pub bus_capacity: usize,
    /// Boot image folder, when the engine needs one named explicitly.
    pub image_path: Option<PathBuf>,
    /// Free-form owner tag passed through to the engine.
    pub owner: Option<String>,
}

impl Default for UvmConfig {
    fn default() -> Self {
        Self {
            limits: ResourceLimits::default(),
            bus_capacity: DEFAULT_BUS_CAPACITY,
            image_path: None,
            owner: None,
        }
    }
}

impl UvmConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        self.limits.validate()?;
        if self.bus_capacity == 0 {
            return Err(VmError::Config("bus capacity must be > 0".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unset_limits_are_valid() {
        assert!(ResourceLimits::default().validate().is_ok());
    }

    #[test]
    fn test_zero_limits_rejected() {
        let zero_memory = ResourceLimits {
            memory_bytes: Some(0),
            vcpu_count: Some(2),
        };
        assert!(zero_memory.validate().is_err());

        let zero_cpus = ResourceLimits {
            memory_bytes: Some(1 << 30),
            vcpu_count: Some(0),
        };
        assert!(zero_cpus.validate().is_err());
    }

    #[test]
    fn test_limits_json_shape() {
        let limits = ResourceLimits::new(1 << 30, 2);
        let json = serde_json::to_string(&limits).unwrap();
        assert_eq!(json, r#"{"memory_bytes":1073741824,"vcpu_count":2}"#);

        let parsed: ResourceLimits = serde_json::from_str("{}").unwrap();
        assert_eq!(parsed, ResourceLimits::default());
    }

    #[test]
    fn test_zero_bus_capacity_rejected() {
        let config = UvmConfig {
            bus_capacity: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
