//! Builder pattern for ergonomic UtilityVm configuration.

use crate::config::{ResourceLimits, UvmConfig};
use crate::engine::{Role, VmEngine};
use crate::error::Result;
use crate::UtilityVm;
use std::path::PathBuf;
use std::sync::Arc;

/// Fluent builder for configuring and creating UtilityVm instances.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use uvmhost_vm::{SimulatedEngine, UvmBuilder};
///
/// # fn example() -> uvmhost_vm::Result<()> {
/// let engine = Arc::new(SimulatedEngine::new());
/// let mut vm = UvmBuilder::new()
///     .id("uvm-0")
///     .memory_bytes(1 << 30)
///     .vcpus(2)
///     .bus_capacity(64)
///     .build(engine)?;
///
/// vm.start()?;
/// vm.terminate()?;
/// # Ok(())
/// # }
/// # example().unwrap();
/// ```
#[derive(Debug, Clone)]
pub struct UvmBuilder {
    id: Option<String>,
    role: Role,
    config: UvmConfig,
}

impl Default for UvmBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl UvmBuilder {
    /// Create a new builder with default configuration.
    pub fn new() -> Self {
        Self {
            id: None,
            role: Role::UtilityVm,
            config: UvmConfig::default(),
        }
    }

    /// Set the VM identity (generated when unset).
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Set what the engine boots this VM as.
    pub fn role(mut self, role: Role) -> Self {
        self.role = role;
        self
    }

    /// Set the memory ceiling in bytes.
    pub fn memory_bytes(mut self, bytes: u64) -> Self {
        self.config.limits.memory_bytes = Some(bytes);
        self
    }

    /// Set the number of virtual CPUs.
    pub fn vcpus(mut self, count: u32) -> Self {
        self.config.limits.vcpu_count = Some(count);
        self
    }

    /// Replace all resource ceilings.
    pub fn limits(mut self, limits: ResourceLimits) -> Self {
        self.config.limits = limits;
        self
    }

    /// Set the number of storage bus slots.
    pub fn bus_capacity(mut self, slots: usize) -> Self {
        self.config.bus_capacity = slots;
        self
    }

    /// Set the boot image folder.
    pub fn image(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.image_path = Some(path.into());
        self
    }

    /// Set the owner tag.
    pub fn owner(mut self, owner: impl Into<String>) -> Self {
        self.config.owner = Some(owner.into());
        self
    }

    /// Set an optional owner tag.
    pub fn maybe_owner(mut self, owner: Option<String>) -> Self {
        self.config.owner = owner;
        self
    }

    /// Build and return the configuration without creating a VM.
    pub fn build_config(self) -> UvmConfig {
        self.config
    }

    /// Create the UtilityVm in the `Created` state.
    ///
    /// # Errors
    /// Returns an error if the configuration is invalid.
    pub fn build(self, engine: Arc<dyn VmEngine>) -> Result<UtilityVm> {
        UtilityVm::create(self.id, self.role, self.config, engine)
    }
}
