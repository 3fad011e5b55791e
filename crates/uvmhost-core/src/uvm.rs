//! Utility VM management.

use crate::error::{fail_forward, CoreError, Phase, Result};
use crate::index::{HostIndex, HostedEntry};
use crate::layers::LayerSet;
use crate::mount::{MountCoordinator, MountedRoot, UnmountScope};
use crate::sync::write;
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;
use uvmhost_vm::{EngineHandle, LifecycleState, ResourceLimits, Role, UtilityVm, UvmBuilder, VmEngine};

/// A utility VM that hosts containers.
///
/// The VM does not own its containers; the host index only tracks which
/// ones reference it.
#[derive(Debug)]
pub struct HostingVm {
    machine: UtilityVm,
    boot_layers: LayerSet,
    boot_root: Option<MountedRoot>,
}

impl HostingVm {
    /// Get the VM identity.
    pub fn id(&self) -> &str {
        self.machine.id()
    }

    /// Get the current state.
    pub fn state(&self) -> LifecycleState {
        self.machine.state()
    }

    /// Get the resource ceilings.
    pub fn limits(&self) -> ResourceLimits {
        self.machine.limits()
    }

    /// Get the engine handle, if running.
    pub fn handle(&self) -> Option<EngineHandle> {
        self.machine.handle()
    }

    /// Get the layer set the VM boots from.
    pub fn boot_layers(&self) -> &LayerSet {
        &self.boot_layers
    }

    /// Get the mounted boot root; `None` once terminated.
    pub fn boot_root(&self) -> Option<&MountedRoot> {
        self.boot_root.as_ref()
    }

    /// Get the creation timestamp.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.machine.created_at()
    }

    /// Get the underlying VM primitive.
    pub fn machine(&self) -> &UtilityVm {
        &self.machine
    }
}

/// Creates, starts and terminates hosting VMs.
pub struct UtilityVmManager {
    engine: Arc<dyn VmEngine>,
    mounts: Arc<MountCoordinator>,
    index: Arc<HostIndex>,
    bus_capacity: usize,
}

impl fmt::Debug for UtilityVmManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UtilityVmManager")
            .field("bus_capacity", &self.bus_capacity)
            .finish_non_exhaustive()
    }
}

impl UtilityVmManager {
    pub(crate) fn new(
        engine: Arc<dyn VmEngine>,
        mounts: Arc<MountCoordinator>,
        index: Arc<HostIndex>,
        bus_capacity: usize,
    ) -> Self {
        Self {
            engine,
            mounts,
            index,
            bus_capacity,
        }
    }

    /// Create a hosting VM in state `Created`.
    ///
    /// The VM gets a fresh storage bus and its own boot layers are mounted
    /// onto it.
    ///
    /// # Errors
    /// - [`CoreError::ResourceLimitInvalid`] for zero limits
    /// - [`CoreError::Configuration`] if the identity is taken
    /// - mount errors for the boot layers
    pub fn create(
        &self,
        layers: LayerSet,
        limits: ResourceLimits,
        id: Option<String>,
    ) -> Result<HostingVm> {
        self.create_owned(layers, limits, id, None)
    }

    /// Same as [`create`](Self::create) with an owner tag.
    pub fn create_owned(
        &self,
        layers: LayerSet,
        limits: ResourceLimits,
        id: Option<String>,
        owner: Option<String>,
    ) -> Result<HostingVm> {
        let id = id.unwrap_or_else(|| Uuid::new_v4().to_string());
        if id.is_empty() {
            return Err(CoreError::config(&id, "identity must not be empty"));
        }
        limits
            .validate()
            .map_err(|e| CoreError::ResourceLimitInvalid {
                id: id.clone(),
                reason: e.to_string(),
            })?;

        let mut machine = UvmBuilder::new()
            .id(&id)
            .role(Role::UtilityVm)
            .limits(limits)
            .bus_capacity(self.bus_capacity)
            .maybe_owner(owner)
            .build(self.engine.clone())
            .map_err(|e| CoreError::config(&id, e))?;

        if !self.index.register_host(&id) {
            return Err(CoreError::config(&id, "identity already in use"));
        }
        if let Err(e) = self.mounts.register_host(&id, self.bus_capacity) {
            self.index.remove_host(&id);
            return Err(e);
        }
        let root = match self.mounts.mount(&id, &layers) {
            Ok(root) => root,
            Err(e) => {
                self.mounts.deregister_host(&id);
                self.index.remove_host(&id);
                return Err(e);
            }
        };
        machine.set_root_path(root.root_path.clone());

        tracing::info!(vm_id = %id, memory_bytes = ?limits.memory_bytes, vcpus = ?limits.vcpu_count, root = %root.root_path, "Utility VM created");
        Ok(HostingVm {
            machine,
            boot_layers: layers,
            boot_root: Some(root),
        })
    }

    /// Boot a hosting VM: `Created` to `Running`.
    ///
    /// # Errors
    /// [`CoreError::AlreadyRunning`] if the VM is past `Created`,
    /// [`CoreError::StartFailure`] if the engine cannot boot it.
    pub fn start(&self, vm: &mut HostingVm) -> Result<()> {
        let id = vm.id().to_string();
        vm.machine.start().map_err(|e| CoreError::start(&id, e))?;
        self.index.set_host_state(&id, LifecycleState::Running);
        tracing::info!(vm_id = %id, "Utility VM started");
        Ok(())
    }

    /// Terminate a hosting VM from any state and unmount its boot layers.
    ///
    /// Waits for in-flight container creations and terminations on this VM
    /// to finish first.
    ///
    /// # Errors
    /// [`CoreError::HostBusy`] while any hosted container is not yet
    /// terminated; nothing is changed in that case.
    pub fn terminate(&self, vm: &mut HostingVm) -> Result<()> {
        if vm.state().is_terminated() {
            return Ok(());
        }
        let id = vm.id().to_string();

        let gate = self.index.gate(&id);
        let _gate = gate.as_deref().map(write);
        let hosted = self.index.hosted(&id);
        if !hosted.is_empty() {
            tracing::debug!(vm_id = %id, hosted = hosted.len(), "Terminate refused, containers still hosted");
            return Err(CoreError::HostBusy { vm: id, hosted });
        }

        tracing::info!(vm_id = %id, state = %vm.state(), "Terminating utility VM");
        self.index.set_host_state(&id, LifecycleState::Terminated);

        let mut failures = Vec::new();
        if let Err(e) = vm.machine.terminate() {
            failures.push(CoreError::engine(&id, Phase::Terminate, e));
        }
        if vm.boot_root.take().is_some() {
            if let Err(e) = self.mounts.unmount(&id, &vm.boot_layers, UnmountScope::All) {
                failures.push(e);
            }
        }
        self.mounts.deregister_host(&id);
        self.index.remove_host(&id);

        if !failures.is_empty() {
            tracing::warn!(vm_id = %id, failures = failures.len(), "Utility VM terminated with errors");
        }
        fail_forward(&id, failures)
    }

    /// Identities of containers hosted in `vm` that are not terminated.
    pub fn hosted_containers(&self, vm: &str) -> Vec<String> {
        self.index.hosted(vm)
    }

    pub(crate) fn hosted_entries(&self, vm: &str) -> Vec<(String, HostedEntry)> {
        self.index.hosted_entries(vm)
    }
}
