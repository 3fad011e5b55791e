//! Lifecycle orchestration across hosting VMs and hosted containers.

use crate::config::HostConfig;
use crate::container::{ContainerManager, HostedContainer};
use crate::error::{CoreError, Result};
use crate::index::HostIndex;
use crate::layers::LayerSet;
use crate::mount::MountCoordinator;
use crate::request::CreateRequest;
use crate::schema::{negotiate, Negotiated};
use crate::uvm::{HostingVm, UtilityVmManager};
use std::sync::Arc;
use uuid::Uuid;
use uvmhost_vm::VmEngine;

/// What a creation request produced.
#[derive(Debug)]
pub enum Created {
    /// A hosted or standalone container
    Container(HostedContainer),
    /// A new hosting VM
    UtilityVm(HostingVm),
}

impl Created {
    /// Identity of whatever was created.
    pub fn id(&self) -> &str {
        match self {
            Created::Container(c) => c.id(),
            Created::UtilityVm(vm) => vm.id(),
        }
    }

    /// The container, if one was created.
    pub fn into_container(self) -> Option<HostedContainer> {
        match self {
            Created::Container(c) => Some(c),
            Created::UtilityVm(_) => None,
        }
    }

    /// The hosting VM, if one was created.
    pub fn into_utility_vm(self) -> Option<HostingVm> {
        match self {
            Created::UtilityVm(vm) => Some(vm),
            Created::Container(_) => None,
        }
    }
}

/// Entry point tying the managers together.
///
/// Holds the shared mount coordinator and host index so a hosting VM can
/// never terminate while it still hosts a live container.
#[derive(Debug)]
pub struct LifecycleOrchestrator {
    config: HostConfig,
    mounts: Arc<MountCoordinator>,
    vms: UtilityVmManager,
    containers: ContainerManager,
}

impl LifecycleOrchestrator {
    /// Create an orchestrator driving `engine`.
    ///
    /// # Errors
    /// Returns a configuration error if `config` is invalid.
    pub fn new(config: HostConfig, engine: Arc<dyn VmEngine>) -> Result<Self> {
        config.validate()?;
        let mounts = Arc::new(MountCoordinator::new(engine.clone(), &config));
        let index = Arc::new(HostIndex::new());
        let vms = UtilityVmManager::new(
            engine.clone(),
            mounts.clone(),
            index.clone(),
            config.bus_capacity,
        );
        let containers = ContainerManager::new(engine, mounts.clone(), index, config.bus_capacity);

        tracing::debug!(bus_capacity = config.bus_capacity, backing = ?config.read_only_backing, "Orchestrator ready");
        Ok(Self {
            config,
            mounts,
            vms,
            containers,
        })
    }

    /// Get the host configuration.
    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    /// Get the utility VM manager.
    pub fn vms(&self) -> &UtilityVmManager {
        &self.vms
    }

    /// Get the container manager.
    pub fn containers(&self) -> &ContainerManager {
        &self.containers
    }

    /// Get the mount coordinator.
    pub fn mounts(&self) -> &MountCoordinator {
        &self.mounts
    }

    /// Identities of containers hosted in `vm` that are not terminated.
    pub fn hosted_containers(&self, vm: &str) -> Vec<String> {
        self.vms.hosted_containers(vm)
    }

    /// Create whatever `request` describes.
    ///
    /// Split requests carrying the utility VM marker create a hosting VM
    /// from the request's layer folders; everything else creates a
    /// container.
    pub fn create_ex(&self, request: &CreateRequest) -> Result<Created> {
        let id = request
            .id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        match negotiate(&id, request)? {
            Negotiated::UtilityVm => {
                let layers = LayerSet::new(request.layer_folders.iter().cloned())
                    .map_err(|e| CoreError::config(&id, e))?;
                self.vms
                    .create_owned(layers, request.resources, Some(id), request.owner.clone())
                    .map(Created::UtilityVm)
            }
            negotiated => self
                .containers
                .create_negotiated(id, negotiated, request)
                .map(Created::Container),
        }
    }

    /// Terminate every container hosted in `vm`, then `vm` itself.
    ///
    /// Every step is attempted even when earlier ones fail. Any failures
    /// come back together as [`CoreError::Teardown`].
    pub fn teardown_all(&self, vm: &mut HostingVm) -> Result<()> {
        let id = vm.id().to_string();
        let mut failures = Vec::new();

        for (container_id, entry) in self.vms.hosted_entries(&id) {
            if let Err(e) =
                self.containers
                    .terminate_hosted(&container_id, &id, &entry.layers, &entry.cell)
            {
                tracing::warn!(vm_id = %id, container_id = %container_id, error = %e, "Container teardown failed, continuing");
                failures.push(e);
            }
        }
        if let Err(e) = self.vms.terminate(vm) {
            tracing::warn!(vm_id = %id, error = %e, "Utility VM teardown failed");
            failures.push(e);
        }

        if failures.is_empty() {
            tracing::info!(vm_id = %id, "Teardown complete");
            Ok(())
        } else {
            Err(CoreError::Teardown { id, failures })
        }
    }
}
