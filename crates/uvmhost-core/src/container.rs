//! Hosted container management.
//!
//! A [`HostedContainer`] is either hosted in a shared utility VM (schema
//! 2.0) or backed by a private single-purpose VM (schema 1.0). Both shapes
//! mount their layers through the [`MountCoordinator`]; the private VM
//! simply has a storage bus of its own.

use crate::error::{fail_forward, CoreError, Phase, Result};
use crate::index::{HostIndex, HostedEntry};
use crate::layers::{locate_uvm_image, LayerSet};
use crate::mount::{MountCoordinator, MountedRoot, UnmountScope};
use crate::request::{CreateRequest, HyperVSettings};
use crate::schema::{negotiate, Negotiated, SchemaVersion};
use crate::sync::{lock, read};
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::{Arc, Mutex};
use uuid::Uuid;
use uvmhost_vm::{
    CommandChannel, CommandOutput, EngineHandle, LifecycleState, ResourceLimits, Role,
    UtilityVm, UvmBuilder, VmDescriptor, VmEngine,
};

/// Runtime state shared between a container and the host index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ContainerRuntime {
    pub(crate) state: LifecycleState,
    pub(crate) handle: Option<EngineHandle>,
}

impl Default for ContainerRuntime {
    fn default() -> Self {
        Self {
            state: LifecycleState::Created,
            handle: None,
        }
    }
}

pub(crate) type ContainerCell = Mutex<ContainerRuntime>;

#[derive(Debug)]
enum Hosting {
    Shared { host: String },
    Private(UtilityVm),
}

/// A VM-isolated container.
///
/// Owned by the caller that created it. Drive it through the
/// [`ContainerManager`] that created it.
///
/// Dropping a container does not release anything: its identity claim,
/// mounted layers and hosting registration stay in place until it is
/// terminated or its hosting VM is torn down. A warning is logged when a
/// container is dropped before termination.
pub struct HostedContainer {
    id: String,
    owner: Option<String>,
    schema: SchemaVersion,
    layers: LayerSet,
    hosting: Hosting,
    root: MountedRoot,
    limits: ResourceLimits,
    cell: Arc<ContainerCell>,
    created_at: DateTime<Utc>,
}

impl fmt::Debug for HostedContainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostedContainer")
            .field("id", &self.id)
            .field("schema", &self.schema)
            .field("host", &self.host_id())
            .field("root", &self.root.root_path)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Drop for HostedContainer {
    fn drop(&mut self) {
        let state = self.state();
        if !state.is_terminated() {
            tracing::warn!(
                container_id = %self.id,
                host = %self.host_id(),
                %state,
                "Container dropped without terminate, resources stay claimed"
            );
        }
    }
}

impl HostedContainer {
    /// Get the container identity.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Get the owner tag.
    pub fn owner(&self) -> Option<&str> {
        self.owner.as_deref()
    }

    /// Get the schema the container was created under.
    pub fn schema(&self) -> SchemaVersion {
        self.schema
    }

    /// Get the container's layer set.
    pub fn layers(&self) -> &LayerSet {
        &self.layers
    }

    /// Identity of the VM whose bus holds the layers.
    ///
    /// For a legacy container this is its own identity.
    pub fn host_id(&self) -> &str {
        match &self.hosting {
            Hosting::Shared { host } => host,
            Hosting::Private(_) => &self.id,
        }
    }

    /// Hosting VM reference, absent for a self-hosted container.
    pub fn hosting_vm(&self) -> Option<&str> {
        match &self.hosting {
            Hosting::Shared { host } => Some(host),
            Hosting::Private(_) => None,
        }
    }

    /// Get the mounted root.
    pub fn root(&self) -> &MountedRoot {
        &self.root
    }

    /// Get the resource ceilings.
    pub fn limits(&self) -> ResourceLimits {
        self.limits
    }

    /// Get the current state.
    pub fn state(&self) -> LifecycleState {
        lock(&self.cell).state
    }

    /// Get the engine handle, if running.
    pub fn handle(&self) -> Option<EngineHandle> {
        lock(&self.cell).handle
    }

    /// Get the creation timestamp.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Run `command` inside the running container.
    pub fn run(
        &self,
        channel: &dyn CommandChannel,
        command: &str,
        working_dir: &str,
    ) -> Result<CommandOutput> {
        let runtime = *lock(&self.cell);
        let handle = runtime.handle.ok_or_else(|| CoreError::InvalidState {
            id: self.id.clone(),
            phase: Phase::Exec,
            state: runtime.state,
            expected: "running".into(),
        })?;
        tracing::debug!(container_id = %self.id, command, "Running command");
        channel
            .run(&handle, command, working_dir)
            .map_err(|e| CoreError::engine(&self.id, Phase::Exec, e))
    }
}

/// Creates hosted containers and drives them through their lifecycle.
pub struct ContainerManager {
    engine: Arc<dyn VmEngine>,
    mounts: Arc<MountCoordinator>,
    index: Arc<HostIndex>,
    bus_capacity: usize,
}

impl fmt::Debug for ContainerManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContainerManager")
            .field("bus_capacity", &self.bus_capacity)
            .finish_non_exhaustive()
    }
}

impl ContainerManager {
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

    /// Create a container from `request`.
    ///
    /// Validation happens before anything is allocated. A failure after
    /// layers were mounted unmounts them again before returning.
    ///
    /// Requests carrying the utility VM marker do not describe a container
    /// and are refused here without allocating anything. Use
    /// [`LifecycleOrchestrator::create_ex`](crate::LifecycleOrchestrator::create_ex),
    /// which hands them to the utility VM manager, when a request may be
    /// either kind.
    ///
    /// # Errors
    /// Returns a configuration error for utility VM requests.
    pub fn create(&self, request: &CreateRequest) -> Result<HostedContainer> {
        let id = request
            .id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let negotiated = negotiate(&id, request)?;
        self.create_negotiated(id, negotiated, request)
    }

    pub(crate) fn create_negotiated(
        &self,
        id: String,
        negotiated: Negotiated,
        request: &CreateRequest,
    ) -> Result<HostedContainer> {
        if id.is_empty() {
            return Err(CoreError::config(&id, "identity must not be empty"));
        }
        request
            .resources
            .validate()
            .map_err(|e| CoreError::ResourceLimitInvalid {
                id: id.clone(),
                reason: e.to_string(),
            })?;
        let layers = LayerSet::new(request.layer_folders.iter().cloned())
            .map_err(|e| CoreError::config(&id, e))?;

        match negotiated {
            Negotiated::Hosted { host } => self.create_hosted(id, host, layers, request),
            Negotiated::Legacy { hyper_v } => self.create_legacy(id, hyper_v, layers, request),
            Negotiated::UtilityVm => Err(CoreError::config(
                &id,
                "utility VM requests are not containers; create them with create_ex",
            )),
        }
    }

    fn create_hosted(
        &self,
        id: String,
        host: String,
        layers: LayerSet,
        request: &CreateRequest,
    ) -> Result<HostedContainer> {
        let not_found = || CoreError::HostNotFound {
            vm: host.clone(),
            phase: Phase::Create,
        };
        let gate = self.index.gate(&host).ok_or_else(not_found)?;
        let _gate = read(&gate);
        match self.index.host_state(&host) {
            Some(state) if !state.is_terminated() => {}
            _ => return Err(not_found()),
        }

        if !self.index.claim(&id) {
            return Err(CoreError::config(&id, "identity already in use"));
        }
        let root = match self.mounts.mount(&host, &layers) {
            Ok(root) => root,
            Err(e) => {
                self.index.release(&id);
                return Err(e);
            }
        };

        let cell = Arc::new(Mutex::new(ContainerRuntime::default()));
        let entry = HostedEntry {
            layers: layers.clone(),
            cell: cell.clone(),
        };
        if !self.index.attach(&host, &id, entry) {
            if let Err(e) = self.mounts.unmount(&host, &layers, UnmountScope::ThisContainer) {
                tracing::warn!(container_id = %id, error = %e, "Rollback unmount failed");
            }
            self.index.release(&id);
            return Err(not_found());
        }

        tracing::info!(container_id = %id, vm_id = %host, root = %root.root_path, "Hosted container created");
        Ok(HostedContainer {
            id,
            owner: request.owner.clone(),
            schema: SchemaVersion::Split,
            layers,
            hosting: Hosting::Shared { host },
            root,
            limits: request.resources,
            cell,
            created_at: Utc::now(),
        })
    }

    fn create_legacy(
        &self,
        id: String,
        hyper_v: HyperVSettings,
        layers: LayerSet,
        request: &CreateRequest,
    ) -> Result<HostedContainer> {
        let image = match hyper_v.utility_vm_path {
            Some(path) => path,
            None => locate_uvm_image(&layers).map_err(|e| CoreError::config(&id, e))?,
        };

        if !self.index.claim(&id) {
            return Err(CoreError::config(&id, "identity already in use"));
        }
        let mut vm = match UvmBuilder::new()
            .id(&id)
            .role(Role::Standalone)
            .limits(request.resources)
            .bus_capacity(self.bus_capacity)
            .image(&image)
            .maybe_owner(request.owner.clone())
            .build(self.engine.clone())
        {
            Ok(vm) => vm,
            Err(e) => {
                self.index.release(&id);
                return Err(CoreError::config(&id, e));
            }
        };
        if let Err(e) = self.mounts.register_host(&id, self.bus_capacity) {
            self.index.release(&id);
            return Err(e);
        }
        let root = match self.mounts.mount(&id, &layers) {
            Ok(root) => root,
            Err(e) => {
                self.mounts.deregister_host(&id);
                self.index.release(&id);
                return Err(e);
            }
        };
        vm.set_root_path(root.root_path.clone());

        tracing::info!(container_id = %id, image = %image.display(), root = %root.root_path, "Standalone container created");
        Ok(HostedContainer {
            id,
            owner: request.owner.clone(),
            schema: SchemaVersion::Legacy,
            layers,
            hosting: Hosting::Private(vm),
            root,
            limits: request.resources,
            cell: Arc::new(Mutex::new(ContainerRuntime::default())),
            created_at: Utc::now(),
        })
    }

    /// Start a container: `Created` to `Running`.
    ///
    /// A hosted container additionally needs its hosting VM running.
    pub fn start(&self, container: &mut HostedContainer) -> Result<()> {
        if let Hosting::Shared { host } = &container.hosting {
            match self.index.host_state(host) {
                Some(LifecycleState::Running) => {}
                Some(state) => {
                    return Err(CoreError::InvalidState {
                        id: container.id.clone(),
                        phase: Phase::Start,
                        state,
                        expected: format!("hosting VM '{}' running", host),
                    })
                }
                None => {
                    return Err(CoreError::HostNotFound {
                        vm: host.clone(),
                        phase: Phase::Start,
                    })
                }
            }
        }

        let state = lock(&container.cell).state;
        if state != LifecycleState::Created {
            return Err(CoreError::AlreadyRunning {
                id: container.id.clone(),
                state,
            });
        }

        // The cell stays unlocked while the engine boots
        tracing::info!(container_id = %container.id, "Starting container");
        let handle = match &mut container.hosting {
            Hosting::Private(vm) => {
                vm.start().map_err(|e| CoreError::start(&container.id, e))?;
                vm.handle()
            }
            Hosting::Shared { host } => {
                let descriptor = VmDescriptor {
                    id: container.id.clone(),
                    owner: container.owner.clone(),
                    role: Role::Hosted {
                        host_id: host.clone(),
                    },
                    limits: container.limits,
                    image_path: None,
                    root_path: Some(container.root.root_path.clone()),
                };
                let handle = self
                    .engine
                    .boot(&descriptor)
                    .map_err(|e| CoreError::start(&container.id, e))?;
                Some(handle)
            }
        };

        let mut runtime = lock(&container.cell);
        if runtime.state == LifecycleState::Created {
            runtime.handle = handle;
            runtime.state = LifecycleState::Running;
            return Ok(());
        }

        // Torn down while booting
        let state = runtime.state;
        drop(runtime);
        tracing::warn!(container_id = %container.id, %state, "Container terminated during start, shutting down");
        let shutdown = match &mut container.hosting {
            Hosting::Private(vm) => vm.terminate(),
            Hosting::Shared { .. } => match handle {
                Some(handle) => self.engine.shutdown(&handle),
                None => Ok(()),
            },
        };
        if let Err(e) = shutdown {
            tracing::warn!(container_id = %container.id, error = %e, "Shutdown after aborted start failed");
        }
        Err(CoreError::InvalidState {
            id: container.id.clone(),
            phase: Phase::Start,
            state,
            expected: "created".into(),
        })
    }

    /// Stop a running container: `Running` to `Stopped`.
    pub fn stop(&self, container: &mut HostedContainer) -> Result<()> {
        let handle = {
            let mut runtime = lock(&container.cell);
            if runtime.state != LifecycleState::Running {
                return Err(CoreError::InvalidState {
                    id: container.id.clone(),
                    phase: Phase::Stop,
                    state: runtime.state,
                    expected: "running".into(),
                });
            }
            runtime.handle.take()
        };

        tracing::info!(container_id = %container.id, "Stopping container");
        let stopped = match &mut container.hosting {
            Hosting::Private(vm) => vm.stop(),
            Hosting::Shared { .. } => match handle {
                Some(handle) => self.engine.shutdown(&handle),
                None => Ok(()),
            },
        };

        let mut runtime = lock(&container.cell);
        if let Err(e) = stopped {
            if runtime.state == LifecycleState::Running {
                runtime.handle = handle;
            }
            return Err(CoreError::engine(&container.id, Phase::Stop, e));
        }
        if !runtime.state.is_terminated() {
            runtime.state = LifecycleState::Stopped;
        }
        Ok(())
    }

    /// Terminate a container from any state and unmount its layers.
    ///
    /// Every cleanup step runs even if an earlier one fails; failures are
    /// reported together. Terminating a terminated container is a no-op.
    pub fn terminate(&self, container: &mut HostedContainer) -> Result<()> {
        match &mut container.hosting {
            Hosting::Shared { host } => {
                self.terminate_hosted(&container.id, host, &container.layers, &container.cell)
            }
            Hosting::Private(vm) => {
                let id = container.id.as_str();
                {
                    let mut runtime = lock(&container.cell);
                    if runtime.state.is_terminated() {
                        return Ok(());
                    }
                    tracing::info!(container_id = %id, state = %runtime.state, "Terminating container");
                    runtime.handle = None;
                    runtime.state = LifecycleState::Terminated;
                }

                let mut failures = Vec::new();
                if let Err(e) = vm.terminate() {
                    failures.push(CoreError::engine(id, Phase::Terminate, e));
                }
                if let Err(e) = self.mounts.unmount(id, &container.layers, UnmountScope::All) {
                    failures.push(e);
                }
                self.mounts.deregister_host(id);
                self.index.release(id);
                fail_forward(id, failures)
            }
        }
    }

    pub(crate) fn terminate_hosted(
        &self,
        id: &str,
        host: &str,
        layers: &LayerSet,
        cell: &ContainerCell,
    ) -> Result<()> {
        let gate = self.index.gate(host);
        let _gate = gate.as_deref().map(read);

        let handle = {
            let mut runtime = lock(cell);
            if runtime.state.is_terminated() {
                return Ok(());
            }
            tracing::info!(container_id = %id, vm_id = %host, state = %runtime.state, "Terminating container");
            runtime.state = LifecycleState::Terminated;
            runtime.handle.take()
        };

        let mut failures = Vec::new();
        if let Some(handle) = handle {
            if let Err(e) = self.engine.shutdown(&handle) {
                tracing::warn!(container_id = %id, error = %e, "Shutdown failed, continuing teardown");
                failures.push(CoreError::engine(id, Phase::Terminate, e));
            }
        }

        if let Err(e) = self.mounts.unmount(host, layers, UnmountScope::ThisContainer) {
            failures.push(e);
        }
        self.index.detach(host, id);
        self.index.release(id);
        fail_forward(id, failures)
    }
}
