//! # uvmhost-core
//!
//! Hosted-container lifecycle and layer-storage mount coordination for
//! utility VMs.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                    LifecycleOrchestrator                     │
//! │   create_ex() ── negotiate() ──┬── UtilityVmManager          │
//! │   teardown_all()               └── ContainerManager          │
//! ├──────────────────────────────────────────────────────────────┤
//! │  HostIndex (vm id -> hosted container ids, per-VM gate)      │
//! ├──────────────────────────────────────────────────────────────┤
//! │  MountCoordinator                                            │
//! │    per hosting VM: StorageBus + shares + mount records       │
//! └──────────────────────────────────────────────────────────────┘
//!                               │ boot / shutdown / hot-add
//!                               ▼
//!                     VmEngine (uvmhost-vm)
//! ```
//!
//! ## Quick Start
//!
//! ```
//! use std::sync::Arc;
//! use uvmhost_core::{CreateRequest, HostConfig, LayerSet, LifecycleOrchestrator};
//! use uvmhost_vm::{LifecycleState, ResourceLimits, SimulatedEngine};
//!
//! # fn example() -> uvmhost_core::Result<()> {
//! let orch = LifecycleOrchestrator::new(HostConfig::default(), Arc::new(SimulatedEngine::new()))?;
//!
//! let boot = LayerSet::with_scratch(["/layers/base"], "/scratch/uvm").unwrap();
//! let mut uvm = orch
//!     .vms()
//!     .create(boot, ResourceLimits::new(1 << 30, 2), Some("uvm".into()))?;
//! orch.vms().start(&mut uvm)?;
//!
//! let mut web = orch.containers().create(
//!     &CreateRequest::new()
//!         .id("web")
//!         .hosted_in("uvm")
//!         .layer_folders(["/layers/base", "/layers/app", "/scratch/web"]),
//! )?;
//! orch.containers().start(&mut web)?;
//! assert_eq!(web.state(), LifecycleState::Running);
//!
//! orch.containers().terminate(&mut web)?;
//! orch.vms().terminate(&mut uvm)?;
//! # Ok(())
//! # }
//! # example().unwrap();
//! ```

pub mod config;
pub mod error;
pub mod layers;
pub mod lock;
pub mod provision;
pub mod request;
pub mod schema;

mod container;
mod index;
mod mount;
mod orchestrator;
mod sync;
mod uvm;

pub use config::{HostConfig, HostConfigBuilder, ReadOnlyBacking};
pub use container::{ContainerManager, HostedContainer};
pub use error::{CoreError, Phase, Result};
pub use layers::{locate_uvm_image, locate_uvm_image_with, LayerError, LayerSet, UVM_IMAGE_DIR};
pub use lock::{acquire, AdvisoryLock, FileLock, LockError, LockGuard, LockPolicy};
pub use mount::{BusSnapshot, MountCoordinator, MountedLayer, MountedRoot, UnmountScope};
pub use orchestrator::{Created, LifecycleOrchestrator};
pub use provision::{DirProvisioner, ScratchProvisioner};
pub use request::{CreateRequest, HyperVSettings, OPTION_IS_UTILITY_VM, OPTION_SCHEMA_VERSION};
pub use schema::{negotiate, Negotiated, SchemaVersion};
pub use uvm::{HostingVm, UtilityVmManager};
