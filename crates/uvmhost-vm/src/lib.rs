//! # uvmhost-vm
//!
//! Utility VM primitives for the uvmhost container host.
//! Provides the lifecycle state machine, resource limits, the fixed-capacity
//! storage bus and the interface to the external VM execution engine.
//!
//! ## Quick Start
//!
//! ```
//! use std::sync::Arc;
//! use uvmhost_vm::{LifecycleState, SimulatedEngine, UvmBuilder};
//!
//! # fn example() -> uvmhost_vm::Result<()> {
//! let engine = Arc::new(SimulatedEngine::new());
//! let mut vm = UvmBuilder::new()
//!     .vcpus(2)
//!     .memory_bytes(1 << 30)
//!     .build(engine)?;
//!
//! vm.start()?;
//! assert_eq!(vm.state(), LifecycleState::Running);
//!
//! vm.terminate()?;
//! assert_eq!(vm.state(), LifecycleState::Terminated);
//! # Ok(())
//! # }
//! # example().unwrap();
//! ```
//!
//! ## Features
//!
//! - **Lifecycle Management**: Created → Running → Stopped → Terminated
//! - **Storage Bus**: Fixed slot accounting with all-or-nothing allocation
//! - **Engine Interface**: `VmEngine` and `CommandChannel` traits
//! - **Simulated Engine**: In-memory engine with failure injection
//! - **Builder Pattern**: Ergonomic configuration with `UvmBuilder`

mod builder;
mod bus;
mod config;
mod engine;
mod error;
mod machine;
mod simulated;

pub use builder::UvmBuilder;
pub use bus::{AttachPoint, SlotId, StorageBus, DEFAULT_BUS_CAPACITY};
pub use config::{ResourceLimits, UvmConfig};
pub use engine::{
    Attachment, CommandChannel, CommandOutput, EngineHandle, Role, VmDescriptor, VmEngine,
};
pub use error::{Result, VmError};
pub use machine::{LifecycleState, UtilityVm};
pub use simulated::SimulatedEngine;
