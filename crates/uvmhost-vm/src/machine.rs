//! UtilityVm type - lifecycle of a single engine-backed VM.

use crate::config::{ResourceLimits, UvmConfig};
use crate::engine::{EngineHandle, Role, VmDescriptor, VmEngine};
use crate::error::{Result, VmError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Lifecycle state shared by utility VMs and the containers they host.
///
/// ```text
/// Created ──start──► Running ──stop──► Stopped
///    │                  │                 │
///    └──────────────────┴─────────────────┴──terminate──► Terminated
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    /// Created, not yet started
    Created,
    /// Running
    Running,
    /// Stopped gracefully
    Stopped,
    /// Terminated; final
    Terminated,
}

impl LifecycleState {
    /// Whether moving from `self` to `next` is a legal transition.
    pub fn can_transition_to(self, next: LifecycleState) -> bool {
        use LifecycleState::*;
        matches!(
            (self, next),
            (Created, Running)
                | (Running, Stopped)
                | (Created, Terminated)
                | (Running, Terminated)
                | (Stopped, Terminated)
        )
    }

    /// Whether the state is final.
    pub fn is_terminated(self) -> bool {
        self == LifecycleState::Terminated
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleState::Created => write!(f, "created"),
            LifecycleState::Running => write!(f, "running"),
            LifecycleState::Stopped => write!(f, "stopped"),
            LifecycleState::Terminated => write!(f, "terminated"),
        }
    }
}

/// A utility VM driven through the execution engine.
///
/// Only the VM itself is managed here. Storage attached to the VM's bus
/// and the containers it hosts are tracked by the layers above.
pub struct UtilityVm {
    /// Identity, unique within the process
    id: String,
    /// Configuration used to create this VM
    config: UvmConfig,
    /// What the engine boots this VM as
    role: Role,
    /// Composed root passed to the engine at boot, if any
    root_path: Option<String>,
    /// Current lifecycle state
    state: LifecycleState,
    /// Engine handle while booted
    handle: Option<EngineHandle>,
    engine: Arc<dyn VmEngine>,
    created_at: DateTime<Utc>,
}

impl fmt::Debug for UtilityVm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UtilityVm")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("state", &self.state)
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

impl UtilityVm {
    /// Create a VM in the `Created` state.
    ///
    /// Nothing is booted yet; the identity is generated when `id` is `None`.
    ///
    /// # Errors
    /// Returns an error if the configuration is invalid.
    pub fn create(
        id: Option<String>,
        role: Role,
        config: UvmConfig,
        engine: Arc<dyn VmEngine>,
    ) -> Result<Self> {
        config.validate()?;
        let id = id.unwrap_or_else(|| Uuid::new_v4().to_string());
        if id.is_empty() {
            return Err(VmError::Config("id must not be empty".into()));
        }
        tracing::debug!(vm_id = %id, ?role, bus_capacity = config.bus_capacity, "Utility VM created");

        Ok(Self {
            id,
            config,
            role,
            root_path: None,
            state: LifecycleState::Created,
            handle: None,
            engine,
            created_at: Utc::now(),
        })
    }

    /// Get the identity of this VM.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Get the current state.
    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// Get the configuration used to create this VM.
    pub fn config(&self) -> &UvmConfig {
        &self.config
    }

    /// Get the resource ceilings.
    pub fn limits(&self) -> ResourceLimits {
        self.config.limits
    }

    /// Get the engine handle, if booted.
    pub fn handle(&self) -> Option<EngineHandle> {
        self.handle
    }

    /// Get the creation timestamp.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Set the composed root passed to the engine at boot.
    pub fn set_root_path(&mut self, root_path: impl Into<String>) {
        self.root_path = Some(root_path.into());
    }

    /// Descriptor the engine boots this VM from.
    pub fn descriptor(&self) -> VmDescriptor {
        VmDescriptor {
            id: self.id.clone(),
            owner: self.config.owner.clone(),
            role: self.role.clone(),
            limits: self.config.limits,
            image_path: self.config.image_path.clone(),
            root_path: self.root_path.clone(),
        }
    }

    /// Boot the VM.
    ///
    /// # Errors
    /// Returns [`VmError::InvalidState`] unless the VM is `Created`, or the
    /// engine's boot error.
    pub fn start(&mut self) -> Result<()> {
        if !self.state.can_transition_to(LifecycleState::Running) {
            return Err(VmError::InvalidState {
                expected: "created".into(),
                actual: self.state,
            });
        }

        tracing::info!(vm_id = %self.id, "Starting VM");
        let handle = self.engine.boot(&self.descriptor())?;
        self.handle = Some(handle);
        self.state = LifecycleState::Running;
        tracing::debug!(vm_id = %self.id, %handle, "VM running");
        Ok(())
    }

    /// Stop the VM gracefully.
    ///
    /// # Errors
    /// Returns an error if the VM is not running or the engine fails to
    /// shut it down.
    pub fn stop(&mut self) -> Result<()> {
        if !self.state.can_transition_to(LifecycleState::Stopped) {
            return Err(VmError::InvalidState {
                expected: "running".into(),
                actual: self.state,
            });
        }

        tracing::info!(vm_id = %self.id, "Stopping VM");
        if let Some(handle) = self.handle {
            self.engine.shutdown(&handle)?;
        }
        self.handle = None;
        self.state = LifecycleState::Stopped;
        Ok(())
    }

    /// Terminate the VM from any state.
    ///
    /// A running VM is shut down forcibly. The VM ends up `Terminated` even
    /// when the engine reports a shutdown error; that error is returned.
    /// Terminating a terminated VM is a no-op.
    pub fn terminate(&mut self) -> Result<()> {
        if !self.state.can_transition_to(LifecycleState::Terminated) {
            return Ok(());
        }

        tracing::info!(vm_id = %self.id, state = %self.state, "Terminating VM");
        let result = match self.handle.take() {
            Some(handle) => self.engine.shutdown(&handle),
            None => Ok(()),
        };
        self.state = LifecycleState::Terminated;
        if let Err(e) = &result {
            tracing::warn!(vm_id = %self.id, error = %e, "Engine shutdown failed during terminate");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulated::SimulatedEngine;

    fn vm(engine: Arc<SimulatedEngine>) -> UtilityVm {
        UtilityVm::create(
            Some("uvm".into()),
            Role::UtilityVm,
            UvmConfig::default(),
            engine,
        )
        .unwrap()
    }

    #[test]
    fn test_state_display() {
        assert_eq!(LifecycleState::Created.to_string(), "created");
        assert_eq!(LifecycleState::Running.to_string(), "running");
        assert_eq!(LifecycleState::Stopped.to_string(), "stopped");
        assert_eq!(LifecycleState::Terminated.to_string(), "terminated");
    }

    #[test]
    fn test_transitions() {
        use LifecycleState::*;
        assert!(Created.can_transition_to(Running));
        assert!(Created.can_transition_to(Terminated));
        assert!(Running.can_transition_to(Terminated));
        assert!(!Stopped.can_transition_to(Running));
        assert!(!Terminated.can_transition_to(Created));
        assert!(!Created.can_transition_to(Stopped));
    }

    #[test]
    fn test_generated_id() {
        let engine = Arc::new(SimulatedEngine::new());
        let vm = UtilityVm::create(None, Role::UtilityVm, UvmConfig::default(), engine).unwrap();
        assert_eq!(vm.id().len(), 36);
        assert_eq!(vm.state(), LifecycleState::Created);
    }

    #[test]
    fn test_start_twice_is_invalid() {
        let engine = Arc::new(SimulatedEngine::new());
        let mut vm = vm(engine.clone());
        vm.start().unwrap();
        assert!(matches!(
            vm.start(),
            Err(VmError::InvalidState {
                actual: LifecycleState::Running,
                ..
            })
        ));
        assert_eq!(engine.running_count(), 1);
    }

    #[test]
    fn test_transitions_follow_state_machine() {
        let engine = Arc::new(SimulatedEngine::new());
        let mut vm = vm(engine.clone());
        assert!(matches!(
            vm.stop(),
            Err(VmError::InvalidState {
                actual: LifecycleState::Created,
                ..
            })
        ));

        vm.start().unwrap();
        vm.stop().unwrap();
        assert_eq!(vm.state(), LifecycleState::Stopped);

        // Stopped is not restartable
        assert!(matches!(
            vm.start(),
            Err(VmError::InvalidState {
                actual: LifecycleState::Stopped,
                ..
            })
        ));
        assert_eq!(engine.boots(), 1);

        vm.terminate().unwrap();
        assert!(matches!(vm.stop(), Err(VmError::InvalidState { .. })));
    }

    #[test]
    fn test_terminate_is_idempotent() {
        let engine = Arc::new(SimulatedEngine::new());
        let mut vm = vm(engine.clone());
        vm.start().unwrap();
        vm.terminate().unwrap();
        vm.terminate().unwrap();
        assert_eq!(vm.state(), LifecycleState::Terminated);
        assert_eq!(engine.running_count(), 0);
    }

    #[test]
    fn test_boot_failure_leaves_created() {
        let engine = Arc::new(SimulatedEngine::new());
        engine.fail_boot_of("uvm");
        let mut vm = vm(engine);
        assert!(matches!(vm.start(), Err(VmError::Boot(_))));
        assert_eq!(vm.state(), LifecycleState::Created);
    }
}
