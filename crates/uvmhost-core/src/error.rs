//! Error types for uvmhost-core.

use std::fmt;
use thiserror::Error;
use uvmhost_vm::{LifecycleState, VmError};

/// Result type alias for uvmhost-core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Lifecycle phase an error was raised in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Request validation and construction
    Create,
    /// Attaching layers to a storage bus
    Mount,
    /// Booting
    Start,
    /// Graceful stop
    Stop,
    /// Termination
    Terminate,
    /// Detaching layers from a storage bus
    Unmount,
    /// Running a command inside a container
    Exec,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Create => "create",
            Phase::Mount => "mount",
            Phase::Start => "start",
            Phase::Stop => "stop",
            Phase::Terminate => "terminate",
            Phase::Unmount => "unmount",
            Phase::Exec => "exec",
        };
        f.write_str(name)
    }
}

/// Errors that can occur while creating or driving hosted containers and
/// their utility VMs.
///
/// Every variant names the identity (container or VM) it concerns; use
/// [`CoreError::id`] and [`CoreError::phase`] to target a retry.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Invalid or contradictory request
    #[error("create '{id}': invalid configuration: {reason}")]
    Configuration {
        /// Identity of the unit being created
        id: String,
        /// What is wrong with the request
        reason: String,
    },

    /// Not enough free slots on a hosting VM's storage bus
    #[error("mount on '{vm}': capacity exceeded, need {needed} slot(s), {free} of {capacity} free")]
    CapacityExceeded {
        /// Hosting VM whose bus is full
        vm: String,
        /// Slots the mount needed
        needed: usize,
        /// Slots free at the time
        free: usize,
        /// Bus capacity
        capacity: usize,
    },

    /// Zero or otherwise unusable resource limits
    #[error("create '{id}': invalid resource limits: {reason}")]
    ResourceLimitInvalid {
        /// Identity of the unit being created
        id: String,
        /// Which limit was rejected
        reason: String,
    },

    /// Start requested on a unit that is past `Created`
    #[error("start '{id}': cannot start from state {state}")]
    AlreadyRunning {
        /// Unit identity
        id: String,
        /// State the unit was in
        state: LifecycleState,
    },

    /// Operation not valid in the unit's current state
    #[error("{phase} '{id}': state is {state}, expected {expected}")]
    InvalidState {
        /// Unit identity
        id: String,
        /// Phase that was attempted
        phase: Phase,
        /// State the unit was in
        state: LifecycleState,
        /// What the operation required
        expected: String,
    },

    /// The engine failed to boot a unit
    #[error("start '{id}': {source}")]
    StartFailure {
        /// Unit identity
        id: String,
        /// Engine error
        #[source]
        source: VmError,
    },

    /// Any other engine failure (attach, detach, shutdown, exec)
    #[error("{phase} '{id}': {source}")]
    Engine {
        /// Unit identity
        id: String,
        /// Phase the engine call belonged to
        phase: Phase,
        /// Engine error
        #[source]
        source: VmError,
    },

    /// A hosting VM still has live hosted containers
    #[error("terminate '{}': still hosting {} container(s): {}", .vm, .hosted.len(), .hosted.join(", "))]
    HostBusy {
        /// Hosting VM identity
        vm: String,
        /// Containers still hosted
        hosted: Vec<String>,
    },

    /// The referenced hosting VM does not exist or is terminated
    #[error("{phase} '{vm}': hosting VM not found")]
    HostNotFound {
        /// Hosting VM identity
        vm: String,
        /// Phase that needed the VM
        phase: Phase,
    },

    /// Several cleanup steps failed; every step was still attempted
    #[error("terminate '{}': {} step(s) failed: {}", .id, .failures.len(), summarize(.failures))]
    Teardown {
        /// Identity whose teardown failed
        id: String,
        /// Individual failures in the order they happened
        failures: Vec<CoreError>,
    },
}

impl CoreError {
    /// Identity of the container or VM the error concerns.
    pub fn id(&self) -> &str {
        match self {
            CoreError::Configuration { id, .. }
            | CoreError::ResourceLimitInvalid { id, .. }
            | CoreError::AlreadyRunning { id, .. }
            | CoreError::InvalidState { id, .. }
            | CoreError::StartFailure { id, .. }
            | CoreError::Engine { id, .. }
            | CoreError::Teardown { id, .. } => id,
            CoreError::CapacityExceeded { vm, .. }
            | CoreError::HostBusy { vm, .. }
            | CoreError::HostNotFound { vm, .. } => vm,
        }
    }

    /// Phase the error was raised in.
    pub fn phase(&self) -> Phase {
        match self {
            CoreError::Configuration { .. } | CoreError::ResourceLimitInvalid { .. } => {
                Phase::Create
            }
            CoreError::CapacityExceeded { .. } => Phase::Mount,
            CoreError::AlreadyRunning { .. } | CoreError::StartFailure { .. } => Phase::Start,
            CoreError::InvalidState { phase, .. }
            | CoreError::Engine { phase, .. }
            | CoreError::HostNotFound { phase, .. } => *phase,
            CoreError::HostBusy { .. } | CoreError::Teardown { .. } => Phase::Terminate,
        }
    }

    pub(crate) fn config(id: &str, reason: impl fmt::Display) -> Self {
        CoreError::Configuration {
            id: id.to_string(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn engine(id: &str, phase: Phase, source: VmError) -> Self {
        CoreError::Engine {
            id: id.to_string(),
            phase,
            source,
        }
    }

    /// Map a failed boot: a wrong-state refusal becomes `AlreadyRunning`.
    pub(crate) fn start(id: &str, source: VmError) -> Self {
        match source {
            VmError::InvalidState { actual, .. } => CoreError::AlreadyRunning {
                id: id.to_string(),
                state: actual,
            },
            source => CoreError::StartFailure {
                id: id.to_string(),
                source,
            },
        }
    }
}

/// Turn the failures of a fail-forward cleanup into a single result.
///
/// A lone failure is returned as-is; several are wrapped in
/// [`CoreError::Teardown`].
pub(crate) fn fail_forward(id: &str, mut failures: Vec<CoreError>) -> Result<()> {
    match failures.len() {
        0 => Ok(()),
        1 => Err(failures.remove(0)),
        _ => Err(CoreError::Teardown {
            id: id.to_string(),
            failures,
        }),
    }
}

fn summarize(failures: &[CoreError]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
