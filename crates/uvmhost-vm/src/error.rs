//! Error types for uvmhost-vm.

use crate::bus::AttachPoint;
use crate::machine::LifecycleState;
use thiserror::Error;

/// Result type alias for uvmhost-vm operations.
pub type Result<T> = std::result::Result<T, VmError>;

/// Errors raised by the utility VM primitives and the execution engine.
#[derive(Debug, Error)]
pub enum VmError {
    /// Invalid VM configuration
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The engine failed to boot a descriptor
    #[error("boot failed: {0}")]
    Boot(String),

    /// The engine failed to shut a handle down
    #[error("shutdown failed: {0}")]
    Shutdown(String),

    /// Hot-adding a backing volume failed
    #[error("attach at {point} failed: {reason}")]
    Attach {
        /// Attachment point that was being added
        point: AttachPoint,
        /// Engine supplied reason
        reason: String,
    },

    /// Hot-removing a backing volume failed
    #[error("detach at {point} failed: {reason}")]
    Detach {
        /// Attachment point that was being removed
        point: AttachPoint,
        /// Engine supplied reason
        reason: String,
    },

    /// Running a command inside a unit failed
    #[error("exec failed: {0}")]
    Exec(String),

    /// Not enough free slots on the storage bus
    #[error("storage bus exhausted: need {needed} slot(s), {free} of {capacity} free")]
    BusExhausted {
        /// Slots requested
        needed: usize,
        /// Slots currently free
        free: usize,
        /// Total bus capacity
        capacity: usize,
    },

    /// Operation not valid in the current lifecycle state
    #[error("invalid state: expected {expected}, got {actual}")]
    InvalidState {
        /// Expected state(s)
        expected: String,
        /// Actual state
        actual: LifecycleState,
    },
}
