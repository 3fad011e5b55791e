//! Interfaces to the external VM execution engine.
//!
//! The engine is the hypervisor-facing collaborator: it boots and shuts
//! down units described by a [`VmDescriptor`] and hot-adds backing volumes
//! onto a utility VM's storage bus. Everything above this module talks to
//! the engine only through these traits.

use crate::bus::AttachPoint;
use crate::config::ResourceLimits;
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Opaque handle to a unit booted by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EngineHandle(u64);

impl EngineHandle {
    /// Wrap an engine-assigned handle value.
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    /// Raw handle value.
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for EngineHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// What kind of unit a descriptor boots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Role {
    /// A utility VM that hosts other containers.
    UtilityVm,
    /// A container hosted inside an existing utility VM.
    Hosted {
        /// Identity of the hosting utility VM.
        host_id: String,
    },
    /// A VM-isolated container with its own private utility VM.
    Standalone,
}

/// Everything the engine needs to boot a unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmDescriptor {
    /// Unit identity.
    pub id: String,
    /// Owner tag, if any.
    pub owner: Option<String>,
    /// Unit kind.
    pub role: Role,
    /// Resource ceilings.
    pub limits: ResourceLimits,
    /// Utility VM boot image folder.
    pub image_path: Option<PathBuf>,
    /// Composed root filesystem path inside the hosting VM.
    pub root_path: Option<String>,
}

/// A backing volume being hot-added to, or removed from, a utility VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    /// Host path of the layer folder.
    pub path: PathBuf,
    /// Whether the guest sees the volume read-only.
    pub read_only: bool,
    /// Where the volume is attached.
    pub point: AttachPoint,
}

/// Captured result of a command run inside a unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutput {
    /// Standard output.
    pub stdout: String,
    /// Process exit code.
    pub exit_code: i32,
}

/// The hypervisor-facing execution engine.
///
/// All calls block until the engine has finished or failed.
pub trait VmEngine: Send + Sync {
    /// Boot the unit described by `descriptor`.
    fn boot(&self, descriptor: &VmDescriptor) -> Result<EngineHandle>;

    /// Shut a booted unit down.
    fn shutdown(&self, handle: &EngineHandle) -> Result<()>;

    /// Hot-add a backing volume onto `host_id`'s storage.
    ///
    /// Engines that attach storage as part of boot can accept the default.
    fn hot_add(&self, host_id: &str, attachment: &Attachment) -> Result<()> {
        tracing::trace!(host_id, point = %attachment.point, "hot_add not supported by engine, ignoring");
        Ok(())
    }

    /// Hot-remove a backing volume from `host_id`'s storage.
    fn hot_remove(&self, host_id: &str, attachment: &Attachment) -> Result<()> {
        tracing::trace!(host_id, point = %attachment.point, "hot_remove not supported by engine, ignoring");
        Ok(())
    }
}

/// Command execution channel into a running unit.
pub trait CommandChannel: Send + Sync {
    /// Run `command` in `working_dir` inside the unit behind `handle`.
    fn run(&self, handle: &EngineHandle, command: &str, working_dir: &str) -> Result<CommandOutput>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_display() {
        assert_eq!(EngineHandle::new(255).to_string(), "0xff");
    }

    #[test]
    fn test_role_serialization() {
        let role = Role::Hosted {
            host_id: "uvm".into(),
        };
        let json = serde_json::to_string(&role).unwrap();
        assert_eq!(json, r#"{"kind":"hosted","host_id":"uvm"}"#);
    }
}
