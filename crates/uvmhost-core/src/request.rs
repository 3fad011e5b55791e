//! Creation requests as surfaced to callers.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use uvmhost_vm::ResourceLimits;

/// Option key selecting the schema version (`"1.0"` or `"2.0"`).
pub const OPTION_SCHEMA_VERSION: &str = "schema_version";

/// Option key marking a request as creating a new utility VM.
pub const OPTION_IS_UTILITY_VM: &str = "is_utility_vm";

/// Hyper-V isolation settings of a legacy request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HyperVSettings {
    /// Explicit utility VM image; located among the layers when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub utility_vm_path: Option<PathBuf>,
}

/// A request to create a hosted container or a utility VM.
///
/// ```
/// use uvmhost_core::CreateRequest;
///
/// let request = CreateRequest::new()
///     .id("web")
///     .hosted_in("uvm-1")
///     .layer_folders(["/layers/base", "/layers/app", "/scratch/web"]);
/// assert_eq!(request.hosting_system.as_deref(), Some("uvm-1"));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CreateRequest {
    /// Identity; generated when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Owner tag passed through to the engine
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    /// Identity of the utility VM that should host the container
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hosting_system: Option<String>,
    /// Ordered layers; the last is the writable scratch
    pub layer_folders: Vec<PathBuf>,
    /// Memory and vCPU ceilings
    pub resources: ResourceLimits,
    /// Legacy Hyper-V isolation settings
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hyper_v: Option<HyperVSettings>,
    /// Free-form options keyed by recognized option names
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub options: BTreeMap<String, String>,
}

impl CreateRequest {
    /// Create an empty request.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the identity.
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Set the owner tag.
    pub fn owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    /// Host the container in an existing utility VM.
    pub fn hosted_in(mut self, vm_id: impl Into<String>) -> Self {
        self.hosting_system = Some(vm_id.into());
        self
    }

    /// Set the layer folders; the last is the scratch.
    pub fn layer_folders<I, P>(mut self, folders: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.layer_folders = folders.into_iter().map(Into::into).collect();
        self
    }

    /// Set the resource limits.
    pub fn resources(mut self, limits: ResourceLimits) -> Self {
        self.resources = limits;
        self
    }

    /// Attach Hyper-V isolation settings.
    pub fn hyper_v(mut self, settings: HyperVSettings) -> Self {
        self.hyper_v = Some(settings);
        self
    }

    /// Set a free-form option.
    pub fn option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    /// Set the schema version option.
    pub fn schema(self, version: impl Into<String>) -> Self {
        self.option(OPTION_SCHEMA_VERSION, version)
    }

    /// Mark the request as creating a utility VM.
    pub fn utility_vm(self) -> Self {
        self.option(OPTION_IS_UTILITY_VM, "yes")
    }
}
