//! JSON creation plans.
//!
//! A plan is an ordered list of creation requests. Each entry may ask for
//! a freshly provisioned scratch layer, for the created unit to be
//! started, and for a command to run inside a started container. Entries
//! run in order; a failed entry is reported and the run moves on.
//!
//! ```json
//! {
//!   "entries": [
//!     { "request": { "id": "uvm", "options": { "is_utility_vm": "true" },
//!                    "layer_folders": ["/layers/base"] },
//!       "provision_scratch": true, "start": true },
//!     { "request": { "id": "web", "hosting_system": "uvm",
//!                    "layer_folders": ["/layers/base", "/layers/app"] },
//!       "provision_scratch": true, "start": true, "run": "echo ready" }
//!   ]
//! }
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use uvmhost_core::{
    BusSnapshot, CoreError, CreateRequest, Created, HostedContainer, HostingVm,
    LifecycleOrchestrator, ScratchProvisioner,
};
use uvmhost_vm::{CommandChannel, CommandOutput, LifecycleState};

/// Working directory for plan commands.
const COMMAND_WORKING_DIR: &str = "/";

fn default_teardown() -> bool {
    true
}

/// An ordered list of creation requests.
#[derive(Debug, Clone, Deserialize)]
pub struct Plan {
    /// Entries, executed in order
    #[serde(default)]
    pub entries: Vec<PlanEntry>,

    /// Tear every created unit down after the last entry (default: true)
    #[serde(default = "default_teardown")]
    pub teardown: bool,
}

/// One step of a plan.
#[derive(Debug, Clone, Deserialize)]
pub struct PlanEntry {
    /// The creation request, decoded by [`PlanEntry::parse_request`]
    pub request: Value,

    /// Append a freshly provisioned scratch directory to the layers
    #[serde(default)]
    pub provision_scratch: bool,

    /// Start the unit after creating it
    #[serde(default)]
    pub start: bool,

    /// Command to run in the started container
    #[serde(default)]
    pub run: Option<String>,
}

impl Plan {
    /// Parse a plan from JSON.
    ///
    /// Requests are only checked for being JSON here; each one is decoded
    /// when its entry runs, so a bad request fails its own entry.
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}

impl PlanEntry {
    /// Identity named by the request, if any.
    pub fn request_id(&self) -> Option<&str> {
        self.request.get("id").and_then(Value::as_str)
    }

    /// Decode the creation request of the entry at `index`.
    ///
    /// # Errors
    /// Returns [`CoreError::ResourceLimitInvalid`] for a negative memory
    /// limit or vCPU count, and [`CoreError::Configuration`] for anything
    /// else that does not decode.
    pub fn parse_request(&self, index: usize) -> Result<CreateRequest, CoreError> {
        let id = self
            .request_id()
            .map(str::to_string)
            .unwrap_or_else(|| format!("entry {}", index));

        if let Some(resources) = self.request.get("resources") {
            for (field, limit) in [("memory_bytes", "memory limit"), ("vcpu_count", "vcpu count")] {
                let negative = resources
                    .get(field)
                    .and_then(Value::as_f64)
                    .is_some_and(|v| v < 0.0);
                if negative {
                    return Err(CoreError::ResourceLimitInvalid {
                        id,
                        reason: format!("{} must be > 0", limit),
                    });
                }
            }
        }

        serde_json::from_value(self.request.clone()).map_err(|e| CoreError::Configuration {
            id,
            reason: e.to_string(),
        })
    }
}

/// What an entry created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitKind {
    /// A hosted or standalone container
    Container,
    /// A utility VM able to host containers
    UtilityVm,
}

/// Outcome of one plan entry.
#[derive(Debug, Clone, Serialize)]
pub struct EntryReport {
    /// Position in the plan
    pub index: usize,
    /// Identity of the unit, as requested or as generated
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// What was created; absent when creation failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<UnitKind>,
    /// Hosting VM of a hosted container
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    /// Guest path of the composed root
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root_path: Option<String>,
    /// Scratch directory provisioned for the entry
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scratch: Option<PathBuf>,
    /// State once the run finished
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<LifecycleState>,
    /// Output of the entry's command
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<CommandOutput>,
    /// First failure of the entry
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl EntryReport {
    fn new(index: usize, id: Option<String>) -> Self {
        Self {
            index,
            id,
            kind: None,
            host: None,
            root_path: None,
            scratch: None,
            state: None,
            output: None,
            error: None,
        }
    }
}

/// Outcome of a whole plan run.
#[derive(Debug, Clone, Serialize)]
pub struct Report {
    /// One report per plan entry, in plan order
    pub entries: Vec<EntryReport>,
    /// Storage accounting per hosting VM, taken before teardown
    pub buses: BTreeMap<String, BusSnapshot>,
    /// Failures met while tearing down
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub teardown_errors: Vec<String>,
}

impl Report {
    /// Number of entries that failed.
    pub fn failed(&self) -> usize {
        self.entries.iter().filter(|e| e.error.is_some()).count()
    }
}

enum Unit {
    Container(HostedContainer),
    Vm(HostingVm),
}

impl Unit {
    fn state(&self) -> LifecycleState {
        match self {
            Unit::Container(c) => c.state(),
            Unit::Vm(vm) => vm.state(),
        }
    }

    /// Identity of the VM whose bus this unit owns, if any.
    fn owned_bus(&self) -> Option<&str> {
        match self {
            Unit::Container(c) if c.hosting_vm().is_none() => Some(c.host_id()),
            Unit::Container(_) => None,
            Unit::Vm(vm) => Some(vm.id()),
        }
    }
}

/// Executes plans against one orchestrator.
pub struct PlanRunner<'a> {
    orchestrator: &'a LifecycleOrchestrator,
    channel: &'a dyn CommandChannel,
    provisioner: &'a dyn ScratchProvisioner,
}

impl<'a> PlanRunner<'a> {
    /// Create a runner. Commands go through `channel`; scratch layers come
    /// from `provisioner`.
    pub fn new(
        orchestrator: &'a LifecycleOrchestrator,
        channel: &'a dyn CommandChannel,
        provisioner: &'a dyn ScratchProvisioner,
    ) -> Self {
        Self {
            orchestrator,
            channel,
            provisioner,
        }
    }

    /// Run every entry of `plan`, then tear down if the plan asks for it.
    pub fn run(&self, plan: &Plan) -> Report {
        let mut entries = Vec::with_capacity(plan.entries.len());
        let mut units: Vec<(usize, Unit)> = Vec::new();

        for (index, entry) in plan.entries.iter().enumerate() {
            let mut report = EntryReport::new(index, entry.request_id().map(str::to_string));
            match entry.parse_request(index) {
                Ok(request) => {
                    if let Some(unit) = self.execute(entry, request, &mut report) {
                        units.push((index, unit));
                    }
                }
                Err(e) => report.error = Some(e.to_string()),
            }
            if let Some(error) = &report.error {
                tracing::warn!(index, error = %error, "Plan entry failed");
            }
            entries.push(report);
        }

        let buses = units
            .iter()
            .filter_map(|(_, unit)| unit.owned_bus())
            .filter_map(|id| {
                self.orchestrator
                    .mounts()
                    .snapshot(id)
                    .map(|s| (id.to_string(), s))
            })
            .collect();

        let mut teardown_errors = Vec::new();
        if plan.teardown {
            teardown_errors = self.teardown(&mut units);
            for entry in &entries {
                if let Some(scratch) = &entry.scratch {
                    if let Err(e) = self.provisioner.remove_directory(scratch) {
                        teardown_errors.push(format!("{}: {}", scratch.display(), e));
                    }
                }
            }
        }

        for (index, unit) in &units {
            entries[*index].state = Some(unit.state());
        }

        tracing::info!(
            entries = entries.len(),
            created = units.len(),
            teardown_errors = teardown_errors.len(),
            "Plan finished"
        );

        Report {
            entries,
            buses,
            teardown_errors,
        }
    }

    fn execute(
        &self,
        entry: &PlanEntry,
        mut request: CreateRequest,
        report: &mut EntryReport,
    ) -> Option<Unit> {
        if entry.provision_scratch {
            match self.provisioner.create_scratch_directory() {
                Ok(scratch) => {
                    request.layer_folders.push(scratch.clone());
                    report.scratch = Some(scratch);
                }
                Err(e) => {
                    report.error = Some(format!("provisioning scratch layer: {}", e));
                    return None;
                }
            }
        }

        let mut unit = match self.orchestrator.create_ex(&request) {
            Ok(Created::Container(c)) => {
                report.kind = Some(UnitKind::Container);
                report.host = c.hosting_vm().map(str::to_string);
                report.root_path = Some(c.root().root_path.clone());
                Unit::Container(c)
            }
            Ok(Created::UtilityVm(vm)) => {
                report.kind = Some(UnitKind::UtilityVm);
                report.root_path = vm.boot_root().map(|r| r.root_path.clone());
                Unit::Vm(vm)
            }
            Err(e) => {
                report.error = Some(e.to_string());
                return None;
            }
        };
        report.id = Some(match &unit {
            Unit::Container(c) => c.id().to_string(),
            Unit::Vm(vm) => vm.id().to_string(),
        });

        if entry.start {
            let started = match &mut unit {
                Unit::Container(c) => self.orchestrator.containers().start(c),
                Unit::Vm(vm) => self.orchestrator.vms().start(vm),
            };
            if let Err(e) = started {
                report.error = Some(e.to_string());
                return Some(unit);
            }
        }

        if let Some(command) = &entry.run {
            match &unit {
                Unit::Container(c) => match c.run(self.channel, command, COMMAND_WORKING_DIR) {
                    Ok(output) => report.output = Some(output),
                    Err(e) => report.error = Some(e.to_string()),
                },
                Unit::Vm(vm) => {
                    report.error = Some(format!(
                        "{}: commands run in containers, not utility VMs",
                        vm.id()
                    ));
                }
            }
        }

        Some(unit)
    }

    /// Standalone containers first, then hosting VMs newest first.
    fn teardown(&self, units: &mut [(usize, Unit)]) -> Vec<String> {
        let mut errors = Vec::new();
        let mut record = |result: Result<(), CoreError>| {
            if let Err(e) = result {
                match e {
                    CoreError::Teardown { failures, .. } => {
                        errors.extend(failures.iter().map(|f| f.to_string()))
                    }
                    other => errors.push(other.to_string()),
                }
            }
        };

        for (_, unit) in units.iter_mut() {
            if let Unit::Container(c) = unit {
                if c.hosting_vm().is_none() {
                    record(self.orchestrator.containers().terminate(c));
                }
            }
        }
        for (_, unit) in units.iter_mut().rev() {
            if let Unit::Vm(vm) = unit {
                record(self.orchestrator.teardown_all(vm));
            }
        }

        errors
    }
}
