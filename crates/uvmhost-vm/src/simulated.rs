//! In-process engine that simulates boots and storage hot-adds.
//!
//! Used for dry-run planning and throughout the test suites. Failures can
//! be injected per unit identity or per layer path.

use crate::engine::{Attachment, CommandChannel, CommandOutput, EngineHandle, VmDescriptor, VmEngine};
use crate::error::{Result, VmError};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Debug, Default)]
struct SimState {
    running: HashMap<EngineHandle, VmDescriptor>,
    attached: HashMap<String, Vec<Attachment>>,
    boots: u64,
    fail_boot: HashSet<String>,
    fail_shutdown: HashSet<String>,
    fail_attach: HashSet<PathBuf>,
    fail_detach: HashSet<PathBuf>,
}

/// Engine that keeps all state in memory.
#[derive(Debug)]
pub struct SimulatedEngine {
    state: Mutex<SimState>,
    next_handle: AtomicU64,
}

impl Default for SimulatedEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedEngine {
    /// Create an engine with nothing booted.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SimState::default()),
            next_handle: AtomicU64::new(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make every boot of unit `id` fail.
    pub fn fail_boot_of(&self, id: &str) {
        self.lock().fail_boot.insert(id.to_string());
    }

    /// Make every shutdown of unit `id` fail.
    pub fn fail_shutdown_of(&self, id: &str) {
        self.lock().fail_shutdown.insert(id.to_string());
    }

    /// Make every hot-add of `path` fail.
    pub fn fail_attach_of(&self, path: impl Into<PathBuf>) {
        self.lock().fail_attach.insert(path.into());
    }

    /// Make every hot-remove of `path` fail.
    pub fn fail_detach_of(&self, path: impl Into<PathBuf>) {
        self.lock().fail_detach.insert(path.into());
    }

    /// Clear all injected failures.
    pub fn clear_failures(&self) {
        let mut state = self.lock();
        state.fail_boot.clear();
        state.fail_shutdown.clear();
        state.fail_attach.clear();
        state.fail_detach.clear();
    }

    /// Number of successful boots so far.
    pub fn boots(&self) -> u64 {
        self.lock().boots
    }

    /// Number of units currently booted.
    pub fn running_count(&self) -> usize {
        self.lock().running.len()
    }

    /// Whether the unit behind `handle` is booted.
    pub fn is_running(&self, handle: &EngineHandle) -> bool {
        self.lock().running.contains_key(handle)
    }

    /// Descriptor of the unit behind `handle`.
    pub fn descriptor(&self, handle: &EngineHandle) -> Option<VmDescriptor> {
        self.lock().running.get(handle).cloned()
    }

    /// Volumes currently attached to `host_id`, in attach order.
    pub fn attachments(&self, host_id: &str) -> Vec<Attachment> {
        self.lock().attached.get(host_id).cloned().unwrap_or_default()
    }

    /// Whether `path` is attached anywhere on `host_id`.
    pub fn is_attached(&self, host_id: &str, path: &Path) -> bool {
        self.lock()
            .attached
            .get(host_id)
            .is_some_and(|list| list.iter().any(|a| a.path == path))
    }
}

impl VmEngine for SimulatedEngine {
    fn boot(&self, descriptor: &VmDescriptor) -> Result<EngineHandle> {
        let mut state = self.lock();
        if state.fail_boot.contains(&descriptor.id) {
            return Err(VmError::Boot(format!("injected boot failure for {}", descriptor.id)));
        }
        let handle = EngineHandle::new(self.next_handle.fetch_add(1, Ordering::Relaxed));
        state.running.insert(handle, descriptor.clone());
        state.boots += 1;
        tracing::trace!(id = %descriptor.id, %handle, "Simulated boot");
        Ok(handle)
    }

    fn shutdown(&self, handle: &EngineHandle) -> Result<()> {
        let mut state = self.lock();
        let id = match state.running.get(handle) {
            Some(descriptor) => descriptor.id.clone(),
            None => return Err(VmError::Shutdown(format!("unknown handle {}", handle))),
        };
        if state.fail_shutdown.contains(&id) {
            return Err(VmError::Shutdown(format!("injected shutdown failure for {}", id)));
        }
        state.running.remove(handle);
        tracing::trace!(%id, %handle, "Simulated shutdown");
        Ok(())
    }

    fn hot_add(&self, host_id: &str, attachment: &Attachment) -> Result<()> {
        let mut state = self.lock();
        if state.fail_attach.contains(&attachment.path) {
            return Err(VmError::Attach {
                point: attachment.point,
                reason: format!("injected attach failure for {}", attachment.path.display()),
            });
        }
        state
            .attached
            .entry(host_id.to_string())
            .or_default()
            .push(attachment.clone());
        Ok(())
    }

    fn hot_remove(&self, host_id: &str, attachment: &Attachment) -> Result<()> {
        let mut state = self.lock();
        if state.fail_detach.contains(&attachment.path) {
            return Err(VmError::Detach {
                point: attachment.point,
                reason: format!("injected detach failure for {}", attachment.path.display()),
            });
        }
        if let Some(list) = state.attached.get_mut(host_id) {
            list.retain(|a| a.point != attachment.point);
            if list.is_empty() {
                state.attached.remove(host_id);
            }
        }
        Ok(())
    }
}

impl CommandChannel for SimulatedEngine {
    /// Understands `echo`, optionally wrapped in `cmd /s /c`.
    fn run(&self, handle: &EngineHandle, command: &str, working_dir: &str) -> Result<CommandOutput> {
        if !self.is_running(handle) {
            return Err(VmError::Exec(format!("unit {} is not running", handle)));
        }
        tracing::trace!(%handle, command, working_dir, "Simulated exec");

        let command = command.trim();
        let command = strip_prefix_ignore_case(command, "cmd /s /c ").unwrap_or(command);
        match strip_prefix_ignore_case(command, "echo ") {
            Some(text) => Ok(CommandOutput {
                stdout: format!("{}\n", text),
                exit_code: 0,
            }),
            None => Ok(CommandOutput {
                stdout: String::new(),
                exit_code: 127,
            }),
        }
    }
}

fn strip_prefix_ignore_case<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    let head = s.get(..prefix.len())?;
    if head.eq_ignore_ascii_case(prefix) {
        Some(&s[prefix.len()..])
    } else {
        None
    }
}
