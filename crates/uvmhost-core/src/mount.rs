//! Storage mount coordination.
//!
//! The [`MountCoordinator`] attaches layer sets onto the storage bus of a
//! hosting VM and reference counts the result. One mount record exists per
//! (layer set, hosting VM) pair; containers mounting the same pair share
//! it, and its attachments are released only when the last reference goes.
//!
//! All accounting for one hosting VM sits behind a single mutex, so mounts
//! and unmounts against the same bus form a linear history. Engine
//! hot-adds run while that mutex is held.

use crate::config::{HostConfig, ReadOnlyBacking};
use crate::error::{CoreError, Phase, Result};
use crate::layers::LayerSet;
use crate::sync::{lock, read, write};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use uvmhost_vm::{AttachPoint, Attachment, SlotId, StorageBus, VmEngine, VmError};

// ============================================================================
// Public types
// ============================================================================

/// How much of a mount record an unmount releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnmountScope {
    /// Drop one reference
    ThisContainer,
    /// Drop every reference and release the record
    All,
}

/// One layer attached inside a hosting VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MountedLayer {
    /// Host path of the layer
    pub path: PathBuf,
    /// Whether the layer is read-only
    pub read_only: bool,
    /// Where it is attached
    pub point: AttachPoint,
}

impl MountedLayer {
    fn attachment(&self) -> Attachment {
        Attachment {
            path: self.path.clone(),
            read_only: self.read_only,
            point: self.point,
        }
    }
}

/// Composed root of a mounted layer set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MountedRoot {
    /// Hosting VM the layers are attached to
    pub host: String,
    /// Guest path of the composed root
    pub root_path: String,
    /// Attached layers, base first and scratch last
    pub layers: Vec<MountedLayer>,
}

impl MountedRoot {
    /// Number of bus slots this root holds.
    pub fn slot_count(&self) -> usize {
        self.layers
            .iter()
            .filter(|l| matches!(l.point, AttachPoint::Slot(_)))
            .count()
    }
}

/// Point-in-time view of one hosting VM's storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BusSnapshot {
    /// Bus capacity
    pub capacity: usize,
    /// Slots allocated
    pub slots_in_use: usize,
    /// Active shared-folder mappings
    pub shares: usize,
    /// Active mount records
    pub records: usize,
    /// Sum of reference counts across records
    pub references: usize,
}

// ============================================================================
// Per-host accounting
// ============================================================================

#[derive(Debug)]
struct Share {
    index: u32,
    refs: usize,
}

#[derive(Debug)]
struct MountRecord {
    root: MountedRoot,
    refs: usize,
}

#[derive(Debug)]
struct HostStorage {
    id: String,
    bus: StorageBus,
    shares: HashMap<PathBuf, Share>,
    next_share: u32,
    records: HashMap<LayerSet, MountRecord>,
    next_root: u64,
    closed: bool,
}

impl HostStorage {
    fn new(id: &str, capacity: usize) -> Self {
        Self {
            id: id.to_string(),
            bus: StorageBus::new(capacity),
            shares: HashMap::new(),
            next_share: 0,
            records: HashMap::new(),
            next_root: 0,
            closed: false,
        }
    }

    fn attach(
        &mut self,
        engine: &dyn VmEngine,
        path: &Path,
        read_only: bool,
        backing: ReadOnlyBacking,
        reserved: &mut impl Iterator<Item = SlotId>,
    ) -> std::result::Result<MountedLayer, VmError> {
        if read_only && backing == ReadOnlyBacking::SharedFolder {
            if let Some(share) = self.shares.get_mut(path) {
                share.refs += 1;
                tracing::debug!(vm_id = %self.id, layer = %path.display(), share = share.index, refs = share.refs, "Reusing shared folder");
                return Ok(MountedLayer {
                    path: path.to_path_buf(),
                    read_only,
                    point: AttachPoint::Share(share.index),
                });
            }

            let index = self.next_share;
            let layer = MountedLayer {
                path: path.to_path_buf(),
                read_only,
                point: AttachPoint::Share(index),
            };
            engine.hot_add(&self.id, &layer.attachment())?;
            self.next_share += 1;
            self.shares.insert(layer.path.clone(), Share { index, refs: 1 });
            tracing::debug!(vm_id = %self.id, layer = %path.display(), share = index, "Shared folder added");
            return Ok(layer);
        }

        let slot = match reserved.next() {
            Some(slot) => slot,
            None => self.bus.allocate()?,
        };
        let layer = MountedLayer {
            path: path.to_path_buf(),
            read_only,
            point: AttachPoint::Slot(slot),
        };
        if let Err(e) = engine.hot_add(&self.id, &layer.attachment()) {
            self.bus.release(slot);
            return Err(e);
        }
        tracing::debug!(vm_id = %self.id, layer = %path.display(), %slot, read_only, "Slot attached");
        Ok(layer)
    }

    /// Accounting is released even when the engine refuses the detach.
    fn detach(&mut self, engine: &dyn VmEngine, layer: &MountedLayer) -> std::result::Result<(), VmError> {
        match layer.point {
            AttachPoint::Share(_) => {
                let Some(share) = self.shares.get_mut(&layer.path) else {
                    return Ok(());
                };
                share.refs -= 1;
                if share.refs > 0 {
                    return Ok(());
                }
                self.shares.remove(&layer.path);
                engine.hot_remove(&self.id, &layer.attachment())
            }
            AttachPoint::Slot(slot) => {
                let result = engine.hot_remove(&self.id, &layer.attachment());
                self.bus.release(slot);
                tracing::debug!(vm_id = %self.id, layer = %layer.path.display(), %slot, "Slot released");
                result
            }
        }
    }

    fn slots_needed(layers: &LayerSet, backing: ReadOnlyBacking) -> usize {
        match backing {
            ReadOnlyBacking::BusSlot => layers.len(),
            ReadOnlyBacking::SharedFolder => 1,
        }
    }
}

// ============================================================================
// Coordinator
// ============================================================================

/// Attaches layer sets to hosting VM storage buses and tracks references.
pub struct MountCoordinator {
    engine: Arc<dyn VmEngine>,
    backing: ReadOnlyBacking,
    root_prefix: String,
    hosts: RwLock<HashMap<String, Arc<Mutex<HostStorage>>>>,
}

impl fmt::Debug for MountCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MountCoordinator")
            .field("backing", &self.backing)
            .field("root_prefix", &self.root_prefix)
            .field("hosts", &read(&self.hosts).len())
            .finish_non_exhaustive()
    }
}

impl MountCoordinator {
    /// Create a coordinator with no hosting VMs registered.
    pub fn new(engine: Arc<dyn VmEngine>, config: &HostConfig) -> Self {
        Self {
            engine,
            backing: config.read_only_backing,
            root_prefix: config.root_prefix.trim_end_matches('/').to_string(),
            hosts: RwLock::new(HashMap::new()),
        }
    }

    /// Give hosting VM `vm` a fresh, empty storage bus.
    ///
    /// # Errors
    /// Returns a configuration error if `vm` is already registered or the
    /// capacity is zero.
    pub fn register_host(&self, vm: &str, capacity: usize) -> Result<()> {
        if capacity == 0 {
            return Err(CoreError::config(vm, "bus capacity must be > 0"));
        }
        let mut hosts = write(&self.hosts);
        if hosts.contains_key(vm) {
            return Err(CoreError::config(vm, "hosting VM already has a storage bus"));
        }
        hosts.insert(vm.to_string(), Arc::new(Mutex::new(HostStorage::new(vm, capacity))));
        tracing::debug!(vm_id = %vm, capacity, "Storage bus registered");
        Ok(())
    }

    /// Drop hosting VM `vm`'s storage bus.
    ///
    /// Returns how many mount records were still active; they are
    /// abandoned along with the bus.
    pub fn deregister_host(&self, vm: &str) -> usize {
        let Some(storage) = write(&self.hosts).remove(vm) else {
            return 0;
        };
        let mut host = lock(&storage);
        host.closed = true;
        let leaked = host.records.len();
        if leaked > 0 {
            tracing::warn!(vm_id = %vm, records = leaked, "Storage bus dropped with active mounts");
        } else {
            tracing::debug!(vm_id = %vm, "Storage bus deregistered");
        }
        leaked
    }

    /// Whether `vm` has a storage bus.
    pub fn is_registered(&self, vm: &str) -> bool {
        read(&self.hosts).contains_key(vm)
    }

    fn storage(&self, vm: &str) -> Option<Arc<Mutex<HostStorage>>> {
        read(&self.hosts).get(vm).cloned()
    }

    /// Mount `layers` onto hosting VM `vm`.
    ///
    /// Reuses the existing record for the pair when there is one, adding a
    /// reference. Otherwise every layer is attached in declared order and a
    /// new record is created with one reference. A failed attach detaches
    /// whatever this call attached before returning, leaving the bus as it
    /// was.
    ///
    /// # Errors
    /// - [`CoreError::HostNotFound`] if `vm` has no storage bus
    /// - [`CoreError::CapacityExceeded`] if the bus lacks free slots
    /// - [`CoreError::Engine`] if the engine refuses an attach
    pub fn mount(&self, vm: &str, layers: &LayerSet) -> Result<MountedRoot> {
        let storage = self.storage(vm).ok_or_else(|| CoreError::HostNotFound {
            vm: vm.to_string(),
            phase: Phase::Mount,
        })?;
        let mut host = lock(&storage);
        if host.closed {
            return Err(CoreError::HostNotFound {
                vm: vm.to_string(),
                phase: Phase::Mount,
            });
        }

        if let Some(record) = host.records.get_mut(layers) {
            record.refs += 1;
            tracing::debug!(vm_id = %vm, root = %record.root.root_path, refs = record.refs, "Mount record reused");
            return Ok(record.root.clone());
        }

        let needed = HostStorage::slots_needed(layers, self.backing);
        let mut reserved = match host.bus.allocate_many(needed) {
            Ok(slots) => slots.into_iter(),
            Err(VmError::BusExhausted {
                needed,
                free,
                capacity,
            }) => {
                tracing::debug!(vm_id = %vm, needed, free, "Mount rejected, bus full");
                return Err(CoreError::CapacityExceeded {
                    vm: vm.to_string(),
                    needed,
                    free,
                    capacity,
                });
            }
            Err(source) => return Err(CoreError::engine(vm, Phase::Mount, source)),
        };

        let mut attached: Vec<MountedLayer> = Vec::with_capacity(layers.len());
        for (path, read_only) in layers.entries() {
            match host.attach(self.engine.as_ref(), path, read_only, self.backing, &mut reserved) {
                Ok(layer) => attached.push(layer),
                Err(source) => {
                    tracing::debug!(vm_id = %vm, layer = %path.display(), attached = attached.len(), "Attach failed, rolling back");
                    for layer in attached.iter().rev() {
                        if let Err(e) = host.detach(self.engine.as_ref(), layer) {
                            tracing::warn!(vm_id = %vm, layer = %layer.path.display(), error = %e, "Rollback detach failed");
                        }
                    }
                    for slot in reserved {
                        host.bus.release(slot);
                    }
                    return Err(CoreError::engine(vm, Phase::Mount, source));
                }
            }
        }
        debug_assert!(reserved.next().is_none());

        let root_path = format!("{}/{}", self.root_prefix, host.next_root);
        host.next_root += 1;
        let root = MountedRoot {
            host: vm.to_string(),
            root_path,
            layers: attached,
        };
        host.records.insert(
            layers.clone(),
            MountRecord {
                root: root.clone(),
                refs: 1,
            },
        );
        tracing::info!(vm_id = %vm, root = %root.root_path, layers = layers.len(), slots = root.slot_count(), "Layers mounted");
        Ok(root)
    }

    /// Release a reference to the record for (`layers`, `vm`).
    ///
    /// When the count reaches zero every layer is detached in reverse
    /// order and the record removed. A missing host or record is a no-op.
    /// Detach failures are reported after all layers were processed; the
    /// bus accounting is released regardless.
    pub fn unmount(&self, vm: &str, layers: &LayerSet, scope: UnmountScope) -> Result<()> {
        let Some(storage) = self.storage(vm) else {
            tracing::trace!(vm_id = %vm, "Unmount on unknown host ignored");
            return Ok(());
        };
        let mut host = lock(&storage);
        if host.closed {
            return Ok(());
        }

        let remaining = match host.records.get_mut(layers) {
            Some(record) => {
                record.refs = match scope {
                    UnmountScope::ThisContainer => record.refs.saturating_sub(1),
                    UnmountScope::All => 0,
                };
                record.refs
            }
            None => {
                tracing::trace!(vm_id = %vm, "Unmount of unknown record ignored");
                return Ok(());
            }
        };
        if remaining > 0 {
            tracing::debug!(vm_id = %vm, refs = remaining, "Mount reference dropped");
            return Ok(());
        }

        let Some(record) = host.records.remove(layers) else {
            return Ok(());
        };
        let mut first_error = None;
        for layer in record.root.layers.iter().rev() {
            if let Err(e) = host.detach(self.engine.as_ref(), layer) {
                tracing::warn!(vm_id = %vm, layer = %layer.path.display(), error = %e, "Detach failed");
                first_error.get_or_insert(e);
            }
        }
        tracing::info!(vm_id = %vm, root = %record.root.root_path, "Layers unmounted");

        match first_error {
            Some(source) => Err(CoreError::engine(vm, Phase::Unmount, source)),
            None => Ok(()),
        }
    }

    /// Current reference count of the record for (`layers`, `vm`); 0 if
    /// there is none.
    pub fn ref_count(&self, vm: &str, layers: &LayerSet) -> usize {
        let Some(storage) = self.storage(vm) else {
            return 0;
        };
        let host = lock(&storage);
        host.records.get(layers).map_or(0, |r| r.refs)
    }

    /// Slots allocated on `vm`'s bus.
    pub fn slots_in_use(&self, vm: &str) -> Option<usize> {
        let storage = self.storage(vm)?;
        let host = lock(&storage);
        Some(host.bus.in_use())
    }

    /// Snapshot of `vm`'s storage accounting.
    pub fn snapshot(&self, vm: &str) -> Option<BusSnapshot> {
        let storage = self.storage(vm)?;
        let host = lock(&storage);
        Some(BusSnapshot {
            capacity: host.bus.capacity(),
            slots_in_use: host.bus.in_use(),
            shares: host.shares.len(),
            records: host.records.len(),
            references: host.records.values().map(|r| r.refs).sum(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uvmhost_vm::SimulatedEngine;

    fn coordinator(backing: ReadOnlyBacking) -> (Arc<SimulatedEngine>, MountCoordinator) {
        let engine = Arc::new(SimulatedEngine::new());
        let config = HostConfig::builder().read_only_backing(backing).build().unwrap();
        let mounts = MountCoordinator::new(engine.clone(), &config);
        mounts.register_host("uvm", 8).unwrap();
        (engine, mounts)
    }

    fn set(paths: &[&str]) -> LayerSet {
        LayerSet::new(paths.iter().copied()).unwrap()
    }

    #[test]
    fn test_mount_shares_record() {
        let (_engine, mounts) = coordinator(ReadOnlyBacking::SharedFolder);
        let layers = set(&["/base", "/app", "/s1"]);

        let first = mounts.mount("uvm", &layers).unwrap();
        let second = mounts.mount("uvm", &layers).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.root_path, "/c/0");
        assert_eq!(mounts.ref_count("uvm", &layers), 2);
        assert_eq!(mounts.slots_in_use("uvm"), Some(1));

        mounts.unmount("uvm", &layers, UnmountScope::ThisContainer).unwrap();
        assert_eq!(mounts.ref_count("uvm", &layers), 1);
        mounts.unmount("uvm", &layers, UnmountScope::ThisContainer).unwrap();
        assert_eq!(mounts.ref_count("uvm", &layers), 0);
        assert_eq!(mounts.slots_in_use("uvm"), Some(0));
    }

    #[test]
    fn test_shared_folders_are_refcounted_per_path() {
        let (engine, mounts) = coordinator(ReadOnlyBacking::SharedFolder);
        let a = set(&["/base", "/s1"]);
        let b = set(&["/base", "/s2"]);

        mounts.mount("uvm", &a).unwrap();
        mounts.mount("uvm", &b).unwrap();
        assert_eq!(mounts.snapshot("uvm").unwrap().shares, 1);
        assert_eq!(mounts.slots_in_use("uvm"), Some(2));

        mounts.unmount("uvm", &a, UnmountScope::ThisContainer).unwrap();
        assert!(engine.is_attached("uvm", Path::new("/base")));
        mounts.unmount("uvm", &b, UnmountScope::ThisContainer).unwrap();
        assert!(!engine.is_attached("uvm", Path::new("/base")));
        assert!(engine.attachments("uvm").is_empty());
    }

    #[test]
    fn test_bus_slot_backing_uses_one_slot_per_layer() {
        let (_engine, mounts) = coordinator(ReadOnlyBacking::BusSlot);
        let root = mounts.mount("uvm", &set(&["/base", "/app", "/s1"])).unwrap();
        assert_eq!(root.slot_count(), 3);
        assert_eq!(mounts.slots_in_use("uvm"), Some(3));
    }

    #[test]
    fn test_capacity_exceeded_leaves_accounting() {
        let (_engine, mounts) = coordinator(ReadOnlyBacking::BusSlot);
        mounts.mount("uvm", &set(&["/a", "/b", "/c", "/d", "/e", "/s1"])).unwrap();
        let before = mounts.snapshot("uvm").unwrap();

        let err = mounts.mount("uvm", &set(&["/a", "/b", "/s2"])).unwrap_err();
        assert!(matches!(
            err,
            CoreError::CapacityExceeded { needed: 3, free: 2, capacity: 8, .. }
        ));
        assert_eq!(mounts.snapshot("uvm").unwrap(), before);
    }

    #[test]
    fn test_attach_failure_rolls_back() {
        let (engine, mounts) = coordinator(ReadOnlyBacking::BusSlot);
        engine.fail_attach_of("/s1");
        let layers = set(&["/base", "/app", "/s1"]);

        let err = mounts.mount("uvm", &layers).unwrap_err();
        assert!(matches!(err, CoreError::Engine { phase: Phase::Mount, .. }));
        assert_eq!(mounts.slots_in_use("uvm"), Some(0));
        assert!(engine.attachments("uvm").is_empty());
        assert_eq!(mounts.ref_count("uvm", &layers), 0);
    }

    #[test]
    fn test_early_attach_failure_returns_reserved_slots() {
        let (engine, mounts) = coordinator(ReadOnlyBacking::BusSlot);
        engine.fail_attach_of("/base");
        let layers = set(&["/base", "/app", "/s1"]);

        assert!(mounts.mount("uvm", &layers).is_err());
        assert_eq!(mounts.slots_in_use("uvm"), Some(0));

        engine.clear_failures();
        let root = mounts.mount("uvm", &layers).unwrap();
        let points: Vec<AttachPoint> = root.layers.iter().map(|l| l.point).collect();
        assert_eq!(
            points,
            vec![
                AttachPoint::Slot(SlotId::new(0)),
                AttachPoint::Slot(SlotId::new(1)),
                AttachPoint::Slot(SlotId::new(2)),
            ]
        );
    }

    #[test]
    fn test_detach_failure_still_frees_slot() {
        let (engine, mounts) = coordinator(ReadOnlyBacking::SharedFolder);
        let layers = set(&["/base", "/s1"]);
        mounts.mount("uvm", &layers).unwrap();
        engine.fail_detach_of("/s1");

        let err = mounts.unmount("uvm", &layers, UnmountScope::All).unwrap_err();
        assert!(matches!(err, CoreError::Engine { phase: Phase::Unmount, .. }));
        assert_eq!(mounts.slots_in_use("uvm"), Some(0));
        assert_eq!(mounts.snapshot("uvm").unwrap().records, 0);
    }

    #[test]
    fn test_unknown_host_and_record() {
        let (_engine, mounts) = coordinator(ReadOnlyBacking::SharedFolder);
        let layers = set(&["/base", "/s1"]);
        assert!(mounts.unmount("nope", &layers, UnmountScope::All).is_ok());
        assert!(mounts.unmount("uvm", &layers, UnmountScope::ThisContainer).is_ok());
        assert!(matches!(
            mounts.mount("nope", &layers),
            Err(CoreError::HostNotFound { phase: Phase::Mount, .. })
        ));
    }

    #[test]
    fn test_register_twice_and_deregister() {
        let (_engine, mounts) = coordinator(ReadOnlyBacking::SharedFolder);
        assert!(mounts.register_host("uvm", 8).is_err());
        assert!(mounts.register_host("other", 0).is_err());

        mounts.mount("uvm", &set(&["/s1"])).unwrap();
        assert_eq!(mounts.deregister_host("uvm"), 1);
        assert!(!mounts.is_registered("uvm"));
        assert_eq!(mounts.deregister_host("uvm"), 0);
    }
}
