//! Non-owning index of hosting VMs and the containers they host.
//!
//! Containers are owned by their callers. The index only records which
//! container identities live in which hosting VM, together with a shared
//! handle to each container's runtime state so teardown can reach them.
//! Every hosting VM also carries a gate: container creation and
//! termination hold it shared, VM termination holds it exclusively.

use crate::container::ContainerCell;
use crate::layers::LayerSet;
use crate::sync::lock;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use uvmhost_vm::LifecycleState;

#[derive(Debug, Clone)]
pub(crate) struct HostedEntry {
    pub(crate) layers: LayerSet,
    pub(crate) cell: Arc<ContainerCell>,
}

#[derive(Debug)]
struct HostRecord {
    state: LifecycleState,
    gate: Arc<RwLock<()>>,
    hosted: BTreeMap<String, HostedEntry>,
}

#[derive(Debug, Default)]
struct IndexState {
    hosts: HashMap<String, HostRecord>,
    /// Every live identity, containers and VMs alike
    ids: HashSet<String>,
}

#[derive(Debug, Default)]
pub(crate) struct HostIndex {
    state: Mutex<IndexState>,
}

impl HostIndex {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Reserve `id`. False if it is already taken.
    pub(crate) fn claim(&self, id: &str) -> bool {
        lock(&self.state).ids.insert(id.to_string())
    }

    pub(crate) fn release(&self, id: &str) {
        lock(&self.state).ids.remove(id);
    }

    /// Register a hosting VM in state `Created`, claiming its identity.
    pub(crate) fn register_host(&self, id: &str) -> bool {
        let mut state = lock(&self.state);
        if !state.ids.insert(id.to_string()) {
            return false;
        }
        state.hosts.insert(
            id.to_string(),
            HostRecord {
                state: LifecycleState::Created,
                gate: Arc::new(RwLock::new(())),
                hosted: BTreeMap::new(),
            },
        );
        true
    }

    pub(crate) fn remove_host(&self, id: &str) {
        let mut state = lock(&self.state);
        state.hosts.remove(id);
        state.ids.remove(id);
    }

    pub(crate) fn set_host_state(&self, id: &str, next: LifecycleState) {
        if let Some(host) = lock(&self.state).hosts.get_mut(id) {
            host.state = next;
        }
    }

    pub(crate) fn host_state(&self, id: &str) -> Option<LifecycleState> {
        lock(&self.state).hosts.get(id).map(|h| h.state)
    }

    pub(crate) fn gate(&self, id: &str) -> Option<Arc<RwLock<()>>> {
        lock(&self.state).hosts.get(id).map(|h| h.gate.clone())
    }

    /// Record `container` as hosted in `host`. False if the host is gone.
    pub(crate) fn attach(&self, host: &str, container: &str, entry: HostedEntry) -> bool {
        match lock(&self.state).hosts.get_mut(host) {
            Some(record) => {
                record.hosted.insert(container.to_string(), entry);
                true
            }
            None => false,
        }
    }

    pub(crate) fn detach(&self, host: &str, container: &str) {
        if let Some(record) = lock(&self.state).hosts.get_mut(host) {
            record.hosted.remove(container);
        }
    }

    /// Containers in `host` that are not yet terminated, in id order.
    pub(crate) fn hosted(&self, host: &str) -> Vec<String> {
        let state = lock(&self.state);
        let Some(record) = state.hosts.get(host) else {
            return Vec::new();
        };
        record
            .hosted
            .iter()
            .filter(|(_, entry)| !lock(&entry.cell).state.is_terminated())
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub(crate) fn hosted_entries(&self, host: &str) -> Vec<(String, HostedEntry)> {
        let state = lock(&self.state);
        state
            .hosts
            .get(host)
            .map(|record| {
                record
                    .hosted
                    .iter()
                    .map(|(id, entry)| (id.clone(), entry.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::ContainerRuntime;

    fn entry(state: LifecycleState) -> HostedEntry {
        HostedEntry {
            layers: LayerSet::new(["/base", "/s"]).unwrap(),
            cell: Arc::new(Mutex::new(ContainerRuntime {
                state,
                handle: None,
            })),
        }
    }

    #[test]
    fn test_identities_are_unique() {
        let index = HostIndex::new();
        assert!(index.register_host("uvm"));
        assert!(!index.register_host("uvm"));
        assert!(!index.claim("uvm"));
        assert!(index.claim("c1"));
        assert!(!index.claim("c1"));

        index.release("c1");
        assert!(index.claim("c1"));
        index.remove_host("uvm");
        assert!(index.claim("uvm"));
    }

    #[test]
    fn test_hosted_skips_terminated() {
        let index = HostIndex::new();
        index.register_host("uvm");
        assert!(index.attach("uvm", "b", entry(LifecycleState::Running)));
        assert!(index.attach("uvm", "a", entry(LifecycleState::Created)));
        assert!(index.attach("uvm", "z", entry(LifecycleState::Terminated)));
        assert!(!index.attach("gone", "c", entry(LifecycleState::Created)));

        assert_eq!(index.hosted("uvm"), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(index.hosted_entries("uvm").len(), 3);

        index.detach("uvm", "a");
        assert_eq!(index.hosted("uvm"), vec!["b".to_string()]);
    }

    #[test]
    fn test_host_state() {
        let index = HostIndex::new();
        index.register_host("uvm");
        assert_eq!(index.host_state("uvm"), Some(LifecycleState::Created));
        index.set_host_state("uvm", LifecycleState::Running);
        assert_eq!(index.host_state("uvm"), Some(LifecycleState::Running));
        assert!(index.gate("uvm").is_some());
        assert!(index.host_state("other").is_none());
    }
}
