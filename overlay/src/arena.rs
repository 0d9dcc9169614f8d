//! Generation-checked storage for resident nodes.

use crate::identity::{NodeHandle, NodeId, PeerId, Slot};
use std::collections::{BTreeMap, BTreeSet};

struct Entry<N> {
    generation: u32,
    value: Option<(NodeId, N)>,
}

/// Owns every resident node. Handles index into the arena and fall back to a lookup by
/// [NodeId] when their slot has been reused, so a handle outliving its node resolves to
/// nothing rather than to an unrelated node.
pub struct Arena<N> {
    entries: Vec<Entry<N>>,
    free: Vec<u32>,
    by_id: BTreeMap<NodeId, u32>,
    by_peer: BTreeMap<PeerId, BTreeSet<NodeId>>,
}

impl<N> Default for Arena<N> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            free: Vec::new(),
            by_id: BTreeMap::new(),
            by_peer: BTreeMap::new(),
        }
    }
}

impl<N> Arena<N> {
    /// Store `value` under `id`. Returns `None` if `id` is already resident.
    pub fn insert(&mut self, id: NodeId, value: N) -> Option<NodeHandle> {
        if self.by_id.contains_key(&id) {
            return None;
        }
        let index = match self.free.pop() {
            Some(index) => {
                let entry = &mut self.entries[index as usize];
                entry.value = Some((id, value));
                index
            }
            None => {
                self.entries.push(Entry {
                    generation: 0,
                    value: Some((id, value)),
                });
                (self.entries.len() - 1) as u32
            }
        };
        self.by_id.insert(id, index);
        self.by_peer.entry(id.peer).or_default().insert(id);
        let generation = self.entries[index as usize].generation;
        Some(NodeHandle::resident(id, Slot { index, generation }))
    }

    fn index(&self, handle: &NodeHandle) -> Option<u32> {
        if let Some(slot) = handle.slot() {
            if let Some(entry) = self.entries.get(slot.index as usize) {
                if entry.generation == slot.generation {
                    if let Some((id, _)) = &entry.value {
                        if *id == handle.id() {
                            return Some(slot.index);
                        }
                    }
                }
            }
        }
        self.by_id.get(&handle.id()).copied()
    }

    pub fn get(&self, handle: &NodeHandle) -> Option<&N> {
        let index = self.index(handle)?;
        self.entries[index as usize].value.as_ref().map(|(_, n)| n)
    }

    pub fn get_mut(&mut self, handle: &NodeHandle) -> Option<&mut N> {
        let index = self.index(handle)?;
        self.entries[index as usize].value.as_mut().map(|(_, n)| n)
    }

    /// Evict a node. Outstanding handles to it stop resolving.
    pub fn remove(&mut self, handle: &NodeHandle) -> Option<N> {
        let index = self.index(handle)?;
        let entry = &mut self.entries[index as usize];
        let (id, value) = entry.value.take()?;
        entry.generation = entry.generation.wrapping_add(1);
        self.free.push(index);
        self.by_id.remove(&id);
        if let Some(ids) = self.by_peer.get_mut(&id.peer) {
            ids.remove(&id);
            if ids.is_empty() {
                self.by_peer.remove(&id.peer);
            }
        }
        Some(value)
    }

    /// Fresh handle for a resident identifier.
    pub fn resolve(&self, id: &NodeId) -> Option<NodeHandle> {
        let index = *self.by_id.get(id)?;
        let generation = self.entries[index as usize].generation;
        Some(NodeHandle::resident(*id, Slot { index, generation }))
    }

    /// Resident nodes hosted by `peer`, in ring order.
    pub fn on_peer(&self, peer: PeerId) -> Vec<NodeHandle> {
        self.by_peer
            .get(&peer)
            .into_iter()
            .flatten()
            .filter_map(|id| self.resolve(id))
            .collect()
    }

    pub fn contains(&self, handle: &NodeHandle) -> bool {
        self.index(handle).is_some()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Every resident node in ring order.
    pub fn handles(&self) -> Vec<NodeHandle> {
        self.by_id.keys().filter_map(|id| self.resolve(id)).collect()
    }
}
