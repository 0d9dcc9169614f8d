//! Pluggable routing strategies.
//!
//! Each node holds a stack of strategies. Queries walk the stack from the top and stop at the
//! first strategy that answers; when none does, the network falls back to plain ring
//! behaviour (neighbours only, responsibility for `[self, successor)`).

use crate::{
    identity::NodeHandle,
    node::LocalNode,
    Callback, Network, Protocol,
};

/// Outcome of routing a key at a node.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Hop {
    /// The node is responsible for the key.
    Here,
    /// Send the lookup to this node next.
    Next(NodeHandle),
    /// No usable route exists.
    Nowhere,
}

/// A layer of overlay behaviour.
///
/// Read-only methods return `None` to fall through to the next strategy. Ring maintenance
/// methods hand their callback back to fall through. While a maintenance method runs, the
/// node's stack is detached, so read-only queries it makes see the default behaviour.
#[allow(unused_variables)]
pub trait Strategy<P: Protocol>: Send + 'static {
    fn name(&self) -> &'static str;

    /// Called once when the node is added to the network.
    fn activate(&mut self, me: &NodeHandle) {}

    fn is_responsible(&self, node: &LocalNode<P>, me: &NodeHandle, key: u64) -> Option<bool> {
        None
    }

    fn routing_entries(&self, node: &LocalNode<P>, me: &NodeHandle) -> Option<Vec<NodeHandle>> {
        None
    }

    fn handle_lookup(&self, node: &LocalNode<P>, me: &NodeHandle, key: u64) -> Option<Hop> {
        None
    }

    /// Rebuild derived routing state from the current ring (live members in ring order).
    fn refresh(&mut self, me: &NodeHandle, ring: &[NodeHandle]) {}

    /// Make `me` the first member of a new ring. Returns whether it was handled.
    fn init_initial_node(&mut self, net: &mut Network<P>, me: NodeHandle) -> bool {
        false
    }

    /// Insert `me` next to `found`, the node currently responsible for its key.
    fn join(
        &mut self,
        net: &mut Network<P>,
        me: NodeHandle,
        found: NodeHandle,
        callback: Callback<P, ()>,
    ) -> Option<Callback<P, ()>> {
        Some(callback)
    }

    fn leave(
        &mut self,
        net: &mut Network<P>,
        me: NodeHandle,
        callback: Callback<P, ()>,
    ) -> Option<Callback<P, ()>> {
        Some(callback)
    }
}

/// Chord-style finger table: for every `i`, the first node at or after `key + 2^i`.
///
/// Fingers are computed from the live ring on [Network::stabilize] and extend the node's
/// neighbours, so greedy routing takes logarithmic hops instead of walking successors.
#[derive(Clone, Debug, Default)]
pub struct Fingers {
    table: Vec<NodeHandle>,
}

impl Fingers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> &[NodeHandle] {
        &self.table
    }
}

fn successor_of(ring: &[NodeHandle], key: u64) -> Option<NodeHandle> {
    ring.iter()
        .find(|node| node.key() >= key)
        .or_else(|| ring.first())
        .copied()
}

impl<P: Protocol> Strategy<P> for Fingers {
    fn name(&self) -> &'static str {
        "fingers"
    }

    fn routing_entries(&self, node: &LocalNode<P>, me: &NodeHandle) -> Option<Vec<NodeHandle>> {
        let mut entries = node.neighbours(me);
        entries.extend(self.table.iter().copied());
        entries.sort();
        entries.dedup();
        Some(entries)
    }

    fn refresh(&mut self, me: &NodeHandle, ring: &[NodeHandle]) {
        self.table.clear();
        for i in 0..u64::BITS {
            let target = me.key().wrapping_add(1u64 << i);
            if let Some(finger) = successor_of(ring, target) {
                if finger != *me {
                    self.table.push(finger);
                }
            }
        }
        self.table.sort();
        self.table.dedup();
    }
}
