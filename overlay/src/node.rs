//! Per-node state.

use crate::{
    identity::{NodeHandle, NodeId, Target},
    message::{Payload, RequestId},
    Callback, Protocol, Strategy,
};
use ringsim_runtime::Timer;
use std::collections::{HashMap, HashSet};

/// Where a node is in its life on the ring.
///
/// `Out -> Inserting -> Inserted` is the happy path into the ring and
/// `Inserted -> Deleting -> Grace -> Deleted` the way out. Any state may jump to `Deleted`
/// when the node is failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Lifecycle {
    Out,
    Inserting,
    Inserted,
    Deleting,
    Grace,
    Deleted,
}

/// Bookkeeping run when a request record completes.
#[derive(Clone, Copy, Debug)]
pub(crate) enum Cleanup {
    Timer(Timer),
    Pending(RequestId),
    Unacked(RequestId),
}

/// An outstanding request sent (or forwarded) by a node.
pub(crate) struct Record<P: Protocol> {
    pub destination: Target,
    /// Forwarded copies only wait for an ack.
    pub forwarded: bool,
    pub ack: Timer,
    /// Taken by whichever outcome fires first.
    pub callback: Option<Callback<P, Payload<P::Body>>>,
    pub cleanup: Vec<Cleanup>,
}

/// A virtual node resident in a [crate::Network].
pub struct LocalNode<P: Protocol> {
    id: NodeId,
    pub(crate) lifecycle: Lifecycle,
    pub(crate) failed: bool,
    pub(crate) successor: Option<NodeHandle>,
    pub(crate) predecessor: Option<NodeHandle>,
    pub(crate) strategies: Vec<Box<dyn Strategy<P>>>,
    pub(crate) pending: HashMap<RequestId, Record<P>>,
    pub(crate) unacked: HashSet<RequestId>,
    pub(crate) suspected: HashMap<NodeId, Timer>,
    next_request: u64,

    /// Application state.
    pub state: P::State,
}

impl<P: Protocol> LocalNode<P> {
    pub(crate) fn new(id: NodeId, strategies: Vec<Box<dyn Strategy<P>>>) -> Self {
        Self {
            id,
            lifecycle: Lifecycle::Out,
            failed: false,
            successor: None,
            predecessor: None,
            strategies,
            pending: HashMap::new(),
            unacked: HashSet::new(),
            suspected: HashMap::new(),
            next_request: 0,
            state: P::State::default(),
        }
    }

    pub(crate) fn next_request(&mut self) -> RequestId {
        self.next_request += 1;
        RequestId(self.next_request)
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    /// Whether the node was failed (it silently ignores everything).
    pub fn is_failed(&self) -> bool {
        self.failed
    }

    pub fn successor(&self) -> Option<NodeHandle> {
        self.successor
    }

    pub fn predecessor(&self) -> Option<NodeHandle> {
        self.predecessor
    }

    /// Predecessor, the node itself, and successor in ring order, without duplicates.
    pub fn neighbours(&self, me: &NodeHandle) -> Vec<NodeHandle> {
        let mut entries: Vec<NodeHandle> = [self.predecessor, Some(*me), self.successor]
            .into_iter()
            .flatten()
            .collect();
        entries.sort();
        entries.dedup();
        entries
    }

    /// Number of requests still awaiting an outcome.
    pub fn outstanding(&self) -> usize {
        self.pending.len()
    }

    /// Number of requests still awaiting an ack.
    pub fn unacknowledged(&self) -> usize {
        self.unacked.len()
    }

    pub fn is_suspected(&self, node: &NodeId) -> bool {
        self.suspected.contains_key(node)
    }
}
