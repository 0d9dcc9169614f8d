//! Node identity on the ring.

use std::{
    fmt,
    hash::{Hash, Hasher},
};

/// Identifier of a simulated process (an address). A peer may host many nodes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub u32);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "p{}", self.0)
    }
}

/// Immutable identity of a node: its position on the ring and the peer that owns it.
///
/// Identifiers order by `key`, then `peer`, then `sub`, so nodes sharing a primary key
/// still occupy distinct, deterministic positions on the ring.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId {
    pub key: u64,
    pub peer: PeerId,
    pub sub: u32,
}

impl NodeId {
    pub const fn new(key: u64, peer: PeerId) -> Self {
        Self { key, peer, sub: 0 }
    }

    pub const fn with_sub(key: u64, peer: PeerId, sub: u32) -> Self {
        Self { key, peer, sub }
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.sub == 0 {
            write!(f, "{}@{}", self.key, self.peer)
        } else {
            write!(f, "{}.{}@{}", self.key, self.sub, self.peer)
        }
    }
}

/// Position of a node in the [crate::arena::Arena]. Stale slots never alias a newer node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Slot {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

/// Reference to a node that may or may not still be resident.
///
/// Handles are plain values: holding one never keeps a node's state alive. Equality and
/// hashing consider only the [NodeId], so a handle rebuilt from an identifier (for example
/// after crossing a message boundary) compares equal to the original.
#[derive(Clone, Copy, Debug)]
pub struct NodeHandle {
    id: NodeId,
    slot: Option<Slot>,
}

impl NodeHandle {
    /// A handle that will be resolved by identifier on first use.
    pub const fn detached(id: NodeId) -> Self {
        Self { id, slot: None }
    }

    pub(crate) const fn resident(id: NodeId, slot: Slot) -> Self {
        Self {
            id,
            slot: Some(slot),
        }
    }

    pub const fn id(&self) -> NodeId {
        self.id
    }

    pub const fn key(&self) -> u64 {
        self.id.key
    }

    pub const fn peer(&self) -> PeerId {
        self.id.peer
    }

    pub(crate) const fn slot(&self) -> Option<Slot> {
        self.slot
    }
}

impl PartialEq for NodeHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for NodeHandle {}

impl Hash for NodeHandle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state)
    }
}

impl PartialOrd for NodeHandle {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for NodeHandle {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.id.cmp(&other.id)
    }
}

impl fmt::Display for NodeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.id.fmt(f)
    }
}

/// Destination of a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Target {
    /// A specific node.
    Node(NodeHandle),
    /// Any live node hosted by the peer, chosen at delivery time.
    Any(PeerId),
}

impl Target {
    pub const fn peer(&self) -> PeerId {
        match self {
            Self::Node(node) => node.peer(),
            Self::Any(peer) => *peer,
        }
    }
}

impl From<NodeHandle> for Target {
    fn from(node: NodeHandle) -> Self {
        Self::Node(node)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Node(node) => node.fmt(f),
            Self::Any(peer) => write!(f, "*@{peer}"),
        }
    }
}
