//! Messages exchanged between nodes.

use crate::identity::{NodeHandle, NodeId, Target};
use std::{fmt::Debug, time::Duration};

/// Application payload carried by the overlay.
pub trait Body: Clone + Debug + Send + 'static {
    /// Name used to label deliveries of this body in metrics and logs.
    fn name(&self) -> &'static str;
}

/// Identifies an outstanding request at the node that issued it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub u64);

/// Payloads understood by the overlay itself, plus the application's own.
#[derive(Clone, Debug)]
pub enum Payload<A> {
    /// Find the node responsible for `key`.
    Lookup { key: u64 },
    /// Answer to [Payload::Lookup].
    Found { node: NodeHandle },
    /// Ask a node to adopt `joiner` as its successor.
    Splice { joiner: NodeHandle },
    /// Answer to [Payload::Splice] carrying the previous successor.
    Spliced { successor: NodeHandle },
    /// One-way instruction to update neighbour links.
    Relink {
        predecessor: Option<NodeHandle>,
        successor: Option<NodeHandle>,
    },
    App(A),
}

impl<A: Body> Payload<A> {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Lookup { .. } => "Lookup",
            Self::Found { .. } => "Found",
            Self::Splice { .. } => "Splice",
            Self::Spliced { .. } => "Spliced",
            Self::Relink { .. } => "Relink",
            Self::App(body) => body.name(),
        }
    }
}

/// Reason a request was refused by its receiver.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Rejection {
    /// The receiver is leaving the ring.
    Grace,
    /// The receiver could not serve the request right now.
    Retriable(String),
    /// No route toward the key exists.
    Unroutable(u64),
}

#[derive(Clone, Debug)]
pub enum Kind<A> {
    /// `origin` is the id at the node that started the request. `hop` is the id at the
    /// node that sent this copy (equal to `origin` until the request is forwarded).
    Request {
        origin: RequestId,
        hop: RequestId,
        payload: Payload<A>,
    },
    Reply {
        origin: RequestId,
        result: Result<Payload<A>, Rejection>,
    },
    Ack {
        hop: RequestId,
    },
    OneWay {
        payload: Payload<A>,
    },
}

impl<A: Body> Kind<A> {
    /// Label used by the per-kind message counters. Replies are named after their payload.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Request { payload, .. }
            | Self::OneWay { payload }
            | Self::Reply {
                result: Ok(payload),
                ..
            } => payload.name(),
            Self::Reply { result: Err(_), .. } => "Rejection",
            Self::Ack { .. } => "Ack",
        }
    }
}

/// A message in flight. Each transmission moves its own copy, so the sender and the
/// receiver never share a message.
#[derive(Clone, Debug)]
pub struct Message<A> {
    pub sender: NodeHandle,
    pub receiver: Target,
    /// Node that started the exchange this message belongs to.
    pub origin: NodeHandle,
    /// Latency chosen by the transport for this transmission.
    pub delay: Duration,
    pub sequence: u64,
    /// Nodes that processed the message.
    pub route: Vec<NodeId>,
    /// Nodes that received the message, including ones that dropped it.
    pub route_with_failed: Vec<NodeId>,
    pub kind: Kind<A>,
}

/// Context of a request being handled, needed to reply to or forward it. The immediate
/// sender has already been acknowledged by the time a handler sees this.
#[derive(Clone, Debug)]
pub struct Inbound {
    pub origin: NodeHandle,
    pub origin_id: RequestId,
    pub sender: NodeHandle,
    pub hop: RequestId,
    pub route: Vec<NodeId>,
}

impl Inbound {
    /// Number of nodes that processed the request so far (including this one).
    pub fn hops(&self) -> usize {
        self.route.len()
    }
}
