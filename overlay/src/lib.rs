//! Exchange requests, replies, and acks between virtual nodes on a structured ring.
//!
//! A [Network] hosts any number of [LocalNode]s, each identified by a [NodeId] and owned
//! by a simulated peer. Nodes talk through a [Transport] and every delivery, timer, and
//! completion runs as an action on a single [ringsim_runtime::Scheduler], so protocol code
//! never needs locks.
//!
//! # Messaging
//!
//! A request arms two timers at its sender: a short ack timer and a long reply timer. The
//! receiver acks the immediate sender as soon as it starts processing the request, and the
//! final handler replies straight to the origin (forwarding nodes only wait for acks).
//!
//! * A missing ack marks the destination as suspected for a while and fails the request
//!   with [Error::AckTimeout].
//! * A missing reply fails the request with [Error::Timeout] without blaming anyone.
//! * The network never retries on its own. Callers decide using [Error::is_retriable].
//!
//! # Example
//!
//! ```rust
//! use ringsim_overlay::{
//!     Body, Config, Error, Inbound, Network, NodeHandle, NodeId, PeerId, Protocol, Star,
//! };
//! use ringsim_runtime::Until;
//! use std::time::Duration;
//!
//! #[derive(Clone, Debug)]
//! struct Ping(u64);
//!
//! impl Body for Ping {
//!     fn name(&self) -> &'static str {
//!         "Ping"
//!     }
//! }
//!
//! struct Pong;
//!
//! impl Protocol for Pong {
//!     type Body = Ping;
//!     type State = ();
//!     type Shared = ();
//!
//!     fn on_request(net: &mut Network<Self>, me: NodeHandle, inbound: Inbound, body: Ping) {
//!         net.reply(me, &inbound, Ok(Ping(body.0 + 1)));
//!     }
//! }
//!
//! let mut net = Network::<Pong>::new(Config::default(), Star::new(Duration::from_millis(5))).unwrap();
//! let ring = net
//!     .bootstrap([NodeId::new(0, PeerId(0)), NodeId::new(100, PeerId(1))], |_| Vec::new())
//!     .unwrap();
//! net.request(
//!     ring[0],
//!     ring[1],
//!     Ping(41),
//!     Box::new(|net: &mut Network<Pong>, result: Result<Ping, Error>| {
//!         assert_eq!(result.unwrap().0, 42);
//!         assert_eq!(net.now(), Duration::from_millis(20));
//!     }),
//! );
//! net.run(Until::Idle);
//! ```

use thiserror::Error;

mod arena;
pub use arena::Arena;
mod config;
pub use config::Config;
mod identity;
pub use identity::{NodeHandle, NodeId, PeerId, Slot, Target};
mod lookup;
mod message;
pub use message::{Body, Inbound, Kind, Message, Payload, Rejection, RequestId};
mod metrics;
mod network;
pub use network::Network;
mod node;
pub use node::{Lifecycle, LocalNode};
mod ring;
mod strategy;
pub use strategy::{Fingers, Hop, Strategy};
mod transport;
pub use transport::{Fate, Link, Simulated, Star, Transport};

/// Continuation invoked exactly once with the outcome of an asynchronous operation.
pub type Callback<P, T> = Box<dyn FnOnce(&mut Network<P>, Result<T, Error>) + Send + 'static>;

/// Invoked when a forwarded request is not acknowledged by its next hop.
pub type OnFailure<P> = Box<dyn FnOnce(&mut Network<P>, Error) + Send + 'static>;

/// Application protocol run by every node of a [Network].
pub trait Protocol: Sized + Send + 'static {
    /// Payload of application messages.
    type Body: Body;

    /// Per-node application state, see [LocalNode::state].
    type State: Default + Send + 'static;

    /// State shared by every node of the network, see [Network::shared].
    type Shared: Default + Send + 'static;

    /// Called once when a [Network] is created, before any node exists.
    fn init(net: &mut Network<Self>) {
        let _ = net;
    }

    /// Handle a request addressed to `me`. The handler answers with [Network::reply],
    /// passes the request on with [Network::forward], or keeps `inbound` to answer later.
    fn on_request(net: &mut Network<Self>, me: NodeHandle, inbound: Inbound, body: Self::Body);

    /// Handle a one-way message addressed to `me`.
    fn on_message(net: &mut Network<Self>, me: NodeHandle, from: NodeHandle, body: Self::Body) {
        let _ = (net, me, from, body);
    }
}

/// Errors that can occur when interacting with a [Network].
#[derive(Debug, Error)]
pub enum Error {
    #[error("ack timeout from {0}")]
    AckTimeout(Target),
    #[error("timeout")]
    Timeout,
    #[error("network error: {0}")]
    NetworkError(String),
    #[error("rejected by leaving node")]
    GraceStateRejected,
    #[error("retriable: {0}")]
    Retriable(String),
    #[error("not resident: {0}")]
    NotResident(NodeId),
    #[error("not inserted: {0}")]
    NotInserted(NodeId),
    #[error("already in a ring: {0}")]
    AlreadyInserted(NodeId),
    #[error("already resident: {0}")]
    Duplicate(NodeId),
    #[error("no route to {0}")]
    Unroutable(u64),
    #[error("unexpected reply: {0}")]
    UnexpectedReply(&'static str),
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("not valid to link self")]
    LinkingSelf,
    #[error("invalid success rate (must be in [0, 1]): {0}")]
    InvalidSuccessRate(f64),
}

impl Error {
    /// Whether a caller may reasonably try the same operation again.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Error::Retriable(_) | Error::Timeout)
    }
}

impl From<Rejection> for Error {
    fn from(rejection: Rejection) -> Self {
        match rejection {
            Rejection::Grace => Error::GraceStateRejected,
            Rejection::Retriable(reason) => Error::Retriable(reason),
            Rejection::Unroutable(key) => Error::Unroutable(key),
        }
    }
}
