//! Resolve key ranges across a simulated ring with configurable result disciplines.
//!
//! A query asks every node responsible for some part of a set of key ranges for its value.
//! The issuing node (the root) resolves what it owns, splits the rest among its routing
//! entries, and each delegate does the same with its share until every key is settled.
//!
//! # Disciplines
//!
//! - [Discipline::NoResponse]: sub-queries are one-way and the root completes as soon as
//!   it has sent them. Useful to trigger work (through the [ValueProvider]) on every node.
//! - [Discipline::Direct]: every node sends its value straight to the root.
//! - [Discipline::Aggregate]: values travel back up the dissemination tree, optionally
//!   flushed early by intermediate nodes.
//!
//! # Failures
//!
//! A delegate that does not acknowledge its sub-query is treated as an obstacle and its
//! share is split again among the remaining nodes. Ranges nobody can be found for are
//! reported as [Failure::Unreachable], and whatever is unresolved when the query expires as
//! [Failure::Expired]. The root may retransmit unresolved ranges periodically; duplicate
//! results are dropped, so every key is reported at most once.
//!
//! # Values
//!
//! A [ValueProvider] answers through a [Resolver], either immediately or after some
//! scheduler time has passed. Plain closures returning a value can be used directly.
//!
//! # Example
//!
//! ```rust
//! use ringsim_overlay::{Config, Network, NodeId, PeerId, Star};
//! use ringsim_query::{Options, Partial, RangeQuery, ValueProvider};
//! use ringsim_runtime::Until;
//! use ringsim_utils::Interval;
//! use std::{sync::{Arc, Mutex}, time::Duration};
//!
//! let mut net = Network::<RangeQuery<u64>>::new(Config::default(), Star::new(Duration::from_millis(5))).unwrap();
//! let ring = net
//!     .bootstrap((0..5).map(|i| NodeId::new(i * 100, PeerId(i as u32))), |_| Vec::new())
//!     .unwrap();
//!
//! let provider: Arc<dyn ValueProvider<u64>> = Arc::new(|node: &NodeId| -> Result<u64, String> { Ok(node.key) });
//! let results = Arc::new(Mutex::new(Vec::new()));
//! let sink = results.clone();
//! RangeQuery::query(
//!     &mut net,
//!     ring[0],
//!     Interval::half_open(0, 500),
//!     provider,
//!     Options::default(),
//!     move |partial: Option<Partial<u64>>| sink.lock().unwrap().push(partial),
//! )
//! .unwrap();
//! net.run(Until::Idle);
//!
//! let results = results.lock().unwrap();
//! let mut values: Vec<u64> = results.iter().flatten().map(|p| *p.outcome.as_ref().unwrap()).collect();
//! values.sort();
//! assert_eq!(values, vec![0, 100, 200, 300, 400]);
//! assert!(results.last().unwrap().is_none());
//! ```

use ringsim_overlay::NodeId;
use std::fmt::Debug;
use thiserror::Error;

mod delegate;
pub use delegate::assign;
mod engine;
pub use engine::{RangeQuery, Runs};
mod message;
pub use message::{Message, SubQuery};
mod metrics;
mod provider;
pub use provider::{Cached, Resolver, ValueProvider};
mod sink;
pub use sink::ResultSink;
mod types;
pub use types::{Discipline, Failure, Options, Partial, QueryId, RunId};

#[cfg(test)]
pub mod mocks;

/// Values collected by a query.
pub trait Value: Clone + Debug + Send + Sync + 'static {}

impl<T: Clone + Debug + Send + Sync + 'static> Value for T {}

/// Errors that can occur when issuing a query.
#[derive(Debug, Error)]
pub enum Error {
    #[error("not resident: {0}")]
    NotResident(NodeId),
    #[error("invalid options: {0}")]
    InvalidOptions(String),
}
