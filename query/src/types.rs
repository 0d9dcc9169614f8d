//! Types shared by every node taking part in a range query.

use crate::Error;
use ringsim_overlay::NodeId;
use ringsim_utils::Interval;
use std::{fmt, time::Duration};

/// Identifies a query across the ring: the node that issued it and its local sequence.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueryId {
    pub root: NodeId,
    pub sequence: u64,
}

impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.root, self.sequence)
    }
}

/// Identifies one node's share of a query (a node may hold several for the same query).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RunId(pub u64);

/// How resolved values travel back to the root.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Discipline {
    /// Sub-queries are one-way messages and nothing comes back.
    NoResponse,
    /// Every node sends its values straight to the root. Parents still answer their own
    /// parent (with no values) once their share is complete.
    Direct,
    /// Values flow back up the dissemination tree inside replies.
    #[default]
    Aggregate,
}

/// Per-query settings chosen by the caller.
#[derive(Clone, Debug)]
pub struct Options {
    pub discipline: Discipline,

    /// Once this passes, whatever is still unresolved is reported as [Failure::Expired]
    /// and the query completes.
    pub expiration: Duration,

    /// If set, the root sends out its unresolved ranges again at this period.
    pub retransmission: Option<Duration>,

    /// If set (and the discipline is [Discipline::Aggregate]), intermediate nodes pass
    /// partial results to their parent at this period instead of only when complete.
    pub flush: Option<Duration>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            discipline: Discipline::Aggregate,
            expiration: Duration::from_secs(30),
            retransmission: None,
            flush: None,
        }
    }
}

impl Options {
    /// Reject settings that would never let a query settle.
    pub fn validate(&self) -> Result<(), Error> {
        if self.expiration.is_zero() {
            return Err(Error::InvalidOptions("expiration must be positive".into()));
        }
        if self.retransmission.is_some_and(|period| period.is_zero()) {
            return Err(Error::InvalidOptions("retransmission period must be positive".into()));
        }
        if self.flush.is_some_and(|period| period.is_zero()) {
            return Err(Error::InvalidOptions("flush period must be positive".into()));
        }
        Ok(())
    }
}

/// Why some ranges of a query could not be resolved.
#[derive(Clone, Debug, thiserror::Error, PartialEq, Eq)]
pub enum Failure {
    #[error("no live node reachable for range")]
    Unreachable,
    #[error("delegate did not reply in time")]
    Timeout,
    #[error("value provider failed: {0}")]
    Provider(String),
    #[error("query expired")]
    Expired,
}

/// The outcome for some ranges of a query, attributed to the node that produced it.
#[derive(Clone, Debug, PartialEq)]
pub struct Partial<V> {
    pub node: NodeId,
    pub ranges: Vec<Interval>,
    pub outcome: Result<V, Failure>,
}

impl<V> Partial<V> {
    /// Smallest key covered, used to order results.
    pub fn start(&self) -> u64 {
        self.ranges.first().map_or(0, Interval::lo)
    }
}
