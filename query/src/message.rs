use crate::{Discipline, Partial, QueryId, RunId, ValueProvider};
use ringsim_overlay::{Body, NodeHandle, NodeId};
use ringsim_utils::Interval;
use std::{collections::BTreeSet, fmt, sync::Arc, time::Duration};

/// A share of a query handed to a delegate.
pub struct SubQuery<V> {
    pub query: QueryId,
    pub root: NodeHandle,
    /// Run at the sender that waits for this share.
    pub parent_run: RunId,
    pub ranges: Vec<Interval>,
    /// Nodes already known to be unreachable.
    pub obstacles: BTreeSet<NodeId>,
    pub discipline: Discipline,
    pub flush: Option<Duration>,
    pub provider: Arc<dyn ValueProvider<V>>,
}

impl<V> Clone for SubQuery<V> {
    fn clone(&self) -> Self {
        Self {
            query: self.query,
            root: self.root,
            parent_run: self.parent_run,
            ranges: self.ranges.clone(),
            obstacles: self.obstacles.clone(),
            discipline: self.discipline,
            flush: self.flush,
            provider: self.provider.clone(),
        }
    }
}

impl<V> fmt::Debug for SubQuery<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubQuery")
            .field("query", &self.query)
            .field("parent_run", &self.parent_run)
            .field("ranges", &self.ranges)
            .field("obstacles", &self.obstacles)
            .field("discipline", &self.discipline)
            .finish_non_exhaustive()
    }
}

/// Messages exchanged by the query engine.
#[derive(Clone, Debug)]
pub enum Message<V> {
    /// Request (or one-way, for [Discipline::NoResponse]) asking a delegate to resolve ranges.
    SubQuery(SubQuery<V>),
    /// Reply to a [Message::SubQuery]: every range in `covered` is settled. Values are
    /// only carried under [Discipline::Aggregate].
    Results {
        covered: Vec<Interval>,
        partials: Vec<Partial<V>>,
    },
    /// Values sent straight to the root under [Discipline::Direct].
    Direct {
        query: QueryId,
        partials: Vec<Partial<V>>,
    },
    /// Early results pushed to a parent run under [Discipline::Aggregate].
    Flush {
        query: QueryId,
        run: RunId,
        partials: Vec<Partial<V>>,
    },
}

impl<V: Clone + fmt::Debug + Send + 'static> Body for Message<V> {
    fn name(&self) -> &'static str {
        match self {
            Message::SubQuery(_) => "SubQuery",
            Message::Results { .. } => "Results",
            Message::Direct { .. } => "Direct",
            Message::Flush { .. } => "Flush",
        }
    }
}
