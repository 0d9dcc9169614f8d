//! Mock providers, sinks, and rings for testing.

use crate::{Failure, Partial, RangeQuery, Resolver, ResultSink, ValueProvider};
use ringsim_overlay::{Config, Fingers, Network, NodeHandle, NodeId, PeerId, Star, Strategy};
use ringsim_utils::{Interval, IntervalSet};
use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

/// Every node's value is its key.
pub struct Keys;

impl ValueProvider<u64> for Keys {
    fn get(&self, node: &NodeId, resolver: Resolver<u64>) {
        resolver.resolve(Ok(node.key))
    }
}

pub fn strategies(fingers: bool) -> Vec<Box<dyn Strategy<RangeQuery<u64>>>> {
    if fingers {
        vec![Box::new(Fingers::new()) as Box<dyn Strategy<RangeQuery<u64>>>]
    } else {
        Vec::new()
    }
}

/// A bootstrapped ring with one node per key, each on its own peer 5ms from the hub.
pub fn ring(keys: &[u64], fingers: bool) -> (Network<RangeQuery<u64>>, Vec<NodeHandle>) {
    let mut net = Network::new(Config::default(), Star::new(Duration::from_millis(5))).unwrap();
    let ring = net
        .bootstrap(
            keys.iter().map(|key| NodeId::new(*key, PeerId(*key as u32))),
            |_| strategies(fingers),
        )
        .unwrap();
    (net, ring)
}

/// Records everything pushed to a sink.
#[derive(Clone, Default)]
pub struct Collector {
    pushed: Arc<Mutex<Vec<Option<Partial<u64>>>>>,
}

impl Collector {
    pub fn sink(&self) -> impl ResultSink<u64> {
        let pushed = self.pushed.clone();
        move |partial: Option<Partial<u64>>| pushed.lock().unwrap().push(partial)
    }

    pub fn all(&self) -> Vec<Option<Partial<u64>>> {
        self.pushed.lock().unwrap().clone()
    }

    pub fn is_empty(&self) -> bool {
        self.pushed.lock().unwrap().is_empty()
    }

    /// Whether the last push signalled completion.
    pub fn is_done(&self) -> bool {
        matches!(self.pushed.lock().unwrap().last(), Some(None))
    }

    /// Successful values, sorted.
    pub fn values(&self) -> Vec<u64> {
        let mut values: Vec<u64> = self
            .all()
            .into_iter()
            .flatten()
            .filter_map(|partial| partial.outcome.ok())
            .collect();
        values.sort();
        values
    }

    /// Failed ranges in arrival order.
    pub fn failures(&self) -> Vec<(Vec<Interval>, Failure)> {
        self.all()
            .into_iter()
            .flatten()
            .filter_map(|partial| partial.outcome.err().map(|failure| (partial.ranges, failure)))
            .collect()
    }

    /// Every key reported so far, successful or not.
    pub fn covered(&self) -> IntervalSet {
        self.all()
            .into_iter()
            .flatten()
            .flat_map(|partial| partial.ranges)
            .collect()
    }
}
