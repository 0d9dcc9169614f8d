//! Sources of the values a range query collects.

use ringsim_overlay::NodeId;
use ringsim_utils::{Interval, IntervalSet};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

type Complete<V> = Box<dyn FnOnce(Duration, Result<V, String>) + Send>;

/// Completion handle for one [ValueProvider::get] call.
///
/// The value is merged from a fresh action on the run loop, never from the provider's
/// call stack. A provider may resolve inside `get`, after some simulated delay, or later
/// from another thread. Dropping the handle unresolved reports a provider failure.
pub struct Resolver<V> {
    complete: Option<Complete<V>>,
}

impl<V> Resolver<V> {
    /// Handle that passes the outcome, and how long to wait before merging it, to `complete`.
    pub fn new(complete: impl FnOnce(Duration, Result<V, String>) + Send + 'static) -> Self {
        Self {
            complete: Some(Box::new(complete)),
        }
    }

    pub fn resolve(self, result: Result<V, String>) {
        self.resolve_after(Duration::ZERO, result)
    }

    /// Resolve once `delay` of scheduler time has passed.
    pub fn resolve_after(mut self, delay: Duration, result: Result<V, String>) {
        if let Some(complete) = self.complete.take() {
            complete(delay, result);
        }
    }
}

impl<V> Drop for Resolver<V> {
    fn drop(&mut self) {
        if let Some(complete) = self.complete.take() {
            complete(Duration::ZERO, Err("request dropped by value provider".into()));
        }
    }
}

/// Produces the value a node contributes for the ranges it is responsible for.
///
/// Providers are shared by every node a query reaches, so implementations must be
/// cheap to call concurrently from the same scheduler thread.
pub trait ValueProvider<V>: Send + Sync + 'static {
    /// Look up the value held by `node` and hand it to `resolver`.
    fn get(&self, node: &NodeId, resolver: Resolver<V>);

    /// Resolve whole sub-ranges at `node` without contacting the nodes that own them
    /// (for example from metadata aggregated over routing entries).
    ///
    /// Anything returned here is not disseminated any further.
    fn preprocess(&self, node: &NodeId, ranges: &IntervalSet) -> Vec<(Interval, V)> {
        let _ = (node, ranges);
        Vec::new()
    }
}

impl<V, F> ValueProvider<V> for F
where
    F: Fn(&NodeId) -> Result<V, String> + Send + Sync + 'static,
{
    fn get(&self, node: &NodeId, resolver: Resolver<V>) {
        resolver.resolve(self(node))
    }
}

/// Remembers the first successful value of each node.
pub struct Cached<V> {
    inner: Arc<dyn ValueProvider<V>>,
    values: Arc<Mutex<HashMap<NodeId, V>>>,
}

impl<V: Clone + Send + 'static> Cached<V> {
    pub fn new(inner: Arc<dyn ValueProvider<V>>) -> Self {
        Self {
            inner,
            values: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Number of nodes with a cached value.
    pub fn len(&self) -> usize {
        self.values.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn invalidate(&self, node: &NodeId) -> bool {
        self.values.lock().unwrap().remove(node).is_some()
    }
}

impl<V: Clone + Send + Sync + 'static> ValueProvider<V> for Cached<V> {
    fn get(&self, node: &NodeId, resolver: Resolver<V>) {
        let cached = self.values.lock().unwrap().get(node).cloned();
        if let Some(value) = cached {
            return resolver.resolve(Ok(value));
        }
        let values = self.values.clone();
        let node = *node;
        self.inner.get(
            &node,
            Resolver::new(move |delay, result: Result<V, String>| {
                if let Ok(value) = &result {
                    values.lock().unwrap().insert(node, value.clone());
                }
                resolver.resolve_after(delay, result);
            }),
        );
    }

    fn preprocess(&self, node: &NodeId, ranges: &IntervalSet) -> Vec<(Interval, V)> {
        self.inner.preprocess(node, ranges)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ringsim_overlay::PeerId;
    use std::sync::atomic::{AtomicUsize, Ordering};

    type Outcomes = Arc<Mutex<Vec<(Duration, Result<u64, String>)>>>;

    fn fetch(provider: &dyn ValueProvider<u64>, node: &NodeId) -> Result<u64, String> {
        let outcomes = Outcomes::default();
        let slot = outcomes.clone();
        provider.get(
            node,
            Resolver::new(move |delay, result| slot.lock().unwrap().push((delay, result))),
        );
        let mut outcomes = outcomes.lock().unwrap();
        assert_eq!(outcomes.len(), 1);
        outcomes.remove(0).1
    }

    #[test]
    fn test_cached_calls_inner_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let inner = move |node: &NodeId| -> Result<u64, String> {
            counter.fetch_add(1, Ordering::SeqCst);
            if node.key == 13 {
                return Err("unlucky".into());
            }
            Ok(node.key * 2)
        };
        let cached = Cached::new(Arc::new(inner));
        let node = NodeId::new(21, PeerId(1));
        assert_eq!(fetch(&cached, &node), Ok(42));
        assert_eq!(fetch(&cached, &node), Ok(42));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Failures are not cached.
        let unlucky = NodeId::new(13, PeerId(2));
        assert!(fetch(&cached, &unlucky).is_err());
        assert!(fetch(&cached, &unlucky).is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(cached.len(), 1);

        assert!(cached.invalidate(&node));
        assert_eq!(fetch(&cached, &node), Ok(42));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    struct Slow;

    impl ValueProvider<u64> for Slow {
        fn get(&self, node: &NodeId, resolver: Resolver<u64>) {
            resolver.resolve_after(Duration::from_millis(40), Ok(node.key));
        }
    }

    #[test]
    fn test_cached_keeps_delay() {
        let cached = Cached::new(Arc::new(Slow));
        let node = NodeId::new(7, PeerId(1));
        let outcomes = Outcomes::default();
        for _ in 0..2 {
            let slot = outcomes.clone();
            cached.get(
                &node,
                Resolver::new(move |delay, result| slot.lock().unwrap().push((delay, result))),
            );
        }
        let outcomes = outcomes.lock().unwrap();
        assert_eq!(outcomes[0], (Duration::from_millis(40), Ok(7)));
        assert_eq!(outcomes[1], (Duration::ZERO, Ok(7)));
    }

    #[test]
    fn test_dropped_resolver_fails() {
        let outcomes = Outcomes::default();
        let slot = outcomes.clone();
        drop(Resolver::<u64>::new(move |delay, result| {
            slot.lock().unwrap().push((delay, result))
        }));
        let outcomes = outcomes.lock().unwrap();
        assert_eq!(outcomes.len(), 1);
        assert!(outcomes[0].1.is_err());
    }
}
