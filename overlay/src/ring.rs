//! Ring membership: bootstrap, join, leave.

use crate::{
    identity::{NodeHandle, NodeId, Target},
    message::{Inbound, Payload, Rejection},
    node::Lifecycle,
    Callback, Error, Network, Protocol, Strategy,
};
use ringsim_utils::is_ordered_open;
use tracing::{debug, info};

impl<P: Protocol> Network<P> {
    /// Make `me` the only member of a new ring.
    pub fn init_initial_node(&mut self, me: NodeHandle) -> Result<(), Error> {
        if !self.is_live(&me) {
            return Err(Error::NotResident(me.id()));
        }
        let mut strategies = self.take_strategies(&me);
        let mut handled = false;
        for strategy in strategies.iter_mut().rev() {
            if strategy.init_initial_node(self, me) {
                handled = true;
                break;
            }
        }
        self.restore_strategies(&me, strategies);
        if !handled {
            if let Some(node) = self.nodes.get_mut(&me) {
                node.predecessor = Some(me);
                node.successor = Some(me);
                node.lifecycle = Lifecycle::Inserted;
            }
        }
        debug!(node = %me, "initialized ring");
        Ok(())
    }

    /// Add nodes and link them into a consistent ring without exchanging any message.
    ///
    /// Returns the handles in ring order.
    pub fn bootstrap<I, F>(&mut self, ids: I, mut strategies: F) -> Result<Vec<NodeHandle>, Error>
    where
        I: IntoIterator<Item = NodeId>,
        F: FnMut(&NodeId) -> Vec<Box<dyn Strategy<P>>>,
    {
        let mut ring = Vec::new();
        for id in ids {
            let stack = strategies(&id);
            ring.push(self.add_node(id, stack)?);
        }
        ring.sort();
        for (i, me) in ring.iter().enumerate() {
            let predecessor = ring[(i + ring.len() - 1) % ring.len()];
            let successor = ring[(i + 1) % ring.len()];
            if let Some(node) = self.nodes.get_mut(me) {
                node.predecessor = Some(predecessor);
                node.successor = Some(successor);
                node.lifecycle = Lifecycle::Inserted;
            }
        }
        self.stabilize();
        info!(nodes = ring.len(), "bootstrapped ring");
        Ok(ring)
    }

    /// Insert `me` into the ring known to `introducer`.
    ///
    /// Failures classified as retriable are retried after `join_retry_delay`, up to
    /// `join_attempts` attempts in total.
    pub fn join(&mut self, me: NodeHandle, introducer: NodeHandle, callback: Callback<P, ()>) {
        let Some(node) = self.nodes.get_mut(&me).filter(|node| !node.failed) else {
            return self.complete(callback, Err(Error::NotResident(me.id())));
        };
        if node.lifecycle != Lifecycle::Out {
            return self.complete(callback, Err(Error::AlreadyInserted(me.id())));
        }
        node.lifecycle = Lifecycle::Inserting;
        self.join_attempt(me, introducer, 1, callback)
    }

    fn join_attempt(
        &mut self,
        me: NodeHandle,
        introducer: NodeHandle,
        attempt: usize,
        callback: Callback<P, ()>,
    ) {
        let Some(node) = self.nodes.get_mut(&me).filter(|node| !node.failed) else {
            return self.complete(callback, Err(Error::NotResident(me.id())));
        };
        if node.lifecycle != Lifecycle::Inserting {
            return self.complete(callback, Err(Error::AlreadyInserted(me.id())));
        }
        debug!(node = %me, %introducer, attempt, "joining");
        self.lookup_via(
            me,
            Some(introducer),
            me.key(),
            0,
            Box::new(
                move |net: &mut Network<P>, result: Result<NodeHandle, Error>| {
                    let settle: Callback<P, ()> = Box::new(
                        move |net: &mut Network<P>, result: Result<(), Error>| {
                            net.join_settled(me, introducer, attempt, result, callback)
                        },
                    );
                    match result {
                        Ok(found) => net.dispatch_join(me, found, settle),
                        Err(err) => settle(net, Err(err)),
                    }
                },
            ),
        );
    }

    fn dispatch_join(&mut self, me: NodeHandle, found: NodeHandle, callback: Callback<P, ()>) {
        let mut strategies = self.take_strategies(&me);
        let mut pending = Some(callback);
        for strategy in strategies.iter_mut().rev() {
            let Some(callback) = pending.take() else {
                break;
            };
            pending = strategy.join(self, me, found, callback);
        }
        self.restore_strategies(&me, strategies);
        if let Some(callback) = pending {
            self.splice(me, found, callback);
        }
    }

    fn join_settled(
        &mut self,
        me: NodeHandle,
        introducer: NodeHandle,
        attempt: usize,
        result: Result<(), Error>,
        callback: Callback<P, ()>,
    ) {
        match result {
            Ok(()) => callback(self, Ok(())),
            Err(err) if err.is_retriable() && attempt < self.config().join_attempts => {
                debug!(node = %me, attempt, ?err, "retrying join");
                let delay = self.config().join_retry_delay;
                self.set_timer(me, delay, "join-retry", move |net: &mut Network<P>| {
                    net.join_attempt(me, introducer, attempt + 1, callback)
                });
            }
            Err(err) => {
                debug!(node = %me, attempt, ?err, "join failed");
                if let Some(node) = self.nodes.get_mut(&me) {
                    if node.lifecycle == Lifecycle::Inserting {
                        node.lifecycle = Lifecycle::Out;
                    }
                }
                callback(self, Err(err))
            }
        }
    }

    /// Ask `found` to take `me` as its successor, then link `me` between them.
    fn splice(&mut self, me: NodeHandle, found: NodeHandle, callback: Callback<P, ()>) {
        self.request_payload(
            me,
            Target::Node(found),
            Payload::Splice { joiner: me },
            Box::new(
                move |net: &mut Network<P>, result: Result<Payload<P::Body>, Error>| match result {
                    Ok(Payload::Spliced { successor }) => {
                        if let Some(node) = net.nodes.get_mut(&me) {
                            node.predecessor = Some(found);
                            node.successor = Some(successor);
                            node.lifecycle = Lifecycle::Inserted;
                        }
                        let relink = Payload::Relink {
                            predecessor: Some(me),
                            successor: None,
                        };
                        if let Err(err) = net.notify_payload(me, Target::Node(successor), relink) {
                            debug!(node = %me, %successor, ?err, "failed to relink successor");
                        }
                        info!(node = %me, predecessor = %found, %successor, "joined ring");
                        callback(net, Ok(()))
                    }
                    Ok(other) => callback(net, Err(Error::UnexpectedReply(other.name()))),
                    Err(err) => callback(net, Err(err)),
                },
            ),
        );
    }

    pub(crate) fn serve_splice(&mut self, me: NodeHandle, inbound: Inbound, joiner: NodeHandle) {
        let Some(node) = self.nodes.get_mut(&me) else {
            return;
        };
        let successor = node.successor.unwrap_or(me);
        if node.lifecycle != Lifecycle::Inserted
            || !is_ordered_open(&me.id(), &joiner.id(), &successor.id())
        {
            let reason = format!("{joiner} does not fit between {me} and {successor}");
            return self.respond(me, &inbound, Err(Rejection::Retriable(reason)));
        }
        node.successor = Some(joiner);
        debug!(node = %me, %joiner, "spliced successor");
        self.respond(me, &inbound, Ok(Payload::Spliced { successor }));
    }

    pub(crate) fn relink(
        &mut self,
        me: NodeHandle,
        predecessor: Option<NodeHandle>,
        successor: Option<NodeHandle>,
    ) {
        let Some(node) = self.nodes.get_mut(&me) else {
            return;
        };
        if let Some(predecessor) = predecessor {
            node.predecessor = Some(predecessor);
        }
        if let Some(successor) = successor {
            node.successor = Some(successor);
        }
        debug!(node = %me, ?predecessor, ?successor, "relinked");
    }

    /// Take `me` out of the ring. Neighbours are relinked immediately, `me` keeps serving
    /// lookups for `grace_period`, and then it is evicted.
    pub fn leave(&mut self, me: NodeHandle, callback: Callback<P, ()>) {
        let Some(node) = self.nodes.get_mut(&me).filter(|node| !node.failed) else {
            return self.complete(callback, Err(Error::NotResident(me.id())));
        };
        if node.lifecycle != Lifecycle::Inserted {
            return self.complete(callback, Err(Error::NotInserted(me.id())));
        }
        node.lifecycle = Lifecycle::Deleting;

        let mut strategies = self.take_strategies(&me);
        let mut pending = Some(callback);
        for strategy in strategies.iter_mut().rev() {
            let Some(callback) = pending.take() else {
                break;
            };
            pending = strategy.leave(self, me, callback);
        }
        self.restore_strategies(&me, strategies);
        if let Some(callback) = pending {
            self.depart(me, callback);
        }
    }

    fn depart(&mut self, me: NodeHandle, callback: Callback<P, ()>) {
        let Some(node) = self.nodes.get_mut(&me) else {
            return self.complete(callback, Err(Error::NotResident(me.id())));
        };
        let predecessor = node.predecessor.filter(|node| *node != me);
        let successor = node.successor.filter(|node| *node != me);
        node.lifecycle = Lifecycle::Grace;
        if let (Some(predecessor), Some(successor)) = (predecessor, successor) {
            let relinks = [
                (
                    predecessor,
                    Payload::Relink {
                        predecessor: None,
                        successor: Some(successor),
                    },
                ),
                (
                    successor,
                    Payload::Relink {
                        predecessor: Some(predecessor),
                        successor: None,
                    },
                ),
            ];
            for (neighbour, relink) in relinks {
                if let Err(err) = self.notify_payload(me, Target::Node(neighbour), relink) {
                    debug!(node = %me, %neighbour, ?err, "failed to relink neighbour");
                }
            }
        }
        let grace = self.config().grace_period;
        self.set_timer(me, grace, "grace", move |net: &mut Network<P>| {
            if let Some(node) = net.nodes.get_mut(&me) {
                node.lifecycle = Lifecycle::Deleted;
            }
            net.remove(&me);
            info!(node = %me, "left ring");
            callback(net, Ok(()))
        });
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        network::tests::{Echo, Msg},
        Config, Error, Lifecycle, Network, NodeHandle, NodeId, PeerId, Star,
    };
    use ringsim_macros::test_traced;
    use ringsim_runtime::Until;
    use std::{
        sync::{Arc, Mutex},
        time::Duration,
    };

    type Done = Arc<Mutex<Vec<(Duration, Result<(), Error>)>>>;

    fn record(done: &Done) -> crate::Callback<Echo, ()> {
        let done = done.clone();
        Box::new(move |net: &mut Network<Echo>, result: Result<(), Error>| {
            done.lock().unwrap().push((net.now(), result));
        })
    }

    fn network() -> Network<Echo> {
        Network::new(Config::default(), Star::new(Duration::from_millis(5))).unwrap()
    }

    /// Walk successor links from `start` and return the keys seen.
    fn walk(net: &Network<Echo>, start: NodeHandle) -> Vec<u64> {
        let mut keys = vec![start.key()];
        let mut current = net.successor(&start).unwrap();
        while current != start && keys.len() <= net.nodes().len() {
            keys.push(current.key());
            current = net.successor(&current).unwrap();
        }
        keys
    }

    fn assert_consistent(net: &Network<Echo>) {
        for node in net.nodes() {
            let successor = net.successor(&node).unwrap();
            assert_eq!(net.predecessor(&successor), Some(node), "{successor} has wrong predecessor");
        }
    }

    #[test]
    fn test_bootstrap_links_ring() {
        let mut net = network();
        let ring = net
            .bootstrap(
                [300, 0, 200, 100].map(|key| NodeId::new(key, PeerId(key as u32))),
                |_| Vec::new(),
            )
            .unwrap();
        assert_eq!(walk(&net, ring[0]), vec![0, 100, 200, 300]);
        assert_consistent(&net);
        assert!(matches!(
            net.bootstrap([NodeId::new(0, PeerId(0))], |_| Vec::new()),
            Err(Error::Duplicate(_))
        ));
    }

    #[test_traced]
    fn test_join_sequence() {
        let mut net = network();
        let first = net.add_node(NodeId::new(500, PeerId(0)), Vec::new()).unwrap();
        net.init_initial_node(first).unwrap();
        assert_eq!(net.successor(&first), Some(first));

        let done = Done::default();
        for key in [100, 900, 300, 700] {
            let joiner = net.add_node(NodeId::new(key, PeerId(key as u32)), Vec::new()).unwrap();
            net.join(joiner, first, record(&done));
            net.run(Until::Idle);
        }
        let done = done.lock().unwrap();
        assert_eq!(done.len(), 4);
        assert!(done.iter().all(|(_, result)| result.is_ok()));
        assert_eq!(walk(&net, first), vec![500, 700, 900, 100, 300]);
        assert_consistent(&net);
        for node in net.nodes() {
            assert_eq!(net.node(&node).unwrap().lifecycle(), Lifecycle::Inserted);
        }
    }

    #[test_traced]
    fn test_concurrent_joins_retry() {
        let mut net = network();
        let first = net.add_node(NodeId::new(0, PeerId(0)), Vec::new()).unwrap();
        net.init_initial_node(first).unwrap();

        // Both joiners find node 0 responsible. Once 100 is spliced in, 200 no longer fits
        // after 0 and has to retry.
        let done = Done::default();
        let a = net.add_node(NodeId::new(100, PeerId(1)), Vec::new()).unwrap();
        let b = net.add_node(NodeId::new(200, PeerId(2)), Vec::new()).unwrap();
        net.join(a, first, record(&done));
        net.join(b, first, record(&done));
        net.run(Until::Idle);

        let done = done.lock().unwrap();
        assert_eq!(done.len(), 2);
        assert!(done.iter().all(|(_, result)| result.is_ok()));
        assert!(done.iter().any(|(at, _)| *at >= net.config().join_retry_delay));
        assert_eq!(walk(&net, first), vec![0, 100, 200]);
        assert_consistent(&net);
    }

    #[test_traced]
    fn test_join_through_dead_introducer() {
        let mut net = network();
        let ring = net
            .bootstrap([NodeId::new(0, PeerId(0))], |_| Vec::new())
            .unwrap();
        net.fail(&ring[0]);
        let joiner = net.add_node(NodeId::new(50, PeerId(5)), Vec::new()).unwrap();
        let done = Done::default();
        net.join(joiner, ring[0], record(&done));
        net.run(Until::Idle);

        let done = done.lock().unwrap();
        assert_eq!(done.len(), 1);
        assert!(matches!(done[0].1, Err(Error::AckTimeout(_))));
        assert_eq!(net.node(&joiner).unwrap().lifecycle(), Lifecycle::Out);
    }

    #[test_traced]
    fn test_join_requires_node_out_of_ring() {
        let mut net = network();
        let ring = net
            .bootstrap(
                (0..4).map(|i| NodeId::new(i * 100, PeerId(i as u32))),
                |_| Vec::new(),
            )
            .unwrap();
        let done = Done::default();
        net.join(ring[2], ring[0], record(&done));
        net.run(Until::Idle);

        let done = done.lock().unwrap();
        assert_eq!(done.len(), 1);
        assert!(matches!(done[0].1, Err(Error::AlreadyInserted(id)) if id == ring[2].id()));
        assert_eq!(net.node(&ring[2]).unwrap().lifecycle(), Lifecycle::Inserted);
        assert_eq!(net.successor(&ring[2]), Some(ring[3]));
        assert_eq!(walk(&net, ring[0]), vec![0, 100, 200, 300]);
        assert_consistent(&net);
        assert_eq!(net.messages(), 0);
    }

    #[test_traced]
    fn test_leave_relinks_and_evicts() {
        let mut net = network();
        let ring = net
            .bootstrap(
                (0..4).map(|i| NodeId::new(i * 100, PeerId(i as u32))),
                |_| Vec::new(),
            )
            .unwrap();
        let done = Done::default();
        net.leave(ring[2], record(&done));
        assert_eq!(net.node(&ring[2]).unwrap().lifecycle(), Lifecycle::Grace);

        // While leaving, the node still routes lookups but rejects other requests.
        let rejected = Arc::new(Mutex::new(None));
        let slot = rejected.clone();
        net.request(
            ring[0],
            ring[2],
            Msg::Ping(1),
            Box::new(move |_: &mut Network<Echo>, result: Result<Msg, Error>| {
                *slot.lock().unwrap() = Some(result);
            }),
        );
        net.run(Until::Idle);

        assert!(matches!(
            *rejected.lock().unwrap(),
            Some(Err(Error::GraceStateRejected))
        ));
        let done = done.lock().unwrap();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].0, net.config().grace_period);
        assert!(net.node(&ring[2]).is_none());
        assert_eq!(walk(&net, ring[0]), vec![0, 100, 300]);
        assert_consistent(&net);

        let mut net = network();
        let lone = net.add_node(NodeId::new(1, PeerId(1)), Vec::new()).unwrap();
        let done = Done::default();
        net.leave(lone, record(&done));
        net.run(Until::Idle);
        assert!(matches!(done.lock().unwrap()[0].1, Err(Error::NotInserted(_))));
    }
}
