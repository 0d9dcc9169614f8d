//! Greedy key lookup over the nodes' routing entries.

use crate::{
    identity::{NodeHandle, Target},
    message::{Inbound, Payload, Rejection},
    Callback, Error, Hop, Network, Protocol,
};
use ringsim_utils::is_ordered_left;
use tracing::debug;

impl<P: Protocol> Network<P> {
    /// Whether `me` is responsible for `key` (by default, `key` lies in `[me, successor)`).
    pub fn is_responsible(&self, me: &NodeHandle, key: u64) -> bool {
        let Some(node) = self.nodes.get(me) else {
            return false;
        };
        for strategy in node.strategies.iter().rev() {
            if let Some(responsible) = strategy.is_responsible(node, me, key) {
                return responsible;
            }
        }
        match node.successor {
            Some(successor) => is_ordered_left(&me.key(), &key, &successor.key()),
            None => false,
        }
    }

    /// Nodes `me` can route through, itself included, in ring order.
    pub fn routing_entries(&self, me: &NodeHandle) -> Vec<NodeHandle> {
        let Some(node) = self.nodes.get(me) else {
            return Vec::new();
        };
        for strategy in node.strategies.iter().rev() {
            if let Some(entries) = strategy.routing_entries(node, me) {
                return entries;
            }
        }
        node.neighbours(me)
    }

    /// Next step toward the node responsible for `key`: the routing entry that gets
    /// closest to `key` without passing it, skipping suspected nodes.
    pub fn next_hop(&self, me: &NodeHandle, key: u64) -> Hop {
        let Some(node) = self.nodes.get(me) else {
            return Hop::Nowhere;
        };
        for strategy in node.strategies.iter().rev() {
            if let Some(hop) = strategy.handle_lookup(node, me, key) {
                return hop;
            }
        }
        if self.is_responsible(me, key) {
            return Hop::Here;
        }
        let limit = key.wrapping_sub(me.key());
        self.routing_entries(me)
            .into_iter()
            .filter(|entry| entry != me && !node.is_suspected(&entry.id()))
            .map(|entry| (entry.key().wrapping_sub(me.key()), entry))
            .filter(|(progress, _)| *progress > 0 && *progress <= limit)
            .max_by_key(|(progress, _)| *progress)
            .map_or(Hop::Nowhere, |(_, entry)| Hop::Next(entry))
    }

    /// Find the node responsible for `key`, starting from `me`.
    ///
    /// A hop that fails to acknowledge is suspected and routed around. The lookup gives up
    /// with [Error::Unroutable] once no route remains or `max_hops` attempts were made.
    pub fn lookup(&mut self, me: NodeHandle, key: u64, callback: Callback<P, NodeHandle>) {
        self.lookup_via(me, None, key, 0, callback)
    }

    /// Like [Network::lookup], but the first hop is `via` (used by nodes that have no
    /// routing state yet).
    pub(crate) fn lookup_via(
        &mut self,
        me: NodeHandle,
        via: Option<NodeHandle>,
        key: u64,
        attempt: usize,
        callback: Callback<P, NodeHandle>,
    ) {
        if attempt >= self.config().max_hops {
            return self.complete(callback, Err(Error::Unroutable(key)));
        }
        let next = match via {
            Some(introducer) => introducer,
            None => match self.next_hop(&me, key) {
                Hop::Here => return self.complete(callback, Ok(me)),
                Hop::Next(next) => next,
                Hop::Nowhere => return self.complete(callback, Err(Error::Unroutable(key))),
            },
        };
        self.request_payload(
            me,
            Target::Node(next),
            Payload::Lookup { key },
            Box::new(
                move |net: &mut Network<P>, result: Result<Payload<P::Body>, Error>| match result {
                    Ok(Payload::Found { node }) => callback(net, Ok(node)),
                    Ok(other) => callback(net, Err(Error::UnexpectedReply(other.name()))),
                    Err(Error::AckTimeout(_)) if via.is_none() => {
                        debug!(node = %me, key, %next, "rerouting lookup");
                        net.lookup_via(me, None, key, attempt + 1, callback)
                    }
                    Err(err) => callback(net, Err(err)),
                },
            ),
        );
    }

    pub(crate) fn serve_lookup(&mut self, me: NodeHandle, inbound: Inbound, key: u64) {
        if inbound.hops() > self.config().max_hops {
            return self.respond(me, &inbound, Err(Rejection::Unroutable(key)));
        }
        match self.next_hop(&me, key) {
            Hop::Here => self.respond(me, &inbound, Ok(Payload::Found { node: me })),
            Hop::Next(next) => {
                let retry = inbound.clone();
                self.forward_payload(
                    me,
                    Target::Node(next),
                    &inbound,
                    Payload::Lookup { key },
                    Box::new(
                        move |net: &mut Network<P>, result: Result<Payload<P::Body>, Error>| {
                            match result {
                                Ok(_) => {}
                                Err(err @ (Error::AckTimeout(_) | Error::NetworkError(_))) => {
                                    debug!(node = %me, key, %next, ?err, "rerouting forwarded lookup");
                                    net.suspect(me, next.id());
                                    net.serve_lookup(me, retry, key);
                                }
                                Err(err) => {
                                    debug!(node = %me, key, %next, ?err, "dropping forwarded lookup")
                                }
                            }
                        },
                    ),
                );
            }
            Hop::Nowhere => self.respond(me, &inbound, Err(Rejection::Unroutable(key))),
        }
    }

    /// Rebuild every live node's derived routing state from the current ring.
    pub fn stabilize(&mut self) {
        let ring: Vec<NodeHandle> = self
            .nodes()
            .into_iter()
            .filter(|node| self.is_live(node))
            .collect();
        for me in &ring {
            let mut strategies = self.take_strategies(me);
            for strategy in strategies.iter_mut() {
                strategy.refresh(me, &ring);
            }
            self.restore_strategies(me, strategies);
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        network::tests::Echo,
        Config, Error, Fingers, Hop, Inbound, Lifecycle, Network, NodeHandle, NodeId, PeerId,
        RequestId, Star, Strategy,
    };
    use ringsim_macros::test_traced;
    use ringsim_runtime::Until;
    use std::{
        sync::{Arc, Mutex},
        time::Duration,
    };

    type Found = Arc<Mutex<Vec<(Duration, Result<NodeHandle, Error>)>>>;

    fn record(found: &Found) -> crate::Callback<Echo, NodeHandle> {
        let found = found.clone();
        Box::new(move |net: &mut Network<Echo>, result: Result<NodeHandle, Error>| {
            found.lock().unwrap().push((net.now(), result));
        })
    }

    fn ring(keys: &[u64], fingers: bool) -> (Network<Echo>, Vec<NodeHandle>) {
        let mut net = Network::new(Config::default(), Star::new(Duration::from_millis(5))).unwrap();
        let ring = net
            .bootstrap(
                keys.iter().map(|key| NodeId::new(*key, PeerId(*key as u32))),
                |_| {
                    if fingers {
                        vec![Box::new(Fingers::new()) as Box<dyn Strategy<Echo>>]
                    } else {
                        Vec::new()
                    }
                },
            )
            .unwrap();
        (net, ring)
    }

    #[test]
    fn test_responsibility() {
        let (net, ring) = ring(&[0, 100, 200, 300, 400], false);
        assert!(net.is_responsible(&ring[0], 0));
        assert!(net.is_responsible(&ring[0], 99));
        assert!(!net.is_responsible(&ring[0], 100));
        assert!(net.is_responsible(&ring[4], 400));
        assert!(net.is_responsible(&ring[4], u64::MAX));
        assert!(!net.is_responsible(&ring[4], 0));
        assert_eq!(net.next_hop(&ring[0], 250), Hop::Next(ring[1]));
        assert_eq!(net.next_hop(&ring[0], 50), Hop::Here);
        assert_eq!(net.routing_entries(&ring[2]), vec![ring[1], ring[2], ring[3]]);
    }

    #[test_traced]
    fn test_lookup_walks_successors() {
        let (mut net, ring) = ring(&[0, 100, 200, 300, 400], false);
        let (a, b, c) = (Found::default(), Found::default(), Found::default());
        net.lookup(ring[0], 350, record(&a));
        net.lookup(ring[2], 10, record(&b));
        net.lookup(ring[1], 150, record(&c));
        net.run(Until::Idle);

        // 0 -> 100 -> 200 -> 300, then straight back to the origin.
        let a = a.lock().unwrap();
        assert_eq!(*a[0].1.as_ref().unwrap(), ring[3]);
        assert_eq!(a[0].0, Duration::from_millis(40));

        // 200 -> 300 -> 400 -> 0 around the wrap.
        let b = b.lock().unwrap();
        assert_eq!(*b[0].1.as_ref().unwrap(), ring[0]);
        assert_eq!(b[0].0, Duration::from_millis(40));

        // Resolved locally without any traffic.
        let c = c.lock().unwrap();
        assert_eq!(*c[0].1.as_ref().unwrap(), ring[1]);
        assert_eq!(c[0].0, Duration::ZERO);

        assert_eq!(net.messages_of("Lookup"), 6);
        assert_eq!(net.scheduler().pending(), 0);
    }

    #[test_traced]
    fn test_lookup_with_fingers() {
        let keys: Vec<u64> = (0..64).map(|i| i * 1000).collect();
        let (mut net, ring) = ring(&keys, true);
        let found = Found::default();
        net.lookup(ring[0], 40_500, record(&found));
        net.run(Until::Idle);

        let found = found.lock().unwrap();
        assert_eq!(*found[0].1.as_ref().unwrap(), ring[40]);
        // 0 -> 33000 -> 38000 -> 40000 instead of walking 40 successors.
        assert_eq!(net.messages_of("Lookup"), 3);
    }

    #[test_traced]
    fn test_lookup_routes_around_failure() {
        let keys: Vec<u64> = (0..16).map(|i| i * 100).collect();
        let (mut net, ring) = ring(&keys, true);
        net.fail(&ring[6]);
        let found = Found::default();
        net.lookup(ring[0], 750, record(&found));
        net.run(Until::At(Duration::from_secs(5)));

        // The origin and the forwarding hop both give up on 600 and pick other fingers.
        assert!(net.is_suspected(&ring[0], &ring[6].id()));
        assert!(net.is_suspected(&ring[3], &ring[6].id()));
        net.run(Until::Idle);
        let found = found.lock().unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(*found[0].1.as_ref().unwrap(), ring[7]);
        assert!(found[0].0 > Duration::from_secs(2));
    }

    #[test_traced]
    fn test_lookup_unroutable() {
        let (mut net, ring) = ring(&[0, 100, 200], false);
        net.fail(&ring[1]);
        let found = Found::default();
        net.lookup(ring[0], 150, record(&found));
        net.run(Until::Idle);

        let found = found.lock().unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].0, net.config().ack_timeout);
        assert!(matches!(found[0].1, Err(Error::Unroutable(150))));
    }

    #[test_traced]
    fn test_failed_forwarder_blames_nobody() {
        let (mut net, ring) = ring(&[0, 100, 200, 300], false);
        let inbound = Inbound {
            origin: ring[0],
            origin_id: RequestId(0),
            sender: ring[0],
            hop: RequestId(0),
            route: vec![ring[0].id(), ring[1].id()],
        };
        net.fail(&ring[1]);
        assert_eq!(net.next_hop(&ring[1], 250), Hop::Next(ring[2]));
        net.serve_lookup(ring[1], inbound, 250);
        net.run(Until::Idle);

        // The forward never left the failed node, so 200 is not to blame.
        assert!(!net.is_suspected(&ring[1], &ring[2].id()));
        assert_eq!(net.messages(), 0);
    }

    #[test_traced]
    fn test_grace_node_serves_lookups() {
        let (mut net, ring) = ring(&[0, 100, 200, 300], false);
        net.node_mut(&ring[1]).unwrap().lifecycle = Lifecycle::Grace;
        let found = Found::default();
        net.lookup(ring[0], 250, record(&found));
        net.run(Until::Idle);
        assert_eq!(*found.lock().unwrap()[0].1.as_ref().unwrap(), ring[2]);
    }
}
