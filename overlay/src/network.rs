//! Request, reply, and ack exchange between resident nodes.

use crate::{
    arena::Arena,
    config::Config,
    identity::{NodeHandle, NodeId, Target},
    message::{Inbound, Kind, Message, Payload, Rejection, RequestId},
    metrics::Metrics,
    node::{Cleanup, Lifecycle, LocalNode, Record},
    transport::{Fate, Transport},
    Callback, Error, OnFailure, Protocol, Strategy,
};
use rand::{rngs::StdRng, SeedableRng};
use ringsim_runtime::{self as runtime, Auditor, Outcome, Scheduler, Tag, Timer, Until};
use std::{sync::Arc, time::Duration};
use tracing::{debug, trace, warn};

/// A set of simulated nodes sharing one scheduler and one transport.
///
/// All protocol activity happens inside actions run by [Network::run]. Other threads may
/// only interact through a clone of [Network::scheduler].
pub struct Network<P: Protocol> {
    cfg: Config,
    scheduler: Scheduler<Network<P>>,
    transport: Box<dyn Transport>,
    rng: StdRng,
    pub(crate) nodes: Arena<LocalNode<P>>,
    sequence: u64,
    pub(crate) metrics: Metrics,
    shared: P::Shared,
}

impl<P: Protocol> Network<P> {
    /// Create an empty network.
    pub fn new(cfg: Config, transport: impl Transport) -> Result<Self, Error> {
        cfg.validate()?;
        let scheduler = Scheduler::new(runtime::Config { mode: cfg.mode });
        let metrics = Metrics::init(&scheduler);
        let mut net = Self {
            rng: StdRng::seed_from_u64(cfg.seed),
            cfg,
            scheduler,
            transport: Box::new(transport),
            nodes: Arena::default(),
            sequence: 0,
            metrics,
            shared: P::Shared::default(),
        };
        P::init(&mut net);
        Ok(net)
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    /// Handle to the scheduler driving this network.
    pub fn scheduler(&self) -> Scheduler<Self> {
        self.scheduler.clone()
    }

    pub fn now(&self) -> Duration {
        self.scheduler.now()
    }

    /// Process queued actions until `until` is satisfied.
    pub fn run(&mut self, until: Until) -> Outcome {
        let scheduler = self.scheduler.clone();
        scheduler.run(self, until)
    }

    pub fn auditor(&self) -> Arc<Auditor> {
        self.scheduler.auditor()
    }

    /// Messages delivered between distinct nodes so far.
    pub fn messages(&self) -> u64 {
        self.scheduler.messages()
    }

    pub fn messages_of(&self, kind: &str) -> u64 {
        self.scheduler.messages_of(kind)
    }

    /// Encode all metrics in the Prometheus text format.
    pub fn encode(&self) -> String {
        self.scheduler.encode()
    }

    /// Add a node in [Lifecycle::Out] with the given strategy stack (bottom first).
    pub fn add_node(
        &mut self,
        id: NodeId,
        mut strategies: Vec<Box<dyn Strategy<P>>>,
    ) -> Result<NodeHandle, Error> {
        let handle = self
            .nodes
            .insert(id, LocalNode::new(id, Vec::new()))
            .ok_or(Error::Duplicate(id))?;
        for strategy in strategies.iter_mut() {
            strategy.activate(&handle);
        }
        if let Some(node) = self.nodes.get_mut(&handle) {
            node.strategies = strategies;
        }
        debug!(node = %handle, "added node");
        Ok(handle)
    }

    pub fn node(&self, me: &NodeHandle) -> Option<&LocalNode<P>> {
        self.nodes.get(me)
    }

    pub fn node_mut(&mut self, me: &NodeHandle) -> Option<&mut LocalNode<P>> {
        self.nodes.get_mut(me)
    }

    /// Application state of a resident node.
    pub fn state(&self, me: &NodeHandle) -> Option<&P::State> {
        self.nodes.get(me).map(|node| &node.state)
    }

    pub fn state_mut(&mut self, me: &NodeHandle) -> Option<&mut P::State> {
        self.nodes.get_mut(me).map(|node| &mut node.state)
    }

    /// Protocol state shared by all nodes.
    pub fn shared(&self) -> &P::Shared {
        &self.shared
    }

    pub fn shared_mut(&mut self) -> &mut P::Shared {
        &mut self.shared
    }

    /// Fresh handle for a resident node.
    pub fn resolve(&self, id: &NodeId) -> Option<NodeHandle> {
        self.nodes.resolve(id)
    }

    /// Every resident node (failed ones included) in ring order.
    pub fn nodes(&self) -> Vec<NodeHandle> {
        self.nodes.handles()
    }

    /// Whether `me` is resident and has not been failed.
    pub fn is_live(&self, me: &NodeHandle) -> bool {
        self.nodes.get(me).is_some_and(|node| !node.failed)
    }

    pub fn successor(&self, me: &NodeHandle) -> Option<NodeHandle> {
        self.nodes.get(me).and_then(|node| node.successor)
    }

    pub fn predecessor(&self, me: &NodeHandle) -> Option<NodeHandle> {
        self.nodes.get(me).and_then(|node| node.predecessor)
    }

    fn resolve_target(&self, target: &Target) -> Option<NodeHandle> {
        match target {
            Target::Node(node) => self.nodes.resolve(&node.id()),
            Target::Any(peer) => self
                .nodes
                .on_peer(*peer)
                .into_iter()
                .find(|node| self.is_live(node)),
        }
    }

    pub(crate) fn take_strategies(&mut self, me: &NodeHandle) -> Vec<Box<dyn Strategy<P>>> {
        self.nodes
            .get_mut(me)
            .map(|node| std::mem::take(&mut node.strategies))
            .unwrap_or_default()
    }

    pub(crate) fn restore_strategies(
        &mut self,
        me: &NodeHandle,
        strategies: Vec<Box<dyn Strategy<P>>>,
    ) {
        if let Some(node) = self.nodes.get_mut(me) {
            node.strategies = strategies;
        }
    }

    /// Crash a node: it keeps its identity but silently ignores every message and timer,
    /// and forgets its outstanding requests.
    pub fn fail(&mut self, me: &NodeHandle) -> bool {
        let Some(node) = self.nodes.get_mut(me) else {
            return false;
        };
        node.failed = true;
        node.lifecycle = Lifecycle::Deleted;
        self.forget(me);
        debug!(node = %me, "failed node");
        true
    }

    /// Evict a node. Handles to it stop resolving.
    pub fn remove(&mut self, me: &NodeHandle) -> bool {
        self.forget(me);
        let removed = self.nodes.remove(me).is_some();
        if removed {
            debug!(node = %me, "removed node");
        }
        removed
    }

    /// Drop every outstanding request and suspicion of `me` without running callbacks.
    fn forget(&mut self, me: &NodeHandle) {
        let Some(node) = self.nodes.get_mut(me) else {
            return;
        };
        let records: Vec<Record<P>> = node.pending.drain().map(|(_, record)| record).collect();
        node.unacked.clear();
        let purges: Vec<Timer> = node.suspected.drain().map(|(_, timer)| timer).collect();
        for record in records {
            for step in record.cleanup {
                if let Cleanup::Timer(timer) = step {
                    self.scheduler.cancel(timer);
                }
            }
        }
        for timer in purges {
            self.scheduler.cancel(timer);
        }
    }

    /// Run `action` after `delay`, unless `me` has been failed or evicted by then.
    pub fn set_timer<F>(&self, me: NodeHandle, delay: Duration, label: &'static str, action: F) -> Timer
    where
        F: FnOnce(&mut Network<P>) + Send + 'static,
    {
        self.scheduler
            .schedule(delay, Tag::timer(label), move |net: &mut Network<P>| {
                if net.is_live(&me) {
                    action(net);
                } else {
                    trace!(node = %me, label, "skipping timer of dead node");
                }
            })
    }

    pub fn cancel_timer(&self, timer: Timer) -> bool {
        self.scheduler.cancel(timer)
    }

    /// Deliver an outcome from a fresh action instead of the current call stack.
    pub(crate) fn complete<T: Send + 'static>(&self, callback: Callback<P, T>, result: Result<T, Error>) {
        self.scheduler.schedule(
            Duration::ZERO,
            Tag::timer("complete"),
            move |net: &mut Network<P>| callback(net, result),
        );
    }

    /// Avoid `node` when routing from `me` until the suspect window passes.
    pub fn suspect(&mut self, me: NodeHandle, node: NodeId) {
        if !self.nodes.contains(&me) {
            return;
        }
        let purge = self.scheduler.schedule(
            self.cfg.suspect_window,
            Tag::timer("unsuspect"),
            move |net: &mut Network<P>| {
                if let Some(local) = net.nodes.get_mut(&me) {
                    local.suspected.remove(&node);
                }
            },
        );
        let Some(local) = self.nodes.get_mut(&me) else {
            return;
        };
        if let Some(previous) = local.suspected.insert(node, purge) {
            self.scheduler.cancel(previous);
        }
        debug!(node = %me, suspect = %node, "suspecting node");
    }

    pub fn is_suspected(&self, me: &NodeHandle, node: &NodeId) -> bool {
        self.nodes
            .get(me)
            .is_some_and(|local| local.is_suspected(node))
    }

    /// Hand a message to the transport. Returns an error if the transport refuses it.
    fn post(
        &mut self,
        sender: NodeHandle,
        receiver: Target,
        origin: NodeHandle,
        mut route: Vec<NodeId>,
        kind: Kind<P::Body>,
    ) -> Result<(), Error> {
        let fate = self
            .transport
            .transmit(sender.peer(), receiver.peer(), &mut self.rng)?;
        let name = kind.name();
        let Fate::Deliver(delay) = fate else {
            self.metrics.record_drop("lost");
            debug!(%sender, %receiver, kind = name, reason = "lost in transit", "dropping message");
            return Ok(());
        };
        if route.last() != Some(&sender.id()) {
            route.push(sender.id());
        }
        self.sequence += 1;
        let remote = receiver != Target::Node(sender);
        let message = Message {
            sender,
            receiver,
            origin,
            delay,
            sequence: self.sequence,
            route_with_failed: route.clone(),
            route,
            kind,
        };
        trace!(%sender, %receiver, kind = name, ?delay, "sending message");
        self.scheduler.schedule(
            delay,
            Tag::message(name, remote),
            move |net: &mut Network<P>| net.receive(message),
        );
        Ok(())
    }

    /// Post a message nobody waits on. Failures are only logged.
    fn send(&mut self, sender: NodeHandle, receiver: Target, origin: NodeHandle, kind: Kind<P::Body>) {
        if let Err(err) = self.post(sender, receiver, origin, Vec::new(), kind) {
            self.metrics.record_drop("transport");
            debug!(%sender, %receiver, ?err, "dropping message");
        }
    }

    /// Send a request from `me`. `callback` runs exactly once with the reply or a failure.
    pub fn request(
        &mut self,
        me: NodeHandle,
        to: impl Into<Target>,
        body: P::Body,
        callback: Callback<P, P::Body>,
    ) -> Option<RequestId> {
        self.request_payload(
            me,
            to.into(),
            Payload::App(body),
            Box::new(
                move |net: &mut Network<P>, result: Result<Payload<P::Body>, Error>| {
                    let result = result.and_then(|payload| match payload {
                        Payload::App(body) => Ok(body),
                        other => Err(Error::UnexpectedReply(other.name())),
                    });
                    callback(net, result)
                },
            ),
        )
    }

    pub(crate) fn request_payload(
        &mut self,
        me: NodeHandle,
        to: Target,
        payload: Payload<P::Body>,
        callback: Callback<P, Payload<P::Body>>,
    ) -> Option<RequestId> {
        let (ack_timeout, reply_timeout) = (self.cfg.ack_timeout, self.cfg.reply_timeout);
        let Some(node) = self.nodes.get_mut(&me).filter(|node| !node.failed) else {
            self.complete(callback, Err(Error::NotResident(me.id())));
            return None;
        };
        let id = node.next_request();
        let ack = self.scheduler.schedule(
            ack_timeout,
            Tag::timer("ack-timeout"),
            move |net: &mut Network<P>| net.on_ack_timeout(me, id),
        );
        let reply = self.scheduler.schedule(
            reply_timeout,
            Tag::timer("reply-timeout"),
            move |net: &mut Network<P>| net.on_reply_timeout(me, id),
        );
        node.unacked.insert(id);
        node.pending.insert(
            id,
            Record {
                destination: to,
                forwarded: false,
                ack,
                callback: Some(callback),
                cleanup: vec![
                    Cleanup::Timer(ack),
                    Cleanup::Timer(reply),
                    Cleanup::Unacked(id),
                    Cleanup::Pending(id),
                ],
            },
        );
        self.metrics.requests.inc();
        let kind = Kind::Request {
            origin: id,
            hop: id,
            payload,
        };
        if let Err(err) = self.post(me, to, me, Vec::new(), kind) {
            self.fail_later(me, id, err);
        }
        Some(id)
    }

    /// Pass a request received by `me` on to `to`.
    ///
    /// The origin keeps waiting for the final reply, which the last handler sends straight
    /// to it. `me` only waits for `to` to acknowledge; `on_failure` runs if it does not or
    /// if the transport refuses the message.
    pub fn forward(
        &mut self,
        me: NodeHandle,
        to: impl Into<Target>,
        inbound: &Inbound,
        body: P::Body,
        on_failure: OnFailure<P>,
    ) -> Option<RequestId> {
        self.forward_payload(
            me,
            to.into(),
            inbound,
            Payload::App(body),
            Box::new(
                move |net: &mut Network<P>, result: Result<Payload<P::Body>, Error>| {
                    if let Err(err) = result {
                        on_failure(net, err);
                    }
                },
            ),
        )
    }

    pub(crate) fn forward_payload(
        &mut self,
        me: NodeHandle,
        to: Target,
        inbound: &Inbound,
        payload: Payload<P::Body>,
        callback: Callback<P, Payload<P::Body>>,
    ) -> Option<RequestId> {
        let ack_timeout = self.cfg.ack_timeout;
        let Some(node) = self.nodes.get_mut(&me).filter(|node| !node.failed) else {
            self.complete(callback, Err(Error::NotResident(me.id())));
            return None;
        };
        let hop = node.next_request();
        let ack = self.scheduler.schedule(
            ack_timeout,
            Tag::timer("ack-timeout"),
            move |net: &mut Network<P>| net.on_ack_timeout(me, hop),
        );
        node.unacked.insert(hop);
        node.pending.insert(
            hop,
            Record {
                destination: to,
                forwarded: true,
                ack,
                callback: Some(callback),
                cleanup: vec![
                    Cleanup::Timer(ack),
                    Cleanup::Unacked(hop),
                    Cleanup::Pending(hop),
                ],
            },
        );
        self.metrics.requests.inc();
        let kind = Kind::Request {
            origin: inbound.origin_id,
            hop,
            payload,
        };
        if let Err(err) = self.post(me, to, inbound.origin, inbound.route.clone(), kind) {
            self.fail_later(me, hop, err);
        }
        Some(hop)
    }

    /// Answer a request at its origin.
    pub fn reply(&mut self, me: NodeHandle, inbound: &Inbound, result: Result<P::Body, Rejection>) {
        self.respond(me, inbound, result.map(Payload::App))
    }

    pub(crate) fn respond(
        &mut self,
        me: NodeHandle,
        inbound: &Inbound,
        result: Result<Payload<P::Body>, Rejection>,
    ) {
        if !self.is_live(&me) {
            self.metrics.record_drop("sender down");
            trace!(node = %me, "not replying from dead node");
            return;
        }
        self.send(
            me,
            Target::Node(inbound.origin),
            inbound.origin,
            Kind::Reply {
                origin: inbound.origin_id,
                result,
            },
        );
    }

    /// Send a one-way message. Only a refusal by the transport is reported.
    pub fn notify(&mut self, me: NodeHandle, to: impl Into<Target>, body: P::Body) -> Result<(), Error> {
        self.notify_payload(me, to.into(), Payload::App(body))
    }

    pub(crate) fn notify_payload(
        &mut self,
        me: NodeHandle,
        to: Target,
        payload: Payload<P::Body>,
    ) -> Result<(), Error> {
        if !self.is_live(&me) {
            return Err(Error::NotResident(me.id()));
        }
        self.post(me, to, me, Vec::new(), Kind::OneWay { payload })
    }

    /// Abandon an outstanding request. Its callback never runs.
    pub fn cancel_request(&mut self, me: &NodeHandle, id: RequestId) -> bool {
        let Some(record) = self.take_record(me, id) else {
            return false;
        };
        self.finalize(me, record.cleanup);
        true
    }

    fn take_record(&mut self, me: &NodeHandle, id: RequestId) -> Option<Record<P>> {
        self.nodes.get_mut(me)?.pending.remove(&id)
    }

    fn finalize(&mut self, me: &NodeHandle, cleanup: Vec<Cleanup>) {
        for step in cleanup {
            match step {
                Cleanup::Timer(timer) => {
                    self.scheduler.cancel(timer);
                }
                Cleanup::Pending(id) => {
                    if let Some(node) = self.nodes.get_mut(me) {
                        node.pending.remove(&id);
                    }
                }
                Cleanup::Unacked(id) => {
                    if let Some(node) = self.nodes.get_mut(me) {
                        node.unacked.remove(&id);
                    }
                }
            }
        }
    }

    fn fail_later(&self, me: NodeHandle, id: RequestId, err: Error) {
        debug!(node = %me, request = id.0, ?err, "transmission failed");
        self.scheduler.schedule(
            Duration::ZERO,
            Tag::timer("network-error"),
            move |net: &mut Network<P>| {
                let Some(record) = net.take_record(&me, id) else {
                    return;
                };
                net.finalize(&me, record.cleanup);
                if let Some(callback) = record.callback {
                    callback(net, Err(err));
                }
            },
        );
    }

    fn on_ack_timeout(&mut self, me: NodeHandle, id: RequestId) {
        let Some(node) = self.nodes.get_mut(&me) else {
            return;
        };
        if !node.unacked.remove(&id) {
            return;
        }
        let Some(record) = node.pending.get_mut(&id) else {
            return;
        };
        let destination = record.destination;
        let forwarded = record.forwarded;
        let callback = record.callback.take();
        self.metrics.ack_timeouts.inc();
        debug!(node = %me, request = id.0, %destination, "ack timeout");
        if let Target::Node(suspect) = destination {
            self.suspect(me, suspect.id());
        }
        if forwarded {
            if let Some(record) = self.take_record(&me, id) {
                self.finalize(&me, record.cleanup);
            }
        }
        if let Some(callback) = callback {
            callback(self, Err(Error::AckTimeout(destination)));
        }
    }

    fn on_reply_timeout(&mut self, me: NodeHandle, id: RequestId) {
        let Some(node) = self.nodes.get_mut(&me) else {
            return;
        };
        let Some(record) = node.pending.remove(&id) else {
            return;
        };
        if node.unacked.contains(&id) {
            warn!(node = %me, request = id.0, "ack timer missing at reply timeout");
        }
        self.metrics.reply_timeouts.inc();
        self.finalize(&me, record.cleanup);
        match record.callback {
            Some(callback) => {
                debug!(node = %me, request = id.0, destination = %record.destination, "reply timeout");
                callback(self, Err(Error::Timeout));
            }
            None => trace!(node = %me, request = id.0, "reply timeout after ack timeout"),
        }
    }

    fn on_ack(&mut self, me: NodeHandle, hop: RequestId) {
        let Some(node) = self.nodes.get_mut(&me) else {
            return;
        };
        if !node.unacked.remove(&hop) {
            trace!(node = %me, request = hop.0, "ignoring ack");
            return;
        }
        let Some(record) = node.pending.get(&hop) else {
            return;
        };
        if record.forwarded {
            if let Some(record) = self.take_record(&me, hop) {
                self.finalize(&me, record.cleanup);
            }
        } else {
            self.scheduler.cancel(record.ack);
        }
    }

    fn on_reply(&mut self, me: NodeHandle, id: RequestId, result: Result<Payload<P::Body>, Rejection>) {
        let Some(record) = self.take_record(&me, id) else {
            trace!(node = %me, request = id.0, "ignoring late reply");
            return;
        };
        self.finalize(&me, record.cleanup);
        if let Some(callback) = record.callback {
            callback(self, result.map_err(Error::from));
        }
    }

    fn receive(&mut self, mut message: Message<P::Body>) {
        let name = message.kind.name();
        let Some(me) = self.resolve_target(&message.receiver) else {
            self.metrics.record_drop("not resident");
            debug!(receiver = %message.receiver, kind = name, reason = "not resident", "dropping message");
            return;
        };
        message.route_with_failed.push(me.id());
        let Some(node) = self.nodes.get(&me) else {
            return;
        };
        if node.failed || node.lifecycle == Lifecycle::Deleted {
            self.metrics.record_drop("unresponsive");
            debug!(node = %me, kind = name, reason = "unresponsive", "dropping message");
            return;
        }
        if node.lifecycle == Lifecycle::Grace {
            match &message.kind {
                Kind::Ack { .. }
                | Kind::Reply { .. }
                | Kind::Request {
                    payload: Payload::Lookup { .. },
                    ..
                } => {}
                Kind::Request { origin, hop, .. } => {
                    let (origin_id, hop) = (*origin, *hop);
                    debug!(node = %me, kind = name, "rejecting request while leaving");
                    self.send(me, Target::Node(message.sender), message.origin, Kind::Ack { hop });
                    self.send(
                        me,
                        Target::Node(message.origin),
                        message.origin,
                        Kind::Reply {
                            origin: origin_id,
                            result: Err(Rejection::Grace),
                        },
                    );
                    return;
                }
                Kind::OneWay { .. } => {
                    self.metrics.record_drop("leaving");
                    debug!(node = %me, kind = name, reason = "leaving", "dropping message");
                    return;
                }
            }
        }
        message.route.push(me.id());
        match message.kind {
            Kind::Ack { hop } => self.on_ack(me, hop),
            Kind::Reply { origin, result } => self.on_reply(me, origin, result),
            Kind::Request {
                origin,
                hop,
                payload,
            } => {
                self.send(me, Target::Node(message.sender), message.origin, Kind::Ack { hop });
                let inbound = Inbound {
                    origin: message.origin,
                    origin_id: origin,
                    sender: message.sender,
                    hop,
                    route: message.route,
                };
                match payload {
                    Payload::App(body) => P::on_request(self, me, inbound, body),
                    payload => self.serve(me, inbound, payload),
                }
            }
            Kind::OneWay { payload } => match payload {
                Payload::App(body) => P::on_message(self, me, message.sender, body),
                Payload::Relink {
                    predecessor,
                    successor,
                } => self.relink(me, predecessor, successor),
                other => warn!(node = %me, kind = other.name(), "unexpected one-way message"),
            },
        }
    }

    /// Handle a request addressed to the overlay itself.
    fn serve(&mut self, me: NodeHandle, inbound: Inbound, payload: Payload<P::Body>) {
        match payload {
            Payload::Lookup { key } => self.serve_lookup(me, inbound, key),
            Payload::Splice { joiner } => self.serve_splice(me, inbound, joiner),
            other => {
                warn!(node = %me, kind = other.name(), "unexpected request");
                self.respond(
                    me,
                    &inbound,
                    Err(Rejection::Retriable(format!("unexpected {}", other.name()))),
                );
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{identity::PeerId, message::Body, Simulated, Star};
    use ringsim_macros::test_traced;
    use std::sync::Mutex;

    #[derive(Clone, Debug, PartialEq)]
    pub(crate) enum Msg {
        Ping(u64),
        Pong(u64),
        /// Never answered.
        Hold,
        /// Forward a ping to another node.
        Relay(u64, NodeId),
        Note(u64),
    }

    impl Body for Msg {
        fn name(&self) -> &'static str {
            match self {
                Msg::Ping(_) => "Ping",
                Msg::Pong(_) => "Pong",
                Msg::Hold => "Hold",
                Msg::Relay(..) => "Relay",
                Msg::Note(_) => "Note",
            }
        }
    }

    pub(crate) struct Echo;

    impl Protocol for Echo {
        type Body = Msg;
        type State = Vec<u64>;
        type Shared = ();

        fn on_request(net: &mut Network<Self>, me: NodeHandle, inbound: Inbound, body: Msg) {
            match body {
                Msg::Ping(value) => net.reply(me, &inbound, Ok(Msg::Pong(value))),
                Msg::Relay(value, to) => {
                    let retry = inbound.clone();
                    net.forward(
                        me,
                        NodeHandle::detached(to),
                        &inbound,
                        Msg::Ping(value),
                        Box::new(move |net: &mut Network<Echo>, err: Error| {
                            net.reply(me, &retry, Err(Rejection::Retriable(err.to_string())))
                        }),
                    );
                }
                Msg::Hold => {}
                other => net.reply(me, &inbound, Err(Rejection::Retriable(format!("{other:?}")))),
            }
        }

        fn on_message(net: &mut Network<Self>, me: NodeHandle, _from: NodeHandle, body: Msg) {
            if let (Msg::Note(value), Some(notes)) = (body, net.state_mut(&me)) {
                notes.push(value);
            }
        }
    }

    type Outcomes = Arc<Mutex<Vec<(Duration, Result<Msg, Error>)>>>;

    fn record(outcomes: &Outcomes) -> Callback<Echo, Msg> {
        let outcomes = outcomes.clone();
        Box::new(move |net: &mut Network<Echo>, result: Result<Msg, Error>| {
            outcomes.lock().unwrap().push((net.now(), result));
        })
    }

    fn ms(ms: u64) -> Duration {
        Duration::from_millis(ms)
    }

    /// Four nodes at 0, 100, 200, 300 on distinct peers, 5ms from the hub each.
    fn network() -> (Network<Echo>, Vec<NodeHandle>) {
        let mut net = Network::new(Config::default(), Star::new(ms(5))).unwrap();
        let ring = net
            .bootstrap(
                (0..4).map(|i| NodeId::new(i * 100, PeerId(i as u32))),
                |_| Vec::new(),
            )
            .unwrap();
        (net, ring)
    }

    #[test_traced]
    fn test_request_reply() {
        let (mut net, ring) = network();
        let outcomes = Outcomes::default();
        net.request(ring[0], ring[1], Msg::Ping(1), record(&outcomes));
        assert_eq!(net.run(Until::Idle), Outcome::Idle);

        let outcomes = outcomes.lock().unwrap();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].0, ms(20));
        assert!(matches!(outcomes[0].1, Ok(Msg::Pong(1))));
        assert_eq!(net.messages_of("Ping"), 1);
        assert_eq!(net.messages_of("Ack"), 1);
        assert_eq!(net.messages_of("Pong"), 1);
        assert_eq!(net.messages_of("Reply"), 0);
        assert_eq!(net.messages(), 3);

        // Both timers were cancelled and the record is gone.
        let node = net.node(&ring[0]).unwrap();
        assert_eq!(node.outstanding(), 0);
        assert_eq!(node.unacknowledged(), 0);
        assert_eq!(net.scheduler().pending(), 0);
        assert_eq!(net.now(), ms(20));
    }

    #[test_traced]
    fn test_ack_timeout_marks_suspected() {
        let (mut net, ring) = network();
        assert!(net.fail(&ring[1]));
        let outcomes = Outcomes::default();
        net.request(ring[0], ring[1], Msg::Ping(1), record(&outcomes));

        net.run(Until::At(Duration::from_secs(2)));
        {
            let outcomes = outcomes.lock().unwrap();
            assert_eq!(outcomes.len(), 1);
            assert_eq!(outcomes[0].0, net.config().ack_timeout);
            assert!(
                matches!(&outcomes[0].1, Err(Error::AckTimeout(Target::Node(node))) if *node == ring[1])
            );
        }
        assert!(net.is_suspected(&ring[0], &ring[1].id()));
        assert_eq!(net.node(&ring[0]).unwrap().unacknowledged(), 0);

        // The reply timer completes silently.
        let purge = net.config().ack_timeout + net.config().suspect_window;
        net.run(Until::At(purge - ms(1)));
        assert_eq!(outcomes.lock().unwrap().len(), 1);
        assert!(net.is_suspected(&ring[0], &ring[1].id()));

        // The suspicion is purged exactly one window after the ack timeout.
        net.run(Until::At(purge + ms(1)));
        assert!(!net.is_suspected(&ring[0], &ring[1].id()));
        net.run(Until::Idle);
        assert_eq!(net.node(&ring[0]).unwrap().outstanding(), 0);
        assert!(net.encode().contains("overlay_ack_timeouts_total 1"));
        assert!(net.encode().contains("overlay_reply_timeouts_total 1"));
    }

    #[test_traced]
    fn test_reply_timeout_blames_nobody() {
        let (mut net, ring) = network();
        let outcomes = Outcomes::default();
        net.request(ring[0], ring[2], Msg::Hold, record(&outcomes));
        net.run(Until::Idle);

        let outcomes = outcomes.lock().unwrap();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].0, net.config().reply_timeout);
        assert!(matches!(outcomes[0].1, Err(Error::Timeout)));
        assert!(!net.is_suspected(&ring[0], &ring[2].id()));
        assert_eq!(net.node(&ring[0]).unwrap().outstanding(), 0);
    }

    #[test_traced]
    fn test_forwarded_reply_goes_to_origin() {
        let (mut net, ring) = network();
        let outcomes = Outcomes::default();
        net.request(ring[0], ring[1], Msg::Relay(7, ring[2].id()), record(&outcomes));
        net.run(Until::Idle);

        let outcomes = outcomes.lock().unwrap();
        assert_eq!(outcomes.len(), 1);
        // 0 -> 1 -> 2 -> 0, 10ms per leg.
        assert_eq!(outcomes[0].0, ms(30));
        assert!(matches!(outcomes[0].1, Ok(Msg::Pong(7))));
        assert_eq!(net.messages_of("Ack"), 2);
        assert_eq!(net.node(&ring[1]).unwrap().outstanding(), 0);
        assert_eq!(net.scheduler().pending(), 0);
    }

    #[test_traced]
    fn test_forward_failure_reaches_forwarder() {
        let (mut net, ring) = network();
        net.fail(&ring[2]);
        let outcomes = Outcomes::default();
        net.request(ring[0], ring[1], Msg::Relay(7, ring[2].id()), record(&outcomes));
        net.run(Until::Idle);

        let outcomes = outcomes.lock().unwrap();
        assert_eq!(outcomes.len(), 1);
        // Forwarded at 10ms, ack timeout 1s later, rejection travels back in 10ms.
        assert_eq!(outcomes[0].0, ms(1020));
        assert!(matches!(outcomes[0].1, Err(Error::Retriable(_))));
        assert!(!net.is_suspected(&ring[0], &ring[1].id()));
        assert_eq!(net.node(&ring[1]).unwrap().outstanding(), 0);
    }

    #[test_traced]
    fn test_transport_failure_is_asynchronous() {
        let mut net = Network::<Echo>::new(Config::default(), Simulated::new(None).unwrap()).unwrap();
        let ring = net
            .bootstrap([NodeId::new(1, PeerId(1)), NodeId::new(2, PeerId(2))], |_| Vec::new())
            .unwrap();
        let outcomes = Outcomes::default();
        net.request(ring[0], ring[1], Msg::Ping(1), record(&outcomes));
        assert!(outcomes.lock().unwrap().is_empty());

        net.run(Until::Idle);
        let outcomes = outcomes.lock().unwrap();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].0, Duration::ZERO);
        assert!(matches!(outcomes[0].1, Err(Error::NetworkError(_))));
        assert!(!outcomes[0].1.as_ref().unwrap_err().is_retriable());
        assert_eq!(net.scheduler().pending(), 0);
    }

    #[test_traced]
    fn test_grace_rejects_requests() {
        let (mut net, ring) = network();
        net.node_mut(&ring[1]).unwrap().lifecycle = Lifecycle::Grace;
        let outcomes = Outcomes::default();
        net.request(ring[0], ring[1], Msg::Ping(1), record(&outcomes));
        net.notify(ring[0], ring[1], Msg::Note(3)).unwrap();
        net.run(Until::Idle);

        let outcomes = outcomes.lock().unwrap();
        assert_eq!(outcomes.len(), 1);
        assert!(matches!(outcomes[0].1, Err(Error::GraceStateRejected)));
        assert!(net.state(&ring[1]).unwrap().is_empty());
        assert!(!net.is_suspected(&ring[0], &ring[1].id()));
    }

    #[test_traced]
    fn test_wildcard_delivery() {
        let mut net = Network::<Echo>::new(Config::default(), Star::new(ms(5))).unwrap();
        let sender = net.add_node(NodeId::new(0, PeerId(0)), Vec::new()).unwrap();
        let first = net.add_node(NodeId::new(10, PeerId(1)), Vec::new()).unwrap();
        let second = net.add_node(NodeId::new(20, PeerId(1)), Vec::new()).unwrap();

        net.notify(sender, Target::Any(PeerId(1)), Msg::Note(1)).unwrap();
        net.run(Until::Idle);
        assert_eq!(net.state(&first).unwrap(), &vec![1]);

        net.fail(&first);
        net.notify(sender, Target::Any(PeerId(1)), Msg::Note(2)).unwrap();
        net.run(Until::Idle);
        assert_eq!(net.state(&second).unwrap(), &vec![2]);
    }

    #[test_traced]
    fn test_stale_handles_resolve_to_nothing() {
        let (mut net, ring) = network();
        assert!(net.remove(&ring[3]));
        assert!(net.node(&ring[3]).is_none());
        let outcomes = Outcomes::default();
        net.request(ring[0], ring[3], Msg::Ping(1), record(&outcomes));
        net.run(Until::Idle);
        assert!(matches!(
            outcomes.lock().unwrap()[0].1,
            Err(Error::AckTimeout(_))
        ));
        assert!(net.encode().contains("overlay_messages_dropped_total{reason=\"not resident\"} 1"));

        // A failed node cannot originate requests.
        net.fail(&ring[2]);
        let outcomes = Outcomes::default();
        assert!(net
            .request(ring[2], ring[0], Msg::Ping(1), record(&outcomes))
            .is_none());
        net.run(Until::Idle);
        assert!(matches!(
            outcomes.lock().unwrap()[0].1,
            Err(Error::NotResident(_))
        ));
    }

    #[test_traced]
    fn test_cancel_request() {
        let (mut net, ring) = network();
        let outcomes = Outcomes::default();
        let id = net
            .request(ring[0], ring[1], Msg::Hold, record(&outcomes))
            .unwrap();
        assert!(net.cancel_request(&ring[0], id));
        assert!(!net.cancel_request(&ring[0], id));
        net.run(Until::Idle);
        assert!(outcomes.lock().unwrap().is_empty());
        assert_eq!(net.now(), ms(20));
    }

    #[test_traced]
    fn test_timers_skip_dead_nodes() {
        let (mut net, ring) = network();
        let fired = Arc::new(Mutex::new(Vec::new()));
        for node in &ring {
            let fired = fired.clone();
            let key = node.key();
            net.set_timer(*node, ms(10), "tick", move |_| fired.lock().unwrap().push(key));
        }
        net.fail(&ring[1]);
        net.remove(&ring[2]);
        net.run(Until::Idle);
        assert_eq!(*fired.lock().unwrap(), vec![0, 300]);
    }

    fn lossy(seed: u64) -> String {
        let cfg = Config {
            seed,
            ..Config::default()
        };
        let link = crate::Link {
            latency: ms(20),
            jitter: ms(5),
            success_rate: 0.8,
        };
        let mut net = Network::<Echo>::new(cfg, Simulated::new(Some(link)).unwrap()).unwrap();
        let ring = net
            .bootstrap((0..8).map(|i| NodeId::new(i * 10, PeerId(i as u32))), |_| Vec::new())
            .unwrap();
        let outcomes = Outcomes::default();
        for (i, from) in ring.iter().enumerate() {
            let to = ring[(i + 3) % ring.len()];
            net.request(*from, to, Msg::Ping(i as u64), record(&outcomes));
        }
        net.run(Until::Idle);
        assert_eq!(outcomes.lock().unwrap().len(), ring.len());
        net.auditor().state()
    }

    #[test]
    fn test_determinism() {
        for seed in 0..10 {
            assert_eq!(lossy(seed), lossy(seed));
        }
        assert_ne!(lossy(1), lossy(2));
    }
}
