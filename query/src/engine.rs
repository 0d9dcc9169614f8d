//! Disseminate range queries over the ring and collect their results.
//!
//! Every node a query reaches holds a run: the ranges it was handed, the gaps that are
//! still unresolved, and the children it delegated parts to. A run resolves the ranges it
//! owns itself, splits the rest among its routing entries, and settles once no gap remains.
//! Results only ever shrink gaps, so duplicates (from retransmission or rerouting) are
//! discarded wherever they meet an already settled range.

use crate::{
    delegate::assign, metrics::Metrics, Discipline, Error, Failure, Message, Options, Partial,
    QueryId, Resolver, ResultSink, RunId, SubQuery, Value, ValueProvider,
};
use ringsim_overlay::{
    Body, Error as OverlayError, Inbound, Network, NodeHandle, NodeId, Protocol, Rejection,
    RequestId,
};
use ringsim_runtime::{Tag, Timer};
use ringsim_utils::{Interval, IntervalSet};
use std::{
    collections::{BTreeMap, BTreeSet},
    marker::PhantomData,
    sync::Arc,
    time::Duration,
};
use tracing::{debug, info, trace, warn};

/// The range query protocol, resolving values of type `V`.
pub struct RangeQuery<V>(PhantomData<V>);

type Net<V> = Network<RangeQuery<V>>;

enum Role<V> {
    /// The run that issued the query and reports to the caller.
    Root { sink: Box<dyn ResultSink<V>> },
    /// A share handed over by `parent`. `inbound` is absent for one-way sub-queries.
    Delegate {
        parent: NodeHandle,
        parent_run: RunId,
        inbound: Option<Inbound>,
    },
}

struct Child {
    delegate: NodeHandle,
    ranges: Vec<Interval>,
    request: Option<RequestId>,
}

struct Run<V> {
    query: QueryId,
    root: NodeHandle,
    discipline: Discipline,
    flush: Option<Duration>,
    provider: Arc<dyn ValueProvider<V>>,
    obstacles: BTreeSet<NodeId>,
    ranges: IntervalSet,
    gaps: IntervalSet,
    rvals: BTreeMap<u64, Partial<V>>,
    unsent: Vec<Partial<V>>,
    children: BTreeMap<u64, Child>,
    next_child: u64,
    expiration: Option<Timer>,
    /// Retransmission at the root, flush at delegates.
    periodic: Option<Timer>,
    /// Set at a root that retransmits: failures that a later attempt may overturn are
    /// held in `held` instead of settling their ranges.
    retry: bool,
    held: Vec<Partial<V>>,
    role: Role<V>,
}

impl<V> Run<V> {
    fn new(sub: SubQuery<V>, role: Role<V>) -> Self {
        let ranges: IntervalSet = sub.ranges.into_iter().collect();
        Self {
            query: sub.query,
            root: sub.root,
            discipline: sub.discipline,
            flush: sub.flush,
            provider: sub.provider,
            obstacles: sub.obstacles,
            gaps: ranges.clone(),
            ranges,
            rvals: BTreeMap::new(),
            unsent: Vec::new(),
            children: BTreeMap::new(),
            next_child: 0,
            expiration: None,
            periodic: None,
            retry: false,
            held: Vec::new(),
            role,
        }
    }

    fn is_root(&self) -> bool {
        matches!(self.role, Role::Root { .. })
    }

    /// Part of the gaps that fall within `ranges`.
    fn unresolved(&self, ranges: &[Interval]) -> Vec<Interval> {
        ranges
            .iter()
            .flat_map(|range| self.gaps.intersection(range).into_vec())
            .collect()
    }
}

/// Query runs hosted by one node.
pub struct Runs<V> {
    runs: BTreeMap<RunId, Run<V>>,
    roots: BTreeMap<QueryId, RunId>,
    next_run: u64,
    next_query: u64,
}

impl<V> Default for Runs<V> {
    fn default() -> Self {
        Self {
            runs: BTreeMap::new(),
            roots: BTreeMap::new(),
            next_run: 0,
            next_query: 0,
        }
    }
}

impl<V> Runs<V> {
    /// Number of runs (issued or delegated) still waiting on results.
    pub fn len(&self) -> usize {
        self.runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    /// Whether a query issued by this node is still in progress.
    pub fn is_active(&self, query: &QueryId) -> bool {
        self.roots.contains_key(query)
    }

    fn allocate(&mut self) -> RunId {
        let id = RunId(self.next_run);
        self.next_run += 1;
        id
    }
}

impl<V: Value> Protocol for RangeQuery<V> {
    type Body = Message<V>;
    type State = Runs<V>;
    type Shared = Metrics;

    fn init(net: &mut Net<V>) {
        let metrics = Metrics::init(&net.scheduler());
        *net.shared_mut() = metrics;
    }

    fn on_request(net: &mut Net<V>, me: NodeHandle, inbound: Inbound, body: Message<V>) {
        match body {
            Message::SubQuery(sub) => accept(net, me, inbound.sender, Some(inbound), sub),
            other => {
                warn!(node = %me, kind = other.name(), "unexpected request");
                net.reply(
                    me,
                    &inbound,
                    Err(Rejection::Retriable(format!("unexpected {}", other.name()))),
                );
            }
        }
    }

    fn on_message(net: &mut Net<V>, me: NodeHandle, from: NodeHandle, body: Message<V>) {
        match body {
            Message::SubQuery(sub) => accept(net, me, from, None, sub),
            Message::Direct { query, partials } => {
                let Some(id) = net
                    .state(&me)
                    .and_then(|runs| runs.roots.get(&query).copied())
                else {
                    trace!(node = %me, %query, %from, "ignoring results of finished query");
                    return;
                };
                merge(net, me, id, partials, Vec::new());
            }
            Message::Flush {
                query,
                run,
                partials,
            } => {
                let known = net
                    .state(&me)
                    .and_then(|runs| runs.runs.get(&run))
                    .is_some_and(|waiting| waiting.query == query);
                if !known {
                    trace!(node = %me, %query, %from, "ignoring flush for finished run");
                    return;
                }
                merge(net, me, run, partials, Vec::new());
            }
            Message::Results { .. } => warn!(node = %me, %from, "unexpected one-way results"),
        }
    }
}

impl<V: Value> RangeQuery<V> {
    /// Resolve `ranges` starting at `root`.
    ///
    /// Results are pushed to `sink` as they reach the root, followed by a single `None`
    /// once every range is settled or the query expires. Nothing is pushed before this
    /// call returns.
    pub fn query(
        net: &mut Net<V>,
        root: NodeHandle,
        ranges: impl IntoIterator<Item = Interval>,
        provider: Arc<dyn ValueProvider<V>>,
        options: Options,
        sink: impl ResultSink<V>,
    ) -> Result<QueryId, Error> {
        options.validate()?;
        if !net.is_live(&root) {
            return Err(Error::NotResident(root.id()));
        }
        let ranges: IntervalSet = ranges.into_iter().collect();
        let metrics = net.shared().clone();
        let Some(runs) = net.state_mut(&root) else {
            return Err(Error::NotResident(root.id()));
        };
        let query = QueryId {
            root: root.id(),
            sequence: runs.next_query,
        };
        runs.next_query += 1;
        metrics.started.inc();
        info!(node = %root, %query, ?ranges, discipline = ?options.discipline, "starting query");

        let mut sink: Box<dyn ResultSink<V>> = Box::new(sink);
        if ranges.is_empty() {
            metrics.completed.inc();
            net.set_timer(root, Duration::ZERO, "query-empty", move |_| sink.push(None));
            return Ok(query);
        }

        let id = runs.allocate();
        let sub = SubQuery {
            query,
            root,
            parent_run: id,
            ranges: ranges.clone().into_vec(),
            obstacles: BTreeSet::new(),
            discipline: options.discipline,
            flush: options.flush,
            provider,
        };
        runs.runs.insert(id, Run::new(sub, Role::Root { sink }));
        runs.roots.insert(query, id);

        if options.discipline == Discipline::NoResponse {
            disseminate(net, root, id, ranges);
            net.set_timer(root, Duration::ZERO, "query-sent", move |net: &mut Net<V>| {
                if let Some(run) = take(net, &root, id) {
                    finish(net, root, run);
                }
            });
            return Ok(query);
        }

        let expiration = net.set_timer(
            root,
            options.expiration,
            "query-expiration",
            move |net: &mut Net<V>| expire(net, root, id),
        );
        let periodic = options.retransmission.map(|period| {
            net.set_timer(
                root,
                period,
                "query-retransmission",
                move |net: &mut Net<V>| retransmit(net, root, id, period),
            )
        });
        if let Some(run) = run_mut(net, &root, id) {
            run.expiration = Some(expiration);
            run.retry = periodic.is_some();
            run.periodic = periodic;
        }
        disseminate(net, root, id, ranges);
        Ok(query)
    }
}

fn take<V: Value>(net: &mut Net<V>, me: &NodeHandle, id: RunId) -> Option<Run<V>> {
    net.state_mut(me)?.runs.remove(&id)
}

fn restore<V: Value>(net: &mut Net<V>, me: &NodeHandle, id: RunId, run: Run<V>) {
    if let Some(runs) = net.state_mut(me) {
        runs.runs.insert(id, run);
    }
}

fn run_mut<'a, V: Value>(net: &'a mut Net<V>, me: &NodeHandle, id: RunId) -> Option<&'a mut Run<V>> {
    net.state_mut(me)?.runs.get_mut(&id)
}

/// Start a delegated share of a query at `me`.
fn accept<V: Value>(
    net: &mut Net<V>,
    me: NodeHandle,
    parent: NodeHandle,
    inbound: Option<Inbound>,
    sub: SubQuery<V>,
) {
    if sub.ranges.is_empty() {
        if let Some(inbound) = inbound {
            let results = Message::Results {
                covered: Vec::new(),
                partials: Vec::new(),
            };
            net.reply(me, &inbound, Ok(results));
        }
        return;
    }
    let Some(runs) = net.state_mut(&me) else {
        return;
    };
    let id = runs.allocate();
    let (query, discipline, flush) = (sub.query, sub.discipline, sub.flush);
    let parent_run = sub.parent_run;
    let run = Run::new(
        sub,
        Role::Delegate {
            parent,
            parent_run,
            inbound,
        },
    );
    let ranges = run.ranges.clone();
    runs.runs.insert(id, run);
    debug!(node = %me, %query, %parent, ?ranges, "accepted sub-query");

    if let (Discipline::Aggregate, Some(period)) = (discipline, flush) {
        let timer = net.set_timer(me, period, "query-flush", move |net: &mut Net<V>| {
            flush_partials(net, me, id, period)
        });
        if let Some(run) = run_mut(net, &me, id) {
            run.periodic = Some(timer);
        }
    }
    disseminate(net, me, id, ranges);
    if discipline == Discipline::NoResponse {
        take(net, &me, id);
    }
}

/// Nodes a run may delegate to, sorted by key and always including `me`: those `me` does
/// not suspect, then every one that is not an obstacle.
fn candidates<V: Value>(
    net: &Net<V>,
    me: &NodeHandle,
    obstacles: &BTreeSet<NodeId>,
) -> (Vec<NodeHandle>, Vec<NodeHandle>) {
    let mut entries: Vec<NodeHandle> = net
        .routing_entries(me)
        .into_iter()
        .filter(|entry| entry == me || !obstacles.contains(&entry.id()))
        .collect();
    entries.push(*me);
    entries.sort();
    entries.dedup();
    let trusted = entries
        .iter()
        .copied()
        .filter(|entry| entry == me || !net.is_suspected(me, &entry.id()))
        .collect();
    (trusted, entries)
}

/// Resolve the part of `targets` owned by `me` and hand everything else to delegates.
fn disseminate<V: Value>(net: &mut Net<V>, me: NodeHandle, id: RunId, targets: IntervalSet) {
    let Some(mut run) = take(net, &me, id) else {
        return;
    };

    // Keys in [me, successor) are answered here.
    let mut local = IntervalSet::new();
    if let Some(successor) = net.successor(&me) {
        for owned in Interval::arc(me.key(), true, successor.key(), false) {
            for piece in targets.intersection(&owned).iter() {
                local.insert(*piece);
            }
        }
    }
    let mut remaining = targets;
    for piece in local.iter() {
        remaining.subtract(piece);
    }

    let mut immediate = Vec::new();
    for (interval, value) in run.provider.preprocess(&me.id(), &remaining) {
        let resolved = remaining.intersection(&interval);
        if resolved.is_empty() {
            continue;
        }
        for piece in resolved.iter() {
            remaining.subtract(piece);
        }
        immediate.push(Partial {
            node: me.id(),
            ranges: resolved.into_vec(),
            outcome: Ok(value),
        });
    }

    let (trusted, entries) = candidates(net, &me, &run.obstacles);
    let mut untrusted = IntervalSet::new();
    for (delegate, ranges) in assign(&trusted, &remaining) {
        if delegate == me {
            for range in ranges {
                untrusted.insert(range);
            }
            continue;
        }
        delegate_to(net, me, id, &mut run, delegate, ranges);
    }

    // Suspected nodes are tried only for ranges no trusted node precedes.
    for (delegate, ranges) in assign(&entries, &untrusted) {
        if delegate == me {
            // Nobody closer to these keys is known: their owner is gone.
            debug!(node = %me, query = %run.query, ?ranges, "no delegate for ranges");
            immediate.push(Partial {
                node: me.id(),
                ranges,
                outcome: Err(Failure::Unreachable),
            });
            continue;
        }
        delegate_to(net, me, id, &mut run, delegate, ranges);
    }

    let provider = run.provider.clone();
    restore(net, &me, id, run);
    if local.is_empty() && immediate.is_empty() {
        return;
    }
    net.set_timer(me, Duration::ZERO, "query-resolve", move |net: &mut Net<V>| {
        resolve(net, me, id, local, immediate, provider)
    });
}

fn delegate_to<V: Value>(
    net: &mut Net<V>,
    me: NodeHandle,
    id: RunId,
    run: &mut Run<V>,
    delegate: NodeHandle,
    ranges: Vec<Interval>,
) {
    let sub = SubQuery {
        query: run.query,
        root: run.root,
        parent_run: id,
        ranges: ranges.clone(),
        obstacles: run.obstacles.clone(),
        discipline: run.discipline,
        flush: run.flush,
        provider: run.provider.clone(),
    };
    net.shared().sub_queries.inc();
    trace!(node = %me, query = %run.query, %delegate, ?ranges, "delegating ranges");
    if run.discipline == Discipline::NoResponse {
        if let Err(err) = net.notify(me, delegate, Message::SubQuery(sub)) {
            debug!(node = %me, %delegate, ?err, "failed to send sub-query");
        }
        return;
    }
    let child = run.next_child;
    run.next_child += 1;
    let request = net.request(
        me,
        delegate,
        Message::SubQuery(sub),
        Box::new(
            move |net: &mut Net<V>, result: Result<Message<V>, OverlayError>| {
                on_child(net, me, id, child, result)
            },
        ),
    );
    run.children.insert(
        child,
        Child {
            delegate,
            ranges,
            request,
        },
    );
}

/// Settle everything resolved without the network and ask the provider for the local value.
fn resolve<V: Value>(
    net: &mut Net<V>,
    me: NodeHandle,
    id: RunId,
    local: IntervalSet,
    immediate: Vec<Partial<V>>,
    provider: Arc<dyn ValueProvider<V>>,
) {
    if !immediate.is_empty() {
        merge(net, me, id, immediate, Vec::new());
    }
    if local.is_empty() {
        return;
    }
    let scheduler = net.scheduler();
    let ranges = local.into_vec();
    let resolver = Resolver::new(move |delay, result: Result<V, String>| {
        scheduler.schedule(
            delay,
            Tag::timer("query-value"),
            move |net: &mut Net<V>| {
                if !net.is_live(&me) {
                    return;
                }
                let partial = Partial {
                    node: me.id(),
                    ranges,
                    outcome: result.map_err(Failure::Provider),
                };
                merge(net, me, id, vec![partial], Vec::new());
            },
        );
    });
    provider.get(&me.id(), resolver);
}

fn on_child<V: Value>(
    net: &mut Net<V>,
    me: NodeHandle,
    id: RunId,
    child: u64,
    result: Result<Message<V>, OverlayError>,
) {
    let Some(mut run) = take(net, &me, id) else {
        return;
    };
    let Some(record) = run.children.remove(&child) else {
        restore(net, &me, id, run);
        return;
    };
    let failure = match result {
        Ok(Message::Results { covered, partials }) => {
            restore(net, &me, id, run);
            return merge(net, me, id, partials, covered);
        }
        Ok(other) => {
            warn!(node = %me, delegate = %record.delegate, kind = other.name(), "unexpected reply");
            Failure::Unreachable
        }
        Err(
            OverlayError::AckTimeout(_)
            | OverlayError::NetworkError(_)
            | OverlayError::GraceStateRejected,
        ) => {
            run.obstacles.insert(record.delegate.id());
            let retry: IntervalSet = run.unresolved(&record.ranges).into_iter().collect();
            debug!(node = %me, query = %run.query, delegate = %record.delegate, ?retry, "redistributing ranges");
            restore(net, &me, id, run);
            if !retry.is_empty() {
                disseminate(net, me, id, retry);
            }
            return;
        }
        Err(OverlayError::Timeout) => Failure::Timeout,
        Err(err) => {
            debug!(node = %me, delegate = %record.delegate, ?err, "sub-query failed");
            Failure::Unreachable
        }
    };
    restore(net, &me, id, run);
    let partial = Partial {
        node: record.delegate.id(),
        ranges: record.ranges,
        outcome: Err(failure),
    };
    merge(net, me, id, vec![partial], Vec::new());
}

/// Settle whatever part of `partials` is still unresolved, then every range in `covered`.
fn merge<V: Value>(
    net: &mut Net<V>,
    me: NodeHandle,
    id: RunId,
    partials: Vec<Partial<V>>,
    covered: Vec<Interval>,
) {
    let Some(mut run) = take(net, &me, id) else {
        trace!(node = %me, run = id.0, "ignoring results for finished run");
        return;
    };
    if run.discipline == Discipline::NoResponse {
        return restore(net, &me, id, run);
    }
    let mut accepted = Vec::with_capacity(partials.len());
    for partial in partials {
        let ranges = run.unresolved(&partial.ranges);
        if ranges.is_empty() {
            net.shared().duplicates.inc();
            trace!(node = %me, query = %run.query, from = %partial.node, "discarding duplicate results");
            continue;
        }
        if run.retry && matches!(partial.outcome, Err(Failure::Unreachable | Failure::Timeout)) {
            trace!(node = %me, query = %run.query, from = %partial.node, ?ranges, "holding failure until retransmission");
            run.held.push(Partial { ranges, ..partial });
            continue;
        }
        for range in &ranges {
            run.gaps.subtract(range);
        }
        accepted.push(Partial { ranges, ..partial });
    }

    // Under the direct discipline values bypass the tree, and a retrying root must not let
    // a failed share count as covered, so such roots only trust partials.
    if !(run.is_root() && (run.discipline == Discipline::Direct || run.retry)) {
        for range in &covered {
            run.gaps.subtract(range);
        }
    }
    deliver(net, me, &mut run, accepted);
    if run.gaps.is_empty() {
        finish(net, me, run);
    } else {
        restore(net, &me, id, run);
    }
}

/// Pass newly settled results toward the caller.
fn deliver<V: Value>(net: &mut Net<V>, me: NodeHandle, run: &mut Run<V>, accepted: Vec<Partial<V>>) {
    if accepted.is_empty() {
        return;
    }
    for partial in &accepted {
        run.rvals.insert(partial.start(), partial.clone());
    }
    match &mut run.role {
        Role::Root { sink } => {
            for partial in accepted {
                sink.push(Some(partial));
            }
        }
        Role::Delegate { .. } => match run.discipline {
            Discipline::Aggregate => run.unsent.extend(accepted),
            Discipline::Direct => {
                let direct = Message::Direct {
                    query: run.query,
                    partials: accepted,
                };
                if let Err(err) = net.notify(me, run.root, direct) {
                    debug!(node = %me, query = %run.query, ?err, "failed to send results to root");
                }
            }
            Discipline::NoResponse => {}
        },
    }
}

/// Close a run whose gaps are all settled.
fn finish<V: Value>(net: &mut Net<V>, me: NodeHandle, run: Run<V>) {
    for timer in run.expiration.into_iter().chain(run.periodic) {
        net.cancel_timer(timer);
    }
    for child in run.children.values() {
        if let Some(request) = child.request {
            net.cancel_request(&me, request);
        }
    }
    match run.role {
        Role::Root { mut sink } => {
            if let Some(runs) = net.state_mut(&me) {
                runs.roots.remove(&run.query);
            }
            net.shared().completed.inc();
            info!(node = %me, query = %run.query, results = run.rvals.len(), "query complete");
            sink.push(None);
        }
        Role::Delegate {
            inbound: Some(inbound),
            ..
        } => {
            let partials = match run.discipline {
                Discipline::Aggregate => run.rvals.into_values().collect(),
                _ => Vec::new(),
            };
            trace!(node = %me, query = %run.query, parent = %inbound.sender, "sub-query complete");
            let results = Message::Results {
                covered: run.ranges.into_vec(),
                partials,
            };
            net.reply(me, &inbound, Ok(results));
        }
        Role::Delegate { inbound: None, .. } => {}
    }
}

/// Report whatever the root has not resolved yet and complete the query.
fn expire<V: Value>(net: &mut Net<V>, me: NodeHandle, id: RunId) {
    let Some(mut run) = take(net, &me, id) else {
        return;
    };
    if !run.gaps.is_empty() {
        net.shared().expired.inc();
        info!(node = %me, query = %run.query, gaps = ?run.gaps, "query expired");

        // Ranges still failing on the latest attempt keep that failure.
        let mut reported = Vec::new();
        for held in std::mem::take(&mut run.held).into_iter().rev() {
            let ranges = run.unresolved(&held.ranges);
            if ranges.is_empty() {
                continue;
            }
            for range in &ranges {
                run.gaps.subtract(range);
            }
            reported.push(Partial { ranges, ..held });
        }
        if !run.gaps.is_empty() {
            reported.push(Partial {
                node: me.id(),
                ranges: std::mem::take(&mut run.gaps).into_vec(),
                outcome: Err(Failure::Expired),
            });
        }
        deliver(net, me, &mut run, reported);
    }
    finish(net, me, run);
}

/// Send the root's unresolved ranges out again, then check back after `period`.
fn retransmit<V: Value>(net: &mut Net<V>, me: NodeHandle, id: RunId, period: Duration) {
    let Some(run) = run_mut(net, &me, id) else {
        return;
    };
    if run.gaps.is_empty() {
        return;
    }
    // Every round starts afresh: nodes that missed an ack before may be reachable now.
    run.obstacles.clear();
    let gaps = run.gaps.clone();
    net.shared().retransmissions.inc();
    debug!(node = %me, run = id.0, ?gaps, "retransmitting unresolved ranges");
    disseminate(net, me, id, gaps);
    let timer = net.set_timer(
        me,
        period,
        "query-retransmission",
        move |net: &mut Net<V>| retransmit(net, me, id, period),
    );
    if let Some(run) = run_mut(net, &me, id) {
        run.periodic = Some(timer);
    }
}

/// Pass results gathered so far to the parent run, then check back after `period`.
fn flush_partials<V: Value>(net: &mut Net<V>, me: NodeHandle, id: RunId, period: Duration) {
    let Some(mut run) = take(net, &me, id) else {
        return;
    };
    if let Role::Delegate {
        parent, parent_run, ..
    } = &run.role
    {
        if !run.unsent.is_empty() {
            let flush = Message::Flush {
                query: run.query,
                run: *parent_run,
                partials: std::mem::take(&mut run.unsent),
            };
            if let Err(err) = net.notify(me, *parent, flush) {
                debug!(node = %me, query = %run.query, ?err, "failed to flush results");
            }
        }
    }
    let timer = net.set_timer(me, period, "query-flush", move |net: &mut Net<V>| {
        flush_partials(net, me, id, period)
    });
    run.periodic = Some(timer);
    restore(net, &me, id, run);
}
