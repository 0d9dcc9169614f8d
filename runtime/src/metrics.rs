use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, gauge::Gauge},
    registry::Registry,
};

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct Kind {
    pub kind: String,
}

#[derive(Debug)]
pub struct Metrics {
    pub actions_processed: Counter,
    pub actions_pending: Gauge,
    pub messages: Counter,
    pub messages_by_kind: Family<Kind, Counter>,
}

impl Metrics {
    pub fn init(registry: &mut Registry) -> Self {
        let metrics = Self {
            actions_processed: Counter::default(),
            actions_pending: Gauge::default(),
            messages: Counter::default(),
            messages_by_kind: Family::default(),
        };
        registry.register(
            "actions_processed",
            "Total number of actions dequeued and run",
            metrics.actions_processed.clone(),
        );
        registry.register(
            "actions_pending",
            "Number of actions waiting in the ready queue",
            metrics.actions_pending.clone(),
        );
        registry.register(
            "messages",
            "Total number of messages delivered between distinct nodes",
            metrics.messages.clone(),
        );
        registry.register(
            "messages_by_kind",
            "Number of messages delivered between distinct nodes by kind",
            metrics.messages_by_kind.clone(),
        );
        metrics
    }
}
