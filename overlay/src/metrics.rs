use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family},
};
use ringsim_runtime::Scheduler;

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct Reason {
    pub reason: String,
}

impl Reason {
    pub fn new(reason: &str) -> Self {
        Self {
            reason: reason.to_string(),
        }
    }
}

#[derive(Debug, Default)]
pub struct Metrics {
    pub requests: Counter,
    pub dropped: Family<Reason, Counter>,
    pub ack_timeouts: Counter,
    pub reply_timeouts: Counter,
}

impl Metrics {
    pub fn init<W>(scheduler: &Scheduler<W>) -> Self {
        let metrics = Self::default();
        scheduler.register(
            "overlay_requests",
            "Total number of requests sent (including forwarded copies)",
            metrics.requests.clone(),
        );
        scheduler.register(
            "overlay_messages_dropped",
            "Number of messages dropped by reason",
            metrics.dropped.clone(),
        );
        scheduler.register(
            "overlay_ack_timeouts",
            "Total number of requests whose receiver did not acknowledge in time",
            metrics.ack_timeouts.clone(),
        );
        scheduler.register(
            "overlay_reply_timeouts",
            "Total number of requests that received no reply in time",
            metrics.reply_timeouts.clone(),
        );
        metrics
    }

    pub fn record_drop(&self, reason: &str) {
        self.dropped.get_or_create(&Reason::new(reason)).inc();
    }
}
