use prometheus_client::metrics::counter::Counter;
use ringsim_runtime::Scheduler;

#[derive(Clone, Debug, Default)]
pub struct Metrics {
    pub started: Counter,
    pub completed: Counter,
    pub expired: Counter,
    pub sub_queries: Counter,
    pub retransmissions: Counter,
    pub duplicates: Counter,
}

impl Metrics {
    pub fn init<W>(scheduler: &Scheduler<W>) -> Self {
        let metrics = Self::default();
        scheduler.register(
            "query_started",
            "Total number of queries issued",
            metrics.started.clone(),
        );
        scheduler.register(
            "query_completed",
            "Total number of queries that resolved every range",
            metrics.completed.clone(),
        );
        scheduler.register(
            "query_expired",
            "Total number of queries that expired with unresolved ranges",
            metrics.expired.clone(),
        );
        scheduler.register(
            "query_sub_queries",
            "Total number of sub-queries handed to delegates",
            metrics.sub_queries.clone(),
        );
        scheduler.register(
            "query_retransmissions",
            "Total number of times a root sent out its unresolved ranges again",
            metrics.retransmissions.clone(),
        );
        scheduler.register(
            "query_duplicates",
            "Total number of partial results discarded because their ranges were already settled",
            metrics.duplicates.clone(),
        );
        metrics
    }
}
