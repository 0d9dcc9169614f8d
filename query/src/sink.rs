use crate::Partial;
use futures::channel::mpsc;

/// Receives the results of a query at its root, in arrival order.
///
/// Each resolved or failed share arrives as `Some`. A single `None` follows once the
/// query is complete (or has expired) and nothing is pushed after it.
pub trait ResultSink<V>: Send + 'static {
    fn push(&mut self, partial: Option<Partial<V>>);
}

impl<V, F> ResultSink<V> for F
where
    F: FnMut(Option<Partial<V>>) + Send + 'static,
{
    fn push(&mut self, partial: Option<Partial<V>>) {
        self(partial)
    }
}

/// Stream results to a consumer outside the scheduler (for example another thread driving
/// a realtime run).
impl<V: Send + 'static> ResultSink<V> for mpsc::UnboundedSender<Option<Partial<V>>> {
    fn push(&mut self, partial: Option<Partial<V>>) {
        // The consumer may have stopped listening.
        let _ = self.unbounded_send(partial);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Failure;
    use futures::{executor::block_on, StreamExt};
    use ringsim_overlay::{NodeId, PeerId};
    use ringsim_utils::Interval;

    #[test]
    fn test_channel_sink() {
        let (mut sender, receiver) = mpsc::unbounded();
        let partial = Partial {
            node: NodeId::new(5, PeerId(0)),
            ranges: vec![Interval::point(5)],
            outcome: Err::<u64, _>(Failure::Expired),
        };
        ResultSink::push(&mut sender, Some(partial.clone()));
        ResultSink::push(&mut sender, None);
        drop(sender);
        let received: Vec<_> = block_on(receiver.collect());
        assert_eq!(received, vec![Some(partial), None]);
    }
}
