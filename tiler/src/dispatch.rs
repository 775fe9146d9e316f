//! Routes control inputs to per-query valves and fans out child event
//! streams.

use std::collections::{HashMap, VecDeque};
use std::fmt::Debug;
use std::hash::Hash;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use observability_deps::tracing::debug;
use pin_project::pin_project;
use tokio::sync::mpsc;

use crate::event::Event;
use crate::fetch::Fetcher;
use crate::request::{Input, PivotBatch};
use crate::valve::{Signal, Valve};

/// Multiplexes one input stream into per-query valves.
///
/// Yields one child event stream per valve plus singleton acknowledgement
/// streams for evictions and policy changes; merge the children with
/// unbounded concurrency (`flatten_unordered(None)`) to obtain the event
/// stream the tiler consumes. Inputs are applied in arrival order, and an
/// acknowledgement is queued before the next input is read, so a control
/// action and its acknowledgement never reorder.
#[pin_project]
pub(crate) struct Dispatch<S, Q, F: Fetcher<Q>> {
    #[pin]
    inputs: S,
    fetcher: Arc<F>,
    /// Control handles of live valves.
    live: HashMap<Q, mpsc::UnboundedSender<Signal>>,
    /// Child streams ready to hand to the merge.
    ready: VecDeque<BoxStream<'static, Event<Q, F::Item>>>,
}

impl<S, Q, F> Dispatch<S, Q, F>
where
    F: Fetcher<Q>,
{
    pub(crate) fn new(inputs: S, fetcher: Arc<F>) -> Self {
        Self {
            inputs,
            fetcher,
            live: HashMap::new(),
            ready: VecDeque::new(),
        }
    }
}

impl<S, Q, F> Stream for Dispatch<S, Q, F>
where
    S: Stream<Item = Input<Q>>,
    Q: Clone + Eq + Hash + Debug + Send + 'static,
    F: Fetcher<Q>,
{
    type Item = BoxStream<'static, Event<Q, F::Item>>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();
        loop {
            if let Some(child) = this.ready.pop_front() {
                return Poll::Ready(Some(child));
            }
            match this.inputs.as_mut().poll_next(cx) {
                Poll::Ready(Some(input)) => {
                    apply_input(this.fetcher, this.live, this.ready, input);
                }
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

fn apply_input<Q, F>(
    fetcher: &Arc<F>,
    live: &mut HashMap<Q, mpsc::UnboundedSender<Signal>>,
    ready: &mut VecDeque<BoxStream<'static, Event<Q, F::Item>>>,
    input: Input<Q>,
) where
    Q: Clone + Eq + Hash + Debug + Send + 'static,
    F: Fetcher<Q>,
{
    match input {
        Input::On(query) => turn_on(fetcher, live, ready, query),
        Input::Off(query) => {
            if let Some(tx) = live.get(&query) {
                tx.send(Signal::Off).ok();
            }
        }
        Input::Evict(query) => {
            // unknown queries are a no-op: no valve, no acknowledgement
            if let Some(tx) = live.remove(&query) {
                tx.send(Signal::Terminate).ok();
                debug!(query = ?query, "evicting");
                ready.push_back(singleton(Event::Evicted { query }));
            }
        }
        Input::SetOrder(order) => ready.push_back(singleton(Event::OrderChanged(order))),
        Input::SetLimiter(limiter) => ready.push_back(singleton(Event::LimiterChanged(limiter))),
        Input::PivotBatch(batch) => {
            let PivotBatch {
                evict,
                off,
                on,
                new_order,
            } = batch;

            // evict before anything else: a query that the new order would
            // place in a visible slot must already be gone when the order
            // lands
            let mut evicted = Vec::with_capacity(evict.len());
            for query in evict {
                if let Some(tx) = live.remove(&query) {
                    tx.send(Signal::Terminate).ok();
                    evicted.push(query);
                }
            }
            for query in off {
                if let Some(tx) = live.get(&query) {
                    tx.send(Signal::Off).ok();
                }
            }
            for query in on {
                turn_on(fetcher, live, ready, query);
            }
            debug!(evicted = evicted.len(), "pivot batch applied");
            ready.push_back(singleton(Event::BatchApplied { evicted, new_order }));
        }
    }
}

fn turn_on<Q, F>(
    fetcher: &Arc<F>,
    live: &mut HashMap<Q, mpsc::UnboundedSender<Signal>>,
    ready: &mut VecDeque<BoxStream<'static, Event<Q, F::Item>>>,
    query: Q,
) where
    Q: Clone + Eq + Hash + Debug + Send + 'static,
    F: Fetcher<Q>,
{
    if let Some(tx) = live.get(&query) {
        // a send failure means the valve terminated on its own (upstream
        // failure); fall through and recreate it
        if tx.send(Signal::On).is_ok() {
            return;
        }
    }
    let (tx, valve) = Valve::new(query.clone(), Arc::clone(fetcher));
    live.insert(query, tx.clone());
    ready.push_back(valve.boxed());
    tx.send(Signal::On).ok();
}

fn singleton<Q, I>(event: Event<Q, I>) -> BoxStream<'static, Event<Q, I>>
where
    Q: Send + 'static,
    I: Send + 'static,
{
    futures::stream::iter([event]).boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockFetcher;
    use crate::request::{Limiter, Order};
    use assert_matches::assert_matches;
    use futures::FutureExt;

    /// Merge the dispatcher output the way the pipeline does.
    fn merged(
        inputs: Vec<Input<u32>>,
        fetcher: &MockFetcher<u32, i32>,
    ) -> BoxStream<'static, Event<u32, i32>> {
        Dispatch::new(futures::stream::iter(inputs), Arc::new(fetcher.clone()))
            .flatten_unordered(None)
            .boxed()
    }

    /// Drain everything the merge can produce without external wake-ups.
    async fn settled(stream: &mut BoxStream<'static, Event<u32, i32>>) -> Vec<Event<u32, i32>> {
        let mut events = vec![];
        while let Some(Some(event)) = stream.next().now_or_never() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn on_creates_one_valve_per_query() {
        let fetcher = MockFetcher::new();
        fetcher.script(1, vec![vec![10]]);
        fetcher.script(2, vec![vec![20]]);

        let mut stream = merged(
            vec![Input::On(1), Input::On(1), Input::On(2)],
            &fetcher,
        );
        let events = settled(&mut stream).await;

        assert_eq!(fetcher.fetches(&1), 1);
        assert_eq!(fetcher.fetches(&2), 1);
        let mut data: Vec<u32> = events
            .iter()
            .map(|e| match e {
                Event::Data { query, .. } => *query,
                other => panic!("unexpected event {other:?}"),
            })
            .collect();
        data.sort_unstable();
        assert_eq!(data, vec![1, 2]);
    }

    #[tokio::test]
    async fn off_for_unknown_query_is_dropped() {
        let fetcher: MockFetcher<u32, i32> = MockFetcher::new();
        let mut stream = merged(vec![Input::Off(9)], &fetcher);
        assert!(settled(&mut stream).await.is_empty());
    }

    #[tokio::test]
    async fn evict_terminates_and_acknowledges() {
        let fetcher = MockFetcher::new();
        fetcher.script(1, vec![vec![10]]);

        let mut stream = merged(vec![Input::On(1), Input::Evict(1)], &fetcher);
        let events = settled(&mut stream).await;

        // data already queued before the evict may still surface, but the
        // terminated valve produces nothing further and the eviction is
        // acknowledged exactly once
        let evictions = events
            .iter()
            .filter(|e| matches!(e, Event::Evicted { query: 1 }))
            .count();
        assert_eq!(evictions, 1);
        let data = events
            .iter()
            .filter(|e| matches!(e, Event::Data { .. }))
            .count();
        assert!(data <= 1, "terminated valve kept emitting: {events:?}");
    }

    #[tokio::test]
    async fn evict_unknown_query_is_a_no_op() {
        let fetcher: MockFetcher<u32, i32> = MockFetcher::new();
        let mut stream = merged(vec![Input::Evict(9)], &fetcher);
        assert!(settled(&mut stream).await.is_empty());
    }

    #[tokio::test]
    async fn policy_changes_are_acknowledged_in_order() {
        let fetcher: MockFetcher<u32, i32> = MockFetcher::new();
        let mut stream = merged(
            vec![
                Input::SetOrder(Order::ascending()),
                Input::SetLimiter(Limiter::max_queries(2)),
            ],
            &fetcher,
        );
        let events = settled(&mut stream).await;

        // the merge interleaves ready children freely; both acknowledgements
        // must surface exactly once
        assert_eq!(events.len(), 2);
        assert_eq!(
            events
                .iter()
                .filter(|e| matches!(e, Event::OrderChanged(_)))
                .count(),
            1
        );
        assert_matches!(
            events
                .iter()
                .find(|e| matches!(e, Event::LimiterChanged(_)))
                .unwrap(),
            Event::LimiterChanged(limiter) => {
                assert_eq!(*limiter, Limiter::max_queries(2));
            }
        );
    }

    #[tokio::test]
    async fn pivot_batch_collapses_to_one_acknowledgement() {
        let fetcher = MockFetcher::new();
        for q in 3..=9 {
            fetcher.script(q, vec![vec![q as i32]]);
        }

        // start 3..=5, then re-plan around 8
        let mut stream = merged(
            vec![
                Input::On(3),
                Input::On(4),
                Input::On(5),
                Input::PivotBatch(PivotBatch {
                    evict: vec![3, 4],
                    off: vec![5],
                    on: vec![7, 9, 8],
                    new_order: Order::pivot_ascending(8),
                }),
            ],
            &fetcher,
        );
        let events = settled(&mut stream).await;

        let batch_events: Vec<_> = events
            .iter()
            .filter(|e| matches!(e, Event::BatchApplied { .. } | Event::Evicted { .. }))
            .collect();
        assert_matches!(
            batch_events.as_slice(),
            [Event::BatchApplied { evicted, new_order }] => {
                assert_eq!(evicted, &vec![3, 4]);
                assert_eq!(new_order.pivot(), Some(&8));
            }
        );

        // evicted valves must not fetch again; the new window fetches once each
        assert_eq!(fetcher.fetches(&7), 1);
        assert_eq!(fetcher.fetches(&8), 1);
        assert_eq!(fetcher.fetches(&9), 1);
    }

    #[tokio::test]
    async fn batch_evict_of_unknown_queries_is_partial() {
        let fetcher = MockFetcher::new();
        fetcher.script(1, vec![vec![10]]);
        let mut stream = merged(
            vec![
                Input::On(1),
                Input::PivotBatch(PivotBatch {
                    evict: vec![1, 2],
                    off: vec![],
                    on: vec![],
                    new_order: Order::ascending(),
                }),
            ],
            &fetcher,
        );
        let events = settled(&mut stream).await;
        assert_matches!(events.as_slice(), [Event::BatchApplied { evicted, .. }] => {
            assert_eq!(evicted, &vec![1]);
        });
    }
}
