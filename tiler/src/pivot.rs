//! Plans the sliding window of hot and warm queries around a moving focus.

use std::cmp::Ordering;
use std::fmt::{Debug, Formatter};
use std::hash::Hash;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::Stream;
use hashbrown::HashSet;
use pin_project::pin_project;
use snafu::{ensure, Snafu};

use crate::request::{Comparator, Input, Order, PivotBatch};

/// Planner configuration errors, reported eagerly at construction.
#[derive(Debug, Snafu)]
pub enum Error {
    /// The hot window must hold the pivot plus at least one neighbor per
    /// side.
    #[snafu(display("pivot window needs at least 3 hot queries, got {on_count}"))]
    WindowTooSmall {
        /// The rejected window size.
        on_count: usize,
    },
}

/// Produces a query's neighbor in one direction, or `None` at the edge of
/// the query space.
pub type Neighbor<Q> = Arc<dyn Fn(&Q) -> Option<Q> + Send + Sync>;

/// Shape of the query window to keep alive around the focus.
///
/// `on_count` queries fetch actively around the pivot; a further `off_count`
/// at the window edges stay paused but cached; anything kept by the previous
/// plan beyond that is evicted.
#[derive(Clone)]
pub struct PivotRequest<Q> {
    on_count: usize,
    off_count: usize,
    cmp: Comparator<Q>,
    next: Neighbor<Q>,
    prev: Neighbor<Q>,
}

impl<Q> PivotRequest<Q> {
    /// Build a window shape.
    ///
    /// `next`/`prev` walk the query space outward from the focus and may
    /// return `None` at its edges, silently truncating the window.
    ///
    /// Fails when `on_count < 3`: a smaller window cannot hold the pivot
    /// plus a neighbor on each side.
    pub fn new(
        on_count: usize,
        off_count: usize,
        cmp: impl Fn(&Q, &Q) -> Ordering + Send + Sync + 'static,
        next: impl Fn(&Q) -> Option<Q> + Send + Sync + 'static,
        prev: impl Fn(&Q) -> Option<Q> + Send + Sync + 'static,
    ) -> Result<Self, Error> {
        ensure!(on_count >= 3, WindowTooSmallSnafu { on_count });
        Ok(Self {
            on_count,
            off_count,
            cmp: Arc::new(cmp),
            next: Arc::new(next),
            prev: Arc::new(prev),
        })
    }

    /// Number of actively fetching queries the window holds.
    pub fn on_count(&self) -> usize {
        self.on_count
    }

    /// Number of paused-but-cached queries kept at the window edges.
    pub fn off_count(&self) -> usize {
        self.off_count
    }
}

impl<Q> Debug for PivotRequest<Q> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PivotRequest")
            .field("on_count", &self.on_count)
            .field("off_count", &self.off_count)
            .finish_non_exhaustive()
    }
}

/// Convert a stream of focus queries and a stream of window shapes into the
/// dispatcher inputs realizing a sliding hot/warm window.
///
/// Combine-latest semantics: each side is debounced to its latest value, and
/// a [`PivotBatch`] is emitted whenever either side changes while both are
/// present. The stream ends once both inputs end.
pub fn to_pivoted_tile_inputs<Q, SQ, SR>(queries: SQ, requests: SR) -> impl Stream<Item = Input<Q>>
where
    Q: Clone + Eq + Hash,
    SQ: Stream<Item = Q>,
    SR: Stream<Item = PivotRequest<Q>>,
{
    PivotPlanner {
        queries,
        requests,
        focus: None,
        request: None,
        kept: Vec::new(),
        queries_done: false,
        requests_done: false,
    }
}

/// Compute the plan for one `(focus, shape)` combination.
///
/// The returned `on` list is ordered by the comparator with the pivot moved
/// to the end: the dispatcher sends `On`s in list order, so the pivot's `On`
/// is the latest signal its valve sees and survives the valves'
/// distinct-until-changed suppression.
fn plan<Q>(pivot: &Q, request: &PivotRequest<Q>, prev_kept: &[Q]) -> PivotBatch<Q>
where
    Q: Clone + Eq + Hash,
{
    let mut low = pivot.clone();
    let mut high = pivot.clone();
    let mut low_done = false;
    let mut high_done = false;

    let mut on = vec![pivot.clone()];
    grow(
        &mut on,
        request.on_count,
        &mut low,
        &mut high,
        &mut low_done,
        &mut high_done,
        &request.next,
        &request.prev,
    );

    let mut off = Vec::new();
    grow(
        &mut off,
        request.off_count,
        &mut low,
        &mut high,
        &mut low_done,
        &mut high_done,
        &request.next,
        &request.prev,
    );

    let keep: HashSet<&Q> = on.iter().chain(off.iter()).collect();
    let evict: Vec<Q> = prev_kept
        .iter()
        .filter(|q| !keep.contains(*q))
        .cloned()
        .collect();
    drop(keep);

    on.sort_by(|a, b| (request.cmp)(a, b));
    if let Some(at) = on.iter().position(|q| q == pivot) {
        let p = on.remove(at);
        on.push(p);
    }
    off.sort_by(|a, b| (request.cmp)(a, b));

    PivotBatch {
        evict,
        off,
        on,
        new_order: Order::PivotSorted {
            pivot: pivot.clone(),
            cmp: Arc::clone(&request.cmp),
        },
    }
}

/// Grow `out` towards `target` entries by walking the window edges outward,
/// alternating between the two directions; an exhausted direction is skipped.
#[allow(clippy::too_many_arguments)]
fn grow<Q: Clone>(
    out: &mut Vec<Q>,
    target: usize,
    low: &mut Q,
    high: &mut Q,
    low_done: &mut bool,
    high_done: &mut bool,
    next: &Neighbor<Q>,
    prev: &Neighbor<Q>,
) {
    while out.len() < target && !(*low_done && *high_done) {
        if !*high_done {
            match next(high) {
                Some(q) => {
                    *high = q.clone();
                    out.push(q);
                }
                None => *high_done = true,
            }
        }
        if out.len() >= target {
            break;
        }
        if !*low_done {
            match prev(low) {
                Some(q) => {
                    *low = q.clone();
                    out.push(q);
                }
                None => *low_done = true,
            }
        }
    }
}

#[pin_project]
struct PivotPlanner<SQ, SR, Q> {
    #[pin]
    queries: SQ,
    #[pin]
    requests: SR,
    focus: Option<Q>,
    request: Option<PivotRequest<Q>>,
    /// The previous plan's `on ∪ off`, the eviction baseline.
    kept: Vec<Q>,
    queries_done: bool,
    requests_done: bool,
}

impl<SQ, SR, Q> Stream for PivotPlanner<SQ, SR, Q>
where
    Q: Clone + Eq + Hash,
    SQ: Stream<Item = Q>,
    SR: Stream<Item = PivotRequest<Q>>,
{
    type Item = Input<Q>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();
        let mut dirty = false;

        while !*this.queries_done {
            match this.queries.as_mut().poll_next(cx) {
                Poll::Ready(Some(q)) => {
                    *this.focus = Some(q);
                    dirty = true;
                }
                Poll::Ready(None) => *this.queries_done = true,
                Poll::Pending => break,
            }
        }
        while !*this.requests_done {
            match this.requests.as_mut().poll_next(cx) {
                Poll::Ready(Some(r)) => {
                    *this.request = Some(r);
                    dirty = true;
                }
                Poll::Ready(None) => *this.requests_done = true,
                Poll::Pending => break,
            }
        }

        if dirty {
            if let (Some(focus), Some(request)) = (this.focus.as_ref(), this.request.as_ref()) {
                let batch = plan(focus, request, this.kept);
                *this.kept = batch.on.iter().chain(batch.off.iter()).cloned().collect();
                return Poll::Ready(Some(Input::PivotBatch(batch)));
            }
        }
        if *this.queries_done && *this.requests_done {
            return Poll::Ready(None);
        }
        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use futures::{FutureExt, StreamExt};

    fn request(on_count: usize, off_count: usize) -> PivotRequest<u32> {
        PivotRequest::new(
            on_count,
            off_count,
            |a: &u32, b: &u32| a.cmp(b),
            |q: &u32| Some(q + 1),
            |q: &u32| q.checked_sub(1),
        )
        .unwrap()
    }

    fn sorted(mut queries: Vec<u32>) -> Vec<u32> {
        queries.sort_unstable();
        queries
    }

    #[test]
    fn rejects_tiny_windows() {
        let err = PivotRequest::new(
            2,
            0,
            |a: &u32, b: &u32| a.cmp(b),
            |_: &u32| None,
            |_: &u32| None,
        )
        .unwrap_err();
        assert_matches!(err, Error::WindowTooSmall { on_count: 2 });
    }

    #[test]
    fn first_plan_centers_on_the_focus() {
        let batch = plan(&5, &request(3, 2), &[]);
        assert_eq!(batch.on, vec![4, 6, 5], "ordered by cmp, pivot last");
        assert_eq!(batch.off, vec![3, 7]);
        assert!(batch.evict.is_empty());
        assert_eq!(batch.new_order.pivot(), Some(&5));
    }

    #[test]
    fn moving_the_focus_evicts_what_falls_out() {
        let first = plan(&5, &request(3, 2), &[]);
        let kept: Vec<u32> = first.on.iter().chain(first.off.iter()).copied().collect();

        let second = plan(&8, &request(3, 2), &kept);
        assert_eq!(second.on, vec![7, 9, 8]);
        assert_eq!(second.off, vec![6, 10]);
        assert_eq!(sorted(second.evict), vec![3, 4, 5]);
    }

    #[test]
    fn window_truncates_at_the_edge_of_the_query_space() {
        // nothing below 0 and nothing above 3
        let req = PivotRequest::new(
            5,
            2,
            |a: &u32, b: &u32| a.cmp(b),
            |q: &u32| (*q < 3).then(|| q + 1),
            |q: &u32| q.checked_sub(1),
        )
        .unwrap();
        let batch = plan(&0, &req, &[]);
        assert_eq!(batch.on, vec![1, 2, 3, 0]);
        assert!(batch.off.is_empty());
    }

    #[test]
    fn plans_satisfy_the_window_closure() {
        let kept = vec![1, 2, 3, 4, 5, 6, 7];
        let batch = plan(&20, &request(4, 3), &kept);

        assert!(batch.on.len() <= 4);
        assert!(batch.off.len() <= 3);
        for q in &batch.on {
            assert!(!batch.off.contains(q), "on and off overlap on {q}");
            assert!(!batch.evict.contains(q), "evicting a hot query {q}");
        }
        for q in &batch.off {
            assert!(!batch.evict.contains(q), "evicting a warm query {q}");
        }
        assert_eq!(sorted(batch.evict), kept);
    }

    #[tokio::test]
    async fn combine_latest_debounces_each_side() {
        let (focus_tx, focus_rx) = futures::channel::mpsc::unbounded();
        let mut inputs =
            to_pivoted_tile_inputs(focus_rx, futures::stream::iter([request(3, 2)]));

        // both focus updates are queued before the first poll: only the
        // latest is planned
        focus_tx.unbounded_send(5).unwrap();
        focus_tx.unbounded_send(8).unwrap();

        let batch = assert_matches!(
            inputs.next().await.unwrap(),
            Input::PivotBatch(batch) => batch
        );
        assert_eq!(batch.new_order.pivot(), Some(&8));
        assert_eq!(batch.on, vec![7, 9, 8]);
        assert!(batch.evict.is_empty());

        assert!(inputs.next().now_or_never().is_none());
    }

    #[tokio::test]
    async fn replans_on_every_focus_change() {
        let (focus_tx, focus_rx) = futures::channel::mpsc::unbounded();
        let mut inputs =
            to_pivoted_tile_inputs(focus_rx, futures::stream::iter([request(3, 2)]));

        focus_tx.unbounded_send(5).unwrap();
        let first = assert_matches!(
            inputs.next().await.unwrap(),
            Input::PivotBatch(batch) => batch
        );
        assert_eq!(first.on, vec![4, 6, 5]);
        assert_eq!(first.off, vec![3, 7]);

        focus_tx.unbounded_send(8).unwrap();
        let second = assert_matches!(
            inputs.next().await.unwrap(),
            Input::PivotBatch(batch) => batch
        );
        assert_eq!(sorted(second.evict), vec![3, 4, 5]);

        // both inputs exhausted: the planner ends
        drop(focus_tx);
        assert!(inputs.next().await.is_none());
    }

    #[tokio::test]
    async fn no_plan_until_both_sides_are_present() {
        let (focus_tx, focus_rx) = futures::channel::mpsc::unbounded();
        let (req_tx, req_rx) = futures::channel::mpsc::unbounded();
        let mut inputs = to_pivoted_tile_inputs(focus_rx, req_rx);

        focus_tx.unbounded_send(5).unwrap();
        assert!(inputs.next().now_or_never().is_none());

        req_tx.unbounded_send(request(3, 0)).unwrap();
        let batch = assert_matches!(
            inputs.next().await.unwrap(),
            Input::PivotBatch(batch) => batch
        );
        assert_eq!(batch.on, vec![4, 6, 5]);
        assert!(batch.off.is_empty());
    }
}
