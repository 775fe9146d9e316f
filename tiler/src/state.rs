//! The tiler state machine: accumulates merged events into the per-query
//! cache and the sorted query vector, decides which queries are visible, and
//! emits a snapshot only when something a consumer can see actually changed.

use std::cmp::Ordering;
use std::collections::{HashMap, VecDeque};
use std::fmt::Debug;
use std::hash::Hash;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::{ready, Stream};
use observability_deps::tracing::{trace, warn};
use pin_project::pin_project;
use tiled_list::TiledList;

use crate::event::Event;
use crate::request::{Limiter, Order};

/// State owned by the single consumer of the merged event stream; no other
/// task touches it, so no locking is involved.
pub(crate) struct TilerState<Q, I> {
    /// Latest batch per cached query. Batches are replaced wholesale and
    /// shared with emitted snapshots.
    cache: HashMap<Q, Arc<Vec<I>>>,
    /// Cached queries, sorted under the current comparator.
    ordered: Vec<Q>,
    order: Order<Q>,
    limiter: Limiter,
    /// Positions in `ordered` selected at the last emission.
    last_indices: Vec<u32>,
    /// The queries behind `last_indices` at emission time. Kept separately
    /// because `ordered` mutates between emissions.
    last_visible: Vec<Q>,
}

impl<Q, I> TilerState<Q, I>
where
    Q: Clone + Eq + Hash + Debug,
{
    pub(crate) fn new(order: Order<Q>, limiter: Limiter) -> Self {
        Self {
            cache: HashMap::new(),
            ordered: Vec::new(),
            order,
            limiter,
            last_indices: Vec::new(),
            last_visible: Vec::new(),
        }
    }

    /// Fold one event into the state; returns a snapshot when the change is
    /// visible to consumers.
    pub(crate) fn apply(&mut self, event: Event<Q, I>) -> Option<TiledList<Q, I>> {
        match event {
            Event::Data { query, items } => self.apply_data(query, items),
            Event::Failed { query, error } => {
                warn!(query = ?query, %error, "query stream failed, dropping its cache");
                self.apply_removal(query)
            }
            Event::Evicted { query } => self.apply_removal(query),
            Event::OrderChanged(order) => self.apply_order(order),
            Event::LimiterChanged(limiter) => self.apply_limiter(limiter),
            Event::BatchApplied { evicted, new_order } => self.apply_batch(evicted, new_order),
        }
    }

    fn apply_data(&mut self, query: Q, items: Vec<I>) -> Option<TiledList<Q, I>> {
        if !self.cache.contains_key(&query) {
            let at = self.insertion_point(&query);
            self.ordered.insert(at, query.clone());
        }
        self.cache.insert(query.clone(), Arc::new(items));

        let indices = self.visible_indices();
        let emit = match &self.order {
            Order::Sorted { .. } => true,
            Order::PivotSorted { pivot, .. } => {
                let now_visible = indices
                    .iter()
                    .any(|&i| self.ordered[i as usize] == query);
                let filled_in = self.last_indices.is_empty() && !indices.is_empty();
                (self.cache.contains_key(pivot) && now_visible) || filled_in
            }
        };
        emit.then(|| self.emit(indices))
    }

    fn apply_removal(&mut self, query: Q) -> Option<TiledList<Q, I>> {
        let was_visible = self.last_visible.contains(&query);
        if let Some(at) = self.position_of(&query) {
            self.ordered.remove(at);
        }
        self.cache.remove(&query);

        let indices = self.visible_indices();
        was_visible.then(|| self.emit(indices))
    }

    fn apply_order(&mut self, order: Order<Q>) -> Option<TiledList<Q, I>> {
        self.order = order;
        self.resort();

        let indices = self.visible_indices();
        let visible = self.resolve(&indices);
        let changed = indices != self.last_indices || visible != self.last_visible;
        (changed && !self.cache.is_empty()).then(|| self.emit(indices))
    }

    fn apply_limiter(&mut self, limiter: Limiter) -> Option<TiledList<Q, I>> {
        self.limiter = limiter;

        let indices = self.visible_indices();
        (indices != self.last_indices).then(|| self.emit(indices))
    }

    fn apply_batch(&mut self, evicted: Vec<Q>, new_order: Order<Q>) -> Option<TiledList<Q, I>> {
        let any_visible = evicted.iter().any(|q| self.last_visible.contains(q));
        for query in &evicted {
            if let Some(at) = self.position_of(query) {
                self.ordered.remove(at);
            }
            self.cache.remove(query);
        }
        self.order = new_order;
        self.resort();

        let indices = self.visible_indices();
        let visible = self.resolve(&indices);
        (any_visible || visible != self.last_visible).then(|| self.emit(indices))
    }

    /// Insertion position for a new query under the current comparator:
    /// after any comparator-equal run, so arrival order is preserved.
    fn insertion_point(&self, query: &Q) -> usize {
        let cmp = self.order.comparator();
        self.ordered
            .partition_point(|existing| cmp(existing, query) != Ordering::Greater)
    }

    /// Position of `query` in `ordered`: binary search plus a scan of the
    /// comparator-equal run, since distinct queries may compare equal.
    fn position_of(&self, query: &Q) -> Option<usize> {
        let cmp = self.order.comparator();
        let start = self
            .ordered
            .partition_point(|existing| cmp(existing, query) == Ordering::Less);
        self.ordered[start..]
            .iter()
            .take_while(|existing| cmp(existing, query) == Ordering::Equal)
            .position(|existing| existing == query)
            .map(|offset| start + offset)
    }

    fn resort(&mut self) {
        let cmp = Arc::clone(self.order.comparator());
        self.ordered.sort_by(|a, b| cmp(a, b));
    }

    fn non_empty(&self, query: &Q) -> bool {
        self.cache.get(query).map(|items| !items.is_empty()).unwrap_or(false)
    }

    /// Which positions of `ordered` the next snapshot would show.
    fn visible_indices(&self) -> Vec<u32> {
        let max = self
            .limiter
            .max_queries
            .map(|m| m as usize)
            .unwrap_or(usize::MAX)
            .min(self.ordered.len());
        if max == 0 {
            return vec![];
        }
        match &self.order {
            Order::Sorted { .. } => self
                .ordered
                .iter()
                .enumerate()
                .filter(|(_, q)| self.non_empty(*q))
                .take(max)
                .map(|(i, _)| i as u32)
                .collect(),
            Order::PivotSorted { pivot, .. } => {
                let Some(at) = self.position_of(pivot) else {
                    return vec![];
                };
                let mut window = VecDeque::new();
                let mut count = 0;
                if self.non_empty(&self.ordered[at]) {
                    window.push_back(at as u32);
                    count += 1;
                }
                // expand outward alternately; empty slots cost no budget
                let mut left = at.checked_sub(1);
                let mut right = at + 1;
                while count < max && (left.is_some() || right < self.ordered.len()) {
                    if let Some(l) = left {
                        if self.non_empty(&self.ordered[l]) {
                            window.push_front(l as u32);
                            count += 1;
                        }
                        left = l.checked_sub(1);
                    }
                    if count >= max {
                        break;
                    }
                    if right < self.ordered.len() {
                        if self.non_empty(&self.ordered[right]) {
                            window.push_back(right as u32);
                            count += 1;
                        }
                        right += 1;
                    }
                }
                window.into_iter().collect()
            }
        }
    }

    fn resolve(&self, indices: &[u32]) -> Vec<Q> {
        indices
            .iter()
            .map(|&i| self.ordered[i as usize].clone())
            .collect()
    }

    fn emit(&mut self, indices: Vec<u32>) -> TiledList<Q, I> {
        let visible = self.resolve(&indices);
        let chunks: Vec<_> = visible
            .iter()
            .map(|q| {
                let items = self.cache.get(q).expect("visible query is cached");
                (q.clone(), Arc::clone(items))
            })
            .collect();
        let snapshot = TiledList::from_chunks(chunks, self.limiter.item_size_hint);
        trace!(
            len = snapshot.len(),
            tiles = snapshot.tile_count(),
            "emitting snapshot"
        );
        self.last_indices = indices;
        self.last_visible = visible;
        snapshot
    }
}

impl<Q, I> Debug for TilerState<Q, I>
where
    Q: Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TilerState")
            .field("cached", &self.ordered)
            .field("order", &self.order)
            .field("limiter", &self.limiter)
            .field("last_visible", &self.last_visible)
            .finish_non_exhaustive()
    }
}

/// Adapts the merged event stream into a stream of snapshots.
///
/// Backpressure is the natural poll-driven kind: no event is pulled from the
/// merge until the consumer asks for the next snapshot.
#[pin_project]
pub(crate) struct TiledStream<St, Q, I> {
    #[pin]
    events: St,
    state: TilerState<Q, I>,
}

impl<St, Q, I> TiledStream<St, Q, I> {
    pub(crate) fn new(events: St, state: TilerState<Q, I>) -> Self {
        Self { events, state }
    }
}

impl<St, Q, I> Stream for TiledStream<St, Q, I>
where
    St: Stream<Item = Event<Q, I>>,
    Q: Clone + Eq + Hash + Debug,
{
    type Item = TiledList<Q, I>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();
        loop {
            match ready!(this.events.as_mut().poll_next(cx)) {
                Some(event) => {
                    if let Some(snapshot) = this.state.apply(event) {
                        return Poll::Ready(Some(snapshot));
                    }
                }
                None => return Poll::Ready(None),
            }
        }
    }
}
