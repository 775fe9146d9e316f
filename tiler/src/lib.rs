//! Reactive tiling engine.
//!
//! Adapts any function of the form `fetch(Q) -> Stream<Vec<I>>` into a
//! paginated, concurrent, dynamic data source. A pipeline is wired with
//! [`list_tiler`]: feed it a stream of [`Input`]s (turn queries on or off,
//! evict them, change the [`Order`] or [`Limiter`], or re-plan the active
//! window with a [`PivotBatch`]) and it yields [`TiledList`] snapshots:
//! flat, indexable sequences in which every item remembers the query that
//! produced it and contiguous runs of same-query items form tiles.
//!
//! Internally one valve per live query controls that query's upstream
//! subscription; a dispatcher routes inputs to valves and fans their event
//! streams into an unbounded-concurrency merge; a single-owner state machine
//! folds the merged events into snapshots, gating emission on change a
//! consumer can actually see. [`to_pivoted_tile_inputs`] converts a stream
//! of focus queries into the inputs realizing a sliding hot/warm query
//! window around the user's position.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;

use futures::{Stream, StreamExt};

mod dispatch;
mod event;
mod fetch;
pub mod mock;
pub mod pivot;
mod request;
mod state;
mod valve;

pub use fetch::{fetcher_fn, FetchBatch, FetchError, FetchErrorKind, Fetcher, FetcherFn};
pub use pivot::{to_pivoted_tile_inputs, Neighbor, PivotRequest};
pub use request::{Comparator, Input, Limiter, Order, PivotBatch};
pub use tiled_list::{QueryRanges, Tile, TiledList, TiledListBuilder};

use crate::dispatch::Dispatch;
use crate::state::{TiledStream, TilerState};

/// Adapter turning a fetch function into a tiled, reactive data source.
///
/// Built with [`list_tiler`]; the one interesting method is
/// [`process`](Self::process).
#[derive(Debug)]
pub struct ListTiler<Q, F> {
    order: Order<Q>,
    limiter: Limiter,
    fetcher: Arc<F>,
}

/// Build a [`ListTiler`] with an initial order and limiter around `fetcher`.
pub fn list_tiler<Q, F>(order: Order<Q>, limiter: Limiter, fetcher: F) -> ListTiler<Q, F>
where
    F: Fetcher<Q>,
{
    ListTiler {
        order,
        limiter,
        fetcher: Arc::new(fetcher),
    }
}

impl<Q, F> ListTiler<Q, F>
where
    Q: Clone + Eq + Hash + Debug + Send + 'static,
    F: Fetcher<Q>,
{
    /// Wire the pipeline: inputs in, snapshots out.
    ///
    /// May be called more than once; every call runs an independent pipeline
    /// over the shared fetcher, starting from this tiler's initial order and
    /// limiter. Dropping the returned stream cancels the pipeline along with
    /// every upstream subscription it holds.
    pub fn process<S>(&self, inputs: S) -> impl Stream<Item = TiledList<Q, F::Item>>
    where
        S: Stream<Item = Input<Q>>,
    {
        let children = Dispatch::new(inputs, Arc::clone(&self.fetcher));
        let merged = children.flatten_unordered(None);
        TiledStream::new(merged, TilerState::new(self.order.clone(), self.limiter))
    }
}
