//! Control-plane value types: order policy, output limits, pipeline inputs.

use std::cmp::Ordering;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;

/// Caller-supplied total order over queries.
pub type Comparator<Q> = Arc<dyn Fn(&Q, &Q) -> Ordering + Send + Sync>;

/// Policy governing which cached queries appear, and in what sequence, in
/// emitted snapshots.
#[derive(Clone)]
pub enum Order<Q> {
    /// Plain total order: the visible window is the smallest cached queries.
    Sorted {
        /// Comparator defining the total order.
        cmp: Comparator<Q>,
    },
    /// Total order with an explicit pivot: the visible window grows outward
    /// from the pivot query.
    PivotSorted {
        /// The query the visible window centers on.
        pivot: Q,
        /// Comparator defining the total order.
        cmp: Comparator<Q>,
    },
}

impl<Q> Order<Q> {
    /// Plain total order under `cmp`.
    pub fn sorted(cmp: impl Fn(&Q, &Q) -> Ordering + Send + Sync + 'static) -> Self {
        Self::Sorted { cmp: Arc::new(cmp) }
    }

    /// Pivoted order under `cmp`, centered on `pivot`.
    pub fn pivot_sorted(
        pivot: Q,
        cmp: impl Fn(&Q, &Q) -> Ordering + Send + Sync + 'static,
    ) -> Self {
        Self::PivotSorted {
            pivot,
            cmp: Arc::new(cmp),
        }
    }

    /// The pivot query, when this order has one.
    pub fn pivot(&self) -> Option<&Q> {
        match self {
            Self::Sorted { .. } => None,
            Self::PivotSorted { pivot, .. } => Some(pivot),
        }
    }

    pub(crate) fn comparator(&self) -> &Comparator<Q> {
        match self {
            Self::Sorted { cmp } => cmp,
            Self::PivotSorted { cmp, .. } => cmp,
        }
    }
}

impl<Q: Ord + 'static> Order<Q> {
    /// Plain order under the type's natural ascending order.
    pub fn ascending() -> Self {
        Self::sorted(Q::cmp)
    }

    /// Pivoted order under the type's natural ascending order.
    pub fn pivot_ascending(pivot: Q) -> Self {
        Self::pivot_sorted(pivot, Q::cmp)
    }
}

impl<Q: Debug> Debug for Order<Q> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sorted { .. } => f.debug_struct("Sorted").finish_non_exhaustive(),
            Self::PivotSorted { pivot, .. } => f
                .debug_struct("PivotSorted")
                .field("pivot", pivot)
                .finish_non_exhaustive(),
        }
    }
}

/// Caps on emitted snapshots.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Limiter {
    /// Maximum number of tiles per snapshot; `None` is unbounded.
    pub max_queries: Option<u32>,
    /// When every query fetches fixed-size batches, that size; lets snapshot
    /// readers index in O(1).
    pub item_size_hint: Option<u32>,
}

impl Limiter {
    /// No tile cap, no indexing hint.
    pub fn unbounded() -> Self {
        Self::default()
    }

    /// Cap snapshots at `max` tiles.
    pub fn max_queries(max: u32) -> Self {
        Self {
            max_queries: Some(max),
            item_size_hint: None,
        }
    }

    /// Declare that every query fetches batches of exactly `hint` items.
    pub fn with_item_size_hint(self, hint: u32) -> Self {
        Self {
            item_size_hint: Some(hint),
            ..self
        }
    }
}

/// A control event for a running pipeline.
#[derive(Debug, Clone)]
pub enum Input<Q> {
    /// Begin or resume fetching `Q`. Idempotent while already on.
    On(Q),
    /// Stop collecting for `Q`; cached items are retained and the query can
    /// be resumed.
    Off(Q),
    /// Stop collecting for `Q` and drop its cached items. A no-op for
    /// unknown queries.
    Evict(Q),
    /// Replace the order policy.
    SetOrder(Order<Q>),
    /// Replace the limiter.
    SetLimiter(Limiter),
    /// Atomically re-plan the active query window.
    PivotBatch(PivotBatch<Q>),
}

/// An atomic re-plan of the active query window.
///
/// The phases apply strictly as evict, then off, then on, then the order
/// change; evicting before re-ordering keeps a query that is both evicted
/// and newly visible from ever surfacing in a snapshot.
#[derive(Debug, Clone)]
pub struct PivotBatch<Q> {
    /// Queries to terminate and drop.
    pub evict: Vec<Q>,
    /// Queries to pause, keeping their cached items warm.
    pub off: Vec<Q>,
    /// Queries to turn on, the pivot last.
    pub on: Vec<Q>,
    /// Order installed once the lifecycle changes have been applied.
    pub new_order: Order<Q>,
}
