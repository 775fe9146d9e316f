//! Internal events flowing from the dispatcher's child streams into the
//! tiler state machine.

use crate::fetch::FetchError;
use crate::request::{Limiter, Order};

/// One event on the merged output stream.
#[derive(Debug)]
pub(crate) enum Event<Q, I> {
    /// A fresh batch for `query`, replacing any cached batch wholesale.
    Data {
        query: Q,
        items: Vec<I>,
    },
    /// `query`'s upstream failed; its valve has terminated.
    Failed {
        query: Q,
        error: FetchError,
    },
    /// `query` was evicted by a standalone request.
    Evicted {
        query: Q,
    },
    /// The order policy changed.
    OrderChanged(Order<Q>),
    /// The limiter changed.
    LimiterChanged(Limiter),
    /// A pivot batch finished applying: its evictions and order change land
    /// as one event so no snapshot can surface mid-batch.
    BatchApplied {
        evicted: Vec<Q>,
        new_order: Order<Q>,
    },
}
