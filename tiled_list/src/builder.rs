use std::sync::Arc;

use crate::{QueryRanges, TiledList};

/// Mutable, item-level construction path for [`TiledList`]s assembled
/// outside the tiling pipeline.
///
/// Pairs a [`QueryRanges`] map with flat item storage; adjacent batches from
/// the same query coalesce into one tile.
#[derive(Debug, Clone, Default)]
pub struct TiledListBuilder<Q, I> {
    ranges: QueryRanges<Q>,
    items: Vec<I>,
}

impl<Q, I> TiledListBuilder<Q, I> {
    /// An empty builder.
    pub fn new() -> Self {
        Self {
            ranges: QueryRanges::new(),
            items: Vec::new(),
        }
    }

    /// Number of items appended so far.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether no items have been appended.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// The item at `index`, if present.
    pub fn get(&self, index: usize) -> Option<&I> {
        self.items.get(index)
    }

    /// The query owning `index`, if present.
    pub fn query_at(&self, index: usize) -> Option<&Q> {
        self.ranges.query_at(index)
    }
}

impl<Q: Clone + PartialEq, I> TiledListBuilder<Q, I> {
    /// Append `items` owned by `query` at the end.
    pub fn append(&mut self, query: Q, items: impl IntoIterator<Item = I>) {
        let before = self.items.len();
        self.items.extend(items);
        self.ranges.append(query, self.items.len() - before);
    }

    /// Insert `items` owned by `query` before position `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index > len()`.
    pub fn insert(&mut self, index: usize, query: Q, items: Vec<I>) {
        self.ranges.insert(index, query, items.len());
        self.items.splice(index..index, items);
    }

    /// Remove and return the item at `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index >= len()`.
    pub fn delete(&mut self, index: usize) -> I {
        self.ranges.delete(index);
        self.items.remove(index)
    }

    /// Freeze into an immutable [`TiledList`].
    pub fn build(self) -> TiledList<Q, I> {
        let spans: Vec<(usize, Q)> = self
            .ranges
            .spans()
            .map(|(tile, q)| (tile.len(), q.clone()))
            .collect();
        let mut items = self.items.into_iter();
        let mut chunks = Vec::with_capacity(spans.len());
        for (len, q) in spans {
            let chunk: Vec<I> = items.by_ref().take(len).collect();
            chunks.push((q, Arc::new(chunk)));
        }
        TiledList::from_chunks(chunks, None)
    }
}
