use std::fmt::{Debug, Formatter};
use std::hash::Hash;
use std::sync::Arc;

use hashbrown::HashSet;

use crate::{Tile, TiledListBuilder};

/// An immutable, chunked snapshot of items with query provenance.
///
/// Behaves as a flat sequence of `I`; every index additionally remembers the
/// query that produced it, and contiguous runs of same-query items form
/// [`Tile`]s. Cloning is an `Arc` bump; the per-tile chunks are shared with
/// whoever constructed the snapshot, so emission never copies items.
///
/// Indexed reads are O(1) when a chunk-size hint describes the layout and
/// O(log tiles) otherwise.
pub struct TiledList<Q, I> {
    inner: Arc<Inner<Q, I>>,
}

#[derive(Debug)]
struct Inner<Q, I> {
    /// Exclusive end offset of each tile; strictly increasing.
    cumulative: Vec<u32>,
    /// The query owning each tile.
    queries: Vec<Q>,
    /// The items of each tile. Never empty.
    chunks: Vec<Arc<Vec<I>>>,
    /// When set, every tile but the last holds exactly this many items.
    chunk_size_hint: Option<u32>,
}

impl<Q, I> TiledList<Q, I> {
    /// A snapshot with no tiles.
    pub fn empty() -> Self {
        Self::from_chunks(std::iter::empty(), None)
    }

    /// Build a snapshot from `(query, chunk)` pairs in tile order.
    ///
    /// Empty chunks are skipped. The hint is kept only when it actually
    /// describes the resulting layout (every chunk but the last exactly
    /// `hint` items, the last no larger); otherwise reads fall back to
    /// binary search.
    pub fn from_chunks(
        chunks: impl IntoIterator<Item = (Q, Arc<Vec<I>>)>,
        chunk_size_hint: Option<u32>,
    ) -> Self {
        let mut cumulative = Vec::new();
        let mut queries = Vec::new();
        let mut kept = Vec::new();
        let mut total: u32 = 0;
        for (q, chunk) in chunks {
            if chunk.is_empty() {
                continue;
            }
            let n = u32::try_from(chunk.len()).expect("chunk len overflows u32");
            total = total.checked_add(n).expect("list len overflows u32");
            cumulative.push(total);
            queries.push(q);
            kept.push(chunk);
        }
        let chunk_size_hint = chunk_size_hint.filter(|&h| hint_matches(h, &kept));
        Self {
            inner: Arc::new(Inner {
                cumulative,
                queries,
                chunks: kept,
                chunk_size_hint,
            }),
        }
    }

    /// Total number of items.
    pub fn len(&self) -> usize {
        self.inner.cumulative.last().copied().unwrap_or(0) as usize
    }

    /// Whether the snapshot holds no items.
    pub fn is_empty(&self) -> bool {
        self.inner.cumulative.is_empty()
    }

    /// Number of tiles.
    pub fn tile_count(&self) -> usize {
        self.inner.queries.len()
    }

    /// The chunk-size hint this snapshot was built with, if it survived
    /// validation.
    pub fn chunk_size_hint(&self) -> Option<u32> {
        self.inner.chunk_size_hint
    }

    /// The item at `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index >= len()`.
    pub fn get(&self, index: usize) -> &I {
        let t = self.tile_of(index);
        &self.inner.chunks[t][index - self.tile_start(t)]
    }

    /// The query that produced the item at `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index >= len()`.
    pub fn query_at(&self, index: usize) -> &Q {
        &self.inner.queries[self.tile_of(index)]
    }

    /// The index range of tile `tile`.
    ///
    /// # Panics
    ///
    /// Panics if `tile >= tile_count()`.
    pub fn tile_at(&self, tile: usize) -> Tile {
        self.assert_tile(tile);
        Tile::new(self.tile_start(tile) as u32, self.inner.cumulative[tile])
    }

    /// The query owning tile `tile`.
    ///
    /// # Panics
    ///
    /// Panics if `tile >= tile_count()`.
    pub fn query_at_tile(&self, tile: usize) -> &Q {
        self.assert_tile(tile);
        &self.inner.queries[tile]
    }

    /// Iterate items in index order.
    pub fn iter(&self) -> impl Iterator<Item = &I> + '_ {
        self.inner.chunks.iter().flat_map(|c| c.iter())
    }

    /// Iterate `(Tile, &Q)` pairs left to right.
    pub fn tiles(&self) -> impl Iterator<Item = (Tile, &Q)> + '_ {
        (0..self.tile_count()).map(|t| (self.tile_at(t), &self.inner.queries[t]))
    }

    /// Iterate per-tile queries left to right.
    pub fn queries(&self) -> impl Iterator<Item = &Q> + '_ {
        self.inner.queries.iter()
    }

    fn assert_tile(&self, tile: usize) {
        assert!(
            tile < self.tile_count(),
            "tile index out of bounds: the tile count is {} but the index is {tile}",
            self.tile_count()
        );
    }

    fn tile_of(&self, index: usize) -> usize {
        let len = self.len();
        assert!(
            index < len,
            "index out of bounds: the len is {len} but the index is {index}"
        );
        match self.inner.chunk_size_hint {
            Some(h) => index / h as usize,
            None => self
                .inner
                .cumulative
                .partition_point(|&end| (end as usize) <= index),
        }
    }

    fn tile_start(&self, tile: usize) -> usize {
        if tile == 0 {
            0
        } else {
            self.inner.cumulative[tile - 1] as usize
        }
    }

    /// The query at every index, tiles expanded.
    fn queries_per_index(&self) -> impl Iterator<Item = &Q> + '_ {
        self.tiles()
            .flat_map(|(tile, q)| std::iter::repeat(q).take(tile.len()))
    }
}

impl<Q: Clone, I> TiledList<Q, I> {
    /// A snapshot with the same tile structure and every item transformed
    /// through `f`.
    pub fn map<J>(&self, f: impl Fn(&I) -> J) -> TiledList<Q, J> {
        TiledList {
            inner: Arc::new(Inner {
                cumulative: self.inner.cumulative.clone(),
                queries: self.inner.queries.clone(),
                chunks: self
                    .inner
                    .chunks
                    .iter()
                    .map(|c| Arc::new(c.iter().map(&f).collect()))
                    .collect(),
                chunk_size_hint: self.inner.chunk_size_hint,
            }),
        }
    }
}

impl<Q: Clone + PartialEq, I: Clone> TiledList<Q, I> {
    /// Keep only items satisfying `predicate`; survivors retain their
    /// originating query, and adjacent same-query survivors coalesce.
    pub fn filter(&self, predicate: impl Fn(&I) -> bool) -> Self {
        self.retain(|item| predicate(item))
    }

    /// Keep the first occurrence per `key`, preserving query association.
    pub fn distinct_by<K: Eq + Hash>(&self, key: impl Fn(&I) -> K) -> Self {
        let mut seen = HashSet::new();
        self.retain(move |item| seen.insert(key(item)))
    }

    fn retain(&self, mut keep: impl FnMut(&I) -> bool) -> Self {
        let mut builder = TiledListBuilder::new();
        for (tile, q) in self.tiles() {
            let mut survivors = Vec::new();
            for i in tile.range() {
                let item = self.get(i);
                if keep(item) {
                    survivors.push(item.clone());
                }
            }
            if !survivors.is_empty() {
                builder.append(q.clone(), survivors);
            }
        }
        builder.build()
    }
}

impl<Q, I> Clone for TiledList<Q, I> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<Q, I> Default for TiledList<Q, I> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<Q: Debug, I: Debug> Debug for TiledList<Q, I> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TiledList")
            .field("len", &self.len())
            .field("queries", &self.inner.queries)
            .field("chunks", &self.inner.chunks)
            .finish()
    }
}

/// Equality is structural: same length, same item sequence, same query at
/// every index. Tile boundaries themselves do not participate.
impl<Q: PartialEq, I: PartialEq> PartialEq for TiledList<Q, I> {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len()
            && self.iter().eq(other.iter())
            && self.queries_per_index().eq(other.queries_per_index())
    }
}

impl<Q: Eq, I: Eq> Eq for TiledList<Q, I> {}

fn hint_matches<I>(hint: u32, chunks: &[Arc<Vec<I>>]) -> bool {
    if hint == 0 {
        return false;
    }
    let h = hint as usize;
    chunks
        .iter()
        .enumerate()
        .all(|(i, c)| if i + 1 == chunks.len() { c.len() <= h } else { c.len() == h })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list(chunks: Vec<(char, Vec<i32>)>, hint: Option<u32>) -> TiledList<char, i32> {
        TiledList::from_chunks(chunks.into_iter().map(|(q, c)| (q, Arc::new(c))), hint)
    }

    #[test]
    fn empty() {
        let l: TiledList<char, i32> = TiledList::empty();
        assert_eq!(l.len(), 0);
        assert!(l.is_empty());
        assert_eq!(l.tile_count(), 0);
        assert_eq!(l.iter().count(), 0);
    }

    #[test]
    fn skips_empty_chunks() {
        let l = list(vec![('a', vec![]), ('b', vec![1]), ('c', vec![])], None);
        assert_eq!(l.len(), 1);
        assert_eq!(l.tile_count(), 1);
        assert_eq!(l.query_at(0), &'b');
    }

    #[test]
    fn indexed_reads_without_hint() {
        let l = list(vec![('a', vec![1, 2, 3]), ('b', vec![4]), ('c', vec![5, 6])], None);
        assert_eq!(l.len(), 6);
        assert_eq!(l.tile_count(), 3);
        assert_eq!(*l.get(0), 1);
        assert_eq!(*l.get(2), 3);
        assert_eq!(*l.get(3), 4);
        assert_eq!(*l.get(5), 6);
        assert_eq!(l.query_at(2), &'a');
        assert_eq!(l.query_at(3), &'b');
        assert_eq!(l.query_at(4), &'c');
        assert_eq!(l.tile_at(1), Tile::new(3, 4));
        assert_eq!(l.query_at_tile(2), &'c');
    }

    #[test]
    fn indexed_reads_with_hint() {
        let l = list(
            vec![('a', vec![1, 2]), ('b', vec![3, 4]), ('c', vec![5])],
            Some(2),
        );
        assert_eq!(l.chunk_size_hint(), Some(2));
        assert_eq!(*l.get(3), 4);
        assert_eq!(l.query_at(3), &'b');
        assert_eq!(*l.get(4), 5);
        assert_eq!(l.query_at(4), &'c');
    }

    #[test]
    fn mismatched_hint_is_dropped() {
        let l = list(vec![('a', vec![1, 2, 3]), ('b', vec![4])], Some(2));
        assert_eq!(l.chunk_size_hint(), None);
        assert_eq!(*l.get(2), 3);
        assert_eq!(l.query_at(3), &'b');
    }

    #[test]
    #[should_panic(expected = "index out of bounds")]
    fn get_out_of_bounds_panics() {
        let l = list(vec![('a', vec![1])], None);
        l.get(1);
    }

    #[test]
    #[should_panic(expected = "tile index out of bounds")]
    fn tile_at_out_of_bounds_panics() {
        let l = list(vec![('a', vec![1])], None);
        l.tile_at(1);
    }

    #[test]
    fn iteration_order() {
        let l = list(vec![('a', vec![1, 2]), ('b', vec![3])], None);
        assert_eq!(l.iter().copied().collect::<Vec<_>>(), vec![1, 2, 3]);
        assert_eq!(
            l.tiles().map(|(t, q)| (t.start(), t.end(), *q)).collect::<Vec<_>>(),
            vec![(0, 2, 'a'), (2, 3, 'b')]
        );
        assert_eq!(l.queries().copied().collect::<Vec<_>>(), vec!['a', 'b']);
    }

    #[test]
    fn equality_is_per_index_not_per_tile() {
        let one = list(vec![('a', vec![1, 2])], None);
        let split = list(vec![('a', vec![1]), ('a', vec![2])], None);
        assert_eq!(one, split);

        let other_query = list(vec![('b', vec![1, 2])], None);
        assert_ne!(one, other_query);

        let other_items = list(vec![('a', vec![1, 3])], None);
        assert_ne!(one, other_items);

        let shorter = list(vec![('a', vec![1])], None);
        assert_ne!(one, shorter);
    }

    #[test]
    fn map_preserves_structure() {
        let l = list(vec![('a', vec![1, 2]), ('b', vec![3])], Some(2));
        let doubled = l.map(|v| v * 2);
        assert_eq!(doubled.len(), 3);
        assert_eq!(doubled.chunk_size_hint(), Some(2));
        assert_eq!(*doubled.get(2), 6);
        assert_eq!(doubled.query_at(2), &'b');
    }

    #[test]
    fn filter_preserves_query_association() {
        let l = list(vec![('a', vec![1, 2, 3]), ('b', vec![4, 5])], None);
        let odd = l.filter(|v| v % 2 == 1);
        assert_eq!(odd.len(), 3);
        assert_eq!(odd.iter().copied().collect::<Vec<_>>(), vec![1, 3, 5]);
        assert_eq!(odd.query_at(0), &'a');
        assert_eq!(odd.query_at(1), &'a');
        assert_eq!(odd.query_at(2), &'b');
        assert_eq!(odd.tile_count(), 2);
    }

    #[test]
    fn filter_coalesces_across_emptied_tiles() {
        let l = list(
            vec![('a', vec![1]), ('b', vec![2]), ('a', vec![3])],
            None,
        );
        let no_b = l.filter(|v| *v != 2);
        // both survivors came from 'a' and are now adjacent
        assert_eq!(no_b.tile_count(), 1);
        assert_eq!(no_b.query_at(1), &'a');
    }

    #[test]
    fn distinct_by_keeps_first_occurrence() {
        let l = list(vec![('a', vec![1, 2, 1]), ('b', vec![2, 3])], None);
        let d = l.distinct_by(|v| *v);
        assert_eq!(d.iter().copied().collect::<Vec<_>>(), vec![1, 2, 3]);
        assert_eq!(d.query_at(0), &'a');
        assert_eq!(d.query_at(1), &'a');
        assert_eq!(d.query_at(2), &'b');
    }

    #[test]
    fn rebuild_tile_by_tile_round_trips() {
        let l = list(vec![('a', vec![1, 2]), ('b', vec![3]), ('c', vec![4, 5])], None);
        let mut b = TiledListBuilder::new();
        for (tile, q) in l.tiles() {
            b.append(*q, tile.range().map(|i| *l.get(i)));
        }
        assert_eq!(b.build(), l);
    }
}
