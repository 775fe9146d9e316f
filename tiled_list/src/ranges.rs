use crate::Tile;

/// Sparse mapping from contiguous index ranges to queries.
///
/// Backs externally-assembled tiled lists: the caller owns the flat item
/// storage, this structure answers "which query produced index `i`" and
/// keeps the ranges consistent across appends, inserts and deletes.
///
/// Spans are packed as `(start << 32) | end` so lookups binary-search a
/// dense `Vec<u64>`. A span emptied by deletions is tombstoned in place
/// (`start == end`) and reclaimed lazily.
#[derive(Debug, Clone, Default)]
pub struct QueryRanges<Q> {
    spans: Vec<u64>,
    queries: Vec<Q>,
    total: u32,
    tombstones: usize,
}

const fn pack(start: u32, end: u32) -> u64 {
    ((start as u64) << 32) | end as u64
}

const fn span_start(span: u64) -> u32 {
    (span >> 32) as u32
}

const fn span_end(span: u64) -> u32 {
    span as u32
}

const fn is_tombstone(span: u64) -> bool {
    span_start(span) == span_end(span)
}

impl<Q> QueryRanges<Q> {
    /// A map with no ranges.
    pub fn new() -> Self {
        Self {
            spans: Vec::new(),
            queries: Vec::new(),
            total: 0,
            tombstones: 0,
        }
    }

    /// Total number of indices covered.
    pub fn len(&self) -> usize {
        self.total as usize
    }

    /// Whether no indices are covered.
    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    /// Number of live (non-tombstoned) spans.
    pub fn span_count(&self) -> usize {
        self.spans.len() - self.tombstones
    }

    /// The query owning `index`, if `index < len()`.
    pub fn query_at(&self, index: usize) -> Option<&Q> {
        self.locate(index).map(|at| &self.queries[at])
    }

    /// Iterate live spans in index order as `(Tile, &Q)` pairs.
    pub fn spans(&self) -> impl Iterator<Item = (Tile, &Q)> + '_ {
        self.spans
            .iter()
            .zip(self.queries.iter())
            .filter(|(&s, _)| !is_tombstone(s))
            .map(|(&s, q)| (Tile::new(span_start(s), span_end(s)), q))
    }

    /// Position of the live span containing `index`.
    fn locate(&self, index: usize) -> Option<usize> {
        if index >= self.total as usize {
            return None;
        }
        let index = index as u32;
        // first span starting past `index`, then scan back over tombstones
        let pp = self.spans.partition_point(|&s| span_start(s) <= index);
        for j in (0..pp).rev() {
            let s = self.spans[j];
            if is_tombstone(s) {
                continue;
            }
            return (span_start(s) <= index && index < span_end(s)).then_some(j);
        }
        None
    }

    fn prev_live(&self, at: usize) -> Option<usize> {
        (0..at).rev().find(|&j| !is_tombstone(self.spans[j]))
    }

    fn last_live(&self) -> Option<usize> {
        (0..self.spans.len())
            .rev()
            .find(|&j| !is_tombstone(self.spans[j]))
    }

    /// Shift every span from position `at` on by `delta` indices.
    fn shift_from(&mut self, at: usize, delta: i64) {
        for s in &mut self.spans[at..] {
            let start = (span_start(*s) as i64 + delta) as u32;
            let end = (span_end(*s) as i64 + delta) as u32;
            *s = pack(start, end);
        }
    }

    /// Reclaim tombstoned spans.
    pub fn gc(&mut self) {
        if self.tombstones == 0 {
            return;
        }
        let live = self.spans.len() - self.tombstones;
        let mut spans = Vec::with_capacity(live);
        let mut queries = Vec::with_capacity(live);
        for (s, q) in std::mem::take(&mut self.spans)
            .into_iter()
            .zip(std::mem::take(&mut self.queries))
        {
            if !is_tombstone(s) {
                spans.push(s);
                queries.push(q);
            }
        }
        self.spans = spans;
        self.queries = queries;
        self.tombstones = 0;
    }
}

impl<Q: Clone + PartialEq> QueryRanges<Q> {
    /// Extend the map by `count` indices owned by `query` at the end.
    ///
    /// Merges into the last span when its query matches.
    pub fn append(&mut self, query: Q, count: usize) {
        if count == 0 {
            return;
        }
        let count = u32::try_from(count).expect("range count overflows u32");
        let start = self.total;
        let end = start.checked_add(count).expect("total size overflows u32");
        if let Some(last) = self.last_live() {
            if self.queries[last] == query {
                self.spans[last] = pack(span_start(self.spans[last]), end);
                self.total = end;
                return;
            }
        }
        self.spans.push(pack(start, end));
        self.queries.push(query);
        self.total = end;
    }

    /// Insert `count` indices owned by `query` before position `index`,
    /// shifting everything at and after `index` rightwards.
    ///
    /// Merges into the adjacent span when its query matches; inserting into
    /// the interior of a foreign span splits it.
    ///
    /// # Panics
    ///
    /// Panics if `index > len()`.
    pub fn insert(&mut self, index: usize, query: Q, count: usize) {
        assert!(
            index <= self.total as usize,
            "insert index {index} out of bounds (len {})",
            self.total
        );
        if count == 0 {
            return;
        }
        if index == self.total as usize {
            return self.append(query, count);
        }
        let count = u32::try_from(count).expect("range count overflows u32");
        self.total
            .checked_add(count)
            .expect("total size overflows u32");

        let at = self.locate(index).expect("in-bounds index has a span");
        let span = self.spans[at];
        let (start, end) = (span_start(span), span_end(span));
        let index = index as u32;

        if index == start {
            if let Some(prev) = self.prev_live(at) {
                if self.queries[prev] == query {
                    let p = self.spans[prev];
                    self.spans[prev] = pack(span_start(p), span_end(p) + count);
                    self.shift_from(at, count as i64);
                    self.total += count;
                    return;
                }
            }
            if self.queries[at] == query {
                self.spans[at] = pack(start, end + count);
                self.shift_from(at + 1, count as i64);
            } else {
                self.spans.insert(at, pack(index, index + count));
                self.queries.insert(at, query);
                self.shift_from(at + 1, count as i64);
            }
        } else if self.queries[at] == query {
            self.spans[at] = pack(start, end + count);
            self.shift_from(at + 1, count as i64);
        } else {
            // split the covering span around the insertion
            let tail = self.queries[at].clone();
            self.spans[at] = pack(start, index);
            self.spans.insert(at + 1, pack(index, index + count));
            self.queries.insert(at + 1, query);
            self.spans.insert(at + 2, pack(index + count, end + count));
            self.queries.insert(at + 2, tail);
            self.shift_from(at + 3, count as i64);
        }
        self.total += count;
    }

    /// Remove the index at `index`, shifting everything after it leftwards.
    ///
    /// A span emptied by the removal is tombstoned; tombstones are reclaimed
    /// once they dominate the span array.
    ///
    /// # Panics
    ///
    /// Panics if `index >= len()`.
    pub fn delete(&mut self, index: usize) {
        let at = self
            .locate(index)
            .unwrap_or_else(|| panic!("delete index {index} out of bounds (len {})", self.total));
        let span = self.spans[at];
        self.spans[at] = pack(span_start(span), span_end(span) - 1);
        self.shift_from(at + 1, -1);
        self.total -= 1;
        if is_tombstone(self.spans[at]) {
            self.tombstones += 1;
            if self.tombstones > 8 && self.tombstones * 2 > self.spans.len() {
                self.gc();
            }
        }
    }
}
