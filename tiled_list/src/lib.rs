//! Chunked, query-addressed list snapshots.
//!
//! A [`TiledList`] is a flat, indexable sequence in which every item
//! remembers the query that produced it, and contiguous runs of items from
//! the same query form [`Tile`]s. Lists are immutable snapshots; the mutable
//! construction paths are [`TiledListBuilder`] (item-level edits) and
//! [`QueryRanges`] (the underlying sparse index-range map).
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

mod builder;
mod list;
mod ranges;
mod tile;

pub use builder::TiledListBuilder;
pub use list::TiledList;
pub use ranges::QueryRanges;
pub use tile::Tile;
