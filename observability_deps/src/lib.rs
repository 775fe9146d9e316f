//! This crate exists to coordinate versions of `tracing` and friends so that
//! the rest of the workspace can use a single, consistent version of these
//! observability dependencies.

// Export tracing publicly so this is the only version used in the workspace.
pub use tracing;
