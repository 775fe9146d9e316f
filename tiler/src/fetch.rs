//! The upstream contract: one lazy stream of item batches per query.

use std::fmt::{Debug, Display, Formatter};
use std::future::Future;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};

/// One emission of an upstream subscription: a full replacement batch for
/// the query, or the failure that ends the subscription.
pub type FetchBatch<I> = Result<Vec<I>, FetchError>;

/// Generic boxed error type for upstream failures.
///
/// The dynamic boxing makes it easier to deal with errors from arbitrary
/// fetch implementations.
#[derive(Debug)]
pub struct FetchError {
    inner: Box<dyn std::error::Error + Sync + Send>,
    kind: FetchErrorKind,
}

impl FetchError {
    /// Wrap `e` as a [`FetchError`] of the given kind.
    pub fn new(
        kind: FetchErrorKind,
        e: impl Into<Box<dyn std::error::Error + Sync + Send>>,
    ) -> Self {
        Self {
            inner: e.into(),
            kind,
        }
    }

    /// The query cannot be served by this source.
    pub fn invalid_query(e: impl Into<Box<dyn std::error::Error + Sync + Send>>) -> Self {
        Self::new(FetchErrorKind::InvalidQuery, e)
    }

    /// This fetch failed for an unknown reason.
    pub fn unknown(e: impl Into<Box<dyn std::error::Error + Sync + Send>>) -> Self {
        Self::new(FetchErrorKind::Unknown, e)
    }

    /// Returns the kind of error this was.
    pub fn kind(&self) -> FetchErrorKind {
        self.kind
    }

    /// Returns the inner error.
    pub fn inner(&self) -> &dyn std::error::Error {
        self.inner.as_ref()
    }
}

impl Display for FetchError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "FetchError({:?}): {}", self.kind, self.inner)
    }
}

impl std::error::Error for FetchError {}

impl From<std::io::Error> for FetchError {
    fn from(e: std::io::Error) -> Self {
        Self {
            inner: Box::new(e),
            kind: FetchErrorKind::IO,
        }
    }
}

impl From<String> for FetchError {
    fn from(e: String) -> Self {
        Self {
            inner: e.into(),
            kind: FetchErrorKind::Unknown,
        }
    }
}

impl From<&'static str> for FetchError {
    fn from(e: &'static str) -> Self {
        Self {
            inner: e.into(),
            kind: FetchErrorKind::Unknown,
        }
    }
}

/// Coarse classification of a [`FetchError`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FetchErrorKind {
    /// This fetch failed for an unknown reason.
    Unknown,

    /// The query itself was rejected by the source.
    InvalidQuery,

    /// A fatal IO error occurred - non-fatal errors should be retried inside
    /// the fetcher.
    IO,
}

/// Produces one independent stream of item batches per query.
///
/// Each [`fetch`](Self::fetch) call opens a fresh, lazy subscription; calls
/// must be idempotent and subscriptions must not share state. Errors surface
/// as stream items and end the subscription. Retry policy belongs inside the
/// implementation; the engine never retries.
#[async_trait]
pub trait Fetcher<Q>: Send + Sync + Debug + 'static {
    /// Item type produced for each query.
    type Item: Send + 'static;

    /// Open a subscription for `query`.
    async fn fetch(&self, query: Q) -> BoxStream<'static, FetchBatch<Self::Item>>;
}

/// Adapt an `async Fn(Q) -> Stream` closure into a [`Fetcher`].
pub fn fetcher_fn<F>(f: F) -> FetcherFn<F> {
    FetcherFn(f)
}

/// See [`fetcher_fn`].
pub struct FetcherFn<F>(F);

impl<F> Debug for FetcherFn<F> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetcherFn").finish_non_exhaustive()
    }
}

#[async_trait]
impl<Q, I, F, Fut, S> Fetcher<Q> for FetcherFn<F>
where
    Q: Send + 'static,
    I: Send + 'static,
    F: Fn(Q) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = S> + Send,
    S: Stream<Item = FetchBatch<I>> + Send + 'static,
{
    type Item = I;

    async fn fetch(&self, query: Q) -> BoxStream<'static, FetchBatch<I>> {
        (self.0)(query).await.boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_and_display() {
        let e = FetchError::invalid_query("page does not exist");
        assert_eq!(e.kind(), FetchErrorKind::InvalidQuery);
        assert_eq!(
            e.to_string(),
            "FetchError(InvalidQuery): page does not exist"
        );

        let e: FetchError = "boom".into();
        assert_eq!(e.kind(), FetchErrorKind::Unknown);

        let e: FetchError = std::io::Error::new(std::io::ErrorKind::Other, "disk gone").into();
        assert_eq!(e.kind(), FetchErrorKind::IO);
        assert_eq!(e.inner().to_string(), "disk gone");
    }

    #[tokio::test]
    async fn closure_fetchers() {
        let fetcher = fetcher_fn(|query: u32| async move {
            futures::stream::iter([Ok(vec![query, query + 1])])
        });
        let batches: Vec<_> = fetcher.fetch(7).await.collect().await;
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].as_ref().unwrap(), &vec![7, 8]);
    }
}
