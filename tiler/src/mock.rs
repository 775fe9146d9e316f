//! A scriptable [`Fetcher`] for tests.

use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use hashbrown::HashMap;
use parking_lot::Mutex;

use crate::fetch::{FetchBatch, FetchError, Fetcher};

/// A [`Fetcher`] replaying scripted batches per query.
///
/// Every subscription replays the query's current script from the start and
/// then stays pending, mimicking a live source that has nothing further to
/// say; [`script_error`](Self::script_error) ends the replay with a failure
/// instead. Subscription counts are recorded for assertions. Clones share
/// state, so a handle can keep scripting and asserting after the fetcher
/// moved into a pipeline.
#[derive(Debug)]
pub struct MockFetcher<Q, I> {
    state: Arc<Mutex<MockState<Q, I>>>,
}

#[derive(Debug)]
struct MockState<Q, I> {
    scripts: HashMap<Q, Script<I>>,
    fetches: HashMap<Q, usize>,
}

#[derive(Debug, Clone)]
struct Script<I> {
    batches: Vec<Vec<I>>,
    error: Option<String>,
    ends: bool,
}

impl<Q: Eq + Hash, I> MockFetcher<Q, I> {
    /// A fetcher with no scripts; unscripted queries stay silent.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                scripts: HashMap::new(),
                fetches: HashMap::new(),
            })),
        }
    }

    /// Replace the script for `query`.
    pub fn script(&self, query: Q, batches: Vec<Vec<I>>) {
        self.state.lock().scripts.insert(
            query,
            Script {
                batches,
                error: None,
                ends: false,
            },
        );
    }

    /// Replace the script for `query`, ending the subscription after the
    /// batches instead of staying pending.
    pub fn script_ending(&self, query: Q, batches: Vec<Vec<I>>) {
        self.state.lock().scripts.insert(
            query,
            Script {
                batches,
                error: None,
                ends: true,
            },
        );
    }

    /// Replace the script for `query`, ending the replay with a failure.
    pub fn script_error(&self, query: Q, batches: Vec<Vec<I>>, error: impl Into<String>) {
        self.state.lock().scripts.insert(
            query,
            Script {
                batches,
                error: Some(error.into()),
                ends: true,
            },
        );
    }

    /// Number of subscriptions opened for `query` so far.
    pub fn fetches(&self, query: &Q) -> usize {
        self.state.lock().fetches.get(query).copied().unwrap_or_default()
    }
}

impl<Q: Eq + Hash, I> Default for MockFetcher<Q, I> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Q, I> Clone for MockFetcher<Q, I> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

#[async_trait]
impl<Q, I> Fetcher<Q> for MockFetcher<Q, I>
where
    Q: Clone + Eq + Hash + Debug + Send + 'static,
    I: Clone + Debug + Send + 'static,
{
    type Item = I;

    async fn fetch(&self, query: Q) -> BoxStream<'static, FetchBatch<I>> {
        let script = {
            let mut state = self.state.lock();
            *state.fetches.entry(query.clone()).or_default() += 1;
            state.scripts.get(&query).cloned()
        };
        let script = script.unwrap_or(Script {
            batches: vec![],
            error: None,
            ends: false,
        });

        let mut emissions: Vec<FetchBatch<I>> = script.batches.into_iter().map(Ok).collect();
        if let Some(msg) = script.error {
            emissions.push(Err(FetchError::unknown(msg)));
        }
        if script.ends {
            futures::stream::iter(emissions).boxed()
        } else {
            futures::stream::iter(emissions)
                .chain(futures::stream::pending())
                .boxed()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn replays_script_then_stays_pending() {
        let fetcher: MockFetcher<u32, i32> = MockFetcher::new();
        fetcher.script(1, vec![vec![1, 2], vec![3]]);

        let mut stream = fetcher.fetch(1).await;
        assert_eq!(stream.next().await.unwrap().unwrap(), vec![1, 2]);
        assert_eq!(stream.next().await.unwrap().unwrap(), vec![3]);
        assert!(futures::FutureExt::now_or_never(stream.next()).is_none());

        assert_eq!(fetcher.fetches(&1), 1);
        assert_eq!(fetcher.fetches(&2), 0);
    }

    #[tokio::test]
    async fn error_ends_the_stream() {
        let fetcher: MockFetcher<u32, i32> = MockFetcher::new();
        fetcher.script_error(1, vec![vec![1]], "source gone");

        let mut stream = fetcher.fetch(1).await;
        assert_eq!(stream.next().await.unwrap().unwrap(), vec![1]);
        let err = stream.next().await.unwrap().unwrap_err();
        assert_eq!(err.to_string(), "FetchError(Unknown): source gone");
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn each_subscription_replays_from_the_start() {
        let fetcher: MockFetcher<u32, i32> = MockFetcher::new();
        fetcher.script(1, vec![vec![7]]);

        let mut first = fetcher.fetch(1).await;
        let mut second = fetcher.fetch(1).await;
        assert_eq!(first.next().await.unwrap().unwrap(), vec![7]);
        assert_eq!(second.next().await.unwrap().unwrap(), vec![7]);
        assert_eq!(fetcher.fetches(&1), 2);
    }
}
