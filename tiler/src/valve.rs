//! Per-query lifecycle control over one upstream subscription.

use std::fmt::Debug;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::{FutureExt, Stream, StreamExt};
use observability_deps::tracing::debug;
use tokio::sync::mpsc;

use crate::event::Event;
use crate::fetch::{FetchBatch, Fetcher};

/// Control signal accepted by a [`Valve`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Signal {
    On,
    Off,
    Terminate,
}

/// Lifecycle state of a [`Valve`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ValveState {
    /// Nothing has polled the valve yet; signals queue in the channel.
    Disconnected,
    /// Collecting from an upstream subscription.
    Active,
    /// Upstream released; resumable.
    Paused,
    /// Closed for good.
    Terminated,
}

/// The upstream connection of a valve.
enum Upstream<I> {
    /// No subscription: before the first `On`, while paused, or after the
    /// upstream ended on its own.
    Idle,
    /// The `fetch` call is in flight.
    Connecting(BoxFuture<'static, BoxStream<'static, FetchBatch<I>>>),
    /// Streaming batches.
    Streaming(BoxStream<'static, FetchBatch<I>>),
}

impl<I> Debug for Upstream<I> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Idle => "Idle",
            Self::Connecting(_) => "Connecting",
            Self::Streaming(_) => "Streaming",
        };
        f.write_str(name)
    }
}

/// Controls the upstream subscription lifecycle for exactly one query.
///
/// A valve is a stream of [`Event`]s. It pulls nothing until polled, so an
/// `On` sent before the merged downstream subscribes simply waits in the
/// control channel. On every poll queued signals drain before the upstream
/// is touched: a `Terminate` therefore suppresses any emission the upstream
/// still had in flight, and only the net effect of a signal burst is
/// materialized (at most one fresh fetch). Consecutive duplicate signals are
/// dropped.
pub(crate) struct Valve<Q, F: Fetcher<Q>> {
    query: Q,
    fetcher: Arc<F>,
    control: mpsc::UnboundedReceiver<Signal>,
    state: ValveState,
    upstream: Upstream<F::Item>,
    /// Last signal observed, for distinct-until-changed suppression.
    last_signal: Option<Signal>,
}

// No field is structurally pinned: the upstream future and stream are boxed
// and the rest is plain data.
impl<Q, F: Fetcher<Q>> Unpin for Valve<Q, F> {}

impl<Q, F> Valve<Q, F>
where
    Q: Clone + Debug + Send + 'static,
    F: Fetcher<Q>,
{
    /// Create a valve for `query` plus the sender half of its control
    /// channel.
    pub(crate) fn new(query: Q, fetcher: Arc<F>) -> (mpsc::UnboundedSender<Signal>, Self) {
        let (tx, control) = mpsc::unbounded_channel();
        (
            tx,
            Self {
                query,
                fetcher,
                control,
                state: ValveState::Disconnected,
                upstream: Upstream::Idle,
                last_signal: None,
            },
        )
    }

    #[cfg(test)]
    pub(crate) fn state(&self) -> ValveState {
        self.state
    }

    /// Drain queued signals; returns whether a fresh fetch is needed.
    fn drain_control(&mut self, cx: &mut Context<'_>) -> bool {
        let mut want_fresh = false;
        loop {
            match self.control.poll_recv(cx) {
                Poll::Ready(Some(signal)) => {
                    if self.last_signal == Some(signal) {
                        continue;
                    }
                    self.last_signal = Some(signal);
                    self.apply(signal, &mut want_fresh);
                }
                Poll::Ready(None) => {
                    // the dispatcher is gone; shut down
                    self.apply(Signal::Terminate, &mut want_fresh);
                    return want_fresh;
                }
                Poll::Pending => return want_fresh,
            }
        }
    }

    fn apply(&mut self, signal: Signal, want_fresh: &mut bool) {
        match (self.state, signal) {
            (ValveState::Terminated, _) => {}
            (ValveState::Active, Signal::On) => {}
            (ValveState::Disconnected | ValveState::Paused, Signal::On) => {
                debug!(query = ?self.query, "valve on");
                self.state = ValveState::Active;
                *want_fresh = true;
            }
            (ValveState::Active, Signal::Off) => {
                debug!(query = ?self.query, "valve off");
                self.state = ValveState::Paused;
                self.upstream = Upstream::Idle;
                *want_fresh = false;
            }
            (_, Signal::Off) => {}
            (_, Signal::Terminate) => {
                debug!(query = ?self.query, "valve terminated");
                self.state = ValveState::Terminated;
                self.upstream = Upstream::Idle;
                *want_fresh = false;
            }
        }
    }
}

impl<Q, F> Stream for Valve<Q, F>
where
    Q: Clone + Debug + Send + 'static,
    F: Fetcher<Q>,
{
    type Item = Event<Q, F::Item>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        loop {
            let want_fresh = this.drain_control(cx);
            match this.state {
                ValveState::Terminated => return Poll::Ready(None),
                ValveState::Disconnected | ValveState::Paused => return Poll::Pending,
                ValveState::Active => {}
            }

            if want_fresh {
                let fetcher = Arc::clone(&this.fetcher);
                let query = this.query.clone();
                this.upstream =
                    Upstream::Connecting(async move { fetcher.fetch(query).await }.boxed());
            }

            match &mut this.upstream {
                Upstream::Idle => return Poll::Pending,
                Upstream::Connecting(fut) => match fut.poll_unpin(cx) {
                    Poll::Ready(stream) => {
                        this.upstream = Upstream::Streaming(stream);
                    }
                    Poll::Pending => return Poll::Pending,
                },
                Upstream::Streaming(stream) => match stream.poll_next_unpin(cx) {
                    Poll::Ready(Some(Ok(items))) => {
                        return Poll::Ready(Some(Event::Data {
                            query: this.query.clone(),
                            items,
                        }));
                    }
                    Poll::Ready(Some(Err(error))) => {
                        debug!(query = ?this.query, %error, "upstream failed, terminating valve");
                        this.state = ValveState::Terminated;
                        this.upstream = Upstream::Idle;
                        return Poll::Ready(Some(Event::Failed {
                            query: this.query.clone(),
                            error,
                        }));
                    }
                    Poll::Ready(None) => {
                        debug!(query = ?this.query, "upstream ended");
                        this.upstream = Upstream::Idle;
                        return Poll::Pending;
                    }
                    Poll::Pending => return Poll::Pending,
                },
            }
        }
    }
}

impl<Q, F> Debug for Valve<Q, F>
where
    Q: Debug,
    F: Fetcher<Q>,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Valve")
            .field("query", &self.query)
            .field("state", &self.state)
            .field("upstream", &self.upstream)
            .finish_non_exhaustive()
    }
}
