//! Callback delivery on top of the pull-based subscription.

use std::ops::ControlFlow;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use changewatch_core::{ChangewatchError, SubscriptionId};

use crate::event::ChangeEvent;
use crate::subscription::{ChangeSubscription, SubscriptionHandle};

/// Why a listener stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerExit {
    /// The subscription was closed (by a handle, or after `invalidate`).
    Closed,
    /// The callback returned `ControlFlow::Break`.
    Stopped,
    /// The feed failed; the error was passed to the error handler.
    Failed(ChangewatchError),
}

/// Outcome of a finished listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerSummary {
    pub subscription_id: SubscriptionId,
    pub delivered: u64,
    pub exit: ListenerExit,
}

/// Handle to a spawned listener task.
#[derive(Debug)]
pub struct ListenerHandle {
    subscription: SubscriptionHandle,
    join: JoinHandle<ListenerSummary>,
}

impl ListenerHandle {
    pub fn subscription(&self) -> &SubscriptionHandle {
        &self.subscription
    }

    /// Close the underlying subscription. Idempotent.
    pub fn close(&self) -> bool {
        self.subscription.close()
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Wait for the listener to stop.
    pub async fn join(self) -> ListenerSummary {
        let subscription_id = self.subscription.id();
        match self.join.await {
            Ok(summary) => summary,
            Err(err) => {
                warn!(%subscription_id, error = %err, "listener task aborted");
                ListenerSummary {
                    subscription_id,
                    delivered: 0,
                    exit: ListenerExit::Failed(ChangewatchError::connection(format!(
                        "listener task aborted: {err}"
                    ))),
                }
            }
        }
    }
}

impl ChangeSubscription {
    /// Register a consumer invoked once per delivered event, in arrival order.
    ///
    /// The listener runs as a task on the current tokio runtime. The callback
    /// returns `ControlFlow::Break(())` to close the subscription (e.g. after a
    /// fixed number of events, see [`StopAfter`]). A terminal feed error is
    /// handed to `on_error` and ends the listener; nothing is retried.
    pub fn on_event<F, E>(self, mut on_event: F, mut on_error: E) -> ListenerHandle
    where
        F: FnMut(&ChangeEvent) -> ControlFlow<()> + Send + 'static,
        E: FnMut(ChangewatchError) + Send + 'static,
    {
        let handle = self.handle();
        let mut subscription = self;

        let join = tokio::spawn(async move {
            let subscription_id = subscription.id();
            let mut delivered = 0u64;

            let exit = loop {
                match subscription.next_event().await {
                    Ok(event) => {
                        // A close that raced the receive wins: nothing is delivered after close.
                        if subscription.is_closed() {
                            break ListenerExit::Closed;
                        }
                        delivered += 1;
                        if on_event(&event).is_break() {
                            subscription.close();
                            break ListenerExit::Stopped;
                        }
                    }
                    Err(ChangewatchError::SubscriptionClosed) => break ListenerExit::Closed,
                    Err(err) => {
                        warn!(%subscription_id, error = %err, "change subscription failed");
                        on_error(err.clone());
                        break ListenerExit::Failed(err);
                    }
                }
            };

            debug!(%subscription_id, delivered, exit = ?exit, "listener finished");
            ListenerSummary {
                subscription_id,
                delivered,
                exit,
            }
        });

        ListenerHandle {
            subscription: handle,
            join,
        }
    }
}

/// Stopping policy: break after a fixed number of events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopAfter {
    limit: u64,
    seen: u64,
}

impl StopAfter {
    pub fn new(limit: u64) -> Self {
        Self { limit, seen: 0 }
    }

    /// Count one event; breaks once the limit is reached.
    pub fn observe(&mut self) -> ControlFlow<()> {
        self.seen += 1;
        if self.seen >= self.limit {
            ControlFlow::Break(())
        } else {
            ControlFlow::Continue(())
        }
    }

    pub fn seen(&self) -> u64 {
        self.seen
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;

    use changewatch_core::Namespace;

    use crate::event::{OperationKind, ResumeToken};

    fn ns() -> Namespace {
        Namespace::new("superheroesdb", "superheroes").unwrap()
    }

    fn event(seq: u64) -> ChangeEvent {
        ChangeEvent::builder(OperationKind::Insert, ResumeToken::from_sequence(seq)).build()
    }

    #[test]
    fn stop_after_breaks_on_the_limit() {
        let mut stop = StopAfter::new(2);
        assert!(stop.observe().is_continue());
        assert!(stop.observe().is_break());
        assert_eq!(stop.seen(), 2);
    }

    #[tokio::test]
    async fn callback_sees_events_in_order_and_can_stop() {
        let (feed, sub) = ChangeSubscription::channel(ns());
        for seq in 1..=5 {
            feed.push(event(seq));
        }

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let mut stop = StopAfter::new(3);
        let listener = sub.on_event(
            move |e| {
                sink.lock()
                    .unwrap()
                    .push(e.resume_token().and_then(|t| t.sequence()).unwrap_or_default());
                stop.observe()
            },
            |_| {},
        );

        let summary = listener.join().await;
        assert_eq!(summary.exit, ListenerExit::Stopped);
        assert_eq!(summary.delivered, 3);
        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);
        assert!(feed.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn no_callbacks_after_close() {
        let (feed, sub) = ChangeSubscription::channel(ns());
        let count = Arc::new(AtomicU64::new(0));
        let counter = count.clone();
        let listener = sub.on_event(
            move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                ControlFlow::Continue(())
            },
            |_| {},
        );

        feed.push(event(1));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        assert!(listener.close());
        let before = count.load(Ordering::SeqCst);
        for seq in 2..10 {
            feed.push(event(seq));
        }
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(count.load(Ordering::SeqCst), before);

        let summary = listener.join().await;
        assert_eq!(summary.exit, ListenerExit::Closed);
        assert_eq!(summary.delivered, 1);
    }

    #[tokio::test]
    async fn feed_failure_reaches_the_error_handler_once() {
        let (feed, sub) = ChangeSubscription::channel(ns());
        let errors = Arc::new(AtomicU64::new(0));
        let error_count = errors.clone();
        let listener = sub.on_event(
            |_| ControlFlow::Continue(()),
            move |err| {
                assert!(matches!(err, ChangewatchError::Connection(_)));
                error_count.fetch_add(1, Ordering::SeqCst);
            },
        );

        feed.push(event(1));
        feed.fail(ChangewatchError::connection("connection reset by peer"));

        let summary = listener.join().await;
        assert_eq!(summary.delivered, 1);
        assert!(matches!(summary.exit, ListenerExit::Failed(ChangewatchError::Connection(_))));
        assert_eq!(errors.load(Ordering::SeqCst), 1);
    }
}
