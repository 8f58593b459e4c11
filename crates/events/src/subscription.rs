//! Live change subscriptions.
//!
//! A subscription is a lazy, in-order, potentially infinite sequence of
//! [`ChangeEvent`]s. Backends hold the producing half ([`SubscriptionFeed`]);
//! consumers hold [`ChangeSubscription`] and either pull with
//! [`ChangeSubscription::next_event`] or register a callback with
//! [`ChangeSubscription::on_event`].
//!
//! ## Closing
//!
//! Closing is explicit and idempotent. Any clone of the
//! [`SubscriptionHandle`] can close the subscription, including from inside a
//! callback or from another task. Once closed:
//!
//! - no further event is handed to the consumer
//! - `next_event` returns [`ChangewatchError::SubscriptionClosed`]
//! - the producing side observes `is_closed()` and releases its resources
//!
//! Dropping a `ChangeSubscription` closes it.
//!
//! ## Failure
//!
//! A feed error (e.g. the connection dropped mid-stream) is terminal: it is
//! returned once and the subscription is closed. There is no reconnect.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::debug;

use changewatch_core::{ChangewatchError, ChangewatchResult, Namespace, SubscriptionId};

use crate::event::{ChangeEvent, OperationKind};

/// Item pushed by a backend: an event, or a terminal error.
pub type FeedItem = ChangewatchResult<ChangeEvent>;

/// Cloneable close handle shared by the consumer, its listeners and the backend.
#[derive(Debug, Clone)]
pub struct SubscriptionHandle {
    id: SubscriptionId,
    closed: Arc<watch::Sender<bool>>,
}

impl SubscriptionHandle {
    fn new(id: SubscriptionId) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            id,
            closed: Arc::new(closed),
        }
    }

    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Close the subscription. Returns `true` only for the call that closed it.
    pub fn close(&self) -> bool {
        let changed = self.closed.send_if_modified(|closed| {
            if *closed {
                false
            } else {
                *closed = true;
                true
            }
        });
        if changed {
            debug!(subscription_id = %self.id, "subscription closed");
        }
        changed
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Resolves once the subscription is closed (immediately if it already is).
    pub async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        loop {
            let closed = *rx.borrow_and_update();
            if closed {
                return;
            }
            // The sender lives as long as `self`, so this cannot fail while we wait.
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Producing half, owned by a backend.
#[derive(Debug, Clone)]
pub struct SubscriptionFeed {
    sender: mpsc::UnboundedSender<FeedItem>,
    handle: SubscriptionHandle,
}

impl SubscriptionFeed {
    /// Push an event. Returns `false` once the subscription is closed or the
    /// consumer went away; the backend should then stop feeding it.
    pub fn push(&self, event: ChangeEvent) -> bool {
        !self.handle.is_closed() && self.sender.send(Ok(event)).is_ok()
    }

    /// Push a terminal error. Nothing pushed afterwards is delivered.
    pub fn fail(&self, error: ChangewatchError) -> bool {
        !self.handle.is_closed() && self.sender.send(Err(error)).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.handle.is_closed() || self.sender.is_closed()
    }

    /// Resolves once the consumer closes or drops the subscription.
    pub async fn closed(&self) {
        tokio::select! {
            _ = self.handle.closed() => {}
            _ = self.sender.closed() => {}
        }
    }

    pub fn handle(&self) -> &SubscriptionHandle {
        &self.handle
    }
}

/// Consuming half of a change subscription on one collection.
#[derive(Debug)]
pub struct ChangeSubscription {
    namespace: Namespace,
    receiver: mpsc::UnboundedReceiver<FeedItem>,
    handle: SubscriptionHandle,
    /// Set after an `invalidate` event; the next pull closes the subscription.
    invalidated: bool,
}

impl ChangeSubscription {
    /// Create a connected feed/subscription pair.
    pub fn channel(namespace: Namespace) -> (SubscriptionFeed, ChangeSubscription) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let handle = SubscriptionHandle::new(SubscriptionId::new());
        let feed = SubscriptionFeed {
            sender,
            handle: handle.clone(),
        };
        let subscription = ChangeSubscription {
            namespace,
            receiver,
            handle,
            invalidated: false,
        };
        (feed, subscription)
    }

    pub fn id(&self) -> SubscriptionId {
        self.handle.id()
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    /// A cloneable handle that can close this subscription from elsewhere.
    pub fn handle(&self) -> SubscriptionHandle {
        self.handle.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.handle.is_closed()
    }

    /// Wait for the next delivered event.
    ///
    /// Errors:
    /// - `SubscriptionClosed` once the subscription is closed (by anyone)
    /// - `Connection` (or any backend error) once, when the feed fails; the
    ///   subscription is closed afterwards
    pub async fn next_event(&mut self) -> ChangewatchResult<ChangeEvent> {
        if self.invalidated {
            self.close();
        }
        if self.handle.is_closed() {
            return Err(ChangewatchError::SubscriptionClosed);
        }

        let item = tokio::select! {
            biased;
            _ = self.handle.closed() => return Err(ChangewatchError::SubscriptionClosed),
            item = self.receiver.recv() => item,
        };

        match item {
            Some(Ok(event)) => {
                if event.operation_kind() == Some(OperationKind::Invalidate) {
                    self.invalidated = true;
                }
                Ok(event)
            }
            Some(Err(error)) => {
                self.close();
                Err(error)
            }
            None => {
                let was_open = self.close();
                if was_open {
                    Err(ChangewatchError::connection("change feed ended unexpectedly"))
                } else {
                    Err(ChangewatchError::SubscriptionClosed)
                }
            }
        }
    }

    /// Close the subscription and release the feed. Idempotent.
    ///
    /// Returns `true` only for the call that closed it.
    pub fn close(&mut self) -> bool {
        let changed = self.handle.close();
        self.receiver.close();
        changed
    }
}

impl Drop for ChangeSubscription {
    fn drop(&mut self) {
        self.handle.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::ResumeToken;

    fn ns() -> Namespace {
        Namespace::new("superheroesdb", "superheroes").unwrap()
    }

    fn event(seq: u64, kind: OperationKind) -> ChangeEvent {
        ChangeEvent::builder(kind, ResumeToken::from_sequence(seq)).build()
    }

    #[tokio::test]
    async fn delivers_in_push_order() {
        let (feed, mut sub) = ChangeSubscription::channel(ns());
        for seq in 1..=3 {
            assert!(feed.push(event(seq, OperationKind::Insert)));
        }
        for seq in 1..=3 {
            let got = sub.next_event().await.unwrap();
            assert_eq!(got.resume_token().and_then(|t| t.sequence()), Some(seq));
        }
    }

    #[tokio::test]
    async fn close_is_idempotent_and_stops_delivery() {
        let (feed, mut sub) = ChangeSubscription::channel(ns());
        feed.push(event(1, OperationKind::Insert));

        assert!(sub.close());
        assert!(!sub.close());
        assert!(!sub.handle().close());

        assert_eq!(sub.next_event().await, Err(ChangewatchError::SubscriptionClosed));
        assert!(feed.is_closed());
        assert!(!feed.push(event(2, OperationKind::Insert)));
    }

    #[tokio::test]
    async fn close_from_another_task_wakes_a_pending_pull() {
        let (_feed, mut sub) = ChangeSubscription::channel(ns());
        let handle = sub.handle();

        let closer = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            handle.close();
        });

        assert_eq!(sub.next_event().await, Err(ChangewatchError::SubscriptionClosed));
        closer.await.unwrap();
    }

    #[tokio::test]
    async fn feed_errors_are_terminal() {
        let (feed, mut sub) = ChangeSubscription::channel(ns());
        feed.fail(ChangewatchError::connection("socket reset"));
        feed.push(event(1, OperationKind::Insert));

        assert_eq!(
            sub.next_event().await,
            Err(ChangewatchError::connection("socket reset"))
        );
        assert!(sub.is_closed());
        assert_eq!(sub.next_event().await, Err(ChangewatchError::SubscriptionClosed));
    }

    #[tokio::test]
    async fn dropped_feed_surfaces_a_connection_error() {
        let (feed, mut sub) = ChangeSubscription::channel(ns());
        drop(feed);
        assert!(matches!(sub.next_event().await, Err(ChangewatchError::Connection(_))));
        assert_eq!(sub.next_event().await, Err(ChangewatchError::SubscriptionClosed));
    }

    #[tokio::test]
    async fn invalidate_is_delivered_then_the_subscription_ends() {
        let (feed, mut sub) = ChangeSubscription::channel(ns());
        feed.push(event(1, OperationKind::Drop));
        feed.push(event(2, OperationKind::Invalidate));

        assert_eq!(sub.next_event().await.unwrap().operation_kind(), Some(OperationKind::Drop));
        assert_eq!(
            sub.next_event().await.unwrap().operation_kind(),
            Some(OperationKind::Invalidate)
        );
        assert_eq!(sub.next_event().await, Err(ChangewatchError::SubscriptionClosed));
    }

    #[tokio::test]
    async fn dropping_the_subscription_closes_the_feed() {
        let (feed, sub) = ChangeSubscription::channel(ns());
        drop(sub);
        assert!(feed.is_closed());
        feed.closed().await;
    }
}
