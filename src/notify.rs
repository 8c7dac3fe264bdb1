//! Notification boundary between the scheduling core and delivery.
//!
//! The engine only ever calls [`NotificationGateway::enqueue`]. Everything
//! behind it (in-app fan-out, email with retries) runs on its own task and
//! can fail without touching booking state.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::model::{NotificationEvent, UserId};
use crate::observability;

const CHANNEL_CAPACITY: usize = 256;

/// Fire-and-forget sink for notifications produced by the engine.
pub trait NotificationGateway: Send + Sync {
    fn enqueue(&self, event: NotificationEvent);
}

/// Broadcast hub for in-app notifications, one channel per user.
pub struct NotifyHub {
    channels: DashMap<UserId, broadcast::Sender<NotificationEvent>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to a user's notifications. Creates the channel if needed.
    pub fn subscribe(&self, user_id: UserId) -> broadcast::Receiver<NotificationEvent> {
        let sender = self
            .channels
            .entry(user_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Send to the target user's channel. Returns false if nobody is listening.
    pub fn send(&self, event: &NotificationEvent) -> bool {
        match self.channels.get(&event.target_user_id) {
            Some(sender) => sender.send(event.clone()).is_ok(),
            None => false,
        }
    }

    /// Subscription that releases the user's channel when dropped.
    pub fn listen(self: &Arc<Self>, user_id: UserId) -> Subscription {
        Subscription {
            rx: Some(self.subscribe(user_id)),
            hub: self.clone(),
            user_id,
        }
    }

    /// Drop a user's channel once its last receiver is gone.
    pub fn prune(&self, user_id: &UserId) {
        self.channels.remove_if(user_id, |_, sender| sender.receiver_count() == 0);
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}

/// One live in-app feed for a user, e.g. an open event stream.
pub struct Subscription {
    rx: Option<broadcast::Receiver<NotificationEvent>>,
    hub: Arc<NotifyHub>,
    user_id: UserId,
}

impl Subscription {
    /// Next notification, skipping over any the receiver fell behind on.
    /// `None` once the hub drops the channel.
    pub async fn recv(&mut self) -> Option<NotificationEvent> {
        let rx = self.rx.as_mut()?;
        loop {
            match rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(
                        user = %self.user_id,
                        skipped,
                        "in-app listener lagged, notifications skipped"
                    );
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        drop(self.rx.take());
        self.hub.prune(&self.user_id);
    }
}

// ── Queue ────────────────────────────────────────────────────────

/// Gateway backed by an unbounded channel drained by a [`Dispatcher`].
#[derive(Clone)]
pub struct NotificationQueue {
    tx: mpsc::UnboundedSender<NotificationEvent>,
}

impl NotificationQueue {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<NotificationEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl NotificationGateway for NotificationQueue {
    fn enqueue(&self, event: NotificationEvent) {
        if let Err(e) = self.tx.send(event) {
            warn!(
                booking = %e.0.related_booking_id,
                "notification dispatcher gone, dropping notification"
            );
            metrics::counter!(observability::NOTIFICATIONS_DROPPED_TOTAL).increment(1);
        }
    }
}

// ── Delivery ─────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("transport unavailable: {0}")]
    Transport(String),
    #[error("recipient {0} has no deliverable address")]
    NoAddress(UserId),
}

/// Out-of-band transport (email, SMS) for notifications.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, event: &NotificationEvent) -> Result<(), DeliveryError>;
}

/// Transport that only writes the message to the log.
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, event: &NotificationEvent) -> Result<(), DeliveryError> {
        info!(
            to = %event.target_user_id,
            booking = %event.related_booking_id,
            subject = %event.title,
            "{}",
            event.message
        );
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(200),
        }
    }
}

impl RetryPolicy {
    /// Exponential backoff, doubling from `base_delay`, capped at 2^10.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay * 2u32.pow(attempt.saturating_sub(1).min(10))
    }
}

/// Drains the queue: in-app fan-out first, then the mailer with retries.
pub struct Dispatcher {
    hub: Arc<NotifyHub>,
    mailer: Arc<dyn Mailer>,
    retry: RetryPolicy,
}

impl Dispatcher {
    pub fn new(hub: Arc<NotifyHub>, mailer: Arc<dyn Mailer>, retry: RetryPolicy) -> Self {
        Self { hub, mailer, retry }
    }

    /// Runs until every queue handle is dropped.
    pub async fn run(self, mut rx: mpsc::UnboundedReceiver<NotificationEvent>) {
        while let Some(event) = rx.recv().await {
            if !self.hub.send(&event) {
                debug!(user = %event.target_user_id, "no in-app listener");
            }
            let mailer = self.mailer.clone();
            let retry = self.retry;
            tokio::spawn(async move {
                deliver_with_retry(mailer.as_ref(), &event, retry).await;
            });
        }
        debug!("notification queue closed, dispatcher exiting");
    }
}

/// Returns true once the mailer accepts the event.
pub async fn deliver_with_retry(
    mailer: &dyn Mailer,
    event: &NotificationEvent,
    retry: RetryPolicy,
) -> bool {
    for attempt in 1..=retry.max_attempts {
        match mailer.send(event).await {
            Ok(()) => {
                metrics::counter!(observability::NOTIFICATIONS_DELIVERED_TOTAL).increment(1);
                return true;
            }
            Err(e) => {
                metrics::counter!(observability::NOTIFICATION_DELIVERY_FAILURES_TOTAL).increment(1);
                warn!(
                    attempt,
                    max_attempts = retry.max_attempts,
                    booking = %event.related_booking_id,
                    "notification delivery failed: {e}"
                );
                if matches!(e, DeliveryError::NoAddress(_)) {
                    break;
                }
                if attempt < retry.max_attempts {
                    tokio::time::sleep(retry.delay_for(attempt)).await;
                }
            }
        }
    }
    metrics::counter!(observability::NOTIFICATIONS_DROPPED_TOTAL).increment(1);
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use ulid::Ulid;

    use crate::model::{BookingStatus, NotificationKind};

    fn event_for(user: UserId) -> NotificationEvent {
        NotificationEvent {
            target_user_id: user,
            kind: NotificationKind::StatusChanged(BookingStatus::Confirmed),
            title: "Booking Confirmed".into(),
            message: "Your booking has been Confirmed.".into(),
            related_booking_id: Ulid::new(),
        }
    }

    /// Fails the first `fail_first` sends, then succeeds.
    struct FlakyMailer {
        fail_first: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl Mailer for FlakyMailer {
        async fn send(&self, _event: &NotificationEvent) -> Result<(), DeliveryError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                Err(DeliveryError::Transport("smtp down".into()))
            } else {
                Ok(())
            }
        }
    }

    fn fast_retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn subscribe_and_receive() {
        let hub = NotifyHub::new();
        let user = Ulid::new();
        let mut rx = hub.subscribe(user);

        let event = event_for(user);
        hub.send(&event);

        let received = rx.recv().await.unwrap();
        assert_eq!(received, event);
    }

    #[tokio::test]
    async fn send_without_subscribers_is_noop() {
        let hub = NotifyHub::new();
        assert!(!hub.send(&event_for(Ulid::new())));
        assert_eq!(hub.channel_count(), 0);
    }

    #[tokio::test]
    async fn dropped_subscription_releases_channel() {
        let hub = Arc::new(NotifyHub::new());
        let user = Ulid::new();
        let mut first = hub.listen(user);
        let second = hub.listen(user);

        let event = event_for(user);
        assert!(hub.send(&event));
        assert_eq!(first.recv().await, Some(event));

        drop(second);
        assert_eq!(hub.channel_count(), 1);
        drop(first);
        assert_eq!(hub.channel_count(), 0);
        assert!(!hub.send(&event_for(user)));
    }

    #[tokio::test]
    async fn other_users_do_not_see_event() {
        let hub = NotifyHub::new();
        let alice = Ulid::new();
        let bob = Ulid::new();
        let mut bob_rx = hub.subscribe(bob);
        let _alice_rx = hub.subscribe(alice);

        hub.send(&event_for(alice));
        assert!(bob_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn retry_until_transport_recovers() {
        let mailer = FlakyMailer {
            fail_first: 2,
            calls: AtomicU32::new(0),
        };
        let delivered = deliver_with_retry(&mailer, &event_for(Ulid::new()), fast_retry(5)).await;
        assert!(delivered);
        assert_eq!(mailer.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_gives_up_after_max_attempts() {
        let mailer = FlakyMailer {
            fail_first: u32::MAX,
            calls: AtomicU32::new(0),
        };
        let delivered = deliver_with_retry(&mailer, &event_for(Ulid::new()), fast_retry(3)).await;
        assert!(!delivered);
        assert_eq!(mailer.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn backoff_doubles() {
        let retry = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
        };
        assert_eq!(retry.delay_for(1), Duration::from_millis(100));
        assert_eq!(retry.delay_for(2), Duration::from_millis(200));
        assert_eq!(retry.delay_for(4), Duration::from_millis(800));
    }

    #[tokio::test]
    async fn dispatcher_fans_out_to_hub() {
        let hub = Arc::new(NotifyHub::new());
        let user = Ulid::new();
        let mut rx = hub.subscribe(user);

        let (queue, queue_rx) = NotificationQueue::channel();
        let dispatcher = Dispatcher::new(hub.clone(), Arc::new(LogMailer), fast_retry(1));
        let handle = tokio::spawn(dispatcher.run(queue_rx));

        let event = event_for(user);
        queue.enqueue(event.clone());
        assert_eq!(rx.recv().await.unwrap(), event);

        drop(queue);
        handle.await.unwrap();
    }

    #[test]
    fn enqueue_after_dispatcher_gone_does_not_panic() {
        let (queue, rx) = NotificationQueue::channel();
        drop(rx);
        queue.enqueue(event_for(Ulid::new()));
    }
}
