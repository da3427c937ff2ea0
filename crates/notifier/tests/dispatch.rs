//! Delivery protocol tests with in-memory broker, store and cache.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use herald_common::error::AppError;
use herald_common::types::{
    Channel, NewNotification, NotificationMessage, NotificationStatus, UpdateNotification,
};
use herald_engine::memory::{InMemoryStatusCache, InMemoryStatusStore, RecordingPublisher};
use herald_engine::service::NotificationService;
use herald_notifier::delivery::{DeliverySource, Disposition, InboundMessage};
use herald_notifier::dispatch::{DispatchPolicy, Dispatcher};
use herald_notifier::retry::{RetryPublisher, WriteRetry};
use herald_notifier::sender::{Sender, SenderRegistry};
use herald_notifier::worker::{Notifier, PoolSpec};

// ============================================================
// Fakes
// ============================================================

#[derive(Default)]
struct FakeSender {
    fail: AtomicBool,
    sent: Mutex<Vec<(String, String)>>,
    /// Cancels this notification while the send is in flight.
    cancel_during_send: Mutex<Option<(NotificationService, i64)>>,
}

impl FakeSender {
    fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl Sender for FakeSender {
    async fn send(&self, recipient: &str, message: &str) -> Result<(), AppError> {
        let racing_cancel = self.cancel_during_send.lock().take();
        if let Some((service, id)) = racing_cancel {
            service
                .update_notification(&UpdateNotification::cancelled(id))
                .await?;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(AppError::Delivery("smtp down".to_string()));
        }
        self.sent
            .lock()
            .push((recipient.to_string(), message.to_string()));
        Ok(())
    }
}

#[derive(Default)]
struct FakeRetryPublisher {
    fail: AtomicBool,
    republished: Mutex<Vec<(Channel, Vec<u8>, u32, Duration)>>,
}

#[async_trait]
impl RetryPublisher for FakeRetryPublisher {
    async fn republish(
        &self,
        channel: Channel,
        body: &[u8],
        retry_count: u32,
        delay: Duration,
    ) -> Result<(), AppError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(AppError::Publish("broker unavailable".to_string()));
        }
        self.republished
            .lock()
            .push((channel, body.to_vec(), retry_count, delay));
        Ok(())
    }
}

struct FakeMessage {
    body: Vec<u8>,
    retry_count: u32,
    settled: Arc<Mutex<Vec<Disposition>>>,
}

#[async_trait]
impl InboundMessage for FakeMessage {
    fn body(&self) -> &[u8] {
        &self.body
    }

    fn retry_count(&self) -> u32 {
        self.retry_count
    }

    async fn settle(&self, disposition: Disposition) -> Result<(), AppError> {
        self.settled.lock().push(disposition);
        Ok(())
    }
}

/// Yields queued messages, then either closes or waits forever.
struct FakeSource {
    queue: Mutex<VecDeque<Box<dyn InboundMessage>>>,
    close_when_empty: bool,
}

#[async_trait]
impl DeliverySource for FakeSource {
    async fn next(&self) -> Option<Box<dyn InboundMessage>> {
        let next = self.queue.lock().pop_front();
        match next {
            Some(msg) => Some(msg),
            None if self.close_when_empty => None,
            None => std::future::pending().await,
        }
    }
}

// ============================================================
// Harness
// ============================================================

struct Harness {
    store: Arc<InMemoryStatusStore>,
    cache: Arc<InMemoryStatusCache>,
    service: NotificationService,
    sender: Arc<FakeSender>,
    retry: Arc<FakeRetryPublisher>,
    dispatcher: Arc<Dispatcher>,
}

fn policy() -> DispatchPolicy {
    DispatchPolicy {
        max_retries: 5,
        base_delay: Duration::from_secs(1),
        status_write: WriteRetry {
            attempts: 3,
            initial_delay: Duration::ZERO,
            factor: 2,
        },
    }
}

fn harness_with(registered: &[Channel]) -> Harness {
    let store = Arc::new(InMemoryStatusStore::new());
    let cache = Arc::new(InMemoryStatusCache::new());
    let service = NotificationService::new(
        store.clone(),
        cache.clone(),
        Arc::new(RecordingPublisher::new()),
    );
    let sender = Arc::new(FakeSender::default());
    let retry = Arc::new(FakeRetryPublisher::default());

    let mut registry = SenderRegistry::builder();
    for channel in registered {
        registry = registry.register(*channel, sender.clone());
    }

    let dispatcher = Arc::new(Dispatcher::new(
        registry.build(),
        Arc::new(service.clone()),
        retry.clone(),
        policy(),
    ));

    Harness {
        store,
        cache,
        service,
        sender,
        retry,
        dispatcher,
    }
}

fn harness() -> Harness {
    harness_with(&[Channel::Email, Channel::Telegram])
}

async fn create(h: &Harness, id: i64) -> i64 {
    h.store.set_next_id(id);
    let now = Utc::now();
    h.service
        .create_notification(NewNotification {
            channel: Channel::Email,
            recipient: "user@example.com".to_string(),
            message: "Standup in 5 minutes".to_string(),
            created_at: now,
            scheduled_at: now,
        })
        .await
        .unwrap()
}

fn body(id: i64) -> Vec<u8> {
    serde_json::to_vec(&NotificationMessage {
        id,
        recipient: "user@example.com".to_string(),
        message: "Standup in 5 minutes".to_string(),
    })
    .unwrap()
}

fn message(id: i64, retry_count: u32) -> FakeMessage {
    FakeMessage {
        body: body(id),
        retry_count,
        settled: Arc::default(),
    }
}

// ============================================================
// Short-circuit rejections
// ============================================================

#[tokio::test]
async fn test_unregistered_channel_is_rejected_without_requeue() {
    let h = harness_with(&[Channel::Email]);
    let id = create(&h, 1).await;

    let disposition = h.dispatcher.handle(Channel::Telegram, &message(id, 0)).await;

    assert_eq!(disposition, Disposition::Reject { requeue: false });
    assert!(h.sender.sent().is_empty());
    assert_eq!(h.store.get(id).unwrap().status, NotificationStatus::Scheduled);
}

#[tokio::test]
async fn test_malformed_payload_is_rejected_without_requeue() {
    let h = harness();
    let msg = FakeMessage {
        body: b"{\"id\": \"not-a-number\"}".to_vec(),
        retry_count: 0,
        settled: Arc::default(),
    };

    let disposition = h.dispatcher.handle(Channel::Email, &msg).await;

    assert_eq!(disposition, Disposition::Reject { requeue: false });
    assert!(h.sender.sent().is_empty());
}

#[tokio::test]
async fn test_status_lookup_failure_is_requeued() {
    let h = harness();
    let id = create(&h, 3).await;
    h.cache.fail_reads(true);
    h.store.fail_reads(true);

    let disposition = h.dispatcher.handle(Channel::Email, &message(id, 0)).await;

    assert_eq!(disposition, Disposition::Reject { requeue: true });
    assert!(h.sender.sent().is_empty());
}

#[tokio::test]
async fn test_unknown_notification_is_dropped() {
    let h = harness();

    let disposition = h.dispatcher.handle(Channel::Email, &message(999, 0)).await;

    assert_eq!(disposition, Disposition::Reject { requeue: false });
}

// ============================================================
// Cancellation
// ============================================================

#[tokio::test]
async fn test_cancelled_notification_is_acked_without_sending() {
    let h = harness();
    let id = create(&h, 42).await;
    h.service
        .update_notification(&UpdateNotification::cancelled(id))
        .await
        .unwrap();
    let writes_before = h.store.update_calls();

    let disposition = h.dispatcher.handle(Channel::Email, &message(42, 0)).await;

    assert_eq!(disposition, Disposition::Ack);
    assert!(h.sender.sent().is_empty());
    assert_eq!(h.store.update_calls(), writes_before);
    assert_eq!(h.store.get(42).unwrap().status, NotificationStatus::Cancelled);
}

#[tokio::test]
async fn test_cancel_during_send_wins() {
    let h = harness();
    let id = create(&h, 42).await;
    *h.sender.cancel_during_send.lock() = Some((h.service.clone(), id));

    let disposition = h.dispatcher.handle(Channel::Email, &message(42, 0)).await;

    assert_eq!(disposition, Disposition::Ack);
    let row = h.store.get(42).unwrap();
    assert_eq!(row.status, NotificationStatus::Cancelled);
    assert!(row.sent_at.is_none());
    assert_eq!(
        h.service.get_notification_status(42).await.unwrap(),
        NotificationStatus::Cancelled
    );
}

#[tokio::test]
async fn test_already_sent_redelivery_is_not_resent() {
    let h = harness();
    let id = create(&h, 5).await;
    h.service
        .update_notification(&UpdateNotification::sent(id, Utc::now()))
        .await
        .unwrap();

    let disposition = h.dispatcher.handle(Channel::Email, &message(id, 0)).await;

    assert_eq!(disposition, Disposition::Ack);
    assert!(h.sender.sent().is_empty());
}

// ============================================================
// Success
// ============================================================

#[tokio::test]
async fn test_successful_delivery_marks_sent() {
    let h = harness();
    let id = create(&h, 8).await;

    let disposition = h.dispatcher.handle(Channel::Email, &message(id, 0)).await;

    assert_eq!(disposition, Disposition::Ack);
    assert_eq!(
        h.sender.sent(),
        vec![(
            "user@example.com".to_string(),
            "Standup in 5 minutes".to_string()
        )]
    );
    let row = h.store.get(id).unwrap();
    assert_eq!(row.status, NotificationStatus::Sent);
    assert!(row.sent_at.is_some());
}

#[tokio::test]
async fn test_delivery_is_acked_even_if_sent_status_write_fails() {
    let h = harness();
    let id = create(&h, 9).await;
    h.store.fail_updates(true);

    let disposition = h.dispatcher.handle(Channel::Email, &message(id, 0)).await;

    assert_eq!(disposition, Disposition::Ack);
    assert_eq!(h.sender.sent().len(), 1);
    // bounded local retry: three attempts
    assert_eq!(h.store.update_calls(), 3);
}

// ============================================================
// Retry escalation
// ============================================================

#[tokio::test]
async fn test_send_failure_is_republished_with_backoff() {
    let h = harness();
    let id = create(&h, 11).await;
    h.sender.fail.store(true, Ordering::SeqCst);

    let disposition = h.dispatcher.handle(Channel::Email, &message(id, 2)).await;

    assert_eq!(disposition, Disposition::Ack);
    let republished = h.retry.republished.lock().clone();
    assert_eq!(republished.len(), 1);
    let (channel, republished_body, retry_count, delay) = &republished[0];
    assert_eq!(*channel, Channel::Email);
    assert_eq!(republished_body, &body(id));
    assert_eq!(*retry_count, 3);
    assert_eq!(*delay, Duration::from_secs(4));
    assert_eq!(h.store.get(id).unwrap().status, NotificationStatus::Scheduled);
}

#[tokio::test]
async fn test_first_failure_uses_base_delay() {
    let h = harness();
    let id = create(&h, 12).await;
    h.sender.fail.store(true, Ordering::SeqCst);

    h.dispatcher.handle(Channel::Email, &message(id, 0)).await;

    let republished = h.retry.republished.lock().clone();
    assert_eq!(republished[0].2, 1);
    assert_eq!(republished[0].3, Duration::from_secs(1));
}

#[tokio::test]
async fn test_exhausted_budget_marks_failed() {
    let h = harness();
    let id = create(&h, 13).await;
    h.sender.fail.store(true, Ordering::SeqCst);

    let disposition = h.dispatcher.handle(Channel::Email, &message(id, 5)).await;

    assert_eq!(disposition, Disposition::Ack);
    assert!(h.retry.republished.lock().is_empty());
    assert_eq!(h.store.get(id).unwrap().status, NotificationStatus::Failed);
}

#[tokio::test]
async fn test_republish_failure_is_requeued() {
    let h = harness();
    let id = create(&h, 14).await;
    h.sender.fail.store(true, Ordering::SeqCst);
    h.retry.fail.store(true, Ordering::SeqCst);

    let disposition = h.dispatcher.handle(Channel::Email, &message(id, 1)).await;

    assert_eq!(disposition, Disposition::Reject { requeue: true });
    assert_eq!(h.store.get(id).unwrap().status, NotificationStatus::Scheduled);
}

// ============================================================
// Worker pools
// ============================================================

#[tokio::test]
async fn test_pool_drains_source_and_settles_every_message() {
    let h = harness();
    let settled: Arc<Mutex<Vec<Disposition>>> = Arc::default();
    let mut queue: VecDeque<Box<dyn InboundMessage>> = VecDeque::new();
    for n in 0..4 {
        let id = create(&h, 100 + n).await;
        queue.push_back(Box::new(FakeMessage {
            body: body(id),
            retry_count: 0,
            settled: settled.clone(),
        }));
    }
    queue.push_back(Box::new(FakeMessage {
        body: b"garbage".to_vec(),
        retry_count: 0,
        settled: settled.clone(),
    }));

    let source = Arc::new(FakeSource {
        queue: Mutex::new(queue),
        close_when_empty: true,
    });
    let notifier = Notifier::new(
        h.dispatcher.clone(),
        vec![PoolSpec {
            channel: Channel::Email,
            queue: "notifications.email".to_string(),
            workers: 3,
            source,
        }],
    );

    tokio::time::timeout(
        Duration::from_secs(5),
        notifier.start(CancellationToken::new()),
    )
    .await
    .unwrap()
    .unwrap();

    let settled = settled.lock().clone();
    assert_eq!(settled.len(), 5);
    assert_eq!(
        settled.iter().filter(|d| **d == Disposition::Ack).count(),
        4
    );
    assert_eq!(h.sender.sent().len(), 4);
    for n in 0..4 {
        assert_eq!(
            h.store.get(100 + n).unwrap().status,
            NotificationStatus::Sent
        );
    }
}

#[tokio::test]
async fn test_cancellation_stops_idle_pools() {
    let h = harness();
    let pools = [Channel::Email, Channel::Telegram]
        .into_iter()
        .map(|channel| PoolSpec {
            channel,
            queue: format!("notifications.{}", channel),
            workers: 2,
            source: Arc::new(FakeSource {
                queue: Mutex::new(VecDeque::new()),
                close_when_empty: false,
            }),
        })
        .collect();

    let cancel = CancellationToken::new();
    let handle = Notifier::new(h.dispatcher.clone(), pools).start(cancel.clone());

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!handle.is_finished());

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();
}
