//! In-process publish/subscribe channel for upload progress and status changes.
//!
//! Every subscriber owns a bounded queue. Publishing never blocks: when a
//! queue is full, progress events are evicted (oldest first, same image
//! first) while status events are always enqueued.

use crate::record::ImageStatus;
use futures::stream::{self, Stream};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::Notify;
use tracing::trace;
use uuid::Uuid;

/// Event published by the upload coordinator
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind")]
pub enum BusEvent {
    /// Fraction of the payload sent, in `[0, 1]`
    Progress { id: Uuid, value: f32 },
    /// Persisted status changed
    StatusChanged { id: Uuid, status: ImageStatus },
}

impl BusEvent {
    pub fn id(&self) -> Uuid {
        match self {
            BusEvent::Progress { id, .. } | BusEvent::StatusChanged { id, .. } => *id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            BusEvent::Progress { .. } => "Progress",
            BusEvent::StatusChanged { .. } => "StatusChanged",
        }
    }

    fn is_progress(&self) -> bool {
        matches!(self, BusEvent::Progress { .. })
    }
}

struct SubscriberQueue {
    events: Mutex<VecDeque<BusEvent>>,
    notify: Notify,
    closed: AtomicBool,
    dropped_progress: AtomicU64,
}

impl SubscriberQueue {
    fn new() -> Self {
        Self {
            events: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            dropped_progress: AtomicU64::new(0),
        }
    }

    fn push(&self, event: BusEvent, capacity: usize) {
        {
            let mut events = self.events.lock();

            if event.is_progress() && events.len() >= capacity {
                let id = event.id();
                let victim = events
                    .iter()
                    .position(|e| e.is_progress() && e.id() == id)
                    .or_else(|| events.iter().position(BusEvent::is_progress));

                self.dropped_progress.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("uploader.bus.progress_dropped").increment(1);

                match victim {
                    Some(index) => {
                        events.remove(index);
                    }
                    // Only status events buffered; drop the incoming progress
                    None => return,
                }
            }

            events.push_back(event);
        }

        self.notify.notify_one();
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_one();
    }
}

struct BusInner {
    capacity: usize,
    subscribers: Mutex<Vec<Weak<SubscriberQueue>>>,
}

impl Drop for BusInner {
    fn drop(&mut self) {
        for queue in self.subscribers.get_mut().iter().filter_map(Weak::upgrade) {
            queue.close();
        }
    }
}

/// Multi-producer, multi-consumer event bus
#[derive(Clone)]
pub struct ProgressBus {
    inner: Arc<BusInner>,
}

impl ProgressBus {
    /// Create a bus whose subscribers buffer up to `capacity` events
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(BusInner {
                capacity: capacity.max(1),
                subscribers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Attach a new subscriber; it only sees events published from now on
    pub fn subscribe(&self) -> Subscription {
        let queue = Arc::new(SubscriberQueue::new());
        self.inner.subscribers.lock().push(Arc::downgrade(&queue));
        Subscription { queue }
    }

    pub fn publish(&self, event: BusEvent) {
        let mut subscribers = self.inner.subscribers.lock();
        subscribers.retain(|weak| match weak.upgrade() {
            Some(queue) => {
                queue.push(event.clone(), self.inner.capacity);
                true
            }
            None => false,
        });
        trace!(
            id = %event.id(),
            kind = event.kind(),
            subscribers = subscribers.len(),
            "Published bus event"
        );
    }

    pub fn publish_progress(&self, id: Uuid, value: f32) {
        self.publish(BusEvent::Progress { id, value });
    }

    pub fn publish_status(&self, id: Uuid, status: ImageStatus) {
        self.publish(BusEvent::StatusChanged { id, status });
    }

    pub fn subscriber_count(&self) -> usize {
        let mut subscribers = self.inner.subscribers.lock();
        subscribers.retain(|weak| weak.strong_count() > 0);
        subscribers.len()
    }
}

/// Receiving end of a bus subscription; dropping it unsubscribes
pub struct Subscription {
    queue: Arc<SubscriberQueue>,
}

impl Subscription {
    /// Wait for the next event. Returns `None` once the bus is gone and the
    /// buffer is drained.
    pub async fn recv(&mut self) -> Option<BusEvent> {
        loop {
            let next = self.queue.events.lock().pop_front();
            if let Some(event) = next {
                return Some(event);
            }
            if self.queue.closed.load(Ordering::Acquire) {
                return self.queue.events.lock().pop_front();
            }
            self.queue.notify.notified().await;
        }
    }

    pub fn try_recv(&mut self) -> Option<BusEvent> {
        self.queue.events.lock().pop_front()
    }

    /// Progress events this subscriber lost to a full buffer
    pub fn dropped_progress(&self) -> u64 {
        self.queue.dropped_progress.load(Ordering::Relaxed)
    }

    pub fn into_stream(self) -> impl Stream<Item = BusEvent> + Send + 'static {
        stream::unfold(self, |mut subscription| async move {
            subscription.recv().await.map(|event| (event, subscription))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn drain(subscription: &mut Subscription) -> Vec<BusEvent> {
        std::iter::from_fn(|| subscription.try_recv()).collect()
    }

    #[tokio::test]
    async fn test_every_subscriber_receives_events() {
        let bus = ProgressBus::new(16);
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();
        let id = Uuid::new_v4();

        bus.publish_progress(id, 0.5);
        bus.publish_status(id, ImageStatus::Completed);

        for subscription in [&mut first, &mut second] {
            assert_eq!(
                subscription.recv().await,
                Some(BusEvent::Progress { id, value: 0.5 })
            );
            assert_eq!(
                subscription.recv().await,
                Some(BusEvent::StatusChanged {
                    id,
                    status: ImageStatus::Completed
                })
            );
        }
    }

    #[test]
    fn test_late_subscriber_misses_earlier_events() {
        let bus = ProgressBus::new(16);
        bus.publish_status(Uuid::new_v4(), ImageStatus::Uploading);

        let mut late = bus.subscribe();
        assert!(late.try_recv().is_none());
    }

    #[test]
    fn test_full_buffer_evicts_oldest_progress_for_same_id() {
        let bus = ProgressBus::new(3);
        let mut subscription = bus.subscribe();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        bus.publish_progress(a, 0.1);
        bus.publish_progress(b, 0.1);
        bus.publish_progress(a, 0.2);
        bus.publish_progress(a, 0.3);

        assert_eq!(
            drain(&mut subscription),
            vec![
                BusEvent::Progress { id: b, value: 0.1 },
                BusEvent::Progress { id: a, value: 0.2 },
                BusEvent::Progress { id: a, value: 0.3 },
            ]
        );
        assert_eq!(subscription.dropped_progress(), 1);
    }

    #[test]
    fn test_status_events_never_dropped() {
        let bus = ProgressBus::new(2);
        let mut subscription = bus.subscribe();
        let id = Uuid::new_v4();

        bus.publish_status(id, ImageStatus::Uploading);
        bus.publish_status(id, ImageStatus::Failed);
        // Only status events buffered; the incoming progress event is the one lost
        bus.publish_progress(id, 0.1);
        bus.publish_status(id, ImageStatus::Uploading);
        bus.publish_status(id, ImageStatus::Completed);

        let status = |status| BusEvent::StatusChanged { id, status };
        assert_eq!(
            drain(&mut subscription),
            vec![
                status(ImageStatus::Uploading),
                status(ImageStatus::Failed),
                status(ImageStatus::Uploading),
                status(ImageStatus::Completed),
            ]
        );
        assert_eq!(subscription.dropped_progress(), 1);
    }

    #[tokio::test]
    async fn test_recv_waits_for_publish() {
        let bus = ProgressBus::new(4);
        let mut subscription = bus.subscribe();
        let id = Uuid::new_v4();

        let publisher = bus.clone();
        let handle = tokio::spawn(async move {
            tokio::task::yield_now().await;
            publisher.publish_status(id, ImageStatus::Uploading);
        });

        assert_eq!(
            subscription.recv().await,
            Some(BusEvent::StatusChanged {
                id,
                status: ImageStatus::Uploading
            })
        );
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_stream_ends_when_bus_dropped() {
        let bus = ProgressBus::new(4);
        let subscription = bus.subscribe();
        let id = Uuid::new_v4();

        bus.publish_progress(id, 1.0);
        drop(bus);

        let events: Vec<_> = subscription.into_stream().collect().await;
        assert_eq!(events, vec![BusEvent::Progress { id, value: 1.0 }]);
    }

    #[test]
    fn test_dropped_subscription_is_removed() {
        let bus = ProgressBus::new(4);
        let kept = bus.subscribe();
        let gone = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        drop(gone);
        bus.publish_progress(Uuid::new_v4(), 0.0);

        assert_eq!(bus.subscriber_count(), 1);
        drop(kept);
    }

    #[test]
    fn test_event_json_shape() {
        let id = Uuid::nil();
        let json = serde_json::to_value(BusEvent::StatusChanged {
            id,
            status: ImageStatus::FileMissing,
        })
        .unwrap();

        assert_eq!(json["kind"], "StatusChanged");
        assert_eq!(json["status"], "FileMissing");
        assert_eq!(json["id"], id.to_string());
    }
}
