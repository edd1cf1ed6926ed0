//! Change data capture events and the bounded publisher that delivers them.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::warn;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::common::constants::DEFAULT_EVENT_QUEUE_CAPACITY;
use crate::common::DocumentData;
use crate::document::Document;
use crate::errors::IsotopeResult;

/// The kind of mutation a change event records.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeEventType {
    /// A document was inserted.
    Created,
    /// Individual fields of a document were set.
    Updated,
    /// A document's whole payload was swapped.
    Replaced,
    /// A document was removed.
    Deleted,
}

impl fmt::Display for ChangeEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeEventType::Created => write!(f, "created"),
            ChangeEventType::Updated => write!(f, "updated"),
            ChangeEventType::Replaced => write!(f, "replaced"),
            ChangeEventType::Deleted => write!(f, "deleted"),
        }
    }
}

/// A single committed mutation, as observed by downstream consumers.
#[derive(Clone, Debug, PartialEq)]
pub struct ChangeEvent {
    event_id: String,
    event_type: ChangeEventType,
    collection: String,
    document_id: String,
    version: i64,
    payload: Option<DocumentData>,
    occurred_at: DateTime<Utc>,
}

impl ChangeEvent {
    fn new(
        event_type: ChangeEventType,
        collection: &str,
        document_id: &str,
        version: i64,
        payload: Option<DocumentData>,
    ) -> ChangeEvent {
        ChangeEvent {
            event_id: Uuid::new_v4().to_string(),
            event_type,
            collection: collection.to_string(),
            document_id: document_id.to_string(),
            version,
            payload,
            occurred_at: Utc::now(),
        }
    }

    /// Event for a freshly inserted document.
    pub fn created(document: &Document) -> ChangeEvent {
        ChangeEvent::new(
            ChangeEventType::Created,
            document.collection(),
            document.id(),
            document.version(),
            Some(document.data().clone()),
        )
    }

    /// Event for a field-set update that produced the given document state.
    pub fn updated(document: &Document) -> ChangeEvent {
        ChangeEvent::new(
            ChangeEventType::Updated,
            document.collection(),
            document.id(),
            document.version(),
            Some(document.data().clone()),
        )
    }

    /// Event for a payload replacement that produced the given document
    /// state.
    pub fn replaced(document: &Document) -> ChangeEvent {
        ChangeEvent::new(
            ChangeEventType::Replaced,
            document.collection(),
            document.id(),
            document.version(),
            Some(document.data().clone()),
        )
    }

    /// Event for a deletion. The version is the last stored version and the
    /// payload is absent.
    pub fn deleted(collection: &str, document_id: &str, version: i64) -> ChangeEvent {
        ChangeEvent::new(ChangeEventType::Deleted, collection, document_id, version, None)
    }

    pub fn event_id(&self) -> &str {
        &self.event_id
    }

    pub fn event_type(&self) -> ChangeEventType {
        self.event_type
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    pub fn version(&self) -> i64 {
        self.version
    }

    pub fn payload(&self) -> Option<&DocumentData> {
        self.payload.as_ref()
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }
}

/// Downstream consumer of change events.
///
/// Delivery is at-most-once and best-effort. A failing or slow sink never
/// fails or delays the mutation that produced the event.
#[async_trait]
pub trait ChangeEventSink: Send + Sync {
    async fn deliver(&self, event: ChangeEvent) -> IsotopeResult<()>;
}

enum PublisherMessage {
    Deliver(ChangeEvent),
    Flush(oneshot::Sender<()>),
}

/// Bounded, non-blocking fan-out of change events to a sink.
///
/// Mutations enqueue events without awaiting; a background task drains the
/// queue and feeds the sink. When the queue is full the event is dropped,
/// counted, and logged, so a stalled consumer applies back-pressure to the
/// event stream instead of to writers.
pub struct ChangeEventPublisher {
    tx: mpsc::Sender<PublisherMessage>,
    dropped: AtomicU64,
}

impl ChangeEventPublisher {
    /// Creates a publisher with the default queue capacity.
    pub fn new(sink: Arc<dyn ChangeEventSink>) -> ChangeEventPublisher {
        ChangeEventPublisher::with_capacity(sink, DEFAULT_EVENT_QUEUE_CAPACITY)
    }

    /// Creates a publisher whose queue holds at most `capacity` undelivered
    /// events.
    pub fn with_capacity(sink: Arc<dyn ChangeEventSink>, capacity: usize) -> ChangeEventPublisher {
        let (tx, rx) = mpsc::channel(capacity);
        tokio::spawn(worker_loop(rx, sink));
        ChangeEventPublisher {
            tx,
            dropped: AtomicU64::new(0),
        }
    }

    /// Enqueues an event without blocking. Returns whether the event was
    /// accepted.
    pub fn publish(&self, event: ChangeEvent) -> bool {
        match self.tx.try_send(PublisherMessage::Deliver(event)) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(PublisherMessage::Deliver(event))) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "change event queue full, dropping {} event for {}/{}",
                    event.event_type(),
                    event.collection(),
                    event.document_id()
                );
                false
            }
            Err(_) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!("change event worker stopped, dropping event");
                false
            }
        }
    }

    /// Waits until every event enqueued before this call has been handed to
    /// the sink.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(PublisherMessage::Flush(done_tx)).await.is_ok() {
            let _ = done_rx.await;
        }
    }

    /// Number of events dropped because the queue was full or closed.
    pub fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

async fn worker_loop(mut rx: mpsc::Receiver<PublisherMessage>, sink: Arc<dyn ChangeEventSink>) {
    while let Some(message) = rx.recv().await {
        match message {
            PublisherMessage::Deliver(event) => {
                if let Err(error) = sink.deliver(event).await {
                    warn!("change event sink failed: {}", error);
                }
            }
            PublisherMessage::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data;
    use parking_lot::Mutex;
    use std::time::Duration;

    struct RecordingSink {
        events: Mutex<Vec<ChangeEvent>>,
        delay: Option<Duration>,
    }

    impl RecordingSink {
        fn new() -> Arc<RecordingSink> {
            Arc::new(RecordingSink {
                events: Mutex::new(Vec::new()),
                delay: None,
            })
        }

        fn slow(delay: Duration) -> Arc<RecordingSink> {
            Arc::new(RecordingSink {
                events: Mutex::new(Vec::new()),
                delay: Some(delay),
            })
        }
    }

    #[async_trait]
    impl ChangeEventSink for RecordingSink {
        async fn deliver(&self, event: ChangeEvent) -> IsotopeResult<()> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.events.lock().push(event);
            Ok(())
        }
    }

    fn sample_document() -> Document {
        Document::with_id("users", "u1", data! { name: "Alice" })
            .into_first_version(Utc::now())
    }

    #[test]
    fn test_change_event_constructors() {
        let document = sample_document();

        let created = ChangeEvent::created(&document);
        assert_eq!(created.event_type(), ChangeEventType::Created);
        assert_eq!(created.collection(), "users");
        assert_eq!(created.document_id(), "u1");
        assert_eq!(created.version(), 1);
        assert!(created.payload().is_some());
        assert!(!created.event_id().is_empty());

        let deleted = ChangeEvent::deleted("users", "u1", 3);
        assert_eq!(deleted.event_type(), ChangeEventType::Deleted);
        assert_eq!(deleted.version(), 3);
        assert!(deleted.payload().is_none());
    }

    #[test]
    fn test_change_event_type_display() {
        assert_eq!(ChangeEventType::Created.to_string(), "created");
        assert_eq!(ChangeEventType::Deleted.to_string(), "deleted");
    }

    #[tokio::test]
    async fn test_publisher_delivers_in_order() {
        let sink = RecordingSink::new();
        let publisher = ChangeEventPublisher::new(sink.clone());
        let document = sample_document();

        assert!(publisher.publish(ChangeEvent::created(&document)));
        assert!(publisher.publish(ChangeEvent::updated(&document)));
        assert!(publisher.publish(ChangeEvent::deleted("users", "u1", 2)));
        publisher.flush().await;

        let events = sink.events.lock();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].event_type(), ChangeEventType::Created);
        assert_eq!(events[1].event_type(), ChangeEventType::Updated);
        assert_eq!(events[2].event_type(), ChangeEventType::Deleted);
        assert_eq!(publisher.dropped_events(), 0);
    }

    #[tokio::test]
    async fn test_publisher_drops_when_queue_full() {
        let sink = RecordingSink::slow(Duration::from_secs(60));
        let publisher = ChangeEventPublisher::with_capacity(sink.clone(), 1);
        let document = sample_document();

        // first event may be in flight; fill the single queue slot, then
        // keep publishing until try_send reports Full
        let mut dropped_any = false;
        for _ in 0..8 {
            if !publisher.publish(ChangeEvent::created(&document)) {
                dropped_any = true;
                break;
            }
        }

        assert!(dropped_any);
        assert!(publisher.dropped_events() >= 1);
    }

    #[tokio::test]
    async fn test_publisher_survives_failing_sink() {
        struct FailingSink;

        #[async_trait]
        impl ChangeEventSink for FailingSink {
            async fn deliver(&self, _event: ChangeEvent) -> IsotopeResult<()> {
                Err(crate::errors::IsotopeError::transient("sink offline"))
            }
        }

        let publisher = ChangeEventPublisher::new(Arc::new(FailingSink));
        let document = sample_document();

        assert!(publisher.publish(ChangeEvent::created(&document)));
        publisher.flush().await;
        assert!(publisher.publish(ChangeEvent::updated(&document)));
        publisher.flush().await;
        assert_eq!(publisher.dropped_events(), 0);
    }
}
