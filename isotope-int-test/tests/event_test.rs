//! Change-event delivery observed end to end through a repository.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use isotope::data;
use isotope::document::Document;
use isotope::errors::IsotopeResult;
use isotope::event::{ChangeEvent, ChangeEventPublisher, ChangeEventSink, ChangeEventType};
use isotope::memory::MemoryRepository;
use isotope::repository::{transaction, Repository};

use isotope_int_test::test_util::unique_collection;

struct RecordingSink {
    events: Mutex<Vec<ChangeEvent>>,
}

impl RecordingSink {
    fn new() -> Arc<RecordingSink> {
        Arc::new(RecordingSink {
            events: Mutex::new(Vec::new()),
        })
    }

    fn types(&self) -> Vec<ChangeEventType> {
        self.events.lock().iter().map(ChangeEvent::event_type).collect()
    }
}

#[async_trait]
impl ChangeEventSink for RecordingSink {
    async fn deliver(&self, event: ChangeEvent) -> IsotopeResult<()> {
        self.events.lock().push(event);
        Ok(())
    }
}

fn observed_repository() -> (Repository, Arc<RecordingSink>, Arc<ChangeEventPublisher>) {
    let sink = RecordingSink::new();
    let publisher = Arc::new(ChangeEventPublisher::new(sink.clone()));
    let repo = Repository::new(MemoryRepository::with_publisher(publisher.clone()));
    (repo, sink, publisher)
}

#[tokio::test]
async fn test_mutation_lifecycle_emits_one_event_per_commit() {
    let (repo, sink, publisher) = observed_repository();
    let collection = unique_collection("users");

    let saved = repo
        .save(Document::with_id(&collection, "u-1", data! { name: "alice" }))
        .await
        .unwrap();
    let updated = repo
        .update(&collection, "u-1", saved.version(), &data! { age: 30 })
        .await
        .unwrap();
    repo.replace(&updated.with_data(data! { name: "alice", age: 31 }))
        .await
        .unwrap();
    repo.delete(&collection, "u-1", 3).await.unwrap();

    publisher.flush().await;
    assert_eq!(
        sink.types(),
        vec![
            ChangeEventType::Created,
            ChangeEventType::Updated,
            ChangeEventType::Replaced,
            ChangeEventType::Deleted,
        ]
    );

    let events = sink.events.lock();
    assert!(events.iter().all(|event| event.collection() == collection));
    assert!(events.iter().all(|event| event.document_id() == "u-1"));
    assert_eq!(events[3].version(), 3);
    assert!(events[3].payload().is_none());
    assert_eq!(publisher.dropped_events(), 0);
}

#[tokio::test]
async fn test_failed_mutations_emit_nothing() {
    let (repo, sink, publisher) = observed_repository();
    let collection = unique_collection("users");

    repo.save(Document::with_id(&collection, "u-1", data! { name: "alice" }))
        .await
        .unwrap();
    repo.update(&collection, "u-1", 7, &data! { age: 30 })
        .await
        .unwrap_err();
    repo.delete(&collection, "u-9", 1).await.unwrap_err();

    publisher.flush().await;
    assert_eq!(sink.types(), vec![ChangeEventType::Created]);
}

#[tokio::test]
async fn test_transaction_events_flow_only_after_commit() {
    let (repo, sink, publisher) = observed_repository();
    let collection = unique_collection("accounts");

    let tx_collection = collection.clone();
    repo.with_transaction(transaction(move |tx| {
        let collection = tx_collection.clone();
        Box::pin(async move {
            tx.save(Document::with_id(&collection, "a-1", data! { balance: 100 }))
                .await?;
            tx.update(&collection, "a-1", 1, &data! { balance: 80 }).await?;
            Ok(())
        })
    }))
    .await
    .unwrap();

    publisher.flush().await;
    assert_eq!(
        sink.types(),
        vec![ChangeEventType::Created, ChangeEventType::Updated]
    );

    // a rolled-back scope must not leak its buffered events
    let tx_collection = collection.clone();
    repo.with_transaction(transaction(move |tx| {
        let collection = tx_collection.clone();
        Box::pin(async move {
            tx.save(Document::with_id(&collection, "a-2", data! { balance: 10 }))
                .await?;
            Err(isotope::errors::IsotopeError::transient("simulated failure"))
        })
    }))
    .await
    .unwrap_err();

    publisher.flush().await;
    assert_eq!(sink.events.lock().len(), 2);
}
