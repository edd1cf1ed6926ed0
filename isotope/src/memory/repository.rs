use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, OwnedRwLockWriteGuard, RwLock};

use crate::aggregate::PipelineStage;
use crate::common::{DocumentData, Value};
use crate::document::Document;
use crate::errors::{IsotopeError, IsotopeResult};
use crate::event::{ChangeEvent, ChangeEventPublisher};
use crate::filter::Filter;
use crate::memory::store::{self, MemoryStore};
use crate::registry::BackendKind;
use crate::repository::{
    validate, BulkOperation, BulkResult, FindOptions, IndexModel, RepositoryProvider,
    TransactionFunc, TransactionScope, TransactionScopeProvider,
};
use crate::translate;

/// The in-process backend.
///
/// Documents live in per-collection ordered maps behind one async
/// read-write lock. Readers run concurrently; writers serialize. A
/// transaction takes the write lock for its whole scope and rolls back by
/// restoring a snapshot, so partial transactions are never observable.
pub struct MemoryRepository {
    store: Arc<RwLock<MemoryStore>>,
    publisher: Option<Arc<ChangeEventPublisher>>,
}

impl MemoryRepository {
    pub fn new() -> MemoryRepository {
        MemoryRepository {
            store: Arc::new(RwLock::new(MemoryStore::default())),
            publisher: None,
        }
    }

    /// Creates a repository that hands every committed change to the given
    /// publisher.
    pub fn with_publisher(publisher: Arc<ChangeEventPublisher>) -> MemoryRepository {
        MemoryRepository {
            store: Arc::new(RwLock::new(MemoryStore::default())),
            publisher: Some(publisher),
        }
    }

    fn publish(&self, event: ChangeEvent) {
        if let Some(publisher) = &self.publisher {
            publisher.publish(event);
        }
    }

    fn publish_all(&self, events: Vec<ChangeEvent>) {
        for event in events {
            self.publish(event);
        }
    }
}

impl Default for MemoryRepository {
    fn default() -> MemoryRepository {
        MemoryRepository::new()
    }
}

#[async_trait]
impl RepositoryProvider for MemoryRepository {
    fn backend(&self) -> BackendKind {
        BackendKind::Memory
    }

    async fn save(&self, document: Document) -> IsotopeResult<Document> {
        let (saved, event) = {
            let mut store = self.store.write().await;
            store::save(&mut store, document)?
        };
        self.publish(event);
        Ok(saved)
    }

    async fn save_many(&self, documents: Vec<Document>) -> IsotopeResult<Vec<Document>> {
        let mut saved = Vec::with_capacity(documents.len());
        let mut events = Vec::with_capacity(documents.len());
        let outcome = {
            let mut store = self.store.write().await;
            let mut failure = None;
            for document in documents {
                match store::save(&mut store, document) {
                    Ok((document, event)) => {
                        saved.push(document);
                        events.push(event);
                    }
                    Err(error) => {
                        failure = Some(error);
                        break;
                    }
                }
            }
            failure
        };
        // documents saved before a failure stay saved, so their events flow
        self.publish_all(events);
        match outcome {
            Some(error) => Err(error),
            None => Ok(saved),
        }
    }

    async fn find_by_id(&self, collection: &str, id: &str) -> IsotopeResult<Document> {
        let store = self.store.read().await;
        store::find_by_id(&store, collection, id)
    }

    async fn find_all(&self, collection: &str) -> IsotopeResult<Vec<Document>> {
        let store = self.store.read().await;
        Ok(store::find_all(&store, collection))
    }

    async fn find_with_options(
        &self,
        collection: &str,
        filter: &Filter,
        options: &FindOptions,
    ) -> IsotopeResult<Vec<Document>> {
        validate::filter_fields(filter)?;
        let documents = {
            let store = self.store.read().await;
            store::find_all(&store, collection)
                .into_iter()
                .filter(|document| translate::matches_filter(document, filter))
                .collect()
        };
        Ok(translate::apply_find_options(documents, options))
    }

    async fn update(
        &self,
        collection: &str,
        id: &str,
        expected_version: i64,
        update: &DocumentData,
    ) -> IsotopeResult<Document> {
        let (updated, event) = {
            let mut store = self.store.write().await;
            store::update(&mut store, collection, id, expected_version, update)?
        };
        self.publish(event);
        Ok(updated)
    }

    async fn update_many(
        &self,
        collection: &str,
        filter: &Filter,
        update: &DocumentData,
    ) -> IsotopeResult<u64> {
        let (count, events) = {
            let mut store = self.store.write().await;
            store::update_many(&mut store, collection, filter, update)?
        };
        self.publish_all(events);
        Ok(count)
    }

    async fn replace(&self, document: &Document) -> IsotopeResult<Document> {
        let (replaced, event) = {
            let mut store = self.store.write().await;
            store::replace(&mut store, document)?
        };
        self.publish(event);
        Ok(replaced)
    }

    async fn delete(&self, collection: &str, id: &str, expected_version: i64) -> IsotopeResult<()> {
        let event = {
            let mut store = self.store.write().await;
            store::delete(&mut store, collection, id, expected_version)?
        };
        self.publish(event);
        Ok(())
    }

    async fn delete_many(&self, collection: &str, filter: &Filter) -> IsotopeResult<u64> {
        let (count, events) = {
            let mut store = self.store.write().await;
            store::delete_many(&mut store, collection, filter)?
        };
        self.publish_all(events);
        Ok(count)
    }

    async fn find_and_update(
        &self,
        collection: &str,
        filter: &Filter,
        update: &DocumentData,
    ) -> IsotopeResult<Document> {
        let (updated, event) = {
            let mut store = self.store.write().await;
            store::find_and_update(&mut store, collection, filter, update)?
        };
        self.publish(event);
        Ok(updated)
    }

    async fn find_one_and_replace(
        &self,
        collection: &str,
        filter: &Filter,
        data: &DocumentData,
    ) -> IsotopeResult<Document> {
        let (replaced, event) = {
            let mut store = self.store.write().await;
            store::find_one_and_replace(&mut store, collection, filter, data)?
        };
        self.publish(event);
        Ok(replaced)
    }

    async fn find_one_and_delete(&self, collection: &str, filter: &Filter) -> IsotopeResult<Document> {
        let (removed, event) = {
            let mut store = self.store.write().await;
            store::find_one_and_delete(&mut store, collection, filter)?
        };
        self.publish(event);
        Ok(removed)
    }

    async fn upsert(
        &self,
        collection: &str,
        filter: &Filter,
        update: &DocumentData,
    ) -> IsotopeResult<Document> {
        let (document, event) = {
            let mut store = self.store.write().await;
            store::upsert(&mut store, collection, filter, update)?
        };
        self.publish(event);
        Ok(document)
    }

    async fn aggregate(
        &self,
        collection: &str,
        pipeline: &[PipelineStage],
    ) -> IsotopeResult<Vec<DocumentData>> {
        validate::collection_name(collection)?;
        let documents = {
            let store = self.store.read().await;
            store::find_all(&store, collection)
        };
        translate::run_pipeline(documents, pipeline)
    }

    async fn distinct(
        &self,
        collection: &str,
        field: &str,
        filter: &Filter,
    ) -> IsotopeResult<Vec<Value>> {
        validate::field_name(field)?;
        validate::filter_fields(filter)?;
        let store = self.store.read().await;
        let documents = store::find_all(&store, collection);
        Ok(translate::distinct_values(&documents, field, filter))
    }

    async fn count(&self, collection: &str, filter: &Filter) -> IsotopeResult<u64> {
        validate::filter_fields(filter)?;
        let store = self.store.read().await;
        Ok(store::count(&store, collection, filter))
    }

    async fn bulk_write(&self, operations: Vec<BulkOperation>) -> IsotopeResult<BulkResult> {
        let mut result = BulkResult::new();
        let mut events = Vec::new();
        {
            let mut store = self.store.write().await;
            for (index, operation) in operations.into_iter().enumerate() {
                apply_bulk_operation(&mut store, index, operation, &mut result, &mut events);
            }
        }
        self.publish_all(events);
        Ok(result)
    }

    async fn create_index(&self, collection: &str, model: IndexModel) -> IsotopeResult<String> {
        let mut store = self.store.write().await;
        store::create_index(&mut store, collection, model)
    }

    async fn drop_index(&self, collection: &str, name: &str) -> IsotopeResult<()> {
        let mut store = self.store.write().await;
        store::drop_index(&mut store, collection, name)
    }

    async fn list_indexes(&self, collection: &str) -> IsotopeResult<Vec<IndexModel>> {
        let store = self.store.read().await;
        Ok(store::list_indexes(&store, collection))
    }

    async fn create_collection(&self, name: &str) -> IsotopeResult<()> {
        let mut store = self.store.write().await;
        store::create_collection(&mut store, name)
    }

    async fn drop_collection(&self, name: &str) -> IsotopeResult<()> {
        let mut store = self.store.write().await;
        store::drop_collection(&mut store, name)
    }

    async fn rename_collection(&self, old_name: &str, new_name: &str) -> IsotopeResult<()> {
        let mut store = self.store.write().await;
        store::rename_collection(&mut store, old_name, new_name)
    }

    async fn list_collections(&self) -> IsotopeResult<Vec<String>> {
        let store = self.store.read().await;
        Ok(store::list_collections(&store))
    }

    async fn collection_exists(&self, name: &str) -> IsotopeResult<bool> {
        let store = self.store.read().await;
        Ok(store::collection_exists(&store, name))
    }

    async fn with_transaction(&self, func: TransactionFunc) -> IsotopeResult<()> {
        let guard = self.store.clone().write_owned().await;
        let snapshot: MemoryStore = (*guard).clone();
        let provider = Arc::new(MemoryTransactionScope {
            state: Mutex::new(ScopeState {
                guard: Some(guard),
                events: Vec::new(),
            }),
        });
        let scope = TransactionScope::from_arc(provider.clone());
        let result = func(&scope).await;

        let mut state = provider.state.lock().await;
        match result {
            Ok(()) => {
                let events = std::mem::take(&mut state.events);
                state.guard = None;
                drop(state);
                self.publish_all(events);
                Ok(())
            }
            Err(error) => {
                if let Some(guard) = state.guard.as_mut() {
                    **guard = snapshot;
                }
                state.guard = None;
                Err(error)
            }
        }
    }

    async fn health_check(&self) -> IsotopeResult<()> {
        Ok(())
    }
}

fn apply_bulk_operation(
    store: &mut MemoryStore,
    index: usize,
    operation: BulkOperation,
    result: &mut BulkResult,
    events: &mut Vec<ChangeEvent>,
) {
    match operation {
        BulkOperation::Insert {
            collection,
            document,
        } => {
            if document.collection() != collection {
                result.record_error(
                    index,
                    IsotopeError::invalid_argument(&format!(
                        "insert targets '{}' but the document belongs to '{}'",
                        collection,
                        document.collection()
                    )),
                );
                return;
            }
            match store::save(store, document) {
                Ok((_, event)) => {
                    result.record_inserted(1);
                    events.push(event);
                }
                Err(error) => result.record_error(index, error),
            }
        }
        BulkOperation::Update {
            collection,
            filter,
            update,
            multi,
            upsert,
        } => {
            if upsert {
                match store::upsert(store, &collection, &filter, &update) {
                    Ok((document, event)) => {
                        if document.version() == crate::common::constants::INITIAL_VERSION {
                            result.record_upserted(index, document.id().to_string());
                        } else {
                            result.record_matched(1);
                            result.record_modified(1);
                        }
                        events.push(event);
                    }
                    Err(error) => result.record_error(index, error),
                }
            } else if multi {
                match store::update_many(store, &collection, &filter, &update) {
                    Ok((count, new_events)) => {
                        result.record_matched(count);
                        result.record_modified(count);
                        events.extend(new_events);
                    }
                    Err(error) => result.record_error(index, error),
                }
            } else {
                match store::find_and_update(store, &collection, &filter, &update) {
                    Ok((_, event)) => {
                        result.record_matched(1);
                        result.record_modified(1);
                        events.push(event);
                    }
                    Err(error) if error.kind() == &crate::errors::ErrorKind::NotFound => {}
                    Err(error) => result.record_error(index, error),
                }
            }
        }
        BulkOperation::Replace {
            collection,
            filter,
            data,
            upsert,
        } => match store::find_one_and_replace(store, &collection, &filter, &data) {
            Ok((_, event)) => {
                result.record_matched(1);
                result.record_modified(1);
                events.push(event);
            }
            Err(error) if error.kind() == &crate::errors::ErrorKind::NotFound && upsert => {
                let document = match filter.id_condition() {
                    Some(id) => Document::with_id(&collection, id, data),
                    None => Document::new(&collection, data),
                };
                match store::save(store, document) {
                    Ok((document, event)) => {
                        result.record_upserted(index, document.id().to_string());
                        events.push(event);
                    }
                    Err(error) => result.record_error(index, error),
                }
            }
            Err(error) if error.kind() == &crate::errors::ErrorKind::NotFound => {}
            Err(error) => result.record_error(index, error),
        },
        BulkOperation::Delete {
            collection,
            filter,
            multi,
        } => {
            if multi {
                match store::delete_many(store, &collection, &filter) {
                    Ok((count, new_events)) => {
                        result.record_deleted(count);
                        events.extend(new_events);
                    }
                    Err(error) => result.record_error(index, error),
                }
            } else {
                match store::find_one_and_delete(store, &collection, &filter) {
                    Ok((_, event)) => {
                        result.record_deleted(1);
                        events.push(event);
                    }
                    Err(error) if error.kind() == &crate::errors::ErrorKind::NotFound => {}
                    Err(error) => result.record_error(index, error),
                }
            }
        }
    }
}

struct ScopeState {
    guard: Option<OwnedRwLockWriteGuard<MemoryStore>>,
    events: Vec<ChangeEvent>,
}

/// Transaction scope over the store's write lock.
///
/// The owned write guard keeps every other reader and writer out until the
/// transaction completes, so scope operations observe and produce a
/// consistent store.
struct MemoryTransactionScope {
    state: Mutex<ScopeState>,
}

impl MemoryTransactionScope {
    async fn with_store<T>(
        &self,
        f: impl FnOnce(&mut MemoryStore, &mut Vec<ChangeEvent>) -> IsotopeResult<T> + Send,
    ) -> IsotopeResult<T> {
        let mut state = self.state.lock().await;
        let ScopeState { guard, events } = &mut *state;
        match guard.as_mut() {
            Some(guard) => f(&mut **guard, events),
            None => Err(IsotopeError::invalid_argument(
                "transaction scope used after the transaction completed",
            )),
        }
    }
}

#[async_trait]
impl TransactionScopeProvider for MemoryTransactionScope {
    async fn save(&self, document: Document) -> IsotopeResult<Document> {
        self.with_store(move |store, events| {
            let (saved, event) = store::save(store, document)?;
            events.push(event);
            Ok(saved)
        })
        .await
    }

    async fn find_by_id(&self, collection: &str, id: &str) -> IsotopeResult<Document> {
        self.with_store(|store, _| store::find_by_id(store, collection, id))
            .await
    }

    async fn update(
        &self,
        collection: &str,
        id: &str,
        expected_version: i64,
        update: &DocumentData,
    ) -> IsotopeResult<Document> {
        self.with_store(|store, events| {
            let (updated, event) = store::update(store, collection, id, expected_version, update)?;
            events.push(event);
            Ok(updated)
        })
        .await
    }

    async fn replace(&self, document: &Document) -> IsotopeResult<Document> {
        self.with_store(|store, events| {
            let (replaced, event) = store::replace(store, document)?;
            events.push(event);
            Ok(replaced)
        })
        .await
    }

    async fn delete(&self, collection: &str, id: &str, expected_version: i64) -> IsotopeResult<()> {
        self.with_store(|store, events| {
            let event = store::delete(store, collection, id, expected_version)?;
            events.push(event);
            Ok(())
        })
        .await
    }

    async fn upsert(
        &self,
        collection: &str,
        filter: &Filter,
        update: &DocumentData,
    ) -> IsotopeResult<Document> {
        self.with_store(|store, events| {
            let (document, event) = store::upsert(store, collection, filter, update)?;
            events.push(event);
            Ok(document)
        })
        .await
    }
}
