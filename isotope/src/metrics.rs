//! Operation metrics and the instrumented repository decorator.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use log::debug;

use crate::aggregate::PipelineStage;
use crate::common::constants::NO_COLLECTION;
use crate::common::{DocumentData, Value};
use crate::document::Document;
use crate::errors::IsotopeResult;
use crate::filter::Filter;
use crate::registry::BackendKind;
use crate::repository::{
    BulkOperation, BulkResult, FindOptions, IndexModel, RepositoryProvider, TransactionFunc,
};

/// Whether an operation completed or failed.
///
/// Expected negative outcomes such as `NotFound` and `VersionConflict` count
/// as failures; the recorder sees the contract result, not its cause.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperationOutcome {
    Success,
    Failure,
}

impl OperationOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationOutcome::Success => "success",
            OperationOutcome::Failure => "failure",
        }
    }
}

impl fmt::Display for OperationOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Receives one record per repository operation.
///
/// Implementations must be cheap and non-blocking; they run inline on the
/// operation's task. Operations without a single target collection record
/// `-` as the collection.
pub trait MetricsRecorder: Send + Sync {
    fn record_operation(
        &self,
        name: &str,
        collection: &str,
        outcome: OperationOutcome,
        duration: Duration,
    );
}

/// Discards every record.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopMetrics;

impl MetricsRecorder for NoopMetrics {
    fn record_operation(
        &self,
        _name: &str,
        _collection: &str,
        _outcome: OperationOutcome,
        _duration: Duration,
    ) {
    }
}

/// Writes each record to the `log` facade at debug level.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogMetrics;

impl MetricsRecorder for LogMetrics {
    fn record_operation(
        &self,
        name: &str,
        collection: &str,
        outcome: OperationOutcome,
        duration: Duration,
    ) {
        debug!(
            "operation={} collection={} outcome={} duration_ms={}",
            name,
            collection,
            outcome,
            duration.as_millis()
        );
    }
}

/// Repository decorator that times every operation and reports it to a
/// [MetricsRecorder].
///
/// Wraps any provider; the wrapped provider's semantics pass through
/// untouched.
pub struct InstrumentedRepository {
    inner: Arc<dyn RepositoryProvider>,
    metrics: Arc<dyn MetricsRecorder>,
}

impl InstrumentedRepository {
    pub fn new(
        inner: Arc<dyn RepositoryProvider>,
        metrics: Arc<dyn MetricsRecorder>,
    ) -> InstrumentedRepository {
        InstrumentedRepository { inner, metrics }
    }

    fn record<T>(
        &self,
        name: &str,
        collection: &str,
        started: Instant,
        result: &IsotopeResult<T>,
    ) {
        let outcome = if result.is_ok() {
            OperationOutcome::Success
        } else {
            OperationOutcome::Failure
        };
        self.metrics
            .record_operation(name, collection, outcome, started.elapsed());
    }
}

#[async_trait]
impl RepositoryProvider for InstrumentedRepository {
    fn backend(&self) -> BackendKind {
        self.inner.backend()
    }

    async fn save(&self, document: Document) -> IsotopeResult<Document> {
        let collection = document.collection().to_string();
        let started = Instant::now();
        let result = self.inner.save(document).await;
        self.record("save", &collection, started, &result);
        result
    }

    async fn save_many(&self, documents: Vec<Document>) -> IsotopeResult<Vec<Document>> {
        let started = Instant::now();
        let result = self.inner.save_many(documents).await;
        self.record("save_many", NO_COLLECTION, started, &result);
        result
    }

    async fn find_by_id(&self, collection: &str, id: &str) -> IsotopeResult<Document> {
        let started = Instant::now();
        let result = self.inner.find_by_id(collection, id).await;
        self.record("find_by_id", collection, started, &result);
        result
    }

    async fn find_all(&self, collection: &str) -> IsotopeResult<Vec<Document>> {
        let started = Instant::now();
        let result = self.inner.find_all(collection).await;
        self.record("find_all", collection, started, &result);
        result
    }

    async fn find_with_options(
        &self,
        collection: &str,
        filter: &Filter,
        options: &FindOptions,
    ) -> IsotopeResult<Vec<Document>> {
        let started = Instant::now();
        let result = self.inner.find_with_options(collection, filter, options).await;
        self.record("find_with_options", collection, started, &result);
        result
    }

    async fn update(
        &self,
        collection: &str,
        id: &str,
        expected_version: i64,
        update: &DocumentData,
    ) -> IsotopeResult<Document> {
        let started = Instant::now();
        let result = self.inner.update(collection, id, expected_version, update).await;
        self.record("update", collection, started, &result);
        result
    }

    async fn update_many(
        &self,
        collection: &str,
        filter: &Filter,
        update: &DocumentData,
    ) -> IsotopeResult<u64> {
        let started = Instant::now();
        let result = self.inner.update_many(collection, filter, update).await;
        self.record("update_many", collection, started, &result);
        result
    }

    async fn replace(&self, document: &Document) -> IsotopeResult<Document> {
        let started = Instant::now();
        let result = self.inner.replace(document).await;
        self.record("replace", document.collection(), started, &result);
        result
    }

    async fn delete(&self, collection: &str, id: &str, expected_version: i64) -> IsotopeResult<()> {
        let started = Instant::now();
        let result = self.inner.delete(collection, id, expected_version).await;
        self.record("delete", collection, started, &result);
        result
    }

    async fn delete_many(&self, collection: &str, filter: &Filter) -> IsotopeResult<u64> {
        let started = Instant::now();
        let result = self.inner.delete_many(collection, filter).await;
        self.record("delete_many", collection, started, &result);
        result
    }

    async fn find_and_update(
        &self,
        collection: &str,
        filter: &Filter,
        update: &DocumentData,
    ) -> IsotopeResult<Document> {
        let started = Instant::now();
        let result = self.inner.find_and_update(collection, filter, update).await;
        self.record("find_and_update", collection, started, &result);
        result
    }

    async fn find_one_and_replace(
        &self,
        collection: &str,
        filter: &Filter,
        data: &DocumentData,
    ) -> IsotopeResult<Document> {
        let started = Instant::now();
        let result = self.inner.find_one_and_replace(collection, filter, data).await;
        self.record("find_one_and_replace", collection, started, &result);
        result
    }

    async fn find_one_and_delete(&self, collection: &str, filter: &Filter) -> IsotopeResult<Document> {
        let started = Instant::now();
        let result = self.inner.find_one_and_delete(collection, filter).await;
        self.record("find_one_and_delete", collection, started, &result);
        result
    }

    async fn upsert(
        &self,
        collection: &str,
        filter: &Filter,
        update: &DocumentData,
    ) -> IsotopeResult<Document> {
        let started = Instant::now();
        let result = self.inner.upsert(collection, filter, update).await;
        self.record("upsert", collection, started, &result);
        result
    }

    async fn aggregate(
        &self,
        collection: &str,
        pipeline: &[PipelineStage],
    ) -> IsotopeResult<Vec<DocumentData>> {
        let started = Instant::now();
        let result = self.inner.aggregate(collection, pipeline).await;
        self.record("aggregate", collection, started, &result);
        result
    }

    async fn distinct(
        &self,
        collection: &str,
        field: &str,
        filter: &Filter,
    ) -> IsotopeResult<Vec<Value>> {
        let started = Instant::now();
        let result = self.inner.distinct(collection, field, filter).await;
        self.record("distinct", collection, started, &result);
        result
    }

    async fn count(&self, collection: &str, filter: &Filter) -> IsotopeResult<u64> {
        let started = Instant::now();
        let result = self.inner.count(collection, filter).await;
        self.record("count", collection, started, &result);
        result
    }

    async fn estimated_count(&self, collection: &str) -> IsotopeResult<u64> {
        let started = Instant::now();
        let result = self.inner.estimated_count(collection).await;
        self.record("estimated_count", collection, started, &result);
        result
    }

    async fn bulk_write(&self, operations: Vec<BulkOperation>) -> IsotopeResult<BulkResult> {
        let started = Instant::now();
        let result = self.inner.bulk_write(operations).await;
        self.record("bulk_write", NO_COLLECTION, started, &result);
        result
    }

    async fn create_index(&self, collection: &str, model: IndexModel) -> IsotopeResult<String> {
        let started = Instant::now();
        let result = self.inner.create_index(collection, model).await;
        self.record("create_index", collection, started, &result);
        result
    }

    async fn create_indexes(
        &self,
        collection: &str,
        models: Vec<IndexModel>,
    ) -> IsotopeResult<Vec<String>> {
        let started = Instant::now();
        let result = self.inner.create_indexes(collection, models).await;
        self.record("create_indexes", collection, started, &result);
        result
    }

    async fn drop_index(&self, collection: &str, name: &str) -> IsotopeResult<()> {
        let started = Instant::now();
        let result = self.inner.drop_index(collection, name).await;
        self.record("drop_index", collection, started, &result);
        result
    }

    async fn list_indexes(&self, collection: &str) -> IsotopeResult<Vec<IndexModel>> {
        let started = Instant::now();
        let result = self.inner.list_indexes(collection).await;
        self.record("list_indexes", collection, started, &result);
        result
    }

    async fn create_collection(&self, name: &str) -> IsotopeResult<()> {
        let started = Instant::now();
        let result = self.inner.create_collection(name).await;
        self.record("create_collection", name, started, &result);
        result
    }

    async fn drop_collection(&self, name: &str) -> IsotopeResult<()> {
        let started = Instant::now();
        let result = self.inner.drop_collection(name).await;
        self.record("drop_collection", name, started, &result);
        result
    }

    async fn rename_collection(&self, old_name: &str, new_name: &str) -> IsotopeResult<()> {
        let started = Instant::now();
        let result = self.inner.rename_collection(old_name, new_name).await;
        self.record("rename_collection", old_name, started, &result);
        result
    }

    async fn list_collections(&self) -> IsotopeResult<Vec<String>> {
        let started = Instant::now();
        let result = self.inner.list_collections().await;
        self.record("list_collections", NO_COLLECTION, started, &result);
        result
    }

    async fn collection_exists(&self, name: &str) -> IsotopeResult<bool> {
        let started = Instant::now();
        let result = self.inner.collection_exists(name).await;
        self.record("collection_exists", name, started, &result);
        result
    }

    async fn with_transaction(&self, func: TransactionFunc) -> IsotopeResult<()> {
        let started = Instant::now();
        let result = self.inner.with_transaction(func).await;
        self.record("with_transaction", NO_COLLECTION, started, &result);
        result
    }

    async fn health_check(&self) -> IsotopeResult<()> {
        let started = Instant::now();
        let result = self.inner.health_check().await;
        self.record("health_check", NO_COLLECTION, started, &result);
        result
    }
}
