use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use async_trait::async_trait;

use crate::aggregate::PipelineStage;
use crate::common::{DocumentData, Value};
use crate::document::Document;
use crate::errors::IsotopeResult;
use crate::filter::Filter;
use crate::registry::BackendKind;
use crate::repository::{BulkOperation, BulkResult, FindOptions, IndexModel, TransactionFunc};

/// The storage-engine-agnostic repository contract.
///
/// Every backend adapter implements this trait with identical semantics:
///
/// - **Versioning**: a saved document starts at version 1; every accepted
///   mutation increments the version by exactly 1. Compare-and-set mutations
///   (`update`, `replace`, `delete`) carry the version the caller observed
///   and fail with `VersionConflict` when the stored version differs.
/// - **Atomicity**: the find-and-mutate family (`find_and_update`,
///   `find_one_and_replace`, `find_one_and_delete`, `upsert`) is atomic per
///   document on every backend, built on the engine's native mechanism.
/// - **Errors**: failures map onto the fixed taxonomy in
///   [ErrorKind](crate::errors::ErrorKind); `NotFound` and `VersionConflict`
///   are expected outcomes, and operations an engine cannot express fail
///   with an explicit `Unsupported` instead of silently degrading.
/// - **Cancellation**: dropping a returned future abandons the call; open
///   backend transactions roll back on drop. Callers impose deadlines with
///   `tokio::time::timeout`.
///
/// Successful mutations hand a change event to the adapter's bounded
/// publisher after the backend acknowledges the write; event delivery never
/// affects the outcome of the mutation itself.
#[async_trait]
pub trait RepositoryProvider: Send + Sync {
    /// Identifies the backend serving this repository.
    fn backend(&self) -> BackendKind;

    /// Persists a new document.
    ///
    /// Assigns a generated id when the document does not carry one and
    /// stamps version 1. Saving an id that already exists fails with
    /// `ValidationFailed`.
    ///
    /// # Returns
    ///
    /// The stored document with id, version, and timestamps populated.
    async fn save(&self, document: Document) -> IsotopeResult<Document>;

    /// Persists a batch of new documents.
    ///
    /// Atomic only where the backend's insert batch is; adapters document
    /// their guarantee. Fails fast on the first rejected document.
    async fn save_many(&self, documents: Vec<Document>) -> IsotopeResult<Vec<Document>>;

    /// Fetches one document by id.
    ///
    /// # Returns
    ///
    /// The document, or `NotFound`.
    async fn find_by_id(&self, collection: &str, id: &str) -> IsotopeResult<Document>;

    /// Fetches every document in a collection.
    async fn find_all(&self, collection: &str) -> IsotopeResult<Vec<Document>>;

    /// Fetches documents matching a filter, with sorting, pagination, and
    /// projection applied.
    async fn find_with_options(
        &self,
        collection: &str,
        filter: &Filter,
        options: &FindOptions,
    ) -> IsotopeResult<Vec<Document>>;

    /// Applies a field-set update to one document, compare-and-set on the
    /// expected version.
    ///
    /// # Returns
    ///
    /// The updated document, `VersionConflict` when the stored version
    /// differs from `expected_version`, or `NotFound` when the id does not
    /// exist.
    async fn update(
        &self,
        collection: &str,
        id: &str,
        expected_version: i64,
        update: &DocumentData,
    ) -> IsotopeResult<Document>;

    /// Applies a field-set update to every document matching the filter.
    ///
    /// Each matched document's version increments by 1. An empty filter is
    /// rejected with `InvalidArgument`.
    ///
    /// # Returns
    ///
    /// The number of documents updated.
    async fn update_many(
        &self,
        collection: &str,
        filter: &Filter,
        update: &DocumentData,
    ) -> IsotopeResult<u64>;

    /// Replaces a document's payload wholesale, compare-and-set on the
    /// version the document carries.
    async fn replace(&self, document: &Document) -> IsotopeResult<Document>;

    /// Deletes one document, compare-and-set on the expected version.
    async fn delete(&self, collection: &str, id: &str, expected_version: i64) -> IsotopeResult<()>;

    /// Deletes every document matching the filter.
    ///
    /// An empty filter is rejected with `InvalidArgument`.
    ///
    /// # Returns
    ///
    /// The number of documents deleted.
    async fn delete_many(&self, collection: &str, filter: &Filter) -> IsotopeResult<u64>;

    /// Atomically updates the first document matching the filter.
    ///
    /// # Returns
    ///
    /// The post-image, or `NotFound` when nothing matches.
    async fn find_and_update(
        &self,
        collection: &str,
        filter: &Filter,
        update: &DocumentData,
    ) -> IsotopeResult<Document>;

    /// Atomically replaces the payload of the first document matching the
    /// filter.
    ///
    /// # Returns
    ///
    /// The post-image, or `NotFound` when nothing matches.
    async fn find_one_and_replace(
        &self,
        collection: &str,
        filter: &Filter,
        data: &DocumentData,
    ) -> IsotopeResult<Document>;

    /// Atomically deletes the first document matching the filter.
    ///
    /// # Returns
    ///
    /// The pre-image, or `NotFound` when nothing matches.
    async fn find_one_and_delete(&self, collection: &str, filter: &Filter) -> IsotopeResult<Document>;

    /// Updates the first document matching the filter, inserting a fresh one
    /// when nothing matches.
    ///
    /// On insert the new document's payload is the filter's equality
    /// conditions overlaid with the update map, and a string `id` condition
    /// seeds the document id.
    async fn upsert(
        &self,
        collection: &str,
        filter: &Filter,
        update: &DocumentData,
    ) -> IsotopeResult<Document>;

    /// Runs the portable aggregation pipeline.
    ///
    /// Stages an engine cannot express fail with `Unsupported` naming the
    /// stage; nothing is silently dropped.
    ///
    /// # Returns
    ///
    /// Result rows; for non-grouping pipelines each row is a document
    /// payload with the document id injected under `id`.
    async fn aggregate(
        &self,
        collection: &str,
        pipeline: &[PipelineStage],
    ) -> IsotopeResult<Vec<DocumentData>>;

    /// Returns the distinct values of a payload field across matching
    /// documents.
    async fn distinct(
        &self,
        collection: &str,
        field: &str,
        filter: &Filter,
    ) -> IsotopeResult<Vec<Value>>;

    /// Counts documents matching the filter.
    async fn count(&self, collection: &str, filter: &Filter) -> IsotopeResult<u64>;

    /// Returns a fast, possibly approximate document count.
    ///
    /// Backends without a cheap estimate fall back to an exact count.
    async fn estimated_count(&self, collection: &str) -> IsotopeResult<u64> {
        self.count(collection, &Filter::empty()).await
    }

    /// Executes a batch of operations, unordered, with partial success.
    ///
    /// Operations are grouped by collection and translated to the backend's
    /// native batching where one exists. Independent operations succeed even
    /// when others fail; per-operation failures land in the result keyed by
    /// submission index.
    async fn bulk_write(&self, operations: Vec<BulkOperation>) -> IsotopeResult<BulkResult>;

    /// Creates a secondary index.
    ///
    /// # Returns
    ///
    /// The concrete index name.
    async fn create_index(&self, collection: &str, model: IndexModel) -> IsotopeResult<String>;

    /// Creates several indexes.
    ///
    /// # Returns
    ///
    /// The concrete index names, in definition order.
    async fn create_indexes(
        &self,
        collection: &str,
        models: Vec<IndexModel>,
    ) -> IsotopeResult<Vec<String>> {
        let mut names = Vec::with_capacity(models.len());
        for model in models {
            names.push(self.create_index(collection, model).await?);
        }
        Ok(names)
    }

    /// Drops an index by name.
    async fn drop_index(&self, collection: &str, name: &str) -> IsotopeResult<()>;

    /// Lists the indexes defined on a collection.
    async fn list_indexes(&self, collection: &str) -> IsotopeResult<Vec<IndexModel>>;

    /// Creates a collection. Creating an existing collection is a no-op.
    async fn create_collection(&self, name: &str) -> IsotopeResult<()>;

    /// Drops a collection and its documents. Dropping a missing collection
    /// is a no-op.
    async fn drop_collection(&self, name: &str) -> IsotopeResult<()>;

    /// Renames a collection, carrying its documents over.
    async fn rename_collection(&self, old_name: &str, new_name: &str) -> IsotopeResult<()>;

    /// Lists collection names.
    async fn list_collections(&self) -> IsotopeResult<Vec<String>>;

    /// Reports whether a collection exists.
    async fn collection_exists(&self, name: &str) -> IsotopeResult<bool>;

    /// Runs a closure inside a backend transaction.
    ///
    /// The closure receives an explicit [TransactionScope]; `Ok` commits and
    /// `Err` rolls back. Backends without multi-operation atomicity execute
    /// the scope's operations directly and document that an error does not
    /// undo earlier operations.
    async fn with_transaction(&self, func: TransactionFunc) -> IsotopeResult<()>;

    /// Verifies the backend connection.
    ///
    /// Distinct from replication-lag probing: this answers "is the backend
    /// reachable", not "how stale are replica reads".
    async fn health_check(&self) -> IsotopeResult<()>;
}

/// A cloneable handle to a repository backend.
///
/// `Repository` follows the PIMPL pattern: it wraps an
/// `Arc<dyn RepositoryProvider>` and dereferences to it, so call sites use
/// the contract methods directly while the adapter stays swappable.
///
/// # Examples
///
/// ```rust,ignore
/// use isotope::memory::MemoryRepository;
/// use isotope::repository::Repository;
///
/// let repo = Repository::new(MemoryRepository::new());
/// let doc = repo.save(Document::new("users", data! { name: "Alice" })).await?;
/// ```
#[derive(Clone)]
pub struct Repository {
    inner: Arc<dyn RepositoryProvider>,
}

impl Repository {
    /// Wraps a provider in the public facade.
    pub fn new<T: RepositoryProvider + 'static>(provider: T) -> Repository {
        Repository {
            inner: Arc::new(provider),
        }
    }

    /// Wraps an already shared provider.
    pub fn from_arc(inner: Arc<dyn RepositoryProvider>) -> Repository {
        Repository { inner }
    }
}

impl Deref for Repository {
    type Target = Arc<dyn RepositoryProvider>;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl fmt::Debug for Repository {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Repository")
            .field("backend", &self.inner.backend())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryRepository;

    #[test]
    fn test_repository_debug_names_the_backend() {
        let repo = Repository::new(MemoryRepository::new());
        assert_eq!(format!("{:?}", repo), "Repository { backend: Memory }");
    }
}
