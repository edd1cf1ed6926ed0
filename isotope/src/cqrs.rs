//! Command/query split over two repository handles.
//!
//! Mutations, schema changes, and transactions always run on the command
//! side. Reads run on the query side as long as measured replication lag
//! stays within the configured staleness bound; beyond it the read either
//! falls back to the command side or fails as `Transient`, per policy.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::warn;

use crate::aggregate::PipelineStage;
use crate::common::{DocumentData, Value};
use crate::document::Document;
use crate::errors::{ErrorKind, IsotopeError, IsotopeResult};
use crate::filter::Filter;
use crate::registry::BackendKind;
use crate::repository::{
    BulkOperation, BulkResult, FindOptions, IndexModel, Repository, RepositoryProvider,
    TransactionFunc,
};

/// Staleness bound and fallback behavior for the query side.
#[derive(Clone, Copy, Debug)]
pub struct ReadPolicy {
    max_staleness: Duration,
    fallback_to_primary: bool,
}

impl ReadPolicy {
    /// Policy that falls back to the command side when replicas lag beyond
    /// the bound.
    pub fn with_fallback(max_staleness: Duration) -> ReadPolicy {
        ReadPolicy {
            max_staleness,
            fallback_to_primary: true,
        }
    }

    /// Policy that fails reads with `Transient` when replicas lag beyond the
    /// bound.
    pub fn strict(max_staleness: Duration) -> ReadPolicy {
        ReadPolicy {
            max_staleness,
            fallback_to_primary: false,
        }
    }

    pub fn max_staleness(&self) -> Duration {
        self.max_staleness
    }

    pub fn fallback_to_primary(&self) -> bool {
        self.fallback_to_primary
    }
}

impl Default for ReadPolicy {
    fn default() -> ReadPolicy {
        ReadPolicy::with_fallback(Duration::from_secs(10))
    }
}

/// Measures how far the query side trails the command side.
///
/// This is a replication measurement, deliberately separate from
/// `health_check`: a backend can be healthy while its replicas lag.
#[async_trait]
pub trait ReplicationProbe: Send + Sync {
    async fn replication_lag(&self) -> IsotopeResult<Duration>;
}

/// Probe returning a configurable fixed lag.
pub struct FixedLagProbe {
    lag: parking_lot::Mutex<Duration>,
}

impl FixedLagProbe {
    pub fn new(lag: Duration) -> FixedLagProbe {
        FixedLagProbe {
            lag: parking_lot::Mutex::new(lag),
        }
    }

    pub fn set_lag(&self, lag: Duration) {
        *self.lag.lock() = lag;
    }
}

#[async_trait]
impl ReplicationProbe for FixedLagProbe {
    async fn replication_lag(&self) -> IsotopeResult<Duration> {
        Ok(*self.lag.lock())
    }
}

/// Repository that routes commands and queries to different handles.
///
/// Both handles usually point at the same cluster, the command side pinned
/// to the primary with durable write acknowledgement and the query side
/// bound to replicas.
pub struct CqrsRepository {
    commands: Repository,
    queries: Repository,
    probe: Arc<dyn ReplicationProbe>,
    policy: ReadPolicy,
}

impl CqrsRepository {
    pub fn new(
        commands: Repository,
        queries: Repository,
        probe: Arc<dyn ReplicationProbe>,
        policy: ReadPolicy,
    ) -> CqrsRepository {
        CqrsRepository {
            commands,
            queries,
            probe,
            policy,
        }
    }

    /// Current replication lag as seen by the probe.
    pub async fn replication_lag(&self) -> IsotopeResult<Duration> {
        self.probe.replication_lag().await
    }

    async fn query_target(&self) -> IsotopeResult<&Repository> {
        match self.probe.replication_lag().await {
            Ok(lag) if lag <= self.policy.max_staleness => Ok(&self.queries),
            Ok(lag) => {
                if self.policy.fallback_to_primary {
                    warn!(
                        "replication lag {}ms exceeds bound {}ms, routing read to command side",
                        lag.as_millis(),
                        self.policy.max_staleness.as_millis()
                    );
                    Ok(&self.commands)
                } else {
                    Err(IsotopeError::transient(&format!(
                        "replication lag {}ms exceeds the staleness bound of {}ms",
                        lag.as_millis(),
                        self.policy.max_staleness.as_millis()
                    )))
                }
            }
            Err(error) => {
                if self.policy.fallback_to_primary {
                    warn!(
                        "replication probe failed ({}), routing read to command side",
                        error
                    );
                    Ok(&self.commands)
                } else {
                    Err(IsotopeError::new_with_cause(
                        "replication lag could not be measured",
                        ErrorKind::Transient,
                        error,
                    ))
                }
            }
        }
    }
}

#[async_trait]
impl RepositoryProvider for CqrsRepository {
    fn backend(&self) -> BackendKind {
        self.commands.backend()
    }

    async fn save(&self, document: Document) -> IsotopeResult<Document> {
        self.commands.save(document).await
    }

    async fn save_many(&self, documents: Vec<Document>) -> IsotopeResult<Vec<Document>> {
        self.commands.save_many(documents).await
    }

    async fn find_by_id(&self, collection: &str, id: &str) -> IsotopeResult<Document> {
        self.query_target().await?.find_by_id(collection, id).await
    }

    async fn find_all(&self, collection: &str) -> IsotopeResult<Vec<Document>> {
        self.query_target().await?.find_all(collection).await
    }

    async fn find_with_options(
        &self,
        collection: &str,
        filter: &Filter,
        options: &FindOptions,
    ) -> IsotopeResult<Vec<Document>> {
        self.query_target()
            .await?
            .find_with_options(collection, filter, options)
            .await
    }

    async fn update(
        &self,
        collection: &str,
        id: &str,
        expected_version: i64,
        update: &DocumentData,
    ) -> IsotopeResult<Document> {
        self.commands
            .update(collection, id, expected_version, update)
            .await
    }

    async fn update_many(
        &self,
        collection: &str,
        filter: &Filter,
        update: &DocumentData,
    ) -> IsotopeResult<u64> {
        self.commands.update_many(collection, filter, update).await
    }

    async fn replace(&self, document: &Document) -> IsotopeResult<Document> {
        self.commands.replace(document).await
    }

    async fn delete(&self, collection: &str, id: &str, expected_version: i64) -> IsotopeResult<()> {
        self.commands.delete(collection, id, expected_version).await
    }

    async fn delete_many(&self, collection: &str, filter: &Filter) -> IsotopeResult<u64> {
        self.commands.delete_many(collection, filter).await
    }

    async fn find_and_update(
        &self,
        collection: &str,
        filter: &Filter,
        update: &DocumentData,
    ) -> IsotopeResult<Document> {
        self.commands.find_and_update(collection, filter, update).await
    }

    async fn find_one_and_replace(
        &self,
        collection: &str,
        filter: &Filter,
        data: &DocumentData,
    ) -> IsotopeResult<Document> {
        self.commands
            .find_one_and_replace(collection, filter, data)
            .await
    }

    async fn find_one_and_delete(&self, collection: &str, filter: &Filter) -> IsotopeResult<Document> {
        self.commands.find_one_and_delete(collection, filter).await
    }

    async fn upsert(
        &self,
        collection: &str,
        filter: &Filter,
        update: &DocumentData,
    ) -> IsotopeResult<Document> {
        self.commands.upsert(collection, filter, update).await
    }

    async fn aggregate(
        &self,
        collection: &str,
        pipeline: &[PipelineStage],
    ) -> IsotopeResult<Vec<DocumentData>> {
        self.query_target()
            .await?
            .aggregate(collection, pipeline)
            .await
    }

    async fn distinct(
        &self,
        collection: &str,
        field: &str,
        filter: &Filter,
    ) -> IsotopeResult<Vec<Value>> {
        self.query_target()
            .await?
            .distinct(collection, field, filter)
            .await
    }

    async fn count(&self, collection: &str, filter: &Filter) -> IsotopeResult<u64> {
        self.query_target().await?.count(collection, filter).await
    }

    async fn estimated_count(&self, collection: &str) -> IsotopeResult<u64> {
        self.query_target().await?.estimated_count(collection).await
    }

    async fn bulk_write(&self, operations: Vec<BulkOperation>) -> IsotopeResult<BulkResult> {
        self.commands.bulk_write(operations).await
    }

    async fn create_index(&self, collection: &str, model: IndexModel) -> IsotopeResult<String> {
        self.commands.create_index(collection, model).await
    }

    async fn drop_index(&self, collection: &str, name: &str) -> IsotopeResult<()> {
        self.commands.drop_index(collection, name).await
    }

    async fn list_indexes(&self, collection: &str) -> IsotopeResult<Vec<IndexModel>> {
        self.query_target().await?.list_indexes(collection).await
    }

    async fn create_collection(&self, name: &str) -> IsotopeResult<()> {
        self.commands.create_collection(name).await
    }

    async fn drop_collection(&self, name: &str) -> IsotopeResult<()> {
        self.commands.drop_collection(name).await
    }

    async fn rename_collection(&self, old_name: &str, new_name: &str) -> IsotopeResult<()> {
        self.commands.rename_collection(old_name, new_name).await
    }

    async fn list_collections(&self) -> IsotopeResult<Vec<String>> {
        self.query_target().await?.list_collections().await
    }

    async fn collection_exists(&self, name: &str) -> IsotopeResult<bool> {
        self.query_target().await?.collection_exists(name).await
    }

    async fn with_transaction(&self, func: TransactionFunc) -> IsotopeResult<()> {
        self.commands.with_transaction(func).await
    }

    async fn health_check(&self) -> IsotopeResult<()> {
        self.commands.health_check().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data;
    use crate::memory::MemoryRepository;

    struct BrokenProbe;

    #[async_trait]
    impl ReplicationProbe for BrokenProbe {
        async fn replication_lag(&self) -> IsotopeResult<Duration> {
            Err(IsotopeError::transient("probe cannot reach the replica"))
        }
    }

    async fn seeded_pair() -> (Repository, Repository) {
        let commands = Repository::new(MemoryRepository::new());
        let queries = Repository::new(MemoryRepository::new());
        commands
            .save(Document::with_id("users", "u1", data! { side: "command" }))
            .await
            .unwrap();
        queries
            .save(Document::with_id("users", "u1", data! { side: "query" }))
            .await
            .unwrap();
        (commands, queries)
    }

    #[tokio::test]
    async fn test_reads_route_to_query_side_within_bound() {
        let (commands, queries) = seeded_pair().await;
        let repository = CqrsRepository::new(
            commands,
            queries,
            Arc::new(FixedLagProbe::new(Duration::from_millis(50))),
            ReadPolicy::with_fallback(Duration::from_secs(1)),
        );

        let found = repository.find_by_id("users", "u1").await.unwrap();
        assert_eq!(found.get("side"), Some(&Value::from("query")));
    }

    #[tokio::test]
    async fn test_lagging_replica_falls_back_to_command_side() {
        let (commands, queries) = seeded_pair().await;
        let probe = Arc::new(FixedLagProbe::new(Duration::from_secs(30)));
        let repository = CqrsRepository::new(
            commands,
            queries,
            probe.clone(),
            ReadPolicy::with_fallback(Duration::from_secs(1)),
        );

        let found = repository.find_by_id("users", "u1").await.unwrap();
        assert_eq!(found.get("side"), Some(&Value::from("command")));

        probe.set_lag(Duration::from_millis(10));
        let found = repository.find_by_id("users", "u1").await.unwrap();
        assert_eq!(found.get("side"), Some(&Value::from("query")));
    }

    #[tokio::test]
    async fn test_strict_policy_fails_reads_on_lag() {
        let (commands, queries) = seeded_pair().await;
        let repository = CqrsRepository::new(
            commands,
            queries,
            Arc::new(FixedLagProbe::new(Duration::from_secs(30))),
            ReadPolicy::strict(Duration::from_secs(1)),
        );

        let error = repository.find_by_id("users", "u1").await.unwrap_err();
        assert_eq!(error.kind(), &ErrorKind::Transient);
    }

    #[tokio::test]
    async fn test_probe_failure_follows_policy() {
        let (commands, queries) = seeded_pair().await;
        let repository = CqrsRepository::new(
            commands.clone(),
            queries.clone(),
            Arc::new(BrokenProbe),
            ReadPolicy::with_fallback(Duration::from_secs(1)),
        );
        let found = repository.find_by_id("users", "u1").await.unwrap();
        assert_eq!(found.get("side"), Some(&Value::from("command")));

        let strict = CqrsRepository::new(
            commands,
            queries,
            Arc::new(BrokenProbe),
            ReadPolicy::strict(Duration::from_secs(1)),
        );
        let error = strict.find_by_id("users", "u1").await.unwrap_err();
        assert_eq!(error.kind(), &ErrorKind::Transient);
    }

    #[tokio::test]
    async fn test_mutations_always_hit_command_side() {
        let commands = Repository::new(MemoryRepository::new());
        let queries = Repository::new(MemoryRepository::new());
        let repository = CqrsRepository::new(
            commands.clone(),
            queries.clone(),
            Arc::new(FixedLagProbe::new(Duration::ZERO)),
            ReadPolicy::default(),
        );

        let saved = repository
            .save(Document::new("users", data! { name: "Alice" }))
            .await
            .unwrap();

        assert!(commands.find_by_id("users", saved.id()).await.is_ok());
        assert_eq!(
            queries.find_by_id("users", saved.id()).await.unwrap_err().kind(),
            &ErrorKind::NotFound
        );
    }
}
