use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use log::warn;
use scylla::client::session::Session;
use scylla::client::session_builder::SessionBuilder;
use scylla::response::query_result::QueryResult;
use scylla::statement::prepared::PreparedStatement;
use scylla::value::{CqlValue, Row};
use tokio::sync::Mutex;

use isotope::aggregate::PipelineStage;
use isotope::common::{data_from_json_text, data_to_json_text, DocumentData, Value};
use isotope::document::Document;
use isotope::errors::{ErrorKind, IsotopeError, IsotopeResult};
use isotope::event::{ChangeEvent, ChangeEventPublisher};
use isotope::filter::Filter;
use isotope::registry::BackendKind;
use isotope::repository::{
    validate, BulkOperation, BulkResult, FindOptions, IndexModel, RepositoryProvider,
    TransactionFunc, TransactionScope, TransactionScopeProvider,
};
use isotope::translate;

use crate::config::ScyllaConfig;
use crate::statements::Cql;

/// The wide-column backend.
///
/// One table partitioned by collection and clustered by id; every
/// conditional mutation is a lightweight transaction, and a negative
/// `[applied]` surfaces as VersionConflict or NotFound without retrying.
/// Filters beyond id equality scan the collection partition and evaluate
/// client-side.
pub struct ScyllaRepository {
    inner: Arc<ScyllaInner>,
    publisher: Option<Arc<ChangeEventPublisher>>,
}

struct Prepared {
    insert: PreparedStatement,
    select_by_id: PreparedStatement,
    scan: PreparedStatement,
    cas_update: PreparedStatement,
    cas_delete: PreparedStatement,
    delete_partition: PreparedStatement,
    count: PreparedStatement,
    catalog_insert: PreparedStatement,
    catalog_delete: PreparedStatement,
    catalog_select: PreparedStatement,
}

struct ScyllaInner {
    session: Session,
    cql: Cql,
    prepared: Prepared,
}

impl ScyllaRepository {
    /// Connects, creates the keyspace and tables when missing, and prepares
    /// every statement the adapter executes.
    pub async fn connect(config: ScyllaConfig) -> IsotopeResult<ScyllaRepository> {
        ScyllaRepository::open(config, None).await
    }

    /// Connects and hands every applied change to the given publisher.
    pub async fn connect_with_publisher(
        config: ScyllaConfig,
        publisher: Arc<ChangeEventPublisher>,
    ) -> IsotopeResult<ScyllaRepository> {
        ScyllaRepository::open(config, Some(publisher)).await
    }

    async fn open(
        config: ScyllaConfig,
        publisher: Option<Arc<ChangeEventPublisher>>,
    ) -> IsotopeResult<ScyllaRepository> {
        config.validate()?;
        let session = SessionBuilder::new()
            .known_nodes(config.nodes())
            .build()
            .await
            .map_err(|e| driver_error("Failed to connect to the cluster", e))?;

        let cql = Cql::new(config.keyspace());
        for ddl in [
            cql.create_keyspace(config.replication_factor_value()),
            cql.create_documents_table(),
            cql.create_catalog_table(),
        ] {
            session
                .query_unpaged(ddl, ())
                .await
                .map_err(|e| driver_error("Schema setup failed", e))?;
        }

        let prepared = Prepared {
            insert: prepare(&session, cql.insert_if_absent()).await?,
            select_by_id: prepare(&session, cql.select_by_id()).await?,
            scan: prepare(&session, cql.scan_collection()).await?,
            cas_update: prepare(&session, cql.cas_update()).await?,
            cas_delete: prepare(&session, cql.cas_delete()).await?,
            delete_partition: prepare(&session, cql.delete_partition()).await?,
            count: prepare(&session, cql.count_partition()).await?,
            catalog_insert: prepare(&session, cql.insert_catalog_entry()).await?,
            catalog_delete: prepare(&session, cql.delete_catalog_entry()).await?,
            catalog_select: prepare(&session, cql.select_catalog_entry()).await?,
        };

        Ok(ScyllaRepository {
            inner: Arc::new(ScyllaInner {
                session,
                cql,
                prepared,
            }),
            publisher,
        })
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

#[async_trait]
impl RepositoryProvider for ScyllaRepository {
    fn backend(&self) -> BackendKind {
        BackendKind::Scylla
    }

    async fn save(&self, document: Document) -> IsotopeResult<Document> {
        let (saved, event) = self.inner.save_inner(document).await?;
        self.publish(event);
        Ok(saved)
    }

    async fn save_many(&self, documents: Vec<Document>) -> IsotopeResult<Vec<Document>> {
        for document in &documents {
            validate::unsaved_document(document)?;
        }
        // row-by-row: conditional inserts cannot batch across partitions,
        // and earlier rows stay inserted when a later one fails
        let mut saved = Vec::with_capacity(documents.len());
        for document in documents {
            let (document, event) = self.inner.save_inner(document).await?;
            self.publish(event);
            saved.push(document);
        }
        Ok(saved)
    }

    async fn find_by_id(&self, collection: &str, id: &str) -> IsotopeResult<Document> {
        validate::collection_name(collection)?;
        validate::document_id(id)?;
        let found = self.inner.fetch_by_id(collection, id).await?;
        found.ok_or_else(|| not_found(collection, id))
    }

    async fn find_all(&self, collection: &str) -> IsotopeResult<Vec<Document>> {
        validate::collection_name(collection)?;
        self.inner.scan(collection).await
    }

    async fn find_with_options(
        &self,
        collection: &str,
        filter: &Filter,
        options: &FindOptions,
    ) -> IsotopeResult<Vec<Document>> {
        validate::collection_name(collection)?;
        validate::filter_fields(filter)?;
        let matched = self.inner.fetch_matching(collection, filter).await?;
        Ok(translate::apply_find_options(matched, options))
    }

    async fn update(
        &self,
        collection: &str,
        id: &str,
        expected_version: i64,
        update: &DocumentData,
    ) -> IsotopeResult<Document> {
        validate::collection_name(collection)?;
        validate::document_id(id)?;
        validate::expected_version(expected_version)?;
        validate::update_payload(update)?;
        let (updated, event) = self
            .inner
            .update_inner(collection, id, expected_version, update)
            .await?;
        self.publish(event);
        Ok(updated)
    }

    async fn update_many(
        &self,
        collection: &str,
        filter: &Filter,
        update: &DocumentData,
    ) -> IsotopeResult<u64> {
        validate::collection_name(collection)?;
        validate::broad_mutation_filter(filter, "UpdateMany")?;
        validate::update_payload(update)?;

        let matched = self.inner.fetch_matching(collection, filter).await?;
        let mut count = 0;
        for document in matched {
            let mut data = document.data().clone();
            translate::apply_update(&mut data, update);
            let (_, event) = self
                .inner
                .write_conditional(&document, data, ChangeKind::Updated)
                .await?;
            self.publish(event);
            count += 1;
        }
        Ok(count)
    }

    async fn replace(&self, document: &Document) -> IsotopeResult<Document> {
        validate::stored_document(document)?;
        let (replaced, event) = self.inner.replace_inner(document).await?;
        self.publish(event);
        Ok(replaced)
    }

    async fn delete(&self, collection: &str, id: &str, expected_version: i64) -> IsotopeResult<()> {
        validate::collection_name(collection)?;
        validate::document_id(id)?;
        validate::expected_version(expected_version)?;
        let event = self
            .inner
            .delete_inner(collection, id, expected_version)
            .await?;
        self.publish(event);
        Ok(())
    }

    async fn delete_many(&self, collection: &str, filter: &Filter) -> IsotopeResult<u64> {
        validate::collection_name(collection)?;
        validate::broad_mutation_filter(filter, "DeleteMany")?;

        let matched = self.inner.fetch_matching(collection, filter).await?;
        let mut count = 0;
        for document in matched {
            let event = self
                .inner
                .delete_inner(collection, document.id(), document.version())
                .await?;
            self.publish(event);
            count += 1;
        }
        Ok(count)
    }

    async fn find_and_update(
        &self,
        collection: &str,
        filter: &Filter,
        update: &DocumentData,
    ) -> IsotopeResult<Document> {
        validate::collection_name(collection)?;
        validate::filter_fields(filter)?;
        validate::update_payload(update)?;
        let (updated, event) = self.inner.find_and_update_inner(collection, filter, update).await?;
        self.publish(event);
        Ok(updated)
    }

    async fn find_one_and_replace(
        &self,
        collection: &str,
        filter: &Filter,
        data: &DocumentData,
    ) -> IsotopeResult<Document> {
        validate::collection_name(collection)?;
        validate::filter_fields(filter)?;

        let matched = self.inner.fetch_matching(collection, filter).await?;
        let current = matched.into_iter().next().ok_or_else(|| no_match(collection))?;
        let (replaced, event) = self
            .inner
            .write_conditional(&current, data.clone(), ChangeKind::Replaced)
            .await?;
        self.publish(event);
        Ok(replaced)
    }

    async fn find_one_and_delete(&self, collection: &str, filter: &Filter) -> IsotopeResult<Document> {
        validate::collection_name(collection)?;
        validate::filter_fields(filter)?;

        let matched = self.inner.fetch_matching(collection, filter).await?;
        let current = matched.into_iter().next().ok_or_else(|| no_match(collection))?;
        let event = self
            .inner
            .delete_inner(collection, current.id(), current.version())
            .await?;
        self.publish(event);
        Ok(current)
    }

    async fn upsert(
        &self,
        collection: &str,
        filter: &Filter,
        update: &DocumentData,
    ) -> IsotopeResult<Document> {
        validate::collection_name(collection)?;
        validate::filter_fields(filter)?;
        validate::update_payload(update)?;
        let (document, event) = self.inner.upsert_inner(collection, filter, update).await?;
        self.publish(event);
        Ok(document)
    }

    async fn aggregate(
        &self,
        collection: &str,
        pipeline: &[PipelineStage],
    ) -> IsotopeResult<Vec<DocumentData>> {
        validate::collection_name(collection)?;
        let documents = self.inner.scan(collection).await?;
        translate::run_pipeline(documents, pipeline)
    }

    async fn distinct(
        &self,
        collection: &str,
        field: &str,
        filter: &Filter,
    ) -> IsotopeResult<Vec<Value>> {
        validate::collection_name(collection)?;
        validate::field_name(field)?;
        validate::filter_fields(filter)?;
        let documents = self.inner.scan(collection).await?;
        Ok(translate::distinct_values(&documents, field, filter))
    }

    async fn count(&self, collection: &str, filter: &Filter) -> IsotopeResult<u64> {
        validate::collection_name(collection)?;
        validate::filter_fields(filter)?;
        if filter.is_empty() {
            return self.inner.count_partition(collection).await;
        }
        let matched = self.inner.fetch_matching(collection, filter).await?;
        Ok(matched.len() as u64)
    }

    async fn bulk_write(&self, operations: Vec<BulkOperation>) -> IsotopeResult<BulkResult> {
        let mut result = BulkResult::new();
        let mut events = Vec::new();
        for (index, operation) in operations.into_iter().enumerate() {
            self.inner
                .apply_bulk_operation(index, operation, &mut result, &mut events)
                .await;
        }
        self.publish_all(events);
        Ok(result)
    }

    async fn create_index(&self, collection: &str, _model: IndexModel) -> IsotopeResult<String> {
        validate::collection_name(collection)?;
        Err(IsotopeError::unsupported(
            "the wide-column adapter cannot build secondary indexes over the payload",
        ))
    }

    async fn drop_index(&self, collection: &str, name: &str) -> IsotopeResult<()> {
        validate::collection_name(collection)?;
        Err(IsotopeError::not_found(&format!(
            "No index '{}' on '{}'",
            name, collection
        )))
    }

    async fn list_indexes(&self, collection: &str) -> IsotopeResult<Vec<IndexModel>> {
        validate::collection_name(collection)?;
        Ok(Vec::new())
    }

    async fn create_collection(&self, name: &str) -> IsotopeResult<()> {
        validate::collection_name(name)?;
        self.inner
            .session
            .execute_unpaged(&self.inner.prepared.catalog_insert, (name,))
            .await
            .map_err(|e| driver_error("Collection creation failed", e))?;
        Ok(())
    }

    async fn drop_collection(&self, name: &str) -> IsotopeResult<()> {
        validate::collection_name(name)?;
        self.inner
            .session
            .execute_unpaged(&self.inner.prepared.delete_partition, (name,))
            .await
            .map_err(|e| driver_error("Collection drop failed", e))?;
        self.inner
            .session
            .execute_unpaged(&self.inner.prepared.catalog_delete, (name,))
            .await
            .map_err(|e| driver_error("Collection drop failed", e))?;
        Ok(())
    }

    async fn rename_collection(&self, old_name: &str, new_name: &str) -> IsotopeResult<()> {
        validate::collection_name(old_name)?;
        validate::collection_name(new_name)?;
        if !self.collection_exists(old_name).await? {
            return Err(IsotopeError::not_found(&format!(
                "No collection named '{}'",
                old_name
            )));
        }
        if self.collection_exists(new_name).await? {
            return Err(IsotopeError::invalid_argument(&format!(
                "A collection named '{}' already exists",
                new_name
            )));
        }

        // copy then drop; a crash in between leaves both partitions and the
        // copy can be re-run
        let documents = self.inner.scan(old_name).await?;
        for document in &documents {
            let result = self
                .inner
                .session
                .execute_unpaged(
                    &self.inner.prepared.insert,
                    (
                        new_name,
                        document.id(),
                        data_to_json_text(document.data()),
                        document.version(),
                        document.created_at().timestamp_millis(),
                        document.updated_at().timestamp_millis(),
                    ),
                )
                .await
                .map_err(|e| driver_error("Collection rename failed", e))?;
            let outcome = lwt_applied(result)?;
            if !outcome.applied {
                warn!("rename kept an existing row '{}/{}'", new_name, document.id());
            }
        }
        self.inner
            .session
            .execute_unpaged(&self.inner.prepared.delete_partition, (old_name,))
            .await
            .map_err(|e| driver_error("Collection rename failed", e))?;
        self.inner
            .session
            .execute_unpaged(&self.inner.prepared.catalog_delete, (old_name,))
            .await
            .map_err(|e| driver_error("Collection rename failed", e))?;
        self.inner
            .session
            .execute_unpaged(&self.inner.prepared.catalog_insert, (new_name,))
            .await
            .map_err(|e| driver_error("Collection rename failed", e))?;
        Ok(())
    }

    async fn list_collections(&self) -> IsotopeResult<Vec<String>> {
        let mut names = self.inner.catalog_names().await?;
        for name in self.inner.partition_names().await? {
            if !names.contains(&name) {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    async fn collection_exists(&self, name: &str) -> IsotopeResult<bool> {
        validate::collection_name(name)?;
        if self.inner.catalog_contains(name).await? {
            return Ok(true);
        }
        Ok(self.inner.count_partition(name).await? > 0)
    }

    async fn with_transaction(&self, func: TransactionFunc) -> IsotopeResult<()> {
        let provider = Arc::new(ScyllaTransactionScope {
            inner: self.inner.clone(),
            events: Mutex::new(Vec::new()),
        });
        let scope = TransactionScope::from_arc(provider.clone());
        func(&scope).await?;
        let events = std::mem::take(&mut *provider.events.lock().await);
        self.publish_all(events);
        Ok(())
    }

    async fn health_check(&self) -> IsotopeResult<()> {
        self.inner
            .session
            .query_unpaged(self.inner.cql.health_check(), ())
            .await
            .map_err(|e| driver_error("Cluster is unreachable", e))?;
        Ok(())
    }
}

enum ChangeKind {
    Updated,
    Replaced,
}

impl ScyllaInner {
    async fn save_inner(&self, document: Document) -> IsotopeResult<(Document, ChangeEvent)> {
        validate::unsaved_document(&document)?;
        let stored = document.into_first_version(Utc::now());
        self.insert_stored(&stored).await?;
        let event = ChangeEvent::created(&stored);
        Ok((stored, event))
    }

    async fn insert_stored(&self, stored: &Document) -> IsotopeResult<()> {
        let result = self
            .session
            .execute_unpaged(
                &self.prepared.insert,
                (
                    stored.collection(),
                    stored.id(),
                    data_to_json_text(stored.data()),
                    stored.version(),
                    stored.created_at().timestamp_millis(),
                    stored.updated_at().timestamp_millis(),
                ),
            )
            .await
            .map_err(|e| driver_error("Insert failed", e))?;
        if lwt_applied(result)?.applied {
            Ok(())
        } else {
            Err(IsotopeError::validation_failed(&format!(
                "A document with id '{}' already exists in '{}'",
                stored.id(),
                stored.collection()
            )))
        }
    }

    async fn fetch_by_id(&self, collection: &str, id: &str) -> IsotopeResult<Option<Document>> {
        let result = self
            .session
            .execute_unpaged(&self.prepared.select_by_id, (collection, id))
            .await
            .map_err(|e| driver_error("Lookup failed", e))?;
        let rows = result
            .into_rows_result()
            .map_err(|e| driver_error("Lookup failed", e))?;
        let row = rows
            .maybe_first_row::<(String, String, i64, i64, i64)>()
            .map_err(|e| decode_error("Stored row decode failed", e))?;
        row.map(|row| decode_row(collection, row)).transpose()
    }

    async fn scan(&self, collection: &str) -> IsotopeResult<Vec<Document>> {
        let pager = self
            .session
            .execute_iter(self.prepared.scan.clone(), (collection,))
            .await
            .map_err(|e| driver_error("Partition scan failed", e))?;
        let mut stream = pager
            .rows_stream::<(String, String, i64, i64, i64)>()
            .map_err(|e| decode_error("Partition scan decode failed", e))?;

        let mut documents = Vec::new();
        while let Some(row) = stream
            .try_next()
            .await
            .map_err(|e| driver_error("Partition scan failed", e))?
        {
            documents.push(decode_row(collection, row)?);
        }
        Ok(documents)
    }

    /// Matching documents in clustering order. An id condition narrows the
    /// read to one row; anything else scans the partition.
    async fn fetch_matching(&self, collection: &str, filter: &Filter) -> IsotopeResult<Vec<Document>> {
        let candidates = match filter.id_condition() {
            Some(id) => self.fetch_by_id(collection, id).await?.into_iter().collect(),
            None => self.scan(collection).await?,
        };
        Ok(candidates
            .into_iter()
            .filter(|document| translate::matches_filter(document, filter))
            .collect())
    }

    async fn count_partition(&self, collection: &str) -> IsotopeResult<u64> {
        let result = self
            .session
            .execute_unpaged(&self.prepared.count, (collection,))
            .await
            .map_err(|e| driver_error("Count failed", e))?;
        let count: (i64,) = result
            .into_rows_result()
            .map_err(|e| driver_error("Count failed", e))?
            .first_row()
            .map_err(|e| decode_error("Count decode failed", e))?;
        Ok(count.0.max(0) as u64)
    }

    async fn update_inner(
        &self,
        collection: &str,
        id: &str,
        expected_version: i64,
        update: &DocumentData,
    ) -> IsotopeResult<(Document, ChangeEvent)> {
        let current = self
            .fetch_by_id(collection, id)
            .await?
            .ok_or_else(|| not_found(collection, id))?;
        if current.version() != expected_version {
            return Err(version_conflict(collection, id, expected_version, current.version()));
        }
        let mut data = current.data().clone();
        translate::apply_update(&mut data, update);
        self.write_conditional(&current, data, ChangeKind::Updated).await
    }

    async fn replace_inner(&self, document: &Document) -> IsotopeResult<(Document, ChangeEvent)> {
        let current = self
            .fetch_by_id(document.collection(), document.id())
            .await?
            .ok_or_else(|| not_found(document.collection(), document.id()))?;
        if current.version() != document.version() {
            return Err(version_conflict(
                document.collection(),
                document.id(),
                document.version(),
                current.version(),
            ));
        }
        self.write_conditional(&current, document.data().clone(), ChangeKind::Replaced)
            .await
    }

    /// Conditionally writes a new payload over a witnessed document state.
    /// The condition is the witnessed version, so a concurrent writer makes
    /// the LWT come back unapplied.
    async fn write_conditional(
        &self,
        current: &Document,
        data: DocumentData,
        kind: ChangeKind,
    ) -> IsotopeResult<(Document, ChangeEvent)> {
        let now = Utc::now();
        let result = self
            .session
            .execute_unpaged(
                &self.prepared.cas_update,
                (
                    data_to_json_text(&data),
                    current.version() + 1,
                    now.timestamp_millis(),
                    current.collection(),
                    current.id(),
                    current.version(),
                ),
            )
            .await
            .map_err(|e| driver_error("Conditional update failed", e))?;
        let outcome = lwt_applied(result)?;
        if !outcome.applied {
            return Err(cas_failure(
                current.collection(),
                current.id(),
                current.version(),
                outcome.stored_version,
            ));
        }

        let written = Document::from_stored(
            current.id().to_string(),
            current.collection().to_string(),
            data,
            current.version() + 1,
            current.created_at(),
            now,
        );
        let event = match kind {
            ChangeKind::Updated => ChangeEvent::updated(&written),
            ChangeKind::Replaced => ChangeEvent::replaced(&written),
        };
        Ok((written, event))
    }

    async fn delete_inner(
        &self,
        collection: &str,
        id: &str,
        expected_version: i64,
    ) -> IsotopeResult<ChangeEvent> {
        let result = self
            .session
            .execute_unpaged(&self.prepared.cas_delete, (collection, id, expected_version))
            .await
            .map_err(|e| driver_error("Conditional delete failed", e))?;
        let outcome = lwt_applied(result)?;
        if outcome.applied {
            Ok(ChangeEvent::deleted(collection, id, expected_version))
        } else {
            Err(cas_failure(collection, id, expected_version, outcome.stored_version))
        }
    }

    async fn find_and_update_inner(
        &self,
        collection: &str,
        filter: &Filter,
        update: &DocumentData,
    ) -> IsotopeResult<(Document, ChangeEvent)> {
        let matched = self.fetch_matching(collection, filter).await?;
        let current = matched.into_iter().next().ok_or_else(|| no_match(collection))?;
        let mut data = current.data().clone();
        translate::apply_update(&mut data, update);
        self.write_conditional(&current, data, ChangeKind::Updated).await
    }

    async fn upsert_inner(
        &self,
        collection: &str,
        filter: &Filter,
        update: &DocumentData,
    ) -> IsotopeResult<(Document, ChangeEvent)> {
        let matched = self.fetch_matching(collection, filter).await?;
        match matched.into_iter().next() {
            Some(current) => {
                let mut data = current.data().clone();
                translate::apply_update(&mut data, update);
                self.write_conditional(&current, data, ChangeKind::Updated).await
            }
            None => {
                let unsaved = translate::upsert_document(collection, filter, update);
                let stored = unsaved.into_first_version(Utc::now());
                self.insert_stored(&stored).await?;
                let event = ChangeEvent::created(&stored);
                Ok((stored, event))
            }
        }
    }

    async fn catalog_names(&self) -> IsotopeResult<Vec<String>> {
        self.name_column(self.cql.list_catalog()).await
    }

    async fn partition_names(&self) -> IsotopeResult<Vec<String>> {
        self.name_column(self.cql.list_partitions()).await
    }

    async fn name_column(&self, statement: String) -> IsotopeResult<Vec<String>> {
        let result = self
            .session
            .query_unpaged(statement, ())
            .await
            .map_err(|e| driver_error("Collection listing failed", e))?;
        let rows = result
            .into_rows_result()
            .map_err(|e| driver_error("Collection listing failed", e))?;
        let typed = rows
            .rows::<(String,)>()
            .map_err(|e| decode_error("Collection listing decode failed", e))?;
        let mut names = Vec::new();
        for row in typed {
            let (name,) = row.map_err(|e| decode_error("Collection listing decode failed", e))?;
            names.push(name);
        }
        Ok(names)
    }

    async fn catalog_contains(&self, name: &str) -> IsotopeResult<bool> {
        let result = self
            .session
            .execute_unpaged(&self.prepared.catalog_select, (name,))
            .await
            .map_err(|e| driver_error("Collection lookup failed", e))?;
        let rows = result
            .into_rows_result()
            .map_err(|e| driver_error("Collection lookup failed", e))?;
        let row = rows
            .maybe_first_row::<(String,)>()
            .map_err(|e| decode_error("Collection lookup decode failed", e))?;
        Ok(row.is_some())
    }

    async fn apply_bulk_operation(
        &self,
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
                match self.save_inner(document).await {
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
                    match self.upsert_inner(&collection, &filter, &update).await {
                        Ok((document, event)) => {
                            if document.version() == isotope::common::constants::INITIAL_VERSION {
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
                    match self.bulk_update_many(&collection, &filter, &update, events).await {
                        Ok(count) => {
                            result.record_matched(count);
                            result.record_modified(count);
                        }
                        Err(error) => result.record_error(index, error),
                    }
                } else {
                    match self.find_and_update_inner(&collection, &filter, &update).await {
                        Ok((_, event)) => {
                            result.record_matched(1);
                            result.record_modified(1);
                            events.push(event);
                        }
                        Err(error) if error.kind() == &ErrorKind::NotFound => {}
                        Err(error) => result.record_error(index, error),
                    }
                }
            }
            BulkOperation::Replace {
                collection,
                filter,
                data,
                upsert,
            } => {
                let matched = match self.fetch_matching(&collection, &filter).await {
                    Ok(matched) => matched,
                    Err(error) => {
                        result.record_error(index, error);
                        return;
                    }
                };
                match matched.into_iter().next() {
                    Some(current) => {
                        match self
                            .write_conditional(&current, data, ChangeKind::Replaced)
                            .await
                        {
                            Ok((_, event)) => {
                                result.record_matched(1);
                                result.record_modified(1);
                                events.push(event);
                            }
                            Err(error) => result.record_error(index, error),
                        }
                    }
                    None if upsert => {
                        let document =
                            translate::upsert_document(&collection, &filter, &DocumentData::new())
                                .with_data(data);
                        match self.save_inner(document).await {
                            Ok((saved, event)) => {
                                result.record_upserted(index, saved.id().to_string());
                                events.push(event);
                            }
                            Err(error) => result.record_error(index, error),
                        }
                    }
                    None => {}
                }
            }
            BulkOperation::Delete {
                collection,
                filter,
                multi,
            } => {
                let matched = match self.fetch_matching(&collection, &filter).await {
                    Ok(matched) => matched,
                    Err(error) => {
                        result.record_error(index, error);
                        return;
                    }
                };
                let targets: Vec<Document> = if multi {
                    matched
                } else {
                    matched.into_iter().take(1).collect()
                };
                for document in targets {
                    match self
                        .delete_inner(&collection, document.id(), document.version())
                        .await
                    {
                        Ok(event) => {
                            result.record_deleted(1);
                            events.push(event);
                        }
                        Err(error) => {
                            result.record_error(index, error);
                            return;
                        }
                    }
                }
            }
        }
    }

    async fn bulk_update_many(
        &self,
        collection: &str,
        filter: &Filter,
        update: &DocumentData,
        events: &mut Vec<ChangeEvent>,
    ) -> IsotopeResult<u64> {
        let matched = self.fetch_matching(collection, filter).await?;
        let mut count = 0;
        for document in matched {
            let mut data = document.data().clone();
            translate::apply_update(&mut data, update);
            let (_, event) = self
                .write_conditional(&document, data, ChangeKind::Updated)
                .await?;
            events.push(event);
            count += 1;
        }
        Ok(count)
    }
}

/// Transaction scope without cross-operation atomicity: the store has no
/// multi-row transactions, so each operation applies immediately through its
/// own lightweight transaction and an error from the closure leaves earlier
/// writes in place. Change events are still buffered and reach the publisher
/// only when the closure succeeds.
struct ScyllaTransactionScope {
    inner: Arc<ScyllaInner>,
    events: Mutex<Vec<ChangeEvent>>,
}

impl ScyllaTransactionScope {
    async fn record(&self, event: ChangeEvent) {
        self.events.lock().await.push(event);
    }
}

#[async_trait]
impl TransactionScopeProvider for ScyllaTransactionScope {
    async fn save(&self, document: Document) -> IsotopeResult<Document> {
        let (saved, event) = self.inner.save_inner(document).await?;
        self.record(event).await;
        Ok(saved)
    }

    async fn find_by_id(&self, collection: &str, id: &str) -> IsotopeResult<Document> {
        validate::collection_name(collection)?;
        validate::document_id(id)?;
        let found = self.inner.fetch_by_id(collection, id).await?;
        found.ok_or_else(|| not_found(collection, id))
    }

    async fn update(
        &self,
        collection: &str,
        id: &str,
        expected_version: i64,
        update: &DocumentData,
    ) -> IsotopeResult<Document> {
        validate::collection_name(collection)?;
        validate::document_id(id)?;
        validate::expected_version(expected_version)?;
        validate::update_payload(update)?;
        let (updated, event) = self
            .inner
            .update_inner(collection, id, expected_version, update)
            .await?;
        self.record(event).await;
        Ok(updated)
    }

    async fn replace(&self, document: &Document) -> IsotopeResult<Document> {
        validate::stored_document(document)?;
        let (replaced, event) = self.inner.replace_inner(document).await?;
        self.record(event).await;
        Ok(replaced)
    }

    async fn delete(&self, collection: &str, id: &str, expected_version: i64) -> IsotopeResult<()> {
        validate::collection_name(collection)?;
        validate::document_id(id)?;
        validate::expected_version(expected_version)?;
        let event = self
            .inner
            .delete_inner(collection, id, expected_version)
            .await?;
        self.record(event).await;
        Ok(())
    }

    async fn upsert(
        &self,
        collection: &str,
        filter: &Filter,
        update: &DocumentData,
    ) -> IsotopeResult<Document> {
        validate::collection_name(collection)?;
        validate::filter_fields(filter)?;
        validate::update_payload(update)?;
        let (document, event) = self.inner.upsert_inner(collection, filter, update).await?;
        self.record(event).await;
        Ok(document)
    }
}

struct LwtOutcome {
    applied: bool,
    stored_version: Option<i64>,
}

/// Reads the `[applied]` column and, for a failed version condition, the
/// version the row holds now (absent when the row is gone).
fn lwt_applied(result: QueryResult) -> IsotopeResult<LwtOutcome> {
    let rows = result
        .into_rows_result()
        .map_err(|e| driver_error("Conditional write returned no result", e))?;
    let version_column = rows
        .column_specs()
        .iter()
        .position(|spec| spec.name() == "version");
    let row = rows
        .maybe_first_row::<Row>()
        .map_err(|e| decode_error("Conditional write decode failed", e))?
        .ok_or_else(|| IsotopeError::transient("conditional write returned no row"))?;

    let applied = matches!(
        row.columns.first(),
        Some(Some(CqlValue::Boolean(true)))
    );
    let stored_version = version_column.and_then(|index| match row.columns.get(index) {
        Some(Some(CqlValue::BigInt(version))) => Some(*version),
        _ => None,
    });
    Ok(LwtOutcome {
        applied,
        stored_version,
    })
}

fn decode_row(collection: &str, row: (String, String, i64, i64, i64)) -> IsotopeResult<Document> {
    let (id, data, version, created_at, updated_at) = row;
    let data = data_from_json_text(&data)?;
    Ok(Document::from_stored(
        id,
        collection.to_string(),
        data,
        version,
        decode_millis(created_at)?,
        decode_millis(updated_at)?,
    ))
}

fn decode_millis(millis: i64) -> IsotopeResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis).ok_or_else(|| {
        IsotopeError::new(
            &format!("Stored timestamp is out of range: {}", millis),
            ErrorKind::ValidationFailed,
        )
    })
}

async fn prepare(session: &Session, statement: String) -> IsotopeResult<PreparedStatement> {
    session
        .prepare(statement)
        .await
        .map_err(|e| driver_error("Statement preparation failed", e))
}

fn cas_failure(collection: &str, id: &str, expected: i64, stored: Option<i64>) -> IsotopeError {
    match stored {
        Some(stored) => version_conflict(collection, id, expected, stored),
        None => not_found(collection, id),
    }
}

fn not_found(collection: &str, id: &str) -> IsotopeError {
    IsotopeError::not_found(&format!("No document '{}' in '{}'", id, collection))
}

fn no_match(collection: &str) -> IsotopeError {
    IsotopeError::not_found(&format!("No document in '{}' matches the filter", collection))
}

fn version_conflict(collection: &str, id: &str, expected: i64, stored: i64) -> IsotopeError {
    IsotopeError::version_conflict(&format!(
        "Version conflict on '{}/{}': expected {}, stored {}",
        collection, id, expected, stored
    ))
}

pub(crate) fn driver_error(context: &str, error: impl std::fmt::Display) -> IsotopeError {
    IsotopeError::new_with_cause(
        context,
        ErrorKind::Transient,
        IsotopeError::transient(&error.to_string()),
    )
}

fn decode_error(context: &str, error: impl std::fmt::Display) -> IsotopeError {
    IsotopeError::new_with_cause(
        context,
        ErrorKind::ValidationFailed,
        IsotopeError::validation_failed(&error.to_string()),
    )
}
