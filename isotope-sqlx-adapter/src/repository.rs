use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::warn;
use sqlx::any::{install_default_drivers, AnyArguments, AnyPoolOptions, AnyRow};
use sqlx::{Any, AnyConnection, AnyPool, Row, Transaction};
use tokio::sync::Mutex;

use isotope::aggregate::{Accumulator, GroupSpec, PipelineStage};
use isotope::common::constants::FIELD_ID;
use isotope::common::{data_from_json_text, data_to_json_text, value_from_json, DocumentData, Value};
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

use crate::config::SqlxConfig;
use crate::dialect::Dialect;
use crate::statements::{Sql, SqlParam};

/// The relational backend, one implementation for all three dialects.
///
/// Plain compare-and-set mutations read the current row, patch the payload
/// client-side, and write back conditioned on the expected version; zero
/// affected rows disambiguates into NotFound or VersionConflict with a
/// follow-up read. The find-and-mutate family and the multi-row mutations
/// run inside a driver transaction holding `SELECT … FOR UPDATE` locks, so
/// a pooled connection stays pinned for the operation's duration.
pub struct SqlxRepository {
    pool: AnyPool,
    dialect: Dialect,
    sql: Sql,
    publisher: Option<Arc<ChangeEventPublisher>>,
}

impl SqlxRepository {
    /// Connects and creates the backing tables when missing.
    pub async fn connect(config: SqlxConfig) -> IsotopeResult<SqlxRepository> {
        SqlxRepository::open(config, None).await
    }

    /// Connects and hands every committed change to the given publisher.
    pub async fn connect_with_publisher(
        config: SqlxConfig,
        publisher: Arc<ChangeEventPublisher>,
    ) -> IsotopeResult<SqlxRepository> {
        SqlxRepository::open(config, Some(publisher)).await
    }

    async fn open(
        config: SqlxConfig,
        publisher: Option<Arc<ChangeEventPublisher>>,
    ) -> IsotopeResult<SqlxRepository> {
        config.validate()?;
        let dialect = Dialect::from_url(config.url())?;
        install_default_drivers();
        let pool = AnyPoolOptions::new()
            .max_connections(config.max_connections_value())
            .connect(config.url())
            .await
            .map_err(|e| driver_error("Failed to connect to the database", e))?;

        let sql = Sql::new(dialect);
        for ddl in [sql.documents_ddl(), sql.catalog_ddl(), sql.index_registry_ddl()] {
            sqlx::query(&ddl)
                .execute(&pool)
                .await
                .map_err(|e| driver_error("Schema setup failed", e))?;
        }
        Ok(SqlxRepository {
            pool,
            dialect,
            sql,
            publisher,
        })
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
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

    async fn begin(&self) -> IsotopeResult<Transaction<'static, Any>> {
        self.pool
            .begin()
            .await
            .map_err(|e| driver_error("Failed to start a transaction", e))
    }

    async fn commit(&self, tx: Transaction<'static, Any>) -> IsotopeResult<()> {
        tx.commit()
            .await
            .map_err(|e| driver_error("Transaction commit failed", e))
    }

    async fn update_many_inner(
        &self,
        collection: &str,
        filter: &Filter,
        update: &DocumentData,
    ) -> IsotopeResult<(u64, Vec<ChangeEvent>)> {
        validate::collection_name(collection)?;
        validate::broad_mutation_filter(filter, "UpdateMany")?;
        validate::update_payload(update)?;

        let mut tx = self.begin().await?;
        let (sql, params) = self.sql.select_many_locked(collection, filter)?;
        let matched = fetch_documents(&mut tx, collection, &sql, &params).await?;

        let now = Utc::now();
        let mut events = Vec::with_capacity(matched.len());
        let mut count = 0;
        for document in &matched {
            let mut data = document.data().clone();
            translate::apply_update(&mut data, update);
            write_back(&mut tx, &self.sql, document, &data, now).await?;
            count += 1;
            let post = Document::from_stored(
                document.id().to_string(),
                collection.to_string(),
                data,
                document.version() + 1,
                document.created_at(),
                now,
            );
            events.push(ChangeEvent::updated(&post));
        }
        self.commit(tx).await?;
        Ok((count, events))
    }

    async fn delete_many_inner(
        &self,
        collection: &str,
        filter: &Filter,
    ) -> IsotopeResult<(u64, Vec<ChangeEvent>)> {
        validate::collection_name(collection)?;
        validate::broad_mutation_filter(filter, "DeleteMany")?;

        let mut tx = self.begin().await?;
        let (sql, params) = self.sql.select_many_locked(collection, filter)?;
        let matched = fetch_documents(&mut tx, collection, &sql, &params).await?;

        let delete_sql = self.sql.cas_delete();
        let mut events = Vec::with_capacity(matched.len());
        let mut count = 0;
        for document in &matched {
            let params = [
                SqlParam::Str(collection.to_string()),
                SqlParam::Str(document.id().to_string()),
                SqlParam::I64(document.version()),
            ];
            bind_params(&delete_sql, &params)
                .execute(&mut *tx)
                .await
                .map_err(|e| driver_error("Delete failed", e))?;
            count += 1;
            events.push(ChangeEvent::deleted(collection, document.id(), document.version()));
        }
        self.commit(tx).await?;
        Ok((count, events))
    }

    async fn find_and_update_inner(
        &self,
        collection: &str,
        filter: &Filter,
        update: &DocumentData,
    ) -> IsotopeResult<(Document, ChangeEvent)> {
        validate::collection_name(collection)?;
        validate::filter_fields(filter)?;
        validate::update_payload(update)?;

        let mut tx = self.begin().await?;
        let (updated, event) = find_and_update_on(&mut tx, &self.sql, collection, filter, update).await?;
        self.commit(tx).await?;
        Ok((updated, event))
    }

    async fn find_one_and_replace_inner(
        &self,
        collection: &str,
        filter: &Filter,
        data: &DocumentData,
    ) -> IsotopeResult<(Document, ChangeEvent)> {
        validate::collection_name(collection)?;
        validate::filter_fields(filter)?;

        let mut tx = self.begin().await?;
        let locked = lock_one(&mut tx, &self.sql, collection, filter).await?;
        let document = locked.ok_or_else(|| no_match(collection))?;
        let now = Utc::now();
        write_back(&mut tx, &self.sql, &document, data, now).await?;
        self.commit(tx).await?;

        let replaced = Document::from_stored(
            document.id().to_string(),
            collection.to_string(),
            data.clone(),
            document.version() + 1,
            document.created_at(),
            now,
        );
        let event = ChangeEvent::replaced(&replaced);
        Ok((replaced, event))
    }

    async fn find_one_and_delete_inner(
        &self,
        collection: &str,
        filter: &Filter,
    ) -> IsotopeResult<(Document, ChangeEvent)> {
        validate::collection_name(collection)?;
        validate::filter_fields(filter)?;

        let mut tx = self.begin().await?;
        let locked = lock_one(&mut tx, &self.sql, collection, filter).await?;
        let document = locked.ok_or_else(|| no_match(collection))?;
        let delete_sql = self.sql.cas_delete();
        let params = [
            SqlParam::Str(collection.to_string()),
            SqlParam::Str(document.id().to_string()),
            SqlParam::I64(document.version()),
        ];
        bind_params(&delete_sql, &params)
            .execute(&mut *tx)
            .await
            .map_err(|e| driver_error("Delete failed", e))?;
        self.commit(tx).await?;

        let event = ChangeEvent::deleted(collection, document.id(), document.version());
        Ok((document, event))
    }

    async fn upsert_inner(
        &self,
        collection: &str,
        filter: &Filter,
        update: &DocumentData,
    ) -> IsotopeResult<(Document, ChangeEvent)> {
        let mut tx = self.begin().await?;
        let (document, event) = upsert_on(&mut tx, &self.sql, collection, filter, update).await?;
        self.commit(tx).await?;
        Ok((document, event))
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
                match self.save(document).await {
                    Ok(_) => result.record_inserted(1),
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
                    match self.update_many_inner(&collection, &filter, &update).await {
                        Ok((count, new_events)) => {
                            result.record_matched(count);
                            result.record_modified(count);
                            events.extend(new_events);
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
            } => match self.find_one_and_replace_inner(&collection, &filter, &data).await {
                Ok((_, event)) => {
                    result.record_matched(1);
                    result.record_modified(1);
                    events.push(event);
                }
                Err(error) if error.kind() == &ErrorKind::NotFound && upsert => {
                    let document = translate::upsert_document(&collection, &filter, &DocumentData::new())
                        .with_data(data);
                    match self.save(document).await {
                        Ok(saved) => {
                            result.record_upserted(index, saved.id().to_string());
                        }
                        Err(error) => result.record_error(index, error),
                    }
                }
                Err(error) if error.kind() == &ErrorKind::NotFound => {}
                Err(error) => result.record_error(index, error),
            },
            BulkOperation::Delete {
                collection,
                filter,
                multi,
            } => {
                if multi {
                    match self.delete_many_inner(&collection, &filter).await {
                        Ok((count, new_events)) => {
                            result.record_deleted(count);
                            events.extend(new_events);
                        }
                        Err(error) => result.record_error(index, error),
                    }
                } else {
                    match self.find_one_and_delete_inner(&collection, &filter).await {
                        Ok((_, event)) => {
                            result.record_deleted(1);
                            events.push(event);
                        }
                        Err(error) if error.kind() == &ErrorKind::NotFound => {}
                        Err(error) => result.record_error(index, error),
                    }
                }
            }
        }
    }
}

#[async_trait]
impl RepositoryProvider for SqlxRepository {
    fn backend(&self) -> BackendKind {
        self.dialect.backend_kind()
    }

    async fn save(&self, document: Document) -> IsotopeResult<Document> {
        let mut conn = acquire(&self.pool).await?;
        let (saved, event) = save_on(&mut conn, &self.sql, document).await?;
        self.publish(event);
        Ok(saved)
    }

    async fn save_many(&self, documents: Vec<Document>) -> IsotopeResult<Vec<Document>> {
        for document in &documents {
            validate::unsaved_document(document)?;
        }
        // row-by-row: SQL has no partial-success batch insert, and earlier
        // rows stay inserted when a later one fails
        let mut conn = acquire(&self.pool).await?;
        let mut saved = Vec::with_capacity(documents.len());
        for document in documents {
            let (document, event) = save_on(&mut conn, &self.sql, document).await?;
            self.publish(event);
            saved.push(document);
        }
        Ok(saved)
    }

    async fn find_by_id(&self, collection: &str, id: &str) -> IsotopeResult<Document> {
        validate::collection_name(collection)?;
        validate::document_id(id)?;
        let mut conn = acquire(&self.pool).await?;
        let found = fetch_by_id(&mut conn, &self.sql, collection, id, false).await?;
        found.ok_or_else(|| not_found(collection, id))
    }

    async fn find_all(&self, collection: &str) -> IsotopeResult<Vec<Document>> {
        validate::collection_name(collection)?;
        let (sql, params) = self
            .sql
            .select_filtered(collection, &Filter::empty(), &FindOptions::new())?;
        let mut conn = acquire(&self.pool).await?;
        fetch_documents(&mut conn, collection, &sql, &params).await
    }

    async fn find_with_options(
        &self,
        collection: &str,
        filter: &Filter,
        options: &FindOptions,
    ) -> IsotopeResult<Vec<Document>> {
        validate::collection_name(collection)?;
        validate::filter_fields(filter)?;
        let (sql, params) = self.sql.select_filtered(collection, filter, options)?;
        let mut conn = acquire(&self.pool).await?;
        let documents = fetch_documents(&mut conn, collection, &sql, &params).await?;
        Ok(match &options.projection {
            Some(fields) => documents
                .into_iter()
                .map(|doc| {
                    let projected = translate::apply_projection(doc.data(), fields);
                    doc.with_data(projected)
                })
                .collect(),
            None => documents,
        })
    }

    async fn update(
        &self,
        collection: &str,
        id: &str,
        expected_version: i64,
        update: &DocumentData,
    ) -> IsotopeResult<Document> {
        let mut conn = acquire(&self.pool).await?;
        let (updated, event) =
            update_on(&mut conn, &self.sql, collection, id, expected_version, update).await?;
        self.publish(event);
        Ok(updated)
    }

    async fn update_many(
        &self,
        collection: &str,
        filter: &Filter,
        update: &DocumentData,
    ) -> IsotopeResult<u64> {
        let (count, events) = self.update_many_inner(collection, filter, update).await?;
        self.publish_all(events);
        Ok(count)
    }

    async fn replace(&self, document: &Document) -> IsotopeResult<Document> {
        let mut conn = acquire(&self.pool).await?;
        let (replaced, event) = replace_on(&mut conn, &self.sql, document).await?;
        self.publish(event);
        Ok(replaced)
    }

    async fn delete(&self, collection: &str, id: &str, expected_version: i64) -> IsotopeResult<()> {
        let mut conn = acquire(&self.pool).await?;
        let event = delete_on(&mut conn, &self.sql, collection, id, expected_version).await?;
        self.publish(event);
        Ok(())
    }

    async fn delete_many(&self, collection: &str, filter: &Filter) -> IsotopeResult<u64> {
        let (count, events) = self.delete_many_inner(collection, filter).await?;
        self.publish_all(events);
        Ok(count)
    }

    async fn find_and_update(
        &self,
        collection: &str,
        filter: &Filter,
        update: &DocumentData,
    ) -> IsotopeResult<Document> {
        let (updated, event) = self.find_and_update_inner(collection, filter, update).await?;
        self.publish(event);
        Ok(updated)
    }

    async fn find_one_and_replace(
        &self,
        collection: &str,
        filter: &Filter,
        data: &DocumentData,
    ) -> IsotopeResult<Document> {
        let (replaced, event) = self
            .find_one_and_replace_inner(collection, filter, data)
            .await?;
        self.publish(event);
        Ok(replaced)
    }

    async fn find_one_and_delete(&self, collection: &str, filter: &Filter) -> IsotopeResult<Document> {
        let (removed, event) = self.find_one_and_delete_inner(collection, filter).await?;
        self.publish(event);
        Ok(removed)
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
        let (document, event) = self.upsert_inner(collection, filter, update).await?;
        self.publish(event);
        Ok(document)
    }

    async fn aggregate(
        &self,
        collection: &str,
        pipeline: &[PipelineStage],
    ) -> IsotopeResult<Vec<DocumentData>> {
        validate::collection_name(collection)?;
        match plan_pipeline(pipeline)? {
            Plan::Find {
                filter,
                sort,
                skip,
                limit,
            } => {
                let mut options = FindOptions::new();
                for (field, order) in sort {
                    options = options.sort_by(&field, order);
                }
                if let Some(skip) = skip {
                    options = options.skip(skip);
                }
                if let Some(limit) = limit {
                    options = options.limit(limit);
                }
                let (sql, params) = self.sql.select_filtered(collection, &filter, &options)?;
                let mut conn = acquire(&self.pool).await?;
                let documents = fetch_documents(&mut conn, collection, &sql, &params).await?;
                Ok(documents.iter().map(translate::document_row).collect())
            }
            Plan::Grouped { filter, spec } => {
                let (sql, params) = self.sql.group_select(collection, &filter, &spec)?;
                let mut conn = acquire(&self.pool).await?;
                let rows = bind_params(&sql, &params)
                    .fetch_all(&mut *conn)
                    .await
                    .map_err(|e| driver_error("Aggregation failed", e))?;
                rows.iter().map(|row| decode_group_row(row, &spec)).collect()
            }
        }
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
        let (sql, params) = self.sql.distinct_field(collection, field, filter)?;
        let mut conn = acquire(&self.pool).await?;
        let rows = bind_params(&sql, &params)
            .fetch_all(&mut *conn)
            .await
            .map_err(|e| driver_error("Distinct failed", e))?;

        let mut values = Vec::with_capacity(rows.len());
        for row in rows {
            let text: String = row
                .try_get(0)
                .map_err(|e| driver_error("Distinct decode failed", e))?;
            if field == FIELD_ID {
                values.push(Value::String(text));
            } else {
                values.push(parse_json_value(&text)?);
            }
        }
        Ok(values)
    }

    async fn count(&self, collection: &str, filter: &Filter) -> IsotopeResult<u64> {
        validate::collection_name(collection)?;
        validate::filter_fields(filter)?;
        let (sql, params) = self.sql.count_filtered(collection, filter)?;
        let mut conn = acquire(&self.pool).await?;
        let row = bind_params(&sql, &params)
            .fetch_one(&mut *conn)
            .await
            .map_err(|e| driver_error("Count failed", e))?;
        let count: i64 = row
            .try_get(0)
            .map_err(|e| driver_error("Count decode failed", e))?;
        Ok(count.max(0) as u64)
    }

    async fn bulk_write(&self, operations: Vec<BulkOperation>) -> IsotopeResult<BulkResult> {
        let mut result = BulkResult::new();
        let mut events = Vec::new();
        for (index, operation) in operations.into_iter().enumerate() {
            self.apply_bulk_operation(index, operation, &mut result, &mut events)
                .await;
        }
        self.publish_all(events);
        Ok(result)
    }

    async fn create_index(&self, collection: &str, model: IndexModel) -> IsotopeResult<String> {
        validate::collection_name(collection)?;
        for key in model.keys() {
            validate::field_name(&key.field)?;
        }
        if model.keys().is_empty() {
            return Err(IsotopeError::invalid_argument(
                "An index needs at least one key",
            ));
        }
        if model.options().text {
            return Err(IsotopeError::unsupported(
                "the relational adapter cannot build text indexes",
            ));
        }
        if model.options().ttl_seconds.is_some() {
            return Err(IsotopeError::unsupported(
                "the relational adapter cannot expire documents by TTL",
            ));
        }
        if model.options().partial_filter.is_some() {
            return Err(IsotopeError::unsupported(
                "the relational adapter cannot build partial-filter indexes",
            ));
        }
        if model.options().unique && !self.dialect.supports_expression_indexes() {
            return Err(IsotopeError::unsupported(
                "MySQL cannot enforce unique indexes over the JSON payload column",
            ));
        }
        let name = model.resolve_name(collection);
        validate::collection_name(&name)?;

        let definition = serde_json::to_string(&model).map_err(|e| {
            IsotopeError::new(
                &format!("Index definition failed to serialize: {}", e),
                ErrorKind::ValidationFailed,
            )
        })?;

        let mut tx = self.begin().await?;
        let insert = self.sql.insert_index();
        let params = [
            SqlParam::Str(collection.to_string()),
            SqlParam::Str(name.clone()),
            SqlParam::Str(definition),
        ];
        bind_params(&insert, &params)
            .execute(&mut *tx)
            .await
            .map_err(|error| {
                if is_unique_violation(&error) {
                    IsotopeError::validation_failed(&format!(
                        "an index named '{}' already exists on '{}'",
                        name, collection
                    ))
                } else {
                    driver_error("Index registration failed", error)
                }
            })?;
        if let Some(ddl) = self.sql.native_index_ddl(collection, &name, &model) {
            sqlx::query(&ddl)
                .execute(&mut *tx)
                .await
                .map_err(|e| driver_error("Index creation failed", e))?;
        }
        self.commit(tx).await?;
        Ok(name)
    }

    async fn drop_index(&self, collection: &str, name: &str) -> IsotopeResult<()> {
        validate::collection_name(collection)?;
        validate::collection_name(name)?;
        let mut tx = self.begin().await?;
        let delete = self.sql.delete_index();
        let params = [
            SqlParam::Str(collection.to_string()),
            SqlParam::Str(name.to_string()),
        ];
        let result = bind_params(&delete, &params)
            .execute(&mut *tx)
            .await
            .map_err(|e| driver_error("Index drop failed", e))?;
        if result.rows_affected() == 0 {
            return Err(IsotopeError::not_found(&format!(
                "No index '{}' on '{}'",
                name, collection
            )));
        }
        if let Some(drop) = self.sql.drop_native_index(name) {
            sqlx::query(&drop)
                .execute(&mut *tx)
                .await
                .map_err(|e| driver_error("Index drop failed", e))?;
        }
        self.commit(tx).await
    }

    async fn list_indexes(&self, collection: &str) -> IsotopeResult<Vec<IndexModel>> {
        validate::collection_name(collection)?;
        let sql = self.sql.list_indexes();
        let params = [SqlParam::Str(collection.to_string())];
        let mut conn = acquire(&self.pool).await?;
        let rows = bind_params(&sql, &params)
            .fetch_all(&mut *conn)
            .await
            .map_err(|e| driver_error("Index listing failed", e))?;

        let mut models = Vec::with_capacity(rows.len());
        for row in rows {
            let definition: String = row
                .try_get(0)
                .map_err(|e| driver_error("Index listing decode failed", e))?;
            let model: IndexModel = serde_json::from_str(&definition).map_err(|e| {
                IsotopeError::new(
                    &format!("Stored index definition is not valid: {}", e),
                    ErrorKind::ValidationFailed,
                )
            })?;
            models.push(model);
        }
        Ok(models)
    }

    async fn create_collection(&self, name: &str) -> IsotopeResult<()> {
        validate::collection_name(name)?;
        let sql = self.sql.insert_collection();
        let params = [SqlParam::Str(name.to_string())];
        let mut conn = acquire(&self.pool).await?;
        match bind_params(&sql, &params).execute(&mut *conn).await {
            Ok(_) => Ok(()),
            Err(error) if is_unique_violation(&error) => Ok(()),
            Err(error) => Err(driver_error("Collection creation failed", error)),
        }
    }

    async fn drop_collection(&self, name: &str) -> IsotopeResult<()> {
        validate::collection_name(name)?;
        // native indexes must go before their registry rows
        let indexes = self.list_indexes(name).await?;
        let mut tx = self.begin().await?;
        for model in &indexes {
            if let Some(drop) = self.sql.drop_native_index(&model.resolve_name(name)) {
                sqlx::query(&drop)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| driver_error("Collection drop failed", e))?;
            }
        }
        for (sql, params) in [
            (self.sql.delete_collection_documents(), vec![SqlParam::Str(name.to_string())]),
            (self.sql.delete_collection_indexes(), vec![SqlParam::Str(name.to_string())]),
            (self.sql.delete_collection(), vec![SqlParam::Str(name.to_string())]),
        ] {
            bind_params(&sql, &params)
                .execute(&mut *tx)
                .await
                .map_err(|e| driver_error("Collection drop failed", e))?;
        }
        self.commit(tx).await
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

        let mut tx = self.begin().await?;
        let rename_params = [
            SqlParam::Str(new_name.to_string()),
            SqlParam::Str(old_name.to_string()),
        ];
        for sql in [
            self.sql.rename_in(crate::statements::DOCUMENTS_TABLE, "collection"),
            self.sql.rename_in(crate::statements::INDEX_TABLE, "collection"),
        ] {
            bind_params(&sql, &rename_params)
                .execute(&mut *tx)
                .await
                .map_err(|e| driver_error("Collection rename failed", e))?;
        }
        let delete = self.sql.delete_collection();
        bind_params(&delete, &[SqlParam::Str(old_name.to_string())])
            .execute(&mut *tx)
            .await
            .map_err(|e| driver_error("Collection rename failed", e))?;
        let insert = self.sql.insert_collection();
        bind_params(&insert, &[SqlParam::Str(new_name.to_string())])
            .execute(&mut *tx)
            .await
            .map_err(|e| driver_error("Collection rename failed", e))?;
        self.commit(tx).await
    }

    async fn list_collections(&self) -> IsotopeResult<Vec<String>> {
        let sql = self.sql.list_collections();
        let mut conn = acquire(&self.pool).await?;
        let rows = sqlx::query(&sql)
            .fetch_all(&mut *conn)
            .await
            .map_err(|e| driver_error("Collection listing failed", e))?;
        rows.iter()
            .map(|row| {
                row.try_get(0)
                    .map_err(|e| driver_error("Collection listing decode failed", e))
            })
            .collect()
    }

    async fn collection_exists(&self, name: &str) -> IsotopeResult<bool> {
        validate::collection_name(name)?;
        let sql = self.sql.collection_exists();
        let params = [
            SqlParam::Str(name.to_string()),
            SqlParam::Str(name.to_string()),
        ];
        let mut conn = acquire(&self.pool).await?;
        let row = bind_params(&sql, &params)
            .fetch_one(&mut *conn)
            .await
            .map_err(|e| driver_error("Collection lookup failed", e))?;
        let hits: i64 = row
            .try_get(0)
            .map_err(|e| driver_error("Collection lookup decode failed", e))?;
        Ok(hits > 0)
    }

    async fn with_transaction(&self, func: TransactionFunc) -> IsotopeResult<()> {
        let tx = self.begin().await?;
        let provider = Arc::new(SqlxTransactionScope {
            sql: Sql::new(self.dialect),
            state: Mutex::new(ScopeState {
                tx: Some(tx),
                events: Vec::new(),
            }),
        });
        let scope = TransactionScope::from_arc(provider.clone());
        let result = func(&scope).await;

        let mut state = provider.state.lock().await;
        let tx = state
            .tx
            .take()
            .ok_or_else(|| IsotopeError::transient("transaction already completed"))?;
        match result {
            Ok(()) => {
                tx.commit()
                    .await
                    .map_err(|e| driver_error("Transaction commit failed", e))?;
                let events = std::mem::take(&mut state.events);
                drop(state);
                self.publish_all(events);
                Ok(())
            }
            Err(error) => {
                if let Err(rollback_error) = tx.rollback().await {
                    warn!("failed to roll back transaction: {}", rollback_error);
                }
                Err(error)
            }
        }
    }

    async fn health_check(&self) -> IsotopeResult<()> {
        sqlx::query(self.sql.health_check())
            .execute(&self.pool)
            .await
            .map_err(|e| driver_error("Database is unreachable", e))?;
        Ok(())
    }
}

struct ScopeState {
    tx: Option<Transaction<'static, Any>>,
    events: Vec<ChangeEvent>,
}

/// Transaction scope pinned to one driver transaction.
///
/// The transaction rolls back on drop if the closure never completes;
/// buffered change events reach the publisher only after the commit.
struct SqlxTransactionScope {
    sql: Sql,
    state: Mutex<ScopeState>,
}

impl SqlxTransactionScope {
    fn connection<'a>(
        state: &'a mut ScopeState,
    ) -> IsotopeResult<(&'a mut AnyConnection, &'a mut Vec<ChangeEvent>)> {
        let ScopeState { tx, events } = state;
        let tx = tx
            .as_mut()
            .ok_or_else(|| IsotopeError::transient("transaction already completed"))?;
        Ok((&mut **tx, events))
    }
}

#[async_trait]
impl TransactionScopeProvider for SqlxTransactionScope {
    async fn save(&self, document: Document) -> IsotopeResult<Document> {
        let mut state = self.state.lock().await;
        let (conn, events) = SqlxTransactionScope::connection(&mut state)?;
        let (saved, event) = save_on(conn, &self.sql, document).await?;
        events.push(event);
        Ok(saved)
    }

    async fn find_by_id(&self, collection: &str, id: &str) -> IsotopeResult<Document> {
        validate::collection_name(collection)?;
        validate::document_id(id)?;
        let mut state = self.state.lock().await;
        let (conn, _) = SqlxTransactionScope::connection(&mut state)?;
        let found = fetch_by_id(conn, &self.sql, collection, id, false).await?;
        found.ok_or_else(|| not_found(collection, id))
    }

    async fn update(
        &self,
        collection: &str,
        id: &str,
        expected_version: i64,
        update: &DocumentData,
    ) -> IsotopeResult<Document> {
        let mut state = self.state.lock().await;
        let (conn, events) = SqlxTransactionScope::connection(&mut state)?;
        let (updated, event) =
            update_on(conn, &self.sql, collection, id, expected_version, update).await?;
        events.push(event);
        Ok(updated)
    }

    async fn replace(&self, document: &Document) -> IsotopeResult<Document> {
        let mut state = self.state.lock().await;
        let (conn, events) = SqlxTransactionScope::connection(&mut state)?;
        let (replaced, event) = replace_on(conn, &self.sql, document).await?;
        events.push(event);
        Ok(replaced)
    }

    async fn delete(&self, collection: &str, id: &str, expected_version: i64) -> IsotopeResult<()> {
        let mut state = self.state.lock().await;
        let (conn, events) = SqlxTransactionScope::connection(&mut state)?;
        let event = delete_on(conn, &self.sql, collection, id, expected_version).await?;
        events.push(event);
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
        let mut state = self.state.lock().await;
        let (conn, events) = SqlxTransactionScope::connection(&mut state)?;
        let (document, event) = upsert_on(conn, &self.sql, collection, filter, update).await?;
        events.push(event);
        Ok(document)
    }
}

#[derive(Debug)]
enum Plan {
    Find {
        filter: Filter,
        sort: Vec<(String, isotope::common::SortOrder)>,
        skip: Option<u64>,
        limit: Option<u64>,
    },
    Grouped {
        filter: Filter,
        spec: GroupSpec,
    },
}

/// Folds the pipeline into one SELECT. The renderable grammar is
/// `Match? Sort? Skip? Limit?` or `Match? Group`; anything else answers
/// `Unsupported` naming the stage.
fn plan_pipeline(stages: &[PipelineStage]) -> IsotopeResult<Plan> {
    let mut stages = stages.iter().peekable();

    let mut filter = Filter::empty();
    if let Some(PipelineStage::Match(f)) = stages.peek() {
        filter = f.clone();
        stages.next();
    }
    if let Some(PipelineStage::Group(spec)) = stages.peek() {
        let spec = spec.clone();
        stages.next();
        if let Some(stage) = stages.next() {
            return Err(unsupported_stage(stage, "after a Group stage"));
        }
        return Ok(Plan::Grouped { filter, spec });
    }

    let mut sort = Vec::new();
    if let Some(PipelineStage::Sort(sort_by)) = stages.peek() {
        sort = sort_by.clone();
        stages.next();
    }
    let mut skip = None;
    if let Some(PipelineStage::Skip(n)) = stages.peek() {
        skip = Some(*n);
        stages.next();
    }
    let mut limit = None;
    if let Some(PipelineStage::Limit(n)) = stages.peek() {
        limit = Some(*n);
        stages.next();
    }
    if let Some(stage) = stages.next() {
        return Err(unsupported_stage(stage, "at this position"));
    }
    Ok(Plan::Find {
        filter,
        sort,
        skip,
        limit,
    })
}

fn unsupported_stage(stage: &PipelineStage, position: &str) -> IsotopeError {
    IsotopeError::unsupported(&format!(
        "the relational adapter cannot render a {} stage {}",
        stage.name(),
        position
    ))
}

fn decode_group_row(row: &AnyRow, spec: &GroupSpec) -> IsotopeResult<DocumentData> {
    let mut data = DocumentData::new();
    let mut column = 0;
    if let Some(field) = spec.by() {
        let key: Option<String> = row
            .try_get(column)
            .map_err(|e| driver_error("Aggregation decode failed", e))?;
        let value = match key {
            Some(text) if field == FIELD_ID => Value::String(text),
            Some(text) => parse_json_value(&text)?,
            None => Value::Null,
        };
        data.insert(field.to_string(), value);
        column += 1;
    }
    for (name, accumulator) in spec.accumulators() {
        let value = match accumulator {
            Accumulator::Count => {
                let count: i64 = row
                    .try_get(column)
                    .map_err(|e| driver_error("Aggregation decode failed", e))?;
                Value::I64(count)
            }
            Accumulator::Sum(_) => {
                let total: f64 = row
                    .try_get(column)
                    .map_err(|e| driver_error("Aggregation decode failed", e))?;
                Value::F64(total)
            }
            Accumulator::Avg(_) | Accumulator::Min(_) | Accumulator::Max(_) => {
                let value: Option<f64> = row
                    .try_get(column)
                    .map_err(|e| driver_error("Aggregation decode failed", e))?;
                value.map(Value::F64).unwrap_or(Value::Null)
            }
        };
        data.insert(name.clone(), value);
        column += 1;
    }
    Ok(data)
}

fn parse_json_value(text: &str) -> IsotopeResult<Value> {
    let json: serde_json::Value = serde_json::from_str(text).map_err(|e| {
        IsotopeError::new(
            &format!("Stored value is not valid JSON: {}", e),
            ErrorKind::ValidationFailed,
        )
    })?;
    Ok(value_from_json(json))
}

async fn acquire(pool: &AnyPool) -> IsotopeResult<sqlx::pool::PoolConnection<Any>> {
    pool.acquire()
        .await
        .map_err(|e| driver_error("Failed to acquire a connection", e))
}

fn bind_params<'q>(
    sql: &'q str,
    params: &'q [SqlParam],
) -> sqlx::query::Query<'q, Any, AnyArguments<'q>> {
    let mut query = sqlx::query(sql);
    for param in params {
        query = match param {
            SqlParam::Str(s) => query.bind(s.as_str()),
            SqlParam::I64(v) => query.bind(*v),
            SqlParam::F64(v) => query.bind(*v),
        };
    }
    query
}

fn decode_row(collection: &str, row: &AnyRow) -> IsotopeResult<Document> {
    let id: String = row
        .try_get(0)
        .map_err(|e| driver_error("Stored row decode failed", e))?;
    let data: String = row
        .try_get(1)
        .map_err(|e| driver_error("Stored row decode failed", e))?;
    let version: i64 = row
        .try_get(2)
        .map_err(|e| driver_error("Stored row decode failed", e))?;
    let created_at: i64 = row
        .try_get(3)
        .map_err(|e| driver_error("Stored row decode failed", e))?;
    let updated_at: i64 = row
        .try_get(4)
        .map_err(|e| driver_error("Stored row decode failed", e))?;

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

async fn fetch_documents(
    conn: &mut AnyConnection,
    collection: &str,
    sql: &str,
    params: &[SqlParam],
) -> IsotopeResult<Vec<Document>> {
    let rows = bind_params(sql, params)
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| driver_error("Query failed", e))?;
    rows.iter().map(|row| decode_row(collection, row)).collect()
}

async fn fetch_by_id(
    conn: &mut AnyConnection,
    sql: &Sql,
    collection: &str,
    id: &str,
    for_update: bool,
) -> IsotopeResult<Option<Document>> {
    let statement = sql.select_by_id(for_update);
    let params = [
        SqlParam::Str(collection.to_string()),
        SqlParam::Str(id.to_string()),
    ];
    let row = bind_params(&statement, &params)
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| driver_error("Lookup failed", e))?;
    row.map(|row| decode_row(collection, &row)).transpose()
}

async fn lock_one(
    conn: &mut AnyConnection,
    sql: &Sql,
    collection: &str,
    filter: &Filter,
) -> IsotopeResult<Option<Document>> {
    let (statement, params) = sql.select_one_locked(collection, filter)?;
    let row = bind_params(&statement, &params)
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| driver_error("Locked lookup failed", e))?;
    row.map(|row| decode_row(collection, &row)).transpose()
}

async fn save_on(
    conn: &mut AnyConnection,
    sql: &Sql,
    document: Document,
) -> IsotopeResult<(Document, ChangeEvent)> {
    validate::unsaved_document(&document)?;
    let stored = document.into_first_version(Utc::now());
    insert_stored(conn, sql, &stored).await?;
    let event = ChangeEvent::created(&stored);
    Ok((stored, event))
}

async fn insert_stored(
    conn: &mut AnyConnection,
    sql: &Sql,
    stored: &Document,
) -> IsotopeResult<()> {
    let statement = sql.insert_document();
    let params = [
        SqlParam::Str(stored.collection().to_string()),
        SqlParam::Str(stored.id().to_string()),
        SqlParam::Str(data_to_json_text(stored.data())),
        SqlParam::I64(stored.version()),
        SqlParam::I64(stored.created_at().timestamp_millis()),
        SqlParam::I64(stored.updated_at().timestamp_millis()),
    ];
    bind_params(&statement, &params)
        .execute(&mut *conn)
        .await
        .map_err(|error| {
            if is_unique_violation(&error) {
                IsotopeError::validation_failed(&format!(
                    "A document with id '{}' already exists in '{}'",
                    stored.id(),
                    stored.collection()
                ))
            } else {
                driver_error("Insert failed", error)
            }
        })?;
    Ok(())
}

/// Writes a new payload over a row whose current version is known, bumping
/// the version. Callers either hold the row lock or own the CAS check.
async fn write_back(
    conn: &mut AnyConnection,
    sql: &Sql,
    current: &Document,
    data: &DocumentData,
    now: DateTime<Utc>,
) -> IsotopeResult<u64> {
    let statement = sql.cas_update();
    let params = [
        SqlParam::Str(data_to_json_text(data)),
        SqlParam::I64(now.timestamp_millis()),
        SqlParam::Str(current.collection().to_string()),
        SqlParam::Str(current.id().to_string()),
        SqlParam::I64(current.version()),
    ];
    let result = bind_params(&statement, &params)
        .execute(&mut *conn)
        .await
        .map_err(|e| driver_error("Update failed", e))?;
    Ok(result.rows_affected())
}

async fn update_on(
    conn: &mut AnyConnection,
    sql: &Sql,
    collection: &str,
    id: &str,
    expected_version: i64,
    update: &DocumentData,
) -> IsotopeResult<(Document, ChangeEvent)> {
    validate::collection_name(collection)?;
    validate::document_id(id)?;
    validate::expected_version(expected_version)?;
    validate::update_payload(update)?;

    let current = fetch_by_id(conn, sql, collection, id, false)
        .await?
        .ok_or_else(|| not_found(collection, id))?;
    if current.version() != expected_version {
        return Err(version_conflict(collection, id, expected_version, current.version()));
    }

    let mut data = current.data().clone();
    translate::apply_update(&mut data, update);
    let now = Utc::now();
    if write_back(conn, sql, &current, &data, now).await? == 0 {
        return Err(cas_failure(conn, sql, collection, id, expected_version).await);
    }
    let updated = Document::from_stored(
        id.to_string(),
        collection.to_string(),
        data,
        expected_version + 1,
        current.created_at(),
        now,
    );
    let event = ChangeEvent::updated(&updated);
    Ok((updated, event))
}

async fn replace_on(
    conn: &mut AnyConnection,
    sql: &Sql,
    document: &Document,
) -> IsotopeResult<(Document, ChangeEvent)> {
    validate::stored_document(document)?;

    let current = fetch_by_id(conn, sql, document.collection(), document.id(), false)
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

    let now = Utc::now();
    if write_back(conn, sql, &current, document.data(), now).await? == 0 {
        return Err(
            cas_failure(conn, sql, document.collection(), document.id(), document.version()).await,
        );
    }
    let replaced = Document::from_stored(
        document.id().to_string(),
        document.collection().to_string(),
        document.data().clone(),
        document.version() + 1,
        current.created_at(),
        now,
    );
    let event = ChangeEvent::replaced(&replaced);
    Ok((replaced, event))
}

async fn delete_on(
    conn: &mut AnyConnection,
    sql: &Sql,
    collection: &str,
    id: &str,
    expected_version: i64,
) -> IsotopeResult<ChangeEvent> {
    validate::collection_name(collection)?;
    validate::document_id(id)?;
    validate::expected_version(expected_version)?;

    let statement = sql.cas_delete();
    let params = [
        SqlParam::Str(collection.to_string()),
        SqlParam::Str(id.to_string()),
        SqlParam::I64(expected_version),
    ];
    let result = bind_params(&statement, &params)
        .execute(&mut *conn)
        .await
        .map_err(|e| driver_error("Delete failed", e))?;
    if result.rows_affected() == 1 {
        Ok(ChangeEvent::deleted(collection, id, expected_version))
    } else {
        Err(cas_failure(conn, sql, collection, id, expected_version).await)
    }
}

async fn find_and_update_on(
    conn: &mut AnyConnection,
    sql: &Sql,
    collection: &str,
    filter: &Filter,
    update: &DocumentData,
) -> IsotopeResult<(Document, ChangeEvent)> {
    let locked = lock_one(conn, sql, collection, filter).await?;
    let current = locked.ok_or_else(|| no_match(collection))?;
    let mut data = current.data().clone();
    translate::apply_update(&mut data, update);
    let now = Utc::now();
    write_back(conn, sql, &current, &data, now).await?;
    let updated = Document::from_stored(
        current.id().to_string(),
        collection.to_string(),
        data,
        current.version() + 1,
        current.created_at(),
        now,
    );
    let event = ChangeEvent::updated(&updated);
    Ok((updated, event))
}

async fn upsert_on(
    conn: &mut AnyConnection,
    sql: &Sql,
    collection: &str,
    filter: &Filter,
    update: &DocumentData,
) -> IsotopeResult<(Document, ChangeEvent)> {
    match lock_one(conn, sql, collection, filter).await? {
        Some(current) => {
            let mut data = current.data().clone();
            translate::apply_update(&mut data, update);
            let now = Utc::now();
            write_back(conn, sql, &current, &data, now).await?;
            let updated = Document::from_stored(
                current.id().to_string(),
                collection.to_string(),
                data,
                current.version() + 1,
                current.created_at(),
                now,
            );
            let event = ChangeEvent::updated(&updated);
            Ok((updated, event))
        }
        None => {
            let unsaved = translate::upsert_document(collection, filter, update);
            let stored = unsaved.into_first_version(Utc::now());
            insert_stored(conn, sql, &stored).await?;
            let event = ChangeEvent::created(&stored);
            Ok((stored, event))
        }
    }
}

/// Distinguishes a missed compare-and-set: the row may be gone, or live at
/// a different version.
async fn cas_failure(
    conn: &mut AnyConnection,
    sql: &Sql,
    collection: &str,
    id: &str,
    expected_version: i64,
) -> IsotopeError {
    match fetch_by_id(conn, sql, collection, id, false).await {
        Ok(Some(current)) => {
            version_conflict(collection, id, expected_version, current.version())
        }
        Ok(None) => not_found(collection, id),
        Err(error) => error,
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

fn is_unique_violation(error: &sqlx::Error) -> bool {
    matches!(
        error,
        sqlx::Error::Database(db) if matches!(db.kind(), sqlx::error::ErrorKind::UniqueViolation)
    )
}

pub(crate) fn driver_error(context: &str, error: sqlx::Error) -> IsotopeError {
    let kind = match &error {
        sqlx::Error::Database(db) if matches!(db.kind(), sqlx::error::ErrorKind::UniqueViolation) => {
            ErrorKind::ValidationFailed
        }
        sqlx::Error::RowNotFound => ErrorKind::NotFound,
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) | sqlx::Error::TypeNotFound { .. } => {
            ErrorKind::ValidationFailed
        }
        _ => ErrorKind::Transient,
    };
    IsotopeError::new_with_cause(
        context,
        kind.clone(),
        IsotopeError::new(&error.to_string(), kind),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use isotope::common::SortOrder;
    use isotope::filter::field;

    #[test]
    fn test_plan_pipeline_find_grammar() {
        let stages = vec![
            PipelineStage::Match(field("status").eq("done")),
            PipelineStage::Sort(vec![("amount".to_string(), SortOrder::Descending)]),
            PipelineStage::Skip(1),
            PipelineStage::Limit(2),
        ];
        match plan_pipeline(&stages).unwrap() {
            Plan::Find {
                filter,
                sort,
                skip,
                limit,
            } => {
                assert_eq!(filter.conditions().len(), 1);
                assert_eq!(sort.len(), 1);
                assert_eq!(skip, Some(1));
                assert_eq!(limit, Some(2));
            }
            Plan::Grouped { .. } => panic!("expected a find plan"),
        }
    }

    #[test]
    fn test_plan_pipeline_group_grammar() {
        let stages = vec![
            PipelineStage::Match(field("status").eq("done")),
            PipelineStage::Group(
                GroupSpec::by_field("customer").accumulate("n", Accumulator::Count),
            ),
        ];
        assert!(matches!(
            plan_pipeline(&stages).unwrap(),
            Plan::Grouped { .. }
        ));
    }

    #[test]
    fn test_plan_pipeline_rejects_project() {
        let stages = vec![PipelineStage::Project(vec!["name".to_string()])];
        let err = plan_pipeline(&stages).unwrap_err();
        assert_eq!(err.kind(), &ErrorKind::Unsupported);
        assert!(err.message().contains("Project"));
    }

    #[test]
    fn test_plan_pipeline_rejects_stage_after_group() {
        let stages = vec![
            PipelineStage::Group(
                GroupSpec::by_field("customer").accumulate("n", Accumulator::Count),
            ),
            PipelineStage::Limit(5),
        ];
        let err = plan_pipeline(&stages).unwrap_err();
        assert_eq!(err.kind(), &ErrorKind::Unsupported);
        assert!(err.message().contains("Limit"));
    }

    #[test]
    fn test_plan_pipeline_rejects_out_of_order_sort() {
        let stages = vec![
            PipelineStage::Limit(5),
            PipelineStage::Sort(vec![("a".to_string(), SortOrder::Ascending)]),
        ];
        let err = plan_pipeline(&stages).unwrap_err();
        assert_eq!(err.kind(), &ErrorKind::Unsupported);
        assert!(err.message().contains("Sort"));
    }

    #[test]
    fn test_empty_pipeline_plans_as_plain_find() {
        assert!(matches!(
            plan_pipeline(&[]).unwrap(),
            Plan::Find { skip: None, limit: None, .. }
        ));
    }
}
