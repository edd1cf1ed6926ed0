use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use futures::TryStreamExt;
use log::warn;
use mongodb::bson::{doc, Bson};
use mongodb::error::{Error as DriverError, ErrorKind as DriverErrorKind, WriteFailure};
use mongodb::options::{
    ClientOptions, IndexOptions as DriverIndexOptions, ReadPreference, ReturnDocument,
    SelectionCriteria, WriteConcern,
};
use mongodb::{Client, ClientSession, Collection, Database, IndexModel as DriverIndexModel};
use tokio::sync::Mutex;
use uuid::Uuid;

use isotope::aggregate::PipelineStage;
use isotope::common::constants::{FIELD_ID, FIELD_VERSION, INITIAL_VERSION};
use isotope::common::{DocumentData, Value};
use isotope::document::Document;
use isotope::errors::{ErrorKind, IsotopeError, IsotopeResult};
use isotope::event::{ChangeEvent, ChangeEventPublisher};
use isotope::filter::Filter;
use isotope::registry::BackendKind;
use isotope::repository::{
    validate, BulkOperation, BulkResult, FindOptions, IndexKey, IndexModel, IndexOptions,
    RepositoryProvider, TransactionFunc, TransactionScope, TransactionScopeProvider,
};
use isotope::translate;

use crate::codec;
use crate::config::MongoConfig;

// server error codes this adapter branches on
pub(crate) const DUPLICATE_KEY: i32 = 11000;
pub(crate) const NAMESPACE_EXISTS: i32 = 48;
pub(crate) const NAMESPACE_NOT_FOUND: i32 = 26;
pub(crate) const INDEX_NOT_FOUND: i32 = 27;
pub(crate) const NO_REPLICATION_ENABLED: i32 = 76;

/// The MongoDB backend.
///
/// Every compare-and-set mutation is a single `findAndModify` filtering on
/// `_id` and `version`, so the version check and the write happen in one
/// server-side step. Writes carry a majority write concern; transactions
/// bind a driver session.
pub struct MongoRepository {
    client: Client,
    database: Database,
    publisher: Option<Arc<ChangeEventPublisher>>,
}

impl MongoRepository {
    /// Connects to the configured deployment.
    pub async fn connect(config: MongoConfig) -> IsotopeResult<MongoRepository> {
        MongoRepository::open(config, None).await
    }

    /// Connects and hands every committed change to the given publisher.
    pub async fn connect_with_publisher(
        config: MongoConfig,
        publisher: Arc<ChangeEventPublisher>,
    ) -> IsotopeResult<MongoRepository> {
        MongoRepository::open(config, Some(publisher)).await
    }

    async fn open(
        config: MongoConfig,
        publisher: Option<Arc<ChangeEventPublisher>>,
    ) -> IsotopeResult<MongoRepository> {
        config.validate()?;
        let mut options = ClientOptions::parse(config.uri())
            .await
            .map_err(|e| driver_error("Failed to parse the MongoDB connection uri", e))?;
        if let Some(name) = config.app_name_value() {
            options.app_name = Some(name.to_string());
        }
        if let Some(size) = config.max_pool_size_value() {
            options.max_pool_size = Some(size);
        }
        options.write_concern = Some(WriteConcern::majority());
        if config.reads_secondary() {
            options.selection_criteria = Some(SelectionCriteria::ReadPreference(
                ReadPreference::SecondaryPreferred { options: None },
            ));
        }
        let client = Client::with_options(options)
            .map_err(|e| driver_error("Failed to build the MongoDB client", e))?;
        let database = client.database(config.database());
        Ok(MongoRepository {
            client,
            database,
            publisher,
        })
    }

    /// The underlying driver client, for probes and raw access.
    pub fn client(&self) -> &Client {
        &self.client
    }

    fn collection(&self, name: &str) -> Collection<mongodb::bson::Document> {
        self.database.collection(name)
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

    /// Raw escape hatch: runs a native query document against a collection.
    ///
    /// Results are raw stored documents; nothing outside the flat-equality
    /// filter subset goes through the portable contract.
    pub async fn raw_find(
        &self,
        collection: &str,
        query: mongodb::bson::Document,
    ) -> IsotopeResult<Vec<mongodb::bson::Document>> {
        validate::collection_name(collection)?;
        let cursor = self
            .collection(collection)
            .find(query)
            .await
            .map_err(|e| driver_error("Raw find failed", e))?;
        cursor
            .try_collect()
            .await
            .map_err(|e| driver_error("Raw find cursor failed", e))
    }

    /// Raw escape hatch: runs a native aggregation pipeline.
    pub async fn raw_aggregate(
        &self,
        collection: &str,
        pipeline: Vec<mongodb::bson::Document>,
    ) -> IsotopeResult<Vec<mongodb::bson::Document>> {
        validate::collection_name(collection)?;
        let cursor = self
            .collection(collection)
            .aggregate(pipeline)
            .await
            .map_err(|e| driver_error("Raw aggregation failed", e))?;
        cursor
            .try_collect()
            .await
            .map_err(|e| driver_error("Raw aggregation cursor failed", e))
    }

    async fn fetch_matching(
        &self,
        collection: &str,
        filter: &Filter,
    ) -> IsotopeResult<Vec<Document>> {
        let cursor = self
            .collection(collection)
            .find(codec::filter_to_query(filter))
            .await
            .map_err(|e| driver_error("Query failed", e))?;
        let stored: Vec<mongodb::bson::Document> = cursor
            .try_collect()
            .await
            .map_err(|e| driver_error("Query cursor failed", e))?;
        stored
            .into_iter()
            .map(|d| codec::decode_document(collection, d))
            .collect()
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
        let found = self
            .collection(collection)
            .find_one_and_update(
                codec::filter_to_query(filter),
                codec::update_modifications(update, Utc::now()),
            )
            .return_document(ReturnDocument::After)
            .await
            .map_err(|e| driver_error("Atomic update failed", e))?;
        match found {
            Some(stored) => {
                let updated = codec::decode_document(collection, stored)?;
                let event = ChangeEvent::updated(&updated);
                Ok((updated, event))
            }
            None => Err(no_match(collection)),
        }
    }

    async fn find_one_and_replace_inner(
        &self,
        collection: &str,
        filter: &Filter,
        data: &DocumentData,
    ) -> IsotopeResult<(Document, ChangeEvent)> {
        validate::collection_name(collection)?;
        validate::filter_fields(filter)?;
        let found = self
            .collection(collection)
            .find_one_and_update(
                codec::filter_to_query(filter),
                codec::replace_modifications(data, Utc::now()),
            )
            .return_document(ReturnDocument::After)
            .await
            .map_err(|e| driver_error("Atomic replace failed", e))?;
        match found {
            Some(stored) => {
                let replaced = codec::decode_document(collection, stored)?;
                let event = ChangeEvent::replaced(&replaced);
                Ok((replaced, event))
            }
            None => Err(no_match(collection)),
        }
    }

    async fn find_one_and_delete_inner(
        &self,
        collection: &str,
        filter: &Filter,
    ) -> IsotopeResult<(Document, ChangeEvent)> {
        validate::collection_name(collection)?;
        validate::filter_fields(filter)?;
        let found = self
            .collection(collection)
            .find_one_and_delete(codec::filter_to_query(filter))
            .await
            .map_err(|e| driver_error("Atomic delete failed", e))?;
        match found {
            Some(stored) => {
                let removed = codec::decode_document(collection, stored)?;
                let event = ChangeEvent::deleted(collection, removed.id(), removed.version());
                Ok((removed, event))
            }
            None => Err(no_match(collection)),
        }
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

        // pin the matched set by id so change events can carry the post
        // state without a second fetch
        let matched = self.fetch_matching(collection, filter).await?;
        if matched.is_empty() {
            return Ok((0, Vec::new()));
        }
        let ids: Vec<Bson> = matched
            .iter()
            .map(|d| Bson::String(d.id().to_string()))
            .collect();
        let now = Utc::now();
        let result = self
            .collection(collection)
            .update_many(
                doc! { codec::MONGO_ID: { "$in": ids } },
                codec::update_modifications(update, now),
            )
            .await
            .map_err(|e| driver_error("Batch update failed", e))?;

        let mut events = Vec::with_capacity(matched.len());
        for document in &matched {
            let mut data = document.data().clone();
            translate::apply_update(&mut data, update);
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
        Ok((result.modified_count, events))
    }

    async fn delete_many_inner(
        &self,
        collection: &str,
        filter: &Filter,
    ) -> IsotopeResult<(u64, Vec<ChangeEvent>)> {
        validate::collection_name(collection)?;
        validate::broad_mutation_filter(filter, "DeleteMany")?;

        let matched = self.fetch_matching(collection, filter).await?;
        if matched.is_empty() {
            return Ok((0, Vec::new()));
        }
        let ids: Vec<Bson> = matched
            .iter()
            .map(|d| Bson::String(d.id().to_string()))
            .collect();
        let result = self
            .collection(collection)
            .delete_many(doc! { codec::MONGO_ID: { "$in": ids } })
            .await
            .map_err(|e| driver_error("Batch delete failed", e))?;

        let events = matched
            .iter()
            .map(|d| ChangeEvent::deleted(collection, d.id(), d.version()))
            .collect();
        Ok((result.deleted_count, events))
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
                match save_in(&self.database, document, None).await {
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
                    match upsert_in(&self.database, &collection, &filter, &update, None).await {
                        Ok((document, event)) => {
                            if document.version() == INITIAL_VERSION {
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
                    let document = match filter.id_condition() {
                        Some(id) => Document::with_id(&collection, id, data),
                        None => Document::new(&collection, data),
                    };
                    match save_in(&self.database, document, None).await {
                        Ok((document, event)) => {
                            result.record_upserted(index, document.id().to_string());
                            events.push(event);
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
impl RepositoryProvider for MongoRepository {
    fn backend(&self) -> BackendKind {
        BackendKind::MongoDb
    }

    async fn save(&self, document: Document) -> IsotopeResult<Document> {
        let (saved, event) = save_in(&self.database, document, None).await?;
        self.publish(event);
        Ok(saved)
    }

    async fn save_many(&self, documents: Vec<Document>) -> IsotopeResult<Vec<Document>> {
        let mut stored = Vec::with_capacity(documents.len());
        for document in documents {
            validate::unsaved_document(&document)?;
            stored.push(document.into_first_version(Utc::now()));
        }
        if stored.is_empty() {
            return Ok(stored);
        }

        let single_collection = stored
            .windows(2)
            .all(|pair| pair[0].collection() == pair[1].collection());
        if single_collection {
            // one ordered insertMany: a failure stops the batch, earlier
            // documents stay inserted
            let encoded: Vec<mongodb::bson::Document> =
                stored.iter().map(codec::encode_document).collect();
            match self
                .collection(stored[0].collection())
                .insert_many(encoded)
                .ordered(true)
                .await
            {
                Ok(_) => {
                    for document in &stored {
                        self.publish(ChangeEvent::created(document));
                    }
                    Ok(stored)
                }
                Err(error) => {
                    for index in inserted_indexes(&error) {
                        if let Some(document) = stored.get(index) {
                            self.publish(ChangeEvent::created(document));
                        }
                    }
                    Err(insert_many_error(error))
                }
            }
        } else {
            let mut saved = Vec::with_capacity(stored.len());
            for document in stored {
                // documents were already stamped; re-wrap to reuse the
                // single-insert path
                let unsaved = Document::with_id(
                    document.collection(),
                    document.id(),
                    document.data().clone(),
                );
                let (document, event) = save_in(&self.database, unsaved, None).await?;
                self.publish(event);
                saved.push(document);
            }
            Ok(saved)
        }
    }

    async fn find_by_id(&self, collection: &str, id: &str) -> IsotopeResult<Document> {
        find_by_id_in(&self.database, collection, id, None).await
    }

    async fn find_all(&self, collection: &str) -> IsotopeResult<Vec<Document>> {
        validate::collection_name(collection)?;
        self.fetch_matching(collection, &Filter::empty()).await
    }

    async fn find_with_options(
        &self,
        collection: &str,
        filter: &Filter,
        options: &FindOptions,
    ) -> IsotopeResult<Vec<Document>> {
        validate::collection_name(collection)?;
        validate::filter_fields(filter)?;
        let (sort, skip, limit, projection) = codec::find_action_parts(options);
        let coll = self.collection(collection);
        let mut action = coll.find(codec::filter_to_query(filter));
        if let Some(sort) = sort {
            action = action.sort(sort);
        }
        if let Some(skip) = skip {
            action = action.skip(skip);
        }
        if let Some(limit) = limit {
            action = action.limit(limit);
        }
        if let Some(projection) = projection {
            action = action.projection(projection);
        }
        let cursor = action.await.map_err(|e| driver_error("Query failed", e))?;
        let stored: Vec<mongodb::bson::Document> = cursor
            .try_collect()
            .await
            .map_err(|e| driver_error("Query cursor failed", e))?;
        stored
            .into_iter()
            .map(|d| codec::decode_document(collection, d))
            .collect()
    }

    async fn update(
        &self,
        collection: &str,
        id: &str,
        expected_version: i64,
        update: &DocumentData,
    ) -> IsotopeResult<Document> {
        let (updated, event) =
            update_in(&self.database, collection, id, expected_version, update, None).await?;
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
        let (replaced, event) = replace_in(&self.database, document, None).await?;
        self.publish(event);
        Ok(replaced)
    }

    async fn delete(&self, collection: &str, id: &str, expected_version: i64) -> IsotopeResult<()> {
        let event = delete_in(&self.database, collection, id, expected_version, None).await?;
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
        let (document, event) = upsert_in(&self.database, collection, filter, update, None).await?;
        self.publish(event);
        Ok(document)
    }

    async fn aggregate(
        &self,
        collection: &str,
        pipeline: &[PipelineStage],
    ) -> IsotopeResult<Vec<DocumentData>> {
        validate::collection_name(collection)?;
        let translated = codec::pipeline_to_bson(pipeline)?;
        let cursor = self
            .collection(collection)
            .aggregate(translated)
            .await
            .map_err(|e| driver_error("Aggregation failed", e))?;
        let rows: Vec<mongodb::bson::Document> = cursor
            .try_collect()
            .await
            .map_err(|e| driver_error("Aggregation cursor failed", e))?;
        Ok(rows.iter().map(codec::bson_to_data).collect())
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
        let values = self
            .collection(collection)
            .distinct(codec::field_path(field), codec::filter_to_query(filter))
            .await
            .map_err(|e| driver_error("Distinct failed", e))?;
        Ok(values.iter().map(codec::bson_to_value).collect())
    }

    async fn count(&self, collection: &str, filter: &Filter) -> IsotopeResult<u64> {
        validate::collection_name(collection)?;
        validate::filter_fields(filter)?;
        self.collection(collection)
            .count_documents(codec::filter_to_query(filter))
            .await
            .map_err(|e| driver_error("Count failed", e))
    }

    async fn estimated_count(&self, collection: &str) -> IsotopeResult<u64> {
        validate::collection_name(collection)?;
        self.collection(collection)
            .estimated_document_count()
            .await
            .map_err(|e| driver_error("Estimated count failed", e))
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
        if let Some(ttl) = model.options().ttl_seconds {
            if ttl < 0 {
                return Err(IsotopeError::invalid_argument(
                    "TTL seconds must not be negative",
                ));
            }
        }

        let name = model.resolve_name(collection);
        let mut keys = mongodb::bson::Document::new();
        for key in model.keys() {
            let path = codec::field_path(&key.field);
            if model.options().text {
                keys.insert(path, "text");
            } else {
                let direction = match key.order {
                    isotope::common::SortOrder::Ascending => 1,
                    isotope::common::SortOrder::Descending => -1,
                };
                keys.insert(path, direction);
            }
        }

        let mut driver_options = DriverIndexOptions::default();
        driver_options.name = Some(name);
        if model.options().unique {
            driver_options.unique = Some(true);
        }
        if model.options().sparse {
            driver_options.sparse = Some(true);
        }
        if let Some(ttl) = model.options().ttl_seconds {
            driver_options.expire_after = Some(std::time::Duration::from_secs(ttl as u64));
        }
        if let Some(partial) = &model.options().partial_filter {
            driver_options.partial_filter_expression = Some(codec::filter_to_query(partial));
        }

        let driver_model = DriverIndexModel::builder()
            .keys(keys)
            .options(driver_options)
            .build();
        let created = self
            .collection(collection)
            .create_index(driver_model)
            .await
            .map_err(|e| driver_error("Index creation failed", e))?;
        Ok(created.index_name)
    }

    async fn drop_index(&self, collection: &str, name: &str) -> IsotopeResult<()> {
        validate::collection_name(collection)?;
        match self.collection(collection).drop_index(name).await {
            Ok(()) => Ok(()),
            Err(error) if command_code(&error) == Some(INDEX_NOT_FOUND) => Err(
                IsotopeError::not_found(&format!("No index '{}' on '{}'", name, collection)),
            ),
            Err(error) => Err(driver_error("Index drop failed", error)),
        }
    }

    async fn list_indexes(&self, collection: &str) -> IsotopeResult<Vec<IndexModel>> {
        validate::collection_name(collection)?;
        let cursor = self
            .collection(collection)
            .list_indexes()
            .await
            .map_err(|e| driver_error("Index listing failed", e))?;
        let driver_models: Vec<DriverIndexModel> = cursor
            .try_collect()
            .await
            .map_err(|e| driver_error("Index listing cursor failed", e))?;

        let mut models = Vec::new();
        for driver_model in driver_models {
            let name = driver_model
                .options
                .as_ref()
                .and_then(|o| o.name.clone());
            if name.as_deref() == Some("_id_") {
                continue;
            }
            let mut keys = Vec::new();
            let mut text = false;
            for (path, direction) in driver_model.keys.iter() {
                let field = if path == codec::MONGO_ID {
                    FIELD_ID
                } else {
                    path.strip_prefix("data.").unwrap_or(path)
                };
                match direction {
                    Bson::String(kind) if kind == "text" => {
                        text = true;
                        keys.push(IndexKey::asc(field));
                    }
                    Bson::Int32(d) if *d < 0 => keys.push(IndexKey::desc(field)),
                    Bson::Int64(d) if *d < 0 => keys.push(IndexKey::desc(field)),
                    Bson::Double(d) if *d < 0.0 => keys.push(IndexKey::desc(field)),
                    _ => keys.push(IndexKey::asc(field)),
                }
            }

            let mut options = IndexOptions::new();
            if let Some(name) = name {
                options = options.named(&name);
            }
            if let Some(driver_options) = driver_model.options {
                if driver_options.unique == Some(true) {
                    options = options.unique();
                }
                if driver_options.sparse == Some(true) {
                    options = options.sparse();
                }
                if let Some(expiry) = driver_options.expire_after {
                    options = options.ttl_seconds(expiry.as_secs() as i64);
                }
                if let Some(partial) = driver_options.partial_filter_expression {
                    let mut filter = Filter::empty();
                    for (path, value) in partial.iter() {
                        let field = if path == codec::MONGO_ID {
                            FIELD_ID
                        } else {
                            path.strip_prefix("data.").unwrap_or(path)
                        };
                        filter = filter.with(field, codec::bson_to_value(value));
                    }
                    options = options.partial(filter);
                }
            }
            if text {
                options = options.text();
            }
            models.push(IndexModel::new(keys).with_options(options));
        }
        Ok(models)
    }

    async fn create_collection(&self, name: &str) -> IsotopeResult<()> {
        validate::collection_name(name)?;
        match self.database.create_collection(name).await {
            Ok(()) => Ok(()),
            Err(error) if command_code(&error) == Some(NAMESPACE_EXISTS) => Ok(()),
            Err(error) => Err(driver_error("Collection creation failed", error)),
        }
    }

    async fn drop_collection(&self, name: &str) -> IsotopeResult<()> {
        validate::collection_name(name)?;
        match self.collection(name).drop().await {
            Ok(()) => Ok(()),
            Err(error) if command_code(&error) == Some(NAMESPACE_NOT_FOUND) => Ok(()),
            Err(error) => Err(driver_error("Collection drop failed", error)),
        }
    }

    async fn rename_collection(&self, old_name: &str, new_name: &str) -> IsotopeResult<()> {
        validate::collection_name(old_name)?;
        validate::collection_name(new_name)?;
        let existing = self
            .database
            .list_collection_names()
            .await
            .map_err(|e| driver_error("Collection listing failed", e))?;
        if !existing.iter().any(|c| c == old_name) {
            return Err(IsotopeError::not_found(&format!(
                "No collection named '{}'",
                old_name
            )));
        }
        if existing.iter().any(|c| c == new_name) {
            return Err(IsotopeError::invalid_argument(&format!(
                "A collection named '{}' already exists",
                new_name
            )));
        }
        let database = self.database.name();
        let command = doc! {
            "renameCollection": format!("{}.{}", database, old_name),
            "to": format!("{}.{}", database, new_name),
        };
        self.client
            .database("admin")
            .run_command(command)
            .await
            .map_err(|e| driver_error("Collection rename failed", e))?;
        Ok(())
    }

    async fn list_collections(&self) -> IsotopeResult<Vec<String>> {
        let mut names = self
            .database
            .list_collection_names()
            .await
            .map_err(|e| driver_error("Collection listing failed", e))?;
        names.sort();
        Ok(names)
    }

    async fn collection_exists(&self, name: &str) -> IsotopeResult<bool> {
        validate::collection_name(name)?;
        let names = self
            .database
            .list_collection_names()
            .await
            .map_err(|e| driver_error("Collection listing failed", e))?;
        Ok(names.iter().any(|c| c == name))
    }

    async fn with_transaction(&self, func: TransactionFunc) -> IsotopeResult<()> {
        let mut session = self
            .client
            .start_session()
            .await
            .map_err(|e| driver_error("Failed to start a session", e))?;
        session
            .start_transaction()
            .await
            .map_err(|e| driver_error("Failed to start a transaction", e))?;

        let provider = Arc::new(MongoTransactionScope {
            database: self.database.clone(),
            state: Mutex::new(ScopeState {
                session,
                events: Vec::new(),
            }),
        });
        let scope = TransactionScope::from_arc(provider.clone());
        let result = func(&scope).await;

        let mut state = provider.state.lock().await;
        match result {
            Ok(()) => {
                state
                    .session
                    .commit_transaction()
                    .await
                    .map_err(|e| driver_error("Transaction commit failed", e))?;
                let events = std::mem::take(&mut state.events);
                drop(state);
                self.publish_all(events);
                Ok(())
            }
            Err(error) => {
                if let Err(abort_error) = state.session.abort_transaction().await {
                    warn!("failed to abort transaction: {}", abort_error);
                }
                Err(error)
            }
        }
    }

    async fn health_check(&self) -> IsotopeResult<()> {
        self.database
            .run_command(doc! { "ping": 1 })
            .await
            .map_err(|e| driver_error("MongoDB is unreachable", e))?;
        Ok(())
    }
}

struct ScopeState {
    session: ClientSession,
    events: Vec<ChangeEvent>,
}

/// Transaction scope bound to a server session.
///
/// Operations run on the session's open transaction; change events buffer
/// in the scope and only reach the publisher after the commit succeeds.
struct MongoTransactionScope {
    database: Database,
    state: Mutex<ScopeState>,
}

#[async_trait]
impl TransactionScopeProvider for MongoTransactionScope {
    async fn save(&self, document: Document) -> IsotopeResult<Document> {
        let mut state = self.state.lock().await;
        let ScopeState { session, events } = &mut *state;
        let (saved, event) = save_in(&self.database, document, Some(session)).await?;
        events.push(event);
        Ok(saved)
    }

    async fn find_by_id(&self, collection: &str, id: &str) -> IsotopeResult<Document> {
        let mut state = self.state.lock().await;
        find_by_id_in(&self.database, collection, id, Some(&mut state.session)).await
    }

    async fn update(
        &self,
        collection: &str,
        id: &str,
        expected_version: i64,
        update: &DocumentData,
    ) -> IsotopeResult<Document> {
        let mut state = self.state.lock().await;
        let ScopeState { session, events } = &mut *state;
        let (updated, event) =
            update_in(&self.database, collection, id, expected_version, update, Some(session))
                .await?;
        events.push(event);
        Ok(updated)
    }

    async fn replace(&self, document: &Document) -> IsotopeResult<Document> {
        let mut state = self.state.lock().await;
        let ScopeState { session, events } = &mut *state;
        let (replaced, event) = replace_in(&self.database, document, Some(session)).await?;
        events.push(event);
        Ok(replaced)
    }

    async fn delete(&self, collection: &str, id: &str, expected_version: i64) -> IsotopeResult<()> {
        let mut state = self.state.lock().await;
        let ScopeState { session, events } = &mut *state;
        let event =
            delete_in(&self.database, collection, id, expected_version, Some(session)).await?;
        events.push(event);
        Ok(())
    }

    async fn upsert(
        &self,
        collection: &str,
        filter: &Filter,
        update: &DocumentData,
    ) -> IsotopeResult<Document> {
        let mut state = self.state.lock().await;
        let ScopeState { session, events } = &mut *state;
        let (document, event) =
            upsert_in(&self.database, collection, filter, update, Some(session)).await?;
        events.push(event);
        Ok(document)
    }
}

async fn save_in(
    database: &Database,
    document: Document,
    session: Option<&mut ClientSession>,
) -> IsotopeResult<(Document, ChangeEvent)> {
    validate::unsaved_document(&document)?;
    let stored = document.into_first_version(Utc::now());
    let encoded = codec::encode_document(&stored);
    let collection = database.collection::<mongodb::bson::Document>(stored.collection());
    let action = collection.insert_one(encoded);
    let result = match session {
        Some(session) => action.session(session).await,
        None => action.await,
    };
    result.map_err(|error| {
        if classify(&error) == ErrorKind::ValidationFailed {
            IsotopeError::validation_failed(&format!(
                "A document with id '{}' already exists in '{}'",
                stored.id(),
                stored.collection()
            ))
        } else {
            driver_error("Insert failed", error)
        }
    })?;
    let event = ChangeEvent::created(&stored);
    Ok((stored, event))
}

async fn find_by_id_in(
    database: &Database,
    collection: &str,
    id: &str,
    session: Option<&mut ClientSession>,
) -> IsotopeResult<Document> {
    validate::collection_name(collection)?;
    validate::document_id(id)?;
    let coll = database.collection::<mongodb::bson::Document>(collection);
    let action = coll.find_one(doc! { codec::MONGO_ID: id });
    let found = match session {
        Some(session) => action.session(session).await,
        None => action.await,
    }
    .map_err(|e| driver_error("Lookup failed", e))?;
    match found {
        Some(stored) => codec::decode_document(collection, stored),
        None => Err(IsotopeError::not_found(&format!(
            "No document '{}' in '{}'",
            id, collection
        ))),
    }
}

async fn update_in(
    database: &Database,
    collection: &str,
    id: &str,
    expected_version: i64,
    update: &DocumentData,
    mut session: Option<&mut ClientSession>,
) -> IsotopeResult<(Document, ChangeEvent)> {
    validate::collection_name(collection)?;
    validate::document_id(id)?;
    validate::expected_version(expected_version)?;
    validate::update_payload(update)?;

    let coll = database.collection::<mongodb::bson::Document>(collection);
    let action = coll
        .find_one_and_update(
            doc! { codec::MONGO_ID: id, FIELD_VERSION: expected_version },
            codec::update_modifications(update, Utc::now()),
        )
        .return_document(ReturnDocument::After);
    let found = match &mut session {
        Some(session) => action.session(&mut **session).await,
        None => action.await,
    }
    .map_err(|e| driver_error("Update failed", e))?;
    match found {
        Some(stored) => {
            let updated = codec::decode_document(collection, stored)?;
            let event = ChangeEvent::updated(&updated);
            Ok((updated, event))
        }
        None => Err(cas_failure(database, collection, id, expected_version, session).await),
    }
}

async fn replace_in(
    database: &Database,
    document: &Document,
    mut session: Option<&mut ClientSession>,
) -> IsotopeResult<(Document, ChangeEvent)> {
    validate::stored_document(document)?;
    let coll = database.collection::<mongodb::bson::Document>(document.collection());
    let action = coll
        .find_one_and_update(
            doc! { codec::MONGO_ID: document.id(), FIELD_VERSION: document.version() },
            codec::replace_modifications(document.data(), Utc::now()),
        )
        .return_document(ReturnDocument::After);
    let found = match &mut session {
        Some(session) => action.session(&mut **session).await,
        None => action.await,
    }
    .map_err(|e| driver_error("Replace failed", e))?;
    match found {
        Some(stored) => {
            let replaced = codec::decode_document(document.collection(), stored)?;
            let event = ChangeEvent::replaced(&replaced);
            Ok((replaced, event))
        }
        None => Err(cas_failure(
            database,
            document.collection(),
            document.id(),
            document.version(),
            session,
        )
        .await),
    }
}

async fn delete_in(
    database: &Database,
    collection: &str,
    id: &str,
    expected_version: i64,
    mut session: Option<&mut ClientSession>,
) -> IsotopeResult<ChangeEvent> {
    validate::collection_name(collection)?;
    validate::document_id(id)?;
    validate::expected_version(expected_version)?;

    let coll = database.collection::<mongodb::bson::Document>(collection);
    let action = coll.delete_one(doc! { codec::MONGO_ID: id, FIELD_VERSION: expected_version });
    let result = match &mut session {
        Some(session) => action.session(&mut **session).await,
        None => action.await,
    }
    .map_err(|e| driver_error("Delete failed", e))?;
    if result.deleted_count == 1 {
        Ok(ChangeEvent::deleted(collection, id, expected_version))
    } else {
        Err(cas_failure(database, collection, id, expected_version, session).await)
    }
}

async fn upsert_in(
    database: &Database,
    collection: &str,
    filter: &Filter,
    update: &DocumentData,
    session: Option<&mut ClientSession>,
) -> IsotopeResult<(Document, ChangeEvent)> {
    validate::collection_name(collection)?;
    validate::filter_fields(filter)?;
    validate::update_payload(update)?;

    let generated_id = Uuid::new_v4().to_string();
    let coll = database.collection::<mongodb::bson::Document>(collection);
    let action = coll
        .find_one_and_update(
            codec::filter_to_query(filter),
            codec::upsert_modifications(filter, update, &generated_id, Utc::now()),
        )
        .return_document(ReturnDocument::After)
        .upsert(true);
    let found = match session {
        Some(session) => action.session(session).await,
        None => action.await,
    }
    .map_err(|e| driver_error("Upsert failed", e))?;
    let stored = found.ok_or_else(|| IsotopeError::transient("Upsert returned no document"))?;
    let document = codec::decode_document(collection, stored)?;
    let event = if document.version() == INITIAL_VERSION {
        ChangeEvent::created(&document)
    } else {
        ChangeEvent::updated(&document)
    };
    Ok((document, event))
}

/// Distinguishes a missed compare-and-set: the id may not exist at all, or
/// it exists at a different version.
async fn cas_failure(
    database: &Database,
    collection: &str,
    id: &str,
    expected_version: i64,
    session: Option<&mut ClientSession>,
) -> IsotopeError {
    match find_by_id_in(database, collection, id, session).await {
        Ok(current) => IsotopeError::version_conflict(&format!(
            "Version conflict on '{}/{}': expected {}, stored {}",
            collection,
            id,
            expected_version,
            current.version()
        )),
        Err(error) => error,
    }
}

fn no_match(collection: &str) -> IsotopeError {
    IsotopeError::not_found(&format!("No document in '{}' matches the filter", collection))
}

pub(crate) fn driver_error(context: &str, error: DriverError) -> IsotopeError {
    let kind = classify(&error);
    IsotopeError::new_with_cause(
        context,
        kind.clone(),
        IsotopeError::new(&error.to_string(), kind),
    )
}

fn classify(error: &DriverError) -> ErrorKind {
    match &*error.kind {
        DriverErrorKind::Write(WriteFailure::WriteError(write)) if write.code == DUPLICATE_KEY => {
            ErrorKind::ValidationFailed
        }
        DriverErrorKind::Command(command) if command.code == DUPLICATE_KEY => {
            ErrorKind::ValidationFailed
        }
        DriverErrorKind::InvalidArgument { .. } => ErrorKind::InvalidArgument,
        DriverErrorKind::BsonSerialization(_) | DriverErrorKind::BsonDeserialization(_) => {
            ErrorKind::ValidationFailed
        }
        _ => ErrorKind::Transient,
    }
}

pub(crate) fn command_code(error: &DriverError) -> Option<i32> {
    match &*error.kind {
        DriverErrorKind::Command(command) => Some(command.code),
        _ => None,
    }
}

fn inserted_indexes(error: &DriverError) -> Vec<usize> {
    match &*error.kind {
        DriverErrorKind::InsertMany(failure) => {
            // ordered insert: every document before the first failing index landed
            match failure
                .write_errors
                .as_ref()
                .and_then(|errors| errors.iter().map(|write| write.index).min())
            {
                Some(first_failed) => (0..first_failed).collect(),
                None => Vec::new(),
            }
        }
        _ => Vec::new(),
    }
}

fn insert_many_error(error: DriverError) -> IsotopeError {
    if let DriverErrorKind::InsertMany(failure) = &*error.kind {
        if let Some(first) = failure.write_errors.as_ref().and_then(|errors| errors.first()) {
            let kind = if first.code == DUPLICATE_KEY {
                ErrorKind::ValidationFailed
            } else {
                ErrorKind::Transient
            };
            return IsotopeError::new(
                &format!(
                    "Batch insert failed at document {}: {}",
                    first.index, first.message
                ),
                kind,
            );
        }
    }
    driver_error("Batch insert failed", error)
}
