use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use elasticsearch::http::request::JsonBody;
use elasticsearch::http::response::Response;
use elasticsearch::http::transport::Transport;
use elasticsearch::indices::{
    IndicesCreateParts, IndicesDeleteParts, IndicesExistsParts, IndicesGetMappingParts,
};
use elasticsearch::params::Refresh;
use elasticsearch::{BulkParts, CountParts, CreateParts, Elasticsearch, GetParts, SearchParts, UpdateParts};
use log::warn;
use serde_json::{json, Value as Json};
use tokio::sync::{Mutex, RwLock};

use isotope::aggregate::PipelineStage;
use isotope::common::{data_to_json, DocumentData, Value};
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

use crate::codec;
use crate::config::ElasticConfig;

/// One search request returns at most this many documents, the engine's
/// default result-window ceiling.
const MAX_RESULTS: usize = 10_000;

/// The search-index backend.
///
/// Conditional mutations run painless scripts comparing the stored version;
/// a `noop` result surfaces as VersionConflict after a follow-up read
/// settles whether the row still exists. Secondary indexes are implicit
/// (every payload field is indexed by the dynamic template), so the index
/// registry is kept in memory for listing; unique indexes are unsupported.
pub struct ElasticRepository {
    inner: Arc<ElasticInner>,
    publisher: Option<Arc<ChangeEventPublisher>>,
    indexes: RwLock<HashMap<String, Vec<IndexModel>>>,
}

struct ElasticInner {
    client: Elasticsearch,
    prefix: String,
}

impl ElasticRepository {
    pub fn connect(config: ElasticConfig) -> IsotopeResult<ElasticRepository> {
        ElasticRepository::open(config, None)
    }

    pub fn connect_with_publisher(
        config: ElasticConfig,
        publisher: Arc<ChangeEventPublisher>,
    ) -> IsotopeResult<ElasticRepository> {
        ElasticRepository::open(config, Some(publisher))
    }

    fn open(
        config: ElasticConfig,
        publisher: Option<Arc<ChangeEventPublisher>>,
    ) -> IsotopeResult<ElasticRepository> {
        config.validate()?;
        let transport = Transport::single_node(config.url())
            .map_err(|e| transport_error("Failed to build the search client", e))?;
        Ok(ElasticRepository {
            inner: Arc::new(ElasticInner {
                client: Elasticsearch::new(transport),
                prefix: config.index_prefix_value().to_string(),
            }),
            publisher,
            indexes: RwLock::new(HashMap::new()),
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
impl RepositoryProvider for ElasticRepository {
    fn backend(&self) -> BackendKind {
        BackendKind::Elasticsearch
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
        if documents.is_empty() {
            return Ok(Vec::new());
        }

        let now = Utc::now();
        let mut stored = Vec::with_capacity(documents.len());
        let mut body: Vec<JsonBody<Json>> = Vec::with_capacity(documents.len() * 2);
        for document in documents {
            self.inner.ensure_index(document.collection()).await?;
            let document = document.into_first_version(now);
            body.push(
                json!({ "create": {
                    "_index": self.inner.index_for(document.collection()),
                    "_id": document.id(),
                }})
                .into(),
            );
            body.push(codec::source_from_document(&document).into());
            stored.push(document);
        }

        let response = self
            .inner
            .client
            .bulk(BulkParts::None)
            .body(body)
            .refresh(Refresh::True)
            .send()
            .await
            .map_err(|e| transport_error("Batch insert failed", e))?;
        let payload = read_json("Batch insert failed", response).await?;

        // per-item accounting: earlier creates stay applied when a later
        // one fails, so their events still go out
        let items = payload["items"].as_array().cloned().unwrap_or_default();
        let mut saved = Vec::with_capacity(stored.len());
        for (document, item) in stored.into_iter().zip(items) {
            let status = item["create"]["status"].as_u64().unwrap_or(0);
            if status == 201 {
                self.publish(ChangeEvent::created(&document));
                saved.push(document);
            } else {
                let reason = item["create"]["error"]["reason"]
                    .as_str()
                    .unwrap_or("create was rejected")
                    .to_string();
                let kind = if status == 409 {
                    ErrorKind::ValidationFailed
                } else {
                    ErrorKind::Transient
                };
                if !saved.is_empty() {
                    warn!(
                        "batch insert stopped after {} documents; earlier creates stay applied",
                        saved.len()
                    );
                }
                return Err(IsotopeError::new(
                    &format!("Batch insert failed for '{}': {}", document.id(), reason),
                    kind,
                ));
            }
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
        self.inner.fetch_all(collection).await
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
        let (updated, event) = self
            .inner
            .find_and_update_inner(collection, filter, update)
            .await?;
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
        // a leading Match narrows the search; the rest evaluates client-side
        let (documents, stages) = match pipeline.split_first() {
            Some((PipelineStage::Match(filter), rest)) => {
                (self.inner.fetch_matching(collection, filter).await?, rest)
            }
            _ => (self.inner.fetch_all(collection).await?, pipeline),
        };
        translate::run_pipeline(documents, stages)
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
        let documents = self.inner.fetch_all(collection).await?;
        Ok(translate::distinct_values(&documents, field, filter))
    }

    async fn count(&self, collection: &str, filter: &Filter) -> IsotopeResult<u64> {
        validate::collection_name(collection)?;
        validate::filter_fields(filter)?;
        match codec::query_for_filter(filter)? {
            Some(query) => self.inner.count_query(collection, query).await,
            None => {
                let matched = self.inner.fetch_matching(collection, filter).await?;
                Ok(matched.len() as u64)
            }
        }
    }

    async fn estimated_count(&self, collection: &str) -> IsotopeResult<u64> {
        validate::collection_name(collection)?;
        self.inner
            .count_query(collection, json!({ "match_all": {} }))
            .await
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
        if model.options().unique {
            return Err(IsotopeError::unsupported(
                "the search-index adapter cannot enforce unique indexes",
            ));
        }
        if model.options().ttl_seconds.is_some() {
            return Err(IsotopeError::unsupported(
                "the search-index adapter cannot expire documents by TTL",
            ));
        }
        if model.options().partial_filter.is_some() {
            return Err(IsotopeError::unsupported(
                "the search-index adapter cannot build partial-filter indexes",
            ));
        }
        // every payload field is already indexed by the dynamic template,
        // so the model only has to be remembered for listing
        let name = model.resolve_name(collection);
        let mut indexes = self.indexes.write().await;
        let entries = indexes.entry(collection.to_string()).or_default();
        if let Some(existing) = entries
            .iter()
            .find(|existing| existing.resolve_name(collection) == name)
        {
            if *existing == model {
                return Ok(name);
            }
            return Err(IsotopeError::validation_failed(&format!(
                "index '{}' already exists on '{}' with a different definition",
                name, collection
            )));
        }
        entries.push(model);
        Ok(name)
    }

    async fn drop_index(&self, collection: &str, name: &str) -> IsotopeResult<()> {
        validate::collection_name(collection)?;
        let mut indexes = self.indexes.write().await;
        let entries = indexes.entry(collection.to_string()).or_default();
        let before = entries.len();
        entries.retain(|model| model.resolve_name(collection) != name);
        if entries.len() == before {
            return Err(IsotopeError::not_found(&format!(
                "No index '{}' on '{}'",
                name, collection
            )));
        }
        Ok(())
    }

    async fn list_indexes(&self, collection: &str) -> IsotopeResult<Vec<IndexModel>> {
        validate::collection_name(collection)?;
        let indexes = self.indexes.read().await;
        Ok(indexes.get(collection).cloned().unwrap_or_default())
    }

    async fn create_collection(&self, name: &str) -> IsotopeResult<()> {
        validate::collection_name(name)?;
        self.inner.ensure_index(name).await
    }

    async fn drop_collection(&self, name: &str) -> IsotopeResult<()> {
        validate::collection_name(name)?;
        let index = self.inner.index_for(name);
        let response = self
            .inner
            .client
            .indices()
            .delete(IndicesDeleteParts::Index(&[&index]))
            .send()
            .await
            .map_err(|e| transport_error("Collection drop failed", e))?;
        if response.status_code().as_u16() == 404 || response.status_code().is_success() {
            self.indexes.write().await.remove(name);
            Ok(())
        } else {
            Err(response_error("Collection drop failed", response).await)
        }
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

        // reindex then delete; not atomic, a crash in between leaves both
        // indices and the reindex can be re-run
        self.inner.ensure_index(new_name).await?;
        let body = json!({
            "source": { "index": self.inner.index_for(old_name) },
            "dest": { "index": self.inner.index_for(new_name) },
            "script": {
                "lang": "painless",
                "source": "ctx._source.collection = params.name",
                "params": { "name": new_name }
            }
        });
        let response = self
            .inner
            .client
            .reindex()
            .body(body)
            .refresh(true)
            .send()
            .await
            .map_err(|e| transport_error("Collection rename failed", e))?;
        if !response.status_code().is_success() {
            return Err(response_error("Collection rename failed", response).await);
        }

        let old_index = self.inner.index_for(old_name);
        let response = self
            .inner
            .client
            .indices()
            .delete(IndicesDeleteParts::Index(&[&old_index]))
            .send()
            .await
            .map_err(|e| transport_error("Collection rename failed", e))?;
        if !response.status_code().is_success() {
            return Err(response_error("Collection rename failed", response).await);
        }

        let mut indexes = self.indexes.write().await;
        if let Some(models) = indexes.remove(old_name) {
            indexes.insert(new_name.to_string(), models);
        }
        Ok(())
    }

    async fn list_collections(&self) -> IsotopeResult<Vec<String>> {
        let pattern = format!("{}*", self.inner.prefix);
        let response = self
            .inner
            .client
            .indices()
            .get_mapping(IndicesGetMappingParts::Index(&[&pattern]))
            .send()
            .await
            .map_err(|e| transport_error("Collection listing failed", e))?;
        if response.status_code().as_u16() == 404 {
            return Ok(Vec::new());
        }
        let payload = read_json("Collection listing failed", response).await?;

        let mut names = Vec::new();
        if let Some(indices) = payload.as_object() {
            for (index, mapping) in indices {
                let name = mapping["mappings"]["_meta"]["collection"]
                    .as_str()
                    .map(str::to_string)
                    .unwrap_or_else(|| {
                        index
                            .strip_prefix(&self.inner.prefix)
                            .unwrap_or(index)
                            .to_string()
                    });
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    async fn collection_exists(&self, name: &str) -> IsotopeResult<bool> {
        validate::collection_name(name)?;
        let index = self.inner.index_for(name);
        let response = self
            .inner
            .client
            .indices()
            .exists(IndicesExistsParts::Index(&[&index]))
            .send()
            .await
            .map_err(|e| transport_error("Collection lookup failed", e))?;
        Ok(response.status_code().is_success())
    }

    async fn with_transaction(&self, func: TransactionFunc) -> IsotopeResult<()> {
        let provider = Arc::new(ElasticTransactionScope {
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
        let response = self
            .inner
            .client
            .ping()
            .send()
            .await
            .map_err(|e| transport_error("Search cluster is unreachable", e))?;
        if response.status_code().is_success() {
            Ok(())
        } else {
            Err(response_error("Search cluster is unreachable", response).await)
        }
    }
}

enum ChangeKind {
    Updated,
    Replaced,
}

impl ElasticInner {
    fn index_for(&self, collection: &str) -> String {
        codec::index_name(&self.prefix, collection)
    }

    /// Creates the collection's index when missing; a concurrent creation
    /// racing this one is fine.
    async fn ensure_index(&self, collection: &str) -> IsotopeResult<()> {
        let index = self.index_for(collection);
        let response = self
            .client
            .indices()
            .exists(IndicesExistsParts::Index(&[&index]))
            .send()
            .await
            .map_err(|e| transport_error("Index lookup failed", e))?;
        if response.status_code().is_success() {
            return Ok(());
        }

        let response = self
            .client
            .indices()
            .create(IndicesCreateParts::Index(&index))
            .body(codec::mappings_body(collection))
            .send()
            .await
            .map_err(|e| transport_error("Index creation failed", e))?;
        if response.status_code().is_success() || response.status_code().as_u16() == 400 {
            Ok(())
        } else {
            Err(response_error("Index creation failed", response).await)
        }
    }

    async fn save_inner(&self, document: Document) -> IsotopeResult<(Document, ChangeEvent)> {
        validate::unsaved_document(&document)?;
        self.ensure_index(document.collection()).await?;
        let stored = document.into_first_version(Utc::now());
        self.insert_stored(&stored).await?;
        let event = ChangeEvent::created(&stored);
        Ok((stored, event))
    }

    async fn insert_stored(&self, stored: &Document) -> IsotopeResult<()> {
        let index = self.index_for(stored.collection());
        let response = self
            .client
            .create(CreateParts::IndexId(&index, stored.id()))
            .body(codec::source_from_document(stored))
            .refresh(Refresh::True)
            .send()
            .await
            .map_err(|e| transport_error("Insert failed", e))?;
        match response.status_code().as_u16() {
            code if (200..300).contains(&code) => Ok(()),
            409 => Err(IsotopeError::validation_failed(&format!(
                "A document with id '{}' already exists in '{}'",
                stored.id(),
                stored.collection()
            ))),
            _ => Err(response_error("Insert failed", response).await),
        }
    }

    async fn fetch_by_id(&self, collection: &str, id: &str) -> IsotopeResult<Option<Document>> {
        let index = self.index_for(collection);
        let response = self
            .client
            .get(GetParts::IndexId(&index, id))
            .send()
            .await
            .map_err(|e| transport_error("Lookup failed", e))?;
        if response.status_code().as_u16() == 404 {
            return Ok(None);
        }
        if !response.status_code().is_success() {
            return Err(response_error("Lookup failed", response).await);
        }
        let payload = read_json("Lookup failed", response).await?;
        if payload["found"] != json!(true) {
            return Ok(None);
        }
        codec::document_from_source(collection, id, &payload["_source"]).map(Some)
    }

    async fn search(&self, collection: &str, query: Json) -> IsotopeResult<Vec<Document>> {
        let index = self.index_for(collection);
        let body = json!({
            "query": query,
            "size": MAX_RESULTS,
            "sort": [{ "created_at": "asc" }]
        });
        let response = self
            .client
            .search(SearchParts::Index(&[&index]))
            .body(body)
            .send()
            .await
            .map_err(|e| transport_error("Query failed", e))?;
        if response.status_code().as_u16() == 404 {
            return Ok(Vec::new());
        }
        if !response.status_code().is_success() {
            return Err(response_error("Query failed", response).await);
        }
        let payload = read_json("Query failed", response).await?;

        let hits = payload["hits"]["hits"].as_array().cloned().unwrap_or_default();
        let mut documents = Vec::with_capacity(hits.len());
        for hit in hits {
            let id = hit["_id"]
                .as_str()
                .ok_or_else(|| IsotopeError::validation_failed("search hit carries no id"))?;
            documents.push(codec::document_from_source(collection, id, &hit["_source"])?);
        }
        Ok(documents)
    }

    async fn fetch_all(&self, collection: &str) -> IsotopeResult<Vec<Document>> {
        self.search(collection, json!({ "match_all": {} })).await
    }

    /// Matching documents; conditions the query DSL cannot express fall
    /// back to a full fetch filtered client-side.
    async fn fetch_matching(&self, collection: &str, filter: &Filter) -> IsotopeResult<Vec<Document>> {
        match codec::query_for_filter(filter)? {
            Some(query) => self.search(collection, query).await,
            None => {
                let documents = self.fetch_all(collection).await?;
                Ok(documents
                    .into_iter()
                    .filter(|document| translate::matches_filter(document, filter))
                    .collect())
            }
        }
    }

    async fn count_query(&self, collection: &str, query: Json) -> IsotopeResult<u64> {
        let index = self.index_for(collection);
        let response = self
            .client
            .count(CountParts::Index(&[&index]))
            .body(json!({ "query": query }))
            .send()
            .await
            .map_err(|e| transport_error("Count failed", e))?;
        if response.status_code().as_u16() == 404 {
            return Ok(0);
        }
        if !response.status_code().is_success() {
            return Err(response_error("Count failed", response).await);
        }
        let payload = read_json("Count failed", response).await?;
        Ok(payload["count"].as_u64().unwrap_or(0))
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

    /// Scripted compare-and-set write over a witnessed document state. A
    /// `noop` result means a concurrent writer got there first.
    async fn write_conditional(
        &self,
        current: &Document,
        data: DocumentData,
        kind: ChangeKind,
    ) -> IsotopeResult<(Document, ChangeEvent)> {
        let index = self.index_for(current.collection());
        let now = Utc::now();
        let body = codec::write_script_body(
            &data_to_json(&data),
            current.version(),
            now.timestamp_millis(),
        );
        let response = self
            .client
            .update(UpdateParts::IndexId(&index, current.id()))
            .body(body)
            .refresh(Refresh::True)
            .send()
            .await
            .map_err(|e| transport_error("Conditional update failed", e))?;
        if response.status_code().as_u16() == 404 {
            return Err(not_found(current.collection(), current.id()));
        }
        if !response.status_code().is_success() {
            return Err(response_error("Conditional update failed", response).await);
        }
        let payload = read_json("Conditional update failed", response).await?;
        if payload["result"] == json!("noop") {
            return Err(self
                .cas_failure(current.collection(), current.id(), current.version())
                .await);
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
        let index = self.index_for(collection);
        let response = self
            .client
            .update(UpdateParts::IndexId(&index, id))
            .body(codec::delete_script_body(expected_version))
            .refresh(Refresh::True)
            .send()
            .await
            .map_err(|e| transport_error("Conditional delete failed", e))?;
        if response.status_code().as_u16() == 404 {
            return Err(not_found(collection, id));
        }
        if !response.status_code().is_success() {
            return Err(response_error("Conditional delete failed", response).await);
        }
        let payload = read_json("Conditional delete failed", response).await?;
        if payload["result"] == json!("deleted") {
            Ok(ChangeEvent::deleted(collection, id, expected_version))
        } else {
            Err(self.cas_failure(collection, id, expected_version).await)
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
                self.ensure_index(collection).await?;
                let stored = unsaved.into_first_version(Utc::now());
                self.insert_stored(&stored).await?;
                let event = ChangeEvent::created(&stored);
                Ok((stored, event))
            }
        }
    }

    /// Distinguishes a failed scripted condition with a follow-up read.
    async fn cas_failure(&self, collection: &str, id: &str, expected: i64) -> IsotopeError {
        match self.fetch_by_id(collection, id).await {
            Ok(Some(current)) => version_conflict(collection, id, expected, current.version()),
            Ok(None) => not_found(collection, id),
            Err(error) => error,
        }
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
                    return;
                }
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
                    let mut data = document.data().clone();
                    translate::apply_update(&mut data, &update);
                    match self
                        .write_conditional(&document, data, ChangeKind::Updated)
                        .await
                    {
                        Ok((_, event)) => {
                            result.record_matched(1);
                            result.record_modified(1);
                            events.push(event);
                        }
                        Err(error) => {
                            result.record_error(index, error);
                            return;
                        }
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
}

/// Transaction scope without cross-operation atomicity: the search index
/// has no multi-document transactions, so each operation applies
/// immediately and an error from the closure leaves earlier writes in
/// place. Change events are buffered and reach the publisher only when the
/// closure succeeds.
struct ElasticTransactionScope {
    inner: Arc<ElasticInner>,
    events: Mutex<Vec<ChangeEvent>>,
}

impl ElasticTransactionScope {
    async fn record(&self, event: ChangeEvent) {
        self.events.lock().await.push(event);
    }
}

#[async_trait]
impl TransactionScopeProvider for ElasticTransactionScope {
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

async fn read_json(context: &str, response: Response) -> IsotopeResult<Json> {
    response
        .json::<Json>()
        .await
        .map_err(|e| transport_error(context, e))
}

/// Maps a non-success response into the error taxonomy by status code.
async fn response_error(context: &str, response: Response) -> IsotopeError {
    let status = response.status_code().as_u16();
    let kind = match status {
        404 => ErrorKind::NotFound,
        400 => ErrorKind::InvalidArgument,
        409 => ErrorKind::ValidationFailed,
        _ => ErrorKind::Transient,
    };
    let detail = response
        .text()
        .await
        .unwrap_or_else(|_| "no response body".to_string());
    IsotopeError::new_with_cause(
        context,
        kind.clone(),
        IsotopeError::new(&format!("status {}: {}", status, detail), kind),
    )
}

fn transport_error(context: &str, error: elasticsearch::Error) -> IsotopeError {
    IsotopeError::new_with_cause(
        context,
        ErrorKind::Transient,
        IsotopeError::transient(&error.to_string()),
    )
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
