use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::Utc;
use indexmap::IndexMap;
use itertools::Itertools;

use crate::common::{value_to_json, DocumentData, Value};
use crate::document::Document;
use crate::errors::{IsotopeError, IsotopeResult};
use crate::event::ChangeEvent;
use crate::filter::Filter;
use crate::repository::{validate, IndexModel};
use crate::translate;

/// One collection's documents and index definitions, documents keyed by id.
#[derive(Clone, Default)]
pub(crate) struct CollectionState {
    pub(crate) documents: BTreeMap<String, Document>,
    pub(crate) indexes: IndexMap<String, IndexModel>,
}

/// The whole store. Cloning snapshots it, which is what transaction
/// rollback relies on.
#[derive(Clone, Default)]
pub(crate) struct MemoryStore {
    pub(crate) collections: HashMap<String, CollectionState>,
}

fn state<'a>(store: &'a MemoryStore, collection: &str) -> Option<&'a CollectionState> {
    store.collections.get(collection)
}

fn state_mut<'a>(store: &'a mut MemoryStore, collection: &str) -> &'a mut CollectionState {
    store.collections.entry(collection.to_string()).or_default()
}

fn missing_document(collection: &str, id: &str) -> IsotopeError {
    IsotopeError::not_found(&format!("document '{}/{}' does not exist", collection, id))
}

fn no_match(collection: &str) -> IsotopeError {
    IsotopeError::not_found(&format!(
        "no document in '{}' matches the filter",
        collection
    ))
}

fn stale_version(document: &Document, expected: i64) -> IsotopeError {
    IsotopeError::version_conflict(&format!(
        "expected version {} of '{}/{}' but found {}",
        expected,
        document.collection(),
        document.id(),
        document.version()
    ))
}

/// Value fingerprint of a document under an index, used for uniqueness.
/// Sparse indexes skip documents missing any indexed field.
fn index_fingerprint(document: &Document, model: &IndexModel) -> Option<String> {
    if model.options().sparse
        && model.keys().iter().any(|key| document.get(&key.field).is_none())
    {
        return None;
    }
    let fingerprint = model
        .keys()
        .iter()
        .map(|key| value_to_json(document.get(&key.field).unwrap_or(&Value::Null)).to_string())
        .join("\u{1f}");
    Some(fingerprint)
}

fn unique_violation(name: &str, collection: &str) -> IsotopeError {
    IsotopeError::validation_failed(&format!(
        "unique index '{}' on '{}' violated",
        name, collection
    ))
}

/// Checks a candidate document against every unique index, ignoring the
/// document stored under the candidate's own id.
fn check_unique<'a>(
    indexes: &IndexMap<String, IndexModel>,
    documents: impl Iterator<Item = &'a Document> + Clone,
    candidate: &Document,
) -> IsotopeResult<()> {
    for (name, model) in indexes {
        if !model.options().unique {
            continue;
        }
        let Some(fingerprint) = index_fingerprint(candidate, model) else {
            continue;
        };
        let conflict = documents.clone().any(|existing| {
            existing.id() != candidate.id()
                && index_fingerprint(existing, model).as_deref() == Some(fingerprint.as_str())
        });
        if conflict {
            return Err(unique_violation(name, candidate.collection()));
        }
    }
    Ok(())
}

fn advance(current: &Document, data: DocumentData) -> Document {
    Document::from_stored(
        current.id().to_string(),
        current.collection().to_string(),
        data,
        current.version() + 1,
        current.created_at(),
        Utc::now(),
    )
}

fn first_match<'a>(state: &'a CollectionState, filter: &Filter) -> Option<&'a Document> {
    state
        .documents
        .values()
        .find(|document| translate::matches_filter(document, filter))
}

pub(crate) fn save(
    store: &mut MemoryStore,
    document: Document,
) -> IsotopeResult<(Document, ChangeEvent)> {
    validate::unsaved_document(&document)?;
    let document = document.into_first_version(Utc::now());
    let state = state_mut(store, document.collection());
    if state.documents.contains_key(document.id()) {
        return Err(IsotopeError::validation_failed(&format!(
            "document '{}/{}' already exists",
            document.collection(),
            document.id()
        )));
    }
    check_unique(&state.indexes, state.documents.values(), &document)?;
    state
        .documents
        .insert(document.id().to_string(), document.clone());
    let event = ChangeEvent::created(&document);
    Ok((document, event))
}

pub(crate) fn find_by_id(
    store: &MemoryStore,
    collection: &str,
    id: &str,
) -> IsotopeResult<Document> {
    validate::document_id(id)?;
    state(store, collection)
        .and_then(|state| state.documents.get(id))
        .cloned()
        .ok_or_else(|| missing_document(collection, id))
}

pub(crate) fn find_all(store: &MemoryStore, collection: &str) -> Vec<Document> {
    state(store, collection)
        .map(|state| state.documents.values().cloned().collect())
        .unwrap_or_default()
}

pub(crate) fn update(
    store: &mut MemoryStore,
    collection: &str,
    id: &str,
    expected_version: i64,
    update: &DocumentData,
) -> IsotopeResult<(Document, ChangeEvent)> {
    validate::document_id(id)?;
    validate::expected_version(expected_version)?;
    validate::update_payload(update)?;
    let state = store
        .collections
        .get_mut(collection)
        .ok_or_else(|| missing_document(collection, id))?;
    let current = state
        .documents
        .get(id)
        .ok_or_else(|| missing_document(collection, id))?;
    if current.version() != expected_version {
        return Err(stale_version(current, expected_version));
    }
    let mut data = current.data().clone();
    translate::apply_update(&mut data, update);
    let updated = advance(current, data);
    check_unique(&state.indexes, state.documents.values(), &updated)?;
    state.documents.insert(id.to_string(), updated.clone());
    let event = ChangeEvent::updated(&updated);
    Ok((updated, event))
}

pub(crate) fn replace(
    store: &mut MemoryStore,
    document: &Document,
) -> IsotopeResult<(Document, ChangeEvent)> {
    validate::stored_document(document)?;
    let state = store
        .collections
        .get_mut(document.collection())
        .ok_or_else(|| missing_document(document.collection(), document.id()))?;
    let current = state
        .documents
        .get(document.id())
        .ok_or_else(|| missing_document(document.collection(), document.id()))?;
    if current.version() != document.version() {
        return Err(stale_version(current, document.version()));
    }
    let replaced = advance(current, document.data().clone());
    check_unique(&state.indexes, state.documents.values(), &replaced)?;
    state
        .documents
        .insert(replaced.id().to_string(), replaced.clone());
    let event = ChangeEvent::replaced(&replaced);
    Ok((replaced, event))
}

pub(crate) fn delete(
    store: &mut MemoryStore,
    collection: &str,
    id: &str,
    expected_version: i64,
) -> IsotopeResult<ChangeEvent> {
    validate::document_id(id)?;
    validate::expected_version(expected_version)?;
    let state = store
        .collections
        .get_mut(collection)
        .ok_or_else(|| missing_document(collection, id))?;
    let current = state
        .documents
        .get(id)
        .ok_or_else(|| missing_document(collection, id))?;
    if current.version() != expected_version {
        return Err(stale_version(current, expected_version));
    }
    let removed_version = current.version();
    state.documents.remove(id);
    Ok(ChangeEvent::deleted(collection, id, removed_version))
}

pub(crate) fn update_many(
    store: &mut MemoryStore,
    collection: &str,
    filter: &Filter,
    update: &DocumentData,
) -> IsotopeResult<(u64, Vec<ChangeEvent>)> {
    validate::broad_mutation_filter(filter, "update_many")?;
    validate::update_payload(update)?;
    let Some(state) = store.collections.get_mut(collection) else {
        return Ok((0, Vec::new()));
    };

    // stage every updated document first so a unique violation leaves the
    // collection untouched
    let mut next = state.documents.clone();
    let mut touched = Vec::new();
    for document in state.documents.values() {
        if !translate::matches_filter(document, filter) {
            continue;
        }
        let mut data = document.data().clone();
        translate::apply_update(&mut data, update);
        let updated = advance(document, data);
        next.insert(updated.id().to_string(), updated.clone());
        touched.push(updated);
    }
    for updated in &touched {
        check_unique(&state.indexes, next.values(), updated)?;
    }

    state.documents = next;
    let events = touched.iter().map(ChangeEvent::updated).collect();
    Ok((touched.len() as u64, events))
}

pub(crate) fn delete_many(
    store: &mut MemoryStore,
    collection: &str,
    filter: &Filter,
) -> IsotopeResult<(u64, Vec<ChangeEvent>)> {
    validate::broad_mutation_filter(filter, "delete_many")?;
    let Some(state) = store.collections.get_mut(collection) else {
        return Ok((0, Vec::new()));
    };
    let matched: Vec<String> = state
        .documents
        .values()
        .filter(|document| translate::matches_filter(document, filter))
        .map(|document| document.id().to_string())
        .collect();
    let mut events = Vec::with_capacity(matched.len());
    for id in &matched {
        if let Some(removed) = state.documents.remove(id) {
            events.push(ChangeEvent::deleted(collection, id, removed.version()));
        }
    }
    Ok((matched.len() as u64, events))
}

pub(crate) fn find_and_update(
    store: &mut MemoryStore,
    collection: &str,
    filter: &Filter,
    update_map: &DocumentData,
) -> IsotopeResult<(Document, ChangeEvent)> {
    validate::filter_fields(filter)?;
    validate::update_payload(update_map)?;
    let id = state(store, collection)
        .and_then(|state| first_match(state, filter))
        .map(|document| document.id().to_string())
        .ok_or_else(|| no_match(collection))?;
    let expected = find_by_id(store, collection, &id)?.version();
    update(store, collection, &id, expected, update_map)
}

pub(crate) fn find_one_and_replace(
    store: &mut MemoryStore,
    collection: &str,
    filter: &Filter,
    data: &DocumentData,
) -> IsotopeResult<(Document, ChangeEvent)> {
    validate::filter_fields(filter)?;
    for field in data.keys() {
        validate::field_name(field)?;
    }
    let state = store
        .collections
        .get_mut(collection)
        .ok_or_else(|| no_match(collection))?;
    let current = first_match(state, filter)
        .cloned()
        .ok_or_else(|| no_match(collection))?;
    let replaced = advance(&current, data.clone());
    check_unique(&state.indexes, state.documents.values(), &replaced)?;
    state
        .documents
        .insert(replaced.id().to_string(), replaced.clone());
    let event = ChangeEvent::replaced(&replaced);
    Ok((replaced, event))
}

pub(crate) fn find_one_and_delete(
    store: &mut MemoryStore,
    collection: &str,
    filter: &Filter,
) -> IsotopeResult<(Document, ChangeEvent)> {
    validate::filter_fields(filter)?;
    let state = store
        .collections
        .get_mut(collection)
        .ok_or_else(|| no_match(collection))?;
    let removed = first_match(state, filter)
        .cloned()
        .ok_or_else(|| no_match(collection))?;
    state.documents.remove(removed.id());
    let event = ChangeEvent::deleted(collection, removed.id(), removed.version());
    Ok((removed, event))
}

pub(crate) fn upsert(
    store: &mut MemoryStore,
    collection: &str,
    filter: &Filter,
    update_map: &DocumentData,
) -> IsotopeResult<(Document, ChangeEvent)> {
    validate::filter_fields(filter)?;
    validate::update_payload(update_map)?;
    let matched = state(store, collection)
        .and_then(|state| first_match(state, filter))
        .map(|document| document.id().to_string());
    match matched {
        Some(id) => {
            let expected = find_by_id(store, collection, &id)?.version();
            update(store, collection, &id, expected, update_map)
        }
        None => {
            let document = translate::upsert_document(collection, filter, update_map);
            save(store, document)
        }
    }
}

pub(crate) fn count(store: &MemoryStore, collection: &str, filter: &Filter) -> u64 {
    state(store, collection)
        .map(|state| {
            state
                .documents
                .values()
                .filter(|document| translate::matches_filter(document, filter))
                .count() as u64
        })
        .unwrap_or(0)
}

pub(crate) fn create_index(
    store: &mut MemoryStore,
    collection: &str,
    model: IndexModel,
) -> IsotopeResult<String> {
    validate::collection_name(collection)?;
    for key in model.keys() {
        validate::field_name(&key.field)?;
    }
    if model.options().ttl_seconds.is_some() {
        return Err(IsotopeError::unsupported(
            "the in-memory backend does not expire documents, TTL indexes are not available",
        ));
    }
    if model.options().text {
        return Err(IsotopeError::unsupported(
            "the in-memory backend has no text search, text indexes are not available",
        ));
    }
    if model.options().partial_filter.is_some() {
        return Err(IsotopeError::unsupported(
            "the in-memory backend does not evaluate partial index filters",
        ));
    }

    let name = model.resolve_name(collection);
    let state = state_mut(store, collection);
    if let Some(existing) = state.indexes.get(&name) {
        if *existing == model {
            return Ok(name);
        }
        return Err(IsotopeError::validation_failed(&format!(
            "index '{}' already exists on '{}' with a different definition",
            name, collection
        )));
    }
    if model.options().unique {
        let mut seen = HashSet::new();
        for document in state.documents.values() {
            if let Some(fingerprint) = index_fingerprint(document, &model) {
                if !seen.insert(fingerprint) {
                    return Err(unique_violation(&name, collection));
                }
            }
        }
    }
    state.indexes.insert(name.clone(), model);
    Ok(name)
}

pub(crate) fn drop_index(
    store: &mut MemoryStore,
    collection: &str,
    name: &str,
) -> IsotopeResult<()> {
    let state = store
        .collections
        .get_mut(collection)
        .ok_or_else(|| IsotopeError::not_found(&format!("collection '{}' does not exist", collection)))?;
    state
        .indexes
        .shift_remove(name)
        .map(|_| ())
        .ok_or_else(|| {
            IsotopeError::not_found(&format!(
                "index '{}' does not exist on '{}'",
                name, collection
            ))
        })
}

pub(crate) fn list_indexes(store: &MemoryStore, collection: &str) -> Vec<IndexModel> {
    state(store, collection)
        .map(|state| state.indexes.values().cloned().collect())
        .unwrap_or_default()
}

pub(crate) fn create_collection(store: &mut MemoryStore, name: &str) -> IsotopeResult<()> {
    validate::collection_name(name)?;
    state_mut(store, name);
    Ok(())
}

pub(crate) fn drop_collection(store: &mut MemoryStore, name: &str) -> IsotopeResult<()> {
    validate::collection_name(name)?;
    store.collections.remove(name);
    Ok(())
}

pub(crate) fn rename_collection(
    store: &mut MemoryStore,
    old_name: &str,
    new_name: &str,
) -> IsotopeResult<()> {
    validate::collection_name(old_name)?;
    validate::collection_name(new_name)?;
    if store.collections.contains_key(new_name) {
        return Err(IsotopeError::invalid_argument(&format!(
            "target collection '{}' already exists",
            new_name
        )));
    }
    let old_state = store.collections.remove(old_name).ok_or_else(|| {
        IsotopeError::not_found(&format!("collection '{}' does not exist", old_name))
    })?;
    let documents = old_state
        .documents
        .into_iter()
        .map(|(id, document)| {
            let renamed = Document::from_stored(
                document.id().to_string(),
                new_name.to_string(),
                document.data().clone(),
                document.version(),
                document.created_at(),
                document.updated_at(),
            );
            (id, renamed)
        })
        .collect();
    store.collections.insert(
        new_name.to_string(),
        CollectionState {
            documents,
            indexes: old_state.indexes,
        },
    );
    Ok(())
}

pub(crate) fn list_collections(store: &MemoryStore) -> Vec<String> {
    store.collections.keys().cloned().sorted().collect()
}

pub(crate) fn collection_exists(store: &MemoryStore, name: &str) -> bool {
    store.collections.contains_key(name)
}
