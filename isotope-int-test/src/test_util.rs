//! Shared helpers for the integration suites.

use std::env;

use isotope::common::DocumentData;
use isotope::data;
use isotope::document::Document;
use isotope::errors::ErrorKind;
use isotope::filter::Filter;
use isotope::memory::MemoryRepository;
use isotope::repository::Repository;

use isotope_elastic_adapter::{ElasticConfig, ElasticRepository};
use isotope_mongodb_adapter::{MongoConfig, MongoRepository};
use isotope_scylla_adapter::{ScyllaConfig, ScyllaRepository};
use isotope_sqlx_adapter::{SqlxConfig, SqlxRepository};

#[ctor::ctor]
fn init_logging() {
    colog::init();
}

/// Collection name that cannot collide across test runs sharing a backend.
pub fn unique_collection(prefix: &str) -> String {
    format!("{}_{}", prefix, uuid::Uuid::new_v4().simple())
}

pub fn user_data(name: &str, age: i64) -> DocumentData {
    data! { name: name, age: age }
}

pub fn order_data(status: &str, amount: f64) -> DocumentData {
    data! { status: status, amount: amount }
}

/// In-memory repository, the unconditional test backend.
pub fn memory_repository() -> Repository {
    Repository::new(MemoryRepository::new())
}

/// Document store, gated on `ISOTOPE_MONGO_URL`.
pub async fn mongo_repository() -> Option<Repository> {
    let uri = env::var("ISOTOPE_MONGO_URL").ok()?;
    let config = MongoConfig::new(&uri, "isotope_it");
    let repository = MongoRepository::connect(config)
        .await
        .expect("document store connection");
    Some(Repository::new(repository))
}

/// Relational backend, gated on `ISOTOPE_SQLX_URL`.
pub async fn sqlx_repository() -> Option<Repository> {
    let url = env::var("ISOTOPE_SQLX_URL").ok()?;
    let repository = SqlxRepository::connect(SqlxConfig::new(&url))
        .await
        .expect("relational connection");
    Some(Repository::new(repository))
}

/// Wide-column backend, gated on `ISOTOPE_SCYLLA_NODES` (comma-separated).
pub async fn scylla_repository() -> Option<Repository> {
    let raw = env::var("ISOTOPE_SCYLLA_NODES").ok()?;
    let nodes = raw
        .split(',')
        .map(|node| node.trim().to_string())
        .filter(|node| !node.is_empty())
        .collect();
    let repository = ScyllaRepository::connect(ScyllaConfig::new(nodes, "isotope_it"))
        .await
        .expect("wide-column connection");
    Some(Repository::new(repository))
}

/// Search-index backend, gated on `ISOTOPE_ELASTIC_URL`.
pub async fn elastic_repository() -> Option<Repository> {
    let url = env::var("ISOTOPE_ELASTIC_URL").ok()?;
    let repository =
        ElasticRepository::connect(ElasticConfig::new(&url)).expect("search-index connection");
    Some(Repository::new(repository))
}

/// The basic contract cycle every backend must pass: insert, read back,
/// stale-version conflict, conditional update and delete, count.
pub async fn contract_smoke(repo: &Repository) {
    let collection = unique_collection("smoke");

    let saved = repo
        .save(Document::new(&collection, user_data("alice", 34)))
        .await
        .expect("save");
    assert_eq!(saved.version(), 1);

    let found = repo
        .find_by_id(&collection, saved.id())
        .await
        .expect("find saved");
    assert_eq!(found.data(), saved.data());
    assert_eq!(found.version(), 1);

    let updated = repo
        .update(&collection, saved.id(), 1, &data! { age: 35 })
        .await
        .expect("update");
    assert_eq!(updated.version(), 2);

    let stale = repo
        .update(&collection, saved.id(), 1, &data! { age: 36 })
        .await
        .unwrap_err();
    assert_eq!(stale.kind(), &ErrorKind::VersionConflict);

    assert_eq!(repo.count(&collection, &Filter::empty()).await.expect("count"), 1);

    repo.delete(&collection, saved.id(), 2).await.expect("delete");
    let missing = repo.find_by_id(&collection, saved.id()).await.unwrap_err();
    assert_eq!(missing.kind(), &ErrorKind::NotFound);

    repo.drop_collection(&collection).await.expect("cleanup");
}
