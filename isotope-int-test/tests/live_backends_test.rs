//! Smoke suites against live backends.
//!
//! Each test reads its connection settings from the environment and returns
//! early when the variable is unset, so the suite passes without any running
//! services. See `test_util` for the variable names.

use isotope::document::Document;
use isotope::errors::ErrorKind;

use isotope_int_test::test_util::{
    contract_smoke, elastic_repository, mongo_repository, scylla_repository, sqlx_repository,
    unique_collection, user_data,
};

#[tokio::test]
async fn test_mongo_contract_smoke() {
    let Some(repo) = mongo_repository().await else {
        return;
    };
    repo.health_check().await.expect("health check");
    contract_smoke(&repo).await;
}

#[tokio::test]
async fn test_mongo_batch_insert_keeps_the_applied_prefix() {
    let Some(repo) = mongo_repository().await else {
        return;
    };
    let collection = unique_collection("batch");
    repo.save(Document::with_id(&collection, "b-2", user_data("bob", 2)))
        .await
        .unwrap();

    // ordered batch: the duplicate id stops it, earlier documents stay
    let err = repo
        .save_many(vec![
            Document::with_id(&collection, "b-1", user_data("ann", 1)),
            Document::with_id(&collection, "b-2", user_data("dup", 2)),
            Document::with_id(&collection, "b-3", user_data("cid", 3)),
        ])
        .await
        .unwrap_err();
    assert_eq!(err.kind(), &ErrorKind::ValidationFailed);

    repo.find_by_id(&collection, "b-1").await.unwrap();
    let missing = repo.find_by_id(&collection, "b-3").await.unwrap_err();
    assert_eq!(missing.kind(), &ErrorKind::NotFound);
    repo.drop_collection(&collection).await.unwrap();
}

#[tokio::test]
async fn test_sqlx_contract_smoke() {
    let Some(repo) = sqlx_repository().await else {
        return;
    };
    repo.health_check().await.expect("health check");
    contract_smoke(&repo).await;
}

#[tokio::test]
async fn test_scylla_contract_smoke() {
    let Some(repo) = scylla_repository().await else {
        return;
    };
    repo.health_check().await.expect("health check");
    contract_smoke(&repo).await;
}

#[tokio::test]
async fn test_elastic_contract_smoke() {
    let Some(repo) = elastic_repository().await else {
        return;
    };
    repo.health_check().await.expect("health check");
    contract_smoke(&repo).await;
}
