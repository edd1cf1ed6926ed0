//! Command/query routing under staleness bounds.

use std::sync::Arc;
use std::time::Duration;

use isotope::cqrs::{CqrsRepository, FixedLagProbe, ReadPolicy};
use isotope::data;
use isotope::document::Document;
use isotope::errors::ErrorKind;
use isotope::repository::Repository;

use isotope_int_test::test_util::{memory_repository, unique_collection};

fn split_repository(
    policy: ReadPolicy,
) -> (Repository, Repository, Repository, Arc<FixedLagProbe>) {
    let commands = memory_repository();
    let queries = memory_repository();
    let probe = Arc::new(FixedLagProbe::new(Duration::ZERO));
    let cqrs = Repository::new(CqrsRepository::new(
        commands.clone(),
        queries.clone(),
        probe.clone(),
        policy,
    ));
    (cqrs, commands, queries, probe)
}

#[tokio::test]
async fn test_mutations_always_hit_the_command_side() {
    let (cqrs, commands, queries, _) =
        split_repository(ReadPolicy::with_fallback(Duration::from_secs(1)));
    let collection = unique_collection("users");

    let saved = cqrs
        .save(Document::with_id(&collection, "u-1", data! { name: "alice" }))
        .await
        .unwrap();

    commands.find_by_id(&collection, saved.id()).await.unwrap();
    let err = queries.find_by_id(&collection, saved.id()).await.unwrap_err();
    assert_eq!(err.kind(), &ErrorKind::NotFound);
}

#[tokio::test]
async fn test_reads_route_to_the_query_side_within_the_bound() {
    let (cqrs, _, queries, probe) =
        split_repository(ReadPolicy::with_fallback(Duration::from_secs(1)));
    let collection = unique_collection("users");

    // only the replica holds this document, so a replica-routed read finds it
    queries
        .save(Document::with_id(&collection, "u-1", data! { name: "replica" }))
        .await
        .unwrap();

    probe.set_lag(Duration::from_millis(200));
    let found = cqrs.find_by_id(&collection, "u-1").await.unwrap();
    assert_eq!(found.data().get("name").unwrap(), &isotope::common::Value::from("replica"));
}

#[tokio::test]
async fn test_lagging_replica_falls_back_to_the_command_side() {
    let (cqrs, commands, _, probe) =
        split_repository(ReadPolicy::with_fallback(Duration::from_secs(1)));
    let collection = unique_collection("users");

    commands
        .save(Document::with_id(&collection, "u-1", data! { name: "primary" }))
        .await
        .unwrap();

    probe.set_lag(Duration::from_secs(30));
    let found = cqrs.find_by_id(&collection, "u-1").await.unwrap();
    assert_eq!(found.data().get("name").unwrap(), &isotope::common::Value::from("primary"));
}

#[tokio::test]
async fn test_strict_policy_fails_reads_beyond_the_bound() {
    let (cqrs, commands, _, probe) = split_repository(ReadPolicy::strict(Duration::from_secs(1)));
    let collection = unique_collection("users");

    commands
        .save(Document::with_id(&collection, "u-1", data! { name: "primary" }))
        .await
        .unwrap();

    probe.set_lag(Duration::from_secs(30));
    let err = cqrs.find_by_id(&collection, "u-1").await.unwrap_err();
    assert_eq!(err.kind(), &ErrorKind::Transient);

    // writes stay unaffected by the stale replica
    let saved = cqrs
        .save(Document::with_id(&collection, "u-2", data! { name: "bob" }))
        .await
        .unwrap();
    assert_eq!(saved.version(), 1);
}
