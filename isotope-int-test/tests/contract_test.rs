//! Repository contract suite, run against the in-memory backend.

use isotope::aggregate::{Accumulator, GroupSpec, PipelineStage};
use isotope::common::{SortOrder, Value};
use isotope::data;
use isotope::document::Document;
use isotope::errors::ErrorKind;
use isotope::filter::{field, Filter};
use isotope::repository::{
    transaction, BulkOperation, FindOptions, IndexKey, IndexModel, IndexOptions,
};

use isotope_int_test::test_util::{memory_repository, order_data, unique_collection, user_data};

#[tokio::test]
async fn test_save_then_find_returns_same_data_at_version_one() {
    let repo = memory_repository();
    let collection = unique_collection("users");

    let saved = repo
        .save(Document::new(&collection, user_data("alice", 34)))
        .await
        .unwrap();
    assert_eq!(saved.version(), 1);
    assert!(!saved.id().is_empty());

    let found = repo.find_by_id(&collection, saved.id()).await.unwrap();
    assert_eq!(found.data(), saved.data());
    assert_eq!(found.version(), 1);
}

#[tokio::test]
async fn test_save_rejects_duplicate_id() {
    let repo = memory_repository();
    let collection = unique_collection("users");

    repo.save(Document::with_id(&collection, "u-1", user_data("alice", 34)))
        .await
        .unwrap();
    let err = repo
        .save(Document::with_id(&collection, "u-1", user_data("bob", 41)))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), &ErrorKind::ValidationFailed);
}

#[tokio::test]
async fn test_update_bumps_version_and_stale_retry_conflicts() {
    let repo = memory_repository();
    let collection = unique_collection("users");
    let saved = repo
        .save(Document::new(&collection, user_data("alice", 34)))
        .await
        .unwrap();

    let updated = repo
        .update(&collection, saved.id(), 1, &data! { age: 35 })
        .await
        .unwrap();
    assert_eq!(updated.version(), 2);
    assert_eq!(updated.data().get("age"), Some(&Value::I64(35)));
    assert_eq!(updated.data().get("name"), Some(&Value::from("alice")));

    let stale = repo
        .update(&collection, saved.id(), 1, &data! { age: 36 })
        .await
        .unwrap_err();
    assert_eq!(stale.kind(), &ErrorKind::VersionConflict);

    // the conflicting attempt must not have changed anything
    let current = repo.find_by_id(&collection, saved.id()).await.unwrap();
    assert_eq!(current.version(), 2);
    assert_eq!(current.data().get("age"), Some(&Value::I64(35)));
}

#[tokio::test]
async fn test_replace_swaps_payload_and_conflicts_when_stale() {
    let repo = memory_repository();
    let collection = unique_collection("users");
    let saved = repo
        .save(Document::new(&collection, user_data("alice", 34)))
        .await
        .unwrap();

    let replacement = saved.with_data(data! { name: "alice", role: "admin" });
    let replaced = repo.replace(&replacement).await.unwrap();
    assert_eq!(replaced.version(), 2);
    assert_eq!(replaced.data().get("age"), None);
    assert_eq!(replaced.data().get("role"), Some(&Value::from("admin")));

    // replaying the same witnessed state is now stale
    let err = repo.replace(&replacement).await.unwrap_err();
    assert_eq!(err.kind(), &ErrorKind::VersionConflict);
}

#[tokio::test]
async fn test_concurrent_find_and_update_yields_distinct_increasing_versions() {
    let repo = memory_repository();
    let collection = unique_collection("counters");
    let saved = repo
        .save(Document::with_id(&collection, "c-1", data! { hits: 0 }))
        .await
        .unwrap();

    let mut tasks = Vec::new();
    for n in 0..8i64 {
        let repo = repo.clone();
        let collection = collection.clone();
        tasks.push(tokio::spawn(async move {
            repo.find_and_update(&collection, &Filter::by_id("c-1"), &data! { hits: n })
                .await
                .unwrap()
                .version()
        }));
    }

    let mut versions = Vec::new();
    for task in tasks {
        versions.push(task.await.unwrap());
    }
    versions.sort();
    assert_eq!(versions, (2..=9).collect::<Vec<i64>>());

    let current = repo.find_by_id(&collection, saved.id()).await.unwrap();
    assert_eq!(current.version(), 9);
}

#[tokio::test]
async fn test_delete_requires_current_version() {
    let repo = memory_repository();
    let collection = unique_collection("users");
    let saved = repo
        .save(Document::new(&collection, user_data("alice", 34)))
        .await
        .unwrap();
    repo.update(&collection, saved.id(), 1, &data! { age: 35 })
        .await
        .unwrap();

    let stale = repo.delete(&collection, saved.id(), 1).await.unwrap_err();
    assert_eq!(stale.kind(), &ErrorKind::VersionConflict);

    repo.delete(&collection, saved.id(), 2).await.unwrap();
    let missing = repo.find_by_id(&collection, saved.id()).await.unwrap_err();
    assert_eq!(missing.kind(), &ErrorKind::NotFound);

    let gone = repo.delete(&collection, saved.id(), 2).await.unwrap_err();
    assert_eq!(gone.kind(), &ErrorKind::NotFound);
}

#[tokio::test]
async fn test_upsert_creates_once_then_updates_in_place() {
    let repo = memory_repository();
    let collection = unique_collection("settings");
    let filter = field("key").eq("theme");

    let created = repo
        .upsert(&collection, &filter, &data! { key: "theme", value: "dark" })
        .await
        .unwrap();
    assert_eq!(created.version(), 1);

    let updated = repo
        .upsert(&collection, &filter, &data! { value: "light" })
        .await
        .unwrap();
    assert_eq!(updated.id(), created.id());
    assert_eq!(updated.version(), 2);
    assert_eq!(updated.data().get("value"), Some(&Value::from("light")));

    assert_eq!(repo.count(&collection, &Filter::empty()).await.unwrap(), 1);
}

#[tokio::test]
async fn test_bulk_write_accounts_per_operation_type() {
    let repo = memory_repository();
    let collection = unique_collection("orders");
    repo.save(Document::with_id(&collection, "o-1", order_data("open", 10.0)))
        .await
        .unwrap();
    repo.save(Document::with_id(&collection, "o-2", order_data("open", 20.0)))
        .await
        .unwrap();
    repo.save(Document::with_id(&collection, "o-3", order_data("stale", 5.0)))
        .await
        .unwrap();

    let result = repo
        .bulk_write(vec![
            BulkOperation::Insert {
                collection: collection.clone(),
                document: Document::with_id(&collection, "o-4", order_data("open", 40.0)),
            },
            BulkOperation::Update {
                collection: collection.clone(),
                filter: field("status").eq("open"),
                update: data! { status: "closed" },
                multi: true,
                upsert: false,
            },
            BulkOperation::Delete {
                collection: collection.clone(),
                filter: field("status").eq("stale"),
                multi: false,
            },
            BulkOperation::Update {
                collection: collection.clone(),
                filter: Filter::by_id("o-9"),
                update: data! { status: "open" },
                multi: false,
                upsert: true,
            },
        ])
        .await
        .unwrap();

    assert_eq!(result.inserted_count(), 1);
    assert_eq!(result.modified_count(), 3);
    assert_eq!(result.deleted_count(), 1);
    assert_eq!(result.upserted_ids().get(&3), Some(&"o-9".to_string()));
    assert!(!result.has_errors());
}

#[tokio::test]
async fn test_bulk_write_partial_failure_leaves_independent_operations_applied() {
    let repo = memory_repository();
    let collection = unique_collection("orders");
    repo.save(Document::with_id(&collection, "o-1", order_data("open", 10.0)))
        .await
        .unwrap();

    let result = repo
        .bulk_write(vec![
            BulkOperation::Insert {
                collection: collection.clone(),
                document: Document::with_id(&collection, "o-1", order_data("open", 99.0)),
            },
            BulkOperation::Insert {
                collection: collection.clone(),
                document: Document::with_id(&collection, "o-2", order_data("open", 20.0)),
            },
        ])
        .await
        .unwrap();

    assert_eq!(result.inserted_count(), 1);
    let error = result.errors().get(&0).unwrap();
    assert_eq!(error.kind(), &ErrorKind::ValidationFailed);

    // the duplicate insert must not have clobbered the stored payload
    let untouched = repo.find_by_id(&collection, "o-1").await.unwrap();
    assert_eq!(untouched.data().get("amount"), Some(&Value::F64(10.0)));
    repo.find_by_id(&collection, "o-2").await.unwrap();
}

#[tokio::test]
async fn test_delete_many_three_of_five_leaves_two() {
    let repo = memory_repository();
    let collection = unique_collection("users");
    for (name, active) in [
        ("a", true),
        ("b", true),
        ("c", true),
        ("d", false),
        ("e", false),
    ] {
        repo.save(Document::new(&collection, data! { name: name, active: active }))
            .await
            .unwrap();
    }

    let deleted = repo
        .delete_many(&collection, &field("active").eq(true))
        .await
        .unwrap();
    assert_eq!(deleted, 3);
    assert_eq!(repo.count(&collection, &Filter::empty()).await.unwrap(), 2);

    // unfiltered collection-wide mutations are refused
    let err = repo
        .delete_many(&collection, &Filter::empty())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), &ErrorKind::InvalidArgument);
}

#[tokio::test]
async fn test_find_with_options_sorts_pages_and_projects() {
    let repo = memory_repository();
    let collection = unique_collection("orders");
    for (id, amount) in [("o-1", 30.0), ("o-2", 10.0), ("o-3", 20.0), ("o-4", 40.0)] {
        repo.save(Document::with_id(&collection, id, order_data("open", amount)))
            .await
            .unwrap();
    }

    let options = FindOptions::new()
        .sort_by("amount", SortOrder::Ascending)
        .skip(1)
        .limit(2)
        .project(&["amount"]);
    let page = repo
        .find_with_options(&collection, &Filter::empty(), &options)
        .await
        .unwrap();

    let ids: Vec<&str> = page.iter().map(Document::id).collect();
    assert_eq!(ids, vec!["o-3", "o-1"]);
    for document in &page {
        assert!(document.data().contains_key("amount"));
        assert!(!document.data().contains_key("status"));
    }
}

#[tokio::test]
async fn test_aggregate_match_group_computes_accumulators() {
    let repo = memory_repository();
    let collection = unique_collection("orders");
    for (status, amount) in [("open", 10.0), ("open", 30.0), ("closed", 5.0), ("open", 20.0)] {
        repo.save(Document::new(&collection, order_data(status, amount)))
            .await
            .unwrap();
    }

    let pipeline = vec![
        PipelineStage::Match(field("status").eq("open")),
        PipelineStage::Group(
            GroupSpec::by_field("status")
                .accumulate("total", Accumulator::Sum("amount".to_string()))
                .accumulate("orders", Accumulator::Count),
        ),
    ];
    let rows = repo.aggregate(&collection, &pipeline).await.unwrap();

    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("status"), Some(&Value::from("open")));
    assert_eq!(rows[0].get("total"), Some(&Value::F64(60.0)));
    assert_eq!(rows[0].get("orders"), Some(&Value::I64(3)));
}

#[tokio::test]
async fn test_distinct_returns_each_value_once() {
    let repo = memory_repository();
    let collection = unique_collection("orders");
    for status in ["open", "closed", "open", "open"] {
        repo.save(Document::new(&collection, order_data(status, 1.0)))
            .await
            .unwrap();
    }

    let values = repo
        .distinct(&collection, "status", &Filter::empty())
        .await
        .unwrap();
    assert_eq!(values, vec![Value::from("open"), Value::from("closed")]);
}

#[tokio::test]
async fn test_transaction_commits_on_ok_and_rolls_back_on_err() {
    let repo = memory_repository();
    let collection = unique_collection("accounts");
    let saved = repo
        .save(Document::with_id(&collection, "a-1", data! { balance: 100 }))
        .await
        .unwrap();

    let tx_collection = collection.clone();
    repo.with_transaction(transaction(move |tx| {
        let collection = tx_collection.clone();
        Box::pin(async move {
            let account = tx.find_by_id(&collection, "a-1").await?;
            tx.update(&collection, "a-1", account.version(), &data! { balance: 50 })
                .await?;
            tx.save(Document::with_id(&collection, "a-2", data! { balance: 50 }))
                .await?;
            Ok(())
        })
    }))
    .await
    .unwrap();

    assert_eq!(
        repo.find_by_id(&collection, "a-1")
            .await
            .unwrap()
            .data()
            .get("balance"),
        Some(&Value::I64(50))
    );
    repo.find_by_id(&collection, "a-2").await.unwrap();

    let tx_collection = collection.clone();
    let err = repo
        .with_transaction(transaction(move |tx| {
            let collection = tx_collection.clone();
            Box::pin(async move {
                tx.delete(&collection, "a-2", 1).await?;
                Err(isotope::errors::IsotopeError::transient("simulated failure"))
            })
        }))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), &ErrorKind::Transient);

    // the rolled-back delete must not be visible
    repo.find_by_id(&collection, "a-2").await.unwrap();
    let _ = saved;
}

#[tokio::test]
async fn test_collection_management_cycle() {
    let repo = memory_repository();
    let old_name = unique_collection("events");
    let new_name = unique_collection("archive");

    assert!(!repo.collection_exists(&old_name).await.unwrap());
    repo.create_collection(&old_name).await.unwrap();
    assert!(repo.collection_exists(&old_name).await.unwrap());
    // idempotent
    repo.create_collection(&old_name).await.unwrap();

    repo.save(Document::with_id(&old_name, "e-1", data! { kind: "login" }))
        .await
        .unwrap();
    repo.rename_collection(&old_name, &new_name).await.unwrap();
    assert!(!repo.collection_exists(&old_name).await.unwrap());
    let carried = repo.find_by_id(&new_name, "e-1").await.unwrap();
    assert_eq!(carried.version(), 1);

    repo.drop_collection(&new_name).await.unwrap();
    assert!(!repo.collection_exists(&new_name).await.unwrap());
    // dropping a missing collection is a no-op
    repo.drop_collection(&new_name).await.unwrap();
}

#[tokio::test]
async fn test_index_management_cycle() {
    let repo = memory_repository();
    let collection = unique_collection("users");
    repo.create_collection(&collection).await.unwrap();

    let name = repo
        .create_index(
            &collection,
            IndexModel::new(vec![IndexKey::asc("email")])
                .with_options(IndexOptions::new().named("email_idx").unique()),
        )
        .await
        .unwrap();
    assert_eq!(name, "email_idx");

    // re-creating the identical index is idempotent
    let again = repo
        .create_index(
            &collection,
            IndexModel::new(vec![IndexKey::asc("email")])
                .with_options(IndexOptions::new().named("email_idx").unique()),
        )
        .await
        .unwrap();
    assert_eq!(again, "email_idx");

    let conflicting = repo
        .create_index(
            &collection,
            IndexModel::on("email").with_options(IndexOptions::new().named("email_idx")),
        )
        .await
        .unwrap_err();
    assert_eq!(conflicting.kind(), &ErrorKind::ValidationFailed);

    let models = repo.list_indexes(&collection).await.unwrap();
    assert_eq!(models.len(), 1);
    assert!(models[0].options().unique);

    repo.drop_index(&collection, "email_idx").await.unwrap();
    assert!(repo.list_indexes(&collection).await.unwrap().is_empty());

    let missing = repo.drop_index(&collection, "email_idx").await.unwrap_err();
    assert_eq!(missing.kind(), &ErrorKind::NotFound);
}
