//! Translation between the contract types and their BSON representation.
//!
//! A stored document is `{_id, data, version, created_at, updated_at}`. The
//! `id` filter key maps to `_id`; every other filter, sort, projection, or
//! group field maps to a `data.<field>` path. Field names are validated
//! against the identifier charset before they reach these renderers, so
//! building paths by concatenation is safe.

use chrono::{DateTime, Utc};

use isotope::aggregate::{Accumulator, GroupSpec, PipelineStage};
use isotope::common::constants::{
    FIELD_CREATED_AT, FIELD_DATA, FIELD_ID, FIELD_UPDATED_AT, FIELD_VERSION,
};
use isotope::common::{DocumentData, SortOrder, Value};
use isotope::document::Document;
use isotope::errors::{IsotopeError, IsotopeResult};
use isotope::filter::Filter;
use isotope::repository::FindOptions;
use mongodb::bson::{doc, Bson, DateTime as BsonDateTime};

pub(crate) const MONGO_ID: &str = "_id";

/// Maps a contract field name to its stored path.
pub(crate) fn field_path(field: &str) -> String {
    if field == FIELD_ID {
        MONGO_ID.to_string()
    } else {
        format!("{}.{}", FIELD_DATA, field)
    }
}

pub(crate) fn value_to_bson(value: &Value) -> Bson {
    match value {
        Value::Null => Bson::Null,
        Value::Bool(b) => Bson::Boolean(*b),
        Value::I64(i) => Bson::Int64(*i),
        Value::F64(f) => Bson::Double(*f),
        Value::String(s) => Bson::String(s.clone()),
        Value::Array(values) => Bson::Array(values.iter().map(value_to_bson).collect()),
        Value::Object(data) => Bson::Document(data_to_bson(data)),
    }
}

/// Decodes a BSON value back into the payload value set.
///
/// Payloads written through the contract only contain the closed variant
/// set; richer BSON types can still appear through the raw escape hatch and
/// decode to their closest payload representation.
pub(crate) fn bson_to_value(bson: &Bson) -> Value {
    match bson {
        Bson::Null | Bson::Undefined => Value::Null,
        Bson::Boolean(b) => Value::Bool(*b),
        Bson::Int32(i) => Value::I64(*i as i64),
        Bson::Int64(i) => Value::I64(*i),
        Bson::Double(f) => Value::F64(*f),
        Bson::String(s) => Value::String(s.clone()),
        Bson::Array(values) => Value::Array(values.iter().map(bson_to_value).collect()),
        Bson::Document(document) => Value::Object(bson_to_data(document)),
        Bson::ObjectId(oid) => Value::String(oid.to_hex()),
        Bson::DateTime(dt) => Value::I64(dt.timestamp_millis()),
        other => Value::String(other.to_string()),
    }
}

pub(crate) fn data_to_bson(data: &DocumentData) -> mongodb::bson::Document {
    let mut document = mongodb::bson::Document::new();
    for (field, value) in data {
        document.insert(field.clone(), value_to_bson(value));
    }
    document
}

pub(crate) fn bson_to_data(document: &mongodb::bson::Document) -> DocumentData {
    document
        .iter()
        .map(|(field, value)| (field.clone(), bson_to_value(value)))
        .collect()
}

/// Encodes a stored document into its BSON shape.
pub(crate) fn encode_document(document: &Document) -> mongodb::bson::Document {
    doc! {
        MONGO_ID: document.id(),
        FIELD_DATA: data_to_bson(document.data()),
        FIELD_VERSION: document.version(),
        FIELD_CREATED_AT: BsonDateTime::from_chrono(document.created_at()),
        FIELD_UPDATED_AT: BsonDateTime::from_chrono(document.updated_at()),
    }
}

/// Decodes a stored BSON document back into the contract shape.
pub(crate) fn decode_document(
    collection: &str,
    stored: mongodb::bson::Document,
) -> IsotopeResult<Document> {
    let id = stored
        .get_str(MONGO_ID)
        .map_err(|_| stored_shape_error(collection, MONGO_ID))?
        .to_string();
    let version = read_i64(&stored, FIELD_VERSION)
        .ok_or_else(|| stored_shape_error(collection, FIELD_VERSION))?;
    // projections may strip the payload entirely
    let data = match stored.get_document(FIELD_DATA) {
        Ok(payload) => bson_to_data(payload),
        Err(_) => DocumentData::new(),
    };
    let created_at = read_timestamp(&stored, FIELD_CREATED_AT)
        .ok_or_else(|| stored_shape_error(collection, FIELD_CREATED_AT))?;
    let updated_at = read_timestamp(&stored, FIELD_UPDATED_AT)
        .ok_or_else(|| stored_shape_error(collection, FIELD_UPDATED_AT))?;
    Ok(Document::from_stored(
        id,
        collection.to_string(),
        data,
        version,
        created_at,
        updated_at,
    ))
}

fn stored_shape_error(collection: &str, field: &str) -> IsotopeError {
    IsotopeError::validation_failed(&format!(
        "Stored document in '{}' is missing or mistypes '{}'",
        collection, field
    ))
}

fn read_i64(document: &mongodb::bson::Document, field: &str) -> Option<i64> {
    match document.get(field) {
        Some(Bson::Int64(i)) => Some(*i),
        Some(Bson::Int32(i)) => Some(*i as i64),
        _ => None,
    }
}

fn read_timestamp(document: &mongodb::bson::Document, field: &str) -> Option<DateTime<Utc>> {
    match document.get(field) {
        Some(Bson::DateTime(dt)) => Some(dt.to_chrono()),
        _ => None,
    }
}

/// Renders a filter as a query over the stored shape.
pub(crate) fn filter_to_query(filter: &Filter) -> mongodb::bson::Document {
    let mut query = mongodb::bson::Document::new();
    for (field, value) in filter.conditions() {
        query.insert(field_path(field), value_to_bson(value));
    }
    query
}

/// Renders a filter as a match over pipeline rows, where `id` is a plain
/// field.
pub(crate) fn filter_to_row_match(filter: &Filter) -> mongodb::bson::Document {
    let mut query = mongodb::bson::Document::new();
    for (field, value) in filter.conditions() {
        query.insert(field.clone(), value_to_bson(value));
    }
    query
}

pub(crate) fn sort_to_bson(sort_by: &[(String, SortOrder)]) -> mongodb::bson::Document {
    let mut sort = mongodb::bson::Document::new();
    for (field, order) in sort_by {
        let direction = match order {
            SortOrder::Ascending => 1,
            SortOrder::Descending => -1,
        };
        sort.insert(field_path(field), direction);
    }
    sort
}

/// Renders an inclusion projection; document metadata always survives.
pub(crate) fn projection_to_bson(fields: &[String]) -> mongodb::bson::Document {
    let mut projection = doc! {
        FIELD_VERSION: 1,
        FIELD_CREATED_AT: 1,
        FIELD_UPDATED_AT: 1,
    };
    for field in fields {
        projection.insert(field_path(field), 1);
    }
    projection
}

/// Renders a field-set update: `$set` on the payload paths and the update
/// timestamp, `$inc` on the version.
pub(crate) fn update_modifications(
    update: &DocumentData,
    now: DateTime<Utc>,
) -> mongodb::bson::Document {
    let mut set = mongodb::bson::Document::new();
    for (field, value) in update {
        set.insert(field_path(field), value_to_bson(value));
    }
    set.insert(FIELD_UPDATED_AT, BsonDateTime::from_chrono(now));
    doc! {
        "$set": set,
        "$inc": { FIELD_VERSION: 1_i64 },
    }
}

/// Renders a payload replacement as an update: the whole `data` subdocument
/// is swapped so the version can still be `$inc`-ed in the same command.
pub(crate) fn replace_modifications(
    data: &DocumentData,
    now: DateTime<Utc>,
) -> mongodb::bson::Document {
    doc! {
        "$set": {
            FIELD_DATA: data_to_bson(data),
            FIELD_UPDATED_AT: BsonDateTime::from_chrono(now),
        },
        "$inc": { FIELD_VERSION: 1_i64 },
    }
}

/// Renders the modifications for an upsert.
///
/// On a match this behaves like [update_modifications]. On insert the server
/// copies the filter's equality conditions into the new document, `$inc`
/// starts the version at 1, and `$setOnInsert` supplies `created_at` plus a
/// generated `_id` when the filter does not pin one.
pub(crate) fn upsert_modifications(
    filter: &Filter,
    update: &DocumentData,
    generated_id: &str,
    now: DateTime<Utc>,
) -> mongodb::bson::Document {
    let mut modifications = update_modifications(update, now);
    let mut on_insert = doc! { FIELD_CREATED_AT: BsonDateTime::from_chrono(now) };
    if filter.id_condition().is_none() {
        on_insert.insert(MONGO_ID, generated_id);
    }
    modifications.insert("$setOnInsert", on_insert);
    modifications
}

fn accumulator_to_bson(accumulator: &Accumulator) -> Bson {
    // non-numeric values must not participate, so field-bound accumulators
    // convert through $convert with non-numerics mapped to their identity
    let convert = |field: &str, on_miss: Bson| -> Bson {
        Bson::Document(doc! {
            "$convert": {
                "input": format!("${}", field),
                "to": "double",
                "onError": on_miss.clone(),
                "onNull": on_miss,
            }
        })
    };
    match accumulator {
        Accumulator::Count => Bson::Document(doc! { "$sum": 1_i64 }),
        Accumulator::Sum(field) => {
            Bson::Document(doc! { "$sum": convert(field, Bson::Double(0.0)) })
        }
        Accumulator::Avg(field) => Bson::Document(doc! { "$avg": convert(field, Bson::Null) }),
        Accumulator::Min(field) => Bson::Document(doc! { "$min": convert(field, Bson::Null) }),
        Accumulator::Max(field) => Bson::Document(doc! { "$max": convert(field, Bson::Null) }),
    }
}

fn group_stages(spec: &GroupSpec) -> IsotopeResult<Vec<mongodb::bson::Document>> {
    if spec.accumulators().is_empty() && spec.by().is_none() {
        return Err(IsotopeError::invalid_argument(
            "Group stage needs a group field or at least one accumulator",
        ));
    }
    let key = match spec.by() {
        Some(field) => Bson::String(format!("${}", field)),
        None => Bson::Null,
    };
    let mut group = doc! { MONGO_ID: key };
    for (name, accumulator) in spec.accumulators() {
        group.insert(name.clone(), accumulator_to_bson(accumulator));
    }

    // rename _id back to the grouping field and drop it for a whole
    // collection group, matching the contract row shape
    let mut reshape = doc! { MONGO_ID: 0 };
    if let Some(field) = spec.by() {
        reshape.insert(field, format!("${}", MONGO_ID));
    }
    for name in spec.accumulators().keys() {
        reshape.insert(name.clone(), 1);
    }
    Ok(vec![doc! { "$group": group }, doc! { "$project": reshape }])
}

/// Translates the portable pipeline onto the native one.
///
/// The first stage reshapes stored documents into contract rows (payload
/// with the id injected under `id`); every later stage then translates
/// one-to-one.
pub(crate) fn pipeline_to_bson(
    stages: &[PipelineStage],
) -> IsotopeResult<Vec<mongodb::bson::Document>> {
    let mut pipeline = vec![doc! {
        "$replaceRoot": {
            "newRoot": {
                "$mergeObjects": [
                    { FIELD_ID: format!("${}", MONGO_ID) },
                    format!("${}", FIELD_DATA),
                ]
            }
        }
    }];
    for stage in stages {
        match stage {
            PipelineStage::Match(filter) => {
                pipeline.push(doc! { "$match": filter_to_row_match(filter) });
            }
            PipelineStage::Sort(sort_by) => {
                let mut sort = mongodb::bson::Document::new();
                for (field, order) in sort_by {
                    let direction = match order {
                        SortOrder::Ascending => 1,
                        SortOrder::Descending => -1,
                    };
                    sort.insert(field.clone(), direction);
                }
                pipeline.push(doc! { "$sort": sort });
            }
            PipelineStage::Skip(n) => pipeline.push(doc! { "$skip": *n as i64 }),
            PipelineStage::Limit(n) => pipeline.push(doc! { "$limit": *n as i64 }),
            PipelineStage::Group(spec) => pipeline.extend(group_stages(spec)?),
            PipelineStage::Project(fields) => {
                let mut projection = doc! { MONGO_ID: 0 };
                for field in fields {
                    projection.insert(field.clone(), 1);
                }
                pipeline.push(doc! { "$project": projection });
            }
        }
    }
    Ok(pipeline)
}

/// Applies find options to a `find` action query.
pub(crate) fn find_action_parts(
    options: &FindOptions,
) -> (
    Option<mongodb::bson::Document>,
    Option<u64>,
    Option<i64>,
    Option<mongodb::bson::Document>,
) {
    let sort = if options.sort_by.is_empty() {
        None
    } else {
        Some(sort_to_bson(&options.sort_by))
    };
    let projection = options
        .projection
        .as_ref()
        .map(|fields| projection_to_bson(fields));
    (sort, options.skip, options.limit.map(|l| l as i64), projection)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use isotope::data;
    use isotope::filter::field;

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_document_encode_decode_round_trip() {
        let now = fixed_now();
        let document = Document::with_id(
            "users",
            "u1",
            data! { name: "Alice", age: 30, score: 99.5, tags: ["a", "b"], address: { city: "NY" } },
        )
        .into_first_version(now);

        let encoded = encode_document(&document);
        assert_eq!(encoded.get_str(MONGO_ID).unwrap(), "u1");
        assert_eq!(encoded.get_i64(FIELD_VERSION).unwrap(), 1);

        let decoded = decode_document("users", encoded).unwrap();
        assert_eq!(decoded.id(), "u1");
        assert_eq!(decoded.version(), 1);
        assert_eq!(decoded.data(), document.data());
        assert_eq!(
            decoded.created_at().timestamp_millis(),
            now.timestamp_millis()
        );
    }

    #[test]
    fn test_decode_tolerates_projected_payload() {
        let now = fixed_now();
        let stored = doc! {
            MONGO_ID: "u1",
            FIELD_VERSION: 3_i64,
            FIELD_CREATED_AT: BsonDateTime::from_chrono(now),
            FIELD_UPDATED_AT: BsonDateTime::from_chrono(now),
        };
        let decoded = decode_document("users", stored).unwrap();
        assert!(decoded.data().is_empty());
        assert_eq!(decoded.version(), 3);
    }

    #[test]
    fn test_decode_rejects_missing_version() {
        let now = fixed_now();
        let stored = doc! {
            MONGO_ID: "u1",
            FIELD_DATA: {},
            FIELD_CREATED_AT: BsonDateTime::from_chrono(now),
            FIELD_UPDATED_AT: BsonDateTime::from_chrono(now),
        };
        assert!(decode_document("users", stored).is_err());
    }

    #[test]
    fn test_filter_to_query_maps_paths() {
        let filter = isotope::filter::Filter::by_id("u1").and(field("age").eq(30));
        let query = filter_to_query(&filter);
        assert_eq!(query.get_str(MONGO_ID).unwrap(), "u1");
        assert_eq!(query.get_i64("data.age").unwrap(), 30);
    }

    #[test]
    fn test_update_modifications_shape() {
        let mods = update_modifications(&data! { age: 31 }, fixed_now());
        let set = mods.get_document("$set").unwrap();
        assert_eq!(set.get_i64("data.age").unwrap(), 31);
        assert!(set.contains_key(FIELD_UPDATED_AT));
        let inc = mods.get_document("$inc").unwrap();
        assert_eq!(inc.get_i64(FIELD_VERSION).unwrap(), 1);
    }

    #[test]
    fn test_upsert_modifications_only_sets_id_without_pin() {
        let pinned = upsert_modifications(
            &isotope::filter::Filter::by_id("u1"),
            &data! { a: 1 },
            "generated",
            fixed_now(),
        );
        assert!(!pinned
            .get_document("$setOnInsert")
            .unwrap()
            .contains_key(MONGO_ID));

        let unpinned =
            upsert_modifications(&field("a").eq(1), &data! { a: 1 }, "generated", fixed_now());
        assert_eq!(
            unpinned
                .get_document("$setOnInsert")
                .unwrap()
                .get_str(MONGO_ID)
                .unwrap(),
            "generated"
        );
    }

    #[test]
    fn test_pipeline_translates_stage_for_stage() {
        use isotope::aggregate::{Accumulator, GroupSpec};
        use isotope::common::SortOrder;

        let stages = vec![
            PipelineStage::Match(field("status").eq("done")),
            PipelineStage::Sort(vec![("amount".to_string(), SortOrder::Descending)]),
            PipelineStage::Skip(1),
            PipelineStage::Limit(2),
            PipelineStage::Group(
                GroupSpec::by_field("customer").accumulate("n", Accumulator::Count),
            ),
            PipelineStage::Project(vec!["n".to_string()]),
        ];
        let pipeline = pipeline_to_bson(&stages).unwrap();

        // reshape + match + sort + skip + limit + (group, project) + project
        assert_eq!(pipeline.len(), 8);
        assert!(pipeline[0].contains_key("$replaceRoot"));
        assert_eq!(
            pipeline[1].get_document("$match").unwrap().get_str("status").unwrap(),
            "done"
        );
        assert_eq!(pipeline[3].get_i64("$skip").unwrap(), 1);
        assert_eq!(pipeline[4].get_i64("$limit").unwrap(), 2);
        let group = pipeline[5].get_document("$group").unwrap();
        assert_eq!(group.get_str(MONGO_ID).unwrap(), "$customer");
    }

    #[test]
    fn test_pipeline_rejects_empty_group() {
        let stages = vec![PipelineStage::Group(
            isotope::aggregate::GroupSpec::whole_collection(),
        )];
        assert!(pipeline_to_bson(&stages).is_err());
    }

    #[test]
    fn test_bson_value_round_trip() {
        let value = Value::Object(data! { a: [1, 2.5, true, "x"], b: (Value::Null) });
        assert_eq!(bson_to_value(&value_to_bson(&value)), value);
    }
}
