//! Every SQL string the adapter runs, rendered in one place.
//!
//! Statements bind through positional parameters collected alongside the
//! text; identifiers (collection, field, and index names) are validated
//! upstream to ASCII alphanumerics and underscores, so interpolating them
//! is safe.

use isotope::aggregate::{Accumulator, GroupSpec};
use isotope::common::constants::FIELD_ID;
use isotope::common::Value;
use isotope::errors::{IsotopeError, IsotopeResult};
use isotope::filter::Filter;
use isotope::repository::{FindOptions, IndexModel};

use crate::dialect::Dialect;

pub(crate) const DOCUMENTS_TABLE: &str = "isotope_documents";
pub(crate) const CATALOG_TABLE: &str = "isotope_collections";
pub(crate) const INDEX_TABLE: &str = "isotope_indexes";

const DOCUMENT_COLUMNS: &str = "id, data, version, created_at, updated_at";

/// A bound statement parameter. The Any driver narrows the portable bind
/// types to these three.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum SqlParam {
    Str(String),
    I64(i64),
    F64(f64),
}

/// Renders statements for one dialect.
pub(crate) struct Sql {
    dialect: Dialect,
}

impl Sql {
    pub(crate) fn new(dialect: Dialect) -> Sql {
        Sql { dialect }
    }

    fn ph(&self, position: &mut usize) -> String {
        *position += 1;
        self.dialect.placeholder(*position)
    }

    pub(crate) fn documents_ddl(&self) -> String {
        let key = self.dialect.key_type();
        format!(
            "CREATE TABLE IF NOT EXISTS {DOCUMENTS_TABLE} (\
             collection {key} NOT NULL, \
             id {key} NOT NULL, \
             data TEXT NOT NULL, \
             version BIGINT NOT NULL, \
             created_at BIGINT NOT NULL, \
             updated_at BIGINT NOT NULL, \
             PRIMARY KEY (collection, id))"
        )
    }

    pub(crate) fn catalog_ddl(&self) -> String {
        let key = self.dialect.key_type();
        format!("CREATE TABLE IF NOT EXISTS {CATALOG_TABLE} (name {key} NOT NULL, PRIMARY KEY (name))")
    }

    pub(crate) fn index_registry_ddl(&self) -> String {
        let key = self.dialect.key_type();
        format!(
            "CREATE TABLE IF NOT EXISTS {INDEX_TABLE} (\
             collection {key} NOT NULL, \
             name {key} NOT NULL, \
             definition TEXT NOT NULL, \
             PRIMARY KEY (collection, name))"
        )
    }

    /// Binds: collection, id, data, version, created_at, updated_at.
    pub(crate) fn insert_document(&self) -> String {
        let mut p = 0;
        format!(
            "INSERT INTO {DOCUMENTS_TABLE} \
             (collection, id, data, version, created_at, updated_at) \
             VALUES ({}, {}, {}, {}, {}, {})",
            self.ph(&mut p),
            self.ph(&mut p),
            self.ph(&mut p),
            self.ph(&mut p),
            self.ph(&mut p),
            self.ph(&mut p),
        )
    }

    /// Binds: collection, id.
    pub(crate) fn select_by_id(&self, for_update: bool) -> String {
        let mut p = 0;
        format!(
            "SELECT {DOCUMENT_COLUMNS} FROM {DOCUMENTS_TABLE} \
             WHERE collection = {} AND id = {}{}",
            self.ph(&mut p),
            self.ph(&mut p),
            if for_update { self.dialect.for_update() } else { "" },
        )
    }

    /// Binds: data, updated_at, collection, id, version.
    pub(crate) fn cas_update(&self) -> String {
        let mut p = 0;
        format!(
            "UPDATE {DOCUMENTS_TABLE} \
             SET data = {}, version = version + 1, updated_at = {} \
             WHERE collection = {} AND id = {} AND version = {}",
            self.ph(&mut p),
            self.ph(&mut p),
            self.ph(&mut p),
            self.ph(&mut p),
            self.ph(&mut p),
        )
    }

    /// Binds: collection, id, version.
    pub(crate) fn cas_delete(&self) -> String {
        let mut p = 0;
        format!(
            "DELETE FROM {DOCUMENTS_TABLE} WHERE collection = {} AND id = {} AND version = {}",
            self.ph(&mut p),
            self.ph(&mut p),
            self.ph(&mut p),
        )
    }

    fn filter_conditions(
        &self,
        filter: &Filter,
        position: &mut usize,
        params: &mut Vec<SqlParam>,
    ) -> IsotopeResult<Vec<String>> {
        let mut conditions = Vec::new();
        for (field, value) in filter.conditions() {
            if field == FIELD_ID {
                match value {
                    Value::String(id) => {
                        conditions.push(format!("id = {}", self.ph(position)));
                        params.push(SqlParam::Str(id.clone()));
                    }
                    _ => {
                        return Err(IsotopeError::invalid_argument(
                            "an id condition must be a string",
                        ))
                    }
                }
                continue;
            }
            match value {
                Value::String(s) => {
                    conditions.push(format!(
                        "{} = {}",
                        self.dialect.text_value(field),
                        self.ph(position)
                    ));
                    params.push(SqlParam::Str(s.clone()));
                }
                Value::I64(i) => {
                    conditions.push(format!(
                        "{} = {}",
                        self.dialect.numeric_value(field),
                        self.ph(position)
                    ));
                    params.push(SqlParam::F64(*i as f64));
                }
                Value::F64(f) => {
                    conditions.push(format!(
                        "{} = {}",
                        self.dialect.numeric_value(field),
                        self.ph(position)
                    ));
                    params.push(SqlParam::F64(*f));
                }
                Value::Bool(b) => {
                    conditions.push(self.dialect.bool_condition(field, *b));
                }
                Value::Null => {
                    conditions.push(self.dialect.null_condition(field));
                }
                Value::Array(_) | Value::Object(_) => {
                    return Err(IsotopeError::unsupported(&format!(
                        "the relational adapter cannot compare the composite value \
                         filtered on field '{}'",
                        field
                    )))
                }
            }
        }
        Ok(conditions)
    }

    fn where_clause(
        &self,
        collection: &str,
        filter: &Filter,
        position: &mut usize,
        params: &mut Vec<SqlParam>,
    ) -> IsotopeResult<String> {
        let mut clause = format!("WHERE collection = {}", self.ph(position));
        params.push(SqlParam::Str(collection.to_string()));
        for condition in self.filter_conditions(filter, position, params)? {
            clause.push_str(" AND ");
            clause.push_str(&condition);
        }
        Ok(clause)
    }

    /// One SELECT covering filter, sort, and paging. Projection is applied
    /// client-side after decoding.
    pub(crate) fn select_filtered(
        &self,
        collection: &str,
        filter: &Filter,
        options: &FindOptions,
    ) -> IsotopeResult<(String, Vec<SqlParam>)> {
        let mut position = 0;
        let mut params = Vec::new();
        let where_clause = self.where_clause(collection, filter, &mut position, &mut params)?;

        let mut sql = format!("SELECT {DOCUMENT_COLUMNS} FROM {DOCUMENTS_TABLE} {where_clause}");
        if !options.sort_by.is_empty() {
            let terms: Vec<String> = options
                .sort_by
                .iter()
                .map(|(field, order)| self.dialect.order_term(field, *order))
                .collect();
            sql.push_str(" ORDER BY ");
            sql.push_str(&terms.join(", "));
        }
        sql.push_str(&self.dialect.paging(options.limit, options.skip));
        Ok((sql, params))
    }

    /// The locked read opening a find-and-mutate transaction.
    pub(crate) fn select_one_locked(
        &self,
        collection: &str,
        filter: &Filter,
    ) -> IsotopeResult<(String, Vec<SqlParam>)> {
        let mut position = 0;
        let mut params = Vec::new();
        let where_clause = self.where_clause(collection, filter, &mut position, &mut params)?;
        let sql = format!(
            "SELECT {DOCUMENT_COLUMNS} FROM {DOCUMENTS_TABLE} {where_clause} LIMIT 1{}",
            self.dialect.for_update()
        );
        Ok((sql, params))
    }

    /// The locked read opening a multi-row mutation transaction.
    pub(crate) fn select_many_locked(
        &self,
        collection: &str,
        filter: &Filter,
    ) -> IsotopeResult<(String, Vec<SqlParam>)> {
        let mut position = 0;
        let mut params = Vec::new();
        let where_clause = self.where_clause(collection, filter, &mut position, &mut params)?;
        let sql = format!(
            "SELECT {DOCUMENT_COLUMNS} FROM {DOCUMENTS_TABLE} {where_clause}{}",
            self.dialect.for_update()
        );
        Ok((sql, params))
    }

    pub(crate) fn count_filtered(
        &self,
        collection: &str,
        filter: &Filter,
    ) -> IsotopeResult<(String, Vec<SqlParam>)> {
        let mut position = 0;
        let mut params = Vec::new();
        let where_clause = self.where_clause(collection, filter, &mut position, &mut params)?;
        let sql = format!("SELECT COUNT(*) FROM {DOCUMENTS_TABLE} {where_clause}");
        Ok((sql, params))
    }

    /// Distinct JSON renderings of a payload field. Rows missing the field
    /// extract to SQL NULL and are excluded; stored JSON nulls survive as
    /// the text `null`.
    pub(crate) fn distinct_field(
        &self,
        collection: &str,
        field: &str,
        filter: &Filter,
    ) -> IsotopeResult<(String, Vec<SqlParam>)> {
        let mut position = 0;
        let mut params = Vec::new();
        let where_clause = self.where_clause(collection, filter, &mut position, &mut params)?;
        let expression = if field == FIELD_ID {
            "id".to_string()
        } else {
            self.dialect.json_value(field)
        };
        let sql = format!(
            "SELECT DISTINCT {expression} FROM {DOCUMENTS_TABLE} {where_clause} \
             AND {expression} IS NOT NULL"
        );
        Ok((sql, params))
    }

    /// One grouped SELECT for a `Match? -> Group` pipeline. The key column
    /// comes first when the spec groups by a field; accumulator columns
    /// follow in spec order. `HAVING COUNT(*) > 0` keeps a whole-collection
    /// fold over zero rows from fabricating a row of zeros.
    pub(crate) fn group_select(
        &self,
        collection: &str,
        filter: &Filter,
        spec: &GroupSpec,
    ) -> IsotopeResult<(String, Vec<SqlParam>)> {
        if spec.by().is_none() && spec.accumulators().is_empty() {
            return Err(IsotopeError::invalid_argument(
                "Group stage needs a group field or at least one accumulator",
            ));
        }

        let mut columns = Vec::new();
        let key_expression = spec.by().map(|field| {
            if field == FIELD_ID {
                "id".to_string()
            } else {
                self.dialect.json_value(field)
            }
        });
        if let Some(expression) = &key_expression {
            columns.push(expression.clone());
        }
        for accumulator in spec.accumulators().values() {
            columns.push(match accumulator {
                Accumulator::Count => "COUNT(*)".to_string(),
                Accumulator::Sum(field) => {
                    format!("COALESCE(SUM({}), 0.0)", self.dialect.numeric_value(field))
                }
                Accumulator::Avg(field) => format!("AVG({})", self.dialect.numeric_value(field)),
                Accumulator::Min(field) => format!("MIN({})", self.dialect.numeric_value(field)),
                Accumulator::Max(field) => format!("MAX({})", self.dialect.numeric_value(field)),
            });
        }

        let mut position = 0;
        let mut params = Vec::new();
        let where_clause = self.where_clause(collection, filter, &mut position, &mut params)?;

        let mut sql = format!(
            "SELECT {} FROM {DOCUMENTS_TABLE} {where_clause}",
            columns.join(", ")
        );
        match key_expression {
            Some(expression) => {
                sql.push_str(&format!(" GROUP BY {}", expression));
            }
            None => {
                sql.push_str(" HAVING COUNT(*) > 0");
            }
        }
        Ok((sql, params))
    }

    /// Binds: name.
    pub(crate) fn insert_collection(&self) -> String {
        let mut p = 0;
        format!(
            "INSERT INTO {CATALOG_TABLE} (name) VALUES ({})",
            self.ph(&mut p)
        )
    }

    /// Binds: name.
    pub(crate) fn delete_collection(&self) -> String {
        let mut p = 0;
        format!("DELETE FROM {CATALOG_TABLE} WHERE name = {}", self.ph(&mut p))
    }

    /// Collections are the catalog union the names documents actually live
    /// under, so implicitly created collections are listed too.
    pub(crate) fn list_collections(&self) -> String {
        format!(
            "SELECT name FROM {CATALOG_TABLE} \
             UNION SELECT DISTINCT collection FROM {DOCUMENTS_TABLE} ORDER BY 1"
        )
    }

    /// Binds: name, name.
    pub(crate) fn collection_exists(&self) -> String {
        let mut p = 0;
        format!(
            "SELECT COUNT(*) FROM (\
             SELECT name FROM {CATALOG_TABLE} WHERE name = {} \
             UNION SELECT collection FROM {DOCUMENTS_TABLE} WHERE collection = {}) AS hits",
            self.ph(&mut p),
            self.ph(&mut p),
        )
    }

    /// Binds: collection.
    pub(crate) fn delete_collection_documents(&self) -> String {
        let mut p = 0;
        format!(
            "DELETE FROM {DOCUMENTS_TABLE} WHERE collection = {}",
            self.ph(&mut p)
        )
    }

    /// Binds: new name, old name.
    pub(crate) fn rename_in(&self, table: &str, column: &str) -> String {
        let mut p = 0;
        format!(
            "UPDATE {table} SET {column} = {} WHERE {column} = {}",
            self.ph(&mut p),
            self.ph(&mut p),
        )
    }

    /// Binds: collection, name, definition.
    pub(crate) fn insert_index(&self) -> String {
        let mut p = 0;
        format!(
            "INSERT INTO {INDEX_TABLE} (collection, name, definition) VALUES ({}, {}, {})",
            self.ph(&mut p),
            self.ph(&mut p),
            self.ph(&mut p),
        )
    }

    /// Binds: collection, name.
    pub(crate) fn delete_index(&self) -> String {
        let mut p = 0;
        format!(
            "DELETE FROM {INDEX_TABLE} WHERE collection = {} AND name = {}",
            self.ph(&mut p),
            self.ph(&mut p),
        )
    }

    /// Binds: collection.
    pub(crate) fn list_indexes(&self) -> String {
        let mut p = 0;
        format!(
            "SELECT definition FROM {INDEX_TABLE} WHERE collection = {} ORDER BY name",
            self.ph(&mut p)
        )
    }

    /// Binds: collection.
    pub(crate) fn delete_collection_indexes(&self) -> String {
        let mut p = 0;
        format!(
            "DELETE FROM {INDEX_TABLE} WHERE collection = {}",
            self.ph(&mut p)
        )
    }

    /// A real partial expression index over the JSON column, restricted to
    /// one collection's rows. `None` when the dialect cannot render one.
    pub(crate) fn native_index_ddl(
        &self,
        collection: &str,
        name: &str,
        model: &IndexModel,
    ) -> Option<String> {
        if !self.dialect.supports_expression_indexes() {
            return None;
        }
        let terms: Vec<String> = model
            .keys()
            .iter()
            .map(|key| {
                format!(
                    "({}) {}",
                    self.dialect.text_value(&key.field),
                    match key.order {
                        isotope::common::SortOrder::Ascending => "ASC",
                        isotope::common::SortOrder::Descending => "DESC",
                    }
                )
            })
            .collect();
        let unique = if model.options().unique { "UNIQUE " } else { "" };
        Some(format!(
            "CREATE {unique}INDEX IF NOT EXISTS \"{name}\" ON {DOCUMENTS_TABLE} ({}) \
             WHERE collection = '{collection}'",
            terms.join(", ")
        ))
    }

    pub(crate) fn drop_native_index(&self, name: &str) -> Option<String> {
        if !self.dialect.supports_expression_indexes() {
            return None;
        }
        Some(format!("DROP INDEX IF EXISTS \"{name}\""))
    }

    pub(crate) fn health_check(&self) -> &'static str {
        "SELECT 1"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use isotope::common::SortOrder;
    use isotope::filter::field;
    use isotope::repository::{IndexKey, IndexOptions};

    #[test]
    fn test_insert_document_placeholders() {
        assert_eq!(
            Sql::new(Dialect::Postgres).insert_document(),
            "INSERT INTO isotope_documents \
             (collection, id, data, version, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6)"
        );
        assert_eq!(
            Sql::new(Dialect::Sqlite).insert_document(),
            "INSERT INTO isotope_documents \
             (collection, id, data, version, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?)"
        );
    }

    #[test]
    fn test_cas_update_conditions_on_version() {
        assert_eq!(
            Sql::new(Dialect::Postgres).cas_update(),
            "UPDATE isotope_documents \
             SET data = $1, version = version + 1, updated_at = $2 \
             WHERE collection = $3 AND id = $4 AND version = $5"
        );
    }

    #[test]
    fn test_select_filtered_renders_filter_sort_and_paging() {
        let filter = field("name").eq("Alice").and(field("age").eq(30));
        let options = FindOptions::new()
            .sort_by("age", SortOrder::Descending)
            .skip(2)
            .limit(5);
        let (sql, params) = Sql::new(Dialect::Postgres)
            .select_filtered("users", &filter, &options)
            .unwrap();

        assert_eq!(
            sql,
            "SELECT id, data, version, created_at, updated_at FROM isotope_documents \
             WHERE collection = $1 AND data::jsonb->>'name' = $2 \
             AND CASE WHEN jsonb_typeof(data::jsonb->'age') = 'number' \
             THEN (data::jsonb->>'age')::double precision END = $3 \
             ORDER BY data::jsonb->'age' DESC NULLS LAST LIMIT 5 OFFSET 2"
        );
        assert_eq!(
            params,
            vec![
                SqlParam::Str("users".to_string()),
                SqlParam::Str("Alice".to_string()),
                SqlParam::F64(30.0),
            ]
        );
    }

    #[test]
    fn test_select_one_locked_suffix_per_dialect() {
        let filter = Filter::by_id("u1");
        let (sql, params) = Sql::new(Dialect::MySql)
            .select_one_locked("users", &filter)
            .unwrap();
        assert_eq!(
            sql,
            "SELECT id, data, version, created_at, updated_at FROM isotope_documents \
             WHERE collection = ? AND id = ? LIMIT 1 FOR UPDATE"
        );
        assert_eq!(params.len(), 2);

        let (sql, _) = Sql::new(Dialect::Sqlite)
            .select_one_locked("users", &filter)
            .unwrap();
        assert!(sql.ends_with("LIMIT 1"));
    }

    #[test]
    fn test_filter_rejects_composite_values() {
        let filter = field("tags").eq(vec![Value::from("a")]);
        let err = Sql::new(Dialect::Postgres)
            .select_filtered("users", &filter, &FindOptions::new())
            .unwrap_err();
        assert_eq!(err.kind(), &isotope::errors::ErrorKind::Unsupported);
    }

    #[test]
    fn test_null_and_bool_conditions_bind_nothing() {
        let filter = field("active").eq(true).and(field("nickname").eq(Value::Null));
        let (sql, params) = Sql::new(Dialect::Sqlite)
            .count_filtered("users", &filter)
            .unwrap();
        assert_eq!(
            sql,
            "SELECT COUNT(*) FROM isotope_documents WHERE collection = ? \
             AND json_extract(data, '$.active') = 1 \
             AND json_type(data, '$.nickname') = 'null'"
        );
        assert_eq!(params, vec![SqlParam::Str("users".to_string())]);
    }

    #[test]
    fn test_group_select_by_field() {
        let spec = GroupSpec::by_field("customer")
            .accumulate("orders", Accumulator::Count)
            .accumulate("total", Accumulator::Sum("amount".to_string()));
        let (sql, params) = Sql::new(Dialect::Sqlite)
            .group_select("orders", &Filter::empty(), &spec)
            .unwrap();

        let key = "CASE WHEN json_type(data, '$.customer') IS NULL THEN NULL \
                   ELSE json_quote(json_extract(data, '$.customer')) END";
        let sum = "COALESCE(SUM(CASE WHEN json_type(data, '$.amount') IN ('integer', 'real') \
                   THEN CAST(json_extract(data, '$.amount') AS REAL) END), 0.0)";
        assert_eq!(
            sql,
            format!(
                "SELECT {key}, COUNT(*), {sum} FROM isotope_documents \
                 WHERE collection = ? GROUP BY {key}"
            )
        );
        assert_eq!(params, vec![SqlParam::Str("orders".to_string())]);
    }

    #[test]
    fn test_group_select_whole_collection_guards_empty_input() {
        let spec = GroupSpec::whole_collection().accumulate("n", Accumulator::Count);
        let (sql, _) = Sql::new(Dialect::Postgres)
            .group_select("orders", &Filter::empty(), &spec)
            .unwrap();
        assert!(sql.ends_with("HAVING COUNT(*) > 0"));
    }

    #[test]
    fn test_group_select_rejects_empty_spec() {
        let err = Sql::new(Dialect::Postgres)
            .group_select("orders", &Filter::empty(), &GroupSpec::whole_collection())
            .unwrap_err();
        assert_eq!(err.kind(), &isotope::errors::ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_native_index_ddl_only_where_expressions_work() {
        let model = IndexModel::new(vec![IndexKey::asc("email")])
            .with_options(IndexOptions::new().unique());

        let ddl = Sql::new(Dialect::Postgres)
            .native_index_ddl("users", "users_email_idx", &model)
            .unwrap();
        assert_eq!(
            ddl,
            "CREATE UNIQUE INDEX IF NOT EXISTS \"users_email_idx\" ON isotope_documents \
             ((data::jsonb->>'email') ASC) WHERE collection = 'users'"
        );

        assert!(Sql::new(Dialect::MySql)
            .native_index_ddl("users", "users_email_idx", &model)
            .is_none());
    }

    #[test]
    fn test_distinct_field_excludes_missing() {
        let (sql, _) = Sql::new(Dialect::Postgres)
            .distinct_field("users", "city", &Filter::empty())
            .unwrap();
        assert_eq!(
            sql,
            "SELECT DISTINCT (data::jsonb->'city')::text FROM isotope_documents \
             WHERE collection = $1 AND (data::jsonb->'city')::text IS NOT NULL"
        );
    }
}
