use isotope::common::constants::FIELD_ID;
use isotope::common::SortOrder;
use isotope::errors::{IsotopeError, IsotopeResult};
use isotope::registry::BackendKind;

/// The relational dialects sharing the JSON-column strategy.
///
/// The three engines differ in placeholder style, JSON extraction syntax,
/// row locking, and paging syntax; everything else in the adapter is
/// dialect-blind. Field and collection names are validated to ASCII
/// alphanumerics and underscores before they reach any of these renderers,
/// so interpolating them into SQL text is safe.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Dialect {
    Postgres,
    MySql,
    Sqlite,
}

impl Dialect {
    /// Picks the dialect from a connection url scheme.
    pub fn from_url(url: &str) -> IsotopeResult<Dialect> {
        if url.starts_with("postgres://") || url.starts_with("postgresql://") {
            Ok(Dialect::Postgres)
        } else if url.starts_with("mysql://") || url.starts_with("mariadb://") {
            Ok(Dialect::MySql)
        } else if url.starts_with("sqlite:") {
            Ok(Dialect::Sqlite)
        } else {
            Err(IsotopeError::invalid_argument(&format!(
                "unrecognized database url scheme: '{}'",
                url
            )))
        }
    }

    pub fn backend_kind(&self) -> BackendKind {
        match self {
            Dialect::Postgres => BackendKind::Postgres,
            Dialect::MySql => BackendKind::MySql,
            Dialect::Sqlite => BackendKind::Sqlite,
        }
    }

    pub(crate) fn placeholder(&self, position: usize) -> String {
        match self {
            Dialect::Postgres => format!("${}", position),
            _ => "?".to_string(),
        }
    }

    /// Column type for collection and id keys. MySQL needs a bounded type
    /// to build a primary key.
    pub(crate) fn key_type(&self) -> &'static str {
        match self {
            Dialect::MySql => "VARCHAR(255)",
            _ => "TEXT",
        }
    }

    /// Expression yielding the unquoted text of a payload field.
    pub(crate) fn text_value(&self, field: &str) -> String {
        match self {
            Dialect::Postgres => format!("data::jsonb->>'{}'", field),
            Dialect::MySql => format!("JSON_UNQUOTE(JSON_EXTRACT(data, '$.{}'))", field),
            Dialect::Sqlite => format!("json_extract(data, '$.{}')", field),
        }
    }

    /// Expression yielding a payload field as JSON text, or SQL NULL when
    /// the field is absent. A stored JSON null comes back as the text
    /// `null`, so absence and null stay distinguishable.
    pub(crate) fn json_value(&self, field: &str) -> String {
        match self {
            Dialect::Postgres => format!("(data::jsonb->'{}')::text", field),
            Dialect::MySql => format!("CAST(JSON_EXTRACT(data, '$.{}') AS CHAR)", field),
            Dialect::Sqlite => format!(
                "CASE WHEN json_type(data, '$.{f}') IS NULL THEN NULL \
                 ELSE json_quote(json_extract(data, '$.{f}')) END",
                f = field
            ),
        }
    }

    /// Expression yielding a payload field as a double, or SQL NULL when the
    /// field is absent or non-numeric. Aggregate functions skip NULLs, which
    /// matches the contract's non-numeric-values-do-not-participate rule.
    pub(crate) fn numeric_value(&self, field: &str) -> String {
        match self {
            Dialect::Postgres => format!(
                "CASE WHEN jsonb_typeof(data::jsonb->'{f}') = 'number' \
                 THEN (data::jsonb->>'{f}')::double precision END",
                f = field
            ),
            Dialect::MySql => format!(
                "CASE WHEN JSON_TYPE(JSON_EXTRACT(data, '$.{f}')) IN \
                 ('INTEGER', 'UNSIGNED INTEGER', 'DOUBLE', 'DECIMAL') \
                 THEN CAST(JSON_EXTRACT(data, '$.{f}') AS DOUBLE) END",
                f = field
            ),
            Dialect::Sqlite => format!(
                "CASE WHEN json_type(data, '$.{f}') IN ('integer', 'real') \
                 THEN CAST(json_extract(data, '$.{f}') AS REAL) END",
                f = field
            ),
        }
    }

    /// Condition matching a payload field that holds an explicit JSON null.
    pub(crate) fn null_condition(&self, field: &str) -> String {
        match self {
            Dialect::Postgres => format!("jsonb_typeof(data::jsonb->'{}') = 'null'", field),
            Dialect::MySql => {
                format!("JSON_TYPE(JSON_EXTRACT(data, '$.{}')) = 'NULL'", field)
            }
            Dialect::Sqlite => format!("json_type(data, '$.{}') = 'null'", field),
        }
    }

    /// Condition matching a boolean payload field.
    pub(crate) fn bool_condition(&self, field: &str, value: bool) -> String {
        match self {
            Dialect::Sqlite => format!(
                "json_extract(data, '$.{}') = {}",
                field,
                if value { 1 } else { 0 }
            ),
            _ => format!("{} = '{}'", self.text_value(field), value),
        }
    }

    /// ORDER BY term for one sort key. Missing fields extract to SQL NULL
    /// and must sort first ascending, last descending, like the shared
    /// comparator; PostgreSQL needs that spelled out, the other two default
    /// to it.
    pub(crate) fn order_term(&self, field: &str, order: SortOrder) -> String {
        let expression = if field == FIELD_ID {
            "id".to_string()
        } else {
            match self {
                Dialect::Postgres => format!("data::jsonb->'{}'", field),
                Dialect::MySql => format!("JSON_EXTRACT(data, '$.{}')", field),
                Dialect::Sqlite => format!("json_extract(data, '$.{}')", field),
            }
        };
        match (self, order) {
            (Dialect::Postgres, SortOrder::Ascending) => {
                format!("{} ASC NULLS FIRST", expression)
            }
            (Dialect::Postgres, SortOrder::Descending) => {
                format!("{} DESC NULLS LAST", expression)
            }
            (_, SortOrder::Ascending) => format!("{} ASC", expression),
            (_, SortOrder::Descending) => format!("{} DESC", expression),
        }
    }

    /// Row-locking suffix for the find-and-mutate family. SQLite has no
    /// `FOR UPDATE`; its single-writer lock covers the transaction.
    pub(crate) fn for_update(&self) -> &'static str {
        match self {
            Dialect::Sqlite => "",
            _ => " FOR UPDATE",
        }
    }

    /// Paging clause. MySQL and SQLite cannot express OFFSET without LIMIT.
    pub(crate) fn paging(&self, limit: Option<u64>, skip: Option<u64>) -> String {
        match (limit, skip) {
            (None, None) => String::new(),
            (Some(limit), None) => format!(" LIMIT {}", limit),
            (Some(limit), Some(skip)) => format!(" LIMIT {} OFFSET {}", limit, skip),
            (None, Some(skip)) => match self {
                Dialect::Postgres => format!(" OFFSET {}", skip),
                Dialect::MySql => format!(" LIMIT 18446744073709551615 OFFSET {}", skip),
                Dialect::Sqlite => format!(" LIMIT -1 OFFSET {}", skip),
            },
        }
    }

    /// Whether the engine can render partial expression indexes over the
    /// JSON column. MySQL cannot; its indexes live only in the registry.
    pub(crate) fn supports_expression_indexes(&self) -> bool {
        !matches!(self, Dialect::MySql)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use isotope::errors::ErrorKind;

    #[test]
    fn test_dialect_from_url() {
        assert_eq!(
            Dialect::from_url("postgres://localhost/app").unwrap(),
            Dialect::Postgres
        );
        assert_eq!(
            Dialect::from_url("postgresql://localhost/app").unwrap(),
            Dialect::Postgres
        );
        assert_eq!(
            Dialect::from_url("mysql://localhost/app").unwrap(),
            Dialect::MySql
        );
        assert_eq!(Dialect::from_url("sqlite::memory:").unwrap(), Dialect::Sqlite);

        let err = Dialect::from_url("redis://localhost").unwrap_err();
        assert_eq!(err.kind(), &ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_placeholders() {
        assert_eq!(Dialect::Postgres.placeholder(3), "$3");
        assert_eq!(Dialect::MySql.placeholder(3), "?");
        assert_eq!(Dialect::Sqlite.placeholder(1), "?");
    }

    #[test]
    fn test_text_value_extraction() {
        assert_eq!(Dialect::Postgres.text_value("name"), "data::jsonb->>'name'");
        assert_eq!(
            Dialect::MySql.text_value("name"),
            "JSON_UNQUOTE(JSON_EXTRACT(data, '$.name'))"
        );
        assert_eq!(
            Dialect::Sqlite.text_value("name"),
            "json_extract(data, '$.name')"
        );
    }

    #[test]
    fn test_order_term_null_placement() {
        assert_eq!(
            Dialect::Postgres.order_term("age", SortOrder::Ascending),
            "data::jsonb->'age' ASC NULLS FIRST"
        );
        assert_eq!(
            Dialect::Sqlite.order_term("age", SortOrder::Descending),
            "json_extract(data, '$.age') DESC"
        );
        assert_eq!(
            Dialect::MySql.order_term("id", SortOrder::Ascending),
            "id ASC"
        );
    }

    #[test]
    fn test_paging_offset_without_limit() {
        assert_eq!(Dialect::Postgres.paging(None, Some(5)), " OFFSET 5");
        assert_eq!(
            Dialect::MySql.paging(None, Some(5)),
            " LIMIT 18446744073709551615 OFFSET 5"
        );
        assert_eq!(Dialect::Sqlite.paging(None, Some(5)), " LIMIT -1 OFFSET 5");
        assert_eq!(Dialect::Postgres.paging(Some(2), Some(5)), " LIMIT 2 OFFSET 5");
        assert_eq!(Dialect::Sqlite.paging(None, None), "");
    }

    #[test]
    fn test_for_update_suffix() {
        assert_eq!(Dialect::Postgres.for_update(), " FOR UPDATE");
        assert_eq!(Dialect::MySql.for_update(), " FOR UPDATE");
        assert_eq!(Dialect::Sqlite.for_update(), "");
    }
}
