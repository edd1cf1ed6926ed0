//! Every CQL string in one place. The keyspace name is validated to ASCII
//! alphanumerics and underscores before it reaches these renderers, so
//! interpolating it is safe.

pub(crate) const DOCUMENTS_TABLE: &str = "isotope_documents";
pub(crate) const CATALOG_TABLE: &str = "isotope_collections";

pub(crate) const DOCUMENT_COLUMNS: &str = "id, data, version, created_at, updated_at";

pub(crate) struct Cql {
    keyspace: String,
}

impl Cql {
    pub(crate) fn new(keyspace: &str) -> Cql {
        Cql {
            keyspace: keyspace.to_string(),
        }
    }

    pub(crate) fn create_keyspace(&self, replication_factor: u32) -> String {
        format!(
            "CREATE KEYSPACE IF NOT EXISTS {} WITH replication = \
             {{'class': 'NetworkTopologyStrategy', 'replication_factor': {}}}",
            self.keyspace, replication_factor
        )
    }

    pub(crate) fn create_documents_table(&self) -> String {
        format!(
            "CREATE TABLE IF NOT EXISTS {}.{DOCUMENTS_TABLE} (\
             collection text, \
             id text, \
             data text, \
             version bigint, \
             created_at bigint, \
             updated_at bigint, \
             PRIMARY KEY (collection, id))",
            self.keyspace
        )
    }

    pub(crate) fn create_catalog_table(&self) -> String {
        format!(
            "CREATE TABLE IF NOT EXISTS {}.{CATALOG_TABLE} (name text PRIMARY KEY)",
            self.keyspace
        )
    }

    /// Binds: collection, id, data, version, created_at, updated_at.
    pub(crate) fn insert_if_absent(&self) -> String {
        format!(
            "INSERT INTO {}.{DOCUMENTS_TABLE} (collection, {DOCUMENT_COLUMNS}) \
             VALUES (?, ?, ?, ?, ?, ?) IF NOT EXISTS",
            self.keyspace
        )
    }

    /// Binds: collection, id.
    pub(crate) fn select_by_id(&self) -> String {
        format!(
            "SELECT {DOCUMENT_COLUMNS} FROM {}.{DOCUMENTS_TABLE} \
             WHERE collection = ? AND id = ?",
            self.keyspace
        )
    }

    /// Binds: collection. Scans the whole partition.
    pub(crate) fn scan_collection(&self) -> String {
        format!(
            "SELECT {DOCUMENT_COLUMNS} FROM {}.{DOCUMENTS_TABLE} WHERE collection = ?",
            self.keyspace
        )
    }

    /// Binds: data, version, updated_at, collection, id, expected version.
    /// A negative `[applied]` row carries the stored version, null when the
    /// row is gone.
    pub(crate) fn cas_update(&self) -> String {
        format!(
            "UPDATE {}.{DOCUMENTS_TABLE} \
             SET data = ?, version = ?, updated_at = ? \
             WHERE collection = ? AND id = ? IF version = ?",
            self.keyspace
        )
    }

    /// Binds: collection, id, expected version.
    pub(crate) fn cas_delete(&self) -> String {
        format!(
            "DELETE FROM {}.{DOCUMENTS_TABLE} \
             WHERE collection = ? AND id = ? IF version = ?",
            self.keyspace
        )
    }

    /// Binds: collection. Unconditional partition drop.
    pub(crate) fn delete_partition(&self) -> String {
        format!(
            "DELETE FROM {}.{DOCUMENTS_TABLE} WHERE collection = ?",
            self.keyspace
        )
    }

    /// Binds: collection.
    pub(crate) fn count_partition(&self) -> String {
        format!(
            "SELECT COUNT(*) FROM {}.{DOCUMENTS_TABLE} WHERE collection = ?",
            self.keyspace
        )
    }

    pub(crate) fn list_partitions(&self) -> String {
        format!(
            "SELECT DISTINCT collection FROM {}.{DOCUMENTS_TABLE}",
            self.keyspace
        )
    }

    /// Binds: name.
    pub(crate) fn insert_catalog_entry(&self) -> String {
        format!(
            "INSERT INTO {}.{CATALOG_TABLE} (name) VALUES (?)",
            self.keyspace
        )
    }

    /// Binds: name.
    pub(crate) fn delete_catalog_entry(&self) -> String {
        format!(
            "DELETE FROM {}.{CATALOG_TABLE} WHERE name = ?",
            self.keyspace
        )
    }

    /// Binds: name.
    pub(crate) fn select_catalog_entry(&self) -> String {
        format!(
            "SELECT name FROM {}.{CATALOG_TABLE} WHERE name = ?",
            self.keyspace
        )
    }

    pub(crate) fn list_catalog(&self) -> String {
        format!("SELECT name FROM {}.{CATALOG_TABLE}", self.keyspace)
    }

    pub(crate) fn health_check(&self) -> &'static str {
        "SELECT release_version FROM system.local WHERE key = 'local'"
    }
}
