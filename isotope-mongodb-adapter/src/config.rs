use isotope::errors::{IsotopeError, IsotopeResult};

/// Connection settings for the MongoDB backend.
///
/// The query-side flavour (`read_secondary`) routes reads to secondaries
/// with a `secondaryPreferred` read preference, which is how a CQRS query
/// repository is usually opened against a replica set. Writes always use a
/// majority write concern.
#[derive(Clone, Debug)]
pub struct MongoConfig {
    uri: String,
    database: String,
    app_name: Option<String>,
    max_pool_size: Option<u32>,
    read_secondary: bool,
}

impl MongoConfig {
    pub fn new(uri: &str, database: &str) -> MongoConfig {
        MongoConfig {
            uri: uri.to_string(),
            database: database.to_string(),
            app_name: None,
            max_pool_size: None,
            read_secondary: false,
        }
    }

    /// Sets the application name reported to the server.
    pub fn app_name(mut self, name: &str) -> MongoConfig {
        self.app_name = Some(name.to_string());
        self
    }

    /// Caps the driver connection pool.
    pub fn max_pool_size(mut self, size: u32) -> MongoConfig {
        self.max_pool_size = Some(size);
        self
    }

    /// Prefers secondary members for reads.
    pub fn read_secondary(mut self) -> MongoConfig {
        self.read_secondary = true;
        self
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn app_name_value(&self) -> Option<&str> {
        self.app_name.as_deref()
    }

    pub fn max_pool_size_value(&self) -> Option<u32> {
        self.max_pool_size
    }

    pub fn reads_secondary(&self) -> bool {
        self.read_secondary
    }

    pub(crate) fn validate(&self) -> IsotopeResult<()> {
        if self.uri.is_empty() {
            return Err(IsotopeError::invalid_argument(
                "MongoDB connection uri must not be empty",
            ));
        }
        if self.database.is_empty() {
            return Err(IsotopeError::invalid_argument(
                "MongoDB database name must not be empty",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use isotope::errors::ErrorKind;

    #[test]
    fn test_config_builders() {
        let config = MongoConfig::new("mongodb://localhost:27017", "isotope")
            .app_name("orders-svc")
            .max_pool_size(16)
            .read_secondary();

        assert_eq!(config.uri(), "mongodb://localhost:27017");
        assert_eq!(config.database(), "isotope");
        assert_eq!(config.app_name_value(), Some("orders-svc"));
        assert_eq!(config.max_pool_size_value(), Some(16));
        assert!(config.reads_secondary());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_rejects_empty_parts() {
        let err = MongoConfig::new("", "isotope").validate().unwrap_err();
        assert_eq!(err.kind(), &ErrorKind::InvalidArgument);

        let err = MongoConfig::new("mongodb://localhost", "")
            .validate()
            .unwrap_err();
        assert_eq!(err.kind(), &ErrorKind::InvalidArgument);
    }
}
