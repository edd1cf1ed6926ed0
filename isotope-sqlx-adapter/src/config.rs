use isotope::errors::{IsotopeError, IsotopeResult};

/// Connection settings for the relational backends.
#[derive(Clone, Debug)]
pub struct SqlxConfig {
    url: String,
    max_connections: u32,
}

impl SqlxConfig {
    pub fn new(url: &str) -> SqlxConfig {
        SqlxConfig {
            url: url.to_string(),
            max_connections: 10,
        }
    }

    /// Caps the connection pool; defaults to 10.
    pub fn max_connections(mut self, max_connections: u32) -> SqlxConfig {
        self.max_connections = max_connections;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn max_connections_value(&self) -> u32 {
        self.max_connections
    }

    pub(crate) fn validate(&self) -> IsotopeResult<()> {
        if self.url.is_empty() {
            return Err(IsotopeError::invalid_argument(
                "database url must not be empty",
            ));
        }
        if self.max_connections == 0 {
            return Err(IsotopeError::invalid_argument(
                "max_connections must be at least 1",
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
    fn test_config_defaults_and_builders() {
        let config = SqlxConfig::new("sqlite::memory:");
        assert_eq!(config.url(), "sqlite::memory:");
        assert_eq!(config.max_connections_value(), 10);

        let config = config.max_connections(4);
        assert_eq!(config.max_connections_value(), 4);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_rejects_bad_values() {
        let err = SqlxConfig::new("").validate().unwrap_err();
        assert_eq!(err.kind(), &ErrorKind::InvalidArgument);

        let err = SqlxConfig::new("sqlite::memory:")
            .max_connections(0)
            .validate()
            .unwrap_err();
        assert_eq!(err.kind(), &ErrorKind::InvalidArgument);
    }
}
