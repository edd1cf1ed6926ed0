use isotope::errors::{IsotopeError, IsotopeResult};

/// Connection settings for the wide-column backend.
#[derive(Clone, Debug)]
pub struct ScyllaConfig {
    nodes: Vec<String>,
    keyspace: String,
    replication_factor: u32,
}

impl ScyllaConfig {
    pub fn new(nodes: Vec<String>, keyspace: &str) -> ScyllaConfig {
        ScyllaConfig {
            nodes,
            keyspace: keyspace.to_string(),
            replication_factor: 1,
        }
    }

    /// Replication factor used when the keyspace has to be created;
    /// defaults to 1.
    pub fn replication_factor(mut self, replication_factor: u32) -> ScyllaConfig {
        self.replication_factor = replication_factor;
        self
    }

    pub fn nodes(&self) -> &[String] {
        &self.nodes
    }

    pub fn keyspace(&self) -> &str {
        &self.keyspace
    }

    pub fn replication_factor_value(&self) -> u32 {
        self.replication_factor
    }

    pub(crate) fn validate(&self) -> IsotopeResult<()> {
        if self.nodes.is_empty() {
            return Err(IsotopeError::invalid_argument(
                "at least one contact node is required",
            ));
        }
        if self.keyspace.is_empty()
            || !self
                .keyspace
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(IsotopeError::invalid_argument(&format!(
                "keyspace name '{}' must be ASCII alphanumerics and underscores",
                self.keyspace
            )));
        }
        if self.replication_factor == 0 {
            return Err(IsotopeError::invalid_argument(
                "replication_factor must be at least 1",
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
        let config = ScyllaConfig::new(vec!["127.0.0.1:9042".to_string()], "app");
        assert_eq!(config.nodes(), ["127.0.0.1:9042".to_string()]);
        assert_eq!(config.keyspace(), "app");
        assert_eq!(config.replication_factor_value(), 1);

        let config = config.replication_factor(3);
        assert_eq!(config.replication_factor_value(), 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_rejects_bad_values() {
        let err = ScyllaConfig::new(vec![], "app").validate().unwrap_err();
        assert_eq!(err.kind(), &ErrorKind::InvalidArgument);

        let err = ScyllaConfig::new(vec!["n1".to_string()], "bad-name")
            .validate()
            .unwrap_err();
        assert_eq!(err.kind(), &ErrorKind::InvalidArgument);

        let err = ScyllaConfig::new(vec!["n1".to_string()], "app")
            .replication_factor(0)
            .validate()
            .unwrap_err();
        assert_eq!(err.kind(), &ErrorKind::InvalidArgument);
    }
}
