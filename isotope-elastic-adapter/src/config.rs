use isotope::errors::{IsotopeError, IsotopeResult};

/// Connection settings for the search-index backend.
#[derive(Clone, Debug)]
pub struct ElasticConfig {
    url: String,
    index_prefix: String,
}

impl ElasticConfig {
    pub fn new(url: &str) -> ElasticConfig {
        ElasticConfig {
            url: url.to_string(),
            index_prefix: "isotope-".to_string(),
        }
    }

    /// Prefix for the per-collection indices; defaults to `isotope-`.
    pub fn index_prefix(mut self, index_prefix: &str) -> ElasticConfig {
        self.index_prefix = index_prefix.to_string();
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn index_prefix_value(&self) -> &str {
        &self.index_prefix
    }

    pub(crate) fn validate(&self) -> IsotopeResult<()> {
        if self.url.is_empty() {
            return Err(IsotopeError::invalid_argument("node url must not be empty"));
        }
        if self.index_prefix.is_empty()
            || !self
                .index_prefix
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
        {
            return Err(IsotopeError::invalid_argument(&format!(
                "index prefix '{}' must be lowercase ASCII, digits, '-' or '_'",
                self.index_prefix
            )));
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
        let config = ElasticConfig::new("http://localhost:9200");
        assert_eq!(config.url(), "http://localhost:9200");
        assert_eq!(config.index_prefix_value(), "isotope-");

        let config = config.index_prefix("docs-");
        assert_eq!(config.index_prefix_value(), "docs-");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_rejects_bad_values() {
        let err = ElasticConfig::new("").validate().unwrap_err();
        assert_eq!(err.kind(), &ErrorKind::InvalidArgument);

        let err = ElasticConfig::new("http://localhost:9200")
            .index_prefix("Has Spaces")
            .validate()
            .unwrap_err();
        assert_eq!(err.kind(), &ErrorKind::InvalidArgument);
    }
}
