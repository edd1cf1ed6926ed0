use std::sync::Arc;

use async_trait::async_trait;

use isotope::common::constants::PARAM_URL;
use isotope::errors::{IsotopeError, IsotopeResult};
use isotope::event::ChangeEventPublisher;
use isotope::registry::{BackendKind, ConnectionParams, RepositoryModule};
use isotope::repository::Repository;

use crate::config::ElasticConfig;
use crate::repository::ElasticRepository;

/// Registry module for the search-index backend.
///
/// Recognized parameters: `url` (required), `index_prefix`.
pub struct ElasticModule {
    publisher: Option<Arc<ChangeEventPublisher>>,
}

impl ElasticModule {
    pub fn new() -> ElasticModule {
        ElasticModule { publisher: None }
    }

    pub fn with_publisher(publisher: Arc<ChangeEventPublisher>) -> ElasticModule {
        ElasticModule {
            publisher: Some(publisher),
        }
    }
}

impl Default for ElasticModule {
    fn default() -> Self {
        ElasticModule::new()
    }
}

#[async_trait]
impl RepositoryModule for ElasticModule {
    fn kinds(&self) -> Vec<BackendKind> {
        vec![BackendKind::Elasticsearch]
    }

    async fn open(&self, kind: BackendKind, params: &ConnectionParams) -> IsotopeResult<Repository> {
        if kind != BackendKind::Elasticsearch {
            return Err(IsotopeError::unsupported(&format!(
                "this module cannot open a '{}' backend",
                kind.as_str()
            )));
        }
        let url = params.require(PARAM_URL)?;

        let mut config = ElasticConfig::new(url);
        if let Some(prefix) = params.get("index_prefix") {
            config = config.index_prefix(prefix);
        }

        let repository = match &self.publisher {
            Some(publisher) => {
                ElasticRepository::connect_with_publisher(config, publisher.clone())?
            }
            None => ElasticRepository::connect(config)?,
        };
        Ok(Repository::new(repository))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use isotope::errors::ErrorKind;

    #[tokio::test]
    async fn test_module_announces_search_kind() {
        let module = ElasticModule::new();
        assert_eq!(module.kinds(), vec![BackendKind::Elasticsearch]);
    }

    #[tokio::test]
    async fn test_module_rejects_foreign_kind() {
        let module = ElasticModule::new();
        let params = ConnectionParams::new().set(PARAM_URL, "http://localhost:9200");
        let err = module.open(BackendKind::Scylla, &params).await.unwrap_err();
        assert_eq!(err.kind(), &ErrorKind::Unsupported);
    }

    #[tokio::test]
    async fn test_module_requires_url() {
        let module = ElasticModule::new();
        let err = module
            .open(BackendKind::Elasticsearch, &ConnectionParams::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), &ErrorKind::InvalidArgument);
        assert!(err.message().contains(PARAM_URL));
    }

    #[tokio::test]
    async fn test_module_rejects_malformed_prefix() {
        let module = ElasticModule::new();
        let params = ConnectionParams::new()
            .set(PARAM_URL, "http://localhost:9200")
            .set("index_prefix", "Has Spaces");
        let err = module
            .open(BackendKind::Elasticsearch, &params)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), &ErrorKind::InvalidArgument);
        assert!(err.message().contains("index prefix"));
    }
}
