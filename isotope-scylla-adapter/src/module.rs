use std::sync::Arc;

use async_trait::async_trait;

use isotope::common::constants::PARAM_URL;
use isotope::errors::{IsotopeError, IsotopeResult};
use isotope::event::ChangeEventPublisher;
use isotope::registry::{BackendKind, ConnectionParams, RepositoryModule};
use isotope::repository::Repository;

use crate::config::ScyllaConfig;
use crate::repository::ScyllaRepository;

/// Registry module for the wide-column backend.
///
/// Recognized parameters: `url` (required, comma-separated contact nodes),
/// `keyspace` (required), `replication_factor`.
pub struct ScyllaModule {
    publisher: Option<Arc<ChangeEventPublisher>>,
}

impl ScyllaModule {
    pub fn new() -> ScyllaModule {
        ScyllaModule { publisher: None }
    }

    pub fn with_publisher(publisher: Arc<ChangeEventPublisher>) -> ScyllaModule {
        ScyllaModule {
            publisher: Some(publisher),
        }
    }
}

impl Default for ScyllaModule {
    fn default() -> Self {
        ScyllaModule::new()
    }
}

#[async_trait]
impl RepositoryModule for ScyllaModule {
    fn kinds(&self) -> Vec<BackendKind> {
        vec![BackendKind::Scylla]
    }

    async fn open(&self, kind: BackendKind, params: &ConnectionParams) -> IsotopeResult<Repository> {
        if kind != BackendKind::Scylla {
            return Err(IsotopeError::unsupported(&format!(
                "this module cannot open a '{}' backend",
                kind.as_str()
            )));
        }
        let nodes: Vec<String> = params
            .require(PARAM_URL)?
            .split(',')
            .map(|node| node.trim().to_string())
            .filter(|node| !node.is_empty())
            .collect();
        let keyspace = params.require("keyspace")?;

        let mut config = ScyllaConfig::new(nodes, keyspace);
        if let Some(raw) = params.get("replication_factor") {
            let replication_factor: u32 = raw.parse().map_err(|_| {
                IsotopeError::invalid_argument(&format!(
                    "replication_factor must be a positive integer, got '{}'",
                    raw
                ))
            })?;
            config = config.replication_factor(replication_factor);
        }

        let repository = match &self.publisher {
            Some(publisher) => {
                ScyllaRepository::connect_with_publisher(config, publisher.clone()).await?
            }
            None => ScyllaRepository::connect(config).await?,
        };
        Ok(Repository::new(repository))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use isotope::errors::ErrorKind;

    #[tokio::test]
    async fn test_module_announces_wide_column_kind() {
        let module = ScyllaModule::new();
        assert_eq!(module.kinds(), vec![BackendKind::Scylla]);
    }

    #[tokio::test]
    async fn test_module_rejects_foreign_kind() {
        let module = ScyllaModule::new();
        let params = ConnectionParams::new()
            .set(PARAM_URL, "127.0.0.1:9042")
            .set("keyspace", "app");
        let err = module
            .open(BackendKind::MongoDb, &params)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), &ErrorKind::Unsupported);
    }

    #[tokio::test]
    async fn test_module_requires_nodes_and_keyspace() {
        let module = ScyllaModule::new();
        let err = module
            .open(BackendKind::Scylla, &ConnectionParams::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), &ErrorKind::InvalidArgument);
        assert!(err.message().contains(PARAM_URL));

        let params = ConnectionParams::new().set(PARAM_URL, "127.0.0.1:9042");
        let err = module.open(BackendKind::Scylla, &params).await.unwrap_err();
        assert_eq!(err.kind(), &ErrorKind::InvalidArgument);
        assert!(err.message().contains("keyspace"));
    }

    #[tokio::test]
    async fn test_module_rejects_malformed_replication_factor() {
        let module = ScyllaModule::new();
        let params = ConnectionParams::new()
            .set(PARAM_URL, "127.0.0.1:9042")
            .set("keyspace", "app")
            .set("replication_factor", "lots");
        let err = module.open(BackendKind::Scylla, &params).await.unwrap_err();
        assert_eq!(err.kind(), &ErrorKind::InvalidArgument);
        assert!(err.message().contains("replication_factor"));
    }
}
