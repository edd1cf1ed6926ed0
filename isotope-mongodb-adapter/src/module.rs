use std::sync::Arc;

use async_trait::async_trait;

use isotope::common::constants::PARAM_URL;
use isotope::errors::{IsotopeError, IsotopeResult};
use isotope::event::ChangeEventPublisher;
use isotope::registry::{BackendKind, ConnectionParams, RepositoryModule};
use isotope::repository::Repository;

use crate::config::MongoConfig;
use crate::repository::MongoRepository;

/// Registry module for the MongoDB backend.
///
/// Parameters: `url` and `database` are mandatory; `app_name`,
/// `max_pool_size`, and `read_secondary` (`"true"`) are optional.
pub struct MongoModule {
    publisher: Option<Arc<ChangeEventPublisher>>,
}

impl MongoModule {
    pub fn new() -> MongoModule {
        MongoModule { publisher: None }
    }

    /// Opened repositories will feed committed changes to this publisher.
    pub fn with_publisher(publisher: Arc<ChangeEventPublisher>) -> MongoModule {
        MongoModule {
            publisher: Some(publisher),
        }
    }
}

impl Default for MongoModule {
    fn default() -> MongoModule {
        MongoModule::new()
    }
}

#[async_trait]
impl RepositoryModule for MongoModule {
    fn kinds(&self) -> Vec<BackendKind> {
        vec![BackendKind::MongoDb]
    }

    async fn open(
        &self,
        kind: BackendKind,
        params: &ConnectionParams,
    ) -> IsotopeResult<Repository> {
        if kind != BackendKind::MongoDb {
            return Err(IsotopeError::unsupported(&format!(
                "the MongoDB module cannot open a '{}' backend",
                kind
            )));
        }
        let url = params.require(PARAM_URL)?;
        let database = params.require("database")?;
        let mut config = MongoConfig::new(url, database);
        if let Some(name) = params.get("app_name") {
            config = config.app_name(name);
        }
        if let Some(size) = params.get("max_pool_size") {
            let size: u32 = size.parse().map_err(|_| {
                IsotopeError::invalid_argument(&format!(
                    "'max_pool_size' must be a positive integer, got '{}'",
                    size
                ))
            })?;
            config = config.max_pool_size(size);
        }
        if params.get("read_secondary") == Some("true") {
            config = config.read_secondary();
        }

        let repository = match &self.publisher {
            Some(publisher) => {
                MongoRepository::connect_with_publisher(config, publisher.clone()).await?
            }
            None => MongoRepository::connect(config).await?,
        };
        Ok(Repository::new(repository))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use isotope::errors::ErrorKind;

    #[test]
    fn test_module_announces_mongodb() {
        assert_eq!(MongoModule::new().kinds(), vec![BackendKind::MongoDb]);
    }

    #[tokio::test]
    async fn test_open_rejects_foreign_kind() {
        let module = MongoModule::new();
        let result = module
            .open(BackendKind::Sqlite, &ConnectionParams::new())
            .await;
        assert_eq!(result.unwrap_err().kind(), &ErrorKind::Unsupported);
    }

    #[tokio::test]
    async fn test_open_requires_url_and_database() {
        let module = MongoModule::new();

        let result = module
            .open(BackendKind::MongoDb, &ConnectionParams::new())
            .await;
        let error = result.unwrap_err();
        assert_eq!(error.kind(), &ErrorKind::InvalidArgument);
        assert!(error.message().contains("url"));

        let params = ConnectionParams::new().set(PARAM_URL, "mongodb://localhost:27017");
        let error = module.open(BackendKind::MongoDb, &params).await.unwrap_err();
        assert_eq!(error.kind(), &ErrorKind::InvalidArgument);
        assert!(error.message().contains("database"));
    }

    #[tokio::test]
    async fn test_open_rejects_malformed_pool_size() {
        let module = MongoModule::new();
        let params = ConnectionParams::new()
            .set(PARAM_URL, "mongodb://localhost:27017")
            .set("database", "isotope")
            .set("max_pool_size", "plenty");
        let error = module.open(BackendKind::MongoDb, &params).await.unwrap_err();
        assert_eq!(error.kind(), &ErrorKind::InvalidArgument);
    }
}
