use std::sync::Arc;

use async_trait::async_trait;

use isotope::common::constants::PARAM_URL;
use isotope::errors::{IsotopeError, IsotopeResult};
use isotope::event::ChangeEventPublisher;
use isotope::registry::{BackendKind, ConnectionParams, RepositoryModule};
use isotope::repository::Repository;

use crate::config::SqlxConfig;
use crate::dialect::Dialect;
use crate::repository::SqlxRepository;

/// Registry module announcing the three relational backends.
///
/// Recognized parameters: `url` (required), `max_connections`. The url
/// scheme decides the dialect and must agree with the requested kind.
pub struct SqlxModule {
    publisher: Option<Arc<ChangeEventPublisher>>,
}

impl SqlxModule {
    pub fn new() -> SqlxModule {
        SqlxModule { publisher: None }
    }

    pub fn with_publisher(publisher: Arc<ChangeEventPublisher>) -> SqlxModule {
        SqlxModule {
            publisher: Some(publisher),
        }
    }
}

impl Default for SqlxModule {
    fn default() -> Self {
        SqlxModule::new()
    }
}

#[async_trait]
impl RepositoryModule for SqlxModule {
    fn kinds(&self) -> Vec<BackendKind> {
        vec![BackendKind::Postgres, BackendKind::MySql, BackendKind::Sqlite]
    }

    async fn open(&self, kind: BackendKind, params: &ConnectionParams) -> IsotopeResult<Repository> {
        if !self.kinds().contains(&kind) {
            return Err(IsotopeError::unsupported(&format!(
                "this module cannot open a '{}' backend",
                kind.as_str()
            )));
        }
        let url = params.require(PARAM_URL)?;
        let dialect = Dialect::from_url(url)?;
        if dialect.backend_kind() != kind {
            return Err(IsotopeError::invalid_argument(&format!(
                "the url scheme selects '{}' but '{}' was requested",
                dialect.backend_kind().as_str(),
                kind.as_str()
            )));
        }

        let mut config = SqlxConfig::new(url);
        if let Some(raw) = params.get("max_connections") {
            let max_connections: u32 = raw.parse().map_err(|_| {
                IsotopeError::invalid_argument(&format!(
                    "max_connections must be a positive integer, got '{}'",
                    raw
                ))
            })?;
            config = config.max_connections(max_connections);
        }

        let repository = match &self.publisher {
            Some(publisher) => {
                SqlxRepository::connect_with_publisher(config, publisher.clone()).await?
            }
            None => SqlxRepository::connect(config).await?,
        };
        Ok(Repository::new(repository))
    }
}
