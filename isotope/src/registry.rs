//! Backend modules, connection parameters, and the table-driven registry
//! that opens repositories by backend kind.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use indexmap::IndexMap;
use log::info;

use crate::common::constants::{PARAM_PASSWORD, PARAM_USERNAME};
use crate::errors::{IsotopeError, IsotopeResult};
use crate::memory::MemoryModule;
use crate::repository::Repository;

/// The storage engines a repository can run on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BackendKind {
    /// In-process store, no external service.
    Memory,
    /// Native document database.
    MongoDb,
    /// Relational engine, PostgreSQL dialect.
    Postgres,
    /// Relational engine, MySQL dialect.
    MySql,
    /// Relational engine, SQLite dialect.
    Sqlite,
    /// Wide-column store with lightweight transactions.
    Scylla,
    /// Search index with scripted conditional updates.
    Elasticsearch,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Memory => "memory",
            BackendKind::MongoDb => "mongodb",
            BackendKind::Postgres => "postgres",
            BackendKind::MySql => "mysql",
            BackendKind::Sqlite => "sqlite",
            BackendKind::Scylla => "scylla",
            BackendKind::Elasticsearch => "elasticsearch",
        }
    }

    /// Parses a kind from its canonical name.
    pub fn from_name(name: &str) -> Option<BackendKind> {
        match name {
            "memory" => Some(BackendKind::Memory),
            "mongodb" => Some(BackendKind::MongoDb),
            "postgres" => Some(BackendKind::Postgres),
            "mysql" => Some(BackendKind::MySql),
            "sqlite" => Some(BackendKind::Sqlite),
            "scylla" => Some(BackendKind::Scylla),
            "elasticsearch" => Some(BackendKind::Elasticsearch),
            _ => None,
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// String key-value parameters handed to a module when opening a backend.
///
/// Modules document the keys they understand; `url` is the conventional key
/// for the connection string.
#[derive(Clone, Debug, Default)]
pub struct ConnectionParams {
    values: IndexMap<String, String>,
}

impl ConnectionParams {
    pub fn new() -> ConnectionParams {
        ConnectionParams::default()
    }

    /// Sets a parameter, replacing any previous value.
    pub fn set(mut self, key: &str, value: &str) -> ConnectionParams {
        self.values.insert(key.to_string(), value.to_string());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Reads a mandatory parameter.
    ///
    /// # Returns
    ///
    /// The value, or `InvalidArgument` naming the missing key.
    pub fn require(&self, key: &str) -> IsotopeResult<&str> {
        self.get(key).ok_or_else(|| {
            IsotopeError::invalid_argument(&format!("missing connection parameter '{}'", key))
        })
    }
}

/// Supplies credentials at connect time, so secrets stay out of connection
/// parameters assembled from configuration files.
pub trait CredentialProvider: Send + Sync {
    fn credentials(&self) -> IsotopeResult<Credentials>;
}

/// A username/password pair.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Credentials {
    username: String,
    password: String,
}

impl Credentials {
    pub fn new(username: &str, password: &str) -> Credentials {
        Credentials {
            username: username.to_string(),
            password: password.to_string(),
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn password(&self) -> &str {
        &self.password
    }
}

/// Credential provider backed by fixed values.
pub struct StaticCredentials {
    credentials: Credentials,
}

impl StaticCredentials {
    pub fn new(username: &str, password: &str) -> StaticCredentials {
        StaticCredentials {
            credentials: Credentials::new(username, password),
        }
    }
}

impl CredentialProvider for StaticCredentials {
    fn credentials(&self) -> IsotopeResult<Credentials> {
        Ok(self.credentials.clone())
    }
}

/// A pluggable backend: announces the kinds it serves and opens repositories
/// for them.
#[async_trait]
pub trait RepositoryModule: Send + Sync {
    /// The backend kinds this module can open.
    fn kinds(&self) -> Vec<BackendKind>;

    /// Opens a repository of the given kind.
    async fn open(&self, kind: BackendKind, params: &ConnectionParams)
        -> IsotopeResult<Repository>;
}

/// Table-driven registry mapping backend kinds to their modules.
///
/// A fresh registry already serves [BackendKind::Memory]; adapter crates
/// register their modules on top.
pub struct BackendRegistry {
    modules: DashMap<BackendKind, Arc<dyn RepositoryModule>>,
}

impl BackendRegistry {
    pub fn new() -> BackendRegistry {
        let registry = BackendRegistry {
            modules: DashMap::new(),
        };
        registry.register(Arc::new(MemoryModule::new()));
        registry
    }

    /// Registers a module for every kind it announces, replacing earlier
    /// registrations for the same kind.
    pub fn register(&self, module: Arc<dyn RepositoryModule>) {
        for kind in module.kinds() {
            self.modules.insert(kind, module.clone());
        }
    }

    /// The kinds a repository can currently be opened for.
    pub fn supported(&self) -> Vec<BackendKind> {
        self.modules.iter().map(|entry| *entry.key()).collect()
    }

    /// Opens a repository on the registered module for `kind`.
    ///
    /// # Returns
    ///
    /// The repository, or `Unsupported` when no module serves the kind.
    pub async fn open(
        &self,
        kind: BackendKind,
        params: &ConnectionParams,
    ) -> IsotopeResult<Repository> {
        let module = self
            .modules
            .get(&kind)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| {
                IsotopeError::unsupported(&format!("no module registered for backend '{}'", kind))
            })?;
        info!("opening {} repository", kind);
        module.open(kind, params).await
    }

    /// Opens a repository with credentials injected as the `username` and
    /// `password` parameters.
    pub async fn open_with(
        &self,
        kind: BackendKind,
        params: &ConnectionParams,
        provider: &dyn CredentialProvider,
    ) -> IsotopeResult<Repository> {
        let credentials = provider.credentials()?;
        let params = params
            .clone()
            .set(PARAM_USERNAME, credentials.username())
            .set(PARAM_PASSWORD, credentials.password());
        self.open(kind, &params).await
    }
}

impl Default for BackendRegistry {
    fn default() -> BackendRegistry {
        BackendRegistry::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;

    #[test]
    fn test_backend_kind_names_round_trip() {
        let kinds = [
            BackendKind::Memory,
            BackendKind::MongoDb,
            BackendKind::Postgres,
            BackendKind::MySql,
            BackendKind::Sqlite,
            BackendKind::Scylla,
            BackendKind::Elasticsearch,
        ];
        for kind in kinds {
            assert_eq!(BackendKind::from_name(kind.as_str()), Some(kind));
        }
        assert_eq!(BackendKind::from_name("tape-drive"), None);
    }

    #[test]
    fn test_connection_params_require() {
        let params = ConnectionParams::new().set("url", "memory://local");

        assert_eq!(params.get("url"), Some("memory://local"));
        assert_eq!(params.require("url").unwrap(), "memory://local");

        let missing = params.require("keyspace").unwrap_err();
        assert_eq!(missing.kind(), &ErrorKind::InvalidArgument);
        assert!(missing.message().contains("keyspace"));
    }

    #[test]
    fn test_static_credentials() {
        let provider = StaticCredentials::new("app", "secret");
        let credentials = provider.credentials().unwrap();
        assert_eq!(credentials.username(), "app");
        assert_eq!(credentials.password(), "secret");
    }

    #[tokio::test]
    async fn test_registry_opens_memory_backend() {
        let registry = BackendRegistry::new();
        assert!(registry.supported().contains(&BackendKind::Memory));

        let repository = registry
            .open(BackendKind::Memory, &ConnectionParams::new())
            .await
            .unwrap();
        assert_eq!(repository.backend(), BackendKind::Memory);
        repository.health_check().await.unwrap();
    }

    #[tokio::test]
    async fn test_registry_rejects_unregistered_kind() {
        let registry = BackendRegistry::new();
        let result = registry
            .open(BackendKind::Scylla, &ConnectionParams::new())
            .await;
        assert_eq!(result.unwrap_err().kind(), &ErrorKind::Unsupported);
    }

    #[tokio::test]
    async fn test_open_with_injects_credentials() {
        struct ParamAssertingModule;

        #[async_trait]
        impl RepositoryModule for ParamAssertingModule {
            fn kinds(&self) -> Vec<BackendKind> {
                vec![BackendKind::Scylla]
            }

            async fn open(
                &self,
                _kind: BackendKind,
                params: &ConnectionParams,
            ) -> IsotopeResult<Repository> {
                params.require(PARAM_USERNAME)?;
                params.require(PARAM_PASSWORD)?;
                Err(IsotopeError::transient("stub module never connects"))
            }
        }

        let registry = BackendRegistry::new();
        registry.register(Arc::new(ParamAssertingModule));

        let provider = StaticCredentials::new("app", "secret");
        let result = registry
            .open_with(BackendKind::Scylla, &ConnectionParams::new(), &provider)
            .await;
        // params reached the module; the stub fails after checking them
        assert_eq!(result.unwrap_err().kind(), &ErrorKind::Transient);
    }
}
