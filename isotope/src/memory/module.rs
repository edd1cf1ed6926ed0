use async_trait::async_trait;

use crate::errors::{IsotopeError, IsotopeResult};
use crate::memory::MemoryRepository;
use crate::registry::{BackendKind, ConnectionParams, RepositoryModule};
use crate::repository::Repository;

/// Registry module for the in-process backend.
///
/// Ignores all connection parameters; every `open` call produces a fresh,
/// empty store.
pub struct MemoryModule;

impl MemoryModule {
    pub fn new() -> MemoryModule {
        MemoryModule
    }
}

impl Default for MemoryModule {
    fn default() -> MemoryModule {
        MemoryModule::new()
    }
}

#[async_trait]
impl RepositoryModule for MemoryModule {
    fn kinds(&self) -> Vec<BackendKind> {
        vec![BackendKind::Memory]
    }

    async fn open(
        &self,
        kind: BackendKind,
        _params: &ConnectionParams,
    ) -> IsotopeResult<Repository> {
        if kind != BackendKind::Memory {
            return Err(IsotopeError::unsupported(&format!(
                "the memory module cannot open '{}' repositories",
                kind
            )));
        }
        Ok(Repository::new(MemoryRepository::new()))
    }
}
