use std::ops::Deref;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::common::DocumentData;
use crate::document::Document;
use crate::errors::IsotopeResult;
use crate::filter::Filter;

/// The single-document operations available inside a transaction.
///
/// Backend adapters implement this against their native transaction
/// mechanism: the document store binds a server session, the relational
/// adapter a driver transaction. Engines without multi-operation atomicity
/// (wide-column, search index) execute the scope's operations directly and
/// document that no cross-operation rollback exists.
#[async_trait]
pub trait TransactionScopeProvider: Send + Sync {
    async fn save(&self, document: Document) -> IsotopeResult<Document>;

    async fn find_by_id(&self, collection: &str, id: &str) -> IsotopeResult<Document>;

    async fn update(
        &self,
        collection: &str,
        id: &str,
        expected_version: i64,
        update: &DocumentData,
    ) -> IsotopeResult<Document>;

    async fn replace(&self, document: &Document) -> IsotopeResult<Document>;

    async fn delete(&self, collection: &str, id: &str, expected_version: i64) -> IsotopeResult<()>;

    async fn upsert(
        &self,
        collection: &str,
        filter: &Filter,
        update: &DocumentData,
    ) -> IsotopeResult<Document>;
}

/// A handle to an in-flight transaction.
///
/// `TransactionScope` is an explicit argument to the transactional closure;
/// there is no ambient transaction state. Operations invoked on the scope
/// run inside the backend transaction that [with_transaction] opened, and
/// the transaction commits when the closure returns `Ok` or rolls back when
/// it returns `Err`.
///
/// # Examples
///
/// ```rust,ignore
/// use isotope::repository::transaction;
///
/// repo.with_transaction(transaction(|tx| {
///     Box::pin(async move {
///         let account = tx.find_by_id("accounts", "a-1").await?;
///         tx.update("accounts", "a-1", account.version(), &data! { active: false }).await?;
///         Ok(())
///     })
/// }))
/// .await?;
/// ```
///
/// [with_transaction]: crate::repository::RepositoryProvider::with_transaction
#[derive(Clone)]
pub struct TransactionScope {
    inner: Arc<dyn TransactionScopeProvider>,
}

impl TransactionScope {
    /// Wraps a provider in the public scope facade.
    pub fn new<T: TransactionScopeProvider + 'static>(provider: T) -> TransactionScope {
        TransactionScope {
            inner: Arc::new(provider),
        }
    }

    /// Wraps an already shared provider.
    pub fn from_arc(inner: Arc<dyn TransactionScopeProvider>) -> TransactionScope {
        TransactionScope { inner }
    }
}

impl Deref for TransactionScope {
    type Target = Arc<dyn TransactionScopeProvider>;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

/// The closure type accepted by `with_transaction`.
///
/// The future borrows the scope, so the transaction cannot leak past the
/// closure's lifetime.
pub type TransactionFunc =
    Box<dyn for<'a> FnOnce(&'a TransactionScope) -> BoxFuture<'a, IsotopeResult<()>> + Send>;

/// Boxes a closure into a [TransactionFunc].
///
/// # Examples
///
/// ```rust,ignore
/// let func = transaction(|tx| Box::pin(async move {
///     tx.save(Document::new("audit", data! { action: "login" })).await?;
///     Ok(())
/// }));
/// repo.with_transaction(func).await?;
/// ```
pub fn transaction<F>(f: F) -> TransactionFunc
where
    F: for<'a> FnOnce(&'a TransactionScope) -> BoxFuture<'a, IsotopeResult<()>> + Send + 'static,
{
    Box::new(f)
}
