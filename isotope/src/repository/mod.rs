//! The repository contract and its supporting types.
//!
//! This module defines the single logical contract every backend adapter
//! implements: versioned CRUD, filter-addressed atomic mutations, bulk
//! writes, aggregation, index and collection management, transactions, and
//! health checks. The [Repository] facade wraps any
//! [RepositoryProvider] behind a stable, cloneable handle.

mod bulk;
mod contract;
mod find_options;
mod index_model;
mod transaction;
pub mod validate;

pub use bulk::*;
pub use contract::*;
pub use find_options::*;
pub use index_model::*;
pub use transaction::*;
