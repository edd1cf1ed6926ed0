//! MongoDB backend adapter.
//!
//! Documents live one-per-BSON-document in a collection of the same name:
//! `{_id, data, version, created_at, updated_at}`. Compare-and-set mutations
//! run as single `findAndModify` commands filtering on `_id` and `version`,
//! so the version check and the write are one server-side step. Multi
//! operation transactions bind a server session, and the aggregation
//! pipeline translates stage-for-stage onto the native pipeline.

mod codec;
mod config;
mod module;
mod probe;
mod repository;

pub use config::*;
pub use module::*;
pub use probe::*;
pub use repository::*;
