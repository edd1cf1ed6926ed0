//! Wide-column backend adapter.
//!
//! Documents live in one table partitioned by collection and clustered by
//! id, with the payload as JSON text and epoch-millisecond timestamps.
//! Conditional mutations use lightweight transactions (`IF NOT EXISTS`,
//! `IF version = ?`); a negative `[applied]` surfaces as VersionConflict or
//! NotFound with no retry. Filters beyond id equality scan the collection
//! partition and evaluate client-side, which keeps the query surface
//! portable at the cost of partition-sized reads.

mod config;
mod module;
mod repository;
mod statements;

pub use config::*;
pub use module::*;
pub use repository::*;
