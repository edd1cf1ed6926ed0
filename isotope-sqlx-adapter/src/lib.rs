//! Relational backend adapters.
//!
//! One strategy, three dialects: every document lives as a row of a shared
//! `isotope_documents` table keyed by `(collection, id)`, with the payload
//! serialized to a JSON text column and epoch-millisecond timestamps. Plain
//! compare-and-set mutations are `UPDATE … SET version = version + 1 WHERE
//! … AND version = ?` with affected-row conflict detection; the atomic
//! find-and-mutate family locks the row with `SELECT … FOR UPDATE` inside a
//! driver transaction (SQLite relies on its writer lock instead). A
//! [Dialect] enum carries the small SQL differences between PostgreSQL,
//! MySQL, and SQLite over `sqlx`'s Any driver.

mod config;
mod dialect;
mod module;
mod repository;
mod statements;

pub use config::*;
pub use dialect::*;
pub use module::*;
pub use repository::*;
