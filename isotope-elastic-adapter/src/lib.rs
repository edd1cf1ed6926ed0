//! Search-index backend adapter.
//!
//! Each collection maps to one index (a configurable prefix plus the
//! lowercased collection name); the stored source wraps the payload with
//! the version and epoch-millisecond timestamps, and a dynamic template
//! indexes payload strings as keywords so equality filters stay exact.
//! Conditional mutations run painless scripts that compare the stored
//! version and set `ctx.op` to `noop` on a mismatch, which surfaces as
//! VersionConflict. Every write passes `refresh=true`, trading throughput
//! for read-your-writes behavior.

mod codec;
mod config;
mod module;
mod repository;

pub use config::*;
pub use module::*;
pub use repository::*;
