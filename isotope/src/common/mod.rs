//! Common types and utilities shared across the repository contract and the
//! backend adapters.
//!
//! This module provides the document payload value type, sort ordering,
//! wire-shape constants, and small concurrency/time helpers.

pub mod constants;
mod sort_order;
mod util;
mod value;

pub use sort_order::*;
pub use util::*;
pub use value::*;
