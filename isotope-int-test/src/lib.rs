//! Integration suites for the repository contract.
//!
//! Every suite runs unconditionally against the in-memory backend. The
//! live-backend smoke suites read their connection settings from the
//! environment and return early when the variable is unset, so `cargo test`
//! works without any running services.

pub mod test_util;
