//! In-process repository backend.
//!
//! The memory backend is the reference implementation of the contract: no
//! external service, full support for every operation, and the strictest
//! possible atomicity (one writer at a time). Integration tests and
//! embedding applications use it as a drop-in stand-in for a real engine.

mod module;
mod repository;
mod store;

pub use module::*;
pub use repository::*;
