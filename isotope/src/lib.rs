#![allow(dead_code, unused_imports)]
//! # Isotope - Storage-Engine-Agnostic Document Repository
//!
//! Isotope is a document repository that exposes one logical contract over
//! heterogeneous backing stores. Documents are schemaless, versioned, and
//! guarded by optimistic concurrency: every mutation is a compare-and-set on
//! the stored version, and a stale expectation is rejected with a version
//! conflict rather than merged.
//!
//! ## Key Features
//!
//! - **One contract, many engines**: the same repository operations run
//!   against MongoDB, PostgreSQL/MySQL/SQLite, ScyllaDB/Cassandra, and
//!   Elasticsearch through adapter crates
//! - **Optimistic concurrency**: monotonic per-document versions, starting at
//!   1 and incrementing by exactly 1 per accepted write
//! - **Atomic find-and-mutate**: filter-addressed single-document mutations
//!   built on each engine's native mechanism
//! - **Bulk writes**: unordered, partial-success batches grouped by collection
//! - **Portable aggregation**: match/sort/paginate/group pipeline subset with
//!   explicit errors where an engine cannot express a stage
//! - **CQRS routing**: command/query repository split with a replication-lag
//!   bound on replica reads
//! - **Change data capture**: post-commit change events through a bounded
//!   publisher that never fails the originating write
//! - **Clean API**: PIMPL pattern provides stable, encapsulated interface
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use isotope::data;
//! use isotope::document::Document;
//! use isotope::memory::MemoryRepository;
//! use isotope::repository::Repository;
//!
//! # async fn example() -> isotope::errors::IsotopeResult<()> {
//! let repo = Repository::new(MemoryRepository::new());
//!
//! // Save a document; the repository assigns id and version 1
//! let doc = Document::new("users", data! { name: "Alice", age: 30 });
//! let saved = repo.save(doc).await?;
//!
//! // Compare-and-set update against the observed version
//! let updated = repo
//!     .update("users", saved.id(), saved.version(), &data! { age: 31 })
//!     .await?;
//! assert_eq!(updated.version(), saved.version() + 1);
//! # Ok(())
//! # }
//! ```
//!
//! ## Design Pattern
//!
//! Isotope uses the **PIMPL (Pointer To IMPLementation)** design pattern:
//! public facades such as [`repository::Repository`] and
//! [`repository::TransactionScope`] wrap `Arc<dyn Provider>` objects, so the
//! public interface stays stable while adapters evolve independently, and all
//! clones share the same underlying state.
//!
//! ## Module Organization
//!
//! - [`aggregate`] - Portable aggregation pipeline model
//! - [`common`] - Common types, values, and constants
//! - [`cqrs`] - Command/query repository split with staleness-bounded reads
//! - [`document`] - Versioned document envelope
//! - [`errors`] - Error types and result definitions
//! - [`event`] - Change events, sink contract, and the bounded publisher
//! - [`filter`] - Flat equality filters
//! - [`memory`] - In-memory reference backend
//! - [`metrics`] - Operation metrics recording and instrumentation
//! - [`registry`] - Backend registry and connection parameters
//! - [`repository`] - The repository contract and its option types
//! - [`translate`] - Shared client-side filter/sort/pipeline evaluation

pub mod aggregate;
pub mod common;
pub mod cqrs;
pub mod document;
pub mod errors;
pub mod event;
pub mod filter;
pub mod memory;
pub mod metrics;
pub mod registry;
pub mod repository;
pub mod translate;
