//! remint-core: Core library for remint
//!
//! This crate provides the migration engine behind `remint`, a tool that
//! retypes legacy entities in a document index and rewrites their
//! content-derived identifiers in bulk.
//!
//! # Architecture
//!
//! ```text
//! Store → Scanner → Operation Builder → Batcher → Applier → Store
//!                         ↑                          ↓
//!                  Identifier Deriver          Progress Sink
//! ```
//!
//! # Modules
//!
//! - `scanner`: Paginated scan of records matching a predicate
//! - `derive`: Deterministic identifier derivation
//! - `operations`: Record to partial-update conversion
//! - `batcher`: Size-bounded batch splitting
//! - `applier`: Bounded concurrent bulk application, fail-fast
//! - `progress`: Progress snapshots and sinks
//! - `controller`: Run orchestration, summaries and dry-run plans
//! - `lifecycle`: Up/down hooks for migration runners
//! - `store`: Store interfaces plus in-memory and Elasticsearch adapters
//! - `config`: Configuration management
//! - `logging`: Structured logging setup
//!
//! # Safety
//!
//! This crate forbids unsafe code.

#![forbid(unsafe_code)]

pub mod applier;
pub mod batcher;
pub mod config;
pub mod controller;
pub mod derive;
pub mod error;
pub mod lifecycle;
pub mod logging;
pub mod model;
pub mod operations;
pub mod progress;
pub mod scanner;
pub mod store;

pub use error::{Error, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
