//! # dms-search core
//!
//! Runtime-agnostic search and indexing core: node model, error taxonomy,
//! analyzers, query grammar, field projection, index maintenance, the
//! secured query engine and prefix suggestions.
//!
//! This crate contains no database driver and no async runtime. Storage,
//! access control, transactions and text extraction are reached through the
//! traits in [`collaborators`] and [`index`]; in-memory implementations of
//! the index and the node store are included for tests and embedding.

pub mod analyzer;
pub mod collaborators;
pub mod engine;
pub mod error;
pub mod highlight;
pub mod index;
pub mod maintainer;
pub mod memory_nodes;
pub mod models;
pub mod projection;
pub mod query;
pub mod read_filter;
pub mod strategy;
pub mod suggest;

pub use error::{SearchError, SearchResult};
