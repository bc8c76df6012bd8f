//! # DMS Search
//!
//! Secured full-text search over a document-management repository of
//! documents, folders and mails.
//!
//! The query engine, index maintainer and field projection live in
//! `dms-search-core`. This crate is the composition root: it stores nodes and
//! the text index in SQLite, extracts text from binary content, imports
//! directory trees and exposes everything through a CLI and an HTTP API.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   ┌──────────────────┐   ┌─────────────────┐
//! │  Import /  │──▶│  IndexMaintainer │──▶│  SQLite index   │
//! │  write path│   │  FieldProjector  │   │  FTS5 + terms   │
//! └────────────┘   └──────────────────┘   └────────┬────────┘
//!                                                  │
//!                   ┌──────────────────┐           │
//!                   │SecuredQueryEngine│◀──────────┘
//!                   │ access filtering │◀── SQLite nodes
//!                   └────────┬─────────┘
//!                     ┌──────┴──────┐
//!                     ▼             ▼
//!                ┌─────────┐   ┌─────────┐
//!                │   CLI   │   │  HTTP   │
//!                └─────────┘   └─────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! dms-search init                         # create database
//! dms-search import ./docs --as alice     # import a directory
//! dms-search search "budget" --as alice   # access-filtered query
//! dms-search serve                        # HTTP API
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`db`] | SQLite connection pool |
//! | [`migrate`] | Node and index schema migrations |
//! | [`sqlite_nodes`] | Node repository and access decision |
//! | [`snapshot`] | Units of work as read snapshots |
//! | [`sqlite_index`] | FTS5-backed text index |
//! | [`extract`] | Text extraction from PDF and Office content |
//! | [`services`] | Wiring of stores, engine and maintainer |
//! | [`import`] | Filesystem import (write path) |
//! | [`search`] | Query commands |
//! | [`inspect`] | Index diagnostics |
//! | [`progress`] | Progress reporting for long operations |
//! | [`server`] | HTTP API |

pub mod config;
pub mod db;
pub mod extract;
pub mod import;
pub mod inspect;
pub mod migrate;
pub mod progress;
pub mod search;
pub mod server;
pub mod services;
pub mod snapshot;
pub mod sqlite_index;
pub mod sqlite_nodes;
