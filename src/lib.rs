//! # dirsense
//!
//! A local file-intelligence layer over a per-machine file index.
//!
//! dirsense reads an existing `files` table and builds three things on top
//! of it: hybrid file search (lexical + fuzzy + semantic, fused by
//! reciprocal rank), a relationship graph between files (siblings,
//! references, duplicates, co-modified pairs, embedding similarity), and
//! per-directory entropy scores that feed cleanup suggestions. Suggestions
//! are never applied silently; accepting one stages verified copies first
//! and every accepted operation can be undone from its manifest.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   ┌─────────────┐   ┌──────────────┐
//! │ files table│──▶│ hasher /    │──▶│   SQLite     │
//! │ (external) │   │ embedder    │   │ edges,scores │
//! └────────────┘   └─────────────┘   └──────┬───────┘
//!                                           │
//!              ┌────────────────┬───────────┤
//!              ▼                ▼           ▼
//!        ┌──────────┐    ┌───────────┐ ┌──────────┐
//!        │  search  │    │ suggest / │ │ idle     │
//!        │ related  │    │ staging   │ │scheduler │
//!        └──────────┘    └───────────┘ └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! dsense init                   # create tables
//! dsense pass                   # hash, embed, build graph, score, suggest
//! dsense search "tax receipts 2023"
//! dsense suggest list
//! dsense suggest accept 3
//! dsense undo <staging dir>
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`models`] | Core data types |
//! | [`files`] | Read access to the file index |
//! | [`hasher`] | Content fingerprints |
//! | [`embedding`] | Embedding endpoint client and vector storage |
//! | [`embed_cmd`] | Incremental embedding of the index |
//! | [`search`] | Hybrid ranking |
//! | [`analyzers`] | Edge analyzers |
//! | [`graph`] | Edge storage, traversal and the analyzer pass |
//! | [`entropy`] | Directory entropy scorers |
//! | [`suggest`] | Suggestion rules and lifecycle |
//! | [`staging`] | Staging, archive, undo and purge |
//! | [`oplog`] | Operation log |
//! | [`scheduler`] | Idle-time background passes |
//! | [`stats`] | Index health overview |
//! | [`logging`] | Tracing subscriber setup |
//! | [`error`] | Typed safe-operation errors |

pub mod analyzers;
pub mod config;
pub mod db;
pub mod embed_cmd;
pub mod embedding;
pub mod entropy;
pub mod error;
pub mod files;
pub mod graph;
pub mod hasher;
pub mod logging;
pub mod migrate;
pub mod models;
pub mod oplog;
pub mod scheduler;
pub mod search;
pub mod staging;
pub mod stats;
pub mod suggest;
