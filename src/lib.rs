//! # RAG Harness
//!
//! Document ingestion and retrieval for AI tools.
//!
//! Documents (plain text, Markdown, source code, PDF, EPUB, DOCX, FB2) are
//! normalized into text, split into overlapping chunks, embedded, and
//! stored in SQLite. Queries are answered by semantic, keyword, or hybrid
//! search and exposed as schema-described tools over a CLI, a JSON HTTP
//! API, and MCP.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌─────────┐   ┌───────────┐   ┌──────────────┐
//! │  Loader  │──▶│ Chunker │──▶│ Embedding │──▶│ Vector index │
//! │ pdf/epub │   │         │   │  client   │   │ SQLite/FTS5  │
//! └──────────┘   └─────────┘   └───────────┘   └──────┬───────┘
//!                                                     │
//!                                              ┌──────┴──────┐
//!                                              │  Retriever  │
//!                                              └──────┬──────┘
//!                                                     ▼
//!                                              ┌─────────────┐
//!                                              │ ToolGateway │
//!                                              │ CLI/HTTP/MCP│
//!                                              └─────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! rh init                               # create the database
//! rh ingest ./docs                      # load, chunk, embed, store
//! rh search "refund policy" --top-k 3   # query
//! rh serve                              # HTTP + MCP tool server
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`loader`] | Format detection and text extraction |
//! | [`embedding`] | Embedding providers and the retrying client |
//! | [`ingest`] | Load → chunk → embed → store orchestration |
//! | [`retrieve`] | Query execution across search modes |
//! | [`sqlite_store`] | SQLite-backed vector index |
//! | [`migrate`] | Schema migrations |
//! | [`tools`] | Tool registry, argument validation, built-in tools |
//! | [`server`] | HTTP server |
//! | [`mcp`] | MCP bridge |
//! | [`commands`] | CLI command implementations |
//!
//! Engine-independent types (models, errors, chunking, ranking, the
//! in-memory index) live in the `rag-harness-core` crate and are
//! re-exported as [`core`].

pub use rag_harness_core as core;

pub mod commands;
pub mod config;
pub mod embedding;
pub mod ingest;
pub mod loader;
pub mod logging;
pub mod mcp;
pub mod migrate;
pub mod pipeline;
pub mod retrieve;
pub mod server;
pub mod sqlite_store;
pub mod tools;
