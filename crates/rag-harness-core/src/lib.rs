//! # RAG Harness Core
//!
//! Engine-independent logic for RAG Harness: data models, the error
//! taxonomy, text chunking, the [`Embedder`](embedding::Embedder) and
//! [`VectorIndex`](store::VectorIndex) capability traits, and the ranking
//! rules shared by every index backend.
//!
//! This crate has no tokio, sqlx, HTTP, or filesystem dependencies. The
//! `rag-harness` app crate supplies concrete embedding providers, the
//! SQLite index, document loading, and the tool gateway.

pub mod chunk;
pub mod embedding;
pub mod error;
pub mod models;
pub mod search;
pub mod store;

pub use error::{RagError, Result};
