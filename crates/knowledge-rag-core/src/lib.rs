//! # knowledge-rag core
//!
//! I/O-free logic for the retrieval pipeline: data model, error taxonomy,
//! heading-aware chunking, the embedding and vector store traits, retrieval,
//! context assembly, and the answer generator boundary.
//!
//! This crate contains no tokio, sqlx, filesystem, or network code.
//!
//! ```text
//! ingest:  Document ─▶ chunk ─▶ EmbeddingProvider ─▶ VectorStore
//! query:   text ─▶ EmbeddingProvider ─▶ Retriever ─▶ context ─▶ AnswerGenerator
//! ```

pub mod chunk;
pub mod context;
pub mod embedding;
pub mod error;
pub mod generate;
pub mod models;
pub mod retrieve;
pub mod store;

pub use error::{RagError, Result};
