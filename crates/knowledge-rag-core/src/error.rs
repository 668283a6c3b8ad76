//! Error taxonomy shared by every pipeline stage.
//!
//! Each variant carries a handling policy: load and chunking failures are
//! skipped per document, transient provider failures are retried, and
//! store, dimension, and model errors abort the current operation.

use thiserror::Error;

/// Errors raised by the retrieval pipeline.
#[derive(Debug, Error)]
pub enum RagError {
    /// The documents directory (or another required path) is unavailable.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A single source file could not be read or decoded.
    #[error("failed to load {path}: {reason}")]
    Load { path: String, reason: String },

    /// A document's structural markup could not be parsed.
    #[error("failed to chunk {path}: {reason}")]
    Chunking { path: String, reason: String },

    /// The embedding provider rejected or failed a request.
    #[error("embedding provider error: {message}")]
    EmbeddingProvider { message: String, transient: bool },

    /// The vector store could not be read or written.
    #[error("vector store error: {0}")]
    StoreIo(String),

    /// A vector's length differs from the store's embedding dimensionality.
    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// The store was built with a different embedding model.
    #[error("store was indexed with model '{store_model}' but '{query_model}' was requested")]
    IncompatibleModel {
        store_model: String,
        query_model: String,
    },

    /// Retrieval could not complete (store unreachable at query time).
    #[error("retrieval failed: {0}")]
    Retrieval(String),

    /// The answer generator failed.
    #[error("generation failed: {0}")]
    Generation(String),

    /// Configuration is invalid.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl RagError {
    /// Shorthand for a retryable provider failure.
    pub fn transient(message: impl Into<String>) -> Self {
        RagError::EmbeddingProvider {
            message: message.into(),
            transient: true,
        }
    }

    /// Shorthand for a non-retryable provider failure.
    pub fn permanent(message: impl Into<String>) -> Self {
        RagError::EmbeddingProvider {
            message: message.into(),
            transient: false,
        }
    }

    /// True when retrying the same request may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, RagError::EmbeddingProvider { transient: true, .. })
    }

    /// True when the error must abort the whole operation rather than a
    /// single document or chunk.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RagError::Io(_)
                | RagError::StoreIo(_)
                | RagError::DimensionMismatch { .. }
                | RagError::IncompatibleModel { .. }
                | RagError::Config(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, RagError>;
