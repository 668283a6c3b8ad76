//! Core data types shared by the pipeline stages.
//!
//! These types are I/O-free: the loader produces [`Document`]s, the chunker
//! turns them into [`Chunk`]s, and stores persist [`VectorRecord`]s.
//! Optional, open-ended attributes live in a [`Metadata`] map; every
//! field the pipeline relies on is an explicit struct field.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A primitive metadata value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetaValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl From<&str> for MetaValue {
    fn from(s: &str) -> Self {
        MetaValue::Text(s.to_string())
    }
}

impl From<String> for MetaValue {
    fn from(s: String) -> Self {
        MetaValue::Text(s)
    }
}

impl From<i64> for MetaValue {
    fn from(v: i64) -> Self {
        MetaValue::Int(v)
    }
}

impl From<bool> for MetaValue {
    fn from(v: bool) -> Self {
        MetaValue::Bool(v)
    }
}

/// Open-ended string → primitive map, ordered for deterministic output.
pub type Metadata = BTreeMap<String, MetaValue>;

/// A normalized source document, ready for chunking.
///
/// `source` is unique per corpus: the path relative to the documents
/// root, using `/` separators.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    /// Relative source path (identity).
    pub source: String,
    /// First level-1 heading, else the file name.
    pub title: String,
    /// Normalized markdown text.
    pub text: String,
    /// Last-modified time (unix seconds).
    pub modified_at: i64,
    pub extra: Metadata,
}

/// Lineage attached to every chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    pub source: String,
    #[serde(default)]
    pub title: String,
    /// Headings from the document root down to the chunk's section.
    pub heading_path: Vec<String>,
    /// Position within the document, contiguous from 0.
    pub chunk_index: usize,
    /// Character length of the chunk text.
    pub char_len: usize,
    /// Headings of undersized sections folded into this chunk.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub also_covers: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: Metadata,
}

impl ChunkMetadata {
    /// Heading path rendered as `A > B > C`.
    pub fn section_label(&self) -> String {
        self.heading_path.join(" > ")
    }
}

/// A contiguous span of a document's text.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    /// Hex SHA-256 over (source, heading path, text).
    pub fingerprint: String,
    pub text: String,
    /// Number of leading characters repeated from the previous chunk.
    pub overlap: usize,
    pub metadata: ChunkMetadata,
}

impl Chunk {
    /// Text handed to the embedding provider: the heading path followed
    /// by the chunk body.
    pub fn embedding_input(&self) -> String {
        if self.metadata.heading_path.is_empty() {
            self.text.clone()
        } else {
            format!("{}\n\n{}", self.metadata.section_label(), self.text)
        }
    }
}

/// Identifies the vector space produced by one embedding model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbeddingSpace {
    pub model: String,
    pub dims: usize,
}

/// A persisted (fingerprint → vector, text, metadata) triple.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorRecord {
    pub fingerprint: String,
    pub vector: Vec<f32>,
    pub text: String,
    pub metadata: ChunkMetadata,
}

impl VectorRecord {
    pub fn from_chunk(chunk: Chunk, vector: Vec<f32>) -> Self {
        Self {
            fingerprint: chunk.fingerprint,
            vector,
            text: chunk.text,
            metadata: chunk.metadata,
        }
    }
}

/// Per-document bookkeeping kept alongside the records.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceState {
    pub source: String,
    /// Ingest digest. `None` when the last ingestion of the document
    /// was partial, so the next run retries it.
    pub digest: Option<String>,
    pub title: String,
    pub modified_at: i64,
    pub ingested_at: i64,
}

/// A chunk returned by a similarity query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrievedChunk {
    pub fingerprint: String,
    /// Cosine similarity to the query vector.
    pub score: f32,
    pub text: String,
    pub metadata: ChunkMetadata,
}

/// Ranked retrieval output: descending score, ties by ascending fingerprint.
pub type RetrievalResult = Vec<RetrievedChunk>;
