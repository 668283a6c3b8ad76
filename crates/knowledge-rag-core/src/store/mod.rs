//! Vector store abstraction.
//!
//! The [`VectorStore`] trait defines every storage operation the ingestion
//! and retrieval pipeline needs, enabling pluggable backends (SQLite in the
//! app crate, [`memory::InMemoryStore`] here).
//!
//! Implementations must be `Send + Sync` to work with async runtimes.
//!
//! # Contract
//!
//! - Records are keyed by content fingerprint; upserting an identical record
//!   is a no-op and upserting changed content replaces it.
//! - A store records the [`EmbeddingSpace`] that produced its vectors and
//!   rejects vectors of any other dimensionality.
//! - Similarity is cosine, ranked by descending score with exact ties broken
//!   by ascending fingerprint.
//! - [`replace_source`](VectorStore::replace_source) is atomic: readers see
//!   either the old record set of a document or the new one.

pub mod memory;

use async_trait::async_trait;
use std::cmp::Ordering;

use crate::error::{RagError, Result};
use crate::models::{
    ChunkMetadata, EmbeddingSpace, RetrievalResult, RetrievedChunk, SourceState, VectorRecord,
};

/// Result of a single upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    Unchanged,
}

/// Counts from [`VectorStore::replace_source`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplaceSummary {
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    /// Stale records of the source that were deleted.
    pub removed: usize,
}

impl ReplaceSummary {
    pub fn record(&mut self, outcome: UpsertOutcome) {
        match outcome {
            UpsertOutcome::Inserted => self.inserted += 1,
            UpsertOutcome::Updated => self.updated += 1,
            UpsertOutcome::Unchanged => self.unchanged += 1,
        }
    }

    /// Records whose content was written.
    pub fn written(&self) -> usize {
        self.inserted + self.updated
    }
}

/// Optional restrictions applied to a similarity query.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordFilter {
    /// Only records from these source paths.
    pub sources: Option<Vec<String>>,
    /// Only records whose heading path contains this heading.
    pub heading: Option<String>,
    /// Drop hits scoring below this threshold.
    pub min_score: Option<f32>,
}

impl RecordFilter {
    pub fn matches(&self, metadata: &ChunkMetadata) -> bool {
        if let Some(sources) = &self.sources {
            if !sources.iter().any(|s| s == &metadata.source) {
                return false;
            }
        }
        if let Some(heading) = &self.heading {
            if !metadata.heading_path.iter().any(|h| h == heading) {
                return false;
            }
        }
        true
    }

    pub fn accepts_score(&self, score: f32) -> bool {
        self.min_score.map_or(true, |min| score >= min)
    }
}

/// Abstract vector store.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`upsert`](VectorStore::upsert) | Insert or replace one record |
/// | [`get`](VectorStore::get) | Fetch a record by fingerprint |
/// | [`delete`](VectorStore::delete) | Remove a record by fingerprint |
/// | [`query`](VectorStore::query) | Top-k cosine similarity search |
/// | [`replace_source`](VectorStore::replace_source) | Atomically swap a document's records |
/// | [`remove_source`](VectorStore::remove_source) | Drop a document and its records |
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// The embedding space recorded by the first write, if any.
    async fn embedding_space(&self) -> Result<Option<EmbeddingSpace>>;

    /// Record `space` on an unbound store. Fails with
    /// [`RagError::IncompatibleModel`] or [`RagError::DimensionMismatch`]
    /// if a different space is already bound.
    async fn bind_embedding_space(&self, space: &EmbeddingSpace) -> Result<()>;

    async fn upsert(&self, record: VectorRecord) -> Result<UpsertOutcome>;

    async fn get(&self, fingerprint: &str) -> Result<Option<VectorRecord>>;

    /// Returns `true` if a record was removed.
    async fn delete(&self, fingerprint: &str) -> Result<bool>;

    /// Top-`top_k` records by cosine similarity. `top_k <= 0` and an empty
    /// store both yield an empty result.
    async fn query(
        &self,
        vector: &[f32],
        top_k: i64,
        filter: Option<&RecordFilter>,
    ) -> Result<RetrievalResult>;

    async fn source_state(&self, source: &str) -> Result<Option<SourceState>>;

    /// All tracked documents, ordered by source path.
    async fn sources(&self) -> Result<Vec<SourceState>>;

    /// Upsert `records`, delete the source's records not among them, and
    /// store `state`, as one atomic write.
    async fn replace_source(
        &self,
        state: SourceState,
        records: Vec<VectorRecord>,
    ) -> Result<ReplaceSummary>;

    /// Delete a document's records and state. Returns the records removed.
    async fn remove_source(&self, source: &str) -> Result<usize>;

    async fn count(&self) -> Result<usize>;

    /// Remove every record, source, and the bound embedding space.
    async fn reset(&self) -> Result<()>;
}

/// Check `candidate` against an already bound space.
pub fn check_space(bound: &EmbeddingSpace, candidate: &EmbeddingSpace) -> Result<()> {
    if bound.model != candidate.model {
        return Err(RagError::IncompatibleModel {
            store_model: bound.model.clone(),
            query_model: candidate.model.clone(),
        });
    }
    if bound.dims != candidate.dims {
        return Err(RagError::DimensionMismatch {
            expected: bound.dims,
            actual: candidate.dims,
        });
    }
    Ok(())
}

/// Fail unless `vector` has the bound dimensionality.
pub fn check_dims(space: Option<&EmbeddingSpace>, vector: &[f32]) -> Result<()> {
    match space {
        Some(s) if s.dims != vector.len() => Err(RagError::DimensionMismatch {
            expected: s.dims,
            actual: vector.len(),
        }),
        _ => Ok(()),
    }
}

/// Order hits by descending score, then ascending fingerprint, and keep
/// the first `top_k`.
pub fn rank_hits(mut hits: Vec<RetrievedChunk>, top_k: i64) -> RetrievalResult {
    if top_k <= 0 {
        return Vec::new();
    }
    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.fingerprint.cmp(&b.fingerprint))
    });
    hits.truncate(top_k as usize);
    hits
}
