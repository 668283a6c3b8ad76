//! In-memory [`VectorStore`] implementation for tests and embedded use.
//!
//! All state sits behind one `std::sync::RwLock`, so every write
//! (including [`replace_source`](VectorStore::replace_source)) is atomic
//! with respect to readers. Search is brute-force cosine similarity.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;

use crate::embedding::cosine_similarity;
use crate::error::{RagError, Result};
use crate::models::{EmbeddingSpace, RetrievalResult, RetrievedChunk, SourceState, VectorRecord};

use super::{
    check_dims, check_space, rank_hits, RecordFilter, ReplaceSummary, UpsertOutcome, VectorStore,
};

#[derive(Default)]
struct Inner {
    space: Option<EmbeddingSpace>,
    records: HashMap<String, VectorRecord>,
    sources: BTreeMap<String, SourceState>,
}

impl Inner {
    fn upsert(&mut self, record: VectorRecord) -> UpsertOutcome {
        match self.records.get(&record.fingerprint) {
            Some(existing) if *existing == record => UpsertOutcome::Unchanged,
            Some(_) => {
                self.records.insert(record.fingerprint.clone(), record);
                UpsertOutcome::Updated
            }
            None => {
                self.records.insert(record.fingerprint.clone(), record);
                UpsertOutcome::Inserted
            }
        }
    }
}

/// Vector store held entirely in process memory.
#[derive(Default)]
pub struct InMemoryStore {
    inner: RwLock<Inner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Inner>> {
        self.inner
            .read()
            .map_err(|_| RagError::StoreIo("in-memory store lock poisoned".into()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Inner>> {
        self.inner
            .write()
            .map_err(|_| RagError::StoreIo("in-memory store lock poisoned".into()))
    }
}

#[async_trait]
impl VectorStore for InMemoryStore {
    async fn embedding_space(&self) -> Result<Option<EmbeddingSpace>> {
        Ok(self.read()?.space.clone())
    }

    async fn bind_embedding_space(&self, space: &EmbeddingSpace) -> Result<()> {
        let mut inner = self.write()?;
        match &inner.space {
            Some(bound) => check_space(bound, space),
            None => {
                inner.space = Some(space.clone());
                Ok(())
            }
        }
    }

    async fn upsert(&self, record: VectorRecord) -> Result<UpsertOutcome> {
        let mut inner = self.write()?;
        check_dims(inner.space.as_ref(), &record.vector)?;
        Ok(inner.upsert(record))
    }

    async fn get(&self, fingerprint: &str) -> Result<Option<VectorRecord>> {
        Ok(self.read()?.records.get(fingerprint).cloned())
    }

    async fn delete(&self, fingerprint: &str) -> Result<bool> {
        Ok(self.write()?.records.remove(fingerprint).is_some())
    }

    async fn query(
        &self,
        vector: &[f32],
        top_k: i64,
        filter: Option<&RecordFilter>,
    ) -> Result<RetrievalResult> {
        if top_k <= 0 {
            return Ok(Vec::new());
        }
        let inner = self.read()?;
        check_dims(inner.space.as_ref(), vector)?;

        let mut hits = Vec::new();
        for record in inner.records.values() {
            if record.vector.len() != vector.len() {
                return Err(RagError::DimensionMismatch {
                    expected: record.vector.len(),
                    actual: vector.len(),
                });
            }
            if filter.is_some_and(|f| !f.matches(&record.metadata)) {
                continue;
            }
            let score = cosine_similarity(vector, &record.vector);
            if filter.is_some_and(|f| !f.accepts_score(score)) {
                continue;
            }
            hits.push(RetrievedChunk {
                fingerprint: record.fingerprint.clone(),
                score,
                text: record.text.clone(),
                metadata: record.metadata.clone(),
            });
        }
        Ok(rank_hits(hits, top_k))
    }

    async fn source_state(&self, source: &str) -> Result<Option<SourceState>> {
        Ok(self.read()?.sources.get(source).cloned())
    }

    async fn sources(&self) -> Result<Vec<SourceState>> {
        Ok(self.read()?.sources.values().cloned().collect())
    }

    async fn replace_source(
        &self,
        state: SourceState,
        records: Vec<VectorRecord>,
    ) -> Result<ReplaceSummary> {
        let mut inner = self.write()?;
        for record in &records {
            check_dims(inner.space.as_ref(), &record.vector)?;
        }

        let keep: HashSet<String> = records.iter().map(|r| r.fingerprint.clone()).collect();
        let mut summary = ReplaceSummary::default();
        for record in records {
            summary.record(inner.upsert(record));
        }

        let stale: Vec<String> = inner
            .records
            .values()
            .filter(|r| r.metadata.source == state.source && !keep.contains(&r.fingerprint))
            .map(|r| r.fingerprint.clone())
            .collect();
        for fp in stale {
            inner.records.remove(&fp);
            summary.removed += 1;
        }

        inner.sources.insert(state.source.clone(), state);
        Ok(summary)
    }

    async fn remove_source(&self, source: &str) -> Result<usize> {
        let mut inner = self.write()?;
        let before = inner.records.len();
        inner.records.retain(|_, r| r.metadata.source != source);
        inner.sources.remove(source);
        Ok(before - inner.records.len())
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.read()?.records.len())
    }

    async fn reset(&self) -> Result<()> {
        *self.write()? = Inner::default();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ChunkMetadata;

    fn space(dims: usize) -> EmbeddingSpace {
        EmbeddingSpace {
            model: "test".into(),
            dims,
        }
    }

    fn record(source: &str, fp: &str, text: &str, vector: Vec<f32>) -> VectorRecord {
        VectorRecord {
            fingerprint: fp.to_string(),
            vector,
            text: text.to_string(),
            metadata: ChunkMetadata {
                source: source.to_string(),
                title: String::new(),
                heading_path: vec!["Section".into()],
                chunk_index: 0,
                char_len: text.chars().count(),
                also_covers: Vec::new(),
                extra: Default::default(),
            },
        }
    }

    fn state(source: &str) -> SourceState {
        SourceState {
            source: source.to_string(),
            digest: Some("d".into()),
            title: String::new(),
            modified_at: 0,
            ingested_at: 0,
        }
    }

    #[tokio::test]
    async fn test_empty_store_query() {
        let store = InMemoryStore::new();
        let hits = store.query(&[1.0, 0.0], 5, None).await.unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn test_upsert_idempotent() {
        let store = InMemoryStore::new();
        let r = record("a.md", "fp1", "hello", vec![1.0, 0.0]);
        assert_eq!(
            store.upsert(r.clone()).await.unwrap(),
            UpsertOutcome::Inserted
        );
        for _ in 0..5 {
            assert_eq!(
                store.upsert(r.clone()).await.unwrap(),
                UpsertOutcome::Unchanged
            );
        }
        assert_eq!(store.count().await.unwrap(), 1);
        let hits = store.query(&[1.0, 0.0], 10, None).await.unwrap();
        assert_eq!(hits.len(), 1);

        let changed = record("a.md", "fp1", "hello again", vec![0.0, 1.0]);
        assert_eq!(store.upsert(changed).await.unwrap(), UpsertOutcome::Updated);
        assert_eq!(store.get("fp1").await.unwrap().unwrap().text, "hello again");
    }

    #[tokio::test]
    async fn test_query_orders_descending() {
        let store = InMemoryStore::new();
        store.bind_embedding_space(&space(2)).await.unwrap();
        store
            .upsert(record("a.md", "far", "x", vec![0.0, 1.0]))
            .await
            .unwrap();
        store
            .upsert(record("a.md", "near", "y", vec![1.0, 0.1]))
            .await
            .unwrap();
        store
            .upsert(record("a.md", "mid", "z", vec![1.0, 1.0]))
            .await
            .unwrap();
        let hits = store.query(&[1.0, 0.0], 10, None).await.unwrap();
        let fps: Vec<&str> = hits.iter().map(|h| h.fingerprint.as_str()).collect();
        assert_eq!(fps, vec!["near", "mid", "far"]);
        assert!(hits.windows(2).all(|w| w[0].score >= w[1].score));
        assert!(store.query(&[1.0, 0.0], 0, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_dimension_mismatch_rejected() {
        let store = InMemoryStore::new();
        store.bind_embedding_space(&space(2)).await.unwrap();
        let err = store
            .upsert(record("a.md", "fp", "t", vec![1.0, 0.0, 0.0]))
            .await
            .unwrap_err();
        assert!(matches!(err, RagError::DimensionMismatch { .. }));
        let err = store.query(&[1.0], 3, None).await.unwrap_err();
        assert!(matches!(err, RagError::DimensionMismatch { .. }));
    }

    #[tokio::test]
    async fn test_bind_different_model_rejected() {
        let store = InMemoryStore::new();
        store.bind_embedding_space(&space(2)).await.unwrap();
        store.bind_embedding_space(&space(2)).await.unwrap();
        let other = EmbeddingSpace {
            model: "other".into(),
            dims: 2,
        };
        assert!(matches!(
            store.bind_embedding_space(&other).await,
            Err(RagError::IncompatibleModel { .. })
        ));
    }

    #[tokio::test]
    async fn test_replace_source_removes_stale() {
        let store = InMemoryStore::new();
        store
            .replace_source(
                state("a.md"),
                vec![
                    record("a.md", "old", "old text", vec![1.0, 0.0]),
                    record("a.md", "keep", "kept", vec![0.0, 1.0]),
                ],
            )
            .await
            .unwrap();
        store
            .replace_source(state("b.md"), vec![record("b.md", "b1", "b", vec![1.0, 1.0])])
            .await
            .unwrap();

        let summary = store
            .replace_source(
                state("a.md"),
                vec![
                    record("a.md", "keep", "kept", vec![0.0, 1.0]),
                    record("a.md", "new", "new text", vec![1.0, 0.0]),
                ],
            )
            .await
            .unwrap();
        assert_eq!(summary.inserted, 1);
        assert_eq!(summary.unchanged, 1);
        assert_eq!(summary.removed, 1);
        assert!(store.get("old").await.unwrap().is_none());
        assert!(store.get("b1").await.unwrap().is_some());
        assert_eq!(store.count().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_filters() {
        let store = InMemoryStore::new();
        store
            .upsert(record("a.md", "a", "x", vec![1.0, 0.0]))
            .await
            .unwrap();
        store
            .upsert(record("b.md", "b", "y", vec![1.0, 0.0]))
            .await
            .unwrap();
        let filter = RecordFilter {
            sources: Some(vec!["b.md".into()]),
            ..Default::default()
        };
        let hits = store.query(&[1.0, 0.0], 5, Some(&filter)).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].fingerprint, "b");
    }

    #[tokio::test]
    async fn test_remove_source_and_reset() {
        let store = InMemoryStore::new();
        store.bind_embedding_space(&space(2)).await.unwrap();
        store
            .replace_source(state("a.md"), vec![record("a.md", "a", "x", vec![1.0, 0.0])])
            .await
            .unwrap();
        assert_eq!(store.remove_source("a.md").await.unwrap(), 1);
        assert!(store.sources().await.unwrap().is_empty());
        assert!(store.delete("a").await.is_ok_and(|removed| !removed));
        store.reset().await.unwrap();
        assert!(store.embedding_space().await.unwrap().is_none());
    }
}
