//! Query-time retrieval.
//!
//! A [`Retriever`] is bound to one embedding provider and one store. It
//! embeds the query with the same provider used at ingestion time, refuses
//! to search a store built with a different embedding space, and returns
//! chunks in descending similarity order.

use std::sync::Arc;

use tracing::debug;

use crate::embedding::EmbeddingProvider;
use crate::error::{RagError, Result};
use crate::models::RetrievalResult;
use crate::store::{check_space, RecordFilter, VectorStore};

pub struct Retriever {
    store: Arc<dyn VectorStore>,
    embedder: Arc<dyn EmbeddingProvider>,
}

impl Retriever {
    pub fn new(store: Arc<dyn VectorStore>, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        Self { store, embedder }
    }

    /// Return the top-`top_k` chunks for `query`.
    ///
    /// A blank query, `top_k <= 0`, or an empty store yields an empty
    /// result. No relevance threshold is applied unless `filter` sets one.
    ///
    /// # Errors
    ///
    /// - [`RagError::IncompatibleModel`] / [`RagError::DimensionMismatch`]
    ///   if the store was indexed with a different embedding space.
    /// - [`RagError::Retrieval`] if the store cannot be read.
    /// - Provider errors from embedding the query.
    pub async fn retrieve(
        &self,
        query: &str,
        top_k: i64,
        filter: Option<&RecordFilter>,
    ) -> Result<RetrievalResult> {
        if query.trim().is_empty() || top_k <= 0 {
            return Ok(Vec::new());
        }

        let bound = self.store.embedding_space().await.map_err(unavailable)?;
        if let Some(bound) = &bound {
            check_space(bound, &self.embedder.space())?;
        }
        if self.store.count().await.map_err(unavailable)? == 0 {
            debug!("store is empty; skipping query embedding");
            return Ok(Vec::new());
        }

        let vector = self.embedder.embed(query).await?;
        let hits = self
            .store
            .query(&vector, top_k, filter)
            .await
            .map_err(unavailable)?;
        debug!(top_k, hits = hits.len(), "retrieved chunks");
        Ok(hits)
    }
}

/// Store read failures at query time surface as retrieval errors; typed
/// dimension errors pass through unchanged.
fn unavailable(err: RagError) -> RagError {
    match err {
        RagError::StoreIo(msg) => RagError::Retrieval(msg),
        RagError::Io(e) => RagError::Retrieval(e.to_string()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{chunk_document, ChunkingParams};
    use crate::embedding::HashEmbedder;
    use crate::models::{Document, EmbeddingSpace, SourceState, VectorRecord};
    use crate::store::memory::InMemoryStore;
    use async_trait::async_trait;

    async fn ingest(store: &InMemoryStore, embedder: &HashEmbedder, source: &str, text: &str) {
        let doc = Document {
            source: source.into(),
            title: source.into(),
            text: text.into(),
            modified_at: 0,
            extra: Default::default(),
        };
        store.bind_embedding_space(&embedder.space()).await.unwrap();
        let chunks = chunk_document(&doc, &ChunkingParams::default()).unwrap();
        let records = chunks
            .into_iter()
            .map(|c| {
                let v = embedder.embed_sync(&c.embedding_input());
                VectorRecord::from_chunk(c, v)
            })
            .collect();
        store
            .replace_source(
                SourceState {
                    source: source.into(),
                    digest: None,
                    title: source.into(),
                    modified_at: 0,
                    ingested_at: 0,
                },
                records,
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_overtime_scenario_top_hit() {
        let store = Arc::new(InMemoryStore::new());
        let embedder = Arc::new(HashEmbedder::new(1024));
        ingest(&store, &embedder, "hr/overtime.md", "# Overtime\nPaid at 1.5x after 40 hours.").await;
        ingest(&store, &embedder, "it/vpn.md", "# VPN\nConnect through the corporate client.").await;

        let retriever = Retriever::new(store.clone(), embedder.clone());
        let hits = retriever.retrieve("overtime pay rate", 3, None).await.unwrap();
        assert!(!hits.is_empty());
        assert_eq!(hits[0].metadata.heading_path, vec!["Overtime"]);
        assert!(hits[0].text.contains("1.5x"));
        assert!(hits.windows(2).all(|w| w[0].score >= w[1].score));
    }

    #[tokio::test]
    async fn test_empty_store_returns_empty() {
        let retriever = Retriever::new(
            Arc::new(InMemoryStore::new()),
            Arc::new(HashEmbedder::new(32)),
        );
        assert!(retriever.retrieve("anything", 5, None).await.unwrap().is_empty());
        assert!(retriever.retrieve("   ", 5, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_model_mismatch_is_error() {
        let store = Arc::new(InMemoryStore::new());
        let embedder = HashEmbedder::new(32);
        ingest(&store, &embedder, "a.md", "# A\nalpha").await;

        let other = Retriever::new(store.clone(), Arc::new(HashEmbedder::new(64)));
        let err = other.retrieve("alpha", 5, None).await.unwrap_err();
        assert!(matches!(err, RagError::IncompatibleModel { .. }));
    }

    struct BrokenStore;

    #[async_trait]
    impl VectorStore for BrokenStore {
        async fn embedding_space(&self) -> Result<Option<EmbeddingSpace>> {
            Err(RagError::StoreIo("database is locked".into()))
        }
        async fn bind_embedding_space(&self, _: &EmbeddingSpace) -> Result<()> {
            unimplemented!()
        }
        async fn upsert(&self, _: VectorRecord) -> Result<crate::store::UpsertOutcome> {
            unimplemented!()
        }
        async fn get(&self, _: &str) -> Result<Option<VectorRecord>> {
            unimplemented!()
        }
        async fn delete(&self, _: &str) -> Result<bool> {
            unimplemented!()
        }
        async fn query(
            &self,
            _: &[f32],
            _: i64,
            _: Option<&RecordFilter>,
        ) -> Result<RetrievalResult> {
            unimplemented!()
        }
        async fn source_state(&self, _: &str) -> Result<Option<SourceState>> {
            unimplemented!()
        }
        async fn sources(&self) -> Result<Vec<SourceState>> {
            unimplemented!()
        }
        async fn replace_source(
            &self,
            _: SourceState,
            _: Vec<VectorRecord>,
        ) -> Result<crate::store::ReplaceSummary> {
            unimplemented!()
        }
        async fn remove_source(&self, _: &str) -> Result<usize> {
            unimplemented!()
        }
        async fn count(&self) -> Result<usize> {
            unimplemented!()
        }
        async fn reset(&self) -> Result<()> {
            unimplemented!()
        }
    }

    #[tokio::test]
    async fn test_store_failure_is_retrieval_error() {
        let retriever = Retriever::new(Arc::new(BrokenStore), Arc::new(HashEmbedder::new(8)));
        let err = retriever.retrieve("q", 5, None).await.unwrap_err();
        assert!(matches!(err, RagError::Retrieval(_)));
    }
}
