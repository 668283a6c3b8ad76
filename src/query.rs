//! Question answering entry point.
//!
//! [`QueryEngine`] ties retrieval, context assembly and answer generation
//! together. The CLI `query` command and the HTTP gateway both go through
//! [`QueryEngine::answer`], so they share defaults and error semantics.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use knowledge_rag_core::context::assemble_context;
use knowledge_rag_core::embedding::EmbeddingProvider;
use knowledge_rag_core::error::{RagError, Result};
use knowledge_rag_core::generate::{AnswerGenerator, GenerationRequest};
use knowledge_rag_core::models::RetrievalResult;
use knowledge_rag_core::retrieve::Retriever;
use knowledge_rag_core::store::{RecordFilter, VectorStore};

use crate::config::Config;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct QueryRequest {
    pub query: String,
    /// Completion model; defaults to `generation.model`.
    #[serde(default)]
    pub model: Option<String>,
    /// Number of chunks to retrieve; defaults to `retrieval.top_k`.
    #[serde(default)]
    pub top_k: Option<i64>,
    /// Return the retrieved chunks alongside the answer.
    #[serde(default, alias = "debug")]
    pub include_context: bool,
}

impl QueryRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Default::default()
        }
    }
}

/// A retrieved chunk with provenance and relevance.
#[derive(Debug, Clone, Serialize)]
pub struct ContextChunk {
    pub text: String,
    pub score: f32,
    pub source: String,
    pub heading_path: Vec<String>,
    pub chunk_index: usize,
    /// Whether the chunk fit into the generator's context.
    pub included: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryResponse {
    pub query: String,
    pub answer: String,
    pub model_used: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<Vec<ContextChunk>>,
}

pub struct QueryEngine {
    retriever: Retriever,
    generator: Arc<dyn AnswerGenerator>,
    default_model: String,
    default_top_k: i64,
    max_context_chars: usize,
}

impl QueryEngine {
    pub fn new(
        config: &Config,
        store: Arc<dyn VectorStore>,
        embedder: Arc<dyn EmbeddingProvider>,
        generator: Arc<dyn AnswerGenerator>,
    ) -> Self {
        Self {
            retriever: Retriever::new(store, embedder),
            generator,
            default_model: config.generation.model.clone(),
            default_top_k: config.retrieval.top_k,
            max_context_chars: config.retrieval.max_context_chars,
        }
    }

    pub fn default_model(&self) -> &str {
        &self.default_model
    }

    /// Retrieval only, without generation.
    pub async fn search(
        &self,
        query: &str,
        top_k: Option<i64>,
        filter: Option<&RecordFilter>,
    ) -> Result<RetrievalResult> {
        self.retriever
            .retrieve(query, top_k.unwrap_or(self.default_top_k), filter)
            .await
    }

    /// Retrieve, assemble context and generate an answer.
    pub async fn answer(&self, request: &QueryRequest) -> Result<QueryResponse> {
        let model = request
            .model
            .clone()
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| self.default_model.clone());

        let hits = self.search(&request.query, request.top_k, None).await?;
        let assembled = assemble_context(&hits, self.max_context_chars);
        tracing::debug!(
            hits = hits.len(),
            included = assembled.included.len(),
            context_chars = assembled.text.chars().count(),
            "context assembled"
        );

        let answer = self
            .generator
            .generate(&GenerationRequest {
                query: request.query.clone(),
                context: assembled.text,
                model: model.clone(),
            })
            .await
            .map_err(|e| match e {
                RagError::Generation(_) => e,
                other => RagError::Generation(other.to_string()),
            })?;

        let context = request.include_context.then(|| {
            hits.into_iter()
                .map(|hit| ContextChunk {
                    included: assembled.included.contains(&hit.fingerprint),
                    text: hit.text,
                    score: hit.score,
                    source: hit.metadata.source,
                    heading_path: hit.metadata.heading_path,
                    chunk_index: hit.metadata.chunk_index,
                })
                .collect()
        });

        Ok(QueryResponse {
            query: request.query.clone(),
            answer,
            model_used: model,
            context,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use knowledge_rag_core::chunk::{chunk_document, ChunkingParams};
    use knowledge_rag_core::embedding::HashEmbedder;
    use knowledge_rag_core::generate::{ExtractiveGenerator, NO_ANSWER};
    use knowledge_rag_core::models::{Document, VectorRecord};
    use knowledge_rag_core::store::memory::InMemoryStore;

    /// Records the last request and answers with a fixed string.
    #[derive(Default)]
    struct Recording {
        last: Mutex<Option<GenerationRequest>>,
    }

    #[async_trait]
    impl AnswerGenerator for Recording {
        fn name(&self) -> &str {
            "recording"
        }
        async fn generate(&self, request: &GenerationRequest) -> Result<String> {
            *self.last.lock().unwrap() = Some(request.clone());
            Ok("recorded".into())
        }
    }

    async fn populated_store(embedder: &HashEmbedder) -> Arc<dyn VectorStore> {
        let store = InMemoryStore::new();
        store.bind_embedding_space(&embedder.space()).await.unwrap();
        let doc = Document {
            source: "hr.md".into(),
            title: "Overtime".into(),
            text: "# Overtime\nPaid at 1.5x after 40 hours.".into(),
            modified_at: 0,
            extra: Default::default(),
        };
        for chunk in chunk_document(&doc, &ChunkingParams::default()).unwrap() {
            let v = embedder.embed_sync(&chunk.embedding_input());
            store.upsert(VectorRecord::from_chunk(chunk, v)).await.unwrap();
        }
        Arc::new(store)
    }

    fn config() -> Config {
        let mut config = Config::default();
        config.generation.model = "default-model".into();
        config
    }

    #[tokio::test]
    async fn test_generator_receives_context_and_literal_query() {
        let embedder = HashEmbedder::new(1024);
        let store = populated_store(&embedder).await;
        let generator = Arc::new(Recording::default());
        let engine = QueryEngine::new(&config(), store, Arc::new(embedder), generator.clone());

        let response = engine
            .answer(&QueryRequest {
                query: "overtime pay rate".into(),
                model: Some("gpt-4o-mini".into()),
                top_k: Some(3),
                include_context: true,
            })
            .await
            .unwrap();
        assert_eq!(response.answer, "recorded");
        assert_eq!(response.model_used, "gpt-4o-mini");
        let context = response.context.unwrap();
        assert_eq!(context[0].heading_path, vec!["Overtime"]);
        assert!(context[0].included);

        let seen = generator.last.lock().unwrap().clone().unwrap();
        assert_eq!(seen.query, "overtime pay rate");
        assert!(seen.context.contains("1.5x"));
        assert!(seen.context.starts_with("--- Document: hr.md | Section: Overtime ---"));
    }

    #[tokio::test]
    async fn test_empty_store_answers_without_error() {
        let engine = QueryEngine::new(
            &config(),
            Arc::new(InMemoryStore::new()),
            Arc::new(HashEmbedder::new(64)),
            Arc::new(ExtractiveGenerator),
        );
        let response = engine.answer(&QueryRequest::new("anything")).await.unwrap();
        assert_eq!(response.answer, NO_ANSWER);
        assert_eq!(response.model_used, "default-model");
        assert!(response.context.is_none());
    }
}
