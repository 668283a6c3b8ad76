//! Ingestion pipeline orchestration.
//!
//! Coordinates the full flow: discovery → normalization → chunking →
//! embedding → storage. Stages are connected by a bounded channel:
//!
//! ```text
//! spawn_blocking(loader) ──mpsc──▶ buffer_unordered(workers) ──▶ report
//!                                   │ digest check
//!                                   │ chunk + dedupe
//!                                   │ reuse stored vectors
//!                                   │ embed batches (semaphore)
//!                                   └ replace_source (one transaction)
//! ```
//!
//! Unchanged documents (same digest) are skipped unless `full` is set.
//! Per-document failures are collected in the [`IngestReport`]; store,
//! configuration and dimension errors abort the run.

use std::collections::HashSet;
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::sync::{mpsc, Semaphore};
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;

use knowledge_rag_core::chunk::{chunk_document, ChunkingParams};
use knowledge_rag_core::embedding::EmbeddingProvider;
use knowledge_rag_core::error::{RagError, Result};
use knowledge_rag_core::models::{Chunk, Document, SourceState, VectorRecord};
use knowledge_rag_core::store::{ReplaceSummary, VectorStore};

use crate::config::Config;
use crate::embedding::{embed_with_retry, RetryPolicy};
use crate::loader::DocumentLoader;

#[derive(Debug, Clone, Copy, Default)]
pub struct IngestOptions {
    /// Re-process every document, ignoring stored digests.
    pub full: bool,
    /// Clear the store before ingesting.
    pub rebuild: bool,
    /// Count documents and chunks without embedding or writing.
    pub dry_run: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStage {
    Load,
    Chunk,
    Embed,
}

/// A document or chunk that could not be ingested.
#[derive(Debug, Clone, Serialize)]
pub struct FailedItem {
    pub source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub heading_path: Vec<String>,
    pub stage: FailureStage,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestReport {
    pub run_id: String,
    pub started_at: i64,
    pub finished_at: i64,
    pub dry_run: bool,
    pub documents_seen: usize,
    pub documents_ingested: usize,
    pub documents_unchanged: usize,
    pub documents_removed: usize,
    pub chunks_written: usize,
    pub chunks_unchanged: usize,
    pub chunks_removed: usize,
    /// Chunk count of all discovered documents (dry runs only).
    pub estimated_chunks: usize,
    pub failures: Vec<FailedItem>,
}

impl IngestReport {
    /// True when at least one item failed.
    pub fn is_partial(&self) -> bool {
        !self.failures.is_empty()
    }
}

enum DocOutcome {
    Unchanged {
        source: String,
    },
    Ingested {
        source: String,
        summary: ReplaceSummary,
        failures: Vec<FailedItem>,
    },
    /// Kept as-is in the store; the failure is reported.
    Skipped {
        source: String,
        failure: FailedItem,
    },
}

impl DocOutcome {
    fn source(&self) -> &str {
        match self {
            DocOutcome::Unchanged { source }
            | DocOutcome::Ingested { source, .. }
            | DocOutcome::Skipped { source, .. } => source,
        }
    }
}

struct Worker {
    store: Arc<dyn VectorStore>,
    embedder: Arc<dyn EmbeddingProvider>,
    params: ChunkingParams,
    permits: Arc<Semaphore>,
    retry: RetryPolicy,
    batch_size: usize,
    concurrency: usize,
    full: bool,
}

/// Ingest every document under `config.documents.root` into `store`.
pub async fn ingest_directory(
    config: &Config,
    store: Arc<dyn VectorStore>,
    embedder: Arc<dyn EmbeddingProvider>,
    options: IngestOptions,
) -> Result<IngestReport> {
    if options.dry_run {
        return estimate(config);
    }

    let params = config.chunking_params();
    params.validate()?;
    let loader = DocumentLoader::from_config(&config.documents)?;

    let mut report = new_report(false);
    tracing::info!(
        run_id = %report.run_id,
        root = %loader.root().display(),
        full = options.full,
        rebuild = options.rebuild,
        "ingestion started"
    );

    if options.rebuild {
        tracing::info!("resetting store");
        store.reset().await?;
    }
    store.bind_embedding_space(&embedder.space()).await?;

    let workers = config.ingest.workers.max(1);
    let (tx, rx) = mpsc::channel::<Result<Document>>(workers * 2);
    let discover = tokio::task::spawn_blocking(move || {
        for item in loader.documents() {
            if tx.blocking_send(item).is_err() {
                break;
            }
        }
    });

    let worker = Arc::new(Worker {
        store: Arc::clone(&store),
        embedder,
        params,
        permits: Arc::new(Semaphore::new(config.embedding.concurrency.max(1))),
        retry: RetryPolicy::from_config(&config.embedding),
        batch_size: config.embedding.batch_size.max(1),
        concurrency: config.embedding.concurrency.max(1),
        full: options.full,
    });

    let mut outcomes = ReceiverStream::new(rx)
        .map(|item| {
            let worker = Arc::clone(&worker);
            async move { worker.process(item).await }
        })
        .buffer_unordered(workers);

    let mut seen: HashSet<String> = HashSet::new();
    // Paths the walk could not read; records below them are not pruned.
    let mut unreadable: Vec<String> = Vec::new();
    while let Some(outcome) = outcomes.next().await {
        let outcome = match outcome {
            Ok(o) => o,
            Err(e) => {
                tracing::error!(run_id = %report.run_id, error = %e, "ingestion aborted");
                return Err(e);
            }
        };
        report.documents_seen += 1;
        seen.insert(outcome.source().to_string());
        match outcome {
            DocOutcome::Unchanged { .. } => report.documents_unchanged += 1,
            DocOutcome::Ingested {
                summary, failures, ..
            } => {
                report.documents_ingested += 1;
                report.chunks_written += summary.written();
                report.chunks_unchanged += summary.unchanged;
                report.chunks_removed += summary.removed;
                report.failures.extend(failures);
            }
            DocOutcome::Skipped { failure, .. } => {
                if failure.stage == FailureStage::Load {
                    unreadable.push(failure.source.clone());
                }
                report.failures.push(failure);
            }
        }
    }
    drop(outcomes);
    discover
        .await
        .map_err(|e| RagError::Load {
            path: String::new(),
            reason: format!("discovery task failed: {}", e),
        })?;

    if config.ingest.prune_missing {
        for state in store.sources().await? {
            if seen.contains(&state.source) {
                continue;
            }
            if is_below_any(&state.source, &unreadable) {
                tracing::warn!(source = %state.source, "not pruning document under an unreadable path");
                continue;
            }
            let removed = store.remove_source(&state.source).await?;
            tracing::info!(source = %state.source, chunks = removed, "pruned missing document");
            report.documents_removed += 1;
            report.chunks_removed += removed;
        }
    }

    report.finished_at = chrono::Utc::now().timestamp();
    tracing::info!(
        run_id = %report.run_id,
        seen = report.documents_seen,
        ingested = report.documents_ingested,
        unchanged = report.documents_unchanged,
        removed = report.documents_removed,
        chunks_written = report.chunks_written,
        failed = report.failures.len(),
        "ingestion finished"
    );
    Ok(report)
}

/// Count documents and the chunks they would produce, without embedding
/// or touching a store.
pub fn estimate(config: &Config) -> Result<IngestReport> {
    let params = config.chunking_params();
    params.validate()?;
    let loader = DocumentLoader::from_config(&config.documents)?;

    let mut report = new_report(true);
    for item in loader.documents() {
        match item {
            Ok(doc) => {
                report.documents_seen += 1;
                match chunk_document(&doc, &params) {
                    Ok(chunks) => report.estimated_chunks += dedupe(chunks, &doc.source).len(),
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(e) => report.failures.push(chunking_failure(&doc.source, &e)),
                }
            }
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => report.failures.push(load_failure(e)),
        }
    }
    report.finished_at = chrono::Utc::now().timestamp();
    Ok(report)
}

fn new_report(dry_run: bool) -> IngestReport {
    IngestReport {
        run_id: Uuid::new_v4().to_string(),
        started_at: chrono::Utc::now().timestamp(),
        dry_run,
        ..Default::default()
    }
}

fn load_failure(e: RagError) -> FailedItem {
    let source = match &e {
        RagError::Load { path, .. } | RagError::Chunking { path, .. } => path.clone(),
        _ => String::new(),
    };
    tracing::warn!(source = %source, error = %e, "skipping document");
    FailedItem {
        source,
        fingerprint: None,
        heading_path: Vec::new(),
        stage: FailureStage::Load,
        error: e.to_string(),
    }
}

/// True when `source` equals or lies under one of `paths`. An empty path
/// stands for the whole documents root.
fn is_below_any(source: &str, paths: &[String]) -> bool {
    paths.iter().any(|p| {
        p.is_empty()
            || source == p
            || source
                .strip_prefix(p.as_str())
                .is_some_and(|rest| rest.starts_with('/'))
    })
}

fn chunking_failure(source: &str, e: &RagError) -> FailedItem {
    tracing::warn!(source = %source, error = %e, "skipping document");
    FailedItem {
        source: source.to_string(),
        fingerprint: None,
        heading_path: Vec::new(),
        stage: FailureStage::Chunk,
        error: e.to_string(),
    }
}

/// Drop chunks whose fingerprint repeats an earlier one (an identical
/// section under the same headings) and renumber the rest from 0.
fn dedupe(chunks: Vec<Chunk>, source: &str) -> Vec<Chunk> {
    let mut unique = HashSet::new();
    let mut kept: Vec<Chunk> = Vec::with_capacity(chunks.len());
    for chunk in chunks {
        if unique.insert(chunk.fingerprint.clone()) {
            kept.push(chunk);
        } else {
            tracing::debug!(
                source = %source,
                fingerprint = %chunk.fingerprint,
                chunk_index = chunk.metadata.chunk_index,
                "dropping duplicate chunk"
            );
        }
    }
    for (i, chunk) in kept.iter_mut().enumerate() {
        chunk.metadata.chunk_index = i;
    }
    kept
}

impl Worker {
    async fn process(&self, item: Result<Document>) -> Result<DocOutcome> {
        let doc = match item {
            Ok(doc) => doc,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                let failure = load_failure(e);
                return Ok(DocOutcome::Skipped {
                    source: failure.source.clone(),
                    failure,
                });
            }
        };

        let digest = self.digest(&doc);
        if !self.full {
            if let Some(state) = self.store.source_state(&doc.source).await? {
                if state.digest.as_deref() == Some(digest.as_str()) {
                    tracing::debug!(source = %doc.source, "unchanged, skipping");
                    return Ok(DocOutcome::Unchanged { source: doc.source });
                }
            }
        }

        let chunks = match chunk_document(&doc, &self.params) {
            Ok(chunks) => chunks,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                return Ok(DocOutcome::Skipped {
                    failure: chunking_failure(&doc.source, &e),
                    source: doc.source,
                });
            }
        };
        let chunks = dedupe(chunks, &doc.source);

        let (records, failures) = self.embed_chunks(chunks).await?;

        let state = SourceState {
            source: doc.source.clone(),
            digest: failures.is_empty().then_some(digest),
            title: doc.title.clone(),
            modified_at: doc.modified_at,
            ingested_at: chrono::Utc::now().timestamp(),
        };
        let summary = self.store.replace_source(state, records).await?;
        tracing::info!(
            source = %doc.source,
            written = summary.written(),
            unchanged = summary.unchanged,
            removed = summary.removed,
            failed = failures.len(),
            "document ingested"
        );
        Ok(DocOutcome::Ingested {
            source: doc.source,
            summary,
            failures,
        })
    }

    /// Digest over everything that shapes a document's records.
    fn digest(&self, doc: &Document) -> String {
        let space = self.embedder.space();
        let mut hasher = Sha256::new();
        hasher.update(doc.title.as_bytes());
        hasher.update([0]);
        hasher.update(doc.text.as_bytes());
        hasher.update([0]);
        hasher.update(space.model.as_bytes());
        hasher.update((space.dims as u64).to_le_bytes());
        hasher.update((self.params.max_chars as u64).to_le_bytes());
        hasher.update((self.params.overlap_chars as u64).to_le_bytes());
        hasher.update((self.params.min_chars as u64).to_le_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// Vectors for `chunks`, reusing stored ones where the fingerprint
    /// already exists.
    async fn embed_chunks(&self, chunks: Vec<Chunk>) -> Result<(Vec<VectorRecord>, Vec<FailedItem>)> {
        let dims = self.embedder.dims();
        let mut records = Vec::with_capacity(chunks.len());
        let mut pending = Vec::new();
        for chunk in chunks {
            match self.store.get(&chunk.fingerprint).await? {
                Some(existing) if existing.vector.len() == dims => {
                    records.push(VectorRecord::from_chunk(chunk, existing.vector));
                }
                _ => pending.push(chunk),
            }
        }

        let batches: Vec<Vec<Chunk>> = pending
            .chunks(self.batch_size)
            .map(|b| b.to_vec())
            .collect();
        let results: Vec<Result<(Vec<VectorRecord>, Vec<FailedItem>)>> = stream::iter(batches)
            .map(|batch| self.embed_batch(batch))
            .buffered(self.concurrency)
            .collect()
            .await;

        let mut failures = Vec::new();
        for result in results {
            let (r, f) = result?;
            records.extend(r);
            failures.extend(f);
        }
        records.sort_by_key(|r| r.metadata.chunk_index);
        Ok((records, failures))
    }

    /// Embed one batch; on a non-fatal failure fall back to one chunk at a
    /// time so only the offending chunks are dropped.
    async fn embed_batch(&self, batch: Vec<Chunk>) -> Result<(Vec<VectorRecord>, Vec<FailedItem>)> {
        let inputs: Vec<String> = batch.iter().map(Chunk::embedding_input).collect();
        match self.embed(&inputs).await {
            Ok(vectors) => {
                let records = batch
                    .into_iter()
                    .zip(vectors)
                    .map(|(c, v)| VectorRecord::from_chunk(c, v))
                    .collect();
                return Ok((records, Vec::new()));
            }
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) if batch.len() == 1 => {
                let failure = self.chunk_failure(&batch[0], &e);
                return Ok((Vec::new(), vec![failure]));
            }
            Err(e) => {
                tracing::warn!(size = batch.len(), error = %e, "batch failed, embedding chunks individually");
            }
        }

        let mut records = Vec::new();
        let mut failures = Vec::new();
        for (chunk, input) in batch.into_iter().zip(inputs) {
            match self.embed(std::slice::from_ref(&input)).await {
                Ok(mut vectors) => match vectors.pop() {
                    Some(v) => records.push(VectorRecord::from_chunk(chunk, v)),
                    None => failures.push(
                        self.chunk_failure(&chunk, &RagError::permanent("empty embedding response")),
                    ),
                },
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => failures.push(self.chunk_failure(&chunk, &e)),
            }
        }
        Ok((records, failures))
    }

    async fn embed(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| RagError::permanent("embedding limiter closed"))?;
        embed_with_retry(self.embedder.as_ref(), inputs, self.retry).await
    }

    fn chunk_failure(&self, chunk: &Chunk, e: &RagError) -> FailedItem {
        tracing::warn!(
            source = %chunk.metadata.source,
            fingerprint = %chunk.fingerprint,
            error = %e,
            "chunk embedding failed"
        );
        FailedItem {
            source: chunk.metadata.source.clone(),
            fingerprint: Some(chunk.fingerprint.clone()),
            heading_path: chunk.metadata.heading_path.clone(),
            stage: FailureStage::Embed,
            error: e.to_string(),
        }
    }
}
