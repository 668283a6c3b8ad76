//! SQLite-backed [`VectorStore`] implementation.
//!
//! Vectors are stored as little-endian `f32` BLOBs next to chunk text and
//! JSON metadata. Similarity search is brute-force cosine in Rust over the
//! candidate rows. WAL mode keeps readers unblocked while an ingestion run
//! writes, and every per-document replacement runs in one transaction.
//!
//! Write transactions are serialized through a single writer lock. A
//! deferred SQLite transaction that reads before it writes cannot be
//! upgraded while another connection holds the write lock, and the busy
//! timeout does not cover that upgrade.

use std::collections::HashSet;

use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqliteConnection, SqlitePool, Transaction};
use std::path::Path;
use tokio::sync::{Mutex, MutexGuard};

use knowledge_rag_core::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use knowledge_rag_core::error::{RagError, Result};
use knowledge_rag_core::models::{
    ChunkMetadata, EmbeddingSpace, RetrievalResult, RetrievedChunk, SourceState, VectorRecord,
};
use knowledge_rag_core::store::{
    check_dims, check_space, rank_hits, RecordFilter, ReplaceSummary, UpsertOutcome, VectorStore,
};

use crate::db;
use crate::ingest::IngestReport;
use crate::migrate;

/// SQLite implementation of the [`VectorStore`] trait.
pub struct SqliteStore {
    pool: SqlitePool,
    writer: Mutex<()>,
}

/// Summary row from the `ingest_runs` table.
#[derive(Debug, Clone)]
pub struct RunRecord {
    pub id: String,
    pub started_at: i64,
    pub finished_at: i64,
    pub documents_seen: i64,
    pub documents_ingested: i64,
    pub documents_unchanged: i64,
    pub documents_removed: i64,
    pub chunks_written: i64,
    pub failed_items: i64,
}

fn store_err(e: impl std::fmt::Display) -> RagError {
    RagError::StoreIo(e.to_string())
}

impl SqliteStore {
    /// Connect to the database at `path` and ensure the schema exists.
    pub async fn open(path: &Path) -> anyhow::Result<Self> {
        let pool = db::connect(path).await?;
        migrate::run_migrations(&pool).await?;
        Ok(Self {
            pool,
            writer: Mutex::new(()),
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Persist the outcome of an ingestion run.
    pub async fn record_run(&self, report: &IngestReport) -> Result<()> {
        let failures = serde_json::to_string(&report.failures).map_err(store_err)?;
        let _guard = self.writer.lock().await;
        sqlx::query(
            r#"
            INSERT INTO ingest_runs (id, started_at, finished_at, documents_seen,
                                     documents_ingested, documents_unchanged, documents_removed,
                                     chunks_written, chunks_unchanged, failed_items, failures_json)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&report.run_id)
        .bind(report.started_at)
        .bind(report.finished_at)
        .bind(report.documents_seen as i64)
        .bind(report.documents_ingested as i64)
        .bind(report.documents_unchanged as i64)
        .bind(report.documents_removed as i64)
        .bind(report.chunks_written as i64)
        .bind(report.chunks_unchanged as i64)
        .bind(report.failures.len() as i64)
        .bind(failures)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    /// The most recent ingestion run, if any.
    pub async fn last_run(&self) -> Result<Option<RunRecord>> {
        let row = sqlx::query(
            r#"
            SELECT id, started_at, finished_at, documents_seen, documents_ingested,
                   documents_unchanged, documents_removed, chunks_written, failed_items
            FROM ingest_runs
            ORDER BY started_at DESC, finished_at DESC
            LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?;

        row.map(|r| {
            Ok::<_, RagError>(RunRecord {
                id: r.try_get("id").map_err(store_err)?,
                started_at: r.try_get("started_at").map_err(store_err)?,
                finished_at: r.try_get("finished_at").map_err(store_err)?,
                documents_seen: r.try_get("documents_seen").map_err(store_err)?,
                documents_ingested: r.try_get("documents_ingested").map_err(store_err)?,
                documents_unchanged: r.try_get("documents_unchanged").map_err(store_err)?,
                documents_removed: r.try_get("documents_removed").map_err(store_err)?,
                chunks_written: r.try_get("chunks_written").map_err(store_err)?,
                failed_items: r.try_get("failed_items").map_err(store_err)?,
            })
        })
        .transpose()
    }

    /// Begin a transaction while holding the writer lock. Bind the guard
    /// before the transaction so the transaction is dropped first.
    async fn begin_write(&self) -> Result<(MutexGuard<'_, ()>, Transaction<'static, Sqlite>)> {
        let guard = self.writer.lock().await;
        let tx = self.pool.begin().await.map_err(store_err)?;
        Ok((guard, tx))
    }

    async fn bound_space(conn: &mut SqliteConnection) -> Result<Option<EmbeddingSpace>> {
        let row = sqlx::query("SELECT model, dims FROM store_meta WHERE id = 1")
            .fetch_optional(&mut *conn)
            .await
            .map_err(store_err)?;
        row.map(|r| {
            let dims: i64 = r.try_get("dims").map_err(store_err)?;
            Ok::<_, RagError>(EmbeddingSpace {
                model: r.try_get("model").map_err(store_err)?,
                dims: dims as usize,
            })
        })
        .transpose()
    }
}

/// Insert or update one record on `conn`, reporting what changed.
async fn upsert_record(conn: &mut SqliteConnection, record: &VectorRecord) -> Result<UpsertOutcome> {
    let metadata_json = serde_json::to_string(&record.metadata).map_err(store_err)?;
    let blob = vec_to_blob(&record.vector);

    let existing = sqlx::query("SELECT text, metadata_json, embedding FROM records WHERE fingerprint = ?")
        .bind(&record.fingerprint)
        .fetch_optional(&mut *conn)
        .await
        .map_err(store_err)?;

    let outcome = match existing {
        Some(row) => {
            let text: String = row.try_get("text").map_err(store_err)?;
            let meta: String = row.try_get("metadata_json").map_err(store_err)?;
            let emb: Vec<u8> = row.try_get("embedding").map_err(store_err)?;
            if text == record.text && meta == metadata_json && emb == blob {
                return Ok(UpsertOutcome::Unchanged);
            }
            UpsertOutcome::Updated
        }
        None => UpsertOutcome::Inserted,
    };

    sqlx::query(
        r#"
        INSERT INTO records (fingerprint, source, chunk_index, text, metadata_json, embedding, dims, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(fingerprint) DO UPDATE SET
            source = excluded.source,
            chunk_index = excluded.chunk_index,
            text = excluded.text,
            metadata_json = excluded.metadata_json,
            embedding = excluded.embedding,
            dims = excluded.dims,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(&record.fingerprint)
    .bind(&record.metadata.source)
    .bind(record.metadata.chunk_index as i64)
    .bind(&record.text)
    .bind(&metadata_json)
    .bind(&blob)
    .bind(record.vector.len() as i64)
    .bind(chrono::Utc::now().timestamp())
    .execute(&mut *conn)
    .await
    .map_err(store_err)?;

    Ok(outcome)
}

fn row_to_record(row: &SqliteRow) -> Result<VectorRecord> {
    let metadata_json: String = row.try_get("metadata_json").map_err(store_err)?;
    let metadata: ChunkMetadata = serde_json::from_str(&metadata_json).map_err(store_err)?;
    let blob: Vec<u8> = row.try_get("embedding").map_err(store_err)?;
    Ok(VectorRecord {
        fingerprint: row.try_get("fingerprint").map_err(store_err)?,
        vector: blob_to_vec(&blob),
        text: row.try_get("text").map_err(store_err)?,
        metadata,
    })
}

fn row_to_state(row: &SqliteRow) -> Result<SourceState> {
    Ok(SourceState {
        source: row.try_get("source").map_err(store_err)?,
        digest: row.try_get("digest").map_err(store_err)?,
        title: row.try_get("title").map_err(store_err)?,
        modified_at: row.try_get("modified_at").map_err(store_err)?,
        ingested_at: row.try_get("ingested_at").map_err(store_err)?,
    })
}

#[async_trait]
impl VectorStore for SqliteStore {
    async fn embedding_space(&self) -> Result<Option<EmbeddingSpace>> {
        let mut conn = self.pool.acquire().await.map_err(store_err)?;
        Self::bound_space(&mut conn).await
    }

    async fn bind_embedding_space(&self, space: &EmbeddingSpace) -> Result<()> {
        let (_guard, mut tx) = self.begin_write().await?;
        if let Some(bound) = Self::bound_space(&mut tx).await? {
            return check_space(&bound, space);
        }
        sqlx::query("INSERT INTO store_meta (id, model, dims, created_at) VALUES (1, ?, ?, ?)")
            .bind(&space.model)
            .bind(space.dims as i64)
            .bind(chrono::Utc::now().timestamp())
            .execute(&mut *tx)
            .await
            .map_err(store_err)?;
        tx.commit().await.map_err(store_err)?;
        Ok(())
    }

    async fn upsert(&self, record: VectorRecord) -> Result<UpsertOutcome> {
        let (_guard, mut tx) = self.begin_write().await?;
        let space = Self::bound_space(&mut tx).await?;
        check_dims(space.as_ref(), &record.vector)?;
        let outcome = upsert_record(&mut tx, &record).await?;
        tx.commit().await.map_err(store_err)?;
        Ok(outcome)
    }

    async fn get(&self, fingerprint: &str) -> Result<Option<VectorRecord>> {
        let row = sqlx::query(
            "SELECT fingerprint, text, metadata_json, embedding FROM records WHERE fingerprint = ?",
        )
        .bind(fingerprint)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?;
        row.as_ref().map(row_to_record).transpose()
    }

    async fn delete(&self, fingerprint: &str) -> Result<bool> {
        let _guard = self.writer.lock().await;
        let result = sqlx::query("DELETE FROM records WHERE fingerprint = ?")
            .bind(fingerprint)
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(result.rows_affected() > 0)
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
        let space = self.embedding_space().await?;
        check_dims(space.as_ref(), vector)?;

        let rows =
            sqlx::query("SELECT fingerprint, text, metadata_json, embedding FROM records")
                .fetch_all(&self.pool)
                .await
                .map_err(store_err)?;

        let mut hits = Vec::with_capacity(rows.len());
        for row in &rows {
            let record = row_to_record(row)?;
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
                fingerprint: record.fingerprint,
                score,
                text: record.text,
                metadata: record.metadata,
            });
        }
        Ok(rank_hits(hits, top_k))
    }

    async fn source_state(&self, source: &str) -> Result<Option<SourceState>> {
        let row = sqlx::query(
            "SELECT source, digest, title, modified_at, ingested_at FROM sources WHERE source = ?",
        )
        .bind(source)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?;
        row.as_ref().map(row_to_state).transpose()
    }

    async fn sources(&self) -> Result<Vec<SourceState>> {
        let rows = sqlx::query(
            "SELECT source, digest, title, modified_at, ingested_at FROM sources ORDER BY source",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;
        rows.iter().map(row_to_state).collect()
    }

    async fn replace_source(
        &self,
        state: SourceState,
        records: Vec<VectorRecord>,
    ) -> Result<ReplaceSummary> {
        let (_guard, mut tx) = self.begin_write().await?;
        let space = Self::bound_space(&mut tx).await?;
        for record in &records {
            check_dims(space.as_ref(), &record.vector)?;
        }

        let mut summary = ReplaceSummary::default();
        for record in &records {
            summary.record(upsert_record(&mut tx, record).await?);
        }

        let keep: HashSet<&str> = records.iter().map(|r| r.fingerprint.as_str()).collect();
        let existing: Vec<String> =
            sqlx::query_scalar("SELECT fingerprint FROM records WHERE source = ?")
                .bind(&state.source)
                .fetch_all(&mut *tx)
                .await
                .map_err(store_err)?;
        for fp in existing.iter().filter(|fp| !keep.contains(fp.as_str())) {
            sqlx::query("DELETE FROM records WHERE fingerprint = ?")
                .bind(fp)
                .execute(&mut *tx)
                .await
                .map_err(store_err)?;
            summary.removed += 1;
        }

        sqlx::query(
            r#"
            INSERT INTO sources (source, digest, title, modified_at, ingested_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(source) DO UPDATE SET
                digest = excluded.digest,
                title = excluded.title,
                modified_at = excluded.modified_at,
                ingested_at = excluded.ingested_at
            "#,
        )
        .bind(&state.source)
        .bind(&state.digest)
        .bind(&state.title)
        .bind(state.modified_at)
        .bind(state.ingested_at)
        .execute(&mut *tx)
        .await
        .map_err(store_err)?;

        tx.commit().await.map_err(store_err)?;
        Ok(summary)
    }

    async fn remove_source(&self, source: &str) -> Result<usize> {
        let (_guard, mut tx) = self.begin_write().await?;
        let removed = sqlx::query("DELETE FROM records WHERE source = ?")
            .bind(source)
            .execute(&mut *tx)
            .await
            .map_err(store_err)?
            .rows_affected();
        sqlx::query("DELETE FROM sources WHERE source = ?")
            .bind(source)
            .execute(&mut *tx)
            .await
            .map_err(store_err)?;
        tx.commit().await.map_err(store_err)?;
        Ok(removed as usize)
    }

    async fn count(&self) -> Result<usize> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM records")
            .fetch_one(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(n as usize)
    }

    async fn reset(&self) -> Result<()> {
        let (_guard, mut tx) = self.begin_write().await?;
        for table in ["records", "sources", "store_meta"] {
            sqlx::query(&format!("DELETE FROM {}", table))
                .execute(&mut *tx)
                .await
                .map_err(store_err)?;
        }
        tx.commit().await.map_err(store_err)?;
        Ok(())
    }
}
