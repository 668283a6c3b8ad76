//! Store statistics.
//!
//! A quick summary of what's indexed: record and document counts, the bound
//! embedding space, per-document chunk counts and the last ingestion run.
//! Used by `kb stats`.

use anyhow::Result;
use sqlx::Row;

use knowledge_rag_core::store::VectorStore;

use crate::config::Config;
use crate::sqlite_store::SqliteStore;

struct SourceStats {
    source: String,
    chunk_count: i64,
    complete: bool,
    ingested_at: i64,
}

/// Print a summary of the store at `config.store.path`.
pub async fn run_stats(config: &Config, store: &SqliteStore) -> Result<()> {
    let records = store.count().await?;
    let space = store.embedding_space().await?;
    let db_size = std::fs::metadata(&config.store.path)
        .map(|m| m.len())
        .unwrap_or(0);

    let rows = sqlx::query(
        r#"
        SELECT s.source, s.digest, s.ingested_at, COUNT(r.fingerprint) AS chunk_count
        FROM sources s
        LEFT JOIN records r ON r.source = s.source
        GROUP BY s.source
        ORDER BY chunk_count DESC, s.source
        "#,
    )
    .fetch_all(store.pool())
    .await?;

    let mut sources = Vec::with_capacity(rows.len());
    for row in &rows {
        let digest: Option<String> = row.try_get("digest")?;
        sources.push(SourceStats {
            source: row.try_get("source")?,
            chunk_count: row.try_get("chunk_count")?,
            complete: digest.is_some(),
            ingested_at: row.try_get("ingested_at")?,
        });
    }

    println!("Knowledge Base Stats");
    println!("====================");
    println!();
    println!("  Store:       {}", config.store.path.display());
    println!("  Size:        {}", format_bytes(db_size));
    match &space {
        Some(s) => println!("  Embeddings:  {} ({} dims)", s.model, s.dims),
        None => println!("  Embeddings:  unbound"),
    }
    println!();
    println!("  Documents:   {}", sources.len());
    println!("  Chunks:      {}", records);

    if let Some(run) = store.last_run().await? {
        println!();
        println!("  Last ingest: {} ({})", format_ts_relative(run.finished_at), run.id);
        println!(
            "    seen {} / ingested {} / unchanged {} / removed {} / chunks written {} / failed {}",
            run.documents_seen,
            run.documents_ingested,
            run.documents_unchanged,
            run.documents_removed,
            run.chunks_written,
            run.failed_items
        );
    }

    if !sources.is_empty() {
        println!();
        println!("  By document:");
        println!("  {:<40} {:>8} {:>9}   {}", "SOURCE", "CHUNKS", "COMPLETE", "INGESTED");
        println!("  {}", "-".repeat(76));
        for s in &sources {
            println!(
                "  {:<40} {:>8} {:>9}   {}",
                s.source,
                s.chunk_count,
                if s.complete { "yes" } else { "partial" },
                format_ts_relative(s.ingested_at)
            );
        }
    }

    println!();
    Ok(())
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Relative time for recent timestamps, a date otherwise.
fn format_ts_relative(ts: i64) -> String {
    let delta = chrono::Utc::now().timestamp() - ts;
    match delta {
        d if d < 0 => format_ts_iso(ts),
        d if d < 60 => "just now".to_string(),
        d if d < 3600 => plural(d / 60, "min"),
        d if d < 86400 => plural(d / 3600, "hour"),
        d if d < 86400 * 30 => plural(d / 86400, "day"),
        _ => format_ts_iso(ts),
    }
}

fn plural(n: i64, unit: &str) -> String {
    format!("{} {}{} ago", n, unit, if n == 1 { "" } else { "s" })
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MB");
    }

    #[test]
    fn test_relative_time() {
        let now = chrono::Utc::now().timestamp();
        assert_eq!(format_ts_relative(now), "just now");
        assert_eq!(format_ts_relative(now - 120), "2 mins ago");
        assert_eq!(format_ts_relative(now - 3600), "1 hour ago");
        assert_eq!(format_ts_relative(0), "1970-01-01 00:00");
    }
}
