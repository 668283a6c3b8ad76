//! # knowledge-rag CLI (`kb`)
//!
//! The `kb` binary is the primary interface for the knowledge base. It
//! provides commands for store initialization, ingestion, question
//! answering, retrieval-only search, statistics, and the HTTP API.
//!
//! ## Usage
//!
//! ```bash
//! kb --config ./config/kb.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `kb init` | Create the SQLite store and its schema |
//! | `kb ingest` | Chunk, embed and store the documents directory |
//! | `kb query "<question>"` | Answer a question from the knowledge base |
//! | `kb search "<query>"` | Show retrieved chunks without generating an answer |
//! | `kb stats` | Summarize what is indexed |
//! | `kb serve` | Start the HTTP API |
//!
//! ## Exit status
//!
//! `0` on success, `2` when ingestion finished with failed items, `1` on a
//! fatal error, `130` when ingestion was interrupted.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use knowledge_rag::config::{self, Config};
use knowledge_rag::core::store::{RecordFilter, VectorStore};
use knowledge_rag::embedding::create_provider;
use knowledge_rag::generation::create_generator;
use knowledge_rag::ingest::{self, IngestOptions, IngestReport};
use knowledge_rag::query::{QueryEngine, QueryRequest};
use knowledge_rag::server;
use knowledge_rag::sqlite_store::SqliteStore;
use knowledge_rag::stats;

const DEFAULT_CONFIG: &str = "./config/kb.toml";

/// Question answering over a markdown knowledge base.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/kb.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "kb",
    about = "Question answering over a markdown knowledge base",
    version,
    long_about = "Splits markdown documents along their headings, embeds the chunks into a \
    SQLite vector store, and answers questions with a completion model grounded in the \
    retrieved context."
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/kb.toml`; built-in defaults apply when that
    /// file does not exist.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Vector store location, overriding `[store].path`.
    #[arg(long, global = true)]
    store: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the store and its schema.
    ///
    /// Idempotent: running it on an existing store is safe.
    Init,

    /// Ingest the documents directory.
    ///
    /// Unchanged documents are skipped, changed ones re-chunked and
    /// re-embedded, and deleted ones pruned from the store.
    Ingest {
        /// Documents directory, overriding `[documents].root`.
        #[arg(long)]
        docs_dir: Option<PathBuf>,

        /// Re-process every document, even if unchanged.
        #[arg(long)]
        full: bool,

        /// Clear the store before ingesting (required after switching
        /// embedding models).
        #[arg(long)]
        rebuild: bool,

        /// Show document and chunk counts without embedding or writing.
        #[arg(long)]
        dry_run: bool,
    },

    /// Answer a question from the knowledge base.
    Query {
        /// The question.
        query: String,

        /// Completion model, overriding `[generation].model`.
        #[arg(long)]
        model: Option<String>,

        /// Number of chunks to retrieve.
        #[arg(long)]
        top_k: Option<i64>,

        /// Print the retrieved chunks with their sources and scores.
        #[arg(long)]
        show_context: bool,

        /// Write the full result as JSON to this file.
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Show retrieved chunks without generating an answer.
    Search {
        query: String,

        /// Number of chunks to retrieve.
        #[arg(long)]
        top_k: Option<i64>,

        /// Only search these documents (repeatable).
        #[arg(long)]
        source: Vec<String>,

        /// Only return chunks under this heading.
        #[arg(long)]
        heading: Option<String>,

        /// Drop results scoring below this similarity.
        #[arg(long)]
        min_score: Option<f32>,
    },

    /// Summarize the store contents.
    Stats,

    /// Start the HTTP API.
    Serve {
        /// Listen address, overriding `[server].bind`.
        #[arg(long)]
        bind: Option<String>,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("knowledge_rag=info,knowledge_rag_core=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::from(1)
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let explicit = cli.config.is_some();
    let config_path = cli
        .config
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG));
    let mut cfg = config::load_or_default(&config_path, explicit)?;
    if let Some(store) = cli.store {
        cfg.store.path = store;
    }

    match cli.command {
        Commands::Init => {
            let store = open_store(&cfg).await?;
            store.close().await;
            println!("Store initialized: {}", cfg.store.path.display());
        }
        Commands::Ingest {
            docs_dir,
            full,
            rebuild,
            dry_run,
        } => {
            if let Some(dir) = docs_dir {
                cfg.documents.root = dir;
            }
            let options = IngestOptions {
                full,
                rebuild,
                dry_run,
            };
            return run_ingest(&cfg, options).await;
        }
        Commands::Query {
            query,
            model,
            top_k,
            show_context,
            output,
        } => {
            let (engine, store) = build_engine(&cfg).await?;
            let request = QueryRequest {
                query,
                model,
                top_k,
                include_context: show_context || output.is_some(),
            };
            let response = engine.answer(&request).await?;
            store.close().await;

            println!("{}", response.answer);
            if show_context {
                println!();
                println!("model: {}", response.model_used);
                for (i, chunk) in response.context.iter().flatten().enumerate() {
                    println!(
                        "  [{}] {:.3}  {} | {} (chunk {}){}",
                        i + 1,
                        chunk.score,
                        chunk.source,
                        chunk.heading_path.join(" > "),
                        chunk.chunk_index,
                        if chunk.included { "" } else { " [not in context]" }
                    );
                }
            }
            if let Some(path) = output {
                let json = serde_json::to_string_pretty(&response)?;
                std::fs::write(&path, json)
                    .with_context(|| format!("Failed to write {}", path.display()))?;
            }
        }
        Commands::Search {
            query,
            top_k,
            source,
            heading,
            min_score,
        } => {
            let (engine, store) = build_engine(&cfg).await?;
            let filter = RecordFilter {
                sources: (!source.is_empty()).then_some(source),
                heading,
                min_score,
            };
            let hits = engine.search(&query, top_k, Some(&filter)).await?;
            store.close().await;

            if hits.is_empty() {
                println!("No results.");
            }
            for (i, hit) in hits.iter().enumerate() {
                println!(
                    "{}. [{:.3}] {} | {}",
                    i + 1,
                    hit.score,
                    hit.metadata.source,
                    hit.metadata.section_label()
                );
                println!("   {}", snippet(&hit.text, 160));
            }
        }
        Commands::Stats => {
            let store = open_store(&cfg).await?;
            stats::run_stats(&cfg, &store).await?;
            store.close().await;
        }
        Commands::Serve { bind } => {
            let bind = bind.unwrap_or_else(|| cfg.server.bind.clone());
            let (engine, _store) = build_engine(&cfg).await?;
            server::run_server(&bind, Arc::new(engine)).await?;
        }
    }

    Ok(ExitCode::SUCCESS)
}

async fn open_store(cfg: &Config) -> anyhow::Result<SqliteStore> {
    SqliteStore::open(&cfg.store.path)
        .await
        .with_context(|| format!("Failed to open store at {}", cfg.store.path.display()))
}

async fn build_engine(cfg: &Config) -> anyhow::Result<(QueryEngine, Arc<SqliteStore>)> {
    let store = Arc::new(open_store(cfg).await?);
    let embedder = create_provider(&cfg.embedding)?;
    let generator = create_generator(&cfg.generation)?;
    let dyn_store: Arc<dyn VectorStore> = store.clone();
    Ok((QueryEngine::new(cfg, dyn_store, embedder, generator), store))
}

async fn run_ingest(cfg: &Config, options: IngestOptions) -> anyhow::Result<ExitCode> {
    let root = cfg.documents.root.display().to_string();

    if options.dry_run {
        let report = ingest::estimate(cfg)?;
        println!("ingest {} (dry-run)", root);
        println!("  items found: {}", report.documents_seen);
        println!("  estimated chunks: {}", report.estimated_chunks);
        print_failures(&report);
        return Ok(if report.is_partial() {
            ExitCode::from(2)
        } else {
            ExitCode::SUCCESS
        });
    }

    let store = Arc::new(open_store(cfg).await?);
    let embedder = create_provider(&cfg.embedding)?;
    let dyn_store: Arc<dyn VectorStore> = store.clone();

    let report = tokio::select! {
        result = ingest::ingest_directory(cfg, dyn_store, embedder, options) => result?,
        _ = tokio::signal::ctrl_c() => {
            eprintln!("interrupted; documents written so far are kept");
            store.close().await;
            return Ok(ExitCode::from(130));
        }
    };
    store.record_run(&report).await?;
    store.close().await;

    println!("ingest {}", root);
    println!("  documents seen: {}", report.documents_seen);
    println!("  ingested: {}", report.documents_ingested);
    println!("  unchanged: {}", report.documents_unchanged);
    println!("  removed: {}", report.documents_removed);
    println!("  chunks written: {}", report.chunks_written);
    println!("  chunks unchanged: {}", report.chunks_unchanged);
    println!("  chunks removed: {}", report.chunks_removed);
    print_failures(&report);

    if report.is_partial() {
        println!("partial");
        Ok(ExitCode::from(2))
    } else {
        println!("ok");
        Ok(ExitCode::SUCCESS)
    }
}

fn print_failures(report: &IngestReport) {
    if report.failures.is_empty() {
        return;
    }
    println!("  failed items: {}", report.failures.len());
    for f in &report.failures {
        let section = if f.heading_path.is_empty() {
            String::new()
        } else {
            format!(" [{}]", f.heading_path.join(" > "))
        };
        println!("    - {}{} ({:?}): {}", f.source, section, f.stage, f.error);
    }
}

fn snippet(text: &str, max_chars: usize) -> String {
    let flat: String = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= max_chars {
        return flat;
    }
    let cut: String = flat.chars().take(max_chars).collect();
    format!("{}...", cut.trim_end())
}
