//! # knowledge-rag
//!
//! Question answering over a directory of markdown documents.
//!
//! Documents are split along their heading structure, embedded, and stored
//! in SQLite. Questions are embedded with the same model, matched by cosine
//! similarity, and answered by a completion model that sees only the
//! retrieved context.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────────┐   ┌──────────┐
//! │  Markdown   │──▶│   Pipeline   │──▶│  SQLite  │
//! │  directory  │   │ Chunk+Embed  │   │  vectors │
//! └─────────────┘   └──────────────┘   └────┬─────┘
//!                                           │
//!                       ┌───────────────────┤
//!                       ▼                   ▼
//!                  ┌──────────┐       ┌──────────┐
//!                  │   CLI    │       │   HTTP   │
//!                  │   (kb)   │       │ /api/... │
//!                  └──────────┘       └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! kb init                          # create the store
//! kb ingest --docs-dir ./docs      # chunk, embed, store
//! kb query "How is overtime paid?"
//! kb serve                         # start the HTTP API
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration and `KB_*` overrides |
//! | [`loader`] | Markdown discovery and normalization |
//! | [`embedding`] | OpenAI, Ollama, local and hash embedders |
//! | [`generation`] | OpenAI, Ollama and extractive answer generators |
//! | [`sqlite_store`] | SQLite vector store |
//! | [`ingest`] | Ingestion pipeline |
//! | [`query`] | Retrieval + generation entry point |
//! | [`server`] | HTTP gateway |
//! | [`stats`] | Store statistics |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema creation |
//!
//! The I/O-free core (chunking, retrieval, context assembly, traits) lives
//! in the `knowledge-rag-core` crate and is re-exported as [`core`].

pub use knowledge_rag_core as core;

pub mod config;
pub mod db;
pub mod embedding;
pub mod generation;
pub mod ingest;
pub mod loader;
pub mod migrate;
pub mod query;
pub mod server;
pub mod sqlite_store;
pub mod stats;
