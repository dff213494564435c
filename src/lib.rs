//! # localllm
//!
//! On-device retrieval-augmented generation for local language models.
//!
//! Documents are decoded, split into overlapping chunks, and indexed with a
//! similarity representation. A chat turn optionally retrieves the most
//! relevant chunks, renders them into a model-specific prompt, and streams
//! tokens from a locally loaded model, persisting the finished reply.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────┐   ┌──────────┐
//! │ Decoder  │──▶│  Index   │──▶│  SQLite  │
//! │ PDF/Text │   │ Chunk+Rep│   │ chunks   │
//! └──────────┘   └────┬─────┘   └──────────┘
//!                     │ search
//!                     ▼
//!               ┌──────────┐   ┌────────────┐   ┌──────────────┐
//!               │ Pipeline │──▶│ Generation │──▶│ ModelSession │
//!               │  (turn)  │   │  Session   │   │  + backend   │
//!               └──────────┘   └────────────┘   └──────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`logging`] | `tracing` subscriber setup |
//! | [`error`] | Error enums per component |
//! | [`decoder`] | PDF / text / Markdown decoding |
//! | [`embedding`] | Embedder construction (keyword, fastembed) |
//! | [`index`] | Chunk index with top-K search |
//! | [`ingest`] | Decode + index a file |
//! | [`backend`] | Native inference backends (stub, llama.cpp) |
//! | [`model`] | Model load/unload state machine |
//! | [`generation`] | Streaming generation sessions |
//! | [`pipeline`] | Chat turn orchestration |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`sqlite_store`] | SQLite persistence |
//!
//! Pure algorithms (chunking, ranking, context assembly, prompt templates)
//! live in the `localllm-core` crate.

pub mod backend;
pub mod cancel;
pub mod config;
pub mod db;
pub mod decoder;
pub mod embedding;
pub mod error;
pub mod generation;
pub mod index;
pub mod ingest;
pub mod logging;
pub mod migrate;
pub mod model;
pub mod pipeline;
pub mod sqlite_store;
