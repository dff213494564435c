//! # localllm core
//!
//! Runtime-free logic for localllm: data models, the overlapping-window
//! chunker, similarity representations, ranking, context assembly, prompt
//! templates, and the persistence trait.
//!
//! This crate contains no tokio, sqlx, filesystem I/O, or native inference
//! code. Everything here is deterministic and unit-testable in isolation.

pub mod chunk;
pub mod context;
pub mod embedding;
pub mod models;
pub mod prompt;
pub mod search;
pub mod store;
