//! mailvault - Mail ingestion into a searchable local archive
//!
//! This crate pulls messages from pluggable mail providers, gates their
//! attachments, stores everything in SQLite, and backfills vector
//! embeddings for similarity search.

pub mod app;
pub mod config;
pub mod domain;
pub mod embedding;
pub mod pipeline;
pub mod providers;
pub mod security;
pub mod storage;

pub use app::App;
