//! Core types, configuration, and error handling for courserag.
//!
//! This crate provides the shared foundation used by the retrieval crate and
//! the CLI:
//! - [`CourseRagError`]: unified error type using `thiserror`
//! - [`CourseRagConfig`]: configuration loaded from `.courserag.toml`
//! - Shared types: [`ChunkRecord`], [`ChunkMetadata`], [`EmbeddedChunk`],
//!   [`SearchResult`], [`OutputFormat`]

mod config;
mod error;
mod types;

pub use config::{
    ChunkingConfig, CourseRagConfig, EmbeddingConfig, PathsConfig, RetrievalConfig, API_KEY_ENV,
};
pub use error::CourseRagError;
pub use types::{ChunkMetadata, ChunkRecord, EmbeddedChunk, OutputFormat, SearchResult};

/// A convenience `Result` type for courserag operations.
pub type Result<T> = std::result::Result<T, CourseRagError>;
