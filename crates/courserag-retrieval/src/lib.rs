//! Chunking, embedding, vector indexing, and query retrieval over course
//! material and forum threads.
//!
//! Build time runs [`pipeline::chunk_stage`], [`pipeline::embed_stage`] and
//! [`pipeline::index_stage`]; query time loads an [`index::LoadedIndex`]
//! once and answers questions through a [`retriever::Retriever`].

pub mod chunker;
pub mod context;
pub mod embedding;
pub mod index;
pub mod pipeline;
pub mod retriever;
