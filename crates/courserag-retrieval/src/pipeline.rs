//! Corpus build stages: chunk, embed, index.
//!
//! Each stage reads the previous stage's JSON artifact and writes its own,
//! so stages can be re-run independently. [`build`] runs all three.

use std::path::Path;

use courserag_core::{
    ChunkRecord, ChunkingConfig, CourseRagConfig, CourseRagError, EmbeddedChunk, PathsConfig,
};
use indicatif::ProgressBar;
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::chunker::Chunker;
use crate::embedding::{batch_count, embed_batches, BatchOutcome, BatchPolicy, Embedder};
use crate::index::LoadedIndex;

/// Summary of a chunking run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkReport {
    /// Total chunks written.
    pub chunks: usize,
    /// Chunks from course pages.
    pub course_chunks: usize,
    /// Chunks from forum threads.
    pub discourse_chunks: usize,
    /// Records dropped as malformed or duplicate.
    pub skipped_records: usize,
    /// Input files that were not found.
    pub missing_inputs: Vec<String>,
}

/// Summary of an embedding run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EmbedReport {
    /// Chunks read from the chunk artifact.
    pub chunks: usize,
    /// Chunks that received a vector.
    pub embedded: usize,
    /// Batches dispatched.
    pub batches: usize,
    /// Batches skipped after failing.
    pub failed_batches: usize,
    /// Retries across all batches.
    pub retries: usize,
}

/// Summary of an index build.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexReport {
    /// Vectors stored.
    pub vectors: usize,
    /// Vector dimension.
    pub dimension: usize,
}

/// Summary of a full build.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildReport {
    /// Chunk stage summary.
    pub chunk: ChunkReport,
    /// Embed stage summary.
    pub embed: EmbedReport,
    /// Index stage summary.
    pub index: IndexReport,
}

/// Read a JSON array of records; `Ok(None)` if the file does not exist.
///
/// A top-level value that is not an array is treated as an empty input.
///
/// # Errors
///
/// Returns [`CourseRagError::Io`] or [`CourseRagError::Serialization`] if the
/// file exists but cannot be read or parsed.
pub fn read_records(path: &Path) -> Result<Option<Vec<Value>>, CourseRagError> {
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(path)?;
    match serde_json::from_str::<Value>(&content)? {
        Value::Array(items) => Ok(Some(items)),
        _ => {
            warn!(path = %path.display(), "expected a JSON array, found another value");
            Ok(Some(Vec::new()))
        }
    }
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), CourseRagError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(value)?)?;
    Ok(())
}

fn read_required<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, CourseRagError> {
    if !path.exists() {
        return Err(CourseRagError::FileNotFound(path.to_path_buf()));
    }
    Ok(serde_json::from_str(&std::fs::read_to_string(path)?)?)
}

/// Chunk the course and forum files into the chunk artifact.
///
/// A missing input file is logged and treated as empty.
///
/// # Errors
///
/// Returns an error if an input exists but is unreadable, or if the chunk
/// artifact cannot be written.
pub fn chunk_stage(config: &ChunkingConfig, paths: &PathsConfig) -> Result<ChunkReport, CourseRagError> {
    let chunker = Chunker::new(*config);
    let mut chunks = Vec::new();
    let mut report = ChunkReport::default();

    match read_records(&paths.course_file)? {
        Some(items) => {
            let stats = chunker.chunk_course(&items, &mut chunks);
            report.course_chunks = stats.course_chunks;
            report.skipped_records += stats.skipped_records;
        }
        None => {
            warn!(path = %paths.course_file.display(), "course file not found, skipping");
            report.missing_inputs.push(paths.course_file.display().to_string());
        }
    }

    match read_records(&paths.discourse_file)? {
        Some(threads) => {
            let stats = chunker.chunk_discourse(&threads, &mut chunks);
            report.discourse_chunks = stats.discourse_chunks;
            report.skipped_records += stats.skipped_records;
        }
        None => {
            warn!(path = %paths.discourse_file.display(), "discourse file not found, skipping");
            report.missing_inputs.push(paths.discourse_file.display().to_string());
        }
    }

    report.chunks = chunks.len();
    write_json(&paths.chunks_file, &chunks)?;
    info!(
        chunks = report.chunks,
        course = report.course_chunks,
        discourse = report.discourse_chunks,
        path = %paths.chunks_file.display(),
        "wrote chunks"
    );
    Ok(report)
}

/// Pair chunks with batch outcomes, dropping chunks of failed batches.
///
/// A batch whose vector count disagrees with its size is dropped too.
/// Returns the embedded chunks and the number of dropped batches.
pub fn assemble(chunks: Vec<ChunkRecord>, outcomes: Vec<BatchOutcome>) -> (Vec<EmbeddedChunk>, usize) {
    let mut slots: Vec<Option<ChunkRecord>> = chunks.into_iter().map(Some).collect();
    let mut embedded = Vec::with_capacity(slots.len());
    let mut failed = 0;

    for outcome in outcomes {
        let vectors = match outcome.result {
            Ok(vectors) if vectors.len() == outcome.len => vectors,
            Ok(vectors) => {
                warn!(
                    batch = outcome.batch,
                    expected = outcome.len,
                    got = vectors.len(),
                    "skipping batch with wrong vector count"
                );
                failed += 1;
                continue;
            }
            Err(_) => {
                failed += 1;
                continue;
            }
        };
        let Some(window) = slots.get_mut(outcome.start..outcome.start + outcome.len) else {
            warn!(batch = outcome.batch, "batch range outside the chunk list");
            failed += 1;
            continue;
        };
        for (slot, embedding) in window.iter_mut().zip(vectors) {
            if let Some(chunk) = slot.take() {
                embedded.push(EmbeddedChunk { chunk, embedding });
            }
        }
    }

    (embedded, failed)
}

/// Embed the chunk artifact into the embedding artifact.
///
/// Failed batches are skipped. If nothing was embedded, no artifact is
/// written. `progress` gets its length set to the batch count.
///
/// # Errors
///
/// Returns [`CourseRagError::FileNotFound`] if the chunk artifact is
/// missing, or an I/O / serialization error.
pub async fn embed_stage<E: Embedder + ?Sized>(
    embedder: &E,
    policy: &BatchPolicy,
    paths: &PathsConfig,
    progress: Option<&ProgressBar>,
) -> Result<EmbedReport, CourseRagError> {
    let chunks: Vec<ChunkRecord> = read_required(&paths.chunks_file)?;
    let texts: Vec<String> = chunks.iter().map(|c| c.content.clone()).collect();
    let batches = batch_count(texts.len(), policy.batch_size);
    info!(chunks = chunks.len(), batches, "embedding chunks");

    if let Some(pb) = progress {
        pb.set_length(batches as u64);
    }
    let outcomes = embed_batches(embedder, &texts, policy, progress).await;
    let retries = outcomes.iter().map(BatchOutcome::retries).sum();

    let report_chunks = chunks.len();
    let (embedded, failed_batches) = assemble(chunks, outcomes);
    let report = EmbedReport {
        chunks: report_chunks,
        embedded: embedded.len(),
        batches,
        failed_batches,
        retries,
    };

    if embedded.is_empty() {
        warn!("no chunks were embedded, leaving the embedding artifact untouched");
        return Ok(report);
    }

    write_json(&paths.embeddings_file, &embedded)?;
    info!(
        embedded = report.embedded,
        failed_batches,
        path = %paths.embeddings_file.display(),
        "wrote embeddings"
    );
    Ok(report)
}

/// Build the vector index from the embedding artifact and persist it.
///
/// # Errors
///
/// Returns [`CourseRagError::FileNotFound`] if the embedding artifact is
/// missing, [`CourseRagError::DimensionMismatch`] if vectors disagree in
/// length, and [`CourseRagError::Index`] if there is nothing to index.
pub fn index_stage(paths: &PathsConfig) -> Result<IndexReport, CourseRagError> {
    let embedded: Vec<EmbeddedChunk> = read_required(&paths.embeddings_file)?;
    let index = LoadedIndex::build(embedded)?;
    index.save(&paths.index_file, &paths.mapping_file)?;
    Ok(IndexReport {
        vectors: index.len(),
        dimension: index.index().dimension(),
    })
}

/// Run chunk, embed and index in sequence.
///
/// # Errors
///
/// Propagates stage errors. Returns [`CourseRagError::Embedding`] if the
/// embed stage produced no vectors, rather than indexing a stale artifact.
pub async fn build<E: Embedder + ?Sized>(
    config: &CourseRagConfig,
    embedder: &E,
    progress: Option<&ProgressBar>,
) -> Result<BuildReport, CourseRagError> {
    let chunk = chunk_stage(&config.chunking, &config.paths)?;
    let policy = BatchPolicy::from(&config.embedding);
    let embed = embed_stage(embedder, &policy, &config.paths, progress).await?;
    if embed.embedded == 0 {
        return Err(CourseRagError::Embedding(format!(
            "no chunks were embedded ({} of {} batches failed)",
            embed.failed_batches, embed.batches
        )));
    }
    let index = index_stage(&config.paths)?;
    Ok(BuildReport { chunk, embed, index })
}
