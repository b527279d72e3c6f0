use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::CourseRagError;

/// Environment variable holding the embedding service bearer token.
pub const API_KEY_ENV: &str = "AIPIPE_TOKEN";

/// Top-level configuration loaded from `.courserag.toml`.
///
/// Resolution: `--config` flag > `.courserag.toml` in the working
/// directory > defaults. Every field has a default, so an empty file is valid.
///
/// # Examples
///
/// ```
/// use courserag_core::CourseRagConfig;
///
/// let config = CourseRagConfig::default();
/// assert_eq!(config.chunking.chunk_size, 1000);
/// assert_eq!(config.retrieval.top_k, 5);
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CourseRagConfig {
    /// Text splitting settings.
    #[serde(default)]
    pub chunking: ChunkingConfig,
    /// Embedding service settings.
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    /// Query-time settings.
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    /// Input and artifact locations.
    #[serde(default)]
    pub paths: PathsConfig,
}

impl CourseRagConfig {
    /// Load configuration from a TOML file at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`CourseRagError::Io`] if the file cannot be read,
    /// [`CourseRagError::Toml`] if the content is not valid TOML, or
    /// [`CourseRagError::Config`] if a value is out of range.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use courserag_core::CourseRagConfig;
    /// use std::path::Path;
    ///
    /// let config = CourseRagConfig::from_file(Path::new(".courserag.toml")).unwrap();
    /// ```
    pub fn from_file(path: &Path) -> Result<Self, CourseRagError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns [`CourseRagError::Toml`] if parsing fails, or
    /// [`CourseRagError::Config`] if validation fails.
    ///
    /// # Examples
    ///
    /// ```
    /// use courserag_core::CourseRagConfig;
    ///
    /// let toml = r#"
    /// [chunking]
    /// chunk_size = 500
    /// chunk_overlap = 50
    /// "#;
    /// let config = CourseRagConfig::from_toml(toml).unwrap();
    /// assert_eq!(config.chunking.chunk_size, 500);
    /// ```
    pub fn from_toml(content: &str) -> Result<Self, CourseRagError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check values that would make the pipeline misbehave.
    ///
    /// # Errors
    ///
    /// Returns [`CourseRagError::Config`] describing the first bad value.
    pub fn validate(&self) -> Result<(), CourseRagError> {
        if self.chunking.chunk_size == 0 {
            return Err(CourseRagError::Config(
                "chunking.chunk_size must be greater than zero".into(),
            ));
        }
        if self.chunking.chunk_overlap >= self.chunking.chunk_size {
            return Err(CourseRagError::Config(format!(
                "chunking.chunk_overlap ({}) must be smaller than chunking.chunk_size ({})",
                self.chunking.chunk_overlap, self.chunking.chunk_size
            )));
        }
        if self.embedding.batch_size == 0 {
            return Err(CourseRagError::Config(
                "embedding.batch_size must be greater than zero".into(),
            ));
        }
        if self.embedding.max_attempts == 0 {
            return Err(CourseRagError::Config(
                "embedding.max_attempts must be at least 1".into(),
            ));
        }
        if self.embedding.max_concurrency == 0 {
            return Err(CourseRagError::Config(
                "embedding.max_concurrency must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Text splitter configuration.
///
/// # Examples
///
/// ```
/// use courserag_core::ChunkingConfig;
///
/// let config = ChunkingConfig::default();
/// assert_eq!(config.chunk_size, 1000);
/// assert_eq!(config.chunk_overlap, 150);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkingConfig {
    /// Maximum chunk length in characters (default: 1000).
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Characters shared between consecutive chunks (default: 150).
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
}

fn default_chunk_size() -> usize {
    1000
}

fn default_chunk_overlap() -> usize {
    150
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
        }
    }
}

/// Configuration for the remote embedding service.
///
/// # Examples
///
/// ```
/// use courserag_core::EmbeddingConfig;
///
/// let config = EmbeddingConfig::default();
/// assert_eq!(config.model, "text-embedding-3-small");
/// assert_eq!(config.batch_size, 200);
/// assert_eq!(config.max_attempts, 3);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// OpenAI-compatible API base (default: `"https://aipipe.org/openai/v1"`).
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Model name (default: `"text-embedding-3-small"`).
    #[serde(default = "default_embedding_model")]
    pub model: String,
    /// API key. Falls back to the `AIPIPE_TOKEN` env var.
    pub api_key: Option<String>,
    /// Maximum texts per request (default: 200).
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Total attempts per batch, including the first (default: 3).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,
    /// Fixed delay between attempts in seconds (default: 5).
    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: u64,
    /// Per-request timeout while building, in seconds (default: 60).
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Maximum batches in flight at once (default: 4).
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
}

impl EmbeddingConfig {
    /// Resolve the API key from config, then from `AIPIPE_TOKEN`.
    ///
    /// # Errors
    ///
    /// Returns [`CourseRagError::Config`] if neither is set.
    pub fn resolve_api_key(&self) -> Result<String, CourseRagError> {
        self.api_key
            .clone()
            .or_else(|| std::env::var(API_KEY_ENV).ok())
            .filter(|key| !key.trim().is_empty())
            .ok_or_else(|| {
                CourseRagError::Config(format!(
                    "embedding API key not found: set embedding.api_key in .courserag.toml or {API_KEY_ENV} env var"
                ))
            })
    }
}

fn default_base_url() -> String {
    "https://aipipe.org/openai/v1".into()
}

fn default_embedding_model() -> String {
    "text-embedding-3-small".into()
}

fn default_batch_size() -> usize {
    200
}

fn default_max_attempts() -> usize {
    3
}

fn default_retry_delay_secs() -> u64 {
    5
}

fn default_timeout_secs() -> u64 {
    60
}

fn default_max_concurrency() -> usize {
    4
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            model: default_embedding_model(),
            api_key: None,
            batch_size: default_batch_size(),
            max_attempts: default_max_attempts(),
            retry_delay_secs: default_retry_delay_secs(),
            timeout_secs: default_timeout_secs(),
            max_concurrency: default_max_concurrency(),
        }
    }
}

/// Query-time settings.
///
/// # Examples
///
/// ```
/// use courserag_core::RetrievalConfig;
///
/// let config = RetrievalConfig::default();
/// assert_eq!(config.top_k, 5);
/// assert_eq!(config.query_timeout_secs, 30);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrievalConfig {
    /// Results returned when the caller does not ask for a count (default: 5).
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    /// Timeout for the query embedding request, in seconds (default: 30).
    #[serde(default = "default_query_timeout_secs")]
    pub query_timeout_secs: u64,
}

fn default_top_k() -> usize {
    5
}

fn default_query_timeout_secs() -> u64 {
    30
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            query_timeout_secs: default_query_timeout_secs(),
        }
    }
}

/// Locations of pipeline inputs and artifacts, relative to the working
/// directory unless absolute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Scraped course pages.
    #[serde(default = "default_course_file")]
    pub course_file: PathBuf,
    /// Scraped forum threads.
    #[serde(default = "default_discourse_file")]
    pub discourse_file: PathBuf,
    /// Chunk stage output.
    #[serde(default = "default_chunks_file")]
    pub chunks_file: PathBuf,
    /// Embed stage output.
    #[serde(default = "default_embeddings_file")]
    pub embeddings_file: PathBuf,
    /// Binary vector index.
    #[serde(default = "default_index_file")]
    pub index_file: PathBuf,
    /// Position to chunk mapping.
    #[serde(default = "default_mapping_file")]
    pub mapping_file: PathBuf,
}

fn default_course_file() -> PathBuf {
    PathBuf::from("data/course_content.json")
}

fn default_discourse_file() -> PathBuf {
    PathBuf::from("data/discourse.json")
}

fn default_chunks_file() -> PathBuf {
    PathBuf::from("data/chunks.json")
}

fn default_embeddings_file() -> PathBuf {
    PathBuf::from("data/embeddings.json")
}

fn default_index_file() -> PathBuf {
    PathBuf::from("data/vector_index.bin")
}

fn default_mapping_file() -> PathBuf {
    PathBuf::from("data/index_to_chunk_map.json")
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            course_file: default_course_file(),
            discourse_file: default_discourse_file(),
            chunks_file: default_chunks_file(),
            embeddings_file: default_embeddings_file(),
            index_file: default_index_file(),
            mapping_file: default_mapping_file(),
        }
    }
}

impl PathsConfig {
    /// Re-root every relative path under `base`.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::path::Path;
    /// use courserag_core::PathsConfig;
    ///
    /// let paths = PathsConfig::default().rooted_at(Path::new("/srv/ta"));
    /// assert_eq!(paths.index_file, Path::new("/srv/ta/data/vector_index.bin"));
    /// ```
    pub fn rooted_at(&self, base: &Path) -> Self {
        let root = |p: &PathBuf| {
            if p.is_absolute() {
                p.clone()
            } else {
                base.join(p)
            }
        };
        Self {
            course_file: root(&self.course_file),
            discourse_file: root(&self.discourse_file),
            chunks_file: root(&self.chunks_file),
            embeddings_file: root(&self.embeddings_file),
            index_file: root(&self.index_file),
            mapping_file: root(&self.mapping_file),
        }
    }
}
