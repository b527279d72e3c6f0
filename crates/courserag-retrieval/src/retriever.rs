//! Query-time retrieval: embed a question, search the loaded index.

use std::sync::Arc;
use std::time::Duration;

use courserag_core::{CourseRagConfig, CourseRagError, SearchResult};
use tracing::debug;

use crate::embedding::{Embedder, EmbeddingClient};
use crate::index::LoadedIndex;

/// Answers questions against a shared, read-only [`LoadedIndex`].
///
/// A retriever cannot exist without a loaded index, so "index never built"
/// surfaces when loading, not on the first query. Clone the `Arc` to share
/// one index between many retrievers or tasks.
///
/// # Examples
///
/// ```no_run
/// use std::path::Path;
/// use std::sync::Arc;
/// use courserag_core::CourseRagConfig;
/// use courserag_retrieval::index::LoadedIndex;
/// use courserag_retrieval::retriever::Retriever;
///
/// # async fn example() {
/// let config = CourseRagConfig::default();
/// let index = Arc::new(
///     LoadedIndex::load(&config.paths.index_file, &config.paths.mapping_file).unwrap(),
/// );
/// let retriever = Retriever::from_config(&config, index).unwrap();
/// let results = retriever.retrieve("What is a p-value?", 5).await.unwrap();
/// for r in &results {
///     println!("{:.3} {}", r.distance, r.metadata.source_title);
/// }
/// # }
/// ```
pub struct Retriever<E> {
    index: Arc<LoadedIndex>,
    embedder: E,
    default_k: usize,
}

impl<E: Embedder> Retriever<E> {
    /// Create a retriever over `index` using `embedder` for queries.
    pub fn new(index: Arc<LoadedIndex>, embedder: E, default_k: usize) -> Self {
        Self {
            index,
            embedder,
            default_k,
        }
    }

    /// The shared index.
    pub fn index(&self) -> &Arc<LoadedIndex> {
        &self.index
    }

    /// Result count used by [`Retriever::retrieve_default`].
    pub fn default_k(&self) -> usize {
        self.default_k
    }

    /// Return up to `k` chunks nearest to `query`, nearest first.
    ///
    /// A blank query returns no results without calling the embedder. The
    /// query is embedded with a single attempt; there is no retry on this
    /// path.
    ///
    /// # Errors
    ///
    /// Returns [`CourseRagError::Transient`] if the embedding service is
    /// unreachable or times out, [`CourseRagError::Embedding`] if it rejects
    /// the request, and [`CourseRagError::Index`] if the query vector's
    /// dimension does not match the index.
    pub async fn retrieve(&self, query: &str, k: usize) -> Result<Vec<SearchResult>, CourseRagError> {
        if query.trim().is_empty() {
            debug!("blank query, returning no results");
            return Ok(Vec::new());
        }

        let vectors = self.embedder.embed(&[query.to_string()]).await?;
        let vector = vectors.into_iter().next().ok_or_else(|| {
            CourseRagError::Embedding("service returned no vector for the query".into())
        })?;

        let results = self.index.search(&vector, k)?;
        debug!(k, returned = results.len(), "retrieved chunks");
        Ok(results)
    }

    /// [`Retriever::retrieve`] with the configured default `k`.
    ///
    /// # Errors
    ///
    /// Same as [`Retriever::retrieve`].
    pub async fn retrieve_default(&self, query: &str) -> Result<Vec<SearchResult>, CourseRagError> {
        self.retrieve(query, self.default_k).await
    }
}

impl Retriever<EmbeddingClient> {
    /// Build a retriever with an HTTP embedding client using the query
    /// timeout from `config.retrieval`.
    ///
    /// # Errors
    ///
    /// Returns [`CourseRagError::Config`] if no API key is available.
    pub fn from_config(config: &CourseRagConfig, index: Arc<LoadedIndex>) -> Result<Self, CourseRagError> {
        let timeout = Duration::from_secs(config.retrieval.query_timeout_secs);
        let client = EmbeddingClient::with_config(&config.embedding, timeout)?;
        Ok(Self::new(index, client, config.retrieval.top_k))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use courserag_core::{ChunkMetadata, ChunkRecord, EmbeddedChunk};

    /// Maps a text to a 2-d vector from keyword hits.
    struct KeywordEmbedder {
        calls: AtomicUsize,
    }

    fn keyword_vector(text: &str) -> Vec<f32> {
        let lower = text.to_lowercase();
        vec![
            if lower.contains("regression") { 1.0 } else { 0.0 },
            if lower.contains("docker") { 1.0 } else { 0.0 },
        ]
    }

    #[async_trait]
    impl Embedder for KeywordEmbedder {
        async fn embed(&self, batch: &[String]) -> Result<Vec<Vec<f32>>, CourseRagError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(batch.iter().map(|t| keyword_vector(t)).collect())
        }
    }

    struct DownEmbedder;

    #[async_trait]
    impl Embedder for DownEmbedder {
        async fn embed(&self, _batch: &[String]) -> Result<Vec<Vec<f32>>, CourseRagError> {
            Err(CourseRagError::Transient("request timed out".into()))
        }
    }

    fn corpus() -> Arc<LoadedIndex> {
        let texts = [
            ("regression", "Linear regression fits a line to data."),
            ("docker", "Docker containers package applications."),
            ("git", "Git tracks changes to files."),
        ];
        let chunks = texts
            .iter()
            .map(|(id, text)| EmbeddedChunk {
                chunk: ChunkRecord {
                    content: text.to_string(),
                    metadata: ChunkMetadata {
                        source_url: Some(format!("https://tds.example/{id}")),
                        source_title: id.to_string(),
                        chunk_id: format!("{id}_chunk_0"),
                    },
                },
                embedding: keyword_vector(text),
            })
            .collect();
        Arc::new(LoadedIndex::build(chunks).unwrap())
    }

    fn retriever() -> Retriever<KeywordEmbedder> {
        Retriever::new(
            corpus(),
            KeywordEmbedder {
                calls: AtomicUsize::new(0),
            },
            5,
        )
    }

    #[tokio::test]
    async fn small_corpus_returns_all_chunks() {
        let retriever = retriever();
        let results = retriever.retrieve("define regression", 5).await.unwrap();
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].metadata.chunk_id, "regression_chunk_0");
        assert_eq!(results[0].distance, 0.0);
        assert!(results.windows(2).all(|w| w[0].distance <= w[1].distance));
    }

    #[tokio::test]
    async fn results_keep_source_url() {
        let results = retriever().retrieve("docker", 1).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(
            results[0].metadata.source_url.as_deref(),
            Some("https://tds.example/docker")
        );
    }

    #[tokio::test]
    async fn default_k_is_used() {
        let retriever = Retriever::new(
            corpus(),
            KeywordEmbedder {
                calls: AtomicUsize::new(0),
            },
            2,
        );
        let results = retriever.retrieve_default("regression").await.unwrap();
        assert_eq!(results.len(), 2);
    }

    #[tokio::test]
    async fn blank_query_skips_embedding() {
        let retriever = retriever();
        let results = retriever.retrieve("   ", 5).await.unwrap();
        assert!(results.is_empty());
        assert_eq!(retriever.embedder.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unavailable_service_is_reported_once() {
        let retriever = Retriever::new(corpus(), DownEmbedder, 5);
        let err = retriever.retrieve("regression", 5).await.unwrap_err();
        assert!(err.is_transient());
        assert!(err.to_string().contains("unavailable"));
    }

    #[tokio::test]
    async fn concurrent_queries_share_one_index() {
        let retriever = Arc::new(retriever());
        let handles: Vec<_> = ["regression", "docker", "git"]
            .into_iter()
            .map(|q| {
                let retriever = Arc::clone(&retriever);
                tokio::spawn(async move { retriever.retrieve(q, 3).await })
            })
            .collect();
        for handle in handles {
            let results = handle.await.unwrap().unwrap();
            assert_eq!(results.len(), 3);
        }
        assert_eq!(Arc::strong_count(retriever.index()), 1);
    }
}
