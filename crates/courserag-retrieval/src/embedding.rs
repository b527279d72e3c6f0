//! OpenAI-compatible embedding client plus batching, retry and bounded
//! concurrency on top of any [`Embedder`].
//!
//! The client talks to `{base_url}/embeddings`. Batches are retried on
//! transient failures with a fixed delay; a batch that still fails is
//! reported and left out instead of aborting the run.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use courserag_core::{CourseRagError, EmbeddingConfig};
use futures_util::future::join_all;
use indicatif::ProgressBar;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

/// Converts a batch of texts into vectors, one per text, in input order.
///
/// The HTTP client implements this; tests substitute deterministic stubs.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed every text in `batch` with a single service call.
    ///
    /// # Errors
    ///
    /// Returns [`CourseRagError::Transient`] for failures worth retrying and
    /// [`CourseRagError::Embedding`] for everything else.
    async fn embed(&self, batch: &[String]) -> Result<Vec<Vec<f32>>, CourseRagError>;
}

#[async_trait]
impl<E: Embedder + ?Sized> Embedder for Arc<E> {
    async fn embed(&self, batch: &[String]) -> Result<Vec<Vec<f32>>, CourseRagError> {
        (**self).embed(batch).await
    }
}

/// Client for an OpenAI-compatible `/embeddings` endpoint.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use courserag_retrieval::embedding::EmbeddingClient;
///
/// let client = EmbeddingClient::new("test-key", Duration::from_secs(30)).unwrap();
/// assert_eq!(client.model(), "text-embedding-3-small");
/// ```
pub struct EmbeddingClient {
    client: reqwest::Client,
    api_key: String,
    endpoint: String,
    model: String,
}

impl std::fmt::Debug for EmbeddingClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddingClient")
            .field("endpoint", &self.endpoint)
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}

#[derive(Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbedResponse {
    data: Vec<EmbedDataItem>,
}

#[derive(Deserialize)]
struct EmbedDataItem {
    embedding: Vec<f32>,
    #[serde(default)]
    index: Option<usize>,
}

impl EmbeddingClient {
    /// Create a client with default endpoint and model.
    ///
    /// # Errors
    ///
    /// Returns [`CourseRagError::Config`] if the HTTP client cannot be built.
    pub fn new(api_key: &str, timeout: Duration) -> Result<Self, CourseRagError> {
        let config = EmbeddingConfig {
            api_key: Some(api_key.to_string()),
            ..EmbeddingConfig::default()
        };
        Self::with_config(&config, timeout)
    }

    /// Create a client from an [`EmbeddingConfig`].
    ///
    /// Falls back to the `AIPIPE_TOKEN` env var if no key is configured.
    /// `timeout` bounds each request; build and query paths pass different
    /// values.
    ///
    /// # Errors
    ///
    /// Returns [`CourseRagError::Config`] if no API key is available. No
    /// network call is made in that case.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use std::time::Duration;
    /// use courserag_core::EmbeddingConfig;
    /// use courserag_retrieval::embedding::EmbeddingClient;
    ///
    /// let config = EmbeddingConfig::default();
    /// let client = EmbeddingClient::with_config(&config, Duration::from_secs(60)).unwrap();
    /// ```
    pub fn with_config(config: &EmbeddingConfig, timeout: Duration) -> Result<Self, CourseRagError> {
        let api_key = config.resolve_api_key()?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CourseRagError::Config(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            api_key,
            endpoint: format!("{}/embeddings", config.base_url.trim_end_matches('/')),
            model: config.model.clone(),
        })
    }

    /// Get the model name.
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Get the full embeddings endpoint URL.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl Embedder for EmbeddingClient {
    async fn embed(&self, batch: &[String]) -> Result<Vec<Vec<f32>>, CourseRagError> {
        if batch.is_empty() {
            return Ok(Vec::new());
        }

        let request = EmbedRequest {
            model: &self.model,
            input: batch,
        };

        let response = self
            .client
            .post(&self.endpoint)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&request)
            .send()
            .await
            .map_err(|e| CourseRagError::Transient(format!("HTTP request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "unable to read response body".into());
            let message = format!("embedding API returned {status}: {body}");
            return Err(if is_retryable_status(status) {
                CourseRagError::Transient(message)
            } else {
                CourseRagError::Embedding(message)
            });
        }

        // A stalled or cut-off body is a network failure, not a bad payload.
        let body = response
            .bytes()
            .await
            .map_err(|e| CourseRagError::Transient(format!("failed to read response body: {e}")))?;
        let parsed: EmbedResponse = serde_json::from_slice(&body)
            .map_err(|e| CourseRagError::Embedding(format!("failed to parse response: {e}")))?;

        into_ordered_vectors(parsed, batch.len())
    }
}

fn is_retryable_status(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}

/// Restore input order using the `index` field when the service sends one.
///
/// Indices, when present on every item, must be exactly `0..expected`.
fn into_ordered_vectors(
    mut response: EmbedResponse,
    expected: usize,
) -> Result<Vec<Vec<f32>>, CourseRagError> {
    if response.data.len() != expected {
        return Err(CourseRagError::Embedding(format!(
            "service returned {} embeddings for {expected} inputs",
            response.data.len()
        )));
    }
    if response.data.iter().all(|item| item.index.is_some()) {
        response.data.sort_by_key(|item| item.index);
        if let Some((position, item)) = response
            .data
            .iter()
            .enumerate()
            .find(|(position, item)| item.index != Some(*position))
        {
            return Err(CourseRagError::Embedding(format!(
                "embedding indices are not a permutation of 0..{expected}: \
                 found {} at sorted position {position}",
                item.index.unwrap_or_default()
            )));
        }
    }
    Ok(response.data.into_iter().map(|item| item.embedding).collect())
}

/// How texts are grouped and retried when embedding a corpus.
///
/// # Examples
///
/// ```
/// use courserag_core::EmbeddingConfig;
/// use courserag_retrieval::embedding::BatchPolicy;
///
/// let policy = BatchPolicy::from(&EmbeddingConfig::default());
/// assert_eq!(policy.batch_size, 200);
/// assert_eq!(policy.max_attempts, 3);
/// assert_eq!(policy.retry_delay.as_secs(), 5);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchPolicy {
    /// Maximum texts per service call.
    pub batch_size: usize,
    /// Total attempts per batch, including the first.
    pub max_attempts: usize,
    /// Fixed pause between attempts.
    pub retry_delay: Duration,
    /// Maximum batches in flight.
    pub max_concurrency: usize,
}

impl From<&EmbeddingConfig> for BatchPolicy {
    fn from(config: &EmbeddingConfig) -> Self {
        Self {
            batch_size: config.batch_size.max(1),
            max_attempts: config.max_attempts.max(1),
            retry_delay: Duration::from_secs(config.retry_delay_secs),
            max_concurrency: config.max_concurrency.max(1),
        }
    }
}

impl Default for BatchPolicy {
    fn default() -> Self {
        Self::from(&EmbeddingConfig::default())
    }
}

/// Result of embedding one batch.
#[derive(Debug)]
pub struct BatchOutcome {
    /// Zero-based batch number.
    pub batch: usize,
    /// Offset of the batch's first text in the input.
    pub start: usize,
    /// Number of texts in the batch.
    pub len: usize,
    /// Attempts made, including the first.
    pub attempts: usize,
    /// Vectors for the batch, or the last error seen.
    pub result: Result<Vec<Vec<f32>>, CourseRagError>,
}

impl BatchOutcome {
    /// Retries made after the first attempt.
    pub fn retries(&self) -> usize {
        self.attempts.saturating_sub(1)
    }
}

/// Embed one batch, retrying transient failures per `policy`.
///
/// Returns the final result and the number of attempts made.
pub async fn embed_with_retry<E: Embedder + ?Sized>(
    embedder: &E,
    batch: &[String],
    policy: &BatchPolicy,
) -> (Result<Vec<Vec<f32>>, CourseRagError>, usize) {
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match embedder.embed(batch).await {
            Ok(vectors) => return (Ok(vectors), attempt),
            Err(e) if e.is_transient() && attempt < max_attempts => {
                warn!(
                    attempt,
                    max_attempts,
                    error = %e,
                    "embedding request failed, retrying in {:?}",
                    policy.retry_delay
                );
                tokio::time::sleep(policy.retry_delay).await;
                attempt += 1;
            }
            Err(e) => return (Err(e), attempt),
        }
    }
}

/// Embed `texts` in batches of `policy.batch_size`.
///
/// Batches run concurrently, at most `policy.max_concurrency` at a time, and
/// outcomes come back in batch order regardless of completion order. A
/// failed batch does not cancel its siblings. `progress`, when given, is
/// advanced once per finished batch.
///
/// # Examples
///
/// ```no_run
/// use std::time::Duration;
/// use courserag_retrieval::embedding::{embed_batches, BatchPolicy, EmbeddingClient};
///
/// # async fn example() {
/// let client = EmbeddingClient::new("key", Duration::from_secs(60)).unwrap();
/// let texts = vec!["What is a p-value?".to_string()];
/// let outcomes = embed_batches(&client, &texts, &BatchPolicy::default(), None).await;
/// assert_eq!(outcomes.len(), 1);
/// # }
/// ```
pub async fn embed_batches<E: Embedder + ?Sized>(
    embedder: &E,
    texts: &[String],
    policy: &BatchPolicy,
    progress: Option<&ProgressBar>,
) -> Vec<BatchOutcome> {
    let batch_size = policy.batch_size.max(1);
    let permits = Semaphore::new(policy.max_concurrency.max(1));

    let tasks = texts
        .chunks(batch_size)
        .enumerate()
        .map(|(batch, slice)| {
            let permits = &permits;
            async move {
                let _permit = permits.acquire().await;
                debug!(batch, len = slice.len(), "embedding batch");
                let (result, attempts) = embed_with_retry(embedder, slice, policy).await;
                if let Err(e) = &result {
                    warn!(
                        batch,
                        start = batch * batch_size,
                        attempts,
                        error = %e,
                        "skipping batch after embedding failure"
                    );
                }
                if let Some(pb) = progress {
                    pb.inc(1);
                }
                BatchOutcome {
                    batch,
                    start: batch * batch_size,
                    len: slice.len(),
                    attempts,
                    result,
                }
            }
        });

    join_all(tasks).await
}

/// Number of batches `texts_len` texts split into.
pub fn batch_count(texts_len: usize, batch_size: usize) -> usize {
    texts_len.div_ceil(batch_size.max(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Deterministic embedder: text `t` maps to `[len(t), first byte]`.
    struct StubEmbedder {
        calls: AtomicUsize,
    }

    impl StubEmbedder {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
            }
        }
    }

    fn stub_vector(text: &str) -> Vec<f32> {
        vec![text.len() as f32, text.bytes().next().unwrap_or(0) as f32]
    }

    #[async_trait]
    impl Embedder for StubEmbedder {
        async fn embed(&self, batch: &[String]) -> Result<Vec<Vec<f32>>, CourseRagError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(batch.iter().map(|t| stub_vector(t)).collect())
        }
    }

    /// Fails the first `failures` calls with the given error kind.
    struct FlakyEmbedder {
        failures: usize,
        transient: bool,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Embedder for FlakyEmbedder {
        async fn embed(&self, batch: &[String]) -> Result<Vec<Vec<f32>>, CourseRagError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(if self.transient {
                    CourseRagError::Transient("503 Service Unavailable".into())
                } else {
                    CourseRagError::Embedding("400 Bad Request".into())
                });
            }
            Ok(batch.iter().map(|t| stub_vector(t)).collect())
        }
    }

    /// Fails every batch whose first text is in `poisoned`; finishes batches
    /// in reverse order of arrival by sleeping longer for earlier batches.
    struct SelectiveEmbedder {
        poisoned: Vec<String>,
        in_flight: AtomicUsize,
        peak: Mutex<usize>,
    }

    #[async_trait]
    impl Embedder for SelectiveEmbedder {
        async fn embed(&self, batch: &[String]) -> Result<Vec<Vec<f32>>, CourseRagError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            {
                let mut peak = self.peak.lock().unwrap();
                *peak = (*peak).max(now);
            }
            let first = batch[0].clone();
            let delay = 30u64.saturating_sub(first.len() as u64);
            tokio::time::sleep(Duration::from_millis(delay)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            if self.poisoned.contains(&first) {
                return Err(CourseRagError::Transient("connection reset".into()));
            }
            Ok(batch.iter().map(|t| stub_vector(t)).collect())
        }
    }

    fn fast_policy(batch_size: usize, max_attempts: usize, max_concurrency: usize) -> BatchPolicy {
        BatchPolicy {
            batch_size,
            max_attempts,
            retry_delay: Duration::ZERO,
            max_concurrency,
        }
    }

    #[test]
    fn request_format_is_correct() {
        let texts = vec!["first".to_string(), "second".to_string()];
        let request = EmbedRequest {
            model: "text-embedding-3-small",
            input: &texts,
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["model"], "text-embedding-3-small");
        assert_eq!(json["input"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn response_parsing_restores_index_order() {
        let json = r#"{
            "data": [
                {"embedding": [0.4, 0.5], "index": 1},
                {"embedding": [0.1, 0.2], "index": 0}
            ]
        }"#;
        let response: EmbedResponse = serde_json::from_str(json).unwrap();
        let vectors = into_ordered_vectors(response, 2).unwrap();
        assert_eq!(vectors, vec![vec![0.1, 0.2], vec![0.4, 0.5]]);
    }

    #[test]
    fn response_without_index_keeps_arrival_order() {
        let json = r#"{"data": [{"embedding": [1.0]}, {"embedding": [2.0]}]}"#;
        let response: EmbedResponse = serde_json::from_str(json).unwrap();
        let vectors = into_ordered_vectors(response, 2).unwrap();
        assert_eq!(vectors, vec![vec![1.0], vec![2.0]]);
    }

    #[test]
    fn response_count_mismatch_is_an_error() {
        let json = r#"{"data": [{"embedding": [1.0]}]}"#;
        let response: EmbedResponse = serde_json::from_str(json).unwrap();
        let err = into_ordered_vectors(response, 2).unwrap_err();
        assert!(!err.is_transient());
    }

    #[test]
    fn duplicate_indices_are_rejected() {
        let json = r#"{"data": [{"embedding": [1.0], "index": 0}, {"embedding": [2.0], "index": 0}]}"#;
        let response: EmbedResponse = serde_json::from_str(json).unwrap();
        let err = into_ordered_vectors(response, 2).unwrap_err();
        assert!(matches!(err, CourseRagError::Embedding(_)));
        assert!(err.to_string().contains("permutation"), "{err}");
    }

    #[test]
    fn out_of_range_indices_are_rejected() {
        let json = r#"{"data": [{"embedding": [1.0], "index": 0}, {"embedding": [2.0], "index": 5}]}"#;
        let response: EmbedResponse = serde_json::from_str(json).unwrap();
        let err = into_ordered_vectors(response, 2).unwrap_err();
        assert!(matches!(err, CourseRagError::Embedding(_)));
    }

    #[test]
    fn server_errors_and_rate_limits_are_retryable() {
        assert!(is_retryable_status(StatusCode::INTERNAL_SERVER_ERROR));
        assert!(is_retryable_status(StatusCode::BAD_GATEWAY));
        assert!(is_retryable_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(!is_retryable_status(StatusCode::BAD_REQUEST));
        assert!(!is_retryable_status(StatusCode::UNAUTHORIZED));
    }

    #[test]
    fn missing_api_key_gives_clear_error() {
        std::env::remove_var(courserag_core::API_KEY_ENV);
        let config = EmbeddingConfig {
            api_key: None,
            ..EmbeddingConfig::default()
        };
        let result = EmbeddingClient::with_config(&config, Duration::from_secs(1));
        let err = result.unwrap_err();
        assert!(matches!(err, CourseRagError::Config(_)));
        assert!(err.to_string().contains("API key"), "error should mention API key: {err}");
    }

    #[test]
    fn endpoint_joins_base_url() {
        let config = EmbeddingConfig {
            api_key: Some("k".into()),
            base_url: "http://localhost:8080/v1/".into(),
            ..EmbeddingConfig::default()
        };
        let client = EmbeddingClient::with_config(&config, Duration::from_secs(1)).unwrap();
        assert_eq!(client.endpoint(), "http://localhost:8080/v1/embeddings");
    }

    /// Serves every connection by reading the request, writing `reply`, and
    /// then either holding the socket open or closing it.
    async fn scripted_server(reply: &'static [u8], hold_open: bool) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = [0u8; 8192];
                    let _ = socket.read(&mut buf).await;
                    let _ = socket.write_all(reply).await;
                    if hold_open {
                        tokio::time::sleep(Duration::from_secs(30)).await;
                    }
                });
            }
        });
        addr
    }

    fn local_client(addr: SocketAddr, timeout: Duration) -> EmbeddingClient {
        let config = EmbeddingConfig {
            api_key: Some("k".into()),
            base_url: format!("http://{addr}/v1"),
            ..EmbeddingConfig::default()
        };
        EmbeddingClient::with_config(&config, timeout).unwrap()
    }

    const PARTIAL_BODY: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: 4096\r\n\r\n{\"data\": [";

    #[tokio::test]
    async fn timeout_before_headers_is_transient() {
        let addr = scripted_server(b"", true).await;
        let client = local_client(addr, Duration::from_millis(300));
        let err = client.embed(&["a".to_string()]).await.unwrap_err();
        assert!(err.is_transient(), "{err}");
    }

    #[tokio::test]
    async fn timeout_while_reading_body_is_transient() {
        let addr = scripted_server(PARTIAL_BODY, true).await;
        let client = local_client(addr, Duration::from_millis(300));
        let err = client.embed(&["a".to_string()]).await.unwrap_err();
        assert!(err.is_transient(), "{err}");
        assert!(err.to_string().contains("response body"), "{err}");
    }

    #[tokio::test]
    async fn truncated_body_is_transient() {
        let addr = scripted_server(PARTIAL_BODY, false).await;
        let client = local_client(addr, Duration::from_secs(5));
        let err = client.embed(&["a".to_string()]).await.unwrap_err();
        assert!(err.is_transient(), "{err}");
    }

    #[tokio::test]
    async fn undecodable_body_is_not_transient() {
        let addr = scripted_server(
            b"HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: 8\r\n\r\nnot json",
            true,
        )
        .await;
        let client = local_client(addr, Duration::from_secs(5));
        let err = client.embed(&["a".to_string()]).await.unwrap_err();
        assert!(matches!(err, CourseRagError::Embedding(_)), "{err}");
    }

    #[tokio::test]
    async fn stalled_body_is_retried() {
        let addr = scripted_server(PARTIAL_BODY, true).await;
        let client = local_client(addr, Duration::from_millis(200));
        let texts = vec!["a".to_string()];
        let (result, attempts) = embed_with_retry(&client, &texts, &fast_policy(200, 2, 1)).await;
        assert!(result.unwrap_err().is_transient());
        assert_eq!(attempts, 2);
    }

    #[test]
    fn batch_splitting_calculates_correctly() {
        assert_eq!(batch_count(450, 200), 3);
        assert_eq!(batch_count(400, 200), 2);
        assert_eq!(batch_count(0, 200), 0);
        assert_eq!(batch_count(5, 0), 5);
    }

    #[tokio::test]
    async fn two_transient_failures_then_success() {
        let embedder = FlakyEmbedder {
            failures: 2,
            transient: true,
            calls: AtomicUsize::new(0),
        };
        let texts = vec!["a".to_string(), "b".to_string()];
        let (result, attempts) = embed_with_retry(&embedder, &texts, &fast_policy(200, 3, 1)).await;

        let vectors = result.unwrap();
        assert_eq!(vectors, vec![stub_vector("a"), stub_vector("b")]);
        assert_eq!(attempts, 3);
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausted_retries_report_failure() {
        let embedder = FlakyEmbedder {
            failures: 10,
            transient: true,
            calls: AtomicUsize::new(0),
        };
        let texts = vec!["a".to_string()];
        let (result, attempts) = embed_with_retry(&embedder, &texts, &fast_policy(200, 3, 1)).await;
        assert!(result.unwrap_err().is_transient());
        assert_eq!(attempts, 3);
    }

    #[tokio::test]
    async fn permanent_failures_are_not_retried() {
        let embedder = FlakyEmbedder {
            failures: 1,
            transient: false,
            calls: AtomicUsize::new(0),
        };
        let texts = vec!["a".to_string()];
        let (result, attempts) = embed_with_retry(&embedder, &texts, &fast_policy(200, 3, 1)).await;
        assert!(result.is_err());
        assert_eq!(attempts, 1);
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn batching_preserves_input_order() {
        let embedder = StubEmbedder::new();
        let texts: Vec<String> = (0..23).map(|i| "x".repeat(i + 1)).collect();
        let policy = fast_policy(5, 3, 3);

        let first = embed_batches(&embedder, &texts, &policy, None).await;
        let second = embed_batches(&embedder, &texts, &policy, None).await;

        assert_eq!(first.len(), 5);
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 10);

        let flatten = |outcomes: Vec<BatchOutcome>| -> Vec<Vec<f32>> {
            outcomes
                .into_iter()
                .flat_map(|o| o.result.unwrap())
                .collect()
        };
        let first = flatten(first);
        let expected: Vec<Vec<f32>> = texts.iter().map(|t| stub_vector(t)).collect();
        assert_eq!(first, expected);
        assert_eq!(flatten(second), expected);
    }

    #[tokio::test]
    async fn failed_batch_is_isolated_and_order_kept() {
        // Longer first texts finish sooner, so completion order is reversed.
        let texts: Vec<String> = vec!["a", "bb", "ccc", "dddd", "eeeee", "ffffff"]
            .into_iter()
            .map(String::from)
            .collect();
        let embedder = SelectiveEmbedder {
            poisoned: vec!["ccc".to_string()],
            in_flight: AtomicUsize::new(0),
            peak: Mutex::new(0),
        };
        let outcomes = embed_batches(&embedder, &texts, &fast_policy(2, 2, 2), None).await;

        assert_eq!(outcomes.len(), 3);
        let batches: Vec<usize> = outcomes.iter().map(|o| o.batch).collect();
        assert_eq!(batches, vec![0, 1, 2]);
        assert_eq!(outcomes[1].start, 2);
        assert!(outcomes[1].result.is_err());
        assert_eq!(outcomes[1].attempts, 2);
        assert_eq!(
            outcomes[2].result.as_ref().unwrap(),
            &vec![stub_vector("eeeee"), stub_vector("ffffff")]
        );
        assert!(*embedder.peak.lock().unwrap() <= 2);
    }

    #[tokio::test]
    async fn concurrency_cap_is_respected() {
        let texts: Vec<String> = (0..12).map(|i| format!("t{i}")).collect();
        let embedder = SelectiveEmbedder {
            poisoned: Vec::new(),
            in_flight: AtomicUsize::new(0),
            peak: Mutex::new(0),
        };
        let outcomes = embed_batches(&embedder, &texts, &fast_policy(1, 1, 3), None).await;
        assert_eq!(outcomes.len(), 12);
        assert!(outcomes.iter().all(|o| o.result.is_ok()));
        assert!(*embedder.peak.lock().unwrap() <= 3);
    }

    #[tokio::test]
    async fn arc_embedder_delegates() {
        let embedder: Arc<dyn Embedder> = Arc::new(StubEmbedder::new());
        let vectors = embedder.embed(&["hi".to_string()]).await.unwrap();
        assert_eq!(vectors, vec![stub_vector("hi")]);
    }
}
