//! Turning retrieved chunks into prompt context and source citations.

use std::collections::HashSet;

use courserag_core::SearchResult;
use serde::{Deserialize, Serialize};

/// Separator placed between chunk contents in a context block.
pub const CONTEXT_SEPARATOR: &str = "\n\n---\n\n";

/// Characters of chunk content kept in a citation snippet.
pub const CITATION_SNIPPET_CHARS: usize = 250;

/// A source link shown alongside an answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Citation {
    /// Source page or post.
    pub url: String,
    /// Leading excerpt of the cited chunk.
    pub text: String,
}

/// Join result contents, nearest first, into one context string.
///
/// # Examples
///
/// ```
/// use courserag_core::{ChunkMetadata, SearchResult};
/// use courserag_retrieval::context::context_block;
///
/// let result = |text: &str| SearchResult {
///     content: text.into(),
///     metadata: ChunkMetadata {
///         source_url: None,
///         source_title: "t".into(),
///         chunk_id: "t_chunk_0".into(),
///     },
///     distance: 0.0,
/// };
/// let block = context_block(&[result("first"), result("second")]);
/// assert_eq!(block, "first\n\n---\n\nsecond");
/// ```
pub fn context_block(results: &[SearchResult]) -> String {
    results
        .iter()
        .map(|r| r.content.as_str())
        .collect::<Vec<_>>()
        .join(CONTEXT_SEPARATOR)
}

/// One citation per distinct `source_url`, in rank order.
///
/// Results without a URL are skipped. The snippet is the first
/// [`CITATION_SNIPPET_CHARS`] characters of the content followed by `...`.
pub fn citations(results: &[SearchResult]) -> Vec<Citation> {
    let mut seen = HashSet::new();
    results
        .iter()
        .filter_map(|r| {
            let url = r.metadata.source_url.as_deref()?;
            if !seen.insert(url) {
                return None;
            }
            let snippet: String = r.content.chars().take(CITATION_SNIPPET_CHARS).collect();
            Some(Citation {
                url: url.to_string(),
                text: format!("{snippet}..."),
            })
        })
        .collect()
}
