//! Recursive character chunking of course pages and forum threads.
//!
//! Text is split on paragraph breaks first, then line breaks, then spaces,
//! and only cut mid-word when no separator keeps a piece under the budget.
//! Consecutive chunks share up to `chunk_overlap` characters.

use std::collections::{HashSet, VecDeque};

use courserag_core::{ChunkMetadata, ChunkRecord, ChunkingConfig};
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use tracing::{debug, warn};

/// Separators tried in order. The empty separator means "cut between characters".
const SEPARATORS: [&str; 4] = ["\n\n", "\n", " ", ""];

/// Characters of the question used in synthesized forum titles.
const TITLE_PREVIEW_CHARS: usize = 80;

/// Splits text into overlapping, size-bounded chunks.
///
/// Lengths are measured in characters, not bytes.
///
/// # Examples
///
/// ```
/// use courserag_core::ChunkingConfig;
/// use courserag_retrieval::chunker::TextSplitter;
///
/// let splitter = TextSplitter::new(ChunkingConfig { chunk_size: 10, chunk_overlap: 3 });
/// assert_eq!(splitter.split("Hello world"), vec!["Hello", "world"]);
/// ```
#[derive(Debug, Clone, Copy)]
pub struct TextSplitter {
    chunk_size: usize,
    chunk_overlap: usize,
}

impl TextSplitter {
    /// Create a splitter from chunking settings.
    pub fn new(config: ChunkingConfig) -> Self {
        Self {
            chunk_size: config.chunk_size.max(1),
            chunk_overlap: config.chunk_overlap,
        }
    }

    /// Maximum chunk length in characters.
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Split `text` into trimmed, non-empty chunks in document order.
    pub fn split(&self, text: &str) -> Vec<String> {
        self.split_with(text, &SEPARATORS)
    }

    fn split_with(&self, text: &str, separators: &[&str]) -> Vec<String> {
        // First separator present in the text wins; "" always matches.
        let (separator, remaining) = separators
            .iter()
            .enumerate()
            .find(|(_, sep)| sep.is_empty() || text.contains(**sep))
            .map(|(i, sep)| (*sep, &separators[i + 1..]))
            .unwrap_or(("", &[][..]));

        let mut chunks = Vec::new();
        let mut fitting: Vec<&str> = Vec::new();

        for piece in split_keeping_separator(text, separator) {
            if char_len(piece) < self.chunk_size {
                fitting.push(piece);
                continue;
            }
            if !fitting.is_empty() {
                chunks.extend(self.merge(&fitting));
                fitting.clear();
            }
            if remaining.is_empty() {
                chunks.push(piece.to_string());
            } else {
                chunks.extend(self.split_with(piece, remaining));
            }
        }

        if !fitting.is_empty() {
            chunks.extend(self.merge(&fitting));
        }
        chunks
    }

    /// Greedily pack pieces into chunks, carrying a tail of at most
    /// `chunk_overlap` characters into the next chunk.
    fn merge(&self, pieces: &[&str]) -> Vec<String> {
        let mut chunks = Vec::new();
        let mut window: VecDeque<(&str, usize)> = VecDeque::new();
        let mut total = 0usize;

        for &piece in pieces {
            let len = char_len(piece);
            if total + len > self.chunk_size && !window.is_empty() {
                if let Some(chunk) = join_trimmed(&window) {
                    chunks.push(chunk);
                }
                while total > self.chunk_overlap || (total + len > self.chunk_size && total > 0) {
                    let Some((_, dropped)) = window.pop_front() else {
                        break;
                    };
                    total -= dropped;
                }
            }
            window.push_back((piece, len));
            total += len;
        }

        if let Some(chunk) = join_trimmed(&window) {
            chunks.push(chunk);
        }
        chunks
    }
}

impl Default for TextSplitter {
    fn default() -> Self {
        Self::new(ChunkingConfig::default())
    }
}

/// Split on `separator`, attaching each separator to the start of the piece
/// that follows it. Empty pieces are dropped.
fn split_keeping_separator<'a>(text: &'a str, separator: &str) -> Vec<&'a str> {
    if separator.is_empty() {
        return text
            .char_indices()
            .map(|(i, c)| &text[i..i + c.len_utf8()])
            .collect();
    }

    let mut pieces = Vec::new();
    let mut start = 0;
    for (idx, _) in text.match_indices(separator) {
        if idx > start {
            pieces.push(&text[start..idx]);
        }
        start = idx;
    }
    if start < text.len() {
        pieces.push(&text[start..]);
    }
    pieces
}

fn join_trimmed(window: &VecDeque<(&str, usize)>) -> Option<String> {
    let joined: String = window.iter().map(|(piece, _)| *piece).collect();
    let trimmed = joined.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

fn preview(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// A scraped course page.
#[derive(Debug, Clone, Deserialize)]
pub struct CourseDocument {
    /// Stable page identifier.
    #[serde(default)]
    pub id: Option<String>,
    /// Page URL.
    #[serde(default)]
    pub url: Option<String>,
    /// Page title.
    #[serde(default)]
    pub title: Option<String>,
    /// Extracted page text.
    #[serde(default)]
    pub content: Option<String>,
}

/// A forum thread: one question and its replies.
///
/// Decoding is lenient per field: a field of the wrong type reads as absent
/// and an answer that is not an object decodes as `None`.
#[derive(Debug, Clone, Deserialize)]
pub struct DiscourseThread {
    /// Thread URL.
    #[serde(default, deserialize_with = "lenient_string")]
    pub url: Option<String>,
    /// Opening post text.
    #[serde(default, deserialize_with = "lenient_string")]
    pub question: Option<String>,
    /// Replies in thread order, as they appeared in the source.
    #[serde(default, deserialize_with = "lenient_answers")]
    pub answers: Vec<Option<DiscourseAnswer>>,
}

/// A reply within a forum thread.
#[derive(Debug, Clone, Deserialize)]
pub struct DiscourseAnswer {
    /// Reply text.
    #[serde(default, deserialize_with = "lenient_string")]
    pub text: Option<String>,
    /// Permalink of the reply.
    #[serde(default, deserialize_with = "lenient_string")]
    pub url: Option<String>,
}

fn lenient_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    Ok(match Value::deserialize(deserializer)? {
        Value::String(s) => Some(s),
        _ => None,
    })
}

/// Keeps answer positions stable; entries that are not objects become `None`.
fn lenient_answers<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Vec<Option<DiscourseAnswer>>, D::Error> {
    let Value::Array(items) = Value::deserialize(deserializer)? else {
        return Ok(Vec::new());
    };
    Ok(items
        .iter()
        .map(|item| DiscourseAnswer::deserialize(item).ok())
        .collect())
}

/// Counts produced by a chunking run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkStats {
    /// Chunks cut from course pages.
    pub course_chunks: usize,
    /// Chunks cut from forum questions and answers.
    pub discourse_chunks: usize,
    /// Records dropped because they failed to decode or repeated an id.
    pub skipped_records: usize,
}

/// Turns raw documents into [`ChunkRecord`]s with provenance metadata.
///
/// # Examples
///
/// ```
/// use courserag_core::ChunkingConfig;
/// use courserag_retrieval::chunker::Chunker;
///
/// let chunker = Chunker::new(ChunkingConfig::default());
/// let chunks = chunker.chunk("week1", "Install uv first.", Some("https://tds.example/w1"), "Week 1");
/// assert_eq!(chunks.len(), 1);
/// assert_eq!(chunks[0].metadata.chunk_id, "week1_chunk_0");
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct Chunker {
    splitter: TextSplitter,
}

impl Chunker {
    /// Create a chunker from chunking settings.
    pub fn new(config: ChunkingConfig) -> Self {
        Self {
            splitter: TextSplitter::new(config),
        }
    }

    /// Chunk one text, numbering chunks `{document_id}_chunk_{i}`.
    pub fn chunk(
        &self,
        document_id: &str,
        text: &str,
        source_url: Option<&str>,
        source_title: &str,
    ) -> Vec<ChunkRecord> {
        self.splitter
            .split(text)
            .into_iter()
            .enumerate()
            .map(|(i, content)| ChunkRecord {
                content,
                metadata: ChunkMetadata {
                    source_url: source_url.map(str::to_string),
                    source_title: source_title.to_string(),
                    chunk_id: format!("{document_id}_chunk_{i}"),
                },
            })
            .collect()
    }

    /// Chunk scraped course pages.
    ///
    /// Pages without content are skipped. Records that do not decode, and
    /// pages repeating an earlier id, are logged and counted as skipped.
    pub fn chunk_course(&self, items: &[Value], out: &mut Vec<ChunkRecord>) -> ChunkStats {
        let mut stats = ChunkStats::default();
        let mut seen_ids = HashSet::new();

        for (i, item) in items.iter().enumerate() {
            let doc: CourseDocument = match CourseDocument::deserialize(item) {
                Ok(doc) => doc,
                Err(e) => {
                    warn!(record = i, error = %e, "skipping malformed course record");
                    stats.skipped_records += 1;
                    continue;
                }
            };
            let Some(content) = doc.content.as_deref().filter(|c| !c.trim().is_empty()) else {
                debug!(record = i, "course record has no content");
                continue;
            };

            let id = doc.id.clone().unwrap_or_else(|| format!("course_{i}"));
            if !seen_ids.insert(id.clone()) {
                warn!(record = i, id = %id, "skipping course record with duplicate id");
                stats.skipped_records += 1;
                continue;
            }

            let title = doc.title.as_deref().unwrap_or(&id);
            let chunks = self.chunk(&id, content, doc.url.as_deref(), title);
            stats.course_chunks += chunks.len();
            out.extend(chunks);
        }

        stats
    }

    /// Chunk forum threads. Each question and each answer is chunked on its
    /// own; titles preview the first 80 characters of the question.
    ///
    /// Threads that are not objects, and answers that are not objects, are
    /// logged and counted as skipped.
    pub fn chunk_discourse(&self, threads: &[Value], out: &mut Vec<ChunkRecord>) -> ChunkStats {
        let mut stats = ChunkStats::default();

        for (t, item) in threads.iter().enumerate() {
            let thread: DiscourseThread = match DiscourseThread::deserialize(item) {
                Ok(thread) => thread,
                Err(e) => {
                    warn!(record = t, error = %e, "skipping malformed discourse thread");
                    stats.skipped_records += 1;
                    continue;
                }
            };

            let question = thread.question.as_deref().unwrap_or("");
            let question_preview = preview(question, TITLE_PREVIEW_CHARS);

            if !question.trim().is_empty() {
                let chunks = self.chunk(
                    &format!("discourse_q_{t}"),
                    question,
                    thread.url.as_deref(),
                    &format!("Discourse Question: {question_preview}..."),
                );
                stats.discourse_chunks += chunks.len();
                out.extend(chunks);
            }

            let answer_title = format!("Discourse Answer to: {question_preview}...");
            for (k, answer) in thread.answers.iter().enumerate() {
                let Some(answer) = answer else {
                    warn!(record = t, answer = k, "skipping malformed discourse answer");
                    stats.skipped_records += 1;
                    continue;
                };
                let Some(text) = answer.text.as_deref().filter(|t| !t.trim().is_empty()) else {
                    continue;
                };
                let chunks = self.chunk(
                    &format!("discourse_q_{t}_a_{k}"),
                    text,
                    answer.url.as_deref(),
                    &answer_title,
                );
                stats.discourse_chunks += chunks.len();
                out.extend(chunks);
            }
        }

        stats
    }
}
