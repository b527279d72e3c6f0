use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Provenance attached to every chunk.
///
/// # Examples
///
/// ```
/// use courserag_core::ChunkMetadata;
///
/// let meta = ChunkMetadata {
///     source_url: Some("https://tds.example/intro".into()),
///     source_title: "Introduction".into(),
///     chunk_id: "tds_42_chunk_0".into(),
/// };
/// assert_eq!(meta.chunk_id, "tds_42_chunk_0");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    /// Page or post the chunk was cut from, when known.
    pub source_url: Option<String>,
    /// Human-readable title of the source.
    pub source_title: String,
    /// Corpus-unique identifier, e.g. `tds_42_chunk_3` or `discourse_q_7_a_1_chunk_0`.
    pub chunk_id: String,
}

/// A bounded slice of a source document plus its provenance.
///
/// Serialized as `{"page_content": ..., "metadata": {...}}`, the shape
/// shared by the chunk artifact and the index side-table.
///
/// # Examples
///
/// ```
/// use courserag_core::{ChunkMetadata, ChunkRecord};
///
/// let chunk = ChunkRecord {
///     content: "Linear regression fits a line.".into(),
///     metadata: ChunkMetadata {
///         source_url: None,
///         source_title: "Week 3".into(),
///         chunk_id: "w3_chunk_0".into(),
///     },
/// };
/// let json = serde_json::to_value(&chunk).unwrap();
/// assert_eq!(json["page_content"], "Linear regression fits a line.");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRecord {
    /// Chunk text.
    #[serde(rename = "page_content")]
    pub content: String,
    /// Where the text came from.
    pub metadata: ChunkMetadata,
}

/// A chunk together with its embedding vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddedChunk {
    /// The chunk being embedded.
    #[serde(flatten)]
    pub chunk: ChunkRecord,
    /// Model embedding vector.
    pub embedding: Vec<f32>,
}

/// A retrieved chunk ranked by distance to the query.
///
/// # Examples
///
/// ```
/// use courserag_core::{ChunkMetadata, SearchResult};
///
/// let result = SearchResult {
///     content: "Use pandas.read_csv".into(),
///     metadata: ChunkMetadata {
///         source_url: Some("https://tds.example/pandas".into()),
///         source_title: "Pandas".into(),
///         chunk_id: "pandas_chunk_1".into(),
///     },
///     distance: 0.42,
/// };
/// assert!(result.distance >= 0.0);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    /// Chunk text.
    pub content: String,
    /// Provenance of the chunk.
    pub metadata: ChunkMetadata,
    /// Squared Euclidean distance to the query (0 = exact match).
    pub distance: f32,
}

/// Output format for CLI subcommands.
///
/// Implements [`FromStr`] so it can be used directly with `clap` argument parsing.
///
/// # Examples
///
/// ```
/// use courserag_core::OutputFormat;
///
/// let fmt: OutputFormat = "json".parse().unwrap();
/// assert_eq!(fmt, OutputFormat::Json);
///
/// let fmt: OutputFormat = "md".parse().unwrap();
/// assert_eq!(fmt, OutputFormat::Markdown);
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Human-readable summaries.
    #[default]
    Text,
    /// Machine-readable JSON.
    Json,
    /// Markdown-formatted output.
    Markdown,
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputFormat::Text => write!(f, "text"),
            OutputFormat::Json => write!(f, "json"),
            OutputFormat::Markdown => write!(f, "markdown"),
        }
    }
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(OutputFormat::Text),
            "json" => Ok(OutputFormat::Json),
            "markdown" | "md" => Ok(OutputFormat::Markdown),
            other => Err(format!("unknown output format: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_chunk() -> ChunkRecord {
        ChunkRecord {
            content: "Docker images are layered.".into(),
            metadata: ChunkMetadata {
                source_url: Some("https://tds.example/docker".into()),
                source_title: "Docker".into(),
                chunk_id: "docker_chunk_0".into(),
            },
        }
    }

    #[test]
    fn output_format_from_str() {
        assert_eq!("text".parse::<OutputFormat>().unwrap(), OutputFormat::Text);
        assert_eq!("json".parse::<OutputFormat>().unwrap(), OutputFormat::Json);
        assert_eq!(
            "markdown".parse::<OutputFormat>().unwrap(),
            OutputFormat::Markdown
        );
        assert_eq!(
            "md".parse::<OutputFormat>().unwrap(),
            OutputFormat::Markdown
        );
        assert_eq!("JSON".parse::<OutputFormat>().unwrap(), OutputFormat::Json);
        assert!("xml".parse::<OutputFormat>().is_err());
    }

    #[test]
    fn output_format_display() {
        assert_eq!(OutputFormat::Text.to_string(), "text");
        assert_eq!(OutputFormat::Json.to_string(), "json");
        assert_eq!(OutputFormat::Markdown.to_string(), "markdown");
    }

    #[test]
    fn chunk_record_uses_page_content_key() {
        let json = serde_json::to_value(sample_chunk()).unwrap();
        assert_eq!(json["page_content"], "Docker images are layered.");
        assert_eq!(json["metadata"]["chunk_id"], "docker_chunk_0");
        assert!(json.get("content").is_none());
    }

    #[test]
    fn null_source_url_parses() {
        let json = r#"{
            "page_content": "text",
            "metadata": {"source_url": null, "source_title": "T", "chunk_id": "x_chunk_0"}
        }"#;
        let chunk: ChunkRecord = serde_json::from_str(json).unwrap();
        assert!(chunk.metadata.source_url.is_none());
    }

    #[test]
    fn embedded_chunk_flattens_record() {
        let embedded = EmbeddedChunk {
            chunk: sample_chunk(),
            embedding: vec![0.5, -0.25],
        };
        let json = serde_json::to_value(&embedded).unwrap();
        assert_eq!(json["page_content"], "Docker images are layered.");
        assert_eq!(json["embedding"].as_array().unwrap().len(), 2);

        let back: EmbeddedChunk = serde_json::from_value(json).unwrap();
        assert_eq!(back, embedded);
    }

    #[test]
    fn search_result_serializes_content_and_distance() {
        let result = SearchResult {
            content: "text".into(),
            metadata: sample_chunk().metadata,
            distance: 1.5,
        };
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["content"], "text");
        assert_eq!(json["distance"], 1.5);
        assert_eq!(json["metadata"]["source_url"], "https://tds.example/docker");
    }
}
