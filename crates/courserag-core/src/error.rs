use std::path::PathBuf;

/// Errors that can occur across the retrieval pipeline.
///
/// Library crates use this type directly; the binary converts to a
/// `miette` report at the boundary.
///
/// # Examples
///
/// ```
/// use courserag_core::CourseRagError;
///
/// let err = CourseRagError::Config("missing API key".into());
/// assert!(err.to_string().contains("missing API key"));
/// assert!(!err.is_transient());
/// ```
#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum CourseRagError {
    /// Filesystem I/O failure.
    #[error("IO error: {0}")]
    #[diagnostic(code(courserag::io))]
    Io(#[from] std::io::Error),

    /// Invalid or missing configuration (credentials, index artifacts).
    #[error("configuration error: {0}")]
    #[diagnostic(
        code(courserag::config),
        help("check .courserag.toml or run `courserag doctor`")
    )]
    Config(String),

    /// Network failure, timeout, or server-side error from the embedding
    /// service. Safe to retry.
    #[error("embedding service unavailable: {0}")]
    #[diagnostic(code(courserag::transient), help("the service may recover; try again later"))]
    Transient(String),

    /// Embedding request rejected or answered with an unusable body.
    #[error("embedding error: {0}")]
    #[diagnostic(code(courserag::embedding))]
    Embedding(String),

    /// A vector whose length differs from the index dimension.
    #[error("dimension mismatch at position {position}: expected {expected}, found {found}")]
    #[diagnostic(
        code(courserag::dimension_mismatch),
        help("every chunk must be embedded with the same model")
    )]
    DimensionMismatch {
        /// Dimension fixed by the first vector.
        expected: usize,
        /// Dimension of the offending vector.
        found: usize,
        /// Position of the offending vector.
        position: usize,
    },

    /// Corrupt or unreadable vector index.
    #[error("index error: {0}")]
    #[diagnostic(code(courserag::index), help("rebuild the index with `courserag build`"))]
    Index(String),

    /// JSON serialization / deserialization failure.
    #[error("serialization error: {0}")]
    #[diagnostic(code(courserag::serialization))]
    Serialization(#[from] serde_json::Error),

    /// TOML deserialization failure.
    #[error("TOML parse error: {0}")]
    #[diagnostic(code(courserag::toml))]
    Toml(#[from] toml::de::Error),

    /// A required file was not found.
    #[error("file not found: {}", .0.display())]
    #[diagnostic(code(courserag::file_not_found))]
    FileNotFound(PathBuf),
}

impl CourseRagError {
    /// Whether the failed operation may succeed if attempted again.
    pub fn is_transient(&self) -> bool {
        matches!(self, CourseRagError::Transient(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_error_converts() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: CourseRagError = io_err.into();
        assert!(err.to_string().contains("gone"));
    }

    #[test]
    fn config_error_displays_message() {
        let err = CourseRagError::Config("bad value".into());
        assert_eq!(err.to_string(), "configuration error: bad value");
    }

    #[test]
    fn file_not_found_shows_path() {
        let err = CourseRagError::FileNotFound(PathBuf::from("/tmp/missing.json"));
        assert!(err.to_string().contains("/tmp/missing.json"));
    }

    #[test]
    fn only_transient_errors_are_retryable() {
        assert!(CourseRagError::Transient("503".into()).is_transient());
        assert!(!CourseRagError::Embedding("400".into()).is_transient());
        assert!(!CourseRagError::Config("no key".into()).is_transient());
    }

    #[test]
    fn dimension_mismatch_names_both_sizes() {
        let err = CourseRagError::DimensionMismatch {
            expected: 1536,
            found: 768,
            position: 4,
        };
        let msg = err.to_string();
        assert!(msg.contains("1536"));
        assert!(msg.contains("768"));
        assert!(msg.contains("position 4"));
    }
}
