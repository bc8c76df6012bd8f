//! Error taxonomy shared by every core component.

use thiserror::Error;

/// Result alias for core operations.
pub type SearchResult<T> = std::result::Result<T, SearchError>;

/// Errors surfaced by the projection, maintenance, query and suggestion paths.
#[derive(Debug, Error)]
pub enum SearchError {
    /// Referenced node or uuid does not exist.
    #[error("node not found: {0}")]
    NotFound(String),

    /// Caller lacks the permission for a direct (non-search) operation.
    #[error("access denied: {0}")]
    AccessDenied(String),

    /// Text extraction from binary content failed.
    #[error("text extraction failed: {0}")]
    ExtractionFailure(String),

    /// Malformed query expression or property definition.
    #[error("parse failure at {position}: {message}")]
    ParseFailure { message: String, position: usize },

    /// The text index is unavailable or corrupt.
    #[error("index I/O failure: {0}")]
    IndexIo(String),

    /// Relational read/write failure in a collaborator.
    #[error("data access failure: {0}")]
    DataAccess(String),
}

impl SearchError {
    /// Convenience constructor for parse failures.
    pub fn parse(message: impl Into<String>, position: usize) -> Self {
        Self::ParseFailure {
            message: message.into(),
            position,
        }
    }

    /// Stable error code for JSON responses and logs.
    #[must_use]
    pub const fn error_type(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "NOT_FOUND",
            Self::AccessDenied(_) => "ACCESS_DENIED",
            Self::ExtractionFailure(_) => "EXTRACTION_FAILURE",
            Self::ParseFailure { .. } => "PARSE_FAILURE",
            Self::IndexIo(_) => "INDEX_IO_FAILURE",
            Self::DataAccess(_) => "DATA_ACCESS_FAILURE",
        }
    }

    /// Whether the failure is transient and the operation may be retried.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::IndexIo(_) | Self::DataAccess(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_type_mapping() {
        let cases: Vec<(SearchError, &str)> = vec![
            (SearchError::NotFound("a".into()), "NOT_FOUND"),
            (SearchError::AccessDenied("a".into()), "ACCESS_DENIED"),
            (
                SearchError::ExtractionFailure("pdf".into()),
                "EXTRACTION_FAILURE",
            ),
            (SearchError::parse("unexpected ')'", 4), "PARSE_FAILURE"),
            (SearchError::IndexIo("locked".into()), "INDEX_IO_FAILURE"),
            (SearchError::DataAccess("gone".into()), "DATA_ACCESS_FAILURE"),
        ];
        for (err, expected) in &cases {
            assert_eq!(err.error_type(), *expected, "{err:?}");
        }
    }

    #[test]
    fn retryable_classification() {
        assert!(SearchError::IndexIo("x".into()).is_retryable());
        assert!(SearchError::DataAccess("x".into()).is_retryable());

        assert!(!SearchError::NotFound("x".into()).is_retryable());
        assert!(!SearchError::AccessDenied("x".into()).is_retryable());
        assert!(!SearchError::ExtractionFailure("x".into()).is_retryable());
        assert!(!SearchError::parse("x", 0).is_retryable());
    }

    #[test]
    fn parse_failure_display_carries_position() {
        let err = SearchError::parse("unterminated phrase", 7);
        assert_eq!(
            err.to_string(),
            "parse failure at 7: unterminated phrase"
        );
    }
}
