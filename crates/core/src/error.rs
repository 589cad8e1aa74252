use thiserror::Error;

/// Validation failures raised when building domain records.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum RecordError {
    #[error("{kind} cannot be empty")]
    EmptyId { kind: &'static str },

    #[error("quiz score must be between 0 and 100, got {0}")]
    InvalidScore(u8),

    #[error("quiz must have at least one question")]
    NoQuestions,

    #[error("rating must be between 1 and 5, got {0}")]
    InvalidRating(u8),

    #[error("comment content cannot be empty")]
    EmptyComment,

    #[error("comment content exceeds {max} characters")]
    CommentTooLong { max: usize },

    #[error("comment author cannot be empty")]
    EmptyAuthor,

    #[error("invalid identity segment: {0}")]
    InvalidIdentity(String),
}
