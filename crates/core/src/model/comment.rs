use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::RecordError;
use crate::model::ids::{CommentId, CourseId, Identity};

pub const COMMENT_MAX_CHARS: usize = 2_000;

/// A discussion comment on a course. Owned by the remote store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "CommentFields")]
pub struct Comment {
    id: CommentId,
    course_id: CourseId,
    author: String,
    content: String,
    created_at: DateTime<Utc>,
    user: Identity,
}

#[derive(Deserialize)]
struct CommentFields {
    id: CommentId,
    course_id: CourseId,
    author: String,
    content: String,
    created_at: DateTime<Utc>,
    user: Identity,
}

impl TryFrom<CommentFields> for Comment {
    type Error = RecordError;

    fn try_from(f: CommentFields) -> Result<Self, Self::Error> {
        Comment::new(f.id, f.course_id, f.author, f.content, f.created_at, f.user)
    }
}

impl Comment {
    /// Build a validated comment. Author and content are trimmed.
    ///
    /// # Errors
    ///
    /// Returns `RecordError::EmptyComment`, `RecordError::CommentTooLong` or
    /// `RecordError::EmptyAuthor`.
    pub fn new(
        id: CommentId,
        course_id: CourseId,
        author: impl Into<String>,
        content: impl Into<String>,
        created_at: DateTime<Utc>,
        user: Identity,
    ) -> Result<Self, RecordError> {
        let author = author.into().trim().to_owned();
        if author.is_empty() {
            return Err(RecordError::EmptyAuthor);
        }
        let content = content.into().trim().to_owned();
        if content.is_empty() {
            return Err(RecordError::EmptyComment);
        }
        if content.chars().count() > COMMENT_MAX_CHARS {
            return Err(RecordError::CommentTooLong {
                max: COMMENT_MAX_CHARS,
            });
        }
        Ok(Self {
            id,
            course_id,
            author,
            content,
            created_at,
            user,
        })
    }

    #[must_use]
    pub fn id(&self) -> &CommentId {
        &self.id
    }

    #[must_use]
    pub fn course_id(&self) -> &CourseId {
        &self.course_id
    }

    #[must_use]
    pub fn author(&self) -> &str {
        &self.author
    }

    #[must_use]
    pub fn content(&self) -> &str {
        &self.content
    }

    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    #[must_use]
    pub fn user(&self) -> &Identity {
        &self.user
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::fixed_now;

    fn build(content: &str) -> Result<Comment, RecordError> {
        Comment::new(
            CommentId::generate(),
            CourseId::new("c1").unwrap(),
            "Ada",
            content,
            fixed_now(),
            Identity::Anonymous,
        )
    }

    #[test]
    fn blank_content_is_rejected() {
        assert_eq!(build("   ").unwrap_err(), RecordError::EmptyComment);
    }

    #[test]
    fn overlong_content_is_rejected() {
        let long = "x".repeat(COMMENT_MAX_CHARS + 1);
        assert!(matches!(
            build(&long),
            Err(RecordError::CommentTooLong { .. })
        ));
    }

    #[test]
    fn content_is_trimmed() {
        assert_eq!(build("  nice course \n").unwrap().content(), "nice course");
    }

    #[test]
    fn deserialize_revalidates() {
        let comment = build("ok").unwrap();
        let mut json = serde_json::to_value(&comment).unwrap();
        json["content"] = serde_json::Value::String(String::new());
        assert!(serde_json::from_value::<Comment>(json).is_err());
    }
}
