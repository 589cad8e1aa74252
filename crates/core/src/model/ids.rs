use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::RecordError;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident, $kind:literal) => {
        $(#[$meta])*
        #[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            #[doc = concat!("Creates a new `", stringify!($name), "`.")]
            ///
            /// # Errors
            ///
            /// Returns `RecordError::EmptyId` if the value is blank.
            pub fn new(raw: impl Into<String>) -> Result<Self, RecordError> {
                let raw = raw.into();
                let trimmed = raw.trim();
                if trimmed.is_empty() {
                    return Err(RecordError::EmptyId { kind: $kind });
                }
                if trimmed.len() == raw.len() {
                    Ok(Self(raw))
                } else {
                    Ok(Self(trimmed.to_owned()))
                }
            }

            /// Returns the underlying string value
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({:?})", stringify!($name), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = RecordError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::new(s)
            }
        }

        impl TryFrom<String> for $name {
            type Error = RecordError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::new(value)
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

string_id!(
    /// Identifier of an authenticated user.
    UserId,
    "user id"
);
string_id!(
    /// Identifier of a course in the content catalog.
    CourseId,
    "course id"
);
string_id!(
    /// Identifier of a lesson, unique within its course.
    LessonId,
    "lesson id"
);
string_id!(
    /// Identifier of a quiz, unique within its course.
    QuizId,
    "quiz id"
);
string_id!(QuestionId, "question id");
string_id!(
    /// Identifier of a comment document.
    CommentId,
    "comment id"
);

impl CommentId {
    /// Generates a fresh random comment id.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

// ─── Identity ──────────────────────────────────────────────────────────────────

const ANONYMOUS_SEGMENT: &str = "anonymous";
const USER_SEGMENT_PREFIX: &str = "user:";

/// Owner of a partition of progress records.
///
/// The anonymous identity stands in when no session is authenticated. Its
/// storage segment can never equal an authenticated user's segment.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Identity {
    Anonymous,
    User(UserId),
}

impl Identity {
    /// Identity for an optional authenticated user, falling back to anonymous.
    #[must_use]
    pub fn from_session(user: Option<UserId>) -> Self {
        user.map_or(Self::Anonymous, Self::User)
    }

    #[must_use]
    pub fn is_anonymous(&self) -> bool {
        matches!(self, Self::Anonymous)
    }

    #[must_use]
    pub fn user_id(&self) -> Option<&UserId> {
        match self {
            Self::Anonymous => None,
            Self::User(id) => Some(id),
        }
    }

    /// Segment used to scope storage keys for this identity.
    #[must_use]
    pub fn storage_segment(&self) -> String {
        match self {
            Self::Anonymous => ANONYMOUS_SEGMENT.to_owned(),
            Self::User(id) => format!("{USER_SEGMENT_PREFIX}{id}"),
        }
    }

    /// Parses a segment produced by [`Identity::storage_segment`].
    ///
    /// # Errors
    ///
    /// Returns `RecordError::InvalidIdentity` for unknown segments.
    pub fn parse_segment(segment: &str) -> Result<Self, RecordError> {
        if segment == ANONYMOUS_SEGMENT {
            return Ok(Self::Anonymous);
        }
        segment
            .strip_prefix(USER_SEGMENT_PREFIX)
            .ok_or_else(|| RecordError::InvalidIdentity(segment.to_owned()))
            .and_then(|raw| UserId::new(raw))
            .map(Self::User)
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identity({})", self.storage_segment())
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.storage_segment())
    }
}

impl TryFrom<String> for Identity {
    type Error = RecordError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse_segment(&value)
    }
}

impl From<Identity> for String {
    fn from(identity: Identity) -> Self {
        identity.storage_segment()
    }
}

// ─── Tests ─────────────────────────────────────────────────────────────────────
