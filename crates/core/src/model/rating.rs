use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::RecordError;
use crate::model::ids::{CourseId, Identity};

/// Star rating in `1..=5`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Rating(u8);

impl Rating {
    /// # Errors
    ///
    /// Returns `RecordError::InvalidRating` outside `1..=5`.
    pub fn new(value: u8) -> Result<Self, RecordError> {
        if (1..=5).contains(&value) {
            Ok(Self(value))
        } else {
            Err(RecordError::InvalidRating(value))
        }
    }

    #[must_use]
    pub fn value(self) -> u8 {
        self.0
    }
}

impl TryFrom<u8> for Rating {
    type Error = RecordError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Rating> for u8 {
    fn from(rating: Rating) -> Self {
        rating.0
    }
}

/// A user's rating of a course. One per `(course_id, user)`; re-rating replaces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CourseRating {
    pub course_id: CourseId,
    pub user: Identity,
    pub rating: Rating,
    pub rated_at: DateTime<Utc>,
}

impl CourseRating {
    #[must_use]
    pub fn new(course_id: CourseId, user: Identity, rating: Rating, rated_at: DateTime<Utc>) -> Self {
        Self {
            course_id,
            user,
            rating,
            rated_at,
        }
    }

    /// Map key: `(course_id, user)`.
    #[must_use]
    pub fn key(&self) -> (CourseId, Identity) {
        (self.course_id.clone(), self.user.clone())
    }
}
