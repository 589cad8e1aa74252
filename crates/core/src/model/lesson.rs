use chrono::{DateTime, Utc};

use crate::model::ids::{CourseId, LessonId};

/// Completion record for a single lesson.
///
/// Created when a lesson is marked complete. Unmarking deletes the record
/// rather than flipping `completed`, so a stored record normally reads as done.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LessonProgress {
    course_id: CourseId,
    lesson_id: LessonId,
    completed: bool,
    completed_at: Option<DateTime<Utc>>,
    time_spent_secs: u64,
}

impl LessonProgress {
    /// Record a lesson completed at `completed_at`.
    #[must_use]
    pub fn completed(
        course_id: CourseId,
        lesson_id: LessonId,
        completed_at: DateTime<Utc>,
        time_spent_secs: u64,
    ) -> Self {
        Self {
            course_id,
            lesson_id,
            completed: true,
            completed_at: Some(completed_at),
            time_spent_secs,
        }
    }

    /// Rehydrate a record from persisted storage.
    #[must_use]
    pub fn from_persisted(
        course_id: CourseId,
        lesson_id: LessonId,
        completed: bool,
        completed_at: Option<DateTime<Utc>>,
        time_spent_secs: u64,
    ) -> Self {
        Self {
            course_id,
            lesson_id,
            completed,
            completed_at,
            time_spent_secs,
        }
    }

    #[must_use]
    pub fn course_id(&self) -> &CourseId {
        &self.course_id
    }

    #[must_use]
    pub fn lesson_id(&self) -> &LessonId {
        &self.lesson_id
    }

    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.completed
    }

    #[must_use]
    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }

    #[must_use]
    pub fn time_spent_secs(&self) -> u64 {
        self.time_spent_secs
    }

    /// Map key: `(course_id, lesson_id)`.
    #[must_use]
    pub fn key(&self) -> (CourseId, LessonId) {
        (self.course_id.clone(), self.lesson_id.clone())
    }
}
