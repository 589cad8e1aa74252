use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::ids::CourseId;
use crate::model::lesson::LessonProgress;
use crate::model::quiz::QuizResult;

/// Lesson and quiz counts of a course as published in the content catalog.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CourseTotals {
    pub lessons: u32,
    pub quizzes: u32,
}

impl CourseTotals {
    #[must_use]
    pub fn new(lessons: u32, quizzes: u32) -> Self {
        Self { lessons, quizzes }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lessons == 0 && self.quizzes == 0
    }
}

/// Derived completion view of one course for one user.
///
/// Never persisted: rebuilt from lesson and quiz records on every read.
#[derive(Debug, Clone, PartialEq)]
pub struct CourseProgress {
    pub course_id: CourseId,
    pub total_lessons: u32,
    pub completed_lessons: u32,
    pub total_quizzes: u32,
    pub completed_quizzes: u32,
    pub average_quiz_score: f64,
    pub last_accessed: Option<DateTime<Utc>>,
    pub is_completed: bool,
    pub completed_at: Option<DateTime<Utc>>,
}

impl CourseProgress {
    /// Compute progress for `course_id` from the given records.
    ///
    /// Records for other courses are ignored. Returns `None` when no record
    /// belongs to the course or when the course has no lessons and no quizzes.
    /// Completed counts are clamped to `totals`.
    #[must_use]
    pub fn compute<'a>(
        course_id: &CourseId,
        totals: CourseTotals,
        lessons: impl IntoIterator<Item = &'a LessonProgress>,
        quizzes: impl IntoIterator<Item = &'a QuizResult>,
    ) -> Option<Self> {
        let mut any_record = false;
        let mut last_accessed: Option<DateTime<Utc>> = None;
        let mut touch = |at: Option<DateTime<Utc>>| {
            if let Some(at) = at {
                last_accessed = Some(last_accessed.map_or(at, |prev| prev.max(at)));
            }
        };

        let mut completed_lessons: u32 = 0;
        for lesson in lessons.into_iter().filter(|l| l.course_id() == course_id) {
            any_record = true;
            if lesson.is_completed() {
                completed_lessons = completed_lessons.saturating_add(1);
            }
            touch(lesson.completed_at());
        }

        let mut completed_quizzes: u32 = 0;
        let mut score_sum: u64 = 0;
        for quiz in quizzes.into_iter().filter(|q| q.course_id() == course_id) {
            any_record = true;
            completed_quizzes = completed_quizzes.saturating_add(1);
            score_sum += u64::from(quiz.score());
            touch(Some(quiz.completed_at()));
        }

        if !any_record || totals.is_empty() {
            return None;
        }

        // Scores are at most 100 and counts are small, so the f64 conversion is exact.
        #[allow(clippy::cast_precision_loss)]
        let average_quiz_score = if completed_quizzes == 0 {
            0.0
        } else {
            score_sum as f64 / f64::from(completed_quizzes)
        };

        let completed_lessons = completed_lessons.min(totals.lessons);
        let completed_quizzes = completed_quizzes.min(totals.quizzes);
        let is_completed = totals.lessons > 0
            && completed_lessons == totals.lessons
            && completed_quizzes == totals.quizzes;

        Some(Self {
            course_id: course_id.clone(),
            total_lessons: totals.lessons,
            completed_lessons,
            total_quizzes: totals.quizzes,
            completed_quizzes,
            average_quiz_score,
            last_accessed,
            is_completed,
            completed_at: if is_completed { last_accessed } else { None },
        })
    }

    /// `round(100 * completed / total)` over lessons and quizzes together.
    #[must_use]
    pub fn percentage(&self) -> u8 {
        percentage(
            self.completed_lessons + self.completed_quizzes,
            self.total_lessons + self.total_quizzes,
        )
    }
}

/// Rounded completion percentage; 0 when `total` is 0.
#[must_use]
pub fn percentage(completed: u32, total: u32) -> u8 {
    if total == 0 {
        return 0;
    }
    let completed = u64::from(completed.min(total));
    let total = u64::from(total);
    // Half-up rounding in integer arithmetic.
    let pct = (200 * completed + total) / (2 * total);
    u8::try_from(pct).unwrap_or(100)
}

/// Whether a course was ever started, and how far along it is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    NotStarted,
    Started { percentage: u8 },
}

impl Completion {
    #[must_use]
    pub fn from_progress(progress: Option<&CourseProgress>) -> Self {
        progress.map_or(Self::NotStarted, |p| Self::Started {
            percentage: p.percentage(),
        })
    }

    /// Percentage with "not started" reading as 0.
    #[must_use]
    pub fn percentage(self) -> u8 {
        match self {
            Self::NotStarted => 0,
            Self::Started { percentage } => percentage,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ids::{LessonId, QuizId};
    use crate::time::fixed_now;
    use chrono::Duration;
    use std::collections::BTreeMap;

    fn course() -> CourseId {
        CourseId::new("rust-101").unwrap()
    }

    fn lesson(course: &str, id: &str, minutes: i64) -> LessonProgress {
        LessonProgress::completed(
            CourseId::new(course).unwrap(),
            LessonId::new(id).unwrap(),
            fixed_now() + Duration::minutes(minutes),
            60,
        )
    }

    fn quiz(id: &str, score: u8, minutes: i64) -> QuizResult {
        QuizResult::new(
            course(),
            QuizId::new(id).unwrap(),
            score,
            4,
            fixed_now() + Duration::minutes(minutes),
            BTreeMap::new(),
        )
        .unwrap()
    }

    #[test]
    fn no_records_yields_none() {
        let other = lesson("other", "l1", 0);
        let progress =
            CourseProgress::compute(&course(), CourseTotals::new(3, 1), [&other], []);
        assert!(progress.is_none());
    }

    #[test]
    fn zero_totals_yields_none() {
        let l = lesson("rust-101", "l1", 0);
        assert!(CourseProgress::compute(&course(), CourseTotals::default(), [&l], []).is_none());
    }

    #[test]
    fn counts_average_and_last_access() {
        let l1 = lesson("rust-101", "l1", 0);
        let l2 = lesson("rust-101", "l2", 5);
        let q1 = quiz("q1", 80, 10);
        let q2 = quiz("q2", 90, 3);
        let progress = CourseProgress::compute(
            &course(),
            CourseTotals::new(4, 2),
            [&l1, &l2],
            [&q1, &q2],
        )
        .unwrap();

        assert_eq!(progress.completed_lessons, 2);
        assert_eq!(progress.completed_quizzes, 2);
        assert!((progress.average_quiz_score - 85.0).abs() < f64::EPSILON);
        assert_eq!(progress.last_accessed, Some(fixed_now() + Duration::minutes(10)));
        assert!(!progress.is_completed);
        assert_eq!(progress.completed_at, None);
        assert_eq!(progress.percentage(), 67);
    }

    #[test]
    fn completed_when_everything_done() {
        let l1 = lesson("rust-101", "l1", 0);
        let q1 = quiz("q1", 70, 1);
        let progress =
            CourseProgress::compute(&course(), CourseTotals::new(1, 1), [&l1], [&q1]).unwrap();
        assert!(progress.is_completed);
        assert_eq!(progress.completed_at, Some(fixed_now() + Duration::minutes(1)));
        assert_eq!(progress.percentage(), 100);
    }

    #[test]
    fn quiz_only_course_is_never_completed() {
        let q1 = quiz("q1", 70, 1);
        let progress =
            CourseProgress::compute(&course(), CourseTotals::new(0, 1), [], [&q1]).unwrap();
        assert!(!progress.is_completed);
        assert_eq!(progress.percentage(), 100);
    }

    #[test]
    fn counts_are_clamped_to_totals() {
        let l1 = lesson("rust-101", "l1", 0);
        let l2 = lesson("rust-101", "l2", 0);
        let progress =
            CourseProgress::compute(&course(), CourseTotals::new(1, 0), [&l1, &l2], []).unwrap();
        assert_eq!(progress.completed_lessons, 1);
        assert_eq!(progress.percentage(), 100);
    }

    #[test]
    fn percentage_rounds_half_up() {
        assert_eq!(percentage(2, 5), 40);
        assert_eq!(percentage(1, 3), 33);
        assert_eq!(percentage(2, 3), 67);
        assert_eq!(percentage(1, 8), 13);
        assert_eq!(percentage(0, 7), 0);
        assert_eq!(percentage(3, 0), 0);
    }

    #[test]
    fn completion_separates_not_started_from_zero() {
        assert_eq!(Completion::from_progress(None), Completion::NotStarted);
        assert_eq!(Completion::NotStarted.percentage(), 0);

        let progress = CourseProgress {
            course_id: course(),
            total_lessons: 4,
            completed_lessons: 0,
            total_quizzes: 0,
            completed_quizzes: 0,
            average_quiz_score: 0.0,
            last_accessed: None,
            is_completed: false,
            completed_at: None,
        };
        assert_eq!(
            Completion::from_progress(Some(&progress)),
            Completion::Started { percentage: 0 }
        );
    }
}
