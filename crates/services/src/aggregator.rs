//! In-memory progress state and the derived views computed from it.

use std::collections::{BTreeMap, HashMap};

use lms_core::CalendarZone;
use lms_core::model::{
    ActivityIndex, CourseActivity, CourseId, CourseProgress, CourseRating, CourseTotals, Identity,
    IdentityActivity, LessonId, LessonProgress, QuizId, QuizResult, SavedCourses,
};
use lms_core::streak;

use crate::persistence::LocalSnapshot;

//
// ─── STATE ─────────────────────────────────────────────────────────────────────
//

/// Source records of the active identity. At most one record per key.
#[derive(Debug, Clone, Default)]
pub struct ProgressState {
    lessons: BTreeMap<(CourseId, LessonId), LessonProgress>,
    quizzes: BTreeMap<(CourseId, QuizId), QuizResult>,
    ratings: BTreeMap<(CourseId, Identity), CourseRating>,
    saved: SavedCourses,
}

impl ProgressState {
    /// Build from loaded blobs. Later duplicates win.
    #[must_use]
    pub fn from_snapshot(snapshot: LocalSnapshot) -> Self {
        Self {
            lessons: snapshot
                .lessons
                .into_iter()
                .filter(LessonProgress::is_completed)
                .map(|l| (l.key(), l))
                .collect(),
            quizzes: snapshot
                .quiz_results
                .into_iter()
                .map(|q| (q.key(), q))
                .collect(),
            ratings: snapshot
                .ratings
                .into_iter()
                .map(|r| (r.key(), r))
                .collect(),
            saved: snapshot.saved,
        }
    }

    pub fn upsert_lesson(&mut self, lesson: LessonProgress) {
        self.lessons.insert(lesson.key(), lesson);
    }

    /// Returns true if a record was removed.
    pub fn remove_lesson(&mut self, course_id: &CourseId, lesson_id: &LessonId) -> bool {
        self.lessons
            .remove(&(course_id.clone(), lesson_id.clone()))
            .is_some()
    }

    pub fn upsert_quiz(&mut self, result: QuizResult) {
        self.quizzes.insert(result.key(), result);
    }

    pub fn remove_quiz(&mut self, course_id: &CourseId, quiz_id: &QuizId) -> bool {
        self.quizzes
            .remove(&(course_id.clone(), quiz_id.clone()))
            .is_some()
    }

    pub fn upsert_rating(&mut self, rating: CourseRating) {
        self.ratings.insert(rating.key(), rating);
    }

    /// Returns true if the course is saved afterwards.
    pub fn toggle_saved(&mut self, course_id: CourseId) -> bool {
        self.saved.toggle(course_id)
    }

    #[must_use]
    pub fn lesson(&self, course_id: &CourseId, lesson_id: &LessonId) -> Option<&LessonProgress> {
        self.lessons.get(&(course_id.clone(), lesson_id.clone()))
    }

    #[must_use]
    pub fn quiz(&self, course_id: &CourseId, quiz_id: &QuizId) -> Option<&QuizResult> {
        self.quizzes.get(&(course_id.clone(), quiz_id.clone()))
    }

    #[must_use]
    pub fn rating(&self, course_id: &CourseId, user: &Identity) -> Option<&CourseRating> {
        self.ratings.get(&(course_id.clone(), user.clone()))
    }

    pub fn lessons(&self) -> impl Iterator<Item = &LessonProgress> {
        self.lessons.values()
    }

    pub fn quizzes(&self) -> impl Iterator<Item = &QuizResult> {
        self.quizzes.values()
    }

    pub fn ratings(&self) -> impl Iterator<Item = &CourseRating> {
        self.ratings.values()
    }

    /// Local ratings of one course, from any identity on this device.
    pub fn ratings_for<'a>(
        &'a self,
        course_id: &'a CourseId,
    ) -> impl Iterator<Item = &'a CourseRating> + 'a {
        self.ratings.values().filter(move |r| &r.course_id == course_id)
    }

    #[must_use]
    pub fn saved(&self) -> &SavedCourses {
        &self.saved
    }

    /// Index entry describing these records.
    #[must_use]
    pub fn activity(&self, zone: CalendarZone) -> IdentityActivity {
        let mut courses: BTreeMap<CourseId, CourseActivity> = BTreeMap::new();
        for lesson in self.lessons.values().filter(|l| l.is_completed()) {
            let entry = courses.entry(lesson.course_id().clone()).or_default();
            entry.lessons_completed = entry.lessons_completed.saturating_add(1);
        }
        for quiz in self.quizzes.values() {
            let entry = courses.entry(quiz.course_id().clone()).or_default();
            entry.quizzes_completed = entry.quizzes_completed.saturating_add(1);
        }
        let completion_days =
            streak::activity_days(self.lessons.values().filter_map(LessonProgress::completed_at), zone);
        IdentityActivity {
            courses,
            completion_days,
        }
    }
}

//
// ─── SELECTORS ─────────────────────────────────────────────────────────────────
//

/// Progress of one course, `None` if never started or if the course has no content.
#[must_use]
pub fn course_progress(
    state: &ProgressState,
    course_id: &CourseId,
    totals: CourseTotals,
) -> Option<CourseProgress> {
    CourseProgress::compute(course_id, totals, state.lessons(), state.quizzes())
}

/// Latest rating per user; the remote keeps every submission.
#[must_use]
pub fn latest_per_user(ratings: &[CourseRating]) -> Vec<&CourseRating> {
    let mut latest: HashMap<&Identity, &CourseRating> = HashMap::new();
    for rating in ratings {
        latest
            .entry(&rating.user)
            .and_modify(|kept| {
                if rating.rated_at >= kept.rated_at {
                    *kept = rating;
                }
            })
            .or_insert(rating);
    }
    let mut out: Vec<&CourseRating> = latest.into_values().collect();
    out.sort_by(|a, b| b.rated_at.cmp(&a.rated_at));
    out
}

/// Mean rating and count. Remote ratings win when there are any.
#[must_use]
pub fn rating_summary(
    state: &ProgressState,
    course_id: &CourseId,
    remote: &[CourseRating],
) -> (f64, usize) {
    let values: Vec<u8> = if remote.is_empty() {
        state.ratings_for(course_id).map(|r| r.rating.value()).collect()
    } else {
        latest_per_user(remote)
            .into_iter()
            .filter(|r| &r.course_id == course_id)
            .map(|r| r.rating.value())
            .collect()
    };
    if values.is_empty() {
        return (0.0, 0);
    }
    let sum: u32 = values.iter().map(|v| u32::from(*v)).sum();
    // At most a handful of ratings per course, so the f64 conversion is exact.
    #[allow(clippy::cast_precision_loss)]
    let mean = f64::from(sum) / values.len() as f64;
    (mean, values.len())
}

/// Distinct remote rating submitters, or device finishers when there are none.
#[must_use]
pub fn completed_students_count(
    course_id: &CourseId,
    remote: &[CourseRating],
    index: &ActivityIndex,
    totals: Option<CourseTotals>,
) -> usize {
    let submitters = latest_per_user(remote)
        .into_iter()
        .filter(|r| &r.course_id == course_id)
        .count();
    if submitters > 0 {
        return submitters;
    }
    index.count_finishers(course_id, totals)
}

//
// ─── MEMO ──────────────────────────────────────────────────────────────────────
//

/// Per-course progress cache valid for one state generation.
#[derive(Debug, Default)]
pub struct ProgressMemo {
    generation: u64,
    progress: HashMap<CourseId, Option<CourseProgress>>,
}

impl ProgressMemo {
    /// Cached value, or `compute()` stored under `generation`.
    pub fn get_or_compute(
        &mut self,
        generation: u64,
        course_id: &CourseId,
        compute: impl FnOnce() -> Option<CourseProgress>,
    ) -> Option<CourseProgress> {
        if self.generation != generation {
            self.progress.clear();
            self.generation = generation;
        }
        self.progress
            .entry(course_id.clone())
            .or_insert_with(compute)
            .clone()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.progress.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.progress.is_empty()
    }
}
