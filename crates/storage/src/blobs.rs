//! JSON shapes of the per-identity blobs and their conversion to domain records.
//!
//! Decoding is lenient per record: a missing, mistyped or unparseable timestamp
//! falls back to the supplied `now`, and a record with any other bad field is
//! skipped with a warning. Only a blob that is not a JSON array fails as a whole.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

use lms_core::RecordError;
use lms_core::model::{
    ActivityIndex, Answer, CourseId, CourseRating, Identity, LessonId, LessonProgress, QuestionId,
    QuizId, QuizResult, Rating, SavedCourses,
};

pub const ACTIVITY_INDEX_KEY: &str = "index:activity";

/// Logical blob kinds persisted per identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BlobKind {
    Progress,
    QuizResults,
    CourseRatings,
    SavedCourses,
}

impl BlobKind {
    pub const ALL: [BlobKind; 4] = [
        BlobKind::Progress,
        BlobKind::QuizResults,
        BlobKind::CourseRatings,
        BlobKind::SavedCourses,
    ];

    #[must_use]
    pub fn namespace(self) -> &'static str {
        match self {
            BlobKind::Progress => "progress",
            BlobKind::QuizResults => "quizResults",
            BlobKind::CourseRatings => "courseRatings",
            BlobKind::SavedCourses => "savedCourses",
        }
    }

    /// Storage key of this blob for `identity`.
    #[must_use]
    pub fn key(self, identity: &Identity) -> String {
        format!("{}:{}", self.namespace(), identity.storage_segment())
    }
}

impl fmt::Display for BlobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.namespace())
    }
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BlobError {
    #[error("malformed {kind} blob: {source}")]
    Malformed {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to encode {kind} blob: {source}")]
    Encode {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

fn malformed(kind: &'static str) -> impl FnOnce(serde_json::Error) -> BlobError {
    move |source| BlobError::Malformed { kind, source }
}

fn encode_err(kind: &'static str) -> impl FnOnce(serde_json::Error) -> BlobError {
    move |source| BlobError::Encode { kind, source }
}

fn format_ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_ts(kind: &'static str, raw: Option<&Value>, now: DateTime<Utc>) -> DateTime<Utc> {
    let Some(Value::String(text)) = raw else {
        warn!(blob = kind, value = ?raw, "timestamp is not a string, using now");
        return now;
    };
    match DateTime::parse_from_rfc3339(text) {
        Ok(at) => at.with_timezone(&Utc),
        Err(err) => {
            warn!(blob = kind, value = %text, error = %err, "unparseable timestamp, using now");
            now
        }
    }
}

/// Splits a blob into its array elements and deserializes each one on its own,
/// skipping the elements whose shape does not match.
fn decode_each<T: DeserializeOwned>(kind: &'static str, raw: &str) -> Result<Vec<T>, BlobError> {
    let elements: Vec<Value> = serde_json::from_str(raw).map_err(malformed(kind))?;
    Ok(elements
        .into_iter()
        .filter_map(|element| match serde_json::from_value(element) {
            Ok(record) => Some(record),
            Err(err) => {
                warn!(blob = kind, error = %err, "skipping malformed record");
                None
            }
        })
        .collect())
}

//
// ─── LESSON PROGRESS ───────────────────────────────────────────────────────────
//

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StoredLesson {
    course_id: String,
    lesson_id: String,
    completed: bool,
    completed_at: Option<String>,
    time_spent: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoadedLesson {
    course_id: String,
    lesson_id: String,
    completed: bool,
    #[serde(default)]
    completed_at: Option<Value>,
    #[serde(default)]
    time_spent: u64,
}

/// # Errors
///
/// Returns `BlobError::Encode` if serialization fails.
pub fn encode_progress<'a>(
    records: impl IntoIterator<Item = &'a LessonProgress>,
) -> Result<String, BlobError> {
    let stored: Vec<StoredLesson> = records
        .into_iter()
        .map(|r| StoredLesson {
            course_id: r.course_id().to_string(),
            lesson_id: r.lesson_id().to_string(),
            completed: r.is_completed(),
            completed_at: r.completed_at().map(format_ts),
            time_spent: r.time_spent_secs(),
        })
        .collect();
    serde_json::to_string(&stored).map_err(encode_err("progress"))
}

/// # Errors
///
/// Returns `BlobError::Malformed` if `raw` is not a JSON array.
pub fn decode_progress(raw: &str, now: DateTime<Utc>) -> Result<Vec<LessonProgress>, BlobError> {
    let stored: Vec<LoadedLesson> = decode_each("progress", raw)?;
    let mut out = Vec::with_capacity(stored.len());
    for s in stored {
        let ids = CourseId::new(s.course_id).and_then(|c| Ok((c, LessonId::new(s.lesson_id)?)));
        let (course_id, lesson_id) = match ids {
            Ok(ids) => ids,
            Err(err) => {
                warn!(blob = "progress", error = %err, "skipping lesson record");
                continue;
            }
        };
        let completed_at = match &s.completed_at {
            None | Some(Value::Null) => None,
            Some(raw) => Some(parse_ts("progress", Some(raw), now)),
        };
        out.push(LessonProgress::from_persisted(
            course_id,
            lesson_id,
            s.completed,
            completed_at,
            s.time_spent,
        ));
    }
    Ok(out)
}

//
// ─── QUIZ RESULTS ──────────────────────────────────────────────────────────────
//

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StoredQuiz {
    course_id: String,
    quiz_id: String,
    score: u8,
    total_questions: u32,
    completed_at: String,
    answers: BTreeMap<String, Answer>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoadedQuiz {
    course_id: String,
    quiz_id: String,
    score: u8,
    total_questions: u32,
    #[serde(default)]
    completed_at: Option<Value>,
    #[serde(default)]
    answers: BTreeMap<String, Answer>,
}

/// # Errors
///
/// Returns `BlobError::Encode` if serialization fails.
pub fn encode_quiz_results<'a>(
    records: impl IntoIterator<Item = &'a QuizResult>,
) -> Result<String, BlobError> {
    let stored: Vec<StoredQuiz> = records
        .into_iter()
        .map(|r| StoredQuiz {
            course_id: r.course_id().to_string(),
            quiz_id: r.quiz_id().to_string(),
            score: r.score(),
            total_questions: r.total_questions(),
            completed_at: format_ts(r.completed_at()),
            answers: r
                .answers()
                .iter()
                .map(|(q, a)| (q.to_string(), a.clone()))
                .collect(),
        })
        .collect();
    serde_json::to_string(&stored).map_err(encode_err("quizResults"))
}

fn build_quiz(s: LoadedQuiz, completed_at: DateTime<Utc>) -> Result<QuizResult, RecordError> {
    let answers = s
        .answers
        .into_iter()
        .map(|(q, a)| QuestionId::new(q).map(|q| (q, a)))
        .collect::<Result<BTreeMap<_, _>, RecordError>>()?;
    QuizResult::new(
        CourseId::new(s.course_id)?,
        QuizId::new(s.quiz_id)?,
        s.score,
        s.total_questions,
        completed_at,
        answers,
    )
}

/// # Errors
///
/// Returns `BlobError::Malformed` if `raw` is not a JSON array.
pub fn decode_quiz_results(raw: &str, now: DateTime<Utc>) -> Result<Vec<QuizResult>, BlobError> {
    let stored: Vec<LoadedQuiz> = decode_each("quizResults", raw)?;
    let mut out = Vec::with_capacity(stored.len());
    for s in stored {
        let completed_at = parse_ts("quizResults", s.completed_at.as_ref(), now);
        let built = build_quiz(s, completed_at);
        match built {
            Ok(result) => out.push(result),
            Err(err) => warn!(blob = "quizResults", error = %err, "skipping quiz record"),
        }
    }
    Ok(out)
}

//
// ─── COURSE RATINGS ────────────────────────────────────────────────────────────
//

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StoredRating {
    course_id: String,
    user_id: String,
    rating: u8,
    rated_at: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoadedRating {
    course_id: String,
    user_id: String,
    rating: u8,
    #[serde(default)]
    rated_at: Option<Value>,
}

/// # Errors
///
/// Returns `BlobError::Encode` if serialization fails.
pub fn encode_ratings<'a>(
    records: impl IntoIterator<Item = &'a CourseRating>,
) -> Result<String, BlobError> {
    let stored: Vec<StoredRating> = records
        .into_iter()
        .map(|r| StoredRating {
            course_id: r.course_id.to_string(),
            user_id: r.user.storage_segment(),
            rating: r.rating.value(),
            rated_at: format_ts(r.rated_at),
        })
        .collect();
    serde_json::to_string(&stored).map_err(encode_err("courseRatings"))
}

/// # Errors
///
/// Returns `BlobError::Malformed` if `raw` is not a JSON array.
pub fn decode_ratings(raw: &str, now: DateTime<Utc>) -> Result<Vec<CourseRating>, BlobError> {
    let stored: Vec<LoadedRating> = decode_each("courseRatings", raw)?;
    let mut out = Vec::with_capacity(stored.len());
    for s in stored {
        let rated_at = parse_ts("courseRatings", s.rated_at.as_ref(), now);
        let built = CourseId::new(s.course_id).and_then(|course_id| {
            Ok(CourseRating::new(
                course_id,
                Identity::parse_segment(&s.user_id)?,
                Rating::new(s.rating)?,
                rated_at,
            ))
        });
        match built {
            Ok(rating) => out.push(rating),
            Err(err) => warn!(blob = "courseRatings", error = %err, "skipping rating record"),
        }
    }
    Ok(out)
}

//
// ─── SAVED COURSES / INDEX ─────────────────────────────────────────────────────
//

/// # Errors
///
/// Returns `BlobError::Encode` if serialization fails.
pub fn encode_saved(saved: &SavedCourses) -> Result<String, BlobError> {
    serde_json::to_string(saved).map_err(encode_err("savedCourses"))
}

/// Invalid ids are dropped individually.
///
/// # Errors
///
/// Returns `BlobError::Malformed` if `raw` is not a string array.
pub fn decode_saved(raw: &str) -> Result<SavedCourses, BlobError> {
    let stored: Vec<String> = serde_json::from_str(raw).map_err(malformed("savedCourses"))?;
    Ok(stored
        .into_iter()
        .filter_map(|id| CourseId::new(id).ok())
        .collect())
}

/// # Errors
///
/// Returns `BlobError::Encode` if serialization fails.
pub fn encode_activity_index(index: &ActivityIndex) -> Result<String, BlobError> {
    serde_json::to_string(index).map_err(encode_err("activityIndex"))
}

/// # Errors
///
/// Returns `BlobError::Malformed` if `raw` is not an activity index.
pub fn decode_activity_index(raw: &str) -> Result<ActivityIndex, BlobError> {
    serde_json::from_str(raw).map_err(malformed("activityIndex"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use lms_core::model::UserId;
    use lms_core::time::fixed_now;

    fn course() -> CourseId {
        CourseId::new("rust-101").unwrap()
    }

    #[test]
    fn keys_are_scoped_by_kind_and_identity() {
        let user = Identity::User(UserId::new("u1").unwrap());
        assert_eq!(BlobKind::Progress.key(&user), "progress:user:u1");
        assert_eq!(
            BlobKind::SavedCourses.key(&Identity::Anonymous),
            "savedCourses:anonymous"
        );
    }

    #[test]
    fn progress_survives_encode_decode() {
        let record = LessonProgress::completed(
            course(),
            LessonId::new("l1").unwrap(),
            fixed_now(),
            42,
        );
        let raw = encode_progress([&record]).unwrap();
        let back = decode_progress(&raw, Utc::now()).unwrap();
        assert_eq!(back, vec![record]);
    }

    #[test]
    fn bad_timestamp_falls_back_to_now() {
        let raw = r#"[{"courseId":"c1","lessonId":"l1","completed":true,"completedAt":"yesterday-ish","timeSpent":5}]"#;
        let back = decode_progress(raw, fixed_now()).unwrap();
        assert_eq!(back.len(), 1);
        assert_eq!(back[0].completed_at(), Some(fixed_now()));
    }

    #[test]
    fn quiz_with_null_timestamp_keeps_its_neighbours() {
        let raw = r#"[
            {"courseId":"c1","quizId":"q1","score":80,"totalQuestions":5,"completedAt":"2024-01-01T00:00:00Z"},
            {"courseId":"c1","quizId":"q2","score":60,"totalQuestions":5,"completedAt":null},
            {"courseId":"c1","quizId":"q3","score":40,"totalQuestions":5}
        ]"#;
        let back = decode_quiz_results(raw, fixed_now()).unwrap();
        assert_eq!(back.len(), 3);
        assert_ne!(back[0].completed_at(), fixed_now());
        assert_eq!(back[1].completed_at(), fixed_now());
        assert_eq!(back[2].completed_at(), fixed_now());
    }

    #[test]
    fn rating_with_numeric_timestamp_falls_back_to_now() {
        let raw = r#"[
            {"courseId":"c1","userId":"user:u1","rating":5,"ratedAt":"2024-01-01T00:00:00Z"},
            {"courseId":"c1","userId":"user:u2","rating":3,"ratedAt":1704067200000}
        ]"#;
        let back = decode_ratings(raw, fixed_now()).unwrap();
        assert_eq!(back.len(), 2);
        assert_eq!(back[1].rated_at, fixed_now());
        assert_eq!(back[1].rating.value(), 3);
    }

    #[test]
    fn mistyped_fields_skip_only_that_record() {
        let raw = r#"[
            {"courseId":"c1","lessonId":"l1","completed":"yes","completedAt":"2024-01-01T00:00:00Z"},
            {"courseId":"c1","lessonId":"l2","completed":true,"completedAt":"2024-01-01T00:00:00Z","timeSpent":7},
            42
        ]"#;
        let back = decode_progress(raw, fixed_now()).unwrap();
        assert_eq!(back.len(), 1);
        assert_eq!(back[0].lesson_id().as_str(), "l2");

        let ratings = r#"[{"courseId":"c1","userId":"user:u1","rating":"five"}]"#;
        assert!(decode_ratings(ratings, fixed_now()).unwrap().is_empty());
    }

    #[test]
    fn invalid_records_are_skipped_not_fatal() {
        let raw = r#"[
            {"courseId":"c1","quizId":"q1","score":150,"totalQuestions":3,"completedAt":"2024-01-01T00:00:00Z"},
            {"courseId":"c1","quizId":"q2","score":90,"totalQuestions":3,"completedAt":"2024-01-01T00:00:00Z","answers":{"a":1}}
        ]"#;
        let back = decode_quiz_results(raw, fixed_now()).unwrap();
        assert_eq!(back.len(), 1);
        assert_eq!(back[0].quiz_id().as_str(), "q2");
        assert_eq!(back[0].answers().len(), 1);
    }

    #[test]
    fn malformed_blob_is_an_error() {
        let err = decode_quiz_results("{not json", fixed_now()).unwrap_err();
        assert!(matches!(err, BlobError::Malformed { kind: "quizResults", .. }));
    }

    #[test]
    fn ratings_keep_identity() {
        let rating = CourseRating::new(
            course(),
            Identity::User(UserId::new("u1").unwrap()),
            Rating::new(4).unwrap(),
            fixed_now(),
        );
        let raw = encode_ratings([&rating]).unwrap();
        assert!(raw.contains("\"userId\":\"user:u1\""));
        assert_eq!(decode_ratings(&raw, Utc::now()).unwrap(), vec![rating]);
    }

    #[test]
    fn saved_courses_drop_blank_ids() {
        let saved = decode_saved(r#"["a", " ", "b"]"#).unwrap();
        assert_eq!(saved.len(), 2);
    }
}
