//! Remote document store contract and an in-process implementation.
//!
//! The remote side holds per-course rating and comment documents plus mirrored
//! lesson/quiz events. Watches deliver the full matching document set on every
//! change, never deltas, in whatever order the backend keeps them.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

use lms_core::model::{Comment, CourseId, CourseRating, Identity, LessonId, QuizId, QuizResult};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum RemoteError {
    #[error("remote store unavailable")]
    Unavailable,

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("remote request failed: {0}")]
    Request(String),
}

/// Stream of full snapshots for one watch.
pub type Snapshots<T> = mpsc::UnboundedReceiver<Result<Vec<T>, RemoteError>>;

/// Mirrored lesson completion, keyed by `(user, course_id, lesson_id)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LessonCompletionDoc {
    pub user: Identity,
    pub course_id: CourseId,
    pub lesson_id: LessonId,
    pub completed_at: DateTime<Utc>,
    pub time_spent_secs: u64,
}

#[async_trait]
pub trait RemoteDocumentStore: Send + Sync {
    /// Upsert a lesson completion for `(user, course, lesson)`.
    ///
    /// # Errors
    ///
    /// Returns `RemoteError` on network or permission failures.
    async fn put_lesson_completion(&self, doc: LessonCompletionDoc) -> Result<(), RemoteError>;

    /// Upsert the quiz result for `(user, course, quiz)`.
    ///
    /// # Errors
    ///
    /// Returns `RemoteError` on network or permission failures.
    async fn put_quiz_result(&self, user: &Identity, result: &QuizResult)
    -> Result<(), RemoteError>;

    /// Append a rating document. Earlier ratings by the same user are kept.
    ///
    /// # Errors
    ///
    /// Returns `RemoteError` on network or permission failures.
    async fn add_rating(&self, rating: &CourseRating) -> Result<(), RemoteError>;

    /// All rating documents for a course.
    ///
    /// # Errors
    ///
    /// Returns `RemoteError` on network or permission failures.
    async fn ratings_for_course(&self, course_id: &CourseId)
    -> Result<Vec<CourseRating>, RemoteError>;

    /// Append a comment document.
    ///
    /// # Errors
    ///
    /// Returns `RemoteError` on network or permission failures.
    async fn add_comment(&self, comment: &Comment) -> Result<(), RemoteError>;

    /// Watch the rating documents of a course. The current set is sent first.
    ///
    /// # Errors
    ///
    /// Returns `RemoteError` if the watch cannot be established.
    async fn watch_ratings(&self, course_id: &CourseId)
    -> Result<Snapshots<CourseRating>, RemoteError>;

    /// Watch the comment documents of a course. The current set is sent first.
    ///
    /// # Errors
    ///
    /// Returns `RemoteError` if the watch cannot be established.
    async fn watch_comments(&self, course_id: &CourseId) -> Result<Snapshots<Comment>, RemoteError>;
}

type Watchers<T> = Vec<(CourseId, mpsc::UnboundedSender<Result<Vec<T>, RemoteError>>)>;

#[derive(Default)]
struct RemoteState {
    offline: bool,
    lessons: BTreeMap<(Identity, CourseId, LessonId), LessonCompletionDoc>,
    quizzes: BTreeMap<(Identity, CourseId, QuizId), QuizResult>,
    ratings: Vec<CourseRating>,
    comments: Vec<Comment>,
    rating_watchers: Watchers<CourseRating>,
    comment_watchers: Watchers<Comment>,
}

fn notify<T: Clone>(
    watchers: &mut Watchers<T>,
    course_id: &CourseId,
    docs: &[T],
    course_of: impl Fn(&T) -> &CourseId,
) {
    let snapshot: Vec<T> = docs
        .iter()
        .filter(|d| course_of(*d) == course_id)
        .cloned()
        .collect();
    watchers.retain(|(course, tx)| {
        if course != course_id {
            return true;
        }
        tx.send(Ok(snapshot.clone())).is_ok()
    });
}

/// In-process remote used by tests, demos and offline runs.
///
/// Documents are kept in insertion order, so snapshots arrive oldest first.
#[derive(Clone, Default)]
pub struct InMemoryRemote {
    state: Arc<Mutex<RemoteState>>,
}

impl InMemoryRemote {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every request fail with `RemoteError::Unavailable`.
    pub fn set_offline(&self, offline: bool) {
        if let Ok(mut guard) = self.state.lock() {
            guard.offline = offline;
        }
    }

    /// Push an error to every open watch on `course_id`.
    pub fn break_watches(&self, course_id: &CourseId, err: &RemoteError) {
        let Ok(mut guard) = self.state.lock() else {
            return;
        };
        guard
            .rating_watchers
            .retain(|(c, tx)| c != course_id || tx.send(Err(err.clone())).is_ok());
        guard
            .comment_watchers
            .retain(|(c, tx)| c != course_id || tx.send(Err(err.clone())).is_ok());
    }

    /// Mirrored lesson documents, for inspection.
    #[must_use]
    pub fn lesson_completions(&self) -> Vec<LessonCompletionDoc> {
        self.state
            .lock()
            .map(|s| s.lessons.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Mirrored quiz documents for `user`, for inspection.
    #[must_use]
    pub fn quiz_results(&self, user: &Identity) -> Vec<QuizResult> {
        self.state
            .lock()
            .map(|s| {
                s.quizzes
                    .iter()
                    .filter(|((u, _, _), _)| u == user)
                    .map(|(_, r)| r.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn with_state<R>(
        &self,
        f: impl FnOnce(&mut RemoteState) -> R,
    ) -> Result<R, RemoteError> {
        let mut guard = self
            .state
            .lock()
            .map_err(|e| RemoteError::Request(e.to_string()))?;
        if guard.offline {
            return Err(RemoteError::Unavailable);
        }
        Ok(f(&mut guard))
    }
}

#[async_trait]
impl RemoteDocumentStore for InMemoryRemote {
    async fn put_lesson_completion(&self, doc: LessonCompletionDoc) -> Result<(), RemoteError> {
        self.with_state(|s| {
            let key = (doc.user.clone(), doc.course_id.clone(), doc.lesson_id.clone());
            s.lessons.insert(key, doc);
        })
    }

    async fn put_quiz_result(
        &self,
        user: &Identity,
        result: &QuizResult,
    ) -> Result<(), RemoteError> {
        self.with_state(|s| {
            let (course, quiz) = result.key();
            s.quizzes.insert((user.clone(), course, quiz), result.clone());
        })
    }

    async fn add_rating(&self, rating: &CourseRating) -> Result<(), RemoteError> {
        self.with_state(|s| {
            s.ratings.push(rating.clone());
            let RemoteState {
                ratings,
                rating_watchers,
                ..
            } = s;
            notify(rating_watchers, &rating.course_id, ratings, |r| &r.course_id);
        })
    }

    async fn ratings_for_course(
        &self,
        course_id: &CourseId,
    ) -> Result<Vec<CourseRating>, RemoteError> {
        self.with_state(|s| {
            s.ratings
                .iter()
                .filter(|r| &r.course_id == course_id)
                .cloned()
                .collect()
        })
    }

    async fn add_comment(&self, comment: &Comment) -> Result<(), RemoteError> {
        self.with_state(|s| {
            s.comments.push(comment.clone());
            let RemoteState {
                comments,
                comment_watchers,
                ..
            } = s;
            notify(comment_watchers, comment.course_id(), comments, Comment::course_id);
        })
    }

    async fn watch_ratings(
        &self,
        course_id: &CourseId,
    ) -> Result<Snapshots<CourseRating>, RemoteError> {
        self.with_state(|s| {
            let (tx, rx) = mpsc::unbounded_channel();
            let initial: Vec<CourseRating> = s
                .ratings
                .iter()
                .filter(|r| &r.course_id == course_id)
                .cloned()
                .collect();
            if tx.send(Ok(initial)).is_ok() {
                s.rating_watchers.push((course_id.clone(), tx));
            }
            debug!(course = %course_id, "rating watch opened");
            rx
        })
    }

    async fn watch_comments(&self, course_id: &CourseId) -> Result<Snapshots<Comment>, RemoteError> {
        self.with_state(|s| {
            let (tx, rx) = mpsc::unbounded_channel();
            let initial: Vec<Comment> = s
                .comments
                .iter()
                .filter(|c| c.course_id() == course_id)
                .cloned()
                .collect();
            if tx.send(Ok(initial)).is_ok() {
                s.comment_watchers.push((course_id.clone(), tx));
            }
            debug!(course = %course_id, "comment watch opened");
            rx
        })
    }
}
