//! Loading and debounced saving of per-identity blobs.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::runtime::Handle;
use tracing::{debug, error};

use lms_core::model::{ActivityIndex, CourseRating, Identity, LessonProgress, QuizResult, SavedCourses};
use lms_storage::blobs::{self, ACTIVITY_INDEX_KEY};
use lms_storage::{BlobError, BlobKind, KeyValueStore};

use crate::config::StoreConfig;
use crate::debounce::Debouncer;

/// Everything stored locally for one identity.
#[derive(Debug, Clone, Default)]
pub struct LocalSnapshot {
    pub lessons: Vec<LessonProgress>,
    pub quiz_results: Vec<QuizResult>,
    pub ratings: Vec<CourseRating>,
    pub saved: SavedCourses,
}

/// Reads blobs on open and writes them back through a `Debouncer`.
///
/// Each blob loads independently: a missing, unreadable or corrupted blob
/// yields its empty default and never affects the others.
pub struct LocalPersistence {
    kv: Arc<dyn KeyValueStore>,
    debouncer: Debouncer,
    config: StoreConfig,
}

impl LocalPersistence {
    #[must_use]
    pub fn new(kv: Arc<dyn KeyValueStore>, runtime: Handle, config: StoreConfig) -> Self {
        let debouncer = Debouncer::new(Arc::clone(&kv), runtime);
        Self {
            kv,
            debouncer,
            config,
        }
    }

    /// Load every blob for `identity`. Unparseable timestamps fall back to `now`.
    pub async fn load(&self, identity: &Identity, now: DateTime<Utc>) -> LocalSnapshot {
        let lessons = self
            .load_blob(&BlobKind::Progress.key(identity), |raw| {
                blobs::decode_progress(raw, now)
            })
            .await;
        let quiz_results = self
            .load_blob(&BlobKind::QuizResults.key(identity), |raw| {
                blobs::decode_quiz_results(raw, now)
            })
            .await;
        let ratings = self
            .load_blob(&BlobKind::CourseRatings.key(identity), |raw| {
                blobs::decode_ratings(raw, now)
            })
            .await;
        let saved = self
            .load_blob(&BlobKind::SavedCourses.key(identity), blobs::decode_saved)
            .await;

        debug!(
            identity = %identity,
            lessons = lessons.len(),
            quizzes = quiz_results.len(),
            ratings = ratings.len(),
            saved = saved.len(),
            "loaded local progress"
        );
        LocalSnapshot {
            lessons,
            quiz_results,
            ratings,
            saved,
        }
    }

    pub async fn load_activity_index(&self) -> ActivityIndex {
        self.load_blob(ACTIVITY_INDEX_KEY, blobs::decode_activity_index)
            .await
    }

    /// Queue `raw` as the new value of `kind` for `identity`.
    pub fn schedule_save(&self, identity: &Identity, kind: BlobKind, raw: String) {
        self.debouncer
            .schedule(kind.key(identity), raw, self.config.debounce_for(kind));
    }

    pub fn schedule_index_save(&self, raw: String) {
        self.debouncer.schedule(
            ACTIVITY_INDEX_KEY.to_owned(),
            raw,
            self.config.progress_debounce,
        );
    }

    /// Write all queued blobs now.
    pub async fn flush(&self) -> usize {
        self.debouncer.flush().await
    }

    #[must_use]
    pub fn pending_keys(&self) -> Vec<String> {
        self.debouncer.pending_keys()
    }

    async fn load_blob<T: Default>(
        &self,
        key: &str,
        decode: impl FnOnce(&str) -> Result<T, BlobError>,
    ) -> T {
        let raw = match self.kv.get(key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return T::default(),
            Err(err) => {
                error!(key, error = %err, "failed to read blob, starting empty");
                return T::default();
            }
        };
        match decode(&raw) {
            Ok(value) => value,
            Err(err) => {
                error!(key, error = %err, "discarding unreadable blob");
                T::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lms_core::model::{CourseId, LessonId, UserId};
    use lms_core::time::fixed_now;
    use lms_storage::InMemoryKeyValueStore;

    fn persistence(kv: &InMemoryKeyValueStore) -> LocalPersistence {
        LocalPersistence::new(
            Arc::new(kv.clone()),
            Handle::current(),
            StoreConfig::default(),
        )
    }

    #[tokio::test]
    async fn corrupted_blob_does_not_block_siblings() {
        let kv = InMemoryKeyValueStore::new();
        let user = Identity::User(UserId::new("u1").unwrap());
        let lesson = LessonProgress::completed(
            CourseId::new("c1").unwrap(),
            LessonId::new("l1").unwrap(),
            fixed_now(),
            30,
        );
        kv.set(
            &BlobKind::Progress.key(&user),
            &blobs::encode_progress([&lesson]).unwrap(),
        )
        .await
        .unwrap();
        kv.set(&BlobKind::QuizResults.key(&user), "{not json")
            .await
            .unwrap();

        let snapshot = persistence(&kv).load(&user, fixed_now()).await;
        assert_eq!(snapshot.lessons, vec![lesson]);
        assert!(snapshot.quiz_results.is_empty());
        assert!(snapshot.saved.is_empty());
    }

    #[tokio::test]
    async fn missing_index_is_empty() {
        let kv = InMemoryKeyValueStore::new();
        assert!(persistence(&kv).load_activity_index().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn saved_courses_use_the_longer_window() {
        let kv = InMemoryKeyValueStore::new();
        let persistence = persistence(&kv);
        let who = Identity::Anonymous;

        persistence.schedule_save(&who, BlobKind::Progress, "[]".into());
        persistence.schedule_save(&who, BlobKind::SavedCourses, "[]".into());

        tokio::time::sleep(std::time::Duration::from_millis(350)).await;
        assert_eq!(persistence.pending_keys(), vec!["savedCourses:anonymous".to_owned()]);

        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        assert!(persistence.pending_keys().is_empty());
        assert_eq!(kv.write_count(), 2);
    }
}
