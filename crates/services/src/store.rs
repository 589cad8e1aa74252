use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::runtime::Handle;
use tracing::{debug, error, info, warn};

use lms_core::model::{
    ActivityIndex, Answer, Comment, Completion, CourseId, CourseProgress, CourseRating,
    CourseTotals, Identity, LessonId, LessonProgress, QuestionId, QuizId, QuizResult, Rating,
};
use lms_core::{Clock, streak};
use lms_storage::blobs;
use lms_storage::{BlobKind, RemoteDocumentStore, Storage};

use crate::aggregator::{self, ProgressMemo, ProgressState};
use crate::catalog::CourseCatalog;
use crate::config::StoreConfig;
use crate::error::{CatalogError, StoreError, SyncError};
use crate::persistence::LocalPersistence;
use crate::sync::{RemoteSync, Subscription};

/// Collaborators a `ProgressStore` is built from.
#[derive(Clone)]
pub struct StoreDeps {
    pub storage: Storage,
    pub catalog: Arc<dyn CourseCatalog>,
    pub clock: Clock,
}

impl StoreDeps {
    #[must_use]
    pub fn new(storage: Storage, catalog: Arc<dyn CourseCatalog>, clock: Clock) -> Self {
        Self {
            storage,
            catalog,
            clock,
        }
    }

    /// Dependencies backed by a migrated SQLite database.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Sqlite` if the database cannot be opened or migrated.
    pub async fn sqlite(
        database_url: &str,
        remote: Arc<dyn RemoteDocumentStore>,
        catalog: Arc<dyn CourseCatalog>,
        clock: Clock,
    ) -> Result<Self, StoreError> {
        let storage = Storage::sqlite(database_url, remote).await?;
        Ok(Self::new(storage, catalog, clock))
    }
}

struct StoreInner {
    clock: Clock,
    state: ProgressState,
    totals: HashMap<CourseId, CourseTotals>,
    index: ActivityIndex,
    generation: u64,
    memo: ProgressMemo,
}

/// Progress tracking for one identity on this device.
///
/// Mutations apply to memory first and return immediately. Blob writes are
/// debounced and remote mirrors run in the background; neither is awaited and
/// neither failure is reported to the caller. Call `close` before switching
/// identity so queued writes land.
pub struct ProgressStore {
    identity: Identity,
    config: StoreConfig,
    catalog: Arc<dyn CourseCatalog>,
    persistence: LocalPersistence,
    sync: RemoteSync,
    inner: Mutex<StoreInner>,
}

impl ProgressStore {
    /// Load `identity`'s records and the device activity index, then pull
    /// course totals from the catalog.
    ///
    /// A catalog failure is logged; totals stay unknown until
    /// `refresh_catalog` or `register_course_totals` succeeds.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NoRuntime` when called outside a tokio runtime.
    pub async fn open(
        identity: Identity,
        deps: StoreDeps,
        config: StoreConfig,
    ) -> Result<Self, StoreError> {
        let runtime = Handle::try_current()?;
        let persistence =
            LocalPersistence::new(Arc::clone(&deps.storage.local), runtime.clone(), config);
        let sync = RemoteSync::new(Arc::clone(&deps.storage.remote), runtime);

        let snapshot = persistence.load(&identity, deps.clock.now()).await;
        let mut index = persistence.load_activity_index().await;
        let state = ProgressState::from_snapshot(snapshot);

        // The index may predate records written by an older build or lost to a crash.
        let activity = state.activity(config.calendar);
        let in_sync = index
            .get(&identity)
            .map_or(activity.is_empty(), |known| *known == activity);
        if !in_sync {
            index.replace(identity.clone(), activity);
            match blobs::encode_activity_index(&index) {
                Ok(raw) => persistence.schedule_index_save(raw),
                Err(err) => error!(error = %err, "failed to encode activity index"),
            }
        }

        let store = Self {
            identity,
            config,
            catalog: deps.catalog,
            persistence,
            sync,
            inner: Mutex::new(StoreInner {
                clock: deps.clock,
                state,
                totals: HashMap::new(),
                index,
                generation: 0,
                memo: ProgressMemo::default(),
            }),
        };
        if let Err(err) = store.refresh_catalog().await {
            warn!(error = %err, "course catalog unavailable, totals unknown");
        }
        info!(identity = %store.identity, "progress store opened");
        Ok(store)
    }

    /// Write queued blobs and wait for in-flight mirrors. Returns the number
    /// of blobs written.
    pub async fn close(self) -> usize {
        let written = self.persistence.flush().await;
        self.sync.settle().await;
        info!(identity = %self.identity, written, "progress store closed");
        written
    }

    /// Wait for every background remote write spawned so far.
    pub async fn settle_remote_writes(&self) {
        self.sync.settle().await;
    }

    #[must_use]
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Replace the clock used to stamp new records.
    pub fn set_clock(&self, clock: Clock) {
        self.lock().clock = clock;
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn now(&self) -> chrono::DateTime<chrono::Utc> {
        self.lock().clock.now()
    }

    /// Apply `change`; when it reports a change, persist `kind` and refresh
    /// this identity's index entry.
    fn mutate(&self, kind: BlobKind, change: impl FnOnce(&mut ProgressState) -> bool) -> bool {
        let mut inner = self.lock();
        if !change(&mut inner.state) {
            return false;
        }
        inner.generation += 1;

        let encoded = match kind {
            BlobKind::Progress => blobs::encode_progress(inner.state.lessons()),
            BlobKind::QuizResults => blobs::encode_quiz_results(inner.state.quizzes()),
            BlobKind::CourseRatings => blobs::encode_ratings(inner.state.ratings()),
            BlobKind::SavedCourses => blobs::encode_saved(inner.state.saved()),
        };
        match encoded {
            Ok(raw) => self.persistence.schedule_save(&self.identity, kind, raw),
            Err(err) => error!(blob = %kind, error = %err, "failed to encode blob"),
        }

        if matches!(kind, BlobKind::Progress | BlobKind::QuizResults) {
            let activity = inner.state.activity(self.config.calendar);
            inner.index.replace(self.identity.clone(), activity);
            match blobs::encode_activity_index(&inner.index) {
                Ok(raw) => self.persistence.schedule_index_save(raw),
                Err(err) => error!(error = %err, "failed to encode activity index"),
            }
        }
        true
    }

    //
    // ─── LESSONS ───────────────────────────────────────────────────────────────
    //

    /// Record a completed lesson and mirror it remotely. Re-marking restamps it.
    pub fn mark_lesson_complete(
        &self,
        course_id: &CourseId,
        lesson_id: &LessonId,
        time_spent_secs: u64,
    ) {
        let now = self.now();
        let lesson =
            LessonProgress::completed(course_id.clone(), lesson_id.clone(), now, time_spent_secs);
        self.mutate(BlobKind::Progress, |state| {
            state.upsert_lesson(lesson);
            true
        });
        debug!(course = %course_id, lesson = %lesson_id, "lesson marked complete");
        self.sync
            .mirror_lesson_completion(&self.identity, course_id, lesson_id, now, time_spent_secs);
    }

    /// Remove the lesson record entirely. Not mirrored remotely.
    ///
    /// Returns false if the lesson was not complete.
    pub fn unmark_lesson_complete(&self, course_id: &CourseId, lesson_id: &LessonId) -> bool {
        self.mutate(BlobKind::Progress, |state| {
            state.remove_lesson(course_id, lesson_id)
        })
    }

    #[must_use]
    pub fn is_lesson_complete(&self, course_id: &CourseId, lesson_id: &LessonId) -> bool {
        self.lock()
            .state
            .lesson(course_id, lesson_id)
            .is_some_and(LessonProgress::is_completed)
    }

    //
    // ─── QUIZZES ───────────────────────────────────────────────────────────────
    //

    /// Store a quiz attempt, replacing any earlier one for the same quiz.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Record` if `score` exceeds 100 or
    /// `total_questions` is 0; nothing is stored.
    pub fn save_quiz_result(
        &self,
        course_id: &CourseId,
        quiz_id: &QuizId,
        score: u8,
        total_questions: u32,
        answers: BTreeMap<QuestionId, Answer>,
    ) -> Result<QuizResult, StoreError> {
        let result = QuizResult::new(
            course_id.clone(),
            quiz_id.clone(),
            score,
            total_questions,
            self.now(),
            answers,
        )?;
        let stored = result.clone();
        self.mutate(BlobKind::QuizResults, |state| {
            state.upsert_quiz(stored);
            true
        });
        debug!(course = %course_id, quiz = %quiz_id, score, "quiz result saved");
        self.sync.mirror_quiz_result(&self.identity, &result);
        Ok(result)
    }

    /// Returns false if there was no result to remove.
    pub fn remove_quiz_result(&self, course_id: &CourseId, quiz_id: &QuizId) -> bool {
        self.mutate(BlobKind::QuizResults, |state| {
            state.remove_quiz(course_id, quiz_id)
        })
    }

    #[must_use]
    pub fn quiz_result(&self, course_id: &CourseId, quiz_id: &QuizId) -> Option<QuizResult> {
        self.lock().state.quiz(course_id, quiz_id).cloned()
    }

    //
    // ─── RATINGS ───────────────────────────────────────────────────────────────
    //

    /// Rate a course locally. A later rating by the same identity replaces it.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Record` if `value` is outside 1..=5.
    pub fn rate_course(&self, course_id: &CourseId, value: u8) -> Result<CourseRating, StoreError> {
        let rating = CourseRating::new(
            course_id.clone(),
            self.identity.clone(),
            Rating::new(value)?,
            self.now(),
        );
        let stored = rating.clone();
        self.mutate(BlobKind::CourseRatings, |state| {
            state.upsert_rating(stored);
            true
        });
        Ok(rating)
    }

    /// Send a rating to the remote store in the background. It counts toward
    /// remote aggregates only once acknowledged; a rejected write is logged.
    ///
    /// # Errors
    ///
    /// Returns `SyncError::Record` if `value` is outside 1..=5.
    pub fn add_course_rating_remote(
        &self,
        course_id: &CourseId,
        value: u8,
    ) -> Result<CourseRating, SyncError> {
        let rating = CourseRating::new(
            course_id.clone(),
            self.identity.clone(),
            Rating::new(value)?,
            self.now(),
        );
        self.sync.add_course_rating(&rating);
        Ok(rating)
    }

    /// Pull the remote rating set for `course_id`.
    ///
    /// # Errors
    ///
    /// Returns `SyncError::Remote` if the fetch fails.
    pub async fn refresh_ratings(&self, course_id: &CourseId) -> Result<(), SyncError> {
        self.sync.refresh_ratings(course_id).await
    }

    #[must_use]
    pub fn user_rating(&self, course_id: &CourseId) -> Option<Rating> {
        self.lock()
            .state
            .rating(course_id, &self.identity)
            .map(|r| r.rating)
    }

    /// Mean rating, 0.0 when unrated. Uses remote ratings when any are known.
    #[must_use]
    pub fn average_rating(&self, course_id: &CourseId) -> f64 {
        let remote = self.sync.cached_ratings(course_id);
        aggregator::rating_summary(&self.lock().state, course_id, &remote).0
    }

    #[must_use]
    pub fn rating_count(&self, course_id: &CourseId) -> usize {
        let remote = self.sync.cached_ratings(course_id);
        aggregator::rating_summary(&self.lock().state, course_id, &remote).1
    }

    //
    // ─── SAVED COURSES ─────────────────────────────────────────────────────────
    //

    /// Returns true if the course is saved afterwards.
    pub fn toggle_saved_course(&self, course_id: &CourseId) -> bool {
        let mut saved = false;
        self.mutate(BlobKind::SavedCourses, |state| {
            saved = state.toggle_saved(course_id.clone());
            true
        });
        saved
    }

    #[must_use]
    pub fn is_course_saved(&self, course_id: &CourseId) -> bool {
        self.lock().state.saved().contains(course_id)
    }

    #[must_use]
    pub fn saved_courses(&self) -> Vec<CourseId> {
        self.lock().state.saved().iter().cloned().collect()
    }

    //
    // ─── PROGRESS ──────────────────────────────────────────────────────────────
    //

    /// Record totals for a course the catalog does not (yet) know.
    pub fn register_course_totals(&self, course_id: &CourseId, totals: CourseTotals) {
        let mut inner = self.lock();
        inner.totals.insert(course_id.clone(), totals);
        inner.generation += 1;
    }

    #[must_use]
    pub fn course_totals(&self, course_id: &CourseId) -> Option<CourseTotals> {
        self.lock().totals.get(course_id).copied()
    }

    /// Reload course totals from the catalog. Returns how many courses it lists.
    ///
    /// # Errors
    ///
    /// Returns `CatalogError` if the catalog cannot be read; known totals are kept.
    pub async fn refresh_catalog(&self) -> Result<usize, CatalogError> {
        let courses = self.catalog.courses().await?;
        let count = courses.len();
        let mut inner = self.lock();
        for outline in courses {
            let totals = outline.totals();
            inner.totals.insert(outline.course_id, totals);
        }
        inner.generation += 1;
        debug!(courses = count, "course totals refreshed");
        Ok(count)
    }

    /// `None` if the course was never started or its totals are unknown or zero.
    #[must_use]
    pub fn course_progress(&self, course_id: &CourseId) -> Option<CourseProgress> {
        let mut guard = self.lock();
        let StoreInner {
            state,
            totals,
            generation,
            memo,
            ..
        } = &mut *guard;
        let course_totals = totals.get(course_id).copied().unwrap_or_default();
        memo.get_or_compute(*generation, course_id, || {
            aggregator::course_progress(&*state, course_id, course_totals)
        })
    }

    /// Rounded percentage; 0 both for "not started" and "nothing done yet".
    #[must_use]
    pub fn course_progress_percentage(&self, course_id: &CourseId) -> u8 {
        self.course_completion(course_id).percentage()
    }

    #[must_use]
    pub fn course_completion(&self, course_id: &CourseId) -> Completion {
        Completion::from_progress(self.course_progress(course_id).as_ref())
    }

    /// Distinct remote raters of the course when known, otherwise identities
    /// on this device whose counts match `totals` (any activity if `None`).
    #[must_use]
    pub fn completed_students_count(
        &self,
        course_id: &CourseId,
        totals: Option<CourseTotals>,
    ) -> usize {
        let remote = self.sync.cached_ratings(course_id);
        aggregator::completed_students_count(course_id, &remote, &self.lock().index, totals)
    }

    /// Consecutive days with a lesson completion by anyone on this device,
    /// ending today or yesterday.
    #[must_use]
    pub fn current_streak(&self) -> u32 {
        let inner = self.lock();
        let today = self.config.calendar.date_of(inner.clock.now());
        streak::current_streak(&inner.index.all_completion_days(), today)
    }

    //
    // ─── FEEDS ─────────────────────────────────────────────────────────────────
    //

    pub fn subscribe_ratings<F>(&self, course_id: &CourseId, callback: F) -> Subscription
    where
        F: FnMut(Vec<CourseRating>) + Send + 'static,
    {
        self.sync.subscribe_ratings(course_id, callback)
    }

    pub fn subscribe_comments<F>(&self, course_id: &CourseId, callback: F) -> Subscription
    where
        F: FnMut(Vec<Comment>) + Send + 'static,
    {
        self.sync.subscribe_comments(course_id, callback)
    }

    /// Post a comment as this identity. The remote write runs in the
    /// background; a rejected write is logged.
    ///
    /// # Errors
    ///
    /// Returns `SyncError::Record` for an empty author or empty/oversized content.
    pub fn add_comment(
        &self,
        course_id: &CourseId,
        author: &str,
        content: &str,
    ) -> Result<Comment, SyncError> {
        let now = self.now();
        self.sync
            .add_comment(&self.identity, course_id, author, content, now)
    }

    /// Blob keys with a write still queued.
    #[must_use]
    pub fn pending_writes(&self) -> Vec<String> {
        self.persistence.pending_keys()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{CourseOutline, StaticCatalog};
    use lms_core::CalendarZone;
    use lms_core::time::fixed_now;
    use lms_core::model::{ActivityIndex, CourseActivity, IdentityActivity};
    use lms_storage::{InMemoryKeyValueStore, InMemoryRemote, KeyValueStore};

    fn id<T: std::str::FromStr>(raw: &str) -> T
    where
        T::Err: std::fmt::Debug,
    {
        raw.parse().unwrap()
    }

    async fn open_store(kv: &InMemoryKeyValueStore, identity: Identity) -> ProgressStore {
        let catalog = StaticCatalog::new([CourseOutline {
            course_id: id("c1"),
            title: "Intro".into(),
            lesson_ids: vec![id("l1"), id("l2"), id("l3"), id("l4")],
            quiz_ids: vec![id("q1")],
        }]);
        let deps = StoreDeps::new(
            Storage::new(Arc::new(kv.clone()), Arc::new(InMemoryRemote::new())),
            Arc::new(catalog),
            Clock::fixed(fixed_now()),
        );
        let config = StoreConfig {
            calendar: CalendarZone::utc(),
            ..StoreConfig::default()
        };
        ProgressStore::open(identity, deps, config).await.unwrap()
    }

    #[tokio::test]
    async fn catalog_totals_drive_progress() {
        let kv = InMemoryKeyValueStore::new();
        let store = open_store(&kv, Identity::Anonymous).await;
        let c1: CourseId = id("c1");

        assert_eq!(store.course_totals(&c1), Some(CourseTotals::new(4, 1)));
        assert_eq!(store.course_completion(&c1), Completion::NotStarted);

        store.mark_lesson_complete(&c1, &id("l1"), 30);
        store.mark_lesson_complete(&c1, &id("l2"), 30);
        assert_eq!(store.course_progress_percentage(&c1), 40);
        assert_eq!(store.course_completion(&c1), Completion::Started { percentage: 40 });
    }

    #[tokio::test]
    async fn memo_invalidates_on_mutation() {
        let kv = InMemoryKeyValueStore::new();
        let store = open_store(&kv, Identity::Anonymous).await;
        let c1: CourseId = id("c1");

        store.mark_lesson_complete(&c1, &id("l1"), 30);
        let first = store.course_progress(&c1).unwrap();
        assert_eq!(store.course_progress(&c1).unwrap(), first);

        store.mark_lesson_complete(&c1, &id("l2"), 30);
        assert_eq!(store.course_progress(&c1).unwrap().completed_lessons, 2);
    }

    #[tokio::test]
    async fn opening_an_idle_identity_writes_nothing() {
        let kv = InMemoryKeyValueStore::new();
        let store = open_store(&kv, Identity::Anonymous).await;
        assert!(store.pending_writes().is_empty());
        assert_eq!(store.close().await, 0);
        assert_eq!(kv.write_count(), 0);
    }

    #[tokio::test]
    async fn stale_index_entry_is_reconciled_on_open() {
        let kv = InMemoryKeyValueStore::new();
        let mut stale = ActivityIndex::new();
        let mut activity = IdentityActivity::default();
        activity.courses.insert(
            id("c1"),
            CourseActivity {
                lessons_completed: 3,
                quizzes_completed: 0,
            },
        );
        stale.replace(Identity::Anonymous, activity);
        kv.set(
            blobs::ACTIVITY_INDEX_KEY,
            &blobs::encode_activity_index(&stale).unwrap(),
        )
        .await
        .unwrap();

        let store = open_store(&kv, Identity::Anonymous).await;
        assert_eq!(store.pending_writes(), vec![blobs::ACTIVITY_INDEX_KEY.to_owned()]);
        store.close().await;
        let saved = blobs::decode_activity_index(&kv.snapshot(blobs::ACTIVITY_INDEX_KEY).unwrap())
            .unwrap();
        assert!(saved.get(&Identity::Anonymous).is_none());
    }

    #[tokio::test]
    async fn unmark_without_record_is_noop() {
        let kv = InMemoryKeyValueStore::new();
        let store = open_store(&kv, Identity::Anonymous).await;
        assert!(!store.unmark_lesson_complete(&id("c1"), &id("l1")));
        assert!(store.pending_writes().is_empty());
    }

    #[tokio::test]
    async fn invalid_inputs_are_rejected_before_storing() {
        let kv = InMemoryKeyValueStore::new();
        let store = open_store(&kv, Identity::Anonymous).await;
        let c1: CourseId = id("c1");

        assert!(store
            .save_quiz_result(&c1, &id("q1"), 101, 5, BTreeMap::new())
            .is_err());
        assert!(store.rate_course(&c1, 6).is_err());
        assert!(store.quiz_result(&c1, &id("q1")).is_none());
        assert!(store.pending_writes().is_empty());
    }

    #[tokio::test]
    async fn toggle_saved_flips_membership() {
        let kv = InMemoryKeyValueStore::new();
        let store = open_store(&kv, Identity::Anonymous).await;
        let c1: CourseId = id("c1");

        assert!(store.toggle_saved_course(&c1));
        assert!(store.is_course_saved(&c1));
        assert_eq!(store.saved_courses(), vec![c1.clone()]);
        assert!(!store.toggle_saved_course(&c1));
        assert!(store.saved_courses().is_empty());
    }
}
