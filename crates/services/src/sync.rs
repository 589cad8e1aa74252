//! Fire-and-forget mirroring and live per-course feeds.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use lms_core::model::{
    Comment, CommentId, CourseId, CourseRating, Identity, LessonId, QuizResult,
};
use lms_storage::remote::{LessonCompletionDoc, Snapshots};
use lms_storage::{RemoteDocumentStore, RemoteError};

use crate::error::SyncError;

//
// ─── FEEDS ─────────────────────────────────────────────────────────────────────
//

#[derive(Default)]
struct FeedCache {
    ratings: HashMap<CourseId, Vec<CourseRating>>,
    comments: HashMap<CourseId, Vec<Comment>>,
}

/// Remote document type that can be watched per course.
trait FeedItem: Clone + Send + 'static {
    fn created_at(&self) -> DateTime<Utc>;
    fn slot(cache: &mut FeedCache) -> &mut HashMap<CourseId, Vec<Self>>;
}

impl FeedItem for CourseRating {
    fn created_at(&self) -> DateTime<Utc> {
        self.rated_at
    }

    fn slot(cache: &mut FeedCache) -> &mut HashMap<CourseId, Vec<Self>> {
        &mut cache.ratings
    }
}

impl FeedItem for Comment {
    fn created_at(&self) -> DateTime<Utc> {
        Comment::created_at(self)
    }

    fn slot(cache: &mut FeedCache) -> &mut HashMap<CourseId, Vec<Self>> {
        &mut cache.comments
    }
}

fn newest_first<T: FeedItem>(docs: &mut [T]) {
    docs.sort_by(|a, b| b.created_at().cmp(&a.created_at()));
}

type Callback<T> = Box<dyn FnMut(Vec<T>) + Send>;

struct Listener<T> {
    callback: Mutex<Option<Callback<T>>>,
}

impl<T> Listener<T> {
    fn new(callback: Callback<T>) -> Self {
        Self {
            callback: Mutex::new(Some(callback)),
        }
    }

    /// Run the callback while holding the slot. Returns false once detached.
    fn deliver(&self, docs: Vec<T>) -> bool {
        let Ok(mut slot) = self.callback.lock() else {
            return false;
        };
        match slot.as_mut() {
            Some(callback) => {
                callback(docs);
                true
            }
            None => false,
        }
    }
}

trait Detach: Send + Sync {
    fn detach(&self);
    fn is_attached(&self) -> bool;
}

impl<T: Send> Detach for Listener<T> {
    fn detach(&self) {
        // Waits for an in-flight callback to return.
        if let Ok(mut slot) = self.callback.lock() {
            slot.take();
        }
    }

    fn is_attached(&self) -> bool {
        self.callback.lock().map(|s| s.is_some()).unwrap_or(false)
    }
}

/// Handle to a live feed.
///
/// `unsubscribe` may be called any number of times. Once the first call
/// returns, no callback is running and none will run again. Dropping the
/// handle unsubscribes. Calling `unsubscribe` from inside the subscription's
/// own callback deadlocks.
pub struct Subscription {
    listener: Arc<dyn Detach>,
    task: JoinHandle<()>,
}

impl Subscription {
    pub fn unsubscribe(&self) {
        self.listener.detach();
        self.task.abort();
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.listener.is_attached() && !self.task.is_finished()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.is_active())
            .finish()
    }
}

async fn pump<T: FeedItem>(
    course_id: CourseId,
    opened: Result<Snapshots<T>, RemoteError>,
    cache: Arc<Mutex<FeedCache>>,
    listener: Arc<Listener<T>>,
) {
    let cached = |cache: &Mutex<FeedCache>| -> Vec<T> {
        cache
            .lock()
            .ok()
            .and_then(|mut c| T::slot(&mut c).get(&course_id).cloned())
            .unwrap_or_default()
    };

    let mut rx = match opened {
        Ok(rx) => rx,
        Err(err) => {
            warn!(course = %course_id, error = %err, "watch failed, serving cached feed");
            listener.deliver(cached(&cache));
            return;
        }
    };

    while let Some(next) = rx.recv().await {
        let docs = match next {
            Ok(mut docs) => {
                newest_first(&mut docs);
                if let Ok(mut c) = cache.lock() {
                    T::slot(&mut c).insert(course_id.clone(), docs.clone());
                }
                docs
            }
            Err(err) => {
                warn!(course = %course_id, error = %err, "watch error, serving cached feed");
                cached(&cache)
            }
        };
        if !listener.deliver(docs) {
            break;
        }
    }
    debug!(course = %course_id, "feed closed");
}

//
// ─── REMOTE SYNC ───────────────────────────────────────────────────────────────
//

/// Mirrors local events to the remote store and serves per-course feeds.
///
/// Remote writes are spawned and never awaited by callers. Failures are
/// logged and dropped; local state is never rolled back.
pub struct RemoteSync {
    remote: Arc<dyn RemoteDocumentStore>,
    runtime: Handle,
    cache: Arc<Mutex<FeedCache>>,
    in_flight: Mutex<Vec<JoinHandle<()>>>,
}

impl RemoteSync {
    #[must_use]
    pub fn new(remote: Arc<dyn RemoteDocumentStore>, runtime: Handle) -> Self {
        Self {
            remote,
            runtime,
            cache: Arc::new(Mutex::new(FeedCache::default())),
            in_flight: Mutex::new(Vec::new()),
        }
    }

    pub fn mirror_lesson_completion(
        &self,
        user: &Identity,
        course_id: &CourseId,
        lesson_id: &LessonId,
        completed_at: DateTime<Utc>,
        time_spent_secs: u64,
    ) {
        let doc = LessonCompletionDoc {
            user: user.clone(),
            course_id: course_id.clone(),
            lesson_id: lesson_id.clone(),
            completed_at,
            time_spent_secs,
        };
        let remote = Arc::clone(&self.remote);
        self.track(self.runtime.spawn(async move {
            let (course, lesson) = (doc.course_id.clone(), doc.lesson_id.clone());
            if let Err(err) = remote.put_lesson_completion(doc).await {
                warn!(course = %course, lesson = %lesson, error = %err, "lesson mirror failed");
            }
        }));
    }

    pub fn mirror_quiz_result(&self, user: &Identity, result: &QuizResult) {
        let remote = Arc::clone(&self.remote);
        let user = user.clone();
        let result = result.clone();
        self.track(self.runtime.spawn(async move {
            if let Err(err) = remote.put_quiz_result(&user, &result).await {
                warn!(
                    course = %result.course_id(),
                    quiz = %result.quiz_id(),
                    error = %err,
                    "quiz mirror failed"
                );
            }
        }));
    }

    /// Wait for every remote write spawned so far.
    pub async fn settle(&self) {
        let handles: Vec<JoinHandle<()>> = match self.in_flight.lock() {
            Ok(mut guard) => guard.drain(..).collect(),
            Err(_) => return,
        };
        for handle in handles {
            if let Err(err) = handle.await {
                warn!(error = %err, "remote write task did not complete");
            }
        }
    }

    /// Send a rating to the remote in the background. The rating enters the
    /// remote cache only once the remote acknowledges it, replacing that
    /// user's earlier one. A rejected write is logged and dropped.
    pub fn add_course_rating(&self, rating: &CourseRating) {
        let remote = Arc::clone(&self.remote);
        let cache = Arc::clone(&self.cache);
        let rating = rating.clone();
        self.track(self.runtime.spawn(async move {
            let outcome = remote.add_rating(&rating).await;
            match outcome {
                Ok(()) => {
                    if let Ok(mut cache) = cache.lock() {
                        let entries = cache.ratings.entry(rating.course_id.clone()).or_default();
                        entries.retain(|r| r.user != rating.user);
                        entries.push(rating);
                        newest_first(entries);
                    }
                }
                Err(err) => {
                    warn!(course = %rating.course_id, error = %err, "rating write failed");
                }
            }
        }));
    }

    /// Pull the current rating set for `course_id` into the cache.
    ///
    /// # Errors
    ///
    /// Returns `SyncError::Remote` if the fetch fails; the cache is kept.
    pub async fn refresh_ratings(&self, course_id: &CourseId) -> Result<(), SyncError> {
        let mut docs = self.remote.ratings_for_course(course_id).await?;
        newest_first(&mut docs);
        if let Ok(mut cache) = self.cache.lock() {
            cache.ratings.insert(course_id.clone(), docs);
        }
        Ok(())
    }

    /// Last known remote ratings for `course_id`, newest first.
    #[must_use]
    pub fn cached_ratings(&self, course_id: &CourseId) -> Vec<CourseRating> {
        self.cache
            .lock()
            .ok()
            .and_then(|c| c.ratings.get(course_id).cloned())
            .unwrap_or_default()
    }

    /// Last known comments for `course_id`, newest first.
    #[must_use]
    pub fn cached_comments(&self, course_id: &CourseId) -> Vec<Comment> {
        self.cache
            .lock()
            .ok()
            .and_then(|c| c.comments.get(course_id).cloned())
            .unwrap_or_default()
    }

    /// Validate a comment and post it in the background. The comment joins
    /// the local feed cache once the remote acknowledges it; a rejected write
    /// is logged and dropped.
    ///
    /// # Errors
    ///
    /// Returns `SyncError::Record` for invalid author or content.
    pub fn add_comment(
        &self,
        user: &Identity,
        course_id: &CourseId,
        author: &str,
        content: &str,
        now: DateTime<Utc>,
    ) -> Result<Comment, SyncError> {
        let comment = Comment::new(
            CommentId::generate(),
            course_id.clone(),
            author,
            content,
            now,
            user.clone(),
        )?;
        let remote = Arc::clone(&self.remote);
        let cache = Arc::clone(&self.cache);
        let posted = comment.clone();
        self.track(self.runtime.spawn(async move {
            let outcome = remote.add_comment(&posted).await;
            match outcome {
                Ok(()) => {
                    if let Ok(mut cache) = cache.lock() {
                        let entries = cache.comments.entry(posted.course_id().clone()).or_default();
                        if !entries.iter().any(|c| c.id() == posted.id()) {
                            entries.push(posted);
                            newest_first(entries);
                        }
                    }
                }
                Err(err) => {
                    warn!(course = %posted.course_id(), error = %err, "comment write failed");
                }
            }
        }));
        Ok(comment)
    }

    /// Live rating feed for `course_id`, newest first.
    pub fn subscribe_ratings<F>(&self, course_id: &CourseId, callback: F) -> Subscription
    where
        F: FnMut(Vec<CourseRating>) + Send + 'static,
    {
        let listener = Arc::new(Listener::<CourseRating>::new(Box::new(callback)));
        let remote = Arc::clone(&self.remote);
        let cache = Arc::clone(&self.cache);
        let course_id = course_id.clone();
        let pump_listener = Arc::clone(&listener);
        let task = self.runtime.spawn(async move {
            let opened = remote.watch_ratings(&course_id).await;
            pump(course_id, opened, cache, pump_listener).await;
        });
        Subscription { listener, task }
    }

    /// Live comment feed for `course_id`, newest first.
    pub fn subscribe_comments<F>(&self, course_id: &CourseId, callback: F) -> Subscription
    where
        F: FnMut(Vec<Comment>) + Send + 'static,
    {
        let listener = Arc::new(Listener::<Comment>::new(Box::new(callback)));
        let remote = Arc::clone(&self.remote);
        let cache = Arc::clone(&self.cache);
        let course_id = course_id.clone();
        let pump_listener = Arc::clone(&listener);
        let task = self.runtime.spawn(async move {
            let opened = remote.watch_comments(&course_id).await;
            pump(course_id, opened, cache, pump_listener).await;
        });
        Subscription { listener, task }
    }

    fn track(&self, handle: JoinHandle<()>) {
        if let Ok(mut guard) = self.in_flight.lock() {
            guard.retain(|h| !h.is_finished());
            guard.push(handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lms_core::model::{QuizId, Rating, UserId};
    use lms_core::time::fixed_now;
    use lms_storage::InMemoryRemote;
    use std::collections::BTreeMap;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn course(id: &str) -> CourseId {
        CourseId::new(id).unwrap()
    }

    fn user(id: &str) -> Identity {
        Identity::User(UserId::new(id).unwrap())
    }

    fn sync(remote: &InMemoryRemote) -> RemoteSync {
        RemoteSync::new(Arc::new(remote.clone()), Handle::current())
    }

    async fn next<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("callback within a second")
            .expect("channel open")
    }

    #[tokio::test]
    async fn mirror_failures_are_swallowed() {
        let remote = InMemoryRemote::new();
        let sync = sync(&remote);
        remote.set_offline(true);

        sync.mirror_lesson_completion(
            &user("u1"),
            &course("c1"),
            &LessonId::new("l1").unwrap(),
            fixed_now(),
            12,
        );
        sync.settle().await;
        remote.set_offline(false);
        assert!(remote.lesson_completions().is_empty());

        let result = QuizResult::new(
            course("c1"),
            QuizId::new("q1").unwrap(),
            80,
            5,
            fixed_now(),
            BTreeMap::new(),
        )
        .unwrap();
        sync.mirror_quiz_result(&user("u1"), &result);
        sync.settle().await;
        assert_eq!(remote.quiz_results(&user("u1")), vec![result]);
    }

    #[tokio::test]
    async fn comment_feed_is_sorted_newest_first() {
        let remote = InMemoryRemote::new();
        let sync = sync(&remote);
        let c1 = course("c1");

        let first = fixed_now();
        sync.add_comment(&user("a"), &c1, "Ada", "first", first)
            .unwrap();
        sync.add_comment(
            &user("b"),
            &c1,
            "Bo",
            "second",
            first + chrono::Duration::minutes(5),
        )
        .unwrap();
        sync.settle().await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let _sub = sync.subscribe_comments(&c1, move |docs: Vec<Comment>| {
            let _ = tx.send(docs.iter().map(|c| c.content().to_owned()).collect::<Vec<_>>());
        });
        assert_eq!(next(&mut rx).await, vec!["second", "first"]);
    }

    #[tokio::test]
    async fn broken_watch_serves_cached_subset() {
        let remote = InMemoryRemote::new();
        let sync = sync(&remote);
        let c1 = course("c1");
        sync.add_comment(&user("a"), &c1, "Ada", "hello", fixed_now())
            .unwrap();
        sync.settle().await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let _sub = sync.subscribe_comments(&c1, move |docs: Vec<Comment>| {
            let _ = tx.send(docs.len());
        });
        assert_eq!(next(&mut rx).await, 1);

        remote.break_watches(&c1, &RemoteError::Unavailable);
        assert_eq!(next(&mut rx).await, 1);
    }

    #[tokio::test]
    async fn offline_subscribe_falls_back_to_cache() {
        let remote = InMemoryRemote::new();
        let sync = sync(&remote);
        remote.set_offline(true);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let sub = sync.subscribe_ratings(&course("c1"), move |docs: Vec<CourseRating>| {
            let _ = tx.send(docs.len());
        });
        assert_eq!(next(&mut rx).await, 0);
        drop(sub);
    }

    #[tokio::test]
    async fn rating_cache_replaces_per_user_after_ack() {
        let remote = InMemoryRemote::new();
        let sync = sync(&remote);
        let c1 = course("c1");
        let rate = |value: u8, minutes: i64| {
            CourseRating::new(
                c1.clone(),
                user("a"),
                Rating::new(value).unwrap(),
                fixed_now() + chrono::Duration::minutes(minutes),
            )
        };

        sync.add_course_rating(&rate(2, 0));
        assert!(sync.cached_ratings(&c1).is_empty());
        sync.settle().await;
        sync.add_course_rating(&rate(5, 1));
        sync.settle().await;
        let cached = sync.cached_ratings(&c1);
        assert_eq!(cached.len(), 1);
        assert_eq!(cached[0].rating.value(), 5);

        remote.set_offline(true);
        sync.add_course_rating(&rate(1, 2));
        sync.settle().await;
        assert_eq!(sync.cached_ratings(&c1).len(), 1);
        assert_eq!(sync.cached_ratings(&c1)[0].rating.value(), 5);
    }

    #[tokio::test]
    async fn rejected_comment_is_returned_but_never_cached() {
        let remote = InMemoryRemote::new();
        let sync = sync(&remote);
        let c1 = course("c1");
        remote.set_offline(true);

        let comment = sync
            .add_comment(&user("a"), &c1, "Ada", "lost", fixed_now())
            .unwrap();
        assert_eq!(comment.content(), "lost");
        sync.settle().await;
        assert!(sync.cached_comments(&c1).is_empty());

        assert!(matches!(
            sync.add_comment(&user("a"), &c1, "Ada", "  ", fixed_now()),
            Err(SyncError::Record(_))
        ));
    }

    #[tokio::test]
    async fn double_unsubscribe_is_safe_and_final() {
        let remote = InMemoryRemote::new();
        let sync = sync(&remote);
        let c1 = course("c1");

        let (tx, mut rx) = mpsc::unbounded_channel();
        let sub = sync.subscribe_comments(&c1, move |docs: Vec<Comment>| {
            let _ = tx.send(docs.len());
        });
        assert_eq!(next(&mut rx).await, 0);

        sub.unsubscribe();
        sub.unsubscribe();
        assert!(!sub.is_active());

        sync.add_comment(&user("a"), &c1, "Ada", "late", fixed_now())
            .unwrap();
        sync.settle().await;
        // The sender lived in the callback; once detached it is dropped.
        assert_eq!(rx.recv().await, None);
    }
}
