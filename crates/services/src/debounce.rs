//! Per-key debounced writes into a `KeyValueStore`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use lms_storage::KeyValueStore;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, error};

struct Pending {
    ticket: u64,
    value: String,
    timer: JoinHandle<bool>,
}

type PendingMap = Arc<Mutex<HashMap<String, Pending>>>;

/// Timers that already took their value and are writing it, by ticket.
type WritingMap = Arc<Mutex<HashMap<u64, JoinHandle<bool>>>>;

/// Coalesces rapid writes to the same key into one.
///
/// Every `schedule` call replaces the pending value for its key and restarts
/// that key's timer. A write that fails is logged and dropped.
pub struct Debouncer {
    kv: Arc<dyn KeyValueStore>,
    runtime: Handle,
    pending: PendingMap,
    writing: WritingMap,
    next_ticket: AtomicU64,
}

impl Debouncer {
    #[must_use]
    pub fn new(kv: Arc<dyn KeyValueStore>, runtime: Handle) -> Self {
        Self {
            kv,
            runtime,
            pending: Arc::new(Mutex::new(HashMap::new())),
            writing: Arc::new(Mutex::new(HashMap::new())),
            next_ticket: AtomicU64::new(0),
        }
    }

    /// Write `value` under `key` once `delay` passes without another call for `key`.
    pub fn schedule(&self, key: String, value: String, delay: Duration) {
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        let Ok(mut guard) = self.pending.lock() else {
            error!(key = %key, "pending write table poisoned, dropping write");
            return;
        };

        // The timer cannot observe the table before this insert: it has to
        // take the same lock first.
        let timer = self.runtime.spawn(fire_after(
            Arc::clone(&self.pending),
            Arc::clone(&self.writing),
            Arc::clone(&self.kv),
            key.clone(),
            ticket,
            delay,
        ));
        if let Some(prev) = guard.insert(
            key,
            Pending {
                ticket,
                value,
                timer,
            },
        ) {
            prev.timer.abort();
        }
    }

    /// Keys with a write still waiting on its timer.
    #[must_use]
    pub fn pending_keys(&self) -> Vec<String> {
        self.pending
            .lock()
            .map(|g| {
                let mut keys: Vec<String> = g.keys().cloned().collect();
                keys.sort();
                keys
            })
            .unwrap_or_default()
    }

    /// Write every pending value now and wait for writes a timer already
    /// started. Returns how many keys were written.
    pub async fn flush(&self) -> usize {
        let drained: Vec<(String, Pending)> = match self.pending.lock() {
            Ok(mut guard) => guard.drain().collect(),
            Err(_) => return 0,
        };
        for (_, pending) in &drained {
            pending.timer.abort();
        }

        // In-flight values are older than the drained ones, so they land first.
        let writing: Vec<JoinHandle<bool>> = match self.writing.lock() {
            Ok(mut guard) => guard.drain().map(|(_, handle)| handle).collect(),
            Err(_) => Vec::new(),
        };
        let mut written = 0;
        for handle in writing {
            match handle.await {
                Ok(true) => written += 1,
                Ok(false) => {}
                Err(err) => error!(error = %err, "debounced write task did not complete"),
            }
        }

        for (key, pending) in drained {
            match self.kv.set(&key, &pending.value).await {
                Ok(()) => written += 1,
                Err(err) => error!(key = %key, error = %err, "flush write failed"),
            }
        }
        written
    }
}

async fn fire_after(
    pending: PendingMap,
    writing: WritingMap,
    kv: Arc<dyn KeyValueStore>,
    key: String,
    ticket: u64,
    delay: Duration,
) -> bool {
    tokio::time::sleep(delay).await;

    let value = {
        let Ok(mut guard) = pending.lock() else {
            return false;
        };
        match guard.get(&key) {
            Some(p) if p.ticket == ticket => guard.remove(&key).map(|p| {
                if let Ok(mut in_flight) = writing.lock() {
                    in_flight.insert(ticket, p.timer);
                }
                p.value
            }),
            _ => None,
        }
    };
    let Some(value) = value else {
        return false;
    };

    let stored = match kv.set(&key, &value).await {
        Ok(()) => {
            debug!(key = %key, "debounced write stored");
            true
        }
        Err(err) => {
            error!(key = %key, error = %err, "debounced write failed");
            false
        }
    };
    if let Ok(mut in_flight) = writing.lock() {
        in_flight.remove(&ticket);
    }
    stored
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use lms_storage::{InMemoryKeyValueStore, StorageError};

    /// Store whose writes take a while to land.
    struct SlowStore {
        inner: InMemoryKeyValueStore,
        latency: Duration,
    }

    #[async_trait]
    impl KeyValueStore for SlowStore {
        async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
            self.inner.get(key).await
        }

        async fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
            tokio::time::sleep(self.latency).await;
            self.inner.set(key, value).await
        }

        async fn remove(&self, key: &str) -> Result<(), StorageError> {
            self.inner.remove(key).await
        }
    }

    fn debouncer(kv: &InMemoryKeyValueStore) -> Debouncer {
        Debouncer::new(Arc::new(kv.clone()), Handle::current())
    }

    #[tokio::test(start_paused = true)]
    async fn rapid_schedules_coalesce_into_one_write() {
        let kv = InMemoryKeyValueStore::new();
        let debouncer = debouncer(&kv);
        let delay = Duration::from_millis(300);

        debouncer.schedule("progress:anonymous".into(), "1".into(), delay);
        tokio::time::sleep(Duration::from_millis(200)).await;
        debouncer.schedule("progress:anonymous".into(), "2".into(), delay);
        tokio::time::sleep(Duration::from_millis(200)).await;
        debouncer.schedule("progress:anonymous".into(), "3".into(), delay);

        // 400ms after the first call nothing has been written: each call reset the timer.
        assert_eq!(kv.write_count(), 0);

        tokio::time::sleep(Duration::from_millis(350)).await;
        assert_eq!(kv.write_count(), 1);
        assert_eq!(kv.snapshot("progress:anonymous").as_deref(), Some("3"));
        assert!(debouncer.pending_keys().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn keys_are_debounced_independently() {
        let kv = InMemoryKeyValueStore::new();
        let debouncer = debouncer(&kv);

        debouncer.schedule("a".into(), "x".into(), Duration::from_millis(300));
        debouncer.schedule("b".into(), "y".into(), Duration::from_millis(500));

        tokio::time::sleep(Duration::from_millis(350)).await;
        assert_eq!(kv.snapshot("a").as_deref(), Some("x"));
        assert_eq!(kv.snapshot("b"), None);
        assert_eq!(debouncer.pending_keys(), vec!["b".to_owned()]);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(kv.snapshot("b").as_deref(), Some("y"));
    }

    #[tokio::test(start_paused = true)]
    async fn flush_writes_pending_values_immediately() {
        let kv = InMemoryKeyValueStore::new();
        let debouncer = debouncer(&kv);

        debouncer.schedule("a".into(), "1".into(), Duration::from_secs(60));
        debouncer.schedule("b".into(), "2".into(), Duration::from_secs(60));
        assert_eq!(debouncer.flush().await, 2);
        assert_eq!(kv.write_count(), 2);

        // Aborted timers do not write again.
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(kv.write_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn flush_waits_for_a_write_already_underway() {
        let kv = InMemoryKeyValueStore::new();
        let slow = SlowStore {
            inner: kv.clone(),
            latency: Duration::from_millis(100),
        };
        let debouncer = Debouncer::new(Arc::new(slow), Handle::current());

        debouncer.schedule("a".into(), "1".into(), Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(20)).await;
        // The timer has taken the value and is inside the slow write.
        assert!(debouncer.pending_keys().is_empty());
        assert_eq!(kv.snapshot("a"), None);

        assert_eq!(debouncer.flush().await, 1);
        assert_eq!(kv.snapshot("a").as_deref(), Some("1"));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_write_is_dropped() {
        let kv = InMemoryKeyValueStore::new();
        kv.fail_writes(true);
        let debouncer = debouncer(&kv);

        debouncer.schedule("a".into(), "1".into(), Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(debouncer.pending_keys().is_empty());
        assert_eq!(kv.snapshot("a"), None);
    }
}
