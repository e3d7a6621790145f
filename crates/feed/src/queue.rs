//! Shared record queue between shard workers and the distribution server
//!
//! Many producers (one connector task per exchange per shard), one consumer.
//! `put` only holds a short mutex; overflow is resolved per key so a fresher
//! record for a key is never delivered after a staler one.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::debug;

use aggregator_core::{KeyedBacklog, NormalizedRecord, PushOutcome, QueueSettings, RecordKey};

/// Bounded latest-value-wins queue of normalized records
#[derive(Debug)]
pub struct SharedRecordQueue {
    backlog: Mutex<KeyedBacklog<RecordKey, NormalizedRecord>>,
    notify: Notify,

    /// Stats
    queued: AtomicU64,
    evicted: AtomicU64,
    drained: AtomicU64,
}

impl SharedRecordQueue {
    pub fn new(capacity: usize, max_per_key: usize) -> Self {
        Self {
            backlog: Mutex::new(KeyedBacklog::new(capacity, max_per_key)),
            notify: Notify::new(),
            queued: AtomicU64::new(0),
            evicted: AtomicU64::new(0),
            drained: AtomicU64::new(0),
        }
    }

    pub fn from_settings(settings: &QueueSettings) -> Self {
        Self::new(settings.capacity, settings.max_per_key)
    }

    /// Enqueue a record, evicting per the overflow policy when full
    pub fn put(&self, record: NormalizedRecord) -> PushOutcome {
        let key = record.key();
        let outcome = self.backlog.lock().push(key.clone(), record);
        self.queued.fetch_add(1, Ordering::Relaxed);

        if outcome != PushOutcome::Queued {
            let evicted = self.evicted.fetch_add(1, Ordering::Relaxed) + 1;
            if evicted == 1 || evicted % 1_000 == 0 {
                debug!("Queue overflow on {} ({:?}), {} evicted so far", key, outcome, evicted);
            }
        }

        self.notify.notify_one();
        outcome
    }

    /// Take everything currently queued, in arrival order. Never blocks on
    /// producers beyond the mutex hold.
    pub fn drain(&self) -> Vec<NormalizedRecord> {
        let records = self.backlog.lock().drain();
        self.drained
            .fetch_add(records.len() as u64, Ordering::Relaxed);
        records
    }

    /// Wait until at least one record may be available
    pub async fn wait(&self) {
        if self.is_empty() {
            self.notify.notified().await;
        }
    }

    /// Wait up to `timeout` for records, then drain whatever is there
    pub async fn drain_timeout(&self, timeout: Duration) -> Vec<NormalizedRecord> {
        let _ = tokio::time::timeout(timeout, self.wait()).await;
        self.drain()
    }

    pub fn len(&self) -> usize {
        self.backlog.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.backlog.lock().is_empty()
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            pending: self.len(),
            queued: self.queued.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
            drained: self.drained.load(Ordering::Relaxed),
        }
    }
}

impl Default for SharedRecordQueue {
    fn default() -> Self {
        Self::from_settings(&QueueSettings::default())
    }
}

/// Statistics about the record queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    pub pending: usize,
    pub queued: u64,
    pub evicted: u64,
    pub drained: u64,
}
