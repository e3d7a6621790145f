//! Client sessions and the registry the dispatcher fans out through
//!
//! Sessions are inserted fully built behind an `Arc`, so a concurrent
//! `matching` never sees a half-initialized session.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::debug;
use uuid::Uuid;

use aggregator_core::{KeyedBacklog, NormalizedRecord, PushOutcome, RecordKey, SubscriptionFilter};

pub type SessionId = Uuid;

/// Encoded frame shared by every session it is fanned out to
pub type SharedFrame = Arc<str>;

/// Bounded per-session send buffer.
///
/// When full, the oldest pending frame of the same key goes first, so a slow
/// client lags on history but never receives a stale value after a fresh one.
#[derive(Debug)]
pub struct Outbox {
    pending: Mutex<KeyedBacklog<RecordKey, SharedFrame>>,
    notify: Notify,
    dropped: AtomicU64,
}

impl Outbox {
    pub fn new(capacity: usize) -> Self {
        Self {
            pending: Mutex::new(KeyedBacklog::new(capacity, capacity)),
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn push(&self, key: RecordKey, frame: SharedFrame) {
        if self.pending.lock().push(key, frame) != PushOutcome::Queued {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        self.notify.notify_one();
    }

    /// Everything pending, oldest first
    pub fn take(&self) -> Vec<SharedFrame> {
        self.pending.lock().drain()
    }

    /// Resolves once frames may be pending
    pub async fn ready(&self) {
        if self.is_empty() {
            self.notify.notified().await;
        }
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }

    /// Frames evicted because the client fell behind
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// One connected client
#[derive(Debug)]
pub struct ClientSession {
    id: SessionId,
    filter: SubscriptionFilter,
    peer: Option<SocketAddr>,
    connected_at: DateTime<Utc>,
    outbox: Outbox,
}

impl ClientSession {
    pub fn new(filter: SubscriptionFilter, peer: Option<SocketAddr>, backlog: usize) -> Self {
        Self {
            id: Uuid::new_v4(),
            filter,
            peer,
            connected_at: Utc::now(),
            outbox: Outbox::new(backlog),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn filter(&self) -> &SubscriptionFilter {
        &self.filter
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    pub fn outbox(&self) -> &Outbox {
        &self.outbox
    }

    pub fn accepts(&self, record: &NormalizedRecord) -> bool {
        self.filter.matches(record)
    }
}

/// Connected sessions by id
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: DashMap<SessionId, Arc<ClientSession>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, session: Arc<ClientSession>) -> SessionId {
        let id = session.id();
        self.sessions.insert(id, session);
        debug!("Registered session {} ({} active)", id, self.sessions.len());
        id
    }

    /// Remove a session. Unknown or already removed ids are a no-op.
    pub fn deregister(&self, id: &SessionId) -> Option<Arc<ClientSession>> {
        self.sessions.remove(id).map(|(_, session)| session)
    }

    pub fn get(&self, id: &SessionId) -> Option<Arc<ClientSession>> {
        self.sessions.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// Sessions whose filter accepts this record
    pub fn matching(&self, record: &NormalizedRecord) -> Vec<Arc<ClientSession>> {
        self.sessions
            .iter()
            .filter(|entry| entry.value().accepts(record))
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

/// Deregisters its session when dropped, however the connection ends
pub struct SessionGuard {
    registry: Arc<SessionRegistry>,
    id: SessionId,
}

impl SessionGuard {
    pub fn new(registry: Arc<SessionRegistry>, id: SessionId) -> Self {
        Self { registry, id }
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.registry.deregister(&self.id);
    }
}
