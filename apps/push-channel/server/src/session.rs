use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use dashmap::DashMap;
use metrics::{counter, gauge};
use parking_lot::RwLock;
use tokio::{sync::broadcast, task::JoinHandle};
use tracing::{debug, info};
use uuid::Uuid;

const FRAME_CHANNEL_DEPTH: usize = 64;

/// Server-side session shared by every push connection of one client.
///
/// Holds string attributes (the security key lives here) and a broadcast
/// channel fanning UIDL frames out to all of the session's connections.
pub struct WrappedSession {
    id: Uuid,
    attributes: RwLock<HashMap<String, String>>,
    sync_id: AtomicU64,
    last_seen: AtomicU64,
    frames: broadcast::Sender<String>,
}

impl WrappedSession {
    fn new(id: Uuid) -> Self {
        let (frames, _) = broadcast::channel(FRAME_CHANNEL_DEPTH);
        Self {
            id,
            attributes: RwLock::new(HashMap::new()),
            sync_id: AtomicU64::new(0),
            last_seen: AtomicU64::new(now_millis()),
            frames,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Returns the attribute, storing `init()` first if it is absent. The
    /// check and the store happen under one write lock, so concurrent
    /// callers all observe the same value.
    pub fn attribute_or_insert_with<F>(&self, key: &str, init: F) -> String
    where
        F: FnOnce() -> String,
    {
        if let Some(value) = self.attributes.read().get(key) {
            return value.clone();
        }
        self.attributes
            .write()
            .entry(key.to_string())
            .or_insert_with(init)
            .clone()
    }

    pub fn next_sync_id(&self) -> u64 {
        self.sync_id.fetch_add(1, Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.touch();
        self.frames.subscribe()
    }

    /// Sends `frame` to every open connection; returns how many received it.
    pub fn publish(&self, frame: String) -> usize {
        let delivered = self.frames.send(frame).unwrap_or(0);
        counter!("push_channel_frames_published_total", 1);
        counter!("push_channel_frames_delivered_total", delivered as u64);
        delivered
    }

    pub fn connection_count(&self) -> usize {
        self.frames.receiver_count()
    }

    pub fn touch(&self) {
        self.last_seen.store(now_millis(), Ordering::Relaxed);
    }

    fn idle_for(&self, now: u64) -> Duration {
        Duration::from_millis(now.saturating_sub(self.last_seen.load(Ordering::Relaxed)))
    }
}

struct StreamBinding {
    session: Arc<WrappedSession>,
    generation: u64,
}

#[derive(Clone, Default)]
pub struct SessionRegistry {
    inner: Arc<SessionRegistryInner>,
}

#[derive(Default)]
struct SessionRegistryInner {
    sessions: DashMap<Uuid, Arc<WrappedSession>>,
    streams: DashMap<Uuid, StreamBinding>,
    next_generation: AtomicU64,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up the session a client asked for. Ids the registry never
    /// issued (or has evicted) are not adopted: a fresh session with a
    /// server-minted id is created instead. The flag reports whether a
    /// session was created.
    pub fn resolve(&self, requested: Option<Uuid>) -> (Arc<WrappedSession>, bool) {
        if let Some(id) = requested {
            if let Some(session) = self.inner.sessions.get(&id) {
                return (Arc::clone(session.value()), false);
            }
            debug!(target: "push.server", requested = %id, "unknown session requested; issuing a new one");
        }

        let session = Arc::new(WrappedSession::new(Uuid::new_v4()));
        self.inner
            .sessions
            .insert(session.id(), Arc::clone(&session));
        debug!(target: "push.server", session_id = %session.id(), "session created");
        counter!("push_channel_sessions_created_total", 1);
        gauge!("push_channel_sessions_active", self.len() as f64);
        (session, true)
    }

    pub fn len(&self) -> usize {
        self.inner.sessions.len()
    }

    /// Routes POSTs carrying `tracking_id` to `session`. Returns the binding
    /// generation to hand back to [`SessionRegistry::release_stream`].
    pub fn bind_stream(&self, tracking_id: Uuid, session: Arc<WrappedSession>) -> u64 {
        let generation = self.inner.next_generation.fetch_add(1, Ordering::SeqCst);
        self.inner.streams.insert(
            tracking_id,
            StreamBinding {
                session,
                generation,
            },
        );
        generation
    }

    pub fn stream_session(&self, tracking_id: Uuid) -> Option<Arc<WrappedSession>> {
        self.inner
            .streams
            .get(&tracking_id)
            .map(|binding| Arc::clone(&binding.session))
    }

    /// Drops the binding unless a newer stream has re-bound the tracking id.
    pub fn release_stream(&self, tracking_id: Uuid, generation: u64) {
        self.inner
            .streams
            .remove_if(&tracking_id, |_, binding| binding.generation == generation);
    }

    /// Forgets sessions without connections that have been idle for longer
    /// than `idle_timeout`. Returns how many were dropped.
    pub fn evict_idle(&self, idle_timeout: Duration) -> usize {
        let now = now_millis();
        let before = self.inner.sessions.len();
        self.inner.sessions.retain(|_, session| {
            session.connection_count() > 0 || session.idle_for(now) < idle_timeout
        });
        before.saturating_sub(self.inner.sessions.len())
    }

    pub fn spawn_recycler(&self, interval: Duration, idle_timeout: Duration) -> JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let evicted = registry.evict_idle(idle_timeout);
                gauge!("push_channel_sessions_active", registry.len() as f64);
                if evicted > 0 {
                    counter!("push_channel_sessions_evicted_total", evicted as u64);
                    info!(
                        target: "push.server",
                        evicted,
                        remaining = registry.len(),
                        "evicted idle sessions"
                    );
                }
            }
        })
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
