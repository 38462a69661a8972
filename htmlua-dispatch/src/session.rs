use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use serde_json::{Map, Value};

use crate::config::WorkerConfig;

/// Cookie carrying the session id.
pub const SESSION_COOKIE: &str = "HTMLUASESSID";

pub type SessionData = Map<String, Value>;

#[derive(Debug)]
struct Entry {
    data: SessionData,
    touched: Instant,
    /// Access order, for evicting the least recently used entry.
    tick: u64,
}

#[derive(Debug, Default)]
struct Sessions {
    entries: HashMap<String, Entry>,
    tick: u64,
}

impl Sessions {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    /// Returns the live entry for `id`, dropping it if it has idled past `ttl`.
    fn live(&mut self, id: &str, ttl: Duration) -> Option<&mut Entry> {
        if self.entries.get(id).is_some_and(|e| e.touched.elapsed() > ttl) {
            self.entries.remove(id);
        }
        self.entries.get_mut(id)
    }
}

/// Worker-wide session storage, shared by every dispatcher in the process.
///
/// Sessions idle for longer than the configured lifetime expire, and the
/// store never holds more than `max_entries`; the least recently used
/// session makes room for a new one.
#[derive(Debug, Clone)]
pub struct SessionStore {
    inner: Arc<Mutex<Sessions>>,
    ttl: Duration,
    max_entries: usize,
    persistent: bool,
}

impl Default for SessionStore {
    fn default() -> Self {
        let worker = WorkerConfig::default();
        Self::with_limits(Duration::from_secs(worker.session_lifetime), worker.max_sessions)
    }
}

impl SessionStore {
    pub fn new() -> Self { Self::default() }

    pub fn from_config(config: &WorkerConfig) -> Self {
        Self::with_limits(Duration::from_secs(config.session_lifetime), config.max_sessions)
    }

    pub fn with_limits(ttl: Duration, max_entries: usize) -> Self {
        Self {
            inner: Arc::default(),
            ttl,
            max_entries: max_entries.max(1),
            persistent: true,
        }
    }

    /// A store for one-shot front ends. Nothing outlives the process, so
    /// `session_start` is a no-op against it.
    pub fn ephemeral() -> Self {
        Self {
            persistent: false,
            ..Self::default()
        }
    }

    pub fn is_persistent(&self) -> bool { self.persistent }

    pub fn load(&self, id: &str) -> Option<SessionData> {
        let mut sessions = self.inner.lock();
        let tick = sessions.next_tick();
        let entry = sessions.live(id, self.ttl)?;
        entry.touched = Instant::now();
        entry.tick = tick;
        Some(entry.data.clone())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.lock().live(id, self.ttl).is_some()
    }

    /// Registers a new, empty session and returns its id.
    pub fn create(&self) -> String {
        let id = uuid::Uuid::new_v4().simple().to_string();
        let mut sessions = self.inner.lock();
        let ttl = self.ttl;
        sessions.entries.retain(|_, e| e.touched.elapsed() <= ttl);
        while sessions.entries.len() >= self.max_entries {
            let oldest = sessions
                .entries
                .iter()
                .min_by_key(|(_, e)| e.tick)
                .map(|(id, _)| id.clone());
            match oldest {
                Some(oldest) => sessions.entries.remove(&oldest),
                None => break,
            };
        }
        let tick = sessions.next_tick();
        sessions.entries.insert(
            id.clone(),
            Entry {
                data: SessionData::new(),
                touched: Instant::now(),
                tick,
            },
        );
        id
    }

    /// Replaces the data of a live session. Expired or evicted ids are
    /// not brought back.
    pub fn store(&self, id: &str, data: SessionData) {
        let mut sessions = self.inner.lock();
        let tick = sessions.next_tick();
        if let Some(entry) = sessions.live(id, self.ttl) {
            entry.data = data;
            entry.touched = Instant::now();
            entry.tick = tick;
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }
}
