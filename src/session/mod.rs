pub mod channel;
pub mod connection;
pub mod rate_limit;

use ahash::{HashMap, HashMapExt};
use parking_lot::RwLock;
use std::{
    sync::Arc,
    time::Instant,
};

use channel::Tx;
use rate_limit::RateLimiter;

/// Rewraps `HashMap` the way the teacher's `Table` does, so every registry
/// in this crate pre-allocates instead of growing one insert at a time.
pub struct Table<K, V>(HashMap<K, V>);

impl<K, V> Default for Table<K, V> {
    fn default() -> Self {
        Self(HashMap::with_capacity(256))
    }
}

impl<K, V> std::ops::Deref for Table<K, V> {
    type Target = HashMap<K, V>;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<K, V> std::ops::DerefMut for Table<K, V> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

/// Per-session attestation bookkeeping (see `attestation` module for the
/// gateway that reads and writes it).
pub struct AttestationState {
    pub connected_at: Instant,
    pub attested: bool,
    pub pending: bool,
    pub session_token: Option<String>,
    pub token_expires_at: Option<Instant>,
}

impl AttestationState {
    fn new() -> Self {
        Self {
            connected_at: Instant::now(),
            attested: false,
            pending: false,
            session_token: None,
            token_expires_at: None,
        }
    }
}

/// Everything the rest of the crate needs to know about one live
/// connection. Owned by the registry; handlers receive `Arc<SessionHandle>`.
pub struct SessionHandle {
    pub id: String,
    pub tx: Tx,
    pub frame_limiter: RateLimiter,
    pub upstream_limiter: RateLimiter,
    pub pairing_code: RwLock<Option<String>>,
    pub public_key: RwLock<Option<String>>,
    pub attestation: RwLock<AttestationState>,
    pub last_activity: RwLock<Instant>,
}

impl SessionHandle {
    pub fn new(id: String, tx: Tx, frame_rate_per_min: u32, upstream_rate_per_min: u32) -> Self {
        Self {
            id,
            tx,
            frame_limiter: RateLimiter::per_minute(frame_rate_per_min),
            upstream_limiter: RateLimiter::per_minute(upstream_rate_per_min),
            pairing_code: RwLock::new(None),
            public_key: RwLock::new(None),
            attestation: RwLock::new(AttestationState::new()),
            last_activity: RwLock::new(Instant::now()),
        }
    }

    pub fn touch(&self) {
        *self.last_activity.write() = Instant::now();
    }

    pub fn is_registered(&self) -> bool {
        self.pairing_code.read().is_some()
    }
}

/// Maps session ids to handles and pairing codes to session ids. Locks are
/// held only for the map mutation itself; no I/O happens while either lock
/// is taken.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<Table<String, Arc<SessionHandle>>>,
    by_code: RwLock<Table<String, String>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, session: Arc<SessionHandle>) {
        self.sessions.write().insert(session.id.clone(), session);
    }

    pub fn get(&self, id: &str) -> Option<Arc<SessionHandle>> {
        self.sessions.read().get(id).cloned()
    }

    pub fn get_by_code(&self, code: &str) -> Option<Arc<SessionHandle>> {
        let id = self.by_code.read().get(code).cloned()?;
        self.get(&id)
    }

    /// Binds `code` to `session_id`. Fails if the code is already taken by
    /// a different live session.
    pub fn bind_code(&self, code: &str, session_id: &str) -> Result<(), ()> {
        let mut by_code = self.by_code.write();
        if let Some(existing) = by_code.get(code) {
            if existing != session_id {
                return Err(());
            }
        }
        by_code.insert(code.to_string(), session_id.to_string());
        Ok(())
    }

    pub fn remove(&self, session_id: &str) -> Option<Arc<SessionHandle>> {
        let removed = self.sessions.write().remove(session_id);
        if let Some(session) = &removed {
            if let Some(code) = session.pairing_code.read().clone() {
                self.by_code.write().remove(&code);
            }
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    /// Snapshot of every live session. Used by periodic sweepers; never
    /// called from a per-frame handler.
    pub fn all(&self) -> Vec<Arc<SessionHandle>> {
        self.sessions.read().values().cloned().collect()
    }
}
