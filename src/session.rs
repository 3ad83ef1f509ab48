//! Live session state, shared by every connection handler.
//!
//! Expiry is lazy: `try_get` removes an expired entry the moment it is
//! observed. `cleanup_expired` only reclaims memory for sessions nobody
//! asks about anymore.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use uuid::Uuid;

use crate::error::{Result, ZerolinkError};
use crate::peer::PeerId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new_random() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub id: SessionId,
    pub remote_peer: PeerId,
    pub expires_at: Instant,
}

impl Session {
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }

    /// Expiry as unix milliseconds, the form carried in a ServiceResponse.
    pub fn expires_at_unix_millis(&self) -> i64 {
        let remaining = self.expires_at.saturating_duration_since(Instant::now());
        (SystemTime::now() + remaining)
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as i64
    }
}

#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: DashMap<SessionId, Session>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a session with a fresh id that is not present in the registry.
    pub fn create(&self, remote_peer: PeerId, lifetime: Duration) -> Session {
        loop {
            let id = SessionId::new_random();
            if let Entry::Vacant(slot) = self.sessions.entry(id) {
                let session = Session {
                    id,
                    remote_peer,
                    expires_at: Instant::now() + lifetime,
                };
                slot.insert(session.clone());
                return session;
            }
        }
    }

    /// Register a session whose id was assigned by the remote side.
    pub fn adopt(&self, id: SessionId, remote_peer: PeerId, lifetime: Duration) -> Result<Session> {
        match self.sessions.entry(id) {
            Entry::Occupied(_) => Err(ZerolinkError::DuplicateSession(id)),
            Entry::Vacant(slot) => {
                let session = Session {
                    id,
                    remote_peer,
                    expires_at: Instant::now() + lifetime,
                };
                slot.insert(session.clone());
                Ok(session)
            }
        }
    }

    pub fn try_get(&self, id: &SessionId) -> Option<Session> {
        if let Some(session) = self.sessions.get(id) {
            if !session.is_expired() {
                return Some(session.clone());
            }
        }
        // The read guard is released above; remove_if re-checks under the write lock
        self.sessions.remove_if(id, |_, s| s.is_expired());
        None
    }

    /// Push expiry out to `lifetime` from now. Returns false if the session is gone or expired.
    pub fn extend(&self, id: &SessionId, lifetime: Duration) -> bool {
        match self.sessions.get_mut(id) {
            Some(mut session) if !session.is_expired() => {
                session.expires_at = Instant::now() + lifetime;
                true
            }
            _ => false,
        }
    }

    pub fn remove(&self, id: &SessionId) -> Option<Session> {
        self.sessions.remove(id).map(|(_, s)| s)
    }

    /// Drop every expired entry. Returns how many were reclaimed.
    pub fn cleanup_expired(&self) -> usize {
        let before = self.sessions.len();
        self.sessions.retain(|_, s| !s.is_expired());
        before.saturating_sub(self.sessions.len())
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
