//! Process-local registry of open sessions.

use std::{
    collections::HashMap,
    sync::{Arc, PoisonError, RwLock},
    time::{SystemTime, UNIX_EPOCH},
};

use session_relay_core::{SessionId, Transport};

/// Registry error.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Session already registered: {0}")]
    Duplicate(SessionId),
}

/// Summary of a registered session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    /// Session identifier.
    pub id: SessionId,
    /// Registration timestamp (Unix epoch seconds).
    pub created_at: i64,
}

struct Entry {
    created_at: i64,
    transport: Arc<dyn Transport>,
}

/// Sessions whose streaming connection is held by this process.
///
/// Not shared across processes; follow-up requests never consult it.
/// Owned by the hosting process and injected into the session relay.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<SessionId, Entry>>,
}

impl SessionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Register a session bound to a live transport.
    ///
    /// # Errors
    /// Returns error if the session id is already registered.
    pub fn register(&self, transport: Arc<dyn Transport>) -> Result<SessionId, RegistryError> {
        let id = transport.session_id().clone();
        let mut sessions = self
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if sessions.contains_key(&id) {
            return Err(RegistryError::Duplicate(id));
        }
        sessions.insert(
            id.clone(),
            Entry {
                created_at: now(),
                transport,
            },
        );
        Ok(id)
    }

    /// Remove a session. Returns false if it was not registered.
    pub fn unregister(&self, id: &SessionId) -> bool {
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
            .is_some()
    }

    /// List registered sessions, newest first.
    #[must_use]
    pub fn list(&self) -> Vec<SessionInfo> {
        let sessions = self.sessions.read().unwrap_or_else(PoisonError::into_inner);
        let mut result: Vec<SessionInfo> = sessions
            .iter()
            .map(|(id, entry)| SessionInfo {
                id: id.clone(),
                created_at: entry.created_at,
            })
            .collect();
        result.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        result
    }

    /// Transport of a registered session.
    #[must_use]
    pub fn transport(&self, id: &SessionId) -> Option<Arc<dyn Transport>> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .map(|entry| Arc::clone(&entry.transport))
    }

    /// Whether a session is registered.
    #[must_use]
    pub fn contains(&self, id: &SessionId) -> bool {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(id)
    }

    /// Number of registered sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether no sessions are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}
