use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

/// Opaque identifier of one WebSocket session
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SessionId(String);

impl SessionId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The registry's view of a session: its id and the sending half of its queue
///
/// Cloning is cheap; the session itself keeps the socket and the receiver.
#[derive(Clone, Debug)]
pub struct SessionHandle {
    id: SessionId,
    queue: mpsc::UnboundedSender<String>,
}

impl SessionHandle {
    pub fn new(id: SessionId, queue: mpsc::UnboundedSender<String>) -> Self {
        Self { id, queue }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Never waits; false once the session stopped reading its queue
    pub fn enqueue(&self, line: String) -> bool {
        self.queue.send(line).is_ok()
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("session id {0} is already registered")]
    DuplicateId(SessionId),
}

/// Live WebSocket sessions, shared by the upgrade path, the relay and session teardown
///
/// One mutex guards the map. It is never held across an await or while a line is
/// being enqueued: broadcasters work on a [`snapshot`](Self::snapshot).
#[derive(Default)]
pub struct ClientRegistry {
    sessions: Mutex<HashMap<SessionId, SessionHandle>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, handle: SessionHandle) -> Result<(), RegistryError> {
        let mut sessions = self.sessions.lock();
        if sessions.contains_key(handle.id()) {
            return Err(RegistryError::DuplicateId(handle.id().clone()));
        }
        debug!("Registered session {}", handle.id());
        sessions.insert(handle.id().clone(), handle);
        Ok(())
    }

    /// Idempotent; returns whether an entry was actually removed
    pub fn remove(&self, id: &SessionId) -> bool {
        let removed = self.sessions.lock().remove(id).is_some();
        if removed {
            debug!("Removed session {}", id);
        }
        removed
    }

    /// Point-in-time copy for broadcasting
    pub fn snapshot(&self) -> Vec<SessionHandle> {
        self.sessions.lock().values().cloned().collect()
    }

    pub fn contains(&self, id: &SessionId) -> bool {
        self.sessions.lock().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }
}
