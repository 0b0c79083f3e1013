use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

/// One open event stream. Messages pushed here are written to the stream as
/// `message` events in FIFO order.
#[derive(Debug)]
pub struct Session {
    id: String,
    outbound: mpsc::UnboundedSender<String>,
    created_at: DateTime<Utc>,
}

impl Session {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Queues a message for the stream. Returns false once the stream is gone.
    pub fn push(&self, message: String) -> bool {
        self.outbound.send(message).is_ok()
    }
}

/// Live sessions keyed by id.
///
/// The registry holds the only long-lived sender of each session queue, so
/// removing a session closes its stream.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: DashMap<String, Arc<Session>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a session with a fresh unique id and returns it together
    /// with the receiving end of its queue.
    pub fn create(&self) -> (Arc<Session>, mpsc::UnboundedReceiver<String>) {
        let (outbound, receiver) = mpsc::unbounded_channel();
        let session = Arc::new(Session {
            id: Uuid::new_v4().to_string(),
            outbound,
            created_at: Utc::now(),
        });
        self.sessions
            .insert(session.id.clone(), Arc::clone(&session));
        info!(session_id = %session.id, active = self.sessions.len(), "session opened");
        (session, receiver)
    }

    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// Removes the session, closing its queue. Returns whether it existed.
    pub fn remove(&self, id: &str) -> bool {
        let removed = self.sessions.remove(id).is_some();
        if removed {
            info!(session_id = %id, active = self.sessions.len(), "session closed");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn close_all(&self) {
        let count = self.sessions.len();
        self.sessions.clear();
        debug!(count, "closed all sessions");
    }
}

/// Evicts a session when the stream that owns it is dropped.
pub(crate) struct SessionGuard {
    registry: Arc<SessionRegistry>,
    id: String,
}

impl SessionGuard {
    pub(crate) fn new(registry: Arc<SessionRegistry>, id: String) -> Self {
        Self { registry, id }
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.registry.remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_ids_are_unique() {
        let registry = SessionRegistry::new();
        let (first, _rx1) = registry.create();
        let (second, _rx2) = registry.create();
        assert_ne!(first.id(), second.id());
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test]
    async fn pushed_messages_arrive_in_order() {
        let registry = SessionRegistry::new();
        let (session, mut receiver) = registry.create();
        assert!(session.push("one".to_string()));
        assert!(session.push("two".to_string()));
        assert_eq!(receiver.recv().await.as_deref(), Some("one"));
        assert_eq!(receiver.recv().await.as_deref(), Some("two"));
    }

    #[tokio::test]
    async fn removal_closes_the_queue() {
        let registry = SessionRegistry::new();
        let (session, mut receiver) = registry.create();
        let id = session.id().to_string();
        drop(session);

        assert!(registry.remove(&id));
        assert!(!registry.remove(&id));
        assert!(registry.get(&id).is_none());
        assert!(receiver.recv().await.is_none());
    }

    #[test]
    fn guard_evicts_on_drop() {
        let registry = Arc::new(SessionRegistry::new());
        let (session, _receiver) = registry.create();
        let guard = SessionGuard::new(Arc::clone(&registry), session.id().to_string());
        assert_eq!(registry.len(), 1);
        drop(guard);
        assert!(registry.is_empty());
    }
}
