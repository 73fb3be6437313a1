//! Session registry: guarantees at most one active recording session
//! per device.
//!
//! The store is the single source of truth; this layer adds the
//! get-or-create serialization so concurrent registrations for the
//! same device cannot double-create. The partial unique index on
//! active sessions is the storage-level backstop.

use crate::model::Session;
use crate::store::{StoreError, TelemetryStore};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::instrument;

/// Store-backed registry of active recording sessions
pub struct SessionRegistry {
    store: Arc<TelemetryStore>,
    // Serializes the check-then-create path across connections.
    create_lock: Mutex<()>,
}

impl SessionRegistry {
    pub fn new(store: Arc<TelemetryStore>) -> Self {
        Self {
            store,
            create_lock: Mutex::new(()),
        }
    }

    /// Resolve the device's active session, creating one on first
    /// contact. Returns the session and whether it was newly created.
    #[instrument(skip(self))]
    pub async fn get_or_create_active(
        &self,
        device_id: &str,
    ) -> Result<(Session, bool), StoreError> {
        let _guard = self.create_lock.lock().await;
        self.store.get_or_create_active_session(device_id).await
    }

    /// Complete a session, stamping its end time. Errors if the
    /// session does not exist.
    pub async fn end_session(&self, session_id: &str) -> Result<(), StoreError> {
        self.store.end_session(session_id).await
    }

    /// The device's current active session, if any
    pub async fn get_active(&self, device_id: &str) -> Result<Option<Session>, StoreError> {
        self.store.get_active_session(device_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SessionStatus;
    use crate::store::tests::memory_store;

    #[tokio::test]
    async fn concurrent_registrations_share_one_session() {
        let store = Arc::new(memory_store().await);
        let registry = Arc::new(SessionRegistry::new(store));

        let a = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.get_or_create_active("AMR-010").await })
        };
        let b = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.get_or_create_active("AMR-010").await })
        };

        let (session_a, _) = a.await.unwrap().unwrap();
        let (session_b, _) = b.await.unwrap().unwrap();
        assert_eq!(session_a.session_id, session_b.session_id);
    }

    #[tokio::test]
    async fn ended_session_is_no_longer_active() {
        let store = Arc::new(memory_store().await);
        let registry = SessionRegistry::new(store);

        let (session, is_new) = registry.get_or_create_active("AMR-011").await.unwrap();
        assert!(is_new);
        assert_eq!(session.status, SessionStatus::Active);

        registry.end_session(&session.session_id).await.unwrap();
        assert!(registry.get_active("AMR-011").await.unwrap().is_none());
    }
}
