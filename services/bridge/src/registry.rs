//! Live-session registry.
//!
//! Maps `client_id` to its immutable context and session handle.  A second
//! registration for the same client evicts the first: most-recent wins, and
//! the older session's scope is cancelled so its transport closes with a
//! normal-closure code.

use fb_core::auth::ClientContext;
use fb_protocol::DeviceInfo;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Cancellation scope plus liveness flag for one session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub session_id: Uuid,
    pub cancel: CancellationToken,
    open: Arc<AtomicBool>,
}

impl SessionHandle {
    pub fn new(session_id: Uuid, cancel: CancellationToken) -> Self {
        SessionHandle {
            session_id,
            cancel,
            open: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    pub fn mark_closed(&self) {
        self.open.store(false, Ordering::SeqCst);
    }
}

struct Entry {
    context: Arc<ClientContext>,
    handle: SessionHandle,
}

#[derive(Default)]
pub struct ConnectionRegistry {
    inner: RwLock<HashMap<String, Entry>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        ConnectionRegistry::default()
    }

    /// Register a session, returning the handle of an evicted older session
    /// for the same client, if any.
    pub async fn register(
        &self,
        context: Arc<ClientContext>,
        handle: SessionHandle,
    ) -> Option<SessionHandle> {
        let mut inner = self.inner.write().await;
        inner
            .insert(
                context.client_id.clone(),
                Entry { context, handle },
            )
            .map(|old| old.handle)
    }

    /// Remove the entry only if it still belongs to `session_id`.
    pub async fn remove_if(&self, client_id: &str, session_id: Uuid) -> bool {
        let mut inner = self.inner.write().await;
        if inner
            .get(client_id)
            .is_some_and(|e| e.handle.session_id == session_id)
        {
            inner.remove(client_id);
            true
        } else {
            false
        }
    }

    pub async fn context(&self, client_id: &str) -> Option<Arc<ClientContext>> {
        self.inner
            .read()
            .await
            .get(client_id)
            .map(|e| Arc::clone(&e.context))
    }

    pub async fn handle(&self, client_id: &str) -> Option<SessionHandle> {
        self.inner.read().await.get(client_id).map(|e| e.handle.clone())
    }

    pub async fn is_connected(&self, client_id: &str) -> bool {
        self.inner
            .read()
            .await
            .get(client_id)
            .is_some_and(|e| e.handle.is_open())
    }

    pub async fn ids(&self) -> Vec<String> {
        self.inner.read().await.keys().cloned().collect()
    }

    pub async fn count(&self) -> usize {
        self.inner.read().await.len()
    }

    /// Admin view over every live session.
    pub async fn snapshot(&self) -> Vec<DeviceInfo> {
        let mut devices: Vec<DeviceInfo> = self
            .inner
            .read()
            .await
            .values()
            .map(|e| DeviceInfo {
                client_id: e.context.client_id.clone(),
                role: e.context.role.clone(),
                connected_at: e.context.connected_at,
                expires_at: e.context.expires_at,
            })
            .collect();
        devices.sort_by(|a, b| a.client_id.cmp(&b.client_id));
        devices
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn context(client_id: &str) -> Arc<ClientContext> {
        Arc::new(ClientContext {
            client_id: client_id.to_owned(),
            role: "sensor".to_owned(),
            allow_publish: vec!["telemetry.>".to_owned()],
            allow_subscribe: vec![],
            expires_at: Utc::now() + Duration::hours(1),
            connected_at: Utc::now(),
        })
    }

    #[tokio::test]
    async fn second_registration_evicts_the_first() {
        let registry = ConnectionRegistry::new();
        let first = SessionHandle::new(Uuid::new_v4(), CancellationToken::new());
        let second = SessionHandle::new(Uuid::new_v4(), CancellationToken::new());

        assert!(registry.register(context("c1"), first.clone()).await.is_none());
        let evicted = registry
            .register(context("c1"), second.clone())
            .await
            .expect("older session is evicted");
        assert_eq!(evicted.session_id, first.session_id);
        assert_eq!(registry.count().await, 1);
    }

    #[tokio::test]
    async fn remove_if_only_removes_the_owning_session() {
        let registry = ConnectionRegistry::new();
        let first = SessionHandle::new(Uuid::new_v4(), CancellationToken::new());
        let second = SessionHandle::new(Uuid::new_v4(), CancellationToken::new());
        registry.register(context("c1"), first.clone()).await;
        registry.register(context("c1"), second.clone()).await;

        // The evicted session's teardown must not unregister its successor.
        assert!(!registry.remove_if("c1", first.session_id).await);
        assert!(registry.is_connected("c1").await);
        assert!(registry.remove_if("c1", second.session_id).await);
        assert_eq!(registry.count().await, 0);
    }

    #[tokio::test]
    async fn snapshot_lists_contexts_sorted() {
        let registry = ConnectionRegistry::new();
        registry
            .register(context("b"), SessionHandle::new(Uuid::new_v4(), CancellationToken::new()))
            .await;
        registry
            .register(context("a"), SessionHandle::new(Uuid::new_v4(), CancellationToken::new()))
            .await;
        let snapshot = registry.snapshot().await;
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].client_id, "a");
        assert_eq!(snapshot[1].client_id, "b");
    }
}
