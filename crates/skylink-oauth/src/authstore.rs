//! Storage for sessions and pending authorization requests.

use std::sync::Arc;

use skylink_common::Did;
use skylink_common::session::{MemorySessionStore, SessionStore, SessionStoreError};
use smol_str::SmolStr;

use crate::session::{PendingAuthRequest, Session};

/// What the OAuth client persists. Implement this over the host's database.
///
/// `take_auth_request` must be atomic: of two concurrent callers with the same
/// state, at most one gets the request. `update_resource_nonce` must write the
/// nonce field alone, never a whole session read earlier, or a refresh that
/// lands in between is rolled back.
#[async_trait::async_trait]
pub trait ClientAuthStore: Send + Sync {
    async fn get_session(&self, did: &Did) -> Result<Option<Session>, SessionStoreError>;

    async fn upsert_session(&self, session: &Session) -> Result<(), SessionStoreError>;

    async fn delete_session(&self, did: &Did) -> Result<(), SessionStoreError>;

    async fn save_auth_request(&self, request: &PendingAuthRequest)
    -> Result<(), SessionStoreError>;

    /// Load and delete the request stored under `state`.
    async fn take_auth_request(
        &self,
        state: &str,
    ) -> Result<Option<PendingAuthRequest>, SessionStoreError>;

    /// Overwrite only the resource server nonce of a stored session. Unknown
    /// DIDs are ignored.
    ///
    /// Called concurrently with refreshes and with other XRPC calls.
    async fn update_resource_nonce(&self, did: &Did, nonce: &str)
    -> Result<(), SessionStoreError>;
}

/// In-memory [`ClientAuthStore`] built on [`MemorySessionStore`].
#[derive(Clone, Default)]
pub struct MemoryAuthStore {
    sessions: MemorySessionStore<Did, Session>,
    requests: MemorySessionStore<SmolStr, PendingAuthRequest>,
}

impl MemoryAuthStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.len().await
    }

    pub async fn pending_count(&self) -> usize {
        self.requests.len().await
    }
}

#[async_trait::async_trait]
impl ClientAuthStore for MemoryAuthStore {
    async fn get_session(&self, did: &Did) -> Result<Option<Session>, SessionStoreError> {
        self.sessions.get(did).await
    }

    async fn upsert_session(&self, session: &Session) -> Result<(), SessionStoreError> {
        self.sessions
            .set(session.subject_did.clone(), session.clone())
            .await
    }

    async fn delete_session(&self, did: &Did) -> Result<(), SessionStoreError> {
        self.sessions.del(did).await
    }

    async fn save_auth_request(
        &self,
        request: &PendingAuthRequest,
    ) -> Result<(), SessionStoreError> {
        self.requests
            .set(request.state.clone(), request.clone())
            .await
    }

    async fn take_auth_request(
        &self,
        state: &str,
    ) -> Result<Option<PendingAuthRequest>, SessionStoreError> {
        self.requests.take(&SmolStr::new(state)).await
    }

    async fn update_resource_nonce(
        &self,
        did: &Did,
        nonce: &str,
    ) -> Result<(), SessionStoreError> {
        self.sessions
            .update(did, |session| {
                session.dpop_resource_server_nonce = SmolStr::new(nonce);
            })
            .await;
        Ok(())
    }
}

#[async_trait::async_trait]
impl<T: ClientAuthStore + ?Sized> ClientAuthStore for Arc<T> {
    async fn get_session(&self, did: &Did) -> Result<Option<Session>, SessionStoreError> {
        self.as_ref().get_session(did).await
    }

    async fn upsert_session(&self, session: &Session) -> Result<(), SessionStoreError> {
        self.as_ref().upsert_session(session).await
    }

    async fn delete_session(&self, did: &Did) -> Result<(), SessionStoreError> {
        self.as_ref().delete_session(did).await
    }

    async fn save_auth_request(
        &self,
        request: &PendingAuthRequest,
    ) -> Result<(), SessionStoreError> {
        self.as_ref().save_auth_request(request).await
    }

    async fn take_auth_request(
        &self,
        state: &str,
    ) -> Result<Option<PendingAuthRequest>, SessionStoreError> {
        self.as_ref().take_auth_request(state).await
    }

    async fn update_resource_nonce(
        &self,
        did: &Did,
        nonce: &str,
    ) -> Result<(), SessionStoreError> {
        self.as_ref().update_resource_nonce(did, nonce).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::fixtures::session;

    #[tokio::test]
    async fn nonce_update_touches_only_nonce() {
        let store = MemoryAuthStore::new();
        let s = session("did:plc:alice");
        store.upsert_session(&s).await.unwrap();

        store
            .update_resource_nonce(&s.subject_did, "rs-nonce")
            .await
            .unwrap();
        let stored = store.get_session(&s.subject_did).await.unwrap().unwrap();
        assert_eq!(stored.dpop_resource_server_nonce, "rs-nonce");
        assert_eq!(stored.access_token, s.access_token);

        // Unknown DIDs are ignored.
        let other = Did::new("did:plc:bob").unwrap();
        store.update_resource_nonce(&other, "x").await.unwrap();
        assert_eq!(store.session_count().await, 1);
    }

    #[tokio::test]
    async fn nonce_update_never_rolls_back_a_refresh() {
        use crate::xrpc::NonceUpdate;

        let store = Arc::new(MemoryAuthStore::new());
        let s = session("did:plc:alice");
        store.upsert_session(&s).await.unwrap();
        let mut refreshed = s.clone();
        refreshed.access_token = "access-2".into();
        refreshed.refresh_token = "refresh-2".into();

        let callback: Arc<dyn NonceUpdate> = store.clone();
        let (nonce, upsert) = tokio::join!(
            callback.on_nonce_update(&s.subject_did, "rs-9"),
            async {
                tokio::task::yield_now().await;
                store.upsert_session(&refreshed).await
            },
        );
        nonce.unwrap();
        upsert.unwrap();
        let stored = store.get_session(&s.subject_did).await.unwrap().unwrap();
        assert_eq!(stored.access_token, "access-2");
        assert_eq!(stored.refresh_token, "refresh-2");

        // A nonce that arrives after the refresh is layered on top of it.
        callback.on_nonce_update(&s.subject_did, "rs-10").await.unwrap();
        let stored = store.get_session(&s.subject_did).await.unwrap().unwrap();
        assert_eq!(stored.refresh_token, "refresh-2");
        assert_eq!(stored.dpop_resource_server_nonce, "rs-10");
    }

    #[tokio::test]
    async fn delete_session() {
        let store = Arc::new(MemoryAuthStore::new());
        let s = session("did:plc:alice");
        store.upsert_session(&s).await.unwrap();
        store.delete_session(&s.subject_did).await.unwrap();
        assert!(store.get_session(&s.subject_did).await.unwrap().is_none());
    }
}
