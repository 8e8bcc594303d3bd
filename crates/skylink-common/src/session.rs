//! Generic session storage traits and utilities.

use async_trait::async_trait;
use miette::Diagnostic;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::BoxError;

/// Errors emitted by session stores.
#[derive(Debug, thiserror::Error, Diagnostic)]
pub enum SessionStoreError {
    /// Serialization error (e.g., JSON)
    #[error("serialization error: {0}")]
    #[diagnostic(code(skylink::session_store::serde))]
    Serde(#[from] serde_json::Error),
    /// Any other error from a backend implementation
    #[error(transparent)]
    #[diagnostic(code(skylink::session_store::other))]
    Other(#[from] BoxError),
}

/// Pluggable storage for arbitrary session records.
#[async_trait]
pub trait SessionStore<K, T>: Send + Sync
where
    K: Eq + Hash + Send + Sync,
    T: Clone + Send,
{
    /// Get the current session if present.
    async fn get(&self, key: &K) -> Result<Option<T>, SessionStoreError>;
    /// Persist the given session.
    async fn set(&self, key: K, session: T) -> Result<(), SessionStoreError>;
    /// Delete the given session.
    async fn del(&self, key: &K) -> Result<(), SessionStoreError>;

    /// Remove and return the record in one step.
    ///
    /// The default is a get followed by a delete. Backends shared between
    /// processes must override it with a single delete-returning operation so
    /// that two concurrent takers cannot both observe the record.
    async fn take(&self, key: &K) -> Result<Option<T>, SessionStoreError> {
        let found = self.get(key).await?;
        if found.is_some() {
            self.del(key).await?;
        }
        Ok(found)
    }
}

/// In-memory session store suitable for short-lived sessions and tests.
#[derive(Clone)]
pub struct MemorySessionStore<K, T>(Arc<RwLock<HashMap<K, T>>>);

impl<K, T> Default for MemorySessionStore<K, T> {
    fn default() -> Self {
        Self(Arc::new(RwLock::new(HashMap::new())))
    }
}

impl<K, T> MemorySessionStore<K, T> {
    pub async fn len(&self) -> usize {
        self.0.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.0.read().await.is_empty()
    }

    /// Mutate the record under `key` in place while holding the write lock.
    ///
    /// Returns `false` when there is no such record.
    pub async fn update<F>(&self, key: &K, f: F) -> bool
    where
        K: Eq + Hash,
        F: FnOnce(&mut T),
    {
        match self.0.write().await.get_mut(key) {
            Some(record) => {
                f(record);
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl<K, T> SessionStore<K, T> for MemorySessionStore<K, T>
where
    K: Eq + Hash + Send + Sync,
    T: Clone + Send + Sync + 'static,
{
    async fn get(&self, key: &K) -> Result<Option<T>, SessionStoreError> {
        Ok(self.0.read().await.get(key).cloned())
    }
    async fn set(&self, key: K, session: T) -> Result<(), SessionStoreError> {
        self.0.write().await.insert(key, session);
        Ok(())
    }
    async fn del(&self, key: &K) -> Result<(), SessionStoreError> {
        self.0.write().await.remove(key);
        Ok(())
    }
    async fn take(&self, key: &K) -> Result<Option<T>, SessionStoreError> {
        Ok(self.0.write().await.remove(key))
    }
}
