//! TTL cache in front of any [`IdentityResolver`].

use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::DashMap;
use skylink_common::http_client::HttpClient;
use skylink_common::{AtIdentifier, Did, Handle};
use smol_str::SmolStr;
use tokio::time::Instant;

use crate::did_doc::DidDocument;
use crate::resolver::{IdentityError, IdentityResolver, ResolvedIdentity, ResolverOptions, Result};

/// Inserts between sweeps of expired entries.
pub const DEFAULT_SWEEP_INTERVAL: usize = 256;

#[derive(Debug, Clone)]
enum Cached {
    Hit(ResolvedIdentity),
    Miss(SmolStr),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Cached,
    expires_at: Instant,
}

/// Caches full identity resolutions keyed by the identifier string.
///
/// Successful results live for `positive_ttl`, stable failures (see
/// [`IdentityError::is_cacheable_miss`]) for `negative_ttl`. Transient failures
/// are never cached. There is no request coalescing: two callers that miss at
/// the same time both hit the network.
///
/// Every `sweep_interval` inserts the whole map is swept of expired entries,
/// so identifiers that are never looked up again do not pile up.
///
/// The primitive lookups (`resolve_handle`, `resolve_did_doc`) pass straight
/// through.
#[derive(Debug)]
pub struct CachingResolver<R> {
    inner: R,
    entries: DashMap<SmolStr, Entry>,
    inserts: AtomicUsize,
    sweep_interval: usize,
}

impl<R: IdentityResolver> CachingResolver<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            entries: DashMap::new(),
            inserts: AtomicUsize::new(0),
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }

    pub fn with_sweep_interval(mut self, inserts: usize) -> Self {
        self.sweep_interval = inserts.max(1);
        self
    }

    pub fn inner(&self) -> &R {
        &self.inner
    }

    /// Drop any cached result for `ident`.
    pub fn invalidate(&self, ident: &str) {
        self.entries.remove(ident);
    }

    /// Remove entries whose lifetime has passed.
    pub fn purge_expired(&self) {
        let now = Instant::now();
        self.entries.retain(|_, e| e.expires_at > now);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn lookup(&self, key: &str) -> Option<Cached> {
        let now = Instant::now();
        // The shard guard is released at the end of this statement.
        let found = self
            .entries
            .get(key)
            .map(|e| (e.expires_at > now, e.value.clone()));
        match found {
            Some((true, value)) => Some(value),
            Some((false, _)) => {
                self.entries.remove_if(key, |_, e| e.expires_at <= now);
                None
            }
            None => None,
        }
    }

    fn store(&self, key: &str, value: Cached) {
        let ttl = match value {
            Cached::Hit(_) => self.inner.options().positive_ttl,
            Cached::Miss(_) => self.inner.options().negative_ttl,
        };
        let now = Instant::now();
        if (self.inserts.fetch_add(1, Ordering::Relaxed) + 1) % self.sweep_interval == 0 {
            self.entries.retain(|_, e| e.expires_at > now);
        }
        self.entries.insert(
            SmolStr::new(key),
            Entry {
                value,
                expires_at: now + ttl,
            },
        );
    }
}

impl<R: IdentityResolver + Sync + Send> IdentityResolver for CachingResolver<R> {
    fn options(&self) -> &ResolverOptions {
        self.inner.options()
    }

    async fn resolve_handle(&self, handle: &Handle) -> Result<Did> {
        self.inner.resolve_handle(handle).await
    }

    async fn resolve_did_doc(&self, did: &Did) -> Result<DidDocument> {
        self.inner.resolve_did_doc(did).await
    }

    #[cfg_attr(feature = "tracing", tracing::instrument(level = "debug", skip_all, fields(ident = %ident)))]
    async fn resolve_identity(&self, ident: &AtIdentifier) -> Result<ResolvedIdentity> {
        let key = ident.as_str();
        match self.lookup(key) {
            Some(Cached::Hit(id)) => return Ok(id),
            Some(Cached::Miss(reason)) => return Err(IdentityError::CachedMiss(reason)),
            None => {}
        }

        let result = self.inner.resolve_identity(ident).await;
        match &result {
            Ok(id) => {
                self.store(key, Cached::Hit(id.clone()));
                // A handle lookup also answers the DID lookup.
                if id.did.as_str() != key {
                    self.store(id.did.as_str(), Cached::Hit(id.clone()));
                }
            }
            Err(e) if e.is_cacheable_miss() => {
                #[cfg(feature = "tracing")]
                tracing::debug!(error = %e, "caching failed resolution");
                self.store(key, Cached::Miss(SmolStr::new(e.to_string())));
            }
            Err(_) => {}
        }
        result
    }
}

impl<R: HttpClient + Sync> HttpClient for CachingResolver<R> {
    type Error = R::Error;

    fn send_http(
        &self,
        request: http::Request<Vec<u8>>,
    ) -> impl core::future::Future<
        Output = core::result::Result<http::Response<Vec<u8>>, Self::Error>,
    > + Send {
        self.inner.send_http(request)
    }
}
