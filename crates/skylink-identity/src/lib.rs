//! Identity resolution for skylink.
//!
//! Turns a handle or DID into a verified [`resolver::ResolvedIdentity`]: the
//! account DID, the handle that DID claims (checked in both directions) and the
//! account's PDS.
//!
//! ## Quick start
//!
//! ```no_run
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! use skylink_identity::{CachingResolver, SkylinkResolver};
//! use skylink_identity::resolver::{IdentityResolver, ResolverOptions};
//!
//! let resolver = CachingResolver::new(SkylinkResolver::with_defaults(
//!     ResolverOptions::default(),
//!     "skylink/0.3",
//! )?);
//!
//! let id = resolver.resolve_str("alice.bsky.social").await?;
//! println!("{} lives on {}", id.did, id.pds);
//! # Ok(())
//! # }
//! ```
//!
//! Every URL is passed through the SSRF guard in
//! [`skylink_common::url_guard`] before it is fetched, including the PLC
//! directory and `did:web` hosts.

pub mod cache;
pub mod did_doc;
pub mod resolver;

pub use cache::CachingResolver;

use http::header::ACCEPT;
use percent_encoding::percent_decode_str;
use resolver::{IdentityError, IdentityResolver, ResolverOptions};
use skylink_common::http_client::HttpClient;
use skylink_common::url_guard::ensure_safe;
use skylink_common::{Did, Handle, TransportError};
use url::Url;

use crate::did_doc::DidDocument;

/// Default resolver implementation over any [`HttpClient`].
#[derive(Debug, Clone)]
pub struct SkylinkResolver<C> {
    http: C,
    opts: ResolverOptions,
}

/// Resolver over the hardened `reqwest` client, with caching.
#[cfg(feature = "reqwest-client")]
pub type DefaultResolver = CachingResolver<SkylinkResolver<reqwest::Client>>;

#[cfg(feature = "reqwest-client")]
impl SkylinkResolver<reqwest::Client> {
    /// Build a resolver on a client that refuses redirects and honours `opts.timeout`.
    pub fn with_defaults(opts: ResolverOptions, user_agent: &str) -> resolver::Result<Self> {
        let http = skylink_common::http_client::hardened_client(opts.timeout, user_agent)
            .map_err(TransportError::from)?;
        Ok(Self::new(http, opts))
    }
}

impl<C: HttpClient> SkylinkResolver<C> {
    pub fn new(http: C, opts: ResolverOptions) -> Self {
        #[cfg(feature = "tracing")]
        tracing::info!(
            plc_directory = %opts.plc_directory,
            timeout = ?opts.timeout,
            "skylink resolver created"
        );

        Self { http, opts }
    }

    pub fn http(&self) -> &C {
        &self.http
    }

    /// Construct the well-known HTTPS URL for a `did:web` DID.
    ///
    /// - `did:web:example.com` → `https://example.com/.well-known/did.json`
    /// - `did:web:example.com:user:alice` → `https://example.com/user/alice/did.json`
    fn did_web_url(did: &Did) -> resolver::Result<Url> {
        let s = did.as_str();
        let rest = s
            .strip_prefix("did:web:")
            .ok_or_else(|| IdentityError::unsupported_did_method(s))?;
        let mut parts = rest.split(':');
        let host = parts
            .next()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| IdentityError::unsupported_did_method(s))?;
        let host = percent_decode_str(host).decode_utf8_lossy();
        let mut url = Url::parse(&format!("https://{host}/"))?;
        let path: Vec<&str> = parts.collect();
        if path.is_empty() {
            url.set_path(".well-known/did.json");
        } else {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| url::ParseError::SetHostOnCannotBeABaseUrl)?;
            for seg in path {
                let decoded = percent_decode_str(seg).decode_utf8_lossy();
                segments.push(&decoded);
            }
            segments.push("did.json");
        }
        Ok(url)
    }

    fn plc_url(&self, did: &Did) -> resolver::Result<Url> {
        // `Url::join` would treat the colons in the DID as a scheme.
        let base = self.opts.plc_directory.as_str();
        let sep = if base.ends_with('/') { "" } else { "/" };
        Ok(Url::parse(&format!("{base}{sep}{did}"))?)
    }

    fn parse_atproto_did_body(body: &str) -> resolver::Result<Did> {
        let line = body
            .lines()
            .find(|l| !l.trim().is_empty())
            .ok_or(IdentityError::InvalidWellKnown)?;
        Did::new(line.trim()).map_err(|_| IdentityError::InvalidWellKnown)
    }
}

impl<C: HttpClient + Sync> SkylinkResolver<C> {
    /// Guarded GET; non-2xx statuses become [`IdentityError::HttpStatus`].
    async fn fetch(&self, url: &Url, accept: &'static str) -> resolver::Result<Vec<u8>> {
        ensure_safe(url).map_err(|e| IdentityError::unsafe_url(url, e))?;
        let request = http::Request::builder()
            .method(http::Method::GET)
            .uri(url.as_str())
            .header(ACCEPT, accept)
            .body(Vec::new())
            .map_err(TransportError::from)?;
        let response = tokio::time::timeout(self.opts.timeout, self.http.send_http(request))
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(TransportError::other)?;
        if !response.status().is_success() {
            return Err(IdentityError::HttpStatus(response.status()));
        }
        Ok(response.into_body())
    }
}

impl<C: HttpClient + Sync> IdentityResolver for SkylinkResolver<C> {
    fn options(&self) -> &ResolverOptions {
        &self.opts
    }

    #[cfg_attr(feature = "tracing", tracing::instrument(level = "debug", skip(self), fields(handle = %handle)))]
    async fn resolve_handle(&self, handle: &Handle) -> resolver::Result<Did> {
        let url = Url::parse(&format!(
            "https://{}/.well-known/atproto-did",
            handle.as_str()
        ))?;
        let body = self.fetch(&url, "text/plain").await?;
        Self::parse_atproto_did_body(&String::from_utf8_lossy(&body))
    }

    #[cfg_attr(feature = "tracing", tracing::instrument(level = "debug", skip(self), fields(did = %did)))]
    async fn resolve_did_doc(&self, did: &Did) -> resolver::Result<DidDocument> {
        let url = match did.method() {
            "plc" => self.plc_url(did)?,
            "web" => Self::did_web_url(did)?,
            _ => return Err(IdentityError::unsupported_did_method(did.as_str())),
        };
        let body = self.fetch(&url, "application/did+ld+json, application/json").await?;
        Ok(serde_json::from_slice(&body)?)
    }
}

/// The resolver doubles as the HTTP client of the layers built on it.
impl<C: HttpClient + Sync> HttpClient for SkylinkResolver<C> {
    type Error = C::Error;

    fn send_http(
        &self,
        request: http::Request<Vec<u8>>,
    ) -> impl core::future::Future<
        Output = core::result::Result<http::Response<Vec<u8>>, Self::Error>,
    > + Send {
        self.http.send_http(request)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::collections::VecDeque;
    use std::sync::Arc;

    use skylink_common::http_client::HttpClient;

    /// Queue of canned responses plus a log of every request sent.
    #[derive(Clone, Default)]
    pub struct MockClient {
        queue: Arc<tokio::sync::Mutex<VecDeque<http::Response<Vec<u8>>>>>,
        pub log: Arc<tokio::sync::Mutex<Vec<http::Request<Vec<u8>>>>>,
    }

    impl MockClient {
        pub async fn push(&self, status: u16, body: impl Into<Vec<u8>>) {
            let mut resp = http::Response::new(body.into());
            *resp.status_mut() = http::StatusCode::from_u16(status).unwrap();
            self.queue.lock().await.push_back(resp);
        }

        pub async fn urls(&self) -> Vec<String> {
            self.log
                .lock()
                .await
                .iter()
                .map(|r| r.uri().to_string())
                .collect()
        }
    }

    impl HttpClient for MockClient {
        type Error = std::convert::Infallible;
        fn send_http(
            &self,
            request: http::Request<Vec<u8>>,
        ) -> impl core::future::Future<
            Output = core::result::Result<http::Response<Vec<u8>>, Self::Error>,
        > + Send {
            let queue = self.queue.clone();
            let log = self.log.clone();
            async move {
                log.lock().await.push(request);
                Ok(queue.lock().await.pop_front().expect("no queued response"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::MockClient;
    use super::*;
    use serde_json::json;

    fn resolver(http: MockClient) -> SkylinkResolver<MockClient> {
        SkylinkResolver::new(http, ResolverOptions::default())
    }

    fn web_url(s: &str) -> String {
        let did = Did::new(s).unwrap();
        SkylinkResolver::<MockClient>::did_web_url(&did)
            .unwrap()
            .to_string()
    }

    fn alice_doc() -> Vec<u8> {
        serde_json::to_vec(&json!({
            "id": "did:plc:alice",
            "alsoKnownAs": ["at://alice.example.com"],
            "service": [{"id": "#atproto_pds", "type": "AtprotoPersonalDataServer", "serviceEndpoint": "https://pds.example.com"}]
        }))
        .unwrap()
    }

    #[test]
    fn did_web_urls() {
        assert_eq!(
            web_url("did:web:example.com"),
            "https://example.com/.well-known/did.json"
        );
        assert_eq!(
            web_url("did:web:example.com:user:alice"),
            "https://example.com/user/alice/did.json"
        );
    }

    #[test]
    fn plc_urls() {
        let r = resolver(MockClient::default());
        let did = Did::new("did:plc:abc123").unwrap();
        assert_eq!(
            r.plc_url(&did).unwrap().as_str(),
            "https://plc.directory/did:plc:abc123"
        );
    }

    #[test]
    fn well_known_body() {
        type R = SkylinkResolver<MockClient>;
        assert_eq!(
            R::parse_atproto_did_body("\n  did:plc:alice  \nignored").unwrap().as_str(),
            "did:plc:alice"
        );
        assert!(matches!(
            R::parse_atproto_did_body("\n\n"),
            Err(IdentityError::InvalidWellKnown)
        ));
        assert!(matches!(
            R::parse_atproto_did_body("<html>"),
            Err(IdentityError::InvalidWellKnown)
        ));
    }

    #[tokio::test]
    async fn resolves_handle_end_to_end() {
        let http = MockClient::default();
        http.push(200, "did:plc:alice\n").await;
        http.push(200, alice_doc()).await;
        let r = resolver(http.clone());

        let id = r.resolve_str("Alice.Example.com").await.unwrap();
        assert_eq!(id.did.as_str(), "did:plc:alice");
        assert_eq!(id.handle.unwrap().as_str(), "alice.example.com");
        assert_eq!(id.pds.as_str(), "https://pds.example.com/");
        assert_eq!(
            http.urls().await,
            vec![
                "https://alice.example.com/.well-known/atproto-did",
                "https://plc.directory/did:plc:alice",
            ]
        );
    }

    #[tokio::test]
    async fn not_found_is_status_error() {
        let http = MockClient::default();
        http.push(404, "").await;
        let r = resolver(http);
        let err = r
            .resolve_handle(&Handle::new("gone.example.com").unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, IdentityError::HttpStatus(s) if s.as_u16() == 404));
        assert!(err.is_cacheable_miss());
    }

    #[tokio::test]
    async fn unsafe_hosts_are_never_dialed() {
        let http = MockClient::default();
        let r = resolver(http.clone());
        let err = r
            .resolve_did_doc(&Did::new("did:web:printer.local").unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, IdentityError::UnsafeUrl { .. }));
        let err = r
            .resolve_did_doc(&Did::new("did:web:pds.example.com%3A8080").unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, IdentityError::UnsafeUrl { .. }));
        assert!(http.urls().await.is_empty());
    }

    #[tokio::test]
    async fn unsupported_method() {
        let r = resolver(MockClient::default());
        let err = r
            .resolve_did_doc(&Did::new("did:key:zQ3sh").unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, IdentityError::UnsupportedDidMethod(m) if m == "did:key:zQ3sh"));
    }
}
