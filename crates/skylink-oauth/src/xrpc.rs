//! DPoP-authenticated XRPC calls against a session's PDS.
//!
//! Each call is a short bounded loop: build a fresh proof with the current
//! resource server nonce, send, and if the server answers with a nonce
//! challenge, adopt the nonce it handed out and go again. The nonce lives in
//! the session behind a mutex; the persistence callback runs after the lock
//! is released and its failures are only logged.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, USER_AGENT};
use http::{HeaderMap, HeaderName, HeaderValue, Method, Request, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use skylink_common::http_client::{DEFAULT_TIMEOUT, HttpClient};
use skylink_common::session::SessionStoreError;
use skylink_common::url_guard::ensure_safe;
use skylink_common::{Did, RequestContext, TransportError};
use smol_str::SmolStr;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::Mutex;
use url::Url;

use crate::authstore::ClientAuthStore;
use crate::config::DEFAULT_USER_AGENT;
use crate::dpop::{header_nonce, make_dpop_proof, nonce_challenge};
use crate::error::{OAuthError, RateLimit, Result, RpcError};
use crate::request::Attempt;
use crate::session::Session;

/// Attempts per call: the first try plus two nonce retries.
pub const MAX_ATTEMPTS: u32 = 3;

/// Told about every resource server nonce change so it can be persisted.
#[async_trait::async_trait]
pub trait NonceUpdate: Send + Sync {
    async fn on_nonce_update(
        &self,
        did: &Did,
        nonce: &str,
    ) -> core::result::Result<(), SessionStoreError>;
}

#[async_trait::async_trait]
impl<T: ClientAuthStore + ?Sized> NonceUpdate for T {
    async fn on_nonce_update(
        &self,
        did: &Did,
        nonce: &str,
    ) -> core::result::Result<(), SessionStoreError> {
        self.update_resource_nonce(did, nonce).await
    }
}

/// A procedure's input.
pub enum XrpcBody {
    Bytes(Bytes),
    /// Read to the end once, before the first attempt.
    Stream(Box<dyn AsyncRead + Send + Unpin>),
    Json(serde_json::Value),
}

impl fmt::Debug for XrpcBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bytes(b) => f.debug_tuple("Bytes").field(&b.len()).finish(),
            Self::Stream(_) => f.write_str("Stream"),
            Self::Json(v) => f.debug_tuple("Json").field(v).finish(),
        }
    }
}

impl XrpcBody {
    async fn into_bytes(self) -> Result<Bytes> {
        match self {
            Self::Bytes(b) => Ok(b),
            Self::Stream(mut reader) => {
                let mut buf = Vec::new();
                reader
                    .read_to_end(&mut buf)
                    .await
                    .map_err(OAuthError::encode)?;
                Ok(Bytes::from(buf))
            }
            Self::Json(v) => serde_json::to_vec(&v)
                .map(Bytes::from)
                .map_err(OAuthError::encode),
        }
    }
}

/// Where a successful response body goes.
pub enum ResponseSink<'a, T = serde_json::Value> {
    Bytes(&'a mut Vec<u8>),
    Json(&'a mut T),
    Discard,
}

impl<'a> ResponseSink<'a, serde_json::Value> {
    pub fn bytes(buf: &'a mut Vec<u8>) -> Self {
        Self::Bytes(buf)
    }

    pub fn discard() -> Self {
        Self::Discard
    }
}

/// A successful XRPC response.
#[derive(Debug, Clone)]
pub struct XrpcResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl XrpcResponse {
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.body).map_err(OAuthError::decode)
    }

    pub fn write_into<T: DeserializeOwned>(&self, sink: ResponseSink<'_, T>) -> Result<()> {
        match sink {
            ResponseSink::Bytes(buf) => {
                buf.clear();
                buf.extend_from_slice(&self.body);
            }
            ResponseSink::Json(out) => *out = self.parse()?,
            ResponseSink::Discard => {}
        }
        Ok(())
    }
}

#[derive(Deserialize)]
struct XrpcErrorBody {
    error: Option<SmolStr>,
    message: Option<SmolStr>,
}

impl RpcError {
    fn from_response(response: &Response<Vec<u8>>) -> Self {
        let body = serde_json::from_slice::<XrpcErrorBody>(response.body()).ok();
        let (code, message) = match body {
            Some(b) => (b.error, b.message),
            None => (None, None),
        };
        Self {
            status: response.status(),
            code,
            message,
            rate_limit: RateLimit::from_headers(response.headers()),
        }
    }
}

/// Executes XRPC calls on behalf of one session.
pub struct XrpcClient<C> {
    http: Arc<C>,
    session: Mutex<Session>,
    user_agent: SmolStr,
    extra_headers: HeaderMap,
    timeout: Duration,
    nonce_update: Option<Arc<dyn NonceUpdate>>,
}

impl<C> fmt::Debug for XrpcClient<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("XrpcClient")
            .field("user_agent", &self.user_agent)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// One attempt's view of the session.
struct Credentials {
    did: Did,
    access_token: SmolStr,
    key: jose_jwk::Key,
    nonce: SmolStr,
}

impl<C: HttpClient + Send + Sync> XrpcClient<C> {
    pub fn new(http: Arc<C>, session: Session) -> Self {
        Self {
            http,
            session: Mutex::new(session),
            user_agent: SmolStr::new_static(DEFAULT_USER_AGENT),
            extra_headers: HeaderMap::new(),
            timeout: DEFAULT_TIMEOUT,
            nonce_update: None,
        }
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<SmolStr>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Send `value` as `name` on every request, e.g. `atproto-proxy`.
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.extra_headers.append(name, value);
        self
    }

    pub fn with_nonce_update(mut self, callback: Arc<dyn NonceUpdate>) -> Self {
        self.nonce_update = Some(callback);
        self
    }

    /// A snapshot of the current session.
    pub async fn session(&self) -> Session {
        self.session.lock().await.clone()
    }

    /// Swap in a new session, e.g. after a refresh.
    pub async fn update_session(&self, session: Session) {
        *self.session.lock().await = session;
    }

    /// GET `/xrpc/{method}`.
    pub async fn query<P, T>(
        &self,
        ctx: &RequestContext,
        method: &str,
        params: &P,
        out: ResponseSink<'_, T>,
    ) -> Result<()>
    where
        P: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let response = self.call(ctx, Method::GET, method, params, None).await?;
        response.write_into(out)
    }

    /// POST `/xrpc/{method}` with a JSON body or none.
    pub async fn procedure<P, T>(
        &self,
        ctx: &RequestContext,
        method: &str,
        params: &P,
        body: Option<XrpcBody>,
        out: ResponseSink<'_, T>,
    ) -> Result<()>
    where
        P: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        self.procedure_with_encoding(ctx, method, "application/json", params, body, out)
            .await
    }

    /// POST `/xrpc/{method}` with a body of the given content type.
    pub async fn procedure_with_encoding<P, T>(
        &self,
        ctx: &RequestContext,
        method: &str,
        encoding: &str,
        params: &P,
        body: Option<XrpcBody>,
        out: ResponseSink<'_, T>,
    ) -> Result<()>
    where
        P: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let body = match body {
            Some(body) => Some((ctx.guard(body.into_bytes()).await??, encoding)),
            None => None,
        };
        let response = self.call(ctx, Method::POST, method, params, body).await?;
        response.write_into(out)
    }

    /// Run the bounded attempt loop and hand back the successful response.
    #[cfg_attr(feature = "tracing", tracing::instrument(level = "debug", skip_all, fields(method = xrpc_method, http_method = %method)))]
    pub async fn call<P: Serialize + ?Sized>(
        &self,
        ctx: &RequestContext,
        method: Method,
        xrpc_method: &str,
        params: &P,
        body: Option<(Bytes, &str)>,
    ) -> Result<XrpcResponse> {
        let pds = self.session.lock().await.pds_url.clone();
        let url = xrpc_url(&pds, xrpc_method, params)?;
        ensure_safe(&url).map_err(|e| OAuthError::unsafe_url(&url, e))?;

        for attempt in 1..=MAX_ATTEMPTS {
            let creds = self.credentials().await;
            let outcome = ctx
                .guard(self.attempt(&method, &url, body.as_ref(), &creds))
                .await?;
            match outcome {
                Attempt::Success(response) => {
                    if let Some(nonce) = header_nonce(&response.headers) {
                        self.adopt_nonce(&creds, nonce).await;
                    }
                    return Ok(response);
                }
                Attempt::NonceChallenge(nonce) => {
                    #[cfg(feature = "tracing")]
                    tracing::debug!(attempt, "resource server asked for a fresh nonce");
                    self.adopt_nonce(&creds, nonce).await;
                }
                Attempt::Fatal(e) => return Err(e),
            }
        }
        Err(OAuthError::NonceRetryExhausted {
            attempts: MAX_ATTEMPTS,
        })
    }

    async fn credentials(&self) -> Credentials {
        let session = self.session.lock().await;
        Credentials {
            did: session.subject_did.clone(),
            access_token: session.access_token.clone(),
            key: session.dpop_private_jwk.clone(),
            nonce: session.dpop_resource_server_nonce.clone(),
        }
    }

    /// Record a server-issued nonce, then tell the callback with the lock released.
    ///
    /// The write only happens while the session still holds the nonce this
    /// attempt proved with. If another call already stored a newer one, that
    /// one is kept and the next attempt picks it up.
    async fn adopt_nonce(&self, creds: &Credentials, nonce: SmolStr) {
        {
            let mut session = self.session.lock().await;
            if session.dpop_resource_server_nonce == nonce
                || session.dpop_resource_server_nonce != creds.nonce
            {
                return;
            }
            session.dpop_resource_server_nonce = nonce.clone();
        }
        if let Some(callback) = &self.nonce_update
            && let Err(e) = callback.on_nonce_update(&creds.did, &nonce).await
        {
            #[cfg(feature = "tracing")]
            tracing::warn!(did = %creds.did, error = %e, "failed to persist resource server nonce");
            #[cfg(not(feature = "tracing"))]
            let _ = e;
        }
    }

    async fn attempt(
        &self,
        method: &Method,
        url: &Url,
        body: Option<&(Bytes, &str)>,
        creds: &Credentials,
    ) -> Attempt<XrpcResponse> {
        let response = match self.round_trip(method, url, body, creds).await {
            Ok(response) => response,
            Err(e) => return Attempt::Fatal(e),
        };
        if let Some(nonce) = nonce_challenge(&response) {
            return Attempt::NonceChallenge(nonce);
        }
        if !response.status().is_success() {
            return Attempt::Fatal(RpcError::from_response(&response).into());
        }
        let (parts, body) = response.into_parts();
        Attempt::Success(XrpcResponse {
            status: parts.status,
            headers: parts.headers,
            body: Bytes::from(body),
        })
    }

    async fn round_trip(
        &self,
        method: &Method,
        url: &Url,
        body: Option<&(Bytes, &str)>,
        creds: &Credentials,
    ) -> Result<Response<Vec<u8>>> {
        let proof = make_dpop_proof(
            &creds.key,
            method,
            url.as_str(),
            &creds.nonce,
            Some(&creds.access_token),
        )?;
        let mut builder = Request::builder()
            .method(method.clone())
            .uri(url.as_str())
            .header(ACCEPT, "application/json")
            .header(USER_AGENT, self.user_agent.as_str())
            .header(AUTHORIZATION, format!("DPoP {}", creds.access_token))
            .header("DPoP", proof.as_str());
        for (name, value) in &self.extra_headers {
            builder = builder.header(name, value);
        }
        let payload = match body {
            Some((bytes, encoding)) => {
                builder = builder.header(CONTENT_TYPE, *encoding);
                bytes.to_vec()
            }
            None => Vec::new(),
        };
        let request = builder.body(payload).map_err(TransportError::from)?;
        let response = tokio::time::timeout(self.timeout, self.http.send_http(request))
            .await
            .map_err(|_| OAuthError::Timeout)?
            .map_err(TransportError::other)?;
        Ok(response)
    }
}

/// `{pds}/xrpc/{method}?{params}`; list parameters repeat their key.
fn xrpc_url<P: Serialize + ?Sized>(pds: &Url, method: &str, params: &P) -> Result<Url> {
    let mut url = pds.clone();
    let mut path = url.path().trim_end_matches('/').to_owned();
    path.push_str("/xrpc/");
    path.push_str(method);
    url.set_path(&path);

    let qs = serde_html_form::to_string(params).map_err(OAuthError::encode)?;
    if qs.is_empty() {
        url.set_query(None);
    } else {
        url.set_query(Some(&qs));
    }
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authstore::MemoryAuthStore;
    use crate::session::fixtures::session;
    use crate::test_support::{MockResolver, proof_claims};
    use serde_json::json;

    fn nonce_challenge_headers(nonce: &str) -> [(&str, &str); 2] {
        [
            ("DPoP-Nonce", nonce),
            ("WWW-Authenticate", r#"DPoP error="use_dpop_nonce""#),
        ]
    }

    #[derive(Serialize)]
    struct Params<'a> {
        actor: &'a str,
        #[serde(skip_serializing_if = "Vec::is_empty")]
        uris: Vec<&'a str>,
    }

    #[test]
    fn urls_repeat_list_params() {
        let pds = Url::parse("https://pds.example.com/").unwrap();
        let url = xrpc_url(
            &pds,
            "app.bsky.feed.getPosts",
            &Params {
                actor: "did:plc:alice",
                uris: vec!["at://a", "at://b"],
            },
        )
        .unwrap();
        assert_eq!(
            url.as_str(),
            "https://pds.example.com/xrpc/app.bsky.feed.getPosts?actor=did%3Aplc%3Aalice&uris=at%3A%2F%2Fa&uris=at%3A%2F%2Fb"
        );
        let bare = xrpc_url(&pds, "com.atproto.server.getSession", &()).unwrap();
        assert_eq!(bare.query(), None);
    }

    #[tokio::test]
    async fn nonce_retry_succeeds_on_second_attempt() {
        let http = MockResolver::default();
        http.push_with_headers(
            401,
            json!({"error": "use_dpop_nonce"}),
            &nonce_challenge_headers("rs-1"),
        )
        .await;
        http.push_json(200, json!({"did": "did:plc:alice"})).await;
        let store = Arc::new(MemoryAuthStore::new());
        let s = session("did:plc:alice");
        store.upsert_session(&s).await.unwrap();
        let client = XrpcClient::new(Arc::new(http.clone()), s).with_nonce_update(store.clone());

        let mut out = serde_json::Value::Null;
        client
            .query(
                &RequestContext::new(),
                "com.atproto.server.getSession",
                &(),
                ResponseSink::Json(&mut out),
            )
            .await
            .unwrap();
        assert_eq!(out["did"], "did:plc:alice");
        assert_eq!(client.session().await.dpop_resource_server_nonce, "rs-1");
        let stored = store.get_session(&client.session().await.subject_did).await.unwrap().unwrap();
        assert_eq!(stored.dpop_resource_server_nonce, "rs-1");

        let requests = http.requests().await;
        assert_eq!(requests.len(), 2);
        assert_eq!(proof_claims(&requests[1]).public.nonce.as_deref(), Some("rs-1"));
        assert_eq!(requests[1].headers()[AUTHORIZATION], "DPoP access-1");
        assert!(proof_claims(&requests[1]).public.ath.is_some());
    }

    #[tokio::test]
    async fn three_challenges_exhaust_retries() {
        let http = MockResolver::default();
        for n in ["a", "b", "c"] {
            http.push_with_headers(400, json!({"error": "use_dpop_nonce"}), &[("DPoP-Nonce", n)])
                .await;
        }
        let client = XrpcClient::new(Arc::new(http.clone()), session("did:plc:alice"));
        let err = client
            .query(
                &RequestContext::new(),
                "app.bsky.actor.getProfile",
                &(),
                ResponseSink::discard(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, OAuthError::NonceRetryExhausted { attempts: 3 }));
        assert_eq!(http.requests().await.len(), 3);
    }

    struct FailingCallback;

    #[async_trait::async_trait]
    impl NonceUpdate for FailingCallback {
        async fn on_nonce_update(
            &self,
            _: &Did,
            _: &str,
        ) -> core::result::Result<(), SessionStoreError> {
            Err(SessionStoreError::Other("database unavailable".into()))
        }
    }

    #[tokio::test]
    async fn callback_failures_do_not_fail_the_call() {
        let http = MockResolver::default();
        http.push_with_headers(400, json!({"error": "use_dpop_nonce"}), &[("DPoP-Nonce", "rs-2")])
            .await;
        http.push(200, "").await;
        let client = XrpcClient::new(Arc::new(http.clone()), session("did:plc:alice"))
            .with_nonce_update(Arc::new(FailingCallback));
        client
            .procedure(
                &RequestContext::new(),
                "com.atproto.repo.deleteRecord",
                &(),
                None,
                ResponseSink::discard(),
            )
            .await
            .unwrap();
        assert_eq!(client.session().await.dpop_resource_server_nonce, "rs-2");
        assert!(http.requests().await[1].headers().get(CONTENT_TYPE).is_none());
    }

    #[tokio::test]
    async fn errors_carry_code_and_rate_limit() {
        let http = MockResolver::default();
        http.push_with_headers(
            429,
            json!({"error": "RateLimitExceeded", "message": "slow down"}),
            &[
                ("ratelimit-limit", "3000"),
                ("ratelimit-remaining", "0"),
                ("ratelimit-reset", "1700000000"),
            ],
        )
        .await;
        let client = XrpcClient::new(Arc::new(http), session("did:plc:alice"));
        let err = client
            .query(
                &RequestContext::new(),
                "app.bsky.feed.getTimeline",
                &(),
                ResponseSink::discard(),
            )
            .await
            .unwrap_err();
        let OAuthError::Rpc(rpc) = err else {
            panic!("expected rpc error, got {err:?}");
        };
        assert_eq!(rpc.status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(rpc.code.as_deref(), Some("RateLimitExceeded"));
        assert_eq!(rpc.message.as_deref(), Some("slow down"));
        let limit = rpc.rate_limit.unwrap();
        assert_eq!(limit.remaining, Some(0));
        assert_eq!(limit.reset.unwrap().timestamp(), 1_700_000_000);
    }

    #[tokio::test]
    async fn bodies_and_extra_headers() {
        let http = MockResolver::default();
        http.push(200, "raw-bytes").await;
        http.push_json(200, json!({"ok": true})).await;
        let client = XrpcClient::new(Arc::new(http.clone()), session("did:plc:alice"))
            .with_user_agent("skylink-test/1")
            .with_header(
                HeaderName::from_static("atproto-proxy"),
                HeaderValue::from_static("did:web:api.example.com#bsky_appview"),
            );
        let ctx = RequestContext::new();

        let reader: Box<dyn AsyncRead + Send + Unpin> = Box::new(&b"\x89PNG"[..]);
        let mut raw = Vec::new();
        client
            .procedure_with_encoding(
                &ctx,
                "com.atproto.repo.uploadBlob",
                "image/png",
                &(),
                Some(XrpcBody::Stream(reader)),
                ResponseSink::bytes(&mut raw),
            )
            .await
            .unwrap();
        assert_eq!(raw, b"raw-bytes");

        client
            .procedure(
                &ctx,
                "com.atproto.repo.createRecord",
                &(),
                Some(XrpcBody::Json(json!({"collection": "app.bsky.feed.post"}))),
                ResponseSink::discard(),
            )
            .await
            .unwrap();

        let requests = http.requests().await;
        assert_eq!(requests[0].headers()[CONTENT_TYPE], "image/png");
        assert_eq!(requests[0].body(), b"\x89PNG");
        assert_eq!(requests[0].headers()["atproto-proxy"], "did:web:api.example.com#bsky_appview");
        assert_eq!(requests[0].headers()[USER_AGENT], "skylink-test/1");
        assert_eq!(requests[1].headers()[CONTENT_TYPE], "application/json");
        assert_eq!(proof_claims(&requests[1]).public.htm.as_deref(), Some("POST"));
    }

    /// A PDS whose `com.example.slow` challenge is held until `release` fires.
    /// Every other method succeeds and hands out `rs-2`.
    #[derive(Clone, Default)]
    struct GatedPds {
        release: Arc<tokio::sync::Notify>,
        slow_calls: Arc<std::sync::atomic::AtomicUsize>,
        log: Arc<Mutex<Vec<(String, Option<SmolStr>)>>>,
    }

    impl HttpClient for GatedPds {
        type Error = std::convert::Infallible;

        async fn send_http(
            &self,
            request: Request<Vec<u8>>,
        ) -> core::result::Result<Response<Vec<u8>>, Self::Error> {
            let path = request.uri().path().to_owned();
            let proof_nonce = proof_claims(&request).public.nonce;
            self.log.lock().await.push((path.clone(), proof_nonce));

            let builder = Response::builder().header(CONTENT_TYPE, "application/json");
            let response = if path.ends_with("com.example.slow") {
                let seen = self
                    .slow_calls
                    .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                if seen == 0 {
                    self.release.notified().await;
                    builder
                        .status(401)
                        .header("DPoP-Nonce", "rs-1")
                        .body(br#"{"error":"use_dpop_nonce"}"#.to_vec())
                } else {
                    builder.status(200).body(b"{}".to_vec())
                }
            } else {
                builder
                    .status(200)
                    .header("DPoP-Nonce", "rs-2")
                    .body(b"{}".to_vec())
            };
            Ok(response.unwrap())
        }
    }

    #[tokio::test]
    async fn late_challenge_keeps_the_newer_nonce() {
        let pds = GatedPds::default();
        let client = XrpcClient::new(Arc::new(pds.clone()), session("did:plc:alice"));
        let ctx = RequestContext::new();

        // The slow call proves with the initial nonce and is challenged only
        // after the fast call has already stored `rs-2`.
        let slow = client.query(&ctx, "com.example.slow", &(), ResponseSink::discard());
        let fast = async {
            let done = client
                .query(&ctx, "com.example.fast", &(), ResponseSink::discard())
                .await;
            pds.release.notify_one();
            done
        };
        let (slow, fast) = tokio::join!(slow, fast);
        slow.unwrap();
        fast.unwrap();

        assert_eq!(client.session().await.dpop_resource_server_nonce, "rs-2");
        let log = pds.log.lock().await;
        let slow_proofs: Vec<_> = log
            .iter()
            .filter(|(path, _)| path.ends_with("com.example.slow"))
            .map(|(_, nonce)| nonce.clone())
            .collect();
        assert_eq!(slow_proofs, vec![None, Some(SmolStr::new("rs-2"))]);
    }

    #[tokio::test]
    async fn cancellation_stops_the_loop() {
        let http = MockResolver::default();
        let client = XrpcClient::new(Arc::new(http.clone()), session("did:plc:alice"));
        let ctx = RequestContext::new();
        ctx.cancel();
        let err = client
            .query(&ctx, "app.bsky.actor.getProfile", &(), ResponseSink::discard())
            .await
            .unwrap_err();
        assert!(matches!(err, OAuthError::Cancelled));
        assert!(http.requests().await.is_empty());
    }
}
