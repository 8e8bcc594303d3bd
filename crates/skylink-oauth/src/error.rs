use std::fmt;

use chrono::{DateTime, Utc};
use http::StatusCode;
use miette::Diagnostic;
use skylink_common::session::SessionStoreError;
use skylink_common::{AtStrError, Did, Interrupted, TransportError, UrlGuardError};
use skylink_identity::resolver::IdentityError;
use smol_str::SmolStr;
use thiserror::Error;
use url::Url;

pub use crate::types::ServerErrorBody;

/// The individual authorization server metadata requirements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataCheck {
    IssuerScheme,
    IssuerHost,
    IssuerPort,
    IssuerPath,
    IssuerQuery,
    IssuerMismatch,
    ResponseTypeCode,
    GrantAuthorizationCode,
    GrantRefreshToken,
    PkceS256,
    DpopEs256,
    AuthMethodNone,
    AuthMethodPrivateKeyJwt,
    AuthSigningEs256,
    ScopeAtproto,
    IssParameter,
    ParEndpoint,
    ParRequired,
    RequestUriRegistration,
    ClientIdMetadataDocument,
}

impl fmt::Display for MetadataCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::IssuerScheme => "issuer must use https",
            Self::IssuerHost => "issuer must have a host",
            Self::IssuerPort => "issuer must not carry an explicit port",
            Self::IssuerPath => "issuer path must be empty or '/'",
            Self::IssuerQuery => "issuer must not carry a query or fragment",
            Self::IssuerMismatch => "issuer does not match the URL the metadata was fetched from",
            Self::ResponseTypeCode => "response_types_supported lacks 'code'",
            Self::GrantAuthorizationCode => "grant_types_supported lacks 'authorization_code'",
            Self::GrantRefreshToken => "grant_types_supported lacks 'refresh_token'",
            Self::PkceS256 => "code_challenge_methods_supported lacks 'S256'",
            Self::DpopEs256 => "dpop_signing_alg_values_supported lacks 'ES256'",
            Self::AuthMethodNone => "token_endpoint_auth_methods_supported lacks 'none'",
            Self::AuthMethodPrivateKeyJwt => {
                "token_endpoint_auth_methods_supported lacks 'private_key_jwt'"
            }
            Self::AuthSigningEs256 => {
                "token_endpoint_auth_signing_alg_values_supported lacks 'ES256'"
            }
            Self::ScopeAtproto => "scopes_supported lacks 'atproto'",
            Self::IssParameter => "authorization_response_iss_parameter_supported is not true",
            Self::ParEndpoint => "pushed_authorization_request_endpoint is missing",
            Self::ParRequired => "require_pushed_authorization_requests is not true",
            Self::RequestUriRegistration => "require_request_uri_registration is false",
            Self::ClientIdMetadataDocument => "client_id_metadata_document_supported is not true",
        };
        f.write_str(s)
    }
}

/// Rate limit state advertised by a resource server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimit {
    pub limit: Option<u64>,
    pub remaining: Option<u64>,
    pub reset: Option<DateTime<Utc>>,
    pub policy: Option<SmolStr>,
}

impl RateLimit {
    /// Parse the `ratelimit-*` headers; `None` when none are present.
    pub fn from_headers(headers: &http::HeaderMap) -> Option<Self> {
        let get = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());
        let limit = get("ratelimit-limit").and_then(|v| v.trim().parse().ok());
        let remaining = get("ratelimit-remaining").and_then(|v| v.trim().parse().ok());
        let reset = get("ratelimit-reset")
            .and_then(|v| v.trim().parse::<i64>().ok())
            .and_then(|secs| DateTime::from_timestamp(secs, 0));
        let policy = get("ratelimit-policy").map(SmolStr::new);
        if limit.is_none() && remaining.is_none() && reset.is_none() && policy.is_none() {
            return None;
        }
        Some(Self {
            limit,
            remaining,
            reset,
            policy,
        })
    }
}

/// A non-success XRPC response.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("xrpc error {status}: {}", code.as_deref().unwrap_or("unknown"))]
pub struct RpcError {
    pub status: StatusCode,
    pub code: Option<SmolStr>,
    pub message: Option<SmolStr>,
    pub rate_limit: Option<RateLimit>,
}

/// Why a PAR or token endpoint call failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EndpointFailure {
    #[error("status {status}{}", body.as_ref().map(|b| format!(": {b}")).unwrap_or_default())]
    Status {
        status: StatusCode,
        body: Option<ServerErrorBody>,
    },
    #[error("server asked for a fresh DPoP nonce twice")]
    NonceChallengeRepeated,
    #[error("invalid response: {0}")]
    InvalidResponse(SmolStr),
}

/// Errors from the OAuth client engine.
///
/// Messages never carry token or key material.
#[derive(Debug, Error, Diagnostic)]
pub enum OAuthError {
    #[error("invalid identifier: {0}")]
    #[diagnostic(
        code(skylink_oauth::invalid_identifier),
        help("pass a handle, a DID, or an https:// service URL")
    )]
    InvalidIdentifier(SmolStr),

    #[error("refusing to contact {url}")]
    #[diagnostic(code(skylink_oauth::unsafe_url))]
    UnsafeUrl {
        url: SmolStr,
        #[source]
        source: UrlGuardError,
    },

    #[error("failed to fetch metadata from {url}: {reason}")]
    #[diagnostic(code(skylink_oauth::metadata_fetch))]
    MetadataFetchFailed { url: SmolStr, reason: SmolStr },

    #[error("{resource} lists no authorization server")]
    #[diagnostic(code(skylink_oauth::no_auth_server))]
    NoAuthServer { resource: SmolStr },

    #[error("authorization server {issuer} metadata rejected: {check}")]
    #[diagnostic(
        code(skylink_oauth::invalid_metadata),
        help("the server does not meet the atproto OAuth profile")
    )]
    InvalidAuthServerMetadata { issuer: SmolStr, check: MetadataCheck },

    #[error("pushed authorization request failed: {0}")]
    #[diagnostic(code(skylink_oauth::par))]
    ParFailed(EndpointFailure),

    #[error("token request failed: {0}")]
    #[diagnostic(code(skylink_oauth::token))]
    TokenExchangeFailed(EndpointFailure),

    #[error("gave up after {attempts} DPoP nonce challenges")]
    #[diagnostic(code(skylink_oauth::nonce_retry))]
    NonceRetryExhausted { attempts: u32 },

    #[error("unknown or already used state")]
    #[diagnostic(
        code(skylink_oauth::state),
        help("each authorization callback can be handled only once")
    )]
    ReplayedOrUnknownState,

    #[error("issuer mismatch: expected {expected}, got {found}")]
    #[diagnostic(code(skylink_oauth::issuer_mismatch))]
    IssuerMismatch { expected: SmolStr, found: SmolStr },

    #[error("granted scope {granted:?} differs from requested {requested:?}")]
    #[diagnostic(code(skylink_oauth::scope_mismatch))]
    ScopeMismatch { requested: SmolStr, granted: SmolStr },

    #[error("token subject {found} does not match {expected}")]
    #[diagnostic(code(skylink_oauth::subject_mismatch))]
    SubjectMismatch { expected: Did, found: SmolStr },

    #[error("session for {did} has expired")]
    #[diagnostic(code(skylink_oauth::session_expired), help("refresh or log in again"))]
    SessionExpired { did: Did },

    #[error("no stored session for {0}")]
    #[diagnostic(code(skylink_oauth::no_session))]
    NoSession(Did),

    #[error(transparent)]
    #[diagnostic(code(skylink_oauth::rpc))]
    Rpc(#[from] RpcError),

    #[error(transparent)]
    #[diagnostic(code(skylink_oauth::identity))]
    Identity(#[from] IdentityError),

    #[error("signing error: {0}")]
    #[diagnostic(
        code(skylink_oauth::signing),
        help("keys must be EC P-256 JWKs with base64url x, y and d values")
    )]
    Signing(SmolStr),

    #[error(transparent)]
    #[diagnostic(code(skylink_oauth::store))]
    Store(#[from] SessionStoreError),

    #[error(transparent)]
    #[diagnostic(code(skylink_oauth::transport))]
    Transport(#[from] TransportError),

    #[error("request timed out")]
    #[diagnostic(code(skylink_oauth::timeout))]
    Timeout,

    #[error("request cancelled")]
    #[diagnostic(code(skylink_oauth::cancelled))]
    Cancelled,

    #[error("encode error: {0}")]
    #[diagnostic(code(skylink_oauth::encode))]
    Encode(SmolStr),

    #[error("decode error: {0}")]
    #[diagnostic(code(skylink_oauth::decode))]
    Decode(SmolStr),
}

impl OAuthError {
    pub(crate) fn unsafe_url(url: impl AsRef<str>, source: UrlGuardError) -> Self {
        Self::UnsafeUrl {
            url: SmolStr::new(url.as_ref()),
            source,
        }
    }

    pub(crate) fn metadata_fetch(url: &Url, reason: impl fmt::Display) -> Self {
        Self::MetadataFetchFailed {
            url: SmolStr::new(url.as_str()),
            reason: SmolStr::new(reason.to_string()),
        }
    }

    pub(crate) fn invalid_metadata(issuer: &str, check: MetadataCheck) -> Self {
        Self::InvalidAuthServerMetadata {
            issuer: SmolStr::new(issuer),
            check,
        }
    }

    pub(crate) fn signing(e: impl fmt::Display) -> Self {
        Self::Signing(SmolStr::new(e.to_string()))
    }

    pub(crate) fn encode(e: impl fmt::Display) -> Self {
        Self::Encode(SmolStr::new(e.to_string()))
    }

    pub(crate) fn decode(e: impl fmt::Display) -> Self {
        Self::Decode(SmolStr::new(e.to_string()))
    }
}

impl From<Interrupted> for OAuthError {
    fn from(e: Interrupted) -> Self {
        match e {
            Interrupted::Cancelled => Self::Cancelled,
            Interrupted::DeadlineExceeded => Self::Timeout,
        }
    }
}

impl From<AtStrError> for OAuthError {
    fn from(e: AtStrError) -> Self {
        Self::InvalidIdentifier(SmolStr::new(e.to_string()))
    }
}

pub type Result<T> = core::result::Result<T, OAuthError>;
