//! Identity resolution: handle → DID and DID → document, then PDS discovery.
//!
//! Handles resolve over HTTPS well-known (`https://<handle>/.well-known/atproto-did`).
//! `did:plc` documents come from the configured PLC directory and `did:web`
//! documents from the host's well-known location. The resolved document must
//! name the requested DID, carry a PDS service, and agree with the handle.

use std::future::Future;
use std::marker::Sync;
use std::time::Duration;

use bon::Builder;
use http::StatusCode;
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use skylink_common::{AtIdentifier, AtStrError, Did, Handle, TransportError, UrlGuardError};
use smol_str::SmolStr;
use thiserror::Error;
use url::Url;

use crate::did_doc::DidDocument;

/// Default positive cache lifetime.
pub const DEFAULT_POSITIVE_TTL: Duration = Duration::from_secs(24 * 60 * 60);
/// Default negative cache lifetime.
pub const DEFAULT_NEGATIVE_TTL: Duration = Duration::from_secs(2 * 60);
/// Default PLC directory.
pub const DEFAULT_PLC_DIRECTORY: &str = "https://plc.directory/";

/// Errors that can occur during identity resolution.
#[derive(Debug, Error, Diagnostic)]
#[allow(missing_docs)]
pub enum IdentityError {
    #[error("invalid identifier: {0}")]
    #[diagnostic(
        code(skylink_identity::invalid_identifier),
        help("expected a handle like `alice.example.com` or a DID like `did:plc:...`")
    )]
    InvalidIdentifier(#[from] AtStrError),
    #[error("unsupported DID method: {0}")]
    #[diagnostic(
        code(skylink_identity::unsupported_did_method),
        help("supported DID methods: did:web, did:plc")
    )]
    UnsupportedDidMethod(SmolStr),
    #[error("invalid well-known atproto-did content")]
    #[diagnostic(
        code(skylink_identity::invalid_well_known),
        help("expected first non-empty line to be a DID")
    )]
    InvalidWellKnown,
    #[error("missing PDS endpoint in DID document")]
    #[diagnostic(code(skylink_identity::missing_pds_endpoint))]
    MissingPdsEndpoint,
    #[error("refusing to fetch {url}: {source}")]
    #[diagnostic(code(skylink_identity::unsafe_url))]
    UnsafeUrl {
        url: SmolStr,
        #[source]
        source: UrlGuardError,
    },
    #[error("HTTP error: {0}")]
    #[diagnostic(
        code(skylink_identity::http),
        help("check network connectivity and TLS configuration")
    )]
    Http(#[from] TransportError),
    #[error("HTTP status {0}")]
    #[diagnostic(
        code(skylink_identity::http_status),
        help("verify well-known paths and the PLC directory")
    )]
    HttpStatus(StatusCode),
    #[error("URL parse error: {0}")]
    #[diagnostic(code(skylink_identity::url))]
    Url(#[from] url::ParseError),
    #[error("serialize/deserialize error: {0}")]
    #[diagnostic(code(skylink_identity::serde))]
    Serde(#[from] serde_json::Error),
    /// DID document id did not match requested DID
    #[error("DID doc id mismatch: requested {expected}, document names {found}")]
    #[diagnostic(
        code(skylink_identity::doc_id_mismatch),
        help("document id differs from requested DID; do not trust this document")
    )]
    DocIdMismatch { expected: Did, found: Did },
    /// The DID document does not list the handle it was reached through
    #[error("handle {handle} is not claimed by {did}")]
    #[diagnostic(
        code(skylink_identity::handle_mismatch),
        help("handle and DID must point at each other")
    )]
    HandleMismatch { handle: Handle, did: Did },
    /// Served from the negative cache
    #[error("identity lookup failed recently: {0}")]
    #[diagnostic(code(skylink_identity::cached_miss))]
    CachedMiss(SmolStr),
}

impl IdentityError {
    pub(crate) fn unsafe_url(url: &Url, source: UrlGuardError) -> Self {
        Self::UnsafeUrl {
            url: SmolStr::new(url.as_str()),
            source,
        }
    }

    pub(crate) fn unsupported_did_method(did: &str) -> Self {
        Self::UnsupportedDidMethod(SmolStr::new(did))
    }

    /// Whether this failure says something stable about the identifier itself,
    /// as opposed to a transient network condition.
    ///
    /// Only these are remembered by the negative cache.
    pub fn is_cacheable_miss(&self) -> bool {
        match self {
            Self::InvalidWellKnown
            | Self::MissingPdsEndpoint
            | Self::UnsupportedDidMethod(_)
            | Self::DocIdMismatch { .. }
            | Self::HandleMismatch { .. }
            | Self::InvalidIdentifier(_) => true,
            Self::HttpStatus(status) => {
                *status == StatusCode::NOT_FOUND || *status == StatusCode::GONE
            }
            _ => false,
        }
    }
}

/// Result alias for identity resolution.
pub type Result<T> = std::result::Result<T, IdentityError>;

/// Configurable resolver options.
#[derive(Debug, Clone, PartialEq, Eq, Builder, Serialize, Deserialize)]
#[builder(start_fn = new)]
#[serde(default)]
pub struct ResolverOptions {
    /// Base URL of the PLC directory for `did:plc` documents
    #[builder(default = default_plc_directory())]
    pub plc_directory: Url,
    /// How long a successful resolution is cached
    #[builder(default = DEFAULT_POSITIVE_TTL)]
    pub positive_ttl: Duration,
    /// How long a stable failure is cached
    #[builder(default = DEFAULT_NEGATIVE_TTL)]
    pub negative_ttl: Duration,
    /// Per-request timeout
    #[builder(default = skylink_common::http_client::DEFAULT_TIMEOUT)]
    pub timeout: Duration,
}

fn default_plc_directory() -> Url {
    Url::parse(DEFAULT_PLC_DIRECTORY).expect("valid url")
}

impl Default for ResolverOptions {
    fn default() -> Self {
        Self::new().build()
    }
}

/// Output of a full resolution: who the account is and where its data lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedIdentity {
    pub did: Did,
    /// `None` when the document claims no handle, or its claim does not resolve back.
    pub handle: Option<Handle>,
    pub pds: Url,
}

/// Trait for identity resolution, for pluggable implementations.
///
/// Implementors provide the two network primitives; the default methods layer
/// the document checks on top.
pub trait IdentityResolver {
    /// Access options for validation decisions in default methods
    fn options(&self) -> &ResolverOptions;

    /// Resolve handle
    fn resolve_handle(&self, handle: &Handle) -> impl Future<Output = Result<Did>> + Send
    where
        Self: Sync;

    /// Resolve DID document
    fn resolve_did_doc(&self, did: &Did) -> impl Future<Output = Result<DidDocument>> + Send
    where
        Self: Sync;

    /// Resolve an identifier to its DID, verified handle and PDS.
    fn resolve_identity(
        &self,
        ident: &AtIdentifier,
    ) -> impl Future<Output = Result<ResolvedIdentity>> + Send
    where
        Self: Sync,
    {
        async move {
            match ident {
                AtIdentifier::Handle(handle) => {
                    let did = self.resolve_handle(handle).await?;
                    let doc = self.resolve_did_doc(&did).await?;
                    let pds = checked_pds(&did, &doc)?;
                    if !doc.claims_handle(handle) {
                        return Err(IdentityError::HandleMismatch {
                            handle: handle.clone(),
                            did,
                        });
                    }
                    Ok(ResolvedIdentity {
                        did,
                        handle: Some(handle.clone()),
                        pds,
                    })
                }
                AtIdentifier::Did(did) => {
                    let doc = self.resolve_did_doc(did).await?;
                    let pds = checked_pds(did, &doc)?;
                    let mut handle = None;
                    if let Some(claimed) = doc.handles().into_iter().next() {
                        // The claim only counts if the handle points back at this DID.
                        match self.resolve_handle(&claimed).await {
                            Ok(back) if &back == did => handle = Some(claimed),
                            _ => {
                                #[cfg(feature = "tracing")]
                                tracing::debug!(
                                    did = %did,
                                    handle = %claimed,
                                    "handle claim does not resolve back"
                                );
                            }
                        }
                    }
                    Ok(ResolvedIdentity {
                        did: did.clone(),
                        handle,
                        pds,
                    })
                }
            }
        }
    }

    /// Parse `input` as a handle or DID and resolve it.
    fn resolve_str(&self, input: &str) -> impl Future<Output = Result<ResolvedIdentity>> + Send
    where
        Self: Sync,
    {
        let ident = AtIdentifier::new(input);
        async move { self.resolve_identity(&ident?).await }
    }
}

/// Enforce that `doc` names `did` and return its PDS endpoint.
pub fn checked_pds(did: &Did, doc: &DidDocument) -> Result<Url> {
    if &doc.id != did {
        return Err(IdentityError::DocIdMismatch {
            expected: did.clone(),
            found: doc.id.clone(),
        });
    }
    doc.pds_endpoint().ok_or(IdentityError::MissingPdsEndpoint)
}

impl<T: IdentityResolver + Sync + Send> IdentityResolver for std::sync::Arc<T> {
    fn options(&self) -> &ResolverOptions {
        self.as_ref().options()
    }

    async fn resolve_handle(&self, handle: &Handle) -> Result<Did> {
        self.as_ref().resolve_handle(handle).await
    }

    async fn resolve_did_doc(&self, did: &Did) -> Result<DidDocument> {
        self.as_ref().resolve_did_doc(did).await
    }

    async fn resolve_identity(&self, ident: &AtIdentifier) -> Result<ResolvedIdentity> {
        self.as_ref().resolve_identity(ident).await
    }
}
