//! Locating and validating the authorization server for an account or service.

use std::future::Future;
use std::time::Duration;

use http::header::ACCEPT;
use serde::de::DeserializeOwned;
use skylink_common::http_client::HttpClient;
use skylink_common::url_guard::ensure_safe;
use skylink_common::{AtIdentifier, Did, TransportError, ensure_safe_url};
use skylink_identity::resolver::{IdentityResolver, ResolvedIdentity};
use smol_str::SmolStr;
use url::Url;

use crate::error::{OAuthError, Result};
use crate::types::{OAuthAuthorizationServerMetadata, OAuthProtectedResourceMetadata};

pub const PROTECTED_RESOURCE_PATH: &str = "/.well-known/oauth-protected-resource";
pub const AUTHORIZATION_SERVER_PATH: &str = "/.well-known/oauth-authorization-server";

/// Compare issuer URLs the way RFC 8414 §3.3 intends: same scheme, host and
/// effective port, with an empty path equal to `/`. Any query or fragment
/// makes them unequal.
pub(crate) fn issuer_equivalent(a: &str, b: &str) -> bool {
    fn normalize(url: &Url) -> Option<(&str, &str, u16, &str)> {
        if url.query().is_some() || url.fragment().is_some() {
            return None;
        }
        let path = match url.path() {
            "" => "/",
            other => other,
        };
        Some((url.scheme(), url.host_str()?, url.port_or_known_default()?, path))
    }

    match (Url::parse(a), Url::parse(b)) {
        (Ok(ua), Ok(ub)) => match (normalize(&ua), normalize(&ub)) {
            (Some(na), Some(nb)) => na == nb,
            _ => false,
        },
        _ => a == b,
    }
}

fn well_known(base: &Url, path: &str) -> Result<Url> {
    base.join(path).map_err(|e| OAuthError::metadata_fetch(base, e))
}

/// Guarded JSON GET. Non-2xx statuses and undecodable bodies are
/// [`OAuthError::MetadataFetchFailed`].
pub(crate) async fn fetch_json<T, C>(http: &C, url: &Url, timeout: Duration) -> Result<T>
where
    T: DeserializeOwned,
    C: HttpClient + Sync + ?Sized,
{
    ensure_safe(url).map_err(|e| OAuthError::unsafe_url(url, e))?;
    let request = http::Request::builder()
        .method(http::Method::GET)
        .uri(url.as_str())
        .header(ACCEPT, "application/json")
        .body(Vec::new())
        .map_err(TransportError::from)?;
    let response = tokio::time::timeout(timeout, http.send_http(request))
        .await
        .map_err(|_| OAuthError::Timeout)?
        .map_err(TransportError::other)?;
    if !response.status().is_success() {
        return Err(OAuthError::metadata_fetch(url, response.status()));
    }
    serde_json::from_slice(response.body()).map_err(|e| OAuthError::metadata_fetch(url, e))
}

async fn protected_resource_impl<T: OAuthResolver + Sync + ?Sized>(
    resolver: &T,
    resource: &Url,
) -> Result<OAuthProtectedResourceMetadata> {
    let url = well_known(resource, PROTECTED_RESOURCE_PATH)?;
    fetch_json(resolver, &url, resolver.options().timeout).await
}

#[cfg_attr(feature = "tracing", tracing::instrument(level = "debug", skip_all, fields(resource = %resource)))]
async fn resolve_auth_server_impl<T: OAuthResolver + Sync + ?Sized>(
    resolver: &T,
    resource: &Url,
) -> Result<Url> {
    let metadata = resolver.get_protected_resource_metadata(resource).await?;
    let first = metadata
        .authorization_servers
        .and_then(|servers| servers.into_iter().next())
        .ok_or_else(|| OAuthError::NoAuthServer {
            resource: SmolStr::new(resource.as_str()),
        })?;
    ensure_safe_url(&first).map_err(|e| OAuthError::unsafe_url(&first, e))
}

#[cfg_attr(feature = "tracing", tracing::instrument(level = "debug", skip_all, fields(issuer = %issuer)))]
async fn fetch_and_validate_impl<T: OAuthResolver + Sync + ?Sized>(
    resolver: &T,
    issuer: &Url,
) -> Result<OAuthAuthorizationServerMetadata> {
    ensure_safe(issuer).map_err(|e| OAuthError::unsafe_url(issuer, e))?;
    let url = well_known(issuer, AUTHORIZATION_SERVER_PATH)?;
    let metadata: OAuthAuthorizationServerMetadata =
        fetch_json(resolver, &url, resolver.options().timeout).await?;
    metadata
        .validate(issuer)
        .map_err(|check| OAuthError::invalid_metadata(&metadata.issuer, check))?;

    // Every endpoint we will POST to or send the user to must pass the guard.
    let par = metadata.pushed_authorization_request_endpoint.as_deref().unwrap_or_default();
    for endpoint in [
        metadata.authorization_endpoint.as_str(),
        metadata.token_endpoint.as_str(),
        par,
    ] {
        ensure_safe_url(endpoint).map_err(|e| OAuthError::unsafe_url(endpoint, e))?;
    }
    Ok(metadata)
}

async fn resolve_from_service_impl<T: OAuthResolver + Sync + ?Sized>(
    resolver: &T,
    service: &Url,
) -> Result<OAuthAuthorizationServerMetadata> {
    // A PDS URL first; a service without a protected resource document is
    // taken to be the authorization server itself (an entryway).
    match resolver.resolve_auth_server(service).await {
        Ok(issuer) => resolver.fetch_and_validate_metadata(&issuer).await,
        Err(OAuthError::MetadataFetchFailed { .. }) => {
            resolver.fetch_and_validate_metadata(service).await
        }
        Err(e) => Err(e),
    }
}

async fn resolve_from_identity_impl<T: OAuthResolver + Sync + ?Sized>(
    resolver: &T,
    ident: &AtIdentifier,
) -> Result<(ResolvedIdentity, OAuthAuthorizationServerMetadata)> {
    let identity = resolver.resolve_identity(ident).await?;
    let issuer = resolver.resolve_auth_server(&identity.pds).await?;
    let metadata = resolver.fetch_and_validate_metadata(&issuer).await?;
    Ok((identity, metadata))
}

#[cfg_attr(feature = "tracing", tracing::instrument(level = "debug", skip_all, fields(sub = %sub)))]
async fn verify_issuer_impl<T: OAuthResolver + Sync + ?Sized>(
    resolver: &T,
    issuer: &str,
    sub: &Did,
) -> Result<ResolvedIdentity> {
    let identity = resolver
        .resolve_identity(&AtIdentifier::Did(sub.clone()))
        .await?;
    let found = resolver.resolve_auth_server(&identity.pds).await?;
    if !issuer_equivalent(found.as_str(), issuer) {
        return Err(OAuthError::IssuerMismatch {
            expected: SmolStr::new(issuer),
            found: SmolStr::new(found.as_str()),
        });
    }
    Ok(identity)
}

/// Discovery on top of identity resolution: from a handle, DID or service URL
/// to validated authorization server metadata.
///
/// Every URL involved, including ones taken from server responses, passes the
/// SSRF guard before it is dialed.
pub trait OAuthResolver: IdentityResolver + HttpClient {
    fn get_protected_resource_metadata(
        &self,
        resource: &Url,
    ) -> impl Future<Output = Result<OAuthProtectedResourceMetadata>> + Send
    where
        Self: Sync,
    {
        protected_resource_impl(self, resource)
    }

    /// The first authorization server a protected resource lists.
    fn resolve_auth_server(&self, resource: &Url) -> impl Future<Output = Result<Url>> + Send
    where
        Self: Sync,
    {
        resolve_auth_server_impl(self, resource)
    }

    /// Fetch issuer metadata and apply the full atproto checklist.
    fn fetch_and_validate_metadata(
        &self,
        issuer: &Url,
    ) -> impl Future<Output = Result<OAuthAuthorizationServerMetadata>> + Send
    where
        Self: Sync,
    {
        fetch_and_validate_impl(self, issuer)
    }

    fn resolve_from_service(
        &self,
        service: &Url,
    ) -> impl Future<Output = Result<OAuthAuthorizationServerMetadata>> + Send
    where
        Self: Sync,
    {
        resolve_from_service_impl(self, service)
    }

    fn resolve_from_identity(
        &self,
        ident: &AtIdentifier,
    ) -> impl Future<Output = Result<(ResolvedIdentity, OAuthAuthorizationServerMetadata)>> + Send
    where
        Self: Sync,
    {
        resolve_from_identity_impl(self, ident)
    }

    /// Resolve `sub` and check that its PDS is protected by `issuer`.
    fn verify_issuer(
        &self,
        issuer: &str,
        sub: &Did,
    ) -> impl Future<Output = Result<ResolvedIdentity>> + Send
    where
        Self: Sync,
    {
        verify_issuer_impl(self, issuer, sub)
    }
}

impl<C: HttpClient + Sync + Send> OAuthResolver for skylink_identity::SkylinkResolver<C> {}

impl<R> OAuthResolver for skylink_identity::CachingResolver<R> where
    R: IdentityResolver + HttpClient + Sync + Send
{
}
