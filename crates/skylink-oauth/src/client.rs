use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;
use jose_jwk::{Jwk, JwkSet, Key, Parameters};
use skylink_common::{AtIdentifier, Did, RequestContext, ensure_safe_url};
use skylink_identity::resolver::ResolvedIdentity;
use smol_str::SmolStr;
use url::Url;

use crate::authstore::ClientAuthStore;
use crate::config::{ClientPlatform, OAuthConfig};
use crate::error::{EndpointFailure, MetadataCheck, OAuthError, Result};
use crate::jose::public_jwk;
use crate::request::{AuthServerCall, OAuthRequest};
use crate::resolver::OAuthResolver;
use crate::session::{PendingAuthRequest, Session};
use crate::types::{
    AuthorizationCodeChallengeMethod, AuthorizationResponseType, CallbackParams,
    OAuthAuthorizationServerMetadata, OAuthClientMetadata, OAuthParResponse, OAuthTokenResponse,
    OAuthTokenType, ParParameters, RefreshRequestParameters, TokenGrantType,
    TokenRequestParameters,
};
use crate::utils::{generate_dpop_key, generate_pkce, generate_state};
use crate::xrpc::XrpcClient;

/// Per-login choices; every field falls back to the client configuration.
#[derive(Debug, Clone, Default)]
pub struct AuthorizeOptions {
    pub scope: Option<SmolStr>,
    pub redirect_uri: Option<SmolStr>,
    pub platform: ClientPlatform,
}

/// Where to send the user's browser, and the state that will come back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationRedirect {
    pub url: Url,
    pub state: SmolStr,
}

/// The OAuth client: starts logins, completes callbacks, refreshes and
/// restores sessions.
pub struct OAuthClient<T, S> {
    resolver: Arc<T>,
    store: Arc<S>,
    config: OAuthConfig,
}

impl<T, S> OAuthClient<T, S>
where
    T: OAuthResolver + Send + Sync + 'static,
    S: ClientAuthStore + 'static,
{
    pub fn new(resolver: T, store: S, config: OAuthConfig) -> Self {
        Self::from_shared(Arc::new(resolver), Arc::new(store), config)
    }

    pub fn from_shared(resolver: Arc<T>, store: Arc<S>, config: OAuthConfig) -> Self {
        #[cfg(feature = "tracing")]
        tracing::info!(
            app_url = %config.app_url,
            loopback = config.is_loopback(),
            "oauth client created"
        );
        Self {
            resolver,
            store,
            config,
        }
    }

    pub fn config(&self) -> &OAuthConfig {
        &self.config
    }

    pub fn resolver(&self) -> &Arc<T> {
        &self.resolver
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// The client metadata document to serve for `platform`.
    pub fn client_metadata(&self, platform: ClientPlatform) -> OAuthClientMetadata {
        OAuthClientMetadata::for_platform(&self.config, platform)
    }

    /// The public half of the client key, as served at the JWKS URI.
    pub fn jwks(&self) -> Result<JwkSet> {
        let key = public_jwk(&self.config.client_key.key)?;
        Ok(JwkSet {
            keys: vec![Jwk {
                key,
                prm: Parameters {
                    kid: self.config.client_key.prm.kid.clone(),
                    ..Default::default()
                },
            }],
        })
    }

    fn auth_server<'a>(
        &'a self,
        issuer: &'a str,
        client_id: &'a str,
        dpop_key: &'a Key,
    ) -> AuthServerCall<'a, T> {
        AuthServerCall {
            http: self.resolver.as_ref(),
            issuer,
            client_id,
            client_key: &self.config.client_key,
            dpop_key,
            user_agent: &self.config.user_agent,
            timeout: self.config.timeout,
        }
    }

    /// Identity (when `input` names an account) plus validated metadata.
    async fn discover(
        &self,
        input: &str,
    ) -> Result<(Option<ResolvedIdentity>, OAuthAuthorizationServerMetadata)> {
        if input.contains("://") {
            let service = ensure_safe_url(input).map_err(|e| OAuthError::unsafe_url(input, e))?;
            let metadata = self.resolver.resolve_from_service(&service).await?;
            return Ok((None, metadata));
        }
        let ident = AtIdentifier::new(input)
            .map_err(|_| OAuthError::InvalidIdentifier(SmolStr::new(input)))?;
        let (identity, metadata) = self.resolver.resolve_from_identity(&ident).await?;
        Ok((Some(identity), metadata))
    }

    /// Resolve `identifier`, push an authorization request and persist it.
    ///
    /// `identifier` is a handle, a DID, or an `https://` PDS or entryway URL.
    #[cfg_attr(feature = "tracing", tracing::instrument(level = "debug", skip_all, fields(identifier = identifier, platform = %options.platform)))]
    pub async fn start_auth(
        &self,
        ctx: &RequestContext,
        identifier: &str,
        options: AuthorizeOptions,
    ) -> Result<AuthorizationRedirect> {
        let identifier = identifier.trim();
        let platform = options.platform;
        let scope = options
            .scope
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| self.config.default_scope.clone());
        let redirect_uri = options
            .redirect_uri
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| self.config.redirect_uri(platform));

        let (identity, metadata) = ctx.guard(self.discover(identifier)).await??;
        let issuer = metadata.issuer.clone();
        let par_endpoint = metadata
            .pushed_authorization_request_endpoint
            .as_deref()
            .ok_or_else(|| OAuthError::invalid_metadata(&issuer, MetadataCheck::ParEndpoint))?;
        let par_endpoint =
            ensure_safe_url(par_endpoint).map_err(|e| OAuthError::unsafe_url(par_endpoint, e))?;
        let token_endpoint = ensure_safe_url(&metadata.token_endpoint)
            .map_err(|e| OAuthError::unsafe_url(&metadata.token_endpoint, e))?;

        let state = generate_state();
        let (code_challenge, pkce_verifier) = generate_pkce();
        let dpop_key = generate_dpop_key();
        let client_id = self.config.client_id(platform);
        let login_hint = identity.as_ref().map(|_| SmolStr::new(identifier));

        let request = OAuthRequest::PushedAuthorization(ParParameters {
            response_type: AuthorizationResponseType::Code,
            redirect_uri: redirect_uri.clone(),
            state: state.clone(),
            scope: scope.clone(),
            code_challenge,
            code_challenge_method: AuthorizationCodeChallengeMethod::S256,
            login_hint: login_hint.clone(),
        });
        let mut nonce = SmolStr::default();
        let par: OAuthParResponse = ctx
            .guard(
                self.auth_server(&issuer, &client_id, &dpop_key)
                    .send(&par_endpoint, &request, &mut nonce),
            )
            .await??;

        let (subject_did, subject_handle, pds_url) = match identity {
            Some(id) => (Some(id.did), id.handle, Some(id.pds)),
            None => (None, None, None),
        };
        self.store
            .save_auth_request(&PendingAuthRequest {
                state: state.clone(),
                pkce_verifier,
                code_challenge_method: AuthorizationCodeChallengeMethod::S256,
                scope,
                redirect_uri,
                client_platform: platform,
                subject_did,
                subject_handle,
                pds_url,
                login_hint,
                authserver_issuer: issuer,
                authserver_token_endpoint: token_endpoint,
                dpop_authserver_nonce: nonce,
                dpop_private_jwk: dpop_key,
                created_at: Utc::now(),
            })
            .await?;

        let query = serde_html_form::to_string(&[
            ("client_id", client_id.as_str()),
            ("request_uri", par.request_uri.as_str()),
        ])
        .map_err(OAuthError::encode)?;
        let url = Url::parse(&format!("{}?{query}", metadata.authorization_endpoint))
            .map_err(OAuthError::encode)?;

        #[cfg(feature = "tracing")]
        tracing::debug!(issuer = %metadata.issuer, "authorization request pushed");
        Ok(AuthorizationRedirect { url, state })
    }

    /// Complete a login from the redirect's `code`, `state` and `iss`.
    ///
    /// The pending request is consumed before anything else happens, so a
    /// replayed callback fails even if the first one did not succeed.
    #[cfg_attr(feature = "tracing", tracing::instrument(level = "debug", skip_all, fields(iss = %params.iss)))]
    pub async fn handle_callback(
        &self,
        ctx: &RequestContext,
        params: CallbackParams,
    ) -> Result<Session> {
        let pending = self
            .store
            .take_auth_request(&params.state)
            .await?
            .ok_or(OAuthError::ReplayedOrUnknownState)?;
        if params.iss != pending.authserver_issuer {
            return Err(OAuthError::IssuerMismatch {
                expected: pending.authserver_issuer,
                found: params.iss,
            });
        }

        let client_id = self.config.client_id(pending.client_platform);
        let request = OAuthRequest::Token(TokenRequestParameters {
            grant_type: TokenGrantType::AuthorizationCode,
            code: params.code,
            redirect_uri: pending.redirect_uri.clone(),
            code_verifier: pending.pkce_verifier.clone(),
        });
        let mut nonce = pending.dpop_authserver_nonce.clone();
        let tokens: OAuthTokenResponse = ctx
            .guard(
                self.auth_server(&pending.authserver_issuer, &client_id, &pending.dpop_private_jwk)
                    .send(&pending.authserver_token_endpoint, &request, &mut nonce),
            )
            .await??;
        check_token_shape(&tokens)?;

        let sub = tokens.sub.clone().unwrap_or_default();
        let identity = match (&pending.subject_did, &pending.pds_url) {
            (Some(expected), Some(pds)) => {
                if expected.as_str() != sub {
                    return Err(OAuthError::SubjectMismatch {
                        expected: expected.clone(),
                        found: sub,
                    });
                }
                ResolvedIdentity {
                    did: expected.clone(),
                    handle: pending.subject_handle.clone(),
                    pds: pds.clone(),
                }
            }
            _ => {
                let did = Did::new(&sub).map_err(|_| invalid_token_response("sub is not a DID"))?;
                if let Some(expected) = &pending.subject_did
                    && expected != &did
                {
                    return Err(OAuthError::SubjectMismatch {
                        expected: expected.clone(),
                        found: sub,
                    });
                }
                // Nothing tied this login to an account up front, so the
                // account must prove it trusts this issuer.
                ctx.guard(self.resolver.verify_issuer(&pending.authserver_issuer, &did))
                    .await??
            }
        };

        let granted = tokens.scope.clone().unwrap_or_default();
        if !same_scope(&pending.scope, &granted) {
            return Err(OAuthError::ScopeMismatch {
                requested: pending.scope,
                granted,
            });
        }

        let session = Session {
            subject_did: identity.did,
            handle: identity.handle,
            pds_url: identity.pds,
            authserver_issuer: pending.authserver_issuer,
            authserver_token_endpoint: pending.authserver_token_endpoint,
            client_platform: pending.client_platform,
            access_token: tokens.access_token,
            refresh_token: tokens.refresh_token.unwrap_or_default(),
            token_type: tokens.token_type,
            scope: granted,
            dpop_private_jwk: pending.dpop_private_jwk,
            dpop_authserver_nonce: nonce,
            dpop_resource_server_nonce: SmolStr::default(),
            created_at: Utc::now(),
            expires_in: tokens.expires_in,
        };
        self.store.upsert_session(&session).await?;

        #[cfg(feature = "tracing")]
        tracing::info!(did = %session.subject_did, "oauth session established");
        Ok(session)
    }

    /// Trade the refresh token for new tokens, updating `session` in place.
    ///
    /// The DPoP key is never replaced.
    #[cfg_attr(feature = "tracing", tracing::instrument(level = "debug", skip_all, fields(did = %session.subject_did)))]
    pub async fn refresh(&self, ctx: &RequestContext, session: &mut Session) -> Result<()> {
        let client_id = self.config.client_id(session.client_platform);
        let request = OAuthRequest::Refresh(RefreshRequestParameters {
            grant_type: TokenGrantType::RefreshToken,
            refresh_token: session.refresh_token.clone(),
        });
        let mut nonce = session.dpop_authserver_nonce.clone();
        let tokens: OAuthTokenResponse = ctx
            .guard(
                self.auth_server(&session.authserver_issuer, &client_id, &session.dpop_private_jwk)
                    .send(&session.authserver_token_endpoint, &request, &mut nonce),
            )
            .await??;
        if tokens.token_type != OAuthTokenType::DPoP {
            return Err(invalid_token_response("token_type must be DPoP"));
        }
        if let Some(sub) = &tokens.sub
            && sub != session.subject_did.as_str()
        {
            return Err(OAuthError::SubjectMismatch {
                expected: session.subject_did.clone(),
                found: sub.clone(),
            });
        }

        session.apply_refresh(tokens, nonce, Utc::now());
        self.store.upsert_session(session).await?;
        Ok(())
    }

    /// Load the stored session for `did`, refusing expired ones.
    pub async fn restore(&self, did: &Did) -> Result<Session> {
        let session = self
            .store
            .get_session(did)
            .await?
            .ok_or_else(|| OAuthError::NoSession(did.clone()))?;
        if session.is_expired(Utc::now()) {
            return Err(OAuthError::SessionExpired { did: did.clone() });
        }
        Ok(session)
    }

    /// Load the stored session for `did`, refreshing it first if it has expired.
    pub async fn restore_or_refresh(&self, ctx: &RequestContext, did: &Did) -> Result<Session> {
        let mut session = self
            .store
            .get_session(did)
            .await?
            .ok_or_else(|| OAuthError::NoSession(did.clone()))?;
        if session.is_expired(Utc::now()) {
            self.refresh(ctx, &mut session).await?;
        }
        Ok(session)
    }

    /// Forget the session for `did`. Tokens are not revoked server-side.
    pub async fn logout(&self, did: &Did) -> Result<()> {
        self.store.delete_session(did).await?;
        #[cfg(feature = "tracing")]
        tracing::info!(did = %did, "oauth session removed");
        Ok(())
    }

    /// An XRPC executor for `session` that persists nonce changes to the store.
    pub fn xrpc(&self, session: Session) -> XrpcClient<T> {
        XrpcClient::new(self.resolver.clone(), session)
            .with_user_agent(self.config.user_agent.clone())
            .with_timeout(self.config.timeout)
            .with_nonce_update(self.store.clone())
    }
}

fn invalid_token_response(reason: &str) -> OAuthError {
    OAuthError::TokenExchangeFailed(EndpointFailure::InvalidResponse(SmolStr::new(reason)))
}

/// The fields an atproto code exchange must return.
fn check_token_shape(tokens: &OAuthTokenResponse) -> Result<()> {
    if tokens.access_token.is_empty() {
        return Err(invalid_token_response("empty access_token"));
    }
    if tokens.token_type != OAuthTokenType::DPoP {
        return Err(invalid_token_response("token_type must be DPoP"));
    }
    if tokens.refresh_token.as_deref().is_none_or(str::is_empty) {
        return Err(invalid_token_response("missing refresh_token"));
    }
    if tokens.sub.as_deref().is_none_or(str::is_empty) {
        return Err(invalid_token_response("missing sub"));
    }
    Ok(())
}

/// Scopes are space-separated sets; order and repeats do not matter.
fn same_scope(requested: &str, granted: &str) -> bool {
    fn set(s: &str) -> BTreeSet<&str> {
        s.split_ascii_whitespace().collect()
    }
    set(requested) == set(granted)
}

impl<T, S> std::fmt::Debug for OAuthClient<T, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuthClient")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
