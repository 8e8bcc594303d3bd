//! Client authentication and the PAR/token endpoint round trip.

use std::time::Duration;

use chrono::Utc;
use http::header::{ACCEPT, CONTENT_TYPE, USER_AGENT};
use http::{Method, Request, Response, StatusCode};
use jose_jwk::{Jwk, Key};
use serde::Serialize;
use serde::de::DeserializeOwned;
use skylink_common::TransportError;
use skylink_common::http_client::HttpClient;
use skylink_common::url_guard::ensure_safe;
use smol_str::{SmolStr, ToSmolStr};
use url::Url;

use crate::dpop::{generate_jti, make_dpop_proof, nonce_challenge, response_nonce};
use crate::error::{EndpointFailure, OAuthError, Result};
use crate::jose::jwt::{Audience, RegisteredClaims};
use crate::jose::{Header, create_signed_jwt, signing_key};
use crate::types::{
    CLIENT_ASSERTION_TYPE_JWT_BEARER, ParParameters, RefreshRequestParameters, RequestPayload,
    TokenRequestParameters,
};

/// Lifetime of a client assertion, in seconds.
pub const CLIENT_ASSERTION_LIFETIME: i64 = 60;

/// Sign a `private_key_jwt` client assertion (RFC 7523 §3) for `audience_issuer`.
pub fn make_client_assertion(
    client_id: &str,
    audience_issuer: &str,
    client_key: &Jwk,
) -> Result<SmolStr> {
    let signer = signing_key(&client_key.key)?;
    let header = Header::es256()
        .with_typ("jwt")
        .with_kid(client_key.prm.kid.as_deref());
    let iat = Utc::now().timestamp();
    let claims = RegisteredClaims {
        iss: Some(SmolStr::new(client_id)),
        sub: Some(SmolStr::new(client_id)),
        aud: Some(Audience::Multiple(vec![SmolStr::new(audience_issuer)])),
        exp: Some(iat + CLIENT_ASSERTION_LIFETIME),
        iat: Some(iat),
        // atproto authorization servers require a unique jti
        jti: Some(generate_jti()),
    };
    create_signed_jwt(&signer, &header, &claims.into())
}

/// A request to one of the authorization server's POST endpoints.
#[derive(Debug, Clone)]
pub enum OAuthRequest {
    PushedAuthorization(ParParameters),
    Token(TokenRequestParameters),
    Refresh(RefreshRequestParameters),
}

impl OAuthRequest {
    pub fn name(&self) -> &'static str {
        match self {
            Self::PushedAuthorization(_) => "pushed_authorization_request",
            Self::Token(_) => "token",
            Self::Refresh(_) => "refresh",
        }
    }

    fn accepts(&self, status: StatusCode) -> bool {
        match self {
            Self::PushedAuthorization(_) => {
                status == StatusCode::OK || status == StatusCode::CREATED
            }
            Self::Token(_) | Self::Refresh(_) => status == StatusCode::OK,
        }
    }

    fn failure(&self, failure: EndpointFailure) -> OAuthError {
        match self {
            Self::PushedAuthorization(_) => OAuthError::ParFailed(failure),
            Self::Token(_) | Self::Refresh(_) => OAuthError::TokenExchangeFailed(failure),
        }
    }

    fn form(&self, client_id: &str, assertion: SmolStr) -> Result<String> {
        fn encode<T: Serialize>(
            client_id: &str,
            assertion: SmolStr,
            parameters: &T,
        ) -> Result<String> {
            serde_html_form::to_string(RequestPayload {
                client_id: SmolStr::new(client_id),
                client_assertion_type: Some(SmolStr::new_static(CLIENT_ASSERTION_TYPE_JWT_BEARER)),
                client_assertion: Some(assertion),
                parameters,
            })
            .map_err(OAuthError::encode)
        }
        match self {
            Self::PushedAuthorization(p) => encode(client_id, assertion, p),
            Self::Token(p) => encode(client_id, assertion, p),
            Self::Refresh(p) => encode(client_id, assertion, p),
        }
    }
}

/// Outcome of a single attempt against a nonce-issuing server.
#[derive(Debug)]
pub(crate) enum Attempt<T> {
    Success(T),
    NonceChallenge(SmolStr),
    Fatal(OAuthError),
}

/// Everything needed to call one authorization server on behalf of one login.
pub struct AuthServerCall<'a, C: ?Sized> {
    pub http: &'a C,
    pub issuer: &'a str,
    pub client_id: &'a str,
    pub client_key: &'a Jwk,
    pub dpop_key: &'a Key,
    pub user_agent: &'a str,
    pub timeout: Duration,
}

impl<C: HttpClient + Sync + ?Sized> AuthServerCall<'_, C> {
    /// POST `request` to `endpoint`, answering at most one nonce challenge.
    ///
    /// `nonce` is the authorization server nonce to start with; it is left
    /// holding the latest nonce the server handed out.
    #[cfg_attr(feature = "tracing", tracing::instrument(level = "debug", skip_all, fields(request = request.name(), issuer = self.issuer)))]
    pub async fn send<O: DeserializeOwned>(
        &self,
        endpoint: &Url,
        request: &OAuthRequest,
        nonce: &mut SmolStr,
    ) -> Result<O> {
        let mut challenged = false;
        loop {
            match self.attempt(endpoint, request, nonce).await {
                Attempt::Success(out) => return Ok(out),
                Attempt::NonceChallenge(fresh) => {
                    *nonce = fresh;
                    if challenged {
                        return Err(request.failure(EndpointFailure::NonceChallengeRepeated));
                    }
                    challenged = true;
                    #[cfg(feature = "tracing")]
                    tracing::debug!("retrying with fresh authorization server nonce");
                }
                Attempt::Fatal(e) => return Err(e),
            }
        }
    }

    async fn attempt<O: DeserializeOwned>(
        &self,
        endpoint: &Url,
        request: &OAuthRequest,
        nonce: &mut SmolStr,
    ) -> Attempt<O> {
        let response = match self.round_trip(endpoint, request, nonce).await {
            Ok(response) => response,
            Err(e) => return Attempt::Fatal(e),
        };
        if let Some(challenge) = nonce_challenge(&response) {
            return Attempt::NonceChallenge(challenge);
        }
        if let Some(fresh) = response_nonce(&response) {
            *nonce = fresh;
        }
        let status = response.status();
        if request.accepts(status) {
            return match serde_json::from_slice(response.body()) {
                Ok(out) => Attempt::Success(out),
                Err(e) => Attempt::Fatal(
                    request.failure(EndpointFailure::InvalidResponse(e.to_smolstr())),
                ),
            };
        }
        Attempt::Fatal(request.failure(EndpointFailure::Status {
            status,
            body: serde_json::from_slice(response.body()).ok(),
        }))
    }

    async fn round_trip(
        &self,
        endpoint: &Url,
        request: &OAuthRequest,
        nonce: &str,
    ) -> Result<Response<Vec<u8>>> {
        ensure_safe(endpoint).map_err(|e| OAuthError::unsafe_url(endpoint, e))?;
        // A fresh assertion and proof per attempt: both carry single-use jtis.
        let assertion = make_client_assertion(self.client_id, self.issuer, self.client_key)?;
        let body = request.form(self.client_id, assertion)?;
        let proof = make_dpop_proof(self.dpop_key, &Method::POST, endpoint.as_str(), nonce, None)?;
        let req = Request::builder()
            .method(Method::POST)
            .uri(endpoint.as_str())
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
            .header(ACCEPT, "application/json")
            .header(USER_AGENT, self.user_agent)
            .header("DPoP", proof.as_str())
            .body(body.into_bytes())
            .map_err(TransportError::from)?;
        let response = tokio::time::timeout(self.timeout, self.http.send_http(req))
            .await
            .map_err(|_| OAuthError::Timeout)?
            .map_err(TransportError::other)?;
        Ok(response)
    }
}
