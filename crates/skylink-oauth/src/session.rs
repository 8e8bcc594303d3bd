//! Persisted OAuth state: in-flight authorization requests and sessions.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use jose_jwk::Key;
use serde::{Deserialize, Serialize};
use skylink_common::{Did, Handle};
use smol_str::SmolStr;
use url::Url;

use crate::config::ClientPlatform;
use crate::types::{AuthorizationCodeChallengeMethod, OAuthTokenResponse, OAuthTokenType};

/// An authorization that has been pushed but not yet called back.
///
/// Keyed by `state`; consumed exactly once by the callback.
#[derive(Clone, Serialize, Deserialize)]
pub struct PendingAuthRequest {
    pub state: SmolStr,
    pub pkce_verifier: SmolStr,
    pub code_challenge_method: AuthorizationCodeChallengeMethod,
    pub scope: SmolStr,
    pub redirect_uri: SmolStr,
    pub client_platform: ClientPlatform,
    pub subject_did: Option<Did>,
    pub subject_handle: Option<Handle>,
    pub pds_url: Option<Url>,
    pub login_hint: Option<SmolStr>,
    pub authserver_issuer: SmolStr,
    pub authserver_token_endpoint: Url,
    pub dpop_authserver_nonce: SmolStr,
    pub dpop_private_jwk: Key,
    pub created_at: DateTime<Utc>,
}

impl fmt::Debug for PendingAuthRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingAuthRequest")
            .field("scope", &self.scope)
            .field("client_platform", &self.client_platform)
            .field("subject_did", &self.subject_did)
            .field("subject_handle", &self.subject_handle)
            .field("authserver_issuer", &self.authserver_issuer)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

/// An authenticated account.
///
/// The DPoP key is fixed for the lifetime of the session; refresh replaces the
/// tokens and the authorization server nonce, XRPC calls replace the resource
/// server nonce.
#[derive(Clone, Serialize, Deserialize)]
pub struct Session {
    pub subject_did: Did,
    pub handle: Option<Handle>,
    pub pds_url: Url,
    pub authserver_issuer: SmolStr,
    pub authserver_token_endpoint: Url,
    pub client_platform: ClientPlatform,
    pub access_token: SmolStr,
    pub refresh_token: SmolStr,
    pub token_type: OAuthTokenType,
    pub scope: SmolStr,
    pub dpop_private_jwk: Key,
    pub dpop_authserver_nonce: SmolStr,
    pub dpop_resource_server_nonce: SmolStr,
    pub created_at: DateTime<Utc>,
    /// Access token lifetime in seconds, counted from `created_at`.
    pub expires_in: Option<i64>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("subject_did", &self.subject_did)
            .field("handle", &self.handle)
            .field("pds_url", &self.pds_url.as_str())
            .field("authserver_issuer", &self.authserver_issuer)
            .field("client_platform", &self.client_platform)
            .field("token_type", &self.token_type)
            .field("scope", &self.scope)
            .field("created_at", &self.created_at)
            .field("expires_in", &self.expires_in)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// When the access token stops being valid, if the server said.
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_in
            .map(|secs| self.created_at + Duration::seconds(secs))
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at().is_some_and(|at| now > at)
    }

    /// Take the tokens of a refresh response. A missing refresh token in the
    /// response keeps the current one.
    pub(crate) fn apply_refresh(
        &mut self,
        tokens: OAuthTokenResponse,
        nonce: SmolStr,
        now: DateTime<Utc>,
    ) {
        self.access_token = tokens.access_token;
        if let Some(refresh) = tokens.refresh_token {
            self.refresh_token = refresh;
        }
        self.token_type = tokens.token_type;
        if let Some(scope) = tokens.scope {
            self.scope = scope;
        }
        self.created_at = now;
        self.expires_in = tokens.expires_in;
        self.dpop_authserver_nonce = nonce;
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use crate::utils::generate_dpop_key;

    pub fn session(did: &str) -> Session {
        Session {
            subject_did: Did::new(did).unwrap(),
            handle: Some(Handle::new("alice.example.com").unwrap()),
            pds_url: Url::parse("https://pds.example.com").unwrap(),
            authserver_issuer: "https://auth.example.com".into(),
            authserver_token_endpoint: Url::parse("https://auth.example.com/oauth/token").unwrap(),
            client_platform: ClientPlatform::Web,
            access_token: "access-1".into(),
            refresh_token: "refresh-1".into(),
            token_type: OAuthTokenType::DPoP,
            scope: "atproto transition:generic".into(),
            dpop_private_jwk: generate_dpop_key(),
            dpop_authserver_nonce: "as-nonce".into(),
            dpop_resource_server_nonce: SmolStr::default(),
            created_at: Utc::now(),
            expires_in: Some(3600),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::session;
    use super::*;

    #[test]
    fn expiry_is_relative_to_creation() {
        let mut s = session("did:plc:alice");
        let created = s.created_at;
        assert!(!s.is_expired(created + Duration::seconds(3600)));
        assert!(s.is_expired(created + Duration::seconds(3601)));

        s.expires_in = None;
        assert!(!s.is_expired(created + Duration::days(365)));
    }

    #[test]
    fn refresh_keeps_key_and_identity() {
        let mut s = session("did:plc:alice");
        let key = serde_json::to_value(&s.dpop_private_jwk).unwrap();
        let later = s.created_at + Duration::seconds(10);
        s.apply_refresh(
            OAuthTokenResponse {
                access_token: "access-2".into(),
                token_type: OAuthTokenType::DPoP,
                expires_in: Some(60),
                refresh_token: None,
                scope: None,
                sub: None,
            },
            "as-nonce-2".into(),
            later,
        );
        assert_eq!(s.access_token, "access-2");
        assert_eq!(s.refresh_token, "refresh-1");
        assert_eq!(s.dpop_authserver_nonce, "as-nonce-2");
        assert_eq!(s.expires_at(), Some(later + Duration::seconds(60)));
        assert_eq!(serde_json::to_value(&s.dpop_private_jwk).unwrap(), key);
    }

    #[test]
    fn debug_hides_secrets() {
        let s = session("did:plc:alice");
        let dbg = format!("{s:?}");
        assert!(!dbg.contains("access-1"));
        assert!(!dbg.contains("refresh-1"));
    }

    #[test]
    fn serde_round_trip_keeps_key() {
        let s = session("did:plc:alice");
        let back: Session = serde_json::from_value(serde_json::to_value(&s).unwrap()).unwrap();
        assert_eq!(back.subject_did, s.subject_did);
        assert_eq!(
            serde_json::to_value(&back.dpop_private_jwk).unwrap(),
            serde_json::to_value(&s.dpop_private_jwk).unwrap()
        );
    }
}
