use std::fmt;

use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct OAuthParResponse {
    pub request_uri: SmolStr,
    pub expires_in: Option<u32>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OAuthTokenType {
    #[serde(alias = "dpop", alias = "Dpop")]
    DPoP,
    #[serde(alias = "bearer")]
    Bearer,
}

impl OAuthTokenType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OAuthTokenType::DPoP => "DPoP",
            OAuthTokenType::Bearer => "Bearer",
        }
    }
}

// https://datatracker.ietf.org/doc/html/rfc6749#section-5.1
#[derive(Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct OAuthTokenResponse {
    pub access_token: SmolStr,
    pub token_type: OAuthTokenType,
    pub expires_in: Option<i64>,
    pub refresh_token: Option<SmolStr>,
    pub scope: Option<SmolStr>,
    // ATPROTO extension: the account DID, so the client can locate the PDS.
    pub sub: Option<SmolStr>,
}

impl fmt::Debug for OAuthTokenResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OAuthTokenResponse")
            .field("token_type", &self.token_type)
            .field("expires_in", &self.expires_in)
            .field("scope", &self.scope)
            .field("sub", &self.sub)
            .finish_non_exhaustive()
    }
}

/// Error body returned by the authorization server (RFC 6749 §5.2).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ServerErrorBody {
    pub error: SmolStr,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_description: Option<SmolStr>,
}

impl fmt::Display for ServerErrorBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.error_description {
            Some(desc) => write!(f, "{} ({desc})", self.error),
            None => f.write_str(&self.error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_response_requires_core_fields() {
        let ok: OAuthTokenResponse = serde_json::from_str(
            r#"{"access_token":"at","token_type":"DPoP","expires_in":300,"refresh_token":"rt","scope":"atproto","sub":"did:plc:alice"}"#,
        )
        .unwrap();
        assert_eq!(ok.token_type, OAuthTokenType::DPoP);
        assert_eq!(ok.sub.as_deref(), Some("did:plc:alice"));

        assert!(serde_json::from_str::<OAuthTokenResponse>(r#"{"token_type":"DPoP"}"#).is_err());
        assert!(serde_json::from_str::<OAuthTokenResponse>(r#"{"access_token":"at"}"#).is_err());
    }

    #[test]
    fn debug_hides_tokens() {
        let resp = OAuthTokenResponse {
            access_token: "secret-access".into(),
            token_type: OAuthTokenType::DPoP,
            expires_in: None,
            refresh_token: Some("secret-refresh".into()),
            scope: None,
            sub: None,
        };
        let dbg = format!("{resp:?}");
        assert!(!dbg.contains("secret"));
    }
}
