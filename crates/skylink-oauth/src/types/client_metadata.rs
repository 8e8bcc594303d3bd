use jose_jwk::JwkSet;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

use crate::config::{ClientPlatform, OAuthConfig};

/// Client metadata document served at the client id URL.
// https://datatracker.ietf.org/doc/html/rfc7591#section-2
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct OAuthClientMetadata {
    pub client_id: SmolStr,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_name: Option<SmolStr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_uri: Option<SmolStr>,
    pub application_type: SmolStr,
    pub redirect_uris: Vec<SmolStr>,
    pub grant_types: Vec<SmolStr>,
    pub response_types: Vec<SmolStr>,
    pub scope: SmolStr,
    pub token_endpoint_auth_method: SmolStr,
    // https://openid.net/specs/openid-connect-registration-1_0.html#ClientMetadata
    pub token_endpoint_auth_signing_alg: SmolStr,
    // https://datatracker.ietf.org/doc/html/rfc9449#section-5.2
    pub dpop_bound_access_tokens: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jwks_uri: Option<SmolStr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jwks: Option<JwkSet>,
}

impl OAuthClientMetadata {
    /// The document advertised for `platform`.
    pub fn for_platform(config: &OAuthConfig, platform: ClientPlatform) -> Self {
        let application_type = match platform {
            ClientPlatform::Web => "web",
            ClientPlatform::Ios | ClientPlatform::Android => "native",
        };
        Self {
            client_id: config.client_id(platform),
            client_name: Some(config.client_name.clone()),
            client_uri: Some(config.app_base().into()),
            application_type: application_type.into(),
            redirect_uris: vec![config.redirect_uri(platform)],
            grant_types: vec!["authorization_code".into(), "refresh_token".into()],
            response_types: vec!["code".into()],
            scope: config.default_scope.clone(),
            token_endpoint_auth_method: "private_key_jwt".into(),
            token_endpoint_auth_signing_alg: "ES256".into(),
            dpop_bound_access_tokens: true,
            jwks_uri: Some(config.jwks_uri()),
            jwks: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::generate_key;

    fn config(app: &str) -> OAuthConfig {
        OAuthConfig::new()
            .app_url(url::Url::parse(app).unwrap())
            .client_key(generate_key(Some("k1")))
            .client_name("Skylink Test".into())
            .build()
    }

    #[test]
    fn web_document() {
        let meta = OAuthClientMetadata::for_platform(
            &config("https://app.example.com/"),
            ClientPlatform::Web,
        );
        let v = serde_json::to_value(&meta).unwrap();
        assert_eq!(
            v["client_id"],
            "https://app.example.com/api/oauth/web/client-metadata.json"
        );
        assert_eq!(v["application_type"], "web");
        assert_eq!(v["redirect_uris"][0], "https://app.example.com/api/oauth/callback");
        assert_eq!(v["jwks_uri"], "https://app.example.com/api/oauth/jwks.json");
        assert_eq!(v["token_endpoint_auth_method"], "private_key_jwt");
        assert_eq!(v["token_endpoint_auth_signing_alg"], "ES256");
        assert_eq!(v["dpop_bound_access_tokens"], true);
        assert_eq!(v["scope"], "atproto transition:generic");
        assert_eq!(v["client_name"], "Skylink Test");
        assert!(v.get("jwks").is_none());
    }

    #[test]
    fn native_document() {
        let meta = OAuthClientMetadata::for_platform(
            &config("https://app.example.com"),
            ClientPlatform::Ios,
        );
        assert_eq!(meta.application_type, "native");
        assert_eq!(
            meta.client_id,
            "https://app.example.com/api/oauth/ios/client-metadata.json"
        );
        assert_eq!(
            meta.redirect_uris,
            vec![SmolStr::new("https://app.example.com/api/oauth/ios/callback")]
        );
    }
}
