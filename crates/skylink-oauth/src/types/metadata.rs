use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use url::Url;

use crate::error::MetadataCheck;

/// Authorization server metadata (RFC 8414), trimmed to what an atproto
/// client reads. Unknown fields are ignored.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(default)]
pub struct OAuthAuthorizationServerMetadata {
    // https://datatracker.ietf.org/doc/html/rfc8414#section-2
    pub issuer: SmolStr,
    pub authorization_endpoint: SmolStr,
    pub token_endpoint: SmolStr,
    pub jwks_uri: Option<SmolStr>,
    pub scopes_supported: Vec<SmolStr>,
    pub response_types_supported: Vec<SmolStr>,
    pub grant_types_supported: Option<Vec<SmolStr>>,
    pub token_endpoint_auth_methods_supported: Option<Vec<SmolStr>>,
    pub token_endpoint_auth_signing_alg_values_supported: Option<Vec<SmolStr>>,
    pub code_challenge_methods_supported: Option<Vec<SmolStr>>,

    // https://openid.net/specs/openid-connect-discovery-1_0.html#ProviderMetadata
    pub require_request_uri_registration: Option<bool>,

    // https://datatracker.ietf.org/doc/html/rfc9126#section-5
    pub pushed_authorization_request_endpoint: Option<SmolStr>,
    pub require_pushed_authorization_requests: Option<bool>,

    // https://datatracker.ietf.org/doc/html/rfc9207#section-3
    pub authorization_response_iss_parameter_supported: Option<bool>,

    // https://datatracker.ietf.org/doc/html/rfc9449#section-5.1
    pub dpop_signing_alg_values_supported: Option<Vec<SmolStr>>,

    pub client_id_metadata_document_supported: Option<bool>,

    pub protected_resources: Option<Vec<SmolStr>>,
}

fn lists(values: &Option<Vec<SmolStr>>, wanted: &str) -> bool {
    values
        .as_ref()
        .is_some_and(|v| v.iter().any(|s| s == wanted))
}

impl OAuthAuthorizationServerMetadata {
    /// Check the issuer and capability requirements of the atproto OAuth
    /// profile. `fetched_from` is the issuer URL the document was requested for.
    ///
    /// Returns the first failed check.
    pub fn validate(&self, fetched_from: &Url) -> Result<(), MetadataCheck> {
        let issuer = Url::parse(&self.issuer).map_err(|_| MetadataCheck::IssuerHost)?;
        if issuer.scheme() != "https" {
            return Err(MetadataCheck::IssuerScheme);
        }
        if issuer.host_str().is_none_or(str::is_empty) {
            return Err(MetadataCheck::IssuerHost);
        }
        if issuer.port().is_some() {
            return Err(MetadataCheck::IssuerPort);
        }
        if !matches!(issuer.path(), "" | "/") {
            return Err(MetadataCheck::IssuerPath);
        }
        if issuer.query().is_some() || issuer.fragment().is_some() {
            return Err(MetadataCheck::IssuerQuery);
        }
        if !crate::resolver::issuer_equivalent(&self.issuer, fetched_from.as_str()) {
            return Err(MetadataCheck::IssuerMismatch);
        }

        let checks = [
            (
                self.response_types_supported.iter().any(|s| s == "code"),
                MetadataCheck::ResponseTypeCode,
            ),
            (
                lists(&self.grant_types_supported, "authorization_code"),
                MetadataCheck::GrantAuthorizationCode,
            ),
            (
                lists(&self.grant_types_supported, "refresh_token"),
                MetadataCheck::GrantRefreshToken,
            ),
            (
                lists(&self.code_challenge_methods_supported, "S256"),
                MetadataCheck::PkceS256,
            ),
            (
                lists(&self.dpop_signing_alg_values_supported, "ES256"),
                MetadataCheck::DpopEs256,
            ),
            (
                lists(&self.token_endpoint_auth_methods_supported, "none"),
                MetadataCheck::AuthMethodNone,
            ),
            (
                lists(&self.token_endpoint_auth_methods_supported, "private_key_jwt"),
                MetadataCheck::AuthMethodPrivateKeyJwt,
            ),
            (
                lists(&self.token_endpoint_auth_signing_alg_values_supported, "ES256"),
                MetadataCheck::AuthSigningEs256,
            ),
            (
                self.scopes_supported.iter().any(|s| s == "atproto"),
                MetadataCheck::ScopeAtproto,
            ),
            (
                self.authorization_response_iss_parameter_supported == Some(true),
                MetadataCheck::IssParameter,
            ),
            (
                self.pushed_authorization_request_endpoint
                    .as_deref()
                    .is_some_and(|s| !s.is_empty()),
                MetadataCheck::ParEndpoint,
            ),
            (
                self.require_pushed_authorization_requests == Some(true),
                MetadataCheck::ParRequired,
            ),
            (
                self.require_request_uri_registration != Some(false),
                MetadataCheck::RequestUriRegistration,
            ),
            (
                self.client_id_metadata_document_supported == Some(true),
                MetadataCheck::ClientIdMetadataDocument,
            ),
        ];
        match checks.into_iter().find(|(ok, _)| !ok) {
            Some((_, failed)) => Err(failed),
            None => Ok(()),
        }
    }
}

// https://datatracker.ietf.org/doc/html/draft-ietf-oauth-resource-metadata-08#section-2
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(default)]
pub struct OAuthProtectedResourceMetadata {
    pub resource: SmolStr,
    pub authorization_servers: Option<Vec<SmolStr>>,
    pub jwks_uri: Option<SmolStr>,
    pub scopes_supported: Vec<SmolStr>,
    pub bearer_methods_supported: Option<Vec<SmolStr>>,
}


#[cfg(test)]
mod tests {
    use super::fixtures::auth_server_metadata;
    use super::*;
    use serde_json::json;

    fn check(value: serde_json::Value, fetched: &str) -> Result<(), MetadataCheck> {
        let meta: OAuthAuthorizationServerMetadata = serde_json::from_value(value).unwrap();
        meta.validate(&Url::parse(fetched).unwrap())
    }

    #[test]
    fn complete_metadata_passes() {
        let v = auth_server_metadata("https://auth.example.com");
        assert_eq!(check(v, "https://auth.example.com"), Ok(()));
    }

    #[test]
    fn par_must_be_required() {
        let mut v = auth_server_metadata("https://auth.example.com");
        v.as_object_mut()
            .unwrap()
            .remove("require_pushed_authorization_requests");
        assert_eq!(
            check(v.clone(), "https://auth.example.com"),
            Err(MetadataCheck::ParRequired)
        );
        v["require_pushed_authorization_requests"] = false.into();
        assert_eq!(
            check(v, "https://auth.example.com"),
            Err(MetadataCheck::ParRequired)
        );
    }

    #[test]
    fn issuer_shape() {
        let v = auth_server_metadata("https://auth.example.com:8443");
        assert_eq!(
            check(v, "https://auth.example.com:8443"),
            Err(MetadataCheck::IssuerPort)
        );
        let v = auth_server_metadata("http://auth.example.com");
        assert_eq!(
            check(v, "http://auth.example.com"),
            Err(MetadataCheck::IssuerScheme)
        );
        let v = auth_server_metadata("https://auth.example.com/tenant");
        assert_eq!(
            check(v, "https://auth.example.com/tenant"),
            Err(MetadataCheck::IssuerPath)
        );
        let v = auth_server_metadata("https://evil.example.com");
        assert_eq!(
            check(v, "https://auth.example.com"),
            Err(MetadataCheck::IssuerMismatch)
        );
    }

    #[test]
    fn capabilities_are_each_checked() {
        let cases: [(&str, serde_json::Value, MetadataCheck); 6] = [
            ("response_types_supported", json!(["token"]), MetadataCheck::ResponseTypeCode),
            (
                "grant_types_supported",
                json!(["authorization_code"]),
                MetadataCheck::GrantRefreshToken,
            ),
            ("code_challenge_methods_supported", json!(["plain"]), MetadataCheck::PkceS256),
            ("dpop_signing_alg_values_supported", json!(["RS256"]), MetadataCheck::DpopEs256),
            (
                "token_endpoint_auth_methods_supported",
                json!(["none"]),
                MetadataCheck::AuthMethodPrivateKeyJwt,
            ),
            (
                "client_id_metadata_document_supported",
                json!(false),
                MetadataCheck::ClientIdMetadataDocument,
            ),
        ];
        for (field, value, expected) in cases {
            let mut v = auth_server_metadata("https://auth.example.com");
            v[field] = value;
            assert_eq!(check(v, "https://auth.example.com"), Err(expected), "{field}");
        }
    }
}
