use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

/// `client_assertion_type` for `private_key_jwt` client authentication (RFC 7523).
pub const CLIENT_ASSERTION_TYPE_JWT_BEARER: &str =
    "urn:ietf:params:oauth:client-assertion-type:jwt-bearer";

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuthorizationResponseType {
    Code,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthorizationCodeChallengeMethod {
    S256,
}

impl AuthorizationCodeChallengeMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::S256 => "S256",
        }
    }
}

// https://datatracker.ietf.org/doc/html/rfc9126#section-2.1
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ParParameters {
    pub response_type: AuthorizationResponseType,
    pub redirect_uri: SmolStr,
    pub state: SmolStr,
    pub scope: SmolStr,
    // https://datatracker.ietf.org/doc/html/rfc7636#section-4.3
    pub code_challenge: SmolStr,
    pub code_challenge_method: AuthorizationCodeChallengeMethod,
    // https://openid.net/specs/openid-connect-core-1_0.html#AuthRequest
    #[serde(skip_serializing_if = "Option::is_none")]
    pub login_hint: Option<SmolStr>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TokenGrantType {
    AuthorizationCode,
    RefreshToken,
}

// https://datatracker.ietf.org/doc/html/rfc6749#section-4.1.3
#[derive(Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct TokenRequestParameters {
    pub grant_type: TokenGrantType,
    pub code: SmolStr,
    pub redirect_uri: SmolStr,
    pub code_verifier: SmolStr,
}

// https://datatracker.ietf.org/doc/html/rfc6749#section-6
#[derive(Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct RefreshRequestParameters {
    pub grant_type: TokenGrantType,
    pub refresh_token: SmolStr,
}

/// Form body sent to the PAR and token endpoints: client authentication plus
/// the endpoint-specific parameters.
#[derive(Serialize, Debug, Clone)]
pub struct RequestPayload<T: Serialize> {
    pub client_id: SmolStr,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_assertion_type: Option<SmolStr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_assertion: Option<SmolStr>,
    #[serde(flatten)]
    pub parameters: T,
}

/// Query parameters the authorization server appends to the redirect URI.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CallbackParams {
    pub code: SmolStr,
    pub state: SmolStr,
    pub iss: SmolStr,
}

impl std::fmt::Debug for TokenRequestParameters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenRequestParameters")
            .field("grant_type", &self.grant_type)
            .field("redirect_uri", &self.redirect_uri)
            .finish_non_exhaustive()
    }
}

impl std::fmt::Debug for RefreshRequestParameters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefreshRequestParameters")
            .field("grant_type", &self.grant_type)
            .finish_non_exhaustive()
    }
}
