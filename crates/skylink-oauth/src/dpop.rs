//! DPoP proofs (RFC 9449).

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::Utc;
use http::Response;
use jose_jwk::{Jwk, Key};
use rand::rngs::ThreadRng;
use sha2::{Digest, Sha256};
use smol_str::SmolStr;
use url::Url;

use crate::error::{OAuthError, Result};
use crate::jose::{
    Claims, Header, create_signed_jwt, public_jwk, signing_key,
    jwt::{PublicClaims, RegisteredClaims},
};
use crate::utils::get_random_values;

pub const JWT_HEADER_TYP_DPOP: &str = "dpop+jwt";
pub const DPOP_NONCE_HEADER: &str = "DPoP-Nonce";

/// Lifetime of proofs sent to a resource server, in seconds.
pub const RESOURCE_PROOF_LIFETIME: i64 = 10;
/// Lifetime of proofs sent to an authorization server, in seconds.
pub const AUTH_SERVER_PROOF_LIFETIME: i64 = 30;

#[derive(serde::Deserialize)]
struct ErrorResponse {
    error: SmolStr,
}

pub(crate) fn generate_jti() -> SmolStr {
    URL_SAFE_NO_PAD
        .encode(get_random_values::<_, 16>(&mut ThreadRng::default()))
        .into()
}

/// `b64url(sha256(access_token))`
pub fn access_token_hash(access_token: &str) -> SmolStr {
    URL_SAFE_NO_PAD.encode(Sha256::digest(access_token)).into()
}

/// The `htu` claim: the target URI without query and fragment.
fn target_uri(url: &str) -> Result<SmolStr> {
    let mut url = Url::parse(url).map_err(OAuthError::encode)?;
    url.set_query(None);
    url.set_fragment(None);
    Ok(SmolStr::new(url.as_str()))
}

/// Build a compact ES256 DPoP proof with the public half of `key` embedded.
///
/// With an `access_token` the proof targets a resource server: it carries
/// `ath` and expires after [`RESOURCE_PROOF_LIFETIME`]. Without one it is an
/// authorization server proof valid for [`AUTH_SERVER_PROOF_LIFETIME`].
/// An empty `nonce` is omitted.
pub fn make_dpop_proof(
    key: &Key,
    method: &http::Method,
    url: &str,
    nonce: &str,
    access_token: Option<&str>,
) -> Result<SmolStr> {
    let signer = signing_key(key)?;
    let header = Header::es256()
        .with_typ(JWT_HEADER_TYP_DPOP)
        .with_jwk(Jwk {
            key: public_jwk(key)?,
            prm: Default::default(),
        });

    let iat = Utc::now().timestamp();
    let lifetime = match access_token {
        Some(_) => RESOURCE_PROOF_LIFETIME,
        None => AUTH_SERVER_PROOF_LIFETIME,
    };
    let claims = Claims {
        registered: RegisteredClaims {
            jti: Some(generate_jti()),
            iat: Some(iat),
            exp: Some(iat + lifetime),
            ..Default::default()
        },
        public: PublicClaims {
            htm: Some(SmolStr::new(method.as_str())),
            htu: Some(target_uri(url)?),
            ath: access_token.map(access_token_hash),
            nonce: (!nonce.is_empty()).then(|| SmolStr::new(nonce)),
        },
    };
    create_signed_jwt(&signer, &header, &claims)
}

/// The `DPoP-Nonce` header of a response, if any.
pub fn response_nonce<B>(response: &Response<B>) -> Option<SmolStr> {
    header_nonce(response.headers())
}

pub fn header_nonce(headers: &http::HeaderMap) -> Option<SmolStr> {
    headers
        .get(DPOP_NONCE_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(SmolStr::new)
}

/// Whether the server rejected the request for want of a fresh nonce.
pub fn is_use_dpop_nonce_error(response: &Response<Vec<u8>>) -> bool {
    let status = response.status();
    if status != 400 && status != 401 {
        return false;
    }
    // https://datatracker.ietf.org/doc/html/rfc9449#name-authorization-server-provid
    if let Ok(res) = serde_json::from_slice::<ErrorResponse>(response.body()) {
        if res.error == "use_dpop_nonce" {
            return true;
        }
    }
    // https://datatracker.ietf.org/doc/html/rfc9449#name-resource-server-provided-no
    status == 401
        && response
            .headers()
            .get(http::header::WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.starts_with("DPoP") && v.contains(r#"error="use_dpop_nonce""#))
}

/// The nonce to retry with, when `response` is a nonce challenge that names one.
pub fn nonce_challenge(response: &Response<Vec<u8>>) -> Option<SmolStr> {
    if is_use_dpop_nonce_error(response) {
        response_nonce(response)
    } else {
        None
    }
}
