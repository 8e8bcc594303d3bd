use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use jose_jwk::{Key, crypto};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey, signature::Signer, signature::Verifier};
use smol_str::{SmolStr, format_smolstr};

use super::{Header, jwt::Claims};
use crate::error::{OAuthError, Result};

/// `b64url(header).b64url(claims).b64url(sig)` with an ES256 signature.
pub fn create_signed_jwt(key: &SigningKey, header: &Header, claims: &Claims) -> Result<SmolStr> {
    let header = URL_SAFE_NO_PAD.encode(serde_json::to_vec(header).map_err(OAuthError::encode)?);
    let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(claims).map_err(OAuthError::encode)?);
    let signature: Signature = key.sign(format!("{header}.{payload}").as_bytes());
    Ok(format_smolstr!(
        "{header}.{payload}.{}",
        URL_SAFE_NO_PAD.encode(signature.to_bytes())
    ))
}

/// The ES256 signing key held in a private P-256 JWK.
pub fn signing_key(key: &Key) -> Result<SigningKey> {
    match crypto::Key::try_from(key).map_err(|e| OAuthError::signing(format!("{e:?}")))? {
        crypto::Key::P256(crypto::Kind::Secret(sk)) => Ok(SigningKey::from(sk)),
        crypto::Key::P256(crypto::Kind::Public(_)) => {
            Err(OAuthError::signing("expected a private key, got a public one"))
        }
        #[allow(unreachable_patterns)]
        _ => Err(OAuthError::signing("only P-256 keys are supported")),
    }
}

/// Public half of a P-256 key; public keys are returned unchanged.
pub fn public_jwk(key: &Key) -> Result<Key> {
    match crypto::Key::try_from(key).map_err(|e| OAuthError::signing(format!("{e:?}")))? {
        crypto::Key::P256(crypto::Kind::Secret(sk)) => {
            Ok(Key::from(&crypto::Key::from(sk.public_key())))
        }
        crypto::Key::P256(crypto::Kind::Public(pk)) => Ok(Key::from(&crypto::Key::from(pk))),
        #[allow(unreachable_patterns)]
        _ => Err(OAuthError::signing("only P-256 keys are supported")),
    }
}

/// Check an ES256 compact JWT against `key` and decode its parts.
pub fn verify_signed_jwt(token: &str, key: &VerifyingKey) -> Result<(Header, Claims)> {
    let mut parts = token.split('.');
    let (Some(header), Some(payload), Some(sig), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(OAuthError::decode("not a compact JWS"));
    };
    let sig_bytes = URL_SAFE_NO_PAD.decode(sig).map_err(OAuthError::decode)?;
    let signature = Signature::from_slice(&sig_bytes).map_err(OAuthError::decode)?;
    key.verify(format!("{header}.{payload}").as_bytes(), &signature)
        .map_err(OAuthError::signing)?;
    let header = URL_SAFE_NO_PAD.decode(header).map_err(OAuthError::decode)?;
    let header: Header = serde_json::from_slice(&header).map_err(OAuthError::decode)?;
    let claims = URL_SAFE_NO_PAD.decode(payload).map_err(OAuthError::decode)?;
    let claims: Claims = serde_json::from_slice(&claims).map_err(OAuthError::decode)?;
    Ok((header, claims))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jose::jwt::RegisteredClaims;
    use crate::utils::generate_dpop_key;

    #[test]
    fn sign_and_verify() {
        let key = generate_dpop_key();
        let sk = signing_key(&key).unwrap();
        let claims = Claims::from(RegisteredClaims {
            iss: Some("me".into()),
            ..Default::default()
        });
        let jwt = create_signed_jwt(&sk, &Header::es256().with_typ("jwt"), &claims).unwrap();

        let (header, decoded) = verify_signed_jwt(&jwt, sk.verifying_key()).unwrap();
        assert_eq!(header.typ.as_deref(), Some("jwt"));
        assert_eq!(decoded, claims);

        let other = signing_key(&generate_dpop_key()).unwrap();
        assert!(verify_signed_jwt(&jwt, other.verifying_key()).is_err());
    }

    #[test]
    fn public_jwk_strips_private_part() {
        let key = generate_dpop_key();
        let public = public_jwk(&key).unwrap();
        let v = serde_json::to_value(&public).unwrap();
        assert!(v.get("d").is_none());
        assert_eq!(v["crv"], "P-256");
        assert!(signing_key(&public).is_err());
    }
}
