use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use elliptic_curve::SecretKey;
use jose_jwk::{Jwk, Key, Parameters, crypto};
use rand::{CryptoRng, RngCore, rngs::ThreadRng};
use sha2::{Digest, Sha256};
use smol_str::SmolStr;

/// A fresh P-256 private key, as used for DPoP.
pub fn generate_dpop_key() -> Key {
    Key::from(&crypto::Key::from(SecretKey::<p256::NistP256>::random(
        &mut ThreadRng::default(),
    )))
}

/// A fresh P-256 private JWK, e.g. for a client signing key.
pub fn generate_key(kid: Option<&str>) -> Jwk {
    Jwk {
        key: generate_dpop_key(),
        prm: Parameters {
            kid: kid.map(str::to_owned),
            ..Default::default()
        },
    }
}

pub fn get_random_values<R, const LEN: usize>(rng: &mut R) -> [u8; LEN]
where
    R: RngCore + CryptoRng,
{
    let mut bytes = [0u8; LEN];
    rng.fill_bytes(&mut bytes);
    bytes
}

/// 32 random bytes, base64url.
pub fn generate_state() -> SmolStr {
    URL_SAFE_NO_PAD
        .encode(get_random_values::<_, 32>(&mut ThreadRng::default()))
        .into()
}

/// 43 random bytes, base64url (58 characters).
pub fn generate_verifier() -> SmolStr {
    URL_SAFE_NO_PAD
        .encode(get_random_values::<_, 43>(&mut ThreadRng::default()))
        .into()
}

// https://datatracker.ietf.org/doc/html/rfc7636#section-4.2
pub fn pkce_challenge(verifier: &str) -> SmolStr {
    URL_SAFE_NO_PAD.encode(Sha256::digest(verifier)).into()
}

/// `(challenge, verifier)`
pub fn generate_pkce() -> (SmolStr, SmolStr) {
    let verifier = generate_verifier();
    (pkce_challenge(&verifier), verifier)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pkce_matches_rfc_vector() {
        // RFC 7636 appendix B
        assert_eq!(
            pkce_challenge("dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk"),
            "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM"
        );
    }

    #[test]
    fn generated_values_are_fresh_and_sized() {
        let (challenge, verifier) = generate_pkce();
        assert!(verifier.len() >= 43);
        assert_eq!(challenge, pkce_challenge(&verifier));
        assert_ne!(generate_state(), generate_state());
        assert_eq!(generate_state().len(), 43);
    }

    #[test]
    fn keys_are_p256_secrets() {
        let jwk = generate_key(Some("k1"));
        assert_eq!(jwk.prm.kid.as_deref(), Some("k1"));
        assert!(matches!(
            crypto::Key::try_from(&jwk.key).unwrap(),
            crypto::Key::P256(crypto::Kind::Secret(_))
        ));
        assert_ne!(
            serde_json::to_value(generate_dpop_key()).unwrap(),
            serde_json::to_value(generate_dpop_key()).unwrap()
        );
    }
}
