use jose_jwa::{Algorithm, Signing};
use jose_jwk::Jwk;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

/// Protected header of a compact JWS.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub alg: Algorithm,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub typ: Option<SmolStr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kid: Option<SmolStr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jwk: Option<Jwk>,
}

impl Header {
    pub fn es256() -> Self {
        Self::from(Algorithm::Signing(Signing::Es256))
    }

    pub fn with_typ(mut self, typ: &str) -> Self {
        self.typ = Some(SmolStr::new(typ));
        self
    }

    pub fn with_kid(mut self, kid: Option<&str>) -> Self {
        self.kid = kid.map(SmolStr::new);
        self
    }

    pub fn with_jwk(mut self, jwk: Jwk) -> Self {
        self.jwk = Some(jwk);
        self
    }
}

impl From<Algorithm> for Header {
    fn from(alg: Algorithm) -> Self {
        Self {
            alg,
            typ: None,
            kid: None,
            jwk: None,
        }
    }
}
