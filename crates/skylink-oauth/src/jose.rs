//! Minimal JWS/JWT support: ES256 compact serialization only.

pub mod jws;
pub mod jwt;
pub mod signing;

pub use self::jws::Header;
pub use self::jwt::Claims;
pub use self::signing::{create_signed_jwt, public_jwk, signing_key, verify_signed_jwt};
