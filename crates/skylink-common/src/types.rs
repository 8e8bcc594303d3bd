//! Validated identifier strings.

pub mod did;
pub mod handle;
pub mod ident;

use smol_str::SmolStr;

/// Maximum accepted identifier length.
pub const MAX_IDENTIFIER_LEN: usize = 2048;

/// Errors from validating identifier strings.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, miette::Diagnostic)]
pub enum AtStrError {
    /// Input exceeded the length limit
    #[error("{kind} too long: {len} > {max}")]
    #[diagnostic(code(skylink_common::types::too_long))]
    TooLong {
        kind: &'static str,
        max: usize,
        len: usize,
    },
    /// Input did not match the grammar
    #[error("invalid {kind}: {value:?}")]
    #[diagnostic(
        code(skylink_common::types::invalid),
        help("handles look like `alice.example.com`, DIDs like `did:plc:abc123`")
    )]
    Invalid { kind: &'static str, value: SmolStr },
}

impl AtStrError {
    pub(crate) fn too_long(kind: &'static str, len: usize) -> Self {
        Self::TooLong {
            kind,
            max: MAX_IDENTIFIER_LEN,
            len,
        }
    }

    pub(crate) fn invalid(kind: &'static str, value: &str) -> Self {
        Self::Invalid {
            kind,
            value: SmolStr::new(value),
        }
    }
}
