use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::AtStrError;
use super::did::{Did, is_valid_did};
use super::handle::{Handle, is_valid_handle};

/// Either a DID or a handle.
///
/// The two grammars are disjoint: a DID always contains `:` which a handle never does.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AtIdentifier {
    Did(Did),
    Handle(Handle),
}

impl AtIdentifier {
    /// Parse a handle or DID, failing if neither grammar matches.
    pub fn new(ident: &str) -> Result<Self, AtStrError> {
        if is_valid_did(ident) {
            Did::new(ident).map(Self::Did)
        } else if let Ok(handle) = Handle::new(ident) {
            Ok(Self::Handle(handle))
        } else {
            Err(AtStrError::invalid("at-identifier", ident))
        }
    }

    /// Whether `s` parses as either grammar.
    pub fn is_valid(s: &str) -> bool {
        is_valid_did(s) || is_valid_handle(s.strip_prefix('@').unwrap_or(s))
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Did(did) => did.as_str(),
            Self::Handle(handle) => handle.as_str(),
        }
    }
}

impl FromStr for AtIdentifier {
    type Err = AtStrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl From<Did> for AtIdentifier {
    fn from(did: Did) -> Self {
        Self::Did(did)
    }
}

impl From<Handle> for AtIdentifier {
    fn from(handle: Handle) -> Self {
        Self::Handle(handle)
    }
}

impl fmt::Display for AtIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
