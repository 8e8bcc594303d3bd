use std::fmt;
use std::sync::LazyLock;
use std::{ops::Deref, str::FromStr};

use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, de::Error};
use smol_str::SmolStr;

use super::{AtStrError, MAX_IDENTIFIER_LEN};

/// A decentralized identifier, `did:<method>:<id>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct Did(SmolStr);

/// Regex for DID validation.
///
/// Allows `%` inside the identifier but not as the final character, and does not
/// check that percent-escapes are well formed.
pub static DID_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^did:[a-z]+:[a-zA-Z0-9._:%-]*[a-zA-Z0-9._-]$").expect("valid DID regex")
});

/// Whether `s` matches the DID grammar.
pub fn is_valid_did(s: &str) -> bool {
    s.len() <= MAX_IDENTIFIER_LEN && DID_REGEX.is_match(s)
}

impl Did {
    /// Fallible constructor, validates.
    pub fn new(did: &str) -> Result<Self, AtStrError> {
        if did.len() > MAX_IDENTIFIER_LEN {
            Err(AtStrError::too_long("did", did.len()))
        } else if !DID_REGEX.is_match(did) {
            Err(AtStrError::invalid("did", did))
        } else {
            Ok(Self(SmolStr::new(did)))
        }
    }

    /// Validating constructor for `'static` literals.
    pub fn new_static(did: &'static str) -> Result<Self, AtStrError> {
        if did.len() > MAX_IDENTIFIER_LEN {
            Err(AtStrError::too_long("did", did.len()))
        } else if !DID_REGEX.is_match(did) {
            Err(AtStrError::invalid("did", did))
        } else {
            Ok(Self(SmolStr::new_static(did)))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The method segment, e.g. `plc` for `did:plc:abc`.
    pub fn method(&self) -> &str {
        self.0.split(':').nth(1).unwrap_or_default()
    }
}

impl FromStr for Did {
    type Err = AtStrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl<'de> Deserialize<'de> for Did {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value: SmolStr = Deserialize::deserialize(deserializer)?;
        Self::new(&value).map_err(D::Error::custom)
    }
}

impl fmt::Display for Did {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<Did> for SmolStr {
    fn from(value: Did) -> Self {
        value.0
    }
}

impl From<Did> for String {
    fn from(value: Did) -> Self {
        value.0.to_string()
    }
}

impl AsRef<str> for Did {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl Deref for Did {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        self.as_str()
    }
}
