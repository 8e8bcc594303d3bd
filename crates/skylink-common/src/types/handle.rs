use std::fmt;
use std::sync::LazyLock;
use std::{ops::Deref, str::FromStr};

use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, de::Error};
use smol_str::{SmolStr, StrExt};

use super::{AtStrError, MAX_IDENTIFIER_LEN};

/// A DNS-like account handle such as `alice.example.com`.
///
/// Handles are case-insensitive and stored lowercased.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct Handle(SmolStr);

pub static HANDLE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([a-zA-Z0-9]([a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?\.)+[a-zA-Z]([a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?$")
        .expect("valid handle regex")
});

/// Whether `s` matches the handle grammar.
pub fn is_valid_handle(s: &str) -> bool {
    s.len() <= MAX_IDENTIFIER_LEN && HANDLE_REGEX.is_match(s)
}

impl Handle {
    /// Fallible constructor, validates.
    ///
    /// Accepts (and strips) a preceding '@' if present
    pub fn new(handle: &str) -> Result<Self, AtStrError> {
        let handle = handle.strip_prefix('@').unwrap_or(handle);
        if handle.len() > MAX_IDENTIFIER_LEN {
            Err(AtStrError::too_long("handle", handle.len()))
        } else if !HANDLE_REGEX.is_match(handle) {
            Err(AtStrError::invalid("handle", handle))
        } else {
            Ok(Self(handle.to_lowercase_smolstr()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for Handle {
    type Err = AtStrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl<'de> Deserialize<'de> for Handle {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value: SmolStr = Deserialize::deserialize(deserializer)?;
        Self::new(&value).map_err(D::Error::custom)
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<Handle> for SmolStr {
    fn from(value: Handle) -> Self {
        value.0
    }
}

impl AsRef<str> for Handle {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl Deref for Handle {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        self.as_str()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_handles() {
        for h in [
            "alice.example",
            "alice.bsky.social",
            "a.co",
            "xn--ls8h.test",
            "john-doe.example.org",
            "1password.com",
        ] {
            assert!(Handle::new(h).is_ok(), "{h} should be valid");
            assert!(is_valid_handle(h));
        }
    }

    #[test]
    fn invalid_handles() {
        for h in [
            "alice",
            "alice.",
            ".alice.example",
            "-alice.example",
            "alice-.example",
            "alice.1com",
            "alice..example",
            "alice_b.example",
            "did:plc:abc",
            "",
        ] {
            assert!(Handle::new(h).is_err(), "{h} should be invalid");
        }
    }

    #[test]
    fn strips_at_and_lowercases() {
        let h = Handle::new("@Alice.Example").unwrap();
        assert_eq!(h.as_str(), "alice.example");
    }

    #[test]
    fn label_length_limit() {
        let ok = format!("{}.example", "a".repeat(63));
        let bad = format!("{}.example", "a".repeat(64));
        assert!(Handle::new(&ok).is_ok());
        assert!(Handle::new(&bad).is_err());
    }
}
