//! Client configuration.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use bon::Builder;
use jose_jwk::Jwk;
use serde::{Deserialize, Serialize};
use skylink_common::http_client::DEFAULT_TIMEOUT;
use smol_str::{SmolStr, format_smolstr};
use url::Url;

/// Scope requested when the caller does not ask for one.
pub const DEFAULT_SCOPE: &str = "atproto transition:generic";

pub const DEFAULT_USER_AGENT: &str = concat!("skylink/", env!("CARGO_PKG_VERSION"));

/// Which client registration a login goes through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientPlatform {
    #[default]
    Web,
    Ios,
    Android,
}

impl ClientPlatform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Web => "web",
            Self::Ios => "ios",
            Self::Android => "android",
        }
    }
}

impl fmt::Display for ClientPlatform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, miette::Diagnostic)]
#[error("unknown client platform {0:?}")]
#[diagnostic(code(skylink_oauth::platform), help("expected one of: web, ios, android"))]
pub struct UnknownPlatform(pub SmolStr);

impl FromStr for ClientPlatform {
    type Err = UnknownPlatform;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "web" => Ok(Self::Web),
            "ios" => Ok(Self::Ios),
            "android" => Ok(Self::Android),
            other => Err(UnknownPlatform(SmolStr::new(other))),
        }
    }
}

/// Settings for an [`crate::client::OAuthClient`].
///
/// `client_key` is the private P-256 JWK that signs client assertions; its
/// public half is what [`OAuthConfig::jwks_uri`] serves. Give it a `kid`.
#[derive(Clone, Builder, Serialize, Deserialize)]
#[builder(start_fn = new)]
pub struct OAuthConfig {
    /// Public base URL of the service, e.g. `https://app.example.com/`.
    pub app_url: Url,
    pub client_key: Jwk,
    #[builder(default = SmolStr::new_static("skylink"))]
    #[serde(default = "default_client_name")]
    pub client_name: SmolStr,
    #[builder(default = SmolStr::new_static(DEFAULT_SCOPE))]
    #[serde(default = "default_scope")]
    pub default_scope: SmolStr,
    #[builder(default = SmolStr::new_static(DEFAULT_USER_AGENT))]
    #[serde(default = "default_user_agent")]
    pub user_agent: SmolStr,
    /// Per-attempt limit on every outbound request.
    #[builder(default = DEFAULT_TIMEOUT)]
    #[serde(default = "default_timeout")]
    pub timeout: Duration,
}

fn default_client_name() -> SmolStr {
    SmolStr::new_static("skylink")
}

fn default_scope() -> SmolStr {
    SmolStr::new_static(DEFAULT_SCOPE)
}

fn default_user_agent() -> SmolStr {
    SmolStr::new_static(DEFAULT_USER_AGENT)
}

fn default_timeout() -> Duration {
    DEFAULT_TIMEOUT
}

impl fmt::Debug for OAuthConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OAuthConfig")
            .field("app_url", &self.app_url.as_str())
            .field("client_key_id", &self.client_key.prm.kid)
            .field("client_name", &self.client_name)
            .field("default_scope", &self.default_scope)
            .field("user_agent", &self.user_agent)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl OAuthConfig {
    /// `app_url` without its trailing slash.
    pub(crate) fn app_base(&self) -> &str {
        self.app_url.as_str().trim_end_matches('/')
    }

    /// Development servers on localhost cannot host a metadata document, so
    /// they use the loopback client id form instead.
    pub fn is_loopback(&self) -> bool {
        matches!(
            self.app_url.host_str(),
            Some("localhost" | "127.0.0.1" | "[::1]")
        )
    }

    pub fn client_id(&self, platform: ClientPlatform) -> SmolStr {
        if self.is_loopback() {
            let query = serde_html_form::to_string(&[
                ("scope", self.default_scope.as_str()),
                ("redirect_uri", self.redirect_uri(platform).as_str()),
            ])
            .unwrap_or_default();
            return format_smolstr!("http://localhost/?{query}");
        }
        format_smolstr!(
            "{}/api/oauth/{platform}/client-metadata.json",
            self.app_base()
        )
    }

    pub fn redirect_uri(&self, platform: ClientPlatform) -> SmolStr {
        match platform {
            ClientPlatform::Web => format_smolstr!("{}/api/oauth/callback", self.app_base()),
            _ => format_smolstr!("{}/api/oauth/{platform}/callback", self.app_base()),
        }
    }

    pub fn jwks_uri(&self) -> SmolStr {
        format_smolstr!("{}/api/oauth/jwks.json", self.app_base())
    }
}
