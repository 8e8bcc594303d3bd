//! OAuth 2.1 (AT Protocol profile) client engine for skylink.
//!
//! Resolves an account to its authorization server, runs the pushed
//! authorization request and token exchange with DPoP-bound tokens and
//! `private_key_jwt` client authentication, and executes authenticated XRPC
//! calls that recover from resource server nonce challenges.
//!
//! ```no_run
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! use skylink_common::RequestContext;
//! use skylink_identity::SkylinkResolver;
//! use skylink_identity::resolver::ResolverOptions;
//! use skylink_oauth::authstore::MemoryAuthStore;
//! use skylink_oauth::client::{AuthorizeOptions, OAuthClient};
//! use skylink_oauth::config::OAuthConfig;
//! use skylink_oauth::utils::generate_key;
//!
//! let config = OAuthConfig::new()
//!     .app_url(url::Url::parse("https://app.example.com")?)
//!     .client_key(generate_key(Some("key-1")))
//!     .build();
//! let resolver = SkylinkResolver::with_defaults(ResolverOptions::default(), &config.user_agent)?;
//! let client = OAuthClient::new(resolver, MemoryAuthStore::new(), config);
//!
//! let redirect = client
//!     .start_auth(&RequestContext::new(), "alice.bsky.social", AuthorizeOptions::default())
//!     .await?;
//! println!("send the browser to {}", redirect.url);
//! # Ok(())
//! # }
//! ```

pub mod authstore;
pub mod client;
pub mod config;
pub mod dpop;
pub mod error;
pub mod jose;
pub mod request;
pub mod resolver;
pub mod session;
pub mod types;
pub mod utils;
pub mod xrpc;

pub use client::{AuthorizationRedirect, AuthorizeOptions, OAuthClient};
pub use config::{ClientPlatform, OAuthConfig};
pub use error::{OAuthError, Result};
pub use session::{PendingAuthRequest, Session};
pub use xrpc::{ResponseSink, XrpcBody, XrpcClient};
