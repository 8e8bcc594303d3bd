//! Shared building blocks for skylink.
//!
//! - [`http_client::HttpClient`]: the seam every network call goes through,
//!   with a `reqwest` implementation behind the `reqwest-client` feature.
//! - [`types`]: validated `Did`, `Handle` and `AtIdentifier` strings.
//! - [`url_guard`]: the SSRF guard applied to every user- or server-supplied
//!   URL before it is dialed.
//! - [`session`]: a generic key/value session store with an in-memory backend.
//! - [`context`]: caller-supplied cancellation and deadlines.

pub mod context;
pub mod error;
pub mod http_client;
pub mod session;
pub mod types;
pub mod url_guard;

pub use context::{Interrupted, RequestContext};
pub use error::TransportError;
pub use http_client::HttpClient;
pub use types::{AtStrError, did::Did, handle::Handle, ident::AtIdentifier};
pub use url_guard::{UrlGuardError, ensure_safe_url, is_safe_url};

/// Boxed error used at trait boundaries where backends bring their own error types.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;
