//! Wire types for the OAuth endpoints and documents this client talks to.

mod client_metadata;
mod metadata;
mod request;
mod response;

pub use self::client_metadata::*;
pub use self::metadata::*;
pub use self::request::*;
pub use self::response::*;

#[cfg(test)]
pub(crate) use self::metadata::fixtures;
