//! SSRF guard for outbound URLs.
//!
//! Every URL that came from a user or a remote document is checked here before
//! any DNS lookup or connect. This is a partial mitigation; the HTTP client
//! still has to refuse redirects (see [`crate::http_client::hardened_client`]).

use url::Url;

/// Top-level labels that never resolve to public hosts.
const RESERVED_TLDS: [&str; 4] = ["local", "arpa", "internal", "localhost"];

/// Reasons a URL is refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, miette::Diagnostic)]
pub enum UrlGuardError {
    #[error("unparseable URL: {0}")]
    #[diagnostic(code(skylink_common::url_guard::parse))]
    Parse(#[from] url::ParseError),
    #[error("scheme must be https, got {0:?}")]
    #[diagnostic(code(skylink_common::url_guard::scheme))]
    NotHttps(String),
    #[error("URL has no host")]
    #[diagnostic(code(skylink_common::url_guard::host))]
    MissingHost,
    #[error("URL authority carries userinfo or a port")]
    #[diagnostic(
        code(skylink_common::url_guard::authority),
        help("only bare hostnames are accepted")
    )]
    AuthorityMismatch,
    #[error("host needs at least two labels")]
    #[diagnostic(code(skylink_common::url_guard::labels))]
    TooFewLabels,
    #[error("reserved top-level label {0:?}")]
    #[diagnostic(code(skylink_common::url_guard::reserved_tld))]
    ReservedTld(String),
    #[error("numeric top-level label {0:?}")]
    #[diagnostic(
        code(skylink_common::url_guard::numeric_tld),
        help("IP literals are not accepted")
    )]
    NumericTld(String),
}

/// The raw authority section of `raw`, between `://` and the first of `/?#`.
fn raw_authority(raw: &str) -> Option<&str> {
    let rest = raw.split_once("://")?.1;
    let end = rest.find(['/', '?', '#']).unwrap_or(rest.len());
    Some(&rest[..end])
}

/// Parse `raw` and accept it only if it is safe to dial.
pub fn ensure_safe_url(raw: &str) -> Result<Url, UrlGuardError> {
    let url = Url::parse(raw)?;
    if let Err(e) = check_url(raw, &url) {
        #[cfg(feature = "tracing")]
        tracing::debug!(url = raw, error = %e, "refusing outbound url");
        return Err(e);
    }
    Ok(url)
}

/// Check an already-parsed URL.
pub fn ensure_safe(url: &Url) -> Result<(), UrlGuardError> {
    let checked = check_url(url.as_str(), url);
    #[cfg(feature = "tracing")]
    if let Err(e) = &checked {
        tracing::debug!(url = %url, error = %e, "refusing outbound url");
    }
    checked
}

/// Boolean form of [`ensure_safe_url`].
pub fn is_safe_url(raw: &str) -> bool {
    ensure_safe_url(raw).is_ok()
}

fn check_url(raw: &str, url: &Url) -> Result<(), UrlGuardError> {
    if url.scheme() != "https" {
        return Err(UrlGuardError::NotHttps(url.scheme().to_owned()));
    }
    let host = match url.host_str() {
        Some(h) if !h.is_empty() => h,
        _ => return Err(UrlGuardError::MissingHost),
    };
    // `Url` drops default ports and keeps userinfo out of `host_str`, so compare
    // against what was actually written.
    let authority = raw_authority(raw).ok_or(UrlGuardError::MissingHost)?;
    if !authority.eq_ignore_ascii_case(host)
        || !url.username().is_empty()
        || url.password().is_some()
        || url.port().is_some()
    {
        return Err(UrlGuardError::AuthorityMismatch);
    }

    let labels: Vec<&str> = host.split('.').collect();
    if labels.len() < 2 {
        return Err(UrlGuardError::TooFewLabels);
    }
    let tld = labels[labels.len() - 1];
    if RESERVED_TLDS.contains(&tld) {
        return Err(UrlGuardError::ReservedTld(tld.to_owned()));
    }
    if tld.chars().all(|c| c.is_ascii_digit()) {
        return Err(UrlGuardError::NumericTld(tld.to_owned()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_public_https() {
        assert!(is_safe_url("https://bsky.social"));
        assert!(is_safe_url("https://pds.example.com/xrpc/foo?x=1"));
        assert!(is_safe_url("https://Entryway.Example.com/"));
    }

    #[test]
    fn rejects_scheme() {
        assert_eq!(
            ensure_safe_url("http://pds.example.com"),
            Err(UrlGuardError::NotHttps("http".into()))
        );
        assert!(!is_safe_url("ftp://pds.example.com"));
    }

    #[test]
    fn rejects_userinfo_and_ports() {
        assert_eq!(
            ensure_safe_url("https://user@pds.example.com"),
            Err(UrlGuardError::AuthorityMismatch)
        );
        assert_eq!(
            ensure_safe_url("https://user:pw@pds.example.com"),
            Err(UrlGuardError::AuthorityMismatch)
        );
        assert_eq!(
            ensure_safe_url("https://pds.example.com:8443"),
            Err(UrlGuardError::AuthorityMismatch)
        );
        assert_eq!(
            ensure_safe_url("https://pds.example.com:443"),
            Err(UrlGuardError::AuthorityMismatch)
        );
    }

    #[test]
    fn rejects_single_label_and_reserved() {
        assert_eq!(
            ensure_safe_url("https://localhost"),
            Err(UrlGuardError::TooFewLabels)
        );
        assert_eq!(
            ensure_safe_url("https://printer.local"),
            Err(UrlGuardError::ReservedTld("local".into()))
        );
        assert!(!is_safe_url("https://1.0.0.127.in-addr.arpa"));
        assert!(!is_safe_url("https://metadata.internal"));
        assert!(!is_safe_url("https://app.localhost"));
    }

    #[test]
    fn rejects_ip_literals() {
        assert_eq!(
            ensure_safe_url("https://127.0.0.1"),
            Err(UrlGuardError::NumericTld("1".into()))
        );
        assert!(!is_safe_url("https://169.254.169.254/latest"));
        assert!(!is_safe_url("https://[::1]/"));
    }
}
