//! Turns user-typed addresses into navigable http(s) URLs.

use url::Url;

use crate::error::AddressError;

const BLOCKED_SCHEMES: [&str; 3] = ["file", "javascript", "data"];

/// Normalize a candidate address.
///
/// Bare domains (`zillow.com`, `www.example.com`) get an `https://` prefix.
/// `file:`, `javascript:` and `data:` are rejected outright, and anything that
/// does not end up as an http or https URL with a host is an error.
pub fn normalize(input: &str) -> Result<String, AddressError> {
    let candidate = input.trim();
    if candidate.is_empty() {
        return Err(AddressError::Empty);
    }

    if let Some(scheme) = explicit_scheme(candidate) {
        if BLOCKED_SCHEMES.contains(&scheme.as_str()) {
            return Err(AddressError::BlockedScheme(scheme));
        }
    }

    let absolute = if candidate.contains("://") {
        candidate.to_string()
    } else if looks_like_domain(candidate) {
        format!("https://{candidate}")
    } else if let Some(scheme) = explicit_scheme(candidate) {
        return Err(AddressError::UnsupportedScheme(scheme));
    } else {
        return Err(AddressError::NotAnAddress(candidate.to_string()));
    };

    let url = Url::parse(&absolute).map_err(|e| AddressError::Invalid {
        input: candidate.to_string(),
        reason: e.to_string(),
    })?;

    match url.scheme() {
        "http" | "https" => {}
        other => return Err(AddressError::UnsupportedScheme(other.to_string())),
    }
    if url.host_str().is_none_or(str::is_empty) {
        return Err(AddressError::Invalid {
            input: candidate.to_string(),
            reason: "missing host".to_string(),
        });
    }

    Ok(url.to_string())
}

/// The lowercased scheme when `s` starts with `scheme:`.
fn explicit_scheme(s: &str) -> Option<String> {
    let (scheme, _) = s.split_once(':')?;
    let mut chars = scheme.chars();
    let first = chars.next()?;
    if !first.is_ascii_alphabetic() {
        return None;
    }
    if !chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.')) {
        return None;
    }
    // `zillow.com:8080` is a host and port, not a scheme.
    if scheme.contains('.') {
        return None;
    }
    Some(scheme.to_ascii_lowercase())
}

fn looks_like_domain(s: &str) -> bool {
    if s.chars().any(char::is_whitespace) {
        return false;
    }
    s.starts_with("www.") || s.contains('.')
}
