use crate::pool::Scheme;

/// Returns true for the statuses the redirect loop follows:
/// 301, 302, 303, 307 and 308.
#[must_use]
pub fn is_redirect_status(code: u16) -> bool {
    matches!(code, 301 | 302 | 303 | 307 | 308)
}

/// Resolve a `Location` header value against the scheme and authority of the
/// request that produced it.
///
/// Supports:
/// - Absolute-path reference (starts with '/') -> same scheme and authority
/// - Anything else -> used as an absolute URL, unchanged
///
/// Surrounding whitespace is trimmed. Parsing happens on the next hop, so an
/// unusable location surfaces there as `InvalidUrl`.
#[must_use]
pub fn resolve_location(scheme: Scheme, authority: &str, location: &str) -> String {
    let location = location.trim();
    if location.starts_with('/') {
        format!("{scheme}://{authority}{location}")
    } else {
        location.to_string()
    }
}
