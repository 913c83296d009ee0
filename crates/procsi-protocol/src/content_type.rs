//! Content-type classification for captured bodies.
//!
//! Comparison is case-insensitive and ignores parameters after `;`.
//! A missing or unknown content type classifies as text for search purposes
//! (binary detection errs toward searchability).

/// Exact non-`text/*` types treated as text.
const TEXT_TYPES: [&str; 8] = [
    "application/json",
    "application/xml",
    "application/javascript",
    "application/x-javascript",
    "application/xhtml+xml",
    "application/ld+json",
    "application/manifest+json",
    "application/x-www-form-urlencoded",
];

const TEXT_SUFFIXES: [&str; 4] = ["+json", "+xml", "+html", "+text"];

const JSON_TYPES: [&str; 3] = [
    "application/json",
    "application/ld+json",
    "application/manifest+json",
];

/// The essence of a content-type header value: lowercased, parameters
/// stripped, surrounding whitespace removed.
pub fn essence(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase()
}

/// Whether a body with this content type is searchable text.
pub fn is_text(content_type: Option<&str>) -> bool {
    let Some(raw) = content_type else {
        return true;
    };
    let essence = essence(raw);
    if essence.is_empty() || essence.starts_with("text/") {
        return true;
    }
    if TEXT_TYPES.contains(&essence.as_str()) {
        return true;
    }
    if TEXT_SUFFIXES.iter().any(|s| essence.ends_with(s)) {
        return true;
    }
    // Unknown top-level types with no structured suffix: text only when the
    // type is not a known binary family.
    !(essence.starts_with("image/")
        || essence.starts_with("audio/")
        || essence.starts_with("video/")
        || essence.starts_with("font/")
        || essence.starts_with("application/"))
}

/// Whether a body with this content type carries JSON.
pub fn is_json(content_type: Option<&str>) -> bool {
    let Some(raw) = content_type else {
        return false;
    };
    let essence = essence(raw);
    JSON_TYPES.contains(&essence.as_str()) || essence.ends_with("+json")
}
