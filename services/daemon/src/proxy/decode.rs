//! Body decoding for storage.
//!
//! Captured bodies are stored decoded; the bytes on the wire are never
//! touched. Decoding follows the `content-encoding` header (layered
//! encodings apply right-to-left). A decode failure falls back to the raw
//! bytes; capture must never break the proxied exchange.

use std::io::Read;
use tracing::warn;

/// Decode `body` per `content_encoding` (e.g. `gzip`, `br`, `gzip, br`).
/// Unknown or `identity` codings pass through.
pub fn decode_body(content_encoding: Option<&str>, body: &[u8]) -> Vec<u8> {
    let Some(encoding) = content_encoding else {
        return body.to_vec();
    };

    let mut current = body.to_vec();
    // Encodings were applied left-to-right, so decode right-to-left.
    for coding in encoding.split(',').rev() {
        let coding = coding.trim().to_ascii_lowercase();
        let decoded = match coding.as_str() {
            "" | "identity" => continue,
            "gzip" | "x-gzip" => decode_gzip(&current),
            "deflate" => decode_deflate(&current),
            "br" => decode_brotli(&current),
            other => {
                warn!(coding = other, "unknown content-encoding, storing raw bytes");
                return body.to_vec();
            }
        };
        match decoded {
            Some(bytes) => current = bytes,
            None => {
                warn!(coding = %coding, "body decode failed, storing raw bytes");
                return body.to_vec();
            }
        }
    }
    current
}

fn decode_gzip(body: &[u8]) -> Option<Vec<u8>> {
    let mut out = Vec::new();
    flate2::read::MultiGzDecoder::new(body)
        .read_to_end(&mut out)
        .ok()?;
    Some(out)
}

/// `deflate` on the wire is usually zlib-wrapped, but some servers send raw
/// deflate streams; try both.
fn decode_deflate(body: &[u8]) -> Option<Vec<u8>> {
    let mut out = Vec::new();
    if flate2::read::ZlibDecoder::new(body)
        .read_to_end(&mut out)
        .is_ok()
    {
        return Some(out);
    }
    out.clear();
    flate2::read::DeflateDecoder::new(body)
        .read_to_end(&mut out)
        .ok()?;
    Some(out)
}

fn decode_brotli(body: &[u8]) -> Option<Vec<u8>> {
    let mut out = Vec::new();
    brotli::Decompressor::new(body, 4096)
        .read_to_end(&mut out)
        .ok()?;
    Some(out)
}

/// Collapse repeated header names into one entry, joining values with `", "`.
/// Name case is preserved from the first occurrence.
pub fn flatten_headers(raw: &[(String, String)]) -> Vec<(String, String)> {
    let mut out: Vec<(String, String)> = Vec::with_capacity(raw.len());
    for (name, value) in raw {
        match out.iter_mut().find(|(n, _)| n.eq_ignore_ascii_case(name)) {
            Some(slot) => {
                slot.1.push_str(", ");
                slot.1.push_str(value);
            }
            None => out.push((name.clone(), value.clone())),
        }
    }
    out
}

/// Case-insensitive single-header lookup.
pub fn header_value<'h>(headers: &'h [(String, String)], name: &str) -> Option<&'h str> {
    headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// Remove every header named in `names` (case-insensitive), returning the
/// removed values keyed by their lowercased name.
pub fn strip_headers(
    headers: &mut Vec<(String, String)>,
    names: &[&str],
) -> Vec<(String, String)> {
    let mut removed = Vec::new();
    headers.retain(|(name, value)| {
        let strip = names.iter().any(|n| name.eq_ignore_ascii_case(n));
        if strip {
            removed.push((name.to_ascii_lowercase(), value.clone()));
        }
        !strip
    });
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut enc = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

    fn zlib(data: &[u8]) -> Vec<u8> {
        let mut enc = flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

    #[test]
    fn decodes_gzip() {
        let body = gzip(br#"{"ok":true}"#);
        assert_eq!(decode_body(Some("gzip"), &body), br#"{"ok":true}"#);
    }

    #[test]
    fn decodes_zlib_deflate() {
        let body = zlib(b"hello deflate");
        assert_eq!(decode_body(Some("deflate"), &body), b"hello deflate");
    }

    #[test]
    fn decodes_layered_encodings_right_to_left() {
        let body = zlib(&gzip(b"layered"));
        assert_eq!(decode_body(Some("gzip, deflate"), &body), b"layered");
    }

    #[test]
    fn identity_and_missing_pass_through() {
        assert_eq!(decode_body(None, b"raw"), b"raw");
        assert_eq!(decode_body(Some("identity"), b"raw"), b"raw");
    }

    #[test]
    fn corrupt_stream_falls_back_to_raw() {
        assert_eq!(decode_body(Some("gzip"), b"not gzip at all"), b"not gzip at all");
    }

    #[test]
    fn flatten_joins_duplicates_preserving_first_case() {
        let raw = vec![
            ("Set-Cookie".to_owned(), "a=1".to_owned()),
            ("set-cookie".to_owned(), "b=2".to_owned()),
            ("accept".to_owned(), "*/*".to_owned()),
        ];
        let flat = flatten_headers(&raw);
        assert_eq!(flat.len(), 2);
        assert_eq!(flat[0], ("Set-Cookie".to_owned(), "a=1, b=2".to_owned()));
    }

    #[test]
    fn strip_headers_removes_case_insensitively() {
        let mut headers = vec![
            ("X-Procsi-Internal-Session-Id".to_owned(), "s1".to_owned()),
            ("accept".to_owned(), "*/*".to_owned()),
        ];
        let removed = strip_headers(&mut headers, &["x-procsi-internal-session-id"]);
        assert_eq!(removed, vec![("x-procsi-internal-session-id".to_owned(), "s1".to_owned())]);
        assert_eq!(headers.len(), 1);
    }
}
