//! Header block parsing.

use crate::encoding::decode_header_value;

/// An unfolded header block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    fields: Vec<(String, String)>,
}

impl Headers {
    /// Parses a raw header block, unfolding continuation lines.
    ///
    /// Lines without a colon are ignored.
    #[must_use]
    pub fn parse(raw: &[u8]) -> Self {
        let text = String::from_utf8_lossy(raw);
        let mut fields: Vec<(String, String)> = Vec::new();

        for line in text.lines() {
            if line.starts_with([' ', '\t']) {
                if let Some((_, value)) = fields.last_mut() {
                    value.push(' ');
                    value.push_str(line.trim());
                }
                continue;
            }
            if let Some((name, value)) = line.split_once(':') {
                fields.push((name.trim().to_string(), value.trim().to_string()));
            }
        }

        Self { fields }
    }

    /// Returns the first raw value for `name` (case-insensitive).
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Returns the first value for `name` with encoded-words decoded.
    #[must_use]
    pub fn get_decoded(&self, name: &str) -> Option<String> {
        self.get(name).map(decode_header_value)
    }

    /// Number of header fields.
    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Whether the block has no fields.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Splits a raw entity into its header block and body.
///
/// An entity with no blank line is treated as all headers.
#[must_use]
pub fn split_entity(raw: &[u8]) -> (&[u8], &[u8]) {
    if let Some(pos) = find(raw, b"\r\n\r\n") {
        return (&raw[..pos], &raw[pos + 4..]);
    }
    if let Some(pos) = find(raw, b"\n\n") {
        return (&raw[..pos], &raw[pos + 2..]);
    }
    (raw, &[])
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// A parsed `Content-Type` value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentType {
    /// Lowercased `type/subtype`.
    pub mime_type: String,
    params: Vec<(String, String)>,
}

impl ContentType {
    /// Parses a `Content-Type` header value.
    #[must_use]
    pub fn parse(value: &str) -> Self {
        let mut segments = split_params(value).into_iter();
        let mime_type = segments
            .next()
            .map(|s| s.trim().to_ascii_lowercase())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "text/plain".to_string());

        let params = segments
            .filter_map(|seg| {
                let (name, value) = seg.split_once('=')?;
                let value = value.trim();
                let value = value
                    .strip_prefix('"')
                    .and_then(|v| v.strip_suffix('"'))
                    .unwrap_or(value);
                Some((name.trim().to_ascii_lowercase(), value.replace("\\\"", "\"")))
            })
            .collect();

        Self { mime_type, params }
    }

    /// The RFC 2045 default, `text/plain; charset=us-ascii`.
    #[must_use]
    pub fn default_text() -> Self {
        Self {
            mime_type: "text/plain".to_string(),
            params: vec![("charset".to_string(), "us-ascii".to_string())],
        }
    }

    /// Looks up a parameter by name (case-insensitive).
    #[must_use]
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Whether this is any `multipart/*` type.
    #[must_use]
    pub fn is_multipart(&self) -> bool {
        self.mime_type.starts_with("multipart/")
    }
}

/// Splits on `;` outside quoted strings.
fn split_params(value: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut in_quotes = false;
    let mut escaped = false;
    let mut start = 0;

    for (i, c) in value.char_indices() {
        match c {
            _ if escaped => escaped = false,
            '\\' if in_quotes => escaped = true,
            '"' => in_quotes = !in_quotes,
            ';' if !in_quotes => {
                out.push(&value[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    out.push(&value[start..]);
    out
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::redundant_clone,
    clippy::manual_string_new,
    clippy::needless_collect,
    clippy::unreadable_literal,
    clippy::used_underscore_items,
    clippy::similar_names
)]
mod tests {
    use super::*;

    #[test]
    fn unfolds_continuations() {
        let headers = Headers::parse(b"Subject: a long\r\n  subject line\r\nFrom: x@y.z\r\n");
        assert_eq!(headers.get("subject"), Some("a long subject line"));
        assert_eq!(headers.get("FROM"), Some("x@y.z"));
        assert_eq!(headers.len(), 2);
    }

    #[test]
    fn decoded_header() {
        let headers = Headers::parse(b"Subject: =?utf-8?Q?caf=C3=A9?=\n");
        assert_eq!(headers.get_decoded("Subject").as_deref(), Some("café"));
        assert!(headers.get_decoded("To").is_none());
    }

    #[test]
    fn splits_crlf_and_lf() {
        assert_eq!(split_entity(b"A: 1\r\n\r\nbody"), (&b"A: 1"[..], &b"body"[..]));
        assert_eq!(split_entity(b"A: 1\n\nbody"), (&b"A: 1"[..], &b"body"[..]));
        assert_eq!(split_entity(b"A: 1"), (&b"A: 1"[..], &b""[..]));
    }

    #[test]
    fn content_type_params() {
        let ct = ContentType::parse("Multipart/Alternative; boundary=\"a;b\"; charset=UTF-8");
        assert_eq!(ct.mime_type, "multipart/alternative");
        assert_eq!(ct.param("boundary"), Some("a;b"));
        assert_eq!(ct.param("CHARSET"), Some("UTF-8"));
        assert!(ct.is_multipart());
    }

    #[test]
    fn content_type_empty() {
        let ct = ContentType::parse("");
        assert_eq!(ct.mime_type, "text/plain");
        assert!(ct.param("charset").is_none());
    }
}
