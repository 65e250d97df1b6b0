//! Text body extraction from raw RFC 5322 messages.

use crate::encoding::{decode_base64, decode_charset, decode_quoted_printable};
use crate::error::{Error, Result};
use crate::header::{ContentType, Headers, split_entity};

/// Deepest multipart nesting that is walked.
pub const MAX_DEPTH: usize = 16;

/// Text alternatives found in a message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BodyParts {
    /// First inline `text/plain` part.
    pub text: Option<String>,
    /// First inline `text/html` part.
    pub html: Option<String>,
}

impl BodyParts {
    /// Whether neither a plain nor an HTML part was found.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.text.is_none() && self.html.is_none()
    }
}

/// Extracts the first plain-text and HTML bodies of a raw message.
///
/// Multipart containers are walked depth first. Parts marked as
/// attachments are skipped. Transfer encodings are decoded and the
/// declared charset applied.
///
/// # Errors
///
/// Returns an error when a multipart container has no boundary, nesting
/// exceeds [`MAX_DEPTH`], or a base64 part is corrupt.
pub fn extract_bodies(raw: &[u8]) -> Result<BodyParts> {
    let mut parts = BodyParts::default();
    walk(raw, 0, &mut parts)?;
    Ok(parts)
}

fn walk(entity: &[u8], depth: usize, found: &mut BodyParts) -> Result<()> {
    if depth > MAX_DEPTH {
        return Err(Error::TooDeep(MAX_DEPTH));
    }

    let (raw_headers, body) = split_entity(entity);
    let headers = Headers::parse(raw_headers);
    let content_type = headers
        .get("Content-Type")
        .map_or_else(ContentType::default_text, ContentType::parse);

    if content_type.is_multipart() {
        let boundary = content_type.param("boundary").ok_or(Error::MissingBoundary)?;
        for part in split_multipart(body, boundary) {
            walk(part, depth + 1, found)?;
            if found.text.is_some() && found.html.is_some() {
                break;
            }
        }
        return Ok(());
    }

    if is_attachment(&headers) {
        return Ok(());
    }

    let slot = match content_type.mime_type.as_str() {
        "text/plain" => &mut found.text,
        "text/html" => &mut found.html,
        _ => return Ok(()),
    };
    if slot.is_some() {
        return Ok(());
    }

    let bytes = decode_transfer(&headers, body)?;
    *slot = Some(decode_charset(&bytes, content_type.param("charset")));
    Ok(())
}

fn is_attachment(headers: &Headers) -> bool {
    headers
        .get("Content-Disposition")
        .and_then(|v| v.split(';').next())
        .is_some_and(|d| d.trim().eq_ignore_ascii_case("attachment"))
}

fn decode_transfer(headers: &Headers, body: &[u8]) -> Result<Vec<u8>> {
    let encoding = headers
        .get("Content-Transfer-Encoding")
        .unwrap_or("7bit")
        .trim()
        .to_ascii_lowercase();

    match encoding.as_str() {
        "base64" => decode_base64(body),
        "quoted-printable" => Ok(decode_quoted_printable(body)),
        _ => Ok(body.to_vec()),
    }
}

/// Splits a multipart body into its parts.
///
/// Delimiters must start a line. The preamble and epilogue are dropped, and
/// the line break before each delimiter belongs to the delimiter.
#[must_use]
pub fn split_multipart<'a>(body: &'a [u8], boundary: &str) -> Vec<&'a [u8]> {
    let delimiter = format!("--{boundary}");
    let delimiter = delimiter.as_bytes();

    let mut parts = Vec::new();
    let mut current: Option<usize> = None;
    let mut line_start = 0;

    while line_start < body.len() {
        let line_end = body[line_start..]
            .iter()
            .position(|&b| b == b'\n')
            .map_or(body.len(), |p| line_start + p + 1);
        let line = trim_eol(&body[line_start..line_end]);

        if let Some(rest) = line.strip_prefix(delimiter) {
            let rest = trim_trailing_space(rest);
            let closing = rest == b"--";
            if closing || rest.is_empty() {
                if let Some(start) = current.take() {
                    parts.push(strip_final_eol(&body[start..line_start]));
                }
                if closing {
                    return parts;
                }
                current = Some(line_end);
            }
        }

        line_start = line_end;
    }

    // Unterminated final part.
    if let Some(start) = current {
        parts.push(&body[start.min(body.len())..]);
    }
    parts
}

fn trim_eol(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

fn strip_final_eol(part: &[u8]) -> &[u8] {
    part.strip_suffix(b"\r\n")
        .or_else(|| part.strip_suffix(b"\n"))
        .unwrap_or(part)
}

fn trim_trailing_space(bytes: &[u8]) -> &[u8] {
    let end = bytes
        .iter()
        .rposition(|b| !matches!(b, b' ' | b'\t'))
        .map_or(0, |p| p + 1);
    &bytes[..end]
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
    fn simple_plain() {
        let parts = extract_bodies(b"Subject: hi\r\n\r\nHello there").unwrap();
        assert_eq!(parts.text.as_deref(), Some("Hello there"));
        assert!(parts.html.is_none());
    }

    #[test]
    fn html_only_quoted_printable() {
        let raw = b"Content-Type: text/html; charset=utf-8\r\n\
Content-Transfer-Encoding: quoted-printable\r\n\r\n\
<p>caf=C3=A9 =\r\nopen</p>";
        let parts = extract_bodies(raw).unwrap();
        assert!(parts.text.is_none());
        assert_eq!(parts.html.as_deref(), Some("<p>café open</p>"));
    }

    #[test]
    fn alternative_with_base64() {
        let raw = b"Content-Type: multipart/alternative; boundary=\"XX\"\r\n\r\n\
preamble\r\n\
--XX\r\n\
Content-Type: text/plain; charset=utf-8\r\n\
Content-Transfer-Encoding: base64\r\n\r\n\
SGVsbG8gd29ybGQ=\r\n\
--XX\r\n\
Content-Type: text/html\r\n\r\n\
<b>Hello</b>\r\n\
--XX--\r\n\
epilogue";
        let parts = extract_bodies(raw).unwrap();
        assert_eq!(parts.text.as_deref(), Some("Hello world"));
        assert_eq!(parts.html.as_deref(), Some("<b>Hello</b>"));
    }

    #[test]
    fn nested_mixed_skips_attachment() {
        let raw = b"Content-Type: multipart/mixed; boundary=outer\n\n\
--outer\n\
Content-Type: multipart/alternative; boundary=inner\n\n\
--inner\n\
Content-Type: text/html\n\n\
<i>inner html</i>\n\
--inner--\n\
--outer\n\
Content-Type: text/plain\n\
Content-Disposition: attachment; filename=notes.txt\n\n\
attached text\n\
--outer--\n";
        let parts = extract_bodies(raw).unwrap();
        assert!(parts.text.is_none());
        assert_eq!(parts.html.as_deref(), Some("<i>inner html</i>"));
    }

    #[test]
    fn missing_boundary_is_error() {
        let err = extract_bodies(b"Content-Type: multipart/mixed\r\n\r\nbody").unwrap_err();
        assert!(matches!(err, Error::MissingBoundary));
    }

    #[test]
    fn corrupt_base64_is_error() {
        let raw = b"Content-Transfer-Encoding: base64\r\n\r\n!!!";
        assert!(extract_bodies(raw).is_err());
    }

    #[test]
    fn boundary_prefix_inside_line_is_not_a_delimiter() {
        let body = b"--b\r\nline with --b inside\r\n--bogus\r\n--b--";
        let parts = split_multipart(body, "b");
        assert_eq!(parts, vec![&b"line with --b inside\r\n--bogus"[..]]);
    }

    #[test]
    fn unterminated_multipart_keeps_last_part() {
        let parts = split_multipart(b"--b\npart one\n--b\npart two", "b");
        assert_eq!(parts, vec![&b"part one"[..], &b"part two"[..]]);
    }
}
