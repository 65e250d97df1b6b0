//! Transfer and header encodings (RFC 2045, RFC 2047).

use base64::Engine;
use base64::engine::general_purpose::STANDARD;

use crate::error::{Error, Result};

/// Line length for base64 bodies.
const BASE64_LINE: usize = 76;

/// Encodes bytes as base64 wrapped at 76 columns with CRLF.
#[must_use]
pub fn encode_base64_lines(data: &[u8]) -> String {
    let encoded = STANDARD.encode(data);
    let mut out = String::with_capacity(encoded.len() + encoded.len() / BASE64_LINE * 2 + 2);
    for chunk in encoded.as_bytes().chunks(BASE64_LINE) {
        out.push_str(&String::from_utf8_lossy(chunk));
        out.push_str("\r\n");
    }
    out
}

/// Decodes base64, ignoring line breaks and other whitespace.
///
/// # Errors
///
/// Returns an error if the input is not valid base64.
pub fn decode_base64(data: &[u8]) -> Result<Vec<u8>> {
    let cleaned: Vec<u8> = data
        .iter()
        .copied()
        .filter(|b| !b.is_ascii_whitespace())
        .collect();
    Ok(STANDARD.decode(cleaned)?)
}

/// Decodes quoted-printable data.
///
/// Soft line breaks are removed. Malformed escapes are kept literally, the
/// way most mail readers handle them.
#[must_use]
pub fn decode_quoted_printable(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut i = 0;

    while i < data.len() {
        if data[i] != b'=' {
            out.push(data[i]);
            i += 1;
            continue;
        }

        match data.get(i + 1..i + 3) {
            Some(b"\r\n") => i += 3,
            Some([b'\n', ..]) => i += 2,
            Some([hi, lo]) => match (hex_value(*hi), hex_value(*lo)) {
                (Some(h), Some(l)) => {
                    out.push((h << 4) | l);
                    i += 3;
                }
                _ => {
                    out.push(b'=');
                    i += 1;
                }
            },
            _ => {
                // Trailing "=" or "=\n" at the very end.
                if data.get(i + 1) == Some(&b'\n') {
                    i += 2;
                } else {
                    out.push(b'=');
                    i += 1;
                }
            }
        }
    }

    out
}

const fn hex_value(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'A'..=b'F' => Some(b - b'A' + 10),
        b'a'..=b'f' => Some(b - b'a' + 10),
        _ => None,
    }
}

/// Converts bytes in the named charset to a `String`.
///
/// UTF-8 and US-ASCII decode lossily; ISO-8859-1 and Windows-1252 map each
/// byte to the code point of the same value. Unknown charsets fall back to
/// lossy UTF-8.
#[must_use]
pub fn decode_charset(data: &[u8], charset: Option<&str>) -> String {
    let charset = charset.unwrap_or("utf-8").to_ascii_lowercase();
    match charset.as_str() {
        "iso-8859-1" | "latin1" | "latin-1" | "windows-1252" | "cp1252" => {
            data.iter().map(|&b| char::from(b)).collect()
        }
        _ => String::from_utf8_lossy(data).into_owned(),
    }
}

/// Longest encoded-word RFC 2047 allows.
const MAX_ENCODED_WORD: usize = 75;

/// UTF-8 bytes that fit in one `=?utf-8?B?...?=` word.
const ENCODED_WORD_BYTES: usize = (MAX_ENCODED_WORD - "=?utf-8?B?".len() - "?=".len()) / 4 * 3;

/// Encodes a header value as RFC 2047 `B` encoded-words when it contains
/// anything beyond printable ASCII.
///
/// Long values are split into several words, never inside a character, and
/// folded onto continuation lines.
#[must_use]
pub fn encode_header_value(text: &str) -> String {
    let plain = !text.contains("=?") && text.chars().all(|c| c.is_ascii() && !c.is_ascii_control());
    if plain {
        return text.to_string();
    }

    let mut words = Vec::new();
    let mut start = 0;
    while start < text.len() {
        let mut end = (start + ENCODED_WORD_BYTES).min(text.len());
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        words.push(format!("=?utf-8?B?{}?=", STANDARD.encode(&text.as_bytes()[start..end])));
        start = end;
    }
    words.join("\r\n ")
}

/// Decodes every RFC 2047 encoded-word in a header value.
///
/// Whitespace between adjacent encoded-words is dropped as the RFC requires.
/// Words that fail to decode are left as they are.
#[must_use]
pub fn decode_header_value(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    let mut last_was_word = false;

    while let Some(start) = rest.find("=?") {
        let (before, candidate) = rest.split_at(start);
        let decoded = parse_encoded_word(candidate);

        match decoded {
            Some((word, consumed)) => {
                if !(last_was_word && before.trim().is_empty()) {
                    out.push_str(before);
                }
                out.push_str(&word);
                rest = &candidate[consumed..];
                last_was_word = true;
            }
            None => {
                out.push_str(before);
                out.push_str("=?");
                rest = &candidate[2..];
                last_was_word = false;
            }
        }
    }

    out.push_str(rest);
    out
}

/// Parses `=?charset?enc?text?=` at the start of `input`, returning the
/// decoded text and the number of bytes consumed.
fn parse_encoded_word(input: &str) -> Option<(String, usize)> {
    let body = input.strip_prefix("=?")?;
    let (charset, body) = body.split_once('?')?;
    let (encoding, body) = body.split_once('?')?;
    let end = body.find("?=")?;
    let payload = &body[..end];
    if payload.contains(char::is_whitespace) {
        return None;
    }

    // RFC 2231 language suffix: charset*lang
    let label = charset.split('*').next().unwrap_or(charset);
    let bytes = match encoding.to_ascii_uppercase().as_str() {
        "B" => decode_base64(payload.as_bytes()).ok()?,
        "Q" => decode_quoted_printable(payload.replace('_', " ").as_bytes()),
        _ => return None,
    };

    let consumed = input.len() - body.len() + end + 2;
    Some((decode_charset(&bytes, Some(label)), consumed))
}

/// Rejects header values that would inject additional header lines.
///
/// # Errors
///
/// Returns [`Error::InvalidHeader`] if the value contains CR or LF.
pub fn check_header_value(name: &'static str, value: &str) -> Result<()> {
    if value.contains(['\r', '\n']) {
        return Err(Error::InvalidHeader {
            name,
            reason: "contains a line break".to_string(),
        });
    }
    Ok(())
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
    use proptest::prelude::*;

    #[test]
    fn base64_lines_wrap() {
        let encoded = encode_base64_lines(&[b'x'; 100]);
        let lines: Vec<&str> = encoded.split("\r\n").filter(|l| !l.is_empty()).collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].len(), 76);
        assert_eq!(decode_base64(encoded.as_bytes()).unwrap(), vec![b'x'; 100]);
    }

    #[test]
    fn base64_invalid() {
        assert!(decode_base64(b"@@@@").is_err());
    }

    #[test]
    fn quoted_printable() {
        assert_eq!(decode_quoted_printable(b"H=C3=A9llo"), "Héllo".as_bytes());
        assert_eq!(decode_quoted_printable(b"soft=\r\nbreak"), b"softbreak");
        assert_eq!(decode_quoted_printable(b"soft=\nbreak"), b"softbreak");
        assert_eq!(decode_quoted_printable(b"a=ZZb"), b"a=ZZb");
        assert_eq!(decode_quoted_printable(b"end="), b"end=");
    }

    #[test]
    fn latin1_charset() {
        assert_eq!(decode_charset(&[0x63, 0x61, 0x66, 0xe9], Some("ISO-8859-1")), "café");
        assert_eq!(decode_charset("café".as_bytes(), None), "café");
    }

    #[test]
    fn header_encoding() {
        assert_eq!(encode_header_value("Weekly digest"), "Weekly digest");
        assert_eq!(encode_header_value("Grüße"), "=?utf-8?B?R3LDvMOfZQ==?=");
    }

    #[test]
    fn long_header_splits_into_folded_words() {
        let subject = "Überweisung für März, bitte prüfen ".repeat(8);
        let encoded = encode_header_value(&subject);

        let lines: Vec<&str> = encoded.split("\r\n").collect();
        assert!(lines.len() > 1);
        for (i, line) in lines.iter().enumerate() {
            let word = if i == 0 { *line } else { line.strip_prefix(' ').unwrap() };
            assert!(word.len() <= MAX_ENCODED_WORD, "{word}");
            assert!(word.starts_with("=?utf-8?B?") && word.ends_with("?="));
            assert!(parse_encoded_word(word).is_some());
        }
        assert_eq!(decode_header_value(&encoded), subject);
    }

    #[test]
    fn header_decoding() {
        assert_eq!(decode_header_value("=?utf-8?B?R3LDvMOfZQ==?="), "Grüße");
        assert_eq!(decode_header_value("=?UTF-8?Q?caf=C3=A9_time?="), "café time");
        assert_eq!(
            decode_header_value("Re: =?utf-8?Q?a?= =?utf-8?Q?b?= end"),
            "Re: ab end"
        );
        assert_eq!(decode_header_value("no words here"), "no words here");
        assert_eq!(decode_header_value("broken =?utf-8?X?abc?="), "broken =?utf-8?X?abc?=");
        assert_eq!(decode_header_value("=?iso-8859-1?Q?caf=E9?="), "café");
    }

    #[test]
    fn header_injection_rejected() {
        assert!(check_header_value("Subject", "hi\r\nBcc: x@y.z").is_err());
        assert!(check_header_value("Subject", "hi").is_ok());
    }

    proptest! {
        #[test]
        fn encoded_headers_decode_back(text in "\\PC{0,40}") {
            let encoded = encode_header_value(&text);
            prop_assert_eq!(decode_header_value(&encoded), text);
        }
    }
}
