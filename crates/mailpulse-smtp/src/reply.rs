//! SMTP replies.

use crate::error::{Error, Result};

/// A complete (possibly multi-line) server reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// Three-digit reply code.
    pub code: u16,
    /// Text of each line, code and separator removed.
    pub lines: Vec<String>,
}

impl Reply {
    /// 2xx: the requested action completed.
    #[must_use]
    pub const fn is_positive(&self) -> bool {
        self.code >= 200 && self.code < 300
    }

    /// 3xx: the server waits for more input (DATA, AUTH challenges).
    #[must_use]
    pub const fn is_intermediate(&self) -> bool {
        self.code >= 300 && self.code < 400
    }

    /// All lines joined with spaces.
    #[must_use]
    pub fn text(&self) -> String {
        self.lines.join(" ")
    }

    /// Converts a non-positive reply into an error.
    pub(crate) fn into_error(self) -> Error {
        Error::Reply {
            code: self.code,
            message: self.text(),
        }
    }
}

/// True if `line` ends a reply (`250 ok` as opposed to `250-more`).
#[must_use]
pub fn is_last_line(line: &str) -> bool {
    line.len() == 3 || line.as_bytes().get(3) == Some(&b' ')
}

/// Assembles a reply from its raw lines (CRLF already stripped).
///
/// # Errors
///
/// Returns an error for empty input, bad codes, or lines whose codes differ.
pub fn parse_reply(lines: &[String]) -> Result<Reply> {
    let first = lines
        .first()
        .ok_or_else(|| Error::Protocol("empty reply".to_string()))?;
    let code = reply_code(first)?;

    let mut text = Vec::with_capacity(lines.len());
    for line in lines {
        if reply_code(line)? != code {
            return Err(Error::Protocol(format!(
                "reply code changed mid-reply: {line}"
            )));
        }
        text.push(line.get(4..).unwrap_or_default().to_string());
    }

    Ok(Reply { code, lines: text })
}

fn reply_code(line: &str) -> Result<u16> {
    line.get(..3)
        .filter(|c| c.bytes().all(|b| b.is_ascii_digit()))
        .and_then(|c| c.parse().ok())
        .ok_or_else(|| Error::Protocol(format!("malformed reply line: {line:?}")))
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

    fn lines(raw: &[&str]) -> Vec<String> {
        raw.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn single_line() {
        let reply = parse_reply(&lines(&["250 2.0.0 Ok: queued"])).unwrap();
        assert_eq!(reply.code, 250);
        assert_eq!(reply.text(), "2.0.0 Ok: queued");
        assert!(reply.is_positive());
    }

    #[test]
    fn multi_line_ehlo() {
        let reply = parse_reply(&lines(&[
            "250-mail.example.com",
            "250-AUTH PLAIN LOGIN",
            "250 STARTTLS",
        ]))
        .unwrap();
        assert_eq!(reply.lines, vec!["mail.example.com", "AUTH PLAIN LOGIN", "STARTTLS"]);
    }

    #[test]
    fn bare_code() {
        let reply = parse_reply(&lines(&["354"])).unwrap();
        assert!(reply.is_intermediate());
        assert_eq!(reply.lines, vec![""]);
    }

    #[test]
    fn last_line_detection() {
        assert!(is_last_line("250 OK"));
        assert!(is_last_line("221"));
        assert!(!is_last_line("250-PIPELINING"));
    }

    #[test]
    fn malformed() {
        assert!(parse_reply(&[]).is_err());
        assert!(parse_reply(&lines(&["2x0 nope"])).is_err());
        assert!(parse_reply(&lines(&["250-a", "251 b"])).is_err());
    }

    #[test]
    fn error_classification() {
        let permanent = parse_reply(&lines(&["550 no such user"])).unwrap().into_error();
        assert!(permanent.is_permanent());
        let transient = parse_reply(&lines(&["421 try later"])).unwrap().into_error();
        assert!(transient.is_transient());
    }
}
