//! Response parsing.
//!
//! Only the response shapes mailbox inspection needs are classified:
//! status lines, CAPABILITY, SEARCH, EXISTS and FETCH. FETCH payloads are
//! parsed into a generic [`Value`] tree that the [`crate::fetch`] module
//! interprets.

use crate::{Error, Result};

/// Status of a tagged or untagged status response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Command completed successfully.
    Ok,
    /// Command failed.
    No,
    /// Command was malformed or not allowed.
    Bad,
    /// Connection is already authenticated (greeting only).
    PreAuth,
    /// Server is closing the connection.
    Bye,
}

impl Status {
    fn parse(word: &str) -> Option<Self> {
        match word.to_ascii_uppercase().as_str() {
            "OK" => Some(Self::Ok),
            "NO" => Some(Self::No),
            "BAD" => Some(Self::Bad),
            "PREAUTH" => Some(Self::PreAuth),
            "BYE" => Some(Self::Bye),
            _ => None,
        }
    }
}

/// A parsed server response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// Completion of a tagged command.
    Tagged {
        /// Command tag.
        tag: String,
        /// Completion status.
        status: Status,
        /// Human-readable text, response code included.
        text: String,
    },
    /// Untagged data (`* ...`).
    Untagged(Untagged),
    /// Continuation request (`+ ...`).
    Continuation(String),
}

/// Untagged responses understood by this client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Untagged {
    /// `* OK|NO|BAD|PREAUTH|BYE [code] text`
    Status {
        /// Status word.
        status: Status,
        /// Bracketed response code, without brackets.
        code: Option<String>,
        /// Trailing text.
        text: String,
    },
    /// `* CAPABILITY ...`
    Capability(Vec<String>),
    /// `* SEARCH n n n`
    Search(Vec<u32>),
    /// `* n EXISTS`
    Exists(u32),
    /// `* n FETCH (...)`
    Fetch {
        /// Message sequence number.
        seq: u32,
        /// Flattened `name value name value ...` attribute list.
        attributes: Vec<Value>,
    },
    /// Anything else, kept as text.
    Other(String),
}

/// A node of the generic IMAP data syntax.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// `NIL`
    Nil,
    /// Bare atom or number, e.g. `UID`, `\Seen`, `42`, `BODY[]`.
    Atom(String),
    /// Quoted string or literal contents.
    Str(Vec<u8>),
    /// Parenthesized list.
    List(Vec<Value>),
}

impl Value {
    /// Interprets an atom as a number.
    #[must_use]
    pub fn as_u32(&self) -> Option<u32> {
        match self {
            Self::Atom(a) => a.parse().ok(),
            _ => None,
        }
    }

    /// Returns string content; atoms are returned verbatim, `NIL` is `None`.
    #[must_use]
    pub fn as_text(&self) -> Option<String> {
        match self {
            Self::Atom(a) => Some(a.clone()),
            Self::Str(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
            Self::Nil | Self::List(_) => None,
        }
    }

    /// Returns raw bytes of a string or literal.
    #[must_use]
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Str(bytes) => Some(bytes),
            _ => None,
        }
    }

    /// Returns list items.
    #[must_use]
    pub fn as_list(&self) -> Option<&[Self]> {
        match self {
            Self::List(items) => Some(items),
            _ => None,
        }
    }
}

/// Parses one complete response as returned by
/// [`FramedStream::read_response`](crate::FramedStream::read_response).
///
/// # Errors
///
/// Returns [`Error::Parse`] if the line is not a recognizable response.
pub fn parse_response(line: &[u8]) -> Result<Response> {
    let line = trim_crlf(line);

    if let Some(rest) = line.strip_prefix(b"* ") {
        return parse_untagged(rest).map(Response::Untagged);
    }
    if let Some(rest) = line.strip_prefix(b"+") {
        return Ok(Response::Continuation(lossy(trim_leading_space(rest))));
    }

    let (tag, rest) = split_word(line);
    let (status, text) = split_word(rest);
    if tag.is_empty() {
        return Err(Error::parse(0, "empty response line"));
    }
    let status = Status::parse(&lossy(status))
        .ok_or_else(|| Error::parse(tag.len() + 1, "expected OK, NO, BAD or BYE"))?;

    Ok(Response::Tagged {
        tag: lossy(tag),
        status,
        text: lossy(text),
    })
}

fn parse_untagged(rest: &[u8]) -> Result<Untagged> {
    let (first, tail) = split_word(rest);
    let word = lossy(first).to_ascii_uppercase();

    if let Ok(number) = word.parse::<u32>() {
        let (kind, payload) = split_word(tail);
        return match lossy(kind).to_ascii_uppercase().as_str() {
            "EXISTS" => Ok(Untagged::Exists(number)),
            "FETCH" => {
                let mut values = ValueParser::new(payload).parse_all()?;
                match values.pop() {
                    Some(Value::List(attributes)) if values.is_empty() => Ok(Untagged::Fetch {
                        seq: number,
                        attributes,
                    }),
                    _ => Err(Error::parse(0, "FETCH payload is not a single list")),
                }
            }
            _ => Ok(Untagged::Other(lossy(rest))),
        };
    }

    if let Some(status) = Status::parse(&word) {
        let (code, text) = split_code(tail);
        return Ok(Untagged::Status {
            status,
            code,
            text: lossy(text),
        });
    }

    match word.as_str() {
        "CAPABILITY" => Ok(Untagged::Capability(words(tail))),
        "SEARCH" => Ok(Untagged::Search(
            words(tail).iter().filter_map(|w| w.parse().ok()).collect(),
        )),
        _ => Ok(Untagged::Other(lossy(rest))),
    }
}

/// Splits `[CODE args] text` into the code and the remaining text.
fn split_code(text: &[u8]) -> (Option<String>, &[u8]) {
    let Some(inner) = text.strip_prefix(b"[") else {
        return (None, text);
    };
    match inner.iter().position(|&b| b == b']') {
        Some(end) => (
            Some(lossy(&inner[..end])),
            trim_leading_space(&inner[end + 1..]),
        ),
        None => (None, text),
    }
}

/// Extracts capabilities from a `CAPABILITY ...` response code.
#[must_use]
pub fn capabilities_from_code(code: &str) -> Option<Vec<String>> {
    let mut parts = code.split_ascii_whitespace();
    let name = parts.next()?;
    name.eq_ignore_ascii_case("CAPABILITY")
        .then(|| parts.map(str::to_string).collect())
}

fn words(bytes: &[u8]) -> Vec<String> {
    lossy(bytes)
        .split_ascii_whitespace()
        .map(str::to_string)
        .collect()
}

fn split_word(bytes: &[u8]) -> (&[u8], &[u8]) {
    match bytes.iter().position(|&b| b == b' ') {
        Some(i) => (&bytes[..i], &bytes[i + 1..]),
        None => (bytes, &[]),
    }
}

fn trim_crlf(bytes: &[u8]) -> &[u8] {
    let bytes = bytes.strip_suffix(b"\n").unwrap_or(bytes);
    bytes.strip_suffix(b"\r").unwrap_or(bytes)
}

fn trim_leading_space(bytes: &[u8]) -> &[u8] {
    let start = bytes.iter().position(|&b| b != b' ').unwrap_or(bytes.len());
    &bytes[start..]
}

fn lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

/// Recursive-descent parser for atoms, strings, literals and lists.
struct ValueParser<'a> {
    input: &'a [u8],
    pos: usize,
}

impl<'a> ValueParser<'a> {
    const fn new(input: &'a [u8]) -> Self {
        Self { input, pos: 0 }
    }

    fn parse_all(mut self) -> Result<Vec<Value>> {
        let mut values = Vec::new();
        loop {
            self.skip_spaces();
            match self.peek() {
                None | Some(b'\r' | b'\n') => return Ok(values),
                Some(_) => values.push(self.value()?),
            }
        }
    }

    fn peek(&self) -> Option<u8> {
        self.input.get(self.pos).copied()
    }

    fn skip_spaces(&mut self) {
        while self.peek() == Some(b' ') {
            self.pos += 1;
        }
    }

    fn value(&mut self) -> Result<Value> {
        match self.peek() {
            Some(b'(') => self.list(),
            Some(b'"') => self.quoted(),
            Some(b'{') => self.literal(),
            Some(_) => self.atom(),
            None => Err(Error::parse(self.pos, "unexpected end of input")),
        }
    }

    fn list(&mut self) -> Result<Value> {
        self.pos += 1;
        let mut items = Vec::new();
        loop {
            self.skip_spaces();
            match self.peek() {
                Some(b')') => {
                    self.pos += 1;
                    return Ok(Value::List(items));
                }
                None | Some(b'\r' | b'\n') => {
                    return Err(Error::parse(self.pos, "unterminated list"));
                }
                Some(_) => items.push(self.value()?),
            }
        }
    }

    fn quoted(&mut self) -> Result<Value> {
        self.pos += 1;
        let mut out = Vec::new();
        loop {
            match self.peek() {
                Some(b'"') => {
                    self.pos += 1;
                    return Ok(Value::Str(out));
                }
                Some(b'\\') => {
                    let escaped = self
                        .input
                        .get(self.pos + 1)
                        .copied()
                        .ok_or_else(|| Error::parse(self.pos, "dangling escape"))?;
                    out.push(escaped);
                    self.pos += 2;
                }
                Some(b'\r' | b'\n') | None => {
                    return Err(Error::parse(self.pos, "unterminated quoted string"));
                }
                Some(b) => {
                    out.push(b);
                    self.pos += 1;
                }
            }
        }
    }

    fn literal(&mut self) -> Result<Value> {
        let start = self.pos;
        let close = self.input[start..]
            .iter()
            .position(|&b| b == b'}')
            .map(|i| start + i)
            .ok_or_else(|| Error::parse(start, "unterminated literal length"))?;
        let digits = self.input[start + 1..close]
            .strip_suffix(b"+")
            .unwrap_or(&self.input[start + 1..close]);
        let len: usize = std::str::from_utf8(digits)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| Error::parse(start, "invalid literal length"))?;

        let mut data_start = close + 1;
        if self.input.get(data_start) == Some(&b'\r') {
            data_start += 1;
        }
        if self.input.get(data_start) != Some(&b'\n') {
            return Err(Error::parse(data_start, "literal length not followed by CRLF"));
        }
        data_start += 1;

        let data = self
            .input
            .get(data_start..data_start + len)
            .ok_or_else(|| Error::parse(data_start, "literal shorter than announced"))?;
        self.pos = data_start + len;
        Ok(Value::Str(data.to_vec()))
    }

    fn atom(&mut self) -> Result<Value> {
        let start = self.pos;
        let mut depth = 0usize;
        while let Some(b) = self.peek() {
            match b {
                b'[' => depth += 1,
                b']' => depth = depth.saturating_sub(1),
                b' ' | b'(' | b')' if depth == 0 => break,
                b'\r' | b'\n' | b'"' | b'{' if depth == 0 => break,
                _ => {}
            }
            self.pos += 1;
        }
        if self.pos == start {
            return Err(Error::parse(start, "unexpected character"));
        }

        let atom = lossy(&self.input[start..self.pos]);
        if atom.eq_ignore_ascii_case("NIL") {
            Ok(Value::Nil)
        } else {
            Ok(Value::Atom(atom))
        }
    }
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

    fn atom(s: &str) -> Value {
        Value::Atom(s.to_string())
    }

    #[test]
    fn tagged_ok() {
        let response = parse_response(b"A0002 OK [READ-ONLY] EXAMINE completed\r\n").unwrap();
        assert_eq!(
            response,
            Response::Tagged {
                tag: "A0002".to_string(),
                status: Status::Ok,
                text: "[READ-ONLY] EXAMINE completed".to_string(),
            }
        );
    }

    #[test]
    fn tagged_no() {
        match parse_response(b"A0001 NO [AUTHENTICATIONFAILED] bad password\r\n").unwrap() {
            Response::Tagged { status, .. } => assert_eq!(status, Status::No),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn greeting_with_capability_code() {
        let response =
            parse_response(b"* OK [CAPABILITY IMAP4rev1 STARTTLS LOGINDISABLED] ready\r\n")
                .unwrap();
        let Response::Untagged(Untagged::Status { status, code, text }) = response else {
            panic!("expected status");
        };
        assert_eq!(status, Status::Ok);
        assert_eq!(text, "ready");
        let caps = capabilities_from_code(&code.unwrap()).unwrap();
        assert_eq!(caps, vec!["IMAP4rev1", "STARTTLS", "LOGINDISABLED"]);
    }

    #[test]
    fn search_results() {
        assert_eq!(
            parse_response(b"* SEARCH 4 8 15\r\n").unwrap(),
            Response::Untagged(Untagged::Search(vec![4, 8, 15]))
        );
        assert_eq!(
            parse_response(b"* SEARCH\r\n").unwrap(),
            Response::Untagged(Untagged::Search(vec![]))
        );
    }

    #[test]
    fn exists_count() {
        assert_eq!(
            parse_response(b"* 17 EXISTS\r\n").unwrap(),
            Response::Untagged(Untagged::Exists(17))
        );
    }

    #[test]
    fn continuation() {
        assert_eq!(
            parse_response(b"+ go ahead\r\n").unwrap(),
            Response::Continuation("go ahead".to_string())
        );
    }

    #[test]
    fn fetch_with_flags_and_literal() {
        let line = b"* 2 FETCH (UID 12 FLAGS (\\Seen \\Answered) BODY[] {5}\r\nhello)\r\n";
        let Response::Untagged(Untagged::Fetch { seq, attributes }) =
            parse_response(line).unwrap()
        else {
            panic!("expected fetch");
        };
        assert_eq!(seq, 2);
        assert_eq!(
            attributes,
            vec![
                atom("UID"),
                atom("12"),
                atom("FLAGS"),
                Value::List(vec![atom("\\Seen"), atom("\\Answered")]),
                atom("BODY[]"),
                Value::Str(b"hello".to_vec()),
            ]
        );
    }

    #[test]
    fn section_with_spaces_stays_one_atom() {
        let line = b"* 1 FETCH (BODY[HEADER.FIELDS (FROM SUBJECT)] NIL)\r\n";
        let Response::Untagged(Untagged::Fetch { attributes, .. }) =
            parse_response(line).unwrap()
        else {
            panic!("expected fetch");
        };
        assert_eq!(
            attributes,
            vec![atom("BODY[HEADER.FIELDS (FROM SUBJECT)]"), Value::Nil]
        );
    }

    #[test]
    fn quoted_escapes() {
        let line = b"* 1 FETCH (X \"say \\\"hi\\\" \\\\ bye\")\r\n";
        let Response::Untagged(Untagged::Fetch { attributes, .. }) =
            parse_response(line).unwrap()
        else {
            panic!("expected fetch");
        };
        assert_eq!(attributes[1], Value::Str(b"say \"hi\" \\ bye".to_vec()));
    }

    #[test]
    fn unterminated_list_is_error() {
        assert!(parse_response(b"* 1 FETCH (UID 3\r\n").is_err());
    }

    #[test]
    fn short_literal_is_error() {
        assert!(parse_response(b"* 1 FETCH (BODY[] {10}\r\nabc)\r\n").is_err());
    }

    #[test]
    fn unknown_untagged_is_other() {
        assert_eq!(
            parse_response(b"* FLAGS (\\Seen \\Deleted)\r\n").unwrap(),
            Response::Untagged(Untagged::Other("FLAGS (\\Seen \\Deleted)".to_string()))
        );
    }

    #[test]
    fn garbage_status_is_error() {
        assert!(parse_response(b"A1 MAYBE whatever\r\n").is_err());
    }
}
