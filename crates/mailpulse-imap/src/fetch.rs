//! Interpretation of FETCH response attributes.

use chrono::{DateTime, Utc};

use crate::response::Value;
use crate::{Error, Result};

/// System flag marking a message as read.
pub const SEEN: &str = "\\Seen";

/// An address from an ENVELOPE structure.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Address {
    /// Display name, possibly RFC 2047 encoded.
    pub name: Option<String>,
    /// Local part.
    pub mailbox: Option<String>,
    /// Domain part.
    pub host: Option<String>,
}

impl Address {
    /// Returns `mailbox@host` when both parts are present.
    #[must_use]
    pub fn email(&self) -> Option<String> {
        match (&self.mailbox, &self.host) {
            (Some(m), Some(h)) => Some(format!("{m}@{h}")),
            (Some(m), None) => Some(m.clone()),
            _ => None,
        }
    }

    fn from_value(value: &Value) -> Option<Self> {
        let parts = value.as_list()?;
        // (name adl mailbox host)
        Some(Self {
            name: parts.first().and_then(Value::as_text),
            mailbox: parts.get(2).and_then(Value::as_text),
            host: parts.get(3).and_then(Value::as_text),
        })
    }
}

/// The subset of an ENVELOPE structure used for message summaries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Envelope {
    /// Raw `Date:` header.
    pub date: Option<String>,
    /// Raw `Subject:` header, possibly RFC 2047 encoded.
    pub subject: Option<String>,
    /// `From:` addresses.
    pub from: Vec<Address>,
    /// `To:` addresses.
    pub to: Vec<Address>,
    /// `Message-ID:` header.
    pub message_id: Option<String>,
}

impl Envelope {
    fn from_value(value: &Value) -> Result<Self> {
        let fields = value
            .as_list()
            .ok_or_else(|| Error::Protocol("ENVELOPE is not a list".to_string()))?;
        if fields.len() < 10 {
            return Err(Error::Protocol(format!(
                "ENVELOPE has {} fields, expected 10",
                fields.len()
            )));
        }

        Ok(Self {
            date: fields[0].as_text(),
            subject: fields[1].as_text(),
            from: address_list(&fields[2]),
            to: address_list(&fields[5]),
            message_id: fields[9].as_text(),
        })
    }
}

fn address_list(value: &Value) -> Vec<Address> {
    value
        .as_list()
        .map(|items| items.iter().filter_map(Address::from_value).collect())
        .unwrap_or_default()
}

/// Data returned for one message by a FETCH command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchedMessage {
    /// Message sequence number.
    pub seq: u32,
    /// Unique identifier, if requested.
    pub uid: Option<u32>,
    /// Flags, e.g. `\Seen`.
    pub flags: Vec<String>,
    /// Server arrival time.
    pub internal_date: Option<DateTime<Utc>>,
    /// Envelope, if requested.
    pub envelope: Option<Envelope>,
    /// Full message from `BODY[]`, if requested.
    pub body: Option<Vec<u8>>,
}

impl FetchedMessage {
    /// Builds a message from the flat `name value` attribute list.
    ///
    /// # Errors
    ///
    /// Returns an error if a known attribute carries a malformed value.
    pub fn from_attributes(seq: u32, attributes: &[Value]) -> Result<Self> {
        let mut message = Self {
            seq,
            ..Self::default()
        };

        for pair in attributes.chunks(2) {
            let [Value::Atom(name), value] = pair else {
                return Err(Error::Protocol("odd FETCH attribute list".to_string()));
            };
            let name = name.to_ascii_uppercase();

            match name.as_str() {
                "UID" => {
                    message.uid = Some(
                        value
                            .as_u32()
                            .ok_or_else(|| Error::Protocol("UID is not a number".to_string()))?,
                    );
                }
                "FLAGS" => {
                    message.flags = value
                        .as_list()
                        .unwrap_or_default()
                        .iter()
                        .filter_map(Value::as_text)
                        .collect();
                }
                "INTERNALDATE" => {
                    message.internal_date = value.as_text().as_deref().and_then(parse_internal_date);
                }
                "ENVELOPE" => message.envelope = Some(Envelope::from_value(value)?),
                _ if name.starts_with("BODY[") => {
                    message.body = value.as_bytes().map(<[u8]>::to_vec);
                }
                _ => {}
            }
        }

        Ok(message)
    }

    /// Returns true if the message carries the `\Seen` flag.
    #[must_use]
    pub fn is_seen(&self) -> bool {
        self.flags.iter().any(|f| f.eq_ignore_ascii_case(SEEN))
    }
}

/// Parses an INTERNALDATE such as `17-Jul-1996 02:44:25 -0700` into UTC.
#[must_use]
pub fn parse_internal_date(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_str(raw.trim(), "%d-%b-%Y %H:%M:%S %z")
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
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
    use chrono::TimeZone;

    use super::*;
    use crate::response::{Response, Untagged, parse_response};

    fn fetch(line: &[u8]) -> FetchedMessage {
        let Response::Untagged(Untagged::Fetch { seq, attributes }) =
            parse_response(line).unwrap()
        else {
            panic!("expected fetch");
        };
        FetchedMessage::from_attributes(seq, &attributes).unwrap()
    }

    #[test]
    fn internal_date_normalized_to_utc() {
        let parsed = parse_internal_date("17-Jul-1996 02:44:25 -0700").unwrap();
        assert_eq!(parsed, Utc.with_ymd_and_hms(1996, 7, 17, 9, 44, 25).unwrap());
    }

    #[test]
    fn internal_date_with_padded_day() {
        let parsed = parse_internal_date(" 3-Feb-2024 10:00:00 +0000").unwrap();
        assert_eq!(parsed, Utc.with_ymd_and_hms(2024, 2, 3, 10, 0, 0).unwrap());
    }

    #[test]
    fn internal_date_garbage() {
        assert!(parse_internal_date("yesterday").is_none());
    }

    #[test]
    fn summary_attributes() {
        let msg = fetch(
            b"* 4 FETCH (UID 40 FLAGS (\\Seen) INTERNALDATE \"01-Mar-2025 08:15:00 +0100\" \
ENVELOPE (\"Sat, 1 Mar 2025 08:14:59 +0100\" \"Quarterly report\" \
((\"Ada Lovelace\" NIL \"ada\" \"example.org\")) NIL NIL \
((NIL NIL \"team\" \"example.org\")) NIL NIL NIL \"<r1@example.org>\"))\r\n",
        );

        assert_eq!(msg.seq, 4);
        assert_eq!(msg.uid, Some(40));
        assert!(msg.is_seen());
        assert_eq!(
            msg.internal_date,
            Some(Utc.with_ymd_and_hms(2025, 3, 1, 7, 15, 0).unwrap())
        );
        let envelope = msg.envelope.unwrap();
        assert_eq!(envelope.subject.as_deref(), Some("Quarterly report"));
        assert_eq!(envelope.from[0].name.as_deref(), Some("Ada Lovelace"));
        assert_eq!(envelope.from[0].email().as_deref(), Some("ada@example.org"));
        assert_eq!(envelope.to[0].email().as_deref(), Some("team@example.org"));
        assert_eq!(envelope.message_id.as_deref(), Some("<r1@example.org>"));
    }

    #[test]
    fn unseen_when_flags_empty() {
        let msg = fetch(b"* 1 FETCH (UID 7 FLAGS ())\r\n");
        assert!(!msg.is_seen());
        assert!(msg.envelope.is_none());
    }

    #[test]
    fn body_literal() {
        let msg = fetch(b"* 1 FETCH (UID 7 BODY[] {11}\r\nSubject: x\n)\r\n");
        assert_eq!(msg.body.as_deref(), Some(&b"Subject: x\n"[..]));
    }

    #[test]
    fn short_envelope_is_error() {
        let Response::Untagged(Untagged::Fetch { seq, attributes }) =
            parse_response(b"* 1 FETCH (ENVELOPE (NIL NIL))\r\n").unwrap()
        else {
            panic!("expected fetch");
        };
        assert!(FetchedMessage::from_attributes(seq, &attributes).is_err());
    }
}
