//! Outgoing message composition.

use std::fmt::{self, Write};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};

use crate::encoding::{check_header_value, encode_base64_lines, encode_header_value};
use crate::error::{Error, Result};

static MESSAGE_COUNTER: AtomicU64 = AtomicU64::new(0);

/// RFC 5322 specials that force a quoted display name.
const SPECIALS: &[char] = &['(', ')', '<', '>', '[', ']', ':', ';', '@', '\\', ',', '.', '"'];

/// A mailbox with an optional display name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mailbox {
    /// Display name, if any.
    pub name: Option<String>,
    /// Bare address (`local@domain`).
    pub address: String,
}

impl Mailbox {
    /// Creates a mailbox with no display name.
    #[must_use]
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            name: None,
            address: address.into(),
        }
    }

    /// Sets the display name. Empty names are ignored.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        self.name = if name.trim().is_empty() { None } else { Some(name) };
        self
    }

    /// Domain part of the address, if it has one.
    #[must_use]
    pub fn domain(&self) -> Option<&str> {
        self.address.rsplit_once('@').map(|(_, d)| d)
    }
}

impl fmt::Display for Mailbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Some(name) = &self.name else {
            return f.write_str(&self.address);
        };
        let encoded = encode_header_value(name);
        if encoded != *name {
            write!(f, "{encoded} <{}>", self.address)
        } else if name.contains(SPECIALS) {
            let quoted = name.replace('\\', "\\\\").replace('"', "\\\"");
            write!(f, "\"{quoted}\" <{}>", self.address)
        } else {
            write!(f, "{name} <{}>", self.address)
        }
    }
}

/// Body flavour of a composed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BodyKind {
    /// `text/plain`.
    Plain,
    /// `text/html`.
    #[default]
    Html,
}

impl BodyKind {
    const fn mime_type(self) -> &'static str {
        match self {
            Self::Plain => "text/plain",
            Self::Html => "text/html",
        }
    }
}

/// Builder for a single-part RFC 5322 message.
#[derive(Debug, Clone)]
pub struct MessageBuilder {
    from: Mailbox,
    to: Vec<Mailbox>,
    subject: String,
    body: String,
    kind: BodyKind,
    date: Option<DateTime<Utc>>,
}

impl MessageBuilder {
    /// Starts a message from `from`.
    #[must_use]
    pub fn new(from: Mailbox) -> Self {
        Self {
            from,
            to: Vec::new(),
            subject: String::new(),
            body: String::new(),
            kind: BodyKind::default(),
            date: None,
        }
    }

    /// Adds a recipient.
    #[must_use]
    pub fn to(mut self, recipient: Mailbox) -> Self {
        self.to.push(recipient);
        self
    }

    /// Sets the subject.
    #[must_use]
    pub fn subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = subject.into();
        self
    }

    /// Sets the body and its flavour.
    #[must_use]
    pub fn body(mut self, body: impl Into<String>, kind: BodyKind) -> Self {
        self.body = body.into();
        self.kind = kind;
        self
    }

    /// Fixes the `Date` header. Defaults to the time of [`build`](Self::build).
    #[must_use]
    pub const fn date(mut self, date: DateTime<Utc>) -> Self {
        self.date = Some(date);
        self
    }

    /// Sender mailbox.
    #[must_use]
    pub const fn sender(&self) -> &Mailbox {
        &self.from
    }

    /// Recipient mailboxes.
    #[must_use]
    pub fn recipients(&self) -> &[Mailbox] {
        &self.to
    }

    /// Renders the message with CRLF line endings and a base64 body.
    ///
    /// # Errors
    ///
    /// Returns an error if there are no recipients or a header value
    /// contains a line break.
    pub fn build(&self) -> Result<Vec<u8>> {
        if self.to.is_empty() {
            return Err(Error::InvalidHeader {
                name: "To",
                reason: "no recipients".to_string(),
            });
        }
        check_header_value("Subject", &self.subject)?;
        check_mailbox("From", &self.from)?;
        for rcpt in &self.to {
            check_mailbox("To", rcpt)?;
        }

        let date = self.date.unwrap_or_else(Utc::now);
        let to = self
            .to
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ");

        let mut message = String::new();
        let _ = write!(message, "From: {}\r\n", self.from);
        let _ = write!(message, "To: {to}\r\n");
        let _ = write!(message, "Subject: {}\r\n", encode_header_value(&self.subject));
        let _ = write!(message, "Date: {}\r\n", date.to_rfc2822());
        let _ = write!(message, "Message-ID: {}\r\n", message_id(&date, self.from.domain()));
        message.push_str("MIME-Version: 1.0\r\n");
        let _ = write!(
            message,
            "Content-Type: {}; charset=utf-8\r\n",
            self.kind.mime_type()
        );
        message.push_str("Content-Transfer-Encoding: base64\r\n");
        message.push_str("\r\n");
        message.push_str(&encode_base64_lines(self.body.as_bytes()));

        Ok(message.into_bytes())
    }
}

fn check_mailbox(header: &'static str, mailbox: &Mailbox) -> Result<()> {
    check_header_value(header, &mailbox.address)?;
    if let Some(name) = &mailbox.name {
        check_header_value(header, name)?;
    }
    Ok(())
}

fn message_id(date: &DateTime<Utc>, domain: Option<&str>) -> String {
    let seq = MESSAGE_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!(
        "<{}.{}.{}@{}>",
        date.timestamp_micros(),
        std::process::id(),
        seq,
        domain.unwrap_or("localhost")
    )
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
    use crate::body::extract_bodies;
    use crate::header::{Headers, split_entity};
    use chrono::TimeZone;

    fn fixed_date() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 9, 30, 0).unwrap()
    }

    #[test]
    fn mailbox_display() {
        assert_eq!(Mailbox::new("a@b.c").to_string(), "a@b.c");
        assert_eq!(
            Mailbox::new("a@b.c").with_name("Alice").to_string(),
            "Alice <a@b.c>"
        );
        assert_eq!(
            Mailbox::new("a@b.c").with_name("Smith, J.").to_string(),
            "\"Smith, J.\" <a@b.c>"
        );
        assert_eq!(
            Mailbox::new("a@b.c").with_name("Zoë").to_string(),
            "=?utf-8?B?Wm/Dqw==?= <a@b.c>"
        );
        assert!(Mailbox::new("a@b.c").with_name("  ").name.is_none());
    }

    #[test]
    fn builds_html_message() {
        let raw = MessageBuilder::new(Mailbox::new("me@example.com").with_name("Me"))
            .to(Mailbox::new("you@example.org"))
            .subject("Status report")
            .body("<p>All good</p>", BodyKind::Html)
            .date(fixed_date())
            .build()
            .unwrap();

        let (head, _) = split_entity(&raw);
        let headers = Headers::parse(head);
        assert_eq!(headers.get("From"), Some("Me <me@example.com>"));
        assert_eq!(headers.get("To"), Some("you@example.org"));
        assert_eq!(headers.get("Subject"), Some("Status report"));
        let date = DateTime::parse_from_rfc2822(headers.get("Date").unwrap()).unwrap();
        assert_eq!(date, fixed_date());
        assert_eq!(headers.get("MIME-Version"), Some("1.0"));
        assert!(headers.get("Message-ID").unwrap().ends_with("@example.com>"));
        assert_eq!(
            headers.get("Content-Type"),
            Some("text/html; charset=utf-8")
        );

        let parts = extract_bodies(&raw).unwrap();
        assert_eq!(parts.html.as_deref(), Some("<p>All good</p>"));
        assert!(parts.text.is_none());
    }

    #[test]
    fn plain_body_and_encoded_subject() {
        let raw = MessageBuilder::new(Mailbox::new("me@example.com"))
            .to(Mailbox::new("you@example.org"))
            .subject("Grüße")
            .body("hello", BodyKind::Plain)
            .build()
            .unwrap();
        let (head, _) = split_entity(&raw);
        let headers = Headers::parse(head);
        assert_eq!(headers.get_decoded("Subject").as_deref(), Some("Grüße"));
        assert_eq!(
            extract_bodies(&raw).unwrap().text.as_deref(),
            Some("hello")
        );
    }

    #[test]
    fn long_encoded_subject_is_folded() {
        let subject = "Rückmeldung zur Präsentation über Quartalsergebnisse ".repeat(20);
        let raw = MessageBuilder::new(Mailbox::new("me@example.com"))
            .to(Mailbox::new("you@example.org"))
            .subject(subject.clone())
            .body("hello", BodyKind::Plain)
            .date(fixed_date())
            .build()
            .unwrap();

        let (head, _) = split_entity(&raw);
        let head_text = String::from_utf8_lossy(head);
        let subject_lines = head_text
            .lines()
            .skip_while(|l| !l.starts_with("Subject:"))
            .take_while(|l| l.starts_with("Subject:") || l.starts_with(' '))
            .count();
        assert!(subject_lines > 10);
        for line in head_text.lines() {
            assert!(line.len() <= 85, "header line too long: {line}");
        }
        let headers = Headers::parse(head);
        assert_eq!(headers.get_decoded("Subject").as_deref(), Some(subject.as_str()));
    }

    #[test]
    fn message_ids_are_unique() {
        let a = message_id(&fixed_date(), None);
        let b = message_id(&fixed_date(), None);
        assert_ne!(a, b);
        assert!(a.ends_with("@localhost>"));
    }

    #[test]
    fn rejects_missing_recipients_and_injection() {
        let builder = MessageBuilder::new(Mailbox::new("me@example.com"));
        assert!(builder.build().is_err());

        let injected = MessageBuilder::new(Mailbox::new("me@example.com"))
            .to(Mailbox::new("you@example.org"))
            .subject("hi\r\nBcc: evil@example.net");
        assert!(injected.build().is_err());
    }
}
