//! Mailbox snapshots: the unseen count and recent message summaries.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use mailpulse_imap::FetchedMessage;
use mailpulse_mime::{BodyParts, decode_header_value, extract_bodies};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::config::ConfigSource;
use crate::error::Result;
use crate::transport::MailTransport;

/// Longest preview, in characters.
///
/// Counted after whitespace runs (line breaks and indentation left behind
/// by stripped markup included) have collapsed to single spaces, so the
/// budget is spent on words.
pub const PREVIEW_LENGTH: usize = 200;

/// A lightweight view of one message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MessageSummary {
    /// IMAP UID as a decimal string.
    pub id: String,
    /// Sender display name, or address when there is no name.
    pub from: String,
    /// Decoded subject.
    pub subject: String,
    /// Server arrival time.
    pub timestamp: DateTime<Utc>,
    /// Whether the message has been read.
    pub seen: bool,
    /// Start of the text body, markup removed.
    pub preview: String,
}

impl MessageSummary {
    /// Builds a summary from FETCH data and an already extracted preview.
    #[must_use]
    pub fn from_fetched(uid: u32, message: &FetchedMessage, preview: String) -> Self {
        let envelope = message.envelope.as_ref();
        let from = envelope
            .and_then(|e| e.from.first())
            .map(|addr| {
                addr.name
                    .as_deref()
                    .map(decode_header_value)
                    .filter(|n| !n.trim().is_empty())
                    .or_else(|| addr.email())
                    .unwrap_or_default()
            })
            .unwrap_or_default();
        let subject = envelope
            .and_then(|e| e.subject.as_deref())
            .map(decode_header_value)
            .unwrap_or_default();
        let timestamp = message
            .internal_date
            .or_else(|| {
                envelope
                    .and_then(|e| e.date.as_deref())
                    .and_then(|d| DateTime::parse_from_rfc2822(d).ok())
                    .map(|d| d.with_timezone(&Utc))
            })
            .unwrap_or(DateTime::UNIX_EPOCH);

        Self {
            id: uid.to_string(),
            from,
            subject,
            timestamp,
            seen: message.is_seen(),
            preview,
        }
    }
}

/// Picks the `take` highest UIDs, highest first.
#[must_use]
pub fn select_most_recent(mut uids: Vec<u32>, take: usize) -> Vec<u32> {
    uids.sort_unstable_by(|a, b| b.cmp(a));
    uids.dedup();
    uids.truncate(take);
    uids
}

/// Orders summaries newest first; equal timestamps fall back to the
/// higher UID.
pub fn sort_newest_first(summaries: &mut [MessageSummary]) {
    summaries.sort_by(|a, b| {
        b.timestamp
            .cmp(&a.timestamp)
            .then_with(|| uid_of(b).cmp(&uid_of(a)))
    });
}

fn uid_of(summary: &MessageSummary) -> u64 {
    summary.id.parse().unwrap_or_default()
}

/// Why a preview could not be produced.
#[derive(Debug, thiserror::Error)]
pub enum PreviewError {
    /// The body fetch failed.
    #[error("body fetch failed: {0}")]
    Fetch(#[from] mailpulse_imap::Error),

    /// The server returned no body for the UID.
    #[error("no body returned for UID {0}")]
    MissingBody(u32),

    /// The body could not be decoded.
    #[error("body could not be decoded: {0}")]
    Decode(#[from] mailpulse_mime::Error),
}

/// Extracts a preview from a raw RFC 5322 message.
///
/// # Errors
///
/// Returns an error when the MIME structure cannot be decoded.
pub fn preview_from_raw(raw: &[u8]) -> std::result::Result<String, PreviewError> {
    Ok(make_preview(&extract_bodies(raw)?))
}

/// Builds a preview: the plain-text body when present, otherwise the HTML
/// body with tags dropped. Whitespace runs collapse to one space and the
/// result is cut at [`PREVIEW_LENGTH`] characters.
#[must_use]
pub fn make_preview(parts: &BodyParts) -> String {
    let source = match (&parts.text, &parts.html) {
        (Some(text), _) if !text.trim().is_empty() => text.clone(),
        (_, Some(html)) => strip_html(html),
        (Some(text), None) => text.clone(),
        (None, None) => String::new(),
    };
    truncate_chars(&collapse_whitespace(&source), PREVIEW_LENGTH)
}

/// Removes everything from `<` through the next `>`.
///
/// Entities are left as they are.
#[must_use]
pub fn strip_html(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut in_tag = false;
    for c in html.chars() {
        match c {
            '<' => in_tag = true,
            '>' if in_tag => in_tag = false,
            _ if !in_tag => out.push(c),
            _ => {}
        }
    }
    out
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

/// Mailbox queries bound to a transport and a settings source.
#[derive(Debug)]
pub struct MailboxSnapshot<T, C> {
    transport: Arc<T>,
    config: Arc<C>,
}

impl<T, C> Clone for MailboxSnapshot<T, C> {
    fn clone(&self) -> Self {
        Self {
            transport: Arc::clone(&self.transport),
            config: Arc::clone(&self.config),
        }
    }
}

impl<T: MailTransport, C: ConfigSource> MailboxSnapshot<T, C> {
    /// Creates a snapshot reader.
    pub const fn new(transport: Arc<T>, config: Arc<C>) -> Self {
        Self { transport, config }
    }

    /// The settings source.
    pub fn config(&self) -> &C {
        &self.config
    }

    /// Counts unseen messages with the current settings.
    ///
    /// # Errors
    ///
    /// Returns the transport error, or [`Error::Cancelled`](crate::Error::Cancelled).
    pub async fn unseen_count(&self, cancel: &CancellationToken) -> Result<u32> {
        let settings = self.config.current().await;
        self.transport.query_unseen_count(&settings.imap, cancel).await
    }

    /// Lists up to `take` recent messages, newest first.
    ///
    /// # Errors
    ///
    /// Returns the transport error, or [`Error::Cancelled`](crate::Error::Cancelled).
    pub async fn recent(&self, take: usize, cancel: &CancellationToken) -> Result<Vec<MessageSummary>> {
        let settings = self.config.current().await;
        let mut summaries = self.transport.query_recent(&settings.imap, take, cancel).await?;
        sort_newest_first(&mut summaries);
        Ok(summaries)
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
    use chrono::TimeZone;
    use mailpulse_imap::{Address, Envelope};
    use proptest::prelude::*;

    #[test]
    fn most_recent_is_highest_uid() {
        assert_eq!(select_most_recent((1..=10).collect(), 3), vec![10, 9, 8]);
        assert_eq!(select_most_recent(vec![4, 2], 5), vec![4, 2]);
        assert!(select_most_recent(Vec::new(), 5).is_empty());
        assert!(select_most_recent(vec![1, 2], 0).is_empty());
    }

    #[test]
    fn strips_tags_only() {
        assert_eq!(strip_html("<p>Hello <b>you</b></p>"), "Hello you");
        assert_eq!(strip_html("a &amp; b"), "a &amp; b");
        assert_eq!(strip_html("1 > 0 <unclosed"), "1 > 0 ");
    }

    #[test]
    fn preview_prefers_plain_text() {
        let parts = BodyParts {
            text: Some("plain\n\nbody".into()),
            html: Some("<p>html</p>".into()),
        };
        assert_eq!(make_preview(&parts), "plain body");
    }

    #[test]
    fn preview_falls_back_to_html() {
        let parts = BodyParts {
            text: Some("   ".into()),
            html: Some("<div>Only <i>html</i></div>".into()),
        };
        assert_eq!(make_preview(&parts), "Only html");
        assert_eq!(make_preview(&BodyParts::default()), "");
    }

    #[test]
    fn preview_length_counts_collapsed_whitespace() {
        let html = format!("<div>\n    <p>{}</p>\n</div>", "word ".repeat(60));
        let preview = make_preview(&BodyParts { text: None, html: Some(html) });
        assert!(preview.starts_with("word word"));
        assert_eq!(preview.chars().count(), PREVIEW_LENGTH);
        assert!(!preview.contains("  "));
        assert!(!preview.contains('\n'));

        let text = "  short\r\n\r\n  note \t ".to_string();
        let preview = make_preview(&BodyParts { text: Some(text), html: None });
        assert_eq!(preview, "short note");
    }

    #[test]
    fn preview_from_raw_message() {
        let raw = b"Content-Type: text/html\r\n\r\n<h1>Big</h1><p>news</p>";
        assert_eq!(preview_from_raw(raw).unwrap(), "Bignews");
        assert!(preview_from_raw(b"Content-Type: multipart/mixed\r\n\r\nx").is_err());
    }

    #[test]
    fn summary_prefers_decoded_display_name() {
        let message = FetchedMessage {
            seq: 1,
            uid: Some(42),
            flags: vec!["\\Seen".into()],
            internal_date: Some(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()),
            envelope: Some(Envelope {
                subject: Some("=?utf-8?Q?Caf=C3=A9?=".into()),
                from: vec![Address {
                    name: Some("=?utf-8?B?Wm/Dqw==?=".into()),
                    mailbox: Some("zoe".into()),
                    host: Some("example.com".into()),
                }],
                ..Envelope::default()
            }),
            body: None,
        };
        let summary = MessageSummary::from_fetched(42, &message, "hi".into());
        assert_eq!(summary.id, "42");
        assert_eq!(summary.from, "Zoë");
        assert_eq!(summary.subject, "Café");
        assert!(summary.seen);
    }

    #[test]
    fn summary_falls_back_to_address_and_envelope_date() {
        let message = FetchedMessage {
            uid: Some(7),
            envelope: Some(Envelope {
                date: Some("Tue, 1 Jul 2003 10:52:37 +0200".into()),
                from: vec![Address {
                    name: None,
                    mailbox: Some("bob".into()),
                    host: Some("example.org".into()),
                }],
                ..Envelope::default()
            }),
            ..FetchedMessage::default()
        };
        let summary = MessageSummary::from_fetched(7, &message, String::new());
        assert_eq!(summary.from, "bob@example.org");
        assert_eq!(summary.timestamp, Utc.with_ymd_and_hms(2003, 7, 1, 8, 52, 37).unwrap());
        assert!(!summary.seen);
    }

    #[test]
    fn newest_first_with_uid_tiebreak() {
        let at = |uid: u32, hour: u32| MessageSummary {
            id: uid.to_string(),
            from: String::new(),
            subject: String::new(),
            timestamp: Utc.with_ymd_and_hms(2024, 1, 1, hour, 0, 0).unwrap(),
            seen: false,
            preview: String::new(),
        };
        let mut list = vec![at(1, 9), at(3, 8), at(2, 9), at(10, 7)];
        sort_newest_first(&mut list);
        let ids: Vec<&str> = list.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["2", "1", "3", "10"]);
    }

    proptest! {
        #[test]
        fn preview_is_bounded_and_markup_free(html in "(<[a-z]{1,5}>|[a-zA-Z ]{0,30}|</[a-z]{1,5}>){0,40}") {
            let preview = make_preview(&BodyParts { text: None, html: Some(html) });
            prop_assert!(preview.chars().count() <= PREVIEW_LENGTH);
            prop_assert!(!preview.contains('<'));
            prop_assert!(!preview.contains('>'));
        }

        #[test]
        fn selection_is_sorted_prefix(uids in proptest::collection::vec(1u32..500, 0..60), take in 0usize..20) {
            let chosen = select_most_recent(uids.clone(), take);
            prop_assert!(chosen.len() <= take);
            prop_assert!(chosen.windows(2).all(|w| w[0] > w[1]));
            let max = uids.iter().max().copied();
            if take > 0 {
                prop_assert_eq!(chosen.first().copied(), max);
            }
        }
    }
}
