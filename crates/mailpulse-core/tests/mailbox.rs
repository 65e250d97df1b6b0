//! End-to-end mailbox queries against scripted IMAP and SMTP servers.
//!
//! The whole server side of each conversation is queued up front; the
//! client's commands are captured and checked afterwards.

#![allow(clippy::unwrap_used, clippy::similar_names)]

use std::io::{self, Cursor};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use mailpulse_core::config::{ImapSettings, SmtpSettings};
use mailpulse_core::snapshot::PREVIEW_LENGTH;
use mailpulse_core::transport::{count_unseen_on, recent_on, send_on};
use mailpulse_core::OutgoingEmail;
use mailpulse_imap::Session;
use mailpulse_smtp::Client;

/// Mock stream that replays canned server output and records client input.
struct MockStream {
    responses: Cursor<Vec<u8>>,
    sent: Arc<Mutex<Vec<u8>>>,
}

impl MockStream {
    fn new(responses: Vec<u8>) -> (Self, Arc<Mutex<Vec<u8>>>) {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let stream = Self {
            responses: Cursor::new(responses),
            sent: Arc::clone(&sent),
        };
        (stream, sent)
    }
}

impl AsyncRead for MockStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let pos = usize::try_from(self.responses.position()).unwrap();
        let data = self.responses.get_ref();
        if pos >= data.len() {
            return Poll::Ready(Ok(()));
        }

        let to_read = (data.len() - pos).min(buf.remaining());
        buf.put_slice(&data[pos..pos + to_read]);
        self.responses.set_position((pos + to_read) as u64);
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for MockStream {
    fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        self.sent.lock().unwrap().extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

fn imap_settings() -> ImapSettings {
    ImapSettings {
        host: "imap.example.com".into(),
        username: Some("me@example.com".into()),
        password: Some("secret".into()),
        ..ImapSettings::default()
    }
}

fn summary_line(uid: u32, hour: u32, seen: bool) -> String {
    let flags = if seen { "\\Seen" } else { "" };
    format!(
        "* {uid} FETCH (UID {uid} FLAGS ({flags}) INTERNALDATE \"01-Mar-2024 {hour:02}:00:00 +0000\" \
         ENVELOPE (\"Fri, 1 Mar 2024 {hour:02}:00:00 +0000\" \"Report {uid}\" \
         ((\"Sender {uid}\" NIL \"sender{uid}\" \"example.com\")) NIL NIL \
         ((NIL NIL \"me\" \"example.com\")) NIL NIL NIL \"<{uid}@example.com>\"))\r\n"
    )
}

fn html_message(uid: u32, html: &str) -> Vec<u8> {
    format!(
        "From: sender{uid}@example.com\r\nSubject: Report {uid}\r\n\
         Content-Type: text/html; charset=utf-8\r\n\r\n{html}"
    )
    .into_bytes()
}

fn body_response(tag: &str, uid: u32, raw: &[u8]) -> Vec<u8> {
    let mut out = format!("* {uid} FETCH (UID {uid} BODY[] {{{}}}\r\n", raw.len()).into_bytes();
    out.extend_from_slice(raw);
    out.extend_from_slice(format!(")\r\n{tag} OK FETCH completed\r\n").as_bytes());
    out
}

fn login_and_examine(exists: u32) -> Vec<u8> {
    format!(
        "* OK [CAPABILITY IMAP4rev1] ready\r\n\
         A0000 OK LOGIN completed\r\n\
         * {exists} EXISTS\r\n* 0 RECENT\r\n\
         A0001 OK [READ-ONLY] EXAMINE completed\r\n"
    )
    .into_bytes()
}

#[tokio::test]
async fn recent_three_of_ten_with_html_bodies() {
    let long_html = format!("<div><h1>Quarterly</h1>\n<p>{}</p></div>", "numbers ".repeat(60));

    let mut script = login_and_examine(10);
    script.extend_from_slice(b"* SEARCH 1 2 3 4 5 6 7 8 9 10\r\nA0002 OK SEARCH completed\r\n");
    script.extend_from_slice(summary_line(8, 8, true).as_bytes());
    script.extend_from_slice(summary_line(9, 9, false).as_bytes());
    script.extend_from_slice(summary_line(10, 10, false).as_bytes());
    script.extend_from_slice(b"A0003 OK FETCH completed\r\n");
    script.extend(body_response("A0004", 8, &html_message(8, "<p>Eight <b>is</b> done</p>")));
    script.extend(body_response("A0005", 9, &html_message(9, &long_html)));
    script.extend(body_response("A0006", 10, &html_message(10, "<p>Ten &amp; counting</p>")));
    script.extend_from_slice(b"* BYE see you\r\nA0007 OK LOGOUT completed\r\n");

    let (stream, sent) = MockStream::new(script);
    let session = Session::from_stream(stream).await.unwrap();
    let summaries = recent_on(session, &imap_settings(), 3).await.unwrap();

    let ids: Vec<&str> = summaries.iter().map(|s| s.id.as_str()).collect();
    assert_eq!(ids, vec!["10", "9", "8"]);

    assert_eq!(summaries[0].preview, "Ten &amp; counting");
    assert_eq!(summaries[0].from, "Sender 10");
    assert_eq!(summaries[0].subject, "Report 10");
    assert!(!summaries[0].seen);
    assert!(summaries[2].seen);
    assert_eq!(summaries[2].preview, "Eight is done");

    for summary in &summaries {
        assert!(summary.preview.chars().count() <= PREVIEW_LENGTH);
        assert!(!summary.preview.contains('<'));
    }
    assert_eq!(summaries[1].preview.chars().count(), PREVIEW_LENGTH);
    assert!(summaries[1].preview.starts_with("Quarterly numbers"));

    let sent = String::from_utf8(sent.lock().unwrap().clone()).unwrap();
    assert!(sent.contains("A0001 EXAMINE \"INBOX\"\r\n"));
    assert!(sent.contains("A0002 UID SEARCH ALL\r\n"));
    assert!(sent.contains("A0003 UID FETCH 10,9,8 (UID FLAGS INTERNALDATE ENVELOPE)\r\n"));
    assert!(sent.contains("A0004 UID FETCH 8 (UID BODY.PEEK[])\r\n"));
    assert!(sent.ends_with("A0007 LOGOUT\r\n"));
}

#[tokio::test]
async fn failed_preview_leaves_it_empty() {
    let mut script = login_and_examine(2);
    script.extend_from_slice(b"* SEARCH 1 2\r\nA0002 OK SEARCH completed\r\n");
    script.extend_from_slice(summary_line(1, 7, false).as_bytes());
    script.extend_from_slice(summary_line(2, 9, false).as_bytes());
    script.extend_from_slice(b"A0003 OK FETCH completed\r\n");
    script.extend_from_slice(b"A0004 NO message expunged\r\n");
    script.extend(body_response("A0005", 2, &html_message(2, "<p>still here</p>")));
    script.extend_from_slice(b"A0006 OK LOGOUT completed\r\n");

    let (stream, _) = MockStream::new(script);
    let session = Session::from_stream(stream).await.unwrap();
    let summaries = recent_on(session, &imap_settings(), 50).await.unwrap();

    assert_eq!(summaries.len(), 2);
    assert_eq!(summaries[0].id, "2");
    assert_eq!(summaries[0].preview, "still here");
    assert_eq!(summaries[1].id, "1");
    assert_eq!(summaries[1].preview, "");
}

#[tokio::test]
async fn empty_mailbox_lists_nothing() {
    let mut script = login_and_examine(0);
    script.extend_from_slice(b"A0002 OK LOGOUT completed\r\n");

    let (stream, sent) = MockStream::new(script);
    let session = Session::from_stream(stream).await.unwrap();
    let summaries = recent_on(session, &imap_settings(), 50).await.unwrap();

    assert!(summaries.is_empty());
    let sent = String::from_utf8(sent.lock().unwrap().clone()).unwrap();
    assert!(!sent.contains("FETCH"));
}

#[tokio::test]
async fn unseen_count_over_custom_folder() {
    let mut script = login_and_examine(25);
    script.extend_from_slice(b"* SEARCH 3 17 21 22\r\nA0002 OK SEARCH completed\r\n");
    script.extend_from_slice(b"A0003 OK LOGOUT completed\r\n");

    let config = ImapSettings {
        folder: "Work/Alerts".into(),
        ..imap_settings()
    };
    let (stream, sent) = MockStream::new(script);
    let session = Session::from_stream(stream).await.unwrap();
    assert_eq!(count_unseen_on(session, &config).await.unwrap(), 4);

    let sent = String::from_utf8(sent.lock().unwrap().clone()).unwrap();
    assert!(sent.starts_with("A0000 LOGIN \"me@example.com\" \"secret\"\r\n"));
    assert!(sent.contains("A0001 EXAMINE \"Work/Alerts\"\r\n"));
    assert!(sent.contains("A0002 UID SEARCH UNSEEN\r\n"));
}

#[tokio::test]
async fn rejected_login_still_logs_out() {
    let script = b"* OK ready\r\nA0000 NO [AUTHENTICATIONFAILED] bad credentials\r\nA0001 OK bye\r\n".to_vec();

    let (stream, sent) = MockStream::new(script);
    let session = Session::from_stream(stream).await.unwrap();
    let err = count_unseen_on(session, &imap_settings()).await.unwrap_err();

    assert!(err.to_string().contains("bad credentials"));
    let sent = String::from_utf8(sent.lock().unwrap().clone()).unwrap();
    assert!(sent.ends_with("A0001 LOGOUT\r\n"));
}

#[tokio::test]
async fn send_authenticates_and_transmits_message() {
    let script = b"220 smtp.example.com ESMTP\r\n\
250-smtp.example.com\r\n250-AUTH LOGIN PLAIN\r\n250 8BITMIME\r\n\
235 authenticated\r\n\
250 sender ok\r\n\
250 recipient ok\r\n\
354 go ahead\r\n\
250 queued as 1234\r\n\
221 bye\r\n"
        .to_vec();

    let config = SmtpSettings {
        host: "smtp.example.com".into(),
        username: Some("me@example.com".into()),
        password: Some("secret".into()),
        from_address: "me@example.com".into(),
        from_display_name: Some("Me".into()),
        ..SmtpSettings::default()
    };
    let email = OutgoingEmail::new("you@example.org", "Weekly", "<p>.hidden line</p>");
    let (from, to, message) = email.compose(&config).unwrap();

    let (stream, sent) = MockStream::new(script);
    let mut client = Client::from_stream(stream).await.unwrap();
    client.ehlo("mailpulse").await.unwrap();
    send_on(client, &config, &from, &to, &message).await.unwrap();

    let sent = String::from_utf8(sent.lock().unwrap().clone()).unwrap();
    assert!(sent.contains("AUTH PLAIN AG1lQGV4YW1wbGUuY29tAHNlY3JldA==\r\n"));
    assert!(sent.contains("MAIL FROM:<me@example.com>\r\n"));
    assert!(sent.contains("RCPT TO:<you@example.org>\r\n"));
    assert!(sent.contains("From: Me <me@example.com>\r\n"));
    assert!(sent.contains("Content-Type: text/html; charset=utf-8\r\n"));
    assert!(sent.contains("\r\n.\r\nQUIT\r\n"));
}
