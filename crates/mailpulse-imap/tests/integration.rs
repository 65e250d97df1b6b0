//! Integration tests for the IMAP session.
//!
//! A mock stream replays canned server output, so whole conversations run
//! without a real server.

#![allow(clippy::unwrap_used)]

use std::io::{self, Cursor};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use mailpulse_imap::{Error, Session, SessionState};

/// Mock stream that returns predefined responses and records commands.
struct MockStream {
    responses: Cursor<Vec<u8>>,
    sent: Arc<Mutex<Vec<u8>>>,
}

impl MockStream {
    fn new(responses: &[u8]) -> (Self, Arc<Mutex<Vec<u8>>>) {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let stream = Self {
            responses: Cursor::new(responses.to_vec()),
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

fn sent_text(sent: &Arc<Mutex<Vec<u8>>>) -> String {
    String::from_utf8(sent.lock().unwrap().clone()).unwrap()
}

#[tokio::test]
async fn full_inspection_conversation() {
    let (stream, sent) = MockStream::new(
        b"* OK [CAPABILITY IMAP4rev1 STARTTLS AUTH=PLAIN] Dovecot ready.\r\n\
A0000 OK [CAPABILITY IMAP4rev1 IDLE MOVE] Logged in\r\n\
* FLAGS (\\Answered \\Flagged \\Deleted \\Seen \\Draft)\r\n\
* OK [PERMANENTFLAGS ()] Read-only mailbox.\r\n\
* 3 EXISTS\r\n\
* 0 RECENT\r\n\
* OK [UIDVALIDITY 1700000000] UIDs valid\r\n\
A0001 OK [READ-ONLY] Examine completed\r\n\
* SEARCH 101 103\r\n\
A0002 OK Search completed\r\n\
* 2 FETCH (UID 102 FLAGS (\\Seen) INTERNALDATE \" 2-Feb-2024 08:15:00 +0100\" ENVELOPE (\"Fri, 2 Feb 2024 08:15:00 +0100\" \"Lunch?\" ((\"Ann Lee\" NIL \"ann\" \"example.com\")) NIL NIL NIL NIL NIL NIL NIL))\r\n\
A0003 OK Fetch completed\r\n\
* BYE Logging out\r\n\
A0004 OK Logout completed.\r\n",
    );

    let mut session = Session::from_stream(stream).await.unwrap();
    assert!(session.has_capability("starttls"));

    session.login("ann@example.com", "p\"w").await.unwrap();
    assert_eq!(session.state(), SessionState::Authenticated);
    assert!(session.has_capability("IDLE"));
    assert!(!session.has_capability("STARTTLS"));

    assert_eq!(session.examine("INBOX").await.unwrap(), 3);
    assert_eq!(session.state(), SessionState::Selected);

    assert_eq!(session.uid_search("UNSEEN").await.unwrap(), vec![101, 103]);

    let messages = session
        .uid_fetch(&[102], "(UID FLAGS INTERNALDATE ENVELOPE)")
        .await
        .unwrap();
    assert_eq!(messages.len(), 1);
    let message = &messages[0];
    assert_eq!(message.uid, Some(102));
    assert!(message.is_seen());
    assert_eq!(
        message.internal_date.unwrap().to_rfc3339(),
        "2024-02-02T07:15:00+00:00"
    );
    let envelope = message.envelope.as_ref().unwrap();
    assert_eq!(envelope.subject.as_deref(), Some("Lunch?"));
    assert_eq!(envelope.from[0].name.as_deref(), Some("Ann Lee"));
    assert_eq!(envelope.from[0].email().as_deref(), Some("ann@example.com"));

    session.logout().await.unwrap();
    assert_eq!(session.state(), SessionState::LoggedOut);
    // A second logout is a no-op.
    session.logout().await.unwrap();

    assert_eq!(
        sent_text(&sent),
        "A0000 LOGIN \"ann@example.com\" \"p\\\"w\"\r\n\
A0001 EXAMINE \"INBOX\"\r\n\
A0002 UID SEARCH UNSEEN\r\n\
A0003 UID FETCH 102 (UID FLAGS INTERNALDATE ENVELOPE)\r\n\
A0004 LOGOUT\r\n"
    );
}

#[tokio::test]
async fn body_literal_is_returned_verbatim() {
    let raw = "Subject: hi\r\n\r\n(parens) and {braces}\r\n";
    let script = format!(
        "* PREAUTH ready\r\n\
         * 1 EXISTS\r\nA0000 OK done\r\n\
         * 1 FETCH (UID 7 BODY[] {{{}}}\r\n{raw})\r\nA0001 OK done\r\n",
        raw.len()
    );
    let (stream, _) = MockStream::new(script.as_bytes());

    let mut session = Session::from_stream(stream).await.unwrap();
    assert_eq!(session.state(), SessionState::Authenticated);
    session.examine("INBOX").await.unwrap();

    let messages = session.uid_fetch(&[7], "(UID BODY.PEEK[])").await.unwrap();
    assert_eq!(messages[0].body.as_deref(), Some(raw.as_bytes()));
}

#[tokio::test]
async fn login_refused_when_disabled() {
    let (stream, sent) = MockStream::new(b"* OK [CAPABILITY IMAP4rev1 LOGINDISABLED STARTTLS] ready\r\n");
    let mut session = Session::from_stream(stream).await.unwrap();

    let err = session.login("user", "pass").await.unwrap_err();
    assert!(matches!(err, Error::InvalidState(_)));
    assert!(sent_text(&sent).is_empty());
}

#[tokio::test]
async fn commands_require_selected_mailbox() {
    let (stream, _) = MockStream::new(b"* PREAUTH ready\r\n");
    let mut session = Session::from_stream(stream).await.unwrap();

    assert!(matches!(
        session.uid_search("ALL").await,
        Err(Error::InvalidState(_))
    ));
    assert!(matches!(
        session.uid_fetch(&[1], "(UID)").await,
        Err(Error::InvalidState(_))
    ));
}

#[tokio::test]
async fn bye_greeting_is_an_error() {
    let (stream, _) = MockStream::new(b"* BYE too many connections\r\n");
    let err = Session::from_stream(stream).await.unwrap_err();
    assert!(matches!(err, Error::Bye(text) if text == "too many connections"));
}

#[tokio::test]
async fn closed_connection_is_reported() {
    let (stream, _) = MockStream::new(b"* OK ready\r\nA0000 OK logged in\r\n* 4 EXI");
    let mut session = Session::from_stream(stream).await.unwrap();
    session.login("u", "p").await.unwrap();

    let err = session.examine("INBOX").await.unwrap_err();
    assert!(matches!(err, Error::Io(_)));
}
