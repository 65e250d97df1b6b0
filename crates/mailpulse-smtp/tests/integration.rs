//! Integration tests for the SMTP client.

#![allow(clippy::unwrap_used)]

use std::io::{self, Cursor};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use mailpulse_smtp::{Address, Client, Error};

/// Mock stream that returns predefined replies and records commands.
struct MockStream {
    replies: Cursor<Vec<u8>>,
    sent: Arc<Mutex<Vec<u8>>>,
}

impl MockStream {
    fn new(replies: &[u8]) -> (Self, Arc<Mutex<Vec<u8>>>) {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let stream = Self {
            replies: Cursor::new(replies.to_vec()),
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
        let pos = usize::try_from(self.replies.position()).unwrap();
        let data = self.replies.get_ref();
        if pos >= data.len() {
            return Poll::Ready(Ok(()));
        }

        let to_read = (data.len() - pos).min(buf.remaining());
        buf.put_slice(&data[pos..pos + to_read]);
        self.replies.set_position((pos + to_read) as u64);
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
async fn login_fallback_and_dot_stuffed_data() {
    let (stream, sent) = MockStream::new(
        b"220 mx.example.org ESMTP\r\n\
250-mx.example.org\r\n\
250-SIZE 35882577\r\n\
250 AUTH LOGIN\r\n\
334 VXNlcm5hbWU6\r\n\
334 UGFzc3dvcmQ6\r\n\
235 2.7.0 Authentication successful\r\n\
250 2.1.0 Ok\r\n\
250 2.1.5 Ok\r\n\
250 2.1.5 Ok\r\n\
354 End data with <CR><LF>.<CR><LF>\r\n\
250 2.0.0 Ok: queued\r\n\
221 2.0.0 Bye\r\n",
    );

    let mut client = Client::from_stream(stream).await.unwrap();
    client.ehlo("mailpulse").await.unwrap();
    assert!(client.supports("size"));
    assert_eq!(client.auth_mechanisms(), vec!["LOGIN".to_string()]);

    client.authenticate("bob", "hunter2").await.unwrap();

    let from = Address::new("bob@example.org").unwrap();
    let to = [
        Address::new("ann@example.com").unwrap(),
        Address::new("cat@example.net").unwrap(),
    ];
    client
        .send_mail(&from, &to, b"Subject: dots\n\n.leading dot\nplain\n")
        .await
        .unwrap();
    client.quit().await.unwrap();

    assert_eq!(
        sent_text(&sent),
        "EHLO mailpulse\r\n\
AUTH LOGIN\r\n\
Ym9i\r\n\
aHVudGVyMg==\r\n\
MAIL FROM:<bob@example.org>\r\n\
RCPT TO:<ann@example.com>\r\n\
RCPT TO:<cat@example.net>\r\n\
DATA\r\n\
Subject: dots\r\n\
\r\n\
..leading dot\r\n\
plain\r\n\
.\r\n\
QUIT\r\n"
    );
}

#[tokio::test]
async fn rejected_recipient_is_permanent() {
    let (stream, sent) = MockStream::new(
        b"220 ready\r\n250 sender ok\r\n550 5.1.1 no such user\r\n221 bye\r\n",
    );
    let mut client = Client::from_stream(stream).await.unwrap();

    let from = Address::new("a@example.org").unwrap();
    let to = [Address::new("ghost@example.org").unwrap()];
    let err = client.send_mail(&from, &to, b"x").await.unwrap_err();
    assert!(err.is_permanent());
    assert!(matches!(err, Error::Reply { code: 550, .. }));

    client.quit().await.unwrap();
    assert!(sent_text(&sent).ends_with("QUIT\r\n"));
}

#[tokio::test]
async fn no_usable_mechanism() {
    let (stream, _) = MockStream::new(b"220 ready\r\n250-host\r\n250 AUTH CRAM-MD5 XOAUTH2\r\n");
    let mut client = Client::from_stream(stream).await.unwrap();
    client.ehlo("mailpulse").await.unwrap();

    let err = client.authenticate("u", "p").await.unwrap_err();
    assert!(matches!(err, Error::NotSupported(_)));
}

#[tokio::test]
async fn greylisting_is_transient() {
    let (stream, _) = MockStream::new(b"220 ready\r\n451 4.7.1 try again later\r\n");
    let mut client = Client::from_stream(stream).await.unwrap();

    let from = Address::new("a@example.org").unwrap();
    let to = [Address::new("b@example.org").unwrap()];
    let err = client.send_mail(&from, &to, b"x").await.unwrap_err();
    assert!(err.is_transient());
}
