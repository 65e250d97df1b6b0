//! SMTP client session.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use crate::address::Address;
use crate::error::{Error, Result};
use crate::reply::{Reply, is_last_line, parse_reply};
use crate::stream::SmtpStream;

/// Transport security for a new connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Security {
    /// Plaintext only.
    None,
    /// TLS from the first byte.
    #[default]
    Tls,
    /// Upgrade with STARTTLS when the server advertises it.
    StartTls,
}

/// Longest reply line accepted.
const MAX_REPLY_LINE: usize = 4096;

/// An SMTP session on one connection.
///
/// Commands take `&mut self`, so [`Client::quit`] stays reachable after a
/// failed transaction.
pub struct Client<S> {
    stream: BufReader<S>,
    extensions: Vec<String>,
}

impl<S> std::fmt::Debug for Client<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("extensions", &self.extensions)
            .finish_non_exhaustive()
    }
}

impl Client<SmtpStream> {
    /// Connects, reads the greeting, sends EHLO and negotiates TLS per
    /// `security`.
    ///
    /// # Errors
    ///
    /// Returns an error if any step fails.
    pub async fn connect(
        host: &str,
        port: u16,
        security: Security,
        client_name: &str,
    ) -> Result<Self> {
        let stream = match security {
            Security::Tls => SmtpStream::connect_tls(host, port).await?,
            Security::None | Security::StartTls => SmtpStream::connect(host, port).await?,
        };
        let mut client = Self::from_stream(stream).await?;
        client.ehlo(client_name).await?;

        if security != Security::StartTls {
            return Ok(client);
        }
        if !client.supports("STARTTLS") {
            tracing::warn!(host, "server does not offer STARTTLS, continuing in plaintext");
            return Ok(client);
        }
        let mut client = client.starttls(host).await?;
        client.ehlo(client_name).await?;
        Ok(client)
    }

    /// Issues STARTTLS and performs the TLS handshake.
    ///
    /// Extensions must be rediscovered with [`Client::ehlo`] afterwards.
    ///
    /// # Errors
    ///
    /// Returns an error if the server refuses or the handshake fails.
    pub async fn starttls(mut self, host: &str) -> Result<Self> {
        let reply = self.command("STARTTLS").await?;
        if !reply.is_positive() {
            return Err(reply.into_error());
        }
        if !self.stream.buffer().is_empty() {
            return Err(Error::Protocol(
                "unexpected data buffered before TLS negotiation".into(),
            ));
        }

        let stream = self.stream.into_inner().upgrade(host).await?;
        Ok(Self {
            stream: BufReader::new(stream),
            extensions: Vec::new(),
        })
    }
}

impl<S> Client<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Reads the 220 greeting from a connected stream.
    ///
    /// # Errors
    ///
    /// Returns an error if the greeting is missing or negative.
    pub async fn from_stream(stream: S) -> Result<Self> {
        let mut client = Self {
            stream: BufReader::new(stream),
            extensions: Vec::new(),
        };
        let greeting = client.read_reply().await?;
        if greeting.code != 220 {
            return Err(greeting.into_error());
        }
        Ok(client)
    }

    /// Sends EHLO and records the advertised extensions.
    ///
    /// # Errors
    ///
    /// Returns an error if the server rejects EHLO.
    pub async fn ehlo(&mut self, client_name: &str) -> Result<()> {
        let reply = self.command(&format!("EHLO {client_name}")).await?;
        if !reply.is_positive() {
            return Err(reply.into_error());
        }
        self.extensions = reply.lines.into_iter().skip(1).collect();
        Ok(())
    }

    /// Checks whether an EHLO keyword was advertised.
    #[must_use]
    pub fn supports(&self, keyword: &str) -> bool {
        self.extensions.iter().any(|ext| {
            ext.split_ascii_whitespace()
                .next()
                .is_some_and(|k| k.eq_ignore_ascii_case(keyword))
        })
    }

    /// Returns the SASL mechanisms from the `AUTH` extension.
    #[must_use]
    pub fn auth_mechanisms(&self) -> Vec<String> {
        self.extensions
            .iter()
            .filter_map(|ext| {
                let mut words = ext.split_ascii_whitespace();
                let keyword = words.next()?;
                keyword
                    .eq_ignore_ascii_case("AUTH")
                    .then(|| words.map(str::to_ascii_uppercase).collect::<Vec<_>>())
            })
            .flatten()
            .collect()
    }

    /// Authenticates with PLAIN, or LOGIN when only LOGIN is offered.
    ///
    /// # Errors
    ///
    /// Returns an error if no usable mechanism exists or credentials are
    /// rejected.
    pub async fn authenticate(&mut self, username: &str, password: &str) -> Result<()> {
        let mechanisms = self.auth_mechanisms();
        if mechanisms.is_empty() || mechanisms.iter().any(|m| m == "PLAIN") {
            self.auth_plain(username, password).await
        } else if mechanisms.iter().any(|m| m == "LOGIN") {
            self.auth_login(username, password).await
        } else {
            Err(Error::NotSupported(format!(
                "AUTH PLAIN or LOGIN (server offers {})",
                mechanisms.join(" ")
            )))
        }
    }

    /// Authenticates with `AUTH PLAIN` and an initial response.
    ///
    /// # Errors
    ///
    /// Returns an error if the credentials are rejected.
    pub async fn auth_plain(&mut self, username: &str, password: &str) -> Result<()> {
        let token = STANDARD.encode(format!("\0{username}\0{password}"));
        let reply = self.command_secret(&format!("AUTH PLAIN {token}")).await?;
        if reply.code == 235 {
            Ok(())
        } else {
            Err(reply.into_error())
        }
    }

    /// Authenticates with the `AUTH LOGIN` challenge exchange.
    ///
    /// # Errors
    ///
    /// Returns an error if any challenge step is rejected.
    pub async fn auth_login(&mut self, username: &str, password: &str) -> Result<()> {
        for step in ["AUTH LOGIN".to_string(), STANDARD.encode(username)] {
            let reply = self.command_secret(&step).await?;
            if reply.code != 334 {
                return Err(reply.into_error());
            }
        }
        let reply = self.command_secret(&STANDARD.encode(password)).await?;
        if reply.code == 235 {
            Ok(())
        } else {
            Err(reply.into_error())
        }
    }

    /// Runs one mail transaction: MAIL FROM, RCPT TO for each recipient,
    /// DATA and the message itself.
    ///
    /// Line endings are normalized to CRLF and leading dots are stuffed.
    ///
    /// # Errors
    ///
    /// Returns an error if there are no recipients or the server rejects any
    /// step.
    pub async fn send_mail(&mut self, from: &Address, to: &[Address], message: &[u8]) -> Result<()> {
        if to.is_empty() {
            return Err(Error::InvalidAddress("no recipients".into()));
        }

        self.expect_positive(&format!("MAIL FROM:<{from}>")).await?;
        for recipient in to {
            self.expect_positive(&format!("RCPT TO:<{recipient}>")).await?;
        }

        let reply = self.command("DATA").await?;
        if reply.code != 354 {
            return Err(reply.into_error());
        }

        self.stream.get_mut().write_all(&dot_stuff(message)).await?;
        self.stream.get_mut().flush().await?;

        let reply = self.read_reply().await?;
        if !reply.is_positive() {
            return Err(reply.into_error());
        }
        tracing::debug!(recipients = to.len(), reply = %reply.text(), "message accepted");
        Ok(())
    }

    /// Sends QUIT.
    ///
    /// # Errors
    ///
    /// Returns an error if the exchange fails.
    pub async fn quit(&mut self) -> Result<()> {
        let reply = self.command("QUIT").await?;
        if reply.code == 221 || reply.is_positive() {
            Ok(())
        } else {
            Err(reply.into_error())
        }
    }

    async fn expect_positive(&mut self, line: &str) -> Result<Reply> {
        let reply = self.command(line).await?;
        if reply.is_positive() {
            Ok(reply)
        } else {
            Err(reply.into_error())
        }
    }

    async fn command(&mut self, line: &str) -> Result<Reply> {
        tracing::trace!(command = line, "SMTP command");
        self.write_line(line).await?;
        self.read_reply().await
    }

    async fn command_secret(&mut self, line: &str) -> Result<Reply> {
        tracing::trace!(command = "<credentials>", "SMTP command");
        self.write_line(line).await?;
        self.read_reply().await
    }

    async fn write_line(&mut self, line: &str) -> Result<()> {
        let stream = self.stream.get_mut();
        stream.write_all(line.as_bytes()).await?;
        stream.write_all(b"\r\n").await?;
        stream.flush().await?;
        Ok(())
    }

    async fn read_reply(&mut self) -> Result<Reply> {
        let mut lines = Vec::new();
        let mut raw = Vec::with_capacity(128);
        loop {
            raw.clear();
            let limit = (MAX_REPLY_LINE + 1) as u64;
            let read = (&mut self.stream).take(limit).read_until(b'\n', &mut raw).await?;
            if !raw.ends_with(b"\n") {
                if read > MAX_REPLY_LINE {
                    return Err(Error::Protocol("reply line too long".into()));
                }
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed",
                )));
            }

            let text = raw.strip_suffix(b"\n").unwrap_or(&raw);
            let text = text.strip_suffix(b"\r").unwrap_or(text);
            let line = String::from_utf8_lossy(text).into_owned();
            let last = is_last_line(&line);
            lines.push(line);
            if last {
                return parse_reply(&lines);
            }
        }
    }
}

/// Normalizes line endings to CRLF, stuffs leading dots and appends the
/// terminating `.` line.
fn dot_stuff(message: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(message.len() + 64);
    let body = message.strip_suffix(b"\n").unwrap_or(message);

    if !body.is_empty() {
        for line in body.split(|&b| b == b'\n') {
            let line = line.strip_suffix(b"\r").unwrap_or(line);
            if line.first() == Some(&b'.') {
                out.push(b'.');
            }
            out.extend_from_slice(line);
            out.extend_from_slice(b"\r\n");
        }
    }

    out.extend_from_slice(b".\r\n");
    out
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
    use tokio_test::io::Builder;

    #[test]
    fn dot_stuffing_and_crlf() {
        assert_eq!(dot_stuff(b"a\n.b\r\nc\n"), b"a\r\n..b\r\nc\r\n.\r\n");
        assert_eq!(dot_stuff(b""), b".\r\n");
        assert_eq!(dot_stuff(b"."), b"..\r\n.\r\n");
    }

    #[tokio::test]
    async fn rejects_bad_greeting() {
        let mock = Builder::new().read(b"554 go away\r\n").build();
        let err = Client::from_stream(mock).await.unwrap_err();
        assert!(err.is_permanent());
    }

    #[tokio::test]
    async fn oversized_reply_line_is_rejected() {
        let mut greeting = b"220 ".to_vec();
        greeting.extend(vec![b'x'; 5000]);
        let mock = Builder::new().read(&greeting).build();
        let err = Client::from_stream(mock).await.unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[tokio::test]
    async fn reply_text_need_not_be_utf8() {
        let mock = Builder::new().read(b"554 r\xe9fus\xe9\r\n").build();
        let err = Client::from_stream(mock).await.unwrap_err();
        match err {
            Error::Reply { code, message } => {
                assert_eq!(code, 554);
                assert_eq!(message, "r\u{fffd}fus\u{fffd}");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn truncated_reply_is_eof() {
        let mock = Builder::new().read(b"220 mx ESMTP").build();
        let err = Client::from_stream(mock).await.unwrap_err();
        assert!(matches!(err, Error::Io(ref e) if e.kind() == std::io::ErrorKind::UnexpectedEof));
    }

    #[tokio::test]
    async fn ehlo_lists_extensions() {
        let mock = Builder::new()
            .read(b"220 mx ESMTP\r\n")
            .write(b"EHLO client\r\n")
            .read(b"250-mx\r\n250-AUTH LOGIN xoauth2\r\n250-8BITMIME\r\n250 STARTTLS\r\n")
            .build();
        let mut client = Client::from_stream(mock).await.unwrap();
        client.ehlo("client").await.unwrap();

        assert!(client.supports("starttls"));
        assert!(client.supports("8BITMIME"));
        assert!(!client.supports("SMTPUTF8"));
        assert_eq!(client.auth_mechanisms(), vec!["LOGIN", "XOAUTH2"]);
    }

    #[tokio::test]
    async fn login_mechanism_when_plain_missing() {
        let mock = Builder::new()
            .read(b"220 mx\r\n")
            .write(b"EHLO c\r\n")
            .read(b"250-mx\r\n250 AUTH LOGIN\r\n")
            .write(b"AUTH LOGIN\r\n")
            .read(b"334 VXNlcm5hbWU6\r\n")
            .write(b"dXNlcg==\r\n")
            .read(b"334 UGFzc3dvcmQ6\r\n")
            .write(b"cGFzcw==\r\n")
            .read(b"235 ok\r\n")
            .build();
        let mut client = Client::from_stream(mock).await.unwrap();
        client.ehlo("c").await.unwrap();
        client.authenticate("user", "pass").await.unwrap();
    }

    #[tokio::test]
    async fn plain_auth_failure() {
        let mock = Builder::new()
            .read(b"220 mx\r\n")
            .write(b"AUTH PLAIN AHVzZXIAcGFzcw==\r\n")
            .read(b"535 5.7.8 bad credentials\r\n")
            .build();
        let mut client = Client::from_stream(mock).await.unwrap();
        let err = client.authenticate("user", "pass").await.unwrap_err();
        assert!(matches!(err, Error::Reply { code: 535, .. }));
    }

    #[tokio::test]
    async fn full_transaction() {
        let mock = Builder::new()
            .read(b"220 mx\r\n")
            .write(b"MAIL FROM:<a@example.com>\r\n")
            .read(b"250 ok\r\n")
            .write(b"RCPT TO:<b@example.com>\r\n")
            .read(b"250 ok\r\n")
            .write(b"DATA\r\n")
            .read(b"354 go ahead\r\n")
            .write(b"Subject: hi\r\n\r\n..dot\r\n.\r\n")
            .read(b"250 queued\r\n")
            .write(b"QUIT\r\n")
            .read(b"221 bye\r\n")
            .build();
        let mut client = Client::from_stream(mock).await.unwrap();
        let from = Address::new("a@example.com").unwrap();
        let to = [Address::new("b@example.com").unwrap()];

        client
            .send_mail(&from, &to, b"Subject: hi\n\n.dot\n")
            .await
            .unwrap();
        client.quit().await.unwrap();
    }

    #[tokio::test]
    async fn rejected_recipient() {
        let mock = Builder::new()
            .read(b"220 mx\r\n")
            .write(b"MAIL FROM:<a@example.com>\r\n")
            .read(b"250 ok\r\n")
            .write(b"RCPT TO:<nobody@example.com>\r\n")
            .read(b"550 5.1.1 unknown user\r\n")
            .build();
        let mut client = Client::from_stream(mock).await.unwrap();
        let from = Address::new("a@example.com").unwrap();
        let to = [Address::new("nobody@example.com").unwrap()];

        let err = client.send_mail(&from, &to, b"x").await.unwrap_err();
        assert!(err.is_permanent());
    }
}
