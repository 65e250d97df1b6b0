//! Line framing for the IMAP wire format.
//!
//! Responses are CRLF-terminated lines that may embed literals of the form
//! `{n}\r\n<n bytes>`. A response is only complete once every literal it
//! announces has been read and the final line has been terminated.

#![allow(clippy::missing_errors_doc)]

use std::io;

use bytes::BytesMut;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use crate::{Error, Result};

const BUFFER_SIZE: usize = 8192;

/// Longest response line accepted before giving up (1 MiB).
const MAX_LINE_LENGTH: usize = 1024 * 1024;

/// Largest literal accepted (64 MiB), enough for any message body we preview.
const MAX_LITERAL_SIZE: usize = 64 * 1024 * 1024;

/// Buffered reader/writer speaking IMAP framing over any async stream.
pub struct FramedStream<S> {
    inner: BufReader<S>,
    out: BytesMut,
}

impl<S> FramedStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wraps a connected stream.
    pub fn new(stream: S) -> Self {
        Self {
            inner: BufReader::with_capacity(BUFFER_SIZE, stream),
            out: BytesMut::with_capacity(BUFFER_SIZE),
        }
    }

    /// Reads one complete response, literals included.
    pub async fn read_response(&mut self) -> Result<Vec<u8>> {
        let mut response = Vec::new();

        loop {
            let start = response.len();
            let limit = (MAX_LINE_LENGTH + 1) as u64;
            let read = (&mut self.inner)
                .take(limit)
                .read_until(b'\n', &mut response)
                .await?;

            let line = &response[start..];
            if !line.ends_with(b"\n") {
                if read > MAX_LINE_LENGTH {
                    return Err(Error::Protocol("line too long".to_string()));
                }
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed",
                )));
            }

            let Some(len) = literal_length(line) else {
                break;
            };
            if len > MAX_LITERAL_SIZE {
                return Err(Error::Protocol(format!(
                    "literal too large: {len} bytes (max {MAX_LITERAL_SIZE})"
                )));
            }

            let offset = response.len();
            response.resize(offset + len, 0);
            self.inner.read_exact(&mut response[offset..]).await?;
        }

        Ok(response)
    }

    /// Reads responses until the tagged completion for `tag` arrives.
    ///
    /// The tagged line is the last element of the returned vector.
    pub async fn read_until_tagged(&mut self, tag: &str) -> Result<Vec<Vec<u8>>> {
        let mut responses = Vec::new();
        loop {
            let response = self.read_response().await?;
            let done = is_tagged(&response, tag);
            responses.push(response);
            if done {
                return Ok(responses);
            }
        }
    }

    /// Writes and flushes raw command bytes.
    pub async fn send(&mut self, data: &[u8]) -> Result<()> {
        self.out.clear();
        self.out.extend_from_slice(data);

        let stream = self.inner.get_mut();
        stream.write_all(&self.out).await?;
        stream.flush().await?;
        Ok(())
    }

    /// Gives back the underlying stream, e.g. to start a TLS handshake.
    ///
    /// Fails if the server already sent bytes that were buffered but not
    /// consumed, since those would be lost.
    pub fn into_inner(self) -> Result<S> {
        if !self.inner.buffer().is_empty() {
            return Err(Error::Protocol(
                "unexpected data buffered before TLS negotiation".to_string(),
            ));
        }
        Ok(self.inner.into_inner())
    }
}

fn is_tagged(response: &[u8], tag: &str) -> bool {
    response.starts_with(tag.as_bytes()) && response.get(tag.len()) == Some(&b' ')
}

/// Parses a trailing literal announcement such as `{123}` or `{123+}`.
fn literal_length(line: &[u8]) -> Option<usize> {
    let line = line.strip_suffix(b"\n")?;
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    let line = line.strip_suffix(b"}")?;
    let line = line.strip_suffix(b"+").unwrap_or(line);
    let open = line.iter().rposition(|&b| b == b'{')?;
    let digits = &line[open + 1..];
    if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
        return None;
    }
    std::str::from_utf8(digits).ok()?.parse().ok()
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
    fn literal_length_forms() {
        assert_eq!(literal_length(b"BODY[] {42}\r\n"), Some(42));
        assert_eq!(literal_length(b"BODY[] {42+}\r\n"), Some(42));
        assert_eq!(literal_length(b"{0}\n"), Some(0));
        assert_eq!(literal_length(b"* OK done\r\n"), None);
        assert_eq!(literal_length(b"weird {x1}\r\n"), None);
        assert_eq!(literal_length(b"empty {}\r\n"), None);
    }

    #[tokio::test]
    async fn reads_line_with_literal() {
        let mock = Builder::new()
            .read(b"* 3 FETCH (UID 9 BODY[] {5}\r\n")
            .read(b"hello)\r\n")
            .build();
        let mut framed = FramedStream::new(mock);

        let response = framed.read_response().await.unwrap();
        assert_eq!(response, b"* 3 FETCH (UID 9 BODY[] {5}\r\nhello)\r\n");
    }

    #[tokio::test]
    async fn literal_may_contain_crlf() {
        let mock = Builder::new()
            .read(b"* 1 FETCH (BODY[] {7}\r\na\r\nb\r\nc)\r\n")
            .build();
        let mut framed = FramedStream::new(mock);

        let response = framed.read_response().await.unwrap();
        assert!(response.ends_with(b"a\r\nb\r\nc)\r\n"));
    }

    #[tokio::test]
    async fn collects_until_tagged() {
        let mock = Builder::new()
            .read(b"* SEARCH 1 2\r\n")
            .read(b"* OK still here\r\n")
            .read(b"A0003 OK SEARCH completed\r\n")
            .build();
        let mut framed = FramedStream::new(mock);

        let responses = framed.read_until_tagged("A0003").await.unwrap();
        assert_eq!(responses.len(), 3);
        assert_eq!(responses[2], b"A0003 OK SEARCH completed\r\n");
    }

    #[tokio::test]
    async fn tag_prefix_is_not_a_match() {
        let mock = Builder::new()
            .read(b"A00031 OK other\r\n")
            .read(b"A0003 OK mine\r\n")
            .build();
        let mut framed = FramedStream::new(mock);

        let responses = framed.read_until_tagged("A0003").await.unwrap();
        assert_eq!(responses.len(), 2);
    }

    #[tokio::test]
    async fn eof_is_an_error() {
        let mock = Builder::new().read(b"* OK partial").build();
        let mut framed = FramedStream::new(mock);

        let err = framed.read_response().await.unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }

    #[tokio::test]
    async fn rejects_oversized_literal() {
        let header = format!("* 1 FETCH (BODY[] {{{}}}\r\n", MAX_LITERAL_SIZE + 1);
        let mock = Builder::new().read(header.as_bytes()).build();
        let mut framed = FramedStream::new(mock);

        let err = framed.read_response().await.unwrap_err();
        assert!(err.to_string().contains("literal too large"));
    }

    #[tokio::test]
    async fn writes_command_bytes() {
        let mock = Builder::new().write(b"A0000 CAPABILITY\r\n").build();
        let mut framed = FramedStream::new(mock);

        framed.send(b"A0000 CAPABILITY\r\n").await.unwrap();
    }
}
