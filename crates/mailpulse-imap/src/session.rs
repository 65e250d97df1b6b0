//! IMAP session over a single connection.
//!
//! A session tracks the protocol state at runtime rather than in the type,
//! so callers can always reach [`Session::logout`] after a failed command
//! and release the connection cleanly.

#![allow(clippy::missing_errors_doc)]

use tokio::io::{AsyncRead, AsyncWrite};

use crate::fetch::FetchedMessage;
use crate::framed::FramedStream;
use crate::response::{Response, Status, Untagged, capabilities_from_code, parse_response};
use crate::stream::ImapStream;
use crate::{Error, Result};

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

/// Protocol state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Greeting received, not logged in.
    NotAuthenticated,
    /// Logged in, no mailbox open.
    Authenticated,
    /// A mailbox is open.
    Selected,
    /// LOGOUT completed or the server said BYE.
    LoggedOut,
}

/// An IMAP connection and its protocol state.
pub struct Session<S> {
    stream: FramedStream<S>,
    next_tag: u32,
    state: SessionState,
    capabilities: Vec<String>,
}

impl<S> std::fmt::Debug for Session<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("next_tag", &self.next_tag)
            .field("state", &self.state)
            .field("capabilities", &self.capabilities)
            .finish_non_exhaustive()
    }
}

impl Session<ImapStream> {
    /// Connects, reads the greeting and negotiates TLS per `security`.
    pub async fn connect(host: &str, port: u16, security: Security) -> Result<Self> {
        match security {
            Security::Tls => Self::from_stream(ImapStream::connect_tls(host, port).await?).await,
            Security::None => {
                Self::from_stream(ImapStream::connect_plain(host, port).await?).await
            }
            Security::StartTls => {
                let mut session =
                    Self::from_stream(ImapStream::connect_plain(host, port).await?).await?;
                if session.capabilities.is_empty() {
                    session.capability().await?;
                }
                if session.has_capability("STARTTLS") {
                    session.starttls(host).await
                } else {
                    tracing::warn!(host, "server does not offer STARTTLS, continuing in plaintext");
                    Ok(session)
                }
            }
        }
    }

    /// Issues STARTTLS and performs the TLS handshake.
    pub async fn starttls(mut self, host: &str) -> Result<Self> {
        if self.state != SessionState::NotAuthenticated {
            return Err(Error::InvalidState(
                "STARTTLS is only valid before login".to_string(),
            ));
        }
        self.execute("STARTTLS").await?;

        let stream = self.stream.into_inner()?.upgrade(host).await?;
        Ok(Self {
            stream: FramedStream::new(stream),
            next_tag: self.next_tag,
            state: self.state,
            // Capabilities learned before TLS must be discarded.
            capabilities: Vec::new(),
        })
    }
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Reads the server greeting from a freshly connected stream.
    pub async fn from_stream(stream: S) -> Result<Self> {
        let mut stream = FramedStream::new(stream);
        let greeting = parse_response(&stream.read_response().await?)?;

        let Response::Untagged(Untagged::Status { status, code, text }) = greeting else {
            return Err(Error::Protocol("expected untagged greeting".to_string()));
        };
        let state = match status {
            Status::Ok => SessionState::NotAuthenticated,
            Status::PreAuth => SessionState::Authenticated,
            Status::Bye => return Err(Error::Bye(text)),
            Status::No | Status::Bad => {
                return Err(Error::Protocol(format!("unexpected greeting: {text}")));
            }
        };

        Ok(Self {
            stream,
            next_tag: 0,
            state,
            capabilities: code
                .as_deref()
                .and_then(capabilities_from_code)
                .unwrap_or_default(),
        })
    }

    /// Returns the current protocol state.
    #[must_use]
    pub const fn state(&self) -> SessionState {
        self.state
    }

    /// Returns the capabilities last announced by the server.
    #[must_use]
    pub fn capabilities(&self) -> &[String] {
        &self.capabilities
    }

    /// Checks a capability by name, case-insensitively.
    #[must_use]
    pub fn has_capability(&self, name: &str) -> bool {
        self.capabilities.iter().any(|c| c.eq_ignore_ascii_case(name))
    }

    /// Requests the capability list.
    pub async fn capability(&mut self) -> Result<&[String]> {
        self.execute("CAPABILITY").await?;
        Ok(&self.capabilities)
    }

    /// Authenticates with LOGIN.
    pub async fn login(&mut self, username: &str, password: &str) -> Result<()> {
        self.require(SessionState::NotAuthenticated, "LOGIN")?;
        if self.has_capability("LOGINDISABLED") {
            return Err(Error::InvalidState(
                "server disabled LOGIN on this connection".to_string(),
            ));
        }

        let command = format!("LOGIN {} {}", quote(username)?, quote(password)?);
        self.execute(&command).await?;
        self.state = SessionState::Authenticated;
        Ok(())
    }

    /// Opens a mailbox read-only and returns its message count.
    pub async fn examine(&mut self, mailbox: &str) -> Result<u32> {
        if !matches!(
            self.state,
            SessionState::Authenticated | SessionState::Selected
        ) {
            return Err(Error::InvalidState(format!(
                "EXAMINE requires authentication (state: {:?})",
                self.state
            )));
        }

        let untagged = self.execute(&format!("EXAMINE {}", quote(mailbox)?)).await?;
        self.state = SessionState::Selected;

        Ok(untagged
            .iter()
            .rev()
            .find_map(|u| match u {
                Untagged::Exists(n) => Some(*n),
                _ => None,
            })
            .unwrap_or(0))
    }

    /// Runs `UID SEARCH` and returns matching UIDs.
    pub async fn uid_search(&mut self, criteria: &str) -> Result<Vec<u32>> {
        self.require(SessionState::Selected, "UID SEARCH")?;

        let untagged = self.execute(&format!("UID SEARCH {criteria}")).await?;
        Ok(untagged
            .into_iter()
            .filter_map(|u| match u {
                Untagged::Search(ids) => Some(ids),
                _ => None,
            })
            .flatten()
            .collect())
    }

    /// Runs `UID FETCH` for the given UIDs and data items, e.g.
    /// `(UID FLAGS ENVELOPE)`.
    pub async fn uid_fetch(&mut self, uids: &[u32], items: &str) -> Result<Vec<FetchedMessage>> {
        self.require(SessionState::Selected, "UID FETCH")?;
        if uids.is_empty() {
            return Ok(Vec::new());
        }

        let set = uids
            .iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join(",");
        let untagged = self.execute(&format!("UID FETCH {set} {items}")).await?;

        untagged
            .into_iter()
            .filter_map(|u| match u {
                Untagged::Fetch { seq, attributes } => {
                    Some(FetchedMessage::from_attributes(seq, &attributes))
                }
                _ => None,
            })
            .collect()
    }

    /// Ends the session with LOGOUT.
    pub async fn logout(&mut self) -> Result<()> {
        if self.state == SessionState::LoggedOut {
            return Ok(());
        }
        let result = self.execute("LOGOUT").await.map(|_| ());
        self.state = SessionState::LoggedOut;
        result
    }

    fn require(&self, state: SessionState, command: &str) -> Result<()> {
        if self.state == state {
            Ok(())
        } else {
            Err(Error::InvalidState(format!(
                "{command} requires {state:?} (state: {:?})",
                self.state
            )))
        }
    }

    /// Sends one tagged command and returns the untagged responses it produced.
    async fn execute(&mut self, command: &str) -> Result<Vec<Untagged>> {
        let tag = format!("A{:04}", self.next_tag);
        self.next_tag += 1;

        tracing::trace!(%tag, command = redact(command), "IMAP command");
        self.stream
            .send(format!("{tag} {command}\r\n").as_bytes())
            .await?;

        let mut untagged = Vec::new();
        for raw in self.stream.read_until_tagged(&tag).await? {
            match parse_response(&raw)? {
                Response::Tagged { status, text, .. } => {
                    self.absorb_code(&text);
                    return match status {
                        Status::Ok => Ok(untagged),
                        Status::No => Err(Error::No(text)),
                        Status::Bad => Err(Error::Bad(text)),
                        Status::Bye | Status::PreAuth => Err(Error::Protocol(format!(
                            "unexpected tagged status for {tag}: {text}"
                        ))),
                    };
                }
                Response::Untagged(Untagged::Capability(caps)) => self.capabilities = caps,
                Response::Untagged(Untagged::Status {
                    status: Status::Bye,
                    ..
                }) => self.state = SessionState::LoggedOut,
                Response::Untagged(other) => untagged.push(other),
                Response::Continuation(_) => {
                    return Err(Error::Protocol(format!(
                        "unexpected continuation request for {tag}"
                    )));
                }
            }
        }

        Err(Error::Protocol(format!("missing tagged response for {tag}")))
    }

    fn absorb_code(&mut self, text: &str) {
        let Some(inner) = text.strip_prefix('[') else {
            return;
        };
        if let Some(caps) = inner
            .split_once(']')
            .and_then(|(code, _)| capabilities_from_code(code))
        {
            self.capabilities = caps;
        }
    }
}

/// Quotes a string argument.
fn quote(value: &str) -> Result<String> {
    if value.contains(['\r', '\n', '\0']) {
        return Err(Error::Protocol(
            "argument contains line breaks or NUL".to_string(),
        ));
    }
    Ok(format!(
        "\"{}\"",
        value.replace('\\', "\\\\").replace('"', "\\\"")
    ))
}

fn redact(command: &str) -> &str {
    if command.starts_with("LOGIN ") {
        "LOGIN <redacted>"
    } else {
        command
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
    use tokio_test::io::Builder;

    #[test]
    fn quoting() {
        assert_eq!(quote("INBOX").unwrap(), "\"INBOX\"");
        assert_eq!(quote("p\"w\\d").unwrap(), "\"p\\\"w\\\\d\"");
        assert!(quote("a\r\nb").is_err());
    }

    #[test]
    fn login_is_redacted() {
        assert_eq!(redact("LOGIN \"u\" \"secret\""), "LOGIN <redacted>");
        assert_eq!(redact("CAPABILITY"), "CAPABILITY");
    }

    #[tokio::test]
    async fn greeting_bye_is_rejected() {
        let mock = Builder::new().read(b"* BYE too many connections\r\n").build();
        let err = Session::from_stream(mock).await.unwrap_err();
        assert!(matches!(err, Error::Bye(_)));
    }

    #[tokio::test]
    async fn preauth_greeting_skips_login() {
        let mock = Builder::new().read(b"* PREAUTH welcome back\r\n").build();
        let session = Session::from_stream(mock).await.unwrap();
        assert_eq!(session.state(), SessionState::Authenticated);
    }

    #[tokio::test]
    async fn login_examine_search() {
        let mock = Builder::new()
            .read(b"* OK [CAPABILITY IMAP4rev1 AUTH=PLAIN] ready\r\n")
            .write(b"A0000 LOGIN \"user\" \"pass\"\r\n")
            .read(b"A0000 OK [CAPABILITY IMAP4rev1 IDLE] logged in\r\n")
            .write(b"A0001 EXAMINE \"INBOX\"\r\n")
            .read(b"* 3 EXISTS\r\n* 0 RECENT\r\n")
            .read(b"A0001 OK [READ-ONLY] done\r\n")
            .write(b"A0002 UID SEARCH UNSEEN\r\n")
            .read(b"* SEARCH 5 9\r\n")
            .read(b"A0002 OK done\r\n")
            .build();

        let mut session = Session::from_stream(mock).await.unwrap();
        assert!(session.has_capability("auth=plain"));

        session.login("user", "pass").await.unwrap();
        assert!(session.has_capability("IDLE"));

        assert_eq!(session.examine("INBOX").await.unwrap(), 3);
        assert_eq!(session.state(), SessionState::Selected);
        assert_eq!(session.uid_search("UNSEEN").await.unwrap(), vec![5, 9]);
    }

    #[tokio::test]
    async fn login_failure_keeps_state() {
        let mock = Builder::new()
            .read(b"* OK ready\r\n")
            .write(b"A0000 LOGIN \"user\" \"wrong\"\r\n")
            .read(b"A0000 NO [AUTHENTICATIONFAILED] invalid credentials\r\n")
            .write(b"A0001 LOGOUT\r\n")
            .read(b"* BYE logging out\r\nA0001 OK bye\r\n")
            .build();

        let mut session = Session::from_stream(mock).await.unwrap();
        let err = session.login("user", "wrong").await.unwrap_err();
        assert!(matches!(err, Error::No(_)));
        assert_eq!(session.state(), SessionState::NotAuthenticated);

        session.logout().await.unwrap();
        assert_eq!(session.state(), SessionState::LoggedOut);
        // Second logout is a no-op.
        session.logout().await.unwrap();
    }

    #[tokio::test]
    async fn search_requires_selected_mailbox() {
        let mock = Builder::new().read(b"* PREAUTH hi\r\n").build();
        let mut session = Session::from_stream(mock).await.unwrap();
        let err = session.uid_search("ALL").await.unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
    }

    #[tokio::test]
    async fn fetch_with_empty_set_sends_nothing() {
        let mock = Builder::new()
            .read(b"* PREAUTH hi\r\n")
            .write(b"A0000 EXAMINE \"INBOX\"\r\n")
            .read(b"A0000 OK done\r\n")
            .build();
        let mut session = Session::from_stream(mock).await.unwrap();
        assert_eq!(session.examine("INBOX").await.unwrap(), 0);
        assert!(session.uid_fetch(&[], "(UID)").await.unwrap().is_empty());
    }
}
