//! One-shot SMTP sends and IMAP queries.
//!
//! Each call opens its own connection, does its work and closes the
//! connection again. Nothing is cached between calls.

use std::future::Future;

use mailpulse_imap::{ImapStream, Session};
use mailpulse_mime::{BodyKind, Mailbox, MessageBuilder};
use mailpulse_smtp::{Address, Client, SmtpStream};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;

use crate::config::{ImapSettings, SmtpSettings};
use crate::error::{Error, Result};
use crate::snapshot::{MessageSummary, PreviewError, preview_from_raw, select_most_recent};

/// Items fetched for every summary.
const SUMMARY_ITEMS: &str = "(UID FLAGS INTERNALDATE ENVELOPE)";

/// Items fetched for a preview; `PEEK` leaves `\Seen` untouched.
const BODY_ITEMS: &str = "(UID BODY.PEEK[])";

/// Name sent in EHLO.
const CLIENT_NAME: &str = "mailpulse";

/// A message to send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingEmail {
    /// Sender override; the configured identity is used when `None`.
    pub from: Option<String>,
    /// Recipient address.
    pub to: String,
    /// Subject line.
    pub subject: String,
    /// Body text.
    pub body: String,
    /// Whether `body` is HTML.
    pub is_html: bool,
}

impl OutgoingEmail {
    /// Creates an HTML message to `to`.
    #[must_use]
    pub fn new(to: impl Into<String>, subject: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            from: None,
            to: to.into(),
            subject: subject.into(),
            body: body.into(),
            is_html: true,
        }
    }

    /// Sends from `from` instead of the configured identity.
    #[must_use]
    pub fn sender(mut self, from: impl Into<String>) -> Self {
        self.from = Some(from.into());
        self
    }

    /// Marks the body as HTML or plain text.
    #[must_use]
    pub const fn html(mut self, is_html: bool) -> Self {
        self.is_html = is_html;
        self
    }

    /// Builds the RFC 5322 message and the envelope addresses.
    ///
    /// # Errors
    ///
    /// Returns an error if an address is malformed or the message cannot be
    /// composed.
    pub fn compose(&self, config: &SmtpSettings) -> Result<(Address, Address, Vec<u8>)> {
        let sender = match &self.from {
            Some(address) => Mailbox::new(address.trim()),
            None => {
                let mailbox = Mailbox::new(config.from_address.trim());
                match &config.from_display_name {
                    Some(name) => mailbox.with_name(name.as_str()),
                    None => mailbox,
                }
            }
        };

        let envelope_from = Address::new(sender.address.as_str())?;
        let recipient = Address::new(self.to.trim())?;
        let kind = if self.is_html { BodyKind::Html } else { BodyKind::Plain };

        let message = MessageBuilder::new(sender)
            .to(Mailbox::new(recipient.as_str()))
            .subject(self.subject.as_str())
            .body(self.body.as_str(), kind)
            .build()?;

        Ok((envelope_from, recipient, message))
    }
}

/// Performs single mail operations.
///
/// Implementations must not keep connections between calls.
pub trait MailTransport: Send + Sync {
    /// Sends one message.
    fn send(
        &self,
        email: &OutgoingEmail,
        config: &SmtpSettings,
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Counts unseen messages in the configured folder.
    fn query_unseen_count(
        &self,
        config: &ImapSettings,
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<u32>> + Send;

    /// Summarizes the `take` most recent messages in the configured folder.
    fn query_recent(
        &self,
        config: &ImapSettings,
        take: usize,
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<Vec<MessageSummary>>> + Send;
}

/// [`MailTransport`] over real network connections.
#[derive(Debug, Clone, Copy, Default)]
pub struct NetworkTransport;

impl MailTransport for NetworkTransport {
    async fn send(
        &self,
        email: &OutgoingEmail,
        config: &SmtpSettings,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let (from, to, message) = email.compose(config)?;
        cancellable(cancel, async {
            tracing::debug!(host = %config.host, port = config.port(), "connecting to SMTP server");
            let client = Client::<SmtpStream>::connect(
                &config.host,
                config.port(),
                config.protocol_security(),
                CLIENT_NAME,
            )
            .await?;
            send_on(client, config, &from, &to, &message).await
        })
        .await
    }

    async fn query_unseen_count(&self, config: &ImapSettings, cancel: &CancellationToken) -> Result<u32> {
        cancellable(cancel, async {
            let session = connect_imap(config).await?;
            count_unseen_on(session, config).await
        })
        .await
    }

    async fn query_recent(
        &self,
        config: &ImapSettings,
        take: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<MessageSummary>> {
        cancellable(cancel, async {
            let session = connect_imap(config).await?;
            recent_on(session, config, take).await
        })
        .await
    }
}

/// Runs `operation` unless `cancel` fires first.
///
/// A cancelled operation is dropped, which closes its connection.
pub async fn cancellable<T>(
    cancel: &CancellationToken,
    operation: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(Error::Cancelled),
        result = operation => result,
    }
}

async fn connect_imap(config: &ImapSettings) -> Result<Session<ImapStream>> {
    tracing::debug!(host = %config.host, port = config.port(), "connecting to IMAP server");
    Ok(Session::connect(&config.host, config.port(), config.protocol_security()).await?)
}

/// Authenticates and sends on an established SMTP session, then quits.
///
/// QUIT is sent even when the transaction failed; its own failure is
/// logged and dropped.
///
/// # Errors
///
/// Returns the first authentication or transaction error.
pub async fn send_on<S>(
    mut client: Client<S>,
    config: &SmtpSettings,
    from: &Address,
    to: &Address,
    message: &[u8],
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let result: Result<_> = async {
        if let Some((username, password)) = config.credentials() {
            client.authenticate(username, password).await?;
        }
        client.send_mail(from, std::slice::from_ref(to), message).await?;
        Ok(())
    }
    .await;

    if let Err(error) = client.quit().await {
        tracing::debug!(%error, "QUIT failed");
    }
    if result.is_ok() {
        tracing::info!(to = %to, "message sent");
    }
    result
}

/// Logs in and opens the configured folder read-only.
async fn open_folder<S>(session: &mut Session<S>, config: &ImapSettings) -> Result<u32>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if let Some((username, password)) = config.credentials() {
        session.login(username, password).await?;
    }
    Ok(session.examine(config.folder()).await?)
}

async fn logout_quietly<S>(session: &mut Session<S>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if let Err(error) = session.logout().await {
        tracing::debug!(%error, "LOGOUT failed");
    }
}

/// Counts unseen messages on an established IMAP session, then logs out.
///
/// # Errors
///
/// Returns the login, EXAMINE or SEARCH error.
pub async fn count_unseen_on<S>(mut session: Session<S>, config: &ImapSettings) -> Result<u32>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let result: Result<_> = async {
        open_folder(&mut session, config).await?;
        let unseen = session.uid_search("UNSEEN").await?;
        Ok(u32::try_from(unseen.len()).unwrap_or(u32::MAX))
    }
    .await;

    logout_quietly(&mut session).await;
    result
}

/// Summarizes the `take` highest-UID messages on an established IMAP
/// session, then logs out.
///
/// Previews are fetched one message at a time; a failed preview is logged
/// and left empty.
///
/// # Errors
///
/// Returns the login, EXAMINE, SEARCH or summary FETCH error.
pub async fn recent_on<S>(
    mut session: Session<S>,
    config: &ImapSettings,
    take: usize,
) -> Result<Vec<MessageSummary>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let result: Result<_> = async {
        if open_folder(&mut session, config).await? == 0 {
            return Ok(Vec::new());
        }
        let uids = select_most_recent(session.uid_search("ALL").await?, take);
        let fetched = session.uid_fetch(&uids, SUMMARY_ITEMS).await?;

        let mut summaries = Vec::with_capacity(fetched.len());
        for message in &fetched {
            let Some(uid) = message.uid else {
                tracing::debug!(seq = message.seq, "FETCH response without UID, skipping");
                continue;
            };
            let preview = match fetch_preview(&mut session, uid).await {
                Ok(preview) => preview,
                Err(error) => {
                    tracing::debug!(uid, %error, "preview extraction failed");
                    String::new()
                }
            };
            summaries.push(MessageSummary::from_fetched(uid, message, preview));
        }
        crate::snapshot::sort_newest_first(&mut summaries);
        Ok(summaries)
    }
    .await;

    logout_quietly(&mut session).await;
    result
}

async fn fetch_preview<S>(session: &mut Session<S>, uid: u32) -> std::result::Result<String, PreviewError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let body = session
        .uid_fetch(&[uid], BODY_ITEMS)
        .await?
        .into_iter()
        .find(|m| m.uid == Some(uid))
        .and_then(|m| m.body)
        .ok_or(PreviewError::MissingBody(uid))?;
    preview_from_raw(&body)
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
    use mailpulse_mime::Headers;
    use mailpulse_mime::header::split_entity;
    use tokio_test::io::Builder;

    fn smtp_settings() -> SmtpSettings {
        SmtpSettings {
            host: "smtp.example.com".into(),
            from_address: "me@example.com".into(),
            from_display_name: Some("Mail Pulse".into()),
            ..SmtpSettings::default()
        }
    }

    fn imap_settings() -> ImapSettings {
        ImapSettings {
            host: "imap.example.com".into(),
            username: Some("me".into()),
            password: Some("pw".into()),
            ..ImapSettings::default()
        }
    }

    #[test]
    fn compose_uses_configured_identity() {
        let email = OutgoingEmail::new("you@example.org", "Hello", "<p>Hi</p>");
        let (from, to, raw) = email.compose(&smtp_settings()).unwrap();
        assert_eq!(from.as_str(), "me@example.com");
        assert_eq!(to.as_str(), "you@example.org");

        let (head, _) = split_entity(&raw);
        let headers = Headers::parse(head);
        assert_eq!(headers.get("From"), Some("Mail Pulse <me@example.com>"));
        assert_eq!(headers.get("Content-Type"), Some("text/html; charset=utf-8"));
    }

    #[test]
    fn compose_with_override_and_plain_body() {
        let email = OutgoingEmail::new("you@example.org", "Hello", "Hi")
            .sender("alerts@example.com")
            .html(false);
        let (from, _, raw) = email.compose(&smtp_settings()).unwrap();
        assert_eq!(from.as_str(), "alerts@example.com");

        let headers = Headers::parse(split_entity(&raw).0);
        assert_eq!(headers.get("From"), Some("alerts@example.com"));
        assert_eq!(headers.get("Content-Type"), Some("text/plain; charset=utf-8"));
    }

    #[test]
    fn compose_rejects_bad_recipient() {
        let email = OutgoingEmail::new("nobody", "Hello", "Hi");
        assert!(matches!(email.compose(&smtp_settings()), Err(Error::Smtp(_))));
    }

    #[tokio::test]
    async fn cancelled_operation_reports_cancellation() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result: Result<()> = cancellable(&cancel, std::future::pending()).await;
        assert!(result.unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn unseen_count_counts_search_results() {
        let stream = Builder::new()
            .read(b"* OK IMAP4rev1 ready\r\n")
            .write(b"A0000 LOGIN \"me\" \"pw\"\r\n")
            .read(b"A0000 OK LOGIN completed\r\n")
            .write(b"A0001 EXAMINE \"INBOX\"\r\n")
            .read(b"* 12 EXISTS\r\nA0001 OK [READ-ONLY] EXAMINE completed\r\n")
            .write(b"A0002 UID SEARCH UNSEEN\r\n")
            .read(b"* SEARCH 4 9 11\r\nA0002 OK SEARCH completed\r\n")
            .write(b"A0003 LOGOUT\r\n")
            .read(b"* BYE logging out\r\nA0003 OK LOGOUT completed\r\n")
            .build();

        let session = Session::from_stream(stream).await.unwrap();
        assert_eq!(count_unseen_on(session, &imap_settings()).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn unseen_count_logs_out_after_failure() {
        let stream = Builder::new()
            .read(b"* OK ready\r\n")
            .write(b"A0000 LOGIN \"me\" \"pw\"\r\n")
            .read(b"A0000 OK LOGIN completed\r\n")
            .write(b"A0001 EXAMINE \"INBOX\"\r\n")
            .read(b"A0001 NO no such mailbox\r\n")
            .write(b"A0002 LOGOUT\r\n")
            .read(b"A0002 OK bye\r\n")
            .build();

        let session = Session::from_stream(stream).await.unwrap();
        let err = count_unseen_on(session, &imap_settings()).await.unwrap_err();
        assert!(matches!(err, Error::Imap(mailpulse_imap::Error::No(_))));
    }

    #[tokio::test]
    async fn logout_failure_does_not_mask_result() {
        let stream = Builder::new()
            .read(b"* PREAUTH ready\r\n")
            .write(b"A0000 EXAMINE \"INBOX\"\r\n")
            .read(b"* 0 EXISTS\r\nA0000 OK done\r\n")
            .write(b"A0001 UID SEARCH UNSEEN\r\n")
            .read(b"* SEARCH\r\nA0001 OK done\r\n")
            .write(b"A0002 LOGOUT\r\n")
            .build();

        let session = Session::from_stream(stream).await.unwrap();
        let config = ImapSettings::default();
        assert_eq!(count_unseen_on(session, &config).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn empty_folder_returns_no_summaries() {
        let stream = Builder::new()
            .read(b"* PREAUTH ready\r\n")
            .write(b"A0000 EXAMINE \"INBOX\"\r\n")
            .read(b"* 0 EXISTS\r\nA0000 OK done\r\n")
            .write(b"A0001 LOGOUT\r\n")
            .read(b"A0001 OK bye\r\n")
            .build();

        let session = Session::from_stream(stream).await.unwrap();
        let summaries = recent_on(session, &ImapSettings::default(), 50).await.unwrap();
        assert!(summaries.is_empty());
    }

    #[tokio::test]
    async fn send_quits_even_when_rejected() {
        let stream = Builder::new()
            .read(b"220 smtp.example.com ready\r\n")
            .write(b"MAIL FROM:<me@example.com>\r\n")
            .read(b"550 sender rejected\r\n")
            .write(b"QUIT\r\n")
            .read(b"221 bye\r\n")
            .build();

        let client = Client::from_stream(stream).await.unwrap();
        let from = Address::new("me@example.com").unwrap();
        let to = Address::new("you@example.org").unwrap();
        let err = send_on(client, &SmtpSettings::default(), &from, &to, b"Subject: x\r\n\r\nbody")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Smtp(e) if e.is_permanent()));
    }
}
