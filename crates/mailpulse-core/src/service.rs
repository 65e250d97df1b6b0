//! The public mail operations.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::ConfigSource;
use crate::error::{Error, Result};
use crate::notifier::{NewMailDetected, Subscribers, SubscriptionId};
use crate::poller::{PollState, PollingLoop};
use crate::snapshot::{MailboxSnapshot, MessageSummary};
use crate::transport::{MailTransport, NetworkTransport, OutgoingEmail};

/// Default number of messages returned by [`MailService::get_recent_emails`].
pub const DEFAULT_RECENT_TAKE: usize = 50;

/// Sending, mailbox queries and new-mail notifications over one
/// configuration source.
///
/// All operations stop with [`Error::Cancelled`] once
/// [`MailService::shutdown`] has been called.
#[derive(Debug)]
pub struct MailService<C, T = NetworkTransport> {
    transport: Arc<T>,
    config: Arc<C>,
    subscribers: Arc<Subscribers>,
    shutdown: CancellationToken,
}

impl<C: ConfigSource> MailService<C> {
    /// Creates a service using real network connections.
    #[must_use]
    pub fn new(config: Arc<C>) -> Self {
        Self::with_transport(NetworkTransport, config)
    }
}

impl<C: ConfigSource, T: MailTransport> MailService<C, T> {
    /// Creates a service over a custom transport.
    #[must_use]
    pub fn with_transport(transport: T, config: Arc<C>) -> Self {
        Self {
            transport: Arc::new(transport),
            config,
            subscribers: Arc::new(Subscribers::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// The settings source.
    #[must_use]
    pub fn config(&self) -> &Arc<C> {
        &self.config
    }

    /// Registers a callback for [`NewMailDetected`].
    pub fn subscribe<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&NewMailDetected) + Send + Sync + 'static,
    {
        self.subscribers.subscribe(handler)
    }

    /// Removes a callback.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.subscribers.unsubscribe(id)
    }

    /// Sends a message from the configured identity.
    ///
    /// # Errors
    ///
    /// Returns an error if the settings are invalid, an address is
    /// malformed or the server rejects the message.
    pub async fn send_email(&self, to: &str, subject: &str, body: &str, is_html: bool) -> Result<()> {
        let email = OutgoingEmail::new(to, subject, body).html(is_html);
        self.send(&email).await
    }

    /// Sends a message with an explicit sender address.
    ///
    /// # Errors
    ///
    /// Returns an error if the settings are invalid, an address is
    /// malformed or the server rejects the message.
    pub async fn send_email_from(
        &self,
        from: &str,
        to: &str,
        subject: &str,
        body: &str,
        is_html: bool,
    ) -> Result<()> {
        let email = OutgoingEmail::new(to, subject, body)
            .sender(from)
            .html(is_html);
        self.send(&email).await
    }

    async fn send(&self, email: &OutgoingEmail) -> Result<()> {
        let settings = self.config.current().await;
        let mut smtp = settings.smtp;
        if let Some(from) = &email.from {
            // The override replaces the configured sender for validation.
            smtp.from_address.clone_from(from);
        }
        smtp.validate().map_err(Error::Invalid)?;
        self.transport.send(email, &smtp, &self.shutdown).await
    }

    /// Counts unseen messages in the configured folder.
    ///
    /// # Errors
    ///
    /// Returns an error if the settings are invalid or the query fails.
    pub async fn check_new_emails(&self) -> Result<u32> {
        self.validate_imap().await?;
        self.snapshot().unseen_count(&self.shutdown).await
    }

    /// Lists up to `take` recent messages, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the settings are invalid or the query fails.
    pub async fn get_recent_emails(&self, take: usize) -> Result<Vec<MessageSummary>> {
        self.validate_imap().await?;
        self.snapshot().recent(take, &self.shutdown).await
    }

    async fn validate_imap(&self) -> Result<()> {
        self.config.current().await.imap.validate().map_err(Error::Invalid)
    }

    /// Mailbox queries sharing this service's transport and settings.
    #[must_use]
    pub fn snapshot(&self) -> MailboxSnapshot<T, C> {
        MailboxSnapshot::new(Arc::clone(&self.transport), Arc::clone(&self.config))
    }

    /// A polling loop that notifies this service's subscribers.
    #[must_use]
    pub fn polling_loop(&self) -> PollingLoop<T, C> {
        PollingLoop::new(self.snapshot(), Arc::clone(&self.subscribers))
    }

    /// Stops in-flight operations and any loop started with
    /// [`MailService::start_polling`].
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Whether [`MailService::shutdown`] has been called.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

impl<C, T> MailService<C, T>
where
    C: ConfigSource + 'static,
    T: MailTransport + 'static,
{
    /// Spawns the polling loop; it stops on [`MailService::shutdown`].
    pub fn start_polling(&self) -> JoinHandle<PollState> {
        self.polling_loop().spawn(self.shutdown.child_token())
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
    use crate::config::{ImapSettings, Settings, SharedConfig, SmtpSettings};
    use std::sync::Mutex;

    #[derive(Debug, Default)]
    struct RecordingTransport {
        sent: Mutex<Vec<(OutgoingEmail, String)>>,
    }

    impl MailTransport for RecordingTransport {
        async fn send(&self, email: &OutgoingEmail, config: &SmtpSettings, _: &CancellationToken) -> Result<()> {
            self.sent
                .lock()
                .unwrap()
                .push((email.clone(), config.from_address.clone()));
            Ok(())
        }

        async fn query_unseen_count(&self, _: &ImapSettings, cancel: &CancellationToken) -> Result<u32> {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            Ok(7)
        }

        async fn query_recent(&self, _: &ImapSettings, take: usize, _: &CancellationToken) -> Result<Vec<MessageSummary>> {
            Ok((0..take)
                .map(|i| MessageSummary {
                    id: i.to_string(),
                    from: String::new(),
                    subject: String::new(),
                    timestamp: chrono::DateTime::UNIX_EPOCH + chrono::Duration::hours(i64::try_from(i).unwrap()),
                    seen: false,
                    preview: String::new(),
                })
                .collect())
        }
    }

    fn service(settings: Settings) -> MailService<SharedConfig, RecordingTransport> {
        MailService::with_transport(RecordingTransport::default(), Arc::new(SharedConfig::new(settings)))
    }

    fn valid() -> Settings {
        Settings::from_json(
            r#"{
                "smtp": {"host": "smtp.example.com", "from_address": "me@example.com"},
                "imap": {"host": "imap.example.com"}
            }"#,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn send_email_uses_configured_sender() {
        let service = service(valid());
        service.send_email("you@example.org", "Hi", "<p>x</p>", true).await.unwrap();
        service
            .send_email_from("alerts@example.com", "you@example.org", "Hi", "x", false)
            .await
            .unwrap();

        let sent = service.transport.sent.lock().unwrap();
        assert_eq!(sent[0].1, "me@example.com");
        assert!(sent[0].0.is_html);
        assert_eq!(sent[1].1, "alerts@example.com");
        assert_eq!(sent[1].0.from.as_deref(), Some("alerts@example.com"));
        assert!(!sent[1].0.is_html);
    }

    #[tokio::test]
    async fn invalid_settings_fail_before_transport() {
        let service = service(Settings::default());
        let err = service.send_email("you@example.org", "Hi", "x", true).await.unwrap_err();
        assert!(matches!(err, Error::Invalid(_)));
        assert!(service.transport.sent.lock().unwrap().is_empty());

        assert!(matches!(service.check_new_emails().await, Err(Error::Invalid(_))));
    }

    #[tokio::test]
    async fn recent_emails_are_newest_first() {
        let service = service(valid());
        let recent = service.get_recent_emails(3).await.unwrap();
        let ids: Vec<&str> = recent.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["2", "1", "0"]);
        assert_eq!(DEFAULT_RECENT_TAKE, 50);
    }

    #[tokio::test]
    async fn shutdown_cancels_operations_and_loop() {
        let service = service(valid());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        service.subscribe(move |e| sink.lock().unwrap().push(e.unseen_count));

        assert_eq!(service.check_new_emails().await.unwrap(), 7);

        let handle = service.start_polling();
        while seen.lock().unwrap().is_empty() {
            tokio::task::yield_now().await;
        }
        service.shutdown();
        let state = handle.await.unwrap();

        assert!(service.is_shut_down());
        assert_eq!(state.last_unseen(), Some(7));
        assert_eq!(*seen.lock().unwrap(), vec![7]);
        assert!(service.check_new_emails().await.unwrap_err().is_cancelled());
    }
}
