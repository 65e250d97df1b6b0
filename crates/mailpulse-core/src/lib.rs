//! # mailpulse-core
//!
//! Mail operations and new-mail detection for `mailpulse`.
//!
//! This crate provides:
//! - Settings and live-reloadable configuration sources
//! - One-shot SMTP sends and IMAP queries ([`MailTransport`])
//! - Unseen counts and recent-message summaries ([`MailboxSnapshot`])
//! - Change detection and subscriber dispatch ([`ChangeNotifier`], [`Subscribers`])
//! - The background [`PollingLoop`]
//! - The [`MailService`] facade tying them together

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

pub mod config;
mod error;
pub mod notifier;
pub mod poller;
pub mod service;
pub mod snapshot;
pub mod transport;

pub use config::{
    ConfigSource, FileConfig, ImapSettings, Security, Settings, SharedConfig, SmtpSettings,
    StaticConfig, ValidationError,
};
pub use error::{Error, Result};
pub use notifier::{ChangeNotifier, NewMailDetected, Subscribers, SubscriptionId};
pub use poller::{MIN_POLL_INTERVAL, PollPhase, PollState, PollingLoop, Sleeper, TokioSleeper};
pub use service::{DEFAULT_RECENT_TAKE, MailService};
pub use snapshot::{MailboxSnapshot, MessageSummary, PreviewError};
pub use transport::{MailTransport, NetworkTransport, OutgoingEmail};
