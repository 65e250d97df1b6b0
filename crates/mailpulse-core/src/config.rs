//! Settings and the sources they are read from.
//!
//! Every operation pulls a fresh [`Settings`] from a [`ConfigSource`], so an
//! edit to the configuration takes effect at the next call or poll cycle.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default IMAP folder.
pub const DEFAULT_FOLDER: &str = "INBOX";

/// Default polling interval in seconds.
pub const DEFAULT_POLLING_INTERVAL_SECS: u64 = 60;

/// Connection security mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Security {
    /// No encryption.
    None,
    /// TLS from the first byte.
    ImplicitTls,
    /// Upgrade with STARTTLS when the server offers it.
    StartTls,
}

impl Security {
    /// Maps the `use_ssl` flag: implicit TLS when set, opportunistic
    /// STARTTLS otherwise.
    #[must_use]
    pub const fn from_use_ssl(use_ssl: bool) -> Self {
        if use_ssl { Self::ImplicitTls } else { Self::StartTls }
    }

    const fn imap(self) -> mailpulse_imap::Security {
        match self {
            Self::None => mailpulse_imap::Security::None,
            Self::ImplicitTls => mailpulse_imap::Security::Tls,
            Self::StartTls => mailpulse_imap::Security::StartTls,
        }
    }

    const fn smtp(self) -> mailpulse_smtp::Security {
        match self {
            Self::None => mailpulse_smtp::Security::None,
            Self::ImplicitTls => mailpulse_smtp::Security::Tls,
            Self::StartTls => mailpulse_smtp::Security::StartTls,
        }
    }
}

/// Outgoing server settings.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SmtpSettings {
    /// Server host name.
    pub host: String,
    /// Server port; 0 picks the default for the security mode.
    pub port: u16,
    /// Legacy TLS switch, used when `security` is absent.
    pub use_ssl: bool,
    /// Explicit security mode.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub security: Option<Security>,
    /// Login name; authentication is skipped when empty.
    pub username: Option<String>,
    /// Password for `username`.
    pub password: Option<String>,
    /// Envelope and `From:` address.
    pub from_address: String,
    /// Display name for the `From:` header.
    pub from_display_name: Option<String>,
}

impl SmtpSettings {
    /// Effective security mode.
    #[must_use]
    pub fn security(&self) -> Security {
        self.security.unwrap_or_else(|| Security::from_use_ssl(self.use_ssl))
    }

    /// Effective port.
    #[must_use]
    pub fn port(&self) -> u16 {
        if self.port != 0 {
            return self.port;
        }
        match self.security() {
            Security::ImplicitTls => 465,
            Security::StartTls => 587,
            Security::None => 25,
        }
    }

    pub(crate) fn protocol_security(&self) -> mailpulse_smtp::Security {
        self.security().smtp()
    }

    /// Username and password when a username is configured.
    #[must_use]
    pub fn credentials(&self) -> Option<(&str, &str)> {
        credentials(self.username.as_deref(), self.password.as_deref())
    }

    fn validate_into(&self, errors: &mut Vec<ValidationError>) {
        if self.host.trim().is_empty() {
            errors.push(ValidationError::EmptySmtpHost);
        }
        if self.from_address.trim().is_empty() {
            errors.push(ValidationError::EmptyFromAddress);
        } else if !looks_like_address(&self.from_address) {
            errors.push(ValidationError::InvalidFromAddress);
        }
        if self.credentials().is_some_and(|(_, p)| p.is_empty()) {
            errors.push(ValidationError::EmptySmtpPassword);
        }
    }

    /// Checks the settings needed to send mail.
    ///
    /// # Errors
    ///
    /// Returns every problem found.
    pub fn validate(&self) -> ValidationResult {
        let mut errors = Vec::new();
        self.validate_into(&mut errors);
        finish(errors)
    }
}

impl std::fmt::Debug for SmtpSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmtpSettings")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("security", &self.security())
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("from_address", &self.from_address)
            .field("from_display_name", &self.from_display_name)
            .finish()
    }
}

/// Incoming server settings.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImapSettings {
    /// Server host name.
    pub host: String,
    /// Server port; 0 picks the default for the security mode.
    pub port: u16,
    /// Legacy TLS switch, used when `security` is absent.
    pub use_ssl: bool,
    /// Explicit security mode.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub security: Option<Security>,
    /// Login name; LOGIN is skipped when empty.
    pub username: Option<String>,
    /// Password for `username`.
    pub password: Option<String>,
    /// Folder to inspect.
    pub folder: String,
}

impl Default for ImapSettings {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 0,
            use_ssl: false,
            security: None,
            username: None,
            password: None,
            folder: DEFAULT_FOLDER.to_string(),
        }
    }
}

impl ImapSettings {
    /// Effective security mode.
    #[must_use]
    pub fn security(&self) -> Security {
        self.security.unwrap_or_else(|| Security::from_use_ssl(self.use_ssl))
    }

    /// Effective port.
    #[must_use]
    pub fn port(&self) -> u16 {
        if self.port != 0 {
            return self.port;
        }
        match self.security() {
            Security::ImplicitTls => 993,
            Security::StartTls | Security::None => 143,
        }
    }

    pub(crate) fn protocol_security(&self) -> mailpulse_imap::Security {
        self.security().imap()
    }

    /// Username and password when a username is configured.
    #[must_use]
    pub fn credentials(&self) -> Option<(&str, &str)> {
        credentials(self.username.as_deref(), self.password.as_deref())
    }

    /// Folder name, falling back to `INBOX` when blank.
    #[must_use]
    pub fn folder(&self) -> &str {
        let folder = self.folder.trim();
        if folder.is_empty() { DEFAULT_FOLDER } else { folder }
    }

    fn validate_into(&self, errors: &mut Vec<ValidationError>) {
        if self.host.trim().is_empty() {
            errors.push(ValidationError::EmptyImapHost);
        }
        if self.credentials().is_some_and(|(_, p)| p.is_empty()) {
            errors.push(ValidationError::EmptyImapPassword);
        }
    }

    /// Checks the settings needed to query the mailbox.
    ///
    /// # Errors
    ///
    /// Returns every problem found.
    pub fn validate(&self) -> ValidationResult {
        let mut errors = Vec::new();
        self.validate_into(&mut errors);
        finish(errors)
    }
}

impl std::fmt::Debug for ImapSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImapSettings")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("security", &self.security())
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("folder", &self.folder)
            .finish()
    }
}

/// Complete settings document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Outgoing server.
    pub smtp: SmtpSettings,
    /// Incoming server.
    pub imap: ImapSettings,
    /// Seconds between polls.
    pub polling_interval_seconds: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            smtp: SmtpSettings::default(),
            imap: ImapSettings::default(),
            polling_interval_seconds: DEFAULT_POLLING_INTERVAL_SECS,
        }
    }
}

impl Settings {
    /// Parses settings from JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if the document is not valid JSON for [`Settings`].
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Reads settings from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub async fn load(path: &Path) -> Result<Self> {
        let contents = tokio::fs::read_to_string(path).await?;
        Self::from_json(&contents)
    }

    /// Checks both server sections.
    ///
    /// # Errors
    ///
    /// Returns every problem found.
    pub fn validate(&self) -> ValidationResult {
        let mut errors = Vec::new();
        self.imap.validate_into(&mut errors);
        self.smtp.validate_into(&mut errors);
        finish(errors)
    }
}

fn credentials<'a>(username: Option<&'a str>, password: Option<&'a str>) -> Option<(&'a str, &'a str)> {
    username
        .filter(|u| !u.trim().is_empty())
        .map(|u| (u, password.unwrap_or_default()))
}

fn looks_like_address(address: &str) -> bool {
    address
        .rsplit_once('@')
        .is_some_and(|(local, domain)| !local.is_empty() && !domain.is_empty() && !address.contains(char::is_whitespace))
}

/// A problem found by settings validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationError {
    /// IMAP host is empty.
    EmptyImapHost,
    /// IMAP username given without a password.
    EmptyImapPassword,
    /// SMTP host is empty.
    EmptySmtpHost,
    /// SMTP username given without a password.
    EmptySmtpPassword,
    /// No sender address.
    EmptyFromAddress,
    /// Sender address is malformed.
    InvalidFromAddress,
}

impl ValidationError {
    /// Human-readable message.
    #[must_use]
    pub const fn message(&self) -> &'static str {
        match self {
            Self::EmptyImapHost => "IMAP server is required",
            Self::EmptyImapPassword => "IMAP password is required when a username is set",
            Self::EmptySmtpHost => "SMTP server is required",
            Self::EmptySmtpPassword => "SMTP password is required when a username is set",
            Self::EmptyFromAddress => "Sender address is required",
            Self::InvalidFromAddress => "Invalid sender address format",
        }
    }

    /// Settings field the problem relates to.
    #[must_use]
    pub const fn field(&self) -> &'static str {
        match self {
            Self::EmptyImapHost => "imap.host",
            Self::EmptyImapPassword => "imap.password",
            Self::EmptySmtpHost => "smtp.host",
            Self::EmptySmtpPassword => "smtp.password",
            Self::EmptyFromAddress | Self::InvalidFromAddress => "smtp.from_address",
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message())
    }
}

impl std::error::Error for ValidationError {}

/// Result of validating settings.
pub type ValidationResult = std::result::Result<(), Vec<ValidationError>>;

fn finish(errors: Vec<ValidationError>) -> ValidationResult {
    if errors.is_empty() { Ok(()) } else { Err(errors) }
}

/// Pull-based access to the current settings.
pub trait ConfigSource: Send + Sync {
    /// Returns the settings as of now.
    fn current(&self) -> impl Future<Output = Settings> + Send;
}

impl<T: ConfigSource> ConfigSource for Arc<T> {
    fn current(&self) -> impl Future<Output = Settings> + Send {
        (**self).current()
    }
}

/// Settings that never change.
#[derive(Debug, Clone, Default)]
pub struct StaticConfig(pub Settings);

impl ConfigSource for StaticConfig {
    async fn current(&self) -> Settings {
        self.0.clone()
    }
}

/// In-memory settings that can be replaced at runtime.
#[derive(Debug, Default)]
pub struct SharedConfig {
    settings: RwLock<Settings>,
}

impl SharedConfig {
    /// Creates a source holding `settings`.
    #[must_use]
    pub const fn new(settings: Settings) -> Self {
        Self {
            settings: RwLock::new(settings),
        }
    }

    /// Replaces the settings.
    pub fn replace(&self, settings: Settings) {
        *self.settings.write().unwrap_or_else(PoisonError::into_inner) = settings;
    }

    /// Applies an in-place edit.
    pub fn update(&self, edit: impl FnOnce(&mut Settings)) {
        edit(&mut self.settings.write().unwrap_or_else(PoisonError::into_inner));
    }
}

impl ConfigSource for SharedConfig {
    async fn current(&self) -> Settings {
        self.settings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Settings backed by a JSON file that is re-read on every access.
///
/// A read or parse failure keeps the last good settings.
#[derive(Debug)]
pub struct FileConfig {
    path: PathBuf,
    last_good: Mutex<Settings>,
}

impl FileConfig {
    /// Opens the file; the first read must succeed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let settings = Settings::load(&path).await.map_err(|e| {
            Error::Config(format!("cannot load {}: {e}", path.display()))
        })?;
        Ok(Self {
            path,
            last_good: Mutex::new(settings),
        })
    }

    /// Path of the backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConfigSource for FileConfig {
    async fn current(&self) -> Settings {
        let loaded = Settings::load(&self.path).await;
        let mut last_good = self.last_good.lock().unwrap_or_else(PoisonError::into_inner);
        match loaded {
            Ok(settings) => {
                if *last_good != settings {
                    tracing::info!(path = %self.path.display(), "configuration reloaded");
                    *last_good = settings.clone();
                }
                settings
            }
            Err(error) => {
                tracing::warn!(
                    path = %self.path.display(),
                    %error,
                    "failed to reload configuration, keeping previous settings"
                );
                last_good.clone()
            }
        }
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

    fn valid() -> Settings {
        Settings::from_json(
            r#"{
                "smtp": {"host": "smtp.example.com", "from_address": "me@example.com"},
                "imap": {"host": "imap.example.com"}
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn defaults_fill_missing_fields() {
        let settings = Settings::from_json("{}").unwrap();
        assert_eq!(settings.polling_interval_seconds, 60);
        assert_eq!(settings.imap.folder, "INBOX");
        assert_eq!(settings.imap.security(), Security::StartTls);
        assert_eq!(settings.imap.port(), 143);
        assert_eq!(settings.smtp.port(), 587);
    }

    #[test]
    fn use_ssl_maps_to_implicit_tls() {
        let settings = Settings::from_json(
            r#"{"smtp": {"use_ssl": true}, "imap": {"use_ssl": true}}"#,
        )
        .unwrap();
        assert_eq!(settings.smtp.security(), Security::ImplicitTls);
        assert_eq!(settings.smtp.port(), 465);
        assert_eq!(settings.imap.port(), 993);
    }

    #[test]
    fn explicit_security_wins_over_use_ssl() {
        let settings = Settings::from_json(
            r#"{"imap": {"use_ssl": true, "security": "none", "port": 1143}}"#,
        )
        .unwrap();
        assert_eq!(settings.imap.security(), Security::None);
        assert_eq!(settings.imap.port(), 1143);
        assert_eq!(settings.imap.protocol_security(), mailpulse_imap::Security::None);
    }

    #[test]
    fn blank_folder_falls_back_to_inbox() {
        let mut imap = ImapSettings::default();
        imap.folder = "  ".into();
        assert_eq!(imap.folder(), "INBOX");
        imap.folder = "Archive".into();
        assert_eq!(imap.folder(), "Archive");
    }

    #[test]
    fn credentials_require_username() {
        let mut imap = ImapSettings::default();
        assert!(imap.credentials().is_none());
        imap.username = Some(String::new());
        assert!(imap.credentials().is_none());
        imap.username = Some("me".into());
        assert_eq!(imap.credentials(), Some(("me", "")));
    }

    #[test]
    fn validation_reports_all_problems() {
        assert!(valid().validate().is_ok());

        let mut settings = Settings::default();
        settings.smtp.from_address = "not an address".into();
        settings.imap.username = Some("me".into());
        let errors = settings.validate().unwrap_err();
        assert_eq!(
            errors,
            vec![
                ValidationError::EmptyImapHost,
                ValidationError::EmptyImapPassword,
                ValidationError::EmptySmtpHost,
                ValidationError::InvalidFromAddress,
            ]
        );
        assert_eq!(errors[3].field(), "smtp.from_address");
    }

    #[test]
    fn debug_redacts_passwords() {
        let mut settings = valid();
        settings.imap.password = Some("hunter2".into());
        settings.smtp.password = Some("hunter2".into());
        assert!(!format!("{settings:?}").contains("hunter2"));
    }

    #[tokio::test]
    async fn shared_config_updates_are_visible() {
        let source = SharedConfig::new(valid());
        source.update(|s| s.polling_interval_seconds = 5);
        assert_eq!(source.current().await.polling_interval_seconds, 5);

        let shared = Arc::new(source);
        assert_eq!(shared.current().await.imap.host, "imap.example.com");
    }

    #[tokio::test]
    async fn file_config_reloads_and_keeps_last_good() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        tokio::fs::write(&path, r#"{"polling_interval_seconds": 30}"#).await.unwrap();

        let source = FileConfig::open(&path).await.unwrap();
        assert_eq!(source.current().await.polling_interval_seconds, 30);

        tokio::fs::write(&path, r#"{"polling_interval_seconds": 90}"#).await.unwrap();
        assert_eq!(source.current().await.polling_interval_seconds, 90);

        tokio::fs::write(&path, "{ not json").await.unwrap();
        assert_eq!(source.current().await.polling_interval_seconds, 90);

        tokio::fs::remove_file(&path).await.unwrap();
        assert_eq!(source.current().await.polling_interval_seconds, 90);
    }

    #[tokio::test]
    async fn file_config_requires_initial_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = FileConfig::open(dir.path().join("missing.json")).await.unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
