//! mailpulse - send mail, inspect an inbox and watch for new messages.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mailpulse_core::{
    ConfigSource, DEFAULT_RECENT_TAKE, FileConfig, MailService, MessageSummary, NewMailDetected,
};

#[derive(Debug, Parser)]
#[command(name = "mailpulse", version, about)]
struct Cli {
    /// Settings file (default: <config dir>/mailpulse/config.json)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Poll the inbox and report changes in the unseen count until Ctrl-C
    Watch {
        /// Also raise a desktop notification
        #[arg(long)]
        notify: bool,
    },
    /// Print the number of unseen messages
    Check,
    /// List the most recent messages
    Recent {
        /// How many messages to list
        #[arg(long, default_value_t = DEFAULT_RECENT_TAKE)]
        take: usize,
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },
    /// Send a message
    Send {
        /// Recipient address
        #[arg(long)]
        to: String,
        /// Subject line
        #[arg(long)]
        subject: String,
        /// Message body (HTML unless --plain)
        #[arg(long)]
        body: String,
        /// Sender address overriding the configured one
        #[arg(long)]
        from: Option<String>,
        /// Send the body as plain text
        #[arg(long)]
        plain: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mailpulse=info,mailpulse_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let path = cli.config.unwrap_or_else(default_config_path);
    let config = FileConfig::open(&path)
        .await
        .with_context(|| format!("Failed to load settings from {}", path.display()))?;
    let service = MailService::new(Arc::new(config));

    match cli.command {
        Command::Watch { notify } => watch(&service, notify).await,
        Command::Check => {
            let unseen = service.check_new_emails().await?;
            println!("{unseen}");
            Ok(())
        }
        Command::Recent { take, json } => {
            let messages = service.get_recent_emails(take).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&messages)?);
            } else {
                print_summaries(&messages);
            }
            Ok(())
        }
        Command::Send {
            to,
            subject,
            body,
            from,
            plain,
        } => {
            match from {
                Some(from) => {
                    service
                        .send_email_from(&from, &to, &subject, &body, !plain)
                        .await?;
                }
                None => service.send_email(&to, &subject, &body, !plain).await?,
            }
            println!("Sent to {to}");
            Ok(())
        }
    }
}

fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("mailpulse")
        .join("config.json")
}

async fn watch<C: ConfigSource + 'static>(service: &MailService<C>, notify: bool) -> Result<()> {
    let folder = service.config().current().await.imap.folder().to_string();

    service.subscribe(move |event: &NewMailDetected| {
        info!(unseen = event.unseen_count, "new mail detected");
        if notify {
            let folder = folder.clone();
            let unseen = event.unseen_count;
            drop(tokio::task::spawn_blocking(move || show_notification(&folder, unseen)));
        }
    });

    let handle = service.start_polling();
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("shutting down");
    service.shutdown();

    let state = handle.await.context("Polling task failed")?;
    info!(cycles = state.cycles(), failed = state.failed_cycles(), "watch finished");
    Ok(())
}

fn show_notification(folder: &str, unseen: u32) {
    let body = match unseen {
        0 => format!("No unseen messages in {folder}"),
        1 => format!("1 unseen message in {folder}"),
        n => format!("{n} unseen messages in {folder}"),
    };
    if let Err(e) = notify_rust::Notification::new()
        .appname("mailpulse")
        .summary("Mail")
        .body(&body)
        .icon("mail-unread")
        .show()
    {
        tracing::warn!("Failed to show notification: {}", e);
    }
}

fn print_summaries(messages: &[MessageSummary]) {
    if messages.is_empty() {
        println!("No messages");
        return;
    }
    for message in messages {
        let marker = if message.seen { ' ' } else { '*' };
        let when = message
            .timestamp
            .with_timezone(&chrono::Local)
            .format("%Y-%m-%d %H:%M");
        println!(
            "{marker} {:>6}  {when}  {:<28.28}  {}",
            message.id, message.from, message.subject
        );
        if !message.preview.is_empty() {
            println!("           {}", message.preview);
        }
    }
}
