//! # mailpulse-smtp
//!
//! A small async SMTP client (RFC 5321) for submitting one message per
//! connection: greeting, EHLO, optional STARTTLS, AUTH PLAIN/LOGIN,
//! MAIL FROM, RCPT TO, DATA and QUIT.
//!
//! ```ignore
//! use mailpulse_smtp::{Address, Client, Security};
//!
//! let mut client = Client::connect("smtp.example.com", 587, Security::StartTls, "localhost").await?;
//! client.authenticate("user@example.com", "password").await?;
//! let from = Address::new("user@example.com")?;
//! let to = [Address::new("friend@example.org")?];
//! client.send_mail(&from, &to, b"Subject: hi\r\n\r\nHello!\r\n").await?;
//! client.quit().await?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

mod address;
mod client;
mod error;
pub mod reply;
mod stream;

pub use address::Address;
pub use client::{Client, Security};
pub use error::{Error, Result};
pub use reply::Reply;
pub use stream::SmtpStream;
