//! # mailpulse-imap
//!
//! A small async IMAP client covering what mailbox inspection needs:
//! connecting over plaintext, implicit TLS or STARTTLS, LOGIN, EXAMINE,
//! `UID SEARCH`, `UID FETCH` and LOGOUT.
//!
//! ```ignore
//! use mailpulse_imap::{Security, Session};
//!
//! let mut session = Session::connect("imap.example.com", 993, Security::Tls).await?;
//! session.login("user@example.com", "password").await?;
//! session.examine("INBOX").await?;
//! let unseen = session.uid_search("UNSEEN").await?;
//! session.logout().await?;
//! ```
//!
//! ## Modules
//!
//! - [`framed`]: line and literal framing
//! - [`response`]: response classification and the generic value parser
//! - [`fetch`]: FETCH attribute decoding (flags, envelope, internal date, body)
//! - [`session`]: the connection and its protocol state

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

mod error;
pub mod fetch;
pub mod framed;
pub mod response;
pub mod session;
pub mod stream;

pub use error::{Error, Result};
pub use fetch::{Address, Envelope, FetchedMessage};
pub use framed::FramedStream;
pub use session::{Security, Session, SessionState};
pub use stream::ImapStream;
