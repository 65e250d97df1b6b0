//! # mailpulse-mime
//!
//! Just enough MIME for mailpulse: composing single-part outgoing
//! messages and pulling the text bodies out of incoming ones.
//!
//! ```
//! use mailpulse_mime::{BodyKind, Mailbox, MessageBuilder, extract_bodies};
//!
//! let raw = MessageBuilder::new(Mailbox::new("me@example.com"))
//!     .to(Mailbox::new("you@example.org"))
//!     .subject("Hello")
//!     .body("Hi!", BodyKind::Plain)
//!     .build()
//!     .unwrap();
//!
//! let parts = extract_bodies(&raw).unwrap();
//! assert_eq!(parts.text.as_deref(), Some("Hi!"));
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

pub mod body;
pub mod compose;
pub mod encoding;
pub mod header;

mod error;

pub use body::{BodyParts, extract_bodies};
pub use compose::{BodyKind, Mailbox, MessageBuilder};
pub use encoding::decode_header_value;
pub use error::{Error, Result};
pub use header::{ContentType, Headers};
