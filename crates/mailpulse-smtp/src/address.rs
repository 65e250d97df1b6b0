//! Envelope addresses.

use crate::error::{Error, Result};

/// A validated envelope address (`MAIL FROM` / `RCPT TO`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Address(String);

impl Address {
    /// Validates and wraps an address such as `user@example.com`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidAddress`] if the address is not of the form
    /// `local@domain` or contains characters that would break the command.
    pub fn new(address: impl Into<String>) -> Result<Self> {
        let address = address.into();
        let trimmed = address.trim();

        let valid = trimmed
            .rsplit_once('@')
            .is_some_and(|(local, domain)| !local.is_empty() && !domain.is_empty())
            && !trimmed
                .chars()
                .any(|c| c.is_whitespace() || c.is_control() || c == '<' || c == '>');

        if valid {
            Ok(Self(trimmed.to_string()))
        } else {
            Err(Error::InvalidAddress(address))
        }
    }

    /// Returns the address text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plain_addresses() {
        assert_eq!(Address::new(" a@b.c ").unwrap().as_str(), "a@b.c");
        assert!(Address::new("first.last+tag@sub.example.org").is_ok());
    }

    #[test]
    fn rejects_malformed() {
        for bad in ["", "nobody", "@example.com", "user@", "a b@c.d", "<a@b.c>", "a@b\r\nRCPT"] {
            assert!(Address::new(bad).is_err(), "{bad:?} should be rejected");
        }
    }
}
