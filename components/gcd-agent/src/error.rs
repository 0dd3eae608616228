/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The agent's public error type.
//!
//! Unlike most crates in this workspace, which expose one `thiserror` enum per crate, this one is
//! a linked `{domain, code, message, inner}` struct, so that a single error can be inspected
//! generically (by `domain`/`code`) without the caller matching on an ever-growing enum. Internal
//! modules still each keep their own narrow `thiserror` enum and a
//! [`error_support::GetErrorHandling`] impl, and convert into this type at the module boundary.

use std::fmt;

pub type Result<T> = std::result::Result<T, Error>;

/// Which subsystem an error originated in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Domain {
    /// Local agent logic (scheduling, state-machine misuse, internal assertions).
    Buffet,
    /// The OAuth2 token endpoint's `error` field.
    OAuth2,
    /// Local registration logic (claim/finalize protocol driven by this crate).
    Gcd,
    /// Errors returned by Cloud endpoints (HTTP status + server `code`/`message`).
    GcdServer,
    /// Transport-level failures.
    Network,
    /// The local Privet protocol.
    Privet,
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Domain::Buffet => "buffet",
            Domain::OAuth2 => "oauth2",
            Domain::Gcd => "gcd",
            Domain::GcdServer => "gcd_server",
            Domain::Network => "network",
            Domain::Privet => "privet",
        })
    }
}

/// A domain-tagged error with an optional inner cause.
#[derive(Debug, Clone)]
pub struct Error {
    pub domain: Domain,
    pub code: String,
    pub message: String,
    pub inner: Option<Box<Error>>,
    /// The HTTP status a `GcdServer` error was returned with, if any. Kept distinct from `code`
    /// (which may be the server's own semantic error code rather than the status) so
    /// `is_transient` can classify on the status Cloud actually returned.
    pub http_status: Option<u16>,
}

impl Error {
    pub fn new(domain: Domain, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            domain,
            code: code.into(),
            message: message.into(),
            inner: None,
            http_status: None,
        }
    }

    pub fn with_inner(mut self, inner: Error) -> Self {
        self.inner = Some(Box::new(inner));
        self
    }

    pub fn buffet(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(Domain::Buffet, code, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(Domain::Network, "network_error", message)
    }

    pub fn deadline_exceeded() -> Self {
        Self::new(Domain::Buffet, "deadline_exceeded", "request timed out")
    }

    pub fn unauthorized() -> Self {
        Self::new(Domain::Buffet, "unauthorized", "no valid access token")
    }

    pub fn oauth2(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(Domain::OAuth2, code, message)
    }

    pub fn gcd(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(Domain::Gcd, code, message)
    }

    pub fn gcd_server(status: u16, code: impl Into<String>, message: impl Into<String>) -> Self {
        let mut error = Self::new(Domain::GcdServer, code, message);
        error.http_status = Some(status);
        error
    }

    pub fn privet(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(Domain::Privet, code, message)
    }

    /// Whether this error represents a transient condition (network, 5xx, timeout) that
    /// controller loops should retry with backoff rather than surface as a hard failure.
    pub fn is_transient(&self) -> bool {
        matches!(self.domain, Domain::Network)
            || (self.domain == Domain::Buffet && self.code == "deadline_exceeded")
            || (self.domain == Domain::GcdServer && matches!(self.http_status, Some(status) if status / 100 == 5))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}/{}] {}", self.domain, self.code, self.message)?;
        if let Some(inner) = &self.inner {
            write!(f, " (caused by: {inner})")?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.inner.as_deref().map(|e| e as _)
    }
}

impl From<viaduct::ViaductError> for Error {
    fn from(e: viaduct::ViaductError) -> Self {
        Error::network(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::buffet("json_error", e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_domain_and_code() {
        let err = Error::oauth2("invalid_grant", "the refresh token is no longer valid");
        assert_eq!(
            err.to_string(),
            "[oauth2/invalid_grant] the refresh token is no longer valid"
        );
    }

    #[test]
    fn test_is_transient() {
        assert!(Error::network("connection reset").is_transient());
        assert!(Error::deadline_exceeded().is_transient());
        assert!(Error::gcd_server(503, "serviceUnavailable", "unavailable").is_transient());
        assert!(!Error::gcd_server(400, "badRequest", "bad request").is_transient());
        assert!(!Error::oauth2("invalid_grant", "nope").is_transient());
    }

    #[test]
    fn test_inner_chain_display() {
        let inner = Error::network("timed out");
        let outer = Error::gcd("registration_failed", "finalize failed").with_inner(inner);
        assert!(outer.to_string().contains("caused by"));
        assert!(std::error::Error::source(&outer).is_some());
    }
}
