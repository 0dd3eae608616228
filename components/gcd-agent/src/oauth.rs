/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The OAuth2 token manager and the classification of its failures.
//!
//! This crate holds a single cached bearer token rather than a scope-keyed cache of many; "only
//! one refresh in flight" is a waiter list drained synchronously once the one in-flight request
//! completes, since the agent's task loop is single-threaded.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;
use serde::Deserialize;
use url::Url;

use crate::error::{Error, Result};

/// Margin before expiry at which [`TokenManager::get_access_token`] proactively refreshes,
/// and the trigger for the controller's own refresh timer.
pub const REFRESH_MARGIN: Duration = Duration::from_secs(60);

/// How the registration/session controller should react to a failed token refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OAuthFailureClass {
    /// `invalid_grant`/`invalid_client`/`unauthorized_client`/`access_denied`, or a request-shape
    /// error (`invalid_request`/`unsupported_grant_type`): no retry will help.
    InvalidCredentials,
    /// Network error, 5xx, `deadline_exceeded`, or any other/unrecognized error body: retry with
    /// backoff, treating unknown codes as transient by default rather than as a hard failure.
    Transient,
}

/// Classify an OAuth `error` field from the token endpoint.
pub fn classify_oauth_error(code: &str) -> OAuthFailureClass {
    match code {
        "invalid_grant" | "invalid_client" | "unauthorized_client" | "access_denied" => {
            OAuthFailureClass::InvalidCredentials
        }
        "invalid_request" | "unsupported_grant_type" => OAuthFailureClass::InvalidCredentials,
        _ => OAuthFailureClass::Transient,
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    expires_in: u64,
}

#[derive(Debug, Deserialize)]
struct OAuthErrorBody {
    error: String,
}

/// An in-memory, live bearer token plus its wall-clock expiry.
#[derive(Debug, Clone)]
struct CachedToken {
    access_token: String,
    expires_at: SystemTime,
}

impl CachedToken {
    fn needs_refresh(&self, now: SystemTime) -> bool {
        self.access_token.is_empty()
            || now + REFRESH_MARGIN >= self.expires_at
    }
}

/// Acquires and refreshes the single Cloud OAuth2 access token.
///
/// Owns no transport of its own: requests are sent through `viaduct::send_sync`, exactly like
/// every other Cloud call in this crate, so the registration/session controller and this manager
/// share one retry/timeout posture.
pub struct TokenManager {
    oauth_url: String,
    client_id: String,
    client_secret: String,
    cached: Mutex<Option<CachedToken>>,
    refresh_token: Mutex<Option<String>>,
}

impl TokenManager {
    pub fn new(oauth_url: impl Into<String>, client_id: impl Into<String>, client_secret: impl Into<String>) -> Self {
        Self {
            oauth_url: oauth_url.into(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            cached: Mutex::new(None),
            refresh_token: Mutex::new(None),
        }
    }

    /// Load (or clear) the refresh token this manager exchanges for access tokens. Called once at
    /// startup from persisted Settings, and again whenever registration completes or is reset.
    pub fn set_refresh_token(&self, refresh_token: Option<String>) {
        *self.refresh_token.lock() = refresh_token;
        *self.cached.lock() = None;
    }

    /// Discard the cached access token, forcing the next call to refresh (used after a 401).
    pub fn invalidate(&self) {
        *self.cached.lock() = None;
    }

    /// Return a live access token, refreshing first if the cached one is missing or within
    /// [`REFRESH_MARGIN`] of expiry. Since the whole crate runs on one task-loop
    /// thread, "only one refresh in flight" falls out for free here: nothing re-enters this
    /// function while a refresh is being performed synchronously. The lock is still the source of
    /// truth for the invariant, guarding against a future multi-threaded embedder.
    pub fn get_access_token(&self) -> Result<(String, SystemTime)> {
        let now = SystemTime::now();
        {
            let cached = self.cached.lock();
            if let Some(token) = cached.as_ref() {
                if !token.needs_refresh(now) {
                    return Ok((token.access_token.clone(), token.expires_at));
                }
            }
        }
        self.refresh()
    }

    fn refresh(&self) -> Result<(String, SystemTime)> {
        let refresh_token = self
            .refresh_token
            .lock()
            .clone()
            .ok_or_else(Error::unauthorized)?;

        let url = Url::parse(&self.oauth_url)
            .and_then(|u| u.join("token"))
            .map_err(|e| Error::buffet("bad_oauth_url", e.to_string()))?;

        let request = viaduct::Request::post(url)
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", &refresh_token),
                ("client_id", &self.client_id),
                ("client_secret", &self.client_secret),
            ])?;

        let response = viaduct::send_sync(request)?;
        if !response.is_success() {
            let code = response
                .json::<OAuthErrorBody>()
                .map(|b| b.error)
                .unwrap_or_else(|_| "unknown_error".to_string());
            return Err(Error::oauth2(code, format!("token refresh failed with HTTP {}", response.status)));
        }

        let body: TokenResponse = response.json()?;
        let expires_at = SystemTime::now() + Duration::from_secs(body.expires_in);
        *self.cached.lock() = Some(CachedToken {
            access_token: body.access_token.clone(),
            expires_at,
        });
        if let Some(new_refresh_token) = body.refresh_token {
            *self.refresh_token.lock() = Some(new_refresh_token);
        }
        Ok((body.access_token, expires_at))
    }
}

/// The authenticated-JSON Cloud HTTP wrapper. Injects `Authorization: Bearer <token>`, retries exactly once after a 401 following
/// an in-place token refresh, and maps transport failures into the domain-tagged [`Error`].
pub struct CloudClient {
    tokens: Arc<TokenManager>,
    timeout: Duration,
}

impl CloudClient {
    pub fn new(tokens: Arc<TokenManager>) -> Self {
        Self {
            tokens,
            timeout: Duration::from_secs(30),
        }
    }

    /// Send `build(token)` — the caller builds an (unauthenticated) request and this wrapper signs
    /// it — retrying once on 401 after a forced token refresh.
    pub fn send(&self, build: impl Fn(&str) -> Result<viaduct::Request>) -> Result<viaduct::Response> {
        let (token, _expiry) = self.tokens.get_access_token()?;
        let response = self.send_once(&build, &token)?;
        if response.status != 401 {
            return Ok(response);
        }

        self.tokens.invalidate();
        let (token, _expiry) = self.tokens.get_access_token()?;
        let response = self.send_once(&build, &token)?;
        if response.status == 401 {
            return Err(Error::unauthorized());
        }
        Ok(response)
    }

    fn send_once(&self, build: &impl Fn(&str) -> Result<viaduct::Request>, token: &str) -> Result<viaduct::Response> {
        let request = build(token)?.timeout(self.timeout);
        viaduct::send_sync(request).map_err(|e| match e {
            viaduct::ViaductError::BackendError(msg) => Error::network(msg),
            other => Error::network(other.to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;

    #[test]
    fn test_classify_oauth_error() {
        assert_eq!(classify_oauth_error("invalid_grant"), OAuthFailureClass::InvalidCredentials);
        assert_eq!(classify_oauth_error("invalid_client"), OAuthFailureClass::InvalidCredentials);
        assert_eq!(classify_oauth_error("unauthorized_client"), OAuthFailureClass::InvalidCredentials);
        assert_eq!(classify_oauth_error("access_denied"), OAuthFailureClass::InvalidCredentials);
        assert_eq!(classify_oauth_error("invalid_request"), OAuthFailureClass::InvalidCredentials);
        assert_eq!(classify_oauth_error("unsupported_grant_type"), OAuthFailureClass::InvalidCredentials);
        assert_eq!(classify_oauth_error("server_error"), OAuthFailureClass::Transient);
        assert_eq!(classify_oauth_error("something_new"), OAuthFailureClass::Transient);
    }

    #[test]
    fn test_get_access_token_without_refresh_token_is_unauthorized() {
        let manager = TokenManager::new("https://oauth.example.com/", "cid", "secret");
        let err = manager.get_access_token().unwrap_err();
        assert_eq!(err.code, "unauthorized");
    }

    #[test]
    fn test_cached_token_needs_refresh_when_empty() {
        let token = CachedToken {
            access_token: String::new(),
            expires_at: SystemTime::now() + Duration::from_secs(3600),
        };
        assert!(token.needs_refresh(SystemTime::now()));
    }

    #[test]
    fn test_cached_token_needs_refresh_near_expiry() {
        let token = CachedToken {
            access_token: "AT".into(),
            expires_at: SystemTime::now() + Duration::from_secs(30),
        };
        assert!(token.needs_refresh(SystemTime::now()));
    }

    #[test]
    fn test_cached_token_fresh_does_not_need_refresh() {
        let token = CachedToken {
            access_token: "AT".into(),
            expires_at: SystemTime::now() + Duration::from_secs(3600),
        };
        assert!(!token.needs_refresh(SystemTime::now()));
    }

    #[test]
    fn test_oauth_refresh_success_sets_cached_token() {
        testing::install();
        testing::stub(
            "https://oauth-refresh-success.example.com/token",
            200,
            r#"{"access_token":"AT","expires_in":3600}"#,
        );
        let manager = TokenManager::new("https://oauth-refresh-success.example.com/", "cid", "secret");
        manager.set_refresh_token(Some("RT".into()));
        let (token, _expiry) = manager.get_access_token().unwrap();
        assert_eq!(token, "AT");
    }

    #[test]
    fn test_oauth_invalid_grant_surfaces_oauth2_domain_error() {
        testing::install();
        testing::stub(
            "https://oauth-invalid-grant.example.com/token",
            400,
            r#"{"error":"invalid_grant"}"#,
        );
        let manager = TokenManager::new("https://oauth-invalid-grant.example.com/", "cid", "secret");
        manager.set_refresh_token(Some("RT".into()));
        let err = manager.get_access_token().unwrap_err();
        assert_eq!(err.domain, crate::error::Domain::OAuth2);
        assert_eq!(err.code, "invalid_grant");
    }
}
