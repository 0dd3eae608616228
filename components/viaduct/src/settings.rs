/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use std::time::Duration;
use url::Url;

/// Process-wide defaults, mirrored by every backend. A concrete [`crate::Client`] may still
/// override per-request via [`crate::Request::timeout`].
#[derive(Debug)]
#[non_exhaustive]
pub struct Settings {
    pub default_timeout: Option<Duration>,
    pub follow_redirects: bool,
    pub default_user_agent: Option<String>,
    // For testing purposes we allow exactly one additional non-HTTPS URL through.
    pub addn_allowed_insecure_url: Option<Url>,
}

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

pub static GLOBAL_SETTINGS: Lazy<RwLock<Settings>> = Lazy::new(|| {
    RwLock::new(Settings {
        default_timeout: Some(DEFAULT_TIMEOUT),
        follow_redirects: true,
        default_user_agent: None,
        addn_allowed_insecure_url: None,
    })
});

/// Set the global default user-agent, used when no `user-agent` header is set on the request.
pub fn set_global_default_user_agent(user_agent: String) {
    GLOBAL_SETTINGS.write().default_user_agent = Some(user_agent);
}

/// Allow one additional non-HTTPS origin through [`validate_request`] (tests, local dev servers).
pub fn allow_insecure_url_for_testing(url: Url) {
    GLOBAL_SETTINGS.write().addn_allowed_insecure_url = Some(url);
}

/// Reject non-HTTPS requests, except to loopback/localhost or the one testing exception above.
pub fn validate_request(request: &crate::Request) -> Result<(), crate::ViaductError> {
    if request.url.scheme() != "https"
        && match request.url.host() {
            Some(url::Host::Domain(d)) => d != "localhost",
            Some(url::Host::Ipv4(addr)) => !addr.is_loopback(),
            Some(url::Host::Ipv6(addr)) => !addr.is_loopback(),
            None => true,
        }
        && {
            let settings = GLOBAL_SETTINGS.read();
            settings
                .addn_allowed_insecure_url
                .as_ref()
                .map(|url| url.host() != request.url.host() || url.scheme() != request.url.scheme())
                .unwrap_or(true)
        }
    {
        return Err(crate::ViaductError::NonTlsUrl);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_request() {
        let https = crate::Request::get(Url::parse("https://www.example.com").unwrap());
        assert!(validate_request(&https).is_ok());

        let http = crate::Request::get(Url::parse("http://www.example.com").unwrap());
        assert!(validate_request(&http).is_err());

        let loopback = crate::Request::get(Url::parse("https://127.0.0.1/index.html").unwrap());
        assert!(validate_request(&loopback).is_ok());

        let localhost = crate::Request::get(Url::parse("http://localhost:4242/").unwrap());
        assert!(validate_request(&localhost).is_ok());
    }

    #[test]
    fn test_validate_request_addn_allowed_insecure_url() {
        let request = crate::Request::get(Url::parse("http://anything/path").unwrap());
        assert!(validate_request(&request).is_err());
        allow_insecure_url_for_testing(Url::parse("http://anything").unwrap());
        assert!(validate_request(&request).is_ok());
        let other = crate::Request::get(Url::parse("http://something-else/path").unwrap());
        assert!(validate_request(&other).is_err());
    }
}
