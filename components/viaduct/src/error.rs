/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

pub type Result<T, E = ViaductError> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum ViaductError {
    #[error("Illegal characters in request header '{0}'")]
    RequestHeaderError(String),

    #[error("Backend error: {0}")]
    BackendError(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("The network backend can only be initialized once")]
    BackendAlreadyInitialized,

    #[error("The network backend must be initialized before use")]
    BackendNotInitialized,

    #[error("URL Parse Error: {0}")]
    UrlError(String),

    #[error("Validation error: URL does not use TLS")]
    NonTlsUrl,
}

impl ViaductError {
    pub fn new_backend_error(msg: impl Into<String>) -> Self {
        Self::BackendError(msg.into())
    }
}

impl From<url::ParseError> for ViaductError {
    fn from(e: url::ParseError) -> Self {
        ViaductError::UrlError(e.to_string())
    }
}

/// Returned from [`crate::Response::require_success`].
///
/// Not a variant on `ViaductError` so callers can distinguish network failure from a well-formed
/// but unsuccessful response.
#[derive(thiserror::Error, Debug, Clone)]
#[error("{method} {url} returned {status}")]
pub struct UnexpectedStatus {
    pub status: u16,
    pub method: crate::Method,
    pub url: url::Url,
}

/// Map errors from external crates (that implement `ToString`) to `ViaductError::BackendError`.
pub trait MapBackendError {
    type Ok;

    fn map_backend_error(self) -> Result<Self::Ok>;
}

impl<T, E: ToString> MapBackendError for std::result::Result<T, E> {
    type Ok = T;

    fn map_backend_error(self) -> Result<T> {
        self.map_err(|e| ViaductError::BackendError(e.to_string()))
    }
}
