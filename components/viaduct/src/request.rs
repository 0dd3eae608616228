/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

use crate::error::{Result, ViaductError};
use std::collections::BTreeMap;
use std::fmt;
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Patch,
    Delete,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
        })
    }
}

/// A header name, lowercased and validated to contain only legal token characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HeaderName(String);

impl HeaderName {
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if name.is_empty() || !name.bytes().all(|b| b.is_ascii_graphic() && b != b':') {
            return Err(ViaductError::RequestHeaderError(name));
        }
        Ok(Self(name.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

pub const CONTENT_TYPE: &str = "content-type";
pub const AUTHORIZATION: &str = "authorization";
pub const USER_AGENT: &str = "user-agent";

#[derive(Debug, Clone, Default)]
pub struct Headers(BTreeMap<String, String>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(_cap: usize) -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: HeaderName, value: impl Into<String>) {
        self.0.insert(name.0, value.into());
    }

    pub fn insert_if_missing(&mut self, name: HeaderName, value: impl Into<String>) {
        self.0.entry(name.0).or_insert_with(|| value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// An outgoing HTTP request. Construct via [`Request::new`] and the method helpers, chain
/// `.header()`/`.json()`/`.form()` to fill it in, then hand it to [`crate::Client::send`].
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub url: Url,
    pub headers: Headers,
    pub body: Option<Vec<u8>>,
    pub timeout: Option<std::time::Duration>,
}

impl Request {
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: Headers::new(),
            body: None,
            timeout: None,
        }
    }

    pub fn get(url: Url) -> Self {
        Self::new(Method::Get, url)
    }

    pub fn post(url: Url) -> Self {
        Self::new(Method::Post, url)
    }

    pub fn patch(url: Url) -> Self {
        Self::new(Method::Patch, url)
    }

    pub fn header(mut self, name: &str, value: impl Into<String>) -> Result<Self> {
        self.headers.insert(HeaderName::new(name)?, value);
        Ok(self)
    }

    pub fn timeout(mut self, timeout: std::time::Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set a JSON body and `Content-Type: application/json; charset=utf-8`, per the Cloud wire
    /// format used by every authorized call.
    pub fn json<T: serde::Serialize>(mut self, value: &T) -> Result<Self> {
        let body = serde_json::to_vec(value)
            .map_err(|e| ViaductError::BackendError(format!("JSON encode error: {e}")))?;
        self.body = Some(body);
        self.headers.insert(
            HeaderName::new(CONTENT_TYPE)?,
            "application/json; charset=utf-8",
        );
        Ok(self)
    }

    /// Set a `application/x-www-form-urlencoded` body, WebParam-encoded.
    pub fn form(mut self, fields: &[(&str, &str)]) -> Result<Self> {
        self.body = Some(crate::webparam::encode_form(fields).into_bytes());
        self.headers.insert(
            HeaderName::new(CONTENT_TYPE)?,
            "application/x-www-form-urlencoded",
        );
        Ok(self)
    }

    pub fn bearer_auth(mut self, token: &str) -> Result<Self> {
        self.headers
            .insert(HeaderName::new(AUTHORIZATION)?, format!("Bearer {token}"));
        Ok(self)
    }
}

#[derive(Debug, Clone)]
pub struct Response {
    pub request_method: Method,
    pub url: Url,
    pub status: u16,
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl Response {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers.get(CONTENT_TYPE)
    }

    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.body)
            .map_err(|e| ViaductError::BackendError(format!("JSON decode error: {e}")))
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn require_success(self) -> std::result::Result<Self, crate::error::UnexpectedStatus> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(crate::error::UnexpectedStatus {
                status: self.status,
                method: self.request_method,
                url: self.url,
            })
        }
    }
}
