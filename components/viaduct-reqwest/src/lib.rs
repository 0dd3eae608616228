/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Real transport for [`viaduct::Client`], backed by `reqwest`.
//!
//! Installed once at process startup with [`use_reqwest_backend`]. Everything else in the
//! workspace talks to `viaduct::send`/`send_sync` and never imports this crate directly except in
//! `main()`/test setup, so swapping transports (or installing a mock `Client` in tests) doesn't
//! touch call sites.

use error_support::warn;
use once_cell::sync::Lazy;
use std::sync::{Arc, Once};
use viaduct::{Client, Headers, HeaderName, Method, Request, Response, Result, ViaductError};

static CLIENT: Lazy<reqwest::Client> = Lazy::new(|| {
    reqwest::Client::builder()
        .build()
        .expect("failed to initialize reqwest::Client")
});

fn method_to_reqwest(method: Method) -> reqwest::Method {
    match method {
        Method::Get => reqwest::Method::GET,
        Method::Head => reqwest::Method::HEAD,
        Method::Post => reqwest::Method::POST,
        Method::Put => reqwest::Method::PUT,
        Method::Patch => reqwest::Method::PATCH,
        Method::Delete => reqwest::Method::DELETE,
    }
}

fn into_reqwest(request: &Request) -> std::result::Result<reqwest::Request, ViaductError> {
    let mut builder = CLIENT.request(method_to_reqwest(request.method), request.url.clone());
    for (name, value) in request.headers.iter() {
        builder = builder.header(name, value);
    }
    if let Some(timeout) = request.timeout {
        builder = builder.timeout(timeout);
    }
    if let Some(body) = &request.body {
        builder = builder.body(body.clone());
    }
    builder
        .build()
        .map_err(|e| ViaductError::BackendError(e.to_string()))
}

pub struct ReqwestClient;

#[async_trait::async_trait]
impl Client for ReqwestClient {
    async fn send(&self, request: Request) -> Result<Response> {
        let request_method = request.method;
        let url = request.url.clone();
        let req = into_reqwest(&request)?;
        let resp = CLIENT
            .execute(req)
            .await
            .map_err(|e| ViaductError::NetworkError(e.to_string()))?;
        let status = resp.status().as_u16();
        let mut headers = Headers::new();
        for (name, value) in resp.headers() {
            match value.to_str() {
                Ok(v) => match HeaderName::new(name.as_str()) {
                    Ok(header_name) => headers.insert(header_name, v.to_string()),
                    Err(_) => warn!("server sent back invalid header name: '{}'", name),
                },
                Err(_) => warn!("server sent back non-UTF8 header value for '{}'", name),
            }
        }
        let body = resp
            .bytes()
            .await
            .map_err(|e| ViaductError::NetworkError(e.to_string()))?
            .to_vec();
        Ok(Response {
            request_method,
            url,
            status,
            headers,
            body,
        })
    }
}

static INIT: Once = Once::new();

/// Install the reqwest-backed [`Client`] as the process-wide viaduct backend. Idempotent.
pub fn use_reqwest_backend() {
    INIT.call_once(|| {
        viaduct::set_backend(Arc::new(ReqwestClient)).expect("viaduct backend already set");
    })
}
