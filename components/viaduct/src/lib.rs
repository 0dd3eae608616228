/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! A small HTTP client abstraction.
//!
//! Request construction and response parsing are backend-agnostic; the actual transport is
//! supplied by whichever crate calls [`set_backend`] (normally `viaduct-reqwest`, once, at process
//! startup). This indirection lets the agent crate send requests without linking a concrete HTTP
//! stack, and lets tests install a mock [`Client`] instead.

mod error;
mod request;
pub mod settings;
pub mod webparam;

pub use error::{MapBackendError, Result, UnexpectedStatus, ViaductError};
pub use request::{
    HeaderName, Headers, Method, Request, Response, AUTHORIZATION, CONTENT_TYPE, USER_AGENT,
};

use std::sync::{Arc, OnceLock};

/// The transport collaborator (§6 of the agent spec: "HTTP client: `send(method, url, headers,
/// body, timeout) -> (status, content_type, bytes)` via callback"). `async_trait` lets a real
/// backend do non-blocking I/O while `send_sync` still gives synchronous callers (the bulk of the
/// agent's code, which runs on a single-threaded task loop) a blocking call.
#[async_trait::async_trait]
pub trait Client: Send + Sync + 'static {
    async fn send(&self, request: Request) -> Result<Response>;
}

static REGISTERED_CLIENT: OnceLock<Arc<dyn Client>> = OnceLock::new();

/// Install the process-wide HTTP backend. May only be called once; subsequent calls return
/// [`ViaductError::BackendAlreadyInitialized`].
pub fn set_backend(client: Arc<dyn Client>) -> Result<()> {
    REGISTERED_CLIENT
        .set(client)
        .map_err(|_| ViaductError::BackendAlreadyInitialized)
}

fn get_backend() -> Result<&'static Arc<dyn Client>> {
    REGISTERED_CLIENT
        .get()
        .ok_or(ViaductError::BackendNotInitialized)
}

/// Send a request using whatever backend was installed with [`set_backend`].
pub async fn send(mut request: Request) -> Result<Response> {
    settings::validate_request(&request)?;
    if request.timeout.is_none() {
        request.timeout = settings::GLOBAL_SETTINGS.read().default_timeout;
    }
    get_backend()?.send(request).await
}

/// Blocking variant of [`send`], for the (common, in this codebase) case of a caller that isn't
/// already inside an async task.
pub fn send_sync(request: Request) -> Result<Response> {
    pollster::block_on(send(request))
}
