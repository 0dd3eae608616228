/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Shared test-only helpers: an in-process mock [`viaduct::Client`] backend.
//!
//! `viaduct::set_backend` may only be called once per process (it's a `OnceLock`), but this
//! crate's unit tests live across many files and all share one test binary, each wanting a
//! different canned response for the same conceptual endpoint. Rather than route on call order
//! (fragile under `cargo test`'s parallel, unordered execution), [`MockCloud`] keys responses by
//! exact request URL, so unrelated tests never interfere as long as each uses its own
//! `https://.../unique-per-test/...` host or path.

use std::collections::HashMap;
use std::sync::Mutex as StdMutex;

use once_cell::sync::Lazy;

pub struct MockCloud {
    responses: StdMutex<HashMap<String, (u16, Vec<u8>)>>,
}

static MOCK: Lazy<MockCloud> = Lazy::new(|| MockCloud {
    responses: StdMutex::new(HashMap::new()),
});

/// Install the mock backend (idempotent; safe to call from every test that needs it).
pub fn install() {
    let _ = viaduct::set_backend(std::sync::Arc::new(MockClient));
}

/// Register the response the mock backend should return for exact-match `url`.
pub fn stub(url: &str, status: u16, body: &str) {
    MOCK.responses
        .lock()
        .unwrap()
        .insert(url.to_string(), (status, body.as_bytes().to_vec()));
}

struct MockClient;

#[async_trait::async_trait]
impl viaduct::Client for MockClient {
    async fn send(&self, request: viaduct::Request) -> viaduct::Result<viaduct::Response> {
        let key = request.url.as_str().to_string();
        let (status, body) = MOCK
            .responses
            .lock()
            .unwrap()
            .get(&key)
            .cloned()
            .unwrap_or_else(|| {
                panic!("no stub registered for {key} — call gcd_agent::testing::stub() first")
            });
        Ok(viaduct::Response {
            request_method: request.method,
            url: request.url,
            status,
            headers: viaduct::Headers::new(),
            body,
        })
    }
}
