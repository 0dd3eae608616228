/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

use std::sync::Once;

static INIT: Once = Once::new();

/// Install a `tracing` subscriber for the process.
///
/// Idempotent: later calls are no-ops so libraries and their test suites can both call this
/// without fighting over the global subscriber. Honors `RUST_LOG` if set, otherwise defaults to
/// `info`.
pub fn init_tracing() {
    INIT.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .try_init();
    });
}
