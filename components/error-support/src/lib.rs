/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Shared error-handling and logging building blocks.
//!
//! Crates in this workspace define their own `ErrorKind`/`Error` types with `thiserror`, then
//! implement [`GetErrorHandling`] to decide, per error, whether it should be logged, reported to
//! an application-level error reporter, or passed through silently. This keeps the
//! log-vs-report-vs-ignore policy next to the code that understands the error, instead of
//! scattered across call sites.

pub mod handling;
#[macro_use]
mod macros;
pub mod redact;
pub mod reporting;
mod tracing_init;

pub use handling::{convert_log_report_error, ErrorHandling, ErrorReporting, GetErrorHandling};
pub use reporting::{
    report_breadcrumb, report_error_to_app, set_application_error_reporter,
    unset_application_error_reporter, ApplicationErrorReporter, ArcReporterAdapter,
    TestErrorReporter,
};
pub use tracing_init::init_tracing;

// Re-exported so `report_error!`/`breadcrumb!` can call `$crate::log::*` from other crates.
pub use log;

pub use log::{debug, error, info, trace, warn};
