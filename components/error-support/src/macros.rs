/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Call-site macros for error reporting and breadcrumbs.
//!
//! These wrap [`crate::reporting`] so callers don't have to thread through
//! `module_path!()`/`line!()`/`column!()` by hand.

/// Report an error to the embedding application's error reporter, formatting like `format!`.
///
/// The first argument is the report "type name" used to group occurrences together.
#[macro_export]
macro_rules! report_error {
    ($type_name:expr, $($arg:tt)*) => {{
        let message = format!($($arg)*);
        $crate::log::error!("{}", message);
        $crate::reporting::report_error_to_app($type_name.to_string(), message);
    }};
}

/// Leave a breadcrumb, formatting like `format!`.
///
/// Breadcrumbs are cheap, frequent markers (state transitions, retries) that get attached to the
/// next reported error so it has context leading up to the failure.
#[macro_export]
macro_rules! breadcrumb {
    ($($arg:tt)*) => {{
        let message = format!($($arg)*);
        $crate::log::debug!("{}", message);
        $crate::reporting::report_breadcrumb(
            message,
            module_path!().to_string(),
            line!(),
            column!(),
        );
    }};
}
