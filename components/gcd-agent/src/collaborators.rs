/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! External collaborator interfaces.
//!
//! The embedding application supplies real implementations of these; this crate never implements
//! Wi-Fi toggling, mDNS advertisement, a TLS listener, or persistent storage itself. The HTTP
//! transport collaborator is not redeclared here — it's `viaduct::Client`, already modeled in this
//! workspace and reused unmodified.

use std::collections::BTreeMap;

use crate::error::Result;

/// Persists the Settings document. `load_settings`/`save_settings` operate on the
/// serialized JSON document as a whole; the transactional "atomically rewrite the entire document"
/// discipline lives in [`crate::config::Config`], one layer up, not here.
#[cfg_attr(test, mockall::automock)]
pub trait ConfigStore: Send + Sync {
    /// Called once at startup to fill in any settings this device ships with defaults for
    /// (oem_name, model_name, ...) before a persisted document (if any) is loaded over top.
    fn load_defaults(&self, settings: &mut crate::config::Settings);
    fn load_settings(&self) -> Result<Option<String>>;
    fn save_settings(&self, json: &str) -> Result<()>;
}

/// Reports connectivity changes.
pub trait NetworkMonitor: Send + Sync {
    fn is_online(&self) -> bool;
}

/// Wi-Fi bootstrap, out of scope for this crate's logic but still a consumed interface. The agent only calls through this; it never arbitrates driver quirks.
pub trait WifiManager: Send + Sync {
    fn connect(&self, ssid: &str, passphrase: &str) -> Result<()>;
    fn start_ap(&self, ssid: &str) -> Result<()>;
    fn stop_ap(&self) -> Result<()>;
}

/// mDNS/DNS-SD advertisement. Payload formatting is the collaborator's concern; the
/// agent only supplies the TXT record contents it wants published.
pub trait DnsSdPublisher: Send + Sync {
    fn publish(&self, service_type: &str, port: u16, txt: &BTreeMap<String, String>) -> Result<()>;
    fn update(&self, txt: &BTreeMap<String, String>) -> Result<()>;
}

/// The device application that actually executes commands. The
/// registration controller (for Cloud-sourced commands) and the Privet handler (for local ones)
/// both dispatch a validated [`crate::command::CommandInstance`] through here after catalog
/// validation and role enforcement have already passed.
pub trait CommandHandler: Send + Sync {
    /// Accept (or reject) a newly queued command. Returning `Ok(())` means the handler has taken
    /// ownership of driving it to completion via the `CommandInstance` API (`set_progress`,
    /// `complete`, ...); returning `Err` causes the caller to fail the command immediately.
    fn handle(&self, command: std::sync::Arc<crate::command::CommandInstance>) -> Result<()>;
}
