/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The Settings document and its persistence.
//!
//! Serialization uses a tagged container keyed on `schema_version`, with the current schema named
//! explicitly (`SettingsV1`) so that a future incompatible change can add `SettingsV2` and an
//! explicit `From<SettingsV1>` migration, while backwards-compatible additions stay on
//! `SettingsV1` behind `#[serde(default)]`.
//!
//! [`Config`] is the one-transaction-at-a-time store built on top of the tagged document: every
//! mutation loads the current document, applies a closure, and atomically rewrites the whole thing
//! through the embedder's [`crate::collaborators::ConfigStore`] — there is no partial-field update.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::collaborators::ConfigStore;
use crate::error::{Error, Result};

/// The device's one auth-scope role granted to requests carrying no Privet token at all. `None`
/// means anonymous local requests are rejected outright.
pub type LocalRole = Option<crate::security::Role>;

pub(crate) type PersistedSettings = SettingsV1;

/// Parse a [`Settings`] document, performing schema migrations if necessary.
fn settings_from_json(data: &str) -> Result<PersistedSettings> {
    let tagged: SettingsTagged = serde_json::from_str(data)?;
    Ok(upgrade(tagged))
}

fn settings_to_json(settings: &PersistedSettings) -> Result<String> {
    let tagged = SettingsTagged::V1(settings.clone());
    serde_json::to_string(&tagged).map_err(Into::into)
}

fn upgrade(tagged: SettingsTagged) -> PersistedSettings {
    match tagged {
        SettingsTagged::V1(settings) => settings,
    }
}

/// Tagged container for one of the settings schema versions. Serde picks the right `SettingsVX`
/// to deserialize based on the `schema_version` tag.
#[derive(Serialize, Deserialize)]
#[serde(tag = "schema_version")]
enum SettingsTagged {
    V1(SettingsV1),
}

/// The current settings schema. All fields are public so the rest of the crate can read
/// and update them directly through [`Config`].
///
/// If you need to add a field:
///   * Backwards-compatible (has a sensible default): add it here behind `#[serde(default)]`.
///   * Backwards-incompatible: define `SettingsV2` and an explicit `From<SettingsV1>` migration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SettingsV1 {
    // Vendor-supplied identity, set once at provisioning time and never rewritten by the agent.
    pub client_id: String,
    pub client_secret: String,
    pub api_key: String,
    pub oauth_url: String,
    pub service_url: String,
    pub oem_name: String,
    pub model_name: String,
    pub model_id: String,

    // User/vendor-facing device description, mutable via Privet `/setup` or Cloud commands.
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub location: String,

    // Registration state. Present only once registration has completed.
    #[serde(default)]
    pub cloud_id: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub robot_account: Option<String>,

    // Local security state.
    #[serde(default)]
    pub device_secret: Option<Vec<u8>>,
    #[serde(default)]
    pub local_anonymous_access_role: LocalRole,
    #[serde(default = "default_true")]
    pub local_discovery_enabled: bool,
    #[serde(default = "default_true")]
    pub local_pairing_enabled: bool,
    #[serde(default)]
    pub wifi_auto_setup_enabled: bool,
    #[serde(default)]
    pub disable_security: bool,

    // Pairing advertisement.
    #[serde(default)]
    pub pairing_modes: Vec<String>,
    #[serde(default)]
    pub embedded_code: Option<String>,
}

fn default_true() -> bool {
    true
}

/// Public alias used by the rest of the crate; kept distinct from `SettingsV1` so call sites never
/// need to know the persisted schema version.
pub type Settings = SettingsV1;

impl Settings {
    pub fn is_registered(&self) -> bool {
        self.cloud_id.is_some() && self.refresh_token.is_some()
    }
}

/// The one-transaction-at-a-time settings store.
///
/// All reads and writes go through `Config` rather than touching a `ConfigStore` directly, so that
/// "a transaction atomically rewrites the entire document" is enforced in one place: the document
/// is never partially updated, and concurrent transactions (there's only ever one task-loop thread,
/// but nested callbacks can still interleave) are serialized by the internal mutex.
pub struct Config {
    store: Arc<dyn ConfigStore>,
    settings: Mutex<Settings>,
}

impl Config {
    /// Load the persisted document (if any) over top of the embedder's defaults.
    pub fn load(store: Arc<dyn ConfigStore>) -> Result<Self> {
        let mut settings = Settings::default();
        store.load_defaults(&mut settings);
        if let Some(json) = store.load_settings()? {
            settings = settings_from_json(&json)?;
        }
        Ok(Self {
            store,
            settings: Mutex::new(settings),
        })
    }

    /// Read-only snapshot of the current settings.
    pub fn snapshot(&self) -> Settings {
        self.settings.lock().clone()
    }

    /// Apply `mutator` to the settings and atomically persist the result. If persistence fails the
    /// in-memory settings are rolled back to their pre-transaction value, so a failed transaction
    /// never leaves memory and disk disagreeing.
    pub fn transact<F, T>(&self, mutator: F) -> Result<T>
    where
        F: FnOnce(&mut Settings) -> Result<T>,
    {
        let mut guard = self.settings.lock();
        let before = guard.clone();
        let result = mutator(&mut guard);
        match result {
            Ok(value) => match settings_to_json(&guard) {
                Ok(json) => match self.store.save_settings(&json) {
                    Ok(()) => Ok(value),
                    Err(e) => {
                        *guard = before;
                        Err(e)
                    }
                },
                Err(e) => {
                    *guard = before;
                    Err(e)
                }
            },
            Err(e) => {
                *guard = before;
                Err(e)
            }
        }
    }

    pub fn require_cloud_id(&self) -> Result<String> {
        self.snapshot()
            .cloud_id
            .ok_or_else(|| Error::gcd("not_registered", "device has not completed registration"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct MemoryStore {
        doc: StdMutex<Option<String>>,
    }

    impl ConfigStore for MemoryStore {
        fn load_defaults(&self, settings: &mut Settings) {
            settings.oem_name = "Acme".into();
            settings.local_discovery_enabled = true;
        }

        fn load_settings(&self) -> Result<Option<String>> {
            Ok(self.doc.lock().unwrap().clone())
        }

        fn save_settings(&self, json: &str) -> Result<()> {
            *self.doc.lock().unwrap() = Some(json.to_string());
            Ok(())
        }
    }

    #[test]
    fn test_load_applies_defaults_when_nothing_persisted() {
        let config = Config::load(Arc::new(MemoryStore::default())).unwrap();
        let settings = config.snapshot();
        assert_eq!(settings.oem_name, "Acme");
        assert!(!settings.is_registered());
    }

    #[test]
    fn test_transact_persists_and_reloads() {
        let store = Arc::new(MemoryStore::default());
        let config = Config::load(store.clone()).unwrap();
        config
            .transact(|s| {
                s.cloud_id = Some("cloud-123".into());
                s.refresh_token = Some("rt-abc".into());
                Ok(())
            })
            .unwrap();

        let reloaded = Config::load(store).unwrap();
        let settings = reloaded.snapshot();
        assert!(settings.is_registered());
        assert_eq!(settings.cloud_id.as_deref(), Some("cloud-123"));
    }

    #[test]
    fn test_transact_failure_rolls_back_memory() {
        let config = Config::load(Arc::new(MemoryStore::default())).unwrap();
        let result: Result<()> = config.transact(|s| {
            s.name = "should not stick".into();
            Err(Error::buffet("boom", "deliberate failure"))
        });
        assert!(result.is_err());
        assert_eq!(config.snapshot().name, "");
    }

    #[test]
    fn test_require_cloud_id_before_registration() {
        let config = Config::load(Arc::new(MemoryStore::default())).unwrap();
        assert!(config.require_cloud_id().is_err());
    }

    #[test]
    fn test_unknown_schema_version_rejected() {
        let bogus = "{\"schema_version\":\"V99\"}";
        assert!(settings_from_json(bogus).is_err());
    }

    #[test]
    fn test_transact_failure_does_not_call_save() {
        use crate::collaborators::MockConfigStore;
        use mockall::predicate::always;

        let mut store = MockConfigStore::new();
        store.expect_load_defaults().return_const(());
        store.expect_load_settings().returning(|| Ok(None));
        store.expect_save_settings().times(0);
        let config = Config::load(Arc::new(store)).unwrap();

        let result: Result<()> = config.transact(|_| Err(Error::buffet("boom", "deliberate failure")));
        assert!(result.is_err());

        let mut store = MockConfigStore::new();
        store.expect_load_defaults().return_const(());
        store.expect_load_settings().returning(|| Ok(None));
        store
            .expect_save_settings()
            .with(always())
            .times(1)
            .returning(|_| Ok(()));
        let config = Config::load(Arc::new(store)).unwrap();
        config
            .transact(|s| {
                s.cloud_id = Some("cloud-xyz".into());
                Ok(())
            })
            .unwrap();
    }
}
