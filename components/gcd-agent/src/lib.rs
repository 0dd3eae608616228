/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

#![warn(rust_2018_idioms)]

//! The on-device Cloud/Privet agent: registration and session lifecycle with Cloud, the command
//! catalog and per-command upload pipeline, and the Privet local protocol.
//!
//! [`GcdAgent`] is the one entry point embedders construct; it wires together the pieces the rest
//! of this crate exposes as individually testable modules into a single facade.

pub mod catalog;
pub mod collaborators;
pub mod command;
pub mod config;
pub mod controller;
pub mod error;
pub mod oauth;
pub mod privet;
pub mod scheduler;
pub mod schema;
pub mod security;
pub mod state_queue;

#[cfg(test)]
pub(crate) mod testing;

pub use error_support::init_tracing;

use std::sync::Arc;

use parking_lot::Mutex;

use crate::catalog::{CommandCatalog, DefinitionTree};
use crate::collaborators::{CommandHandler, ConfigStore, DnsSdPublisher, NetworkMonitor, WifiManager};
use crate::config::Config;
use crate::controller::{Controller, GcdEvent};
use crate::error::Result;
use crate::oauth::{CloudClient, TokenManager};
use crate::privet::{PrivetHandler, PrivetRequest, PrivetResponse};
use crate::scheduler::TaskRunner;
use crate::security::SecurityManager;
use crate::state_queue::StateChangeQueue;

/// Everything the embedder supplies to construct one [`GcdAgent`]: the collaborator
/// implementations, the base command catalog, and an optional vendor overlay.
pub struct GcdAgentBuilder {
    pub config_store: Arc<dyn ConfigStore>,
    pub network_monitor: Arc<dyn NetworkMonitor>,
    pub command_handler: Arc<dyn CommandHandler>,
    pub task_runner: Arc<dyn TaskRunner>,
    pub base_commands: DefinitionTree,
    pub vendor_commands: Option<DefinitionTree>,
    pub wifi_manager: Option<Arc<dyn WifiManager>>,
    pub dns_sd_publisher: Option<Arc<dyn DnsSdPublisher>>,
    /// The local HTTPS listener's own certificate fingerprint.
    pub cert_fingerprint: Vec<u8>,
}

/// The top-level facade: owns Settings, the Cloud registration/session controller, the command
/// catalog, the local security manager, and the Privet request router. An embedder drives the
/// state machine by calling [`GcdAgent::refresh_and_transition`]/[`GcdAgent::poll_commands`]/
/// [`GcdAgent::upload_state`] from its own task loop and dispatches local HTTP requests through
/// [`GcdAgent::privet`].
pub struct GcdAgent {
    config: Arc<Config>,
    controller: Arc<Controller>,
    security: Arc<SecurityManager>,
    privet: PrivetHandler,
    state_queue: Arc<StateChangeQueue>,
    dns_sd: Option<Arc<dyn DnsSdPublisher>>,
}

impl GcdAgent {
    pub fn new(builder: GcdAgentBuilder) -> Result<Self> {
        let config = Arc::new(Config::load(builder.config_store)?);
        let settings = config.snapshot();
        let tokens = Arc::new(TokenManager::new(
            settings.oauth_url.clone(),
            settings.client_id.clone(),
            settings.client_secret.clone(),
        ));
        let cloud = Arc::new(CloudClient::new(tokens.clone()));

        let mut catalog = CommandCatalog::new();
        catalog.load_base(builder.base_commands)?;
        if let Some(vendor) = builder.vendor_commands {
            catalog.load_vendor(vendor)?;
        }
        let catalog = Arc::new(Mutex::new(catalog));

        let state_queue = Arc::new(StateChangeQueue::new(builder.task_runner.clone()));
        let controller = Arc::new(Controller::new(
            config.clone(),
            tokens,
            cloud,
            catalog,
            state_queue.clone(),
            builder.task_runner,
            builder.network_monitor,
            builder.command_handler,
        ));
        controller.apply(GcdEvent::SettingsLoaded);

        let security = Arc::new(SecurityManager::new(config.clone())?);
        let mut privet = PrivetHandler::new(Arc::downgrade(&controller), security.clone(), builder.cert_fingerprint);
        if let Some(wifi) = builder.wifi_manager {
            privet = privet.with_wifi(wifi);
        }

        Ok(Self {
            config,
            controller,
            security,
            privet,
            state_queue,
            dns_sd: builder.dns_sd_publisher,
        })
    }

    pub fn controller(&self) -> &Arc<Controller> {
        &self.controller
    }

    pub fn security(&self) -> &Arc<SecurityManager> {
        &self.security
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    /// Dispatch a parsed local request through the Privet route table.
    pub fn handle_privet_request(&self, request: &PrivetRequest) -> PrivetResponse {
        self.privet.dispatch(request)
    }

    /// Publish (or refresh) the device's mDNS/DNS-SD advertisement, if the
    /// embedder supplied a publisher and local discovery is enabled in Settings.
    pub fn publish_discovery(&self, service_type: &str, port: u16) -> Result<()> {
        let settings = self.config.snapshot();
        if !settings.local_discovery_enabled {
            return Ok(());
        }
        let Some(publisher) = &self.dns_sd else {
            return Ok(());
        };
        let mut txt = std::collections::BTreeMap::new();
        txt.insert("id".to_string(), settings.cloud_id.clone().unwrap_or_default());
        txt.insert("name".to_string(), settings.name.clone());
        txt.insert("ty".to_string(), settings.model_name.clone());
        publisher.publish(service_type, port, &txt)
    }

    /// Drive one iteration of the session loop: refresh the access token if needed,
    /// long-poll for commands, and flush any accumulated state changes. The embedder's task loop
    /// calls this repeatedly; each step is independently retryable and idempotent on failure.
    pub fn tick(&self) -> Result<()> {
        self.controller.refresh_and_transition();
        if self.controller.state() == controller::GcdState::Connected {
            self.controller.poll_commands()?;
            self.controller.flush_command_updates();
            self.controller.upload_state()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::privet::Method;
    use crate::scheduler::{TaskHandle, TaskRunner};
    use crate::security::Role;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    #[derive(Default)]
    struct MemoryStore {
        doc: StdMutex<Option<String>>,
    }
    impl ConfigStore for MemoryStore {
        fn load_defaults(&self, settings: &mut crate::config::Settings) {
            settings.service_url = "https://gcd.example.com/".into();
            settings.oauth_url = "https://oauth.example.com/".into();
            settings.api_key = "K".into();
            settings.client_id = "CID".into();
            settings.client_secret = "CS".into();
            settings.name = "Test Device".into();
            settings.local_anonymous_access_role = Some(Role::Viewer);
        }
        fn load_settings(&self) -> Result<Option<String>> {
            Ok(self.doc.lock().unwrap().clone())
        }
        fn save_settings(&self, json: &str) -> Result<()> {
            *self.doc.lock().unwrap() = Some(json.to_string());
            Ok(())
        }
    }

    struct NoopTaskRunner;
    impl TaskRunner for NoopTaskRunner {
        fn post(&self, task: Box<dyn FnOnce() + Send>) {
            task();
        }
        fn post_delayed(&self, _task: Box<dyn FnOnce() + Send>, _delay: Duration) -> Box<dyn TaskHandle> {
            struct NoopHandle;
            impl TaskHandle for NoopHandle {
                fn cancel(&self) {}
            }
            Box::new(NoopHandle)
        }
    }

    struct AlwaysOnline;
    impl NetworkMonitor for AlwaysOnline {
        fn is_online(&self) -> bool {
            true
        }
    }

    struct AcceptingHandler;
    impl CommandHandler for AcceptingHandler {
        fn handle(&self, _command: Arc<crate::command::CommandInstance>) -> Result<()> {
            Ok(())
        }
    }

    fn base_catalog() -> DefinitionTree {
        let mut commands = std::collections::BTreeMap::new();
        commands.insert(
            "setVolume".to_string(),
            crate::catalog::CommandDefinition {
                parameters: crate::schema::Schema::Object {
                    properties: {
                        let mut m = std::collections::BTreeMap::new();
                        m.insert("level".to_string(), crate::schema::Schema::Integer { minimum: Some(0), maximum: Some(100) });
                        m
                    },
                },
                progress: None,
                results: None,
                minimal_role: Role::User,
            },
        );
        let mut tree = std::collections::BTreeMap::new();
        tree.insert("base".to_string(), commands);
        tree
    }

    fn build_agent() -> GcdAgent {
        GcdAgent::new(GcdAgentBuilder {
            config_store: Arc::new(MemoryStore::default()),
            network_monitor: Arc::new(AlwaysOnline),
            command_handler: Arc::new(AcceptingHandler),
            task_runner: Arc::new(NoopTaskRunner),
            base_commands: base_catalog(),
            vendor_commands: None,
            wifi_manager: None,
            dns_sd_publisher: None,
            cert_fingerprint: vec![0xAB, 0xCD],
        })
        .unwrap()
    }

    #[test]
    fn test_new_agent_starts_unconfigured() {
        let agent = build_agent();
        assert_eq!(agent.controller().state(), controller::GcdState::Unconfigured);
    }

    #[test]
    fn test_privet_info_reachable_through_facade() {
        let agent = build_agent();
        let response = agent.handle_privet_request(&PrivetRequest {
            method: Some(Method::Get),
            path: "/privet/info".to_string(),
            ..Default::default()
        });
        assert_eq!(response.status, 200);
        assert_eq!(response.body["name"], serde_json::json!("Test Device"));
    }

    #[test]
    fn test_execute_command_through_facade_rejects_insufficient_anonymous_role() {
        let agent = build_agent();
        let response = agent.handle_privet_request(&PrivetRequest {
            method: Some(Method::Post),
            path: "/privet/commands/execute".to_string(),
            body: serde_json::json!({"name": "base.setVolume", "parameters": {"level": 10}}),
            ..Default::default()
        });
        // Settings grant anonymous callers only `viewer`; `setVolume` requires `user`.
        assert_eq!(response.status, 401);
    }

    #[test]
    fn test_execute_command_through_facade_rejects_token_below_minimal_role() {
        let agent = build_agent();
        let token = agent.security().mint_anonymous_token(Role::Viewer).unwrap();
        let response = agent.handle_privet_request(&PrivetRequest {
            method: Some(Method::Post),
            path: "/privet/commands/execute".to_string(),
            authorization: Some(format!("Privet {token}")),
            body: serde_json::json!({"name": "base.setVolume", "parameters": {"level": 10}}),
            ..Default::default()
        });
        assert_eq!(response.status, 403);
    }

    #[test]
    fn test_publish_discovery_without_publisher_is_a_noop() {
        let agent = build_agent();
        assert!(agent.publish_discovery("_privet._tcp", 8080).is_ok());
    }
}
