/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The registration/session controller: the top-level `GcdState` machine, the
//! claim/finalize registration protocol, command long-polling, and state upload.
//!
//! Each trigger performs at most one blocking Cloud round-trip via `viaduct::send_sync` before
//! deciding the next state, so the whole transition table lives as one `match` in
//! [`Controller::apply`] rather than being split across per-state modules — there's no internal
//! sub-state loop that could run away and need a safety valve. See DESIGN.md.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use error_support::breadcrumb;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::Value;
use url::Url;

use crate::catalog::CommandCatalog;
use crate::collaborators::{CommandHandler, NetworkMonitor};
use crate::command::{CommandInstance, CommandUploader, Origin};
use crate::config::Config;
use crate::error::{Domain, Error, Result};
use crate::oauth::{classify_oauth_error, CloudClient, OAuthFailureClass, TokenManager};
use crate::scheduler::{Backoff, TaskRunner};
use crate::security::Role;
use crate::state_queue::StateChangeQueue;

/// `GcdState`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcdState {
    Unconfigured,
    InvalidCredentials,
    Disabled,
    Offline,
    Connecting,
    Connected,
}

/// Events the embedder (or the controller's own scheduled retries) feeds into the state machine.
#[derive(Debug)]
pub enum GcdEvent {
    SettingsLoaded,
    TokenRefreshSucceeded,
    TokenRefreshFailed(Error),
    NetworkLost,
    NetworkRestored,
    Reset,
    Disable,
    Enable,
}

#[derive(Debug, Deserialize)]
struct RegistrationTicket {
    #[serde(rename = "deviceDraft")]
    device_draft: DeviceDraft,
}

#[derive(Debug, Deserialize)]
struct DeviceDraft {
    id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FinalizeResponse {
    #[serde(rename = "robotAccountEmail")]
    robot_account_email: String,
    #[serde(rename = "robotAccountAuthorizationCode")]
    robot_account_authorization_code: String,
}

#[derive(Debug, Deserialize)]
struct TokenExchangeResponse {
    access_token: String,
    refresh_token: String,
    expires_in: u64,
}

#[derive(Debug, Deserialize)]
struct GcdServerError {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// A command as returned by `GET .../commands/queue` before it's been validated or materialized.
#[derive(Debug, Deserialize)]
struct RawCommand {
    id: String,
    name: String,
    #[serde(default)]
    parameters: Value,
}

#[derive(Debug, Deserialize)]
struct CommandQueueResponse {
    #[serde(default)]
    commands: Vec<RawCommand>,
}

/// Splits a dotted `component.name` command name into its two parts.
fn split_command_name(name: &str) -> Option<(&str, &str)> {
    name.split_once('.')
}

/// 8 random bytes for a locally-originated command id.
fn local_command_id_bytes() -> [u8; 8] {
    use rand::RngCore;
    let mut buf = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut buf);
    buf
}

/// The registration/session controller. Owns the Cloud token manager and HTTP
/// client exclusively; the Privet handler only ever sees a non-owning handle.
pub struct Controller {
    config: Arc<Config>,
    tokens: Arc<TokenManager>,
    cloud: Arc<CloudClient>,
    catalog: Arc<Mutex<CommandCatalog>>,
    state_queue: Arc<StateChangeQueue>,
    task_runner: Arc<dyn TaskRunner>,
    network: Arc<dyn NetworkMonitor>,
    command_handler: Arc<dyn CommandHandler>,
    state: Mutex<GcdState>,
    backoff: Mutex<Backoff>,
    commands: Mutex<HashMap<String, Arc<CommandInstance>>>,
}

impl Controller {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<Config>,
        tokens: Arc<TokenManager>,
        cloud: Arc<CloudClient>,
        catalog: Arc<Mutex<CommandCatalog>>,
        state_queue: Arc<StateChangeQueue>,
        task_runner: Arc<dyn TaskRunner>,
        network: Arc<dyn NetworkMonitor>,
        command_handler: Arc<dyn CommandHandler>,
    ) -> Self {
        let settings = config.snapshot();
        tokens.set_refresh_token(settings.refresh_token.clone());
        let initial = if settings.is_registered() { GcdState::Connecting } else { GcdState::Unconfigured };
        Self {
            config,
            tokens,
            cloud,
            catalog,
            state_queue,
            task_runner,
            network,
            command_handler,
            state: Mutex::new(initial),
            backoff: Mutex::new(Backoff::new()),
            commands: Mutex::new(HashMap::new()),
        }
    }

    pub fn state(&self) -> GcdState {
        *self.state.lock()
    }

    fn set_state(&self, next: GcdState) {
        let mut state = self.state.lock();
        breadcrumb!("gcd controller: {:?} -> {:?}", *state, next);
        *state = next;
    }

    /// Drive a pure state transition. HTTP side effects (registration, refresh) are
    /// performed by their own methods, which call this afterward with the outcome event.
    pub fn apply(&self, event: GcdEvent) {
        let current = self.state();
        match (current, event) {
            (_, GcdEvent::Reset) => {
                let _ = self.config.transact(|s| {
                    s.refresh_token = None;
                    s.cloud_id = None;
                    s.robot_account = None;
                    Ok(())
                });
                self.tokens.set_refresh_token(None);
                self.set_state(GcdState::Unconfigured);
            }
            (_, GcdEvent::Disable) => self.set_state(GcdState::Disabled),
            (GcdState::Disabled, GcdEvent::Enable) => {
                let registered = self.config.snapshot().is_registered();
                self.set_state(if registered { GcdState::Connecting } else { GcdState::Unconfigured });
            }
            (_, GcdEvent::Enable) => {}

            (GcdState::Unconfigured, GcdEvent::SettingsLoaded) => {
                if self.config.snapshot().is_registered() {
                    self.set_state(GcdState::Connecting);
                }
            }
            (_, GcdEvent::SettingsLoaded) => {}

            (_, GcdEvent::TokenRefreshSucceeded) => {
                self.backoff.lock().reset();
                self.set_state(GcdState::Connected);
            }
            (_, GcdEvent::TokenRefreshFailed(e)) => self.handle_token_failure(e),

            (GcdState::Unconfigured, GcdEvent::NetworkLost)
            | (GcdState::InvalidCredentials, GcdEvent::NetworkLost)
            | (GcdState::Disabled, GcdEvent::NetworkLost) => {}
            (_, GcdEvent::NetworkLost) => self.set_state(GcdState::Offline),

            (GcdState::Offline, GcdEvent::NetworkRestored) => {
                self.backoff.lock().reset();
                self.set_state(GcdState::Connecting);
            }
            (_, GcdEvent::NetworkRestored) => {}
        }
    }

    /// Classify a token-refresh failure and drive the resulting transition/retry.
    fn handle_token_failure(&self, error: Error) {
        let class = if error.domain == Domain::OAuth2 {
            classify_oauth_error(&error.code)
        } else {
            OAuthFailureClass::Transient
        };
        match class {
            OAuthFailureClass::InvalidCredentials => {
                self.set_state(GcdState::InvalidCredentials);
            }
            OAuthFailureClass::Transient => {
                self.set_state(GcdState::Connecting);
                self.schedule_retry();
            }
        }
    }

    fn schedule_retry(&self) {
        let delay = self.backoff.lock().next_delay();
        self.task_runner.post_delayed(Box::new(|| {}), delay);
    }

    /// Perform one token-refresh attempt and apply its outcome to the state machine. The embedder
    /// calls this after `SettingsLoaded`/`NetworkRestored` puts the controller into `connecting`,
    /// and again from the scheduled retry this method itself arms on failure.
    pub fn refresh_and_transition(&self) {
        if !self.network.is_online() {
            self.apply(GcdEvent::NetworkLost);
            return;
        }
        match self.tokens.get_access_token() {
            Ok(_) => self.apply(GcdEvent::TokenRefreshSucceeded),
            Err(e) => self.apply(GcdEvent::TokenRefreshFailed(e)),
        }
    }

    fn settings_url(&self, path: &str) -> Result<Url> {
        let base = self.config.snapshot().service_url;
        Url::parse(&base)
            .and_then(|u| u.join(path))
            .map_err(|e| Error::buffet("bad_service_url", e.to_string()))
    }

    fn gcd_server_error(status: u16, body: &[u8]) -> Error {
        let parsed: Option<GcdServerError> = serde_json::from_slice(body).ok();
        let code = parsed.as_ref().and_then(|b| b.code.clone()).unwrap_or_else(|| status.to_string());
        let message = parsed
            .and_then(|b| b.message)
            .unwrap_or_else(|| format!("gcd_server call failed with HTTP {status}"));
        Error::gcd_server(status, code, message)
    }

    /// Steps 1-3 of the registration protocol. No Settings are persisted until step 3
    /// (the token exchange) succeeds; on any failure, no changes are persisted and the state
    /// returns to `unconfigured`.
    pub fn register(&self, claim_ticket_id: &str) -> Result<()> {
        match self.register_inner(claim_ticket_id) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.set_state(GcdState::Unconfigured);
                Err(e)
            }
        }
    }

    fn register_inner(&self, claim_ticket_id: &str) -> Result<()> {
        let settings = self.config.snapshot();
        let api_key = settings.api_key.clone();

        // Step 1: PATCH the registration ticket draft.
        let mut patch_url = self.settings_url(&format!("registrationTickets/{claim_ticket_id}"))?;
        patch_url.query_pairs_mut().append_pair("key", &api_key);
        let body = serde_json::json!({
            "id": claim_ticket_id,
            "oauthClientId": settings.client_id,
            "deviceDraft": {
                "channel": {"supportedType": "pull"},
                "description": settings.description,
                "location": settings.location,
                "modelManifestId": settings.model_id,
                "name": settings.name,
                "commandDefs": self.catalog.lock().get_definitions(),
                "state": {},
            },
        });
        let response = viaduct::send_sync(viaduct::Request::patch(patch_url).json(&body)?)?;
        if !response.is_success() {
            return Err(Self::gcd_server_error(response.status, &response.body));
        }
        let ticket: RegistrationTicket = response.json()?;
        let device_id = ticket.device_draft.id.unwrap_or_else(|| claim_ticket_id.to_string());

        // Step 2: finalize.
        let mut finalize_url = self.settings_url(&format!("registrationTickets/{claim_ticket_id}/finalize"))?;
        finalize_url.query_pairs_mut().append_pair("key", &api_key);
        let response = viaduct::send_sync(viaduct::Request::post(finalize_url))?;
        if !response.is_success() {
            return Err(Self::gcd_server_error(response.status, &response.body));
        }
        let finalize: FinalizeResponse = response.json()?;

        // Step 3: exchange the authorization code for tokens.
        let token_url = Url::parse(&settings.oauth_url)
            .and_then(|u| u.join("token"))
            .map_err(|e| Error::buffet("bad_oauth_url", e.to_string()))?;
        let request = viaduct::Request::post(token_url).form(&[
            ("grant_type", "authorization_code"),
            ("code", &finalize.robot_account_authorization_code),
            ("client_id", &settings.client_id),
            ("client_secret", &settings.client_secret),
            ("redirect_uri", "oob"),
            ("scope", "https://www.googleapis.com/auth/clouddevices"),
        ])?;
        let response = viaduct::send_sync(request)?;
        if !response.is_success() {
            let parsed: Option<GcdServerError> = response.json().ok();
            let code = parsed.and_then(|b| b.code).unwrap_or_else(|| "token_exchange_failed".to_string());
            return Err(Error::oauth2(code, format!("token exchange failed with HTTP {}", response.status)));
        }
        let token_response: TokenExchangeResponse = response.json()?;

        // Only now, after every step has succeeded, persist the registration atomically.
        self.config.transact(|s| {
            s.cloud_id = Some(device_id.clone());
            s.refresh_token = Some(token_response.refresh_token.clone());
            s.robot_account = Some(finalize.robot_account_email.clone());
            Ok(())
        })?;
        self.tokens.set_refresh_token(Some(token_response.refresh_token));
        self.set_state(GcdState::Connecting);
        Ok(())
    }

    /// Long-poll for queued commands and materialize/validate/dispatch each one.
    pub fn poll_commands(&self) -> Result<()> {
        let cloud_id = self.config.require_cloud_id()?;
        let mut url = self.settings_url(&format!("devices/{cloud_id}/commands/queue"))?;
        url.query_pairs_mut().append_pair("deviceId", &cloud_id);

        let response = self
            .cloud
            .send(|token| Ok(viaduct::Request::get(url.clone()).bearer_auth(token)?))?;
        if !response.is_success() {
            return Err(Self::gcd_server_error(response.status, &response.body));
        }
        let queue: CommandQueueResponse = response.json()?;
        for raw in queue.commands {
            self.materialize_command(raw);
        }
        Ok(())
    }

    fn materialize_command(&self, raw: RawCommand) {
        let Some((component, name)) = split_command_name(&raw.name) else {
            self.fail_remote_command(&raw.id, "malformedCommandName", "command name must be component.name");
            return;
        };

        let validation = self.catalog.lock().validate(component, name, &raw.parameters, Role::Owner);
        let errors = match validation {
            Ok(errors) => errors,
            Err(e) => {
                self.fail_remote_command(&raw.id, &e.code, &e.message);
                return;
            }
        };
        if !errors.is_empty() {
            let message = errors.iter().map(|e| e.to_string()).collect::<Vec<_>>().join("; ");
            self.fail_remote_command(&raw.id, "schemaValidationFailed", &message);
            return;
        }

        let command = Arc::new(CommandInstance::new(raw.id.clone(), component, name, raw.parameters, Origin::Cloud));
        self.commands.lock().insert(raw.id.clone(), command.clone());

        match self.command_handler.handle(command.clone()) {
            Ok(()) => {
                let _ = command.start();
                self.upload_command(&command);
            }
            Err(e) => {
                let _ = command.fail(serde_json::json!({"code": e.code, "message": e.message}));
                self.upload_command(&command);
            }
        }
    }

    fn fail_remote_command(&self, id: &str, code: &str, message: &str) {
        // The DAG only allows `error` out of `inProgress`: a command rejected before it
        // ever ran still passes through a (locally instantaneous) `inProgress` transition so the
        // upload carries a well-formed state history.
        let command = Arc::new(CommandInstance::new(id, "", "", Value::Null, Origin::Cloud));
        let _ = command.start();
        let _ = command.fail(serde_json::json!({"code": code, "message": message}));
        self.upload_command(&command);
    }

    fn upload_command(&self, command: &Arc<CommandInstance>) {
        let service_url = match Url::parse(&self.config.snapshot().service_url) {
            Ok(u) => u,
            Err(_) => return,
        };
        let uploader = CommandUploader::new(service_url, self.cloud.clone());
        let _ = uploader.drain_once(command);
    }

    /// Upload whatever is pending for every live command. `upload_command` only ever drains the
    /// single update produced at materialization (the initial `inProgress` ack); a `CommandHandler`
    /// that later calls `set_progress`/`complete`/`pause`/`abort` on the same `CommandInstance`
    /// enqueues into its `PendingUpdate` slot with nothing else to drain it. Called from `tick()` so
    /// those updates reach Cloud on the next pass after they're produced.
    pub fn flush_command_updates(&self) {
        let service_url = match Url::parse(&self.config.snapshot().service_url) {
            Ok(u) => u,
            Err(_) => return,
        };
        let uploader = CommandUploader::new(service_url, self.cloud.clone());
        let commands: Vec<_> = self.commands.lock().values().cloned().collect();
        for command in commands {
            let _ = uploader.drain_once(&command);
        }
    }

    /// Look up a previously materialized command, e.g. for Privet's `/commands/status`.
    pub fn command(&self, id: &str) -> Option<Arc<CommandInstance>> {
        self.commands.lock().get(id).cloned()
    }

    /// Non-owning accessors for the Privet handler: the handler
    /// never owns the controller, so it reaches Settings, the catalog, and live commands through
    /// these rather than holding its own copies.
    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    pub fn catalog(&self) -> &Arc<Mutex<CommandCatalog>> {
        &self.catalog
    }

    pub fn state_queue(&self) -> &Arc<StateChangeQueue> {
        &self.state_queue
    }

    /// Validate and dispatch a command submitted locally over Privet, materializing it the same
    /// way a Cloud-originated command is, minus the Cloud acknowledgement PATCH — a locally
    /// originated command has nothing to acknowledge to Cloud until/unless the embedder's
    /// `CommandHandler` itself reports state back through the ordinary `StateChangeQueue`.
    pub fn execute_local_command(
        &self,
        component: &str,
        name: &str,
        parameters: Value,
        caller_role: Role,
    ) -> Result<Arc<CommandInstance>> {
        let errors = self.catalog.lock().validate(component, name, &parameters, caller_role)?;
        if !errors.is_empty() {
            let message = errors.iter().map(|e| e.to_string()).collect::<Vec<_>>().join("; ");
            return Err(Error::privet("schemaValidationFailed", message));
        }
        let id = format!("local-{}", hex::encode(local_command_id_bytes()));
        let command = Arc::new(CommandInstance::new(id.clone(), component, name, parameters, Origin::Local));
        self.commands.lock().insert(id, command.clone());
        self.command_handler.handle(command.clone())?;
        command.start()?;
        Ok(command)
    }

    /// Upload accumulated state changes. At most one upload is ever in
    /// flight at a time per the `StateChangeQueue`'s own debounce; this performs one pass.
    pub fn upload_state(&self) -> Result<()> {
        let watermark = self.state_queue.last_state_change_id();
        let changes = self.state_queue.get_since(self.state_queue.acknowledged());
        if changes.is_empty() {
            return Ok(());
        }
        let cloud_id = self.config.require_cloud_id()?;
        let url = self.settings_url(&format!("devices/{cloud_id}/patchState"))?;

        let patches: Vec<Value> = changes
            .iter()
            .map(|c| {
                serde_json::json!({
                    "timeMs": c.timestamp.duration_since(std::time::UNIX_EPOCH).unwrap_or_default().as_millis() as u64,
                    "patch": {(c.property_path.clone()): c.value.clone()},
                })
            })
            .collect();
        let body = serde_json::json!({
            "requestTimeMs": std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap_or_default().as_millis() as u64,
            "patches": patches,
        });

        let response = self.cloud.send(|token| {
            Ok(viaduct::Request::post(url.clone())
                .bearer_auth(token)?
                .json(&body)?)
        });
        match response {
            Ok(resp) if resp.is_success() => {
                self.state_queue.acknowledge(watermark);
                Ok(())
            }
            // Drop the batch rather than retry: the next snapshot carries every property's current
            // value anyway, so a dropped batch is never a permanent loss.
            Ok(resp) if resp.status / 100 == 4 => Ok(()),
            Ok(resp) => Err(Self::gcd_server_error(resp.status, &resp.body)),
            Err(e) => Err(e),
        }
    }
}
