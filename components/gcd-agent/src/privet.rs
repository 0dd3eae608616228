/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The local Privet request router: route table, auth-scope enforcement, and the
//! pairing handshake's HTTP-shaped entry points.
//!
//! `PrivetHandler` is a pure request-dispatch type: it takes a parsed [`PrivetRequest`], resolves
//! the route table below, enforces the role ordering via `Role`'s `PartialOrd`, and returns a typed
//! [`PrivetResponse`] rather than writing to a socket directly — the actual HTTP listener remains an
//! external collaborator. Since the controller, catalog, and security manager can each outlive
//! or be torn down independently of this router, it holds only non-owning handles to them.

use std::sync::{Arc, Weak};

use serde_json::{json, Value};

use crate::collaborators::WifiManager;
use crate::command::CommandInstance;
use crate::controller::Controller;
use crate::security::{PairingMode, Role, SecurityManager};

/// HTTP method of an incoming Privet request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

/// A parsed inbound request. The real HTTP listener collaborator is responsible for
/// producing this from a socket; this crate never parses raw bytes off the wire itself.
#[derive(Debug, Clone, Default)]
pub struct PrivetRequest {
    pub method: Option<Method>,
    pub path: String,
    /// The raw `Authorization` header value, e.g. `"Privet <token>"` or `"Privet anonymous"`.
    pub authorization: Option<String>,
    /// Query parameters for GET requests (e.g. `?id=1234` for `/commands/status`).
    pub query: std::collections::BTreeMap<String, String>,
    /// JSON body for POST requests. `Value::Null` for requests with no body.
    pub body: Value,
}

/// A response the listener collaborator should serialize and send back. Errors are `{error:{code, message, debugInfo?}}`.
#[derive(Debug, Clone)]
pub struct PrivetResponse {
    pub status: u16,
    pub body: Value,
}

impl PrivetResponse {
    fn ok(body: Value) -> Self {
        Self { status: 200, body }
    }

    fn error(status: u16, code: &str, message: &str) -> Self {
        Self {
            status,
            body: json!({"error": {"code": code, "message": message}}),
        }
    }

    fn not_found() -> Self {
        Self::error(404, "notFound", "no such path")
    }

    fn method_not_allowed() -> Self {
        Self::error(405, "methodNotAllowed", "method not supported for this path")
    }

    fn unauthorized(code: &str, message: &str) -> Self {
        Self::error(401, code, message)
    }

    fn forbidden() -> Self {
        Self::error(403, "insufficientRole", "caller role is below the command's minimal role")
    }
}

impl From<crate::error::Error> for PrivetResponse {
    fn from(e: crate::error::Error) -> Self {
        let status = match e.domain {
            crate::error::Domain::Privet if e.code == "authorizationMissing" || e.code == "authorizationExpired" => 401,
            _ => 400,
        };
        Self::error(status, &e.code, &e.message)
    }
}

fn command_state_json(command: &CommandInstance) -> Value {
    let mut body = json!({
        "id": command.id,
        "name": format!("{}.{}", command.component, command.name),
        "state": command.state(),
    });
    if let Some(progress) = command.progress() {
        body["progress"] = progress;
    }
    if let Some(results) = command.results() {
        body["results"] = results;
    }
    body
}

/// The local request router. Non-owning: the controller outlives `PrivetHandler`
/// in the typical embedding (a top-level agent struct owns both), so a dropped controller just
/// makes every route error with `notRegistered`-shaped failures rather than dangling.
pub struct PrivetHandler {
    controller: Weak<Controller>,
    security: Arc<SecurityManager>,
    wifi: Option<Arc<dyn WifiManager>>,
    /// The HTTPS listener's own certificate fingerprint, supplied by the (out-of-scope) TLS socket
    /// collaborator, for pairing's channel-binding step.
    cert_fingerprint: Vec<u8>,
}

impl PrivetHandler {
    pub fn new(controller: Weak<Controller>, security: Arc<SecurityManager>, cert_fingerprint: Vec<u8>) -> Self {
        Self {
            controller,
            security,
            wifi: None,
            cert_fingerprint,
        }
    }

    pub fn with_wifi(mut self, wifi: Arc<dyn WifiManager>) -> Self {
        self.wifi = Some(wifi);
        self
    }

    fn controller(&self) -> Option<Arc<Controller>> {
        self.controller.upgrade()
    }

    /// Resolve the caller's role from the `Authorization` header and enforce that it is at least
    /// `minimum`: `Privet <token>` is validated by the security manager; `Privet
    /// anonymous` (or a missing header) is accepted only if Settings permit anonymous access at
    /// `minimum` or above.
    fn caller_role(&self, request: &PrivetRequest, minimum: Role) -> Result<Role, PrivetResponse> {
        let header = request.authorization.as_deref();
        let Some(header) = header else {
            return self.anonymous_role(minimum);
        };
        let Some(token) = header.strip_prefix("Privet ") else {
            return Err(PrivetResponse::unauthorized("authorizationMissing", "missing Privet authorization scheme"));
        };
        if token == "anonymous" {
            return self.anonymous_role(minimum);
        }
        match self.security.validate_token(token) {
            Ok(payload) if payload.role >= minimum => Ok(payload.role),
            Ok(_) => Err(PrivetResponse::forbidden()),
            Err(_) => Err(PrivetResponse::unauthorized("authorizationExpired", "token invalid or expired")),
        }
    }

    fn anonymous_role(&self, minimum: Role) -> Result<Role, PrivetResponse> {
        let allowed = self.security.config().snapshot().local_anonymous_access_role;
        match allowed {
            Some(role) if role >= minimum => Ok(role),
            _ => Err(PrivetResponse::unauthorized(
                "authorizationMissing",
                "anonymous local access is not permitted for this path",
            )),
        }
    }

    /// Dispatch one request through the route table.
    pub fn dispatch(&self, request: &PrivetRequest) -> PrivetResponse {
        let path = request.path.trim_start_matches("/privet/").trim_start_matches("/privet");
        match (request.method, path) {
            (Some(Method::Get), "info") => self.info(),
            (Some(Method::Post), "auth") => self.auth(request),
            (Some(Method::Post), "pairing/start") => self.pairing_start(request),
            (Some(Method::Post), "pairing/confirm") => self.pairing_confirm(request),
            (Some(Method::Post), "pairing/cancel") => self.pairing_cancel(request),
            (Some(Method::Post), "setup/start") => self.setup_start(request),
            (Some(Method::Get), "setup/status") => self.setup_status(request),
            (Some(Method::Get), "commandDefs") => self.command_defs(request),
            (Some(Method::Post), "commands/execute") => self.commands_execute(request),
            (Some(Method::Get), "commands/status") => self.commands_status(request),
            (Some(Method::Post), "commands/cancel") => self.commands_cancel(request),
            (Some(Method::Get), "state") => self.state(request),
            // Any other method (including one the listener couldn't map to GET/POST at all) on a
            // known path is a method mismatch, not a missing route.
            (_, p)
                if ["info", "auth", "pairing/start", "pairing/confirm", "pairing/cancel", "setup/start",
                    "setup/status", "commandDefs", "commands/execute", "commands/status", "commands/cancel", "state"]
                    .contains(&p) =>
            {
                PrivetResponse::method_not_allowed()
            }
            _ => PrivetResponse::not_found(),
        }
    }

    /// `GET /privet/info` — no auth required.
    fn info(&self) -> PrivetResponse {
        let Some(controller) = self.controller() else {
            return PrivetResponse::error(500, "controllerGone", "controller is no longer available");
        };
        let settings = controller.config().snapshot();
        PrivetResponse::ok(json!({
            "name": settings.name,
            "description": settings.description,
            "modelName": settings.model_name,
            "modelId": settings.model_id,
            "oemName": settings.oem_name,
            "state": format!("{:?}", controller.state()),
            "pairingModes": settings.pairing_modes,
            "commandDefs": controller.catalog().lock().get_definitions(),
        }))
    }

    /// `POST /privet/auth` — exchange a confirmed pairing session for an access token, or mint an
    /// anonymous token if Settings permit.
    fn auth(&self, request: &PrivetRequest) -> PrivetResponse {
        if let Some(session_id) = request.body.get("sessionId").and_then(Value::as_str) {
            let user_id = request.body.get("userId").and_then(Value::as_str).unwrap_or("privet-client");
            return match self.security.authenticate(session_id, user_id) {
                Ok(token) => PrivetResponse::ok(json!({"accessToken": token, "scope": "owner"})),
                Err(e) => e.into(),
            };
        }
        let allowed = self.security.config().snapshot().local_anonymous_access_role;
        match allowed {
            Some(role) => match self.security.mint_anonymous_token(role) {
                Ok(token) => PrivetResponse::ok(json!({"accessToken": token, "scope": format!("{role:?}").to_lowercase()})),
                Err(e) => e.into(),
            },
            None => PrivetResponse::unauthorized("authorizationMissing", "anonymous local access is not permitted"),
        }
    }

    /// `POST /privet/pairing/start`.
    fn pairing_start(&self, request: &PrivetRequest) -> PrivetResponse {
        let Some(mode) = request.body.get("pairing").and_then(Value::as_str).and_then(PairingMode::parse) else {
            return PrivetResponse::error(400, "invalidParams", "missing or unknown pairing mode");
        };
        let code = self.session_code(mode);
        let Some(code) = code else {
            return PrivetResponse::error(400, "invalidParams", "pairing mode is not configured on this device");
        };
        match self.security.pairing_start(mode, code) {
            Ok((session_id, device_commitment)) => PrivetResponse::ok(json!({
                "sessionId": session_id,
                "deviceCommitment": hex::encode(device_commitment),
            })),
            Err(e) => e.into(),
        }
    }

    /// Resolve the shared pairing code for `mode` from Settings.
    fn session_code(&self, mode: PairingMode) -> Option<Vec<u8>> {
        let settings = self.security.config().snapshot();
        match mode {
            PairingMode::PinCode => {
                use rand::Rng;
                let code: u32 = rand::thread_rng().gen_range(0..10_000);
                Some(format!("{code:04}").into_bytes())
            }
            PairingMode::EmbeddedCode => settings.embedded_code.map(String::into_bytes),
            PairingMode::Ultrasound32 | PairingMode::Audible32 => settings.embedded_code.map(String::into_bytes),
        }
    }

    /// `POST /privet/pairing/confirm`.
    fn pairing_confirm(&self, request: &PrivetRequest) -> PrivetResponse {
        let (Some(session_id), Some(client_commitment)) = (
            request.body.get("sessionId").and_then(Value::as_str),
            request
                .body
                .get("clientCommitment")
                .and_then(Value::as_str)
                .and_then(|s| hex::decode(s).ok()),
        ) else {
            return PrivetResponse::error(400, "invalidParams", "sessionId and clientCommitment are required");
        };
        match self.security.pairing_confirm(session_id, &client_commitment, &self.cert_fingerprint) {
            Ok(fingerprint) => PrivetResponse::ok(json!({"certFingerprint": hex::encode(fingerprint)})),
            Err(e) => e.into(),
        }
    }

    /// `POST /privet/pairing/cancel` — terminate a session.
    fn pairing_cancel(&self, request: &PrivetRequest) -> PrivetResponse {
        let Some(session_id) = request.body.get("sessionId").and_then(Value::as_str) else {
            return PrivetResponse::error(400, "invalidParams", "sessionId is required");
        };
        self.security.cancel_pairing(session_id);
        PrivetResponse::ok(json!({}))
    }

    /// `POST /privet/setup/start` — manager role: accept Wi-Fi credentials and/or
    /// a registration claim ticket.
    fn setup_start(&self, request: &PrivetRequest) -> PrivetResponse {
        if let Err(resp) = self.caller_role(request, Role::Manager) {
            return resp;
        }
        let Some(controller) = self.controller() else {
            return PrivetResponse::error(500, "controllerGone", "controller is no longer available");
        };

        if let (Some(ssid), Some(passphrase)) = (
            request.body.get("wifiSsid").and_then(Value::as_str),
            request.body.get("wifiPassphrase").and_then(Value::as_str),
        ) {
            if let Some(wifi) = &self.wifi {
                if let Err(e) = wifi.connect(ssid, passphrase) {
                    return PrivetResponse::error(502, "wifiConnectFailed", &e.message);
                }
            }
        }

        match request.body.get("ticketId").and_then(Value::as_str) {
            Some(ticket) => match controller.register(ticket) {
                Ok(()) => PrivetResponse::ok(json!({"state": format!("{:?}", controller.state())})),
                Err(e) => e.into(),
            },
            None => PrivetResponse::ok(json!({"state": format!("{:?}", controller.state())})),
        }
    }

    /// `GET /privet/setup/status` — viewer role.
    fn setup_status(&self, request: &PrivetRequest) -> PrivetResponse {
        if let Err(resp) = self.caller_role(request, Role::Viewer) {
            return resp;
        }
        let Some(controller) = self.controller() else {
            return PrivetResponse::error(500, "controllerGone", "controller is no longer available");
        };
        PrivetResponse::ok(json!({"gcdState": format!("{:?}", controller.state())}))
    }

    /// `GET /privet/commandDefs` — viewer role.
    fn command_defs(&self, request: &PrivetRequest) -> PrivetResponse {
        if let Err(resp) = self.caller_role(request, Role::Viewer) {
            return resp;
        }
        let Some(controller) = self.controller() else {
            return PrivetResponse::error(500, "controllerGone", "controller is no longer available");
        };
        PrivetResponse::ok(json!(controller.catalog().lock().get_definitions()))
    }

    /// `POST /privet/commands/execute` — per-command role: the caller must hold
    /// at least the submitted command's own `minimalRole`, so the catalog (not the route table)
    /// decides the threshold.
    fn commands_execute(&self, request: &PrivetRequest) -> PrivetResponse {
        let Some(controller) = self.controller() else {
            return PrivetResponse::error(500, "controllerGone", "controller is no longer available");
        };
        let Some(full_name) = request.body.get("name").and_then(Value::as_str) else {
            return PrivetResponse::error(400, "invalidParams", "name is required");
        };
        let Some((component, name)) = full_name.split_once('.') else {
            return PrivetResponse::error(400, "invalidParams", "name must be component.name");
        };
        let minimal_role = match controller.catalog().lock().minimal_role(component, name) {
            Ok(role) => role,
            Err(e) => return e.into(),
        };
        let role = match self.caller_role(request, minimal_role) {
            Ok(role) => role,
            Err(resp) => return resp,
        };
        let parameters = request.body.get("parameters").cloned().unwrap_or(Value::Null);
        match controller.execute_local_command(component, name, parameters, role) {
            Ok(command) => PrivetResponse::ok(command_state_json(&command)),
            Err(e) => e.into(),
        }
    }

    fn lookup_command(&self, request: &PrivetRequest) -> Result<(Arc<Controller>, Arc<CommandInstance>), PrivetResponse> {
        let controller = self
            .controller()
            .ok_or_else(|| PrivetResponse::error(500, "controllerGone", "controller is no longer available"))?;
        let id = request
            .query
            .get("id")
            .map(String::as_str)
            .or_else(|| request.body.get("id").and_then(Value::as_str))
            .ok_or_else(|| PrivetResponse::error(400, "invalidParams", "id is required"))?;
        let command = controller
            .command(id)
            .ok_or_else(|| PrivetResponse::error(404, "unknownCommandId", "no such command"))?;
        Ok((controller, command))
    }

    /// `GET /privet/commands/status` — per-command role.
    fn commands_status(&self, request: &PrivetRequest) -> PrivetResponse {
        let (controller, command) = match self.lookup_command(request) {
            Ok(pair) => pair,
            Err(resp) => return resp,
        };
        let minimal_role = controller
            .catalog()
            .lock()
            .minimal_role(&command.component, &command.name)
            .unwrap_or(Role::Viewer);
        if let Err(resp) = self.caller_role(request, minimal_role) {
            return resp;
        }
        PrivetResponse::ok(command_state_json(&command))
    }

    /// `POST /privet/commands/cancel` — per-command role.
    fn commands_cancel(&self, request: &PrivetRequest) -> PrivetResponse {
        let (controller, command) = match self.lookup_command(request) {
            Ok(pair) => pair,
            Err(resp) => return resp,
        };
        let minimal_role = controller
            .catalog()
            .lock()
            .minimal_role(&command.component, &command.name)
            .unwrap_or(Role::Viewer);
        if let Err(resp) = self.caller_role(request, minimal_role) {
            return resp;
        }
        match command.cancel() {
            Ok(()) => PrivetResponse::ok(command_state_json(&command)),
            Err(e) => e.into(),
        }
    }

    /// `GET /privet/state` — viewer role.
    fn state(&self, request: &PrivetRequest) -> PrivetResponse {
        if let Err(resp) = self.caller_role(request, Role::Viewer) {
            return resp;
        }
        let Some(controller) = self.controller() else {
            return PrivetResponse::error(500, "controllerGone", "controller is no longer available");
        };
        let snapshot = controller.state_queue().snapshot();
        PrivetResponse::ok(json!(snapshot))
    }
}
