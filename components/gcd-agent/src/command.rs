/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Per-command state machine and upload queue.
//!
//! `CommandInstance` stores its DAG transitions as a `match` over `(CommandState, CommandState)`
//! pairs: an impossible transition is rejected with a structured error, never a panic.
//! Per-command upload coalescing is a single `PendingUpdate` slot: a newer non-terminal update
//! overwrites a not-yet-acknowledged one in place, but a terminal update is never overwritten and
//! never discarded, so a terminal state is never observable at Cloud as non-terminal afterwards.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::oauth::CloudClient;

/// Where a command instance originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    Cloud,
    Local,
}

/// `CommandInstance::state`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CommandState {
    Queued,
    InProgress,
    Paused,
    Error,
    Done,
    Cancelled,
    Aborted,
    Expired,
}

impl CommandState {
    /// Whether this is a terminal state, from which no further transition is ever allowed.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CommandState::Done | CommandState::Cancelled | CommandState::Aborted | CommandState::Expired
        )
    }

    /// Validate a transition against the state DAG. Returns the structured error instead of
    /// panicking so a caller driving this off an untrusted source (a malformed Cloud command
    /// update, a racing local request) gets a normal `Result`.
    fn validate_transition(self, next: CommandState) -> Result<()> {
        use CommandState::*;
        let allowed = match self {
            Queued => matches!(next, InProgress | Cancelled | Expired),
            InProgress => matches!(next, Paused | Done | Error | Cancelled | Aborted),
            Paused => matches!(next, InProgress | Cancelled),
            Error => matches!(next, Queued | InProgress | Cancelled),
            Done | Cancelled | Aborted | Expired => false,
        };
        if allowed {
            Ok(())
        } else {
            Err(Error::gcd(
                "invalid_command_transition",
                format!("{self:?} -> {next:?} is not a permitted transition"),
            ))
        }
    }
}

/// The body of a `PATCH {service_url}commands/{id}` request: only the
/// fields that changed are present.
#[derive(Debug, Clone, Serialize)]
pub struct CommandUpdate {
    // Field order is serialization order; `state` must always be present.
    pub state: CommandState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub results: Option<Value>,
}

/// The coalescing slot for a command's not-yet-uploaded update.
struct PendingUpdate {
    update: Option<CommandUpdate>,
    in_flight: bool,
}

/// A server-issued command with a typed state machine.
pub struct CommandInstance {
    pub id: String,
    pub name: String,
    pub component: String,
    pub parameters: Value,
    pub origin: Origin,
    pub creation_time: std::time::SystemTime,
    state: Mutex<CommandState>,
    progress: Mutex<Option<Value>>,
    results: Mutex<Option<Value>>,
    pending: Mutex<PendingUpdate>,
}

impl CommandInstance {
    pub fn new(id: impl Into<String>, component: impl Into<String>, name: impl Into<String>, parameters: Value, origin: Origin) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            component: component.into(),
            parameters,
            origin,
            creation_time: std::time::SystemTime::now(),
            state: Mutex::new(CommandState::Queued),
            progress: Mutex::new(None),
            results: Mutex::new(None),
            pending: Mutex::new(PendingUpdate { update: None, in_flight: false }),
        }
    }

    pub fn state(&self) -> CommandState {
        *self.state.lock()
    }

    pub fn progress(&self) -> Option<Value> {
        self.progress.lock().clone()
    }

    pub fn results(&self) -> Option<Value> {
        self.results.lock().clone()
    }

    /// Transition to `inProgress`, acknowledging Cloud's queued command.
    pub fn start(&self) -> Result<()> {
        self.transition(CommandState::InProgress, |_| {})
    }

    /// Set progress while `inProgress`/`paused`. Does not itself change state.
    pub fn set_progress(&self, progress: Value) -> Result<()> {
        let current = self.state();
        if !matches!(current, CommandState::InProgress | CommandState::Paused) {
            return Err(Error::gcd(
                "invalid_progress_update",
                format!("cannot set progress while command is {current:?}"),
            ));
        }
        *self.progress.lock() = Some(progress.clone());
        self.enqueue(CommandUpdate { state: current, progress: Some(progress), results: None });
        Ok(())
    }

    /// Transition to `done` with results.
    pub fn complete(&self, results: Value) -> Result<()> {
        self.transition(CommandState::Done, |update| update.results = Some(results.clone()))
            .map(|()| {
                *self.results.lock() = Some(results);
            })
    }

    pub fn pause(&self) -> Result<()> {
        self.transition(CommandState::Paused, |_| {})
    }

    pub fn abort(&self, error: Value) -> Result<()> {
        self.transition(CommandState::Aborted, |update| update.results = Some(error))
    }

    pub fn cancel(&self) -> Result<()> {
        self.transition(CommandState::Cancelled, |_| {})
    }

    /// Mark the command `error`, e.g. after catalog validation rejects it.
    pub fn fail(&self, error: Value) -> Result<()> {
        self.transition(CommandState::Error, |update| update.results = Some(error))
    }

    fn transition(&self, next: CommandState, fill: impl FnOnce(&mut CommandUpdate)) -> Result<()> {
        let mut state = self.state.lock();
        state.validate_transition(next)?;
        *state = next;
        let mut update = CommandUpdate { state: next, progress: None, results: None };
        fill(&mut update);
        drop(state);
        self.enqueue(update);
        Ok(())
    }

    /// Coalesce `update` into the pending slot. A terminal update always replaces
    /// whatever was pending; once a terminal update is pending, nothing may replace it.
    fn enqueue(&self, update: CommandUpdate) {
        let mut pending = self.pending.lock();
        let supersedes_existing = match &pending.update {
            Some(existing) => !existing.state.is_terminal(),
            None => true,
        };
        if supersedes_existing {
            pending.update = Some(update);
        }
    }

    /// Take the pending update for upload, if one exists and none is already in flight.
    fn take_pending(&self) -> Option<CommandUpdate> {
        let mut pending = self.pending.lock();
        if pending.in_flight {
            return None;
        }
        let update = pending.update.take()?;
        pending.in_flight = true;
        Some(update)
    }

    fn ack(&self, uploaded: &CommandUpdate) {
        let mut pending = self.pending.lock();
        pending.in_flight = false;
        // If nothing newer arrived while this upload was in flight, and the state hasn't already
        // moved on, there's nothing left to do; a newer pending update (set by `enqueue` while
        // `in_flight` was true) is left alone for the next upload pass.
        let _ = uploaded;
    }
}

/// Drives [`CommandInstance::take_pending`]/`ack` against Cloud for one command. The
/// registration controller holds one of these per live command and drains it on its task loop;
/// this type performs the actual upload and honors the shared 401-retry rule.
pub struct CommandUploader {
    service_url: url::Url,
    cloud: Arc<CloudClient>,
}

impl CommandUploader {
    pub fn new(service_url: url::Url, cloud: Arc<CloudClient>) -> Self {
        Self { service_url, cloud }
    }

    /// Upload whatever is pending for `command`, if anything, returning whether an upload was
    /// attempted. On success the pending slot is cleared (unless a newer update raced in); on
    /// failure the update is put back so a future retry can pick it up, reusing the same
    /// backoff/401 retry policy as the Cloud HTTP client.
    pub fn drain_once(&self, command: &CommandInstance) -> Result<bool> {
        let Some(update) = command.take_pending() else {
            return Ok(false);
        };
        let url = self
            .service_url
            .join(&format!("commands/{}", command.id))
            .map_err(|e| Error::buffet("bad_url", e.to_string()))?;

        let result = self.cloud.send(|token| {
            Ok(viaduct::Request::patch(url.clone())
                .bearer_auth(token)?
                .json(&update)?)
        });

        match result {
            Ok(_response) => {
                command.ack(&update);
                Ok(true)
            }
            Err(e) => {
                // Put the update back so the next `drain_once` retries it; a terminal update is
                // never lost even if every retry so far has failed.
                let mut pending = command.pending.lock();
                pending.in_flight = false;
                if pending.update.is_none() {
                    pending.update = Some(update);
                }
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn queued() -> CommandInstance {
        CommandInstance::new("1234", "base", "reboot", json!({}), Origin::Cloud)
    }

    #[test]
    fn test_queued_to_in_progress_to_done() {
        let cmd = queued();
        cmd.start().unwrap();
        assert_eq!(cmd.state(), CommandState::InProgress);
        cmd.set_progress(json!({"progress": 18})).unwrap();
        cmd.complete(json!({"status": "Ok"})).unwrap();
        assert_eq!(cmd.state(), CommandState::Done);
    }

    #[test]
    fn test_command_update_bodies_reflect_progress_and_completion() {
        let cmd = queued();
        cmd.start().unwrap();
        cmd.set_progress(json!({"progress": 18})).unwrap();
        let pending = cmd.pending.lock().update.clone().unwrap();
        assert_eq!(
            serde_json::to_value(&pending).unwrap(),
            json!({"state": "inProgress", "progress": {"progress": 18}})
        );

        let cmd2 = queued();
        cmd2.start().unwrap();
        cmd2.complete(json!({"status": "Ok"})).unwrap();
        let pending2 = cmd2.pending.lock().update.clone().unwrap();
        assert_eq!(
            serde_json::to_value(&pending2).unwrap(),
            json!({"state": "done", "results": {"status": "Ok"}})
        );

        let cmd3 = queued();
        cmd3.cancel().unwrap();
        let pending3 = cmd3.pending.lock().update.clone().unwrap();
        assert_eq!(serde_json::to_value(&pending3).unwrap(), json!({"state": "cancelled"}));
    }

    #[test]
    fn test_terminal_states_reject_further_transitions() {
        let cmd = queued();
        cmd.start().unwrap();
        cmd.complete(json!({})).unwrap();
        assert!(cmd.pause().is_err());
        assert!(cmd.cancel().is_err());
        assert_eq!(cmd.state(), CommandState::Done);
    }

    #[test]
    fn test_progress_rejected_outside_in_progress_or_paused() {
        let cmd = queued();
        assert!(cmd.set_progress(json!({})).is_err());
    }

    #[test]
    fn test_error_state_allows_requeue() {
        let cmd = queued();
        cmd.start().unwrap();
        cmd.fail(json!({"code": "deviceBusy"})).unwrap();
        assert_eq!(cmd.state(), CommandState::Error);
        cmd.start().unwrap();
        assert_eq!(cmd.state(), CommandState::InProgress);
    }

    #[test]
    fn test_coalescing_never_discards_terminal_update() {
        let cmd = queued();
        cmd.start().unwrap();
        cmd.set_progress(json!({"progress": 1})).unwrap();
        cmd.complete(json!({"status": "Ok"})).unwrap();
        // The non-terminal progress update was superseded in-place by the terminal `done` update;
        // only one slot is ever held, and it must be the terminal one.
        let pending = cmd.pending.lock().update.clone().unwrap();
        assert_eq!(pending.state, CommandState::Done);

        // A further attempt to enqueue (e.g. a stray late progress write) must not clobber it.
        cmd.enqueue(CommandUpdate { state: CommandState::InProgress, progress: Some(json!({"progress": 99})), results: None });
        let pending = cmd.pending.lock().update.clone().unwrap();
        assert_eq!(pending.state, CommandState::Done);
    }

    #[test]
    fn test_take_pending_marks_in_flight_and_blocks_concurrent_drain() {
        let cmd = queued();
        cmd.start().unwrap();
        let first = cmd.take_pending();
        assert!(first.is_some());
        // A second drain attempt while the first is still in flight finds nothing to send.
        assert!(cmd.take_pending().is_none());
    }

    #[test]
    fn test_drain_once_uploads_progress_enqueued_after_initial_accept() {
        use crate::oauth::TokenManager;
        use crate::testing;

        testing::install();
        testing::stub(
            "https://gcd-commands-progress.example.com/commands/1234",
            200,
            "{}",
        );

        let tokens = Arc::new(TokenManager::new("https://oauth.example.com/", "CID", "CS"));
        let cloud = Arc::new(CloudClient::new(tokens));
        let service_url = url::Url::parse("https://gcd-commands-progress.example.com/").unwrap();
        let uploader = CommandUploader::new(service_url, cloud);

        let cmd = queued();
        cmd.start().unwrap();
        // The initial `inProgress` ack is drained the same way materialization does it.
        assert!(uploader.drain_once(&cmd).unwrap());
        assert!(cmd.pending.lock().update.is_none());

        // A `CommandHandler` reporting progress well after acceptance enqueues a new update; it
        // must reach Cloud on the next drain rather than sit in the pending slot forever.
        cmd.set_progress(json!({"progress": 42})).unwrap();
        assert!(cmd.pending.lock().update.is_some());
        assert!(uploader.drain_once(&cmd).unwrap());
        assert!(cmd.pending.lock().update.is_none());
        assert!(!cmd.pending.lock().in_flight);
    }
}
