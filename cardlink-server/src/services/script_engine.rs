//! APDU script scheduling and result collection.
//!
//! The engine never touches the TLS stream: it feeds scripts into the
//! owning session's queue over the session command channel and collects
//! per-command outcomes streamed back by the session tasks. A single
//! collector task assembles [`ScriptResult`]s; `wait` parks callers on a
//! oneshot until the result exists.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use cardlink_types::SessionId;
use cardlink_types::apdu::{Apdu, StatusClass, classify};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::services::session_manager::{SessionCommand, SessionManager, SessionManagerError};

/// Identifier of one enqueued script.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct ScriptId(Uuid);

impl ScriptId {
    pub(crate) fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ScriptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Expectation checked against the status word of a command's response.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpectedSw {
    /// Anything matches.
    Any,
    /// Any success-class status word matches.
    Success,
    /// Only this exact status word matches.
    Exact(u16),
}

impl ExpectedSw {
    /// Whether `sw` satisfies the expectation.
    pub fn matches(self, sw: u16) -> bool {
        match self {
            ExpectedSw::Any => true,
            ExpectedSw::Success => classify(sw) == StatusClass::Success,
            ExpectedSw::Exact(expected) => sw == expected,
        }
    }
}

/// One command of a script.
#[derive(Clone, Debug)]
pub struct ScriptCommand {
    /// The command to send.
    pub apdu: Apdu,
    /// Expectation on the response.
    pub expected: ExpectedSw,
}

/// An ordered list of commands bound to one session at enqueue time.
#[derive(Clone, Debug)]
pub struct Script {
    /// Commands in send order.
    pub commands: Vec<ScriptCommand>,
    /// Abort the remainder when an error-class status word arrives.
    pub stop_on_error: bool,
}

impl Script {
    /// A script accepting any status word, not stopping on errors.
    pub fn from_apdus(apdus: Vec<Apdu>) -> Self {
        Self {
            commands: apdus
                .into_iter()
                .map(|apdu| ScriptCommand { apdu, expected: ExpectedSw::Any })
                .collect(),
            stop_on_error: false,
        }
    }
}

/// Resolved `(sent, received)` pair of one script command.
#[derive(Clone, Debug, Serialize)]
pub struct CommandOutcome {
    /// Position of the command in its script.
    pub index: usize,
    /// Hex of the sent C-APDU.
    pub sent_hex: String,
    /// Hex of the received R-APDU.
    pub response_hex: String,
    /// Status word of the response.
    pub sw: u16,
    /// Round-trip duration in microseconds.
    pub duration_us: u64,
    /// Whether the status word satisfied the command's expectation.
    pub matched_expectation: bool,
}

/// Terminal (and the one non-terminal) state of a script.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScriptState {
    /// Commands still queued or outstanding.
    Running,
    /// Every command resolved.
    Completed,
    /// `stop_on_error` fired; the remainder was drained.
    Stopped,
    /// Cancelled by the operator; the remainder was drained.
    Cancelled,
    /// The owning session reached a terminal state first.
    SessionTerminated,
}

/// Collected result of one script.
#[derive(Clone, Debug, Serialize)]
pub struct ScriptResult {
    /// The script.
    pub script_id: ScriptId,
    /// Session the script was bound to.
    pub session_id: SessionId,
    /// How the script ended.
    pub state: ScriptState,
    /// Outcomes in command order. May be shorter than the script when it
    /// was stopped, cancelled or its session terminated.
    pub outcomes: Vec<CommandOutcome>,
}

/// Progress summary returned by [`ScriptEngine::status`].
#[derive(Clone, Debug, Serialize)]
pub struct ScriptStatus {
    /// Current state.
    pub state: ScriptState,
    /// Commands resolved so far.
    pub completed: usize,
    /// Commands in the script.
    pub total: usize,
}

/// Per-command progress streamed from session tasks to the collector.
#[derive(Debug)]
pub(crate) enum ScriptProgress {
    /// A script command resolved.
    Command {
        script_id: ScriptId,
        outcome: CommandOutcome,
    },
    /// A script reached a terminal state inside its session.
    Finished {
        script_id: ScriptId,
        state: ScriptState,
    },
    /// A session reached a terminal state; its running scripts are over.
    SessionEnded { session_id: SessionId },
}

/// Errors of the script engine surface.
#[derive(Debug, thiserror::Error)]
pub enum ScriptEngineError {
    /// Scripts need at least one command.
    #[error("script has no commands")]
    EmptyScript,
    /// No script with this id.
    #[error("unknown script {0}")]
    UnknownScript(ScriptId),
    /// The script is no longer running.
    #[error("script {0} already finished")]
    AlreadyFinished(ScriptId),
    /// The target session is gone or closing.
    #[error(transparent)]
    Session(#[from] SessionManagerError),
}

struct ScriptEntry {
    session_id: SessionId,
    state: ScriptState,
    total: usize,
    outcomes: Vec<CommandOutcome>,
    waiters: Vec<oneshot::Sender<ScriptResult>>,
}

impl ScriptEntry {
    fn result(&self, script_id: ScriptId) -> ScriptResult {
        ScriptResult {
            script_id,
            session_id: self.session_id,
            state: self.state,
            outcomes: self.outcomes.clone(),
        }
    }
}

/// Handle to the script engine.
#[derive(Clone)]
pub struct ScriptEngine {
    scripts: Arc<Mutex<HashMap<ScriptId, ScriptEntry>>>,
    manager: SessionManager,
}

impl ScriptEngine {
    /// Creates the engine and spawns its collector task. The returned
    /// sender is handed to session tasks.
    pub(crate) fn new(manager: SessionManager) -> (Self, mpsc::Sender<ScriptProgress>) {
        let (progress_tx, progress_rx) = mpsc::channel(256);
        let engine = Self {
            scripts: Arc::new(Mutex::new(HashMap::new())),
            manager,
        };
        tokio::spawn(collector_task(Arc::clone(&engine.scripts), progress_rx));
        (engine, progress_tx)
    }

    /// Binds `script` to the session and feeds it into the queue.
    pub async fn enqueue(
        &self,
        session_id: SessionId,
        script: Script,
    ) -> Result<ScriptId, ScriptEngineError> {
        if script.commands.is_empty() {
            return Err(ScriptEngineError::EmptyScript);
        }
        let script_id = ScriptId::new();
        self.scripts.lock().insert(
            script_id,
            ScriptEntry {
                session_id,
                state: ScriptState::Running,
                total: script.commands.len(),
                outcomes: Vec::new(),
                waiters: Vec::new(),
            },
        );
        let sent = self
            .manager
            .send_command(session_id, SessionCommand::EnqueueScript { script_id, script })
            .await;
        if let Err(err) = sent {
            self.scripts.lock().remove(&script_id);
            return Err(err.into());
        }
        tracing::debug!(%script_id, %session_id, "script enqueued");
        Ok(script_id)
    }

    /// Drains the queued remainder of a running script. The outstanding
    /// command, if it belongs to the script, still resolves.
    pub async fn cancel(&self, script_id: ScriptId) -> Result<(), ScriptEngineError> {
        let session_id = {
            let scripts = self.scripts.lock();
            let entry = scripts
                .get(&script_id)
                .ok_or(ScriptEngineError::UnknownScript(script_id))?;
            if entry.state != ScriptState::Running {
                return Err(ScriptEngineError::AlreadyFinished(script_id));
            }
            entry.session_id
        };
        match self
            .manager
            .send_command(session_id, SessionCommand::CancelScript { script_id })
            .await
        {
            Ok(()) => Ok(()),
            Err(_) => {
                // session already gone; finish the bookkeeping here
                complete(&mut self.scripts.lock(), script_id, ScriptState::Cancelled);
                Ok(())
            }
        }
    }

    /// Current progress of a script.
    pub fn status(&self, script_id: ScriptId) -> Option<ScriptStatus> {
        let scripts = self.scripts.lock();
        let entry = scripts.get(&script_id)?;
        Some(ScriptStatus {
            state: entry.state,
            completed: entry.outcomes.len(),
            total: entry.total,
        })
    }

    /// Waits until the script finishes and returns its result.
    pub async fn wait(&self, script_id: ScriptId) -> Result<ScriptResult, ScriptEngineError> {
        let rx = {
            let mut scripts = self.scripts.lock();
            let entry = scripts
                .get_mut(&script_id)
                .ok_or(ScriptEngineError::UnknownScript(script_id))?;
            if entry.state != ScriptState::Running {
                return Ok(entry.result(script_id));
            }
            let (tx, rx) = oneshot::channel();
            entry.waiters.push(tx);
            rx
        };
        rx.await
            .map_err(|_| ScriptEngineError::UnknownScript(script_id))
    }

}

fn complete(
    scripts: &mut HashMap<ScriptId, ScriptEntry>,
    script_id: ScriptId,
    state: ScriptState,
) {
    let Some(entry) = scripts.get_mut(&script_id) else {
        return;
    };
    if entry.state != ScriptState::Running {
        return;
    }
    entry.state = state;
    let result = entry.result(script_id);
    for waiter in entry.waiters.drain(..) {
        let _ = waiter.send(result.clone());
    }
    tracing::debug!(%script_id, ?state, "script finished");
}

async fn collector_task(
    scripts: Arc<Mutex<HashMap<ScriptId, ScriptEntry>>>,
    mut progress_rx: mpsc::Receiver<ScriptProgress>,
) {
    while let Some(progress) = progress_rx.recv().await {
        let mut scripts = scripts.lock();
        match progress {
            ScriptProgress::Command { script_id, outcome } => {
                if let Some(entry) = scripts.get_mut(&script_id)
                    && entry.state == ScriptState::Running
                {
                    entry.outcomes.push(outcome);
                }
            }
            ScriptProgress::Finished { script_id, state } => {
                complete(&mut scripts, script_id, state);
            }
            ScriptProgress::SessionEnded { session_id } => {
                let running: Vec<ScriptId> = scripts
                    .iter()
                    .filter(|(_, e)| e.session_id == session_id && e.state == ScriptState::Running)
                    .map(|(id, _)| *id)
                    .collect();
                for script_id in running {
                    complete(&mut scripts, script_id, ScriptState::SessionTerminated);
                }
            }
        }
    }
}
