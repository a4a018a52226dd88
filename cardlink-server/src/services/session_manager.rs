//! Registry of live sessions.
//!
//! Session state is confined to the session task; everyone else holds
//! the session id and talks to the task over its command channel. The
//! manager maps ids to channels, keeps snapshots of ended sessions for
//! the REST façade, and offers the operator surface (enqueue one APDU,
//! clear the queue, snapshot).

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use cardlink_types::SessionId;
use cardlink_types::apdu::Apdu;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};

use crate::metrics::{METRICS_ID_SESSIONS_OPEN, METRICS_ID_SESSIONS_TOTAL};
use crate::services::script_engine::{Script, ScriptId};
use crate::services::session::{SessionSnapshot, SessionSummary};

/// How long the manager waits for a session task to answer a snapshot
/// request before treating it as unavailable.
const SNAPSHOT_TIMEOUT: Duration = Duration::from_secs(1);

/// Mutations and queries routed into a session task.
pub(crate) enum SessionCommand {
    /// Enqueue a single operator APDU; replies with the queue position.
    Enqueue {
        apdu: Apdu,
        reply: oneshot::Sender<usize>,
    },
    /// Enqueue all commands of a script.
    EnqueueScript { script_id: ScriptId, script: Script },
    /// Drain the queued remainder of a script.
    CancelScript { script_id: ScriptId },
    /// Drop every pending command; replies with the number dropped.
    ClearQueue { reply: oneshot::Sender<usize> },
    /// Copy the session state for observers.
    Snapshot { reply: oneshot::Sender<SessionSnapshot> },
}

/// Errors of the session manager surface.
#[derive(Debug, thiserror::Error)]
pub enum SessionManagerError {
    /// No live session with this id.
    #[error("unknown session {0}")]
    UnknownSession(SessionId),
    /// The session task is shutting down and no longer takes commands.
    #[error("session {0} is shutting down")]
    SessionClosed(SessionId),
}

#[derive(Default)]
struct Inner {
    live: HashMap<SessionId, mpsc::Sender<SessionCommand>>,
    ended: VecDeque<SessionSnapshot>,
    total: u64,
}

/// Shared handle to the session registry.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Mutex<Inner>>,
    ended_retention: usize,
}

impl SessionManager {
    /// Creates an empty registry keeping `ended_retention` finished
    /// sessions around for the REST façade.
    pub(crate) fn new(ended_retention: usize) -> Self {
        ::metrics::gauge!(METRICS_ID_SESSIONS_OPEN).set(0);
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            ended_retention,
        }
    }

    /// Registers a freshly created session task.
    pub(crate) fn register(&self, id: SessionId, tx: mpsc::Sender<SessionCommand>) {
        let mut inner = self.inner.lock();
        inner.live.insert(id, tx);
        inner.total += 1;
        ::metrics::gauge!(METRICS_ID_SESSIONS_OPEN).increment(1);
        ::metrics::counter!(METRICS_ID_SESSIONS_TOTAL).increment(1);
    }

    /// Removes a terminated session, retaining its final snapshot.
    pub(crate) fn deregister(&self, id: SessionId, snapshot: SessionSnapshot) {
        let mut inner = self.inner.lock();
        if inner.live.remove(&id).is_some() {
            ::metrics::gauge!(METRICS_ID_SESSIONS_OPEN).decrement(1);
        }
        inner.ended.push_back(snapshot);
        while inner.ended.len() > self.ended_retention {
            inner.ended.pop_front();
        }
    }

    /// Routes a command into a live session task.
    pub(crate) async fn send_command(
        &self,
        id: SessionId,
        command: SessionCommand,
    ) -> Result<(), SessionManagerError> {
        let tx = self
            .inner
            .lock()
            .live
            .get(&id)
            .cloned()
            .ok_or(SessionManagerError::UnknownSession(id))?;
        tx.send(command)
            .await
            .map_err(|_| SessionManagerError::SessionClosed(id))
    }

    /// Enqueues a single APDU; returns its queue position.
    pub async fn enqueue_apdu(
        &self,
        id: SessionId,
        apdu: Apdu,
    ) -> Result<usize, SessionManagerError> {
        let (reply, rx) = oneshot::channel();
        self.send_command(id, SessionCommand::Enqueue { apdu, reply })
            .await?;
        rx.await.map_err(|_| SessionManagerError::SessionClosed(id))
    }

    /// Clears the pending queue; returns the number of dropped commands.
    /// The outstanding command is not cancelled.
    pub async fn clear_queue(&self, id: SessionId) -> Result<usize, SessionManagerError> {
        let (reply, rx) = oneshot::channel();
        self.send_command(id, SessionCommand::ClearQueue { reply })
            .await?;
        rx.await.map_err(|_| SessionManagerError::SessionClosed(id))
    }

    /// Full snapshot of one session, live or ended.
    pub async fn get(&self, id: SessionId) -> Option<SessionSnapshot> {
        let tx = self.inner.lock().live.get(&id).cloned();
        if let Some(tx) = tx {
            let (reply, rx) = oneshot::channel();
            if tx.send(SessionCommand::Snapshot { reply }).await.is_ok()
                && let Ok(Ok(snapshot)) = tokio::time::timeout(SNAPSHOT_TIMEOUT, rx).await
            {
                return Some(snapshot);
            }
        }
        let inner = self.inner.lock();
        inner.ended.iter().rev().find(|s| s.id == id).cloned()
    }

    /// Summaries of all sessions, live first, newest-ended last.
    pub async fn list(&self) -> Vec<SessionSummary> {
        let live: Vec<(SessionId, mpsc::Sender<SessionCommand>)> = {
            let inner = self.inner.lock();
            inner.live.iter().map(|(id, tx)| (*id, tx.clone())).collect()
        };
        let mut summaries = Vec::with_capacity(live.len());
        for (_, tx) in live {
            let (reply, rx) = oneshot::channel();
            if tx.send(SessionCommand::Snapshot { reply }).await.is_ok()
                && let Ok(Ok(snapshot)) = tokio::time::timeout(SNAPSHOT_TIMEOUT, rx).await
            {
                summaries.push(snapshot.summary());
            }
        }
        summaries.sort_by_key(|s| s.id);
        let inner = self.inner.lock();
        summaries.extend(inner.ended.iter().map(SessionSnapshot::summary));
        summaries
    }

    /// Number of live sessions.
    pub fn active_count(&self) -> usize {
        self.inner.lock().live.len()
    }

    /// Sessions created since server start.
    pub fn total_count(&self) -> u64 {
        self.inner.lock().total
    }
}
