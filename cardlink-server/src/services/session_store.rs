//! Persistence interface for sessions and their APDU exchanges.
//!
//! The core only appends: one APDU row per history entry while the
//! session runs, one session row when it reaches a terminal state.
//! Failed handshakes never produce a row because no session exists yet.
//! Any relational backend can implement [`SessionStore`]; the bundled
//! [`MemorySessionStore`] backs tests and the example binary.

use async_trait::async_trait;
use cardlink_types::{Direction, EndReason, SessionId, SessionState};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;

/// One persisted session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionRow {
    /// Session id.
    pub id: SessionId,
    /// PSK identity of the card.
    pub psk_identity: String,
    /// Peer socket address.
    pub peer_addr: String,
    /// Final lifecycle state.
    pub state: SessionState,
    /// Creation time in unix milliseconds.
    pub created_at_ms: u64,
    /// Termination time in unix milliseconds.
    pub ended_at_ms: u64,
    /// Why the session ended.
    pub end_reason: EndReason,
}

/// One persisted APDU exchange entry.
#[derive(Debug, Clone, Serialize)]
pub struct ApduRow {
    /// Owning session.
    pub session_id: SessionId,
    /// Position within the session, across both directions.
    pub seq: u32,
    /// Sent or received.
    pub direction: Direction,
    /// Hex of the APDU bytes.
    pub hex: String,
    /// Status word on received entries.
    pub sw: Option<u16>,
    /// Timestamp in unix milliseconds.
    pub at_ms: u64,
    /// Round-trip on received entries.
    pub duration_us: Option<u64>,
}

/// Append-only persistence for sessions and APDUs.
///
/// Writes for one session id arrive from a single task and are therefore
/// naturally serialised; writes across sessions may interleave.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Records a terminated session.
    async fn record_session(&self, row: SessionRow) -> eyre::Result<()>;

    /// Appends one APDU exchange entry.
    async fn append_apdu(&self, row: ApduRow) -> eyre::Result<()>;

    /// Loads all recorded sessions.
    async fn load_sessions(&self) -> eyre::Result<Vec<SessionRow>>;
}

/// Shared handle to the configured store.
pub type SessionStoreService = Arc<dyn SessionStore>;

/// In-memory [`SessionStore`].
#[derive(Default)]
pub struct MemorySessionStore {
    sessions: Mutex<Vec<SessionRow>>,
    apdus: Mutex<Vec<ApduRow>>,
}

impl MemorySessionStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// All APDU rows recorded for `id`, in append order.
    pub fn apdus_for(&self, id: SessionId) -> Vec<ApduRow> {
        self.apdus
            .lock()
            .iter()
            .filter(|row| row.session_id == id)
            .cloned()
            .collect()
    }

    /// All session rows recorded so far.
    pub fn sessions(&self) -> Vec<SessionRow> {
        self.sessions.lock().clone()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn record_session(&self, row: SessionRow) -> eyre::Result<()> {
        self.sessions.lock().push(row);
        Ok(())
    }

    async fn append_apdu(&self, row: ApduRow) -> eyre::Result<()> {
        self.apdus.lock().push(row);
        Ok(())
    }

    async fn load_sessions(&self) -> eyre::Result<Vec<SessionRow>> {
        Ok(self.sessions.lock().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_store_keeps_rows_in_append_order() {
        let store = MemorySessionStore::new();
        let id = SessionId::new();
        for seq in 0..3u32 {
            store
                .append_apdu(ApduRow {
                    session_id: id,
                    seq,
                    direction: if seq % 2 == 0 { Direction::Sent } else { Direction::Received },
                    hex: "00A40400".to_owned(),
                    sw: None,
                    at_ms: 1000 + u64::from(seq),
                    duration_us: None,
                })
                .await
                .expect("appends");
        }
        let rows = store.apdus_for(id);
        assert_eq!(rows.len(), 3);
        assert!(rows.windows(2).all(|w| w[0].seq < w[1].seq));

        store
            .record_session(SessionRow {
                id,
                psk_identity: "TEST_UICC_001".to_owned(),
                peer_addr: "127.0.0.1:40000".to_owned(),
                state: SessionState::Closed,
                created_at_ms: 1000,
                ended_at_ms: 2000,
                end_reason: EndReason::Normal,
            })
            .await
            .expect("records");
        assert_eq!(store.load_sessions().await.expect("loads").len(), 1);
    }
}
