//! Per-session state and the pull-correlation core.
//!
//! The admin protocol is client-pulled, so the request/response pairing
//! is shifted by one step relative to HTTP semantics: each inbound pull
//! carries the response to the *previous* command. This module owns that
//! invariant; everything outside sees already-paired `(cmd, resp)` data
//! through events and script progress.
//!
//! A [`Session`] is plain state driven by exactly one task. All methods
//! are synchronous; the surrounding task does the I/O and applies the
//! returned events/progress.

use std::collections::{HashSet, VecDeque};
use std::net::SocketAddr;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use cardlink_types::apdu::{self, Apdu, ApduResponse, StatusClass, classify};
use cardlink_types::event::Event;
use cardlink_types::{Direction, EndReason, SessionId, SessionState};
use serde::Serialize;

use crate::config::AdminServerConfig;
use crate::error::SessionError;
use crate::services::script_engine::{
    CommandOutcome, ExpectedSw, Script, ScriptId, ScriptProgress, ScriptState,
};

/// Timing and error thresholds a session runs under.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SessionLimits {
    pub(crate) init_timeout: Duration,
    pub(crate) active_idle_timeout: Duration,
    pub(crate) session_max_lifetime: Duration,
    pub(crate) error_sw_threshold: u32,
}

impl SessionLimits {
    pub(crate) fn from_config(config: &AdminServerConfig) -> Self {
        Self {
            init_timeout: config.init_timeout,
            active_idle_timeout: config.active_idle_timeout,
            session_max_lifetime: config.session_max_lifetime,
            error_sw_threshold: config.error_sw_threshold,
        }
    }
}

/// One queued C-APDU, optionally bound to a script command.
#[derive(Debug, Clone)]
pub(crate) struct QueuedCommand {
    pub(crate) apdu: Apdu,
    pub(crate) binding: Option<ScriptBinding>,
}

/// Ties a queued command back to its script.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ScriptBinding {
    pub(crate) script_id: ScriptId,
    pub(crate) index: usize,
    pub(crate) total: usize,
    pub(crate) expected: ExpectedSw,
    pub(crate) stop_on_error: bool,
}

#[derive(Debug)]
struct Outstanding {
    apdu: Apdu,
    binding: Option<ScriptBinding>,
    sent_at: Instant,
}

/// One entry of the session history, in exchange order.
#[derive(Debug, Clone, Serialize)]
pub struct HistoryEntry {
    /// Position in the session, counted across both directions.
    pub seq: u32,
    /// Whether the server sent or received this APDU.
    pub direction: Direction,
    /// Hex of the APDU bytes on the wire.
    pub apdu_hex: String,
    /// Status word, present on received entries.
    pub sw: Option<u16>,
    /// Wall-clock timestamp in unix milliseconds.
    pub at_ms: u64,
    /// Command round-trip, present on received entries.
    pub duration_us: Option<u64>,
}

/// Immutable copy of a session, served over the REST façade.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    /// Session id.
    pub id: SessionId,
    /// PSK identity of the card.
    pub psk_identity: String,
    /// Peer socket address.
    pub peer_addr: String,
    /// Current lifecycle state.
    pub state: SessionState,
    /// Creation time in unix milliseconds.
    pub created_at_ms: u64,
    /// Last pull in unix milliseconds.
    pub last_activity_ms: u64,
    /// Commands still queued.
    pub queue_len: usize,
    /// Hex of the in-flight command, if any.
    pub outstanding_hex: Option<String>,
    /// Why the session ended, once terminal.
    pub end_reason: Option<EndReason>,
    /// Full exchange history.
    pub history: Vec<HistoryEntry>,
}

impl SessionSnapshot {
    /// Reduces the snapshot to the list-view summary.
    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id,
            psk_identity: self.psk_identity.clone(),
            peer_addr: self.peer_addr.clone(),
            state: self.state,
            created_at_ms: self.created_at_ms,
            last_activity_ms: self.last_activity_ms,
            queue_len: self.queue_len,
            apdus_exchanged: self.history.len(),
            end_reason: self.end_reason,
        }
    }
}

/// List-view projection of a session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    /// Session id.
    pub id: SessionId,
    /// PSK identity of the card.
    pub psk_identity: String,
    /// Peer socket address.
    pub peer_addr: String,
    /// Current lifecycle state.
    pub state: SessionState,
    /// Creation time in unix milliseconds.
    pub created_at_ms: u64,
    /// Last pull in unix milliseconds.
    pub last_activity_ms: u64,
    /// Commands still queued.
    pub queue_len: usize,
    /// History entries recorded so far.
    pub apdus_exchanged: usize,
    /// Why the session ended, once terminal.
    pub end_reason: Option<EndReason>,
}

/// The server's reply to one pull.
#[derive(Debug, PartialEq)]
pub(crate) enum PullReply {
    /// `200 OK` with the next C-APDU.
    Command(Vec<u8>),
    /// `204 No Content`; the session is closing.
    NoContent,
}

/// Everything one pull produced.
#[derive(Debug)]
pub(crate) struct PullStep {
    pub(crate) reply: PullReply,
    pub(crate) events: Vec<Event>,
    pub(crate) progress: Vec<ScriptProgress>,
}

/// State of one admin session. Owned by its session task.
pub(crate) struct Session {
    id: SessionId,
    psk_identity: String,
    peer_addr: SocketAddr,
    state: SessionState,
    created_at: SystemTime,
    started: Instant,
    last_activity: Instant,
    queue: VecDeque<QueuedCommand>,
    outstanding: Option<Outstanding>,
    history: Vec<HistoryEntry>,
    limits: SessionLimits,
    error_sws: u32,
    error_rate_flagged: bool,
    cancelled_scripts: HashSet<ScriptId>,
    end_reason: Option<EndReason>,
}

impl Session {
    /// Creates a session for a connection whose handshake just finished.
    pub(crate) fn new(
        id: SessionId,
        psk_identity: String,
        peer_addr: SocketAddr,
        limits: SessionLimits,
        now: Instant,
    ) -> Self {
        Self {
            id,
            psk_identity,
            peer_addr,
            state: SessionState::Handshaking,
            created_at: SystemTime::now(),
            started: now,
            last_activity: now,
            queue: VecDeque::new(),
            outstanding: None,
            history: Vec::new(),
            limits,
            error_sws: 0,
            error_rate_flagged: false,
            cancelled_scripts: HashSet::new(),
            end_reason: None,
        }
    }

    pub(crate) fn id(&self) -> SessionId {
        self.id
    }

    pub(crate) fn state(&self) -> SessionState {
        self.state
    }

    pub(crate) fn history(&self) -> &[HistoryEntry] {
        &self.history
    }

    /// Marks the handshake as done; the session now waits for the first
    /// pull.
    pub(crate) fn handshake_ok(&mut self, now: Instant) {
        self.transition(SessionState::Connected);
        self.started = now;
        self.last_activity = now;
    }

    /// Processes one pull of the card: pairs the carried R-APDU with the
    /// outstanding command and hands out the next one.
    pub(crate) fn handle_pull(
        &mut self,
        body: &[u8],
        now: Instant,
    ) -> Result<PullStep, SessionError> {
        let mut events = Vec::new();
        let mut progress = Vec::new();

        match self.state {
            SessionState::Connected => self.transition(SessionState::Active),
            SessionState::Active => {}
            state => {
                return Err(SessionError::Internal(format!(
                    "pull while session is {state}"
                )));
            }
        }
        self.last_activity = now;

        if let Some(outstanding) = self.outstanding.take() {
            self.pair_response(outstanding, body, now, &mut events, &mut progress)?;
        } else if !body.is_empty() {
            return Err(SessionError::UnexpectedResponse);
        }

        if let Some(next) = self.queue.pop_front() {
            let bytes = next
                .apdu
                .encode()
                .map_err(|err| SessionError::Internal(format!("queued apdu: {err}")))?;
            let apdu_hex = hex::encode_upper(&bytes);
            self.push_history(Direction::Sent, apdu_hex.clone(), None, now, None);
            events.push(Event::ApduSent { session_id: self.id, apdu_hex });
            self.outstanding = Some(Outstanding {
                apdu: next.apdu,
                binding: next.binding,
                sent_at: now,
            });
            Ok(PullStep { reply: PullReply::Command(bytes), events, progress })
        } else {
            self.transition(SessionState::Closing);
            Ok(PullStep { reply: PullReply::NoContent, events, progress })
        }
    }

    fn pair_response(
        &mut self,
        outstanding: Outstanding,
        body: &[u8],
        now: Instant,
        events: &mut Vec<Event>,
        progress: &mut Vec<ScriptProgress>,
    ) -> Result<(), SessionError> {
        let response = ApduResponse::decode(body)?;
        let sw = response.sw();
        let duration = now.saturating_duration_since(outstanding.sent_at);
        let apdu_hex = hex::encode_upper(body);
        self.push_history(
            Direction::Received,
            apdu_hex.clone(),
            Some(sw),
            now,
            Some(duration),
        );
        events.push(Event::ApduReceived {
            session_id: self.id,
            apdu_hex,
            sw,
            duration_us: duration.as_micros() as u64,
        });

        if let Some(correct_le) = apdu::wrong_le(sw) {
            // 6Cxx: same command again with the Le the card asked for
            self.queue.push_front(QueuedCommand {
                apdu: outstanding.apdu.with_le(correct_le),
                binding: outstanding.binding,
            });
            return Ok(());
        }
        if let Some(available) = apdu::more_data(sw) {
            // 61xx: fetch the waiting data before anything else
            self.queue.push_front(QueuedCommand {
                apdu: Apdu::get_response(available),
                binding: outstanding.binding,
            });
            return Ok(());
        }

        if classify(sw) == StatusClass::Error {
            self.error_sws += 1;
            if !self.error_rate_flagged && self.error_sws >= self.limits.error_sw_threshold {
                self.error_rate_flagged = true;
                events.push(Event::ErrorRateExceeded {
                    session_id: self.id,
                    errors: self.error_sws,
                });
            }
        }

        let Some(binding) = outstanding.binding else {
            return Ok(());
        };
        let outcome = CommandOutcome {
            index: binding.index,
            sent_hex: outstanding
                .apdu
                .encode()
                .map(|bytes| hex::encode_upper(bytes))
                .unwrap_or_default(),
            response_hex: hex::encode_upper(body),
            sw,
            duration_us: duration.as_micros() as u64,
            matched_expectation: binding.expected.matches(sw),
        };
        progress.push(ScriptProgress::Command { script_id: binding.script_id, outcome });

        if self.cancelled_scripts.remove(&binding.script_id) {
            progress.push(ScriptProgress::Finished {
                script_id: binding.script_id,
                state: ScriptState::Cancelled,
            });
        } else if classify(sw) == StatusClass::Error && binding.stop_on_error {
            self.drop_script_commands(binding.script_id);
            progress.push(ScriptProgress::Finished {
                script_id: binding.script_id,
                state: ScriptState::Stopped,
            });
        } else if binding.index + 1 == binding.total {
            progress.push(ScriptProgress::Finished {
                script_id: binding.script_id,
                state: ScriptState::Completed,
            });
        }
        Ok(())
    }

    /// Appends a single operator-enqueued APDU. Returns its queue
    /// position.
    pub(crate) fn enqueue_apdu(&mut self, apdu: Apdu) -> usize {
        self.queue.push_back(QueuedCommand { apdu, binding: None });
        self.queue.len()
    }

    /// Appends all commands of a script, bound to `script_id`.
    pub(crate) fn enqueue_script(&mut self, script_id: ScriptId, script: Script) {
        let total = script.commands.len();
        for (index, command) in script.commands.into_iter().enumerate() {
            self.queue.push_back(QueuedCommand {
                apdu: command.apdu,
                binding: Some(ScriptBinding {
                    script_id,
                    index,
                    total,
                    expected: command.expected,
                    stop_on_error: script.stop_on_error,
                }),
            });
        }
    }

    /// Drains the queued remainder of a script. If one of its commands
    /// is outstanding, the script finishes after that command resolves.
    pub(crate) fn cancel_script(&mut self, script_id: ScriptId) -> Vec<ScriptProgress> {
        self.drop_script_commands(script_id);
        let outstanding_is_ours = self
            .outstanding
            .as_ref()
            .and_then(|o| o.binding.as_ref())
            .is_some_and(|b| b.script_id == script_id);
        if outstanding_is_ours {
            self.cancelled_scripts.insert(script_id);
            Vec::new()
        } else {
            vec![ScriptProgress::Finished { script_id, state: ScriptState::Cancelled }]
        }
    }

    /// Clears every pending command. The outstanding command is not
    /// cancelled. Returns the number of dropped commands.
    pub(crate) fn clear_queue(&mut self) -> (usize, Vec<ScriptProgress>) {
        let dropped = self.queue.len();
        let affected: HashSet<ScriptId> = self
            .queue
            .iter()
            .filter_map(|cmd| cmd.binding.as_ref().map(|b| b.script_id))
            .collect();
        self.queue.clear();
        let mut progress = Vec::new();
        for script_id in affected {
            progress.extend(self.cancel_script(script_id));
        }
        (dropped, progress)
    }

    /// The next instant a timeout fires if nothing happens.
    pub(crate) fn next_deadline(&self) -> Instant {
        match self.state {
            SessionState::Connected | SessionState::Handshaking => {
                self.started + self.limits.init_timeout
            }
            _ => {
                let idle = self.last_activity + self.limits.active_idle_timeout;
                let max = self.started + self.limits.session_max_lifetime;
                idle.min(max)
            }
        }
    }

    /// Classifies an expired deadline. Returns `None` on spurious wakes.
    pub(crate) fn expired_deadline(&self, now: Instant) -> Option<EndReason> {
        match self.state {
            SessionState::Connected => {
                (now >= self.started + self.limits.init_timeout).then_some(EndReason::TimeoutInit)
            }
            SessionState::Active | SessionState::Closing => {
                if now >= self.started + self.limits.session_max_lifetime {
                    Some(EndReason::TimeoutSessionMax)
                } else if now >= self.last_activity + self.limits.active_idle_timeout {
                    Some(EndReason::TimeoutActiveIdle)
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    /// Moves the session to its terminal state and returns the
    /// `session_ended` event.
    pub(crate) fn finish(&mut self, reason: EndReason) -> Event {
        let terminal = match reason {
            EndReason::Normal | EndReason::Shutdown | EndReason::TimeoutInit => {
                SessionState::Closed
            }
            EndReason::Transport
            | EndReason::Protocol
            | EndReason::TimeoutActiveIdle
            | EndReason::TimeoutSessionMax
            | EndReason::Internal => SessionState::Failed,
        };
        self.transition(terminal);
        self.end_reason = Some(reason);
        Event::SessionEnded {
            session_id: self.id,
            state: self.state,
            reason,
        }
    }

    /// Copies the session for observers.
    pub(crate) fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id,
            psk_identity: self.psk_identity.clone(),
            peer_addr: self.peer_addr.to_string(),
            state: self.state,
            created_at_ms: unix_ms(self.created_at),
            last_activity_ms: unix_ms(self.wall_time(self.last_activity)),
            queue_len: self.queue.len(),
            outstanding_hex: self.outstanding.as_ref().map(|o| {
                o.apdu
                    .encode()
                    .map(|bytes| hex::encode_upper(bytes))
                    .unwrap_or_default()
            }),
            end_reason: self.end_reason,
            history: self.history.clone(),
        }
    }

    fn drop_script_commands(&mut self, script_id: ScriptId) {
        self.queue
            .retain(|cmd| cmd.binding.is_none_or(|b| b.script_id != script_id));
    }

    fn transition(&mut self, to: SessionState) {
        if self.state.can_transition(to) {
            tracing::debug!(session_id = %self.id, "state {} -> {to}", self.state);
            self.state = to;
        } else if self.state != to {
            // terminal states win races between error paths and shutdown
            tracing::trace!(
                session_id = %self.id,
                "ignoring transition {} -> {to}",
                self.state
            );
        }
    }

    fn push_history(
        &mut self,
        direction: Direction,
        apdu_hex: String,
        sw: Option<u16>,
        now: Instant,
        duration: Option<Duration>,
    ) {
        let seq = self.history.len() as u32;
        self.history.push(HistoryEntry {
            seq,
            direction,
            apdu_hex,
            sw,
            at_ms: unix_ms(self.wall_time(now)),
            duration_us: duration.map(|d| d.as_micros() as u64),
        });
    }

    /// Maps a monotonic instant onto the session's wall clock so history
    /// timestamps are monotonic even across system clock steps.
    fn wall_time(&self, at: Instant) -> SystemTime {
        self.created_at + at.saturating_duration_since(self.started)
    }
}

fn unix_ms(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::script_engine::ScriptCommand;

    fn limits() -> SessionLimits {
        SessionLimits {
            init_timeout: Duration::from_secs(30),
            active_idle_timeout: Duration::from_secs(60),
            session_max_lifetime: Duration::from_secs(300),
            error_sw_threshold: 2,
        }
    }

    fn session(now: Instant) -> Session {
        let mut session = Session::new(
            SessionId::new(),
            "TEST_UICC_001".to_owned(),
            "127.0.0.1:50000".parse().expect("valid addr"),
            limits(),
            now,
        );
        session.handshake_ok(now);
        session
    }

    fn select_isd() -> Apdu {
        Apdu::case3(
            0x00,
            0xA4,
            0x04,
            0x00,
            vec![0xA0, 0x00, 0x00, 0x01, 0x51, 0x00, 0x00],
        )
    }

    fn command_bytes(step: &PullStep) -> Vec<u8> {
        match &step.reply {
            PullReply::Command(bytes) => bytes.clone(),
            PullReply::NoContent => panic!("expected a command"),
        }
    }

    #[test]
    fn pull_pairing_is_shifted_by_one() {
        let t0 = Instant::now();
        let mut s = session(t0);
        s.enqueue_apdu(select_isd());
        s.enqueue_apdu(Apdu::case2(0x80, 0xF2, 0x80, 0x00, 256));

        // initial pull: no pairing, first command out
        let step = s.handle_pull(&[], t0 + Duration::from_millis(10)).expect("pull");
        assert_eq!(command_bytes(&step), select_isd().encode().expect("encodes"));
        assert_eq!(s.state(), SessionState::Active);

        // second pull pairs the first response and hands out command two
        let step = s
            .handle_pull(&[0x90, 0x00], t0 + Duration::from_millis(120))
            .expect("pull");
        assert!(matches!(step.reply, PullReply::Command(_)));

        // third pull pairs the last response and drains the queue
        let step = s
            .handle_pull(&[0x90, 0x00], t0 + Duration::from_millis(240))
            .expect("pull");
        assert_eq!(step.reply, PullReply::NoContent);
        assert_eq!(s.state(), SessionState::Closing);

        let history = s.history();
        assert_eq!(history.len(), 4);
        assert_eq!(history[0].direction, Direction::Sent);
        assert_eq!(history[1].direction, Direction::Received);
        assert_eq!(history[1].sw, Some(0x9000));
        assert!(history[1].duration_us.expect("has duration") >= 100_000);
        // sent/received counts never differ by more than one
        for i in 0..history.len() {
            let sent = history[..=i].iter().filter(|h| h.direction == Direction::Sent).count();
            let received = history[..=i].len() - sent;
            assert!(sent - received <= 1);
        }
        // timestamps are monotone
        for pair in history.windows(2) {
            assert!(pair[0].at_ms <= pair[1].at_ms);
        }
    }

    #[test]
    fn empty_queue_closes_immediately() {
        let t0 = Instant::now();
        let mut s = session(t0);
        let step = s.handle_pull(&[], t0).expect("pull");
        assert_eq!(step.reply, PullReply::NoContent);
        assert_eq!(s.state(), SessionState::Closing);
    }

    #[test]
    fn get_response_is_inserted_on_61xx() {
        let t0 = Instant::now();
        let mut s = session(t0);
        let script_id = ScriptId::new();
        s.enqueue_script(
            script_id,
            Script::from_apdus(vec![Apdu::case2(0x80, 0xCA, 0x00, 0x66, 256)]),
        );

        let step = s.handle_pull(&[], t0).expect("pull");
        assert_eq!(command_bytes(&step), vec![0x80, 0xCA, 0x00, 0x66, 0x00]);

        // card signals 32 bytes waiting
        let step = s.handle_pull(&[0x61, 0x20], t0 + Duration::from_millis(50)).expect("pull");
        assert_eq!(command_bytes(&step), vec![0x00, 0xC0, 0x00, 0x00, 0x20]);
        // no script progress yet: the command is not resolved
        assert!(step.progress.is_empty());

        let mut body = vec![0xAB; 32];
        body.extend_from_slice(&[0x90, 0x00]);
        let step = s.handle_pull(&body, t0 + Duration::from_millis(100)).expect("pull");
        assert_eq!(step.reply, PullReply::NoContent);
        assert_eq!(s.history().len(), 4);
        assert_eq!(step.progress.len(), 2);
        assert!(matches!(
            &step.progress[0],
            ScriptProgress::Command { outcome, .. } if outcome.sw == 0x9000 && outcome.index == 0
        ));
        assert!(matches!(
            &step.progress[1],
            ScriptProgress::Finished { state: ScriptState::Completed, .. }
        ));
    }

    #[test]
    fn command_is_reissued_on_6cxx() {
        let t0 = Instant::now();
        let mut s = session(t0);
        s.enqueue_apdu(Apdu::case2(0x80, 0xCA, 0x00, 0x66, 256));

        let _ = s.handle_pull(&[], t0).expect("pull");
        let step = s.handle_pull(&[0x6C, 0x10], t0 + Duration::from_millis(20)).expect("pull");
        assert_eq!(command_bytes(&step), vec![0x80, 0xCA, 0x00, 0x66, 0x10]);
    }

    #[test]
    fn stop_on_error_drains_the_script() {
        let t0 = Instant::now();
        let mut s = session(t0);
        let script_id = ScriptId::new();
        s.enqueue_script(
            script_id,
            Script {
                commands: vec![
                    ScriptCommand { apdu: select_isd(), expected: ExpectedSw::Success },
                    ScriptCommand {
                        apdu: Apdu::case2(0x80, 0xF2, 0x80, 0x00, 256),
                        expected: ExpectedSw::Success,
                    },
                ],
                stop_on_error: true,
            },
        );

        let _ = s.handle_pull(&[], t0).expect("pull");
        let step = s.handle_pull(&[0x6A, 0x82], t0 + Duration::from_millis(10)).expect("pull");
        // script stopped, queue drained, session closes
        assert_eq!(step.reply, PullReply::NoContent);
        assert!(matches!(
            &step.progress[0],
            ScriptProgress::Command { outcome, .. } if !outcome.matched_expectation
        ));
        assert!(matches!(
            &step.progress[1],
            ScriptProgress::Finished { state: ScriptState::Stopped, .. }
        ));
    }

    #[test]
    fn unsolicited_response_is_a_protocol_error() {
        let t0 = Instant::now();
        let mut s = session(t0);
        let err = s.handle_pull(&[0x90, 0x00], t0).expect_err("must fail");
        assert!(matches!(err, SessionError::UnexpectedResponse));
    }

    #[test]
    fn malformed_response_is_rejected() {
        let t0 = Instant::now();
        let mut s = session(t0);
        s.enqueue_apdu(select_isd());
        let _ = s.handle_pull(&[], t0).expect("pull");
        let err = s.handle_pull(&[0x90], t0).expect_err("must fail");
        assert!(matches!(err, SessionError::MalformedResponse(_)));
        assert_eq!(err.end_reason(), EndReason::Protocol);
    }

    #[test]
    fn deadlines_follow_the_state() {
        let t0 = Instant::now();
        let mut s = session(t0);
        assert_eq!(s.next_deadline(), t0 + Duration::from_secs(30));
        assert_eq!(
            s.expired_deadline(t0 + Duration::from_secs(31)),
            Some(EndReason::TimeoutInit)
        );

        let _ = s.handle_pull(&[], t0 + Duration::from_secs(1));
        assert_eq!(s.next_deadline(), t0 + Duration::from_secs(61));
        assert_eq!(s.expired_deadline(t0 + Duration::from_secs(30)), None);
        assert_eq!(
            s.expired_deadline(t0 + Duration::from_secs(62)),
            Some(EndReason::TimeoutActiveIdle)
        );
        assert_eq!(
            s.expired_deadline(t0 + Duration::from_secs(301)),
            Some(EndReason::TimeoutSessionMax)
        );
    }

    #[test]
    fn error_rate_is_flagged_once() {
        let t0 = Instant::now();
        let mut s = session(t0);
        for _ in 0..3 {
            s.enqueue_apdu(select_isd());
        }
        let _ = s.handle_pull(&[], t0).expect("pull");
        let step = s.handle_pull(&[0x6A, 0x82], t0).expect("pull");
        assert!(!step.events.iter().any(|e| matches!(e, Event::ErrorRateExceeded { .. })));
        let step = s.handle_pull(&[0x6A, 0x82], t0).expect("pull");
        assert!(step.events.iter().any(|e| matches!(e, Event::ErrorRateExceeded { .. })));
        let step = s.handle_pull(&[0x6A, 0x82], t0).expect("pull");
        assert!(!step.events.iter().any(|e| matches!(e, Event::ErrorRateExceeded { .. })));
    }

    #[test]
    fn cancel_keeps_the_outstanding_command() {
        let t0 = Instant::now();
        let mut s = session(t0);
        let script_id = ScriptId::new();
        s.enqueue_script(
            script_id,
            Script::from_apdus(vec![
                select_isd(),
                Apdu::case2(0x80, 0xF2, 0x80, 0x00, 256),
                Apdu::case2(0x80, 0xCA, 0x00, 0x66, 256),
            ]),
        );
        let _ = s.handle_pull(&[], t0).expect("pull");

        // first command is outstanding; cancellation drains the rest
        let progress = s.cancel_script(script_id);
        assert!(progress.is_empty());

        // the outstanding command still resolves, then the script is done
        let step = s.handle_pull(&[0x90, 0x00], t0).expect("pull");
        assert_eq!(step.reply, PullReply::NoContent);
        assert!(matches!(&step.progress[0], ScriptProgress::Command { .. }));
        assert!(matches!(
            &step.progress[1],
            ScriptProgress::Finished { state: ScriptState::Cancelled, .. }
        ));
    }

    #[test]
    fn clear_queue_reports_dropped_commands() {
        let t0 = Instant::now();
        let mut s = session(t0);
        s.enqueue_apdu(select_isd());
        s.enqueue_apdu(select_isd());
        let (dropped, progress) = s.clear_queue();
        assert_eq!(dropped, 2);
        assert!(progress.is_empty());
    }

    #[test]
    fn finish_maps_reasons_to_terminal_states() {
        let t0 = Instant::now();
        let mut s = session(t0);
        let event = s.finish(EndReason::Normal);
        assert_eq!(s.state(), SessionState::Closed);
        assert!(matches!(
            event,
            Event::SessionEnded { reason: EndReason::Normal, state: SessionState::Closed, .. }
        ));

        let mut s = session(t0);
        s.finish(EndReason::TimeoutActiveIdle);
        assert_eq!(s.state(), SessionState::Failed);
    }
}
