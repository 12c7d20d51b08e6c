//! Session negotiation state machine
//!
//! ```text
//! Requested ──offer──▶ Offered ──answer──▶ Answered ──media──▶ Active
//!     │                   │                    │                  │
//!     └───────────────────┴──── end / fail ────┴──────────────────┘
//!                                   ▼
//!                           Ended | Errored  (terminal)
//! ```
//!
//! The manager exclusively owns [`Session`] records and refers to peers by id.
//! A rejected operation never mutates the session it was aimed at.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::SignalingError;

/// Negotiation state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Created without an offer; waiting for the producer's SDP
    Requested,
    /// Offer known, waiting for the answer
    Offered,
    /// Answer relayed; ICE may still be trickling
    Answered,
    /// Media is flowing
    Active,
    /// Terminated normally
    Ended,
    /// Terminated by a failure
    Errored,
}

impl SessionState {
    /// No transition leaves a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Ended | SessionState::Errored)
    }

    /// States bounded by the negotiation timeout
    pub fn is_negotiating(&self) -> bool {
        matches!(
            self,
            SessionState::Requested | SessionState::Offered | SessionState::Answered
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Requested => "requested",
            SessionState::Offered => "offered",
            SessionState::Answered => "answered",
            SessionState::Active => "active",
            SessionState::Ended => "ended",
            SessionState::Errored => "errored",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a session reached a terminal state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndReason {
    /// A participant sent `endSession`
    Requested { by: String },
    /// A participant's connection went away
    PeerDisconnected { peer_id: String },
    /// The media pipeline reported the session over
    PipelineEnded,
    /// Server shutdown
    Shutdown,
    /// Forced to `Errored`
    Failed(String),
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndReason::Requested { by } => write!(f, "ended by peer {}", by),
            EndReason::PeerDisconnected { peer_id } => write!(f, "peer {} disconnected", peer_id),
            EndReason::PipelineEnded => write!(f, "pipeline ended"),
            EndReason::Shutdown => write!(f, "server shutdown"),
            EndReason::Failed(detail) => write!(f, "error: {}", detail),
        }
    }
}

/// ICE candidate forwarding policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IcePolicy {
    /// Forward every candidate as soon as it arrives
    #[default]
    Immediate,
    /// Hold candidates while the session is `Offered`; flush after the answer
    BufferUntilAnswered,
}

/// Candidate held back until the offer or answer it depends on is relayed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingCandidate {
    pub from: String,
    pub candidate: String,
    pub sdp_m_line_index: u32,
}

/// What to do with a candidate accepted by [`SessionManager::apply_ice`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceDisposition {
    Forward,
    Buffered,
}

/// A negotiation between one producer and one consumer
#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub producer_id: String,
    pub consumer_id: String,
    pub offer: Option<String>,
    pub answer: Option<String>,
    pub created_at: DateTime<Utc>,
    pub end_reason: Option<EndReason>,
    state: SessionState,
    state_since: Instant,
    pending_ice: Vec<PendingCandidate>,
}

impl Session {
    fn new(id: String, producer_id: String, consumer_id: String, offer: Option<String>) -> Self {
        let state = if offer.is_some() {
            SessionState::Offered
        } else {
            SessionState::Requested
        };

        Self {
            id,
            producer_id,
            consumer_id,
            offer,
            answer: None,
            created_at: Utc::now(),
            end_reason: None,
            state,
            state_since: Instant::now(),
            pending_ice: Vec::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Time spent in the current state
    pub fn state_age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.state_since)
    }

    pub fn involves(&self, peer_id: &str) -> bool {
        self.producer_id == peer_id || self.consumer_id == peer_id
    }

    /// The other participant, or `None` if `peer_id` is not a participant
    pub fn counterpart(&self, peer_id: &str) -> Option<&str> {
        if self.producer_id == peer_id {
            Some(&self.consumer_id)
        } else if self.consumer_id == peer_id {
            Some(&self.producer_id)
        } else {
            None
        }
    }

    /// Candidates currently held back
    pub fn pending_ice(&self) -> &[PendingCandidate] {
        &self.pending_ice
    }

    fn transition(&mut self, next: SessionState) {
        debug!(session_id = %self.id, from = %self.state, to = %next, "Session transition");
        self.state = next;
        self.state_since = Instant::now();
    }

    fn invalid(&self, operation: &'static str) -> SignalingError {
        SignalingError::InvalidTransition {
            session_id: self.id.clone(),
            operation,
            state: self.state,
        }
    }
}

/// Result of [`SessionManager::end`] and [`SessionManager::fail`]
#[derive(Debug, Clone)]
pub enum EndOutcome {
    /// The session was live and is now terminal
    Ended(Session),
    /// The session was already terminal; nothing changed
    AlreadyTerminal(Session),
}

impl EndOutcome {
    pub fn session(&self) -> &Session {
        match self {
            EndOutcome::Ended(session) | EndOutcome::AlreadyTerminal(session) => session,
        }
    }

    pub fn changed(&self) -> bool {
        matches!(self, EndOutcome::Ended(_))
    }
}

/// Owner of all session records
#[derive(Debug, Default)]
pub struct SessionManager {
    sessions: HashMap<String, Session>,
    ice_policy: IcePolicy,
}

impl SessionManager {
    pub fn new(ice_policy: IcePolicy) -> Self {
        Self {
            sessions: HashMap::new(),
            ice_policy,
        }
    }

    pub fn ice_policy(&self) -> IcePolicy {
        self.ice_policy
    }

    /// Create a session.
    ///
    /// With an offer the session starts `Offered`, without one `Requested`.
    /// Fails if the id is bound to a non-terminal session; a terminal session
    /// with the same id is replaced.
    pub fn create(
        &mut self,
        session_id: &str,
        producer_id: &str,
        consumer_id: &str,
        offer: Option<String>,
    ) -> Result<&Session, SignalingError> {
        if let Some(existing) = self.sessions.get(session_id) {
            if !existing.is_terminal() {
                return Err(SignalingError::DuplicateSession(session_id.to_string()));
            }
        }

        let session = Session::new(
            session_id.to_string(),
            producer_id.to_string(),
            consumer_id.to_string(),
            offer,
        );
        info!(
            session_id = %session_id,
            producer_id = %producer_id,
            consumer_id = %consumer_id,
            state = %session.state,
            "Session created"
        );
        self.sessions.insert(session_id.to_string(), session);
        Ok(&self.sessions[session_id])
    }

    /// Record the producer's offer: `Requested → Offered`.
    ///
    /// Returns the producer candidates gathered before the offer, to be
    /// relayed right behind it. Under [`IcePolicy::BufferUntilAnswered`] they
    /// stay held until the answer instead.
    pub fn apply_offer(
        &mut self,
        session_id: &str,
        sdp: String,
    ) -> Result<Vec<PendingCandidate>, SignalingError> {
        let policy = self.ice_policy;
        let session = self.get_mut(session_id)?;
        if session.state != SessionState::Requested {
            return Err(session.invalid("apply offer to"));
        }
        session.offer = Some(sdp);
        session.transition(SessionState::Offered);
        match policy {
            IcePolicy::Immediate => Ok(std::mem::take(&mut session.pending_ice)),
            IcePolicy::BufferUntilAnswered => Ok(Vec::new()),
        }
    }

    /// Record the answer: `Offered → Answered`.
    ///
    /// Returns candidates buffered while waiting for it, in arrival order.
    pub fn apply_answer(
        &mut self,
        session_id: &str,
        sdp: String,
    ) -> Result<Vec<PendingCandidate>, SignalingError> {
        let session = self.get_mut(session_id)?;
        if session.state != SessionState::Offered {
            return Err(session.invalid("apply answer to"));
        }
        session.answer = Some(sdp);
        session.transition(SessionState::Answered);
        Ok(std::mem::take(&mut session.pending_ice))
    }

    /// Accept a trickled candidate from `from`.
    ///
    /// Valid from `Offered`, `Answered` and `Active`. A producer may also
    /// trickle while the session is `Requested`: its pipeline starts gathering
    /// before the offer is out, so those candidates wait for the offer. Under
    /// [`IcePolicy::Immediate`] candidates are otherwise never held back, even
    /// if they race the answer.
    pub fn apply_ice(
        &mut self,
        session_id: &str,
        from: &str,
        candidate: &str,
        sdp_m_line_index: u32,
    ) -> Result<IceDisposition, SignalingError> {
        let policy = self.ice_policy;
        let session = self.get_mut(session_id)?;
        let from_producer = session.producer_id == from;
        match (session.state, policy) {
            (SessionState::Requested, _) if from_producer => {
                session.pending_ice.push(PendingCandidate {
                    from: from.to_string(),
                    candidate: candidate.to_string(),
                    sdp_m_line_index,
                });
                Ok(IceDisposition::Buffered)
            }
            (SessionState::Offered, IcePolicy::BufferUntilAnswered) => {
                session.pending_ice.push(PendingCandidate {
                    from: from.to_string(),
                    candidate: candidate.to_string(),
                    sdp_m_line_index,
                });
                Ok(IceDisposition::Buffered)
            }
            (SessionState::Offered | SessionState::Answered | SessionState::Active, _) => {
                Ok(IceDisposition::Forward)
            }
            _ => Err(session.invalid("add ICE candidate to")),
        }
    }

    /// Media started flowing: `Answered → Active`
    pub fn mark_active(&mut self, session_id: &str) -> Result<(), SignalingError> {
        let session = self.get_mut(session_id)?;
        if session.state != SessionState::Answered {
            return Err(session.invalid("activate"));
        }
        session.transition(SessionState::Active);
        info!(session_id = %session_id, "Session active");
        Ok(())
    }

    /// End a session. Idempotent for terminal sessions.
    pub fn end(&mut self, session_id: &str, reason: EndReason) -> Result<EndOutcome, SignalingError> {
        self.terminate(session_id, SessionState::Ended, reason)
    }

    /// Force a session to `Errored`. Idempotent for terminal sessions.
    pub fn fail(&mut self, session_id: &str, detail: &str) -> Result<EndOutcome, SignalingError> {
        self.terminate(
            session_id,
            SessionState::Errored,
            EndReason::Failed(detail.to_string()),
        )
    }

    fn terminate(
        &mut self,
        session_id: &str,
        terminal: SessionState,
        reason: EndReason,
    ) -> Result<EndOutcome, SignalingError> {
        let session = self.get_mut(session_id)?;
        if session.is_terminal() {
            debug!(session_id = %session_id, state = %session.state, "Session already terminal");
            return Ok(EndOutcome::AlreadyTerminal(session.clone()));
        }

        session.transition(terminal);
        session.pending_ice.clear();
        if terminal == SessionState::Errored {
            warn!(session_id = %session_id, reason = %reason, "Session failed");
        } else {
            info!(session_id = %session_id, reason = %reason, "Session ended");
        }
        session.end_reason = Some(reason);
        Ok(EndOutcome::Ended(session.clone()))
    }

    pub fn get(&self, session_id: &str) -> Option<&Session> {
        self.sessions.get(session_id)
    }

    /// Look up a session or fail with `UnknownSession`
    pub fn lookup(&self, session_id: &str) -> Result<&Session, SignalingError> {
        self.sessions
            .get(session_id)
            .ok_or_else(|| SignalingError::UnknownSession(session_id.to_string()))
    }

    fn get_mut(&mut self, session_id: &str) -> Result<&mut Session, SignalingError> {
        self.sessions
            .get_mut(session_id)
            .ok_or_else(|| SignalingError::UnknownSession(session_id.to_string()))
    }

    /// Non-terminal sessions `peer_id` takes part in
    pub fn live_sessions_for(&self, peer_id: &str) -> Vec<String> {
        let mut ids: Vec<String> = self
            .sessions
            .values()
            .filter(|s| !s.is_terminal() && s.involves(peer_id))
            .map(|s| s.id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Ids of every non-terminal session
    pub fn live_session_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .sessions
            .values()
            .filter(|s| !s.is_terminal())
            .map(|s| s.id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Negotiating sessions that have sat in their state for `timeout` or longer
    pub fn stale_sessions(&self, now: Instant, timeout: Duration) -> Vec<String> {
        let mut ids: Vec<String> = self
            .sessions
            .values()
            .filter(|s| s.state.is_negotiating() && s.state_age(now) >= timeout)
            .map(|s| s.id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Drop terminal sessions older than `retention`; returns how many went
    pub fn prune_terminal(&mut self, now: Instant, retention: Duration) -> usize {
        let before = self.sessions.len();
        self.sessions
            .retain(|_, s| !(s.is_terminal() && s.state_age(now) >= retention));
        before - self.sessions.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Session> {
        self.sessions.values()
    }

    pub fn live_count(&self) -> usize {
        self.sessions.values().filter(|s| !s.is_terminal()).count()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
