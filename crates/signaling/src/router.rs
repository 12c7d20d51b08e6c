//! Message router
//!
//! Validates inbound envelopes, applies them to the [`PeerRegistry`] and
//! [`SessionManager`], and shapes the resulting outbound envelopes. Nothing
//! fails past [`MessageRouter::route`]: every [`SignalingError`] becomes an
//! `error` envelope for the originating peer.

use chrono::Utc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::SignalingConfig;
use crate::error::SignalingError;
use crate::pipeline::PipelineEvent;
use crate::protocol::{parse_inbound, Envelope, Inbound, PeerPayload, SdpType};
use crate::registry::{ConnectionHandle, PeerRegistry, PeerRole};
use crate::relay::Outbound;
use crate::session::{EndReason, IceDisposition, Session, SessionManager};

/// Routes envelopes between peers through the session state machine
#[derive(Debug)]
pub struct MessageRouter {
    registry: PeerRegistry,
    sessions: SessionManager,
}

impl MessageRouter {
    pub fn new(registry: PeerRegistry, sessions: SessionManager) -> Self {
        Self { registry, sessions }
    }

    pub fn from_config(config: &SignalingConfig) -> Self {
        Self::new(
            PeerRegistry::new(config.peers.id_format),
            SessionManager::new(config.sessions.ice_policy),
        )
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    /// Register a connection; the welcome is the first message it will get
    pub fn connect(&mut self, connection: ConnectionHandle) -> (String, Vec<Outbound>) {
        let peer = self.registry.register(connection);
        info!(peer_id = %peer.id, remote = ?peer.connection.remote_addr(), "Peer connected");
        let welcome = Envelope::Welcome {
            peer_id: peer.id.clone(),
        };
        (peer.id.clone(), vec![Outbound::envelope(peer.id, welcome)])
    }

    /// Remove a peer and end every session it was part of.
    ///
    /// Counterparts receive `endSession`. Unknown ids are a no-op.
    pub fn disconnect(&mut self, peer_id: &str) -> Vec<Outbound> {
        let Some(peer) = self.registry.remove(peer_id) else {
            return Vec::new();
        };
        info!(
            peer_id = %peer_id,
            connected_secs = (Utc::now() - peer.connected_at).num_seconds(),
            remaining = self.registry.len(),
            "Peer disconnected"
        );

        let mut outbound = Vec::new();
        for session_id in self.sessions.live_sessions_for(peer_id) {
            let reason = EndReason::PeerDisconnected {
                peer_id: peer_id.to_string(),
            };
            match self.sessions.end(&session_id, reason) {
                Ok(outcome) if outcome.changed() => {
                    if let Some(other) = outcome.session().counterpart(peer_id) {
                        outbound.push(Outbound::envelope(
                            other,
                            Envelope::EndSession {
                                session_id: session_id.clone(),
                            },
                        ));
                    }
                }
                Ok(_) => {}
                Err(e) => warn!(session_id = %session_id, "Failed to end session: {}", e),
            }
        }
        outbound
    }

    /// Parse, validate and dispatch one inbound frame from `from`
    pub fn route(&mut self, from: &str, text: &str) -> Vec<Outbound> {
        match parse_inbound(text) {
            Ok(Inbound::Envelope(envelope)) => {
                debug!(peer_id = %from, kind = envelope.kind(), "Routing envelope");
                match self.dispatch(from, envelope) {
                    Ok(outbound) => outbound,
                    Err(e) => self.reject(from, e),
                }
            }
            Ok(Inbound::Unknown(kind)) => {
                warn!(peer_id = %from, kind = %kind, "Ignoring message of unknown type");
                Vec::new()
            }
            Err(e) => self.reject(from, e),
        }
    }

    /// Apply an already-parsed envelope sent by `from`
    pub fn dispatch(&mut self, from: &str, envelope: Envelope) -> Result<Vec<Outbound>, SignalingError> {
        let kind = envelope.kind();
        match envelope {
            Envelope::SetPeerStatus { roles, meta } => {
                let role = PeerRole::from_roles(&roles)?;
                self.registry.set_role(from, role, meta)?;
                Ok(Vec::new())
            }
            Envelope::StartSession {
                session_id,
                peer_id,
                offer,
            } => self.start_session(from, session_id, peer_id, offer),
            Envelope::Peer {
                session_id,
                payload,
            } => self.peer_message(from, session_id, payload),
            Envelope::EndSession { session_id } => self.end_session(
                from,
                &session_id,
                EndReason::Requested {
                    by: from.to_string(),
                },
            ),
            Envelope::Error { details } => Ok(self.forward_error(from, &details)),
            Envelope::Welcome { .. } | Envelope::SessionStarted { .. } => Err(SignalingError::validation(
                format!("`{}` is only sent by the server", kind),
            )),
        }
    }

    /// Apply an event reported by the pipeline behind producer `producer_id`
    pub fn pipeline_event(&mut self, producer_id: &str, event: PipelineEvent) -> Vec<Outbound> {
        debug!(peer_id = %producer_id, event = event.name(), "Pipeline event");
        let result = match event {
            PipelineEvent::IceCandidate {
                session_id,
                candidate,
                sdp_m_line_index,
            } => self.dispatch(
                producer_id,
                Envelope::ice(session_id, candidate, sdp_m_line_index),
            ),
            PipelineEvent::SessionEnded { session_id } => {
                self.end_session(producer_id, &session_id, EndReason::PipelineEnded)
            }
            PipelineEvent::MediaStarted { session_id } => {
                self.ensure_participant(producer_id, &session_id).and_then(|()| {
                    self.sessions.mark_active(&session_id)?;
                    Ok(Vec::new())
                })
            }
            PipelineEvent::Error {
                session_id: Some(session_id),
                detail,
            } => self
                .ensure_participant(producer_id, &session_id)
                .map(|()| self.fail_session(&session_id, &detail)),
            PipelineEvent::Error {
                session_id: None,
                detail,
            } => {
                warn!(peer_id = %producer_id, "Pipeline error outside any session: {}", detail);
                Ok(Vec::new())
            }
        };

        result.unwrap_or_else(|e| {
            warn!(peer_id = %producer_id, "Pipeline event rejected: {}", e);
            Vec::new()
        })
    }

    /// Force a session to `Errored` and tell both participants
    pub fn fail_session(&mut self, session_id: &str, detail: &str) -> Vec<Outbound> {
        match self.sessions.fail(session_id, detail) {
            Ok(outcome) if outcome.changed() => {
                let session = outcome.session();
                let details = format!("session {} failed: {}", session_id, detail);
                vec![
                    Outbound::envelope(&session.producer_id, Envelope::error(details.clone())),
                    Outbound::envelope(&session.consumer_id, Envelope::error(details)),
                ]
            }
            Ok(_) => Vec::new(),
            Err(e) => {
                debug!(session_id = %session_id, "Cannot fail session: {}", e);
                Vec::new()
            }
        }
    }

    /// Fail every session that has been negotiating for `timeout` or longer
    pub fn expire_stale(&mut self, now: Instant, timeout: Duration) -> Vec<Outbound> {
        let stale = self.sessions.stale_sessions(now, timeout);
        stale
            .iter()
            .flat_map(|session_id| self.fail_session(session_id, "negotiation timed out"))
            .collect()
    }

    /// Forget terminal sessions older than `retention`
    pub fn prune(&mut self, now: Instant, retention: Duration) -> usize {
        self.sessions.prune_terminal(now, retention)
    }

    /// End every live session; both participants receive `endSession`
    pub fn shutdown(&mut self) -> Vec<Outbound> {
        let mut outbound = Vec::new();
        for session_id in self.sessions.live_session_ids() {
            if let Ok(outcome) = self.sessions.end(&session_id, EndReason::Shutdown) {
                let session = outcome.session();
                for peer in [&session.producer_id, &session.consumer_id] {
                    outbound.push(Outbound::envelope(
                        peer,
                        Envelope::EndSession {
                            session_id: session_id.clone(),
                        },
                    ));
                }
            }
        }
        outbound
    }

    fn start_session(
        &mut self,
        from: &str,
        session_id: String,
        target_id: String,
        offer: Option<String>,
    ) -> Result<Vec<Outbound>, SignalingError> {
        if session_id.is_empty() {
            return Err(SignalingError::validation("sessionId must not be empty"));
        }
        if target_id == from {
            return Err(SignalingError::validation("cannot start a session with yourself"));
        }

        let sender_role = self.registry.lookup(from)?.role;
        let target_role = self.registry.lookup(&target_id)?.role;

        let sender_is_consumer = sender_role == PeerRole::Consumer
            || (sender_role == PeerRole::Unset && target_role == PeerRole::Producer);

        let (producer_id, consumer_id) = if sender_is_consumer {
            if target_role == PeerRole::Consumer {
                return Err(SignalingError::validation(format!(
                    "peer {} is not a producer",
                    target_id
                )));
            }
            if offer.is_some() {
                return Err(SignalingError::validation(
                    "offers are not accepted from consumers; send `offer: null`",
                ));
            }
            (target_id.as_str(), from)
        } else {
            if target_role == PeerRole::Producer {
                return Err(SignalingError::validation(format!(
                    "peer {} is a producer, not a consumer",
                    target_id
                )));
            }
            (from, target_id.as_str())
        };

        self.sessions
            .create(&session_id, producer_id, consumer_id, offer.clone())?;

        Ok(vec![
            Outbound::envelope(
                from,
                Envelope::SessionStarted {
                    session_id: session_id.clone(),
                },
            ),
            Outbound::envelope(
                &target_id,
                Envelope::StartSession {
                    session_id,
                    peer_id: from.to_string(),
                    offer,
                },
            ),
        ])
    }

    fn peer_message(
        &mut self,
        from: &str,
        session_id: String,
        payload: PeerPayload,
    ) -> Result<Vec<Outbound>, SignalingError> {
        let (counterpart, from_producer) = {
            let session = self.participant(from, &session_id)?;
            let counterpart = session.counterpart(from).unwrap_or_default().to_string();
            (counterpart, session.producer_id == from)
        };

        match payload {
            PeerPayload::Sdp(sdp) => match sdp.kind {
                SdpType::Offer => {
                    if !from_producer {
                        return Err(SignalingError::validation(
                            "offers are not accepted from consumers",
                        ));
                    }
                    let flushed = self.sessions.apply_offer(&session_id, sdp.sdp.clone())?;
                    let mut outbound = vec![Outbound::envelope(
                        &counterpart,
                        Envelope::sdp(&session_id, SdpType::Offer, sdp.sdp),
                    )];
                    // Gathered while the offer was being created
                    outbound.extend(flushed.into_iter().map(|pending| {
                        Outbound::envelope(
                            &counterpart,
                            Envelope::ice(&session_id, pending.candidate, pending.sdp_m_line_index),
                        )
                    }));
                    Ok(outbound)
                }
                SdpType::Answer => {
                    if from_producer {
                        return Err(SignalingError::validation(
                            "answers are expected from the session's consumer",
                        ));
                    }
                    let flushed = self.sessions.apply_answer(&session_id, sdp.sdp.clone())?;
                    let mut outbound = vec![Outbound::envelope(
                        &counterpart,
                        Envelope::sdp(&session_id, SdpType::Answer, sdp.sdp),
                    )];
                    for pending in flushed {
                        let target = if pending.from == from {
                            counterpart.clone()
                        } else {
                            from.to_string()
                        };
                        outbound.push(Outbound::envelope(
                            target,
                            Envelope::ice(&session_id, pending.candidate, pending.sdp_m_line_index),
                        ));
                    }
                    Ok(outbound)
                }
            },
            PeerPayload::Ice(ice) => {
                match self.sessions.apply_ice(
                    &session_id,
                    from,
                    &ice.candidate,
                    ice.sdp_m_line_index,
                )? {
                    IceDisposition::Forward => Ok(vec![Outbound::envelope(
                        counterpart,
                        Envelope::Peer {
                            session_id,
                            payload: PeerPayload::Ice(ice),
                        },
                    )]),
                    IceDisposition::Buffered => {
                        debug!(session_id = %session_id, peer_id = %from, "ICE candidate buffered");
                        Ok(Vec::new())
                    }
                }
            }
        }
    }

    fn end_session(
        &mut self,
        from: &str,
        session_id: &str,
        reason: EndReason,
    ) -> Result<Vec<Outbound>, SignalingError> {
        self.ensure_participant(from, session_id)?;
        let outcome = self.sessions.end(session_id, reason)?;
        if !outcome.changed() {
            return Ok(Vec::new());
        }
        Ok(outcome
            .session()
            .counterpart(from)
            .map(|other| {
                vec![Outbound::envelope(
                    other,
                    Envelope::EndSession {
                        session_id: session_id.to_string(),
                    },
                )]
            })
            .unwrap_or_default())
    }

    /// Relay an `error` from `from` to the counterparts of its live sessions
    fn forward_error(&self, from: &str, details: &str) -> Vec<Outbound> {
        warn!(peer_id = %from, "Peer reported error: {}", details);
        self.sessions
            .live_sessions_for(from)
            .iter()
            .filter_map(|id| self.sessions.get(id))
            .filter_map(|session| session.counterpart(from))
            .map(|other| Outbound::envelope(other, Envelope::error(details)))
            .collect()
    }

    fn ensure_participant(&self, peer_id: &str, session_id: &str) -> Result<(), SignalingError> {
        self.participant(peer_id, session_id).map(|_| ())
    }

    fn participant(&self, peer_id: &str, session_id: &str) -> Result<&Session, SignalingError> {
        let session = self.sessions.lookup(session_id)?;
        if !session.involves(peer_id) {
            return Err(SignalingError::NotInSession {
                peer_id: peer_id.to_string(),
                session_id: session_id.to_string(),
            });
        }
        Ok(session)
    }

    fn reject(&self, from: &str, error: SignalingError) -> Vec<Outbound> {
        warn!(peer_id = %from, kind = ?error.kind(), "Rejected message: {}", error);
        vec![Outbound::envelope(from, Envelope::error(error.to_string()))]
    }
}
