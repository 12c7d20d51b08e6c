//! Media pipeline boundary
//!
//! The signaling core never drives a media engine directly. A
//! [`PipelineAdapter`] is attached to the hub through a [`LocalProducer`],
//! which joins as an ordinary producer peer: envelopes addressed to it become
//! adapter calls, and events the adapter reports through [`PipelineEvents`]
//! enter the hub's single inbound queue.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::hub::HubHandle;
use crate::protocol::{parse_inbound, Envelope, Inbound, PeerPayload, SdpType};
use crate::registry::ConnectionHandle;
use crate::Result;

/// Events a pipeline reports back into signaling
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    /// Local ICE candidate gathered for a session
    IceCandidate {
        session_id: String,
        candidate: String,
        sdp_m_line_index: u32,
    },
    /// The pipeline tore the session down on its own
    SessionEnded { session_id: String },
    /// Media is flowing; moves the session to `Active`
    MediaStarted { session_id: String },
    /// Pipeline failure, optionally tied to a session
    Error {
        session_id: Option<String>,
        detail: String,
    },
}

impl PipelineEvent {
    pub fn name(&self) -> &'static str {
        match self {
            PipelineEvent::IceCandidate { .. } => "ice_candidate",
            PipelineEvent::SessionEnded { .. } => "session_ended",
            PipelineEvent::MediaStarted { .. } => "media_started",
            PipelineEvent::Error { .. } => "error",
        }
    }
}

/// A media engine driven by signaling.
///
/// Only `create_offer` can fail synchronously; everything else the pipeline
/// has to say comes back as a [`PipelineEvent`].
#[async_trait]
pub trait PipelineAdapter: Send + Sync {
    /// Build the pipeline for `session_id` and return its SDP offer
    async fn create_offer(&self, session_id: &str) -> Result<String>;

    /// Apply the remote answer
    async fn accept_answer(&self, session_id: &str, sdp: &str);

    /// Apply a remote ICE candidate
    async fn add_ice_candidate(&self, session_id: &str, candidate: &str, sdp_m_line_index: u32);

    /// Tear down the pipeline for `session_id`
    async fn end_session(&self, session_id: &str);
}

/// Event sink handed to a pipeline adapter
#[derive(Debug, Clone)]
pub struct PipelineEvents {
    hub: HubHandle,
    peer_id: String,
}

impl PipelineEvents {
    /// Peer id the pipeline is registered under
    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn emit(&self, event: PipelineEvent) -> Result<()> {
        self.hub.pipeline_event(&self.peer_id, event)
    }

    pub fn ice_candidate(
        &self,
        session_id: impl Into<String>,
        candidate: impl Into<String>,
        sdp_m_line_index: u32,
    ) -> Result<()> {
        self.emit(PipelineEvent::IceCandidate {
            session_id: session_id.into(),
            candidate: candidate.into(),
            sdp_m_line_index,
        })
    }

    pub fn session_ended(&self, session_id: impl Into<String>) -> Result<()> {
        self.emit(PipelineEvent::SessionEnded {
            session_id: session_id.into(),
        })
    }

    pub fn media_started(&self, session_id: impl Into<String>) -> Result<()> {
        self.emit(PipelineEvent::MediaStarted {
            session_id: session_id.into(),
        })
    }

    pub fn error(&self, session_id: Option<String>, detail: impl Into<String>) -> Result<()> {
        self.emit(PipelineEvent::Error {
            session_id,
            detail: detail.into(),
        })
    }
}

/// A pipeline attached to the hub as a producer peer
pub struct LocalProducer {
    peer_id: String,
    hub: HubHandle,
    events: PipelineEvents,
    task: JoinHandle<()>,
}

impl LocalProducer {
    /// Register a producer peer and bridge it to the adapter built by `build`.
    ///
    /// `meta` is announced with the producer's `setPeerStatus`.
    pub async fn attach<A, F>(hub: HubHandle, meta: Value, queue_size: usize, build: F) -> Result<Self>
    where
        A: PipelineAdapter + 'static,
        F: FnOnce(PipelineEvents) -> A,
    {
        let (tx, rx) = mpsc::channel::<String>(queue_size);
        let peer_id = hub.connect(ConnectionHandle::new(tx)).await?;
        info!(peer_id = %peer_id, "Local producer attached");

        let events = PipelineEvents {
            hub: hub.clone(),
            peer_id: peer_id.clone(),
        };
        let bridge = Bridge {
            peer_id: peer_id.clone(),
            hub: hub.clone(),
            events: events.clone(),
            adapter: Arc::new(build(events.clone())),
            meta,
        };
        let task = tokio::spawn(bridge.run(rx));

        Ok(Self {
            peer_id,
            hub,
            events,
            task,
        })
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn events(&self) -> PipelineEvents {
        self.events.clone()
    }

    /// Leave the hub; live sessions end as for any disconnect
    pub async fn detach(self) -> Result<()> {
        self.hub.disconnect(&self.peer_id)?;
        if let Err(e) = self.task.await {
            error!(peer_id = %self.peer_id, "Local producer task failed: {}", e);
        }
        Ok(())
    }
}

struct Bridge<A> {
    peer_id: String,
    hub: HubHandle,
    events: PipelineEvents,
    adapter: Arc<A>,
    meta: Value,
}

impl<A: PipelineAdapter> Bridge<A> {
    async fn run(self, mut rx: mpsc::Receiver<String>) {
        while let Some(text) = rx.recv().await {
            let envelope = match parse_inbound(&text) {
                Ok(Inbound::Envelope(envelope)) => envelope,
                Ok(Inbound::Unknown(kind)) => {
                    debug!(peer_id = %self.peer_id, kind = %kind, "Ignoring unknown message");
                    continue;
                }
                Err(e) => {
                    warn!(peer_id = %self.peer_id, "Unparseable message for local producer: {}", e);
                    continue;
                }
            };

            if let Err(e) = self.handle(envelope).await {
                error!(peer_id = %self.peer_id, "Hub unavailable, stopping local producer: {}", e);
                break;
            }
        }
        debug!(peer_id = %self.peer_id, "Local producer bridge exited");
    }

    async fn handle(&self, envelope: Envelope) -> Result<()> {
        match envelope {
            Envelope::Welcome { .. } => self.send(Envelope::SetPeerStatus {
                roles: vec!["producer".to_string()],
                meta: self.meta.clone(),
            }),
            Envelope::StartSession {
                session_id,
                offer: None,
                ..
            } => match self.adapter.create_offer(&session_id).await {
                Ok(sdp) => self.send(Envelope::sdp(session_id, SdpType::Offer, sdp)),
                Err(e) => self.events.error(Some(session_id), e.to_string()),
            },
            Envelope::StartSession {
                session_id,
                offer: Some(_),
                ..
            } => {
                warn!(
                    peer_id = %self.peer_id,
                    session_id = %session_id,
                    "Local producer does not accept remote offers"
                );
                self.send(Envelope::EndSession { session_id })
            }
            Envelope::Peer {
                session_id,
                payload,
            } => {
                match payload {
                    PeerPayload::Sdp(sdp) if sdp.kind == SdpType::Answer => {
                        self.adapter.accept_answer(&session_id, &sdp.sdp).await
                    }
                    PeerPayload::Sdp(_) => {
                        warn!(session_id = %session_id, "Local producer ignoring remote offer")
                    }
                    PeerPayload::Ice(ice) => {
                        self.adapter
                            .add_ice_candidate(&session_id, &ice.candidate, ice.sdp_m_line_index)
                            .await
                    }
                }
                Ok(())
            }
            Envelope::EndSession { session_id } => {
                self.adapter.end_session(&session_id).await;
                Ok(())
            }
            Envelope::Error { details } => {
                warn!(peer_id = %self.peer_id, "Error reported to local producer: {}", details);
                Ok(())
            }
            Envelope::SessionStarted { .. } | Envelope::SetPeerStatus { .. } => Ok(()),
        }
    }

    fn send(&self, envelope: Envelope) -> Result<()> {
        self.hub.frame(&self.peer_id, envelope.to_json()?)
    }
}
