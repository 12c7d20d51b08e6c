//! Outbound delivery
//!
//! Two modes:
//! - **addressed**: every outbound envelope names its target peer, resolved
//!   by the router from session state.
//! - **broadcast**: inbound frames are copied verbatim to every other peer,
//!   without any session semantics.
//!
//! A failed delivery is reported to the caller as [`SignalingError::PeerGone`]
//! so the stale peer can be reaped; it is never surfaced to whoever sent the
//! message being delivered.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, error, trace, warn};

use crate::error::SignalingError;
use crate::protocol::Envelope;
use crate::registry::PeerRegistry;

/// Delivery mode, selected per deployment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayMode {
    /// Route envelopes to the peer resolved from session state
    #[default]
    Addressed,
    /// Forward raw frames to every other connected peer
    Broadcast,
}

impl RelayMode {
    pub fn is_broadcast(&self) -> bool {
        matches!(self, Self::Broadcast)
    }
}

/// A single message waiting for delivery
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// Envelope serialized at delivery time
    Envelope { to: String, envelope: Envelope },
    /// Frame forwarded verbatim
    Raw { to: String, text: String },
}

impl Outbound {
    pub fn envelope(to: impl Into<String>, envelope: Envelope) -> Self {
        Outbound::Envelope {
            to: to.into(),
            envelope,
        }
    }

    pub fn target(&self) -> &str {
        match self {
            Outbound::Envelope { to, .. } | Outbound::Raw { to, .. } => to,
        }
    }
}

/// Delivers [`Outbound`] messages to registered connections
#[derive(Debug, Clone)]
pub struct RelayTransport {
    mode: RelayMode,
    send_timeout: Duration,
}

impl RelayTransport {
    pub fn new(mode: RelayMode, send_timeout: Duration) -> Self {
        Self { mode, send_timeout }
    }

    pub fn mode(&self) -> RelayMode {
        self.mode
    }

    /// One raw copy of `text` for every peer except `from`
    pub fn broadcast(&self, registry: &PeerRegistry, from: &str, text: &str) -> Vec<Outbound> {
        let mut targets = registry.ids_except(from);
        targets.sort();
        trace!(from = %from, fanout = targets.len(), "Broadcasting frame");
        targets
            .into_iter()
            .map(|to| Outbound::Raw {
                to,
                text: text.to_string(),
            })
            .collect()
    }

    /// Deliver one message.
    ///
    /// Targets already gone from the registry are skipped silently. A closed
    /// queue, or one that stays full past the send timeout, yields `PeerGone`.
    pub async fn deliver(
        &self,
        registry: &PeerRegistry,
        outbound: Outbound,
    ) -> Result<(), SignalingError> {
        let to = outbound.target().to_string();
        let Ok(peer) = registry.lookup(&to) else {
            debug!(peer_id = %to, "Dropping message for unregistered peer");
            return Ok(());
        };

        let text = match outbound {
            Outbound::Raw { text, .. } => text,
            Outbound::Envelope { envelope, .. } => match envelope.to_json() {
                Ok(text) => text,
                Err(e) => {
                    error!(peer_id = %to, kind = envelope.kind(), "Failed to serialize envelope: {}", e);
                    return Ok(());
                }
            },
        };

        match tokio::time::timeout(self.send_timeout, peer.connection.sender().send(text)).await {
            Ok(Ok(())) => {
                trace!(peer_id = %to, "Delivered message");
                Ok(())
            }
            Ok(Err(_)) => {
                warn!(peer_id = %to, "Delivery failed: connection closed");
                Err(SignalingError::PeerGone(to))
            }
            Err(_) => {
                warn!(peer_id = %to, timeout = ?self.send_timeout, "Delivery failed: send timed out");
                Err(SignalingError::PeerGone(to))
            }
        }
    }
}
