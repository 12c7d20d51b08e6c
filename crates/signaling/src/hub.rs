//! Signaling hub
//!
//! A single task owns the [`MessageRouter`] and with it every piece of
//! signaling state. Connection tasks and pipeline adapters talk to it only
//! through [`HubHandle`], which pushes onto one ordered queue, so all state
//! mutation is serialized without locks.

use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::SignalingConfig;
use crate::error::SignalingError;
use crate::pipeline::PipelineEvent;
use crate::protocol::Envelope;
use crate::registry::{ConnectionHandle, PeerRole};
use crate::relay::{Outbound, RelayMode, RelayTransport};
use crate::router::MessageRouter;
use crate::session::SessionState;
use crate::{Error, Result};

/// Work items for the hub task
#[derive(Debug)]
pub enum HubEvent {
    /// New connection; the reply carries the assigned peer id
    Connect {
        connection: ConnectionHandle,
        reply: oneshot::Sender<Result<String>>,
    },
    /// Text frame received from a peer
    Frame { peer_id: String, text: String },
    /// Connection closed
    Disconnect { peer_id: String },
    /// Event reported by a local pipeline
    Pipeline {
        peer_id: String,
        event: PipelineEvent,
    },
    /// Inspection request
    Snapshot { reply: oneshot::Sender<HubSnapshot> },
    /// End all sessions and stop
    Shutdown { reply: oneshot::Sender<()> },
}

/// Point-in-time view of hub state
#[derive(Debug, Clone, PartialEq)]
pub struct HubSnapshot {
    pub mode: RelayMode,
    pub peers: Vec<PeerSnapshot>,
    pub sessions: Vec<SessionSnapshot>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PeerSnapshot {
    pub id: String,
    pub role: PeerRole,
    pub connected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub id: String,
    pub producer_id: String,
    pub consumer_id: String,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
}

impl HubSnapshot {
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn peer_role(&self, peer_id: &str) -> Option<PeerRole> {
        self.peers.iter().find(|p| p.id == peer_id).map(|p| p.role)
    }

    pub fn session_state(&self, session_id: &str) -> Option<SessionState> {
        self.sessions
            .iter()
            .find(|s| s.id == session_id)
            .map(|s| s.state)
    }

    pub fn live_sessions(&self) -> usize {
        self.sessions.iter().filter(|s| !s.state.is_terminal()).count()
    }
}

/// Cloneable handle onto the hub's inbound queue
#[derive(Debug, Clone)]
pub struct HubHandle {
    tx: mpsc::UnboundedSender<HubEvent>,
}

impl HubHandle {
    fn send(&self, event: HubEvent) -> Result<()> {
        self.tx
            .send(event)
            .map_err(|_| Error::HubUnavailable("hub task has stopped".to_string()))
    }

    /// Register a connection; the welcome is queued on it before this returns
    pub async fn connect(&self, connection: ConnectionHandle) -> Result<String> {
        let (reply, rx) = oneshot::channel();
        self.send(HubEvent::Connect { connection, reply })?;
        rx.await
            .map_err(|_| Error::HubUnavailable("hub dropped connect request".to_string()))?
    }

    pub fn frame(&self, peer_id: &str, text: String) -> Result<()> {
        self.send(HubEvent::Frame {
            peer_id: peer_id.to_string(),
            text,
        })
    }

    pub fn disconnect(&self, peer_id: &str) -> Result<()> {
        self.send(HubEvent::Disconnect {
            peer_id: peer_id.to_string(),
        })
    }

    pub fn pipeline_event(&self, peer_id: &str, event: PipelineEvent) -> Result<()> {
        self.send(HubEvent::Pipeline {
            peer_id: peer_id.to_string(),
            event,
        })
    }

    pub async fn snapshot(&self) -> Result<HubSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.send(HubEvent::Snapshot { reply })?;
        rx.await
            .map_err(|_| Error::HubUnavailable("hub dropped snapshot request".to_string()))
    }

    /// End every live session, then stop the hub.
    ///
    /// Returns once the resulting `endSession` envelopes have been queued.
    pub async fn shutdown(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(HubEvent::Shutdown { reply })?;
        rx.await
            .map_err(|_| Error::HubUnavailable("hub dropped shutdown request".to_string()))
    }
}

/// The state-owning task
pub struct Hub {
    router: MessageRouter,
    relay: RelayTransport,
    rx: mpsc::UnboundedReceiver<HubEvent>,
    max_peers: usize,
    negotiation_timeout: Option<Duration>,
    sweep_interval: Duration,
    terminal_retention: Duration,
}

impl Hub {
    pub fn new(config: &SignalingConfig) -> (Self, HubHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let hub = Self {
            router: MessageRouter::from_config(config),
            relay: RelayTransport::new(config.relay.mode, config.relay.send_timeout()),
            rx,
            max_peers: config.server.max_peers,
            negotiation_timeout: config.sessions.negotiation_timeout(),
            sweep_interval: config.sessions.sweep_interval(),
            terminal_retention: config.sessions.terminal_retention(),
        };
        (hub, HubHandle { tx })
    }

    /// Create a hub and run it on the current runtime
    pub fn spawn(config: &SignalingConfig) -> (HubHandle, JoinHandle<()>) {
        let (hub, handle) = Self::new(config);
        (handle, tokio::spawn(hub.run()))
    }

    /// Process events until shutdown or until every handle is dropped
    pub async fn run(mut self) {
        info!(
            mode = ?self.relay.mode(),
            max_peers = self.max_peers,
            negotiation_timeout = ?self.negotiation_timeout,
            "Signaling hub started"
        );

        let mut sweep = tokio::time::interval(self.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                event = self.rx.recv() => match event {
                    Some(event) => {
                        if !self.handle(event).await {
                            break;
                        }
                    }
                    None => {
                        self.shutdown().await;
                        break;
                    }
                },
                _ = sweep.tick() => self.sweep(Instant::now()).await,
            }
        }

        info!("Signaling hub stopped");
    }

    /// Returns `false` once the hub should stop
    async fn handle(&mut self, event: HubEvent) -> bool {
        match event {
            HubEvent::Connect { connection, reply } => {
                let result = self.connect(connection).await;
                let _ = reply.send(result);
            }
            HubEvent::Frame { peer_id, text } => {
                if !self.router.registry().contains(&peer_id) {
                    debug!(peer_id = %peer_id, "Dropping frame from unregistered peer");
                    return true;
                }
                let outbound = if self.relay.mode().is_broadcast() {
                    self.relay.broadcast(self.router.registry(), &peer_id, &text)
                } else {
                    self.router.route(&peer_id, &text)
                };
                self.deliver(outbound).await;
            }
            HubEvent::Disconnect { peer_id } => {
                let outbound = self.router.disconnect(&peer_id);
                self.deliver(outbound).await;
            }
            HubEvent::Pipeline { peer_id, event } => {
                let outbound = self.router.pipeline_event(&peer_id, event);
                self.deliver(outbound).await;
            }
            HubEvent::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            HubEvent::Shutdown { reply } => {
                self.shutdown().await;
                let _ = reply.send(());
                return false;
            }
        }
        true
    }

    async fn connect(&mut self, connection: ConnectionHandle) -> Result<String> {
        if self.router.registry().len() >= self.max_peers {
            warn!(
                remote = ?connection.remote_addr(),
                max_peers = self.max_peers,
                "Refusing connection: peer limit reached"
            );
            let refusal = Envelope::error(format!(
                "server is full ({} peers)",
                self.max_peers
            ));
            if let Ok(text) = refusal.to_json() {
                let _ = connection.sender().try_send(text);
            }
            return Err(Error::ConnectionRefused("peer limit reached".to_string()));
        }

        let (peer_id, welcome) = self.router.connect(connection);
        self.deliver(welcome).await;
        if self.router.registry().contains(&peer_id) {
            Ok(peer_id)
        } else {
            Err(Error::ConnectionRefused(format!(
                "connection for peer {} closed before welcome",
                peer_id
            )))
        }
    }

    /// Deliver outbound messages, reaping peers whose queues are gone.
    ///
    /// Reaping a peer ends its sessions, which may produce more messages; they
    /// join the same queue.
    async fn deliver(&mut self, outbound: Vec<Outbound>) {
        let mut queue: VecDeque<Outbound> = outbound.into();
        while let Some(message) = queue.pop_front() {
            match self.relay.deliver(self.router.registry(), message).await {
                Ok(()) => {}
                Err(SignalingError::PeerGone(peer_id)) => {
                    info!(peer_id = %peer_id, "Reaping unreachable peer");
                    queue.extend(self.router.disconnect(&peer_id));
                }
                Err(e) => warn!("Delivery failed: {}", e),
            }
        }
    }

    async fn sweep(&mut self, now: Instant) {
        if let Some(timeout) = self.negotiation_timeout {
            let outbound = self.router.expire_stale(now, timeout);
            if !outbound.is_empty() {
                self.deliver(outbound).await;
            }
        }
        let pruned = self.router.prune(now, self.terminal_retention);
        if pruned > 0 {
            debug!(pruned, "Pruned terminal sessions");
        }
    }

    async fn shutdown(&mut self) {
        let outbound = self.router.shutdown();
        info!(
            peers = self.router.registry().len(),
            notifications = outbound.len(),
            "Signaling hub shutting down"
        );
        self.deliver(outbound).await;
    }

    fn snapshot(&self) -> HubSnapshot {
        let registry = self.router.registry();
        let mut peers: Vec<PeerSnapshot> = registry
            .ids()
            .into_iter()
            .filter_map(|id| registry.lookup(&id).ok())
            .map(|peer| PeerSnapshot {
                id: peer.id.clone(),
                role: peer.role,
                connected_at: peer.connected_at,
            })
            .collect();
        peers.sort_by(|a, b| a.id.cmp(&b.id));

        let mut sessions: Vec<SessionSnapshot> = self
            .router
            .sessions()
            .iter()
            .map(|s| SessionSnapshot {
                id: s.id.clone(),
                producer_id: s.producer_id.clone(),
                consumer_id: s.consumer_id.clone(),
                state: s.state(),
                created_at: s.created_at,
            })
            .collect();
        sessions.sort_by(|a, b| a.id.cmp(&b.id));

        HubSnapshot {
            mode: self.relay.mode(),
            peers,
            sessions,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::SdpType;

    fn config() -> SignalingConfig {
        SignalingConfig::default()
    }

    async fn join(hub: &HubHandle) -> (String, mpsc::Receiver<String>) {
        let (tx, mut rx) = mpsc::channel(16);
        let id = hub.connect(ConnectionHandle::new(tx)).await.unwrap();
        assert_eq!(recv(&mut rx).await, Envelope::Welcome { peer_id: id.clone() });
        (id, rx)
    }

    async fn recv(rx: &mut mpsc::Receiver<String>) -> Envelope {
        let text = tokio::time::timeout(Duration::from_secs(60), rx.recv())
            .await
            .expect("timed out waiting for message")
            .expect("connection closed");
        serde_json::from_str(&text).unwrap()
    }

    fn start(session_id: &str, peer_id: &str, offer: Option<&str>) -> String {
        Envelope::StartSession {
            session_id: session_id.to_string(),
            peer_id: peer_id.to_string(),
            offer: offer.map(str::to_string),
        }
        .to_json()
        .unwrap()
    }

    #[tokio::test]
    async fn test_welcome_and_snapshot() {
        let before = Utc::now();
        let (hub, _task) = Hub::spawn(&config());
        let (a, _rx_a) = join(&hub).await;
        let (b, _rx_b) = join(&hub).await;

        let snapshot = hub.snapshot().await.unwrap();
        assert_eq!(snapshot.peer_count(), 2);
        assert_eq!(snapshot.peer_role(&a), Some(PeerRole::Unset));
        assert_eq!(snapshot.peer_role(&b), Some(PeerRole::Unset));
        assert_eq!(snapshot.mode, RelayMode::Addressed);
        assert!(snapshot
            .peers
            .iter()
            .all(|p| p.connected_at >= before && p.connected_at <= Utc::now()));
    }

    #[tokio::test]
    async fn test_addressed_negotiation() {
        let (hub, _task) = Hub::spawn(&config());
        let (a, mut rx_a) = join(&hub).await;
        let (b, mut rx_b) = join(&hub).await;

        hub.frame(&a, start("s1", &b, Some("offer"))).unwrap();
        assert_eq!(
            recv(&mut rx_a).await,
            Envelope::SessionStarted {
                session_id: "s1".to_string()
            }
        );
        assert_eq!(
            recv(&mut rx_b).await,
            Envelope::StartSession {
                session_id: "s1".to_string(),
                peer_id: a.clone(),
                offer: Some("offer".to_string()),
            }
        );

        let answer = Envelope::sdp("s1", SdpType::Answer, "answer");
        hub.frame(&b, answer.to_json().unwrap()).unwrap();
        assert_eq!(recv(&mut rx_a).await, answer);

        let snapshot = hub.snapshot().await.unwrap();
        assert_eq!(snapshot.session_state("s1"), Some(SessionState::Answered));
        let session = &snapshot.sessions[0];
        assert_eq!(session.producer_id, a);
        assert_eq!(session.consumer_id, b);
        assert!(session.created_at <= Utc::now());
    }

    #[tokio::test]
    async fn test_broadcast_mode_copies_frames_verbatim() {
        let mut config = config();
        config.relay.mode = RelayMode::Broadcast;
        let (hub, _task) = Hub::spawn(&config);
        let (a, mut rx_a) = join(&hub).await;
        let (_b, mut rx_b) = join(&hub).await;
        let (_c, mut rx_c) = join(&hub).await;

        let frame = r#"{"anything":"goes"}"#.to_string();
        hub.frame(&a, frame.clone()).unwrap();

        assert_eq!(rx_b.recv().await.unwrap(), frame);
        assert_eq!(rx_c.recv().await.unwrap(), frame);

        hub.snapshot().await.unwrap();
        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_disconnect_cascades() {
        let (hub, _task) = Hub::spawn(&config());
        let (a, mut rx_a) = join(&hub).await;
        let (b, mut rx_b) = join(&hub).await;

        hub.frame(&a, start("s1", &b, Some("offer"))).unwrap();
        recv(&mut rx_a).await;
        recv(&mut rx_b).await;

        hub.disconnect(&a).unwrap();
        assert_eq!(
            recv(&mut rx_b).await,
            Envelope::EndSession {
                session_id: "s1".to_string()
            }
        );

        let snapshot = hub.snapshot().await.unwrap();
        assert_eq!(snapshot.peer_count(), 1);
        assert_eq!(snapshot.session_state("s1"), Some(SessionState::Ended));
    }

    #[tokio::test]
    async fn test_unreachable_peer_is_reaped() {
        let (hub, _task) = Hub::spawn(&config());
        let (a, mut rx_a) = join(&hub).await;
        let (b, rx_b) = join(&hub).await;
        drop(rx_b);

        hub.frame(&a, start("s1", &b, Some("offer"))).unwrap();
        assert_eq!(
            recv(&mut rx_a).await,
            Envelope::SessionStarted {
                session_id: "s1".to_string()
            }
        );
        assert_eq!(
            recv(&mut rx_a).await,
            Envelope::EndSession {
                session_id: "s1".to_string()
            }
        );

        let snapshot = hub.snapshot().await.unwrap();
        assert_eq!(snapshot.peer_count(), 1);
        assert_eq!(snapshot.peer_role(&b), None);
    }

    #[tokio::test]
    async fn test_capacity_limit() {
        let mut config = config();
        config.server.max_peers = 1;
        let (hub, _task) = Hub::spawn(&config);
        let (_a, _rx_a) = join(&hub).await;

        let (tx, mut rx) = mpsc::channel(4);
        let result = hub.connect(ConnectionHandle::new(tx)).await;
        assert!(matches!(result, Err(Error::ConnectionRefused(_))));
        assert!(matches!(recv(&mut rx).await, Envelope::Error { .. }));
        assert_eq!(hub.snapshot().await.unwrap().peer_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_negotiation_timeout() {
        let mut config = config();
        config.sessions.negotiation_timeout_secs = 5;
        let (hub, _task) = Hub::spawn(&config);
        let (a, mut rx_a) = join(&hub).await;
        let (b, mut rx_b) = join(&hub).await;

        hub.frame(&a, start("s1", &b, Some("offer"))).unwrap();
        recv(&mut rx_a).await;
        recv(&mut rx_b).await;

        tokio::time::sleep(Duration::from_secs(7)).await;

        assert!(matches!(recv(&mut rx_a).await, Envelope::Error { .. }));
        assert!(matches!(recv(&mut rx_b).await, Envelope::Error { .. }));
        assert_eq!(
            hub.snapshot().await.unwrap().session_state("s1"),
            Some(SessionState::Errored)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_sessions_pruned() {
        let mut config = config();
        config.sessions.terminal_retention_secs = 10;
        let (hub, _task) = Hub::spawn(&config);
        let (a, mut rx_a) = join(&hub).await;
        let (b, mut rx_b) = join(&hub).await;

        hub.frame(&a, start("s1", &b, Some("offer"))).unwrap();
        recv(&mut rx_a).await;
        recv(&mut rx_b).await;
        hub.frame(&a, r#"{"type":"endSession","sessionId":"s1"}"#.to_string())
            .unwrap();
        recv(&mut rx_b).await;

        assert_eq!(
            hub.snapshot().await.unwrap().session_state("s1"),
            Some(SessionState::Ended)
        );
        tokio::time::sleep(Duration::from_secs(12)).await;
        assert_eq!(hub.snapshot().await.unwrap().session_state("s1"), None);
    }

    #[tokio::test]
    async fn test_shutdown_ends_sessions_and_stops() {
        let (hub, task) = Hub::spawn(&config());
        let (a, mut rx_a) = join(&hub).await;
        let (b, mut rx_b) = join(&hub).await;

        hub.frame(&a, start("s1", &b, Some("offer"))).unwrap();
        recv(&mut rx_a).await;
        recv(&mut rx_b).await;

        hub.shutdown().await.unwrap();
        task.await.unwrap();

        let end = Envelope::EndSession {
            session_id: "s1".to_string(),
        };
        assert_eq!(recv(&mut rx_a).await, end);
        assert_eq!(recv(&mut rx_b).await, end);
        // Registry dropped with the hub: queues are closed
        assert!(rx_a.recv().await.is_none());
        assert!(matches!(hub.snapshot().await, Err(Error::HubUnavailable(_))));
    }
}
