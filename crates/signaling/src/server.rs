//! WebSocket signaling server
//!
//! Accepts WebSocket connections and bridges each one to the signaling hub.
//! Every text frame becomes one envelope; the framing itself is left to
//! tungstenite.

use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::config::SignalingConfig;
use crate::hub::{Hub, HubHandle};
use crate::registry::ConnectionHandle;
use crate::{Error, Result};

/// WebSocket signaling server
pub struct SignalingServer {
    config: Arc<SignalingConfig>,
}

impl SignalingServer {
    /// Create a server from a validated configuration
    pub fn new(config: SignalingConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config: Arc::new(config),
        })
    }

    pub fn config(&self) -> &SignalingConfig {
        &self.config
    }

    /// Bind the listener, start the hub and the accept loop.
    ///
    /// Returns once the listener is bound.
    pub async fn start(self) -> Result<ServerHandle> {
        let bind_addr = self.config.bind_addr();
        let listener = TcpListener::bind(&bind_addr).await.map_err(|e| {
            error!("Failed to bind signaling server to {}: {}", bind_addr, e);
            Error::Io(e)
        })?;
        let local_addr = listener.local_addr()?;
        info!("Signaling server listening on ws://{}", local_addr);

        let (hub, hub_task) = Hub::spawn(&self.config);
        let (shutdown_tx, _) = broadcast::channel::<()>(1);
        let mut shutdown_rx = shutdown_tx.subscribe();

        let accept_hub = hub.clone();
        let outbound_queue = self.config.relay.outbound_queue;
        let accept_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => match result {
                        Ok((stream, peer_addr)) => {
                            debug!("Accepted TCP connection from {}", peer_addr);
                            let hub = accept_hub.clone();
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, hub, outbound_queue).await {
                                    warn!("WebSocket connection error from {}: {}", peer_addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                        }
                    },
                    _ = shutdown_rx.recv() => {
                        info!("Signaling server received shutdown signal");
                        break;
                    }
                }
            }
            info!("Signaling server accept loop exited");
        });

        Ok(ServerHandle {
            local_addr,
            hub,
            shutdown_tx,
            accept_task,
            hub_task,
        })
    }
}

/// Handle for a running server
pub struct ServerHandle {
    local_addr: SocketAddr,
    hub: HubHandle,
    shutdown_tx: broadcast::Sender<()>,
    accept_task: JoinHandle<()>,
    hub_task: JoinHandle<()>,
}

impl ServerHandle {
    /// Address the listener is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Handle onto the running hub
    pub fn hub(&self) -> HubHandle {
        self.hub.clone()
    }

    /// Stop accepting, end all live sessions and stop the hub.
    ///
    /// Open connections receive their pending `endSession` envelopes and are
    /// then closed.
    pub async fn shutdown(self) -> Result<()> {
        info!("Shutting down signaling server");
        let _ = self.shutdown_tx.send(());
        if let Err(e) = self.accept_task.await {
            error!("Accept loop task failed: {}", e);
        }

        self.hub.shutdown().await?;
        if let Err(e) = self.hub_task.await {
            error!("Hub task failed: {}", e);
        }
        info!("Signaling server shut down");
        Ok(())
    }
}

/// Serve a single WebSocket connection until either side closes it
pub async fn handle_connection(stream: TcpStream, hub: HubHandle, outbound_queue: usize) -> Result<()> {
    let addr = stream.peer_addr()?;
    let ws_stream = accept_async(stream).await?;
    info!("New WebSocket connection from: {}", addr);

    let (ws_tx, mut ws_rx) = ws_stream.split();
    let ws_tx = Arc::new(Mutex::new(ws_tx));

    // Outbound queue for this connection, drained by the forward task
    let (tx, mut rx) = mpsc::channel::<String>(outbound_queue);

    let peer_id = match hub
        .connect(ConnectionHandle::new(tx).with_remote_addr(addr))
        .await
    {
        Ok(peer_id) => peer_id,
        Err(Error::ConnectionRefused(reason)) => {
            info!("Refused connection from {}: {}", addr, reason);
            let mut ws_tx = ws_tx.lock().await;
            while let Some(text) = rx.recv().await {
                let _ = ws_tx.send(Message::Text(text)).await;
            }
            let _ = ws_tx.close().await;
            return Ok(());
        }
        Err(e) => return Err(e),
    };

    let writer = Arc::clone(&ws_tx);
    let forward_peer = peer_id.clone();
    let forward_task = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            let mut ws_tx = writer.lock().await;
            if let Err(e) = ws_tx.send(Message::Text(text)).await {
                warn!(peer_id = %forward_peer, "Failed to send WebSocket message: {}", e);
                break;
            }
        }
        // Queue closed: the hub dropped this peer
        let _ = writer.lock().await.close().await;
    });

    while let Some(msg) = ws_rx.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                if let Err(e) = hub.frame(&peer_id, text) {
                    warn!(peer_id = %peer_id, "Dropping connection: {}", e);
                    break;
                }
            }
            Ok(Message::Binary(_)) => {
                warn!(peer_id = %peer_id, "Ignoring binary frame");
            }
            Ok(Message::Ping(data)) => {
                let _ = ws_tx.lock().await.send(Message::Pong(data)).await;
            }
            Ok(Message::Close(_)) => {
                info!(peer_id = %peer_id, "WebSocket connection closed by client: {}", addr);
                break;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(peer_id = %peer_id, "WebSocket error: {}", e);
                break;
            }
        }
    }

    // Hub may already be gone during shutdown
    let _ = hub.disconnect(&peer_id);
    if let Err(e) = forward_task.await {
        error!(peer_id = %peer_id, "Forward task failed: {}", e);
    }
    debug!(peer_id = %peer_id, "Connection cleaned up");

    Ok(())
}
