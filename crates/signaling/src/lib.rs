//! WebRTC signaling protocol engine
//!
//! Mediates WebRTC session negotiation between media producers and consumers
//! over persistent WebSocket connections. Media itself never passes through
//! this crate; a media pipeline is an external collaborator reached through
//! [`PipelineAdapter`].
//!
//! # Features
//!
//! - **Peer registry**: ids assigned on connect, roles declared with `setPeerStatus`
//! - **Session state machine**: offer → answer → ICE trickle → end, with
//!   idempotent teardown and a negotiation timeout
//! - **Addressed or broadcast relay**: route by session state, or copy frames
//!   to every other peer
//! - **Local producer bridge**: attach an in-process pipeline as a peer
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │  WebSocket peers                                     │
//! │  ↓ (one task per connection)                         │
//! │  HubHandle ──► single ordered queue                  │
//! │                 ↓                                    │
//! │  Hub (owns all state)                                │
//! │  ├─ MessageRouter                                    │
//! │  │   ├─ PeerRegistry                                 │
//! │  │   └─ SessionManager                               │
//! │  └─ RelayTransport ──► per-connection queues         │
//! │                                                      │
//! │  LocalProducer ◄──► PipelineAdapter (media engine)   │
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```
//! use sigrelay_signaling::SignalingConfig;
//!
//! let config = SignalingConfig::from_toml_str(
//!     r#"
//!     [server]
//!     port = 9000
//!
//!     [sessions]
//!     negotiation_timeout_secs = 10
//!     "#,
//! )
//! .unwrap();
//!
//! assert_eq!(config.server.port, 9000);
//! assert!(config.validate().is_ok());
//! ```
//!
//! ## Async Usage
//!
//! ```no_run
//! use sigrelay_signaling::{SignalingConfig, SignalingServer};
//!
//! # async fn example() -> sigrelay_signaling::Result<()> {
//! let server = SignalingServer::new(SignalingConfig::default())?;
//! let handle = server.start().await?;
//! println!("listening on {}", handle.local_addr());
//!
//! handle.shutdown().await?;
//! # Ok(())
//! # }
//! ```

#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod hub;
pub mod pipeline;
pub mod protocol;
pub mod registry;
pub mod relay;
pub mod router;
pub mod server;
pub mod session;

pub use config::{PeerIdFormat, SignalingConfig};
pub use error::{Error, ErrorKind, Result, SignalingError};
pub use hub::{Hub, HubHandle, HubSnapshot};
pub use pipeline::{LocalProducer, PipelineAdapter, PipelineEvent, PipelineEvents};
pub use protocol::{Envelope, PeerPayload, SdpType};
pub use registry::{ConnectionHandle, Peer, PeerRegistry, PeerRole};
pub use relay::{Outbound, RelayMode, RelayTransport};
pub use router::MessageRouter;
pub use server::{ServerHandle, SignalingServer};
pub use session::{EndReason, IcePolicy, Session, SessionManager, SessionState};

/// Get the version of this crate
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
