//! A local pipeline negotiating with a remote consumer over WebSocket

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use sigrelay_signaling::{
    LocalProducer, PeerRole, PipelineAdapter, PipelineEvents, Result, SessionState,
    SignalingConfig, SignalingServer,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

/// Answers every offer request with a canned SDP
struct LoopbackPipeline {
    events: PipelineEvents,
    answers: Arc<Mutex<Vec<(String, String)>>>,
}

#[async_trait]
impl PipelineAdapter for LoopbackPipeline {
    async fn create_offer(&self, session_id: &str) -> Result<String> {
        Ok(format!("v=0 loopback {}", session_id))
    }

    async fn accept_answer(&self, session_id: &str, sdp: &str) {
        self.answers
            .lock()
            .await
            .push((session_id.to_string(), sdp.to_string()));
        let _ = self.events.media_started(session_id);
    }

    async fn add_ice_candidate(&self, _session_id: &str, _candidate: &str, _sdp_m_line_index: u32) {}

    async fn end_session(&self, _session_id: &str) {}
}

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn recv(client: &mut Client) -> Value {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), client.next())
            .await
            .expect("Timed out waiting for message")
            .expect("Connection closed")
            .expect("WebSocket error");
        if let Message::Text(text) = msg {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

#[tokio::test]
async fn test_consumer_negotiates_with_local_pipeline() {
    let mut config = SignalingConfig::default();
    config.server.host = "127.0.0.1".to_string();
    config.server.port = 0;
    let server = SignalingServer::new(config).unwrap().start().await.unwrap();
    let hub = server.hub();

    let answers = Arc::new(Mutex::new(Vec::new()));
    let recorded = Arc::clone(&answers);
    let producer = LocalProducer::attach(hub.clone(), json!({"name": "loopback"}), 32, move |events| {
        LoopbackPipeline {
            events,
            answers: recorded,
        }
    })
    .await
    .unwrap();
    let producer_id = producer.peer_id().to_string();

    // The producer announces itself once it has seen its welcome
    let mut announced = false;
    for _ in 0..100 {
        if hub.snapshot().await.unwrap().peer_role(&producer_id) == Some(PeerRole::Producer) {
            announced = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(announced, "local producer never announced its role");

    let (mut consumer, _) = connect_async(format!("ws://{}", server.local_addr()))
        .await
        .unwrap();
    assert_eq!(recv(&mut consumer).await["type"], "welcome");

    consumer
        .send(Message::Text(
            json!({"type": "startSession", "sessionId": "s1", "peerId": producer_id, "offer": null})
                .to_string(),
        ))
        .await
        .unwrap();

    assert_eq!(
        recv(&mut consumer).await,
        json!({"type": "sessionStarted", "sessionId": "s1"})
    );
    assert_eq!(
        recv(&mut consumer).await,
        json!({"type": "peer", "sessionId": "s1", "sdp": {"type": "offer", "sdp": "v=0 loopback s1"}})
    );

    consumer
        .send(Message::Text(
            json!({"type": "peer", "sessionId": "s1", "sdp": {"type": "answer", "sdp": "v=0 remote"}})
                .to_string(),
        ))
        .await
        .unwrap();

    producer
        .events()
        .ice_candidate("s1", "candidate:local", 0)
        .unwrap();
    assert_eq!(
        recv(&mut consumer).await,
        json!({"type": "peer", "sessionId": "s1", "ice": {"candidate": "candidate:local", "sdpMLineIndex": 0}})
    );

    let mut active = false;
    for _ in 0..100 {
        if hub.snapshot().await.unwrap().session_state("s1") == Some(SessionState::Active) {
            active = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(active, "session never became active");
    assert_eq!(
        answers.lock().await.clone(),
        vec![("s1".to_string(), "v=0 remote".to_string())]
    );

    producer.detach().await.unwrap();
    assert_eq!(
        recv(&mut consumer).await,
        json!({"type": "endSession", "sessionId": "s1"})
    );

    server.shutdown().await.unwrap();
}
