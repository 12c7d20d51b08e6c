//! JSON envelope protocol
//!
//! Every frame on the message channel is a JSON object tagged by `type`:
//!
//! ```text
//! {"type":"welcome","peerId":"1"}
//! {"type":"setPeerStatus","roles":["producer"],"meta":{}}
//! {"type":"startSession","sessionId":"s1","peerId":"2","offer":"v=0..."}
//! {"type":"sessionStarted","sessionId":"s1"}
//! {"type":"endSession","sessionId":"s1"}
//! {"type":"peer","sessionId":"s1","sdp":{"type":"answer","sdp":"v=0..."}}
//! {"type":"peer","sessionId":"s1","ice":{"candidate":"...","sdpMLineIndex":0}}
//! {"type":"error","details":"..."}
//! ```

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::SignalingError;

/// A signaling envelope.
///
/// Envelopes are never mutated after construction; routing always builds a
/// fresh one for the outbound side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Envelope {
    /// Identity assignment, sent once right after registration
    #[serde(rename_all = "camelCase")]
    Welcome { peer_id: String },

    /// Role and metadata declaration
    SetPeerStatus { roles: Vec<String>, meta: Value },

    /// Session request; `peerId` names the counterpart
    #[serde(rename_all = "camelCase")]
    StartSession {
        session_id: String,
        peer_id: String,
        #[serde(deserialize_with = "required_nullable")]
        offer: Option<String>,
    },

    /// Acknowledgment of a successful `startSession`
    #[serde(rename_all = "camelCase")]
    SessionStarted { session_id: String },

    /// Session teardown
    #[serde(rename_all = "camelCase")]
    EndSession { session_id: String },

    /// SDP or ICE exchange within a session
    #[serde(rename_all = "camelCase")]
    Peer {
        session_id: String,
        #[serde(flatten)]
        payload: PeerPayload,
    },

    /// Error report
    Error { details: String },
}

/// Payload of a `peer` envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PeerPayload {
    Sdp(SdpPayload),
    Ice(IcePayload),
}

/// Session description
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SdpPayload {
    #[serde(rename = "type")]
    pub kind: SdpType,
    pub sdp: String,
}

/// Direction of a session description
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

/// Trickled ICE candidate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IcePayload {
    pub candidate: String,
    #[serde(rename = "sdpMLineIndex")]
    pub sdp_m_line_index: u32,
}

/// `offer` must be present but may be `null`
fn required_nullable<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<String>::deserialize(deserializer)
}

const KNOWN_TYPES: &[&str] = &[
    "welcome",
    "setPeerStatus",
    "startSession",
    "sessionStarted",
    "endSession",
    "peer",
    "error",
];

/// Result of parsing one inbound frame
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Well-formed envelope of a known type
    Envelope(Envelope),
    /// Well-formed JSON with an unrecognized `type`; logged and ignored
    Unknown(String),
}

/// Parse and validate one inbound frame
pub fn parse_inbound(text: &str) -> Result<Inbound, SignalingError> {
    let value: Value = serde_json::from_str(text)
        .map_err(|e| SignalingError::validation(format!("malformed JSON: {}", e)))?;

    let Some(object) = value.as_object() else {
        return Err(SignalingError::validation("message must be a JSON object"));
    };

    let kind = match object.get("type") {
        Some(Value::String(kind)) => kind.clone(),
        Some(_) => return Err(SignalingError::validation("field `type` must be a string")),
        None => return Err(SignalingError::validation("missing field `type`")),
    };

    if !KNOWN_TYPES.contains(&kind.as_str()) {
        return Ok(Inbound::Unknown(kind));
    }

    if kind == "peer" {
        match (object.contains_key("sdp"), object.contains_key("ice")) {
            (false, false) => {
                return Err(SignalingError::validation(
                    "peer message requires an `sdp` or `ice` payload",
                ))
            }
            (true, true) => {
                return Err(SignalingError::validation(
                    "peer message carries both `sdp` and `ice`",
                ))
            }
            _ => {}
        }
    }

    serde_json::from_value(value)
        .map(Inbound::Envelope)
        .map_err(|e| SignalingError::validation(format!("invalid {} message: {}", kind, e)))
}

impl Envelope {
    /// Build an `error` envelope
    pub fn error(details: impl Into<String>) -> Self {
        Envelope::Error {
            details: details.into(),
        }
    }

    /// Build an SDP `peer` envelope
    pub fn sdp(session_id: impl Into<String>, kind: SdpType, sdp: impl Into<String>) -> Self {
        Envelope::Peer {
            session_id: session_id.into(),
            payload: PeerPayload::Sdp(SdpPayload {
                kind,
                sdp: sdp.into(),
            }),
        }
    }

    /// Build an ICE `peer` envelope
    pub fn ice(
        session_id: impl Into<String>,
        candidate: impl Into<String>,
        sdp_m_line_index: u32,
    ) -> Self {
        Envelope::Peer {
            session_id: session_id.into(),
            payload: PeerPayload::Ice(IcePayload {
                candidate: candidate.into(),
                sdp_m_line_index,
            }),
        }
    }

    /// Wire name of this envelope's type
    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::Welcome { .. } => "welcome",
            Envelope::SetPeerStatus { .. } => "setPeerStatus",
            Envelope::StartSession { .. } => "startSession",
            Envelope::SessionStarted { .. } => "sessionStarted",
            Envelope::EndSession { .. } => "endSession",
            Envelope::Peer { .. } => "peer",
            Envelope::Error { .. } => "error",
        }
    }

    /// Session this envelope refers to, if any
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Envelope::StartSession { session_id, .. }
            | Envelope::SessionStarted { session_id }
            | Envelope::EndSession { session_id }
            | Envelope::Peer { session_id, .. } => Some(session_id),
            _ => None,
        }
    }

    /// Serialize to a JSON frame
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn envelope(text: &str) -> Envelope {
        match parse_inbound(text).unwrap() {
            Inbound::Envelope(envelope) => envelope,
            other => panic!("Expected envelope, got {:?}", other),
        }
    }

    #[test]
    fn test_welcome_wire_format() {
        let welcome = Envelope::Welcome {
            peer_id: "1".to_string(),
        };
        assert_eq!(welcome.to_json().unwrap(), r#"{"type":"welcome","peerId":"1"}"#);
    }

    #[test]
    fn test_parse_start_session() {
        let parsed =
            envelope(r#"{"type":"startSession","sessionId":"s1","peerId":"2","offer":"v=0"}"#);
        assert_eq!(
            parsed,
            Envelope::StartSession {
                session_id: "s1".to_string(),
                peer_id: "2".to_string(),
                offer: Some("v=0".to_string()),
            }
        );

        let parsed = envelope(r#"{"type":"startSession","sessionId":"s1","peerId":"2","offer":null}"#);
        assert!(matches!(parsed, Envelope::StartSession { offer: None, .. }));
    }

    #[test]
    fn test_start_session_requires_offer_field() {
        let err = parse_inbound(r#"{"type":"startSession","sessionId":"s1","peerId":"2"}"#)
            .unwrap_err();
        assert!(err.to_string().contains("offer"), "{}", err);
    }

    #[test]
    fn test_parse_peer_payloads() {
        let answer =
            envelope(r#"{"type":"peer","sessionId":"s1","sdp":{"type":"answer","sdp":"v=0"}}"#);
        assert_eq!(answer, Envelope::sdp("s1", SdpType::Answer, "v=0"));

        let ice = envelope(
            r#"{"type":"peer","sessionId":"s1","ice":{"candidate":"candidate:1","sdpMLineIndex":0}}"#,
        );
        assert_eq!(ice, Envelope::ice("s1", "candidate:1", 0));
    }

    #[test]
    fn test_peer_wire_format() {
        let value: Value =
            serde_json::from_str(&Envelope::ice("s1", "c", 1).to_json().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({"type":"peer","sessionId":"s1","ice":{"candidate":"c","sdpMLineIndex":1}})
        );

        let value: Value =
            serde_json::from_str(&Envelope::sdp("s1", SdpType::Offer, "v=0").to_json().unwrap())
                .unwrap();
        assert_eq!(
            value,
            json!({"type":"peer","sessionId":"s1","sdp":{"type":"offer","sdp":"v=0"}})
        );
    }

    #[test]
    fn test_validation_errors() {
        let cases = [
            "not json",
            "[1,2,3]",
            r#"{"sessionId":"s1"}"#,
            r#"{"type":5}"#,
            r#"{"type":"peer","sessionId":"s1"}"#,
            r#"{"type":"peer","sessionId":"s1","sdp":{"type":"pranswer","sdp":"x"}}"#,
            r#"{"type":"peer","sessionId":"s1","ice":{"candidate":"c"}}"#,
            r#"{"type":"peer","sessionId":"s1","ice":{"candidate":"c","sdpMLineIndex":-1}}"#,
            r#"{"type":"endSession"}"#,
            r#"{"type":"setPeerStatus","roles":["producer"]}"#,
            r#"{"type":"error"}"#,
        ];

        for case in cases {
            let err = parse_inbound(case).unwrap_err();
            assert!(
                matches!(err, SignalingError::Validation(_)),
                "{} -> {:?}",
                case,
                err
            );
        }
    }

    #[test]
    fn test_peer_with_both_payloads_rejected() {
        for case in [
            r#"{"type":"peer","sessionId":"s1","sdp":{"type":"answer","sdp":"a"},"ice":{"candidate":"c","sdpMLineIndex":0}}"#,
            r#"{"type":"peer","sessionId":"s1","ice":{"candidate":"c","sdpMLineIndex":0},"sdp":{"type":"answer","sdp":"a"}}"#,
        ] {
            let err = parse_inbound(case).unwrap_err();
            assert!(matches!(err, SignalingError::Validation(_)), "{:?}", err);
            assert!(err.to_string().contains("both"), "{}", err);
        }
    }

    #[test]
    fn test_unknown_type_is_not_an_error() {
        assert_eq!(
            parse_inbound(r#"{"type":"list"}"#).unwrap(),
            Inbound::Unknown("list".to_string())
        );
    }

    #[test]
    fn test_set_peer_status_accepts_null_meta() {
        let parsed = envelope(r#"{"type":"setPeerStatus","roles":["producer"],"meta":null}"#);
        assert_eq!(
            parsed,
            Envelope::SetPeerStatus {
                roles: vec!["producer".to_string()],
                meta: Value::Null,
            }
        );
    }

    #[test]
    fn test_envelope_accessors() {
        let end = Envelope::EndSession {
            session_id: "s9".to_string(),
        };
        assert_eq!(end.kind(), "endSession");
        assert_eq!(end.session_id(), Some("s9"));
        assert_eq!(Envelope::error("boom").session_id(), None);
    }
}
