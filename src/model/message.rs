//! Signaling wire protocol
//!
//! JSON objects over WebSocket frames, dispatched on an explicit `type` field.
//! Untyped messages in the style of `{"offer": {...}}` are still understood and
//! dispatched on the single payload key they carry.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::MessageError;

/// Longest session id the relay accepts.
pub const MAX_SESSION_ID_LEN: usize = 128;

const PAYLOAD_KEYS: [&str; 3] = ["offer", "answer", "candidate"];

/// The `type` of a [`SessionDescription`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

impl SdpKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SdpKind::Offer => "offer",
            SdpKind::Answer => "answer",
        }
    }
}

/// An SDP blob in the shape browsers produce for `RTCSessionDescription`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }

    fn validate(&self, expected: SdpKind) -> Result<(), MessageError> {
        if self.kind != expected {
            return Err(MessageError::DescriptionMismatch {
                expected: expected.as_str(),
                carried: self.kind.as_str(),
            });
        }
        if self.sdp.trim().is_empty() {
            return Err(MessageError::EmptySdp);
        }
        Ok(())
    }
}

/// An ICE candidate in the shape of `RTCIceCandidateInit`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_m_line_index: Option<u16>,
    #[serde(
        rename = "usernameFragment",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_m_line_index: None,
            username_fragment: None,
        }
    }
}

/// Machine readable reason carried by [`SignalingMessage::Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCode {
    SessionFull,
    NoSession,
    InvalidMessage,
}

/// Every message exchanged between the relay and its endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalingMessage {
    Join {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    Leave,
    Offer {
        #[serde(rename = "sessionId", default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        offer: SessionDescription,
        #[serde(rename = "iceRestart", default, skip_serializing_if = "is_false")]
        ice_restart: bool,
    },
    Answer {
        #[serde(rename = "sessionId", default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        answer: SessionDescription,
    },
    Candidate {
        #[serde(rename = "sessionId", default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        candidate: IceCandidate,
    },

    // Sent by the relay only.
    Joined {
        #[serde(rename = "sessionId")]
        session_id: String,
        members: usize,
    },
    PeerJoined,
    PeerLeft,
    Error {
        code: ErrorCode,
        reason: String,
    },
}

fn is_false(v: &bool) -> bool {
    !*v
}

impl SignalingMessage {
    /// Parses and validates one JSON text.
    pub fn parse(text: &str) -> Result<SignalingMessage, MessageError> {
        let value: Value = serde_json::from_str(text)?;

        let message = match value {
            Value::Object(map) if !map.contains_key("type") => Self::from_untyped(map)?,
            value => serde_json::from_value(value)?,
        };

        message.validate()?;
        Ok(message)
    }

    /// Parses a binary frame holding UTF-8 JSON.
    pub fn parse_bytes(bytes: &[u8]) -> Result<SignalingMessage, MessageError> {
        let text = std::str::from_utf8(bytes).map_err(|_| MessageError::NotUtf8)?;
        Self::parse(text)
    }

    /// Serializes to the compact JSON form sent on the wire.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Session id carried by the message, if any.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            SignalingMessage::Join { session_id } | SignalingMessage::Joined { session_id, .. } => {
                Some(session_id.as_str())
            }
            SignalingMessage::Offer { session_id, .. }
            | SignalingMessage::Answer { session_id, .. }
            | SignalingMessage::Candidate { session_id, .. } => session_id.as_deref(),
            _ => None,
        }
    }

    /// Offer, answer and candidate messages are forwarded to the other session member.
    pub fn is_relayed(&self) -> bool {
        matches!(
            self,
            SignalingMessage::Offer { .. }
                | SignalingMessage::Answer { .. }
                | SignalingMessage::Candidate { .. }
        )
    }

    /// Short name used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            SignalingMessage::Join { .. } => "join",
            SignalingMessage::Leave => "leave",
            SignalingMessage::Offer { .. } => "offer",
            SignalingMessage::Answer { .. } => "answer",
            SignalingMessage::Candidate { .. } => "candidate",
            SignalingMessage::Joined { .. } => "joined",
            SignalingMessage::PeerJoined => "peer-joined",
            SignalingMessage::PeerLeft => "peer-left",
            SignalingMessage::Error { .. } => "error",
        }
    }

    // Older clients send `{ offer }`, `{ answer }` or `{ candidate }` without a
    // `type`; exactly one of those keys must be present.
    fn from_untyped(map: Map<String, Value>) -> Result<SignalingMessage, MessageError> {
        let mut present = PAYLOAD_KEYS.iter().filter(|k| map.contains_key(**k));
        let Some(key) = present.next() else {
            return Err(MessageError::MissingPayload);
        };
        if present.next().is_some() {
            return Err(MessageError::AmbiguousPayload);
        }

        let session_id = match map.get("sessionId") {
            Some(v) => Some(serde_json::from_value::<String>(v.clone())?),
            None => None,
        };
        let payload = map.get(*key).cloned().unwrap_or(Value::Null);

        let message = match *key {
            "offer" => SignalingMessage::Offer {
                session_id,
                offer: serde_json::from_value(payload)?,
                ice_restart: false,
            },
            "answer" => SignalingMessage::Answer {
                session_id,
                answer: serde_json::from_value(payload)?,
            },
            _ => SignalingMessage::Candidate {
                session_id,
                candidate: serde_json::from_value(payload)?,
            },
        };

        Ok(message)
    }

    fn validate(&self) -> Result<(), MessageError> {
        if let Some(id) = self.session_id() {
            if id.trim().is_empty() {
                return Err(MessageError::EmptySessionId);
            }
            if id.chars().count() > MAX_SESSION_ID_LEN {
                return Err(MessageError::SessionIdTooLong {
                    max: MAX_SESSION_ID_LEN,
                });
            }
        }

        match self {
            SignalingMessage::Offer { offer, .. } => offer.validate(SdpKind::Offer),
            SignalingMessage::Answer { answer, .. } => answer.validate(SdpKind::Answer),
            SignalingMessage::Candidate { candidate, .. } => {
                if candidate.candidate.trim().is_empty() {
                    Err(MessageError::EmptyCandidate)
                } else {
                    Ok(())
                }
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_typed_join() {
        let msg = SignalingMessage::parse(r#"{"type":"join","sessionId":"room1"}"#).unwrap();
        assert_eq!(
            msg,
            SignalingMessage::Join {
                session_id: "room1".into()
            }
        );
        assert!(!msg.is_relayed());
    }

    #[test]
    fn parses_typed_offer_with_session() {
        let text = r#"{"type":"offer","sessionId":"room1","offer":{"type":"offer","sdp":"v=0"}}"#;
        let msg = SignalingMessage::parse(text).unwrap();
        assert_eq!(msg.session_id(), Some("room1"));
        assert!(msg.is_relayed());
        let SignalingMessage::Offer { ice_restart, .. } = msg else {
            panic!("expected offer");
        };
        assert!(!ice_restart);
    }

    #[test]
    fn parses_untyped_browser_messages() {
        let offer = SignalingMessage::parse(r#"{"offer":{"type":"offer","sdp":"v=0"}}"#).unwrap();
        assert_eq!(offer.kind(), "offer");

        let cand = SignalingMessage::parse(
            r#"{"candidate":{"candidate":"candidate:1 1 udp 2122260223 10.0.0.2 5000 typ host","sdpMid":"0","sdpMLineIndex":0}}"#,
        )
        .unwrap();
        let SignalingMessage::Candidate { candidate, .. } = cand else {
            panic!("expected candidate");
        };
        assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
        assert_eq!(candidate.sdp_m_line_index, Some(0));
    }

    #[test]
    fn untyped_without_payload_is_rejected() {
        let err = SignalingMessage::parse(r#"{"sessionId":"x"}"#).unwrap_err();
        assert!(matches!(err, MessageError::MissingPayload));
    }

    #[test]
    fn untyped_with_two_payloads_is_rejected() {
        let text = r#"{"offer":{"type":"offer","sdp":"v=0"},"answer":{"type":"answer","sdp":"v=0"}}"#;
        let err = SignalingMessage::parse(text).unwrap_err();
        assert!(matches!(err, MessageError::AmbiguousPayload));
    }

    #[test]
    fn answer_carrying_offer_description_is_rejected() {
        let text = r#"{"type":"answer","answer":{"type":"offer","sdp":"v=0"}}"#;
        let err = SignalingMessage::parse(text).unwrap_err();
        assert!(matches!(
            err,
            MessageError::DescriptionMismatch {
                expected: "answer",
                carried: "offer"
            }
        ));
    }

    #[test]
    fn empty_values_are_rejected() {
        assert!(matches!(
            SignalingMessage::parse(r#"{"type":"join","sessionId":"  "}"#),
            Err(MessageError::EmptySessionId)
        ));
        assert!(matches!(
            SignalingMessage::parse(r#"{"type":"offer","offer":{"type":"offer","sdp":""}}"#),
            Err(MessageError::EmptySdp)
        ));
        assert!(matches!(
            SignalingMessage::parse(r#"{"type":"candidate","candidate":{"candidate":""}}"#),
            Err(MessageError::EmptyCandidate)
        ));
    }

    #[test]
    fn overlong_session_id_is_rejected() {
        let id = "x".repeat(MAX_SESSION_ID_LEN + 1);
        let text = format!(r#"{{"type":"join","sessionId":"{id}"}}"#);
        assert!(matches!(
            SignalingMessage::parse(&text),
            Err(MessageError::SessionIdTooLong { .. })
        ));
    }

    #[test]
    fn unknown_type_is_rejected() {
        assert!(matches!(
            SignalingMessage::parse(r#"{"type":"dance"}"#),
            Err(MessageError::Json(_))
        ));
    }

    #[test]
    fn binary_frames_must_be_utf8() {
        assert!(matches!(
            SignalingMessage::parse_bytes(&[0xff, 0xfe]),
            Err(MessageError::NotUtf8)
        ));
        let msg = SignalingMessage::parse_bytes(br#"{"type":"leave"}"#).unwrap();
        assert_eq!(msg, SignalingMessage::Leave);
    }

    #[test]
    fn relay_notices_serialize_with_kebab_case_type() {
        let json = SignalingMessage::PeerLeft.to_json().unwrap();
        assert_eq!(json, r#"{"type":"peer-left"}"#);

        let json = SignalingMessage::Error {
            code: ErrorCode::SessionFull,
            reason: "full".into(),
        }
        .to_json()
        .unwrap();
        assert_eq!(json, r#"{"type":"error","code":"session-full","reason":"full"}"#);
    }

    #[test]
    fn ice_restart_flag_only_serialized_when_set() {
        let plain = SignalingMessage::Offer {
            session_id: None,
            offer: SessionDescription::offer("v=0"),
            ice_restart: false,
        };
        assert!(!plain.to_json().unwrap().contains("iceRestart"));

        let restart = SignalingMessage::Offer {
            session_id: Some("room1".into()),
            offer: SessionDescription::offer("v=0"),
            ice_restart: true,
        };
        let json = restart.to_json().unwrap();
        assert!(json.contains(r#""iceRestart":true"#));
        assert_eq!(SignalingMessage::parse(&json).unwrap(), restart);
    }
}
