// fb-protocol: gateway wire protocol types and serialization.
//
// All WebSocket frames are JSON objects with an integer `type` tag; the
// remaining fields are optional and camelCase.  The tag values are frozen —
// devices in the field depend on them.

use chrono::{DateTime, Utc};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

// ---------------------------------------------------------------------------
// Frame type tag
// ---------------------------------------------------------------------------

/// The frozen integer tag carried in the wire `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameType {
    Publish,
    Subscribe,
    Unsubscribe,
    Delivered,
    Request,
    Reply,
    Ack,
    Error,
    Auth,
    Ping,
    Pong,
}

impl FrameType {
    pub fn as_u8(self) -> u8 {
        match self {
            FrameType::Publish => 0,
            FrameType::Subscribe => 1,
            FrameType::Unsubscribe => 2,
            FrameType::Delivered => 3,
            FrameType::Request => 4,
            FrameType::Reply => 5,
            FrameType::Ack => 6,
            FrameType::Error => 7,
            FrameType::Auth => 8,
            FrameType::Ping => 9,
            FrameType::Pong => 10,
        }
    }

    pub fn from_u8(tag: u8) -> Option<Self> {
        Some(match tag {
            0 => FrameType::Publish,
            1 => FrameType::Subscribe,
            2 => FrameType::Unsubscribe,
            3 => FrameType::Delivered,
            4 => FrameType::Request,
            5 => FrameType::Reply,
            6 => FrameType::Ack,
            7 => FrameType::Error,
            8 => FrameType::Auth,
            9 => FrameType::Ping,
            10 => FrameType::Pong,
            _ => return None,
        })
    }

    /// Subject-less frame kinds (exempt from subject validation).
    pub fn subject_exempt(self) -> bool {
        matches!(self, FrameType::Ping | FrameType::Pong | FrameType::Auth)
    }
}

impl Serialize for FrameType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.as_u8())
    }
}

impl<'de> Deserialize<'de> for FrameType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let tag = u8::deserialize(deserializer)?;
        FrameType::from_u8(tag)
            .ok_or_else(|| D::Error::custom(format!("unknown frame type tag {tag}")))
    }
}

// ---------------------------------------------------------------------------
// Frame
// ---------------------------------------------------------------------------

/// One wire frame.
///
/// Which optional fields must be present depends on the tag: PUBLISH,
/// SUBSCRIBE and UNSUBSCRIBE require `subject`; PING/PONG/AUTH carry none.
/// `device_id` is stamped by the server on inbound PUBLISH frames and is
/// never trusted from the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Frame {
    #[serde(rename = "type")]
    pub frame_type: FrameType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
}

impl Frame {
    fn bare(frame_type: FrameType) -> Self {
        Frame {
            frame_type,
            subject: None,
            payload: None,
            correlation_id: None,
            timestamp: None,
            device_id: None,
        }
    }

    pub fn publish(subject: impl Into<String>, payload: serde_json::Value) -> Self {
        Frame {
            subject: Some(subject.into()),
            payload: Some(payload),
            ..Frame::bare(FrameType::Publish)
        }
    }

    pub fn subscribe(subject: impl Into<String>) -> Self {
        Frame {
            subject: Some(subject.into()),
            ..Frame::bare(FrameType::Subscribe)
        }
    }

    pub fn unsubscribe(subject: impl Into<String>) -> Self {
        Frame {
            subject: Some(subject.into()),
            ..Frame::bare(FrameType::Unsubscribe)
        }
    }

    pub fn delivered(subject: impl Into<String>, payload: serde_json::Value) -> Self {
        Frame {
            subject: Some(subject.into()),
            payload: Some(payload),
            timestamp: Some(Utc::now()),
            ..Frame::bare(FrameType::Delivered)
        }
    }

    pub fn auth(token: impl Into<String>) -> Self {
        Frame {
            payload: Some(serde_json::json!({ "token": token.into() })),
            ..Frame::bare(FrameType::Auth)
        }
    }

    pub fn auth_ok(client_id: &str, role: &str) -> Self {
        Frame {
            payload: Some(serde_json::json!({
                "success": true,
                "clientId": client_id,
                "role": role,
            })),
            ..Frame::bare(FrameType::Auth)
        }
    }

    pub fn auth_failed(error: &str) -> Self {
        Frame {
            payload: Some(serde_json::json!({ "success": false, "error": error })),
            ..Frame::bare(FrameType::Auth)
        }
    }

    pub fn ack(correlation_id: Option<String>, payload: Option<serde_json::Value>) -> Self {
        Frame {
            correlation_id,
            payload,
            ..Frame::bare(FrameType::Ack)
        }
    }

    /// ERROR frame with the `{error, code}` payload contract.
    pub fn error(code: &str, message: &str) -> Self {
        Frame {
            payload: Some(serde_json::json!({ "error": message, "code": code })),
            ..Frame::bare(FrameType::Error)
        }
    }

    pub fn ping() -> Self {
        Frame::bare(FrameType::Ping)
    }

    pub fn pong() -> Self {
        Frame::bare(FrameType::Pong)
    }

    /// The machine-readable `code` of an ERROR frame, if present.
    pub fn error_code(&self) -> Option<&str> {
        self.payload.as_ref()?.get("code")?.as_str()
    }
}

// ---------------------------------------------------------------------------
// Error codes and close codes
// ---------------------------------------------------------------------------

/// Frozen short error kinds carried in ERROR frame payloads.
pub mod error_codes {
    pub const MALFORMED_FRAME: &str = "malformed_frame";
    pub const INVALID_SUBJECT: &str = "invalid_subject";
    pub const PAYLOAD_TOO_LARGE: &str = "payload_too_large";
    pub const TOKEN_REQUIRED: &str = "token_required";
    pub const TOKEN_INVALID: &str = "token_invalid";
    pub const TOKEN_EXPIRED: &str = "token_expired";
    pub const AUTH_TIMEOUT: &str = "auth_timeout";
    pub const NOT_AUTHORIZED: &str = "not_authorized";
    pub const RATE_LIMITED: &str = "rate_limited";
    pub const NO_STREAM_FOR_SUBJECT: &str = "no_stream_for_subject";
    pub const BUS_UNAVAILABLE: &str = "bus_unavailable";
    pub const PUBLISH_FAILED: &str = "publish_failed";
    pub const INVALID_MESSAGE_TYPE: &str = "invalid_message_type";
    pub const INTERNAL_ERROR: &str = "internal_error";
}

/// WebSocket close codes used at teardown.
pub mod close_codes {
    /// Normal closure (drain complete, eviction by a newer session).
    pub const NORMAL: u16 = 1000;
    /// Policy violation (auth/authz failure, token expiry).
    pub const POLICY: u16 = 1008;
    /// Internal server error.
    pub const INTERNAL: u16 = 1011;
}

// ---------------------------------------------------------------------------
// Replay options (SUBSCRIBE-time)
// ---------------------------------------------------------------------------

/// Where a new subscription starts reading the stream.
///
/// Carried in the SUBSCRIBE frame payload as `{"replay": {"mode": ..., ...}}`.
/// Omitted replay options mean `new`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ReplayMode {
    All,
    New,
    Last,
    LastPerSubject,
    FromSequence { sequence: u64 },
    FromTime { time: DateTime<Utc> },
    ResumeFromLastAck,
}

impl Default for ReplayMode {
    fn default() -> Self {
        ReplayMode::New
    }
}

/// SUBSCRIBE frame payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubscribePayload {
    #[serde(default)]
    pub replay: Option<ReplayMode>,
}

// ---------------------------------------------------------------------------
// Admin / HTTP response types
// ---------------------------------------------------------------------------

/// One entry in the `GET /devices` response array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    pub client_id: String,
    pub role: String,
    pub connected_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// One entry in the `GET /streams` response array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamSummary {
    pub name: String,
    pub subjects: Vec<String>,
    pub messages: u64,
    pub first_sequence: u64,
    pub last_sequence: u64,
}

/// Frozen HTTP error envelope used by all non-2xx admin responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpErrorEnvelope {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_type_round_trips_all_tags() {
        for tag in 0..=10u8 {
            let ft = FrameType::from_u8(tag).expect("tag in range");
            assert_eq!(ft.as_u8(), tag);
        }
        assert!(FrameType::from_u8(11).is_none());
    }

    #[test]
    fn publish_frame_serializes_with_integer_tag_and_camel_case() {
        let frame = Frame {
            correlation_id: Some("corr-1".to_owned()),
            ..Frame::publish("telemetry.sensor-001.temp", serde_json::json!({"value": 23.5}))
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], 0);
        assert_eq!(json["subject"], "telemetry.sensor-001.temp");
        assert_eq!(json["correlationId"], "corr-1");
        assert!(json.get("deviceId").is_none(), "absent fields are omitted");
    }

    #[test]
    fn frame_with_unknown_tag_fails_to_parse() {
        let err = serde_json::from_str::<Frame>(r#"{"type": 42}"#).unwrap_err();
        assert!(err.to_string().contains("unknown frame type tag"));
    }

    #[test]
    fn error_frame_carries_machine_readable_code() {
        let frame = Frame::error(error_codes::NOT_AUTHORIZED, "subject not in allow-list");
        assert_eq!(frame.error_code(), Some(error_codes::NOT_AUTHORIZED));
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["payload"]["error"], "subject not in allow-list");
    }

    #[test]
    fn replay_mode_parses_tagged_payloads() {
        let all: ReplayMode = serde_json::from_str(r#"{"mode": "all"}"#).unwrap();
        assert_eq!(all, ReplayMode::All);

        let seq: ReplayMode =
            serde_json::from_str(r#"{"mode": "from_sequence", "sequence": 42}"#).unwrap();
        assert_eq!(seq, ReplayMode::FromSequence { sequence: 42 });

        let resume: ReplayMode =
            serde_json::from_str(r#"{"mode": "resume_from_last_ack"}"#).unwrap();
        assert_eq!(resume, ReplayMode::ResumeFromLastAck);
    }

    #[test]
    fn subscribe_payload_defaults_to_no_replay() {
        let payload: SubscribePayload = serde_json::from_str("{}").unwrap();
        assert_eq!(payload.replay, None);
    }

    #[test]
    fn auth_frames_match_handshake_contract() {
        let ok = Frame::auth_ok("sensor-001", "sensor");
        let json = serde_json::to_value(&ok).unwrap();
        assert_eq!(json["type"], 8);
        assert_eq!(json["payload"]["success"], true);
        assert_eq!(json["payload"]["clientId"], "sensor-001");
        assert_eq!(json["payload"]["role"], "sensor");

        let failed = Frame::auth_failed("bad signature");
        let json = serde_json::to_value(&failed).unwrap();
        assert_eq!(json["payload"]["success"], false);
        assert_eq!(json["payload"]["error"], "bad signature");
    }
}
