use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::session::{CallSession, MirrorSession, NewCall};

/// Milliseconds since the Unix epoch. Every payload `timestamp` and record
/// `created_at` uses this unit.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("invalid {kind} payload: {source}")]
    InvalidPayload {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to encode {kind} payload: {source}")]
    Encode {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

// --- Mirror events ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MirrorKind {
    Snapshot,
    Mutation,
    Scroll,
    Pointer,
    Highlight,
}

impl MirrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MirrorKind::Snapshot => "snapshot",
            MirrorKind::Mutation => "mutation",
            MirrorKind::Scroll => "scroll",
            MirrorKind::Pointer => "pointer",
            MirrorKind::Highlight => "highlight",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

/// Full serialized copy of the visible document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotPayload {
    pub markup: String,
    pub style_rules: Vec<String>,
    pub viewport: Viewport,
    pub url: String,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MutationKind {
    NodeListChange,
    AttributeChange,
}

/// Incremental document change. `attribute_value: None` on an attribute
/// change means the attribute was removed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationPayload {
    pub mutation_kind: MutationKind,
    pub target_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub added_fragments: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub removed_tags: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attribute_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attribute_value: Option<String>,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScrollPayload {
    pub x: f64,
    pub y: f64,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PointerAction {
    Move,
    Click,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PointerPayload {
    pub x: f64,
    pub y: f64,
    pub action: PointerAction,
    pub timestamp: u64,
}

/// Agent-to-visitor command: outline `target_path` for `duration_ms`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HighlightPayload {
    pub target_path: String,
    pub color: String,
    pub duration_ms: u64,
    pub timestamp: u64,
}

/// Typed view of a mirror event payload.
#[derive(Debug, Clone, PartialEq)]
pub enum MirrorBody {
    Snapshot(SnapshotPayload),
    Mutation(MutationPayload),
    Scroll(ScrollPayload),
    Pointer(PointerPayload),
    Highlight(HighlightPayload),
}

impl MirrorBody {
    pub fn kind(&self) -> MirrorKind {
        match self {
            MirrorBody::Snapshot(_) => MirrorKind::Snapshot,
            MirrorBody::Mutation(_) => MirrorKind::Mutation,
            MirrorBody::Scroll(_) => MirrorKind::Scroll,
            MirrorBody::Pointer(_) => MirrorKind::Pointer,
            MirrorBody::Highlight(_) => MirrorKind::Highlight,
        }
    }

    /// Encode into the opaque JSON object carried by the channel.
    pub fn to_payload(&self) -> Result<Value, ProtocolError> {
        let kind = self.kind().as_str();
        let encoded = match self {
            MirrorBody::Snapshot(p) => serde_json::to_value(p),
            MirrorBody::Mutation(p) => serde_json::to_value(p),
            MirrorBody::Scroll(p) => serde_json::to_value(p),
            MirrorBody::Pointer(p) => serde_json::to_value(p),
            MirrorBody::Highlight(p) => serde_json::to_value(p),
        };
        encoded.map_err(|source| ProtocolError::Encode { kind, source })
    }

    pub fn decode(kind: MirrorKind, payload: &Value) -> Result<Self, ProtocolError> {
        fn parse<T: serde::de::DeserializeOwned>(
            kind: MirrorKind,
            payload: &Value,
        ) -> Result<T, ProtocolError> {
            T::deserialize(payload).map_err(|source| ProtocolError::InvalidPayload {
                kind: kind.as_str(),
                source,
            })
        }

        Ok(match kind {
            MirrorKind::Snapshot => MirrorBody::Snapshot(parse(kind, payload)?),
            MirrorKind::Mutation => MirrorBody::Mutation(parse(kind, payload)?),
            MirrorKind::Scroll => MirrorBody::Scroll(parse(kind, payload)?),
            MirrorKind::Pointer => MirrorBody::Pointer(parse(kind, payload)?),
            MirrorKind::Highlight => MirrorBody::Highlight(parse(kind, payload)?),
        })
    }
}

/// Append-only record scoped to a mirror session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MirrorEvent {
    pub session_id: Uuid,
    pub kind: MirrorKind,
    pub payload: Value,
    pub created_at: u64,
}

impl MirrorEvent {
    pub fn body(&self) -> Result<MirrorBody, ProtocolError> {
        MirrorBody::decode(self.kind, &self.payload)
    }
}

// --- Call signaling ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Initiator,
    Responder,
}

impl Role {
    pub fn peer(self) -> Role {
        match self {
            Role::Initiator => Role::Responder,
            Role::Responder => Role::Initiator,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalKind {
    Offer,
    Answer,
    IceCandidate,
}

impl SignalKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SignalKind::Offer => "offer",
            SignalKind::Answer => "answer",
            SignalKind::IceCandidate => "ice-candidate",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default)]
    pub sdp_mline_index: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct DescriptionPayload {
    sdp: String,
}

/// Typed view of a signal payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    Offer { sdp: String },
    Answer { sdp: String },
    IceCandidate(IceCandidate),
}

impl Signal {
    pub fn kind(&self) -> SignalKind {
        match self {
            Signal::Offer { .. } => SignalKind::Offer,
            Signal::Answer { .. } => SignalKind::Answer,
            Signal::IceCandidate(_) => SignalKind::IceCandidate,
        }
    }

    pub fn to_payload(&self) -> Result<Value, ProtocolError> {
        let kind = self.kind().as_str();
        let encoded = match self {
            Signal::Offer { sdp } | Signal::Answer { sdp } => {
                serde_json::to_value(DescriptionPayload { sdp: sdp.clone() })
            }
            Signal::IceCandidate(c) => serde_json::to_value(c),
        };
        encoded.map_err(|source| ProtocolError::Encode { kind, source })
    }

    pub fn decode(kind: SignalKind, payload: &Value) -> Result<Self, ProtocolError> {
        let invalid = |source| ProtocolError::InvalidPayload {
            kind: kind.as_str(),
            source,
        };
        Ok(match kind {
            SignalKind::Offer => Signal::Offer {
                sdp: DescriptionPayload::deserialize(payload).map_err(invalid)?.sdp,
            },
            SignalKind::Answer => Signal::Answer {
                sdp: DescriptionPayload::deserialize(payload).map_err(invalid)?.sdp,
            },
            SignalKind::IceCandidate => {
                Signal::IceCandidate(IceCandidate::deserialize(payload).map_err(invalid)?)
            }
        })
    }
}

/// Append-only record scoped to a call session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalMessage {
    pub call_session_id: Uuid,
    pub sender_role: Role,
    pub signal_kind: SignalKind,
    pub signal_payload: Value,
    pub created_at: u64,
}

impl SignalMessage {
    pub fn signal(&self) -> Result<Signal, ProtocolError> {
        Signal::decode(self.signal_kind, &self.signal_payload)
    }
}

// --- Relay ---

/// Which session log a subscription or append addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "stream", content = "id", rename_all = "snake_case")]
pub enum Topic {
    Mirror(Uuid),
    Call(Uuid),
}

/// Any record delivered by the channel.
/// Adjacently tagged so the nested record keeps its own field layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "stream", content = "data", rename_all = "snake_case")]
pub enum StreamRecord {
    Mirror(MirrorEvent),
    Signal(SignalMessage),
}

impl StreamRecord {
    pub fn topic(&self) -> Topic {
        match self {
            StreamRecord::Mirror(e) => Topic::Mirror(e.session_id),
            StreamRecord::Signal(m) => Topic::Call(m.call_session_id),
        }
    }
}

/// Frames sent by a participant to the relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ClientFrame {
    AppendMirror {
        request_id: u64,
        session_id: Uuid,
        kind: MirrorKind,
        payload: Value,
    },
    AppendSignal {
        request_id: u64,
        call_session_id: Uuid,
        sender_role: Role,
        signal_kind: SignalKind,
        signal_payload: Value,
    },
    Subscribe {
        request_id: u64,
        topic: Topic,
    },
    Unsubscribe {
        request_id: u64,
        topic: Topic,
    },
    OpenMirror {
        request_id: u64,
    },
    GetMirror {
        request_id: u64,
        session_id: Uuid,
    },
    EndMirror {
        request_id: u64,
        session_id: Uuid,
    },
    CreateCall {
        request_id: u64,
        call: NewCall,
    },
    GetCall {
        request_id: u64,
        call_session_id: Uuid,
    },
    ActivateCall {
        request_id: u64,
        call_session_id: Uuid,
    },
    EndCall {
        request_id: u64,
        call_session_id: Uuid,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration_seconds: Option<u64>,
    },
}

impl ClientFrame {
    pub fn request_id(&self) -> u64 {
        match self {
            ClientFrame::AppendMirror { request_id, .. }
            | ClientFrame::AppendSignal { request_id, .. }
            | ClientFrame::Subscribe { request_id, .. }
            | ClientFrame::Unsubscribe { request_id, .. }
            | ClientFrame::OpenMirror { request_id }
            | ClientFrame::GetMirror { request_id, .. }
            | ClientFrame::EndMirror { request_id, .. }
            | ClientFrame::CreateCall { request_id, .. }
            | ClientFrame::GetCall { request_id, .. }
            | ClientFrame::ActivateCall { request_id, .. }
            | ClientFrame::EndCall { request_id, .. } => *request_id,
        }
    }
}

/// Successful result of a [`ClientFrame`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum AckResult {
    Appended { created_at: u64 },
    Subscribed,
    Unsubscribed,
    Mirror(MirrorSession),
    Call(CallSession),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    BadRequest,
    NotFound,
    Forbidden,
    InvalidTransition,
    LimitReached,
    Internal,
}

/// Frames sent by the relay to a participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Ack {
        request_id: u64,
        result: AckResult,
    },
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<u64>,
        code: ErrorCode,
        message: String,
    },
    Record {
        record: StreamRecord,
    },
    /// The session behind `topic` ended; no further records follow.
    Closed {
        topic: Topic,
    },
}

/// ICE server configuration returned to clients for WebRTC setup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IceServerInfo {
    pub urls: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn mirror_event_wire_shape() {
        let body = MirrorBody::Scroll(ScrollPayload {
            x: 0.0,
            y: 420.0,
            timestamp: 7,
        });
        let event = MirrorEvent {
            session_id: Uuid::nil(),
            kind: body.kind(),
            payload: body.to_payload().unwrap(),
            created_at: 9,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "scroll");
        assert_eq!(json["session_id"], "00000000-0000-0000-0000-000000000000");
        assert_eq!(json["payload"]["y"], 420.0);
        assert_eq!(json["created_at"], 9);

        let text = serde_json::to_string(&event).unwrap();
        let parsed: MirrorEvent = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed, event);
        assert_eq!(serde_json::to_string(&parsed).unwrap(), text);
        assert_eq!(parsed.body().unwrap(), body);
    }

    #[test]
    fn mutation_kind_is_kebab_case() {
        let payload = MutationPayload {
            mutation_kind: MutationKind::NodeListChange,
            target_path: "#list".to_string(),
            added_fragments: Some(vec!["<li>new</li>".to_string()]),
            removed_tags: None,
            attribute_name: None,
            attribute_value: None,
            timestamp: 1,
        };
        let json = serde_json::to_string(&payload).unwrap();
        assert!(json.contains(r#""mutation_kind":"node-list-change""#));
        // Absent optionals are omitted rather than serialized as null
        assert!(!json.contains("removed_tags"));

        let attr: MutationPayload = serde_json::from_value(json!({
            "mutation_kind": "attribute-change",
            "target_path": "html > body",
            "attribute_name": "class",
            "attribute_value": "dark",
            "timestamp": 3
        }))
        .unwrap();
        assert_eq!(attr.mutation_kind, MutationKind::AttributeChange);
        assert!(attr.added_fragments.is_none());
    }

    #[test]
    fn decode_rejects_payload_of_wrong_shape() {
        let err = MirrorBody::decode(MirrorKind::Pointer, &json!({ "x": 1 })).unwrap_err();
        assert!(err.to_string().contains("pointer"));
    }

    #[test]
    fn signal_message_wire_shape() {
        let signal = Signal::IceCandidate(IceCandidate {
            candidate: "candidate:1 1 UDP 2130706431 192.168.1.1 50000 typ host".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
        });
        let msg = SignalMessage {
            call_session_id: Uuid::nil(),
            sender_role: Role::Responder,
            signal_kind: signal.kind(),
            signal_payload: signal.to_payload().unwrap(),
            created_at: 11,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""signal_kind":"ice-candidate""#));
        assert!(json.contains(r#""sender_role":"responder""#));
        let parsed: SignalMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.signal().unwrap(), signal);
    }

    #[test]
    fn offer_payload_from_browser_format() {
        let msg: SignalMessage = serde_json::from_value(json!({
            "call_session_id": "00000000-0000-0000-0000-000000000000",
            "sender_role": "initiator",
            "signal_kind": "offer",
            "signal_payload": { "sdp": "v=0\r\n...", "type": "offer" },
            "created_at": 1
        }))
        .unwrap();
        match msg.signal().unwrap() {
            Signal::Offer { sdp } => assert_eq!(sdp, "v=0\r\n..."),
            other => panic!("Expected Offer, got {other:?}"),
        }
    }

    #[test]
    fn role_peer_is_symmetric() {
        assert_eq!(Role::Initiator.peer(), Role::Responder);
        assert_eq!(Role::Responder.peer().peer(), Role::Responder);
    }

    #[test]
    fn stream_record_keeps_nested_layout() {
        let record = StreamRecord::Signal(SignalMessage {
            call_session_id: Uuid::nil(),
            sender_role: Role::Initiator,
            signal_kind: SignalKind::Answer,
            signal_payload: json!({ "sdp": "answer" }),
            created_at: 2,
        });
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["stream"], "signal");
        assert_eq!(json["data"]["signal_kind"], "answer");
        assert_eq!(record.topic(), Topic::Call(Uuid::nil()));
    }

    #[test]
    fn client_frame_tagged_by_op() {
        let frame = ClientFrame::Subscribe {
            request_id: 4,
            topic: Topic::Mirror(Uuid::nil()),
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["op"], "subscribe");
        assert_eq!(json["topic"]["stream"], "mirror");
        assert_eq!(frame.request_id(), 4);

        let parsed: ClientFrame = serde_json::from_value(json!({
            "op": "end_call",
            "request_id": 8,
            "call_session_id": "00000000-0000-0000-0000-000000000000"
        }))
        .unwrap();
        match parsed {
            ClientFrame::EndCall {
                request_id,
                duration_seconds,
                ..
            } => {
                assert_eq!(request_id, 8);
                assert!(duration_seconds.is_none());
            }
            other => panic!("Expected EndCall, got {other:?}"),
        }
    }

    #[test]
    fn server_frame_ack_roundtrip() {
        let frame = ServerFrame::Ack {
            request_id: 1,
            result: AckResult::Appended { created_at: 55 },
        };
        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains(r#""type":"ack""#));
        assert!(json.contains(r#""kind":"appended""#));
        let parsed: ServerFrame = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, frame);

        let err = ServerFrame::Error {
            request_id: None,
            code: ErrorCode::NotFound,
            message: "session not found".to_string(),
        };
        let json = serde_json::to_string(&err).unwrap();
        assert!(json.contains(r#""code":"not_found""#));
        assert!(!json.contains("request_id"));

        let closed = ServerFrame::Closed {
            topic: Topic::Call(Uuid::nil()),
        };
        assert_eq!(
            serde_json::to_value(&closed).unwrap(),
            json!({
                "type": "closed",
                "topic": { "stream": "call", "id": "00000000-0000-0000-0000-000000000000" }
            })
        );
    }
}
