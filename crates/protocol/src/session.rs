use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MirrorStatus {
    Active,
    Ended,
}

/// One co-browsing engagement, owned by the agent who opened it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirrorSession {
    pub id: Uuid,
    pub owner_id: String,
    pub status: MirrorStatus,
    pub created_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<u64>,
}

impl MirrorSession {
    pub fn is_active(&self) -> bool {
        self.status == MirrorStatus::Active
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallType {
    Video,
    Audio,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    Pending,
    Active,
    Ended,
}

impl CallStatus {
    /// Legal record transitions: pending → active → ended, pending → ended.
    /// Re-entering the current status is not a transition.
    pub fn can_transition_to(self, next: CallStatus) -> bool {
        matches!(
            (self, next),
            (CallStatus::Pending, CallStatus::Active)
                | (CallStatus::Pending, CallStatus::Ended)
                | (CallStatus::Active, CallStatus::Ended)
        )
    }
}

/// One peer media engagement between an initiator and a responder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallSession {
    pub id: Uuid,
    pub conversation_id: String,
    pub initiator_id: String,
    pub responder_id: String,
    pub call_type: CallType,
    pub status: CallStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<u64>,
}

/// Request to create a call session. `id` may reuse a mirror session's id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewCall {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Uuid>,
    pub conversation_id: String,
    pub initiator_id: String,
    pub responder_id: String,
    pub call_type: CallType,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_status_transitions() {
        assert!(CallStatus::Pending.can_transition_to(CallStatus::Active));
        assert!(CallStatus::Pending.can_transition_to(CallStatus::Ended));
        assert!(CallStatus::Active.can_transition_to(CallStatus::Ended));
        assert!(!CallStatus::Ended.can_transition_to(CallStatus::Active));
        assert!(!CallStatus::Ended.can_transition_to(CallStatus::Pending));
        assert!(!CallStatus::Active.can_transition_to(CallStatus::Active));
    }

    #[test]
    fn call_session_omits_unset_timestamps() {
        let call = CallSession {
            id: Uuid::nil(),
            conversation_id: "conv-1".to_string(),
            initiator_id: "agent-7".to_string(),
            responder_id: "visitor-3".to_string(),
            call_type: CallType::Video,
            status: CallStatus::Pending,
            started_at: None,
            ended_at: None,
            duration_seconds: None,
        };
        let json = serde_json::to_string(&call).unwrap();
        assert!(json.contains(r#""status":"pending""#));
        assert!(json.contains(r#""call_type":"video""#));
        assert!(!json.contains("started_at"));
        let parsed: CallSession = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, call);
    }

    #[test]
    fn new_call_id_is_optional() {
        let json = r#"{"conversation_id":"c","initiator_id":"a","responder_id":"b","call_type":"audio"}"#;
        let req: NewCall = serde_json::from_str(json).unwrap();
        assert!(req.id.is_none());
        assert_eq!(req.call_type, CallType::Audio);
    }
}
