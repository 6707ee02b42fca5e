// Wire types for the per-user push channel and the competitions REST API.
//
// The backend speaks snake_case and nests its serializers (a participant's
// `school` arrives as an object, ids may be numbers). The client domain works
// with flat snapshots, so every payload crossing the wire is normalized here
// and downstream code never sees raw shapes.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

/// Envelope discriminator for competition state broadcasts.
pub const COMPETITION_UPDATE: &str = "competition_update";

/// Envelope discriminator for direct chat messages.
pub const CHAT_MESSAGE: &str = "chat_message";

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame is not valid JSON: {0}")]
    InvalidJson(#[source] serde_json::Error),

    #[error("envelope has no `type` discriminator")]
    MissingType,

    #[error("`{kind}` envelope carries no payload")]
    MissingPayload { kind: String },

    #[error("malformed `{kind}` payload: {source}")]
    InvalidPayload {
        kind: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("competition payload has no id")]
    MissingId,

    #[error("competition payload is missing the {role}")]
    MissingParticipant { role: &'static str },
}

// ---------------------------------------------------------------------------
// Domain types
// ---------------------------------------------------------------------------

/// Lifecycle status of a competition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompetitionStatus {
    #[default]
    None,
    Pending,
    Accepted,
    Scheduled,
    Ready,
}

impl CompetitionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CompetitionStatus::None => "none",
            CompetitionStatus::Pending => "pending",
            CompetitionStatus::Accepted => "accepted",
            CompetitionStatus::Scheduled => "scheduled",
            CompetitionStatus::Ready => "ready",
        }
    }

    /// Anything other than `none` occupies the competition slot.
    pub fn is_live(self) -> bool {
        self != CompetitionStatus::None
    }
}

impl fmt::Display for CompetitionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Denormalized snapshot of one side of a competition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub id: String,
    pub name: String,
    /// School display name; empty when the backend sent none.
    pub school: String,
}

/// A competition as reported by the server, either through a push envelope
/// or as a REST response body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompetitionRecord {
    pub id: String,
    pub status: CompetitionStatus,
    pub scheduled_date: Option<DateTime<Utc>>,
    pub sender: Participant,
    pub receiver: Participant,
    pub updated_at: Option<DateTime<Utc>>,
}

impl CompetitionRecord {
    /// Normalize a JSON competition object.
    pub fn from_value(value: Value) -> Result<Self, ProtocolError> {
        let wire: WireCompetition =
            serde_json::from_value(value).map_err(|source| ProtocolError::InvalidPayload {
                kind: "competition".into(),
                source,
            })?;
        wire.normalize()
    }

    /// Normalize a JSON competition document (REST response body).
    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(text).map_err(ProtocolError::InvalidJson)?;
        Self::from_value(value)
    }

    /// Whether `user_id` is the sender or the receiver.
    pub fn involves(&self, user_id: &str) -> bool {
        self.sender.id == user_id || self.receiver.id == user_id
    }
}

/// A direct message delivered over the push channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub id: String,
    pub sender_id: Option<String>,
    pub receiver_id: Option<String>,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

/// A recognized, normalized push envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushEvent {
    CompetitionUpdate(CompetitionRecord),
    ChatMessage(ChatMessage),
}

// ---------------------------------------------------------------------------
// Outbound REST bodies
// ---------------------------------------------------------------------------

/// Body of `POST /api/competitions/`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateCompetitionRequest {
    pub sender_id: String,
    pub receiver_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub school_id: Option<String>,
}

/// Body of `PATCH /api/competitions/{id}/`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct UpdateCompetitionRequest {
    pub status: CompetitionStatus,
}

// ---------------------------------------------------------------------------
// Raw wire shapes
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WireId {
    Text(String),
    Number(i64),
}

impl From<WireId> for String {
    fn from(id: WireId) -> Self {
        match id {
            WireId::Text(s) => s,
            WireId::Number(n) => n.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WireSchool {
    Name(String),
    Nested {
        #[serde(default)]
        name: String,
    },
}

#[derive(Debug, Deserialize)]
struct WireParticipant {
    id: WireId,
    #[serde(default)]
    name: String,
    #[serde(default)]
    school: Option<WireSchool>,
}

impl From<WireParticipant> for Participant {
    fn from(wire: WireParticipant) -> Self {
        let school = match wire.school {
            Some(WireSchool::Name(name)) | Some(WireSchool::Nested { name }) => name,
            None => String::new(),
        };
        Participant {
            id: wire.id.into(),
            name: wire.name,
            school,
        }
    }
}

#[derive(Debug, Deserialize)]
struct WireCompetition {
    #[serde(default)]
    id: Option<WireId>,
    status: CompetitionStatus,
    #[serde(default, alias = "scheduledDate")]
    scheduled_date: Option<DateTime<Utc>>,
    #[serde(default)]
    sender: Option<WireParticipant>,
    #[serde(default)]
    receiver: Option<WireParticipant>,
    #[serde(default, alias = "updatedAt")]
    updated_at: Option<DateTime<Utc>>,
}

impl WireCompetition {
    fn normalize(self) -> Result<CompetitionRecord, ProtocolError> {
        let id: String = self.id.ok_or(ProtocolError::MissingId)?.into();
        if id.is_empty() {
            return Err(ProtocolError::MissingId);
        }
        let sender = self
            .sender
            .ok_or(ProtocolError::MissingParticipant { role: "sender" })?;
        let receiver = self
            .receiver
            .ok_or(ProtocolError::MissingParticipant { role: "receiver" })?;
        Ok(CompetitionRecord {
            id,
            status: self.status,
            scheduled_date: self.scheduled_date,
            sender: sender.into(),
            receiver: receiver.into(),
            updated_at: self.updated_at,
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireChatMessage {
    id: WireId,
    message: String,
    #[serde(default)]
    sender_id: Option<WireId>,
    #[serde(default)]
    receiver_id: Option<WireId>,
    timestamp: DateTime<Utc>,
}

impl From<WireChatMessage> for ChatMessage {
    fn from(wire: WireChatMessage) -> Self {
        ChatMessage {
            id: wire.id.into(),
            sender_id: wire.sender_id.map(Into::into),
            receiver_id: wire.receiver_id.map(Into::into),
            content: wire.message,
            timestamp: wire.timestamp,
        }
    }
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse one text frame from the push channel.
///
/// Returns `Ok(None)` for well-formed envelopes of a type this client does not
/// handle; those are dropped silently. Anything malformed is an error, which
/// the caller logs before dropping the frame.
pub fn parse_push(text: &str) -> Result<Option<PushEvent>, ProtocolError> {
    let mut value: Value = serde_json::from_str(text).map_err(ProtocolError::InvalidJson)?;

    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or(ProtocolError::MissingType)?
        .to_owned();

    match kind.as_str() {
        COMPETITION_UPDATE => {
            // The backend nests the body under `competition`; accept the
            // generic `payload` key as well.
            let key = if value.get("competition").is_some() {
                "competition"
            } else {
                "payload"
            };
            let payload = value
                .get_mut(key)
                .map(Value::take)
                .filter(|v| !v.is_null())
                .ok_or_else(|| ProtocolError::MissingPayload { kind: kind.clone() })?;
            let record = CompetitionRecord::from_value(payload)?;
            Ok(Some(PushEvent::CompetitionUpdate(record)))
        }
        CHAT_MESSAGE => {
            let wire: WireChatMessage =
                serde_json::from_value(value).map_err(|source| ProtocolError::InvalidPayload {
                    kind: kind.clone(),
                    source,
                })?;
            Ok(Some(PushEvent::ChatMessage(wire.into())))
        }
        other => {
            debug!(kind = other, "ignoring envelope with unrecognized type");
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn competition_frame(status: &str, scheduled: Option<&str>) -> String {
        let mut competition = serde_json::json!({
            "id": "c-1",
            "status": status,
            "sender": { "id": "u-a", "name": "Ada", "school": "North High" },
            "receiver": { "id": "u-b", "name": "Ben", "school": "South High" },
        });
        if let Some(date) = scheduled {
            competition["scheduled_date"] = Value::String(date.into());
        }
        serde_json::json!({ "type": "competition_update", "competition": competition }).to_string()
    }

    #[test]
    fn parses_competition_update() {
        let frame = competition_frame("pending", None);
        let event = parse_push(&frame).unwrap().unwrap();
        let PushEvent::CompetitionUpdate(record) = event else {
            panic!("expected competition update");
        };
        assert_eq!(record.id, "c-1");
        assert_eq!(record.status, CompetitionStatus::Pending);
        assert_eq!(record.scheduled_date, None);
        assert_eq!(record.sender.name, "Ada");
        assert_eq!(record.receiver.school, "South High");
    }

    #[test]
    fn scheduled_date_is_normalized() {
        let frame = competition_frame("scheduled", Some("2025-03-01T12:30:00Z"));
        let Some(PushEvent::CompetitionUpdate(record)) = parse_push(&frame).unwrap() else {
            panic!("expected competition update");
        };
        assert_eq!(
            record.scheduled_date,
            Some(Utc.with_ymd_and_hms(2025, 3, 1, 12, 30, 0).unwrap())
        );
    }

    #[test]
    fn camel_case_scheduled_date_is_accepted() {
        let frame = r#"{"type":"competition_update","competition":{
            "id":"c-9","status":"scheduled","scheduledDate":"2025-03-01T12:30:00+00:00",
            "sender":{"id":"u-a","name":"Ada"},"receiver":{"id":"u-b","name":"Ben"}}}"#;
        let Some(PushEvent::CompetitionUpdate(record)) = parse_push(frame).unwrap() else {
            panic!("expected competition update");
        };
        assert!(record.scheduled_date.is_some());
        assert_eq!(record.sender.school, "");
    }

    #[test]
    fn nested_school_and_numeric_ids_are_flattened() {
        let frame = r#"{"type":"competition_update","competition":{
            "id":42,"status":"pending",
            "sender":{"id":7,"name":"Ada","school":{"id":"s-1","name":"North High","status":"active"}},
            "receiver":{"id":"u-b","name":"Ben","school":null}}}"#;
        let Some(PushEvent::CompetitionUpdate(record)) = parse_push(frame).unwrap() else {
            panic!("expected competition update");
        };
        assert_eq!(record.id, "42");
        assert_eq!(record.sender.id, "7");
        assert_eq!(record.sender.school, "North High");
        assert_eq!(record.receiver.school, "");
    }

    #[test]
    fn payload_key_is_accepted() {
        let frame = r#"{"type":"competition_update","payload":{
            "id":"c-2","status":"none",
            "sender":{"id":"u-a","name":"Ada"},"receiver":{"id":"u-b","name":"Ben"}}}"#;
        let Some(PushEvent::CompetitionUpdate(record)) = parse_push(frame).unwrap() else {
            panic!("expected competition update");
        };
        assert_eq!(record.status, CompetitionStatus::None);
    }

    #[test]
    fn unknown_type_is_ignored() {
        let frame = r#"{"type":"announcement","payload":{"title":"hi"}}"#;
        assert!(parse_push(frame).unwrap().is_none());
    }

    #[test]
    fn invalid_json_is_an_error() {
        let err = parse_push("{not json").unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidJson(_)));
    }

    #[test]
    fn missing_type_is_an_error() {
        let err = parse_push(r#"{"competition":{}}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::MissingType));
    }

    #[test]
    fn missing_payload_is_an_error() {
        let err = parse_push(r#"{"type":"competition_update"}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::MissingPayload { .. }));
    }

    #[test]
    fn unknown_status_is_an_invalid_payload() {
        let frame = competition_frame("finished", None);
        let err = parse_push(&frame).unwrap_err();
        match err {
            ProtocolError::InvalidPayload { kind, .. } => assert_eq!(kind, "competition"),
            other => panic!("expected InvalidPayload, got: {other}"),
        }
    }

    #[test]
    fn missing_receiver_is_an_error() {
        let frame = r#"{"type":"competition_update","competition":{
            "id":"c-3","status":"pending","sender":{"id":"u-a","name":"Ada"}}}"#;
        let err = parse_push(frame).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::MissingParticipant { role: "receiver" }
        ));
    }

    #[test]
    fn parses_chat_message() {
        let frame = r#"{"type":"chat_message","id":"m-1","message":"good luck",
            "senderId":"u-a","receiverId":"u-b","timestamp":"2025-03-01T12:00:00.250000+00:00"}"#;
        let Some(PushEvent::ChatMessage(msg)) = parse_push(frame).unwrap() else {
            panic!("expected chat message");
        };
        assert_eq!(msg.content, "good luck");
        assert_eq!(msg.sender_id.as_deref(), Some("u-a"));
        assert_eq!(msg.receiver_id.as_deref(), Some("u-b"));
    }

    #[test]
    fn record_from_rest_body() {
        let body = r#"{"id":"c-1","status":"scheduled","scheduled_date":"2025-03-01T12:31:00Z",
            "sender":{"id":"u-a","name":"Ada"},"receiver":{"id":"u-b","name":"Ben"},
            "school":null,"created_at":"2025-03-01T12:29:00Z","updated_at":"2025-03-01T12:30:00Z"}"#;
        let record = CompetitionRecord::from_json(body).unwrap();
        assert_eq!(record.status, CompetitionStatus::Scheduled);
        assert!(record.updated_at.is_some());
        assert!(record.involves("u-b"));
        assert!(!record.involves("u-z"));
    }

    #[test]
    fn create_request_uses_client_field_names() {
        let req = CreateCompetitionRequest {
            sender_id: "u-a".into(),
            receiver_id: "u-b".into(),
            school_id: None,
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json, serde_json::json!({ "senderId": "u-a", "receiverId": "u-b" }));

        let update = UpdateCompetitionRequest {
            status: CompetitionStatus::None,
        };
        assert_eq!(
            serde_json::to_string(&update).unwrap(),
            r#"{"status":"none"}"#
        );
    }
}
