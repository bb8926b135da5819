/// Wire formats: duplex envelopes and request/response bodies
use crate::error::{ChatError, Result};
use crate::identity::Role;
use crate::message::{Annotation, DeliveryState, Message, MessageKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Sender recorded for inbound frames that do not name one
pub const UNKNOWN_SENDER: &str = "unknown";

/// Context entry sent in place of a non-text message
pub const MEDIA_PLACEHOLDER: &str = "[image]";

static SYNTH_SEQ: AtomicU64 = AtomicU64::new(0);

/// Outbound unit written to the duplex connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: String,
    pub from: String,
    pub to: String,
    pub pair_id: String,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_data: Option<String>,
    pub role: Role,
}

impl Envelope {
    /// Serialize to the UTF-8 JSON text frame
    pub fn to_json(&self) -> std::result::Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Local log entry for an envelope we are about to send
    pub fn to_local_message(&self) -> Message {
        let payload = match self.kind {
            MessageKind::Text => self.message.clone(),
            MessageKind::Image | MessageKind::Emoji => self.image_data.clone(),
        };
        Message {
            id: self.id.clone(),
            from: self.from.clone(),
            to: self.to.clone(),
            pair_id: self.pair_id.clone(),
            kind: self.kind,
            payload: payload.unwrap_or_default(),
            role: self.role,
            delivery: DeliveryState::Pending,
            annotation: Annotation::default(),
            received_at: Utc::now(),
        }
    }
}

/// Inbound frame (or history row) as the server sends it.
///
/// Every field is optional; `normalize` fills the gaps. Ids and pair ids may
/// arrive as numbers from older clients.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundFrame {
    #[serde(default, deserialize_with = "lenient_string")]
    pub id: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub from: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub to: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub pair_id: Option<String>,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub image_data: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
}

impl InboundFrame {
    /// Parse a text frame received on the duplex connection
    pub fn parse(text: &str) -> Result<Self> {
        serde_json::from_str(text)
            .map_err(|e| ChatError::Protocol(format!("Invalid frame: {}", e)))
    }

    /// Turn the frame into a log entry.
    ///
    /// Missing sender becomes `unknown`, missing id is synthesized from the
    /// sender and arrival time, missing role is inferred from the sender id.
    pub fn normalize(self, arrived_at: DateTime<Utc>, delivery: DeliveryState) -> Result<Message> {
        let kind = match self.kind.as_deref() {
            Some("text") => MessageKind::Text,
            Some("image") => MessageKind::Image,
            Some("emoji") => MessageKind::Emoji,
            Some(other) => {
                return Err(ChatError::Protocol(format!("Unknown message type '{}'", other)))
            }
            None if self.message.is_some() => MessageKind::Text,
            None if self.image_data.is_some() => MessageKind::Image,
            None => return Err(ChatError::Protocol("Frame has no content".to_string())),
        };

        let payload = match kind {
            MessageKind::Text => self.message,
            MessageKind::Image | MessageKind::Emoji => self.image_data,
        }
        .ok_or_else(|| ChatError::Protocol(format!("{} frame has no payload", kind)))?;

        let from = self
            .from
            .filter(|f| !f.is_empty())
            .unwrap_or_else(|| UNKNOWN_SENDER.to_string());
        let id = self
            .id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| synthesize_id(&from, arrived_at));
        let role = match self.role.as_deref().map(str::parse::<Role>) {
            Some(Ok(role)) => role,
            _ => Role::infer_from_sender(&from),
        };

        Ok(Message {
            id,
            from,
            to: self.to.unwrap_or_default(),
            pair_id: self.pair_id.unwrap_or_default(),
            kind,
            payload,
            role,
            delivery,
            annotation: Annotation::default(),
            received_at: arrived_at,
        })
    }
}

/// `<sender>_<arrival millis>_<seq>`; the sequence keeps ids distinct within one millisecond
fn synthesize_id(from: &str, arrived_at: DateTime<Utc>) -> String {
    let seq = SYNTH_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("{}_{}_{}", from, arrived_at.timestamp_millis(), seq)
}

fn lenient_string<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        None | Some(serde_json::Value::Null) => None,
        Some(serde_json::Value::String(s)) => Some(s),
        Some(serde_json::Value::Number(n)) => Some(n.to_string()),
        Some(serde_json::Value::Bool(b)) => Some(b.to_string()),
        Some(other) => Some(other.to_string()),
    })
}

// ─── Request/response bodies ─────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AnalyzeTextRequest {
    pub text: String,
    pub role: Role,
    pub context: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AnalyzeEmojiRequest {
    pub image_url: String,
    pub role: Role,
    pub context: Vec<String>,
}

/// `{status: "success", analysis}` or `{status: "error", message}`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AnalysisResponse {
    pub status: String,
    #[serde(default)]
    pub analysis: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl AnalysisResponse {
    pub fn success(analysis: impl Into<String>) -> Self {
        Self {
            status: "success".to_string(),
            analysis: Some(analysis.into()),
            message: None,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            status: "error".to_string(),
            analysis: None,
            message: Some(message.into()),
        }
    }

    /// Annotation this response resolves to
    pub fn into_annotation(self) -> Annotation {
        if self.status == "success" {
            Annotation::result(self.analysis.unwrap_or_default())
        } else {
            Annotation::error(self.message.unwrap_or_else(|| "analysis failed".to_string()))
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadResponse {
    pub image_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchEmojisRequest {
    pub text: String,
    pub limit: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchEmojisResponse {
    #[serde(default)]
    pub emojis: Vec<String>,
}

/// Error body of a non-2xx response
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorBody {
    #[serde(default)]
    pub detail: Option<serde_json::Value>,
}

impl ErrorBody {
    pub fn detail_text(&self) -> Option<String> {
        match &self.detail {
            None | Some(serde_json::Value::Null) => None,
            Some(serde_json::Value::String(s)) => Some(s.clone()),
            Some(other) => Some(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_wire_shape() {
        let envelope = Envelope {
            id: "abc".to_string(),
            from: "elder_42".to_string(),
            to: "young_42".to_string(),
            pair_id: "42".to_string(),
            kind: MessageKind::Text,
            message: Some("hello".to_string()),
            image_data: None,
            role: Role::Elder,
        };
        let value: serde_json::Value = serde_json::from_str(&envelope.to_json().unwrap()).unwrap();
        assert_eq!(value["type"], "text");
        assert_eq!(value["pair_id"], "42");
        assert_eq!(value["message"], "hello");
        assert!(value.get("image_data").is_none());
    }

    #[test]
    fn test_normalize_fills_missing_fields() {
        let frame = InboundFrame::parse(r#"{"from":"young_42","type":"text","message":"hi"}"#).unwrap();
        let msg = frame.normalize(Utc::now(), DeliveryState::Acknowledged).unwrap();
        assert!(msg.id.contains("young_42"));
        assert_eq!(msg.role, Role::Young);
        assert_eq!(msg.payload, "hi");

        let anonymous = InboundFrame::parse(r#"{"type":"emoji","image_data":"http://x/e.gif"}"#).unwrap();
        let msg = anonymous.normalize(Utc::now(), DeliveryState::Acknowledged).unwrap();
        assert_eq!(msg.from, UNKNOWN_SENDER);
        assert!(msg.id.starts_with("unknown_"));
        assert_eq!(msg.kind, MessageKind::Emoji);
    }

    #[test]
    fn test_normalize_accepts_numeric_ids() {
        let frame = InboundFrame::parse(
            r#"{"id":1712345678901,"from":"elder_3","to":"young_3","pair_id":3,"type":"text","message":"ok"}"#,
        )
        .unwrap();
        let msg = frame.normalize(Utc::now(), DeliveryState::Acknowledged).unwrap();
        assert_eq!(msg.id, "1712345678901");
        assert_eq!(msg.pair_id, "3");
        assert_eq!(msg.role, Role::Elder);
    }

    #[test]
    fn test_synthesized_ids_are_distinct() {
        let at = Utc::now();
        let a = InboundFrame::parse(r#"{"from":"young_1","message":"a"}"#).unwrap();
        let b = InboundFrame::parse(r#"{"from":"young_1","message":"b"}"#).unwrap();
        let a = a.normalize(at, DeliveryState::Acknowledged).unwrap();
        let b = b.normalize(at, DeliveryState::Acknowledged).unwrap();
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_bad_frames_are_protocol_errors() {
        assert!(InboundFrame::parse("not json").is_err());
        let unknown = InboundFrame::parse(r#"{"type":"video","image_data":"x"}"#).unwrap();
        assert!(unknown.normalize(Utc::now(), DeliveryState::Acknowledged).is_err());
        let empty = InboundFrame::parse(r#"{"type":"image"}"#).unwrap();
        assert!(empty.normalize(Utc::now(), DeliveryState::Acknowledged).is_err());
    }

    #[test]
    fn test_analysis_response_resolution() {
        let ok = AnalysisResponse::success("friendly greeting").into_annotation();
        assert_eq!(ok.content.as_deref(), Some("friendly greeting"));

        let failed: AnalysisResponse = serde_json::from_str(r#"{"status":"error"}"#).unwrap();
        let annotation = failed.into_annotation();
        assert_eq!(annotation.error_message.as_deref(), Some("analysis failed"));
    }
}
