/// Shared types for the message log
use crate::identity::Role;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of content a message carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Text,
    Image,
    Emoji,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Text => "text",
            MessageKind::Image => "image",
            MessageKind::Emoji => "emoji",
        }
    }

    /// Image and emoji messages carry a media URL instead of text
    pub fn is_media(&self) -> bool {
        !matches!(self, MessageKind::Text)
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Local view of whether a message made it out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    /// Inserted optimistically, not yet written to the connection
    Pending,
    /// Written to the connection, or loaded from server history
    Acknowledged,
    /// The connection dropped before the envelope was written
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnnotationState {
    #[default]
    None,
    Pending,
    Result,
    Error,
}

/// AI analysis attached to a message
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Annotation {
    pub state: AnnotationState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Token of the request currently allowed to complete this annotation
    #[serde(skip)]
    pub(crate) request_token: Option<u64>,
}

impl Annotation {
    pub fn is_pending(&self) -> bool {
        self.state == AnnotationState::Pending
    }

    pub(crate) fn pending(token: u64) -> Self {
        Self {
            state: AnnotationState::Pending,
            content: None,
            error_message: None,
            request_token: Some(token),
        }
    }

    pub fn result(content: impl Into<String>) -> Self {
        Self {
            state: AnnotationState::Result,
            content: Some(content.into()),
            error_message: None,
            request_token: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            state: AnnotationState::Error,
            content: None,
            error_message: Some(message.into()),
            request_token: None,
        }
    }
}

/// One entry in the message log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub from: String,
    pub to: String,
    pub pair_id: String,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    /// Text for text messages, media URL for image/emoji messages
    pub payload: String,
    /// Role of the sender
    pub role: Role,
    pub delivery: DeliveryState,
    #[serde(default)]
    pub annotation: Annotation,
    pub received_at: DateTime<Utc>,
}

impl Message {
    pub fn is_text(&self) -> bool {
        self.kind == MessageKind::Text
    }

    /// Short single-line preview for logs and terminals
    pub fn preview(&self) -> String {
        match self.kind {
            MessageKind::Text => {
                let mut text: String = self.payload.chars().take(60).collect();
                if self.payload.chars().count() > 60 {
                    text.push('…');
                }
                text
            }
            MessageKind::Image => format!("[image] {}", self.payload),
            MessageKind::Emoji => format!("[emoji] {}", self.payload),
        }
    }
}

/// Change notifications published by the message store
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StoreEvent {
    /// A message was appended (live frame or optimistic insert)
    Appended { message: Message },
    /// The whole log was replaced by a history snapshot
    Replaced { count: usize },
    /// Delivery or annotation state of a message changed
    Updated { message: Message },
}
