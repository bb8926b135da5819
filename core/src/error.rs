/// Error types for the chat engine
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChatError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error(transparent)]
    NotReady(#[from] NotReadyError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Send(#[from] SendError),

    #[error(transparent)]
    Upload(#[from] UploadError),

    #[error(transparent)]
    Annotation(#[from] AnnotationError),
}

pub type Result<T> = std::result::Result<T, ChatError>;

/// The connection is not open; nothing was queued.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("connection is not open")]
pub struct NotReadyError;

/// Input rejected before any network call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("message text is empty")]
    EmptyText,

    #[error("unsupported media type '{mime}', expected {expected}*")]
    InvalidType { mime: String, expected: String },

    #[error("file is {size} bytes, limit is {max} bytes")]
    TooLarge { size: u64, max: u64 },
}

/// Failure talking to the request/response endpoints.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("network error: {0}")]
    Network(String),

    /// Non-2xx response. `detail` carries the server's error-detail text when present.
    #[error("{}", status_message(.status, .detail))]
    Status { status: u16, detail: Option<String> },

    #[error("malformed response: {0}")]
    Malformed(String),
}

fn status_message(status: &u16, detail: &Option<String>) -> String {
    match detail {
        Some(detail) => detail.clone(),
        None => format!("HTTP error! status: {}", status),
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SendError {
    #[error("cannot send: connection is not open")]
    NotReady,

    #[error(transparent)]
    Validation(#[from] ValidationError),
}

impl From<NotReadyError> for SendError {
    fn from(_: NotReadyError) -> Self {
        SendError::NotReady
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UploadError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("upload failed: {0}")]
    TransportFailed(#[from] TransportError),

    #[error("uploaded, but the connection is not open to send it")]
    NotReady,
}

impl From<NotReadyError> for UploadError {
    fn from(_: NotReadyError) -> Self {
        UploadError::NotReady
    }
}

impl From<SendError> for UploadError {
    fn from(e: SendError) -> Self {
        match e {
            SendError::NotReady => UploadError::NotReady,
            SendError::Validation(v) => UploadError::Validation(v),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AnnotationError {
    #[error("no message with id {0}")]
    UnknownMessage(String),

    #[error("{kind} analysis is not available for {message_kind} messages")]
    UnsupportedKind {
        kind: &'static str,
        message_kind: &'static str,
    },

    #[error(transparent)]
    Validation(#[from] ValidationError),
}
