/// Media messages: image upload, emoji send, emoji suggestions
use crate::backend::ChatBackend;
use crate::config::Config;
use crate::connection::{ConnectionState, Transport};
use crate::error::{Result, SendError, UploadError, ValidationError};
use crate::identity::Identity;
use crate::message::{Message, MessageKind};
use crate::message_store::MessageStore;
use crate::send::{build_envelope, send_envelope};
use std::path::Path;
use tracing::{info, warn};

/// Binary file picked for upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaFile {
    pub file_name: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

impl MediaFile {
    pub fn new(file_name: impl Into<String>, mime_type: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            file_name: file_name.into(),
            mime_type: mime_type.into(),
            bytes,
        }
    }

    /// Read a file from disk, guessing its mime type from the extension
    pub async fn from_path(path: &Path) -> Result<Self> {
        let bytes = tokio::fs::read(path).await?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload".to_string());
        Ok(Self {
            mime_type: guess_mime_type(&file_name).to_string(),
            file_name,
            bytes,
        })
    }

    pub fn size(&self) -> u64 {
        self.bytes.len() as u64
    }
}

fn guess_mime_type(file_name: &str) -> &'static str {
    let lower = file_name.to_ascii_lowercase();
    if lower.ends_with(".png") {
        "image/png"
    } else if lower.ends_with(".jpg") || lower.ends_with(".jpeg") {
        "image/jpeg"
    } else if lower.ends_with(".gif") {
        "image/gif"
    } else if lower.ends_with(".webp") {
        "image/webp"
    } else if lower.ends_with(".bmp") {
        "image/bmp"
    } else if lower.ends_with(".svg") {
        "image/svg+xml"
    } else {
        "application/octet-stream"
    }
}

/// Limits applied before anything is uploaded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadConstraints {
    pub max_bytes: u64,
    pub allowed_mime_prefix: String,
}

impl UploadConstraints {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_bytes: config.max_upload_bytes,
            allowed_mime_prefix: config.allowed_mime_prefix.clone(),
        }
    }

    /// Type first, then size
    pub fn validate(&self, file: &MediaFile) -> std::result::Result<(), ValidationError> {
        if !file.mime_type.starts_with(&self.allowed_mime_prefix) {
            return Err(ValidationError::InvalidType {
                mime: file.mime_type.clone(),
                expected: self.allowed_mime_prefix.clone(),
            });
        }
        if file.size() > self.max_bytes {
            return Err(ValidationError::TooLarge {
                size: file.size(),
                max: self.max_bytes,
            });
        }
        Ok(())
    }
}

/// Validate, upload, then send an image message referencing the uploaded URL.
///
/// No log entry exists unless the upload succeeded and the envelope was accepted.
pub async fn upload_and_send<T>(
    file: &MediaFile,
    constraints: &UploadConstraints,
    store: &MessageStore,
    transport: &T,
    backend: &dyn ChatBackend,
    identity: &Identity,
) -> std::result::Result<Message, UploadError>
where
    T: Transport + ?Sized,
{
    constraints.validate(file)?;

    if transport.state() != ConnectionState::Open {
        return Err(UploadError::NotReady);
    }

    let image_url = backend.upload_image(file).await.map_err(|e| {
        warn!("Upload of {} failed: {}", file.file_name, e);
        UploadError::TransportFailed(e)
    })?;
    info!("Uploaded {} ({} bytes) to {}", file.file_name, file.size(), image_url);

    let envelope = build_envelope(identity, MessageKind::Image, image_url);
    Ok(send_envelope(store, transport, envelope).await?)
}

/// Send an emoji picked from the suggestions
pub async fn send_emoji<T>(
    store: &MessageStore,
    transport: &T,
    emoji_url: &str,
    identity: &Identity,
) -> std::result::Result<Message, SendError>
where
    T: Transport + ?Sized,
{
    let emoji_url = emoji_url.trim();
    if emoji_url.is_empty() {
        return Err(ValidationError::EmptyText.into());
    }
    let envelope = build_envelope(identity, MessageKind::Emoji, emoji_url.to_string());
    send_envelope(store, transport, envelope).await
}

/// Emoji image URLs matching the draft text
pub async fn suggest_emojis(backend: &dyn ChatBackend, text: &str, limit: usize) -> Result<Vec<String>> {
    if text.trim().is_empty() {
        return Err(ValidationError::EmptyText.into());
    }
    let emojis = backend.search_emojis(text, limit).await?;
    info!("{} emoji suggestions for draft", emojis.len());
    Ok(emojis)
}
