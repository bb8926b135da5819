/// Per-message AI annotation requests
///
/// State per message: none -> pending -> result | error, and result | error ->
/// pending on an explicit re-request. A request for a message that is already
/// pending is a no-op. Unrelated messages may be annotated concurrently.
///
/// Each request gets a token stored with the pending annotation. A response is
/// applied only while its token still owns the message; otherwise it is stale
/// (the log was reloaded or the message is gone) and is dropped.
use crate::backend::ChatBackend;
use crate::error::{AnnotationError, ValidationError};
use crate::identity::Role;
use crate::message::{Annotation, Message, MessageKind};
use crate::message_store::MessageStore;
use crate::protocol::{AnalyzeEmojiRequest, AnalyzeTextRequest};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Which analysis endpoint to use
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnalysisKind {
    Text,
    Image,
}

impl AnalysisKind {
    /// Natural analysis for a message: text for text, image for image/emoji
    pub fn for_message(message: &Message) -> Self {
        if message.kind.is_media() {
            AnalysisKind::Image
        } else {
            AnalysisKind::Text
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            AnalysisKind::Text => "text",
            AnalysisKind::Image => "image",
        }
    }

    fn check(&self, message: &Message) -> Result<(), AnnotationError> {
        match (self, message.kind) {
            (AnalysisKind::Text, MessageKind::Text) => {
                if message.payload.trim().is_empty() {
                    return Err(ValidationError::EmptyText.into());
                }
                Ok(())
            }
            (AnalysisKind::Image, MessageKind::Image | MessageKind::Emoji) => Ok(()),
            (kind, message_kind) => Err(AnnotationError::UnsupportedKind {
                kind: kind.as_str(),
                message_kind: message_kind.as_str(),
            }),
        }
    }
}

struct AnnotationJob {
    message_id: String,
    token: u64,
    kind: AnalysisKind,
    payload: String,
    context: Vec<String>,
}

#[derive(Clone)]
pub struct AnnotationCoordinator {
    store: MessageStore,
    backend: Arc<dyn ChatBackend>,
    role: Role,
    context_window: usize,
    next_token: Arc<AtomicU64>,
}

impl AnnotationCoordinator {
    /// `role` is the local participant's role, sent with every request
    pub fn new(store: MessageStore, backend: Arc<dyn ChatBackend>, role: Role, context_window: usize) -> Self {
        Self {
            store,
            backend,
            role,
            context_window,
            next_token: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Start an annotation request in the background.
    ///
    /// Returns `Ok(false)` without doing anything when one is already pending
    /// for this message. The outcome lands on the message in the store.
    pub async fn request_annotation(&self, message_id: &str, kind: AnalysisKind) -> Result<bool, AnnotationError> {
        let Some(job) = self.begin(message_id, kind).await? else {
            return Ok(false);
        };
        let coordinator = self.clone();
        tokio::spawn(async move {
            coordinator.run(job).await;
        });
        Ok(true)
    }

    /// Like `request_annotation`, but waits for the outcome.
    ///
    /// Returns the applied annotation, or `None` when the request was a no-op
    /// or its response turned out to be stale.
    pub async fn annotate(&self, message_id: &str, kind: AnalysisKind) -> Result<Option<Annotation>, AnnotationError> {
        match self.begin(message_id, kind).await? {
            Some(job) => Ok(self.run(job).await),
            None => Ok(None),
        }
    }

    async fn begin(&self, message_id: &str, kind: AnalysisKind) -> Result<Option<AnnotationJob>, AnnotationError> {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let started = self
            .store
            .begin_annotation(message_id, token, self.context_window, |m| kind.check(m))
            .await?;

        let Some((message, context)) = started else {
            debug!("Annotation for {} already pending, ignoring request", message_id);
            return Ok(None);
        };

        info!(
            "Requesting {} annotation for {} with {} context entries",
            kind.as_str(),
            message.id,
            context.len()
        );
        Ok(Some(AnnotationJob {
            message_id: message.id,
            token,
            kind,
            payload: message.payload,
            context,
        }))
    }

    async fn run(&self, job: AnnotationJob) -> Option<Annotation> {
        let response = match job.kind {
            AnalysisKind::Text => {
                let request = AnalyzeTextRequest {
                    text: job.payload,
                    role: self.role,
                    context: job.context,
                };
                self.backend.analyze_text(&request).await
            }
            AnalysisKind::Image => {
                let request = AnalyzeEmojiRequest {
                    image_url: job.payload,
                    role: self.role,
                    context: job.context,
                };
                self.backend.analyze_emoji(&request).await
            }
        };

        let annotation = match response {
            Ok(response) => response.into_annotation(),
            Err(e) => {
                warn!("Annotation request for {} failed: {}", job.message_id, e);
                Annotation::error(e.to_string())
            }
        };

        if self
            .store
            .complete_annotation(&job.message_id, job.token, annotation.clone())
            .await
        {
            debug!("Annotation for {} is now {:?}", job.message_id, annotation.state);
            Some(annotation)
        } else {
            debug!("Discarding stale annotation response for {}", job.message_id);
            None
        }
    }
}
