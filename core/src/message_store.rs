/// Message log: ordered, deduplicated, append/update only
///
/// Display order is arrival order. Every operation takes the lock once, so a
/// check followed by a write (dedup, none→pending) is one critical section.
use crate::error::AnnotationError;
use crate::message::{Annotation, DeliveryState, Message, StoreEvent};
use crate::protocol::{InboundFrame, MEDIA_PLACEHOLDER};
use crate::error::Result;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, warn};

const EVENT_CAPACITY: usize = 256;

#[derive(Default)]
struct StoreInner {
    messages: Vec<Message>,
    index: HashMap<String, usize>,
}

impl StoreInner {
    fn get_mut(&mut self, id: &str) -> Option<&mut Message> {
        let pos = *self.index.get(id)?;
        self.messages.get_mut(pos)
    }

    fn push(&mut self, message: Message) {
        self.index.insert(message.id.clone(), self.messages.len());
        self.messages.push(message);
    }
}

#[derive(Clone)]
pub struct MessageStore {
    inner: Arc<RwLock<StoreInner>>,
    events: broadcast::Sender<StoreEvent>,
}

impl Default for MessageStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(RwLock::new(StoreInner::default())),
            events,
        }
    }

    /// Subscribe to change notifications
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    fn publish(&self, event: StoreEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// Replace the whole log with a server snapshot.
    ///
    /// Later duplicates of an id inside the snapshot are dropped.
    pub async fn ingest_history(&self, snapshot: Vec<Message>) {
        self.ingest_history_if(snapshot, || true).await;
    }

    /// `ingest_history`, but only if `current()` still holds once the lock is taken.
    ///
    /// Returns false (and changes nothing) when the snapshot was refused.
    pub(crate) async fn ingest_history_if<F>(&self, snapshot: Vec<Message>, current: F) -> bool
    where
        F: FnOnce() -> bool,
    {
        let count = {
            let mut inner = self.inner.write().await;
            if !current() {
                return false;
            }
            let mut fresh = StoreInner::default();
            for message in snapshot {
                if fresh.index.contains_key(&message.id) {
                    warn!("History snapshot repeats message id {}, keeping the first", message.id);
                    continue;
                }
                fresh.push(message);
            }
            *inner = fresh;
            inner.messages.len()
        };
        debug!("Message log replaced with {} history entries", count);
        self.publish(StoreEvent::Replaced { count });
        true
    }

    /// Normalize and append a frame pushed by the server.
    ///
    /// A frame whose id is already present does not create a second entry; the
    /// existing entry is returned. An echo of our own pending message confirms it.
    pub async fn ingest_live(&self, frame: InboundFrame) -> Result<Message> {
        let incoming = frame.normalize(Utc::now(), DeliveryState::Acknowledged)?;
        let mut inner = self.inner.write().await;

        if let Some(existing) = inner.get_mut(&incoming.id) {
            debug!("Duplicate live frame {} ignored", incoming.id);
            if existing.delivery == DeliveryState::Pending {
                existing.delivery = DeliveryState::Acknowledged;
                let updated = existing.clone();
                drop(inner);
                self.publish(StoreEvent::Updated {
                    message: updated.clone(),
                });
                return Ok(updated);
            }
            return Ok(existing.clone());
        }

        inner.push(incoming.clone());
        drop(inner);
        self.publish(StoreEvent::Appended {
            message: incoming.clone(),
        });
        Ok(incoming)
    }

    /// Optimistic insert of a locally originated message
    pub async fn append_local(&self, message: Message) -> Message {
        match self
            .append_local_after(message, || Ok::<(), std::convert::Infallible>(()))
            .await
        {
            Ok(message) => message,
            Err(never) => match never {},
        }
    }

    /// Run `transmit`, then insert `message` if it succeeded.
    ///
    /// Both happen under the store lock, so a delivery report for this id can
    /// never be applied before the entry exists. On failure the store is unchanged.
    pub async fn append_local_after<F, E>(&self, message: Message, transmit: F) -> std::result::Result<Message, E>
    where
        F: FnOnce() -> std::result::Result<(), E>,
    {
        let mut inner = self.inner.write().await;
        if let Some(existing) = inner.index.get(&message.id).and_then(|&pos| inner.messages.get(pos)) {
            warn!("Local message id {} already in the log, not overwriting", message.id);
            return Ok(existing.clone());
        }

        transmit()?;

        inner.push(message.clone());
        drop(inner);
        self.publish(StoreEvent::Appended {
            message: message.clone(),
        });
        Ok(message)
    }

    /// Snapshot of the log in display order
    pub async fn get(&self) -> Vec<Message> {
        self.inner.read().await.messages.clone()
    }

    pub async fn get_message(&self, id: &str) -> Option<Message> {
        let inner = self.inner.read().await;
        inner.index.get(id).and_then(|&pos| inner.messages.get(pos)).cloned()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.messages.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.messages.is_empty()
    }

    /// Overwrite the annotation of a message. Returns false for unknown ids.
    pub async fn update_annotation(&self, id: &str, annotation: Annotation) -> bool {
        let mut inner = self.inner.write().await;
        let Some(message) = inner.get_mut(id) else {
            return false;
        };
        message.annotation = annotation;
        let updated = message.clone();
        drop(inner);
        self.publish(StoreEvent::Updated { message: updated });
        true
    }

    /// Move a pending message to `state`. Messages no longer pending are left alone.
    pub async fn set_delivery(&self, id: &str, state: DeliveryState) -> bool {
        let mut inner = self.inner.write().await;
        let Some(message) = inner.get_mut(id) else {
            debug!("Delivery report for {} has no matching message", id);
            return false;
        };
        if message.delivery != DeliveryState::Pending || state == DeliveryState::Pending {
            return false;
        }
        message.delivery = state;
        let updated = message.clone();
        drop(inner);
        self.publish(StoreEvent::Updated { message: updated });
        true
    }

    /// Atomically move a message's annotation to pending.
    ///
    /// Returns `Ok(None)` when a request is already pending for this message.
    /// Otherwise `check` is run against the target before the transition and
    /// the target plus up to `window` context entries are returned.
    pub(crate) async fn begin_annotation<F>(
        &self,
        id: &str,
        token: u64,
        window: usize,
        check: F,
    ) -> std::result::Result<Option<(Message, Vec<String>)>, AnnotationError>
    where
        F: FnOnce(&Message) -> std::result::Result<(), AnnotationError>,
    {
        let mut inner = self.inner.write().await;
        let pos = *inner
            .index
            .get(id)
            .ok_or_else(|| AnnotationError::UnknownMessage(id.to_string()))?;

        let target = &inner.messages[pos];
        if target.annotation.is_pending() {
            return Ok(None);
        }
        check(target)?;

        let context = context_for(&inner.messages, id, window);
        let message = &mut inner.messages[pos];
        message.annotation = Annotation::pending(token);
        let updated = message.clone();
        drop(inner);

        self.publish(StoreEvent::Updated {
            message: updated.clone(),
        });
        Ok(Some((updated, context)))
    }

    /// Apply a finished annotation if `token` still owns the pending request.
    ///
    /// Returns false (and changes nothing) for stale completions.
    pub(crate) async fn complete_annotation(&self, id: &str, token: u64, annotation: Annotation) -> bool {
        let mut inner = self.inner.write().await;
        let Some(message) = inner.get_mut(id) else {
            return false;
        };
        if !message.annotation.is_pending() || message.annotation.request_token != Some(token) {
            return false;
        }
        message.annotation = annotation;
        let updated = message.clone();
        drop(inner);
        self.publish(StoreEvent::Updated { message: updated });
        true
    }
}

/// The latest `window` messages of the log, in arrival order, minus `target_id`.
///
/// The target keeps its slot if it is among them, so the context then holds
/// at most `window - 1` entries.
fn context_for(messages: &[Message], target_id: &str, window: usize) -> Vec<String> {
    let start = messages.len().saturating_sub(window);
    messages[start..]
        .iter()
        .filter(|m| m.id != target_id)
        .map(|m| {
            if m.is_text() {
                m.payload.clone()
            } else {
                MEDIA_PLACEHOLDER.to_string()
            }
        })
        .collect()
}
