/// Session controller: one identity, one connection, one message log
///
/// Wires the connection events into the store, triggers a history refresh on
/// every (re)open, persists the log when a cache directory is configured, and
/// exposes the outbound intents: send text, send media, send emoji, request
/// annotation, suggest emojis.
use crate::annotation::{AnalysisKind, AnnotationCoordinator};
use crate::backend::{ChatBackend, HttpBackend};
use crate::cache::MessageCache;
use crate::config::Config;
use crate::connection::{ConnectionEvent, ConnectionHandle, ConnectionState, Transport};
use crate::error::{AnnotationError, Result, SendError, UploadError};
use crate::identity::Identity;
use crate::media::{self, MediaFile, UploadConstraints};
use crate::message::{DeliveryState, Message, StoreEvent};
use crate::message_store::MessageStore;
use crate::protocol::InboundFrame;
use crate::send;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const EVENT_CAPACITY: usize = 256;

/// Events for the presentation layer
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    Connected { generation: u64 },
    Disconnected { generation: u64 },
    ConnectionError { message: String },
    HistoryLoaded { generation: u64, count: usize },
    HistoryFailed { generation: u64, error: String },
    Store { event: StoreEvent },
}

#[derive(Clone)]
pub struct ChatSession {
    config: Config,
    identity: Identity,
    store: MessageStore,
    connection: ConnectionHandle,
    backend: Arc<dyn ChatBackend>,
    annotations: AnnotationCoordinator,
    events: broadcast::Sender<SessionEvent>,
    /// Connection generation whose history refresh may still be applied
    history_generation: Arc<AtomicU64>,
    history_fetches: Arc<AtomicU64>,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl ChatSession {
    /// Start a session against the HTTP backend named in `config`
    pub async fn start(config: Config) -> Result<Self> {
        let backend = Arc::new(HttpBackend::new(&config)?);
        Self::start_with_backend(config, backend).await
    }

    pub async fn start_with_backend(config: Config, backend: Arc<dyn ChatBackend>) -> Result<Self> {
        config.validate()?;
        let identity = config.identity();
        let store = MessageStore::new();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let mut tasks = Vec::new();

        if let Some(dir) = &config.data_dir {
            std::fs::create_dir_all(dir)?;
            let cache = MessageCache::new(dir)?;
            let cached = cache.load(identity.pair_id())?;
            if !cached.is_empty() {
                info!("Restored {} cached messages for pair {}", cached.len(), identity.pair_id());
                store.ingest_history(cached).await;
            }
            tasks.push(tokio::spawn(persist_changes(
                store.clone(),
                cache,
                identity.pair_id().to_string(),
            )));
        }

        tasks.push(tokio::spawn(forward_store_events(store.subscribe(), events.clone())));

        let (connection, connection_events, connector) = ConnectionHandle::connect(&identity, &config);
        tasks.push(connector);

        let annotations = AnnotationCoordinator::new(
            store.clone(),
            backend.clone(),
            identity.role(),
            config.context_window,
        );

        info!("Session started for {} (peer {})", identity.local_id(), identity.peer_id());

        let session = Self {
            config,
            identity,
            store,
            connection,
            backend,
            annotations,
            events,
            history_generation: Arc::new(AtomicU64::new(0)),
            history_fetches: Arc::new(AtomicU64::new(0)),
            tasks: Arc::new(Mutex::new(tasks)),
        };

        let driver = {
            let session = session.clone();
            tokio::spawn(async move { session.run_events(connection_events).await })
        };
        session.track(driver);

        Ok(session)
    }

    fn track(&self, task: JoinHandle<()>) {
        self.tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(task);
    }

    fn publish(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &MessageStore {
        &self.store
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub async fn messages(&self) -> Vec<Message> {
        self.store.get().await
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub async fn wait_connected(&self) {
        self.connection.wait_open().await
    }

    /// Number of history fetches issued so far
    pub fn history_fetches(&self) -> u64 {
        self.history_fetches.load(Ordering::SeqCst)
    }

    // ─── Intents ─────────────────────────────────────────────────────────────

    pub async fn send_text(&self, text: &str) -> std::result::Result<Message, SendError> {
        send::send_text(&self.store, &self.connection, text, &self.identity).await
    }

    pub async fn send_image(&self, file: &MediaFile) -> std::result::Result<Message, UploadError> {
        let constraints = UploadConstraints::from_config(&self.config);
        media::upload_and_send(
            file,
            &constraints,
            &self.store,
            &self.connection,
            self.backend.as_ref(),
            &self.identity,
        )
        .await
    }

    pub async fn send_image_path(&self, path: &Path) -> Result<Message> {
        let file = MediaFile::from_path(path).await?;
        Ok(self.send_image(&file).await?)
    }

    pub async fn send_emoji(&self, emoji_url: &str) -> std::result::Result<Message, SendError> {
        media::send_emoji(&self.store, &self.connection, emoji_url, &self.identity).await
    }

    pub async fn suggest_emojis(&self, text: &str) -> Result<Vec<String>> {
        media::suggest_emojis(self.backend.as_ref(), text, self.config.emoji_limit).await
    }

    /// Request analysis of a message, choosing text or image analysis from its kind
    pub async fn request_annotation(&self, message_id: &str) -> std::result::Result<bool, AnnotationError> {
        let message = self
            .store
            .get_message(message_id)
            .await
            .ok_or_else(|| AnnotationError::UnknownMessage(message_id.to_string()))?;
        self.annotations
            .request_annotation(message_id, AnalysisKind::for_message(&message))
            .await
    }

    pub fn annotations(&self) -> &AnnotationCoordinator {
        &self.annotations
    }

    /// Stop reconnecting and stop background tasks
    pub fn shutdown(&self) {
        info!("Shutting down session for {}", self.identity.local_id());
        self.connection.shutdown();
        let tasks = std::mem::take(
            &mut *self
                .tasks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        for task in tasks {
            task.abort();
        }
    }

    // ─── Event loop ──────────────────────────────────────────────────────────

    async fn run_events(self, mut events: mpsc::UnboundedReceiver<ConnectionEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                ConnectionEvent::Opened { generation } => {
                    self.publish(SessionEvent::Connected { generation });
                    self.refresh_history(generation);
                }
                ConnectionEvent::Message { text, .. } => self.handle_frame(&text).await,
                ConnectionEvent::Closed { generation } => {
                    warn!("Connection generation {} closed", generation);
                    self.publish(SessionEvent::Disconnected { generation });
                }
                ConnectionEvent::Error { message } => {
                    self.publish(SessionEvent::ConnectionError { message });
                }
                ConnectionEvent::Delivered { id } => {
                    self.store.set_delivery(&id, DeliveryState::Acknowledged).await;
                }
                ConnectionEvent::SendFailed { id } => {
                    warn!("Message {} was not delivered", id);
                    self.store.set_delivery(&id, DeliveryState::Failed).await;
                }
            }
        }
        debug!("Connection event stream ended");
    }

    async fn handle_frame(&self, text: &str) {
        let frame = match InboundFrame::parse(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Dropping frame: {}", e);
                return;
            }
        };
        match self.store.ingest_live(frame).await {
            Ok(message) => debug!("Received {} message {} from {}", message.kind, message.id, message.from),
            Err(e) => warn!("Dropping frame: {}", e),
        }
    }

    /// Fetch a fresh snapshot for this connection generation.
    ///
    /// If a newer connection opens before the fetch completes, the result is discarded.
    fn refresh_history(&self, generation: u64) {
        self.history_generation.store(generation, Ordering::SeqCst);
        let session = self.clone();
        let task = tokio::spawn(async move {
            session.history_fetches.fetch_add(1, Ordering::SeqCst);
            debug!("Fetching history for generation {}", generation);

            let rows = match session.backend.fetch_history(session.identity.pair_id()).await {
                Ok(rows) => rows,
                Err(e) => {
                    warn!("History fetch failed: {}", e);
                    session.publish(SessionEvent::HistoryFailed {
                        generation,
                        error: e.to_string(),
                    });
                    return;
                }
            };

            let now = Utc::now();
            let snapshot: Vec<Message> = rows
                .into_iter()
                .filter_map(|row| match row.normalize(now, DeliveryState::Acknowledged) {
                    Ok(message) => Some(message),
                    Err(e) => {
                        warn!("Skipping history row: {}", e);
                        None
                    }
                })
                .collect();

            let count = snapshot.len();
            let latest = &session.history_generation;
            let applied = session
                .store
                .ingest_history_if(snapshot, || latest.load(Ordering::SeqCst) == generation)
                .await;
            if !applied {
                info!("History for generation {} superseded, discarding", generation);
                return;
            }
            info!("Loaded {} history messages (generation {})", count, generation);
            session.publish(SessionEvent::HistoryLoaded { generation, count });
        });
        self.track(task);
    }
}

async fn forward_store_events(mut rx: broadcast::Receiver<StoreEvent>, events: broadcast::Sender<SessionEvent>) {
    loop {
        match rx.recv().await {
            Ok(event) => {
                let _ = events.send(SessionEvent::Store { event });
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!("Store event forwarder lagged {} events", n);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Rewrite the cached snapshot after every store change
async fn persist_changes(store: MessageStore, cache: MessageCache, pair_id: String) {
    let mut rx = store.subscribe();
    loop {
        match rx.recv().await {
            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {
                let snapshot = store.get().await;
                let cache = cache.clone();
                let pair_id = pair_id.clone();
                let saved = tokio::task::spawn_blocking(move || cache.save(&pair_id, &snapshot)).await;
                match saved {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!("Failed to cache messages: {}", e),
                    Err(e) => error!("Cache writer task failed: {}", e),
                }
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
