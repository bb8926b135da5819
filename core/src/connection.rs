/// Duplex connection lifecycle with fixed-delay reconnect
///
/// One persistent connection per local identity. Every attempt opens a fresh
/// socket with its own writer queue and generation number; a dropped link is
/// re-established after `reconnect_delay`, indefinitely, until shutdown.
use crate::config::Config;
use crate::error::NotReadyError;
use crate::identity::Identity;
use crate::protocol::Envelope;
use futures_util::stream::StreamExt;
use futures_util::SinkExt;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Never connected, or shut down
    Disconnected,
    /// Attempt in progress
    Connecting,
    /// Ready to send
    Open,
    /// Dropped; a new attempt follows after the reconnect delay
    Closed,
}

/// Events delivered to the session controller
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Opened { generation: u64 },
    Message { generation: u64, text: String },
    Closed { generation: u64 },
    Error { message: String },
    /// The envelope with this id was written to the socket
    Delivered { id: String },
    /// The envelope with this id was queued but never written
    SendFailed { id: String },
}

/// Anything that can carry an envelope to the peer
pub trait Transport: Send + Sync {
    /// Queue an envelope. Fails fast when the connection is not open.
    fn send(&self, envelope: &Envelope) -> Result<(), NotReadyError>;

    fn state(&self) -> ConnectionState;
}

struct Shared {
    state: watch::Sender<ConnectionState>,
    /// Present exactly while the state is `Open`
    outbound: Mutex<Option<mpsc::UnboundedSender<Envelope>>>,
    generation: AtomicU64,
}

impl Shared {
    fn outbound(&self) -> MutexGuard<'_, Option<mpsc::UnboundedSender<Envelope>>> {
        self.outbound.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }
}

/// Handle to the managed connection
#[derive(Clone)]
pub struct ConnectionHandle {
    identity: String,
    shared: Arc<Shared>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl ConnectionHandle {
    /// Start managing the connection for `identity`.
    ///
    /// Returns the handle, the receiving end of the event stream, and the
    /// background task driving connect/reconnect.
    pub fn connect(
        identity: &Identity,
        config: &Config,
    ) -> (Self, mpsc::UnboundedReceiver<ConnectionEvent>, JoinHandle<()>) {
        let url = config.ws_url(identity);
        Self::connect_url(identity, url, config.connect_timeout, config.reconnect_delay)
    }

    pub fn connect_url(
        identity: &Identity,
        url: String,
        connect_timeout: Duration,
        reconnect_delay: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<ConnectionEvent>, JoinHandle<()>) {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(Shared {
            state,
            outbound: Mutex::new(None),
            generation: AtomicU64::new(0),
        });

        let handle = Self {
            identity: identity.local_id().to_string(),
            shared: shared.clone(),
            shutdown: Arc::new(shutdown),
        };

        let connector = Connector {
            url,
            connect_timeout,
            reconnect_delay,
            shared,
            events: events_tx,
        };
        let task = tokio::spawn(connector.run(shutdown_rx));

        (handle, events_rx, task)
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Ready/not-ready signal
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Generation of the most recently opened link (0 before the first open)
    pub fn generation(&self) -> u64 {
        self.shared.generation.load(Ordering::SeqCst)
    }

    /// Resolve once the connection is open
    pub async fn wait_open(&self) {
        let mut rx = self.watch_state();
        let _ = rx.wait_for(|state| *state == ConnectionState::Open).await;
    }

    /// Stop reconnecting and close the current link
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }
}

impl Transport for ConnectionHandle {
    fn send(&self, envelope: &Envelope) -> Result<(), NotReadyError> {
        let outbound = self.shared.outbound();
        match outbound.as_ref() {
            Some(tx) => tx.send(envelope.clone()).map_err(|_| NotReadyError),
            None => Err(NotReadyError),
        }
    }

    fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }
}

struct Connector {
    url: String,
    connect_timeout: Duration,
    reconnect_delay: Duration,
    shared: Arc<Shared>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
}

impl Connector {
    fn emit(&self, event: ConnectionEvent) {
        if self.events.send(event).is_err() {
            debug!("Connection event dropped, no listener");
        }
    }

    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }

            self.shared.set_state(ConnectionState::Connecting);
            debug!("Connecting to {}", self.url);

            let attempt = tokio::select! {
                result = timeout(self.connect_timeout, connect_async(self.url.as_str())) => result,
                _ = shutdown.changed() => break,
            };

            match attempt {
                Ok(Ok((ws, _response))) => {
                    let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
                    info!("Connected to {} (generation {})", self.url, generation);
                    self.run_link(ws, generation, &mut shutdown).await;
                }
                Ok(Err(e)) => {
                    warn!("Failed to connect to {}: {}", self.url, e);
                    self.shared.set_state(ConnectionState::Closed);
                    self.emit(ConnectionEvent::Error {
                        message: e.to_string(),
                    });
                }
                Err(_) => {
                    warn!("Connection timeout to {}", self.url);
                    self.shared.set_state(ConnectionState::Closed);
                    self.emit(ConnectionEvent::Error {
                        message: format!("connection attempt timed out after {:?}", self.connect_timeout),
                    });
                }
            }

            if *shutdown.borrow() {
                break;
            }
            info!("Reconnecting in {:?}", self.reconnect_delay);
            tokio::select! {
                _ = sleep(self.reconnect_delay) => {}
                _ = shutdown.changed() => break,
            }
        }

        self.shared.outbound().take();
        self.shared.set_state(ConnectionState::Disconnected);
        info!("Connection manager for {} stopped", self.url);
    }

    /// Drive one open link until it closes
    async fn run_link(&self, ws: WsStream, generation: u64, shutdown: &mut watch::Receiver<bool>) {
        let (mut write, mut read) = ws.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Envelope>();

        {
            let mut outbound = self.shared.outbound();
            *outbound = Some(tx);
            self.shared.set_state(ConnectionState::Open);
        }
        self.emit(ConnectionEvent::Opened { generation });

        let events = self.events.clone();
        let writer = tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                let id = envelope.id.clone();
                let text = match envelope.to_json() {
                    Ok(text) => text,
                    Err(e) => {
                        error!("Failed to serialize envelope {}: {}", id, e);
                        let _ = events.send(ConnectionEvent::SendFailed { id });
                        continue;
                    }
                };
                match write.send(WsMessage::Text(text)).await {
                    Ok(()) => {
                        debug!("Envelope {} written", id);
                        let _ = events.send(ConnectionEvent::Delivered { id });
                    }
                    Err(e) => {
                        warn!("Write failed for envelope {}: {}", id, e);
                        let _ = events.send(ConnectionEvent::SendFailed { id });
                        break;
                    }
                }
            }
            // Anything still queued never reached the socket
            rx.close();
            while let Ok(envelope) = rx.try_recv() {
                let _ = events.send(ConnectionEvent::SendFailed { id: envelope.id });
            }
            let _ = write.close().await;
        });

        loop {
            tokio::select! {
                frame = read.next() => match frame {
                    Some(Ok(WsMessage::Text(text))) => {
                        self.emit(ConnectionEvent::Message { generation, text });
                    }
                    Some(Ok(WsMessage::Binary(data))) => match String::from_utf8(data) {
                        Ok(text) => self.emit(ConnectionEvent::Message { generation, text }),
                        Err(_) => warn!("Dropping non UTF-8 binary frame"),
                    },
                    Some(Ok(WsMessage::Close(reason))) => {
                        info!("Server closed connection: {:?}", reason);
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("Connection error: {}", e);
                        self.emit(ConnectionEvent::Error { message: e.to_string() });
                        break;
                    }
                    None => {
                        debug!("Connection stream ended");
                        break;
                    }
                },
                _ = shutdown.changed() => {
                    info!("Shutdown requested, closing connection");
                    break;
                }
            }
        }

        {
            let mut outbound = self.shared.outbound();
            outbound.take();
            self.shared.set_state(ConnectionState::Closed);
        }
        if writer.await.is_err() {
            error!("Writer task for generation {} panicked", generation);
        }
        self.emit(ConnectionEvent::Closed { generation });
    }
}
