#![allow(dead_code)]
//! Test doubles shared by the integration tests: a scripted backend and a
//! local duplex server.
use agebridge_core::protocol::{AnalysisResponse, AnalyzeEmojiRequest, AnalyzeTextRequest, InboundFrame};
use agebridge_core::{ChatBackend, Config, MediaFile, Role, TransportError};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Instant};
use tokio_tungstenite::WebSocketStream;

pub type ServerSocket = WebSocketStream<TcpStream>;

/// Backend whose answers are set by the test
pub struct FakeBackend {
    pub history: Mutex<Vec<InboundFrame>>,
    pub history_delay: Mutex<Duration>,
    pub analysis: Mutex<Result<AnalysisResponse, TransportError>>,
    pub analysis_delay: Mutex<Duration>,
    pub upload: Mutex<Result<String, TransportError>>,
    pub emojis: Mutex<Vec<String>>,

    pub history_calls: AtomicUsize,
    pub upload_calls: AtomicUsize,
    pub analyze_calls: AtomicUsize,
    pub text_requests: Mutex<Vec<AnalyzeTextRequest>>,
    pub emoji_requests: Mutex<Vec<AnalyzeEmojiRequest>>,
}

impl Default for FakeBackend {
    fn default() -> Self {
        Self {
            history: Mutex::new(Vec::new()),
            history_delay: Mutex::new(Duration::ZERO),
            analysis: Mutex::new(Ok(AnalysisResponse::success("friendly greeting"))),
            analysis_delay: Mutex::new(Duration::ZERO),
            upload: Mutex::new(Ok("http://media.local/uploads/1.png".to_string())),
            emojis: Mutex::new(Vec::new()),
            history_calls: AtomicUsize::new(0),
            upload_calls: AtomicUsize::new(0),
            analyze_calls: AtomicUsize::new(0),
            text_requests: Mutex::new(Vec::new()),
            emoji_requests: Mutex::new(Vec::new()),
        }
    }
}

impl FakeBackend {
    pub fn set_history(&self, rows: &[&str]) {
        *self.history.lock().unwrap() = rows.iter().map(|r| InboundFrame::parse(r).unwrap()).collect();
    }

    pub fn set_analysis(&self, response: Result<AnalysisResponse, TransportError>) {
        *self.analysis.lock().unwrap() = response;
    }

    pub fn set_analysis_delay(&self, delay: Duration) {
        *self.analysis_delay.lock().unwrap() = delay;
    }

    pub fn history_calls(&self) -> usize {
        self.history_calls.load(Ordering::SeqCst)
    }

    pub fn upload_calls(&self) -> usize {
        self.upload_calls.load(Ordering::SeqCst)
    }

    pub fn analyze_calls(&self) -> usize {
        self.analyze_calls.load(Ordering::SeqCst)
    }

    async fn analysis_outcome(&self) -> Result<AnalysisResponse, TransportError> {
        self.analyze_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.analysis_delay.lock().unwrap();
        sleep(delay).await;
        self.analysis.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChatBackend for FakeBackend {
    async fn fetch_history(&self, _pair_id: &str) -> Result<Vec<InboundFrame>, TransportError> {
        self.history_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.history_delay.lock().unwrap();
        sleep(delay).await;
        Ok(self.history.lock().unwrap().clone())
    }

    async fn upload_image(&self, _file: &MediaFile) -> Result<String, TransportError> {
        self.upload_calls.fetch_add(1, Ordering::SeqCst);
        self.upload.lock().unwrap().clone()
    }

    async fn analyze_text(&self, request: &AnalyzeTextRequest) -> Result<AnalysisResponse, TransportError> {
        self.text_requests.lock().unwrap().push(request.clone());
        self.analysis_outcome().await
    }

    async fn analyze_emoji(&self, request: &AnalyzeEmojiRequest) -> Result<AnalysisResponse, TransportError> {
        self.emoji_requests.lock().unwrap().push(request.clone());
        self.analysis_outcome().await
    }

    async fn search_emojis(&self, _text: &str, limit: usize) -> Result<Vec<String>, TransportError> {
        Ok(self.emojis.lock().unwrap().iter().take(limit).cloned().collect())
    }
}

/// Local duplex server; every accepted socket is handed to the test
pub struct TestServer {
    pub addr: SocketAddr,
    pub connections: mpsc::UnboundedReceiver<ServerSocket>,
}

impl TestServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                if let Ok(ws) = tokio_tungstenite::accept_async(stream).await {
                    if tx.send(ws).is_err() {
                        break;
                    }
                }
            }
        });
        Self {
            addr,
            connections: rx,
        }
    }

    pub async fn next_connection(&mut self) -> ServerSocket {
        timeout(Duration::from_secs(5), self.connections.recv())
            .await
            .expect("no client connected in time")
            .expect("server stopped")
    }
}

pub fn test_config(server: SocketAddr, role: Role) -> Config {
    Config {
        server: server.to_string(),
        role,
        pair_id: "9".to_string(),
        reconnect_delay: Duration::from_millis(100),
        connect_timeout: Duration::from_secs(2),
        ..Default::default()
    }
}

/// Poll `check` until it holds or five seconds pass
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if check().await {
            return;
        }
        sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {}", what);
}
