/// Configuration management
use crate::error::{ChatError, Result};
use crate::identity::{Identity, Role};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_SERVER: &str = "127.0.0.1:8000";
const DEFAULT_MAX_UPLOAD_BYTES: u64 = 10 * 1024 * 1024;

/// Session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Backend host and port, without scheme
    pub server: String,

    /// Use https/wss instead of http/ws
    pub tls: bool,

    /// Local participant role
    pub role: Role,

    /// Conversation shared by both participants
    pub pair_id: String,

    /// Fixed delay before re-establishing a dropped connection
    pub reconnect_delay: Duration,

    /// Timeout for a single connection attempt
    pub connect_timeout: Duration,

    /// Timeout for request/response calls
    pub request_timeout: Duration,

    /// Largest media file accepted for upload
    pub max_upload_bytes: u64,

    /// Mime prefix accepted for upload
    pub allowed_mime_prefix: String,

    /// Number of recent messages sent as analysis context
    pub context_window: usize,

    /// Number of emoji suggestions requested
    pub emoji_limit: usize,

    /// Optional directory for the local message cache (no cache when unset)
    pub data_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: DEFAULT_SERVER.to_string(),
            tls: false,
            role: Role::Elder,
            pair_id: "1".to_string(),
            reconnect_delay: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            allowed_mime_prefix: "image/".to_string(),
            context_window: 5,
            emoji_limit: 5,
            data_dir: None,
        }
    }
}

impl Config {
    /// Create config from command line arguments
    pub fn from_args(args: &[String]) -> Result<Self> {
        if args.len() < 2 {
            return Err(ChatError::Config(format!(
                "Usage: {} <pair_id> [--role elder|young] [--server <host:port>] [--tls] [--data-dir <path>] [--reconnect-secs <n>]",
                args.first().map(String::as_str).unwrap_or("agebridge")
            )));
        }

        let pair_id = args[1].trim().to_string();
        if pair_id.is_empty() || pair_id.starts_with("--") {
            return Err(ChatError::Config("pair_id must be the first argument".to_string()));
        }

        let mut config = Self {
            pair_id,
            ..Default::default()
        };

        let mut i = 2;
        while i < args.len() {
            match args[i].as_str() {
                "--role" => {
                    let r = args.get(i + 1).ok_or_else(|| {
                        ChatError::Config("--role requires 'elder' or 'young'".to_string())
                    })?;
                    config.role = r.parse()?;
                    i += 2;
                }
                "--server" => {
                    let s = args.get(i + 1).ok_or_else(|| {
                        ChatError::Config("--server requires a host:port argument".to_string())
                    })?;
                    config.server = s.clone();
                    i += 2;
                }
                "--tls" => {
                    config.tls = true;
                    i += 1;
                }
                "--data-dir" => {
                    let path = args.get(i + 1).ok_or_else(|| {
                        ChatError::Config("--data-dir requires a path argument".to_string())
                    })?;
                    config.data_dir = Some(PathBuf::from(path));
                    i += 2;
                }
                "--reconnect-secs" => {
                    let n = args.get(i + 1).ok_or_else(|| {
                        ChatError::Config("--reconnect-secs requires a number".to_string())
                    })?;
                    let secs = n.parse::<u64>().map_err(|_| {
                        ChatError::Config("--reconnect-secs must be a whole number".to_string())
                    })?;
                    config.reconnect_delay = Duration::from_secs(secs);
                    i += 2;
                }
                other => {
                    return Err(ChatError::Config(format!("Unknown argument: {}", other)));
                }
            }
        }

        // Env overrides (nice for scripts)
        if let Ok(server) = std::env::var("AGEBRIDGE_SERVER") {
            config.server = server;
        }
        if let Ok(role) = std::env::var("AGEBRIDGE_ROLE") {
            config.role = role.parse()?;
        }
        if let Ok(dir) = std::env::var("AGEBRIDGE_DATA_DIR") {
            config.data_dir = Some(PathBuf::from(dir));
        }
        if std::env::var("AGEBRIDGE_TLS").is_ok() {
            config.tls = true;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let server = self.server.trim();
        if server.is_empty() || server.contains("://") || server.ends_with('/') {
            return Err(ChatError::Config(format!(
                "server must be a bare host:port, got '{}'",
                self.server
            )));
        }
        if self.context_window == 0 {
            return Err(ChatError::Config("context_window must be at least 1".to_string()));
        }
        Ok(())
    }

    pub fn identity(&self) -> Identity {
        Identity::new(self.role, self.pair_id.clone())
    }

    /// Base URL for request/response endpoints, e.g. `http://host:8000`
    pub fn http_base(&self) -> String {
        let scheme = if self.tls { "https" } else { "http" };
        format!("{}://{}", scheme, self.server)
    }

    /// Duplex endpoint for one identity, e.g. `ws://host:8000/ws/elder_42`
    pub fn ws_url(&self, identity: &Identity) -> String {
        let scheme = if self.tls { "wss" } else { "ws" };
        format!(
            "{}://{}/ws/{}",
            scheme,
            self.server,
            urlencoding::encode(identity.local_id())
        )
    }
}
