/// Local cache of the message log, stored in sled
/// One snapshot per conversation, keyed `log:{pair_id}`
use crate::error::{ChatError, Result};
use crate::message::{Annotation, DeliveryState, Message};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Clone)]
pub struct MessageCache {
    db: Arc<sled::Db>,
}

impl MessageCache {
    /// Open (or create) the cache in `data_dir`
    pub fn new(data_dir: &Path) -> Result<Self> {
        let db_path = data_dir.join("messages.db");
        let db = sled::open(&db_path)
            .map_err(|e| ChatError::Storage(format!("Failed to open message cache: {}", e)))?;

        info!("Message cache opened at {:?}", db_path);
        Ok(Self { db: Arc::new(db) })
    }

    fn key(pair_id: &str) -> String {
        format!("log:{}", pair_id)
    }

    /// Replace the cached log for `pair_id`
    pub fn save(&self, pair_id: &str, messages: &[Message]) -> Result<()> {
        let value = serde_json::to_vec(messages)?;

        self.db
            .insert(Self::key(pair_id).as_bytes(), value)
            .map_err(|e| ChatError::Storage(format!("Failed to save messages: {}", e)))?;
        self.db
            .flush()
            .map_err(|e| ChatError::Storage(format!("Failed to flush message cache: {}", e)))?;

        debug!("Cached {} messages for pair {}", messages.len(), pair_id);
        Ok(())
    }

    /// Cached log for `pair_id`, empty if nothing was saved.
    ///
    /// Requests in flight when the snapshot was taken died with that process:
    /// pending annotations come back as none, pending deliveries as failed.
    pub fn load(&self, pair_id: &str) -> Result<Vec<Message>> {
        let value = match self.db.get(Self::key(pair_id).as_bytes()) {
            Ok(Some(value)) => value,
            Ok(None) => return Ok(Vec::new()),
            Err(e) => return Err(ChatError::Storage(format!("Failed to load messages: {}", e))),
        };

        let mut messages: Vec<Message> = serde_json::from_slice(&value)?;
        for message in &mut messages {
            if message.annotation.is_pending() {
                message.annotation = Annotation::default();
            }
            if message.delivery == DeliveryState::Pending {
                message.delivery = DeliveryState::Failed;
            }
        }
        Ok(messages)
    }
}
