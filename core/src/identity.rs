/// Participant identity: role + pairing
///
/// Each conversation pairs one elder with one young participant. Both sides
/// derive their ids from the shared pair id, so `elder_42` always talks to
/// `young_42` and the two never drift apart during a session.
use crate::error::{ChatError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Which side of the pair this participant is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Elder,
    Young,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Elder => "elder",
            Role::Young => "young",
        }
    }

    /// The role on the other side of the conversation
    pub fn peer(&self) -> Role {
        match self {
            Role::Elder => Role::Young,
            Role::Young => Role::Elder,
        }
    }

    /// Infer a role from a sender id such as `elder_42`.
    ///
    /// Anything not recognisably an elder (including `unknown`) is treated as young.
    pub fn infer_from_sender(sender: &str) -> Role {
        if sender == "elder" || sender.starts_with("elder_") {
            Role::Elder
        } else {
            Role::Young
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = ChatError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "elder" => Ok(Role::Elder),
            "young" => Ok(Role::Young),
            other => Err(ChatError::Config(format!(
                "Unknown role '{}', expected 'elder' or 'young'",
                other
            ))),
        }
    }
}

/// Local identity for one session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    role: Role,
    pair_id: String,
    local_id: String,
    peer_id: String,
}

impl Identity {
    pub fn new(role: Role, pair_id: impl Into<String>) -> Self {
        let pair_id = pair_id.into();
        let local_id = format!("{}_{}", role, pair_id);
        let peer_id = format!("{}_{}", role.peer(), pair_id);
        Self {
            role,
            pair_id,
            local_id,
            peer_id,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn pair_id(&self) -> &str {
        &self.pair_id
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }
}
