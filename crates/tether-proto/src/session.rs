use serde::{Deserialize, Serialize};

/// Durable session status. `Closed` is terminal: a closed session can only
/// be brought back by deleting and recreating it under the same id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Disconnected,
    Closed,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Disconnected => "disconnected",
            SessionStatus::Closed => "closed",
        }
    }

    /// Parse the stored/wire representation. Anything else is invalid input.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(SessionStatus::Active),
            "disconnected" => Some(SessionStatus::Disconnected),
            "closed" => Some(SessionStatus::Closed),
            _ => None,
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted terminal session a user can return to.
///
/// `occupied` is derived from the gateway's bind table when the record
/// crosses the API; it is never stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    /// Opaque, client-assigned, unique.
    pub id: String,
    /// Names the bound process; unique while that process lives.
    pub backend_id: String,
    pub title: String,
    pub status: SessionStatus,
    pub cols: u16,
    pub rows: u16,
    pub created_at: String,
    pub last_connected_at: String,
    /// True iff a live connection currently holds `backend_id`.
    #[serde(default)]
    pub occupied: bool,
}
