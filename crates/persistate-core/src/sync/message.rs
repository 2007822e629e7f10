//! Sync message types
//!
//! Messages exchanged between contexts, encoded as JSON:
//!
//! ```text
//! {"type": "state-update", "state": {...}, "action": "add", "timestamp": 1700000000000}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Messages published on a sync channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SyncMessage {
    /// Full state after a local commit
    #[serde(rename = "state-update")]
    StateUpdate {
        state: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        action: Option<String>,
        /// Milliseconds since the Unix epoch
        timestamp: i64,
    },
}

impl SyncMessage {
    /// Create a state update stamped with the current time
    pub fn state_update(state: Value, action: Option<&str>) -> Self {
        SyncMessage::StateUpdate {
            state,
            action: action.map(str::to_string),
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn decode(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}
