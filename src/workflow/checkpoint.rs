//! Persisted per-message workflow snapshots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::state::WorkflowNode;
use super::types::{Disposition, Message};

/// One prior message shown to the classifier and the generator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub sender: String,
    pub text: String,
    pub received_at: DateTime<Utc>,
}

impl From<&Message> for HistoryEntry {
    fn from(message: &Message) -> Self {
        Self {
            sender: message.sender.clone(),
            text: message.text.clone(),
            received_at: message.received_at,
        }
    }
}

/// Everything a later run needs to pick up where the previous one stopped.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointContext {
    /// Oldest first, bounded by the history window.
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disposition: Option<Disposition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,
    /// Generated reply for a Notify message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub draft_reply: Option<String>,
    /// Text supplied by a person for a Respond message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub human_reply: Option<String>,
}

/// The single outstanding checkpoint for a message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub message_id: String,
    pub node: WorkflowNode,
    pub context: CheckpointContext,
    /// Starts at 1 and increases by one on every successful save.
    pub version: i64,
    pub updated_at: DateTime<Utc>,
}
