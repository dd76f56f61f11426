//! Shared types for the triage workflow.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Message status ──────────────────────────────────────────────────

/// Workflow status of a stored message.
///
/// The status column doubles as the claim lock: a row in `Processing` is owned
/// by exactly one workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    /// Ingested, never processed.
    New,
    /// Claimed by a driver cycle.
    Processing,
    /// Suspended until a person replies.
    AwaitingHuman,
    /// A person replied; waiting for the driver to resume.
    ResumeRequested,
    Completed,
    Failed,
}

impl MessageStatus {
    pub const ALL: [MessageStatus; 6] = [
        Self::New,
        Self::Processing,
        Self::AwaitingHuman,
        Self::ResumeRequested,
        Self::Completed,
        Self::Failed,
    ];

    /// Terminal statuses never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Statuses the driver may claim.
    pub fn is_claimable(&self) -> bool {
        matches!(self, Self::New | Self::ResumeRequested)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Processing => "processing",
            Self::AwaitingHuman => "awaiting_human",
            Self::ResumeRequested => "resume_requested",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MessageStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(Self::New),
            "processing" => Ok(Self::Processing),
            "awaiting_human" => Ok(Self::AwaitingHuman),
            "resume_requested" => Ok(Self::ResumeRequested),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown message status: '{other}'")),
        }
    }
}

// ── Disposition ─────────────────────────────────────────────────────

/// Classification outcome for a message.
///
/// "Unset" is modelled as `Option<Disposition>::None` on [`Message`]; the
/// classifier can only ever produce one of these three.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    /// Noise. Complete without any outbound call.
    Ignore,
    /// Worth acknowledging. Generate a reply and send it.
    Notify,
    /// Needs a person. Suspend until human feedback arrives.
    Respond,
}

impl Disposition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ignore => "ignore",
            Self::Notify => "notify",
            Self::Respond => "respond",
        }
    }
}

impl std::fmt::Display for Disposition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Disposition {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ignore" => Ok(Self::Ignore),
            "notify" => Ok(Self::Notify),
            "respond" => Ok(Self::Respond),
            other => Err(format!("unknown disposition: '{other}'")),
        }
    }
}

// ── Message ─────────────────────────────────────────────────────────

/// A message as handed over by the ingestion collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewMessage {
    /// Platform-native id. Used as the dedup key.
    pub external_id: String,
    pub channel: String,
    pub sender: String,
    pub text: String,
    /// Thread the message belongs to, if it was posted in one.
    #[serde(default)]
    pub thread_ts: Option<String>,
    /// Platform timestamp of the message itself.
    #[serde(default)]
    pub ts: Option<String>,
    #[serde(default = "Utc::now")]
    pub received_at: DateTime<Utc>,
}

/// A persisted message with its workflow fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub external_id: String,
    pub channel: String,
    pub sender: String,
    pub text: String,
    pub thread_ts: Option<String>,
    pub ts: Option<String>,
    pub received_at: DateTime<Utc>,
    pub status: MessageStatus,
    pub disposition: Option<Disposition>,
    pub reasoning: Option<String>,
    pub response_text: Option<String>,
    /// Number of times the driver has claimed this message.
    pub attempt_count: u32,
    pub last_error: Option<String>,
    /// Status the row had when it was claimed. Only set while `Processing`.
    pub claimed_from: Option<MessageStatus>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Message {
    /// Where a reply to this message should land: its thread, or a new thread
    /// rooted at the message.
    pub fn reply_thread(&self) -> Option<&str> {
        self.thread_ts.as_deref().or(self.ts.as_deref())
    }
}

// ── Human feedback ──────────────────────────────────────────────────

/// Lifecycle of a feedback record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackState {
    Pending,
    Consumed,
    Rejected,
}

impl FeedbackState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Consumed => "consumed",
            Self::Rejected => "rejected",
        }
    }
}

impl std::str::FromStr for FeedbackState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "consumed" => Ok(Self::Consumed),
            "rejected" => Ok(Self::Rejected),
            other => Err(format!("unknown feedback state: '{other}'")),
        }
    }
}

/// A person's reply to a suspended message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HumanFeedback {
    pub id: String,
    pub message_id: String,
    pub reply: String,
    /// Checkpoint version the reply was written against.
    pub checkpoint_version: i64,
    pub state: FeedbackState,
    pub submitted_at: DateTime<Utc>,
}

/// Result of handing feedback to the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FeedbackOutcome {
    Accepted { feedback_id: String },
    Ignored { reason: String },
}
