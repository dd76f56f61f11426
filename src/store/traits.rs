//! `Database` trait: the single async interface for all persistence.
//!
//! The message table is the system of record and its `status` column is the
//! claim lock. Checkpoints and human feedback hang off a message id.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::DatabaseError;
use crate::workflow::checkpoint::{Checkpoint, CheckpointContext};
use crate::workflow::state::WorkflowNode;
use crate::workflow::types::{
    Disposition, FeedbackOutcome, FeedbackState, HumanFeedback, Message, MessageStatus,
    NewMessage,
};

/// Backend-agnostic database trait covering messages, checkpoints, and feedback.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Messages ────────────────────────────────────────────────────

    /// Insert a message with `status = New`.
    ///
    /// Returns `None` when a message with the same external id already exists.
    async fn insert_message(&self, message: &NewMessage) -> Result<Option<String>, DatabaseError>;

    async fn get_message(&self, id: &str) -> Result<Option<Message>, DatabaseError>;

    async fn get_message_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<Message>, DatabaseError>;

    /// List messages, newest first. `None` lists every status.
    async fn list_messages(
        &self,
        status: Option<MessageStatus>,
        limit: usize,
    ) -> Result<Vec<Message>, DatabaseError>;

    /// Messages the driver may claim, oldest first.
    async fn find_eligible(&self, limit: usize) -> Result<Vec<Message>, DatabaseError>;

    /// Prior messages on the same channel received before `before`, oldest first.
    async fn recent_channel_history(
        &self,
        channel: &str,
        before: DateTime<Utc>,
        exclude_id: &str,
        limit: usize,
    ) -> Result<Vec<Message>, DatabaseError>;

    /// Atomically move a message from `expected` to `Processing`.
    ///
    /// Returns `false` when the row is no longer in `expected`, which means
    /// another cycle got there first.
    async fn claim_message(
        &self,
        id: &str,
        expected: MessageStatus,
    ) -> Result<bool, DatabaseError>;

    /// Hand a claimed message back to the status it was claimed from.
    async fn release_claim(&self, id: &str) -> Result<bool, DatabaseError>;

    /// Persist the status a run ended in and drop the claim.
    ///
    /// Only applies while the message is still `Processing`.
    async fn finish_run(
        &self,
        id: &str,
        status: MessageStatus,
        last_error: Option<&str>,
    ) -> Result<bool, DatabaseError>;

    async fn set_classification(
        &self,
        id: &str,
        disposition: Disposition,
        reasoning: &str,
    ) -> Result<(), DatabaseError>;

    async fn set_response_text(&self, id: &str, text: &str) -> Result<(), DatabaseError>;

    /// Reset claims taken before `cutoff` to their pre-claim status.
    async fn sweep_stale_claims(&self, cutoff: DateTime<Utc>) -> Result<usize, DatabaseError>;

    async fn count_by_status(&self) -> Result<Vec<(MessageStatus, u64)>, DatabaseError>;

    /// Delete terminal messages (and their checkpoints and feedback) last
    /// touched more than `keep_days` ago.
    async fn prune_terminal(&self, keep_days: u32) -> Result<usize, DatabaseError>;

    // ── Checkpoints ─────────────────────────────────────────────────

    async fn load_checkpoint(&self, message_id: &str) -> Result<Option<Checkpoint>, DatabaseError>;

    /// Write a checkpoint and return its new version.
    ///
    /// `expected_version` is the version the caller last loaded, or `None`
    /// when no checkpoint exists yet. A mismatch fails with
    /// [`DatabaseError::VersionConflict`] and leaves the stored row untouched.
    async fn save_checkpoint(
        &self,
        message_id: &str,
        node: WorkflowNode,
        context: &CheckpointContext,
        expected_version: Option<i64>,
    ) -> Result<i64, DatabaseError>;

    // ── Human feedback ──────────────────────────────────────────────

    /// Record a person's reply and request a resume.
    ///
    /// Only messages in `AwaitingHuman` or `ResumeRequested` accept feedback.
    /// When `checkpoint_version` is given it must match the stored checkpoint.
    async fn submit_feedback(
        &self,
        message_id: &str,
        reply: &str,
        checkpoint_version: Option<i64>,
    ) -> Result<FeedbackOutcome, DatabaseError>;

    /// Oldest pending feedback for a message.
    async fn next_pending_feedback(
        &self,
        message_id: &str,
    ) -> Result<Option<HumanFeedback>, DatabaseError>;

    /// Move a pending feedback record to `state`. Returns `false` if it was
    /// no longer pending.
    async fn mark_feedback(&self, id: &str, state: FeedbackState) -> Result<bool, DatabaseError>;

    /// Reject every feedback record still pending for a message.
    async fn reject_pending_feedback(&self, message_id: &str) -> Result<usize, DatabaseError>;
}
