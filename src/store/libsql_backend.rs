//! libSQL backend: async `Database` trait implementation.
//!
//! Supports local file and in-memory databases. Every conditional write
//! (claim, release, finish, checkpoint save) is a single guarded statement, so
//! losing a race shows up as zero affected rows rather than a torn update.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::store::migrations;
use crate::store::traits::Database;
use crate::workflow::checkpoint::{Checkpoint, CheckpointContext};
use crate::workflow::state::WorkflowNode;
use crate::workflow::types::{
    Disposition, FeedbackOutcome, FeedbackState, HumanFeedback, Message, MessageStatus,
    NewMessage,
};

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        Ok(backend)
    }

    /// Get the connection.
    fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Queue a pending reply, re-checking status and checkpoint in the same
    /// statement. Returns `None` when the message is no longer suspended at
    /// `checkpoint_version`.
    async fn insert_pending_feedback(
        &self,
        message_id: &str,
        reply: &str,
        checkpoint_version: i64,
    ) -> Result<Option<String>, DatabaseError> {
        let feedback_id = Uuid::new_v4().to_string();
        let inserted = self
            .conn()
            .execute(
                &format!(
                    "INSERT INTO human_feedback ({FEEDBACK_COLUMNS})
                     SELECT ?1, ?2, ?3, ?4, 'pending', ?5
                     WHERE EXISTS (
                         SELECT 1 FROM messages
                         WHERE id = ?2 AND status IN ('awaiting_human', 'resume_requested')
                     ) AND EXISTS (
                         SELECT 1 FROM checkpoints
                         WHERE message_id = ?2 AND node = 'awaiting_human' AND version = ?4
                     )"
                ),
                params![
                    feedback_id.clone(),
                    message_id,
                    reply,
                    checkpoint_version,
                    now_ts()
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("submit_feedback: {e}")))?;
        Ok((inserted > 0).then_some(feedback_id))
    }

    async fn fetch_one_message(
        &self,
        context: &str,
        sql: &str,
        key: &str,
    ) -> Result<Option<Message>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, params![key])
            .await
            .map_err(|e| DatabaseError::Query(format!("{context}: {e}")))?;

        match rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("{context}: {e}")))?
        {
            Some(row) => Ok(Some(row_to_message(&row)?)),
            None => Ok(None),
        }
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical write format. Fixed-width so string comparison orders correctly.
fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn now_ts() -> String {
    ts(&Utc::now())
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: &Option<String>) -> Option<DateTime<Utc>> {
    s.as_ref().map(|s| parse_datetime(s))
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

const MESSAGE_COLUMNS: &str = "id, external_id, channel, sender, text, thread_ts, ts, received_at, \
     status, disposition, reasoning, response_text, attempt_count, last_error, claimed_from, \
     claimed_at, created_at, updated_at";

const FEEDBACK_COLUMNS: &str = "id, message_id, reply, checkpoint_version, state, submitted_at";

/// Map a libsql Row to a Message.
fn row_to_message(row: &libsql::Row) -> Result<Message, DatabaseError> {
    let get = |e: libsql::Error| DatabaseError::Query(format!("message row: {e}"));

    let status_str: String = row.get(8).map_err(get)?;
    let status = status_str
        .parse::<MessageStatus>()
        .map_err(DatabaseError::Serialization)?;
    let disposition = match row.get::<String>(9).ok() {
        Some(s) => Some(s.parse::<Disposition>().map_err(DatabaseError::Serialization)?),
        None => None,
    };
    let claimed_from = match row.get::<String>(14).ok() {
        Some(s) => Some(s.parse::<MessageStatus>().map_err(DatabaseError::Serialization)?),
        None => None,
    };
    let attempt_count: i64 = row.get(12).map_err(get)?;
    let received_str: String = row.get(7).map_err(get)?;
    let claimed_at_str: Option<String> = row.get(15).ok();
    let created_str: String = row.get(16).map_err(get)?;
    let updated_str: String = row.get(17).map_err(get)?;

    Ok(Message {
        id: row.get(0).map_err(get)?,
        external_id: row.get(1).map_err(get)?,
        channel: row.get(2).map_err(get)?,
        sender: row.get(3).map_err(get)?,
        text: row.get(4).map_err(get)?,
        thread_ts: row.get(5).ok(),
        ts: row.get(6).ok(),
        received_at: parse_datetime(&received_str),
        status,
        disposition,
        reasoning: row.get(10).ok(),
        response_text: row.get(11).ok(),
        attempt_count: attempt_count.max(0) as u32,
        last_error: row.get(13).ok(),
        claimed_from,
        claimed_at: parse_optional_datetime(&claimed_at_str),
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
    })
}

fn row_to_feedback(row: &libsql::Row) -> Result<HumanFeedback, DatabaseError> {
    let get = |e: libsql::Error| DatabaseError::Query(format!("feedback row: {e}"));
    let state_str: String = row.get(4).map_err(get)?;
    let submitted_str: String = row.get(5).map_err(get)?;

    Ok(HumanFeedback {
        id: row.get(0).map_err(get)?,
        message_id: row.get(1).map_err(get)?,
        reply: row.get(2).map_err(get)?,
        checkpoint_version: row.get(3).map_err(get)?,
        state: state_str
            .parse::<FeedbackState>()
            .map_err(DatabaseError::Serialization)?,
        submitted_at: parse_datetime(&submitted_str),
    })
}

async fn collect_messages(
    mut rows: libsql::Rows,
    context: &str,
) -> Result<Vec<Message>, DatabaseError> {
    let mut messages = Vec::new();
    while let Some(row) = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Query(format!("{context}: {e}")))?
    {
        match row_to_message(&row) {
            Ok(msg) => messages.push(msg),
            Err(e) => warn!("Skipping message row: {e}"),
        }
    }
    Ok(messages)
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Messages ────────────────────────────────────────────────────

    async fn insert_message(&self, message: &NewMessage) -> Result<Option<String>, DatabaseError> {
        let id = Uuid::new_v4().to_string();
        let now = now_ts();
        let inserted = self
            .conn()
            .execute(
                "INSERT INTO messages (id, external_id, channel, sender, text, thread_ts, ts,
                    received_at, status, attempt_count, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 'new', 0, ?9, ?9)
                 ON CONFLICT(external_id) DO NOTHING",
                params![
                    id.clone(),
                    message.external_id.as_str(),
                    message.channel.as_str(),
                    message.sender.as_str(),
                    message.text.as_str(),
                    opt_text(message.thread_ts.as_deref()),
                    opt_text(message.ts.as_deref()),
                    ts(&message.received_at),
                    now,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_message: {e}")))?;

        if inserted == 0 {
            debug!(external_id = %message.external_id, "Duplicate message skipped");
            return Ok(None);
        }
        debug!(id = %id, external_id = %message.external_id, "Message inserted into DB");
        Ok(Some(id))
    }

    async fn get_message(&self, id: &str) -> Result<Option<Message>, DatabaseError> {
        self.fetch_one_message(
            "get_message",
            &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
            id,
        )
        .await
    }

    async fn get_message_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<Message>, DatabaseError> {
        self.fetch_one_message(
            "get_message_by_external_id",
            &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE external_id = ?1"),
            external_id,
        )
        .await
    }

    async fn list_messages(
        &self,
        status: Option<MessageStatus>,
        limit: usize,
    ) -> Result<Vec<Message>, DatabaseError> {
        let rows = match status {
            Some(status) => {
                self.conn()
                    .query(
                        &format!(
                            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE status = ?1
                             ORDER BY received_at DESC LIMIT ?2"
                        ),
                        params![status.as_str(), limit as i64],
                    )
                    .await
            }
            None => {
                self.conn()
                    .query(
                        &format!(
                            "SELECT {MESSAGE_COLUMNS} FROM messages
                             ORDER BY received_at DESC LIMIT ?1"
                        ),
                        params![limit as i64],
                    )
                    .await
            }
        }
        .map_err(|e| DatabaseError::Query(format!("list_messages: {e}")))?;

        collect_messages(rows, "list_messages").await
    }

    async fn find_eligible(&self, limit: usize) -> Result<Vec<Message>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages
                     WHERE status IN ('new', 'resume_requested')
                     ORDER BY received_at ASC LIMIT ?1"
                ),
                params![limit as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("find_eligible: {e}")))?;

        collect_messages(rows, "find_eligible").await
    }

    async fn recent_channel_history(
        &self,
        channel: &str,
        before: DateTime<Utc>,
        exclude_id: &str,
        limit: usize,
    ) -> Result<Vec<Message>, DatabaseError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages
                     WHERE channel = ?1 AND received_at <= ?2 AND id != ?3
                     ORDER BY received_at DESC LIMIT ?4"
                ),
                params![channel, ts(&before), exclude_id, limit as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("recent_channel_history: {e}")))?;

        let mut history = collect_messages(rows, "recent_channel_history").await?;
        history.reverse();
        Ok(history)
    }

    async fn claim_message(
        &self,
        id: &str,
        expected: MessageStatus,
    ) -> Result<bool, DatabaseError> {
        let now = now_ts();
        let claimed = self
            .conn()
            .execute(
                "UPDATE messages
                 SET status = 'processing', claimed_from = status, claimed_at = ?1,
                     attempt_count = attempt_count + 1, updated_at = ?1
                 WHERE id = ?2 AND status = ?3",
                params![now, id, expected.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("claim_message: {e}")))?;

        debug!(id = id, from = %expected, claimed = claimed == 1, "Claim attempted");
        Ok(claimed == 1)
    }

    async fn release_claim(&self, id: &str) -> Result<bool, DatabaseError> {
        let released = self
            .conn()
            .execute(
                "UPDATE messages
                 SET status = claimed_from, claimed_from = NULL, claimed_at = NULL, updated_at = ?1
                 WHERE id = ?2 AND status = 'processing' AND claimed_from IS NOT NULL",
                params![now_ts(), id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("release_claim: {e}")))?;

        Ok(released == 1)
    }

    async fn finish_run(
        &self,
        id: &str,
        status: MessageStatus,
        last_error: Option<&str>,
    ) -> Result<bool, DatabaseError> {
        let updated = self
            .conn()
            .execute(
                "UPDATE messages
                 SET status = ?1, last_error = COALESCE(?2, last_error),
                     claimed_from = NULL, claimed_at = NULL, updated_at = ?3
                 WHERE id = ?4 AND status = 'processing'",
                params![status.as_str(), opt_text(last_error), now_ts(), id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("finish_run: {e}")))?;

        debug!(id = id, status = %status, "Run finished");
        Ok(updated == 1)
    }

    async fn set_classification(
        &self,
        id: &str,
        disposition: Disposition,
        reasoning: &str,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE messages SET disposition = ?1, reasoning = ?2, updated_at = ?3 WHERE id = ?4",
                params![disposition.as_str(), reasoning, now_ts(), id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_classification: {e}")))?;
        Ok(())
    }

    async fn set_response_text(&self, id: &str, text: &str) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE messages SET response_text = ?1, updated_at = ?2 WHERE id = ?3",
                params![text, now_ts(), id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_response_text: {e}")))?;
        Ok(())
    }

    async fn sweep_stale_claims(&self, cutoff: DateTime<Utc>) -> Result<usize, DatabaseError> {
        let count = self
            .conn()
            .execute(
                "UPDATE messages
                 SET status = claimed_from, claimed_from = NULL, claimed_at = NULL, updated_at = ?1
                 WHERE status = 'processing' AND claimed_from IS NOT NULL AND claimed_at < ?2",
                params![now_ts(), ts(&cutoff)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("sweep_stale_claims: {e}")))?;

        if count > 0 {
            info!(count, "Reset stale claims");
        }
        Ok(count as usize)
    }

    async fn count_by_status(&self) -> Result<Vec<(MessageStatus, u64)>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT status, COUNT(*) FROM messages GROUP BY status ORDER BY status",
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("count_by_status: {e}")))?;

        let mut counts = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("count_by_status: {e}")))?
        {
            let status: String = row
                .get(0)
                .map_err(|e| DatabaseError::Query(format!("count_by_status: {e}")))?;
            let count: i64 = row
                .get(1)
                .map_err(|e| DatabaseError::Query(format!("count_by_status: {e}")))?;
            match status.parse::<MessageStatus>() {
                Ok(status) => counts.push((status, count.max(0) as u64)),
                Err(e) => warn!("Skipping status count: {e}"),
            }
        }
        Ok(counts)
    }

    async fn prune_terminal(&self, keep_days: u32) -> Result<usize, DatabaseError> {
        let Some(cutoff) = chrono::Duration::try_days(i64::from(keep_days))
            .and_then(|keep| Utc::now().checked_sub_signed(keep))
        else {
            return Ok(0);
        };
        let cutoff = ts(&cutoff);
        let conn = self.conn();
        let doomed = "SELECT id FROM messages
                      WHERE status IN ('completed', 'failed') AND updated_at < ?1";

        conn.execute(
            &format!("DELETE FROM human_feedback WHERE message_id IN ({doomed})"),
            params![cutoff.clone()],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("prune_terminal: {e}")))?;
        conn.execute(
            &format!("DELETE FROM checkpoints WHERE message_id IN ({doomed})"),
            params![cutoff.clone()],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("prune_terminal: {e}")))?;
        let count = conn
            .execute(
                "DELETE FROM messages WHERE status IN ('completed', 'failed') AND updated_at < ?1",
                params![cutoff],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("prune_terminal: {e}")))?;

        if count > 0 {
            info!(count, keep_days, "Pruned old messages from DB");
        }
        Ok(count as usize)
    }

    // ── Checkpoints ─────────────────────────────────────────────────

    async fn load_checkpoint(&self, message_id: &str) -> Result<Option<Checkpoint>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT node, context, version, updated_at FROM checkpoints WHERE message_id = ?1",
                params![message_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("load_checkpoint: {e}")))?;

        let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("load_checkpoint: {e}")))?
        else {
            return Ok(None);
        };

        let get = |e: libsql::Error| DatabaseError::Query(format!("load_checkpoint: {e}"));
        let node_str: String = row.get(0).map_err(get)?;
        let context_str: String = row.get(1).map_err(get)?;
        let version: i64 = row.get(2).map_err(get)?;
        let updated_str: String = row.get(3).map_err(get)?;

        let context: CheckpointContext = serde_json::from_str(&context_str)
            .map_err(|e| DatabaseError::Serialization(format!("checkpoint context: {e}")))?;

        Ok(Some(Checkpoint {
            message_id: message_id.to_string(),
            node: node_str
                .parse::<WorkflowNode>()
                .map_err(DatabaseError::Serialization)?,
            context,
            version,
            updated_at: parse_datetime(&updated_str),
        }))
    }

    async fn save_checkpoint(
        &self,
        message_id: &str,
        node: WorkflowNode,
        context: &CheckpointContext,
        expected_version: Option<i64>,
    ) -> Result<i64, DatabaseError> {
        let context_json = serde_json::to_string(context)
            .map_err(|e| DatabaseError::Serialization(format!("checkpoint context: {e}")))?;
        let now = now_ts();

        let (written, version) = match expected_version {
            None => {
                let written = self
                    .conn()
                    .execute(
                        "INSERT INTO checkpoints (message_id, node, context, version, updated_at)
                         VALUES (?1, ?2, ?3, 1, ?4)
                         ON CONFLICT(message_id) DO NOTHING",
                        params![message_id, node.as_str(), context_json, now],
                    )
                    .await
                    .map_err(|e| DatabaseError::Query(format!("save_checkpoint: {e}")))?;
                (written, 1)
            }
            Some(expected) => {
                let written = self
                    .conn()
                    .execute(
                        "UPDATE checkpoints
                         SET node = ?1, context = ?2, version = version + 1, updated_at = ?3
                         WHERE message_id = ?4 AND version = ?5",
                        params![node.as_str(), context_json, now, message_id, expected],
                    )
                    .await
                    .map_err(|e| DatabaseError::Query(format!("save_checkpoint: {e}")))?;
                (written, expected + 1)
            }
        };

        if written == 0 {
            return Err(DatabaseError::VersionConflict {
                message_id: message_id.to_string(),
                expected: expected_version.unwrap_or(0),
            });
        }

        debug!(id = message_id, node = %node, version, "Checkpoint saved");
        Ok(version)
    }

    // ── Human feedback ──────────────────────────────────────────────

    async fn submit_feedback(
        &self,
        message_id: &str,
        reply: &str,
        checkpoint_version: Option<i64>,
    ) -> Result<FeedbackOutcome, DatabaseError> {
        let ignored = |reason: String| -> Result<FeedbackOutcome, DatabaseError> {
            warn!(id = message_id, reason = %reason, "Feedback ignored");
            Ok(FeedbackOutcome::Ignored { reason })
        };

        let Some(message) = self.get_message(message_id).await? else {
            return ignored("unknown message".to_string());
        };
        if !matches!(
            message.status,
            MessageStatus::AwaitingHuman | MessageStatus::ResumeRequested
        ) {
            return ignored(format!("message is {}", message.status));
        }
        let Some(checkpoint) = self.load_checkpoint(message_id).await? else {
            return ignored("message has no checkpoint".to_string());
        };
        if checkpoint.node != WorkflowNode::AwaitingHuman {
            return ignored(format!("checkpoint is at {}", checkpoint.node));
        }
        if let Some(version) = checkpoint_version
            && version != checkpoint.version
        {
            return ignored(format!(
                "stale checkpoint version {version}, current is {}",
                checkpoint.version
            ));
        }

        let Some(feedback_id) = self
            .insert_pending_feedback(message_id, reply, checkpoint.version)
            .await?
        else {
            return ignored("message moved on while submitting".to_string());
        };

        if message.status == MessageStatus::AwaitingHuman {
            let moved = self
                .conn()
                .execute(
                    "UPDATE messages SET status = 'resume_requested', updated_at = ?1
                     WHERE id = ?2 AND status = 'awaiting_human'",
                    params![now_ts(), message_id],
                )
                .await
                .map_err(|e| DatabaseError::Query(format!("submit_feedback: {e}")))?;
            if moved == 0 {
                debug!(id = message_id, "Status already moved past awaiting_human");
            }
        }

        info!(id = message_id, feedback_id = %feedback_id, "Feedback accepted");
        Ok(FeedbackOutcome::Accepted { feedback_id })
    }

    async fn next_pending_feedback(
        &self,
        message_id: &str,
    ) -> Result<Option<HumanFeedback>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {FEEDBACK_COLUMNS} FROM human_feedback
                     WHERE message_id = ?1 AND state = 'pending'
                     ORDER BY submitted_at ASC, rowid ASC LIMIT 1"
                ),
                params![message_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("next_pending_feedback: {e}")))?;

        match rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("next_pending_feedback: {e}")))?
        {
            Some(row) => Ok(Some(row_to_feedback(&row)?)),
            None => Ok(None),
        }
    }

    async fn mark_feedback(&self, id: &str, state: FeedbackState) -> Result<bool, DatabaseError> {
        let updated = self
            .conn()
            .execute(
                "UPDATE human_feedback SET state = ?1 WHERE id = ?2 AND state = 'pending'",
                params![state.as_str(), id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("mark_feedback: {e}")))?;
        Ok(updated == 1)
    }

    async fn reject_pending_feedback(&self, message_id: &str) -> Result<usize, DatabaseError> {
        let count = self
            .conn()
            .execute(
                "UPDATE human_feedback SET state = 'rejected'
                 WHERE message_id = ?1 AND state = 'pending'",
                params![message_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("reject_pending_feedback: {e}")))?;

        if count > 0 {
            warn!(id = message_id, count, "Rejected leftover feedback");
        }
        Ok(count as usize)
    }
}
