//! Workflow engine: runs one claimed message through the state machine.
//!
//! A run starts from the persisted checkpoint (or from `Start` when there is
//! none), advances node by node, and returns when the message completes or
//! suspends at `AwaitingHuman`. Nothing is held in memory between runs.
//!
//! Every send is preceded by a checkpoint recording the intent (`Classified`
//! with the draft, or `Resumed` with the human text). A later run that finds
//! one of those nodes cannot tell whether the send went out, so it fails the
//! message for manual review instead of sending twice.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::channels::ReplySender;
use crate::config::EngineConfig;
use crate::error::WorkflowError;
use crate::llm::ReplyGenerator;
use crate::store::Database;
use crate::workflow::checkpoint::{Checkpoint, CheckpointContext, HistoryEntry};
use crate::workflow::classifier::Classifier;
use crate::workflow::retry::{RetryPolicy, with_retry};
use crate::workflow::state::WorkflowNode;
use crate::workflow::types::{Disposition, FeedbackState, Message, MessageStatus};

/// How a run handed control back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Reached a terminal node. The message should become `Completed`.
    Completed(Disposition),
    /// Stopped at `AwaitingHuman`. The message should become `AwaitingHuman`.
    Suspended,
}

impl RunOutcome {
    /// Status the driver persists for this outcome.
    pub fn message_status(&self) -> MessageStatus {
        match self {
            Self::Completed(_) => MessageStatus::Completed,
            Self::Suspended => MessageStatus::AwaitingHuman,
        }
    }
}

/// Executes workflow runs against the shared stores and collaborators.
pub struct WorkflowEngine {
    store: Arc<dyn Database>,
    classifier: Arc<Classifier>,
    generator: Arc<dyn ReplyGenerator>,
    sender: Arc<dyn ReplySender>,
    retry: RetryPolicy,
    config: EngineConfig,
}

impl WorkflowEngine {
    pub fn new(
        store: Arc<dyn Database>,
        classifier: Arc<Classifier>,
        generator: Arc<dyn ReplyGenerator>,
        sender: Arc<dyn ReplySender>,
    ) -> Self {
        Self {
            store,
            classifier,
            generator,
            sender,
            retry: RetryPolicy::default(),
            config: EngineConfig::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Run a message the caller has already claimed.
    ///
    /// The entry point depends on the status the claim was taken from: `New`
    /// starts a fresh run, `ResumeRequested` resumes from the checkpoint.
    pub async fn run(&self, message_id: &str) -> Result<RunOutcome, WorkflowError> {
        let message =
            self.store
                .get_message(message_id)
                .await?
                .ok_or_else(|| WorkflowError::Consistency {
                    message_id: message_id.to_string(),
                    reason: "message disappeared".to_string(),
                })?;

        if message.status != MessageStatus::Processing {
            return Err(WorkflowError::Conflict {
                message_id: message.id.clone(),
                reason: format!("message is {}, not claimed", message.status),
            });
        }

        let checkpoint = self.store.load_checkpoint(&message.id).await?;
        let mut run = WorkflowRun::new(self, message, checkpoint.as_ref());

        match run.message.claimed_from {
            Some(MessageStatus::New) => run.start(checkpoint).await,
            Some(MessageStatus::ResumeRequested) => run.resume(checkpoint).await,
            other => Err(run.consistency(format!(
                "claimed from unexpected status {}",
                other.map(|s| s.to_string()).unwrap_or_else(|| "none".into())
            ))),
        }
    }
}

/// One in-flight execution of the state machine for a message.
struct WorkflowRun<'a> {
    engine: &'a WorkflowEngine,
    message: Message,
    node: WorkflowNode,
    version: Option<i64>,
    context: CheckpointContext,
}

impl<'a> WorkflowRun<'a> {
    fn new(engine: &'a WorkflowEngine, message: Message, checkpoint: Option<&Checkpoint>) -> Self {
        match checkpoint {
            Some(cp) => Self {
                engine,
                message,
                node: cp.node,
                version: Some(cp.version),
                context: cp.context.clone(),
            },
            None => Self {
                engine,
                message,
                node: WorkflowNode::Start,
                version: None,
                context: CheckpointContext::default(),
            },
        }
    }

    fn id(&self) -> &str {
        &self.message.id
    }

    fn consistency(&self, reason: impl Into<String>) -> WorkflowError {
        WorkflowError::Consistency {
            message_id: self.message.id.clone(),
            reason: reason.into(),
        }
    }

    fn transient(&self, reason: impl Into<String>) -> WorkflowError {
        WorkflowError::Transient {
            message_id: self.message.id.clone(),
            reason: reason.into(),
        }
    }

    /// Move to `to` in memory only.
    fn transition(&mut self, to: WorkflowNode) -> Result<(), WorkflowError> {
        if !self.node.can_transition_to(to) {
            return Err(self.consistency(format!("illegal transition {} -> {to}", self.node)));
        }
        info!(id = %self.message.id, from = %self.node, to = %to, "Workflow transition");
        self.node = to;
        Ok(())
    }

    /// Move to `to` and checkpoint it against the last version this run saw.
    async fn advance(&mut self, to: WorkflowNode) -> Result<(), WorkflowError> {
        self.transition(to)?;
        let version = self
            .engine
            .store
            .save_checkpoint(&self.message.id, to, &self.context, self.version)
            .await?;
        self.version = Some(version);
        Ok(())
    }

    /// Record `Failed` after an exhausted retry. A conflict here is logged only.
    async fn fail(&mut self, error: WorkflowError) -> WorkflowError {
        if let Err(e) = self.advance(WorkflowNode::Failed).await {
            warn!(id = %self.message.id, error = %e, "Could not checkpoint failure");
        }
        error
    }

    /// Outcome for the node this run stopped at.
    fn outcome(&self) -> Result<RunOutcome, WorkflowError> {
        match (self.node.message_status(), self.context.disposition) {
            (MessageStatus::Completed, Some(disposition)) => Ok(RunOutcome::Completed(disposition)),
            (MessageStatus::Completed, None) => {
                Err(self.consistency("terminal checkpoint without a disposition"))
            }
            (MessageStatus::AwaitingHuman, _) => Ok(RunOutcome::Suspended),
            (status, _) => Err(self.consistency(format!(
                "run stopped at {} leaving the message {status}",
                self.node
            ))),
        }
    }

    /// Bookkeeping after a terminal checkpoint: record the text that went
    /// out, and drop feedback that arrived after the one we used.
    ///
    /// Idempotent, so a rerun that finds the terminal checkpoint repeats it.
    async fn finalize(&self) -> Result<(), WorkflowError> {
        let store = &self.engine.store;
        let sent = match self.node {
            WorkflowNode::Notified => self.context.draft_reply.as_deref(),
            WorkflowNode::Responded => self.context.human_reply.as_deref(),
            _ => None,
        };
        if let Some(text) = sent {
            store.set_response_text(&self.message.id, text).await?;
        }
        if self.node == WorkflowNode::Responded {
            store.reject_pending_feedback(&self.message.id).await?;
        }
        Ok(())
    }

    // ── Fresh run ───────────────────────────────────────────────────

    async fn start(&mut self, checkpoint: Option<Checkpoint>) -> Result<RunOutcome, WorkflowError> {
        if checkpoint.is_some() {
            return self.recover().await;
        }

        let history: Vec<HistoryEntry> = self
            .engine
            .store
            .recent_channel_history(
                &self.message.channel,
                self.message.received_at,
                &self.message.id,
                self.engine.config.history_window,
            )
            .await?
            .iter()
            .map(HistoryEntry::from)
            .collect();

        let classification = self
            .engine
            .classifier
            .classify(&self.message, &history)
            .await;
        let disposition = classification.disposition;
        info!(
            id = %self.message.id,
            disposition = %disposition,
            source = %classification.source,
            "Message classified"
        );

        self.engine
            .store
            .set_classification(&self.message.id, disposition, &classification.rationale)
            .await?;
        self.message.disposition = Some(disposition);
        self.message.reasoning = Some(classification.rationale.clone());

        self.context.history = history;
        self.context.disposition = Some(disposition);
        self.context.rationale = Some(classification.rationale);
        self.transition(WorkflowNode::Classified)?;

        match WorkflowNode::after_classification(disposition) {
            WorkflowNode::Notified => self.notify().await?,
            next => self.advance(next).await?,
        }
        self.outcome()
    }

    /// A fresh run found an existing checkpoint: a previous run died after
    /// writing it but before the driver persisted the outcome.
    async fn recover(&self) -> Result<RunOutcome, WorkflowError> {
        let node = self.node;
        match node {
            WorkflowNode::Ignored | WorkflowNode::Notified | WorkflowNode::Responded => {
                debug!(id = %self.message.id, node = %node, "Already complete, no side effects");
                self.finalize().await?;
                self.outcome()
            }
            WorkflowNode::AwaitingHuman => {
                debug!(id = %self.message.id, "Already suspended, re-suspending");
                self.outcome()
            }
            WorkflowNode::Classified | WorkflowNode::Resumed => Err(self.consistency(format!(
                "interrupted send at {node}; cannot tell whether the reply went out"
            ))),
            WorkflowNode::Start | WorkflowNode::Failed => {
                Err(self.consistency(format!("unexpected checkpoint node {node}")))
            }
        }
    }

    async fn notify(&mut self) -> Result<(), WorkflowError> {
        let engine = self.engine;
        let timeout = engine.config.call_timeout;

        let message = &self.message;
        let history = &self.context.history;
        let draft = match with_retry(&engine.retry, timeout, "generate_reply", || {
            engine.generator.generate_reply(message, history)
        })
        .await
        {
            Ok(draft) => draft,
            Err(reason) => {
                let err = self.transient(reason);
                return Err(self.fail(err).await);
            }
        };

        // Send intent.
        self.context.draft_reply = Some(draft.clone());
        let version = engine
            .store
            .save_checkpoint(
                &self.message.id,
                WorkflowNode::Classified,
                &self.context,
                self.version,
            )
            .await?;
        self.version = Some(version);

        self.send(&draft).await?;
        self.advance(WorkflowNode::Notified).await?;
        self.finalize().await
    }

    // ── Resume ──────────────────────────────────────────────────────

    async fn resume(&mut self, checkpoint: Option<Checkpoint>) -> Result<RunOutcome, WorkflowError> {
        let Some(cp) = checkpoint else {
            return Err(self.consistency("resume requested but no checkpoint exists"));
        };
        match cp.node {
            WorkflowNode::AwaitingHuman => {}
            WorkflowNode::Responded => return self.recover().await,
            WorkflowNode::Resumed => {
                return Err(self.consistency(
                    "interrupted send at resumed; cannot tell whether the reply went out",
                ));
            }
            other => {
                return Err(self.consistency(format!(
                    "resume requested but checkpoint is at {other}, not awaiting_human"
                )));
            }
        }

        let engine = self.engine;
        let store = &engine.store;
        let feedback = loop {
            let Some(fb) = store.next_pending_feedback(self.id()).await? else {
                return Err(self.consistency("resume requested but no pending feedback"));
            };
            if fb.checkpoint_version == cp.version {
                break fb;
            }
            warn!(
                id = %self.message.id,
                feedback_id = %fb.id,
                feedback_version = fb.checkpoint_version,
                checkpoint_version = cp.version,
                "Rejecting stale feedback"
            );
            store.mark_feedback(&fb.id, FeedbackState::Rejected).await?;
        };

        self.context.human_reply = Some(feedback.reply.clone());
        // Send intent. Losing this race means another run owns the resume.
        self.advance(WorkflowNode::Resumed).await?;
        if !store.mark_feedback(&feedback.id, FeedbackState::Consumed).await? {
            warn!(id = %self.message.id, feedback_id = %feedback.id, "Feedback was no longer pending");
        }

        self.send(&feedback.reply).await?;
        self.advance(WorkflowNode::Responded).await?;
        self.finalize().await?;
        self.outcome()
    }

    /// Send with retry. On exhaustion the run is checkpointed as failed.
    async fn send(&mut self, text: &str) -> Result<(), WorkflowError> {
        let engine = self.engine;
        let channel = self.message.channel.as_str();
        let thread = self.message.reply_thread();
        let result = with_retry(&engine.retry, engine.config.call_timeout, "send", || {
            engine.sender.send(channel, thread, text)
        })
        .await;

        match result {
            Ok(()) => {
                info!(id = %self.message.id, channel = engine.sender.name(), "Reply sent");
                Ok(())
            }
            Err(reason) => {
                let err = self.transient(reason);
                Err(self.fail(err).await)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ChannelError, LlmError};
    use crate::store::LibSqlBackend;
    use crate::workflow::classifier::RuleSet;
    use crate::workflow::types::{FeedbackOutcome, NewMessage};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingGenerator {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl ReplyGenerator for CountingGenerator {
        async fn generate_reply(
            &self,
            _message: &Message,
            _history: &[HistoryEntry],
        ) -> Result<String, LlmError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(LlmError::RequestFailed {
                    provider: "stub".into(),
                    reason: "503".into(),
                });
            }
            Ok("Thanks for the update!".into())
        }
    }

    #[derive(Default)]
    struct CountingSender {
        sent: Mutex<Vec<(String, Option<String>, String)>>,
        fail: bool,
    }

    impl CountingSender {
        fn count(&self) -> usize {
            self.sent.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl ReplySender for CountingSender {
        fn name(&self) -> &str {
            "stub"
        }

        async fn send(
            &self,
            channel: &str,
            thread_ts: Option<&str>,
            text: &str,
        ) -> Result<(), ChannelError> {
            if self.fail {
                return Err(ChannelError::SendFailed {
                    name: "stub".into(),
                    reason: "rate_limited".into(),
                });
            }
            self.sent.lock().unwrap().push((
                channel.to_string(),
                thread_ts.map(str::to_string),
                text.to_string(),
            ));
            Ok(())
        }
    }

    struct Harness {
        store: Arc<LibSqlBackend>,
        generator: Arc<CountingGenerator>,
        sender: Arc<CountingSender>,
        engine: WorkflowEngine,
    }

    async fn harness_with(generator: CountingGenerator, sender: CountingSender) -> Harness {
        let store = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let generator = Arc::new(generator);
        let sender = Arc::new(sender);
        let engine = WorkflowEngine::new(
            store.clone(),
            Arc::new(Classifier::new(RuleSet::default_rules(), None)),
            generator.clone(),
            sender.clone(),
        )
        .with_retry(RetryPolicy::immediate(2));
        Harness {
            store,
            generator,
            sender,
            engine,
        }
    }

    async fn harness() -> Harness {
        harness_with(CountingGenerator::default(), CountingSender::default()).await
    }

    impl Harness {
        async fn ingest(&self, text: &str) -> String {
            self.store
                .insert_message(&NewMessage {
                    external_id: format!("C1:{text}"),
                    channel: "C1".into(),
                    sender: "U1".into(),
                    text: text.into(),
                    thread_ts: None,
                    ts: Some("1700000000.000200".into()),
                    received_at: Utc::now(),
                })
                .await
                .unwrap()
                .unwrap()
        }

        async fn claim_and_run(
            &self,
            id: &str,
            from: MessageStatus,
        ) -> Result<RunOutcome, WorkflowError> {
            assert!(self.store.claim_message(id, from).await.unwrap());
            self.engine.run(id).await
        }

        async fn checkpoint(&self, id: &str) -> Checkpoint {
            self.store.load_checkpoint(id).await.unwrap().unwrap()
        }
    }

    #[tokio::test]
    async fn ignore_makes_no_external_calls() {
        let h = harness().await;
        let id = h.ingest("hello").await;

        let outcome = h.claim_and_run(&id, MessageStatus::New).await.unwrap();
        assert_eq!(outcome, RunOutcome::Completed(Disposition::Ignore));
        assert_eq!(h.generator.calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.sender.count(), 0);

        let cp = h.checkpoint(&id).await;
        assert_eq!(cp.node, WorkflowNode::Ignored);
        assert_eq!(cp.version, 1);
        let msg = h.store.get_message(&id).await.unwrap().unwrap();
        assert_eq!(msg.disposition, Some(Disposition::Ignore));
    }

    #[tokio::test]
    async fn notify_generates_once_and_sends_once() {
        let h = harness().await;
        let id = h.ingest("working from home today").await;

        let outcome = h.claim_and_run(&id, MessageStatus::New).await.unwrap();
        assert_eq!(outcome, RunOutcome::Completed(Disposition::Notify));
        assert_eq!(h.generator.calls.load(Ordering::SeqCst), 1);

        let sent = h.sender.sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "C1");
        assert_eq!(sent[0].1.as_deref(), Some("1700000000.000200"));
        assert_eq!(sent[0].2, "Thanks for the update!");

        let cp = h.checkpoint(&id).await;
        assert_eq!(cp.node, WorkflowNode::Notified);
        assert_eq!(cp.version, 2);
        assert_eq!(cp.context.draft_reply.as_deref(), Some("Thanks for the update!"));
        let msg = h.store.get_message(&id).await.unwrap().unwrap();
        assert_eq!(msg.response_text.as_deref(), Some("Thanks for the update!"));
    }

    #[tokio::test]
    async fn respond_suspends_then_resumes_with_human_text() {
        let h = harness().await;
        let id = h.ingest("need help asap").await;

        let outcome = h.claim_and_run(&id, MessageStatus::New).await.unwrap();
        assert_eq!(outcome, RunOutcome::Suspended);
        assert_eq!(h.sender.count(), 0);
        h.store
            .finish_run(&id, outcome.message_status(), None)
            .await
            .unwrap();
        assert_eq!(h.checkpoint(&id).await.node, WorkflowNode::AwaitingHuman);

        let accepted = h.store.submit_feedback(&id, "Sure, on it", None).await.unwrap();
        assert!(matches!(accepted, FeedbackOutcome::Accepted { .. }));

        let outcome = h
            .claim_and_run(&id, MessageStatus::ResumeRequested)
            .await
            .unwrap();
        assert_eq!(outcome, RunOutcome::Completed(Disposition::Respond));

        let sent = h.sender.sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].2, "Sure, on it");

        let cp = h.checkpoint(&id).await;
        assert_eq!(cp.node, WorkflowNode::Responded);
        assert_eq!(cp.version, 3);
        assert_eq!(cp.context.human_reply.as_deref(), Some("Sure, on it"));
        assert!(h.store.next_pending_feedback(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_feedback_only_first_is_sent() {
        let h = harness().await;
        let id = h.ingest("can you review my PR?").await;
        let outcome = h.claim_and_run(&id, MessageStatus::New).await.unwrap();
        h.store
            .finish_run(&id, outcome.message_status(), None)
            .await
            .unwrap();

        h.store.submit_feedback(&id, "first", None).await.unwrap();
        h.store.submit_feedback(&id, "second", None).await.unwrap();

        h.claim_and_run(&id, MessageStatus::ResumeRequested)
            .await
            .unwrap();
        let sent = h.sender.sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].2, "first");
        assert!(h.store.next_pending_feedback(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn generation_failure_is_transient_after_ceiling() {
        let h = harness_with(
            CountingGenerator {
                fail: true,
                ..Default::default()
            },
            CountingSender::default(),
        )
        .await;
        let id = h.ingest("fyi: new coffee machine").await;

        let err = h.claim_and_run(&id, MessageStatus::New).await.unwrap_err();
        assert!(matches!(err, WorkflowError::Transient { .. }));
        assert!(!err.is_retryable());
        assert_eq!(h.generator.calls.load(Ordering::SeqCst), 2);
        assert_eq!(h.sender.count(), 0);
        assert_eq!(h.checkpoint(&id).await.node, WorkflowNode::Failed);
    }

    #[tokio::test]
    async fn send_failure_is_transient_and_checkpointed_failed() {
        let h = harness_with(
            CountingGenerator::default(),
            CountingSender {
                fail: true,
                ..Default::default()
            },
        )
        .await;
        let id = h.ingest("heads up, deploy at 5").await;

        let err = h.claim_and_run(&id, MessageStatus::New).await.unwrap_err();
        assert!(matches!(err, WorkflowError::Transient { .. }));
        assert_eq!(h.generator.calls.load(Ordering::SeqCst), 1);
        let cp = h.checkpoint(&id).await;
        assert_eq!(cp.node, WorkflowNode::Failed);
        assert_eq!(cp.version, 2);
    }

    #[tokio::test]
    async fn resume_without_checkpoint_is_consistency_error() {
        let h = harness().await;
        let id = h.ingest("need help asap").await;
        // Force the status without ever suspending.
        h.store.claim_message(&id, MessageStatus::New).await.unwrap();
        h.store
            .finish_run(&id, MessageStatus::ResumeRequested, None)
            .await
            .unwrap();

        let err = h
            .claim_and_run(&id, MessageStatus::ResumeRequested)
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::Consistency { .. }));
        assert_eq!(h.sender.count(), 0);
    }

    #[tokio::test]
    async fn resume_at_wrong_node_is_consistency_error() {
        let h = harness().await;
        let id = h.ingest("hello").await;
        h.claim_and_run(&id, MessageStatus::New).await.unwrap();
        h.store
            .finish_run(&id, MessageStatus::ResumeRequested, None)
            .await
            .unwrap();

        let err = h
            .claim_and_run(&id, MessageStatus::ResumeRequested)
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::Consistency { .. }));
    }

    #[tokio::test]
    async fn resume_without_feedback_is_consistency_error() {
        let h = harness().await;
        let id = h.ingest("need help asap").await;
        let outcome = h.claim_and_run(&id, MessageStatus::New).await.unwrap();
        assert_eq!(outcome, RunOutcome::Suspended);
        h.store
            .finish_run(&id, MessageStatus::ResumeRequested, None)
            .await
            .unwrap();

        let err = h
            .claim_and_run(&id, MessageStatus::ResumeRequested)
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::Consistency { .. }));
    }

    #[tokio::test]
    async fn stale_resume_conflicts_without_sending() {
        let h = harness().await;
        let id = h.ingest("need help asap").await;
        h.claim_and_run(&id, MessageStatus::New).await.unwrap();
        h.store
            .finish_run(&id, MessageStatus::AwaitingHuman, None)
            .await
            .unwrap();
        h.store.submit_feedback(&id, "on it", None).await.unwrap();
        assert!(
            h.store
                .claim_message(&id, MessageStatus::ResumeRequested)
                .await
                .unwrap()
        );

        // A competing writer moves the checkpoint on between load and save.
        let engine = &h.engine;
        let message = h.store.get_message(&id).await.unwrap().unwrap();
        let cp = h.checkpoint(&id).await;
        let mut run = WorkflowRun::new(engine, message, Some(&cp));
        h.store
            .save_checkpoint(&id, WorkflowNode::AwaitingHuman, &cp.context, Some(cp.version))
            .await
            .unwrap();

        let err = run.resume(Some(cp)).await.unwrap_err();
        assert!(matches!(err, WorkflowError::Conflict { .. }));
        assert!(err.is_retryable());
        assert_eq!(h.sender.count(), 0);
        // The pending feedback is untouched and can be used next cycle.
        assert!(h.store.next_pending_feedback(&id).await.unwrap().is_some());
        assert_eq!(h.checkpoint(&id).await.version, 2);
    }

    #[tokio::test]
    async fn rerun_after_completion_has_no_side_effects() {
        let h = harness().await;
        let id = h.ingest("fyi office closed friday").await;
        h.claim_and_run(&id, MessageStatus::New).await.unwrap();
        assert_eq!(h.sender.count(), 1);

        // Crash before the driver persisted Completed; the sweep hands it back.
        h.store
            .sweep_stale_claims(Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap();
        let outcome = h.claim_and_run(&id, MessageStatus::New).await.unwrap();
        assert_eq!(outcome, RunOutcome::Completed(Disposition::Notify));
        assert_eq!(h.sender.count(), 1);
        assert_eq!(h.generator.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn rerun_restores_response_text_from_terminal_checkpoint() {
        let h = harness().await;
        let id = h.ingest("fyi office closed friday").await;
        // Notified was checkpointed but the response text never landed.
        h.store
            .save_checkpoint(
                &id,
                WorkflowNode::Notified,
                &CheckpointContext {
                    disposition: Some(Disposition::Notify),
                    draft_reply: Some("noted".into()),
                    ..Default::default()
                },
                None,
            )
            .await
            .unwrap();

        let outcome = h.claim_and_run(&id, MessageStatus::New).await.unwrap();
        assert_eq!(outcome, RunOutcome::Completed(Disposition::Notify));
        assert_eq!(h.sender.count(), 0);
        let msg = h.store.get_message(&id).await.unwrap().unwrap();
        assert_eq!(msg.response_text.as_deref(), Some("noted"));
    }

    #[tokio::test]
    async fn interrupted_send_fails_for_review() {
        let h = harness().await;
        let id = h.ingest("fyi office closed friday").await;
        h.store
            .save_checkpoint(
                &id,
                WorkflowNode::Classified,
                &CheckpointContext {
                    disposition: Some(Disposition::Notify),
                    draft_reply: Some("noted".into()),
                    ..Default::default()
                },
                None,
            )
            .await
            .unwrap();

        let err = h.claim_and_run(&id, MessageStatus::New).await.unwrap_err();
        assert!(matches!(err, WorkflowError::Consistency { .. }));
        assert_eq!(h.sender.count(), 0);
    }

    #[tokio::test]
    async fn unclaimed_message_is_refused() {
        let h = harness().await;
        let id = h.ingest("hello").await;
        let err = h.engine.run(&id).await.unwrap_err();
        assert!(matches!(err, WorkflowError::Conflict { .. }));
    }

    #[tokio::test]
    async fn classifier_sees_channel_history() {
        let h = harness().await;
        h.ingest("morning").await;
        let id = h.ingest("need help asap").await;
        h.claim_and_run(&id, MessageStatus::New).await.unwrap();

        let cp = h.checkpoint(&id).await;
        assert_eq!(cp.context.history.len(), 1);
        assert_eq!(cp.context.history[0].text, "morning");
    }
}
