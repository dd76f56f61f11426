//! End-to-end workflow tests through `Driver::run_cycle`.
//!
//! Each test uses an in-memory store and counting stubs for the model, the
//! reply generator and the reply channel, so every external call is visible.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use message_triage::channels::ReplySender;
use message_triage::config::DriverConfig;
use message_triage::driver::Driver;
use message_triage::error::{ChannelError, LlmError};
use message_triage::llm::{
    CompletionRequest, CompletionResponse, FinishReason, LlmProvider, ReplyGenerator,
};
use message_triage::store::{Database, LibSqlBackend};
use message_triage::workflow::{
    Classifier, Disposition, FeedbackOutcome, HistoryEntry, Message, MessageStatus, NewMessage,
    RetryPolicy, RuleSet, WorkflowEngine, WorkflowNode,
};

/// Model stub that always answers with one classification.
struct CannedLlm {
    reply: String,
    calls: AtomicUsize,
}

#[async_trait]
impl LlmProvider for CannedLlm {
    fn model_name(&self) -> &str {
        "canned"
    }

    async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(CompletionResponse {
            content: self.reply.clone(),
            input_tokens: 0,
            output_tokens: 0,
            finish_reason: FinishReason::Stop,
            response_id: None,
        })
    }
}

#[derive(Default)]
struct CountingGenerator {
    calls: AtomicUsize,
    failures_left: AtomicUsize,
}

#[async_trait]
impl ReplyGenerator for CountingGenerator {
    async fn generate_reply(
        &self,
        message: &Message,
        _history: &[HistoryEntry],
    ) -> Result<String, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(LlmError::Timeout {
                provider: "stub".into(),
                timeout: Duration::from_secs(1),
            });
        }
        Ok(format!("Noted: {}", message.text))
    }
}

#[derive(Default)]
struct RecordingSender {
    sent: Mutex<Vec<String>>,
}

impl RecordingSender {
    fn texts(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl ReplySender for RecordingSender {
    fn name(&self) -> &str {
        "recording"
    }

    async fn send(&self, _channel: &str, _thread: Option<&str>, text: &str) -> Result<(), ChannelError> {
        self.sent.lock().unwrap().push(text.to_string());
        Ok(())
    }
}

struct World {
    store: Arc<LibSqlBackend>,
    llm: Arc<CannedLlm>,
    generator: Arc<CountingGenerator>,
    sender: Arc<RecordingSender>,
    engine: Arc<WorkflowEngine>,
}

impl World {
    async fn new() -> Self {
        Self::with_generator(CountingGenerator::default()).await
    }

    async fn with_generator(generator: CountingGenerator) -> Self {
        let store = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let llm = Arc::new(CannedLlm {
            reply: r#"{"classification": "notify", "reasoning": "status update"}"#.into(),
            calls: AtomicUsize::new(0),
        });
        let generator = Arc::new(generator);
        let sender = Arc::new(RecordingSender::default());
        let classifier = Classifier::new(RuleSet::default_rules(), Some(llm.clone()));
        let engine = Arc::new(
            WorkflowEngine::new(store.clone(), Arc::new(classifier), generator.clone(), sender.clone())
                .with_retry(RetryPolicy::immediate(3)),
        );
        Self {
            store,
            llm,
            generator,
            sender,
            engine,
        }
    }

    fn driver(&self) -> Driver {
        Driver::new(self.store.clone(), self.engine.clone(), DriverConfig::default())
    }

    async fn ingest(&self, external_id: &str, text: &str) -> String {
        self.store
            .insert_message(&NewMessage {
                external_id: external_id.into(),
                channel: "C42".into(),
                sender: "U7".into(),
                text: text.into(),
                thread_ts: None,
                ts: Some(format!("{}.0001", Utc::now().timestamp())),
                received_at: Utc::now(),
            })
            .await
            .unwrap()
            .expect("fresh external id")
    }

    async fn message(&self, id: &str) -> Message {
        self.store.get_message(id).await.unwrap().unwrap()
    }
}

#[tokio::test]
async fn hello_is_ignored_without_any_calls() {
    let world = World::new().await;
    let id = world.ingest("e1", "hello").await;

    let report = world.driver().run_cycle().await;
    assert_eq!(report.completed, 1);

    let msg = world.message(&id).await;
    assert_eq!(msg.status, MessageStatus::Completed);
    assert_eq!(msg.disposition, Some(Disposition::Ignore));
    assert_eq!(world.llm.calls.load(Ordering::SeqCst), 0);
    assert_eq!(world.generator.calls.load(Ordering::SeqCst), 0);
    assert!(world.sender.texts().is_empty());
}

#[tokio::test]
async fn notify_makes_one_generation_and_one_send() {
    let world = World::new().await;
    // No rule matches, so the model decides.
    let id = world.ingest("e2", "the quarterly numbers are in the drive").await;

    world.driver().run_cycle().await;

    let msg = world.message(&id).await;
    assert_eq!(msg.status, MessageStatus::Completed);
    assert_eq!(msg.disposition, Some(Disposition::Notify));
    assert_eq!(msg.reasoning.as_deref(), Some("status update"));
    assert_eq!(world.llm.calls.load(Ordering::SeqCst), 1);
    assert_eq!(world.generator.calls.load(Ordering::SeqCst), 1);
    assert_eq!(
        world.sender.texts(),
        vec!["Noted: the quarterly numbers are in the drive".to_string()]
    );
}

#[tokio::test]
async fn respond_waits_for_human_then_sends_their_text() {
    let world = World::new().await;
    let driver = world.driver();
    let id = world.ingest("e3", "need help asap").await;

    driver.run_cycle().await;
    assert_eq!(world.message(&id).await.status, MessageStatus::AwaitingHuman);
    assert!(world.sender.texts().is_empty());

    // Suspended messages are not picked up again on their own.
    let report = driver.run_cycle().await;
    assert_eq!(report.eligible, 0);
    assert_eq!(world.message(&id).await.status, MessageStatus::AwaitingHuman);

    let outcome = world
        .store
        .submit_feedback(&id, "Sure, on it", None)
        .await
        .unwrap();
    assert!(matches!(outcome, FeedbackOutcome::Accepted { .. }));
    assert_eq!(world.message(&id).await.status, MessageStatus::ResumeRequested);

    driver.run_cycle().await;
    let msg = world.message(&id).await;
    assert_eq!(msg.status, MessageStatus::Completed);
    assert_eq!(msg.response_text.as_deref(), Some("Sure, on it"));
    assert_eq!(world.sender.texts(), vec!["Sure, on it".to_string()]);
    assert_eq!(world.generator.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn feedback_after_completion_is_ignored() {
    let world = World::new().await;
    let driver = world.driver();
    let id = world.ingest("e4", "can you check the build?").await;

    driver.run_cycle().await;
    world.store.submit_feedback(&id, "Looking", None).await.unwrap();
    driver.run_cycle().await;

    let late = world.store.submit_feedback(&id, "Again", None).await.unwrap();
    assert!(matches!(late, FeedbackOutcome::Ignored { .. }));
    assert_eq!(driver.run_cycle().await.eligible, 0);
    assert_eq!(world.sender.texts(), vec!["Looking".to_string()]);
}

#[tokio::test]
async fn feedback_against_an_old_version_is_ignored() {
    let world = World::new().await;
    let id = world.ingest("e5", "urgent: prod is down for everyone").await;
    world.driver().run_cycle().await;

    let cp = world.store.load_checkpoint(&id).await.unwrap().unwrap();
    assert_eq!(cp.node, WorkflowNode::AwaitingHuman);

    let stale = world
        .store
        .submit_feedback(&id, "on it", Some(cp.version - 1))
        .await
        .unwrap();
    assert!(matches!(stale, FeedbackOutcome::Ignored { .. }));
    assert_eq!(world.message(&id).await.status, MessageStatus::AwaitingHuman);

    let current = world
        .store
        .submit_feedback(&id, "on it", Some(cp.version))
        .await
        .unwrap();
    assert!(matches!(current, FeedbackOutcome::Accepted { .. }));
}

#[tokio::test]
async fn checkpoint_versions_strictly_increase() {
    let world = World::new().await;
    let driver = world.driver();
    let id = world.ingest("e6", "could you review this?").await;

    driver.run_cycle().await;
    let first = world.store.load_checkpoint(&id).await.unwrap().unwrap();
    world.store.submit_feedback(&id, "done", None).await.unwrap();
    driver.run_cycle().await;
    let last = world.store.load_checkpoint(&id).await.unwrap().unwrap();

    assert_eq!(last.node, WorkflowNode::Responded);
    assert!(last.version > first.version);
}

#[tokio::test]
async fn generation_recovers_within_the_retry_budget() {
    let world = World::with_generator(CountingGenerator {
        failures_left: AtomicUsize::new(2),
        ..Default::default()
    })
    .await;
    let id = world.ingest("e7", "fyi the wifi password changed").await;

    world.driver().run_cycle().await;
    assert_eq!(world.message(&id).await.status, MessageStatus::Completed);
    assert_eq!(world.generator.calls.load(Ordering::SeqCst), 3);
    assert_eq!(world.sender.texts().len(), 1);
}

#[tokio::test]
async fn exhausted_retries_fail_with_recorded_error() {
    let world = World::with_generator(CountingGenerator {
        failures_left: AtomicUsize::new(10),
        ..Default::default()
    })
    .await;
    let id = world.ingest("e8", "reminder: timesheets due").await;

    let report = world.driver().run_cycle().await;
    assert_eq!(report.failed, 1);

    let msg = world.message(&id).await;
    assert_eq!(msg.status, MessageStatus::Failed);
    assert!(msg.last_error.unwrap().contains("generate_reply failed after 3 attempts"));
    assert!(world.sender.texts().is_empty());

    // Failed is terminal.
    assert_eq!(world.driver().run_cycle().await.eligible, 0);
}

#[tokio::test]
async fn duplicate_ingestion_is_dropped() {
    let world = World::new().await;
    world.ingest("dup", "fyi lunch is here").await;
    let again = world
        .store
        .insert_message(&NewMessage {
            external_id: "dup".into(),
            channel: "C42".into(),
            sender: "U7".into(),
            text: "fyi lunch is here".into(),
            thread_ts: None,
            ts: None,
            received_at: Utc::now(),
        })
        .await
        .unwrap();
    assert!(again.is_none());

    world.driver().run_cycle().await;
    assert_eq!(world.sender.texts().len(), 1);
}

#[tokio::test]
async fn concurrent_drivers_run_each_message_once() {
    let world = World::new().await;
    for i in 0..6 {
        world.ingest(&format!("c{i}"), &format!("fyi update {i}")).await;
    }

    let a = world.driver();
    let b = world.driver();
    let (ra, rb) = tokio::join!(a.run_cycle(), b.run_cycle());

    assert_eq!(ra.claimed + rb.claimed, 6);
    assert_eq!(ra.completed + rb.completed, 6);
    assert_eq!(world.sender.texts().len(), 6);
    assert_eq!(world.generator.calls.load(Ordering::SeqCst), 6);
}

#[tokio::test]
async fn stale_claim_is_reset_once_per_period() {
    let world = World::new().await;
    let id = world.ingest("s1", "hello").await;
    // A worker claimed it and died.
    assert!(world.store.claim_message(&id, MessageStatus::New).await.unwrap());

    let cutoff = Utc::now() + chrono::Duration::seconds(1);
    assert_eq!(world.store.sweep_stale_claims(cutoff).await.unwrap(), 1);
    assert_eq!(world.store.sweep_stale_claims(cutoff).await.unwrap(), 0);
    assert_eq!(world.message(&id).await.status, MessageStatus::New);

    world.driver().run_cycle().await;
    let msg = world.message(&id).await;
    assert_eq!(msg.status, MessageStatus::Completed);
    assert_eq!(msg.attempt_count, 2);
}

#[tokio::test]
async fn bot_messages_are_ignored() {
    let world = World::new().await;
    let id = world.ingest("b1", "[BOT_RESPONSE] Noted: need help asap").await;

    world.driver().run_cycle().await;
    let msg = world.message(&id).await;
    assert_eq!(msg.disposition, Some(Disposition::Ignore));
    assert!(world.sender.texts().is_empty());
}
