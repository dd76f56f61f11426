//! Classification workflow: data model, classifier, state machine,
//! checkpoints, retry policy, and the engine that ties them together.

pub mod checkpoint;
pub mod classifier;
pub mod engine;
pub mod retry;
pub mod state;
pub mod types;

pub use checkpoint::{Checkpoint, CheckpointContext, HistoryEntry};
pub use classifier::{Classification, ClassificationSource, Classifier, RuleSet};
pub use engine::{RunOutcome, WorkflowEngine};
pub use retry::RetryPolicy;
pub use state::WorkflowNode;
pub use types::{
    Disposition, FeedbackOutcome, FeedbackState, HumanFeedback, Message, MessageStatus,
    NewMessage,
};
