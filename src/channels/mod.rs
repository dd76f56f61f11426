//! Reply channel abstraction.

pub mod slack;

use async_trait::async_trait;

use crate::error::ChannelError;

pub use slack::SlackSender;

/// Posts reply text back to the conversation platform.
///
/// Not idempotent: every successful call is a visible message.
#[async_trait]
pub trait ReplySender: Send + Sync {
    /// Channel name, for logs and errors.
    fn name(&self) -> &str;

    /// Post `text` to `channel`, threaded under `thread_ts` when given.
    async fn send(
        &self,
        channel: &str,
        thread_ts: Option<&str>,
        text: &str,
    ) -> Result<(), ChannelError>;
}
