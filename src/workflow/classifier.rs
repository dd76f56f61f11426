//! Message classifier.
//!
//! Ordered regex rules run first and short-circuit obvious cases:
//! - empty text, our own bot messages, bare greetings/acks → Ignore
//! - urgent asks and direct requests for help → Respond
//! - status updates, announcements, reminders → Notify
//!
//! Only when no rule matches is the LLM asked. Model output is untrusted: it
//! must parse into one of the three dispositions, and anything else falls back
//! to Respond so a person takes a look.

use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::LlmError;
use crate::config::DEFAULT_BOT_PREFIX;
use crate::llm::generator::format_history;
use crate::llm::provider::{ChatMessage, CompletionRequest, LlmProvider};
use crate::workflow::checkpoint::HistoryEntry;
use crate::workflow::types::{Disposition, Message};

const TRIAGE_PREAMBLE: &str = "\
You triage Slack messages for a busy team lead. Categorize the message into exactly one of:
- ignore: not worth responding to or tracking (social chatter, bot noise, messages meant for others)
- notify: worth knowing but needs no reply (status updates such as out sick or working from home, \
announcements, FYIs, reminders)
- respond: needs a direct reply (questions, requests for help, incidents, anything urgent)
Answer with a JSON object only: {\"classification\": \"ignore|notify|respond\", \"reasoning\": \"...\"}";

/// What produced a classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassificationSource {
    Rule,
    Model,
    /// No rule matched and the model was unavailable or unusable.
    Fallback,
}

impl std::fmt::Display for ClassificationSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Rule => "rule",
            Self::Model => "model",
            Self::Fallback => "fallback",
        };
        write!(f, "{s}")
    }
}

/// A disposition plus why it was chosen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub disposition: Disposition,
    pub rationale: String,
    pub source: ClassificationSource,
}

/// A single text rule with a compiled regex.
#[derive(Debug, Clone)]
pub struct Rule {
    pub regex: Regex,
    pub disposition: Disposition,
    /// Why this rule triggers.
    pub reason: String,
}

/// Ordered rule list. First match wins.
#[derive(Debug, Clone)]
pub struct RuleSet {
    rules: Vec<Rule>,
}

impl RuleSet {
    /// Create a rule set with the default patterns.
    pub fn default_rules() -> Self {
        let rules = vec![
            // Bare greetings and acknowledgements
            Rule {
                regex: Regex::new(
                    r"(?i)^\s*(hi|hello|hey|yo|hiya|good (morning|afternoon|evening)|thanks|thank you|thx|ty|ok|okay|k|cool|nice|great|lol|np|no problem|sounds good|👍|:\+1:|:thumbsup:)(\s+(all|everyone|team|folks))?[\s!.,]*$",
                )
                .unwrap(),
                disposition: Disposition::Ignore,
                reason: "greeting or acknowledgement".into(),
            },
            // Channel membership chatter
            Rule {
                regex: Regex::new(r"(?i)has (joined|left) the channel").unwrap(),
                disposition: Disposition::Ignore,
                reason: "channel membership event".into(),
            },
            // Urgent or direct asks
            Rule {
                regex: Regex::new(
                    r"(?i)\b(asap|urgent(ly)?|emergency|outage|down for everyone|incident|blocker|blocked|help|need (you|your)|can you|could you|please (review|check|advise))\b",
                )
                .unwrap(),
                disposition: Disposition::Respond,
                reason: "direct or urgent request".into(),
            },
            // Status updates and announcements
            Rule {
                regex: Regex::new(
                    r"(?i)\b(wfh|working from home|out sick|sick today|ooo|out of (the )?office|on vacation|pto|running late|heads[- ]up|fyi|reminder|announcement)\b",
                )
                .unwrap(),
                disposition: Disposition::Notify,
                reason: "status update or announcement".into(),
            },
        ];
        Self { rules }
    }

    /// Create an empty rule set (for testing).
    pub fn empty() -> Self {
        Self { rules: Vec::new() }
    }

    /// Append a custom rule. It runs after the existing ones.
    pub fn add_rule(
        &mut self,
        pattern: &str,
        disposition: Disposition,
        reason: &str,
    ) -> Result<(), regex::Error> {
        self.rules.push(Rule {
            regex: Regex::new(pattern)?,
            disposition,
            reason: reason.into(),
        });
        Ok(())
    }

    /// First matching rule, if any.
    pub fn evaluate(&self, text: &str) -> Option<&Rule> {
        self.rules.iter().find(|rule| rule.regex.is_match(text))
    }
}

/// Maps a message and its history to a [`Classification`].
///
/// Never mutates any store. Without a model, unmatched messages fall back to
/// Respond.
pub struct Classifier {
    rules: RuleSet,
    llm: Option<Arc<dyn LlmProvider>>,
    bot_prefix: String,
    timeout: Duration,
}

impl Classifier {
    pub fn new(rules: RuleSet, llm: Option<Arc<dyn LlmProvider>>) -> Self {
        Self {
            rules,
            llm,
            bot_prefix: DEFAULT_BOT_PREFIX.to_string(),
            timeout: Duration::from_secs(30),
        }
    }

    pub fn with_bot_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.bot_prefix = prefix.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Classify a message. History is oldest first and may be empty.
    pub async fn classify(&self, message: &Message, history: &[HistoryEntry]) -> Classification {
        if let Some(classification) = self.classify_by_rules(&message.text) {
            debug!(
                id = %message.id,
                disposition = %classification.disposition,
                reason = %classification.rationale,
                "Rule matched, skipping LLM"
            );
            return classification;
        }

        let Some(llm) = &self.llm else {
            return fallback("no rule matched and no model configured".into());
        };

        match self.classify_with_model(llm.as_ref(), message, history).await {
            Ok(classification) => classification,
            Err(reason) => {
                warn!(id = %message.id, reason = %reason, "Model triage unusable, falling back");
                fallback(format!("model triage unusable: {reason}"))
            }
        }
    }

    /// Deterministic part of classification.
    pub fn classify_by_rules(&self, text: &str) -> Option<Classification> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Some(rule_hit(Disposition::Ignore, "empty message"));
        }
        if !self.bot_prefix.is_empty() && trimmed.starts_with(&self.bot_prefix) {
            return Some(rule_hit(Disposition::Ignore, "our own bot message"));
        }
        self.rules
            .evaluate(trimmed)
            .map(|rule| rule_hit(rule.disposition, &rule.reason))
    }

    async fn classify_with_model(
        &self,
        llm: &dyn LlmProvider,
        message: &Message,
        history: &[HistoryEntry],
    ) -> Result<Classification, String> {
        let prompt = format!(
            "Recent messages in this channel:\n{}\n\n\
             Please determine how to handle the below Slack message:\n\n\
             Channel: {}\nFrom: {}\nMessage: {}",
            format_history(history),
            message.channel,
            message.sender,
            message.text,
        );
        let request = CompletionRequest::new(vec![
            ChatMessage::system(TRIAGE_PREAMBLE),
            ChatMessage::user(prompt),
        ])
        .with_max_tokens(300)
        .with_temperature(0.0);

        let response = tokio::time::timeout(self.timeout, llm.complete(request))
            .await
            .map_err(|_| {
                LlmError::Timeout {
                    provider: llm.model_name().to_string(),
                    timeout: self.timeout,
                }
                .to_string()
            })?
            .map_err(|e| e.to_string())?;

        parse_triage_response(&response.content)
    }
}

fn rule_hit(disposition: Disposition, reason: &str) -> Classification {
    Classification {
        disposition,
        rationale: reason.to_string(),
        source: ClassificationSource::Rule,
    }
}

fn fallback(rationale: String) -> Classification {
    Classification {
        disposition: Disposition::Respond,
        rationale,
        source: ClassificationSource::Fallback,
    }
}

#[derive(Debug, Deserialize)]
struct TriageResponse {
    classification: String,
    #[serde(default)]
    reasoning: String,
}

/// Parse the LLM triage response into a `Classification`.
fn parse_triage_response(raw: &str) -> Result<Classification, String> {
    let json_str = extract_json_object(raw);
    let response: TriageResponse =
        serde_json::from_str(&json_str).map_err(|e| format!("JSON parse error: {e}"))?;

    let disposition = response.classification.parse::<Disposition>()?;
    Ok(Classification {
        disposition,
        rationale: if response.reasoning.trim().is_empty() {
            format!("model triage: {disposition}")
        } else {
            response.reasoning.trim().to_string()
        },
        source: ClassificationSource::Model,
    })
}

/// Pull a JSON object out of a model reply that may be wrapped in prose or a
/// markdown fence.
fn extract_json_object(text: &str) -> String {
    let trimmed = text.trim();

    if trimmed.starts_with('{') {
        return trimmed.to_string();
    }

    if let Some(start) = trimmed.find("```json") {
        let after = &trimmed[start + 7..];
        if let Some(end) = after.find("```") {
            return after[..end].trim().to_string();
        }
    }

    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        if let Some(end) = after.find("```") {
            let inner = after[..end].trim();
            if inner.starts_with('{') {
                return inner.to_string();
            }
        }
    }

    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}'))
        && end > start
    {
        return trimmed[start..=end].to_string();
    }

    trimmed.to_string()
}
