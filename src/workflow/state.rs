//! Workflow node state machine.

use serde::{Deserialize, Serialize};

use super::types::{Disposition, MessageStatus};

/// A node in a message's workflow.
///
/// The node is what gets checkpointed. It is finer grained than
/// [`MessageStatus`]: several nodes map onto the same status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowNode {
    /// Nothing has happened yet.
    Start,
    /// Disposition decided. When checkpointed for a Notify message this also
    /// records the intent to send the stored draft.
    Classified,
    Ignored,
    Notified,
    /// Suspended until a person replies.
    AwaitingHuman,
    /// Human reply taken. Checkpointed right before that reply is sent.
    Resumed,
    Responded,
    Failed,
}

impl WorkflowNode {
    /// Check if this node allows transitioning to another node.
    pub fn can_transition_to(&self, target: WorkflowNode) -> bool {
        use WorkflowNode::*;

        if target == Failed {
            return !self.is_terminal();
        }

        matches!(
            (self, target),
            (Start, Classified)
                | (Classified, Ignored)
                | (Classified, Notified)
                | (Classified, AwaitingHuman)
                | (AwaitingHuman, Resumed)
                | (Resumed, Responded)
        )
    }

    /// Check if this is a terminal node.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Ignored | Self::Notified | Self::Responded | Self::Failed
        )
    }

    /// Terminal node reached by a disposition without human input.
    pub fn after_classification(disposition: Disposition) -> Self {
        match disposition {
            Disposition::Ignore => Self::Ignored,
            Disposition::Notify => Self::Notified,
            Disposition::Respond => Self::AwaitingHuman,
        }
    }

    /// Message status a run leaves behind when it stops at this node.
    pub fn message_status(&self) -> MessageStatus {
        match self {
            Self::Start | Self::Classified | Self::Resumed => MessageStatus::Processing,
            Self::AwaitingHuman => MessageStatus::AwaitingHuman,
            Self::Ignored | Self::Notified | Self::Responded => MessageStatus::Completed,
            Self::Failed => MessageStatus::Failed,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Classified => "classified",
            Self::Ignored => "ignored",
            Self::Notified => "notified",
            Self::AwaitingHuman => "awaiting_human",
            Self::Resumed => "resumed",
            Self::Responded => "responded",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for WorkflowNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for WorkflowNode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "start" => Ok(Self::Start),
            "classified" => Ok(Self::Classified),
            "ignored" => Ok(Self::Ignored),
            "notified" => Ok(Self::Notified),
            "awaiting_human" => Ok(Self::AwaitingHuman),
            "resumed" => Ok(Self::Resumed),
            "responded" => Ok(Self::Responded),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown workflow node: '{other}'")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [WorkflowNode; 8] = [
        WorkflowNode::Start,
        WorkflowNode::Classified,
        WorkflowNode::Ignored,
        WorkflowNode::Notified,
        WorkflowNode::AwaitingHuman,
        WorkflowNode::Resumed,
        WorkflowNode::Responded,
        WorkflowNode::Failed,
    ];

    #[test]
    fn happy_paths_are_allowed() {
        use WorkflowNode::*;
        assert!(Start.can_transition_to(Classified));
        assert!(Classified.can_transition_to(Ignored));
        assert!(Classified.can_transition_to(Notified));
        assert!(Classified.can_transition_to(AwaitingHuman));
        assert!(AwaitingHuman.can_transition_to(Resumed));
        assert!(Resumed.can_transition_to(Responded));
    }

    #[test]
    fn skipping_nodes_is_rejected() {
        use WorkflowNode::*;
        assert!(!Start.can_transition_to(Notified));
        assert!(!AwaitingHuman.can_transition_to(Responded));
        assert!(!Classified.can_transition_to(Resumed));
    }

    #[test]
    fn failed_reachable_from_every_non_terminal() {
        for node in ALL {
            assert_eq!(
                node.can_transition_to(WorkflowNode::Failed),
                !node.is_terminal(),
                "{node}"
            );
        }
    }

    #[test]
    fn terminal_nodes_have_no_exits() {
        for from in ALL.iter().filter(|n| n.is_terminal()) {
            for to in ALL {
                assert!(!from.can_transition_to(to), "{from} -> {to}");
            }
        }
    }

    #[test]
    fn terminal_nodes_map_to_terminal_statuses() {
        for node in ALL {
            assert_eq!(node.is_terminal(), node.message_status().is_terminal());
        }
    }

    #[test]
    fn disposition_targets() {
        assert_eq!(
            WorkflowNode::after_classification(Disposition::Respond),
            WorkflowNode::AwaitingHuman
        );
        assert_eq!(
            WorkflowNode::after_classification(Disposition::Ignore),
            WorkflowNode::Ignored
        );
    }

    #[test]
    fn node_serde_matches_display() {
        for node in ALL {
            let json = serde_json::to_string(&node).unwrap();
            assert_eq!(json, format!("\"{node}\""));
            assert_eq!(node.as_str().parse::<WorkflowNode>().unwrap(), node);
        }
    }
}
