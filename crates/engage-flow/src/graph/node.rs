use serde::{Deserialize, Serialize};

use engage_core::types::{Channel, MessagePayload, RunStatus};

use crate::predicate::Predicate;

/// A step in a flow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    /// Unique identifier within the definition.
    pub id: String,
    /// Label shown in the flow builder.
    #[serde(default)]
    pub name: Option<String>,
    #[serde(flatten)]
    pub kind: NodeKind,
}

/// The closed set of node types the stepper handles.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeKind {
    /// Dispatch one message or call.
    Send {
        channel: Channel,
        template: String,
        #[serde(default)]
        body: String,
        #[serde(default)]
        cost_class: Option<String>,
    },
    /// Branch on a predicate; follows the `yes` or `no` edge.
    Decision { predicate: Predicate },
    /// Park the run for a fixed duration.
    Delay { seconds: u64 },
    /// Terminal node.
    Exit { outcome: ExitOutcome },
}

/// Tag on an exit node deciding the run's final status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExitOutcome {
    Success,
    Abandoned,
    Failed,
}

impl ExitOutcome {
    pub fn run_status(&self) -> RunStatus {
        match self {
            ExitOutcome::Success => RunStatus::Completed,
            ExitOutcome::Abandoned => RunStatus::Cancelled,
            ExitOutcome::Failed => RunStatus::Failed,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExitOutcome::Success => "success",
            ExitOutcome::Abandoned => "abandoned",
            ExitOutcome::Failed => "failed",
        }
    }
}

impl Node {
    pub fn send(id: impl Into<String>, channel: Channel, template: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            kind: NodeKind::Send {
                channel,
                template: template.into(),
                body: body.into(),
                cost_class: None,
            },
        }
    }

    pub fn decision(id: impl Into<String>, predicate: Predicate) -> Self {
        Self {
            id: id.into(),
            name: None,
            kind: NodeKind::Decision { predicate },
        }
    }

    pub fn delay(id: impl Into<String>, seconds: u64) -> Self {
        Self {
            id: id.into(),
            name: None,
            kind: NodeKind::Delay { seconds },
        }
    }

    pub fn exit(id: impl Into<String>, outcome: ExitOutcome) -> Self {
        Self {
            id: id.into(),
            name: None,
            kind: NodeKind::Exit { outcome },
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn kind_str(&self) -> &'static str {
        match self.kind {
            NodeKind::Send { .. } => "send",
            NodeKind::Decision { .. } => "decision",
            NodeKind::Delay { .. } => "delay",
            NodeKind::Exit { .. } => "exit",
        }
    }

    /// Payload for a send node.
    pub fn payload(&self) -> Option<(Channel, MessagePayload)> {
        match &self.kind {
            NodeKind::Send {
                channel,
                template,
                body,
                cost_class,
            } => Some((
                *channel,
                MessagePayload {
                    template: template.clone(),
                    body: body.clone(),
                    cost_class: cost_class.clone(),
                },
            )),
            _ => None,
        }
    }
}
