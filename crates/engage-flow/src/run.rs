use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use engage_core::types::{ContactId, FlowId, RunId, RunStatus, TenantId};

use crate::graph::FlowDefinition;

/// One entry of a run's append-only step history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    /// 1-based position in the history.
    pub seq: u32,
    pub node: String,
    /// Short machine-readable outcome, e.g. `sent`, `yes`, `rate_limited`.
    pub outcome: String,
    /// Human-readable detail.
    pub detail: String,
    pub timestamp: DateTime<Utc>,
}

/// One execution of a flow against one contact.
///
/// Position and retry state are plain persisted fields so a restarted
/// process resumes from the record alone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    pub flow_id: FlowId,
    pub contact_id: ContactId,
    pub tenant_id: TenantId,
    pub current_node: String,
    pub status: RunStatus,
    pub resume_at: Option<DateTime<Utc>>,
    /// Consecutive retryable failures on the current send node.
    pub retry_count: u32,
    /// Optimistic concurrency token; bumped on every committed transition.
    pub version: i64,
    pub lease_owner: Option<String>,
    pub lease_until: Option<DateTime<Utc>>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub history: Vec<StepRecord>,
}

impl Run {
    /// A fresh run positioned at the entry node.
    pub fn start(def: &FlowDefinition, contact_id: ContactId, now: DateTime<Utc>) -> Self {
        Self {
            id: RunId::new(),
            flow_id: def.id.clone(),
            contact_id,
            tenant_id: def.tenant_id.clone(),
            current_node: def.entry.clone(),
            status: RunStatus::Running,
            resume_at: None,
            retry_count: 0,
            version: 0,
            lease_owner: None,
            lease_until: None,
            started_at: now,
            updated_at: now,
            history: Vec::new(),
        }
    }

    /// Append a step and return its sequence number.
    pub fn record(
        &mut self,
        node: impl Into<String>,
        outcome: impl Into<String>,
        detail: impl Into<String>,
        now: DateTime<Utc>,
    ) -> u32 {
        let seq = self.history.len() as u32 + 1;
        self.history.push(StepRecord {
            seq,
            node: node.into(),
            outcome: outcome.into(),
            detail: detail.into(),
            timestamp: now,
        });
        seq
    }

    /// Sequence number the next recorded step will get.
    pub fn next_seq(&self) -> u32 {
        self.history.len() as u32 + 1
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Whether `owner` may step this run at `now`.
    pub fn is_leased_by(&self, owner: &str, now: DateTime<Utc>) -> bool {
        self.lease_owner.as_deref() == Some(owner) && self.lease_until.is_some_and(|t| t > now)
    }

    /// Move to `status`, dropping any lease and resume time. Waiting runs set
    /// `resume_at` afterwards.
    pub fn settle(&mut self, status: RunStatus) {
        self.status = status;
        self.resume_at = None;
        self.lease_owner = None;
        self.lease_until = None;
    }

    /// Human-readable reason for a terminal run, from its last step.
    pub fn reason(&self) -> Option<String> {
        if !self.is_terminal() {
            return None;
        }
        self.history.last().map(|step| {
            if step.detail.is_empty() {
                step.outcome.clone()
            } else {
                format!("{}: {}", step.outcome, step.detail)
            }
        })
    }
}
