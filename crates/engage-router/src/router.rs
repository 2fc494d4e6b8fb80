use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use engage_core::error::{EngageError, Result};
use engage_core::traits::ConversationSource;
use engage_core::types::{Channel, ContactId, ConversationId, ConversationStatus};

use crate::lanes::{FairQueue, Origin};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    pub contact_id: ContactId,
    pub channel: Channel,
    pub status: ConversationStatus,
    pub last_inbound_at: Option<DateTime<Utc>>,
    pub last_message: Option<String>,
    pub assigned_agent: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub closed_at: Option<DateTime<Utc>>,
    /// Creation order, breaks timestamp ties.
    #[serde(skip)]
    seq: u64,
}

impl Conversation {
    fn last_activity(&self) -> DateTime<Utc> {
        self.last_inbound_at.unwrap_or(self.created_at).max(self.created_at)
    }
}

struct RouterState {
    conversations: HashMap<ConversationId, Conversation>,
    queue: FairQueue,
    next_seq: u64,
}

/// In-memory conversation state and the agent queue.
pub struct ConversationRouter {
    state: Mutex<RouterState>,
}

impl ConversationRouter {
    pub fn new(flow_burst: usize) -> Self {
        Self {
            state: Mutex::new(RouterState {
                conversations: HashMap::new(),
                queue: FairQueue::new(flow_burst),
                next_seq: 0,
            }),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, RouterState>> {
        self.state
            .lock()
            .map_err(|e| EngageError::Database(format!("router state poisoned: {}", e)))
    }

    /// Start a new open conversation.
    pub fn open(&self, contact: &ContactId, channel: Channel, at: DateTime<Utc>) -> Result<ConversationId> {
        let mut state = self.lock()?;
        Ok(open_locked(&mut state, contact, channel, at))
    }

    /// Record a message from a contact. Reuses the contact's live
    /// conversation on that channel, or opens a new one.
    pub fn record_inbound(
        &self,
        contact: &ContactId,
        channel: Channel,
        text: &str,
        at: DateTime<Utc>,
    ) -> Result<ConversationId> {
        let mut state = self.lock()?;
        let existing = state
            .conversations
            .values()
            .filter(|c| {
                &c.contact_id == contact
                    && c.channel == channel
                    && c.status != ConversationStatus::Closed
            })
            .max_by_key(|c| (c.last_activity(), c.seq))
            .map(|c| c.id.clone());

        let id = match existing {
            Some(id) => id,
            None => open_locked(&mut state, contact, channel, at),
        };

        if let Some(conv) = state.conversations.get_mut(&id) {
            conv.last_inbound_at = Some(conv.last_inbound_at.map_or(at, |prev| prev.max(at)));
            conv.last_message = Some(text.to_string());
        }
        debug!(conversation = %id, contact = %contact, channel = %channel, "Inbound message recorded");
        Ok(id)
    }

    pub fn conversation(&self, id: &ConversationId) -> Result<Conversation> {
        self.lock()?
            .conversations
            .get(id)
            .cloned()
            .ok_or_else(|| EngageError::NotFound(format!("conversation {}", id)))
    }

    /// Queue a conversation for an agent. Returns its 1-based position in
    /// service order. Enqueueing an already queued conversation returns its
    /// current position.
    pub fn enqueue(&self, id: &ConversationId, origin: Origin) -> Result<usize> {
        let mut state = self.lock()?;
        let status = state
            .conversations
            .get(id)
            .map(|c| c.status)
            .ok_or_else(|| EngageError::NotFound(format!("conversation {}", id)))?;
        if status == ConversationStatus::Closed {
            return Err(EngageError::Validation(format!("conversation {} is closed", id)));
        }

        if !state.queue.contains(id) {
            state.queue.push(id.clone(), origin);
        }
        let position = state
            .queue
            .position(id)
            .ok_or_else(|| EngageError::NotFound(format!("conversation {} in queue", id)))?;
        debug!(conversation = %id, ?origin, position, "Conversation queued");
        Ok(position)
    }

    /// Hand a conversation to an agent, taking it out of the queue.
    pub fn assign(&self, id: &ConversationId, agent: &str) -> Result<()> {
        let mut state = self.lock()?;
        state.queue.remove(id);
        let conv = state
            .conversations
            .get_mut(id)
            .ok_or_else(|| EngageError::NotFound(format!("conversation {}", id)))?;
        if conv.status == ConversationStatus::Closed {
            return Err(EngageError::Validation(format!("conversation {} is closed", id)));
        }
        conv.status = ConversationStatus::Assigned;
        conv.assigned_agent = Some(agent.to_string());
        info!(conversation = %id, agent, "Conversation assigned");
        Ok(())
    }

    /// Serve the next queued conversation to `agent`.
    pub fn next_for_agent(&self, agent: &str) -> Result<Option<ConversationId>> {
        let mut state = self.lock()?;
        while let Some((id, origin)) = state.queue.pop() {
            if let Some(conv) = state.conversations.get_mut(&id) {
                if conv.status == ConversationStatus::Closed {
                    continue;
                }
                conv.status = ConversationStatus::Assigned;
                conv.assigned_agent = Some(agent.to_string());
                info!(conversation = %id, agent, ?origin, "Conversation served");
                return Ok(Some(id));
            }
        }
        Ok(None)
    }

    pub fn close(&self, id: &ConversationId) -> Result<()> {
        self.close_at(id, Utc::now())
    }

    pub fn close_at(&self, id: &ConversationId, at: DateTime<Utc>) -> Result<()> {
        let mut state = self.lock()?;
        state.queue.remove(id);
        let conv = state
            .conversations
            .get_mut(id)
            .ok_or_else(|| EngageError::NotFound(format!("conversation {}", id)))?;
        if conv.status != ConversationStatus::Closed {
            conv.status = ConversationStatus::Closed;
            conv.closed_at = Some(at);
        }
        info!(conversation = %id, "Conversation closed");
        Ok(())
    }

    /// Forget conversations closed before `before`. Returns how many were
    /// dropped.
    pub fn prune_closed(&self, before: DateTime<Utc>) -> Result<usize> {
        let mut state = self.lock()?;
        let len = state.conversations.len();
        state.conversations.retain(|_, c| {
            !(c.status == ConversationStatus::Closed && c.closed_at.is_some_and(|at| at < before))
        });
        let pruned = len - state.conversations.len();
        if pruned > 0 {
            debug!(pruned, remaining = state.conversations.len(), "Closed conversations pruned");
        }
        Ok(pruned)
    }

    pub fn len(&self) -> usize {
        self.lock().map(|s| s.conversations.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn queue_len(&self) -> usize {
        self.lock().map(|s| s.queue.len()).unwrap_or(0)
    }
}

fn open_locked(
    state: &mut RouterState,
    contact: &ContactId,
    channel: Channel,
    at: DateTime<Utc>,
) -> ConversationId {
    let id = ConversationId::new();
    state.next_seq += 1;
    state.conversations.insert(
        id.clone(),
        Conversation {
            id: id.clone(),
            contact_id: contact.clone(),
            channel,
            status: ConversationStatus::Open,
            last_inbound_at: None,
            last_message: None,
            assigned_agent: None,
            created_at: at,
            closed_at: None,
            seq: state.next_seq,
        },
    );
    id
}

impl ConversationSource for ConversationRouter {
    fn conversation_for(&self, contact: &ContactId, channel: Option<Channel>) -> Option<ConversationId> {
        let state = self.lock().ok()?;
        state
            .conversations
            .values()
            .filter(|c| &c.contact_id == contact && channel.map_or(true, |ch| c.channel == ch))
            .max_by_key(|c| (c.last_activity(), c.seq))
            .map(|c| c.id.clone())
    }

    fn has_replied(&self, conversation: &ConversationId, since: DateTime<Utc>) -> Result<bool> {
        let conv = self.conversation(conversation)?;
        Ok(conv.last_inbound_at.is_some_and(|at| at >= since))
    }

    fn current_status(&self, conversation: &ConversationId) -> Result<ConversationStatus> {
        Ok(self.conversation(conversation)?.status)
    }
}
