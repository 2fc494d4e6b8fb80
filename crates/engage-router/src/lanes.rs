use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use engage_core::types::ConversationId;

/// Who put a conversation in the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    /// A contact wrote in and wants a person.
    Human,
    /// A flow handed the conversation over.
    Flow,
}

/// Two FIFO lanes with bounded flow bursts.
///
/// While a human-originated item waits, at most `flow_burst` flow items are
/// served back to back before the human lane gets a turn. With no human
/// waiting, flow items drain freely.
#[derive(Debug, Clone)]
pub struct FairQueue {
    human: VecDeque<ConversationId>,
    flow: VecDeque<ConversationId>,
    flow_burst: usize,
    /// Flow items served in a row while a human item waited.
    streak: usize,
}

impl FairQueue {
    pub fn new(flow_burst: usize) -> Self {
        Self {
            human: VecDeque::new(),
            flow: VecDeque::new(),
            flow_burst,
            streak: 0,
        }
    }

    pub fn push(&mut self, id: ConversationId, origin: Origin) {
        match origin {
            Origin::Human => self.human.push_back(id),
            Origin::Flow => self.flow.push_back(id),
        }
    }

    pub fn pop(&mut self) -> Option<(ConversationId, Origin)> {
        let human_turn = !self.human.is_empty()
            && (self.flow.is_empty() || self.streak >= self.flow_burst);

        if human_turn {
            self.streak = 0;
            return self.human.pop_front().map(|id| (id, Origin::Human));
        }

        let id = self.flow.pop_front()?;
        if self.human.is_empty() {
            self.streak = 0;
        } else {
            self.streak += 1;
        }
        Some((id, Origin::Flow))
    }

    /// 1-based position in service order, found by replaying `pop` on a copy.
    pub fn position(&self, id: &ConversationId) -> Option<usize> {
        if !self.contains(id) {
            return None;
        }
        let mut sim = self.clone();
        let mut pos = 0;
        while let Some((next, _)) = sim.pop() {
            pos += 1;
            if &next == id {
                return Some(pos);
            }
        }
        None
    }

    pub fn contains(&self, id: &ConversationId) -> bool {
        self.human.contains(id) || self.flow.contains(id)
    }

    pub fn remove(&mut self, id: &ConversationId) -> bool {
        let before = self.len();
        self.human.retain(|x| x != id);
        self.flow.retain(|x| x != id);
        before != self.len()
    }

    pub fn len(&self) -> usize {
        self.human.len() + self.flow.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
