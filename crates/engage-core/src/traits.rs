use chrono::{DateTime, Utc};
use futures::future::BoxFuture;

use crate::error::Result;
use crate::types::*;

/// One external gateway per channel.
pub trait ChannelProvider: Send + Sync + 'static {
    /// Provider name (e.g., "twilio-sms", "loopback").
    fn name(&self) -> &str;

    /// The channel this provider serves.
    fn channel(&self) -> Channel;

    /// Hand a message to the provider.
    fn send(
        &self,
        destination: &str,
        payload: &MessagePayload,
    ) -> BoxFuture<'_, std::result::Result<ProviderReceipt, ProviderError>>;
}

/// Read-only view of conversation state, consumed by decision nodes.
///
/// Methods are synchronous: predicate evaluation never suspends.
pub trait ConversationSource: Send + Sync + 'static {
    /// The most recent conversation for a contact, optionally on one channel.
    fn conversation_for(&self, contact: &ContactId, channel: Option<Channel>)
        -> Option<ConversationId>;

    /// Whether the contact sent an inbound message at or after `since`.
    fn has_replied(&self, conversation: &ConversationId, since: DateTime<Utc>) -> Result<bool>;

    /// Current status of a conversation.
    fn current_status(&self, conversation: &ConversationId) -> Result<ConversationStatus>;
}

/// Contact lookup, backed by the contacts collaborator.
pub trait ContactDirectory: Send + Sync + 'static {
    fn contact(&self, id: &ContactId) -> Result<Option<Contact>>;
}
