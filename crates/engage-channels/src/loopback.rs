use std::sync::atomic::{AtomicU64, Ordering};

use futures::future::BoxFuture;
use tracing::info;

use engage_core::traits::ChannelProvider;
use engage_core::types::{Channel, MessagePayload, ProviderError, ProviderReceipt};

/// Provider that accepts every message and only logs it. Used by the
/// `engage worker` command when no real gateway is wired in.
pub struct LoopbackProvider {
    channel: Channel,
    name: String,
    sent: AtomicU64,
}

impl LoopbackProvider {
    pub fn new(channel: Channel) -> Self {
        Self {
            channel,
            name: format!("loopback-{}", channel.code()),
            sent: AtomicU64::new(0),
        }
    }

    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }
}

impl ChannelProvider for LoopbackProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn channel(&self) -> Channel {
        self.channel
    }

    fn send(
        &self,
        destination: &str,
        payload: &MessagePayload,
    ) -> BoxFuture<'_, Result<ProviderReceipt, ProviderError>> {
        let destination = destination.to_string();
        let template = payload.template.clone();
        let chars = payload.body.chars().count();
        Box::pin(async move {
            let n = self.sent.fetch_add(1, Ordering::Relaxed) + 1;
            info!(
                channel = %self.channel,
                %destination,
                %template,
                chars,
                "Loopback send"
            );
            Ok(ProviderReceipt {
                provider_message_id: format!("{}-{}", self.name, n),
                cost: None,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn loopback_accepts_everything() {
        let provider = LoopbackProvider::new(Channel::WhatsApp);
        assert_eq!(provider.name(), "loopback-whatsapp");
        let payload = MessagePayload {
            template: "promo".into(),
            body: "hello".into(),
            cost_class: None,
        };
        let receipt = provider.send("+15550001111", &payload).await.unwrap();
        assert_eq!(receipt.provider_message_id, "loopback-whatsapp-1");
        assert!(receipt.cost.is_none());
        assert_eq!(provider.sent(), 1);
    }
}
