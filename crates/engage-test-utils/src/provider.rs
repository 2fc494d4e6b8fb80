use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use futures::future::BoxFuture;
use rust_decimal::Decimal;

use engage_core::traits::ChannelProvider;
use engage_core::types::{Channel, MessagePayload, ProviderError, ProviderReceipt};

/// One scripted provider response.
#[derive(Debug, Clone)]
pub enum ScriptedReply {
    Accepted,
    AcceptedWithCost(Decimal),
    RateLimited,
    /// Transient outage.
    Unavailable,
    /// Provider-confirmed non-delivery.
    Rejected,
    InvalidDestination,
    /// Sleep before accepting; long enough values trip the dispatch timeout.
    Hang(Duration),
}

/// A channel provider that replays scripted replies in order and accepts
/// once the script runs out.
pub struct ScriptedProvider {
    channel: Channel,
    script: Mutex<VecDeque<ScriptedReply>>,
    sent: AtomicUsize,
    destinations: Mutex<Vec<String>>,
}

impl ScriptedProvider {
    pub fn new(channel: Channel) -> Self {
        Self {
            channel,
            script: Mutex::new(VecDeque::new()),
            sent: AtomicUsize::new(0),
            destinations: Mutex::new(Vec::new()),
        }
    }

    pub fn with_script(channel: Channel, replies: Vec<ScriptedReply>) -> Self {
        let provider = Self::new(channel);
        provider.script.lock().unwrap().extend(replies);
        provider
    }

    pub fn push(&self, reply: ScriptedReply) {
        self.script.lock().unwrap().push_back(reply);
    }

    /// Number of calls that reached the provider, failed ones included.
    pub fn sent_count(&self) -> usize {
        self.sent.load(Ordering::SeqCst)
    }

    pub fn destinations(&self) -> Vec<String> {
        self.destinations.lock().unwrap().clone()
    }
}

impl ChannelProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    fn channel(&self) -> Channel {
        self.channel
    }

    fn send(
        &self,
        destination: &str,
        _payload: &MessagePayload,
    ) -> BoxFuture<'_, Result<ProviderReceipt, ProviderError>> {
        let n = self.sent.fetch_add(1, Ordering::SeqCst) + 1;
        self.destinations.lock().unwrap().push(destination.to_string());
        let reply = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(ScriptedReply::Accepted);

        Box::pin(async move {
            let receipt = |cost| ProviderReceipt {
                provider_message_id: format!("scripted-{}", n),
                cost,
            };
            match reply {
                ScriptedReply::Accepted => Ok(receipt(None)),
                ScriptedReply::AcceptedWithCost(cost) => Ok(receipt(Some(cost))),
                ScriptedReply::RateLimited => Err(ProviderError::RateLimited {
                    retry_after_secs: Some(1),
                }),
                ScriptedReply::Unavailable => Err(ProviderError::Unavailable {
                    message: "gateway 503".into(),
                    transient: true,
                }),
                ScriptedReply::Rejected => Err(ProviderError::Unavailable {
                    message: "carrier rejected".into(),
                    transient: false,
                }),
                ScriptedReply::InvalidDestination => {
                    Err(ProviderError::InvalidDestination("unreachable number".into()))
                }
                ScriptedReply::Hang(d) => {
                    tokio::time::sleep(d).await;
                    Ok(receipt(None))
                }
            }
        })
    }
}
