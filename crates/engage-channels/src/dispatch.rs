use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use chrono::Utc;
use regex::Regex;
use rust_decimal::Decimal;
use tracing::{debug, error, info, warn};

use engage_core::error::{EngageError, Result};
use engage_core::event::EventBus;
use engage_core::traits::ChannelProvider;
use engage_core::types::{
    Channel, EngineEvent, MessagePayload, ProviderError, ProviderReceipt, TenantId,
};
use engage_ledger::{LedgerStore, Reason};

use crate::attempts::{AttemptJournal, AttemptOutcome, DispatchAttempt};
use crate::pricing::Pricing;

/// One outbound message or call.
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub channel: Channel,
    pub destination: String,
    pub payload: MessagePayload,
    pub tenant_id: TenantId,
    /// Idempotency key for the charge, e.g. `{run_id}#{step}`.
    pub reference: String,
}

/// An accepted send.
#[derive(Debug, Clone)]
pub struct DispatchResult {
    pub accepted: bool,
    pub provider_message_id: String,
    /// Net amount charged to the tenant.
    pub cost: Decimal,
}

/// Clears the cost of a send through the ledger, hands the message to the
/// channel's provider and compensates on failure.
///
/// The dispatcher never retries; it classifies failures and leaves the
/// decision to the caller.
pub struct ChannelDispatcher {
    providers: HashMap<Channel, Arc<dyn ChannelProvider>>,
    ledger: Arc<LedgerStore>,
    journal: Arc<AttemptJournal>,
    pricing: Pricing,
    timeout: Duration,
    events: Option<Arc<EventBus>>,
}

impl ChannelDispatcher {
    pub fn new(
        ledger: Arc<LedgerStore>,
        journal: Arc<AttemptJournal>,
        pricing: Pricing,
        timeout: Duration,
    ) -> Self {
        Self {
            providers: HashMap::new(),
            ledger,
            journal,
            pricing,
            timeout,
            events: None,
        }
    }

    /// Register the provider for its channel. Replaces any earlier one.
    pub fn add_provider(&mut self, provider: Arc<dyn ChannelProvider>) {
        let channel = provider.channel();
        if let Some(old) = self.providers.insert(channel, provider) {
            warn!(channel = %channel, replaced = %old.name(), "Channel provider replaced");
        }
    }

    pub fn set_events(&mut self, events: Arc<EventBus>) {
        self.events = Some(events);
    }

    pub fn has_provider(&self, channel: Channel) -> bool {
        self.providers.contains_key(&channel)
    }

    /// Channels with a registered provider.
    pub fn channels(&self) -> Vec<Channel> {
        let mut channels: Vec<Channel> = self.providers.keys().copied().collect();
        channels.sort();
        channels
    }

    pub fn pricing(&self) -> &Pricing {
        &self.pricing
    }

    pub fn journal(&self) -> &Arc<AttemptJournal> {
        &self.journal
    }

    /// Dispatch one message.
    ///
    /// Order: estimate, debit, send under timeout, refund on failure.
    /// Insufficient funds never reaches the provider. Exactly one attempt
    /// record is written per call.
    pub async fn send(&self, req: &DispatchRequest) -> Result<DispatchResult> {
        let mut attempt = DispatchAttempt {
            id: uuid::Uuid::new_v4().to_string(),
            tenant_id: req.tenant_id.clone(),
            reference: req.reference.clone(),
            channel: req.channel,
            destination: req.destination.trim().to_string(),
            estimated_cost: Decimal::ZERO,
            charged: Decimal::ZERO,
            refunded: false,
            outcome: AttemptOutcome::Rejected,
            provider_message_id: None,
            error: None,
            created_at: Utc::now(),
        };

        let result = self.dispatch(req, &mut attempt).await;

        match &result {
            Ok(r) => {
                attempt.outcome = AttemptOutcome::Accepted;
                attempt.provider_message_id = Some(r.provider_message_id.clone());
                attempt.charged = r.cost;
            }
            Err(e) => {
                attempt.outcome = AttemptOutcome::from_error(e);
                attempt.error = Some(e.to_string());
            }
        }

        if let Err(e) = self.journal.record(&attempt) {
            error!(reference = %req.reference, error = %e, "Failed to record dispatch attempt");
        }

        if let Some(ref events) = self.events {
            events.publish(EngineEvent::DispatchAttempted {
                tenant_id: req.tenant_id.clone(),
                channel: req.channel,
                outcome: attempt.outcome.as_str().to_string(),
                cost: attempt.charged,
            });
        }

        result
    }

    async fn dispatch(
        &self,
        req: &DispatchRequest,
        attempt: &mut DispatchAttempt,
    ) -> Result<DispatchResult> {
        let provider = self.providers.get(&req.channel).cloned().ok_or_else(|| {
            EngageError::ChannelUnavailable {
                channel: req.channel.to_string(),
                message: "no provider configured".into(),
                transient: false,
            }
        })?;

        let destination = validate_destination(req.channel, &req.destination)?;

        let cost = self.pricing.estimate(req.channel, &req.payload)?;
        attempt.estimated_cost = cost;

        let reference = self.charge_reference(req)?;
        if cost > Decimal::ZERO {
            // A replayed reference returns the original debit; its amount is
            // what the tenant actually paid.
            let debit = self
                .ledger
                .debit(&req.tenant_id, cost, Reason::MessageCost, Some(&reference))?;
            attempt.charged = -debit.amount;
        }

        debug!(
            channel = %req.channel,
            provider = %provider.name(),
            tenant = %req.tenant_id,
            %reference,
            %cost,
            "Dispatching"
        );

        let sent = match tokio::time::timeout(
            self.timeout,
            provider.send(destination, &req.payload),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(ProviderError::Unavailable {
                message: format!("timed out after {}ms", self.timeout.as_millis()),
                transient: true,
            }),
        };

        match sent {
            Ok(receipt) => {
                let charged = self.reconcile(req, &reference, attempt.charged, &receipt);
                info!(
                    channel = %req.channel,
                    tenant = %req.tenant_id,
                    message_id = %receipt.provider_message_id,
                    cost = %charged,
                    "Message accepted"
                );
                Ok(DispatchResult {
                    accepted: true,
                    provider_message_id: receipt.provider_message_id,
                    cost: charged,
                })
            }
            Err(pe) => {
                warn!(channel = %req.channel, %reference, error = %pe, "Dispatch failed");
                if attempt.charged > Decimal::ZERO {
                    self.ledger
                        .credit(&req.tenant_id, attempt.charged, Reason::Refund, Some(&reference))?;
                    attempt.refunded = true;
                    attempt.charged = Decimal::ZERO;
                }
                Err(pe.into_engage(req.channel))
            }
        }
    }

    /// Ledger reference for this attempt's charge. A request reference whose
    /// debit was already refunded gets a numbered suffix, so a replayed send
    /// is charged again instead of riding on the refunded debit.
    fn charge_reference(&self, req: &DispatchRequest) -> Result<String> {
        let mut reference = req.reference.clone();
        let mut n = 0u32;
        while self
            .ledger
            .find_by_reference(&req.tenant_id, Reason::Refund, &reference)?
            .is_some()
        {
            n += 1;
            reference = format!("{}:r{}", req.reference, n);
        }
        if n > 0 {
            debug!(reference = %req.reference, charge = %reference, "Earlier charge was refunded");
        }
        Ok(reference)
    }

    /// Settle the difference between what was debited and the
    /// provider-billed cost. Returns the net amount charged.
    fn reconcile(&self, req: &DispatchRequest, reference: &str, estimated: Decimal, receipt: &ProviderReceipt) -> Decimal {
        let actual = match receipt.cost {
            Some(actual) if actual >= Decimal::ZERO => actual,
            _ => return estimated,
        };

        if actual < estimated {
            let diff = estimated - actual;
            match self
                .ledger
                .credit(&req.tenant_id, diff, Reason::Adjustment, Some(reference))
            {
                Ok(_) => actual,
                Err(e) => {
                    error!(%reference, error = %e, "Failed to credit cost adjustment");
                    estimated
                }
            }
        } else if actual > estimated {
            let diff = actual - estimated;
            let adjustment = format!("{}:adj", reference);
            match self
                .ledger
                .debit(&req.tenant_id, diff, Reason::Adjustment, Some(&adjustment))
            {
                Ok(_) => actual,
                Err(e) => {
                    // The message is already out; absorb the difference.
                    warn!(%reference, %diff, error = %e, "Cost adjustment not charged");
                    estimated
                }
            }
        } else {
            estimated
        }
    }
}

fn e164() -> &'static Regex {
    static E164: OnceLock<Regex> = OnceLock::new();
    E164.get_or_init(|| Regex::new(r"^\+[1-9]\d{6,14}$").expect("E.164 pattern is valid"))
}

/// Check a destination address before any money moves. Returns the
/// address with surrounding whitespace removed.
pub fn validate_destination(channel: Channel, destination: &str) -> Result<&str> {
    let destination = destination.trim();
    if destination.is_empty() {
        return Err(EngageError::InvalidDestination {
            channel: channel.to_string(),
            message: "empty destination".into(),
        });
    }

    let ok = match channel {
        Channel::Sms | Channel::WhatsApp | Channel::Voip => e164().is_match(destination),
        // RCS also accepts `sip:` agent-side identifiers
        Channel::Rcs => e164().is_match(destination) || destination.starts_with("sip:"),
    };

    if ok {
        Ok(destination)
    } else {
        Err(EngageError::InvalidDestination {
            channel: channel.to_string(),
            message: format!("'{}' is not a valid address", destination),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use engage_ledger::NewTenant;
    use engage_test_utils::{ScriptedProvider, ScriptedReply};

    fn setup(balance: i64, provider: Arc<ScriptedProvider>) -> (ChannelDispatcher, Arc<LedgerStore>, TenantId) {
        let ledger = Arc::new(LedgerStore::in_memory().unwrap());
        let tenant = ledger.create_tenant(NewTenant::root("t1", "USD")).unwrap().id;
        if balance > 0 {
            ledger.apply_topup(&tenant, Decimal::new(balance, 2), "seed").unwrap();
        }
        let journal = Arc::new(AttemptJournal::in_memory().unwrap());
        let mut dispatcher = ChannelDispatcher::new(
            ledger.clone(),
            journal,
            Pricing::default(),
            Duration::from_millis(200),
        );
        dispatcher.add_provider(provider);
        (dispatcher, ledger, tenant)
    }

    fn sms(tenant: &TenantId, reference: &str) -> DispatchRequest {
        DispatchRequest {
            channel: Channel::Sms,
            destination: "+15550001111".into(),
            payload: MessagePayload {
                template: "welcome".into(),
                body: "Hi there".into(),
                cost_class: None,
            },
            tenant_id: tenant.clone(),
            reference: reference.into(),
        }
    }

    #[tokio::test]
    async fn accepted_send_is_charged() {
        let provider = Arc::new(ScriptedProvider::new(Channel::Sms));
        let (dispatcher, ledger, t) = setup(100, provider.clone());

        let result = dispatcher.send(&sms(&t, "r1")).await.unwrap();
        assert!(result.accepted);
        assert_eq!(result.cost, Decimal::new(5, 2));
        assert_eq!(ledger.balance(&t).unwrap(), Decimal::new(95, 2));
        assert_eq!(provider.sent_count(), 1);

        let attempts = dispatcher.journal().for_reference("r1").unwrap();
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].outcome, AttemptOutcome::Accepted);
    }

    #[tokio::test]
    async fn insufficient_funds_never_dispatches() {
        let provider = Arc::new(ScriptedProvider::new(Channel::Sms));
        let (dispatcher, ledger, t) = setup(4, provider.clone());

        let err = dispatcher.send(&sms(&t, "r1")).await.unwrap_err();
        assert!(matches!(err, EngageError::InsufficientFunds { .. }));
        assert_eq!(provider.sent_count(), 0);
        assert_eq!(ledger.balance(&t).unwrap(), Decimal::new(4, 2));

        let attempts = dispatcher.journal().for_reference("r1").unwrap();
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].outcome, AttemptOutcome::InsufficientFunds);
    }

    #[tokio::test]
    async fn failed_send_is_refunded() {
        let provider = Arc::new(ScriptedProvider::new(Channel::Sms));
        provider.push(ScriptedReply::RateLimited);
        let (dispatcher, ledger, t) = setup(100, provider.clone());

        let err = dispatcher.send(&sms(&t, "r1")).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(ledger.balance(&t).unwrap(), Decimal::ONE);
        assert!(ledger.verify(&t).unwrap());
        // topup, debit, refund
        assert_eq!(ledger.history(&t, 10).unwrap().len(), 3);

        let attempt = &dispatcher.journal().for_reference("r1").unwrap()[0];
        assert!(attempt.refunded);
        assert_eq!(attempt.charged, Decimal::ZERO);
    }

    #[tokio::test]
    async fn invalid_destination_costs_nothing() {
        let provider = Arc::new(ScriptedProvider::new(Channel::Sms));
        let (dispatcher, ledger, t) = setup(100, provider.clone());

        let mut req = sms(&t, "r1");
        req.destination = "not-a-number".into();
        let err = dispatcher.send(&req).await.unwrap_err();
        assert!(matches!(err, EngageError::InvalidDestination { .. }));
        assert!(!err.is_retryable());
        assert_eq!(provider.sent_count(), 0);
        assert_eq!(ledger.history(&t, 10).unwrap().len(), 1);

        // Provider-side rejection is refunded to the same net effect
        provider.push(ScriptedReply::InvalidDestination);
        let err = dispatcher.send(&sms(&t, "r2")).await.unwrap_err();
        assert!(matches!(err, EngageError::InvalidDestination { .. }));
        assert_eq!(ledger.balance(&t).unwrap(), Decimal::ONE);
    }

    #[tokio::test]
    async fn timeout_is_transient_and_refunded() {
        let provider = Arc::new(ScriptedProvider::new(Channel::Sms));
        provider.push(ScriptedReply::Hang(Duration::from_secs(5)));
        let (dispatcher, ledger, t) = setup(100, provider);

        let err = dispatcher.send(&sms(&t, "r1")).await.unwrap_err();
        assert!(matches!(err, EngageError::ChannelUnavailable { transient: true, .. }));
        assert_eq!(ledger.balance(&t).unwrap(), Decimal::ONE);
    }

    #[tokio::test]
    async fn missing_provider_is_terminal() {
        let provider = Arc::new(ScriptedProvider::new(Channel::Sms));
        let (dispatcher, _ledger, t) = setup(100, provider);

        let mut req = sms(&t, "r1");
        req.channel = Channel::Voip;
        let err = dispatcher.send(&req).await.unwrap_err();
        assert!(matches!(err, EngageError::ChannelUnavailable { transient: false, .. }));
        assert!(!dispatcher.has_provider(Channel::Voip));
        assert_eq!(dispatcher.channels(), vec![Channel::Sms]);
        assert_eq!(dispatcher.journal().count().unwrap(), 1);
    }

    #[tokio::test]
    async fn reported_cost_is_reconciled() {
        let provider = Arc::new(ScriptedProvider::new(Channel::Sms));
        provider.push(ScriptedReply::AcceptedWithCost(Decimal::new(3, 2)));
        provider.push(ScriptedReply::AcceptedWithCost(Decimal::new(7, 2)));
        let (dispatcher, ledger, t) = setup(100, provider);

        let cheaper = dispatcher.send(&sms(&t, "r1")).await.unwrap();
        assert_eq!(cheaper.cost, Decimal::new(3, 2));
        assert_eq!(ledger.balance(&t).unwrap(), Decimal::new(97, 2));

        let dearer = dispatcher.send(&sms(&t, "r2")).await.unwrap();
        assert_eq!(dearer.cost, Decimal::new(7, 2));
        assert_eq!(ledger.balance(&t).unwrap(), Decimal::new(90, 2));
        assert!(ledger.verify(&t).unwrap());
    }

    #[tokio::test]
    async fn replayed_reference_is_not_charged_twice() {
        let provider = Arc::new(ScriptedProvider::new(Channel::Sms));
        let (dispatcher, ledger, t) = setup(100, provider.clone());

        dispatcher.send(&sms(&t, "run-1#0")).await.unwrap();
        dispatcher.send(&sms(&t, "run-1#0")).await.unwrap();
        assert_eq!(provider.sent_count(), 2);
        assert_eq!(ledger.balance(&t).unwrap(), Decimal::new(95, 2));
    }

    #[tokio::test]
    async fn replay_after_refund_is_charged_afresh() {
        let provider = Arc::new(ScriptedProvider::new(Channel::Sms));
        provider.push(ScriptedReply::RateLimited);
        let (dispatcher, ledger, t) = setup(100, provider.clone());

        // Fails and is refunded; the caller never recorded the outcome.
        dispatcher.send(&sms(&t, "run-1#1")).await.unwrap_err();
        assert_eq!(ledger.balance(&t).unwrap(), Decimal::ONE);

        let result = dispatcher.send(&sms(&t, "run-1#1")).await.unwrap();
        assert!(result.accepted);
        assert_eq!(result.cost, Decimal::new(5, 2));
        assert_eq!(ledger.balance(&t).unwrap(), Decimal::new(95, 2));
        assert!(ledger
            .find_by_reference(&t, Reason::MessageCost, "run-1#1:r1")
            .unwrap()
            .is_some());
        assert!(ledger.verify(&t).unwrap());

        // Replaying the accepted attempt again does not charge a third time.
        dispatcher.send(&sms(&t, "run-1#1")).await.unwrap();
        assert_eq!(ledger.balance(&t).unwrap(), Decimal::new(95, 2));
        assert_eq!(provider.sent_count(), 3);
    }

    #[tokio::test]
    async fn second_refunded_replay_gets_its_own_refund() {
        let provider = Arc::new(ScriptedProvider::new(Channel::Sms));
        provider.push(ScriptedReply::Unavailable);
        provider.push(ScriptedReply::Unavailable);
        let (dispatcher, ledger, t) = setup(100, provider);

        dispatcher.send(&sms(&t, "run-2#1")).await.unwrap_err();
        dispatcher.send(&sms(&t, "run-2#1")).await.unwrap_err();
        assert_eq!(ledger.balance(&t).unwrap(), Decimal::ONE);
        assert!(ledger
            .find_by_reference(&t, Reason::Refund, "run-2#1:r1")
            .unwrap()
            .is_some());

        let result = dispatcher.send(&sms(&t, "run-2#1")).await.unwrap();
        assert_eq!(result.cost, Decimal::new(5, 2));
        assert_eq!(ledger.balance(&t).unwrap(), Decimal::new(95, 2));
    }

    #[tokio::test]
    async fn destination_is_trimmed_before_send() {
        let provider = Arc::new(ScriptedProvider::new(Channel::Sms));
        let (dispatcher, _ledger, t) = setup(100, provider.clone());

        let mut req = sms(&t, "r1");
        req.destination = "  +15550001111\n".into();
        dispatcher.send(&req).await.unwrap();
        assert_eq!(provider.destinations(), vec!["+15550001111".to_string()]);
        let attempt = &dispatcher.journal().for_reference("r1").unwrap()[0];
        assert_eq!(attempt.destination, "+15550001111");
    }

    #[test]
    fn destination_formats() {
        assert_eq!(validate_destination(Channel::Sms, " +14155550123 ").unwrap(), "+14155550123");
        assert!(validate_destination(Channel::Sms, "14155550123").is_err());
        assert!(validate_destination(Channel::Sms, "+0123456789").is_err());
        assert!(validate_destination(Channel::WhatsApp, "").is_err());
        assert!(validate_destination(Channel::Rcs, "sip:agent@example.com").is_ok());
        assert!(validate_destination(Channel::Voip, "sip:agent@example.com").is_err());
    }
}
