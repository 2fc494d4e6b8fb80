use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use engage_core::config::WorkerConfig;

use crate::engine::FlowEngine;

/// Background resumption sweep.
///
/// Claims due runs on a fixed poll interval and drives them. Any number of
/// workers may share one store; claims keep them from stepping the same run.
pub struct FlowWorker {
    engine: Arc<FlowEngine>,
    config: WorkerConfig,
    cancel: CancellationToken,
}

impl FlowWorker {
    pub fn new(engine: Arc<FlowEngine>, config: WorkerConfig, cancel: CancellationToken) -> Self {
        Self {
            engine,
            config,
            cancel,
        }
    }

    /// Run the sweep loop. Blocks until cancelled.
    pub async fn run(&self) {
        let interval = Duration::from_millis(self.config.poll_interval_ms);
        info!(
            worker = %self.engine.worker_id(),
            poll_interval_ms = self.config.poll_interval_ms,
            concurrency = self.config.concurrency,
            "Flow worker started"
        );

        loop {
            let claimed = match self
                .engine
                .sweep(self.config.batch_size, self.config.concurrency)
                .await
            {
                Ok(n) => n,
                Err(e) => {
                    error!(error = %e, "Sweep failed");
                    0
                }
            };

            // A full batch likely means more work is due right now.
            if claimed >= self.config.batch_size && !self.cancel.is_cancelled() {
                continue;
            }

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = self.cancel.cancelled() => {
                    info!("Flow worker shutting down");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use engage_channels::{AttemptJournal, ChannelDispatcher, Pricing};
    use engage_core::types::{Channel, ContactId, RunStatus};
    use engage_ledger::{LedgerStore, NewTenant};
    use engage_router::{ContactBook, ConversationRouter};
    use engage_test_utils::{phone_contact, test_config, ScriptedProvider, ScriptedReply};
    use rust_decimal::Decimal;

    use crate::graph::{Edge, ExitOutcome, FlowDefinition, Node};
    use crate::store::FlowStore;

    #[tokio::test]
    async fn worker_drives_runs_until_cancelled() {
        let config = test_config();
        let ledger = Arc::new(LedgerStore::in_memory().unwrap());
        let tenant = ledger.create_tenant(NewTenant::root("acme", "USD")).unwrap().id;
        ledger.apply_topup(&tenant, Decimal::ONE, "seed").unwrap();

        let mut dispatcher = ChannelDispatcher::new(
            ledger.clone(),
            Arc::new(AttemptJournal::in_memory().unwrap()),
            Pricing::new(config.pricing.clone()),
            Duration::from_millis(config.dispatch.timeout_ms),
        );
        dispatcher.add_provider(Arc::new(ScriptedProvider::with_script(
            Channel::Sms,
            vec![ScriptedReply::Accepted],
        )));
        let contacts = Arc::new(ContactBook::new());
        contacts.insert(phone_contact("alice", "+15550001111")).unwrap();

        let engine = Arc::new(FlowEngine::new(
            Arc::new(FlowStore::in_memory().unwrap()),
            Arc::new(dispatcher),
            Arc::new(ConversationRouter::new(4)),
            contacts,
            config.engine.clone(),
        ));

        let def = FlowDefinition::new(tenant, "welcome", "greet")
            .with_node(Node::send("greet", Channel::Sms, "welcome", "Hi"))
            .with_node(Node::exit("done", ExitOutcome::Success))
            .with_edge(Edge::new("greet", "done"));
        engine.save_draft(&def).unwrap();
        engine.activate(&def.id).unwrap();
        let run_id = engine
            .start_run(&def.id, &ContactId::from_string("alice"))
            .unwrap();

        let cancel = CancellationToken::new();
        let worker_config = WorkerConfig {
            poll_interval_ms: 10,
            ..config.worker.clone()
        };
        let worker = FlowWorker::new(engine.clone(), worker_config, cancel.clone());
        let handle = tokio::spawn(async move { worker.run().await });

        let mut status = RunStatus::Running;
        for _ in 0..100 {
            status = engine.run(&run_id).unwrap().status;
            if status.is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(status, RunStatus::Completed);

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("worker stops on cancel")
            .unwrap();
    }
}
