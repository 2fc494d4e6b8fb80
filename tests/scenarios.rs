//! End-to-end scenarios across the ledger, dispatcher, flow engine and
//! router.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, SubsecRound, Utc};
use rust_decimal::Decimal;

use engage_channels::{AttemptJournal, AttemptOutcome, ChannelDispatcher, DispatchRequest, Pricing};
use engage_core::config::AppConfig;
use engage_core::types::{Channel, Contact, ContactId, FlowId, RunStatus, TenantId};
use engage_core::EngageError;
use engage_flow::{Edge, ExitOutcome, FlowDefinition, FlowEngine, FlowStore, Node, Predicate};
use engage_ledger::{LedgerStore, NewTenant, Reason};
use engage_router::{ContactBook, ConversationRouter};
use engage_test_utils::{phone_contact, test_config, text_payload, ScriptedProvider, ScriptedReply};

struct World {
    config: AppConfig,
    ledger: Arc<LedgerStore>,
    journal: Arc<AttemptJournal>,
    dispatcher: Arc<ChannelDispatcher>,
    store: Arc<FlowStore>,
    provider: Arc<ScriptedProvider>,
    router: Arc<ConversationRouter>,
    contacts: Arc<ContactBook>,
    tenant: TenantId,
}

impl World {
    fn new(funds: Decimal, replies: Vec<ScriptedReply>) -> Self {
        Self::with_config(test_config(), funds, replies)
    }

    fn with_config(config: AppConfig, funds: Decimal, replies: Vec<ScriptedReply>) -> Self {
        let ledger = Arc::new(LedgerStore::in_memory().unwrap());
        let tenant = ledger.create_tenant(NewTenant::root("acme", "USD")).unwrap().id;
        if funds > Decimal::ZERO {
            ledger.apply_topup(&tenant, funds, "stripe:pi_1").unwrap();
        }

        let journal = Arc::new(AttemptJournal::in_memory().unwrap());
        let provider = Arc::new(ScriptedProvider::with_script(Channel::Sms, replies));
        let mut dispatcher = ChannelDispatcher::new(
            ledger.clone(),
            journal.clone(),
            Pricing::new(config.pricing.clone()),
            StdDuration::from_millis(config.dispatch.timeout_ms),
        );
        dispatcher.add_provider(provider.clone());

        Self {
            router: Arc::new(ConversationRouter::new(config.router.flow_burst)),
            config,
            ledger,
            journal,
            dispatcher: Arc::new(dispatcher),
            store: Arc::new(FlowStore::in_memory().unwrap()),
            provider,
            contacts: Arc::new(ContactBook::new()),
            tenant,
        }
    }

    fn engine(&self, worker: &str) -> FlowEngine {
        FlowEngine::new(
            self.store.clone(),
            self.dispatcher.clone(),
            self.router.clone(),
            self.contacts.clone(),
            self.config.engine.clone(),
        )
        .with_worker_id(worker)
    }

    fn add_contact(&self, contact: Contact) -> ContactId {
        let id = contact.id.clone();
        self.contacts.insert(contact).unwrap();
        id
    }

    fn assert_ledger_consistent(&self) {
        assert!(self.ledger.verify(&self.tenant).unwrap());
        assert_eq!(
            self.ledger.reconstructed_balance(&self.tenant).unwrap(),
            self.ledger.balance(&self.tenant).unwrap()
        );
    }
}

fn activate(engine: &FlowEngine, def: &FlowDefinition) -> FlowId {
    engine.save_draft(def).unwrap();
    engine.activate(&def.id).unwrap();
    def.id.clone()
}

fn one_sms_flow(tenant: &TenantId) -> FlowDefinition {
    FlowDefinition::new(tenant.clone(), "promo", "send")
        .with_node(Node::send("send", Channel::Sms, "promo", "Spring sale today"))
        .with_node(Node::exit("done", ExitOutcome::Success))
        .with_edge(Edge::new("send", "done"))
}

fn phone(n: usize) -> String {
    format!("+1555{:07}", n)
}

/// Start of a scenario, at the microsecond precision the run store keeps.
fn start_time() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

#[tokio::test]
async fn balance_runs_dry_after_exactly_two_thousand_sends() {
    let world = World::new(Decimal::new(100, 0), vec![]);
    let engine = world.engine("w1");
    let flow = activate(&engine, &one_sms_flow(&world.tenant));

    for n in 0..2000 {
        let contact = world.add_contact(phone_contact(&format!("c{}", n), &phone(n)));
        let run_id = engine.start_run(&flow, &contact).unwrap();
        let run = engine.drive(&run_id).await.unwrap();
        assert_eq!(run.status, RunStatus::Completed, "send {}", n);
    }
    assert_eq!(world.ledger.balance(&world.tenant).unwrap(), Decimal::ZERO);
    assert_eq!(world.provider.sent_count(), 2000);

    let last = world.add_contact(phone_contact("c2000", &phone(2000)));
    let run_id = engine.start_run(&flow, &last).unwrap();
    let run = engine.drive(&run_id).await.unwrap();

    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.history[0].outcome, "insufficient_funds");
    assert_eq!(world.provider.sent_count(), 2000);
    assert_eq!(world.ledger.balance(&world.tenant).unwrap(), Decimal::ZERO);
    world.assert_ledger_consistent();

    let reference = format!("{}#1", run_id);
    let attempts = world.journal.for_reference(&reference).unwrap();
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].outcome, AttemptOutcome::InsufficientFunds);
}

#[tokio::test]
async fn unanswered_message_is_nudged_after_the_delay() {
    let world = World::new(Decimal::new(10, 0), vec![]);
    let engine = world.engine("w1");
    let alice = world.add_contact(phone_contact("alice", &phone(1)));

    // send -> replied within 24h? -yes-> done
    //                             -no->  delay 24h -> reminder -> done
    let def = FlowDefinition::new(world.tenant.clone(), "onboarding", "hello")
        .with_node(Node::send("hello", Channel::Sms, "hello", "Welcome! Reply to chat"))
        .with_node(Node::decision("replied", Predicate::replied_within(86_400)))
        .with_node(Node::delay("wait", 86_400))
        .with_node(Node::send("reminder", Channel::Sms, "reminder", "Still there?"))
        .with_node(Node::exit("done", ExitOutcome::Success))
        .with_edge(Edge::new("hello", "replied"))
        .with_edge(Edge::yes("replied", "done"))
        .with_edge(Edge::no("replied", "wait"))
        .with_edge(Edge::new("wait", "reminder"))
        .with_edge(Edge::new("reminder", "done"));
    let flow = activate(&engine, &def);

    let t0 = start_time();
    engine.start_run_at(&flow, &alice, t0).unwrap();
    assert_eq!(engine.sweep_at(t0, 10, 1).await.unwrap(), 1);

    let runs = engine.runs_for_flow(&flow).unwrap();
    let run = &runs[0];
    assert_eq!(run.status, RunStatus::Waiting);
    assert_eq!(run.current_node, "reminder");

    // Nothing is due until the delay has elapsed.
    assert_eq!(engine.sweep_at(t0 + Duration::hours(23), 10, 1).await.unwrap(), 0);
    assert_eq!(engine.sweep_at(t0 + Duration::hours(24), 10, 1).await.unwrap(), 1);

    let run = engine.run(&run.id).unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    let outcomes: Vec<_> = run.history.iter().map(|s| s.outcome.as_str()).collect();
    assert_eq!(outcomes, vec!["sent", "no", "waiting", "sent", "exit"]);
    assert_eq!(world.provider.sent_count(), 2);
    assert_eq!(world.ledger.balance(&world.tenant).unwrap(), Decimal::new(990, 2));
}

#[tokio::test]
async fn reply_before_decision_takes_the_yes_branch() {
    let world = World::new(Decimal::new(10, 0), vec![]);
    let engine = world.engine("w1");
    let alice = world.add_contact(phone_contact("alice", &phone(1)));

    let def = FlowDefinition::new(world.tenant.clone(), "survey", "ask")
        .with_node(Node::delay("ask", 60))
        .with_node(Node::decision("replied", Predicate::replied_within(3600)))
        .with_node(Node::exit("thanks", ExitOutcome::Success))
        .with_node(Node::exit("gave_up", ExitOutcome::Abandoned))
        .with_edge(Edge::new("ask", "replied"))
        .with_edge(Edge::yes("replied", "thanks"))
        .with_edge(Edge::no("replied", "gave_up"));
    let flow = activate(&engine, &def);

    let t0 = start_time();
    let run_id = engine.start_run_at(&flow, &alice, t0).unwrap();
    engine.drive_at(&run_id, t0).await.unwrap();

    world
        .router
        .record_inbound(&alice, Channel::Sms, "sure", t0 + Duration::seconds(30))
        .unwrap();

    let run = engine.drive_at(&run_id, t0 + Duration::seconds(60)).await.unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.current_node, "thanks");
}

#[test]
fn concurrent_starts_for_one_contact_admit_exactly_one() {
    let world = World::new(Decimal::new(10, 0), vec![]);
    let engine = world.engine("w1");
    let alice = world.add_contact(phone_contact("alice", &phone(1)));
    let flow = activate(&engine, &one_sms_flow(&world.tenant));

    let results: Vec<_> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..8)
            .map(|_| s.spawn(|| engine.start_run(&flow, &alice)))
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let started = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(started, 1);
    for err in results.into_iter().filter_map(|r| r.err()) {
        assert!(matches!(err, EngageError::AlreadyRunning { .. }));
    }
    assert_eq!(engine.runs_for_flow(&flow).unwrap().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn competing_sweepers_send_each_message_once() {
    let world = World::new(Decimal::new(100, 0), vec![]);
    let setup = world.engine("setup");
    let flow = activate(&setup, &one_sms_flow(&world.tenant));

    let t0 = start_time();
    for n in 0..60 {
        let contact = world.add_contact(phone_contact(&format!("c{}", n), &phone(n)));
        setup.start_run_at(&flow, &contact, t0).unwrap();
    }

    let a = Arc::new(world.engine("sweeper-a"));
    let b = Arc::new(world.engine("sweeper-b"));
    let (ra, rb) = tokio::join!(
        tokio::spawn({
            let a = a.clone();
            async move { a.sweep_at(t0, 100, 4).await }
        }),
        tokio::spawn({
            let b = b.clone();
            async move { b.sweep_at(t0, 100, 4).await }
        }),
    );
    let claimed = ra.unwrap().unwrap() + rb.unwrap().unwrap();
    assert_eq!(claimed, 60);

    for run in setup.runs_for_flow(&flow).unwrap() {
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.history.iter().filter(|s| s.outcome == "sent").count(), 1);
    }
    assert_eq!(world.provider.sent_count(), 60);
    assert_eq!(world.ledger.balance(&world.tenant).unwrap(), Decimal::new(97, 0));
    world.assert_ledger_consistent();
}

#[tokio::test]
async fn replayed_step_after_crash_is_not_charged_twice() {
    let world = World::new(Decimal::new(10, 0), vec![]);
    let engine = world.engine("w1");
    let alice = world.add_contact(phone_contact("alice", &phone(1)));
    let flow = activate(&engine, &one_sms_flow(&world.tenant));
    let run_id = engine.start_run(&flow, &alice).unwrap();

    // A stepper that sent step 1 and died before committing the run.
    world
        .dispatcher
        .send(&DispatchRequest {
            channel: Channel::Sms,
            destination: phone(1),
            payload: text_payload("Spring sale today"),
            tenant_id: world.tenant.clone(),
            reference: format!("{}#1", run_id),
        })
        .await
        .unwrap();
    assert_eq!(world.ledger.balance(&world.tenant).unwrap(), Decimal::new(995, 2));

    let run = engine.drive(&run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(world.ledger.balance(&world.tenant).unwrap(), Decimal::new(995, 2));
    let debits = world
        .ledger
        .history(&world.tenant, 10)
        .unwrap()
        .into_iter()
        .filter(|tx| tx.reason == Reason::MessageCost)
        .count();
    assert_eq!(debits, 1);
    world.assert_ledger_consistent();
}

#[tokio::test]
async fn replay_after_refunded_failure_is_charged() {
    let world = World::new(Decimal::new(10, 0), vec![ScriptedReply::Unavailable]);
    let engine = world.engine("w1");
    let alice = world.add_contact(phone_contact("alice", &phone(1)));
    let flow = activate(&engine, &one_sms_flow(&world.tenant));
    let run_id = engine.start_run(&flow, &alice).unwrap();

    // Step 1 failed and was refunded, then the stepper died before
    // recording the retry.
    let failed = world
        .dispatcher
        .send(&DispatchRequest {
            channel: Channel::Sms,
            destination: phone(1),
            payload: text_payload("Spring sale today"),
            tenant_id: world.tenant.clone(),
            reference: format!("{}#1", run_id),
        })
        .await;
    assert!(failed.is_err());
    assert_eq!(world.ledger.balance(&world.tenant).unwrap(), Decimal::new(10, 0));

    let run = engine.drive(&run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert!(run.history[0].detail.ends_with("cost 0.05"));
    assert_eq!(world.ledger.balance(&world.tenant).unwrap(), Decimal::new(995, 2));
    assert_eq!(world.provider.sent_count(), 2);
    world.assert_ledger_consistent();
}

#[tokio::test]
async fn malformed_number_fails_without_retry_or_cost() {
    let world = World::new(Decimal::new(10, 0), vec![]);
    let engine = world.engine("w1");
    let bad = world.add_contact(phone_contact("bad", "555-0100"));
    let flow = activate(&engine, &one_sms_flow(&world.tenant));

    let t0 = start_time();
    let run_id = engine.start_run_at(&flow, &bad, t0).unwrap();
    let run = engine.drive_at(&run_id, t0).await.unwrap();

    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.retry_count, 0);
    assert!(run.reason().unwrap().starts_with("invalid_destination"));
    assert_eq!(world.provider.sent_count(), 0);
    assert_eq!(world.ledger.balance(&world.tenant).unwrap(), Decimal::new(10, 0));
    assert_eq!(engine.sweep_at(t0 + Duration::days(1), 10, 1).await.unwrap(), 0);

    let attempts = world.journal.for_tenant(&world.tenant, 10).unwrap();
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].outcome, AttemptOutcome::InvalidDestination);
    assert_eq!(attempts[0].charged, Decimal::ZERO);
}

#[tokio::test]
async fn outage_retries_with_backoff_then_gives_up() {
    let mut config = test_config();
    config.engine.max_retries = 3;
    let world = World::with_config(config, Decimal::new(10, 0), vec![ScriptedReply::Unavailable; 10]);
    let engine = world.engine("w1");
    let alice = world.add_contact(phone_contact("alice", &phone(1)));
    let flow = activate(&engine, &one_sms_flow(&world.tenant));

    let t0 = start_time();
    let run_id = engine.start_run_at(&flow, &alice, t0).unwrap();

    let mut now = t0;
    let mut waits: Vec<DateTime<Utc>> = Vec::new();
    loop {
        engine.sweep_at(now, 10, 1).await.unwrap();
        let run = engine.run(&run_id).unwrap();
        match run.status {
            RunStatus::Waiting => {
                let resume = run.resume_at.unwrap();
                waits.push(resume);
                now = resume;
            }
            status => {
                assert_eq!(status, RunStatus::Failed);
                break;
            }
        }
    }

    // 1s, 2s, 4s between attempts.
    let gaps: Vec<i64> = std::iter::once(t0)
        .chain(waits.iter().copied())
        .collect::<Vec<_>>()
        .windows(2)
        .map(|w| (w[1] - w[0]).num_milliseconds())
        .collect();
    assert_eq!(gaps, vec![1_000, 2_000, 4_000]);
    assert_eq!(world.provider.sent_count(), 4);
    assert_eq!(world.ledger.balance(&world.tenant).unwrap(), Decimal::new(10, 0));
    world.assert_ledger_consistent();
}

#[test]
fn child_tenant_alerts_name_the_parent() {
    let events = Arc::new(engage_core::EventBus::default());
    let ledger = LedgerStore::in_memory().unwrap().with_events(events.clone());
    let parent = ledger.create_tenant(NewTenant::root("agency", "USD")).unwrap().id;
    let child = ledger
        .create_tenant(
            NewTenant::root("shop", "USD")
                .child_of(&parent)
                .with_threshold(Decimal::new(1, 0)),
        )
        .unwrap()
        .id;
    ledger.apply_topup(&child, Decimal::new(150, 2), "pi_1").unwrap();
    ledger.apply_topup(&parent, Decimal::new(20, 0), "pi_2").unwrap();

    let mut rx = events.subscribe();
    ledger
        .debit(&child, Decimal::new(60, 2), Reason::MessageCost, Some("r1"))
        .unwrap();

    let mut alerted = false;
    while let Ok(event) = rx.try_recv() {
        if let engage_core::EngineEvent::LowBalance {
            tenant_id, ancestors, ..
        } = event
        {
            assert_eq!(tenant_id, child);
            assert_eq!(ancestors, vec![parent.clone()]);
            alerted = true;
        }
    }
    assert!(alerted);
    assert_eq!(ledger.rollup_balance(&parent).unwrap(), Decimal::new(2090, 2));
}
