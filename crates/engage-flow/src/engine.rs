use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Duration, Utc};
use futures::StreamExt;
use tracing::{debug, error, info, warn};

use engage_channels::{ChannelDispatcher, DispatchRequest};
use engage_core::config::EngineConfig;
use engage_core::error::{EngageError, Result};
use engage_core::event::EventBus;
use engage_core::traits::{ContactDirectory, ConversationSource};
use engage_core::types::{ContactId, EngineEvent, FlowId, RunId, RunStatus};

use crate::backoff::retry_delay;
use crate::graph::edge::{NO, YES};
use crate::graph::{self, ExitOutcome, FlowDefinition, FlowStatus, Node, NodeKind};
use crate::predicate::Predicate;
use crate::run::Run;
use crate::store::FlowStore;

/// What the drive loop does after one step.
enum Step {
    /// Keep stepping this run.
    Continue(Run),
    /// Stop: the run moved on without us (cancelled or claimed elsewhere).
    Yield(Run),
}

enum Commit {
    Done(Run),
    /// Someone else committed first; carries the re-read run.
    Conflict(Run),
}

/// Time source for one drive. Steps stamp history and schedule waits from
/// `base`; leases are taken and checked against `base` plus the real time
/// spent since the drive began.
struct Clock {
    base: DateTime<Utc>,
    started: Instant,
}

impl Clock {
    fn start(base: DateTime<Utc>) -> Self {
        Self {
            base,
            started: Instant::now(),
        }
    }

    fn lease_now(&self) -> DateTime<Utc> {
        Duration::from_std(self.started.elapsed())
            .ok()
            .and_then(|d| self.base.checked_add_signed(d))
            .unwrap_or(self.base)
    }
}

/// Advances runs through their flow definitions.
///
/// Every transition is committed against the run's version token, so any
/// number of engines may share one store. A stepper only works on runs it
/// holds a lease on; the lease is installed by [`FlowStore::claim`].
pub struct FlowEngine {
    store: Arc<FlowStore>,
    dispatcher: Arc<ChannelDispatcher>,
    conversations: Arc<dyn ConversationSource>,
    contacts: Arc<dyn ContactDirectory>,
    config: EngineConfig,
    events: Option<Arc<EventBus>>,
    worker_id: String,
}

impl FlowEngine {
    pub fn new(
        store: Arc<FlowStore>,
        dispatcher: Arc<ChannelDispatcher>,
        conversations: Arc<dyn ConversationSource>,
        contacts: Arc<dyn ContactDirectory>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            dispatcher,
            conversations,
            contacts,
            config,
            events: None,
            worker_id: format!("engine-{}", uuid::Uuid::new_v4()),
        }
    }

    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    /// Lease owner name. Distinct engines must use distinct ids.
    pub fn with_worker_id(mut self, id: impl Into<String>) -> Self {
        self.worker_id = id.into();
        self
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn store(&self) -> &Arc<FlowStore> {
        &self.store
    }

    fn publish(&self, event: EngineEvent) {
        if let Some(ref events) = self.events {
            events.publish(event);
        }
    }

    // ── Definitions ─────────────────────────────────────────────────────────

    /// Structural check, including that every send channel has a provider.
    pub fn validate(&self, def: &FlowDefinition) -> Result<()> {
        graph::validate(def, &|channel| self.dispatcher.has_provider(channel))
    }

    /// Store a draft definition.
    pub fn save_draft(&self, def: &FlowDefinition) -> Result<()> {
        if def.status != FlowStatus::Draft {
            return Err(EngageError::Validation(format!(
                "flow {} must be saved as a draft, not {}",
                def.id, def.status
            )));
        }
        self.store.save_definition(def)
    }

    /// Validate and activate a draft. Activating an active flow is a no-op.
    pub fn activate(&self, id: &FlowId) -> Result<FlowDefinition> {
        let mut def = self.store.definition(id)?;
        match def.status {
            FlowStatus::Active => return Ok(def),
            FlowStatus::Archived => {
                return Err(EngageError::Validation(format!(
                    "flow {} is archived; clone it to run again",
                    id
                )))
            }
            FlowStatus::Draft => {}
        }
        self.validate(&def)?;
        self.store.set_definition_status(id, FlowStatus::Active)?;
        def.status = FlowStatus::Active;
        info!(flow = %id, name = %def.name, "Flow activated");
        Ok(def)
    }

    /// Stop new runs. In-flight runs finish against the archived graph.
    pub fn archive(&self, id: &FlowId) -> Result<()> {
        self.store.definition(id)?;
        self.store.set_definition_status(id, FlowStatus::Archived)?;
        info!(flow = %id, "Flow archived");
        Ok(())
    }

    /// Copy a definition into a new draft for editing.
    pub fn clone_definition(&self, id: &FlowId) -> Result<FlowDefinition> {
        let copy = self.store.definition(id)?.clone_as_draft();
        self.store.save_definition(&copy)?;
        debug!(source = %id, flow = %copy.id, "Flow cloned");
        Ok(copy)
    }

    pub fn definition(&self, id: &FlowId) -> Result<FlowDefinition> {
        self.store.definition(id)
    }

    // ── Runs ────────────────────────────────────────────────────────────────

    pub fn start_run(&self, flow: &FlowId, contact: &ContactId) -> Result<RunId> {
        self.start_run_at(flow, contact, Utc::now())
    }

    /// Create a run positioned at the flow's entry node. Fails with
    /// `AlreadyRunning` when the contact already has a live run on this flow.
    pub fn start_run_at(&self, flow: &FlowId, contact: &ContactId, now: DateTime<Utc>) -> Result<RunId> {
        let def = self.store.definition(flow)?;
        if def.status != FlowStatus::Active {
            return Err(EngageError::FlowNotActive(flow.to_string()));
        }

        let run = Run::start(&def, contact.clone(), now);
        self.store.insert_run(&run)?;

        info!(run_id = %run.id, flow = %flow, contact = %contact, "Run started");
        self.publish(EngineEvent::RunStarted {
            run_id: run.id.clone(),
            flow_id: flow.clone(),
            contact_id: contact.clone(),
        });
        Ok(run.id)
    }

    pub fn cancel_run(&self, id: &RunId) -> Result<()> {
        self.cancel_run_at(id, Utc::now())
    }

    /// Cancel a non-terminal run. Does not wait for a stepper that is mid
    /// dispatch; that stepper records its outcome without progressing.
    pub fn cancel_run_at(&self, id: &RunId, now: DateTime<Utc>) -> Result<()> {
        loop {
            let run = self.store.run(id)?;
            if run.is_terminal() {
                return Err(EngageError::AlreadyTerminal(id.to_string()));
            }

            let mut next = run.clone();
            next.record(run.current_node.clone(), "cancelled", "cancelled by request", now);
            next.settle(RunStatus::Cancelled);
            next.updated_at = now;

            match self.store.commit(&mut next, run.history.len()) {
                Ok(()) => {
                    info!(run_id = %id, "Run cancelled");
                    self.publish_transition(&run, &next);
                    return Ok(());
                }
                Err(EngageError::VersionConflict { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    pub fn run(&self, id: &RunId) -> Result<Run> {
        self.store.run(id)
    }

    pub fn runs_for_flow(&self, flow: &FlowId) -> Result<Vec<Run>> {
        self.store.runs_for_flow(flow)
    }

    pub async fn drive(&self, id: &RunId) -> Result<Run> {
        self.drive_at(id, Utc::now()).await
    }

    /// Claim a run and step it until it waits, finishes or hits the step
    /// budget. A run that is not due, or leased by another stepper, is
    /// returned unchanged.
    pub async fn drive_at(&self, id: &RunId, now: DateTime<Utc>) -> Result<Run> {
        let clock = Clock::start(now);
        match self.store.claim(id, &self.worker_id, now, self.lease_until(now))? {
            Some(run) => self.advance(run, &clock).await,
            None => self.store.run(id),
        }
    }

    pub async fn sweep(&self, limit: usize, concurrency: usize) -> Result<usize> {
        self.sweep_at(Utc::now(), limit, concurrency).await
    }

    /// Drive up to `limit` due runs, at most `concurrency` at a time. Each
    /// run is claimed only when a slot frees up for it, so no lease sits idle
    /// behind a slow send. Returns how many runs this sweeper claimed.
    pub async fn sweep_at(&self, now: DateTime<Utc>, limit: usize, concurrency: usize) -> Result<usize> {
        let due = self.store.due_runs(now, limit)?;
        if due.is_empty() {
            return Ok(0);
        }
        let clock = Clock::start(now);
        let claimed = AtomicUsize::new(0);

        futures::stream::iter(due)
            .for_each_concurrent(concurrency.max(1), |id| {
                let (clock, claimed) = (&clock, &claimed);
                async move {
                    let at = clock.lease_now();
                    let run = match self.store.claim(&id, &self.worker_id, at, self.lease_until(at)) {
                        Ok(Some(run)) => run,
                        Ok(None) => {
                            debug!(run_id = %id, "Run taken or no longer due");
                            return;
                        }
                        Err(e) => {
                            error!(run_id = %id, error = %e, "Claim failed");
                            return;
                        }
                    };
                    claimed.fetch_add(1, Ordering::Relaxed);
                    if let Err(e) = self.advance(run, clock).await {
                        error!(run_id = %id, error = %e, "Run step failed");
                    }
                }
            })
            .await;

        let count = claimed.into_inner();
        if count > 0 {
            debug!(worker = %self.worker_id, count, "Swept due runs");
        }
        Ok(count)
    }

    fn lease_until(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let secs = i64::try_from(self.config.lease_secs).unwrap_or(i64::MAX);
        Duration::try_seconds(secs)
            .and_then(|lease| now.checked_add_signed(lease))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    // ── Stepping ────────────────────────────────────────────────────────────

    async fn advance(&self, mut run: Run, clock: &Clock) -> Result<Run> {
        let def = self.store.definition(&run.flow_id)?;
        let now = clock.base;

        for _ in 0..self.config.max_steps_per_drive {
            if run.status != RunStatus::Running || !run.is_leased_by(&self.worker_id, clock.lease_now()) {
                return Ok(run);
            }
            match self.step(&def, run, clock).await? {
                Step::Continue(next) => run = next,
                Step::Yield(other) => return Ok(other),
            }
        }

        // Out of step budget: release the lease so the next sweep continues.
        if run.status == RunStatus::Running && run.is_leased_by(&self.worker_id, clock.lease_now()) {
            debug!(run_id = %run.id, "Step budget exhausted, releasing run");
            let mut released = run.clone();
            released.lease_owner = None;
            released.lease_until = None;
            released.updated_at = now;
            return match self.store.commit(&mut released, run.history.len()) {
                Ok(()) => Ok(released),
                Err(EngageError::VersionConflict { .. }) => self.store.run(&run.id),
                Err(e) => Err(e),
            };
        }
        Ok(run)
    }

    async fn step(&self, def: &FlowDefinition, run: Run, clock: &Clock) -> Result<Step> {
        let Some(node) = def.node(&run.current_node) else {
            let detail = format!("node '{}' not in flow {}", run.current_node, def.id);
            let node_id = run.current_node.clone();
            return self.fail(&run, &node_id, "missing_node", detail, clock);
        };

        debug!(run_id = %run.id, node = %node.id, kind = node.kind_str(), "Stepping");

        match &node.kind {
            NodeKind::Send { .. } => self.step_send(def, node, run, clock).await,
            NodeKind::Decision { predicate } => self.step_decision(def, node, predicate, &run, clock),
            NodeKind::Delay { seconds } => self.step_delay(def, node, *seconds, &run, clock),
            NodeKind::Exit { outcome } => self.step_exit(node, *outcome, &run, clock),
        }
    }

    fn step_decision(
        &self,
        def: &FlowDefinition,
        node: &Node,
        predicate: &Predicate,
        run: &Run,
        clock: &Clock,
    ) -> Result<Step> {
        let now = clock.base;
        let Some(contact) = self.contacts.contact(&run.contact_id)? else {
            return self.fail(run, &node.id, "unknown_contact", format!("contact {} not found", run.contact_id), clock);
        };

        let label = if predicate.evaluate(&contact, self.conversations.as_ref(), now)? {
            YES
        } else {
            NO
        };
        let Some(target) = def.next(&node.id, Some(label)) else {
            return self.fail(run, &node.id, "missing_edge", format!("no '{}' edge", label), clock);
        };

        let mut next = run.clone();
        next.record(node.id.clone(), label, format!("-> {}", target), now);
        next.current_node = target.to_string();
        self.transition(run, next, clock)
    }

    fn step_delay(
        &self,
        def: &FlowDefinition,
        node: &Node,
        seconds: u64,
        run: &Run,
        clock: &Clock,
    ) -> Result<Step> {
        let now = clock.base;
        let Some(target) = def.next(&node.id, None) else {
            return self.fail(run, &node.id, "missing_edge", "delay has no outgoing edge".to_string(), clock);
        };
        let resume_at = i64::try_from(seconds)
            .ok()
            .and_then(Duration::try_seconds)
            .and_then(|d| now.checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        let mut next = run.clone();
        next.record(node.id.clone(), "waiting", format!("resume at {}", resume_at.to_rfc3339()), now);
        next.current_node = target.to_string();
        next.settle(RunStatus::Waiting);
        next.resume_at = Some(resume_at);
        self.transition(run, next, clock)
    }

    fn step_exit(&self, node: &Node, outcome: ExitOutcome, run: &Run, clock: &Clock) -> Result<Step> {
        let now = clock.base;
        let mut next = run.clone();
        next.record(
            node.id.clone(),
            "exit",
            format!("reached exit '{}' ({})", node.id, outcome.as_str()),
            now,
        );
        next.settle(outcome.run_status());
        self.transition(run, next, clock)
    }

    async fn step_send(&self, def: &FlowDefinition, node: &Node, mut run: Run, clock: &Clock) -> Result<Step> {
        let now = clock.base;
        let Some((channel, payload)) = node.payload() else {
            return self.fail(&run, &node.id, "missing_node", "not a send node".to_string(), clock);
        };

        let destination = match self.contacts.contact(&run.contact_id)? {
            None => Err(format!("contact {} not found", run.contact_id)),
            Some(c) if c.opted_out => Err(format!("contact {} opted out", c.id)),
            Some(c) => c
                .address(channel)
                .map(str::to_string)
                .ok_or_else(|| format!("contact {} has no {} address", c.id, channel)),
        };

        let sent = match destination {
            Err(message) => Err(EngageError::InvalidDestination {
                channel: channel.to_string(),
                message,
            }),
            Ok(destination) => {
                // Fresh lease for the length of the send; a run claimed
                // away since it was read is never dispatched.
                let at = clock.lease_now();
                if !self.store.renew_lease(&mut run, &self.worker_id, at, self.lease_until(at))? {
                    debug!(run_id = %run.id, "Lease lost before dispatch");
                    return Ok(Step::Yield(self.store.run(&run.id)?));
                }
                let request = DispatchRequest {
                    channel,
                    destination,
                    payload,
                    tenant_id: run.tenant_id.clone(),
                    reference: format!("{}#{}", run.id, run.next_seq()),
                };
                self.dispatcher.send(&request).await
            }
        };

        let mut next = run.clone();
        match sent {
            Ok(result) => {
                let Some(target) = def.next(&node.id, None) else {
                    return self.fail(&run, &node.id, "missing_edge", "send has no outgoing edge".to_string(), clock);
                };
                next.record(
                    node.id.clone(),
                    "sent",
                    format!(
                        "{} message {} cost {}",
                        channel, result.provider_message_id, result.cost
                    ),
                    now,
                );
                next.retry_count = 0;
                next.current_node = target.to_string();
            }
            Err(e) if e.is_storage() => return Err(e),
            Err(e) if e.is_retryable() => {
                next.retry_count += 1;
                if next.retry_count > self.config.max_retries {
                    next.record(
                        node.id.clone(),
                        e.code(),
                        format!("giving up after {} attempts: {}", next.retry_count, e),
                        now,
                    );
                    next.settle(RunStatus::Failed);
                } else {
                    let mut delay = retry_delay(next.retry_count, &self.config);
                    if let EngageError::RateLimited {
                        retry_after_secs: Some(secs),
                        ..
                    } = &e
                    {
                        delay = delay.max(std::time::Duration::from_secs(*secs));
                    }
                    let resume_at = Duration::from_std(delay)
                        .ok()
                        .and_then(|d| now.checked_add_signed(d))
                        .unwrap_or(DateTime::<Utc>::MAX_UTC);
                    next.record(
                        node.id.clone(),
                        e.code(),
                        format!("{}; retry {} at {}", e, next.retry_count, resume_at.to_rfc3339()),
                        now,
                    );
                    next.settle(RunStatus::Waiting);
                    next.resume_at = Some(resume_at);
                }
            }
            Err(e) => {
                next.record(node.id.clone(), e.code(), e.to_string(), now);
                next.settle(RunStatus::Failed);
            }
        }

        let attempted = next
            .history
            .last()
            .map(|s| (s.node.clone(), s.outcome.clone(), s.detail.clone()));
        match self.commit(&run, next, now)? {
            Commit::Done(next) => {
                self.publish_transition(&run, &next);
                Ok(Step::Continue(next))
            }
            Commit::Conflict(fresh) => self.record_after_side_effect(fresh, attempted, now),
        }
    }

    /// The send already happened but the run moved underneath us. A run
    /// that was cancelled gets the send outcome appended without moving;
    /// a run claimed by another stepper is left to it.
    fn record_after_side_effect(
        &self,
        mut fresh: Run,
        outcome: Option<(String, String, String)>,
        now: DateTime<Utc>,
    ) -> Result<Step> {
        let Some((node, code, detail)) = outcome else {
            return Ok(Step::Yield(fresh));
        };
        loop {
            if !fresh.is_terminal() {
                warn!(run_id = %fresh.id, "Lost the run to another stepper after dispatch");
                return Ok(Step::Yield(fresh));
            }
            let mut late = fresh.clone();
            late.record(node.clone(), code.clone(), format!("after {}: {}", fresh.status, detail), now);
            late.updated_at = now;
            match self.store.commit(&mut late, fresh.history.len()) {
                Ok(()) => {
                    info!(run_id = %late.id, outcome = %code, "Dispatch outcome recorded on finished run");
                    return Ok(Step::Yield(late));
                }
                Err(EngageError::VersionConflict { .. }) => fresh = self.store.run(&fresh.id)?,
                Err(e) => return Err(e),
            }
        }
    }

    fn fail(&self, run: &Run, node_id: &str, code: &str, detail: String, clock: &Clock) -> Result<Step> {
        let mut next = run.clone();
        next.record(node_id.to_string(), code.to_string(), detail, clock.base);
        next.settle(RunStatus::Failed);
        self.transition(run, next, clock)
    }

    /// Commit a side-effect-free transition. On conflict the step is simply
    /// retried from the re-read run if it is still ours.
    fn transition(&self, run: &Run, next: Run, clock: &Clock) -> Result<Step> {
        match self.commit(run, next, clock.base)? {
            Commit::Done(next) => {
                self.publish_transition(run, &next);
                Ok(Step::Continue(next))
            }
            Commit::Conflict(fresh) => {
                if fresh.status == RunStatus::Running && fresh.is_leased_by(&self.worker_id, clock.lease_now()) {
                    Ok(Step::Continue(fresh))
                } else {
                    Ok(Step::Yield(fresh))
                }
            }
        }
    }

    fn commit(&self, run: &Run, mut next: Run, now: DateTime<Utc>) -> Result<Commit> {
        next.updated_at = now;
        match self.store.commit(&mut next, run.history.len()) {
            Ok(()) => Ok(Commit::Done(next)),
            Err(EngageError::VersionConflict { run: id, expected }) => {
                debug!(run_id = %id, expected, "Version conflict, re-reading run");
                Ok(Commit::Conflict(self.store.run(&run.id)?))
            }
            Err(e) => Err(e),
        }
    }

    fn publish_transition(&self, prev: &Run, next: &Run) {
        for step in next.history.iter().skip(prev.history.len()) {
            self.publish(EngineEvent::StepCompleted {
                run_id: next.id.clone(),
                node_id: step.node.clone(),
                outcome: step.outcome.clone(),
            });
        }
        match next.status {
            RunStatus::Waiting => {
                if let Some(resume_at) = next.resume_at {
                    debug!(run_id = %next.id, node = %next.current_node, %resume_at, "Run waiting");
                    self.publish(EngineEvent::RunWaiting {
                        run_id: next.id.clone(),
                        resume_at,
                    });
                }
            }
            status if status.is_terminal() => {
                let reason = next.reason().unwrap_or_default();
                info!(run_id = %next.id, %status, %reason, "Run finished");
                self.publish(EngineEvent::RunFinished {
                    run_id: next.id.clone(),
                    status,
                    reason,
                });
            }
            _ => {}
        }
    }
}
