use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use engage_channels::{AttemptJournal, ChannelDispatcher, LoopbackProvider, Pricing};
use engage_core::config::AppConfig;
use engage_core::event::EventBus;
use engage_core::types::{parse_amount, Channel, Contact, ContactId, EngineEvent, FlowId, RunId, TenantId};
use engage_flow::{FlowDefinition, FlowEngine, FlowStatus, FlowStore, FlowWorker};
use engage_ledger::{LedgerStore, NewTenant};
use engage_router::{ContactBook, ConversationRouter};

#[derive(Parser)]
#[command(name = "engage", version, about = "Flow execution and tenant ledger engine")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "engage.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage tenants and balances
    Tenant {
        #[command(subcommand)]
        action: TenantAction,
    },
    /// Apply a top-up to a tenant. Idempotent on the reference.
    Topup {
        tenant: String,
        /// Decimal amount, e.g. 25.00
        amount: String,
        /// Payment reference from the checkout provider
        #[arg(long)]
        reference: String,
    },
    /// Manage flow definitions
    Flow {
        #[command(subcommand)]
        action: FlowAction,
    },
    /// Start, inspect and cancel runs
    Run {
        #[command(subcommand)]
        action: RunAction,
    },
    /// Run the resumption sweep until Ctrl-C
    Worker {
        /// JSON file with the contact list
        #[arg(long)]
        contacts: Option<PathBuf>,
    },
    /// Show current configuration
    Config,
}

#[derive(Subcommand)]
enum TenantAction {
    /// Create a tenant
    Create {
        id: String,
        /// Parent tenant for sub-accounts
        #[arg(long)]
        parent: Option<String>,
        #[arg(long)]
        currency: Option<String>,
        /// Low-balance alert threshold
        #[arg(long)]
        threshold: Option<String>,
    },
    /// Show balance, sub-tree rollup and log consistency
    Show { id: String },
    /// Show recent transactions, newest first
    History {
        id: String,
        #[arg(long, default_value = "20")]
        limit: usize,
    },
    /// Stop new debits for a tenant
    Deactivate { id: String },
}

#[derive(Subcommand)]
enum FlowAction {
    /// Check a flow definition file without storing it
    Validate { file: PathBuf },
    /// Store a flow definition file as a draft
    Import { file: PathBuf },
    /// Activate a draft
    Activate { id: String },
    /// Stop new runs of a flow
    Archive { id: String },
    /// Copy a flow into a new draft
    Clone { id: String },
    /// List a tenant's flows
    List {
        #[arg(long)]
        tenant: String,
    },
}

#[derive(Subcommand)]
enum RunAction {
    /// Start a run for a contact; the worker drives it
    Start {
        #[arg(long)]
        flow: String,
        #[arg(long)]
        contact: String,
    },
    /// Cancel a run
    Cancel { id: String },
    /// Show a run and its step history
    Show { id: String },
}

/// Opened stores and the engine wired on top of them.
struct Engine {
    flows: Arc<FlowEngine>,
    router: Arc<ConversationRouter>,
    events: Arc<EventBus>,
}

const PRUNE_EVERY: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("engage=info,warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    let config = if cli.config.exists() {
        AppConfig::load(&cli.config)?
    } else {
        info!(path = %cli.config.display(), "No config file, using defaults");
        AppConfig::default()
    };

    match cli.command {
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
        Commands::Tenant { action } => {
            let ledger = open_ledger(&config, None)?;
            handle_tenant(&config, &ledger, action)?;
        }
        Commands::Topup {
            tenant,
            amount,
            reference,
        } => {
            let ledger = open_ledger(&config, None)?;
            let tx = ledger.apply_topup(&TenantId(tenant), parse_amount(&amount)?, &reference)?;
            println!("{}", serde_json::to_string_pretty(&tx)?);
        }
        Commands::Flow { action } => {
            let engine = open_engine(&config, Arc::new(ContactBook::new()))?;
            handle_flow(&engine.flows, action)?;
        }
        Commands::Run { action } => {
            let engine = open_engine(&config, Arc::new(ContactBook::new()))?;
            handle_run(&engine.flows, action)?;
        }
        Commands::Worker { contacts } => {
            let book = Arc::new(ContactBook::new());
            if let Some(path) = contacts {
                let loaded = load_contacts(&path)?;
                info!(count = loaded.len(), path = %path.display(), "Contacts loaded");
                for contact in loaded {
                    book.insert(contact)?;
                }
            }
            let engine = open_engine(&config, book)?;
            run_worker(&config, engine).await;
        }
    }

    Ok(())
}

fn open_ledger(config: &AppConfig, events: Option<Arc<EventBus>>) -> anyhow::Result<Arc<LedgerStore>> {
    let dir = config.data_dir();
    std::fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;
    let busy = Duration::from_millis(config.storage.busy_timeout_ms);
    let mut ledger = LedgerStore::open(&dir.join("ledger.db"), busy)?;
    if let Some(events) = events {
        ledger = ledger.with_events(events);
    }
    Ok(Arc::new(ledger))
}

fn open_engine(config: &AppConfig, contacts: Arc<ContactBook>) -> anyhow::Result<Engine> {
    let dir = config.data_dir();
    let busy = Duration::from_millis(config.storage.busy_timeout_ms);
    let events = Arc::new(EventBus::default());

    let ledger = open_ledger(config, Some(events.clone()))?;
    let journal = Arc::new(AttemptJournal::open(&dir.join("attempts.db"), busy)?);
    let store = Arc::new(FlowStore::open(&dir.join("flows.db"), busy)?);

    let mut dispatcher = ChannelDispatcher::new(
        ledger,
        journal,
        Pricing::new(config.pricing.clone()),
        Duration::from_millis(config.dispatch.timeout_ms),
    );
    dispatcher.set_events(events.clone());
    for channel in Channel::ALL {
        dispatcher.add_provider(Arc::new(LoopbackProvider::new(channel)));
    }

    let router = Arc::new(ConversationRouter::new(config.router.flow_burst));
    let flows = FlowEngine::new(store, Arc::new(dispatcher), router.clone(), contacts, config.engine.clone())
        .with_events(events.clone())
        .with_worker_id(format!("worker-{}", std::process::id()));

    Ok(Engine {
        flows: Arc::new(flows),
        router,
        events,
    })
}

fn handle_tenant(config: &AppConfig, ledger: &LedgerStore, action: TenantAction) -> anyhow::Result<()> {
    match action {
        TenantAction::Create {
            id,
            parent,
            currency,
            threshold,
        } => {
            let currency = currency.unwrap_or_else(|| config.ledger.default_currency.clone());
            let threshold = match threshold {
                Some(t) => parse_amount(&t)?,
                None => config.ledger.default_low_balance_threshold,
            };
            let mut new = NewTenant::root(id, currency).with_threshold(threshold);
            if let Some(parent) = parent {
                new = new.child_of(&TenantId(parent));
            }
            let tenant = ledger.create_tenant(new)?;
            println!("{}", serde_json::to_string_pretty(&tenant)?);
        }
        TenantAction::Show { id } => {
            let id = TenantId(id);
            let tenant = ledger.tenant(&id)?;
            let rollup = ledger.rollup_balance(&id)?;
            let consistent = ledger.verify(&id)?;
            println!("{}", serde_json::to_string_pretty(&tenant)?);
            println!("Sub-tree balance: {} {}", rollup, tenant.currency);
            if !consistent {
                warn!(tenant = %id, "Balance does not match transaction log");
                println!("Log check: MISMATCH");
            } else {
                println!("Log check: ok");
            }
        }
        TenantAction::History { id, limit } => {
            for tx in ledger.history(&TenantId(id), limit)? {
                println!(
                    "{:>6}  {}  {:>12}  {:>12}  {:<12} {}",
                    tx.seq,
                    tx.created_at.format("%Y-%m-%d %H:%M:%S"),
                    tx.amount,
                    tx.balance_after,
                    tx.reason,
                    tx.reference.as_deref().unwrap_or("-"),
                );
            }
        }
        TenantAction::Deactivate { id } => {
            ledger.deactivate_tenant(&TenantId(id.clone()))?;
            println!("Tenant {} deactivated", id);
        }
    }
    Ok(())
}

fn handle_flow(engine: &FlowEngine, action: FlowAction) -> anyhow::Result<()> {
    match action {
        FlowAction::Validate { file } => {
            let def = read_flow(&file)?;
            engine.validate(&def)?;
            println!("{}: ok ({} nodes, {} edges)", def.name, def.nodes.len(), def.edges.len());
        }
        FlowAction::Import { file } => {
            let mut def = read_flow(&file)?;
            def.status = FlowStatus::Draft;
            engine.save_draft(&def)?;
            println!("{}", def.id);
        }
        FlowAction::Activate { id } => {
            let def = engine.activate(&FlowId(id))?;
            println!("Flow {} ({}) is active", def.id, def.name);
        }
        FlowAction::Archive { id } => {
            engine.archive(&FlowId(id.clone()))?;
            println!("Flow {} archived", id);
        }
        FlowAction::Clone { id } => {
            let copy = engine.clone_definition(&FlowId(id))?;
            println!("{}", copy.id);
        }
        FlowAction::List { tenant } => {
            for def in engine.store().definitions(&TenantId(tenant))? {
                println!("{}  {:<9} {}", def.id, def.status, def.name);
            }
        }
    }
    Ok(())
}

fn handle_run(engine: &FlowEngine, action: RunAction) -> anyhow::Result<()> {
    match action {
        RunAction::Start { flow, contact } => {
            let id = engine.start_run(&FlowId(flow), &ContactId(contact))?;
            println!("{}", id);
        }
        RunAction::Cancel { id } => {
            engine.cancel_run(&RunId(id.clone()))?;
            println!("Run {} cancelled", id);
        }
        RunAction::Show { id } => {
            let run = engine.run(&RunId(id))?;
            println!("{}", serde_json::to_string_pretty(&run)?);
        }
    }
    Ok(())
}

async fn run_worker(config: &AppConfig, engine: Engine) {
    let cancel = CancellationToken::new();
    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Shutting down worker...");
        cancel_clone.cancel();
    });

    // Surface ledger alerts in the log.
    let mut rx = engine.events.subscribe();
    let alerts_cancel = cancel.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                event = rx.recv() => match event {
                    Ok(EngineEvent::LowBalance { tenant_id, balance, threshold, ancestors }) => {
                        warn!(tenant = %tenant_id, %balance, %threshold, parents = ancestors.len(), "Low balance");
                    }
                    Ok(EngineEvent::InsufficientFunds { tenant_id, requested, available, .. }) => {
                        warn!(tenant = %tenant_id, %requested, %available, "Send blocked by insufficient funds");
                    }
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "Alert listener lagged");
                    }
                    Err(_) => break,
                },
                _ = alerts_cancel.cancelled() => break,
            }
        }
    });

    // Forget closed conversations once they age out.
    let router = engine.router.clone();
    let retention = i64::try_from(config.router.closed_retention_secs)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .unwrap_or(chrono::Duration::MAX);
    let prune_cancel = cancel.clone();
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(PRUNE_EVERY);
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    let cutoff = chrono::Utc::now()
                        .checked_sub_signed(retention)
                        .unwrap_or(chrono::DateTime::<chrono::Utc>::MIN_UTC);
                    if let Err(e) = router.prune_closed(cutoff) {
                        warn!(error = %e, "Conversation pruning failed");
                    }
                }
                _ = prune_cancel.cancelled() => break,
            }
        }
    });

    info!(data_dir = %config.data_dir().display(), "Starting flow worker");
    let worker = FlowWorker::new(engine.flows.clone(), config.worker.clone(), cancel);
    worker.run().await;
}

fn read_flow(path: &Path) -> anyhow::Result<FlowDefinition> {
    let content = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let def = serde_json::from_str(&content).with_context(|| format!("parsing {}", path.display()))?;
    Ok(def)
}

fn load_contacts(path: &Path) -> anyhow::Result<Vec<Contact>> {
    let content = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let contacts = serde_json::from_str(&content).with_context(|| format!("parsing {}", path.display()))?;
    Ok(contacts)
}
