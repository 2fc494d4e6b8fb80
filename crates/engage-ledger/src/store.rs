use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction, TransactionBehavior};
use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use engage_core::error::{EngageError, Result};
use engage_core::event::EventBus;
use engage_core::types::{EngineEvent, TenantId};

use crate::tenant::{BalanceView, LedgerTransaction, NewTenant, Reason, Tenant};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS tenants (
        id TEXT PRIMARY KEY,
        parent_id TEXT REFERENCES tenants(id),
        level INTEGER NOT NULL,
        balance TEXT NOT NULL DEFAULT '0',
        currency TEXT NOT NULL,
        low_balance_threshold TEXT NOT NULL DEFAULT '0',
        active INTEGER NOT NULL DEFAULT 1,
        last_seq INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_tenants_parent ON tenants(parent_id);

    CREATE TABLE IF NOT EXISTS ledger_transactions (
        id TEXT PRIMARY KEY,
        tenant_id TEXT NOT NULL REFERENCES tenants(id),
        seq INTEGER NOT NULL,
        amount TEXT NOT NULL,
        balance_after TEXT NOT NULL,
        reason TEXT NOT NULL,
        reference TEXT,
        created_at TEXT NOT NULL,
        UNIQUE (tenant_id, seq)
    );

    CREATE UNIQUE INDEX IF NOT EXISTS idx_ledger_reference
        ON ledger_transactions(tenant_id, reason, reference)
        WHERE reference IS NOT NULL;";

const TENANT_COLUMNS: &str =
    "id, parent_id, level, balance, currency, low_balance_threshold, active, last_seq, created_at";

const TXN_COLUMNS: &str =
    "id, tenant_id, seq, amount, balance_after, reason, reference, created_at";

/// Result of a posting attempt, decided while the write lock is held.
enum Posting {
    Committed {
        txn: LedgerTransaction,
        threshold: Decimal,
    },
    Replayed(LedgerTransaction),
    Rejected {
        requested: Decimal,
        available: Decimal,
    },
}

/// Tenant balances and the append-only transaction log, backed by SQLite.
///
/// Every posting runs inside one `BEGIN IMMEDIATE` transaction while the
/// connection mutex is held, so two debits against the same tenant can
/// never both read the same balance. The `tenants.balance` column is a
/// materialized view of the log, updated in the same transaction as the
/// insert it reflects.
pub struct LedgerStore {
    conn: Mutex<Connection>,
    events: Option<Arc<EventBus>>,
}

impl LedgerStore {
    /// Open or create the ledger database.
    pub fn open(path: &Path, busy_timeout: Duration) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                EngageError::Database(format!("Failed to create ledger directory: {}", e))
            })?;
        }

        let conn = Connection::open(path).map_err(db)?;
        conn.busy_timeout(busy_timeout).map_err(db)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=FULL; PRAGMA foreign_keys=ON;")
            .map_err(db)?;

        let store = Self::init(conn)?;
        debug!(path = %path.display(), "Ledger store opened");
        Ok(store)
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db)?;
        conn.execute_batch("PRAGMA foreign_keys=ON;").map_err(db)?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA).map_err(db)?;
        Ok(Self {
            conn: Mutex::new(conn),
            events: None,
        })
    }

    /// Publish low-balance and insufficient-funds conditions on this bus.
    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    // ── Tenants ─────────────────────────────────────────────────────────────

    /// Onboard a tenant. A child's parent must exist and be active.
    pub fn create_tenant(&self, new: NewTenant) -> Result<Tenant> {
        if new.currency.trim().is_empty() {
            return Err(EngageError::Validation("tenant currency must not be empty".into()));
        }
        if new.low_balance_threshold < Decimal::ZERO {
            return Err(EngageError::InvalidAmount(
                "low balance threshold must not be negative".into(),
            ));
        }

        let mut conn = self.conn.lock().map_err(|e| EngageError::Database(e.to_string()))?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db)?;

        if select_tenant(&tx, &new.id)?.is_some() {
            return Err(EngageError::Validation(format!("tenant {} already exists", new.id)));
        }

        let level = match &new.parent_id {
            Some(parent_id) => {
                let parent = select_tenant(&tx, parent_id)?
                    .ok_or_else(|| EngageError::UnknownTenant(parent_id.to_string()))?;
                if !parent.active {
                    return Err(EngageError::InactiveTenant(parent_id.to_string()));
                }
                parent.level + 1
            }
            None => 0,
        };

        let tenant = Tenant {
            id: new.id,
            parent_id: new.parent_id,
            level,
            balance: Decimal::ZERO,
            currency: new.currency.trim().to_ascii_uppercase(),
            low_balance_threshold: new.low_balance_threshold,
            active: true,
            last_seq: 0,
            created_at: Utc::now(),
        };

        tx.execute(
            "INSERT INTO tenants (id, parent_id, level, balance, currency, low_balance_threshold, active, last_seq, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1, 0, ?7)",
            params![
                tenant.id.0,
                tenant.parent_id.as_ref().map(|p| p.0.clone()),
                tenant.level as i64,
                tenant.balance.to_string(),
                tenant.currency,
                tenant.low_balance_threshold.to_string(),
                tenant.created_at.to_rfc3339(),
            ],
        )
        .map_err(db)?;
        tx.commit().map_err(db)?;

        info!(tenant = %tenant.id, level = tenant.level, "Tenant created");
        Ok(tenant)
    }

    pub fn tenant(&self, id: &TenantId) -> Result<Tenant> {
        let conn = self.conn.lock().map_err(|e| EngageError::Database(e.to_string()))?;
        select_tenant(&conn, id)?.ok_or_else(|| EngageError::UnknownTenant(id.to_string()))
    }

    /// Soft-deactivate a tenant. Its transactions stay in place.
    pub fn deactivate_tenant(&self, id: &TenantId) -> Result<()> {
        let conn = self.conn.lock().map_err(|e| EngageError::Database(e.to_string()))?;
        let updated = conn
            .execute("UPDATE tenants SET active = 0 WHERE id = ?1", params![id.0])
            .map_err(db)?;
        if updated == 0 {
            return Err(EngageError::UnknownTenant(id.to_string()));
        }
        info!(tenant = %id, "Tenant deactivated");
        Ok(())
    }

    /// Direct children of a tenant.
    pub fn children(&self, id: &TenantId) -> Result<Vec<Tenant>> {
        let conn = self.conn.lock().map_err(|e| EngageError::Database(e.to_string()))?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM tenants WHERE parent_id = ?1 ORDER BY id",
                TENANT_COLUMNS
            ))
            .map_err(db)?;
        let rows = stmt.query_map(params![id.0], tenant_from_row).map_err(db)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db)
    }

    /// Parent chain of a tenant, nearest first.
    pub fn ancestors(&self, id: &TenantId) -> Result<Vec<TenantId>> {
        let conn = self.conn.lock().map_err(|e| EngageError::Database(e.to_string()))?;
        let mut chain = Vec::new();
        let mut current = select_tenant(&conn, id)?
            .ok_or_else(|| EngageError::UnknownTenant(id.to_string()))?
            .parent_id;
        while let Some(parent_id) = current {
            if chain.contains(&parent_id) {
                warn!(tenant = %id, "Cycle in tenant hierarchy");
                break;
            }
            current = select_tenant(&conn, &parent_id)?.and_then(|t| t.parent_id);
            chain.push(parent_id);
        }
        Ok(chain)
    }

    // ── Postings ────────────────────────────────────────────────────────────

    /// Debit a positive `amount`. Fails with `InsufficientFunds` when the
    /// balance would go negative. A repeated `reference` replays the
    /// original transaction instead of charging again.
    pub fn debit(
        &self,
        tenant: &TenantId,
        amount: Decimal,
        reason: Reason,
        reference: Option<&str>,
    ) -> Result<LedgerTransaction> {
        check_amount(amount)?;
        self.post(tenant, -amount, reason, reference)
    }

    /// Credit a positive `amount`.
    pub fn credit(
        &self,
        tenant: &TenantId,
        amount: Decimal,
        reason: Reason,
        reference: Option<&str>,
    ) -> Result<LedgerTransaction> {
        check_amount(amount)?;
        self.post(tenant, amount, reason, reference)
    }

    /// Top-up from the checkout collaborator. Idempotent on `reference`.
    pub fn apply_topup(
        &self,
        tenant: &TenantId,
        amount: Decimal,
        reference: &str,
    ) -> Result<LedgerTransaction> {
        self.credit(tenant, amount, Reason::Topup, Some(reference))
    }

    fn post(
        &self,
        tenant: &TenantId,
        delta: Decimal,
        reason: Reason,
        reference: Option<&str>,
    ) -> Result<LedgerTransaction> {
        let posting = {
            let mut conn = self.conn.lock().map_err(|e| EngageError::Database(e.to_string()))?;
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(db)?;
            post_locked(tx, tenant, delta, reason, reference)?
        };

        match posting {
            Posting::Replayed(txn) => {
                debug!(tenant = %tenant, reference = ?txn.reference, reason = %reason, "Replayed ledger posting");
                Ok(txn)
            }
            Posting::Committed { txn, threshold } => {
                debug!(
                    tenant = %tenant,
                    seq = txn.seq,
                    amount = %txn.amount,
                    balance = %txn.balance_after,
                    reason = %reason,
                    "Ledger posting committed"
                );
                if txn.is_debit() && txn.balance_after <= threshold {
                    self.publish_low_balance(tenant, txn.balance_after, threshold);
                }
                Ok(txn)
            }
            Posting::Rejected {
                requested,
                available,
            } => {
                warn!(tenant = %tenant, %requested, %available, "Debit rejected: insufficient funds");
                if let Some(ref events) = self.events {
                    events.publish(EngineEvent::InsufficientFunds {
                        tenant_id: tenant.clone(),
                        requested,
                        available,
                        ancestors: self.ancestors(tenant).unwrap_or_default(),
                    });
                }
                Err(EngageError::InsufficientFunds {
                    tenant: tenant.to_string(),
                    requested,
                    available,
                })
            }
        }
    }

    fn publish_low_balance(&self, tenant: &TenantId, balance: Decimal, threshold: Decimal) {
        info!(tenant = %tenant, %balance, %threshold, "Tenant balance at or below threshold");
        if let Some(ref events) = self.events {
            events.publish(EngineEvent::LowBalance {
                tenant_id: tenant.clone(),
                balance,
                threshold,
                ancestors: self.ancestors(tenant).unwrap_or_default(),
            });
        }
    }

    // ── Queries ─────────────────────────────────────────────────────────────

    /// Current balance, read from the materialized column.
    pub fn balance(&self, tenant: &TenantId) -> Result<Decimal> {
        Ok(self.tenant(tenant)?.balance)
    }

    /// Balance query API.
    pub fn get_balance(&self, tenant: &TenantId) -> Result<BalanceView> {
        let t = self.tenant(tenant)?;
        Ok(BalanceView {
            amount: t.balance,
            currency: t.currency,
        })
    }

    /// Balance recomputed as the running sum of the transaction log.
    pub fn reconstructed_balance(&self, tenant: &TenantId) -> Result<Decimal> {
        let conn = self.conn.lock().map_err(|e| EngageError::Database(e.to_string()))?;
        if select_tenant(&conn, tenant)?.is_none() {
            return Err(EngageError::UnknownTenant(tenant.to_string()));
        }
        let mut stmt = conn
            .prepare("SELECT amount FROM ledger_transactions WHERE tenant_id = ?1 ORDER BY seq")
            .map_err(db)?;
        let rows = stmt
            .query_map(params![tenant.0], |row| decimal_column(row, 0))
            .map_err(db)?;

        let mut sum = Decimal::ZERO;
        for amount in rows {
            sum += amount.map_err(db)?;
        }
        Ok(sum)
    }

    /// Whether the materialized balance agrees with the log.
    pub fn verify(&self, tenant: &TenantId) -> Result<bool> {
        let cached = self.balance(tenant)?;
        let rebuilt = self.reconstructed_balance(tenant)?;
        if cached != rebuilt {
            warn!(tenant = %tenant, %cached, %rebuilt, "Ledger balance mismatch");
        }
        Ok(cached == rebuilt)
    }

    /// Own balance plus the balances of all descendants. Read-side only;
    /// spending is always limited to a tenant's own balance.
    pub fn rollup_balance(&self, tenant: &TenantId) -> Result<Decimal> {
        let conn = self.conn.lock().map_err(|e| EngageError::Database(e.to_string()))?;
        if select_tenant(&conn, tenant)?.is_none() {
            return Err(EngageError::UnknownTenant(tenant.to_string()));
        }
        let mut stmt = conn
            .prepare(
                "WITH RECURSIVE tree(id) AS (
                     SELECT id FROM tenants WHERE id = ?1
                     UNION
                     SELECT t.id FROM tenants t JOIN tree ON t.parent_id = tree.id
                 )
                 SELECT balance FROM tenants WHERE id IN (SELECT id FROM tree)",
            )
            .map_err(db)?;
        let rows = stmt
            .query_map(params![tenant.0], |row| decimal_column(row, 0))
            .map_err(db)?;

        let mut sum = Decimal::ZERO;
        for balance in rows {
            sum += balance.map_err(db)?;
        }
        Ok(sum)
    }

    /// Most recent transactions first.
    pub fn history(&self, tenant: &TenantId, limit: usize) -> Result<Vec<LedgerTransaction>> {
        let conn = self.conn.lock().map_err(|e| EngageError::Database(e.to_string()))?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM ledger_transactions WHERE tenant_id = ?1 ORDER BY seq DESC LIMIT ?2",
                TXN_COLUMNS
            ))
            .map_err(db)?;
        let rows = stmt
            .query_map(params![tenant.0, limit as i64], txn_from_row)
            .map_err(db)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db)
    }

    /// Look up a posting by its idempotency key.
    pub fn find_by_reference(
        &self,
        tenant: &TenantId,
        reason: Reason,
        reference: &str,
    ) -> Result<Option<LedgerTransaction>> {
        let conn = self.conn.lock().map_err(|e| EngageError::Database(e.to_string()))?;
        select_by_reference(&conn, tenant, reason, reference)
    }
}

/// Apply one posting inside an immediate transaction. Anything short of a
/// committed posting rolls back when `tx` drops.
fn post_locked(
    tx: Transaction<'_>,
    tenant_id: &TenantId,
    delta: Decimal,
    reason: Reason,
    reference: Option<&str>,
) -> Result<Posting> {
    if let Some(reference) = reference {
        if let Some(existing) = select_by_reference(&tx, tenant_id, reason, reference)? {
            return Ok(Posting::Replayed(existing));
        }
    }

    let tenant = select_tenant(&tx, tenant_id)?
        .ok_or_else(|| EngageError::UnknownTenant(tenant_id.to_string()))?;

    // Compensating credits still land on a deactivated tenant so a refund
    // for an in-flight send is never lost.
    let compensating = delta > Decimal::ZERO && matches!(reason, Reason::Refund | Reason::Adjustment);
    if !tenant.active && !compensating {
        return Err(EngageError::InactiveTenant(tenant_id.to_string()));
    }

    let balance_after = tenant
        .balance
        .checked_add(delta)
        .ok_or_else(|| EngageError::InvalidAmount("balance overflow".into()))?;

    if delta < Decimal::ZERO && balance_after < Decimal::ZERO {
        return Ok(Posting::Rejected {
            requested: -delta,
            available: tenant.balance,
        });
    }

    let txn = LedgerTransaction {
        id: uuid::Uuid::new_v4().to_string(),
        tenant_id: tenant_id.clone(),
        seq: tenant.last_seq + 1,
        amount: delta,
        balance_after,
        reason,
        reference: reference.map(str::to_string),
        created_at: Utc::now(),
    };

    tx.execute(
        "INSERT INTO ledger_transactions (id, tenant_id, seq, amount, balance_after, reason, reference, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            txn.id,
            txn.tenant_id.0,
            txn.seq,
            txn.amount.to_string(),
            txn.balance_after.to_string(),
            txn.reason.as_str(),
            txn.reference,
            txn.created_at.to_rfc3339(),
        ],
    )
    .map_err(db)?;

    tx.execute(
        "UPDATE tenants SET balance = ?1, last_seq = ?2 WHERE id = ?3",
        params![txn.balance_after.to_string(), txn.seq, tenant_id.0],
    )
    .map_err(db)?;

    tx.commit().map_err(db)?;

    Ok(Posting::Committed {
        txn,
        threshold: tenant.low_balance_threshold,
    })
}

fn check_amount(amount: Decimal) -> Result<()> {
    if amount <= Decimal::ZERO {
        return Err(EngageError::InvalidAmount(format!(
            "amount must be positive, got {}",
            amount
        )));
    }
    Ok(())
}

fn select_tenant(conn: &Connection, id: &TenantId) -> Result<Option<Tenant>> {
    conn.query_row(
        &format!("SELECT {} FROM tenants WHERE id = ?1", TENANT_COLUMNS),
        params![id.0],
        tenant_from_row,
    )
    .optional()
    .map_err(db)
}

fn select_by_reference(
    conn: &Connection,
    tenant: &TenantId,
    reason: Reason,
    reference: &str,
) -> Result<Option<LedgerTransaction>> {
    conn.query_row(
        &format!(
            "SELECT {} FROM ledger_transactions WHERE tenant_id = ?1 AND reason = ?2 AND reference = ?3",
            TXN_COLUMNS
        ),
        params![tenant.0, reason.as_str(), reference],
        txn_from_row,
    )
    .optional()
    .map_err(db)
}

fn tenant_from_row(row: &Row<'_>) -> rusqlite::Result<Tenant> {
    Ok(Tenant {
        id: TenantId(row.get(0)?),
        parent_id: row.get::<_, Option<String>>(1)?.map(TenantId),
        level: row.get::<_, i64>(2)? as u32,
        balance: decimal_column(row, 3)?,
        currency: row.get(4)?,
        low_balance_threshold: decimal_column(row, 5)?,
        active: row.get::<_, i64>(6)? != 0,
        last_seq: row.get(7)?,
        created_at: timestamp_column(row, 8)?,
    })
}

fn txn_from_row(row: &Row<'_>) -> rusqlite::Result<LedgerTransaction> {
    let reason: String = row.get(5)?;
    Ok(LedgerTransaction {
        id: row.get(0)?,
        tenant_id: TenantId(row.get(1)?),
        seq: row.get(2)?,
        amount: decimal_column(row, 3)?,
        balance_after: decimal_column(row, 4)?,
        reason: Reason::from_str(&reason).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Text, Box::new(e))
        })?,
        reference: row.get(6)?,
        created_at: timestamp_column(row, 7)?,
    })
}

fn decimal_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Decimal> {
    let s: String = row.get(idx)?;
    Decimal::from_str(&s).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn timestamp_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let s: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn db(e: rusqlite::Error) -> EngageError {
    EngageError::Database(e.to_string())
}
