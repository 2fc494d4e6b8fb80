use std::path::Path;
use std::str::FromStr;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use engage_core::error::{EngageError, Result};
use engage_core::types::{Channel, TenantId};

/// How a dispatch call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Accepted,
    InsufficientFunds,
    ChannelUnavailable,
    RateLimited,
    InvalidDestination,
    /// Refused by the ledger for a reason other than funds (unknown or
    /// inactive tenant), or failed on storage.
    Rejected,
}

impl AttemptOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptOutcome::Accepted => "accepted",
            AttemptOutcome::InsufficientFunds => "insufficient_funds",
            AttemptOutcome::ChannelUnavailable => "channel_unavailable",
            AttemptOutcome::RateLimited => "rate_limited",
            AttemptOutcome::InvalidDestination => "invalid_destination",
            AttemptOutcome::Rejected => "rejected",
        }
    }

    pub fn from_error(e: &EngageError) -> Self {
        match e {
            EngageError::InsufficientFunds { .. } => AttemptOutcome::InsufficientFunds,
            EngageError::ChannelUnavailable { .. } => AttemptOutcome::ChannelUnavailable,
            EngageError::RateLimited { .. } => AttemptOutcome::RateLimited,
            EngageError::InvalidDestination { .. } => AttemptOutcome::InvalidDestination,
            _ => AttemptOutcome::Rejected,
        }
    }
}

impl std::fmt::Display for AttemptOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AttemptOutcome {
    type Err = EngageError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "accepted" => Ok(AttemptOutcome::Accepted),
            "insufficient_funds" => Ok(AttemptOutcome::InsufficientFunds),
            "channel_unavailable" => Ok(AttemptOutcome::ChannelUnavailable),
            "rate_limited" => Ok(AttemptOutcome::RateLimited),
            "invalid_destination" => Ok(AttemptOutcome::InvalidDestination),
            "rejected" => Ok(AttemptOutcome::Rejected),
            other => Err(EngageError::Database(format!("unknown attempt outcome '{}'", other))),
        }
    }
}

/// Audit record of one dispatch call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchAttempt {
    pub id: String,
    pub tenant_id: TenantId,
    pub reference: String,
    pub channel: Channel,
    pub destination: String,
    pub estimated_cost: Decimal,
    /// Net amount left charged after refunds and adjustments.
    pub charged: Decimal,
    pub refunded: bool,
    pub outcome: AttemptOutcome,
    pub provider_message_id: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Persistent journal of dispatch attempts.
pub struct AttemptJournal {
    conn: Mutex<Connection>,
}

impl AttemptJournal {
    /// Open or create the attempt journal database.
    pub fn open(path: &Path, busy_timeout: Duration) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                EngageError::Database(format!("Failed to create journal directory: {}", e))
            })?;
        }

        let conn = Connection::open(path)
            .map_err(|e| EngageError::Database(format!("Failed to open attempt journal: {}", e)))?;
        conn.busy_timeout(busy_timeout)
            .map_err(|e| EngageError::Database(e.to_string()))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(|e| EngageError::Database(e.to_string()))?;
        Self::init(conn)
    }

    /// Open an in-memory journal (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| EngageError::Database(e.to_string()))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS dispatch_attempts (
                 id TEXT PRIMARY KEY,
                 tenant_id TEXT NOT NULL,
                 reference TEXT NOT NULL,
                 channel TEXT NOT NULL,
                 destination TEXT NOT NULL,
                 estimated_cost TEXT NOT NULL,
                 charged TEXT NOT NULL,
                 refunded INTEGER NOT NULL,
                 outcome TEXT NOT NULL,
                 provider_message_id TEXT,
                 error TEXT,
                 created_at TEXT NOT NULL
             );

             CREATE INDEX IF NOT EXISTS idx_attempts_reference
                 ON dispatch_attempts(reference);

             CREATE INDEX IF NOT EXISTS idx_attempts_tenant
                 ON dispatch_attempts(tenant_id, created_at);",
        )
        .map_err(|e| EngageError::Database(format!("Failed to initialize journal schema: {}", e)))?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn record(&self, attempt: &DispatchAttempt) -> Result<()> {
        let conn = self.conn.lock().map_err(|e| EngageError::Database(e.to_string()))?;
        conn.execute(
            "INSERT INTO dispatch_attempts
                 (id, tenant_id, reference, channel, destination, estimated_cost, charged,
                  refunded, outcome, provider_message_id, error, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                attempt.id,
                attempt.tenant_id.0,
                attempt.reference,
                attempt.channel.code(),
                attempt.destination,
                attempt.estimated_cost.to_string(),
                attempt.charged.to_string(),
                attempt.refunded as i64,
                attempt.outcome.as_str(),
                attempt.provider_message_id,
                attempt.error,
                attempt.created_at.to_rfc3339(),
            ],
        )
        .map_err(|e| EngageError::Database(format!("Failed to record attempt: {}", e)))?;
        Ok(())
    }

    /// Attempts made under one run/step reference, oldest first.
    pub fn for_reference(&self, reference: &str) -> Result<Vec<DispatchAttempt>> {
        self.query(
            "WHERE reference = ?1 ORDER BY created_at, rowid",
            params![reference],
        )
    }

    /// Most recent attempts for a tenant.
    pub fn for_tenant(&self, tenant: &TenantId, limit: usize) -> Result<Vec<DispatchAttempt>> {
        self.query(
            "WHERE tenant_id = ?1 ORDER BY created_at DESC, rowid DESC LIMIT ?2",
            params![tenant.0, limit as i64],
        )
    }

    pub fn count(&self) -> Result<usize> {
        let conn = self.conn.lock().map_err(|e| EngageError::Database(e.to_string()))?;
        conn.query_row("SELECT COUNT(*) FROM dispatch_attempts", [], |row| {
            row.get::<_, i64>(0)
        })
        .map(|n| n as usize)
        .map_err(|e| EngageError::Database(e.to_string()))
    }

    fn query(&self, clause: &str, params: &[&dyn rusqlite::ToSql]) -> Result<Vec<DispatchAttempt>> {
        let conn = self.conn.lock().map_err(|e| EngageError::Database(e.to_string()))?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT id, tenant_id, reference, channel, destination, estimated_cost, charged,
                        refunded, outcome, provider_message_id, error, created_at
                 FROM dispatch_attempts {}",
                clause
            ))
            .map_err(|e| EngageError::Database(format!("Failed to query attempts: {}", e)))?;

        let rows = stmt
            .query_map(params, |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, i64>(7)?,
                    row.get::<_, String>(8)?,
                    row.get::<_, Option<String>>(9)?,
                    row.get::<_, Option<String>>(10)?,
                    row.get::<_, String>(11)?,
                ))
            })
            .map_err(|e| EngageError::Database(e.to_string()))?;

        let mut attempts = Vec::new();
        for row in rows {
            let (id, tenant, reference, channel, destination, estimated, charged, refunded, outcome, msg_id, error, ts) =
                row.map_err(|e| EngageError::Database(e.to_string()))?;
            attempts.push(DispatchAttempt {
                id,
                tenant_id: TenantId(tenant),
                reference,
                channel: Channel::from_str(&channel)
                    .map_err(|e| EngageError::Database(e.to_string()))?,
                destination,
                estimated_cost: decimal(&estimated)?,
                charged: decimal(&charged)?,
                refunded: refunded != 0,
                outcome: AttemptOutcome::from_str(&outcome)?,
                provider_message_id: msg_id,
                error,
                created_at: DateTime::parse_from_rfc3339(&ts)
                    .map(|dt| dt.with_timezone(&Utc))
                    .unwrap_or_else(|_| Utc::now()),
            });
        }
        Ok(attempts)
    }
}

fn decimal(s: &str) -> Result<Decimal> {
    Decimal::from_str(s).map_err(|e| EngageError::Database(format!("bad decimal '{}': {}", s, e)))
}
