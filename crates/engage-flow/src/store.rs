use std::path::Path;
use std::str::FromStr;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use tracing::debug;

use engage_core::error::{EngageError, Result};
use engage_core::types::{ContactId, FlowId, RunId, RunStatus, TenantId};

use crate::graph::{Edge, FlowDefinition, FlowStatus, Node};
use crate::run::{Run, StepRecord};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS flow_definitions (
        id TEXT PRIMARY KEY,
        tenant_id TEXT NOT NULL,
        name TEXT NOT NULL,
        status TEXT NOT NULL,
        entry TEXT NOT NULL,
        graph_json TEXT NOT NULL,
        created_at TEXT NOT NULL,
        cloned_from TEXT
    );

    CREATE INDEX IF NOT EXISTS idx_flow_definitions_tenant ON flow_definitions(tenant_id);

    CREATE TABLE IF NOT EXISTS runs (
        id TEXT PRIMARY KEY,
        flow_id TEXT NOT NULL,
        contact_id TEXT NOT NULL,
        tenant_id TEXT NOT NULL,
        current_node TEXT NOT NULL,
        status TEXT NOT NULL,
        resume_at TEXT,
        retry_count INTEGER NOT NULL DEFAULT 0,
        version INTEGER NOT NULL DEFAULT 0,
        lease_owner TEXT,
        lease_until TEXT,
        started_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE UNIQUE INDEX IF NOT EXISTS idx_runs_one_active
        ON runs(flow_id, contact_id)
        WHERE status IN ('running', 'waiting');

    CREATE INDEX IF NOT EXISTS idx_runs_due ON runs(status, resume_at);

    CREATE TABLE IF NOT EXISTS run_steps (
        run_id TEXT NOT NULL REFERENCES runs(id),
        seq INTEGER NOT NULL,
        node TEXT NOT NULL,
        outcome TEXT NOT NULL,
        detail TEXT NOT NULL,
        created_at TEXT NOT NULL,
        PRIMARY KEY (run_id, seq)
    );";

const RUN_COLUMNS: &str = "id, flow_id, contact_id, tenant_id, current_node, status, resume_at, \
     retry_count, version, lease_owner, lease_until, started_at, updated_at";

#[derive(Serialize, Deserialize)]
struct Graph {
    nodes: Vec<Node>,
    edges: Vec<Edge>,
}

/// Durable storage for flow definitions and runs.
///
/// Run transitions are optimistic: [`FlowStore::commit`] only applies when
/// the stored version still matches the one the caller read.
pub struct FlowStore {
    conn: Mutex<Connection>,
}

impl FlowStore {
    /// Open or create the flow database.
    pub fn open(path: &Path, busy_timeout: Duration) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                EngageError::Database(format!("Failed to create flow store directory: {}", e))
            })?;
        }
        let conn = Connection::open(path).map_err(db)?;
        conn.busy_timeout(busy_timeout).map_err(db)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(db)?;
        Self::init(conn)
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory().map_err(db)?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA).map_err(db)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|e| EngageError::Database(e.to_string()))
    }

    // ── Definitions ─────────────────────────────────────────────────────────

    /// Insert or overwrite a definition. Only drafts may be overwritten.
    pub fn save_definition(&self, def: &FlowDefinition) -> Result<()> {
        let conn = self.lock()?;
        if let Some(existing) = select_definition(&conn, &def.id)? {
            if existing.status != FlowStatus::Draft {
                return Err(EngageError::Validation(format!(
                    "flow {} is {}; clone it to make changes",
                    def.id, existing.status
                )));
            }
        }

        let graph = serde_json::to_string(&Graph {
            nodes: def.nodes.clone(),
            edges: def.edges.clone(),
        })?;
        conn.execute(
            "INSERT OR REPLACE INTO flow_definitions
                 (id, tenant_id, name, status, entry, graph_json, created_at, cloned_from)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                def.id.0,
                def.tenant_id.0,
                def.name,
                def.status.as_str(),
                def.entry,
                graph,
                ts(&def.created_at),
                def.cloned_from.as_ref().map(|f| f.0.clone()),
            ],
        )
        .map_err(db)?;
        debug!(flow = %def.id, status = %def.status, "Flow definition saved");
        Ok(())
    }

    pub fn definition(&self, id: &FlowId) -> Result<FlowDefinition> {
        let conn = self.lock()?;
        select_definition(&conn, id)?.ok_or_else(|| EngageError::NotFound(format!("flow {}", id)))
    }

    pub fn definitions(&self, tenant: &TenantId) -> Result<Vec<FlowDefinition>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT id FROM flow_definitions WHERE tenant_id = ?1 ORDER BY created_at")
            .map_err(db)?;
        let ids = stmt
            .query_map(params![tenant.0], |row| row.get::<_, String>(0))
            .map_err(db)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db)?;
        let mut defs = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(def) = select_definition(&conn, &FlowId(id))? {
                defs.push(def);
            }
        }
        Ok(defs)
    }

    pub fn set_definition_status(&self, id: &FlowId, status: FlowStatus) -> Result<()> {
        let conn = self.lock()?;
        let updated = conn
            .execute(
                "UPDATE flow_definitions SET status = ?1 WHERE id = ?2",
                params![status.as_str(), id.0],
            )
            .map_err(db)?;
        if updated == 0 {
            return Err(EngageError::NotFound(format!("flow {}", id)));
        }
        Ok(())
    }

    // ── Runs ────────────────────────────────────────────────────────────────

    /// Insert a new run. The partial unique index makes the one-active-run
    /// check and the insert a single atomic step.
    pub fn insert_run(&self, run: &Run) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(db)?;
        let inserted = tx.execute(
            &format!(
                "INSERT INTO runs ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                RUN_COLUMNS
            ),
            params![
                run.id.0,
                run.flow_id.0,
                run.contact_id.0,
                run.tenant_id.0,
                run.current_node,
                run.status.as_str(),
                run.resume_at.as_ref().map(ts),
                run.retry_count,
                run.version,
                run.lease_owner,
                run.lease_until.as_ref().map(ts),
                ts(&run.started_at),
                ts(&run.updated_at),
            ],
        );

        match inserted {
            Ok(_) => {}
            Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
                return Err(EngageError::AlreadyRunning {
                    flow: run.flow_id.to_string(),
                    contact: run.contact_id.to_string(),
                });
            }
            Err(e) => return Err(db(e)),
        }

        insert_steps(&tx, &run.id, &run.history)?;
        tx.commit().map_err(db)
    }

    pub fn run(&self, id: &RunId) -> Result<Run> {
        let conn = self.lock()?;
        select_run(&conn, id)?.ok_or_else(|| EngageError::NotFound(format!("run {}", id)))
    }

    pub fn runs_for_flow(&self, flow: &FlowId) -> Result<Vec<Run>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM runs WHERE flow_id = ?1 ORDER BY started_at, id",
                RUN_COLUMNS
            ))
            .map_err(db)?;
        let mut runs = stmt
            .query_map(params![flow.0], run_from_row)
            .map_err(db)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db)?;
        for run in &mut runs {
            run.history = select_steps(&conn, &run.id)?;
        }
        Ok(runs)
    }

    /// Number of non-terminal runs for a (flow, contact) pair.
    pub fn active_runs(&self, flow: &FlowId, contact: &ContactId) -> Result<usize> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT COUNT(*) FROM runs
             WHERE flow_id = ?1 AND contact_id = ?2 AND status IN ('running', 'waiting')",
            params![flow.0, contact.0],
            |row| row.get::<_, i64>(0),
        )
        .map(|n| n as usize)
        .map_err(db)
    }

    /// Commit a transition. Applies only if the stored version still equals
    /// `run.version`; on success the version is bumped in place. History
    /// entries from index `steps_from` on are appended.
    pub fn commit(&self, run: &mut Run, steps_from: usize) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(db)?;
        let updated = tx
            .execute(
                "UPDATE runs SET current_node = ?1, status = ?2, resume_at = ?3, retry_count = ?4,
                     version = version + 1, lease_owner = ?5, lease_until = ?6, updated_at = ?7
                 WHERE id = ?8 AND version = ?9",
                params![
                    run.current_node,
                    run.status.as_str(),
                    run.resume_at.as_ref().map(ts),
                    run.retry_count,
                    run.lease_owner,
                    run.lease_until.as_ref().map(ts),
                    ts(&run.updated_at),
                    run.id.0,
                    run.version,
                ],
            )
            .map_err(db)?;

        if updated == 0 {
            return Err(EngageError::VersionConflict {
                run: run.id.to_string(),
                expected: run.version,
            });
        }

        insert_steps(&tx, &run.id, run.history.get(steps_from..).unwrap_or(&[]))?;
        tx.commit().map_err(db)?;
        run.version += 1;
        Ok(())
    }

    /// Claim one run for stepping. Succeeds when the run is waiting and due,
    /// or running with no live lease (or a lease already held by `owner`).
    /// The claim is a single conditional update, so concurrent claimers
    /// cannot both win.
    pub fn claim(
        &self,
        id: &RunId,
        owner: &str,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<Option<Run>> {
        let conn = self.lock()?;
        let now_s = ts(&now);
        let updated = conn
            .execute(
                "UPDATE runs SET status = 'running', resume_at = NULL, lease_owner = ?1,
                     lease_until = ?2, version = version + 1, updated_at = ?3
                 WHERE id = ?4 AND (
                     (status = 'waiting' AND resume_at <= ?3)
                     OR (status = 'running' AND (lease_until IS NULL OR lease_until <= ?3 OR lease_owner = ?1))
                 )",
                params![owner, ts(&lease_until), now_s, id.0],
            )
            .map_err(db)?;
        if updated == 0 {
            return Ok(None);
        }
        select_run(&conn, id)
    }

    /// Push the lease of a run this owner holds out to `lease_until`.
    /// Fenced on the version token: false when anyone touched the run
    /// since it was read.
    pub fn renew_lease(&self, run: &mut Run, owner: &str, now: DateTime<Utc>, lease_until: DateTime<Utc>) -> Result<bool> {
        let conn = self.lock()?;
        let updated = conn
            .execute(
                "UPDATE runs SET lease_until = ?1, version = version + 1, updated_at = ?2
                 WHERE id = ?3 AND version = ?4 AND status = 'running' AND lease_owner = ?5",
                params![ts(&lease_until), ts(&now), run.id.0, run.version, owner],
            )
            .map_err(db)?;
        if updated == 0 {
            return Ok(false);
        }
        run.version += 1;
        run.lease_until = Some(lease_until);
        run.updated_at = now;
        Ok(true)
    }

    /// Ids of runs eligible for a claim at `now`, oldest due first.
    pub fn due_runs(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<RunId>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT id FROM runs
                 WHERE (status = 'waiting' AND resume_at <= ?1)
                    OR (status = 'running' AND (lease_until IS NULL OR lease_until <= ?1))
                 ORDER BY COALESCE(resume_at, updated_at)
                 LIMIT ?2",
            )
            .map_err(db)?;
        let ids = stmt
            .query_map(params![ts(&now), limit as i64], |row| {
                row.get::<_, String>(0).map(RunId)
            })
            .map_err(db)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db)?;
        Ok(ids)
    }
}

/// Fixed-width UTC timestamps so stored values compare correctly as text.
fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn select_definition(conn: &Connection, id: &FlowId) -> Result<Option<FlowDefinition>> {
    let row = conn
        .query_row(
            "SELECT id, tenant_id, name, status, entry, graph_json, created_at, cloned_from
             FROM flow_definitions WHERE id = ?1",
            params![id.0],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    timestamp_column(row, 6)?,
                    row.get::<_, Option<String>>(7)?,
                ))
            },
        )
        .optional()
        .map_err(db)?;

    let Some((id, tenant, name, status, entry, graph_json, created_at, cloned_from)) = row else {
        return Ok(None);
    };
    let graph: Graph = serde_json::from_str(&graph_json)?;
    Ok(Some(FlowDefinition {
        id: FlowId(id),
        tenant_id: TenantId(tenant),
        name,
        status: FlowStatus::from_str(&status)?,
        entry,
        nodes: graph.nodes,
        edges: graph.edges,
        created_at,
        cloned_from: cloned_from.map(FlowId),
    }))
}

fn select_run(conn: &Connection, id: &RunId) -> Result<Option<Run>> {
    let run = conn
        .query_row(
            &format!("SELECT {} FROM runs WHERE id = ?1", RUN_COLUMNS),
            params![id.0],
            run_from_row,
        )
        .optional()
        .map_err(db)?;
    match run {
        Some(mut run) => {
            run.history = select_steps(conn, id)?;
            Ok(Some(run))
        }
        None => Ok(None),
    }
}

fn select_steps(conn: &Connection, id: &RunId) -> Result<Vec<StepRecord>> {
    let mut stmt = conn
        .prepare("SELECT seq, node, outcome, detail, created_at FROM run_steps WHERE run_id = ?1 ORDER BY seq")
        .map_err(db)?;
    let steps = stmt
        .query_map(params![id.0], |row| {
            Ok(StepRecord {
                seq: row.get(0)?,
                node: row.get(1)?,
                outcome: row.get(2)?,
                detail: row.get(3)?,
                timestamp: timestamp_column(row, 4)?,
            })
        })
        .map_err(db)?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(db)?;
    Ok(steps)
}

fn insert_steps(conn: &Connection, run: &RunId, steps: &[StepRecord]) -> Result<()> {
    for step in steps {
        conn.execute(
            "INSERT INTO run_steps (run_id, seq, node, outcome, detail, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![run.0, step.seq, step.node, step.outcome, step.detail, ts(&step.timestamp)],
        )
        .map_err(db)?;
    }
    Ok(())
}

fn run_from_row(row: &Row<'_>) -> rusqlite::Result<Run> {
    let status: String = row.get(5)?;
    Ok(Run {
        id: RunId(row.get(0)?),
        flow_id: FlowId(row.get(1)?),
        contact_id: ContactId(row.get(2)?),
        tenant_id: TenantId(row.get(3)?),
        current_node: row.get(4)?,
        status: RunStatus::from_str(&status).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Text, Box::new(e))
        })?,
        resume_at: optional_timestamp_column(row, 6)?,
        retry_count: row.get(7)?,
        version: row.get(8)?,
        lease_owner: row.get(9)?,
        lease_until: optional_timestamp_column(row, 10)?,
        started_at: timestamp_column(row, 11)?,
        updated_at: timestamp_column(row, 12)?,
        history: Vec::new(),
    })
}

fn timestamp_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let s: String = row.get(idx)?;
    parse_ts(&s, idx)
}

fn optional_timestamp_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    row.get::<_, Option<String>>(idx)?
        .map(|s| parse_ts(&s, idx))
        .transpose()
}

fn parse_ts(s: &str, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn db(e: rusqlite::Error) -> EngageError {
    EngageError::Database(e.to_string())
}
