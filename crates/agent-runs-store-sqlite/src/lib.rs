#![forbid(unsafe_code)]

use std::path::Path;
use std::str::FromStr;

use agent_runs_domain::{
    now_utc, parse_rfc3339, rfc3339, ApprovalStatus, DateTimeUtc, EventDraft, EventRow, NewRun,
    ProposedMutation, Run, RunError, RunEvent, RunEventType, RunId, RunStatus, SubjectId,
    SubjectState, TaskKind, TenantId,
};
use agent_runs_store_core::{
    ApplyCommit, ApplyFn, MutationContext, MutationWriter, RunFilter, RunLedger, StartOutcome,
    SubjectStateSource, Submission, Transition,
};
use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction, TransactionBehavior};
use serde::Serialize;
use serde_json::{json, Value};
use ulid::Ulid;

const LEDGER_SCHEMA_VERSION: i64 = 2;

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS runs (
  run_id TEXT PRIMARY KEY,
  tenant_id INTEGER NOT NULL,
  task_kind TEXT NOT NULL,
  subject_id INTEGER,
  status TEXT NOT NULL CHECK (status IN ('queued','running','blocked','done','failed')),
  approval_status TEXT NOT NULL
    CHECK (approval_status IN ('not_required','pending','approved','rejected')),
  idempotency_key TEXT,
  attempts INTEGER NOT NULL DEFAULT 0 CHECK (attempts >= 0),
  last_error TEXT,
  input_json TEXT NOT NULL,
  proposed_mutations_json TEXT,
  output_json TEXT,
  created_at TEXT NOT NULL,
  started_at TEXT,
  heartbeat_at TEXT,
  finished_at TEXT,
  CHECK (approval_status = 'not_required' OR status IN ('blocked','done','failed')),
  UNIQUE(tenant_id, idempotency_key)
);

CREATE TABLE IF NOT EXISTS run_events (
  event_seq INTEGER PRIMARY KEY AUTOINCREMENT,
  event_id TEXT NOT NULL UNIQUE,
  run_id TEXT NOT NULL,
  tenant_id INTEGER NOT NULL,
  event_type TEXT NOT NULL,
  occurred_at TEXT NOT NULL,
  actor TEXT NOT NULL,
  payload_json TEXT NOT NULL,
  payload_hash TEXT NOT NULL,
  prev_event_hash TEXT,
  event_hash TEXT NOT NULL,
  FOREIGN KEY (run_id) REFERENCES runs(run_id)
);

CREATE TABLE IF NOT EXISTS tenant_locks (
  tenant_id INTEGER NOT NULL,
  task_kind TEXT NOT NULL,
  owner TEXT NOT NULL,
  acquired_at TEXT NOT NULL,
  expires_at TEXT NOT NULL,
  PRIMARY KEY (tenant_id, task_kind)
);

CREATE TABLE IF NOT EXISTS subject_states (
  tenant_id INTEGER NOT NULL,
  subject_id INTEGER NOT NULL,
  stage TEXT NOT NULL,
  flags_json TEXT NOT NULL,
  attributes_json TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  PRIMARY KEY (tenant_id, subject_id)
);

CREATE TABLE IF NOT EXISTS rehab_tasks (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  tenant_id INTEGER NOT NULL,
  subject_id INTEGER NOT NULL,
  run_id TEXT NOT NULL,
  title TEXT NOT NULL CHECK (length(trim(title)) > 0),
  category TEXT,
  status TEXT NOT NULL DEFAULT 'todo',
  cost_estimate REAL,
  notes TEXT,
  created_by TEXT NOT NULL,
  created_at TEXT NOT NULL,
  FOREIGN KEY (run_id) REFERENCES runs(run_id)
);

CREATE TABLE IF NOT EXISTS checklist_items (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  tenant_id INTEGER NOT NULL,
  subject_id INTEGER NOT NULL,
  item_code TEXT NOT NULL,
  description TEXT NOT NULL,
  status TEXT NOT NULL DEFAULT 'pending',
  updated_by TEXT,
  updated_at TEXT NOT NULL,
  UNIQUE(tenant_id, subject_id, item_code)
);

CREATE TABLE IF NOT EXISTS workflow_events (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  tenant_id INTEGER NOT NULL,
  subject_id INTEGER NOT NULL,
  run_id TEXT,
  event_type TEXT NOT NULL,
  payload_json TEXT NOT NULL,
  actor TEXT NOT NULL,
  created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_runs_status ON runs(status, tenant_id);
CREATE INDEX IF NOT EXISTS idx_runs_subject ON runs(tenant_id, subject_id);
CREATE INDEX IF NOT EXISTS idx_runs_due ON runs(status, next_attempt_at);
CREATE INDEX IF NOT EXISTS idx_run_events_run_seq ON run_events(run_id, event_seq);
CREATE INDEX IF NOT EXISTS idx_tenant_locks_owner ON tenant_locks(owner);
CREATE INDEX IF NOT EXISTS idx_rehab_tasks_subject ON rehab_tasks(tenant_id, subject_id);
CREATE INDEX IF NOT EXISTS idx_workflow_events_subject ON workflow_events(tenant_id, subject_id);

CREATE TRIGGER IF NOT EXISTS trg_run_events_no_update
BEFORE UPDATE ON run_events
BEGIN
  SELECT RAISE(FAIL, 'run_events is append-only');
END;
CREATE TRIGGER IF NOT EXISTS trg_run_events_no_delete
BEFORE DELETE ON run_events
BEGIN
  SELECT RAISE(FAIL, 'run_events is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_runs_no_delete
BEFORE DELETE ON runs
BEGIN
  SELECT RAISE(FAIL, 'runs are never deleted');
END;
";

const RUN_COLUMNS: &str = "run_id, tenant_id, task_kind, subject_id, status, approval_status,
    idempotency_key, attempts, last_error, input_json, proposed_mutations_json, output_json,
    created_at, started_at, heartbeat_at, finished_at, next_attempt_at, decided_by, decided_at";

const WORKER_ACTOR: &str = "worker";
const SWEEPER_ACTOR: &str = "sweeper";

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RehabTaskRow {
    pub id: i64,
    pub tenant_id: TenantId,
    pub subject_id: SubjectId,
    pub run_id: String,
    pub title: String,
    pub category: Option<String>,
    pub status: String,
    pub cost_estimate: Option<f64>,
    pub notes: Option<String>,
    pub created_by: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ChecklistItemRow {
    pub id: i64,
    pub tenant_id: TenantId,
    pub subject_id: SubjectId,
    pub item_code: String,
    pub description: String,
    pub status: String,
    pub updated_by: Option<String>,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct WorkflowEventRow {
    pub id: i64,
    pub tenant_id: TenantId,
    pub subject_id: SubjectId,
    pub run_id: Option<String>,
    pub event_type: String,
    pub payload: Value,
    pub actor: String,
    pub created_at: String,
}

pub struct SqliteLedger {
    conn: Connection,
}

impl SqliteLedger {
    /// Open or create a `SQLite` run ledger and configure local pragmas.
    ///
    /// # Errors
    /// Returns an error if opening the database or applying pragmas fails.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Insert a checklist item the applier can later update.
    ///
    /// # Errors
    /// Returns an error if the item already exists or the insert fails.
    pub fn seed_checklist_item(
        &self,
        tenant_id: TenantId,
        subject_id: SubjectId,
        item_code: &str,
        description: &str,
    ) -> Result<i64> {
        self.conn
            .execute(
                "INSERT INTO checklist_items(
                    tenant_id, subject_id, item_code, description, status, updated_at
                ) VALUES (?1, ?2, ?3, ?4, 'pending', ?5)",
                params![
                    tenant_id.0,
                    subject_id.0,
                    item_code,
                    description,
                    rfc3339(now_utc())?
                ],
            )
            .with_context(|| format!("failed to seed checklist item {item_code}"))?;
        Ok(self.conn.last_insert_rowid())
    }

    /// # Errors
    /// Returns an error if rows cannot be read.
    pub fn list_rehab_tasks(
        &self,
        tenant_id: TenantId,
        subject_id: SubjectId,
    ) -> Result<Vec<RehabTaskRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, tenant_id, subject_id, run_id, title, category, status,
                    cost_estimate, notes, created_by, created_at
             FROM rehab_tasks
             WHERE tenant_id = ?1 AND subject_id = ?2
             ORDER BY id ASC",
        )?;
        let mut rows = stmt.query(params![tenant_id.0, subject_id.0])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(RehabTaskRow {
                id: row.get(0)?,
                tenant_id: TenantId(row.get(1)?),
                subject_id: SubjectId(row.get(2)?),
                run_id: row.get(3)?,
                title: row.get(4)?,
                category: row.get(5)?,
                status: row.get(6)?,
                cost_estimate: row.get(7)?,
                notes: row.get(8)?,
                created_by: row.get(9)?,
                created_at: row.get(10)?,
            });
        }
        Ok(out)
    }

    /// # Errors
    /// Returns an error if rows cannot be read.
    pub fn list_checklist_items(
        &self,
        tenant_id: TenantId,
        subject_id: SubjectId,
    ) -> Result<Vec<ChecklistItemRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, tenant_id, subject_id, item_code, description, status,
                    updated_by, updated_at
             FROM checklist_items
             WHERE tenant_id = ?1 AND subject_id = ?2
             ORDER BY item_code ASC",
        )?;
        let mut rows = stmt.query(params![tenant_id.0, subject_id.0])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(ChecklistItemRow {
                id: row.get(0)?,
                tenant_id: TenantId(row.get(1)?),
                subject_id: SubjectId(row.get(2)?),
                item_code: row.get(3)?,
                description: row.get(4)?,
                status: row.get(5)?,
                updated_by: row.get(6)?,
                updated_at: row.get(7)?,
            });
        }
        Ok(out)
    }

    /// # Errors
    /// Returns an error if rows cannot be read.
    pub fn list_workflow_events(
        &self,
        tenant_id: TenantId,
        subject_id: SubjectId,
    ) -> Result<Vec<WorkflowEventRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, tenant_id, subject_id, run_id, event_type, payload_json, actor, created_at
             FROM workflow_events
             WHERE tenant_id = ?1 AND subject_id = ?2
             ORDER BY id ASC",
        )?;
        let mut rows = stmt.query(params![tenant_id.0, subject_id.0])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let payload_raw: String = row.get(5)?;
            out.push(WorkflowEventRow {
                id: row.get(0)?,
                tenant_id: TenantId(row.get(1)?),
                subject_id: SubjectId(row.get(2)?),
                run_id: row.get(3)?,
                event_type: row.get(4)?,
                payload: serde_json::from_str(&payload_raw)
                    .context("invalid workflow event payload_json")?,
                actor: row.get(6)?,
                created_at: row.get(7)?,
            });
        }
        Ok(out)
    }

    fn begin(&self) -> Result<Transaction<'_>> {
        Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)
            .context("failed to begin immediate transaction")
    }

    /// Run one guarded state change. `change` performs the UPDATE and returns
    /// the audit event to append, or `None` when the precondition does not hold.
    fn transition<F>(
        &self,
        tenant_id: TenantId,
        run_id: RunId,
        now: DateTimeUtc,
        change: F,
    ) -> Result<Transition>
    where
        F: FnOnce(&Connection, &Run) -> Result<Option<EventDraft>>,
    {
        let tx = self.begin()?;
        let Some(run) = load_run(&tx, Some(tenant_id), run_id)? else {
            return Ok(Transition::Missing);
        };

        let Some(draft) = change(&*tx, &run)? else {
            return Ok(Transition::Unchanged(run));
        };

        append_event(&tx, run_id, tenant_id, draft, now)?;
        let updated = load_run(&tx, Some(tenant_id), run_id)?
            .ok_or_else(|| anyhow!("run {run_id} vanished during transition"))?;
        tx.commit().context("failed to commit run transition")?;
        Ok(Transition::Applied(updated))
    }
}

impl RunLedger for SqliteLedger {
    fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(SCHEMA)
            .context("failed to apply ledger schema")?;

        ensure_column(&self.conn, "runs", "next_attempt_at", "TEXT")?;
        ensure_column(&self.conn, "runs", "decided_by", "TEXT")?;
        ensure_column(&self.conn, "runs", "decided_at", "TEXT")?;

        let now = rfc3339(now_utc())?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![LEDGER_SCHEMA_VERSION, now],
            )
            .context("failed to record ledger migration")?;

        Ok(())
    }

    fn submit(&self, new_run: &NewRun, now: DateTimeUtc) -> Result<Submission> {
        let tx = self.begin()?;

        if let Some(key) = new_run.idempotency_key.as_deref() {
            let existing: Option<String> = tx
                .query_row(
                    "SELECT run_id FROM runs WHERE tenant_id = ?1 AND idempotency_key = ?2",
                    params![new_run.tenant_id.0, key],
                    |row| row.get(0),
                )
                .optional()?;
            if let Some(existing) = existing {
                let run = load_run(&tx, Some(new_run.tenant_id), RunId::parse(&existing)?)?
                    .ok_or_else(|| anyhow!("run {existing} vanished during submit"))?;
                return Ok(Submission {
                    run,
                    created: false,
                });
            }
        }

        let run_id = RunId::new();
        tx.execute(
            "INSERT INTO runs(
                run_id, tenant_id, task_kind, subject_id, status, approval_status,
                idempotency_key, attempts, input_json, created_at
            ) VALUES (?1, ?2, ?3, ?4, 'queued', 'not_required', ?5, 0, ?6, ?7)",
            params![
                run_id.to_string(),
                new_run.tenant_id.0,
                new_run.task_kind.as_str(),
                new_run.subject_id.map(|subject| subject.0),
                new_run.idempotency_key,
                serde_json::to_string(&new_run.input)?,
                rfc3339(now)?,
            ],
        )
        .context("failed to insert run")?;

        append_event(
            &tx,
            run_id,
            new_run.tenant_id,
            EventDraft::new(
                RunEventType::RunSubmitted,
                "planner",
                json!({
                    "task_kind": new_run.task_kind,
                    "subject_id": new_run.subject_id,
                    "idempotency_key": new_run.idempotency_key,
                }),
            ),
            now,
        )?;

        let run = load_run(&tx, Some(new_run.tenant_id), run_id)?
            .ok_or_else(|| anyhow!("run {run_id} vanished during submit"))?;
        tx.commit().context("failed to commit run submission")?;
        Ok(Submission { run, created: true })
    }

    fn get_run(&self, tenant_id: TenantId, run_id: RunId) -> Result<Option<Run>> {
        load_run(&self.conn, Some(tenant_id), run_id)
    }

    fn find_run(&self, run_id: RunId) -> Result<Option<Run>> {
        load_run(&self.conn, None, run_id)
    }

    fn list_runs(&self, filter: &RunFilter) -> Result<Vec<Run>> {
        let sql = format!(
            "SELECT {RUN_COLUMNS} FROM runs
             WHERE (?1 IS NULL OR tenant_id = ?1)
               AND (?2 IS NULL OR status = ?2)
               AND (?3 IS NULL OR subject_id = ?3)
             ORDER BY run_id ASC
             LIMIT ?4"
        );
        query_runs(
            &self.conn,
            &sql,
            params![
                filter.tenant_id.map(|tenant| tenant.0),
                filter.status.map(RunStatus::as_str),
                filter.subject_id.map(|subject| subject.0),
                filter.limit.map_or(-1, i64::from),
            ],
        )
    }

    fn list_due_runs(&self, now: DateTimeUtc, limit: u32) -> Result<Vec<Run>> {
        let sql = format!(
            "SELECT {RUN_COLUMNS} FROM runs
             WHERE status = 'queued' AND (next_attempt_at IS NULL OR next_attempt_at <= ?1)
             ORDER BY created_at ASC, run_id ASC
             LIMIT ?2"
        );
        query_runs(&self.conn, &sql, params![rfc3339(now)?, i64::from(limit)])
    }

    fn count_runs_since(
        &self,
        tenant_id: TenantId,
        subject_id: SubjectId,
        since: DateTimeUtc,
    ) -> Result<u32> {
        let count: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM runs
                 WHERE tenant_id = ?1 AND subject_id = ?2 AND created_at >= ?3",
                params![tenant_id.0, subject_id.0, rfc3339(since)?],
                |row| row.get(0),
            )
            .context("failed to count recent runs")?;
        Ok(u32::try_from(count).unwrap_or(u32::MAX))
    }

    fn try_acquire_lock(
        &self,
        tenant_id: TenantId,
        task_kind: TaskKind,
        owner: &str,
        now: DateTimeUtc,
        ttl: time::Duration,
    ) -> Result<bool> {
        let tx = self.begin()?;
        let current: Option<(String, String)> = tx
            .query_row(
                "SELECT owner, expires_at FROM tenant_locks WHERE tenant_id = ?1 AND task_kind = ?2",
                params![tenant_id.0, task_kind.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let expires_at = rfc3339(now + ttl)?;
        let acquired = match current {
            None => {
                tx.execute(
                    "INSERT INTO tenant_locks(tenant_id, task_kind, owner, acquired_at, expires_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        tenant_id.0,
                        task_kind.as_str(),
                        owner,
                        rfc3339(now)?,
                        expires_at
                    ],
                )?;
                true
            }
            Some((holder, _)) if holder == owner => {
                tx.execute(
                    "UPDATE tenant_locks SET expires_at = ?3 WHERE tenant_id = ?1 AND task_kind = ?2",
                    params![tenant_id.0, task_kind.as_str(), expires_at],
                )?;
                true
            }
            Some((_, holder_expires)) if parse_rfc3339(&holder_expires)? <= now => {
                tx.execute(
                    "UPDATE tenant_locks SET owner = ?3, acquired_at = ?4, expires_at = ?5
                     WHERE tenant_id = ?1 AND task_kind = ?2",
                    params![
                        tenant_id.0,
                        task_kind.as_str(),
                        owner,
                        rfc3339(now)?,
                        expires_at
                    ],
                )?;
                true
            }
            Some(_) => false,
        };

        tx.commit().context("failed to commit lock acquisition")?;
        Ok(acquired)
    }

    fn release_lock(
        &self,
        tenant_id: TenantId,
        task_kind: TaskKind,
        owner: &str,
    ) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "DELETE FROM tenant_locks WHERE tenant_id = ?1 AND task_kind = ?2 AND owner = ?3",
                params![tenant_id.0, task_kind.as_str(), owner],
            )
            .context("failed to release tenant lock")?;
        Ok(changed == 1)
    }

    fn start_run(
        &self,
        tenant_id: TenantId,
        run_id: RunId,
        expected_attempts: u32,
        running_cap: u32,
        now: DateTimeUtc,
    ) -> Result<StartOutcome> {
        let tx = self.begin()?;
        let Some(run) = load_run(&tx, Some(tenant_id), run_id)? else {
            return Ok(StartOutcome::Missing);
        };
        if run.status != RunStatus::Queued || run.attempts != expected_attempts || !run.is_due(now)
        {
            return Ok(StartOutcome::NotStartable(run));
        }

        let running: i64 = tx.query_row(
            "SELECT COUNT(*) FROM runs WHERE tenant_id = ?1 AND status = 'running'",
            params![tenant_id.0],
            |row| row.get(0),
        )?;
        let running = u32::try_from(running).unwrap_or(u32::MAX);
        if running >= running_cap {
            return Ok(StartOutcome::TenantCapReached { running });
        }

        let stamp = rfc3339(now)?;
        let changed = tx.execute(
            "UPDATE runs
             SET status = 'running', attempts = attempts + 1, started_at = ?3,
                 heartbeat_at = ?3, next_attempt_at = NULL
             WHERE run_id = ?1 AND tenant_id = ?2 AND status = 'queued' AND attempts = ?4",
            params![
                run_id.to_string(),
                tenant_id.0,
                stamp,
                i64::from(expected_attempts)
            ],
        )?;
        if changed != 1 {
            return Ok(StartOutcome::NotStartable(run));
        }

        append_event(
            &tx,
            run_id,
            tenant_id,
            EventDraft::new(
                RunEventType::RunStarted,
                WORKER_ACTOR,
                json!({ "attempt": expected_attempts.saturating_add(1) }),
            ),
            now,
        )?;
        let started = load_run(&tx, Some(tenant_id), run_id)?
            .ok_or_else(|| anyhow!("run {run_id} vanished during start"))?;
        tx.commit().context("failed to commit run start")?;
        Ok(StartOutcome::Started(started))
    }

    fn schedule_retry(
        &self,
        tenant_id: TenantId,
        run_id: RunId,
        error: &str,
        next_attempt_at: DateTimeUtc,
        now: DateTimeUtc,
    ) -> Result<Transition> {
        self.transition(tenant_id, run_id, now, |conn, run| {
            if run.status != RunStatus::Running {
                return Ok(None);
            }
            let changed = conn.execute(
                "UPDATE runs SET status = 'queued', last_error = ?2, next_attempt_at = ?3,
                     heartbeat_at = ?4
                 WHERE run_id = ?1 AND status = 'running'",
                params![
                    run_id.to_string(),
                    error,
                    rfc3339(next_attempt_at)?,
                    rfc3339(now)?
                ],
            )?;
            Ok((changed == 1).then(|| {
                EventDraft::new(
                    RunEventType::RunRetryScheduled,
                    WORKER_ACTOR,
                    json!({
                        "attempts": run.attempts,
                        "error": error,
                        "next_attempt_at": rfc3339(next_attempt_at).ok(),
                    }),
                )
            }))
        })
    }

    fn finish_done(
        &self,
        tenant_id: TenantId,
        run_id: RunId,
        output: &Value,
        now: DateTimeUtc,
    ) -> Result<Transition> {
        self.transition(tenant_id, run_id, now, |conn, run| {
            if run.status != RunStatus::Running {
                return Ok(None);
            }
            let stamp = rfc3339(now)?;
            let changed = conn.execute(
                "UPDATE runs SET status = 'done', output_json = ?2, heartbeat_at = ?3,
                     finished_at = ?3
                 WHERE run_id = ?1 AND status = 'running'",
                params![run_id.to_string(), serde_json::to_string(output)?, stamp],
            )?;
            Ok((changed == 1).then(|| {
                EventDraft::new(
                    RunEventType::RunFinished,
                    WORKER_ACTOR,
                    json!({ "status": "done", "attempts": run.attempts }),
                )
            }))
        })
    }

    fn finish_blocked(
        &self,
        tenant_id: TenantId,
        run_id: RunId,
        output: &Value,
        mutations: &[ProposedMutation],
        now: DateTimeUtc,
    ) -> Result<Transition> {
        if mutations.is_empty() {
            return Err(anyhow!(
                "run {run_id} cannot block for approval without proposed mutations"
            ));
        }
        self.transition(tenant_id, run_id, now, |conn, run| {
            if run.status != RunStatus::Running {
                return Ok(None);
            }
            let changed = conn.execute(
                "UPDATE runs SET status = 'blocked', approval_status = 'pending',
                     output_json = ?2, proposed_mutations_json = ?3, heartbeat_at = ?4
                 WHERE run_id = ?1 AND status = 'running'",
                params![
                    run_id.to_string(),
                    serde_json::to_string(output)?,
                    serde_json::to_string(mutations)?,
                    rfc3339(now)?
                ],
            )?;
            Ok((changed == 1).then(|| {
                EventDraft::new(
                    RunEventType::RunBlocked,
                    WORKER_ACTOR,
                    json!({
                        "approval_status": "pending",
                        "proposed_mutations": mutations.len(),
                    }),
                )
            }))
        })
    }

    fn fail_running(
        &self,
        tenant_id: TenantId,
        run_id: RunId,
        error: &str,
        now: DateTimeUtc,
    ) -> Result<Transition> {
        self.transition(tenant_id, run_id, now, |conn, run| {
            if run.status != RunStatus::Running {
                return Ok(None);
            }
            let stamp = rfc3339(now)?;
            let changed = conn.execute(
                "UPDATE runs SET status = 'failed', last_error = ?2, heartbeat_at = ?3,
                     finished_at = ?3
                 WHERE run_id = ?1 AND status = 'running'",
                params![run_id.to_string(), error, stamp],
            )?;
            Ok((changed == 1).then(|| {
                EventDraft::new(
                    RunEventType::RunFailed,
                    WORKER_ACTOR,
                    json!({ "attempts": run.attempts, "error": error }),
                )
            }))
        })
    }

    fn approve(
        &self,
        tenant_id: TenantId,
        run_id: RunId,
        actor: &str,
        now: DateTimeUtc,
    ) -> Result<Transition> {
        self.transition(tenant_id, run_id, now, |conn, run| {
            if run.status != RunStatus::Blocked || run.approval_status != ApprovalStatus::Pending {
                return Ok(None);
            }
            let changed = conn.execute(
                "UPDATE runs SET approval_status = 'approved', decided_by = ?2, decided_at = ?3
                 WHERE run_id = ?1 AND status = 'blocked' AND approval_status = 'pending'",
                params![run_id.to_string(), actor, rfc3339(now)?],
            )?;
            Ok((changed == 1).then(|| {
                EventDraft::new(
                    RunEventType::RunApproved,
                    actor,
                    json!({ "approval_status": "approved" }),
                )
            }))
        })
    }

    fn reject(
        &self,
        tenant_id: TenantId,
        run_id: RunId,
        actor: &str,
        reason: &str,
        now: DateTimeUtc,
    ) -> Result<Transition> {
        self.transition(tenant_id, run_id, now, |conn, run| {
            let decidable = matches!(
                run.approval_status,
                ApprovalStatus::Pending | ApprovalStatus::Approved
            );
            if run.status != RunStatus::Blocked || !decidable {
                return Ok(None);
            }
            let stamp = rfc3339(now)?;
            let changed = conn.execute(
                "UPDATE runs SET status = 'failed', approval_status = 'rejected',
                     last_error = ?2, decided_by = ?3, decided_at = ?4, finished_at = ?4
                 WHERE run_id = ?1 AND status = 'blocked'
                   AND approval_status IN ('pending', 'approved')",
                params![
                    run_id.to_string(),
                    format!("rejected: {reason}"),
                    actor,
                    stamp
                ],
            )?;
            Ok((changed == 1).then(|| {
                EventDraft::new(
                    RunEventType::RunRejected,
                    actor,
                    json!({ "approval_status": "rejected", "reason": reason }),
                )
            }))
        })
    }

    fn commit_apply(
        &self,
        tenant_id: TenantId,
        run_id: RunId,
        actor: &str,
        now: DateTimeUtc,
        apply: &ApplyFn<'_>,
    ) -> Result<ApplyCommit> {
        let tx = self.begin()?;
        let Some(run) = load_run(&tx, Some(tenant_id), run_id)? else {
            return Ok(ApplyCommit::Missing);
        };
        if run.status != RunStatus::Blocked || run.approval_status != ApprovalStatus::Approved {
            return Ok(ApplyCommit::NotApplicable(run));
        }

        let writer = TxMutationWriter { conn: &tx };
        let applied = match apply(&writer as &dyn MutationWriter) {
            Ok(applied) => applied,
            // Dropping the transaction rolls back every handler write.
            Err(errors) => return Ok(ApplyCommit::Aborted { errors }),
        };

        let stamp = rfc3339(now)?;
        let changed = tx.execute(
            "UPDATE runs SET status = 'done', finished_at = ?2
             WHERE run_id = ?1 AND status = 'blocked' AND approval_status = 'approved'",
            params![run_id.to_string(), stamp],
        )?;
        if changed != 1 {
            return Ok(ApplyCommit::NotApplicable(run));
        }

        append_event(
            &tx,
            run_id,
            tenant_id,
            EventDraft::new(
                RunEventType::MutationsApplied,
                actor,
                json!({ "applied_count": applied }),
            ),
            now,
        )?;
        let run = load_run(&tx, Some(tenant_id), run_id)?
            .ok_or_else(|| anyhow!("run {run_id} vanished during apply"))?;
        tx.commit().context("failed to commit applied mutations")?;
        Ok(ApplyCommit::Committed { run, applied })
    }

    fn record_apply_failure(
        &self,
        tenant_id: TenantId,
        run_id: RunId,
        actor: &str,
        errors: &[String],
        now: DateTimeUtc,
    ) -> Result<Transition> {
        let message = RunError::ApplyFailure(errors.to_vec()).to_string();
        self.transition(tenant_id, run_id, now, |conn, run| {
            if run.status != RunStatus::Blocked || run.approval_status != ApprovalStatus::Approved {
                return Ok(None);
            }
            let stamp = rfc3339(now)?;
            let changed = conn.execute(
                "UPDATE runs SET status = 'failed', last_error = ?2, finished_at = ?3
                 WHERE run_id = ?1 AND status = 'blocked' AND approval_status = 'approved'",
                params![run_id.to_string(), message, stamp],
            )?;
            Ok((changed == 1).then(|| {
                EventDraft::new(
                    RunEventType::MutationsApplyFailed,
                    actor,
                    json!({ "errors": errors }),
                )
            }))
        })
    }

    fn sweep_run(
        &self,
        tenant_id: TenantId,
        run_id: RunId,
        stale_before: DateTimeUtc,
        now: DateTimeUtc,
    ) -> Result<Transition> {
        self.transition(tenant_id, run_id, now, |conn, run| {
            sweep_if_stale(conn, run, stale_before, now)
        })
    }

    fn sweep_stale(&self, stale_before: DateTimeUtc, now: DateTimeUtc) -> Result<Vec<Run>> {
        let tx = self.begin()?;
        let sql = format!("SELECT {RUN_COLUMNS} FROM runs WHERE status = 'running'");
        let running = query_runs(&tx, &sql, [])?;

        let mut swept = Vec::new();
        for run in running {
            if let Some(draft) = sweep_if_stale(&tx, &run, stale_before, now)? {
                append_event(&tx, run.run_id, run.tenant_id, draft, now)?;
                let updated = load_run(&tx, Some(run.tenant_id), run.run_id)?
                    .ok_or_else(|| anyhow!("run {} vanished during sweep", run.run_id))?;
                swept.push(updated);
            }
        }

        tx.commit().context("failed to commit stale-run sweep")?;
        Ok(swept)
    }

    fn list_events(&self, run_id: RunId) -> Result<Vec<EventRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT
                event_seq, event_id, run_id, tenant_id, event_type, occurred_at,
                actor, payload_json, payload_hash, prev_event_hash, event_hash
             FROM run_events
             WHERE run_id = ?1
             ORDER BY event_seq ASC",
        )?;

        let mut rows = stmt.query(params![run_id.to_string()])?;
        let mut out = Vec::new();

        while let Some(row) = rows.next()? {
            let event_id_raw: String = row.get(1)?;
            let run_id_raw: String = row.get(2)?;
            let event_type_raw: String = row.get(4)?;
            let payload_raw: String = row.get(7)?;
            out.push(EventRow {
                event_seq: row.get(0)?,
                event: RunEvent {
                    event_id: Ulid::from_str(&event_id_raw)
                        .map_err(|err| anyhow!("invalid event_id ULID: {err}"))?,
                    run_id: RunId::parse(&run_id_raw)?,
                    tenant_id: TenantId(row.get(3)?),
                    event_type: RunEventType::parse(&event_type_raw)
                        .ok_or_else(|| anyhow!("unknown event_type: {event_type_raw}"))?,
                    occurred_at: parse_rfc3339(&row.get::<_, String>(5)?)?,
                    actor: row.get(6)?,
                    payload: serde_json::from_str(&payload_raw).context("invalid payload_json")?,
                    payload_hash: row.get(8)?,
                    prev_event_hash: row.get(9)?,
                    event_hash: row.get(10)?,
                },
            });
        }

        Ok(out)
    }
}

impl SubjectStateSource for SqliteLedger {
    fn subject_state(
        &self,
        tenant_id: TenantId,
        subject_id: SubjectId,
    ) -> Result<Option<SubjectState>> {
        let row: Option<(String, String, String, String)> = self
            .conn
            .query_row(
                "SELECT stage, flags_json, attributes_json, updated_at
                 FROM subject_states WHERE tenant_id = ?1 AND subject_id = ?2",
                params![tenant_id.0, subject_id.0],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()?;

        row.map(|(stage, flags, attributes, updated_at)| {
            Ok(SubjectState {
                tenant_id,
                subject_id,
                stage,
                flags: serde_json::from_str(&flags).context("invalid flags_json")?,
                attributes: serde_json::from_str(&attributes)
                    .context("invalid attributes_json")?,
                updated_at: parse_rfc3339(&updated_at)?,
            })
        })
        .transpose()
    }

    fn upsert_subject_state(&self, state: &SubjectState) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO subject_states(
                    tenant_id, subject_id, stage, flags_json, attributes_json, updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                ON CONFLICT(tenant_id, subject_id) DO UPDATE SET
                    stage = excluded.stage,
                    flags_json = excluded.flags_json,
                    attributes_json = excluded.attributes_json,
                    updated_at = excluded.updated_at",
                params![
                    state.tenant_id.0,
                    state.subject_id.0,
                    state.stage,
                    serde_json::to_string(&state.flags)?,
                    serde_json::to_string(&state.attributes)?,
                    rfc3339(state.updated_at)?,
                ],
            )
            .context("failed to upsert subject state")?;
        Ok(())
    }
}

struct TxMutationWriter<'c> {
    conn: &'c Connection,
}

impl MutationWriter for TxMutationWriter<'_> {
    fn create_rehab_task(
        &self,
        ctx: &MutationContext,
        title: &str,
        category: Option<&str>,
        cost_estimate: Option<f64>,
        notes: Option<&str>,
    ) -> Result<i64> {
        self.conn
            .execute(
                "INSERT INTO rehab_tasks(
                    tenant_id, subject_id, run_id, title, category, status,
                    cost_estimate, notes, created_by, created_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, 'todo', ?6, ?7, ?8, ?9)",
                params![
                    ctx.tenant_id.0,
                    ctx.subject_id.0,
                    ctx.run_id.to_string(),
                    title,
                    category,
                    cost_estimate,
                    notes,
                    ctx.actor,
                    rfc3339(ctx.now)?,
                ],
            )
            .with_context(|| format!("failed to create rehab task '{title}'"))?;
        Ok(self.conn.last_insert_rowid())
    }

    fn update_checklist_item_status(
        &self,
        ctx: &MutationContext,
        item_code: &str,
        status: &str,
    ) -> Result<()> {
        let changed = self
            .conn
            .execute(
                "UPDATE checklist_items SET status = ?4, updated_by = ?5, updated_at = ?6
                 WHERE tenant_id = ?1 AND subject_id = ?2 AND item_code = ?3",
                params![
                    ctx.tenant_id.0,
                    ctx.subject_id.0,
                    item_code,
                    status,
                    ctx.actor,
                    rfc3339(ctx.now)?,
                ],
            )
            .with_context(|| format!("failed to update checklist item {item_code}"))?;
        if changed == 0 {
            return Err(anyhow!(
                "checklist item {item_code} not found for subject {}",
                ctx.subject_id
            ));
        }
        Ok(())
    }

    fn create_workflow_event(
        &self,
        ctx: &MutationContext,
        event_type: &str,
        payload: &Value,
    ) -> Result<i64> {
        self.conn
            .execute(
                "INSERT INTO workflow_events(
                    tenant_id, subject_id, run_id, event_type, payload_json, actor, created_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    ctx.tenant_id.0,
                    ctx.subject_id.0,
                    ctx.run_id.to_string(),
                    event_type,
                    serde_json::to_string(payload)?,
                    ctx.actor,
                    rfc3339(ctx.now)?,
                ],
            )
            .with_context(|| format!("failed to create workflow event {event_type}"))?;
        Ok(self.conn.last_insert_rowid())
    }
}

fn sweep_if_stale(
    conn: &Connection,
    run: &Run,
    stale_before: DateTimeUtc,
    now: DateTimeUtc,
) -> Result<Option<EventDraft>> {
    if run.status != RunStatus::Running {
        return Ok(None);
    }
    let last_seen = run.heartbeat_at.or(run.started_at).unwrap_or(run.created_at);
    if last_seen >= stale_before {
        return Ok(None);
    }

    let message =
        RunError::Timeout(format!("no heartbeat since {}", rfc3339(last_seen)?)).to_string();
    let stamp = rfc3339(now)?;
    let changed = conn.execute(
        "UPDATE runs SET status = 'failed', last_error = ?2, finished_at = ?3
         WHERE run_id = ?1 AND status = 'running'",
        params![run.run_id.to_string(), message, stamp],
    )?;
    if changed != 1 {
        return Ok(None);
    }
    conn.execute(
        "DELETE FROM tenant_locks WHERE owner = ?1",
        params![run.run_id.to_string()],
    )
    .context("failed to release locks held by swept run")?;

    Ok(Some(EventDraft::new(
        RunEventType::RunSwept,
        SWEEPER_ACTOR,
        json!({ "attempts": run.attempts, "error": message }),
    )))
}

fn append_event(
    conn: &Connection,
    run_id: RunId,
    tenant_id: TenantId,
    draft: EventDraft,
    now: DateTimeUtc,
) -> Result<i64> {
    let prev_event_hash: Option<String> = conn
        .query_row(
            "SELECT event_hash FROM run_events WHERE run_id = ?1 ORDER BY event_seq DESC LIMIT 1",
            params![run_id.to_string()],
            |row| row.get(0),
        )
        .optional()?;

    let event = RunEvent::seal(run_id, tenant_id, draft, now, prev_event_hash)?;
    conn.execute(
        "INSERT INTO run_events(
            event_id, run_id, tenant_id, event_type, occurred_at, actor,
            payload_json, payload_hash, prev_event_hash, event_hash
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            event.event_id.to_string(),
            event.run_id.to_string(),
            event.tenant_id.0,
            event.event_type.as_str(),
            rfc3339(event.occurred_at)?,
            event.actor,
            serde_json::to_string(&event.payload)?,
            event.payload_hash,
            event.prev_event_hash,
            event.event_hash,
        ],
    )
    .context("failed to append run event")?;
    Ok(conn.last_insert_rowid())
}

fn load_run(conn: &Connection, tenant_id: Option<TenantId>, run_id: RunId) -> Result<Option<Run>> {
    let sql = format!(
        "SELECT {RUN_COLUMNS} FROM runs WHERE run_id = ?1 AND (?2 IS NULL OR tenant_id = ?2)"
    );
    let mut runs = query_runs(
        conn,
        &sql,
        params![run_id.to_string(), tenant_id.map(|tenant| tenant.0)],
    )?;
    Ok(runs.pop())
}

fn query_runs<P: rusqlite::Params>(conn: &Connection, sql: &str, params: P) -> Result<Vec<Run>> {
    let mut stmt = conn.prepare(sql)?;
    let mut rows = stmt.query(params)?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        out.push(run_from_row(row)?);
    }
    Ok(out)
}

fn run_from_row(row: &Row<'_>) -> Result<Run> {
    let run_id_raw: String = row.get(0)?;
    let task_kind_raw: String = row.get(2)?;
    let status_raw: String = row.get(4)?;
    let approval_raw: String = row.get(5)?;
    let attempts: i64 = row.get(7)?;
    let input_raw: String = row.get(9)?;
    let mutations_raw: Option<String> = row.get(10)?;
    let output_raw: Option<String> = row.get(11)?;

    Ok(Run {
        run_id: RunId::parse(&run_id_raw)?,
        tenant_id: TenantId(row.get(1)?),
        task_kind: TaskKind::parse(&task_kind_raw)
            .ok_or_else(|| anyhow!("unknown task_kind: {task_kind_raw}"))?,
        subject_id: row.get::<_, Option<i64>>(3)?.map(SubjectId),
        status: RunStatus::parse(&status_raw)
            .ok_or_else(|| anyhow!("unknown run status: {status_raw}"))?,
        approval_status: ApprovalStatus::parse(&approval_raw)
            .ok_or_else(|| anyhow!("unknown approval status: {approval_raw}"))?,
        idempotency_key: row.get(6)?,
        attempts: u32::try_from(attempts).map_err(|_| anyhow!("invalid attempts: {attempts}"))?,
        last_error: row.get(8)?,
        input: serde_json::from_str(&input_raw).context("invalid input_json")?,
        proposed_mutations: mutations_raw
            .map(|raw| serde_json::from_str(&raw))
            .transpose()
            .context("invalid proposed_mutations_json")?,
        output: output_raw
            .map(|raw| serde_json::from_str(&raw))
            .transpose()
            .context("invalid output_json")?,
        created_at: parse_rfc3339(&row.get::<_, String>(12)?)?,
        started_at: parse_optional_rfc3339(row.get(13)?)?,
        heartbeat_at: parse_optional_rfc3339(row.get(14)?)?,
        finished_at: parse_optional_rfc3339(row.get(15)?)?,
        next_attempt_at: parse_optional_rfc3339(row.get(16)?)?,
        decided_by: row.get(17)?,
        decided_at: parse_optional_rfc3339(row.get(18)?)?,
    })
}

fn parse_optional_rfc3339(value: Option<String>) -> Result<Option<DateTimeUtc>> {
    value.as_deref().map(parse_rfc3339).transpose()
}

fn ensure_column(conn: &Connection, table: &str, column: &str, sql_type: &str) -> Result<()> {
    if table_has_column(conn, table, column)? {
        return Ok(());
    }

    conn.execute(
        &format!("ALTER TABLE {table} ADD COLUMN {column} {sql_type}"),
        [],
    )
    .with_context(|| format!("failed to add missing column {table}.{column}"))?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({table})"))
        .with_context(|| format!("failed to inspect table info for {table}"))?;

    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::SqliteLedger;
    use agent_runs_domain::{
        verify_event_chain, ApprovalStatus, NewRun, ProposedMutation, MutationOp,
        MutationTarget, RunId, RunStatus, SubjectId, SubjectState, TaskKind, TenantId,
    };
    use agent_runs_store_core::{
        ApplyCommit, MutationContext, MutationWriter, RunFilter, RunLedger, StartOutcome,
        SubjectStateSource, Transition,
    };
    use anyhow::Result;
    use serde_json::{json, Map};
    use time::{Duration, OffsetDateTime};

    fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err:#}"),
        }
    }

    fn temp_db_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!(
            "agent-runs-ledger-test-{}-{}.sqlite",
            name,
            ulid::Ulid::new()
        ))
    }

    fn fixture_ledger(name: &str) -> SqliteLedger {
        let ledger = must(SqliteLedger::open(&temp_db_path(name)));
        must(ledger.migrate());
        ledger
    }

    fn new_run(key: Option<&str>) -> NewRun {
        NewRun {
            tenant_id: TenantId(7),
            task_kind: TaskKind::HqsPrecheck,
            subject_id: Some(SubjectId(42)),
            input: json!({"stage": "compliance"}),
            idempotency_key: key.map(str::to_string),
        }
    }

    fn started(ledger: &SqliteLedger, now: OffsetDateTime) -> RunId {
        let submission = must(ledger.submit(&new_run(None), now));
        match must(ledger.start_run(TenantId(7), submission.run.run_id, 0, 10, now)) {
            StartOutcome::Started(run) => run.run_id,
            other => panic!("expected start, got {other:?}"),
        }
    }

    #[test]
    fn migrate_is_idempotent() {
        let ledger = fixture_ledger("migrate-twice");
        assert!(ledger.migrate().is_ok());
        let versions: i64 = ledger
            .conn
            .query_row("SELECT COUNT(*) FROM schema_migrations", [], |row| row.get(0))
            .unwrap_or_else(|_| unreachable!());
        assert_eq!(versions, 1);
    }

    #[test]
    fn submit_with_same_key_returns_existing_run() {
        let ledger = fixture_ledger("idempotent-submit");
        let now = OffsetDateTime::now_utc();
        let first = must(ledger.submit(&new_run(Some("k-1")), now));
        let second = must(ledger.submit(&new_run(Some("k-1")), now));
        assert!(first.created);
        assert!(!second.created);
        assert_eq!(first.run.run_id, second.run.run_id);

        let other_tenant = NewRun {
            tenant_id: TenantId(8),
            ..new_run(Some("k-1"))
        };
        let third = must(ledger.submit(&other_tenant, now));
        assert!(third.created);
        assert_ne!(third.run.run_id, first.run.run_id);

        let runs = must(ledger.list_runs(&RunFilter {
            tenant_id: Some(TenantId(7)),
            ..RunFilter::default()
        }));
        assert_eq!(runs.len(), 1);
    }

    #[test]
    fn run_events_are_append_only() {
        let ledger = fixture_ledger("append-only");
        let now = OffsetDateTime::now_utc();
        let run_id = started(&ledger, now);
        let events = must(ledger.list_events(run_id));
        assert_eq!(events.len(), 2);
        assert!(matches!(verify_event_chain(&events), Ok(true)));

        let mutated = ledger
            .conn
            .execute("UPDATE run_events SET actor = 'mutated'", []);
        assert!(mutated.is_err());
        let deleted = ledger.conn.execute("DELETE FROM run_events", []);
        assert!(deleted.is_err());
    }

    #[test]
    fn due_runs_and_recent_counts_are_selected_in_time_order() {
        let ledger = fixture_ledger("due-order");
        let base = must(
            OffsetDateTime::from_unix_timestamp(1_760_000_000).map_err(anyhow::Error::from),
        );
        let submit_at =
            |at: OffsetDateTime| must(ledger.submit(&new_run(None), at)).run.run_id;
        let a = submit_at(base);
        let b = submit_at(base + Duration::milliseconds(5));
        let c = submit_at(base + Duration::seconds(2));
        let d = submit_at(base + Duration::seconds(3));

        let started_at = base + Duration::seconds(4);
        assert!(matches!(
            must(ledger.start_run(TenantId(7), d, 0, 10, started_at)),
            StartOutcome::Started(_)
        ));
        let retry_at = base + Duration::seconds(60);
        assert!(must(ledger.schedule_retry(
            TenantId(7),
            d,
            "execution_error: boom",
            retry_at,
            started_at
        ))
        .applied());

        let ids = |runs: Vec<agent_runs_domain::Run>| -> Vec<RunId> {
            runs.into_iter().map(|run| run.run_id).collect()
        };
        let before_retry = base + Duration::seconds(10);
        assert_eq!(ids(must(ledger.list_due_runs(before_retry, 10))), vec![a, b, c]);
        assert_eq!(ids(must(ledger.list_due_runs(before_retry, 2))), vec![a, b]);
        assert_eq!(ids(must(ledger.list_due_runs(retry_at, 10))), vec![a, b, c, d]);

        let subject = SubjectId(42);
        assert_eq!(must(ledger.count_runs_since(TenantId(7), subject, base)), 4);
        assert_eq!(
            must(ledger.count_runs_since(TenantId(7), subject, base + Duration::milliseconds(5))),
            3
        );
        assert_eq!(
            must(ledger.count_runs_since(TenantId(7), subject, base + Duration::hours(1))),
            0
        );
        assert_eq!(must(ledger.count_runs_since(TenantId(8), subject, base)), 0);
    }

    #[test]
    fn lock_is_exclusive_until_expiry_then_stolen() {
        let ledger = fixture_ledger("lock-steal");
        let now = OffsetDateTime::now_utc();
        let ttl = Duration::seconds(30);
        let tenant = TenantId(1);
        let kind = TaskKind::OpsJudge;

        assert!(must(ledger.try_acquire_lock(tenant, kind, "a", now, ttl)));
        assert!(must(ledger.try_acquire_lock(tenant, kind, "a", now, ttl)));
        assert!(!must(ledger.try_acquire_lock(tenant, kind, "b", now, ttl)));
        assert!(must(ledger.try_acquire_lock(
            TenantId(2),
            kind,
            "b",
            now,
            ttl
        )));

        let later = now + Duration::seconds(31);
        assert!(must(ledger.try_acquire_lock(tenant, kind, "b", later, ttl)));
        assert!(!must(ledger.release_lock(tenant, kind, "a")));
        assert!(must(ledger.release_lock(tenant, kind, "b")));
        assert!(must(ledger.try_acquire_lock(tenant, kind, "c", later, ttl)));
    }

    #[test]
    fn start_run_respects_cap_attempt_and_backoff() {
        let ledger = fixture_ledger("start-guards");
        let now = OffsetDateTime::now_utc();
        let a = must(ledger.submit(&new_run(None), now)).run.run_id;
        let b = must(ledger.submit(&new_run(None), now)).run.run_id;

        assert!(matches!(
            must(ledger.start_run(TenantId(7), a, 1, 1, now)),
            StartOutcome::NotStartable(_)
        ));
        assert!(matches!(
            must(ledger.start_run(TenantId(7), a, 0, 1, now)),
            StartOutcome::Started(run) if run.attempts == 1 && run.status == RunStatus::Running
        ));
        assert!(matches!(
            must(ledger.start_run(TenantId(7), b, 0, 1, now)),
            StartOutcome::TenantCapReached { running: 1 }
        ));
        assert!(matches!(
            must(ledger.start_run(TenantId(99), b, 0, 1, now)),
            StartOutcome::Missing
        ));

        let retry_at = now + Duration::seconds(5);
        assert!(must(ledger.schedule_retry(TenantId(7), a, "execution_error: boom", retry_at, now)).applied());
        assert!(matches!(
            must(ledger.start_run(TenantId(7), a, 1, 5, now)),
            StartOutcome::NotStartable(_)
        ));
        assert!(matches!(
            must(ledger.start_run(TenantId(7), a, 1, 5, retry_at)),
            StartOutcome::Started(run) if run.attempts == 2
        ));
    }

    #[test]
    fn terminal_runs_ignore_further_transitions() {
        let ledger = fixture_ledger("terminal-sink");
        let now = OffsetDateTime::now_utc();
        let run_id = started(&ledger, now);
        assert!(must(ledger.finish_done(TenantId(7), run_id, &json!({"summary": "ok"}), now)).applied());

        let again = must(ledger.fail_running(TenantId(7), run_id, "late", now));
        assert!(matches!(again, Transition::Unchanged(ref run) if run.status == RunStatus::Done));
        let approve = must(ledger.approve(TenantId(7), run_id, "owner", now));
        assert!(!approve.applied());
    }

    #[test]
    fn aborted_apply_rolls_back_every_write() {
        let ledger = fixture_ledger("apply-rollback");
        let now = OffsetDateTime::now_utc();
        let run_id = started(&ledger, now);
        let mutation = ProposedMutation::new(
            MutationTarget::RehabTask,
            MutationOp::Create,
            json!({"title": "paint"}),
        );
        assert!(must(ledger.finish_blocked(
            TenantId(7),
            run_id,
            &json!({"summary": "s"}),
            &[mutation],
            now
        ))
        .applied());
        assert!(must(ledger.approve(TenantId(7), run_id, "owner", now)).applied());

        let ctx = MutationContext {
            tenant_id: TenantId(7),
            subject_id: SubjectId(42),
            run_id,
            actor: "owner".to_string(),
            now,
        };
        let outcome = must(ledger.commit_apply(TenantId(7), run_id, "owner", now, &|writer: &dyn MutationWriter| -> Result<usize, Vec<String>> {
            writer
                .create_rehab_task(&ctx, "paint", None, None, None)
                .map_err(|err| vec![err.to_string()])?;
            writer
                .update_checklist_item_status(&ctx, "missing", "passed")
                .map_err(|err| vec![err.to_string()])?;
            Ok(2)
        }));
        assert!(matches!(outcome, ApplyCommit::Aborted { ref errors } if errors.len() == 1));
        assert!(must(ledger.list_rehab_tasks(TenantId(7), SubjectId(42))).is_empty());

        let run = must(ledger.get_run(TenantId(7), run_id));
        let run = run.unwrap_or_else(|| unreachable!());
        assert_eq!(run.status, RunStatus::Blocked);
        assert_eq!(run.approval_status, ApprovalStatus::Approved);
    }

    #[test]
    fn sweep_fails_stale_runs_and_releases_their_locks() {
        let ledger = fixture_ledger("sweep");
        let now = OffsetDateTime::now_utc();
        let run_id = started(&ledger, now);
        assert!(must(ledger.try_acquire_lock(
            TenantId(7),
            TaskKind::HqsPrecheck,
            &run_id.to_string(),
            now,
            Duration::minutes(10)
        )));

        assert!(must(ledger.sweep_stale(now - Duration::seconds(1), now)).is_empty());
        let swept = must(ledger.sweep_stale(now + Duration::seconds(1), now + Duration::seconds(2)));
        assert_eq!(swept.len(), 1);
        assert_eq!(swept[0].status, RunStatus::Failed);
        assert!(swept[0]
            .last_error
            .as_deref()
            .is_some_and(|err| err.starts_with("timeout:")));

        assert!(must(ledger.try_acquire_lock(
            TenantId(7),
            TaskKind::HqsPrecheck,
            "someone-else",
            now,
            Duration::minutes(10)
        )));
        let events = must(ledger.list_events(run_id));
        assert!(matches!(verify_event_chain(&events), Ok(true)));
    }

    #[test]
    fn subject_state_upserts() {
        let ledger = fixture_ledger("subject-state");
        let mut state = SubjectState {
            tenant_id: TenantId(1),
            subject_id: SubjectId(2),
            stage: "intake".to_string(),
            flags: vec!["rent-gap".to_string()],
            attributes: Map::new(),
            updated_at: OffsetDateTime::now_utc(),
        };
        must(ledger.upsert_subject_state(&state));
        state.stage = "compliance".to_string();
        must(ledger.upsert_subject_state(&state));
        let loaded = must(ledger.subject_state(TenantId(1), SubjectId(2)));
        assert_eq!(loaded.map(|s| s.stage), Some("compliance".to_string()));
        assert!(must(ledger.subject_state(TenantId(1), SubjectId(3))).is_none());
    }
}
