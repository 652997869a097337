//! The SQLite-backed audit store.
//!
//! One database file per installation, append-only by discipline: rows in
//! `tool_calls`, `tool_results`, and `planner_proposals` are inserted and
//! never updated or deleted. Run rows mutate only along the monotonic
//! status path `pending → running → {completed, failed}`.
//!
//! Every hash the store writes — plan, policy, input, output — is SHA-256
//! over canonical JSON, so `verify_run` can recompute the whole trail from
//! the stored bytes alone. Plans and policies are stored verbatim next to
//! their hashes to make replay self-contained.
//!
//! Concurrency: a single writer per database file, enforced with a mutex
//! around the connection; WAL mode keeps concurrent readers unblocked.

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{Map, Value};
use tracing::{debug, info};
use uuid::Uuid;

use capsule_contracts::{
    canonical_json, hash_bytes, hash_optional, CallStatus, CapsuleError, CapsuleResult, Plan,
    PlannerProposal, Policy, PolicyDecision, ProposalType, Run, RunMode, RunStatus, StepCounts,
    ToolCall, ToolResult,
};

/// Current schema version, recorded in the `meta` table. Migrations are
/// additive only.
const SCHEMA_VERSION: i64 = 1;

const CREATE_TABLES_SQL: &str = "
CREATE TABLE IF NOT EXISTS meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS runs (
    run_id TEXT PRIMARY KEY,
    created_at TEXT NOT NULL,
    completed_at TEXT,
    plan_hash TEXT NOT NULL,
    policy_hash TEXT NOT NULL,
    plan_json TEXT NOT NULL,
    policy_json TEXT NOT NULL,
    mode TEXT NOT NULL DEFAULT 'run',
    status TEXT NOT NULL DEFAULT 'pending',
    total_steps INTEGER NOT NULL DEFAULT 0,
    completed_steps INTEGER NOT NULL DEFAULT 0,
    denied_steps INTEGER NOT NULL DEFAULT 0,
    failed_steps INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS tool_calls (
    call_id TEXT PRIMARY KEY,
    run_id TEXT NOT NULL REFERENCES runs(run_id),
    step_index INTEGER NOT NULL,
    tool_name TEXT NOT NULL,
    args_json TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS tool_results (
    call_id TEXT PRIMARY KEY REFERENCES tool_calls(call_id),
    run_id TEXT NOT NULL REFERENCES runs(run_id),
    status TEXT NOT NULL,
    output_json TEXT,
    error TEXT,
    decision_json TEXT NOT NULL,
    started_at TEXT NOT NULL,
    ended_at TEXT NOT NULL,
    input_hash TEXT NOT NULL,
    output_hash TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS planner_proposals (
    id TEXT PRIMARY KEY,
    run_id TEXT NOT NULL REFERENCES runs(run_id),
    iteration INTEGER NOT NULL,
    proposal_type TEXT NOT NULL,
    tool_name TEXT,
    args_json TEXT,
    reasoning TEXT,
    raw_response TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_tool_calls_run_id ON tool_calls(run_id);
CREATE INDEX IF NOT EXISTS idx_tool_results_run_id ON tool_results(run_id);
CREATE INDEX IF NOT EXISTS idx_proposals_run_id ON planner_proposals(run_id);
CREATE INDEX IF NOT EXISTS idx_runs_created_at ON runs(created_at);
";

/// Outcome of `verify_run`: every stored hash recomputed and compared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyReport {
    pub ok: bool,
    pub mismatches: Vec<String>,
}

/// Handle to one Capsule audit database.
pub struct CapsuleStore {
    conn: Mutex<Connection>,
}

impl CapsuleStore {
    /// Open (and initialize if needed) the database at `path`.
    pub fn open(path: &Path) -> CapsuleResult<Self> {
        let conn = Connection::open(path)
            .map_err(|e| CapsuleError::storage("open", e))?;
        Self::init(conn)
    }

    /// An in-memory store, used by tests and `--db :memory:`.
    pub fn open_in_memory() -> CapsuleResult<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| CapsuleError::storage("open", e))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> CapsuleResult<Self> {
        conn.pragma_update(None, "journal_mode", "wal").ok();
        conn.pragma_update(None, "foreign_keys", "on")
            .map_err(|e| CapsuleError::storage("init_schema", e))?;
        conn.busy_timeout(std::time::Duration::from_millis(5_000))
            .map_err(|e| CapsuleError::storage("init_schema", e))?;
        conn.execute_batch(CREATE_TABLES_SQL)
            .map_err(|e| CapsuleError::storage("init_schema", e))?;

        let stored: Option<String> = conn
            .query_row("SELECT value FROM meta WHERE key = 'schema_version'", [], |row| {
                row.get(0)
            })
            .optional()
            .map_err(|e| CapsuleError::storage("init_schema", e))?;
        match stored {
            None => {
                conn.execute(
                    "INSERT INTO meta (key, value) VALUES ('schema_version', ?1)",
                    params![SCHEMA_VERSION.to_string()],
                )
                .map_err(|e| CapsuleError::storage("init_schema", e))?;
            }
            Some(v) if v.parse::<i64>() == Ok(SCHEMA_VERSION) => {}
            Some(v) => {
                return Err(CapsuleError::storage(
                    "init_schema",
                    format!("schema version mismatch: database has {}, expected {}", v, SCHEMA_VERSION),
                ));
            }
        }

        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Short opaque id: 8 hex chars of a v4 UUID, regenerated on the
    /// (unlikely) collision with an existing row.
    fn generate_id(conn: &Connection, table: &str) -> CapsuleResult<String> {
        let key_column = match table {
            "runs" => "run_id",
            "tool_calls" => "call_id",
            _ => "id",
        };
        loop {
            let id = Uuid::new_v4().simple().to_string()[..8].to_string();
            let exists: bool = conn
                .query_row(
                    &format!("SELECT EXISTS(SELECT 1 FROM {} WHERE {} = ?1)", table, key_column),
                    params![id],
                    |row| row.get(0),
                )
                .map_err(|e| CapsuleError::storage("generate_id", e))?;
            if !exists {
                return Ok(id);
            }
        }
    }

    // ── Runs ──────────────────────────────────────────────────────────────────

    /// Create a run in state `pending`, hashing and storing the plan and
    /// policy verbatim.
    pub fn create_run(&self, plan: &Plan, policy: &Policy, mode: RunMode) -> CapsuleResult<String> {
        let plan_json = plan.canonical_json()?;
        let policy_json = policy.canonical_json()?;
        let plan_hash = hash_bytes(plan_json.as_bytes());
        let policy_hash = hash_bytes(policy_json.as_bytes());

        let conn = self.lock();
        let run_id = Self::generate_id(&conn, "runs")?;
        conn.execute(
            "INSERT INTO runs (
                run_id, created_at, plan_hash, policy_hash, plan_json, policy_json,
                mode, status, total_steps
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                run_id,
                Utc::now().to_rfc3339(),
                plan_hash,
                policy_hash,
                plan_json,
                policy_json,
                mode.as_str(),
                RunStatus::Pending.as_str(),
                plan.steps.len() as i64,
            ],
        )
        .map_err(|e| CapsuleError::storage("create_run", e))?;

        info!(run_id = %run_id, mode = mode.as_str(), steps = plan.steps.len(), "run created");
        Ok(run_id)
    }

    pub fn get_run(&self, run_id: &str) -> CapsuleResult<Option<Run>> {
        let conn = self.lock();
        conn.query_row(
            "SELECT run_id, created_at, completed_at, plan_hash, policy_hash, mode, status,
                    total_steps, completed_steps, denied_steps, failed_steps
             FROM runs WHERE run_id = ?1",
            params![run_id],
            row_to_run,
        )
        .optional()
        .map_err(|e| CapsuleError::storage("get_run", e))
    }

    /// Recent runs, most recent first.
    pub fn list_runs(&self, limit: u32) -> CapsuleResult<Vec<Run>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare(
                "SELECT run_id, created_at, completed_at, plan_hash, policy_hash, mode, status,
                        total_steps, completed_steps, denied_steps, failed_steps
                 FROM runs ORDER BY created_at DESC, run_id LIMIT ?1",
            )
            .map_err(|e| CapsuleError::storage("list_runs", e))?;
        let rows = stmt
            .query_map(params![limit], row_to_run)
            .map_err(|e| CapsuleError::storage("list_runs", e))?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(|e| CapsuleError::storage("list_runs", e))
    }

    /// The plan stored verbatim for a run.
    pub fn get_run_plan(&self, run_id: &str) -> CapsuleResult<Option<Plan>> {
        self.get_run_json(run_id, "plan_json")?
            .map(|json| {
                serde_json::from_str(&json).map_err(|e| {
                    CapsuleError::storage("get_run_plan", format!("stored plan is corrupt: {}", e))
                })
            })
            .transpose()
    }

    /// The policy stored verbatim for a run.
    pub fn get_run_policy(&self, run_id: &str) -> CapsuleResult<Option<Policy>> {
        self.get_run_json(run_id, "policy_json")?
            .map(|json| {
                serde_json::from_str(&json).map_err(|e| {
                    CapsuleError::storage("get_run_policy", format!("stored policy is corrupt: {}", e))
                })
            })
            .transpose()
    }

    fn get_run_json(&self, run_id: &str, column: &str) -> CapsuleResult<Option<String>> {
        let conn = self.lock();
        conn.query_row(
            &format!("SELECT {} FROM runs WHERE run_id = ?1", column),
            params![run_id],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| CapsuleError::storage("get_run_json", e))
    }

    /// Advance a run's status and record final step counters.
    ///
    /// Transitions are monotonic; anything else is a storage error. The
    /// terminal states also stamp `completed_at`.
    pub fn update_run_status(
        &self,
        run_id: &str,
        status: RunStatus,
        counts: StepCounts,
    ) -> CapsuleResult<()> {
        let conn = self.lock();
        let current: Option<String> = conn
            .query_row("SELECT status FROM runs WHERE run_id = ?1", params![run_id], |row| {
                row.get(0)
            })
            .optional()
            .map_err(|e| CapsuleError::storage("update_run_status", e))?;
        let Some(current) = current else {
            return Err(CapsuleError::RunNotFound { run_id: run_id.to_string() });
        };
        let current: RunStatus = current
            .parse()
            .map_err(|e| CapsuleError::storage("update_run_status", e))?;
        if current != status && !current.can_transition_to(status) {
            return Err(CapsuleError::storage(
                "update_run_status",
                format!(
                    "illegal status transition {} -> {} for run {}",
                    current.as_str(),
                    status.as_str(),
                    run_id
                ),
            ));
        }

        let completed_at = matches!(status, RunStatus::Completed | RunStatus::Failed)
            .then(|| Utc::now().to_rfc3339());
        conn.execute(
            "UPDATE runs SET status = ?1, completed_at = COALESCE(?2, completed_at),
                    completed_steps = ?3, denied_steps = ?4, failed_steps = ?5
             WHERE run_id = ?6",
            params![
                status.as_str(),
                completed_at,
                counts.completed,
                counts.denied,
                counts.failed,
                run_id
            ],
        )
        .map_err(|e| CapsuleError::storage("update_run_status", e))?;
        debug!(run_id = %run_id, status = status.as_str(), "run status updated");
        Ok(())
    }

    // ── Calls and results ─────────────────────────────────────────────────────

    /// Record a tool call; returns the generated `call_id`.
    ///
    /// The args are stored in canonical JSON so the input hash can always
    /// be recomputed byte-for-byte from the row.
    pub fn record_call(
        &self,
        run_id: &str,
        step_index: u32,
        tool_name: &str,
        args: &Map<String, Value>,
    ) -> CapsuleResult<String> {
        let args_json = canonical_json(&Value::Object(args.clone()));
        let conn = self.lock();
        let call_id = Self::generate_id(&conn, "tool_calls")?;
        conn.execute(
            "INSERT INTO tool_calls (call_id, run_id, step_index, tool_name, args_json, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![call_id, run_id, step_index, tool_name, args_json, Utc::now().to_rfc3339()],
        )
        .map_err(|e| CapsuleError::storage("record_call", e))?;
        Ok(call_id)
    }

    /// Record the result for a call.
    ///
    /// `input_hash` is computed from the args stored at `record_call` time
    /// and `output_hash` from the output passed here; the insert runs in a
    /// transaction and a second result for the same call is rejected.
    #[allow(clippy::too_many_arguments)]
    pub fn record_result(
        &self,
        call_id: &str,
        run_id: &str,
        status: CallStatus,
        output: Option<&Value>,
        error: Option<&str>,
        decision: &PolicyDecision,
        started_at: DateTime<Utc>,
        ended_at: DateTime<Utc>,
    ) -> CapsuleResult<()> {
        let mut conn = self.lock();
        let tx = conn
            .transaction()
            .map_err(|e| CapsuleError::storage("record_result", e))?;

        let args_json: Option<String> = tx
            .query_row(
                "SELECT args_json FROM tool_calls WHERE call_id = ?1",
                params![call_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| CapsuleError::storage("record_result", e))?;
        let Some(args_json) = args_json else {
            return Err(CapsuleError::storage(
                "record_result",
                format!("no tool_calls row for call {}", call_id),
            ));
        };

        let existing: bool = tx
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM tool_results WHERE call_id = ?1)",
                params![call_id],
                |row| row.get(0),
            )
            .map_err(|e| CapsuleError::storage("record_result", e))?;
        if existing {
            return Err(CapsuleError::storage(
                "record_result",
                format!("call {} already has a result", call_id),
            ));
        }

        let input_hash = hash_bytes(args_json.as_bytes());
        let output_hash = hash_optional(output);
        let output_json = output.map(canonical_json);
        let decision_json = serde_json::to_string(decision)
            .map_err(|e| CapsuleError::storage("record_result", e))?;

        tx.execute(
            "INSERT INTO tool_results (
                call_id, run_id, status, output_json, error, decision_json,
                started_at, ended_at, input_hash, output_hash
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                call_id,
                run_id,
                status.as_str(),
                output_json,
                error,
                decision_json,
                started_at.to_rfc3339(),
                ended_at.to_rfc3339(),
                input_hash,
                output_hash
            ],
        )
        .map_err(|e| CapsuleError::storage("record_result", e))?;
        tx.commit().map_err(|e| CapsuleError::storage("record_result", e))?;
        Ok(())
    }

    /// All calls for a run, in step order.
    pub fn get_calls(&self, run_id: &str) -> CapsuleResult<Vec<ToolCall>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare(
                "SELECT call_id, run_id, step_index, tool_name, args_json, created_at
                 FROM tool_calls WHERE run_id = ?1 ORDER BY step_index",
            )
            .map_err(|e| CapsuleError::storage("get_calls", e))?;
        let rows = stmt
            .query_map(params![run_id], row_to_call)
            .map_err(|e| CapsuleError::storage("get_calls", e))?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(|e| CapsuleError::storage("get_calls", e))
    }

    /// All results for a run, ordered by the owning call's step index.
    pub fn get_results(&self, run_id: &str) -> CapsuleResult<Vec<ToolResult>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare(
                "SELECT tr.call_id, tr.run_id, tr.status, tr.output_json, tr.error,
                        tr.decision_json, tr.started_at, tr.ended_at, tr.input_hash, tr.output_hash
                 FROM tool_results tr
                 JOIN tool_calls tc ON tr.call_id = tc.call_id
                 WHERE tr.run_id = ?1 ORDER BY tc.step_index",
            )
            .map_err(|e| CapsuleError::storage("get_results", e))?;
        let rows = stmt
            .query_map(params![run_id], row_to_result)
            .map_err(|e| CapsuleError::storage("get_results", e))?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(|e| CapsuleError::storage("get_results", e))
    }

    pub fn get_result_for_call(&self, call_id: &str) -> CapsuleResult<Option<ToolResult>> {
        let conn = self.lock();
        conn.query_row(
            "SELECT call_id, run_id, status, output_json, error, decision_json,
                    started_at, ended_at, input_hash, output_hash
             FROM tool_results WHERE call_id = ?1",
            params![call_id],
            row_to_result,
        )
        .optional()
        .map_err(|e| CapsuleError::storage("get_result_for_call", e))
    }

    // ── Planner proposals ─────────────────────────────────────────────────────

    /// Log one planner output, parseable or not.
    pub fn record_proposal(
        &self,
        run_id: &str,
        iteration: u32,
        proposal_type: ProposalType,
        tool_name: Option<&str>,
        args_json: Option<&str>,
        reasoning: Option<&str>,
        raw_response: &str,
    ) -> CapsuleResult<String> {
        let conn = self.lock();
        let id = Self::generate_id(&conn, "planner_proposals")?;
        conn.execute(
            "INSERT INTO planner_proposals (
                id, run_id, iteration, proposal_type, tool_name, args_json,
                reasoning, raw_response, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                id,
                run_id,
                iteration,
                proposal_type.as_str(),
                tool_name,
                args_json,
                reasoning,
                raw_response,
                Utc::now().to_rfc3339()
            ],
        )
        .map_err(|e| CapsuleError::storage("record_proposal", e))?;
        Ok(id)
    }

    pub fn get_proposals(&self, run_id: &str) -> CapsuleResult<Vec<PlannerProposal>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare(
                "SELECT id, run_id, iteration, proposal_type, tool_name, args_json,
                        reasoning, raw_response, created_at
                 FROM planner_proposals WHERE run_id = ?1 ORDER BY iteration",
            )
            .map_err(|e| CapsuleError::storage("get_proposals", e))?;
        let rows = stmt
            .query_map(params![run_id], row_to_proposal)
            .map_err(|e| CapsuleError::storage("get_proposals", e))?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(|e| CapsuleError::storage("get_proposals", e))
    }

    // ── Verification ──────────────────────────────────────────────────────────

    /// Recompute every hash stored for a run and compare against the
    /// recorded values. Also checks the call/result pairing and that step
    /// indices are gapless.
    pub fn verify_run(&self, run_id: &str) -> CapsuleResult<VerifyReport> {
        let Some(run) = self.get_run(run_id)? else {
            return Err(CapsuleError::RunNotFound { run_id: run_id.to_string() });
        };
        let mut mismatches = Vec::new();

        for (column, stored) in [("plan_json", &run.plan_hash), ("policy_json", &run.policy_hash)] {
            if let Some(json) = self.get_run_json(run_id, column)? {
                let recomputed = hash_bytes(json.as_bytes());
                if &recomputed != stored {
                    mismatches.push(format!(
                        "{}: hash mismatch (stored={}.., computed={}..)",
                        column,
                        &stored[..8.min(stored.len())],
                        &recomputed[..8]
                    ));
                }
            }
        }

        let calls = self.get_calls(run_id)?;
        let results = self.get_results(run_id)?;
        if calls.len() != results.len() {
            mismatches.push(format!(
                "call/result count mismatch: {} calls, {} results",
                calls.len(),
                results.len()
            ));
        }
        for (position, call) in calls.iter().enumerate() {
            if call.step_index as usize != position {
                mismatches.push(format!(
                    "non-sequential step index {} at position {}",
                    call.step_index, position
                ));
            }
        }

        for call in &calls {
            let Some(result) = results.iter().find(|r| r.call_id == call.call_id) else {
                mismatches.push(format!(
                    "step {} ({}): missing result for call {}",
                    call.step_index, call.tool_name, call.call_id
                ));
                continue;
            };
            let recomputed_input = hash_bytes(
                canonical_json(&Value::Object(call.args.clone())).as_bytes(),
            );
            if recomputed_input != result.input_hash {
                mismatches.push(format!(
                    "step {}: input hash mismatch (stored={}.., computed={}..)",
                    call.step_index,
                    &result.input_hash[..8.min(result.input_hash.len())],
                    &recomputed_input[..8]
                ));
            }
            let recomputed_output = hash_optional(result.output.as_ref());
            if recomputed_output != result.output_hash {
                mismatches.push(format!(
                    "step {}: output hash mismatch (stored={}.., computed={}..)",
                    call.step_index,
                    &result.output_hash[..8.min(result.output_hash.len())],
                    &recomputed_output[..8.min(recomputed_output.len())]
                ));
            }
        }

        Ok(VerifyReport { ok: mismatches.is_empty(), mismatches })
    }

    /// A run joined with its calls and results, for `show-run` and
    /// reporting.
    pub fn run_summary(&self, run_id: &str) -> CapsuleResult<Option<Value>> {
        let Some(run) = self.get_run(run_id)? else {
            return Ok(None);
        };
        let calls = self.get_calls(run_id)?;
        let results = self.get_results(run_id)?;

        let steps: Vec<Value> = calls
            .iter()
            .map(|call| {
                let result = results.iter().find(|r| r.call_id == call.call_id);
                serde_json::json!({
                    "step_index": call.step_index,
                    "call_id": call.call_id,
                    "tool": call.tool_name,
                    "args": Value::Object(call.args.clone()),
                    "status": result.map(|r| r.status.as_str()).unwrap_or("pending"),
                    "output": result.and_then(|r| r.output.clone()),
                    "error": result.and_then(|r| r.error.clone()),
                    "allowed": result.map(|r| r.decision.allowed),
                    "policy_reason": result.map(|r| r.decision.reason.clone()),
                })
            })
            .collect();

        Ok(Some(serde_json::json!({
            "run_id": run.run_id,
            "created_at": run.created_at.to_rfc3339(),
            "completed_at": run.completed_at.map(|t| t.to_rfc3339()),
            "status": run.status.as_str(),
            "mode": run.mode.as_str(),
            "plan_hash": run.plan_hash,
            "policy_hash": run.policy_hash,
            "total_steps": run.total_steps,
            "completed_steps": run.completed_steps,
            "denied_steps": run.denied_steps,
            "failed_steps": run.failed_steps,
            "steps": steps,
        })))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().expect("store connection lock poisoned")
    }
}

// ── Row mappers ───────────────────────────────────────────────────────────────

fn parse_timestamp(raw: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn row_to_run(row: &rusqlite::Row<'_>) -> rusqlite::Result<Run> {
    let created_at: String = row.get("created_at")?;
    let completed_at: Option<String> = row.get("completed_at")?;
    let mode: String = row.get("mode")?;
    let status: String = row.get("status")?;
    Ok(Run {
        run_id: row.get("run_id")?,
        created_at: parse_timestamp(created_at)?,
        completed_at: completed_at.map(parse_timestamp).transpose()?,
        plan_hash: row.get("plan_hash")?,
        policy_hash: row.get("policy_hash")?,
        mode: mode.parse().map_err(invalid_enum)?,
        status: status.parse().map_err(invalid_enum)?,
        total_steps: row.get("total_steps")?,
        completed_steps: row.get("completed_steps")?,
        denied_steps: row.get("denied_steps")?,
        failed_steps: row.get("failed_steps")?,
    })
}

fn row_to_call(row: &rusqlite::Row<'_>) -> rusqlite::Result<ToolCall> {
    let args_json: String = row.get("args_json")?;
    let args: Value = serde_json::from_str(&args_json).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let created_at: String = row.get("created_at")?;
    Ok(ToolCall {
        call_id: row.get("call_id")?,
        run_id: row.get("run_id")?,
        step_index: row.get("step_index")?,
        tool_name: row.get("tool_name")?,
        args: args.as_object().cloned().unwrap_or_default(),
        created_at: parse_timestamp(created_at)?,
    })
}

fn row_to_result(row: &rusqlite::Row<'_>) -> rusqlite::Result<ToolResult> {
    let status: String = row.get("status")?;
    let output_json: Option<String> = row.get("output_json")?;
    let decision_json: String = row.get("decision_json")?;
    let started_at: String = row.get("started_at")?;
    let ended_at: String = row.get("ended_at")?;

    let output = output_json
        .map(|json| serde_json::from_str(&json))
        .transpose()
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })?;
    let decision: PolicyDecision = serde_json::from_str(&decision_json).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })?;

    Ok(ToolResult {
        call_id: row.get("call_id")?,
        run_id: row.get("run_id")?,
        status: status.parse().map_err(invalid_enum)?,
        output,
        error: row.get("error")?,
        decision,
        started_at: parse_timestamp(started_at)?,
        ended_at: parse_timestamp(ended_at)?,
        input_hash: row.get("input_hash")?,
        output_hash: row.get("output_hash")?,
    })
}

fn row_to_proposal(row: &rusqlite::Row<'_>) -> rusqlite::Result<PlannerProposal> {
    let proposal_type: String = row.get("proposal_type")?;
    let created_at: String = row.get("created_at")?;
    Ok(PlannerProposal {
        id: row.get("id")?,
        run_id: row.get("run_id")?,
        iteration: row.get("iteration")?,
        proposal_type: proposal_type.parse().map_err(invalid_enum)?,
        tool_name: row.get("tool_name")?,
        args_json: row.get("args_json")?,
        reasoning: row.get("reasoning")?,
        raw_response: row.get("raw_response")?,
        created_at: parse_timestamp(created_at)?,
    })
}

fn invalid_enum(message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        0,
        rusqlite::types::Type::Text,
        message.into(),
    )
}
