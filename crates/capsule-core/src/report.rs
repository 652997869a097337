//! Canonical JSON report assembly.
//!
//! The report is a plain JSON document built entirely from the store —
//! run metadata, the stored plan and policy, every step with its call,
//! decision and result, plus a rollup summary. Console rendering is the
//! caller's problem; this module only shapes data.

use std::collections::BTreeMap;

use chrono::Utc;
use serde_json::{json, Value};

use capsule_contracts::{CapsuleError, CapsuleResult};
use capsule_store::CapsuleStore;

/// Report schema version, bumped on shape changes.
const REPORT_VERSION: &str = "1.0";

/// Build the full report document for `run_id`.
pub fn build_report(store: &CapsuleStore, run_id: &str) -> CapsuleResult<Value> {
    let run = store
        .get_run(run_id)?
        .ok_or_else(|| CapsuleError::RunNotFound { run_id: run_id.to_string() })?;
    let plan = store.get_run_plan(run_id)?;
    let policy = store.get_run_policy(run_id)?;
    let calls = store.get_calls(run_id)?;
    let results = store.get_results(run_id)?;

    let mut steps = Vec::with_capacity(calls.len());
    let mut by_status: BTreeMap<&str, u32> = BTreeMap::new();
    let mut by_tool: BTreeMap<String, u32> = BTreeMap::new();
    let mut total_duration_ms: i64 = 0;

    for call in &calls {
        let result = results.iter().find(|r| r.call_id == call.call_id);
        let mut step = json!({
            "step_index": call.step_index,
            "call_id": call.call_id,
            "tool_name": call.tool_name,
            "args": Value::Object(call.args.clone()),
            "created_at": call.created_at.to_rfc3339(),
        });
        if let Some(result) = result {
            *by_status.entry(result.status.as_str()).or_insert(0) += 1;
            total_duration_ms += result.duration_ms();
            step["result"] = json!({
                "status": result.status.as_str(),
                "output": result.output,
                "error": result.error,
                "policy_decision": {
                    "allowed": result.decision.allowed,
                    "reason": result.decision.reason,
                    "rule_hit": result.decision.rule_hit,
                },
                "started_at": result.started_at.to_rfc3339(),
                "ended_at": result.ended_at.to_rfc3339(),
                "duration_ms": result.duration_ms(),
                "input_hash": result.input_hash,
                "output_hash": result.output_hash,
            });
        } else {
            *by_status.entry("pending").or_insert(0) += 1;
            step["result"] = Value::Null;
        }
        *by_tool.entry(call.tool_name.clone()).or_insert(0) += 1;
        steps.push(step);
    }

    Ok(json!({
        "report_version": REPORT_VERSION,
        "generated_at": Utc::now().to_rfc3339(),
        "run": {
            "run_id": run.run_id,
            "created_at": run.created_at.to_rfc3339(),
            "completed_at": run.completed_at.map(|t| t.to_rfc3339()),
            "status": run.status.as_str(),
            "mode": run.mode.as_str(),
            "plan_hash": run.plan_hash,
            "policy_hash": run.policy_hash,
            "statistics": {
                "total_steps": run.total_steps,
                "completed_steps": run.completed_steps,
                "denied_steps": run.denied_steps,
                "failed_steps": run.failed_steps,
            },
        },
        "plan": plan,
        "policy": policy,
        "steps": steps,
        "summary": {
            "calls_recorded": calls.len(),
            "by_status": by_status,
            "by_tool": by_tool,
            "total_duration_ms": total_duration_ms,
        },
    }))
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::json;

    use capsule_contracts::{CallStatus, Plan, Policy, PolicyDecision, RunMode};

    use super::*;

    #[test]
    fn report_includes_run_steps_and_summary() {
        let store = CapsuleStore::open_in_memory().unwrap();
        let plan =
            Plan::from_yaml("steps:\n  - tool: fs.read\n    args: {path: ./a}\n").unwrap();
        let policy = Policy::from_yaml("tools:\n  fs.read:\n    allow_paths: [\"./**\"]\n").unwrap();
        let run_id = store.create_run(&plan, &policy, RunMode::Run).unwrap();

        let call_id = store
            .record_call(&run_id, 0, "fs.read", json!({"path": "./a"}).as_object().unwrap())
            .unwrap();
        store
            .record_result(
                &call_id,
                &run_id,
                CallStatus::Success,
                Some(&json!({"content": "x", "size_bytes": 1})),
                None,
                &PolicyDecision::allow("path allowed", "allow_paths[./**]"),
                Utc::now(),
                Utc::now(),
            )
            .unwrap();

        let report = build_report(&store, &run_id).unwrap();
        assert_eq!(report["report_version"], "1.0");
        assert_eq!(report["run"]["run_id"], run_id);
        assert_eq!(report["plan"]["steps"][0]["tool"], "fs.read");
        assert_eq!(report["steps"][0]["result"]["status"], "success");
        assert_eq!(report["steps"][0]["result"]["policy_decision"]["allowed"], true);
        assert_eq!(report["summary"]["by_status"]["success"], 1);
        assert_eq!(report["summary"]["by_tool"]["fs.read"], 1);
    }

    #[test]
    fn missing_run_is_a_not_found_error() {
        let store = CapsuleStore::open_in_memory().unwrap();
        assert!(matches!(
            build_report(&store, "deadbeef"),
            Err(CapsuleError::RunNotFound { .. })
        ));
    }
}
