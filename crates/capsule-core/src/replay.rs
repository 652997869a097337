//! The replay engine: bit-exact reproduction of a stored run.
//!
//! Replays never call tools or the Policy Engine. Every step's output and
//! status come verbatim from the origin run; the input and output hashes
//! are recomputed from the replayed data and compared against the origin's
//! stored hashes, so any drift in the stored artifacts surfaces as a
//! mismatch instead of silently producing a different run.

use chrono::Utc;
use serde_json::Value;
use tracing::{info, warn};

use capsule_contracts::{
    canonical_json, hash_bytes, hash_optional, CallStatus, CapsuleError, CapsuleResult, RunMode,
    RunStatus, StepCounts,
};
use capsule_store::CapsuleStore;

/// One replayed step, with the hashes that prove fidelity.
#[derive(Debug, Clone)]
pub struct ReplayStep {
    pub step_index: u32,
    pub tool_name: String,
    pub status: CallStatus,
    pub origin_call_id: String,
    pub replay_call_id: String,
    pub input_hash: String,
    pub output_hash: String,
}

/// Outcome of replaying one origin run.
#[derive(Debug, Clone)]
pub struct ReplayOutcome {
    pub replay_run_id: String,
    pub origin_run_id: String,
    pub status: RunStatus,
    pub steps: Vec<ReplayStep>,
    pub counts: StepCounts,
    pub plan_verified: bool,
    pub mismatches: Vec<String>,
}

impl ReplayOutcome {
    pub fn success(&self) -> bool {
        self.status == RunStatus::Completed && self.mismatches.is_empty()
    }
}

/// Reproduces stored runs from the audit store alone.
pub struct ReplayEngine<'a> {
    store: &'a CapsuleStore,
}

impl<'a> ReplayEngine<'a> {
    pub fn new(store: &'a CapsuleStore) -> Self {
        Self { store }
    }

    /// Replay `origin_run_id` into a fresh run with `mode = replay`.
    ///
    /// `verify_plan` additionally recomputes the origin's plan hash from
    /// the stored plan JSON and reports a mismatch if the recorded hash
    /// differs.
    pub fn replay(&self, origin_run_id: &str, verify_plan: bool) -> CapsuleResult<ReplayOutcome> {
        let origin = self
            .store
            .get_run(origin_run_id)?
            .ok_or_else(|| CapsuleError::RunNotFound { run_id: origin_run_id.to_string() })?;
        let plan = self.store.get_run_plan(origin_run_id)?.ok_or_else(|| CapsuleError::Replay {
            reason: format!("run {} has no stored plan", origin_run_id),
        })?;
        let policy =
            self.store.get_run_policy(origin_run_id)?.ok_or_else(|| CapsuleError::Replay {
                reason: format!("run {} has no stored policy", origin_run_id),
            })?;

        let mut mismatches = Vec::new();
        let mut plan_verified = true;
        if verify_plan {
            let recomputed = hash_bytes(plan.canonical_json()?.as_bytes());
            if recomputed != origin.plan_hash {
                plan_verified = false;
                mismatches.push(format!(
                    "plan hash mismatch: stored={}.., recomputed={}..",
                    &origin.plan_hash[..8.min(origin.plan_hash.len())],
                    &recomputed[..8]
                ));
            }
        }

        // A run still marked running crashed mid-flight; its trail is
        // incomplete and the replay reports it as failed.
        if origin.status == RunStatus::Running || origin.status == RunStatus::Pending {
            mismatches.push(format!(
                "origin run is in state '{}': audit trail may be incomplete",
                origin.status.as_str()
            ));
        }

        let replay_run_id = self.store.create_run(&plan, &policy, RunMode::Replay)?;
        self.store.update_run_status(&replay_run_id, RunStatus::Running, StepCounts::default())?;
        info!(origin = %origin_run_id, replay = %replay_run_id, "replay starting");

        let origin_calls = self.store.get_calls(origin_run_id)?;
        let origin_results = self.store.get_results(origin_run_id)?;

        let mut steps = Vec::with_capacity(origin_calls.len());
        let mut counts = StepCounts::default();

        for call in &origin_calls {
            let Some(result) = origin_results.iter().find(|r| r.call_id == call.call_id) else {
                mismatches.push(format!(
                    "step {} ({}): no result stored for call {}",
                    call.step_index, call.tool_name, call.call_id
                ));
                continue;
            };

            // Same args, copied output and status; fresh timestamps.
            let replay_call_id =
                self.store.record_call(&replay_run_id, call.step_index, &call.tool_name, &call.args)?;
            let now = Utc::now();
            self.store.record_result(
                &replay_call_id,
                &replay_run_id,
                result.status,
                result.output.as_ref(),
                result.error.as_deref(),
                &result.decision,
                now,
                now,
            )?;

            // Fidelity check: hashes of the replayed data must equal the
            // origin's stored hashes.
            let input_hash = hash_bytes(
                canonical_json(&Value::Object(call.args.clone())).as_bytes(),
            );
            let output_hash = hash_optional(result.output.as_ref());
            if input_hash != result.input_hash {
                mismatches.push(format!(
                    "step {}: input hash diverged (origin={}.., replay={}..)",
                    call.step_index,
                    &result.input_hash[..8.min(result.input_hash.len())],
                    &input_hash[..8]
                ));
            }
            if output_hash != result.output_hash {
                mismatches.push(format!(
                    "step {}: output hash diverged (origin={}.., replay={}..)",
                    call.step_index,
                    &result.output_hash[..8.min(result.output_hash.len())],
                    &output_hash[..8.min(output_hash.len())]
                ));
            }

            match result.status {
                CallStatus::Success => counts.completed += 1,
                CallStatus::Denied => counts.denied += 1,
                CallStatus::Error => counts.failed += 1,
            }
            steps.push(ReplayStep {
                step_index: call.step_index,
                tool_name: call.tool_name.clone(),
                status: result.status,
                origin_call_id: call.call_id.clone(),
                replay_call_id,
                input_hash,
                output_hash,
            });
        }

        let status = if mismatches.is_empty() { RunStatus::Completed } else { RunStatus::Failed };
        if !mismatches.is_empty() {
            warn!(origin = %origin_run_id, replay = %replay_run_id, count = mismatches.len(), "replay mismatches");
        }
        self.store.update_run_status(&replay_run_id, status, counts)?;

        Ok(ReplayOutcome {
            replay_run_id,
            origin_run_id: origin_run_id.to_string(),
            status,
            steps,
            counts,
            plan_verified,
            mismatches,
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use serde_json::{json, Map, Value};

    use capsule_contracts::{Plan, Policy};
    use capsule_tools::{Tool, ToolContext, ToolOutput, ToolRegistry};

    use crate::runner::{PlanRunner, RunOptions};

    use super::*;

    /// A read tool whose invocations are counted, to prove replays never
    /// execute tools.
    struct CountingReadTool {
        reads: Arc<AtomicU32>,
    }

    impl Tool for CountingReadTool {
        fn name(&self) -> &'static str {
            "fs.read"
        }

        fn description(&self) -> &'static str {
            "counting read stub"
        }

        fn schema(&self) -> Value {
            json!({"path": {"type": "string", "required": true}})
        }

        fn execute(&self, args: &Map<String, Value>, _ctx: &ToolContext) -> ToolOutput {
            self.reads.fetch_add(1, Ordering::SeqCst);
            ToolOutput::ok(json!({
                "content": "stub content",
                "size_bytes": 12,
                "encoding": "utf-8",
                "path": args["path"],
            }))
        }
    }

    fn fixture() -> (tempfile::TempDir, PathBuf, CapsuleStore, ToolRegistry, Arc<AtomicU32>) {
        // Non-dotted prefix so the workspace passes the hidden-file rule.
        let dir = tempfile::Builder::new().prefix("capsule-test-").tempdir().unwrap();
        let root = std::fs::canonicalize(dir.path()).unwrap();
        std::fs::write(root.join("README.md"), "hello").unwrap();
        let store = CapsuleStore::open_in_memory().unwrap();
        let reads = Arc::new(AtomicU32::new(0));
        let mut registry = ToolRegistry::new();
        registry.register(Box::new(CountingReadTool { reads: Arc::clone(&reads) }));
        (dir, root, store, registry, reads)
    }

    fn read_plan() -> Plan {
        Plan::from_yaml("steps:\n  - tool: fs.read\n    args: {path: ./README.md}\n").unwrap()
    }

    fn read_policy() -> Policy {
        Policy::from_yaml("tools:\n  fs.read:\n    allow_paths: [\"./**\"]\n").unwrap()
    }

    /// Replay fidelity: per-step status and hashes equal the origin's, and
    /// the tool is never invoked again.
    #[test]
    fn replay_reproduces_hashes_without_executing_tools() {
        let (_dir, root, store, registry, reads) = fixture();
        let runner = PlanRunner::new(&store, &registry, root);
        let origin = runner.run(&read_plan(), &read_policy(), &RunOptions::default()).unwrap();
        assert_eq!(reads.load(Ordering::SeqCst), 1);

        let origin_results = store.get_results(&origin.run_id).unwrap();

        let outcome = ReplayEngine::new(&store).replay(&origin.run_id, true).unwrap();
        assert!(outcome.success(), "mismatches: {:?}", outcome.mismatches);
        assert!(outcome.plan_verified);
        assert_ne!(outcome.replay_run_id, origin.run_id);
        assert_eq!(reads.load(Ordering::SeqCst), 1, "replay must not execute tools");

        // Step-by-step hash and status equality with the origin.
        assert_eq!(outcome.steps.len(), origin_results.len());
        for (step, origin_result) in outcome.steps.iter().zip(&origin_results) {
            assert_eq!(step.status, origin_result.status);
            assert_eq!(step.input_hash, origin_result.input_hash);
            assert_eq!(step.output_hash, origin_result.output_hash);
        }

        // The replay run is a first-class run in the store.
        let replay_run = store.get_run(&outcome.replay_run_id).unwrap().unwrap();
        assert_eq!(replay_run.mode, RunMode::Replay);
        assert_eq!(replay_run.status, RunStatus::Completed);
        assert_eq!(replay_run.plan_hash, store.get_run(&origin.run_id).unwrap().unwrap().plan_hash);
    }

    #[test]
    fn replay_of_denied_steps_copies_the_denials() {
        let (_dir, root, store, registry, reads) = fixture();
        std::fs::write(root.join(".env"), "x").unwrap();
        let runner = PlanRunner::new(&store, &registry, root);

        let plan = Plan::from_yaml("steps:\n  - tool: fs.read\n    args: {path: ./.env}\n").unwrap();
        let origin = runner.run(&plan, &read_policy(), &RunOptions::default()).unwrap();
        assert_eq!(origin.counts.denied, 1);
        assert_eq!(reads.load(Ordering::SeqCst), 0);

        let outcome = ReplayEngine::new(&store).replay(&origin.run_id, true).unwrap();
        assert!(outcome.success(), "mismatches: {:?}", outcome.mismatches);
        assert_eq!(outcome.counts.denied, 1);
        assert_eq!(outcome.steps[0].status, CallStatus::Denied);
        assert_eq!(reads.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn replay_of_unknown_run_is_a_not_found_error() {
        let store = CapsuleStore::open_in_memory().unwrap();
        let engine = ReplayEngine::new(&store);
        assert!(matches!(
            engine.replay("deadbeef", true),
            Err(CapsuleError::RunNotFound { .. })
        ));
    }

    #[test]
    fn interrupted_origin_runs_replay_as_failed() {
        let (_dir, _root, store, _registry, _reads) = fixture();
        // Simulate a crash: a run with a recorded call but no result and
        // still in running state.
        let run_id = store.create_run(&read_plan(), &read_policy(), RunMode::Run).unwrap();
        store.update_run_status(&run_id, RunStatus::Running, StepCounts::default()).unwrap();
        store
            .record_call(&run_id, 0, "fs.read", json!({"path": "./a"}).as_object().unwrap())
            .unwrap();

        let outcome = ReplayEngine::new(&store).replay(&run_id, true).unwrap();
        assert_eq!(outcome.status, RunStatus::Failed);
        assert!(outcome.mismatches.iter().any(|m| m.contains("incomplete")));
        assert!(outcome.mismatches.iter().any(|m| m.contains("no result stored")));
    }
}
