//! The plan orchestrator: linear execution of a static plan under policy.
//!
//! Per step: record the call, evaluate policy, execute on allow, record
//! the result — always in that order, always through the audit store. The
//! security invariant is structural: the only call site for
//! `Tool::execute` sits behind a `decision.allowed` check.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use capsule_contracts::{
    CallStatus, CapsuleResult, Plan, Policy, PolicyDecision, RunMode, RunStatus, StepCounts,
};
use capsule_policy::{CallCounters, PolicyEngine};
use capsule_store::CapsuleStore;
use capsule_tools::{ToolContext, ToolOutput, ToolRegistry};

/// Options for one plan execution.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Halt after the first non-success step (default true).
    pub fail_fast: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self { fail_fast: true }
    }
}

/// Outcome of one executed step.
#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub step_index: u32,
    pub tool_name: String,
    pub args: Map<String, Value>,
    pub status: CallStatus,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub decision: PolicyDecision,
    pub duration_ms: u64,
}

/// Outcome of a whole plan execution.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run_id: String,
    pub status: RunStatus,
    pub steps: Vec<StepOutcome>,
    pub total_steps: u32,
    pub counts: StepCounts,
    pub duration_ms: u64,
}

impl RunOutcome {
    /// Completed with every step succeeding.
    pub fn success(&self) -> bool {
        self.status == RunStatus::Completed
            && self.counts.failed == 0
            && self.counts.denied == 0
    }
}

/// Drives linear plans: policy gate, tool execution, audit record.
pub struct PlanRunner<'a> {
    store: &'a CapsuleStore,
    registry: &'a ToolRegistry,
    working_dir: PathBuf,
}

impl<'a> PlanRunner<'a> {
    pub fn new(store: &'a CapsuleStore, registry: &'a ToolRegistry, working_dir: PathBuf) -> Self {
        Self { store, registry, working_dir }
    }

    /// Execute `plan` under `policy`.
    ///
    /// Policy denials and tool errors are recorded outcomes, not `Err`;
    /// only storage failures and invalid plans propagate.
    pub fn run(
        &self,
        plan: &Plan,
        policy: &Policy,
        options: &RunOptions,
    ) -> CapsuleResult<RunOutcome> {
        plan.validate()?;

        let engine = PolicyEngine::new(policy.clone());
        let policy = Arc::new(policy.clone());
        let run_id = self.store.create_run(plan, &policy, RunMode::Run)?;
        let started = Instant::now();
        let deadline = started + Duration::from_secs(u64::from(policy.global_timeout_seconds));

        let mut counters = CallCounters::new();
        let mut counts = StepCounts::default();
        let mut steps = Vec::with_capacity(plan.steps.len());
        let mut timed_out = false;

        info!(run_id = %run_id, steps = plan.steps.len(), "plan run starting");

        for (step_index, step) in plan.steps.iter().enumerate() {
            let step_index = step_index as u32;
            if step_index == 0 {
                self.store.update_run_status(&run_id, RunStatus::Running, counts)?;
            }

            // The global deadline is checked between steps only; a call
            // already in flight is never interrupted.
            if Instant::now() >= deadline {
                warn!(run_id = %run_id, step_index, "global timeout reached, denying remaining steps");
                let decision = PolicyDecision::deny(
                    format!(
                        "global timeout exceeded after {:.1}s",
                        started.elapsed().as_secs_f64()
                    ),
                    "global_timeout_seconds",
                );
                let call_id =
                    self.store.record_call(&run_id, step_index, &step.tool, &step.args)?;
                let now = Utc::now();
                self.store.record_result(
                    &call_id,
                    &run_id,
                    CallStatus::Denied,
                    None,
                    None,
                    &decision,
                    now,
                    now,
                )?;
                steps.push(StepOutcome {
                    step_index,
                    tool_name: step.tool.clone(),
                    args: step.args.clone(),
                    status: CallStatus::Denied,
                    output: None,
                    error: None,
                    decision,
                    duration_ms: 0,
                });
                counts.denied += 1;
                timed_out = true;
                break;
            }

            let outcome = self.execute_step(
                &run_id,
                step_index,
                &step.tool,
                &step.args,
                &engine,
                &policy,
                &counters,
            )?;

            match outcome.status {
                CallStatus::Success => counts.completed += 1,
                CallStatus::Denied => counts.denied += 1,
                CallStatus::Error => counts.failed += 1,
            }
            if outcome.decision.allowed {
                counters.increment(&step.tool);
            }
            let halt = options.fail_fast && outcome.status != CallStatus::Success;
            steps.push(outcome);
            if halt {
                debug!(run_id = %run_id, step_index, "fail-fast halt");
                break;
            }
        }

        // Denied or failed steps do not fail the run itself: the plan was
        // executed as far as policy permitted. Only a fatal condition —
        // here, the global deadline — marks the run failed.
        let status = if timed_out { RunStatus::Failed } else { RunStatus::Completed };
        self.store.update_run_status(&run_id, status, counts)?;

        Ok(RunOutcome {
            run_id,
            status,
            steps,
            total_steps: plan.steps.len() as u32,
            counts,
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn execute_step(
        &self,
        run_id: &str,
        step_index: u32,
        tool_name: &str,
        args: &Map<String, Value>,
        engine: &PolicyEngine,
        policy: &Arc<Policy>,
        counters: &CallCounters,
    ) -> CapsuleResult<StepOutcome> {
        let call_id = self.store.record_call(run_id, step_index, tool_name, args)?;

        // Fail-closed: an engine failure becomes a denial, never an allow.
        let decision = engine
            .evaluate(tool_name, args, &self.working_dir, counters)
            .unwrap_or_else(|e| {
                PolicyDecision::deny(
                    format!("policy evaluation failed: {}", e),
                    "policy_eval_error",
                )
            });

        if !decision.allowed {
            let now = Utc::now();
            self.store.record_result(
                &call_id,
                run_id,
                CallStatus::Denied,
                None,
                None,
                &decision,
                now,
                now,
            )?;
            return Ok(StepOutcome {
                step_index,
                tool_name: tool_name.to_string(),
                args: args.clone(),
                status: CallStatus::Denied,
                output: None,
                error: None,
                decision,
                duration_ms: 0,
            });
        }

        let output = match self.registry.get(tool_name) {
            Some(tool) => {
                let ctx = ToolContext::new(run_id, Arc::clone(policy), self.working_dir.clone())
                    .with_pinned_addrs(decision.pinned_addrs.clone());
                let started_at = Utc::now();
                let output = tool.execute(args, &ctx);
                (started_at, Utc::now(), output)
            }
            None => {
                let now = Utc::now();
                (now, now, ToolOutput::fail(format!("tool not found: {}", tool_name)))
            }
        };
        let (started_at, ended_at, output) = output;
        let duration_ms = (ended_at - started_at).num_milliseconds().max(0) as u64;

        let status = if output.success { CallStatus::Success } else { CallStatus::Error };
        self.store.record_result(
            &call_id,
            run_id,
            status,
            output.data.as_ref(),
            output.error.as_deref(),
            &decision,
            started_at,
            ended_at,
        )?;

        Ok(StepOutcome {
            step_index,
            tool_name: tool_name.to_string(),
            args: args.clone(),
            status,
            output: output.data,
            error: output.error,
            decision,
            duration_ms,
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
