//! The agent orchestrator: a propose → evaluate → execute → learn loop.
//!
//! The planner is untrusted. Every proposal it makes — parseable or not —
//! is logged to the proposal table, and nothing executes until the Policy
//! Engine allows it. Denials are fed back as history so the planner can
//! route around them; repeated identical proposals terminate the loop.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use capsule_contracts::{
    canonical_json, hash_json, CallStatus, CapsuleResult, Plan, PlanStep, Policy, PolicyDecision,
    ProposalType, RunMode, RunStatus, StepCounts, ToolResult,
};
use capsule_policy::{CallCounters, PolicyEngine};
use capsule_store::CapsuleStore;
use capsule_tools::{ToolContext, ToolOutput, ToolRegistry};

use crate::planner::{HistoryEntry, Planner, PlannerError, PlannerState, Proposal};

/// Tuning knobs for the agent loop.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Hard cap on iterations.
    pub max_iterations: u32,
    /// Identical consecutive proposals that trigger termination.
    pub repetition_threshold: u32,
    /// History entries kept when building planner state.
    pub max_history_items: usize,
    /// Serialized-history character budget; oldest entries drop first.
    pub max_history_chars: usize,
    /// Optional per-iteration budget. Checked cooperatively after the
    /// planner and tool calls return; a call in flight is not interrupted.
    pub iteration_timeout_seconds: Option<u32>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_iterations: 20,
            repetition_threshold: 3,
            max_history_items: 10,
            max_history_chars: 8000,
            iteration_timeout_seconds: None,
        }
    }
}

/// How an agent session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentStatus {
    /// The planner returned Done.
    Completed,
    /// The iteration cap was reached.
    MaxIterations,
    /// The global (or iteration) deadline was exceeded.
    Timeout,
    /// The planner proposed the same call too many times in a row.
    RepetitionDetected,
    /// An internal error stopped the loop.
    Error,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::MaxIterations => "max_iterations",
            Self::Timeout => "timeout",
            Self::RepetitionDetected => "repetition_detected",
            Self::Error => "error",
        }
    }
}

/// What happened on one loop iteration.
#[derive(Debug, Clone)]
pub struct IterationRecord {
    pub iteration: u32,
    pub tool_name: Option<String>,
    pub status: Option<CallStatus>,
    pub decision: Option<PolicyDecision>,
    pub error: Option<String>,
}

/// Final result of one agent session.
#[derive(Debug, Clone)]
pub struct AgentOutcome {
    pub run_id: String,
    pub task: String,
    pub status: AgentStatus,
    pub iterations: Vec<IterationRecord>,
    pub final_output: Option<Value>,
    pub error_message: Option<String>,
    pub counts: StepCounts,
    /// Paths the filesystem tools actually touched, for answer validation.
    pub accessed_paths: Vec<String>,
    pub duration_ms: u64,
}

/// Drives a planner through the policy-gated loop.
pub struct AgentLoop<'a> {
    store: &'a CapsuleStore,
    registry: &'a ToolRegistry,
    engine: PolicyEngine,
    policy: Arc<Policy>,
    working_dir: PathBuf,
    config: AgentConfig,
}

impl<'a> AgentLoop<'a> {
    pub fn new(
        store: &'a CapsuleStore,
        registry: &'a ToolRegistry,
        policy: Policy,
        working_dir: PathBuf,
        config: AgentConfig,
    ) -> Self {
        let engine = PolicyEngine::new(policy.clone());
        Self { store, registry, engine, policy: Arc::new(policy), working_dir, config }
    }

    /// Run `task` to completion (or any of the other terminal statuses).
    pub fn run(&self, planner: &mut dyn Planner, task: &str) -> CapsuleResult<AgentOutcome> {
        // Agent sessions have no static plan; a single-step marker plan
        // keeps the run row's plan fields meaningful for audit and replay.
        let mut marker_args = Map::new();
        marker_args.insert("task".to_string(), Value::String(task.to_string()));
        let plan = Plan {
            version: "1.0".to_string(),
            name: Some("agent session".to_string()),
            description: None,
            steps: vec![PlanStep { tool: "agent.dynamic".to_string(), args: marker_args, name: None }],
        };

        let run_id = self.store.create_run(&plan, &self.policy, RunMode::Agent)?;
        self.store.update_run_status(&run_id, RunStatus::Running, StepCounts::default())?;
        info!(run_id = %run_id, planner = planner.name(), "agent session starting");

        let started = Instant::now();
        let deadline =
            started + Duration::from_secs(u64::from(self.policy.global_timeout_seconds));
        let tool_schemas = self.registry.schemas();
        let policy_summary = self.policy.summary();

        let mut outcome = AgentOutcome {
            run_id: run_id.clone(),
            task: task.to_string(),
            status: AgentStatus::MaxIterations,
            iterations: Vec::new(),
            final_output: None,
            error_message: None,
            counts: StepCounts::default(),
            accessed_paths: Vec::new(),
            duration_ms: 0,
        };

        let mut counters = CallCounters::new();
        let mut history: Vec<HistoryEntry> = Vec::new();
        let mut proposal_keys: Vec<String> = Vec::new();
        let mut last_result: Option<ToolResult> = None;

        for iteration in 0..self.config.max_iterations {
            if Instant::now() >= deadline {
                outcome.status = AgentStatus::Timeout;
                break;
            }
            let iteration_started = Instant::now();

            let state = PlannerState {
                task: task.to_string(),
                tool_schemas: tool_schemas.clone(),
                policy_summary: policy_summary.clone(),
                history: self.truncate_history(&history),
                iteration,
            };

            let turn = match planner.propose_next(&state, last_result.as_ref()) {
                Ok(turn) => turn,
                Err(PlannerError::Parse { raw, message }) => {
                    // Even garbage is logged: the raw bytes are the audit
                    // trail for what the planner actually said.
                    self.store.record_proposal(
                        &run_id,
                        iteration,
                        ProposalType::ToolCall,
                        None,
                        None,
                        None,
                        &raw,
                    )?;
                    outcome.status = AgentStatus::Error;
                    outcome.error_message =
                        Some(format!("planner output unparseable: {}", message));
                    break;
                }
                Err(PlannerError::Backend { message }) => {
                    outcome.status = AgentStatus::Error;
                    outcome.error_message = Some(format!("planner backend failed: {}", message));
                    break;
                }
            };

            let (tool_name, args) = match turn.proposal {
                Proposal::Done { final_output, reason } => {
                    self.store.record_proposal(
                        &run_id,
                        iteration,
                        ProposalType::Done,
                        None,
                        None,
                        turn.reasoning.as_deref(),
                        &turn.raw_response,
                    )?;
                    debug!(run_id = %run_id, iteration, reason = %reason, "planner done");
                    outcome.status = AgentStatus::Completed;
                    outcome.final_output = final_output;
                    break;
                }
                Proposal::Call { tool, args } => {
                    let args_json = canonical_json(&Value::Object(args.clone()));
                    self.store.record_proposal(
                        &run_id,
                        iteration,
                        ProposalType::ToolCall,
                        Some(&tool),
                        Some(&args_json),
                        turn.reasoning.as_deref(),
                        &turn.raw_response,
                    )?;
                    proposal_keys.push(format!("{}\u{0}{}", tool, args_json));
                    (tool, args)
                }
            };

            if self.repetition_hit(&proposal_keys) {
                warn!(run_id = %run_id, iteration, tool = %tool_name, "repetition detected");
                outcome.status = AgentStatus::RepetitionDetected;
                outcome.iterations.push(IterationRecord {
                    iteration,
                    tool_name: Some(tool_name),
                    status: None,
                    decision: None,
                    error: None,
                });
                break;
            }

            let record =
                self.run_call(&run_id, iteration, &tool_name, &args, &mut counters, &mut history)?;
            match record.status {
                Some(CallStatus::Success) => outcome.counts.completed += 1,
                Some(CallStatus::Denied) => outcome.counts.denied += 1,
                Some(CallStatus::Error) => outcome.counts.failed += 1,
                None => {}
            }
            if matches!(record.status, Some(CallStatus::Success | CallStatus::Error))
                && tool_name.starts_with("fs.")
            {
                if let Some(Value::String(path)) = args.get("path") {
                    outcome.accessed_paths.push(path.clone());
                }
            }
            last_result = self.store.get_results(&run_id)?.into_iter().rev().next();
            outcome.iterations.push(record);

            if let Some(limit) = self.config.iteration_timeout_seconds {
                if iteration_started.elapsed() >= Duration::from_secs(u64::from(limit)) {
                    outcome.status = AgentStatus::Timeout;
                    break;
                }
            }
        }

        outcome.duration_ms = started.elapsed().as_millis() as u64;

        // Everything except an internal error counts as a finished
        // session for the run record; the agent status keeps the detail.
        let run_status = match outcome.status {
            AgentStatus::Error => RunStatus::Failed,
            _ => RunStatus::Completed,
        };
        self.store.update_run_status(&run_id, run_status, outcome.counts)?;
        info!(
            run_id = %run_id,
            status = outcome.status.as_str(),
            iterations = outcome.iterations.len(),
            "agent session finished"
        );

        Ok(outcome)
    }

    /// Evaluate and (on allow) execute one proposed call, recording both
    /// sides in the store and appending a history entry.
    fn run_call(
        &self,
        run_id: &str,
        iteration: u32,
        tool_name: &str,
        args: &Map<String, Value>,
        counters: &mut CallCounters,
        history: &mut Vec<HistoryEntry>,
    ) -> CapsuleResult<IterationRecord> {
        let call_id = self.store.record_call(run_id, iteration, tool_name, args)?;
        let decision = self
            .engine
            .evaluate(tool_name, args, &self.working_dir, counters)
            .unwrap_or_else(|e| {
                PolicyDecision::deny(
                    format!("policy evaluation failed: {}", e),
                    "policy_eval_error",
                )
            });

        if !decision.allowed {
            let now = Utc::now();
            let error = format!("denied by policy: {}", decision.reason);
            self.store.record_result(
                &call_id,
                run_id,
                CallStatus::Denied,
                None,
                Some(error.as_str()),
                &decision,
                now,
                now,
            )?;
            history.push(HistoryEntry {
                tool_name: tool_name.to_string(),
                status: CallStatus::Denied,
                summary: format!("{} denied: {}", tool_name, decision.reason),
            });
            return Ok(IterationRecord {
                iteration,
                tool_name: Some(tool_name.to_string()),
                status: Some(CallStatus::Denied),
                decision: Some(decision),
                error: Some(error),
            });
        }

        let (started_at, ended_at, output) = match self.registry.get(tool_name) {
            Some(tool) => {
                let ctx = ToolContext::new(
                    run_id,
                    Arc::clone(&self.policy),
                    self.working_dir.clone(),
                )
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
        counters.increment(tool_name);

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

        let input_prefix = {
            let hash = hash_json(&Value::Object(args.clone()));
            hash[..8].to_string()
        };
        let summary = match status {
            CallStatus::Success => format!(
                "{} [{}] success: {}",
                tool_name,
                input_prefix,
                excerpt(output.data.as_ref(), 120)
            ),
            _ => format!(
                "{} [{}] error: {}",
                tool_name,
                input_prefix,
                output.error.as_deref().unwrap_or("unknown")
            ),
        };
        history.push(HistoryEntry { tool_name: tool_name.to_string(), status, summary });

        Ok(IterationRecord {
            iteration,
            tool_name: Some(tool_name.to_string()),
            status: Some(status),
            decision: Some(decision),
            error: output.error,
        })
    }

    /// Oldest-first truncation: keep at most `max_history_items` entries
    /// and at most `max_history_chars` serialized characters.
    fn truncate_history(&self, history: &[HistoryEntry]) -> Vec<HistoryEntry> {
        let tail_start = history.len().saturating_sub(self.config.max_history_items);
        let mut kept: Vec<HistoryEntry> = Vec::new();
        let mut chars = 0;
        for entry in history[tail_start..].iter().rev() {
            chars += entry.chars();
            if chars > self.config.max_history_chars && !kept.is_empty() {
                break;
            }
            kept.push(entry.clone());
        }
        kept.reverse();
        kept
    }

    fn repetition_hit(&self, proposal_keys: &[String]) -> bool {
        let n = self.config.repetition_threshold as usize;
        if n == 0 || proposal_keys.len() < n {
            return false;
        }
        let tail = &proposal_keys[proposal_keys.len() - n..];
        tail.windows(2).all(|pair| pair[0] == pair[1])
    }
}

/// A short, single-line excerpt of a JSON value.
fn excerpt(value: Option<&Value>, limit: usize) -> String {
    let Some(value) = value else {
        return String::new();
    };
    let text = value.to_string().replace('\n', " ");
    if text.len() > limit {
        let cut = text
            .char_indices()
            .take_while(|(i, _)| *i < limit)
            .last()
            .map(|(i, c)| i + c.len_utf8())
            .unwrap_or(0);
        format!("{}...", &text[..cut])
    } else {
        text
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::json;

    use capsule_contracts::Policy;
    use capsule_tools::default_registry;

    use crate::planner::{PlannerTurn, ScriptedPlanner};

    use super::*;

    // Non-dotted prefix so the workspace itself passes the hidden-file rule.
    fn workspace() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::Builder::new().prefix("capsule-test-").tempdir().unwrap();
        let root = std::fs::canonicalize(dir.path()).unwrap();
        (dir, root)
    }

    fn read_policy() -> Policy {
        Policy::from_yaml("tools:\n  fs.read:\n    allow_paths: [\"./**\"]\n").unwrap()
    }

    fn call_args(value: serde_json::Value) -> Map<String, Value> {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn scripted_session_reads_then_completes() {
        let (_dir, root) = workspace();
        std::fs::write(root.join("data.txt"), "payload").unwrap();
        let store = CapsuleStore::open_in_memory().unwrap();
        let registry = default_registry();
        let agent =
            AgentLoop::new(&store, &registry, read_policy(), root, AgentConfig::default());

        let mut planner = ScriptedPlanner::new(
            vec![("fs.read".to_string(), call_args(json!({"path": "./data.txt"})))],
            Some(json!({"summary": "read one file"})),
        );
        let outcome = agent.run(&mut planner, "read the data file").unwrap();

        assert_eq!(outcome.status, AgentStatus::Completed);
        assert_eq!(outcome.counts.completed, 1);
        assert_eq!(outcome.final_output, Some(json!({"summary": "read one file"})));
        assert_eq!(outcome.accessed_paths, vec!["./data.txt"]);

        // Both the call and the proposal trail landed in the store.
        let run = store.get_run(&outcome.run_id).unwrap().unwrap();
        assert_eq!(run.mode, RunMode::Agent);
        assert_eq!(run.status, RunStatus::Completed);
        let proposals = store.get_proposals(&outcome.run_id).unwrap();
        assert_eq!(proposals.len(), 2);
        assert_eq!(proposals[0].proposal_type, ProposalType::ToolCall);
        assert_eq!(proposals[1].proposal_type, ProposalType::Done);
    }

    #[test]
    fn denied_proposal_is_fed_back_and_loop_continues() {
        let (_dir, root) = workspace();
        std::fs::write(root.join("open.txt"), "ok").unwrap();
        std::fs::write(root.join(".secret"), "no").unwrap();
        let store = CapsuleStore::open_in_memory().unwrap();
        let registry = default_registry();
        let agent =
            AgentLoop::new(&store, &registry, read_policy(), root, AgentConfig::default());

        let mut planner = ScriptedPlanner::new(
            vec![
                ("fs.read".to_string(), call_args(json!({"path": "./.secret"}))),
                ("fs.read".to_string(), call_args(json!({"path": "./open.txt"}))),
            ],
            None,
        );
        let outcome = agent.run(&mut planner, "poke around").unwrap();

        assert_eq!(outcome.status, AgentStatus::Completed);
        assert_eq!(outcome.counts.denied, 1);
        assert_eq!(outcome.counts.completed, 1);
        // The denial never reached the filesystem tool's accessed set.
        assert_eq!(outcome.accessed_paths, vec!["./open.txt"]);
        assert_eq!(outcome.iterations[0].status, Some(CallStatus::Denied));
    }

    /// A planner that proposes the same call forever.
    struct StuckPlanner;

    impl Planner for StuckPlanner {
        fn name(&self) -> &str {
            "stuck"
        }

        fn propose_next(
            &mut self,
            _state: &PlannerState,
            _last: Option<&ToolResult>,
        ) -> Result<PlannerTurn, PlannerError> {
            Ok(PlannerTurn {
                proposal: Proposal::Call {
                    tool: "fs.read".to_string(),
                    args: serde_json::json!({"path": "./same.txt"})
                        .as_object()
                        .unwrap()
                        .clone(),
                },
                raw_response: r#"{"tool":"fs.read","args":{"path":"./same.txt"}}"#.to_string(),
                reasoning: None,
            })
        }
    }

    #[test]
    fn repetition_terminates_before_the_third_execution() {
        let (_dir, root) = workspace();
        std::fs::write(root.join("same.txt"), "loop").unwrap();
        let store = CapsuleStore::open_in_memory().unwrap();
        let registry = default_registry();
        let agent =
            AgentLoop::new(&store, &registry, read_policy(), root, AgentConfig::default());

        let outcome = agent.run(&mut StuckPlanner, "spin forever").unwrap();
        assert_eq!(outcome.status, AgentStatus::RepetitionDetected);
        // Threshold 3: two executions, the third identical proposal stops.
        assert_eq!(outcome.counts.completed, 2);
        assert_eq!(store.get_calls(&outcome.run_id).unwrap().len(), 2);
    }

    #[test]
    fn max_iterations_caps_the_session() {
        let (_dir, root) = workspace();
        std::fs::write(root.join("a.txt"), "x").unwrap();
        std::fs::write(root.join("b.txt"), "y").unwrap();
        let store = CapsuleStore::open_in_memory().unwrap();
        let registry = default_registry();
        let config = AgentConfig { max_iterations: 2, ..AgentConfig::default() };
        let agent = AgentLoop::new(&store, &registry, read_policy(), root, config);

        // Alternating proposals so repetition detection stays quiet.
        let mut planner = ScriptedPlanner::new(
            vec![
                ("fs.read".to_string(), call_args(json!({"path": "./a.txt"}))),
                ("fs.read".to_string(), call_args(json!({"path": "./b.txt"}))),
                ("fs.read".to_string(), call_args(json!({"path": "./a.txt"}))),
            ],
            None,
        );
        let outcome = agent.run(&mut planner, "never finish").unwrap();
        assert_eq!(outcome.status, AgentStatus::MaxIterations);
        assert_eq!(outcome.iterations.len(), 2);
    }

    /// A planner that emits unparseable output.
    struct GarbagePlanner;

    impl Planner for GarbagePlanner {
        fn name(&self) -> &str {
            "garbage"
        }

        fn propose_next(
            &mut self,
            _state: &PlannerState,
            _last: Option<&ToolResult>,
        ) -> Result<PlannerTurn, PlannerError> {
            Err(PlannerError::Parse {
                raw: "here is {not json at all".to_string(),
                message: "expected value at line 1".to_string(),
            })
        }
    }

    #[test]
    fn unparseable_planner_output_is_logged_raw_and_fails_the_session() {
        let (_dir, root) = workspace();
        let store = CapsuleStore::open_in_memory().unwrap();
        let registry = default_registry();
        let agent =
            AgentLoop::new(&store, &registry, read_policy(), root, AgentConfig::default());

        let outcome = agent.run(&mut GarbagePlanner, "do something").unwrap();
        assert_eq!(outcome.status, AgentStatus::Error);
        assert!(outcome.error_message.unwrap().contains("unparseable"));

        let proposals = store.get_proposals(&outcome.run_id).unwrap();
        assert_eq!(proposals.len(), 1);
        assert_eq!(proposals[0].raw_response, "here is {not json at all");

        let run = store.get_run(&outcome.run_id).unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Failed);
    }

    #[test]
    fn history_truncation_respects_item_and_char_budgets() {
        let (_dir, root) = workspace();
        let store = CapsuleStore::open_in_memory().unwrap();
        let registry = default_registry();
        let config = AgentConfig {
            max_history_items: 3,
            max_history_chars: 10_000,
            ..AgentConfig::default()
        };
        let agent = AgentLoop::new(&store, &registry, read_policy(), root, config);

        let history: Vec<HistoryEntry> = (0..10)
            .map(|i| HistoryEntry {
                tool_name: "fs.read".to_string(),
                status: CallStatus::Success,
                summary: format!("entry {}", i),
            })
            .collect();
        let kept = agent.truncate_history(&history);
        assert_eq!(kept.len(), 3);
        assert_eq!(kept[0].summary, "entry 7", "oldest entries drop first");
        assert_eq!(kept[2].summary, "entry 9");

        let config = AgentConfig {
            max_history_items: 10,
            max_history_chars: 30,
            ..AgentConfig::default()
        };
        let store2 = CapsuleStore::open_in_memory().unwrap();
        let (_dir2, root2) = workspace();
        let agent = AgentLoop::new(&store2, &registry, read_policy(), root2, config);
        let kept = agent.truncate_history(&history);
        assert!(kept.len() < 10);
        assert_eq!(kept.last().unwrap().summary, "entry 9", "newest entry always survives");
    }

    #[test]
    fn excerpt_truncates_long_values() {
        assert_eq!(excerpt(Some(&json!("short")), 120), "\"short\"");
        let long = json!("x".repeat(500));
        let cut = excerpt(Some(&long), 50);
        assert!(cut.len() <= 54);
        assert!(cut.ends_with("..."));
        assert_eq!(excerpt(None, 120), "");
    }
}
