//! The planner abstraction for agent mode.
//!
//! A planner is anything that implements [`Planner::propose_next`]: a
//! scripted list, a human, or a language model. The agent loop treats all
//! of them identically — every proposal is untrusted and goes through the
//! Policy Engine before anything executes. Network calls, prompting, JSON
//! repair, retries: all internal to the planner implementation, invisible
//! to the loop.

use std::path::Path;

use serde::Deserialize;
use serde_json::{Map, Value};

use capsule_contracts::{CallStatus, CapsuleError, CapsuleResult, ToolResult};

/// What a planner wants to do next.
#[derive(Debug, Clone, PartialEq)]
pub enum Proposal {
    /// Execute a tool with the given arguments.
    Call { tool: String, args: Map<String, Value> },
    /// The task is finished (or cannot proceed).
    Done { final_output: Option<Value>, reason: String },
}

/// One planner output: the parsed proposal plus the raw bytes it came
/// from, preserved for the audit log.
#[derive(Debug, Clone)]
pub struct PlannerTurn {
    pub proposal: Proposal,
    pub raw_response: String,
    pub reasoning: Option<String>,
}

/// Planner failures the loop can distinguish.
#[derive(Debug)]
pub enum PlannerError {
    /// The planner produced output that could not be parsed into a
    /// proposal. `raw` preserves the bytes for the proposal log.
    Parse { raw: String, message: String },
    /// The planner backend itself failed (connection, timeout, ...).
    Backend { message: String },
}

impl std::fmt::Display for PlannerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Parse { message, .. } => write!(f, "planner output unparseable: {}", message),
            Self::Backend { message } => write!(f, "planner backend failed: {}", message),
        }
    }
}

/// A compact record of one prior iteration, fed back to the planner.
#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub tool_name: String,
    pub status: CallStatus,
    /// Tool name, input-hash prefix, status, and a short output excerpt
    /// or the denial reason.
    pub summary: String,
}

impl HistoryEntry {
    /// Approximate serialized size, used for the history char budget.
    pub fn chars(&self) -> usize {
        self.tool_name.len() + self.summary.len()
    }
}

/// Everything a planner gets to see when proposing the next step.
#[derive(Debug, Clone)]
pub struct PlannerState {
    /// The original user task.
    pub task: String,
    /// Argument descriptors for every registered tool.
    pub tool_schemas: Vec<Value>,
    /// Human-readable summary of what the policy permits.
    pub policy_summary: String,
    /// Prior iterations, oldest first, truncated by the loop.
    pub history: Vec<HistoryEntry>,
    /// Current iteration number (0-indexed).
    pub iteration: u32,
}

/// A proposer of tool calls.
///
/// Implementations must be side-effect free beyond their own I/O and
/// idempotent with respect to `state`.
pub trait Planner: Send {
    /// Name used in logs and run records.
    fn name(&self) -> &str;

    /// Propose the next tool call or signal completion.
    fn propose_next(
        &mut self,
        state: &PlannerState,
        last_result: Option<&ToolResult>,
    ) -> Result<PlannerTurn, PlannerError>;
}

// ── Scripted planner ──────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ScriptFile {
    steps: Vec<ScriptStep>,
    #[serde(default)]
    final_output: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ScriptStep {
    tool: String,
    #[serde(default)]
    args: Map<String, Value>,
}

/// A deterministic planner that replays a fixed list of proposals and
/// then declares itself done.
///
/// Useful for offline agent runs and for exercising the loop in tests
/// without any model in the picture.
pub struct ScriptedPlanner {
    steps: Vec<(String, Map<String, Value>)>,
    final_output: Option<Value>,
    cursor: usize,
}

impl ScriptedPlanner {
    pub fn new(steps: Vec<(String, Map<String, Value>)>, final_output: Option<Value>) -> Self {
        Self { steps, final_output, cursor: 0 }
    }

    /// Load a script from a JSON file:
    /// `{"steps": [{"tool": "fs.read", "args": {...}}, ...], "final_output": ...}`.
    pub fn from_file(path: &Path) -> CapsuleResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| CapsuleError::PlanValidation {
            reason: format!("failed to read planner script '{}': {}", path.display(), e),
        })?;
        let script: ScriptFile =
            serde_json::from_str(&content).map_err(|e| CapsuleError::PlanValidation {
                reason: format!("failed to parse planner script '{}': {}", path.display(), e),
            })?;
        Ok(Self::new(
            script.steps.into_iter().map(|s| (s.tool, s.args)).collect(),
            script.final_output,
        ))
    }
}

impl Planner for ScriptedPlanner {
    fn name(&self) -> &str {
        "scripted"
    }

    fn propose_next(
        &mut self,
        _state: &PlannerState,
        _last_result: Option<&ToolResult>,
    ) -> Result<PlannerTurn, PlannerError> {
        if self.cursor >= self.steps.len() {
            return Ok(PlannerTurn {
                proposal: Proposal::Done {
                    final_output: self.final_output.clone(),
                    reason: "script exhausted".to_string(),
                },
                raw_response: "done".to_string(),
                reasoning: None,
            });
        }
        let (tool, args) = self.steps[self.cursor].clone();
        self.cursor += 1;
        let raw = serde_json::json!({"tool": tool, "args": Value::Object(args.clone())});
        Ok(PlannerTurn {
            proposal: Proposal::Call { tool, args },
            raw_response: raw.to_string(),
            reasoning: None,
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn empty_state() -> PlannerState {
        PlannerState {
            task: "read the readme".to_string(),
            tool_schemas: Vec::new(),
            policy_summary: String::new(),
            history: Vec::new(),
            iteration: 0,
        }
    }

    #[test]
    fn scripted_planner_walks_steps_then_finishes() {
        let args = json!({"path": "./a"}).as_object().unwrap().clone();
        let mut planner =
            ScriptedPlanner::new(vec![("fs.read".to_string(), args)], Some(json!("all read")));

        match planner.propose_next(&empty_state(), None).unwrap().proposal {
            Proposal::Call { tool, args } => {
                assert_eq!(tool, "fs.read");
                assert_eq!(args["path"], "./a");
            }
            other => panic!("expected Call, got {:?}", other),
        }
        match planner.propose_next(&empty_state(), None).unwrap().proposal {
            Proposal::Done { final_output, reason } => {
                assert_eq!(final_output, Some(json!("all read")));
                assert_eq!(reason, "script exhausted");
            }
            other => panic!("expected Done, got {:?}", other),
        }
    }

    #[test]
    fn script_file_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("script.json");
        std::fs::write(
            &path,
            r#"{"steps": [{"tool": "shell.run", "args": {"cmd": ["echo", "hi"]}}], "final_output": {"ok": true}}"#,
        )
        .unwrap();

        let mut planner = ScriptedPlanner::from_file(&path).unwrap();
        match planner.propose_next(&empty_state(), None).unwrap().proposal {
            Proposal::Call { tool, .. } => assert_eq!(tool, "shell.run"),
            other => panic!("expected Call, got {:?}", other),
        }
    }

    #[test]
    fn malformed_script_files_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("script.json");
        std::fs::write(&path, r#"{"steps": [{"tool": "x"}], "surprise": 1}"#).unwrap();
        assert!(ScriptedPlanner::from_file(&path).is_err());
    }
}
