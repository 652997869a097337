//! Run metadata and planner proposal records.
//!
//! A `Run` is one execution of a plan (or one agent session) under a
//! policy. The run row stores the plan and policy verbatim so a replay can
//! be performed from the database alone.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Mode of execution for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Fresh execution of a static plan.
    Run,
    /// Reproduction of a prior run from stored artifacts.
    Replay,
    /// Planner-driven agent session.
    Agent,
}

impl RunMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Run => "run",
            Self::Replay => "replay",
            Self::Agent => "agent",
        }
    }
}

impl std::str::FromStr for RunMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "run" => Ok(Self::Run),
            "replay" => Ok(Self::Replay),
            "agent" => Ok(Self::Agent),
            other => Err(format!("unknown run mode '{}'", other)),
        }
    }
}

/// Overall status of a run.
///
/// Transitions are monotonic: `pending → running → {completed, failed}`.
/// A run left in `running` means the process crashed mid-run; readers
/// treat it as failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Whether `next` is a legal successor of `self`.
    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running)
                | (Self::Pending, Self::Completed)
                | (Self::Pending, Self::Failed)
                | (Self::Running, Self::Completed)
                | (Self::Running, Self::Failed)
        )
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown run status '{}'", other)),
        }
    }
}

/// Metadata about one execution run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub run_id: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// SHA-256 of the canonical plan JSON — the replay key.
    pub plan_hash: String,
    /// SHA-256 of the canonical policy JSON.
    pub policy_hash: String,
    pub mode: RunMode,
    pub status: RunStatus,
    pub total_steps: u32,
    pub completed_steps: u32,
    pub denied_steps: u32,
    pub failed_steps: u32,
}

/// Step counters reported back to the store when a run terminates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StepCounts {
    pub completed: u32,
    pub denied: u32,
    pub failed: u32,
}

/// What kind of output a planner produced on one iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalType {
    /// The planner proposed a tool call.
    ToolCall,
    /// The planner declared the task finished.
    Done,
}

impl ProposalType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ToolCall => "tool_call",
            Self::Done => "done",
        }
    }
}

impl std::str::FromStr for ProposalType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tool_call" => Ok(Self::ToolCall),
            "done" => Ok(Self::Done),
            other => Err(format!("unknown proposal type '{}'", other)),
        }
    }
}

/// One logged planner output, including malformed ones.
///
/// `raw_response` preserves the planner's bytes verbatim even when parsing
/// failed, so agent sessions can be audited end to end.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannerProposal {
    pub id: String,
    pub run_id: String,
    pub iteration: u32,
    pub proposal_type: ProposalType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    /// Canonical JSON of the proposed args, when a tool call was parsed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args_json: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    pub raw_response: String,
    pub created_at: DateTime<Utc>,
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_transitions_are_monotonic() {
        assert!(RunStatus::Pending.can_transition_to(RunStatus::Running));
        assert!(RunStatus::Running.can_transition_to(RunStatus::Completed));
        assert!(RunStatus::Running.can_transition_to(RunStatus::Failed));

        assert!(!RunStatus::Completed.can_transition_to(RunStatus::Running));
        assert!(!RunStatus::Failed.can_transition_to(RunStatus::Completed));
        assert!(!RunStatus::Running.can_transition_to(RunStatus::Pending));
    }

    #[test]
    fn mode_and_status_round_trip_through_strings() {
        for mode in [RunMode::Run, RunMode::Replay, RunMode::Agent] {
            assert_eq!(mode.as_str().parse::<RunMode>().unwrap(), mode);
        }
        for status in [
            RunStatus::Pending,
            RunStatus::Running,
            RunStatus::Completed,
            RunStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<RunStatus>().unwrap(), status);
        }
    }
}
