//! # capsule-core
//!
//! The orchestration layer of the Capsule runtime.
//!
//! Two orchestrators drive tool calls through the same gate sequence —
//! record the call, evaluate policy, execute on allow, record the result:
//!
//! - [`runner::PlanRunner`] executes static plans step by step.
//! - [`agent::AgentLoop`] runs a propose → evaluate → execute → learn
//!   cycle against any [`planner::Planner`].
//!
//! [`replay::ReplayEngine`] reproduces stored runs bit-exactly without
//! touching tools or policy, and [`report::build_report`] shapes a run
//! into the canonical JSON report. [`validation`] cross-checks agent
//! answers against the paths a run actually touched.

pub mod agent;
pub mod planner;
pub mod replay;
pub mod report;
pub mod runner;
pub mod validation;

pub use agent::{AgentConfig, AgentLoop, AgentOutcome, AgentStatus};
pub use planner::{Planner, PlannerError, PlannerState, PlannerTurn, Proposal, ScriptedPlanner};
pub use replay::{ReplayEngine, ReplayOutcome};
pub use report::build_report;
pub use runner::{PlanRunner, RunOptions, RunOutcome, StepOutcome};
pub use validation::{validate_answer, AnswerValidation};
