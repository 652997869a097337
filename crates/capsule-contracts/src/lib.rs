//! # capsule-contracts
//!
//! Shared types, schemas, and canonical serialization for the Capsule
//! runtime.
//!
//! All crates in the workspace import from here. No business logic lives in
//! this crate — only data definitions, the canonical JSON serializer the
//! hash scheme depends on, and the unified error type.

pub mod call;
pub mod canonical;
pub mod error;
pub mod plan;
pub mod policy;
pub mod run;

pub use call::{CallStatus, PolicyDecision, ToolCall, ToolResult};
pub use canonical::{canonical_json, hash_bytes, hash_json, hash_optional, to_canonical_json};
pub use error::{CapsuleError, CapsuleResult};
pub use plan::{Plan, PlanStep};
pub use policy::{FsPolicy, HttpPolicy, Policy, PolicyBoundary, ShellPolicy, ToolPolicies};
pub use run::{PlannerProposal, ProposalType, Run, RunMode, RunStatus, StepCounts};
