//! Runtime error types for the Capsule execution pipeline.
//!
//! All fallible operations in Capsule return `CapsuleResult<T>`. Variants
//! map to the numeric taxonomy surfaced at the CLI boundary: 1xxx policy,
//! 2xxx tool, 3xxx plan validation, 4xxx replay, 5xxx storage. Only
//! `Storage` and `PlanValidation` propagate to the CLI; everything else is
//! converted to a recorded `ToolResult` by the orchestrators.

use thiserror::Error;

/// The unified error type for the Capsule runtime.
#[derive(Debug, Error)]
pub enum CapsuleError {
    /// A policy rule denied the proposed call.
    ///
    /// Never surfaced as a process failure — orchestrators convert this to
    /// a `denied` result.
    #[error("policy denied call: {reason}")]
    PolicyDenied {
        reason: String,
        /// The policy clause that decided the outcome, when known.
        rule_hit: Option<String>,
    },

    /// Policy evaluation itself failed (fail-closed: treated as a denial).
    #[error("policy evaluation failed: {reason}")]
    PolicyEval { reason: String },

    /// A tool rejected its arguments or failed during I/O.
    #[error("tool '{tool}' failed: {reason}")]
    Tool { tool: String, reason: String },

    /// A plan failed structural validation before a run was created.
    #[error("invalid plan: {reason}")]
    PlanValidation { reason: String },

    /// Replay could not reproduce the origin run.
    #[error("replay failed: {reason}")]
    Replay { reason: String },

    /// An origin run (or its stored plan/policy) is missing from the store.
    #[error("run '{run_id}' not found")]
    RunNotFound { run_id: String },

    /// The audit database could not be read or written.
    ///
    /// Fatal — a call that cannot be audited cannot proceed.
    #[error("storage error during {operation}: {reason}")]
    Storage { operation: String, reason: String },
}

impl CapsuleError {
    /// Numeric error code for this variant's taxonomy class.
    ///
    /// Code ranges are stable across releases; message strings are not.
    pub fn code(&self) -> u16 {
        match self {
            Self::PolicyDenied { .. } => 1000,
            Self::PolicyEval { .. } => 1001,
            Self::Tool { .. } => 2000,
            Self::PlanValidation { .. } => 3000,
            Self::Replay { .. } => 4000,
            Self::RunNotFound { .. } => 4001,
            Self::Storage { .. } => 5000,
        }
    }

    /// Shorthand for a storage error with an operation label.
    pub fn storage(operation: impl Into<String>, reason: impl ToString) -> Self {
        Self::Storage {
            operation: operation.into(),
            reason: reason.to_string(),
        }
    }
}

/// Convenience alias used throughout the Capsule crates.
pub type CapsuleResult<T> = Result<T, CapsuleError>;
