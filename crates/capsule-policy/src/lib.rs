//! # capsule-policy
//!
//! The deny-by-default policy engine for the Capsule runtime.
//!
//! Every proposed tool call passes through [`PolicyEngine::evaluate`]
//! before anything executes. Evaluation is deterministic, side-effect free
//! apart from filesystem metadata and DNS lookups, and fail-closed: any
//! internal failure is converted by the orchestrator into a denial.
//!
//! ## Rule families
//!
//! - **Filesystem** (`fs.read`, `fs.write`): canonical-path glob
//!   allow/deny lists with dotfile and symlink-escape protection
//!   ([`paths`]).
//! - **Network** (`http.get`): scheme and domain allowlists, blocked
//!   private/reserved address ranges, and DNS pinning via an injectable
//!   [`net::Resolver`].
//! - **Shell** (`shell.run`): argv-only commands, executable allowlists,
//!   denied-token scans.
//! - **Quota**: per-tool executed-call budgets via [`CallCounters`].

pub mod engine;
pub mod net;
pub mod paths;

pub use engine::{
    evaluate_fs, evaluate_http, evaluate_shell, fs_lexically_allowed, CallCounters, FsOperation,
    PolicyEngine,
};
pub use net::{domain_matches, is_blocked_ip, Resolver, SystemResolver};
pub use paths::{canonicalize_existing, canonicalize_for_write, PathPattern};
