//! # capsule-tools
//!
//! Tool contracts and the four built-in tools of the Capsule runtime:
//! `fs.read`, `fs.write`, `http.get`, and `shell.run`.
//!
//! Tools run only after the Policy Engine has approved the call. They are
//! not a second policy layer — each performs just the mechanical
//! post-checks the policy cannot (file size at open time, connecting to
//! the pinned address, bounding subprocess output) and validates its own
//! arguments against its published schema.
//!
//! Tools present a synchronous [`Tool::execute`] boundary to the
//! orchestrator: expected failures come back as `ToolOutput::fail`, never
//! as panics. Timestamps and identifiers belong to the store, not to
//! tools, so outputs stay deterministic enough to hash.

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

use serde_json::{Map, Value};

use capsule_contracts::Policy;

pub mod fs;
pub mod http;
pub mod registry;
pub mod shell;

pub use fs::{FsReadTool, FsWriteTool};
pub use http::HttpGetTool;
pub use registry::{default_registry, ToolRegistry};
pub use shell::ShellRunTool;

/// Standardized output from tool execution.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutput {
    /// Whether the tool executed successfully.
    pub success: bool,
    /// The output data, present on success.
    pub data: Option<Value>,
    /// Error message, present on failure.
    pub error: Option<String>,
}

impl ToolOutput {
    /// Create a successful output.
    pub fn ok(data: Value) -> Self {
        Self { success: true, data: Some(data), error: None }
    }

    /// Create a failed output.
    pub fn fail(error: impl Into<String>) -> Self {
        Self { success: false, data: None, error: Some(error.into()) }
    }
}

/// Runtime context passed to every tool execution.
#[derive(Debug, Clone)]
pub struct ToolContext {
    /// The run this call belongs to.
    pub run_id: String,
    /// The policy in force, for mechanical post-checks only.
    pub policy: Arc<Policy>,
    /// Working directory for resolving relative paths.
    pub working_dir: PathBuf,
    /// Addresses the Policy Engine resolved and vetted for `http.get`.
    /// The tool connects to exactly these; it never re-resolves.
    pub pinned_addrs: Vec<IpAddr>,
}

impl ToolContext {
    pub fn new(run_id: impl Into<String>, policy: Arc<Policy>, working_dir: PathBuf) -> Self {
        Self { run_id: run_id.into(), policy, working_dir, pinned_addrs: Vec::new() }
    }

    pub fn with_pinned_addrs(mut self, addrs: Vec<IpAddr>) -> Self {
        self.pinned_addrs = addrs;
        self
    }
}

/// A named tool the orchestrator can execute.
///
/// Implementations are looked up by name in the [`ToolRegistry`]. The
/// `schema()` descriptor feeds planners and reports; `execute()` assumes
/// policy approval already happened.
pub trait Tool: Send + Sync {
    /// Unique dotted identifier (e.g. `fs.read`).
    fn name(&self) -> &'static str;

    /// Human-readable description of what the tool does.
    fn description(&self) -> &'static str;

    /// JSON descriptor of the accepted arguments.
    fn schema(&self) -> Value;

    /// Execute the tool with the given arguments.
    ///
    /// Expected failures (bad arguments, missing files, timeouts) return
    /// `ToolOutput::fail` with a descriptive message.
    fn execute(&self, args: &Map<String, Value>, ctx: &ToolContext) -> ToolOutput;
}

// ── Shared argument helpers ───────────────────────────────────────────────────

/// Pull a required string argument, or the validation error to report.
pub(crate) fn require_string<'a>(
    args: &'a Map<String, Value>,
    key: &str,
) -> Result<&'a str, String> {
    match args.get(key) {
        Some(Value::String(s)) if !s.trim().is_empty() => Ok(s),
        Some(Value::String(_)) => Err(format!("'{}' cannot be empty", key)),
        Some(_) => Err(format!("'{}' must be a string", key)),
        None => Err(format!("'{}' is required", key)),
    }
}

/// Pull an optional string argument.
pub(crate) fn optional_string<'a>(
    args: &'a Map<String, Value>,
    key: &str,
) -> Result<Option<&'a str>, String> {
    match args.get(key) {
        None => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(_) => Err(format!("'{}' must be a string", key)),
    }
}

/// Pull an optional string-to-string map argument (headers, env).
pub(crate) fn optional_string_map(
    args: &Map<String, Value>,
    key: &str,
) -> Result<Vec<(String, String)>, String> {
    match args.get(key) {
        None => Ok(Vec::new()),
        Some(Value::Object(map)) => {
            let mut pairs = Vec::with_capacity(map.len());
            for (k, v) in map {
                match v {
                    Value::String(s) => pairs.push((k.clone(), s.clone())),
                    _ => return Err(format!("'{}' values must be strings", key)),
                }
            }
            Ok(pairs)
        }
        Some(_) => Err(format!("'{}' must be an object", key)),
    }
}
