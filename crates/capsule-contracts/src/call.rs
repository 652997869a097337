//! Tool call, policy decision, and result types.
//!
//! These are the per-step records flowing between the orchestrators, the
//! Policy Engine, and the audit store. `ToolCall` and `ToolResult` are
//! append-only once recorded; `PolicyDecision` is embedded in every result
//! so the audit trail shows why each call ran or did not.

use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Status of a single tool call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    /// The tool executed and reported success.
    Success,
    /// The Policy Engine refused the call; the tool never ran.
    Denied,
    /// The tool executed (or was attempted) and failed.
    Error,
}

impl CallStatus {
    /// Stable lowercase string used in the store and reports.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Denied => "denied",
            Self::Error => "error",
        }
    }
}

impl std::str::FromStr for CallStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(Self::Success),
            "denied" => Ok(Self::Denied),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown call status '{}'", other)),
        }
    }
}

/// The decision emitted by the Policy Engine for one proposed call.
///
/// `allowed = false` prevents the tool from running. This is the core
/// security guarantee of the runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyDecision {
    /// Whether the call is permitted.
    pub allowed: bool,
    /// Human-readable explanation, written to the audit log.
    pub reason: String,
    /// The policy clause that decided the outcome (e.g. `deny_paths[./secrets/**]`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule_hit: Option<String>,
    /// For `http.get` allows: the addresses the host resolved to during
    /// evaluation. The tool must connect to exactly these addresses and
    /// never re-resolve, closing the DNS rebinding window.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pinned_addrs: Vec<IpAddr>,
}

impl PolicyDecision {
    /// Create an allow decision.
    pub fn allow(reason: impl Into<String>, rule: impl Into<String>) -> Self {
        Self {
            allowed: true,
            reason: reason.into(),
            rule_hit: Some(rule.into()),
            pinned_addrs: Vec::new(),
        }
    }

    /// Create a deny decision.
    pub fn deny(reason: impl Into<String>, rule: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: reason.into(),
            rule_hit: Some(rule.into()),
            pinned_addrs: Vec::new(),
        }
    }

    /// Attach pinned addresses to an allow decision.
    pub fn with_pinned_addrs(mut self, addrs: Vec<IpAddr>) -> Self {
        self.pinned_addrs = addrs;
        self
    }
}

/// A recorded tool invocation: one step of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Short opaque identifier, unique within the store.
    pub call_id: String,
    /// The run this call belongs to.
    pub run_id: String,
    /// Position in the plan (0-indexed); iteration number in agent mode.
    pub step_index: u32,
    /// Dotted tool name.
    pub tool_name: String,
    /// Arguments passed to the tool.
    pub args: Map<String, Value>,
    /// When this call was recorded (UTC).
    pub created_at: DateTime<Utc>,
}

/// The outcome of one tool call, paired 1:1 with a `ToolCall`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub call_id: String,
    pub run_id: String,
    pub status: CallStatus,
    /// Output data from the tool, present on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    /// Error message, present on error (and on denials, echoing the reason).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// The policy decision made for this call.
    pub decision: PolicyDecision,
    /// Taken immediately before the tool was invoked.
    pub started_at: DateTime<Utc>,
    /// Taken immediately after the tool returned.
    pub ended_at: DateTime<Utc>,
    /// SHA-256 of the canonical JSON of the call's args.
    pub input_hash: String,
    /// SHA-256 of the canonical JSON of `output`; empty string when absent.
    pub output_hash: String,
}

impl ToolResult {
    /// Wall-clock duration of the call in milliseconds.
    pub fn duration_ms(&self) -> i64 {
        (self.ended_at - self.started_at).num_milliseconds()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_status_round_trips_through_strings() {
        for status in [CallStatus::Success, CallStatus::Denied, CallStatus::Error] {
            let parsed: CallStatus = status.as_str().parse().unwrap();
            assert_eq!(parsed, status);
        }
        assert!("pending".parse::<CallStatus>().is_err());
    }

    #[test]
    fn decision_constructors_set_rule_hit() {
        let allow = PolicyDecision::allow("path allowed", "allow_paths[./**]");
        assert!(allow.allowed);
        assert_eq!(allow.rule_hit.as_deref(), Some("allow_paths[./**]"));

        let deny = PolicyDecision::deny("hidden files not allowed", "allow_hidden=false");
        assert!(!deny.allowed);
        assert!(deny.pinned_addrs.is_empty());
    }

    #[test]
    fn pinned_addrs_survive_serde() {
        let decision = PolicyDecision::allow("domain allowed", "allow_domains[*]")
            .with_pinned_addrs(vec!["93.184.216.34".parse().unwrap()]);
        let json = serde_json::to_string(&decision).unwrap();
        let back: PolicyDecision = serde_json::from_str(&json).unwrap();
        assert_eq!(back.pinned_addrs.len(), 1);
    }

    #[test]
    fn empty_pinned_addrs_are_omitted_from_json() {
        let decision = PolicyDecision::deny("no", "deny_by_default");
        let json = serde_json::to_string(&decision).unwrap();
        assert!(!json.contains("pinned_addrs"));
    }
}
