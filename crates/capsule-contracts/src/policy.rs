//! Policy types and YAML loading.
//!
//! A `Policy` is the frozen configuration the Policy Engine enforces. The
//! boundary is always deny-by-default: a tool with no policy entry is
//! denied outright, and within an entry everything not explicitly allowed
//! is denied.
//!
//! Each tool gets its own tagged policy shape keyed by the dotted tool
//! name. Unknown tool names (and any unknown key) are rejected at load so
//! misconfigured policies fail fast rather than silently allowing or
//! denying the wrong thing.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{
    canonical::{hash_bytes, to_canonical_json},
    error::{CapsuleError, CapsuleResult},
};

/// The default policy behavior.
///
/// `deny_by_default` is the only supported boundary — the variant exists so
/// policy files state the posture explicitly and the loader can reject
/// anything else.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyBoundary {
    #[default]
    DenyByDefault,
}

/// Rules for the filesystem tools (`fs.read`, `fs.write`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FsPolicy {
    /// Glob patterns for allowed paths, matched against canonical absolute
    /// paths (e.g. `./**`, `/tmp/scratch/**`).
    #[serde(default)]
    pub allow_paths: Vec<String>,
    /// Glob patterns for denied paths. Deny overrides allow.
    #[serde(default)]
    pub deny_paths: Vec<String>,
    /// Maximum file size in bytes (read: stat pre-flight; write: content length).
    #[serde(default = "default_fs_max_size")]
    pub max_size_bytes: u64,
    /// Whether dotfile path components are allowed.
    #[serde(default)]
    pub allow_hidden: bool,
}

impl Default for FsPolicy {
    fn default() -> Self {
        Self {
            allow_paths: Vec::new(),
            deny_paths: Vec::new(),
            max_size_bytes: default_fs_max_size(),
            allow_hidden: false,
        }
    }
}

fn default_fs_max_size() -> u64 {
    10 * 1024 * 1024
}

/// Rules for `http.get`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HttpPolicy {
    /// Allowed host patterns: exact hosts, `*.example.com` suffixes, or `*`.
    #[serde(default)]
    pub allow_domains: Vec<String>,
    /// Whether hosts resolving to private/reserved ranges are blocked.
    #[serde(default = "default_true")]
    pub deny_private_ips: bool,
    /// Maximum response body size in bytes.
    #[serde(default = "default_http_max_response")]
    pub max_response_bytes: u64,
    /// Request timeout in seconds.
    #[serde(default = "default_http_timeout")]
    pub timeout_seconds: u32,
}

impl Default for HttpPolicy {
    fn default() -> Self {
        Self {
            allow_domains: Vec::new(),
            deny_private_ips: true,
            max_response_bytes: default_http_max_response(),
            timeout_seconds: default_http_timeout(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_http_max_response() -> u64 {
    10 * 1024 * 1024
}

fn default_http_timeout() -> u32 {
    30
}

/// Rules for `shell.run`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ShellPolicy {
    /// Allowed executable basenames (e.g. `git`, `echo`).
    #[serde(default)]
    pub allow_executables: Vec<String>,
    /// Case-sensitive substrings that deny the call when found anywhere
    /// in the arguments.
    #[serde(default = "default_deny_tokens")]
    pub deny_tokens: Vec<String>,
    /// Command execution timeout in seconds.
    #[serde(default = "default_shell_timeout")]
    pub timeout_seconds: u32,
    /// Maximum captured bytes for each of stdout and stderr.
    #[serde(default = "default_shell_max_output")]
    pub max_output_bytes: u64,
}

impl Default for ShellPolicy {
    fn default() -> Self {
        Self {
            allow_executables: Vec::new(),
            deny_tokens: default_deny_tokens(),
            timeout_seconds: default_shell_timeout(),
            max_output_bytes: default_shell_max_output(),
        }
    }
}

// Tokens are matched as case-sensitive substrings over the argv, so the
// defaults stick to strings that cannot occur inside ordinary words.
fn default_deny_tokens() -> Vec<String> {
    [
        "sudo", "rm -rf", "mkfs", "> /dev", "chmod 777", "curl | sh", "wget | sh",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_shell_timeout() -> u32 {
    60
}

fn default_shell_max_output() -> u64 {
    1024 * 1024
}

/// Per-tool policy entries, keyed by dotted tool name.
///
/// An absent entry means the tool is not enabled: every call to it is
/// denied. This is the structural half of deny-by-default.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ToolPolicies {
    #[serde(rename = "fs.read", default, skip_serializing_if = "Option::is_none")]
    pub fs_read: Option<FsPolicy>,
    #[serde(rename = "fs.write", default, skip_serializing_if = "Option::is_none")]
    pub fs_write: Option<FsPolicy>,
    #[serde(rename = "http.get", default, skip_serializing_if = "Option::is_none")]
    pub http_get: Option<HttpPolicy>,
    #[serde(rename = "shell.run", default, skip_serializing_if = "Option::is_none")]
    pub shell_run: Option<ShellPolicy>,
}

/// Complete policy configuration, frozen after loading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Policy {
    #[serde(default)]
    pub boundary: PolicyBoundary,
    #[serde(default)]
    pub tools: ToolPolicies,
    /// Maximum total run duration; enforced by the orchestrator between steps.
    #[serde(default = "default_global_timeout")]
    pub global_timeout_seconds: u32,
    /// Maximum executed calls per tool within one run.
    #[serde(default = "default_max_calls")]
    pub max_calls_per_tool: u32,
}

fn default_global_timeout() -> u32 {
    300
}

fn default_max_calls() -> u32 {
    100
}

impl Default for Policy {
    /// Matches the serde defaults: no tools enabled, everything denied,
    /// standard quota and timeout budgets.
    fn default() -> Self {
        Self {
            boundary: PolicyBoundary::DenyByDefault,
            tools: ToolPolicies::default(),
            global_timeout_seconds: default_global_timeout(),
            max_calls_per_tool: default_max_calls(),
        }
    }
}

impl Policy {
    /// Parse a policy from YAML. Unknown top-level keys and unknown tool
    /// names are rejected.
    pub fn from_yaml(content: &str) -> CapsuleResult<Self> {
        serde_yaml::from_str(content).map_err(|e| CapsuleError::PlanValidation {
            reason: format!("failed to parse policy YAML: {}", e),
        })
    }

    /// Read the file at `path` and parse it as a policy.
    pub fn from_file(path: &Path) -> CapsuleResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| CapsuleError::PlanValidation {
            reason: format!("failed to read policy file '{}': {}", path.display(), e),
        })?;
        Self::from_yaml(&content)
    }

    /// Canonical JSON serialization of this policy.
    pub fn canonical_json(&self) -> CapsuleResult<String> {
        to_canonical_json(self)
    }

    /// SHA-256 of the canonical JSON form.
    pub fn hash(&self) -> CapsuleResult<String> {
        Ok(hash_bytes(self.canonical_json()?.as_bytes()))
    }

    /// Human-readable one-line summary of what the policy permits, handed
    /// to planners so they can propose calls that will pass.
    pub fn summary(&self) -> String {
        let mut lines = Vec::new();

        match &self.tools.fs_read {
            Some(fs) if !fs.allow_paths.is_empty() => {
                lines.push(format!("can read: {}", fs.allow_paths.join(", ")));
            }
            _ => lines.push("cannot read any files".to_string()),
        }
        match &self.tools.fs_write {
            Some(fs) if !fs.allow_paths.is_empty() => {
                lines.push(format!("can write: {}", fs.allow_paths.join(", ")));
            }
            _ => lines.push("cannot write any files".to_string()),
        }
        match &self.tools.http_get {
            Some(http) if !http.allow_domains.is_empty() => {
                lines.push(format!("can fetch domains: {}", http.allow_domains.join(", ")));
            }
            _ => lines.push("cannot access any URLs".to_string()),
        }
        match &self.tools.shell_run {
            Some(shell) if !shell.allow_executables.is_empty() => {
                lines.push(format!("can run commands: {}", shell.allow_executables.join(", ")));
            }
            _ => lines.push("cannot run any shell commands".to_string()),
        }

        lines.join("; ")
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    const FULL_POLICY: &str = r#"
boundary: deny_by_default
tools:
  fs.read:
    allow_paths: ["./**"]
    deny_paths: ["./secrets/**"]
    max_size_bytes: 1048576
  shell.run:
    allow_executables: [echo, git]
global_timeout_seconds: 120
max_calls_per_tool: 10
"#;

    #[test]
    fn parses_policy_with_dotted_tool_names() {
        let policy = Policy::from_yaml(FULL_POLICY).unwrap();
        let fs = policy.tools.fs_read.as_ref().unwrap();
        assert_eq!(fs.allow_paths, vec!["./**"]);
        assert_eq!(fs.max_size_bytes, 1_048_576);
        assert!(!fs.allow_hidden);
        assert!(policy.tools.http_get.is_none());
        assert_eq!(policy.global_timeout_seconds, 120);
    }

    #[test]
    fn unknown_tool_name_is_rejected_at_load() {
        let yaml = "tools:\n  fs.delete:\n    allow_paths: [\"./**\"]\n";
        assert!(Policy::from_yaml(yaml).is_err());
    }

    #[test]
    fn unknown_top_level_key_is_rejected() {
        assert!(Policy::from_yaml("allow_everything: true\n").is_err());
    }

    #[test]
    fn non_default_boundary_is_rejected() {
        assert!(Policy::from_yaml("boundary: allow_by_default\n").is_err());
    }

    #[test]
    fn shell_defaults_include_deny_tokens() {
        let policy = Policy::from_yaml("tools:\n  shell.run:\n    allow_executables: [ls]\n")
            .unwrap();
        let shell = policy.tools.shell_run.unwrap();
        assert!(shell.deny_tokens.iter().any(|t| t == "sudo"));
        assert!(shell.deny_tokens.iter().any(|t| t == "rm -rf"));
        assert_eq!(shell.timeout_seconds, 60);
    }

    #[test]
    fn policy_hash_is_stable() {
        let a = Policy::from_yaml(FULL_POLICY).unwrap();
        let b = Policy::from_yaml(FULL_POLICY).unwrap();
        assert_eq!(a.hash().unwrap(), b.hash().unwrap());
    }

    #[test]
    fn summary_reflects_enabled_tools() {
        let policy = Policy::from_yaml(FULL_POLICY).unwrap();
        let summary = policy.summary();
        assert!(summary.contains("can read: ./**"));
        assert!(summary.contains("can run commands: echo, git"));
        assert!(summary.contains("cannot access any URLs"));
    }
}
