//! The policy engine: evaluates proposed tool calls against a frozen
//! `Policy`.
//!
//! Evaluation algorithm:
//!
//! 1. Quota check against the caller's per-tool counters.
//! 2. Dispatch on the tool name. A tool with no policy entry — or a name
//!    the engine does not know — is denied outright (deny-by-default).
//! 3. Tool-specific rules: filesystem (canonicalize, hidden check,
//!    deny-overrides-allow globs, symlink containment, write size),
//!    network (scheme, domain allowlist, private-IP resolution with
//!    pinning), shell (argv-only commands, executable allowlist, token
//!    scan).
//!
//! Fail-closed: any internal evaluation failure is surfaced as an error
//! the orchestrator converts to a denial, never to an allow.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::{debug, warn};
use url::Url;

use capsule_contracts::{
    CapsuleResult, FsPolicy, HttpPolicy, Policy, PolicyDecision, ShellPolicy,
};

use crate::{
    net::{domain_matches, is_blocked_ip, Resolver, SystemResolver},
    paths::{
        canonicalize_existing, canonicalize_for_write, has_hidden_component, lexical_normalize,
        PathPattern,
    },
};

/// Per-tool executed-call counters for one run, owned by the orchestrator.
#[derive(Debug, Default, Clone)]
pub struct CallCounters {
    counts: HashMap<String, u32>,
}

impl CallCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self, tool_name: &str) -> u32 {
        self.counts.get(tool_name).copied().unwrap_or(0)
    }

    /// Bump the counter after a call actually executed.
    pub fn increment(&mut self, tool_name: &str) {
        *self.counts.entry(tool_name.to_string()).or_insert(0) += 1;
    }
}

/// Which filesystem operation is being evaluated. Reads require the full
/// path to exist; writes only the parent chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsOperation {
    Read,
    Write,
}

impl FsOperation {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
        }
    }
}

/// Central policy evaluator.
///
/// Read-only at run time; one instance can serve any number of
/// evaluations. The resolver is injectable so tests can control DNS
/// answers.
pub struct PolicyEngine {
    policy: Policy,
    resolver: Arc<dyn Resolver>,
}

impl PolicyEngine {
    pub fn new(policy: Policy) -> Self {
        Self { policy, resolver: Arc::new(SystemResolver) }
    }

    pub fn with_resolver(policy: Policy, resolver: Arc<dyn Resolver>) -> Self {
        Self { policy, resolver }
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    /// Evaluate one proposed call.
    ///
    /// Returns `Ok(decision)` for every rule outcome, allow or deny.
    /// `Err` means evaluation itself broke; the orchestrator records that
    /// as a denial (fail-closed), never as an allow.
    pub fn evaluate(
        &self,
        tool_name: &str,
        args: &Map<String, Value>,
        working_dir: &Path,
        counters: &CallCounters,
    ) -> CapsuleResult<PolicyDecision> {
        let current = counters.count(tool_name);
        if current >= self.policy.max_calls_per_tool {
            return Ok(PolicyDecision::deny(
                format!(
                    "quota exceeded: {} called {} times (max: {})",
                    tool_name, current, self.policy.max_calls_per_tool
                ),
                "max_calls_per_tool",
            ));
        }

        let decision = match tool_name {
            "fs.read" => match &self.policy.tools.fs_read {
                Some(fs) => evaluate_fs(fs, args, working_dir, FsOperation::Read),
                None => not_enabled(tool_name),
            },
            "fs.write" => match &self.policy.tools.fs_write {
                Some(fs) => evaluate_fs(fs, args, working_dir, FsOperation::Write),
                None => not_enabled(tool_name),
            },
            "http.get" => match &self.policy.tools.http_get {
                Some(http) => evaluate_http_args(http, args, self.resolver.as_ref()),
                None => not_enabled(tool_name),
            },
            "shell.run" => match &self.policy.tools.shell_run {
                Some(shell) => evaluate_shell(shell, args),
                None => not_enabled(tool_name),
            },
            other => PolicyDecision::deny(format!("unknown tool: {}", other), "deny_by_default"),
        };

        if decision.allowed {
            debug!(tool = tool_name, rule = ?decision.rule_hit, "policy allowed call");
        } else {
            warn!(tool = tool_name, reason = %decision.reason, "policy denied call");
        }

        Ok(decision)
    }
}

fn not_enabled(tool_name: &str) -> PolicyDecision {
    PolicyDecision::deny(
        format!("tool '{}' is not enabled by policy", tool_name),
        "deny_by_default",
    )
}

// ── Filesystem rules ──────────────────────────────────────────────────────────

/// Evaluate an `fs.read` / `fs.write` call against a filesystem policy.
pub fn evaluate_fs(
    fs: &FsPolicy,
    args: &Map<String, Value>,
    working_dir: &Path,
    op: FsOperation,
) -> PolicyDecision {
    let path_str = match args.get("path") {
        Some(Value::String(s)) if !s.trim().is_empty() => s.as_str(),
        Some(Value::String(_)) | None => {
            return PolicyDecision::deny("no path provided", "missing_argument");
        }
        Some(_) => {
            return PolicyDecision::deny("'path' must be a string", "missing_argument");
        }
    };

    // Canonicalize before any matching. Resolution failure is a denial:
    // a path the engine cannot pin down is a path it cannot vouch for.
    let canonical = match op {
        FsOperation::Read => canonicalize_existing(path_str, working_dir),
        FsOperation::Write => canonicalize_for_write(path_str, working_dir),
    };
    let canonical = match canonical {
        Ok(p) => p,
        Err(e) => {
            return PolicyDecision::deny(
                format!("cannot resolve path '{}': {}", path_str, e),
                "invalid_path",
            );
        }
    };

    if !fs.allow_hidden && has_hidden_component(&canonical) {
        return PolicyDecision::deny(
            format!("hidden files not allowed: {}", path_str),
            "allow_hidden=false",
        );
    }

    // Deny overrides allow.
    for pattern in &fs.deny_paths {
        if PathPattern::compile(pattern, working_dir).matches(&canonical) {
            return PolicyDecision::deny(
                format!("path matches deny pattern: {}", pattern),
                format!("deny_paths[{}]", pattern),
            );
        }
    }

    if fs.allow_paths.is_empty() {
        return PolicyDecision::deny(
            format!("no paths allowed for fs.{}", op.as_str()),
            "allow_paths=[]",
        );
    }

    let mut matched: Option<&str> = None;
    let mut escape_reason: Option<String> = None;
    for pattern in &fs.allow_paths {
        let compiled = PathPattern::compile(pattern, working_dir);
        if !compiled.matches(&canonical) {
            continue;
        }
        // A pattern base that is itself a symlink widens the allowed area
        // to wherever the link points; refuse it and try other patterns
        // (the path may legitimately match another allowed area).
        if compiled.base_is_symlink() {
            escape_reason = Some(format!(
                "allow pattern base is a symlink: {}",
                compiled.raw()
            ));
            continue;
        }
        matched = Some(pattern);
        break;
    }

    let Some(matched) = matched else {
        if let Some(reason) = escape_reason {
            return PolicyDecision::deny(reason, "symlink_escape");
        }
        // Distinguish a plain out-of-bounds path from a symlink escape: if
        // the path as written (lexically normalized, symlinks unresolved)
        // would have matched an allow pattern, a link redirected it out.
        let lexical = lexical_normalize(&working_dir.join(path_str));
        let escaped = fs
            .allow_paths
            .iter()
            .any(|p| PathPattern::compile(p, working_dir).matches_lexical(&lexical));
        if escaped {
            return PolicyDecision::deny(
                format!(
                    "symlink escape detected: '{}' resolves to '{}' outside the allowed paths",
                    path_str,
                    canonical.display()
                ),
                "symlink_escape",
            );
        }
        return PolicyDecision::deny(
            format!("path not in allowlist: {}", path_str),
            "allow_paths",
        );
    };

    // Write pre-flight: reject oversized content before any bytes land.
    if op == FsOperation::Write {
        let content_size = match args.get("content") {
            Some(Value::String(s)) => s.len() as u64,
            _ => 0,
        };
        if fs.max_size_bytes > 0 && content_size > fs.max_size_bytes {
            return PolicyDecision::deny(
                format!(
                    "content size {} exceeds limit {}",
                    content_size, fs.max_size_bytes
                ),
                "max_size_bytes",
            );
        }
    }

    PolicyDecision::allow(
        format!("path allowed by pattern: {}", matched),
        format!("allow_paths[{}]", matched),
    )
}

/// Whether `path` (not required to exist) falls under the policy's allow
/// patterns, lexically. Used by `fs.write` to decide if missing parent
/// directories may be created.
pub fn fs_lexically_allowed(fs: &FsPolicy, path: &Path, working_dir: &Path) -> bool {
    let lexical = lexical_normalize(&if path.is_absolute() {
        path.to_path_buf()
    } else {
        working_dir.join(path)
    });
    fs.allow_paths
        .iter()
        .any(|p| PathPattern::compile(p, working_dir).matches_lexical(&lexical))
}

// ── Network rules ─────────────────────────────────────────────────────────────

fn evaluate_http_args(
    http: &HttpPolicy,
    args: &Map<String, Value>,
    resolver: &dyn Resolver,
) -> PolicyDecision {
    let url_str = match args.get("url") {
        Some(Value::String(s)) if !s.trim().is_empty() => s.as_str(),
        Some(Value::String(_)) | None => {
            return PolicyDecision::deny("no URL provided", "missing_argument");
        }
        Some(_) => return PolicyDecision::deny("'url' must be a string", "missing_argument"),
    };

    let url = match Url::parse(url_str) {
        Ok(u) => u,
        Err(e) => {
            return PolicyDecision::deny(
                format!("invalid URL '{}': {}", url_str, e),
                "invalid_url",
            );
        }
    };

    evaluate_http(http, &url, resolver)
}

/// Evaluate a URL against an HTTP policy.
///
/// Also used by the `http.get` tool to re-evaluate redirect targets on a
/// host change. On allow with `deny_private_ips`, the decision carries the
/// vetted addresses the tool must pin its connection to.
pub fn evaluate_http(http: &HttpPolicy, url: &Url, resolver: &dyn Resolver) -> PolicyDecision {
    match url.scheme() {
        "http" | "https" => {}
        other => {
            return PolicyDecision::deny(
                format!("unsupported URL scheme: {}", other),
                "url_scheme",
            );
        }
    }

    let Some(host) = url.host_str() else {
        return PolicyDecision::deny("URL has no host", "invalid_url");
    };
    // url::Url already IDN-normalizes hosts to lowercase punycode.
    let host = host.trim_matches(|c| c == '[' || c == ']').to_ascii_lowercase();

    if http.allow_domains.is_empty() {
        return PolicyDecision::deny("no domains allowed for http.get", "allow_domains=[]");
    }

    let Some(matched) = http
        .allow_domains
        .iter()
        .find(|pattern| domain_matches(&host, pattern))
    else {
        return PolicyDecision::deny(
            format!("domain not in allowlist: {}", host),
            "allow_domains",
        );
    };

    if !http.deny_private_ips {
        return PolicyDecision::allow(
            format!("domain allowed: {}", matched),
            format!("allow_domains[{}]", matched),
        );
    }

    let port = url.port_or_known_default().unwrap_or(443);
    let addrs = match resolver.resolve(&host, port) {
        Ok(addrs) if !addrs.is_empty() => addrs,
        Ok(_) => {
            return PolicyDecision::deny(
                format!("no addresses resolved for {}", host),
                "dns_resolution",
            );
        }
        Err(e) => {
            return PolicyDecision::deny(
                format!("DNS resolution failed for {}: {}", host, e),
                "dns_resolution",
            );
        }
    };

    if let Some(blocked) = addrs.iter().find(|ip| is_blocked_ip(**ip)) {
        return PolicyDecision::deny(
            format!("private IP blocked: {} resolves to {}", host, blocked),
            "deny_private_ips=true",
        );
    }

    PolicyDecision::allow(
        format!("domain allowed: {}", matched),
        format!("allow_domains[{}]", matched),
    )
    .with_pinned_addrs(addrs)
}

// ── Shell rules ───────────────────────────────────────────────────────────────

/// Evaluate a `shell.run` call: argv-only commands, executable allowlist,
/// denied-token scan over every argument.
pub fn evaluate_shell(shell: &ShellPolicy, args: &Map<String, Value>) -> PolicyDecision {
    let cmd = match args.get("cmd") {
        None => return PolicyDecision::deny("no cmd provided", "missing_argument"),
        Some(Value::Array(items)) => items,
        Some(_) => {
            return PolicyDecision::deny(
                "cmd must be a list of strings (shell strings are never interpreted)",
                "cmd_must_be_list",
            );
        }
    };
    if cmd.is_empty() {
        return PolicyDecision::deny("cmd list is empty", "cmd_empty");
    }
    let mut argv = Vec::with_capacity(cmd.len());
    for (i, item) in cmd.iter().enumerate() {
        match item {
            Value::String(s) => argv.push(s.as_str()),
            _ => {
                return PolicyDecision::deny(
                    format!("cmd[{}] must be a string", i),
                    "cmd_must_be_list",
                );
            }
        }
    }

    let exe = Path::new(argv[0])
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| argv[0].to_string());

    if shell.allow_executables.is_empty() {
        return PolicyDecision::deny(
            "no executables allowed for shell.run",
            "allow_executables=[]",
        );
    }
    if !shell.allow_executables.iter().any(|e| e == &exe) {
        return PolicyDecision::deny(
            format!("executable not in allowlist: {}", exe),
            "allow_executables",
        );
    }

    // Case-sensitive substring scan. Joining argv catches tokens like
    // "rm -rf" whether they sit inside one argument or span two.
    let joined = argv.join(" ");
    for token in &shell.deny_tokens {
        if !token.is_empty() && joined.contains(token.as_str()) {
            return PolicyDecision::deny(
                format!("blocked token found: {}", token),
                format!("deny_tokens[{}]", token),
            );
        }
    }

    PolicyDecision::allow(
        format!("executable allowed: {}", exe),
        format!("allow_executables[{}]", exe),
    )
}

// ── Tests ─────────────────────────────────────────────────────────────────────
