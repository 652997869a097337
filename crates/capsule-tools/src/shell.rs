//! `shell.run`: subprocess execution with no shell interpretation.
//!
//! The command is an argv vector passed straight to the OS; there is no
//! shell in the loop, so metacharacters in arguments are data, not syntax.
//! The tool owns the mechanical limits: a working directory pinned inside
//! the run's workspace, a scrubbed environment, bounded output capture,
//! and a timeout with SIGTERM-then-kill escalation.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use serde_json::{json, Map, Value};
use tracing::{debug, warn};
use wait_timeout::ChildExt;

use crate::{optional_string, optional_string_map, Tool, ToolContext, ToolOutput};

/// Environment variables worth inheriting. Everything else in the host
/// environment (tokens, keys, cloud credentials) stays out of the child.
const SAFE_ENV_VARS: &[&str] = &["PATH", "HOME", "LANG", "LC_ALL", "TZ", "TERM"];

/// How long a SIGTERM'd child gets before the hard kill.
const KILL_GRACE: Duration = Duration::from_secs(2);

/// Execute a command safely.
pub struct ShellRunTool;

impl Tool for ShellRunTool {
    fn name(&self) -> &'static str {
        "shell.run"
    }

    fn description(&self) -> &'static str {
        "Execute a command with arguments as a list, without a shell"
    }

    fn schema(&self) -> Value {
        json!({
            "cmd": { "type": "array", "items": "string", "required": true },
            "cwd": { "type": "string", "required": false },
            "env": { "type": "object", "required": false },
        })
    }

    fn execute(&self, args: &Map<String, Value>, ctx: &ToolContext) -> ToolOutput {
        let argv = match parse_cmd(args) {
            Ok(argv) => argv,
            Err(e) => return ToolOutput::fail(format!("invalid arguments: {}", e)),
        };
        let env_pairs = match optional_string_map(args, "env") {
            Ok(pairs) => pairs,
            Err(e) => return ToolOutput::fail(format!("invalid arguments: {}", e)),
        };

        let shell_policy = ctx.policy.tools.shell_run.clone().unwrap_or_default();
        let timeout = Duration::from_secs(u64::from(shell_policy.timeout_seconds));
        let max_output = shell_policy.max_output_bytes as usize;

        let cwd = match resolve_cwd(args, ctx) {
            Ok(cwd) => cwd,
            Err(e) => return ToolOutput::fail(e),
        };

        let mut command = Command::new(&argv[0]);
        command
            .args(&argv[1..])
            .current_dir(&cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env_clear();
        for key in SAFE_ENV_VARS {
            if let Ok(value) = std::env::var(key) {
                command.env(key, value);
            }
        }
        for (key, value) in &env_pairs {
            command.env(key, value);
        }

        let started = Instant::now();
        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                return ToolOutput::fail(format!("failed to spawn '{}': {}", argv[0], e));
            }
        };

        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            let _ = child.kill();
            return ToolOutput::fail("failed to capture child process output");
        };
        let stdout_handle = thread::spawn(move || read_limited(stdout, max_output));
        let stderr_handle = thread::spawn(move || read_limited(stderr, max_output));

        let mut timed_out = false;
        let status = match child.wait_timeout(timeout) {
            Ok(Some(status)) => Some(status),
            Ok(None) => {
                timed_out = true;
                warn!(cmd = %argv[0], timeout_s = shell_policy.timeout_seconds, "command timed out");
                terminate(&mut child)
            }
            Err(e) => return ToolOutput::fail(format!("failed waiting for command: {}", e)),
        };

        let stdout = stdout_handle.join().unwrap_or_default();
        let stderr = stderr_handle.join().unwrap_or_default();
        let duration_ms = started.elapsed().as_millis() as u64;

        if timed_out {
            return ToolOutput::fail(format!(
                "command timed out after {} seconds",
                shell_policy.timeout_seconds
            ));
        }

        let exit_code = status.and_then(|s| s.code()).unwrap_or(-1);
        debug!(cmd = %argv[0], exit_code, duration_ms, "shell.run finished");

        ToolOutput::ok(json!({
            "exit_code": exit_code,
            "stdout": String::from_utf8_lossy(&stdout).into_owned(),
            "stderr": String::from_utf8_lossy(&stderr).into_owned(),
            "duration_ms": duration_ms,
            "timed_out": false,
        }))
    }
}

fn parse_cmd(args: &Map<String, Value>) -> Result<Vec<String>, String> {
    let items = match args.get("cmd") {
        Some(Value::Array(items)) => items,
        Some(_) => return Err("'cmd' must be a list of strings".to_string()),
        None => return Err("'cmd' is required".to_string()),
    };
    if items.is_empty() {
        return Err("'cmd' list cannot be empty".to_string());
    }
    items
        .iter()
        .enumerate()
        .map(|(i, item)| match item {
            Value::String(s) => Ok(s.clone()),
            _ => Err(format!("'cmd[{}]' must be a string", i)),
        })
        .collect()
}

/// Resolve the requested working directory and refuse anything outside the
/// run's workspace.
fn resolve_cwd(args: &Map<String, Value>, ctx: &ToolContext) -> Result<PathBuf, String> {
    let workspace = std::fs::canonicalize(&ctx.working_dir)
        .map_err(|e| format!("cannot resolve working directory: {}", e))?;

    let requested = match optional_string(args, "cwd").map_err(|e| format!("invalid arguments: {}", e))? {
        None => return Ok(workspace),
        Some(cwd) => cwd,
    };

    let joined = if Path::new(requested).is_absolute() {
        PathBuf::from(requested)
    } else {
        workspace.join(requested)
    };
    let resolved = std::fs::canonicalize(&joined)
        .map_err(|_| format!("working directory does not exist: {}", requested))?;
    if !resolved.is_dir() {
        return Err(format!("working directory is not a directory: {}", requested));
    }
    if !resolved.starts_with(&workspace) {
        return Err(format!("cwd outside the workspace is not allowed: {}", requested));
    }
    Ok(resolved)
}

/// Drain a pipe, keeping at most `limit` bytes. The pipe is read to EOF
/// either way so the child never blocks on a full buffer.
fn read_limited<R: Read>(mut reader: R, limit: usize) -> Vec<u8> {
    let mut kept = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk) {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let room = limit.saturating_sub(kept.len());
                kept.extend_from_slice(&chunk[..n.min(room)]);
            }
        }
    }
    kept
}

/// Graceful termination: SIGTERM, a short grace period, then the hard
/// kill. Returns the exit status when the child could still be reaped.
fn terminate(child: &mut std::process::Child) -> Option<std::process::ExitStatus> {
    #[cfg(unix)]
    {
        unsafe {
            libc::kill(child.id() as libc::pid_t, libc::SIGTERM);
        }
        if let Ok(Some(status)) = child.wait_timeout(KILL_GRACE) {
            return Some(status);
        }
    }
    let _ = child.kill();
    child.wait().ok()
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use capsule_contracts::Policy;

    use super::*;

    fn ctx(policy_yaml: &str) -> (tempfile::TempDir, ToolContext) {
        let dir = tempfile::tempdir().unwrap();
        let root = std::fs::canonicalize(dir.path()).unwrap();
        let ctx = ToolContext::new("run-1", Arc::new(Policy::from_yaml(policy_yaml).unwrap()), root);
        (dir, ctx)
    }

    const ECHO_POLICY: &str = "tools:\n  shell.run:\n    allow_executables: [echo, sh, sleep]\n";

    fn args(value: Value) -> Map<String, Value> {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn echo_captures_stdout_and_exit_code() {
        let (_dir, ctx) = ctx(ECHO_POLICY);
        let out = ShellRunTool.execute(&args(json!({"cmd": ["echo", "hello", "world"]})), &ctx);
        assert!(out.success, "{:?}", out.error);
        let data = out.data.unwrap();
        assert_eq!(data["exit_code"], 0);
        assert_eq!(data["stdout"], "hello world\n");
        assert_eq!(data["timed_out"], false);
    }

    #[test]
    fn nonzero_exit_is_success_with_code() {
        let (_dir, ctx) = ctx(ECHO_POLICY);
        let out = ShellRunTool.execute(&args(json!({"cmd": ["sh", "-c", "exit 3"]})), &ctx);
        assert!(out.success);
        assert_eq!(out.data.unwrap()["exit_code"], 3);
    }

    #[test]
    fn output_is_truncated_to_the_policy_limit() {
        let (_dir, ctx) = ctx("tools:\n  shell.run:\n    allow_executables: [echo]\n    max_output_bytes: 8\n");
        let out = ShellRunTool.execute(
            &args(json!({"cmd": ["echo", "0123456789abcdef"]})),
            &ctx,
        );
        assert!(out.success);
        let data = out.data.unwrap();
        assert_eq!(data["stdout"], "01234567");
    }

    #[test]
    fn timeout_kills_the_child() {
        let (_dir, ctx) = ctx("tools:\n  shell.run:\n    allow_executables: [sleep]\n    timeout_seconds: 1\n");
        let started = Instant::now();
        let out = ShellRunTool.execute(&args(json!({"cmd": ["sleep", "30"]})), &ctx);
        assert!(!out.success);
        assert!(out.error.unwrap().contains("timed out"));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn cwd_outside_the_workspace_is_refused() {
        let (_dir, ctx) = ctx(ECHO_POLICY);
        let out = ShellRunTool.execute(&args(json!({"cmd": ["echo", "hi"], "cwd": "/"})), &ctx);
        assert!(!out.success);
        assert!(out.error.unwrap().contains("outside the workspace"));
    }

    #[test]
    fn environment_is_scrubbed_but_explicit_vars_pass() {
        std::env::set_var("CAPSULE_TEST_SECRET", "leaky");
        let (_dir, ctx) = ctx(ECHO_POLICY);

        let out = ShellRunTool.execute(
            &args(json!({"cmd": ["sh", "-c", "echo \"${CAPSULE_TEST_SECRET:-scrubbed}\""]})),
            &ctx,
        );
        assert_eq!(out.data.unwrap()["stdout"], "scrubbed\n");

        let out = ShellRunTool.execute(
            &args(json!({
                "cmd": ["sh", "-c", "echo \"$GREETING\""],
                "env": {"GREETING": "salut"}
            })),
            &ctx,
        );
        assert_eq!(out.data.unwrap()["stdout"], "salut\n");
        std::env::remove_var("CAPSULE_TEST_SECRET");
    }

    #[test]
    fn malformed_cmd_is_an_argument_error() {
        let (_dir, ctx) = ctx(ECHO_POLICY);
        for bad in [json!({}), json!({"cmd": "echo hi"}), json!({"cmd": []}), json!({"cmd": [1]})] {
            let out = ShellRunTool.execute(&args(bad), &ctx);
            assert!(!out.success);
            assert!(out.error.unwrap().contains("invalid arguments"));
        }
    }
}
