//! Filesystem tools: `fs.read` and `fs.write`.
//!
//! Policy enforcement happens before these run; the path reaching
//! `execute()` has already passed the allow/deny globs and symlink checks.
//! What remains here is argument validation, I/O error mapping, and the
//! mechanical size check on open (the policy can only pre-flight write
//! sizes, not read sizes).

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde_json::{json, Map, Value};
use tracing::debug;

use capsule_contracts::FsPolicy;
use capsule_policy::{
    canonicalize_existing, canonicalize_for_write, fs_lexically_allowed,
    paths::lexical_normalize,
};

use crate::{optional_string, require_string, Tool, ToolContext, ToolOutput};

/// Read file contents.
pub struct FsReadTool;

impl Tool for FsReadTool {
    fn name(&self) -> &'static str {
        "fs.read"
    }

    fn description(&self) -> &'static str {
        "Read file contents from the filesystem"
    }

    fn schema(&self) -> Value {
        json!({
            "path": { "type": "string", "required": true },
            "encoding": { "type": "string", "required": false, "default": "utf-8" },
        })
    }

    fn execute(&self, args: &Map<String, Value>, ctx: &ToolContext) -> ToolOutput {
        let path_str = match require_string(args, "path") {
            Ok(s) => s,
            Err(e) => return ToolOutput::fail(format!("invalid arguments: {}", e)),
        };
        let encoding = match optional_string(args, "encoding") {
            Ok(e) => e.unwrap_or("utf-8").to_string(),
            Err(e) => return ToolOutput::fail(format!("invalid arguments: {}", e)),
        };
        if encoding != "utf-8" && encoding != "binary" {
            return ToolOutput::fail(format!("unsupported encoding: {}", encoding));
        }

        let path = match canonicalize_existing(path_str, &ctx.working_dir) {
            Ok(p) => p,
            Err(_) => return ToolOutput::fail(format!("file not found: {}", path_str)),
        };
        if !path.is_file() {
            return ToolOutput::fail(format!("not a file: {}", path_str));
        }

        // Size gate before opening; the read policy cannot pre-flight this
        // from the arguments alone.
        let max_size = ctx
            .policy
            .tools
            .fs_read
            .as_ref()
            .map(|p| p.max_size_bytes)
            .unwrap_or_else(|| FsPolicy::default().max_size_bytes);
        match std::fs::metadata(&path) {
            Ok(meta) if max_size > 0 && meta.len() > max_size => {
                return ToolOutput::fail(format!(
                    "file size {} exceeds limit {}: {}",
                    meta.len(),
                    max_size,
                    path_str
                ));
            }
            Ok(_) => {}
            Err(e) => return ToolOutput::fail(format!("cannot stat {}: {}", path_str, e)),
        }

        let bytes = match std::fs::read(&path) {
            Ok(b) => b,
            Err(e) => return ToolOutput::fail(format!("error reading {}: {}", path_str, e)),
        };
        let size_bytes = bytes.len();
        debug!(path = %path.display(), size_bytes, "fs.read");

        let (content, encoding) = if encoding == "binary" {
            (STANDARD.encode(&bytes), "binary".to_string())
        } else {
            match String::from_utf8(bytes) {
                Ok(text) => (text, "utf-8".to_string()),
                // Decode failure falls back to base64 rather than erroring:
                // planners asking for a text read of a binary file still
                // get the bytes.
                Err(e) => (STANDARD.encode(e.as_bytes()), "binary".to_string()),
            }
        };

        ToolOutput::ok(json!({
            "content": content,
            "size_bytes": size_bytes,
            "encoding": encoding,
            "path": path.display().to_string(),
        }))
    }
}

/// Write content to a file.
pub struct FsWriteTool;

impl Tool for FsWriteTool {
    fn name(&self) -> &'static str {
        "fs.write"
    }

    fn description(&self) -> &'static str {
        "Write content to a file on the filesystem"
    }

    fn schema(&self) -> Value {
        json!({
            "path": { "type": "string", "required": true },
            "content": { "type": "string", "required": true },
            "encoding": { "type": "string", "required": false, "default": "utf-8" },
            "append": { "type": "boolean", "required": false, "default": false },
        })
    }

    fn execute(&self, args: &Map<String, Value>, ctx: &ToolContext) -> ToolOutput {
        let path_str = match require_string(args, "path") {
            Ok(s) => s,
            Err(e) => return ToolOutput::fail(format!("invalid arguments: {}", e)),
        };
        let content = match args.get("content") {
            Some(Value::String(s)) => s.as_str(),
            Some(_) => return ToolOutput::fail("invalid arguments: 'content' must be a string"),
            None => return ToolOutput::fail("invalid arguments: 'content' is required"),
        };
        let append = match args.get("append") {
            None => false,
            Some(Value::Bool(b)) => *b,
            Some(_) => return ToolOutput::fail("invalid arguments: 'append' must be a boolean"),
        };
        if let Ok(Some(encoding)) = optional_string(args, "encoding") {
            if encoding != "utf-8" {
                return ToolOutput::fail(format!("unsupported encoding: {}", encoding));
            }
        }

        // Create missing parent directories only when the parent itself
        // falls under the write allow-list.
        let lexical = lexical_normalize(&ctx.working_dir.join(path_str));
        if let Some(parent) = lexical.parent() {
            if !parent.exists() {
                let allowed = ctx
                    .policy
                    .tools
                    .fs_write
                    .as_ref()
                    .map(|fs| fs_lexically_allowed(fs, parent, &ctx.working_dir))
                    .unwrap_or(false);
                if !allowed {
                    return ToolOutput::fail(format!(
                        "parent directory does not exist: {}",
                        parent.display()
                    ));
                }
                if let Err(e) = std::fs::create_dir_all(parent) {
                    return ToolOutput::fail(format!("failed to create directories: {}", e));
                }
            }
        }

        let path = match canonicalize_for_write(path_str, &ctx.working_dir) {
            Ok(p) => p,
            Err(e) => return ToolOutput::fail(format!("cannot resolve path '{}': {}", path_str, e)),
        };

        let write_result = if append {
            use std::io::Write;
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .and_then(|mut f| f.write_all(content.as_bytes()))
        } else {
            std::fs::write(&path, content.as_bytes())
        };

        match write_result {
            Ok(()) => {
                debug!(path = %path.display(), bytes = content.len(), append, "fs.write");
                ToolOutput::ok(json!({
                    "bytes_written": content.len(),
                    "path": path.display().to_string(),
                }))
            }
            Err(e) => ToolOutput::fail(format!("error writing {}: {}", path_str, e)),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
