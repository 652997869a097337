//! Plan types and YAML loading.
//!
//! A `Plan` is an ordered sequence of tool invocations. Plans are immutable
//! once loaded, validated before a run is created, and hashed by canonical
//! JSON — the hash is the replay key.

use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{
    canonical::{hash_bytes, to_canonical_json},
    error::{CapsuleError, CapsuleResult},
};

/// A single step in a plan: one tool invocation with its arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlanStep {
    /// Tool identifier in dotted form (e.g. `fs.read`, `shell.run`).
    pub tool: String,
    /// Arguments passed to the tool. Shape is tool-specific.
    #[serde(default)]
    pub args: Map<String, Value>,
    /// Optional human-readable name for this step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// A complete execution plan.
///
/// Steps are executed sequentially in declaration order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Plan {
    /// Plan schema version.
    #[serde(default = "default_version")]
    pub version: String,
    /// Optional name for this plan.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Optional description of what this plan does.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Ordered list of steps to execute.
    pub steps: Vec<PlanStep>,
}

fn default_version() -> String {
    "1.0".to_string()
}

impl Plan {
    /// Structural validation, applied after deserialization and before any
    /// run is created. Violations are fatal 3xxx errors.
    pub fn validate(&self) -> CapsuleResult<()> {
        if self.steps.is_empty() {
            return Err(CapsuleError::PlanValidation {
                reason: "plan has no steps".to_string(),
            });
        }
        for (index, step) in self.steps.iter().enumerate() {
            validate_tool_name(&step.tool).map_err(|reason| CapsuleError::PlanValidation {
                reason: format!("step {}: {}", index, reason),
            })?;
        }
        Ok(())
    }

    /// Parse a plan from YAML and validate it.
    pub fn from_yaml(content: &str) -> CapsuleResult<Self> {
        let plan: Plan =
            serde_yaml::from_str(content).map_err(|e| CapsuleError::PlanValidation {
                reason: format!("failed to parse plan YAML: {}", e),
            })?;
        plan.validate()?;
        Ok(plan)
    }

    /// Read the file at `path` and parse it as a plan.
    pub fn from_file(path: &Path) -> CapsuleResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| CapsuleError::PlanValidation {
            reason: format!("failed to read plan file '{}': {}", path.display(), e),
        })?;
        Self::from_yaml(&content)
    }

    /// Canonical JSON serialization of this plan.
    pub fn canonical_json(&self) -> CapsuleResult<String> {
        to_canonical_json(self)
    }

    /// SHA-256 of the canonical JSON form. This is the replay key.
    pub fn hash(&self) -> CapsuleResult<String> {
        Ok(hash_bytes(self.canonical_json()?.as_bytes()))
    }
}

/// Tool names are dotted identifiers: lowercase alphanumeric segments with
/// underscores, joined by single dots.
fn validate_tool_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("tool name is empty".to_string());
    }
    for segment in name.split('.') {
        if segment.is_empty()
            || !segment
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        {
            return Err(format!("invalid tool name format: '{}'", name));
        }
    }
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    const READ_PLAN: &str = r#"
version: "1.0"
name: read-readme
steps:
  - tool: fs.read
    args:
      path: ./README.md
"#;

    #[test]
    fn parses_minimal_plan() {
        let plan = Plan::from_yaml(READ_PLAN).unwrap();
        assert_eq!(plan.version, "1.0");
        assert_eq!(plan.steps.len(), 1);
        assert_eq!(plan.steps[0].tool, "fs.read");
        assert_eq!(plan.steps[0].args["path"], "./README.md");
    }

    #[test]
    fn version_defaults_when_omitted() {
        let plan = Plan::from_yaml("steps:\n  - tool: fs.read\n    args: {path: ./x}\n").unwrap();
        assert_eq!(plan.version, "1.0");
    }

    #[test]
    fn empty_plan_is_rejected() {
        let err = Plan::from_yaml("version: \"1.0\"\nsteps: []\n").unwrap_err();
        assert_eq!(err.code(), 3000);
        assert!(err.to_string().contains("no steps"));
    }

    #[test]
    fn malformed_tool_name_is_rejected() {
        for bad in ["fs..read", ".read", "fs.read;rm", "FS.READ", ""] {
            let yaml = format!("steps:\n  - tool: \"{}\"\n", bad);
            assert!(Plan::from_yaml(&yaml).is_err(), "expected rejection of '{}'", bad);
        }
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let yaml = "steps:\n  - tool: fs.read\nextra_key: true\n";
        assert!(Plan::from_yaml(yaml).is_err());
    }

    #[test]
    fn hash_is_stable_across_reparses() {
        let a = Plan::from_yaml(READ_PLAN).unwrap();
        let b = Plan::from_yaml(READ_PLAN).unwrap();
        assert_eq!(a.hash().unwrap(), b.hash().unwrap());
    }

    #[test]
    fn hash_changes_with_content() {
        let a = Plan::from_yaml(READ_PLAN).unwrap();
        let b = Plan::from_yaml(&READ_PLAN.replace("README", "CHANGELOG")).unwrap();
        assert_ne!(a.hash().unwrap(), b.hash().unwrap());
    }
}
