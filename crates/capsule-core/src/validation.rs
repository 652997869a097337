//! Answer validation for agent sessions.
//!
//! Small planners like to invent file paths in their final answers. This
//! module extracts path-like strings from the planner's final output and
//! compares them to the set of paths the run actually touched; anything
//! unaccounted for is reported as a warning. Validation never blocks
//! completion — it annotates it.

use std::collections::BTreeSet;
use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

/// Keys whose string values are treated as paths when scanning objects.
const PATH_KEYS: &[&str] = &["file", "file_path", "filepath", "filename", "path"];

/// Result of validating a final answer against the accessed-path set.
#[derive(Debug, Clone, Default)]
pub struct AnswerValidation {
    /// True when every referenced path was actually accessed.
    pub is_valid: bool,
    /// Paths mentioned in the answer but never touched by a tool.
    pub hallucinated_paths: Vec<String>,
    /// The accessed set the answer was compared against.
    pub accessed_paths: Vec<String>,
}

/// Extract path-like strings from an arbitrary JSON value.
///
/// Scans well-known object keys, and free text for quoted `./…` or `/…`
/// tokens.
pub fn extract_paths(value: &Value) -> BTreeSet<String> {
    let mut paths = BTreeSet::new();
    collect(value, &mut paths);
    paths
}

fn collect(value: &Value, out: &mut BTreeSet<String>) {
    match value {
        Value::String(text) => {
            // Free-form text: pull quoted or bare ./-and-/-prefixed tokens.
            for capture in text_path_pattern().captures_iter(text) {
                if let Some(m) = capture.get(1) {
                    out.insert(m.as_str().to_string());
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                collect(item, out);
            }
        }
        Value::Object(map) => {
            for (key, item) in map {
                if PATH_KEYS.contains(&key.as_str()) {
                    if let Value::String(s) = item {
                        if looks_like_path(s) {
                            out.insert(s.clone());
                        }
                        continue;
                    }
                }
                collect(item, out);
            }
        }
        _ => {}
    }
}

fn text_path_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r#"["'`]((?:\./|/)[A-Za-z0-9_./\-]+)["'`]"#).expect("static regex is valid")
    })
}

fn looks_like_path(text: &str) -> bool {
    (text.contains('/') || text.contains('.')) && !text.contains(' ') && text.len() > 1
}

/// Compare the paths referenced by `final_output` to the accessed set.
pub fn validate_answer(final_output: &Value, accessed: &[String]) -> AnswerValidation {
    let normalized_accessed: BTreeSet<String> =
        accessed.iter().map(|p| normalize(p)).collect();

    let mut hallucinated = Vec::new();
    for mentioned in extract_paths(final_output) {
        let norm = normalize(&mentioned);
        let known = normalized_accessed.iter().any(|acc| {
            acc == &norm || acc.ends_with(&format!("/{}", norm)) || norm.ends_with(&format!("/{}", acc))
        });
        if !known {
            hallucinated.push(mentioned);
        }
    }

    AnswerValidation {
        is_valid: hallucinated.is_empty(),
        hallucinated_paths: hallucinated,
        accessed_paths: accessed.to_vec(),
    }
}

fn normalize(path: &str) -> String {
    path.trim_start_matches("./").trim_end_matches('/').to_string()
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn extracts_paths_from_known_keys_and_text() {
        let output = json!({
            "summary": "Checked './src/main.rs' and '/etc/hosts' for issues",
            "findings": [
                {"file": "./src/lib.rs", "line": 10},
                {"path": "docs/guide.md"}
            ]
        });
        let paths = extract_paths(&output);
        assert!(paths.contains("./src/main.rs"));
        assert!(paths.contains("/etc/hosts"));
        assert!(paths.contains("./src/lib.rs"));
        assert!(paths.contains("docs/guide.md"));
    }

    #[test]
    fn answer_referencing_only_accessed_paths_is_valid() {
        let output = json!({"file": "./notes.txt", "summary": "read './notes.txt' fully"});
        let validation = validate_answer(&output, &["./notes.txt".to_string()]);
        assert!(validation.is_valid, "{:?}", validation.hallucinated_paths);
    }

    #[test]
    fn invented_paths_are_flagged_without_blocking() {
        let output = json!({
            "findings": [
                {"file": "./real.txt"},
                {"file": "./figment.txt"}
            ]
        });
        let validation = validate_answer(&output, &["./real.txt".to_string()]);
        assert!(!validation.is_valid);
        assert_eq!(validation.hallucinated_paths, vec!["./figment.txt"]);
    }

    #[test]
    fn plain_words_are_not_mistaken_for_paths() {
        let output = json!({"summary": "All done. Nothing else to report."});
        let validation = validate_answer(&output, &[]);
        assert!(validation.is_valid);
    }
}
