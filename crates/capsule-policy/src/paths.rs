//! Path canonicalization and glob matching for filesystem policy rules.
//!
//! All matching happens on canonical absolute paths: `..` resolved,
//! symlinks followed along every component, redundant separators gone. A
//! raw caller-supplied path never reaches the match step.
//!
//! Pattern dialect: `**` matches any number of path segments (including
//! zero), `*` matches within a single segment, `?` matches one character.
//! Patterns may be relative, in which case they anchor at the working
//! directory.

use std::io;
use std::path::{Component, Path, PathBuf};

/// Resolve a caller path for a read: every component must exist.
pub fn canonicalize_existing(path_str: &str, working_dir: &Path) -> io::Result<PathBuf> {
    std::fs::canonicalize(join_working_dir(path_str, working_dir))
}

/// Resolve a caller path for a write.
///
/// The nearest existing ancestor is canonicalized (symlinks followed) and
/// the not-yet-existing remainder is re-appended after lexical
/// normalization, so `..` can never smuggle the target outside the
/// resolved ancestor. An existing target is canonicalized in full.
pub fn canonicalize_for_write(path_str: &str, working_dir: &Path) -> io::Result<PathBuf> {
    let joined = join_working_dir(path_str, working_dir);
    if joined.exists() {
        return std::fs::canonicalize(&joined);
    }
    let normalized = lexical_normalize(&joined);

    let mut existing = normalized.as_path();
    let mut remainder = Vec::new();
    while !existing.exists() {
        let name = existing.file_name().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "no existing ancestor to resolve against")
        })?;
        remainder.push(name.to_os_string());
        existing = existing
            .parent()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no parent"))?;
    }

    let mut canonical = std::fs::canonicalize(existing)?;
    for name in remainder.iter().rev() {
        canonical.push(name);
    }
    Ok(canonical)
}

fn join_working_dir(path_str: &str, working_dir: &Path) -> PathBuf {
    let path = Path::new(path_str);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        working_dir.join(path)
    }
}

/// Purely textual normalization: drops `.` and resolves `..` against the
/// components seen so far, without touching the filesystem. Used to decide
/// whether a denial stems from a symlink escape (the lexical form matched
/// an allow pattern but the canonical form did not).
pub fn lexical_normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push(Component::ParentDir);
                }
            }
            other => out.push(other),
        }
    }
    out
}

/// Whether any normal component of `path` is a dotfile.
pub fn has_hidden_component(path: &Path) -> bool {
    path.components().any(|c| match c {
        Component::Normal(name) => name.to_string_lossy().starts_with('.'),
        _ => false,
    })
}

/// A policy glob pattern, anchored and split into a literal base plus glob
/// segments.
///
/// The base is the prefix up to the first wildcard component. It is
/// canonicalized at compile time so system symlinks in ancestor
/// directories (`/var` → `/private/var`) line up with canonical candidate
/// paths. Candidates match only when they live under the resolved base and
/// their remaining segments satisfy the glob.
#[derive(Debug, Clone)]
pub struct PathPattern {
    raw: String,
    /// Literal prefix as written (relative patterns anchored at the
    /// working directory). Checked for being a symlink at evaluation time.
    base: PathBuf,
    /// Canonical form of `base`; falls back to the lexical form when the
    /// base does not exist yet.
    resolved_base: PathBuf,
    /// Glob segments following the base.
    segments: Vec<String>,
}

impl PathPattern {
    pub fn compile(pattern: &str, working_dir: &Path) -> Self {
        let anchored = join_working_dir(pattern, working_dir);

        let mut base = PathBuf::new();
        let mut segments = Vec::new();
        let mut in_glob = false;
        for component in anchored.components() {
            match component {
                Component::Normal(name) => {
                    let name = name.to_string_lossy().into_owned();
                    if in_glob || name.contains('*') || name.contains('?') {
                        in_glob = true;
                        segments.push(name);
                    } else {
                        base.push(name);
                    }
                }
                Component::CurDir => {}
                other => {
                    if !in_glob {
                        base.push(other);
                    }
                }
            }
        }
        let base = lexical_normalize(&base);
        let resolved_base = std::fs::canonicalize(&base).unwrap_or_else(|_| base.clone());

        Self { raw: pattern.to_string(), base, resolved_base, segments }
    }

    /// The pattern as written in the policy, for rule-hit reporting.
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Whether `candidate` (a canonical absolute path) matches.
    pub fn matches(&self, candidate: &Path) -> bool {
        let Ok(rest) = candidate.strip_prefix(&self.resolved_base) else {
            return false;
        };
        let components: Vec<&str> = rest
            .components()
            .filter_map(|c| match c {
                Component::Normal(name) => name.to_str(),
                _ => None,
            })
            .collect();
        if self.segments.is_empty() {
            // A literal pattern matches only itself.
            return components.is_empty();
        }
        match_segments(&self.segments, &components)
    }

    /// Whether `candidate` matches against the pattern's base as written,
    /// with no symlink resolution. Used to tell a symlink escape (the
    /// written path was in bounds, its target was not) from a plainly
    /// out-of-bounds path.
    pub fn matches_lexical(&self, candidate: &Path) -> bool {
        let Ok(rest) = candidate.strip_prefix(&self.base) else {
            return false;
        };
        let components: Vec<&str> = rest
            .components()
            .filter_map(|c| match c {
                Component::Normal(name) => name.to_str(),
                _ => None,
            })
            .collect();
        if self.segments.is_empty() {
            return components.is_empty();
        }
        match_segments(&self.segments, &components)
    }

    /// The base-integrity half of the symlink escape check: an allow
    /// pattern whose literal base is itself a symlink would silently widen
    /// the allowed area to wherever the link points.
    pub fn base_is_symlink(&self) -> bool {
        std::fs::symlink_metadata(&self.base)
            .map(|m| m.file_type().is_symlink())
            .unwrap_or(false)
    }
}

fn match_segments(segments: &[String], components: &[&str]) -> bool {
    match segments.first() {
        None => components.is_empty(),
        Some(seg) if seg == "**" => (0..=components.len())
            .any(|skip| match_segments(&segments[1..], &components[skip..])),
        Some(seg) => {
            !components.is_empty()
                && match_segment(seg, components[0])
                && match_segments(&segments[1..], &components[1..])
        }
    }
}

fn match_segment(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    match_chars(&p, &t)
}

fn match_chars(pattern: &[char], text: &[char]) -> bool {
    match pattern.first() {
        None => text.is_empty(),
        Some('*') => (0..=text.len()).any(|skip| match_chars(&pattern[1..], &text[skip..])),
        Some('?') => !text.is_empty() && match_chars(&pattern[1..], &text[1..]),
        Some(c) => text.first() == Some(c) && match_chars(&pattern[1..], &text[1..]),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
