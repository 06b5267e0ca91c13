//! Exclusion ledger: files accumulated across retry attempts.
//!
//! The ledger lives for one `execute` call. It only ever grows, keeps paths
//! distinct in first-seen order, and is projected into the
//! `sonar.exclusions` property as comma-joined glob patterns. Any exclusion
//! value the caller configured up front is preserved and appended to, never
//! replaced.

use std::path::Path;

/// Ordered, deduplicated set of scanner-reported file paths.
#[derive(Debug, Clone, Default)]
pub struct ExclusionLedger {
    paths: Vec<String>,
}

impl ExclusionLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one path; returns false when it was already present.
    pub fn add(&mut self, path: impl Into<String>) -> bool {
        let path = path.into();
        if self.paths.iter().any(|p| *p == path) {
            return false;
        }
        self.paths.push(path);
        true
    }

    /// Add many paths; returns how many were new.
    pub fn add_all<I, S>(&mut self, paths: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut added = 0;
        for path in paths {
            if self.add(path) {
                added += 1;
            }
        }
        added
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    /// Excluded paths in first-seen order.
    pub fn paths(&self) -> &[String] {
        &self.paths
    }

    /// Glob patterns for the ledger: `**/<basename>` per file, plus the
    /// path itself (forward slashes) when it is not absolute.
    pub fn to_patterns(&self) -> Vec<String> {
        let mut patterns = Vec::new();
        for path in &self.paths {
            let normalized = path.replace('\\', "/");
            let basename = normalized.rsplit('/').next().unwrap_or(&normalized);
            push_unique(&mut patterns, format!("**/{}", basename));
            if !is_absolute_path(path) {
                push_unique(&mut patterns, normalized);
            }
        }
        patterns
    }

    /// Merge the ledger into an existing `sonar.exclusions` value.
    ///
    /// Returns `None` when the ledger is empty, meaning the property should
    /// be left exactly as the caller configured it.
    pub fn render(&self, prior: Option<&str>) -> Option<String> {
        if self.paths.is_empty() {
            return None;
        }

        let mut merged: Vec<String> = prior
            .into_iter()
            .flat_map(|v| v.split(','))
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(String::from)
            .collect();
        for pattern in self.to_patterns() {
            push_unique(&mut merged, pattern);
        }
        Some(merged.join(","))
    }
}

fn push_unique(patterns: &mut Vec<String>, candidate: String) {
    if !patterns.iter().any(|p| *p == candidate) {
        patterns.push(candidate);
    }
}

/// Absolute on the local platform, or a Windows drive path reported by a
/// scanner running elsewhere.
fn is_absolute_path(path: &str) -> bool {
    if Path::new(path).is_absolute() {
        return true;
    }
    let bytes = path.as_bytes();
    bytes.len() > 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}
