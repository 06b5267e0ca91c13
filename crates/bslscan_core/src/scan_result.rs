//! Result of one scanner attempt.
//!
//! One `ScanResult` is built per invocation; when the engine retries, the
//! failed attempt's result is discarded and a fresh one is started. Only the
//! final attempt's result reaches the caller.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Outcome and extracted facts of a single scanner run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanResult {
    /// True iff the scanner process exited with code 0.
    pub success: bool,
    /// Opaque analysis task id reported by the scanner (`task?id=...`).
    pub analysis_id: Option<String>,
    /// Project key echoed by the scanner.
    pub project_key: Option<String>,
    /// Wall-clock start of the attempt.
    pub started_at: DateTime<Utc>,
    /// Attempt duration in milliseconds.
    pub duration_ms: u64,
    /// Ordered, append-only diagnostic lines (errors, warnings, hints).
    pub diagnostics: Vec<String>,
    /// Named metrics parsed from the output, kept as raw strings.
    pub metrics: BTreeMap<String, String>,
}

impl ScanResult {
    /// Fresh result for an attempt starting now.
    pub fn new() -> Self {
        Self {
            success: false,
            analysis_id: None,
            project_key: None,
            started_at: Utc::now(),
            duration_ms: 0,
            diagnostics: Vec::new(),
            metrics: BTreeMap::new(),
        }
    }

    /// Append one diagnostic line.
    pub fn push_diagnostic(&mut self, line: impl Into<String>) {
        self.diagnostics.push(line.into());
    }

    /// Store a named metric, replacing any previous value.
    pub fn set_metric(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.metrics.insert(key.into(), value.into());
    }

    /// Look up a parsed metric.
    pub fn metric(&self, key: &str) -> Option<&str> {
        self.metrics.get(key).map(String::as_str)
    }

    /// One-line human summary for logs and CLI output.
    pub fn summary(&self) -> String {
        let state = if self.success { "succeeded" } else { "failed" };
        let project = self.project_key.as_deref().unwrap_or("<unknown project>");
        match &self.analysis_id {
            Some(id) => format!(
                "scan {} for {} in {}ms (analysis id {})",
                state, project, self.duration_ms, id
            ),
            None => format!("scan {} for {} in {}ms", state, project, self.duration_ms),
        }
    }
}

impl Default for ScanResult {
    fn default() -> Self {
        Self::new()
    }
}
