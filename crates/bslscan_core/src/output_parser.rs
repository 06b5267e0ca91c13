//! Best-effort parser for captured scanner output.
//!
//! The scanner's console text is not a stable, versioned protocol, so every
//! matcher here is independent, applied per line, and unrecognized lines are
//! silently skipped. Parsing never fails; it only fills in whatever facts it
//! can find.

use crate::scan_result::ScanResult;
use once_cell::sync::Lazy;
use regex::Regex;

/// Metric keys populated by [`parse_output`].
pub const METRIC_EXECUTION_TIME: &str = "execution_time";
pub const METRIC_MEMORY: &str = "memory";
pub const METRIC_ISSUES: &str = "issues";
pub const METRIC_COVERAGE: &str = "coverage";
pub const METRIC_DUPLICATED_LINES: &str = "duplicated_lines_density";
pub const METRIC_LINES_OF_CODE: &str = "lines_of_code";
pub const METRIC_COMPLEXITY: &str = "complexity";
pub const METRIC_TECHNICAL_DEBT: &str = "technical_debt";
pub const METRIC_QUALITY_GATE: &str = "quality_gate";
pub const METRIC_WARNINGS: &str = "warnings";

static RE_ANALYSIS_ID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"task\?id=([A-Za-z0-9_-]+)").unwrap());
static RE_PROJECT_KEY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Project key:\s*(\S+)").unwrap());
static RE_TOTAL_TIME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Total time:\s*([0-9][0-9.:]*)s").unwrap());
static RE_FINAL_MEMORY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Final Memory:\s*([0-9]+M/[0-9]+M)").unwrap());
static RE_ISSUES_FOUND: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"([0-9]+)\s+issues?\s+found").unwrap());
static RE_COVERAGE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)coverage\D*?([0-9]+(?:\.[0-9]+)?)%").unwrap());
static RE_DUPLICATED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)duplicated lines\D*?([0-9]+(?:\.[0-9]+)?)%").unwrap());
static RE_LINES_OF_CODE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)([0-9][0-9,]*)\s+lines of code").unwrap());
static RE_COMPLEXITY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)cyclomatic complexity\D*?([0-9]+)").unwrap());
static RE_TECHNICAL_DEBT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)technical debt\D*?([0-9]+(?:\.[0-9]+)?\s*(?:min|h|d)?)").unwrap()
});

const QUALITY_GATE_PASSED: &str = "QUALITY GATE STATUS: PASSED";
const QUALITY_GATE_FAILED: &str = "QUALITY GATE STATUS: FAILED";

/// Scan the raw combined output line by line and fill `result` in place.
///
/// Matchers are non-exclusive: one line may feed several fields. Repeated
/// matches overwrite earlier ones, so the last occurrence in the output wins.
pub fn parse_output(raw: &str, result: &mut ScanResult) {
    let mut warnings: u32 = 0;

    for line in raw.lines() {
        let line = line.trim();

        if let Some(caps) = RE_ANALYSIS_ID.captures(line) {
            result.analysis_id = Some(caps[1].to_string());
        }
        if let Some(caps) = RE_PROJECT_KEY.captures(line) {
            result.project_key = Some(caps[1].to_string());
        }

        capture_metric(&RE_TOTAL_TIME, line, result, METRIC_EXECUTION_TIME);
        capture_metric(&RE_FINAL_MEMORY, line, result, METRIC_MEMORY);
        capture_metric(&RE_ISSUES_FOUND, line, result, METRIC_ISSUES);
        capture_metric(&RE_COVERAGE, line, result, METRIC_COVERAGE);
        capture_metric(&RE_DUPLICATED, line, result, METRIC_DUPLICATED_LINES);
        capture_metric(&RE_LINES_OF_CODE, line, result, METRIC_LINES_OF_CODE);
        capture_metric(&RE_COMPLEXITY, line, result, METRIC_COMPLEXITY);
        capture_metric(&RE_TECHNICAL_DEBT, line, result, METRIC_TECHNICAL_DEBT);

        if line.contains(QUALITY_GATE_PASSED) {
            result.set_metric(METRIC_QUALITY_GATE, "PASSED");
        } else if line.contains(QUALITY_GATE_FAILED) {
            result.set_metric(METRIC_QUALITY_GATE, "FAILED");
        }

        if let Some(rest) = line.strip_prefix("ERROR:") {
            result.push_diagnostic(rest.trim().to_string());
        } else if let Some(rest) = line.strip_prefix("WARN:") {
            result.push_diagnostic(format!("Warning: {}", rest.trim()));
            warnings += 1;
        }
    }

    if warnings > 0 {
        result.set_metric(METRIC_WARNINGS, warnings.to_string());
    }
}

fn capture_metric(re: &Regex, line: &str, result: &mut ScanResult, key: &str) {
    if let Some(caps) = re.captures(line) {
        result.set_metric(key, caps[1].trim().to_string());
    }
}
