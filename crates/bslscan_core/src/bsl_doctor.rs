//! Heuristic repair for malformed BSL source files.
//!
//! The scanner's lexer rejects files with encoding artifacts that 1C
//! designer exports accumulate over the years: CRLF/CR line endings, UTF-8
//! BOMs, non-breaking spaces, unbalanced quotes, stray control characters.
//! The doctor applies best-effort, grammar-free repairs:
//! - strip a leading byte-order mark
//! - normalize CRLF (and stray CR) to LF
//! - replace non-breaking spaces with regular spaces
//! - drop characters outside the allow-list (ASCII + Cyrillic letters,
//!   digits, whitespace, common punctuation)
//! - insert a missing space before a bare `//` comment marker
//! - canonicalize the casing of `Процедура` / `КонецПроцедуры`
//! - strip trailing horizontal whitespace per line
//! - append a closing quote to non-comment lines with an odd quote count
//! - ensure exactly one trailing newline
//!
//! Pass order is chosen so a single application reaches the fixpoint:
//! repairing an already-repaired file changes nothing and writes no second
//! backup. Before any content change the original bytes go to a `.backup`
//! sibling whose SHA-256 digest is verified against the source.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// File extensions the doctor will touch.
pub const REPAIRABLE_EXTENSIONS: &[&str] = &["bsl", "os"];

/// Punctuation that may appear in BSL source. Everything else outside
/// letters, digits and whitespace is dropped by the syntax pass.
const ALLOWED_PUNCTUATION: &str = "\"'().,;:!?+-*/%<>=#&~[]{}^@$_|\\";

const UTF8_BOM: &[u8] = &[0xEF, 0xBB, 0xBF];

static RE_KEYWORD_END_PROCEDURE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bконецпроцедуры\b").unwrap());
static RE_KEYWORD_PROCEDURE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bпроцедура\b").unwrap());

/// Doctor failure surface.
#[derive(Debug, Error)]
pub enum DoctorError {
    #[error("file not found: {0}")]
    NotFound(PathBuf),

    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("backup verification failed for {0}: digest mismatch")]
    BackupMismatch(PathBuf),
}

/// Detection signatures shared by `detect_problems` and the repair pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProblemKind {
    /// CRLF or stray CR line endings.
    CarriageReturns,
    /// Leading UTF-8 byte-order mark.
    ByteOrderMark,
    /// U+00A0 in source text.
    NonBreakingSpaces,
    /// Odd quote count on a non-comment line.
    UnbalancedQuotes,
    /// Characters outside the allow-list.
    DisallowedCharacters,
}

impl ProblemKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProblemKind::CarriageReturns => "carriage returns",
            ProblemKind::ByteOrderMark => "byte-order mark",
            ProblemKind::NonBreakingSpaces => "non-breaking spaces",
            ProblemKind::UnbalancedQuotes => "unbalanced quotes",
            ProblemKind::DisallowedCharacters => "disallowed characters",
        }
    }
}

/// What `fix_file` did to one file.
#[derive(Debug, Clone)]
pub struct FixOutcome {
    /// True when the file content was rewritten.
    pub changed: bool,
    /// Backup written before the rewrite, if any.
    pub backup: Option<PathBuf>,
}

/// Result of a proactive sweep over a source tree.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    /// `.bsl`/`.os` files examined.
    pub examined: usize,
    /// Files the detection signatures flagged.
    pub flagged: Vec<String>,
    /// Files actually rewritten.
    pub repaired: usize,
    /// Files that could not be read or fixed.
    pub failed: usize,
    /// True when the sweep only reported and did not write.
    pub dry_run: bool,
}

/// Repair one file in place.
///
/// Reads the file (lossy for near-UTF-8 content), applies the repair
/// pipeline to an in-memory copy and writes back only when the content
/// actually changed, placing the original bytes in a `.backup` sibling
/// first.
pub fn fix_file(path: &Path) -> Result<FixOutcome, DoctorError> {
    if !path.exists() {
        return Err(DoctorError::NotFound(path.to_path_buf()));
    }

    let original = read_bytes(path)?;
    if original.is_empty() {
        return Ok(FixOutcome {
            changed: false,
            backup: None,
        });
    }

    let text = String::from_utf8_lossy(&original);
    let repaired = repair_text(&text);

    if repaired.as_bytes() == original.as_slice() {
        debug!("no repair needed for {}", path.display());
        return Ok(FixOutcome {
            changed: false,
            backup: None,
        });
    }

    let backup = backup_path_for(path);
    write_backup(&backup, &original)?;
    fs::write(path, repaired.as_bytes()).map_err(|source| DoctorError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    info!(
        "repaired {} ({} -> {} bytes, backup at {})",
        path.display(),
        original.len(),
        repaired.len(),
        backup.display()
    );
    Ok(FixOutcome {
        changed: true,
        backup: Some(backup),
    })
}

/// Read-only companion to `fix_file`: apply the detection signatures
/// without touching the file.
pub fn detect_problems(path: &Path) -> Result<Vec<ProblemKind>, DoctorError> {
    if !path.exists() {
        return Err(DoctorError::NotFound(path.to_path_buf()));
    }

    let bytes = read_bytes(path)?;
    let text = String::from_utf8_lossy(&bytes);
    let mut problems = Vec::new();

    if text.contains('\r') {
        problems.push(ProblemKind::CarriageReturns);
    }
    if bytes.starts_with(UTF8_BOM) {
        problems.push(ProblemKind::ByteOrderMark);
    }
    if text.contains('\u{00A0}') {
        problems.push(ProblemKind::NonBreakingSpaces);
    }

    let unbalanced = text.lines().any(|line| {
        !line.trim_start().starts_with("//") && quote_count(line) % 2 == 1
    });
    if unbalanced {
        problems.push(ProblemKind::UnbalancedQuotes);
    }

    // The leading BOM and line endings are reported separately above.
    let body = text.strip_prefix('\u{FEFF}').unwrap_or(&text);
    let disallowed = body
        .chars()
        .any(|c| c != '\n' && c != '\r' && c != '\u{00A0}' && !is_allowed_char(c));
    if disallowed {
        problems.push(ProblemKind::DisallowedCharacters);
    }

    Ok(problems)
}

/// True when any detection signature fires for the file.
pub fn is_problematic(path: &Path) -> Result<bool, DoctorError> {
    Ok(!detect_problems(path)?.is_empty())
}

/// Proactive pass over a source tree: flag problematic `.bsl`/`.os` files
/// and, unless `dry_run`, fix them before the first scan attempt. Runs
/// independently of the reactive retry path.
pub fn sweep(root: &Path, dry_run: bool) -> Result<SweepReport, DoctorError> {
    if !root.exists() {
        return Err(DoctorError::NotFound(root.to_path_buf()));
    }

    let mut report = SweepReport {
        dry_run,
        ..Default::default()
    };

    for entry in WalkDir::new(root).follow_links(false) {
        let entry = match entry {
            Ok(e) => e,
            Err(err) => {
                warn!("sweep: skipping unreadable entry: {}", err);
                report.failed += 1;
                continue;
            }
        };
        if !entry.file_type().is_file() || !has_repairable_extension(entry.path()) {
            continue;
        }

        report.examined += 1;
        let problems = match detect_problems(entry.path()) {
            Ok(p) => p,
            Err(err) => {
                warn!("sweep: cannot inspect {}: {}", entry.path().display(), err);
                report.failed += 1;
                continue;
            }
        };
        if problems.is_empty() {
            continue;
        }

        let labels: Vec<&str> = problems.iter().map(ProblemKind::as_str).collect();
        debug!("{}: {}", entry.path().display(), labels.join(", "));
        report.flagged.push(entry.path().display().to_string());

        if !dry_run {
            match fix_file(entry.path()) {
                Ok(outcome) if outcome.changed => report.repaired += 1,
                Ok(_) => {}
                Err(err) => {
                    warn!("sweep: failed to fix {}: {}", entry.path().display(), err);
                    report.failed += 1;
                }
            }
        }
    }

    info!(
        "sweep of {} complete: {} examined, {} flagged, {} repaired, {} failed{}",
        root.display(),
        report.examined,
        report.flagged.len(),
        report.repaired,
        report.failed,
        if dry_run { " (dry run)" } else { "" }
    );
    Ok(report)
}

/// The full repair pipeline over in-memory text.
///
/// Whole-file passes first (BOM, line endings, NBSP), then the per-line
/// syntax pass, then the trailing-newline rule. One application reaches the
/// fixpoint.
fn repair_text(original: &str) -> String {
    let text = original.strip_prefix('\u{FEFF}').unwrap_or(original);
    let text = text.replace("\r\n", "\n").replace('\r', "\n");
    let text = text.replace('\u{00A0}', " ");

    let mut lines: Vec<String> = text.split('\n').map(repair_line).collect();
    while lines.len() > 1 && lines.last().map(|l| l.is_empty()).unwrap_or(false) {
        lines.pop();
    }

    let mut repaired = lines.join("\n");
    repaired.push('\n');
    repaired
}

/// Per-line syntax pass. Quote balancing runs last so the appended quote is
/// the final character and never leaves trailing whitespace behind.
fn repair_line(line: &str) -> String {
    let filtered: String = line.chars().filter(|&c| is_allowed_char(c)).collect();
    let spaced = space_comment_marker(&filtered);
    let cased = canonicalize_keywords(&spaced);
    let trimmed = cased.trim_end().to_string();
    balance_quotes(trimmed)
}

fn is_allowed_char(c: char) -> bool {
    c.is_ascii_alphanumeric()
        || is_cyrillic(c)
        || c == ' '
        || c == '\t'
        || ALLOWED_PUNCTUATION.contains(c)
}

fn is_cyrillic(c: char) -> bool {
    matches!(c, '\u{0400}'..='\u{04FF}')
}

/// Insert a space before the first bare `//` marker that sits outside a
/// string literal and directly after a non-space character.
fn space_comment_marker(line: &str) -> String {
    let chars: Vec<char> = line.chars().collect();
    let mut in_string = false;

    for i in 0..chars.len() {
        let c = chars[i];
        if c == '"' {
            in_string = !in_string;
            continue;
        }
        if !in_string && c == '/' && chars.get(i + 1) == Some(&'/') {
            let needs_space = i > 0 && !chars[i - 1].is_whitespace();
            if needs_space {
                let head: String = chars[..i].iter().collect();
                let tail: String = chars[i..].iter().collect();
                return format!("{} {}", head, tail);
            }
            return line.to_string();
        }
    }
    line.to_string()
}

fn canonicalize_keywords(line: &str) -> String {
    let line = RE_KEYWORD_END_PROCEDURE.replace_all(line, "КонецПроцедуры");
    RE_KEYWORD_PROCEDURE
        .replace_all(&line, "Процедура")
        .into_owned()
}

fn balance_quotes(line: String) -> String {
    if line.trim_start().starts_with("//") {
        return line;
    }
    if quote_count(&line) % 2 == 1 {
        let mut line = line;
        line.push('"');
        return line;
    }
    line
}

fn quote_count(line: &str) -> usize {
    line.chars().filter(|&c| c == '"').count()
}

fn has_repairable_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| REPAIRABLE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

fn backup_path_for(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".backup");
    PathBuf::from(name)
}

fn read_bytes(path: &Path) -> Result<Vec<u8>, DoctorError> {
    fs::read(path).map_err(|source| DoctorError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Write the original bytes to the backup sibling and verify the copy by
/// digest before the source file is touched.
fn write_backup(backup: &Path, original: &[u8]) -> Result<(), DoctorError> {
    fs::write(backup, original).map_err(|source| DoctorError::Io {
        path: backup.to_path_buf(),
        source,
    })?;
    let written = read_bytes(backup)?;
    if sha256_hex(&written) != sha256_hex(original) {
        return Err(DoctorError::BackupMismatch(backup.to_path_buf()));
    }
    Ok(())
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}
