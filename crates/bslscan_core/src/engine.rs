//! The scan engine: invoke, parse, classify, remediate, retry.
//!
//! One `execute` call owns its whole run state (attempt counter, exclusion
//! ledger); the engine itself holds only the read-only job, so repeated
//! calls never share mutable state. Per attempt: invoke the scanner, parse
//! whatever output came back, return on exit 0, otherwise classify the
//! failure. Only the BSL tokenization signature retries: every named file
//! is repaired best-effort and excluded, then the scanner runs again with
//! the widened `sonar.exclusions`, up to `MAX_SCAN_RETRIES` retries.
//! Everything else (auth, network, configuration, timeout, cancellation)
//! fails fast on the first attempt.

use crate::bsl_doctor;
use crate::cancel::CancelToken;
use crate::classifier::{self, FailureCategory, FailureHeadline};
use crate::config::ScanJob;
use crate::exclusions::ExclusionLedger;
use crate::invoker::{InvokeError, InvokeRequest};
use crate::output_parser;
use crate::properties::{ScannerProperties, PROP_SONAR_EXCLUSIONS};
use crate::scan_result::ScanResult;
use std::path::{Path, PathBuf};
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Retries after the first attempt. A persistent tokenization failure gets
/// `MAX_SCAN_RETRIES + 1` invocations in total before the run is declared
/// exhausted.
pub const MAX_SCAN_RETRIES: u32 = 10;

/// Terminal failure of one scan run.
#[derive(Debug, Error)]
pub enum ScanFailure {
    /// The scanner process never started.
    #[error("failed to launch scanner: {source}")]
    Launch {
        #[source]
        source: std::io::Error,
    },

    /// The run failed for a cause retrying cannot help.
    #[error("scan failed ({}), exit code {}", .headline.as_str(), .exit_code)]
    Scanner {
        headline: FailureHeadline,
        category: FailureCategory,
        exit_code: i32,
        output: String,
        result: ScanResult,
    },

    /// The tokenization signature survived every allowed retry.
    #[error(
        "scan retries exhausted after {attempts} attempts; still failing: {}",
        .failing.join(", ")
    )]
    RetriesExhausted {
        attempts: u32,
        /// Every file excluded over the course of the run.
        excluded: Vec<String>,
        /// Files the final attempt still reported broken.
        failing: Vec<String>,
        output: String,
        result: ScanResult,
    },
}

impl ScanFailure {
    /// The final attempt's result, when one exists.
    pub fn result(&self) -> Option<&ScanResult> {
        match self {
            ScanFailure::Launch { .. } => None,
            ScanFailure::Scanner { result, .. } => Some(result),
            ScanFailure::RetriesExhausted { result, .. } => Some(result),
        }
    }

    /// Combined scanner output of the final attempt.
    pub fn output(&self) -> &str {
        match self {
            ScanFailure::Launch { .. } => "",
            ScanFailure::Scanner { output, .. } => output,
            ScanFailure::RetriesExhausted { output, .. } => output,
        }
    }
}

/// Drives scan runs for one job.
pub struct ScanEngine {
    job: ScanJob,
}

impl ScanEngine {
    pub fn new(job: ScanJob) -> Self {
        Self { job }
    }

    pub fn job(&self) -> &ScanJob {
        &self.job
    }

    /// Run without external cancellation.
    pub async fn execute_detached(&self) -> Result<ScanResult, ScanFailure> {
        self.execute(CancelToken::never()).await
    }

    /// Run the scan to a terminal outcome.
    pub async fn execute(&self, mut cancel: CancelToken) -> Result<ScanResult, ScanFailure> {
        let run_id = Uuid::new_v4();
        info!(
            "scan run {} starting: {} in {}",
            run_id,
            self.job.scanner_binary.display(),
            self.job.working_dir.display()
        );

        if self.job.sweep_before_scan {
            self.pre_scan_sweep();
        }

        let request = InvokeRequest::new(&self.job.scanner_binary, &self.job.working_dir)
            .with_timeout(self.job.timeout())
            .with_graceful_stop(self.job.graceful_stop);

        // Run state lives in this call frame, not in the engine.
        let mut ledger = ExclusionLedger::new();
        let mut attempt: u32 = 0;
        // Repair notes from the previous attempt, surfaced on the next
        // result so they reach the caller instead of dying with the
        // discarded failed attempt.
        let mut carried_notes: Vec<String> = Vec::new();

        loop {
            let properties = self.effective_properties(&ledger);
            let started = Instant::now();
            let mut result = ScanResult::new();
            for note in carried_notes.drain(..) {
                result.push_diagnostic(note);
            }

            info!(
                "run {} attempt {} ({} exclusions)",
                run_id,
                attempt + 1,
                ledger.len()
            );
            let outcome = request.run(&properties, &mut cancel).await;
            result.duration_ms = started.elapsed().as_millis() as u64;

            let failure = match outcome {
                Ok(output) => {
                    result.success = true;
                    output_parser::parse_output(&output, &mut result);
                    info!("run {}: {}", run_id, result.summary());
                    return Ok(result);
                }
                Err(InvokeError::Start(source)) => {
                    warn!("run {} could not start the scanner: {}", run_id, source);
                    return Err(ScanFailure::Launch { source });
                }
                Err(failure) => failure,
            };

            output_parser::parse_output(failure.output(), &mut result);
            let classification = classifier::classify(&failure);
            for line in &classification.diagnostics {
                result.push_diagnostic(line.clone());
            }
            debug!(
                "run {} attempt {} classified as {} ({})",
                run_id,
                attempt + 1,
                classification.category.as_str(),
                classification.headline.as_str()
            );

            let retryable = matches!(failure, InvokeError::Exit { .. })
                && classification.is_bsl_token_failure();
            if !retryable {
                warn!(
                    "run {} failed without a retryable cause: {}",
                    run_id, failure
                );
                let exit_code = failure.exit_code();
                return Err(ScanFailure::Scanner {
                    headline: classification.headline,
                    category: classification.category,
                    exit_code,
                    output: failure.into_output(),
                    result,
                });
            }

            if attempt >= MAX_SCAN_RETRIES {
                warn!(
                    "run {} exhausted {} attempts; {} file(s) still failing",
                    run_id,
                    attempt + 1,
                    classification.failing_bsl_files.len()
                );
                return Err(ScanFailure::RetriesExhausted {
                    attempts: attempt + 1,
                    excluded: ledger.paths().to_vec(),
                    failing: classification.failing_bsl_files.clone(),
                    output: failure.into_output(),
                    result,
                });
            }

            carried_notes = self.remediate(&classification.failing_bsl_files);
            let added = ledger.add_all(classification.failing_bsl_files.iter().cloned());
            info!(
                "run {}: excluded {} new file(s), retrying ({} total)",
                run_id,
                added,
                ledger.len()
            );
            attempt += 1;
        }
    }

    /// Best-effort repair of every file the classifier named. A failed
    /// repair is logged and the file still proceeds to exclusion.
    fn remediate(&self, files: &[String]) -> Vec<String> {
        let mut notes = Vec::new();
        for file in files {
            let path = self.resolve_source(file);
            match bsl_doctor::fix_file(&path) {
                Ok(outcome) if outcome.changed => {
                    info!("repaired {}", path.display());
                    notes.push(format!("attempted fix for {}", file));
                }
                Ok(_) => {
                    debug!("{} needed no repair", path.display());
                    notes.push(format!("attempted fix for {} (no changes)", file));
                }
                Err(err) => {
                    warn!("failed to fix {}: {}", path.display(), err);
                    notes.push(format!("failed to fix {}: {}", file, err));
                }
            }
        }
        notes
    }

    /// Scanner-reported paths are relative to the scanner's working dir.
    fn resolve_source(&self, reported: &str) -> PathBuf {
        let path = Path::new(reported);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.job.working_dir.join(path)
        }
    }

    /// Base properties plus the ledger folded into `sonar.exclusions`.
    /// A caller-supplied exclusion value survives; the ledger only appends.
    fn effective_properties(&self, ledger: &ExclusionLedger) -> ScannerProperties {
        let mut properties = ScannerProperties::from_map(self.job.properties.clone());
        let prior = self.job.properties.get(PROP_SONAR_EXCLUSIONS).map(String::as_str);
        if let Some(value) = ledger.render(prior) {
            properties.set(PROP_SONAR_EXCLUSIONS, value);
        }
        properties
    }

    /// Proactive doctor pass over the working directory. Failures here are
    /// logged and never block the scan.
    fn pre_scan_sweep(&self) {
        match bsl_doctor::sweep(&self.job.working_dir, self.job.sweep_dry_run) {
            Ok(report) => {
                if report.flagged.is_empty() {
                    debug!("pre-scan sweep found nothing to fix");
                } else {
                    info!(
                        "pre-scan sweep: {} flagged, {} repaired",
                        report.flagged.len(),
                        report.repaired
                    );
                }
            }
            Err(err) => warn!("pre-scan sweep failed: {}", err),
        }
    }
}
