//! Command handlers for bslscanctl.

use anyhow::{bail, Context, Result};
use bslscan_core::bsl_doctor;
use bslscan_core::{cancel_pair, ScanEngine, ScanFailure, ScanJob, ScanResult};
use owo_colors::OwoColorize;
use std::path::PathBuf;

/// Scan failed for a cause retrying cannot help, or the sweep hit errors.
const EXIT_FAILED: i32 = 1;
/// Tokenization failures survived every allowed retry.
const EXIT_RETRIES_EXHAUSTED: i32 = 2;

/// Handle scan command
pub async fn scan(
    config: PathBuf,
    defines: Vec<String>,
    sweep: bool,
    dry_run: bool,
    json: bool,
) -> Result<()> {
    let mut job = ScanJob::load(&config)
        .with_context(|| format!("failed to load job file {}", config.display()))?;

    for define in &defines {
        let (key, value) = parse_define(define)?;
        job.properties.insert(key, value);
    }
    if sweep {
        job.sweep_before_scan = true;
    }
    if dry_run {
        job.sweep_dry_run = true;
    }
    job.validate()?;

    let (handle, token) = cancel_pair();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!();
            eprintln!("[INFO] interrupt received, stopping the scanner");
            handle.cancel();
        }
    });

    let engine = ScanEngine::new(job);
    match engine.execute(token).await {
        Ok(result) => {
            if json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                print_scan_success(&result);
            }
            Ok(())
        }
        Err(failure) => {
            let exit_code = match &failure {
                ScanFailure::RetriesExhausted { .. } => EXIT_RETRIES_EXHAUSTED,
                _ => EXIT_FAILED,
            };
            if json {
                print_failure_json(&failure)?;
            } else {
                print_scan_failure(&failure);
            }
            std::process::exit(exit_code);
        }
    }
}

/// Handle sweep command
pub async fn sweep(path: PathBuf, dry_run: bool, json: bool) -> Result<()> {
    let report = bsl_doctor::sweep(&path, dry_run)
        .with_context(|| format!("sweep of {} failed", path.display()))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!();
        if report.flagged.is_empty() {
            println!(
                "[OK] {} file(s) examined, nothing to fix",
                report.examined.to_string().green()
            );
        } else {
            let action = if report.dry_run { "would repair" } else { "repaired" };
            println!(
                "[{}] {} file(s) examined, {} flagged, {} {}",
                if report.dry_run { "DRY RUN" } else { "OK" },
                report.examined,
                report.flagged.len().to_string().yellow(),
                if report.dry_run {
                    report.flagged.len()
                } else {
                    report.repaired
                },
                action
            );
            for file in &report.flagged {
                println!("  * {}", file.yellow());
            }
        }
        if report.failed > 0 {
            println!(
                "[WARNING] {} file(s) could not be processed",
                report.failed.to_string().red()
            );
        }
        println!();
    }

    if report.failed > 0 {
        std::process::exit(EXIT_FAILED);
    }
    Ok(())
}

/// Handle check command
pub async fn check(file: PathBuf) -> Result<()> {
    let problems = bsl_doctor::detect_problems(&file)
        .with_context(|| format!("cannot inspect {}", file.display()))?;

    println!();
    if problems.is_empty() {
        println!("[OK] {} is clean", file.display().to_string().green());
        println!();
        return Ok(());
    }

    println!("[PROBLEMS] {}", file.display().to_string().yellow());
    for problem in &problems {
        println!("  * {}", problem.as_str());
    }
    println!();
    println!("[HINT] run `bslscanctl sweep {}` on the tree, or fix by hand", file.display());
    println!();
    std::process::exit(EXIT_FAILED);
}

fn print_scan_success(result: &ScanResult) {
    println!();
    println!("[OK] {}", result.summary().green());

    if !result.metrics.is_empty() {
        println!();
        println!("[METRICS]");
        for (key, value) in &result.metrics {
            println!("  {:24} {}", key, value);
        }
    }

    if !result.diagnostics.is_empty() {
        println!();
        println!("[NOTES]");
        for line in &result.diagnostics {
            println!("  * {}", line.yellow());
        }
    }
    println!();
}

fn print_scan_failure(failure: &ScanFailure) {
    eprintln!();
    eprintln!("[ERROR] {}", failure.to_string().red());

    match failure {
        ScanFailure::Launch { .. } => {}
        ScanFailure::Scanner { category, .. } => {
            eprintln!("        category: {}", category.as_str());
        }
        ScanFailure::RetriesExhausted { excluded, failing, .. } => {
            if !excluded.is_empty() {
                eprintln!();
                eprintln!("[EXCLUDED]");
                for path in excluded {
                    eprintln!("  * {}", path.yellow());
                }
            }
            if !failing.is_empty() {
                eprintln!();
                eprintln!("[STILL FAILING]");
                for path in failing {
                    eprintln!("  * {}", path.red());
                }
            }
        }
    }

    if let Some(result) = failure.result() {
        if !result.diagnostics.is_empty() {
            eprintln!();
            eprintln!("[DIAGNOSTICS]");
            for line in &result.diagnostics {
                eprintln!("  * {}", line.yellow());
            }
        }
    }
    eprintln!();
}

fn print_failure_json(failure: &ScanFailure) -> Result<()> {
    let body = match failure.result() {
        Some(result) => serde_json::to_value(result)?,
        None => serde_json::json!({ "success": false }),
    };
    let wrapped = serde_json::json!({
        "error": failure.to_string(),
        "result": body,
    });
    println!("{}", serde_json::to_string_pretty(&wrapped)?);
    Ok(())
}

/// Split a `key=value` scanner property override on the first `=`.
fn parse_define(raw: &str) -> Result<(String, String)> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => bail!("invalid property override '{}', expected key=value", raw),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_define_splits_on_first_equals() {
        let (key, value) = parse_define("sonar.host.url=http://sonar:9000").unwrap();
        assert_eq!(key, "sonar.host.url");
        assert_eq!(value, "http://sonar:9000");
    }

    #[test]
    fn test_parse_define_trims_the_key_only() {
        let (key, value) = parse_define(" sonar.login = squ_abc ").unwrap();
        assert_eq!(key, "sonar.login");
        assert_eq!(value, " squ_abc ");
    }

    #[test]
    fn test_parse_define_allows_empty_value() {
        let (key, value) = parse_define("sonar.exclusions=").unwrap();
        assert_eq!(key, "sonar.exclusions");
        assert_eq!(value, "");
    }

    #[test]
    fn test_parse_define_rejects_malformed_input() {
        assert!(parse_define("sonar.host.url").is_err());
        assert!(parse_define("=value").is_err());
        assert!(parse_define("   =value").is_err());
    }
}
