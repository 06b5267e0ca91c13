//! Scan job configuration.
//!
//! Loaded from a TOML file by the control CLI and consumed read-only by the
//! engine. Example `bslscan.toml`:
//!
//! ```toml
//! scanner_binary = "/opt/sonar-scanner/bin/sonar-scanner"
//! working_dir = "/srv/ci/erp"
//! timeout_secs = 3600
//! graceful_stop = true
//! sweep_before_scan = false
//! sweep_dry_run = false
//!
//! [properties]
//! "sonar.host.url" = "https://sonar.example.org"
//! "sonar.projectKey" = "erp-main"
//! "sonar.sources" = "src"
//! ```

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

fn default_timeout_secs() -> u64 {
    60 * 60
}

fn default_graceful_stop() -> bool {
    true
}

/// Everything one scan run needs to know.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanJob {
    /// Scanner executable to launch.
    pub scanner_binary: PathBuf,

    /// Working directory for the scanner process (the project base dir).
    pub working_dir: PathBuf,

    /// Wall-clock limit for one scanner run, in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// SIGINT plus a grace period on cancellation instead of an immediate
    /// kill.
    #[serde(default = "default_graceful_stop")]
    pub graceful_stop: bool,

    /// Run the file doctor over the working directory before the first
    /// attempt.
    #[serde(default)]
    pub sweep_before_scan: bool,

    /// Pre-scan sweep reports only, never rewrites.
    #[serde(default)]
    pub sweep_dry_run: bool,

    /// Base analysis properties, rendered as `-D` flags on every attempt.
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

impl ScanJob {
    pub fn new(scanner_binary: impl Into<PathBuf>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            scanner_binary: scanner_binary.into(),
            working_dir: working_dir.into(),
            timeout_secs: default_timeout_secs(),
            graceful_stop: default_graceful_stop(),
            sweep_before_scan: false,
            sweep_dry_run: false,
            properties: BTreeMap::new(),
        }
    }

    /// Builder-style property for construction in tests and glue code.
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn with_timeout_secs(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }

    /// Load and validate a job from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("cannot read config file {}", path.display()))?;
        let job: ScanJob = toml::from_str(&content)
            .with_context(|| format!("cannot parse config file {}", path.display()))?;
        job.validate()?;
        Ok(job)
    }

    pub fn validate(&self) -> Result<()> {
        if self.scanner_binary.as_os_str().is_empty() {
            bail!("scanner_binary must not be empty");
        }
        if self.working_dir.as_os_str().is_empty() {
            bail!("working_dir must not be empty");
        }
        if self.timeout_secs == 0 {
            bail!("timeout_secs must be positive");
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_full_config_parses() {
        let toml = r#"
scanner_binary = "/opt/sonar-scanner/bin/sonar-scanner"
working_dir = "/srv/ci/erp"
timeout_secs = 900
graceful_stop = false
sweep_before_scan = true
sweep_dry_run = true

[properties]
"sonar.host.url" = "https://sonar.example.org"
"sonar.projectKey" = "erp-main"
"#;
        let job: ScanJob = toml::from_str(toml).unwrap();
        job.validate().unwrap();
        assert_eq!(job.timeout(), Duration::from_secs(900));
        assert!(!job.graceful_stop);
        assert!(job.sweep_before_scan);
        assert!(job.sweep_dry_run);
        assert_eq!(
            job.properties.get("sonar.projectKey").map(String::as_str),
            Some("erp-main")
        );
    }

    #[test]
    fn test_optional_fields_take_defaults() {
        let toml = r#"
scanner_binary = "sonar-scanner"
working_dir = "."
"#;
        let job: ScanJob = toml::from_str(toml).unwrap();
        assert_eq!(job.timeout_secs, 3600);
        assert!(job.graceful_stop);
        assert!(!job.sweep_before_scan);
        assert!(job.properties.is_empty());
    }

    #[test]
    fn test_zero_timeout_is_rejected() {
        let job = ScanJob::new("sonar-scanner", ".").with_timeout_secs(0);
        assert!(job.validate().is_err());
    }

    #[test]
    fn test_empty_binary_is_rejected() {
        let job = ScanJob::new("", ".");
        assert!(job.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bslscan.toml");
        fs::write(
            &path,
            "scanner_binary = \"sonar-scanner\"\nworking_dir = \"/tmp\"\n",
        )
        .unwrap();

        let job = ScanJob::load(&path).unwrap();
        assert_eq!(job.scanner_binary, PathBuf::from("sonar-scanner"));
    }

    #[test]
    fn test_load_missing_file_mentions_path() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("absent.toml");
        let err = ScanJob::load(&path).unwrap_err();
        assert!(format!("{:#}", err).contains("absent.toml"));
    }

    #[test]
    fn test_malformed_toml_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.toml");
        fs::write(&path, "scanner_binary = [not toml").unwrap();
        assert!(ScanJob::load(&path).is_err());
    }
}
