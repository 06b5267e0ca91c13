//! Scanner process invocation.
//!
//! Launches the scanner binary with `-Dkey=value` arguments in its own
//! process group, drains stdout and stderr concurrently while the process
//! runs and enforces a wall-clock timeout. Stop signals go to the whole
//! group: the scanner is a launcher script in front of a JVM, and killing
//! only the script leaves the JVM running and the output pipes open. With
//! `graceful_stop` set, cancellation sends SIGINT first so the scanner can
//! flush its work directory, then falls back to SIGKILL after a short grace
//! period. A timeout always kills immediately: a scanner that stopped
//! making progress has nothing worth flushing.

use crate::cancel::CancelToken;
use crate::properties::ScannerProperties;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Default wall-clock limit for one scanner run.
pub const DEFAULT_SCAN_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// How long a cancelled scanner gets between SIGINT and SIGKILL.
pub const GRACEFUL_STOP_GRACE: Duration = Duration::from_secs(5);

/// Bound on draining leftover output after the process group ended. A dead
/// group closes the pipe write ends at once; this only fires when a process
/// escaped the group and still holds them.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

type SharedBuf = Arc<Mutex<String>>;

/// One scanner run gone wrong. Every variant except `Start` carries the
/// combined output collected up to the point of failure.
#[derive(Debug, Error)]
pub enum InvokeError {
    #[error("failed to start scanner: {0}")]
    Start(#[source] std::io::Error),

    #[error("scanner timed out after {seconds}s")]
    Timeout { seconds: u64, output: String },

    #[error("scan cancelled")]
    Cancelled { output: String },

    #[error("scanner exited with code {code}")]
    Exit { code: i32, output: String },
}

impl InvokeError {
    /// Exit code of the failed run, or -1 when the scanner never exited on
    /// its own (not started, killed on timeout, cancelled, signal death).
    pub fn exit_code(&self) -> i32 {
        match self {
            InvokeError::Exit { code, .. } => *code,
            _ => -1,
        }
    }

    /// Combined output collected before the failure.
    pub fn output(&self) -> &str {
        match self {
            InvokeError::Start(_) => "",
            InvokeError::Timeout { output, .. } => output,
            InvokeError::Cancelled { output } => output,
            InvokeError::Exit { output, .. } => output,
        }
    }

    /// Consume the error, keeping only the collected output.
    pub fn into_output(self) -> String {
        match self {
            InvokeError::Start(_) => String::new(),
            InvokeError::Timeout { output, .. } => output,
            InvokeError::Cancelled { output } => output,
            InvokeError::Exit { output, .. } => output,
        }
    }
}

/// How to launch the scanner: binary, working directory, timeout, stop
/// behavior on cancellation.
#[derive(Debug, Clone)]
pub struct InvokeRequest {
    binary: PathBuf,
    working_dir: PathBuf,
    timeout: Duration,
    graceful_stop: bool,
}

enum RunOutcome {
    Exited(Option<i32>),
    TimedOut,
    Cancelled,
}

impl InvokeRequest {
    pub fn new(binary: impl Into<PathBuf>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            working_dir: working_dir.into(),
            timeout: DEFAULT_SCAN_TIMEOUT,
            graceful_stop: true,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// When false, cancellation kills outright instead of SIGINT + grace.
    pub fn with_graceful_stop(mut self, graceful_stop: bool) -> Self {
        self.graceful_stop = graceful_stop;
        self
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    /// Run the scanner once to completion, timeout or cancellation.
    ///
    /// Returns the combined stdout+stderr on exit code 0; every other
    /// ending becomes an `InvokeError` carrying whatever output was
    /// collected. Success is decided by the exit code alone.
    pub async fn run(
        &self,
        properties: &ScannerProperties,
        cancel: &mut CancelToken,
    ) -> Result<String, InvokeError> {
        let args = properties.to_args();
        // Property values can hold credentials; log keys only.
        let keys: Vec<&str> = properties.iter().map(|(k, _)| k).collect();
        info!(
            "launching {} in {} ({} properties, timeout {}s)",
            self.binary.display(),
            self.working_dir.display(),
            properties.len(),
            self.timeout.as_secs()
        );
        debug!("scanner properties: {}", keys.join(", "));

        let mut child = Command::new(&self.binary)
            .args(&args)
            .current_dir(&self.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .map_err(InvokeError::Start)?;

        let stdout_buf = SharedBuf::default();
        let stderr_buf = SharedBuf::default();
        let mut stdout_task = drain_stream(child.stdout.take(), "stdout", Arc::clone(&stdout_buf));
        let mut stderr_task = drain_stream(child.stderr.take(), "stderr", Arc::clone(&stderr_buf));

        let started = Instant::now();
        let outcome = tokio::select! {
            status = child.wait() => match status {
                Ok(status) => RunOutcome::Exited(status.code()),
                Err(err) => {
                    warn!("waiting on scanner failed: {}", err);
                    RunOutcome::Exited(None)
                }
            },
            _ = sleep(self.timeout) => {
                warn!("scanner exceeded {}s, killing", self.timeout.as_secs());
                stop_now(&mut child).await;
                RunOutcome::TimedOut
            }
            _ = cancel.cancelled() => {
                info!("cancellation requested, stopping scanner");
                if self.graceful_stop {
                    stop_gracefully(&mut child).await;
                } else {
                    stop_now(&mut child).await;
                }
                RunOutcome::Cancelled
            }
        };

        let drained = tokio::time::timeout(DRAIN_GRACE, async {
            let _ = (&mut stdout_task).await;
            let _ = (&mut stderr_task).await;
        })
        .await;
        if drained.is_err() {
            warn!(
                "scanner output still open {}s after exit, keeping partial output",
                DRAIN_GRACE.as_secs()
            );
            stdout_task.abort();
            stderr_task.abort();
        }

        let mut output = std::mem::take(&mut *stdout_buf.lock().unwrap());
        output.push_str(stderr_buf.lock().unwrap().as_str());

        match outcome {
            RunOutcome::Exited(Some(0)) => {
                info!(
                    "scanner finished in {:.1}s ({} bytes of output)",
                    started.elapsed().as_secs_f64(),
                    output.len()
                );
                Ok(output)
            }
            RunOutcome::Exited(code) => {
                let code = code.unwrap_or(-1);
                warn!(
                    "scanner failed with code {} after {:.1}s",
                    code,
                    started.elapsed().as_secs_f64()
                );
                Err(InvokeError::Exit { code, output })
            }
            RunOutcome::TimedOut => Err(InvokeError::Timeout {
                seconds: self.timeout.as_secs(),
                output,
            }),
            RunOutcome::Cancelled => Err(InvokeError::Cancelled { output }),
        }
    }
}

/// Collect one std stream into the shared buffer so the pipe never fills
/// up while the select loop is parked on wait/timeout/cancel. Reads raw
/// bytes: 1C tooling mixes encodings, and one Windows-1251 line must not
/// end the drain early.
fn drain_stream<R>(reader: Option<R>, label: &'static str, sink: SharedBuf) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let Some(reader) = reader else {
            return;
        };
        let mut reader = BufReader::new(reader);
        let mut chunk = Vec::new();
        loop {
            chunk.clear();
            match reader.read_until(b'\n', &mut chunk).await {
                Ok(0) => break,
                Ok(_) => {
                    let text = String::from_utf8_lossy(&chunk);
                    debug!("scanner {}: {}", label, text.trim_end());
                    sink.lock().unwrap().push_str(&text);
                }
                Err(err) => {
                    warn!("scanner {} read failed: {}", label, err);
                    break;
                }
            }
        }
    })
}

/// Send `signal` to the scanner's whole process group. The launcher script
/// is rarely the process doing the work.
fn signal_group(child: &Child, signal: Signal) -> bool {
    let Some(pid) = child.id() else {
        return false;
    };
    // Negative pid addresses the group the child leads.
    match kill(Pid::from_raw(-(pid as i32)), signal) {
        Ok(()) => true,
        Err(err) => {
            warn!("failed to send {:?} to the scanner group: {}", signal, err);
            false
        }
    }
}

/// SIGKILL the group, then reap. `child.kill` also covers the case where
/// the group signal failed and the direct child is still alive.
async fn stop_now(child: &mut Child) {
    signal_group(child, Signal::SIGKILL);
    let _ = child.kill().await;
}

/// SIGINT to the group, a grace period, then SIGKILL. The scanner traps
/// SIGINT to close its report file cleanly.
async fn stop_gracefully(child: &mut Child) {
    if signal_group(child, Signal::SIGINT) {
        if tokio::time::timeout(GRACEFUL_STOP_GRACE, child.wait())
            .await
            .is_ok()
        {
            return;
        }
        warn!(
            "scanner ignored SIGINT for {}s, killing",
            GRACEFUL_STOP_GRACE.as_secs()
        );
    }
    stop_now(child).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::cancel_pair;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn write_script(dir: &TempDir, body: &str) -> PathBuf {
        let path = dir.path().join("scanner.sh");
        fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        let mut perms = fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&path, perms).unwrap();
        path
    }

    fn props() -> ScannerProperties {
        let mut p = ScannerProperties::new();
        p.set("sonar.projectKey", "demo");
        p
    }

    #[tokio::test]
    async fn test_successful_run_returns_combined_output() {
        let dir = TempDir::new().unwrap();
        let script = write_script(&dir, "echo to-stdout\necho to-stderr >&2\nexit 0");
        let request = InvokeRequest::new(&script, dir.path());

        let output = request
            .run(&props(), &mut CancelToken::never())
            .await
            .unwrap();
        assert!(output.contains("to-stdout"));
        assert!(output.contains("to-stderr"));
    }

    #[tokio::test]
    async fn test_nonzero_exit_carries_code_and_output() {
        let dir = TempDir::new().unwrap();
        let script = write_script(&dir, "echo boom >&2\nexit 3");
        let request = InvokeRequest::new(&script, dir.path());

        let err = request
            .run(&props(), &mut CancelToken::never())
            .await
            .unwrap_err();
        assert_eq!(err.exit_code(), 3);
        assert!(err.output().contains("boom"));
        assert!(matches!(err, InvokeError::Exit { code: 3, .. }));
    }

    #[tokio::test]
    async fn test_property_arguments_reach_the_scanner() {
        let dir = TempDir::new().unwrap();
        let script = write_script(&dir, "echo \"$@\"");
        let request = InvokeRequest::new(&script, dir.path());

        let output = request
            .run(&props(), &mut CancelToken::never())
            .await
            .unwrap();
        assert!(output.contains("-Dsonar.projectKey=demo"));
    }

    #[tokio::test]
    async fn test_invalid_utf8_output_is_replaced_not_dropped() {
        let dir = TempDir::new().unwrap();
        // Three Windows-1251 bytes, then a line that must still arrive.
        let script = write_script(
            &dir,
            "printf 'ERROR: \\310\\355\\362 before\\n'\necho ERROR: after the bad bytes\nexit 1",
        );
        let request = InvokeRequest::new(&script, dir.path());

        let err = request
            .run(&props(), &mut CancelToken::never())
            .await
            .unwrap_err();
        assert_eq!(err.exit_code(), 1);
        assert!(err.output().contains("before"));
        assert!(err.output().contains("after the bad bytes"));
    }

    #[tokio::test]
    async fn test_timeout_kills_a_hung_scanner() {
        let dir = TempDir::new().unwrap();
        let script = write_script(&dir, "echo started\nsleep 30");
        let request =
            InvokeRequest::new(&script, dir.path()).with_timeout(Duration::from_millis(300));

        let started = Instant::now();
        let err = request
            .run(&props(), &mut CancelToken::never())
            .await
            .unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(matches!(err, InvokeError::Timeout { .. }));
        assert_eq!(err.exit_code(), -1);
        assert!(err.output().contains("started"));
    }

    #[tokio::test]
    async fn test_timeout_kills_the_whole_scanner_process_tree() {
        let dir = TempDir::new().unwrap();
        // Background children inherit the pipes; only a group kill makes
        // the drain see EOF before they exit on their own.
        let script = write_script(&dir, "echo started\nsleep 30 &\nsleep 30 &\nwait");
        let request =
            InvokeRequest::new(&script, dir.path()).with_timeout(Duration::from_millis(300));

        let started = Instant::now();
        let err = request
            .run(&props(), &mut CancelToken::never())
            .await
            .unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(matches!(err, InvokeError::Timeout { .. }));
        assert!(err.output().contains("started"));
    }

    #[tokio::test]
    async fn test_cancellation_stops_the_scanner() {
        let dir = TempDir::new().unwrap();
        let script = write_script(&dir, "echo started\nsleep 30");
        let request = InvokeRequest::new(&script, dir.path());
        let (handle, mut token) = cancel_pair();
        let props = props();

        let started = Instant::now();
        let (result, _) = tokio::join!(request.run(&props, &mut token), async {
            sleep(Duration::from_millis(200)).await;
            handle.cancel();
        });

        let err = result.unwrap_err();
        assert!(matches!(err, InvokeError::Cancelled { .. }));
        assert_eq!(err.exit_code(), -1);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_forced_stop_kills_a_scanner_that_ignores_sigint() {
        let dir = TempDir::new().unwrap();
        let script = write_script(&dir, "trap '' INT\necho started\nsleep 30");
        let request = InvokeRequest::new(&script, dir.path()).with_graceful_stop(false);
        let (handle, mut token) = cancel_pair();
        let props = props();

        let started = Instant::now();
        let (result, _) = tokio::join!(request.run(&props, &mut token), async {
            sleep(Duration::from_millis(200)).await;
            handle.cancel();
        });

        assert!(matches!(result.unwrap_err(), InvokeError::Cancelled { .. }));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_missing_binary_is_a_start_error() {
        let dir = TempDir::new().unwrap();
        let request = InvokeRequest::new(dir.path().join("no-such-scanner"), dir.path());

        let err = request
            .run(&props(), &mut CancelToken::never())
            .await
            .unwrap_err();
        assert!(matches!(err, InvokeError::Start(_)));
        assert_eq!(err.exit_code(), -1);
        assert_eq!(err.output(), "");
    }
}
