//! Lifecycle management for the ArduPilot SITL process.
//!
//! This module handles downloading, launching, readiness-checking, and
//! stopping the prebuilt `apm` SITL binary. A launched simulator listens on
//! TCP port `5760 + 10 * instance` and speaks MAVLink (see [`crate::link`]).
//!
//! # Overview
//!
//! [`ProcessLauncher`] implements [`SitlLauncher`] in three steps:
//!
//! 1. **Download** the SITL bundle for a vehicle/version into a local cache
//!    (`curl` + `tar`), skipped when already cached
//! 2. **Launch** the binary in a working directory, wiping the EEPROM unless
//!    saved data is reused
//! 3. **Wait for ready** by watching stdout for `Waiting for connection`
//!
//! # Example
//!
//! ```no_run
//! use apm_sitl::launcher::{LaunchOptions, LauncherConfig, ProcessLauncher, SitlLauncher};
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut launcher = ProcessLauncher::new(LauncherConfig::default());
//! launcher.download("copter", "3.3")?;
//!
//! let args = vec!["--model".to_string(), "quad".to_string(), "-I0".to_string()];
//! launcher.launch(&args, &LaunchOptions { await_ready: true, ..Default::default() })?;
//! println!("SITL running as PID {:?}", launcher.pid());
//! launcher.stop()?;
//! # Ok(())
//! # }
//! ```

use std::io::{BufRead, BufReader, ErrorKind, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::time::{Duration, Instant};

use tempfile::TempDir;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

use crate::config::{sitl_dir, HarnessConfig};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Mirror hosting the prebuilt SITL bundles.
pub const DEFAULT_DOWNLOAD_URL: &str = "http://dronekit-assets.s3.amazonaws.com/sitl";

/// Line printed by SITL once its first serial port accepts connections.
pub const READY_MARKER: &str = "Waiting for connection";

/// Home location used when the launch arguments don't carry `--home`.
pub const DEFAULT_HOME: &str = "-35.363261,149.165230,584,353";

const BINARY_NAME: &str = "apm";

/// How often the readiness wait re-checks the child process.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Configuration for [`ProcessLauncher`].
#[derive(Debug, Clone)]
pub struct LauncherConfig {
    /// Directory holding one unpacked bundle per `<vehicle>-<version>`.
    pub cache_dir: PathBuf,
    /// Base URL of the bundle mirror.
    pub download_url: String,
    /// Use this binary instead of downloading one.
    pub binary_override: Option<PathBuf>,
    /// Substring of a stdout line that signals readiness.
    pub ready_marker: String,
    /// Maximum time to wait for [`ready_marker`](Self::ready_marker).
    pub ready_timeout: Duration,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            cache_dir: sitl_dir().join("sitl"),
            download_url: DEFAULT_DOWNLOAD_URL.to_string(),
            binary_override: None,
            ready_marker: READY_MARKER.to_string(),
            ready_timeout: Duration::from_secs(60),
        }
    }
}

impl From<&HarnessConfig> for LauncherConfig {
    fn from(config: &HarnessConfig) -> Self {
        let defaults = Self::default();
        Self {
            cache_dir: config.cache_dir.clone().unwrap_or(defaults.cache_dir),
            download_url: config.download_url.clone().unwrap_or(defaults.download_url),
            binary_override: config.binary_path.clone(),
            ready_marker: defaults.ready_marker,
            ready_timeout: config
                .ready_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.ready_timeout),
        }
    }
}

/// Per-launch options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LaunchOptions {
    /// Block until the simulator reports readiness.
    pub await_ready: bool,
    /// Stop an already running process instead of failing.
    pub restart: bool,
    /// Run in this directory instead of a fresh temporary one.
    pub working_dir: Option<PathBuf>,
    /// Keep the EEPROM from a previous run in the working directory.
    pub use_saved_data: bool,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors specific to SITL process management.
#[derive(Error, Debug)]
pub enum LaunchError {
    /// Fetching or unpacking the SITL bundle failed.
    #[error("Failed to download SITL: {0}")]
    DownloadFailed(String),

    /// The SITL binary was not found where expected.
    #[error("SITL binary not found at path: {0}")]
    BinaryNotFound(PathBuf),

    /// [`SitlLauncher::launch`] was called before a successful download.
    #[error("SITL binary has not been downloaded")]
    NotDownloaded,

    /// A process is already running and restart was not requested.
    #[error("SITL is already running (PID {0})")]
    AlreadyRunning(u32),

    /// The process exited before reporting readiness.
    #[error("SITL exited before becoming ready: {0}")]
    ExitedEarly(String),

    /// The process did not report readiness in time.
    #[error("SITL failed to become ready within {0:?}")]
    ReadyTimeout(Duration),

    /// Killing or reaping the process failed.
    #[error("Failed to stop SITL: {0}")]
    StopFailed(String),

    /// An I/O error occurred.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// SitlLauncher
// ---------------------------------------------------------------------------

/// Owns at most one simulator process.
pub trait SitlLauncher: Send {
    /// Make the binary for `vehicle` at firmware `version` available locally.
    fn download(&mut self, vehicle: &str, version: &str) -> Result<(), LaunchError>;

    /// Start the simulator with `args`.
    fn launch(&mut self, args: &[String], options: &LaunchOptions) -> Result<(), LaunchError>;

    /// Stop the running process. A no-op when there is none.
    fn stop(&mut self) -> Result<(), LaunchError>;

    /// Whether a process handle is currently held.
    fn has_process(&self) -> bool;

    /// PID of the most recently launched process, kept after it stops.
    fn pid(&self) -> Option<u32>;

    /// Working directory of the most recently launched process.
    fn working_dir(&self) -> Option<&Path>;
}

/// Returns the platform segment used in bundle file names.
pub fn sitl_platform() -> &'static str {
    if cfg!(target_os = "macos") {
        "osx"
    } else if cfg!(windows) {
        "win"
    } else {
        "linux"
    }
}

// ---------------------------------------------------------------------------
// ProcessLauncher
// ---------------------------------------------------------------------------

/// Runs the SITL binary as a child process.
///
/// The child's stdout and stderr are drained on background threads and
/// forwarded to `tracing` at `trace` level. Dropping the launcher stops the
/// child and removes the working directory it created, if any. Directories
/// passed in [`LaunchOptions::working_dir`] are never removed.
pub struct ProcessLauncher {
    config: LauncherConfig,
    binary: Option<PathBuf>,
    defaults_file: Option<PathBuf>,
    child: Option<Child>,
    pid: Option<u32>,
    working_dir: Option<PathBuf>,
    // Declared last so it is removed after the child is stopped.
    owned_dir: Option<TempDir>,
}

impl ProcessLauncher {
    pub fn new(config: LauncherConfig) -> Self {
        Self {
            config,
            binary: None,
            defaults_file: None,
            child: None,
            pid: None,
            working_dir: None,
            owned_dir: None,
        }
    }

    /// URL of the bundle for `vehicle` at `version` on this platform.
    pub fn bundle_url(&self, vehicle: &str, version: &str) -> String {
        format!(
            "{}/{vehicle}/sitl-{}-{vehicle}-{version}.tar.gz",
            self.config.download_url.trim_end_matches('/'),
            sitl_platform(),
        )
    }

    /// Directory the bundle for `vehicle` at `version` unpacks into.
    pub fn bundle_dir(&self, vehicle: &str, version: &str) -> PathBuf {
        self.config.cache_dir.join(format!("{vehicle}-{version}"))
    }

    /// Full argument list passed to the binary.
    ///
    /// Appends a default `--home` when `args` has none, the bundle's defaults
    /// file when one was found, and `-w` (wipe EEPROM) unless saved data is
    /// reused.
    pub fn command_args(&self, args: &[String], options: &LaunchOptions) -> Vec<String> {
        let mut full = args.to_vec();
        if !full.iter().any(|a| a.starts_with("--home")) {
            full.push(format!("--home={DEFAULT_HOME}"));
        }
        if let Some(defaults) = &self.defaults_file {
            full.push("--defaults".to_string());
            full.push(defaults.display().to_string());
        }
        if !options.use_saved_data {
            full.push("-w".to_string());
        }
        full
    }

    /// Returns `true` while the child has not exited.
    fn is_running(&mut self) -> bool {
        match self.child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Block until a stdout line contains the ready marker.
    fn wait_for_ready(&mut self, lines: &Receiver<String>) -> Result<(), LaunchError> {
        let timeout = self.config.ready_timeout;
        let deadline = Instant::now() + timeout;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                let _ = self.stop();
                return Err(LaunchError::ReadyTimeout(timeout));
            }

            match lines.recv_timeout(remaining.min(POLL_INTERVAL)) {
                Ok(line) if line.contains(&self.config.ready_marker) => {
                    debug!(pid = self.pid, "SITL ready");
                    return Ok(());
                }
                Ok(_) | Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    // stdout closed without the marker.
                    let status = self.exit_status();
                    let _ = self.stop();
                    return Err(LaunchError::ExitedEarly(
                        status.unwrap_or_else(|| "output closed".to_string()),
                    ));
                }
            }

            if let Some(status) = self.exit_status() {
                self.child = None;
                return Err(LaunchError::ExitedEarly(status));
            }
        }
    }

    fn exit_status(&mut self) -> Option<String> {
        self.child
            .as_mut()
            .and_then(|child| child.try_wait().ok().flatten())
            .map(|status| status.to_string())
    }
}

impl SitlLauncher for ProcessLauncher {
    /// Download and unpack the SITL bundle, unless it is already cached.
    ///
    /// # Errors
    ///
    /// - [`LaunchError::BinaryNotFound`] if the configured override or the
    ///   unpacked binary does not exist
    /// - [`LaunchError::DownloadFailed`] if `curl` or `tar` fails
    /// - [`LaunchError::Io`] if the cache directory cannot be created
    fn download(&mut self, vehicle: &str, version: &str) -> Result<(), LaunchError> {
        if let Some(binary) = &self.config.binary_override {
            if !binary.exists() {
                return Err(LaunchError::BinaryNotFound(binary.clone()));
            }
            debug!(binary = %binary.display(), "using configured SITL binary, skipping download");
            self.binary = Some(binary.clone());
            return Ok(());
        }

        let target = self.bundle_dir(vehicle, version);
        let binary = target.join(BINARY_NAME);

        if binary.exists() {
            debug!(path = %target.display(), "SITL bundle already cached");
        } else {
            std::fs::create_dir_all(&target)?;
            let url = self.bundle_url(vehicle, version);
            let archive = target.join("sitl.tar.gz");

            info!(%url, "downloading SITL bundle");
            let fetched = run_tool(
                Command::new("curl")
                    .args(["-fsSL", "-o"])
                    .arg(&archive)
                    .arg(&url),
            )
            .and_then(|()| {
                run_tool(
                    Command::new("tar")
                        .arg("-xzf")
                        .arg(&archive)
                        .arg("-C")
                        .arg(&target),
                )
            });
            let _ = std::fs::remove_file(&archive);
            fetched?;

            if !binary.exists() {
                return Err(LaunchError::BinaryNotFound(binary));
            }
            info!(path = %target.display(), "SITL bundle unpacked");
        }

        let defaults = target.join(format!("{vehicle}.parm"));
        self.defaults_file = defaults.exists().then_some(defaults);
        self.binary = Some(binary);
        Ok(())
    }

    /// Spawn the binary and optionally wait for readiness.
    ///
    /// # Errors
    ///
    /// - [`LaunchError::AlreadyRunning`] if a process is alive and `restart` is off
    /// - [`LaunchError::NotDownloaded`] if [`download`](SitlLauncher::download) hasn't succeeded
    /// - [`LaunchError::ExitedEarly`] / [`LaunchError::ReadyTimeout`] while awaiting readiness
    /// - [`LaunchError::Io`] if the process cannot be spawned
    fn launch(&mut self, args: &[String], options: &LaunchOptions) -> Result<(), LaunchError> {
        if self.is_running() {
            if !options.restart {
                return Err(LaunchError::AlreadyRunning(self.pid.unwrap_or_default()));
            }
            self.stop()?;
        }
        self.child = None;

        let binary = self.binary.clone().ok_or(LaunchError::NotDownloaded)?;
        let working_dir = match &options.working_dir {
            Some(dir) => {
                std::fs::create_dir_all(dir)?;
                dir.clone()
            }
            None => {
                // Replaces (and removes) the directory of an earlier launch.
                let dir = tempfile::Builder::new().prefix("apm-sitl-").tempdir()?;
                let path = dir.path().to_path_buf();
                self.owned_dir = Some(dir);
                path
            }
        };

        let full_args = self.command_args(args, options);
        let mut child = Command::new(&binary)
            .args(&full_args)
            .current_dir(&working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;
        let pid = child.id();

        let (tx, rx) = mpsc::channel();
        if let Some(stdout) = child.stdout.take() {
            drain_output("stdout", pid, stdout, Some(tx));
        }
        if let Some(stderr) = child.stderr.take() {
            drain_output("stderr", pid, stderr, None);
        }

        info!(
            pid,
            working_dir = %working_dir.display(),
            args = ?full_args,
            "launching APM SITL"
        );

        self.child = Some(child);
        self.pid = Some(pid);
        self.working_dir = Some(working_dir);

        if options.await_ready {
            self.wait_for_ready(&rx)?;
        }
        Ok(())
    }

    /// Kill and reap the child process.
    ///
    /// # Errors
    ///
    /// - [`LaunchError::StopFailed`] if the signal or the wait fails; the
    ///   handle is kept so a later call can try again
    fn stop(&mut self) -> Result<(), LaunchError> {
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };

        if let Err(e) = child.kill() {
            // InvalidInput means the child already exited.
            if e.kind() != std::io::ErrorKind::InvalidInput {
                let message = e.to_string();
                self.child = Some(child);
                return Err(LaunchError::StopFailed(message));
            }
        }
        child
            .wait()
            .map_err(|e| LaunchError::StopFailed(e.to_string()))?;

        debug!(pid = child.id(), "SITL stopped");
        Ok(())
    }

    fn has_process(&self) -> bool {
        self.child.is_some()
    }

    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn working_dir(&self) -> Option<&Path> {
        self.working_dir.as_deref()
    }
}

impl Drop for ProcessLauncher {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!(error = %e, "failed to stop SITL on drop");
        }
    }
}

/// Run an external tool to completion, mapping failure to [`LaunchError::DownloadFailed`].
fn run_tool(command: &mut Command) -> Result<(), LaunchError> {
    let output = command
        .output()
        .map_err(|e| LaunchError::DownloadFailed(format!("{command:?}: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(LaunchError::DownloadFailed(stderr.trim().to_string()));
    }
    Ok(())
}

/// Forward a child stream to `tracing`, optionally also sending each line to `lines`.
fn drain_output<R>(stream: &'static str, pid: u32, reader: R, lines: Option<Sender<String>>)
where
    R: Read + Send + 'static,
{
    let spawned = std::thread::Builder::new()
        .name(format!("sitl-{pid}-{stream}"))
        .spawn(move || {
            // Keep reading until EOF: closing the pipe early would kill the
            // child with SIGPIPE on its next write.
            let mut reader = BufReader::new(reader);
            let mut buf = Vec::new();
            loop {
                buf.clear();
                match reader.read_until(b'\n', &mut buf) {
                    Ok(0) => break,
                    Ok(_) => {}
                    Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                    Err(e) => {
                        debug!(pid, stream, error = %e, "SITL output read failed");
                        break;
                    }
                }
                let line = String::from_utf8_lossy(&buf).trim_end().to_string();
                trace!(pid, stream, "{line}");
                if let Some(tx) = &lines {
                    // The receiver is gone once readiness is settled.
                    let _ = tx.send(line);
                }
            }
        });
    if let Err(e) = spawned {
        warn!(pid, stream, error = %e, "failed to spawn output drain thread");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
