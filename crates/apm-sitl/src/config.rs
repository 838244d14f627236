//! Harness configuration.
//!
//! Two sources feed a SITL launch:
//!
//! - [`SitlEnv`]: the `SITL_SPEEDUP` and `SITL_RATE` environment variables,
//!   read once per process and appended to every instance's base launch
//!   arguments.
//! - [`HarnessConfig`]: optional settings in `~/.apm-sitl/config.json`
//!   (binary cache location, download mirror, a pre-built binary to use
//!   instead of downloading, readiness timeout).
//!
//! # Example
//!
//! ```no_run
//! use apm_sitl::config::{HarnessConfig, SitlEnv};
//!
//! // Load (returns defaults if file doesn't exist)
//! let config = HarnessConfig::load();
//! if let Some(path) = &config.binary_path {
//!     println!("Using local SITL binary: {}", path.display());
//! }
//!
//! let args = SitlEnv::global().base_args();
//! assert_eq!(&args[..3], ["--model", "quad", "--gimbal"]);
//! ```

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

const CONFIG_FILENAME: &str = "config.json";

/// Environment variable holding the simulation speedup multiplier.
pub const SPEEDUP_VAR: &str = "SITL_SPEEDUP";

/// Environment variable holding the simulation frame-rate override.
pub const RATE_VAR: &str = "SITL_RATE";

/// Returns the harness directory, `~/.apm-sitl`.
///
/// Falls back to the system temp directory when no home directory is known.
pub fn sitl_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".apm-sitl")
}

// ---------------------------------------------------------------------------
// Environment overrides
// ---------------------------------------------------------------------------

/// Launch overrides provided through the environment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SitlEnv {
    /// Value passed as `--speedup <N>`.
    pub speedup: Option<String>,
    /// Value passed as `-r <N>`.
    pub rate: Option<String>,
}

static SITL_ENV: OnceLock<SitlEnv> = OnceLock::new();

impl SitlEnv {
    /// Reads `SITL_SPEEDUP` and `SITL_RATE` from the current environment.
    pub fn from_env() -> Self {
        Self {
            speedup: std::env::var(SPEEDUP_VAR).ok(),
            rate: std::env::var(RATE_VAR).ok(),
        }
    }

    /// The overrides captured the first time this is called in the process.
    pub fn global() -> &'static SitlEnv {
        SITL_ENV.get_or_init(Self::from_env)
    }

    /// Base launch arguments shared by every instance.
    ///
    /// Always `--model quad --gimbal`, followed by `--speedup <N>` and
    /// `-r <N>` when the corresponding override is set.
    pub fn base_args(&self) -> Vec<String> {
        let mut args: Vec<String> = ["--model", "quad", "--gimbal"]
            .into_iter()
            .map(String::from)
            .collect();
        if let Some(speedup) = &self.speedup {
            args.push("--speedup".to_string());
            args.push(speedup.clone());
        }
        if let Some(rate) = &self.rate {
            args.push("-r".to_string());
            args.push(rate.clone());
        }
        args
    }
}

// ---------------------------------------------------------------------------
// Config file
// ---------------------------------------------------------------------------

/// Persistent harness configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct HarnessConfig {
    /// Where downloaded SITL bundles are unpacked. Defaults to `~/.apm-sitl/sitl`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_dir: Option<PathBuf>,

    /// Base URL of the SITL bundle mirror.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,

    /// A locally built `apm` binary. When set, downloads are skipped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binary_path: Option<PathBuf>,

    /// Seconds to wait for a launched simulator to report readiness.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready_timeout_secs: Option<u64>,
}

impl HarnessConfig {
    /// Load config from `~/.apm-sitl/config.json`.
    ///
    /// Returns [`Default`] if the file does not exist or cannot be parsed.
    pub fn load() -> Self {
        Self::load_from(&sitl_dir().join(CONFIG_FILENAME))
    }

    /// Load config from an explicit path, with the same fallback as [`load`](Self::load).
    pub fn load_from(path: &Path) -> Self {
        std::fs::read_to_string(path)
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default()
    }

    /// Save config to `~/.apm-sitl/config.json`.
    pub fn save(&self) -> std::io::Result<()> {
        let dir = sitl_dir();
        std::fs::create_dir_all(&dir)?;
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        std::fs::write(dir.join(CONFIG_FILENAME), json)
    }
}
