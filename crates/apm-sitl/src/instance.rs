//! A managed SITL instance.
//!
//! [`SimulatorInstance`] owns one simulator process and everything needed to
//! reach it: the launch arguments, the launcher holding the process, and a
//! connector for short-lived MAVLink sessions.
//!
//! Construction downloads the Copter 3.3 SITL binary, launches it, gives the
//! vehicle a unique `SYSID_THISMAV` (persisted through a relaunch), and
//! disables the GCS and EKF failsafes so simulated tests stay deterministic.
//!
//! # Example
//!
//! ```no_run
//! use apm_sitl::instance::SimulatorInstance;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut sim = SimulatorInstance::new(0, "-35.363261,149.165230,584,353", 57600)?;
//! assert_eq!(sim.connection_string(), "tcp:localhost:5760");
//!
//! sim.set_param_and_relaunch("RTL_ALT", 1500)?;
//! assert_eq!(sim.read_param("RTL_ALT")?, 1500.0);
//!
//! sim.close();
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use thiserror::Error;
use tracing::{debug, info};

use crate::config::{HarnessConfig, SitlEnv};
use crate::launcher::{LaunchError, LaunchOptions, LauncherConfig, ProcessLauncher, SitlLauncher};
use crate::link::MavlinkConnector;
use crate::retry::RetryPolicy;
use crate::vehicle::{ScopedVehicle, Vehicle, VehicleConnector, VehicleError};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// TCP port of instance 0.
pub const BASE_PORT: u16 = 5760;

/// Port distance between consecutive instances.
pub const PORT_STRIDE: u16 = 10;

/// Highest instance number whose port still fits in a `u16`.
pub const MAX_INSTANCE: u32 = ((u16::MAX - BASE_PORT) / PORT_STRIDE) as u32;

/// Vehicle type of the downloaded SITL bundle.
pub const VEHICLE: &str = "copter";

/// Firmware version of the downloaded SITL bundle.
pub const FIRMWARE_VERSION: &str = "3.3";

pub const SYSID_PARAM: &str = "SYSID_THISMAV";
pub const GCS_FAILSAFE_PARAM: &str = "FS_GCS_ENABLE";
pub const EKF_FAILSAFE_PARAM: &str = "FS_EKF_THRESH";

/// `FS_EKF_THRESH` high enough that the EKF failsafe never triggers.
const EKF_FAILSAFE_DISABLED: f32 = 100.0;

/// Connection string for instance `instance`: `tcp:localhost:<5760 + 10 * instance>`.
pub fn tcp_connection_string(instance: u32) -> String {
    let port = u64::from(BASE_PORT) + u64::from(instance) * u64::from(PORT_STRIDE);
    format!("tcp:localhost:{port}")
}

/// Launch arguments for one instance, in the order SITL receives them.
pub fn build_launch_args(env: &SitlEnv, home: &str, instance: u32, baud_rate: u32) -> Vec<String> {
    let mut args = env.base_args();
    args.push(format!("--home={home}"));
    args.push(format!("-I{instance}"));
    args.push(format!("--rate={baud_rate}"));
    args
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors returned by [`SimulatorInstance`].
///
/// Launcher and vehicle failures are passed through unchanged.
#[derive(Error, Debug)]
pub enum SitlError {
    /// The home position is not `lat,lng,alt,yaw`.
    #[error("Invalid home position {0:?}: expected lat,lng,alt,yaw")]
    InvalidHome(String),

    /// The baud rate was zero.
    #[error("Baud rate must be positive")]
    InvalidBaudRate,

    /// The instance number maps to a port above 65535.
    #[error("Instance number {0} is out of range (max {max})", max = MAX_INSTANCE)]
    InvalidInstance(u32),

    /// An operation needed a running simulator and there is none.
    #[error("SITL is not running")]
    NotRunning,

    /// The vehicle did not report a parameter.
    #[error("Parameter {0} not reported by vehicle")]
    ParamMissing(String),

    /// A parameter did not survive a relaunch.
    #[error("Parameter {key} read back as {actual} after relaunch, expected {expected}")]
    ParamMismatch { key: String, expected: i32, actual: f32 },

    #[error(transparent)]
    Launch(#[from] LaunchError),

    #[error(transparent)]
    Vehicle(#[from] VehicleError),
}

// ---------------------------------------------------------------------------
// HomePosition
// ---------------------------------------------------------------------------

/// Simulated home location.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HomePosition {
    /// Latitude in degrees.
    pub lat: f64,
    /// Longitude in degrees.
    pub lng: f64,
    /// Altitude in meters above sea level.
    pub alt: f64,
    /// Initial heading in degrees.
    pub yaw: f64,
}

impl FromStr for HomePosition {
    type Err = SitlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || SitlError::InvalidHome(s.to_string());
        let fields = s
            .split(',')
            .map(|field| field.trim().parse::<f64>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| invalid())?;

        match fields[..] {
            [lat, lng, alt, yaw] if fields.iter().all(|v| v.is_finite()) => {
                Ok(Self { lat, lng, alt, yaw })
            }
            _ => Err(invalid()),
        }
    }
}

impl fmt::Display for HomePosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{},{},{}", self.lat, self.lng, self.alt, self.yaw)
    }
}

// ---------------------------------------------------------------------------
// SimulatorInstance
// ---------------------------------------------------------------------------

/// Startup knobs for [`SimulatorInstance::with_backends`].
#[derive(Debug, Clone)]
pub struct InstanceOptions {
    /// Environment overrides appended to the base launch arguments.
    pub env: SitlEnv,
    /// Retry policy for download and launch.
    pub retry: RetryPolicy,
}

impl Default for InstanceOptions {
    fn default() -> Self {
        Self {
            env: SitlEnv::global().clone(),
            retry: RetryPolicy::default(),
        }
    }
}

/// One running SITL process and its MAVLink endpoint.
///
/// Call [`close`](Self::close) when done. Dropping the instance closes it as
/// well, so a panicking test does not leave a simulator behind.
pub struct SimulatorInstance {
    instance_number: u32,
    home: String,
    home_position: HomePosition,
    baud_rate: u32,
    launch_args: Vec<String>,
    retry: RetryPolicy,
    launcher: Box<dyn SitlLauncher>,
    connector: Box<dyn VehicleConnector>,
}

impl SimulatorInstance {
    /// Start an instance with the process launcher and MAVLink connector,
    /// configured from `~/.apm-sitl/config.json`.
    pub fn new(instance_number: u32, home: &str, baud_rate: u32) -> Result<Self, SitlError> {
        let config = HarnessConfig::load();
        Self::with_backends(
            instance_number,
            home,
            baud_rate,
            InstanceOptions::default(),
            Box::new(ProcessLauncher::new(LauncherConfig::from(&config))),
            Box::new(MavlinkConnector::default()),
        )
    }

    /// Start an instance with explicit backends.
    ///
    /// Downloads and launches the simulator (each retried per
    /// `options.retry`), sets `SYSID_THISMAV` to `instance_number + 1`
    /// through a relaunch, and disables the GCS and EKF failsafes.
    ///
    /// # Errors
    ///
    /// - [`SitlError::InvalidBaudRate`], [`SitlError::InvalidHome`],
    ///   [`SitlError::InvalidInstance`] for bad inputs
    /// - the last [`SitlError::Launch`] once download or launch attempts run out
    /// - any error from the parameter setup; the process is stopped first
    pub fn with_backends(
        instance_number: u32,
        home: &str,
        baud_rate: u32,
        options: InstanceOptions,
        launcher: Box<dyn SitlLauncher>,
        connector: Box<dyn VehicleConnector>,
    ) -> Result<Self, SitlError> {
        if baud_rate == 0 {
            return Err(SitlError::InvalidBaudRate);
        }
        if instance_number > MAX_INSTANCE {
            return Err(SitlError::InvalidInstance(instance_number));
        }
        let home_position: HomePosition = home.parse()?;
        let home = home.trim().to_string();

        let mut sim = Self {
            launch_args: build_launch_args(&options.env, &home, instance_number, baud_rate),
            instance_number,
            home,
            home_position,
            baud_rate,
            retry: options.retry,
            launcher,
            connector,
        };

        sim.download()?;
        sim.launch()?;
        if let Err(e) = sim.configure() {
            sim.close();
            return Err(e);
        }

        info!(connection = %sim.connection_string(), "APM SITL is up and running");
        Ok(sim)
    }

    fn download(&mut self) -> Result<(), SitlError> {
        let retry = self.retry;
        retry.run("download", |_| self.launcher.download(VEHICLE, FIRMWARE_VERSION))?;
        Ok(())
    }

    fn launch(&mut self) -> Result<(), SitlError> {
        let retry = self.retry;
        let options = LaunchOptions {
            await_ready: true,
            restart: true,
            ..Default::default()
        };

        retry.run("launch", |attempt| {
            match self.launcher.launch(&self.launch_args, &options) {
                Ok(()) => {
                    info!(
                        pid = self.launcher.pid(),
                        attempt,
                        args = ?self.launch_args,
                        "launched APM SITL"
                    );
                    Ok(())
                }
                Err(e) => {
                    self.close();
                    Err(e)
                }
            }
        })?;
        Ok(())
    }

    /// Unique system id, then failsafes off.
    fn configure(&mut self) -> Result<(), SitlError> {
        let sysid = (self.instance_number + 1) as i32;
        self.set_param_and_relaunch(SYSID_PARAM, sysid)?;

        self.with_vehicle(|vehicle| {
            vehicle.set_param(GCS_FAILSAFE_PARAM, 0.0, true)?;
            vehicle.set_param(EKF_FAILSAFE_PARAM, EKF_FAILSAFE_DISABLED, true)?;
            Ok(())
        })
    }

    /// `tcp:localhost:<5760 + 10 * instance_number>`.
    pub fn connection_string(&self) -> String {
        tcp_connection_string(self.instance_number)
    }

    pub fn instance_number(&self) -> u32 {
        self.instance_number
    }

    /// Home position as given at construction.
    pub fn home(&self) -> &str {
        &self.home
    }

    pub fn home_position(&self) -> HomePosition {
        self.home_position
    }

    pub fn baud_rate(&self) -> u32 {
        self.baud_rate
    }

    pub fn launch_args(&self) -> &[String] {
        &self.launch_args
    }

    /// PID of the current (or most recent) simulator process.
    pub fn pid(&self) -> Option<u32> {
        self.launcher.pid()
    }

    /// Working directory holding the simulator's EEPROM.
    pub fn working_dir(&self) -> Option<&Path> {
        self.launcher.working_dir()
    }

    /// Open a connection, run `f` once, and close the connection.
    ///
    /// The connection is closed whether `f` succeeds, fails, or panics.
    pub fn with_vehicle<T, F>(&self, f: F) -> Result<T, SitlError>
    where
        F: FnOnce(&mut dyn Vehicle) -> Result<T, SitlError>,
    {
        let connection = self.connection_string();
        let mut vehicle = ScopedVehicle::new(self.connector.connect(&connection, self.baud_rate)?);
        f(&mut *vehicle)
    }

    /// Value of `key` from a freshly downloaded parameter table.
    pub fn read_param(&self, key: &str) -> Result<f32, SitlError> {
        self.with_vehicle(|vehicle| {
            vehicle
                .param(key)
                .ok_or_else(|| SitlError::ParamMissing(key.to_string()))
        })
    }

    /// Write `key`, restart the simulator on its saved EEPROM, and verify
    /// the value survived.
    ///
    /// Some parameters (like `SYSID_THISMAV`) only take effect after a
    /// reboot. The relaunch reuses the working directory, so the rest of the
    /// simulator's saved state carries over too.
    ///
    /// # Errors
    ///
    /// - [`SitlError::NotRunning`] if there is no simulator process
    /// - [`SitlError::ParamMismatch`] if the read-back differs; this is not retried
    /// - launcher and vehicle errors from the individual steps
    pub fn set_param_and_relaunch(&mut self, key: &str, value: i32) -> Result<(), SitlError> {
        if !self.launcher.has_process() {
            return Err(SitlError::NotRunning);
        }
        let working_dir = self
            .launcher
            .working_dir()
            .map(Path::to_path_buf)
            .ok_or(SitlError::NotRunning)?;
        let expected = value as f32;

        self.with_vehicle(|vehicle| {
            vehicle.set_param(key, expected, true)?;
            Ok(())
        })?;

        self.launcher.stop()?;
        let options = LaunchOptions {
            await_ready: true,
            restart: true,
            working_dir: Some(working_dir),
            use_saved_data: true,
        };
        self.launcher.launch(&self.launch_args, &options)?;

        let actual = self.with_vehicle(|vehicle| {
            vehicle.refresh_params()?;
            vehicle.wait_ready()?;
            vehicle
                .param(key)
                .ok_or_else(|| SitlError::ParamMissing(key.to_string()))
        })?;

        if actual != expected {
            return Err(SitlError::ParamMismatch {
                key: key.to_string(),
                expected: value,
                actual,
            });
        }

        info!(%key, value, pid = self.launcher.pid(), "parameter persisted across relaunch");
        Ok(())
    }

    /// Stop the simulator process, if any.
    ///
    /// Safe to call repeatedly and on an instance whose launch failed.
    /// Failures while stopping are ignored.
    pub fn close(&mut self) {
        if !self.launcher.has_process() {
            return;
        }
        let pid = self.launcher.pid();
        match self.launcher.stop() {
            Ok(()) => info!(pid, "cleaned up APM SITL"),
            Err(e) => debug!(pid, error = %e, "ignoring failure while stopping SITL"),
        }
    }
}

impl Drop for SimulatorInstance {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for SimulatorInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimulatorInstance")
            .field("instance_number", &self.instance_number)
            .field("home", &self.home)
            .field("baud_rate", &self.baud_rate)
            .field("pid", &self.launcher.pid())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
