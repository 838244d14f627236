//! # apm-sitl
//!
//! Test harness for ArduPilot software-in-the-loop (SITL) simulation.
//!
//! This crate launches and manages Copter SITL processes so automated tests
//! can exercise vehicle-control logic against a simulated flight controller
//! instead of real hardware.
//!
//! ## Modules
//!
//! - [`instance`] - [`SimulatorInstance`], one managed simulator and its endpoint
//! - [`launcher`] - Downloading, launching and stopping the SITL binary
//! - [`link`] - Blocking MAVLink parameter-protocol client
//! - [`vehicle`] - Traits shared by vehicle connection backends
//! - [`retry`] - Bounded immediate retry
//! - [`config`] - Environment overrides and the optional config file
//!
//! ## External Dependencies
//!
//! The default launcher downloads prebuilt SITL bundles with `curl` and
//! unpacks them with `tar`; both must be on `PATH` unless a local binary is
//! configured in `~/.apm-sitl/config.json`.
//!
//! ## Example
//!
//! ```no_run
//! use apm_sitl::SimulatorInstance;
//!
//! let mut sim = SimulatorInstance::new(0, "0,0,0,0", 57600).expect("SITL failed to start");
//! assert_eq!(sim.connection_string(), "tcp:localhost:5760");
//! assert_eq!(sim.read_param("SYSID_THISMAV").unwrap(), 1.0);
//! sim.close();
//! ```

pub mod config;
pub mod instance;
pub mod launcher;
pub mod link;
pub mod retry;
pub mod vehicle;

pub use instance::{tcp_connection_string, SimulatorInstance, SitlError};
