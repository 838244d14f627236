//! Vehicle connection traits.
//!
//! This module defines [`Vehicle`], a parameter-store view of a connected
//! autopilot, and [`VehicleConnector`], which opens one. The MAVLink backend
//! lives in [`crate::link`]; tests substitute in-memory implementations.
//!
//! [`ScopedVehicle`] closes the connection when it goes out of scope, on
//! every exit path including unwinding.

use std::ops::{Deref, DerefMut};

use thiserror::Error;

/// Errors that can occur while talking to a vehicle.
#[derive(Error, Debug)]
pub enum VehicleError {
    /// The connection string is not one this backend understands.
    #[error("Unsupported connection string: {0}")]
    UnsupportedConnection(String),

    /// Establishing the connection failed.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// The remote end closed the connection.
    #[error("Connection closed by vehicle")]
    ConnectionClosed,

    /// Waiting for the vehicle exceeded its deadline.
    #[error("Timed out waiting for {0}")]
    Timeout(String),

    /// A parameter write was never echoed back with the requested value.
    #[error("Parameter {name} was not acknowledged with value {value}")]
    ParamNotAcknowledged { name: String, value: f32 },

    /// Parameter names are 1 to 16 bytes.
    #[error("Invalid parameter name: {0:?}")]
    InvalidParamName(String),

    /// A message could not be encoded.
    #[error("Failed to encode message: {0}")]
    Encode(String),

    /// An I/O error occurred.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A connected vehicle, seen through its parameter store.
pub trait Vehicle {
    /// Block until the vehicle has identified itself and its full parameter
    /// table is cached.
    fn wait_ready(&mut self) -> Result<(), VehicleError>;

    /// Discard the cached parameter table and download it again.
    fn refresh_params(&mut self) -> Result<(), VehicleError>;

    /// Write a parameter. With `wait_ready`, block until the vehicle echoes
    /// the new value back.
    fn set_param(&mut self, name: &str, value: f32, wait_ready: bool) -> Result<(), VehicleError>;

    /// Cached value of `name`, if the vehicle reported it.
    fn param(&self, name: &str) -> Option<f32>;

    /// Close the connection. Calling it again is a no-op.
    fn close(&mut self);
}

/// Opens [`Vehicle`] sessions.
pub trait VehicleConnector: Send {
    /// Connect to `connection_string` and return once the vehicle is ready.
    fn connect(
        &self,
        connection_string: &str,
        baud_rate: u32,
    ) -> Result<Box<dyn Vehicle>, VehicleError>;
}

/// A vehicle that is closed when dropped.
pub struct ScopedVehicle {
    inner: Box<dyn Vehicle>,
}

impl ScopedVehicle {
    pub fn new(inner: Box<dyn Vehicle>) -> Self {
        Self { inner }
    }
}

impl Deref for ScopedVehicle {
    type Target = dyn Vehicle;

    fn deref(&self) -> &Self::Target {
        self.inner.as_ref()
    }
}

impl DerefMut for ScopedVehicle {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.inner.as_mut()
    }
}

impl Drop for ScopedVehicle {
    fn drop(&mut self) {
        self.inner.close();
    }
}
