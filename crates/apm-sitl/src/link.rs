//! MAVLink client for a SITL autopilot.
//!
//! This module provides [`MavlinkConnector`] and [`MavlinkVehicle`], a
//! blocking ground-station session over TCP that implements the parameter
//! protocol (`PARAM_REQUEST_LIST`, `PARAM_REQUEST_READ`, `PARAM_SET`,
//! `PARAM_VALUE`) on top of the `mavlink` crate's framing.
//!
//! Copter 3.3 only speaks MAVLink 1, which is the default
//! [`LinkConfig::version`].
//!
//! # Example
//!
//! ```no_run
//! use apm_sitl::link::MavlinkConnector;
//! use apm_sitl::vehicle::VehicleConnector;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let connector = MavlinkConnector::default();
//! let mut vehicle = connector.connect("tcp:localhost:5760", 57600)?;
//!
//! vehicle.set_param("FS_GCS_ENABLE", 0.0, true)?;
//! println!("SYSID_THISMAV = {:?}", vehicle.param("SYSID_THISMAV"));
//! vehicle.close();
//! # Ok(())
//! # }
//! ```

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::io::{self, Cursor, ErrorKind, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

use mavlink::common::{
    MavAutopilot, MavMessage, MavModeFlag, MavParamType, MavState, MavType, HEARTBEAT_DATA,
    PARAM_REQUEST_LIST_DATA, PARAM_REQUEST_READ_DATA, PARAM_SET_DATA,
};
use mavlink::error::MessageReadError;
use mavlink::peek_reader::PeekReader;
use mavlink::{MavHeader, MavlinkVersion};
use tracing::{debug, trace};

use crate::vehicle::{Vehicle, VehicleConnector, VehicleError};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Read timeout on the socket; bounds how long one receive blocks.
const READ_POLL: Duration = Duration::from_millis(100);

/// Parameter download is re-nudged after this long without progress.
const PARAM_QUIET_PERIOD: Duration = Duration::from_secs(1);

/// Interval between `PARAM_SET` resends while waiting for the echo.
const PARAM_RESEND_INTERVAL: Duration = Duration::from_secs(1);

/// Cap on `PARAM_REQUEST_READ` messages sent per nudge.
const MAX_READ_REQUESTS: usize = 32;

/// `param_index` reported for values sent in reply to `PARAM_SET`.
const UNINDEXED: u16 = u16::MAX;

/// Bytes in a MAVLink parameter id.
const PARAM_ID_LEN: usize = 16;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Settings for [`MavlinkConnector`].
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Timeout for establishing the TCP connection.
    pub connect_timeout: Duration,
    /// Maximum wait for the first autopilot heartbeat.
    pub heartbeat_timeout: Duration,
    /// Maximum wait for a full parameter download.
    pub param_timeout: Duration,
    /// Maximum wait for a `PARAM_SET` echo.
    pub ack_timeout: Duration,
    /// Wire protocol version.
    pub version: MavlinkVersion,
    /// Our system id (255 is the usual ground station id).
    pub system_id: u8,
    /// Our component id.
    pub component_id: u8,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            heartbeat_timeout: Duration::from_secs(30),
            param_timeout: Duration::from_secs(60),
            ack_timeout: Duration::from_secs(10),
            version: MavlinkVersion::V1,
            system_id: 255,
            component_id: 190,
        }
    }
}

/// Splits `tcp:<host>:<port>` (or `tcpout:`) into host and port.
pub fn parse_connection_string(connection_string: &str) -> Result<(String, u16), VehicleError> {
    let unsupported = || VehicleError::UnsupportedConnection(connection_string.to_string());

    let address = connection_string
        .strip_prefix("tcp:")
        .or_else(|| connection_string.strip_prefix("tcpout:"))
        .ok_or_else(unsupported)?;
    let (host, port) = address.rsplit_once(':').ok_or_else(unsupported)?;
    if host.is_empty() {
        return Err(unsupported());
    }
    let port = port.parse::<u16>().map_err(|_| unsupported())?;

    Ok((host.to_string(), port))
}

/// Encodes a parameter name as a NUL-padded MAVLink id.
pub fn encode_param_id(name: &str) -> Result<[u8; PARAM_ID_LEN], VehicleError> {
    let bytes = name.as_bytes();
    if bytes.is_empty() || bytes.len() > PARAM_ID_LEN {
        return Err(VehicleError::InvalidParamName(name.to_string()));
    }
    let mut id = [0u8; PARAM_ID_LEN];
    id[..bytes.len()].copy_from_slice(bytes);
    Ok(id)
}

/// Decodes a MAVLink parameter id, stopping at the first NUL.
pub fn decode_param_id(id: &[u8]) -> String {
    let end = id.iter().position(|&b| b == 0).unwrap_or(id.len());
    String::from_utf8_lossy(&id[..end]).into_owned()
}

// ---------------------------------------------------------------------------
// MavlinkConnector
// ---------------------------------------------------------------------------

/// Opens [`MavlinkVehicle`] sessions.
#[derive(Debug, Clone, Default)]
pub struct MavlinkConnector {
    config: LinkConfig,
}

impl MavlinkConnector {
    pub fn new(config: LinkConfig) -> Self {
        Self { config }
    }
}

impl VehicleConnector for MavlinkConnector {
    fn connect(
        &self,
        connection_string: &str,
        baud_rate: u32,
    ) -> Result<Box<dyn Vehicle>, VehicleError> {
        let vehicle = MavlinkVehicle::connect(connection_string, baud_rate, self.config.clone())?;
        Ok(Box::new(vehicle))
    }
}

// ---------------------------------------------------------------------------
// MavlinkVehicle
// ---------------------------------------------------------------------------

/// Read half of the socket, counting bytes as they are pulled off the wire.
struct CountingStream {
    inner: TcpStream,
    received: u64,
}

impl Read for CountingStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.received += n as u64;
        Ok(n)
    }
}

/// A ground-station session with one autopilot.
pub struct MavlinkVehicle {
    config: LinkConfig,
    reader: PeekReader<CountingStream>,
    writer: TcpStream,
    sequence: u8,
    target: Option<(u8, u8)>,
    params: HashMap<String, f32>,
    param_count: Option<u16>,
    seen_indices: HashSet<u16>,
    partial_frame_bytes: u64,
    closed: bool,
}

impl MavlinkVehicle {
    /// Connect, announce ourselves with a heartbeat, and wait until ready.
    ///
    /// `baud_rate` only matters for serial links and is ignored for TCP.
    ///
    /// # Errors
    ///
    /// - [`VehicleError::UnsupportedConnection`] for anything but a TCP address
    /// - [`VehicleError::ConnectionFailed`] if no resolved address accepts
    /// - any error from [`wait_ready`](Vehicle::wait_ready)
    pub fn connect(
        connection_string: &str,
        baud_rate: u32,
        config: LinkConfig,
    ) -> Result<Self, VehicleError> {
        let (host, port) = parse_connection_string(connection_string)?;
        debug!(%connection_string, baud_rate, "connecting to vehicle (baud rate unused over TCP)");

        let stream = open_stream(&host, port, config.connect_timeout)?;
        let mut vehicle = Self::from_stream(stream, config)?;

        vehicle.send_heartbeat()?;
        vehicle.wait_ready()?;
        debug!(%connection_string, target = ?vehicle.target, "vehicle ready");
        Ok(vehicle)
    }

    fn from_stream(stream: TcpStream, config: LinkConfig) -> Result<Self, VehicleError> {
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(READ_POLL))?;
        let writer = stream.try_clone()?;

        Ok(Self {
            config,
            reader: PeekReader::new(CountingStream {
                inner: stream,
                received: 0,
            }),
            writer,
            sequence: 0,
            target: None,
            params: HashMap::new(),
            param_count: None,
            seen_indices: HashSet::new(),
            partial_frame_bytes: 0,
            closed: false,
        })
    }

    /// System and component id of the autopilot, once its heartbeat is seen.
    pub fn target(&self) -> Option<(u8, u8)> {
        self.target
    }

    /// Number of parameters currently cached.
    pub fn param_count(&self) -> usize {
        self.params.len()
    }

    /// Bytes read in receives that then timed out mid-frame. Those frames
    /// are lost; the parameter protocol recovers by re-requesting.
    pub fn partial_frame_bytes(&self) -> u64 {
        self.partial_frame_bytes
    }

    // -----------------------------------------------------------------------
    // Frame I/O
    // -----------------------------------------------------------------------

    fn send(&mut self, message: &MavMessage) -> Result<(), VehicleError> {
        let header = MavHeader {
            system_id: self.config.system_id,
            component_id: self.config.component_id,
            sequence: self.sequence,
        };
        self.sequence = self.sequence.wrapping_add(1);

        let mut buf = Cursor::new(Vec::with_capacity(280));
        mavlink::write_versioned_msg(&mut buf, self.config.version, header, message)
            .map_err(|e| VehicleError::Encode(format!("{e:?}")))?;
        self.writer.write_all(buf.get_ref())?;
        Ok(())
    }

    /// Receive one message, or `None` if the read timed out or the frame was
    /// not understood.
    fn recv(&mut self) -> Result<Option<MavMessage>, VehicleError> {
        let before = self.reader.reader_ref().received;
        match mavlink::read_versioned_msg::<MavMessage, _>(&mut self.reader, self.config.version) {
            Ok((header, message)) => {
                self.observe(&header, &message);
                Ok(Some(message))
            }
            Err(MessageReadError::Io(e)) => match e.kind() {
                ErrorKind::WouldBlock | ErrorKind::TimedOut => {
                    let partial = self.reader.reader_ref().received - before;
                    if partial > 0 {
                        // The start of the frame was consumed; the parser resyncs on the next STX.
                        self.partial_frame_bytes += partial;
                        debug!(bytes = partial, "read timed out mid-frame, frame dropped");
                    }
                    Ok(None)
                }
                ErrorKind::UnexpectedEof => Err(VehicleError::ConnectionClosed),
                _ => Err(VehicleError::Io(e)),
            },
            Err(MessageReadError::Parse(e)) => {
                // ArduPilot-specific messages are not in the common dialect.
                trace!(error = ?e, "skipping unparsed frame");
                Ok(None)
            }
        }
    }

    /// Update cached state from an incoming message.
    fn observe(&mut self, header: &MavHeader, message: &MavMessage) {
        match message {
            MavMessage::HEARTBEAT(heartbeat) => {
                if self.target.is_none() && heartbeat.autopilot != MavAutopilot::MAV_AUTOPILOT_INVALID {
                    debug!(
                        system_id = header.system_id,
                        component_id = header.component_id,
                        "autopilot heartbeat"
                    );
                    self.target = Some((header.system_id, header.component_id));
                }
            }
            MavMessage::PARAM_VALUE(value) => {
                let name = decode_param_id(&value.param_id);
                trace!(%name, value = value.param_value, index = value.param_index, "PARAM_VALUE");
                self.params.insert(name, value.param_value);
                if value.param_index != UNINDEXED {
                    self.param_count = Some(value.param_count);
                    self.seen_indices.insert(value.param_index);
                }
            }
            _ => {}
        }
    }

    // -----------------------------------------------------------------------
    // Protocol steps
    // -----------------------------------------------------------------------

    fn send_heartbeat(&mut self) -> Result<(), VehicleError> {
        self.send(&MavMessage::HEARTBEAT(HEARTBEAT_DATA {
            custom_mode: 0,
            mavtype: MavType::MAV_TYPE_GCS,
            autopilot: MavAutopilot::MAV_AUTOPILOT_INVALID,
            base_mode: MavModeFlag::empty(),
            system_status: MavState::MAV_STATE_ACTIVE,
            mavlink_version: 3,
        }))
    }

    fn target_ids(&self) -> (u8, u8) {
        self.target.unwrap_or((1, 1))
    }

    fn wait_heartbeat(&mut self) -> Result<(), VehicleError> {
        let deadline = Instant::now() + self.config.heartbeat_timeout;
        while self.target.is_none() {
            if Instant::now() >= deadline {
                return Err(VehicleError::Timeout("autopilot heartbeat".to_string()));
            }
            self.recv()?;
        }
        Ok(())
    }

    fn params_complete(&self) -> bool {
        self.param_count
            .is_some_and(|count| self.seen_indices.len() >= usize::from(count))
    }

    fn request_param_list(&mut self) -> Result<(), VehicleError> {
        let (target_system, target_component) = self.target_ids();
        self.send(&MavMessage::PARAM_REQUEST_LIST(PARAM_REQUEST_LIST_DATA {
            target_system,
            target_component,
        }))
    }

    fn request_missing_params(&mut self, count: u16) -> Result<(), VehicleError> {
        let (target_system, target_component) = self.target_ids();
        let missing: Vec<u16> = (0..count)
            .filter(|index| !self.seen_indices.contains(index))
            .take(MAX_READ_REQUESTS)
            .collect();
        debug!(missing = missing.len(), "re-requesting parameters");

        for index in missing {
            self.send(&MavMessage::PARAM_REQUEST_READ(PARAM_REQUEST_READ_DATA {
                param_index: index as i16,
                target_system,
                target_component,
                param_id: [0u8; PARAM_ID_LEN],
            }))?;
        }
        Ok(())
    }

    /// Download the parameter table until every index has been seen.
    fn fetch_params(&mut self) -> Result<(), VehicleError> {
        self.request_param_list()?;

        let deadline = Instant::now() + self.config.param_timeout;
        let mut last_progress = Instant::now();
        let mut seen = self.seen_indices.len();

        while !self.params_complete() {
            if Instant::now() >= deadline {
                return Err(VehicleError::Timeout(format!(
                    "parameters ({} of {:?} received)",
                    self.seen_indices.len(),
                    self.param_count
                )));
            }
            self.recv()?;

            if self.seen_indices.len() != seen {
                seen = self.seen_indices.len();
                last_progress = Instant::now();
            } else if last_progress.elapsed() >= PARAM_QUIET_PERIOD {
                match self.param_count {
                    Some(count) => self.request_missing_params(count)?,
                    None => self.request_param_list()?,
                }
                last_progress = Instant::now();
            }
        }

        debug!(count = self.params.len(), "parameters loaded");
        Ok(())
    }

    fn send_param_set(&mut self, param_id: [u8; PARAM_ID_LEN], value: f32) -> Result<(), VehicleError> {
        let (target_system, target_component) = self.target_ids();
        self.send(&MavMessage::PARAM_SET(PARAM_SET_DATA {
            param_value: value,
            target_system,
            target_component,
            param_id,
            param_type: MavParamType::MAV_PARAM_TYPE_REAL32,
        }))
    }
}

impl Vehicle for MavlinkVehicle {
    fn wait_ready(&mut self) -> Result<(), VehicleError> {
        self.wait_heartbeat()?;
        if !self.params_complete() {
            self.fetch_params()?;
        }
        Ok(())
    }

    fn refresh_params(&mut self) -> Result<(), VehicleError> {
        self.wait_heartbeat()?;
        self.params.clear();
        self.seen_indices.clear();
        self.param_count = None;
        self.fetch_params()
    }

    fn set_param(&mut self, name: &str, value: f32, wait_ready: bool) -> Result<(), VehicleError> {
        let param_id = encode_param_id(name)?;
        self.wait_heartbeat()?;
        self.send_param_set(param_id, value)?;
        debug!(%name, value, wait_ready, "PARAM_SET sent");
        if !wait_ready {
            return Ok(());
        }

        let deadline = Instant::now() + self.config.ack_timeout;
        let mut last_sent = Instant::now();
        loop {
            if let Some(MavMessage::PARAM_VALUE(echo)) = self.recv()? {
                if decode_param_id(&echo.param_id) == name && values_match(echo.param_value, value) {
                    return Ok(());
                }
            }
            if Instant::now() >= deadline {
                return Err(VehicleError::ParamNotAcknowledged {
                    name: name.to_string(),
                    value,
                });
            }
            if last_sent.elapsed() >= PARAM_RESEND_INTERVAL {
                self.send_param_set(param_id, value)?;
                last_sent = Instant::now();
            }
        }
    }

    fn param(&self, name: &str) -> Option<f32> {
        self.params.get(name).copied()
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        // Already-closed sockets report NotConnected here.
        let _ = self.writer.shutdown(Shutdown::Both);
        debug!(target = ?self.target, "vehicle connection closed");
    }
}

impl Drop for MavlinkVehicle {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for MavlinkVehicle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MavlinkVehicle")
            .field("target", &self.target)
            .field("param_count", &self.params.len())
            .field("partial_frame_bytes", &self.partial_frame_bytes)
            .field("closed", &self.closed)
            .finish()
    }
}

/// Parameters travel as `f32`; compare with a relative tolerance.
fn values_match(actual: f32, expected: f32) -> bool {
    (actual - expected).abs() <= f32::EPSILON * expected.abs().max(1.0)
}

/// Connect to the first resolved address that accepts.
fn open_stream(host: &str, port: u16, timeout: Duration) -> Result<TcpStream, VehicleError> {
    let addrs = (host, port)
        .to_socket_addrs()
        .map_err(|e| VehicleError::ConnectionFailed(format!("{host}:{port}: {e}")))?;

    let mut last_error = None;
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => return Ok(stream),
            Err(e) => last_error = Some(format!("{addr}: {e}")),
        }
    }
    Err(VehicleError::ConnectionFailed(
        last_error.unwrap_or_else(|| format!("{host}:{port}: no addresses resolved")),
    ))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
