//! Shared test helpers for apm-sitl integration tests.
//!
//! Two kinds of mock infrastructure live here:
//!
//! - [`MockWorld`] with [`MockLauncher`] / [`MockConnector`]: an in-memory
//!   simulator whose parameters persist per working directory, with
//!   injectable download/launch/stop failures.
//! - [`mock_sitl`]: a TCP peer speaking the MAVLink 1 parameter protocol, for
//!   exercising the real [`MavlinkConnector`](apm_sitl::link::MavlinkConnector).

#![allow(dead_code)]

use std::collections::HashMap;
use std::io::{Cursor, ErrorKind, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use mavlink::common::{
    MavAutopilot, MavMessage, MavModeFlag, MavParamType, MavState, MavType, HEARTBEAT_DATA,
    PARAM_VALUE_DATA,
};
use mavlink::error::MessageReadError;
use mavlink::peek_reader::PeekReader;
use mavlink::{MavHeader, MavlinkVersion};

use apm_sitl::launcher::{LaunchError, LaunchOptions, SitlLauncher};
use apm_sitl::link::{decode_param_id, encode_param_id};
use apm_sitl::vehicle::{Vehicle, VehicleConnector, VehicleError};

/// Install a test-writer subscriber once; `RUST_LOG` controls verbosity.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Parameters a freshly wiped Copter 3.3 reports (the subset tests use).
pub fn default_params() -> HashMap<String, f32> {
    [
        ("SYSID_THISMAV", 1.0),
        ("FS_GCS_ENABLE", 1.0),
        ("FS_EKF_THRESH", 0.8),
        ("RTL_ALT", 1500.0),
        ("WPNAV_SPEED", 500.0),
    ]
    .into_iter()
    .map(|(name, value)| (name.to_string(), value))
    .collect()
}

// ---------------------------------------------------------------------------
// In-memory simulator
// ---------------------------------------------------------------------------

/// State shared by a [`MockLauncher`] and the vehicles its [`MockConnector`] opens.
#[derive(Debug, Default)]
pub struct World {
    /// Remaining downloads that fail before one succeeds.
    pub download_failures: u32,
    /// Remaining launches that start a process but never report ready.
    pub launch_failures: u32,
    /// Remaining stops that fail.
    pub stop_failures: u32,
    /// Acknowledge parameter writes without saving them to EEPROM.
    pub drop_writes: bool,

    pub downloads: u32,
    pub launches: Vec<LaunchOptions>,
    pub launch_args: Vec<Vec<String>>,
    pub stops: u32,
    pub running: bool,
    pub working_dir: Option<PathBuf>,
    /// Saved parameters per working directory.
    pub eeprom: HashMap<PathBuf, HashMap<String, f32>>,
    /// Parameters of the running process.
    pub live: HashMap<String, f32>,

    pub connections: Vec<(String, u32)>,
    pub closed_connections: u32,
}

#[derive(Debug, Clone, Default)]
pub struct MockWorld(Arc<Mutex<World>>);

impl MockWorld {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> MutexGuard<'_, World> {
        self.0.lock().unwrap()
    }

    pub fn launcher(&self) -> Box<dyn SitlLauncher> {
        Box::new(MockLauncher {
            world: self.clone(),
            pid: None,
            working_dir: None,
            has_process: false,
        })
    }

    pub fn connector(&self) -> Box<dyn VehicleConnector> {
        Box::new(MockConnector {
            world: self.clone(),
        })
    }

    /// Saved value of `name` in the current working directory.
    pub fn saved_param(&self, name: &str) -> Option<f32> {
        let state = self.state();
        let dir = state.working_dir.as_ref()?;
        state.eeprom.get(dir)?.get(name).copied()
    }

    pub fn live_param(&self, name: &str) -> Option<f32> {
        self.state().live.get(name).copied()
    }
}

pub struct MockLauncher {
    world: MockWorld,
    pid: Option<u32>,
    working_dir: Option<PathBuf>,
    has_process: bool,
}

impl SitlLauncher for MockLauncher {
    fn download(&mut self, _vehicle: &str, _version: &str) -> Result<(), LaunchError> {
        let mut state = self.world.state();
        state.downloads += 1;
        if state.download_failures > 0 {
            state.download_failures -= 1;
            return Err(LaunchError::DownloadFailed(format!(
                "mock download failure #{}",
                state.downloads
            )));
        }
        Ok(())
    }

    fn launch(&mut self, args: &[String], options: &LaunchOptions) -> Result<(), LaunchError> {
        if self.has_process {
            if !options.restart {
                return Err(LaunchError::AlreadyRunning(self.pid.unwrap_or_default()));
            }
            self.stop()?;
        }

        let mut state = self.world.state();
        let pid = 1000 + state.launches.len() as u32;
        let working_dir = options
            .working_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from(format!("/tmp/mock-sitl-{pid}")));

        state.launches.push(options.clone());
        state.launch_args.push(args.to_vec());
        if !options.use_saved_data {
            state.eeprom.remove(&working_dir);
        }
        let mut live = default_params();
        if let Some(saved) = state.eeprom.get(&working_dir) {
            live.extend(saved.iter().map(|(k, v)| (k.clone(), *v)));
        }
        state.live = live;
        state.running = true;
        state.working_dir = Some(working_dir.clone());

        self.pid = Some(pid);
        self.working_dir = Some(working_dir);
        self.has_process = true;

        if state.launch_failures > 0 {
            // The process started but never reported ready.
            state.launch_failures -= 1;
            return Err(LaunchError::ReadyTimeout(Duration::from_secs(1)));
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<(), LaunchError> {
        if !self.has_process {
            return Ok(());
        }
        let mut state = self.world.state();
        if state.stop_failures > 0 {
            state.stop_failures -= 1;
            return Err(LaunchError::StopFailed("mock stop failure".to_string()));
        }
        state.stops += 1;
        state.running = false;
        self.has_process = false;
        Ok(())
    }

    fn has_process(&self) -> bool {
        self.has_process
    }

    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn working_dir(&self) -> Option<&Path> {
        self.working_dir.as_deref()
    }
}

pub struct MockConnector {
    world: MockWorld,
}

impl VehicleConnector for MockConnector {
    fn connect(
        &self,
        connection_string: &str,
        baud_rate: u32,
    ) -> Result<Box<dyn Vehicle>, VehicleError> {
        let mut state = self.world.state();
        if !state.running {
            return Err(VehicleError::ConnectionFailed(format!(
                "{connection_string}: connection refused"
            )));
        }
        state
            .connections
            .push((connection_string.to_string(), baud_rate));
        Ok(Box::new(MockVehicle {
            world: self.world.clone(),
            cache: state.live.clone(),
            closed: false,
        }))
    }
}

pub struct MockVehicle {
    world: MockWorld,
    cache: HashMap<String, f32>,
    closed: bool,
}

impl Vehicle for MockVehicle {
    fn wait_ready(&mut self) -> Result<(), VehicleError> {
        Ok(())
    }

    fn refresh_params(&mut self) -> Result<(), VehicleError> {
        self.cache = self.world.state().live.clone();
        Ok(())
    }

    fn set_param(&mut self, name: &str, value: f32, wait_ready: bool) -> Result<(), VehicleError> {
        let mut state = self.world.state();
        if !state.live.contains_key(name) {
            // ArduPilot silently ignores unknown names.
            if wait_ready {
                return Err(VehicleError::ParamNotAcknowledged {
                    name: name.to_string(),
                    value,
                });
            }
            return Ok(());
        }

        state.live.insert(name.to_string(), value);
        if !state.drop_writes {
            if let Some(dir) = state.working_dir.clone() {
                state
                    .eeprom
                    .entry(dir)
                    .or_default()
                    .insert(name.to_string(), value);
            }
        }
        self.cache.insert(name.to_string(), value);
        Ok(())
    }

    fn param(&self, name: &str) -> Option<f32> {
        self.cache.get(name).copied()
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.world.state().closed_connections += 1;
        }
    }
}

// ---------------------------------------------------------------------------
// MAVLink TCP peer
// ---------------------------------------------------------------------------

/// Behavior switches for [`mock_sitl`].
#[derive(Debug, Clone)]
pub struct MockSitlOptions {
    /// System id in the peer's heartbeats.
    pub system_id: u8,
    /// Leave this index out of the first `PARAM_REQUEST_LIST` reply.
    pub drop_index_once: Option<u16>,
    /// Never answer `PARAM_SET`.
    pub ignore_sets: bool,
}

impl Default for MockSitlOptions {
    fn default() -> Self {
        Self {
            system_id: 1,
            drop_index_once: None,
            ignore_sets: false,
        }
    }
}

/// Counters and parameters of a [`mock_sitl`] peer.
#[derive(Debug, Default)]
pub struct MockSitlState {
    pub params: Vec<(String, f32)>,
    pub connections: u32,
    pub gcs_heartbeats: u32,
    pub list_requests: u32,
    pub read_requests: Vec<i16>,
    pub sets: Vec<(String, f32)>,
}

pub struct MockSitl {
    pub addr: SocketAddr,
    pub state: Arc<Mutex<MockSitlState>>,
}

impl MockSitl {
    pub fn connection_string(&self) -> String {
        format!("tcp:127.0.0.1:{}", self.addr.port())
    }

    pub fn param(&self, name: &str) -> Option<f32> {
        self.state
            .lock()
            .unwrap()
            .params
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| *v)
    }
}

/// Start a MAVLink 1 peer on an ephemeral port.
pub fn mock_sitl(params: &[(&str, f32)], options: MockSitlOptions) -> MockSitl {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    serve(listener, params, options)
}

/// Start a MAVLink 1 peer on a fixed port, or `None` if it is taken.
pub fn mock_sitl_on_port(port: u16, params: &[(&str, f32)], options: MockSitlOptions) -> Option<MockSitl> {
    let listener = TcpListener::bind(("127.0.0.1", port)).ok()?;
    Some(serve(listener, params, options))
}

fn serve(listener: TcpListener, params: &[(&str, f32)], options: MockSitlOptions) -> MockSitl {
    let addr = listener.local_addr().unwrap();
    let state = Arc::new(Mutex::new(MockSitlState {
        params: params.iter().map(|(n, v)| (n.to_string(), *v)).collect(),
        ..Default::default()
    }));

    let shared = state.clone();
    std::thread::spawn(move || {
        let mut dropped_once = false;
        for stream in listener.incoming() {
            let Ok(stream) = stream else { return };
            shared.lock().unwrap().connections += 1;
            handle_connection(stream, &shared, &options, &mut dropped_once);
        }
    });

    MockSitl { addr, state }
}

fn handle_connection(
    stream: TcpStream,
    state: &Arc<Mutex<MockSitlState>>,
    options: &MockSitlOptions,
    dropped_once: &mut bool,
) {
    stream
        .set_read_timeout(Some(Duration::from_millis(50)))
        .unwrap();
    let mut writer = stream.try_clone().unwrap();
    let mut reader = PeekReader::new(stream);
    let mut sequence = 0u8;

    let mut send = |writer: &mut TcpStream, message: MavMessage| {
        let header = MavHeader {
            system_id: options.system_id,
            component_id: 1,
            sequence,
        };
        sequence = sequence.wrapping_add(1);
        let mut buf = Cursor::new(Vec::new());
        mavlink::write_versioned_msg(&mut buf, MavlinkVersion::V1, header, &message).unwrap();
        writer.write_all(buf.get_ref()).is_ok()
    };

    if !send(&mut writer, heartbeat()) {
        return;
    }
    let mut last_heartbeat = Instant::now();

    loop {
        if last_heartbeat.elapsed() >= Duration::from_millis(500) {
            if !send(&mut writer, heartbeat()) {
                return;
            }
            last_heartbeat = Instant::now();
        }

        let message = match mavlink::read_versioned_msg::<MavMessage, _>(&mut reader, MavlinkVersion::V1) {
            Ok((_, message)) => message,
            Err(MessageReadError::Io(e))
                if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) =>
            {
                continue
            }
            Err(MessageReadError::Io(_)) => return,
            Err(MessageReadError::Parse(_)) => continue,
        };

        let replies: Vec<MavMessage> = {
            let mut st = state.lock().unwrap();
            match message {
                MavMessage::HEARTBEAT(_) => {
                    st.gcs_heartbeats += 1;
                    Vec::new()
                }
                MavMessage::PARAM_REQUEST_LIST(_) => {
                    st.list_requests += 1;
                    let count = st.params.len() as u16;
                    let skip = if *dropped_once { None } else { options.drop_index_once };
                    if skip.is_some() {
                        *dropped_once = true;
                    }
                    st.params
                        .iter()
                        .enumerate()
                        .filter(|(i, _)| Some(*i as u16) != skip)
                        .map(|(i, (name, value))| param_value(name, *value, i as u16, count))
                        .collect()
                }
                MavMessage::PARAM_REQUEST_READ(request) => {
                    st.read_requests.push(request.param_index);
                    let count = st.params.len() as u16;
                    let found = if request.param_index >= 0 {
                        let index = request.param_index as usize;
                        st.params.get(index).map(|p| (index, p.clone()))
                    } else {
                        let name = decode_param_id(&request.param_id);
                        st.params
                            .iter()
                            .position(|(n, _)| *n == name)
                            .map(|index| (index, st.params[index].clone()))
                    };
                    found
                        .map(|(index, (name, value))| param_value(&name, value, index as u16, count))
                        .into_iter()
                        .collect()
                }
                MavMessage::PARAM_SET(set) => {
                    let name = decode_param_id(&set.param_id);
                    st.sets.push((name.clone(), set.param_value));
                    let count = st.params.len() as u16;
                    match st.params.iter().position(|(n, _)| *n == name) {
                        Some(index) if !options.ignore_sets => {
                            st.params[index].1 = set.param_value;
                            vec![param_value(&name, set.param_value, index as u16, count)]
                        }
                        _ => Vec::new(),
                    }
                }
                _ => Vec::new(),
            }
        };

        for reply in replies {
            if !send(&mut writer, reply) {
                return;
            }
        }
    }
}

fn heartbeat() -> MavMessage {
    MavMessage::HEARTBEAT(HEARTBEAT_DATA {
        custom_mode: 0,
        mavtype: MavType::MAV_TYPE_QUADROTOR,
        autopilot: MavAutopilot::MAV_AUTOPILOT_ARDUPILOTMEGA,
        base_mode: MavModeFlag::MAV_MODE_FLAG_CUSTOM_MODE_ENABLED,
        system_status: MavState::MAV_STATE_STANDBY,
        mavlink_version: 3,
    })
}

fn param_value(name: &str, value: f32, index: u16, count: u16) -> MavMessage {
    MavMessage::PARAM_VALUE(PARAM_VALUE_DATA {
        param_value: value,
        param_count: count,
        param_index: index,
        param_id: encode_param_id(name).unwrap(),
        param_type: MavParamType::MAV_PARAM_TYPE_REAL32,
    })
}
