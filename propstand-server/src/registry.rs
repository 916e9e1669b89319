//! Device registry
//!
//! Concurrent mapping from a device's TCP peer address to its live session
//! handle. A device appears here only after its CONFIG was accepted and
//! TIMESYNC completed, and disappears before its session task finishes.
//! All mutation goes through one `RwLock` writer; readers get consistent
//! snapshots.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};

use propstand_core::device::DeviceConfig;
use propstand_core::packet::ControlState;
use tokio::sync::mpsc;

use crate::session::SessionCommand;
use crate::Session;

/// Rows retained per device before the oldest samples roll off
pub const SAMPLE_LOG_ROWS: usize = 120_000;

/// Row-aligned sample store for one device: one row per DATA batch, one
/// column per sensor. A batch that omits a sensor leaves NaN in that cell.
/// Row alignment makes the CSV export a direct dump.
#[derive(Debug)]
pub struct SampleLog {
    capacity: usize,
    times: VecDeque<f64>,
    columns: Vec<VecDeque<f32>>,
}

impl SampleLog {
    pub fn new(sensor_count: usize, capacity: usize) -> Self {
        SampleLog {
            capacity,
            times: VecDeque::new(),
            columns: vec![VecDeque::new(); sensor_count],
        }
    }

    /// Append one batch. `values` pairs sensor ids with readings; ids
    /// outside the sensor table are ignored by the caller before this.
    pub fn append_row(&mut self, t_seconds: f64, values: &[(u8, f32)]) {
        if self.times.len() == self.capacity {
            self.times.pop_front();
            for column in &mut self.columns {
                column.pop_front();
            }
        }
        self.times.push_back(t_seconds);
        for column in &mut self.columns {
            column.push_back(f32::NAN);
        }
        for (sensor_id, value) in values {
            if let Some(cell) = self
                .columns
                .get_mut(*sensor_id as usize)
                .and_then(|column| column.back_mut())
            {
                *cell = *value;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    pub fn sensor_count(&self) -> usize {
        self.columns.len()
    }

    pub fn row(&self, index: usize) -> Option<(f64, Vec<f32>)> {
        let t = *self.times.get(index)?;
        let values = self
            .columns
            .iter()
            .map(|column| column[index])
            .collect();
        Some((t, values))
    }

    pub fn last_time(&self) -> Option<f64> {
        self.times.back().copied()
    }
}

pub type SharedSampleLog = Arc<RwLock<SampleLog>>;

/// Registry view of one live device session.
#[derive(Clone, Debug)]
pub struct DeviceHandle {
    pub name: String,
    pub kind: String,
    pub peer: SocketAddr,
    pub config: Arc<DeviceConfig>,
    /// Submissions to the session's serialized writer
    pub command_tx: mpsc::Sender<SessionCommand>,
    pub samples: SharedSampleLog,
    /// Last commanded state per control, index = cmd_id
    pub control_states: Arc<RwLock<Vec<ControlState>>>,
}

#[derive(Clone)]
pub struct SharedDevices {
    session: Session,
    devices: Arc<RwLock<HashMap<SocketAddr, DeviceHandle>>>,
}

impl SharedDevices {
    pub fn new(session: Session) -> Self {
        SharedDevices {
            session,
            devices: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// A device has completed its handshake.
    pub(crate) fn register(&self, handle: DeviceHandle) {
        log::info!(
            "Device '{}' ({}) registered from {}",
            handle.name,
            handle.kind,
            handle.peer
        );
        self.session.events().publish_log(
            crate::events::LogLevel::System,
            format!("Device {} registered from {}", handle.name, handle.peer),
        );

        let mut devices = self.devices.write().unwrap();
        if let Some(previous) = devices.insert(handle.peer, handle) {
            // Same peer address reconnecting before the old session finished
            // cleanup; the old entry is superseded.
            log::warn!(
                "Registry entry for {} replaced (was '{}')",
                previous.peer,
                previous.name
            );
        }
    }

    /// Remove a device. The session is already CLOSED when this runs.
    pub fn remove(&self, peer: &SocketAddr) -> Option<DeviceHandle> {
        let removed = self.devices.write().unwrap().remove(peer);
        if let Some(handle) = &removed {
            log::info!("Device '{}' removed from registry", handle.name);
        }
        removed
    }

    pub fn get_by_address(&self, peer: &SocketAddr) -> Option<DeviceHandle> {
        self.devices.read().unwrap().get(peer).cloned()
    }

    pub fn get_by_name(&self, name: &str) -> Option<DeviceHandle> {
        self.devices
            .read()
            .unwrap()
            .values()
            .find(|handle| handle.name.eq_ignore_ascii_case(name))
            .cloned()
    }

    /// Consistent snapshot of every registered device.
    pub fn snapshot(&self) -> Vec<DeviceHandle> {
        let mut handles: Vec<DeviceHandle> =
            self.devices.read().unwrap().values().cloned().collect();
        handles.sort_by(|a, b| a.name.cmp(&b.name));
        handles
    }

    pub fn len(&self) -> usize {
        self.devices.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.read().unwrap().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Session;

    fn fake_handle(name: &str, port: u16) -> DeviceHandle {
        let config = DeviceConfig::from_json(&format!(
            r#"{{"deviceName":"{}","deviceType":"Sensor Monitor"}}"#,
            name
        ))
        .unwrap();
        let (command_tx, _command_rx) = mpsc::channel(1);
        DeviceHandle {
            name: name.to_string(),
            kind: config.kind.clone(),
            peer: format!("10.0.0.1:{}", port).parse().unwrap(),
            config: Arc::new(config),
            command_tx,
            samples: Arc::new(RwLock::new(SampleLog::new(0, 16))),
            control_states: Arc::new(RwLock::new(Vec::new())),
        }
    }

    #[test]
    fn test_register_get_remove() {
        let devices = SharedDevices::new(Session::new_fake());
        let handle = fake_handle("Stand", 1234);
        let peer = handle.peer;

        devices.register(handle);
        assert_eq!(devices.len(), 1);
        assert!(devices.get_by_address(&peer).is_some());
        assert!(devices.get_by_name("stand").is_some());
        assert!(devices.get_by_name("other").is_none());

        devices.remove(&peer);
        assert!(devices.get_by_address(&peer).is_none());
        assert!(devices.is_empty());
    }

    #[test]
    fn test_snapshot_is_sorted_by_name() {
        let devices = SharedDevices::new(Session::new_fake());
        devices.register(fake_handle("Bravo", 1));
        devices.register(fake_handle("Alpha", 2));

        let names: Vec<String> = devices.snapshot().iter().map(|h| h.name.clone()).collect();
        assert_eq!(names, vec!["Alpha", "Bravo"]);
    }

    #[test]
    fn test_sample_log_rolls_over() {
        let mut samples = SampleLog::new(2, 3);
        for i in 0..5 {
            samples.append_row(i as f64, &[(0, i as f32), (1, -(i as f32))]);
        }
        assert_eq!(samples.len(), 3);
        let (t, values) = samples.row(0).unwrap();
        assert_eq!(t, 2.0);
        assert_eq!(values, vec![2.0, -2.0]);
        assert_eq!(samples.last_time(), Some(4.0));
    }

    #[test]
    fn test_sample_log_missing_sensor_is_nan() {
        let mut samples = SampleLog::new(2, 8);
        samples.append_row(1.0, &[(1, 42.0)]);
        let (_, values) = samples.row(0).unwrap();
        assert!(values[0].is_nan());
        assert_eq!(values[1], 42.0);
    }
}
