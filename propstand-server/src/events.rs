//! Event bus
//!
//! Typed pub/sub feeding the external sidecars (log aggregator, GUI data
//! stream, recorder). Two channels: `data` carries one event per sensor
//! reading plus a terminator when a device goes away, `log` carries
//! structured log lines.
//!
//! Delivery is at-most-once and best-effort: channels are bounded and a
//! subscriber that cannot keep up loses the oldest events. Producers never
//! block, so a slow consumer cannot stall a device's read loop.

use propstand_core::packet::Unit;
use tokio::sync::broadcast;

const DATA_CHANNEL_CAPACITY: usize = 256;
const LOG_CHANNEL_CAPACITY: usize = 64;

/// One reconciled sensor reading.
#[derive(Clone, Debug, PartialEq)]
pub struct SampleEvent {
    pub device: String,
    pub sensor: String,
    pub unit: Unit,
    pub value: f32,
    /// Server monotonic seconds (session-start epoch)
    pub t_server_seconds: f64,
    /// True when no sync anchor existed and receive time was used instead
    pub approx: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub enum DataEvent {
    Sample(SampleEvent),
    /// Terminator: no more samples will follow for this device
    DeviceOffline { device: String },
}

/// Severity lanes, mirroring the log/syslog/errlog/debuglog split the
/// sidecar consumes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    System,
    Error,
    Debug,
}

#[derive(Clone, Debug, PartialEq)]
pub struct LogEvent {
    pub level: LogLevel,
    pub message: String,
}

#[derive(Clone, Debug)]
pub struct EventBus {
    data_tx: broadcast::Sender<DataEvent>,
    log_tx: broadcast::Sender<LogEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (data_tx, _) = broadcast::channel(DATA_CHANNEL_CAPACITY);
        let (log_tx, _) = broadcast::channel(LOG_CHANNEL_CAPACITY);
        EventBus { data_tx, log_tx }
    }

    pub fn data_subscribe(&self) -> broadcast::Receiver<DataEvent> {
        self.data_tx.subscribe()
    }

    pub fn log_subscribe(&self) -> broadcast::Receiver<LogEvent> {
        self.log_tx.subscribe()
    }

    /// Publish a data event. Never blocks; without subscribers the event is
    /// simply dropped.
    pub fn publish_data(&self, event: DataEvent) {
        match self.data_tx.send(event) {
            Err(_) => {}
            Ok(count) => {
                log::trace!("data event sent to {} receivers", count);
            }
        }
    }

    /// Publish a structured log line to the bus (in addition to whatever
    /// the process logger does).
    pub fn publish_log(&self, level: LogLevel, message: impl Into<String>) {
        let _ = self.log_tx.send(LogEvent {
            level,
            message: message.into(),
        });
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
