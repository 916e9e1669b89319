//! Per-device session state machine
//!
//! One task per accepted connection:
//!
//! ```text
//! AWAITING_CONFIG -> AWAITING_SYNC -> READY (streaming|idle) -> CLOSED
//! ```
//!
//! The first packet must be CONFIG; the server ACKs it, sends TIMESYNC and
//! waits for the matching ACK before the device is registered. In READY the
//! task multiplexes the socket reader, the serialized command writer and
//! the timer set (heartbeat, periodic resync, deadline sweep) with
//! `tokio::select!`. All faults are local to the connection: the session
//! closes, fails its waiters with `Disconnected`, unregisters and emits the
//! offline terminator, and the acceptor keeps running.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use propstand_core::device::DeviceConfig;
use propstand_core::error::ProtocolError;
use propstand_core::frame::FrameBuffer;
use propstand_core::packet::{
    Body, ControlState, DeviceStatus, Packet, PacketType, SensorReading,
};
use propstand_core::timesync::SyncAnchor;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval_at, timeout, Instant as TokioInstant};
use tokio_graceful_shutdown::SubsystemHandle;

use crate::dispatcher::CommandError;
use crate::events::{DataEvent, EventBus, LogLevel, SampleEvent};
use crate::registry::{DeviceHandle, SampleLog, SharedDevices, SAMPLE_LOG_ROWS};
use crate::Session;

pub(crate) const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
pub(crate) const HEARTBEAT_MISS_LIMIT: u32 = 2;
pub(crate) const RESYNC_INTERVAL: Duration = Duration::from_secs(600);
pub(crate) const ACK_DEADLINE: Duration = Duration::from_secs(2);
pub(crate) const SWEEP_INTERVAL: Duration = Duration::from_millis(250);
pub(crate) const HANDSHAKE_DEADLINE: Duration = Duration::from_secs(10);
pub(crate) const SYNC_ACK_DEADLINE: Duration = Duration::from_secs(3);

const READ_CHUNK: usize = 4096;
const COMMAND_QUEUE_DEPTH: usize = 16;

/// Why a session ended (or could not start)
#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("I/O operation failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Protocol(#[from] ProtocolError),
    #[error("Handshake failed: {0}")]
    Handshake(String),
    #[error("No CONFIG within the handshake deadline")]
    HandshakeTimeout,
    #[error("No TIMESYNC acknowledgement")]
    SyncTimeout,
    #[error("Peer closed the connection")]
    PeerClosed,
    #[error("{0} consecutive heartbeats unacknowledged")]
    HeartbeatLoss(u32),
    #[error("Evicted from registry")]
    Evicted,
    #[error("Shutdown")]
    Shutdown,
}

/// Request kinds callers may enqueue on a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandRequest {
    Status,
    GetSingle,
    StreamStart { freq_hz: u16 },
    StreamStop,
    Control { command_id: u8, state: ControlState },
    Estop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandReply {
    /// The device acknowledged the request
    Ack,
    /// STATUS response payload
    Status(DeviceStatus),
    /// ESTOP was written to the socket (no ACK is awaited)
    EstopSent,
}

/// One submission to the session's serialized writer.
#[derive(Debug)]
pub struct SessionCommand {
    pub request: CommandRequest,
    pub reply_tx: oneshot::Sender<Result<CommandReply, CommandError>>,
}

enum Waiter {
    Command {
        reply_tx: oneshot::Sender<Result<CommandReply, CommandError>>,
        /// For CONTROL: state to record in the ledger once acknowledged
        control: Option<(u8, ControlState)>,
    },
    Heartbeat,
    TimeSync,
}

struct PendingAck {
    packet_type: PacketType,
    deadline: Instant,
    waiter: Waiter,
}

impl PendingAck {
    fn fail(self, error: CommandError) {
        if let Waiter::Command { reply_tx, .. } = self.waiter {
            let _ = reply_tx.send(Err(error));
        }
    }
}

struct StatusWaiter {
    deadline: Instant,
    reply_tx: oneshot::Sender<Result<CommandReply, CommandError>>,
}

pub(crate) struct DeviceSession {
    devices: SharedDevices,
    events: EventBus,
    peer: SocketAddr,
    /// Peer address until CONFIG names the device
    key: String,
    /// Epoch for outbound header timestamps and the server second axis
    started: Instant,
    strict_timestamps: bool,

    sequence: u8,
    pending: [Option<PendingAck>; 256],
    status_waiters: VecDeque<StatusWaiter>,
    anchor: Option<SyncAnchor>,
    heartbeat_outstanding: bool,
    heartbeat_misses: u32,
    last_sample_time: f64,

    config: Option<Arc<DeviceConfig>>,
    samples: Option<crate::registry::SharedSampleLog>,
    control_states: Option<Arc<RwLock<Vec<ControlState>>>>,
    registered: bool,

    frames: FrameBuffer,
}

impl DeviceSession {
    pub fn new(session: Session, devices: SharedDevices, peer: SocketAddr) -> Self {
        let args = session.args();
        DeviceSession {
            devices,
            events: session.events(),
            peer,
            key: peer.to_string(),
            started: Instant::now(),
            strict_timestamps: args.strict_timestamps,
            sequence: 0,
            pending: std::array::from_fn(|_| None),
            status_waiters: VecDeque::new(),
            anchor: None,
            heartbeat_outstanding: false,
            heartbeat_misses: 0,
            last_sample_time: f64::NEG_INFINITY,
            config: None,
            samples: None,
            control_states: None,
            registered: false,
            frames: FrameBuffer::new(),
        }
    }

    pub async fn run(mut self, stream: TcpStream, subsys: SubsystemHandle) -> Result<(), DeviceError> {
        let (mut reader, mut writer) = tokio::io::split(stream);

        let result = self.drive(&mut reader, &mut writer, &subsys).await;
        match &result {
            Err(DeviceError::Shutdown) => log::info!("{}: shutdown", self.key),
            Err(DeviceError::PeerClosed) => log::info!("{}: disconnected", self.key),
            Err(e) => log::error!("{}: {}", self.key, e),
            Ok(()) => {}
        }
        self.close();

        // Per-connection faults never take the acceptor down.
        Ok(())
    }

    async fn drive<R, W>(
        &mut self,
        reader: &mut R,
        writer: &mut W,
        subsys: &SubsystemHandle,
    ) -> Result<(), DeviceError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        tokio::select! { biased;
            _ = subsys.on_shutdown_requested() => {
                return Err(DeviceError::Shutdown);
            },
            r = timeout(HANDSHAKE_DEADLINE, self.handshake(reader, writer)) => {
                match r {
                    Err(_) => return Err(DeviceError::HandshakeTimeout),
                    Ok(r) => r?,
                }
            },
        }

        let (command_tx, mut command_rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        self.register(command_tx);

        self.ready_loop(reader, writer, subsys, &mut command_rx).await
    }

    // ------------------------------------------------------------------
    // Handshake: AWAITING_CONFIG then AWAITING_SYNC
    // ------------------------------------------------------------------

    async fn handshake<R, W>(&mut self, reader: &mut R, writer: &mut W) -> Result<(), DeviceError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let frame = self.read_frame(reader).await?;
        let packet = Packet::decode(&frame)?;
        let Body::Config { json } = packet.body else {
            return Err(DeviceError::Handshake(format!(
                "first packet was {:?}, expected CONFIG",
                packet.body.packet_type()
            )));
        };

        // A malformed CONFIG fails the handshake: no ACK, connection drops.
        let config = DeviceConfig::from_json(&json)?;
        log::info!(
            "{}: CONFIG for '{}' ({}): {} sensors, {} controls",
            self.peer,
            config.name,
            config.kind,
            config.sensors.len(),
            config.controls.len()
        );
        self.adopt_config(config);

        let ack = self.next_packet(Body::Ack {
            acked: PacketType::Config,
            acked_seq: packet.sequence,
        });
        writer.write_all(&ack.encode()).await?;

        let sync = self.next_packet(Body::TimeSync);
        let sync_seq = sync.sequence;
        writer.write_all(&sync.encode()).await?;
        writer.flush().await?;

        match timeout(SYNC_ACK_DEADLINE, self.await_sync_ack(reader, sync_seq)).await {
            Err(_) => Err(DeviceError::SyncTimeout),
            Ok(r) => r,
        }
    }

    async fn await_sync_ack<R>(&mut self, reader: &mut R, sync_seq: u8) -> Result<(), DeviceError>
    where
        R: AsyncRead + Unpin,
    {
        loop {
            let frame = self.read_frame(reader).await?;
            let packet = Packet::decode(&frame)?;
            match packet.body {
                Body::Ack {
                    acked: PacketType::TimeSync,
                    acked_seq,
                } if acked_seq == sync_seq => {
                    // Anchor: device ms at ACK send, server seconds at receipt
                    self.anchor = Some(SyncAnchor::new(packet.timestamp, self.now_seconds()));
                    log::info!("{}: TIMESYNC anchored at device {} ms", self.key, packet.timestamp);
                    return Ok(());
                }
                Body::Nack {
                    nacked: PacketType::TimeSync,
                    error,
                    ..
                } => {
                    return Err(DeviceError::Handshake(format!(
                        "device refused TIMESYNC: {}",
                        error
                    )));
                }
                ref other => {
                    log::debug!(
                        "{}: ignoring {:?} while awaiting sync",
                        self.key,
                        other.packet_type()
                    );
                }
            }
        }
    }

    fn adopt_config(&mut self, config: DeviceConfig) {
        self.key = config.name.clone();
        // Devices boot with every control at its default state.
        let states: Vec<ControlState> = config.controls.iter().map(|c| c.default_state).collect();
        self.control_states = Some(Arc::new(RwLock::new(states)));
        self.samples = Some(Arc::new(RwLock::new(SampleLog::new(
            config.sensors.len(),
            SAMPLE_LOG_ROWS,
        ))));
        self.config = Some(Arc::new(config));
    }

    fn register(&mut self, command_tx: mpsc::Sender<SessionCommand>) {
        // adopt_config ran during the handshake; these are always present.
        let (Some(config), Some(samples), Some(control_states)) = (
            self.config.clone(),
            self.samples.clone(),
            self.control_states.clone(),
        ) else {
            return;
        };

        self.devices.register(DeviceHandle {
            name: config.name.clone(),
            kind: config.kind.clone(),
            peer: self.peer,
            config,
            command_tx,
            samples,
            control_states,
        });
        self.registered = true;
    }

    // ------------------------------------------------------------------
    // READY: inbound, outbound and timers in one select loop
    // ------------------------------------------------------------------

    async fn ready_loop<R, W>(
        &mut self,
        reader: &mut R,
        writer: &mut W,
        subsys: &SubsystemHandle,
        command_rx: &mut mpsc::Receiver<SessionCommand>,
    ) -> Result<(), DeviceError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut chunk = [0u8; READ_CHUNK];
        let mut heartbeat = interval_at(
            TokioInstant::now() + HEARTBEAT_INTERVAL,
            HEARTBEAT_INTERVAL,
        );
        let mut resync = interval_at(TokioInstant::now() + RESYNC_INTERVAL, RESYNC_INTERVAL);
        let mut sweep = interval_at(TokioInstant::now() + SWEEP_INTERVAL, SWEEP_INTERVAL);

        loop {
            tokio::select! { biased;
                _ = subsys.on_shutdown_requested() => {
                    return Err(DeviceError::Shutdown);
                },

                r = reader.read(&mut chunk) => {
                    let n = r?;
                    if n == 0 {
                        return Err(DeviceError::PeerClosed);
                    }
                    self.frames.extend(&chunk[..n]);
                    while let Some(frame) = self.frames.next_frame()? {
                        self.handle_frame(&frame)?;
                    }
                },

                r = command_rx.recv() => {
                    match r {
                        Some(command) => self.submit(writer, command).await?,
                        // Registry slot was taken over by a reconnect.
                        None => return Err(DeviceError::Evicted),
                    }
                },

                _ = heartbeat.tick() => self.heartbeat_tick(writer).await?,

                _ = resync.tick() => self.resync_tick(writer).await?,

                _ = sweep.tick() => self.sweep_deadlines(),
            }
        }
    }

    /// Classify one inbound packet. Unknown types are skipped (the server
    /// never NACKs); every other decode failure is fatal to the connection.
    fn handle_frame(&mut self, frame: &[u8]) -> Result<(), DeviceError> {
        let packet = match Packet::decode(frame) {
            Ok(packet) => packet,
            Err(ProtocolError::UnknownPacketType(raw)) => {
                log::warn!("{}: ignoring unknown packet type {:#04X}", self.key, raw);
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        match &packet.body {
            Body::Data { readings } => self.handle_data(packet.timestamp, readings),
            Body::Status { status } => {
                if let Some(waiter) = self.status_waiters.pop_front() {
                    let _ = waiter.reply_tx.send(Ok(CommandReply::Status(*status)));
                } else {
                    log::debug!("{}: unsolicited STATUS {:?}", self.key, status);
                }
            }
            Body::Ack { acked, acked_seq } => {
                self.complete(*acked, *acked_seq, packet.timestamp, Ok(CommandReply::Ack));
            }
            Body::Nack {
                nacked,
                nacked_seq,
                error,
            } => {
                log::error!("{}: NACK for {:?} error={}", self.key, nacked, error);
                self.complete(
                    *nacked,
                    *nacked_seq,
                    packet.timestamp,
                    Err(CommandError::Nack(*error)),
                );
            }
            Body::Config { .. } => {
                log::warn!("{}: unexpected CONFIG after handshake, ignoring", self.key);
            }
            other => {
                log::warn!(
                    "{}: unexpected {:?} from device, ignoring",
                    self.key,
                    other.packet_type()
                );
            }
        }
        Ok(())
    }

    fn handle_data(&mut self, device_ms: u32, readings: &[SensorReading]) {
        let (t, approx) = match &self.anchor {
            Some(anchor) => (anchor.project(device_ms), false),
            None => {
                log::warn!("{}: DATA before TIMESYNC, using server receive time", self.key);
                (self.now_seconds(), true)
            }
        };

        if self.strict_timestamps && t < self.last_sample_time {
            log::error!(
                "{}: out-of-order sample at {:.3}s (last {:.3}s), dropped",
                self.key,
                t,
                self.last_sample_time
            );
            return;
        }
        self.last_sample_time = self.last_sample_time.max(t);

        let Some(config) = self.config.clone() else {
            return;
        };

        let mut row = Vec::with_capacity(readings.len());
        for reading in readings {
            let Some(sensor) = config.sensor(reading.sensor_id) else {
                log::warn!(
                    "{}: reading for unknown sensor id {}",
                    self.key,
                    reading.sensor_id
                );
                continue;
            };
            row.push((reading.sensor_id, reading.value));
            log::debug!(
                "{} {:.3} {}:{:.2}",
                self.key,
                t,
                sensor.name,
                reading.value
            );
            self.events.publish_data(DataEvent::Sample(SampleEvent {
                device: config.name.clone(),
                sensor: sensor.name.clone(),
                unit: reading.unit,
                value: reading.value,
                t_server_seconds: t,
                approx,
            }));
        }

        if !row.is_empty() {
            if let Some(samples) = &self.samples {
                samples.write().unwrap().append_row(t, &row);
            }
        }
    }

    /// Match an ACK/NACK against the pending table by (type, sequence).
    fn complete(
        &mut self,
        acked: PacketType,
        acked_seq: u8,
        device_ms: u32,
        outcome: Result<CommandReply, CommandError>,
    ) {
        let index = acked_seq as usize;
        match self.pending[index].take() {
            Some(entry) if entry.packet_type == acked => match entry.waiter {
                Waiter::Command { reply_tx, control } => {
                    if outcome.is_ok() {
                        if let (Some((command_id, state)), Some(states)) =
                            (control, &self.control_states)
                        {
                            if let Some(slot) =
                                states.write().unwrap().get_mut(command_id as usize)
                            {
                                *slot = state;
                            }
                        }
                    }
                    let _ = reply_tx.send(outcome);
                }
                Waiter::Heartbeat => {
                    self.heartbeat_outstanding = false;
                    self.heartbeat_misses = 0;
                    if let Err(e) = outcome {
                        log::warn!("{}: heartbeat refused: {}", self.key, e);
                    }
                }
                Waiter::TimeSync => match outcome {
                    Ok(_) => {
                        self.anchor = Some(SyncAnchor::new(device_ms, self.now_seconds()));
                        log::debug!("{}: re-anchored at device {} ms", self.key, device_ms);
                    }
                    Err(e) => {
                        log::warn!("{}: resync refused ({}), keeping previous anchor", self.key, e);
                    }
                },
            },
            Some(entry) => {
                log::debug!(
                    "{}: ACK type {:?} does not match pending {:?} for seq {}",
                    self.key,
                    acked,
                    entry.packet_type,
                    acked_seq
                );
                self.pending[index] = Some(entry);
            }
            None => {
                log::debug!("{}: unmatched ACK for {:?} seq {}", self.key, acked, acked_seq);
            }
        }
    }

    // ------------------------------------------------------------------
    // Outbound
    // ------------------------------------------------------------------

    async fn submit<W>(&mut self, writer: &mut W, command: SessionCommand) -> Result<(), DeviceError>
    where
        W: AsyncWrite + Unpin,
    {
        let SessionCommand { request, reply_tx } = command;
        match request {
            CommandRequest::Estop => {
                // Deliverable in any READY state: written immediately, no
                // ACK awaited, no health check.
                let packet = self.next_packet(Body::Estop);
                writer.write_all(&packet.encode()).await?;
                writer.flush().await?;
                if let (Some(config), Some(states)) = (&self.config, &self.control_states) {
                    let mut states = states.write().unwrap();
                    for (slot, control) in states.iter_mut().zip(&config.controls) {
                        *slot = control.default_state;
                    }
                }
                log::info!("{}: ESTOP written", self.key);
                self.events
                    .publish_log(LogLevel::System, format!("ESTOP sent to {}", self.key));
                let _ = reply_tx.send(Ok(CommandReply::EstopSent));
            }
            CommandRequest::Status => {
                let packet = self.next_packet(Body::StatusRequest);
                writer.write_all(&packet.encode()).await?;
                writer.flush().await?;
                self.status_waiters.push_back(StatusWaiter {
                    deadline: Instant::now() + ACK_DEADLINE,
                    reply_tx,
                });
            }
            CommandRequest::GetSingle => {
                self.send_tracked(writer, Body::GetSingle, None, reply_tx).await?;
            }
            CommandRequest::StreamStart { freq_hz } => {
                self.send_tracked(writer, Body::StreamStart { freq_hz }, None, reply_tx)
                    .await?;
            }
            CommandRequest::StreamStop => {
                self.send_tracked(writer, Body::StreamStop, None, reply_tx).await?;
            }
            CommandRequest::Control { command_id, state } => {
                self.send_tracked(
                    writer,
                    Body::Control { command_id, state },
                    Some((command_id, state)),
                    reply_tx,
                )
                .await?;
            }
        }
        Ok(())
    }

    /// Write an ACK-bearing packet and arm its waiter.
    async fn send_tracked<W>(
        &mut self,
        writer: &mut W,
        body: Body,
        control: Option<(u8, ControlState)>,
        reply_tx: oneshot::Sender<Result<CommandReply, CommandError>>,
    ) -> Result<(), DeviceError>
    where
        W: AsyncWrite + Unpin,
    {
        let packet = self.next_packet(body);
        let seq = packet.sequence;
        let packet_type = packet.body.packet_type();
        writer.write_all(&packet.encode()).await?;
        writer.flush().await?;

        if let Some(stale) = self.pending[seq as usize].take() {
            // 256 sends within one deadline window; the old waiter lost.
            stale.fail(CommandError::Timeout);
        }
        self.pending[seq as usize] = Some(PendingAck {
            packet_type,
            deadline: Instant::now() + ACK_DEADLINE,
            waiter: Waiter::Command { reply_tx, control },
        });
        log::debug!("{}: sent {:?} seq {}", self.key, packet_type, seq);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------

    async fn heartbeat_tick<W>(&mut self, writer: &mut W) -> Result<(), DeviceError>
    where
        W: AsyncWrite + Unpin,
    {
        if self.heartbeat_outstanding {
            self.heartbeat_misses += 1;
            log::warn!(
                "{}: heartbeat unacknowledged ({}/{})",
                self.key,
                self.heartbeat_misses,
                HEARTBEAT_MISS_LIMIT
            );
            if self.heartbeat_misses >= HEARTBEAT_MISS_LIMIT {
                return Err(DeviceError::HeartbeatLoss(self.heartbeat_misses));
            }
        }

        let packet = self.next_packet(Body::Heartbeat);
        let seq = packet.sequence;
        writer.write_all(&packet.encode()).await?;
        writer.flush().await?;
        if let Some(stale) = self.pending[seq as usize].take() {
            stale.fail(CommandError::Timeout);
        }
        self.pending[seq as usize] = Some(PendingAck {
            packet_type: PacketType::Heartbeat,
            deadline: Instant::now() + ACK_DEADLINE,
            waiter: Waiter::Heartbeat,
        });
        self.heartbeat_outstanding = true;
        Ok(())
    }

    async fn resync_tick<W>(&mut self, writer: &mut W) -> Result<(), DeviceError>
    where
        W: AsyncWrite + Unpin,
    {
        let packet = self.next_packet(Body::TimeSync);
        let seq = packet.sequence;
        writer.write_all(&packet.encode()).await?;
        writer.flush().await?;
        if let Some(stale) = self.pending[seq as usize].take() {
            stale.fail(CommandError::Timeout);
        }
        self.pending[seq as usize] = Some(PendingAck {
            packet_type: PacketType::TimeSync,
            deadline: Instant::now() + ACK_DEADLINE,
            waiter: Waiter::TimeSync,
        });
        log::debug!("{}: resync sent", self.key);
        Ok(())
    }

    /// Fail expired waiters with TIMEOUT. A timeout does not close the
    /// connection; the device may simply be busy.
    fn sweep_deadlines(&mut self) {
        let now = Instant::now();

        for slot in self.pending.iter_mut() {
            let expired = matches!(slot, Some(entry) if entry.deadline <= now);
            if !expired {
                continue;
            }
            if let Some(entry) = slot.take() {
                match entry.waiter {
                    Waiter::Command { reply_tx, .. } => {
                        log::warn!("{}: {:?} timed out", self.key, entry.packet_type);
                        let _ = reply_tx.send(Err(CommandError::Timeout));
                    }
                    // Misses are counted at the next heartbeat tick.
                    Waiter::Heartbeat => {}
                    Waiter::TimeSync => {
                        log::warn!("{}: resync ACK timed out, keeping previous anchor", self.key);
                    }
                }
            }
        }

        while matches!(self.status_waiters.front(), Some(w) if w.deadline <= now) {
            if let Some(waiter) = self.status_waiters.pop_front() {
                log::warn!("{}: STATUS timed out", self.key);
                let _ = waiter.reply_tx.send(Err(CommandError::Timeout));
            }
        }
    }

    // ------------------------------------------------------------------
    // CLOSED
    // ------------------------------------------------------------------

    fn close(&mut self) {
        for slot in self.pending.iter_mut() {
            if let Some(entry) = slot.take() {
                entry.fail(CommandError::Disconnected);
            }
        }
        while let Some(waiter) = self.status_waiters.pop_front() {
            let _ = waiter.reply_tx.send(Err(CommandError::Disconnected));
        }

        if self.registered {
            self.devices.remove(&self.peer);
            self.events.publish_data(DataEvent::DeviceOffline {
                device: self.key.clone(),
            });
            self.events
                .publish_log(LogLevel::System, format!("Device {} offline", self.key));
            self.registered = false;
        }
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    async fn read_frame<R>(&mut self, reader: &mut R) -> Result<Vec<u8>, DeviceError>
    where
        R: AsyncRead + Unpin,
    {
        loop {
            if let Some(frame) = self.frames.next_frame()? {
                return Ok(frame);
            }
            let mut chunk = [0u8; READ_CHUNK];
            let n = reader.read(&mut chunk).await?;
            if n == 0 {
                return Err(DeviceError::PeerClosed);
            }
            self.frames.extend(&chunk[..n]);
        }
    }

    /// Allocate the next outbound packet. Every server->device packet goes
    /// through here so sequence numbers stay strictly increasing mod 256.
    fn next_packet(&mut self, body: Body) -> Packet {
        let sequence = self.sequence;
        self.sequence = self.sequence.wrapping_add(1);
        Packet::new(sequence, self.now_ms(), body)
    }

    fn now_ms(&self) -> u32 {
        self.started.elapsed().as_millis() as u32
    }

    fn now_seconds(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use propstand_core::packet::{ErrorCode, Unit};

    const CONFIG_JSON: &str = r#"{
        "deviceName": "GroundStand",
        "deviceType": "Sensor Monitor",
        "sensorInfo": {
            "pressureTransducers": {
                "PT1": {"pin": 5, "units": "PSI"},
                "PT2": {"pin": 6, "units": "PSI"}
            }
        },
        "controls": {
            "AVFILL": {"pin": 10, "type": "valve", "defaultState": "CLOSED"},
            "AVVENT": {"pin": 11, "type": "valve", "defaultState": "CLOSED"}
        }
    }"#;

    fn test_session() -> DeviceSession {
        let session = Session::new_fake();
        let devices = SharedDevices::new(session.clone());
        let mut device = DeviceSession::new(session, devices, "10.0.0.5:40001".parse().unwrap());
        device.adopt_config(DeviceConfig::from_json(CONFIG_JSON).unwrap());
        device
    }

    fn ack_frame(acked: PacketType, acked_seq: u8, device_ms: u32) -> Vec<u8> {
        Packet::new(0, device_ms, Body::Ack { acked, acked_seq }).encode()
    }

    #[test]
    fn test_sequence_strictly_advances_mod_256() {
        let mut device = test_session();
        device.sequence = 254;
        let seqs: Vec<u8> = (0..4)
            .map(|_| device.next_packet(Body::Heartbeat).sequence)
            .collect();
        assert_eq!(seqs, vec![254, 255, 0, 1]);
    }

    #[tokio::test]
    async fn test_control_ack_completes_waiter_and_records_state() {
        let mut device = test_session();
        let mut wire: Vec<u8> = Vec::new();
        let (reply_tx, reply_rx) = oneshot::channel();

        device
            .submit(
                &mut wire,
                SessionCommand {
                    request: CommandRequest::Control {
                        command_id: 0,
                        state: ControlState::Open,
                    },
                    reply_tx,
                },
            )
            .await
            .unwrap();

        let sent = Packet::decode(&wire).unwrap();
        assert_eq!(
            sent.body,
            Body::Control {
                command_id: 0,
                state: ControlState::Open
            }
        );

        device
            .handle_frame(&ack_frame(PacketType::Control, sent.sequence, 123))
            .unwrap();

        assert_eq!(reply_rx.await.unwrap(), Ok(CommandReply::Ack));
        let states = device.control_states.as_ref().unwrap().read().unwrap();
        assert_eq!(states[0], ControlState::Open);
        assert_eq!(states[1], ControlState::Closed);
    }

    #[tokio::test]
    async fn test_nack_surfaces_error_code_and_session_survives() {
        let mut device = test_session();
        let mut wire: Vec<u8> = Vec::new();
        let (reply_tx, reply_rx) = oneshot::channel();

        device
            .submit(
                &mut wire,
                SessionCommand {
                    request: CommandRequest::Control {
                        command_id: 9,
                        state: ControlState::Open,
                    },
                    reply_tx,
                },
            )
            .await
            .unwrap();
        let seq = Packet::decode(&wire).unwrap().sequence;

        let nack = Packet::new(
            0,
            50,
            Body::Nack {
                nacked: PacketType::Control,
                nacked_seq: seq,
                error: ErrorCode::InvalidId,
            },
        )
        .encode();
        device.handle_frame(&nack).unwrap();

        assert_eq!(
            reply_rx.await.unwrap(),
            Err(CommandError::Nack(ErrorCode::InvalidId))
        );
        // Ledger untouched on NACK
        let states = device.control_states.as_ref().unwrap().read().unwrap();
        assert_eq!(states[0], ControlState::Closed);
    }

    #[tokio::test]
    async fn test_ack_with_wrong_type_leaves_waiter_pending() {
        let mut device = test_session();
        let mut wire: Vec<u8> = Vec::new();
        let (reply_tx, mut reply_rx) = oneshot::channel();

        device
            .submit(
                &mut wire,
                SessionCommand {
                    request: CommandRequest::GetSingle,
                    reply_tx,
                },
            )
            .await
            .unwrap();
        let seq = Packet::decode(&wire).unwrap().sequence;

        device
            .handle_frame(&ack_frame(PacketType::Heartbeat, seq, 0))
            .unwrap();
        assert!(reply_rx.try_recv().is_err());
        assert!(device.pending[seq as usize].is_some());
    }

    #[tokio::test]
    async fn test_data_is_projected_through_anchor() {
        let mut device = test_session();
        device.anchor = Some(SyncAnchor::new(10_000, 100.0));
        let mut rx = device.events.data_subscribe();

        let data = Packet::new(
            0,
            10_500,
            Body::Data {
                readings: vec![SensorReading {
                    sensor_id: 0,
                    unit: Unit::Psi,
                    value: 38.6,
                }],
            },
        )
        .encode();
        device.handle_frame(&data).unwrap();

        match rx.try_recv().unwrap() {
            DataEvent::Sample(sample) => {
                assert_eq!(sample.device, "GroundStand");
                assert_eq!(sample.sensor, "PT1");
                assert!((sample.t_server_seconds - 100.5).abs() < 1e-9);
                assert!(!sample.approx);
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(device.samples.as_ref().unwrap().read().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_data_without_anchor_is_approximate() {
        let mut device = test_session();
        let mut rx = device.events.data_subscribe();

        let data = Packet::new(
            0,
            42,
            Body::Data {
                readings: vec![SensorReading {
                    sensor_id: 1,
                    unit: Unit::Psi,
                    value: 1.0,
                }],
            },
        )
        .encode();
        device.handle_frame(&data).unwrap();

        match rx.try_recv().unwrap() {
            DataEvent::Sample(sample) => assert!(sample.approx),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_strict_mode_drops_out_of_order_samples() {
        let mut device = test_session();
        device.strict_timestamps = true;
        device.anchor = Some(SyncAnchor::new(10_000, 100.0));

        let reading = |ms| {
            Packet::new(
                0,
                ms,
                Body::Data {
                    readings: vec![SensorReading {
                        sensor_id: 0,
                        unit: Unit::Psi,
                        value: 1.0,
                    }],
                },
            )
            .encode()
        };

        device.handle_frame(&reading(10_500)).unwrap();
        // Wrapped delta lands 300 ms before the anchor: out of order
        device.handle_frame(&reading(4_294_967_196)).unwrap();

        assert_eq!(device.samples.as_ref().unwrap().read().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_heartbeat_loss_closes_after_two_misses() {
        let mut device = test_session();
        let mut wire: Vec<u8> = Vec::new();

        device.heartbeat_tick(&mut wire).await.unwrap();
        device.heartbeat_tick(&mut wire).await.unwrap(); // miss 1
        let result = device.heartbeat_tick(&mut wire).await; // miss 2
        assert!(matches!(result, Err(DeviceError::HeartbeatLoss(2))));
    }

    #[tokio::test]
    async fn test_heartbeat_ack_resets_miss_counter() {
        let mut device = test_session();
        let mut wire: Vec<u8> = Vec::new();

        device.heartbeat_tick(&mut wire).await.unwrap();
        let seq = Packet::decode(&wire).unwrap().sequence;
        device
            .handle_frame(&ack_frame(PacketType::Heartbeat, seq, 0))
            .unwrap();

        assert!(!device.heartbeat_outstanding);
        assert_eq!(device.heartbeat_misses, 0);
    }

    #[tokio::test]
    async fn test_timesync_ack_re_anchors() {
        let mut device = test_session();
        device.anchor = Some(SyncAnchor::new(1, 1.0));
        let mut wire: Vec<u8> = Vec::new();

        device.resync_tick(&mut wire).await.unwrap();
        let seq = Packet::decode(&wire).unwrap().sequence;
        device
            .handle_frame(&ack_frame(PacketType::TimeSync, seq, 777_000))
            .unwrap();

        assert_eq!(device.anchor.unwrap().device_ms, 777_000);
    }

    #[tokio::test]
    async fn test_estop_writes_and_records_default_states() {
        let mut device = test_session();
        {
            let states = device.control_states.as_ref().unwrap();
            states.write().unwrap()[0] = ControlState::Open;
        }

        let mut wire: Vec<u8> = Vec::new();
        let (reply_tx, reply_rx) = oneshot::channel();
        device
            .submit(
                &mut wire,
                SessionCommand {
                    request: CommandRequest::Estop,
                    reply_tx,
                },
            )
            .await
            .unwrap();

        assert_eq!(Packet::decode(&wire).unwrap().body, Body::Estop);
        assert_eq!(reply_rx.await.unwrap(), Ok(CommandReply::EstopSent));
        let states = device.control_states.as_ref().unwrap().read().unwrap();
        assert_eq!(*states, vec![ControlState::Closed, ControlState::Closed]);
    }

    #[tokio::test]
    async fn test_expired_waiter_fails_with_timeout() {
        let mut device = test_session();
        let mut wire: Vec<u8> = Vec::new();
        let (reply_tx, reply_rx) = oneshot::channel();

        device
            .submit(
                &mut wire,
                SessionCommand {
                    request: CommandRequest::StreamStop,
                    reply_tx,
                },
            )
            .await
            .unwrap();
        let seq = Packet::decode(&wire).unwrap().sequence;

        device.pending[seq as usize].as_mut().unwrap().deadline =
            Instant::now() - Duration::from_millis(1);
        device.sweep_deadlines();

        assert_eq!(reply_rx.await.unwrap(), Err(CommandError::Timeout));
        assert!(device.pending[seq as usize].is_none());
    }

    #[tokio::test]
    async fn test_close_fails_all_waiters_with_disconnected() {
        let mut device = test_session();
        let mut wire: Vec<u8> = Vec::new();
        let (reply_tx, reply_rx) = oneshot::channel();
        let (status_tx, status_rx) = oneshot::channel();

        device
            .submit(
                &mut wire,
                SessionCommand {
                    request: CommandRequest::GetSingle,
                    reply_tx,
                },
            )
            .await
            .unwrap();
        device
            .submit(
                &mut wire,
                SessionCommand {
                    request: CommandRequest::Status,
                    reply_tx: status_tx,
                },
            )
            .await
            .unwrap();

        device.close();

        assert_eq!(reply_rx.await.unwrap(), Err(CommandError::Disconnected));
        assert_eq!(status_rx.await.unwrap(), Err(CommandError::Disconnected));
    }

    #[tokio::test]
    async fn test_status_reply_resolves_waiter() {
        let mut device = test_session();
        let mut wire: Vec<u8> = Vec::new();
        let (reply_tx, reply_rx) = oneshot::channel();

        device
            .submit(
                &mut wire,
                SessionCommand {
                    request: CommandRequest::Status,
                    reply_tx,
                },
            )
            .await
            .unwrap();

        let status = Packet::new(
            0,
            60,
            Body::Status {
                status: DeviceStatus::Active,
            },
        )
        .encode();
        device.handle_frame(&status).unwrap();

        assert_eq!(
            reply_rx.await.unwrap(),
            Ok(CommandReply::Status(DeviceStatus::Active))
        );
    }

    #[tokio::test]
    async fn test_handshake_acks_config_then_syncs_and_anchors() {
        let session = Session::new_fake();
        let devices = SharedDevices::new(session.clone());
        let mut device =
            DeviceSession::new(session, devices, "10.0.0.9:50123".parse().unwrap());

        let (client, server) = tokio::io::duplex(4096);
        let (mut device_reader, mut device_writer) = tokio::io::split(client);
        let (mut server_reader, mut server_writer) = tokio::io::split(server);

        let device_side = async {
            // Device: send CONFIG, then answer the TIMESYNC
            let config = Packet::new(
                9,
                5,
                Body::Config {
                    json: CONFIG_JSON.to_string(),
                },
            );
            device_writer.write_all(&config.encode()).await.unwrap();

            let mut ack_bytes = [0u8; 12];
            device_reader.read_exact(&mut ack_bytes).await.unwrap();
            let ack = Packet::decode(&ack_bytes).unwrap();
            assert_eq!(
                ack.body,
                Body::Ack {
                    acked: PacketType::Config,
                    acked_seq: 9
                }
            );

            let mut sync_bytes = [0u8; 9];
            device_reader.read_exact(&mut sync_bytes).await.unwrap();
            let sync = Packet::decode(&sync_bytes).unwrap();
            assert_eq!(sync.body, Body::TimeSync);

            let reply = Packet::new(
                0,
                20_000,
                Body::Ack {
                    acked: PacketType::TimeSync,
                    acked_seq: sync.sequence,
                },
            );
            device_writer.write_all(&reply.encode()).await.unwrap();
        };

        let (handshake, ()) = tokio::join!(
            device.handshake(&mut server_reader, &mut server_writer),
            device_side
        );
        handshake.unwrap();

        assert_eq!(device.key, "GroundStand");
        assert_eq!(device.anchor.unwrap().device_ms, 20_000);
    }

    #[tokio::test]
    async fn test_handshake_rejects_non_config_first_packet() {
        let session = Session::new_fake();
        let devices = SharedDevices::new(session.clone());
        let mut device =
            DeviceSession::new(session, devices, "10.0.0.9:50124".parse().unwrap());

        let (client, server) = tokio::io::duplex(4096);
        let (_device_reader, mut device_writer) = tokio::io::split(client);
        let (mut server_reader, mut server_writer) = tokio::io::split(server);

        device_writer
            .write_all(&Packet::new(0, 0, Body::Heartbeat).encode())
            .await
            .unwrap();

        let result = device.handshake(&mut server_reader, &mut server_writer).await;
        assert!(matches!(result, Err(DeviceError::Handshake(_))));
    }
}
