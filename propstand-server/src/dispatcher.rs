//! Command dispatcher
//!
//! The request-oriented surface the REST and CLI adapters sit on. Each call
//! resolves a device by name, enqueues on its session's outbound channel
//! and waits for the correlated ACK/NACK or STATUS response. The session
//! owns the deadlines; a dropped reply channel means the session died
//! underneath us.

use std::path::PathBuf;

use propstand_core::packet::{ControlState, DeviceStatus, ErrorCode};
use thiserror::Error;
use tokio::sync::oneshot;

use crate::registry::{DeviceHandle, SharedDevices};
use crate::session::{CommandReply, CommandRequest, SessionCommand};
use crate::storage;
use crate::Session;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CommandError {
    #[error("No such device '{0}'")]
    NoSuchDevice(String),
    #[error("Device has no control named '{0}'")]
    NoSuchName(String),
    #[error("Stream rate must be at least 1 Hz")]
    InvalidRate,
    #[error("Timeout waiting for device")]
    Timeout,
    #[error("Device NACK: {0}")]
    Nack(ErrorCode),
    #[error("Device disconnected")]
    Disconnected,
    #[error("Export failed: {0}")]
    ExportFailed(String),
}

/// Stateless facade over the registry; adapters clone it freely.
#[derive(Clone)]
pub struct Dispatcher {
    session: Session,
    devices: SharedDevices,
}

impl Dispatcher {
    pub fn new(session: Session, devices: SharedDevices) -> Self {
        Dispatcher { session, devices }
    }

    /// List registered devices.
    pub fn list(&self) -> Vec<DeviceHandle> {
        self.devices.snapshot()
    }

    /// Emit another SSDP discovery burst.
    pub async fn discover(&self) {
        self.session.trigger_discovery().await;
    }

    pub async fn status(&self, device: &str) -> Result<DeviceStatus, CommandError> {
        match self.request(device, CommandRequest::Status).await? {
            CommandReply::Status(status) => Ok(status),
            _ => Err(CommandError::Disconnected),
        }
    }

    /// Ask for one reading of every sensor; the readings arrive on the
    /// event bus like any other DATA.
    pub async fn get_single(&self, device: &str) -> Result<(), CommandError> {
        self.request(device, CommandRequest::GetSingle).await?;
        Ok(())
    }

    pub async fn start_stream(&self, device: &str, freq_hz: u16) -> Result<(), CommandError> {
        if freq_hz == 0 {
            return Err(CommandError::InvalidRate);
        }
        self.request(device, CommandRequest::StreamStart { freq_hz })
            .await?;
        Ok(())
    }

    pub async fn stop_stream(&self, device: &str) -> Result<(), CommandError> {
        self.request(device, CommandRequest::StreamStop).await?;
        Ok(())
    }

    /// Command a named control. The name resolves to its `cmd_id` locally;
    /// an unknown name never touches the wire.
    pub async fn control(
        &self,
        device: &str,
        control: &str,
        state: ControlState,
    ) -> Result<(), CommandError> {
        let handle = self.resolve(device)?;
        let command_id = handle
            .config
            .control_id(control)
            .ok_or_else(|| CommandError::NoSuchName(control.to_string()))?;
        self.send(&handle, CommandRequest::Control { command_id, state })
            .await?;
        Ok(())
    }

    /// Write ESTOP to every registered device. No ACK is awaited; returns
    /// the number of devices the write completed for.
    pub async fn estop_all(&self) -> usize {
        let mut delivered = 0;
        for handle in self.devices.snapshot() {
            match self.send(&handle, CommandRequest::Estop).await {
                Ok(_) => delivered += 1,
                Err(e) => {
                    log::error!("{}: ESTOP not delivered: {}", handle.name, e);
                }
            }
        }
        delivered
    }

    /// Dump a device's sample log to CSV.
    pub fn export_csv(&self, device: &str) -> Result<PathBuf, CommandError> {
        let handle = self.resolve(device)?;
        let dir = self.session.args().data_dir;
        let samples = handle.samples.read().unwrap();
        let sensor_names: Vec<String> = handle
            .config
            .sensors
            .iter()
            .map(|s| s.name.clone())
            .collect();
        storage::export_sample_log(&handle.name, &sensor_names, &samples, &dir)
            .map_err(|e| CommandError::ExportFailed(e.to_string()))
    }

    fn resolve(&self, device: &str) -> Result<DeviceHandle, CommandError> {
        self.devices
            .get_by_name(device)
            .ok_or_else(|| CommandError::NoSuchDevice(device.to_string()))
    }

    async fn request(
        &self,
        device: &str,
        request: CommandRequest,
    ) -> Result<CommandReply, CommandError> {
        let handle = self.resolve(device)?;
        self.send(&handle, request).await
    }

    async fn send(
        &self,
        handle: &DeviceHandle,
        request: CommandRequest,
    ) -> Result<CommandReply, CommandError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        handle
            .command_tx
            .send(SessionCommand { request, reply_tx })
            .await
            .map_err(|_| CommandError::Disconnected)?;
        reply_rx.await.map_err(|_| CommandError::Disconnected)?
    }
}
