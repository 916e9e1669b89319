//! # Propstand Server
//!
//! Server-side core of the QRET propulsion test stand control system.
//!
//! The server coordinates a small fleet of microcontroller devices
//! (thermocouples, pressure transducers, load cells, solenoid valves) over
//! the local network during static hot-fire tests:
//!
//! - Announces itself via SSDP so devices know where to connect
//! - Accepts device TCP connections on port 50000
//! - Runs one session state machine per device (CONFIG handshake,
//!   TIMESYNC, heartbeats, streaming, control dispatch, emergency stop)
//! - Reconciles device-local timestamps onto the server clock
//! - Fans sensor data and log lines out to subscribers via the event bus
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                   propstand-server                       │
//! │  ┌────────────┐  ┌──────────────┐  ┌──────────────────┐  │
//! │  │ Dispatcher │  │ SSDP emitter │  │ CSV export       │  │
//! │  │ (REST/CLI  │  │ (UDP 1900)   │  │ (storage)        │  │
//! │  │  adapters) │  └──────────────┘  └──────────────────┘  │
//! │  └─────┬──────┘                                          │
//! │        ▼                                                 │
//! │  ┌──────────────────────────────────────────────────────┐│
//! │  │            SharedDevices (Arc<RwLock>)               ││
//! │  │  - address → live session handle                     ││
//! │  │  - sensor/control tables, sample logs                ││
//! │  └──────────────────────────────────────────────────────┘│
//! │        ▲                                                 │
//! │  ┌─────┴──────┐   ┌─────────────────────────────────┐    │
//! │  │ Acceptor   │──▶│ DeviceSession (one per device)  │    │
//! │  │ (TCP 50000)│   │ handshake → sync → ready/closed │    │
//! │  └────────────┘   └─────────────────────────────────┘    │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! Protocol parsing lives in [`propstand_core`]; this crate owns all I/O.

extern crate tokio;

use clap::Parser;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::mpsc;
use tokio_graceful_shutdown::{SubsystemBuilder, SubsystemHandle};

pub mod acceptor;
pub mod config;
pub mod discovery;
pub mod dispatcher;
pub mod events;
pub mod registry;
pub mod session;
pub mod storage;

use acceptor::Acceptor;
use config::ServerConfig;
use discovery::DiscoveryEmitter;
use events::EventBus;
use registry::SharedDevices;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default TCP listening port devices connect to
pub const DEVICE_PORT: u16 = 50000;

#[derive(Parser, Clone, Debug)]
pub struct Cli {
    #[clap(flatten)]
    pub verbose: clap_verbosity_flag::Verbosity<clap_verbosity_flag::InfoLevel>,

    /// TCP port to accept device connections on
    #[arg(short, long, default_value_t = DEVICE_PORT)]
    pub port: u16,

    /// Path to the server config file (also via PROP_CONFIG env var)
    #[arg(short, long)]
    pub config: Option<std::path::PathBuf>,

    /// Do not emit SSDP discovery requests
    #[arg(long, default_value_t = false)]
    pub no_discovery: bool,

    /// Re-emit an SSDP discovery request every N seconds
    #[arg(long)]
    pub discovery_interval: Option<u64>,

    /// Drop samples whose reconciled timestamp goes backwards
    #[arg(long, default_value_t = false)]
    pub strict_timestamps: bool,

    /// Directory CSV exports are written to
    #[arg(long, default_value = "test_data")]
    pub data_dir: std::path::PathBuf,
}

pub struct SessionInner {
    pub args: Cli,
    pub config: ServerConfig,
    pub devices: Option<SharedDevices>,
    pub events: EventBus,
    /// Nudges the SSDP emitter on an operator "discover" action
    pub discovery_tx: mpsc::Sender<()>,
}

/// Shared application state handed to every subsystem.
#[derive(Clone)]
pub struct Session {
    pub inner: Arc<RwLock<SessionInner>>,
}

impl Session {
    pub fn read(
        &self,
    ) -> Result<RwLockReadGuard<'_, SessionInner>, PoisonError<RwLockReadGuard<'_, SessionInner>>>
    {
        self.inner.read()
    }

    pub fn write(
        &self,
    ) -> Result<RwLockWriteGuard<'_, SessionInner>, PoisonError<RwLockWriteGuard<'_, SessionInner>>>
    {
        self.inner.write()
    }

    #[cfg(test)]
    pub fn new_fake() -> Self {
        // This does not actually start anything - only use for testing
        Self::new_base(
            Cli::parse_from(["propstand-server"]),
            ServerConfig::default(),
        )
    }

    fn new_base(args: Cli, config: ServerConfig) -> Self {
        let (discovery_tx, _discovery_rx) = mpsc::channel(4);
        Session {
            inner: Arc::new(RwLock::new(SessionInner {
                args,
                config,
                devices: None,
                events: EventBus::new(),
                discovery_tx,
            })),
        }
    }

    /// Build the shared state and start the long-running subsystems.
    pub async fn new(subsystem: &SubsystemHandle, args: Cli, config: ServerConfig) -> Self {
        let no_discovery = args.no_discovery;
        let session = Self::new_base(args, config);

        let devices = SharedDevices::new(session.clone());
        session.write().unwrap().devices = Some(devices.clone());

        if no_discovery {
            log::info!("SSDP discovery disabled");
        } else {
            let (discovery_tx, discovery_rx) = mpsc::channel(4);
            session.write().unwrap().discovery_tx = discovery_tx;
            let emitter = DiscoveryEmitter::new(session.clone(), discovery_rx);
            subsystem.start(SubsystemBuilder::new("Discovery", |s| emitter.run(s)));
        }

        let acceptor = Acceptor::new(session.clone(), devices);
        subsystem.start(SubsystemBuilder::new("Acceptor", |s| acceptor.run(s)));

        session
    }

    pub fn args(&self) -> Cli {
        let args = { self.read().unwrap().args.clone() };
        args
    }

    pub fn events(&self) -> EventBus {
        self.read().unwrap().events.clone()
    }

    pub fn devices(&self) -> Option<SharedDevices> {
        self.read().unwrap().devices.clone()
    }

    /// Ask the SSDP emitter for another discovery burst.
    pub async fn trigger_discovery(&self) {
        let tx = { self.read().unwrap().discovery_tx.clone() };
        let _ = tx.send(()).await;
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Session {{ }}")
    }
}
