//! TCP acceptor
//!
//! Devices react to an SSDP discovery burst by opening a TCP connection to
//! the server. Each accepted socket gets its own session subsystem; the
//! acceptor itself never dies on a per-connection error.

use std::time::Duration;

use tokio::net::TcpListener;
use tokio::time::sleep;
use tokio_graceful_shutdown::{SubsystemBuilder, SubsystemHandle};

use crate::registry::SharedDevices;
use crate::session::{DeviceError, DeviceSession};
use crate::Session;

pub(crate) struct Acceptor {
    session: Session,
    devices: SharedDevices,
}

impl Acceptor {
    pub fn new(session: Session, devices: SharedDevices) -> Self {
        Acceptor { session, devices }
    }

    pub async fn run(self, subsys: SubsystemHandle) -> Result<(), DeviceError> {
        let port = self.session.args().port;
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        log::info!("Listening for devices on port {}", port);

        loop {
            tokio::select! { biased;
                _ = subsys.on_shutdown_requested() => {
                    log::info!("Acceptor shutdown");
                    return Ok(());
                },
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            log::info!("Accepted TCP connection from {}", peer);
                            if let Err(e) = stream.set_nodelay(true) {
                                log::warn!("{}: cannot set TCP_NODELAY: {}", peer, e);
                            }

                            let device = DeviceSession::new(
                                self.session.clone(),
                                self.devices.clone(),
                                peer,
                            );
                            subsys.start(SubsystemBuilder::new(
                                format!("device-{}", peer),
                                move |s| device.run(stream, s),
                            ));
                        }
                        Err(e) => {
                            log::error!("Accept failed: {}", e);
                            sleep(Duration::from_millis(100)).await;
                        }
                    }
                },
            }
        }
    }
}
