//! SSDP discovery emitter
//!
//! Transmit-only: an M-SEARCH datagram goes to the SSDP multicast group on
//! startup, on every operator "discover" action, and optionally on a fixed
//! cadence. Devices do not answer over UDP; they react by opening a TCP
//! connection to the datagram's source address, so emitting is idempotent
//! and replies are never parsed.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use propstand_core::ssdp;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant};
use tokio_graceful_shutdown::SubsystemHandle;

use crate::Session;

pub(crate) struct DiscoveryEmitter {
    session: Session,
    trigger_rx: mpsc::Receiver<()>,
}

impl DiscoveryEmitter {
    pub fn new(session: Session, trigger_rx: mpsc::Receiver<()>) -> Self {
        DiscoveryEmitter {
            session,
            trigger_rx,
        }
    }

    pub async fn run(mut self, subsys: SubsystemHandle) -> Result<(), std::io::Error> {
        let socket = create_ssdp_socket()?;
        let group: Ipv4Addr = ssdp::MULTICAST_ADDR
            .parse()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, format!("{}", e)))?;
        let target = SocketAddr::from((group, ssdp::MULTICAST_PORT));
        log::info!(
            "SSDP emitter ready for {}:{}",
            ssdp::MULTICAST_ADDR,
            ssdp::MULTICAST_PORT
        );

        // Startup burst: devices already on the network connect right away.
        send_search(&socket, &target).await;

        let period = self.session.args().discovery_interval;
        let periodic = period.is_some();
        let period = Duration::from_secs(period.unwrap_or(3600));
        let mut cadence = interval_at(Instant::now() + period, period);

        loop {
            tokio::select! { biased;
                _ = subsys.on_shutdown_requested() => {
                    log::info!("Discovery shutdown");
                    return Ok(());
                },
                r = self.trigger_rx.recv() => {
                    match r {
                        Some(()) => send_search(&socket, &target).await,
                        None => {
                            log::warn!("Discovery trigger channel closed");
                            return Ok(());
                        }
                    }
                },
                _ = cadence.tick(), if periodic => {
                    send_search(&socket, &target).await;
                },
            }
        }
    }
}

/// Create the send-only SSDP socket. No bind to the SSDP port; the OS picks
/// an ephemeral source port that devices connect back through.
fn create_ssdp_socket() -> Result<UdpSocket, std::io::Error> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_nonblocking(true)?;
    socket.set_reuse_address(true)?;
    socket.set_multicast_ttl_v4(2)?;
    socket.set_multicast_loop_v4(true)?;
    socket.bind(&SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)).into())?;
    UdpSocket::from_std(socket.into())
}

async fn send_search(socket: &UdpSocket, target: &SocketAddr) {
    log::debug!("Sending SSDP discovery request");
    if let Err(e) = socket.send_to(ssdp::m_search().as_bytes(), target).await {
        log::warn!("Failed to send SSDP discovery request: {}", e);
    }
}
