//! Propstand Core - Platform-independent test stand protocol library
//!
//! This crate contains the pure protocol logic for the QRET propulsion test
//! stand: the binary packet codec, the length-prefixed frame accumulator,
//! the device CONFIG model and the time reconciliation math. It performs no
//! I/O and has no async runtime dependency, so it can be used from tests,
//! tools and the server alike.
//!
//! # Example
//!
//! ```rust
//! use propstand_core::packet::{Body, Packet};
//!
//! let packet = Packet::new(7, 1000, Body::StreamStart { freq_hz: 10 });
//! let bytes = packet.encode();
//! assert_eq!(Packet::decode(&bytes), Ok(packet));
//! ```

pub mod device;
pub mod error;
pub mod frame;
pub mod packet;
pub mod ssdp;
pub mod timesync;

// Re-export commonly used types
pub use device::DeviceConfig;
pub use error::ProtocolError;
pub use frame::FrameBuffer;
pub use packet::{Body, Packet, PacketType};
pub use timesync::SyncAnchor;
