//! Binary packet codec for the test stand protocol
//!
//! Pure functions for encoding and decoding protocol v2 packets.
//! No I/O operations - bytes in, typed packets out.
//!
//! Every packet starts with a 9-byte big-endian header:
//!
//! | offset | field     | type |
//! |--------|-----------|------|
//! | 0      | version   | u8   |
//! | 1      | type      | u8   |
//! | 2      | sequence  | u8   |
//! | 3      | length    | u16  |
//! | 5      | timestamp | u32  |
//!
//! `length` is the total packet size including the header. `timestamp` is
//! milliseconds since the sender's epoch (device boot, or server session
//! start) and wraps at 32 bits.

use enum_primitive_derive::Primitive;
use num_traits::FromPrimitive;

use crate::error::ProtocolError;

/// Protocol version carried in every header
pub const PROTOCOL_VERSION: u8 = 2;

/// Size of the common packet header
pub const HEADER_LEN: usize = 9;

/// Largest packet the LENGTH field can describe
pub const MAX_PACKET_LEN: usize = 65_535;

/// Wire size of one sensor reading inside a DATA packet
pub const READING_LEN: usize = 6;

// =============================================================================
// Wire enums
// =============================================================================

/// All packet types in the protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Primitive)]
pub enum PacketType {
    /// Emergency stop, highest priority (server -> device)
    Estop = 0x00,
    /// Discovery request, sent over UDP multicast only
    Discovery = 0x01,
    /// Time synchronization; server monotonic ms rides in the header timestamp
    TimeSync = 0x02,
    /// Actuator command (server -> device)
    Control = 0x03,
    /// Request device status (server -> device)
    StatusRequest = 0x04,
    /// Start streaming sensor data (server -> device)
    StreamStart = 0x05,
    /// Stop streaming sensor data (server -> device)
    StreamStop = 0x06,
    /// Request a single reading of every sensor (server -> device)
    GetSingle = 0x07,
    /// Keep-alive (server -> device)
    Heartbeat = 0x08,
    /// Device configuration JSON (device -> server)
    Config = 0x10,
    /// Batched sensor readings (device -> server)
    Data = 0x11,
    /// Device status response (device -> server)
    Status = 0x12,
    /// Acknowledgement (device -> server)
    Ack = 0x13,
    /// Negative acknowledgement with error code (device -> server)
    Nack = 0x14,
}

/// Device operational status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Primitive)]
pub enum DeviceStatus {
    Inactive = 0,
    Active = 1,
    Error = 2,
    Calibrating = 3,
}

/// Commanded state for valves and other binary actuators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Primitive)]
pub enum ControlState {
    Closed = 0x00,
    Open = 0x01,
    Error = 0xFF,
}

/// Units for sensor measurements
#[derive(Debug, Clone, Copy, PartialEq, Eq, Primitive)]
pub enum Unit {
    Volts = 0x00,
    Amps = 0x01,
    Celsius = 0x02,
    Fahrenheit = 0x03,
    Kelvin = 0x04,
    Psi = 0x05,
    Bar = 0x06,
    Pascal = 0x07,
    Grams = 0x08,
    Kilograms = 0x09,
    Pounds = 0x0A,
    Newtons = 0x0B,
    Seconds = 0x0C,
    Milliseconds = 0x0D,
    Hertz = 0x0E,
    Percent = 0x0F,
    Unitless = 0xFF,
}

/// Error codes a device may return in a NACK
#[derive(Debug, Clone, Copy, PartialEq, Eq, Primitive)]
pub enum ErrorCode {
    None = 0,
    UnknownType = 1,
    InvalidId = 2,
    HardwareFault = 3,
    Busy = 4,
    NotStreaming = 5,
    InvalidParam = 6,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let name = match self {
            ErrorCode::None => "NONE",
            ErrorCode::UnknownType => "UNKNOWN_TYPE",
            ErrorCode::InvalidId => "INVALID_ID",
            ErrorCode::HardwareFault => "HARDWARE_FAULT",
            ErrorCode::Busy => "BUSY",
            ErrorCode::NotStreaming => "NOT_STREAMING",
            ErrorCode::InvalidParam => "INVALID_PARAM",
        };
        write!(f, "{}", name)
    }
}

// =============================================================================
// Packet model
// =============================================================================

/// One sensor reading inside a DATA packet
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SensorReading {
    /// Index into the device's sensor table (CONFIG order)
    pub sensor_id: u8,
    pub unit: Unit,
    pub value: f32,
}

/// Typed packet payload
#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    Estop,
    Discovery,
    TimeSync,
    Control { command_id: u8, state: ControlState },
    StatusRequest,
    StreamStart { freq_hz: u16 },
    StreamStop,
    GetSingle,
    Heartbeat,
    Config { json: String },
    Data { readings: Vec<SensorReading> },
    Status { status: DeviceStatus },
    Ack { acked: PacketType, acked_seq: u8 },
    Nack { nacked: PacketType, nacked_seq: u8, error: ErrorCode },
}

impl Body {
    pub fn packet_type(&self) -> PacketType {
        match self {
            Body::Estop => PacketType::Estop,
            Body::Discovery => PacketType::Discovery,
            Body::TimeSync => PacketType::TimeSync,
            Body::Control { .. } => PacketType::Control,
            Body::StatusRequest => PacketType::StatusRequest,
            Body::StreamStart { .. } => PacketType::StreamStart,
            Body::StreamStop => PacketType::StreamStop,
            Body::GetSingle => PacketType::GetSingle,
            Body::Heartbeat => PacketType::Heartbeat,
            Body::Config { .. } => PacketType::Config,
            Body::Data { .. } => PacketType::Data,
            Body::Status { .. } => PacketType::Status,
            Body::Ack { .. } => PacketType::Ack,
            Body::Nack { .. } => PacketType::Nack,
        }
    }

    fn payload_len(&self) -> usize {
        match self {
            Body::Estop
            | Body::Discovery
            | Body::TimeSync
            | Body::StatusRequest
            | Body::StreamStop
            | Body::GetSingle
            | Body::Heartbeat => 0,
            Body::Control { .. } | Body::StreamStart { .. } => 2,
            Body::Status { .. } => 1,
            Body::Ack { .. } | Body::Nack { .. } => 3,
            Body::Config { json } => 4 + json.len(),
            Body::Data { readings } => 1 + READING_LEN * readings.len(),
        }
    }
}

/// A complete protocol packet
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub sequence: u8,
    /// Milliseconds since the sender's epoch, wrapping at 32 bits
    pub timestamp: u32,
    pub body: Body,
}

impl Packet {
    pub fn new(sequence: u8, timestamp: u32, body: Body) -> Self {
        Packet {
            sequence,
            timestamp,
            body,
        }
    }

    /// Encode into wire bytes. The result is always exactly `header.length`
    /// bytes long.
    pub fn encode(&self) -> Vec<u8> {
        let length = HEADER_LEN + self.body.payload_len();
        debug_assert!(length <= MAX_PACKET_LEN);

        let mut buf = Vec::with_capacity(length);
        buf.push(PROTOCOL_VERSION);
        buf.push(self.body.packet_type() as u8);
        buf.push(self.sequence);
        buf.extend_from_slice(&(length as u16).to_be_bytes());
        buf.extend_from_slice(&self.timestamp.to_be_bytes());

        match &self.body {
            Body::Estop
            | Body::Discovery
            | Body::TimeSync
            | Body::StatusRequest
            | Body::StreamStop
            | Body::GetSingle
            | Body::Heartbeat => {}
            Body::Control { command_id, state } => {
                buf.push(*command_id);
                buf.push(*state as u8);
            }
            Body::StreamStart { freq_hz } => {
                buf.extend_from_slice(&freq_hz.to_be_bytes());
            }
            Body::Config { json } => {
                buf.extend_from_slice(&(json.len() as u32).to_be_bytes());
                buf.extend_from_slice(json.as_bytes());
            }
            Body::Data { readings } => {
                buf.push(readings.len() as u8);
                for reading in readings {
                    buf.push(reading.sensor_id);
                    buf.push(reading.unit as u8);
                    buf.extend_from_slice(&reading.value.to_be_bytes());
                }
            }
            Body::Status { status } => {
                buf.push(*status as u8);
            }
            Body::Ack { acked, acked_seq } => {
                buf.push(*acked as u8);
                buf.push(*acked_seq);
                buf.push(0); // error code, always 0 for ACK
            }
            Body::Nack {
                nacked,
                nacked_seq,
                error,
            } => {
                buf.push(*nacked as u8);
                buf.push(*nacked_seq);
                buf.push(*error as u8);
            }
        }

        debug_assert_eq!(buf.len(), length);
        buf
    }

    /// Decode a complete packet from wire bytes.
    ///
    /// Strict: the slice must be exactly one packet, the LENGTH field must
    /// match the slice length, and fixed-size types reject any other size.
    pub fn decode(data: &[u8]) -> Result<Packet, ProtocolError> {
        if data.len() < HEADER_LEN {
            return Err(ProtocolError::TooShort {
                expected: HEADER_LEN,
                actual: data.len(),
            });
        }

        let version = data[0];
        if version != PROTOCOL_VERSION {
            return Err(ProtocolError::UnsupportedVersion(version));
        }
        let raw_type = data[1];
        let sequence = data[2];
        let length = u16::from_be_bytes([data[3], data[4]]) as usize;
        let timestamp = u32::from_be_bytes([data[5], data[6], data[7], data[8]]);

        if length != data.len() {
            return Err(ProtocolError::LengthMismatch {
                header_len: length,
                actual_len: data.len(),
            });
        }

        let packet_type =
            PacketType::from_u8(raw_type).ok_or(ProtocolError::UnknownPacketType(raw_type))?;

        let payload = &data[HEADER_LEN..];
        let body = match packet_type {
            PacketType::Estop => fixed(payload, 0, Body::Estop)?,
            PacketType::Discovery => fixed(payload, 0, Body::Discovery)?,
            PacketType::TimeSync => fixed(payload, 0, Body::TimeSync)?,
            PacketType::StatusRequest => fixed(payload, 0, Body::StatusRequest)?,
            PacketType::StreamStop => fixed(payload, 0, Body::StreamStop)?,
            PacketType::GetSingle => fixed(payload, 0, Body::GetSingle)?,
            PacketType::Heartbeat => fixed(payload, 0, Body::Heartbeat)?,
            PacketType::Control => {
                expect_payload(payload, 2)?;
                Body::Control {
                    command_id: payload[0],
                    state: enum_field::<ControlState>("control state", payload[1])?,
                }
            }
            PacketType::StreamStart => {
                expect_payload(payload, 2)?;
                Body::StreamStart {
                    freq_hz: u16::from_be_bytes([payload[0], payload[1]]),
                }
            }
            PacketType::Status => {
                expect_payload(payload, 1)?;
                Body::Status {
                    status: enum_field::<DeviceStatus>("device status", payload[0])?,
                }
            }
            PacketType::Config => {
                if payload.len() < 4 {
                    return Err(ProtocolError::TooShort {
                        expected: HEADER_LEN + 4,
                        actual: data.len(),
                    });
                }
                let json_len =
                    u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]) as usize;
                if payload.len() != 4 + json_len {
                    return Err(ProtocolError::LengthMismatch {
                        header_len: HEADER_LEN + 4 + json_len,
                        actual_len: data.len(),
                    });
                }
                let json = std::str::from_utf8(&payload[4..])
                    .map_err(|_| ProtocolError::InvalidString)?
                    .to_owned();
                Body::Config { json }
            }
            PacketType::Data => {
                if payload.is_empty() {
                    return Err(ProtocolError::TooShort {
                        expected: HEADER_LEN + 1,
                        actual: data.len(),
                    });
                }
                let count = payload[0] as usize;
                if payload.len() != 1 + READING_LEN * count {
                    return Err(ProtocolError::LengthMismatch {
                        header_len: HEADER_LEN + 1 + READING_LEN * count,
                        actual_len: data.len(),
                    });
                }
                let mut readings = Vec::with_capacity(count);
                for chunk in payload[1..].chunks_exact(READING_LEN) {
                    readings.push(SensorReading {
                        sensor_id: chunk[0],
                        unit: enum_field::<Unit>("unit", chunk[1])?,
                        value: f32::from_be_bytes([chunk[2], chunk[3], chunk[4], chunk[5]]),
                    });
                }
                Body::Data { readings }
            }
            PacketType::Ack => {
                expect_payload(payload, 3)?;
                // Byte 2 is the error-code slot shared with NACK; always 0 here.
                Body::Ack {
                    acked: enum_field::<PacketType>("acked type", payload[0])?,
                    acked_seq: payload[1],
                }
            }
            PacketType::Nack => {
                expect_payload(payload, 3)?;
                Body::Nack {
                    nacked: enum_field::<PacketType>("nacked type", payload[0])?,
                    nacked_seq: payload[1],
                    error: enum_field::<ErrorCode>("error code", payload[2])?,
                }
            }
        };

        Ok(Packet {
            sequence,
            timestamp,
            body,
        })
    }
}

fn expect_payload(payload: &[u8], expected: usize) -> Result<(), ProtocolError> {
    if payload.len() != expected {
        return Err(ProtocolError::LengthMismatch {
            header_len: HEADER_LEN + expected,
            actual_len: HEADER_LEN + payload.len(),
        });
    }
    Ok(())
}

fn fixed(payload: &[u8], expected: usize, body: Body) -> Result<Body, ProtocolError> {
    expect_payload(payload, expected)?;
    Ok(body)
}

fn enum_field<T: FromPrimitive>(field: &'static str, value: u8) -> Result<T, ProtocolError> {
    T::from_u8(value).ok_or(ProtocolError::InvalidEnum { field, value })
}

// =============================================================================
// Tests
// =============================================================================
