//! Device clock reconciliation
//!
//! Device DATA timestamps are milliseconds since boot on the device's own
//! crystal, which is far more regular than TCP delivery. At TIMESYNC we
//! capture one anchor pair (device ms, server monotonic seconds) and project
//! every later device timestamp through it, so inter-sample spacing reflects
//! the device clock rather than network jitter.
//!
//! Both timestamps wrap at 32 bits; the delta is taken as a signed 32-bit
//! difference so projection stays correct across the wrap (~49.7 days).
//! Crystal drift is on the order of 20 ppm, so re-anchoring every 10 minutes
//! keeps the projection within ~12 ms.

/// Anchor pair captured when a TIMESYNC ACK arrives.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SyncAnchor {
    /// Device ms-since-boot at the instant the device sent the ACK
    pub device_ms: u32,
    /// Server monotonic seconds at the instant the ACK was received
    pub server_seconds: f64,
}

impl SyncAnchor {
    pub fn new(device_ms: u32, server_seconds: f64) -> Self {
        SyncAnchor {
            device_ms,
            server_seconds,
        }
    }

    /// Project a device timestamp onto the server monotonic axis.
    ///
    /// The delta is signed, so a timestamp slightly before the anchor (or
    /// one that crossed the u32 wrap) yields a time before the anchor.
    pub fn project(&self, device_ms: u32) -> f64 {
        let delta = device_ms.wrapping_sub(self.device_ms) as i32;
        self.server_seconds + f64::from(delta) / 1000.0
    }
}
