//! Host-side port discovery entry points.

use crate::device::{self, DetectedPort};

/// All serial ports the host reports, classified.
#[must_use]
pub fn discover_ports() -> Vec<DetectedPort> {
    device::detect_ports()
}

/// The single best port to upload through.
pub fn auto_detect_port() -> crate::Result<DetectedPort> {
    device::auto_detect_port()
}
