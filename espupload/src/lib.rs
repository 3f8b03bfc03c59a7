//! # espupload
//!
//! A library for uploading firmware to ESP8266 WiFi modules through the
//! chip's ROM serial bootloader.
//!
//! This crate provides:
//!
//! - SLIP framing and the loader's 8-byte packet protocol
//! - Sync, flash-begin, flash-data and flash-end commands
//! - A non-blocking upload state machine with connect retries and
//!   hardware resets over the DTR/RTS lines
//! - Serial port discovery for common USB-UART bridges
//!
//! ## Features
//!
//! - `native` (default): Native serial port support via the `serialport` crate
//! - `serde`: Serialization support for configuration types
//!
//! ## Example
//!
//! ```rust,no_run
//! use espupload::{Bootloader, FileSource, SystemClock, UploadConfig, UploadSession, UploadTarget};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     #[cfg(feature = "native")]
//!     {
//!         let port = espupload::NativePort::open_simple("/dev/ttyUSB0", 115200)?;
//!         let mut session = UploadSession::new(
//!             Bootloader::new(port, SystemClock),
//!             UploadConfig::default(),
//!         );
//!
//!         let target = UploadTarget::Firmware;
//!         session.start(Box::new(FileSource::open("MksWifi.bin")?), target.address())?;
//!         session.run(|percent| println!("{percent}%"))?;
//!     }
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::sync::{Arc, OnceLock};

pub mod clock;
pub mod config;
pub mod device;
pub mod error;
pub mod host;
pub mod port;
pub mod protocol;
pub mod reset;
pub mod session;
pub mod slip;
pub mod source;
pub mod target;

#[cfg(test)]
pub(crate) mod testing;

static INTERRUPT_CHECKER: OnceLock<Arc<dyn Fn() -> bool + Send + Sync>> = OnceLock::new();

/// Register a global interruption checker consulted by [`UploadSession::run`].
///
/// The checker should return `true` when the current upload should stop
/// (for example after receiving Ctrl-C in CLI applications). Only the first
/// registration takes effect.
pub fn set_interrupt_checker<F>(checker: F)
where
    F: Fn() -> bool + Send + Sync + 'static,
{
    let _ = INTERRUPT_CHECKER.set(Arc::new(checker));
}

/// Returns whether interruption was requested by the embedding application.
#[must_use]
pub fn is_interrupted_requested() -> bool {
    INTERRUPT_CHECKER
        .get()
        .is_some_and(|checker| checker())
}

#[cfg(test)]
pub(crate) fn test_set_interrupted(value: bool) {
    use std::sync::atomic::{AtomicBool, Ordering};

    static TEST_INTERRUPT_FLAG: OnceLock<Arc<AtomicBool>> = OnceLock::new();

    let flag = TEST_INTERRUPT_FLAG
        .get_or_init(|| {
            let shared = Arc::new(AtomicBool::new(false));
            let checker = Arc::clone(&shared);
            set_interrupt_checker(move || checker.load(Ordering::Relaxed));
            shared
        })
        .clone();

    flag.store(value, Ordering::Relaxed);
}

// Re-exports for convenience
#[cfg(feature = "native")]
pub use port::{NativePort, NativePortEnumerator};
pub use {
    clock::{Clock, SystemClock},
    config::{FinishAction, UploadConfig},
    device::{DetectedPort, DeviceKind},
    error::{Error, Outcome, Result, UploadError, outcome_message},
    host::{auto_detect_port, discover_ports},
    port::{Port, PortEnumerator, PortInfo, SerialConfig},
    protocol::{Bootloader, FlashParams, Opcode},
    reset::{ControlLine, ResetLines},
    session::{Step, UploadSession, UploadState},
    source::{FileSource, FirmwareSource, MemorySource},
    target::{UPLOAD_BAUD_RATES, UploadTarget},
};
