//! Port abstraction for the serial link to the WiFi module.
//!
//! The loader protocol needs little from the transport. It needs byte
//! I/O and a count of the bytes waiting to be read. It also needs a way to
//! reopen the line and the two modem lines wired to reset and boot-select.
//!
//! ```text
//! +------------------+
//! |  Upload session  |
//! +--------+---------+
//!          |
//! +--------+---------+
//! | Command / packet |
//! +--------+---------+
//!          |
//! +--------+---------+
//! |    Port trait    |
//! +--------+---------+
//!          |
//! +--------+---------+
//! | NativePort       |
//! |   (serialport)   |
//! +------------------+
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use espupload::port::Port;
//!
//! fn drain<P: Port>(port: &mut P) -> espupload::Result<usize> {
//!     let mut dropped = 0;
//!     let mut byte = [0u8; 1];
//!     while port.bytes_available()? > 0 {
//!         dropped += port.read(&mut byte)?;
//!     }
//!     Ok(dropped)
//! }
//! ```

#[cfg(feature = "native")]
pub mod native;

use std::io::{Read, Write};
use std::time::Duration;

use crate::error::Result;

/// Upper bound on a single driver read.
///
/// Reads are only issued for bytes already reported available, so this
/// only matters for a misbehaving driver.
pub const LINK_READ_TIMEOUT: Duration = Duration::from_millis(100);

/// How to open the link. The loader always talks 8N1 without flow control.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialConfig {
    /// Port name/path (e.g., "/dev/ttyUSB0", "COM3").
    pub port_name: String,
    /// Baud rate.
    pub baud_rate: u32,
    /// Driver read timeout.
    pub read_timeout: Duration,
}

impl SerialConfig {
    /// Link settings for `port_name` at `baud_rate`.
    pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            read_timeout: LINK_READ_TIMEOUT,
        }
    }

    /// Set the driver read timeout.
    #[must_use]
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }
}

/// USB and naming details of an enumerated port.
#[derive(Debug, Clone, Default)]
pub struct PortInfo {
    /// Port name/path.
    pub name: String,
    /// USB vendor ID (if available).
    pub vid: Option<u16>,
    /// USB product ID (if available).
    pub pid: Option<u16>,
    /// Manufacturer string (if available).
    pub manufacturer: Option<String>,
    /// Product string (if available).
    pub product: Option<String>,
    /// Serial number (if available).
    pub serial_number: Option<String>,
}

/// Serial link to the module.
///
/// Reads are expected to be issued only for bytes that
/// [`bytes_available`](Port::bytes_available) has reported, so they never
/// wait on the line.
pub trait Port: Read + Write + Send {
    /// Number of received bytes that can be read without waiting.
    fn bytes_available(&mut self) -> Result<usize>;

    /// Current line speed.
    fn baud_rate(&self) -> u32;

    /// Change the line speed in place.
    fn set_baud_rate(&mut self, baud_rate: u32) -> Result<()>;

    /// Drop anything buffered in either direction.
    fn clear_buffers(&mut self) -> Result<()>;

    /// Port name/path, for log messages.
    fn name(&self) -> &str;

    /// Drive DTR (Data Terminal Ready).
    fn set_dtr(&mut self, level: bool) -> Result<()>;

    /// Drive RTS (Request To Send).
    fn set_rts(&mut self, level: bool) -> Result<()>;

    /// Release the device. Further I/O fails.
    fn close(&mut self) -> Result<()>;

    /// Write `buf` as one burst and flush it.
    fn write_all_bytes(&mut self, buf: &[u8]) -> Result<()> {
        self.write_all(buf)?;
        self.flush()?;
        Ok(())
    }

    /// Start a fresh connection attempt at `baud_rate` with empty buffers.
    fn reopen(&mut self, baud_rate: u32) -> Result<()> {
        self.set_baud_rate(baud_rate)?;
        self.clear_buffers()
    }
}

impl<P: Port + ?Sized> Port for Box<P> {
    fn bytes_available(&mut self) -> Result<usize> {
        (**self).bytes_available()
    }

    fn baud_rate(&self) -> u32 {
        (**self).baud_rate()
    }

    fn set_baud_rate(&mut self, baud_rate: u32) -> Result<()> {
        (**self).set_baud_rate(baud_rate)
    }

    fn clear_buffers(&mut self) -> Result<()> {
        (**self).clear_buffers()
    }

    fn name(&self) -> &str {
        (**self).name()
    }

    fn set_dtr(&mut self, level: bool) -> Result<()> {
        (**self).set_dtr(level)
    }

    fn set_rts(&mut self, level: bool) -> Result<()> {
        (**self).set_rts(level)
    }

    fn close(&mut self) -> Result<()> {
        (**self).close()
    }

    fn reopen(&mut self, baud_rate: u32) -> Result<()> {
        (**self).reopen(baud_rate)
    }
}

/// Source of [`PortInfo`] for the ports present on the host.
pub trait PortEnumerator {
    /// List all available serial ports.
    fn list_ports() -> Result<Vec<PortInfo>>;
}

#[cfg(feature = "native")]
pub use native::{NativePort, NativePortEnumerator};
