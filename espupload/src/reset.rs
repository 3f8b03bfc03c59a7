//! Control-line sequences for the module's reset and boot-select pins.
//!
//! The module samples its boot-select pin (GPIO0) while leaving reset: low
//! selects the ROM serial loader, high runs the flashed application. Both
//! pins are driven through the port's modem control lines, which are
//! active-low on common USB-UART bridges, so asserting a line pulls the
//! pin low.

use std::time::Duration;

use log::debug;

use crate::clock::Clock;
use crate::error::Result;
use crate::port::Port;

/// How long reset is held asserted.
pub const RESET_PULSE: Duration = Duration::from_millis(500);

/// A modem control line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum ControlLine {
    /// Data Terminal Ready.
    Dtr,
    /// Request To Send.
    Rts,
}

impl ControlLine {
    /// Drive the line; `true` asserts it.
    pub fn set<P: Port + ?Sized>(self, port: &mut P, asserted: bool) -> Result<()> {
        match self {
            Self::Dtr => port.set_dtr(asserted),
            Self::Rts => port.set_rts(asserted),
        }
    }
}

/// Wiring of the reset and boot-select pins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ResetLines {
    /// Line wired to the module's reset pin.
    pub reset: ControlLine,
    /// Line wired to the boot-select pin.
    pub boot: ControlLine,
}

impl Default for ResetLines {
    fn default() -> Self {
        Self {
            reset: ControlLine::Rts,
            boot: ControlLine::Dtr,
        }
    }
}

impl ResetLines {
    /// Restart the module into the ROM serial loader.
    pub fn enter_bootloader<P, C>(&self, port: &mut P, clock: &C) -> Result<()>
    where
        P: Port + ?Sized,
        C: Clock + ?Sized,
    {
        debug!("Resetting into the serial loader");
        self.boot.set(port, true)?;
        self.pulse_reset(port, clock)
    }

    /// Restart the module into the flashed application.
    pub fn run_firmware<P, C>(&self, port: &mut P, clock: &C) -> Result<()>
    where
        P: Port + ?Sized,
        C: Clock + ?Sized,
    {
        debug!("Resetting into the application");
        self.boot.set(port, false)?;
        self.pulse_reset(port, clock)
    }

    fn pulse_reset<P, C>(&self, port: &mut P, clock: &C) -> Result<()>
    where
        P: Port + ?Sized,
        C: Clock + ?Sized,
    {
        self.reset.set(port, true)?;
        clock.sleep(RESET_PULSE);
        self.reset.set(port, false)
    }
}
