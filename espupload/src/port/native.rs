//! [`Port`] over the host's serial driver, via the `serialport` crate.

use {
    crate::{
        error::{Error, Result},
        port::{Port, PortEnumerator, PortInfo, SerialConfig},
    },
    log::{debug, trace},
    serialport::{ClearBuffer, SerialPort, SerialPortInfo, SerialPortType},
    std::io::{self, Read, Write},
};

/// Serial device opened 8N1 without flow control.
pub struct NativePort {
    config: SerialConfig,
    handle: Option<Box<dyn SerialPort>>,
}

fn open_handle(config: &SerialConfig) -> Result<Box<dyn SerialPort>> {
    let handle = serialport::new(&config.port_name, config.baud_rate)
        .timeout(config.read_timeout)
        .data_bits(serialport::DataBits::Eight)
        .parity(serialport::Parity::None)
        .stop_bits(serialport::StopBits::One)
        .flow_control(serialport::FlowControl::None)
        .open()?;
    Ok(handle)
}

fn not_open(name: &str) -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, format!("{name} is not open"))
}

impl NativePort {
    /// Open the device described by `config`.
    pub fn open(config: &SerialConfig) -> Result<Self> {
        let handle = open_handle(config)?;
        debug!("Opened {} at {} baud", config.port_name, config.baud_rate);
        Ok(Self {
            config: config.clone(),
            handle: Some(handle),
        })
    }

    /// Open `port_name` at `baud_rate` with the default read timeout.
    pub fn open_simple(port_name: &str, baud_rate: u32) -> Result<Self> {
        Self::open(&SerialConfig::new(port_name, baud_rate))
    }

    fn handle(&mut self) -> io::Result<&mut Box<dyn SerialPort>> {
        let name = &self.config.port_name;
        self.handle.as_mut().ok_or_else(|| not_open(name))
    }
}

impl Port for NativePort {
    fn bytes_available(&mut self) -> Result<usize> {
        let pending = self.handle()?.bytes_to_read()?;
        Ok(pending as usize)
    }

    fn baud_rate(&self) -> u32 {
        self.config.baud_rate
    }

    fn set_baud_rate(&mut self, baud_rate: u32) -> Result<()> {
        self.handle()?.set_baud_rate(baud_rate)?;
        self.config.baud_rate = baud_rate;
        Ok(())
    }

    fn clear_buffers(&mut self) -> Result<()> {
        self.handle()?.clear(ClearBuffer::All)?;
        Ok(())
    }

    fn name(&self) -> &str {
        &self.config.port_name
    }

    fn set_dtr(&mut self, level: bool) -> Result<()> {
        trace!("{}: DTR={level}", self.config.port_name);
        self.handle()?.write_data_terminal_ready(level)?;
        Ok(())
    }

    fn set_rts(&mut self, level: bool) -> Result<()> {
        trace!("{}: RTS={level}", self.config.port_name);
        self.handle()?.write_request_to_send(level)?;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if self.handle.take().is_some() {
            debug!("Closed {}", self.config.port_name);
        }
        Ok(())
    }
}

impl Read for NativePort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.handle()?.read(buf)
    }
}

impl Write for NativePort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.handle()?.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.handle()?.flush()
    }
}

impl From<SerialPortInfo> for PortInfo {
    fn from(info: SerialPortInfo) -> Self {
        match info.port_type {
            SerialPortType::UsbPort(usb) => Self {
                name: info.port_name,
                vid: Some(usb.vid),
                pid: Some(usb.pid),
                manufacturer: usb.manufacturer,
                product: usb.product,
                serial_number: usb.serial_number,
            },
            _ => Self {
                name: info.port_name,
                ..Self::default()
            },
        }
    }
}

/// Lists ports through the host's serial driver.
pub struct NativePortEnumerator;

impl PortEnumerator for NativePortEnumerator {
    fn list_ports() -> Result<Vec<PortInfo>> {
        let ports = serialport::available_ports().map_err(Error::Serial)?;
        Ok(ports.into_iter().map(PortInfo::from).collect())
    }
}
