//! In-memory ports for unit tests.

use crate::error::{Error, Result};
use crate::port::Port;
use crate::protocol::packet::{HEADER_LEN, Opcode, PacketHeader};
use crate::protocol::command::{CHECKSUM_SEED, FLASH_BLOCK_SIZE, checksum};
use crate::slip;
use std::collections::VecDeque;
use std::io::{self, Read, Write};

/// SLIP-framed response as the ROM loader would send it.
pub(crate) fn response_frame(opcode: Opcode, value: u32, body: &[u8]) -> Vec<u8> {
    let header = PacketHeader {
        direction: 0x01,
        opcode: opcode as u8,
        body_len: u16::try_from(body.len()).unwrap(),
        value,
    };
    let mut frame = vec![slip::END];
    slip::encode(&header.to_bytes(), &mut frame);
    slip::encode(body, &mut frame);
    frame.push(slip::END);
    frame
}

/// Port fed from a byte queue that records everything written to it.
#[derive(Debug, Default)]
pub(crate) struct LoopbackPort {
    input: VecDeque<u8>,
    pub(crate) output: Vec<u8>,
    pub(crate) fail_writes: bool,
    baud_rate: u32,
}

impl LoopbackPort {
    pub(crate) fn with_input(bytes: &[u8]) -> Self {
        let mut port = Self::default();
        port.push_input(bytes);
        port
    }

    pub(crate) fn push_input(&mut self, bytes: &[u8]) {
        self.input.extend(bytes.iter().copied());
    }
}

impl Read for LoopbackPort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = buf.len().min(self.input.len());
        for slot in buf.iter_mut().take(n) {
            *slot = self.input.pop_front().unwrap_or_default();
        }
        Ok(n)
    }
}

impl Write for LoopbackPort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.fail_writes {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "write failed"));
        }
        self.output.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Port for LoopbackPort {
    fn bytes_available(&mut self) -> Result<usize> {
        Ok(self.input.len())
    }

    fn set_baud_rate(&mut self, baud_rate: u32) -> Result<()> {
        self.baud_rate = baud_rate;
        Ok(())
    }

    fn baud_rate(&self) -> u32 {
        self.baud_rate
    }

    fn clear_buffers(&mut self) -> Result<()> {
        self.input.clear();
        Ok(())
    }

    fn name(&self) -> &str {
        "loopback"
    }

    fn set_dtr(&mut self, _level: bool) -> Result<()> {
        Ok(())
    }

    fn set_rts(&mut self, _level: bool) -> Result<()> {
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// A request frame decoded by [`SimLoader`].
#[derive(Debug, Clone)]
pub(crate) struct Request {
    pub(crate) opcode: u8,
    pub(crate) value: u32,
    pub(crate) body: Vec<u8>,
}

/// Control line transition seen by the simulated module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LineEvent {
    Dtr(bool),
    Rts(bool),
}

/// Simulated ESP8266 ROM loader on the far end of a serial link.
///
/// Decodes request frames as they are written and queues the matching
/// response. Behaviour knobs are public fields.
#[derive(Debug, Default)]
pub(crate) struct SimLoader {
    rx: Vec<u8>,
    in_frame: bool,
    tx: VecDeque<u8>,

    /// Sync requests to leave unanswered before replying.
    pub(crate) ignore_syncs: usize,
    /// Never answer anything.
    pub(crate) silent: bool,
    /// Extra sync replies queued after the first one.
    pub(crate) extra_sync_replies: usize,
    /// Send a reply with a foreign opcode before each sync reply.
    pub(crate) stale_before_sync: bool,
    /// Flash-data requests to answer with a failure status.
    pub(crate) reject_blocks: usize,
    /// Answer flash-begin with a failure status.
    pub(crate) reject_begin: bool,
    /// Fail every write on the link.
    pub(crate) fail_writes: bool,

    pub(crate) requests: Vec<Request>,
    pub(crate) lines: Vec<LineEvent>,
    pub(crate) reopen_count: usize,
    pub(crate) baud_rate: u32,
    pub(crate) closed: bool,
    /// Flash contents received through flash-data, in arrival order.
    pub(crate) flashed: Vec<u8>,
}

impl SimLoader {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn count(&self, opcode: Opcode) -> usize {
        self.requests
            .iter()
            .filter(|r| r.opcode == opcode as u8)
            .count()
    }

    pub(crate) fn requests_of(&self, opcode: Opcode) -> impl Iterator<Item = &Request> {
        self.requests.iter().filter(move |r| r.opcode == opcode as u8)
    }

    fn reply(&mut self, opcode: Opcode, status: u8) {
        self.tx
            .extend(response_frame(opcode, 0, &[status, 0]).iter().copied());
    }

    fn on_byte(&mut self, byte: u8) {
        if byte == slip::END {
            if self.in_frame && !self.rx.is_empty() {
                let frame = std::mem::take(&mut self.rx);
                self.handle(&frame);
                self.in_frame = false;
            } else {
                self.rx.clear();
                self.in_frame = true;
            }
        } else if self.in_frame {
            self.rx.push(byte);
        }
    }

    fn handle(&mut self, raw: &[u8]) {
        let Some(decoded) = unescape(raw) else {
            return;
        };
        if decoded.len() < HEADER_LEN {
            return;
        }
        let mut header = [0u8; HEADER_LEN];
        header.copy_from_slice(&decoded[..HEADER_LEN]);
        let header = PacketHeader::from_bytes(&header);
        let body = decoded[HEADER_LEN..].to_vec();
        self.requests.push(Request {
            opcode: header.opcode,
            value: header.value,
            body: body.clone(),
        });

        if self.silent {
            return;
        }

        match Opcode::try_from(header.opcode) {
            Ok(Opcode::Sync) => {
                if self.ignore_syncs > 0 {
                    self.ignore_syncs -= 1;
                    return;
                }
                if self.stale_before_sync {
                    self.reply(Opcode::ReadReg, 0);
                }
                self.reply(Opcode::Sync, 0);
                for _ in 0..self.extra_sync_replies {
                    self.reply(Opcode::Sync, 0);
                }
            },
            Ok(Opcode::FlashBegin) => {
                let status = u8::from(self.reject_begin);
                self.reply(Opcode::FlashBegin, status);
            },
            Ok(Opcode::FlashData) => {
                let data = body.get(16..).unwrap_or_default();
                let valid = data.len() == FLASH_BLOCK_SIZE
                    && u32::from(checksum(data, CHECKSUM_SEED)) == header.value;
                if self.reject_blocks > 0 {
                    self.reject_blocks -= 1;
                    self.reply(Opcode::FlashData, 1);
                } else if valid {
                    self.flashed.extend_from_slice(data);
                    self.reply(Opcode::FlashData, 0);
                } else {
                    self.reply(Opcode::FlashData, 1);
                }
            },
            Ok(Opcode::FlashEnd) => self.reply(Opcode::FlashEnd, 0),
            _ => {},
        }
    }
}

fn unescape(raw: &[u8]) -> Option<Vec<u8>> {
    let mut out = Vec::with_capacity(raw.len());
    let mut iter = raw.iter();
    while let Some(&b) = iter.next() {
        if b == slip::ESC {
            match iter.next() {
                Some(&slip::ESC_END) => out.push(slip::END),
                Some(&slip::ESC_ESC) => out.push(slip::ESC),
                _ => return None,
            }
        } else {
            out.push(b);
        }
    }
    Some(out)
}

impl Read for SimLoader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = buf.len().min(self.tx.len());
        for slot in buf.iter_mut().take(n) {
            *slot = self.tx.pop_front().unwrap_or_default();
        }
        Ok(n)
    }
}

impl Write for SimLoader {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.fail_writes {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "write failed"));
        }
        for &b in buf {
            self.on_byte(b);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Port for SimLoader {
    fn bytes_available(&mut self) -> Result<usize> {
        if self.closed {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::NotConnected,
                "port closed",
            )));
        }
        Ok(self.tx.len())
    }

    fn set_baud_rate(&mut self, baud_rate: u32) -> Result<()> {
        self.baud_rate = baud_rate;
        Ok(())
    }

    fn baud_rate(&self) -> u32 {
        self.baud_rate
    }

    fn clear_buffers(&mut self) -> Result<()> {
        self.tx.clear();
        self.rx.clear();
        self.in_frame = false;
        Ok(())
    }

    fn name(&self) -> &str {
        "sim"
    }

    fn set_dtr(&mut self, level: bool) -> Result<()> {
        self.lines.push(LineEvent::Dtr(level));
        Ok(())
    }

    fn set_rts(&mut self, level: bool) -> Result<()> {
        self.lines.push(LineEvent::Rts(level));
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }

    fn reopen(&mut self, baud_rate: u32) -> Result<()> {
        self.reopen_count += 1;
        self.set_baud_rate(baud_rate)?;
        self.clear_buffers()
    }
}
