//! Non-blocking upload state machine.
//!
//! ```text
//!            start()
//!   Idle ─────────────► Resetting ◄──────────────┐
//!    ▲                      │                    │ every 3rd failed sync
//!    │                      ▼                    │
//!    │                 Connecting ───────────────┘
//!    │                      │ sync ok
//!    │                      ▼
//!    │                   Erasing
//!    │                      │ flash-begin ok
//!    │                      ▼
//!    │                  Uploading ──┐ one block per tick
//!    │                      │  ◄────┘
//!    │                      ▼
//!    └──────────────────── Done
//! ```
//!
//! Each call to [`UploadSession::advance`] does at most one unit of work:
//! a reset, a sync attempt, the erase, or one block. Waiting between steps
//! is expressed as a timestamp comparison against the injected clock, so a
//! caller can interleave other work between calls.

use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::{FinishAction, UploadConfig};
use crate::error::{Error, Outcome, Result, UploadError};
use crate::port::Port;
use crate::protocol::command::{Bootloader, block_count};
use crate::source::FirmwareSource;

/// Flash sector size.
pub const SECTOR_SIZE: u32 = 4096;

/// Sectors per 64 KiB erase block.
pub const SECTORS_PER_BLOCK: u32 = 16;

/// Pause between idle polls in [`UploadSession::run`].
const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Where a session currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UploadState {
    /// No upload in progress.
    Idle,
    /// About to reset the module into its loader.
    Resetting,
    /// Trying to sync with the loader.
    Connecting,
    /// About to start the flash write (and erase).
    Erasing,
    /// Sending blocks.
    Uploading,
    /// Finished; the next advance cleans up.
    Done,
}

/// Result of one [`UploadSession::advance`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Nothing to do; no upload is active.
    Idle,
    /// Work is in progress.
    Pending,
    /// Another progress increment was reached.
    Progress(u8),
    /// The session ended with this outcome and is idle again.
    Finished(Outcome),
}

/// Size to pass to flash-begin for `size` bytes at `address`.
///
/// The ROM loader erases more than it is asked to when the region starts
/// inside a 64 KiB erase block, so sectors up to the first block boundary
/// are only requested half as often.
pub fn erase_size(address: u32, size: u32) -> u32 {
    let num_sectors = size.div_ceil(SECTOR_SIZE);
    let start_sector = address / SECTOR_SIZE;
    let head_sectors = (SECTORS_PER_BLOCK - start_sector % SECTORS_PER_BLOCK).min(num_sectors);

    if num_sectors < 2 * head_sectors {
        num_sectors.div_ceil(2) * SECTOR_SIZE
    } else {
        (num_sectors - head_sectors) * SECTOR_SIZE
    }
}

/// One firmware upload over a [`Bootloader`] link.
pub struct UploadSession<P, C = SystemClock> {
    loader: Bootloader<P, C>,
    config: UploadConfig,
    state: UploadState,
    source: Option<Box<dyn FirmwareSource>>,
    target_address: u32,
    file_size: u32,
    current_block: u32,
    total_blocks: u32,
    connect_attempts: u32,
    next_percent: u32,
    last_action: Instant,
    last_reset: Instant,
    last_result: Option<Outcome>,
}

impl<P: Port, C: Clock> UploadSession<P, C> {
    /// Create an idle session.
    pub fn new(loader: Bootloader<P, C>, config: UploadConfig) -> Self {
        let now = loader.clock().now();
        Self {
            loader,
            config,
            state: UploadState::Idle,
            source: None,
            target_address: 0,
            file_size: 0,
            current_block: 0,
            total_blocks: 0,
            connect_attempts: 0,
            next_percent: 0,
            last_action: now,
            last_reset: now,
            last_result: None,
        }
    }

    /// Begin uploading `source` to flash `address`.
    ///
    /// Rejected with [`Error::Busy`] while another upload is active. An
    /// empty source is closed and reported as
    /// [`UploadError::EmptyFile`] without touching the link.
    pub fn start(&mut self, mut source: Box<dyn FirmwareSource>, address: u32) -> Result<()> {
        if self.state != UploadState::Idle {
            return Err(Error::Busy);
        }

        let size = source.size();
        let file_size = match u32::try_from(size) {
            Ok(0) => Err(UploadError::EmptyFile),
            Ok(n) => Ok(n),
            Err(_) => Err(UploadError::FileRead),
        };
        let file_size = match file_size {
            Ok(n) => n,
            Err(e) => {
                warn!("Refusing to upload {size} byte image: {e}");
                source.close();
                self.last_result = Some(Err(e));
                return Err(e.into());
            },
        };

        info!("Uploading {file_size} bytes to 0x{address:06X}");
        self.source = Some(source);
        self.target_address = address;
        self.file_size = file_size;
        self.total_blocks = block_count(file_size);
        self.current_block = 0;
        self.connect_attempts = 0;
        self.last_result = None;
        self.set_state(UploadState::Resetting);
        Ok(())
    }

    /// Do the next unit of work.
    pub fn advance(&mut self) -> Step {
        match self.state {
            UploadState::Idle => Step::Idle,
            UploadState::Resetting => {
                self.reset();
                Step::Pending
            },
            UploadState::Connecting => {
                self.connect();
                Step::Pending
            },
            UploadState::Erasing => {
                self.erase();
                Step::Pending
            },
            UploadState::Uploading => self.upload(),
            UploadState::Done => Step::Finished(self.cleanup()),
        }
    }

    /// Abort the active upload.
    ///
    /// The next [`advance`](Self::advance) finishes the session with
    /// [`UploadError::Cancelled`]. Returns `false` if nothing was active.
    pub fn cancel(&mut self) -> bool {
        match self.state {
            UploadState::Idle | UploadState::Done => false,
            _ => {
                info!("Upload cancelled");
                self.finish(Err(UploadError::Cancelled));
                true
            },
        }
    }

    /// Drive the session to completion, reporting progress percentages.
    ///
    /// Stops early with [`UploadError::Cancelled`] once the registered
    /// interrupt checker fires.
    pub fn run<F: FnMut(u8)>(&mut self, progress: F) -> Outcome {
        self.run_with(progress, crate::is_interrupted_requested)
    }

    /// [`run`](Self::run) with an explicit interruption check.
    pub fn run_with<F, I>(&mut self, mut progress: F, interrupted: I) -> Outcome
    where
        F: FnMut(u8),
        I: Fn() -> bool,
    {
        loop {
            if interrupted() {
                self.cancel();
            }
            match self.advance() {
                Step::Idle => return self.last_result.unwrap_or(Ok(())),
                Step::Pending => self.loader.clock().sleep(POLL_INTERVAL),
                Step::Progress(percent) => progress(percent),
                Step::Finished(outcome) => return outcome,
            }
        }
    }

    /// Current state.
    pub fn state(&self) -> UploadState {
        self.state
    }

    /// Whether an upload is in progress.
    pub fn is_active(&self) -> bool {
        self.state != UploadState::Idle
    }

    /// Outcome of the most recent upload, once it has ended.
    pub fn last_result(&self) -> Option<Outcome> {
        self.last_result
    }

    /// Flash address of the current upload.
    pub fn target_address(&self) -> u32 {
        self.target_address
    }

    /// Size of the current image.
    pub fn file_size(&self) -> u32 {
        self.file_size
    }

    /// Blocks sent so far.
    pub fn current_block(&self) -> u32 {
        self.current_block
    }

    /// Blocks in the current image.
    pub fn total_blocks(&self) -> u32 {
        self.total_blocks
    }

    /// Failed sync attempts in the current upload.
    pub fn connect_attempts(&self) -> u32 {
        self.connect_attempts
    }

    /// Session configuration.
    pub fn config(&self) -> &UploadConfig {
        &self.config
    }

    /// The loader link.
    pub fn bootloader(&self) -> &Bootloader<P, C> {
        &self.loader
    }

    /// The loader link, mutably.
    pub fn bootloader_mut(&mut self) -> &mut Bootloader<P, C> {
        &mut self.loader
    }

    /// Give back the loader link.
    pub fn into_bootloader(self) -> Bootloader<P, C> {
        self.loader
    }

    /// Abort anything in flight, close the image and release the port.
    ///
    /// The session stays usable only for inspecting counters afterwards.
    pub fn close(&mut self) -> Result<()> {
        if self.is_active() {
            self.cancel();
            self.advance();
        }
        let port = self.loader.port_mut();
        debug!("Releasing {}", port.name());
        port.close()
    }

    fn set_state(&mut self, state: UploadState) {
        if self.state != state {
            debug!("Upload state: {:?} -> {state:?}", self.state);
            self.state = state;
        }
    }

    fn finish(&mut self, outcome: Outcome) {
        self.last_result = Some(outcome);
        self.set_state(UploadState::Done);
    }

    fn since(&self, instant: Instant) -> Duration {
        self.loader.clock().elapsed(instant)
    }

    fn reset(&mut self) {
        if self.connect_attempts >= self.config.max_connect_attempts {
            warn!(
                "No reply from the loader after {} attempts",
                self.connect_attempts
            );
            self.finish(Err(UploadError::ConnectFailed));
            return;
        }

        let lines = self.config.reset_lines;
        let baud = self.config.baud_rate;
        let (port, clock) = self.loader.split_mut();
        let prepared = lines
            .enter_bootloader(port, clock)
            .and_then(|()| port.reopen(baud));
        if let Err(e) = prepared {
            warn!("Could not reset the module: {e}");
            self.finish(Err(UploadError::CommWrite));
            return;
        }

        let now = self.loader.clock().now();
        self.last_action = now;
        self.last_reset = now;
        self.set_state(UploadState::Connecting);
    }

    fn connect(&mut self) {
        if self.since(self.last_action) < self.config.connect_interval
            || self.since(self.last_reset) < self.config.reset_settle
        {
            return;
        }

        let result = self.loader.sync(self.config.sync_timeout);
        self.last_action = self.loader.clock().now();
        match result {
            Ok(()) => {
                info!("Connected to the serial loader");
                self.set_state(UploadState::Erasing);
            },
            Err(e) => {
                self.connect_attempts += 1;
                warn!(
                    "Sync attempt {}/{} failed: {e}",
                    self.connect_attempts, self.config.max_connect_attempts
                );
                if self.config.retries_per_reset == 0
                    || self.connect_attempts % self.config.retries_per_reset == 0
                {
                    self.set_state(UploadState::Resetting);
                }
            },
        }
    }

    fn erase(&mut self) {
        if self.since(self.last_action) < self.config.block_interval {
            return;
        }

        let size = erase_size(self.target_address, self.file_size);
        info!("Erasing flash at 0x{:06X}", self.target_address);
        match self.loader.flash_begin(self.target_address, size) {
            Ok(()) => {
                self.current_block = 0;
                self.next_percent = u32::from(self.config.percent_increment);
                self.last_action = self.loader.clock().now();
                self.set_state(UploadState::Uploading);
            },
            Err(e) => {
                warn!("Flash begin failed: {e}");
                self.finish(Err(e));
            },
        }
    }

    fn upload(&mut self) -> Step {
        if self.since(self.last_action) < self.config.block_interval {
            return Step::Pending;
        }

        if self.current_block >= self.total_blocks {
            let outcome = match self.config.finish {
                FinishAction::Skip => Ok(()),
                FinishAction::Stay => self.loader.flash_finish(false),
                FinishAction::Reboot => self.loader.flash_finish(true),
            };
            if outcome.is_ok() {
                info!("Upload complete: {} blocks", self.total_blocks);
            }
            self.finish(outcome);
            return Step::Pending;
        }

        let Some(source) = self.source.as_mut() else {
            self.finish(Err(UploadError::FileRead));
            return Step::Pending;
        };
        let result = self.loader.flash_write_block(
            source.as_mut(),
            self.current_block,
            self.target_address,
            self.config.flash_params,
        );
        self.last_action = self.loader.clock().now();
        if let Err(e) = result {
            warn!("Block {} failed: {e}", self.current_block);
            self.finish(Err(e));
            return Step::Pending;
        }

        self.current_block += 1;
        let percent = 100 * u64::from(self.current_block) / u64::from(self.total_blocks);
        let percent = u32::try_from(percent).unwrap_or(100);
        if percent >= self.next_percent {
            let increment = u32::from(self.config.percent_increment.max(1));
            while self.next_percent <= percent {
                self.next_percent += increment;
            }
            return Step::Progress(u8::try_from(percent).unwrap_or(100));
        }
        Step::Pending
    }

    fn cleanup(&mut self) -> Outcome {
        if let Some(mut source) = self.source.take() {
            source.close();
        }
        if self.config.reset_after {
            let lines = self.config.reset_lines;
            let (port, clock) = self.loader.split_mut();
            if let Err(e) = lines.run_firmware(port, clock) {
                warn!("Could not restart the module: {e}");
            }
        }
        self.set_state(UploadState::Idle);

        let outcome = self.last_result.unwrap_or(Ok(()));
        self.last_result = Some(outcome);
        match outcome {
            Ok(()) => info!("Upload finished"),
            Err(e) => warn!("Upload failed: {e}"),
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::manual::ManualClock;
    use crate::protocol::packet::Opcode;
    use crate::source::MemorySource;
    use crate::testing::{LineEvent, SimLoader};
    use byteorder::{ByteOrder, LittleEndian};
    use std::io;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    type SimSession = UploadSession<SimLoader, ManualClock>;

    fn session(sim: SimLoader, config: UploadConfig) -> SimSession {
        let clock = ManualClock::new(Duration::from_millis(1));
        UploadSession::new(Bootloader::new(sim, clock), config)
    }

    fn image(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    /// Source that reports when it was closed.
    struct Tracked {
        inner: MemorySource,
        closed: Arc<AtomicBool>,
    }

    impl Tracked {
        fn new(data: Vec<u8>) -> (Box<dyn FirmwareSource>, Arc<AtomicBool>) {
            let closed = Arc::new(AtomicBool::new(false));
            let source = Self {
                inner: MemorySource::new(data),
                closed: Arc::clone(&closed),
            };
            (Box::new(source), closed)
        }
    }

    impl FirmwareSource for Tracked {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.inner.read(buf)
        }

        fn position(&self) -> u64 {
            self.inner.position()
        }

        fn size(&self) -> u64 {
            self.inner.size()
        }

        fn close(&mut self) {
            self.inner.close();
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    fn advance_until(session: &mut SimSession, state: UploadState, limit: usize) -> bool {
        for _ in 0..limit {
            if session.state() == state {
                return true;
            }
            session.advance();
        }
        session.state() == state
    }

    #[test]
    fn test_erase_size() {
        // Fits in the first erase block: halved.
        assert_eq!(erase_size(0, 3000), 4096);
        assert_eq!(erase_size(0, 100 * 1024), 13 * 4096);
        // Crosses block boundaries: head sectors dropped.
        assert_eq!(erase_size(0x100000, 1024 * 1024), 240 * 4096);
        assert_eq!(erase_size(0x3000, 200 * 1024), (50 - 13) * 4096);
    }

    #[test]
    fn test_total_blocks_is_ceiling() {
        for (len, blocks) in [(1usize, 1u32), (1024, 1), (1025, 2), (2500, 3)] {
            let mut s = session(SimLoader::new(), UploadConfig::default());
            s.start(Box::new(MemorySource::new(vec![0u8; len])), 0)
                .unwrap();
            assert_eq!(s.total_blocks(), blocks);
            assert_eq!(s.file_size(), len as u32);
            assert!(s.current_block() <= s.total_blocks());
        }
    }

    #[test]
    fn test_empty_file_never_resets() {
        let mut s = session(SimLoader::new(), UploadConfig::default());
        let (source, closed) = Tracked::new(Vec::new());

        let err = s.start(source, 0).unwrap_err();
        assert!(matches!(err, Error::Upload(UploadError::EmptyFile)));
        assert_eq!(s.state(), UploadState::Idle);
        assert_eq!(s.last_result(), Some(Err(UploadError::EmptyFile)));
        assert!(closed.load(Ordering::SeqCst));

        assert_eq!(s.advance(), Step::Idle);
        assert!(s.bootloader().port().lines.is_empty());
        assert_eq!(s.bootloader().port().reopen_count, 0);
    }

    #[test]
    fn test_start_while_active_is_busy() {
        let mut s = session(SimLoader::new(), UploadConfig::default());
        s.start(Box::new(MemorySource::new(vec![1u8; 10])), 0)
            .unwrap();
        let err = s
            .start(Box::new(MemorySource::new(vec![1u8; 10])), 0)
            .unwrap_err();
        assert!(matches!(err, Error::Busy));
    }

    #[test]
    fn test_connects_after_failed_syncs_within_budget() {
        let mut sim = SimLoader::new();
        sim.ignore_syncs = 2;
        let mut s = session(sim, UploadConfig::default());
        s.start(Box::new(MemorySource::new(image(2048))), 0)
            .unwrap();

        assert!(advance_until(&mut s, UploadState::Erasing, 10_000));
        assert_eq!(s.connect_attempts(), 2);
        assert_eq!(s.bootloader().port().count(Opcode::Sync), 3);
        assert_eq!(s.bootloader().port().reopen_count, 1);
        assert_eq!(s.bootloader().port().baud_rate, 115_200);
    }

    #[test]
    fn test_gives_up_after_nine_attempts() {
        let mut sim = SimLoader::new();
        sim.silent = true;
        let mut s = session(sim, UploadConfig::default());
        s.start(Box::new(MemorySource::new(image(2048))), 0)
            .unwrap();

        let mut attempts_at_reset = Vec::new();
        let mut previous = UploadState::Idle;
        let outcome = loop {
            if s.state() == UploadState::Resetting && previous != UploadState::Resetting {
                attempts_at_reset.push(s.connect_attempts());
            }
            previous = s.state();
            if let Step::Finished(outcome) = s.advance() {
                break outcome;
            }
        };

        assert_eq!(outcome, Err(UploadError::ConnectFailed));
        assert_eq!(attempts_at_reset, vec![0, 3, 6, 9]);
        assert_eq!(s.bootloader().port().count(Opcode::Sync), 9);
        assert_eq!(s.bootloader().port().reopen_count, 3);
        assert_eq!(s.state(), UploadState::Idle);
    }

    #[test]
    fn test_connect_waits_for_reset_settle() {
        let mut s = session(SimLoader::new(), UploadConfig::default());
        s.start(Box::new(MemorySource::new(image(100))), 0)
            .unwrap();

        s.advance();
        assert_eq!(s.state(), UploadState::Connecting);
        s.advance();
        assert_eq!(s.bootloader().port().count(Opcode::Sync), 0);

        s.bootloader().clock().advance(Duration::from_millis(500));
        s.advance();
        assert_eq!(s.bootloader().port().count(Opcode::Sync), 1);
        assert_eq!(s.state(), UploadState::Erasing);
    }

    #[test]
    fn test_full_upload() {
        let data = image(3000);
        let mut s = session(SimLoader::new(), UploadConfig::default());
        let (source, closed) = Tracked::new(data.clone());
        s.start(source, 0x1000).unwrap();

        let mut progress = Vec::new();
        let mut outcome = None;
        for _ in 0..10_000 {
            let step = s.advance();
            assert!(s.current_block() <= s.total_blocks(), "after {step:?}");
            match step {
                Step::Progress(p) => progress.push(p),
                Step::Finished(result) => {
                    outcome = Some(result);
                    break;
                },
                Step::Idle | Step::Pending => {},
            }
        }

        assert_eq!(outcome, Some(Ok(())));
        assert_eq!(s.last_result(), Some(Ok(())));
        assert_eq!(s.state(), UploadState::Idle);
        assert_eq!(s.current_block(), 3);
        assert_eq!(progress, vec![33, 66, 100]);
        assert!(closed.load(Ordering::SeqCst));

        let sim = s.bootloader().port();
        let mut expected = data;
        expected.resize(3072, 0);
        assert_eq!(sim.flashed, expected);

        let begin = sim.requests_of(Opcode::FlashBegin).next().unwrap();
        assert_eq!(
            LittleEndian::read_u32(&begin.body[0..4]),
            erase_size(0x1000, 3000)
        );
        assert_eq!(LittleEndian::read_u32(&begin.body[12..16]), 0x1000);
        assert_eq!(sim.count(Opcode::FlashEnd), 0);

        // Back to normal boot at the end.
        assert_eq!(
            &sim.lines[sim.lines.len() - 3..],
            &[
                LineEvent::Dtr(false),
                LineEvent::Rts(true),
                LineEvent::Rts(false)
            ]
        );
    }

    #[test]
    fn test_finish_reboot_sends_flash_end() {
        let config = UploadConfig::default()
            .with_finish(FinishAction::Reboot)
            .with_reset_after(false);
        let mut s = session(SimLoader::new(), config);
        s.start(Box::new(MemorySource::new(image(10))), 0)
            .unwrap();

        assert_eq!(s.run_with(|_| {}, || false), Ok(()));

        let sim = s.bootloader().port();
        let end = sim.requests_of(Opcode::FlashEnd).next().unwrap();
        assert_eq!(end.body, vec![0, 0, 0, 0]);
        assert_eq!(sim.lines.last(), Some(&LineEvent::Rts(false)));
        assert_eq!(sim.lines.len(), 3);
    }

    #[test]
    fn test_block_failure_is_fatal() {
        let mut sim = SimLoader::new();
        sim.reject_blocks = 3;
        let mut s = session(sim, UploadConfig::default());
        let (source, closed) = Tracked::new(image(4096));
        s.start(source, 0).unwrap();

        assert_eq!(s.run_with(|_| {}, || false), Err(UploadError::BadReply));
        assert_eq!(s.bootloader().port().count(Opcode::FlashData), 3);
        assert!(s.bootloader().port().flashed.is_empty());
        assert!(closed.load(Ordering::SeqCst));
    }

    #[test]
    fn test_flash_begin_failure_is_fatal() {
        let mut sim = SimLoader::new();
        sim.reject_begin = true;
        let mut s = session(sim, UploadConfig::default());
        s.start(Box::new(MemorySource::new(image(10))), 0)
            .unwrap();

        assert_eq!(s.run_with(|_| {}, || false), Err(UploadError::BadReply));
        assert_eq!(s.bootloader().port().count(Opcode::FlashData), 0);
    }

    #[test]
    fn test_flash_params_patched_into_first_block() {
        let mut data = image(2048);
        data[0] = 0xE9;
        data[2] = 0x00;
        data[3] = 0x00;
        let config = UploadConfig::default().with_flash_params(Some(
            crate::protocol::command::FlashParams {
                value: 0x0220,
                mask: 0xFFFF,
            },
        ));
        let mut s = session(SimLoader::new(), config);
        s.start(Box::new(MemorySource::new(data)), 0).unwrap();

        assert_eq!(s.run_with(|_| {}, || false), Ok(()));
        assert_eq!(&s.bootloader().port().flashed[2..4], &[0x20, 0x02]);
    }

    #[test]
    fn test_cancel() {
        let mut s = session(SimLoader::new(), UploadConfig::default());
        let (source, closed) = Tracked::new(image(4096));
        s.start(source, 0).unwrap();
        s.advance();

        assert!(s.cancel());
        assert_eq!(s.advance(), Step::Finished(Err(UploadError::Cancelled)));
        assert!(closed.load(Ordering::SeqCst));
        assert!(!s.cancel());
        assert_eq!(s.advance(), Step::Idle);
    }

    #[test]
    fn test_close_mid_upload_releases_port_and_image() {
        let mut s = session(SimLoader::new(), UploadConfig::default());
        let (source, closed) = Tracked::new(image(4096));
        s.start(source, 0).unwrap();
        s.advance();
        assert!(s.is_active());

        s.close().unwrap();
        assert!(closed.load(Ordering::SeqCst));
        assert!(s.bootloader().port().closed);
        assert_eq!(s.state(), UploadState::Idle);
        assert_eq!(s.last_result(), Some(Err(UploadError::Cancelled)));
    }

    #[test]
    fn test_close_after_upload_keeps_result() {
        let mut s = session(SimLoader::new(), UploadConfig::default());
        s.start(Box::new(MemorySource::new(image(1024))), 0)
            .unwrap();
        assert_eq!(s.run_with(|_| {}, || false), Ok(()));

        s.close().unwrap();
        assert!(s.bootloader().port().closed);
        assert_eq!(s.last_result(), Some(Ok(())));
    }

    #[test]
    fn test_run_stops_when_interrupted() {
        let mut s = session(SimLoader::new(), UploadConfig::default());
        s.start(Box::new(MemorySource::new(image(4096))), 0)
            .unwrap();
        assert_eq!(
            s.run_with(|_| {}, || true),
            Err(UploadError::Cancelled)
        );
        assert_eq!(s.bootloader().port().count(Opcode::FlashData), 0);
    }

    #[test]
    fn test_restart_after_completion() {
        let mut s = session(SimLoader::new(), UploadConfig::default());
        s.start(Box::new(MemorySource::new(image(10))), 0)
            .unwrap();
        assert_eq!(s.run_with(|_| {}, || false), Ok(()));

        s.start(Box::new(MemorySource::new(image(10))), 0x100000)
            .unwrap();
        assert_eq!(s.connect_attempts(), 0);
        assert_eq!(s.run_with(|_| {}, || false), Ok(()));
        assert_eq!(s.bootloader().port().count(Opcode::FlashBegin), 2);
    }
}
