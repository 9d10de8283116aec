//! Bootstrap loader session: erase the Launchpad and write new firmware.
//!
//! The session walks one terminal through a fixed sequence of BSL commands.
//! Each step sends one command, arms its own timeout and waits for either an
//! ack byte or a reply packet:
//!
//! ```text
//! Connect -> SetBaudRate -> GetDeviceInfo -> Unlock -> Erase
//!         -> WriteBatch(0) .. WriteBatch(n-1) -> Restart -> Done
//! ```
//!
//! Any error closes the terminal and ends the session in [`Step::Failed`].

pub mod programmer;

use std::{
    fmt,
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use log::{debug, info, trace, warn};

use crate::{
    discovery::POLL_INTERVAL,
    error::{Error, MalformedPacket, Result},
    is_interrupted_requested,
    port::Port,
    protocol::bsl::{self, BaudRate, DeviceInfo},
    terminal::{Terminal, TerminalEvent},
    timer::SingleShotTimer,
};

/// Bytes written per program data command.
pub const BATCH_SIZE: usize = 12 * 1024;

/// Baud rate the BSL listens on after reset.
pub const BSL_BAUD_RATE: u32 = 9_600;

/// Baud rate used after the connect handshake.
pub const FAST_BAUD_RATE: BaudRate = BaudRate::B1000000;

/// Per-step timeouts.
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// Timeout for short commands.
    pub command_timeout: Duration,
    /// Timeout for the mass erase.
    pub erase_timeout: Duration,
    /// Timeout for one batch write.
    pub batch_timeout: Duration,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            command_timeout: Duration::from_millis(300),
            erase_timeout: Duration::from_secs(1),
            batch_timeout: Duration::from_millis(500),
        }
    }
}

impl LoaderConfig {
    /// Set the command timeout.
    #[must_use]
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Set the erase timeout.
    #[must_use]
    pub fn with_erase_timeout(mut self, timeout: Duration) -> Self {
        self.erase_timeout = timeout;
        self
    }

    /// Set the batch timeout.
    #[must_use]
    pub fn with_batch_timeout(mut self, timeout: Duration) -> Self {
        self.batch_timeout = timeout;
        self
    }
}

/// Position in the programming sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Not started.
    Idle,
    /// Waiting for the connect ack.
    Connect,
    /// Waiting for the baud rate ack.
    SetBaudRate,
    /// Waiting for the device info reply.
    GetDeviceInfo,
    /// Waiting for the unlock reply.
    Unlock,
    /// Waiting for the mass erase reply.
    Erase,
    /// Waiting for the ack of batch `n` (zero based).
    WriteBatch(usize),
    /// Waiting for the start application ack.
    Restart,
    /// Firmware written and started.
    Done,
    /// The session ended with an error.
    Failed,
}

impl Step {
    fn is_running(self) -> bool {
        !matches!(self, Self::Idle | Self::Done | Self::Failed)
    }

    fn expects_ack(self) -> bool {
        matches!(
            self,
            Self::Connect | Self::SetBaudRate | Self::WriteBatch(_) | Self::Restart
        )
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => f.write_str("idle"),
            Self::Connect => f.write_str("connect"),
            Self::SetBaudRate => f.write_str("set baud rate"),
            Self::GetDeviceInfo => f.write_str("get device info"),
            Self::Unlock => f.write_str("unlock"),
            Self::Erase => f.write_str("erase"),
            Self::WriteBatch(index) => write!(f, "write batch {}", index + 1),
            Self::Restart => f.write_str("restart"),
            Self::Done => f.write_str("done"),
            Self::Failed => f.write_str("failed"),
        }
    }
}

/// Progress messages of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Progress {
    /// Opening the port and sending connect.
    Connecting {
        /// Port name.
        port: String,
    },
    /// The BSL answered.
    Connected {
        /// Port name.
        port: String,
    },
    /// Switching the baud rate.
    SetBaudRate {
        /// New rate in bits per second.
        baud_rate: u32,
    },
    /// Asking for the device info.
    GetDeviceInfo,
    /// Buffer size reported by the device.
    BufferSize {
        /// Size in bytes.
        bytes: u16,
    },
    /// Unlocking.
    Unlock,
    /// Erasing.
    Erase,
    /// Starting to write the image.
    WriteFirmware {
        /// Image size in bytes.
        size: usize,
    },
    /// Writing one batch.
    Batch {
        /// One-based batch number.
        index: usize,
        /// Number of batches.
        total: usize,
    },
    /// Starting the new firmware.
    Restart,
}

impl fmt::Display for Progress {
    #[allow(clippy::cast_precision_loss)]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connecting { port } => write!(f, "Establish connection on {port}"),
            Self::Connected { port } => write!(f, "Connected on {port}"),
            Self::SetBaudRate { baud_rate } => write!(f, "Set baud rate: {baud_rate}"),
            Self::GetDeviceInfo => f.write_str("Get device info"),
            Self::BufferSize { bytes } => {
                write!(f, "Max. buffer size: {:.1} KiB", f64::from(*bytes) / 1024.0)
            },
            Self::Unlock => f.write_str("Unlock bootstrap loader"),
            Self::Erase => f.write_str("Erase memory"),
            Self::WriteFirmware { size } => {
                write!(f, "Write firmware ({:.1} KiB)", *size as f64 / 1024.0)
            },
            Self::Batch { index, total } => write!(f, "Write batch {index}/{total}"),
            Self::Restart => f.write_str("Restart"),
        }
    }
}

/// What a session reports to its owner.
#[derive(Debug)]
pub enum LoaderEvent {
    /// A step started.
    Progress(Progress),
    /// The firmware was written and started.
    Success,
    /// The session failed; the terminal is closed.
    Failed(Error),
}

/// What the device sent for the outstanding command.
enum Response {
    Ack,
    Reply(Vec<u8>),
}

/// Programming session over one terminal.
pub struct BootstrapLoader<P: Port> {
    terminal: Terminal<P>,
    firmware: Arc<[u8]>,
    config: LoaderConfig,
    step: Step,
    timer: SingleShotTimer,
    device_info: Option<DeviceInfo>,
    queued: Vec<LoaderEvent>,
}

impl<P: Port> BootstrapLoader<P> {
    /// Create an idle session. The terminal is opened by [`start`](Self::start).
    pub fn new(terminal: Terminal<P>, firmware: impl Into<Arc<[u8]>>, config: LoaderConfig) -> Self {
        Self {
            terminal,
            firmware: firmware.into(),
            config,
            step: Step::Idle,
            timer: SingleShotTimer::new(),
            device_info: None,
            queued: Vec::new(),
        }
    }

    /// Current step.
    pub fn step(&self) -> Step {
        self.step
    }

    /// Name of the port in use.
    pub fn port_name(&self) -> &str {
        self.terminal.port_name()
    }

    /// Device info, once received.
    pub fn device_info(&self) -> Option<&DeviceInfo> {
        self.device_info.as_ref()
    }

    /// Number of batches the image is cut into.
    pub fn total_batches(&self) -> usize {
        self.firmware.len().div_ceil(BATCH_SIZE)
    }

    /// Give the terminal back, for instance after [`Step::Done`].
    pub fn into_terminal(self) -> Terminal<P> {
        self.terminal
    }

    /// Open the terminal and send the connect command.
    pub fn start(&mut self, now: Instant) {
        if self.step != Step::Idle {
            debug!("{}: start ignored in step {}", self.port_name(), self.step);
            return;
        }

        if self.firmware.is_empty() {
            self.fail(Error::InvalidFirmware("empty image".to_string()));
            return;
        }
        if u32::try_from(self.firmware.len()).is_err() {
            self.fail(Error::InvalidFirmware(format!(
                "image of {} bytes does not fit the address space",
                self.firmware.len()
            )));
            return;
        }

        let port = self.port_name().to_string();
        self.progress(Progress::Connecting { port });
        self.step = Step::Connect;

        // a failed open is reported by the terminal's next poll
        if self.terminal.open() {
            if let Err(e) = self.terminal.set_baud_rate(BSL_BAUD_RATE) {
                self.fail(e);
                return;
            }
            self.command(&bsl::connect(), true, self.config.command_timeout, now);
        }
    }

    /// Stop a running session with [`Error::Cancelled`].
    pub fn cancel(&mut self) {
        if self.step.is_running() {
            info!("{}: cancelled", self.port_name());
            let port = self.port_name().to_string();
            self.fail(Error::Cancelled { port });
        }
    }

    /// Check the step timeout and process whatever the terminal received.
    pub fn poll(&mut self, now: Instant) -> Vec<LoaderEvent> {
        if self.step.is_running() {
            if self.timer.expired(now) {
                let error = Error::Timeout {
                    port: self.port_name().to_string(),
                    step: self.step.to_string(),
                };
                self.fail(error);
            } else {
                for event in self.terminal.poll() {
                    self.handle_event(event, now);
                }
            }
        }
        std::mem::take(&mut self.queued)
    }

    /// Process one terminal event.
    ///
    /// Events are ignored once the session is done or failed. Results are
    /// delivered by the next [`poll`](Self::poll).
    pub fn handle_event(&mut self, event: TerminalEvent, now: Instant) {
        if !self.step.is_running() {
            trace!("{}: ignoring {event:?} in step {}", self.port_name(), self.step);
            return;
        }

        let response = match event {
            TerminalEvent::Ack => Response::Ack,
            TerminalEvent::Reply(packet) => Response::Reply(packet),
            TerminalEvent::Error(Error::MalformedPacket(MalformedPacket::Invalid {
                len: 1,
                prefix,
            })) if bsl::nak_description(prefix[0]).is_some() => {
                self.fail(Error::ProtocolRejected { reply: prefix });
                return;
            },
            TerminalEvent::Error(error) => {
                self.fail(error);
                return;
            },
        };

        if !self.timer.is_active(now) {
            let kind = match response {
                Response::Ack => "ack",
                Response::Reply(_) => "reply",
            };
            self.fail(Error::UnexpectedResponse(format!(
                "{kind} with no command outstanding in step {}",
                self.step
            )));
            return;
        }
        self.timer.stop();

        if let Err(error) = self.dispatch(response, now) {
            self.fail(error);
        }
    }

    /// Poll until the session succeeds or fails.
    pub fn run<F>(&mut self, mut progress: F) -> Result<()>
    where
        F: FnMut(&Progress),
    {
        match self.step {
            Step::Idle => self.start(Instant::now()),
            Step::Done => return Ok(()),
            Step::Failed => return Err(Error::NotConnected),
            _ => {},
        }

        loop {
            if is_interrupted_requested() {
                self.cancel();
                return Err(Error::Interrupted);
            }

            for event in self.poll(Instant::now()) {
                match event {
                    LoaderEvent::Progress(p) => progress(&p),
                    LoaderEvent::Success => return Ok(()),
                    LoaderEvent::Failed(error) => return Err(error),
                }
            }

            thread::sleep(POLL_INTERVAL);
        }
    }

    fn dispatch(&mut self, response: Response, now: Instant) -> Result<()> {
        let step = self.step;
        match (step, response) {
            (Step::Connect, Response::Ack) => {
                let port = self.port_name().to_string();
                self.progress(Progress::Connected { port });
                self.progress(Progress::SetBaudRate {
                    baud_rate: FAST_BAUD_RATE.bits_per_second(),
                });
                self.step = Step::SetBaudRate;
                self.command(
                    &bsl::change_baud_rate(FAST_BAUD_RATE),
                    true,
                    self.config.command_timeout,
                    now,
                );
            },
            (Step::SetBaudRate, Response::Ack) => {
                self.terminal
                    .set_baud_rate(FAST_BAUD_RATE.bits_per_second())?;
                self.progress(Progress::GetDeviceInfo);
                self.step = Step::GetDeviceInfo;
                self.command(&bsl::get_device_info(), false, self.config.command_timeout, now);
            },
            (Step::GetDeviceInfo, Response::Reply(packet)) => {
                let info = DeviceInfo::parse(&bsl::unpack_bsl(&packet)?)?;
                debug!("{}: {info:?}", self.port_name());
                self.device_info = Some(info);

                let required = BATCH_SIZE + 8;
                if usize::from(info.max_buffer_size) < required {
                    return Err(Error::BufferTooSmall {
                        available: info.max_buffer_size,
                        required,
                    });
                }

                self.progress(Progress::BufferSize {
                    bytes: info.max_buffer_size,
                });
                self.progress(Progress::Unlock);
                self.step = Step::Unlock;
                self.command(
                    &bsl::unlock(&bsl::DEFAULT_PASSWORD),
                    false,
                    self.config.command_timeout,
                    now,
                );
            },
            (Step::Unlock, Response::Reply(packet)) => {
                expect_ok(&packet)?;
                self.progress(Progress::Erase);
                self.step = Step::Erase;
                self.command(&bsl::mass_erase(), false, self.config.erase_timeout, now);
            },
            (Step::Erase, Response::Reply(packet)) => {
                expect_ok(&packet)?;
                self.progress(Progress::WriteFirmware {
                    size: self.firmware.len(),
                });
                self.write_batch(0, now);
            },
            (Step::WriteBatch(index), Response::Ack) => {
                if index + 1 < self.total_batches() {
                    self.write_batch(index + 1, now);
                } else {
                    self.progress(Progress::Restart);
                    self.step = Step::Restart;
                    self.command(
                        &bsl::start_application(),
                        true,
                        self.config.command_timeout,
                        now,
                    );
                }
            },
            (Step::Restart, Response::Ack) => {
                info!("{}: firmware written", self.port_name());
                self.terminal.set_ack_mode(false);
                self.step = Step::Done;
                self.queued.push(LoaderEvent::Success);
            },
            (step, response) => {
                let got = match response {
                    Response::Ack => "ack",
                    Response::Reply(_) => "reply",
                };
                let wanted = if step.expects_ack() { "ack" } else { "reply" };
                return Err(Error::UnexpectedResponse(format!(
                    "{got} in step {step}, expected {wanted}"
                )));
            },
        }
        Ok(())
    }

    fn write_batch(&mut self, index: usize, now: Instant) {
        let start = index * BATCH_SIZE;
        let end = (start + BATCH_SIZE).min(self.firmware.len());
        self.progress(Progress::Batch {
            index: index + 1,
            total: self.total_batches(),
        });

        // start < len, and len was checked to fit u32 in start()
        let address = u32::try_from(start).unwrap_or(u32::MAX);
        let packet = bsl::program_data(address, &self.firmware[start..end]);
        self.step = Step::WriteBatch(index);
        self.command(&packet, true, self.config.batch_timeout, now);
    }

    fn command(&mut self, packet: &[u8], ack_mode: bool, timeout: Duration, now: Instant) {
        self.timer.stop();
        self.terminal.set_ack_mode(ack_mode);
        trace!("{}: step {}", self.port_name(), self.step);
        match self.terminal.write(packet) {
            Ok(_) => self.timer.start(now, timeout),
            Err(e) => self.fail(e),
        }
    }

    fn progress(&mut self, progress: Progress) {
        debug!("{}: {progress}", self.port_name());
        self.queued.push(LoaderEvent::Progress(progress));
    }

    fn fail(&mut self, error: Error) {
        warn!("{}: {error}", self.port_name());
        self.timer.stop();
        self.terminal.close();
        self.step = Step::Failed;
        self.queued.push(LoaderEvent::Failed(error));
    }
}

fn expect_ok(packet: &[u8]) -> Result<()> {
    let reply = bsl::unpack_bsl(packet)?;
    if bsl::is_ok(&reply) {
        Ok(())
    } else {
        Err(Error::ProtocolRejected { reply })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{
        port::mock::{Failure, MockHandle, MockPort},
        protocol::bsl::tests::{device_info_bytes, reply_frame},
    };

    /// How the simulated bootstrap loader behaves.
    #[derive(Clone)]
    pub(crate) struct Device {
        pub(crate) max_buffer_size: u16,
        pub(crate) unlock_reply: Vec<u8>,
        /// Batch offset that never gets an ack.
        pub(crate) silent_offset: Option<u32>,
        /// Command answered with this NAK byte.
        pub(crate) nak: Option<(u8, u8)>,
        pub(crate) corrupt_device_info: bool,
        /// Do not answer at all.
        pub(crate) silent: bool,
    }

    impl Default for Device {
        fn default() -> Self {
            Self {
                max_buffer_size: 0x3400,
                unlock_reply: bsl::OK.to_vec(),
                silent_offset: None,
                nak: None,
                corrupt_device_info: false,
                silent: false,
            }
        }
    }

    impl Device {
        pub(crate) fn install(self, handle: &MockHandle) {
            handle.respond_with(move |data, _baud| self.respond(data));
        }

        fn respond(&self, data: &[u8]) -> Vec<u8> {
            if self.silent || data.len() < 8 || data[0] != bsl::HOST_HEADER {
                return Vec::new();
            }
            let payload = &data[3..data.len() - 4];
            let cmd = payload[0];
            if let Some((nak_cmd, byte)) = self.nak {
                if nak_cmd == cmd {
                    return vec![byte];
                }
            }

            match cmd {
                bsl::CMD_CONNECT | bsl::CMD_CHANGE_BAUD_RATE | bsl::CMD_START_APPLICATION => {
                    vec![bsl::ACK]
                },
                bsl::CMD_GET_DEVICE_INFO => {
                    let mut frame = reply_frame(&device_info_bytes(self.max_buffer_size));
                    if self.corrupt_device_info {
                        let last = frame.len() - 1;
                        frame[last] ^= 0x01;
                    }
                    frame
                },
                bsl::CMD_UNLOCK => reply_frame(&self.unlock_reply),
                bsl::CMD_MASS_ERASE => reply_frame(&bsl::OK),
                bsl::CMD_PROGRAM_DATA => {
                    let offset = u32::from_le_bytes([payload[1], payload[2], payload[3], payload[4]]);
                    if self.silent_offset == Some(offset) {
                        Vec::new()
                    } else {
                        vec![bsl::ACK]
                    }
                },
                _ => Vec::new(),
            }
        }
    }

    pub(crate) fn firmware(len: usize) -> Arc<[u8]> {
        (0..len).map(|i| (i % 253) as u8).collect::<Vec<u8>>().into()
    }

    fn loader(device: Device, image: Arc<[u8]>) -> (BootstrapLoader<MockPort>, MockHandle) {
        let _ = env_logger::builder().is_test(true).try_init();
        let (port, handle) = MockPort::new("COM3");
        device.install(&handle);
        let loader = BootstrapLoader::new(Terminal::new(port), image, LoaderConfig::default());
        (loader, handle)
    }

    /// Poll at a fixed instant until nothing moves any more.
    fn drive(loader: &mut BootstrapLoader<MockPort>, now: Instant) -> Vec<LoaderEvent> {
        let mut events = Vec::new();
        for _ in 0..64 {
            let batch = loader.poll(now);
            if batch.is_empty() && loader.step().is_running() {
                break;
            }
            events.extend(batch);
            if !loader.step().is_running() {
                break;
            }
        }
        events
    }

    fn failure(events: &[LoaderEvent]) -> &Error {
        match events.last() {
            Some(LoaderEvent::Failed(error)) => error,
            other => panic!("expected failure, got {other:?}"),
        }
    }

    /// Commands written so far, by command byte.
    fn commands(handle: &MockHandle) -> Vec<u8> {
        handle.written().iter().map(|p| p[3]).collect()
    }

    fn batch_offsets(handle: &MockHandle) -> Vec<u32> {
        handle
            .written()
            .iter()
            .filter(|p| p[3] == bsl::CMD_PROGRAM_DATA)
            .map(|p| u32::from_le_bytes([p[4], p[5], p[6], p[7]]))
            .collect()
    }

    #[test]
    fn test_full_sequence() {
        let image = firmware(BATCH_SIZE * 5 / 2);
        let (mut loader, handle) = loader(Device::default(), image);
        assert_eq!(loader.total_batches(), 3);

        let now = Instant::now();
        loader.start(now);
        let events = drive(&mut loader, now);

        assert!(matches!(events.last(), Some(LoaderEvent::Success)));
        assert_eq!(loader.step(), Step::Done);
        assert_eq!(
            commands(&handle),
            vec![
                bsl::CMD_CONNECT,
                bsl::CMD_CHANGE_BAUD_RATE,
                bsl::CMD_GET_DEVICE_INFO,
                bsl::CMD_UNLOCK,
                bsl::CMD_MASS_ERASE,
                bsl::CMD_PROGRAM_DATA,
                bsl::CMD_PROGRAM_DATA,
                bsl::CMD_PROGRAM_DATA,
                bsl::CMD_START_APPLICATION,
            ]
        );
        assert_eq!(batch_offsets(&handle), vec![0, 12288, 24576]);
        assert_eq!(handle.baud_rates(), vec![BSL_BAUD_RATE, 1_000_000]);
        assert_eq!(handle.written()[0], bsl::connect());

        // The last batch carries the remaining half batch
        let last = handle.written()[7].clone();
        assert_eq!(last.len(), BATCH_SIZE / 2 + 5 + 7);

        assert_eq!(loader.device_info().unwrap().max_buffer_size, 0x3400);
        let terminal = loader.into_terminal();
        assert!(terminal.is_open());
    }

    #[test]
    fn test_progress_messages() {
        let (mut loader, _handle) = loader(Device::default(), firmware(100));
        let now = Instant::now();
        loader.start(now);
        let messages: Vec<String> = drive(&mut loader, now)
            .iter()
            .filter_map(|e| match e {
                LoaderEvent::Progress(p) => Some(p.to_string()),
                _ => None,
            })
            .collect();

        assert_eq!(
            messages,
            vec![
                "Establish connection on COM3",
                "Connected on COM3",
                "Set baud rate: 1000000",
                "Get device info",
                "Max. buffer size: 13.0 KiB",
                "Unlock bootstrap loader",
                "Erase memory",
                "Write firmware (0.1 KiB)",
                "Write batch 1/1",
                "Restart",
            ]
        );
    }

    #[test]
    fn test_batch_timeout_aborts() {
        let device = Device {
            silent_offset: Some(BATCH_SIZE as u32),
            ..Device::default()
        };
        let (mut loader, handle) = loader(device, firmware(BATCH_SIZE * 5 / 2));
        let now = Instant::now();
        loader.start(now);
        let events = drive(&mut loader, now);
        assert!(!events.iter().any(|e| matches!(e, LoaderEvent::Failed(_))));
        assert_eq!(loader.step(), Step::WriteBatch(1));

        let events = loader.poll(now + LoaderConfig::default().batch_timeout);
        match failure(&events) {
            Error::Timeout { port, step } => {
                assert_eq!(port, "COM3");
                assert_eq!(step, "write batch 2");
            },
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(batch_offsets(&handle), vec![0, 12288]);
        assert!(!handle.is_open());
        assert_eq!(loader.step(), Step::Failed);
    }

    #[test]
    fn test_buffer_too_small_before_erase() {
        let device = Device {
            max_buffer_size: u16::try_from(BATCH_SIZE + 7).unwrap(),
            ..Device::default()
        };
        let (mut loader, handle) = loader(device, firmware(1000));
        let now = Instant::now();
        loader.start(now);
        let events = drive(&mut loader, now);

        assert!(matches!(
            failure(&events),
            Error::BufferTooSmall { available, required: 12296 } if *available == 12295
        ));
        assert!(!commands(&handle).contains(&bsl::CMD_UNLOCK));
        assert!(!commands(&handle).contains(&bsl::CMD_MASS_ERASE));
    }

    #[test]
    fn test_buffer_exactly_large_enough() {
        let device = Device {
            max_buffer_size: u16::try_from(BATCH_SIZE + 8).unwrap(),
            ..Device::default()
        };
        let (mut loader, _handle) = loader(device, firmware(1000));
        let now = Instant::now();
        loader.start(now);
        assert!(matches!(
            drive(&mut loader, now).last(),
            Some(LoaderEvent::Success)
        ));
    }

    #[test]
    fn test_unlock_rejected() {
        let device = Device {
            unlock_reply: vec![0x3B, 0x02],
            ..Device::default()
        };
        let (mut loader, handle) = loader(device, firmware(1000));
        let now = Instant::now();
        loader.start(now);
        let events = drive(&mut loader, now);

        match failure(&events) {
            Error::ProtocolRejected { reply } => assert_eq!(reply, &vec![0x3B, 0x02]),
            other => panic!("unexpected {other:?}"),
        }
        assert!(!commands(&handle).contains(&bsl::CMD_MASS_ERASE));
    }

    #[test]
    fn test_nak_byte_is_protocol_rejected() {
        let device = Device {
            nak: Some((bsl::CMD_CONNECT, 0x52)),
            ..Device::default()
        };
        let (mut loader, _handle) = loader(device, firmware(1000));
        let now = Instant::now();
        loader.start(now);
        let events = drive(&mut loader, now);

        let error = failure(&events);
        assert!(matches!(error, Error::ProtocolRejected { reply } if reply == &vec![0x52]));
        assert!(error.to_string().contains("checksum incorrect"));
    }

    #[test]
    fn test_nak_byte_in_reply_step_is_protocol_rejected() {
        let device = Device {
            nak: Some((bsl::CMD_GET_DEVICE_INFO, 0x52)),
            ..Device::default()
        };
        let (mut loader, handle) = loader(device, firmware(1000));
        let now = Instant::now();
        loader.start(now);
        let events = drive(&mut loader, now);

        let error = failure(&events);
        assert!(matches!(error, Error::ProtocolRejected { reply } if reply == &vec![0x52]));
        assert_eq!(loader.step(), Step::Failed);
        assert!(!commands(&handle).contains(&bsl::CMD_UNLOCK));
    }

    #[test]
    fn test_checksum_mismatch_is_distinct() {
        let device = Device {
            corrupt_device_info: true,
            ..Device::default()
        };
        let (mut loader, _handle) = loader(device, firmware(1000));
        let now = Instant::now();
        loader.start(now);
        let events = drive(&mut loader, now);
        assert!(matches!(failure(&events), Error::ChecksumMismatch { .. }));
    }

    #[test]
    fn test_connect_timeout() {
        let device = Device {
            silent: true,
            ..Device::default()
        };
        let (mut loader, handle) = loader(device, firmware(1000));
        let now = Instant::now();
        loader.start(now);
        assert_eq!(drive(&mut loader, now).len(), 1);

        let events = loader.poll(now + Duration::from_millis(300));
        assert!(matches!(
            failure(&events),
            Error::Timeout { step, .. } if step == "connect"
        ));
        assert!(!handle.is_open());
    }

    #[test]
    fn test_wrong_response_kind() {
        let device = Device {
            silent: true,
            ..Device::default()
        };
        let (mut loader, _handle) = loader(device, firmware(1000));
        let now = Instant::now();
        loader.start(now);
        loader.handle_event(TerminalEvent::Reply(reply_frame(&bsl::OK)), now);
        let events = loader.poll(now);
        assert!(matches!(failure(&events), Error::UnexpectedResponse(_)));
    }

    #[test]
    fn test_response_after_timer_elapsed() {
        let device = Device {
            silent: true,
            ..Device::default()
        };
        let (mut loader, _handle) = loader(device, firmware(1000));
        let now = Instant::now();
        loader.start(now);
        loader.handle_event(TerminalEvent::Ack, now + Duration::from_secs(1));
        let events = loader.poll(now + Duration::from_secs(1));
        assert!(matches!(failure(&events), Error::UnexpectedResponse(_)));
    }

    #[test]
    fn test_events_ignored_after_failure() {
        let device = Device {
            silent: true,
            ..Device::default()
        };
        let (mut loader, _handle) = loader(device, firmware(1000));
        let now = Instant::now();
        loader.start(now);
        loader.cancel();
        let events = loader.poll(now);
        assert!(matches!(failure(&events), Error::Cancelled { port } if port == "COM3"));

        loader.handle_event(TerminalEvent::Ack, now);
        loader.cancel();
        assert!(loader.poll(now).is_empty());
        assert_eq!(loader.step(), Step::Failed);
    }

    #[test]
    fn test_empty_firmware_rejected() {
        let (mut loader, handle) = loader(Device::default(), firmware(0));
        loader.start(Instant::now());
        let events = loader.poll(Instant::now());
        assert!(matches!(failure(&events), Error::InvalidFirmware(_)));
        assert_eq!(handle.open_count(), 0);
    }

    #[test]
    fn test_open_failure() {
        let (port, handle) = MockPort::new("COM3");
        handle.fail_open(Failure::PermissionDenied);
        let mut loader = BootstrapLoader::new(Terminal::new(port), firmware(10), LoaderConfig::default());
        let now = Instant::now();
        loader.start(now);
        let events = loader.poll(now);
        assert!(matches!(failure(&events), Error::PermissionDenied { .. }));
    }

    #[test]
    fn test_run_blocking() {
        let (mut loader, _handle) = loader(Device::default(), firmware(BATCH_SIZE + 1));
        let mut seen = Vec::new();
        loader.run(|p| seen.push(p.clone())).unwrap();
        assert!(seen.contains(&Progress::Batch { index: 2, total: 2 }));
        assert_eq!(loader.step(), Step::Done);
        assert!(loader.run(|_| {}).is_ok());
    }

    #[test]
    fn test_step_display() {
        assert_eq!(Step::WriteBatch(0).to_string(), "write batch 1");
        assert_eq!(Step::SetBaudRate.to_string(), "set baud rate");
    }
}
