//! Serial terminal that frames incoming bytes into packets.
//!
//! A [`Terminal`] owns one [`Port`] and turns the byte stream into
//! [`TerminalEvent`]s. Both wire formats share the framing rule "8 header
//! bytes, little-endian payload length at offset 2, then `length + 8` bytes
//! in total": application frames start with `L`, BSL replies with `00 08`.
//! In ack mode a lone zero byte is an acknowledgement instead.
//!
//! The terminal never calls back into its owner. Events are returned from
//! [`Terminal::poll`] and [`Terminal::feed`].

use std::{collections::VecDeque, fmt};

use byteorder::{ByteOrder, LittleEndian};
use log::{debug, trace, warn};

use crate::{
    error::{Error, Hex, MalformedPacket, Result},
    port::Port,
    protocol::{app, bsl},
};

/// Number of leading bytes kept in framing errors.
const ERROR_PREFIX_LEN: usize = 12;

/// Header size shared by both framings.
const HEADER_LEN: usize = 8;

/// Something the terminal observed.
#[derive(Debug)]
pub enum TerminalEvent {
    /// A lone zero byte in ack mode.
    Ack,
    /// A complete frame, header included.
    Reply(Vec<u8>),
    /// A framing or transport error.
    Error(Error),
}

/// One serial connection with its receive buffer.
pub struct Terminal<P: Port> {
    port: P,
    ack_mode: bool,
    buffer: Vec<u8>,
    pending: VecDeque<TerminalEvent>,
}

impl<P: Port> fmt::Debug for Terminal<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Terminal")
            .field("port", &self.port.name())
            .field("ack_mode", &self.ack_mode)
            .field("buffered", &self.buffer.len())
            .field("pending", &self.pending.len())
            .finish()
    }
}

impl<P: Port> Terminal<P> {
    /// Wrap an unopened port.
    pub fn new(port: P) -> Self {
        Self {
            port,
            ack_mode: false,
            buffer: Vec::new(),
            pending: VecDeque::new(),
        }
    }

    /// Name of the underlying port.
    pub fn port_name(&self) -> &str {
        self.port.name()
    }

    /// Whether the port is open.
    pub fn is_open(&self) -> bool {
        self.port.is_open()
    }

    /// Open the port and discard stale bytes.
    ///
    /// Returns `false` on failure. The reason is queued and delivered by the
    /// next [`poll`](Self::poll).
    pub fn open(&mut self) -> bool {
        if self.port.is_open() {
            return true;
        }

        let result = self.port.open().and_then(|()| {
            // Windows may keep bytes from an earlier session
            self.port.clear_buffers()
        });
        match result {
            Ok(()) => {
                debug!("{}: open successful", self.port_name());
                self.buffer.clear();
                true
            },
            Err(e) => {
                debug!("{}: open failed: {e}", self.port_name());
                self.port.close();
                self.pending.push_back(TerminalEvent::Error(e));
                false
            },
        }
    }

    /// Close the port and drop everything buffered or queued.
    pub fn close(&mut self) {
        if self.port.is_open() {
            debug!("{}: close", self.port_name());
        }
        self.port.close();
        self.buffer.clear();
        self.pending.clear();
    }

    /// Set the baud rate.
    pub fn set_baud_rate(&mut self, baud_rate: u32) -> Result<()> {
        self.port.set_baud_rate(baud_rate)
    }

    /// Current baud rate.
    pub fn baud_rate(&self) -> u32 {
        self.port.baud_rate()
    }

    /// Whether a lone zero byte is read as an acknowledgement.
    pub fn ack_mode(&self) -> bool {
        self.ack_mode
    }

    /// Select ack mode.
    pub fn set_ack_mode(&mut self, ack_mode: bool) {
        self.ack_mode = ack_mode;
    }

    /// Write a packet.
    pub fn write(&mut self, data: &[u8]) -> Result<usize> {
        if !self.port.is_open() {
            return Err(Error::NotConnected);
        }
        trace!("{}: write {}", self.port_name(), Hex(&data[..data.len().min(16)]));
        self.port.write(data)
    }

    /// Collect queued events and frame whatever bytes have arrived.
    pub fn poll(&mut self) -> Vec<TerminalEvent> {
        let mut events: Vec<TerminalEvent> = self.pending.drain(..).collect();
        if !self.port.is_open() {
            return events;
        }

        let mut incoming = Vec::new();
        match self.port.read_available(&mut incoming) {
            Ok(0) => {},
            Ok(_) => events.extend(self.feed(&incoming)),
            Err(e) => {
                warn!("{}: {e}", self.port_name());
                if matches!(e, Error::DeviceVanished { .. } | Error::Transport { .. }) {
                    self.close();
                }
                events.push(TerminalEvent::Error(e));
            },
        }
        events
    }

    /// Append received bytes and frame as many packets as possible.
    pub fn feed(&mut self, data: &[u8]) -> Vec<TerminalEvent> {
        self.buffer.extend_from_slice(data);

        let mut events = Vec::new();
        while !self.buffer.is_empty() {
            if !self.ack_mode && starts_frame(&self.buffer) {
                if self.buffer.len() < HEADER_LEN {
                    break;
                }
                let total = usize::from(LittleEndian::read_u16(&self.buffer[2..4])) + HEADER_LEN;
                if self.buffer.len() < total {
                    break;
                }

                let packet: Vec<u8> = self.buffer.drain(..total).collect();
                trace!("{}: reply of {} bytes", self.port_name(), packet.len());
                events.push(TerminalEvent::Reply(packet));

                if !self.buffer.is_empty() && !may_start_frame(&self.buffer) {
                    let rest = std::mem::take(&mut self.buffer);
                    events.push(TerminalEvent::Error(
                        MalformedPacket::Overlong {
                            len: rest.len(),
                            prefix: prefix(&rest),
                        }
                        .into(),
                    ));
                }
                continue;
            }

            if self.buffer[0] == bsl::ACK {
                if self.buffer.len() == 1 {
                    if self.ack_mode {
                        self.buffer.clear();
                        events.push(TerminalEvent::Ack);
                    }
                    // otherwise wait for the byte that decides
                    break;
                }
                if !self.ack_mode {
                    debug!("{}: dropping stray zero byte", self.port_name());
                    self.buffer.remove(0);
                    continue;
                }
            }

            let rest = std::mem::take(&mut self.buffer);
            events.push(TerminalEvent::Error(
                MalformedPacket::Invalid {
                    len: rest.len(),
                    prefix: prefix(&rest),
                }
                .into(),
            ));
        }
        events
    }
}

fn starts_frame(buffer: &[u8]) -> bool {
    match buffer {
        [app::MARKER, ..] => true,
        [bsl::ACK, bsl::REPLY_HEADER, ..] => true,
        _ => false,
    }
}

fn may_start_frame(buffer: &[u8]) -> bool {
    starts_frame(buffer) || buffer == [bsl::ACK]
}

fn prefix(data: &[u8]) -> Vec<u8> {
    data[..data.len().min(ERROR_PREFIX_LEN)].to_vec()
}
