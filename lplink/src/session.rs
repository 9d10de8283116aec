//! Application protocol session over a resolved terminal.
//!
//! The firmware handles one command at a time, so a session keeps at most
//! one command outstanding and completes it with the next application reply.

use std::{
    thread,
    time::{Duration, Instant},
};

use log::{debug, trace, warn};

use crate::{
    discovery::POLL_INTERVAL,
    error::{Error, Result},
    is_interrupted_requested,
    port::Port,
    protocol::app::{self, AppPacket},
    terminal::{Terminal, TerminalEvent},
    timer::SingleShotTimer,
};

/// Default time the firmware gets to answer a command.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_millis(300);

/// What a session reports to its owner.
#[derive(Debug)]
pub enum SessionEvent {
    /// Reply to the outstanding command.
    Reply(AppPacket),
    /// The command failed, or the session was closed by a terminal error.
    Failed(Error),
}

/// Single-flight command channel to the Launchpad firmware.
pub struct Session<P: Port> {
    terminal: Terminal<P>,
    timeout: Duration,
    timer: SingleShotTimer,
    outstanding: Option<u8>,
    closed: bool,
}

impl<P: Port> Session<P> {
    /// Wrap an open terminal.
    pub fn new(mut terminal: Terminal<P>) -> Self {
        terminal.set_ack_mode(false);
        Self {
            terminal,
            timeout: DEFAULT_COMMAND_TIMEOUT,
            timer: SingleShotTimer::new(),
            outstanding: None,
            closed: false,
        }
    }

    /// Set the command timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Name of the port in use.
    pub fn port_name(&self) -> &str {
        self.terminal.port_name()
    }

    /// Whether a command waits for its reply.
    pub fn is_busy(&self) -> bool {
        self.outstanding.is_some()
    }

    /// Whether the session can still send.
    pub fn is_open(&self) -> bool {
        !self.closed && self.terminal.is_open()
    }

    /// Give the terminal back.
    pub fn into_terminal(self) -> Terminal<P> {
        self.terminal
    }

    /// Send a packed command.
    ///
    /// Returns `Ok(false)` without writing while another command is
    /// outstanding.
    pub fn send(&mut self, packet: &[u8], now: Instant) -> Result<bool> {
        if !self.is_open() {
            return Err(Error::NotConnected);
        }
        if let Some(cmd) = self.outstanding {
            debug!("{}: '{}' still outstanding", self.port_name(), cmd as char);
            return Ok(false);
        }

        if let Err(e) = self.terminal.write(packet) {
            self.close();
            return Err(e);
        }
        self.outstanding = Some(packet.get(1).copied().unwrap_or_default());
        self.timer.start(now, self.timeout);
        Ok(true)
    }

    /// Process received data and check the command timeout.
    pub fn poll(&mut self, now: Instant) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        if self.closed {
            return events;
        }

        for event in self.terminal.poll() {
            match event {
                TerminalEvent::Reply(packet) if packet.first() == Some(&app::MARKER) => {
                    events.push(self.complete(&packet, now));
                },
                TerminalEvent::Reply(packet) => {
                    trace!("{}: ignoring {} byte BSL reply", self.port_name(), packet.len());
                },
                TerminalEvent::Ack => {},
                TerminalEvent::Error(error) => {
                    warn!("{}: {error}", self.port_name());
                    self.close();
                    events.push(SessionEvent::Failed(error));
                    return events;
                },
            }
        }

        if let Some(cmd) = self.outstanding {
            if self.timer.expired(now) {
                self.outstanding = None;
                self.timer.stop();
                events.push(SessionEvent::Failed(Error::Timeout {
                    port: self.port_name().to_string(),
                    step: format!("command '{}'", cmd as char),
                }));
            }
        }
        events
    }

    /// Send a command and wait for its reply.
    pub fn request(&mut self, packet: &[u8]) -> Result<AppPacket> {
        if !self.send(packet, Instant::now())? {
            return Err(Error::UnexpectedResponse(
                "a command is already outstanding".to_string(),
            ));
        }

        loop {
            if is_interrupted_requested() {
                return Err(Error::Interrupted);
            }

            for event in self.poll(Instant::now()) {
                match event {
                    SessionEvent::Reply(reply) => return Ok(reply),
                    SessionEvent::Failed(error) => return Err(error),
                }
            }

            thread::sleep(POLL_INTERVAL);
        }
    }

    /// Close the terminal. Later sends fail with [`Error::NotConnected`].
    pub fn close(&mut self) {
        self.terminal.close();
        self.timer.stop();
        self.outstanding = None;
        self.closed = true;
    }

    fn complete(&mut self, packet: &[u8], now: Instant) -> SessionEvent {
        let in_time = self.timer.is_active(now);
        if self.outstanding.take().is_none() || !in_time {
            self.timer.stop();
            return SessionEvent::Failed(Error::UnexpectedResponse(format!(
                "reply with no command outstanding on {}",
                self.port_name()
            )));
        }
        self.timer.stop();

        match app::unpack_app(packet) {
            Ok(reply) => SessionEvent::Reply(reply),
            Err(error) => SessionEvent::Failed(error),
        }
    }
}
