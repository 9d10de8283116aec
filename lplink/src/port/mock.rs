//! In-memory ports for tests.
//!
//! A [`MockPort`] and its [`MockHandle`] share one state. The port goes to the
//! code under test, the handle stays with the test to feed incoming bytes,
//! inspect what was written and inject failures. An optional responder plays
//! the device: it sees every written packet and returns the bytes the device
//! would send back.

use std::sync::{Arc, Mutex, MutexGuard};

use crate::{
    error::{Error, Result},
    port::{Port, PortEnumerator, PortInfo},
};

/// Device simulation: written packet and current baud rate in, reply out.
pub(crate) type Responder = Box<dyn FnMut(&[u8], u32) -> Vec<u8> + Send>;

/// Failure classes a mock port can be told to report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Failure {
    PermissionDenied,
    Vanished,
    Transport,
}

impl Failure {
    fn error(self, port: &str) -> Error {
        let port = port.to_string();
        match self {
            Self::PermissionDenied => Error::PermissionDenied { port },
            Self::Vanished => Error::DeviceVanished { port },
            Self::Transport => Error::Transport {
                port,
                message: "mock failure".to_string(),
            },
        }
    }
}

#[derive(Default)]
struct State {
    open: bool,
    open_count: usize,
    clear_count: usize,
    baud_rate: u32,
    baud_rates: Vec<u32>,
    incoming: Vec<u8>,
    written: Vec<Vec<u8>>,
    open_failure: Option<Failure>,
    read_failure: Option<Failure>,
    responder: Option<Responder>,
}

/// Test side of a mock port.
#[derive(Clone, Default)]
pub(crate) struct MockHandle {
    state: Arc<Mutex<State>>,
}

impl MockHandle {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    /// Make bytes available to the next read.
    pub(crate) fn push_incoming(&self, data: &[u8]) {
        self.lock().incoming.extend_from_slice(data);
    }

    /// Every packet written so far.
    pub(crate) fn written(&self) -> Vec<Vec<u8>> {
        self.lock().written.clone()
    }

    /// Every baud rate set so far, in order.
    pub(crate) fn baud_rates(&self) -> Vec<u32> {
        self.lock().baud_rates.clone()
    }

    pub(crate) fn is_open(&self) -> bool {
        self.lock().open
    }

    pub(crate) fn open_count(&self) -> usize {
        self.lock().open_count
    }

    pub(crate) fn clear_count(&self) -> usize {
        self.lock().clear_count
    }

    pub(crate) fn fail_open(&self, failure: Failure) {
        self.lock().open_failure = Some(failure);
    }

    pub(crate) fn fail_read(&self, failure: Failure) {
        self.lock().read_failure = Some(failure);
    }

    /// Install a device simulation.
    pub(crate) fn respond_with<F>(&self, responder: F)
    where
        F: FnMut(&[u8], u32) -> Vec<u8> + Send + 'static,
    {
        self.lock().responder = Some(Box::new(responder));
    }
}

/// Code side of a mock port.
pub(crate) struct MockPort {
    name: String,
    handle: MockHandle,
}

impl MockPort {
    pub(crate) fn new(name: impl Into<String>) -> (Self, MockHandle) {
        let handle = MockHandle::default();
        let port = Self {
            name: name.into(),
            handle: handle.clone(),
        };
        (port, handle)
    }

    fn with_handle(name: &str, handle: &MockHandle) -> Self {
        Self {
            name: name.to_string(),
            handle: handle.clone(),
        }
    }
}

impl Port for MockPort {
    fn name(&self) -> &str {
        &self.name
    }

    fn open(&mut self) -> Result<()> {
        let mut state = self.handle.lock();
        if let Some(failure) = state.open_failure {
            return Err(failure.error(&self.name));
        }
        state.open = true;
        state.open_count += 1;
        Ok(())
    }

    fn close(&mut self) {
        self.handle.lock().open = false;
    }

    fn is_open(&self) -> bool {
        self.handle.lock().open
    }

    fn set_baud_rate(&mut self, baud_rate: u32) -> Result<()> {
        let mut state = self.handle.lock();
        state.baud_rate = baud_rate;
        state.baud_rates.push(baud_rate);
        Ok(())
    }

    fn baud_rate(&self) -> u32 {
        self.handle.lock().baud_rate
    }

    fn clear_buffers(&mut self) -> Result<()> {
        let mut state = self.handle.lock();
        state.clear_count += 1;
        state.incoming.clear();
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> Result<usize> {
        let mut state = self.handle.lock();
        if !state.open {
            return Err(Error::NotConnected);
        }
        state.written.push(data.to_vec());

        let baud_rate = state.baud_rate;
        if let Some(mut responder) = state.responder.take() {
            let reply = responder(data, baud_rate);
            state.incoming.extend_from_slice(&reply);
            state.responder = Some(responder);
        }
        Ok(data.len())
    }

    fn read_available(&mut self, buf: &mut Vec<u8>) -> Result<usize> {
        let mut state = self.handle.lock();
        if !state.open {
            return Err(Error::NotConnected);
        }
        if let Some(failure) = state.read_failure.take() {
            return Err(failure.error(&self.name));
        }
        let n = state.incoming.len();
        buf.append(&mut state.incoming);
        Ok(n)
    }
}

/// Enumerator over a fixed set of mock ports.
#[derive(Default)]
pub(crate) struct MockEnumerator {
    ports: Vec<(PortInfo, MockHandle)>,
    list_failure: bool,
}

impl MockEnumerator {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Add a port and return its handle.
    pub(crate) fn add(&mut self, info: PortInfo) -> MockHandle {
        let handle = MockHandle::default();
        self.ports.push((info, handle.clone()));
        handle
    }

    /// Add a Launchpad port.
    pub(crate) fn add_launchpad(&mut self, name: &str) -> MockHandle {
        self.add(PortInfo::new(name).with_usb(0x0451, 0xBEF3))
    }

    pub(crate) fn fail_listing(&mut self) {
        self.list_failure = true;
    }
}

impl PortEnumerator for MockEnumerator {
    type Port = MockPort;

    fn list_ports(&self) -> Result<Vec<PortInfo>> {
        if self.list_failure {
            return Err(Failure::Transport.error(""));
        }
        Ok(self.ports.iter().map(|(info, _)| info.clone()).collect())
    }

    fn create_port(&self, info: &PortInfo) -> MockPort {
        match self.ports.iter().find(|(known, _)| known.name == info.name) {
            Some((_, handle)) => MockPort::with_handle(&info.name, handle),
            None => {
                let (port, handle) = MockPort::new(&info.name);
                handle.fail_open(Failure::Vanished);
                port
            },
        }
    }
}
