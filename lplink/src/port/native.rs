//! Native serial port implementation using the `serialport` crate.
//!
//! This module provides the serial port implementation for native platforms
//! (Linux, macOS, Windows, FreeBSD, etc.).

use {
    crate::{
        error::{Error, Result},
        port::{Port, PortEnumerator, PortInfo, SerialConfig},
    },
    log::{debug, trace},
    serialport::ClearBuffer,
    std::io::{self, Read, Write},
};

/// Native serial port implementation.
pub struct NativePort {
    port: Option<Box<dyn serialport::SerialPort>>,
    name: String,
    config: SerialConfig,
    baud_rate: u32,
}

impl NativePort {
    /// Create an unopened port.
    pub fn new(name: impl Into<String>, config: SerialConfig) -> Self {
        let baud_rate = config.baud_rate;
        Self {
            port: None,
            name: name.into(),
            config,
            baud_rate,
        }
    }

    fn serial_error(&self, err: serialport::Error) -> Error {
        match err.kind() {
            serialport::ErrorKind::NoDevice => Error::DeviceVanished {
                port: self.name.clone(),
            },
            serialport::ErrorKind::Io(kind) => self.io_error(io::Error::new(kind, err.description)),
            _ => Error::Transport {
                port: self.name.clone(),
                message: err.description,
            },
        }
    }

    fn io_error(&self, err: io::Error) -> Error {
        let port = self.name.clone();
        match err.kind() {
            io::ErrorKind::PermissionDenied => Error::PermissionDenied { port },
            // held open by another process
            io::ErrorKind::ResourceBusy => Error::Transport {
                port,
                message: format!("port is busy: {err}"),
            },
            io::ErrorKind::NotFound
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof => Error::DeviceVanished { port },
            _ => Error::Transport {
                port,
                message: err.to_string(),
            },
        }
    }

    fn port_mut(&mut self) -> Result<&mut Box<dyn serialport::SerialPort>> {
        self.port
            .as_mut()
            .ok_or(Error::NotConnected)
    }
}

impl Port for NativePort {
    fn name(&self) -> &str {
        &self.name
    }

    fn open(&mut self) -> Result<()> {
        if self.port.is_some() {
            return Ok(());
        }

        debug!("{}: open", self.name);
        let port = serialport::new(&self.name, self.baud_rate)
            .timeout(self.config.timeout)
            .open()
            .map_err(|e| self.serial_error(e))?;
        self.port = Some(port);
        Ok(())
    }

    fn close(&mut self) {
        // Take ownership of the port and let it drop (close)
        if self.port.take().is_some() {
            debug!("{}: close", self.name);
        }
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }

    fn set_baud_rate(&mut self, baud_rate: u32) -> Result<()> {
        trace!("{}: baud rate {baud_rate}", self.name);
        let result = match self.port.as_mut() {
            Some(p) => p.set_baud_rate(baud_rate),
            None => Ok(()),
        };
        result.map_err(|e| self.serial_error(e))?;
        self.baud_rate = baud_rate;
        Ok(())
    }

    fn baud_rate(&self) -> u32 {
        self.baud_rate
    }

    fn clear_buffers(&mut self) -> Result<()> {
        let result = self.port_mut()?.clear(ClearBuffer::All);
        result.map_err(|e| self.serial_error(e))
    }

    fn write(&mut self, data: &[u8]) -> Result<usize> {
        let port = self.port_mut()?;
        let result = port
            .write_all(data)
            .and_then(|()| port.flush());
        match result {
            Ok(()) => {
                trace!("{}: wrote {} bytes", self.name, data.len());
                Ok(data.len())
            },
            Err(e) => Err(self.io_error(e)),
        }
    }

    fn read_available(&mut self, buf: &mut Vec<u8>) -> Result<usize> {
        let pending = self.port_mut()?.bytes_to_read();
        let pending = match pending {
            Ok(n) => n as usize,
            Err(e) => return Err(self.serial_error(e)),
        };
        if pending == 0 {
            return Ok(0);
        }

        let start = buf.len();
        buf.resize(start + pending, 0);
        let result = self.port_mut()?.read(&mut buf[start..]);
        match result {
            Ok(n) => {
                buf.truncate(start + n);
                trace!("{}: read {n} bytes", self.name);
                Ok(n)
            },
            Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                buf.truncate(start);
                Ok(0)
            },
            Err(e) => {
                buf.truncate(start);
                Err(self.io_error(e))
            },
        }
    }
}

/// Native port enumerator.
#[derive(Debug, Clone, Default)]
pub struct NativePortEnumerator {
    config: SerialConfig,
}

impl NativePortEnumerator {
    /// Enumerator whose ports open with `config`.
    pub fn new(config: SerialConfig) -> Self {
        Self { config }
    }
}

impl PortEnumerator for NativePortEnumerator {
    type Port = NativePort;

    fn list_ports(&self) -> Result<Vec<PortInfo>> {
        let ports = serialport::available_ports().map_err(|e| Error::Transport {
            port: String::new(),
            message: e.description,
        })?;

        Ok(ports
            .into_iter()
            .map(|p| {
                let (vid, pid, manufacturer, product, serial_number) = match p.port_type {
                    serialport::SerialPortType::UsbPort(info) => (
                        Some(info.vid),
                        Some(info.pid),
                        info.manufacturer,
                        info.product,
                        info.serial_number,
                    ),
                    _ => (None, None, None, None, None),
                };

                trace!(
                    "Found port: {} (VID: {vid:04X?}, PID: {pid:04X?})",
                    p.port_name
                );

                PortInfo {
                    name: p.port_name,
                    vid,
                    pid,
                    manufacturer,
                    product,
                    serial_number,
                }
            })
            .collect())
    }

    fn create_port(&self, info: &PortInfo) -> NativePort {
        NativePort::new(&info.name, self.config.clone())
    }
}
