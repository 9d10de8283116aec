//! Programming across all candidate ports of one board.
//!
//! A Launchpad exposes more than one CDC port and only one of them is wired
//! to the bootstrap loader. The programmer runs a [`BootstrapLoader`] on each
//! candidate at once; the first to succeed wins and the rest are cancelled.

use std::{sync::Arc, thread, time::Instant};

use log::{debug, info};

use super::{BootstrapLoader, LoaderConfig, LoaderEvent, Progress, Step};
use crate::{
    discovery::{self, DiscoveryConfig, POLL_INTERVAL},
    error::{Error, Result},
    is_interrupted_requested,
    port::{Port, PortEnumerator, PortInfo},
    terminal::Terminal,
};

/// What the programmer reports, tagged with the port it concerns.
#[derive(Debug)]
pub enum ProgrammerEvent {
    /// Progress of one session.
    Progress {
        /// Port name.
        port: String,
        /// Step that started.
        progress: Progress,
    },
    /// One session failed; the others keep going.
    PortFailed {
        /// Port name.
        port: String,
        /// What went wrong.
        error: Error,
    },
    /// The firmware was written through this port.
    Success {
        /// Port name.
        port: String,
    },
    /// Every session failed.
    Failed(Error),
}

/// Parallel bootstrap loader sessions.
pub struct Programmer<P: Port> {
    loaders: Vec<BootstrapLoader<P>>,
    started: bool,
    finished: bool,
    winner: Option<usize>,
    queued: Vec<ProgrammerEvent>,
}

impl<P: Port> Programmer<P> {
    /// One session per terminal, all writing the same image.
    pub fn new(terminals: Vec<Terminal<P>>, firmware: impl Into<Arc<[u8]>>, config: LoaderConfig) -> Self {
        let firmware: Arc<[u8]> = firmware.into();
        let loaders = terminals
            .into_iter()
            .map(|terminal| BootstrapLoader::new(terminal, Arc::clone(&firmware), config.clone()))
            .collect();
        Self {
            loaders,
            started: false,
            finished: false,
            winner: None,
            queued: Vec::new(),
        }
    }

    /// Sessions for the candidate ports the enumerator reports.
    ///
    /// Candidates are chosen the same way discovery chooses them.
    pub fn from_enumerator<E>(
        enumerator: &E,
        discovery: &DiscoveryConfig,
        firmware: impl Into<Arc<[u8]>>,
        config: LoaderConfig,
    ) -> Result<Self>
    where
        E: PortEnumerator<Port = P>,
    {
        let candidates = discovery::candidate_ports(enumerator, discovery)?;
        Ok(Self::from_ports(enumerator, &candidates, firmware, config))
    }

    /// Sessions for an explicit list of ports.
    pub fn from_ports<E>(
        enumerator: &E,
        ports: &[PortInfo],
        firmware: impl Into<Arc<[u8]>>,
        config: LoaderConfig,
    ) -> Self
    where
        E: PortEnumerator<Port = P>,
    {
        let terminals = ports
            .iter()
            .map(|info| Terminal::new(enumerator.create_port(info)))
            .collect();
        Self::new(terminals, firmware, config)
    }

    /// Names of the ports in use.
    pub fn ports(&self) -> Vec<&str> {
        self.loaders.iter().map(BootstrapLoader::port_name).collect()
    }

    /// Port that succeeded, if any.
    pub fn winner(&self) -> Option<&str> {
        self.winner.map(|index| self.loaders[index].port_name())
    }

    /// Whether programming is over.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Terminal of the winning session.
    pub fn into_terminal(mut self) -> Option<Terminal<P>> {
        let index = self.winner?;
        Some(self.loaders.swap_remove(index).into_terminal())
    }

    /// Start every session.
    pub fn start(&mut self, now: Instant) {
        if self.started {
            return;
        }
        self.started = true;

        if self.loaders.is_empty() {
            self.finish(Error::NoDeviceFound);
            return;
        }

        info!("Programming through {}", self.ports().join(", "));
        for loader in &mut self.loaders {
            loader.start(now);
        }
    }

    /// Cancel every running session.
    pub fn cancel(&mut self) {
        for loader in &mut self.loaders {
            loader.cancel();
        }
        self.finished = true;
    }

    /// Advance every session.
    pub fn poll(&mut self, now: Instant) -> Vec<ProgrammerEvent> {
        let mut events = std::mem::take(&mut self.queued);
        if self.finished || !self.started {
            return events;
        }

        for (index, loader) in self.loaders.iter_mut().enumerate() {
            for event in loader.poll(now) {
                let port = loader.port_name().to_string();
                match event {
                    LoaderEvent::Progress(progress) => {
                        events.push(ProgrammerEvent::Progress { port, progress });
                    },
                    LoaderEvent::Success => {
                        self.winner = Some(index);
                        events.push(ProgrammerEvent::Success { port });
                    },
                    LoaderEvent::Failed(error) => {
                        events.push(ProgrammerEvent::PortFailed { port, error });
                    },
                }
            }
            if self.winner.is_some() {
                break;
            }
        }

        if let Some(winner) = self.winner {
            for (index, loader) in self.loaders.iter_mut().enumerate() {
                if index != winner {
                    loader.cancel();
                    // the cancellation is not news to the owner
                    let _ = loader.poll(now);
                }
            }
            self.finished = true;
        } else if self.loaders.iter().all(|l| l.step() == Step::Failed) {
            self.finish(Error::ProgrammingFailed);
            events.append(&mut self.queued);
        }

        events
    }

    /// Poll until one session succeeds or all fail. Returns the winning port.
    pub fn run<F>(&mut self, mut notify: F) -> Result<String>
    where
        F: FnMut(&ProgrammerEvent),
    {
        self.start(Instant::now());

        loop {
            if is_interrupted_requested() {
                self.cancel();
                return Err(Error::Interrupted);
            }

            for event in self.poll(Instant::now()) {
                notify(&event);
                match event {
                    ProgrammerEvent::Success { port } => return Ok(port),
                    ProgrammerEvent::Failed(error) => return Err(error),
                    _ => {},
                }
            }

            if self.finished && self.winner.is_none() && self.queued.is_empty() {
                return Err(Error::ProgrammingFailed);
            }

            thread::sleep(POLL_INTERVAL);
        }
    }

    fn finish(&mut self, error: Error) {
        debug!("Programming failed: {error}");
        self.finished = true;
        self.queued.push(ProgrammerEvent::Failed(error));
    }
}
