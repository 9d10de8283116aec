//! Launchpad discovery.
//!
//! Discovery picks the candidate ports of one board, opens a terminal on
//! each, sends the version probe and waits for the first reply under one
//! shared timeout. The winner is handed out as an open [`Terminal`] when its
//! firmware matches the expected release; every other terminal is closed.
//!
//! The state machine is driven with explicit time:
//!
//! ```rust,no_run
//! use std::time::Instant;
//! use lplink::{Discovery, DiscoveryConfig, DiscoveryEvent, NativePortEnumerator};
//!
//! let mut discovery = Discovery::new(NativePortEnumerator::default(), DiscoveryConfig::default());
//! discovery.start(Instant::now());
//! loop {
//!     for event in discovery.poll(Instant::now()) {
//!         match event {
//!             DiscoveryEvent::Resolved(terminal) => println!("found {}", terminal.port_name()),
//!             DiscoveryEvent::Failed(error) => eprintln!("{error}"),
//!             _ => {},
//!         }
//!     }
//! #   break;
//! }
//! ```

use std::{
    fmt,
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use log::{debug, info, warn};

use crate::{
    device::{self, Platform},
    error::{Error, Result},
    host::DevicePermissions,
    is_interrupted_requested,
    port::{PortEnumerator, PortInfo},
    protocol::app,
    terminal::{Terminal, TerminalEvent},
    timer::SingleShotTimer,
};

/// Default time the firmware gets to answer the version probe.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_millis(600);

/// Baud rate of the application protocol.
pub const APP_BAUD_RATE: u32 = 1_000_000;

/// Sleep between polls of the blocking drivers.
pub(crate) const POLL_INTERVAL: Duration = Duration::from_millis(2);

/// Discovery settings.
#[derive(Clone)]
pub struct DiscoveryConfig {
    /// Firmware release the host expects (compared on major.minor).
    pub expected_version: String,
    /// Shared probe timeout.
    pub timeout: Duration,
    /// Port naming rules for the tie-break between boards.
    pub platform: Platform,
    /// Probe only this port, regardless of its USB ids.
    pub port: Option<String>,
    /// Device permission check run before enumerating.
    pub permissions: Option<Arc<dyn DevicePermissions>>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            expected_version: app::FIRMWARE_VERSION.to_string(),
            timeout: DEFAULT_PROBE_TIMEOUT,
            platform: Platform::current(),
            port: None,
            permissions: None,
        }
    }
}

impl fmt::Debug for DiscoveryConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiscoveryConfig")
            .field("expected_version", &self.expected_version)
            .field("timeout", &self.timeout)
            .field("platform", &self.platform)
            .field("port", &self.port)
            .field("permissions", &self.permissions.is_some())
            .finish()
    }
}

impl DiscoveryConfig {
    /// Set the expected firmware release.
    #[must_use]
    pub fn with_expected_version(mut self, version: impl Into<String>) -> Self {
        self.expected_version = version.into();
        self
    }

    /// Set the probe timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the platform used for the tie-break between boards.
    #[must_use]
    pub fn with_platform(mut self, platform: Platform) -> Self {
        self.platform = platform;
        self
    }

    /// Probe only the named port.
    #[must_use]
    pub fn with_port(mut self, port: impl Into<String>) -> Self {
        self.port = Some(port.into());
        self
    }

    /// Check device permissions before enumerating.
    #[must_use]
    pub fn with_permissions(mut self, permissions: Arc<dyn DevicePermissions>) -> Self {
        self.permissions = Some(permissions);
        self
    }
}

/// Discovery progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryState {
    /// Not started.
    Idle,
    /// Looking for candidate ports.
    Enumerating,
    /// Waiting for a probe reply.
    Probing,
    /// A terminal was handed out.
    Resolved,
    /// Discovery ended with an error.
    Failed,
}

/// What discovery reports to its owner.
pub enum DiscoveryEvent<P: crate::port::Port> {
    /// Ports that are about to be probed.
    Candidates(Vec<PortInfo>),
    /// One candidate failed; the others keep going.
    PortError {
        /// Port name.
        port: String,
        /// What went wrong.
        error: Error,
    },
    /// The terminal with the right firmware, open at the application baud rate.
    Resolved(Terminal<P>),
    /// Discovery is over without a terminal.
    Failed(Error),
}

impl<P: crate::port::Port> fmt::Debug for DiscoveryEvent<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Candidates(ports) => f.debug_tuple("Candidates").field(ports).finish(),
            Self::PortError { port, error } => f
                .debug_struct("PortError")
                .field("port", port)
                .field("error", error)
                .finish(),
            Self::Resolved(terminal) => f
                .debug_tuple("Resolved")
                .field(&terminal.port_name())
                .finish(),
            Self::Failed(error) => f.debug_tuple("Failed").field(error).finish(),
        }
    }
}

struct Probe<P: crate::port::Port> {
    terminal: Terminal<P>,
    failed: bool,
}

/// Discovery state machine.
pub struct Discovery<E: PortEnumerator> {
    enumerator: E,
    config: DiscoveryConfig,
    state: DiscoveryState,
    probes: Vec<Probe<E::Port>>,
    failed_ports: Vec<String>,
    timer: SingleShotTimer,
    queued: Vec<DiscoveryEvent<E::Port>>,
}

impl<E: PortEnumerator> Discovery<E> {
    /// Create an idle discovery.
    pub fn new(enumerator: E, config: DiscoveryConfig) -> Self {
        Self {
            enumerator,
            config,
            state: DiscoveryState::Idle,
            probes: Vec::new(),
            failed_ports: Vec::new(),
            timer: SingleShotTimer::new(),
            queued: Vec::new(),
        }
    }

    /// Current state.
    pub fn state(&self) -> DiscoveryState {
        self.state
    }

    /// Settings in use.
    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    /// Enumerate, open the candidates and send the probes.
    ///
    /// Events produced here are delivered by the next [`poll`](Self::poll).
    pub fn start(&mut self, now: Instant) {
        self.reset();
        self.state = DiscoveryState::Enumerating;

        let candidates = match candidate_ports(&self.enumerator, &self.config) {
            Ok(candidates) => candidates,
            Err(e) => {
                self.fail(e);
                return;
            },
        };

        info!(
            "Probing {}",
            candidates
                .iter()
                .map(|p| p.name.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );
        self.queued
            .push(DiscoveryEvent::Candidates(candidates.clone()));

        self.state = DiscoveryState::Probing;
        self.timer.start(now, self.config.timeout);

        for info in &candidates {
            let mut terminal = Terminal::new(self.enumerator.create_port(info));
            if terminal.open() {
                let sent = terminal
                    .set_baud_rate(APP_BAUD_RATE)
                    .and_then(|()| terminal.write(&app::version_probe()));
                if let Err(e) = sent {
                    warn!("{}: probe not sent: {e}", info.name);
                    terminal.close();
                    self.failed_ports.push(info.name.clone());
                    self.queued.push(DiscoveryEvent::PortError {
                        port: info.name.clone(),
                        error: e,
                    });
                    self.probes.push(Probe {
                        terminal,
                        failed: true,
                    });
                    continue;
                }
            }
            // a failed open is reported by the terminal's first poll
            self.probes.push(Probe {
                terminal,
                failed: false,
            });
        }

        self.check_all_failed();
    }

    /// Close everything and start over.
    pub fn retry(&mut self, now: Instant) {
        debug!("Discovery retry");
        self.start(now);
    }

    /// Close all candidate terminals and return to idle.
    pub fn cancel(&mut self) {
        self.reset();
    }

    /// Advance the state machine.
    pub fn poll(&mut self, now: Instant) -> Vec<DiscoveryEvent<E::Port>> {
        let mut events = std::mem::take(&mut self.queued);
        if self.state != DiscoveryState::Probing {
            return events;
        }

        let mut winner = None;
        for (index, probe) in self.probes.iter_mut().enumerate() {
            if probe.failed {
                continue;
            }
            for event in probe.terminal.poll() {
                match event {
                    TerminalEvent::Reply(packet) => {
                        winner = Some((index, packet));
                        break;
                    },
                    TerminalEvent::Error(error) => {
                        let port = probe.terminal.port_name().to_string();
                        warn!("{port}: {error}");
                        probe.terminal.close();
                        probe.failed = true;
                        self.failed_ports.push(port.clone());
                        events.push(DiscoveryEvent::PortError { port, error });
                        break;
                    },
                    TerminalEvent::Ack => {},
                }
            }
            if winner.is_some() {
                break;
            }
        }

        if let Some((index, packet)) = winner {
            events.push(self.resolve(index, &packet));
            return events;
        }

        self.check_all_failed();
        if self.state == DiscoveryState::Probing && self.timer.expired(now) {
            info!("Probe timeout");
            self.fail(Error::NoFirmware);
        }

        events.append(&mut self.queued);
        events
    }

    /// Poll until discovery resolves or fails.
    ///
    /// `notify` sees [`DiscoveryEvent::Candidates`] and
    /// [`DiscoveryEvent::PortError`]. A discovery that is idle or already
    /// finished starts a new pass.
    pub fn run<F>(&mut self, mut notify: F) -> Result<Terminal<E::Port>>
    where
        F: FnMut(&DiscoveryEvent<E::Port>),
    {
        if self.state != DiscoveryState::Probing {
            self.start(Instant::now());
        }

        loop {
            if is_interrupted_requested() {
                self.cancel();
                return Err(Error::Interrupted);
            }

            for event in self.poll(Instant::now()) {
                match event {
                    DiscoveryEvent::Resolved(terminal) => return Ok(terminal),
                    DiscoveryEvent::Failed(error) => return Err(error),
                    other => notify(&other),
                }
            }

            thread::sleep(POLL_INTERVAL);
        }
    }

    fn resolve(&mut self, index: usize, packet: &[u8]) -> DiscoveryEvent<E::Port> {
        self.timer.stop();

        let mut probes = std::mem::take(&mut self.probes);
        let mut terminal = probes.swap_remove(index).terminal;
        for mut probe in probes {
            probe.terminal.close();
        }

        let actual = app::unpack_app(packet)
            .ok()
            .and_then(|reply| reply.firmware_version());
        match actual {
            Some(version) if app::same_release(&self.config.expected_version, &version) => {
                info!("Firmware {version} on {}", terminal.port_name());
                self.state = DiscoveryState::Resolved;
                DiscoveryEvent::Resolved(terminal)
            },
            actual => {
                let actual = actual.unwrap_or_else(|| "unknown".to_string());
                warn!("Firmware {actual} on {}", terminal.port_name());
                terminal.close();
                self.state = DiscoveryState::Failed;
                DiscoveryEvent::Failed(Error::VersionMismatch {
                    expected: app::release_of(&self.config.expected_version),
                    actual,
                })
            },
        }
    }

    fn check_all_failed(&mut self) {
        if self.state == DiscoveryState::Probing
            && !self.probes.is_empty()
            && self.probes.iter().all(|p| p.failed)
        {
            let ports = std::mem::take(&mut self.failed_ports);
            self.fail(Error::ProbeFailed { ports });
        }
    }

    fn fail(&mut self, error: Error) {
        debug!("Discovery failed: {error}");
        self.close_all();
        self.timer.stop();
        self.state = DiscoveryState::Failed;
        self.queued.push(DiscoveryEvent::Failed(error));
    }

    fn close_all(&mut self) {
        for probe in &mut self.probes {
            probe.terminal.close();
        }
    }

    fn reset(&mut self) {
        self.close_all();
        self.probes.clear();
        self.failed_ports.clear();
        self.queued.clear();
        self.timer.stop();
        self.state = DiscoveryState::Idle;
    }
}

/// Ports to probe or program: the explicit port if one is configured,
/// otherwise the Launchpad ports of one board.
pub(crate) fn candidate_ports<E: PortEnumerator>(
    enumerator: &E,
    config: &DiscoveryConfig,
) -> Result<Vec<PortInfo>> {
    if let Some(permissions) = &config.permissions {
        if permissions.rules_required() {
            return Err(Error::PermissionRulesMissing);
        }
    }

    let ports = enumerator.list_ports()?;

    if let Some(name) = &config.port {
        let info = ports
            .into_iter()
            .find(|p| p.name == *name || p.basename() == name)
            .unwrap_or_else(|| PortInfo::new(name.clone()));
        return Ok(vec![info]);
    }

    device::select_candidates(&ports, config.platform)
}
