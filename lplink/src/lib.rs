//! # lplink
//!
//! Host-side link to the TI LP-MSPM0G3507 Launchpad.
//!
//! This crate finds the Launchpad among the serial ports, checks the firmware
//! running on it and reprograms it through the ROM bootstrap loader (BSL)
//! when the firmware is missing or outdated:
//!
//! - Application and BSL packet codecs with their CRC-32
//! - A terminal that frames the serial byte stream into acks and replies
//! - Discovery: probe every candidate port, first valid reply wins
//! - Bootstrap loader: connect, unlock, erase, write in batches, restart
//! - A single-flight application protocol session
//!
//! All state machines are driven with explicit time (`start(now)`,
//! `poll(now)`), and each also has a blocking `run`/`request` helper.
//!
//! ## Features
//!
//! - `native` (default): serial ports via the `serialport` crate
//! - `serde`: serialization support for data types
//!
//! ## Example
//!
//! ```rust,no_run
//! use lplink::{Discovery, DiscoveryConfig, Error, LoaderConfig, NativePortEnumerator, Programmer};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = DiscoveryConfig::default();
//!     let mut discovery = Discovery::new(NativePortEnumerator::default(), config.clone());
//!
//!     match discovery.run(|_| {}) {
//!         Ok(terminal) => println!("firmware ok on {}", terminal.port_name()),
//!         Err(Error::VersionMismatch { .. } | Error::NoFirmware) => {
//!             let image = std::fs::read("firmware.bin")?;
//!             let mut programmer = Programmer::from_enumerator(
//!                 &NativePortEnumerator::default(),
//!                 &config,
//!                 image,
//!                 LoaderConfig::default(),
//!             )?;
//!             let port = programmer.run(|event| println!("{event:?}"))?;
//!             println!("programmed through {port}");
//!         },
//!         Err(e) => return Err(e.into()),
//!     }
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::sync::{Arc, OnceLock};

pub mod device;
pub mod discovery;
pub mod error;
pub mod host;
pub mod loader;
pub mod port;
pub mod protocol;
pub mod session;
pub mod terminal;
pub mod timer;

static INTERRUPT_CHECKER: OnceLock<Arc<dyn Fn() -> bool + Send + Sync>> = OnceLock::new();

/// Register a global interruption checker used by the blocking drivers.
///
/// The checker should return `true` when the current operation should stop
/// (for example after receiving Ctrl-C in CLI applications).
pub fn set_interrupt_checker<F>(checker: F)
where
    F: Fn() -> bool + Send + Sync + 'static,
{
    let _ = INTERRUPT_CHECKER.set(Arc::new(checker));
}

/// Returns whether interruption was requested by the embedding application.
#[must_use]
pub fn is_interrupted_requested() -> bool {
    INTERRUPT_CHECKER
        .get()
        .is_some_and(|checker| checker())
}

#[cfg(test)]
pub(crate) fn test_set_interrupted(value: bool) {
    use std::sync::atomic::{AtomicBool, Ordering};

    static TEST_INTERRUPT_FLAG: OnceLock<Arc<AtomicBool>> = OnceLock::new();

    let flag = TEST_INTERRUPT_FLAG
        .get_or_init(|| {
            let shared = Arc::new(AtomicBool::new(false));
            let checker = Arc::clone(&shared);
            set_interrupt_checker(move || checker.load(Ordering::Relaxed));
            shared
        })
        .clone();

    flag.store(value, Ordering::Relaxed);
}

// Re-exports for convenience
#[cfg(feature = "native")]
pub use port::{NativePort, NativePortEnumerator};
pub use {
    device::{DeviceKind, Platform},
    discovery::{Discovery, DiscoveryConfig, DiscoveryEvent, DiscoveryState},
    error::{Error, MalformedPacket, Result},
    host::{DevicePermissions, NoPermissions, UdevRules, list_ports, platform_permissions},
    loader::{
        BATCH_SIZE, BootstrapLoader, LoaderConfig, LoaderEvent, Progress, Step,
        programmer::{Programmer, ProgrammerEvent},
    },
    port::{Port, PortEnumerator, PortInfo, SerialConfig},
    protocol::{
        app::AppPacket,
        bsl::{BaudRate, DeviceInfo},
    },
    session::{Session, SessionEvent},
    terminal::{Terminal, TerminalEvent},
};
