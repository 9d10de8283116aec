//! Probe command implementation.

use anyhow::{Context, Result};
use console::style;
use log::{debug, warn};
use lplink::{
    Discovery, DiscoveryEvent, Error, NativePort, NativePortEnumerator, Session, Terminal,
    protocol::app,
};

use crate::{Cli, commands::spinner, config::Config, serial::with_port_choice};

/// Attach a hint on how to fix the setup to errors the user can act on.
pub(crate) fn with_hint(err: anyhow::Error) -> anyhow::Error {
    match err.downcast_ref::<Error>() {
        Some(Error::PermissionRulesMissing) => {
            err.context("the Launchpad udev rule is missing, run `sudo lplink rules --install`")
        },
        Some(Error::PermissionDenied { .. }) if cfg!(target_os = "linux") => {
            err.context("add yourself to the `dialout` group to use serial ports")
        },
        Some(Error::NoFirmware | Error::VersionMismatch { .. }) => {
            err.context("install the firmware with `lplink flash <firmware.bin>`")
        },
        _ => err,
    }
}

/// Find the Launchpad and return its terminal.
pub(crate) fn discover(
    cli: &Cli,
    config: &Config,
    timeout_ms: Option<u64>,
) -> Result<Terminal<NativePort>> {
    let pb = spinner(cli, "Looking for the Launchpad");

    let result = with_port_choice(cli.port.as_deref(), cli.non_interactive, |port| {
        let discovery_config = config.discovery_config(port, timeout_ms);
        debug!("{discovery_config:?}");
        let mut discovery = Discovery::new(NativePortEnumerator::default(), discovery_config);
        discovery.run(|event| match event {
            DiscoveryEvent::Candidates(ports) => {
                let names: Vec<&str> = ports.iter().map(|p| p.name.as_str()).collect();
                pb.set_message(format!("Probing {}", names.join(", ")));
            },
            DiscoveryEvent::PortError { port, error } => warn!("{port}: {error}"),
            _ => {},
        })
    });

    pb.finish_and_clear();
    result.map_err(with_hint)
}

/// Read the firmware version over an open terminal.
pub(crate) fn firmware_version(terminal: Terminal<NativePort>) -> Result<(String, String)> {
    let mut session = Session::new(terminal);
    let port = session.port_name().to_string();
    let reply = session
        .request(&app::version_probe())
        .with_context(|| format!("failed to read the firmware version on {port}"))?;
    session.close();

    let version = reply
        .firmware_version()
        .unwrap_or_else(|| "unknown".to_string());
    Ok((port, version))
}

/// Check the firmware running on the Launchpad.
pub(crate) fn cmd_probe(cli: &Cli, config: &Config, timeout_ms: Option<u64>) -> Result<()> {
    let terminal = discover(cli, config, timeout_ms)?;
    let (port, version) = firmware_version(terminal)?;

    if !cli.quiet {
        eprintln!(
            "{} Firmware {} on {}",
            style("✓").green(),
            style(&version).cyan().bold(),
            style(&port).cyan()
        );
    }
    println!("{port} {version}");
    Ok(())
}
