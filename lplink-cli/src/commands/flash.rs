//! Flash command implementation.

use anyhow::{Context, Result};
use console::style;
use log::{debug, info};
use lplink::{BATCH_SIZE, Error, NativePortEnumerator, Programmer, ProgrammerEvent, Progress};
use std::{fs, path::Path, sync::Arc};

use crate::{
    Cli,
    commands::{
        probe::{discover, firmware_version, with_hint},
        progress_bar,
    },
    config::Config,
    serial::with_port_choice,
};

/// Read the image and reject files that cannot be flashed.
fn load_image(path: &Path) -> Result<Arc<[u8]>> {
    let image = fs::read(path).with_context(|| format!("failed to read firmware {}", path.display()))?;
    if image.is_empty() {
        return Err(Error::InvalidFirmware(format!("{} is empty", path.display())).into());
    }
    Ok(image.into())
}

/// Flash a firmware image through the bootstrap loader.
pub(crate) fn cmd_flash(cli: &Cli, config: &Config, firmware: &Path, no_verify: bool) -> Result<()> {
    if !cli.quiet {
        eprintln!(
            "{} Loading firmware {}",
            style("📦").cyan(),
            firmware.display()
        );
    }
    let image = load_image(firmware)?;
    let batches = image.len().div_ceil(BATCH_SIZE);
    if !cli.quiet {
        eprintln!(
            "{} {} bytes, {} batch(es)",
            style("ℹ").blue(),
            image.len(),
            batches
        );
    }

    let pb = progress_bar(cli, batches as u64);
    let result = with_port_choice(cli.port.as_deref(), cli.non_interactive, |port| {
        let discovery = config.discovery_config(port, None);
        let mut programmer = Programmer::from_enumerator(
            &NativePortEnumerator::default(),
            &discovery,
            Arc::clone(&image),
            config.loader_config(),
        )?;
        programmer.run(|event| match event {
            ProgrammerEvent::Progress {
                progress: Progress::Batch { index, .. },
                ..
            } => pb.set_position(*index as u64),
            ProgrammerEvent::Progress { port, progress } => {
                debug!("{port}: {progress}");
                pb.set_message(progress.to_string());
            },
            // The Launchpad port that does not reach the BSL always fails
            ProgrammerEvent::PortFailed { port, error } => debug!("{port}: {error}"),
            ProgrammerEvent::Success { .. } | ProgrammerEvent::Failed(_) => {},
        })
    });

    let port = match result {
        Ok(port) => port,
        Err(err) => {
            pb.abandon();
            return Err(with_hint(err));
        },
    };
    pb.finish_with_message("done");
    info!("Firmware written through {port}");

    if !cli.quiet {
        eprintln!(
            "{} Firmware written through {}",
            style("✓").green(),
            style(&port).cyan()
        );
    }

    if no_verify {
        return Ok(());
    }

    let terminal = discover(cli, config, None).context("the new firmware does not answer")?;
    let (port, version) = firmware_version(terminal)?;
    if !cli.quiet {
        eprintln!(
            "\n{} Firmware {} running on {}",
            style("🎉").green().bold(),
            style(&version).cyan().bold(),
            style(&port).cyan()
        );
    }
    Ok(())
}
