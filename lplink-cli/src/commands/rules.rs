//! Rules command implementation.

use anyhow::{Context, Result};
use console::style;
use lplink::{DevicePermissions, Error, UdevRules, host::UDEV_RULES_PATH};
use std::path::Path;

use crate::Cli;

/// Check or install the Launchpad udev rule.
pub(crate) fn cmd_rules(cli: &Cli, install: bool, path: &Path) -> Result<()> {
    if !cfg!(target_os = "linux") && path == Path::new(UDEV_RULES_PATH) {
        if !cli.quiet {
            eprintln!(
                "{} No udev rule needed on this platform",
                style("ℹ").blue()
            );
        }
        return Ok(());
    }

    let rules = UdevRules::new(path);

    if install {
        rules
            .install_rules()
            .with_context(|| format!("failed to write {} (root required)", path.display()))?;
        if !cli.quiet {
            eprintln!(
                "{} Installed {}",
                style("✓").green(),
                style(path.display()).yellow()
            );
            eprintln!(
                "Reload with: {}",
                style("sudo udevadm control --reload-rules && sudo udevadm trigger").cyan()
            );
        }
        return Ok(());
    }

    if rules.rules_required() {
        return Err(Error::PermissionRulesMissing).with_context(|| {
            format!(
                "{} is missing or outdated, run `sudo lplink rules --install`",
                path.display()
            )
        });
    }

    if !cli.quiet {
        eprintln!(
            "{} {} is up to date",
            style("✓").green(),
            style(path.display()).yellow()
        );
    }
    Ok(())
}
