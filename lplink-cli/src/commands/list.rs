//! List command implementation.

use anyhow::{Context, Result};
use console::style;
use lplink::{DeviceKind, Error, Platform, PortInfo, device};

use crate::Cli;

/// JSON entry for one port.
fn port_json(port: &PortInfo) -> Result<serde_json::Value> {
    let kind = DeviceKind::of(port);
    let mut value = serde_json::to_value(port)?;
    value["device"] = if kind.is_known() {
        serde_json::Value::from(kind.name())
    } else {
        serde_json::Value::Null
    };
    value["launchpad"] = serde_json::Value::from(kind.is_supported());
    Ok(value)
}

/// List serial ports and point out the Launchpad.
pub(crate) fn cmd_list(cli: &Cli, json: bool) -> Result<()> {
    let ports = lplink::list_ports().context("failed to list serial ports")?;

    if json {
        let entries = ports
            .iter()
            .map(port_json)
            .collect::<Result<Vec<_>>>()?;
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    eprintln!("{}", style("Serial ports").bold().underlined());

    if ports.is_empty() {
        eprintln!("  {}", style("No serial ports found").dim());
        return Ok(());
    }

    for (port, line) in ports.iter().zip(device::format_port_list(&ports)) {
        let bullet = if DeviceKind::of(port).is_supported() {
            style("•").green()
        } else {
            style("•").dim()
        };
        eprintln!("  {bullet} {line}");
    }

    if cli.quiet {
        return Ok(());
    }

    match device::select_candidates(&ports, Platform::current()) {
        Ok(candidates) => {
            let names: Vec<&str> = candidates.iter().map(|p| p.name.as_str()).collect();
            eprintln!(
                "\n{} Launchpad on {}",
                style("→").green().bold(),
                style(names.join(", ")).cyan().bold()
            );
        },
        Err(Error::AmbiguousDevices { .. }) => {
            eprintln!(
                "\n{} Multiple Launchpads found, select one with --port",
                style("⚠").yellow()
            );
        },
        Err(e) => eprintln!("\n{} {e}", style("ℹ").blue()),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_json_marks_launchpad() {
        let port = PortInfo::new("/dev/ttyACM0")
            .with_usb(0x0451, 0xBEF3)
            .with_serial_number("MG350001");
        let value = port_json(&port).unwrap();
        assert_eq!(value["name"], "/dev/ttyACM0");
        assert_eq!(value["device"], "LP-MSPM0G3507");
        assert_eq!(value["launchpad"], true);
        assert_eq!(value["serial_number"], "MG350001");
    }

    #[test]
    fn test_port_json_unknown_device() {
        let value = port_json(&PortInfo::new("/dev/ttyS0")).unwrap();
        assert!(value["device"].is_null());
        assert_eq!(value["launchpad"], false);
    }
}
