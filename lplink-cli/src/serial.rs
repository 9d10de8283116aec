//! Port choice when several Launchpads are attached.
//!
//! Discovery refuses to guess between boards on platforms without stable
//! port numbering. The CLI then asks the user, or fails with a usage error
//! in non-interactive mode.

use {
    crate::CliError,
    anyhow::Result,
    dialoguer::{Error as DialoguerError, Select, theme::ColorfulTheme},
    log::info,
    std::io::IsTerminal,
};

fn usage_err(message: String) -> anyhow::Error {
    // Usage class maps to exit code 2 so scripts can tell setup problems
    // from device failures.
    CliError::Usage(message).into()
}

/// Run `attempt`, and once more with a user-chosen port when it reports
/// several boards.
pub fn with_port_choice<T, F>(port: Option<&str>, non_interactive: bool, mut attempt: F) -> Result<T>
where
    F: FnMut(Option<&str>) -> lplink::Result<T>,
{
    match attempt(port) {
        Err(lplink::Error::AmbiguousDevices { ports }) => {
            let chosen = choose_port(&ports, non_interactive)?;
            info!("Using {chosen}");
            Ok(attempt(Some(&chosen))?)
        },
        other => Ok(other?),
    }
}

/// Ask which of `ports` to use.
pub fn choose_port(ports: &[String], non_interactive: bool) -> Result<String> {
    if non_interactive {
        return Err(usage_err(format!(
            "multiple Launchpads found ({}), select one with --port",
            ports.join(", ")
        )));
    }
    ensure_interactive_terminal()?;

    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt("Multiple Launchpads found, select a port")
        .items(ports)
        .default(0)
        .interact_opt()
        .map_err(map_prompt_error)?;

    match selection {
        Some(index) => Ok(ports[index].clone()),
        None => Err(CliError::Cancelled("port selection cancelled".to_string()).into()),
    }
}

fn ensure_interactive_terminal() -> Result<()> {
    if std::io::stdin().is_terminal() && std::io::stderr().is_terminal() {
        Ok(())
    } else {
        Err(usage_err(
            "port selection needs a terminal, use --port or --non-interactive".to_string(),
        ))
    }
}

fn map_prompt_error(err: DialoguerError) -> anyhow::Error {
    match err {
        DialoguerError::IO(io_err) => {
            if io_err.kind() == std::io::ErrorKind::Interrupted {
                CliError::Cancelled("port selection cancelled".to_string()).into()
            } else {
                usage_err(format!("port prompt failed: {io_err}"))
            }
        },
    }
}
