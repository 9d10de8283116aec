//! lplink CLI - probe and flash the LP-MSPM0G3507 Launchpad.
//!
//! ## Features
//!
//! - List serial ports and mark Launchpads
//! - Check the firmware running on the Launchpad
//! - Flash firmware through the ROM bootstrap loader
//! - Check or install the Linux udev rule
//! - Shell completion generation
//! - Environment variable support

use {
    anyhow::Result,
    clap::{Parser, Subcommand},
    clap_complete::Shell,
    console::style,
    env_logger::Env,
    log::debug,
    std::{
        env,
        path::PathBuf,
        process::ExitCode,
        sync::atomic::{AtomicBool, Ordering},
    },
};

mod commands;
mod config;
mod serial;

use config::Config;

/// Whether stderr is a terminal (set once at startup).
static STDERR_IS_TTY: AtomicBool = AtomicBool::new(true);

/// Set by the Ctrl-C handler.
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Check if animations should be used (TTY and colors enabled).
pub(crate) fn use_fancy_output() -> bool {
    STDERR_IS_TTY.load(Ordering::Relaxed) && console::colors_enabled_stderr()
}

/// Whether Ctrl-C was pressed.
pub(crate) fn was_interrupted() -> bool {
    INTERRUPTED.load(Ordering::SeqCst)
}

/// Errors that map to dedicated exit codes.
#[derive(Debug, thiserror::Error)]
pub(crate) enum CliError {
    /// Bad invocation or missing setup (exit 2).
    #[error("{0}")]
    Usage(String),
    /// The user cancelled (exit 130).
    #[error("{0}")]
    Cancelled(String),
}

/// lplink - probe and flash the LP-MSPM0G3507 Launchpad.
///
/// Environment variables:
///   LPLINK_PORT              - Serial port to use
///   LPLINK_NON_INTERACTIVE   - Non-interactive mode (disable prompts)
///   LPLINK_CONFIG            - Path to a configuration file
#[derive(Parser)]
#[command(name = "lplink")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
#[command(after_help = "For more information, visit: https://github.com/lplink/lplink")]
pub(crate) struct Cli {
    /// Serial port to use (auto-detected if not specified).
    #[arg(short, long, global = true, env = "LPLINK_PORT")]
    pub(crate) port: Option<String>,

    /// Verbose output level (-v, -vv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub(crate) verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long, global = true)]
    pub(crate) quiet: bool,

    /// Non-interactive mode (fail instead of prompting).
    #[arg(long, global = true, env = "LPLINK_NON_INTERACTIVE")]
    pub(crate) non_interactive: bool,

    /// Path to a configuration file.
    #[arg(long = "config", global = true, value_name = "PATH", env = "LPLINK_CONFIG")]
    pub(crate) config_path: Option<PathBuf>,

    #[command(subcommand)]
    pub(crate) command: Commands,
}

/// Available commands.
#[derive(Subcommand)]
pub(crate) enum Commands {
    /// List serial ports and mark Launchpads.
    List {
        /// Output port list as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Check the firmware running on the Launchpad.
    Probe {
        /// Time the firmware gets to answer, in milliseconds.
        #[arg(long, env = "LPLINK_TIMEOUT_MS")]
        timeout_ms: Option<u64>,
    },

    /// Flash a firmware image through the bootstrap loader.
    Flash {
        /// Path to the raw firmware image (.bin).
        firmware: PathBuf,

        /// Skip probing the new firmware after flashing.
        #[arg(long)]
        no_verify: bool,
    },

    /// Check or install the Linux udev rule for the Launchpad.
    Rules {
        /// Write the rule file (needs root).
        #[arg(long)]
        install: bool,

        /// Location of the rule file.
        #[arg(long, value_name = "PATH", default_value = lplink::host::UDEV_RULES_PATH)]
        path: PathBuf,
    },

    /// Generate shell completion scripts.
    Completions {
        /// Shell type for completions.
        #[arg(value_enum)]
        shell: Shell,
    },
}

fn main() -> ExitCode {
    // --- NO_COLOR and TTY detection ---
    let stderr_is_tty = console::Term::stderr().is_term();
    STDERR_IS_TTY.store(stderr_is_tty, Ordering::Relaxed);

    if env::var("NO_COLOR").is_ok() || !stderr_is_tty {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    let cli = Cli::parse();

    // Setup logging based on verbosity
    let log_level = if cli.quiet {
        "warn"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_target(cli.verbose >= 2)
        .format_timestamp(if cli.verbose >= 2 {
            Some(env_logger::TimestampPrecision::Millis)
        } else {
            None
        })
        .init();

    debug!(
        "lplink v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );

    if let Err(e) = ctrlc::set_handler(|| INTERRUPTED.store(true, Ordering::SeqCst)) {
        debug!("Ctrl-C handler not installed: {e}");
    }
    lplink::set_interrupt_checker(was_interrupted);

    let config = if let Some(ref path) = cli.config_path {
        Config::load_from_path(path)
    } else {
        Config::load()
    };

    match run(&cli, &config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{} {err:#}", style("Error:").red().bold());
            ExitCode::from(exit_code(&err))
        },
    }
}

fn run(cli: &Cli, config: &Config) -> Result<()> {
    match &cli.command {
        Commands::List { json } => commands::list::cmd_list(cli, *json),
        Commands::Probe { timeout_ms } => commands::probe::cmd_probe(cli, config, *timeout_ms),
        Commands::Flash {
            firmware,
            no_verify,
        } => commands::flash::cmd_flash(cli, config, firmware, *no_verify),
        Commands::Rules { install, path } => commands::rules::cmd_rules(cli, *install, path),
        Commands::Completions { shell } => {
            commands::completions::cmd_completions(*shell);
            Ok(())
        },
    }
}

/// Map an error to the process exit code.
///
/// 2 for usage errors, 130 for cancellation, 1 for everything else.
fn exit_code(err: &anyhow::Error) -> u8 {
    if let Some(cli_err) = err.downcast_ref::<CliError>() {
        return match cli_err {
            CliError::Usage(_) => 2,
            CliError::Cancelled(_) => 130,
        };
    }
    match err.downcast_ref::<lplink::Error>() {
        Some(lplink::Error::Interrupted | lplink::Error::Cancelled { .. }) => 130,
        _ => 1,
    }
}
