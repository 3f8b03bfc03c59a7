//! espupload CLI - Upload firmware to ESP8266 WiFi modules.
//!
//! ## Features
//!
//! - Upload firmware, web-firmware and web-file images
//! - Hardware reset into the ROM loader over DTR/RTS
//! - Interactive serial port selection
//! - Shell completion generation
//! - Environment variable and config file support

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use console::style;
use env_logger::Env;
use espupload::{FinishAction, FlashParams, UploadTarget, target::is_supported_baud};
use log::debug;
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};

mod commands;
mod config;
mod serial;

use config::Config;
use serial::{SerialOptions, ask_remember_port, select_serial_port};

/// Whether stderr is a terminal (set once at startup).
static STDERR_IS_TTY: AtomicBool = AtomicBool::new(true);

/// Set by the Ctrl-C handler.
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Check if emoji/animations should be used (TTY and colors enabled).
fn use_fancy_output() -> bool {
    STDERR_IS_TTY.load(Ordering::Relaxed) && console::colors_enabled_stderr()
}

/// Whether Ctrl-C was pressed.
fn was_interrupted() -> bool {
    INTERRUPTED.load(Ordering::Relaxed)
}

/// Failures with a dedicated exit code.
#[derive(Debug, thiserror::Error)]
enum CliError {
    /// Bad invocation or missing setup; exit code 2.
    #[error("{0}")]
    Usage(String),
    /// Interrupted by the user; exit code 130.
    #[error("{0}")]
    Cancelled(String),
}

impl CliError {
    fn exit_code(&self) -> u8 {
        match self {
            Self::Usage(_) => 2,
            Self::Cancelled(_) => 130,
        }
    }
}

/// espupload - Upload firmware to ESP8266 WiFi modules over the ROM bootloader.
///
/// Environment variables:
///   ESPUPLOAD_PORT              - Default serial port
///   ESPUPLOAD_BAUD              - Upload baud rate (default: 115200)
///   ESPUPLOAD_NON_INTERACTIVE   - Non-interactive mode (disable prompts)
#[derive(Parser)]
#[command(name = "espupload")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Serial port to use (auto-detected if not specified).
    #[arg(short, long, global = true, env = "ESPUPLOAD_PORT")]
    port: Option<String>,

    /// Baud rate for the upload [default: 115200].
    #[arg(
        short,
        long,
        global = true,
        env = "ESPUPLOAD_BAUD",
        value_parser = parse_baud
    )]
    baud: Option<u32>,

    /// Verbose output level (-v, -vv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Non-interactive mode (fail instead of prompting).
    #[arg(long, global = true, env = "ESPUPLOAD_NON_INTERACTIVE")]
    non_interactive: bool,

    /// Path to a configuration file.
    #[arg(long = "config", global = true, value_name = "PATH")]
    config_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// What the image is.
#[derive(Clone, Copy, Debug, ValueEnum)]
enum Target {
    /// Application firmware at 0x000000.
    Firmware,
    /// Firmware bundling the web interface at 0x000000.
    WebFirmware,
    /// Web-files filesystem image at 0x100000.
    WebFiles,
}

impl From<Target> for UploadTarget {
    fn from(target: Target) -> Self {
        match target {
            Target::Firmware => UploadTarget::Firmware,
            Target::WebFirmware => UploadTarget::WebFirmware,
            Target::WebFiles => UploadTarget::WebFiles,
        }
    }
}

/// What to do after the last block.
#[derive(Clone, Copy, Debug, ValueEnum)]
enum Finish {
    /// Send nothing.
    Skip,
    /// End the flash session and stay in the loader.
    Stay,
    /// End the flash session and boot the new image.
    Reboot,
}

impl From<Finish> for FinishAction {
    fn from(finish: Finish) -> Self {
        match finish {
            Finish::Skip => FinishAction::Skip,
            Finish::Stay => FinishAction::Stay,
            Finish::Reboot => FinishAction::Reboot,
        }
    }
}

/// Available commands.
#[derive(Subcommand)]
enum Commands {
    /// Upload an image to the WiFi module.
    Upload {
        /// Image file (defaults to the target's standard file name).
        file: Option<PathBuf>,

        /// Kind of image being uploaded.
        #[arg(short, long, value_enum)]
        target: Option<Target>,

        /// Flash address override (hex, e.g. 0x100000).
        #[arg(short, long, value_parser = parse_hex_u32)]
        address: Option<u32>,

        /// Command sent after the last block.
        #[arg(long, value_enum)]
        finish: Option<Finish>,

        /// Leave the module in the loader instead of resetting it afterwards.
        #[arg(long)]
        no_reset: bool,

        /// Override flash mode/size bits of a bootable image (hex VALUE:MASK).
        #[arg(long, value_name = "VALUE:MASK", value_parser = parse_flash_params)]
        flash_params: Option<FlashParams>,
    },

    /// List available serial ports.
    ListPorts {
        /// Output in JSON format.
        #[arg(long)]
        json: bool,
    },

    /// Generate shell completion scripts.
    Completions {
        /// Shell type.
        #[arg(value_enum)]
        shell: Shell,
    },
}

/// Parse a hex address, with optional `0x` prefix and `_` separators.
fn parse_hex_u32(s: &str) -> Result<u32, String> {
    let digits = s
        .trim_start_matches("0x")
        .trim_start_matches("0X")
        .replace('_', "");
    u32::from_str_radix(&digits, 16).map_err(|e| format!("Invalid hex address '{s}': {e}"))
}

/// Accept only the rates the loader link supports.
fn parse_baud(s: &str) -> Result<u32, String> {
    let baud: u32 = s
        .parse()
        .map_err(|e| format!("Invalid baud rate '{s}': {e}"))?;
    if is_supported_baud(baud) {
        Ok(baud)
    } else {
        Err(format!(
            "Unsupported baud rate {baud} (supported: {})",
            supported_bauds()
        ))
    }
}

fn supported_bauds() -> String {
    espupload::UPLOAD_BAUD_RATES
        .iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

fn parse_flash_params(s: &str) -> Result<FlashParams, String> {
    s.parse::<FlashParams>().map_err(|e| e.to_string())
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let code = err
                .downcast_ref::<CliError>()
                .map_or(1, CliError::exit_code);
            eprintln!("{} {err:#}", style("Error:").red().bold());
            ExitCode::from(code)
        },
    }
}

fn run() -> Result<()> {
    let stderr_is_tty = console::Term::stderr().is_term();
    STDERR_IS_TTY.store(stderr_is_tty, Ordering::Relaxed);

    if env::var("NO_COLOR").is_ok() || !stderr_is_tty {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    let cli = Cli::parse();

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
        "espupload v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );

    if let Err(e) = ctrlc::set_handler(|| INTERRUPTED.store(true, Ordering::Relaxed)) {
        debug!("Could not install Ctrl-C handler: {e}");
    }
    espupload::set_interrupt_checker(was_interrupted);

    let mut config = if let Some(ref path) = cli.config_path {
        Config::load_from_path(path)
    } else {
        Config::load()
    };

    match &cli.command {
        Commands::Upload {
            file,
            target,
            address,
            finish,
            no_reset,
            flash_params,
        } => commands::upload::cmd_upload(
            &cli,
            &mut config,
            &commands::upload::UploadArgs {
                file: file.clone(),
                target: target.map(UploadTarget::from),
                address: *address,
                finish: finish.map(FinishAction::from),
                no_reset: *no_reset,
                flash_params: *flash_params,
            },
        ),
        Commands::ListPorts { json } => commands::ports::cmd_list_ports(*json),
        Commands::Completions { shell } => {
            commands::completions::cmd_completions(*shell);
            Ok(())
        },
    }
}

/// Resolve the upload baud rate from flags, env and config.
fn resolve_baud(cli: &Cli, config: &Config) -> Result<u32> {
    match cli.baud.or(config.serial.baud) {
        None => Ok(espupload::target::DEFAULT_UPLOAD_BAUD),
        Some(baud) if is_supported_baud(baud) => Ok(baud),
        Some(baud) => Err(CliError::Usage(format!(
            "Unsupported baud rate {baud} in config (supported: {})",
            supported_bauds()
        ))
        .into()),
    }
}

/// Get serial port from CLI args or interactive selection.
fn get_port(cli: &Cli, config: &mut Config) -> Result<String> {
    let options = SerialOptions {
        port: cli.port.clone(),
        non_interactive: cli.non_interactive,
    };

    let selected = select_serial_port(&options, config)?;

    if !selected.is_known && !cli.non_interactive && cli.port.is_none() {
        ask_remember_port(&selected.port, config)?;
    }

    Ok(selected.port.name)
}
