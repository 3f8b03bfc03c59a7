//! Choosing which serial port to upload through.
//!
//! Order of preference:
//! - an explicit `--port` / `ESPUPLOAD_PORT`
//! - the port stored in the configuration
//! - the only detected candidate, or an interactive choice among several
//!
//! Non-interactive mode never prompts and fails on ambiguity.

use {
    crate::{CliError, config::Config},
    anyhow::Result,
    console::{Term, style},
    dialoguer::{Confirm, Select, theme::ColorfulTheme},
    espupload::{DetectedPort, DeviceKind, device::select_port, discover_ports},
    log::{debug, info, warn},
    std::io::{ErrorKind, IsTerminal},
};

const NO_CANDIDATES: &str = "No serial ports found; connect the module or pass --port";
const AMBIGUOUS: &str = "Found multiple serial ports; pass --port to choose one";

/// What the caller already knows about the port.
#[derive(Debug, Clone, Default)]
pub struct SerialOptions {
    /// Port named on the command line or in the environment.
    pub port: Option<String>,
    /// Fail instead of prompting.
    pub non_interactive: bool,
}

/// The chosen port.
#[derive(Debug)]
pub struct SelectedPort {
    /// Port as enumerated, or a bare name.
    pub port: DetectedPort,
    /// Built-in bridge or one the user asked us to remember.
    pub is_known: bool,
}

impl SelectedPort {
    fn new(port: DetectedPort, config: &Config) -> Self {
        let is_known = is_known_device(&port, config);
        Self { port, is_known }
    }
}

fn usage_err(message: &str) -> anyhow::Error {
    CliError::Usage(message.to_string()).into()
}

fn cancelled() -> anyhow::Error {
    CliError::Cancelled("Port selection cancelled".to_string()).into()
}

/// Pick the port for this run, prompting only when allowed and needed.
pub fn select_serial_port(options: &SerialOptions, config: &Config) -> Result<SelectedPort> {
    let requested = options.port.as_deref().or(config.serial.port.as_deref());
    if let Some(name) = requested {
        debug!("Using requested port {name}");
        return Ok(lookup_port(name, config));
    }

    let mut candidates = prefer_known(discover_ports(), config);

    if options.non_interactive {
        return only_candidate(candidates, config);
    }

    match candidates.len() {
        0 => Err(usage_err(NO_CANDIDATES)),
        1 if is_known_device(&candidates[0], config) => {
            let selected = only_candidate(candidates, config)?;
            info!(
                "Auto-selected port: {} [{}]",
                selected.port.name,
                selected.port.device.name()
            );
            Ok(selected)
        },
        1 => {
            require_terminal()?;
            confirm_port(candidates.remove(0))
        },
        _ => {
            require_terminal()?;
            choose_port(candidates, config)
        },
    }
}

/// Narrow to known bridges when any are present.
fn prefer_known(ports: Vec<DetectedPort>, config: &Config) -> Vec<DetectedPort> {
    let (known, other): (Vec<_>, Vec<_>) = ports
        .into_iter()
        .partition(|p| is_known_device(p, config));
    if known.is_empty() { other } else { known }
}

fn only_candidate(candidates: Vec<DetectedPort>, config: &Config) -> Result<SelectedPort> {
    let mut iter = candidates.into_iter();
    match (iter.next(), iter.next()) {
        (Some(port), None) => Ok(SelectedPort::new(port, config)),
        (Some(_), Some(_)) => Err(usage_err(AMBIGUOUS)),
        (None, _) => Err(usage_err(NO_CANDIDATES)),
    }
}

fn require_terminal() -> Result<()> {
    if std::io::stdin().is_terminal() && std::io::stderr().is_terminal() {
        return Ok(());
    }
    Err(usage_err(
        "Port selection needs a terminal; pass --port or --non-interactive",
    ))
}

fn prompt_failed(err: dialoguer::Error) -> anyhow::Error {
    let dialoguer::Error::IO(io_err) = err;
    if io_err.kind() == ErrorKind::Interrupted {
        cancelled()
    } else {
        usage_err("Port selection prompt failed")
    }
}

/// Resolve a user-supplied name against the enumerated ports.
///
/// Names the host does not enumerate (symlinks, pseudo terminals) are
/// still accepted as-is.
fn lookup_port(name: &str, config: &Config) -> SelectedPort {
    let ports = discover_ports();
    let exact = ports.iter().position(|p| p.name == name);
    let found = exact.or_else(|| ports.iter().position(|p| p.name.eq_ignore_ascii_case(name)));

    match found {
        Some(index) => SelectedPort::new(ports[index].clone(), config),
        None => SelectedPort {
            port: DetectedPort {
                name: name.to_string(),
                device: DeviceKind::Unknown,
                vid: None,
                pid: None,
                manufacturer: None,
                product: None,
                serial: None,
            },
            is_known: false,
        },
    }
}

fn is_known_device(port: &DetectedPort, config: &Config) -> bool {
    port.device.is_known()
        || matches!((port.vid, port.pid), (Some(vid), Some(pid)) if config.serial.is_known(vid, pid))
}

fn port_label(port: &DetectedPort, config: &Config) -> String {
    let mut label = if is_known_device(port, config) {
        style(&port.name).bold().to_string()
    } else {
        port.name.clone()
    };

    if port.device.is_known() {
        label.push_str(&format!(" [{}]", style(port.device.name()).yellow()));
    } else if let (Some(vid), Some(pid)) = (port.vid, port.pid) {
        label.push_str(&format!(" ({vid:04X}:{pid:04X})"));
    }
    if let Some(product) = &port.product {
        label.push_str(&format!(" - {}", style(product).dim()));
    }
    label
}

fn choose_port(mut ports: Vec<DetectedPort>, config: &Config) -> Result<SelectedPort> {
    eprintln!("{} {} serial ports detected", style("ℹ").blue(), ports.len());

    ports.sort_by_key(|p| !is_known_device(p, config));
    let suggested = select_port(&ports)
        .and_then(|best| ports.iter().position(|p| p.name == best.name))
        .unwrap_or(0);

    let width = usize::from(Term::stderr().size().1).saturating_sub(4);
    let labels: Vec<String> = ports
        .iter()
        .map(|p| console::truncate_str(&port_label(p, config), width, "\u{2026}").into_owned())
        .collect();

    let choice = Select::with_theme(&ColorfulTheme::default())
        .with_prompt("Select the port the WiFi module is on")
        .items(&labels)
        .default(suggested)
        .interact_opt()
        .map_err(prompt_failed)?
        .ok_or_else(cancelled)?;

    if choice >= ports.len() {
        anyhow::bail!("Port index {choice} out of range");
    }
    Ok(SelectedPort::new(ports.swap_remove(choice), config))
}

fn confirm_port(port: DetectedPort) -> Result<SelectedPort> {
    let prompt = match &port.product {
        Some(product) => format!("Use {} - {product}?", port.name),
        None => format!("Use {}?", port.name),
    };

    let accepted = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .default(true)
        .interact_opt()
        .map_err(prompt_failed)?
        .unwrap_or(false);

    if !accepted {
        return Err(cancelled());
    }
    Ok(SelectedPort {
        port,
        is_known: false,
    })
}

/// Offer to remember the port's USB bridge for automatic selection later.
pub fn ask_remember_port(port: &DetectedPort, config: &mut Config) -> Result<()> {
    let (Some(vid), Some(pid)) = (port.vid, port.pid) else {
        return Ok(());
    };
    if config.serial.is_known(vid, pid) {
        return Ok(());
    }

    let remember = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt("Remember this USB device for next time?")
        .default(false)
        .interact_opt()
        .map_err(prompt_failed)?
        == Some(true);

    if remember {
        if let Err(e) = config.remember_usb_device(vid, pid) {
            warn!("Could not save USB device {vid:04X}:{pid:04X}: {e}");
        }
    }
    Ok(())
}
