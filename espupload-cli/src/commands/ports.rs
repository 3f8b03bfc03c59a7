//! Serial port listing.

use anyhow::Result;
use console::style;
use espupload::{
    device::{format_port_list, select_port},
    discover_ports,
};

/// List-ports command implementation.
pub(crate) fn cmd_list_ports(json: bool) -> Result<()> {
    let ports = discover_ports();

    if json {
        println!("{}", serde_json::to_string_pretty(&ports)?);
        return Ok(());
    }

    if ports.is_empty() {
        eprintln!("{} No serial ports found", style("⚠").yellow());
        return Ok(());
    }

    let preferred = select_port(&ports).map(|p| p.name.clone());
    for (port, line) in ports.iter().zip(format_port_list(&ports)) {
        let marker = if preferred.as_deref() == Some(port.name.as_str()) {
            style("*").green().bold()
        } else {
            style(" ")
        };
        let line = if port.is_likely_module() {
            style(line).bold().to_string()
        } else {
            line
        };
        println!("{marker} {line}");
    }
    eprintln!(
        "{}",
        style("* marks the port used when --port is not given").dim()
    );

    Ok(())
}
