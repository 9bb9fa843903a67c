//! Port listing command implementation.

use anyhow::{Context, Result};
use console::style;
use mcpflash::{NativePortEnumerator, PortEnumerator, PortInfo};

/// One line describing `port`, without styling.
pub(crate) fn describe_port(port: &PortInfo) -> String {
    let mut line = port.name.clone();

    if let (Some(vid), Some(pid)) = (port.vid, port.pid) {
        line.push_str(&format!(" ({vid:04X}:{pid:04X})"));
    }
    if let Some(product) = port.product.as_deref().filter(|p| !p.is_empty()) {
        line.push_str(&format!(" - {product}"));
    }

    line
}

/// List ports command implementation.
pub(crate) fn cmd_list_ports() -> Result<()> {
    let ports = NativePortEnumerator::list_ports().context("Failed to enumerate serial ports")?;

    eprintln!("{}", style("Available serial ports:").bold().underlined());

    if ports.is_empty() {
        eprintln!("  {}", style("No serial ports found").dim());
        return Ok(());
    }

    for port in &ports {
        println!("{}", describe_port(port));
    }

    Ok(())
}
