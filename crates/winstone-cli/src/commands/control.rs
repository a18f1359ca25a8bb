//! Control-port client commands.

use anyhow::{Context, Result};
use winstone_server::{send_reload, send_shutdown};

pub fn shutdown(address: &str, port: u16) -> Result<()> {
    send_shutdown((address, port))
        .with_context(|| format!("Failed to reach control port {address}:{port}"))?;
    println!("Shutdown requested from {address}:{port}");
    Ok(())
}

pub fn reload(address: &str, port: u16, host: &str, prefix: &str) -> Result<()> {
    send_reload((address, port), host, prefix)
        .with_context(|| format!("Failed to reach control port {address}:{port}"))?;
    let shown = if prefix.is_empty() { "/" } else { prefix };
    println!("Reload of {host}{shown} requested from {address}:{port}");
    Ok(())
}
