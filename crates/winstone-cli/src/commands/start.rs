//! Start command - runs the server until shut down.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;
use winstone_config::ConfigLoader;
use winstone_server::{Launcher, ServerContext};

pub fn run(loader: ConfigLoader) -> Result<()> {
    let config = loader.load().context("Failed to load configuration")?;

    println!();
    println!("Winstone");
    println!();
    println!("  Host:        {}", config.hostname);
    println!("  Temp dir:    {}", config.temp_dir.display());
    match config.control_port() {
        Some(port) => println!("  Control:     {}:{port}", config.control_address),
        None => println!("  Control:     disabled"),
    }
    println!("  JNDI:        {}", if config.use_jndi { "on" } else { "off" });
    if config.use_cluster {
        println!("  Cluster:     {} ({})", config.cluster_class_name, config.cluster_nodes);
    }

    let launcher = Launcher::start(config).context("Failed to start server")?;
    watch_signals(Arc::clone(launcher.context()))?;

    println!();
    println!("Server is ready. Press Ctrl+C to stop.");
    println!();

    launcher.wait_for_shutdown();
    info!("shutting down");
    launcher.shutdown();

    println!();
    println!("Server stopped gracefully.");
    Ok(())
}

/// Turns SIGINT and SIGTERM into a shutdown request.
#[cfg(unix)]
fn watch_signals(context: Arc<ServerContext>) -> Result<()> {
    use signal_hook::consts::{SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;
    use std::thread;

    let mut signals = Signals::new([SIGINT, SIGTERM]).context("Failed to install signal handlers")?;
    thread::Builder::new()
        .name("winstone-signals".into())
        .spawn(move || {
            if let Some(signal) = signals.forever().next() {
                info!(signal, "signal received");
                context.request_shutdown();
            }
        })
        .context("Failed to spawn signal thread")?;
    Ok(())
}

#[cfg(not(unix))]
fn watch_signals(_context: Arc<ServerContext>) -> Result<()> {
    tracing::warn!("signal handling unavailable on this platform; use the control port to stop");
    Ok(())
}
