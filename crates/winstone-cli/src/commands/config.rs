//! Configuration display.

use anyhow::{Context, Result};
use winstone_config::ConfigLoader;

/// Prints the configuration every layer resolves to.
pub fn show(loader: ConfigLoader) -> Result<()> {
    let config = loader.load().context("Failed to load configuration")?;
    print!("{}", config.to_toml().context("Failed to render configuration")?);
    Ok(())
}
