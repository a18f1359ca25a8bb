//! Winstone command-line launcher.
//!
//! # Quick Start
//!
//! ```bash
//! # Start with ./winstone.toml, overriding one setting
//! winstone start controlPort=8081 handlerCountMax=50
//!
//! # From another terminal
//! winstone reload --port 8081 --prefix /shop
//! winstone shutdown --port 8081
//! ```

mod commands;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

/// Winstone - a small servlet container core.
#[derive(Parser)]
#[command(name = "winstone")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the server and run until shut down.
    Start {
        #[command(flatten)]
        source: ConfigSource,
    },

    /// Ask a running server to shut down through its control port.
    Shutdown {
        /// Control port of the server.
        #[arg(short, long)]
        port: u16,

        /// Control address of the server.
        #[arg(short, long, default_value = "127.0.0.1")]
        address: String,
    },

    /// Ask a running server to reload one web application.
    Reload {
        /// Control port of the server.
        #[arg(short, long)]
        port: u16,

        /// Control address of the server.
        #[arg(short, long, default_value = "127.0.0.1")]
        address: String,

        /// Virtual host of the web application.
        #[arg(long, default_value = "localhost")]
        host: String,

        /// Context path of the web application, empty for the root.
        #[arg(long, default_value = "", allow_hyphen_values = true)]
        prefix: String,
    },

    /// Print the resolved configuration as TOML.
    Config {
        #[command(flatten)]
        source: ConfigSource,
    },
}

/// Where the configuration comes from.
#[derive(clap::Args)]
struct ConfigSource {
    /// Configuration file to read instead of ./winstone.toml.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory holding winstone.toml and winstone.local.toml.
    #[arg(long, default_value = ".")]
    project: PathBuf,

    /// Settings as key=value, e.g. handlerCountMax=50 or --useJNDI=true.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    overrides: Vec<String>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(default_level.into())
                .from_env_lossy(),
        )
        .init();

    match cli.command {
        Commands::Start { source } => commands::start::run(source.loader()),
        Commands::Shutdown { port, address } => commands::control::shutdown(&address, port),
        Commands::Reload {
            port,
            address,
            host,
            prefix,
        } => commands::control::reload(&address, port, &host, &prefix),
        Commands::Config { source } => commands::config::show(source.loader()),
    }
}

impl ConfigSource {
    fn loader(&self) -> winstone_config::ConfigLoader {
        let mut loader = winstone_config::ConfigLoader::new()
            .with_project_dir(&self.project)
            .with_overrides(self.overrides.iter().cloned());
        if let Some(file) = &self.config {
            loader = loader.with_config_file(file);
        }
        loader
    }
}
