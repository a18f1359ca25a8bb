//! Configuration loader with multi-source merging

use crate::{ConfigError, Paths, WinstoneConfig, canonical_key};
use anyhow::{Context, Result};
use std::env;
use std::path::{Path, PathBuf};

/// Configuration loader with builder pattern
pub struct ConfigLoader {
    project_dir: PathBuf,
    config_file: Option<PathBuf>,
    env_prefix: String,
    env_vars: Option<Vec<(String, String)>>,
    overrides: Vec<String>,
}

impl ConfigLoader {
    /// Create a new config loader with default project directory (current dir)
    pub fn new() -> Self {
        Self {
            project_dir: env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            config_file: None,
            env_prefix: "WINSTONE".to_string(),
            env_vars: None,
            overrides: Vec::new(),
        }
    }

    /// Set the project directory
    pub fn with_project_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.project_dir = dir.as_ref().to_path_buf();
        self
    }

    /// Read this file instead of `winstone.toml`. It must exist.
    pub fn with_config_file(mut self, file: impl AsRef<Path>) -> Self {
        self.config_file = Some(file.as_ref().to_path_buf());
        self
    }

    /// Set the environment variable prefix (default: "WINSTONE")
    pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = prefix.into();
        self
    }

    /// Use these variables instead of the process environment.
    pub fn with_env_vars(mut self, vars: impl IntoIterator<Item = (String, String)>) -> Self {
        self.env_vars = Some(vars.into_iter().collect());
        self
    }

    /// Add `key=value` overrides. A leading `--` is ignored, so raw
    /// command-line arguments can be passed through.
    pub fn with_overrides<S: Into<String>>(mut self, overrides: impl IntoIterator<Item = S>) -> Self {
        self.overrides.extend(overrides.into_iter().map(Into::into));
        self
    }

    /// Load configuration from all sources with proper precedence
    pub fn load(self) -> Result<WinstoneConfig> {
        let mut builder = config::Config::builder();

        // 1. Start with built-in defaults
        let defaults = WinstoneConfig::default();
        builder = builder.add_source(config::Config::try_from(&defaults)?);

        // 2. User config (~/.config/winstone/config.toml)
        let paths = Paths::new();
        if let Ok(user_config_file) = paths.user_config_file() {
            if user_config_file.exists() {
                builder = builder.add_source(
                    config::File::from(user_config_file)
                        .required(false)
                        .format(config::FileFormat::Toml),
                );
            }
        }

        // 3. Project config (winstone.toml, or the file given explicitly)
        match &self.config_file {
            Some(file) => {
                builder = builder.add_source(
                    config::File::from(file.as_path())
                        .required(true)
                        .format(config::FileFormat::Toml),
                );
            }
            None => {
                let project_config_file = Paths::project_config_file(&self.project_dir);
                if project_config_file.exists() {
                    builder = builder.add_source(
                        config::File::from(project_config_file)
                            .required(false)
                            .format(config::FileFormat::Toml),
                    );
                }
            }
        }

        // 4. Local config (winstone.local.toml, gitignored)
        let local_config_file = Paths::local_config_file(&self.project_dir);
        if local_config_file.exists() {
            builder = builder.add_source(
                config::File::from(local_config_file)
                    .required(false)
                    .format(config::FileFormat::Toml),
            );
        }

        // 5. Environment variables (WINSTONE_*). Unrecognised names are
        // ignored; the environment is shared with other programs.
        let env_vars = match self.env_vars {
            Some(vars) => vars,
            None => env::vars().collect(),
        };
        let prefix = format!("{}_", self.env_prefix);
        for (name, value) in env_vars {
            let Some(key) = name.strip_prefix(&prefix).and_then(canonical_key) else {
                continue;
            };
            builder = builder
                .set_override(key, value)
                .with_context(|| format!("Invalid environment variable {name}"))?;
        }

        // 6. Explicit overrides
        for raw in &self.overrides {
            let (key, value) = parse_override(raw)?;
            builder = builder
                .set_override(key, value.to_string())
                .with_context(|| format!("Invalid override {raw:?}"))?;
        }

        // Build and deserialize
        let config = builder
            .build()
            .map_err(|e| ConfigError::MergeError(e.to_string()))
            .context("Failed to build configuration")?;

        let mut winstone_config: WinstoneConfig = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        // Resolve relative paths
        winstone_config.resolve_paths(&self.project_dir);
        winstone_config.validate()?;

        Ok(winstone_config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default(self) -> WinstoneConfig {
        self.load().unwrap_or_default()
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

/// Splits `key=value` (or `--key=value`) and resolves the key.
fn parse_override(raw: &str) -> Result<(&'static str, &str), ConfigError> {
    let trimmed = raw.trim_start_matches("--");
    let (name, value) = trimmed
        .split_once('=')
        .ok_or_else(|| ConfigError::MalformedOverride(raw.to_string()))?;
    let key = canonical_key(name.trim()).ok_or_else(|| ConfigError::UnknownKey(name.to_string()))?;
    Ok((key, value.trim()))
}
