//! `hookd.toml` loading, defaults and validation.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::cli_args::Cli;

pub(crate) const STARTUP_TIMEOUT_MS_MAX: u64 = 60_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct PluginsConfig {
    pub(crate) enable: bool,
    pub(crate) directory: PathBuf,
    pub(crate) startup_timeout_ms: u64,
    pub(crate) stop_grace_ms: u64,
    pub(crate) notify_concurrency: usize,
}

impl Default for PluginsConfig {
    fn default() -> Self {
        Self {
            enable: true,
            directory: PathBuf::from("./plugins"),
            startup_timeout_ms: hookd_plugins::PLUGIN_STARTUP_TIMEOUT_MS_DEFAULT,
            stop_grace_ms: hookd_plugins::PLUGIN_STOP_GRACE_MS_DEFAULT,
            notify_concurrency: hookd_plugins::NOTIFY_CONCURRENCY_DEFAULT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum JobStoreKind {
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct JobsConfig {
    pub(crate) store: JobStoreKind,
    pub(crate) sqlite_path: PathBuf,
    pub(crate) maintenance_interval_secs: u64,
    pub(crate) worker_name: String,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            store: JobStoreKind::Memory,
            sqlite_path: PathBuf::from("./data/jobs.sqlite"),
            maintenance_interval_secs: hookd_jobs::MAINTENANCE_INTERVAL_SECS_DEFAULT,
            worker_name: "Plugins".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct LogConfig {
    pub(crate) filter: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct HookdConfig {
    pub(crate) plugins: PluginsConfig,
    pub(crate) jobs: JobsConfig,
    pub(crate) log: LogConfig,
}

impl HookdConfig {
    pub(crate) fn validate(&self) -> Result<()> {
        let plugins = &self.plugins;
        if !(1..=STARTUP_TIMEOUT_MS_MAX).contains(&plugins.startup_timeout_ms) {
            bail!(
                "plugins.startup_timeout_ms must be in range 1..={}",
                STARTUP_TIMEOUT_MS_MAX
            );
        }
        if plugins.stop_grace_ms == 0 {
            bail!("plugins.stop_grace_ms must be greater than 0");
        }
        if plugins.notify_concurrency == 0 {
            bail!("plugins.notify_concurrency must be greater than 0");
        }
        if plugins.directory.as_os_str().is_empty() {
            bail!("plugins.directory must not be empty");
        }
        if self.jobs.maintenance_interval_secs == 0 {
            bail!("jobs.maintenance_interval_secs must be greater than 0");
        }
        if self.jobs.worker_name.trim().is_empty() {
            bail!("jobs.worker_name must not be empty");
        }
        if self.jobs.store == JobStoreKind::Sqlite && self.jobs.sqlite_path.as_os_str().is_empty()
        {
            bail!("jobs.sqlite_path must not be empty when jobs.store = \"sqlite\"");
        }
        if self.log.filter.trim().is_empty() {
            bail!("log.filter must not be empty");
        }
        Ok(())
    }

    /// Applies command-line and environment overrides on top of the file.
    pub(crate) fn apply_cli_overrides(&mut self, cli: &Cli) {
        if let Some(plugin_dir) = &cli.plugin_dir {
            self.plugins.directory = plugin_dir.clone();
        }
        if let Some(filter) = &cli.log_filter {
            self.log.filter = filter.clone();
        }
        if let Some(timeout_ms) = cli.startup_timeout_ms {
            self.plugins.startup_timeout_ms = timeout_ms;
        }
    }
}

pub(crate) fn parse_config(raw: &str) -> Result<HookdConfig> {
    let config: HookdConfig = toml::from_str(raw).context("failed to parse hookd config")?;
    Ok(config)
}

/// Where the effective config came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ConfigOrigin {
    File(PathBuf),
    /// The file was missing; defaults were used.
    Defaults(PathBuf),
}

impl ConfigOrigin {
    /// Logs the origin. Call once the subscriber is installed.
    pub(crate) fn log(&self) {
        match self {
            Self::File(path) => info!(path = %path.display(), "loaded config file"),
            Self::Defaults(path) => {
                info!(path = %path.display(), "config file not found; using defaults")
            }
        }
    }
}

/// Loads the config at `path`; a missing file yields defaults.
pub(crate) fn load_config(path: &Path) -> Result<(HookdConfig, ConfigOrigin)> {
    if !path.exists() {
        return Ok((
            HookdConfig::default(),
            ConfigOrigin::Defaults(path.to_path_buf()),
        ));
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    let config =
        parse_config(&raw).with_context(|| format!("invalid config {}", path.display()))?;
    Ok((config, ConfigOrigin::File(path.to_path_buf())))
}

/// Loads the config, applies overrides and validates the result.
pub(crate) fn resolve_config(cli: &Cli) -> Result<(HookdConfig, ConfigOrigin)> {
    let (mut config, origin) = load_config(&cli.config)?;
    config.apply_cli_overrides(cli);
    config.validate()?;
    Ok((config, origin))
}
