use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

pub(crate) fn parse_positive_u64(value: &str) -> Result<u64, String> {
    let parsed = value
        .parse::<u64>()
        .map_err(|error| format!("failed to parse integer: {error}"))?;
    if parsed == 0 {
        return Err("value must be greater than 0".to_string());
    }
    Ok(parsed)
}

#[derive(Debug, Parser)]
#[command(
    name = "hookd",
    about = "Supervised plugin runtime with hook dispatch and background maintenance",
    version
)]
pub(crate) struct Cli {
    #[arg(
        long,
        env = "HOOKD_CONFIG",
        default_value = "hookd.toml",
        help = "Path to the hookd TOML config; a missing file uses defaults"
    )]
    pub(crate) config: PathBuf,

    #[arg(
        long,
        env = "HOOKD_PLUGIN_DIR",
        help = "Plugin bundle directory (overrides plugins.directory)"
    )]
    pub(crate) plugin_dir: Option<PathBuf>,

    #[arg(
        long,
        env = "HOOKD_LOG_FILTER",
        help = "Default tracing directive (overrides log.filter; RUST_LOG still wins)"
    )]
    pub(crate) log_filter: Option<String>,

    #[arg(
        long,
        value_parser = parse_positive_u64,
        help = "Handshake timeout in milliseconds (overrides plugins.startup_timeout_ms)"
    )]
    pub(crate) startup_timeout_ms: Option<u64>,

    #[command(subcommand)]
    pub(crate) command: HookdCommand,
}

#[derive(Debug, Subcommand)]
pub(crate) enum HookdCommand {
    /// Activate every bundle and run the maintenance worker until Ctrl-C.
    Serve,
    /// Print the bundle discovery report.
    List,
    /// Validate one bundle directory.
    Validate {
        #[arg(help = "Bundle directory containing plugin.json")]
        bundle_dir: PathBuf,
    },
    /// Activate plugins, dispatch one hook and print the outcome.
    Trigger(TriggerArgs),
}

#[derive(Debug, Args)]
pub(crate) struct TriggerArgs {
    #[arg(long, help = "Hook id, e.g. MessageWillBePosted")]
    pub(crate) hook: String,

    #[arg(long, default_value = "null", help = "JSON payload passed to the hook")]
    pub(crate) payload: String,

    #[arg(
        long = "plugin",
        help = "Activate only these plugin ids (repeatable); default activates all"
    )]
    pub(crate) plugins: Vec<String>,

    #[arg(long, default_value = "")]
    pub(crate) session_id: String,

    #[arg(long, default_value = "hookd-cli")]
    pub(crate) request_id: String,

    #[arg(long, default_value = "")]
    pub(crate) ip_address: String,

    #[arg(long, default_value = "")]
    pub(crate) accept_language: String,

    #[arg(long, default_value = "")]
    pub(crate) user_agent: String,
}
