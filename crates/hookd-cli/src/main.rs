mod bootstrap;
mod cli_args;
mod commands;
mod config;
mod maintenance;

use anyhow::Result;
use clap::Parser;

use crate::bootstrap::init_tracing;
use crate::cli_args::{Cli, HookdCommand};
use crate::commands::{execute_list, execute_serve, execute_trigger, execute_validate};
use crate::config::resolve_config;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let (config, origin) = resolve_config(&cli)?;
    init_tracing(&config.log.filter);
    origin.log();

    match &cli.command {
        HookdCommand::Serve => execute_serve(&config).await?,
        HookdCommand::List => println!("{}", execute_list(&config)?),
        HookdCommand::Validate { bundle_dir } => println!("{}", execute_validate(bundle_dir)?),
        HookdCommand::Trigger(args) => println!("{}", execute_trigger(&config, args).await?),
    }
    Ok(())
}
