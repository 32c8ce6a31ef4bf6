use anyhow::Result;
use clap::Parser;
use tracing::{error, info};

use super::commands::Commands;
use super::output::OutputFormat;
use super::config::cmd_config;
use super::env::CliArgs;
use super::probe::cmd_run;
use super::runtime::{
    apply_env_overrides, init_logging, load_config, load_local_env_overrides, LoadedConfig,
};

pub async fn run() -> Result<()> {
    load_local_env_overrides();
    let cli = CliArgs::parse();

    init_logging(&cli.log_level, cli.debug, cli.output == OutputFormat::Json)?;

    info!(
        "Starting flowprobe v{} ({})",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_HASH")
    );

    let LoadedConfig { mut config, path } = load_config(cli.config.as_ref()).await?;
    apply_env_overrides(&mut config);
    cli.overrides.apply(&mut config);

    let result = match cli.command.clone().unwrap_or(Commands::Run) {
        Commands::Run => cmd_run(&config, cli.output).await,
        Commands::Config(args) => cmd_config(args, &config, &path, cli.output),
    };

    match result {
        Ok(()) => {
            info!("Command completed successfully");
            Ok(())
        }
        Err(err) => {
            error!("Command failed: {:#}", err);
            Err(err)
        }
    }
}
