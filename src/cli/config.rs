use std::path::Path;

use anyhow::{bail, Context, Result};
use clap::{Args, Subcommand};
use serde_json::Value as JsonValue;

use crate::cli::output::OutputFormat;
use crate::config::ProbeConfig;

#[derive(Args, Clone, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub action: ConfigAction,
}

#[derive(Subcommand, Clone, Debug)]
pub enum ConfigAction {
    /// Show the effective configuration (file, environment and flags merged)
    Show,

    /// Get one configuration value
    Get {
        /// Dotted configuration key, e.g. `timing.settle_ms`
        key: String,
    },

    /// Validate the configuration, including every selector
    Validate,
}

pub fn cmd_config(
    args: ConfigArgs,
    config: &ProbeConfig,
    path: &Path,
    output: OutputFormat,
) -> Result<()> {
    match args.action {
        ConfigAction::Show => match output {
            OutputFormat::Human => {
                println!("Effective configuration ({}):", path.display());
                println!("{}", serde_yaml::to_string(config)?);
            }
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(config)?),
        },
        ConfigAction::Get { key } => {
            let json = serde_json::to_value(config)?;
            let segments = split_key(&key)?;
            match get_json_value(&json, &segments) {
                Some(value) => match output {
                    OutputFormat::Human => print!("{}", serde_yaml::to_string(value)?),
                    OutputFormat::Json => println!("{}", serde_json::to_string_pretty(value)?),
                },
                None => bail!("{} not found in configuration", key),
            }
        }
        ConfigAction::Validate => {
            config
                .selectors
                .compile()
                .context("selector configuration is invalid")?;
            if config.base_url.trim().is_empty() {
                bail!("base_url must not be empty");
            }
            println!("Configuration {} is valid", path.display());
        }
    }

    Ok(())
}

fn split_key(key: &str) -> Result<Vec<&str>> {
    let segments: Vec<&str> = key
        .split('.')
        .filter(|segment| !segment.is_empty())
        .collect();
    if segments.is_empty() {
        bail!("configuration key cannot be empty");
    }
    Ok(segments)
}

fn get_json_value<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a JsonValue> {
    let mut current = value;
    for segment in path {
        match current {
            JsonValue::Object(map) => {
                current = map.get(*segment)?;
            }
            _ => return None,
        }
    }
    Some(current)
}
