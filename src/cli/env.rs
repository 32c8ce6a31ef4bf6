use clap::{Args, Parser};
use std::path::PathBuf;

use super::commands::Commands;
use crate::config::ProbeConfig;

const LONG_VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("GIT_HASH"),
    ", built ",
    env!("BUILD_DATE"),
    ")"
);

#[derive(Parser)]
#[command(author, version, long_version = LONG_VERSION, about, long_about = None)]
#[command(propagate_version = true)]
pub struct CliArgs {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", global = true)]
    pub config: Option<PathBuf>,

    /// Log level
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// Enable debug mode
    #[arg(short, long, global = true)]
    pub debug: bool,

    /// Output format
    #[arg(short, long, default_value = "human", global = true)]
    pub output: crate::cli::output::OutputFormat,

    #[command(flatten)]
    pub overrides: ProbeOverrides,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Command-line overrides applied on top of the config file and environment.
#[derive(Args, Clone, Debug, Default)]
pub struct ProbeOverrides {
    /// Base URL of the web app under test
    #[arg(long, value_name = "URL", global = true)]
    pub base_url: Option<String>,

    /// Directory for screenshots
    #[arg(long, value_name = "DIR", global = true)]
    pub output_dir: Option<PathBuf>,

    /// Show the browser window
    #[arg(long, global = true)]
    pub headful: bool,

    /// Chrome/Chromium executable
    #[arg(long, value_name = "PATH", global = true)]
    pub chrome_path: Option<PathBuf>,

    /// Attach to a running browser's DevTools websocket instead of launching one
    #[arg(long, value_name = "WS_URL", global = true)]
    pub ws_url: Option<String>,

    /// Pause after navigations and clicks, in milliseconds
    #[arg(long, value_name = "MS", global = true)]
    pub settle_ms: Option<u64>,
}

impl ProbeOverrides {
    pub fn apply(&self, config: &mut ProbeConfig) {
        if let Some(url) = &self.base_url {
            config.base_url = url.clone();
        }
        if let Some(dir) = &self.output_dir {
            config.output_dir = dir.clone();
        }
        if self.headful {
            config.browser.headless = false;
        }
        if let Some(path) = &self.chrome_path {
            config.browser.chrome_path = Some(path.clone());
        }
        if let Some(url) = &self.ws_url {
            config.browser.websocket_url = Some(url.clone());
        }
        if let Some(ms) = self.settle_ms {
            config.timing.settle_ms = ms;
        }
    }
}
