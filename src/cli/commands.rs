use clap::Subcommand;

use super::config::ConfigArgs;

#[derive(Subcommand, Clone, Debug)]
pub enum Commands {
    /// Run the guest login → add child probe (default)
    Run,

    /// Inspect the effective configuration
    Config(ConfigArgs),
}
