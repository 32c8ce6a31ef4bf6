pub mod app;
pub mod commands;
pub mod config;
pub mod env;
pub mod output;
pub mod probe;
pub mod runtime;

pub use config::{cmd_config, ConfigArgs};
pub use probe::cmd_run;
