//! CLI command handling.
//!
//! - Running the control API, data plane and gateway (`serve`)
//! - Inspecting the resolved configuration (`config show`, `config check`)

mod config;
mod serve;

pub use config::{ConfigCommand, run_config_command};
pub use serve::{ServeOptions, run_serve};

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "sandboxd")]
#[command(about = "Resource-aware sandbox orchestrator with an authenticated gateway")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// YAML configuration file (optional, env vars override its values)
    #[arg(short, long, global = true, env = "SANDBOXD_CONFIG")]
    pub config: Option<std::path::PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Serve the control API and the gateway (default if no subcommand given)
    Serve(ServeOptions),

    /// Inspect configuration
    #[command(subcommand)]
    Config(ConfigCommand),
}
