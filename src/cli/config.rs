//! Configuration inspection commands.

use clap::Subcommand;

use crate::config::Config;

#[derive(Subcommand, Debug, Clone)]
pub enum ConfigCommand {
    /// Print the resolved configuration as YAML
    Show,

    /// Validate the configuration and exit
    Check,
}

pub fn run_config_command(cmd: ConfigCommand, config: &Config) -> anyhow::Result<()> {
    match cmd {
        ConfigCommand::Show => {
            print!("{}", serde_yaml::to_string(config)?);
        }
        ConfigCommand::Check => {
            config.validate()?;
            println!(
                "Configuration OK: {} cores, {} GB RAM, up to {} sandboxes",
                config.resources.max_cpu_cores,
                config.resources.max_ram_gb,
                config.resources.max_sandboxes
            );
        }
    }
    Ok(())
}
