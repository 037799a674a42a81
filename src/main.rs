use clap::Parser;
use tracing_subscriber::EnvFilter;

use sandboxd::cli::{Cli, Command, ServeOptions, run_config_command, run_serve};
use sandboxd::config::Config;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("sandboxd=info"));
    let json = std::env::var("SANDBOXD_LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    init_tracing();

    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_deref())?;

    match cli.command.unwrap_or(Command::Serve(ServeOptions::default())) {
        Command::Serve(options) => {
            options.apply(&mut config);
            run_serve(config).await
        }
        Command::Config(cmd) => run_config_command(cmd, &config),
    }
}
