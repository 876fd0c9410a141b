use anyhow::{Context, Result};
use clap::Parser;
use micwatch::app::{describe_config, run_monitor};
use micwatch::cli::{Cli, Commands};
use micwatch::config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    micwatch::logging::init(cli.verbose, cli.json);

    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        None => run_monitor(config, Vec::new()).await?,
        Some(Commands::Run { devices }) => run_monitor(config, devices).await?,
        Some(Commands::CheckConfig) => {
            config.validate().context("configuration is invalid")?;
            print!("{}", describe_config(&config));
            println!("configuration OK");
        }
    }

    Ok(())
}

/// Load configuration from file and apply environment overrides.
fn load_config(custom_path: Option<&std::path::Path>) -> Result<Config> {
    let config = if let Some(path) = custom_path {
        // An explicit path must exist
        Config::load(path)?
    } else {
        // Try default path, fall back to defaults
        let default_path = Config::default_path();
        Config::load_or_default(&default_path)
            .with_context(|| format!("failed to load {}", default_path.display()))?
    };

    // Apply environment variable overrides
    Ok(config.with_env_overrides())
}
