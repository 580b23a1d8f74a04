use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use voicebridge::cli::{Cli, Command, ConfigAction};
use voicebridge::config::Config;
use voicebridge::engine::Engine;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Run { config } => {
            let config = Config::load(config.as_deref())?;
            let engine = Engine::start(config).await?;

            tokio::signal::ctrl_c().await?;
            info!("interrupt received");
            engine.shutdown();
            // Give tasks a moment to drain before the runtime drops
            tokio::time::sleep(std::time::Duration::from_millis(250)).await;
        }
        Command::Config { action } => match action {
            ConfigAction::Show { config } => {
                let config = Config::load(config.as_deref())?;
                println!("{}", toml::to_string_pretty(&config)?);
            }
            ConfigAction::Default => {
                println!("{}", Config::default_toml());
            }
        },
    }
    Ok(())
}
