use anyhow::{Context, anyhow};
use clap::{Parser, Subcommand};
use std::{
    io::Read,
    path::{Path, PathBuf},
};
use tracing::{info, warn};
use weather_core::{Config, HttpForwarder, RabbitSource, decode, run, transform};

/// Top-level CLI struct.
#[derive(Debug, Parser)]
#[command(name = "weather-consumer", version, about = "Weather queue consumer")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Consume the `weather` queue and forward each message to the API (default).
    Run {
        /// Path to a TOML config file; environment variables still override it.
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Transform a single payload offline and print the result.
    Transform {
        /// JSON file to read; reads stdin when absent or "-".
        file: Option<PathBuf>,
    },
}

impl Cli {
    pub async fn run(self) -> anyhow::Result<()> {
        match self.command.unwrap_or(Command::Run { config: None }) {
            Command::Run { config } => consume(config.as_deref()).await,
            Command::Transform { file } => transform_one(file.as_deref()),
        }
    }
}

async fn consume(config_path: Option<&Path>) -> anyhow::Result<()> {
    let config = Config::load(config_path)?;
    let endpoint = config.forward_endpoint()?;
    info!(%endpoint, ack_mode = %config.ack_mode, "Starting weather consumer");

    let forwarder = HttpForwarder::new(&config.api)?;
    let mut source = RabbitSource::connect(&config.rabbit, config.ack_mode)
        .await
        .context("Error connecting to RabbitMQ")?;

    let (stats, reason) = run(&mut source, &forwarder, config.ack_mode).await;
    warn!(
        received = stats.received,
        forwarded = stats.forwarded,
        decode_failures = stats.decode_failures,
        forward_failures = stats.forward_failures,
        "Consumer stopped"
    );

    Err(anyhow!(reason).context("Weather consumer stopped"))
}

fn transform_one(file: Option<&Path>) -> anyhow::Result<()> {
    let body = match file {
        Some(path) if path != Path::new("-") => std::fs::read(path)
            .with_context(|| format!("Failed to read payload file: {}", path.display()))?,
        _ => {
            let mut buf = Vec::new();
            std::io::stdin()
                .read_to_end(&mut buf)
                .context("Failed to read payload from stdin")?;
            buf
        }
    };

    let input = decode(&body)?;
    let output = transform(input);
    let pretty = serde_json::to_string_pretty(&output).context("Failed to serialize output")?;
    println!("{pretty}");

    Ok(())
}
