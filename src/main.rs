// Copyright (C) 2026 Michael Wilson <mike@mdwn.dev>
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free Software
// Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//
mod audio;
mod config;
mod engine;
mod mixer;
mod proto;
mod router;
mod sampler;
mod schedule;
mod synth;
mod telemetry;
#[cfg(test)]
mod testutil;
mod transport;

use std::error::Error;
use std::fs;
use std::path::PathBuf;

use clap::{crate_version, Parser, Subcommand};
use tracing::info;

use crate::config::{EngineConfig, EngineConfigUpdate};

#[derive(Parser)]
#[clap(
    author = "Michael Wilson",
    version = crate_version!(),
    about = "A headless realtime audio engine driven over stdin/stdout."
)]
struct Cli {
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Runs the engine, reading requests from stdin and writing responses
    /// and events to stdout.
    Serve {
        /// Optional JSON config file applied before the device opens.
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Lists the available audio output devices.
    Devices {},
}

#[tokio::main]
async fn main() {
    // Default logging to off, with stagemix at info level. Logs go to
    // stderr: stdout carries the wire protocol.
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("off,stagemix=info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run().await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { config } => {
            let mut engine_config = EngineConfig::default();
            if let Some(path) = config {
                let update: EngineConfigUpdate = serde_json::from_str(&fs::read_to_string(&path)?)
                    .map_err(|e| format!("error parsing config {}: {}", path.display(), e))?;
                engine_config.apply(&update)?;
            }

            info!(
                sample_rate = engine_config.sample_rate,
                buffer_size = engine_config.buffer_size,
                "Starting engine"
            );

            let engine = engine::Engine::new(engine_config, proto::Writer::stdout());
            let pump = tokio::spawn(telemetry::run(engine.clone()));
            router::run(engine.clone()).await;
            engine.shutdown();
            let _ = pump.await;
        }
        Commands::Devices {} => {
            let devices = audio::list_devices()?;

            if devices.is_empty() {
                println!("No devices found.");
                return Ok(());
            }

            println!("Devices:");
            for device in devices {
                println!("- {}", device);
            }
        }
    }

    Ok(())
}
