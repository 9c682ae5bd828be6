//! `silo-agent`: dials out to the server and forwards tunneled requests to
//! a locally running service.

use std::path::PathBuf;

use clap::Parser;
use silo_core::config::AgentConfig;
use silo_core::{signal, telemetry};
use tokio_util::sync::CancellationToken;

mod client;
mod forward;

use client::AgentClient;

#[derive(Parser, Debug)]
#[command(name = "silo-agent", about = "Reverse tunnel proxy agent")]
struct Args {
	/// Path to a JSON or YAML configuration file.
	#[arg(long, conflicts_with = "config")]
	file: Option<PathBuf>,

	/// Inline JSON or YAML configuration.
	#[arg(long)]
	config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	telemetry::init();
	let args = Args::parse();
	let config_path = args.file.clone();
	let config = AgentConfig::load(args.file, args.config.map(String::into_bytes))?;

	let shutdown = CancellationToken::new();
	let shutdown_for_signal = shutdown.clone();
	tokio::spawn(async move {
		signal::Shutdown::new().wait().await;
		tracing::info!("shutdown signal received");
		shutdown_for_signal.cancel();
	});

	tracing::info!(server = %config.grpc.server_address, local = %config.local.service_url, "silo-agent starting");
	AgentClient::new(config, config_path).run(shutdown).await;
	Ok(())
}
