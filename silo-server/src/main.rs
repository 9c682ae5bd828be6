//! `silo-server`: terminates agent tunnels and fronts them with per-agent
//! public HTTP listeners.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use silo_core::config::ServerConfig;
use silo_core::{drain, signal, telemetry};

mod admin;
mod collaborators;
mod dispatcher;
mod http_adapter;
mod listener_manager;
mod port_pool;
mod registry;
mod stream_handler;
mod tls_transport;

use collaborators::{ApiKeyAdminAuth, InMemoryAgentRepository, PermissiveAdminAuth, TracingAuditRepository};
use dispatcher::Dispatcher;
use listener_manager::ListenerManager;
use port_pool::PortPool;
use registry::{ListenerLifecycle, Registry};
use stream_handler::TunnelService;

const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(name = "silo-server", about = "Reverse tunnel proxy server")]
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
	let config = ServerConfig::load(args.file, args.config.map(String::into_bytes))?;

	let audit = Arc::new(TracingAuditRepository);
	let provisioning: Arc<dyn collaborators::ProvisioningService> = Arc::new(InMemoryAgentRepository::new());

	let registry = Registry::new(audit.clone());
	let dispatcher = Dispatcher::new();
	let pool = Arc::new(PortPool::new(
		config.http.agent_port_range.start,
		config.http.agent_port_range.end,
	)?);
	let listeners = ListenerManager::new(pool, dispatcher.clone());

	// Two-phase wiring: the listener manager was built with only the
	// dispatcher; the registry learns about it, and it learns about the
	// registry, only now that both exist.
	listeners.set_registry(registry.clone());
	registry.set_listener_manager(listeners.clone() as Arc<dyn ListenerLifecycle>);
	registry.spawn_eviction();

	let admin_auth: Arc<dyn collaborators::AdminAuth> = match &config.http.admin_api_key {
		Some(key) => Arc::new(ApiKeyAdminAuth::new(key.clone())),
		None => Arc::new(PermissiveAdminAuth),
	};
	let admin_state = admin::AdminState {
		registry: registry.clone(),
		listeners: listeners.clone(),
		auth: admin_auth,
	};

	let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

	let admin_addr = SocketAddr::from(([0, 0, 0, 0], config.http.port));
	let admin_shutdown_rx = shutdown_rx.clone();
	tokio::spawn(async move {
		let listener = match tokio::net::TcpListener::bind(admin_addr).await {
			Ok(l) => l,
			Err(e) => {
				tracing::error!(error = %e, "failed to bind admin listener");
				return;
			},
		};
		let mut rx = admin_shutdown_rx;
		let result = axum::serve(listener, admin::router(admin_state))
			.with_graceful_shutdown(async move {
				let _ = rx.changed().await;
			})
			.await;
		if let Err(e) = result {
			tracing::error!(error = %e, "admin server exited with error");
		}
	});

	tokio::spawn(async move {
		signal::Shutdown::new().wait().await;
		tracing::info!("shutdown signal received, draining connections");
		let _ = shutdown_tx.send(true);
	});

	let tunnel_service = TunnelService::new(registry.clone(), dispatcher.clone(), provisioning, audit);
	let grpc_addr = SocketAddr::from(([0, 0, 0, 0], config.grpc.port));
	let grpc_tls = config.grpc.tls.clone();

	tracing::info!(%grpc_addr, %admin_addr, "silo-server starting");

	let mut grpc_shutdown_rx = shutdown_rx;
	tls_transport::serve(grpc_addr, &grpc_tls, tunnel_service, async move {
		let _ = grpc_shutdown_rx.changed().await;
	})
	.await?;

	let (drain_trigger, drain_watcher) = drain::new();
	let registry_for_drain = registry.clone();
	tokio::spawn(async move {
		let _watcher = drain_watcher;
		registry_for_drain.stop().await;
	});
	drain_trigger.drain("registry", SHUTDOWN_DEADLINE).await;
	Ok(())
}
