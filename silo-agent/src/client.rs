//! The agent's half of the tunnel: connects outbound to the
//! server, performs the handshake, and keeps the stream alive with
//! reconnect-with-backoff on every disconnect.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::RwLock;
use std::time::Duration;

use http::Uri;
use reqwest::Client as HttpClient;
use silo_core::config::{AgentConfig, TlsConfig};
use silo_core::frame::{
	Frame, FrameKind, META_AGENT_ID, META_ERROR, META_PROVISIONING_KEY, META_PROVISIONING_STATUS,
};
use silo_core::proto;
use silo_core::proto::tunnel_client::TunnelClient;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_rustls::TlsConnector;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::{Channel, Endpoint};
use tonic::Streaming;
use tower::service_fn;
use tracing::{info, warn};

use crate::forward;

const SEND_QUEUE_CAPACITY: usize = 100;
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

fn next_backoff(current: Duration) -> Duration {
	(current * 2).min(MAX_BACKOFF)
}

pub struct AgentClient {
	config: RwLock<AgentConfig>,
	config_path: Option<PathBuf>,
	http: HttpClient,
}

impl AgentClient {
	/// `config_path` is the file the config was loaded from, if any (absent
	/// when the agent was launched with an inline config). A provisioned
	/// agent id is persisted there; without a path it only lives in memory
	/// for the life of the process.
	pub fn new(config: AgentConfig, config_path: Option<PathBuf>) -> Self {
		AgentClient {
			config: RwLock::new(config),
			config_path,
			http: HttpClient::new(),
		}
	}

	fn snapshot_config(&self) -> AgentConfig {
		self.config.read().unwrap().clone()
	}

	/// Records a provisioning-assigned agent id: adopts it in memory, clears
	/// the one-time provisioning key, and persists the result to disk if a
	/// config file path is known.
	fn adopt_provisioned_identity(&self, agent_id: &str) -> anyhow::Result<()> {
		let persisted = {
			let mut config = self.config.write().unwrap();
			config.grpc.agent_id = Some(agent_id.to_string());
			config.grpc.provisioning_key = None;
			config.clone()
		};
		match &self.config_path {
			Some(path) => persisted.persist(path)?,
			None => warn!(agent_id, "no config file to persist the provisioned agent id to, it will be reprovisioned on restart"),
		}
		Ok(())
	}

	/// Runs until `shutdown` is cancelled, reconnecting on every failure with
	/// exponential backoff (1s up to 30s, reset on a successful session).
	pub async fn run(self, shutdown: CancellationToken) {
		let mut backoff = INITIAL_BACKOFF;
		while !shutdown.is_cancelled() {
			match self.run_once(&shutdown).await {
				Ok(()) => {
					info!("tunnel session ended");
					backoff = INITIAL_BACKOFF;
				},
				Err(e) => {
					warn!(error = %e, backoff_secs = backoff.as_secs(), "tunnel session failed, reconnecting");
				},
			}
			if shutdown.is_cancelled() {
				break;
			}
			tokio::select! {
				_ = tokio::time::sleep(backoff) => {},
				_ = shutdown.cancelled() => break,
			}
			backoff = next_backoff(backoff);
		}
	}

	async fn run_once(&self, shutdown: &CancellationToken) -> anyhow::Result<()> {
		let config = self.snapshot_config();
		let channel = connect_channel(&config.grpc.server_address, &config.grpc.tls).await?;
		let mut client = TunnelClient::new(channel);

		let (outbound_tx, outbound_rx) = mpsc::channel::<proto::Frame>(SEND_QUEUE_CAPACITY);

		let is_provisioning = config.grpc.provisioning_key.is_some();
		let mut handshake_meta = HashMap::new();
		if let Some(key) = &config.grpc.provisioning_key {
			handshake_meta.insert(META_PROVISIONING_KEY.to_string(), key.clone());
		}
		if let Some(id) = &config.grpc.agent_id {
			handshake_meta.insert(META_AGENT_ID.to_string(), id.clone());
		}
		let handshake = Frame::new(FrameKind::Ping, Default::default(), handshake_meta);
		outbound_tx.send(handshake.into()).await.map_err(|_| anyhow::anyhow!("outbound channel closed"))?;

		let outbound_stream = ReceiverStream::new(outbound_rx);
		let response = client.connect(outbound_stream).await?;
		let mut inbound = response.into_inner();
		info!(server = %config.grpc.server_address, "tunnel established");

		if is_provisioning {
			self.complete_provisioning(&mut inbound).await?;
		}

		loop {
			tokio::select! {
				_ = shutdown.cancelled() => {
					info!("shutdown requested, closing tunnel");
					return Ok(());
				},
				msg = inbound.message() => {
					match msg? {
						Some(proto_frame) => self.handle_inbound(proto_frame, &outbound_tx)?,
						None => {
							info!("server closed the tunnel");
							return Ok(());
						},
					}
				},
			}
		}
	}

	/// Reads exactly one frame back after a provisioning handshake. On
	/// success, adopts the assigned agent id as the durable identity and
	/// clears the one-time provisioning key; on failure, returns an error so
	/// the caller reconnects with backoff rather than looping forever on a
	/// dead provisioning key.
	async fn complete_provisioning(&self, inbound: &mut Streaming<proto::Frame>) -> anyhow::Result<()> {
		let proto_frame = inbound
			.message()
			.await?
			.ok_or_else(|| anyhow::anyhow!("server closed the tunnel before completing provisioning"))?;
		let reply: Frame = proto_frame.try_into()?;

		match reply.metadata.get(META_PROVISIONING_STATUS).map(String::as_str) {
			Some("success") => {
				let agent_id = reply
					.metadata
					.get(META_AGENT_ID)
					.ok_or_else(|| anyhow::anyhow!("provisioning succeeded but no agent_id was returned"))?;
				info!(agent_id, "provisioning succeeded, adopting assigned identity");
				self.adopt_provisioned_identity(agent_id)?;
				Ok(())
			},
			_ => {
				let message = reply.metadata.get(META_ERROR).cloned().unwrap_or_else(|| "unknown error".into());
				anyhow::bail!("provisioning failed: {message}")
			},
		}
	}

	fn handle_inbound(&self, proto_frame: proto::Frame, outbound_tx: &mpsc::Sender<proto::Frame>) -> anyhow::Result<()> {
		let frame: Frame = proto_frame.try_into()?;
		match frame.kind {
			FrameKind::Ping => {
				let tx = outbound_tx.clone();
				tokio::spawn(async move {
					let _ = tx.send(Frame::pong().into()).await;
				});
			},
			FrameKind::Pong => {},
			FrameKind::Request => {
				let tx = outbound_tx.clone();
				let http = self.http.clone();
				let base_url = self.config.read().unwrap().local.service_url.clone();
				tokio::spawn(async move {
					let response = forward::forward(&http, &base_url, frame).await;
					let _ = tx.send(response.into()).await;
				});
			},
			FrameKind::Response => {
				warn!("server sent a response frame on the agent side, ignoring");
			},
		}
		Ok(())
	}
}

/// Builds the gRPC channel to the server. Plaintext connections use tonic's
/// own connector; TLS connections use a hand-rolled one so the agent
/// presents the client certificate built by `silo_core::tls`.
async fn connect_channel(server_address: &str, tls: &TlsConfig) -> anyhow::Result<Channel> {
	let uri: Uri = server_address.parse()?;

	if !tls.enabled {
		return Ok(Endpoint::from(uri).connect().await?);
	}

	let host = uri
		.host()
		.ok_or_else(|| anyhow::anyhow!("server_address must include a host"))?
		.to_string();
	let port = uri.port_u16().unwrap_or(443);
	let client_config = silo_core::tls::client_config(tls)?;
	let server_name = silo_core::tls::server_name(tls, &host)?;

	let endpoint = Endpoint::from(uri);
	let connector = service_fn(move |_: Uri| {
		let client_config = client_config.clone();
		let server_name = server_name.clone();
		let host = host.clone();
		async move {
			let tcp = TcpStream::connect((host.as_str(), port)).await?;
			let connector = TlsConnector::from(client_config);
			let tls_stream = connector.connect(server_name, tcp).await?;
			Ok::<_, std::io::Error>(hyper_util::rt::TokioIo::new(tls_stream))
		}
	});
	Ok(endpoint.connect_with_connector(connector).await?)
}

#[cfg(test)]
mod tests {
	use super::*;
	use silo_core::config::{AgentGrpcConfig, LocalConfig};

	fn provisioning_config() -> AgentConfig {
		AgentConfig {
			grpc: AgentGrpcConfig {
				server_address: "https://example.com:9090".into(),
				provisioning_key: Some("onboard-me".into()),
				..Default::default()
			},
			local: LocalConfig {
				service_url: "http://localhost:3000".into(),
			},
			..Default::default()
		}
	}

	#[test]
	fn adopting_a_provisioned_identity_clears_the_provisioning_key() {
		let client = AgentClient::new(provisioning_config(), None);
		client.adopt_provisioned_identity("agent-assigned-1").unwrap();

		let config = client.snapshot_config();
		assert_eq!(config.grpc.agent_id, Some("agent-assigned-1".to_string()));
		assert!(config.grpc.provisioning_key.is_none());
	}

	#[test]
	fn backoff_doubles_up_to_the_cap_and_stays_there() {
		let mut backoff = INITIAL_BACKOFF;
		let mut seen = vec![backoff];
		for _ in 0..8 {
			backoff = next_backoff(backoff);
			seen.push(backoff);
		}
		assert_eq!(
			seen,
			vec![1, 2, 4, 8, 16, 30, 30, 30, 30]
				.into_iter()
				.map(Duration::from_secs)
				.collect::<Vec<_>>()
		);
	}
}
