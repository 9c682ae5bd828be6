//! Per-agent HTTP listener lifecycle. Binds a dedicated port
//! from the pool for each registered agent, serves public HTTP traffic for
//! it through the Public HTTP Adapter, and tears it down on deregistration
//! within a bounded grace period.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use axum::routing::any;
use axum::Router;
use futures::future::join_all;
use silo_core::Error;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::dispatcher::Dispatcher;
use crate::http_adapter::{self, AgentHttpState};
use crate::port_pool::PortPool;
use crate::registry::{ListenerLifecycle, Registry};

const MAX_BIND_RETRIES: u32 = 3;
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(5);

struct ListenerHandle {
	port: u16,
	shutdown_tx: oneshot::Sender<()>,
	task: JoinHandle<()>,
}

/// Owns the bound listeners. Constructed with only a reference to the
/// dispatcher; the registry is wired in afterward via `set_registry` once
/// both it and this manager exist.
pub struct ListenerManager {
	pool: Arc<PortPool>,
	dispatcher: Arc<Dispatcher>,
	registry: RwLock<Option<Arc<Registry>>>,
	listeners: RwLock<HashMap<String, ListenerHandle>>,
}

impl ListenerManager {
	pub fn new(pool: Arc<PortPool>, dispatcher: Arc<Dispatcher>) -> Arc<Self> {
		Arc::new(ListenerManager {
			pool,
			dispatcher,
			registry: RwLock::new(None),
			listeners: RwLock::new(HashMap::new()),
		})
	}

	pub fn set_registry(&self, registry: Arc<Registry>) {
		*self.registry.write().unwrap() = Some(registry);
	}

	fn registry(&self) -> Arc<Registry> {
		self
			.registry
			.read()
			.unwrap()
			.clone()
			.expect("listener manager used before set_registry")
	}

	pub fn snapshot(&self) -> HashMap<String, u16> {
		self
			.listeners
			.read()
			.unwrap()
			.iter()
			.map(|(id, h)| (id.clone(), h.port))
			.collect()
	}

	async fn bind_with_retry(&self, agent_id: &str) -> Result<(u16, TcpListener), Error> {
		let mut last_port = 0;
		for attempt in 0..MAX_BIND_RETRIES {
			let port = self.pool.allocate(agent_id)?;
			last_port = port;
			let addr = SocketAddr::from(([0, 0, 0, 0], port));
			match TcpListener::bind(addr).await {
				Ok(listener) => return Ok((port, listener)),
				Err(e) => {
					warn!(agent_id, port, attempt, error = %e, "bind conflict, retrying");
					self.pool.release(port);
				},
			}
		}
		Err(Error::PortBindConflict {
			port: last_port,
			retries: MAX_BIND_RETRIES,
		})
	}
}

#[async_trait]
impl ListenerLifecycle for ListenerManager {
	async fn start(&self, agent_id: &str) -> Result<u16, Error> {
		if self.listeners.read().unwrap().contains_key(agent_id) {
			return Err(Error::AlreadyRegistered(agent_id.to_string()));
		}

		let (port, listener) = self.bind_with_retry(agent_id).await?;

		let state = AgentHttpState {
			agent_id: agent_id.to_string(),
			dispatcher: self.dispatcher.clone(),
			registry: self.registry(),
		};
		let app = Router::new().fallback(any(http_adapter::handle)).with_state(state);

		let (shutdown_tx, shutdown_rx) = oneshot::channel();
		let agent_id_owned = agent_id.to_string();
		let task = tokio::spawn(async move {
			let result = axum::serve(listener, app)
				.with_graceful_shutdown(async {
					let _ = shutdown_rx.await;
				})
				.await;
			if let Err(e) = result {
				warn!(agent_id = %agent_id_owned, error = %e, "listener exited with error");
			}
		});

		let mut listeners = self.listeners.write().unwrap();
		if listeners.contains_key(agent_id) {
			// lost a race with a concurrent start() for the same agent; don't
			// leak the listener task or port we just set up.
			drop(listeners);
			let _ = shutdown_tx.send(());
			task.abort();
			self.pool.release(port);
			return Err(Error::AlreadyRegistered(agent_id.to_string()));
		}
		listeners.insert(agent_id.to_string(), ListenerHandle { port, shutdown_tx, task });
		drop(listeners);
		info!(agent_id, port, "listener started");
		Ok(port)
	}

	async fn stop(&self, agent_id: &str) -> Result<(), Error> {
		let handle = self.listeners.write().unwrap().remove(agent_id);
		let Some(handle) = handle else { return Ok(()) };

		let _ = handle.shutdown_tx.send(());
		if tokio::time::timeout(SHUTDOWN_DEADLINE, handle.task).await.is_err() {
			warn!(agent_id, "listener did not drain within the shutdown deadline");
		}
		self.pool.release(handle.port);
		info!(agent_id, port = handle.port, "listener stopped");
		Ok(())
	}

	/// Stops every listener concurrently rather than one at a time, so total
	/// shutdown time is bounded by the slowest listener, not the sum of all
	/// of them.
	async fn shutdown(&self) {
		let ids: Vec<String> = self.listeners.read().unwrap().keys().cloned().collect();
		join_all(ids.into_iter().map(|id| async move {
			if let Err(e) = ListenerLifecycle::stop(self, &id).await {
				warn!(agent_id = %id, error = %e, "failed to stop listener during shutdown");
			}
		}))
		.await;
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::collaborators::NullAuditRepository;

	fn new_manager() -> (Arc<ListenerManager>, Arc<Registry>) {
		let pool = Arc::new(PortPool::new(18100, 18110).unwrap());
		let dispatcher = Dispatcher::new();
		let manager = ListenerManager::new(pool, dispatcher);
		let registry = Registry::new(Arc::new(NullAuditRepository));
		manager.set_registry(registry.clone());
		(manager, registry)
	}

	#[tokio::test]
	async fn start_binds_a_port_from_the_pool() {
		let (manager, _registry) = new_manager();
		let port = manager.start("agent-1").await.unwrap();
		assert!((18100..=18110).contains(&port));
		assert_eq!(manager.snapshot().get("agent-1"), Some(&port));
	}

	#[tokio::test]
	async fn stop_releases_the_port_and_removes_the_listener() {
		let (manager, _registry) = new_manager();
		let port = manager.start("agent-1").await.unwrap();
		manager.stop("agent-1").await.unwrap();
		assert!(manager.snapshot().get("agent-1").is_none());

		// the port should be reusable immediately after stop
		let reused = manager.start("agent-2").await.unwrap();
		assert_eq!(reused, port);
	}

	#[tokio::test]
	async fn stop_on_unknown_agent_is_a_no_op() {
		let (manager, _registry) = new_manager();
		assert!(manager.stop("ghost").await.is_ok());
	}

	#[tokio::test]
	async fn start_twice_for_the_same_agent_fails_without_leaking() {
		let (manager, _registry) = new_manager();
		let port = manager.start("agent-1").await.unwrap();
		let result = manager.start("agent-1").await;
		assert!(matches!(result, Err(Error::AlreadyRegistered(_))));
		assert_eq!(manager.snapshot().get("agent-1"), Some(&port));
	}

	#[tokio::test]
	async fn shutdown_stops_every_listener() {
		let (manager, _registry) = new_manager();
		manager.start("agent-1").await.unwrap();
		manager.start("agent-2").await.unwrap();
		assert_eq!(manager.snapshot().len(), 2);

		ListenerLifecycle::shutdown(manager.as_ref()).await;
		assert!(manager.snapshot().is_empty());
	}
}
