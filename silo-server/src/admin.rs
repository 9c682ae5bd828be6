//! Admin HTTP surface: `/healthz`, `/readyz`, and `/agents`. Not part of the
//! tunnel protocol itself, but every long-running service in this stack
//! carries one for operators and load balancers.

use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use axum::Router;
use serde::Serialize;

use crate::collaborators::AdminAuth;
use crate::listener_manager::ListenerManager;
use crate::registry::Registry;

#[derive(Clone)]
pub struct AdminState {
	pub registry: Arc<Registry>,
	pub listeners: Arc<ListenerManager>,
	pub auth: Arc<dyn AdminAuth>,
}

pub fn router(state: AdminState) -> Router {
	Router::new()
		.route("/healthz", get(healthz))
		.route("/readyz", get(readyz))
		.route("/agents", get(list_agents))
		.with_state(state)
}

async fn healthz() -> &'static str {
	"ok"
}

async fn readyz() -> &'static str {
	"ok"
}

#[derive(Serialize)]
struct AgentSummary {
	agent_id: String,
	port: Option<u16>,
}

async fn list_agents(State(state): State<AdminState>, headers: HeaderMap) -> impl IntoResponse {
	if state.auth.authenticate(&headers).is_err() {
		return (StatusCode::UNAUTHORIZED, "unauthorized").into_response();
	}
	let ports = state.listeners.snapshot();
	let agents: Vec<AgentSummary> = state
		.registry
		.list()
		.into_iter()
		.map(|id| {
			let port = ports.get(&id).copied();
			AgentSummary { agent_id: id, port }
		})
		.collect();
	Json(agents).into_response()
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::collaborators::{NullAuditRepository, PermissiveAdminAuth};
	use crate::dispatcher::Dispatcher;
	use crate::port_pool::PortPool;
	use axum::body::Body;
	use axum::http::Request;
	use tower::ServiceExt;

	fn test_state() -> AdminState {
		let registry = Registry::new(Arc::new(NullAuditRepository));
		let pool = Arc::new(PortPool::new(19100, 19110).unwrap());
		let listeners = ListenerManager::new(pool, Dispatcher::new());
		listeners.set_registry(registry.clone());
		AdminState {
			registry,
			listeners,
			auth: Arc::new(PermissiveAdminAuth),
		}
	}

	#[tokio::test]
	async fn healthz_is_always_ok() {
		let app = router(test_state());
		let response = app
			.oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
			.await
			.unwrap();
		assert_eq!(response.status(), StatusCode::OK);
	}

	#[tokio::test]
	async fn agents_lists_registered_connections() {
		let state = test_state();
		state.registry.register("agent-1").await.unwrap();
		let app = router(state);
		let response = app
			.oneshot(Request::builder().uri("/agents").body(Body::empty()).unwrap())
			.await
			.unwrap();
		assert_eq!(response.status(), StatusCode::OK);
	}
}
