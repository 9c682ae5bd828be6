//! External collaborators. This crate only consumes these as traits; the
//! real user/provisioning/audit stores and CSR/CA lifecycle live in
//! whatever deployment wires a concrete implementation in.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use http::HeaderMap;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct ProvisionOutcome {
	pub agent_id: String,
	pub cert_fingerprint: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentStatus {
	Active,
	Inactive,
}

/// Exchanges a one-time provisioning key (plus CSR handling, out of scope
/// here) for a durable agent identity.
#[async_trait]
pub trait ProvisioningService: Send + Sync {
	async fn provision(
		&self,
		provisioning_key: &str,
		remote_ip: &str,
	) -> Result<ProvisionOutcome, String>;

	async fn validate_agent(&self, agent_id: &str) -> Option<AgentStatus>;
}

/// Opaque connect/disconnect/heartbeat log.
#[async_trait]
pub trait AuditRepository: Send + Sync {
	async fn open_connection(&self, agent_id: &str, started_at: DateTime<Utc>, remote_ip: &str) -> String;
	async fn close_connection(&self, log_id: &str, ended_at: DateTime<Utc>, reason: &str);
	async fn update_last_seen(&self, agent_id: &str, at: DateTime<Utc>, remote_ip: Option<&str>);
}

#[derive(Debug)]
pub enum AuthDenied {
	MissingCredentials,
	Invalid,
}

/// Authenticates admin-surface requests. `ApiKeyAdminAuth` below covers the
/// static-key case; a real deployment may swap in JWT verification instead.
pub trait AdminAuth: Send + Sync {
	fn authenticate(&self, headers: &HeaderMap) -> Result<(), AuthDenied>;
}

/// Accepts every request. Suitable for local development and for the core's
/// own tests; never wire this into a real deployment.
pub struct PermissiveAdminAuth;

impl AdminAuth for PermissiveAdminAuth {
	fn authenticate(&self, _headers: &HeaderMap) -> Result<(), AuthDenied> {
		Ok(())
	}
}

/// Checks a static `x-admin-api-key` header against a configured value.
pub struct ApiKeyAdminAuth {
	key: String,
}

impl ApiKeyAdminAuth {
	pub fn new(key: String) -> Self {
		ApiKeyAdminAuth { key }
	}
}

impl AdminAuth for ApiKeyAdminAuth {
	fn authenticate(&self, headers: &HeaderMap) -> Result<(), AuthDenied> {
		let provided = headers
			.get("x-admin-api-key")
			.and_then(|v| v.to_str().ok())
			.ok_or(AuthDenied::MissingCredentials)?;
		if provided == self.key {
			Ok(())
		} else {
			Err(AuthDenied::Invalid)
		}
	}
}

/// Minimal in-memory agent identity store: maps known agent ids to a status.
/// Not a production user/database store, just enough for a demo deployment
/// and for tests.
pub struct InMemoryAgentRepository {
	agents: Mutex<HashMap<String, AgentStatus>>,
}

impl InMemoryAgentRepository {
	pub fn new() -> Self {
		InMemoryAgentRepository {
			agents: Mutex::new(HashMap::new()),
		}
	}

	pub fn insert(&self, agent_id: impl Into<String>, status: AgentStatus) {
		self.agents.lock().unwrap().insert(agent_id.into(), status);
	}
}

impl Default for InMemoryAgentRepository {
	fn default() -> Self {
		Self::new()
	}
}

#[async_trait]
impl ProvisioningService for InMemoryAgentRepository {
	async fn provision(
		&self,
		_provisioning_key: &str,
		_remote_ip: &str,
	) -> Result<ProvisionOutcome, String> {
		let agent_id = Uuid::new_v4().to_string();
		self.agents.lock().unwrap().insert(agent_id.clone(), AgentStatus::Active);
		Ok(ProvisionOutcome {
			agent_id,
			cert_fingerprint: None,
		})
	}

	async fn validate_agent(&self, agent_id: &str) -> Option<AgentStatus> {
		self.agents.lock().unwrap().get(agent_id).copied()
	}
}

/// Drops every audit event. Appropriate only when no real audit store is
/// wired in and structured logging (see `TracingAuditRepository`) is enough.
pub struct NullAuditRepository;

#[async_trait]
impl AuditRepository for NullAuditRepository {
	async fn open_connection(&self, _agent_id: &str, _started_at: DateTime<Utc>, _remote_ip: &str) -> String {
		Uuid::new_v4().to_string()
	}
	async fn close_connection(&self, _log_id: &str, _ended_at: DateTime<Utc>, _reason: &str) {}
	async fn update_last_seen(&self, _agent_id: &str, _at: DateTime<Utc>, _remote_ip: Option<&str>) {}
}

/// Logs audit events via `tracing` with structured fields (`agent_id`, ...)
/// rather than persisting them anywhere.
pub struct TracingAuditRepository;

#[async_trait]
impl AuditRepository for TracingAuditRepository {
	async fn open_connection(&self, agent_id: &str, started_at: DateTime<Utc>, remote_ip: &str) -> String {
		let log_id = Uuid::new_v4().to_string();
		tracing::info!(agent_id, %started_at, remote_ip, log_id, "connection opened");
		log_id
	}

	async fn close_connection(&self, log_id: &str, ended_at: DateTime<Utc>, reason: &str) {
		tracing::info!(log_id, %ended_at, reason, "connection closed");
	}

	async fn update_last_seen(&self, agent_id: &str, at: DateTime<Utc>, remote_ip: Option<&str>) {
		tracing::debug!(agent_id, %at, remote_ip, "last seen updated");
	}
}
