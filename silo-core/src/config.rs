//! Recognized configuration options, plus validation.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

use crate::Error;

fn default_http_port() -> u16 {
	8080
}

fn default_grpc_port() -> u16 {
	9090
}

fn default_pool_start() -> u16 {
	8100
}

fn default_pool_end() -> u16 {
	8200
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortRange {
	#[serde(default = "default_pool_start")]
	pub start: u16,
	#[serde(default = "default_pool_end")]
	pub end: u16,
}

impl Default for PortRange {
	fn default() -> Self {
		PortRange {
			start: default_pool_start(),
			end: default_pool_end(),
		}
	}
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HttpConfig {
	pub port: u16,
	pub agent_port_range: PortRange,
	pub admin_api_key: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ClientAuth {
	None,
	Request,
	Require,
}

impl Default for ClientAuth {
	fn default() -> Self {
		ClientAuth::None
	}
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TlsConfig {
	pub enabled: bool,
	pub cert_file: Option<PathBuf>,
	pub key_file: Option<PathBuf>,
	pub ca_file: Option<PathBuf>,
	pub ca_key_file: Option<PathBuf>,
	pub client_auth: ClientAuth,
	/// Agent-side only: override the expected server name for testing.
	pub server_name_override: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GrpcConfig {
	pub port: u16,
	pub tls: TlsConfig,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProvisionConfig {
	pub enabled: bool,
	pub key_ttl_hours: u32,
	pub cleanup_interval_minutes: u32,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DbConfig {
	pub url: Option<String>,
	pub schema: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct JwtConfig {
	pub secret: Option<String>,
	pub expiration_minutes: u32,
}

/// Top-level `silo-server` configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
	#[serde(default)]
	pub http: HttpConfig,
	#[serde(default)]
	pub grpc: GrpcConfig,
	#[serde(default)]
	pub provision: ProvisionConfig,
	#[serde(default)]
	pub db: DbConfig,
	#[serde(default)]
	pub jwt: JwtConfig,
}

impl Default for ServerConfig {
	fn default() -> Self {
		ServerConfig {
			http: HttpConfig {
				port: default_http_port(),
				..Default::default()
			},
			grpc: GrpcConfig {
				port: default_grpc_port(),
				..Default::default()
			},
			provision: ProvisionConfig::default(),
			db: DbConfig::default(),
			jwt: JwtConfig::default(),
		}
	}
}

impl ServerConfig {
	pub fn validate(&self) -> Result<(), Error> {
		let range = &self.http.agent_port_range;
		if range.start > range.end || range.start < 1 {
			return Err(Error::InvalidConfig(format!(
				"invalid agent port range {}..={}",
				range.start, range.end
			)));
		}
		if self.grpc.tls.enabled {
			validate_tls_material(&self.grpc.tls, !matches!(self.grpc.tls.client_auth, ClientAuth::None))?;
		}
		if self.provision.enabled && self.grpc.tls.ca_key_file.is_none() {
			return Err(Error::InvalidConfig(
				"provisioning enabled but no CA key file configured".into(),
			));
		}
		Ok(())
	}

	pub fn load(file: Option<PathBuf>, inline: Option<Vec<u8>>) -> anyhow::Result<Self> {
		let cfg = load_config(file, inline)?;
		cfg.validate()?;
		Ok(cfg)
	}
}

/// Top-level `silo-agent` configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentHttpConfig {
	pub port: u16,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentGrpcConfig {
	pub server_address: String,
	pub agent_id: Option<String>,
	pub provisioning_key: Option<String>,
	pub tls: TlsConfig,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LocalConfig {
	pub service_url: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentConfig {
	pub http: AgentHttpConfig,
	pub grpc: AgentGrpcConfig,
	pub local: LocalConfig,
	/// Free-form values persisted alongside the agent identity on disk.
	#[serde(default)]
	pub metadata: HashMap<String, String>,
}

impl AgentConfig {
	pub fn validate(&self) -> Result<(), Error> {
		if self.grpc.server_address.is_empty() {
			return Err(Error::InvalidConfig("grpc.server_address is required".into()));
		}
		if self.grpc.agent_id.is_none() && self.grpc.provisioning_key.is_none() {
			return Err(Error::InvalidConfig(
				"either grpc.agent_id or grpc.provisioning_key must be set".into(),
			));
		}
		if self.local.service_url.is_empty() {
			return Err(Error::InvalidConfig("local.service_url is required".into()));
		}
		if self.grpc.tls.enabled {
			validate_tls_material(&self.grpc.tls, false)?;
		}
		Ok(())
	}

	pub fn load(file: Option<PathBuf>, inline: Option<Vec<u8>>) -> anyhow::Result<Self> {
		let cfg = load_config(file, inline)?;
		cfg.validate()?;
		Ok(cfg)
	}

	/// Writes the config back to `path`, in JSON if it has a `.json`
	/// extension and YAML otherwise. Used to make a provisioned agent id
	/// durable across restarts.
	pub fn persist(&self, path: &std::path::Path) -> anyhow::Result<()> {
		let is_json = path
			.extension()
			.and_then(|ext| ext.to_str())
			.map(|ext| ext.eq_ignore_ascii_case("json"))
			.unwrap_or(false);
		let serialized = if is_json {
			serde_json::to_string_pretty(self)?
		} else {
			serde_yaml::to_string(self)?
		};
		std::fs::write(path, serialized)
			.map_err(|e| anyhow::anyhow!("writing config file {}: {e}", path.display()))?;
		Ok(())
	}
}

fn validate_tls_material(tls: &TlsConfig, require_ca: bool) -> Result<(), Error> {
	if tls.cert_file.is_none() || tls.key_file.is_none() {
		return Err(Error::InvalidConfig(
			"tls.enabled requires cert_file and key_file".into(),
		));
	}
	if require_ca && tls.ca_file.is_none() {
		return Err(Error::InvalidConfig(
			"tls client_auth requires ca_file".into(),
		));
	}
	Ok(())
}

fn load_config<T: serde::de::DeserializeOwned>(
	file: Option<PathBuf>,
	inline: Option<Vec<u8>>,
) -> anyhow::Result<T> {
	let raw = match (file, inline) {
		(Some(path), None) => std::fs::read_to_string(&path)
			.map_err(|e| anyhow::anyhow!("reading config file {}: {e}", path.display()))?,
		(None, Some(bytes)) => String::from_utf8(bytes)?,
		(Some(_), Some(_)) => {
			anyhow::bail!("both a config file and inline config were provided, exiting")
		},
		(None, None) => anyhow::bail!("either a config file or inline config must be provided"),
	};
	if raw.trim_start().starts_with('{') {
		Ok(serde_json::from_str(&raw)?)
	} else {
		Ok(serde_yaml::from_str(&raw)?)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn rejects_inverted_port_range() {
		let mut cfg = ServerConfig::default();
		cfg.http.agent_port_range = PortRange { start: 200, end: 100 };
		assert!(cfg.validate().is_err());
	}

	#[test]
	fn default_config_is_valid() {
		assert!(ServerConfig::default().validate().is_ok());
	}

	#[test]
	fn agent_requires_identity() {
		let cfg = AgentConfig {
			grpc: AgentGrpcConfig {
				server_address: "https://example.com:9090".into(),
				..Default::default()
			},
			local: LocalConfig {
				service_url: "http://localhost:3000".into(),
			},
			..Default::default()
		};
		assert!(cfg.validate().is_err());
	}
}
