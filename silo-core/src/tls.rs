//! TLS material loading and rustls config construction.
//!
//! The server supports three client-auth modes (`none`, `request`,
//! `require`); the client always presents a certificate when TLS is enabled
//! and may override the expected server name for testing.

use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig as RustlsServerConfig};

use crate::config::{ClientAuth, TlsConfig};
use crate::Error;

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, Error> {
	let file = std::fs::File::open(path)
		.map_err(|e| Error::InvalidConfig(format!("opening cert {}: {e}", path.display())))?;
	let mut reader = BufReader::new(file);
	rustls_pemfile::certs(&mut reader)
		.collect::<Result<Vec<_>, _>>()
		.map_err(|e| Error::InvalidConfig(format!("parsing cert {}: {e}", path.display())))
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, Error> {
	let file = std::fs::File::open(path)
		.map_err(|e| Error::InvalidConfig(format!("opening key {}: {e}", path.display())))?;
	let mut reader = BufReader::new(file);
	rustls_pemfile::private_key(&mut reader)
		.map_err(|e| Error::InvalidConfig(format!("parsing key {}: {e}", path.display())))?
		.ok_or_else(|| Error::InvalidConfig(format!("no private key found in {}", path.display())))
}

fn load_root_store(path: &Path) -> Result<RootCertStore, Error> {
	let certs = load_certs(path)?;
	let mut store = RootCertStore::empty();
	let (_added, rejected) = store.add_parsable_certificates(certs);
	if rejected > 0 {
		tracing::warn!(path = %path.display(), rejected, "some CA certificates could not be parsed");
	}
	Ok(store)
}

/// Builds the server-side rustls config for the tunnel listener.
///
/// `client_auth` selects whether client certificates are ignored (`None`),
/// requested but not verified (`Request`), or required and chain-verified
/// (`Require`).
pub fn server_config(tls: &TlsConfig) -> Result<Arc<RustlsServerConfig>, Error> {
	let cert_path = tls
		.cert_file
		.as_deref()
		.ok_or_else(|| Error::InvalidConfig("tls.cert_file is required".into()))?;
	let key_path = tls
		.key_file
		.as_deref()
		.ok_or_else(|| Error::InvalidConfig("tls.key_file is required".into()))?;

	let certs = load_certs(cert_path)?;
	let key = load_key(key_path)?;

	let builder = RustlsServerConfig::builder();
	let config = match tls.client_auth {
		ClientAuth::None => builder
			.with_no_client_auth()
			.with_single_cert(certs, key)
			.map_err(|e| Error::InvalidConfig(format!("building server tls config: {e}")))?,
		ClientAuth::Request | ClientAuth::Require => {
			let ca_path = tls
				.ca_file
				.as_deref()
				.ok_or_else(|| Error::InvalidConfig("tls.ca_file is required for client auth".into()))?;
			let roots = Arc::new(load_root_store(ca_path)?);
			let verifier = if matches!(tls.client_auth, ClientAuth::Require) {
				WebPkiClientVerifier::builder(roots)
					.build()
					.map_err(|e| Error::InvalidConfig(format!("building client verifier: {e}")))?
			} else {
				WebPkiClientVerifier::builder(roots)
					.allow_unauthenticated()
					.build()
					.map_err(|e| Error::InvalidConfig(format!("building client verifier: {e}")))?
			};
			builder
				.with_client_cert_verifier(verifier)
				.with_single_cert(certs, key)
				.map_err(|e| Error::InvalidConfig(format!("building server tls config: {e}")))?
		},
	};
	Ok(Arc::new(config))
}

/// Builds the agent-side rustls config, presenting a client certificate
/// signed by the same CA the server trusts.
pub fn client_config(tls: &TlsConfig) -> Result<Arc<ClientConfig>, Error> {
	let ca_path = tls
		.ca_file
		.as_deref()
		.ok_or_else(|| Error::InvalidConfig("tls.ca_file is required".into()))?;
	let roots = load_root_store(ca_path)?;
	let builder = ClientConfig::builder().with_root_certificates(roots);

	let config = match (&tls.cert_file, &tls.key_file) {
		(Some(cert_path), Some(key_path)) => {
			let certs = load_certs(cert_path)?;
			let key = load_key(key_path)?;
			builder
				.with_client_auth_cert(certs, key)
				.map_err(|e| Error::InvalidConfig(format!("building client tls config: {e}")))?
		},
		_ => builder.with_no_client_auth(),
	};
	Ok(Arc::new(config))
}

/// Resolves the server name the agent should present over SNI/verification,
/// honoring the `server_name_override` escape hatch for tests.
pub fn server_name(tls: &TlsConfig, host: &str) -> Result<ServerName<'static>, Error> {
	let name = tls.server_name_override.as_deref().unwrap_or(host);
	ServerName::try_from(name.to_string())
		.map_err(|_| Error::InvalidConfig(format!("invalid server name {name}")))
}
