//! Wires the tunnel's rustls configuration (three client-auth modes) into
//! a tonic server. tonic's own TLS builder only
//! supports require-or-none client auth; the "request but don't verify"
//! mode needs a rustls `ServerConfig` built by hand (`silo_core::tls`), so
//! the gRPC listener accepts connections itself and wraps each socket in a
//! `TlsAcceptor` before handing it to tonic.

use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};

use silo_core::config::TlsConfig;
use silo_core::proto::tunnel_server::TunnelServer;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tokio_stream::wrappers::{ReceiverStream, TcpListenerStream};
use tonic::transport::server::Connected;
use tonic::transport::Server;
use tracing::warn;

use crate::stream_handler::TunnelService;

/// Wraps an accepted stream with the peer address tonic's `Connected`
/// machinery needs to surface `request.extensions()` to the handler.
pub struct PeerAddrStream<T> {
	inner: T,
	addr: SocketAddr,
}

impl<T> PeerAddrStream<T> {
	fn new(inner: T, addr: SocketAddr) -> Self {
		PeerAddrStream { inner, addr }
	}
}

impl<T: AsyncRead + Unpin> AsyncRead for PeerAddrStream<T> {
	fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
		Pin::new(&mut self.inner).poll_read(cx, buf)
	}
}

impl<T: AsyncWrite + Unpin> AsyncWrite for PeerAddrStream<T> {
	fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
		Pin::new(&mut self.inner).poll_write(cx, buf)
	}
	fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
		Pin::new(&mut self.inner).poll_flush(cx)
	}
	fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
		Pin::new(&mut self.inner).poll_shutdown(cx)
	}
}

impl<T> Connected for PeerAddrStream<T> {
	type ConnectInfo = SocketAddr;

	fn connect_info(&self) -> Self::ConnectInfo {
		self.addr
	}
}

/// Reads the peer address the `Tunnel::connect` handler should audit-log,
/// whether the connection came in plaintext (tonic's own `TcpConnectInfo`)
/// or through our hand-rolled acceptor (a bare `SocketAddr`).
pub fn peer_addr(request: &tonic::Request<tonic::Streaming<silo_core::proto::Frame>>) -> Option<SocketAddr> {
	if let Some(addr) = request.extensions().get::<SocketAddr>() {
		return Some(*addr);
	}
	request.remote_addr()
}

fn tls_incoming(listener: TcpListener, acceptor: TlsAcceptor) -> ReceiverStream<std::io::Result<PeerAddrStream<TlsStream<TcpStream>>>> {
	let (tx, rx) = tokio::sync::mpsc::channel(16);
	tokio::spawn(async move {
		loop {
			let (stream, addr) = match listener.accept().await {
				Ok(pair) => pair,
				Err(e) => {
					warn!(error = %e, "accept failed on tunnel listener");
					continue;
				},
			};
			let acceptor = acceptor.clone();
			let tx = tx.clone();
			tokio::spawn(async move {
				match acceptor.accept(stream).await {
					Ok(tls_stream) => {
						let _ = tx.send(Ok(PeerAddrStream::new(tls_stream, addr))).await;
					},
					Err(e) => warn!(%addr, error = %e, "tls handshake failed"),
				}
			});
		}
	});
	ReceiverStream::new(rx)
}

pub async fn serve(
	addr: SocketAddr,
	tls: &TlsConfig,
	service: TunnelService,
	shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
	let listener = TcpListener::bind(addr).await?;
	let server = Server::builder().add_service(TunnelServer::new(service));

	if tls.enabled {
		let rustls_config = silo_core::tls::server_config(tls)?;
		let acceptor = TlsAcceptor::from(rustls_config);
		server
			.serve_with_incoming_shutdown(tls_incoming(listener, acceptor), shutdown)
			.await?;
	} else {
		server
			.serve_with_incoming_shutdown(TcpListenerStream::new(listener), shutdown)
			.await?;
	}
	Ok(())
}
