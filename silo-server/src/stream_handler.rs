//! The `Tunnel` gRPC service: the single bidirectional stream
//! an agent opens and keeps open for the lifetime of its connection. The
//! first frame on the stream is a handshake (a provisioning key or an
//! established agent id); every frame after that is dispatched by kind.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use futures::Stream;
use silo_core::frame::{
	Frame, FrameKind, META_AGENT_ID, META_ERROR, META_PROVISIONING_KEY, META_PROVISIONING_STATUS,
};
use silo_core::{proto, Error};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status, Streaming};
use tracing::{info, warn};

use crate::collaborators::{AgentStatus, AuditRepository, ProvisioningService};
use crate::dispatcher::Dispatcher;
use crate::registry::{Registry, SEND_QUEUE_CAPACITY};

pub struct TunnelService {
	registry: Arc<Registry>,
	dispatcher: Arc<Dispatcher>,
	provisioning: Arc<dyn ProvisioningService>,
	audit: Arc<dyn AuditRepository>,
}

impl TunnelService {
	pub fn new(
		registry: Arc<Registry>,
		dispatcher: Arc<Dispatcher>,
		provisioning: Arc<dyn ProvisioningService>,
		audit: Arc<dyn AuditRepository>,
	) -> Self {
		TunnelService {
			registry,
			dispatcher,
			provisioning,
			audit,
		}
	}

	/// Resolves the first frame on a new stream to a stable agent id, either
	/// by exchanging a provisioning key or by validating a previously
	/// provisioned identity. On success, returns the agent id and the PONG
	/// frame to send back as the reply to this first frame. On failure,
	/// returns the frame to send before closing the stream (provisioning
	/// failures get a framed `provisioning_status: failed` reply; an unknown
	/// or inactive agent id gets no reply frame, just a closed stream) along
	/// with the underlying error.
	async fn handshake(&self, first: &Frame, remote_ip: &str) -> Result<(String, Frame), (Option<Frame>, Error)> {
		if let Some(key) = first.metadata.get(META_PROVISIONING_KEY) {
			match self.provisioning.provision(key, remote_ip).await {
				Ok(outcome) => {
					let mut metadata = HashMap::new();
					metadata.insert(META_PROVISIONING_STATUS.to_string(), "success".to_string());
					metadata.insert(META_AGENT_ID.to_string(), outcome.agent_id.clone());
					let reply = Frame::new(FrameKind::Pong, Bytes::new(), metadata);
					Ok((outcome.agent_id, reply))
				},
				Err(message) => {
					let mut metadata = HashMap::new();
					metadata.insert(META_PROVISIONING_STATUS.to_string(), "failed".to_string());
					metadata.insert(META_ERROR.to_string(), message.clone());
					let reply = Frame::new(FrameKind::Pong, Bytes::new(), metadata);
					Err((Some(reply), Error::HandshakeFailed(message)))
				},
			}
		} else if let Some(id) = first.metadata.get(META_AGENT_ID) {
			match self.provisioning.validate_agent(id).await {
				Some(AgentStatus::Active) => Ok((id.clone(), Frame::pong())),
				_ => Err((None, Error::HandshakeFailed(format!("unknown or inactive agent {id}")))),
			}
		} else {
			Err((
				None,
				Error::HandshakeFailed("first frame carries neither agent_id nor provisioning_key".into()),
			))
		}
	}
}

#[tonic::async_trait]
impl proto::tunnel_server::Tunnel for TunnelService {
	type ConnectStream = Pin<Box<dyn Stream<Item = Result<proto::Frame, Status>> + Send + 'static>>;

	async fn connect(
		&self,
		request: Request<Streaming<proto::Frame>>,
	) -> Result<Response<Self::ConnectStream>, Status> {
		let remote_ip = crate::tls_transport::peer_addr(&request)
			.map(|addr| addr.ip().to_string())
			.unwrap_or_default();
		let mut inbound = request.into_inner();

		let first = inbound
			.message()
			.await?
			.ok_or_else(|| Status::invalid_argument("stream closed before handshake"))?;
		let first: Frame = first.try_into().map_err(to_status)?;

		let (agent_id, handshake_reply) = match self.handshake(&first, &remote_ip).await {
			Ok(ok) => ok,
			Err((Some(reply), _err)) => {
				// deliver the failure frame, then end the stream normally
				// rather than as a gRPC error, so the agent can read it.
				let (outbound_tx, outbound_rx) = mpsc::channel(1);
				let _ = outbound_tx.send(Ok(reply.into())).await;
				drop(outbound_tx);
				let outbound_stream: Self::ConnectStream = Box::pin(ReceiverStream::new(outbound_rx));
				return Ok(Response::new(outbound_stream));
			},
			Err((None, err)) => return Err(to_status(err)),
		};

		let log_id = self.audit.open_connection(&agent_id, chrono::Utc::now(), &remote_ip).await;
		let (conn, mut send_rx) = self.registry.register(&agent_id).await.map_err(to_status)?;
		info!(agent_id, remote_ip, "tunnel connected");

		if let Err(e) = self.registry.send(&agent_id, handshake_reply).await {
			warn!(agent_id, error = %e, "failed to deliver handshake reply");
		}

		let (outbound_tx, outbound_rx) = mpsc::channel(SEND_QUEUE_CAPACITY);

		let forward_ctx = conn.ctx.clone();
		tokio::spawn(async move {
			loop {
				tokio::select! {
					_ = forward_ctx.cancelled() => break,
					frame = send_rx.recv() => {
						match frame {
							Some(frame) => {
								if outbound_tx.send(Ok(frame.into())).await.is_err() {
									break;
								}
							},
							None => break,
						}
					}
				}
			}
		});

		let registry = self.registry.clone();
		let dispatcher = self.dispatcher.clone();
		let audit = self.audit.clone();
		let agent_id_task = agent_id.clone();
		let remote_ip_task = remote_ip.clone();
		tokio::spawn(async move {
			loop {
				match inbound.message().await {
					Ok(Some(msg)) => {
						registry.update_last_seen(&agent_id_task, Some(&remote_ip_task));
						let frame: Frame = match msg.try_into() {
							Ok(f) => f,
							Err(e) => {
								warn!(agent_id = %agent_id_task, error = %e, "dropping malformed frame");
								continue;
							},
						};
						match frame.kind {
							FrameKind::Ping => {
								if let Err(e) = registry.send(&agent_id_task, Frame::pong()).await {
									warn!(agent_id = %agent_id_task, error = %e, "failed to answer ping");
								}
							},
							FrameKind::Pong => {},
							FrameKind::Response => {
								dispatcher.deliver(frame);
							},
							FrameKind::Request => {
								warn!(agent_id = %agent_id_task, "ignoring agent-initiated request frame");
							},
						}
					},
					Ok(None) => break,
					Err(e) => {
						warn!(agent_id = %agent_id_task, error = %e, "tunnel stream error");
						break;
					},
				}
			}
			registry.deregister(&agent_id_task).await;
			audit.close_connection(&log_id, chrono::Utc::now(), "stream closed").await;
			info!(agent_id = %agent_id_task, "tunnel disconnected");
		});

		let outbound_stream: Self::ConnectStream = Box::pin(ReceiverStream::new(outbound_rx));
		Ok(Response::new(outbound_stream))
	}
}

fn to_status(err: Error) -> Status {
	match &err {
		Error::AgentNotFound(_) => Status::not_found(err.to_string()),
		Error::HandshakeFailed(_) => Status::unauthenticated(err.to_string()),
		Error::AlreadyRegistered(_) => Status::already_exists(err.to_string()),
		Error::PortExhausted | Error::PortBindConflict { .. } => Status::resource_exhausted(err.to_string()),
		Error::ResponseTimeout | Error::SendTimeout => Status::deadline_exceeded(err.to_string()),
		Error::Cancelled => Status::cancelled(err.to_string()),
		Error::StreamClosed | Error::QueueFull => Status::unavailable(err.to_string()),
		Error::InvalidConfig(_) | Error::Other(_) => Status::internal(err.to_string()),
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::collaborators::{InMemoryAgentRepository, NullAuditRepository};
	use crate::dispatcher::Dispatcher;

	#[test]
	fn status_mapping_matches_http_status_intent() {
		assert_eq!(to_status(Error::AgentNotFound("a".into())).code(), tonic::Code::NotFound);
		assert_eq!(to_status(Error::ResponseTimeout).code(), tonic::Code::DeadlineExceeded);
		assert_eq!(to_status(Error::Cancelled).code(), tonic::Code::Cancelled);
		assert_eq!(to_status(Error::PortExhausted).code(), tonic::Code::ResourceExhausted);
	}

	fn test_service() -> TunnelService {
		TunnelService::new(
			Registry::new(Arc::new(NullAuditRepository)),
			Dispatcher::new(),
			Arc::new(InMemoryAgentRepository::new()),
			Arc::new(NullAuditRepository),
		)
	}

	#[tokio::test]
	async fn provisioning_success_replies_with_assigned_agent_id() {
		let service = test_service();
		let mut metadata = HashMap::new();
		metadata.insert(META_PROVISIONING_KEY.to_string(), "any-key".to_string());
		let first = Frame::new(FrameKind::Ping, Bytes::new(), metadata);

		let (agent_id, reply) = service.handshake(&first, "127.0.0.1").await.unwrap();

		assert_eq!(reply.kind, FrameKind::Pong);
		assert_eq!(reply.metadata.get(META_PROVISIONING_STATUS), Some(&"success".to_string()));
		assert_eq!(reply.metadata.get(META_AGENT_ID), Some(&agent_id));
	}

	#[tokio::test]
	async fn unknown_agent_id_fails_without_a_reply_frame() {
		let service = test_service();
		let mut metadata = HashMap::new();
		metadata.insert(META_AGENT_ID.to_string(), "ghost".to_string());
		let first = Frame::new(FrameKind::Ping, Bytes::new(), metadata);

		let (reply, err) = service.handshake(&first, "127.0.0.1").await.unwrap_err();
		assert!(reply.is_none());
		assert!(matches!(err, Error::HandshakeFailed(_)));
	}
}
