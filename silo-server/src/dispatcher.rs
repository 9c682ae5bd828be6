//! Request/response correlation. Tracks one outstanding
//! response slot per in-flight `REQUEST` frame id and resolves it exactly
//! once: on a matching `RESPONSE` frame, on timeout, or when the caller's
//! own future is dropped (client disconnect / request cancellation).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use silo_core::{Error, Frame};
use tokio::sync::oneshot;
use tracing::warn;

use crate::registry::Registry;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub struct Dispatcher {
	pending: Mutex<HashMap<String, oneshot::Sender<Frame>>>,
	timeout: Duration,
}

impl Dispatcher {
	pub fn new() -> Arc<Self> {
		Self::with_timeout(DEFAULT_REQUEST_TIMEOUT)
	}

	pub fn with_timeout(timeout: Duration) -> Arc<Self> {
		Arc::new(Dispatcher {
			pending: Mutex::new(HashMap::new()),
			timeout,
		})
	}

	/// Sends `frame` to `agent_id` through `registry` and waits for the
	/// matching response. The pending slot is always reclaimed on exit,
	/// including when this future itself is dropped before completing.
	pub async fn send_request(
		&self,
		registry: &Registry,
		agent_id: &str,
		frame: Frame,
	) -> Result<Frame, Error> {
		let id = frame.id.clone();
		let (tx, rx) = oneshot::channel();
		self.pending.lock().unwrap().insert(id.clone(), tx);
		let _guard = PendingGuard {
			pending: &self.pending,
			id: &id,
		};

		registry.send(agent_id, frame).await?;

		match tokio::time::timeout(self.timeout, rx).await {
			Ok(Ok(response)) => Ok(response),
			Ok(Err(_)) => Err(Error::StreamClosed),
			Err(_) => Err(Error::ResponseTimeout),
		}
	}

	/// Delivers a response to its waiting caller. Returns `false` for an
	/// unknown or already-resolved id (a late, duplicate, or post-timeout
	/// response), which is logged and dropped rather than treated as fatal.
	pub fn deliver(&self, frame: Frame) -> bool {
		let tx = self.pending.lock().unwrap().remove(&frame.id);
		match tx {
			Some(tx) => tx.send(frame).is_ok(),
			None => {
				warn!(frame_id = %frame.id, "response with no matching pending request");
				false
			},
		}
	}

	pub fn pending_count(&self) -> usize {
		self.pending.lock().unwrap().len()
	}
}

struct PendingGuard<'a> {
	pending: &'a Mutex<HashMap<String, oneshot::Sender<Frame>>>,
	id: &'a str,
}

impl Drop for PendingGuard<'_> {
	fn drop(&mut self) {
		self.pending.lock().unwrap().remove(self.id);
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::collaborators::NullAuditRepository;
	use silo_core::FrameKind;
	use std::collections::HashMap as Map;

	#[tokio::test]
	async fn delivers_matching_response() {
		let registry = Registry::new(Arc::new(NullAuditRepository));
		let (_conn, mut rx) = registry.register("a").await.unwrap();
		let dispatcher = Dispatcher::new();

		let request = Frame::new(FrameKind::Request, Default::default(), Map::new());
		let request_id = request.id.clone();

		let d2 = dispatcher.clone();
		let handle = tokio::spawn(async move {
			let forwarded = rx.recv().await.unwrap();
			assert_eq!(forwarded.id, request_id);
			let response = Frame::new(FrameKind::Response, Default::default(), Map::new());
			let response = Frame { id: forwarded.id, ..response };
			d2.deliver(response);
		});

		let response = dispatcher.send_request(&registry, "a", request).await.unwrap();
		assert_eq!(response.kind, FrameKind::Response);
		handle.await.unwrap();
		assert_eq!(dispatcher.pending_count(), 0);
	}

	#[tokio::test]
	async fn times_out_when_no_response_arrives() {
		let registry = Registry::new(Arc::new(NullAuditRepository));
		let (_conn, _rx) = registry.register("a").await.unwrap();
		let dispatcher = Dispatcher::with_timeout(Duration::from_millis(20));

		let request = Frame::new(FrameKind::Request, Default::default(), Map::new());
		let err = dispatcher.send_request(&registry, "a", request).await.unwrap_err();
		assert!(matches!(err, Error::ResponseTimeout));
		assert_eq!(dispatcher.pending_count(), 0);
	}

	#[tokio::test]
	async fn propagates_registry_send_failure() {
		let registry = Registry::new(Arc::new(NullAuditRepository));
		let dispatcher = Dispatcher::new();
		let request = Frame::new(FrameKind::Request, Default::default(), Map::new());
		let err = dispatcher.send_request(&registry, "ghost", request).await.unwrap_err();
		assert!(matches!(err, Error::AgentNotFound(_)));
		assert_eq!(dispatcher.pending_count(), 0);
	}

	#[tokio::test]
	async fn late_delivery_after_timeout_is_ignored() {
		let registry = Registry::new(Arc::new(NullAuditRepository));
		let (_conn, mut rx) = registry.register("a").await.unwrap();
		let dispatcher = Dispatcher::with_timeout(Duration::from_millis(10));

		let request = Frame::new(FrameKind::Request, Default::default(), Map::new());
		let err = dispatcher.send_request(&registry, "a", request).await.unwrap_err();
		assert!(matches!(err, Error::ResponseTimeout));

		let forwarded = rx.recv().await.unwrap();
		let response = Frame { id: forwarded.id, ..Frame::new(FrameKind::Response, Default::default(), Map::new()) };
		assert!(!dispatcher.deliver(response));
	}

	#[tokio::test]
	async fn dropping_the_caller_future_reclaims_the_pending_slot() {
		let registry = Registry::new(Arc::new(NullAuditRepository));
		let (_conn, _rx) = registry.register("a").await.unwrap();
		let dispatcher = Dispatcher::new();

		let request = Frame::new(FrameKind::Request, Default::default(), Map::new());
		let fut = dispatcher.send_request(&registry, "a", request);
		drop(fut);

		assert_eq!(dispatcher.pending_count(), 0);
	}
}
