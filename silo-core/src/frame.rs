//! The wire message exchanged over the tunnel stream.
//!
//! Encoding is delegated entirely to the `tunnel.proto` schema (see
//! `silo_core::proto::Frame`): a `Frame` here is that generated message's
//! typed, ergonomic counterpart. Converting between the two is infallible
//! except for the `kind` tag, which protobuf represents as an `i32`.

use std::collections::HashMap;

use bytes::Bytes;
use uuid::Uuid;

use crate::proto;

pub const META_METHOD: &str = "method";
pub const META_PATH: &str = "path";
pub const META_QUERY: &str = "query";
pub const META_CONTENT_TYPE: &str = "content_type";
pub const META_STATUS_CODE: &str = "status_code";
pub const META_ERROR: &str = "error";
pub const META_AGENT_ID: &str = "agent_id";
pub const META_PROVISIONING_KEY: &str = "provisioning_key";
pub const META_PROVISIONING_STATUS: &str = "provisioning_status";
pub const HEADER_PREFIX: &str = "header_";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
	Ping,
	Pong,
	Request,
	Response,
}

impl From<FrameKind> for proto::FrameKind {
	fn from(k: FrameKind) -> Self {
		match k {
			FrameKind::Ping => proto::FrameKind::Ping,
			FrameKind::Pong => proto::FrameKind::Pong,
			FrameKind::Request => proto::FrameKind::Request,
			FrameKind::Response => proto::FrameKind::Response,
		}
	}
}

impl TryFrom<proto::FrameKind> for FrameKind {
	type Error = crate::Error;

	fn try_from(k: proto::FrameKind) -> Result<Self, Self::Error> {
		match k {
			proto::FrameKind::Ping => Ok(FrameKind::Ping),
			proto::FrameKind::Pong => Ok(FrameKind::Pong),
			proto::FrameKind::Request => Ok(FrameKind::Request),
			proto::FrameKind::Response => Ok(FrameKind::Response),
			proto::FrameKind::Unspecified => {
				Err(crate::Error::Other("unspecified frame kind".into()))
			},
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
	pub id: String,
	pub kind: FrameKind,
	pub payload: Bytes,
	pub metadata: HashMap<String, String>,
}

impl Frame {
	pub fn new(kind: FrameKind, payload: Bytes, metadata: HashMap<String, String>) -> Self {
		Frame {
			id: Uuid::new_v4().to_string(),
			kind,
			payload,
			metadata,
		}
	}

	pub fn ping() -> Self {
		Frame::new(FrameKind::Ping, Bytes::new(), HashMap::new())
	}

	pub fn pong() -> Self {
		Frame::new(FrameKind::Pong, Bytes::new(), HashMap::new())
	}

	/// Builds the header_ metadata key for a given HTTP header name, preserving case.
	pub fn header_key(name: &str) -> String {
		format!("{HEADER_PREFIX}{name}")
	}

	/// Returns the HTTP header name encoded in a `header_<Name>` metadata key, if any.
	pub fn header_name(meta_key: &str) -> Option<&str> {
		meta_key.strip_prefix(HEADER_PREFIX)
	}
}

impl From<Frame> for proto::Frame {
	fn from(f: Frame) -> Self {
		proto::Frame {
			id: f.id,
			kind: proto::FrameKind::from(f.kind) as i32,
			payload: f.payload.to_vec(),
			metadata: f.metadata,
		}
	}
}

impl TryFrom<proto::Frame> for Frame {
	type Error = crate::Error;

	fn try_from(f: proto::Frame) -> Result<Self, Self::Error> {
		let kind = proto::FrameKind::try_from(f.kind)
			.map_err(|_| crate::Error::Other(format!("unknown frame kind tag {}", f.kind)))?;
		Ok(Frame {
			id: f.id,
			kind: kind.try_into()?,
			payload: Bytes::from(f.payload),
			metadata: f.metadata,
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn round_trips_through_proto() {
		let mut metadata = HashMap::new();
		metadata.insert("method".to_string(), "GET".to_string());
		metadata.insert("header_X-Request-Id".to_string(), "abc".to_string());
		let frame = Frame::new(FrameKind::Request, Bytes::from_static(b"hello"), metadata);

		let proto: proto::Frame = frame.clone().into();
		let back: Frame = proto.try_into().unwrap();

		assert_eq!(frame, back);
	}

	#[test]
	fn header_key_preserves_case() {
		let key = Frame::header_key("X-Request-Id");
		assert_eq!(key, "header_X-Request-Id");
		assert_eq!(Frame::header_name(&key), Some("X-Request-Id"));
	}

	#[test]
	fn ids_are_unique() {
		let a = Frame::ping();
		let b = Frame::ping();
		assert_ne!(a.id, b.id);
	}
}
