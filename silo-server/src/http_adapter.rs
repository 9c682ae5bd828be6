//! Public HTTP Adapter, server side. Converts an inbound
//! HTTP request on an agent's public port into a `REQUEST` frame, and the
//! matching `RESPONSE` frame back into an HTTP response.

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use silo_core::frame::{
	Frame, FrameKind, META_CONTENT_TYPE, META_METHOD, META_PATH, META_QUERY, META_STATUS_CODE,
};
use silo_core::Error;

use crate::dispatcher::Dispatcher;
use crate::registry::Registry;

const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

#[derive(Clone)]
pub struct AgentHttpState {
	pub agent_id: String,
	pub dispatcher: Arc<Dispatcher>,
	pub registry: Arc<Registry>,
}

pub async fn handle(State(state): State<AgentHttpState>, req: Request) -> Response {
	let frame = match request_to_frame(req).await {
		Ok(f) => f,
		Err(_) => return (StatusCode::PAYLOAD_TOO_LARGE, "request body too large").into_response(),
	};

	match state.dispatcher.send_request(&state.registry, &state.agent_id, frame).await {
		Ok(response) => frame_to_response(response),
		Err(e) => error_response(e),
	}
}

async fn request_to_frame(req: Request) -> Result<Frame, axum::Error> {
	let method = req.method().to_string();
	let uri = req.uri().clone();
	let path = uri.path().to_string();
	let query = uri.query().unwrap_or("").to_string();
	let headers = req.headers().clone();

	let body = axum::body::to_bytes(req.into_body(), MAX_BODY_BYTES).await?;

	let mut metadata = HashMap::new();
	metadata.insert(META_METHOD.to_string(), method);
	metadata.insert(META_PATH.to_string(), path);
	metadata.insert(META_QUERY.to_string(), query);
	for (name, value) in headers.iter() {
		let Ok(value) = value.to_str() else { continue };
		if name == header::CONTENT_TYPE {
			metadata.insert(META_CONTENT_TYPE.to_string(), value.to_string());
		} else {
			metadata.insert(Frame::header_key(name.as_str()), value.to_string());
		}
	}

	Ok(Frame::new(FrameKind::Request, body, metadata))
}

fn frame_to_response(frame: Frame) -> Response {
	let status = frame
		.metadata
		.get(META_STATUS_CODE)
		.and_then(|s| s.parse::<u16>().ok())
		.and_then(|code| StatusCode::from_u16(code).ok())
		.unwrap_or(StatusCode::OK);

	let mut builder = Response::builder().status(status);
	if let Some(ct) = frame.metadata.get(META_CONTENT_TYPE) {
		builder = builder.header(header::CONTENT_TYPE, ct);
	}
	for (key, value) in &frame.metadata {
		if let Some(name) = Frame::header_name(key) {
			builder = builder.header(name, value);
		}
	}

	builder
		.body(Body::from(frame.payload))
		.unwrap_or_else(|_| (StatusCode::BAD_GATEWAY, "malformed response from agent").into_response())
}

fn error_response(err: Error) -> Response {
	let status = StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
	(status, err.to_string()).into_response()
}

#[cfg(test)]
mod tests {
	use super::*;
	use axum::http::Request as HttpRequest;

	#[tokio::test]
	async fn request_to_frame_captures_method_path_query_and_headers() {
		let req = HttpRequest::builder()
			.method("POST")
			.uri("/widgets/1?verbose=true")
			.header("content-type", "application/json")
			.header("x-request-id", "abc-123")
			.body(Body::from("{\"ok\":true}"))
			.unwrap();

		let frame = request_to_frame(req).await.unwrap();
		assert_eq!(frame.metadata.get(META_METHOD).unwrap(), "POST");
		assert_eq!(frame.metadata.get(META_PATH).unwrap(), "/widgets/1");
		assert_eq!(frame.metadata.get(META_QUERY).unwrap(), "verbose=true");
		assert_eq!(frame.metadata.get(META_CONTENT_TYPE).unwrap(), "application/json");
		assert_eq!(
			frame.metadata.get(&Frame::header_key("x-request-id")).unwrap(),
			"abc-123"
		);
		assert_eq!(&frame.payload[..], b"{\"ok\":true}");
	}

	#[test]
	fn frame_to_response_honors_status_and_headers() {
		let mut metadata = HashMap::new();
		metadata.insert(META_STATUS_CODE.to_string(), "201".to_string());
		metadata.insert(Frame::header_key("x-created"), "yes".to_string());
		let frame = Frame::new(FrameKind::Response, bytes::Bytes::from_static(b"ok"), metadata);

		let response = frame_to_response(frame);
		assert_eq!(response.status(), StatusCode::CREATED);
		assert_eq!(response.headers().get("x-created").unwrap(), "yes");
	}

	#[test]
	fn frame_to_response_defaults_to_200() {
		let frame = Frame::new(FrameKind::Response, bytes::Bytes::new(), HashMap::new());
		let response = frame_to_response(frame);
		assert_eq!(response.status(), StatusCode::OK);
	}
}
