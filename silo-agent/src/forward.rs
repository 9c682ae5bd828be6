//! Forwards inbound `REQUEST` frames to the locally running service. The
//! agent never interprets the request body; it only
//! replays method, path, query, and headers against the configured local
//! service URL.

use std::collections::HashMap;
use std::time::Duration;

use reqwest::Client;
use silo_core::frame::{
	Frame, FrameKind, META_CONTENT_TYPE, META_ERROR, META_METHOD, META_PATH, META_QUERY, META_STATUS_CODE,
};

const FORWARD_TIMEOUT: Duration = Duration::from_secs(30);

/// Always returns a `RESPONSE` frame carrying the request's id, even when
/// the local service is unreachable: a forwarding failure becomes a 502,
/// not a dropped frame.
pub async fn forward(client: &Client, base_url: &str, request: Frame) -> Frame {
	match try_forward(client, base_url, &request).await {
		Ok(response) => response,
		Err(e) => error_response(&request, &e.to_string()),
	}
}

async fn try_forward(client: &Client, base_url: &str, request: &Frame) -> reqwest::Result<Frame> {
	let method: reqwest::Method = request
		.metadata
		.get(META_METHOD)
		.and_then(|m| m.parse().ok())
		.unwrap_or(reqwest::Method::GET);
	let path = request.metadata.get(META_PATH).map(String::as_str).unwrap_or("/");
	let query = request.metadata.get(META_QUERY).map(String::as_str).unwrap_or("");

	let mut url = format!("{}{}", base_url.trim_end_matches('/'), path);
	if !query.is_empty() {
		url.push('?');
		url.push_str(query);
	}

	let mut builder = client.request(method, &url).timeout(FORWARD_TIMEOUT);
	for (key, value) in &request.metadata {
		if let Some(name) = Frame::header_name(key) {
			builder = builder.header(name, value);
		}
	}
	if let Some(ct) = request.metadata.get(META_CONTENT_TYPE) {
		builder = builder.header(reqwest::header::CONTENT_TYPE, ct);
	}
	if !request.payload.is_empty() {
		builder = builder.body(request.payload.clone());
	}

	let response = builder.send().await?;
	let status = response.status().as_u16();
	let mut metadata = HashMap::new();
	metadata.insert(META_STATUS_CODE.to_string(), status.to_string());
	for (name, value) in response.headers() {
		let Ok(value) = value.to_str() else { continue };
		if name == reqwest::header::CONTENT_TYPE {
			metadata.insert(META_CONTENT_TYPE.to_string(), value.to_string());
		} else {
			metadata.insert(Frame::header_key(name.as_str()), value.to_string());
		}
	}

	let body = response.bytes().await?;
	let mut frame = Frame::new(FrameKind::Response, body, metadata);
	frame.id = request.id.clone();
	Ok(frame)
}

fn error_response(request: &Frame, message: &str) -> Frame {
	let mut metadata = HashMap::new();
	metadata.insert(META_STATUS_CODE.to_string(), "502".to_string());
	metadata.insert(META_ERROR.to_string(), message.to_string());
	Frame {
		id: request.id.clone(),
		kind: FrameKind::Response,
		payload: bytes::Bytes::new(),
		metadata,
	}
}
