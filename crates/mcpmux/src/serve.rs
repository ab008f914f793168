//! The HTTP surface: MCP over streamable HTTP with an SSE stream for
//! server-pushed notifications.
//!
//! One path, three verbs. POST carries a single JSON-RPC message or a
//! batch; GET opens the session's notification stream; DELETE closes the
//! session. Authentication is delegated to the external token verifier
//! before any session lookup.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use futures_util::StreamExt;
use http::{HeaderMap, StatusCode, header};
use serde_json::{Value, json};
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, info_span, Instrument};

use crate::errors::{ErrorKind, GatewayError};
use crate::protocol::{
	self, HEADER_PROTOCOL_VERSION, HEADER_SESSION_ID, Message, RequestId,
};
use crate::relay::{DispatchError, Relay};
use crate::session::Session;
use crate::store::{TokenVerifier, VerifyError};
use crate::types::Identity;

#[derive(Debug)]
pub struct App {
	pub relay: Arc<Relay>,
	pub verifier: Arc<dyn TokenVerifier>,
	pub request_timeout: Duration,
}

pub fn router(app: Arc<App>, path: &str) -> Router {
	Router::new()
		.route(path, get(handle_get).post(handle_post).delete(handle_delete))
		.route("/healthz", get(|| async { "ok" }))
		.with_state(app)
}

async fn handle_post(
	State(app): State<Arc<App>>,
	headers: HeaderMap,
	body: Bytes,
) -> Response {
	let identity = match authenticate(&app, &headers).await {
		Ok(i) => i,
		Err(resp) => return resp,
	};

	let parsed: Value = match serde_json::from_slice(&body) {
		Ok(v) => v,
		Err(e) => {
			return error_http(
				None,
				&GatewayError::bad_request(format!("malformed JSON-RPC: {e}")),
			);
		},
	};
	let (batch, raw_messages) = match parsed {
		Value::Array(items) => (true, items),
		other => (false, vec![other]),
	};
	if raw_messages.is_empty() {
		return error_http(None, &GatewayError::bad_request("empty batch"));
	}
	let mut messages = Vec::with_capacity(raw_messages.len());
	for raw in raw_messages {
		match Message::from_value(raw) {
			Ok(m) => messages.push(m),
			Err(e) => {
				return error_http(None, &GatewayError::bad_request(e.to_string()));
			},
		}
	}

	// Locate or mint the session.
	let (session, is_new) = match session_for_post(&app, &headers, &identity, &messages).await {
		Ok(s) => s,
		Err(resp) => return resp,
	};
	let span = info_span!("mcp_request", session = %session.id);

	async move {
		let mut responses: Vec<Value> = Vec::new();
		let mut single_error: Option<GatewayError> = None;
		for message in messages {
			match message {
				Message::Request(req) => {
					let id = req.id.clone();
					let method = req.method.clone();
					let started = std::time::Instant::now();
					let outcome =
						tokio::time::timeout(app.request_timeout, app.relay.handle(&session, req)).await;
					let outcome = match outcome {
						Ok(r) => r,
						Err(_) => Err(DispatchError::Gateway(GatewayError::new(
							ErrorKind::Timeout,
							"request timed out",
						))),
					};
					debug!(
						%method,
						elapsed_ms = started.elapsed().as_millis() as u64,
						ok = outcome.is_ok(),
						"handled"
					);
					match outcome {
						Ok(result) => {
							responses.push(serde_json::to_value(protocol::response(id, result)).expect("valid message"));
						},
						Err(DispatchError::Rpc(body)) => {
							responses.push(json!({
								"jsonrpc": protocol::JSONRPC_VERSION,
								"id": id,
								"error": body,
							}));
						},
						Err(DispatchError::Gateway(e)) => {
							if !batch {
								single_error = Some(e);
								break;
							}
							responses.push(gateway_error_envelope(Some(id), &e));
						},
					}
				},
				Message::Notification(n) => {
					app.relay.handle_notification(&session, n).await;
				},
				// Client-issued responses correlate to server-initiated
				// requests, which the gateway does not forward.
				Message::Response(_) | Message::Error(_) => {},
			}
		}

		let session_header = is_new.then(|| session.id.clone());
		if let Some(e) = single_error {
			return error_http(session_header.as_deref(), &e);
		}
		match (batch, responses.len()) {
			(false, 0) => status_response(StatusCode::ACCEPTED, session_header.as_deref()),
			(true, 0) => status_response(StatusCode::NO_CONTENT, session_header.as_deref()),
			(false, _) => json_http(
				StatusCode::OK,
				session_header.as_deref(),
				&responses.remove(0),
			),
			(true, _) => json_http(
				StatusCode::OK,
				session_header.as_deref(),
				&Value::Array(responses),
			),
		}
	}
	.instrument(span)
	.await
}

async fn handle_get(State(app): State<Arc<App>>, headers: HeaderMap) -> Response {
	let identity = match authenticate(&app, &headers).await {
		Ok(i) => i,
		Err(resp) => return resp,
	};
	let session = match existing_session(&app, &headers, &identity).await {
		Ok(s) => s,
		Err(resp) => return resp,
	};

	// Every upstream notification multiplexed through the session, until the
	// client disconnects. There is no write deadline on this stream.
	let stream = BroadcastStream::new(session.subscribe()).filter_map(|item| async move {
		match item {
			Ok(n) => {
				let data = serde_json::to_string(&n).expect("valid message");
				Some(Ok::<Event, Infallible>(Event::default().data(data)))
			},
			// A lagged reader skips what it missed; notifications are
			// advisory.
			Err(_) => None,
		}
	});
	let mut resp = Sse::new(stream)
		.keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
		.into_response();
	resp.headers_mut().insert(
		HEADER_PROTOCOL_VERSION,
		header::HeaderValue::from_static(protocol::PROTOCOL_VERSION),
	);
	resp
}

async fn handle_delete(State(app): State<Arc<App>>, headers: HeaderMap) -> Response {
	if let Err(resp) = authenticate(&app, &headers).await {
		return resp;
	}
	let Some(session_id) = header_str(&headers, HEADER_SESSION_ID) else {
		return error_http(None, &GatewayError::bad_request("session header is required"));
	};
	// Idempotent: deleting an unknown or already-closed session succeeds.
	app.relay.close_session(session_id).await;
	status_response(StatusCode::ACCEPTED, None)
}

async fn authenticate(app: &App, headers: &HeaderMap) -> Result<Identity, Response> {
	let token = headers
		.get(header::AUTHORIZATION)
		.and_then(|v| v.to_str().ok())
		.and_then(|v| v.strip_prefix("Bearer "))
		.ok_or_else(|| error_http(None, &GatewayError::auth("missing bearer token")))?;
	match app.verifier.verify(token).await {
		Ok(identity) => Ok(identity.normalize()),
		Err(VerifyError::InvalidToken) => {
			Err(error_http(None, &GatewayError::auth("invalid or expired token")))
		},
		Err(VerifyError::Unavailable(m)) => Err(error_http(
			None,
			&GatewayError::internal(format!("identity verifier unavailable: {m}")),
		)),
	}
}

async fn session_for_post(
	app: &App,
	headers: &HeaderMap,
	identity: &Identity,
	messages: &[Message],
) -> Result<(Arc<Session>, bool), Response> {
	if let Some(session_id) = header_str(headers, HEADER_SESSION_ID) {
		let session = checked_session(app, session_id, identity).await?;
		return Ok((session, false));
	}

	// No session header: only an initialize request may mint one.
	let initializes = matches!(
		messages,
		[Message::Request(r)] if r.method == protocol::METHOD_INITIALIZE
	);
	if !initializes {
		return Err(error_http(
			None,
			&GatewayError::bad_request("session header is required for non-initialize requests"),
		));
	}
	let session = app.relay.open_session(identity.clone()).await;
	Ok((session, true))
}

async fn existing_session(
	app: &App,
	headers: &HeaderMap,
	identity: &Identity,
) -> Result<Arc<Session>, Response> {
	let Some(session_id) = header_str(headers, HEADER_SESSION_ID) else {
		return Err(error_http(None, &GatewayError::bad_request("session header is required")));
	};
	checked_session(app, session_id, identity).await
}

/// Look up the session and hold the identity invariant: the snapshot must
/// equal the presented identity, or the session recycles and the caller is
/// told to re-initialize.
async fn checked_session(
	app: &App,
	session_id: &str,
	identity: &Identity,
) -> Result<Arc<Session>, Response> {
	let Some(session) = app.relay.sessions().get(session_id) else {
		return Err(error_http(
			None,
			&GatewayError::not_found("unknown session; re-initialize"),
		));
	};
	let drifted = {
		let state = session.state.lock().await;
		state.identity.drifted_from(identity)
	};
	if drifted {
		app.relay.recycle(&session, identity.clone()).await;
		return Err(error_http(None, &GatewayError::recycle_required()));
	}
	Ok(session)
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
	headers.get(name).and_then(|v| v.to_str().ok())
}

fn gateway_error_envelope(id: Option<RequestId>, e: &GatewayError) -> Value {
	json!({
		"jsonrpc": protocol::JSONRPC_VERSION,
		"id": id,
		"error": {
			"code": e.jsonrpc_code(),
			"message": e.message,
			"data": { "kind": e.kind },
		},
	})
}

fn error_http(session_id: Option<&str>, e: &GatewayError) -> Response {
	let body = gateway_error_envelope(None, e);
	base_response(e.kind.status(), session_id)
		.header(header::CONTENT_TYPE, "application/json")
		.body(axum::body::Body::from(
			serde_json::to_vec(&body).expect("valid body"),
		))
		.expect("valid response")
}

fn json_http(status: StatusCode, session_id: Option<&str>, body: &Value) -> Response {
	base_response(status, session_id)
		.header(header::CONTENT_TYPE, "application/json")
		.body(axum::body::Body::from(
			serde_json::to_vec(body).expect("valid body"),
		))
		.expect("valid response")
}

fn status_response(status: StatusCode, session_id: Option<&str>) -> Response {
	base_response(status, session_id)
		.body(axum::body::Body::empty())
		.expect("valid response")
}

fn base_response(status: StatusCode, session_id: Option<&str>) -> http::response::Builder {
	let mut builder = http::Response::builder()
		.status(status)
		.header(HEADER_PROTOCOL_VERSION, protocol::PROTOCOL_VERSION);
	if let Some(sid) = session_id {
		builder = builder.header(HEADER_SESSION_ID, sid);
	}
	builder
}
