//! Streamable-HTTP upstream transport.
//!
//! Each request is a single POST; the server answers with JSON, with an SSE
//! body carrying notifications and then the response, or with 202 for
//! notifications. Server-pushed notifications require opt-in via a
//! long-lived GET stream. A server that announces a legacy `endpoint` event
//! is transparently upgraded to the SSE transport and the decision cached.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::StreamExt;
use parking_lot::Mutex;
use reqwest::header::{ACCEPT, HeaderMap};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::{NotificationRouter, SseDecoder, Transport, UpstreamError, UpstreamNotification, sse};
use crate::protocol::{
	self, HEADER_PROTOCOL_VERSION, HEADER_SESSION_ID, Message, RequestId,
};
use crate::types::TargetId;

const JSON_MIME: &str = "application/json";
const EVENT_STREAM_MIME: &str = "text/event-stream";

#[derive(Debug)]
pub struct HttpUpstream {
	client: reqwest::Client,
	url: String,
	headers: HeaderMap,
	target_id: TargetId,
	target_name: String,
	session_id: Mutex<Option<String>>,
	/// Cached auto-upgrade decision; once set, all traffic goes through the
	/// legacy SSE client.
	mode: Mutex<Option<Arc<sse::SseUpstream>>>,
	seq: std::sync::atomic::AtomicI64,
	router: Arc<NotificationRouter>,
	cancel: CancellationToken,
	notif_started: AtomicBool,
}

impl HttpUpstream {
	pub fn new(
		target_id: TargetId,
		target_name: String,
		url: String,
		headers: HeaderMap,
	) -> Result<Self, UpstreamError> {
		let client = reqwest::Client::builder()
			.build()
			.map_err(|e| UpstreamError::Unavailable(format!("http client: {e}")))?;
		Ok(Self {
			client,
			url,
			headers,
			target_id,
			target_name,
			session_id: Mutex::new(None),
			mode: Mutex::new(None),
			seq: std::sync::atomic::AtomicI64::new(0),
			router: Arc::new(NotificationRouter::default()),
			cancel: CancellationToken::new(),
			notif_started: AtomicBool::new(false),
		})
	}

	/// Wrap in the enum used by [`super::UpstreamClient`].
	pub fn into_transport(self) -> Transport {
		Transport::Http(self)
	}

	pub(super) fn router(&self) -> &NotificationRouter {
		&self.router
	}

	pub fn is_closed(&self) -> bool {
		self.cancel.is_cancelled()
	}

	pub fn close(&self) {
		self.cancel.cancel();
		if let Some(legacy) = self.mode.lock().clone() {
			legacy.close();
		}
	}

	pub async fn call(
		&self,
		method: &str,
		params: Option<Value>,
		timeout: Duration,
	) -> Result<Value, UpstreamError> {
		if self.cancel.is_cancelled() {
			return Err(UpstreamError::Cancelled);
		}
		if let Some(legacy) = self.legacy() {
			return legacy.call(method, params, timeout).await;
		}
		match tokio::time::timeout(timeout, self.call_streamable(method, params, timeout)).await {
			Ok(r) => r,
			Err(_) => Err(UpstreamError::Timeout),
		}
	}

	pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), UpstreamError> {
		if self.cancel.is_cancelled() {
			return Err(UpstreamError::Cancelled);
		}
		if let Some(legacy) = self.legacy() {
			return legacy.notify(method, params).await;
		}
		let body = serde_json::to_value(protocol::notification(method, params)).expect("valid message");
		let resp = self.post(&body).await?;
		if !(resp.status().is_success() || resp.status() == reqwest::StatusCode::ACCEPTED) {
			return Err(UpstreamError::Unavailable(format!(
				"notification rejected: http {}",
				resp.status()
			)));
		}
		Ok(())
	}

	fn legacy(&self) -> Option<Arc<sse::SseUpstream>> {
		self.mode.lock().clone()
	}

	async fn call_streamable(
		&self,
		method: &str,
		params: Option<Value>,
		timeout: Duration,
	) -> Result<Value, UpstreamError> {
		let id = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
		let req = protocol::request(RequestId::Number(id), method, params.clone());
		let body = serde_json::to_value(&req).expect("valid message");
		let resp = self.post(&body).await?;

		let status = resp.status();
		if status == reqwest::StatusCode::NOT_FOUND && self.session_id.lock().take().is_some() {
			return Err(UpstreamError::Unavailable(
				"upstream session expired".to_string(),
			));
		}
		if !status.is_success() {
			return Err(UpstreamError::Unavailable(format!("http {status}")));
		}
		if let Some(sid) = resp
			.headers()
			.get(HEADER_SESSION_ID)
			.and_then(|v| v.to_str().ok())
		{
			self.session_id.lock().get_or_insert_with(|| sid.to_string());
		}
		if status == reqwest::StatusCode::ACCEPTED {
			return Err(UpstreamError::Protocol(
				"upstream accepted a request without replying".to_string(),
			));
		}

		let content_type = resp
			.headers()
			.get(reqwest::header::CONTENT_TYPE)
			.and_then(|v| v.to_str().ok())
			.unwrap_or("")
			.to_string();

		if content_type.starts_with(JSON_MIME) {
			let v: Value = resp
				.json()
				.await
				.map_err(|e| UpstreamError::Unavailable(format!("reading response: {e}")))?;
			return self.extract_reply(id, v);
		}
		if content_type.starts_with(EVENT_STREAM_MIME) {
			return self.read_post_stream(id, method, params, timeout, resp).await;
		}
		Err(UpstreamError::Protocol(format!(
			"unexpected content type: {content_type}"
		)))
	}

	/// Drain the SSE body of a POST: forward interleaved notifications, return
	/// the correlated response. An `endpoint` event means the server speaks
	/// legacy SSE; upgrade and replay the call there.
	async fn read_post_stream(
		&self,
		id: i64,
		method: &str,
		params: Option<Value>,
		timeout: Duration,
		resp: reqwest::Response,
	) -> Result<Value, UpstreamError> {
		let mut decoder = SseDecoder::new();
		let mut stream = resp.bytes_stream();
		while let Some(chunk) = stream.next().await {
			let chunk = chunk.map_err(|e| UpstreamError::Unavailable(format!("stream: {e}")))?;
			for event in decoder.push(&chunk) {
				if event.event.as_deref() == Some("endpoint") {
					debug!(target = %self.target_id, "upstream announced legacy SSE endpoint; upgrading transport");
					let legacy = self.upgrade_to_legacy()?;
					return legacy.call(method, params, timeout).await;
				}
				if event.data.is_empty() {
					continue;
				}
				match Message::from_str(&event.data) {
					Ok(Message::Notification(n)) => self.router.publish(UpstreamNotification {
						target_id: self.target_id.clone(),
						target_name: self.target_name.clone(),
						message: n,
					}),
					Ok(Message::Response(r)) if r.id == RequestId::Number(id) => {
						return Ok(r.result);
					},
					Ok(Message::Error(e)) if e.id == Some(RequestId::Number(id)) => {
						return Err(UpstreamError::Rpc(e.error));
					},
					Ok(other) => trace!(target = %self.target_id, "ignoring uncorrelated message: {other:?}"),
					Err(e) => warn!(target = %self.target_id, "bad SSE payload: {e}"),
				}
			}
		}
		Err(UpstreamError::Unavailable(
			"stream ended before the response arrived".to_string(),
		))
	}

	fn upgrade_to_legacy(&self) -> Result<Arc<sse::SseUpstream>, UpstreamError> {
		let mut mode = self.mode.lock();
		if let Some(existing) = mode.clone() {
			return Ok(existing);
		}
		let legacy = Arc::new(sse::SseUpstream::with_router(
			self.target_id.clone(),
			self.target_name.clone(),
			self.url.clone(),
			self.headers.clone(),
			self.router.clone(),
		)?);
		*mode = Some(legacy.clone());
		Ok(legacy)
	}

	fn extract_reply(&self, id: i64, v: Value) -> Result<Value, UpstreamError> {
		match Message::from_value(v) {
			Ok(Message::Response(r)) if r.id == RequestId::Number(id) => Ok(r.result),
			Ok(Message::Error(e)) => Err(UpstreamError::Rpc(e.error)),
			Ok(_) => Err(UpstreamError::Protocol(
				"uncorrelated reply to request".to_string(),
			)),
			Err(e) => Err(UpstreamError::Protocol(e.to_string())),
		}
	}

	async fn post(&self, body: &Value) -> Result<reqwest::Response, UpstreamError> {
		let mut req = self
			.client
			.post(&self.url)
			.headers(self.headers.clone())
			.header(ACCEPT, format!("{JSON_MIME}, {EVENT_STREAM_MIME}"))
			.header(HEADER_PROTOCOL_VERSION, protocol::PROTOCOL_VERSION)
			.json(body);
		if let Some(sid) = self.session_id.lock().clone() {
			req = req.header(HEADER_SESSION_ID, sid);
		}
		req
			.send()
			.await
			.map_err(|e| UpstreamError::Unavailable(format!("http: {e}")))
	}

	/// Opt in to server-pushed notifications over a long-lived GET stream.
	/// Started once, on the first session bind; servers that do not support
	/// the stream simply refuse it.
	pub(super) fn ensure_notification_stream(&self) {
		if self.notif_started.swap(true, Ordering::SeqCst) {
			return;
		}
		let client = self.client.clone();
		let url = self.url.clone();
		let headers = self.headers.clone();
		let router = self.router.clone();
		let cancel = self.cancel.clone();
		let target_id = self.target_id.clone();
		let target_name = self.target_name.clone();
		let session_id = self.session_id.lock().clone();
		tokio::spawn(async move {
			loop {
				if cancel.is_cancelled() {
					return;
				}
				let mut req = client
					.get(&url)
					.headers(headers.clone())
					.header(ACCEPT, EVENT_STREAM_MIME)
					.header(HEADER_PROTOCOL_VERSION, protocol::PROTOCOL_VERSION);
				if let Some(sid) = &session_id {
					req = req.header(HEADER_SESSION_ID, sid.clone());
				}
				let resp = tokio::select! {
					_ = cancel.cancelled() => return,
					r = req.send() => r,
				};
				match resp {
					Ok(resp) if resp.status().is_success() => {
						let mut decoder = SseDecoder::new();
						let mut stream = resp.bytes_stream();
						loop {
							let chunk = tokio::select! {
								_ = cancel.cancelled() => return,
								c = stream.next() => c,
							};
							let Some(Ok(chunk)) = chunk else { break };
							for event in decoder.push(&chunk) {
								if event.data.is_empty() {
									continue;
								}
								if let Ok(Message::Notification(n)) = Message::from_str(&event.data) {
									router.publish(UpstreamNotification {
										target_id: target_id.clone(),
										target_name: target_name.clone(),
										message: n,
									});
								}
							}
						}
						// Disconnected; fall through to reconnect.
					},
					Ok(resp) => {
						// The server did not opt in to the GET stream.
						debug!(target = %target_id, status = %resp.status(), "no notification stream from upstream");
						return;
					},
					Err(e) => {
						debug!(target = %target_id, "notification stream error: {e}");
					},
				}
				tokio::select! {
					_ = cancel.cancelled() => return,
					_ = tokio::time::sleep(Duration::from_secs(5)) => {},
				}
			}
		});
	}
}
