//! Legacy SSE upstream transport.
//!
//! One long-lived GET stream carries both notifications and responses,
//! correlated by request id. Requests are POSTed to the endpoint URL the
//! server announces in the first `endpoint` event on the stream.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::header::{ACCEPT, HeaderMap};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::{NotificationRouter, Pending, SseDecoder, Transport, UpstreamError, UpstreamNotification};
use crate::protocol::{self, Message, RequestId};
use crate::types::TargetId;

const EVENT_STREAM_MIME: &str = "text/event-stream";

/// How long to wait for the server to announce its endpoint.
const ENDPOINT_WAIT: Duration = Duration::from_secs(10);

#[derive(Debug)]
pub struct SseUpstream {
	client: reqwest::Client,
	url: String,
	headers: HeaderMap,
	target_id: TargetId,
	target_name: String,
	endpoint: tokio::sync::OnceCell<String>,
	connect_lock: tokio::sync::Mutex<bool>,
	pending: Arc<Pending>,
	router: Arc<NotificationRouter>,
	cancel: CancellationToken,
}

impl SseUpstream {
	pub fn new(
		target_id: TargetId,
		target_name: String,
		url: String,
		headers: HeaderMap,
	) -> Result<Self, UpstreamError> {
		Self::with_router(
			target_id,
			target_name,
			url,
			headers,
			Arc::new(NotificationRouter::default()),
		)
	}

	/// Used by the streamable-HTTP auto-upgrade so bound sessions keep their
	/// notification sinks across the transport switch.
	pub(super) fn with_router(
		target_id: TargetId,
		target_name: String,
		url: String,
		headers: HeaderMap,
		router: Arc<NotificationRouter>,
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
			endpoint: tokio::sync::OnceCell::new(),
			connect_lock: tokio::sync::Mutex::new(false),
			pending: Arc::new(Pending::default()),
			router,
			cancel: CancellationToken::new(),
		})
	}

	pub fn into_transport(self) -> Transport {
		Transport::Sse(self)
	}

	pub(super) fn router(&self) -> &NotificationRouter {
		&self.router
	}

	pub fn is_closed(&self) -> bool {
		self.cancel.is_cancelled()
	}

	pub fn close(&self) {
		self.cancel.cancel();
		self.pending.cancel_all();
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
		self.ensure_connected().await?;
		let endpoint = self.endpoint.get().expect("connected").clone();

		let (id, rx) = self.pending.register();
		let req = protocol::request(RequestId::Number(id), method, params);
		let body = serde_json::to_value(&req).expect("valid message");
		if let Err(e) = self.post(&endpoint, &body).await {
			self.pending.forget(id);
			return Err(e);
		}

		match tokio::time::timeout(timeout, rx).await {
			Ok(Ok(Ok(result))) => Ok(result),
			Ok(Ok(Err(rpc))) => Err(UpstreamError::Rpc(rpc)),
			Ok(Err(_)) => {
				// The reply slot was dropped: closed deliberately or stream loss.
				if self.cancel.is_cancelled() {
					Err(UpstreamError::Cancelled)
				} else {
					Err(UpstreamError::Unavailable("event stream closed".to_string()))
				}
			},
			Err(_) => {
				self.pending.forget(id);
				Err(UpstreamError::Timeout)
			},
		}
	}

	pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), UpstreamError> {
		if self.cancel.is_cancelled() {
			return Err(UpstreamError::Cancelled);
		}
		self.ensure_connected().await?;
		let endpoint = self.endpoint.get().expect("connected").clone();
		let body = serde_json::to_value(protocol::notification(method, params)).expect("valid message");
		self.post(&endpoint, &body).await?;
		Ok(())
	}

	async fn post(&self, endpoint: &str, body: &Value) -> Result<(), UpstreamError> {
		let resp = self
			.client
			.post(endpoint)
			.headers(self.headers.clone())
			.json(body)
			.send()
			.await
			.map_err(|e| UpstreamError::Unavailable(format!("http: {e}")))?;
		if !(resp.status().is_success() || resp.status() == reqwest::StatusCode::ACCEPTED) {
			return Err(UpstreamError::Unavailable(format!(
				"endpoint rejected message: http {}",
				resp.status()
			)));
		}
		Ok(())
	}

	/// Open the event stream once: wait for the `endpoint` announcement, then
	/// leave a reader task demultiplexing replies and notifications.
	async fn ensure_connected(&self) -> Result<(), UpstreamError> {
		let mut connected = self.connect_lock.lock().await;
		if *connected {
			return Ok(());
		}

		let resp = self
			.client
			.get(&self.url)
			.headers(self.headers.clone())
			.header(ACCEPT, EVENT_STREAM_MIME)
			.send()
			.await
			.map_err(|e| UpstreamError::Unavailable(format!("http: {e}")))?;
		if !resp.status().is_success() {
			return Err(UpstreamError::Unavailable(format!(
				"event stream refused: http {}",
				resp.status()
			)));
		}

		let mut decoder = SseDecoder::new();
		let mut stream = resp.bytes_stream();

		// The first event must announce the message endpoint.
		let endpoint = tokio::time::timeout(ENDPOINT_WAIT, async {
			let mut leftover: Vec<super::SseEvent> = Vec::new();
			while let Some(chunk) = stream.next().await {
				let chunk = chunk.map_err(|e| UpstreamError::Unavailable(format!("stream: {e}")))?;
				let mut events = decoder.push(&chunk).into_iter();
				while let Some(event) = events.next() {
					if event.event.as_deref() == Some("endpoint") {
						// Whatever followed the announcement in this chunk is
						// replayed to the reader task.
						leftover.extend(events);
						return Ok((event.data, leftover));
					}
					leftover.push(event);
				}
			}
			Err(UpstreamError::Unavailable(
				"event stream closed before announcing an endpoint".to_string(),
			))
		})
		.await
		.map_err(|_| UpstreamError::Unavailable("no endpoint announcement".to_string()))?;
		let (endpoint, buffered) = endpoint?;

		let endpoint = self.resolve_endpoint(&endpoint)?;
		debug!(target = %self.target_id, %endpoint, "sse endpoint announced");
		let _ = self.endpoint.set(endpoint);

		// Reader task: everything else on the stream is replies and
		// notifications.
		let pending = self.pending.clone();
		let router = self.router.clone();
		let cancel = self.cancel.clone();
		let target_id = self.target_id.clone();
		let target_name = self.target_name.clone();
		tokio::spawn(async move {
			let mut handle = |data: &str| {
				if data.is_empty() {
					return;
				}
				match Message::from_str(data) {
					Ok(Message::Response(r)) => {
						if let RequestId::Number(id) = r.id {
							if !pending.resolve(id, Ok(r.result)) {
								trace!(target = %target_id, id, "late reply discarded");
							}
						}
					},
					Ok(Message::Error(e)) => {
						if let Some(RequestId::Number(id)) = e.id {
							pending.resolve(id, Err(e.error));
						}
					},
					Ok(Message::Notification(n)) => router.publish(UpstreamNotification {
						target_id: target_id.clone(),
						target_name: target_name.clone(),
						message: n.clone(),
					}),
					Ok(Message::Request(_)) => {
						trace!(target = %target_id, "ignoring server-initiated request on sse stream")
					},
					Err(e) => warn!(target = %target_id, "bad sse payload: {e}"),
				}
			};
			for event in buffered {
				handle(&event.data);
			}
			loop {
				let chunk = tokio::select! {
					_ = cancel.cancelled() => break,
					c = stream.next() => c,
				};
				let Some(Ok(chunk)) = chunk else { break };
				for event in decoder.push(&chunk) {
					handle(&event.data);
				}
			}
			// Stream gone: fail whatever is still waiting.
			pending.cancel_all();
		});

		*connected = true;
		Ok(())
	}

	/// The announced endpoint may be absolute or relative to the stream URL.
	fn resolve_endpoint(&self, announced: &str) -> Result<String, UpstreamError> {
		if announced.starts_with("http://") || announced.starts_with("https://") {
			return Ok(announced.to_string());
		}
		let base = url::Url::parse(&self.url)
			.map_err(|e| UpstreamError::Protocol(format!("bad stream url: {e}")))?;
		base
			.join(announced)
			.map(|u| u.to_string())
			.map_err(|e| UpstreamError::Protocol(format!("bad endpoint url: {e}")))
	}
}
