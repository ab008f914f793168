//! The transport-abstract upstream client layer.
//!
//! One [`UpstreamClient`] speaks to a single upstream MCP server over one of
//! the supported transports and offers the same contract regardless:
//! correlated request/response via `call`, fire-and-forget `notify`, a
//! rebindable notification stream, and idempotent `close`.

mod codec;
pub mod http;
pub mod sse;
pub mod stdio;

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

pub(crate) use codec::{SseDecoder, SseEvent};

use crate::protocol::{self, ErrorBody, JsonRpcNotification};
use crate::types::{SubjectKey, TargetId};

#[derive(Error, Debug)]
pub enum UpstreamError {
	#[error("upstream call timed out")]
	Timeout,
	#[error("upstream unavailable: {0}")]
	Unavailable(String),
	#[error("call cancelled")]
	Cancelled,
	/// The upstream answered with a JSON-RPC error; passed through verbatim.
	#[error("upstream error {}: {}", .0.code, .0.message)]
	Rpc(ErrorBody),
	#[error("protocol violation: {0}")]
	Protocol(String),
}

/// A notification received from an upstream, tagged with its origin.
#[derive(Clone, Debug)]
pub struct UpstreamNotification {
	pub target_id: TargetId,
	pub target_name: String,
	pub message: JsonRpcNotification,
}

type CallReply = Result<Value, ErrorBody>;

/// In-flight request correlation: request id to reply slot. Dropping a slot
/// fails the waiting caller with `Cancelled`.
#[derive(Debug, Default)]
pub(crate) struct Pending {
	next_id: AtomicI64,
	slots: Mutex<HashMap<i64, oneshot::Sender<CallReply>>>,
}

impl Pending {
	pub fn register(&self) -> (i64, oneshot::Receiver<CallReply>) {
		let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
		let (tx, rx) = oneshot::channel();
		self.slots.lock().insert(id, tx);
		(id, rx)
	}

	pub fn resolve(&self, id: i64, reply: CallReply) -> bool {
		match self.slots.lock().remove(&id) {
			Some(tx) => tx.send(reply).is_ok(),
			None => false,
		}
	}

	/// Free the slot without replying; a late reply for it is discarded.
	pub fn forget(&self, id: i64) {
		self.slots.lock().remove(&id);
	}

	/// Drop every slot, failing all waiting callers.
	pub fn cancel_all(&self) {
		self.slots.lock().clear();
	}
}

/// Fan-out of upstream notifications to bound sessions.
///
/// Sessions are referenced only by id and channel; nothing here keeps a
/// session alive. A slow session loses notifications rather than stalling
/// the demux loop, with a warning.
#[derive(Debug, Default)]
pub(crate) struct NotificationRouter {
	sinks: Mutex<HashMap<String, mpsc::Sender<UpstreamNotification>>>,
}

impl NotificationRouter {
	pub fn bind(&self, session_id: &str, tx: mpsc::Sender<UpstreamNotification>) {
		self.sinks.lock().insert(session_id.to_string(), tx);
	}

	pub fn unbind(&self, session_id: &str) {
		self.sinks.lock().remove(session_id);
	}

	pub fn publish(&self, n: UpstreamNotification) {
		let mut dead = Vec::new();
		{
			let sinks = self.sinks.lock();
			for (sid, tx) in sinks.iter() {
				match tx.try_send(n.clone()) {
					Ok(()) => {},
					Err(mpsc::error::TrySendError::Full(_)) => {
						warn!(session = %sid, method = %n.message.method, "notification dropped: session stream full");
					},
					Err(mpsc::error::TrySendError::Closed(_)) => dead.push(sid.clone()),
				}
			}
		}
		if !dead.is_empty() {
			let mut sinks = self.sinks.lock();
			for sid in dead {
				sinks.remove(&sid);
			}
		}
	}
}

#[derive(Debug)]
pub enum Transport {
	Http(http::HttpUpstream),
	Sse(sse::SseUpstream),
	Stdio(stdio::StdioUpstream),
}

/// A client for one upstream, keyed by (target, subject key).
#[derive(Debug)]
pub struct UpstreamClient {
	pub target_id: TargetId,
	pub target_name: String,
	pub subject: SubjectKey,
	/// Default per-call timeout; resolvable per target via the `TIMEOUT`
	/// credential key.
	pub timeout: Duration,
	transport: Transport,
	init: tokio::sync::OnceCell<Value>,
}

impl UpstreamClient {
	pub fn new(
		target_id: TargetId,
		target_name: String,
		subject: SubjectKey,
		timeout: Duration,
		transport: Transport,
	) -> Self {
		Self {
			target_id,
			target_name,
			subject,
			timeout,
			transport,
			init: tokio::sync::OnceCell::new(),
		}
	}

	/// Issue a correlated request and await the result.
	pub async fn call(
		&self,
		method: &str,
		params: Option<Value>,
		timeout: Duration,
	) -> Result<Value, UpstreamError> {
		match &self.transport {
			Transport::Http(t) => t.call(method, params, timeout).await,
			Transport::Sse(t) => t.call(method, params, timeout).await,
			Transport::Stdio(t) => t.call(method, params, timeout).await,
		}
	}

	pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), UpstreamError> {
		match &self.transport {
			Transport::Http(t) => t.notify(method, params).await,
			Transport::Sse(t) => t.notify(method, params).await,
			Transport::Stdio(t) => t.notify(method, params).await,
		}
	}

	/// Bind a session's notification sink. Rebinding replaces the previous
	/// sink for that session; notifications preserve upstream emission order.
	pub fn bind_notifications(&self, session_id: &str, tx: mpsc::Sender<UpstreamNotification>) {
		self.router().bind(session_id, tx);
		// Transports that need to opt in to server-pushed messages do so on
		// first bind.
		if let Transport::Http(t) = &self.transport {
			t.ensure_notification_stream();
		}
	}

	pub fn unbind_notifications(&self, session_id: &str) {
		self.router().unbind(session_id);
	}

	/// Idempotent close: cancels pending replies and releases the transport.
	pub async fn close(&self) {
		debug!(target = %self.target_id, subject = %self.subject, "closing upstream client");
		match &self.transport {
			Transport::Http(t) => t.close(),
			Transport::Sse(t) => t.close(),
			Transport::Stdio(t) => t.close().await,
		}
	}

	/// Whether the transport can still carry calls. Subprocesses report
	/// death of the child; the others report closure.
	pub fn is_alive(&self) -> bool {
		match &self.transport {
			Transport::Http(t) => !t.is_closed(),
			Transport::Sse(t) => !t.is_closed(),
			Transport::Stdio(t) => t.is_alive(),
		}
	}

	/// Run the MCP handshake once and cache the upstream's `initialize`
	/// result.
	pub async fn ensure_initialized(&self) -> Result<&Value, UpstreamError> {
		self
			.init
			.get_or_try_init(|| async {
				let params = serde_json::json!({
					"protocolVersion": protocol::PROTOCOL_VERSION,
					"capabilities": {},
					"clientInfo": {
						"name": "mcpmux",
						"version": env!("CARGO_PKG_VERSION"),
					},
				});
				let result = self
					.call(protocol::METHOD_INITIALIZE, Some(params), self.timeout)
					.await?;
				self.notify(protocol::NOTIF_INITIALIZED, None).await?;
				Ok(result)
			})
			.await
	}

	pub fn initialize_result(&self) -> Option<&Value> {
		self.init.get()
	}

	fn router(&self) -> &NotificationRouter {
		match &self.transport {
			Transport::Http(t) => t.router(),
			Transport::Sse(t) => t.router(),
			Transport::Stdio(t) => t.router(),
		}
	}
}

#[cfg(test)]
#[path = "upstream_tests.rs"]
mod tests;
