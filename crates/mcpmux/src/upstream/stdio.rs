//! Subprocess upstream transport: line-delimited JSON over stdin/stdout.
//!
//! Stdout is demultiplexed into replies (messages with an id) and
//! notifications (messages without). Stderr is diagnostic only and is kept
//! in a bounded ring buffer per instance.

use std::collections::{BTreeMap, VecDeque};
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::{Pending, NotificationRouter, Transport, UpstreamError, UpstreamNotification};
use crate::protocol::{self, Message, RequestId};
use crate::types::TargetId;

/// Lines of stderr retained per instance for diagnostics.
const STDERR_RING: usize = 128;

#[derive(Debug)]
pub struct StdioUpstream {
	stdin_tx: mpsc::UnboundedSender<String>,
	pending: Arc<Pending>,
	router: Arc<NotificationRouter>,
	child: Arc<Mutex<tokio::process::Child>>,
	alive: Arc<AtomicBool>,
	cancel: CancellationToken,
	stderr_tail: Arc<Mutex<VecDeque<String>>>,
	target_id: TargetId,
}

impl StdioUpstream {
	/// Spawn the child with exactly the resolved environment (plus PATH so
	/// interpreters resolve). Reader tasks start immediately.
	pub fn spawn(
		target_id: TargetId,
		target_name: String,
		command: &str,
		args: &[String],
		env: &BTreeMap<String, String>,
	) -> Result<Self, UpstreamError> {
		let mut cmd = Command::new(command);
		cmd.args(args);
		cmd.env_clear().envs(env);
		if !env.contains_key("PATH") {
			if let Some(path) = std::env::var_os("PATH") {
				cmd.env("PATH", path);
			}
		}
		cmd.stdin(Stdio::piped());
		cmd.stdout(Stdio::piped());
		cmd.stderr(Stdio::piped());
		cmd.kill_on_drop(true);

		let mut child = cmd
			.spawn()
			.map_err(|e| UpstreamError::Unavailable(format!("failed to spawn '{command}': {e}")))?;

		let stdin = child
			.stdin
			.take()
			.ok_or_else(|| UpstreamError::Unavailable("child stdin unavailable".to_string()))?;
		let stdout = child
			.stdout
			.take()
			.ok_or_else(|| UpstreamError::Unavailable("child stdout unavailable".to_string()))?;
		let stderr = child
			.stderr
			.take()
			.ok_or_else(|| UpstreamError::Unavailable("child stderr unavailable".to_string()))?;

		let (stdin_tx, mut stdin_rx) = mpsc::unbounded_channel::<String>();
		let pending = Arc::new(Pending::default());
		let router = Arc::new(NotificationRouter::default());
		let alive = Arc::new(AtomicBool::new(true));
		let cancel = CancellationToken::new();
		let stderr_tail = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_RING)));

		// Writer: frame one JSON object per line.
		tokio::spawn(async move {
			let mut stdin = stdin;
			while let Some(msg) = stdin_rx.recv().await {
				let line = format!("{msg}\n");
				if stdin.write_all(line.as_bytes()).await.is_err() {
					break;
				}
			}
		});

		// Demux: stdout lines with an id resolve replies, without an id they
		// are notifications. EOF means the child is gone.
		{
			let pending = pending.clone();
			let router = router.clone();
			let alive = alive.clone();
			let target_id = target_id.clone();
			let stdin_tx = stdin_tx.clone();
			tokio::spawn(async move {
				let mut lines = BufReader::new(stdout).lines();
				while let Ok(Some(line)) = lines.next_line().await {
					let line = line.trim();
					if line.is_empty() {
						continue;
					}
					match Message::from_str(line) {
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
							message: n,
						}),
						Ok(Message::Request(r)) => {
							// Server-initiated requests (sampling, roots) are not
							// multiplexable; answer method-not-found.
							let err = protocol::error_response(
								Some(r.id),
								protocol::CODE_METHOD_NOT_FOUND,
								"not supported by gateway",
							);
							let _ = stdin_tx.send(serde_json::to_string(&err).expect("valid message"));
						},
						Err(e) => warn!(target = %target_id, "bad line from child: {e}"),
					}
				}
				debug!(target = %target_id, "child stdout closed");
				alive.store(false, Ordering::SeqCst);
				pending.cancel_all();
			});
		}

		// Stderr is diagnostics, never an error condition.
		{
			let tail = stderr_tail.clone();
			let target_id = target_id.clone();
			tokio::spawn(async move {
				let mut lines = BufReader::new(stderr).lines();
				while let Ok(Some(line)) = lines.next_line().await {
					debug!(target = %target_id, "child stderr: {line}");
					let mut tail = tail.lock();
					if tail.len() == STDERR_RING {
						tail.pop_front();
					}
					tail.push_back(line);
				}
			});
		}

		Ok(Self {
			stdin_tx,
			pending,
			router,
			child: Arc::new(Mutex::new(child)),
			alive,
			cancel,
			stderr_tail,
			target_id,
		})
	}

	pub fn into_transport(self) -> Transport {
		Transport::Stdio(self)
	}

	pub(super) fn router(&self) -> &NotificationRouter {
		&self.router
	}

	pub fn is_alive(&self) -> bool {
		self.alive.load(Ordering::SeqCst) && !self.cancel.is_cancelled()
	}

	/// The retained stderr tail, oldest first.
	pub fn stderr_tail(&self) -> Vec<String> {
		self.stderr_tail.lock().iter().cloned().collect()
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
		if !self.is_alive() {
			return Err(UpstreamError::Unavailable("process exited".to_string()));
		}
		let (id, rx) = self.pending.register();
		let req = protocol::request(RequestId::Number(id), method, params);
		if self
			.stdin_tx
			.send(serde_json::to_string(&req).expect("valid message"))
			.is_err()
		{
			self.pending.forget(id);
			return Err(UpstreamError::Unavailable("stdin closed".to_string()));
		}
		match tokio::time::timeout(timeout, rx).await {
			Ok(Ok(Ok(result))) => Ok(result),
			Ok(Ok(Err(rpc))) => Err(UpstreamError::Rpc(rpc)),
			Ok(Err(_)) => {
				if self.cancel.is_cancelled() {
					Err(UpstreamError::Cancelled)
				} else {
					Err(UpstreamError::Unavailable("process exited".to_string()))
				}
			},
			Err(_) => {
				self.pending.forget(id);
				Err(UpstreamError::Timeout)
			},
		}
	}

	pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), UpstreamError> {
		if !self.is_alive() {
			return Err(UpstreamError::Unavailable("process exited".to_string()));
		}
		let n = protocol::notification(method, params);
		self
			.stdin_tx
			.send(serde_json::to_string(&n).expect("valid message"))
			.map_err(|_| UpstreamError::Unavailable("stdin closed".to_string()))
	}

	/// Idempotent: cancels pending replies and kills the child.
	pub async fn close(&self) {
		if self.cancel.is_cancelled() {
			return;
		}
		self.cancel.cancel();
		self.pending.cancel_all();
		self.alive.store(false, Ordering::SeqCst);
		let _ = self.child.lock().start_kill();
	}
}
