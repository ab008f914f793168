//! The subprocess pool: long-lived local MCP child processes keyed by
//! (target, subject key).

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{PoolConfig, PoolError, PoolKey};
use crate::types::{SubjectKey, SubprocessTargetSpec, Target, env_fingerprint};
use crate::upstream::stdio::StdioUpstream;
use crate::upstream::UpstreamClient;

#[derive(Debug)]
struct Managed {
	client: Arc<UpstreamClient>,
	fingerprint: String,
	started: Instant,
	last_used: Instant,
	refcount: usize,
}

/// Per-key creation slot. The async mutex is the single-flight gate:
/// concurrent acquisitions for one key line up here and all but the first
/// find the instance already live.
#[derive(Debug, Default)]
struct Slot(tokio::sync::Mutex<Option<Managed>>);

#[derive(Debug)]
pub struct ProcessPool {
	cfg: PoolConfig,
	slots: Mutex<HashMap<PoolKey, Arc<Slot>>>,
	live: AtomicUsize,
	cancel: CancellationToken,
}

impl ProcessPool {
	pub fn new(cfg: PoolConfig) -> Self {
		Self {
			cfg,
			slots: Mutex::new(HashMap::new()),
			live: AtomicUsize::new(0),
			cancel: CancellationToken::new(),
		}
	}

	/// Start the background GC loop. Runs until [`ProcessPool::shutdown`].
	pub fn start(self: Arc<Self>) {
		let pool = self;
		tokio::spawn(async move {
			let mut tick = tokio::time::interval(pool.cfg.gc_interval);
			tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
			loop {
				tokio::select! {
					_ = pool.cancel.cancelled() => return,
					_ = tick.tick() => pool.sweep().await,
				}
			}
		});
	}

	pub fn live_count(&self) -> usize {
		self.live.load(Ordering::SeqCst)
	}

	/// Return the live instance for (target, subject key), spawning on miss.
	/// An env fingerprint mismatch replaces the instance: the old child is
	/// closed and a fresh one spawned with the new environment.
	pub async fn acquire(
		&self,
		target: &Target,
		spec: &SubprocessTargetSpec,
		subject: &SubjectKey,
		env: BTreeMap<String, String>,
		call_timeout: Duration,
	) -> Result<Arc<UpstreamClient>, PoolError> {
		let key = (target.id.clone(), subject.clone());
		let slot = self.slot(&key);
		let mut guard = slot.0.lock().await;

		let fingerprint = env_fingerprint(&env);
		if let Some(m) = guard.as_mut() {
			if m.client.is_alive() && m.fingerprint == fingerprint {
				m.refcount += 1;
				m.last_used = Instant::now();
				return Ok(m.client.clone());
			}
			// Dead child or changed credentials: drain and replace.
			debug!(target = %target.id, subject = %subject, "replacing subprocess instance");
			m.client.close().await;
			self.live.fetch_sub(1, Ordering::SeqCst);
			*guard = None;
		}

		if self.live.load(Ordering::SeqCst) >= self.cfg.max_instances {
			return Err(PoolError::CapacityExhausted(format!(
				"process pool at cap {}",
				self.cfg.max_instances
			)));
		}

		debug!(target = %target.id, subject = %subject, command = %spec.command, "spawning subprocess");
		let transport = StdioUpstream::spawn(
			target.id.clone(),
			target.name.clone(),
			&spec.command,
			&spec.args,
			&env,
		)
		.map_err(|e| PoolError::Spawn(e.to_string()))?;
		let client = Arc::new(UpstreamClient::new(
			target.id.clone(),
			target.name.clone(),
			subject.clone(),
			call_timeout,
			transport.into_transport(),
		));

		self.live.fetch_add(1, Ordering::SeqCst);
		*guard = Some(Managed {
			client: client.clone(),
			fingerprint,
			started: Instant::now(),
			last_used: Instant::now(),
			refcount: 1,
		});
		Ok(client)
	}

	/// Drop one reference. Never kills; the GC does.
	pub async fn release(&self, target_id: &str, subject: &SubjectKey) {
		let key = (target_id.to_string(), subject.clone());
		let Some(slot) = self.slots.lock().get(&key).cloned() else {
			return;
		};
		let mut guard = slot.0.lock().await;
		if let Some(m) = guard.as_mut() {
			m.refcount = m.refcount.saturating_sub(1);
			m.last_used = Instant::now();
		}
	}

	/// One GC pass: kill dead children, instances past max lifetime, and
	/// unreferenced instances past the idle TTL.
	pub async fn sweep(&self) {
		let slots: Vec<(PoolKey, Arc<Slot>)> = self
			.slots
			.lock()
			.iter()
			.map(|(k, v)| (k.clone(), v.clone()))
			.collect();
		for ((target, subject), slot) in slots {
			// A held slot is mid-acquisition; skip it this round.
			let Ok(mut guard) = slot.0.try_lock() else {
				continue;
			};
			let Some(m) = guard.as_ref() else { continue };
			let dead = !m.client.is_alive();
			let expired = m.started.elapsed() > self.cfg.max_lifetime;
			let idle = m.refcount == 0 && m.last_used.elapsed() > self.cfg.idle_ttl;
			if dead || expired || idle {
				debug!(%target, %subject, dead, expired, idle, "reaping subprocess instance");
				let m = guard.take().expect("checked above");
				m.client.close().await;
				self.live.fetch_sub(1, Ordering::SeqCst);
			}
		}
	}

	/// Kill a target's instances across all subject keys, e.g. on target
	/// restart or deletion.
	pub async fn evict_target(&self, target_id: &str) {
		let slots: Vec<Arc<Slot>> = self
			.slots
			.lock()
			.iter()
			.filter(|((t, _), _)| t == target_id)
			.map(|(_, v)| v.clone())
			.collect();
		for slot in slots {
			let mut guard = slot.0.lock().await;
			if let Some(m) = guard.take() {
				m.client.close().await;
				self.live.fetch_sub(1, Ordering::SeqCst);
			}
		}
	}

	pub async fn shutdown(&self) {
		self.cancel.cancel();
		let slots: Vec<Arc<Slot>> = self.slots.lock().values().cloned().collect();
		for slot in slots {
			let mut guard = slot.0.lock().await;
			if let Some(m) = guard.take() {
				m.client.close().await;
				self.live.fetch_sub(1, Ordering::SeqCst);
			}
		}
		if self.live.load(Ordering::SeqCst) != 0 {
			warn!("process pool shut down with nonzero live count");
		}
	}

	fn slot(&self, key: &PoolKey) -> Arc<Slot> {
		self
			.slots
			.lock()
			.entry(key.clone())
			.or_insert_with(|| Arc::new(Slot::default()))
			.clone()
	}
}

#[cfg(test)]
#[path = "process_tests.rs"]
mod tests;
