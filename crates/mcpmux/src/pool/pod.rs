//! The pod pool: remote upstream instances managed through a declarative
//! Instance resource.
//!
//! The pool never talks to pods directly until readiness: it applies the
//! desired Instance (image, port, env secret, subject key label) through the
//! [`InstanceDriver`], polls status until the controller reports `Ready`
//! with a service URL, opens a TCP probe, and only then hands out an HTTP
//! client against the resolved URL.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{PoolConfig, PoolError, PoolKey};
use crate::types::{PodTargetSpec, SubjectKey, Target, env_fingerprint};
use crate::upstream::http::HttpUpstream;
use crate::upstream::UpstreamClient;

/// The declarative record the controller reconciles. The `env` map is
/// materialized by the controller as a sibling Secret; deleting the record
/// cascades to the pod, the service, and that secret.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceSpec {
	pub name: String,
	pub target_id: String,
	pub subject_key: String,
	pub image: String,
	pub port: u16,
	#[serde(default)]
	pub command: Option<String>,
	#[serde(default)]
	pub args: Vec<String>,
	#[serde(default)]
	pub health_path: Option<String>,
	pub idle_ttl_secs: u64,
	pub max_lifetime_secs: u64,
	pub env: BTreeMap<String, String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstancePhase {
	Pending,
	Ready,
	Failed,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceStatus {
	pub phase: InstancePhase,
	#[serde(default)]
	pub service_url: Option<String>,
	#[serde(default)]
	pub last_used_at: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum DriverError {
	#[error("instance not found")]
	NotFound,
	#[error("controller unavailable: {0}")]
	Unavailable(String),
}

/// The external instance controller, seen declaratively.
#[async_trait]
pub trait InstanceDriver: Send + Sync + std::fmt::Debug {
	/// Create or update the Instance and its env secret.
	async fn apply(&self, spec: &InstanceSpec) -> Result<(), DriverError>;
	async fn status(&self, name: &str) -> Result<InstanceStatus, DriverError>;
	/// Delete the Instance; the controller cascades to pod and service.
	async fn delete(&self, name: &str) -> Result<(), DriverError>;
}

/// Production driver: JSON over HTTP against the controller.
#[derive(Debug)]
pub struct HttpInstanceDriver {
	client: reqwest::Client,
	base: String,
}

impl HttpInstanceDriver {
	pub fn new(base: impl Into<String>) -> Result<Self, DriverError> {
		let client = reqwest::Client::builder()
			.timeout(Duration::from_secs(10))
			.build()
			.map_err(|e| DriverError::Unavailable(e.to_string()))?;
		Ok(Self {
			client,
			base: base.into().trim_end_matches('/').to_string(),
		})
	}

	fn url(&self, name: &str) -> String {
		format!("{}/instances/{name}", self.base)
	}
}

#[async_trait]
impl InstanceDriver for HttpInstanceDriver {
	async fn apply(&self, spec: &InstanceSpec) -> Result<(), DriverError> {
		let resp = self
			.client
			.put(self.url(&spec.name))
			.json(spec)
			.send()
			.await
			.map_err(|e| DriverError::Unavailable(e.to_string()))?;
		if !resp.status().is_success() {
			return Err(DriverError::Unavailable(format!("apply: http {}", resp.status())));
		}
		Ok(())
	}

	async fn status(&self, name: &str) -> Result<InstanceStatus, DriverError> {
		let resp = self
			.client
			.get(self.url(name))
			.send()
			.await
			.map_err(|e| DriverError::Unavailable(e.to_string()))?;
		if resp.status() == reqwest::StatusCode::NOT_FOUND {
			return Err(DriverError::NotFound);
		}
		if !resp.status().is_success() {
			return Err(DriverError::Unavailable(format!("status: http {}", resp.status())));
		}
		resp
			.json()
			.await
			.map_err(|e| DriverError::Unavailable(e.to_string()))
	}

	async fn delete(&self, name: &str) -> Result<(), DriverError> {
		let resp = self
			.client
			.delete(self.url(name))
			.send()
			.await
			.map_err(|e| DriverError::Unavailable(e.to_string()))?;
		if !(resp.status().is_success() || resp.status() == reqwest::StatusCode::NOT_FOUND) {
			return Err(DriverError::Unavailable(format!("delete: http {}", resp.status())));
		}
		Ok(())
	}
}

/// Placeholder wired when no controller is configured: every pod target
/// acquisition fails cleanly instead of hanging.
#[derive(Debug)]
pub struct NullInstanceDriver;

#[async_trait]
impl InstanceDriver for NullInstanceDriver {
	async fn apply(&self, _: &InstanceSpec) -> Result<(), DriverError> {
		Err(DriverError::Unavailable(
			"no instance controller configured".to_string(),
		))
	}

	async fn status(&self, _: &str) -> Result<InstanceStatus, DriverError> {
		Err(DriverError::NotFound)
	}

	async fn delete(&self, _: &str) -> Result<(), DriverError> {
		Ok(())
	}
}

#[derive(Clone, Debug)]
pub struct PodPoolConfig {
	pub pool: PoolConfig,
	pub readiness_timeout: Duration,
	pub poll_interval: Duration,
}

impl Default for PodPoolConfig {
	fn default() -> Self {
		Self {
			pool: PoolConfig::default(),
			readiness_timeout: Duration::from_secs(120),
			poll_interval: Duration::from_secs(2),
		}
	}
}

#[derive(Debug)]
struct ManagedPod {
	client: Arc<UpstreamClient>,
	fingerprint: String,
	name: String,
	started: Instant,
	last_used: Instant,
	refcount: usize,
}

#[derive(Debug, Default)]
struct Slot(tokio::sync::Mutex<Option<ManagedPod>>);

#[derive(Debug)]
pub struct PodPool {
	cfg: PodPoolConfig,
	driver: Arc<dyn InstanceDriver>,
	slots: Mutex<HashMap<PoolKey, Arc<Slot>>>,
	live: AtomicUsize,
	cancel: CancellationToken,
}

impl PodPool {
	pub fn new(cfg: PodPoolConfig, driver: Arc<dyn InstanceDriver>) -> Self {
		Self {
			cfg,
			driver,
			slots: Mutex::new(HashMap::new()),
			live: AtomicUsize::new(0),
			cancel: CancellationToken::new(),
		}
	}

	pub fn start(self: Arc<Self>) {
		let pool = self;
		tokio::spawn(async move {
			let mut tick = tokio::time::interval(pool.cfg.pool.gc_interval);
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

	pub async fn acquire(
		&self,
		target: &Target,
		spec: &PodTargetSpec,
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
			debug!(target = %target.id, subject = %subject, "replacing pod instance");
			m.client.close().await;
			if let Err(e) = self.driver.delete(&m.name).await {
				warn!(instance = %m.name, "delete failed during replacement: {e}");
			}
			self.live.fetch_sub(1, Ordering::SeqCst);
			*guard = None;
		}

		if self.live.load(Ordering::SeqCst) >= self.cfg.pool.max_instances {
			return Err(PoolError::CapacityExhausted(format!(
				"pod pool at cap {}",
				self.cfg.pool.max_instances
			)));
		}

		let name = instance_name(&target.id, subject);
		let instance = InstanceSpec {
			name: name.clone(),
			target_id: target.id.clone(),
			subject_key: subject.to_string(),
			image: spec.image.clone(),
			port: spec.port,
			command: spec.command.clone(),
			args: spec.args.clone(),
			health_path: spec.health_path.clone(),
			idle_ttl_secs: self.cfg.pool.idle_ttl.as_secs(),
			max_lifetime_secs: self.cfg.pool.max_lifetime.as_secs(),
			env,
		};

		// A leftover Failed instance is deleted before recreation.
		match self.driver.status(&name).await {
			Ok(status) if status.phase == InstancePhase::Failed => {
				debug!(instance = %name, "deleting failed instance before recreate");
				self
					.driver
					.delete(&name)
					.await
					.map_err(|e| PoolError::Driver(e.to_string()))?;
			},
			_ => {},
		}

		self
			.driver
			.apply(&instance)
			.await
			.map_err(|e| PoolError::Driver(e.to_string()))?;

		let service_url = self.await_ready(&name).await?;
		tcp_probe(&service_url).await?;

		let transport = HttpUpstream::new(
			target.id.clone(),
			target.name.clone(),
			service_url,
			Default::default(),
		)?;
		let client = Arc::new(UpstreamClient::new(
			target.id.clone(),
			target.name.clone(),
			subject.clone(),
			call_timeout,
			transport.into_transport(),
		));

		self.live.fetch_add(1, Ordering::SeqCst);
		*guard = Some(ManagedPod {
			client: client.clone(),
			fingerprint,
			name,
			started: Instant::now(),
			last_used: Instant::now(),
			refcount: 1,
		});
		Ok(client)
	}

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

	pub async fn sweep(&self) {
		let slots: Vec<(PoolKey, Arc<Slot>)> = self
			.slots
			.lock()
			.iter()
			.map(|(k, v)| (k.clone(), v.clone()))
			.collect();
		for ((target, subject), slot) in slots {
			let Ok(mut guard) = slot.0.try_lock() else {
				continue;
			};
			let Some(m) = guard.as_ref() else { continue };
			let dead = !m.client.is_alive();
			let expired = m.started.elapsed() > self.cfg.pool.max_lifetime;
			let idle = m.refcount == 0 && m.last_used.elapsed() > self.cfg.pool.idle_ttl;
			if dead || expired || idle {
				debug!(%target, %subject, dead, expired, idle, "reaping pod instance");
				let m = guard.take().expect("checked above");
				m.client.close().await;
				if let Err(e) = self.driver.delete(&m.name).await {
					warn!(instance = %m.name, "delete failed during sweep: {e}");
				}
				self.live.fetch_sub(1, Ordering::SeqCst);
			}
		}
	}

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
				let _ = self.driver.delete(&m.name).await;
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
				let _ = self.driver.delete(&m.name).await;
				self.live.fetch_sub(1, Ordering::SeqCst);
			}
		}
	}

	async fn await_ready(&self, name: &str) -> Result<String, PoolError> {
		let deadline = Instant::now() + self.cfg.readiness_timeout;
		loop {
			match self.driver.status(name).await {
				Ok(status) => match status.phase {
					InstancePhase::Ready => {
						if let Some(url) = status.service_url {
							return Ok(url);
						}
						// Ready without a URL is a controller race; keep polling.
					},
					InstancePhase::Failed => {
						let _ = self.driver.delete(name).await;
						return Err(PoolError::NotReady(format!("instance {name} failed")));
					},
					InstancePhase::Pending => {},
				},
				Err(DriverError::NotFound) => {},
				Err(e) => return Err(PoolError::Driver(e.to_string())),
			}
			if Instant::now() >= deadline {
				return Err(PoolError::NotReady(format!(
					"instance {name} not ready within {:?}",
					self.cfg.readiness_timeout
				)));
			}
			tokio::time::sleep(self.cfg.poll_interval).await;
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

/// Deterministic, label-safe instance name for (target, subject key).
fn instance_name(target_id: &str, subject: &SubjectKey) -> String {
	let tid: String = target_id
		.chars()
		.map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '-' })
		.collect();
	let mut name = format!("mcp-{tid}-{subject}");
	name.truncate(63);
	name
}

/// The instance is usable only once its service port accepts connections.
async fn tcp_probe(service_url: &str) -> Result<(), PoolError> {
	let parsed = url::Url::parse(service_url)
		.map_err(|e| PoolError::NotReady(format!("bad service url {service_url}: {e}")))?;
	let host = parsed
		.host_str()
		.ok_or_else(|| PoolError::NotReady(format!("service url {service_url} has no host")))?;
	let port = parsed
		.port_or_known_default()
		.ok_or_else(|| PoolError::NotReady(format!("service url {service_url} has no port")))?;
	tokio::time::timeout(
		Duration::from_secs(5),
		tokio::net::TcpStream::connect((host, port)),
	)
	.await
	.map_err(|_| PoolError::NotReady(format!("tcp probe to {host}:{port} timed out")))?
	.map_err(|e| PoolError::NotReady(format!("tcp probe to {host}:{port} failed: {e}")))?;
	Ok(())
}

#[cfg(test)]
#[path = "pod_tests.rs"]
mod tests;
