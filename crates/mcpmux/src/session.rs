//! Per-session state: identity snapshot, bound upstreams, aggregated
//! catalog, and the notification plumbing.
//!
//! Requests within one session are serialized by the state mutex so identity
//! checks and catalog mutation never interleave. The session manager is a
//! plain map; binding, recycling, and closing are driven by the relay.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tracing::debug;

use crate::protocol::{CatalogSurface, JsonRpcNotification};
use crate::types::{Identity, Target, TargetId};
use crate::upstream::{UpstreamClient, UpstreamNotification};

/// Queue depths for upstream-to-session and session-to-client notification
/// channels.
const NOTIF_BUFFER: usize = 256;

#[derive(Clone, Debug)]
pub struct SessionConfig {
	pub timeout: Duration,
	pub cleanup_interval: Duration,
	pub max_sessions: usize,
}

impl Default for SessionConfig {
	fn default() -> Self {
		Self {
			timeout: Duration::from_secs(1800),
			cleanup_interval: Duration::from_secs(60),
			max_sessions: 1024,
		}
	}
}

/// One upstream bound into a session.
#[derive(Debug, Clone)]
pub struct BoundUpstream {
	pub target: Arc<Target>,
	pub client: Arc<UpstreamClient>,
}

/// A catalog entry: surface name back to (owning upstream, original name).
#[derive(Debug, Clone)]
pub struct CatalogEntry {
	pub target_id: TargetId,
	pub original: String,
	pub item: Value,
}

/// The aggregated catalog for one session, per surface.
#[derive(Debug, Default, Clone)]
pub struct Catalog {
	tools: IndexMap<String, CatalogEntry>,
	resources: IndexMap<String, CatalogEntry>,
	resource_templates: IndexMap<String, CatalogEntry>,
	prompts: IndexMap<String, CatalogEntry>,
}

impl Catalog {
	pub fn surface(&self, s: CatalogSurface) -> &IndexMap<String, CatalogEntry> {
		match s {
			CatalogSurface::Tools => &self.tools,
			CatalogSurface::Resources => &self.resources,
			CatalogSurface::ResourceTemplates => &self.resource_templates,
			CatalogSurface::Prompts => &self.prompts,
		}
	}

	pub fn surface_mut(&mut self, s: CatalogSurface) -> &mut IndexMap<String, CatalogEntry> {
		match s {
			CatalogSurface::Tools => &mut self.tools,
			CatalogSurface::Resources => &mut self.resources,
			CatalogSurface::ResourceTemplates => &mut self.resource_templates,
			CatalogSurface::Prompts => &mut self.prompts,
		}
	}

	pub fn clear(&mut self) {
		self.tools.clear();
		self.resources.clear();
		self.resource_templates.clear();
		self.prompts.clear();
	}
}

/// The per-target raw listings the catalog is rebuilt from. Kept so a
/// refresh of one upstream can recompute collisions session-wide.
pub type RawListings = HashMap<TargetId, HashMap<CatalogSurface, Vec<(String, Value)>>>;

#[derive(Debug)]
pub struct SessionState {
	pub identity: Identity,
	pub bound: IndexMap<TargetId, BoundUpstream>,
	pub catalog: Catalog,
	pub raw: RawListings,
	/// False until `initialize` completes (and again after a recycle).
	pub initialized: bool,
}

#[derive(Debug)]
pub struct Session {
	pub id: String,
	/// Serializes request handling within the session.
	pub state: tokio::sync::Mutex<SessionState>,
	generation: AtomicU64,
	created: Instant,
	last_activity: Mutex<Instant>,
	/// Upstream clients send here; the relay's pump consumes it.
	notif_tx: mpsc::Sender<UpstreamNotification>,
	notif_rx: Mutex<Option<mpsc::Receiver<UpstreamNotification>>>,
	/// Client-facing notifications; every GET stream subscribes.
	client_tx: broadcast::Sender<JsonRpcNotification>,
	pump: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Session {
	fn new(id: String, identity: Identity) -> Self {
		let (notif_tx, notif_rx) = mpsc::channel(NOTIF_BUFFER);
		let (client_tx, _) = broadcast::channel(NOTIF_BUFFER);
		Self {
			id,
			state: tokio::sync::Mutex::new(SessionState {
				identity,
				bound: IndexMap::new(),
				catalog: Catalog::default(),
				raw: HashMap::new(),
				initialized: false,
			}),
			generation: AtomicU64::new(0),
			created: Instant::now(),
			last_activity: Mutex::new(Instant::now()),
			notif_tx,
			notif_rx: Mutex::new(Some(notif_rx)),
			client_tx,
			pump: Mutex::new(None),
		}
	}

	pub fn generation(&self) -> u64 {
		self.generation.load(Ordering::SeqCst)
	}

	pub fn bump_generation(&self) -> u64 {
		self.generation.fetch_add(1, Ordering::SeqCst) + 1
	}

	pub fn created(&self) -> Instant {
		self.created
	}

	pub fn touch(&self) {
		*self.last_activity.lock() = Instant::now();
	}

	pub fn idle_for(&self) -> Duration {
		self.last_activity.lock().elapsed()
	}

	/// The sink upstream clients are bound to.
	pub fn notification_sink(&self) -> mpsc::Sender<UpstreamNotification> {
		self.notif_tx.clone()
	}

	/// The upstream-notification receiver, takeable once by the pump.
	pub fn take_notification_source(&self) -> Option<mpsc::Receiver<UpstreamNotification>> {
		self.notif_rx.lock().take()
	}

	pub fn subscribe(&self) -> broadcast::Receiver<JsonRpcNotification> {
		self.client_tx.subscribe()
	}

	/// Push a notification toward the client. Nobody listening is fine.
	pub fn forward_to_client(&self, n: JsonRpcNotification) {
		let _ = self.client_tx.send(n);
	}

	pub fn set_pump(&self, handle: tokio::task::JoinHandle<()>) {
		if let Some(old) = self.pump.lock().replace(handle) {
			old.abort();
		}
	}

	pub fn stop_pump(&self) {
		if let Some(pump) = self.pump.lock().take() {
			pump.abort();
		}
	}
}

#[derive(Debug, Default)]
pub struct SessionManager {
	sessions: RwLock<HashMap<String, Arc<Session>>>,
}

fn session_id() -> String {
	uuid::Uuid::new_v4().to_string()
}

impl SessionManager {
	pub fn new() -> Self {
		Self::default()
	}

	/// Mint a session bound to the presented identity. The caller enforces
	/// the session cap before this.
	pub fn create(&self, identity: Identity) -> Arc<Session> {
		let id = session_id();
		let session = Arc::new(Session::new(id.clone(), identity));
		self.sessions.write().insert(id, session.clone());
		debug!(session = %session.id, "session created");
		session
	}

	pub fn get(&self, id: &str) -> Option<Arc<Session>> {
		self.sessions.read().get(id).cloned()
	}

	pub fn remove(&self, id: &str) -> Option<Arc<Session>> {
		self.sessions.write().remove(id)
	}

	pub fn len(&self) -> usize {
		self.sessions.read().len()
	}

	pub fn is_empty(&self) -> bool {
		self.sessions.read().is_empty()
	}

	/// Sessions idle past the timeout, for the collector.
	pub fn expired(&self, timeout: Duration) -> Vec<Arc<Session>> {
		self
			.sessions
			.read()
			.values()
			.filter(|s| s.idle_for() > timeout)
			.cloned()
			.collect()
	}

	/// The least-recently-active session, for cap eviction.
	pub fn oldest_idle(&self) -> Option<Arc<Session>> {
		self
			.sessions
			.read()
			.values()
			.max_by_key(|s| s.idle_for())
			.cloned()
	}

	pub fn all(&self) -> Vec<Arc<Session>> {
		self.sessions.read().values().cloned().collect()
	}
}

#[cfg(test)]
#[path = "session_tests.rs"]
mod tests;
