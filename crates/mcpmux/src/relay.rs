//! The multiplexer: aggregates catalogs from every upstream the caller is
//! authorized for, disambiguates name collisions, and routes each method
//! back to the owning upstream.
//!
//! Collision policy: a logical name exported by a single target keeps its
//! bare name; a name exported by two or more targets is surfaced as
//! `<target name>_<name>` for every exporter. Single-target sessions never
//! rewrite names.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexMap;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::errors::{ErrorKind, GatewayError};
use crate::pool::PoolError;
use crate::protocol::{
	self, CatalogSurface, ErrorBody, JsonRpcNotification, JsonRpcRequest,
};
use crate::rbac::{self, Decision};
use crate::registry::{RegistryError, UpstreamRegistry};
use crate::session::{
	BoundUpstream, Catalog, CatalogEntry, Session, SessionConfig, SessionManager, SessionState,
};
use crate::store::Stores;
use crate::types::{Identity, Policy, ResourceKind, Target};
use crate::upstream::{UpstreamClient, UpstreamError};

const NAME_DELIMITER: &str = "_";

/// Backoff before the single retry of an idempotent catalog list call.
const LIST_RETRY_BACKOFF: Duration = Duration::from_millis(250);

const SURFACES: [CatalogSurface; 4] = [
	CatalogSurface::Tools,
	CatalogSurface::Resources,
	CatalogSurface::ResourceTemplates,
	CatalogSurface::Prompts,
];

/// How a dispatch fails: a gateway-level error with a taxonomy kind, or a
/// JSON-RPC error passed through from the upstream untouched.
#[derive(Debug)]
pub enum DispatchError {
	Gateway(GatewayError),
	Rpc(ErrorBody),
}

impl From<GatewayError> for DispatchError {
	fn from(e: GatewayError) -> Self {
		DispatchError::Gateway(e)
	}
}

impl From<UpstreamError> for DispatchError {
	fn from(e: UpstreamError) -> Self {
		match e {
			UpstreamError::Timeout => {
				DispatchError::Gateway(GatewayError::new(ErrorKind::Timeout, "upstream call timed out"))
			},
			UpstreamError::Cancelled => {
				DispatchError::Gateway(GatewayError::new(ErrorKind::Cancelled, "call cancelled"))
			},
			UpstreamError::Rpc(body) => DispatchError::Rpc(body),
			UpstreamError::Unavailable(m) | UpstreamError::Protocol(m) => {
				DispatchError::Gateway(GatewayError::new(ErrorKind::UpstreamUnavailable, m))
			},
		}
	}
}

impl From<RegistryError> for DispatchError {
	fn from(e: RegistryError) -> Self {
		match e {
			RegistryError::Pool(PoolError::CapacityExhausted(m)) => {
				DispatchError::Gateway(GatewayError::new(ErrorKind::CapacityExhausted, m))
			},
			RegistryError::Pool(p) => {
				DispatchError::Gateway(GatewayError::new(ErrorKind::UpstreamUnavailable, p.to_string()))
			},
			RegistryError::Upstream(u) => u.into(),
			RegistryError::TargetDisabled(t) => DispatchError::Gateway(GatewayError::new(
				ErrorKind::UpstreamUnavailable,
				format!("target {t} is disabled"),
			)),
			RegistryError::Credential(e) => {
				DispatchError::Gateway(GatewayError::internal(e.to_string()))
			},
			RegistryError::BadHeader(h) => DispatchError::Gateway(GatewayError::internal(format!(
				"credential produced an invalid header {h}"
			))),
		}
	}
}

/// The gateway data plane root: stores, registry, and session map. Built
/// once at startup and passed to the front-end handler; tests build their
/// own with in-memory stores.
#[derive(Debug)]
pub struct Relay {
	stores: Stores,
	registry: Arc<UpstreamRegistry>,
	sessions: Arc<SessionManager>,
	cfg: SessionConfig,
	cancel: CancellationToken,
	// Back-reference for the tasks the relay spawns (pump, collector).
	weak: std::sync::Weak<Relay>,
}

impl Relay {
	pub fn new(
		stores: Stores,
		registry: Arc<UpstreamRegistry>,
		sessions: Arc<SessionManager>,
		cfg: SessionConfig,
	) -> Arc<Self> {
		Arc::new_cyclic(|weak| Self {
			stores,
			registry,
			sessions,
			cfg,
			cancel: CancellationToken::new(),
			weak: weak.clone(),
		})
	}

	pub fn sessions(&self) -> &Arc<SessionManager> {
		&self.sessions
	}

	fn arc(&self) -> Arc<Self> {
		self.weak.upgrade().expect("relay alive")
	}

	/// Start the idle-session collector.
	pub fn start(&self) {
		let relay = self.arc();
		tokio::spawn(async move {
			let mut tick = tokio::time::interval(relay.cfg.cleanup_interval);
			tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
			loop {
				tokio::select! {
					_ = relay.cancel.cancelled() => return,
					_ = tick.tick() => {
						for session in relay.sessions.expired(relay.cfg.timeout) {
							debug!(session = %session.id, "closing idle session");
							relay.close_session(&session.id).await;
						}
					},
				}
			}
		});
	}

	pub async fn shutdown(&self) {
		self.cancel.cancel();
		for session in self.sessions.all() {
			self.close_session(&session.id).await;
		}
		self.registry.shutdown().await;
	}

	/// Mint a session for the identity, evicting the least-recently-active
	/// session if the cap is reached.
	pub async fn open_session(&self, identity: Identity) -> Arc<Session> {
		if self.sessions.len() >= self.cfg.max_sessions {
			if let Some(victim) = self.sessions.oldest_idle() {
				warn!(session = %victim.id, "session cap reached; evicting");
				self.close_session(&victim.id).await;
			}
		}
		self.sessions.create(identity)
	}

	/// Handle one request inside a session. The caller has already matched
	/// the presented identity against the snapshot.
	pub async fn handle(
		&self,
		session: &Arc<Session>,
		req: JsonRpcRequest,
	) -> Result<Value, DispatchError> {
		let mut state = session.state.lock().await;
		session.touch();

		let method = req.method.clone();
		match method.as_str() {
			protocol::METHOD_INITIALIZE => self.bind(session, &mut state).await,
			// Session-wide liveness; no upstream fan-out needed.
			protocol::METHOD_PING => Ok(json!({})),
			_ if !state.initialized => {
				if session.generation() > 0 {
					Err(GatewayError::recycle_required().into())
				} else {
					Err(GatewayError::bad_request("session is not initialized").into())
				}
			},
			protocol::METHOD_TOOLS_LIST => Ok(list_result(CatalogSurface::Tools, &state.catalog)),
			protocol::METHOD_RESOURCES_LIST => {
				Ok(list_result(CatalogSurface::Resources, &state.catalog))
			},
			protocol::METHOD_RESOURCES_TEMPLATES_LIST => Ok(list_result(
				CatalogSurface::ResourceTemplates,
				&state.catalog,
			)),
			protocol::METHOD_PROMPTS_LIST => Ok(list_result(CatalogSurface::Prompts, &state.catalog)),
			protocol::METHOD_TOOLS_CALL => {
				self
					.forward(&mut state, CatalogSurface::Tools, "name", req, protocol::METHOD_TOOLS_CALL)
					.await
			},
			protocol::METHOD_PROMPTS_GET => {
				self
					.forward(&mut state, CatalogSurface::Prompts, "name", req, protocol::METHOD_PROMPTS_GET)
					.await
			},
			protocol::METHOD_RESOURCES_READ => {
				self
					.forward(&mut state, CatalogSurface::Resources, "uri", req, protocol::METHOD_RESOURCES_READ)
					.await
			},
			other => Err(GatewayError::not_found(format!("unknown method {other}")).into()),
		}
	}

	/// Handle a client-sent notification: `initialized` is absorbed (the
	/// gateway ran the upstream handshakes itself); the rest fan out to all
	/// bound upstreams.
	pub async fn handle_notification(&self, session: &Arc<Session>, n: JsonRpcNotification) {
		let state = session.state.lock().await;
		session.touch();
		if n.method == protocol::NOTIF_INITIALIZED {
			return;
		}
		for bound in state.bound.values() {
			if let Err(e) = bound.client.notify(&n.method, n.params.clone()).await {
				debug!(target = %bound.target.id, method = %n.method, "notification fan-out failed: {e}");
			}
		}
	}

	/// Close a session: unbind notification sinks, release pooled
	/// instances, drop the state. Idempotent.
	pub async fn close_session(&self, id: &str) {
		let Some(session) = self.sessions.remove(id) else {
			return;
		};
		session.stop_pump();
		let mut state = session.state.lock().await;
		self.unbind_all(&session, &mut state).await;
		debug!(session = %id, "session closed");
	}

	/// Abandon the session's upstream bindings because the caller identity
	/// changed. The session survives with a bumped generation; the client
	/// must re-initialize.
	pub async fn recycle(&self, session: &Arc<Session>, new_identity: Identity) {
		let mut state = session.state.lock().await;
		info!(session = %session.id, "identity drift; recycling session");
		self.unbind_all(session, &mut state).await;
		state.identity = new_identity;
		state.initialized = false;
		session.bump_generation();
	}

	/// Re-enumerate one upstream's slice of the catalog and recompute
	/// collisions session-wide. Driven by `*/list_changed` notifications.
	pub async fn refresh_target(
		&self,
		session: &Arc<Session>,
		target_id: &str,
	) -> Result<(), DispatchError> {
		let mut state = session.state.lock().await;
		let Some(bound) = state.bound.get(target_id).cloned() else {
			return Ok(());
		};
		let policies = self.policies().await?;
		let identity = state.identity.clone();
		let listings = self
			.enumerate(&bound.target, &bound.client, &identity, &policies)
			.await;
		state.raw.insert(target_id.to_string(), listings);
		rebuild_catalog(&mut state);
		debug!(session = %session.id, target = %target_id, "catalog slice refreshed");
		Ok(())
	}

	async fn bind(
		&self,
		session: &Arc<Session>,
		state: &mut SessionState,
	) -> Result<Value, DispatchError> {
		// Re-initialize drops previous bindings first.
		self.unbind_all(session, state).await;

		let targets = self
			.stores
			.targets
			.list_targets()
			.await
			.map_err(|e| GatewayError::internal(e.to_string()))?;
		let policies = self.policies().await?;
		let identity = state.identity.clone();

		let mut bound = IndexMap::new();
		let mut raw = HashMap::new();
		let mut inits: Vec<Value> = Vec::new();

		for target in targets {
			if !target.enabled || !rbac::target_allowed(&identity, &target.id, &policies) {
				continue;
			}
			let client = match self.registry.acquire(&target, &identity).await {
				Ok(c) => c,
				Err(RegistryError::Pool(PoolError::CapacityExhausted(m))) => {
					// Capacity is a hard failure; do not silently narrow the
					// session's catalog.
					self.unbind_partial(session, &mut bound).await;
					return Err(GatewayError::new(ErrorKind::CapacityExhausted, m).into());
				},
				Err(e) => {
					warn!(target = %target.id, "skipping upstream during bind: {e}");
					continue;
				},
			};
			match client.ensure_initialized().await {
				Ok(init) => inits.push(init.clone()),
				Err(e) => {
					warn!(target = %target.id, "upstream handshake failed; skipping: {e}");
					self.registry.release(&target, &client.subject).await;
					continue;
				},
			}
			client.bind_notifications(&session.id, session.notification_sink());

			let target = Arc::new(target);
			let listings = self
				.enumerate(&target, &client, &identity, &policies)
				.await;
			raw.insert(target.id.clone(), listings);
			bound.insert(target.id.clone(), BoundUpstream { target, client });
		}

		state.bound = bound;
		state.raw = raw;
		rebuild_catalog(state);
		state.initialized = true;

		self.spawn_pump(session);

		info!(
			session = %session.id,
			user = %state.identity.user_id,
			targets = state.bound.len(),
			generation = session.generation(),
			"session bound"
		);

		// A single-target session passes the upstream's own handshake reply
		// through; multiplexing answers as the gateway, advertising the
		// lowest protocol version among upstreams.
		if state.bound.len() == 1 && inits.len() == 1 {
			return Ok(inits.remove(0));
		}
		let version = inits
			.iter()
			.filter_map(|i| i.get("protocolVersion").and_then(Value::as_str))
			.min()
			.unwrap_or(protocol::PROTOCOL_VERSION)
			.to_string();
		Ok(protocol::gateway_initialize_result(&version))
	}

	/// Fetch and policy-filter the four list surfaces of one upstream.
	/// A surface the upstream rejects or cannot serve contributes nothing.
	async fn enumerate(
		&self,
		target: &Arc<Target>,
		client: &Arc<UpstreamClient>,
		identity: &Identity,
		policies: &[Policy],
	) -> HashMap<CatalogSurface, Vec<(String, Value)>> {
		let mut listings = HashMap::new();
		for surface in SURFACES {
			let items = match self.list_with_retry(client, surface).await {
				Ok(result) => protocol::list_items(surface, &result),
				Err(UpstreamError::Rpc(_)) => Vec::new(),
				Err(e) => {
					warn!(target = %target.id, surface = ?surface, "list failed: {e}");
					Vec::new()
				},
			};
			let kept: Vec<(String, Value)> = items
				.into_iter()
				.filter(|(name, _)| {
					rbac::decide(identity, &target.id, surface_kind(surface), name, policies)
						== Decision::Allow
				})
				.collect();
			listings.insert(surface, kept);
		}
		listings
	}

	/// Catalog list calls are idempotent; they get exactly one retry with a
	/// bounded backoff. Nothing else the gateway sends is ever retried.
	async fn list_with_retry(
		&self,
		client: &Arc<UpstreamClient>,
		surface: CatalogSurface,
	) -> Result<Value, UpstreamError> {
		match client.call(surface.list_method(), None, client.timeout).await {
			Ok(v) => Ok(v),
			Err(e @ UpstreamError::Rpc(_)) | Err(e @ UpstreamError::Cancelled) => Err(e),
			Err(first) => {
				debug!(surface = ?surface, "list failed, retrying once: {first}");
				tokio::time::sleep(LIST_RETRY_BACKOFF).await;
				client.call(surface.list_method(), None, client.timeout).await
			},
		}
	}

	/// Look up the surface name, re-check policy, rewrite to the original
	/// name, and forward to the owning upstream.
	async fn forward(
		&self,
		state: &mut SessionState,
		surface: CatalogSurface,
		name_param: &str,
		req: JsonRpcRequest,
		method: &str,
	) -> Result<Value, DispatchError> {
		let params = req.params.unwrap_or_else(|| json!({}));
		let Some(surface_name) = params.get(name_param).and_then(Value::as_str) else {
			return Err(GatewayError::bad_request(format!("missing {name_param}")).into());
		};
		let kind = surface_kind(surface);
		let Some(entry) = state.catalog.surface(surface).get(surface_name).cloned() else {
			// Hidden and nonexistent names are indistinguishable on purpose.
			return Err(GatewayError::not_found(format!("unknown {kind}: {surface_name}")).into());
		};

		// Policy is re-checked on every dispatch against the current list;
		// decisions are never cached across requests.
		let policies = self.policies().await?;
		if rbac::decide(&state.identity, &entry.target_id, kind, &entry.original, &policies)
			!= Decision::Allow
		{
			debug!(
				user = %state.identity.user_id,
				target = %entry.target_id,
				%kind,
				resource = %entry.original,
				"policy denied dispatch"
			);
			return Err(GatewayError::forbidden(&kind.to_string(), surface_name).into());
		}

		let Some(bound) = state.bound.get(&entry.target_id) else {
			return Err(GatewayError::internal("catalog entry without bound upstream").into());
		};

		let mut params = params.clone();
		params
			.as_object_mut()
			.expect("checked param object above")
			.insert(name_param.to_string(), Value::String(entry.original.clone()));

		let timeout = bound.client.timeout;
		Ok(bound.client.call(method, Some(params), timeout).await?)
	}

	async fn policies(&self) -> Result<Vec<Policy>, DispatchError> {
		self
			.stores
			.policies
			.list_policies()
			.await
			.map_err(|e| GatewayError::internal(e.to_string()).into())
	}

	async fn unbind_all(&self, session: &Arc<Session>, state: &mut SessionState) {
		for (_, bound) in state.bound.drain(..) {
			bound.client.unbind_notifications(&session.id);
			self.registry.release(&bound.target, &bound.client.subject).await;
		}
		state.catalog.clear();
		state.raw.clear();
		state.initialized = false;
	}

	async fn unbind_partial(
		&self,
		session: &Arc<Session>,
		bound: &mut IndexMap<String, BoundUpstream>,
	) {
		for (_, b) in bound.drain(..) {
			b.client.unbind_notifications(&session.id);
			self.registry.release(&b.target, &b.client.subject).await;
		}
	}

	/// The pump: consumes upstream notifications for one session, refreshes
	/// the owning slice on `*/list_changed`, and forwards everything to the
	/// client stream.
	fn spawn_pump(&self, session: &Arc<Session>) {
		let Some(mut rx) = session.take_notification_source() else {
			// Already pumping (rebind after recycle).
			return;
		};
		let relay = self.arc();
		let session_for_task = session.clone();
		let handle = tokio::spawn(async move {
			while let Some(n) = rx.recv().await {
				if is_list_changed(&n.message.method) {
					if let Err(e) = relay.refresh_target(&session_for_task, &n.target_id).await {
						warn!(session = %session_for_task.id, target = %n.target_id, "catalog refresh failed: {e:?}");
					}
				}
				session_for_task.forward_to_client(n.message);
			}
		});
		session.set_pump(handle);
	}
}

fn is_list_changed(method: &str) -> bool {
	matches!(
		method,
		protocol::NOTIF_TOOLS_CHANGED
			| protocol::NOTIF_RESOURCES_CHANGED
			| protocol::NOTIF_PROMPTS_CHANGED
	)
}

fn surface_kind(surface: CatalogSurface) -> ResourceKind {
	match surface {
		CatalogSurface::Tools => ResourceKind::Tool,
		CatalogSurface::Resources | CatalogSurface::ResourceTemplates => ResourceKind::Resource,
		CatalogSurface::Prompts => ResourceKind::Prompt,
	}
}

fn list_result(surface: CatalogSurface, catalog: &Catalog) -> Value {
	let items: Vec<Value> = catalog
		.surface(surface)
		.values()
		.map(|e| e.item.clone())
		.collect();
	json!({ surface.items_field(): items })
}

/// Recompute the whole catalog from the per-target raw listings. A logical
/// name exported by more than one target gets the `<target name>_` prefix on
/// every instance; unique names stay bare.
fn rebuild_catalog(state: &mut SessionState) {
	let mut catalog = Catalog::default();
	for surface in SURFACES {
		// Exporter count per logical name, in bound-target order.
		let mut exporters: HashMap<&str, usize> = HashMap::new();
		for bound in state.bound.values() {
			if let Some(items) = state.raw.get(&bound.target.id).and_then(|r| r.get(&surface)) {
				for (name, _) in items {
					*exporters.entry(name.as_str()).or_default() += 1;
				}
			}
		}

		let mut entries: IndexMap<String, CatalogEntry> = IndexMap::new();
		for bound in state.bound.values() {
			let Some(items) = state.raw.get(&bound.target.id).and_then(|r| r.get(&surface)) else {
				continue;
			};
			for (name, item) in items {
				let collides = exporters.get(name.as_str()).copied().unwrap_or(0) > 1;
				let surface_name = if collides {
					format!("{}{}{}", bound.target.name, NAME_DELIMITER, name)
				} else {
					name.clone()
				};
				let mut item = item.clone();
				protocol::rename_item(surface, &mut item, &surface_name);
				entries.insert(
					surface_name,
					CatalogEntry {
						target_id: bound.target.id.clone(),
						original: name.clone(),
						item,
					},
				);
			}
		}
		*catalog.surface_mut(surface) = entries;
	}
	state.catalog = catalog;
}

#[cfg(test)]
#[path = "relay_tests.rs"]
mod tests;
