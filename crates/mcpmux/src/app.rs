//! Wiring: build the gateway from a [`Config`] and run it.
//!
//! Everything process-wide (pools, registry, session map) hangs off one
//! root context built here; tests build their own with in-memory pieces.

use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use crate::config::Config;
use crate::creds::CredentialResolver;
use crate::pool::pod::{HttpInstanceDriver, InstanceDriver, NullInstanceDriver, PodPool};
use crate::pool::process::ProcessPool;
use crate::registry::UpstreamRegistry;
use crate::relay::Relay;
use crate::serve::{self, App};
use crate::session::SessionManager;
use crate::store::{MemoryStore, Stores, TokenVerifier};

pub struct Gateway {
	pub relay: Arc<Relay>,
	pub app: Arc<App>,
	pub router: axum::Router,
}

/// Build the root context: stores seeded from local state, pools, registry,
/// relay, and the HTTP surface.
pub async fn build(cfg: &Config) -> anyhow::Result<Gateway> {
	let store = Arc::new(MemoryStore::new());
	store.set_targets(cfg.local_state.targets.clone());
	store.set_policies(cfg.local_state.policies.clone());
	for t in &cfg.local_state.tokens {
		store.add_token(t.token.clone(), t.identity.clone());
	}

	let stores = Stores::in_memory(store.clone());
	let resolver = Arc::new(CredentialResolver::new(
		stores.credentials.clone(),
		cfg.sealer.clone(),
	));
	// Local plaintext credentials are sealed on the way in; only ciphertext
	// is held at rest.
	for c in &cfg.local_state.credentials {
		resolver
			.put(&c.target_id, c.scope.clone(), c.key.clone(), &c.value)
			.await
			.with_context(|| format!("sealing credential {} for {}", c.key, c.target_id))?;
	}

	let procs = Arc::new(ProcessPool::new(cfg.process_pool.clone()));
	procs.clone().start();
	let driver: Arc<dyn InstanceDriver> = match &cfg.controller_url {
		Some(url) => Arc::new(HttpInstanceDriver::new(url.clone()).context("instance controller")?),
		None => Arc::new(NullInstanceDriver),
	};
	let pods = Arc::new(PodPool::new(cfg.pod_pool.clone(), driver));
	pods.clone().start();

	let registry = Arc::new(UpstreamRegistry::new(
		resolver,
		procs,
		pods,
		cfg.call_timeout,
	));
	let sessions = Arc::new(SessionManager::new());
	let relay = Relay::new(stores, registry, sessions, cfg.session.clone());
	relay.start();

	let verifier: Arc<dyn TokenVerifier> = store;
	let app = Arc::new(App {
		relay: relay.clone(),
		verifier,
		request_timeout: cfg.request_timeout,
	});
	let router = serve::router(app.clone(), &cfg.path);

	Ok(Gateway { relay, app, router })
}

/// Run until SIGINT/SIGTERM, then drain: listener first, then sessions and
/// pools.
pub async fn run(cfg: Config) -> anyhow::Result<()> {
	let gateway = build(&cfg).await?;
	let listener = tokio::net::TcpListener::bind(cfg.bind)
		.await
		.with_context(|| format!("binding {}", cfg.bind))?;
	info!(addr = %cfg.bind, path = %cfg.path, "gateway listening");

	axum::serve(listener, gateway.router)
		.with_graceful_shutdown(shutdown_signal())
		.await
		.context("serving")?;

	info!("listener closed; draining sessions");
	gateway.relay.shutdown().await;
	Ok(())
}

async fn shutdown_signal() {
	let ctrl_c = async {
		let _ = tokio::signal::ctrl_c().await;
	};
	#[cfg(unix)]
	let terminate = async {
		match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
			Ok(mut sig) => {
				sig.recv().await;
			},
			Err(_) => std::future::pending().await,
		}
	};
	#[cfg(not(unix))]
	let terminate = std::future::pending::<()>();

	tokio::select! {
		_ = ctrl_c => {},
		_ = terminate => {},
	}
	info!("shutdown signal received");
}
