//! Gateway configuration: the serde surface (`RawConfig`) and the resolved,
//! validated form (`Config`).
//!
//! Local-state mode seeds the in-memory stores from the config file:
//! targets, policies, plaintext credentials (sealed at load), and static API
//! tokens. A deployment with a real repository wires its own stores instead.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

use crate::crypto::Sealer;
use crate::pool::PoolConfig;
use crate::pool::pod::PodPoolConfig;
use crate::session::SessionConfig;
use crate::types::{CredentialScope, Identity, Policy, Target};

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RawConfig {
	/// Listener address, e.g. "127.0.0.1:3000".
	pub bind: Option<String>,
	/// The MCP path served. Defaults to "/mcp".
	pub path: Option<String>,
	/// Master credential key: 64 hex characters (32 bytes).
	pub credential_key: String,
	pub request_timeout_secs: Option<u64>,
	pub call_timeout_secs: Option<u64>,
	pub session: Option<RawSessionConfig>,
	pub process_pool: Option<RawPoolConfig>,
	pub pod_pool: Option<RawPodPoolConfig>,
	#[serde(default)]
	pub local_state: LocalState,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RawSessionConfig {
	pub timeout_secs: Option<u64>,
	pub cleanup_interval_secs: Option<u64>,
	pub max_sessions: Option<usize>,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RawPoolConfig {
	pub idle_ttl_secs: Option<u64>,
	pub max_lifetime_secs: Option<u64>,
	pub gc_interval_secs: Option<u64>,
	pub max_instances: Option<usize>,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RawPodPoolConfig {
	pub idle_ttl_secs: Option<u64>,
	pub max_lifetime_secs: Option<u64>,
	pub gc_interval_secs: Option<u64>,
	pub max_instances: Option<usize>,
	pub readiness_timeout_secs: Option<u64>,
	pub poll_interval_secs: Option<u64>,
	/// Base URL of the instance controller. Pod targets fail without one.
	pub controller_url: Option<String>,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct LocalState {
	#[serde(default)]
	pub targets: Vec<Target>,
	#[serde(default)]
	pub policies: Vec<Policy>,
	#[serde(default)]
	pub credentials: Vec<LocalCredential>,
	#[serde(default)]
	pub tokens: Vec<LocalToken>,
}

/// A credential as written by the operator: plaintext in the file, sealed
/// into the store at load time.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct LocalCredential {
	pub target_id: String,
	pub scope: CredentialScope,
	pub key: String,
	pub value: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct LocalToken {
	pub token: String,
	pub identity: Identity,
}

#[derive(Debug, Clone)]
pub struct Config {
	pub bind: SocketAddr,
	pub path: String,
	pub sealer: Arc<Sealer>,
	pub request_timeout: Duration,
	pub call_timeout: Duration,
	pub session: SessionConfig,
	pub process_pool: PoolConfig,
	pub pod_pool: PodPoolConfig,
	pub controller_url: Option<String>,
	pub local_state: LocalState,
}

impl Config {
	pub fn from_file(path: &std::path::Path) -> anyhow::Result<Config> {
		let raw = std::fs::read_to_string(path)
			.with_context(|| format!("reading config file {}", path.display()))?;
		Self::from_yaml(&raw)
	}

	pub fn from_yaml(raw: &str) -> anyhow::Result<Config> {
		let raw: RawConfig = serde_yaml::from_str(raw).context("parsing config")?;
		Self::resolve(raw)
	}

	pub fn resolve(raw: RawConfig) -> anyhow::Result<Config> {
		let bind: SocketAddr = raw
			.bind
			.as_deref()
			.unwrap_or("127.0.0.1:3000")
			.parse()
			.context("parsing bind address")?;
		let sealer = Arc::new(
			Sealer::from_hex(&raw.credential_key)
				.context("credential key must be 64 hex characters (32 bytes)")?,
		);

		let session_raw = raw.session.unwrap_or_default();
		let session_defaults = SessionConfig::default();
		let session = SessionConfig {
			timeout: secs(session_raw.timeout_secs, session_defaults.timeout),
			cleanup_interval: secs(
				session_raw.cleanup_interval_secs,
				session_defaults.cleanup_interval,
			),
			max_sessions: session_raw.max_sessions.unwrap_or(session_defaults.max_sessions),
		};

		let process_pool = pool_config(raw.process_pool.unwrap_or_default());
		let pod_raw = raw.pod_pool.unwrap_or_default();
		let pod_defaults = PodPoolConfig::default();
		let pod_pool = PodPoolConfig {
			pool: pool_config(RawPoolConfig {
				idle_ttl_secs: pod_raw.idle_ttl_secs,
				max_lifetime_secs: pod_raw.max_lifetime_secs,
				gc_interval_secs: pod_raw.gc_interval_secs,
				max_instances: pod_raw.max_instances,
			}),
			readiness_timeout: secs(pod_raw.readiness_timeout_secs, pod_defaults.readiness_timeout),
			poll_interval: secs(pod_raw.poll_interval_secs, pod_defaults.poll_interval),
		};

		Ok(Config {
			bind,
			path: raw.path.unwrap_or_else(|| "/mcp".to_string()),
			sealer,
			request_timeout: secs(raw.request_timeout_secs, Duration::from_secs(60)),
			call_timeout: secs(raw.call_timeout_secs, Duration::from_secs(5)),
			session,
			process_pool,
			pod_pool,
			controller_url: pod_raw.controller_url,
			local_state: raw.local_state,
		})
	}
}

fn pool_config(raw: RawPoolConfig) -> PoolConfig {
	let d = PoolConfig::default();
	PoolConfig {
		idle_ttl: secs(raw.idle_ttl_secs, d.idle_ttl),
		max_lifetime: secs(raw.max_lifetime_secs, d.max_lifetime),
		gc_interval: secs(raw.gc_interval_secs, d.gc_interval),
		max_instances: raw.max_instances.unwrap_or(d.max_instances),
	}
}

fn secs(raw: Option<u64>, default: Duration) -> Duration {
	raw.map(Duration::from_secs).unwrap_or(default)
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
