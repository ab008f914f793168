//! The upstream registry: (target, subject key) to live client.
//!
//! On miss it resolves credentials, then dispatches by transport kind:
//! http/sse clients are built directly and cached here; subprocess and pod
//! instances are delegated to their pools. A credential fingerprint change
//! between acquisitions evicts and rebuilds.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use secrecy::ExposeSecret;
use thiserror::Error;
use tracing::debug;

use crate::creds::{CredentialError, CredentialResolver, HttpOverrides, ResolvedCredentials};
use crate::pool::pod::PodPool;
use crate::pool::process::ProcessPool;
use crate::pool::{PoolError, PoolKey};
use crate::types::{AuthKind, HttpTargetSpec, Identity, SubjectKey, Target, TargetSpec};
use crate::upstream::http::HttpUpstream;
use crate::upstream::sse::SseUpstream;
use crate::upstream::{UpstreamClient, UpstreamError};

#[derive(Error, Debug)]
pub enum RegistryError {
	#[error("target {0} is disabled")]
	TargetDisabled(String),
	#[error(transparent)]
	Credential(#[from] CredentialError),
	#[error("invalid credential header {0}")]
	BadHeader(String),
	#[error(transparent)]
	Pool(#[from] PoolError),
	#[error(transparent)]
	Upstream(#[from] UpstreamError),
}

#[derive(Debug)]
struct DirectEntry {
	client: Arc<UpstreamClient>,
	fingerprint: String,
}

#[derive(Debug)]
pub struct UpstreamRegistry {
	creds: Arc<CredentialResolver>,
	procs: Arc<ProcessPool>,
	pods: Arc<PodPool>,
	direct: Mutex<HashMap<PoolKey, DirectEntry>>,
	default_timeout: Duration,
}

impl UpstreamRegistry {
	pub fn new(
		creds: Arc<CredentialResolver>,
		procs: Arc<ProcessPool>,
		pods: Arc<PodPool>,
		default_timeout: Duration,
	) -> Self {
		Self {
			creds,
			procs,
			pods,
			direct: Mutex::new(HashMap::new()),
			default_timeout,
		}
	}

	/// Locate or create the client for (target, caller identity).
	pub async fn acquire(
		&self,
		target: &Target,
		identity: &Identity,
	) -> Result<Arc<UpstreamClient>, RegistryError> {
		if !target.enabled {
			return Err(RegistryError::TargetDisabled(target.id.clone()));
		}
		let subject = SubjectKey::derive(target.isolation, identity);
		let resolved = self.creds.resolve(&target.id, identity).await?;

		match &target.spec {
			TargetSpec::Subprocess(spec) => {
				let env = resolved.to_env();
				Ok(
					self
						.procs
						.acquire(target, spec, &subject, env, self.default_timeout)
						.await?,
				)
			},
			TargetSpec::Pod(spec) => {
				let env = resolved.to_env();
				Ok(
					self
						.pods
						.acquire(target, spec, &subject, env, self.default_timeout)
						.await?,
				)
			},
			TargetSpec::Http(spec) => {
				self
					.acquire_direct(target, spec, &subject, resolved, false)
					.await
			},
			TargetSpec::Sse(spec) => {
				self
					.acquire_direct(target, spec, &subject, resolved, true)
					.await
			},
		}
	}

	/// Drop a reference to a managed instance. Direct http/sse clients are
	/// plain connections and are only evicted on fingerprint change or
	/// target eviction.
	pub async fn release(&self, target: &Target, subject: &SubjectKey) {
		match &target.spec {
			TargetSpec::Subprocess(_) => self.procs.release(&target.id, subject).await,
			TargetSpec::Pod(_) => self.pods.release(&target.id, subject).await,
			TargetSpec::Http(_) | TargetSpec::Sse(_) => {},
		}
	}

	/// Close everything for one target, across all subject keys. Used on
	/// target deletion or restart.
	pub async fn evict_target(&self, target_id: &str) {
		let evicted: Vec<Arc<UpstreamClient>> = {
			let mut direct = self.direct.lock();
			let keys: Vec<PoolKey> = direct
				.keys()
				.filter(|(t, _)| t == target_id)
				.cloned()
				.collect();
			keys
				.into_iter()
				.filter_map(|k| direct.remove(&k))
				.map(|e| e.client)
				.collect()
		};
		for client in evicted {
			client.close().await;
		}
		self.procs.evict_target(target_id).await;
		self.pods.evict_target(target_id).await;
	}

	pub async fn shutdown(&self) {
		let evicted: Vec<Arc<UpstreamClient>> = {
			let mut direct = self.direct.lock();
			direct.drain().map(|(_, e)| e.client).collect()
		};
		for client in evicted {
			client.close().await;
		}
		self.procs.shutdown().await;
		self.pods.shutdown().await;
	}

	async fn acquire_direct(
		&self,
		target: &Target,
		spec: &HttpTargetSpec,
		subject: &SubjectKey,
		resolved: ResolvedCredentials,
		legacy_sse: bool,
	) -> Result<Arc<UpstreamClient>, RegistryError> {
		let key = (target.id.clone(), subject.clone());
		let fingerprint = resolved.fingerprint();

		let stale = {
			let mut direct = self.direct.lock();
			match direct.get(&key) {
				Some(e) if e.fingerprint == fingerprint && e.client.is_alive() => {
					return Ok(e.client.clone());
				},
				Some(_) => direct.remove(&key).map(|e| e.client),
				None => None,
			}
		};
		if let Some(old) = stale {
			debug!(target = %target.id, subject = %subject, "evicting upstream client on credential change");
			old.close().await;
		}

		let (overrides, extra_headers) = resolved.split_http();
		let url = overrides
			.base_url
			.clone()
			.unwrap_or_else(|| spec.base_url.clone());
		let timeout = overrides.timeout.unwrap_or(self.default_timeout);
		let headers = build_headers(spec, &overrides, &extra_headers)?;

		let transport = if legacy_sse {
			SseUpstream::new(target.id.clone(), target.name.clone(), url, headers)?.into_transport()
		} else {
			HttpUpstream::new(target.id.clone(), target.name.clone(), url, headers)?.into_transport()
		};
		let client = Arc::new(UpstreamClient::new(
			target.id.clone(),
			target.name.clone(),
			subject.clone(),
			timeout,
			transport,
		));

		let mut direct = self.direct.lock();
		// A racing creation may have won; prefer the registered one.
		if let Some(e) = direct.get(&key) {
			if e.fingerprint == fingerprint && e.client.is_alive() {
				return Ok(e.client.clone());
			}
		}
		direct.insert(
			key,
			DirectEntry {
				client: client.clone(),
				fingerprint,
			},
		);
		Ok(client)
	}
}

fn build_headers(
	spec: &HttpTargetSpec,
	overrides: &HttpOverrides,
	extra: &[(String, secrecy::SecretString)],
) -> Result<HeaderMap, RegistryError> {
	let mut headers = HeaderMap::new();
	if let Some(token) = &overrides.auth_token {
		let name = overrides
			.auth_header
			.clone()
			.or_else(|| spec.auth_header.clone())
			.unwrap_or_else(|| "Authorization".to_string());
		let value = match spec.auth_kind {
			AuthKind::Raw => token.expose_secret().to_string(),
			AuthKind::Bearer | AuthKind::None => format!("Bearer {}", token.expose_secret()),
		};
		let mut value =
			HeaderValue::from_str(&value).map_err(|_| RegistryError::BadHeader(name.clone()))?;
		value.set_sensitive(true);
		let name =
			HeaderName::from_bytes(name.as_bytes()).map_err(|_| RegistryError::BadHeader(name))?;
		headers.insert(name, value);
	}
	for (k, v) in extra {
		let name =
			HeaderName::from_bytes(k.as_bytes()).map_err(|_| RegistryError::BadHeader(k.clone()))?;
		let mut value = HeaderValue::from_str(v.expose_secret())
			.map_err(|_| RegistryError::BadHeader(k.clone()))?;
		value.set_sensitive(true);
		headers.insert(name, value);
	}
	Ok(headers)
}

#[cfg(test)]
#[path = "registry_tests.rs"]
mod tests;
