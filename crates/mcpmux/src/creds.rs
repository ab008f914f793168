//! Credential resolution: merges scoped entries for a (target, identity)
//! pair into a single plaintext map, decrypting at rest.
//!
//! Scope precedence per key: default < role < group < user. Groups are
//! applied in sorted order so overlapping group-scoped keys resolve
//! reproducibly; the last sorted group wins. That ordering is a contract.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};

use crate::crypto::Sealer;
use crate::store::{CredentialStore, StoreError};
use crate::types::{CredentialEntry, CredentialScope, Identity, TargetId, env_fingerprint};

/// Reserved keys consumed before headers are assembled for http/sse targets.
pub const KEY_AUTH_TOKEN: &str = "AUTH_TOKEN";
pub const KEY_AUTH_HEADER: &str = "AUTH_HEADER";
pub const KEY_BASE_URL: &str = "BASE_URL";
pub const KEY_TIMEOUT: &str = "TIMEOUT";

#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
	#[error(transparent)]
	Store(#[from] StoreError),
	#[error("credential decryption failed for key {key}")]
	Decrypt {
		key: String,
		#[source]
		source: crate::crypto::Error,
	},
	#[error("credential encryption failed")]
	Encrypt(#[source] crate::crypto::Error),
}

/// The merged plaintext credentials for one (target, identity) pair.
/// Values are zeroed on drop.
#[derive(Debug, Default)]
pub struct ResolvedCredentials {
	values: BTreeMap<String, SecretString>,
}

/// Per-target connection overrides extracted from the reserved keys.
#[derive(Debug, Default)]
pub struct HttpOverrides {
	pub auth_token: Option<SecretString>,
	pub auth_header: Option<String>,
	pub base_url: Option<String>,
	pub timeout: Option<Duration>,
}

impl ResolvedCredentials {
	pub fn is_empty(&self) -> bool {
		self.values.is_empty()
	}

	pub fn get(&self, key: &str) -> Option<&SecretString> {
		self.values.get(key)
	}

	/// Stable fingerprint over the resolved map; a change forces instance
	/// replacement.
	pub fn fingerprint(&self) -> String {
		let exposed: BTreeMap<String, String> = self
			.values
			.iter()
			.map(|(k, v)| (k.clone(), v.expose_secret().to_string()))
			.collect();
		env_fingerprint(&exposed)
	}

	/// The full map as environment variables, for subprocess/pod spawn.
	pub fn to_env(&self) -> BTreeMap<String, String> {
		self
			.values
			.iter()
			.map(|(k, v)| (k.clone(), v.expose_secret().to_string()))
			.collect()
	}

	/// Split the map for an http/sse target: reserved keys become connection
	/// overrides, everything else becomes an `X-Env-<KEY>` header.
	pub fn split_http(mut self) -> (HttpOverrides, Vec<(String, SecretString)>) {
		let overrides = HttpOverrides {
			auth_token: self.values.remove(KEY_AUTH_TOKEN),
			auth_header: self
				.values
				.remove(KEY_AUTH_HEADER)
				.map(|v| v.expose_secret().to_string()),
			base_url: self
				.values
				.remove(KEY_BASE_URL)
				.map(|v| v.expose_secret().to_string()),
			timeout: self
				.values
				.remove(KEY_TIMEOUT)
				.and_then(|v| v.expose_secret().parse::<u64>().ok())
				.map(Duration::from_secs),
		};
		let headers = self
			.values
			.into_iter()
			.map(|(k, v)| (format!("X-Env-{}", k.to_uppercase()), v))
			.collect();
		(overrides, headers)
	}
}

#[derive(Debug)]
pub struct CredentialResolver {
	store: Arc<dyn CredentialStore>,
	sealer: Arc<Sealer>,
}

impl CredentialResolver {
	pub fn new(store: Arc<dyn CredentialStore>, sealer: Arc<Sealer>) -> Self {
		Self { store, sealer }
	}

	/// Seal and persist a plaintext value for (target, scope, key).
	pub async fn put(
		&self,
		target: &TargetId,
		scope: CredentialScope,
		key: impl Into<String>,
		plaintext: &str,
	) -> Result<(), CredentialError> {
		let ciphertext = self.sealer.seal(plaintext).map_err(CredentialError::Encrypt)?;
		self
			.store
			.put_entry(CredentialEntry {
				target_id: target.clone(),
				scope,
				key: key.into(),
				ciphertext,
			})
			.await?;
		Ok(())
	}

	/// Resolve the merged plaintext map for (target, identity).
	pub async fn resolve(
		&self,
		target: &TargetId,
		identity: &Identity,
	) -> Result<ResolvedCredentials, CredentialError> {
		let mut entries = self.store.entries_for_target(target).await?;
		entries.retain(|e| Self::applies(&e.scope, identity));
		// Ascending precedence, groups in sorted order; later writes win.
		entries.sort_by(|a, b| {
			a.scope
				.rank()
				.cmp(&b.scope.rank())
				.then_with(|| scope_value(&a.scope).cmp(scope_value(&b.scope)))
		});

		let mut values = BTreeMap::new();
		for entry in entries {
			let plaintext = self.sealer.open(&entry.ciphertext).map_err(|source| {
				CredentialError::Decrypt {
					key: entry.key.clone(),
					source,
				}
			})?;
			values.insert(entry.key, plaintext);
		}
		Ok(ResolvedCredentials { values })
	}

	fn applies(scope: &CredentialScope, identity: &Identity) -> bool {
		match scope {
			CredentialScope::Default => true,
			CredentialScope::Role(r) => r == &identity.role,
			CredentialScope::Group(g) => identity.groups.iter().any(|ig| ig == g),
			CredentialScope::User(u) => u == &identity.user_id,
		}
	}
}

fn scope_value(scope: &CredentialScope) -> &str {
	match scope {
		CredentialScope::Default => "",
		CredentialScope::Role(v) | CredentialScope::Group(v) | CredentialScope::User(v) => v,
	}
}

#[cfg(test)]
#[path = "creds_tests.rs"]
mod tests;
