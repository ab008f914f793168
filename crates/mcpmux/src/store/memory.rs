use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;

use super::{CredentialStore, PolicyStore, StoreError, TargetStore, TokenVerifier, VerifyError};
use crate::types::{CredentialEntry, Identity, Policy, Target, TargetId};

/// In-memory store backing local-config mode and tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
	targets: RwLock<Vec<Target>>,
	credentials: RwLock<Vec<CredentialEntry>>,
	policies: RwLock<Vec<Policy>>,
	policy_generation: AtomicU64,
	tokens: RwLock<HashMap<String, Identity>>,
}

impl MemoryStore {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn set_targets(&self, targets: Vec<Target>) {
		*self.targets.write() = targets;
	}

	pub fn set_policies(&self, policies: Vec<Policy>) {
		*self.policies.write() = policies;
		self.policy_generation.fetch_add(1, Ordering::SeqCst);
	}

	pub fn add_token(&self, token: impl Into<String>, identity: Identity) {
		self
			.tokens
			.write()
			.insert(token.into(), identity.normalize());
	}

	pub fn delete_target(&self, id: &str) {
		self.targets.write().retain(|t| t.id != id);
		self.credentials.write().retain(|c| c.target_id != id);
	}
}

#[async_trait]
impl TargetStore for MemoryStore {
	async fn list_targets(&self) -> Result<Vec<Target>, StoreError> {
		Ok(self.targets.read().clone())
	}

	async fn get_target(&self, id: &str) -> Result<Option<Target>, StoreError> {
		Ok(self.targets.read().iter().find(|t| t.id == id).cloned())
	}
}

#[async_trait]
impl CredentialStore for MemoryStore {
	async fn entries_for_target(&self, target: &TargetId) -> Result<Vec<CredentialEntry>, StoreError> {
		Ok(
			self
				.credentials
				.read()
				.iter()
				.filter(|e| &e.target_id == target)
				.cloned()
				.collect(),
		)
	}

	async fn put_entry(&self, entry: CredentialEntry) -> Result<(), StoreError> {
		let mut creds = self.credentials.write();
		creds.retain(|e| {
			!(e.target_id == entry.target_id && e.scope == entry.scope && e.key == entry.key)
		});
		creds.push(entry);
		Ok(())
	}

	async fn delete_for_target(&self, target: &TargetId) -> Result<(), StoreError> {
		self.credentials.write().retain(|e| &e.target_id != target);
		Ok(())
	}
}

#[async_trait]
impl PolicyStore for MemoryStore {
	async fn list_policies(&self) -> Result<Vec<Policy>, StoreError> {
		Ok(self.policies.read().clone())
	}

	fn generation(&self) -> u64 {
		self.policy_generation.load(Ordering::SeqCst)
	}
}

#[async_trait]
impl TokenVerifier for MemoryStore {
	async fn verify(&self, token: &str) -> Result<Identity, VerifyError> {
		self
			.tokens
			.read()
			.get(token)
			.cloned()
			.ok_or(VerifyError::InvalidToken)
	}
}
