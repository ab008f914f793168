//! Opaque persistence and identity-verification interfaces.
//!
//! The gateway core does not own a schema; it consumes these traits. The
//! in-memory implementation in [`memory`] backs local-config mode and tests;
//! a relational implementation lives outside this crate.

mod memory;

use std::sync::Arc;

pub use memory::MemoryStore;

use async_trait::async_trait;

use crate::types::{CredentialEntry, Identity, Policy, Target, TargetId};

/// The persistence handles the data plane consumes, bundled for wiring.
#[derive(Clone, Debug)]
pub struct Stores {
	pub targets: Arc<dyn TargetStore>,
	pub credentials: Arc<dyn CredentialStore>,
	pub policies: Arc<dyn PolicyStore>,
}

impl Stores {
	/// One in-memory store backing every interface; local-config mode.
	pub fn in_memory(store: Arc<MemoryStore>) -> Self {
		Self {
			targets: store.clone(),
			credentials: store.clone(),
			policies: store,
		}
	}
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
	#[error("store unavailable: {0}")]
	Unavailable(String),
	#[error("store error: {0}")]
	Internal(String),
}

#[async_trait]
pub trait TargetStore: Send + Sync + std::fmt::Debug {
	async fn list_targets(&self) -> Result<Vec<Target>, StoreError>;
	async fn get_target(&self, id: &str) -> Result<Option<Target>, StoreError>;
}

#[async_trait]
pub trait CredentialStore: Send + Sync + std::fmt::Debug {
	/// All entries for one target, every scope. The resolver does the
	/// merging; the store only fetches.
	async fn entries_for_target(&self, target: &TargetId) -> Result<Vec<CredentialEntry>, StoreError>;

	/// Insert or replace the entry for (target, scope, key).
	async fn put_entry(&self, entry: CredentialEntry) -> Result<(), StoreError>;

	/// Cascade used when a target is deleted.
	async fn delete_for_target(&self, target: &TargetId) -> Result<(), StoreError>;
}

#[async_trait]
pub trait PolicyStore: Send + Sync + std::fmt::Debug {
	async fn list_policies(&self) -> Result<Vec<Policy>, StoreError>;

	/// Monotonic counter bumped on every policy mutation. Callers that cache
	/// derived state key it by this value.
	fn generation(&self) -> u64;
}

#[derive(Debug, thiserror::Error)]
pub enum VerifyError {
	#[error("invalid or expired token")]
	InvalidToken,
	#[error("verifier unavailable: {0}")]
	Unavailable(String),
}

/// The external identity collaborator: turns a bearer token into a verified
/// [`Identity`] or fails.
#[async_trait]
pub trait TokenVerifier: Send + Sync + std::fmt::Debug {
	async fn verify(&self, token: &str) -> Result<Identity, VerifyError>;
}
