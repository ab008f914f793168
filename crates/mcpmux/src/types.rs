//! Core data model: targets, identities, subject keys, credentials, policies.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Stable identifier of a target. Immutable once assigned.
pub type TargetId = String;

/// How an upstream is reached.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TargetSpec {
	Http(HttpTargetSpec),
	Sse(HttpTargetSpec),
	Subprocess(SubprocessTargetSpec),
	Pod(PodTargetSpec),
}

impl TargetSpec {
	pub fn kind(&self) -> &'static str {
		match self {
			TargetSpec::Http(_) => "http",
			TargetSpec::Sse(_) => "sse",
			TargetSpec::Subprocess(_) => "subprocess",
			TargetSpec::Pod(_) => "pod",
		}
	}
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct HttpTargetSpec {
	pub base_url: String,
	/// Header carrying the upstream credential. Defaults to `Authorization`.
	#[serde(default)]
	pub auth_header: Option<String>,
	#[serde(default)]
	pub auth_kind: AuthKind,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AuthKind {
	#[default]
	None,
	/// Value is sent as `Bearer <token>`.
	Bearer,
	/// Value is sent verbatim.
	Raw,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SubprocessTargetSpec {
	pub command: String,
	#[serde(default)]
	pub args: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PodTargetSpec {
	pub image: String,
	pub port: u16,
	#[serde(default)]
	pub command: Option<String>,
	#[serde(default)]
	pub args: Vec<String>,
	#[serde(default)]
	pub health_path: Option<String>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Statefulness {
	#[default]
	Stateless,
	Stateful,
}

/// Governs whether one upstream instance serves many callers or each caller
/// class gets its own.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum IsolationBoundary {
	#[default]
	Shared,
	PerRole,
	PerGroup,
	PerUser,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Target {
	pub id: TargetId,
	pub name: String,
	pub spec: TargetSpec,
	#[serde(default)]
	pub statefulness: Statefulness,
	#[serde(default)]
	pub isolation: IsolationBoundary,
	#[serde(default = "default_true")]
	pub enabled: bool,
}

fn default_true() -> bool {
	true
}

/// The verified caller identity. Produced by the external token verifier and
/// snapshotted into sessions at bind time.
///
/// Groups are kept sorted so identity comparison is set comparison; group
/// order drift in a token never forces a recycle.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
	pub user_id: String,
	pub role: String,
	pub groups: Vec<String>,
	#[serde(default)]
	pub email: Option<String>,
}

impl Identity {
	pub fn new(
		user_id: impl Into<String>,
		role: impl Into<String>,
		groups: impl IntoIterator<Item = String>,
	) -> Self {
		let mut groups: Vec<String> = groups.into_iter().collect();
		groups.sort();
		groups.dedup();
		Self {
			user_id: user_id.into(),
			role: role.into(),
			groups,
			email: None,
		}
	}

	/// Re-establish the sorted-groups invariant after deserialization.
	pub fn normalize(mut self) -> Self {
		self.groups.sort();
		self.groups.dedup();
		self
	}

	/// True when the identity differs in a way that must recycle a session:
	/// user id, role, or group set.
	pub fn drifted_from(&self, other: &Identity) -> bool {
		self.user_id != other.user_id || self.role != other.role || self.groups != other.groups
	}
}

/// A stable tag deciding upstream instance sharing, derived from a target's
/// isolation boundary and the caller identity. 128 bits of SHA-256, so
/// collisions across distinct scopes are not a practical concern.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubjectKey(String);

impl SubjectKey {
	pub fn derive(boundary: IsolationBoundary, identity: &Identity) -> SubjectKey {
		let scope = match boundary {
			IsolationBoundary::Shared => return SubjectKey("shared".to_string()),
			IsolationBoundary::PerRole => format!("role:{}", identity.role),
			IsolationBoundary::PerGroup => format!("group:{}", identity.groups.join(",")),
			IsolationBoundary::PerUser => format!("user:{}", identity.user_id),
		};
		SubjectKey(tag128(scope.as_bytes()))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl std::fmt::Display for SubjectKey {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(&self.0)
	}
}

/// Fingerprint of a resolved environment, used to detect credential changes
/// between acquisitions. Keys are hashed in sorted order.
pub fn env_fingerprint(env: &BTreeMap<String, String>) -> String {
	let mut hasher = Sha256::new();
	for (k, v) in env {
		hasher.update(k.as_bytes());
		hasher.update([b'=']);
		hasher.update(v.as_bytes());
		hasher.update([b'\n']);
	}
	hex::encode(&hasher.finalize()[..16])
}

fn tag128(input: &[u8]) -> String {
	let digest = Sha256::digest(input);
	hex::encode(&digest[..16])
}

/// Which scope a credential entry applies to. Precedence (low to high):
/// default < role < group < user.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CredentialScope {
	Default,
	Role(String),
	Group(String),
	User(String),
}

impl CredentialScope {
	pub fn rank(&self) -> u8 {
		match self {
			CredentialScope::Default => 0,
			CredentialScope::Role(_) => 1,
			CredentialScope::Group(_) => 2,
			CredentialScope::User(_) => 3,
		}
	}
}

/// A stored credential. The value exists only as ciphertext at rest; see
/// [`crate::crypto`] for the sealing format.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialEntry {
	pub target_id: TargetId,
	pub scope: CredentialScope,
	pub key: String,
	#[serde(with = "ciphertext_b64")]
	pub ciphertext: Vec<u8>,
}

mod ciphertext_b64 {
	use base64::Engine;
	use base64::engine::general_purpose::STANDARD;
	use serde::{Deserialize, Deserializer, Serializer};

	pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
		ser.serialize_str(&STANDARD.encode(bytes))
	}

	pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
		let s = String::deserialize(de)?;
		STANDARD.decode(&s).map_err(serde::de::Error::custom)
	}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ResourceKind {
	All,
	Tool,
	Resource,
	Prompt,
}

impl std::fmt::Display for ResourceKind {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			ResourceKind::All => f.write_str("all"),
			ResourceKind::Tool => f.write_str("tool"),
			ResourceKind::Resource => f.write_str("resource"),
			ResourceKind::Prompt => f.write_str("prompt"),
		}
	}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PolicyEffect {
	Allow,
	Deny,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PolicySubject {
	pub kind: SubjectMatchKind,
	/// Ignored for `everyone`.
	#[serde(default)]
	pub value: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SubjectMatchKind {
	Everyone,
	Role,
	Group,
	User,
}

/// An authorization rule. Evaluation is default-deny; see [`crate::rbac`].
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Policy {
	pub id: i64,
	/// None applies the policy to all targets.
	#[serde(default)]
	pub target_id: Option<TargetId>,
	pub kind: ResourceKind,
	/// Full-match regular expression over the resource name.
	#[serde(default)]
	pub pattern: Option<String>,
	pub effect: PolicyEffect,
	pub priority: i32,
	#[serde(default = "default_true")]
	pub enabled: bool,
	/// Must contain at least one entry.
	pub subjects: Vec<PolicySubject>,
}

#[cfg(test)]
#[path = "types_tests.rs"]
mod tests;
