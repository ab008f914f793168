//! Default-deny policy evaluation.
//!
//! `decide` is a pure function of its inputs; it touches no store and no
//! network, and nothing here is cached across requests.

use regex::Regex;
use tracing::warn;

use crate::types::{Identity, Policy, PolicyEffect, ResourceKind, SubjectMatchKind};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Decision {
	Allow,
	Deny,
}

/// Evaluate (identity, target, kind, name) against the policy list.
///
/// Survivors are sorted by priority descending with id ascending as the
/// tie-break, and the first survivor's effect wins. No survivors means Deny.
pub fn decide(
	identity: &Identity,
	target_id: &str,
	kind: ResourceKind,
	name: &str,
	policies: &[Policy],
) -> Decision {
	let mut survivors: Vec<&Policy> = policies
		.iter()
		.filter(|p| applies(p, identity, target_id, kind, name))
		.collect();
	survivors.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.id.cmp(&b.id)));

	match survivors.first() {
		Some(p) => match p.effect {
			PolicyEffect::Allow => Decision::Allow,
			PolicyEffect::Deny => Decision::Deny,
		},
		None => Decision::Deny,
	}
}

/// Whether any Allow policy gives this identity a foothold on the target, at
/// any resource kind. Used to pick which upstreams a session binds at all;
/// per-item filtering still runs through [`decide`].
pub fn target_allowed(identity: &Identity, target_id: &str, policies: &[Policy]) -> bool {
	policies.iter().any(|p| {
		p.enabled
			&& p.effect == PolicyEffect::Allow
			&& target_matches(p, target_id)
			&& subject_matches(p, identity)
	})
}

fn applies(p: &Policy, identity: &Identity, target_id: &str, kind: ResourceKind, name: &str) -> bool {
	if !p.enabled {
		return false;
	}
	if !target_matches(p, target_id) {
		return false;
	}
	if p.kind != ResourceKind::All && p.kind != kind {
		return false;
	}
	if let Some(pattern) = &p.pattern {
		if !pattern_matches(p.id, pattern, name) {
			return false;
		}
	}
	subject_matches(p, identity)
}

fn target_matches(p: &Policy, target_id: &str) -> bool {
	match &p.target_id {
		None => true,
		Some(t) => t == target_id,
	}
}

fn subject_matches(p: &Policy, identity: &Identity) -> bool {
	p.subjects.iter().any(|s| match s.kind {
		SubjectMatchKind::Everyone => true,
		SubjectMatchKind::Role => s.value == identity.role,
		SubjectMatchKind::Group => identity.groups.iter().any(|g| g == &s.value),
		SubjectMatchKind::User => s.value == identity.user_id,
	})
}

/// Patterns must match the full resource name. A pattern that fails to
/// compile matches nothing.
fn pattern_matches(policy_id: i64, pattern: &str, name: &str) -> bool {
	match Regex::new(&format!("^(?:{pattern})$")) {
		Ok(re) => re.is_match(name),
		Err(e) => {
			warn!(policy = policy_id, %pattern, "invalid policy pattern: {e}");
			false
		},
	}
}

#[cfg(test)]
#[path = "rbac_tests.rs"]
mod tests;
