use super::*;
use crate::types::{PolicySubject, SubjectMatchKind};

fn ident(user: &str, role: &str, groups: &[&str]) -> Identity {
	Identity::new(user, role, groups.iter().map(|s| s.to_string()))
}

fn everyone() -> Vec<PolicySubject> {
	vec![PolicySubject {
		kind: SubjectMatchKind::Everyone,
		value: String::new(),
	}]
}

fn role(r: &str) -> Vec<PolicySubject> {
	vec![PolicySubject {
		kind: SubjectMatchKind::Role,
		value: r.to_string(),
	}]
}

fn policy(
	id: i64,
	target: Option<&str>,
	kind: ResourceKind,
	pattern: Option<&str>,
	effect: PolicyEffect,
	priority: i32,
	subjects: Vec<PolicySubject>,
) -> Policy {
	Policy {
		id,
		target_id: target.map(|s| s.to_string()),
		kind,
		pattern: pattern.map(|s| s.to_string()),
		effect,
		priority,
		enabled: true,
		subjects,
	}
}

#[test]
fn empty_policy_list_denies() {
	let d = decide(&ident("u", "r", &[]), "t", ResourceKind::Tool, "anything", &[]);
	assert_eq!(d, Decision::Deny);
}

#[test]
fn no_matching_policy_denies() {
	let policies = vec![policy(
		1,
		Some("other-target"),
		ResourceKind::All,
		None,
		PolicyEffect::Allow,
		0,
		everyone(),
	)];
	let d = decide(&ident("u", "r", &[]), "t", ResourceKind::Tool, "x", &policies);
	assert_eq!(d, Decision::Deny);
}

#[test]
fn disabled_policy_ignored() {
	let mut p = policy(1, None, ResourceKind::All, None, PolicyEffect::Allow, 0, everyone());
	p.enabled = false;
	let d = decide(&ident("u", "r", &[]), "t", ResourceKind::Tool, "x", &[p]);
	assert_eq!(d, Decision::Deny);
}

#[test]
fn priority_layering_admin_delete() {
	// priority 10: allow everyone on target X
	// priority 100: deny everyone on tools matching delete_.*
	// priority 200: allow role=admin on tools matching delete_.*
	let policies = vec![
		policy(1, Some("x"), ResourceKind::All, None, PolicyEffect::Allow, 10, everyone()),
		policy(
			2,
			None,
			ResourceKind::Tool,
			Some("delete_.*"),
			PolicyEffect::Deny,
			100,
			everyone(),
		),
		policy(
			3,
			None,
			ResourceKind::Tool,
			Some("delete_.*"),
			PolicyEffect::Allow,
			200,
			role("admin"),
		),
	];

	let user = ident("u", "user", &[]);
	let admin = ident("a", "admin", &[]);

	assert_eq!(
		decide(&user, "x", ResourceKind::Tool, "delete_repo", &policies),
		Decision::Deny
	);
	assert_eq!(
		decide(&admin, "x", ResourceKind::Tool, "delete_repo", &policies),
		Decision::Allow
	);
	assert_eq!(
		decide(&user, "x", ResourceKind::Tool, "read_repo", &policies),
		Decision::Allow
	);
}

#[test]
fn tie_break_by_lower_id() {
	let policies = vec![
		policy(2, None, ResourceKind::All, None, PolicyEffect::Deny, 50, everyone()),
		policy(1, None, ResourceKind::All, None, PolicyEffect::Allow, 50, everyone()),
	];
	let d = decide(&ident("u", "r", &[]), "t", ResourceKind::Tool, "x", &policies);
	assert_eq!(d, Decision::Allow);
}

#[test]
fn pattern_is_full_match() {
	let policies = vec![policy(
		1,
		None,
		ResourceKind::Tool,
		Some("search"),
		PolicyEffect::Allow,
		0,
		everyone(),
	)];
	let id = ident("u", "r", &[]);
	assert_eq!(
		decide(&id, "t", ResourceKind::Tool, "search", &policies),
		Decision::Allow
	);
	// substring must not match
	assert_eq!(
		decide(&id, "t", ResourceKind::Tool, "search_all", &policies),
		Decision::Deny
	);
}

#[test]
fn invalid_pattern_matches_nothing() {
	let policies = vec![policy(
		1,
		None,
		ResourceKind::Tool,
		Some("("),
		PolicyEffect::Allow,
		0,
		everyone(),
	)];
	let d = decide(&ident("u", "r", &[]), "t", ResourceKind::Tool, "(", &policies);
	assert_eq!(d, Decision::Deny);
}

#[test]
fn group_and_user_subjects() {
	let policies = vec![
		policy(
			1,
			None,
			ResourceKind::All,
			None,
			PolicyEffect::Allow,
			0,
			vec![PolicySubject {
				kind: SubjectMatchKind::Group,
				value: "eng".to_string(),
			}],
		),
		policy(
			2,
			None,
			ResourceKind::All,
			None,
			PolicyEffect::Allow,
			0,
			vec![PolicySubject {
				kind: SubjectMatchKind::User,
				value: "alice".to_string(),
			}],
		),
	];
	assert_eq!(
		decide(&ident("bob", "r", &["eng"]), "t", ResourceKind::Tool, "x", &policies),
		Decision::Allow
	);
	assert_eq!(
		decide(&ident("alice", "r", &[]), "t", ResourceKind::Tool, "x", &policies),
		Decision::Allow
	);
	assert_eq!(
		decide(&ident("carol", "r", &["ops"]), "t", ResourceKind::Tool, "x", &policies),
		Decision::Deny
	);
}

#[test]
fn kind_all_matches_every_kind() {
	let policies = vec![policy(1, None, ResourceKind::All, None, PolicyEffect::Allow, 0, everyone())];
	let id = ident("u", "r", &[]);
	for kind in [ResourceKind::Tool, ResourceKind::Resource, ResourceKind::Prompt] {
		assert_eq!(decide(&id, "t", kind, "x", &policies), Decision::Allow);
	}
}

#[test]
fn target_allowed_requires_allow_and_subject() {
	let policies = vec![
		policy(1, Some("x"), ResourceKind::Tool, None, PolicyEffect::Allow, 0, role("admin")),
		policy(2, Some("y"), ResourceKind::All, None, PolicyEffect::Deny, 0, everyone()),
	];
	assert!(target_allowed(&ident("u", "admin", &[]), "x", &policies));
	assert!(!target_allowed(&ident("u", "user", &[]), "x", &policies));
	// A deny alone never opens a target.
	assert!(!target_allowed(&ident("u", "admin", &[]), "y", &policies));
}
