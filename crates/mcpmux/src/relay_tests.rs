use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};

use super::*;
use crate::creds::CredentialResolver;
use crate::crypto::Sealer;
use crate::pool::PoolConfig;
use crate::pool::pod::{NullInstanceDriver, PodPool, PodPoolConfig};
use crate::pool::process::ProcessPool;
use crate::protocol::RequestId;
use crate::session::SessionManager;
use crate::store::MemoryStore;
use crate::types::{
	IsolationBoundary, PolicyEffect, PolicySubject, SubjectMatchKind, SubprocessTargetSpec,
	TargetSpec,
};

/// A shell MCP server: answers the handshake and a fixed tool list, and
/// echoes which server handled a call.
fn fake_server_script(server_name: &str, tools: &[&str]) -> String {
	let tool_items = tools
		.iter()
		.map(|t| format!(r#"{{\"name\":\"{t}\"}}"#))
		.collect::<Vec<_>>()
		.join(",");
	format!(
		r#"
while read line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9]*\).*/\1/p')
  case "$line" in
    *'"method":"initialize"'*)
      echo "{{\"jsonrpc\":\"2.0\",\"id\":$id,\"result\":{{\"protocolVersion\":\"2025-06-18\",\"capabilities\":{{}},\"serverInfo\":{{\"name\":\"{server_name}\",\"version\":\"0\"}}}}}}" ;;
    *'"method":"tools/list"'*)
      echo "{{\"jsonrpc\":\"2.0\",\"id\":$id,\"result\":{{\"tools\":[{tool_items}]}}}}" ;;
    *'"method":"tools/call"'*)
      echo "{{\"jsonrpc\":\"2.0\",\"id\":$id,\"result\":{{\"content\":[{{\"type\":\"text\",\"text\":\"from {server_name}\"}}]}}}}" ;;
    *'"id":'*)
      echo "{{\"jsonrpc\":\"2.0\",\"id\":$id,\"result\":{{}}}}" ;;
  esac
done
"#
	)
}

fn subprocess_target(id: &str, script: String) -> Target {
	Target {
		id: id.to_string(),
		name: id.to_string(),
		spec: TargetSpec::Subprocess(SubprocessTargetSpec {
			command: "sh".to_string(),
			args: vec!["-c".to_string(), script],
		}),
		statefulness: Default::default(),
		isolation: IsolationBoundary::Shared,
		enabled: true,
	}
}

fn allow_everyone(id: i64) -> Policy {
	Policy {
		id,
		target_id: None,
		kind: ResourceKind::All,
		pattern: None,
		effect: PolicyEffect::Allow,
		priority: 0,
		enabled: true,
		subjects: vec![PolicySubject {
			kind: SubjectMatchKind::Everyone,
			value: String::new(),
		}],
	}
}

fn harness(targets: Vec<Target>, policies: Vec<Policy>) -> (Arc<Relay>, Arc<MemoryStore>) {
	let store = Arc::new(MemoryStore::new());
	store.set_targets(targets);
	store.set_policies(policies);
	let resolver = Arc::new(CredentialResolver::new(
		store.clone(),
		Arc::new(Sealer::new(&[5u8; 32]).unwrap()),
	));
	let procs = Arc::new(ProcessPool::new(PoolConfig::default()));
	let pods = Arc::new(PodPool::new(
		PodPoolConfig::default(),
		Arc::new(NullInstanceDriver),
	));
	let registry = Arc::new(UpstreamRegistry::new(
		resolver,
		procs,
		pods,
		Duration::from_secs(5),
	));
	let relay = Relay::new(
		crate::store::Stores::in_memory(store.clone()),
		registry,
		Arc::new(SessionManager::new()),
		crate::session::SessionConfig::default(),
	);
	(relay, store)
}

fn ident(user: &str, role: &str) -> Identity {
	Identity::new(user, role, Vec::new())
}

fn req(method: &str, params: Option<Value>) -> JsonRpcRequest {
	protocol::request(RequestId::Number(1), method, params)
}

async fn init(relay: &Arc<Relay>, identity: Identity) -> (Arc<Session>, Value) {
	let session = relay.open_session(identity).await;
	let result = relay
		.handle(&session, req(protocol::METHOD_INITIALIZE, None))
		.await
		.expect("initialize");
	(session, result)
}

fn tool_names(list: &Value) -> Vec<String> {
	list["tools"]
		.as_array()
		.unwrap()
		.iter()
		.map(|t| t["name"].as_str().unwrap().to_string())
		.collect()
}

#[tokio::test]
async fn single_target_keeps_bare_names_and_passthrough_init() {
	let t = subprocess_target("github", fake_server_script("github", &["search", "read_repo"]));
	let (relay, _) = harness(vec![t], vec![allow_everyone(1)]);

	let (session, init_result) = init(&relay, ident("alice", "user")).await;
	// Single-target sessions pass the upstream handshake through.
	assert_eq!(init_result["serverInfo"]["name"], "github");

	let list = relay
		.handle(&session, req(protocol::METHOD_TOOLS_LIST, None))
		.await
		.unwrap();
	let mut names = tool_names(&list);
	names.sort();
	assert_eq!(names, vec!["read_repo", "search"]);

	let result = relay
		.handle(
			&session,
			req(protocol::METHOD_TOOLS_CALL, Some(json!({"name": "search"}))),
		)
		.await
		.unwrap();
	assert_eq!(result["content"][0]["text"], "from github");
	relay.shutdown().await;
}

#[tokio::test]
async fn colliding_names_are_prefixed_and_routed() {
	let github = subprocess_target("github", fake_server_script("github", &["search", "gh_only"]));
	let jira = subprocess_target("jira", fake_server_script("jira", &["search"]));
	let (relay, _) = harness(vec![github, jira], vec![allow_everyone(1)]);

	let (session, init_result) = init(&relay, ident("alice", "user")).await;
	// Multiplexing sessions answer as the gateway.
	assert_eq!(init_result["serverInfo"]["name"], "mcpmux");

	let list = relay
		.handle(&session, req(protocol::METHOD_TOOLS_LIST, None))
		.await
		.unwrap();
	let mut names = tool_names(&list);
	names.sort();
	// Only the colliding logical name is prefixed.
	assert_eq!(names, vec!["gh_only", "github_search", "jira_search"]);

	let result = relay
		.handle(
			&session,
			req(protocol::METHOD_TOOLS_CALL, Some(json!({"name": "jira_search"}))),
		)
		.await
		.unwrap();
	assert_eq!(result["content"][0]["text"], "from jira");

	let result = relay
		.handle(
			&session,
			req(protocol::METHOD_TOOLS_CALL, Some(json!({"name": "github_search"}))),
		)
		.await
		.unwrap();
	assert_eq!(result["content"][0]["text"], "from github");
	relay.shutdown().await;
}

#[tokio::test]
async fn no_policies_means_no_targets() {
	let t = subprocess_target("github", fake_server_script("github", &["search"]));
	let (relay, _) = harness(vec![t], Vec::new());

	let (session, _) = init(&relay, ident("alice", "user")).await;
	let list = relay
		.handle(&session, req(protocol::METHOD_TOOLS_LIST, None))
		.await
		.unwrap();
	assert!(tool_names(&list).is_empty());

	let err = relay
		.handle(
			&session,
			req(protocol::METHOD_TOOLS_CALL, Some(json!({"name": "search"}))),
		)
		.await
		.unwrap_err();
	let DispatchError::Gateway(e) = err else {
		panic!("expected gateway error");
	};
	assert_eq!(e.kind, ErrorKind::NotFound);
	relay.shutdown().await;
}

#[tokio::test]
async fn catalog_filters_denied_tools() {
	let t = subprocess_target(
		"github",
		fake_server_script("github", &["read_repo", "delete_repo"]),
	);
	let deny_delete = Policy {
		id: 2,
		target_id: None,
		kind: ResourceKind::Tool,
		pattern: Some("delete_.*".to_string()),
		effect: PolicyEffect::Deny,
		priority: 100,
		enabled: true,
		subjects: vec![PolicySubject {
			kind: SubjectMatchKind::Everyone,
			value: String::new(),
		}],
	};
	let (relay, _) = harness(vec![t], vec![allow_everyone(1), deny_delete]);

	let (session, _) = init(&relay, ident("alice", "user")).await;
	let list = relay
		.handle(&session, req(protocol::METHOD_TOOLS_LIST, None))
		.await
		.unwrap();
	assert_eq!(tool_names(&list), vec!["read_repo"]);

	// A hidden name is indistinguishable from a nonexistent one.
	let err = relay
		.handle(
			&session,
			req(protocol::METHOD_TOOLS_CALL, Some(json!({"name": "delete_repo"}))),
		)
		.await
		.unwrap_err();
	let DispatchError::Gateway(e) = err else {
		panic!("expected gateway error");
	};
	assert_eq!(e.kind, ErrorKind::NotFound);
	relay.shutdown().await;
}

#[tokio::test]
async fn dispatch_rechecks_policy_with_current_list() {
	let t = subprocess_target("github", fake_server_script("github", &["search"]));
	let (relay, store) = harness(vec![t], vec![allow_everyone(1)]);

	let (session, _) = init(&relay, ident("alice", "user")).await;

	// Policies change mid-session: the next dispatch sees the new list
	// without a recycle.
	store.set_policies(vec![
		allow_everyone(1),
		Policy {
			id: 2,
			target_id: None,
			kind: ResourceKind::Tool,
			pattern: Some("search".to_string()),
			effect: PolicyEffect::Deny,
			priority: 100,
			enabled: true,
			subjects: vec![PolicySubject {
				kind: SubjectMatchKind::Everyone,
				value: String::new(),
			}],
		},
	]);

	let err = relay
		.handle(
			&session,
			req(protocol::METHOD_TOOLS_CALL, Some(json!({"name": "search"}))),
		)
		.await
		.unwrap_err();
	let DispatchError::Gateway(e) = err else {
		panic!("expected gateway error");
	};
	assert_eq!(e.kind, ErrorKind::Forbidden);
	relay.shutdown().await;
}

#[tokio::test]
async fn recycle_clears_bindings_and_requires_reinit() {
	let t = subprocess_target("github", fake_server_script("github", &["search"]));
	let (relay, _) = harness(vec![t], vec![allow_everyone(1)]);

	let (session, _) = init(&relay, ident("alice", "user")).await;
	assert_eq!(session.generation(), 0);

	relay
		.recycle(&session, Identity::new("alice", "admin", Vec::new()))
		.await;
	assert_eq!(session.generation(), 1);

	let err = relay
		.handle(&session, req(protocol::METHOD_TOOLS_LIST, None))
		.await
		.unwrap_err();
	let DispatchError::Gateway(e) = err else {
		panic!("expected gateway error");
	};
	assert_eq!(e.kind, ErrorKind::RecycleRequired);

	// Re-initialize restores service under the new identity.
	let result = relay
		.handle(&session, req(protocol::METHOD_INITIALIZE, None))
		.await
		.unwrap();
	assert_eq!(result["serverInfo"]["name"], "github");
	relay.shutdown().await;
}

#[tokio::test]
async fn dead_upstream_surfaces_unavailable_then_respawns() {
	let t = subprocess_target("github", fake_server_script("github", &["search"]));
	let (relay, _) = harness(vec![t], vec![allow_everyone(1)]);

	let (session, _) = init(&relay, ident("alice", "user")).await;

	// Simulate an unsolicited child exit.
	{
		let state = session.state.lock().await;
		state.bound.get("github").unwrap().client.close().await;
	}
	let err = relay
		.handle(
			&session,
			req(protocol::METHOD_TOOLS_CALL, Some(json!({"name": "search"}))),
		)
		.await
		.unwrap_err();
	let DispatchError::Gateway(e) = err else {
		panic!("expected gateway error");
	};
	assert!(
		matches!(e.kind, ErrorKind::UpstreamUnavailable | ErrorKind::Cancelled),
		"got {:?}",
		e.kind
	);

	// Re-initialize respawns through the pool and service resumes.
	relay
		.handle(&session, req(protocol::METHOD_INITIALIZE, None))
		.await
		.unwrap();
	let result = relay
		.handle(
			&session,
			req(protocol::METHOD_TOOLS_CALL, Some(json!({"name": "search"}))),
		)
		.await
		.unwrap();
	assert_eq!(result["content"][0]["text"], "from github");
	relay.shutdown().await;
}

#[tokio::test]
async fn ping_answered_locally_and_unknown_method_404s() {
	let t = subprocess_target("github", fake_server_script("github", &["search"]));
	let (relay, _) = harness(vec![t], vec![allow_everyone(1)]);
	let (session, _) = init(&relay, ident("alice", "user")).await;

	let pong = relay
		.handle(&session, req(protocol::METHOD_PING, None))
		.await
		.unwrap();
	assert_eq!(pong, json!({}));

	let err = relay
		.handle(&session, req("tasks/list", None))
		.await
		.unwrap_err();
	let DispatchError::Gateway(e) = err else {
		panic!("expected gateway error");
	};
	assert_eq!(e.kind, ErrorKind::NotFound);
	relay.shutdown().await;
}

#[tokio::test]
async fn fresh_session_requires_initialize_first() {
	let t = subprocess_target("github", fake_server_script("github", &["search"]));
	let (relay, _) = harness(vec![t], vec![allow_everyone(1)]);
	let session = relay.open_session(ident("alice", "user")).await;

	let err = relay
		.handle(&session, req(protocol::METHOD_TOOLS_LIST, None))
		.await
		.unwrap_err();
	let DispatchError::Gateway(e) = err else {
		panic!("expected gateway error");
	};
	assert_eq!(e.kind, ErrorKind::BadRequest);
	relay.shutdown().await;
}
