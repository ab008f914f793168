//! End-to-end scenarios against a live gateway: real listener, real
//! subprocess upstreams, real HTTP client.

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::StreamExt;
use serde_json::{Value, json};

use mcpmux::app;
use mcpmux::config::Config;

const KEY: &str = "0202020202020202020202020202020202020202020202020202020202020202";

/// The shell MCP server used as an upstream. Emits a notification before
/// every tools/call reply so the SSE stream has something to carry.
fn server_script(name: &str) -> String {
	format!(
		r#"
while read line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9]*\).*/\1/p')
  case "$line" in
    *'"method":"initialize"'*)
      echo "{{\"jsonrpc\":\"2.0\",\"id\":$id,\"result\":{{\"protocolVersion\":\"2025-06-18\",\"capabilities\":{{}},\"serverInfo\":{{\"name\":\"{name}\",\"version\":\"0\"}}}}}}" ;;
    *'"method":"tools/list"'*)
      echo "{{\"jsonrpc\":\"2.0\",\"id\":$id,\"result\":{{\"tools\":[{{\"name\":\"read_repo\"}},{{\"name\":\"delete_repo\"}}]}}}}" ;;
    *'"method":"tools/call"'*)
      echo "{{\"jsonrpc\":\"2.0\",\"method\":\"notifications/progress\",\"params\":{{\"progress\":50}}}}"
      echo "{{\"jsonrpc\":\"2.0\",\"id\":$id,\"result\":{{\"content\":[{{\"type\":\"text\",\"text\":\"done by {name}\"}}]}}}}" ;;
    *'"id":'*)
      echo "{{\"jsonrpc\":\"2.0\",\"id\":$id,\"result\":{{}}}}" ;;
  esac
done
"#
	)
}

fn config_yaml() -> String {
	// Debug-quoting yields a double-quoted scalar with escaped newlines,
	// which YAML accepts verbatim.
	let script = server_script("github");
	format!(
		r#"
bind: "127.0.0.1:0"
credentialKey: "{KEY}"
session:
  timeoutSecs: 300
localState:
  targets:
    - id: github
      name: github
      spec:
        subprocess:
          command: sh
          args: ["-c", {script:?}]
  policies:
    - id: 1
      kind: all
      effect: allow
      priority: 10
      subjects:
        - kind: everyone
    - id: 2
      kind: tool
      pattern: "delete_.*"
      effect: deny
      priority: 100
      subjects:
        - kind: everyone
    - id: 3
      kind: tool
      pattern: "delete_.*"
      effect: allow
      priority: 200
      subjects:
        - kind: role
          value: admin
  tokens:
    - token: user-token
      identity:
        userId: u1
        role: user
        groups: [eng]
    - token: admin-token
      identity:
        userId: a1
        role: admin
        groups: []
    - token: u1-regrouped
      identity:
        userId: u1
        role: user
        groups: [ops]
"#
	)
}

struct TestGateway {
	addr: SocketAddr,
	client: reqwest::Client,
	relay: std::sync::Arc<mcpmux::relay::Relay>,
}

impl TestGateway {
	async fn start() -> TestGateway {
		let cfg = Config::from_yaml(&config_yaml()).expect("config parses");
		let gateway = app::build(&cfg).await.expect("gateway builds");
		let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
		let addr = listener.local_addr().unwrap();
		let router = gateway.router.clone();
		tokio::spawn(async move {
			axum::serve(listener, router).await.unwrap();
		});
		TestGateway {
			addr,
			client: reqwest::Client::new(),
			relay: gateway.relay,
		}
	}

	fn url(&self) -> String {
		format!("http://{}/mcp", self.addr)
	}

	async fn post(
		&self,
		token: &str,
		session: Option<&str>,
		body: &Value,
	) -> reqwest::Response {
		let mut req = self
			.client
			.post(self.url())
			.bearer_auth(token)
			.json(body);
		if let Some(sid) = session {
			req = req.header("mcp-session-id", sid);
		}
		req.send().await.expect("request sends")
	}

	/// Initialize a session and return its id.
	async fn initialize(&self, token: &str) -> String {
		let resp = self
			.post(
				token,
				None,
				&json!({"jsonrpc": "2.0", "id": 1, "method": "initialize", "params": {}}),
			)
			.await;
		assert_eq!(resp.status(), 200);
		let sid = resp
			.headers()
			.get("mcp-session-id")
			.expect("session id header")
			.to_str()
			.unwrap()
			.to_string();
		let body: Value = resp.json().await.unwrap();
		assert!(body.get("result").is_some(), "init failed: {body}");
		sid
	}
}

fn rpc(id: i64, method: &str, params: Value) -> Value {
	json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params})
}

#[tokio::test]
async fn initialize_list_and_call() {
	let gw = TestGateway::start().await;
	let sid = gw.initialize("user-token").await;

	let resp = gw
		.post("user-token", Some(&sid), &rpc(2, "tools/list", json!({})))
		.await;
	assert_eq!(resp.status(), 200);
	assert_eq!(
		resp.headers().get("mcp-protocol-version").unwrap(),
		"2025-06-18"
	);
	let body: Value = resp.json().await.unwrap();
	let names: Vec<&str> = body["result"]["tools"]
		.as_array()
		.unwrap()
		.iter()
		.map(|t| t["name"].as_str().unwrap())
		.collect();
	// delete_repo is policy-filtered for role=user; names are unprefixed for
	// a single target.
	assert_eq!(names, vec!["read_repo"]);

	let resp = gw
		.post(
			"user-token",
			Some(&sid),
			&rpc(3, "tools/call", json!({"name": "read_repo", "arguments": {}})),
		)
		.await;
	assert_eq!(resp.status(), 200);
	let body: Value = resp.json().await.unwrap();
	assert_eq!(body["result"]["content"][0]["text"], "done by github");
	assert_eq!(body["id"], 3);
	gw.relay.shutdown().await;
}

#[tokio::test]
async fn auth_is_required() {
	let gw = TestGateway::start().await;
	let resp = gw
		.client
		.post(gw.url())
		.json(&rpc(1, "initialize", json!({})))
		.send()
		.await
		.unwrap();
	assert_eq!(resp.status(), 401);

	let resp = gw
		.post("not-a-token", None, &rpc(1, "initialize", json!({})))
		.await;
	assert_eq!(resp.status(), 401);
	gw.relay.shutdown().await;
}

#[tokio::test]
async fn policy_layering_per_role() {
	let gw = TestGateway::start().await;

	// role=user: delete_repo is hidden and denied.
	let sid = gw.initialize("user-token").await;
	let resp = gw
		.post(
			"user-token",
			Some(&sid),
			&rpc(2, "tools/call", json!({"name": "delete_repo"})),
		)
		.await;
	assert_eq!(resp.status(), 404);

	// role=admin: the higher-priority allow wins.
	let sid = gw.initialize("admin-token").await;
	let resp = gw
		.post(
			"admin-token",
			Some(&sid),
			&rpc(2, "tools/call", json!({"name": "delete_repo"})),
		)
		.await;
	assert_eq!(resp.status(), 200);
	let body: Value = resp.json().await.unwrap();
	assert_eq!(body["result"]["content"][0]["text"], "done by github");
	gw.relay.shutdown().await;
}

#[tokio::test]
async fn identity_drift_recycles_session() {
	let gw = TestGateway::start().await;
	let sid = gw.initialize("user-token").await;

	// Same user, new group set: the session must recycle.
	let resp = gw
		.post("u1-regrouped", Some(&sid), &rpc(2, "tools/list", json!({})))
		.await;
	assert_eq!(resp.status(), 409);
	let body: Value = resp.json().await.unwrap();
	assert_eq!(body["error"]["data"]["kind"], "recycle_required");

	// Re-initializing the same session id under the new identity works.
	let resp = gw
		.post("u1-regrouped", Some(&sid), &rpc(3, "initialize", json!({})))
		.await;
	assert_eq!(resp.status(), 200);
	let resp = gw
		.post("u1-regrouped", Some(&sid), &rpc(4, "tools/list", json!({})))
		.await;
	assert_eq!(resp.status(), 200);
	gw.relay.shutdown().await;
}

#[tokio::test]
async fn delete_is_idempotent() {
	let gw = TestGateway::start().await;
	let sid = gw.initialize("user-token").await;

	for _ in 0..2 {
		let resp = gw
			.client
			.delete(gw.url())
			.bearer_auth("user-token")
			.header("mcp-session-id", &sid)
			.send()
			.await
			.unwrap();
		assert_eq!(resp.status(), 202);
	}

	// The session is gone.
	let resp = gw
		.post("user-token", Some(&sid), &rpc(2, "tools/list", json!({})))
		.await;
	assert_eq!(resp.status(), 404);
	gw.relay.shutdown().await;
}

#[tokio::test]
async fn unknown_session_and_missing_header() {
	let gw = TestGateway::start().await;

	let resp = gw
		.post("user-token", Some("no-such-session"), &rpc(1, "tools/list", json!({})))
		.await;
	assert_eq!(resp.status(), 404);

	// Non-initialize without a session header is rejected.
	let resp = gw
		.post("user-token", None, &rpc(1, "tools/list", json!({})))
		.await;
	assert_eq!(resp.status(), 400);
	gw.relay.shutdown().await;
}

#[tokio::test]
async fn batches_return_matching_arrays() {
	let gw = TestGateway::start().await;
	let sid = gw.initialize("user-token").await;

	let batch = json!([
		rpc(10, "ping", json!({})),
		rpc(11, "tools/list", json!({})),
	]);
	let resp = gw.post("user-token", Some(&sid), &batch).await;
	assert_eq!(resp.status(), 200);
	let body: Value = resp.json().await.unwrap();
	let items = body.as_array().unwrap();
	assert_eq!(items.len(), 2);
	assert_eq!(items[0]["id"], 10);
	assert_eq!(items[1]["id"], 11);

	// All-notification batches produce 204.
	let batch = json!([
		{"jsonrpc": "2.0", "method": "notifications/initialized"},
	]);
	let resp = gw.post("user-token", Some(&sid), &batch).await;
	assert_eq!(resp.status(), 204);
	gw.relay.shutdown().await;
}

#[tokio::test]
async fn notifications_flow_out_on_sse_stream() {
	let gw = TestGateway::start().await;
	let sid = gw.initialize("user-token").await;

	let stream_resp = gw
		.client
		.get(gw.url())
		.bearer_auth("user-token")
		.header("mcp-session-id", &sid)
		.header("accept", "text/event-stream")
		.send()
		.await
		.unwrap();
	assert_eq!(stream_resp.status(), 200);

	// The upstream emits a progress notification before the call reply.
	let resp = gw
		.post(
			"user-token",
			Some(&sid),
			&rpc(2, "tools/call", json!({"name": "read_repo"})),
		)
		.await;
	assert_eq!(resp.status(), 200);

	let mut stream = stream_resp.bytes_stream();
	let mut collected = String::new();
	let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
	loop {
		let chunk = tokio::time::timeout_at(deadline, stream.next())
			.await
			.expect("notification arrives on the stream")
			.expect("stream open")
			.expect("chunk ok");
		collected.push_str(std::str::from_utf8(&chunk).unwrap());
		if collected.contains("notifications/progress") {
			break;
		}
	}
	gw.relay.shutdown().await;
}

#[tokio::test]
async fn request_without_initialize_is_rejected_as_bad_request() {
	let gw = TestGateway::start().await;
	// Malformed body → 400.
	let resp = gw
		.client
		.post(gw.url())
		.bearer_auth("user-token")
		.header("content-type", "application/json")
		.body("{not json")
		.send()
		.await
		.unwrap();
	assert_eq!(resp.status(), 400);
	gw.relay.shutdown().await;
}
