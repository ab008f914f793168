use super::*;

const KEY: &str = "0101010101010101010101010101010101010101010101010101010101010101";

#[test]
fn minimal_config_gets_defaults() {
	let cfg = Config::from_yaml(&format!("credentialKey: \"{KEY}\"\n")).unwrap();
	assert_eq!(cfg.bind.port(), 3000);
	assert_eq!(cfg.path, "/mcp");
	assert_eq!(cfg.call_timeout, Duration::from_secs(5));
	assert_eq!(cfg.request_timeout, Duration::from_secs(60));
	assert_eq!(cfg.session.timeout, Duration::from_secs(1800));
	assert!(cfg.controller_url.is_none());
}

#[test]
fn full_config_parses() {
	let yaml = format!(
		r#"
bind: "0.0.0.0:8080"
path: /gateway
credentialKey: "{KEY}"
callTimeoutSecs: 9
requestTimeoutSecs: 30
session:
  timeoutSecs: 60
  maxSessions: 4
processPool:
  idleTtlSecs: 10
  maxInstances: 2
podPool:
  idleTtlSecs: 20
  readinessTimeoutSecs: 15
  controllerUrl: "http://controller:9000"
localState:
  targets:
    - id: gh
      name: github
      spec:
        http:
          baseUrl: "http://gh:8080/mcp"
      isolation: perUser
  policies:
    - id: 1
      kind: all
      effect: allow
      priority: 0
      subjects:
        - kind: everyone
  credentials:
    - targetId: gh
      scope: default
      key: AUTH_TOKEN
      value: sekrit
    - targetId: gh
      scope:
        user: alice
      key: AUTH_TOKEN
      value: alice-token
  tokens:
    - token: abc
      identity:
        userId: alice
        role: admin
        groups: [eng]
"#
	);
	let cfg = Config::from_yaml(&yaml).unwrap();
	assert_eq!(cfg.bind.port(), 8080);
	assert_eq!(cfg.path, "/gateway");
	assert_eq!(cfg.call_timeout, Duration::from_secs(9));
	assert_eq!(cfg.session.max_sessions, 4);
	assert_eq!(cfg.process_pool.max_instances, 2);
	assert_eq!(cfg.pod_pool.readiness_timeout, Duration::from_secs(15));
	assert_eq!(cfg.controller_url.as_deref(), Some("http://controller:9000"));
	assert_eq!(cfg.local_state.targets.len(), 1);
	assert_eq!(cfg.local_state.credentials.len(), 2);
	assert!(matches!(
		cfg.local_state.credentials[1].scope,
		CredentialScope::User(ref u) if u == "alice"
	));
	assert_eq!(cfg.local_state.tokens[0].identity.user_id, "alice");
}

#[test]
fn bad_key_rejected() {
	assert!(Config::from_yaml("credentialKey: \"deadbeef\"\n").is_err());
	assert!(Config::from_yaml("credentialKey: \"zz\"\n").is_err());
}

#[test]
fn unknown_fields_rejected() {
	let yaml = format!("credentialKey: \"{KEY}\"\nnotAField: 1\n");
	assert!(Config::from_yaml(&yaml).is_err());
}
