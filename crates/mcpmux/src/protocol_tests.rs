use serde_json::json;

use super::*;

#[test]
fn classify_request() {
	let m = Message::from_str(r#"{"jsonrpc":"2.0","id":1,"method":"tools/list"}"#).unwrap();
	let Message::Request(r) = m else {
		panic!("expected request")
	};
	assert_eq!(r.method, METHOD_TOOLS_LIST);
	assert_eq!(r.id, RequestId::Number(1));
}

#[test]
fn classify_notification() {
	let m = Message::from_str(r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#).unwrap();
	assert!(matches!(m, Message::Notification(_)));
}

#[test]
fn classify_response_and_error() {
	let m = Message::from_str(r#"{"jsonrpc":"2.0","id":"a","result":{}}"#).unwrap();
	let Message::Response(r) = m else {
		panic!("expected response")
	};
	assert_eq!(r.id, RequestId::String("a".to_string()));

	let m =
		Message::from_str(r#"{"jsonrpc":"2.0","id":2,"error":{"code":-32601,"message":"nope"}}"#)
			.unwrap();
	let Message::Error(e) = m else {
		panic!("expected error")
	};
	assert_eq!(e.error.code, CODE_METHOD_NOT_FOUND);
}

#[test]
fn null_id_is_notification() {
	// Some servers send notifications with an explicit null id.
	let m = Message::from_str(r#"{"jsonrpc":"2.0","id":null,"method":"notifications/progress"}"#)
		.unwrap();
	assert!(matches!(m, Message::Notification(_)));
}

#[test]
fn rejects_non_messages() {
	assert!(Message::from_str("[]").is_err());
	assert!(Message::from_str(r#"{"jsonrpc":"2.0"}"#).is_err());
	assert!(Message::from_str("not json").is_err());
}

#[test]
fn list_items_by_surface() {
	let result = json!({
		"tools": [
			{"name": "search", "description": "find things"},
			{"name": "fetch"},
		]
	});
	let items = list_items(CatalogSurface::Tools, &result);
	assert_eq!(items.len(), 2);
	assert_eq!(items[0].0, "search");

	let result = json!({
		"resources": [{"uri": "file:///a", "name": "a"}]
	});
	let items = list_items(CatalogSurface::Resources, &result);
	assert_eq!(items[0].0, "file:///a");
}

#[test]
fn rename_item_rewrites_name_field() {
	let mut item = json!({"name": "search", "description": "d"});
	rename_item(CatalogSurface::Tools, &mut item, "github_search");
	assert_eq!(item["name"], "github_search");
	assert_eq!(item["description"], "d");
}

#[test]
fn roundtrip_preserves_result_payload() {
	let raw = r#"{"jsonrpc":"2.0","id":7,"result":{"content":[{"type":"text","text":"hi"}],"isError":false}}"#;
	let m = Message::from_str(raw).unwrap();
	let v = m.to_value();
	let parsed: serde_json::Value = serde_json::from_str(raw).unwrap();
	assert_eq!(v, parsed);
}
