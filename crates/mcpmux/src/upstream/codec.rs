//! Incremental server-sent-events decoding for upstream byte streams.

/// One decoded SSE event.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct SseEvent {
	pub event: Option<String>,
	pub data: String,
	pub id: Option<String>,
}

/// Push-based SSE decoder. Feed raw body chunks; complete events (terminated
/// by a blank line) come back out. Comment lines and `retry:` are dropped.
#[derive(Debug, Default)]
pub(crate) struct SseDecoder {
	buf: String,
}

impl SseDecoder {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
		let Ok(text) = std::str::from_utf8(chunk) else {
			// Chunk boundaries should not split UTF-8 in practice (payloads
			// are ASCII-framed JSON); a malformed chunk is skipped.
			return Vec::new();
		};
		self.buf.push_str(text);
		// Normalize CRLF so the scan below only deals with \n\n.
		if self.buf.contains('\r') {
			self.buf = self.buf.replace("\r\n", "\n");
		}

		let mut events = Vec::new();
		while let Some(pos) = self.buf.find("\n\n") {
			let block = self.buf[..pos].to_string();
			self.buf.drain(..pos + 2);
			if let Some(ev) = parse_block(&block) {
				events.push(ev);
			}
		}
		events
	}
}

fn parse_block(block: &str) -> Option<SseEvent> {
	let mut event = SseEvent::default();
	let mut data_lines: Vec<&str> = Vec::new();
	for line in block.lines() {
		if line.starts_with(':') {
			continue;
		}
		if let Some(v) = line.strip_prefix("data:") {
			data_lines.push(v.strip_prefix(' ').unwrap_or(v));
		} else if let Some(v) = line.strip_prefix("event:") {
			event.event = Some(v.trim().to_string());
		} else if let Some(v) = line.strip_prefix("id:") {
			event.id = Some(v.trim().to_string());
		}
		// retry: is the reconnect hint; connection management is ours.
	}
	if data_lines.is_empty() && event.event.is_none() {
		return None;
	}
	event.data = data_lines.join("\n");
	Some(event)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn single_event() {
		let mut d = SseDecoder::new();
		let evs = d.push(b"data: {\"jsonrpc\":\"2.0\"}\n\n");
		assert_eq!(evs.len(), 1);
		assert_eq!(evs[0].data, r#"{"jsonrpc":"2.0"}"#);
		assert!(evs[0].event.is_none());
	}

	#[test]
	fn split_across_chunks() {
		let mut d = SseDecoder::new();
		assert!(d.push(b"data: par").is_empty());
		assert!(d.push(b"tial").is_empty());
		let evs = d.push(b"\n\n");
		assert_eq!(evs.len(), 1);
		assert_eq!(evs[0].data, "partial");
	}

	#[test]
	fn multiple_events_one_chunk() {
		let mut d = SseDecoder::new();
		let evs = d.push(b"data: a\n\nid: 7\ndata: b\n\n");
		assert_eq!(evs.len(), 2);
		assert_eq!(evs[0].data, "a");
		assert_eq!(evs[1].data, "b");
		assert_eq!(evs[1].id.as_deref(), Some("7"));
	}

	#[test]
	fn event_type_and_multiline_data() {
		let mut d = SseDecoder::new();
		let evs = d.push(b"event: endpoint\ndata: /messages?sid=1\n\n");
		assert_eq!(evs[0].event.as_deref(), Some("endpoint"));
		assert_eq!(evs[0].data, "/messages?sid=1");

		let evs = d.push(b"data: line1\ndata: line2\n\n");
		assert_eq!(evs[0].data, "line1\nline2");
	}

	#[test]
	fn crlf_and_comments() {
		let mut d = SseDecoder::new();
		let evs = d.push(b": keepalive\r\n\r\ndata: x\r\n\r\n");
		assert_eq!(evs.len(), 1);
		assert_eq!(evs[0].data, "x");
	}
}
