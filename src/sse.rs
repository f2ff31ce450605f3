use bytes::Bytes;
use eventsource_stream::Eventsource;
use futures::{Stream, StreamExt};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::llm::ProxyError;

pub const DONE_FRAME: &str = "data: [DONE]\n\n";

/// Encode one value as an SSE data frame: `data: <json>\n\n`.
pub fn frame<T: Serialize>(value: &T) -> String {
	// Serialization of our own wire types cannot fail.
	let json = serde_json::to_string(value).unwrap_or_default();
	format!("data: {json}\n\n")
}

/// Encode a named event frame, as the Anthropic stream dialect requires.
pub fn named_frame<T: Serialize>(event: &str, value: &T) -> String {
	let json = serde_json::to_string(value).unwrap_or_default();
	format!("event: {event}\ndata: {json}\n\n")
}

/// Decoded upstream SSE item: either a JSON payload or the `[DONE]` sentinel.
pub enum SseItem<T> {
	Data(T),
	Done,
}

/// Turn an upstream HTTP byte stream into a stream of decoded SSE payloads.
/// Malformed frames are skipped with a debug log; transport errors surface
/// as `Transient`.
pub fn decode_json_stream<T, S, E>(
	bytes: S,
) -> impl Stream<Item = Result<SseItem<T>, ProxyError>> + Send
where
	T: DeserializeOwned + Send + 'static,
	S: Stream<Item = Result<Bytes, E>> + Send + 'static,
	E: std::error::Error + Send + Sync + 'static,
{
	bytes.eventsource().filter_map(|event| async move {
		match event {
			Ok(event) => {
				if event.data == "[DONE]" {
					return Some(Ok(SseItem::Done));
				}
				match serde_json::from_str::<T>(&event.data) {
					Ok(value) => Some(Ok(SseItem::Data(value))),
					Err(err) => {
						tracing::debug!(?err, "skipping malformed SSE frame");
						None
					},
				}
			},
			Err(err) => Some(Err(ProxyError::Transient(format!("stream error: {err}")))),
		}
	})
}
