use crate::llm::{
	ChatRequest, ChatResponse, Content, FinishReason, Message, Part, ProxyError, StreamChunk,
};

pub const DIALECT: &str = "anthropic";

/// Map an Anthropic Messages body onto the canonical request. The top-level
/// `system` parameter becomes a leading canonical system message.
pub fn to_canonical_request(raw: types::MessagesRequest) -> Result<ChatRequest, ProxyError> {
	if raw.model.is_empty() {
		return Err(ProxyError::invalid("model is required"));
	}
	if raw.messages.is_empty() {
		return Err(ProxyError::invalid("messages must not be empty"));
	}
	let mut messages = Vec::with_capacity(raw.messages.len() + 1);
	if let Some(system) = raw.system {
		if !system.is_empty() {
			messages.push(Message::text(crate::llm::Role::System, system));
		}
	}
	for msg in raw.messages {
		let role = match msg.role {
			types::Role::User => crate::llm::Role::User,
			types::Role::Assistant => crate::llm::Role::Assistant,
		};
		let content = match msg.content {
			types::MessageContent::Text(t) => Content::Text(t),
			types::MessageContent::Blocks(blocks) => {
				let parts = blocks
					.into_iter()
					.filter_map(|b| match b {
						types::ContentBlock::Text { text } => Some(Part::Text(text)),
						types::ContentBlock::Image { source } => Some(Part::InlineData {
							mime: source.media_type,
							data: source.data,
						}),
					})
					.collect();
				Content::Parts(parts)
			},
		};
		messages.push(Message {
			role,
			content,
			name: None,
			tool_call_id: None,
			tool_calls: None,
		});
	}
	Ok(ChatRequest {
		model: raw.model,
		messages,
		stream: raw.stream.unwrap_or(false),
		temperature: raw.temperature,
		top_p: raw.top_p,
		max_tokens: Some(raw.max_tokens),
		stop: raw.stop_sequences.unwrap_or_default(),
		..ChatRequest::default()
	})
}

pub fn from_canonical_response(resp: &ChatResponse) -> types::MessagesResponse {
	let first = resp.choices.first();
	let text = first
		.and_then(|c| c.message.content.clone())
		.unwrap_or_default();
	types::MessagesResponse {
		id: resp.id.clone(),
		r#type: "message".to_string(),
		role: types::Role::Assistant,
		content: vec![types::ContentBlock::Text { text }],
		model: resp.model.clone(),
		stop_reason: first
			.and_then(|c| c.finish_reason)
			.map(stop_reason_from_finish),
		stop_sequence: None,
		usage: resp.usage.map(|u| types::Usage {
			input_tokens: u.prompt_tokens,
			output_tokens: u.completion_tokens,
		}),
	}
}

fn stop_reason_from_finish(f: FinishReason) -> types::StopReason {
	match f {
		FinishReason::Length => types::StopReason::MaxTokens,
		FinishReason::ToolCalls => types::StopReason::ToolUse,
		_ => types::StopReason::EndTurn,
	}
}

/// Incremental translator for the Anthropic streaming event sequence.
///
/// Anthropic framing requires bracketing events around the deltas, so this
/// keeps just enough state to emit `message_start`/`content_block_start`
/// ahead of the first delta and the closing events at end of stream.
#[derive(Default)]
pub struct StreamTranslator {
	started: bool,
	model: String,
}

impl StreamTranslator {
	pub fn new() -> Self {
		Self::default()
	}

	/// Translate one canonical chunk into zero or more named SSE events.
	pub fn translate(&mut self, chunk: &StreamChunk) -> Vec<(&'static str, serde_json::Value)> {
		let mut events = Vec::new();
		if !self.started {
			self.started = true;
			self.model = chunk.model.clone();
			events.push((
				"message_start",
				serde_json::json!({
					"type": "message_start",
					"message": {
						"id": chunk.id,
						"type": "message",
						"role": "assistant",
						"content": [],
						"model": chunk.model,
						"stop_reason": null,
						"usage": {"input_tokens": 0, "output_tokens": 0},
					}
				}),
			));
			events.push((
				"content_block_start",
				serde_json::json!({
					"type": "content_block_start",
					"index": 0,
					"content_block": {"type": "text", "text": ""},
				}),
			));
		}
		for choice in &chunk.choices {
			if let Some(text) = &choice.delta.content {
				if !text.is_empty() {
					events.push((
						"content_block_delta",
						serde_json::json!({
							"type": "content_block_delta",
							"index": 0,
							"delta": {"type": "text_delta", "text": text},
						}),
					));
				}
			}
			if let Some(f) = choice.finish_reason {
				let stop_reason = match stop_reason_from_finish(f) {
					types::StopReason::EndTurn => "end_turn",
					types::StopReason::MaxTokens => "max_tokens",
					types::StopReason::StopSequence => "stop_sequence",
					types::StopReason::ToolUse => "tool_use",
				};
				events.push((
					"content_block_stop",
					serde_json::json!({"type": "content_block_stop", "index": 0}),
				));
				events.push((
					"message_delta",
					serde_json::json!({
						"type": "message_delta",
						"delta": {"stop_reason": stop_reason, "stop_sequence": null},
						"usage": {
							"output_tokens": chunk.usage.map(|u| u.completion_tokens).unwrap_or(0),
						},
					}),
				));
				events.push(("message_stop", serde_json::json!({"type": "message_stop"})));
			}
		}
		events
	}
}

pub mod types {
	use serde::{Deserialize, Serialize};

	#[derive(Copy, Clone, Deserialize, Serialize, Debug, PartialEq, Eq)]
	#[serde(rename_all = "snake_case")]
	pub enum Role {
		User,
		Assistant,
	}

	#[derive(Debug, Clone, Serialize, Deserialize)]
	pub struct MessagesRequest {
		pub model: String,
		pub messages: Vec<RequestMessage>,
		#[serde(skip_serializing_if = "Option::is_none")]
		pub system: Option<String>,
		pub max_tokens: u64,
		#[serde(skip_serializing_if = "Option::is_none")]
		pub stop_sequences: Option<Vec<String>>,
		#[serde(skip_serializing_if = "Option::is_none")]
		pub stream: Option<bool>,
		#[serde(skip_serializing_if = "Option::is_none")]
		pub temperature: Option<f64>,
		#[serde(skip_serializing_if = "Option::is_none")]
		pub top_p: Option<f64>,
	}

	#[derive(Debug, Clone, Serialize, Deserialize)]
	pub struct RequestMessage {
		pub role: Role,
		pub content: MessageContent,
	}

	#[derive(Debug, Clone, Serialize, Deserialize)]
	#[serde(untagged)]
	pub enum MessageContent {
		Text(String),
		Blocks(Vec<ContentBlock>),
	}

	#[derive(Debug, Clone, Serialize, Deserialize)]
	#[serde(rename_all = "snake_case", tag = "type")]
	pub enum ContentBlock {
		Text { text: String },
		Image { source: ImageSource },
	}

	#[derive(Debug, Clone, Serialize, Deserialize)]
	pub struct ImageSource {
		pub r#type: String,
		pub media_type: String,
		pub data: String,
	}

	#[derive(Debug, Clone, Serialize, Deserialize)]
	pub struct MessagesResponse {
		pub id: String,
		pub r#type: String,
		pub role: Role,
		pub content: Vec<ContentBlock>,
		pub model: String,
		pub stop_reason: Option<StopReason>,
		pub stop_sequence: Option<String>,
		#[serde(skip_serializing_if = "Option::is_none")]
		pub usage: Option<Usage>,
	}

	#[derive(Copy, Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
	#[serde(rename_all = "snake_case")]
	pub enum StopReason {
		EndTurn,
		MaxTokens,
		StopSequence,
		ToolUse,
	}

	#[derive(Copy, Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
	pub struct Usage {
		pub input_tokens: u32,
		pub output_tokens: u32,
	}

	#[derive(Debug, Deserialize)]
	pub struct MessagesErrorResponse {
		pub r#type: String,
		pub error: MessagesError,
	}

	#[derive(Debug, Deserialize)]
	pub struct MessagesError {
		pub r#type: String,
		pub message: String,
	}
}
