use serde_json::Value;

use crate::llm::{
	ChatRequest, ChatResponse, Choice, Content, Delta, FinishReason, Message, Part, ProxyError,
	ResponseMessage, Role, StreamChoice, StreamChunk, Usage,
};

pub const DIALECT: &str = "openai-chat";

/// Map an OpenAI chat completions body onto the canonical request.
pub fn to_canonical_request(raw: types::ChatCompletionRequest) -> Result<ChatRequest, ProxyError> {
	if raw.model.is_empty() {
		return Err(ProxyError::invalid("model is required"));
	}
	if raw.messages.is_empty() {
		return Err(ProxyError::invalid("messages must not be empty"));
	}
	let messages = raw
		.messages
		.into_iter()
		.map(to_canonical_message)
		.collect::<Result<Vec<_>, _>>()?;
	Ok(ChatRequest {
		model: raw.model,
		messages,
		stream: raw.stream.unwrap_or(false),
		temperature: raw.temperature,
		top_p: raw.top_p,
		max_tokens: raw.max_completion_tokens.or(raw.max_tokens),
		stop: match raw.stop {
			Some(types::Stop::One(s)) => vec![s],
			Some(types::Stop::Many(v)) => v,
			None => Vec::new(),
		},
		presence_penalty: raw.presence_penalty,
		frequency_penalty: raw.frequency_penalty,
		seed: raw.seed,
		n: raw.n,
		logit_bias: raw.logit_bias,
		tools: raw.tools,
		tool_choice: raw.tool_choice,
		response_format: raw.response_format,
		extra_body: raw.extra.clone(),
		session_id: String::new(),
		agent: None,
	})
}

fn to_canonical_message(msg: types::RequestMessage) -> Result<Message, ProxyError> {
	let role = match msg.role.as_str() {
		"system" | "developer" => Role::System,
		"user" => Role::User,
		"assistant" => Role::Assistant,
		"tool" | "function" => Role::Tool,
		other => return Err(ProxyError::invalid(format!("unknown role: {other}"))),
	};
	let content = match msg.content {
		Some(types::MessageContent::Text(t)) => Content::Text(t),
		Some(types::MessageContent::Parts(parts)) => {
			let parts = parts
				.into_iter()
				.map(|p| match p {
					types::ContentPart::Text { text } => Ok(Part::Text(text)),
					types::ContentPart::ImageUrl { image_url } => Ok(Part::ImageUrl(image_url.url)),
				})
				.collect::<Result<Vec<_>, ProxyError>>()?;
			Content::Parts(parts)
		},
		None => Content::Text(String::new()),
	};
	Ok(Message {
		role,
		content,
		name: msg.name,
		tool_call_id: msg.tool_call_id,
		tool_calls: msg.tool_calls,
	})
}

/// Map the canonical request back to the OpenAI wire, used both to answer
/// OpenAI-dialect clients and by the OpenAI-compatible connectors.
pub fn from_canonical_request(req: &ChatRequest, model: &str) -> types::ChatCompletionRequest {
	types::ChatCompletionRequest {
		model: model.to_string(),
		messages: req.messages.iter().map(from_canonical_message).collect(),
		stream: if req.stream { Some(true) } else { None },
		temperature: req.temperature,
		top_p: req.top_p,
		max_tokens: req.max_tokens,
		max_completion_tokens: None,
		stop: match req.stop.len() {
			0 => None,
			1 => Some(types::Stop::One(req.stop[0].clone())),
			_ => Some(types::Stop::Many(req.stop.clone())),
		},
		presence_penalty: req.presence_penalty,
		frequency_penalty: req.frequency_penalty,
		seed: req.seed,
		n: req.n,
		logit_bias: req.logit_bias.clone(),
		tools: req.tools.clone(),
		tool_choice: req.tool_choice.clone(),
		response_format: req.response_format.clone(),
		extra: req.extra_body.clone(),
	}
}

fn from_canonical_message(msg: &Message) -> types::RequestMessage {
	let content = match &msg.content {
		Content::Text(t) => Some(types::MessageContent::Text(t.clone())),
		Content::Parts(parts) => Some(types::MessageContent::Parts(
			parts
				.iter()
				.map(|p| match p {
					Part::Text(t) => types::ContentPart::Text { text: t.clone() },
					Part::ImageUrl(url) => types::ContentPart::ImageUrl {
						image_url: types::ImageUrl { url: url.clone() },
					},
					// Non-Gemini targets only ever see a textual placeholder
					// for binary attachments.
					Part::InlineData { mime, .. } => types::ContentPart::Text {
						text: format!("[Attachment: {mime}]"),
					},
				})
				.collect(),
		)),
	};
	types::RequestMessage {
		role: msg.role.as_str().to_string(),
		content,
		name: msg.name.clone(),
		tool_call_id: msg.tool_call_id.clone(),
		tool_calls: msg.tool_calls.clone(),
	}
}

pub fn to_canonical_response(raw: types::ChatCompletionResponse) -> Result<ChatResponse, ProxyError> {
	let choices = raw
		.choices
		.into_iter()
		.map(|c| Choice {
			index: c.index,
			message: ResponseMessage {
				role: Role::Assistant,
				content: c.message.content,
				tool_calls: c.message.tool_calls,
				parsed: None,
			},
			finish_reason: c.finish_reason.as_deref().and_then(finish_reason_from_str),
		})
		.collect();
	Ok(ChatResponse {
		id: raw.id,
		created: raw.created,
		model: raw.model,
		object: raw.object,
		choices,
		usage: raw.usage,
	})
}

pub fn from_canonical_response(resp: &ChatResponse) -> types::ChatCompletionResponse {
	types::ChatCompletionResponse {
		id: resp.id.clone(),
		object: "chat.completion".to_string(),
		created: resp.created,
		model: resp.model.clone(),
		choices: resp
			.choices
			.iter()
			.map(|c| types::ResponseChoice {
				index: c.index,
				message: types::ResponseChoiceMessage {
					role: "assistant".to_string(),
					content: c.message.content.clone(),
					tool_calls: c.message.tool_calls.clone(),
				},
				finish_reason: c.finish_reason.map(|f| finish_reason_str(f).to_string()),
			})
			.collect(),
		usage: resp.usage,
	}
}

pub fn to_canonical_stream_chunk(raw: types::ChatCompletionChunk) -> StreamChunk {
	StreamChunk {
		id: raw.id,
		created: raw.created,
		model: raw.model,
		choices: raw
			.choices
			.into_iter()
			.map(|c| StreamChoice {
				index: c.index,
				delta: Delta {
					role: c.delta.role.as_deref().and_then(|r| match r {
						"assistant" => Some(Role::Assistant),
						"user" => Some(Role::User),
						"system" => Some(Role::System),
						"tool" => Some(Role::Tool),
						_ => None,
					}),
					content: c.delta.content,
					tool_calls: c.delta.tool_calls,
				},
				finish_reason: c.finish_reason.as_deref().and_then(finish_reason_from_str),
			})
			.collect(),
		usage: raw.usage,
	}
}

pub fn from_canonical_stream_chunk(chunk: &StreamChunk) -> types::ChatCompletionChunk {
	types::ChatCompletionChunk {
		id: chunk.id.clone(),
		object: "chat.completion.chunk".to_string(),
		created: chunk.created,
		model: chunk.model.clone(),
		choices: chunk
			.choices
			.iter()
			.map(|c| types::ChunkChoice {
				index: c.index,
				delta: types::ChunkDelta {
					role: c.delta.role.map(|r| r.as_str().to_string()),
					content: c.delta.content.clone(),
					tool_calls: c.delta.tool_calls.clone(),
				},
				finish_reason: c.finish_reason.map(|f| finish_reason_str(f).to_string()),
			})
			.collect(),
		usage: chunk.usage,
	}
}

pub fn finish_reason_from_str(s: &str) -> Option<FinishReason> {
	match s {
		"stop" => Some(FinishReason::Stop),
		"length" => Some(FinishReason::Length),
		"content_filter" => Some(FinishReason::ContentFilter),
		"tool_calls" | "function_call" => Some(FinishReason::ToolCalls),
		_ => None,
	}
}

pub fn finish_reason_str(f: FinishReason) -> &'static str {
	match f {
		FinishReason::Stop => "stop",
		FinishReason::Length => "length",
		FinishReason::ContentFilter => "content_filter",
		FinishReason::ToolCalls => "tool_calls",
	}
}

/// Legacy `/v1/completions` adapter: a prompt becomes a single user message.
pub fn completions_to_canonical(raw: types::CompletionRequest) -> Result<ChatRequest, ProxyError> {
	if raw.model.is_empty() {
		return Err(ProxyError::invalid("model is required"));
	}
	let mut req = ChatRequest {
		model: raw.model,
		messages: vec![Message::text(Role::User, raw.prompt)],
		stream: raw.stream.unwrap_or(false),
		temperature: raw.temperature,
		top_p: raw.top_p,
		max_tokens: raw.max_tokens,
		..ChatRequest::default()
	};
	if let Some(stop) = raw.stop {
		req.stop = match stop {
			types::Stop::One(s) => vec![s],
			types::Stop::Many(v) => v,
		};
	}
	Ok(req)
}

pub fn from_canonical_completions_response(resp: &ChatResponse) -> Value {
	serde_json::json!({
		"id": resp.id,
		"object": "text_completion",
		"created": resp.created,
		"model": resp.model,
		"choices": resp.choices.iter().map(|c| serde_json::json!({
			"index": c.index,
			"text": c.message.content.clone().unwrap_or_default(),
			"finish_reason": c.finish_reason.map(finish_reason_str),
		})).collect::<Vec<_>>(),
		"usage": resp.usage,
	})
}

pub mod types {
	use serde::{Deserialize, Serialize};
	use serde_json::Value;

	use crate::llm::Usage;

	#[derive(Debug, Clone, Serialize, Deserialize)]
	pub struct ChatCompletionRequest {
		pub model: String,
		pub messages: Vec<RequestMessage>,
		#[serde(skip_serializing_if = "Option::is_none")]
		pub stream: Option<bool>,
		#[serde(skip_serializing_if = "Option::is_none")]
		pub temperature: Option<f64>,
		#[serde(skip_serializing_if = "Option::is_none")]
		pub top_p: Option<f64>,
		#[serde(skip_serializing_if = "Option::is_none")]
		pub max_tokens: Option<u64>,
		#[serde(skip_serializing_if = "Option::is_none")]
		pub max_completion_tokens: Option<u64>,
		#[serde(skip_serializing_if = "Option::is_none")]
		pub stop: Option<Stop>,
		#[serde(skip_serializing_if = "Option::is_none")]
		pub presence_penalty: Option<f64>,
		#[serde(skip_serializing_if = "Option::is_none")]
		pub frequency_penalty: Option<f64>,
		#[serde(skip_serializing_if = "Option::is_none")]
		pub seed: Option<i64>,
		#[serde(skip_serializing_if = "Option::is_none")]
		pub n: Option<u32>,
		#[serde(skip_serializing_if = "Option::is_none")]
		pub logit_bias: Option<Value>,
		#[serde(skip_serializing_if = "Option::is_none")]
		pub tools: Option<Value>,
		#[serde(skip_serializing_if = "Option::is_none")]
		pub tool_choice: Option<Value>,
		#[serde(skip_serializing_if = "Option::is_none")]
		pub response_format: Option<Value>,
		#[serde(flatten)]
		pub extra: serde_json::Map<String, Value>,
	}

	#[derive(Debug, Clone, Serialize, Deserialize)]
	#[serde(untagged)]
	pub enum Stop {
		One(String),
		Many(Vec<String>),
	}

	#[derive(Debug, Clone, Serialize, Deserialize)]
	pub struct RequestMessage {
		pub role: String,
		#[serde(skip_serializing_if = "Option::is_none")]
		pub content: Option<MessageContent>,
		#[serde(skip_serializing_if = "Option::is_none")]
		pub name: Option<String>,
		#[serde(skip_serializing_if = "Option::is_none")]
		pub tool_call_id: Option<String>,
		#[serde(skip_serializing_if = "Option::is_none")]
		pub tool_calls: Option<Value>,
	}

	#[derive(Debug, Clone, Serialize, Deserialize)]
	#[serde(untagged)]
	pub enum MessageContent {
		Text(String),
		Parts(Vec<ContentPart>),
	}

	#[derive(Debug, Clone, Serialize, Deserialize)]
	#[serde(tag = "type", rename_all = "snake_case")]
	pub enum ContentPart {
		Text { text: String },
		ImageUrl { image_url: ImageUrl },
	}

	#[derive(Debug, Clone, Serialize, Deserialize)]
	pub struct ImageUrl {
		pub url: String,
	}

	#[derive(Debug, Clone, Serialize, Deserialize)]
	pub struct ChatCompletionResponse {
		pub id: String,
		#[serde(default = "default_chat_object")]
		pub object: String,
		#[serde(default)]
		pub created: i64,
		#[serde(default)]
		pub model: String,
		pub choices: Vec<ResponseChoice>,
		#[serde(skip_serializing_if = "Option::is_none")]
		pub usage: Option<Usage>,
	}

	fn default_chat_object() -> String {
		"chat.completion".to_string()
	}

	#[derive(Debug, Clone, Serialize, Deserialize)]
	pub struct ResponseChoice {
		#[serde(default)]
		pub index: u32,
		pub message: ResponseChoiceMessage,
		#[serde(skip_serializing_if = "Option::is_none")]
		pub finish_reason: Option<String>,
	}

	#[derive(Debug, Clone, Serialize, Deserialize)]
	pub struct ResponseChoiceMessage {
		#[serde(default = "default_assistant_role")]
		pub role: String,
		#[serde(default)]
		pub content: Option<String>,
		#[serde(skip_serializing_if = "Option::is_none")]
		pub tool_calls: Option<Value>,
	}

	fn default_assistant_role() -> String {
		"assistant".to_string()
	}

	#[derive(Debug, Clone, Serialize, Deserialize)]
	pub struct ChatCompletionChunk {
		pub id: String,
		#[serde(default = "default_chunk_object")]
		pub object: String,
		#[serde(default)]
		pub created: i64,
		#[serde(default)]
		pub model: String,
		pub choices: Vec<ChunkChoice>,
		#[serde(skip_serializing_if = "Option::is_none")]
		pub usage: Option<Usage>,
	}

	fn default_chunk_object() -> String {
		"chat.completion.chunk".to_string()
	}

	#[derive(Debug, Clone, Serialize, Deserialize)]
	pub struct ChunkChoice {
		#[serde(default)]
		pub index: u32,
		pub delta: ChunkDelta,
		#[serde(skip_serializing_if = "Option::is_none")]
		pub finish_reason: Option<String>,
	}

	#[derive(Debug, Clone, Default, Serialize, Deserialize)]
	pub struct ChunkDelta {
		#[serde(skip_serializing_if = "Option::is_none")]
		pub role: Option<String>,
		#[serde(skip_serializing_if = "Option::is_none")]
		pub content: Option<String>,
		#[serde(skip_serializing_if = "Option::is_none")]
		pub tool_calls: Option<Value>,
	}

	#[derive(Debug, Clone, Serialize, Deserialize)]
	pub struct CompletionRequest {
		pub model: String,
		pub prompt: String,
		#[serde(skip_serializing_if = "Option::is_none")]
		pub stream: Option<bool>,
		#[serde(skip_serializing_if = "Option::is_none")]
		pub temperature: Option<f64>,
		#[serde(skip_serializing_if = "Option::is_none")]
		pub top_p: Option<f64>,
		#[serde(skip_serializing_if = "Option::is_none")]
		pub max_tokens: Option<u64>,
		#[serde(skip_serializing_if = "Option::is_none")]
		pub stop: Option<Stop>,
	}

	/// `/v1/models` entry.
	#[derive(Debug, Clone, Serialize, Deserialize)]
	pub struct ModelEntry {
		pub id: String,
		pub object: String,
		pub created: i64,
		pub owned_by: String,
	}
}
