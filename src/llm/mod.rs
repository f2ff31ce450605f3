use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub mod anthropic;
pub mod gemini;
pub mod openai;
pub mod responses;

/// Dialect-agnostic chat request threaded through the whole pipeline.
///
/// Every front end translates into this value and every connector translates
/// out of it. `model` may carry a `<backend>:<model>` or `<backend>/<model>`
/// prefix which the dispatcher resolves.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatRequest {
	pub model: String,
	pub messages: Vec<Message>,
	pub stream: bool,
	pub temperature: Option<f64>,
	pub top_p: Option<f64>,
	pub max_tokens: Option<u64>,
	pub stop: Vec<String>,
	pub presence_penalty: Option<f64>,
	pub frequency_penalty: Option<f64>,
	pub seed: Option<i64>,
	pub n: Option<u32>,
	pub logit_bias: Option<Value>,
	/// Opaque to the core; forwarded to the connector untouched.
	pub tools: Option<Value>,
	pub tool_choice: Option<Value>,
	pub response_format: Option<Value>,
	/// Vendor-specific passthrough. Session-injected reasoning knobs land
	/// here under `reasoning_effort` / `thinking_budget`.
	pub extra_body: serde_json::Map<String, Value>,
	pub session_id: String,
	pub agent: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
	System,
	User,
	Assistant,
	Tool,
}

impl Role {
	pub fn as_str(&self) -> &'static str {
		match self {
			Role::System => "system",
			Role::User => "user",
			Role::Assistant => "assistant",
			Role::Tool => "tool",
		}
	}
}

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
	pub role: Role,
	pub content: Content,
	pub name: Option<String>,
	pub tool_call_id: Option<String>,
	pub tool_calls: Option<Value>,
}

impl Message {
	pub fn text(role: Role, text: impl Into<String>) -> Self {
		Message {
			role,
			content: Content::Text(text.into()),
			name: None,
			tool_call_id: None,
			tool_calls: None,
		}
	}

	/// All text parts joined with single spaces, the view the command
	/// interpreter scans.
	pub fn joined_text(&self) -> String {
		match &self.content {
			Content::Text(t) => t.clone(),
			Content::Parts(parts) => parts
				.iter()
				.filter_map(|p| match p {
					Part::Text(t) => Some(t.as_str()),
					_ => None,
				})
				.collect::<Vec<_>>()
				.join(" "),
		}
	}

	/// True when nothing but whitespace remains in the text content. A
	/// message holding a non-text part is never empty.
	pub fn is_effectively_empty(&self) -> bool {
		match &self.content {
			Content::Text(t) => t.trim().is_empty(),
			Content::Parts(parts) => parts.iter().all(|p| match p {
				Part::Text(t) => t.trim().is_empty(),
				_ => false,
			}),
		}
	}
}

#[derive(Debug, Clone, PartialEq)]
pub enum Content {
	Text(String),
	Parts(Vec<Part>),
}

impl Default for Content {
	fn default() -> Self {
		Content::Text(String::new())
	}
}

#[derive(Debug, Clone, PartialEq)]
pub enum Part {
	Text(String),
	ImageUrl(String),
	/// Raw binary attachment; `data` is base64.
	InlineData { mime: String, data: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatResponse {
	pub id: String,
	pub created: i64,
	pub model: String,
	pub object: String,
	pub choices: Vec<Choice>,
	pub usage: Option<Usage>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Choice {
	pub index: u32,
	pub message: ResponseMessage,
	pub finish_reason: Option<FinishReason>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseMessage {
	pub role: Role,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub content: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub tool_calls: Option<Value>,
	/// Best-effort structured output, filled only on the Responses path.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub parsed: Option<Value>,
}

impl ResponseMessage {
	pub fn assistant(content: impl Into<String>) -> Self {
		ResponseMessage {
			role: Role::Assistant,
			content: Some(content.into()),
			tool_calls: None,
			parsed: None,
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
	Stop,
	Length,
	ContentFilter,
	ToolCalls,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
	pub prompt_tokens: u32,
	pub completion_tokens: u32,
	pub total_tokens: u32,
}

/// One streaming delta in canonical form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamChunk {
	pub id: String,
	pub created: i64,
	pub model: String,
	pub choices: Vec<StreamChoice>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub usage: Option<Usage>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamChoice {
	pub index: u32,
	pub delta: Delta,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub finish_reason: Option<FinishReason>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Delta {
	#[serde(skip_serializing_if = "Option::is_none")]
	pub role: Option<Role>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub content: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub tool_calls: Option<Value>,
}

impl StreamChunk {
	/// Terminal chunk synthesized from the `[DONE]` sentinel.
	pub fn end_of_stream(model: &str) -> Self {
		StreamChunk {
			id: new_response_id(),
			created: chrono::Utc::now().timestamp(),
			model: model.to_string(),
			choices: vec![StreamChoice {
				index: 0,
				delta: Delta::default(),
				finish_reason: Some(FinishReason::Stop),
			}],
			usage: None,
		}
	}
}

pub fn new_response_id() -> String {
	use rand::Rng;
	let suffix: String = rand::rng()
		.sample_iter(rand::distr::Alphanumeric)
		.take(24)
		.map(char::from)
		.collect();
	format!("chatcmpl-{suffix}")
}

/// A `<backend>:<model>` or `<backend>/<model>` reference. The backend part
/// is only accepted when it names a known backend, so model ids containing
/// `/` (e.g. `mistralai/mistral-7b`) pass through intact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelRef {
	pub backend: String,
	pub model: String,
}

impl ModelRef {
	pub fn parse(raw: &str, known_backends: &[&str]) -> Option<ModelRef> {
		for sep in [':', '/'] {
			if let Some((b, m)) = raw.split_once(sep) {
				if !m.is_empty() && known_backends.contains(&b) {
					return Some(ModelRef {
						backend: b.to_string(),
						model: m.to_string(),
					});
				}
			}
		}
		None
	}
}

/// Pipeline error, carried as a value between components and converted to
/// the source dialect only at the HTTP boundary.
#[derive(thiserror::Error, Debug)]
pub enum ProxyError {
	#[error("invalid request: {0}")]
	InvalidRequest(String),
	#[error("unauthorized")]
	Unauthorized,
	#[error("unknown model: {0}")]
	UnknownModel(String),
	#[error("rate limited")]
	RateLimited { delay_seconds: Option<f64> },
	#[error("transient upstream error: {0}")]
	Transient(String),
	#[error("upstream error ({status}): {message}")]
	Terminal { status: u16, message: String },
	#[error("all backends unavailable")]
	AllBackendsUnavailable { earliest_retry: Option<Instant> },
	#[error("loop detected in streaming response")]
	LoopDetected,
	#[error("request cancelled")]
	Cancelled,
}

impl ProxyError {
	pub fn invalid(msg: impl Into<String>) -> Self {
		ProxyError::InvalidRequest(msg.into())
	}
}
