use serde_json::Value;

use crate::llm::{ChatRequest, ChatResponse, Content, Message, Part, ProxyError, Role};

pub const DIALECT: &str = "openai-responses";

/// Map an OpenAI Responses API body onto the canonical request. The
/// structured-output descriptor is preserved under
/// `extra_body.response_format` so connectors can forward it.
pub fn to_canonical_request(raw: types::ResponsesRequest) -> Result<ChatRequest, ProxyError> {
	if raw.model.is_empty() {
		return Err(ProxyError::invalid("model is required"));
	}
	let mut messages = Vec::new();
	if let Some(instructions) = raw.instructions {
		if !instructions.is_empty() {
			messages.push(Message::text(Role::System, instructions));
		}
	}
	match raw.input {
		types::Input::Text(text) => messages.push(Message::text(Role::User, text)),
		types::Input::Items(items) => {
			for item in items {
				let role = match item.role.as_deref() {
					Some("assistant") => Role::Assistant,
					Some("system") | Some("developer") => Role::System,
					_ => Role::User,
				};
				let content = match item.content {
					types::ItemContent::Text(t) => Content::Text(t),
					types::ItemContent::Parts(parts) => Content::Parts(
						parts
							.into_iter()
							.map(|p| Part::Text(p.text.unwrap_or_default()))
							.collect(),
					),
				};
				messages.push(Message {
					role,
					content,
					name: None,
					tool_call_id: None,
					tool_calls: None,
				});
			}
		},
	}
	if messages.is_empty() {
		return Err(ProxyError::invalid("input must not be empty"));
	}
	let mut extra_body = serde_json::Map::new();
	if let Some(format) = &raw.response_format {
		extra_body.insert("response_format".to_string(), format.clone());
	}
	Ok(ChatRequest {
		model: raw.model,
		messages,
		stream: raw.stream.unwrap_or(false),
		temperature: raw.temperature,
		top_p: raw.top_p,
		max_tokens: raw.max_output_tokens,
		response_format: raw.response_format,
		extra_body,
		..ChatRequest::default()
	})
}

/// Render the canonical response in Responses API shape; the output text is
/// additionally parsed best-effort into `parsed`.
pub fn from_canonical_response(resp: &ChatResponse) -> types::ResponsesResponse {
	let text = resp
		.choices
		.first()
		.and_then(|c| c.message.content.clone())
		.unwrap_or_default();
	types::ResponsesResponse {
		id: resp.id.clone(),
		object: "response".to_string(),
		created_at: resp.created,
		model: resp.model.clone(),
		status: "completed".to_string(),
		output: vec![types::OutputItem {
			r#type: "message".to_string(),
			role: "assistant".to_string(),
			content: vec![types::OutputContent {
				r#type: "output_text".to_string(),
				text: text.clone(),
				parsed: parse_structured_output(&text),
			}],
		}],
		usage: resp.usage.map(|u| types::ResponsesUsage {
			input_tokens: u.prompt_tokens,
			output_tokens: u.completion_tokens,
			total_tokens: u.total_tokens,
		}),
	}
}

/// Best-effort extraction of a JSON value from model output: the raw text,
/// a ```json fenced block, or the first brace-balanced `{...}` span.
pub fn parse_structured_output(text: &str) -> Option<Value> {
	let trimmed = text.trim();
	if let Ok(v) = serde_json::from_str::<Value>(trimmed) {
		if v.is_object() || v.is_array() {
			return Some(v);
		}
	}
	if let Some(fenced) = extract_fenced_json(trimmed) {
		if let Ok(v) = serde_json::from_str::<Value>(fenced) {
			return Some(v);
		}
	}
	if let Some(block) = extract_first_object(trimmed) {
		if let Ok(v) = serde_json::from_str::<Value>(block) {
			return Some(v);
		}
	}
	None
}

fn extract_fenced_json(text: &str) -> Option<&str> {
	let start = text.find("```json").map(|i| i + "```json".len()).or_else(|| {
		text.strip_prefix("```").map(|_| 3)
	})?;
	let rest = &text[start..];
	let end = rest.find("```")?;
	Some(rest[..end].trim())
}

fn extract_first_object(text: &str) -> Option<&str> {
	let start = text.find('{')?;
	let mut depth = 0usize;
	let mut in_string = false;
	let mut escaped = false;
	for (i, c) in text[start..].char_indices() {
		if escaped {
			escaped = false;
			continue;
		}
		match c {
			'\\' if in_string => escaped = true,
			'"' => in_string = !in_string,
			'{' if !in_string => depth += 1,
			'}' if !in_string => {
				depth -= 1;
				if depth == 0 {
					return Some(&text[start..start + i + 1]);
				}
			},
			_ => {},
		}
	}
	None
}

pub mod types {
	use serde::{Deserialize, Serialize};
	use serde_json::Value;

	#[derive(Debug, Clone, Serialize, Deserialize)]
	pub struct ResponsesRequest {
		pub model: String,
		pub input: Input,
		#[serde(skip_serializing_if = "Option::is_none")]
		pub instructions: Option<String>,
		#[serde(skip_serializing_if = "Option::is_none")]
		pub stream: Option<bool>,
		#[serde(skip_serializing_if = "Option::is_none")]
		pub temperature: Option<f64>,
		#[serde(skip_serializing_if = "Option::is_none")]
		pub top_p: Option<f64>,
		#[serde(skip_serializing_if = "Option::is_none")]
		pub max_output_tokens: Option<u64>,
		#[serde(skip_serializing_if = "Option::is_none")]
		pub response_format: Option<Value>,
	}

	#[derive(Debug, Clone, Serialize, Deserialize)]
	#[serde(untagged)]
	pub enum Input {
		Text(String),
		Items(Vec<InputItem>),
	}

	#[derive(Debug, Clone, Serialize, Deserialize)]
	pub struct InputItem {
		#[serde(skip_serializing_if = "Option::is_none")]
		pub role: Option<String>,
		pub content: ItemContent,
	}

	#[derive(Debug, Clone, Serialize, Deserialize)]
	#[serde(untagged)]
	pub enum ItemContent {
		Text(String),
		Parts(Vec<ItemPart>),
	}

	#[derive(Debug, Clone, Serialize, Deserialize)]
	pub struct ItemPart {
		#[serde(skip_serializing_if = "Option::is_none")]
		pub text: Option<String>,
	}

	#[derive(Debug, Clone, Serialize, Deserialize)]
	pub struct ResponsesResponse {
		pub id: String,
		pub object: String,
		pub created_at: i64,
		pub model: String,
		pub status: String,
		pub output: Vec<OutputItem>,
		#[serde(skip_serializing_if = "Option::is_none")]
		pub usage: Option<ResponsesUsage>,
	}

	#[derive(Debug, Clone, Serialize, Deserialize)]
	pub struct OutputItem {
		pub r#type: String,
		pub role: String,
		pub content: Vec<OutputContent>,
	}

	#[derive(Debug, Clone, Serialize, Deserialize)]
	pub struct OutputContent {
		pub r#type: String,
		pub text: String,
		#[serde(skip_serializing_if = "Option::is_none")]
		pub parsed: Option<Value>,
	}

	#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
	pub struct ResponsesUsage {
		pub input_tokens: u32,
		pub output_tokens: u32,
		pub total_tokens: u32,
	}
}
