use crate::llm::{
	ChatRequest, ChatResponse, Choice, Content, Delta, FinishReason, Message, Part, ProxyError,
	ResponseMessage, Role, StreamChoice, StreamChunk, Usage, new_response_id,
};

pub const DIALECT: &str = "gemini";

/// Map a Gemini `generateContent` body onto the canonical request.
/// `system_instruction` is prepended as a canonical system message.
pub fn to_canonical_request(
	model: &str,
	raw: types::GenerateContentRequest,
	stream: bool,
) -> Result<ChatRequest, ProxyError> {
	if raw.contents.is_empty() {
		return Err(ProxyError::invalid("contents must not be empty"));
	}
	let mut messages = Vec::with_capacity(raw.contents.len() + 1);
	if let Some(system) = raw.system_instruction {
		let text = joined_part_text(&system.parts);
		if !text.is_empty() {
			messages.push(Message::text(Role::System, text));
		}
	}
	for content in raw.contents {
		let role = match content.role.as_deref() {
			Some("model") => Role::Assistant,
			Some("function") => Role::Tool,
			_ => Role::User,
		};
		messages.push(Message {
			role,
			content: to_canonical_parts(content.parts),
			name: None,
			tool_call_id: None,
			tool_calls: None,
		});
	}
	let generation = raw.generation_config.unwrap_or_default();
	Ok(ChatRequest {
		model: model.to_string(),
		messages,
		stream,
		temperature: generation.temperature,
		top_p: generation.top_p,
		max_tokens: generation.max_output_tokens,
		stop: generation.stop_sequences.unwrap_or_default(),
		..ChatRequest::default()
	})
}

fn to_canonical_parts(parts: Vec<types::Part>) -> Content {
	let mut out = Vec::with_capacity(parts.len());
	for part in parts {
		if let Some(text) = part.text {
			out.push(Part::Text(text));
		} else if let Some(blob) = part.inline_data {
			out.push(Part::InlineData {
				mime: blob.mime_type,
				data: blob.data,
			});
		}
	}
	if out.len() == 1 {
		if let Part::Text(t) = &out[0] {
			return Content::Text(t.clone());
		}
	}
	Content::Parts(out)
}

fn joined_part_text(parts: &[types::Part]) -> String {
	parts
		.iter()
		.filter_map(|p| p.text.as_deref())
		.collect::<Vec<_>>()
		.join("")
}

/// Map the canonical request to the Gemini wire, used by the Gemini
/// connectors. Text parts concatenate; binary parts are preserved because
/// the target understands them natively.
pub fn from_canonical_request(req: &ChatRequest) -> types::GenerateContentRequest {
	let mut system_parts: Vec<types::Part> = Vec::new();
	let mut contents: Vec<types::Content> = Vec::new();
	for msg in &req.messages {
		if msg.role == Role::System {
			system_parts.push(types::Part::text(msg.joined_text()));
			continue;
		}
		let role = match msg.role {
			Role::Assistant => "model",
			Role::Tool => "function",
			_ => "user",
		};
		let parts = match &msg.content {
			Content::Text(t) => vec![types::Part::text(t.clone())],
			Content::Parts(parts) => parts
				.iter()
				.map(|p| match p {
					Part::Text(t) => types::Part::text(t.clone()),
					Part::ImageUrl(url) => types::Part::text(format!("[Attachment: {url}]")),
					Part::InlineData { mime, data } => types::Part {
						text: None,
						inline_data: Some(types::Blob {
							mime_type: mime.clone(),
							data: data.clone(),
						}),
					},
				})
				.collect(),
		};
		contents.push(types::Content {
			role: Some(role.to_string()),
			parts,
		});
	}
	let generation_config = types::GenerationConfig {
		temperature: req.temperature,
		top_p: req.top_p,
		max_output_tokens: req.max_tokens,
		stop_sequences: if req.stop.is_empty() {
			None
		} else {
			Some(req.stop.clone())
		},
		thinking_config: req
			.extra_body
			.get("thinking_budget")
			.and_then(|v| v.as_i64())
			.map(|budget| types::ThinkingConfig {
				thinking_budget: budget,
			}),
	};
	types::GenerateContentRequest {
		contents,
		system_instruction: if system_parts.is_empty() {
			None
		} else {
			Some(types::SystemInstruction {
				parts: system_parts,
			})
		},
		generation_config: Some(generation_config),
	}
}

pub fn to_canonical_response(model: &str, raw: types::GenerateContentResponse) -> ChatResponse {
	let choices = raw
		.candidates
		.unwrap_or_default()
		.into_iter()
		.enumerate()
		.map(|(i, cand)| Choice {
			index: i as u32,
			message: ResponseMessage::assistant(
				cand
					.content
					.map(|c| joined_part_text(&c.parts))
					.unwrap_or_default(),
			),
			finish_reason: cand.finish_reason.as_deref().map(finish_reason_from_gemini),
		})
		.collect();
	ChatResponse {
		id: new_response_id(),
		created: chrono::Utc::now().timestamp(),
		model: model.to_string(),
		object: "chat.completion".to_string(),
		choices,
		usage: raw.usage_metadata.map(|u| Usage {
			prompt_tokens: u.prompt_token_count.unwrap_or(0),
			completion_tokens: u.candidates_token_count.unwrap_or(0),
			total_tokens: u.total_token_count.unwrap_or(0),
		}),
	}
}

pub fn from_canonical_response(resp: &ChatResponse) -> types::GenerateContentResponse {
	types::GenerateContentResponse {
		candidates: Some(
			resp
				.choices
				.iter()
				.map(|c| types::Candidate {
					content: Some(types::Content {
						role: Some("model".to_string()),
						parts: vec![types::Part::text(
							c.message.content.clone().unwrap_or_default(),
						)],
					}),
					finish_reason: c.finish_reason.map(|f| finish_reason_to_gemini(f).to_string()),
					index: Some(c.index),
				})
				.collect(),
		),
		usage_metadata: resp.usage.map(|u| types::UsageMetadata {
			prompt_token_count: Some(u.prompt_tokens),
			candidates_token_count: Some(u.completion_tokens),
			total_token_count: Some(u.total_tokens),
		}),
	}
}

pub fn to_canonical_stream_chunk(model: &str, raw: types::GenerateContentResponse) -> StreamChunk {
	StreamChunk {
		id: new_response_id(),
		created: chrono::Utc::now().timestamp(),
		model: model.to_string(),
		choices: raw
			.candidates
			.unwrap_or_default()
			.into_iter()
			.enumerate()
			.map(|(i, cand)| StreamChoice {
				index: i as u32,
				delta: Delta {
					role: None,
					content: cand.content.map(|c| joined_part_text(&c.parts)),
					tool_calls: None,
				},
				finish_reason: cand
					.finish_reason
					.as_deref()
					.map(finish_reason_from_gemini),
			})
			.collect(),
		usage: raw.usage_metadata.map(|u| Usage {
			prompt_tokens: u.prompt_token_count.unwrap_or(0),
			completion_tokens: u.candidates_token_count.unwrap_or(0),
			total_tokens: u.total_token_count.unwrap_or(0),
		}),
	}
}

pub fn from_canonical_stream_chunk(chunk: &StreamChunk) -> types::GenerateContentResponse {
	types::GenerateContentResponse {
		candidates: Some(
			chunk
				.choices
				.iter()
				.map(|c| types::Candidate {
					content: c.delta.content.as_ref().map(|text| types::Content {
						role: Some("model".to_string()),
						parts: vec![types::Part::text(text.clone())],
					}),
					finish_reason: c.finish_reason.map(|f| finish_reason_to_gemini(f).to_string()),
					index: Some(c.index),
				})
				.collect(),
		),
		usage_metadata: chunk.usage.map(|u| types::UsageMetadata {
			prompt_token_count: Some(u.prompt_tokens),
			candidates_token_count: Some(u.completion_tokens),
			total_token_count: Some(u.total_tokens),
		}),
	}
}

pub fn finish_reason_from_gemini(reason: &str) -> FinishReason {
	match reason {
		"MAX_TOKENS" => FinishReason::Length,
		"SAFETY" | "RECITATION" => FinishReason::ContentFilter,
		_ => FinishReason::Stop,
	}
}

pub fn finish_reason_to_gemini(f: FinishReason) -> &'static str {
	match f {
		FinishReason::Stop | FinishReason::ToolCalls => "STOP",
		FinishReason::Length => "MAX_TOKENS",
		FinishReason::ContentFilter => "SAFETY",
	}
}

/// Entry in the `/v1beta/models` listing.
pub fn model_entry(id: &str) -> types::Model {
	types::Model {
		name: format!("models/{id}"),
		display_name: id.to_string(),
		description: format!("Proxied model {id}"),
		input_token_limit: 1_048_576,
		output_token_limit: 65_536,
		supported_generation_methods: vec![
			"generateContent".to_string(),
			"streamGenerateContent".to_string(),
		],
	}
}

pub mod types {
	use serde::{Deserialize, Serialize};

	#[derive(Debug, Clone, Serialize, Deserialize)]
	#[serde(rename_all = "camelCase")]
	pub struct GenerateContentRequest {
		pub contents: Vec<Content>,
		#[serde(skip_serializing_if = "Option::is_none", alias = "systemInstruction")]
		pub system_instruction: Option<SystemInstruction>,
		#[serde(skip_serializing_if = "Option::is_none", alias = "generationConfig")]
		pub generation_config: Option<GenerationConfig>,
	}

	#[derive(Debug, Clone, Serialize, Deserialize)]
	pub struct SystemInstruction {
		pub parts: Vec<Part>,
	}

	#[derive(Debug, Clone, Serialize, Deserialize)]
	pub struct Content {
		#[serde(skip_serializing_if = "Option::is_none")]
		pub role: Option<String>,
		pub parts: Vec<Part>,
	}

	#[derive(Debug, Clone, Serialize, Deserialize)]
	#[serde(rename_all = "camelCase")]
	pub struct Part {
		#[serde(skip_serializing_if = "Option::is_none")]
		pub text: Option<String>,
		#[serde(skip_serializing_if = "Option::is_none", alias = "inlineData")]
		pub inline_data: Option<Blob>,
	}

	impl Part {
		pub fn text(text: String) -> Self {
			Part {
				text: Some(text),
				inline_data: None,
			}
		}
	}

	#[derive(Debug, Clone, Serialize, Deserialize)]
	#[serde(rename_all = "camelCase")]
	pub struct Blob {
		pub mime_type: String,
		pub data: String,
	}

	#[derive(Debug, Clone, Default, Serialize, Deserialize)]
	#[serde(rename_all = "camelCase")]
	pub struct GenerationConfig {
		#[serde(skip_serializing_if = "Option::is_none")]
		pub temperature: Option<f64>,
		#[serde(skip_serializing_if = "Option::is_none")]
		pub top_p: Option<f64>,
		#[serde(skip_serializing_if = "Option::is_none")]
		pub max_output_tokens: Option<u64>,
		#[serde(skip_serializing_if = "Option::is_none")]
		pub stop_sequences: Option<Vec<String>>,
		#[serde(skip_serializing_if = "Option::is_none")]
		pub thinking_config: Option<ThinkingConfig>,
	}

	#[derive(Debug, Clone, Serialize, Deserialize)]
	#[serde(rename_all = "camelCase")]
	pub struct ThinkingConfig {
		pub thinking_budget: i64,
	}

	#[derive(Debug, Clone, Serialize, Deserialize)]
	#[serde(rename_all = "camelCase")]
	pub struct GenerateContentResponse {
		#[serde(skip_serializing_if = "Option::is_none")]
		pub candidates: Option<Vec<Candidate>>,
		#[serde(skip_serializing_if = "Option::is_none")]
		pub usage_metadata: Option<UsageMetadata>,
	}

	#[derive(Debug, Clone, Serialize, Deserialize)]
	#[serde(rename_all = "camelCase")]
	pub struct Candidate {
		#[serde(skip_serializing_if = "Option::is_none")]
		pub content: Option<Content>,
		#[serde(skip_serializing_if = "Option::is_none")]
		pub finish_reason: Option<String>,
		#[serde(skip_serializing_if = "Option::is_none")]
		pub index: Option<u32>,
	}

	#[derive(Debug, Clone, Serialize, Deserialize)]
	#[serde(rename_all = "camelCase")]
	pub struct UsageMetadata {
		#[serde(skip_serializing_if = "Option::is_none")]
		pub prompt_token_count: Option<u32>,
		#[serde(skip_serializing_if = "Option::is_none")]
		pub candidates_token_count: Option<u32>,
		#[serde(skip_serializing_if = "Option::is_none")]
		pub total_token_count: Option<u32>,
	}

	#[derive(Debug, Clone, Serialize, Deserialize)]
	#[serde(rename_all = "camelCase")]
	pub struct Model {
		pub name: String,
		pub display_name: String,
		pub description: String,
		pub input_token_limit: u64,
		pub output_token_limit: u64,
		pub supported_generation_methods: Vec<String>,
	}

	#[derive(Debug, Clone, Serialize, Deserialize)]
	pub struct ListModelsResponse {
		pub models: Vec<Model>,
	}

	/// Gemini REST error envelope, the shape `parse_retry_delay` walks.
	#[derive(Debug, Clone, Deserialize)]
	pub struct ErrorResponse {
		pub error: ErrorBody,
	}

	#[derive(Debug, Clone, Deserialize)]
	pub struct ErrorBody {
		#[serde(default)]
		pub code: i64,
		#[serde(default)]
		pub message: String,
		#[serde(default)]
		pub status: String,
	}
}
