use std::collections::BTreeMap;

use crate::llm::{
	ChatResponse, Choice, FinishReason, ResponseMessage, Role, StreamChunk, Usage, new_response_id,
};
use crate::session::SessionSnapshot;

pub const PRODUCT: &str = "llmgateway";
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const COMMAND_RESPONSE_ID: &str = "proxy_cmd_processed";

/// Per-backend counts shown in the banner: (key count, model count).
pub type BackendSummary = BTreeMap<String, (usize, usize)>;

pub fn banner_text(session_id: &str, backends: &BackendSummary, prefix: &str) -> String {
	let listing = backends
		.iter()
		.map(|(name, (keys, models))| format!("{name} (K:{keys}, M:{models})"))
		.collect::<Vec<_>>()
		.join(", ");
	format!(
		"Hello, this is {PRODUCT} {VERSION}\n\
		 Session id: {session_id}\n\
		 Functional backends: {listing}\n\
		 Type {prefix}help for list of available commands"
	)
}

/// Banner gating: interactive sessions get it once, re-armed by `!/hello`
/// or a fresh interactive-mode transition. Never in non-interactive mode.
pub fn should_emit_banner(snapshot: &SessionSnapshot) -> bool {
	snapshot.interactive()
		&& (!snapshot.banner_shown || snapshot.hello_requested || snapshot.interactive_just_enabled)
}

/// Proxy-generated text to place ahead of the model output: the banner (when
/// due) followed by command confirmations joined with `; `.
pub fn compose_prelude(banner: Option<&str>, confirmations: &[String]) -> Option<String> {
	let confirmation_line = if confirmations.is_empty() {
		None
	} else {
		Some(confirmations.join("; "))
	};
	match (banner, confirmation_line) {
		(Some(banner), Some(line)) => Some(format!("{banner}\n{line}")),
		(Some(banner), None) => Some(banner.to_string()),
		(None, Some(line)) => Some(line),
		(None, None) => None,
	}
}

pub fn wrap_cline(text: &str) -> String {
	format!("<attempt_completion>\n<result>\n{text}\n</result>\n</attempt_completion>\n")
}

/// Confirmations as shown to a Cline agent: the hello acknowledgement is
/// suppressed for that agent class.
pub fn cline_confirmations(confirmations: &[String]) -> Vec<String> {
	confirmations
		.iter()
		.filter(|c| *c != "hello acknowledged")
		.cloned()
		.collect()
}

/// Synthesized response for a command-only request; nothing was dispatched.
pub fn command_only_response(model: &str, content: String, cline: bool) -> ChatResponse {
	let content = if cline { wrap_cline(&content) } else { content };
	ChatResponse {
		id: COMMAND_RESPONSE_ID.to_string(),
		created: chrono::Utc::now().timestamp(),
		model: model.to_string(),
		object: "chat.completion".to_string(),
		choices: vec![Choice {
			index: 0,
			message: ResponseMessage {
				role: Role::Assistant,
				content: Some(content),
				tool_calls: None,
				parsed: None,
			},
			finish_reason: Some(FinishReason::Stop),
		}],
		usage: Some(Usage::default()),
	}
}

/// Prepend proxy text to a dispatched unary response.
pub fn prepend_to_response(resp: &mut ChatResponse, prelude: &str) {
	if let Some(choice) = resp.choices.first_mut() {
		let existing = choice.message.content.take().unwrap_or_default();
		choice.message.content = Some(format!("{prelude}\n{existing}"));
	} else {
		resp.choices.push(Choice {
			index: 0,
			message: ResponseMessage::assistant(prelude.to_string()),
			finish_reason: Some(FinishReason::Stop),
		});
	}
}

/// Inject proxy text ahead of the first content delta of a stream.
pub fn prepend_to_chunk(chunk: &mut StreamChunk, prelude: &str) {
	if let Some(choice) = chunk.choices.first_mut() {
		let existing = choice.delta.content.take().unwrap_or_default();
		choice.delta.content = Some(format!("{prelude}\n{existing}"));
	} else {
		chunk.choices.push(crate::llm::StreamChoice {
			index: 0,
			delta: crate::llm::Delta {
				role: Some(Role::Assistant),
				content: Some(format!("{prelude}\n")),
				tool_calls: None,
			},
			finish_reason: None,
		});
	}
}

/// Chunk carrying only proxy text, used when a command-only request arrives
/// with `stream=true`.
pub fn prelude_chunk(model: &str, text: String) -> StreamChunk {
	StreamChunk {
		id: COMMAND_RESPONSE_ID.to_string(),
		created: chrono::Utc::now().timestamp(),
		model: model.to_string(),
		choices: vec![crate::llm::StreamChoice {
			index: 0,
			delta: crate::llm::Delta {
				role: Some(Role::Assistant),
				content: Some(text),
				tool_calls: None,
			},
			finish_reason: Some(FinishReason::Stop),
		}],
		usage: None,
	}
}

/// Detect a Cline-class agent from user content.
pub fn detect_cline(text: &str) -> bool {
	text.contains("<attempt_completion>")
}

pub fn effective_model(resolved: Option<&str>, request_model: &str) -> String {
	match resolved {
		Some(model) if !model.is_empty() => model.to_string(),
		_ => request_model.to_string(),
	}
}

pub fn new_stream_id() -> String {
	new_response_id()
}
