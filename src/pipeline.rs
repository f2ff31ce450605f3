use std::sync::Arc;

use futures::StreamExt;

use crate::app::Context;
use crate::assemble;
use crate::backend::ChunkStream;
use crate::commands::{self, CommandCtx};
use crate::dispatcher::DispatchResponse;
use crate::llm::{ChatRequest, ChatResponse, FinishReason, ProxyError, Role, StreamChunk};
use crate::loopdetect::{Feed, LoopDetector};
use crate::middleware::AccountingEntry;
use crate::session::{LoopDetectionConfig, SessionInteraction, SessionSnapshot};

/// Fully processed canonical output, ready for dialect rendering.
pub enum PipelineResponse {
	Unary(ChatResponse),
	Stream { model: String, stream: ChunkStream },
}

/// Run one chat request through the whole pipeline: session lookup, agent
/// detection, redaction, command interpretation, dispatch, loop detection
/// and proxy-text assembly.
pub async fn handle_chat(ctx: &Arc<Context>, mut req: ChatRequest) -> Result<PipelineResponse, ProxyError> {
	let session = ctx.sessions.get_or_create(&req.session_id);
	let mut snapshot = (*session.snapshot()).clone();

	// Cline agents identify themselves by attempt_completion markers in any
	// user message; the tag is sticky for the session.
	if !snapshot.is_cline_agent && request_mentions_cline(&req) {
		snapshot = (*ctx
			.sessions
			.update(&req.session_id, |mut s| {
				s.is_cline_agent = true;
				s.agent = Some("cline".to_string());
				s
			})
			.await)
			.clone();
		req.agent = Some("cline".to_string());
	}

	ctx.redactor.apply(&mut req, snapshot.api_key_redaction_override);

	let mut confirmations: Vec<String> = Vec::new();
	let mut command_only = false;
	if !ctx.cfg.disable_interactive_commands {
		let command_ctx = ctx.command_ctx();
		let outcome = commands::interpret(&ctx.matcher, &mut req.messages, &snapshot, &command_ctx);
		if outcome.changed {
			snapshot = (*ctx.sessions.publish(&req.session_id, outcome.snapshot.clone()).await).clone();
		}
		command_only = outcome.command_only;
		confirmations = outcome
			.results
			.iter()
			.map(|r| confirmation_line(&r.name, r.success, &r.message))
			.collect();
	}

	let banner = if assemble::should_emit_banner(&snapshot) {
		let text = assemble::banner_text(
			&req.session_id,
			&ctx.backend_summary(),
			&ctx.cfg.command_prefix,
		);
		snapshot = (*ctx
			.sessions
			.update(&req.session_id, |mut s| {
				s.banner_shown = true;
				s.hello_requested = false;
				s.interactive_just_enabled = false;
				s
			})
			.await)
			.clone();
		Some(text)
	} else {
		None
	};

	let cline = snapshot.is_cline_agent;
	if command_only {
		let confirmations = if cline {
			assemble::cline_confirmations(&confirmations)
		} else {
			confirmations
		};
		let content = assemble::compose_prelude(banner.as_deref(), &confirmations)
			.unwrap_or_else(|| "ok".to_string());
		let model = assemble::effective_model(snapshot.backend_config.model.as_deref(), &req.model);
		session.record_interaction(SessionInteraction {
			prompt: summarize_prompt(&req),
			handler: "proxy",
			backend: None,
			model: Some(model.clone()),
			usage: None,
		});
		let response = assemble::command_only_response(&model, content, cline);
		return Ok(PipelineResponse::Unary(response));
	}

	if req.model.is_empty() && snapshot.backend_config.model.is_none() {
		return Err(ProxyError::invalid("model is required"));
	}
	if ctx.cfg.force_set_project && snapshot.project.is_none() {
		return Err(ProxyError::invalid(
			"project must be set before dispatching; use the set command",
		));
	}

	inject_session_params(&mut req, &snapshot, ctx);
	ctx.leak_filter.apply(&mut req);

	let prelude = assemble::compose_prelude(banner.as_deref(), &confirmations);
	let result = ctx.dispatcher.dispatch(&req, &snapshot).await;

	// A consumed oneoff never survives its dispatch, success or not.
	let consumed = match &result {
		Ok(outcome) => outcome.oneoff_consumed,
		Err(failure) => failure.oneoff_consumed,
	};
	if consumed {
		ctx
			.sessions
			.update(&req.session_id, |mut s| {
				s.backend_config.oneoff_backend = None;
				s.backend_config.oneoff_model = None;
				s
			})
			.await;
	}

	let outcome = result.map_err(|f| f.error)?;
	match outcome.response {
		DispatchResponse::Unary(mut response) => {
			if let Some(prelude) = &prelude {
				assemble::prepend_to_response(&mut response, prelude);
			}
			if let Some(usage) = response.usage {
				ctx.accounting.record(AccountingEntry {
					session_id: req.session_id.clone(),
					backend: outcome.backend.clone(),
					model: outcome.model.clone(),
					usage,
				});
			}
			session.record_interaction(SessionInteraction {
				prompt: summarize_prompt(&req),
				handler: "backend",
				backend: Some(outcome.backend.clone()),
				model: Some(outcome.model.clone()),
				usage: response.usage,
			});
			Ok(PipelineResponse::Unary(response))
		},
		DispatchResponse::Stream(stream) => {
			let stream = decorate_stream(
				ctx.clone(),
				stream,
				prelude,
				snapshot.loop_config.clone(),
				req.session_id.clone(),
				outcome.backend.clone(),
				outcome.model.clone(),
			);
			Ok(PipelineResponse::Stream {
				model: outcome.model,
				stream,
			})
		},
	}
}

/// The command-only path still answers `stream=true` requests as SSE: one
/// content chunk followed by the end of stream.
pub fn command_response_stream(response: &ChatResponse) -> ChunkStream {
	let content = response
		.choices
		.first()
		.and_then(|c| c.message.content.clone())
		.unwrap_or_default();
	let chunk = assemble::prelude_chunk(&response.model, content);
	Box::pin(futures::stream::once(async move { Ok(chunk) }))
}

fn confirmation_line(name: &str, success: bool, message: &str) -> String {
	if success || message.starts_with("unknown command") {
		message.to_string()
	} else {
		format!("{name}: {message}")
	}
}

fn request_mentions_cline(req: &ChatRequest) -> bool {
	req
		.messages
		.iter()
		.filter(|m| m.role == Role::User)
		.any(|m| assemble::detect_cline(&m.joined_text()))
}

fn summarize_prompt(req: &ChatRequest) -> String {
	req
		.messages
		.iter()
		.rev()
		.find(|m| m.role == Role::User)
		.map(|m| m.joined_text().chars().take(200).collect())
		.unwrap_or_default()
}

/// Direct request parameters win over session reasoning settings, which win
/// over config-file model defaults.
fn inject_session_params(req: &mut ChatRequest, snapshot: &SessionSnapshot, ctx: &Context) {
	let reasoning = &snapshot.reasoning_config;
	let defaults = ctx.model_defaults_for(&req.model, snapshot);

	if req.temperature.is_none() {
		req.temperature = reasoning
			.temperature
			.or(defaults.as_ref().and_then(|d| d.temperature));
	}
	if !req.extra_body.contains_key("reasoning_effort") {
		if let Some(effort) = reasoning
			.reasoning_effort
			.or(defaults.as_ref().and_then(|d| d.reasoning_effort))
		{
			req.extra_body.insert(
				"reasoning_effort".to_string(),
				serde_json::Value::String(effort.as_str().to_string()),
			);
		}
	}
	if !req.extra_body.contains_key("thinking_budget") {
		if let Some(budget) = reasoning
			.thinking_budget
			.or(defaults.as_ref().and_then(|d| d.thinking_budget))
			.or(ctx.cfg.thinking_budget)
		{
			req.extra_body.insert(
				"thinking_budget".to_string(),
				serde_json::Value::Number(budget.into()),
			);
		}
	}
	if let Some(blob) = &reasoning.provider_blob {
		req
			.extra_body
			.entry("provider".to_string())
			.or_insert_with(|| blob.clone());
	}
	if let Some(window) = ctx.cfg.force_context_window {
		req
			.extra_body
			.insert("context_window".to_string(), serde_json::Value::Number(window.into()));
	}
}

/// Wrap the upstream chunk stream with loop detection, first-chunk prelude
/// injection and end-of-stream accounting. Dropping the returned stream
/// cancels the upstream call.
fn decorate_stream(
	ctx: Arc<Context>,
	mut upstream: ChunkStream,
	prelude: Option<String>,
	loop_config: LoopDetectionConfig,
	session_id: String,
	backend: String,
	model: String,
) -> ChunkStream {
	let stream = async_stream::stream! {
		let mut detector = LoopDetector::new(&loop_config);
		let mut tool_detector = crate::loopdetect::ToolLoopDetector::new(&loop_config);
		let mut prelude = prelude;
		let mut usage = None;
		while let Some(item) = upstream.next().await {
			match item {
				Ok(mut chunk) => {
					if chunk.usage.is_some() {
						usage = chunk.usage;
					}
					let mut fired = false;
					let mut tool_warning = None;
					for (tool, args) in tool_calls_of(&chunk) {
						match tool_detector.record(&tool, &args) {
							crate::loopdetect::ToolLoopAction::Proceed => {},
							crate::loopdetect::ToolLoopAction::Warn(text) => tool_warning = Some(text),
							crate::loopdetect::ToolLoopAction::Break => fired = true,
						}
					}
					for choice in &mut chunk.choices {
						if let Some(content) = choice.delta.content.take() {
							match detector.feed(&content) {
								Feed::Continue(text) => choice.delta.content = Some(text),
								Feed::Fired(text) => {
									choice.delta.content = Some(text);
									choice.finish_reason = Some(FinishReason::Stop);
								},
							}
						}
					}
					if detector.fired() {
						fired = true;
					}
					if let Some(warning) = tool_warning {
						if let Some(choice) = chunk.choices.first_mut() {
							let existing = choice.delta.content.take().unwrap_or_default();
							choice.delta.content = Some(format!("{existing}\n{warning}"));
						}
					}
					if let Some(text) = prelude.take() {
						assemble::prepend_to_chunk(&mut chunk, &text);
					}
					if fired {
						for choice in &mut chunk.choices {
							choice.finish_reason = Some(FinishReason::Stop);
						}
					}
					yield Ok(chunk);
					if fired {
						tracing::warn!(session_id = %session_id, "stream truncated by loop detector");
						break;
					}
				},
				Err(err) => {
					yield Err(err);
					break;
				},
			}
		}
		if let Some(usage) = usage {
			ctx.accounting.record(AccountingEntry {
				session_id: session_id.clone(),
				backend: backend.clone(),
				model: model.clone(),
				usage,
			});
		}
	};
	Box::pin(stream)
}

/// Convert a canonical chunk's tool calls into loop-detector records; the
/// pipeline breaks the stream when the tool-loop detector says so.
pub fn tool_calls_of(chunk: &StreamChunk) -> Vec<(String, serde_json::Value)> {
	let mut calls = Vec::new();
	for choice in &chunk.choices {
		let Some(tool_calls) = &choice.delta.tool_calls else {
			continue;
		};
		let Some(items) = tool_calls.as_array() else {
			continue;
		};
		for item in items {
			let name = item
				.pointer("/function/name")
				.and_then(|v| v.as_str())
				.unwrap_or_default();
			if name.is_empty() {
				continue;
			}
			let args = item
				.pointer("/function/arguments")
				.cloned()
				.unwrap_or(serde_json::Value::Null);
			calls.push((name.to_string(), args));
		}
	}
	calls
}
