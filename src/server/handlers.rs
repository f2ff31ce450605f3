use std::convert::Infallible;
use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::{Path, State};
use axum::http::{HeaderMap, header};
use axum::response::{Html, IntoResponse, Response};
use futures::StreamExt;
use serde::de::DeserializeOwned;

use crate::app::Context;
use crate::backend::ChunkStream;
use crate::llm::{ProxyError, anthropic, gemini, openai, responses};
use crate::pipeline::{self, PipelineResponse};
use crate::server::{Dialect, authorize, error_response, session_id};
use crate::sse;

fn parse_body<T: DeserializeOwned>(body: &Bytes) -> Result<T, ProxyError> {
	serde_json::from_slice(body)
		.map_err(|e| ProxyError::invalid(format!("malformed request body: {e}")))
}

fn sse_response(
	frames: impl futures::Stream<Item = Result<Bytes, Infallible>> + Send + 'static,
) -> Response {
	Response::builder()
		.header(header::CONTENT_TYPE, "text/event-stream")
		.header(header::CACHE_CONTROL, "no-cache")
		.body(Body::from_stream(frames))
		.expect("sse response")
}

/// OpenAI chat-completions SSE: one `data:` frame per chunk, closed by the
/// `[DONE]` sentinel.
fn openai_sse(mut stream: ChunkStream) -> Response {
	let frames = async_stream::stream! {
		while let Some(item) = stream.next().await {
			match item {
				Ok(chunk) => {
					let wire = openai::from_canonical_stream_chunk(&chunk);
					yield Ok(Bytes::from(sse::frame(&wire)));
				},
				Err(err) => {
					tracing::warn!(%err, "stream aborted");
					break;
				},
			}
		}
		yield Ok(Bytes::from(sse::DONE_FRAME));
	};
	sse_response(frames)
}

pub async fn chat_completions(
	State(ctx): State<Arc<Context>>,
	headers: HeaderMap,
	body: Bytes,
) -> Response {
	let dialect = Dialect::OpenAi;
	if let Err(err) = authorize(&ctx, &headers, dialect) {
		return error_response(dialect, &err);
	}
	let raw: openai::types::ChatCompletionRequest = match parse_body(&body) {
		Ok(raw) => raw,
		Err(err) => return error_response(dialect, &err),
	};
	let stream_requested = raw.stream.unwrap_or(false);
	let mut canonical = match openai::to_canonical_request(raw) {
		Ok(canonical) => canonical,
		Err(err) => return error_response(dialect, &err),
	};
	canonical.session_id = session_id(&headers);
	match pipeline::handle_chat(&ctx, canonical).await {
		Ok(PipelineResponse::Unary(resp)) if stream_requested => {
			openai_sse(pipeline::command_response_stream(&resp))
		},
		Ok(PipelineResponse::Unary(resp)) => {
			axum::Json(openai::from_canonical_response(&resp)).into_response()
		},
		Ok(PipelineResponse::Stream { stream, .. }) => openai_sse(stream),
		Err(err) => error_response(dialect, &err),
	}
}

pub async fn completions(
	State(ctx): State<Arc<Context>>,
	headers: HeaderMap,
	body: Bytes,
) -> Response {
	let dialect = Dialect::OpenAi;
	if let Err(err) = authorize(&ctx, &headers, dialect) {
		return error_response(dialect, &err);
	}
	let raw: openai::types::CompletionRequest = match parse_body(&body) {
		Ok(raw) => raw,
		Err(err) => return error_response(dialect, &err),
	};
	let stream_requested = raw.stream.unwrap_or(false);
	let mut canonical = match openai::completions_to_canonical(raw) {
		Ok(canonical) => canonical,
		Err(err) => return error_response(dialect, &err),
	};
	canonical.session_id = session_id(&headers);
	match pipeline::handle_chat(&ctx, canonical).await {
		Ok(PipelineResponse::Unary(resp)) if stream_requested => {
			completions_sse(pipeline::command_response_stream(&resp))
		},
		Ok(PipelineResponse::Unary(resp)) => {
			axum::Json(openai::from_canonical_completions_response(&resp)).into_response()
		},
		Ok(PipelineResponse::Stream { stream, .. }) => completions_sse(stream),
		Err(err) => error_response(dialect, &err),
	}
}

fn completions_sse(mut stream: ChunkStream) -> Response {
	let frames = async_stream::stream! {
		while let Some(item) = stream.next().await {
			let Ok(chunk) = item else { break };
			let wire = serde_json::json!({
				"id": chunk.id,
				"object": "text_completion",
				"created": chunk.created,
				"model": chunk.model,
				"choices": chunk.choices.iter().map(|c| serde_json::json!({
					"index": c.index,
					"text": c.delta.content.clone().unwrap_or_default(),
					"finish_reason": c.finish_reason.map(openai::finish_reason_str),
				})).collect::<Vec<_>>(),
			});
			yield Ok::<_, Infallible>(Bytes::from(sse::frame(&wire)));
		}
		yield Ok(Bytes::from(sse::DONE_FRAME));
	};
	sse_response(frames)
}

pub async fn responses(
	State(ctx): State<Arc<Context>>,
	headers: HeaderMap,
	body: Bytes,
) -> Response {
	let dialect = Dialect::OpenAi;
	if let Err(err) = authorize(&ctx, &headers, dialect) {
		return error_response(dialect, &err);
	}
	let raw: responses::types::ResponsesRequest = match parse_body(&body) {
		Ok(raw) => raw,
		Err(err) => return error_response(dialect, &err),
	};
	let stream_requested = raw.stream.unwrap_or(false);
	let mut canonical = match responses::to_canonical_request(raw) {
		Ok(canonical) => canonical,
		Err(err) => return error_response(dialect, &err),
	};
	canonical.session_id = session_id(&headers);
	match pipeline::handle_chat(&ctx, canonical).await {
		Ok(PipelineResponse::Unary(resp)) if stream_requested => {
			responses_sse(pipeline::command_response_stream(&resp))
		},
		Ok(PipelineResponse::Unary(resp)) => {
			axum::Json(responses::from_canonical_response(&resp)).into_response()
		},
		Ok(PipelineResponse::Stream { stream, .. }) => responses_sse(stream),
		Err(err) => error_response(dialect, &err),
	}
}

fn responses_sse(mut stream: ChunkStream) -> Response {
	let frames = async_stream::stream! {
		while let Some(item) = stream.next().await {
			let Ok(chunk) = item else { break };
			for choice in &chunk.choices {
				if let Some(delta) = &choice.delta.content {
					let event = serde_json::json!({
						"type": "response.output_text.delta",
						"delta": delta,
					});
					yield Ok::<_, Infallible>(Bytes::from(sse::frame(&event)));
				}
			}
		}
		let done = serde_json::json!({"type": "response.completed"});
		yield Ok(Bytes::from(sse::frame(&done)));
		yield Ok(Bytes::from(sse::DONE_FRAME));
	};
	sse_response(frames)
}

pub async fn list_models(State(ctx): State<Arc<Context>>, headers: HeaderMap) -> Response {
	let dialect = Dialect::OpenAi;
	if let Err(err) = authorize(&ctx, &headers, dialect) {
		return error_response(dialect, &err);
	}
	let created = chrono::Utc::now().timestamp();
	let data: Vec<openai::types::ModelEntry> = ctx
		.advertised_models()
		.into_iter()
		.map(|id| {
			let owned_by = id.split(':').next().unwrap_or("proxy").to_string();
			openai::types::ModelEntry {
				id,
				object: "model".to_string(),
				created,
				owned_by,
			}
		})
		.collect();
	axum::Json(serde_json::json!({"object": "list", "data": data})).into_response()
}

pub async fn gemini_list_models(State(ctx): State<Arc<Context>>, headers: HeaderMap) -> Response {
	let dialect = Dialect::Gemini;
	if let Err(err) = authorize(&ctx, &headers, dialect) {
		return error_response(dialect, &err);
	}
	let models: Vec<gemini::types::Model> = ctx
		.advertised_models()
		.iter()
		.map(|id| gemini::model_entry(id))
		.collect();
	axum::Json(gemini::types::ListModelsResponse { models }).into_response()
}

pub async fn gemini_generate(
	State(ctx): State<Arc<Context>>,
	Path(model_action): Path<String>,
	headers: HeaderMap,
	body: Bytes,
) -> Response {
	let dialect = Dialect::Gemini;
	if let Err(err) = authorize(&ctx, &headers, dialect) {
		return error_response(dialect, &err);
	}
	let Some((model, action)) = model_action.split_once(':') else {
		return error_response(
			dialect,
			&ProxyError::invalid("expected {model}:generateContent or {model}:streamGenerateContent"),
		);
	};
	let stream_requested = match action {
		"generateContent" => false,
		"streamGenerateContent" => true,
		other => {
			return error_response(
				dialect,
				&ProxyError::invalid(format!("unsupported action: {other}")),
			);
		},
	};
	let raw: gemini::types::GenerateContentRequest = match parse_body(&body) {
		Ok(raw) => raw,
		Err(err) => return error_response(dialect, &err),
	};
	let mut canonical = match gemini::to_canonical_request(model, raw, stream_requested) {
		Ok(canonical) => canonical,
		Err(err) => return error_response(dialect, &err),
	};
	canonical.session_id = session_id(&headers);
	match pipeline::handle_chat(&ctx, canonical).await {
		Ok(PipelineResponse::Unary(resp)) if stream_requested => {
			gemini_sse(pipeline::command_response_stream(&resp))
		},
		Ok(PipelineResponse::Unary(resp)) => {
			axum::Json(gemini::from_canonical_response(&resp)).into_response()
		},
		Ok(PipelineResponse::Stream { stream, .. }) => gemini_sse(stream),
		Err(err) => error_response(dialect, &err),
	}
}

fn gemini_sse(mut stream: ChunkStream) -> Response {
	let frames = async_stream::stream! {
		while let Some(item) = stream.next().await {
			let Ok(chunk) = item else { break };
			let wire = gemini::from_canonical_stream_chunk(&chunk);
			yield Ok::<_, Infallible>(Bytes::from(sse::frame(&wire)));
		}
		yield Ok(Bytes::from(sse::DONE_FRAME));
	};
	sse_response(frames)
}

pub async fn anthropic_messages(
	State(ctx): State<Arc<Context>>,
	headers: HeaderMap,
	body: Bytes,
) -> Response {
	let dialect = Dialect::Anthropic;
	if let Err(err) = authorize(&ctx, &headers, dialect) {
		return error_response(dialect, &err);
	}
	let raw: anthropic::types::MessagesRequest = match parse_body(&body) {
		Ok(raw) => raw,
		Err(err) => return error_response(dialect, &err),
	};
	let stream_requested = raw.stream.unwrap_or(false);
	let mut canonical = match anthropic::to_canonical_request(raw) {
		Ok(canonical) => canonical,
		Err(err) => return error_response(dialect, &err),
	};
	canonical.session_id = session_id(&headers);
	match pipeline::handle_chat(&ctx, canonical).await {
		Ok(PipelineResponse::Unary(resp)) if stream_requested => {
			anthropic_sse(pipeline::command_response_stream(&resp))
		},
		Ok(PipelineResponse::Unary(resp)) => {
			axum::Json(anthropic::from_canonical_response(&resp)).into_response()
		},
		Ok(PipelineResponse::Stream { stream, .. }) => anthropic_sse(stream),
		Err(err) => error_response(dialect, &err),
	}
}

fn anthropic_sse(mut stream: ChunkStream) -> Response {
	let frames = async_stream::stream! {
		let mut translator = anthropic::StreamTranslator::new();
		while let Some(item) = stream.next().await {
			let Ok(chunk) = item else { break };
			for (event, value) in translator.translate(&chunk) {
				yield Ok::<_, Infallible>(Bytes::from(sse::named_frame(event, &value)));
			}
		}
	};
	sse_response(frames)
}

pub async fn health() -> Response {
	axum::Json(serde_json::json!({"status": "ok"})).into_response()
}

pub async fn docs() -> Html<&'static str> {
	Html(
		r#"<!doctype html>
<html>
<head><title>llmgateway</title></head>
<body>
<h1>llmgateway</h1>
<p>LLM-interactive reverse proxy. Endpoints:</p>
<ul>
<li>POST /v1/chat/completions</li>
<li>POST /v1/completions</li>
<li>POST /v1/responses</li>
<li>GET /v1/models</li>
<li>GET /v1beta/models</li>
<li>POST /v1beta/models/{model}:generateContent</li>
<li>POST /v1beta/models/{model}:streamGenerateContent</li>
<li>POST /anthropic/v1/messages</li>
<li>GET /health</li>
</ul>
<p>See <a href="/openapi.json">openapi.json</a>.</p>
</body>
</html>"#,
	)
}

pub async fn openapi() -> Response {
	axum::Json(serde_json::json!({
		"openapi": "3.0.0",
		"info": {
			"title": "llmgateway",
			"version": crate::assemble::VERSION,
		},
		"paths": {
			"/v1/chat/completions": {"post": {"summary": "OpenAI chat completions"}},
			"/v1/completions": {"post": {"summary": "OpenAI legacy completions"}},
			"/v1/responses": {"post": {"summary": "OpenAI Responses API"}},
			"/v1/models": {"get": {"summary": "OpenAI models listing"}},
			"/v1beta/models": {"get": {"summary": "Gemini models listing"}},
			"/v1beta/models/{model}:generateContent": {"post": {"summary": "Gemini unary generation"}},
			"/v1beta/models/{model}:streamGenerateContent": {"post": {"summary": "Gemini streaming generation"}},
			"/anthropic/v1/messages": {"post": {"summary": "Anthropic messages"}},
			"/health": {"get": {"summary": "liveness"}},
		},
	}))
	.into_response()
}
