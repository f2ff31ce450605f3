use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;

use crate::backend::{
	ApiKey, ChunkStream, Connector, error_from_status, transport_error, with_timeout,
};
use crate::llm::{ChatRequest, ChatResponse, ProxyError};
use crate::llm::gemini as wire;
use crate::sse::{SseItem, decode_json_stream};

pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";

/// How a Gemini-wire call authenticates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStyle {
	/// `x-goog-api-key` header (API-key accounts).
	ApiKey,
	/// `Authorization: Bearer` (OAuth accounts).
	Bearer,
}

fn apply_auth(
	builder: reqwest::RequestBuilder,
	auth: AuthStyle,
	secret: &str,
) -> reqwest::RequestBuilder {
	match auth {
		AuthStyle::ApiKey => builder.header("x-goog-api-key", secret),
		AuthStyle::Bearer => builder.bearer_auth(secret),
	}
}

/// Connector for the Gemini REST API.
pub struct GeminiConnector {
	base_url: String,
	keys: Vec<ApiKey>,
	client: reqwest::Client,
	timeout: Duration,
	models: ArcSwap<Vec<String>>,
}

impl GeminiConnector {
	pub fn new(
		base_url: impl Into<String>,
		keys: Vec<ApiKey>,
		client: reqwest::Client,
		timeout: Duration,
	) -> Self {
		GeminiConnector {
			base_url: base_url.into().trim_end_matches('/').to_string(),
			keys,
			client,
			timeout,
			models: ArcSwap::from_pointee(Vec::new()),
		}
	}
}

#[async_trait]
impl Connector for GeminiConnector {
	fn name(&self) -> &str {
		"gemini"
	}

	fn keys(&self) -> &[ApiKey] {
		&self.keys
	}

	fn models(&self) -> Arc<Vec<String>> {
		self.models.load_full()
	}

	async fn refresh_models(&self) -> Result<(), ProxyError> {
		let Some(key) = self.keys.first() else {
			return Ok(());
		};
		let models = with_timeout(
			self.timeout,
			fetch_models(&self.client, &self.base_url, AuthStyle::ApiKey, &key.value),
		)
		.await?;
		tracing::debug!(count = models.len(), "refreshed Gemini model list");
		self.models.store(Arc::new(models));
		Ok(())
	}

	async fn chat_completions(
		&self,
		req: &ChatRequest,
		model: &str,
		key: &ApiKey,
	) -> Result<ChatResponse, ProxyError> {
		with_timeout(
			self.timeout,
			wire_chat(&self.client, &self.base_url, AuthStyle::ApiKey, req, model, &key.value),
		)
		.await
	}

	async fn stream_chat_completions(
		&self,
		req: &ChatRequest,
		model: &str,
		key: &ApiKey,
	) -> Result<ChunkStream, ProxyError> {
		wire_stream_chat(
			&self.client,
			&self.base_url,
			AuthStyle::ApiKey,
			req,
			model,
			&key.value,
		)
		.await
	}
}

#[derive(Deserialize)]
struct ModelsPage {
	#[serde(default)]
	models: Vec<ModelItem>,
}

#[derive(Deserialize)]
struct ModelItem {
	name: String,
}

pub(super) async fn fetch_models(
	client: &reqwest::Client,
	base_url: &str,
	auth: AuthStyle,
	secret: &str,
) -> Result<Vec<String>, ProxyError> {
	let builder = client.get(format!("{base_url}/v1beta/models"));
	let resp = apply_auth(builder, auth, secret)
		.send()
		.await
		.map_err(transport_error)?;
	let status = resp.status();
	if !status.is_success() {
		let body = resp.text().await.unwrap_or_default();
		return Err(error_from_status(status, &body));
	}
	let page: ModelsPage = resp.json().await.map_err(transport_error)?;
	Ok(
		page
			.models
			.into_iter()
			.map(|m| m.name.trim_start_matches("models/").to_string())
			.collect(),
	)
}

pub(super) async fn wire_chat(
	client: &reqwest::Client,
	base_url: &str,
	auth: AuthStyle,
	req: &ChatRequest,
	model: &str,
	secret: &str,
) -> Result<ChatResponse, ProxyError> {
	let body = wire::from_canonical_request(req);
	let builder = client.post(format!("{base_url}/v1beta/models/{model}:generateContent"));
	let resp = apply_auth(builder, auth, secret)
		.json(&body)
		.send()
		.await
		.map_err(transport_error)?;
	let status = resp.status();
	let text = resp.text().await.map_err(transport_error)?;
	if !status.is_success() {
		return Err(error_from_status(status, &text));
	}
	let parsed: wire::types::GenerateContentResponse = serde_json::from_str(&text)
		.map_err(|e| ProxyError::Transient(format!("unparseable upstream response: {e}")))?;
	Ok(wire::to_canonical_response(model, parsed))
}

pub(super) async fn wire_stream_chat(
	client: &reqwest::Client,
	base_url: &str,
	auth: AuthStyle,
	req: &ChatRequest,
	model: &str,
	secret: &str,
) -> Result<ChunkStream, ProxyError> {
	let body = wire::from_canonical_request(req);
	let builder = client.post(format!(
		"{base_url}/v1beta/models/{model}:streamGenerateContent?alt=sse"
	));
	let resp = apply_auth(builder, auth, secret)
		.json(&body)
		.send()
		.await
		.map_err(transport_error)?;
	let status = resp.status();
	if !status.is_success() {
		let text = resp.text().await.unwrap_or_default();
		return Err(error_from_status(status, &text));
	}
	let model = model.to_string();
	let stream = decode_json_stream::<wire::types::GenerateContentResponse, _, _>(resp.bytes_stream())
		.filter_map(move |item| {
			let model = model.clone();
			async move {
				match item {
					Ok(SseItem::Data(frame)) => Some(Ok(wire::to_canonical_stream_chunk(&model, frame))),
					// Gemini SSE has no sentinel; the stream simply ends.
					Ok(SseItem::Done) => None,
					Err(err) => Some(Err(err)),
				}
			}
		});
	Ok(Box::pin(stream))
}
