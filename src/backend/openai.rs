use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::HeaderMap;
use serde::Deserialize;

use crate::backend::{
	ApiKey, ChunkStream, Connector, error_from_status, transport_error, with_timeout,
};
use crate::llm::{ChatRequest, ChatResponse, ProxyError, StreamChunk};
use crate::llm::openai as wire;
use crate::sse::{SseItem, decode_json_stream};

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Connector for any OpenAI-compatible endpoint, configurable base URL.
pub struct OpenAiConnector {
	name: String,
	base_url: String,
	keys: Vec<ApiKey>,
	extra_headers: HeaderMap,
	client: reqwest::Client,
	timeout: Duration,
	models: ArcSwap<Vec<String>>,
}

impl OpenAiConnector {
	pub fn new(
		name: impl Into<String>,
		base_url: impl Into<String>,
		keys: Vec<ApiKey>,
		extra_headers: HeaderMap,
		client: reqwest::Client,
		timeout: Duration,
	) -> Self {
		OpenAiConnector {
			name: name.into(),
			base_url: base_url.into().trim_end_matches('/').to_string(),
			keys,
			extra_headers,
			client,
			timeout,
			models: ArcSwap::from_pointee(Vec::new()),
		}
	}
}

#[async_trait]
impl Connector for OpenAiConnector {
	fn name(&self) -> &str {
		&self.name
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
			fetch_models(&self.client, &self.base_url, &self.extra_headers, key),
		)
		.await?;
		tracing::debug!(backend = %self.name, count = models.len(), "refreshed model list");
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
			wire_chat(&self.client, &self.base_url, &self.extra_headers, req, model, key),
		)
		.await
	}

	async fn stream_chat_completions(
		&self,
		req: &ChatRequest,
		model: &str,
		key: &ApiKey,
	) -> Result<ChunkStream, ProxyError> {
		wire_stream_chat(&self.client, &self.base_url, &self.extra_headers, req, model, key).await
	}
}

#[derive(Deserialize)]
struct ModelsPage {
	data: Vec<ModelItem>,
}

#[derive(Deserialize)]
struct ModelItem {
	id: String,
}

pub(super) async fn fetch_models(
	client: &reqwest::Client,
	base_url: &str,
	extra_headers: &HeaderMap,
	key: &ApiKey,
) -> Result<Vec<String>, ProxyError> {
	let resp = client
		.get(format!("{base_url}/models"))
		.headers(extra_headers.clone())
		.bearer_auth(&key.value)
		.send()
		.await
		.map_err(transport_error)?;
	let status = resp.status();
	if !status.is_success() {
		let body = resp.text().await.unwrap_or_default();
		return Err(error_from_status(status, &body));
	}
	let page: ModelsPage = resp.json().await.map_err(transport_error)?;
	Ok(page.data.into_iter().map(|m| m.id).collect())
}

/// One unary chat call on the OpenAI wire, shared with the OpenRouter
/// connector.
pub(super) async fn wire_chat(
	client: &reqwest::Client,
	base_url: &str,
	extra_headers: &HeaderMap,
	req: &ChatRequest,
	model: &str,
	key: &ApiKey,
) -> Result<ChatResponse, ProxyError> {
	let mut body = wire::from_canonical_request(req, model);
	body.stream = None;
	let resp = client
		.post(format!("{base_url}/chat/completions"))
		.headers(extra_headers.clone())
		.bearer_auth(&key.value)
		.json(&body)
		.send()
		.await
		.map_err(transport_error)?;
	let status = resp.status();
	let text = resp.text().await.map_err(transport_error)?;
	if !status.is_success() {
		return Err(error_from_status(status, &text));
	}
	let parsed: wire::types::ChatCompletionResponse = serde_json::from_str(&text)
		.map_err(|e| ProxyError::Transient(format!("unparseable upstream response: {e}")))?;
	wire::to_canonical_response(parsed)
}

pub(super) async fn wire_stream_chat(
	client: &reqwest::Client,
	base_url: &str,
	extra_headers: &HeaderMap,
	req: &ChatRequest,
	model: &str,
	key: &ApiKey,
) -> Result<ChunkStream, ProxyError> {
	let mut body = wire::from_canonical_request(req, model);
	body.stream = Some(true);
	let resp = client
		.post(format!("{base_url}/chat/completions"))
		.headers(extra_headers.clone())
		.bearer_auth(&key.value)
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
	let stream = decode_json_stream::<wire::types::ChatCompletionChunk, _, _>(resp.bytes_stream())
		.map(move |item| match item {
			Ok(SseItem::Data(chunk)) => Ok(wire::to_canonical_stream_chunk(chunk)),
			Ok(SseItem::Done) => Ok(StreamChunk::end_of_stream(&model)),
			Err(err) => Err(err),
		});
	Ok(Box::pin(stream))
}
