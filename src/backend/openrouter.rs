use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue};

use crate::backend::{ApiKey, ChunkStream, Connector, openai, with_timeout};
use crate::llm::{ChatRequest, ChatResponse, ProxyError};

pub const DEFAULT_BASE_URL: &str = "https://openrouter.ai/api/v1";

/// OpenRouter speaks the OpenAI wire; it differs only in endpoint, the
/// attribution headers it expects, and its much larger model catalog.
pub struct OpenRouterConnector {
	base_url: String,
	keys: Vec<ApiKey>,
	headers: HeaderMap,
	client: reqwest::Client,
	timeout: Duration,
	models: ArcSwap<Vec<String>>,
}

impl OpenRouterConnector {
	pub fn new(
		base_url: impl Into<String>,
		keys: Vec<ApiKey>,
		client: reqwest::Client,
		timeout: Duration,
	) -> Self {
		let mut headers = HeaderMap::new();
		headers.insert(
			"HTTP-Referer",
			HeaderValue::from_static("https://github.com/llmgateway/llmgateway"),
		);
		headers.insert("X-Title", HeaderValue::from_static("llmgateway"));
		OpenRouterConnector {
			base_url: base_url.into().trim_end_matches('/').to_string(),
			keys,
			headers,
			client,
			timeout,
			models: ArcSwap::from_pointee(Vec::new()),
		}
	}
}

#[async_trait]
impl Connector for OpenRouterConnector {
	fn name(&self) -> &str {
		"openrouter"
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
			openai::fetch_models(&self.client, &self.base_url, &self.headers, key),
		)
		.await?;
		tracing::debug!(count = models.len(), "refreshed OpenRouter model list");
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
			openai::wire_chat(&self.client, &self.base_url, &self.headers, req, model, key),
		)
		.await
	}

	async fn stream_chat_completions(
		&self,
		req: &ChatRequest,
		model: &str,
		key: &ApiKey,
	) -> Result<ChunkStream, ProxyError> {
		openai::wire_stream_chat(&self.client, &self.base_url, &self.headers, req, model, key).await
	}
}
