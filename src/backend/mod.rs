use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;

use crate::llm::{ChatRequest, ChatResponse, ProxyError, StreamChunk};
use crate::ratelimit::parse_retry_delay_text;

pub mod gemini;
pub mod gemini_oauth;
pub mod openai;
pub mod openrouter;
#[cfg(test)]
mod wire_tests;

pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<StreamChunk, ProxyError>> + Send>>;

/// One credential in a connector's pool. `name` is the environment variable
/// the key came from; the dispatcher rotates by name, the connector never
/// rotates on its own.
#[derive(Debug, Clone)]
pub struct ApiKey {
	pub name: String,
	pub value: String,
}

/// Uniform chat-completion contract every upstream vendor adapter fulfils.
#[async_trait]
pub trait Connector: Send + Sync {
	fn name(&self) -> &str;

	fn keys(&self) -> &[ApiKey];

	/// Cached advertised model list; empty means the backend is unusable.
	fn models(&self) -> Arc<Vec<String>>;

	/// Re-fetch the model list and atomically replace the cache.
	async fn refresh_models(&self) -> Result<(), ProxyError>;

	/// A backend with no credential or an empty model list is non-functional
	/// for this process lifetime.
	fn is_functional(&self) -> bool {
		!self.keys().is_empty() && !self.models().is_empty()
	}

	async fn chat_completions(
		&self,
		req: &ChatRequest,
		model: &str,
		key: &ApiKey,
	) -> Result<ChatResponse, ProxyError>;

	/// Lazy, finite, not restartable; dropping the stream closes the
	/// upstream connection.
	async fn stream_chat_completions(
		&self,
		req: &ChatRequest,
		model: &str,
		key: &ApiKey,
	) -> Result<ChunkStream, ProxyError>;
}

/// Map an upstream error response onto the pipeline taxonomy. On 429 the
/// retry delay is recovered from the payload when the vendor includes it.
pub(crate) fn error_from_status(status: http::StatusCode, body: &str) -> ProxyError {
	let summary: String = body.chars().take(512).collect();
	match status.as_u16() {
		429 => ProxyError::RateLimited {
			delay_seconds: parse_retry_delay_text(body),
		},
		400 | 404 | 405 | 422 => ProxyError::Terminal {
			status: status.as_u16(),
			message: summary,
		},
		401 | 403 => ProxyError::Terminal {
			status: status.as_u16(),
			message: summary,
		},
		_ => ProxyError::Transient(format!("upstream {status}: {summary}")),
	}
}

pub(crate) fn transport_error(err: reqwest::Error) -> ProxyError {
	ProxyError::Transient(format!("upstream request failed: {err}"))
}

/// Shared HTTP client for all connectors. No whole-request timeout here:
/// streaming responses outlive any sane value, so unary calls bound their
/// own wait with `with_timeout`.
pub fn build_http_client() -> reqwest::Client {
	reqwest::Client::builder()
		.connect_timeout(std::time::Duration::from_secs(10))
		.build()
		.expect("reqwest client")
}

pub(crate) async fn with_timeout<T>(
	timeout: std::time::Duration,
	fut: impl std::future::Future<Output = Result<T, ProxyError>>,
) -> Result<T, ProxyError> {
	match tokio::time::timeout(timeout, fut).await {
		Ok(result) => result,
		Err(_) => Err(ProxyError::Transient(format!(
			"upstream timed out after {}s",
			timeout.as_secs()
		))),
	}
}
