use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::backend::gemini::{AuthStyle, fetch_models, wire_chat, wire_stream_chat};
use crate::backend::{ApiKey, ChunkStream, Connector, with_timeout};
use crate::llm::{ChatRequest, ChatResponse, ProxyError};

/// Process-wide counter for the personal OAuth quota, persisted as JSON and
/// reset at the first request of a new Pacific-time day.
pub struct DailyRequestCounter {
	path: PathBuf,
	limit: u64,
	thresholds: Vec<u64>,
	state: Mutex<CounterState>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct CounterState {
	count: u64,
	last_reset_date: String,
	logged_thresholds: BTreeSet<u64>,
}

fn current_pacific_date() -> String {
	Utc::now()
		.with_timezone(&chrono_tz::America::Los_Angeles)
		.format("%Y-%m-%d")
		.to_string()
}

impl DailyRequestCounter {
	pub fn new(path: PathBuf, limit: u64) -> Self {
		let thresholds: Vec<u64> = [0.7, 0.8, 0.9]
			.iter()
			.map(|p| (limit as f64 * p) as u64)
			.filter(|t| *t > 0 && *t <= limit)
			.collect();
		let mut state = CounterState {
			last_reset_date: current_pacific_date(),
			..CounterState::default()
		};
		match std::fs::read_to_string(&path) {
			Ok(raw) => match serde_json::from_str::<CounterState>(&raw) {
				Ok(mut loaded) => {
					loaded.logged_thresholds.retain(|t| thresholds.contains(t));
					state = loaded;
				},
				Err(err) => tracing::error!(?err, "failed to parse request counter state"),
			},
			Err(err) if err.kind() == std::io::ErrorKind::NotFound => {},
			Err(err) => tracing::error!(?err, "failed to load request counter state"),
		}
		let counter = DailyRequestCounter {
			path,
			limit,
			thresholds,
			state: Mutex::new(state),
		};
		counter.reset_if_needed();
		counter
	}

	pub fn count(&self) -> u64 {
		self.state.lock().count
	}

	pub fn increment(&self) {
		let snapshot = {
			let mut state = self.state.lock();
			let today = current_pacific_date();
			if state.last_reset_date != today {
				state.count = 0;
				state.last_reset_date = today;
				state.logged_thresholds.clear();
				tracing::info!("daily request counter reset");
			}
			state.count += 1;
			for threshold in &self.thresholds {
				if state.count == *threshold && state.logged_thresholds.insert(*threshold) {
					tracing::warn!(
						"Gemini OAuth daily usage reached {threshold} requests ({}/{})",
						state.count,
						self.limit
					);
				}
			}
			state.clone()
		};
		self.save(&snapshot);
	}

	fn reset_if_needed(&self) {
		let snapshot = {
			let mut state = self.state.lock();
			let today = current_pacific_date();
			if state.last_reset_date == today {
				None
			} else {
				state.count = 0;
				state.last_reset_date = today;
				state.logged_thresholds.clear();
				tracing::info!("daily request counter reset");
				Some(state.clone())
			}
		};
		if let Some(state) = snapshot {
			self.save(&state);
		}
	}

	/// A failed write is logged and swallowed; the in-memory count still
	/// advances.
	fn save(&self, state: &CounterState) {
		if let Some(parent) = self.path.parent() {
			if let Err(err) = std::fs::create_dir_all(parent) {
				tracing::error!(?err, "failed to create counter state directory");
				return;
			}
		}
		let json = serde_json::to_string_pretty(state).unwrap_or_default();
		if let Err(err) = std::fs::write(&self.path, json) {
			tracing::error!(?err, "failed to save request counter state");
		}
	}
}

#[derive(Debug, Deserialize)]
struct OauthCredentials {
	access_token: String,
}

/// Gemini connector authenticating with an OAuth access token read from a
/// credentials file, throttled by the daily counter.
pub struct GeminiOauthConnector {
	base_url: String,
	credentials_path: PathBuf,
	keys: Vec<ApiKey>,
	counter: Arc<DailyRequestCounter>,
	client: reqwest::Client,
	timeout: Duration,
	models: ArcSwap<Vec<String>>,
}

impl GeminiOauthConnector {
	pub fn new(
		base_url: impl Into<String>,
		credentials_path: PathBuf,
		counter: Arc<DailyRequestCounter>,
		client: reqwest::Client,
		timeout: Duration,
	) -> Self {
		// The dispatcher rotates keys by name; OAuth has exactly one
		// identity, present only when the credentials file is readable.
		let keys = if credentials_path.exists() {
			vec![ApiKey {
				name: "GEMINI_OAUTH".to_string(),
				value: String::new(),
			}]
		} else {
			Vec::new()
		};
		GeminiOauthConnector {
			base_url: base_url.into().trim_end_matches('/').to_string(),
			credentials_path,
			keys,
			counter,
			client,
			timeout,
			models: ArcSwap::from_pointee(Vec::new()),
		}
	}

	fn access_token(&self) -> Result<String, ProxyError> {
		read_access_token(&self.credentials_path)
	}
}

fn read_access_token(path: &Path) -> Result<String, ProxyError> {
	let raw = std::fs::read_to_string(path).map_err(|e| {
		ProxyError::Terminal {
			status: 401,
			message: format!("oauth credentials unavailable: {e}"),
		}
	})?;
	let creds: OauthCredentials = serde_json::from_str(&raw).map_err(|e| ProxyError::Terminal {
		status: 401,
		message: format!("oauth credentials malformed: {e}"),
	})?;
	Ok(creds.access_token)
}

#[async_trait]
impl Connector for GeminiOauthConnector {
	fn name(&self) -> &str {
		"gemini-cli-oauth"
	}

	fn keys(&self) -> &[ApiKey] {
		&self.keys
	}

	fn models(&self) -> Arc<Vec<String>> {
		self.models.load_full()
	}

	async fn refresh_models(&self) -> Result<(), ProxyError> {
		if self.keys.is_empty() {
			return Ok(());
		}
		let token = self.access_token()?;
		let models = with_timeout(
			self.timeout,
			fetch_models(&self.client, &self.base_url, AuthStyle::Bearer, &token),
		)
		.await?;
		self.models.store(Arc::new(models));
		Ok(())
	}

	async fn chat_completions(
		&self,
		req: &ChatRequest,
		model: &str,
		_key: &ApiKey,
	) -> Result<ChatResponse, ProxyError> {
		let token = self.access_token()?;
		self.counter.increment();
		with_timeout(
			self.timeout,
			wire_chat(&self.client, &self.base_url, AuthStyle::Bearer, req, model, &token),
		)
		.await
	}

	async fn stream_chat_completions(
		&self,
		req: &ChatRequest,
		model: &str,
		_key: &ApiKey,
	) -> Result<ChunkStream, ProxyError> {
		let token = self.access_token()?;
		self.counter.increment();
		wire_stream_chat(
			&self.client,
			&self.base_url,
			AuthStyle::Bearer,
			req,
			model,
			&token,
		)
		.await
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn counter_starts_fresh_without_state_file() {
		let dir = tempfile::tempdir().unwrap();
		let counter = DailyRequestCounter::new(dir.path().join("counter.json"), 1000);
		assert_eq!(counter.count(), 0);
	}

	#[test]
	fn counter_persists_and_reloads() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("nested/counter.json");
		{
			let counter = DailyRequestCounter::new(path.clone(), 1000);
			counter.increment();
			counter.increment();
		}
		let reloaded = DailyRequestCounter::new(path.clone(), 1000);
		assert_eq!(reloaded.count(), 2);
		let raw = std::fs::read_to_string(&path).unwrap();
		let state: serde_json::Value = serde_json::from_str(&raw).unwrap();
		assert_eq!(state["count"], 2);
		assert!(state["last_reset_date"].as_str().unwrap().len() == 10);
	}

	#[test]
	fn counter_resets_on_new_pacific_day() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("counter.json");
		let stale = serde_json::json!({
			"count": 500,
			"last_reset_date": "2000-01-01",
			"logged_thresholds": [700],
		});
		std::fs::write(&path, stale.to_string()).unwrap();
		let counter = DailyRequestCounter::new(path, 1000);
		assert_eq!(counter.count(), 0);
	}

	#[test]
	fn thresholds_are_computed_from_limit() {
		let dir = tempfile::tempdir().unwrap();
		let counter = DailyRequestCounter::new(dir.path().join("c.json"), 10);
		assert_eq!(counter.thresholds, vec![7, 8, 9]);
	}

	#[test]
	fn missing_credentials_disable_the_backend() {
		let connector = GeminiOauthConnector::new(
			"https://example.invalid",
			PathBuf::from("/nonexistent/creds.json"),
			Arc::new(DailyRequestCounter::new(
				std::env::temp_dir().join("llmgateway-test-counter.json"),
				1000,
			)),
			reqwest::Client::new(),
			Duration::from_secs(5),
		);
		assert!(connector.keys().is_empty());
		assert!(!connector.is_functional());
	}
}
