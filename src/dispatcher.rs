use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::backend::{ApiKey, ChunkStream, Connector};
use crate::llm::{ChatRequest, ChatResponse, ModelRef, ProxyError};
use crate::ratelimit::RateLimitRegistry;
use crate::session::{FailoverRoute, RoutePolicy, SessionSnapshot};

/// Cooldown recorded when a 429 carries no parseable retry delay.
const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(60);

pub enum DispatchResponse {
	Unary(ChatResponse),
	Stream(ChunkStream),
}

pub struct DispatchOutcome {
	pub response: DispatchResponse,
	pub backend: String,
	pub model: String,
	/// The session's oneoff override fed this dispatch and must be cleared.
	pub oneoff_consumed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Attempt {
	backend: String,
	model: String,
	key_name: String,
}

/// Resolves the effective (backend, model, key), walks failover routes, and
/// retries around rate limits. Connectors never rotate keys themselves.
pub struct Dispatcher {
	connectors: HashMap<String, Arc<dyn Connector>>,
	registry: Arc<RateLimitRegistry>,
	default_backend: String,
}

impl Dispatcher {
	pub fn new(
		connectors: HashMap<String, Arc<dyn Connector>>,
		registry: Arc<RateLimitRegistry>,
		default_backend: String,
	) -> Self {
		Dispatcher {
			connectors,
			registry,
			default_backend,
		}
	}

	pub fn known_backends(&self) -> Vec<&str> {
		self.connectors.keys().map(String::as_str).collect()
	}

	pub fn connector(&self, backend: &str) -> Option<&Arc<dyn Connector>> {
		self.connectors.get(backend)
	}

	pub fn connectors(&self) -> impl Iterator<Item = (&String, &Arc<dyn Connector>)> {
		self.connectors.iter()
	}

	/// First match wins: oneoff override, explicit backend-prefixed model,
	/// session backend config, then process default.
	fn resolve(&self, req: &ChatRequest, snapshot: &SessionSnapshot) -> (String, String, bool) {
		let backend_config = &snapshot.backend_config;
		if let (Some(backend), Some(model)) = (
			backend_config.oneoff_backend.as_ref(),
			backend_config.oneoff_model.as_ref(),
		) {
			return (backend.clone(), model.clone(), true);
		}
		if let Some(model_ref) = ModelRef::parse(&req.model, &self.known_backends()) {
			return (model_ref.backend, model_ref.model, false);
		}
		if let (Some(backend), Some(model)) =
			(backend_config.backend_type.as_ref(), backend_config.model.as_ref())
		{
			return (backend.clone(), model.clone(), false);
		}
		let backend = backend_config
			.backend_type
			.clone()
			.unwrap_or_else(|| self.default_backend.clone());
		(backend, req.model.clone(), false)
	}

	pub async fn dispatch(
		&self,
		req: &ChatRequest,
		snapshot: &SessionSnapshot,
	) -> Result<DispatchOutcome, DispatchFailure> {
		let (backend, model, oneoff) = self.resolve(req, snapshot);
		// A model naming a failover route switches to route mode.
		if let Some(route) = snapshot.backend_config.failover_routes.get(&model) {
			let attempts = self.route_attempts(route);
			return self.run_attempts(req, attempts, oneoff).await;
		}
		let attempts = self.single_attempts(&backend, &model);
		self.run_attempts(req, attempts, oneoff).await
	}

	fn single_attempts(&self, backend: &str, model: &str) -> Vec<Attempt> {
		let Some(connector) = self.connectors.get(backend) else {
			return Vec::new();
		};
		connector
			.keys()
			.iter()
			.map(|key| Attempt {
				backend: backend.to_string(),
				model: model.to_string(),
				key_name: key.name.clone(),
			})
			.collect()
	}

	/// Expand a route into its concrete attempt order.
	///
	/// `k`/`mk`: element-major, exhausting the backend's keys inside each
	/// element. `m`: round-robin over elements, one key index per round.
	/// `km`: per backend, exhaust the backend's route models under each key
	/// before advancing to its next key.
	fn route_attempts(&self, route: &FailoverRoute) -> Vec<Attempt> {
		let elements: Vec<(String, String)> = route
			.elements
			.iter()
			.filter_map(|e| {
				let model_ref = ModelRef::parse(e, &self.known_backends())?;
				Some((model_ref.backend, model_ref.model))
			})
			.collect();
		let keys_of = |backend: &str| -> Vec<String> {
			self
				.connectors
				.get(backend)
				.map(|c| c.keys().iter().map(|k| k.name.clone()).collect())
				.unwrap_or_default()
		};
		let mut attempts = Vec::new();
		match route.policy {
			RoutePolicy::K | RoutePolicy::MK => {
				for (backend, model) in &elements {
					for key_name in keys_of(backend) {
						attempts.push(Attempt {
							backend: backend.clone(),
							model: model.clone(),
							key_name,
						});
					}
				}
			},
			RoutePolicy::M => {
				let max_keys = elements
					.iter()
					.map(|(b, _)| keys_of(b).len())
					.max()
					.unwrap_or(0);
				for key_index in 0..max_keys {
					for (backend, model) in &elements {
						let keys = keys_of(backend);
						if let Some(key_name) = keys.get(key_index) {
							attempts.push(Attempt {
								backend: backend.clone(),
								model: model.clone(),
								key_name: key_name.clone(),
							});
						}
					}
				}
			},
			RoutePolicy::KM => {
				// Group route models by backend, first appearance order.
				let mut groups: Vec<(String, Vec<String>)> = Vec::new();
				for (backend, model) in &elements {
					match groups.iter_mut().find(|(b, _)| b == backend) {
						Some((_, models)) => models.push(model.clone()),
						None => groups.push((backend.clone(), vec![model.clone()])),
					}
				}
				for (backend, models) in &groups {
					for key_name in keys_of(backend) {
						for model in models {
							attempts.push(Attempt {
								backend: backend.clone(),
								model: model.clone(),
								key_name: key_name.clone(),
							});
						}
					}
				}
			},
		}
		attempts
	}

	async fn run_attempts(
		&self,
		req: &ChatRequest,
		attempts: Vec<Attempt>,
		oneoff: bool,
	) -> Result<DispatchOutcome, DispatchFailure> {
		let mut initiated = false;
		for attempt in attempts {
			if self
				.registry
				.get(&attempt.backend, &attempt.model, &attempt.key_name)
				.is_some()
			{
				tracing::debug!(
					backend = %attempt.backend,
					model = %attempt.model,
					key = %attempt.key_name,
					"skipping rate-limited attempt"
				);
				continue;
			}
			let Some(connector) = self.connectors.get(&attempt.backend) else {
				continue;
			};
			let Some(key) = connector.keys().iter().find(|k| k.name == attempt.key_name) else {
				continue;
			};
			let models = connector.models();
			if !models.is_empty() && !models.iter().any(|m| *m == attempt.model) {
				return Err(DispatchFailure {
					error: ProxyError::UnknownModel(attempt.model.clone()),
					oneoff_consumed: oneoff,
				});
			}
			initiated = true;
			match self.try_once(connector, req, &attempt, key).await {
				Ok(response) => {
					return Ok(DispatchOutcome {
						response,
						backend: attempt.backend,
						model: attempt.model,
						oneoff_consumed: oneoff,
					});
				},
				Err(ProxyError::RateLimited { delay_seconds }) => {
					let delay = delay_seconds
						.map(Duration::from_secs_f64)
						.unwrap_or(DEFAULT_RETRY_DELAY);
					tracing::info!(
						backend = %attempt.backend,
						model = %attempt.model,
						key = %attempt.key_name,
						delay_s = delay.as_secs_f64(),
						"attempt rate limited"
					);
					self
						.registry
						.set(&attempt.backend, &attempt.model, &attempt.key_name, delay);
				},
				Err(ProxyError::Transient(reason)) => {
					tracing::warn!(
						backend = %attempt.backend,
						model = %attempt.model,
						%reason,
						"transient upstream failure, trying next attempt"
					);
				},
				Err(error) => {
					return Err(DispatchFailure {
						error,
						oneoff_consumed: oneoff,
					});
				},
			}
		}
		Err(DispatchFailure {
			error: ProxyError::AllBackendsUnavailable {
				earliest_retry: self.registry.next_available(),
			},
			// Nothing was attempted: the oneoff survives for the next try.
			oneoff_consumed: oneoff && initiated,
		})
	}

	async fn try_once(
		&self,
		connector: &Arc<dyn Connector>,
		req: &ChatRequest,
		attempt: &Attempt,
		key: &ApiKey,
	) -> Result<DispatchResponse, ProxyError> {
		if req.stream {
			// Retry is only possible while the upstream stream has produced
			// nothing; once returned, bytes flow straight through.
			let stream = connector
				.stream_chat_completions(req, &attempt.model, key)
				.await?;
			Ok(DispatchResponse::Stream(stream))
		} else {
			let response = connector.chat_completions(req, &attempt.model, key).await?;
			Ok(DispatchResponse::Unary(response))
		}
	}
}

pub struct DispatchFailure {
	pub error: ProxyError,
	pub oneoff_consumed: bool,
}

#[cfg(test)]
mod tests {
	use std::sync::Arc;
	use std::sync::atomic::{AtomicUsize, Ordering};

	use arc_swap::ArcSwap;
	use async_trait::async_trait;
	use parking_lot::Mutex;

	use super::*;
	use crate::llm::{ChatResponse, ResponseMessage, Role, Usage};
	use crate::session::SessionDefaults;

	struct ScriptedConnector {
		name: String,
		keys: Vec<ApiKey>,
		models: ArcSwap<Vec<String>>,
		/// Keys that answer 429; everything else succeeds.
		limited_keys: Vec<String>,
		calls: Mutex<Vec<(String, String)>>,
		call_count: AtomicUsize,
	}

	impl ScriptedConnector {
		fn new(name: &str, keys: &[&str], models: &[&str], limited_keys: &[&str]) -> Self {
			ScriptedConnector {
				name: name.to_string(),
				keys: keys
					.iter()
					.map(|k| ApiKey {
						name: k.to_string(),
						value: format!("secret-{k}"),
					})
					.collect(),
				models: ArcSwap::from_pointee(models.iter().map(|m| m.to_string()).collect()),
				limited_keys: limited_keys.iter().map(|k| k.to_string()).collect(),
				calls: Mutex::new(Vec::new()),
				call_count: AtomicUsize::new(0),
			}
		}

		fn response(model: &str) -> ChatResponse {
			ChatResponse {
				id: "resp-1".to_string(),
				created: 0,
				model: model.to_string(),
				object: "chat.completion".to_string(),
				choices: vec![crate::llm::Choice {
					index: 0,
					message: ResponseMessage {
						role: Role::Assistant,
						content: Some("ok".to_string()),
						tool_calls: None,
						parsed: None,
					},
					finish_reason: Some(crate::llm::FinishReason::Stop),
				}],
				usage: Some(Usage {
					prompt_tokens: 1,
					completion_tokens: 1,
					total_tokens: 2,
				}),
			}
		}
	}

	#[async_trait]
	impl Connector for ScriptedConnector {
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
			Ok(())
		}

		async fn chat_completions(
			&self,
			_req: &ChatRequest,
			model: &str,
			key: &ApiKey,
		) -> Result<ChatResponse, ProxyError> {
			self.call_count.fetch_add(1, Ordering::SeqCst);
			self.calls.lock().push((model.to_string(), key.name.clone()));
			if self.limited_keys.contains(&key.name) {
				return Err(ProxyError::RateLimited {
					delay_seconds: Some(30.0),
				});
			}
			Ok(Self::response(model))
		}

		async fn stream_chat_completions(
			&self,
			_req: &ChatRequest,
			_model: &str,
			_key: &ApiKey,
		) -> Result<ChunkStream, ProxyError> {
			unimplemented!("not exercised")
		}
	}

	fn request(model: &str) -> ChatRequest {
		ChatRequest {
			model: model.to_string(),
			messages: vec![crate::llm::Message::text(Role::User, "hi")],
			..ChatRequest::default()
		}
	}

	fn snapshot_with_route(policy: RoutePolicy, elements: &[&str]) -> SessionSnapshot {
		let mut snapshot = SessionDefaults::default().fresh_snapshot();
		snapshot.backend_config.failover_routes.insert(
			"race".to_string(),
			FailoverRoute {
				policy,
				elements: elements.iter().map(|e| e.to_string()).collect(),
			},
		);
		snapshot
	}

	fn dispatcher(
		connectors: Vec<Arc<ScriptedConnector>>,
	) -> (Dispatcher, Arc<RateLimitRegistry>) {
		let registry = Arc::new(RateLimitRegistry::new());
		let map: HashMap<String, Arc<dyn Connector>> = connectors
			.into_iter()
			.map(|c| (c.name.clone(), c as Arc<dyn Connector>))
			.collect();
		(
			Dispatcher::new(map, registry.clone(), "b1".to_string()),
			registry,
		)
	}

	#[tokio::test]
	async fn prefixed_model_selects_backend() {
		let b1 = Arc::new(ScriptedConnector::new("b1", &["K1"], &["m1"], &[]));
		let b2 = Arc::new(ScriptedConnector::new("b2", &["K1"], &["m2"], &[]));
		let (dispatcher, _) = dispatcher(vec![b1.clone(), b2.clone()]);
		let snapshot = SessionDefaults::default().fresh_snapshot();
		let outcome = dispatcher
			.dispatch(&request("b2:m2"), &snapshot)
			.await
			.map_err(|f| f.error)
			.unwrap();
		assert_eq!(outcome.backend, "b2");
		assert_eq!(outcome.model, "m2");
		assert!(b1.calls.lock().is_empty());
	}

	#[tokio::test]
	async fn oneoff_wins_and_reports_consumption() {
		let b1 = Arc::new(ScriptedConnector::new("b1", &["K1"], &["m1"], &[]));
		let b2 = Arc::new(ScriptedConnector::new("b2", &["K1"], &["m2"], &[]));
		let (dispatcher, _) = dispatcher(vec![b1, b2.clone()]);
		let mut snapshot = SessionDefaults::default().fresh_snapshot();
		snapshot.backend_config.oneoff_backend = Some("b2".to_string());
		snapshot.backend_config.oneoff_model = Some("m2".to_string());
		let outcome = dispatcher
			.dispatch(&request("m1"), &snapshot)
			.await
			.map_err(|f| f.error)
			.unwrap();
		assert_eq!(outcome.backend, "b2");
		assert!(outcome.oneoff_consumed);
		assert_eq!(b2.calls.lock().as_slice(), &[("m2".to_string(), "K1".to_string())]);
	}

	// Two rate-limited keys on b1, one healthy key on b2: policy k walks
	// both b1 keys then succeeds on b2 with exactly one call there.
	#[tokio::test]
	async fn route_policy_k_exhausts_keys_before_next_element() {
		let b1 = Arc::new(ScriptedConnector::new(
			"b1",
			&["K1", "K2"],
			&["m1"],
			&["K1", "K2"],
		));
		let b2 = Arc::new(ScriptedConnector::new("b2", &["K1"], &["m2"], &[]));
		let (dispatcher, registry) = dispatcher(vec![b1.clone(), b2.clone()]);
		let snapshot = snapshot_with_route(RoutePolicy::K, &["b1:m1", "b2:m2"]);
		let outcome = dispatcher
			.dispatch(&request("race"), &snapshot)
			.await
			.map_err(|f| f.error)
			.unwrap();
		assert_eq!(outcome.backend, "b2");
		assert_eq!(b1.call_count.load(Ordering::SeqCst), 2);
		assert_eq!(b2.call_count.load(Ordering::SeqCst), 1);
		// Both b1 keys were recorded as blocked.
		assert!(registry.get("b1", "m1", "K1").is_some());
		assert!(registry.get("b1", "m1", "K2").is_some());
	}

	#[tokio::test]
	async fn route_policy_m_round_robins_elements() {
		let b1 = Arc::new(ScriptedConnector::new("b1", &["K1", "K2"], &["m1"], &["K1", "K2"]));
		let b2 = Arc::new(ScriptedConnector::new("b2", &["K1"], &["m2"], &[]));
		let (dispatcher, _) = dispatcher(vec![b1.clone(), b2.clone()]);
		let snapshot = snapshot_with_route(RoutePolicy::M, &["b1:m1", "b2:m2"]);
		let outcome = dispatcher
			.dispatch(&request("race"), &snapshot)
			.await
			.map_err(|f| f.error)
			.unwrap();
		assert_eq!(outcome.backend, "b2");
		// Round one: b1 rate-limits, b2 answers. b1's second key is never
		// reached.
		assert_eq!(b1.call_count.load(Ordering::SeqCst), 1);
		assert_eq!(b2.call_count.load(Ordering::SeqCst), 1);
	}

	#[tokio::test]
	async fn blocked_attempts_are_skipped_without_calls() {
		let b1 = Arc::new(ScriptedConnector::new("b1", &["K1"], &["m1"], &[]));
		let (dispatcher, registry) = dispatcher(vec![b1.clone()]);
		registry.set("b1", "m1", "K1", Duration::from_secs(60));
		let snapshot = SessionDefaults::default().fresh_snapshot();
		let failure = dispatcher
			.dispatch(&request("m1"), &snapshot)
			.await
			.err()
			.unwrap();
		assert!(matches!(
			failure.error,
			ProxyError::AllBackendsUnavailable { earliest_retry: Some(_) }
		));
		assert_eq!(b1.call_count.load(Ordering::SeqCst), 0);
	}

	#[tokio::test]
	async fn unknown_model_is_terminal() {
		let b1 = Arc::new(ScriptedConnector::new("b1", &["K1"], &["m1"], &[]));
		let (dispatcher, _) = dispatcher(vec![b1]);
		let snapshot = SessionDefaults::default().fresh_snapshot();
		let failure = dispatcher
			.dispatch(&request("ghost"), &snapshot)
			.await
			.err()
			.unwrap();
		assert!(matches!(failure.error, ProxyError::UnknownModel(m) if m == "ghost"));
	}

	#[tokio::test]
	async fn km_policy_groups_models_per_backend() {
		let b1 = Arc::new(ScriptedConnector::new(
			"b1",
			&["K1", "K2"],
			&["m1", "m2"],
			&["K1", "K2"],
		));
		let b2 = Arc::new(ScriptedConnector::new("b2", &["K1"], &["m3"], &[]));
		let (dispatcher, _) = dispatcher(vec![b1.clone(), b2]);
		let snapshot = snapshot_with_route(RoutePolicy::KM, &["b1:m1", "b1:m2", "b2:m3"]);
		let outcome = dispatcher
			.dispatch(&request("race"), &snapshot)
			.await
			.map_err(|f| f.error)
			.unwrap();
		assert_eq!(outcome.backend, "b2");
		// Under km, key K1 tries m1 then m2 before K2 does the same.
		let calls = b1.calls.lock().clone();
		assert_eq!(
			calls,
			vec![
				("m1".to_string(), "K1".to_string()),
				("m2".to_string(), "K1".to_string()),
				("m1".to_string(), "K2".to_string()),
				("m2".to_string(), "K2".to_string()),
			]
		);
	}

	#[tokio::test]
	async fn session_backend_and_model_apply() {
		let b2 = Arc::new(ScriptedConnector::new("b2", &["K1"], &["m2"], &[]));
		let (dispatcher, _) = dispatcher(vec![b2.clone()]);
		let mut snapshot = SessionDefaults::default().fresh_snapshot();
		snapshot.backend_config.backend_type = Some("b2".to_string());
		snapshot.backend_config.model = Some("m2".to_string());
		let outcome = dispatcher
			.dispatch(&request("whatever"), &snapshot)
			.await
			.map_err(|f| f.error)
			.unwrap();
		assert_eq!(outcome.backend, "b2");
		assert_eq!(outcome.model, "m2");
	}
}
