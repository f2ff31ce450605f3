use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;

use llmgateway::app::Context;
use llmgateway::backend::{ApiKey, ChunkStream, Connector};
use llmgateway::commands::CommandMatcher;
use llmgateway::config::Config;
use llmgateway::dispatcher::Dispatcher;
use llmgateway::llm::{
	ChatRequest, ChatResponse, Choice, Delta, FinishReason, Message, ProxyError, ResponseMessage,
	Role, StreamChoice, StreamChunk, Usage,
};
use llmgateway::middleware::{CommandLeakFilter, LogAccounting, Redactor};
use llmgateway::pipeline::{self, PipelineResponse};
use llmgateway::ratelimit::RateLimitRegistry;
use llmgateway::session::{SessionDefaults, SessionStore};

/// In-process backend double: answers every model it advertises and records
/// each (model, key) call.
struct EchoConnector {
	name: String,
	keys: Vec<ApiKey>,
	models: ArcSwap<Vec<String>>,
	calls: Mutex<Vec<String>>,
	stream_chunks: Vec<String>,
}

impl EchoConnector {
	fn new(name: &str, models: &[&str]) -> Arc<Self> {
		Arc::new(EchoConnector {
			name: name.to_string(),
			keys: vec![ApiKey {
				name: format!("{}_KEY", name.to_uppercase()),
				value: "secret".to_string(),
			}],
			models: ArcSwap::from_pointee(models.iter().map(|m| m.to_string()).collect()),
			calls: Mutex::new(Vec::new()),
			stream_chunks: vec!["hello ".to_string(), "world".to_string()],
		})
	}

	fn with_stream_chunks(name: &str, models: &[&str], chunks: &[&str]) -> Arc<Self> {
		Arc::new(EchoConnector {
			name: name.to_string(),
			keys: vec![ApiKey {
				name: format!("{}_KEY", name.to_uppercase()),
				value: "secret".to_string(),
			}],
			models: ArcSwap::from_pointee(models.iter().map(|m| m.to_string()).collect()),
			calls: Mutex::new(Vec::new()),
			stream_chunks: chunks.iter().map(|c| c.to_string()).collect(),
		})
	}

	fn calls(&self) -> Vec<String> {
		self.calls.lock().clone()
	}
}

#[async_trait]
impl Connector for EchoConnector {
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
		_key: &ApiKey,
	) -> Result<ChatResponse, ProxyError> {
		self.calls.lock().push(model.to_string());
		Ok(ChatResponse {
			id: "chatcmpl-echo".to_string(),
			created: 0,
			model: model.to_string(),
			object: "chat.completion".to_string(),
			choices: vec![Choice {
				index: 0,
				message: ResponseMessage {
					role: Role::Assistant,
					content: Some(format!("{} backend response", self.name)),
					tool_calls: None,
					parsed: None,
				},
				finish_reason: Some(FinishReason::Stop),
			}],
			usage: Some(Usage {
				prompt_tokens: 2,
				completion_tokens: 2,
				total_tokens: 4,
			}),
		})
	}

	async fn stream_chat_completions(
		&self,
		_req: &ChatRequest,
		model: &str,
		_key: &ApiKey,
	) -> Result<ChunkStream, ProxyError> {
		self.calls.lock().push(model.to_string());
		let model = model.to_string();
		let chunks: Vec<Result<StreamChunk, ProxyError>> = self
			.stream_chunks
			.iter()
			.map(|text| {
				Ok(StreamChunk {
					id: "chunk".to_string(),
					created: 0,
					model: model.clone(),
					choices: vec![StreamChoice {
						index: 0,
						delta: Delta {
							role: None,
							content: Some(text.clone()),
							tool_calls: None,
						},
						finish_reason: None,
					}],
					usage: None,
				})
			})
			.collect();
		Ok(Box::pin(futures::stream::iter(chunks)))
	}
}

fn test_config(interactive: bool) -> Config {
	Config {
		host: "127.0.0.1".to_string(),
		port: 0,
		timeout: Duration::from_secs(5),
		default_backend: "openrouter".to_string(),
		interactive_mode: interactive,
		command_prefix: "!/".to_string(),
		redact_api_keys_in_prompts: true,
		disable_auth: true,
		auth_key: None,
		disable_interactive_commands: false,
		force_set_project: false,
		force_context_window: None,
		thinking_budget: None,
		openrouter_keys: Vec::new(),
		openrouter_base_url: None,
		gemini_keys: Vec::new(),
		gemini_base_url: None,
		openai_keys: Vec::new(),
		openai_base_url: None,
		gemini_oauth_credentials_path: None,
		gemini_oauth_daily_limit: 1000,
		gemini_oauth_state_path: std::env::temp_dir().join("llmgateway-test-counter.json"),
		model_defaults: HashMap::new(),
		failover_routes: BTreeMap::new(),
		session_max_age: Duration::from_secs(3600),
	}
}

fn build_ctx(interactive: bool, connectors: Vec<Arc<EchoConnector>>) -> Arc<Context> {
	let cfg = Arc::new(test_config(interactive));
	let registry = Arc::new(RateLimitRegistry::new());
	let map: HashMap<String, Arc<dyn Connector>> = connectors
		.into_iter()
		.map(|c| (c.name.clone(), c as Arc<dyn Connector>))
		.collect();
	let defaults = SessionDefaults {
		backend_type: Some(cfg.default_backend.clone()),
		interactive_mode: cfg.interactive_mode,
		failover_routes: BTreeMap::new(),
		loop_config: Default::default(),
	};
	Arc::new(Context {
		sessions: SessionStore::new(defaults),
		dispatcher: Dispatcher::new(map, registry.clone(), cfg.default_backend.clone()),
		registry,
		redactor: Redactor::new(Vec::<String>::new(), cfg.redact_api_keys_in_prompts),
		leak_filter: CommandLeakFilter::new(&cfg.command_prefix),
		accounting: Arc::new(LogAccounting),
		matcher: CommandMatcher::new(&cfg.command_prefix).unwrap(),
		auth_key: None,
		cfg,
	})
}

fn user_request(session: &str, model: &str, content: &str) -> ChatRequest {
	ChatRequest {
		model: model.to_string(),
		messages: vec![Message::text(Role::User, content)],
		session_id: session.to_string(),
		..ChatRequest::default()
	}
}

async fn unary(ctx: &Arc<Context>, req: ChatRequest) -> ChatResponse {
	match pipeline::handle_chat(ctx, req).await.unwrap() {
		PipelineResponse::Unary(resp) => resp,
		PipelineResponse::Stream { .. } => panic!("expected unary response"),
	}
}

fn content_of(resp: &ChatResponse) -> String {
	resp.choices[0].message.content.clone().unwrap_or_default()
}

// set(model=openrouter:foo) answers locally, then the next request
// dispatches to OpenRouter with model foo.
#[tokio::test]
async fn set_model_then_dispatch() {
	let openrouter = EchoConnector::new("openrouter", &["foo", "bar"]);
	let ctx = build_ctx(true, vec![openrouter.clone()]);

	let resp = unary(&ctx, user_request("s1", "m", "!/set(model=openrouter:foo)")).await;
	assert_eq!(resp.id, "proxy_cmd_processed");
	assert!(content_of(&resp).contains("model set to openrouter:foo"));
	assert!(openrouter.calls().is_empty());

	let resp = unary(&ctx, user_request("s1", "m", "Hello")).await;
	assert!(content_of(&resp).contains("openrouter backend response"));
	assert_eq!(openrouter.calls(), vec!["foo"]);
}

// A oneoff override feeds exactly one dispatch and then expires.
#[tokio::test]
async fn oneoff_is_consumed_once() {
	let openrouter = EchoConnector::new("openrouter", &["foo", "cypher-alpha:free"]);
	let ctx = build_ctx(true, vec![openrouter.clone()]);

	let resp = unary(
		&ctx,
		user_request("s2", "foo", "!/oneoff(openrouter/cypher-alpha:free)\nHello!"),
	)
	.await;
	assert!(content_of(&resp).contains("openrouter backend response"));
	assert_eq!(openrouter.calls(), vec!["cypher-alpha:free"]);

	let resp = unary(&ctx, user_request("s2", "foo", "Hello again")).await;
	assert!(content_of(&resp).contains("openrouter backend response"));
	assert_eq!(openrouter.calls(), vec!["cypher-alpha:free", "foo"]);

	let snapshot = ctx.sessions.get("s2").unwrap().snapshot();
	assert_eq!(snapshot.backend_config.oneoff_backend, None);
}

#[tokio::test]
async fn unknown_command_reports_without_dispatch() {
	let openrouter = EchoConnector::new("openrouter", &["foo"]);
	let ctx = build_ctx(true, vec![openrouter.clone()]);
	let resp = unary(&ctx, user_request("s3", "foo", "!/bad()")).await;
	assert_eq!(resp.id, "proxy_cmd_processed");
	assert!(content_of(&resp).contains("unknown command"));
	assert!(openrouter.calls().is_empty());
}

// Pointing the session at a non-functional backend is refused and leaves
// the session untouched.
#[tokio::test]
async fn set_backend_requires_functional_backend() {
	let openrouter = EchoConnector::new("openrouter", &["foo"]);
	let ctx = build_ctx(true, vec![openrouter]);
	let resp = unary(&ctx, user_request("s4", "foo", "!/set(backend=gemini)")).await;
	assert!(content_of(&resp).contains("backend gemini not functional"));
	let snapshot = ctx.sessions.get("s4").unwrap().snapshot();
	assert_eq!(snapshot.backend_config.backend_type.as_deref(), Some("openrouter"));
}

// Banner appears on the first interactive response and is injected ahead of
// backend output.
#[tokio::test]
async fn banner_prepended_once_in_interactive_mode() {
	let openrouter = EchoConnector::new("openrouter", &["foo"]);
	let ctx = build_ctx(true, vec![openrouter]);

	let resp = unary(&ctx, user_request("s5", "foo", "First message")).await;
	let content = content_of(&resp);
	assert!(content.contains("Hello, this is llmgateway"));
	assert!(content.contains("Session id: s5"));
	assert!(content.contains("Functional backends:"));
	assert!(content.contains("openrouter backend response"));

	let resp = unary(&ctx, user_request("s5", "foo", "Second message")).await;
	assert!(!content_of(&resp).contains("Hello, this is llmgateway"));
}

// interactive_mode off: no banner ever, even when hello is requested.
#[tokio::test]
async fn no_banner_outside_interactive_mode() {
	let openrouter = EchoConnector::new("openrouter", &["foo"]);
	let ctx = build_ctx(false, vec![openrouter]);
	let resp = unary(&ctx, user_request("s6", "foo", "!/hello")).await;
	assert_eq!(resp.id, "proxy_cmd_processed");
	let content = content_of(&resp);
	assert!(content.contains("hello acknowledged"));
	assert!(!content.contains("Hello, this is llmgateway"));
}

// A session tagged as Cline wraps command-only responses in XML; untagged
// sessions do not.
#[tokio::test]
async fn cline_wrapping_for_command_only_responses() {
	let openrouter = EchoConnector::new("openrouter", &["foo"]);
	let ctx = build_ctx(true, vec![openrouter]);

	// Tag the session via an attempt_completion marker, then send a command.
	let _ = unary(
		&ctx,
		user_request("s7", "foo", "work done <attempt_completion>x</attempt_completion>"),
	)
	.await;
	let resp = unary(&ctx, user_request("s7", "foo", "!/hello")).await;
	let content = content_of(&resp);
	assert!(content.starts_with("<attempt_completion>\n<result>\n"));
	assert!(content.ends_with("\n</result>\n</attempt_completion>\n"));
	// Hello acknowledgement is suppressed for the Cline agent class.
	assert!(!content.contains("hello acknowledged"));

	let resp = unary(&ctx, user_request("s8", "foo", "!/hello")).await;
	let content = content_of(&resp);
	assert!(!content.starts_with("<attempt_completion>"));
	assert!(content.contains("hello acknowledged"));
}

// Streamed content that repeats a pattern three times is truncated with the
// marker and the stream ends there.
#[tokio::test]
async fn stream_loop_is_truncated() {
	let pattern = "abcdefghij";
	let chunks: Vec<&str> = vec![pattern; 6];
	let openrouter = EchoConnector::with_stream_chunks("openrouter", &["foo"], &chunks);
	let ctx = build_ctx(false, vec![openrouter]);

	let mut req = user_request("s9", "foo", "stream please");
	req.stream = true;
	let mut stream = match pipeline::handle_chat(&ctx, req).await.unwrap() {
		PipelineResponse::Stream { stream, .. } => stream,
		PipelineResponse::Unary(_) => panic!("expected stream"),
	};
	let mut content = String::new();
	while let Some(item) = stream.next().await {
		let chunk = item.unwrap();
		for choice in &chunk.choices {
			if let Some(text) = &choice.delta.content {
				content.push_str(text);
			}
		}
	}
	let expected = format!(
		"{p}{p}{p}<truncated: loop detected>",
		p = pattern
	);
	assert_eq!(content, expected);
}

// The streaming path carries the banner in the first chunk.
#[tokio::test]
async fn banner_injected_into_first_stream_chunk() {
	let openrouter = EchoConnector::new("openrouter", &["foo"]);
	let ctx = build_ctx(true, vec![openrouter]);
	let mut req = user_request("s10", "foo", "stream please");
	req.stream = true;
	let mut stream = match pipeline::handle_chat(&ctx, req).await.unwrap() {
		PipelineResponse::Stream { stream, .. } => stream,
		PipelineResponse::Unary(_) => panic!("expected stream"),
	};
	let first = stream.next().await.unwrap().unwrap();
	let first_text = first.choices[0].delta.content.clone().unwrap();
	assert!(first_text.contains("Hello, this is llmgateway"));
	assert!(first_text.contains("hello "));
	let second = stream.next().await.unwrap().unwrap();
	assert_eq!(second.choices[0].delta.content.as_deref(), Some("world"));
}

#[tokio::test]
async fn advertised_models_pair_backend_and_model() {
	let openrouter = EchoConnector::new("openrouter", &["foo", "bar"]);
	let gemini = EchoConnector::new("gemini", &["gemini-2.5-pro"]);
	let ctx = build_ctx(true, vec![openrouter, gemini]);
	let models = ctx.advertised_models();
	assert!(models.contains(&"openrouter:foo".to_string()));
	assert!(models.contains(&"gemini:gemini-2.5-pro".to_string()));
	let summary = ctx.backend_summary();
	assert_eq!(summary.get("openrouter"), Some(&(1, 2)));
}
