use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use itertools::Itertools;

use crate::assemble::BackendSummary;
use crate::backend::{ApiKey, Connector, build_http_client};
use crate::backend::gemini::GeminiConnector;
use crate::backend::gemini_oauth::{DailyRequestCounter, GeminiOauthConnector};
use crate::backend::openai::OpenAiConnector;
use crate::backend::openrouter::OpenRouterConnector;
use crate::commands::{CommandCtx, CommandMatcher};
use crate::config::{Config, ReasoningDefaults, generate_auth_key};
use crate::dispatcher::Dispatcher;
use crate::llm::ModelRef;
use crate::middleware::{AccountingSink, CommandLeakFilter, LogAccounting, Redactor};
use crate::ratelimit::RateLimitRegistry;
use crate::session::{SessionDefaults, SessionSnapshot, SessionStore};

/// Everything a request handler needs, constructed once at startup and
/// injected through axum state. No component reads globals.
pub struct Context {
	pub cfg: Arc<Config>,
	pub sessions: SessionStore,
	pub dispatcher: Dispatcher,
	pub registry: Arc<RateLimitRegistry>,
	pub redactor: Redactor,
	pub leak_filter: CommandLeakFilter,
	pub accounting: Arc<dyn AccountingSink>,
	pub matcher: CommandMatcher,
	/// Client-facing key; `None` when auth is disabled.
	pub auth_key: Option<String>,
}

impl Context {
	pub fn functional_backends(&self) -> Vec<(String, Arc<dyn Connector>)> {
		self
			.dispatcher
			.connectors()
			.filter(|(_, c)| c.is_functional())
			.map(|(name, c)| (name.clone(), c.clone()))
			.sorted_by(|a, b| a.0.cmp(&b.0))
			.collect()
	}

	pub fn command_ctx(&self) -> CommandCtx {
		let mut functional = BTreeSet::new();
		let mut models = HashMap::new();
		for (name, connector) in self.functional_backends() {
			functional.insert(name.clone());
			models.insert(name, (*connector.models()).clone());
		}
		CommandCtx {
			functional_backends: functional,
			models,
			prefix: self.cfg.command_prefix.clone(),
		}
	}

	pub fn backend_summary(&self) -> BackendSummary {
		self
			.functional_backends()
			.into_iter()
			.map(|(name, c)| (name, (c.keys().len(), c.models().len())))
			.collect()
	}

	/// All models exposed over the listing endpoints, as
	/// `<backend>:<model>` pairs.
	pub fn advertised_models(&self) -> Vec<String> {
		let mut out = Vec::new();
		for (name, connector) in self.functional_backends() {
			for model in connector.models().iter() {
				out.push(format!("{name}:{model}"));
			}
		}
		out
	}

	pub fn model_defaults_for(
		&self,
		model: &str,
		snapshot: &SessionSnapshot,
	) -> Option<ReasoningDefaults> {
		let backend = snapshot
			.backend_config
			.backend_type
			.clone()
			.unwrap_or_else(|| self.cfg.default_backend.clone());
		let effective = snapshot.backend_config.model.as_deref().unwrap_or(model);
		let prefixed = match ModelRef::parse(effective, &self.dispatcher.known_backends()) {
			Some(model_ref) => format!("{}:{}", model_ref.backend, model_ref.model),
			None => format!("{backend}:{effective}"),
		};
		self
			.cfg
			.model_defaults
			.get(&prefixed)
			.or_else(|| self.cfg.model_defaults.get(effective))
			.and_then(|d| d.reasoning.clone())
	}
}

fn api_keys(pairs: &[(String, String)]) -> Vec<ApiKey> {
	pairs
		.iter()
		.map(|(name, value)| ApiKey {
			name: name.clone(),
			value: value.clone(),
		})
		.collect()
}

/// Build the process context: construct connectors, probe their model
/// lists, validate configured failover routes and seed session defaults.
pub async fn build_context(cfg: Config) -> anyhow::Result<Arc<Context>> {
	let cfg = Arc::new(cfg);
	let client = build_http_client();
	let timeout = cfg.timeout;

	let mut connectors: HashMap<String, Arc<dyn Connector>> = HashMap::new();
	if !cfg.openrouter_keys.is_empty() {
		connectors.insert(
			"openrouter".to_string(),
			Arc::new(OpenRouterConnector::new(
				cfg
					.openrouter_base_url
					.clone()
					.unwrap_or_else(|| crate::backend::openrouter::DEFAULT_BASE_URL.to_string()),
				api_keys(&cfg.openrouter_keys),
				client.clone(),
				timeout,
			)),
		);
	}
	if !cfg.gemini_keys.is_empty() {
		connectors.insert(
			"gemini".to_string(),
			Arc::new(GeminiConnector::new(
				cfg
					.gemini_base_url
					.clone()
					.unwrap_or_else(|| crate::backend::gemini::DEFAULT_BASE_URL.to_string()),
				api_keys(&cfg.gemini_keys),
				client.clone(),
				timeout,
			)),
		);
	}
	if !cfg.openai_keys.is_empty() {
		connectors.insert(
			"openai".to_string(),
			Arc::new(OpenAiConnector::new(
				"openai",
				cfg
					.openai_base_url
					.clone()
					.unwrap_or_else(|| crate::backend::openai::DEFAULT_BASE_URL.to_string()),
				api_keys(&cfg.openai_keys),
				Default::default(),
				client.clone(),
				timeout,
			)),
		);
	}
	if let Some(credentials) = &cfg.gemini_oauth_credentials_path {
		let counter = Arc::new(DailyRequestCounter::new(
			cfg.gemini_oauth_state_path.clone(),
			cfg.gemini_oauth_daily_limit,
		));
		connectors.insert(
			"gemini-cli-oauth".to_string(),
			Arc::new(GeminiOauthConnector::new(
				cfg
					.gemini_base_url
					.clone()
					.unwrap_or_else(|| crate::backend::gemini::DEFAULT_BASE_URL.to_string()),
				credentials.clone(),
				counter,
				client.clone(),
				timeout,
			)),
		);
	}

	// Probe model lists concurrently; a backend that fails the probe simply
	// stays non-functional.
	let probes = connectors.values().cloned().collect::<Vec<_>>();
	futures::future::join_all(probes.iter().map(|connector| async move {
		if let Err(err) = connector.refresh_models().await {
			tracing::warn!(backend = %connector.name(), %err, "model list probe failed");
		}
	}))
	.await;

	for (name, connector) in &connectors {
		if connector.is_functional() {
			tracing::info!(
				backend = %name,
				keys = connector.keys().len(),
				models = connector.models().len(),
				"backend functional"
			);
		} else {
			tracing::warn!(backend = %name, "backend not functional");
		}
	}

	let functional: Vec<&str> = connectors
		.iter()
		.filter(|(_, c)| c.is_functional())
		.map(|(n, _)| n.as_str())
		.collect();

	// Route elements referencing unknown backends or unadvertised models
	// are dropped at load time, each with its own warning.
	let mut failover_routes = cfg.failover_routes.clone();
	for (name, route) in &mut failover_routes {
		route.elements.retain(|element| {
			let Some(model_ref) = ModelRef::parse(element, &functional) else {
				tracing::warn!(route = %name, element, "dropping route element: unknown backend");
				return false;
			};
			let has_model = connectors
				.get(&model_ref.backend)
				.map(|c| c.models().iter().any(|m| *m == model_ref.model))
				.unwrap_or(false);
			if !has_model {
				tracing::warn!(route = %name, element, "dropping route element: model not advertised");
			}
			has_model
		});
	}

	let auth_key = if cfg.disable_auth {
		None
	} else {
		match cfg.auth_key.clone() {
			Some(key) => Some(key),
			None => {
				let key = generate_auth_key();
				// Surface on stdout as well as the log: without it no client
				// can connect.
				println!("Generated client API key: {key}");
				tracing::info!(%key, "generated client API key");
				Some(key)
			},
		}
	};

	let defaults = SessionDefaults {
		backend_type: Some(cfg.default_backend.clone()),
		interactive_mode: cfg.interactive_mode,
		failover_routes: failover_routes.clone(),
		loop_config: Default::default(),
	};

	let registry = Arc::new(RateLimitRegistry::new());
	let redaction_keys: Vec<String> = cfg
		.openrouter_keys
		.iter()
		.chain(cfg.gemini_keys.iter())
		.chain(cfg.openai_keys.iter())
		.map(|(_, v)| v.clone())
		.chain(auth_key.clone())
		.collect();

	let matcher = CommandMatcher::new(&cfg.command_prefix)?;
	let context = Context {
		sessions: SessionStore::new(defaults),
		dispatcher: Dispatcher::new(connectors, registry.clone(), cfg.default_backend.clone()),
		registry,
		redactor: Redactor::new(redaction_keys, cfg.redact_api_keys_in_prompts),
		leak_filter: CommandLeakFilter::new(&cfg.command_prefix),
		accounting: Arc::new(LogAccounting),
		matcher,
		auth_key,
		cfg,
	};
	Ok(Arc::new(context))
}

/// Bind and serve until shutdown. Fails fast when the port is taken.
pub async fn run(cfg: Config) -> anyhow::Result<()> {
	let context = build_context(cfg).await?;
	let addr = format!("{}:{}", context.cfg.host, context.cfg.port);
	let listener = tokio::net::TcpListener::bind(&addr)
		.await
		.with_context(|| format!("binding {addr}"))?;
	tracing::info!(%addr, "listening");

	// Periodic session expiry, independent of request traffic.
	let cleanup_ctx = context.clone();
	tokio::spawn(async move {
		let mut interval = tokio::time::interval(Duration::from_secs(300));
		interval.tick().await;
		loop {
			interval.tick().await;
			cleanup_ctx.sessions.cleanup_expired(cleanup_ctx.cfg.session_max_age);
		}
	});

	let router = crate::server::router(context);
	axum::serve(listener, router)
		.with_graceful_shutdown(async {
			let _ = tokio::signal::ctrl_c().await;
			tracing::info!("shutdown signal received");
		})
		.await
		.context("serving")?;
	Ok(())
}
