use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

use crate::commands::parser::validate_command_prefix;
use crate::session::{FailoverRoute, ReasoningEffort};

pub const DEFAULT_PORT: u16 = 8000;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);
pub const DEFAULT_COMMAND_PREFIX: &str = "!/";

#[derive(Debug, Clone)]
pub struct Config {
	pub host: String,
	pub port: u16,
	pub timeout: Duration,
	pub default_backend: String,
	pub interactive_mode: bool,
	pub command_prefix: String,
	pub redact_api_keys_in_prompts: bool,
	pub disable_auth: bool,
	/// Client-facing key; generated at startup when auth is on and nothing
	/// was configured.
	pub auth_key: Option<String>,
	pub disable_interactive_commands: bool,
	pub force_set_project: bool,
	pub force_context_window: Option<u64>,
	pub thinking_budget: Option<i64>,
	pub openrouter_keys: Vec<(String, String)>,
	pub openrouter_base_url: Option<String>,
	pub gemini_keys: Vec<(String, String)>,
	pub gemini_base_url: Option<String>,
	pub openai_keys: Vec<(String, String)>,
	pub openai_base_url: Option<String>,
	pub gemini_oauth_credentials_path: Option<PathBuf>,
	pub gemini_oauth_daily_limit: u64,
	pub gemini_oauth_state_path: PathBuf,
	pub model_defaults: HashMap<String, ModelDefaults>,
	pub failover_routes: BTreeMap<String, FailoverRoute>,
	pub session_max_age: Duration,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModelDefaults {
	#[serde(default)]
	pub reasoning: Option<ReasoningDefaults>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReasoningDefaults {
	#[serde(default)]
	pub temperature: Option<f64>,
	#[serde(default)]
	pub reasoning_effort: Option<ReasoningEffort>,
	#[serde(default)]
	pub thinking_budget: Option<i64>,
}

/// Shape of the JSON config file. Unknown keys are collected and warned
/// about rather than rejected.
#[derive(Debug, Default, Deserialize)]
struct RawConfig {
	default_backend: Option<String>,
	interactive_mode: Option<bool>,
	redact_api_keys_in_prompts: Option<bool>,
	command_prefix: Option<String>,
	#[serde(default)]
	model_defaults: HashMap<String, ModelDefaults>,
	#[serde(default)]
	failover_routes: BTreeMap<String, RawRoute>,
	#[serde(flatten)]
	unknown: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct RawRoute {
	policy: String,
	#[serde(default)]
	elements: Vec<String>,
}

pub fn load(file: Option<PathBuf>) -> anyhow::Result<Config> {
	let raw = match &file {
		Some(path) => {
			let contents = std::fs::read_to_string(path)
				.with_context(|| format!("reading config file {}", path.display()))?;
			let raw: RawConfig = serde_json::from_str(&contents)
				.with_context(|| format!("parsing config file {}", path.display()))?;
			for key in raw.unknown.keys() {
				tracing::warn!(key, "ignoring unknown config key");
			}
			raw
		},
		None => RawConfig::default(),
	};

	let default_backend = parse::<String>("LLM_BACKEND")?
		.or(raw.default_backend)
		.unwrap_or_else(|| "openrouter".to_string());

	let interactive_mode = match parse::<bool>("DISABLE_INTERACTIVE_MODE")? {
		Some(true) => false,
		_ => raw.interactive_mode.unwrap_or(true),
	};

	let command_prefix = parse::<String>("COMMAND_PREFIX")?
		.or(raw.command_prefix)
		.unwrap_or_else(|| DEFAULT_COMMAND_PREFIX.to_string());
	if let Some(reason) = validate_command_prefix(&command_prefix) {
		anyhow::bail!("invalid command prefix {command_prefix:?}: {reason}");
	}

	let failover_routes = raw
		.failover_routes
		.into_iter()
		.filter_map(|(name, route)| {
			let Some(policy) = crate::session::RoutePolicy::parse(&route.policy) else {
				tracing::warn!(route = %name, policy = %route.policy, "dropping route with unknown policy");
				return None;
			};
			Some((
				name,
				FailoverRoute {
					policy,
					elements: route.elements,
				},
			))
		})
		.collect();

	Ok(Config {
		host: parse::<String>("PROXY_HOST")?.unwrap_or_else(|| "127.0.0.1".to_string()),
		port: parse::<u16>("PROXY_PORT")?.unwrap_or(DEFAULT_PORT),
		timeout: parse::<u64>("PROXY_TIMEOUT")?
			.map(Duration::from_secs)
			.unwrap_or(DEFAULT_TIMEOUT),
		default_backend,
		interactive_mode,
		command_prefix,
		redact_api_keys_in_prompts: parse::<bool>("REDACT_API_KEYS_IN_PROMPTS")?
			.or(raw.redact_api_keys_in_prompts)
			.unwrap_or(true),
		disable_auth: parse::<bool>("DISABLE_AUTH")?.unwrap_or(false),
		auth_key: empty_to_none(parse::<String>("PROXY_API_KEY")?),
		disable_interactive_commands: parse::<bool>("DISABLE_INTERACTIVE_COMMANDS")?.unwrap_or(false),
		force_set_project: parse::<bool>("FORCE_SET_PROJECT")?.unwrap_or(false),
		force_context_window: parse::<u64>("FORCE_CONTEXT_WINDOW")?,
		thinking_budget: parse::<i64>("THINKING_BUDGET")?,
		openrouter_keys: collect_keys("OPENROUTER_API_KEY"),
		openrouter_base_url: empty_to_none(parse::<String>("OPENROUTER_API_BASE_URL")?),
		gemini_keys: collect_keys("GEMINI_API_KEY"),
		gemini_base_url: empty_to_none(parse::<String>("GEMINI_API_BASE_URL")?),
		openai_keys: collect_keys("OPENAI_API_KEY"),
		openai_base_url: empty_to_none(parse::<String>("OPENAI_API_BASE_URL")?),
		gemini_oauth_credentials_path: empty_to_none(parse::<String>("GEMINI_OAUTH_CREDENTIALS")?)
			.map(PathBuf::from),
		gemini_oauth_daily_limit: parse::<u64>("GEMINI_OAUTH_DAILY_LIMIT")?.unwrap_or(1000),
		gemini_oauth_state_path: parse::<String>("GEMINI_OAUTH_STATE_PATH")?
			.map(PathBuf::from)
			.unwrap_or_else(|| PathBuf::from(".llmgateway/gemini_oauth_counter.json")),
		model_defaults: raw.model_defaults,
		failover_routes,
		session_max_age: parse::<u64>("SESSION_MAX_AGE")?
			.map(Duration::from_secs)
			.unwrap_or(Duration::from_secs(24 * 3600)),
	})
}

fn parse<T: FromStr>(env: &str) -> anyhow::Result<Option<T>>
where
	<T as FromStr>::Err: ToString,
{
	match std::env::var(env) {
		Ok(val) => val
			.parse()
			.map(Some)
			.map_err(|e: <T as FromStr>::Err| {
				anyhow::anyhow!("invalid env var {}={} ({})", env, val, e.to_string())
			}),
		Err(_) => Ok(None),
	}
}

pub fn empty_to_none(inp: Option<String>) -> Option<String> {
	inp.filter(|s| !s.is_empty())
}

/// Collect an API key family: when any numbered variant (`BASE_1`..) exists
/// the numbered set wins and the unnumbered variable is ignored; otherwise
/// the unnumbered one is used alone. Key names keep the variable name so
/// rate-limit bookkeeping can tell them apart.
fn collect_keys(base: &str) -> Vec<(String, String)> {
	let mut numbered = Vec::new();
	for i in 1..=20 {
		let name = format!("{base}_{i}");
		if let Ok(value) = std::env::var(&name) {
			if !value.is_empty() {
				numbered.push((name, value));
			}
		}
	}
	if !numbered.is_empty() {
		return numbered;
	}
	match std::env::var(base) {
		Ok(value) if !value.is_empty() => vec![(base.to_string(), value)],
		_ => Vec::new(),
	}
}

/// Generate a client API key when auth is enabled with none configured.
pub fn generate_auth_key() -> String {
	use rand::Rng;
	let suffix: String = rand::rng()
		.sample_iter(rand::distr::Alphanumeric)
		.take(32)
		.map(char::from)
		.collect();
	format!("lgw-{suffix}")
}

#[cfg(test)]
mod tests {
	use super::*;

	// Env-var tests mutate process state; keep them in one test to avoid
	// interleaving.
	#[test]
	fn numbered_keys_shadow_unnumbered() {
		unsafe {
			std::env::set_var("TESTFAM_API_KEY", "plain");
			std::env::set_var("TESTFAM_API_KEY_1", "one");
			std::env::set_var("TESTFAM_API_KEY_3", "three");
		}
		let keys = collect_keys("TESTFAM_API_KEY");
		assert_eq!(
			keys,
			vec![
				("TESTFAM_API_KEY_1".to_string(), "one".to_string()),
				("TESTFAM_API_KEY_3".to_string(), "three".to_string()),
			]
		);
		unsafe {
			std::env::remove_var("TESTFAM_API_KEY_1");
			std::env::remove_var("TESTFAM_API_KEY_3");
		}
		let keys = collect_keys("TESTFAM_API_KEY");
		assert_eq!(keys, vec![("TESTFAM_API_KEY".to_string(), "plain".to_string())]);
		unsafe {
			std::env::remove_var("TESTFAM_API_KEY");
		}
	}

	#[test]
	fn config_file_routes_and_unknown_keys() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("config.json");
		std::fs::write(
			&path,
			serde_json::json!({
				"default_backend": "gemini",
				"interactive_mode": false,
				"command_prefix": "##",
				"failover_routes": {
					"fast": {"policy": "k", "elements": ["gemini:gemini-2.5-flash"]},
					"bad": {"policy": "zz", "elements": []},
				},
				"model_defaults": {
					"gemini:gemini-2.5-pro": {"reasoning": {"temperature": 0.4}},
				},
				"some_future_knob": true,
			})
			.to_string(),
		)
		.unwrap();
		let config = load(Some(path)).unwrap();
		assert_eq!(config.default_backend, "gemini");
		assert!(!config.interactive_mode);
		assert_eq!(config.command_prefix, "##");
		assert!(config.failover_routes.contains_key("fast"));
		// Routes with an unknown policy are dropped at load.
		assert!(!config.failover_routes.contains_key("bad"));
		let defaults = config.model_defaults.get("gemini:gemini-2.5-pro").unwrap();
		assert_eq!(defaults.reasoning.as_ref().unwrap().temperature, Some(0.4));
	}

	#[test]
	fn generated_auth_key_shape() {
		let key = generate_auth_key();
		assert!(key.starts_with("lgw-"));
		assert_eq!(key.len(), 36);
	}
}
