use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;
use regex::Regex;

use crate::llm::{ChatRequest, Content, Part, Usage};

pub const REDACTED: &str = "(API_KEY_HAS_BEEN_REDACTED)";

/// Texts shorter than this are worth caching; longer ones are redacted
/// directly.
const CACHE_TEXT_LIMIT: usize = 1024;
const CACHE_CAPACITY: usize = 1024;

struct BoundedLru {
	map: HashMap<String, String>,
	order: VecDeque<String>,
}

impl BoundedLru {
	fn new() -> Self {
		BoundedLru {
			map: HashMap::new(),
			order: VecDeque::new(),
		}
	}

	fn get(&mut self, key: &str) -> Option<String> {
		let value = self.map.get(key).cloned()?;
		self.order.retain(|k| k != key);
		self.order.push_back(key.to_string());
		Some(value)
	}

	fn put(&mut self, key: String, value: String) {
		if self.map.insert(key.clone(), value).is_none() {
			self.order.push_back(key);
		}
		while self.map.len() > CACHE_CAPACITY {
			let Some(oldest) = self.order.pop_front() else {
				break;
			};
			self.map.remove(&oldest);
		}
	}
}

/// Request-side middleware replacing any known proxy API key inside message
/// text before it can reach an upstream model.
pub struct Redactor {
	pattern: Option<Regex>,
	enabled_by_default: bool,
	cache: Mutex<BoundedLru>,
}

impl Redactor {
	pub fn new(keys: impl IntoIterator<Item = String>, enabled_by_default: bool) -> Self {
		let escaped: Vec<String> = keys
			.into_iter()
			.filter(|k| !k.is_empty())
			.map(|k| regex::escape(&k))
			.collect();
		let pattern = if escaped.is_empty() {
			None
		} else {
			Some(Regex::new(&escaped.join("|")).expect("redaction pattern"))
		};
		Redactor {
			pattern,
			enabled_by_default,
			cache: Mutex::new(BoundedLru::new()),
		}
	}

	pub fn enabled(&self, session_override: Option<bool>) -> bool {
		session_override.unwrap_or(self.enabled_by_default)
	}

	pub fn redact_text(&self, text: &str) -> String {
		let Some(pattern) = &self.pattern else {
			return text.to_string();
		};
		if !pattern.is_match(text) {
			return text.to_string();
		}
		if text.len() < CACHE_TEXT_LIMIT {
			if let Some(hit) = self.cache.lock().get(text) {
				return hit;
			}
		}
		let redacted = pattern.replace_all(text, REDACTED).into_owned();
		if text.len() < CACHE_TEXT_LIMIT {
			self.cache.lock().put(text.to_string(), redacted.clone());
		}
		redacted
	}

	pub fn apply(&self, req: &mut ChatRequest, session_override: Option<bool>) {
		if !self.enabled(session_override) {
			return;
		}
		for msg in &mut req.messages {
			match &mut msg.content {
				Content::Text(text) => *text = self.redact_text(text),
				Content::Parts(parts) => {
					for part in parts {
						if let Part::Text(text) = part {
							*text = self.redact_text(text);
						}
					}
				},
			}
		}
	}
}

/// Response-side (upstream-bound) filter: no command token with the active
/// prefix is ever forwarded to an upstream LLM.
pub struct CommandLeakFilter {
	pattern: Regex,
}

impl CommandLeakFilter {
	pub fn new(prefix: &str) -> Self {
		let pattern = Regex::new(&format!(
			r"(?i){}([\w-]+(\(.*?\))?|hello|help)",
			regex::escape(prefix)
		))
		.expect("command leak pattern");
		CommandLeakFilter { pattern }
	}

	pub fn scrub_text(&self, text: &str) -> String {
		if !self.pattern.is_match(text) {
			return text.to_string();
		}
		tracing::warn!("removed command token before forwarding upstream");
		self.pattern.replace_all(text, "").into_owned()
	}

	pub fn apply(&self, req: &mut ChatRequest) {
		for msg in &mut req.messages {
			match &mut msg.content {
				Content::Text(text) => *text = self.scrub_text(text),
				Content::Parts(parts) => {
					for part in parts {
						if let Part::Text(text) = part {
							*text = self.scrub_text(text);
						}
					}
				},
			}
		}
	}
}

#[derive(Debug, Clone)]
pub struct AccountingEntry {
	pub session_id: String,
	pub backend: String,
	pub model: String,
	pub usage: Usage,
}

/// Completion accounting; implementations must not block the response path.
pub trait AccountingSink: Send + Sync {
	fn record(&self, entry: AccountingEntry);
}

/// Default sink: structured log line per completion.
pub struct LogAccounting;

impl AccountingSink for LogAccounting {
	fn record(&self, entry: AccountingEntry) {
		tracing::info!(
			session_id = %entry.session_id,
			backend = %entry.backend,
			model = %entry.model,
			prompt_tokens = entry.usage.prompt_tokens,
			completion_tokens = entry.usage.completion_tokens,
			total_tokens = entry.usage.total_tokens,
			"completion accounted"
		);
	}
}
