use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::Value;

/// Tracks when a (backend, model, key) combination may be retried after an
/// upstream 429. Entries expire on read.
#[derive(Default)]
pub struct RateLimitRegistry {
	until: Mutex<HashMap<(String, String, String), Instant>>,
}

impl RateLimitRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn set(&self, backend: &str, model: &str, key_name: &str, delay: Duration) {
		self.set_at(backend, model, key_name, delay, Instant::now())
	}

	pub fn get(&self, backend: &str, model: &str, key_name: &str) -> Option<Instant> {
		self.get_at(backend, model, key_name, Instant::now())
	}

	/// Earliest moment any currently blocked combination frees up.
	pub fn next_available(&self) -> Option<Instant> {
		let now = Instant::now();
		let mut until = self.until.lock();
		until.retain(|_, t| *t > now);
		until.values().min().copied()
	}

	pub fn earliest(&self) -> Option<Instant> {
		self.next_available()
	}

	fn set_at(&self, backend: &str, model: &str, key_name: &str, delay: Duration, now: Instant) {
		self.until.lock().insert(
			(backend.to_string(), model.to_string(), key_name.to_string()),
			now + delay,
		);
	}

	fn get_at(&self, backend: &str, model: &str, key_name: &str, now: Instant) -> Option<Instant> {
		let key = (backend.to_string(), model.to_string(), key_name.to_string());
		let mut until = self.until.lock();
		match until.get(&key) {
			Some(t) if *t > now => Some(*t),
			Some(_) => {
				until.remove(&key);
				None
			},
			None => None,
		}
	}
}

/// Extract the retry delay from a backend 429 payload. Walks
/// `error.details[*]` for an entry whose `@type` ends in `RetryInfo` and
/// reads its `retryDelay` of the form `"<float>s"`.
pub fn parse_retry_delay(detail: &Value) -> Option<f64> {
	let root = if let Some(s) = detail.as_str() {
		serde_json::from_str::<Value>(s).ok()?
	} else {
		detail.clone()
	};
	let err = root.get("error").unwrap_or(&root);
	let details = err.get("details")?.as_array()?;
	for item in details {
		let type_tag = item.get("@type").and_then(Value::as_str).unwrap_or("");
		if !type_tag.ends_with("RetryInfo") {
			continue;
		}
		if let Some(delay) = item.get("retryDelay").and_then(Value::as_str) {
			if let Some(seconds) = delay.strip_suffix('s') {
				if let Ok(parsed) = seconds.parse::<f64>() {
					return Some(parsed);
				}
			}
		}
	}
	None
}

/// Same, for payloads that arrive as raw body text.
pub fn parse_retry_delay_text(body: &str) -> Option<f64> {
	let value = serde_json::from_str::<Value>(body).ok()?;
	parse_retry_delay(&value)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn entry_expires_and_is_deleted() {
		let registry = RateLimitRegistry::new();
		let t0 = Instant::now();
		registry.set_at("openrouter", "m", "KEY_1", Duration::from_secs(1), t0);
		assert!(
			registry
				.get_at("openrouter", "m", "KEY_1", t0 + Duration::from_millis(500))
				.is_some()
		);
		assert!(
			registry
				.get_at("openrouter", "m", "KEY_1", t0 + Duration::from_millis(1100))
				.is_none()
		);
		// Deleted on the expired read, not merely hidden.
		assert!(registry.until.lock().is_empty());
	}

	#[test]
	fn next_available_returns_minimum() {
		let registry = RateLimitRegistry::new();
		registry.set("b", "m1", "k1", Duration::from_secs(30));
		registry.set("b", "m2", "k2", Duration::from_secs(10));
		let next = registry.next_available().unwrap();
		assert!(next <= Instant::now() + Duration::from_secs(10));
	}

	#[test]
	fn retry_delay_from_google_error_payload() {
		let payload = serde_json::json!({
			"error": {
				"code": 429,
				"message": "Resource has been exhausted",
				"details": [
					{"@type": "type.googleapis.com/google.rpc.ErrorInfo", "reason": "RATE_LIMIT_EXCEEDED"},
					{"@type": "type.googleapis.com/google.rpc.RetryInfo", "retryDelay": "14.5s"},
				],
			}
		});
		assert_eq!(parse_retry_delay(&payload), Some(14.5));
	}

	#[test]
	fn retry_delay_from_string_detail() {
		let inner = r#"{"error":{"details":[{"@type":"x.RetryInfo","retryDelay":"3s"}]}}"#;
		assert_eq!(parse_retry_delay(&Value::String(inner.to_string())), Some(3.0));
	}

	#[test]
	fn retry_delay_absent_or_malformed() {
		assert_eq!(parse_retry_delay(&serde_json::json!({"error": {}})), None);
		let bad = serde_json::json!({
			"error": {"details": [{"@type": "x.RetryInfo", "retryDelay": "soon"}]}
		});
		assert_eq!(parse_retry_delay(&bad), None);
	}
}
