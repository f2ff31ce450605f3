use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::llm::Usage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoutePolicy {
	K,
	M,
	KM,
	MK,
}

impl RoutePolicy {
	pub fn parse(s: &str) -> Option<RoutePolicy> {
		match s.to_ascii_lowercase().as_str() {
			"k" => Some(RoutePolicy::K),
			"m" => Some(RoutePolicy::M),
			"km" => Some(RoutePolicy::KM),
			"mk" => Some(RoutePolicy::MK),
			_ => None,
		}
	}

	pub fn as_str(&self) -> &'static str {
		match self {
			RoutePolicy::K => "k",
			RoutePolicy::M => "m",
			RoutePolicy::KM => "km",
			RoutePolicy::MK => "mk",
		}
	}
}

/// Named ordered failover route. Elements are `<backend>:<model>` strings
/// validated against functional backends when appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailoverRoute {
	pub policy: RoutePolicy,
	pub elements: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendConfig {
	pub backend_type: Option<String>,
	pub model: Option<String>,
	pub api_url: Option<String>,
	pub openai_url: Option<String>,
	pub oneoff_backend: Option<String>,
	pub oneoff_model: Option<String>,
	pub invalid_override: bool,
	pub failover_routes: BTreeMap<String, FailoverRoute>,
	pub interactive_mode: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReasoningEffort {
	Low,
	Medium,
	High,
}

impl ReasoningEffort {
	pub fn parse(s: &str) -> Option<ReasoningEffort> {
		match s.to_ascii_lowercase().as_str() {
			"low" => Some(ReasoningEffort::Low),
			"medium" => Some(ReasoningEffort::Medium),
			"high" => Some(ReasoningEffort::High),
			_ => None,
		}
	}

	pub fn as_str(&self) -> &'static str {
		match self {
			ReasoningEffort::Low => "low",
			ReasoningEffort::Medium => "medium",
			ReasoningEffort::High => "high",
		}
	}
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReasoningConfig {
	pub temperature: Option<f64>,
	pub reasoning_effort: Option<ReasoningEffort>,
	pub thinking_budget: Option<i64>,
	pub provider_blob: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolLoopMode {
	Break,
	ChanceThenBreak,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopDetectionConfig {
	pub enabled: bool,
	pub buffer_size: usize,
	pub min_pattern_length: usize,
	pub max_pattern_length: usize,
	pub min_repetitions: usize,
	pub tool_loop_enabled: bool,
	pub tool_loop_max_repeats: usize,
	pub tool_loop_ttl_seconds: u64,
	pub tool_loop_mode: ToolLoopMode,
}

impl Default for LoopDetectionConfig {
	fn default() -> Self {
		LoopDetectionConfig {
			enabled: true,
			buffer_size: 16 * 1024,
			min_pattern_length: 8,
			max_pattern_length: 64,
			min_repetitions: 3,
			tool_loop_enabled: true,
			tool_loop_max_repeats: 4,
			tool_loop_ttl_seconds: 120,
			tool_loop_mode: ToolLoopMode::Break,
		}
	}
}

/// Immutable per-session configuration. Never mutated in place: every
/// transition builds a new snapshot and publishes it through the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
	pub backend_config: BackendConfig,
	pub reasoning_config: ReasoningConfig,
	pub loop_config: LoopDetectionConfig,
	pub project: Option<String>,
	pub project_dir: Option<String>,
	pub agent: Option<String>,
	pub hello_requested: bool,
	pub interactive_just_enabled: bool,
	pub is_cline_agent: bool,
	pub api_key_redaction_override: Option<bool>,
	pub banner_shown: bool,
}

impl SessionSnapshot {
	pub fn interactive(&self) -> bool {
		self.backend_config.interactive_mode
	}
}

/// One user prompt and what became of it, kept as bounded session history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInteraction {
	pub prompt: String,
	/// "proxy" when answered locally (commands), "backend" otherwise.
	pub handler: &'static str,
	pub backend: Option<String>,
	pub model: Option<String>,
	pub usage: Option<Usage>,
}

const HISTORY_CAP: usize = 64;

pub struct Session {
	pub id: String,
	snapshot: ArcSwap<SessionSnapshot>,
	write_lock: tokio::sync::Mutex<()>,
	last_active: RwLock<DateTime<Utc>>,
	user_id: RwLock<Option<String>>,
	history: RwLock<Vec<SessionInteraction>>,
}

impl Session {
	pub fn snapshot(&self) -> Arc<SessionSnapshot> {
		self.snapshot.load_full()
	}

	pub fn last_active(&self) -> DateTime<Utc> {
		*self.last_active.read()
	}

	pub fn user_id(&self) -> Option<String> {
		self.user_id.read().clone()
	}

	pub fn record_interaction(&self, interaction: SessionInteraction) {
		let mut history = self.history.write();
		if history.len() >= HISTORY_CAP {
			history.remove(0);
		}
		history.push(interaction);
	}

	pub fn history(&self) -> Vec<SessionInteraction> {
		self.history.read().clone()
	}
}

/// Process-wide defaults a fresh session starts from.
#[derive(Debug, Clone)]
pub struct SessionDefaults {
	pub backend_type: Option<String>,
	pub interactive_mode: bool,
	pub failover_routes: BTreeMap<String, FailoverRoute>,
	pub loop_config: LoopDetectionConfig,
}

impl Default for SessionDefaults {
	fn default() -> Self {
		SessionDefaults {
			backend_type: None,
			interactive_mode: true,
			failover_routes: BTreeMap::new(),
			loop_config: LoopDetectionConfig::default(),
		}
	}
}

impl SessionDefaults {
	pub fn fresh_snapshot(&self) -> SessionSnapshot {
		SessionSnapshot {
			backend_config: BackendConfig {
				backend_type: self.backend_type.clone(),
				model: None,
				api_url: None,
				openai_url: None,
				oneoff_backend: None,
				oneoff_model: None,
				invalid_override: false,
				failover_routes: self.failover_routes.clone(),
				interactive_mode: self.interactive_mode,
			},
			reasoning_config: ReasoningConfig::default(),
			loop_config: self.loop_config.clone(),
			project: None,
			project_dir: None,
			agent: None,
			hello_requested: false,
			interactive_just_enabled: false,
			is_cline_agent: false,
			api_key_redaction_override: None,
			banner_shown: false,
		}
	}
}

/// Optional persistence hook. The in-memory store is canonical; a backing
/// implementation only observes published snapshots.
pub trait SessionPersistence: Send + Sync {
	fn persist(&self, session_id: &str, snapshot: &SessionSnapshot);
	fn remove(&self, session_id: &str);
}

/// Keyed map of sessions. Reads are lock-free on the snapshot; writes to one
/// session are serialized by a per-session lock while different sessions
/// update in parallel.
pub struct SessionStore {
	sessions: RwLock<HashMap<String, Arc<Session>>>,
	by_user: RwLock<HashMap<String, HashSet<String>>>,
	defaults: SessionDefaults,
	persistence: Option<Arc<dyn SessionPersistence>>,
}

impl SessionStore {
	pub fn new(defaults: SessionDefaults) -> Self {
		SessionStore {
			sessions: RwLock::new(HashMap::new()),
			by_user: RwLock::new(HashMap::new()),
			defaults,
			persistence: None,
		}
	}

	pub fn with_persistence(mut self, persistence: Arc<dyn SessionPersistence>) -> Self {
		self.persistence = Some(persistence);
		self
	}

	pub fn get_or_create(&self, session_id: &str) -> Arc<Session> {
		if let Some(session) = self.sessions.read().get(session_id) {
			*session.last_active.write() = Utc::now();
			return session.clone();
		}
		let mut sessions = self.sessions.write();
		let session = sessions
			.entry(session_id.to_string())
			.or_insert_with(|| {
				tracing::info!(session_id, "created new session");
				Arc::new(Session {
					id: session_id.to_string(),
					snapshot: ArcSwap::from_pointee(self.defaults.fresh_snapshot()),
					write_lock: tokio::sync::Mutex::new(()),
					last_active: RwLock::new(Utc::now()),
					user_id: RwLock::new(None),
					history: RwLock::new(Vec::new()),
				})
			})
			.clone();
		*session.last_active.write() = Utc::now();
		session
	}

	pub fn get(&self, session_id: &str) -> Option<Arc<Session>> {
		self.sessions.read().get(session_id).cloned()
	}

	/// Apply a transition to the session's snapshot and publish the result.
	/// Concurrent updates to the same session serialize on its write lock;
	/// the transition always reads the latest published snapshot.
	pub async fn update<F>(&self, session_id: &str, transition: F) -> Arc<SessionSnapshot>
	where
		F: FnOnce(SessionSnapshot) -> SessionSnapshot,
	{
		let session = self.get_or_create(session_id);
		let _guard = session.write_lock.lock().await;
		let current = session.snapshot.load_full();
		let next = Arc::new(transition((*current).clone()));
		session.snapshot.store(next.clone());
		*session.last_active.write() = Utc::now();
		if let Some(persistence) = &self.persistence {
			persistence.persist(session_id, &next);
		}
		next
	}

	/// Publish an already-built snapshot, serialized like `update`.
	pub async fn publish(&self, session_id: &str, snapshot: SessionSnapshot) -> Arc<SessionSnapshot> {
		self.update(session_id, move |_| snapshot).await
	}

	pub fn delete(&self, session_id: &str) {
		let removed = self.sessions.write().remove(session_id);
		if let Some(session) = removed {
			if let Some(user) = session.user_id.read().as_ref() {
				if let Some(ids) = self.by_user.write().get_mut(user) {
					ids.remove(session_id);
				}
			}
			if let Some(persistence) = &self.persistence {
				persistence.remove(session_id);
			}
		}
	}

	/// Associate the session with a user id (or clear it). Reassignment
	/// moves the session between user-index buckets.
	pub fn set_user(&self, session_id: &str, user_id: Option<String>) {
		let session = self.get_or_create(session_id);
		let mut index = self.by_user.write();
		let mut current = session.user_id.write();
		if let Some(previous) = current.as_ref() {
			if let Some(ids) = index.get_mut(previous) {
				ids.remove(session_id);
				if ids.is_empty() {
					index.remove(previous);
				}
			}
		}
		if let Some(user) = &user_id {
			index
				.entry(user.clone())
				.or_default()
				.insert(session_id.to_string());
		}
		*current = user_id;
	}

	pub fn get_by_user(&self, user_id: &str) -> Vec<Arc<Session>> {
		let index = self.by_user.read();
		let sessions = self.sessions.read();
		index
			.get(user_id)
			.map(|ids| ids.iter().filter_map(|id| sessions.get(id).cloned()).collect())
			.unwrap_or_default()
	}

	/// Drop sessions idle longer than `max_age`. Holds only the map lock, so
	/// it cannot deadlock with in-flight updates (which keep their own Arc).
	pub fn cleanup_expired(&self, max_age: Duration) -> usize {
		let cutoff = Utc::now()
			- chrono::Duration::from_std(max_age).unwrap_or_else(|_| chrono::Duration::seconds(0));
		let expired: Vec<String> = {
			let sessions = self.sessions.read();
			sessions
				.iter()
				.filter(|(_, s)| *s.last_active.read() < cutoff)
				.map(|(id, _)| id.clone())
				.collect()
		};
		let count = expired.len();
		for id in expired {
			self.delete(&id);
		}
		if count > 0 {
			tracing::info!(count, "expired sessions removed");
		}
		count
	}

	pub fn len(&self) -> usize {
		self.sessions.read().len()
	}

	pub fn is_empty(&self) -> bool {
		self.sessions.read().is_empty()
	}
}
