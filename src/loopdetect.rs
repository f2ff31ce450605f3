use std::collections::VecDeque;
use std::time::{Duration, Instant};

use serde_json::Value;

use crate::session::{LoopDetectionConfig, ToolLoopMode};

pub const TRUNCATION_MARKER: &str = "<truncated: loop detected>";

const HASH_BASE: u64 = 1_000_003;

/// Outcome of feeding one chunk through the detector.
#[derive(Debug, PartialEq, Eq)]
pub enum Feed {
	/// Forward this text downstream and keep consuming upstream.
	Continue(String),
	/// Loop found: forward this final text (truncated content plus marker)
	/// and stop consuming upstream.
	Fired(String),
}

struct LengthState {
	len: usize,
	/// base^len, for removing the outgoing character.
	pow: u64,
	hash: u64,
	/// Ring of `(epoch, window start, hash)` for the last `len + 1` window
	/// positions, slotted by `start % (len + 1)`. A contiguous repetition
	/// can only match the window exactly `len` earlier, so older entries
	/// are simply overwritten in place and the ring never grows.
	ring: Vec<(u64, usize, u64)>,
	chain_start: usize,
	chain_count: usize,
}

/// Sentinel start position for ring slots that have never been written.
const EMPTY_SLOT: usize = usize::MAX;

/// Online repeated-substring detector over streamed text.
///
/// One rolling hash per configured pattern length slides across a capped
/// character buffer; a repetition is counted only when a window equals the
/// immediately preceding window of the same length. Each length keeps a
/// fixed-size ring of recent window hashes whose slots are overwritten as
/// the stream advances, so memory stays within the
/// `buffer_size x pattern-length-count` bound however long the stream runs;
/// reset is O(1) via an epoch tag that invalidates every ring entry.
pub struct LoopDetector {
	enabled: bool,
	buffer_size: usize,
	min_repetitions: usize,
	buffer: VecDeque<char>,
	/// Absolute index of `buffer[0]`.
	start_offset: usize,
	total_len: usize,
	lengths: Vec<LengthState>,
	epoch: u64,
	fired: bool,
}

impl LoopDetector {
	pub fn new(config: &LoopDetectionConfig) -> Self {
		let min = config.min_pattern_length.max(2);
		let max = config.max_pattern_length.max(min);
		// The outgoing character of the longest window must still be buffered.
		let buffer_size = config.buffer_size.max(max * 2);
		let lengths = (min..=max)
			.map(|len| LengthState {
				len,
				pow: HASH_BASE.wrapping_pow(len as u32),
				hash: 0,
				ring: vec![(0, EMPTY_SLOT, 0); len + 1],
				chain_start: usize::MAX,
				chain_count: 0,
			})
			.collect();
		LoopDetector {
			enabled: config.enabled,
			buffer_size,
			min_repetitions: config.min_repetitions.max(2),
			buffer: VecDeque::with_capacity(buffer_size.min(64 * 1024)),
			start_offset: 0,
			total_len: 0,
			lengths,
			epoch: 0,
			fired: false,
		}
	}

	/// Restart detection for a fresh stream without dropping allocations.
	pub fn reset(&mut self) {
		self.epoch += 1;
		self.buffer.clear();
		self.start_offset = 0;
		self.total_len = 0;
		self.fired = false;
		for state in &mut self.lengths {
			state.hash = 0;
			state.chain_start = usize::MAX;
			state.chain_count = 0;
		}
	}

	pub fn fired(&self) -> bool {
		self.fired
	}

	pub fn feed(&mut self, chunk: &str) -> Feed {
		if !self.enabled || self.fired {
			return Feed::Continue(chunk.to_string());
		}
		let chunk_start = self.total_len;
		for c in chunk.chars() {
			if let Some(fire_end) = self.push_char(c) {
				self.fired = true;
				let keep = fire_end - chunk_start;
				let mut out: String = chunk.chars().take(keep).collect();
				out.push_str(TRUNCATION_MARKER);
				return Feed::Fired(out);
			}
		}
		Feed::Continue(chunk.to_string())
	}

	/// Append one character; returns the absolute end position of the
	/// repeated pattern when the repetition threshold is hit.
	fn push_char(&mut self, c: char) -> Option<usize> {
		self.buffer.push_back(c);
		self.total_len += 1;
		if self.buffer.len() > self.buffer_size {
			self.buffer.pop_front();
			self.start_offset += 1;
		}
		let total = self.total_len;
		let epoch = self.epoch;
		let min_repetitions = self.min_repetitions;
		let mut fire_at = None;
		for state in &mut self.lengths {
			state.hash = state.hash.wrapping_mul(HASH_BASE).wrapping_add(c as u64);
			if total < state.len {
				continue;
			}
			if total > state.len {
				let out_pos = total - state.len - 1;
				let Some(out_char) = Self::char_at(&self.buffer, self.start_offset, out_pos) else {
					continue;
				};
				state.hash = state
					.hash
					.wrapping_sub(state.pow.wrapping_mul(out_char as u64));
			}
			let window_start = total - state.len;
			let ring_len = state.ring.len();
			// The only position that can continue a contiguous repetition is
			// the window exactly one pattern length back.
			let matched = window_start >= state.len && {
				let prev_start = window_start - state.len;
				let (prev_epoch, start, hash) = state.ring[prev_start % ring_len];
				prev_epoch == epoch && start == prev_start && hash == state.hash
			};
			state.ring[window_start % ring_len] = (epoch, window_start, state.hash);
			if !matched {
				continue;
			}
			let prev_start = window_start - state.len;
			if !Self::windows_equal(
				&self.buffer,
				self.start_offset,
				prev_start,
				window_start,
				state.len,
			) {
				continue;
			}
			// Immediate contiguous repetition.
			if state.chain_start != usize::MAX && state.chain_start + state.len == window_start {
				state.chain_count += 1;
			} else {
				state.chain_count = 2;
			}
			state.chain_start = window_start;
			if state.chain_count >= min_repetitions && fire_at.is_none() {
				fire_at = Some(window_start + state.len);
			}
		}
		fire_at
	}

	fn char_at(buffer: &VecDeque<char>, start_offset: usize, pos: usize) -> Option<char> {
		pos.checked_sub(start_offset).and_then(|i| buffer.get(i)).copied()
	}

	fn windows_equal(
		buffer: &VecDeque<char>,
		start_offset: usize,
		a: usize,
		b: usize,
		len: usize,
	) -> bool {
		if a < start_offset {
			return false;
		}
		(0..len).all(|i| {
			Self::char_at(buffer, start_offset, a + i) == Self::char_at(buffer, start_offset, b + i)
		})
	}
}

/// What the pipeline should do after recording a tool call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolLoopAction {
	Proceed,
	/// Inject a one-time warning into the next turn, then break on the
	/// following recurrence.
	Warn(String),
	Break,
}

/// Coarse repetition detector over assistant tool calls: fires when the same
/// `(tool, canonicalized args)` tuple recurs too often inside the TTL window.
pub struct ToolLoopDetector {
	enabled: bool,
	max_repeats: usize,
	ttl: Duration,
	mode: ToolLoopMode,
	recent: VecDeque<(String, Instant)>,
	warned: bool,
}

impl ToolLoopDetector {
	pub fn new(config: &LoopDetectionConfig) -> Self {
		ToolLoopDetector {
			enabled: config.tool_loop_enabled,
			max_repeats: config.tool_loop_max_repeats.max(2),
			ttl: Duration::from_secs(config.tool_loop_ttl_seconds),
			mode: config.tool_loop_mode,
			recent: VecDeque::new(),
			warned: false,
		}
	}

	pub fn record(&mut self, tool_name: &str, args: &Value) -> ToolLoopAction {
		self.record_at(tool_name, args, Instant::now())
	}

	fn record_at(&mut self, tool_name: &str, args: &Value, now: Instant) -> ToolLoopAction {
		if !self.enabled {
			return ToolLoopAction::Proceed;
		}
		let key = format!("{tool_name}\u{0}{}", canonicalize(args));
		while let Some((_, t)) = self.recent.front() {
			if now.duration_since(*t) > self.ttl {
				self.recent.pop_front();
			} else {
				break;
			}
		}
		self.recent.push_back((key.clone(), now));
		let repeats = self.recent.iter().filter(|(k, _)| *k == key).count();
		if repeats < self.max_repeats {
			return ToolLoopAction::Proceed;
		}
		match self.mode {
			ToolLoopMode::Break => ToolLoopAction::Break,
			ToolLoopMode::ChanceThenBreak => {
				if self.warned {
					ToolLoopAction::Break
				} else {
					self.warned = true;
					ToolLoopAction::Warn(format!(
						"Tool call loop detected: {tool_name} has been invoked {repeats} times \
						 with identical arguments. Change approach before retrying."
					))
				}
			},
		}
	}
}

/// Stable rendering of a JSON value: object keys sorted at every level.
fn canonicalize(value: &Value) -> String {
	match value {
		Value::Object(map) => {
			let mut keys: Vec<&String> = map.keys().collect();
			keys.sort();
			let fields: Vec<String> = keys
				.into_iter()
				.map(|k| format!("{}:{}", k, canonicalize(&map[k])))
				.collect();
			format!("{{{}}}", fields.join(","))
		},
		Value::Array(items) => {
			let rendered: Vec<String> = items.iter().map(canonicalize).collect();
			format!("[{}]", rendered.join(","))
		},
		other => other.to_string(),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn config(min: usize, max: usize, reps: usize) -> LoopDetectionConfig {
		LoopDetectionConfig {
			min_pattern_length: min,
			max_pattern_length: max,
			min_repetitions: reps,
			..LoopDetectionConfig::default()
		}
	}

	#[test]
	fn fires_at_end_of_third_copy() {
		let pattern: String = "0123456789".chars().cycle().take(50).collect();
		let mut detector = LoopDetector::new(&config(50, 50, 3));
		let stream = format!("prelude text {p}{p}{p}", p = pattern);
		match detector.feed(&stream) {
			Feed::Fired(out) => {
				let expected = format!("prelude text {p}{p}{p}{m}", p = pattern, m = TRUNCATION_MARKER);
				assert_eq!(out, expected);
			},
			Feed::Continue(_) => panic!("expected loop to fire"),
		}
	}

	// Once fired the detector stays fired; the pipeline stops pulling the
	// upstream at that point.
	#[test]
	fn fire_is_sticky() {
		let mut detector = LoopDetector::new(&config(4, 8, 3));
		let _ = detector.feed("loomloomloom");
		assert!(detector.fired());
		assert_eq!(detector.feed("more"), Feed::Continue("more".to_string()));
		assert!(detector.fired());
	}

	#[test]
	fn separated_repeats_do_not_fire() {
		let mut detector = LoopDetector::new(&config(4, 8, 3));
		let out = detector.feed("spam and spam and spam and spam");
		assert!(matches!(out, Feed::Continue(_)));
		assert!(!detector.fired());
	}

	#[test]
	fn repetition_across_chunk_boundaries() {
		let mut detector = LoopDetector::new(&config(6, 12, 3));
		let mut fired = false;
		for chunk in ["loople", "loop", "leloo", "ple", "loople"] {
			if let Feed::Fired(out) = detector.feed(chunk) {
				assert!(out.ends_with(TRUNCATION_MARKER));
				fired = true;
				break;
			}
		}
		assert!(fired);
	}

	#[test]
	fn deterministic_given_same_input() {
		let input = "abcdefabcdefabcdef tail";
		let run = |input: &str| {
			let mut detector = LoopDetector::new(&config(6, 6, 3));
			match detector.feed(input) {
				Feed::Fired(out) => out,
				Feed::Continue(out) => out,
			}
		};
		assert_eq!(run(input), run(input));
	}

	#[test]
	fn reset_restarts_detection() {
		let mut detector = LoopDetector::new(&config(4, 8, 3));
		let _ = detector.feed("loomloomloom");
		assert!(detector.fired());
		detector.reset();
		assert!(!detector.fired());
		assert!(matches!(detector.feed("fresh text"), Feed::Continue(_)));
	}

	#[test]
	fn disabled_detector_passes_everything() {
		let mut cfg = config(4, 8, 3);
		cfg.enabled = false;
		let mut detector = LoopDetector::new(&cfg);
		assert!(matches!(detector.feed("loomloomloomloom"), Feed::Continue(_)));
	}

	#[test]
	fn tool_loop_breaks_on_identical_calls() {
		let cfg = LoopDetectionConfig {
			tool_loop_max_repeats: 3,
			..LoopDetectionConfig::default()
		};
		let mut detector = ToolLoopDetector::new(&cfg);
		let args = serde_json::json!({"path": "a.rs", "line": 1});
		let t = Instant::now();
		assert_eq!(detector.record_at("read_file", &args, t), ToolLoopAction::Proceed);
		assert_eq!(detector.record_at("read_file", &args, t), ToolLoopAction::Proceed);
		assert_eq!(detector.record_at("read_file", &args, t), ToolLoopAction::Break);
	}

	#[test]
	fn tool_loop_key_ignores_object_key_order() {
		let a = serde_json::json!({"x": 1, "y": 2});
		let b = serde_json::json!({"y": 2, "x": 1});
		assert_eq!(canonicalize(&a), canonicalize(&b));
	}

	#[test]
	fn tool_loop_chance_then_break_warns_once() {
		let cfg = LoopDetectionConfig {
			tool_loop_max_repeats: 2,
			tool_loop_mode: ToolLoopMode::ChanceThenBreak,
			..LoopDetectionConfig::default()
		};
		let mut detector = ToolLoopDetector::new(&cfg);
		let args = serde_json::json!({});
		let t = Instant::now();
		assert_eq!(detector.record_at("run", &args, t), ToolLoopAction::Proceed);
		assert!(matches!(detector.record_at("run", &args, t), ToolLoopAction::Warn(_)));
		assert_eq!(detector.record_at("run", &args, t), ToolLoopAction::Break);
	}

	#[test]
	fn tool_loop_ttl_expires_old_entries() {
		let cfg = LoopDetectionConfig {
			tool_loop_max_repeats: 2,
			tool_loop_ttl_seconds: 10,
			..LoopDetectionConfig::default()
		};
		let mut detector = ToolLoopDetector::new(&cfg);
		let args = serde_json::json!({});
		let t = Instant::now();
		assert_eq!(detector.record_at("run", &args, t), ToolLoopAction::Proceed);
		let later = t + Duration::from_secs(30);
		assert_eq!(detector.record_at("run", &args, later), ToolLoopAction::Proceed);
	}
}
