use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use regex::Regex;

/// Argument value with integers coerced when unambiguous.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArgValue {
	Str(String),
	Int(i64),
}

impl ArgValue {
	pub fn as_str(&self) -> Option<&str> {
		match self {
			ArgValue::Str(s) => Some(s.as_str()),
			ArgValue::Int(_) => None,
		}
	}

	pub fn as_int(&self) -> Option<i64> {
		match self {
			ArgValue::Int(i) => Some(*i),
			ArgValue::Str(s) => s.parse().ok(),
		}
	}

	/// String view regardless of coercion.
	pub fn display(&self) -> String {
		match self {
			ArgValue::Str(s) => s.clone(),
			ArgValue::Int(i) => i.to_string(),
		}
	}
}

pub type ArgMap = BTreeMap<String, ArgValue>;

/// A command located inside message text.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandMatch {
	pub name: String,
	pub args: ArgMap,
	/// Byte span of the whole command token within the scanned text.
	pub span: (usize, usize),
}

/// Compiled detector for a given command prefix.
pub struct CommandMatcher {
	prefix: String,
	pattern: Regex,
}

static TOOL_RESULT: Lazy<Regex> = Lazy::new(|| {
	Regex::new(r"(?i)^\s*\[\w+(\s+for\s+'[^']+')?\]\s+Result:").expect("tool result pattern")
});

static FEEDBACK: Lazy<Regex> =
	Lazy::new(|| Regex::new(r"(?is)<feedback>\s*(.*?)\s*</feedback>").expect("feedback pattern"));

static COMMENT_LINE: Lazy<Regex> =
	Lazy::new(|| Regex::new(r"(?m)^\s*#[^\n]*\n?").expect("comment pattern"));

impl CommandMatcher {
	pub fn new(prefix: &str) -> anyhow::Result<Self> {
		if let Some(reason) = validate_command_prefix(prefix) {
			anyhow::bail!("invalid command prefix {prefix:?}: {reason}");
		}
		let pattern = Regex::new(&format!(
			r"{}([a-zA-Z][\w-]*)(\(([^)]*)\))?",
			regex::escape(prefix)
		))?;
		Ok(CommandMatcher {
			prefix: prefix.to_string(),
			pattern,
		})
	}

	pub fn prefix(&self) -> &str {
		&self.prefix
	}

	/// First command occurrence in `text`, if any.
	pub fn find(&self, text: &str) -> Option<CommandMatch> {
		let caps = self.pattern.captures(text)?;
		let whole = caps.get(0)?;
		let name = caps.get(1)?.as_str().to_string();
		let args = caps
			.get(3)
			.map(|m| parse_args(m.as_str()))
			.unwrap_or_default();
		Some(CommandMatch {
			name,
			args,
			span: (whole.start(), whole.end()),
		})
	}

	/// Remove the matched span: a command at either edge is dropped with the
	/// adjacent whitespace; one in the middle joins its neighbors with a
	/// single space.
	pub fn strip(&self, text: &str, span: (usize, usize)) -> String {
		let before = &text[..span.0];
		let after = &text[span.1..];
		if after.trim().is_empty() {
			before.trim_end().to_string()
		} else if before.trim().is_empty() {
			after.trim_start().to_string()
		} else {
			format!("{} {}", before.trim_end(), after.trim_start())
		}
	}

	/// True when the message was nothing but commands, once comment lines
	/// are dropped.
	pub fn is_purely_command(&self, text: &str) -> bool {
		let stripped = COMMENT_LINE.replace_all(text, "");
		let mut rest = stripped.trim();
		if rest.is_empty() {
			return false;
		}
		while !rest.is_empty() {
			let Some(m) = self.pattern.find(rest) else {
				return false;
			};
			if m.start() != 0 {
				return false;
			}
			rest = rest[m.end()..].trim_start();
		}
		true
	}
}

/// Text presented to command detection. Tool-call results hide commands
/// unless an embedded `<feedback>` block carries them.
pub fn text_for_command_check(joined: &str) -> Option<String> {
	if TOOL_RESULT.is_match(joined) {
		let feedback = FEEDBACK
			.captures(joined)
			.and_then(|c| c.get(1))
			.map(|m| m.as_str().trim().to_string())?;
		if feedback.is_empty() {
			return None;
		}
		return Some(COMMENT_LINE.replace_all(&feedback, "").trim().to_string());
	}
	Some(joined.to_string())
}

/// Shell-like tokenization of the argument list: `--key=value` or
/// `key=value`, comma or whitespace separated, single/double quoting
/// honored, integers coerced.
pub fn parse_args(raw: &str) -> ArgMap {
	let mut args = ArgMap::new();
	for piece in split_outside_quotes(raw) {
		let piece = piece.trim();
		if piece.is_empty() {
			continue;
		}
		let (key, value) = match piece.split_once('=') {
			Some((k, v)) => (k, Some(v)),
			None => (piece, None),
		};
		let key = key.trim().trim_start_matches("--").to_string();
		if key.is_empty() {
			continue;
		}
		let value = match value {
			Some(v) => unquote(v.trim()),
			None => String::new(),
		};
		let coerced = match value.parse::<i64>() {
			Ok(n) if !value.is_empty() && !is_quoted(piece) => ArgValue::Int(n),
			_ => ArgValue::Str(value),
		};
		args.insert(key, coerced);
	}
	args
}

fn is_quoted(piece: &str) -> bool {
	piece.contains('"') || piece.contains('\'')
}

fn unquote(value: &str) -> String {
	// shlex handles the quoting rules; fall back to the raw text when the
	// token is unbalanced.
	shlex::split(value)
		.and_then(|tokens| {
			if tokens.len() == 1 {
				tokens.into_iter().next()
			} else {
				None
			}
		})
		.unwrap_or_else(|| value.to_string())
}

fn split_outside_quotes(raw: &str) -> Vec<String> {
	let mut pieces = Vec::new();
	let mut current = String::new();
	let mut quote: Option<char> = None;
	for c in raw.chars() {
		match quote {
			Some(q) => {
				current.push(c);
				if c == q {
					quote = None;
				}
			},
			None => match c {
				'"' | '\'' => {
					quote = Some(c);
					current.push(c);
				},
				',' => {
					pieces.push(std::mem::take(&mut current));
				},
				c if c.is_whitespace() => {
					pieces.push(std::mem::take(&mut current));
				},
				_ => current.push(c),
			},
		}
	}
	pieces.push(current);
	pieces
}

/// Startup validation of the configured prefix. Returns the reason when the
/// prefix is unusable.
pub fn validate_command_prefix(prefix: &str) -> Option<&'static str> {
	if prefix.is_empty() {
		return Some("command prefix must be a non-empty string");
	}
	if prefix.chars().any(char::is_whitespace) {
		return Some("command prefix cannot contain whitespace");
	}
	if prefix.chars().count() < 2 {
		return Some("command prefix must be at least 2 characters");
	}
	if prefix.chars().count() > 10 {
		return Some("command prefix must not exceed 10 characters");
	}
	if prefix.chars().any(|c| c.is_control()) {
		return Some("command prefix must contain only printable characters");
	}
	let chars: Vec<char> = prefix.chars().collect();
	if chars.len() == 2 && chars[0] == chars[1] {
		return Some("two character prefixes cannot repeat the same character");
	}
	None
}
