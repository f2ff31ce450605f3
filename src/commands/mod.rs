use std::collections::{BTreeSet, HashMap};

use itertools::Itertools;

use crate::llm::{Message, ModelRef};
use crate::session::{FailoverRoute, RoutePolicy, ReasoningEffort, SessionSnapshot};

pub mod parser;
#[cfg(test)]
mod tests;

pub use parser::{ArgMap, ArgValue, CommandMatch, CommandMatcher};

/// Closed set of in-band commands. Each case parses its own arguments and
/// produces a snapshot transition; there is no runtime registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
	Hello,
	Help,
	Set,
	Unset,
	Oneoff,
	CreateFailoverRoute,
	DeleteFailoverRoute,
	RouteAppend,
	RoutePrepend,
	RouteClear,
	RouteList,
}

impl CommandKind {
	pub fn lookup(name: &str) -> Option<CommandKind> {
		match name.to_ascii_lowercase().as_str() {
			"hello" => Some(CommandKind::Hello),
			"help" => Some(CommandKind::Help),
			"set" => Some(CommandKind::Set),
			"unset" => Some(CommandKind::Unset),
			"oneoff" | "one-off" => Some(CommandKind::Oneoff),
			"create-failover-route" => Some(CommandKind::CreateFailoverRoute),
			"delete-failover-route" => Some(CommandKind::DeleteFailoverRoute),
			"route-append" => Some(CommandKind::RouteAppend),
			"route-prepend" => Some(CommandKind::RoutePrepend),
			"route-clear" => Some(CommandKind::RouteClear),
			"route-list" => Some(CommandKind::RouteList),
			_ => None,
		}
	}

	pub fn name(&self) -> &'static str {
		match self {
			CommandKind::Hello => "hello",
			CommandKind::Help => "help",
			CommandKind::Set => "set",
			CommandKind::Unset => "unset",
			CommandKind::Oneoff => "oneoff",
			CommandKind::CreateFailoverRoute => "create-failover-route",
			CommandKind::DeleteFailoverRoute => "delete-failover-route",
			CommandKind::RouteAppend => "route-append",
			CommandKind::RoutePrepend => "route-prepend",
			CommandKind::RouteClear => "route-clear",
			CommandKind::RouteList => "route-list",
		}
	}

	pub fn usage(&self) -> &'static str {
		match self {
			CommandKind::Hello => "hello - request the session banner",
			CommandKind::Help => "help([cmd]) - list commands or describe one",
			CommandKind::Set => {
				"set(model=<backend:model>, backend=<name>, project=<str>, project-dir=<path>, \
				 interactive-mode=on|off, temperature=<float>, reasoning-effort=<low|medium|high>, \
				 thinking-budget=<int>, redact-keys=on|off)"
			},
			CommandKind::Unset => "unset(key[, key...]) - clear session fields",
			CommandKind::Oneoff => "oneoff(<backend>/<model>) - override backend and model for one dispatch",
			CommandKind::CreateFailoverRoute => "create-failover-route(name=<name>, policy=k|m|km|mk)",
			CommandKind::DeleteFailoverRoute => "delete-failover-route(name=<name>)",
			CommandKind::RouteAppend => "route-append(name=<name>, element=<backend:model>)",
			CommandKind::RoutePrepend => "route-prepend(name=<name>, element=<backend:model>)",
			CommandKind::RouteClear => "route-clear(name=<name>)",
			CommandKind::RouteList => "route-list(name=<name>)",
		}
	}

	pub fn all() -> &'static [CommandKind] {
		&[
			CommandKind::Hello,
			CommandKind::Help,
			CommandKind::Set,
			CommandKind::Unset,
			CommandKind::Oneoff,
			CommandKind::CreateFailoverRoute,
			CommandKind::DeleteFailoverRoute,
			CommandKind::RouteAppend,
			CommandKind::RoutePrepend,
			CommandKind::RouteClear,
			CommandKind::RouteList,
		]
	}
}

/// Read-only inputs a command execution may consult.
#[derive(Debug, Clone, Default)]
pub struct CommandCtx {
	pub functional_backends: BTreeSet<String>,
	/// Advertised model list per functional backend.
	pub models: HashMap<String, Vec<String>>,
	pub prefix: String,
}

impl CommandCtx {
	fn backend_has_model(&self, backend: &str, model: &str) -> bool {
		self
			.models
			.get(backend)
			.map(|models| models.iter().any(|m| m == model))
			.unwrap_or(false)
	}

	fn known_backends(&self) -> Vec<&str> {
		self.functional_backends.iter().map(String::as_str).collect()
	}
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommandOutcome {
	pub name: String,
	pub success: bool,
	pub message: String,
	pub new_snapshot: Option<SessionSnapshot>,
}

impl CommandOutcome {
	fn ok(kind: CommandKind, message: impl Into<String>, snapshot: SessionSnapshot) -> Self {
		CommandOutcome {
			name: kind.name().to_string(),
			success: true,
			message: message.into(),
			new_snapshot: Some(snapshot),
		}
	}

	fn info(kind: CommandKind, message: impl Into<String>) -> Self {
		CommandOutcome {
			name: kind.name().to_string(),
			success: true,
			message: message.into(),
			new_snapshot: None,
		}
	}

	fn fail(kind: CommandKind, message: impl Into<String>) -> Self {
		CommandOutcome {
			name: kind.name().to_string(),
			success: false,
			message: message.into(),
			new_snapshot: None,
		}
	}
}

/// Execute one command against a snapshot. Pure over its inputs: the only
/// output is the outcome, which may carry the successor snapshot.
pub fn execute(
	kind: CommandKind,
	args: &ArgMap,
	snapshot: &SessionSnapshot,
	ctx: &CommandCtx,
) -> CommandOutcome {
	match kind {
		CommandKind::Hello => {
			let mut next = snapshot.clone();
			next.hello_requested = true;
			next.banner_shown = false;
			CommandOutcome::ok(kind, "hello acknowledged", next)
		},
		CommandKind::Help => execute_help(args),
		CommandKind::Set => execute_set(args, snapshot, ctx),
		CommandKind::Unset => execute_unset(args, snapshot),
		CommandKind::Oneoff => execute_oneoff(args, snapshot, ctx),
		CommandKind::CreateFailoverRoute => execute_create_route(args, snapshot),
		CommandKind::DeleteFailoverRoute => execute_delete_route(args, snapshot),
		CommandKind::RouteAppend => execute_route_edit(kind, args, snapshot, ctx, RouteEdit::Append),
		CommandKind::RoutePrepend => execute_route_edit(kind, args, snapshot, ctx, RouteEdit::Prepend),
		CommandKind::RouteClear => execute_route_clear(args, snapshot),
		CommandKind::RouteList => execute_route_list(args, snapshot),
	}
}

fn execute_help(args: &ArgMap) -> CommandOutcome {
	let kind = CommandKind::Help;
	if let Some(name) = args.get("cmd").map(ArgValue::display).or_else(|| {
		// `help(set)` puts the command name in as a bare key.
		args
			.iter()
			.find(|(_, v)| v.as_str() == Some(""))
			.map(|(k, _)| k.clone())
	}) {
		return match CommandKind::lookup(&name) {
			Some(target) => CommandOutcome::info(kind, target.usage()),
			None => CommandOutcome::fail(kind, format!("unknown command: {name}")),
		};
	}
	let listing = CommandKind::all().iter().map(|c| c.name()).join(", ");
	CommandOutcome::info(kind, format!("available commands: {listing}"))
}

fn execute_set(args: &ArgMap, snapshot: &SessionSnapshot, ctx: &CommandCtx) -> CommandOutcome {
	let kind = CommandKind::Set;
	if args.is_empty() {
		return CommandOutcome::fail(kind, "set requires at least one argument");
	}
	let mut next = snapshot.clone();
	let mut messages = Vec::new();
	// Validate-and-apply on the clone; any failure discards it entirely so
	// a bad argument cannot leave partial writes behind.
	for (key, value) in args {
		let value_str = value.display();
		match key.as_str() {
			"model" => {
				if let Some(model_ref) = ModelRef::parse(&value_str, &ctx.known_backends()) {
					if !ctx.backend_has_model(&model_ref.backend, &model_ref.model) {
						return CommandOutcome::fail(
							kind,
							format!("model {} not available on {}", model_ref.model, model_ref.backend),
						);
					}
					next.backend_config.backend_type = Some(model_ref.backend.clone());
					next.backend_config.model = Some(model_ref.model.clone());
					messages.push(format!("model set to {}:{}", model_ref.backend, model_ref.model));
				} else if snapshot.backend_config.failover_routes.contains_key(&value_str) {
					next.backend_config.model = Some(value_str.clone());
					messages.push(format!("model set to {value_str}"));
				} else {
					let known = ctx
						.models
						.values()
						.any(|models| models.iter().any(|m| *m == value_str));
					if !known {
						return CommandOutcome::fail(kind, format!("model {value_str} not available"));
					}
					next.backend_config.model = Some(value_str.clone());
					messages.push(format!("model set to {value_str}"));
				}
			},
			"backend" => {
				if !ctx.functional_backends.contains(&value_str) {
					return CommandOutcome::fail(kind, format!("backend {value_str} not functional"));
				}
				next.backend_config.backend_type = Some(value_str.clone());
				messages.push(format!("backend set to {value_str}"));
			},
			"project" => {
				next.project = Some(value_str.clone());
				messages.push(format!("project set to {value_str}"));
			},
			"project-dir" | "project_dir" => {
				next.project_dir = Some(value_str.clone());
				messages.push(format!("project dir set to {value_str}"));
			},
			"interactive-mode" | "interactive_mode" => {
				let Some(on) = parse_on_off(&value_str) else {
					return CommandOutcome::fail(kind, "interactive-mode must be on or off");
				};
				if on && !next.backend_config.interactive_mode {
					next.interactive_just_enabled = true;
					next.banner_shown = false;
				}
				next.backend_config.interactive_mode = on;
				messages.push(format!("interactive mode set to {}", on_off(on)));
			},
			"temperature" => {
				let Ok(temperature) = value_str.parse::<f64>() else {
					return CommandOutcome::fail(kind, format!("invalid temperature: {value_str}"));
				};
				if !(0.0..=2.0).contains(&temperature) {
					return CommandOutcome::fail(kind, "temperature must be between 0.0 and 2.0");
				}
				next.reasoning_config.temperature = Some(temperature);
				messages.push(format!("temperature set to {temperature}"));
			},
			"reasoning-effort" | "reasoning_effort" => {
				let Some(effort) = ReasoningEffort::parse(&value_str) else {
					return CommandOutcome::fail(kind, "reasoning-effort must be low, medium or high");
				};
				next.reasoning_config.reasoning_effort = Some(effort);
				messages.push(format!("reasoning effort set to {}", effort.as_str()));
			},
			"thinking-budget" | "thinking_budget" => {
				let Some(budget) = value.as_int() else {
					return CommandOutcome::fail(kind, format!("invalid thinking budget: {value_str}"));
				};
				next.reasoning_config.thinking_budget = Some(budget);
				messages.push(format!("thinking budget set to {budget}"));
			},
			"redact-keys" | "redact_keys" => {
				let Some(on) = parse_on_off(&value_str) else {
					return CommandOutcome::fail(kind, "redact-keys must be on or off");
				};
				next.api_key_redaction_override = Some(on);
				messages.push(format!("api key redaction set to {}", on_off(on)));
			},
			other => {
				return CommandOutcome::fail(kind, format!("unknown set argument: {other}"));
			},
		}
	}
	CommandOutcome::ok(kind, messages.join("; "), next)
}

fn execute_unset(args: &ArgMap, snapshot: &SessionSnapshot) -> CommandOutcome {
	let kind = CommandKind::Unset;
	if args.is_empty() {
		return CommandOutcome::fail(kind, "unset requires at least one key");
	}
	let mut next = snapshot.clone();
	let mut messages = Vec::new();
	for key in args.keys() {
		match key.as_str() {
			"model" => next.backend_config.model = None,
			"backend" => next.backend_config.backend_type = None,
			"project" => next.project = None,
			"project-dir" | "project_dir" => next.project_dir = None,
			"temperature" => next.reasoning_config.temperature = None,
			"reasoning-effort" | "reasoning_effort" => next.reasoning_config.reasoning_effort = None,
			"thinking-budget" | "thinking_budget" => next.reasoning_config.thinking_budget = None,
			"oneoff" | "one-off" => {
				next.backend_config.oneoff_backend = None;
				next.backend_config.oneoff_model = None;
			},
			"redact-keys" | "redact_keys" => next.api_key_redaction_override = None,
			other => {
				return CommandOutcome::fail(kind, format!("unknown unset key: {other}"));
			},
		}
		messages.push(format!("{key} unset"));
	}
	CommandOutcome::ok(kind, messages.join("; "), next)
}

fn execute_oneoff(args: &ArgMap, snapshot: &SessionSnapshot, ctx: &CommandCtx) -> CommandOutcome {
	let kind = CommandKind::Oneoff;
	// The route arrives as a single bare token: backend/model or backend:model.
	let Some(route) = args
		.iter()
		.find(|(k, v)| v.as_str() == Some("") && (k.contains('/') || k.contains(':')))
		.map(|(k, _)| k.clone())
	else {
		return CommandOutcome::fail(kind, "oneoff requires <backend>/<model>");
	};
	let (backend, model) = match route.split_once('/').or_else(|| route.split_once(':')) {
		Some((b, m)) if !b.is_empty() && !m.is_empty() => (b.to_string(), m.to_string()),
		_ => return CommandOutcome::fail(kind, "oneoff requires <backend>/<model>"),
	};
	if !ctx.functional_backends.contains(&backend) {
		return CommandOutcome::fail(kind, format!("backend {backend} not functional"));
	}
	let mut next = snapshot.clone();
	next.backend_config.oneoff_backend = Some(backend.clone());
	next.backend_config.oneoff_model = Some(model.clone());
	CommandOutcome::ok(kind, format!("one-off route set to {backend}:{model}"), next)
}

fn execute_create_route(args: &ArgMap, snapshot: &SessionSnapshot) -> CommandOutcome {
	let kind = CommandKind::CreateFailoverRoute;
	let name = args.get("name").map(ArgValue::display).unwrap_or_default();
	let policy = args.get("policy").map(ArgValue::display).unwrap_or_default();
	let Some(policy) = RoutePolicy::parse(&policy) else {
		return CommandOutcome::fail(kind, "create-failover-route requires name and valid policy");
	};
	if name.is_empty() {
		return CommandOutcome::fail(kind, "create-failover-route requires name and valid policy");
	}
	let mut next = snapshot.clone();
	next.backend_config.failover_routes.insert(
		name.clone(),
		FailoverRoute {
			policy,
			elements: Vec::new(),
		},
	);
	CommandOutcome::ok(
		kind,
		format!("failover route {name} created with policy {}", policy.as_str()),
		next,
	)
}

fn execute_delete_route(args: &ArgMap, snapshot: &SessionSnapshot) -> CommandOutcome {
	let kind = CommandKind::DeleteFailoverRoute;
	let name = args.get("name").map(ArgValue::display).unwrap_or_default();
	if name.is_empty() {
		return CommandOutcome::fail(kind, "delete-failover-route requires name");
	}
	let mut next = snapshot.clone();
	if next.backend_config.failover_routes.remove(&name).is_none() {
		return CommandOutcome::fail(kind, format!("failover route {name} not found"));
	}
	CommandOutcome::ok(kind, format!("failover route {name} deleted"), next)
}

enum RouteEdit {
	Append,
	Prepend,
}

fn execute_route_edit(
	kind: CommandKind,
	args: &ArgMap,
	snapshot: &SessionSnapshot,
	ctx: &CommandCtx,
	edit: RouteEdit,
) -> CommandOutcome {
	let name = args.get("name").map(ArgValue::display).unwrap_or_default();
	let element = args.get("element").map(ArgValue::display).unwrap_or_default();
	if name.is_empty() || element.is_empty() {
		return CommandOutcome::fail(kind, format!("{} requires name and element", kind.name()));
	}
	let Some(model_ref) = ModelRef::parse(&element, &ctx.known_backends()) else {
		return CommandOutcome::fail(kind, format!("element {element} is not <backend>:<model>"));
	};
	if !ctx.backend_has_model(&model_ref.backend, &model_ref.model) {
		return CommandOutcome::fail(
			kind,
			format!("model {} not available on {}", model_ref.model, model_ref.backend),
		);
	}
	let mut next = snapshot.clone();
	let Some(route) = next.backend_config.failover_routes.get_mut(&name) else {
		return CommandOutcome::fail(kind, format!("failover route {name} not found"));
	};
	let canonical = format!("{}:{}", model_ref.backend, model_ref.model);
	match edit {
		RouteEdit::Append => route.elements.push(canonical.clone()),
		RouteEdit::Prepend => route.elements.insert(0, canonical.clone()),
	}
	CommandOutcome::ok(kind, format!("{canonical} added to route {name}"), next)
}

fn execute_route_clear(args: &ArgMap, snapshot: &SessionSnapshot) -> CommandOutcome {
	let kind = CommandKind::RouteClear;
	let name = args.get("name").map(ArgValue::display).unwrap_or_default();
	let mut next = snapshot.clone();
	let Some(route) = next.backend_config.failover_routes.get_mut(&name) else {
		return CommandOutcome::fail(kind, format!("failover route {name} not found"));
	};
	route.elements.clear();
	CommandOutcome::ok(kind, format!("route {name} cleared"), next)
}

fn execute_route_list(args: &ArgMap, snapshot: &SessionSnapshot) -> CommandOutcome {
	let kind = CommandKind::RouteList;
	let name = args.get("name").map(ArgValue::display).unwrap_or_default();
	let Some(route) = snapshot.backend_config.failover_routes.get(&name) else {
		return CommandOutcome::fail(kind, format!("failover route {name} not found"));
	};
	let listing = if route.elements.is_empty() {
		"(empty)".to_string()
	} else {
		route.elements.join(", ")
	};
	CommandOutcome::info(
		kind,
		format!("route {name} ({}): {listing}", route.policy.as_str()),
	)
}

fn parse_on_off(value: &str) -> Option<bool> {
	match value.to_ascii_lowercase().as_str() {
		"on" | "true" | "1" | "yes" => Some(true),
		"off" | "false" | "0" | "no" => Some(false),
		_ => None,
	}
}

fn on_off(on: bool) -> &'static str {
	if on { "on" } else { "off" }
}

/// Result of running the interpreter over a request's messages.
#[derive(Debug)]
pub struct InterpretOutcome {
	pub results: Vec<CommandOutcome>,
	/// The message was nothing but commands; dispatch must be skipped.
	pub command_only: bool,
	/// Final snapshot after chaining every successful transition.
	pub snapshot: SessionSnapshot,
	pub changed: bool,
}

const MAX_COMMANDS_PER_MESSAGE: usize = 8;

/// Detect, execute and strip commands in the newest user message.
pub fn interpret(
	matcher: &CommandMatcher,
	messages: &mut [Message],
	snapshot: &SessionSnapshot,
	ctx: &CommandCtx,
) -> InterpretOutcome {
	let mut outcome = InterpretOutcome {
		results: Vec::new(),
		command_only: false,
		snapshot: snapshot.clone(),
		changed: false,
	};
	let Some(last_user) = messages
		.iter()
		.rposition(|m| m.role == crate::llm::Role::User)
	else {
		return outcome;
	};
	let joined = messages[last_user].joined_text();
	let Some(mut check_text) = parser::text_for_command_check(&joined) else {
		return outcome;
	};
	let purely_command = matcher.is_purely_command(&joined);
	let mut executed = 0;
	while executed < MAX_COMMANDS_PER_MESSAGE {
		let Some(found) = matcher.find(&check_text) else {
			break;
		};
		executed += 1;
		check_text = matcher.strip(&check_text, found.span);
		let result = match CommandKind::lookup(&found.name) {
			Some(kind) => execute(kind, &found.args, &outcome.snapshot, ctx),
			None => CommandOutcome {
				name: found.name.clone(),
				success: false,
				message: format!("unknown command: {}", found.name),
				new_snapshot: None,
			},
		};
		tracing::debug!(command = %result.name, success = result.success, "executed command");
		if let Some(next) = &result.new_snapshot {
			outcome.snapshot = next.clone();
			outcome.changed = true;
		}
		outcome.results.push(result);
	}
	if executed == 0 {
		return outcome;
	}
	strip_message_commands(matcher, &mut messages[last_user]);
	outcome.command_only = purely_command || messages[last_user].is_effectively_empty();
	outcome
}

/// Remove every command token from a message's text content, part by part.
fn strip_message_commands(matcher: &CommandMatcher, message: &mut Message) {
	let strip_all = |text: &str| -> String {
		let mut current = text.to_string();
		for _ in 0..MAX_COMMANDS_PER_MESSAGE {
			match matcher.find(&current) {
				Some(found) => current = matcher.strip(&current, found.span),
				None => break,
			}
		}
		current
	};
	match &mut message.content {
		crate::llm::Content::Text(text) => *text = strip_all(text),
		crate::llm::Content::Parts(parts) => {
			for part in parts {
				if let crate::llm::Part::Text(text) = part {
					*text = strip_all(text);
				}
			}
		},
	}
}
