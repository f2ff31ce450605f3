use std::collections::BTreeSet;

use super::*;
use crate::llm::{Content, Message, Role};
use crate::session::{SessionDefaults, SessionSnapshot};

fn ctx() -> CommandCtx {
	let mut functional_backends = BTreeSet::new();
	functional_backends.insert("openrouter".to_string());
	functional_backends.insert("gemini".to_string());
	let mut models = std::collections::HashMap::new();
	models.insert(
		"openrouter".to_string(),
		vec!["foo".to_string(), "cypher-alpha:free".to_string()],
	);
	models.insert("gemini".to_string(), vec!["gemini-2.5-pro".to_string()]);
	CommandCtx {
		functional_backends,
		models,
		prefix: "!/".to_string(),
	}
}

fn snapshot() -> SessionSnapshot {
	SessionDefaults::default().fresh_snapshot()
}

fn matcher() -> CommandMatcher {
	CommandMatcher::new("!/").unwrap()
}

fn run(cmd: CommandKind, args: &str, snapshot: &SessionSnapshot) -> CommandOutcome {
	execute(cmd, &parser::parse_args(args), snapshot, &ctx())
}

#[test]
fn set_model_with_backend_prefix() {
	let result = run(CommandKind::Set, "model=openrouter:foo", &snapshot());
	assert!(result.success);
	assert!(result.message.contains("model set to openrouter:foo"));
	let next = result.new_snapshot.unwrap();
	assert_eq!(next.backend_config.backend_type.as_deref(), Some("openrouter"));
	assert_eq!(next.backend_config.model.as_deref(), Some("foo"));
}

#[test]
fn set_unknown_model_fails_whole_command() {
	let result = run(
		CommandKind::Set,
		"project=demo, model=openrouter:nope",
		&snapshot(),
	);
	assert!(!result.success);
	// No partial writes: the project assignment must not survive.
	assert!(result.new_snapshot.is_none());
}

#[test]
fn set_nonfunctional_backend_rejected() {
	let result = run(CommandKind::Set, "backend=anthropic", &snapshot());
	assert!(!result.success);
	assert!(result.message.contains("backend anthropic not functional"));
}

// Idempotent commands applied twice produce the same snapshot.
#[test]
fn set_and_oneoff_are_idempotent() {
	let base = snapshot();
	for (kind, args) in [
		(CommandKind::Set, "model=openrouter:foo"),
		(CommandKind::Oneoff, "openrouter/foo"),
		(CommandKind::CreateFailoverRoute, "name=r1, policy=k"),
	] {
		let once = run(kind, args, &base).new_snapshot.unwrap();
		let twice = run(kind, args, &once).new_snapshot.unwrap();
		assert_eq!(once, twice, "{} not idempotent", kind.name());
	}
}

#[test]
fn unset_clears_fields() {
	let set = run(CommandKind::Set, "model=openrouter:foo, project=demo", &snapshot())
		.new_snapshot
		.unwrap();
	let result = run(CommandKind::Unset, "model, project", &set);
	assert!(result.success);
	let next = result.new_snapshot.unwrap();
	assert_eq!(next.backend_config.model, None);
	assert_eq!(next.project, None);
	// Backend set alongside the model is untouched by unset(model).
	assert_eq!(next.backend_config.backend_type.as_deref(), Some("openrouter"));
}

#[test]
fn oneoff_accepts_slash_and_colon_forms() {
	for arg in ["openrouter/cypher-alpha:free", "openrouter:foo"] {
		let result = run(CommandKind::Oneoff, arg, &snapshot());
		assert!(result.success, "oneoff({arg}) failed: {}", result.message);
		let next = result.new_snapshot.unwrap();
		assert_eq!(next.backend_config.oneoff_backend.as_deref(), Some("openrouter"));
	}
}

#[test]
fn route_lifecycle() {
	let s = snapshot();
	let s = run(CommandKind::CreateFailoverRoute, "name=r1, policy=km", &s)
		.new_snapshot
		.unwrap();
	let s = run(CommandKind::RouteAppend, "name=r1, element=openrouter:foo", &s)
		.new_snapshot
		.unwrap();
	let s = run(
		CommandKind::RoutePrepend,
		"name=r1, element=gemini:gemini-2.5-pro",
		&s,
	)
	.new_snapshot
	.unwrap();
	let listing = run(CommandKind::RouteList, "name=r1", &s);
	assert!(listing.message.contains("gemini:gemini-2.5-pro, openrouter:foo"));
	let s = run(CommandKind::RouteClear, "name=r1", &s).new_snapshot.unwrap();
	let listing = run(CommandKind::RouteList, "name=r1", &s);
	assert!(listing.message.contains("(empty)"));
	let s = run(CommandKind::DeleteFailoverRoute, "name=r1", &s)
		.new_snapshot
		.unwrap();
	assert!(s.backend_config.failover_routes.is_empty());
}

#[test]
fn route_append_validates_element() {
	let s = run(CommandKind::CreateFailoverRoute, "name=r1, policy=k", &snapshot())
		.new_snapshot
		.unwrap();
	let result = run(CommandKind::RouteAppend, "name=r1, element=openrouter:nope", &s);
	assert!(!result.success);
	assert!(result.message.contains("not available"));
}

#[test]
fn arg_parser_handles_quoting_and_ints() {
	let args = parser::parse_args(r#"--name="my route", budget=2048, note='a,b'"#);
	assert_eq!(args.get("name").unwrap().display(), "my route");
	assert_eq!(args.get("budget").unwrap().as_int(), Some(2048));
	assert_eq!(args.get("note").unwrap().display(), "a,b");
}

#[test]
fn sanitizer_strips_by_position() {
	let m = matcher();
	// End: suffix dropped, right-trimmed.
	let text = "Hello there !/set(model=openrouter:foo)";
	let found = m.find(text).unwrap();
	assert_eq!(m.strip(text, found.span), "Hello there");
	// Start: prefix dropped, left-trimmed.
	let text = "!/hello and more";
	let found = m.find(text).unwrap();
	assert_eq!(m.strip(text, found.span), "and more");
	// Middle: joined with a single space.
	let text = "keep !/hello this";
	let found = m.find(text).unwrap();
	assert_eq!(m.strip(text, found.span), "keep this");
}

#[test]
fn sanitizer_leaves_surrounding_text_intact() {
	let m = matcher();
	let text = "alpha beta !/oneoff(openrouter/foo)\nHello!";
	let found = m.find(text).unwrap();
	let stripped = m.strip(text, found.span);
	assert_eq!(stripped, "alpha beta Hello!");
}

#[test]
fn purely_command_detection_ignores_comments() {
	let m = matcher();
	assert!(m.is_purely_command("!/hello"));
	assert!(m.is_purely_command("# context line\n!/set(project=x)"));
	assert!(m.is_purely_command("!/hello !/help"));
	assert!(!m.is_purely_command("please run !/hello"));
	assert!(!m.is_purely_command("# only a comment"));
}

#[test]
fn tool_result_hides_commands_without_feedback() {
	let text = "[read_file for 'main.rs'] Result: !/hello should be ignored";
	assert_eq!(parser::text_for_command_check(text), None);
}

#[test]
fn tool_result_feedback_is_scanned() {
	let text = "[attempt_completion] Result: done <feedback>!/set(project=x)</feedback>";
	let check = parser::text_for_command_check(text).unwrap();
	assert!(check.contains("!/set(project=x)"));
}

#[test]
fn interpret_reports_unknown_command() {
	let m = matcher();
	let mut messages = vec![Message::text(Role::User, "!/bad()")];
	let outcome = interpret(&m, &mut messages, &snapshot(), &ctx());
	assert!(outcome.command_only);
	assert_eq!(outcome.results.len(), 1);
	assert!(!outcome.results[0].success);
	assert!(outcome.results[0].message.contains("unknown command"));
}

#[test]
fn interpret_strips_command_and_keeps_text() {
	let m = matcher();
	let mut messages = vec![Message::text(
		Role::User,
		"!/oneoff(openrouter/cypher-alpha:free)\nHello!",
	)];
	let outcome = interpret(&m, &mut messages, &snapshot(), &ctx());
	assert!(!outcome.command_only);
	assert!(outcome.changed);
	assert_eq!(messages[0].joined_text(), "Hello!");
	let oneoff = outcome.snapshot.backend_config.oneoff_model.as_deref();
	assert_eq!(oneoff, Some("cypher-alpha:free"));
}

#[test]
fn interpret_joins_multipart_text_for_detection() {
	let m = matcher();
	let mut messages = vec![Message {
		role: Role::User,
		content: Content::Parts(vec![
			crate::llm::Part::Text("!/set(project=demo)".to_string()),
			crate::llm::Part::Text("   ".to_string()),
		]),
		name: None,
		tool_call_id: None,
		tool_calls: None,
	}];
	let outcome = interpret(&m, &mut messages, &snapshot(), &ctx());
	assert!(outcome.command_only);
	assert_eq!(outcome.snapshot.project.as_deref(), Some("demo"));
	assert!(messages[0].is_effectively_empty());
}

#[test]
fn prefix_validation_rules() {
	assert!(parser::validate_command_prefix("!/").is_none());
	assert!(parser::validate_command_prefix("$$/").is_none());
	assert!(parser::validate_command_prefix("").is_some());
	assert!(parser::validate_command_prefix("!").is_some());
	assert!(parser::validate_command_prefix("!!").is_some());
	assert!(parser::validate_command_prefix("! /").is_some());
	assert!(parser::validate_command_prefix("abcdefghijk").is_some());
}
