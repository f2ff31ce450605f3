use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};

use crate::app::Context;
use crate::llm::ProxyError;

mod handlers;

/// Which wire dialect an endpoint speaks; controls auth style and error
/// rendering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
	OpenAi,
	Anthropic,
	Gemini,
}

pub fn router(ctx: Arc<Context>) -> Router {
	Router::new()
		.route("/v1/chat/completions", post(handlers::chat_completions))
		.route("/v1/completions", post(handlers::completions))
		.route("/v1/responses", post(handlers::responses))
		.route("/v1/models", get(handlers::list_models))
		.route("/v1beta/models", get(handlers::gemini_list_models))
		.route("/v1beta/models/{model_action}", post(handlers::gemini_generate))
		.route("/anthropic/v1/messages", post(handlers::anthropic_messages))
		.route("/health", get(handlers::health))
		.route("/docs", get(handlers::docs))
		.route("/openapi.json", get(handlers::openapi))
		.with_state(ctx)
}

/// Resolve the session id: `X-Session-ID` header, then the `session-id`
/// cookie, then the shared `"default"` session.
pub fn session_id(headers: &HeaderMap) -> String {
	if let Some(value) = headers.get("x-session-id").and_then(|v| v.to_str().ok()) {
		if !value.is_empty() {
			return value.to_string();
		}
	}
	if let Some(cookies) = headers.get(header::COOKIE).and_then(|v| v.to_str().ok()) {
		for pair in cookies.split(';') {
			if let Some((name, value)) = pair.trim().split_once('=') {
				if name == "session-id" && !value.is_empty() {
					return value.to_string();
				}
			}
		}
	}
	"default".to_string()
}

/// Client auth. OpenAI/Anthropic dialects use bearer tokens; Gemini prefers
/// `x-goog-api-key` with bearer accepted as fallback.
pub fn authorize(ctx: &Context, headers: &HeaderMap, dialect: Dialect) -> Result<(), ProxyError> {
	let Some(expected) = &ctx.auth_key else {
		return Ok(());
	};
	let bearer = headers
		.get(header::AUTHORIZATION)
		.and_then(|v| v.to_str().ok())
		.and_then(|v| v.strip_prefix("Bearer "));
	let presented = match dialect {
		Dialect::Gemini => headers
			.get("x-goog-api-key")
			.and_then(|v| v.to_str().ok())
			.or(bearer),
		_ => bearer,
	};
	match presented {
		Some(key) if key == expected => Ok(()),
		_ => Err(ProxyError::Unauthorized),
	}
}

fn status_of(err: &ProxyError) -> StatusCode {
	match err {
		ProxyError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
		ProxyError::Unauthorized => StatusCode::UNAUTHORIZED,
		ProxyError::UnknownModel(_) => StatusCode::NOT_FOUND,
		ProxyError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
		ProxyError::Transient(_) => StatusCode::BAD_GATEWAY,
		ProxyError::Terminal { status, .. } => {
			StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
		},
		ProxyError::AllBackendsUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
		ProxyError::LoopDetected => StatusCode::OK,
		ProxyError::Cancelled => StatusCode::BAD_REQUEST,
	}
}

fn error_type(status: StatusCode) -> &'static str {
	if status == StatusCode::UNAUTHORIZED {
		"authentication_error"
	} else if status == StatusCode::TOO_MANY_REQUESTS {
		"rate_limit_error"
	} else if status.is_client_error() {
		"invalid_request_error"
	} else {
		"api_error"
	}
}

/// Convert a pipeline error into the source dialect's error envelope. The
/// single place exceptions-as-values become HTTP.
pub fn error_response(dialect: Dialect, err: &ProxyError) -> Response {
	let status = status_of(err);
	let message = err.to_string();
	let body = match dialect {
		Dialect::OpenAi => serde_json::json!({
			"error": {
				"message": message,
				"type": error_type(status),
				"code": status.as_u16(),
			}
		}),
		Dialect::Anthropic => serde_json::json!({
			"type": "error",
			"error": {
				"type": error_type(status),
				"message": message,
			}
		}),
		Dialect::Gemini => serde_json::json!({
			"error": {
				"code": status.as_u16(),
				"message": message,
				"status": status.canonical_reason().unwrap_or("UNKNOWN"),
			}
		}),
	};
	let mut response = (status, axum::Json(body)).into_response();
	if let ProxyError::AllBackendsUnavailable {
		earliest_retry: Some(at),
	} = err
	{
		let seconds = at.saturating_duration_since(Instant::now()).as_secs_f64().ceil() as u64;
		if let Ok(value) = seconds.to_string().parse() {
			response.headers_mut().insert(header::RETRY_AFTER, value);
		}
	}
	response
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn session_id_prefers_header_over_cookie() {
		let mut headers = HeaderMap::new();
		headers.insert("x-session-id", "from-header".parse().unwrap());
		headers.insert(header::COOKIE, "session-id=from-cookie".parse().unwrap());
		assert_eq!(session_id(&headers), "from-header");
	}

	#[test]
	fn session_id_falls_back_to_cookie_then_default() {
		let mut headers = HeaderMap::new();
		headers.insert(
			header::COOKIE,
			"theme=dark; session-id=abc123".parse().unwrap(),
		);
		assert_eq!(session_id(&headers), "abc123");
		assert_eq!(session_id(&HeaderMap::new()), "default");
	}

	#[test]
	fn retry_after_header_on_unavailable() {
		let err = ProxyError::AllBackendsUnavailable {
			earliest_retry: Some(Instant::now() + std::time::Duration::from_secs(42)),
		};
		let response = error_response(Dialect::OpenAi, &err);
		assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
		let retry: u64 = response
			.headers()
			.get(header::RETRY_AFTER)
			.unwrap()
			.to_str()
			.unwrap()
			.parse()
			.unwrap();
		assert!((41..=43).contains(&retry));
	}
}
