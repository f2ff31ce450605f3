use std::time::Duration;

use futures::StreamExt;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use super::*;
use crate::backend::openai::OpenAiConnector;
use crate::llm::{ChatRequest, Message, Role};

fn connector(server: &MockServer) -> OpenAiConnector {
	OpenAiConnector::new(
		"openai",
		server.uri(),
		vec![ApiKey {
			name: "OPENAI_API_KEY".to_string(),
			value: "sk-test".to_string(),
		}],
		Default::default(),
		reqwest::Client::new(),
		Duration::from_secs(5),
	)
}

fn request() -> ChatRequest {
	ChatRequest {
		model: "foo".to_string(),
		messages: vec![Message::text(Role::User, "hi")],
		..ChatRequest::default()
	}
}

fn key() -> ApiKey {
	ApiKey {
		name: "OPENAI_API_KEY".to_string(),
		value: "sk-test".to_string(),
	}
}

#[tokio::test]
async fn unary_chat_round_trips_the_wire() {
	let server = MockServer::start().await;
	Mock::given(method("POST"))
		.and(path("/chat/completions"))
		.and(header("authorization", "Bearer sk-test"))
		.and(body_partial_json(serde_json::json!({"model": "foo"})))
		.respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
			"id": "chatcmpl-1",
			"object": "chat.completion",
			"created": 1700000000,
			"model": "foo",
			"choices": [{
				"index": 0,
				"message": {"role": "assistant", "content": "hello back"},
				"finish_reason": "stop",
			}],
			"usage": {"prompt_tokens": 1, "completion_tokens": 2, "total_tokens": 3},
		})))
		.expect(1)
		.mount(&server)
		.await;
	let connector = connector(&server);
	let resp = connector.chat_completions(&request(), "foo", &key()).await.unwrap();
	assert_eq!(resp.choices[0].message.content.as_deref(), Some("hello back"));
	assert_eq!(resp.usage.unwrap().total_tokens, 3);
}

#[tokio::test]
async fn http_429_maps_to_rate_limited() {
	let server = MockServer::start().await;
	Mock::given(method("POST"))
		.and(path("/chat/completions"))
		.respond_with(ResponseTemplate::new(429).set_body_json(serde_json::json!({
			"error": {
				"message": "slow down",
				"details": [{"@type": "type.googleapis.com/google.rpc.RetryInfo", "retryDelay": "12s"}],
			}
		})))
		.mount(&server)
		.await;
	let connector = connector(&server);
	let err = connector
		.chat_completions(&request(), "foo", &key())
		.await
		.err()
		.unwrap();
	match err {
		ProxyError::RateLimited { delay_seconds } => assert_eq!(delay_seconds, Some(12.0)),
		other => panic!("unexpected: {other:?}"),
	}
}

#[tokio::test]
async fn streaming_decodes_sse_frames() {
	let server = MockServer::start().await;
	let body = concat!(
		"data: {\"id\":\"c1\",\"object\":\"chat.completion.chunk\",\"created\":1,\"model\":\"foo\",",
		"\"choices\":[{\"index\":0,\"delta\":{\"role\":\"assistant\",\"content\":\"he\"}}]}\n\n",
		"data: {\"id\":\"c1\",\"object\":\"chat.completion.chunk\",\"created\":1,\"model\":\"foo\",",
		"\"choices\":[{\"index\":0,\"delta\":{\"content\":\"llo\"},\"finish_reason\":\"stop\"}]}\n\n",
		"data: [DONE]\n\n",
	);
	Mock::given(method("POST"))
		.and(path("/chat/completions"))
		.respond_with(
			ResponseTemplate::new(200)
				.insert_header("content-type", "text/event-stream")
				.set_body_raw(body, "text/event-stream"),
		)
		.mount(&server)
		.await;
	let connector = connector(&server);
	let mut stream = connector
		.stream_chat_completions(&request(), "foo", &key())
		.await
		.unwrap();
	let mut text = String::new();
	let mut saw_finish = false;
	while let Some(item) = stream.next().await {
		let chunk = item.unwrap();
		for choice in &chunk.choices {
			if let Some(content) = &choice.delta.content {
				text.push_str(content);
			}
			if choice.finish_reason.is_some() {
				saw_finish = true;
			}
		}
	}
	assert_eq!(text, "hello");
	assert!(saw_finish);
}

#[tokio::test]
async fn model_listing_refreshes_cache() {
	let server = MockServer::start().await;
	Mock::given(method("GET"))
		.and(path("/models"))
		.respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
			"object": "list",
			"data": [{"id": "foo"}, {"id": "bar"}],
		})))
		.mount(&server)
		.await;
	let connector = connector(&server);
	assert!(connector.models().is_empty());
	assert!(!connector.is_functional());
	connector.refresh_models().await.unwrap();
	assert_eq!(*connector.models(), vec!["foo".to_string(), "bar".to_string()]);
	assert!(connector.is_functional());
}
