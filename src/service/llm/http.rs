//! OpenAI-compatible chat-completions backend over `reqwest`.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use reqwest::{StatusCode, header::RETRY_AFTER};
use serde::{Deserialize, Serialize};
use tokio::time::timeout;
use tracing::{instrument, warn};

use crate::base::{
    config::Config,
    events::EventBus,
    types::{PromptMessage, Res, Role},
};

use super::{CompletionError, CompletionRequest, GenericLlmClient, LlmClient, RawCompletion, RetryPolicy};

const VALIDATION_TIMEOUT: Duration = Duration::from_secs(5);
const VALIDATION_MAX_TOKENS: u32 = 10;
const MAX_ERROR_BODY: usize = 300;

// Extra methods on `LlmClient` applied by the http implementation.

impl LlmClient {
    pub fn http(config: &Config, events: EventBus) -> Res<Self> {
        let client = HttpLlmClient::new(&config.api_base, &config.api_key, &config.model)?;

        Ok(Self::new(Arc::new(client), RetryPolicy::from_config(config), config.cost_per_1k_tokens, events))
    }
}

// Wire types.

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [PromptMessage],
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct Usage {
    #[serde(default)]
    total_tokens: u32,
}

// Specific implementations.

/// HTTP chat-completions client.
#[derive(Clone)]
pub struct HttpLlmClient {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    validation_model: String,
}

impl HttpLlmClient {
    pub fn new(api_base: &str, api_key: &str, validation_model: &str) -> Res<Self> {
        let client = reqwest::Client::builder().build()?;

        Ok(Self {
            client,
            endpoint: format!("{}/chat/completions", api_base.trim_end_matches('/')),
            api_key: api_key.to_string(),
            validation_model: validation_model.to_string(),
        })
    }

    async fn post(&self, api_key: &str, body: &ChatRequest<'_>) -> Result<RawCompletion, CompletionError> {
        let response = self.client.post(&self.endpoint).bearer_auth(api_key).json(body).send().await.map_err(classify_transport)?;

        let status = response.status();
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        let text = response.text().await.map_err(classify_transport)?;

        if !status.is_success() {
            return Err(classify_status(status, retry_after, &text, body.model));
        }

        parse_completion(&text)
    }
}

#[async_trait]
impl GenericLlmClient for HttpLlmClient {
    #[instrument(name = "HttpLlmClient::execute", skip_all, fields(model = %request.model))]
    async fn execute(&self, request: &CompletionRequest) -> Result<RawCompletion, CompletionError> {
        let body = ChatRequest {
            model: &request.model,
            messages: &request.messages,
            max_tokens: request.max_tokens,
            temperature: Some(request.temperature),
        };

        self.post(&self.api_key, &body).await
    }

    #[instrument(name = "HttpLlmClient::validate_credential", skip_all)]
    async fn validate_credential(&self, key: &str) -> bool {
        let messages = [PromptMessage::new(Role::User, "test")];
        let body = ChatRequest {
            model: &self.validation_model,
            messages: &messages,
            max_tokens: VALIDATION_MAX_TOKENS,
            temperature: None,
        };

        match timeout(VALIDATION_TIMEOUT, self.post(key, &body)).await {
            Ok(Ok(_)) => true,
            Ok(Err(err)) => {
                warn!("Credential validation failed: {err}");
                false
            }
            Err(_) => {
                warn!("Credential validation timed out");
                false
            }
        }
    }
}

// Helpers.

fn parse_completion(body: &str) -> Result<RawCompletion, CompletionError> {
    let response: ChatResponse = serde_json::from_str(body).map_err(|err| CompletionError::Protocol(format!("Malformed response body: {err}")))?;

    let text = response
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.message.content)
        .ok_or_else(|| CompletionError::Protocol("Response contained no message content".to_string()))?;

    Ok(RawCompletion {
        text: text.trim().to_string(),
        tokens_used: response.usage.map(|usage| usage.total_tokens).unwrap_or(0),
    })
}

fn classify_transport(err: reqwest::Error) -> CompletionError {
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        CompletionError::TransientNetwork(err.to_string())
    } else {
        CompletionError::Protocol(err.to_string())
    }
}

/// Map a non-success HTTP status to a typed error.
fn classify_status(status: StatusCode, retry_after: Option<Duration>, body: &str, model: &str) -> CompletionError {
    let detail = format!("HTTP {}: {}", status.as_u16(), truncate(body));

    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => CompletionError::Auth(detail),
        StatusCode::TOO_MANY_REQUESTS => CompletionError::RateLimit { retry_after, detail },
        StatusCode::NOT_FOUND => CompletionError::ModelUnavailable { model: model.to_string(), detail },
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY if body.to_lowercase().contains("model") => CompletionError::ModelUnavailable { model: model.to_string(), detail },
        StatusCode::REQUEST_TIMEOUT => CompletionError::TransientNetwork(detail),
        s if s.is_server_error() => CompletionError::TransientNetwork(detail),
        _ => CompletionError::Protocol(detail),
    }
}

fn truncate(body: &str) -> &str {
    match body.char_indices().nth(MAX_ERROR_BODY) {
        Some((index, _)) => &body[..index],
        None => body,
    }
}

#[cfg(test)]
mod tests {
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
        task::JoinHandle,
    };

    use super::*;

    /// Serve one canned response per connection and hand back the raw requests.
    async fn stub_server(responses: Vec<String>) -> (String, JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());

        let handle = tokio::spawn(async move {
            let mut requests = Vec::new();

            for response in responses {
                let (mut socket, _) = listener.accept().await.unwrap();
                let mut buf = Vec::new();
                let mut chunk = [0u8; 4096];

                loop {
                    let n = socket.read(&mut chunk).await.unwrap();
                    if n == 0 {
                        break;
                    }
                    buf.extend_from_slice(&chunk[..n]);

                    let raw = String::from_utf8_lossy(&buf);
                    if let Some(header_end) = raw.find("\r\n\r\n") {
                        let length = raw[..header_end]
                            .lines()
                            .find_map(|line| {
                                let (name, value) = line.split_once(':')?;
                                name.eq_ignore_ascii_case("content-length").then(|| value.trim().parse::<usize>().ok()).flatten()
                            })
                            .unwrap_or(0);

                        if buf.len() >= header_end + 4 + length {
                            break;
                        }
                    }
                }

                requests.push(String::from_utf8_lossy(&buf).to_string());
                socket.write_all(response.as_bytes()).await.unwrap();
                socket.shutdown().await.unwrap();
            }

            requests
        });

        (base, handle)
    }

    fn http_response(status: &str, extra_headers: &str, body: &str) -> String {
        format!(
            "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n{extra_headers}\r\n{body}",
            body.len()
        )
    }

    fn request() -> CompletionRequest {
        CompletionRequest {
            model: "sonar-pro".to_string(),
            messages: vec![PromptMessage::new(Role::System, "persona"), PromptMessage::new(Role::User, "Wie spät ist es?")],
            max_tokens: 450,
            temperature: 0.7,
        }
    }

    async fn execute_against(response: String) -> (Result<RawCompletion, CompletionError>, String) {
        let (base, server) = stub_server(vec![response]).await;
        let client = HttpLlmClient::new(&base, "secret", "sonar-pro").unwrap();

        let result = client.execute(&request()).await;
        let requests = server.await.unwrap();

        (result, requests.into_iter().next().unwrap_or_default())
    }

    #[tokio::test]
    async fn test_successful_completion() {
        let body = r#"{"choices":[{"message":{"role":"assistant","content":"  Es ist Mittag.  "}}],"usage":{"prompt_tokens":30,"completion_tokens":12,"total_tokens":42}}"#;

        let (result, raw_request) = execute_against(http_response("200 OK", "", body)).await;

        assert_eq!(
            result.unwrap(),
            RawCompletion {
                text: "Es ist Mittag.".to_string(),
                tokens_used: 42,
            }
        );
        assert!(raw_request.starts_with("POST /chat/completions"));
        assert!(raw_request.to_lowercase().contains("authorization: bearer secret"));

        let json_start = raw_request.find("\r\n\r\n").unwrap() + 4;
        let json: serde_json::Value = serde_json::from_str(&raw_request[json_start..]).unwrap();
        assert_eq!(json["model"], "sonar-pro");
        assert_eq!(json["max_tokens"], 450);
        assert_eq!(json["messages"][0]["role"], "system");
        assert_eq!(json["messages"][1]["content"], "Wie spät ist es?");
    }

    #[tokio::test]
    async fn test_missing_usage_counts_zero_tokens() {
        let body = r#"{"choices":[{"message":{"content":"ok"}}]}"#;

        let (result, _) = execute_against(http_response("200 OK", "", body)).await;

        assert_eq!(result.unwrap().tokens_used, 0);
    }

    #[tokio::test]
    async fn test_unauthorized_is_auth_error() {
        let (result, _) = execute_against(http_response("401 Unauthorized", "", r#"{"error":"invalid api key"}"#)).await;

        assert!(matches!(result, Err(CompletionError::Auth(_))));
    }

    #[tokio::test]
    async fn test_too_many_requests_carries_retry_after() {
        let (result, _) = execute_against(http_response("429 Too Many Requests", "Retry-After: 7\r\n", "{}")).await;

        match result {
            Err(CompletionError::RateLimit { retry_after, .. }) => assert_eq!(retry_after, Some(Duration::from_secs(7))),
            other => panic!("expected rate limit, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_server_error_is_transient() {
        let (result, _) = execute_against(http_response("503 Service Unavailable", "", "upstream down")).await;

        assert!(matches!(result, Err(CompletionError::TransientNetwork(_))));
    }

    #[tokio::test]
    async fn test_malformed_body_is_protocol_error() {
        let (result, _) = execute_against(http_response("200 OK", "", "<html>oops</html>")).await;

        assert!(matches!(result, Err(CompletionError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_empty_choices_is_protocol_error() {
        let (result, _) = execute_against(http_response("200 OK", "", r#"{"choices":[]}"#)).await;

        assert!(matches!(result, Err(CompletionError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_connection_refused_is_transient() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        drop(listener);

        let client = HttpLlmClient::new(&base, "secret", "sonar-pro").unwrap();

        assert!(matches!(client.execute(&request()).await, Err(CompletionError::TransientNetwork(_))));
    }

    #[tokio::test]
    async fn test_validate_credential() {
        let ok = r#"{"choices":[{"message":{"content":"hi"}}]}"#;
        let (base, server) = stub_server(vec![http_response("200 OK", "", ok), http_response("401 Unauthorized", "", "{}")]).await;
        let client = HttpLlmClient::new(&base, "configured", "sonar").unwrap();

        assert!(client.validate_credential("good-key").await);
        assert!(!client.validate_credential("bad-key").await);

        let requests = server.await.unwrap();
        assert!(requests[0].to_lowercase().contains("authorization: bearer good-key"));
        assert!(requests[0].contains(r#""max_tokens":10"#));
        assert!(!requests[0].contains("temperature"));
    }

    #[tokio::test]
    async fn test_validate_credential_unreachable_is_false() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        drop(listener);

        let client = HttpLlmClient::new(&base, "secret", "sonar").unwrap();

        assert!(!client.validate_credential("key").await);
    }

    #[test]
    fn test_status_classification() {
        let model = "sonar-pro";

        assert!(matches!(classify_status(StatusCode::FORBIDDEN, None, "", model), CompletionError::Auth(_)));
        assert!(matches!(classify_status(StatusCode::NOT_FOUND, None, "", model), CompletionError::ModelUnavailable { .. }));
        assert!(matches!(
            classify_status(StatusCode::BAD_REQUEST, None, r#"{"error":"Invalid model 'x'"}"#, model),
            CompletionError::ModelUnavailable { .. }
        ));
        assert!(matches!(classify_status(StatusCode::BAD_REQUEST, None, "bad json", model), CompletionError::Protocol(_)));
        assert!(matches!(classify_status(StatusCode::BAD_GATEWAY, None, "", model), CompletionError::TransientNetwork(_)));
        assert!(matches!(classify_status(StatusCode::IM_A_TEAPOT, None, "", model), CompletionError::Protocol(_)));
    }

    #[test]
    fn test_error_bodies_are_truncated() {
        let long = "x".repeat(1000);

        match classify_status(StatusCode::BAD_GATEWAY, None, &long, "m") {
            CompletionError::TransientNetwork(detail) => assert!(detail.len() < 400),
            other => panic!("unexpected {other:?}"),
        }
    }
}
