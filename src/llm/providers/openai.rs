//! OpenAI-compatible chat-completions provider.
//!
//! Works against any endpoint speaking the `/chat/completions` wire
//! format. Streaming uses the SSE `data:` line protocol with incremental
//! `delta.content` fragments.

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use serde_json::{json, Value};

use super::super::{ChatMessage, CompletionRequest, LlmClient, LlmError, TokenStream};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Client for OpenAI-compatible completion APIs.
#[derive(Debug, Clone)]
pub struct OpenAiCompatibleClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl OpenAiCompatibleClient {
    /// Create a client. `api_key` falls back to `OPENAI_API_KEY`.
    pub fn new(base_url: Option<String>, api_key: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            api_key: api_key.or_else(|| std::env::var("OPENAI_API_KEY").ok()),
        }
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }

    fn build_request_body(&self, request: &CompletionRequest, stream: bool) -> Value {
        let messages: Vec<Value> = request
            .messages
            .iter()
            .map(|ChatMessage { role, content }| json!({ "role": role, "content": content }))
            .collect();
        let mut body = json!({
            "model": request.model,
            "messages": messages,
            "temperature": request.temperature,
        });
        if let Some(max_tokens) = request.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }
        if stream {
            body["stream"] = json!(true);
        }
        body
    }

    async fn send(&self, body: &Value) -> Result<reqwest::Response, LlmError> {
        let mut builder = self.http.post(self.completions_url()).json(body);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                LlmError::Timeout(e.to_string())
            } else {
                LlmError::Network(e.to_string())
            }
        })?;
        map_status(response).await
    }
}

/// Translate HTTP status codes into the error taxonomy.
async fn map_status(response: reqwest::Response) -> Result<reqwest::Response, LlmError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let detail = format!("{status}: {body}");
    Err(match status.as_u16() {
        401 | 403 => LlmError::Authentication(detail),
        429 => LlmError::RateLimit(detail),
        400 if body.contains("context_length") || body.contains("maximum context") => {
            LlmError::ContextWindowExceeded(detail)
        }
        400 if body.contains("content_policy") || body.contains("policy") => {
            LlmError::Policy(detail)
        }
        408 | 504 => LlmError::Timeout(detail),
        _ => LlmError::Api(detail),
    })
}

/// Parse complete SSE lines out of `buffer`, returning extracted tokens.
fn drain_sse_buffer(buffer: &mut String) -> Vec<String> {
    let mut tokens = Vec::new();
    while let Some(newline) = buffer.find('\n') {
        let line: String = buffer.drain(..=newline).collect();
        let line = line.trim();
        let Some(data) = line.strip_prefix("data:") else {
            continue;
        };
        let data = data.trim();
        if data.is_empty() || data == "[DONE]" {
            continue;
        }
        match serde_json::from_str::<Value>(data) {
            Ok(chunk) => {
                if let Some(content) = chunk["choices"][0]["delta"]["content"].as_str() {
                    if !content.is_empty() {
                        tokens.push(content.to_string());
                    }
                }
            }
            Err(e) => log::warn!("Skipping malformed SSE chunk: {e}"),
        }
    }
    tokens
}

#[async_trait]
impl LlmClient for OpenAiCompatibleClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, LlmError> {
        let body = self.build_request_body(request, false);
        let response = self.send(&body).await?;
        let payload: Value = response
            .json()
            .await
            .map_err(|e| LlmError::Api(format!("invalid response body: {e}")))?;
        payload["choices"][0]["message"]["content"]
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| LlmError::Api(format!("response carries no content: {payload}")))
    }

    async fn complete_stream(
        &self,
        request: &CompletionRequest,
    ) -> Result<TokenStream, LlmError> {
        let body = self.build_request_body(request, true);
        let response = self.send(&body).await?;

        let stream = response
            .bytes_stream()
            .scan(String::new(), |buffer, chunk: Result<Bytes, reqwest::Error>| {
                let out: Vec<Result<String, LlmError>> = match chunk {
                    Ok(bytes) => {
                        buffer.push_str(&String::from_utf8_lossy(&bytes));
                        drain_sse_buffer(buffer).into_iter().map(Ok).collect()
                    }
                    Err(e) => vec![Err(LlmError::Network(e.to_string()))],
                };
                futures::future::ready(Some(out))
            })
            .flat_map(futures::stream::iter)
            .boxed();
        Ok(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_body_shape() {
        let client = OpenAiCompatibleClient::new(None, Some("key".into()));
        let request = CompletionRequest {
            model: "gpt-4o-mini".into(),
            messages: vec![ChatMessage::new("user", "hi")],
            temperature: 0.3,
            max_tokens: Some(64),
        };
        let body = client.build_request_body(&request, true);
        assert_eq!(body["model"], "gpt-4o-mini");
        assert_eq!(body["messages"][0]["role"], "user");
        assert_eq!(body["max_tokens"], 64);
        assert_eq!(body["stream"], true);
    }

    #[test]
    fn test_drain_sse_buffer_extracts_tokens() {
        let mut buffer = String::from(
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\
             data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n\
             data: [DONE]\n",
        );
        let tokens = drain_sse_buffer(&mut buffer);
        assert_eq!(tokens, vec!["Hel", "lo"]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_drain_sse_buffer_keeps_partial_line() {
        let mut buffer = String::from("data: {\"choices\":[{\"delta\":{\"content\":\"x\"}}]}\ndata: {\"par");
        let tokens = drain_sse_buffer(&mut buffer);
        assert_eq!(tokens, vec!["x"]);
        assert_eq!(buffer, "data: {\"par");
    }

    #[test]
    fn test_custom_base_url_trailing_slash() {
        let client = OpenAiCompatibleClient::new(Some("http://localhost:8000/v1/".into()), None);
        assert_eq!(
            client.completions_url(),
            "http://localhost:8000/v1/chat/completions"
        );
    }
}
