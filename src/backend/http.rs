use super::{GenerationBackend, GenerationRequest};
use crate::config::{HttpBackendConfig, RequestSchema};
use crate::error::{Error, Result};
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::Serialize;
use serde_json::Value;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Remote generation over a single HTTP POST.
#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: Client,
    endpoint: String,
    model: Option<String>,
    schema: RequestSchema,
    headers: HeaderMap,
    timeout: Duration,
}

// ---------------------------------------------------------------------------
// Request shapes
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct ChatRequest<'a> {
    messages: Vec<ChatMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<&'a str>,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Serialize)]
struct SimpleRequest<'a> {
    system: &'a str,
    user: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<&'a str>,
}

// ---------------------------------------------------------------------------
// Response-text extraction
// ---------------------------------------------------------------------------

/// A named, pure lookup from a decoded response body to generated text.
pub type ExtractionStrategy = (&'static str, fn(&Value) -> Option<String>);

/// Tried in order; the first strategy yielding text wins.
pub const EXTRACTION_STRATEGIES: &[ExtractionStrategy] = &[
    ("choices[0].message.content", chat_message_content),
    ("choices[0].text", chat_choice_text),
    ("output_text", output_text),
    ("data", data),
    ("result", result),
    ("output", output),
    ("output.text", nested_output_text),
];

fn first_choice(body: &Value) -> Option<&Value> {
    body.get("choices")?.as_array()?.first()
}

fn chat_message_content(body: &Value) -> Option<String> {
    let content = first_choice(body)?.get("message")?.get("content")?.as_str()?;
    non_empty(content)
}

fn chat_choice_text(body: &Value) -> Option<String> {
    first_choice(body)?.get("text")?.as_str().map(str::to_string)
}

/// A string, or the first element of a sequence when that element is a string.
fn flat_field(body: &Value, key: &str) -> Option<String> {
    match body.get(key)? {
        Value::String(s) => Some(s.clone()),
        Value::Array(items) => items.first()?.as_str().map(str::to_string),
        _ => None,
    }
}

fn output_text(body: &Value) -> Option<String> {
    flat_field(body, "output_text")
}

fn data(body: &Value) -> Option<String> {
    flat_field(body, "data")
}

fn result(body: &Value) -> Option<String> {
    flat_field(body, "result")
}

fn output(body: &Value) -> Option<String> {
    flat_field(body, "output")
}

fn nested_output_text(body: &Value) -> Option<String> {
    body.get("output")?.get("text")?.as_str().map(str::to_string)
}

fn non_empty(s: &str) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}

/// Run [`EXTRACTION_STRATEGIES`] over `body`, returning the winning strategy
/// name and its trimmed text.
pub fn extract_generated_text(body: &Value) -> Option<(&'static str, String)> {
    EXTRACTION_STRATEGIES
        .iter()
        .find_map(|(name, strategy)| strategy(body).map(|text| (*name, text.trim().to_string())))
}

// ---------------------------------------------------------------------------
// Backend
// ---------------------------------------------------------------------------

impl HttpBackend {
    pub fn from_config(config: &HttpBackendConfig) -> Result<Self> {
        if config.endpoint.trim().is_empty() {
            return Err(Error::Configuration(
                "http backend requires an endpoint".to_string(),
            ));
        }

        let mut headers = HeaderMap::new();
        for (key, value) in &config.headers {
            let name = HeaderName::from_bytes(key.as_bytes())
                .map_err(|e| Error::Configuration(format!("invalid header `{}`: {}", key, e)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| Error::Configuration(format!("invalid header `{}`: {}", key, e)))?;
            headers.insert(name, value);
        }
        if !headers.contains_key(AUTHORIZATION) {
            if let Some(key) = config.resolve_api_key() {
                let value = HeaderValue::from_str(&format!("Bearer {}", key)).map_err(|_| {
                    Error::Configuration("API key contains invalid header characters".to_string())
                })?;
                headers.insert(AUTHORIZATION, value);
            }
        }
        if !headers.contains_key(CONTENT_TYPE) {
            headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        }

        let timeout = config.timeout();
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Configuration(format!("cannot build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            model: config.model.clone(),
            schema: config.schema,
            headers,
            timeout,
        })
    }

    fn body(&self, request: &GenerationRequest) -> Result<Vec<u8>> {
        let model = self.model.as_deref();
        let body = match self.schema {
            RequestSchema::Chat => {
                let mut messages = Vec::with_capacity(2);
                if !request.system_instruction.is_empty() {
                    messages.push(ChatMessage {
                        role: "system",
                        content: &request.system_instruction,
                    });
                }
                messages.push(ChatMessage {
                    role: "user",
                    content: &request.task_instruction,
                });
                serde_json::to_vec(&ChatRequest { messages, model })?
            }
            RequestSchema::Simple => serde_json::to_vec(&SimpleRequest {
                system: &request.system_instruction,
                user: &request.task_instruction,
                model,
            })?,
        };
        Ok(body)
    }
}

impl GenerationBackend for HttpBackend {
    fn name(&self) -> &'static str {
        "http"
    }

    fn generate(&self, request: &GenerationRequest) -> Result<String> {
        let body = self.body(request)?;
        let start = Instant::now();

        let resp = self
            .client
            .post(&self.endpoint)
            .headers(self.headers.clone())
            .body(body)
            .send()
            .map_err(|e| {
                if e.is_timeout() {
                    Error::timeout(format!("POST {}", self.endpoint), self.timeout)
                } else {
                    Error::backend(format!("POST {} failed: {}", self.endpoint, e))
                }
            })?;

        let status = resp.status().as_u16();
        let text = resp.text().map_err(|e| {
            if e.is_timeout() {
                Error::timeout(format!("POST {}", self.endpoint), self.timeout)
            } else {
                Error::backend(format!("failed to read response body: {}", e))
            }
        })?;
        let latency_ms = start.elapsed().as_millis() as u64;
        debug!(endpoint = %self.endpoint, status, latency_ms, "generation response");

        if status >= 400 {
            warn!(status, "generation endpoint returned an error status");
            return Err(Error::backend_with_body(format!("HTTP {}", status), text));
        }

        let parsed: Value = serde_json::from_str(&text)
            .map_err(|_| Error::backend_with_body("response body is not JSON", text.clone()))?;

        match extract_generated_text(&parsed) {
            Some((strategy, content)) => {
                debug!(strategy, chars = content.len(), "extracted generated text");
                Ok(content)
            }
            None => Err(Error::backend_with_body(
                "no generated text in response",
                text,
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::thread::{self, JoinHandle};

    /// Serve exactly one HTTP response, returning the raw request text.
    fn serve_once(status: u16, body: &str) -> (String, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}/v1/generate", listener.local_addr().unwrap());
        let body = body.to_string();
        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut raw = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = stream.read(&mut buf).unwrap();
                if n == 0 {
                    break;
                }
                raw.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&raw).to_string();
                if let Some(header_end) = text.find("\r\n\r\n") {
                    let content_length = text[..header_end]
                        .lines()
                        .find_map(|l| {
                            let (k, v) = l.split_once(':')?;
                            k.eq_ignore_ascii_case("content-length")
                                .then(|| v.trim().parse::<usize>().ok())
                                .flatten()
                        })
                        .unwrap_or(0);
                    if raw.len() >= header_end + 4 + content_length {
                        break;
                    }
                }
            }
            let response = format!(
                "HTTP/1.1 {} X\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                status,
                body.len(),
                body
            );
            stream.write_all(response.as_bytes()).unwrap();
            String::from_utf8_lossy(&raw).to_string()
        });
        (url, handle)
    }

    fn backend(endpoint: &str, schema: RequestSchema, api_key: Option<&str>) -> HttpBackend {
        HttpBackend::from_config(&HttpBackendConfig {
            endpoint: endpoint.to_string(),
            model: Some("qwen2.5-coder".to_string()),
            schema,
            api_key: api_key.map(str::to_string),
            api_key_env: String::new(),
            timeout_secs: 10.0,
            ..HttpBackendConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn strategies_cover_chat_and_flat_shapes() {
        let cases = [
            (json!({"choices": [{"message": {"content": "X"}}]}), "X"),
            (json!({"choices": [{"text": " T "}]}), "T"),
            (json!({"output_text": "Y"}), "Y"),
            (json!({"data": ["first", "second"]}), "first"),
            (json!({"result": "R"}), "R"),
            (json!({"output": "O"}), "O"),
            (json!({"output": {"text": "N"}}), "N"),
        ];
        for (body, expected) in cases {
            let (_, text) = extract_generated_text(&body).unwrap();
            assert_eq!(text, expected, "body: {body}");
        }
    }

    #[test]
    fn empty_chat_content_falls_through_to_later_strategies() {
        let body = json!({"choices": [{"message": {"content": ""}}], "output_text": "fallback"});
        let (strategy, text) = extract_generated_text(&body).unwrap();
        assert_eq!(strategy, "output_text");
        assert_eq!(text, "fallback");
    }

    #[test]
    fn unrecognized_shapes_yield_nothing() {
        assert!(extract_generated_text(&json!({"answer": "nope"})).is_none());
        assert!(extract_generated_text(&json!({"data": [1, 2]})).is_none());
        assert!(extract_generated_text(&json!(["not", "an", "object"])).is_none());
    }

    #[test]
    fn chat_schema_round_trip_returns_message_content() {
        let (url, server) = serve_once(200, r#"{"choices":[{"message":{"content":"X"}}]}"#);
        let out = backend(&url, RequestSchema::Chat, Some("sk-test"))
            .generate(&GenerationRequest::new("sys", "write tests"))
            .unwrap();
        assert_eq!(out, "X");

        let request = server.join().unwrap();
        assert!(request.starts_with("POST /v1/generate"));
        assert!(request.to_lowercase().contains("authorization: bearer sk-test"));
        let body = &request[request.find("\r\n\r\n").unwrap() + 4..];
        let body: Value = serde_json::from_str(body).unwrap();
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "write tests");
        assert_eq!(body["model"], "qwen2.5-coder");
    }

    #[test]
    fn simple_schema_sends_flat_body() {
        let (url, server) = serve_once(200, r#"{"output_text":"Y"}"#);
        let out = backend(&url, RequestSchema::Simple, None)
            .generate(&GenerationRequest::new("sys", "user"))
            .unwrap();
        assert_eq!(out, "Y");

        let request = server.join().unwrap();
        assert!(!request.to_lowercase().contains("authorization:"));
        let body = &request[request.find("\r\n\r\n").unwrap() + 4..];
        let body: Value = serde_json::from_str(body).unwrap();
        assert_eq!(body["system"], "sys");
        assert_eq!(body["user"], "user");
    }

    #[test]
    fn unknown_body_is_backend_error_with_literal_body() {
        let raw = r#"{"unexpected":{"shape":true}}"#;
        let (url, server) = serve_once(200, raw);
        let err = backend(&url, RequestSchema::Chat, None)
            .generate(&GenerationRequest::new("", "u"))
            .unwrap_err();
        server.join().unwrap();
        assert!(matches!(err, Error::Backend { .. }));
        assert!(err.to_string().contains(raw));
    }

    #[test]
    fn error_status_is_backend_error() {
        let (url, server) = serve_once(503, r#"{"error":"overloaded"}"#);
        let err = backend(&url, RequestSchema::Chat, None)
            .generate(&GenerationRequest::new("", "u"))
            .unwrap_err();
        server.join().unwrap();
        let rendered = err.to_string();
        assert!(rendered.contains("HTTP 503"));
        assert!(rendered.contains("overloaded"));
    }

    #[test]
    fn non_json_body_is_backend_error() {
        let (url, server) = serve_once(200, "<html>gateway</html>");
        let err = backend(&url, RequestSchema::Chat, None)
            .generate(&GenerationRequest::new("", "u"))
            .unwrap_err();
        server.join().unwrap();
        assert!(err.to_string().contains("<html>gateway</html>"));
    }
}
