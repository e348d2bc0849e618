//! Streaming client for OpenAI-compatible chat completion endpoints.

use crate::interfaces::{FragmentStream, ModelCapability, ModelRequest, RuntimeError};
use crate::types::{Fragment, Message, Role, TokenUsage, ToolCallRequest};
use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Key under which unparseable tool-call arguments are preserved.
pub const RAW_ARGUMENTS_KEY: &str = "_raw";

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<String>,
    stream: bool,
    stream_options: StreamOptions,
}

#[derive(Debug, Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    #[serde(default)]
    usage: Option<ChunkUsage>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
    #[serde(default)]
    reasoning: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCallDelta>>,
}

#[derive(Debug, Deserialize)]
struct ToolCallDelta {
    #[serde(default)]
    index: usize,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<FunctionDelta>,
}

#[derive(Debug, Deserialize)]
struct FunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChunkUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
    #[serde(default)]
    total_tokens: u64,
}

/// Circuit breaker state.
pub struct CircuitBreaker {
    consecutive_failures: AtomicUsize,
    breaker_open: AtomicBool,
    opened_at: Mutex<Option<Instant>>,
    failure_threshold: usize,
    cooldown_duration: Duration,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: usize, cooldown_duration: Duration) -> Self {
        Self {
            consecutive_failures: AtomicUsize::new(0),
            breaker_open: AtomicBool::new(false),
            opened_at: Mutex::new(None),
            failure_threshold,
            cooldown_duration,
        }
    }

    pub fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::SeqCst);
        self.breaker_open.store(false, Ordering::SeqCst);
        *self.opened_at.lock() = None;
    }

    pub fn record_failure(&self) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        if failures >= self.failure_threshold {
            self.breaker_open.store(true, Ordering::SeqCst);
            *self.opened_at.lock() = Some(Instant::now());
        }
    }

    pub fn should_allow_request(&self) -> Result<(), RuntimeError> {
        if !self.breaker_open.load(Ordering::SeqCst) {
            return Ok(());
        }

        if let Some(opened_time) = *self.opened_at.lock() {
            if opened_time.elapsed() >= self.cooldown_duration {
                // Allow trial request
                return Ok(());
            }
        }

        Err(RuntimeError::LLMError(
            "Circuit breaker open: LLM service unavailable".to_string(),
        ))
    }
}

/// Server-sent event payloads relevant to chat streaming.
#[derive(Debug, Clone, PartialEq)]
pub enum SseEvent {
    Data(String),
    Done,
}

/// Splits a byte stream into `data:` payloads.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    pub fn push(&mut self, bytes: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(bytes);
        let mut events = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            if let Some(event) = Self::parse_line(&line) {
                events.push(event);
            }
        }
        events
    }

    /// Drain a trailing line that arrived without a newline.
    pub fn finish(&mut self) -> Option<SseEvent> {
        let line = std::mem::take(&mut self.buffer);
        Self::parse_line(&line)
    }

    fn parse_line(line: &[u8]) -> Option<SseEvent> {
        let line = String::from_utf8_lossy(line);
        let payload = line.trim().strip_prefix("data:")?.trim();
        if payload.is_empty() {
            return None;
        }
        if payload == "[DONE]" {
            return Some(SseEvent::Done);
        }
        Some(SseEvent::Data(payload.to_string()))
    }
}

#[derive(Debug, Default)]
struct PartialCall {
    id: Option<String>,
    name: String,
    arguments: String,
}

/// Turns chat chunks into fragments, joining tool-call deltas by index.
#[derive(Debug, Default)]
pub struct ChunkAssembler {
    pending: BTreeMap<usize, PartialCall>,
}

impl ChunkAssembler {
    /// Decode one `data:` payload.
    pub fn apply_payload(&mut self, payload: &str) -> Result<Vec<Fragment>, RuntimeError> {
        let chunk: StreamChunk = serde_json::from_str(payload)
            .map_err(|e| RuntimeError::LLMError(format!("Malformed stream chunk: {}", e)))?;
        Ok(self.apply(chunk))
    }

    fn apply(&mut self, chunk: StreamChunk) -> Vec<Fragment> {
        let mut fragments = Vec::new();

        for choice in chunk.choices {
            let delta = choice.delta;
            if let Some(reasoning) = delta.reasoning_content.or(delta.reasoning) {
                if !reasoning.is_empty() {
                    fragments.push(Fragment::Reasoning(reasoning));
                }
            }
            if let Some(content) = delta.content {
                if !content.is_empty() {
                    fragments.push(Fragment::Text(content));
                }
            }
            for call in delta.tool_calls.unwrap_or_default() {
                let entry = self.pending.entry(call.index).or_default();
                if let Some(id) = call.id {
                    entry.id = Some(id);
                }
                if let Some(function) = call.function {
                    if let Some(name) = function.name {
                        entry.name.push_str(&name);
                    }
                    if let Some(arguments) = function.arguments {
                        entry.arguments.push_str(&arguments);
                    }
                }
            }
            if choice.finish_reason.is_some() {
                fragments.extend(self.flush());
            }
        }

        if let Some(usage) = chunk.usage {
            let total = if usage.total_tokens > 0 {
                usage.total_tokens
            } else {
                usage.prompt_tokens + usage.completion_tokens
            };
            fragments.push(Fragment::Usage(TokenUsage {
                prompt_tokens: usage.prompt_tokens,
                completion_tokens: usage.completion_tokens,
                total_tokens: total,
            }));
        }

        fragments
    }

    /// Emit every pending tool call in index order.
    pub fn flush(&mut self) -> Vec<Fragment> {
        std::mem::take(&mut self.pending)
            .into_values()
            .map(|call| {
                Fragment::ToolCall(ToolCallRequest {
                    id: call
                        .id
                        .unwrap_or_else(|| format!("call_{}", uuid::Uuid::new_v4().simple())),
                    name: call.name,
                    arguments: parse_arguments(&call.arguments),
                })
            })
            .collect()
    }
}

/// Parse streamed tool arguments, keeping unparseable text under `_raw`.
pub fn parse_arguments(raw: &str) -> Value {
    if raw.trim().is_empty() {
        return json!({});
    }
    match serde_json::from_str::<Value>(raw) {
        Ok(value @ Value::Object(_)) => value,
        _ => json!({ RAW_ARGUMENTS_KEY: raw }),
    }
}

fn arguments_to_wire(arguments: &Value) -> String {
    if let Some(map) = arguments.as_object() {
        if map.len() == 1 {
            if let Some(Value::String(raw)) = map.get(RAW_ARGUMENTS_KEY) {
                return raw.clone();
            }
        }
    }
    arguments.to_string()
}

/// Convert the conversation to OpenAI chat messages.
pub fn to_openai_messages(system_prompt: &str, messages: &[Message]) -> Vec<Value> {
    let mut out = Vec::with_capacity(messages.len() + 1);
    if !system_prompt.is_empty() {
        out.push(json!({"role": "system", "content": system_prompt}));
    }

    for msg in messages {
        let value = match msg.role {
            Role::Assistant if !msg.tool_calls.is_empty() => {
                let calls: Vec<Value> = msg
                    .tool_calls
                    .iter()
                    .map(|call| {
                        json!({
                            "id": call.id,
                            "type": "function",
                            "function": {
                                "name": call.name,
                                "arguments": arguments_to_wire(&call.arguments),
                            }
                        })
                    })
                    .collect();
                let content = if msg.content.is_empty() {
                    Value::Null
                } else {
                    Value::String(msg.content.clone())
                };
                json!({"role": "assistant", "content": content, "tool_calls": calls})
            }
            Role::Tool => json!({
                "role": "tool",
                "tool_call_id": msg.tool_call_id.clone().unwrap_or_default(),
                "content": msg.content,
            }),
            Role::System => json!({"role": "system", "content": msg.content}),
            Role::User => json!({"role": "user", "content": msg.content}),
            Role::Assistant => json!({"role": "assistant", "content": msg.content}),
        };
        out.push(value);
    }
    out
}

/// Readable message for a non-success HTTP status.
pub fn describe_http_failure(status: u16, body: &str, has_api_key: bool) -> String {
    match status {
        401 => {
            if has_api_key {
                format!("Authentication failed. Check your API key. Details: {}", body)
            } else {
                format!("Authentication required (401 Unauthorized). Details: {}", body)
            }
        }
        404 => format!("Invalid endpoint (404 Not Found). Details: {}", body),
        429 => format!("Rate limit exceeded (429 Too Many Requests). Details: {}", body),
        500..=599 => format!("Server error: {}. Details: {}", status, body),
        _ => format!("HTTP error: {}. Details: {}", status, body),
    }
}

fn is_retryable_status(status: u16) -> bool {
    status == 429 || (500..=599).contains(&status)
}

/// Model capability backed by an OpenAI-compatible `/chat/completions` stream.
#[derive(Clone)]
pub struct OpenAiStreamClient {
    base_url: String,
    client: reqwest::Client,
    model: String,
    max_retries: u32,
    circuit_breaker: Arc<CircuitBreaker>,
    api_key: Option<String>,
}

impl OpenAiStreamClient {
    /// Create a new client.
    ///
    /// # Arguments
    /// * `base_url` - Base URL, e.g. `https://api.openai.com/v1`
    /// * `model` - Default model for lanes without an override
    /// * `max_retries` - Retries for opening the stream
    pub fn new(base_url: impl Into<String>, model: impl Into<String>, max_retries: u32) -> Self {
        // No total timeout: a run's stream may legitimately stay open for minutes.
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            base_url: base_url.into(),
            client,
            model: model.into(),
            max_retries,
            circuit_breaker: Arc::new(CircuitBreaker::new(5, Duration::from_secs(30))),
            api_key: None,
        }
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn retry_delay_for_error(&self, attempt: u32, err: &RuntimeError) -> Duration {
        let msg = err.to_string().to_lowercase();
        if msg.contains("rate limit") || msg.contains("429") {
            if let Some(seconds) = extract_retry_seconds(&msg) {
                return Duration::from_secs(seconds.min(90));
            }
            return Duration::from_secs((2_u64.saturating_pow(attempt + 1)).min(30));
        }
        Duration::from_millis((250_u64.saturating_mul(2_u64.saturating_pow(attempt))).min(5000))
    }

    fn build_request(&self, request: &ModelRequest) -> ChatRequest {
        let tools = if request.tools.is_empty() {
            None
        } else {
            Some(request.tools.clone())
        };
        ChatRequest {
            model: request.model.clone().unwrap_or_else(|| self.model.clone()),
            messages: to_openai_messages(&request.system_prompt, &request.messages),
            tool_choice: tools.as_ref().map(|_| "auto".to_string()),
            tools,
            stream: true,
            stream_options: StreamOptions {
                include_usage: true,
            },
        }
    }

    /// Send the request and return the response once headers arrive.
    ///
    /// The second tuple field says whether the failure is worth retrying.
    async fn open_once(&self, body: &ChatRequest) -> Result<reqwest::Response, (RuntimeError, bool)> {
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let mut req_builder = self.client.post(&url).json(body);
        if let Some(api_key) = &self.api_key {
            req_builder = req_builder.header("Authorization", format!("Bearer {}", api_key));
        }

        let response = req_builder.send().await.map_err(|e| {
            if e.is_connect() || e.is_timeout() {
                (RuntimeError::LLMError("Network connection failed".to_string()), true)
            } else {
                (RuntimeError::LLMError(format!("HTTP request failed: {}", e)), true)
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let error_body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read error response".to_string());
            let message = describe_http_failure(status.as_u16(), &error_body, self.api_key.is_some());
            return Err((
                RuntimeError::LLMError(message),
                is_retryable_status(status.as_u16()),
            ));
        }
        Ok(response)
    }

    async fn open_with_retries(&self, body: &ChatRequest) -> Result<reqwest::Response, RuntimeError> {
        let mut last_error = None;

        for attempt in 0..=self.max_retries {
            debug!("Model stream attempt {}/{}", attempt + 1, self.max_retries + 1);

            match self.open_once(body).await {
                Ok(response) => {
                    self.circuit_breaker.record_success();
                    return Ok(response);
                }
                Err((e, retryable)) => {
                    warn!("Model stream failed to open (attempt {}): {}", attempt + 1, e);
                    let delay = self.retry_delay_for_error(attempt, &e);
                    last_error = Some(e);
                    if !retryable {
                        break;
                    }
                    if attempt < self.max_retries {
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        self.circuit_breaker.record_failure();

        Err(RuntimeError::LLMError(
            last_error
                .map(|e| match e {
                    RuntimeError::LLMError(msg) => msg,
                    other => other.to_string(),
                })
                .unwrap_or_else(|| "Unknown error".to_string()),
        ))
    }
}

#[async_trait]
impl ModelCapability for OpenAiStreamClient {
    async fn stream(&self, request: ModelRequest) -> Result<FragmentStream, RuntimeError> {
        self.circuit_breaker.should_allow_request()?;

        let body = self.build_request(&request);
        debug!(
            model = %body.model,
            messages = body.messages.len(),
            tools = request.tools.len(),
            "Opening model stream"
        );
        let response = self.open_with_retries(&body).await?;

        // From here on fragments may already have reached the client, so
        // failures end the turn instead of being retried.
        let stream = async_stream::try_stream! {
            let mut body = response.bytes_stream();
            let mut decoder = SseDecoder::default();
            let mut assembler = ChunkAssembler::default();
            let mut done = false;

            while let Some(chunk) = body.next().await {
                let chunk = chunk
                    .map_err(|e| RuntimeError::LLMError(format!("Model stream interrupted: {}", e)))?;
                for event in decoder.push(&chunk) {
                    match event {
                        SseEvent::Done => done = true,
                        SseEvent::Data(payload) => {
                            for fragment in assembler.apply_payload(&payload)? {
                                yield fragment;
                            }
                        }
                    }
                }
                if done {
                    break;
                }
            }

            if !done {
                if let Some(SseEvent::Data(payload)) = decoder.finish() {
                    for fragment in assembler.apply_payload(&payload)? {
                        yield fragment;
                    }
                }
            }
            for fragment in assembler.flush() {
                yield fragment;
            }
        };

        Ok(Box::pin(stream))
    }
}

fn extract_retry_seconds(msg: &str) -> Option<u64> {
    for token in msg.split(|ch: char| !ch.is_ascii_alphanumeric() && ch != '.') {
        if let Some(stripped) = token.strip_suffix('s') {
            if let Ok(v) = stripped.parse::<u64>() {
                if v > 0 {
                    return Some(v);
                }
            }
        }
    }
    None
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn test_sse_decoder_handles_split_lines() {
        let mut decoder = SseDecoder::default();
        assert!(decoder.push(b"data: {\"a\"").is_empty());
        let events = decoder.push(b":1}\n\ndata: [DONE]\n");
        assert_eq!(
            events,
            vec![SseEvent::Data("{\"a\":1}".to_string()), SseEvent::Done]
        );
    }

    #[test]
    fn test_sse_decoder_ignores_comments_and_events() {
        let mut decoder = SseDecoder::default();
        let events = decoder.push(b": keep-alive\nevent: message\ndata: {}\n");
        assert_eq!(events, vec![SseEvent::Data("{}".to_string())]);
    }

    #[test]
    fn test_sse_decoder_finish_returns_trailing_line() {
        let mut decoder = SseDecoder::default();
        assert!(decoder.push(b"data: {\"x\":2}").is_empty());
        assert_eq!(decoder.finish(), Some(SseEvent::Data("{\"x\":2}".to_string())));
        assert_eq!(decoder.finish(), None);
    }

    #[test]
    fn test_assembler_text_and_reasoning() {
        let mut assembler = ChunkAssembler::default();
        let fragments = assembler
            .apply_payload(r#"{"choices":[{"delta":{"reasoning_content":"hmm","content":"Hi"}}]}"#)
            .unwrap();
        assert_eq!(
            fragments,
            vec![
                Fragment::Reasoning("hmm".to_string()),
                Fragment::Text("Hi".to_string())
            ]
        );
    }

    #[test]
    fn test_assembler_joins_tool_call_deltas() {
        let mut assembler = ChunkAssembler::default();
        let first = assembler
            .apply_payload(
                r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_a","function":{"name":"search","arguments":"{\"q\":"}}]}}]}"#,
            )
            .unwrap();
        assert!(first.is_empty());

        let second = assembler
            .apply_payload(
                r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"\"rust\"}"}}]},"finish_reason":"tool_calls"}]}"#,
            )
            .unwrap();
        assert_eq!(
            second,
            vec![Fragment::ToolCall(ToolCallRequest {
                id: "call_a".to_string(),
                name: "search".to_string(),
                arguments: json!({"q": "rust"}),
            })]
        );
    }

    #[test]
    fn test_assembler_orders_parallel_calls_by_index() {
        let mut assembler = ChunkAssembler::default();
        assembler
            .apply_payload(
                r#"{"choices":[{"delta":{"tool_calls":[
                    {"index":1,"id":"b","function":{"name":"second","arguments":"{}"}},
                    {"index":0,"id":"a","function":{"name":"first","arguments":"{}"}}
                ]}}]}"#,
            )
            .unwrap();
        let names: Vec<String> = assembler
            .flush()
            .into_iter()
            .map(|f| match f {
                Fragment::ToolCall(call) => call.name,
                other => panic!("unexpected fragment {:?}", other),
            })
            .collect();
        assert_eq!(names, vec!["first", "second"]);
    }

    #[test]
    fn test_usage_chunk() {
        let mut assembler = ChunkAssembler::default();
        let fragments = assembler
            .apply_payload(r#"{"choices":[],"usage":{"prompt_tokens":12,"completion_tokens":3}}"#)
            .unwrap();
        assert_eq!(fragments, vec![Fragment::Usage(TokenUsage::new(12, 3))]);
    }

    #[test]
    fn test_malformed_chunk_is_an_error() {
        let mut assembler = ChunkAssembler::default();
        let err = assembler.apply_payload("not json").unwrap_err();
        assert!(err.to_string().contains("Malformed stream chunk"));
    }

    #[test]
    fn test_invalid_arguments_are_kept_raw() {
        assert_eq!(parse_arguments(""), json!({}));
        assert_eq!(parse_arguments(r#"{"a":1}"#), json!({"a": 1}));
        assert_eq!(parse_arguments("{broken"), json!({"_raw": "{broken"}));
        assert_eq!(parse_arguments("[1,2]"), json!({"_raw": "[1,2]"}));
    }

    #[test]
    fn test_message_conversion() {
        let call = ToolCallRequest {
            id: "call_1".to_string(),
            name: "search".to_string(),
            arguments: json!({"q": "x"}),
        };
        let messages = vec![
            Message::user("find x"),
            Message::assistant_with_tools("", vec![call]),
            Message::tool_response("call_1", &json!({"success": true})),
            Message::assistant("found"),
        ];
        let wire = to_openai_messages("be brief", &messages);

        assert_eq!(wire.len(), 5);
        assert_eq!(wire[0], json!({"role": "system", "content": "be brief"}));
        assert_eq!(wire[2]["content"], Value::Null);
        assert_eq!(wire[2]["tool_calls"][0]["function"]["arguments"], r#"{"q":"x"}"#);
        assert_eq!(wire[3]["role"], "tool");
        assert_eq!(wire[3]["tool_call_id"], "call_1");
        assert_eq!(wire[4], json!({"role": "assistant", "content": "found"}));
    }

    #[test]
    fn test_raw_arguments_sent_back_verbatim() {
        assert_eq!(arguments_to_wire(&json!({"_raw": "{broken"})), "{broken");
        assert_eq!(arguments_to_wire(&json!({"a": 1})), r#"{"a":1}"#);
    }

    #[test]
    fn test_request_omits_empty_tool_table() {
        let client = OpenAiStreamClient::new("http://localhost:8000/v1", "gpt-test", 0);
        let request = ModelRequest {
            system_prompt: String::new(),
            messages: vec![Message::user("hi")],
            tools: vec![],
            model: Some("override".to_string()),
        };
        let body = serde_json::to_value(client.build_request(&request)).unwrap();
        assert_eq!(body["model"], "override");
        assert_eq!(body["stream"], true);
        assert_eq!(body["stream_options"]["include_usage"], true);
        assert!(body.get("tools").is_none());
        assert!(body.get("tool_choice").is_none());
    }

    #[test]
    fn test_http_failure_messages() {
        assert!(describe_http_failure(401, "x", true).contains("Check your API key"));
        assert!(describe_http_failure(401, "x", false).contains("Authentication required"));
        assert!(describe_http_failure(429, "x", true).contains("Rate limit"));
        assert!(describe_http_failure(503, "x", true).contains("Server error: 503"));
        assert!(is_retryable_status(429));
        assert!(is_retryable_status(502));
        assert!(!is_retryable_status(400));
    }

    #[test]
    fn test_extract_retry_seconds() {
        assert_eq!(extract_retry_seconds("please retry in 20s."), Some(20));
        assert_eq!(extract_retry_seconds("no hint here"), None);
    }

    #[test]
    fn test_circuit_breaker_opens_after_threshold() {
        let breaker = CircuitBreaker::new(2, Duration::from_secs(30));
        breaker.record_failure();
        assert!(breaker.should_allow_request().is_ok());
        breaker.record_failure();
        assert!(breaker.should_allow_request().is_err());
        breaker.record_success();
        assert!(breaker.should_allow_request().is_ok());
    }

    #[test]
    fn test_circuit_breaker_allows_trial_after_cooldown() {
        let breaker = CircuitBreaker::new(1, Duration::from_millis(0));
        breaker.record_failure();
        assert!(breaker.should_allow_request().is_ok());
    }
}
