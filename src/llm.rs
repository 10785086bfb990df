//! Chat model client
//!
//! Talks to any OpenAI-compatible `/chat/completions` endpoint (LM Studio,
//! vLLM, OpenAI itself) with function-calling tools.
//! Uses a long-lived reqwest::Client for connection pooling.

use crate::config::Config;
use crate::error::OrchestrationError;
use crate::Result;
use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, error, info};

//
// ================= Request / Response Types =================
//

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatRole {
    System,
    User,
    Assistant,
    Tool,
}

impl ChatRole {
    fn as_str(&self) -> &'static str {
        match self {
            ChatRole::System => "system",
            ChatRole::User => "user",
            ChatRole::Assistant => "assistant",
            ChatRole::Tool => "tool",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// Raw JSON arguments as the model produced them
    pub arguments: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    fn plain(role: ChatRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: Some(content.into()),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::plain(ChatRole::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::plain(ChatRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::plain(ChatRole::Assistant, content)
    }

    /// Assistant turn that requested tool calls.
    pub fn tool_request(content: Option<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content,
            tool_calls,
            tool_call_id: None,
        }
    }

    pub fn tool_result(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: Some(call_id.into()),
            ..Self::plain(ChatRole::Tool, content)
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    pub system: Option<String>,
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolSpec>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatResponse {
    pub text: String,
    pub tool_calls: Vec<ToolCall>,
    pub finish_reason: Option<String>,
}

/// Anything that can answer a chat request
#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn complete(&self, request: ChatRequest) -> Result<ChatResponse>;
}

//
// ================= OpenAI-Compatible Client =================
//

/// Reusable client (connection-pooled)
pub struct OpenAiClient {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    temperature: f32,
    max_tokens: u32,
}

impl OpenAiClient {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Result<Self> {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(8)
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            model: model.into(),
            temperature: 0.1,
            max_tokens: 2048,
        })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self::new(&config.base_url, &config.api_key, &config.model)?
            .with_temperature(config.temperature)
            .with_max_tokens(config.max_tokens))
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn to_api_request(&self, request: ChatRequest) -> ApiRequest {
        let tools = if request.tools.is_empty() {
            None
        } else {
            Some(
                request
                    .tools
                    .into_iter()
                    .map(|tool| ApiTool {
                        tool_type: "function".to_string(),
                        function: ApiFunctionDef {
                            name: tool.name,
                            description: tool.description,
                            parameters: tool.parameters,
                        },
                    })
                    .collect(),
            )
        };

        let mut messages = Vec::with_capacity(request.messages.len() + 1);
        if let Some(system) = request.system {
            messages.push(ApiMessage::from(ChatMessage::plain(ChatRole::System, system)));
        }
        messages.extend(request.messages.into_iter().map(ApiMessage::from));

        ApiRequest {
            model: self.model.clone(),
            messages,
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            tools,
        }
    }
}

#[async_trait]
impl ChatModel for OpenAiClient {
    async fn complete(&self, request: ChatRequest) -> Result<ChatResponse> {
        let url = format!("{}/chat/completions", self.base_url);
        let payload = self.to_api_request(request);

        debug!(
            model = %self.model,
            messages = payload.messages.len(),
            tools = payload.tools.as_ref().map(Vec::len).unwrap_or(0),
            "Calling chat completions"
        );

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await
            .map_err(|e| {
                error!("Chat completion request failed: {}", e);
                OrchestrationError::LlmError(format!("request to {} failed: {}", url, e))
            })?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            error!(%status, "Chat completion error response: {}", error_text);
            let detail = serde_json::from_str::<ApiErrorEnvelope>(&error_text)
                .map(|e| e.error.message)
                .unwrap_or(error_text);
            return Err(OrchestrationError::LlmError(format!(
                "model endpoint returned {}: {}",
                status, detail
            )));
        }

        let body: ApiResponse = response.json().await.map_err(|e| {
            error!("Failed to parse chat completion: {}", e);
            OrchestrationError::LlmError(format!("parse error: {}", e))
        })?;

        let choice = body
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| OrchestrationError::LlmError("empty choices".to_string()))?;

        let tool_calls: Vec<ToolCall> = choice
            .message
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(|call| ToolCall {
                id: call.id,
                name: call.function.name,
                arguments: call.function.arguments,
            })
            .collect();

        info!(
            finish_reason = ?choice.finish_reason,
            tool_calls = tool_calls.len(),
            "Chat completion received"
        );

        Ok(ChatResponse {
            text: choice.message.content.unwrap_or_default(),
            tool_calls,
            finish_reason: choice.finish_reason,
        })
    }
}

//
// ================= Wire Format =================
//

#[derive(Debug, Serialize)]
struct ApiRequest {
    model: String,
    messages: Vec<ApiMessage>,
    temperature: f32,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<ApiTool>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiMessage {
    role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<ApiToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

impl From<ChatMessage> for ApiMessage {
    fn from(message: ChatMessage) -> Self {
        let tool_calls = if message.tool_calls.is_empty() {
            None
        } else {
            Some(
                message
                    .tool_calls
                    .into_iter()
                    .map(|call| ApiToolCall {
                        id: call.id,
                        call_type: "function".to_string(),
                        function: ApiToolFunctionCall {
                            name: call.name,
                            arguments: call.arguments,
                        },
                    })
                    .collect(),
            )
        };

        Self {
            role: message.role.as_str().to_string(),
            content: message.content,
            tool_calls,
            tool_call_id: message.tool_call_id,
        }
    }
}

#[derive(Debug, Serialize)]
struct ApiTool {
    #[serde(rename = "type")]
    tool_type: String,
    function: ApiFunctionDef,
}

#[derive(Debug, Serialize)]
struct ApiFunctionDef {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiToolCall {
    id: String,
    #[serde(rename = "type", default = "function_type")]
    call_type: String,
    function: ApiToolFunctionCall,
}

fn function_type() -> String {
    "function".to_string()
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiToolFunctionCall {
    name: String,
    #[serde(default)]
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    choices: Vec<ApiChoice>,
}

#[derive(Debug, Deserialize)]
struct ApiChoice {
    message: ApiMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorEnvelope {
    error: ApiErrorBody,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    message: String,
}

//
// ================= Output Filtering =================
//

lazy_static! {
    static ref THINK_BLOCK: Regex = Regex::new(r"(?s)<think>.*?</think>").unwrap();
    static ref SUPERVISOR_HANDOFF: Regex =
        Regex::new(r"(?s)Transferring back to supervisor.*?supervisor").unwrap();
}

/// Strip reasoning blocks and hand-off chatter from model output.
pub fn filter_response(text: &str) -> String {
    let without_think = THINK_BLOCK.replace_all(text, "");
    SUPERVISOR_HANDOFF
        .replace_all(&without_think, "")
        .trim()
        .to_string()
}

//
// ================= Scripted Model =================
//

/// Chat model that replays canned responses in order (for testing)
pub struct ScriptedModel {
    responses: Mutex<VecDeque<Result<ChatResponse>>>,
    requests: Mutex<Vec<ChatRequest>>,
}

impl ScriptedModel {
    pub fn new(responses: Vec<Result<ChatResponse>>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Model answering every call, in order, with plain text.
    pub fn replies(texts: &[&str]) -> Self {
        Self::new(
            texts
                .iter()
                .map(|text| {
                    Ok(ChatResponse {
                        text: text.to_string(),
                        tool_calls: Vec::new(),
                        finish_reason: Some("stop".to_string()),
                    })
                })
                .collect(),
        )
    }

    /// Requests seen so far
    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ChatModel for ScriptedModel {
    async fn complete(&self, request: ChatRequest) -> Result<ChatResponse> {
        if let Ok(mut seen) = self.requests.lock() {
            seen.push(request);
        }

        let next = self
            .responses
            .lock()
            .map_err(|_| OrchestrationError::LlmError("script lock poisoned".to_string()))?
            .pop_front();

        next.unwrap_or_else(|| {
            Err(OrchestrationError::LlmError(
                "scripted model has no responses left".to_string(),
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_serialization() {
        let client = OpenAiClient::new("http://localhost:1234/v1/", "key", "test-model").unwrap();
        let request = ChatRequest {
            system: Some("You are a math expert".to_string()),
            messages: vec![
                ChatMessage::user("What is 2 + 2?"),
                ChatMessage::tool_request(
                    None,
                    vec![ToolCall {
                        id: "call_1".to_string(),
                        name: "calculator".to_string(),
                        arguments: r#"{"expression":"2 + 2"}"#.to_string(),
                    }],
                ),
                ChatMessage::tool_result("call_1", "4"),
            ],
            tools: vec![ToolSpec {
                name: "calculator".to_string(),
                description: "Evaluate arithmetic".to_string(),
                parameters: serde_json::json!({"type": "object"}),
            }],
        };

        let json = serde_json::to_value(client.to_api_request(request)).unwrap();
        assert_eq!(client.base_url, "http://localhost:1234/v1");
        assert_eq!(json["model"], "test-model");
        assert_eq!(json["messages"][0]["role"], "system");
        assert_eq!(json["messages"][2]["tool_calls"][0]["function"]["name"], "calculator");
        assert!(json["messages"][2].get("content").is_none());
        assert_eq!(json["messages"][3]["role"], "tool");
        assert_eq!(json["messages"][3]["tool_call_id"], "call_1");
        assert_eq!(json["tools"][0]["type"], "function");
    }

    #[test]
    fn test_tools_omitted_when_empty() {
        let client = OpenAiClient::new("http://localhost", "key", "m").unwrap();
        let json = serde_json::to_value(client.to_api_request(ChatRequest::default())).unwrap();
        assert!(json.get("tools").is_none());
    }

    #[test]
    fn test_filter_response() {
        let raw = "<think>let me think\nabout it</think>The change is 14.1%.";
        assert_eq!(filter_response(raw), "The change is 14.1%.");

        let raw = "Answer: 5\nTransferring back to supervisor... handing off to supervisor";
        assert_eq!(filter_response(raw), "Answer: 5");

        assert_eq!(filter_response("  plain  "), "plain");
    }

    #[tokio::test]
    async fn test_scripted_model_replays_in_order() {
        let model = ScriptedModel::replies(&["first", "second"]);
        let a = model.complete(ChatRequest::default()).await.unwrap();
        let b = model.complete(ChatRequest::default()).await.unwrap();
        assert_eq!(a.text, "first");
        assert_eq!(b.text, "second");
        assert!(model.complete(ChatRequest::default()).await.is_err());
        assert_eq!(model.requests().len(), 3);
    }
}
