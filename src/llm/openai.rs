//! OpenAI 兼容 API 客户端
//!
//! 通过 async_openai 调用任意 OpenAI 兼容端点（可配置 base_url）：llama.cpp server、vLLM、
//! Ollama 的 OpenAI 端点以及远程服务。非流式读取 content 与原生 tool_calls；流式把每个
//! delta 映射为 StreamChunk，finish_reason 视为完成标记。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_openai::config::OpenAIConfig;
use async_openai::error::OpenAIError;
use async_openai::types::chat::{
    ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage, ChatCompletionRequestSystemMessageArgs,
    ChatCompletionRequestToolMessageArgs, ChatCompletionRequestUserMessageArgs, CreateChatCompletionRequest,
    CreateChatCompletionRequestArgs, CreateChatCompletionStreamResponse,
};
use async_openai::Client;
use async_stream::try_stream;
use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use serde_json::{json, Map, Value};

use crate::llm::{ChatRequest, ChatResponse, ChunkStream, LlmClient, LlmError, StreamChunk, ToolDeclaration};
use crate::memory::{Message, Role};
use crate::tools::ToolCall;

/// Token 使用统计（累计值）
#[derive(Debug, Clone, Default)]
pub struct TokenUsage {
    pub prompt_tokens: Arc<AtomicU64>,
    pub completion_tokens: Arc<AtomicU64>,
    pub total_tokens: Arc<AtomicU64>,
}

impl TokenUsage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, prompt: u64, completion: u64) {
        self.prompt_tokens.fetch_add(prompt, Ordering::Relaxed);
        self.completion_tokens.fetch_add(completion, Ordering::Relaxed);
        self.total_tokens.fetch_add(prompt + completion, Ordering::Relaxed);
    }

    pub fn get(&self) -> (u64, u64, u64) {
        (
            self.prompt_tokens.load(Ordering::Relaxed),
            self.completion_tokens.load(Ordering::Relaxed),
            self.total_tokens.load(Ordering::Relaxed),
        )
    }
}

/// OpenAI 兼容客户端：持有 Client 与 model 名
///
/// 请求超时与流式空闲超时由 Pass 执行器统一施加，这里不再单独设置。
pub struct OpenAiClient {
    client: Client<OpenAIConfig>,
    model: String,
    /// 累计 token 使用统计
    pub usage: TokenUsage,
}

impl OpenAiClient {
    pub fn new(base_url: Option<&str>, model: &str, api_key: Option<&str>) -> Self {
        // 本地服务通常不校验 key，但请求头仍需一个值
        let api_key = api_key
            .filter(|k| !k.is_empty())
            .map(String::from)
            .unwrap_or_else(|| "sk-placeholder".to_string());

        let config = match base_url {
            Some(url) => OpenAIConfig::new()
                .with_api_base(url.trim_end_matches('/'))
                .with_api_key(api_key),
            None => OpenAIConfig::new().with_api_key(api_key),
        };

        Self {
            client: Client::with_config(config),
            model: model.to_string(),
            usage: TokenUsage::new(),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn build_request(&self, request: &ChatRequest) -> Result<CreateChatCompletionRequest, LlmError> {
        let mut built = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages(to_openai_messages(&request.messages)?)
            .build()?;
        if request.has_tools() {
            built.tools = Some(from_wire(tool_declarations(&request.tools))?);
        }
        Ok(built)
    }
}

/// 线格式 JSON 转为 async_openai 的请求类型（工具声明、assistant 的 tool_calls）
fn from_wire<T: serde::de::DeserializeOwned>(value: Value) -> Result<T, LlmError> {
    serde_json::from_value(value).map_err(|e| LlmError::InvalidRequest(e.to_string()))
}

fn tool_declarations(tools: &[ToolDeclaration]) -> Value {
    tools
        .iter()
        .map(|t| {
            json!({
                "type": "function",
                "function": {
                    "name": t.name,
                    "description": t.description,
                    "parameters": t.parameters,
                }
            })
        })
        .collect()
}

fn wire_tool_calls(calls: &[ToolCall]) -> Value {
    calls
        .iter()
        .map(|c| {
            json!({
                "id": c.id,
                "type": "function",
                "function": {"name": c.name, "arguments": c.arguments_json()},
            })
        })
        .collect()
}

/// 内部消息转 async_openai 消息
fn to_openai_messages(messages: &[Message]) -> Result<Vec<ChatCompletionRequestMessage>, LlmError> {
    messages
        .iter()
        .map(|m| {
            let msg = match m.role {
                Role::System => ChatCompletionRequestMessage::System(
                    ChatCompletionRequestSystemMessageArgs::default()
                        .content(m.content.clone())
                        .build()?,
                ),
                Role::User => ChatCompletionRequestMessage::User(
                    ChatCompletionRequestUserMessageArgs::default()
                        .content(m.content.clone())
                        .build()?,
                ),
                Role::Assistant => {
                    let mut assistant = ChatCompletionRequestAssistantMessageArgs::default()
                        .content(m.content.clone())
                        .build()?;
                    if !m.tool_calls.is_empty() {
                        if m.content.is_empty() {
                            assistant.content = None;
                        }
                        assistant.tool_calls = Some(from_wire(wire_tool_calls(&m.tool_calls))?);
                    }
                    ChatCompletionRequestMessage::Assistant(assistant)
                }
                Role::Tool => ChatCompletionRequestMessage::Tool(
                    ChatCompletionRequestToolMessageArgs::default()
                        .content(m.content.clone())
                        .tool_call_id(m.tool_call_id.clone().unwrap_or_default())
                        .build()?,
                ),
            };
            Ok(msg)
        })
        .collect()
}

/// 原生 tool_calls 的 arguments 是 JSON 字符串；解析失败时保留原文于 `raw`
pub(crate) fn parse_arguments(tool: &str, raw: &str) -> Map<String, Value> {
    if raw.trim().is_empty() {
        return Map::new();
    }
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => map,
        Ok(other) => {
            let mut map = Map::new();
            map.insert("raw".to_string(), other);
            map
        }
        Err(e) => {
            tracing::warn!(tool, error = %e, "Native tool call arguments are not valid JSON");
            let mut map = Map::new();
            map.insert("raw".to_string(), Value::String(raw.to_string()));
            map
        }
    }
}

/// 按线格式读取响应中的 tool_calls 列表（只取 function 类型）
fn parse_native_tool_calls(calls: &Value) -> Vec<ToolCall> {
    calls
        .as_array()
        .map(|calls| {
            calls
                .iter()
                .filter_map(|call| {
                    let function = call.get("function")?;
                    let name = function.get("name")?.as_str()?;
                    let args = match function.get("arguments") {
                        Some(Value::String(s)) => parse_arguments(name, s),
                        Some(Value::Object(map)) => map.clone(),
                        _ => Map::new(),
                    };
                    match call.get("id").and_then(|v| v.as_str()).filter(|id| !id.is_empty()) {
                        Some(id) => Some(ToolCall::with_id(id, name, args)),
                        None => Some(ToolCall::new(name, args)),
                    }
                })
                .collect()
        })
        .unwrap_or_default()
}

/// 一个流式响应块映射为若干片段
fn stream_chunks(response: CreateChatCompletionStreamResponse) -> Vec<StreamChunk> {
    let mut chunks = Vec::new();
    for choice in response.choices {
        if let Some(text) = choice.delta.content.filter(|t| !t.is_empty()) {
            chunks.push(StreamChunk::TextDelta(text));
        }
        for call in choice.delta.tool_calls.unwrap_or_default() {
            let (name, arguments_delta) = match call.function {
                Some(f) => (f.name, f.arguments.unwrap_or_default()),
                None => (None, String::new()),
            };
            chunks.push(StreamChunk::ToolCallDelta {
                index: call.index as usize,
                id: call.id,
                name,
                arguments_delta,
            });
        }
        if let Some(reason) = choice.finish_reason {
            let finish_reason = serde_json::to_value(reason)
                .ok()
                .and_then(|v| v.as_str().map(String::from))
                .unwrap_or_else(|| "stop".to_string());
            chunks.push(StreamChunk::Done { finish_reason });
        }
    }
    chunks
}

#[async_trait]
impl LlmClient for OpenAiClient {
    fn token_usage(&self) -> (u64, u64, u64) {
        self.usage.get()
    }

    async fn complete(&self, request: &ChatRequest) -> Result<ChatResponse, LlmError> {
        let response = self.client.chat().create(self.build_request(request)?).await?;

        if let Some(usage) = &response.usage {
            self.usage
                .add(usage.prompt_tokens as u64, usage.completion_tokens as u64);
        }

        let message = response
            .choices
            .into_iter()
            .next()
            .map(|c| c.message)
            .ok_or_else(|| LlmError::InvalidResponse("response has no choices".to_string()))?;
        let tool_calls = match &message.tool_calls {
            Some(calls) => parse_native_tool_calls(&serde_json::to_value(calls).unwrap_or_default()),
            None => Vec::new(),
        };

        Ok(ChatResponse {
            content: message.content.unwrap_or_default(),
            tool_calls,
        })
    }

    async fn complete_stream(&self, request: &ChatRequest) -> Result<ChunkStream, LlmError> {
        let upstream = self.client.chat().create_stream(self.build_request(request)?).await?;
        Ok(Box::pin(openai_chunks(upstream)))
    }
}

/// 上游响应流转为片段流；重复的完成标记只保留第一个
fn openai_chunks<S>(mut upstream: S) -> impl Stream<Item = Result<StreamChunk, LlmError>> + Send
where
    S: Stream<Item = Result<CreateChatCompletionStreamResponse, OpenAIError>> + Send + Unpin,
{
    try_stream! {
        let mut done = false;
        while let Some(item) = upstream.next().await {
            for chunk in stream_chunks(item.map_err(LlmError::from)?) {
                if matches!(chunk, StreamChunk::Done { .. }) {
                    if done {
                        continue;
                    }
                    done = true;
                }
                yield chunk;
            }
        }
    }
}
