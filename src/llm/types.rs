//! 后端请求 / 响应类型
//!
//! 与具体 API 无关：一组消息、可选的工具声明、是否流式；响应为完整消息（文本 + 原生工具调用）
//! 或流式片段序列（以 Done 结束）。

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::memory::Message;
use crate::tools::ToolCall;

/// 工具声明：名称、描述、JSON Schema 参数
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDeclaration {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// 一次后端调用的请求
#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    pub messages: Vec<Message>,
    /// 为空表示不挂载工具
    pub tools: Vec<ToolDeclaration>,
    pub stream: bool,
}

impl ChatRequest {
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            messages,
            ..Self::default()
        }
    }

    pub fn with_tools(mut self, tools: Vec<ToolDeclaration>) -> Self {
        self.tools = tools;
        self
    }

    pub fn streaming(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }

    pub fn has_tools(&self) -> bool {
        !self.tools.is_empty()
    }
}

/// 非流式响应：正文与原生工具调用
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatResponse {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
}

impl ChatResponse {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            tool_calls: Vec::new(),
        }
    }

    pub fn with_tool_calls(mut self, calls: Vec<ToolCall>) -> Self {
        self.tool_calls = calls;
        self
    }
}

/// 流式片段
#[derive(Debug, Clone, PartialEq)]
pub enum StreamChunk {
    /// 一段正文
    TextDelta(String),
    /// 原生工具调用增量（OpenAI 流式格式按 index 拼接）
    ToolCallDelta {
        index: usize,
        id: Option<String>,
        name: Option<String>,
        arguments_delta: String,
    },
    /// 完成标记；没有它就结束的流视为断连
    Done { finish_reason: String },
}
