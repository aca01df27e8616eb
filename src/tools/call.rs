//! 规范化的工具调用与结果
//!
//! 无论后端原生返回 JSON tool_calls，还是在正文里输出标签式调用，最终都统一为 ToolCall；
//! Dispatcher 只认 ToolCall，产出 ToolResult。

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// 生成新的调用 ID（后端未提供时使用）
pub fn new_call_id() -> String {
    format!("call_{}", uuid::Uuid::new_v4().simple())
}

/// 一次工具调用：id 在单个 TurnRecord 内唯一
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub arguments: Map<String, Value>,
}

impl ToolCall {
    /// 以新生成的 id 创建
    pub fn new(name: impl Into<String>, arguments: Map<String, Value>) -> Self {
        Self {
            id: new_call_id(),
            name: name.into(),
            arguments,
        }
    }

    pub fn with_id(id: impl Into<String>, name: impl Into<String>, arguments: Map<String, Value>) -> Self {
        let id = id.into();
        Self {
            id: if id.is_empty() { new_call_id() } else { id },
            name: name.into(),
            arguments,
        }
    }

    /// 名称与参数完全一致即视为同一操作（忽略 id 与参数顺序）
    pub fn same_operation(&self, other: &ToolCall) -> bool {
        self.name == other.name && self.arguments == other.arguments
    }

    /// 参数的 JSON 字符串形式（OpenAI 格式要求 arguments 为字符串）
    pub fn arguments_json(&self) -> String {
        Value::Object(self.arguments.clone()).to_string()
    }
}

/// 工具执行结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub call_id: String,
    pub tool: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolResult {
    pub fn ok(call: &ToolCall, data: Value) -> Self {
        Self {
            call_id: call.id.clone(),
            tool: call.name.clone(),
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn failed(call: &ToolCall, error: impl Into<String>) -> Self {
        Self {
            call_id: call.id.clone(),
            tool: call.name.clone(),
            success: false,
            data: None,
            error: Some(error.into()),
        }
    }

    /// 写回对话的 tool 消息内容
    pub fn to_message_content(&self) -> String {
        match (&self.data, &self.error) {
            (Some(Value::String(s)), _) if self.success => s.clone(),
            (Some(v), _) if self.success => v.to_string(),
            (_, Some(e)) => format!("Error: {}", e),
            _ => String::new(),
        }
    }
}
