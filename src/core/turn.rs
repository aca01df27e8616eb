//! 轮次数据：PassOutcome、TurnRecord 与按调用 id 去重的分发账本
//!
//! TurnRecord 在轮次开始时创建，由编排器独占并随通道 / 工具完成而更新，
//! 提交给记忆存储后不再修改。

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::pipeline::{ExecutionPlan, OperationCategory, PassSpec};
use crate::tools::{ToolCall, ToolResult};

/// 轮次标识，同时作为记忆提交的幂等键
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TurnId(String);

impl TurnId {
    pub fn new() -> Self {
        Self(format!("turn_{}", uuid::Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TurnId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for TurnId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl std::fmt::Display for TurnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// 通道失败类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// 连接 / HTTP / 解码错误
    Transport,
    /// 请求或流空闲超时
    Timeout,
    /// 流在完成标记前中断
    Disconnected,
    /// 调用方断开或主动取消
    Cancelled,
    /// 副作用通道超过等待上限被放弃
    Abandoned,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PassFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl PassFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for PassFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

/// 单个通道的结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PassOutcome {
    pub spec: PassSpec,
    pub text: String,
    pub tool_calls: Vec<ToolCall>,
    pub finished: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<PassFailure>,
}

impl PassOutcome {
    pub fn finished(spec: PassSpec, text: String, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            spec,
            text,
            tool_calls,
            finished: true,
            failure: None,
        }
    }

    /// 失败结果；text 保留已收到的部分（流式中途断连时仍可展示）
    pub fn failed(spec: PassSpec, partial_text: String, failure: PassFailure) -> Self {
        Self {
            spec,
            text: partial_text,
            tool_calls: Vec::new(),
            finished: false,
            failure: Some(failure),
        }
    }

    pub fn is_failed(&self) -> bool {
        self.failure.is_some()
    }
}

/// 一轮的持久化记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnRecord {
    pub turn_id: TurnId,
    pub user_message: String,
    pub category: OperationCategory,
    pub plan: ExecutionPlan,
    pub pass_outcomes: Vec<PassOutcome>,
    pub tool_results: Vec<ToolResult>,
    pub final_visible_text: String,
    pub committed: bool,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl TurnRecord {
    pub fn new(turn_id: TurnId, user_message: impl Into<String>, category: OperationCategory, plan: ExecutionPlan) -> Self {
        Self {
            turn_id,
            user_message: user_message.into(),
            category,
            plan,
            pass_outcomes: Vec::new(),
            tool_results: Vec::new(),
            final_visible_text: String::new(),
            committed: false,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    /// 某个工具（按名称）是否有成功结果
    pub fn has_successful(&self, tool: &str) -> bool {
        self.tool_results.iter().any(|r| r.tool == tool && r.success)
    }
}

/// 分发账本：同一轮内按调用 id 去重，重复投递直接返回首次的结果
#[derive(Debug, Default)]
pub struct DispatchLedger {
    results: HashMap<String, ToolResult>,
}

impl DispatchLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, call_id: &str) -> Option<&ToolResult> {
        self.results.get(call_id)
    }

    pub fn contains(&self, call_id: &str) -> bool {
        self.results.contains_key(call_id)
    }

    pub fn record(&mut self, result: ToolResult) {
        self.results.entry(result.call_id.clone()).or_insert(result);
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }
}
