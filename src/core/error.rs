//! 编排层错误类型
//!
//! 编排器边界内的已知失败都转成结构化结果（PassFailure / ToolResult.error / 提交告警）；
//! AgentError 只用于违反不变量、配置错误等无法转成结果的情况。

use thiserror::Error;

use crate::core::TurnPhase;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AgentError {
    #[error("Config error: {0}")]
    ConfigError(String),

    #[error("Invalid execution plan: {0}")]
    InvalidPlan(String),

    #[error("Invalid turn transition: {from:?} -> {to:?}")]
    InvalidTransition { from: TurnPhase, to: TurnPhase },
}

/// 记忆存储提交失败
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MemoryStoreError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Commit timed out")]
    Timeout,

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

impl From<std::io::Error> for MemoryStoreError {
    fn from(e: std::io::Error) -> Self {
        MemoryStoreError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for MemoryStoreError {
    fn from(e: serde_json::Error) -> Self {
        MemoryStoreError::Serialization(e.to_string())
    }
}
