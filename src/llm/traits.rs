//! LLM 客户端抽象
//!
//! 所有后端（OpenAI 兼容 / Mock / 测试脚本）实现 LlmClient：complete（非流式，可带工具）、
//! complete_stream（流式片段）。

use std::pin::Pin;

use async_openai::error::OpenAIError;
use async_trait::async_trait;
use futures_util::Stream;
use thiserror::Error;

use crate::llm::{ChatRequest, ChatResponse, StreamChunk};

/// 后端传输错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LlmError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out")]
    Timeout,

    #[error("API error: {0}")]
    Api(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

/// 超时由 Pass 执行器判定；其余传输层错误统一视为网络错误
impl From<OpenAIError> for LlmError {
    fn from(e: OpenAIError) -> Self {
        match e {
            OpenAIError::ApiError(api) => LlmError::Api(api.to_string()),
            OpenAIError::InvalidArgument(msg) => LlmError::InvalidRequest(msg),
            other => LlmError::Network(other.to_string()),
        }
    }
}

pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<StreamChunk, LlmError>> + Send>>;

/// LLM 客户端 trait
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// 非流式完成：返回完整正文与原生工具调用
    async fn complete(&self, request: &ChatRequest) -> Result<ChatResponse, LlmError>;

    /// 流式完成，返回片段流；流以 StreamChunk::Done 结束
    async fn complete_stream(&self, request: &ChatRequest) -> Result<ChunkStream, LlmError>;

    /// 获取累计 token 使用统计：(prompt_tokens, completion_tokens, total_tokens)
    /// 默认返回 (0, 0, 0)，具体实现可覆盖
    fn token_usage(&self) -> (u64, u64, u64) {
        (0, 0, 0)
    }
}
