//! Mock LLM 客户端（无需 API）
//!
//! - MockLlmClient：回显最后一条 User 消息，未配置后端时用于本地跑通流程
//! - ScriptedLlmClient：按队列返回预设响应并记录请求，测试用

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{stream, StreamExt};

use crate::llm::{ChatRequest, ChatResponse, ChunkStream, LlmClient, LlmError, StreamChunk};
use crate::memory::Role;

fn last_user(request: &ChatRequest) -> &str {
    request
        .messages
        .iter()
        .rev()
        .find(|m| m.role == Role::User)
        .map(|m| m.content.as_str())
        .unwrap_or("(no input)")
}

/// Mock 客户端：回显用户最后一条消息
#[derive(Debug, Default)]
pub struct MockLlmClient;

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, request: &ChatRequest) -> Result<ChatResponse, LlmError> {
        Ok(ChatResponse::text(format!("Echo from Mock: {}", last_user(request))))
    }

    async fn complete_stream(&self, request: &ChatRequest) -> Result<ChunkStream, LlmError> {
        let text = format!("Echo from Mock: {}", last_user(request));
        let mut chunks: Vec<Result<StreamChunk, LlmError>> = text
            .split_inclusive(' ')
            .map(|w| Ok(StreamChunk::TextDelta(w.to_string())))
            .collect();
        chunks.push(Ok(StreamChunk::Done {
            finish_reason: "stop".to_string(),
        }));
        Ok(Box::pin(stream::iter(chunks)))
    }
}

type ScriptedStream = Result<Vec<Result<StreamChunk, LlmError>>, LlmError>;

/// 脚本化客户端：complete 与 complete_stream 各有一条响应队列，队列空时返回空回复
#[derive(Debug, Default)]
pub struct ScriptedLlmClient {
    buffered: Mutex<VecDeque<Result<ChatResponse, LlmError>>>,
    streamed: Mutex<VecDeque<ScriptedStream>>,
    requests: Mutex<Vec<ChatRequest>>,
    complete_delay: Option<Duration>,
    chunk_delay: Option<Duration>,
}

impl ScriptedLlmClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_complete(self, response: ChatResponse) -> Self {
        self.push_complete_result(Ok(response))
    }

    pub fn push_complete_error(self, error: LlmError) -> Self {
        self.push_complete_result(Err(error))
    }

    fn push_complete_result(self, result: Result<ChatResponse, LlmError>) -> Self {
        self.buffered
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(result);
        self
    }

    /// 一段完整的流：按给定片段输出正文，最后附带 Done
    pub fn push_stream(self, fragments: &[&str]) -> Self {
        let mut chunks: Vec<Result<StreamChunk, LlmError>> = fragments
            .iter()
            .map(|f| Ok(StreamChunk::TextDelta(f.to_string())))
            .collect();
        chunks.push(Ok(StreamChunk::Done {
            finish_reason: "stop".to_string(),
        }));
        self.push_stream_chunks(chunks)
    }

    /// 原样输出给定片段（可用于模拟中途断连：不带 Done 或以 Err 结尾）
    pub fn push_stream_chunks(self, chunks: Vec<Result<StreamChunk, LlmError>>) -> Self {
        self.streamed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(Ok(chunks));
        self
    }

    /// 建立流式连接即失败
    pub fn push_stream_error(self, error: LlmError) -> Self {
        self.streamed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(Err(error));
        self
    }

    /// 每次非流式调用前等待
    pub fn with_complete_delay(mut self, delay: Duration) -> Self {
        self.complete_delay = Some(delay);
        self
    }

    /// 流式每个片段前等待
    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = Some(delay);
        self
    }

    /// 已收到的请求（按调用顺序）
    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn record(&self, request: &ChatRequest) {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request.clone());
    }
}

#[async_trait]
impl LlmClient for ScriptedLlmClient {
    async fn complete(&self, request: &ChatRequest) -> Result<ChatResponse, LlmError> {
        self.record(request);
        if let Some(delay) = self.complete_delay {
            tokio::time::sleep(delay).await;
        }
        let next = self
            .buffered
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();
        next.unwrap_or_else(|| Ok(ChatResponse::default()))
    }

    async fn complete_stream(&self, request: &ChatRequest) -> Result<ChunkStream, LlmError> {
        self.record(request);
        let next = self
            .streamed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();
        let chunks = match next {
            Some(scripted) => scripted?,
            None => vec![Ok(StreamChunk::Done {
                finish_reason: "stop".to_string(),
            })],
        };
        match self.chunk_delay {
            Some(delay) => Ok(Box::pin(stream::iter(chunks).then(move |c| async move {
                tokio::time::sleep(delay).await;
                c
            }))),
            None => Ok(Box::pin(stream::iter(chunks))),
        }
    }
}
