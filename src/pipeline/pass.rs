//! 通道执行器：按 PassSpec 跑一次后端调用
//!
//! - 流式：逐段转发到 sink 并累积全文；流在 Done 之前结束视为断连，保留已收到的部分
//! - 缓冲：一次拿到完整回复
//! - 带工具：挂载工具声明；原生 tool_calls 与正文里标签式调用合并，同名同参时以原生为准
//!
//! 所有失败都落在 PassOutcome.failure，不向上抛。

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::core::{FailureKind, PassFailure, PassOutcome};
use crate::llm::openai::parse_arguments;
use crate::llm::{ChatRequest, LlmClient, LlmError, StreamChunk, ToolDeclaration};
use crate::memory::Message;
use crate::pipeline::{EventSink, Normalizer, PassSpec, TurnEvent};
use crate::tools::ToolCall;

/// 单次通道调用的输入
pub struct PassRequest<'a> {
    pub spec: PassSpec,
    /// 发给后端的完整消息序列（含 system）
    pub conversation: &'a [Message],
    /// 当前已配置工具的声明；spec.tools_enabled 为 false 时忽略
    pub tools: &'a [ToolDeclaration],
    /// 只有可见通道传入：流式正文发往这里，接收端断开即取消本通道
    pub sink: Option<&'a EventSink>,
    pub cancel: CancellationToken,
}

impl<'a> PassRequest<'a> {
    pub fn new(spec: PassSpec, conversation: &'a [Message], tools: &'a [ToolDeclaration]) -> Self {
        Self {
            spec,
            conversation,
            tools,
            sink: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_sink(mut self, sink: &'a EventSink) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// 流式 tool_call 增量按 index 拼接
#[derive(Default)]
struct PartialCall {
    id: Option<String>,
    name: String,
    arguments: String,
}

#[derive(Clone)]
pub struct PassExecutor {
    llm: Arc<dyn LlmClient>,
    request_timeout: Duration,
    stream_idle: Duration,
}

impl PassExecutor {
    pub fn new(llm: Arc<dyn LlmClient>, request_timeout: Duration, stream_idle: Duration) -> Self {
        Self {
            llm,
            request_timeout,
            stream_idle,
        }
    }

    pub async fn run(&self, req: PassRequest<'_>) -> PassOutcome {
        let spec = req.spec;
        tracing::debug!(streaming = spec.streaming, tools = spec.tools_enabled, purpose = ?spec.purpose, "pass start");
        let outcome = if spec.streaming {
            self.run_streaming(&req).await
        } else {
            self.run_buffered(&req).await
        };
        match &outcome.failure {
            Some(f) => tracing::warn!(purpose = ?spec.purpose, failure = %f, partial_chars = outcome.text.len(), "pass failed"),
            None => tracing::debug!(purpose = ?spec.purpose, calls = outcome.tool_calls.len(), "pass finished"),
        }
        outcome
    }

    fn build_request(&self, req: &PassRequest<'_>) -> ChatRequest {
        let request = ChatRequest::new(req.conversation.to_vec()).streaming(req.spec.streaming);
        if req.spec.tools_enabled {
            request.with_tools(req.tools.to_vec())
        } else {
            request
        }
    }

    async fn run_buffered(&self, req: &PassRequest<'_>) -> PassOutcome {
        let spec = req.spec;
        let request = self.build_request(req);
        let result = tokio::select! {
            biased;
            _ = req.cancel.cancelled() => {
                return PassOutcome::failed(spec, String::new(), PassFailure::new(FailureKind::Cancelled, "cancelled"));
            }
            _ = sink_closed(req.sink) => {
                return PassOutcome::failed(spec, String::new(), PassFailure::new(FailureKind::Cancelled, "caller disconnected"));
            }
            r = timeout(self.request_timeout, self.llm.complete(&request)) => r,
        };
        match result {
            Err(_) => PassOutcome::failed(
                spec,
                String::new(),
                PassFailure::new(FailureKind::Timeout, format!("no response within {}s", self.request_timeout.as_secs())),
            ),
            Ok(Err(e)) => PassOutcome::failed(spec, String::new(), transport_failure(e)),
            Ok(Ok(resp)) => {
                let (text, calls) = self.reconcile(req, resp.content, resp.tool_calls);
                PassOutcome::finished(spec, text, calls)
            }
        }
    }

    async fn run_streaming(&self, req: &PassRequest<'_>) -> PassOutcome {
        let spec = req.spec;
        let request = self.build_request(req);
        let cancelled = |text: String, why: &str| PassOutcome::failed(spec, text, PassFailure::new(FailureKind::Cancelled, why));

        let opened = tokio::select! {
            biased;
            _ = req.cancel.cancelled() => return cancelled(String::new(), "cancelled"),
            _ = sink_closed(req.sink) => return cancelled(String::new(), "caller disconnected"),
            r = timeout(self.request_timeout, self.llm.complete_stream(&request)) => r,
        };
        let mut stream = match opened {
            Err(_) => {
                return PassOutcome::failed(
                    spec,
                    String::new(),
                    PassFailure::new(FailureKind::Timeout, "stream did not open in time"),
                )
            }
            Ok(Err(e)) => return PassOutcome::failed(spec, String::new(), transport_failure(e)),
            Ok(Ok(s)) => s,
        };

        let mut text = String::new();
        let mut partial: BTreeMap<usize, PartialCall> = BTreeMap::new();
        loop {
            let next = tokio::select! {
                biased;
                _ = req.cancel.cancelled() => return cancelled(text, "cancelled"),
                _ = sink_closed(req.sink) => return cancelled(text, "caller disconnected"),
                n = timeout(self.stream_idle, stream.next()) => n,
            };
            match next {
                Err(_) => {
                    return PassOutcome::failed(
                        spec,
                        text,
                        PassFailure::new(FailureKind::Timeout, format!("stream idle for {}s", self.stream_idle.as_secs())),
                    )
                }
                Ok(None) => {
                    return PassOutcome::failed(
                        spec,
                        text,
                        PassFailure::new(FailureKind::Disconnected, "stream ended before completion"),
                    )
                }
                Ok(Some(Err(e))) => {
                    let mut failure = transport_failure(e);
                    if failure.kind == FailureKind::Transport {
                        failure.kind = FailureKind::Disconnected;
                    }
                    return PassOutcome::failed(spec, text, failure);
                }
                Ok(Some(Ok(StreamChunk::TextDelta(delta)))) => {
                    if delta.is_empty() {
                        continue;
                    }
                    if let Some(sink) = req.sink {
                        sink.send(TurnEvent::TextDelta { text: delta.clone() });
                    }
                    text.push_str(&delta);
                }
                Ok(Some(Ok(StreamChunk::ToolCallDelta {
                    index,
                    id,
                    name,
                    arguments_delta,
                }))) => {
                    let entry = partial.entry(index).or_default();
                    if id.is_some() {
                        entry.id = id;
                    }
                    if let Some(n) = name {
                        entry.name.push_str(&n);
                    }
                    entry.arguments.push_str(&arguments_delta);
                }
                Ok(Some(Ok(StreamChunk::Done { finish_reason }))) => {
                    tracing::debug!(finish_reason = %finish_reason, "stream done");
                    break;
                }
            }
        }

        let native = partial
            .into_values()
            .filter(|p| !p.name.is_empty())
            .map(|p| {
                let args = parse_arguments(&p.name, &p.arguments);
                ToolCall::with_id(p.id.unwrap_or_default(), p.name, args)
            })
            .collect();
        let (text, calls) = self.reconcile(req, text, native);
        PassOutcome::finished(spec, text, calls)
    }

    /// 工具未启用：正文原样返回，丢弃任何调用。
    /// 启用：正文经 Normalizer 清理，与原生调用合并
    fn reconcile(&self, req: &PassRequest<'_>, text: String, native: Vec<ToolCall>) -> (String, Vec<ToolCall>) {
        if !req.spec.tools_enabled {
            if !native.is_empty() {
                tracing::warn!(count = native.len(), "Tool calls returned by a pass without tools, ignored");
            }
            return (text, Vec::new());
        }
        let (cleaned, extracted) = Normalizer::new(req.tools).normalize(&text);
        (cleaned, merge_tool_calls(native, extracted))
    }
}

/// 原生调用在前；标签式调用若与某个原生调用同名同参则丢弃
pub fn merge_tool_calls(native: Vec<ToolCall>, extracted: Vec<ToolCall>) -> Vec<ToolCall> {
    let mut calls = native;
    for call in extracted {
        if calls.iter().any(|c| c.same_operation(&call)) {
            tracing::debug!(tool = %call.name, "Tag-delimited call duplicates a native call, dropped");
            continue;
        }
        calls.push(call);
    }
    calls
}

fn transport_failure(e: LlmError) -> PassFailure {
    let kind = match e {
        LlmError::Timeout => FailureKind::Timeout,
        _ => FailureKind::Transport,
    };
    PassFailure::new(kind, e.to_string())
}

async fn sink_closed(sink: Option<&EventSink>) {
    match sink {
        Some(s) => s.closed().await,
        None => std::future::pending::<()>().await,
    }
}
