//! 工具分发：按名查找 → 执行 → ToolResult
//!
//! 按调用出现顺序逐个执行，互不影响；未知工具直接失败且不调用任何东西。
//! 同一轮内按调用 id 去重（DispatchLedger），重复投递返回首次结果，不再执行。

use serde_json::Value;

use crate::core::DispatchLedger;
use crate::memory::Message;
use crate::pipeline::events::preview;
use crate::pipeline::{EventSink, TurnEvent};
use crate::tools::{ToolCall, ToolExecutor, ToolRegistry, ToolResult};

const RESULT_PREVIEW_CHARS: usize = 200;

#[derive(Clone)]
pub struct ToolDispatcher {
    registry: ToolRegistry,
    executor: ToolExecutor,
}

impl ToolDispatcher {
    pub fn new(registry: ToolRegistry, executor: ToolExecutor) -> Self {
        Self { registry, executor }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// 是否配置了任何工具
    pub fn has_tools(&self) -> bool {
        !self.registry.is_empty()
    }

    pub async fn dispatch(&self, calls: &[ToolCall], ledger: &mut DispatchLedger) -> Vec<ToolResult> {
        self.dispatch_observed(0, calls, ledger, &EventSink::none()).await
    }

    /// 同 dispatch，并把每次调用与结果推送给 sink
    pub async fn dispatch_observed(
        &self,
        pass: usize,
        calls: &[ToolCall],
        ledger: &mut DispatchLedger,
        sink: &EventSink,
    ) -> Vec<ToolResult> {
        let mut results = Vec::with_capacity(calls.len());
        for call in calls {
            if let Some(previous) = ledger.get(&call.id) {
                tracing::debug!(call_id = %call.id, tool = %call.name, "Duplicate tool call id, reusing result");
                results.push(previous.clone());
                continue;
            }

            sink.send(TurnEvent::ToolCall {
                pass,
                call_id: call.id.clone(),
                tool: call.name.clone(),
                args: Value::Object(call.arguments.clone()),
            });

            let result = self.invoke(call).await;

            sink.send(TurnEvent::ToolResult {
                pass,
                call_id: result.call_id.clone(),
                tool: result.tool.clone(),
                success: result.success,
                preview: preview(&result.to_message_content(), RESULT_PREVIEW_CHARS),
            });
            ledger.record(result.clone());
            results.push(result);
        }
        results
    }

    async fn invoke(&self, call: &ToolCall) -> ToolResult {
        let Some(tool) = self.registry.lookup(&call.name) else {
            tracing::warn!(tool = %call.name, call_id = %call.id, "Unknown tool");
            return ToolResult::failed(call, "unknown tool");
        };
        match self.executor.invoke(tool, Value::Object(call.arguments.clone())).await {
            Ok(data) => ToolResult::ok(call, data),
            Err(e) => ToolResult::failed(call, e),
        }
    }
}

/// 为续写调用追加一轮：带 tool_calls 的 assistant 消息 + 每个结果一条 tool 消息
pub fn append_tool_round(conversation: &mut Vec<Message>, text: &str, calls: &[ToolCall], results: &[ToolResult]) {
    conversation.push(Message::assistant_with_tools(text, calls.to_vec()));
    conversation.extend(results.iter().map(Message::tool_result));
}
