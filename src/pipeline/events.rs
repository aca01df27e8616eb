//! 轮次事件：调用方唯一的输出通道（可序列化为 JSON 供前端 / SSE 展示）
//!
//! 只有可见通道产生 TextDelta；副作用通道的正文永远不会出现在这里。

use serde::Serialize;
use tokio::sync::mpsc;

use crate::core::TurnPhase;
use crate::pipeline::{ExecutionMode, OperationCategory, PassSpec};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnEvent {
    /// 分类完成
    Classified {
        turn_id: String,
        category: OperationCategory,
    },
    /// 规划完成
    Planned {
        mode: ExecutionMode,
        passes: Vec<PassSpec>,
        visible_from: usize,
    },
    /// 可见回复的一小段
    TextDelta { text: String },
    /// 行内提示（流中断、工具轮次耗尽等）
    Notice { text: String },
    /// 可见回复结束
    MessageDone { text: String },
    /// 可见回复已交付，调用方可以提交下一条消息；之后的后台收尾以 TurnFinished 结束
    Delivered { turn_id: String, success: bool },
    /// 即将分发的工具调用
    ToolCall {
        pass: usize,
        call_id: String,
        tool: String,
        args: serde_json::Value,
    },
    /// 工具结果（预览）
    ToolResult {
        pass: usize,
        call_id: String,
        tool: String,
        success: bool,
        preview: String,
    },
    /// 记忆提交失败（不影响已交付的回复）
    CommitWarning { message: String },
    /// 轮次结束
    TurnFinished {
        turn_id: String,
        phase: TurnPhase,
        committed: bool,
    },
}

/// 事件发送端；无接收者时所有发送都是空操作
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    tx: Option<mpsc::UnboundedSender<TurnEvent>>,
}

impl EventSink {
    pub fn new(tx: mpsc::UnboundedSender<TurnEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    /// 不输出任何事件
    pub fn none() -> Self {
        Self::default()
    }

    /// 创建一对 (sink, receiver)
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<TurnEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    /// 发送事件；接收端已断开时返回 false
    pub fn send(&self, event: TurnEvent) -> bool {
        match &self.tx {
            Some(tx) => tx.send(event).is_ok(),
            None => true,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.as_ref().map(|tx| tx.is_closed()).unwrap_or(false)
    }

    /// 接收端断开时完成；没有接收端时永不完成
    pub async fn closed(&self) {
        match &self.tx {
            Some(tx) => tx.closed().await,
            None => std::future::pending::<()>().await,
        }
    }
}

/// 预览文本，超过 max 个字符截断
pub(crate) fn preview(text: &str, max: usize) -> String {
    if text.chars().count() > max {
        format!("{}...", text.chars().take(max).collect::<String>())
    } else {
        text.to_string()
    }
}
