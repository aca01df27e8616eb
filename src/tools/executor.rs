//! 工具执行器
//!
//! 对每次调用施加超时并捕获 panic，统一转为 Err(String)；每次调用输出结构化审计日志（JSON）。

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::FutureExt;
use serde_json::Value;
use tokio::time::timeout;

use crate::tools::Tool;

/// 工具执行器：超时 + panic 隔离 + 审计
#[derive(Debug, Clone)]
pub struct ToolExecutor {
    timeout: Duration,
}

impl ToolExecutor {
    pub fn new(timeout_secs: u64) -> Self {
        Self {
            timeout: Duration::from_secs(timeout_secs.max(1)),
        }
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// 执行工具；超时、工具返回 Err、工具 panic 都变成 Err(message)
    pub async fn invoke(&self, tool: Arc<dyn Tool>, args: Value) -> Result<Value, String> {
        let start = Instant::now();
        let name = tool.name().to_string();
        let preview = args_preview(&args);

        let result = timeout(self.timeout, AssertUnwindSafe(tool.execute(args)).catch_unwind()).await;

        let (outcome, mapped) = match result {
            Ok(Ok(Ok(value))) => ("ok", Ok(value)),
            Ok(Ok(Err(e))) => ("error", Err(e)),
            Ok(Err(panic)) => ("panic", Err(format!("Tool panicked: {}", panic_message(&panic)))),
            Err(_) => (
                "timeout",
                Err(format!("Tool timed out after {}s", self.timeout.as_secs())),
            ),
        };
        let audit = serde_json::json!({
            "event": "tool_audit",
            "tool": name,
            "ok": mapped.is_ok(),
            "outcome": outcome,
            "duration_ms": start.elapsed().as_millis() as u64,
            "args_preview": preview,
        });
        tracing::info!(audit = %audit.to_string(), "tool");
        mapped
    }
}

impl Default for ToolExecutor {
    fn default() -> Self {
        Self::new(30)
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn args_preview(args: &Value) -> String {
    let s = args.to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}
