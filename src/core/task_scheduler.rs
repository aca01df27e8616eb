//! 后端并发闸门
//!
//! 本地推理进程通常串行处理请求；所有通道在调用后端前先取得许可。
//! tokio Semaphore 按 FIFO 发放许可，第二个通道排队而不是抢占。

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct BackendGate {
    semaphore: Arc<Semaphore>,
    limit: usize,
}

impl BackendGate {
    pub fn new(max_concurrent_requests: usize) -> Self {
        let limit = max_concurrent_requests.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(limit)),
            limit,
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// 当前空闲许可数
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// 排队取得许可；闸门不会被关闭，失败只可能来自取消
    pub async fn acquire(&self, cancel: &CancellationToken) -> Option<OwnedSemaphorePermit> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            permit = self.semaphore.clone().acquire_owned() => permit.ok(),
        }
    }
}

impl Default for BackendGate {
    fn default() -> Self {
        Self::new(1)
    }
}
