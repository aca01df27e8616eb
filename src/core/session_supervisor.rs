//! 会话监管：轮次级取消
//!
//! 根 token 代表整个会话（退出时取消）；每轮从根派生子 token，
//! 用户 Ctrl+C / 断开只取消当前轮，下一轮重新派生，不受上一轮影响。

use std::sync::Mutex;

use tokio_util::sync::CancellationToken;

#[derive(Debug)]
pub struct SessionSupervisor {
    /// 会话根 token
    root: CancellationToken,
    /// 当前轮的 token
    current: Mutex<CancellationToken>,
}

impl SessionSupervisor {
    pub fn new() -> Self {
        let root = CancellationToken::new();
        let current = Mutex::new(root.child_token());
        Self { root, current }
    }

    /// 开始新一轮，返回本轮的取消 token
    pub fn begin_turn(&self) -> CancellationToken {
        let token = self.root.child_token();
        *self.current.lock().unwrap_or_else(|e| e.into_inner()) = token.clone();
        token
    }

    /// 取消当前轮
    pub fn cancel(&self) {
        self.current.lock().unwrap_or_else(|e| e.into_inner()).cancel();
    }

    /// 取消会话（含进行中的轮次）
    pub fn shutdown(&self) {
        self.root.cancel();
    }

    pub fn is_shut_down(&self) -> bool {
        self.root.is_cancelled()
    }
}

impl Default for SessionSupervisor {
    fn default() -> Self {
        Self::new()
    }
}
