//! 会话监管：取消令牌
//!
//! 持有会话级 CancellationToken；外部（Ctrl+C、UI）调用 cancel 后，进行中的模型调用、
//! 工具执行与审批等待都会在下一个挂起点退出。令牌不会复位，取消后的会话不再运行。

use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Default)]
pub struct SessionSupervisor {
    cancel_token: CancellationToken,
}

impl SessionSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// 会话级令牌的克隆，交给外部用于取消
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}
