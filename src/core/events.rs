//! 运行事件与通知端口
//!
//! 编排器只通过注入的 NotificationPort 对外发事件，事件按状态迁移发生的顺序逐条投递，不合并不重排。

use serde::Serialize;
use tokio::sync::mpsc;

use crate::core::state::ExecutionSummary;
use crate::core::task::Task;
use crate::react::ReactEvent;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RunEvent {
    PlanCreated { tasks: Vec<Task> },
    TaskStarted { task: Task, index: usize },
    TaskCompleted { task: Task },
    TaskFailed { task: Task, reason: String },
    /// 调试重试：attempt 为即将开始的第几次尝试（从 2 开始）
    TaskRetrying { task: Task, attempt: u32, reason: String },
    /// 工具调用循环内部事件
    Tool { task_id: String, step: ReactEvent },
    ExecutionCompleted { summary: ExecutionSummary },
}

impl RunEvent {
    pub fn name(&self) -> &'static str {
        match self {
            RunEvent::PlanCreated { .. } => "plan_created",
            RunEvent::TaskStarted { .. } => "task_started",
            RunEvent::TaskCompleted { .. } => "task_completed",
            RunEvent::TaskFailed { .. } => "task_failed",
            RunEvent::TaskRetrying { .. } => "task_retrying",
            RunEvent::Tool { .. } => "tool",
            RunEvent::ExecutionCompleted { .. } => "execution_completed",
        }
    }
}

/// 通知端口：同步调用，实现方不得阻塞
pub trait NotificationPort: Send + Sync {
    fn notify(&self, event: &RunEvent);
}

/// 丢弃所有事件
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

impl NotificationPort for NoopNotifier {
    fn notify(&self, _event: &RunEvent) {}
}

/// 把事件写进 tracing
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl NotificationPort for TracingNotifier {
    fn notify(&self, event: &RunEvent) {
        match event {
            RunEvent::Tool { task_id, step } => {
                tracing::debug!(task_id = %task_id, ?step, "tool loop event");
            }
            RunEvent::TaskFailed { task, reason } => {
                tracing::warn!(task_id = %task.id, reason = %reason, "task failed");
            }
            other => tracing::info!(event = other.name(), "run event"),
        }
    }
}

/// 无界通道转发，接收端被丢弃后静默忽略
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    tx: mpsc::UnboundedSender<RunEvent>,
}

impl ChannelNotifier {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<RunEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl NotificationPort for ChannelNotifier {
    fn notify(&self, event: &RunEvent) {
        let _ = self.tx.send(event.clone());
    }
}
