//! 审批端口：编排器在风险操作与计划执行前挂起，等待外部 UI 给出决定
//!
//! - AutoApprove：全部放行（eval 模式、-y）
//! - ChannelApproval：把审批请求作为消息发给外部 UI，附带 oneshot 回执

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::core::task::Task;
use crate::hitl::risk::RiskAssessment;

/// 单次工具调用的审批结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApprovalDecision {
    Approve,
    /// 本会话内不再询问该工具（block pattern 命中时除外）
    AlwaysApprove,
    Reject { comment: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanDecision {
    Approve,
    Reject { comment: String },
}

/// 发给审批端的请求
#[derive(Debug, Clone, Serialize)]
pub struct ApprovalRequest {
    pub task_id: String,
    pub tool_name: String,
    pub args: Value,
    pub assessment: RiskAssessment,
}

#[async_trait]
pub trait ApprovalPort: Send + Sync {
    async fn request_approval(&self, request: &ApprovalRequest) -> ApprovalDecision;

    async fn request_plan_approval(&self, tasks: &[Task]) -> PlanDecision;
}

/// 全部放行
#[derive(Debug, Default, Clone, Copy)]
pub struct AutoApprove;

#[async_trait]
impl ApprovalPort for AutoApprove {
    async fn request_approval(&self, request: &ApprovalRequest) -> ApprovalDecision {
        tracing::debug!(tool = %request.tool_name, level = %request.assessment.level, "auto-approved");
        ApprovalDecision::Approve
    }

    async fn request_plan_approval(&self, _tasks: &[Task]) -> PlanDecision {
        PlanDecision::Approve
    }
}

/// 经 ChannelApproval 发出的审批消息
#[derive(Debug)]
pub enum ApprovalPrompt {
    Tool {
        request: ApprovalRequest,
        respond: oneshot::Sender<ApprovalDecision>,
    },
    Plan {
        tasks: Vec<Task>,
        respond: oneshot::Sender<PlanDecision>,
    },
}

/// 通道审批：外部 UI 从接收端取出 ApprovalPrompt 并通过 respond 回复。
/// 接收端被丢弃或回执未被使用时视为拒绝。
#[derive(Debug, Clone)]
pub struct ChannelApproval {
    tx: mpsc::UnboundedSender<ApprovalPrompt>,
}

impl ChannelApproval {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ApprovalPrompt>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

const CHANNEL_CLOSED: &str = "approval channel closed";

#[async_trait]
impl ApprovalPort for ChannelApproval {
    async fn request_approval(&self, request: &ApprovalRequest) -> ApprovalDecision {
        let (respond, answer) = oneshot::channel();
        let prompt = ApprovalPrompt::Tool {
            request: request.clone(),
            respond,
        };
        if self.tx.send(prompt).is_err() {
            tracing::warn!(tool = %request.tool_name, "{}", CHANNEL_CLOSED);
            return ApprovalDecision::Reject {
                comment: CHANNEL_CLOSED.to_string(),
            };
        }
        answer.await.unwrap_or(ApprovalDecision::Reject {
            comment: CHANNEL_CLOSED.to_string(),
        })
    }

    async fn request_plan_approval(&self, tasks: &[Task]) -> PlanDecision {
        let (respond, answer) = oneshot::channel();
        let prompt = ApprovalPrompt::Plan {
            tasks: tasks.to_vec(),
            respond,
        };
        if self.tx.send(prompt).is_err() {
            return PlanDecision::Reject {
                comment: CHANNEL_CLOSED.to_string(),
            };
        }
        answer.await.unwrap_or(PlanDecision::Reject {
            comment: CHANNEL_CLOSED.to_string(),
        })
    }
}
