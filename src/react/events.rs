//! 工具调用循环事件：每次模型迭代、工具调用、工具结果与审批过程

use serde::Serialize;
use serde_json::Value;

use crate::hitl::RiskLevel;

/// 单步过程事件（可序列化为 JSON 供前端展示）
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReactEvent {
    /// 即将进行第几次模型调用
    Iteration { iteration: usize, max_iterations: usize },
    ToolCall { tool: String, args: Value },
    /// 工具返回（预览，避免过长）
    ToolResult { tool: String, ok: bool, preview: String },
    /// 参数无法解析，已作为工具结果回灌
    InvalidArguments { tool: String, reason: String },
    ApprovalRequested {
        tool: String,
        level: RiskLevel,
        reason: String,
    },
    ToolRejected { tool: String, comment: String },
    /// 最终回答
    FinalAnswer { text: String },
}
