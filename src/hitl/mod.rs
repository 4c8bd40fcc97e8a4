//! 人在回路（HITL）：风险闸门 + 审批端口 + 会话级「总是允许」集合
//!
//! ApprovalGate 在每个有副作用的工具调用前执行：
//! assess 给出是否需要审批，ask 挂起等待审批端（可被取消令牌打断）。

pub mod approval;
pub mod risk;

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::core::AgentError;

pub use approval::{
    ApprovalDecision, ApprovalPort, ApprovalPrompt, ApprovalRequest, AutoApprove, ChannelApproval,
    PlanDecision,
};
pub use risk::{RiskAssessment, RiskConfig, RiskConfigError, RiskGate, RiskLevel, RiskPatternSpec};

/// assess 的结果
#[derive(Debug, Clone)]
pub enum GateVerdict {
    /// 直接执行；assessment 为 None 表示闸门关闭
    Allow(Option<RiskAssessment>),
    NeedsApproval(RiskAssessment),
}

/// 审批闸门：共享只读的风险配置，外加本会话的「总是允许」工具集合
pub struct ApprovalGate {
    risk: Arc<RiskGate>,
    port: Arc<dyn ApprovalPort>,
    always_approved: Mutex<HashSet<String>>,
    enabled: bool,
}

impl ApprovalGate {
    pub fn new(risk: Arc<RiskGate>, port: Arc<dyn ApprovalPort>, enabled: bool) -> Self {
        Self {
            risk,
            port,
            always_approved: Mutex::new(HashSet::new()),
            enabled,
        }
    }

    pub fn risk_gate(&self) -> &Arc<RiskGate> {
        &self.risk
    }

    pub fn is_always_approved(&self, tool_name: &str) -> bool {
        self.always_approved
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(tool_name)
    }

    /// 评估一次工具调用；block pattern 命中时忽略「总是允许」
    pub fn assess(&self, tool_name: &str, args: &Value) -> GateVerdict {
        if !self.enabled {
            return GateVerdict::Allow(None);
        }
        let detail = flatten_args(args);
        let assessment = self.risk.analyze(tool_name, Some(&detail));
        if !assessment.requires_approval {
            return GateVerdict::Allow(Some(assessment));
        }
        if assessment.category != "blocked" && self.is_always_approved(tool_name) {
            tracing::debug!(tool = %tool_name, "tool always approved for this session");
            return GateVerdict::Allow(Some(assessment));
        }
        GateVerdict::NeedsApproval(assessment)
    }

    /// 挂起等待审批；取消令牌触发时返回 Cancelled
    pub async fn ask(
        &self,
        request: &ApprovalRequest,
        cancel: &CancellationToken,
    ) -> Result<ApprovalDecision, AgentError> {
        let decision = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(AgentError::Cancelled),
            d = self.port.request_approval(request) => d,
        };
        if decision == ApprovalDecision::AlwaysApprove {
            self.always_approved
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(request.tool_name.clone());
            tracing::info!(tool = %request.tool_name, "tool approved for the rest of the session");
        }
        Ok(decision)
    }
}

/// 把参数中的所有标量值拼成一段文本，供风险模式匹配
pub fn flatten_args(args: &Value) -> String {
    fn walk(v: &Value, out: &mut Vec<String>) {
        match v {
            Value::String(s) => out.push(s.clone()),
            Value::Array(items) => items.iter().for_each(|i| walk(i, out)),
            Value::Object(map) => map.values().for_each(|i| walk(i, out)),
            Value::Null => {}
            other => out.push(other.to_string()),
        }
    }
    let mut parts = Vec::new();
    walk(args, &mut parts);
    parts.join(" ")
}
