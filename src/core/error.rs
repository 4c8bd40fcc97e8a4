//! 错误分类
//!
//! - AgentError：单个任务内的错误（模型传输、工具、参数、取消），由调试重试层兜住
//! - OrchestratorError：整次运行级别的致命错误
//! - FailureReason：任务最终失败时记录的原因

use std::fmt;

use thiserror::Error;

use crate::llm::LlmError;
use crate::structured::UnparsableOutput;

/// 任务执行过程中可能出现的错误
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("LLM error: {0}")]
    LlmError(#[from] LlmError),

    #[error("Tool execution failed: {0}")]
    ToolExecutionFailed(String),

    #[error("Tool timeout: {0}")]
    ToolTimeout(String),

    /// 模型调用了未注册的工具；作为工具结果回灌给模型，而不是中止任务
    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Invalid arguments for {tool}: {reason}")]
    InvalidArguments { tool: String, reason: String },

    #[error("Path escape attempt: {0}")]
    PathEscape(String),

    #[error("Cancelled")]
    Cancelled,
}

/// 运行级致命错误：出现即终止本次运行
#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Invalid plan: {0}")]
    InvalidPlan(String),

    #[error("Unparsable output: {0}")]
    UnparsableOutput(#[from] UnparsableOutput),

    #[error("Invalid transition for task {task_id}: {from} -> {to}")]
    InvalidTransition {
        task_id: String,
        from: String,
        to: String,
    },

    #[error("Unknown task: {0}")]
    UnknownTask(String),

    #[error("Deadlock detected: pending tasks {0:?} can never become ready")]
    DeadlockDetected(Vec<String>),

    #[error("Planning failed: {0}")]
    PlanningFailed(String),

    #[error("Plan rejected: {0}")]
    PlanRejected(String),

    #[error("Cancelled before a plan was produced")]
    Cancelled,
}

/// 任务失败原因（渲染为 snake_case 字符串写入任务元数据与日志）
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    IterationLimitExceeded,
    Cancelled,
    TransportError(String),
}

impl FailureReason {
    pub fn code(&self) -> &'static str {
        match self {
            FailureReason::IterationLimitExceeded => "iteration_limit_exceeded",
            FailureReason::Cancelled => "cancelled",
            FailureReason::TransportError(_) => "transport_error",
        }
    }

    /// 取消不参与调试重试
    pub fn is_retryable(&self) -> bool {
        !matches!(self, FailureReason::Cancelled)
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::TransportError(detail) => write!(f, "transport_error: {detail}"),
            other => f.write_str(other.code()),
        }
    }
}

impl From<&AgentError> for FailureReason {
    fn from(err: &AgentError) -> Self {
        match err {
            AgentError::Cancelled => FailureReason::Cancelled,
            other => FailureReason::TransportError(other.to_string()),
        }
    }
}
