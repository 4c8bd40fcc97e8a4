//! 错误恢复引擎
//!
//! 任务失败后决定下一步：带错误上下文重跑（调试重试）或终止；同时负责规划阶段的纠正提示。

use crate::core::error::FailureReason;

/// 恢复引擎给出的动作
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    /// 以该提示作为调试上下文重跑工具调用循环
    RetryWithPrompt(String),
    /// 终止当前任务（取消或重试预算耗尽）
    Abort,
}

/// 单个任务的失败信息
#[derive(Debug, Clone)]
pub struct TaskFailure<'a> {
    pub reason: &'a FailureReason,
    /// 失败时已完成的尝试次数（从 1 开始）
    pub attempt: u32,
    pub tool_errors: &'a [String],
    /// 失败前模型的最后一段输出
    pub last_output: &'a str,
}

/// 恢复引擎：持有调试重试预算
#[derive(Debug, Clone)]
pub struct RecoveryEngine {
    max_debug_attempts: u32,
}

/// 调试提示里最多带上的工具错误条数
const MAX_TOOL_ERRORS_IN_PROMPT: usize = 8;

impl RecoveryEngine {
    pub fn new(max_debug_attempts: u32) -> Self {
        Self { max_debug_attempts }
    }

    /// 首跑算第 1 次，调试重试最多 max_debug_attempts 次
    pub fn handle(&self, failure: &TaskFailure<'_>) -> RecoveryAction {
        if !failure.reason.is_retryable() {
            return RecoveryAction::Abort;
        }
        if failure.attempt > self.max_debug_attempts {
            return RecoveryAction::Abort;
        }
        RecoveryAction::RetryWithPrompt(debug_prompt(failure))
    }
}

fn debug_prompt(failure: &TaskFailure<'_>) -> String {
    let mut prompt = format!(
        "Your previous attempt (attempt {}) at this task failed: {}.\n",
        failure.attempt, failure.reason
    );
    if !failure.tool_errors.is_empty() {
        prompt.push_str("Tool errors from that attempt:\n");
        let skipped = failure.tool_errors.len().saturating_sub(MAX_TOOL_ERRORS_IN_PROMPT);
        for err in failure.tool_errors.iter().skip(skipped) {
            prompt.push_str(&format!("- {err}\n"));
        }
    }
    if !failure.last_output.trim().is_empty() {
        prompt.push_str(&format!("Your last message was:\n{}\n", failure.last_output.trim()));
    }
    if *failure.reason == FailureReason::IterationLimitExceeded {
        prompt.push_str("You ran out of steps. Take a more direct approach and finish with a final answer.\n");
    }
    prompt.push_str("Diagnose the cause, fix it, and complete the task.");
    prompt
}

/// 规划输出无法使用时的纠正提示
pub fn corrective_plan_prompt(error: &str) -> String {
    format!(
        "Your previous reply could not be used as a plan: {error}.\n\
         Reply again with JSON only: {{\"tasks\": [{{\"id\": \"task-1\", \"title\": \"...\", \
         \"description\": \"...\", \"dependencies\": []}}]}}. \
         Every dependency must name another task id, and dependencies must not form a cycle."
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failure<'a>(reason: &'a FailureReason, attempt: u32, errors: &'a [String]) -> TaskFailure<'a> {
        TaskFailure {
            reason,
            attempt,
            tool_errors: errors,
            last_output: "",
        }
    }

    #[test]
    fn test_retry_embeds_reason_and_tool_errors() {
        let engine = RecoveryEngine::new(2);
        let reason = FailureReason::TransportError("503".into());
        let errors = vec!["shell: Exit 101".to_string()];
        match engine.handle(&failure(&reason, 1, &errors)) {
            RecoveryAction::RetryWithPrompt(p) => {
                assert!(p.contains("transport_error: 503"));
                assert!(p.contains("shell: Exit 101"));
                assert!(p.contains("attempt 1"));
            }
            other => panic!("expected retry, got {other:?}"),
        }
    }

    #[test]
    fn test_budget_exhaustion_aborts() {
        let engine = RecoveryEngine::new(2);
        let reason = FailureReason::IterationLimitExceeded;
        assert!(matches!(
            engine.handle(&failure(&reason, 2, &[])),
            RecoveryAction::RetryWithPrompt(_)
        ));
        assert_eq!(engine.handle(&failure(&reason, 3, &[])), RecoveryAction::Abort);
        assert_eq!(
            RecoveryEngine::new(0).handle(&failure(&reason, 1, &[])),
            RecoveryAction::Abort
        );
    }

    #[test]
    fn test_cancelled_is_never_retried() {
        let engine = RecoveryEngine::new(5);
        assert_eq!(
            engine.handle(&failure(&FailureReason::Cancelled, 1, &[])),
            RecoveryAction::Abort
        );
    }

    #[test]
    fn test_corrective_prompt_mentions_error() {
        let p = corrective_plan_prompt("dependency cycle among tasks [\"a\"]");
        assert!(p.contains("dependency cycle"));
        assert!(p.contains("\"tasks\""));
    }
}
