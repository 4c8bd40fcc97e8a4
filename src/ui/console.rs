//! 交互模式：终端审批与进度输出
//!
//! 审批提示与进度写 stderr，stdin 读一行回答：y 允许、a 本会话总是允许该工具、其他输入作为拒绝理由。

use std::io::{BufRead, Write};

use async_trait::async_trait;

use crate::core::events::{NotificationPort, RunEvent};
use crate::core::task::Task;
use crate::hitl::{ApprovalDecision, ApprovalPort, ApprovalRequest, PlanDecision};
use crate::react::ReactEvent;

/// 从 stdin 读审批结果
#[derive(Debug, Default, Clone, Copy)]
pub struct ConsoleApproval;

pub fn parse_tool_decision(answer: &str) -> ApprovalDecision {
    match answer.trim() {
        "y" | "Y" | "yes" => ApprovalDecision::Approve,
        "a" | "A" | "always" => ApprovalDecision::AlwaysApprove,
        "" | "n" | "N" | "no" => ApprovalDecision::Reject {
            comment: "rejected".to_string(),
        },
        comment => ApprovalDecision::Reject {
            comment: comment.to_string(),
        },
    }
}

pub fn parse_plan_decision(answer: &str) -> PlanDecision {
    match answer.trim() {
        "y" | "Y" | "yes" => PlanDecision::Approve,
        "" | "n" | "N" | "no" => PlanDecision::Reject {
            comment: "rejected".to_string(),
        },
        comment => PlanDecision::Reject {
            comment: comment.to_string(),
        },
    }
}

/// 阻塞读一行放到 blocking 线程；读失败按空输入处理（即拒绝）
async fn prompt_line(prompt: String) -> String {
    let result = tokio::task::spawn_blocking(move || {
        let mut stderr = std::io::stderr();
        let _ = write!(stderr, "{prompt}");
        let _ = stderr.flush();
        let mut line = String::new();
        std::io::stdin().lock().read_line(&mut line).map(|_| line)
    })
    .await;
    match result {
        Ok(Ok(line)) => line,
        Ok(Err(e)) => {
            tracing::warn!(error = %e, "failed to read approval answer");
            String::new()
        }
        Err(e) => {
            tracing::warn!(error = %e, "approval prompt task failed");
            String::new()
        }
    }
}

#[async_trait]
impl ApprovalPort for ConsoleApproval {
    async fn request_approval(&self, request: &ApprovalRequest) -> ApprovalDecision {
        let prompt = format!(
            "\n[{}] {} wants to run with {}\n  {} ({})\nApprove? [y]es / [a]lways / or type a reason to reject: ",
            request.assessment.level.to_string().to_uppercase(),
            request.tool_name,
            request.args,
            request.assessment.reason,
            request.assessment.category,
        );
        parse_tool_decision(&prompt_line(prompt).await)
    }

    async fn request_plan_approval(&self, tasks: &[Task]) -> PlanDecision {
        let mut prompt = String::from("\nProposed plan:\n");
        for (i, task) in tasks.iter().enumerate() {
            prompt.push_str(&format!("  {}. [{}] {}", i + 1, task.id, task.title));
            if !task.dependencies.is_empty() {
                prompt.push_str(&format!(" (after {})", task.dependencies.join(", ")));
            }
            prompt.push('\n');
        }
        prompt.push_str("Run this plan? [y]es / or type a reason to reject: ");
        parse_plan_decision(&prompt_line(prompt).await)
    }
}

/// 进度输出到 stderr
#[derive(Debug, Default, Clone, Copy)]
pub struct ConsoleNotifier;

impl NotificationPort for ConsoleNotifier {
    fn notify(&self, event: &RunEvent) {
        match event {
            RunEvent::PlanCreated { tasks } => {
                eprintln!("Plan: {} task(s)", tasks.len());
                for task in tasks {
                    eprintln!("  - {}: {}", task.id, task.title);
                }
            }
            RunEvent::TaskStarted { task, index } => {
                eprintln!("[{}] {} ...", index + 1, task.title);
            }
            RunEvent::TaskCompleted { task } => eprintln!("  done: {}", task.id),
            RunEvent::TaskFailed { task, reason } => eprintln!("  failed: {} ({reason})", task.id),
            RunEvent::TaskRetrying { task, attempt, reason } => {
                eprintln!("  retrying {} (attempt {attempt}) after {reason}", task.id);
            }
            RunEvent::Tool { step, .. } => match step {
                ReactEvent::ToolCall { tool, .. } => eprintln!("    > {tool}"),
                ReactEvent::ToolResult { tool, ok: false, preview } => {
                    eprintln!("    ! {tool}: {preview}");
                }
                ReactEvent::ToolRejected { tool, comment } => {
                    eprintln!("    x {tool} rejected: {comment}");
                }
                _ => {}
            },
            RunEvent::ExecutionCompleted { .. } => {}
        }
    }
}
