//! 编排器：规划 -> 执行 -> 调试
//!
//! planning：请求计划并装入 TaskBoard，失败时带纠正提示重试一次；可选计划审批。
//! executing：按依赖顺序逐个执行任务，每个任务跑一次工具调用循环。
//! debugging：任务失败后带错误上下文重跑，最多 max_debug_attempts 次，耗尽则标记 failed 并继续后续任务。
//! 结束时生成 ExecutionSummary 并发出 ExecutionCompleted；取消时同样产出部分摘要。

use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;

use crate::core::error::{AgentError, FailureReason, OrchestratorError};
use crate::core::events::{NotificationPort, RunEvent};
use crate::core::recovery::{corrective_plan_prompt, RecoveryAction, RecoveryEngine, TaskFailure};
use crate::core::session_supervisor::SessionSupervisor;
use crate::core::state::{RunPhase, RunReport};
use crate::core::task::{Task, TaskBoard, TaskStatus};
use crate::hitl::{ApprovalGate, ApprovalPort, PlanDecision, RiskGate};
use crate::llm::LlmClient;
use crate::react::prompts::{DEFAULT_EXECUTOR_PROMPT, DEFAULT_PLANNER_PROMPT};
use crate::react::{parse_plan, LoopStatus, Planner, ToolLoop};
use crate::tools::ToolDispatcher;

/// 规划最多尝试次数（首次 + 一次纠正）
const PLANNING_ATTEMPTS: u32 = 2;

/// 编排器运行参数
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub max_debug_attempts: u32,
    pub max_iterations_per_task: usize,
    /// 第一个任务失败即停止
    pub halt_on_failure: bool,
    /// HITL 总开关；关闭时既不审批计划也不审批工具调用
    pub hitl_enabled: bool,
    pub approve_plan: bool,
    pub planner_prompt: String,
    pub executor_prompt: String,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            max_debug_attempts: 2,
            max_iterations_per_task: 20,
            halt_on_failure: false,
            hitl_enabled: true,
            approve_plan: false,
            planner_prompt: DEFAULT_PLANNER_PROMPT.to_string(),
            executor_prompt: DEFAULT_EXECUTOR_PROMPT.to_string(),
        }
    }
}

enum TaskOutcome {
    Completed,
    Failed(FailureReason),
}

pub struct Orchestrator {
    planner: Planner,
    tool_loop: ToolLoop,
    approval: Arc<dyn ApprovalPort>,
    notifier: Arc<dyn NotificationPort>,
    gate: Arc<ApprovalGate>,
    recovery: RecoveryEngine,
    settings: OrchestratorSettings,
    supervisor: SessionSupervisor,
}

impl Orchestrator {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        tools: Arc<dyn ToolDispatcher>,
        approval: Arc<dyn ApprovalPort>,
        notifier: Arc<dyn NotificationPort>,
        risk: Arc<RiskGate>,
        settings: OrchestratorSettings,
    ) -> Self {
        let supervisor = SessionSupervisor::new();
        let gate = Arc::new(ApprovalGate::new(
            risk,
            approval.clone(),
            settings.hitl_enabled,
        ));
        let tool_loop = ToolLoop::new(llm.clone(), tools, settings.max_iterations_per_task)
            .with_gate(gate.clone())
            .with_notifier(notifier.clone())
            .with_system_prompt(settings.executor_prompt.clone())
            .with_cancel_token(supervisor.cancel_token());
        let planner = Planner::new(llm).with_system_prompt(settings.planner_prompt.clone());

        Self {
            planner,
            tool_loop,
            approval,
            notifier,
            gate,
            recovery: RecoveryEngine::new(settings.max_debug_attempts),
            settings,
            supervisor,
        }
    }

    /// 取消句柄：在任意挂起点生效，已取消的编排器不能再次运行
    pub fn cancel_token(&self) -> CancellationToken {
        self.supervisor.cancel_token()
    }

    /// 风险配置热替换走这里：risk_gate().update_config(...)
    pub fn risk_gate(&self) -> &Arc<RiskGate> {
        self.gate.risk_gate()
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    /// 完整跑一次请求。规划失败、计划被拒、死锁返回 Err；任务失败与取消体现在报告里。
    /// 计划审批期间取消时不执行任何任务，任务保持 pending，报告 cancelled。
    pub async fn run(&self, request: &str) -> Result<RunReport, OrchestratorError> {
        let started = Instant::now();
        let mut board = TaskBoard::new();
        tracing::info!(request_len = request.len(), "run started");

        self.enter_phase(&mut board, RunPhase::Planning);
        self.plan(request, &mut board).await?;
        self.notifier.notify(&RunEvent::PlanCreated {
            tasks: board.tasks().to_vec(),
        });

        let mut cancelled = false;
        if self.settings.hitl_enabled && self.settings.approve_plan {
            let cancel = self.supervisor.cancel_token();
            let decision = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                d = self.approval.request_plan_approval(board.tasks()) => Some(d),
            };
            match decision {
                None => cancelled = true,
                Some(PlanDecision::Reject { comment }) => {
                    board.log_mut().error(format!("Plan rejected: {comment}"));
                    return Err(OrchestratorError::PlanRejected(comment));
                }
                Some(PlanDecision::Approve) => board.log_mut().info("Plan approved"),
            }
        }

        if !cancelled {
            self.enter_phase(&mut board, RunPhase::Executing);
            cancelled = self.execute(&mut board).await?;
        }

        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        let summary = board.summary(duration_ms);
        if summary.total_tasks > 0 && summary.failed_tasks == summary.total_tasks {
            board.log_mut().error("All tasks failed");
        }
        if cancelled {
            board.log_mut().warning("Run cancelled");
        }
        let final_phase = if summary.success {
            RunPhase::Completed
        } else {
            RunPhase::Failed
        };
        self.enter_phase(&mut board, final_phase);
        board.log_mut().info(format!(
            "Execution finished: {}/{} completed, {} failed in {} ms",
            summary.completed_tasks, summary.total_tasks, summary.failed_tasks, summary.duration_ms
        ));
        self.notifier.notify(&RunEvent::ExecutionCompleted {
            summary: summary.clone(),
        });

        Ok(RunReport {
            summary,
            tasks: board.tasks().to_vec(),
            logs: board.log().entries().to_vec(),
            cancelled,
        })
    }

    fn enter_phase(&self, board: &mut TaskBoard, phase: RunPhase) {
        tracing::debug!(?phase, "phase change");
        board.log_mut().debug(format!("Phase: {phase:?}"));
    }

    async fn plan(&self, request: &str, board: &mut TaskBoard) -> Result<(), OrchestratorError> {
        let cancel = self.supervisor.cancel_token();
        let mut correction: Option<(String, String)> = None;
        let mut last_error = String::new();

        for attempt in 1..=PLANNING_ATTEMPTS {
            let reply = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(OrchestratorError::Cancelled),
                r = self.planner.request_plan(
                    request,
                    correction.as_ref().map(|(prev, prompt)| (prev.as_str(), prompt.as_str())),
                ) => r,
            };
            let raw = match reply {
                Ok(raw) => raw,
                Err(AgentError::Cancelled) => return Err(OrchestratorError::Cancelled),
                Err(e) => {
                    board.log_mut().warning(format!("Planning attempt {attempt} failed: {e}"));
                    last_error = e.to_string();
                    correction = None;
                    continue;
                }
            };

            match parse_plan(&raw).and_then(|tasks| board.set_plan(tasks)) {
                Ok(()) => return Ok(()),
                Err(e) => {
                    board
                        .log_mut()
                        .warning(format!("Planning attempt {attempt} produced an unusable plan: {e}"));
                    last_error = e.to_string();
                    correction = Some((raw, corrective_plan_prompt(&last_error)));
                }
            }
        }

        board.log_mut().error(format!("Planning failed: {last_error}"));
        Err(OrchestratorError::PlanningFailed(last_error))
    }

    /// 返回是否因取消而提前结束
    async fn execute(&self, board: &mut TaskBoard) -> Result<bool, OrchestratorError> {
        loop {
            if board.is_complete() {
                return Ok(false);
            }
            if self.supervisor.is_cancelled() {
                return Ok(true);
            }

            let Some(task) = board.next_ready_task().cloned() else {
                let stuck = board.stuck_tasks();
                if stuck.is_empty() {
                    board
                        .log_mut()
                        .warning("Remaining tasks are blocked by failed dependencies");
                    return Ok(false);
                }
                board
                    .log_mut()
                    .error(format!("Deadlock: no task can make progress {stuck:?}"));
                return Err(OrchestratorError::DeadlockDetected(stuck));
            };

            let index = board.position(&task.id).unwrap_or_default();
            board.transition(&task.id, TaskStatus::InProgress)?;
            self.notify_task(board, &task.id, |task| RunEvent::TaskStarted { task, index });

            match self.execute_task(board, &task.id).await? {
                TaskOutcome::Completed => {
                    self.notify_task(board, &task.id, |task| RunEvent::TaskCompleted { task });
                }
                TaskOutcome::Failed(reason) => {
                    let reason_text = reason.to_string();
                    self.notify_task(board, &task.id, |task| RunEvent::TaskFailed {
                        task,
                        reason: reason_text,
                    });
                    if reason == FailureReason::Cancelled {
                        return Ok(true);
                    }
                    if self.settings.halt_on_failure {
                        board.log_mut().warning("Halting after task failure");
                        return Ok(false);
                    }
                }
            }
        }
    }

    async fn execute_task(
        &self,
        board: &mut TaskBoard,
        id: &str,
    ) -> Result<TaskOutcome, OrchestratorError> {
        let mut debug_context: Option<String> = None;

        loop {
            let attempt = board.record_attempt(id)?;
            let task = board
                .get(id)
                .cloned()
                .ok_or_else(|| OrchestratorError::UnknownTask(id.to_string()))?;
            if attempt > 1 {
                self.enter_phase(board, RunPhase::Debugging);
            }

            let (reason, tool_errors, last_output) =
                match self.tool_loop.run(&task, debug_context.as_deref()).await {
                    Ok(outcome) if outcome.status == LoopStatus::Completed => {
                        board.log_mut().info(format!(
                            "Task {id} finished after {} iteration(s), {} tool call(s)",
                            outcome.iterations, outcome.tool_calls
                        ));
                        board.complete(id, outcome.result_text)?;
                        return Ok(TaskOutcome::Completed);
                    }
                    Ok(outcome) => (
                        outcome
                            .failure
                            .unwrap_or(FailureReason::IterationLimitExceeded),
                        outcome.tool_errors,
                        outcome.result_text,
                    ),
                    Err(e) => (FailureReason::from(&e), Vec::new(), String::new()),
                };

            board
                .log_mut()
                .warning(format!("Task {id} attempt {attempt} failed: {reason}"));

            let action = self.recovery.handle(&TaskFailure {
                reason: &reason,
                attempt,
                tool_errors: &tool_errors,
                last_output: &last_output,
            });
            match action {
                RecoveryAction::RetryWithPrompt(prompt) => {
                    self.notifier.notify(&RunEvent::TaskRetrying {
                        task,
                        attempt: attempt + 1,
                        reason: reason.to_string(),
                    });
                    debug_context = Some(prompt);
                }
                RecoveryAction::Abort => {
                    board.fail(id, &reason)?;
                    return Ok(TaskOutcome::Failed(reason));
                }
            }
        }
    }

    fn notify_task(
        &self,
        board: &TaskBoard,
        id: &str,
        event: impl FnOnce(Task) -> RunEvent,
    ) {
        if let Some(task) = board.get(id) {
            self.notifier.notify(&event(task.clone()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::events::ChannelNotifier;
    use crate::hitl::{AutoApprove, RiskConfig};
    use crate::llm::{AssistantMessage, LlmError, ScriptedLlmClient};
    use crate::tools::{EchoTool, ToolExecutor, ToolRegistry};

    fn orchestrator(
        script: Vec<Result<AssistantMessage, LlmError>>,
        settings: OrchestratorSettings,
    ) -> (
        Orchestrator,
        Arc<ScriptedLlmClient>,
        tokio::sync::mpsc::UnboundedReceiver<RunEvent>,
    ) {
        let llm = Arc::new(ScriptedLlmClient::new(script));
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool);
        let tools = Arc::new(ToolExecutor::new(registry, 5));
        let (notifier, rx) = ChannelNotifier::new();
        let risk = Arc::new(RiskGate::new(RiskConfig::default()).unwrap());
        let orch = Orchestrator::new(
            llm.clone(),
            tools,
            Arc::new(AutoApprove),
            Arc::new(notifier),
            risk,
            settings,
        );
        (orch, llm, rx)
    }

    fn plan(json: &str) -> Result<AssistantMessage, LlmError> {
        Ok(AssistantMessage::text(json))
    }

    fn answer(text: &str) -> Result<AssistantMessage, LlmError> {
        Ok(AssistantMessage::text(text))
    }

    fn drain(rx: &mut tokio::sync::mpsc::UnboundedReceiver<RunEvent>) -> Vec<&'static str> {
        let mut names = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if !matches!(event, RunEvent::Tool { .. }) {
                names.push(event.name());
            }
        }
        names
    }

    #[tokio::test]
    async fn test_single_task_run_emits_events_in_order() {
        let (orch, _, mut rx) = orchestrator(
            vec![
                plan(r#"{"tasks": [{"id": "t1", "title": "Greet"}]}"#),
                Ok(AssistantMessage::tool_call("echo", r#"{"text": "hi"}"#)),
                answer("said hi"),
            ],
            OrchestratorSettings::default(),
        );
        let report = orch.run("say hi").await.unwrap();
        assert!(report.summary.success);
        assert_eq!(report.task("t1").unwrap().result.as_deref(), Some("said hi"));
        assert_eq!(
            drain(&mut rx),
            vec!["plan_created", "task_started", "task_completed", "execution_completed"]
        );
    }

    #[tokio::test]
    async fn test_bad_plan_is_corrected_once() {
        let (orch, llm, _rx) = orchestrator(
            vec![
                plan("Sure! I will do it."),
                plan(r#"[{"id": "a", "title": "do a"}]"#),
                answer("done"),
            ],
            OrchestratorSettings::default(),
        );
        let report = orch.run("do a").await.unwrap();
        assert!(report.summary.success);
        let requests = llm.requests();
        let correction = &requests[1];
        assert_eq!(correction.len(), 4);
        assert_eq!(correction[2].content, "Sure! I will do it.");
    }

    #[tokio::test]
    async fn test_second_bad_plan_fails_the_run() {
        let (orch, _, _rx) = orchestrator(
            vec![
                plan(r#"[{"id": "a", "title": "x", "dependencies": ["b"]}, {"id": "b", "title": "y", "dependencies": ["a"]}]"#),
                plan("still no plan"),
            ],
            OrchestratorSettings::default(),
        );
        match orch.run("loop").await {
            Err(OrchestratorError::PlanningFailed(msg)) => assert!(!msg.is_empty()),
            other => panic!("expected planning failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_debug_retry_recovers_task() {
        let (orch, llm, mut rx) = orchestrator(
            vec![
                plan(r#"[{"id": "a", "title": "flaky"}]"#),
                Err(LlmError::Transport("connection reset".into())),
                answer("ok on retry"),
            ],
            OrchestratorSettings::default(),
        );
        let report = orch.run("flaky").await.unwrap();
        assert!(report.summary.success);
        assert_eq!(report.task("a").unwrap().attempts, 2);
        assert!(drain(&mut rx).contains(&"task_retrying"));
        let requests = llm.requests();
        let retry_request = &requests[2];
        assert!(retry_request
            .iter()
            .any(|m| m.content.contains("connection reset")));
    }

    #[tokio::test]
    async fn test_halt_on_failure_stops_after_first_failure() {
        let settings = OrchestratorSettings {
            max_debug_attempts: 0,
            halt_on_failure: true,
            ..Default::default()
        };
        let (orch, _, _rx) = orchestrator(
            vec![
                plan(r#"[{"id": "a", "title": "x"}, {"id": "b", "title": "y"}]"#),
                Err(LlmError::Transport("down".into())),
            ],
            settings,
        );
        let report = orch.run("two").await.unwrap();
        assert_eq!(report.summary.failed_tasks, 1);
        assert_eq!(report.task("b").unwrap().status, TaskStatus::Pending);
        assert!(!report.summary.success);
    }

    #[tokio::test]
    async fn test_cancel_before_run_reports_cancelled() {
        let (orch, _, _rx) = orchestrator(vec![], OrchestratorSettings::default());
        orch.cancel_token().cancel();
        assert!(matches!(
            orch.run("anything").await,
            Err(OrchestratorError::Cancelled)
        ));
    }

    #[tokio::test]
    async fn test_cancel_during_plan_approval_returns_partial_report() {
        use std::sync::OnceLock;

        use crate::hitl::{ApprovalDecision, ApprovalRequest};

        /// 审批时用户按下中断：取消会话后不再作答
        struct InterruptOnPlan(Arc<OnceLock<CancellationToken>>);

        #[async_trait::async_trait]
        impl ApprovalPort for InterruptOnPlan {
            async fn request_approval(&self, _request: &ApprovalRequest) -> ApprovalDecision {
                ApprovalDecision::Approve
            }
            async fn request_plan_approval(&self, _tasks: &[Task]) -> PlanDecision {
                if let Some(token) = self.0.get() {
                    token.cancel();
                }
                std::future::pending::<PlanDecision>().await
            }
        }

        let slot = Arc::new(OnceLock::new());
        let llm = Arc::new(ScriptedLlmClient::new(vec![plan(
            r#"[{"id": "a", "title": "x"}, {"id": "b", "title": "y", "dependencies": ["a"]}]"#,
        )]));
        let tools = Arc::new(ToolExecutor::new(ToolRegistry::new(), 5));
        let risk = Arc::new(RiskGate::new(RiskConfig::default()).unwrap());
        let (notifier, mut rx) = ChannelNotifier::new();
        let settings = OrchestratorSettings {
            approve_plan: true,
            ..Default::default()
        };
        let orch = Orchestrator::new(
            llm.clone(),
            tools,
            Arc::new(InterruptOnPlan(slot.clone())),
            Arc::new(notifier),
            risk,
            settings,
        );
        slot.set(orch.cancel_token()).unwrap();

        let report = orch.run("two steps").await.unwrap();

        assert!(report.cancelled);
        assert!(!report.summary.success);
        assert_eq!(report.summary.total_tasks, 2);
        assert_eq!(report.summary.completed_tasks, 0);
        assert_eq!(report.summary.failed_tasks, 0);
        assert!(report
            .tasks
            .iter()
            .all(|task| task.status == TaskStatus::Pending && task.attempts == 0));
        assert!(report.logs.iter().any(|entry| entry.message == "Run cancelled"));
        assert_eq!(drain(&mut rx), vec!["plan_created", "execution_completed"]);
        assert_eq!(llm.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_plan_rejection_aborts_before_execution() {
        use crate::hitl::{ApprovalDecision, ApprovalRequest};

        struct RejectPlan;

        #[async_trait::async_trait]
        impl ApprovalPort for RejectPlan {
            async fn request_approval(&self, _request: &ApprovalRequest) -> ApprovalDecision {
                ApprovalDecision::Approve
            }
            async fn request_plan_approval(&self, _tasks: &[Task]) -> PlanDecision {
                PlanDecision::Reject {
                    comment: "too broad".into(),
                }
            }
        }

        let llm = Arc::new(ScriptedLlmClient::new(vec![plan(r#"[{"id": "a", "title": "x"}]"#)]));
        let tools = Arc::new(ToolExecutor::new(ToolRegistry::new(), 5));
        let risk = Arc::new(RiskGate::new(RiskConfig::default()).unwrap());
        let settings = OrchestratorSettings {
            approve_plan: true,
            ..Default::default()
        };
        let orch = Orchestrator::new(
            llm.clone(),
            tools,
            Arc::new(RejectPlan),
            Arc::new(crate::core::events::NoopNotifier),
            risk,
            settings,
        );
        match orch.run("x").await {
            Err(OrchestratorError::PlanRejected(comment)) => assert_eq!(comment, "too broad"),
            other => panic!("expected rejection, got {other:?}"),
        }
        assert_eq!(llm.remaining(), 0);
        assert_eq!(llm.requests().len(), 1);
    }
}
