//! 工具调用循环（单个任务）
//!
//! awaiting_model -> (tool_calls_pending | final_answer | error)：
//! 每轮把累积的历史（system + 任务描述 + 之前的工具结果）发给模型；
//! 有工具调用就逐个解析参数、按需过风险闸门、执行并写回结果；没有工具调用即为最终回答。
//! 迭代次数到上限仍无最终回答则以 iteration_limit_exceeded 失败；模型传输错误不在循环内重试。

use std::sync::Arc;

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::core::error::FailureReason;
use crate::core::events::{NoopNotifier, NotificationPort, RunEvent};
use crate::core::task::Task;
use crate::core::AgentError;
use crate::hitl::{ApprovalDecision, ApprovalGate, ApprovalRequest, GateVerdict};
use crate::llm::{LlmClient, Message, ToolCallRequest};
use crate::react::prompts::{task_prompt, DEFAULT_EXECUTOR_PROMPT};
use crate::react::ReactEvent;
use crate::structured;
use crate::tools::ToolDispatcher;

/// 工具结果预览最大字符数
const RESULT_PREVIEW_CHARS: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopStatus {
    Completed,
    Failed,
}

/// 单次循环的结果
#[derive(Debug, Clone)]
pub struct LoopOutcome {
    pub status: LoopStatus,
    /// 最终回答；失败时为最后一次模型输出
    pub result_text: String,
    pub iterations: usize,
    pub failure: Option<FailureReason>,
    /// 本次循环中失败的工具调用（供调试提示使用）
    pub tool_errors: Vec<String>,
    pub tool_calls: usize,
}

/// 工具调用循环
pub struct ToolLoop {
    llm: Arc<dyn LlmClient>,
    tools: Arc<dyn ToolDispatcher>,
    gate: Option<Arc<ApprovalGate>>,
    notifier: Arc<dyn NotificationPort>,
    system_prompt: String,
    max_iterations: usize,
    cancel: CancellationToken,
}

impl ToolLoop {
    pub fn new(llm: Arc<dyn LlmClient>, tools: Arc<dyn ToolDispatcher>, max_iterations: usize) -> Self {
        Self {
            llm,
            tools,
            gate: None,
            notifier: Arc::new(NoopNotifier),
            system_prompt: DEFAULT_EXECUTOR_PROMPT.to_string(),
            max_iterations,
            cancel: CancellationToken::new(),
        }
    }

    /// 设置审批闸门；未设置时所有工具直接执行
    pub fn with_gate(mut self, gate: Arc<ApprovalGate>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn NotificationPort>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn with_cancel_token(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    fn emit(&self, task_id: &str, step: ReactEvent) {
        self.notifier.notify(&RunEvent::Tool {
            task_id: task_id.to_string(),
            step,
        });
    }

    /// 执行一个任务；debug_context 为调试重试时注入的错误上下文
    pub async fn run(&self, task: &Task, debug_context: Option<&str>) -> Result<LoopOutcome, AgentError> {
        let definitions = self.tools.definitions();
        let mut messages = vec![
            Message::system(self.system_prompt.clone()),
            Message::user(task_prompt(task)),
        ];
        if let Some(ctx) = debug_context {
            messages.push(Message::user(ctx.to_string()));
        }

        let mut iterations = 0;
        let mut tool_calls = 0;
        let mut tool_errors = Vec::new();
        let mut last_output = String::new();

        loop {
            if self.cancel.is_cancelled() {
                return Err(AgentError::Cancelled);
            }
            if iterations >= self.max_iterations {
                tracing::warn!(task_id = %task.id, iterations, "iteration limit reached");
                return Ok(LoopOutcome {
                    status: LoopStatus::Failed,
                    result_text: last_output,
                    iterations,
                    failure: Some(FailureReason::IterationLimitExceeded),
                    tool_errors,
                    tool_calls,
                });
            }
            iterations += 1;
            self.emit(
                &task.id,
                ReactEvent::Iteration {
                    iteration: iterations,
                    max_iterations: self.max_iterations,
                },
            );

            let reply = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(AgentError::Cancelled),
                r = self.llm.complete(&messages, &definitions) => r?,
            };
            last_output = reply.content.clone();

            let (calls, native) = if !reply.tool_calls.is_empty() {
                (reply.tool_calls.clone(), true)
            } else {
                match text_tool_call(&reply.content, iterations) {
                    Some(call) => (vec![call], false),
                    None => {
                        tracing::debug!(task_id = %task.id, iterations, "final answer");
                        self.emit(&task.id, ReactEvent::FinalAnswer { text: reply.content.clone() });
                        return Ok(LoopOutcome {
                            status: LoopStatus::Completed,
                            result_text: reply.content,
                            iterations,
                            failure: None,
                            tool_errors,
                            tool_calls,
                        });
                    }
                }
            };

            messages.push(if native {
                Message::from_assistant(&reply)
            } else {
                Message::assistant(reply.content.clone())
            });

            for call in calls {
                if self.cancel.is_cancelled() {
                    return Err(AgentError::Cancelled);
                }
                tool_calls += 1;
                let observation = self.dispatch(task, &call, &mut tool_errors).await?;
                messages.push(if native {
                    Message::tool(call.id.clone(), observation)
                } else {
                    Message::user(format!("Observation from {}: {}", call.name, observation))
                });
            }
        }
    }

    /// 解析参数 -> 风险审批 -> 执行；返回写回历史的文本
    async fn dispatch(
        &self,
        task: &Task,
        call: &ToolCallRequest,
        tool_errors: &mut Vec<String>,
    ) -> Result<String, AgentError> {
        let args = match parse_arguments(&call.arguments) {
            Ok(args) => args,
            Err(reason) => {
                tracing::warn!(task_id = %task.id, tool = %call.name, reason = %reason, "invalid tool arguments");
                self.emit(
                    &task.id,
                    ReactEvent::InvalidArguments {
                        tool: call.name.clone(),
                        reason: reason.clone(),
                    },
                );
                let err = AgentError::InvalidArguments {
                    tool: call.name.clone(),
                    reason,
                };
                tool_errors.push(err.to_string());
                return Ok(format!("Error: {err}"));
            }
        };

        self.emit(
            &task.id,
            ReactEvent::ToolCall {
                tool: call.name.clone(),
                args: args.clone(),
            },
        );

        if let Some(gate) = &self.gate {
            if self.tools.is_side_effecting(&call.name) {
                if let GateVerdict::NeedsApproval(assessment) = gate.assess(&call.name, &args) {
                    self.emit(
                        &task.id,
                        ReactEvent::ApprovalRequested {
                            tool: call.name.clone(),
                            level: assessment.level,
                            reason: assessment.reason.clone(),
                        },
                    );
                    let request = ApprovalRequest {
                        task_id: task.id.clone(),
                        tool_name: call.name.clone(),
                        args: args.clone(),
                        assessment,
                    };
                    if let ApprovalDecision::Reject { comment } = gate.ask(&request, &self.cancel).await? {
                        tracing::info!(task_id = %task.id, tool = %call.name, "tool call rejected");
                        self.emit(
                            &task.id,
                            ReactEvent::ToolRejected {
                                tool: call.name.clone(),
                                comment: comment.clone(),
                            },
                        );
                        return Ok(format!("Tool call rejected by the user: {comment}"));
                    }
                }
            }
        }

        let result = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(AgentError::Cancelled),
            r = self.tools.execute(&call.name, args) => r,
        };

        let (ok, observation) = match result {
            Ok(text) => (true, text),
            Err(AgentError::Cancelled) => return Err(AgentError::Cancelled),
            Err(e) => {
                tool_errors.push(format!("{}: {}", call.name, e));
                (false, format!("Error: {e}"))
            }
        };
        self.emit(
            &task.id,
            ReactEvent::ToolResult {
                tool: call.name.clone(),
                ok,
                preview: preview(&observation),
            },
        );
        Ok(observation)
    }
}

fn preview(text: &str) -> String {
    if text.chars().count() > RESULT_PREVIEW_CHARS {
        format!("{}...", text.chars().take(RESULT_PREVIEW_CHARS).collect::<String>())
    } else {
        text.to_string()
    }
}

/// 参数解析：空串视为 {}；先严格 JSON，再走结构化恢复；结果必须是对象
pub fn parse_arguments(raw: &str) -> Result<Value, String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(Value::Object(Default::default()));
    }
    let value = match serde_json::from_str::<Value>(trimmed) {
        Ok(v) => v,
        Err(strict) => structured::recover(trimmed)
            .map_err(|e| format!("{strict}; recovery failed: {}", e.reason))?,
    };
    match value {
        Value::Object(_) => Ok(value),
        Value::Null => Ok(Value::Object(Default::default())),
        other => Err(format!("arguments must be a JSON object, got {other}")),
    }
}

/// 从没有原生工具调用的回复文本中识别 {"tool": "...", "args": {...}}
fn text_tool_call(content: &str, iteration: usize) -> Option<ToolCallRequest> {
    let value = structured::recover(content).ok()?;
    let name = value.get("tool")?.as_str()?.trim();
    if name.is_empty() {
        return None;
    }
    let arguments = match value.get("args") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    };
    Some(ToolCallRequest {
        id: format!("text_call_{iteration}"),
        name: name.to_string(),
        arguments,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::events::ChannelNotifier;
    use crate::hitl::{ApprovalPort, PlanDecision, RiskConfig, RiskGate};
    use crate::llm::{AssistantMessage, LlmError, Role, ScriptedLlmClient};
    use crate::tools::{EchoTool, Tool, ToolExecutor, ToolRegistry};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// 有副作用的计数工具
    struct CountingTool(Arc<AtomicUsize>);

    #[async_trait]
    impl Tool for CountingTool {
        fn name(&self) -> &str {
            "deploy"
        }

        fn description(&self) -> &str {
            "side-effecting test tool"
        }

        async fn execute(&self, _args: Value) -> Result<String, String> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok("deployed".into())
        }
    }

    struct RejectAll;

    #[async_trait]
    impl ApprovalPort for RejectAll {
        async fn request_approval(&self, _request: &ApprovalRequest) -> ApprovalDecision {
            ApprovalDecision::Reject {
                comment: "not today".into(),
            }
        }

        async fn request_plan_approval(&self, _tasks: &[Task]) -> PlanDecision {
            PlanDecision::Approve
        }
    }

    fn dispatcher(counter: Arc<AtomicUsize>) -> Arc<dyn ToolDispatcher> {
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool);
        registry.register(CountingTool(counter));
        Arc::new(ToolExecutor::new(registry, 5))
    }

    fn final_answer(text: &str) -> AssistantMessage {
        AssistantMessage::text(text)
    }

    fn task() -> Task {
        Task::new("t1", "Say hi", "Echo hi")
    }

    fn echo_call() -> AssistantMessage {
        AssistantMessage::tool_call("echo", r#"{"text":"hi"}"#)
    }

    #[tokio::test]
    async fn test_immediate_final_answer_is_one_iteration() {
        let llm = Arc::new(ScriptedLlmClient::new(vec![Ok(final_answer("all done"))]));
        let tool_loop = ToolLoop::new(llm, dispatcher(Arc::default()), 5);
        let outcome = tool_loop.run(&task(), None).await.unwrap();
        assert_eq!(outcome.status, LoopStatus::Completed);
        assert_eq!(outcome.iterations, 1);
        assert_eq!(outcome.result_text, "all done");
    }

    #[tokio::test]
    async fn test_iteration_cap_fails_with_limit_reason() {
        let cap = 4;
        let llm = Arc::new(ScriptedLlmClient::new((0..cap).map(|_| Ok(echo_call()))));
        let tool_loop = ToolLoop::new(llm.clone(), dispatcher(Arc::default()), cap);
        let outcome = tool_loop.run(&task(), None).await.unwrap();
        assert_eq!(outcome.status, LoopStatus::Failed);
        assert_eq!(outcome.iterations, cap);
        assert_eq!(outcome.failure, Some(FailureReason::IterationLimitExceeded));
        assert_eq!(outcome.tool_calls, cap);
        assert_eq!(llm.remaining(), 0);
    }

    #[tokio::test]
    async fn test_tool_result_is_fed_back_to_model() {
        let llm = Arc::new(ScriptedLlmClient::new(vec![Ok(echo_call()), Ok(final_answer("ok"))]));
        let tool_loop = ToolLoop::new(llm.clone(), dispatcher(Arc::default()), 5);
        let outcome = tool_loop.run(&task(), None).await.unwrap();
        assert_eq!(outcome.iterations, 2);
        let requests = llm.requests();
        let second = &requests[1];
        let tool_msg = second.last().unwrap();
        assert_eq!(tool_msg.role, Role::Tool);
        assert_eq!(tool_msg.content, "hi");
        assert_eq!(tool_msg.tool_call_id.as_deref(), Some("call_0"));
    }

    #[tokio::test]
    async fn test_invalid_arguments_do_not_abort() {
        let llm = Arc::new(ScriptedLlmClient::new(vec![
            Ok(AssistantMessage::tool_call("echo", "not json at all")),
            Ok(final_answer("recovered")),
        ]));
        let tool_loop = ToolLoop::new(llm.clone(), dispatcher(Arc::default()), 5);
        let outcome = tool_loop.run(&task(), None).await.unwrap();
        assert_eq!(outcome.status, LoopStatus::Completed);
        assert_eq!(outcome.tool_errors.len(), 1);
        let requests = llm.requests();
        let fed_back = &requests[1].last().unwrap().content;
        assert!(fed_back.contains("Invalid arguments"));
    }

    #[tokio::test]
    async fn test_unknown_tool_is_fed_back() {
        let llm = Arc::new(ScriptedLlmClient::new(vec![
            Ok(AssistantMessage::tool_call("teleport", "{}")),
            Ok(final_answer("fine")),
        ]));
        let tool_loop = ToolLoop::new(llm.clone(), dispatcher(Arc::default()), 5);
        let outcome = tool_loop.run(&task(), None).await.unwrap();
        assert_eq!(outcome.status, LoopStatus::Completed);
        assert!(llm.requests()[1].last().unwrap().content.contains("Tool not found"));
    }

    #[tokio::test]
    async fn test_text_embedded_tool_call() {
        let llm = Arc::new(ScriptedLlmClient::new(vec![
            Ok(final_answer("```json\n{\"tool\": \"echo\", \"args\": {\"text\": \"via text\"},}\n```")),
            Ok(final_answer("done")),
        ]));
        let tool_loop = ToolLoop::new(llm.clone(), dispatcher(Arc::default()), 5);
        let outcome = tool_loop.run(&task(), None).await.unwrap();
        assert_eq!(outcome.tool_calls, 1);
        let last = llm.requests()[1].last().unwrap().clone();
        assert_eq!(last.role, Role::User);
        assert!(last.content.contains("via text"));
    }

    #[tokio::test]
    async fn test_transport_error_propagates() {
        let llm = Arc::new(ScriptedLlmClient::new(vec![Err(LlmError::Transport("down".into()))]));
        let tool_loop = ToolLoop::new(llm, dispatcher(Arc::default()), 5);
        let err = tool_loop.run(&task(), None).await.unwrap_err();
        assert!(matches!(err, AgentError::LlmError(_)));
    }

    #[tokio::test]
    async fn test_rejected_call_is_not_executed() {
        let counter = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(ApprovalGate::new(
            Arc::new(
                RiskGate::new(RiskConfig {
                    block_patterns: vec!["deploy".into()],
                    ..RiskConfig::default()
                })
                .unwrap(),
            ),
            Arc::new(RejectAll),
            true,
        ));
        let llm = Arc::new(ScriptedLlmClient::new(vec![
            Ok(AssistantMessage::tool_call("deploy", "{}")),
            Ok(final_answer("skipped deploy")),
        ]));
        let (notifier, mut rx) = ChannelNotifier::new();
        let tool_loop = ToolLoop::new(llm.clone(), dispatcher(counter.clone()), 5)
            .with_gate(gate)
            .with_notifier(Arc::new(notifier));
        let outcome = tool_loop.run(&task(), None).await.unwrap();
        assert_eq!(outcome.status, LoopStatus::Completed);
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert!(llm.requests()[1].last().unwrap().content.contains("not today"));

        let steps: Vec<ReactEvent> = std::iter::from_fn(|| rx.try_recv().ok())
            .filter_map(|e| match e {
                RunEvent::Tool { step, .. } => Some(step),
                _ => None,
            })
            .collect();
        assert!(steps.iter().any(|s| matches!(s, ReactEvent::ApprovalRequested { .. })));
        assert!(steps.iter().any(|s| matches!(s, ReactEvent::ToolRejected { .. })));
    }

    #[tokio::test]
    async fn test_cancelled_before_model_call() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let llm = Arc::new(ScriptedLlmClient::new(vec![Ok(final_answer("never"))]));
        let tool_loop =
            ToolLoop::new(llm.clone(), dispatcher(Arc::default()), 5).with_cancel_token(cancel);
        assert!(matches!(tool_loop.run(&task(), None).await, Err(AgentError::Cancelled)));
        assert_eq!(llm.remaining(), 1);
    }

    #[tokio::test]
    async fn test_debug_context_is_injected() {
        let llm = Arc::new(ScriptedLlmClient::new(vec![Ok(final_answer("ok"))]));
        let tool_loop = ToolLoop::new(llm.clone(), dispatcher(Arc::default()), 5);
        tool_loop
            .run(&task(), Some("previous attempt failed: boom"))
            .await
            .unwrap();
        let requests = llm.requests();
        let first = &requests[0];
        assert_eq!(first.len(), 3);
        assert!(first[2].content.contains("boom"));
    }

    #[test]
    fn test_parse_arguments_tolerance() {
        assert_eq!(parse_arguments("").unwrap(), serde_json::json!({}));
        assert_eq!(parse_arguments("  ").unwrap(), serde_json::json!({}));
        assert_eq!(parse_arguments(r#"{"a":1}"#).unwrap(), serde_json::json!({"a": 1}));
        assert_eq!(parse_arguments(r#"{"a":1,}"#).unwrap(), serde_json::json!({"a": 1}));
        assert!(parse_arguments("[1,2]").is_err());
        assert!(parse_arguments("garbage").is_err());
    }
}
