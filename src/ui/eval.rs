//! Eval 模式：stdin 读一条 JSON 请求，stdout 逐行输出 NDJSON 事件
//!
//! 每行形如 `{"event": "tool_call", "data": {...}}`，无论成功失败都以且仅以一条 `end` 结尾。
//! 审批一律自动通过。

use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde::Deserialize;
use serde_json::{json, Value};

use crate::config::AppConfig;
use crate::core::events::{NotificationPort, RunEvent};
use crate::core::state::ExecutionSummary;
use crate::core::{resolve_workspace, OrchestratorBuilder};
use crate::hitl::AutoApprove;
use crate::react::ReactEvent;

#[derive(Debug, Clone, Deserialize)]
pub struct EvalInput {
    pub prompt: String,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
}

/// 运行期间累计的统计，写进 end 事件
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvalStats {
    pub tool_calls: usize,
    pub files_modified: Vec<String>,
    /// 等待 tool_result 确认的 write_file 路径
    pending_write: Option<String>,
}

pub struct EvalNotifier {
    out: Mutex<Box<dyn Write + Send>>,
    stats: Mutex<EvalStats>,
}

impl EvalNotifier {
    pub fn new(out: impl Write + Send + 'static) -> Self {
        Self {
            out: Mutex::new(Box::new(out)),
            stats: Mutex::new(EvalStats::default()),
        }
    }

    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }

    pub fn stats(&self) -> EvalStats {
        self.stats.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// 写一行 NDJSON 并立即 flush
    pub fn emit(&self, event: &str, data: Value) {
        let line = json!({ "event": event, "data": data });
        let mut out = self.out.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(e) = writeln!(out, "{line}").and_then(|_| out.flush()) {
            tracing::warn!(error = %e, "failed to write eval event");
        }
    }

    pub fn error(&self, message: &str) {
        self.emit("error", json!({ "message": message }));
    }

    pub fn end(&self, summary: Option<&ExecutionSummary>, duration_ms: u64) {
        let stats = self.stats();
        let (success, total, completed, failed) = summary
            .map(|s| (s.success, s.total_tasks, s.completed_tasks, s.failed_tasks))
            .unwrap_or((false, 0, 0, 0));
        self.emit(
            "end",
            json!({
                "success": success,
                "duration_ms": duration_ms,
                "tool_calls": stats.tool_calls,
                "total_tasks": total,
                "completed_tasks": completed,
                "failed_tasks": failed,
                "files_modified": stats.files_modified,
            }),
        );
    }

    fn on_step(&self, task_id: &str, step: &ReactEvent) {
        match step {
            ReactEvent::ToolCall { tool, args } => {
                {
                    let mut stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
                    stats.tool_calls += 1;
                    stats.pending_write = (tool == "write_file")
                        .then(|| args.get("path").and_then(Value::as_str).map(String::from))
                        .flatten();
                }
                self.emit("tool_call", json!({ "task_id": task_id, "tool": tool, "args": args }));
            }
            ReactEvent::ToolResult { tool, ok, preview } => {
                {
                    let mut stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
                    if let Some(path) = stats.pending_write.take() {
                        if *ok && !stats.files_modified.contains(&path) {
                            stats.files_modified.push(path);
                        }
                    }
                }
                self.emit(
                    "tool_result",
                    json!({ "task_id": task_id, "tool": tool, "ok": ok, "preview": preview }),
                );
            }
            ReactEvent::FinalAnswer { text } => {
                self.emit("response", json!({ "task_id": task_id, "content": text }));
            }
            _ => {}
        }
    }
}

impl NotificationPort for EvalNotifier {
    fn notify(&self, event: &RunEvent) {
        match event {
            RunEvent::PlanCreated { tasks } => {
                let tasks: Vec<Value> = tasks
                    .iter()
                    .map(|t| json!({ "id": t.id, "title": t.title, "dependencies": t.dependencies }))
                    .collect();
                self.emit("plan", json!({ "tasks": tasks }));
            }
            RunEvent::TaskStarted { task, index } => {
                self.emit(
                    "task_started",
                    json!({ "id": task.id, "title": task.title, "index": index }),
                );
            }
            RunEvent::TaskCompleted { task } => {
                self.emit("task_completed", json!({ "id": task.id, "result": task.result }));
            }
            RunEvent::TaskFailed { task, reason } => {
                self.emit("task_failed", json!({ "id": task.id, "reason": reason }));
            }
            RunEvent::Tool { task_id, step } => self.on_step(task_id, step),
            RunEvent::TaskRetrying { .. } | RunEvent::ExecutionCompleted { .. } => {}
        }
    }
}

/// 跑一次 eval，返回是否成功；所有结果都已写成 NDJSON
pub async fn run_eval(raw_input: &str, config: AppConfig, notifier: Arc<EvalNotifier>) -> bool {
    let started = Instant::now();
    let elapsed_ms = || u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

    let session_id = uuid::Uuid::new_v4().to_string();
    let input: EvalInput = match serde_json::from_str(raw_input.trim()) {
        Ok(input) => input,
        Err(e) => {
            notifier.emit("start", json!({ "session_id": session_id, "prompt": "" }));
            notifier.error(&format!("invalid eval input: {e}"));
            notifier.end(None, elapsed_ms());
            return false;
        }
    };

    notifier.emit(
        "start",
        json!({ "session_id": session_id, "prompt": input.prompt }),
    );

    let workspace = input
        .working_dir
        .clone()
        .unwrap_or_else(|| resolve_workspace(&config));
    let orchestrator = match OrchestratorBuilder::new(config, workspace)
        .with_approval(Arc::new(AutoApprove))
        .with_notifier(notifier.clone())
        .build()
    {
        Ok(orchestrator) => orchestrator,
        Err(e) => {
            notifier.error(&e.to_string());
            notifier.end(None, elapsed_ms());
            return false;
        }
    };

    match orchestrator.run(&input.prompt).await {
        Ok(report) => {
            notifier.end(Some(&report.summary), elapsed_ms());
            report.summary.success
        }
        Err(e) => {
            notifier.error(&e.to_string());
            notifier.end(None, elapsed_ms());
            false
        }
    }
}
