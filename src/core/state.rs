//! 运行状态：阶段、只追加的运行日志、执行摘要与最终报告
//!
//! RunLog 的每条记录同时镜像到 tracing，最终随 RunReport 一起交给调用方。

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::core::task::Task;

/// 整次运行所处阶段
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Planning,
    Executing,
    /// 某个任务失败后带着错误上下文重跑
    Debugging,
    Completed,
    Failed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Debug,
    Warning,
    Error,
}

/// 日志条目，追加后不再修改
#[derive(Clone, Debug, Serialize)]
pub struct LogEntry {
    pub level: LogLevel,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// 只追加的运行日志
#[derive(Clone, Debug, Default)]
pub struct RunLog {
    entries: Vec<LogEntry>,
}

impl RunLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, level: LogLevel, message: impl Into<String>) {
        let message = message.into();
        match level {
            LogLevel::Info => tracing::info!(target: "hive::run", "{}", message),
            LogLevel::Debug => tracing::debug!(target: "hive::run", "{}", message),
            LogLevel::Warning => tracing::warn!(target: "hive::run", "{}", message),
            LogLevel::Error => tracing::error!(target: "hive::run", "{}", message),
        }
        self.entries.push(LogEntry {
            level,
            message,
            timestamp: Utc::now(),
        });
    }

    pub fn info(&mut self, message: impl Into<String>) {
        self.append(LogLevel::Info, message);
    }

    pub fn debug(&mut self, message: impl Into<String>) {
        self.append(LogLevel::Debug, message);
    }

    pub fn warning(&mut self, message: impl Into<String>) {
        self.append(LogLevel::Warning, message);
    }

    pub fn error(&mut self, message: impl Into<String>) {
        self.append(LogLevel::Error, message);
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// 运行结束时产出一次的摘要
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionSummary {
    pub total_tasks: usize,
    pub completed_tasks: usize,
    pub failed_tasks: usize,
    pub duration_ms: u64,
    pub success: bool,
}

/// run() 的返回值：摘要 + 最终任务表 + 全部日志
#[derive(Clone, Debug, Serialize)]
pub struct RunReport {
    pub summary: ExecutionSummary,
    pub tasks: Vec<Task>,
    pub logs: Vec<LogEntry>,
    pub cancelled: bool,
}

impl RunReport {
    pub fn task(&self, id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_log_is_ordered_append_only() {
        let mut log = RunLog::new();
        log.info("first");
        log.warning("second");
        log.error("third");
        let messages: Vec<_> = log.entries().iter().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, vec!["first", "second", "third"]);
        assert_eq!(log.entries()[1].level, LogLevel::Warning);
        assert!(log.entries()[0].timestamp <= log.entries()[2].timestamp);
    }

    #[test]
    fn test_summary_serializes_camel_case() {
        let summary = ExecutionSummary {
            total_tasks: 3,
            completed_tasks: 2,
            failed_tasks: 1,
            duration_ms: 10,
            success: false,
        };
        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["totalTasks"], 3);
        assert_eq!(json["failedTasks"], 1);
        assert_eq!(json["success"], false);
    }
}
