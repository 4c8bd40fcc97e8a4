//! 任务状态机
//!
//! TaskBoard 持有按计划顺序排列的任务表：
//! - set_plan 整体替换任务表，拒绝未知依赖、重复 id 与环（Kahn 拓扑检查）
//! - next_ready_task 按计划顺序返回第一个依赖全部完成的 pending 任务
//! - transition 校验 pending -> in_progress -> completed | failed，每次迁移追加一条日志

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::error::{FailureReason, OrchestratorError};
use crate::core::state::{ExecutionSummary, RunLog};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// 单个任务
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    pub description: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// 已执行的工具循环次数（首跑 + 调试重试）
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    /// 完成时的最终回答
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
}

impl Task {
    pub fn new(id: impl Into<String>, title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: description.into(),
            status: TaskStatus::Pending,
            dependencies: Vec::new(),
            attempts: 0,
            failure_reason: None,
            result: None,
        }
    }

    pub fn with_dependencies<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }
}

/// 任务表 + 运行日志
#[derive(Debug, Default)]
pub struct TaskBoard {
    tasks: Vec<Task>,
    /// id -> tasks 下标
    index: HashMap<String, usize>,
    log: RunLog,
}

impl TaskBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// 整体替换任务表；校验失败时保持原任务表不变
    pub fn set_plan(&mut self, tasks: Vec<Task>) -> Result<(), OrchestratorError> {
        let mut index = HashMap::with_capacity(tasks.len());
        for (i, task) in tasks.iter().enumerate() {
            if task.id.trim().is_empty() {
                return Err(OrchestratorError::InvalidPlan(format!(
                    "task at position {} has an empty id",
                    i + 1
                )));
            }
            if index.insert(task.id.clone(), i).is_some() {
                return Err(OrchestratorError::InvalidPlan(format!(
                    "duplicate task id '{}'",
                    task.id
                )));
            }
        }
        for task in &tasks {
            for dep in &task.dependencies {
                if !index.contains_key(dep) {
                    return Err(OrchestratorError::InvalidPlan(format!(
                        "task '{}' depends on unknown task '{}'",
                        task.id, dep
                    )));
                }
            }
        }
        if let Some(cycle) = find_cycle(&tasks, &index) {
            return Err(OrchestratorError::InvalidPlan(format!(
                "dependency cycle among tasks {:?}",
                cycle
            )));
        }

        let replaced = self.tasks.len();
        self.tasks = tasks
            .into_iter()
            .map(|mut t| {
                t.status = TaskStatus::Pending;
                t.attempts = 0;
                t.failure_reason = None;
                t.result = None;
                t
            })
            .collect();
        self.index = index;
        if replaced > 0 {
            self.log.info(format!("Plan replaced ({} previous tasks superseded)", replaced));
        }
        self.log.info(format!("Plan loaded with {} tasks", self.tasks.len()));
        Ok(())
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn get(&self, id: &str) -> Option<&Task> {
        self.index.get(id).map(|&i| &self.tasks[i])
    }

    fn get_mut(&mut self, id: &str) -> Result<&mut Task, OrchestratorError> {
        match self.index.get(id) {
            Some(&i) => Ok(&mut self.tasks[i]),
            None => Err(OrchestratorError::UnknownTask(id.to_string())),
        }
    }

    /// 任务在计划中的下标（从 0 开始）
    pub fn position(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    fn status_of(&self, id: &str) -> Option<TaskStatus> {
        self.get(id).map(|t| t.status)
    }

    fn dependencies_completed(&self, task: &Task) -> bool {
        task.dependencies
            .iter()
            .all(|d| self.status_of(d) == Some(TaskStatus::Completed))
    }

    pub fn next_ready_task(&self) -> Option<&Task> {
        self.tasks
            .iter()
            .find(|t| t.status == TaskStatus::Pending && self.dependencies_completed(t))
    }

    pub fn transition(&mut self, id: &str, to: TaskStatus) -> Result<(), OrchestratorError> {
        let from = self
            .status_of(id)
            .ok_or_else(|| OrchestratorError::UnknownTask(id.to_string()))?;

        let allowed = match (from, to) {
            (TaskStatus::Pending, TaskStatus::InProgress) => self
                .get(id)
                .map_or(false, |t| self.dependencies_completed(t)),
            (TaskStatus::InProgress, TaskStatus::Completed)
            | (TaskStatus::InProgress, TaskStatus::Failed) => true,
            _ => false,
        };
        if !allowed {
            self.log.error(format!("Rejected transition for task {id}: {from} -> {to}"));
            return Err(OrchestratorError::InvalidTransition {
                task_id: id.to_string(),
                from: from.to_string(),
                to: to.to_string(),
            });
        }

        self.get_mut(id)?.status = to;
        self.log.info(format!("Task {id}: {from} -> {to}"));
        Ok(())
    }

    /// 记录一次工具循环尝试，返回累计次数
    pub fn record_attempt(&mut self, id: &str) -> Result<u32, OrchestratorError> {
        let task = self.get_mut(id)?;
        task.attempts += 1;
        Ok(task.attempts)
    }

    pub fn complete(&mut self, id: &str, result: impl Into<String>) -> Result<(), OrchestratorError> {
        self.transition(id, TaskStatus::Completed)?;
        self.get_mut(id)?.result = Some(result.into());
        Ok(())
    }

    pub fn fail(&mut self, id: &str, reason: &FailureReason) -> Result<(), OrchestratorError> {
        self.transition(id, TaskStatus::Failed)?;
        self.get_mut(id)?.failure_reason = Some(reason.to_string());
        self.log.error(format!("Task {id} failed: {reason}"));
        Ok(())
    }

    /// 每个任务都已 completed 或 failed（空计划视为完成）
    pub fn is_complete(&self) -> bool {
        self.tasks.iter().all(|t| t.status.is_terminal())
    }

    /// pending 且（传递）依赖中存在 failed 任务
    pub fn is_blocked(&self, id: &str) -> bool {
        let mut seen = HashSet::new();
        let mut queue: VecDeque<&str> = VecDeque::new();
        if let Some(task) = self.get(id) {
            if task.status != TaskStatus::Pending {
                return false;
            }
            queue.extend(task.dependencies.iter().map(String::as_str));
        }
        while let Some(dep) = queue.pop_front() {
            if !seen.insert(dep) {
                continue;
            }
            if let Some(t) = self.get(dep) {
                if t.status == TaskStatus::Failed {
                    return true;
                }
                queue.extend(t.dependencies.iter().map(String::as_str));
            }
        }
        false
    }

    /// 既不就绪也未被失败依赖阻塞的 pending 任务
    pub fn stuck_tasks(&self) -> Vec<String> {
        self.tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Pending)
            .filter(|t| !self.dependencies_completed(t) && !self.is_blocked(&t.id))
            .map(|t| t.id.clone())
            .collect()
    }

    pub fn count(&self, status: TaskStatus) -> usize {
        self.tasks.iter().filter(|t| t.status == status).count()
    }

    pub fn summary(&self, duration_ms: u64) -> ExecutionSummary {
        let total_tasks = self.tasks.len();
        let completed_tasks = self.count(TaskStatus::Completed);
        let failed_tasks = self.count(TaskStatus::Failed);
        ExecutionSummary {
            total_tasks,
            completed_tasks,
            failed_tasks,
            duration_ms,
            success: failed_tasks == 0 && completed_tasks == total_tasks,
        }
    }

    pub fn log(&self) -> &RunLog {
        &self.log
    }

    pub fn log_mut(&mut self) -> &mut RunLog {
        &mut self.log
    }
}

/// Kahn 拓扑检查：返回无法排出的任务 id（即位于环上或依赖环的任务）
fn find_cycle(tasks: &[Task], index: &HashMap<String, usize>) -> Option<Vec<String>> {
    let mut in_degree = vec![0usize; tasks.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); tasks.len()];
    for (i, task) in tasks.iter().enumerate() {
        for dep in &task.dependencies {
            if let Some(&d) = index.get(dep) {
                in_degree[i] += 1;
                dependents[d].push(i);
            }
        }
    }

    let mut queue: VecDeque<usize> = (0..tasks.len()).filter(|&i| in_degree[i] == 0).collect();
    let mut visited = 0;
    while let Some(i) = queue.pop_front() {
        visited += 1;
        for &next in &dependents[i] {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                queue.push_back(next);
            }
        }
    }

    if visited == tasks.len() {
        None
    } else {
        Some(
            tasks
                .iter()
                .enumerate()
                .filter(|(i, _)| in_degree[*i] > 0)
                .map(|(_, t)| t.id.clone())
                .collect(),
        )
    }
}
