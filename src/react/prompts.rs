//! 默认提示词；config/prompts/*.md 存在时由 builder 覆盖

use crate::core::task::Task;

pub const DEFAULT_EXECUTOR_PROMPT: &str = "You are Hive, a coding assistant working inside a sandboxed workspace.
Complete the task you are given using the available tools. Call tools as needed; when the task is done,
reply with a short plain-text summary of what you did and do not call any more tools.
If your model cannot emit native tool calls, reply with exactly one JSON object of the form
{\"tool\": \"<name>\", \"args\": {...}} and nothing else.";

pub const DEFAULT_PLANNER_PROMPT: &str = "You are the planning stage of a coding assistant.
Break the user's request into a short ordered list of concrete tasks. Reply with JSON only, shaped as:
{\"tasks\": [{\"id\": \"task-1\", \"title\": \"...\", \"description\": \"...\", \"dependencies\": []}]}
Dependencies list the ids of tasks that must finish first. Do not create circular dependencies.";

/// 任务描述，作为工具调用循环的第一条 user 消息
pub fn task_prompt(task: &Task) -> String {
    let mut prompt = format!("Task {}: {}\n\n{}", task.id, task.title, task.description);
    if !task.dependencies.is_empty() {
        prompt.push_str(&format!(
            "\n\nThis task builds on the completed tasks: {}.",
            task.dependencies.join(", ")
        ));
    }
    prompt
}
