//! Planner：把用户请求交给模型拆成任务列表
//!
//! 模型回复经结构化恢复得到 JSON，再解码为 PlanDocument（任务数组，或 {"tasks": [...]}）。
//! id 缺省时按位置生成 task-N；数字 id 与 depends_on 写法同样接受。

use std::sync::Arc;

use serde::Deserialize;

use crate::core::error::OrchestratorError;
use crate::core::task::Task;
use crate::core::AgentError;
use crate::llm::{LlmClient, Message};
use crate::react::prompts::DEFAULT_PLANNER_PROMPT;
use crate::structured;

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum IdRepr {
    Text(String),
    Number(i64),
}

impl IdRepr {
    fn into_string(self) -> String {
        match self {
            IdRepr::Text(s) => s.trim().to_string(),
            IdRepr::Number(n) => n.to_string(),
        }
    }
}

/// 模型给出的单个任务
#[derive(Debug, Clone, Deserialize)]
pub struct TaskSpec {
    #[serde(default)]
    id: Option<IdRepr>,
    #[serde(default, alias = "name")]
    title: String,
    #[serde(default, alias = "details")]
    description: String,
    #[serde(default, alias = "depends_on", alias = "dependsOn")]
    dependencies: Vec<IdRepr>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum PlanDocument {
    List(Vec<TaskSpec>),
    Wrapped { tasks: Vec<TaskSpec> },
}

/// 模型原始输出 -> 任务列表（尚未做依赖与环校验，交给 TaskBoard::set_plan）
pub fn parse_plan(raw: &str) -> Result<Vec<Task>, OrchestratorError> {
    let value = structured::recover(raw)?;
    let document: PlanDocument = serde_json::from_value(value).map_err(|e| {
        OrchestratorError::InvalidPlan(format!("plan does not match the expected shape: {e}"))
    })?;
    let specs = match document {
        PlanDocument::List(specs) | PlanDocument::Wrapped { tasks: specs } => specs,
    };

    specs
        .into_iter()
        .enumerate()
        .map(|(i, spec)| {
            let id = spec
                .id
                .map(IdRepr::into_string)
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| format!("task-{}", i + 1));
            let (title, description) = match (spec.title.trim(), spec.description.trim()) {
                ("", "") => {
                    return Err(OrchestratorError::InvalidPlan(format!(
                        "task '{id}' has neither a title nor a description"
                    )))
                }
                ("", d) => (d.lines().next().unwrap_or(d).to_string(), d.to_string()),
                (t, "") => (t.to_string(), t.to_string()),
                (t, d) => (t.to_string(), d.to_string()),
            };
            let dependencies = spec.dependencies.into_iter().map(IdRepr::into_string).collect::<Vec<_>>();
            Ok(Task::new(id, title, description).with_dependencies(dependencies))
        })
        .collect()
}

/// Planner：持有 LLM 与规划 system prompt
pub struct Planner {
    llm: Arc<dyn LlmClient>,
    system_prompt: String,
}

impl Planner {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self {
            llm,
            system_prompt: DEFAULT_PLANNER_PROMPT.to_string(),
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    /// 请求一份计划；correction 为上一次的原始输出与纠正提示
    pub async fn request_plan(
        &self,
        request: &str,
        correction: Option<(&str, &str)>,
    ) -> Result<String, AgentError> {
        let mut messages = vec![
            Message::system(self.system_prompt.clone()),
            Message::user(request.to_string()),
        ];
        if let Some((previous, prompt)) = correction {
            messages.push(Message::assistant(previous.to_string()));
            messages.push(Message::user(prompt.to_string()));
        }
        // 规划阶段不声明工具
        let reply = self.llm.complete(&messages, &[]).await?;
        Ok(reply.content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{AssistantMessage, ScriptedLlmClient};

    #[test]
    fn test_parse_wrapped_plan() {
        let raw = r#"Here is the plan:
```json
{"tasks": [
  {"id": "t1", "title": "Scaffold", "description": "Create files"},
  {"id": "t2", "title": "Test", "description": "Write tests", "dependencies": ["t1"]},
]}
```"#;
        let tasks = parse_plan(raw).unwrap();
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[1].dependencies, vec!["t1".to_string()]);
    }

    #[test]
    fn test_parse_bare_list_with_numeric_ids_and_alias() {
        let raw = r#"[{"id": 1, "title": "a"}, {"id": 2, "description": "do b\nmore", "depends_on": [1]}]"#;
        let tasks = parse_plan(raw).unwrap();
        assert_eq!(tasks[0].id, "1");
        assert_eq!(tasks[0].description, "a");
        assert_eq!(tasks[1].title, "do b");
        assert_eq!(tasks[1].dependencies, vec!["1".to_string()]);
    }

    #[test]
    fn test_missing_ids_are_positional() {
        let tasks = parse_plan(r#"{"tasks": [{"title": "x"}, {"title": "y"}]}"#).unwrap();
        assert_eq!(tasks[0].id, "task-1");
        assert_eq!(tasks[1].id, "task-2");
    }

    #[test]
    fn test_unparsable_and_wrong_shape() {
        assert!(matches!(
            parse_plan("I could not think of a plan."),
            Err(OrchestratorError::UnparsableOutput(_))
        ));
        assert!(matches!(
            parse_plan(r#"{"steps": "none"}"#),
            Err(OrchestratorError::InvalidPlan(_))
        ));
        assert!(matches!(
            parse_plan(r#"[{"id": "a"}]"#),
            Err(OrchestratorError::InvalidPlan(_))
        ));
    }

    #[tokio::test]
    async fn test_corrective_request_carries_previous_output() {
        let llm = Arc::new(ScriptedLlmClient::new(vec![Ok(AssistantMessage::text("[]"))]));
        let planner = Planner::new(llm.clone());
        planner
            .request_plan("build it", Some(("garbage", "reply with JSON")))
            .await
            .unwrap();
        let requests = llm.requests();
        let request = &requests[0];
        assert_eq!(request.len(), 4);
        assert_eq!(request[2].content, "garbage");
        assert_eq!(request[3].content, "reply with JSON");
    }
}
