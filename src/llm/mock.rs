//! 测试与离线用的 LLM 客户端
//!
//! - MockLlmClient：无需 API，规划调用返回单任务计划，执行时先调用 echo 再给出最终回答
//! - ScriptedLlmClient：按顺序吐出预设的回复或错误，并记录每次请求，用于确定性测试

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::llm::{AssistantMessage, LlmClient, LlmError, Message, Role, ToolDefinition};

/// Mock 客户端：走通 规划 -> 工具调用 -> 最终回答 的完整流程
#[derive(Debug, Default)]
pub struct MockLlmClient;

fn last_content(messages: &[Message], role: Role) -> Option<&str> {
    messages
        .iter()
        .rev()
        .find(|m| m.role == role)
        .map(|m| m.content.as_str())
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
    ) -> Result<AssistantMessage, LlmError> {
        let last_user = last_content(messages, Role::User).unwrap_or("(no input)");

        // 规划调用不声明工具
        if tools.is_empty() {
            let plan = serde_json::json!({
                "tasks": [{
                    "id": "task-1",
                    "title": "Handle request",
                    "description": last_user,
                    "dependencies": []
                }]
            });
            return Ok(AssistantMessage::text(format!("```json\n{plan}\n```")));
        }

        if let Some(last) = messages.last() {
            if last.role == Role::Tool {
                return Ok(AssistantMessage::text(format!("Done: {}", last.content)));
            }
        }

        let args = serde_json::json!({ "text": format!("Echo from Mock: {last_user}") });
        Ok(AssistantMessage::tool_call("echo", args.to_string()))
    }
}

/// 预设脚本客户端：队列耗尽后返回 Transport 错误
#[derive(Debug, Default)]
pub struct ScriptedLlmClient {
    script: Mutex<VecDeque<Result<AssistantMessage, LlmError>>>,
    requests: Mutex<Vec<Vec<Message>>>,
}

impl ScriptedLlmClient {
    pub fn new(script: impl IntoIterator<Item = Result<AssistantMessage, LlmError>>) -> Self {
        Self {
            script: Mutex::new(script.into_iter().collect()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn push(&self, reply: Result<AssistantMessage, LlmError>) {
        self.script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(reply);
    }

    /// 至今收到的全部请求（每次请求的完整消息列表）
    pub fn requests(&self) -> Vec<Vec<Message>> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn remaining(&self) -> usize {
        self.script.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[async_trait]
impl LlmClient for ScriptedLlmClient {
    async fn complete(
        &self,
        messages: &[Message],
        _tools: &[ToolDefinition],
    ) -> Result<AssistantMessage, LlmError> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(messages.to_vec());
        self.script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
            .unwrap_or_else(|| Err(LlmError::Transport("script exhausted".to_string())))
    }
}
