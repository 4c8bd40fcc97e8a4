//! LLM 客户端抽象
//!
//! 所有后端（OpenAI 兼容 / Mock / Scripted）实现 LlmClient：complete(messages, tools) 返回一条助手消息。

use async_trait::async_trait;
use thiserror::Error;

use crate::llm::{AssistantMessage, Message, ToolDefinition};

/// 模型传输层错误；工具调用循环内不重试，交给调试重试层
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LlmError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("rate limited (retry after {retry_after_ms} ms)")]
    RateLimited { retry_after_ms: u64 },

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("request timed out after {0}s")]
    Timeout(u64),

    #[error("client misconfigured: {0}")]
    Config(String),
}

/// 模型客户端 trait
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// tools 为空时不向后端声明任何工具
    async fn complete(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
    ) -> Result<AssistantMessage, LlmError>;

    /// 获取累计 token 使用统计：(prompt_tokens, completion_tokens, total_tokens)
    /// 默认返回 (0, 0, 0)，具体实现可覆盖
    fn token_usage(&self) -> (u64, u64, u64) {
        (0, 0, 0)
    }
}
