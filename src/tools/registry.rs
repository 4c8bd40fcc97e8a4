//! 工具注册表
//!
//! 所有工具实现 Tool trait（name / description / parameters_schema / side_effects / execute），
//! 由 ToolRegistry 按名注册与查找；模型按名字选择工具，未注册的名字返回 None 由上层转成 ToolNotFound。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::llm::ToolDefinition;

/// 工具 trait：名称、描述（供 LLM 理解）、参数 schema、是否有副作用、异步执行（args 为 JSON）
#[async_trait]
pub trait Tool: Send + Sync {
    /// 工具名称（模型调用时使用）
    fn name(&self) -> &str;

    /// 工具描述（供 LLM 理解功能）
    fn description(&self) -> &str;

    /// 参数 JSON Schema；默认空对象，表示无参数或参数格式不限
    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {},
            "required": []
        })
    }

    /// 有副作用的工具在执行前需经过风险闸门；只读工具直接执行
    fn side_effects(&self) -> bool {
        true
    }

    async fn execute(&self, args: Value) -> Result<String, String>;
}

/// 工具注册表：按名称存储 Arc<dyn Tool>
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        let name = tool.name().to_string();
        if self.tools.insert(name.clone(), Arc::new(tool)).is_some() {
            tracing::warn!(tool = %name, "tool re-registered, previous definition replaced");
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// 按名称排序，保证每次发给模型的工具顺序一致
    pub fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tool_names()
            .into_iter()
            .filter_map(|name| self.tools.get(&name).map(|t| (name, t)))
            .map(|(name, tool)| ToolDefinition {
                name,
                description: tool.description().to_string(),
                parameters: tool.parameters_schema(),
            })
            .collect()
    }

    /// 工具列表的 JSON，拼入 system prompt 供不支持原生工具调用的模型参考
    pub fn to_schema_json(&self) -> String {
        serde_json::to_string_pretty(&self.definitions()).unwrap_or_else(|_| "[]".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::EchoTool;

    #[test]
    fn test_register_and_lookup() {
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool);
        assert!(registry.get("echo").is_some());
        assert!(registry.get("missing").is_none());
        assert_eq!(registry.tool_names(), vec!["echo".to_string()]);
    }

    #[test]
    fn test_definitions_carry_schema() {
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool);
        let defs = registry.definitions();
        assert_eq!(defs.len(), 1);
        assert_eq!(defs[0].parameters["required"][0], "text");
        assert!(registry.to_schema_json().contains("\"echo\""));
    }
}
