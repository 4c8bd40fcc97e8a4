//! 文本工具调用的 JSON Schema（schemars 生成）
//!
//! 不支持原生 tool calling 的模型可以直接回复 `{"tool": "...", "args": {...}}`；
//! 该 schema 拼入 system prompt，减少格式错误。

use schemars::{schema_for, JsonSchema};
use serde::Deserialize;

/// 文本形式的工具调用：与工具调用循环解析的 `{"tool": "...", "args": {...}}` 一致
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct TextToolCall {
    /// 工具名，如 cat、ls、echo、write_file、shell
    pub tool: String,
    /// 工具参数，依工具不同而不同（path、content、command、text 等）
    #[serde(default)]
    pub args: serde_json::Value,
}

/// 返回工具调用的 JSON Schema 字符串，可拼入 system prompt
pub fn tool_call_schema_json() -> String {
    let schema = schema_for!(TextToolCall);
    serde_json::to_string_pretty(&schema).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_names_both_fields() {
        let schema = tool_call_schema_json();
        assert!(schema.contains("\"tool\""));
        assert!(schema.contains("\"args\""));
    }
}
