//! 结构化输出恢复：从任意模型文本中提取并修复 JSON
//!
//! 按顺序尝试（首个成功即返回）：
//! 1. ```json 代码块；2. 任意代码块；3. 从首个括号开始的配对扫描；4. 整段文本。
//!
//! 每次尝试都先做清洗：剥离 `//` 与 `/* */` 注释、删除 `}`/`]` 前的尾逗号、
//! 无双引号时把单引号归一化为双引号、转义字符串内的控制字符。
//! 仍解析失败则做截断修复：补全未闭合的字符串与括号。
//!
//! 结果必须是对象或数组；裸标量视为失败。纯函数，无 I/O、无共享状态。

use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

/// 所有策略均失败
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unparsable model output: {reason}")]
pub struct UnparsableOutput {
    pub reason: String,
}

impl UnparsableOutput {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// 从模型原始文本恢复出一个 JSON 对象或数组
pub fn recover(raw: &str) -> Result<Value, UnparsableOutput> {
    let text = raw.trim();
    if text.is_empty() {
        return Err(UnparsableOutput::new("empty output"));
    }
    if let Ok(value) = serde_json::from_str::<Value>(text) {
        if value.is_object() || value.is_array() {
            return Ok(value);
        }
    }

    let mut last_error = String::from("no JSON object or array found");
    for candidate in candidates(text) {
        match parse_candidate(&candidate) {
            Ok(value) => return Ok(value),
            Err(e) => last_error = e,
        }
    }
    Err(UnparsableOutput::new(last_error))
}

/// recover 之后再反序列化为具体类型（形状不符同样视为 UnparsableOutput）
pub fn recover_as<T: DeserializeOwned>(raw: &str) -> Result<T, UnparsableOutput> {
    let value = recover(raw)?;
    serde_json::from_value(value)
        .map_err(|e| UnparsableOutput::new(format!("unexpected JSON shape: {e}")))
}

/// 按策略顺序生成候选片段
fn candidates(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    if let Some(block) = fenced_block(text, Some("json")) {
        out.push(block.to_string());
    }
    if let Some(block) = fenced_block(text, None) {
        out.push(block.to_string());
    }
    out.extend(bracket_scans(text));
    out.push(text.to_string());
    out
}

/// 提取代码块内容；label 为 None 时接受任意语言标记。未闭合的代码块取到文本末尾。
fn fenced_block<'a>(text: &'a str, label: Option<&str>) -> Option<&'a str> {
    let mut search_from = 0;
    while let Some(rel) = text[search_from..].find("```") {
        let open = search_from + rel;
        let after = &text[open + 3..];
        let tag_len = after
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_' || c == '-'))
            .unwrap_or(after.len());
        let tag = &after[..tag_len];
        let body = &after[tag_len..];
        let close = body.find("```");
        let accepted = match label {
            Some(l) => tag.eq_ignore_ascii_case(l),
            None => true,
        };
        if accepted {
            let content = match close {
                Some(end) => &body[..end],
                None => body,
            };
            return Some(content.trim());
        }
        match close {
            Some(end) => search_from = open + 3 + tag_len + end + 3,
            None => return None,
        }
    }
    None
}

/// 从首个 `{` 或 `[` 开始做配对扫描；两种括号都出现时，位置靠前的先尝试
fn bracket_scans(text: &str) -> Vec<String> {
    let single_quotes = !text.contains('"');
    let mut starts: Vec<usize> = ['{', '[']
        .iter()
        .filter_map(|open| text.find(*open))
        .collect();
    starts.sort_unstable();
    starts
        .into_iter()
        .map(|start| balanced_from(&text[start..], single_quotes).to_string())
        .collect()
}

/// 跟踪嵌套深度（跳过字符串内容与转义），返回到配对括号为止的片段；
/// 未闭合时返回剩余全部文本，交给截断修复。
fn balanced_from(text: &str, single_quotes: bool) -> &str {
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut escaped = false;
    for (i, c) in text.char_indices() {
        if let Some(q) = quote {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '"' => quote = Some('"'),
            '\'' if single_quotes => quote = Some('\''),
            '{' | '[' => depth += 1,
            '}' | ']' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return &text[..i + c.len_utf8()];
                }
            }
            _ => {}
        }
    }
    text
}

fn parse_candidate(candidate: &str) -> Result<Value, String> {
    let cleaned = clean(candidate);
    let parsed = match serde_json::from_str::<Value>(&cleaned) {
        Ok(v) => v,
        Err(first) => {
            let repaired = repair_truncation(&cleaned);
            serde_json::from_str::<Value>(&repaired).map_err(|_| first.to_string())?
        }
    };
    match parsed {
        Value::Object(_) | Value::Array(_) => Ok(parsed),
        other => Err(format!("expected object or array, got {}", kind_of(&other))),
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn clean(candidate: &str) -> String {
    let single_quotes = !candidate.contains('"');
    let s = strip_comments(candidate, single_quotes);
    let s = strip_trailing_commas(&s);
    let s = if single_quotes { s.replace('\'', "\"") } else { s };
    escape_control_chars(&s)
}

/// 剥离 `//...` 与 `/*...*/`，字符串内部（如 URL）不受影响
fn strip_comments(s: &str, single_quotes: bool) -> String {
    let chars: Vec<char> = s.chars().collect();
    let mut out = String::with_capacity(s.len());
    let mut quote: Option<char> = None;
    let mut escaped = false;
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if let Some(q) = quote {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == q {
                quote = None;
            }
            i += 1;
            continue;
        }
        if c == '"' || (single_quotes && c == '\'') {
            quote = Some(c);
            out.push(c);
            i += 1;
            continue;
        }
        if c == '/' && chars.get(i + 1) == Some(&'/') {
            while i < chars.len() && chars[i] != '\n' {
                i += 1;
            }
            continue;
        }
        if c == '/' && chars.get(i + 1) == Some(&'*') {
            i += 2;
            while i < chars.len() && !(chars[i] == '*' && chars.get(i + 1) == Some(&'/')) {
                i += 1;
            }
            i = (i + 2).min(chars.len());
            continue;
        }
        out.push(c);
        i += 1;
    }
    out
}

/// 删除紧跟（可有空白）`}` 或 `]` 之前的逗号
fn strip_trailing_commas(s: &str) -> String {
    let chars: Vec<char> = s.chars().collect();
    let mut out = String::with_capacity(s.len());
    let mut in_string = false;
    let mut escaped = false;
    for (i, &c) in chars.iter().enumerate() {
        if in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        if c == '"' {
            in_string = true;
        } else if c == ',' {
            let next = chars[i + 1..].iter().find(|ch| !ch.is_whitespace());
            if matches!(next, Some('}') | Some(']')) {
                continue;
            }
        }
        out.push(c);
    }
    out
}

/// 字符串字面量内：换行 -> \n，制表符 -> \t，其它控制字符 -> \uXXXX
fn escape_control_chars(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut in_string = false;
    let mut escaped = false;
    for c in s.chars() {
        if !in_string {
            if c == '"' {
                in_string = true;
            }
            out.push(c);
            continue;
        }
        if escaped {
            escaped = false;
            out.push(c);
            continue;
        }
        match c {
            '\\' => {
                escaped = true;
                out.push(c);
            }
            '"' => {
                in_string = false;
                out.push(c);
            }
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => out.push_str(&format!("\\u{:04x}", c as u32)),
            c => out.push(c),
        }
    }
    out
}

/// 截断修复：闭合未结束的字符串，按嵌套顺序补齐缺失的 `}` / `]`
fn repair_truncation(s: &str) -> String {
    let s = s.trim_end();
    let mut stack: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;
    for c in s.chars() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' | '[' => stack.push(c),
            '}' | ']' => {
                stack.pop();
            }
            _ => {}
        }
    }

    let mut out = s.to_string();
    if in_string {
        if escaped {
            out.pop();
        }
        out.push('"');
    }
    while let Some(open) = stack.pop() {
        out.push(if open == '{' { '}' } else { ']' });
    }
    strip_trailing_commas(&out)
}
