//! Shell 工具：在工作区内执行白名单命令
//!
//! 首词必须在配置的 allowed_commands 中；即使在白名单内，含禁用子串（rm -rf、mkfs 等）也直接拒绝。
//! 有副作用，执行前会经过风险闸门。

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::process::Command;

use crate::tools::Tool;

/// 禁止的子串（不区分大小写）
const FORBIDDEN_SUBSTR: &[&str] = &[
    "rm -rf",
    "rm -fr",
    "curl | sh",
    "wget -o- | sh",
    "chmod 777",
    "chmod +s",
    "mkfs",
    "dd if=",
    "> /dev/sd",
    ":(){ :|:& };:",
];

/// 输出截断长度，避免把超长结果塞回模型上下文
const MAX_OUTPUT_CHARS: usize = 16_000;

pub struct ShellTool {
    allowed_commands: HashSet<String>,
    working_dir: PathBuf,
    timeout_secs: u64,
}

impl ShellTool {
    pub fn new(allowed_commands: Vec<String>, working_dir: impl AsRef<Path>, timeout_secs: u64) -> Self {
        Self {
            allowed_commands: allowed_commands.into_iter().map(|s| s.to_lowercase()).collect(),
            working_dir: working_dir.as_ref().to_path_buf(),
            timeout_secs,
        }
    }

    fn check(&self, raw: &str) -> Result<(), String> {
        let lower = raw.to_lowercase();
        if let Some(forbidden) = FORBIDDEN_SUBSTR.iter().find(|f| lower.contains(*f)) {
            return Err(format!("Forbidden pattern: {forbidden}"));
        }
        let name = lower.split_whitespace().next().unwrap_or("");
        if name.is_empty() {
            return Err("Empty command".to_string());
        }
        if self.allowed_commands.contains(name) {
            Ok(())
        } else {
            Err(format!("Command '{name}' not in allowlist"))
        }
    }
}

fn truncate(s: &str) -> String {
    if s.chars().count() > MAX_OUTPUT_CHARS {
        let head: String = s.chars().take(MAX_OUTPUT_CHARS).collect();
        format!("{head}\n... (output truncated)")
    } else {
        s.to_string()
    }
}

#[async_trait]
impl Tool for ShellTool {
    fn name(&self) -> &str {
        "shell"
    }

    fn description(&self) -> &str {
        "Run an allowlisted shell command in the workspace (first word must be allowed, e.g. ls, grep, cargo). \
         Args: {\"command\": \"cargo test\"}"
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The shell command to execute (must be in allowlist)"
                }
            },
            "required": ["command"]
        })
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        let command = args
            .get("command")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .trim();
        self.check(command)?;

        tracing::info!(command = %command, "shell tool execute");

        let mut cmd = if cfg!(target_os = "windows") {
            let mut c = Command::new("cmd");
            c.args(["/C", command]);
            c
        } else {
            let mut c = Command::new("sh");
            c.args(["-c", command]);
            c
        };
        cmd.current_dir(&self.working_dir).kill_on_drop(true);

        let output = tokio::time::timeout(Duration::from_secs(self.timeout_secs), cmd.output())
            .await
            .map_err(|_| format!("Command timed out after {}s", self.timeout_secs))?
            .map_err(|e| format!("Execution failed: {e}"))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() {
            return Err(truncate(&format!(
                "Exit {}\nstdout: {}\nstderr: {}",
                output.status.code().map_or("signal".to_string(), |c| c.to_string()),
                stdout.trim(),
                stderr.trim()
            )));
        }
        Ok(truncate(&if stderr.trim().is_empty() {
            stdout.to_string()
        } else {
            format!("{}\nstderr: {}", stdout.trim(), stderr.trim())
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tool(dir: &Path) -> ShellTool {
        ShellTool::new(vec!["echo".into(), "ls".into(), "false".into()], dir, 5)
    }

    #[test]
    fn test_allowlist_and_forbidden_patterns() {
        let dir = tempfile::tempdir().unwrap();
        let shell = tool(dir.path());
        assert!(shell.check("echo hi").is_ok());
        assert!(shell.check("LS -la").is_ok());
        assert!(shell.check("cargo build").unwrap_err().contains("not in allowlist"));
        assert!(shell.check("echo x; rm -rf /").unwrap_err().contains("Forbidden"));
        assert!(shell.check("   ").unwrap_err().contains("Empty"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_runs_in_working_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("marker.txt"), "").unwrap();
        let out = tool(dir.path())
            .execute(serde_json::json!({"command": "ls"}))
            .await
            .unwrap();
        assert!(out.contains("marker.txt"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_nonzero_exit_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = tool(dir.path())
            .execute(serde_json::json!({"command": "false"}))
            .await
            .unwrap_err();
        assert!(err.starts_with("Exit 1"));
    }
}
