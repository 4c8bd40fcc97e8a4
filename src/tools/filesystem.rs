//! 沙箱文件系统工具
//!
//! SafeFs 绑定 root_dir，所有路径必须落在 root 下（禁止 ../ 与绝对路径逃逸）；
//! CatTool / LsTool 只读，WriteFileTool 会创建或覆盖文件，需经过风险闸门。

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use serde_json::Value;

use crate::core::AgentError;
use crate::tools::Tool;

/// 单次写入上限
const MAX_WRITE_BYTES: usize = 10 * 1024 * 1024;

/// 沙箱文件系统：绑定根目录，防止路径逃逸
#[derive(Debug, Clone)]
pub struct SafeFs {
    root_dir: PathBuf,
}

impl SafeFs {
    pub fn new(root_dir: impl AsRef<Path>) -> Self {
        let root = root_dir.as_ref().to_path_buf();
        let root_dir = root.canonicalize().unwrap_or(root);
        Self { root_dir }
    }

    pub fn root(&self) -> &Path {
        &self.root_dir
    }

    /// 已存在路径：canonicalize 后必须仍在 root 下（顺带拦截符号链接逃逸）
    pub fn resolve(&self, path: &str) -> Result<PathBuf, AgentError> {
        let relative = self.normalize(path)?;
        let full = self.root_dir.join(&relative);
        let canonical = full
            .canonicalize()
            .map_err(|_| AgentError::ToolExecutionFailed(format!("Path not found: {path}")))?;
        if canonical.starts_with(&self.root_dir) {
            Ok(canonical)
        } else {
            Err(AgentError::PathEscape(path.to_string()))
        }
    }

    /// 词法归一化：拒绝绝对路径，以及 .. 越过根目录的相对路径
    fn normalize(&self, path: &str) -> Result<PathBuf, AgentError> {
        let mut out = PathBuf::new();
        for component in Path::new(path.trim()).components() {
            match component {
                Component::Normal(part) => out.push(part),
                Component::CurDir => {}
                Component::ParentDir => {
                    if !out.pop() {
                        return Err(AgentError::PathEscape(path.to_string()));
                    }
                }
                Component::RootDir | Component::Prefix(_) => {
                    return Err(AgentError::PathEscape(path.to_string()));
                }
            }
        }
        Ok(out)
    }

    pub fn read_file(&self, path: &str) -> Result<String, AgentError> {
        let resolved = self.resolve(path)?;
        std::fs::read_to_string(&resolved)
            .map_err(|e| AgentError::ToolExecutionFailed(format!("Read failed: {e}")))
    }

    pub fn list_dir(&self, path: &str) -> Result<Vec<String>, AgentError> {
        let base = if path.is_empty() || path == "." {
            self.root_dir.clone()
        } else {
            self.resolve(path)?
        };
        let mut entries = Vec::new();
        for e in std::fs::read_dir(&base)
            .map_err(|e| AgentError::ToolExecutionFailed(format!("List failed: {e}")))?
        {
            let e = e.map_err(|e| AgentError::ToolExecutionFailed(e.to_string()))?;
            let name = e.file_name().to_string_lossy().to_string();
            if !name.starts_with('.') {
                let ty = if e.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                    "/"
                } else {
                    ""
                };
                entries.push(format!("{name}{ty}"));
            }
        }
        entries.sort();
        Ok(entries)
    }

    /// 写文件：自动创建父目录，父目录 canonicalize 后仍须在 root 下
    pub fn write_file(&self, path: &str, content: &str) -> Result<PathBuf, AgentError> {
        let relative = self.normalize(path)?;
        if relative.as_os_str().is_empty() {
            return Err(AgentError::ToolExecutionFailed("Empty file path".to_string()));
        }
        let target = self.root_dir.join(&relative);
        let parent = target
            .parent()
            .ok_or_else(|| AgentError::PathEscape(path.to_string()))?;
        std::fs::create_dir_all(parent).map_err(|e| {
            AgentError::ToolExecutionFailed(format!("Failed to create parent directory: {e}"))
        })?;
        let parent = parent
            .canonicalize()
            .map_err(|e| AgentError::ToolExecutionFailed(e.to_string()))?;
        if !parent.starts_with(&self.root_dir) {
            return Err(AgentError::PathEscape(path.to_string()));
        }
        std::fs::write(&target, content)
            .map_err(|e| AgentError::ToolExecutionFailed(format!("Write failed: {e}")))?;
        Ok(target)
    }
}

/// Cat 工具：读取文件内容
pub struct CatTool {
    fs: SafeFs,
}

impl CatTool {
    pub fn new(root_dir: impl AsRef<Path>) -> Self {
        Self {
            fs: SafeFs::new(root_dir),
        }
    }
}

#[async_trait]
impl Tool for CatTool {
    fn name(&self) -> &str {
        "cat"
    }

    fn description(&self) -> &str {
        "Read file contents. Args: {\"path\": \"file path relative to workspace\"}"
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "File path relative to the workspace" }
            },
            "required": ["path"]
        })
    }

    fn side_effects(&self) -> bool {
        false
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        let path = args.get("path").and_then(|v| v.as_str()).unwrap_or("");
        tracing::info!(path = %path, "cat tool execute");
        self.fs.read_file(path).map_err(|e| e.to_string())
    }
}

/// Ls 工具：列出目录
pub struct LsTool {
    fs: SafeFs,
}

impl LsTool {
    pub fn new(root_dir: impl AsRef<Path>) -> Self {
        Self {
            fs: SafeFs::new(root_dir),
        }
    }
}

#[async_trait]
impl Tool for LsTool {
    fn name(&self) -> &str {
        "ls"
    }

    fn description(&self) -> &str {
        "List directory. Args: {\"path\": \"directory path, default '.'\"}"
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "Directory relative to the workspace" }
            },
            "required": []
        })
    }

    fn side_effects(&self) -> bool {
        false
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        let path = args.get("path").and_then(|v| v.as_str()).unwrap_or(".");
        tracing::info!(path = %path, "ls tool execute");
        let entries = self.fs.list_dir(path).map_err(|e| e.to_string())?;
        Ok(entries.join("\n"))
    }
}

/// 写文件工具：创建或覆盖工作区内的文件
pub struct WriteFileTool {
    fs: SafeFs,
}

impl WriteFileTool {
    pub fn new(root_dir: impl AsRef<Path>) -> Self {
        Self {
            fs: SafeFs::new(root_dir),
        }
    }
}

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Create or overwrite a file in the workspace. Parent directories are created automatically. \
         Args: {\"path\": \"relative path\", \"content\": \"full file content\"}"
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "File path relative to the workspace" },
                "content": { "type": "string", "description": "Complete new file content" }
            },
            "required": ["path", "content"]
        })
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        let path = args
            .get("path")
            .and_then(|v| v.as_str())
            .ok_or("Missing required parameter: path")?;
        let content = args
            .get("content")
            .and_then(|v| v.as_str())
            .ok_or("Missing required parameter: content")?;
        if content.len() > MAX_WRITE_BYTES {
            return Err(format!(
                "Content too large: {} bytes (max: {})",
                content.len(),
                MAX_WRITE_BYTES
            ));
        }

        tracing::info!(path = %path, bytes = content.len(), "write_file tool execute");
        self.fs.write_file(path, content).map_err(|e| e.to_string())?;
        Ok(format!("Wrote {} bytes to {}", content.len(), path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_then_cat_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let write = WriteFileTool::new(dir.path());
        let out = write
            .execute(serde_json::json!({"path": "src/lib.rs", "content": "pub fn a() {}"}))
            .await
            .unwrap();
        assert!(out.contains("13 bytes"));

        let cat = CatTool::new(dir.path());
        let content = cat
            .execute(serde_json::json!({"path": "./src/lib.rs"}))
            .await
            .unwrap();
        assert_eq!(content, "pub fn a() {}");
    }

    #[tokio::test]
    async fn test_ls_lists_sorted_and_marks_dirs() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.txt"), "b").unwrap();
        std::fs::create_dir(dir.path().join("a")).unwrap();
        std::fs::write(dir.path().join(".hidden"), "h").unwrap();
        let ls = LsTool::new(dir.path());
        let out = ls.execute(serde_json::json!({})).await.unwrap();
        assert_eq!(out, "a/\nb.txt");
    }

    #[test]
    fn test_escape_attempts_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let fs = SafeFs::new(dir.path());
        assert!(matches!(
            fs.write_file("../outside.txt", "x"),
            Err(AgentError::PathEscape(_))
        ));
        assert!(matches!(
            fs.write_file("/etc/passwd", "x"),
            Err(AgentError::PathEscape(_))
        ));
        assert!(matches!(
            fs.read_file("a/../../etc/passwd"),
            Err(AgentError::PathEscape(_))
        ));
    }

    #[test]
    fn test_inner_parent_dir_stays_inside() {
        let dir = tempfile::tempdir().unwrap();
        let fs = SafeFs::new(dir.path());
        let written = fs.write_file("a/b/../c.txt", "x").unwrap();
        assert!(written.ends_with("a/c.txt"));
    }

    #[test]
    fn test_only_write_file_has_side_effects() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!CatTool::new(dir.path()).side_effects());
        assert!(!LsTool::new(dir.path()).side_effects());
        assert!(WriteFileTool::new(dir.path()).side_effects());
    }

    #[tokio::test]
    async fn test_write_requires_content() {
        let dir = tempfile::tempdir().unwrap();
        let err = WriteFileTool::new(dir.path())
            .execute(serde_json::json!({"path": "x.txt"}))
            .await
            .unwrap_err();
        assert!(err.contains("content"));
    }
}
