//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `HIVE__*` 覆盖（双下划线表示嵌套，如 `HIVE__LLM__PROVIDER=mock`）。

use std::path::PathBuf;

use serde::Deserialize;

use crate::core::orchestrator::OrchestratorSettings;
use crate::hitl::RiskConfig;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub tools: ToolsSection,
    pub orchestrator: OrchestratorSection,
    pub hitl: HitlSection,
}

/// [app] 段：应用名、工作目录
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppSection {
    pub name: Option<String>,
    /// 沙箱根目录，未设置时用 ./workspace
    pub workspace_root: Option<PathBuf>,
}

/// [llm] 段：后端选择与超时
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    /// openai（任意 OpenAI 兼容端点）或 mock
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    pub base_url: Option<String>,
    /// 从哪个环境变量读 API Key
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            base_url: None,
            api_key_env: default_api_key_env(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

fn default_provider() -> String {
    "openai".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

fn default_request_timeout() -> u64 {
    60
}

/// [tools] 段：工具超时、Shell 白名单
#[derive(Debug, Clone, Deserialize)]
pub struct ToolsSection {
    /// 单次工具调用超时（秒）
    #[serde(default = "default_tool_timeout_secs")]
    pub tool_timeout_secs: u64,
    #[serde(default)]
    pub shell: ShellSection,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            tool_timeout_secs: default_tool_timeout_secs(),
            shell: ShellSection::default(),
        }
    }
}

fn default_tool_timeout_secs() -> u64 {
    30
}

/// [tools.shell] 段：允许执行的命令名（仅首词，如 ls、grep、cargo）
#[derive(Debug, Clone, Deserialize)]
pub struct ShellSection {
    #[serde(default = "default_allowed_commands")]
    pub allowed_commands: Vec<String>,
}

impl Default for ShellSection {
    fn default() -> Self {
        Self {
            allowed_commands: default_allowed_commands(),
        }
    }
}

fn default_allowed_commands() -> Vec<String> {
    ["ls", "grep", "cat", "head", "tail", "wc", "find", "mkdir", "cargo", "rustc", "git"]
        .into_iter()
        .map(String::from)
        .collect()
}

/// [orchestrator] 段
#[derive(Debug, Clone, Deserialize)]
pub struct OrchestratorSection {
    #[serde(default = "default_max_debug_attempts")]
    pub max_debug_attempts: u32,
    #[serde(default = "default_max_iterations")]
    pub max_iterations_per_task: usize,
    #[serde(default)]
    pub halt_on_failure: bool,
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            max_debug_attempts: default_max_debug_attempts(),
            max_iterations_per_task: default_max_iterations(),
            halt_on_failure: false,
        }
    }
}

fn default_max_debug_attempts() -> u32 {
    2
}

fn default_max_iterations() -> usize {
    20
}

/// [hitl] 段：人工审批；[hitl.risk] 为风险规则
#[derive(Debug, Clone, Deserialize)]
pub struct HitlSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub approve_plan: bool,
    #[serde(default)]
    pub risk: RiskConfig,
}

impl Default for HitlSection {
    fn default() -> Self {
        Self {
            enabled: true,
            approve_plan: false,
            risk: RiskConfig::default(),
        }
    }
}

fn default_true() -> bool {
    true
}

/// 配置校验失败
#[derive(Debug, thiserror::Error)]
#[error("invalid configuration: {0}")]
pub struct ConfigValidationError(pub String);

impl AppConfig {
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.orchestrator.max_iterations_per_task == 0 {
            return Err(ConfigValidationError(
                "orchestrator.max_iterations_per_task must be greater than 0".into(),
            ));
        }
        if self.tools.tool_timeout_secs == 0 {
            return Err(ConfigValidationError(
                "tools.tool_timeout_secs must be greater than 0".into(),
            ));
        }
        if !matches!(self.llm.provider.as_str(), "openai" | "mock") {
            return Err(ConfigValidationError(format!(
                "unknown llm.provider '{}' (expected openai or mock)",
                self.llm.provider
            )));
        }
        Ok(())
    }

    /// 编排参数（提示词用默认值，由 builder 按需替换）
    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            max_debug_attempts: self.orchestrator.max_debug_attempts,
            max_iterations_per_task: self.orchestrator.max_iterations_per_task,
            halt_on_failure: self.orchestrator.halt_on_failure,
            hitl_enabled: self.hitl.enabled,
            approve_plan: self.hitl.approve_plan,
            ..OrchestratorSettings::default()
        }
    }
}

/// 从 config 目录加载配置，环境变量 HIVE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path，则追加该文件（可覆盖前面的键；显式指定的文件必须存在）
/// 3. 最后叠加环境变量 HIVE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(path) = config_path {
        builder = builder.add_source(config::File::from(path).required(true));
    }

    builder = builder.add_source(
        config::Environment::with_prefix("HIVE")
            .separator("__")
            .try_parsing(true),
    );

    builder.build()?.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hitl::RiskLevel;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.orchestrator.max_debug_attempts, 2);
        assert_eq!(config.orchestrator.max_iterations_per_task, 20);
        assert!(config.hitl.enabled);
        assert!(!config.hitl.approve_plan);
        assert_eq!(config.hitl.risk.approval_threshold, RiskLevel::High);
        assert_eq!(config.llm.api_key_env, "OPENAI_API_KEY");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_limits() {
        let mut config = AppConfig::default();
        config.orchestrator.max_iterations_per_task = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.tools.tool_timeout_secs = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.llm.provider = "deepseek".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_explicit_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[llm]
provider = "mock"

[orchestrator]
max_debug_attempts = 0
halt_on_failure = true

[hitl]
approve_plan = true

[hitl.risk]
approval_threshold = "medium"
block_patterns = ["prod-db"]

[[hitl.risk.extra_patterns]]
pattern = "terraform\\s+apply"
category = "infrastructure"
level = "critical"
reason = "applies infrastructure changes"
"#
        )
        .unwrap();

        let config = load_config(Some(file.path().to_path_buf())).unwrap();
        assert_eq!(config.llm.provider, "mock");
        assert_eq!(config.orchestrator.max_debug_attempts, 0);
        assert!(config.orchestrator.halt_on_failure);
        assert_eq!(config.hitl.risk.approval_threshold, RiskLevel::Medium);
        assert_eq!(config.hitl.risk.block_patterns, vec!["prod-db".to_string()]);
        assert_eq!(config.hitl.risk.extra_patterns.len(), 1);

        let settings = config.orchestrator_settings();
        assert!(settings.approve_plan);
        assert_eq!(settings.max_debug_attempts, 0);
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        assert!(load_config(Some(PathBuf::from("/nonexistent/hive.toml"))).is_err());
    }
}
