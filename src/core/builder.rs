//! 编排器构建器：从 AppConfig 装配 LLM、工具箱、风险闸门与提示词
//!
//! 交互模式与 eval 模式共用同一套装配逻辑，只替换审批端口与通知端口。

use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;

use crate::config::{AppConfig, ConfigValidationError};
use crate::core::events::{NotificationPort, TracingNotifier};
use crate::core::orchestrator::Orchestrator;
use crate::hitl::{ApprovalPort, AutoApprove, RiskConfigError, RiskGate};
use crate::llm::{LlmClient, LlmError, MockLlmClient, OpenAiClient};
use crate::react::prompts::{DEFAULT_EXECUTOR_PROMPT, DEFAULT_PLANNER_PROMPT};
use crate::tools::{
    tool_call_schema_json, CatTool, EchoTool, LsTool, ShellTool, ToolExecutor, ToolRegistry,
    WriteFileTool,
};

#[derive(Debug, Error)]
pub enum BuildError {
    #[error(transparent)]
    Config(#[from] ConfigValidationError),
    #[error("risk configuration: {0}")]
    Risk(#[from] RiskConfigError),
    #[error("llm setup: {0}")]
    Llm(#[from] LlmError),
    #[error("workspace {path}: {source}")]
    Workspace {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub struct OrchestratorBuilder {
    config: AppConfig,
    workspace: PathBuf,
    prompt_dirs: Vec<PathBuf>,
    llm: Option<Arc<dyn LlmClient>>,
    approval: Option<Arc<dyn ApprovalPort>>,
    notifier: Option<Arc<dyn NotificationPort>>,
}

impl OrchestratorBuilder {
    pub fn new(config: AppConfig, workspace: impl Into<PathBuf>) -> Self {
        Self {
            config,
            workspace: workspace.into(),
            prompt_dirs: vec![PathBuf::from("config/prompts"), PathBuf::from("../config/prompts")],
            llm: None,
            approval: None,
            notifier: None,
        }
    }

    /// 覆盖按配置选择的 LLM（测试用 ScriptedLlmClient）
    pub fn with_llm(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.llm = Some(llm);
        self
    }

    pub fn with_approval(mut self, approval: Arc<dyn ApprovalPort>) -> Self {
        self.approval = Some(approval);
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn NotificationPort>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// 提示词查找目录，按顺序取第一个存在的文件
    pub fn with_prompt_dirs(mut self, dirs: Vec<PathBuf>) -> Self {
        self.prompt_dirs = dirs;
        self
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    /// 按 provider 选择后端；openai 需要 api_key_env 指向的环境变量
    pub fn build_llm(&self) -> Result<Arc<dyn LlmClient>, LlmError> {
        if let Some(llm) = &self.llm {
            return Ok(llm.clone());
        }
        let llm = &self.config.llm;
        match llm.provider.as_str() {
            "mock" => {
                tracing::info!("using mock LLM backend");
                Ok(Arc::new(MockLlmClient))
            }
            "openai" => {
                let api_key = std::env::var(&llm.api_key_env).map_err(|_| {
                    LlmError::Config(format!("environment variable {} is not set", llm.api_key_env))
                })?;
                tracing::info!(model = %llm.model, base_url = ?llm.base_url, "using OpenAI-compatible backend");
                Ok(Arc::new(OpenAiClient::new(
                    llm.base_url.as_deref(),
                    &llm.model,
                    &api_key,
                    llm.request_timeout_secs,
                )))
            }
            other => Err(LlmError::Config(format!("unknown provider '{other}'"))),
        }
    }

    /// 内置工具箱：文件与 shell 工具都限制在 workspace 内
    pub fn build_tool_registry(&self) -> ToolRegistry {
        let mut tools = ToolRegistry::new();
        tools.register(EchoTool);
        tools.register(CatTool::new(&self.workspace));
        tools.register(LsTool::new(&self.workspace));
        tools.register(WriteFileTool::new(&self.workspace));
        tools.register(ShellTool::new(
            self.config.tools.shell.allowed_commands.clone(),
            &self.workspace,
            self.config.tools.tool_timeout_secs,
        ));
        tools
    }

    fn load_prompt(&self, file_name: &str, default: &str) -> String {
        self.prompt_dirs
            .iter()
            .map(|dir| dir.join(file_name))
            .find_map(|path| std::fs::read_to_string(path).ok())
            .filter(|text| !text.trim().is_empty())
            .unwrap_or_else(|| default.to_string())
    }

    /// 执行提示词 + 工具列表 + 文本工具调用 schema
    pub fn build_executor_prompt(&self, registry: &ToolRegistry) -> String {
        let base = self.load_prompt("executor.md", DEFAULT_EXECUTOR_PROMPT);
        if registry.is_empty() {
            return base;
        }
        format!(
            "{}\n\n## Available tools\n```json\n{}\n```\n\n## Tool call JSON Schema (text replies must match this)\n```json\n{}\n```",
            base,
            registry.to_schema_json(),
            tool_call_schema_json()
        )
    }

    pub fn build_planner_prompt(&self) -> String {
        self.load_prompt("planner.md", DEFAULT_PLANNER_PROMPT)
    }

    pub fn build(self) -> Result<Orchestrator, BuildError> {
        self.config.validate()?;
        std::fs::create_dir_all(&self.workspace).map_err(|source| BuildError::Workspace {
            path: self.workspace.clone(),
            source,
        })?;

        let llm = self.build_llm()?;
        let registry = self.build_tool_registry();
        let mut settings = self.config.orchestrator_settings();
        settings.executor_prompt = self.build_executor_prompt(&registry);
        settings.planner_prompt = self.build_planner_prompt();
        let risk = Arc::new(RiskGate::new(self.config.hitl.risk.clone())?);
        let tools = Arc::new(ToolExecutor::new(registry, self.config.tools.tool_timeout_secs));

        tracing::info!(
            workspace = %self.workspace.display(),
            max_debug_attempts = settings.max_debug_attempts,
            max_iterations = settings.max_iterations_per_task,
            hitl = settings.hitl_enabled,
            "orchestrator ready"
        );

        Ok(Orchestrator::new(
            llm,
            tools,
            self.approval.unwrap_or_else(|| Arc::new(AutoApprove)),
            self.notifier.unwrap_or_else(|| Arc::new(TracingNotifier)),
            risk,
            settings,
        ))
    }
}

/// 工作目录：config 的 workspace_root，缺省为 ./workspace
pub fn resolve_workspace(config: &AppConfig) -> PathBuf {
    config
        .app
        .workspace_root
        .clone()
        .unwrap_or_else(|| PathBuf::from("workspace"))
}
