//! Hive - Rust 编码助手编排引擎
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 任务状态机、编排器（规划 -> 执行 -> 调试）、事件、错误与恢复
//! - **hitl**: 风险闸门与人工审批
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / Mock / Scripted）
//! - **react**: Planner 与工具调用循环
//! - **structured**: 从模型文本中恢复 JSON
//! - **tools**: 工具箱（echo、cat、ls、write_file、shell）与执行器
//! - **ui**: 终端审批与 eval NDJSON 输出

pub mod config;
pub mod core;
pub mod hitl;
pub mod llm;
pub mod observability;
pub mod react;
pub mod structured;
pub mod tools;
pub mod ui;

pub use crate::core::{Orchestrator, OrchestratorBuilder, RunReport};
