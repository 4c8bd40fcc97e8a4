//! 核心编排层：任务状态机、运行状态、事件、错误与恢复、会话监管、编排器与构建器

pub mod builder;
pub mod error;
pub mod events;
pub mod orchestrator;
pub mod recovery;
pub mod session_supervisor;
pub mod state;
pub mod task;

pub use builder::{resolve_workspace, BuildError, OrchestratorBuilder};
pub use error::{AgentError, FailureReason, OrchestratorError};
pub use events::{ChannelNotifier, NoopNotifier, NotificationPort, RunEvent, TracingNotifier};
pub use orchestrator::{Orchestrator, OrchestratorSettings};
pub use recovery::{RecoveryAction, RecoveryEngine};
pub use session_supervisor::SessionSupervisor;
pub use state::{ExecutionSummary, LogEntry, LogLevel, RunLog, RunPhase, RunReport};
pub use task::{Task, TaskBoard, TaskStatus};
