//! 认知层：Planner、工具调用循环、循环事件与默认提示词

pub mod events;
pub mod loop_;
pub mod planner;
pub mod prompts;

pub use events::ReactEvent;
pub use loop_::{parse_arguments, LoopOutcome, LoopStatus, ToolLoop};
pub use planner::{parse_plan, Planner, TaskSpec};
