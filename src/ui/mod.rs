//! 前端适配：终端交互（console）与 NDJSON 评测输出（eval）

pub mod console;
pub mod eval;

pub use console::{ConsoleApproval, ConsoleNotifier};
pub use eval::{run_eval, EvalInput, EvalNotifier, EvalStats};
