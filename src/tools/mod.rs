//! 工具层：Tool trait、注册表、带超时与审计的执行器，以及内置工具箱

pub mod echo;
pub mod executor;
pub mod filesystem;
pub mod registry;
pub mod schema;
pub mod shell;

pub use echo::EchoTool;
pub use executor::{ToolDispatcher, ToolExecutor};
pub use filesystem::{CatTool, LsTool, SafeFs, WriteFileTool};
pub use registry::{Tool, ToolRegistry};
pub use schema::{tool_call_schema_json, TextToolCall};
pub use shell::ShellTool;
