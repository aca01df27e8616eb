//! 工具层：规范化调用 / 结果、注册表、执行器与内置工具（记忆、文件）

pub mod call;
pub mod executor;
pub mod filesystem;
pub mod memory;
pub mod registry;
pub mod schema;

pub use call::{new_call_id, ToolCall, ToolResult};
pub use executor::ToolExecutor;
pub use filesystem::{ListDirTool, ReadFileTool, SafeFs};
pub use memory::{RecallTool, RememberTool};
pub use registry::{Tool, ToolRegistry};
