//! 工具层：注册表、调度管线与内置沙箱工具

pub mod echo;
pub mod filesystem;
pub mod registry;
pub mod types;

pub use echo::EchoTool;
pub use filesystem::{FsListTool, FsReadTool, FsWriteTool, SafeFs};
pub use registry::{Tool, ToolEntry, ToolRegistry, ToolSpec};
pub use types::{
    ExecutionContext, FieldError, Permission, ResultId, ToolCategory, ToolError, ToolFailure,
    ToolId, ToolInvocationRequest, ToolResult,
};
