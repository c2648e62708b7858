//! 工具层数据类型
//!
//! ToolError 是调度管线内部的失败分类（稳定错误码 + 可恢复标记），
//! 但它从不以 Err 的形式离开注册表：invoke 把任何失败都折叠进统一的
//! ToolResult（成功与失败同构），由决策循环原样合并进上下文。

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::context::types::{AgentContext, SessionId};

/// 工具 ID（注册表内唯一）
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ToolId(String);

impl ToolId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ToolId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ToolId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for ToolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 工具结果 ID（每次调用一个）
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResultId(String);

impl ResultId {
    pub fn generate() -> Self {
        Self(format!("result_{}", uuid::Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// 权限标识（如 fs_read / fs_write）；工具声明的权限必须全部在注册表授予集合内
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Permission(String);

impl Permission {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Permission {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for Permission {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 工具类别（如 filesystem / utility），可配置注册白名单
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ToolCategory(String);

impl ToolCategory {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ToolCategory {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ToolCategory {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for ToolCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 校验失败时的字段级错误
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// 调度管线失败分类；注册期（Duplicate / CategoryNotAllowed）以 Err 返回，
/// 调用期的所有变体都被折叠进失败的 ToolResult
#[derive(Error, Debug)]
pub enum ToolError {
    #[error("Tool not found: {0}")]
    NotFound(ToolId),

    #[error("Tool disabled: {0}")]
    Disabled(ToolId),

    #[error("Permission denied for {tool}: missing {}", format_permissions(.missing))]
    PermissionDenied { tool: ToolId, missing: Vec<Permission> },

    #[error("Validation failed for {tool}: {}", format_fields(.fields))]
    ValidationFailed { tool: ToolId, fields: Vec<FieldError> },

    #[error("Execution failed: {0}")]
    Execution(String),

    #[error("Execution timed out after {timeout_ms} ms: {tool}")]
    Timeout { tool: ToolId, timeout_ms: u64 },

    #[error("Duplicate tool: {0}")]
    Duplicate(ToolId),

    #[error("Category not allowed: {0}")]
    CategoryNotAllowed(ToolCategory),
}

fn format_permissions(missing: &[Permission]) -> String {
    missing
        .iter()
        .map(|p| p.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

fn format_fields(fields: &[FieldError]) -> String {
    fields
        .iter()
        .map(|f| format!("{}: {}", f.field, f.message))
        .collect::<Vec<_>>()
        .join("; ")
}

impl ToolError {
    /// 稳定错误码；超时归入 EXECUTION_ERROR
    pub fn code(&self) -> &'static str {
        match self {
            ToolError::NotFound(_) => "TOOL_NOT_FOUND",
            ToolError::Disabled(_) => "TOOL_DISABLED",
            ToolError::PermissionDenied { .. } => "PERMISSION_DENIED",
            ToolError::ValidationFailed { .. } => "VALIDATION_FAILED",
            ToolError::Execution(_) | ToolError::Timeout { .. } => "EXECUTION_ERROR",
            ToolError::Duplicate(_) => "DUPLICATE_TOOL",
            ToolError::CategoryNotAllowed(_) => "CATEGORY_NOT_ALLOWED",
        }
    }

    /// 重规划后是否值得重试
    pub fn recoverable(&self) -> bool {
        matches!(
            self,
            ToolError::Disabled(_)
                | ToolError::ValidationFailed { .. }
                | ToolError::Execution(_)
                | ToolError::Timeout { .. }
        )
    }

    /// 给 Reflector / 外部用户的修复建议
    pub fn suggestions(&self) -> Vec<String> {
        match self {
            ToolError::NotFound(_) => {
                vec!["check the tool id against the registry catalog".to_string()]
            }
            ToolError::Disabled(_) => vec!["re-enable the tool or pick another one".to_string()],
            ToolError::PermissionDenied { missing, .. } => vec![format!(
                "grant the missing permissions to the registry: {}",
                format_permissions(missing)
            )],
            ToolError::ValidationFailed { .. } => {
                vec!["fix the listed input fields and retry".to_string()]
            }
            ToolError::Timeout { .. } => {
                vec!["increase timeout_ms or split the action into smaller steps".to_string()]
            }
            ToolError::Execution(_) => Vec::new(),
            ToolError::Duplicate(_) => vec!["unregister the existing tool first".to_string()],
            ToolError::CategoryNotAllowed(_) => {
                vec!["add the category to the registry allow-list".to_string()]
            }
        }
    }

    /// 折叠为 ToolResult 携带的统一错误对象
    pub fn into_failure(self) -> ToolFailure {
        ToolFailure {
            code: self.code().to_string(),
            message: self.to_string(),
            recoverable: self.recoverable(),
            suggestions: self.suggestions(),
        }
    }
}

/// ToolResult 携带的统一错误对象
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolFailure {
    pub code: String,
    pub message: String,
    pub recoverable: bool,
    pub suggestions: Vec<String>,
}

impl ToolFailure {
    /// 是否超时失败（超时与普通执行失败共用 EXECUTION_ERROR 码，靠消息区分）
    pub fn is_timeout(&self) -> bool {
        self.code == "EXECUTION_ERROR" && self.message.starts_with("Execution timed out")
    }
}

/// 统一工具结果：成功与失败同构，决策循环只看 success 标记，不拆工具专有载荷
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolResult {
    pub id: ResultId,
    pub tool: ToolId,
    pub success: bool,
    pub output: Option<Value>,
    pub error: Option<ToolFailure>,
    pub duration_ms: u64,
    pub completed_at: DateTime<Utc>,
}

impl ToolResult {
    pub fn ok(tool: ToolId, output: Value, duration_ms: u64) -> Self {
        Self {
            id: ResultId::generate(),
            tool,
            success: true,
            output: Some(output),
            error: None,
            duration_ms,
            completed_at: Utc::now(),
        }
    }

    pub fn failed(tool: ToolId, error: ToolFailure, duration_ms: u64) -> Self {
        Self {
            id: ResultId::generate(),
            tool,
            success: false,
            output: None,
            error: Some(error),
            duration_ms,
            completed_at: Utc::now(),
        }
    }
}

/// 一次工具调用请求
#[derive(Clone)]
pub struct ToolInvocationRequest {
    pub tool: ToolId,
    pub input: Value,
    /// 调用时的上下文快照（只读共享）
    pub context: Arc<AgentContext>,
    /// 覆盖注册表默认超时
    pub timeout_ms: Option<u64>,
    /// 跳过工具自带的输入校验
    pub skip_validation: bool,
}

impl ToolInvocationRequest {
    pub fn new(tool: impl Into<ToolId>, input: Value, context: Arc<AgentContext>) -> Self {
        Self {
            tool: tool.into(),
            input,
            context,
            timeout_ms: None,
            skip_validation: false,
        }
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_skip_validation(mut self) -> Self {
        self.skip_validation = true;
        self
    }
}

/// 注册表交给工具实现的执行环境：沙箱根、路径白名单、取消信号与干跑标记；
/// 结构化日志经由全局 tracing，不在这里传递
#[derive(Clone)]
pub struct ExecutionContext {
    pub session: SessionId,
    pub workspace_root: PathBuf,
    pub allowed_paths: Vec<PathBuf>,
    /// 超时后注册表会触发取消；工具应尽力配合中止
    pub cancel: CancellationToken,
    pub dry_run: bool,
}
