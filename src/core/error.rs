//! 核心错误类型
//!
//! 生命周期 API 误用（非法转移、终态之后再转移）以 Err 形式传播给调用方——
//! 这类错误是编排方或策略实现的 bug，不是可恢复的运行时状况；
//! 工具层面的失败则永远不会以 Err 离开注册表（见 tools::ToolError）。

use thiserror::Error;

use crate::core::lifecycle::AgentPhase;

/// 编排层错误：生命周期误用与策略函数失败
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AgentError {
    /// 目标阶段不在当前阶段的合法转移集合内
    #[error("Invalid transition: {from:?} -> {to:?}")]
    InvalidTransition { from: AgentPhase, to: AgentPhase },

    /// 生命周期已进入终态（Complete / Failed），不再接受任何转移
    #[error("Lifecycle is terminal: {0:?}")]
    TerminalState(AgentPhase),

    #[error("Planner failed: {0}")]
    PlannerFailed(String),

    #[error("Reflector failed: {0}")]
    ReflectorFailed(String),
}

impl AgentError {
    /// 稳定错误码，供外部日志 / 断言使用
    pub fn code(&self) -> &'static str {
        match self {
            AgentError::InvalidTransition { .. } => "INVALID_TRANSITION",
            AgentError::TerminalState(_) => "TERMINAL_STATE",
            AgentError::PlannerFailed(_) => "PLANNER_FAILED",
            AgentError::ReflectorFailed(_) => "REFLECTOR_FAILED",
        }
    }
}
