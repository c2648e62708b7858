//! 审计步骤
//!
//! AgentStep 是决策循环的只追加审计记录：每个阶段动作一条，附带当时的阶段、
//! 可选的工具调用与结果、结论与耗时；一经追加不再修改或删除，
//! 最终随 LoopResult 整体返回给调用方。

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::core::lifecycle::AgentPhase;
use crate::tools::types::{ToolId, ToolResult};

/// 步骤结论
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    Success,
    /// 部分成功（如观察到成败混合的结果集）
    Partial,
    Failure,
    Timeout,
    Skipped,
}

/// 步骤里记录的工具调用（工具名 + 实际入参）
#[derive(Clone, Debug, Serialize)]
pub struct ToolInvocation {
    pub tool: ToolId,
    pub input: Value,
}

/// 一条审计步骤
#[derive(Clone, Debug, Serialize)]
pub struct AgentStep {
    /// 从 1 开始的步骤序号
    pub number: u64,
    /// 记录时所处阶段
    pub phase: AgentPhase,
    pub description: String,
    pub reasoning: Option<String>,
    pub invocation: Option<ToolInvocation>,
    pub result: Option<ToolResult>,
    pub outcome: StepOutcome,
    pub duration_ms: u64,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}
