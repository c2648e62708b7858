//! 过程事件
//!
//! 核心组件（生命周期 / 决策循环 / 工具注册表）通过构造时注入的可选 mpsc 通道
//! 向外部订阅者推送带标签的事件值；无订阅者时静默丢弃，核心不依赖任何持久化后端。

use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;

use crate::context::types::SessionId;
use crate::core::lifecycle::AgentPhase;
use crate::tools::types::ToolId;

/// 核心过程事件（可序列化为 JSON 供外部 tracing / SSE 展示）
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    /// 进入阶段
    PhaseEnter { phase: AgentPhase, step: u64 },
    /// 退出阶段
    PhaseExit { phase: AgentPhase, step: u64 },
    /// 一次阶段转移
    Transition {
        from: AgentPhase,
        to: AgentPhase,
        reason: String,
    },
    /// 会话开始
    LoopStart { session: SessionId, intent: String },
    /// 记录一条审计步骤
    LoopStep {
        session: SessionId,
        step: u64,
        phase: AgentPhase,
        description: String,
    },
    /// 会话成功结束
    LoopComplete { session: SessionId, reason: String },
    /// 会话失败结束
    LoopFailed { session: SessionId, reason: String },
    /// 会话被挂起
    LoopSuspended { session: SessionId, reason: String },
    /// 注册了新工具
    ToolRegistered { tool: ToolId },
    /// 开始调用工具
    ToolInvoked { tool: ToolId },
    /// 工具调用成功
    ToolCompleted { tool: ToolId, duration_ms: u64 },
    /// 工具调用失败（含超时）
    ToolFailed {
        tool: ToolId,
        code: String,
        message: String,
    },
}

/// 向可选通道发送事件；无订阅者或通道已关闭时静默丢弃
pub fn send_event(tx: &Option<UnboundedSender<AgentEvent>>, ev: AgentEvent) {
    if let Some(t) = tx {
        let _ = t.send(ev);
    }
}
