//! Planner / Reflector 策略契约与内置实现
//!
//! 策略是外部协作者：循环只依赖这两个单方法 trait，不关心决策如何做出
//! （LLM、规则或脚本都可以）。策略返回 Err 时由循环捕获并转为会话失败，
//! 不会让宿主进程崩溃。内置实现全部是确定性的，供测试与演示使用。

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;

use crate::context::types::{AgentContext, ExecutionPlan, PlannedAction};
use crate::decision::step::AgentStep;
use crate::tools::types::ToolId;

/// 反思结论：是否继续、是否算成功、原因与对下一轮的调整建议
#[derive(Clone, Debug)]
pub struct Reflection {
    pub should_continue: bool,
    pub is_success: bool,
    pub reason: String,
    pub adjustments: Vec<String>,
}

impl Reflection {
    pub fn stop_success(reason: impl Into<String>) -> Self {
        Self {
            should_continue: false,
            is_success: true,
            reason: reason.into(),
            adjustments: Vec::new(),
        }
    }

    pub fn stop_failure(reason: impl Into<String>) -> Self {
        Self {
            should_continue: false,
            is_success: false,
            reason: reason.into(),
            adjustments: Vec::new(),
        }
    }

    pub fn continue_with(reason: impl Into<String>) -> Self {
        Self {
            should_continue: true,
            is_success: false,
            reason: reason.into(),
            adjustments: Vec::new(),
        }
    }

    pub fn with_adjustment(mut self, adjustment: impl Into<String>) -> Self {
        self.adjustments.push(adjustment.into());
        self
    }
}

/// 规划策略：给定当前上下文产出一份执行计划
#[async_trait]
pub trait Planner: Send + Sync {
    async fn plan(&self, context: &AgentContext) -> Result<ExecutionPlan, String>;
}

/// 反思策略：给定上下文与完整步骤历史，决定继续 / 完成 / 失败
#[async_trait]
pub trait Reflector: Send + Sync {
    async fn reflect(
        &self,
        context: &AgentContext,
        steps: &[AgentStep],
    ) -> Result<Reflection, String>;
}

/// 队列式 Planner：按顺序弹出预先准备好的计划，弹空后返回空计划
pub struct QueuedPlanner {
    plans: Mutex<VecDeque<ExecutionPlan>>,
}

impl QueuedPlanner {
    pub fn new(plans: Vec<ExecutionPlan>) -> Self {
        Self {
            plans: Mutex::new(plans.into()),
        }
    }
}

#[async_trait]
impl Planner for QueuedPlanner {
    async fn plan(&self, _context: &AgentContext) -> Result<ExecutionPlan, String> {
        let next = self.plans.lock().expect("planner lock poisoned").pop_front();
        Ok(next.unwrap_or_else(|| ExecutionPlan::empty("No further actions")))
    }
}

/// 重复式 Planner：每个规划阶段都产出同一个单动作计划
pub struct RepeatPlanner {
    description: String,
    tool: ToolId,
    parameters: Value,
}

impl RepeatPlanner {
    pub fn new(
        description: impl Into<String>,
        tool: impl Into<ToolId>,
        parameters: Value,
    ) -> Self {
        Self {
            description: description.into(),
            tool: tool.into(),
            parameters,
        }
    }
}

#[async_trait]
impl Planner for RepeatPlanner {
    async fn plan(&self, _context: &AgentContext) -> Result<ExecutionPlan, String> {
        Ok(ExecutionPlan::new(
            self.description.clone(),
            vec![PlannedAction::new(
                0,
                self.tool.clone(),
                self.description.clone(),
                self.parameters.clone(),
            )],
        ))
    }
}

/// 以最近一个工具结果定成败的 Reflector：成功则完成，失败则终止并带上错误文本；
/// 尚无结果时请求继续规划
pub struct FirstResultReflector;

#[async_trait]
impl Reflector for FirstResultReflector {
    async fn reflect(
        &self,
        context: &AgentContext,
        _steps: &[AgentStep],
    ) -> Result<Reflection, String> {
        match context.latest_result() {
            Some(result) if result.success => Ok(Reflection::stop_success(format!(
                "Tool {} succeeded",
                result.tool
            ))),
            Some(result) => {
                let reason = result
                    .error
                    .as_ref()
                    .map(|e| e.message.clone())
                    .unwrap_or_else(|| format!("Tool {} failed", result.tool));
                Ok(Reflection::stop_failure(reason))
            }
            None => Ok(Reflection::continue_with("No results yet; plan again")),
        }
    }
}

/// 永远要求继续的 Reflector（用于验证步数上限）
pub struct AlwaysContinueReflector;

#[async_trait]
impl Reflector for AlwaysContinueReflector {
    async fn reflect(
        &self,
        _context: &AgentContext,
        _steps: &[AgentStep],
    ) -> Result<Reflection, String> {
        Ok(Reflection::continue_with("Keep going"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::manager::ContextManager;
    use crate::context::types::{SessionId, UserIntent, WorkspaceMeta};
    use serde_json::json;

    fn test_context() -> std::sync::Arc<AgentContext> {
        ContextManager::new().create(
            SessionId::from("session_strategy_test"),
            UserIntent::new("test"),
            WorkspaceMeta::new("/tmp"),
            Vec::new(),
            Vec::new(),
        )
    }

    #[tokio::test]
    async fn test_queued_planner_drains_then_returns_empty() {
        let plan = ExecutionPlan::new(
            "one echo",
            vec![PlannedAction::new(0, "echo", "say hi", json!({"text": "hi"}))],
        );
        let planner = QueuedPlanner::new(vec![plan]);
        let ctx = test_context();

        let first = planner.plan(&ctx).await.unwrap();
        assert_eq!(first.actions.len(), 1);
        let second = planner.plan(&ctx).await.unwrap();
        assert!(second.actions.is_empty());
    }

    #[tokio::test]
    async fn test_repeat_planner_always_plans() {
        let planner = RepeatPlanner::new("poke", "echo", json!({"text": "again"}));
        let ctx = test_context();
        for _ in 0..3 {
            let plan = planner.plan(&ctx).await.unwrap();
            assert_eq!(plan.actions.len(), 1);
            assert!(plan.has_pending());
        }
    }

    #[tokio::test]
    async fn test_first_result_reflector_without_results_continues() {
        let ctx = test_context();
        let reflection = FirstResultReflector.reflect(&ctx, &[]).await.unwrap();
        assert!(reflection.should_continue);
        assert!(!reflection.is_success);
    }
}
