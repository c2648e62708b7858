//! 决策循环
//!
//! Plan -> Act -> Observe -> Reflect；一个循环实例端到端驱动一个会话。
//! 阶段推进全部走生命周期状态机；每个阶段动作追加一条审计步骤，步数达到
//! max_steps 即强制失败。工具失败以失败结果的形式合并进上下文，由 Reflector
//! 决定重规划还是终止；Planner / Reflector 自身出错会被捕获并转为会话失败——
//! run 对普通任务失败永不返回 Err，只返回 LoopResult。
//! 外部可通过 LoopHandle 协作式 stop / suspend，在下一个阶段边界生效。

use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::Utc;
use tokio::sync::mpsc::UnboundedSender;

use crate::config::AppConfig;
use crate::context::manager::{ContextManager, ContextUpdate};
use crate::context::types::{
    ActionStatus, AgentContext, PlannedAction, SessionId, UserIntent, WorkspaceMeta,
};
use crate::core::error::AgentError;
use crate::core::events::{send_event, AgentEvent};
use crate::core::lifecycle::{AgentPhase, LifecycleController};
use crate::decision::step::{AgentStep, StepOutcome, ToolInvocation};
use crate::decision::strategy::{Planner, Reflector};
use crate::tools::registry::ToolRegistry;
use crate::tools::types::ToolInvocationRequest;

/// 循环配置：步数上限与单次工具调用超时
#[derive(Clone, Debug)]
pub struct LoopConfig {
    /// 单次会话最大审计步数
    pub max_steps: usize,
    /// 覆盖注册表默认的单工具超时；None 用注册表默认值
    pub tool_timeout_ms: Option<u64>,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            max_steps: 20,
            tool_timeout_ms: None,
        }
    }
}

impl From<&AppConfig> for LoopConfig {
    fn from(cfg: &AppConfig) -> Self {
        Self {
            max_steps: cfg.loop_.max_steps,
            tool_timeout_ms: Some(cfg.tools.tool_timeout_secs * 1000),
        }
    }
}

/// 一次会话的最终结果；run 的唯一出口
#[derive(Clone, Debug)]
pub struct LoopResult {
    /// 是否以 Complete 结束
    pub success: bool,
    pub final_phase: AgentPhase,
    pub steps: Vec<AgentStep>,
    pub final_context: Arc<AgentContext>,
    pub duration_ms: u64,
    pub reason: String,
}

/// 外部控制句柄：stop 强制失败，suspend 挂起；都在下一个阶段边界被循环观察到
#[derive(Clone)]
pub struct LoopHandle {
    lifecycle: Arc<Mutex<LifecycleController>>,
}

impl LoopHandle {
    /// 强制终止会话（进入 Failed）；已终态则无效果
    pub fn stop(&self, reason: impl Into<String>) {
        self.lifecycle
            .lock()
            .expect("lifecycle lock poisoned")
            .fail(reason);
    }

    /// 挂起会话；循环在下一个阶段边界返回 Suspended 结果
    pub fn suspend(&self, reason: impl Into<String>) -> Result<(), AgentError> {
        self.lifecycle
            .lock()
            .expect("lifecycle lock poisoned")
            .suspend(reason)
    }

    pub fn phase(&self) -> AgentPhase {
        self.lifecycle
            .lock()
            .expect("lifecycle lock poisoned")
            .current_phase()
    }
}

/// 决策循环：持有生命周期、上下文管理器、工具注册表与两端策略
pub struct DecisionLoop {
    lifecycle: Arc<Mutex<LifecycleController>>,
    contexts: Arc<ContextManager>,
    registry: Arc<ToolRegistry>,
    planner: Arc<dyn Planner>,
    reflector: Arc<dyn Reflector>,
    config: LoopConfig,
    event_tx: Option<UnboundedSender<AgentEvent>>,
}

impl DecisionLoop {
    pub fn new(
        contexts: Arc<ContextManager>,
        registry: Arc<ToolRegistry>,
        planner: Arc<dyn Planner>,
        reflector: Arc<dyn Reflector>,
        config: LoopConfig,
    ) -> Self {
        Self {
            lifecycle: Arc::new(Mutex::new(LifecycleController::new())),
            contexts,
            registry,
            planner,
            reflector,
            config,
            event_tx: None,
        }
    }

    /// 注入事件通道（同时喂给内部生命周期）；在 run 之前调用
    pub fn with_event_tx(mut self, tx: UnboundedSender<AgentEvent>) -> Self {
        self.lifecycle
            .lock()
            .expect("lifecycle lock poisoned")
            .set_event_tx(tx.clone());
        self.event_tx = Some(tx);
        self
    }

    /// 外部控制句柄，可跨线程克隆持有
    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            lifecycle: self.lifecycle.clone(),
        }
    }

    /// 驱动一个会话到终态（或挂起）；普通任务失败不返回 Err，总是给出 LoopResult
    pub async fn run(&self, intent: UserIntent, workspace: WorkspaceMeta) -> LoopResult {
        let run_started = Instant::now();
        let session = SessionId::generate();
        let mut context =
            self.contexts
                .create(session.clone(), intent.clone(), workspace, Vec::new(), Vec::new());
        send_event(
            &self.event_tx,
            AgentEvent::LoopStart {
                session: session.clone(),
                intent: intent.text.clone(),
            },
        );
        tracing::info!(session = %session, intent = %intent.text, "decision loop start");

        let mut steps: Vec<AgentStep> = Vec::new();

        // 进入 Planning；run 之前外部已 stop / suspend 的情况按结果返回，不算 API 误用
        {
            let mut lc = self.lifecycle.lock().expect("lifecycle lock poisoned");
            match lc.current_phase() {
                phase if phase.is_terminal() => {
                    drop(lc);
                    return self.finish_run(session, steps, context, run_started);
                }
                AgentPhase::Suspended => {
                    drop(lc);
                    return self.suspended_run(session, steps, context, run_started);
                }
                _ => {
                    if let Err(e) = lc.transition(AgentPhase::Planning, "intent accepted") {
                        lc.fail(e.to_string());
                        drop(lc);
                        return self.finish_run(session, steps, context, run_started);
                    }
                }
            }
        }

        loop {
            let phase = {
                self.lifecycle
                    .lock()
                    .expect("lifecycle lock poisoned")
                    .current_phase()
            };
            if phase.is_terminal() {
                break;
            }
            if phase == AgentPhase::Suspended {
                return self.suspended_run(session, steps, context, run_started);
            }
            if steps.len() >= self.config.max_steps {
                self.lifecycle
                    .lock()
                    .expect("lifecycle lock poisoned")
                    .fail("Exceeded maximum steps");
                break;
            }

            match phase {
                AgentPhase::Planning => self.run_planning(&mut context, &mut steps).await,
                AgentPhase::Acting => self.run_acting(&mut context, &mut steps).await,
                AgentPhase::Observing => self.run_observing(&context, &mut steps),
                AgentPhase::Reflecting => self.run_reflecting(&context, &mut steps).await,
                // Idle 只在初次转移失败时可见，上面已经处理；终态与挂起在循环顶部拦截
                AgentPhase::Idle
                | AgentPhase::Complete
                | AgentPhase::Failed
                | AgentPhase::Suspended => break,
            }
        }

        self.finish_run(session, steps, context, run_started)
    }

    /// Planning：调用 Planner，把新计划整体替换进上下文（重规划递增 revision）
    async fn run_planning(&self, context: &mut Arc<AgentContext>, steps: &mut Vec<AgentStep>) {
        let started = Instant::now();
        let began = Utc::now();
        match self.planner.plan(context).await {
            Ok(mut plan) => {
                if let Some(prev) = context.active_plan.as_ref() {
                    plan = plan.with_revision(prev.revision + 1);
                }
                let description =
                    format!("Planned {} action(s): {}", plan.actions.len(), plan.description);
                *context = self
                    .contexts
                    .update(context, ContextUpdate::default().with_plan(plan));
                self.record_step(
                    steps,
                    context,
                    AgentStep {
                        number: steps.len() as u64 + 1,
                        phase: AgentPhase::Planning,
                        description,
                        reasoning: None,
                        invocation: None,
                        result: None,
                        outcome: StepOutcome::Success,
                        duration_ms: started.elapsed().as_millis() as u64,
                        started_at: began,
                        ended_at: Utc::now(),
                    },
                );
                self.transition_or_yield(AgentPhase::Acting, "plan ready");
            }
            Err(e) => {
                self.lifecycle
                    .lock()
                    .expect("lifecycle lock poisoned")
                    .fail(AgentError::PlannerFailed(e).to_string());
            }
        }
    }

    /// Acting：取计划里第一个 Pending 动作交给注册表执行；
    /// 计划耗尽或本次失败则转去 Observing，否则停留继续下一个动作
    async fn run_acting(&self, context: &mut Arc<AgentContext>, steps: &mut Vec<AgentStep>) {
        let plan_snapshot = context.active_plan.clone();
        let action: Option<PlannedAction> =
            plan_snapshot.as_ref().and_then(|p| p.next_pending()).cloned();
        let (Some(plan_snapshot), Some(action)) = (plan_snapshot, action) else {
            self.transition_or_yield(AgentPhase::Observing, "no pending actions");
            return;
        };

        let started = Instant::now();
        let began = Utc::now();
        let mut request =
            ToolInvocationRequest::new(action.tool.clone(), action.parameters.clone(), context.clone());
        if let Some(ms) = self.config.tool_timeout_ms {
            request = request.with_timeout_ms(ms);
        }
        // 注册表把一切失败折叠为失败结果，这里不会拿到 Err
        let result = self.registry.invoke(request).await;
        let succeeded = result.success;

        let status = if succeeded {
            ActionStatus::Completed
        } else {
            ActionStatus::Failed
        };
        let plan = plan_snapshot.with_action_status(&action.id, status);
        let has_more = plan.has_pending();
        *context = self.contexts.update(
            context,
            ContextUpdate::default()
                .with_plan(plan)
                .with_result(result.clone()),
        );

        let outcome = if succeeded {
            StepOutcome::Success
        } else if result
            .error
            .as_ref()
            .map(|e| e.is_timeout())
            .unwrap_or(false)
        {
            StepOutcome::Timeout
        } else {
            StepOutcome::Failure
        };
        self.record_step(
            steps,
            context,
            AgentStep {
                number: steps.len() as u64 + 1,
                phase: AgentPhase::Acting,
                description: format!(
                    "Executed tool {}: {}",
                    action.tool,
                    if succeeded { "ok" } else { "failed" }
                ),
                reasoning: Some(action.description.clone()),
                invocation: Some(ToolInvocation {
                    tool: action.tool.clone(),
                    input: action.parameters.clone(),
                }),
                result: Some(result),
                outcome,
                duration_ms: started.elapsed().as_millis() as u64,
                started_at: began,
                ended_at: Utc::now(),
            },
        );

        if !has_more || !succeeded {
            let reason = if succeeded {
                "plan exhausted"
            } else {
                "tool failure observed"
            };
            self.transition_or_yield(AgentPhase::Observing, reason);
        }
    }

    /// Observing：汇总最近结果的成败计数
    fn run_observing(&self, context: &Arc<AgentContext>, steps: &mut Vec<AgentStep>) {
        let began = Utc::now();
        let total = context.recent_results.len();
        let succeeded = context.recent_results.iter().filter(|r| r.success).count();
        let outcome = if total == 0 {
            StepOutcome::Skipped
        } else if succeeded == total {
            StepOutcome::Success
        } else if succeeded > 0 {
            StepOutcome::Partial
        } else {
            StepOutcome::Failure
        };
        self.record_step(
            steps,
            context,
            AgentStep {
                number: steps.len() as u64 + 1,
                phase: AgentPhase::Observing,
                description: format!(
                    "Observed {}/{} recent tool results successful",
                    succeeded, total
                ),
                reasoning: None,
                invocation: None,
                result: None,
                outcome,
                duration_ms: 0,
                started_at: began,
                ended_at: Utc::now(),
            },
        );
        self.transition_or_yield(AgentPhase::Reflecting, "observation recorded");
    }

    /// Reflecting：调用 Reflector；继续则回 Planning，否则 complete / fail 终止
    async fn run_reflecting(&self, context: &Arc<AgentContext>, steps: &mut Vec<AgentStep>) {
        let started = Instant::now();
        let began = Utc::now();
        match self.reflector.reflect(context, steps).await {
            Ok(reflection) => {
                let reasoning = if reflection.adjustments.is_empty() {
                    None
                } else {
                    Some(reflection.adjustments.join("; "))
                };
                self.record_step(
                    steps,
                    context,
                    AgentStep {
                        number: steps.len() as u64 + 1,
                        phase: AgentPhase::Reflecting,
                        description: reflection.reason.clone(),
                        reasoning,
                        invocation: None,
                        result: None,
                        outcome: StepOutcome::Success,
                        duration_ms: started.elapsed().as_millis() as u64,
                        started_at: began,
                        ended_at: Utc::now(),
                    },
                );
                let mut lc = self.lifecycle.lock().expect("lifecycle lock poisoned");
                if lc.current_phase().is_terminal() || lc.current_phase() == AgentPhase::Suspended
                {
                    return;
                }
                if reflection.should_continue {
                    if let Err(e) =
                        lc.transition(AgentPhase::Planning, "reflection requested another cycle")
                    {
                        lc.fail(e.to_string());
                    }
                } else if reflection.is_success {
                    if let Err(e) = lc.complete(reflection.reason.clone()) {
                        lc.fail(e.to_string());
                    }
                } else {
                    lc.fail(reflection.reason.clone());
                }
            }
            Err(e) => {
                self.lifecycle
                    .lock()
                    .expect("lifecycle lock poisoned")
                    .fail(AgentError::ReflectorFailed(e).to_string());
            }
        }
    }

    /// 追加审计步骤并发事件
    fn record_step(&self, steps: &mut Vec<AgentStep>, context: &Arc<AgentContext>, step: AgentStep) {
        send_event(
            &self.event_tx,
            AgentEvent::LoopStep {
                session: context.session.clone(),
                step: step.number,
                phase: step.phase,
                description: step.description.clone(),
            },
        );
        steps.push(step);
    }

    /// 阶段转移；外部已 stop / suspend 则让位（循环顶部统一处理），
    /// 其余转移失败视为编排 bug，转为会话失败
    fn transition_or_yield(&self, target: AgentPhase, reason: &str) {
        let mut lc = self.lifecycle.lock().expect("lifecycle lock poisoned");
        let current = lc.current_phase();
        if current.is_terminal() || current == AgentPhase::Suspended {
            return;
        }
        if let Err(e) = lc.transition(target, reason) {
            lc.fail(e.to_string());
        }
    }

    /// 终态收尾：根据最终阶段给出结果与原因
    fn finish_run(
        &self,
        session: SessionId,
        steps: Vec<AgentStep>,
        context: Arc<AgentContext>,
        run_started: Instant,
    ) -> LoopResult {
        let (final_phase, reason) = {
            let lc = self.lifecycle.lock().expect("lifecycle lock poisoned");
            (
                lc.current_phase(),
                lc.last_reason().unwrap_or_default().to_string(),
            )
        };
        let success = final_phase == AgentPhase::Complete;
        if success {
            send_event(
                &self.event_tx,
                AgentEvent::LoopComplete {
                    session: session.clone(),
                    reason: reason.clone(),
                },
            );
        } else {
            send_event(
                &self.event_tx,
                AgentEvent::LoopFailed {
                    session: session.clone(),
                    reason: reason.clone(),
                },
            );
        }
        tracing::info!(
            session = %session,
            success,
            steps = steps.len(),
            reason = %reason,
            "decision loop finished"
        );
        LoopResult {
            success,
            final_phase,
            steps,
            final_context: context,
            duration_ms: run_started.elapsed().as_millis() as u64,
            reason,
        }
    }

    /// 挂起收尾：立即返回，不抛错
    fn suspended_run(
        &self,
        session: SessionId,
        steps: Vec<AgentStep>,
        context: Arc<AgentContext>,
        run_started: Instant,
    ) -> LoopResult {
        let reason = {
            let lc = self.lifecycle.lock().expect("lifecycle lock poisoned");
            lc.last_reason().unwrap_or_default().to_string()
        };
        send_event(
            &self.event_tx,
            AgentEvent::LoopSuspended {
                session: session.clone(),
                reason: reason.clone(),
            },
        );
        tracing::info!(session = %session, reason = %reason, "decision loop suspended");
        LoopResult {
            success: false,
            final_phase: AgentPhase::Suspended,
            steps,
            final_context: context,
            duration_ms: run_started.elapsed().as_millis() as u64,
            reason,
        }
    }
}
