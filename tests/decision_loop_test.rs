//! 决策循环端到端测试

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};

use hornet::context::{
    AgentContext, ContextManager, ExecutionPlan, PlannedAction, UserIntent, WorkspaceMeta,
};
use hornet::core::AgentPhase;
use hornet::decision::{
    AlwaysContinueReflector, DecisionLoop, FirstResultReflector, LoopConfig, LoopHandle, Planner,
    QueuedPlanner, RepeatPlanner,
};
use hornet::tools::{EchoTool, ExecutionContext, Permission, Tool, ToolRegistry};

fn single_echo_plan() -> ExecutionPlan {
    ExecutionPlan::new(
        "echo once",
        vec![PlannedAction::new(0, "echo", "say hi", json!({"text": "hi"}))],
    )
}

fn make_loop(
    registry: ToolRegistry,
    planner: Arc<dyn Planner>,
    reflector: Arc<dyn hornet::decision::Reflector>,
    max_steps: usize,
) -> DecisionLoop {
    DecisionLoop::new(
        Arc::new(ContextManager::new()),
        Arc::new(registry),
        planner,
        reflector,
        LoopConfig {
            max_steps,
            tool_timeout_ms: Some(5_000),
        },
    )
}

#[tokio::test]
async fn test_echo_happy_path() {
    let registry = ToolRegistry::new();
    registry.register(EchoTool).unwrap();
    let decision_loop = make_loop(
        registry,
        Arc::new(QueuedPlanner::new(vec![single_echo_plan()])),
        Arc::new(FirstResultReflector),
        20,
    );

    let result = decision_loop
        .run(UserIntent::new("say hi"), WorkspaceMeta::new("/tmp"))
        .await;

    assert!(result.success);
    assert_eq!(result.final_phase, AgentPhase::Complete);
    // 一轮完整循环：Planning、Acting、Observing、Reflecting 各一条
    assert_eq!(result.steps.len(), 4);
    assert_eq!(
        result.steps.iter().map(|s| s.phase).collect::<Vec<_>>(),
        vec![
            AgentPhase::Planning,
            AgentPhase::Acting,
            AgentPhase::Observing,
            AgentPhase::Reflecting
        ]
    );
    assert_eq!(result.final_context.recent_results.len(), 1);
    assert!(result.final_context.recent_results[0].success);
    // create + plan 合并 + 结果合并 = 版本 3
    assert_eq!(result.final_context.version, 3);
}

/// 需要未授予权限的工具：整个会话应失败，且 execute 从未被调用
struct GatedTool {
    executed: Arc<AtomicBool>,
}

#[async_trait]
impl Tool for GatedTool {
    fn name(&self) -> &str {
        "gated"
    }

    fn description(&self) -> &str {
        "Requires a permission nobody granted"
    }

    fn required_permissions(&self) -> Vec<Permission> {
        vec![Permission::from("network")]
    }

    async fn execute(&self, _input: Value, _ctx: &ExecutionContext) -> Result<Value, String> {
        self.executed.store(true, Ordering::SeqCst);
        Ok(json!("should never happen"))
    }
}

#[tokio::test]
async fn test_permission_gated_tool_fails_session() {
    let executed = Arc::new(AtomicBool::new(false));
    let registry = ToolRegistry::new();
    registry
        .register(GatedTool {
            executed: executed.clone(),
        })
        .unwrap();
    let decision_loop = make_loop(
        registry,
        Arc::new(RepeatPlanner::new("call gated tool", "gated", json!({}))),
        Arc::new(FirstResultReflector),
        20,
    );

    let result = decision_loop
        .run(UserIntent::new("use the gated tool"), WorkspaceMeta::new("/tmp"))
        .await;

    assert!(!result.success);
    assert_eq!(result.final_phase, AgentPhase::Failed);
    assert!(
        result.reason.contains("Permission denied") && result.reason.contains("network"),
        "reason should carry the permission error text, got: {}",
        result.reason
    );
    assert!(!executed.load(Ordering::SeqCst), "gated tool must never run");
    // 第一轮反思观察到失败结果后即终止
    assert_eq!(result.steps.len(), 4);
    let failed = &result.final_context.recent_results[0];
    assert_eq!(failed.error.as_ref().unwrap().code, "PERMISSION_DENIED");
}

#[tokio::test]
async fn test_max_steps_exhaustion_fails() {
    let registry = ToolRegistry::new();
    registry.register(EchoTool).unwrap();
    let decision_loop = make_loop(
        registry,
        Arc::new(RepeatPlanner::new("echo forever", "echo", json!({"text": "again"}))),
        Arc::new(AlwaysContinueReflector),
        3,
    );

    let result = decision_loop
        .run(UserIntent::new("never finish"), WorkspaceMeta::new("/tmp"))
        .await;

    assert!(!result.success);
    assert_eq!(result.final_phase, AgentPhase::Failed);
    assert_eq!(result.reason, "Exceeded maximum steps");
    assert_eq!(result.steps.len(), 3);
}

/// 在 plan 时机触发外部控制的 Planner 包装（确定性地模拟并发 stop / suspend）
struct ControlOnPlan {
    inner: QueuedPlanner,
    handle: Mutex<Option<LoopHandle>>,
    action: &'static str,
}

impl ControlOnPlan {
    fn set_handle(&self, handle: LoopHandle) {
        *self.handle.lock().unwrap() = Some(handle);
    }
}

#[async_trait]
impl Planner for ControlOnPlan {
    async fn plan(&self, context: &AgentContext) -> Result<ExecutionPlan, String> {
        if let Some(handle) = self.handle.lock().unwrap().as_ref() {
            match self.action {
                "suspend" => {
                    handle.suspend("operator paused the session").unwrap();
                }
                _ => handle.stop("operator stopped the session"),
            }
        }
        self.inner.plan(context).await
    }
}

#[tokio::test]
async fn test_external_suspend_returns_at_phase_boundary() {
    let registry = ToolRegistry::new();
    registry.register(EchoTool).unwrap();
    let planner = Arc::new(ControlOnPlan {
        inner: QueuedPlanner::new(vec![single_echo_plan()]),
        handle: Mutex::new(None),
        action: "suspend",
    });
    let decision_loop = make_loop(
        registry,
        planner.clone(),
        Arc::new(FirstResultReflector),
        20,
    );
    planner.set_handle(decision_loop.handle());

    let result = decision_loop
        .run(UserIntent::new("pause me"), WorkspaceMeta::new("/tmp"))
        .await;

    assert!(!result.success);
    assert_eq!(result.final_phase, AgentPhase::Suspended);
    assert_eq!(result.reason, "operator paused the session");
    // Planning 步骤已记录，但没有进入 Acting
    assert_eq!(result.steps.len(), 1);
    assert_eq!(result.steps[0].phase, AgentPhase::Planning);
}

#[tokio::test]
async fn test_external_stop_fails_session() {
    let registry = ToolRegistry::new();
    registry.register(EchoTool).unwrap();
    let planner = Arc::new(ControlOnPlan {
        inner: QueuedPlanner::new(vec![single_echo_plan()]),
        handle: Mutex::new(None),
        action: "stop",
    });
    let decision_loop = make_loop(
        registry,
        planner.clone(),
        Arc::new(FirstResultReflector),
        20,
    );
    planner.set_handle(decision_loop.handle());

    let result = decision_loop
        .run(UserIntent::new("stop me"), WorkspaceMeta::new("/tmp"))
        .await;

    assert!(!result.success);
    assert_eq!(result.final_phase, AgentPhase::Failed);
    assert_eq!(result.reason, "operator stopped the session");
}

#[tokio::test]
async fn test_planner_error_becomes_failed_result() {
    struct ExplodingPlanner;

    #[async_trait]
    impl Planner for ExplodingPlanner {
        async fn plan(&self, _context: &AgentContext) -> Result<ExecutionPlan, String> {
            Err("planner blew up".to_string())
        }
    }

    let registry = ToolRegistry::new();
    registry.register(EchoTool).unwrap();
    let decision_loop = make_loop(
        registry,
        Arc::new(ExplodingPlanner),
        Arc::new(FirstResultReflector),
        20,
    );

    // run 不返回 Err：策略崩溃折叠为失败结果
    let result = decision_loop
        .run(UserIntent::new("explode"), WorkspaceMeta::new("/tmp"))
        .await;
    assert!(!result.success);
    assert_eq!(result.final_phase, AgentPhase::Failed);
    assert!(result.reason.contains("planner blew up"));
}

#[tokio::test]
async fn test_history_replays_session_versions() {
    let contexts = Arc::new(ContextManager::new());
    let registry = ToolRegistry::new();
    registry.register(EchoTool).unwrap();
    let decision_loop = DecisionLoop::new(
        contexts.clone(),
        Arc::new(registry),
        Arc::new(QueuedPlanner::new(vec![single_echo_plan()])),
        Arc::new(FirstResultReflector),
        LoopConfig::default(),
    );

    let result = decision_loop
        .run(UserIntent::new("say hi"), WorkspaceMeta::new("/tmp"))
        .await;
    assert!(result.success);

    let session = result.final_context.session.clone();
    let history = contexts.get_history(&session);
    assert_eq!(history.len(), 3);
    // 版本单调递增，旧版本原样可回放
    assert_eq!(
        history.iter().map(|c| c.version).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );
    assert!(history[0].active_plan.is_none());
    assert!(history[1].active_plan.is_some());
    assert!(history[1].recent_results.is_empty());
    assert_eq!(history[2].recent_results.len(), 1);
}
