//! Hornet 演示入口
//!
//! 加载配置 → 初始化 tracing → 注册内置工具 → 用脚本化策略跑一个会话，
//! 打印过程事件与最终审计轨迹。真实部署中 Planner / Reflector 由外部接入。

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use serde_json::json;

use hornet::config::{load_config, AppConfig};
use hornet::context::{ContextManager, ExecutionPlan, PlannedAction, UserIntent, WorkspaceMeta};
use hornet::decision::{DecisionLoop, FirstResultReflector, LoopConfig, QueuedPlanner};
use hornet::tools::{EchoTool, FsListTool, FsReadTool, FsWriteTool, ToolRegistry};

#[tokio::main]
async fn main() -> Result<()> {
    hornet::observability::init();
    let cfg = load_config(None).unwrap_or_else(|_| AppConfig::default());

    let workspace_root = cfg
        .app
        .workspace_root
        .clone()
        .unwrap_or_else(|| PathBuf::from("./workspace"));
    std::fs::create_dir_all(&workspace_root)?;

    let (event_tx, mut event_rx) = tokio::sync::mpsc::unbounded_channel();
    let printer = tokio::spawn(async move {
        while let Some(ev) = event_rx.recv().await {
            if let Ok(line) = serde_json::to_string(&ev) {
                println!("event: {}", line);
            }
        }
    });

    let registry = Arc::new(
        ToolRegistry::from_config(&cfg.tools).with_event_tx(event_tx.clone()),
    );
    registry.register(EchoTool)?;
    registry.register(FsReadTool::new(&workspace_root))?;
    registry.register(FsWriteTool::new(&workspace_root))?;
    registry.register(FsListTool::new(&workspace_root))?;

    let contexts = Arc::new(
        ContextManager::new().with_max_recent_results(cfg.context.max_recent_results),
    );

    // 脚本化计划：列一下工作区，然后回显一句话
    let plan = ExecutionPlan::new(
        "Inspect the workspace",
        vec![
            PlannedAction::new(0, "fs_list", "List workspace root", json!({ "path": "." })),
            PlannedAction::new(1, "echo", "Report back", json!({ "text": "workspace inspected" })),
        ],
    );
    let planner = Arc::new(QueuedPlanner::new(vec![plan]));
    let reflector = Arc::new(FirstResultReflector);

    let decision_loop = DecisionLoop::new(
        contexts,
        registry,
        planner,
        reflector,
        LoopConfig::from(&cfg),
    )
    .with_event_tx(event_tx.clone());

    let result = decision_loop
        .run(
            UserIntent::new("inspect the workspace and report back"),
            WorkspaceMeta::new(&workspace_root),
        )
        .await;

    println!();
    println!(
        "session {} finished: success={} phase={:?} reason={}",
        result.final_context.session, result.success, result.final_phase, result.reason
    );
    for step in &result.steps {
        println!(
            "  step {} [{:?}/{:?}] {} ({} ms)",
            step.number, step.phase, step.outcome, step.description, step.duration_ms
        );
    }
    println!(
        "context version {} with {} recent result(s)",
        result.final_context.version,
        result.final_context.recent_results.len()
    );

    drop(decision_loop);
    drop(event_tx);
    printer.await?;
    Ok(())
}
