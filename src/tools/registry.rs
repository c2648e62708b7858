//! 工具注册表与调度管线
//!
//! 所有工具实现 Tool trait（name / category / permissions / schema / validate / execute），
//! 由 ToolRegistry 按名注册与查找。invoke 按固定顺序走管线：存在性 → 启用 →
//! 权限 → 校验 → 带超时执行，任一环节失败立即短路为失败的 ToolResult，
//! 永不向调用方抛错；每次调用输出结构化审计日志（JSON）并更新运行指标。
//!
//! 目录项一律以 Arc<ToolEntry> 整体替换（copy-on-write），并发会话共享同一
//! 注册表时只在锁内做查找与指针交换，从不跨 await 持锁。

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

use crate::config::ToolsSection;
use crate::core::events::{send_event, AgentEvent};
use crate::tools::types::{
    ExecutionContext, FieldError, Permission, ToolCategory, ToolError, ToolId,
    ToolInvocationRequest, ToolResult,
};

/// 工具 trait：能力描述（供规划方理解）、声明的权限与副作用、输入输出 Schema、
/// 可选自定义校验、异步执行
///
/// execute 只对「预期内的失败」返回 Err(消息)；真正的异常情况（panic 级）不应出现，
/// 注册表会把 Err 统一折叠为 EXECUTION_ERROR。
#[async_trait]
pub trait Tool: Send + Sync {
    /// 工具名称（注册表内唯一）
    fn name(&self) -> &str;

    /// 工具描述（供规划方理解功能与参数格式）
    fn description(&self) -> &str;

    /// 工具类别（注册时对照类别白名单）
    fn category(&self) -> ToolCategory {
        ToolCategory::from("utility")
    }

    /// 声明需要的权限；必须全部在注册表授予集合内才允许执行
    fn required_permissions(&self) -> Vec<Permission> {
        Vec::new()
    }

    /// 是否有外部副作用（写文件等）
    fn has_side_effects(&self) -> bool {
        false
    }

    /// 重复执行是否等价于执行一次
    fn is_idempotent(&self) -> bool {
        !self.has_side_effects()
    }

    /// 输入参数 JSON Schema；默认空对象表示无参数或格式不限
    fn input_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {},
            "required": []
        })
    }

    /// 输出 JSON Schema
    fn output_schema(&self) -> Value {
        serde_json::json!({ "type": "object" })
    }

    /// 自定义输入校验；返回字段级错误则调用短路为 VALIDATION_FAILED
    fn validate(&self, _input: &Value, _ctx: &ExecutionContext) -> Result<(), Vec<FieldError>> {
        Ok(())
    }

    /// 执行工具
    async fn execute(&self, input: Value, ctx: &ExecutionContext) -> Result<Value, String>;
}

/// 目录项：包裹工具并跟踪注册时间、启用状态与运行指标。
/// 不可变值——任何"修改"都通过构造新项替换旧的 Arc 完成。
#[derive(Clone)]
pub struct ToolEntry {
    pub tool: Arc<dyn Tool>,
    pub registered_at: DateTime<Utc>,
    pub enabled: bool,
    pub invocations: u64,
    pub last_invoked_at: Option<DateTime<Utc>>,
    /// 滑动平均耗时：(旧均值 * 旧次数 + 本次) / 新次数
    pub avg_duration_ms: f64,
}

impl ToolEntry {
    fn new(tool: Arc<dyn Tool>) -> Self {
        Self {
            tool,
            registered_at: Utc::now(),
            enabled: true,
            invocations: 0,
            last_invoked_at: None,
            avg_duration_ms: 0.0,
        }
    }

    /// 产出一份切换了启用状态的新项
    fn with_enabled(&self, enabled: bool) -> ToolEntry {
        ToolEntry {
            enabled,
            ..self.clone()
        }
    }

    /// 产出一份记入了本次调用耗时的新项
    fn with_recorded(&self, duration_ms: u64, now: DateTime<Utc>) -> ToolEntry {
        let old_count = self.invocations as f64;
        ToolEntry {
            invocations: self.invocations + 1,
            last_invoked_at: Some(now),
            avg_duration_ms: (self.avg_duration_ms * old_count + duration_ms as f64)
                / (old_count + 1.0),
            ..self.clone()
        }
    }
}

/// 目录条目的只读投影，list 返回给规划方
#[derive(Clone, Debug, Serialize)]
pub struct ToolSpec {
    pub name: ToolId,
    pub description: String,
    pub category: ToolCategory,
    pub permissions: Vec<Permission>,
    pub input_schema: Value,
}

/// 工具注册表：工具存在与否、能否运行、运行多久的唯一裁决者；可被多个会话共享
pub struct ToolRegistry {
    entries: RwLock<HashMap<ToolId, Arc<ToolEntry>>>,
    granted: HashSet<Permission>,
    allowed_categories: Option<HashSet<ToolCategory>>,
    default_timeout_ms: u64,
    dry_run: bool,
    event_tx: Option<UnboundedSender<AgentEvent>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            granted: HashSet::new(),
            allowed_categories: None,
            default_timeout_ms: 30_000,
            dry_run: false,
            event_tx: None,
        }
    }

    /// 从 [tools] 配置段构建：权限、类别白名单、默认超时与干跑开关
    pub fn from_config(cfg: &ToolsSection) -> Self {
        let mut registry = Self::new()
            .with_default_timeout_ms(cfg.tool_timeout_secs * 1000)
            .with_dry_run(cfg.dry_run)
            .with_granted_permissions(
                cfg.granted_permissions
                    .iter()
                    .map(|p| Permission::from(p.as_str()))
                    .collect(),
            );
        if !cfg.allowed_categories.is_empty() {
            registry = registry.with_allowed_categories(
                cfg.allowed_categories
                    .iter()
                    .map(|c| ToolCategory::from(c.as_str()))
                    .collect(),
            );
        }
        registry
    }

    pub fn with_granted_permissions(mut self, permissions: Vec<Permission>) -> Self {
        self.granted = permissions.into_iter().collect();
        self
    }

    /// 追加授予单个权限
    pub fn grant(mut self, permission: impl Into<Permission>) -> Self {
        self.granted.insert(permission.into());
        self
    }

    pub fn with_allowed_categories(mut self, categories: Vec<ToolCategory>) -> Self {
        self.allowed_categories = Some(categories.into_iter().collect());
        self
    }

    pub fn with_default_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.default_timeout_ms = timeout_ms;
        self
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn with_event_tx(mut self, tx: UnboundedSender<AgentEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    /// 注册工具：重名报 DUPLICATE_TOOL，类别不在白名单报 CATEGORY_NOT_ALLOWED；
    /// 成功后默认启用并开始跟踪指标
    pub fn register(&self, tool: impl Tool + 'static) -> Result<(), ToolError> {
        let id = ToolId::from(tool.name());
        {
            let mut entries = self.entries.write().expect("registry lock poisoned");
            if entries.contains_key(&id) {
                return Err(ToolError::Duplicate(id));
            }
            if let Some(ref allowed) = self.allowed_categories {
                let category = tool.category();
                if !allowed.contains(&category) {
                    return Err(ToolError::CategoryNotAllowed(category));
                }
            }
            entries.insert(id.clone(), Arc::new(ToolEntry::new(Arc::new(tool))));
        }
        send_event(&self.event_tx, AgentEvent::ToolRegistered { tool: id });
        Ok(())
    }

    /// 注销工具；返回是否确实存在
    pub fn unregister(&self, id: &ToolId) -> bool {
        self.entries
            .write()
            .expect("registry lock poisoned")
            .remove(id)
            .is_some()
    }

    /// 启用 / 禁用工具（整体替换目录项，不原地改写）
    pub fn set_enabled(&self, id: &ToolId, enabled: bool) -> Result<(), ToolError> {
        let mut entries = self.entries.write().expect("registry lock poisoned");
        let entry = entries
            .get(id)
            .ok_or_else(|| ToolError::NotFound(id.clone()))?;
        let replaced = entry.with_enabled(enabled);
        entries.insert(id.clone(), Arc::new(replaced));
        Ok(())
    }

    /// 已启用工具的目录投影，可按类别过滤；按名称排序保证稳定
    pub fn list(&self, category: Option<&ToolCategory>) -> Vec<ToolSpec> {
        let entries = self.entries.read().expect("registry lock poisoned");
        let mut specs: Vec<ToolSpec> = entries
            .values()
            .filter(|e| e.enabled)
            .filter(|e| category.map(|c| &e.tool.category() == c).unwrap_or(true))
            .map(|e| ToolSpec {
                name: ToolId::from(e.tool.name()),
                description: e.tool.description().to_string(),
                category: e.tool.category(),
                permissions: e.tool.required_permissions(),
                input_schema: e.tool.input_schema(),
            })
            .collect();
        specs.sort_by(|a, b| a.name.as_str().cmp(b.name.as_str()));
        specs
    }

    pub fn tool_names(&self) -> Vec<ToolId> {
        let entries = self.entries.read().expect("registry lock poisoned");
        let mut names: Vec<ToolId> = entries.keys().cloned().collect();
        names.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        names
    }

    /// 目录项快照（含指标），供监控与测试检查
    pub fn entry(&self, id: &ToolId) -> Option<Arc<ToolEntry>> {
        self.entries
            .read()
            .expect("registry lock poisoned")
            .get(id)
            .cloned()
    }

    /// 调度管线：存在 → 启用 → 权限 → 校验 → 带超时执行，
    /// 任一环节失败立即短路；所有路径都返回统一的 ToolResult，从不抛错
    pub async fn invoke(&self, req: ToolInvocationRequest) -> ToolResult {
        let started = Instant::now();
        send_event(
            &self.event_tx,
            AgentEvent::ToolInvoked {
                tool: req.tool.clone(),
            },
        );

        let entry = {
            let entries = self.entries.read().expect("registry lock poisoned");
            entries.get(&req.tool).cloned()
        };
        let Some(entry) = entry else {
            return self.finish(req.tool.clone(), Err(ToolError::NotFound(req.tool)), started, false);
        };

        if !entry.enabled {
            return self.finish(
                req.tool.clone(),
                Err(ToolError::Disabled(req.tool)),
                started,
                true,
            );
        }

        let missing: Vec<Permission> = entry
            .tool
            .required_permissions()
            .into_iter()
            .filter(|p| !self.granted.contains(p))
            .collect();
        if !missing.is_empty() {
            return self.finish(
                req.tool.clone(),
                Err(ToolError::PermissionDenied {
                    tool: req.tool,
                    missing,
                }),
                started,
                true,
            );
        }

        let ctx = ExecutionContext {
            session: req.context.session.clone(),
            workspace_root: req.context.workspace.root.clone(),
            allowed_paths: vec![req.context.workspace.root.clone()],
            cancel: CancellationToken::new(),
            dry_run: self.dry_run,
        };

        if !req.skip_validation {
            if let Err(fields) = entry.tool.validate(&req.input, &ctx) {
                return self.finish(
                    req.tool.clone(),
                    Err(ToolError::ValidationFailed {
                        tool: req.tool,
                        fields,
                    }),
                    started,
                    true,
                );
            }
        }

        let timeout_ms = req.timeout_ms.unwrap_or(self.default_timeout_ms);
        let outcome = match tokio::time::timeout(
            Duration::from_millis(timeout_ms),
            entry.tool.execute(req.input, &ctx),
        )
        .await
        {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(message)) => Err(ToolError::Execution(message)),
            Err(_) => {
                // 超时只保证解除调用方阻塞；向工具发尽力而为的取消信号
                ctx.cancel.cancel();
                Err(ToolError::Timeout {
                    tool: req.tool.clone(),
                    timeout_ms,
                })
            }
        };
        self.finish(req.tool, outcome, started, true)
    }

    /// 收尾：更新指标（目录项整体替换）、输出审计日志、发事件、折叠为统一结果
    fn finish(
        &self,
        tool: ToolId,
        outcome: Result<Value, ToolError>,
        started: Instant,
        update_metrics: bool,
    ) -> ToolResult {
        let duration_ms = started.elapsed().as_millis() as u64;
        if update_metrics {
            let mut entries = self.entries.write().expect("registry lock poisoned");
            if let Some(entry) = entries.get(&tool) {
                let replaced = entry.with_recorded(duration_ms, Utc::now());
                entries.insert(tool.clone(), Arc::new(replaced));
            }
        }

        let result = match outcome {
            Ok(output) => ToolResult::ok(tool.clone(), output, duration_ms),
            Err(err) => ToolResult::failed(tool.clone(), err.into_failure(), duration_ms),
        };

        let audit = serde_json::json!({
            "event": "tool_audit",
            "tool": tool.as_str(),
            "ok": result.success,
            "code": result.error.as_ref().map(|e| e.code.clone()),
            "duration_ms": duration_ms,
        });
        tracing::info!(audit = %audit.to_string(), "tool");

        match result.error {
            None => send_event(
                &self.event_tx,
                AgentEvent::ToolCompleted { tool, duration_ms },
            ),
            Some(ref failure) => send_event(
                &self.event_tx,
                AgentEvent::ToolFailed {
                    tool,
                    code: failure.code.clone(),
                    message: failure.message.clone(),
                },
            ),
        }
        result
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;
    use crate::context::manager::ContextManager;
    use crate::context::types::{SessionId, UserIntent, WorkspaceMeta};
    use crate::tools::echo::EchoTool;
    use serde_json::json;

    fn test_context() -> Arc<crate::context::types::AgentContext> {
        let manager = ContextManager::new();
        manager.create(
            SessionId::from("session_test"),
            UserIntent::new("test"),
            WorkspaceMeta::new("/tmp"),
            Vec::new(),
            Vec::new(),
        )
    }

    /// 记录 execute 是否被调用的探针工具
    struct ProbeTool {
        executed: Arc<AtomicBool>,
        permissions: Vec<Permission>,
    }

    #[async_trait]
    impl Tool for ProbeTool {
        fn name(&self) -> &str {
            "probe"
        }

        fn description(&self) -> &str {
            "Probe tool for tests"
        }

        fn required_permissions(&self) -> Vec<Permission> {
            self.permissions.clone()
        }

        async fn execute(&self, _input: Value, _ctx: &ExecutionContext) -> Result<Value, String> {
            self.executed.store(true, Ordering::SeqCst);
            Ok(json!({"probed": true}))
        }
    }

    /// 睡过超时的慢工具
    struct SlowTool;

    #[async_trait]
    impl Tool for SlowTool {
        fn name(&self) -> &str {
            "slow"
        }

        fn description(&self) -> &str {
            "Sleeps longer than any sane timeout"
        }

        async fn execute(&self, _input: Value, _ctx: &ExecutionContext) -> Result<Value, String> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(json!("too late"))
        }
    }

    #[tokio::test]
    async fn test_invoke_unknown_tool_returns_not_found() {
        let registry = ToolRegistry::new();
        let result = registry
            .invoke(ToolInvocationRequest::new(
                "nonexistent",
                json!({}),
                test_context(),
            ))
            .await;
        assert!(!result.success);
        let failure = result.error.unwrap();
        assert_eq!(failure.code, "TOOL_NOT_FOUND");
        assert!(!failure.recoverable);
    }

    #[tokio::test]
    async fn test_invoke_disabled_tool_is_recoverable() {
        let registry = ToolRegistry::new();
        registry.register(EchoTool).unwrap();
        registry.set_enabled(&ToolId::from("echo"), false).unwrap();
        let result = registry
            .invoke(ToolInvocationRequest::new(
                "echo",
                json!({"text": "hi"}),
                test_context(),
            ))
            .await;
        let failure = result.error.unwrap();
        assert_eq!(failure.code, "TOOL_DISABLED");
        assert!(failure.recoverable);

        registry.set_enabled(&ToolId::from("echo"), true).unwrap();
        let result = registry
            .invoke(ToolInvocationRequest::new(
                "echo",
                json!({"text": "hi"}),
                test_context(),
            ))
            .await;
        assert!(result.success);
    }

    #[tokio::test]
    async fn test_permission_denied_never_executes() {
        let executed = Arc::new(AtomicBool::new(false));
        let registry = ToolRegistry::new(); // 什么权限都没授予
        registry
            .register(ProbeTool {
                executed: executed.clone(),
                permissions: vec![Permission::from("network")],
            })
            .unwrap();
        let result = registry
            .invoke(ToolInvocationRequest::new(
                "probe",
                json!({}),
                test_context(),
            ))
            .await;
        let failure = result.error.unwrap();
        assert_eq!(failure.code, "PERMISSION_DENIED");
        assert!(failure.message.contains("network"));
        assert!(!failure.recoverable);
        assert!(
            !executed.load(Ordering::SeqCst),
            "execute must not run when permissions are missing"
        );
    }

    #[tokio::test]
    async fn test_granted_permission_executes() {
        let executed = Arc::new(AtomicBool::new(false));
        let registry = ToolRegistry::new().grant("network");
        registry
            .register(ProbeTool {
                executed: executed.clone(),
                permissions: vec![Permission::from("network")],
            })
            .unwrap();
        let result = registry
            .invoke(ToolInvocationRequest::new(
                "probe",
                json!({}),
                test_context(),
            ))
            .await;
        assert!(result.success);
        assert!(executed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_timeout_bounds_wall_clock() {
        let registry = ToolRegistry::new();
        registry.register(SlowTool).unwrap();
        let started = Instant::now();
        let result = registry
            .invoke(
                ToolInvocationRequest::new("slow", json!({}), test_context())
                    .with_timeout_ms(50),
            )
            .await;
        let elapsed = started.elapsed();
        assert!(!result.success);
        let failure = result.error.unwrap();
        assert_eq!(failure.code, "EXECUTION_ERROR");
        assert!(failure.is_timeout());
        assert!(failure.recoverable);
        // 返回时间受超时约束，而不是工具实际完成时间
        assert!(elapsed < Duration::from_secs(5), "elapsed: {:?}", elapsed);
    }

    #[tokio::test]
    async fn test_duplicate_registration_rejected() {
        let registry = ToolRegistry::new();
        registry.register(EchoTool).unwrap();
        let err = registry.register(EchoTool).unwrap_err();
        assert_eq!(err.code(), "DUPLICATE_TOOL");
    }

    #[tokio::test]
    async fn test_category_allow_list() {
        let registry =
            ToolRegistry::new().with_allowed_categories(vec![ToolCategory::from("filesystem")]);
        let err = registry.register(EchoTool).unwrap_err(); // echo 是 utility
        assert_eq!(err.code(), "CATEGORY_NOT_ALLOWED");
    }

    #[tokio::test]
    async fn test_metrics_are_copy_on_write() {
        let registry = ToolRegistry::new();
        registry.register(EchoTool).unwrap();
        let id = ToolId::from("echo");

        registry
            .invoke(ToolInvocationRequest::new(
                "echo",
                json!({"text": "one"}),
                test_context(),
            ))
            .await;
        let snapshot = registry.entry(&id).unwrap();
        assert_eq!(snapshot.invocations, 1);
        assert!(snapshot.last_invoked_at.is_some());

        registry
            .invoke(ToolInvocationRequest::new(
                "echo",
                json!({"text": "two"}),
                test_context(),
            ))
            .await;
        // 旧快照是独立的值，不随后续调用变化
        assert_eq!(snapshot.invocations, 1);
        assert_eq!(registry.entry(&id).unwrap().invocations, 2);
    }

    #[tokio::test]
    async fn test_failed_invocations_still_update_metrics() {
        let registry = ToolRegistry::new();
        registry.register(EchoTool).unwrap();
        let id = ToolId::from("echo");
        registry.set_enabled(&id, false).unwrap();
        registry
            .invoke(ToolInvocationRequest::new("echo", json!({}), test_context()))
            .await;
        assert_eq!(registry.entry(&id).unwrap().invocations, 1);
    }

    #[tokio::test]
    async fn test_list_filters_disabled_and_category() {
        let registry = ToolRegistry::new();
        registry.register(EchoTool).unwrap();
        assert_eq!(registry.list(None).len(), 1);
        assert!(registry
            .list(Some(&ToolCategory::from("filesystem")))
            .is_empty());
        registry.set_enabled(&ToolId::from("echo"), false).unwrap();
        assert!(registry.list(None).is_empty());
    }

    /// 校验必失败的工具，用于验证 skip_validation 旁路
    struct PickyTool;

    #[async_trait]
    impl Tool for PickyTool {
        fn name(&self) -> &str {
            "picky"
        }

        fn description(&self) -> &str {
            "Rejects every input unless validation is skipped"
        }

        fn validate(
            &self,
            _input: &Value,
            _ctx: &ExecutionContext,
        ) -> Result<(), Vec<FieldError>> {
            Err(vec![FieldError::new("input", "always rejected")])
        }

        async fn execute(&self, _input: Value, _ctx: &ExecutionContext) -> Result<Value, String> {
            Ok(json!("ran anyway"))
        }
    }

    #[tokio::test]
    async fn test_skip_validation_bypasses_validator() {
        let registry = ToolRegistry::new();
        registry.register(PickyTool).unwrap();

        let rejected = registry
            .invoke(ToolInvocationRequest::new(
                "picky",
                json!({}),
                test_context(),
            ))
            .await;
        let failure = rejected.error.unwrap();
        assert_eq!(failure.code, "VALIDATION_FAILED");
        assert!(failure.recoverable);
        assert!(failure.message.contains("input: always rejected"));

        let bypassed = registry
            .invoke(
                ToolInvocationRequest::new("picky", json!({}), test_context())
                    .with_skip_validation(),
            )
            .await;
        assert!(bypassed.success);
    }

    #[tokio::test]
    async fn test_unregister() {
        let registry = ToolRegistry::new();
        registry.register(EchoTool).unwrap();
        assert!(registry.unregister(&ToolId::from("echo")));
        assert!(!registry.unregister(&ToolId::from("echo")));
        assert!(registry.tool_names().is_empty());
    }
}
