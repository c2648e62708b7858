//! 上下文数据模型
//!
//! AgentContext 是会话的单一事实来源：意图、工作区、最近结果、当前计划、
//! 事实与约束。所有值一经构造即不可变——每次"修改"都由 ContextManager
//! 产出 version + 1 的新值，旧值原样留在会话历史里供回放。
//! 标识符一律用 newtype 包装，避免裸字符串混用。

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::tools::types::{ToolId, ToolResult};

/// 会话 ID（一次决策循环运行 = 一个会话 = 一条上下文谱系）
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn generate() -> Self {
        Self(format!("session_{}", uuid::Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 上下文值 ID（每个版本一个）
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContextId(String);

impl ContextId {
    pub fn generate() -> Self {
        Self(format!("ctx_{}", uuid::Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 计划内动作 ID
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActionId(String);

impl ActionId {
    pub fn generate() -> Self {
        Self(format!("action_{}", uuid::Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ActionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for ActionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 约束 ID（约束合并时按 id 去重）
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConstraintId(String);

impl ConstraintId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ConstraintId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// 外部记忆引用（键由外部记忆系统定义，核心只透传）
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MemoryRef(String);

impl MemoryRef {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for MemoryRef {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// 用户意图：自然语言解析在核心之外完成，这里只携带文本
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UserIntent {
    pub text: String,
}

impl UserIntent {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }
}

/// 工作区快照元数据
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkspaceMeta {
    pub root: PathBuf,
    pub name: Option<String>,
    pub branch: Option<String>,
}

impl WorkspaceMeta {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            name: None,
            branch: None,
        }
    }

    /// 浅合并：只覆盖 patch 中提供的字段
    pub fn merged(&self, patch: &WorkspacePatch) -> WorkspaceMeta {
        WorkspaceMeta {
            root: patch.root.clone().unwrap_or_else(|| self.root.clone()),
            name: patch.name.clone().or_else(|| self.name.clone()),
            branch: patch.branch.clone().or_else(|| self.branch.clone()),
        }
    }
}

/// 工作区补丁：None 字段保持原值
#[derive(Clone, Debug, Default)]
pub struct WorkspacePatch {
    pub root: Option<PathBuf>,
    pub name: Option<String>,
    pub branch: Option<String>,
}

/// 累积事实：按 statement 文本去重，后写覆盖先写
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Fact {
    pub statement: String,
    pub category: Option<String>,
    /// 置信度 0.0 - 1.0
    pub confidence: f64,
    pub source: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

impl Fact {
    pub fn new(statement: impl Into<String>, confidence: f64) -> Self {
        Self {
            statement: statement.into(),
            category: None,
            confidence: confidence.clamp(0.0, 1.0),
            source: None,
            recorded_at: Utc::now(),
        }
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

/// 会话约束：按 id 去重，后写覆盖先写
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Constraint {
    pub id: ConstraintId,
    pub description: String,
}

impl Constraint {
    pub fn new(id: impl Into<ConstraintId>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
        }
    }
}

/// 动作状态：Pending 执行后进入 Completed / Failed，不会回退
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Pending,
    InProgress,
    Completed,
    Skipped,
    Failed,
}

/// 计划内的一个工具调用动作
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PlannedAction {
    pub id: ActionId,
    /// 在计划内的位置（执行严格按列表顺序）
    pub index: usize,
    pub tool: ToolId,
    pub description: String,
    /// 期望参数（不透明键值，原样传给工具）
    pub parameters: Value,
    /// 声明的动作依赖；当前仅作记录，不参与排序或门控
    pub depends_on: Vec<ActionId>,
    pub priority: u8,
    pub status: ActionStatus,
}

impl PlannedAction {
    pub fn new(
        index: usize,
        tool: impl Into<ToolId>,
        description: impl Into<String>,
        parameters: Value,
    ) -> Self {
        Self {
            id: ActionId::generate(),
            index,
            tool: tool.into(),
            description: description.into(),
            parameters,
            depends_on: Vec::new(),
            priority: 0,
            status: ActionStatus::Pending,
        }
    }

    pub fn with_depends_on(mut self, deps: Vec<ActionId>) -> Self {
        self.depends_on = deps;
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }
}

/// 执行计划：每个 Planning 阶段产出一份新计划；重规划整体替换旧计划并递增 revision
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub description: String,
    pub actions: Vec<PlannedAction>,
    /// 下一个待执行动作的下标；全部执行完时等于 actions.len()
    pub current_index: usize,
    /// 置信度 0.0 - 1.0
    pub confidence: f64,
    pub created_at: DateTime<Utc>,
    pub revision: u32,
}

impl ExecutionPlan {
    pub fn new(description: impl Into<String>, actions: Vec<PlannedAction>) -> Self {
        Self {
            description: description.into(),
            actions,
            current_index: 0,
            confidence: 1.0,
            created_at: Utc::now(),
            revision: 1,
        }
    }

    /// 空计划（无待执行动作）
    pub fn empty(description: impl Into<String>) -> Self {
        Self::new(description, Vec::new())
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence.clamp(0.0, 1.0);
        self
    }

    pub fn with_revision(mut self, revision: u32) -> Self {
        self.revision = revision;
        self
    }

    /// 列表顺序中第一个 Pending 动作（忽略 depends_on）
    pub fn next_pending(&self) -> Option<&PlannedAction> {
        self.actions
            .iter()
            .find(|a| a.status == ActionStatus::Pending)
    }

    pub fn has_pending(&self) -> bool {
        self.next_pending().is_some()
    }

    /// 产出一份标记了指定动作状态的新计划（原计划不动），并重算 current_index
    pub fn with_action_status(&self, id: &ActionId, status: ActionStatus) -> ExecutionPlan {
        let mut plan = self.clone();
        if let Some(action) = plan.actions.iter_mut().find(|a| &a.id == id) {
            action.status = status;
        }
        plan.current_index = plan
            .actions
            .iter()
            .position(|a| a.status == ActionStatus::Pending)
            .unwrap_or(plan.actions.len());
        plan
    }
}

/// 会话上下文：单一事实来源，一经构造不可变
///
/// 每次合并都由 ContextManager 产出 `version = 前值 + 1` 的新值并记入会话历史；
/// 值本身可以跨线程按引用安全共享。
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AgentContext {
    pub id: ContextId,
    pub session: SessionId,
    /// 单调递增版本号，create 产出 1
    pub version: u64,
    pub intent: UserIntent,
    pub workspace: WorkspaceMeta,
    /// 最近工具结果（有界 FIFO，超出时淘汰最旧）
    pub recent_results: Vec<ToolResult>,
    pub active_plan: Option<ExecutionPlan>,
    pub facts: Vec<Fact>,
    pub constraints: Vec<Constraint>,
    pub memory_refs: Vec<MemoryRef>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AgentContext {
    /// 按类别筛选事实；None 返回全部
    pub fn query_facts(&self, category: Option<&str>) -> Vec<&Fact> {
        match category {
            None => self.facts.iter().collect(),
            Some(c) => self
                .facts
                .iter()
                .filter(|f| f.category.as_deref() == Some(c))
                .collect(),
        }
    }

    pub fn latest_result(&self) -> Option<&ToolResult> {
        self.recent_results.last()
    }
}
