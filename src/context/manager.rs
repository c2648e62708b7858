//! 上下文管理器
//!
//! 只做一件事：产出新的版本化 AgentContext 值，从不原地修改旧值。
//! 每个会话的全部版本按产出顺序追加进历史（append-only），供 get_history /
//! get_version 回放；历史表用互斥锁保护——上下文值本身不可变、可跨线程共享，
//! 只有「产出下一版本并登记」这一步需要串行化。

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;

use crate::context::types::{
    AgentContext, Constraint, ContextId, ExecutionPlan, Fact, MemoryRef, SessionId, UserIntent,
    WorkspaceMeta, WorkspacePatch,
};
use crate::tools::types::ToolResult;

/// 计划更新三态：保持 / 清空 / 整体替换
#[derive(Clone, Debug, Default)]
pub enum PlanUpdate {
    /// 保持现有计划不变
    #[default]
    Keep,
    /// 清空计划
    Clear,
    /// 整体替换为新计划
    Replace(ExecutionPlan),
}

/// 一次上下文合并的全部输入；未提供的部分保持原值
#[derive(Clone, Debug, Default)]
pub struct ContextUpdate {
    pub add_results: Vec<ToolResult>,
    pub add_facts: Vec<Fact>,
    pub add_constraints: Vec<Constraint>,
    /// Some 则整体替换记忆引用列表
    pub memory_refs: Option<Vec<MemoryRef>>,
    pub plan: PlanUpdate,
    pub workspace: Option<WorkspacePatch>,
}

impl ContextUpdate {
    pub fn with_result(mut self, result: ToolResult) -> Self {
        self.add_results.push(result);
        self
    }

    pub fn with_fact(mut self, fact: Fact) -> Self {
        self.add_facts.push(fact);
        self
    }

    pub fn with_constraint(mut self, constraint: Constraint) -> Self {
        self.add_constraints.push(constraint);
        self
    }

    pub fn with_memory_refs(mut self, refs: Vec<MemoryRef>) -> Self {
        self.memory_refs = Some(refs);
        self
    }

    pub fn with_plan(mut self, plan: ExecutionPlan) -> Self {
        self.plan = PlanUpdate::Replace(plan);
        self
    }

    pub fn with_cleared_plan(mut self) -> Self {
        self.plan = PlanUpdate::Clear;
        self
    }

    pub fn with_workspace(mut self, patch: WorkspacePatch) -> Self {
        self.workspace = Some(patch);
        self
    }
}

/// 上下文管理器：按会话持有完整版本历史，产出新版本并登记
pub struct ContextManager {
    max_recent_results: usize,
    histories: Mutex<HashMap<SessionId, Vec<Arc<AgentContext>>>>,
}

impl ContextManager {
    pub fn new() -> Self {
        Self {
            max_recent_results: 10,
            histories: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_max_recent_results(mut self, max: usize) -> Self {
        self.max_recent_results = max.max(1);
        self
    }

    /// 创建会话的第一个上下文（version 1，空结果 / 事实 / 计划），并登记为历史起点
    pub fn create(
        &self,
        session: SessionId,
        intent: UserIntent,
        workspace: WorkspaceMeta,
        memory_refs: Vec<MemoryRef>,
        constraints: Vec<Constraint>,
    ) -> Arc<AgentContext> {
        let now = Utc::now();
        let context = Arc::new(AgentContext {
            id: ContextId::generate(),
            session: session.clone(),
            version: 1,
            intent,
            workspace,
            recent_results: Vec::new(),
            active_plan: None,
            facts: Vec::new(),
            constraints: dedup_constraints(Vec::new(), constraints),
            memory_refs,
            created_at: now,
            updated_at: now,
        });
        self.append_history(&session, context.clone());
        context
    }

    /// 合并出新版本：`version = current.version + 1`，新 id，current 原样不动；
    /// 合并规则见各 merge 函数
    pub fn update(&self, current: &AgentContext, update: ContextUpdate) -> Arc<AgentContext> {
        let recent_results = merge_results(
            &current.recent_results,
            update.add_results,
            self.max_recent_results,
        );
        let facts = merge_facts(&current.facts, update.add_facts);
        let constraints = dedup_constraints(current.constraints.clone(), update.add_constraints);
        let workspace = match update.workspace {
            Some(ref patch) => current.workspace.merged(patch),
            None => current.workspace.clone(),
        };
        let active_plan = match update.plan {
            PlanUpdate::Keep => current.active_plan.clone(),
            PlanUpdate::Clear => None,
            PlanUpdate::Replace(plan) => Some(plan),
        };
        let context = Arc::new(AgentContext {
            id: ContextId::generate(),
            session: current.session.clone(),
            version: current.version + 1,
            intent: current.intent.clone(),
            workspace,
            recent_results,
            active_plan,
            facts,
            constraints,
            memory_refs: update
                .memory_refs
                .unwrap_or_else(|| current.memory_refs.clone()),
            created_at: current.created_at,
            updated_at: Utc::now(),
        });
        self.append_history(&current.session, context.clone());
        context
    }

    /// 会话的全部版本（按产出顺序）；未知会话返回空，不报错
    pub fn get_history(&self, session: &SessionId) -> Vec<Arc<AgentContext>> {
        self.histories
            .lock()
            .expect("history lock poisoned")
            .get(session)
            .cloned()
            .unwrap_or_default()
    }

    /// 指定版本号的上下文；未知会话或版本返回 None
    pub fn get_version(&self, session: &SessionId, version: u64) -> Option<Arc<AgentContext>> {
        self.histories
            .lock()
            .expect("history lock poisoned")
            .get(session)
            .and_then(|h| h.iter().find(|c| c.version == version).cloned())
    }

    /// 会话的最新上下文
    pub fn latest(&self, session: &SessionId) -> Option<Arc<AgentContext>> {
        self.histories
            .lock()
            .expect("history lock poisoned")
            .get(session)
            .and_then(|h| h.last().cloned())
    }

    /// 按类别查询事实（委托给上下文值）
    pub fn query_facts(&self, context: &AgentContext, category: Option<&str>) -> Vec<Fact> {
        context.query_facts(category).into_iter().cloned().collect()
    }

    fn append_history(&self, session: &SessionId, context: Arc<AgentContext>) {
        self.histories
            .lock()
            .expect("history lock poisoned")
            .entry(session.clone())
            .or_default()
            .push(context);
    }
}

impl Default for ContextManager {
    fn default() -> Self {
        Self::new()
    }
}

/// 结果合并：追加后截断到最近 max 条（FIFO，最旧先淘汰）
fn merge_results(current: &[ToolResult], added: Vec<ToolResult>, max: usize) -> Vec<ToolResult> {
    let mut results: Vec<ToolResult> = current.to_vec();
    results.extend(added);
    if results.len() > max {
        results.drain(..results.len() - max);
    }
    results
}

/// 事实合并：按 statement 文本去重，相同陈述后写覆盖先写（保留原位置）
fn merge_facts(current: &[Fact], added: Vec<Fact>) -> Vec<Fact> {
    let mut facts: Vec<Fact> = current.to_vec();
    for fact in added {
        match facts.iter_mut().find(|f| f.statement == fact.statement) {
            Some(existing) => *existing = fact,
            None => facts.push(fact),
        }
    }
    facts
}

/// 约束合并：按 id 去重，后写覆盖先写
fn dedup_constraints(current: Vec<Constraint>, added: Vec<Constraint>) -> Vec<Constraint> {
    let mut constraints = current;
    for constraint in added {
        match constraints.iter_mut().find(|c| c.id == constraint.id) {
            Some(existing) => *existing = constraint,
            None => constraints.push(constraint),
        }
    }
    constraints
}
