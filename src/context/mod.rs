//! 上下文层：不可变版本化上下文值与会话历史管理（Context Manager）

pub mod manager;
pub mod types;

pub use manager::{ContextManager, ContextUpdate, PlanUpdate};
pub use types::{
    ActionId, ActionStatus, AgentContext, Constraint, ConstraintId, ContextId, ExecutionPlan, Fact,
    MemoryRef, PlannedAction, SessionId, UserIntent, WorkspaceMeta, WorkspacePatch,
};
