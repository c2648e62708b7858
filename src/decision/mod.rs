//! 决策层：Planner / Reflector 策略契约、审计步骤与决策循环（Decision Loop）

pub mod loop_;
pub mod step;
pub mod strategy;

pub use loop_::{DecisionLoop, LoopConfig, LoopHandle, LoopResult};
pub use step::{AgentStep, StepOutcome, ToolInvocation};
pub use strategy::{
    AlwaysContinueReflector, FirstResultReflector, Planner, QueuedPlanner, Reflection, Reflector,
    RepeatPlanner,
};
