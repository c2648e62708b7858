//! Hornet - Rust 自主智能体执行运行时
//!
//! 给定用户意图与工作区快照，驱动有界的 Plan -> Act -> Observe -> Reflect 循环，
//! 通过注册表调用沙箱工具，并把每一步累积为可审计、可回放的版本化上下文。
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **context**: 不可变版本化上下文与会话历史（Context Manager）
//! - **core**: 生命周期状态机、错误类型、过程事件
//! - **decision**: Planner / Reflector 策略契约与决策循环（Decision Loop）
//! - **observability**: tracing 初始化
//! - **tools**: 工具注册表、调度管线与内置沙箱工具

pub mod config;
pub mod context;
pub mod core;
pub mod decision;
pub mod observability;
pub mod tools;
