//! 核心层：生命周期状态机、错误类型、过程事件

pub mod error;
pub mod events;
pub mod lifecycle;

pub use error::AgentError;
pub use events::{send_event, AgentEvent};
pub use lifecycle::{AgentPhase, LifecycleController, PhaseRecord};
