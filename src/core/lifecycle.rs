//! 生命周期状态机
//!
//! 唯一合法的阶段转移图（见 `AgentPhase::allowed_targets`）与阶段历史审计。
//! Complete / Failed 为终态；transition 之外提供 fail（绕过转移表的逃生口）、
//! complete、suspend / resume 快捷操作。每次进入 / 退出阶段都会向事件通道通知。

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;

use crate::core::error::AgentError;
use crate::core::events::{send_event, AgentEvent};

/// 生命周期阶段
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentPhase {
    /// 初始态，等待意图
    Idle,
    /// 规划中（调用 Planner）
    Planning,
    /// 执行计划内动作（调用工具）
    Acting,
    /// 汇总最近结果
    Observing,
    /// 反思并决定继续 / 完成 / 失败
    Reflecting,
    /// 终态：目标完成
    Complete,
    /// 终态：目标失败
    Failed,
    /// 外部挂起，resume 后回到 Planning
    Suspended,
}

impl AgentPhase {
    /// 是否终态（无出边）
    pub fn is_terminal(self) -> bool {
        matches!(self, AgentPhase::Complete | AgentPhase::Failed)
    }

    /// 合法转移表：当前阶段允许进入的目标集合
    pub fn allowed_targets(self) -> &'static [AgentPhase] {
        use AgentPhase::*;
        match self {
            Idle => &[Planning, Suspended],
            Planning => &[Acting, Reflecting, Failed, Suspended],
            Acting => &[Observing, Failed, Suspended],
            Observing => &[Reflecting, Failed, Suspended],
            Reflecting => &[Planning, Complete, Failed, Suspended],
            Suspended => &[Planning, Failed],
            Complete | Failed => &[],
        }
    }
}

/// 单条阶段历史：进入 / 退出时间与原因；阶段退出后该条目不再修改
#[derive(Clone, Debug, Serialize)]
pub struct PhaseRecord {
    pub phase: AgentPhase,
    /// 进入该阶段时的步数计数
    pub step: u64,
    pub reason: String,
    pub entered_at: DateTime<Utc>,
    pub exited_at: Option<DateTime<Utc>>,
}

/// 生命周期控制器：当前 / 上一阶段、步数计数、阶段历史与事件通知
pub struct LifecycleController {
    current: AgentPhase,
    previous: Option<AgentPhase>,
    step: u64,
    history: Vec<PhaseRecord>,
    started_at: DateTime<Utc>,
    last_transition_at: DateTime<Utc>,
    event_tx: Option<UnboundedSender<AgentEvent>>,
}

impl LifecycleController {
    /// 构造即进入 Idle（自动记入历史）
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            current: AgentPhase::Idle,
            previous: None,
            step: 0,
            history: vec![PhaseRecord {
                phase: AgentPhase::Idle,
                step: 0,
                reason: "lifecycle created".to_string(),
                entered_at: now,
                exited_at: None,
            }],
            started_at: now,
            last_transition_at: now,
            event_tx: None,
        }
    }

    /// 注入事件通道（在 run 之前设置）
    pub fn set_event_tx(&mut self, tx: UnboundedSender<AgentEvent>) {
        self.event_tx = Some(tx);
    }

    pub fn current_phase(&self) -> AgentPhase {
        self.current
    }

    pub fn previous_phase(&self) -> Option<AgentPhase> {
        self.previous
    }

    pub fn step(&self) -> u64 {
        self.step
    }

    pub fn history(&self) -> &[PhaseRecord] {
        &self.history
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn last_transition_at(&self) -> DateTime<Utc> {
        self.last_transition_at
    }

    pub fn is_terminal(&self) -> bool {
        self.current.is_terminal()
    }

    /// 最近一次进入当前阶段的原因
    pub fn last_reason(&self) -> Option<&str> {
        self.history.last().map(|r| r.reason.as_str())
    }

    /// 按转移表判断 target 是否可达（终态恒为 false）
    pub fn can_transition(&self, target: AgentPhase) -> bool {
        !self.current.is_terminal() && self.current.allowed_targets().contains(&target)
    }

    /// 按转移表执行一次转移；终态返回 TerminalState，非法目标返回 InvalidTransition，
    /// 两种失败都不改变当前阶段
    pub fn transition(
        &mut self,
        target: AgentPhase,
        reason: impl Into<String>,
    ) -> Result<(), AgentError> {
        if self.current.is_terminal() {
            return Err(AgentError::TerminalState(self.current));
        }
        if !self.current.allowed_targets().contains(&target) {
            return Err(AgentError::InvalidTransition {
                from: self.current,
                to: target,
            });
        }
        self.enter(target, reason.into());
        Ok(())
    }

    /// 从任意非终态强制进入 Failed（绕过转移表，供不可恢复错误使用）；已是终态则为 no-op
    pub fn fail(&mut self, reason: impl Into<String>) {
        if self.current.is_terminal() {
            return;
        }
        self.enter(AgentPhase::Failed, reason.into());
    }

    /// 仅允许从 Reflecting 进入 Complete
    pub fn complete(&mut self, reason: impl Into<String>) -> Result<(), AgentError> {
        self.transition(AgentPhase::Complete, reason)
    }

    /// 从任意非终态挂起；已挂起时为 no-op
    pub fn suspend(&mut self, reason: impl Into<String>) -> Result<(), AgentError> {
        if self.current.is_terminal() {
            return Err(AgentError::TerminalState(self.current));
        }
        if self.current == AgentPhase::Suspended {
            return Ok(());
        }
        self.enter(AgentPhase::Suspended, reason.into());
        Ok(())
    }

    /// 仅允许从 Suspended 恢复，恢复后重新进入 Planning
    pub fn resume(&mut self, reason: impl Into<String>) -> Result<(), AgentError> {
        if self.current.is_terminal() {
            return Err(AgentError::TerminalState(self.current));
        }
        if self.current != AgentPhase::Suspended {
            return Err(AgentError::InvalidTransition {
                from: self.current,
                to: AgentPhase::Planning,
            });
        }
        self.enter(AgentPhase::Planning, reason.into());
        Ok(())
    }

    /// 实际的阶段切换：关闭当前历史条目、推进阶段与步数、打开新条目并通知
    fn enter(&mut self, target: AgentPhase, reason: String) {
        let now = Utc::now();
        let from = self.current;
        if let Some(open) = self.history.last_mut() {
            open.exited_at = Some(now);
        }
        send_event(
            &self.event_tx,
            AgentEvent::PhaseExit {
                phase: from,
                step: self.step,
            },
        );
        self.previous = Some(from);
        // 挂起不消耗步数预算
        if target != AgentPhase::Suspended {
            self.step += 1;
        }
        self.current = target;
        self.last_transition_at = now;
        self.history.push(PhaseRecord {
            phase: target,
            step: self.step,
            reason: reason.clone(),
            entered_at: now,
            exited_at: None,
        });
        send_event(
            &self.event_tx,
            AgentEvent::Transition {
                from,
                to: target,
                reason,
            },
        );
        send_event(
            &self.event_tx,
            AgentEvent::PhaseEnter {
                phase: target,
                step: self.step,
            },
        );
    }
}

impl Default for LifecycleController {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_PHASES: [AgentPhase; 8] = [
        AgentPhase::Idle,
        AgentPhase::Planning,
        AgentPhase::Acting,
        AgentPhase::Observing,
        AgentPhase::Reflecting,
        AgentPhase::Complete,
        AgentPhase::Failed,
        AgentPhase::Suspended,
    ];

    /// 把控制器沿合法路径驱动到指定阶段
    fn controller_at(phase: AgentPhase) -> LifecycleController {
        let mut lc = LifecycleController::new();
        let path: &[AgentPhase] = match phase {
            AgentPhase::Idle => &[],
            AgentPhase::Planning => &[AgentPhase::Planning],
            AgentPhase::Acting => &[AgentPhase::Planning, AgentPhase::Acting],
            AgentPhase::Observing => &[
                AgentPhase::Planning,
                AgentPhase::Acting,
                AgentPhase::Observing,
            ],
            AgentPhase::Reflecting => &[
                AgentPhase::Planning,
                AgentPhase::Acting,
                AgentPhase::Observing,
                AgentPhase::Reflecting,
            ],
            AgentPhase::Complete => &[
                AgentPhase::Planning,
                AgentPhase::Acting,
                AgentPhase::Observing,
                AgentPhase::Reflecting,
                AgentPhase::Complete,
            ],
            AgentPhase::Failed => &[AgentPhase::Planning, AgentPhase::Failed],
            AgentPhase::Suspended => &[AgentPhase::Suspended],
        };
        for p in path {
            lc.transition(*p, "test path").unwrap();
        }
        assert_eq!(lc.current_phase(), phase);
        lc
    }

    #[test]
    fn test_initial_state_is_idle() {
        let lc = LifecycleController::new();
        assert_eq!(lc.current_phase(), AgentPhase::Idle);
        assert_eq!(lc.previous_phase(), None);
        assert_eq!(lc.step(), 0);
        assert_eq!(lc.history().len(), 1);
        assert!(lc.history()[0].exited_at.is_none());
    }

    #[test]
    fn test_transition_table_exhaustive() {
        // 表内的每一对都成功，表外的每一对都报 InvalidTransition 且阶段不变
        for from in ALL_PHASES {
            for to in ALL_PHASES {
                let mut lc = controller_at(from);
                let legal = from.allowed_targets().contains(&to);
                assert_eq!(lc.can_transition(to), legal, "{:?} -> {:?}", from, to);
                let result = lc.transition(to, "probe");
                if legal {
                    assert!(result.is_ok(), "{:?} -> {:?} should be legal", from, to);
                    assert_eq!(lc.current_phase(), to);
                } else {
                    let err = result.unwrap_err();
                    if from.is_terminal() {
                        assert_eq!(err.code(), "TERMINAL_STATE");
                    } else {
                        assert_eq!(err.code(), "INVALID_TRANSITION");
                    }
                    assert_eq!(lc.current_phase(), from, "failed transition must not move");
                }
            }
        }
    }

    #[test]
    fn test_terminal_absorbs_everything() {
        for terminal in [AgentPhase::Complete, AgentPhase::Failed] {
            let mut lc = controller_at(terminal);
            for to in ALL_PHASES {
                assert!(matches!(
                    lc.transition(to, "after terminal"),
                    Err(AgentError::TerminalState(_))
                ));
            }
            // fail 在终态下是 no-op
            let history_len = lc.history().len();
            lc.fail("again");
            assert_eq!(lc.current_phase(), terminal);
            assert_eq!(lc.history().len(), history_len);
        }
    }

    #[test]
    fn test_fail_bypasses_table() {
        // Idle 没有到 Failed 的表内边，fail 仍然生效
        let mut lc = LifecycleController::new();
        assert!(!lc.can_transition(AgentPhase::Failed));
        lc.fail("unrecoverable");
        assert_eq!(lc.current_phase(), AgentPhase::Failed);
        assert_eq!(lc.last_reason(), Some("unrecoverable"));
    }

    #[test]
    fn test_complete_only_from_reflecting() {
        let mut lc = controller_at(AgentPhase::Reflecting);
        lc.complete("goal reached").unwrap();
        assert_eq!(lc.current_phase(), AgentPhase::Complete);

        for phase in [AgentPhase::Idle, AgentPhase::Planning, AgentPhase::Acting] {
            let mut lc = controller_at(phase);
            assert!(lc.complete("too early").is_err());
            assert_eq!(lc.current_phase(), phase);
        }
    }

    #[test]
    fn test_suspend_resume() {
        let mut lc = controller_at(AgentPhase::Acting);
        let step_before = lc.step();
        lc.suspend("operator pause").unwrap();
        assert_eq!(lc.current_phase(), AgentPhase::Suspended);
        // 进入 Suspended 不消耗步数
        assert_eq!(lc.step(), step_before);
        // 重复挂起是 no-op
        let history_len = lc.history().len();
        lc.suspend("again").unwrap();
        assert_eq!(lc.history().len(), history_len);

        lc.resume("operator resume").unwrap();
        assert_eq!(lc.current_phase(), AgentPhase::Planning);
        assert_eq!(lc.step(), step_before + 1);
    }

    #[test]
    fn test_resume_only_from_suspended() {
        let mut lc = controller_at(AgentPhase::Planning);
        assert!(matches!(
            lc.resume("not suspended"),
            Err(AgentError::InvalidTransition { .. })
        ));
        let mut done = controller_at(AgentPhase::Complete);
        assert!(matches!(
            done.resume("terminal"),
            Err(AgentError::TerminalState(_))
        ));
    }

    #[test]
    fn test_history_records_are_closed_in_order() {
        let mut lc = controller_at(AgentPhase::Observing);
        let history = lc.history();
        // 除最后一条外全部已关闭
        for record in &history[..history.len() - 1] {
            assert!(record.exited_at.is_some());
        }
        assert!(history.last().unwrap().exited_at.is_none());
        assert_eq!(
            history.iter().map(|r| r.phase).collect::<Vec<_>>(),
            vec![
                AgentPhase::Idle,
                AgentPhase::Planning,
                AgentPhase::Acting,
                AgentPhase::Observing
            ]
        );
        lc.fail("stop");
        assert!(lc.history().iter().rev().nth(1).unwrap().exited_at.is_some());
    }

    #[test]
    fn test_step_counter_counts_non_suspend_transitions() {
        let mut lc = LifecycleController::new();
        lc.transition(AgentPhase::Planning, "1").unwrap();
        lc.transition(AgentPhase::Acting, "2").unwrap();
        lc.suspend("pause").unwrap();
        lc.resume("go").unwrap();
        // Planning + Acting + resume-into-Planning = 3；suspend 不计
        assert_eq!(lc.step(), 3);
        assert_eq!(lc.previous_phase(), Some(AgentPhase::Suspended));
    }
}
