//! 轮次状态机
//!
//! CLASSIFYING → PLANNING → EXECUTING → MERGING → COMMITTING → DONE，
//! FAILED 只能从 EXECUTING 或 COMMITTING 进入。非法跳转返回 AgentError::InvalidTransition。

use serde::Serialize;

use crate::core::AgentError;

/// 轮次阶段
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TurnPhase {
    Classifying,
    Planning,
    Executing,
    Merging,
    Committing,
    Done,
    Failed,
}

impl TurnPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TurnPhase::Done | TurnPhase::Failed)
    }

    /// 合法后继
    pub fn can_advance_to(&self, next: TurnPhase) -> bool {
        use TurnPhase::*;
        matches!(
            (self, next),
            (Classifying, Planning)
                | (Planning, Executing)
                | (Executing, Merging)
                | (Executing, Failed)
                | (Merging, Committing)
                | (Committing, Done)
                | (Committing, Failed)
        )
    }
}

/// 当前阶段 + 经过的阶段轨迹
#[derive(Clone, Debug, Serialize)]
pub struct TurnState {
    phase: TurnPhase,
    trail: Vec<TurnPhase>,
}

impl Default for TurnState {
    fn default() -> Self {
        Self {
            phase: TurnPhase::Classifying,
            trail: vec![TurnPhase::Classifying],
        }
    }
}

impl TurnState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self) -> TurnPhase {
        self.phase
    }

    pub fn trail(&self) -> &[TurnPhase] {
        &self.trail
    }

    pub fn advance(&mut self, next: TurnPhase) -> Result<(), AgentError> {
        if !self.phase.can_advance_to(next) {
            return Err(AgentError::InvalidTransition {
                from: self.phase,
                to: next,
            });
        }
        tracing::debug!(from = ?self.phase, to = ?next, "turn phase");
        self.phase = next;
        self.trail.push(next);
        Ok(())
    }
}
