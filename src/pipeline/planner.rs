//! 执行规划：类别 × 执行模式 → ExecutionPlan
//!
//! 决策表是行为的唯一来源，改模式语义必须同时改这里与下面的测试：
//!
//! | mode                 | category      | plan                                               |
//! |----------------------|---------------|----------------------------------------------------|
//! | SinglePass           | any           | 单通道：tools = 已配置工具，stream = !tools         |
//! | DualPassWriteOnly    | Read          | 单通道：缓冲 + 工具                                 |
//! | DualPassWriteOnly    | Write         | 双通道：流式无工具（可见） + 缓冲带工具（副作用）     |
//! | DualPassWriteOnly    | General       | 单通道：流式无工具                                  |
//! | DualPassAll          | Read / Write  | 双通道（同上）                                      |
//! | DualPassAll          | General       | 单通道：流式无工具                                  |

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::core::AgentError;
use crate::pipeline::OperationCategory;

/// 执行模式（进程级配置，可在轮次之间热更新）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    #[default]
    SinglePass,
    DualPassWriteOnly,
    DualPassAll,
}

impl ExecutionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionMode::SinglePass => "single_pass",
            ExecutionMode::DualPassWriteOnly => "dual_pass_write_only",
            ExecutionMode::DualPassAll => "dual_pass_all",
        }
    }
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionMode {
    type Err = AgentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "single_pass" | "single" => Ok(ExecutionMode::SinglePass),
            "dual_pass_write_only" | "write_only" => Ok(ExecutionMode::DualPassWriteOnly),
            "dual_pass_all" | "dual" => Ok(ExecutionMode::DualPassAll),
            other => Err(AgentError::ConfigError(format!("unknown execution mode: {}", other))),
        }
    }
}

/// 通道用途
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PassPurpose {
    UserFacing,
    SideEffect,
}

/// 单次后端调用的形态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PassSpec {
    pub streaming: bool,
    pub tools_enabled: bool,
    pub purpose: PassPurpose,
}

impl PassSpec {
    pub const fn user_facing(streaming: bool, tools_enabled: bool) -> Self {
        Self {
            streaming,
            tools_enabled,
            purpose: PassPurpose::UserFacing,
        }
    }

    /// 双通道中的副作用通道：缓冲、带工具
    pub const fn side_effect() -> Self {
        Self {
            streaming: false,
            tools_enabled: true,
            purpose: PassPurpose::SideEffect,
        }
    }
}

/// 执行计划：1~2 个通道，visible_from 指向唯一的可见通道
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    passes: Vec<PassSpec>,
    visible_from: usize,
}

impl ExecutionPlan {
    /// 校验不变量后构造：1 或 2 个通道；可见通道存在且为 USER_FACING；两个通道时至多一个流式
    pub fn new(passes: Vec<PassSpec>, visible_from: usize) -> Result<Self, AgentError> {
        if passes.is_empty() || passes.len() > 2 {
            return Err(AgentError::InvalidPlan(format!("{} passes", passes.len())));
        }
        match passes.get(visible_from) {
            Some(p) if p.purpose == PassPurpose::UserFacing => {}
            _ => {
                return Err(AgentError::InvalidPlan(format!(
                    "visible pass {} is not a user-facing pass",
                    visible_from
                )))
            }
        }
        if passes.iter().filter(|p| p.purpose == PassPurpose::UserFacing).count() != 1 {
            return Err(AgentError::InvalidPlan("exactly one user-facing pass required".into()));
        }
        if passes.iter().filter(|p| p.streaming).count() > 1 {
            return Err(AgentError::InvalidPlan("at most one pass may stream".into()));
        }
        Ok(Self { passes, visible_from })
    }

    fn single(spec: PassSpec) -> Self {
        Self {
            passes: vec![spec],
            visible_from: 0,
        }
    }

    fn dual() -> Self {
        Self {
            passes: vec![PassSpec::user_facing(true, false), PassSpec::side_effect()],
            visible_from: 0,
        }
    }

    pub fn passes(&self) -> &[PassSpec] {
        &self.passes
    }

    pub fn visible_from(&self) -> usize {
        self.visible_from
    }

    pub fn visible(&self) -> PassSpec {
        self.passes[self.visible_from]
    }

    /// 副作用通道（若有）及其下标
    pub fn side_effect(&self) -> Option<(usize, PassSpec)> {
        self.passes
            .iter()
            .copied()
            .enumerate()
            .find(|(_, p)| p.purpose == PassPurpose::SideEffect)
    }

    pub fn is_dual(&self) -> bool {
        self.passes.len() == 2
    }
}

/// 按决策表生成计划；纯函数且总是成功
pub fn plan(category: OperationCategory, mode: ExecutionMode, tools_configured: bool) -> ExecutionPlan {
    use OperationCategory::*;
    match (mode, category) {
        (ExecutionMode::SinglePass, _) => {
            ExecutionPlan::single(PassSpec::user_facing(!tools_configured, tools_configured))
        }
        (ExecutionMode::DualPassWriteOnly, Read) => ExecutionPlan::single(PassSpec::user_facing(false, true)),
        (ExecutionMode::DualPassWriteOnly, Write) => ExecutionPlan::dual(),
        (ExecutionMode::DualPassWriteOnly, General) => ExecutionPlan::single(PassSpec::user_facing(true, false)),
        (ExecutionMode::DualPassAll, Read | Write) => ExecutionPlan::dual(),
        (ExecutionMode::DualPassAll, General) => ExecutionPlan::single(PassSpec::user_facing(true, false)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use OperationCategory::*;

    const MODES: [ExecutionMode; 3] = [
        ExecutionMode::SinglePass,
        ExecutionMode::DualPassWriteOnly,
        ExecutionMode::DualPassAll,
    ];
    const CATEGORIES: [OperationCategory; 3] = [Read, Write, General];

    fn dual() -> Vec<PassSpec> {
        vec![PassSpec::user_facing(true, false), PassSpec::side_effect()]
    }

    /// 决策表逐行断言
    #[test]
    fn test_decision_table() {
        for category in CATEGORIES {
            for tools in [true, false] {
                let p = plan(category, ExecutionMode::SinglePass, tools);
                assert_eq!(p.passes(), &[PassSpec::user_facing(!tools, tools)]);
            }
        }
        for tools in [true, false] {
            let wo = ExecutionMode::DualPassWriteOnly;
            assert_eq!(plan(Read, wo, tools).passes(), &[PassSpec::user_facing(false, true)]);
            assert_eq!(plan(Write, wo, tools).passes(), dual().as_slice());
            assert_eq!(plan(General, wo, tools).passes(), &[PassSpec::user_facing(true, false)]);

            let all = ExecutionMode::DualPassAll;
            assert_eq!(plan(Read, all, tools).passes(), dual().as_slice());
            assert_eq!(plan(Write, all, tools).passes(), dual().as_slice());
            assert_eq!(plan(General, all, tools).passes(), &[PassSpec::user_facing(true, false)]);
        }
    }

    #[test]
    fn test_every_plan_satisfies_invariants() {
        for mode in MODES {
            for category in CATEGORIES {
                for tools in [true, false] {
                    let p = plan(category, mode, tools);
                    assert_eq!(p.visible_from(), 0);
                    assert_eq!(p.visible().purpose, PassPurpose::UserFacing);
                    assert!(ExecutionPlan::new(p.passes().to_vec(), p.visible_from()).is_ok());
                }
            }
        }
    }

    #[test]
    fn test_side_effect_lookup() {
        let p = plan(Write, ExecutionMode::DualPassWriteOnly, true);
        assert_eq!(p.side_effect(), Some((1, PassSpec::side_effect())));
        assert!(plan(General, ExecutionMode::DualPassAll, true).side_effect().is_none());
    }

    #[test]
    fn test_invalid_plans_rejected() {
        assert!(ExecutionPlan::new(vec![], 0).is_err());
        assert!(ExecutionPlan::new(vec![PassSpec::side_effect()], 0).is_err());
        assert!(ExecutionPlan::new(dual(), 1).is_err());
        let two_streams = vec![PassSpec::user_facing(true, false), PassSpec { streaming: true, ..PassSpec::side_effect() }];
        assert!(ExecutionPlan::new(two_streams, 0).is_err());
    }

    #[test]
    fn test_mode_parse() {
        assert_eq!("dual_pass_all".parse::<ExecutionMode>().unwrap(), ExecutionMode::DualPassAll);
        assert_eq!("Dual-Pass-Write-Only".parse::<ExecutionMode>().unwrap(), ExecutionMode::DualPassWriteOnly);
        assert!("triple".parse::<ExecutionMode>().is_err());
    }
}
