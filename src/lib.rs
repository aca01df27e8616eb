//! Duopass - 面向 LLM 轮次的执行编排器
//!
//! 流式输出与工具调用在一次后端调用里互斥：要么边生成边显示，要么等完整回复再解析工具调用。
//! 本 crate 按轮次对用户消息分类、规划一到两个通道（流式可见 / 缓冲带工具），并发执行，
//! 规范化标签式工具调用，分发工具，并把轮次记录提交到记忆存储。
//!
//! 模块划分：
//! - **agent**: 按配置装配编排器（LLM / 工具 / 存储）
//! - **config**: 应用配置加载（TOML + 环境变量）与热更新句柄
//! - **core**: 轮次状态机、轮次数据、后端并发闸门、会话监管、编排器
//! - **llm**: 后端请求类型、客户端抽象与实现（OpenAI 兼容 / Mock / 脚本化）
//! - **memory**: 对话历史、长期记忆、轮次提交存储
//! - **observability**: 日志初始化
//! - **pipeline**: 分类、规划、标签式调用规范化、通道执行、工具分发、事件
//! - **tools**: 工具 trait、注册表、执行器与内置工具

pub mod agent;
pub mod config;
pub mod core;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod pipeline;
pub mod tools;

pub use crate::core::{TurnOrchestrator, TurnOutcome, TurnPhase, TurnRecord};
pub use crate::pipeline::{classify, normalize, plan, ExecutionMode, ExecutionPlan, OperationCategory, TurnEvent};
