//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `DUOPASS__*` 覆盖（双下划线表示嵌套，如 `DUOPASS__EXECUTION__MODE=dual_pass_all`）。
//! 运行中通过 ConfigHandle 热更新；每轮在 PLANNING 时取一次 TurnSettings 快照，轮内不再读配置。

use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::Deserialize;

use crate::pipeline::{ExecutionMode, Precedence};

const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant. Use the remember tool to store facts the user shares \
and the recall tool to look them up before answering questions about the user.";

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub execution: ExecutionSection,
    pub tools: ToolsSection,
    pub memory: MemorySection,
}

/// [app] 段：应用名、系统提示词、对话轮数上限、日志级别
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppSection {
    pub name: Option<String>,
    /// 未设置时读 config/prompts/system.txt，再退回内置提示词
    pub system_prompt: Option<String>,
    /// 对话历史保留轮数（短期记忆）
    pub max_context_turns: usize,
    /// RUST_LOG 未设置时使用
    pub log_level: Option<String>,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: None,
            system_prompt: None,
            max_context_turns: 20,
            log_level: None,
        }
    }
}

/// [llm] 段：后端选择、并发与超时
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    /// openai（任意 OpenAI 兼容端点）/ mock
    pub provider: String,
    pub model: String,
    pub base_url: Option<String>,
    /// 未设置时依次读 DUOPASS_API_KEY、OPENAI_API_KEY
    pub api_key: Option<String>,
    /// 后端同时处理的请求数；本地推理服务一般为 1
    pub max_concurrent_requests: usize,
    pub timeouts: LlmTimeoutsSection,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            model: "gpt-4o-mini".to_string(),
            base_url: None,
            api_key: None,
            max_concurrent_requests: 1,
            timeouts: LlmTimeoutsSection::default(),
        }
    }
}

impl LlmSection {
    pub fn resolved_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .or_else(|| std::env::var("DUOPASS_API_KEY").ok())
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .filter(|k| !k.trim().is_empty())
    }
}

/// [llm.timeouts]：秒
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmTimeoutsSection {
    /// 非流式请求 / 建立流式连接
    pub request: u64,
    /// 流式相邻片段的最大间隔
    pub stream_idle: u64,
}

impl Default for LlmTimeoutsSection {
    fn default() -> Self {
        Self {
            request: 120,
            stream_idle: 60,
        }
    }
}

/// [execution] 段：执行模式与各类时限
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExecutionSection {
    pub mode: ExecutionMode,
    /// 同时命中读写触发词时的裁决
    pub precedence: Precedence,
    pub extra_write_triggers: Vec<String>,
    pub extra_read_triggers: Vec<String>,
    /// 调用方断开后副作用通道最多再等多久
    pub side_effect_timeout_secs: u64,
    /// 可见通道带工具时的续写轮数上限
    pub max_tool_rounds: usize,
    pub commit_timeout_secs: u64,
}

impl Default for ExecutionSection {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::default(),
            precedence: Precedence::default(),
            extra_write_triggers: Vec::new(),
            extra_read_triggers: Vec::new(),
            side_effect_timeout_secs: 30,
            max_tool_rounds: 3,
            commit_timeout_secs: 10,
        }
    }
}

/// [tools] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolsSection {
    /// 关闭后所有通道都不挂载工具
    pub enabled: bool,
    pub tool_timeout_secs: u64,
    /// read_file / list_dir 的沙箱根目录，未设置时用 ./workspace
    pub workspace_root: Option<PathBuf>,
    /// 长期记忆快照文件（JSON），未设置时只在内存中
    pub memory_snapshot: Option<PathBuf>,
    pub memory_max_entries: usize,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            enabled: true,
            tool_timeout_secs: 30,
            workspace_root: None,
            memory_snapshot: None,
            memory_max_entries: 1000,
        }
    }
}

/// [memory] 段：轮次提交
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MemorySection {
    /// JSONL 轮次日志；未设置时提交到内存
    pub journal_path: Option<PathBuf>,
}

impl AppConfig {
    /// 系统提示词：配置（含加载时读入的提示词文件）> 内置
    pub fn system_prompt(&self) -> &str {
        self.app
            .system_prompt
            .as_deref()
            .filter(|p| !p.trim().is_empty())
            .unwrap_or(DEFAULT_SYSTEM_PROMPT)
    }

    /// 本轮快照；has_tools 为注册表是否非空
    pub fn turn_settings(&self, has_tools: bool) -> TurnSettings {
        TurnSettings {
            mode: self.execution.mode,
            tools_configured: self.tools.enabled && has_tools,
            max_tool_rounds: self.execution.max_tool_rounds,
            side_effect_timeout: Duration::from_secs(self.execution.side_effect_timeout_secs),
            commit_timeout: Duration::from_secs(self.execution.commit_timeout_secs.max(1)),
        }
    }
}

/// 未配置 system_prompt 时读取 config/prompts/system.txt（只在加载配置时读一次）
fn read_prompt_file() -> Option<String> {
    ["config/prompts/system.txt", "../config/prompts/system.txt"]
        .into_iter()
        .find_map(|p| std::fs::read_to_string(p).ok())
        .filter(|p| !p.trim().is_empty())
}

/// 从 config 目录加载配置，环境变量 DUOPASS__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 DUOPASS__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("DUOPASS")
            .separator("__")
            .try_parsing(true),
    );

    let mut config: AppConfig = builder.build()?.try_deserialize()?;
    if config.app.system_prompt.as_deref().map_or(true, |p| p.trim().is_empty()) {
        config.app.system_prompt = read_prompt_file();
    }
    Ok(config)
}

/// 重新从磁盘与环境变量加载配置
pub fn reload_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    load_config(config_path)
}

/// 一轮使用的配置快照，PLANNING 时取得
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TurnSettings {
    pub mode: ExecutionMode,
    /// 工具开关打开且注册表非空
    pub tools_configured: bool,
    pub max_tool_rounds: usize,
    pub side_effect_timeout: Duration,
    pub commit_timeout: Duration,
}

/// 可热更新的配置句柄；读者拿到的是某一时刻的 Arc 快照
#[derive(Debug, Clone)]
pub struct ConfigHandle {
    current: Arc<RwLock<Arc<AppConfig>>>,
    path: Option<PathBuf>,
}

impl ConfigHandle {
    pub fn new(config: AppConfig) -> Self {
        Self {
            current: Arc::new(RwLock::new(Arc::new(config))),
            path: None,
        }
    }

    /// 加载并记住来源路径，供 reload 使用
    pub fn load(config_path: Option<PathBuf>) -> Result<Self, config::ConfigError> {
        let config = load_config(config_path.clone())?;
        Ok(Self {
            current: Arc::new(RwLock::new(Arc::new(config))),
            path: config_path,
        })
    }

    pub fn current(&self) -> Arc<AppConfig> {
        self.current.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn replace(&self, config: AppConfig) {
        *self.current.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(config);
    }

    /// 重新读取配置源；失败时保留旧配置并返回错误
    pub fn reload(&self) -> Result<Arc<AppConfig>, config::ConfigError> {
        let fresh = Arc::new(reload_config(self.path.clone())?);
        *self.current.write().unwrap_or_else(|e| e.into_inner()) = fresh.clone();
        tracing::info!(mode = %fresh.execution.mode, tools = fresh.tools.enabled, "Config reloaded");
        Ok(fresh)
    }

    /// 只改执行模式，其余保持
    pub fn set_mode(&self, mode: ExecutionMode) {
        self.update(|c| c.execution.mode = mode);
    }

    pub fn set_tools_enabled(&self, enabled: bool) {
        self.update(|c| c.tools.enabled = enabled);
    }

    fn update(&self, f: impl FnOnce(&mut AppConfig)) {
        let mut guard = self.current.write().unwrap_or_else(|e| e.into_inner());
        let mut next = (**guard).clone();
        f(&mut next);
        *guard = Arc::new(next);
    }
}

impl Default for ConfigHandle {
    fn default() -> Self {
        Self::new(AppConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let c = AppConfig::default();
        assert_eq!(c.execution.mode, ExecutionMode::SinglePass);
        assert_eq!(c.llm.max_concurrent_requests, 1);
        assert_eq!(c.app.max_context_turns, 20);
        assert!(c.tools.enabled);
    }

    #[test]
    fn test_load_explicit_file() {
        let mut f = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            f,
            "[execution]\nmode = \"dual_pass_all\"\nprecedence = \"read_first\"\nmax_tool_rounds = 1\n\n[llm]\nmodel = \"local\"\n[llm.timeouts]\nstream_idle = 5"
        )
        .unwrap();
        let c = load_config(Some(f.path().to_path_buf())).unwrap();
        assert_eq!(c.execution.mode, ExecutionMode::DualPassAll);
        assert_eq!(c.execution.precedence, Precedence::ReadFirst);
        assert_eq!(c.execution.max_tool_rounds, 1);
        assert_eq!(c.llm.model, "local");
        assert_eq!(c.llm.timeouts.stream_idle, 5);
        assert_eq!(c.llm.timeouts.request, 120);
    }

    #[test]
    fn test_handle_swap_does_not_touch_snapshots() {
        let handle = ConfigHandle::default();
        let before = handle.current().turn_settings(true);
        let held = handle.current();

        handle.set_mode(ExecutionMode::DualPassWriteOnly);
        assert_eq!(before.mode, ExecutionMode::SinglePass);
        assert_eq!(held.execution.mode, ExecutionMode::SinglePass);
        assert_eq!(handle.current().turn_settings(true).mode, ExecutionMode::DualPassWriteOnly);
    }

    #[test]
    fn test_tools_configured_needs_switch_and_registry() {
        let handle = ConfigHandle::default();
        assert!(handle.current().turn_settings(true).tools_configured);
        assert!(!handle.current().turn_settings(false).tools_configured);
        handle.set_tools_enabled(false);
        assert!(!handle.current().turn_settings(true).tools_configured);
    }

    #[test]
    fn test_system_prompt_from_config() {
        let mut c = AppConfig::default();
        c.app.system_prompt = Some("be brief".into());
        assert_eq!(c.system_prompt(), "be brief");

        c.app.system_prompt = Some("  ".into());
        assert_eq!(c.system_prompt(), DEFAULT_SYSTEM_PROMPT);
    }

    #[test]
    fn test_turn_settings_come_from_one_snapshot() {
        let handle = ConfigHandle::default();
        let snapshot = handle.current();
        handle.set_mode(ExecutionMode::DualPassAll);
        handle.set_tools_enabled(false);

        let settings = snapshot.turn_settings(true);
        assert_eq!(settings.mode, ExecutionMode::SinglePass);
        assert!(settings.tools_configured);
        assert_eq!(settings.side_effect_timeout, Duration::from_secs(30));
    }
}
