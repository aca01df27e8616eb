//! Headless 运行时装配
//!
//! 按配置构建 LLM 后端、工具注册表（记忆 + 文件）、轮次存储，组装成 TurnOrchestrator；
//! process_message 对单条输入跑一轮并返回结果，供 REPL 之外的前端调用。

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;

use crate::config::{AppConfig, ConfigHandle};
use crate::core::{TurnOrchestrator, TurnOutcome};
use crate::llm::{LlmClient, MockLlmClient, OpenAiClient};
use crate::memory::{
    ConversationMemory, InMemoryLongTerm, InMemoryMemoryStore, JournalMemoryStore, LongTermMemory, MemoryStore,
};
use crate::pipeline::{EventSink, ToolDispatcher};
use crate::tools::{ListDirTool, ReadFileTool, RecallTool, RememberTool, ToolExecutor, ToolRegistry};

/// 根据配置选择 LLM 后端：provider = mock 或没有 API Key 且未指定 base_url 时用 Mock
pub fn create_llm_from_config(cfg: &AppConfig) -> anyhow::Result<Arc<dyn LlmClient>> {
    let provider = cfg.llm.provider.to_lowercase();
    let api_key = cfg.llm.resolved_api_key();
    if provider == "mock" || (api_key.is_none() && cfg.llm.base_url.is_none()) {
        tracing::warn!("No API key or endpoint configured, using Mock LLM");
        return Ok(Arc::new(MockLlmClient));
    }
    let base_url = cfg.llm.base_url.as_deref();
    tracing::info!(model = %cfg.llm.model, base_url = base_url.unwrap_or("default"), "Using OpenAI-compatible LLM");
    let client = OpenAiClient::new(base_url, &cfg.llm.model, api_key.as_deref());
    Ok(Arc::new(client))
}

/// 工作目录：配置 > 当前目录下的 workspace
fn workspace_root(cfg: &AppConfig) -> PathBuf {
    let workspace = cfg
        .tools
        .workspace_root
        .clone()
        .unwrap_or_else(|| PathBuf::from("workspace"));
    workspace.canonicalize().unwrap_or(workspace)
}

/// 内置工具：remember / recall（长期记忆），read_file / list_dir（沙箱文件）
pub fn create_tool_registry(cfg: &AppConfig) -> anyhow::Result<ToolRegistry> {
    let long_term: Arc<dyn LongTermMemory> = match &cfg.tools.memory_snapshot {
        Some(path) => Arc::new(
            InMemoryLongTerm::with_snapshot(cfg.tools.memory_max_entries, path)
                .with_context(|| format!("Failed to load memory snapshot {}", path.display()))?,
        ),
        None => Arc::new(InMemoryLongTerm::new(cfg.tools.memory_max_entries)),
    };

    let workspace = workspace_root(cfg);
    if let Err(e) = std::fs::create_dir_all(&workspace) {
        tracing::warn!(path = %workspace.display(), error = %e, "Cannot create workspace directory");
    }

    let mut tools = ToolRegistry::new();
    tools.register(RememberTool::new(long_term.clone()));
    tools.register(RecallTool::new(long_term));
    tools.register(ReadFileTool::new(&workspace));
    tools.register(ListDirTool::new(&workspace));
    Ok(tools)
}

/// 轮次存储：配置了 journal_path 时写 JSONL，否则在内存中
pub async fn create_memory_store(cfg: &AppConfig) -> anyhow::Result<Arc<dyn MemoryStore>> {
    match &cfg.memory.journal_path {
        Some(path) => {
            let store = JournalMemoryStore::open(path)
                .await
                .with_context(|| format!("Failed to open turn journal {}", path.display()))?;
            Ok(Arc::new(store))
        }
        None => Ok(Arc::new(InMemoryMemoryStore::new())),
    }
}

/// 按当前配置组装编排器
pub async fn create_orchestrator(config: ConfigHandle) -> anyhow::Result<TurnOrchestrator> {
    let cfg = config.current();
    let llm = create_llm_from_config(&cfg)?;
    let tools = create_tool_registry(&cfg)?;
    let dispatcher = ToolDispatcher::new(tools, ToolExecutor::new(cfg.tools.tool_timeout_secs));
    let store = create_memory_store(&cfg).await?;
    Ok(TurnOrchestrator::new(config, llm, dispatcher, store))
}

/// 处理单条用户消息（无事件输出、不可取消）
pub async fn process_message(
    orchestrator: &TurnOrchestrator,
    conversation: &mut ConversationMemory,
    user_input: &str,
) -> TurnOutcome {
    orchestrator
        .run_turn(conversation, user_input, &EventSink::none(), CancellationToken::new())
        .await
}
