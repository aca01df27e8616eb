//! 端到端轮次场景：脚本化后端 + 真实工具 + 内存存储

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use duopass::config::{AppConfig, ConfigHandle};
use duopass::core::{FailureKind, MemoryStoreError, TurnId, TurnOrchestrator, TurnOutcome, TurnPhase, TurnRecord};
use duopass::llm::{ChatResponse, LlmError, ScriptedLlmClient, StreamChunk};
use duopass::memory::{
    CommitStatus, ConversationMemory, InMemoryLongTerm, InMemoryMemoryStore, LongTermMemory, MemoryStore, Role,
};
use duopass::pipeline::{EventSink, ExecutionMode, OperationCategory, PassSpec, ToolDispatcher, TurnEvent};
use duopass::tools::{RecallTool, RememberTool, Tool, ToolCall, ToolExecutor, ToolRegistry};
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;

fn args(v: Value) -> Map<String, Value> {
    v.as_object().cloned().unwrap_or_default()
}

fn config(mode: ExecutionMode) -> AppConfig {
    let mut cfg = AppConfig::default();
    cfg.app.system_prompt = Some("You are a test assistant.".into());
    cfg.execution.mode = mode;
    cfg
}

/// 调用计数工具
struct Counting {
    hits: Arc<AtomicUsize>,
}

#[async_trait]
impl Tool for Counting {
    fn name(&self) -> &str {
        "counting"
    }

    fn description(&self) -> &str {
        "counts invocations"
    }

    async fn execute(&self, _args: Value) -> Result<Value, String> {
        Ok(json!(self.hits.fetch_add(1, Ordering::SeqCst) + 1))
    }
}

/// 执行即 panic 的工具
struct Exploding;

#[async_trait]
impl Tool for Exploding {
    fn name(&self) -> &str {
        "exploding"
    }

    fn description(&self) -> &str {
        "always throws"
    }

    async fn execute(&self, _args: Value) -> Result<Value, String> {
        panic!("disk on fire")
    }
}

/// 提交总是失败的存储
struct BrokenStore;

#[async_trait]
impl MemoryStore for BrokenStore {
    async fn commit(&self, _turn_id: &TurnId, _record: &TurnRecord) -> Result<CommitStatus, MemoryStoreError> {
        Err(MemoryStoreError::Unavailable("journal offline".into()))
    }

    async fn contains(&self, _turn_id: &TurnId) -> bool {
        false
    }
}

struct Harness {
    orchestrator: TurnOrchestrator,
    client: Arc<ScriptedLlmClient>,
    long_term: Arc<InMemoryLongTerm>,
    hits: Arc<AtomicUsize>,
}

fn harness(cfg: AppConfig, client: ScriptedLlmClient, store: Arc<dyn MemoryStore>) -> Harness {
    let client = Arc::new(client);
    let long_term = Arc::new(InMemoryLongTerm::new(100));
    let hits = Arc::new(AtomicUsize::new(0));

    let mut registry = ToolRegistry::new();
    registry.register(RememberTool::new(long_term.clone()));
    registry.register(RecallTool::new(long_term.clone()));
    registry.register(Counting { hits: hits.clone() });
    registry.register(Exploding);
    let dispatcher = ToolDispatcher::new(registry, ToolExecutor::new(5));

    let orchestrator = TurnOrchestrator::new(ConfigHandle::new(cfg), client.clone(), dispatcher, store);
    Harness {
        orchestrator,
        client,
        long_term,
        hits,
    }
}

async fn run(h: &Harness, conversation: &mut ConversationMemory, message: &str) -> (TurnOutcome, Vec<TurnEvent>) {
    run_with_cancel(h, conversation, message, CancellationToken::new()).await
}

async fn run_with_cancel(
    h: &Harness,
    conversation: &mut ConversationMemory,
    message: &str,
    cancel: CancellationToken,
) -> (TurnOutcome, Vec<TurnEvent>) {
    let (sink, mut rx) = EventSink::channel();
    let outcome = h.orchestrator.run_turn(conversation, message, &sink, cancel).await;
    drop(sink);
    let mut events = Vec::new();
    while let Some(e) = rx.recv().await {
        events.push(e);
    }
    (outcome, events)
}

/// 调用方实际看到的正文
fn shown(events: &[TurnEvent]) -> String {
    events
        .iter()
        .filter_map(|e| match e {
            TurnEvent::TextDelta { text } => Some(text.as_str()),
            _ => None,
        })
        .collect()
}

fn notices(events: &[TurnEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|e| match e {
            TurnEvent::Notice { text } => Some(text.clone()),
            _ => None,
        })
        .collect()
}

const HAPPY_TRAIL: [TurnPhase; 6] = [
    TurnPhase::Classifying,
    TurnPhase::Planning,
    TurnPhase::Executing,
    TurnPhase::Merging,
    TurnPhase::Committing,
    TurnPhase::Done,
];

#[tokio::test]
async fn test_single_pass_with_tools_is_buffered() {
    let client = ScriptedLlmClient::new()
        .push_complete(ChatResponse::default().with_tool_calls(vec![ToolCall::with_id(
            "call_recall",
            "recall",
            args(json!({"query": "name"})),
        )]))
        .push_complete(ChatResponse::text("Your name is Ada."));
    let store = Arc::new(InMemoryMemoryStore::new());
    let h = harness(config(ExecutionMode::SinglePass), client, store.clone());
    h.long_term.add("My name is Ada");

    let mut conversation = ConversationMemory::new(10);
    let (outcome, events) = run(&h, &mut conversation, "What's my name?").await;

    assert_eq!(outcome.record.category, OperationCategory::Read);
    assert_eq!(outcome.record.plan.passes(), &[PassSpec::user_facing(false, true)]);
    assert_eq!(outcome.trail, HAPPY_TRAIL.to_vec());
    assert_eq!(outcome.visible_text(), "Your name is Ada.");

    let requests = h.client.requests();
    assert_eq!(requests.len(), 2);
    assert!(requests.iter().all(|r| !r.stream && r.has_tools()));
    let tool_msg = requests[1].messages.iter().find(|m| m.role == Role::Tool).unwrap();
    assert!(tool_msg.content.contains("My name is Ada"));

    // 缓冲回复一次性整体交付
    let deltas: Vec<_> = events.iter().filter(|e| matches!(e, TurnEvent::TextDelta { .. })).collect();
    assert_eq!(deltas.len(), 1);
    assert_eq!(shown(&events), "Your name is Ada.");

    assert!(outcome.record.has_successful("recall"));
    assert!(outcome.record.committed);
    assert!(store.get(outcome.turn_id()).is_some());
}

#[tokio::test]
async fn test_write_runs_two_passes_and_commits_memory_write() {
    let client = ScriptedLlmClient::new()
        .push_stream(&["Got it", ", I'll remember ", "that you like pizza."])
        .push_complete(
            ChatResponse::text("SIDE EFFECT TEXT").with_tool_calls(vec![ToolCall::new(
                "remember",
                args(json!({"fact": "User likes pizza"})),
            )]),
        );
    let store = Arc::new(InMemoryMemoryStore::new());
    let h = harness(config(ExecutionMode::DualPassWriteOnly), client, store.clone());

    let mut conversation = ConversationMemory::new(10);
    let (outcome, events) = run(&h, &mut conversation, "Remember that I like pizza").await;

    assert_eq!(outcome.record.category, OperationCategory::Write);
    assert_eq!(
        outcome.record.plan.passes(),
        &[PassSpec::user_facing(true, false), PassSpec::side_effect()]
    );
    assert!(outcome.is_done());

    assert_eq!(shown(&events), "Got it, I'll remember that you like pizza.");
    assert_eq!(outcome.visible_text(), "Got it, I'll remember that you like pizza.");
    let serialized = serde_json::to_string(&events).unwrap();
    assert!(!serialized.contains("SIDE EFFECT TEXT"));

    let committed = store.get(outcome.turn_id()).unwrap();
    assert!(committed.has_successful("remember"));
    assert_eq!(h.long_term.search("pizza", 5), vec!["User likes pizza".to_string()]);

    // 可见通道先拿到后端
    let requests = h.client.requests();
    assert!(requests[0].stream && !requests[0].has_tools());
    assert!(!requests[1].stream && requests[1].has_tools());

    // 对话只记录可见回复
    let messages = conversation.messages();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[1].content, "Got it, I'll remember that you like pizza.");
}

#[tokio::test]
async fn test_read_in_write_only_mode_answers_from_tool() {
    let client = ScriptedLlmClient::new()
        .push_complete(
            ChatResponse::text("Let me check.\n<function=recall>\n<parameter=query>\nlike\n</parameter>\n</function>"),
        )
        .push_complete(ChatResponse::text("You like pizza."));
    let h = harness(
        config(ExecutionMode::DualPassWriteOnly),
        client,
        Arc::new(InMemoryMemoryStore::new()),
    );
    h.long_term.add("User likes pizza");
    h.long_term.add("I like pizza");

    let mut conversation = ConversationMemory::new(10);
    let (outcome, events) = run(&h, &mut conversation, "What do I like?").await;

    assert_eq!(outcome.record.category, OperationCategory::Read);
    assert_eq!(outcome.record.plan.passes(), &[PassSpec::user_facing(false, true)]);
    assert_eq!(outcome.visible_text(), "You like pizza.");
    assert_eq!(shown(&events), "You like pizza.");
    assert!(outcome.record.has_successful("recall"));
    assert!(h.client.requests().iter().all(|r| !r.stream));
}

/// 双通道读：用户看到的是流式通道的回答，即使副作用通道查到了正确答案
#[tokio::test]
async fn test_dual_all_read_shows_streamed_answer() {
    let client = ScriptedLlmClient::new()
        .push_stream(&["I don't know your name yet."])
        .push_complete(ChatResponse::default().with_tool_calls(vec![ToolCall::new(
            "recall",
            args(json!({"query": "name"})),
        )]));
    let h = harness(
        config(ExecutionMode::DualPassAll),
        client,
        Arc::new(InMemoryMemoryStore::new()),
    );
    h.long_term.add("My name is Ada");

    let mut conversation = ConversationMemory::new(10);
    let (outcome, events) = run(&h, &mut conversation, "What's my name?").await;

    assert_eq!(outcome.record.category, OperationCategory::Read);
    assert!(outcome.record.plan.is_dual());
    assert!(outcome.is_done());
    assert_eq!(shown(&events), "I don't know your name yet.");
    assert!(!outcome.visible_text().contains("Ada"));

    let recall = outcome.record.tool_results.iter().find(|r| r.tool == "recall").unwrap();
    assert!(recall.success);
    assert!(recall.data.as_ref().unwrap().to_string().contains("Ada"));
    assert!(outcome.record.committed);
}

#[test]
fn test_plain_text_passes_through_normalizer() {
    let text = "Nothing to call here, just <b>prose</b>.";
    let (cleaned, calls) = duopass::normalize(text);
    assert_eq!(cleaned, text);
    assert!(calls.is_empty());
}

#[tokio::test]
async fn test_throwing_tool_does_not_fail_turn() {
    let client = ScriptedLlmClient::new()
        .push_stream(&["Noted!"])
        .push_complete(ChatResponse::default().with_tool_calls(vec![
            ToolCall::new("exploding", Map::new()),
            ToolCall::new("remember", args(json!({"fact": "User likes tea"}))),
        ]));
    let h = harness(
        config(ExecutionMode::DualPassWriteOnly),
        client,
        Arc::new(InMemoryMemoryStore::new()),
    );

    let mut conversation = ConversationMemory::new(10);
    let (outcome, events) = run(&h, &mut conversation, "Please remember I like tea").await;

    assert!(outcome.is_done());
    assert_eq!(outcome.visible_text(), "Noted!");
    assert_eq!(shown(&events), "Noted!");
    let results = &outcome.record.tool_results;
    assert_eq!(results.len(), 2);
    assert!(!results[0].success);
    assert!(results[0].error.as_deref().unwrap().contains("disk on fire"));
    assert!(results[1].success);
    assert!(outcome.record.committed);
}

#[tokio::test]
async fn test_redelivered_call_id_dispatched_once() {
    let call = ToolCall::with_id("call_dup", "counting", Map::new());
    let client = ScriptedLlmClient::new()
        .push_stream(&["ok"])
        .push_complete(ChatResponse::default().with_tool_calls(vec![call.clone(), call]));
    let h = harness(
        config(ExecutionMode::DualPassWriteOnly),
        client,
        Arc::new(InMemoryMemoryStore::new()),
    );

    let mut conversation = ConversationMemory::new(10);
    let (outcome, _) = run(&h, &mut conversation, "Remember this number").await;

    assert!(outcome.is_done());
    assert_eq!(h.hits.load(Ordering::SeqCst), 1);
    assert_eq!(outcome.record.tool_results.len(), 2);
    assert_eq!(outcome.record.tool_results[0], outcome.record.tool_results[1]);
}

#[tokio::test]
async fn test_stream_disconnect_fails_turn_but_keeps_write() {
    let client = ScriptedLlmClient::new()
        .push_stream_chunks(vec![
            Ok(StreamChunk::TextDelta("Sure, I'll ".into())),
            Err(LlmError::Network("connection reset".into())),
        ])
        .push_complete(ChatResponse::default().with_tool_calls(vec![ToolCall::new(
            "remember",
            args(json!({"fact": "User's name is Ada"})),
        )]));
    let store = Arc::new(InMemoryMemoryStore::new());
    let h = harness(config(ExecutionMode::DualPassWriteOnly), client, store.clone());

    let mut conversation = ConversationMemory::new(10);
    let (outcome, events) = run(&h, &mut conversation, "My name is Ada").await;

    assert_eq!(outcome.phase, TurnPhase::Failed);
    assert_eq!(
        outcome.trail,
        vec![TurnPhase::Classifying, TurnPhase::Planning, TurnPhase::Executing, TurnPhase::Failed]
    );
    // 已流出的部分保留，随后是行内提示
    assert_eq!(shown(&events), "Sure, I'll ");
    assert_eq!(outcome.visible_text(), "Sure, I'll ");
    assert!(notices(&events).iter().any(|n| n.contains("interrupted")));

    let visible = &outcome.record.pass_outcomes[0];
    assert_eq!(visible.failure.as_ref().unwrap().kind, FailureKind::Disconnected);
    assert!(!outcome.record.committed);
    assert!(store.is_empty());
    assert!(conversation.is_empty());
    assert_eq!(h.long_term.len(), 1);
}

#[tokio::test]
async fn test_side_effect_failure_skips_commit() {
    let client = ScriptedLlmClient::new()
        .push_stream(&["Will do."])
        .push_complete_error(LlmError::Timeout);
    let store = Arc::new(InMemoryMemoryStore::new());
    let h = harness(config(ExecutionMode::DualPassWriteOnly), client, store.clone());

    let mut conversation = ConversationMemory::new(10);
    let (outcome, events) = run(&h, &mut conversation, "Remember that my cat is Tom").await;

    assert!(outcome.is_done());
    assert_eq!(shown(&events), "Will do.");
    assert!(!outcome.record.committed);
    assert!(store.is_empty());
    assert!(outcome.record.pass_outcomes[1].is_failed());
    assert_eq!(conversation.len(), 2);
}

#[tokio::test]
async fn test_commit_failure_is_only_a_warning() {
    let client = ScriptedLlmClient::new()
        .push_stream(&["Noted."])
        .push_complete(ChatResponse::default());
    let h = harness(config(ExecutionMode::DualPassWriteOnly), client, Arc::new(BrokenStore));

    let mut conversation = ConversationMemory::new(10);
    let (outcome, events) = run(&h, &mut conversation, "Remember that I like jazz").await;

    assert!(outcome.is_done());
    assert_eq!(outcome.visible_text(), "Noted.");
    assert!(!outcome.record.committed);
    assert_eq!(outcome.warnings.len(), 1);
    assert!(events.iter().any(|e| matches!(e, TurnEvent::CommitWarning { message } if message.contains("journal offline"))));
    assert!(matches!(
        events.last(),
        Some(TurnEvent::TurnFinished {
            phase: TurnPhase::Done,
            committed: false,
            ..
        })
    ));
}

#[tokio::test]
async fn test_cancel_stops_visible_but_side_effect_completes() {
    let client = ScriptedLlmClient::new()
        .push_stream(&["one ", "two ", "three ", "four"])
        .with_chunk_delay(Duration::from_millis(100))
        .push_complete(ChatResponse::default().with_tool_calls(vec![ToolCall::new(
            "remember",
            args(json!({"fact": "User likes chess"})),
        )]));
    let h = harness(
        config(ExecutionMode::DualPassWriteOnly),
        client,
        Arc::new(InMemoryMemoryStore::new()),
    );

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(150)).await;
        trigger.cancel();
    });

    let mut conversation = ConversationMemory::new(10);
    let (outcome, events) = run_with_cancel(&h, &mut conversation, "Remember that I like chess", cancel).await;

    assert_eq!(outcome.phase, TurnPhase::Failed);
    assert_eq!(shown(&events), "one ");
    assert_eq!(
        outcome.record.pass_outcomes[0].failure.as_ref().unwrap().kind,
        FailureKind::Cancelled
    );
    assert!(outcome.record.has_successful("remember"));
    assert_eq!(h.long_term.search("chess", 5), vec!["User likes chess".to_string()]);
}

#[tokio::test]
async fn test_slow_side_effect_is_abandoned() {
    let client = ScriptedLlmClient::new()
        .push_stream(&["Sure."])
        .push_complete(ChatResponse::default().with_tool_calls(vec![ToolCall::new(
            "counting",
            Map::new(),
        )]))
        .with_complete_delay(Duration::from_secs(3));
    let mut cfg = config(ExecutionMode::DualPassWriteOnly);
    cfg.execution.side_effect_timeout_secs = 1;
    let store = Arc::new(InMemoryMemoryStore::new());
    let h = harness(cfg, client, store.clone());

    let mut conversation = ConversationMemory::new(10);
    let (outcome, events) = run(&h, &mut conversation, "Remember that I run daily").await;

    assert!(outcome.is_done());
    assert_eq!(shown(&events), "Sure.");
    assert_eq!(
        outcome.record.pass_outcomes[1].failure.as_ref().unwrap().kind,
        FailureKind::Abandoned
    );
    assert_eq!(h.hits.load(Ordering::SeqCst), 0);
    assert!(store.is_empty());
}

#[tokio::test]
async fn test_mode_change_applies_to_next_turn() {
    let client = ScriptedLlmClient::new()
        .push_complete(ChatResponse::text("Hello!"))
        .push_stream(&["Hi again!"])
        .push_complete(ChatResponse::default());
    let h = harness(
        config(ExecutionMode::SinglePass),
        client,
        Arc::new(InMemoryMemoryStore::new()),
    );

    let mut conversation = ConversationMemory::new(10);
    let (first, _) = run(&h, &mut conversation, "Remember that I say hello").await;
    assert!(!first.record.plan.is_dual());

    h.orchestrator.config().set_mode(ExecutionMode::DualPassWriteOnly);
    let (second, events) = run(&h, &mut conversation, "Remember that I say hi").await;
    assert!(second.record.plan.is_dual());
    assert_eq!(shown(&events), "Hi again!");
    assert_eq!(conversation.len(), 4);
}

#[tokio::test]
async fn test_general_chat_streams_without_tools() {
    let client = ScriptedLlmClient::new().push_stream(&["The sky ", "is blue."]);
    let h = harness(
        config(ExecutionMode::DualPassAll),
        client,
        Arc::new(InMemoryMemoryStore::new()),
    );

    let mut conversation = ConversationMemory::new(10);
    let (outcome, events) = run(&h, &mut conversation, "Why is the sky blue?").await;

    assert_eq!(outcome.record.category, OperationCategory::General);
    assert_eq!(outcome.record.plan.passes(), &[PassSpec::user_facing(true, false)]);
    assert_eq!(shown(&events), "The sky is blue.");
    assert!(outcome.record.tool_results.is_empty());
    assert_eq!(h.client.requests().len(), 1);
}
